use tracing_subscriber::EnvFilter;

/// Installs the process-wide `fmt` subscriber used by the binaries.
///
/// `RUST_LOG` wins over `level` when it is set. Library components never call
/// this; they log into whatever span they were handed.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("folder_classifier={level},warn")));

    // A subscriber may already be installed (tests, embedding applications).
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
