use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the classifier library.
#[derive(Error, Debug)]
pub enum ClassifierError {
    /// A class has too few members to appear in every partition.
    #[error("class {class} has {count} member(s) but at least {required} are needed to appear in every split")]
    InsufficientClassCount {
        class: usize,
        count: usize,
        required: usize,
    },

    #[error("index {index} is out of range for a view of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("{name} must lie strictly between 0 and 1, got {value}")]
    InvalidFraction { name: &'static str, value: f64 },

    #[error("no images found under '{0}'")]
    EmptyDataset(PathBuf),

    #[error("failed to load image at '{path}': {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("transform failed: {0}")]
    Transform(String),

    #[error("unknown model name '{0}'")]
    UnknownModel(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("recorder error: {0}")]
    Recorder(String),

    #[error("tensor data error: {0}")]
    TensorData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClassifierError>;
