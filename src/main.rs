use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::{wgpu::WgpuDevice, Autodiff, Wgpu};
use clap::{command, value_parser, Arg, ArgAction, ArgMatches, Command};
use folder_classifier::{
    inference::{format_predictions, Classifier},
    logging,
    model::ModelName,
    training::{evaluate_held_out, sgd_with_momentum, train, TrainingConfig},
};
use tracing::info;

fn cli() -> Command {
    command!()
        .subcommand_required(true)
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .global(true)
                .default_value("info")
                .help("Log level for this crate when RUST_LOG is unset"),
        )
        .subcommand(
            Command::new("train")
                .about("Split data/train, fine-tune the classifier head and test it")
                .args([
                    Arg::new("data-dir")
                        .long("data-dir")
                        .value_parser(value_parser!(PathBuf))
                        .default_value("data")
                        .help("Directory holding train/<class>/ image folders"),
                    Arg::new("model-dir")
                        .long("model-dir")
                        .value_parser(value_parser!(PathBuf))
                        .default_value("model")
                        .help("Artifact directory, must be empty unless --overwrite is given"),
                    Arg::new("overwrite")
                        .long("overwrite")
                        .action(ArgAction::SetTrue)
                        .help("Replace the artifacts of a previous run in --model-dir"),
                    Arg::new("epochs")
                        .long("epochs")
                        .value_parser(value_parser!(usize))
                        .default_value("1"),
                    Arg::new("batch-size")
                        .long("batch-size")
                        .value_parser(value_parser!(usize))
                        .default_value("4"),
                    Arg::new("lr")
                        .long("lr")
                        .value_parser(value_parser!(f64))
                        .default_value("0.001"),
                    Arg::new("momentum")
                        .long("momentum")
                        .value_parser(value_parser!(f64))
                        .default_value("0.9"),
                    Arg::new("workers")
                        .long("workers")
                        .value_parser(value_parser!(usize))
                        .default_value("2"),
                    Arg::new("model-name")
                        .long("model-name")
                        .value_parser(value_parser!(String))
                        .default_value("efficientnet-b0"),
                    Arg::new("seed")
                        .long("seed")
                        .value_parser(value_parser!(u64))
                        .help("Seed for the split, augmentations and shuffling"),
                    Arg::new("test-fraction")
                        .long("test-fraction")
                        .value_parser(value_parser!(f64))
                        .default_value("0.3"),
                    Arg::new("valid-fraction")
                        .long("valid-fraction")
                        .value_parser(value_parser!(f64))
                        .default_value("0.5"),
                    Arg::new("image-size")
                        .long("image-size")
                        .value_parser(value_parser!(u32))
                        .help("Input resolution, defaults to the model's native size"),
                    Arg::new("backbone-weights")
                        .long("backbone-weights")
                        .help("Backbone weights (.pth state dict or record), path or URL"),
                    Arg::new("no-pretrained")
                        .long("no-pretrained")
                        .action(ArgAction::SetTrue)
                        .help("Train from scratch instead of the published ImageNet weights"),
                    Arg::new("no-freeze")
                        .long("no-freeze")
                        .action(ArgAction::SetTrue)
                        .help("Fine-tune the backbone together with the head"),
                ]),
        )
        .subcommand(
            Command::new("test")
                .about("Evaluate a trained model on a folder of labeled images")
                .args([
                    Arg::new("model-dir")
                        .long("model-dir")
                        .value_parser(value_parser!(PathBuf))
                        .default_value("model"),
                    Arg::new("data-dir")
                        .long("data-dir")
                        .value_parser(value_parser!(PathBuf))
                        .help("Folder to evaluate [default: data/test, or data with --held-out]"),
                    Arg::new("batch-size")
                        .long("batch-size")
                        .value_parser(value_parser!(usize))
                        .default_value("4"),
                    Arg::new("workers")
                        .long("workers")
                        .value_parser(value_parser!(usize))
                        .default_value("2"),
                    Arg::new("top-k")
                        .long("top-k")
                        .value_parser(value_parser!(usize))
                        .default_value("5"),
                    Arg::new("held-out")
                        .long("held-out")
                        .action(ArgAction::SetTrue)
                        .help("Re-evaluate the recorded test partition of <data-dir>/train"),
                ]),
        )
        .subcommand(
            Command::new("predict")
                .about("Print the top classes for each image")
                .args([
                    Arg::new("model-dir")
                        .long("model-dir")
                        .value_parser(value_parser!(PathBuf))
                        .default_value("model"),
                    Arg::new("top-k")
                        .long("top-k")
                        .value_parser(value_parser!(usize))
                        .default_value("5"),
                    Arg::new("images")
                        .required(true)
                        .num_args(1..)
                        .value_parser(value_parser!(PathBuf)),
                ]),
        )
}

fn path(matches: &ArgMatches, id: &str) -> PathBuf {
    matches.get_one::<PathBuf>(id).cloned().unwrap_or_default()
}

/// Default of the `test` data directory, which depends on `--held-out`.
fn test_data_dir(matches: &ArgMatches) -> PathBuf {
    match matches.get_one::<PathBuf>("data-dir") {
        Some(dir) => dir.clone(),
        None if matches.get_flag("held-out") => PathBuf::from("data"),
        None => PathBuf::from("data/test"),
    }
}

fn number<T: Clone + Send + Sync + 'static>(matches: &ArgMatches, id: &str) -> Option<T> {
    matches.get_one::<T>(id).cloned()
}

fn run_train(matches: &ArgMatches) -> Result<()> {
    let model_name: ModelName = matches
        .get_one::<String>("model-name")
        .map(String::as_str)
        .unwrap_or("efficientnet-b0")
        .parse()?;

    let mut config = TrainingConfig::new(sgd_with_momentum(
        number(matches, "momentum").unwrap_or(0.9),
    ))
    .with_model_name(model_name)
    .with_seed(number(matches, "seed"))
    .with_image_size(number(matches, "image-size"))
    .with_backbone_weights(matches.get_one::<String>("backbone-weights").cloned())
    .with_pretrained(!matches.get_flag("no-pretrained"))
    .with_freeze_backbone(!matches.get_flag("no-freeze"))
    .with_overwrite(matches.get_flag("overwrite"));
    if let Some(epochs) = number(matches, "epochs") {
        config.num_epochs = epochs;
    }
    if let Some(batch_size) = number(matches, "batch-size") {
        config.batch_size = batch_size;
    }
    if let Some(workers) = number(matches, "workers") {
        config.num_workers = workers;
    }
    if let Some(lr) = number(matches, "lr") {
        config.learning_rate = lr;
    }
    if let Some(fraction) = number(matches, "test-fraction") {
        config.test_fraction = fraction;
    }
    if let Some(fraction) = number(matches, "valid-fraction") {
        config.valid_fraction = fraction;
    }

    let data_dir = path(matches, "data-dir");
    let model_dir = path(matches, "model-dir");
    let report = train::<Autodiff<Wgpu>>(&config, &data_dir, &model_dir, WgpuDevice::default())
        .with_context(|| format!("training on {} failed", data_dir.display()))?;

    info!(
        train = report.partitions.train,
        valid = report.partitions.valid,
        test = report.partitions.test,
        "partitions"
    );
    println!(
        "Test loss {:.4}, accuracy {:.2}% over {} images",
        report.test.loss,
        report.test.accuracy * 100.0,
        report.test.samples
    );
    Ok(())
}

fn run_test(matches: &ArgMatches) -> Result<()> {
    let model_dir = path(matches, "model-dir");
    let data_dir = test_data_dir(matches);
    let batch_size = number(matches, "batch-size").unwrap_or(4);
    let device = WgpuDevice::default();

    if matches.get_flag("held-out") {
        let workers = number(matches, "workers").unwrap_or(2);
        let metrics =
            evaluate_held_out::<Wgpu>(&model_dir, &data_dir, batch_size, workers, device)
                .context("held-out evaluation failed")?;
        println!(
            "Held-out loss {:.4}, accuracy {:.2}% over {} images",
            metrics.loss,
            metrics.accuracy * 100.0,
            metrics.samples
        );
        return Ok(());
    }

    let classifier = Classifier::<Wgpu>::load(&model_dir, device)
        .with_context(|| format!("cannot load model from {}", model_dir.display()))?;
    let report = classifier
        .predict_folder(&data_dir, batch_size, number(matches, "top-k").unwrap_or(5))
        .with_context(|| format!("cannot evaluate {}", data_dir.display()))?;

    for image in &report.images {
        println!("{}", image.path.display());
        println!("{}", format_predictions(&image.top));
        println!();
    }
    println!("Top-1 accuracy: {:.2}%", report.accuracy * 100.0);
    Ok(())
}

fn run_predict(matches: &ArgMatches) -> Result<()> {
    let model_dir = path(matches, "model-dir");
    let top_k = number(matches, "top-k").unwrap_or(5);
    let classifier = Classifier::<Wgpu>::load(&model_dir, WgpuDevice::default())
        .with_context(|| format!("cannot load model from {}", model_dir.display()))?;

    for image in matches.get_many::<PathBuf>("images").into_iter().flatten() {
        let predictions = classifier
            .predict_image(image, top_k)
            .with_context(|| format!("cannot classify {}", image.display()))?;
        println!("{}", image.display());
        println!("{}", format_predictions(&predictions));
    }
    Ok(())
}

fn main() -> Result<()> {
    let matches = cli().get_matches();
    let level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");
    logging::init(level);

    match matches.subcommand() {
        Some(("train", sub)) => run_train(sub),
        Some(("test", sub)) => run_test(sub),
        Some(("predict", sub)) => run_predict(sub),
        _ => unreachable!("a subcommand is required"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        cli().debug_assert();
    }

    #[test]
    fn predict_requires_images() {
        assert!(cli().try_get_matches_from(["folder-classifier", "predict"]).is_err());
        let matches = cli()
            .try_get_matches_from(["folder-classifier", "predict", "--top-k", "3", "a.jpg", "b.png"])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        assert_eq!(number::<usize>(sub, "top-k"), Some(3));
        assert_eq!(sub.get_many::<PathBuf>("images").unwrap().count(), 2);
    }

    #[test]
    fn train_defaults_match_config() {
        let matches = cli()
            .try_get_matches_from(["folder-classifier", "--log-level", "debug", "train"])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "train");
        assert_eq!(number::<usize>(sub, "epochs"), Some(1));
        assert_eq!(number::<f64>(sub, "test-fraction"), Some(0.3));
        assert_eq!(number::<u64>(sub, "seed"), None);
        assert!(!sub.get_flag("overwrite"));
        assert!(!sub.get_flag("no-pretrained"));
    }

    #[test]
    fn held_out_test_reads_the_training_root_by_default() {
        let test_args = |args: &[&str]| {
            let matches = cli()
                .try_get_matches_from(["folder-classifier", "test"].iter().chain(args))
                .unwrap();
            let (_, sub) = matches.subcommand().unwrap();
            test_data_dir(sub)
        };

        assert_eq!(test_args(&[]), PathBuf::from("data/test"));
        assert_eq!(test_args(&["--held-out"]), PathBuf::from("data"));
        assert_eq!(
            test_args(&["--held-out", "--data-dir", "elsewhere"]),
            PathBuf::from("elsewhere")
        );
    }
}
