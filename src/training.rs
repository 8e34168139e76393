use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{momentum::MomentumConfig, SgdConfig},
    prelude::*,
    record::CompactRecorder,
    tensor::{backend::AutodiffBackend, ElementConversion},
    train::{
        metric::{AccuracyMetric, LossMetric},
        ClassificationOutput, LearnerBuilder, TrainOutput, TrainStep, ValidStep,
    },
};
use serde::Serialize;
use tracing::{info, info_span, warn};

use crate::{
    data::{ClassificationBatch, ClassificationBatcher},
    dataset::{ImageFolder, LabeledDataset},
    error::{self, ClassifierError},
    inference::Classifier,
    model::{download_weights, EfficientNet, EfficientNetConfig, ModelName},
    split::{Partitions, StratifiedSplitter},
    transform::{eval_pipeline, train_pipeline},
    view::TransformedView,
};

pub const CONFIG_FILE: &str = "config.json";
pub const CLASSES_FILE: &str = "classes.json";
pub const SPLITS_FILE: &str = "splits.json";
pub const TEST_METRICS_FILE: &str = "test_metrics.json";
/// Record stem; the recorder appends `.mpk.gz`.
pub const MODEL_FILE: &str = "model";
/// Downloaded pretrained weights live here and survive `overwrite`.
pub const PRETRAINED_DIR: &str = "pretrained";

/// Everything `train` and its learner write into an artifact directory.
const ARTIFACTS: [&str; 9] = [
    CONFIG_FILE,
    CLASSES_FILE,
    SPLITS_FILE,
    TEST_METRICS_FILE,
    "model.mpk.gz",
    "checkpoint",
    "train",
    "valid",
    "experiment.log",
];

impl<B: Backend> EfficientNet<B> {
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);

        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

impl<B: AutodiffBackend> TrainStep<ClassificationBatch<B>, ClassificationOutput<B>>
    for EfficientNet<B>
{
    fn step(&self, batch: ClassificationBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch.images, batch.targets);

        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<ClassificationBatch<B>, ClassificationOutput<B>> for EfficientNet<B> {
    fn step(&self, batch: ClassificationBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}

#[derive(Config)]
pub struct TrainingConfig {
    pub optimizer: SgdConfig,
    #[config(default = 1)]
    pub num_epochs: usize,
    #[config(default = 4)]
    pub batch_size: usize,
    #[config(default = 2)]
    pub num_workers: usize,
    #[config(default = 0.001)]
    pub learning_rate: f64,
    /// Seeds the split, the augmentations and the loader shuffle. `None`
    /// draws a fresh seed per run.
    #[config(default = "None")]
    pub seed: Option<u64>,
    #[config(default = 0.3)]
    pub test_fraction: f64,
    #[config(default = 0.5)]
    pub valid_fraction: f64,
    #[config(default = "ModelName::B0")]
    pub model_name: ModelName,
    /// Input resolution; defaults to the variant's native size.
    #[config(default = "None")]
    pub image_size: Option<u32>,
    /// Local path or http(s) URL of backbone weights, either a `.pth`
    /// state dict or a record written by `save_backbone`.
    #[config(default = "None")]
    pub backbone_weights: Option<String>,
    /// Use the variant's published ImageNet weights when `backbone_weights`
    /// is unset.
    #[config(default = true)]
    pub pretrained: bool,
    /// Train only the classifier head when backbone weights were loaded.
    #[config(default = true)]
    pub freeze_backbone: bool,
    /// Replace the artifacts of an earlier run instead of refusing a
    /// non-empty artifact directory.
    #[config(default = false)]
    pub overwrite: bool,
}

impl TrainingConfig {
    pub fn resolved_image_size(&self) -> u32 {
        self.image_size
            .unwrap_or_else(|| self.model_name.image_size())
    }

    /// Where backbone weights come from, if anywhere.
    pub fn backbone_source(&self) -> Option<String> {
        self.backbone_weights
            .clone()
            .or_else(|| self.pretrained.then(|| self.model_name.pretrained_url()))
    }
}

pub fn sgd_with_momentum(momentum: f64) -> SgdConfig {
    SgdConfig::new().with_momentum(Some(MomentumConfig {
        momentum,
        dampening: 0.,
        nesterov: false,
    }))
}

/// Loss and top-1 accuracy over one pass of a loader.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub samples: usize,
}

/// Running sums for [`EpochMetrics`], weighted by batch size.
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    loss_sum: f64,
    correct: usize,
    total: usize,
}

impl MetricAccumulator {
    /// Adds a batch whose mean loss is `mean_loss`.
    pub fn update(&mut self, mean_loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += mean_loss * batch_size as f64;
        self.correct += correct;
        self.total += batch_size;
    }

    pub fn finish(&self) -> EpochMetrics {
        if self.total == 0 {
            return EpochMetrics {
                loss: 0.0,
                accuracy: 0.0,
                samples: 0,
            };
        }
        EpochMetrics {
            loss: self.loss_sum / self.total as f64,
            accuracy: self.correct as f64 / self.total as f64,
            samples: self.total,
        }
    }
}

/// Runs `model` over every batch of `loader` without updating it.
pub fn evaluate<B: Backend>(
    model: &EfficientNet<B>,
    loader: Arc<dyn DataLoader<ClassificationBatch<B>>>,
) -> EpochMetrics {
    let mut metrics = MetricAccumulator::default();

    for batch in loader.iter() {
        let output = model.forward_classification(batch.images, batch.targets);
        let batch_size = output.targets.dims()[0];
        let loss = output.loss.into_scalar().elem::<f64>();
        let correct = output
            .output
            .argmax(1)
            .squeeze::<1>(1)
            .equal(output.targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();

        metrics.update(loss, correct as usize, batch_size);
    }

    metrics.finish()
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionSizes {
    pub train: usize,
    pub valid: usize,
    pub test: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub classes: Vec<String>,
    pub partitions: PartitionSizes,
    pub test: EpochMetrics,
    pub elapsed: Duration,
}

/// Prepares `artifact_dir` for a run. A directory holding anything other than
/// cached pretrained weights is refused unless `overwrite` is set, and then
/// only the files a previous run wrote are removed.
fn create_artifact_dir(artifact_dir: &Path, overwrite: bool) -> error::Result<()> {
    if artifact_dir.exists() {
        let occupied = fs::read_dir(artifact_dir)?
            .filter_map(|entry| entry.ok())
            .any(|entry| entry.file_name() != PRETRAINED_DIR);
        if occupied && !overwrite {
            return Err(ClassifierError::Config(format!(
                "artifact directory '{}' is not empty, pass --overwrite to replace a previous run",
                artifact_dir.display()
            )));
        }
        for name in ARTIFACTS {
            let path = artifact_dir.join(name);
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else if path.exists() {
                fs::remove_file(&path)?;
            }
        }
    }
    fs::create_dir_all(artifact_dir)?;
    Ok(())
}

fn resolve_backbone(source: &str, artifact_dir: &Path) -> error::Result<PathBuf> {
    if source.starts_with("http://") || source.starts_with("https://") {
        download_weights(source, &artifact_dir.join(PRETRAINED_DIR))
    } else {
        Ok(PathBuf::from(source))
    }
}

/// Splits the `train` folder of `data_dir`, then records the partitions and
/// the class names in `artifact_dir`.
fn split_folder(
    config: &TrainingConfig,
    data_dir: &Path,
    artifact_dir: &Path,
    seed: u64,
) -> error::Result<(Arc<ImageFolder>, Partitions)> {
    let folder = Arc::new(ImageFolder::new(data_dir.join("train"))?);
    let classes = folder.classes();
    info!(
        images = folder.len(),
        classes = classes.len(),
        "loaded training folder"
    );

    let partitions = StratifiedSplitter::new(config.test_fraction, config.valid_fraction)?
        .with_seed(Some(seed))
        .with_span(info_span!("split"))
        .split(folder.labels())?;
    log_partitions(&partitions, folder.labels(), classes);
    partitions.save(artifact_dir.join(SPLITS_FILE))?;
    serde_json::to_writer_pretty(File::create(artifact_dir.join(CLASSES_FILE))?, classes)?;

    Ok((folder, partitions))
}

/// Splits `data_dir/train`, fine-tunes the classifier head and evaluates the
/// held-out test partition. Artifacts are written to `artifact_dir`.
pub fn train<B: AutodiffBackend>(
    config: &TrainingConfig,
    data_dir: &Path,
    artifact_dir: &Path,
    device: B::Device,
) -> error::Result<TrainingReport> {
    let span = info_span!("train", model = %config.model_name);
    let _entered = span.enter();

    create_artifact_dir(artifact_dir, config.overwrite)?;
    config.save(artifact_dir.join(CONFIG_FILE))?;

    let seed = config.seed.unwrap_or_else(rand::random);
    B::seed(seed);

    let (folder, partitions) = split_folder(config, data_dir, artifact_dir, seed)?;
    let classes = folder.classes().to_vec();

    let image_size = config.resolved_image_size();
    let train_view = TransformedView::new(folder.clone(), partitions.train.clone())
        .with_transform(train_pipeline(image_size, Some(seed))?);
    let valid_view = TransformedView::new(folder.clone(), partitions.valid.clone())
        .with_transform(eval_pipeline(image_size));
    let test_view = TransformedView::new(folder.clone(), partitions.test.clone())
        .with_transform(eval_pipeline(image_size));

    // Dataloaders
    let batcher_train = ClassificationBatcher::<B>::new(device.clone());
    let batcher_valid = ClassificationBatcher::<B::InnerBackend>::new(device.clone());

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(seed)
        .num_workers(config.num_workers)
        .build(train_view);

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid.clone())
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(valid_view);

    let dataloader_test = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(test_view);

    let model = EfficientNetConfig::new(config.model_name, classes.len()).init::<B>(&device);
    let model = match config.backbone_source() {
        Some(source) => {
            let model = model.load_backbone(resolve_backbone(&source, artifact_dir)?, &device)?;
            if config.freeze_backbone {
                info!("backbone frozen, training the classifier head only");
                model.freeze_backbone()
            } else {
                model
            }
        }
        None => {
            warn!("no backbone weights, training the whole network from scratch");
            model
        }
    };

    // Learner config
    let artifact_path = artifact_dir.to_string_lossy().into_owned();
    let learner = LearnerBuilder::new(artifact_path.as_str())
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .with_file_checkpointer(CompactRecorder::new())
        .devices(vec![device.clone()])
        .num_epochs(config.num_epochs)
        .summary()
        .build(model, config.optimizer.init(), config.learning_rate);

    info!(
        epochs = config.num_epochs,
        batch_size = config.batch_size,
        "running fit"
    );
    let now = Instant::now();
    let model_trained = learner.fit(dataloader_train, dataloader_valid);
    let elapsed = now.elapsed();
    let secs = elapsed.as_secs();
    info!("training completed in {}m{}s", secs / 60, secs % 60);

    model_trained
        .clone()
        .save_file(artifact_dir.join(MODEL_FILE), &CompactRecorder::new())
        .map_err(|err| ClassifierError::Recorder(format!("{err:?}")))?;

    let now = Instant::now();
    let test = evaluate(&model_trained.valid(), dataloader_test);
    info!(
        loss = test.loss,
        accuracy = test.accuracy,
        samples = test.samples,
        elapsed_ms = now.elapsed().as_millis() as u64,
        "test partition evaluated"
    );
    serde_json::to_writer_pretty(File::create(artifact_dir.join(TEST_METRICS_FILE))?, &test)?;

    Ok(TrainingReport {
        classes,
        partitions: PartitionSizes {
            train: partitions.train.len(),
            valid: partitions.valid.len(),
            test: partitions.test.len(),
        },
        test,
        elapsed,
    })
}

/// Re-evaluates a trained model on the test partition recorded in its
/// artifact directory. `data_dir` must hold the same `train` folder the
/// model was trained on.
pub fn evaluate_held_out<B: Backend>(
    artifact_dir: &Path,
    data_dir: &Path,
    batch_size: usize,
    num_workers: usize,
    device: B::Device,
) -> error::Result<EpochMetrics> {
    let classifier = Classifier::<B>::load(artifact_dir, device.clone())?;
    let partitions = Partitions::load(artifact_dir.join(SPLITS_FILE))?;
    let folder = Arc::new(ImageFolder::new(data_dir.join("train"))?);

    if folder.classes() != classifier.classes() {
        return Err(ClassifierError::Config(format!(
            "class folders under '{}' differ from the trained classes",
            data_dir.display()
        )));
    }
    if let Some(&index) = partitions.test.iter().find(|&&index| index >= folder.len()) {
        return Err(ClassifierError::IndexOutOfRange {
            index,
            len: folder.len(),
        });
    }

    let view = TransformedView::new(folder, partitions.test)
        .with_transform(eval_pipeline(classifier.image_size()));
    let loader = DataLoaderBuilder::new(ClassificationBatcher::<B>::new(device))
        .batch_size(batch_size)
        .num_workers(num_workers)
        .build(view);

    Ok(evaluate(classifier.model(), loader))
}

fn log_partitions(partitions: &Partitions, labels: &[usize], classes: &[String]) {
    info!(
        train = partitions.train.len(),
        valid = partitions.valid.len(),
        test = partitions.test.len(),
        "partition sizes"
    );
    let distribution = partitions.class_distribution(labels, classes.len());
    for (label, class) in classes.iter().enumerate() {
        info!(
            class = %class,
            train = distribution.train[label],
            valid = distribution.valid[label],
            test = distribution.test[label],
            "class distribution"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    use crate::dataset::tests::write_folder;
    use crate::inference::tests::write_artifacts;

    #[test]
    fn accumulator_weights_loss_by_batch_size() {
        let mut metrics = MetricAccumulator::default();
        metrics.update(1.0, 4, 4);
        metrics.update(4.0, 0, 2);

        let epoch = metrics.finish();
        assert_eq!(epoch.samples, 6);
        assert!((epoch.loss - 2.0).abs() < 1e-9);
        assert!((epoch.accuracy - 4.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn empty_accumulator_reports_zero() {
        let epoch = MetricAccumulator::default().finish();
        assert_eq!(
            epoch,
            EpochMetrics {
                loss: 0.0,
                accuracy: 0.0,
                samples: 0
            }
        );
    }

    #[test]
    fn config_defaults() {
        let config = TrainingConfig::new(sgd_with_momentum(0.9));
        assert_eq!(config.num_epochs, 1);
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.learning_rate, 0.001);
        assert_eq!(config.test_fraction, 0.3);
        assert_eq!(config.valid_fraction, 0.5);
        assert_eq!(config.model_name, ModelName::B0);
        assert_eq!(config.resolved_image_size(), 224);
        assert!(config.seed.is_none());
        assert!(config.backbone_weights.is_none());
        assert!(config.pretrained);
        assert!(config.freeze_backbone);
        assert!(!config.overwrite);
    }

    #[test]
    fn backbone_source_prefers_explicit_weights_over_published_ones() {
        let config = TrainingConfig::new(sgd_with_momentum(0.9)).with_model_name(ModelName::B2);
        assert_eq!(config.backbone_source(), Some(ModelName::B2.pretrained_url()));

        let explicit = config.clone().with_backbone_weights(Some("weights/b2.pth".into()));
        assert_eq!(explicit.backbone_source().as_deref(), Some("weights/b2.pth"));

        let scratch = config.with_pretrained(false);
        assert_eq!(scratch.backbone_source(), None);
    }

    #[test]
    fn occupied_artifact_dir_is_refused_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        let result = create_artifact_dir(dir.path(), false);
        assert!(matches!(result, Err(ClassifierError::Config(_))));
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn overwrite_removes_only_previous_run_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "keep me").unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{}").unwrap();
        fs::write(dir.path().join("model.mpk.gz"), "old").unwrap();
        fs::create_dir_all(dir.path().join("checkpoint")).unwrap();
        fs::write(dir.path().join("checkpoint").join("model-1.mpk.gz"), "old").unwrap();
        fs::create_dir_all(dir.path().join(PRETRAINED_DIR)).unwrap();
        fs::write(dir.path().join(PRETRAINED_DIR).join("b0.pth"), "cached").unwrap();

        create_artifact_dir(dir.path(), true).unwrap();

        assert!(dir.path().join("notes.txt").exists());
        assert!(dir.path().join(PRETRAINED_DIR).join("b0.pth").exists());
        assert!(!dir.path().join(CONFIG_FILE).exists());
        assert!(!dir.path().join("model.mpk.gz").exists());
        assert!(!dir.path().join("checkpoint").exists());
    }

    #[test]
    fn cached_weights_alone_do_not_block_a_run() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = dir.path().join("model");
        fs::create_dir_all(artifacts.join(PRETRAINED_DIR)).unwrap();

        create_artifact_dir(&artifacts, false).unwrap();
        create_artifact_dir(&dir.path().join("fresh"), false).unwrap();
        assert!(dir.path().join("fresh").is_dir());
    }

    #[test]
    fn split_folder_records_partitions_and_classes() {
        let data = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        write_folder(&data.path().join("train"), &["a", "b"], &[5, 5]);
        let config = TrainingConfig::new(sgd_with_momentum(0.9));

        let (folder, partitions) = split_folder(&config, data.path(), artifacts.path(), 11).unwrap();

        let mut all: Vec<usize> = partitions
            .train
            .iter()
            .chain(&partitions.valid)
            .chain(&partitions.test)
            .copied()
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..folder.len()).collect::<Vec<_>>());

        let saved = Partitions::load(artifacts.path().join(SPLITS_FILE)).unwrap();
        assert_eq!(saved.test, partitions.test);
        let classes: Vec<String> =
            serde_json::from_reader(File::open(artifacts.path().join(CLASSES_FILE)).unwrap())
                .unwrap();
        assert_eq!(classes, ["a", "b"]);
    }

    /// Trained-looking artifacts over a two-class `train` folder of 4 + 4 images.
    fn held_out_fixture() -> (tempfile::TempDir, tempfile::TempDir, Partitions) {
        let data = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        write_folder(&data.path().join("train"), &["a", "b"], &[4, 4]);
        write_artifacts(artifacts.path(), &["a".to_string(), "b".to_string()]);

        let config = TrainingConfig::new(sgd_with_momentum(0.9));
        let (_, partitions) = split_folder(&config, data.path(), artifacts.path(), 5).unwrap();
        (data, artifacts, partitions)
    }

    #[test]
    fn held_out_evaluation_covers_the_recorded_test_partition() {
        let (data, artifacts, partitions) = held_out_fixture();

        let metrics =
            evaluate_held_out::<NdArray>(artifacts.path(), data.path(), 2, 1, Default::default())
                .unwrap();
        assert_eq!(metrics.samples, partitions.test.len());
        assert!((0.0..=1.0).contains(&metrics.accuracy));
        assert!(metrics.loss.is_finite());
    }

    #[test]
    fn held_out_evaluation_rejects_renamed_classes() {
        let (_data, artifacts, _) = held_out_fixture();
        let other = tempfile::tempdir().unwrap();
        write_folder(&other.path().join("train"), &["a", "c"], &[4, 4]);

        let result =
            evaluate_held_out::<NdArray>(artifacts.path(), other.path(), 2, 1, Default::default());
        assert!(matches!(result, Err(ClassifierError::Config(_))));
    }

    #[test]
    fn held_out_evaluation_rejects_a_shrunken_folder() {
        let (_data, artifacts, _) = held_out_fixture();
        let smaller = tempfile::tempdir().unwrap();
        write_folder(&smaller.path().join("train"), &["a", "b"], &[1, 1]);

        let result =
            evaluate_held_out::<NdArray>(artifacts.path(), smaller.path(), 2, 1, Default::default());
        assert!(matches!(
            result,
            Err(ClassifierError::IndexOutOfRange { len: 2, .. })
        ));
    }

    #[test]
    fn config_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let config = TrainingConfig::new(sgd_with_momentum(0.9))
            .with_seed(Some(7))
            .with_model_name(ModelName::B2)
            .with_image_size(Some(64));
        config.save(&path).unwrap();

        let loaded = TrainingConfig::load(&path).unwrap();
        assert_eq!(loaded.seed, Some(7));
        assert_eq!(loaded.model_name, ModelName::B2);
        assert_eq!(loaded.resolved_image_size(), 64);
    }

    #[test]
    fn evaluate_counts_every_sample() {
        let dir = tempfile::tempdir().unwrap();
        write_folder(dir.path(), &["a", "b", "c"], &[3, 2, 2]);
        let folder = Arc::new(ImageFolder::new(dir.path()).unwrap());

        let device = Default::default();
        let model = EfficientNetConfig::new(ModelName::B0, 3).init::<NdArray>(&device);
        let view = TransformedView::new(folder, (0..7).collect()).with_transform(eval_pipeline(32));
        let loader = DataLoaderBuilder::new(ClassificationBatcher::<NdArray>::new(device))
            .batch_size(3)
            .build(view);

        let metrics = evaluate(&model, loader);
        assert_eq!(metrics.samples, 7);
        assert!((0.0..=1.0).contains(&metrics.accuracy));
        assert!(metrics.loss.is_finite() && metrics.loss > 0.0);
    }
}
