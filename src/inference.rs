use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
    record::{CompactRecorder, Recorder},
    tensor::activation::softmax,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    data::ClassificationBatcher,
    dataset::{load_image, ImageFolder, LabeledDataset},
    error::{ClassifierError, Result},
    model::{EfficientNet, EfficientNetConfig},
    training::{TrainingConfig, CLASSES_FILE, CONFIG_FILE, MODEL_FILE},
    transform::{eval_pipeline, ImageTensor, Transform},
    view::TransformedView,
};

/// One ranked class for an image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: usize,
    pub class: String,
    pub probability: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImagePrediction {
    pub path: PathBuf,
    /// Ground-truth class, when the image's folder names a trained class.
    pub truth: Option<String>,
    pub top: Vec<Prediction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FolderReport {
    pub images: Vec<ImagePrediction>,
    /// Top-1 accuracy over images with a known ground truth.
    pub accuracy: f64,
}

/// A trained model together with its class map.
pub struct Classifier<B: Backend> {
    model: EfficientNet<B>,
    classes: Vec<String>,
    image_size: u32,
    device: B::Device,
}

impl<B: Backend> Classifier<B> {
    /// Loads `config.json`, `classes.json` and the model record written by
    /// training.
    pub fn load(artifact_dir: &Path, device: B::Device) -> Result<Self> {
        let config = TrainingConfig::load(artifact_dir.join(CONFIG_FILE))
            .map_err(|err| ClassifierError::Config(format!("{err:?}")))?;
        let classes: Vec<String> =
            serde_json::from_reader(File::open(artifact_dir.join(CLASSES_FILE))?)?;

        let record = CompactRecorder::new()
            .load(artifact_dir.join(MODEL_FILE), &device)
            .map_err(|err| ClassifierError::Recorder(format!("{err:?}")))?;
        let model = EfficientNetConfig::new(config.model_name, classes.len())
            .init::<B>(&device)
            .load_record(record);

        info!(
            model = %config.model_name,
            classes = classes.len(),
            "model loaded"
        );

        Ok(Self {
            model,
            classes,
            image_size: config.resolved_image_size(),
            device,
        })
    }

    pub fn model(&self) -> &EfficientNet<B> {
        &self.model
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// Softmax probabilities for each image, one row per image.
    fn probabilities(&self, images: Vec<ImageTensor>) -> Result<Vec<Vec<f32>>> {
        let batcher = ClassificationBatcher::<B>::new(self.device.clone());
        let batch = batcher.batch(images.into_iter().map(|image| (image, 0)).collect());
        let probabilities = softmax(self.model.forward(batch.images), 1);

        let values = probabilities
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| ClassifierError::TensorData(format!("{err:?}")))?;

        Ok(values
            .chunks(self.classes.len().max(1))
            .map(<[f32]>::to_vec)
            .collect())
    }

    /// The `k` most likely classes for the image at `path`.
    pub fn predict_image(&self, path: &Path, k: usize) -> Result<Vec<Prediction>> {
        let image = load_image(path)?;
        let tensor = eval_pipeline(self.image_size).apply(image)?;
        let probabilities = self.probabilities(vec![tensor])?;
        let row = probabilities.first().map(Vec::as_slice).unwrap_or_default();

        Ok(top_k(row, &self.classes, k))
    }

    /// Ranks every image of a class-folder tree, `batch_size` images at a time.
    ///
    /// Folder names are matched against the trained classes by name; images in
    /// unknown folders are predicted but excluded from the accuracy.
    pub fn predict_folder(&self, dir: &Path, batch_size: usize, k: usize) -> Result<FolderReport> {
        let folder = Arc::new(ImageFolder::new(dir)?);
        let view = TransformedView::new(folder.clone(), (0..folder.len()).collect())
            .with_transform(eval_pipeline(self.image_size));

        let mut images = Vec::with_capacity(view.len());
        let (mut known, mut correct) = (0usize, 0usize);
        let positions: Vec<usize> = (0..view.len()).collect();

        for chunk in positions.chunks(batch_size.max(1)) {
            let mut tensors = Vec::with_capacity(chunk.len());
            let mut labels = Vec::with_capacity(chunk.len());
            for &position in chunk {
                let (tensor, label) = view.at(position)?;
                tensors.push(tensor);
                labels.push(label);
            }

            let rows = self.probabilities(tensors)?;
            for ((&position, label), row) in chunk.iter().zip(labels).zip(rows) {
                let truth = folder.classes().get(label).cloned();
                let top = top_k(&row, &self.classes, k);

                if let Some(truth) = truth.as_ref().filter(|truth| self.classes.contains(*truth)) {
                    known += 1;
                    let best = top_k(&row, &self.classes, 1);
                    if best.first().is_some_and(|p| &p.class == truth) {
                        correct += 1;
                    }
                }

                let path = view
                    .indices()
                    .get(position)
                    .and_then(|&index| folder.path(index))
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                debug!(path = %path.display(), "predicted");
                images.push(ImagePrediction { path, truth, top });
            }
        }

        let accuracy = if known == 0 {
            0.0
        } else {
            correct as f64 / known as f64
        };
        info!(images = images.len(), accuracy, "folder predicted");

        Ok(FolderReport { images, accuracy })
    }
}

/// Sorts classes by descending probability and keeps the first `k`. Ties keep
/// label order.
pub fn top_k(probabilities: &[f32], classes: &[String], k: usize) -> Vec<Prediction> {
    let mut ranked: Vec<(usize, f32)> = probabilities.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    ranked
        .into_iter()
        .take(k)
        .map(|(label, probability)| Prediction {
            label,
            class: classes
                .get(label)
                .cloned()
                .unwrap_or_else(|| label.to_string()),
            probability,
        })
        .collect()
}

/// Renders one line per prediction, class name padded to 75 columns.
pub fn format_predictions(predictions: &[Prediction]) -> String {
    predictions
        .iter()
        .map(|p| format!("{:<75} ({:.2}%)", p.class, p.probability * 100.0))
        .collect::<Vec<_>>()
        .join("\n")
}
