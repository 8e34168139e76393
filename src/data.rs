use burn::{data::dataloader::batcher::Batcher, prelude::*};

use crate::transform::ImageTensor;

/// Stacks transformed samples into device tensors.
///
/// Images arrive already resized and normalized by the view's pipeline, so the
/// batcher only copies them into a `[N, C, H, W]` tensor.
#[derive(Clone)]
pub struct ClassificationBatcher<B: Backend> {
    device: B::Device,
}

#[derive(Clone, Debug)]
pub struct ClassificationBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> ClassificationBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<(ImageTensor, usize), ClassificationBatch<B>>
    for ClassificationBatcher<B>
{
    fn batch(&self, items: Vec<(ImageTensor, usize)>) -> ClassificationBatch<B> {
        let labels: Vec<i64> = items.iter().map(|(_, label)| *label as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(labels, Shape::new([items.len()])).convert::<B::IntElem>(),
            &self.device,
        );

        let images = items
            .into_iter()
            .map(|(image, _)| TensorData::new(image.data, Shape::new(image.shape)))
            .map(|data| Tensor::<B, 3>::from_data(data.convert::<B::FloatElem>(), &self.device))
            .collect();

        ClassificationBatch {
            images: Tensor::stack(images, 0),
            targets,
        }
    }
}
