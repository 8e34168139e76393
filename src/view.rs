//! Lazily transformed views over a partition of a shared dataset.

use std::sync::Arc;

use burn::data::dataset::Dataset;

use crate::dataset::LabeledDataset;
use crate::error::{ClassifierError, Result};
use crate::transform::{Identity, Transform};

/// A partition of `D` whose samples are transformed on every access.
///
/// The view owns only its index list. Nothing is cached: each [`at`] call
/// fetches the raw sample and re-runs both transforms, so a stochastic image
/// transform yields a fresh augmentation every epoch.
///
/// [`at`]: TransformedView::at
pub struct TransformedView<D, T = Identity, L = Identity> {
    dataset: Arc<D>,
    indices: Vec<usize>,
    transform: T,
    target_transform: L,
}

impl<D> TransformedView<D> {
    pub fn new(dataset: Arc<D>, indices: Vec<usize>) -> Self {
        Self {
            dataset,
            indices,
            transform: Identity,
            target_transform: Identity,
        }
    }
}

impl<D, T, L> TransformedView<D, T, L> {
    pub fn with_transform<T2>(self, transform: T2) -> TransformedView<D, T2, L> {
        TransformedView {
            dataset: self.dataset,
            indices: self.indices,
            transform,
            target_transform: self.target_transform,
        }
    }

    pub fn with_target_transform<L2>(self, target_transform: L2) -> TransformedView<D, T, L2> {
        TransformedView {
            dataset: self.dataset,
            indices: self.indices,
            transform: self.transform,
            target_transform,
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Dataset positions backing this view, in view order.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

impl<D, T, L> TransformedView<D, T, L>
where
    D: LabeledDataset,
    T: Transform<D::Item>,
    L: Transform<usize>,
{
    /// Fetches sample `index` of the view and applies both transforms.
    pub fn at(&self, index: usize) -> Result<(T::Output, L::Output)> {
        let &position = self
            .indices
            .get(index)
            .ok_or(ClassifierError::IndexOutOfRange {
                index,
                len: self.indices.len(),
            })?;

        let (image, label) = LabeledDataset::get(self.dataset.as_ref(), position)?;
        Ok((
            self.transform.apply(image)?,
            self.target_transform.apply(label)?,
        ))
    }
}

/// Lets burn's data loaders draw batches from a view.
///
/// `get` past the end returns `None` as the trait expects. Any other failure
/// (an unreadable image, a failing transform) aborts the loader with the
/// underlying error rather than silently skipping the sample.
impl<D, T, L> Dataset<(T::Output, L::Output)> for TransformedView<D, T, L>
where
    D: LabeledDataset,
    T: Transform<D::Item>,
    L: Transform<usize>,
{
    fn get(&self, index: usize) -> Option<(T::Output, L::Output)> {
        if index >= self.indices.len() {
            return None;
        }
        match self.at(index) {
            Ok(item) => Some(item),
            Err(err) => panic!("failed to load sample {index} of the partition: {err}"),
        }
    }

    fn len(&self) -> usize {
        self.indices.len()
    }
}
