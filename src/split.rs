//! Stratified train/validation/test partitioning.
//!
//! The full index range is split twice: first into a held-out test set and a
//! remainder, then the remainder into train and validation. Both stages keep
//! the per-class proportions of their input. Partitions only hold indices into
//! the shared dataset, never copies of the samples.

use std::collections::BTreeMap;
use std::path::Path;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, Span};

use crate::error::{ClassifierError, Result};

/// A class needs one member in each of the three partitions.
pub const MIN_CLASS_MEMBERS: usize = 3;

/// Index partitions into a shared dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partitions {
    pub train: Vec<usize>,
    pub valid: Vec<usize>,
    pub test: Vec<usize>,
}

/// Per-class member counts of each partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDistribution {
    pub train: Vec<usize>,
    pub valid: Vec<usize>,
    pub test: Vec<usize>,
}

impl Partitions {
    /// Total number of indices across the three partitions.
    pub fn len(&self) -> usize {
        self.train.len() + self.valid.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn class_distribution(&self, labels: &[usize], num_classes: usize) -> ClassDistribution {
        let count = |partition: &[usize]| {
            let mut counts = vec![0usize; num_classes];
            for &index in partition {
                counts[labels[index]] += 1;
            }
            counts
        };

        ClassDistribution {
            train: count(&self.train),
            valid: count(&self.valid),
            test: count(&self.test),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Splits a label sequence into stratified train/valid/test index partitions.
#[derive(Debug, Clone)]
pub struct StratifiedSplitter {
    test_fraction: f64,
    valid_fraction: f64,
    seed: Option<u64>,
    span: Span,
}

impl Default for StratifiedSplitter {
    fn default() -> Self {
        Self {
            test_fraction: 0.3,
            valid_fraction: 0.5,
            seed: None,
            span: tracing::info_span!("stratified_split"),
        }
    }
}

impl StratifiedSplitter {
    /// `test_fraction` is taken from the full set, `valid_fraction` from what
    /// remains after the test set is removed.
    pub fn new(test_fraction: f64, valid_fraction: f64) -> Result<Self> {
        check_fraction("test_fraction", test_fraction)?;
        check_fraction("valid_fraction", valid_fraction)?;

        Ok(Self {
            test_fraction,
            valid_fraction,
            ..Self::default()
        })
    }

    /// Fixes the random source; `None` draws a fresh seed on every call.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Span the splitter logs into.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn split(&self, labels: &[usize]) -> Result<Partitions> {
        let _entered = self.span.enter();

        if labels.is_empty() {
            debug!("empty label sequence, returning empty partitions");
            return Ok(Partitions {
                train: Vec::new(),
                valid: Vec::new(),
                test: Vec::new(),
            });
        }

        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for &label in labels {
            *counts.entry(label).or_default() += 1;
        }
        if let Some((&class, &count)) = counts
            .iter()
            .find(|&(_, &count)| count < MIN_CLASS_MEMBERS)
        {
            return Err(ClassifierError::InsufficientClassCount {
                class,
                count,
                required: MIN_CLASS_MEMBERS,
            });
        }

        let mut rng = match self.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };

        let all: Vec<usize> = (0..labels.len()).collect();
        // The remainder must still feed both train and valid.
        let (remainder, test) = stratified_stage(&all, labels, self.test_fraction, 1, 2, &mut rng);
        debug!(test = test.len(), remainder = remainder.len(), "held out test set");

        // Remainder labels are sliced from the input, never re-read.
        let remainder_labels: Vec<usize> = remainder.iter().map(|&index| labels[index]).collect();
        let (train, valid) = stratified_stage(
            &remainder,
            &remainder_labels,
            self.valid_fraction,
            1,
            1,
            &mut rng,
        );

        info!(
            total = labels.len(),
            classes = counts.len(),
            train = train.len(),
            valid = valid.len(),
            test = test.len(),
            "dataset split"
        );

        Ok(Partitions { train, valid, test })
    }
}

/// Convenience form of [`StratifiedSplitter::split`].
pub fn split(
    labels: &[usize],
    test_fraction: f64,
    valid_fraction: f64,
    seed: Option<u64>,
) -> Result<Partitions> {
    StratifiedSplitter::new(test_fraction, valid_fraction)?
        .with_seed(seed)
        .split(labels)
}

fn check_fraction(name: &'static str, value: f64) -> Result<()> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(ClassifierError::InvalidFraction { name, value })
    }
}

/// One stratified shuffle split of `indices`, whose labels are given in
/// parallel by `labels`. Returns `(kept, held)` where `held` receives
/// `ceil(fraction * n)` items, allocated across classes by largest remainder.
///
/// Every class keeps at least `min_held` items on the held side and
/// `min_kept` on the kept side; callers guarantee each class is large enough.
fn stratified_stage(
    indices: &[usize],
    labels: &[usize],
    fraction: f64,
    min_held: usize,
    min_kept: usize,
    rng: &mut ChaCha8Rng,
) -> (Vec<usize>, Vec<usize>) {
    let n = indices.len();
    let n_held = ((fraction * n as f64).ceil() as usize).min(n);

    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (&index, &label) in indices.iter().zip(labels) {
        by_class.entry(label).or_default().push(index);
    }
    let mut members: Vec<Vec<usize>> = by_class.into_values().collect();

    // Integer largest-remainder allocation of n_held across classes.
    let mut held_counts: Vec<usize> = members.iter().map(|m| m.len() * n_held / n).collect();
    let allocated: usize = held_counts.iter().sum();
    let mut order: Vec<usize> = (0..members.len()).collect();
    order.shuffle(rng);
    order.sort_by_key(|&class| std::cmp::Reverse(members[class].len() * n_held % n));
    for &class in order.iter().take(n_held - allocated) {
        held_counts[class] += 1;
    }

    let mut kept = Vec::with_capacity(n - n_held);
    let mut held = Vec::with_capacity(n_held);
    for (class_members, held_count) in members.iter_mut().zip(held_counts) {
        let upper = class_members.len().saturating_sub(min_kept).max(min_held);
        let held_count = held_count.clamp(min_held, upper).min(class_members.len());

        class_members.shuffle(rng);
        held.extend_from_slice(&class_members[..held_count]);
        kept.extend_from_slice(&class_members[held_count..]);
    }

    kept.shuffle(rng);
    held.shuffle(rng);
    (kept, held)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn labels_with_counts(counts: &[usize]) -> Vec<usize> {
        counts
            .iter()
            .enumerate()
            .flat_map(|(class, &count)| std::iter::repeat(class).take(count))
            .collect()
    }

    fn assert_exact_cover(partitions: &Partitions, n: usize) {
        let mut seen = vec![0usize; n];
        for &index in partitions
            .train
            .iter()
            .chain(&partitions.valid)
            .chain(&partitions.test)
        {
            seen[index] += 1;
        }
        assert!(seen.iter().all(|&times| times == 1), "{seen:?}");
    }

    #[test]
    fn partitions_cover_every_index_exactly_once() {
        for counts in [vec![3], vec![10, 17, 33], vec![5, 5, 5, 5, 5, 5, 5], vec![250, 4]] {
            let labels = labels_with_counts(&counts);
            let partitions = split(&labels, 0.3, 0.5, Some(7)).unwrap();
            assert_eq!(partitions.len(), labels.len());
            assert_exact_cover(&partitions, labels.len());
        }
    }

    #[test]
    fn partitions_are_disjoint() {
        let labels = labels_with_counts(&[40, 25, 61]);
        let partitions = split(&labels, 0.3, 0.5, Some(1)).unwrap();

        let train: HashSet<_> = partitions.train.iter().collect();
        let valid: HashSet<_> = partitions.valid.iter().collect();
        let test: HashSet<_> = partitions.test.iter().collect();

        assert!(train.is_disjoint(&valid));
        assert!(train.is_disjoint(&test));
        assert!(valid.is_disjoint(&test));
    }

    #[test]
    fn balanced_classes_split_proportionally() {
        let labels = labels_with_counts(&[100, 100]);
        let partitions = split(&labels, 0.3, 0.5, None).unwrap();
        let distribution = partitions.class_distribution(&labels, 2);

        assert_eq!(distribution.test, vec![30, 30]);
        assert_eq!(distribution.train, vec![35, 35]);
        assert_eq!(distribution.valid, vec![35, 35]);
    }

    #[test]
    fn uneven_classes_stay_within_one_of_expectation() {
        let counts = [50, 120, 31];
        let labels = labels_with_counts(&counts);
        let partitions = split(&labels, 0.3, 0.5, Some(3)).unwrap();
        let distribution = partitions.class_distribution(&labels, counts.len());

        for (class, &count) in counts.iter().enumerate() {
            let expected_test = count as f64 * 0.3;
            let expected_half = count as f64 * 0.35;
            assert!((distribution.test[class] as f64 - expected_test).abs() <= 1.0);
            assert!((distribution.train[class] as f64 - expected_half).abs() <= 1.5);
            assert!((distribution.valid[class] as f64 - expected_half).abs() <= 1.5);
        }
    }

    #[test]
    fn same_seed_gives_same_partitions() {
        let labels = labels_with_counts(&[30, 45, 12]);
        let first = split(&labels, 0.3, 0.5, Some(42)).unwrap();
        let second = split(&labels, 0.3, 0.5, Some(42)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn different_seeds_shuffle_differently() {
        let labels = labels_with_counts(&[100, 100]);
        let first = split(&labels, 0.3, 0.5, Some(1)).unwrap();
        let second = split(&labels, 0.3, 0.5, Some(2)).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn singleton_class_is_rejected() {
        let labels = labels_with_counts(&[20, 1, 20]);
        let err = split(&labels, 0.3, 0.5, Some(0)).unwrap_err();
        assert!(matches!(
            err,
            ClassifierError::InsufficientClassCount {
                class: 1,
                count: 1,
                required: MIN_CLASS_MEMBERS
            }
        ));
    }

    #[test]
    fn rare_class_still_reaches_every_partition() {
        let labels = labels_with_counts(&[500, 3, 500]);
        let partitions = split(&labels, 0.3, 0.5, Some(11)).unwrap();
        let distribution = partitions.class_distribution(&labels, 3);

        assert_eq!(distribution.test[1], 1);
        assert_eq!(distribution.train[1], 1);
        assert_eq!(distribution.valid[1], 1);
        assert_exact_cover(&partitions, labels.len());
    }

    #[test]
    fn fractions_outside_unit_interval_are_rejected() {
        assert!(matches!(
            StratifiedSplitter::new(0.0, 0.5),
            Err(ClassifierError::InvalidFraction { name: "test_fraction", .. })
        ));
        assert!(matches!(
            StratifiedSplitter::new(0.3, 1.0),
            Err(ClassifierError::InvalidFraction { name: "valid_fraction", .. })
        ));
    }

    #[test]
    fn empty_labels_give_empty_partitions() {
        let partitions = split(&[], 0.3, 0.5, Some(0)).unwrap();
        assert!(partitions.is_empty());
    }

    #[test]
    fn partitions_round_trip_through_json() {
        let labels = labels_with_counts(&[9, 9]);
        let partitions = split(&labels, 0.3, 0.5, Some(5)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("splits.json");
        partitions.save(&path).unwrap();

        assert_eq!(Partitions::load(&path).unwrap(), partitions);
    }
}
