use ndarray::ArrayView1;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum SplitError {
    #[error("Held-out fraction must lie strictly between 0 and 1; got {0}.")]
    InvalidFraction(f64),
    #[error("Class {label} has only {count} samples; a stratified split needs at least 2 per class.")]
    ClassTooSmall { label: u8, count: usize },
}

/// Row indices of the two halves of a split, each in ascending order.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Splits rows into training and held-out sets while keeping the class
/// proportions of `labels` in both halves.
///
/// Every class contributes `round(count * test_fraction)` rows to the held-out
/// set, clamped so that each class keeps at least one row on each side.
pub fn stratified_split(
    labels: ArrayView1<u8>,
    test_fraction: f64,
    seed: u64,
) -> Result<SplitIndices, SplitError> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(SplitError::InvalidFraction(test_fraction));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::with_capacity(labels.len());
    let mut test = Vec::new();

    for label in [0u8, 1] {
        let mut members: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, value)| **value == label)
            .map(|(index, _)| index)
            .collect();
        if members.is_empty() {
            continue;
        }
        if members.len() < 2 {
            return Err(SplitError::ClassTooSmall {
                label,
                count: members.len(),
            });
        }

        members.shuffle(&mut rng);
        let held_out = ((members.len() as f64 * test_fraction).round() as usize)
            .clamp(1, members.len() - 1);
        test.extend_from_slice(&members[..held_out]);
        train.extend_from_slice(&members[held_out..]);
    }

    train.sort_unstable();
    test.sort_unstable();
    log::debug!(
        "Stratified split: {} training rows, {} held-out rows",
        train.len(),
        test.len()
    );
    Ok(SplitIndices { train, test })
}
