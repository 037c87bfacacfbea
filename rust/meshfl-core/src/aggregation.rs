//! Element-wise aggregation of weights.

use crate::weights::{WeightsContainer, WeightsError};

/// Sums a non-empty collection of weights element-wise.
///
/// # Errors
/// Fails if the collection is empty or if the layouts differ.
pub fn sum<'a, I>(weights: I) -> Result<WeightsContainer, WeightsError>
where
    I: IntoIterator<Item = &'a WeightsContainer>,
{
    let mut weights = weights.into_iter();
    let first = weights.next().ok_or(WeightsError::Empty)?;
    weights.try_fold(first.clone(), |acc, w| acc.add(w))
}

/// Averages a non-empty collection of weights element-wise.
///
/// # Errors
/// Fails if the collection is empty or if the layouts differ.
pub fn avg<'a, I>(weights: I) -> Result<WeightsContainer, WeightsError>
where
    I: IntoIterator<Item = &'a WeightsContainer>,
{
    let weights: Vec<&WeightsContainer> = weights.into_iter().collect();
    let count = weights.len() as f32;
    sum(weights).map(|total| total.scale(1.0 / count))
}

/// Computes `left - right` element-wise.
pub fn diff(
    left: &WeightsContainer,
    right: &WeightsContainer,
) -> Result<WeightsContainer, WeightsError> {
    left.sub(right)
}
