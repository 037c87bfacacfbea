//! Model weights.
//!
//! A model is an ordered list of tensors. Every arithmetic operation is element-wise
//! and requires both operands to have the same layout.

use std::sync::{Arc, Mutex};

use derive_more::{From, Index, IndexMut, Into};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregator::HeldModel;

#[derive(Debug, Error, PartialEq, Eq)]
/// Errors related to weights arithmetic.
pub enum WeightsError {
    #[error("the containers hold {0} and {1} tensors")]
    LengthMismatch(usize, usize),
    #[error("tensor {index} has shape {left:?} on one side and {right:?} on the other")]
    ShapeMismatch {
        index: usize,
        left: Vec<usize>,
        right: Vec<usize>,
    },
    #[error("a tensor of shape {shape:?} cannot hold {len} values")]
    InvalidShape { shape: Vec<usize>, len: usize },
    #[error("cannot aggregate an empty set of weights")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A dense multi-dimensional array of `f32` values in row-major order.
pub struct Tensor {
    shape: Vec<usize>,
    values: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor with the given shape.
    ///
    /// # Errors
    /// Fails if the number of values doesn't match the shape.
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self, WeightsError> {
        if shape.iter().product::<usize>() != values.len() {
            return Err(WeightsError::InvalidShape {
                shape,
                len: values.len(),
            });
        }
        Ok(Self { shape, values })
    }

    /// Creates a tensor of zeros with the given shape.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            values: vec![0.0; len],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Vec<f32>> for Tensor {
    /// Creates a one-dimensional tensor.
    fn from(values: Vec<f32>) -> Self {
        Self {
            shape: vec![values.len()],
            values,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, From, Index, IndexMut, Into, Serialize, Deserialize)]
/// The weights of a model: an ordered list of tensors.
pub struct WeightsContainer(Vec<Tensor>);

impl WeightsContainer {
    /// Creates a container from a list of tensors.
    pub fn new(tensors: Vec<Tensor>) -> Self {
        Self(tensors)
    }

    /// Creates a container of zeros with the same layout as `self`.
    pub fn zeros_like(&self) -> Self {
        Self(
            self.0
                .iter()
                .map(|tensor| Tensor::zeros(tensor.shape.clone()))
                .collect(),
        )
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Checks whether `other` has the same layout as `self`.
    ///
    /// # Errors
    /// Fails on the first tensor whose shape differs.
    pub fn check_layout(&self, other: &Self) -> Result<(), WeightsError> {
        if self.0.len() != other.0.len() {
            return Err(WeightsError::LengthMismatch(self.0.len(), other.0.len()));
        }
        for (index, (left, right)) in self.0.iter().zip(other.0.iter()).enumerate() {
            if left.shape != right.shape {
                return Err(WeightsError::ShapeMismatch {
                    index,
                    left: left.shape.clone(),
                    right: right.shape.clone(),
                });
            }
        }
        Ok(())
    }

    /// Combines `self` and `other` element-wise with `f`.
    ///
    /// # Errors
    /// Fails if the layouts differ.
    pub fn zip_with<F>(&self, other: &Self, f: F) -> Result<Self, WeightsError>
    where
        F: Fn(f32, f32) -> f32,
    {
        self.check_layout(other)?;
        let tensors = self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(left, right)| Tensor {
                shape: left.shape.clone(),
                values: left
                    .values
                    .iter()
                    .zip(right.values.iter())
                    .map(|(l, r)| f(*l, *r))
                    .collect(),
            })
            .collect();
        Ok(Self(tensors))
    }

    /// Applies `f` to every element.
    pub fn map<F>(&self, mut f: F) -> Self
    where
        F: FnMut(f32) -> f32,
    {
        let mut mapped = self.clone();
        for tensor in mapped.0.iter_mut() {
            for value in tensor.values.iter_mut() {
                *value = f(*value);
            }
        }
        mapped
    }

    pub fn add(&self, other: &Self) -> Result<Self, WeightsError> {
        self.zip_with(other, |l, r| l + r)
    }

    pub fn sub(&self, other: &Self) -> Result<Self, WeightsError> {
        self.zip_with(other, |l, r| l - r)
    }

    pub fn scale(&self, factor: f32) -> Self {
        self.map(|v| v * factor)
    }

    /// Computes the Frobenius norm over all tensors.
    pub fn frobenius_norm(&self) -> f32 {
        self.0
            .iter()
            .flat_map(|tensor| tensor.values.iter())
            .map(|v| v * v)
            .sum::<f32>()
            .sqrt()
    }

    /// Checks whether both containers have the same layout and all their elements
    /// differ by at most `tolerance`.
    pub fn approx_eq(&self, other: &Self, tolerance: f32) -> bool {
        self.check_layout(other).is_ok()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .flat_map(|(l, r)| l.values.iter().zip(r.values.iter()))
                .all(|(l, r)| (l - r).abs() <= tolerance)
    }
}

impl From<Vec<Vec<f32>>> for WeightsContainer {
    /// Creates a container of one-dimensional tensors.
    fn from(tensors: Vec<Vec<f32>>) -> Self {
        Self(tensors.into_iter().map(Tensor::from).collect())
    }
}

#[derive(Debug, Clone, Default)]
/// A model whose weights can be replaced by an aggregator and read by its owner.
pub struct SharedWeights(Arc<Mutex<Option<WeightsContainer>>>);

impl SharedWeights {
    pub fn new(weights: WeightsContainer) -> Self {
        Self(Arc::new(Mutex::new(Some(weights))))
    }

    /// Gets a copy of the current weights, if any were set.
    pub fn get(&self) -> Option<WeightsContainer> {
        self.0.lock().map(|guard| guard.clone()).unwrap_or(None)
    }
}

impl HeldModel for SharedWeights {
    fn set_weights(&mut self, weights: &WeightsContainer) {
        if let Ok(mut guard) = self.0.lock() {
            *guard = Some(weights.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_shape() {
        assert!(Tensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
        assert_eq!(
            Tensor::new(vec![2, 3], vec![0.0; 5]).unwrap_err(),
            WeightsError::InvalidShape {
                shape: vec![2, 3],
                len: 5
            }
        );
        assert_eq!(Tensor::zeros(vec![2, 2]).values(), &[0.0; 4]);
    }

    #[test]
    fn test_arithmetic() {
        let a = WeightsContainer::from(vec![vec![1.0, 2.0], vec![3.0]]);
        let b = WeightsContainer::from(vec![vec![0.5, 0.5], vec![-1.0]]);
        assert_eq!(
            a.add(&b).unwrap(),
            WeightsContainer::from(vec![vec![1.5, 2.5], vec![2.0]])
        );
        assert_eq!(
            a.sub(&b).unwrap(),
            WeightsContainer::from(vec![vec![0.5, 1.5], vec![4.0]])
        );
        assert_eq!(
            a.scale(2.0),
            WeightsContainer::from(vec![vec![2.0, 4.0], vec![6.0]])
        );
    }

    #[test]
    fn test_layout_mismatch() {
        let a = WeightsContainer::from(vec![vec![1.0, 2.0], vec![3.0]]);
        let b = WeightsContainer::from(vec![vec![1.0, 2.0]]);
        let c = WeightsContainer::from(vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(a.add(&b).unwrap_err(), WeightsError::LengthMismatch(2, 1));
        assert!(matches!(
            a.sub(&c).unwrap_err(),
            WeightsError::ShapeMismatch { index: 1, .. }
        ));
    }

    #[test]
    fn test_norm_and_approx_eq() {
        let a = WeightsContainer::from(vec![vec![3.0], vec![4.0]]);
        assert!((a.frobenius_norm() - 5.0).abs() < f32::EPSILON);
        assert!(a.approx_eq(&a.map(|v| v + 0.01), 0.1));
        assert!(!a.approx_eq(&a.map(|v| v + 1.0), 0.1));
        assert_eq!(a.zeros_like().frobenius_norm(), 0.0);
    }

    #[test]
    fn test_shared_weights() {
        let shared = SharedWeights::default();
        assert!(shared.get().is_none());
        let mut model = shared.clone();
        model.set_weights(&WeightsContainer::from(vec![vec![1.0]]));
        assert_eq!(shared.get(), Some(WeightsContainer::from(vec![vec![1.0]])));
    }
}
