//! Averaging of full updates.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::debug;

use crate::{
    aggregation,
    aggregator::{Aggregator, AggregatorCore, AggregatorError},
    message::PayloadKind,
    weights::WeightsContainer,
    NodeId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
/// How a [`MeanAggregator`] reads its threshold.
pub enum ThresholdType {
    /// A fraction of the active nodes.
    Relative,
    /// A number of contributions.
    Absolute,
}

/// An aggregator averaging the updates of the active nodes.
///
/// Every node sends its update to every active node, itself included. The
/// aggregator averages what it received as soon as the threshold is reached:
///
/// - a threshold `t < 1` is relative: at least `t * |nodes|` contributions.
/// - a threshold `t > 1` is absolute: at least `t` contributions.
/// - a threshold `t = 1` is relative (every active node) unless the threshold type
///   says otherwise, in which case a single contribution is enough.
///
/// No aggregation happens while there are fewer active nodes than the minimal
/// number of participants, if one is set.
pub struct MeanAggregator {
    core: AggregatorCore,
    threshold: f64,
    threshold_type: ThresholdType,
    min_participants: Option<usize>,
}

impl MeanAggregator {
    /// Creates a mean aggregator.
    ///
    /// # Errors
    /// Fails if the threshold is not positive, or if it is greater than 1 but not
    /// an integer.
    pub fn new(threshold: f64, round_cutoff: u64) -> Result<Self, AggregatorError> {
        Self::with_threshold_type(threshold, None, round_cutoff)
    }

    /// Creates a mean aggregator with an explicit threshold type.
    ///
    /// # Errors
    /// Fails if the threshold is invalid, or if the threshold type contradicts it.
    pub fn with_threshold_type(
        threshold: f64,
        threshold_type: Option<ThresholdType>,
        round_cutoff: u64,
    ) -> Result<Self, AggregatorError> {
        if !threshold.is_finite() || threshold <= 0.0 || (threshold > 1.0 && threshold.fract() != 0.0)
        {
            return Err(AggregatorError::InvalidThreshold(threshold));
        }
        let implied = if threshold < 1.0 {
            Some(ThresholdType::Relative)
        } else if threshold > 1.0 {
            Some(ThresholdType::Absolute)
        } else {
            None
        };
        let threshold_type = match (implied, threshold_type) {
            (Some(implied), Some(explicit)) if implied != explicit => {
                return Err(AggregatorError::ConflictingThresholdType {
                    threshold,
                    threshold_type: explicit,
                })
            }
            (Some(implied), _) => implied,
            (None, Some(explicit)) => explicit,
            (None, None) => {
                debug!("threshold 1 waits for every active node");
                ThresholdType::Relative
            }
        };
        Ok(Self {
            core: AggregatorCore::new(round_cutoff, 1),
            threshold,
            threshold_type,
            min_participants: None,
        })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn threshold_type(&self) -> ThresholdType {
        self.threshold_type
    }

    /// Sets the minimal number of active nodes required to aggregate.
    pub fn set_min_participants(&mut self, min_participants: Option<usize>) {
        self.min_participants = min_participants;
    }
}

impl Aggregator for MeanAggregator {
    fn core(&self) -> &AggregatorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut AggregatorCore {
        &mut self.core
    }

    fn is_full(&self) -> bool {
        let nodes = self.core.nodes().len();
        if self.min_participants.map_or(false, |min| nodes < min) {
            return false;
        }
        let received = self.core.contributions(0).map_or(0, BTreeMap::len) as f64;
        match self.threshold_type {
            ThresholdType::Relative => received >= self.threshold * nodes as f64,
            ThresholdType::Absolute => received >= self.threshold,
        }
    }

    fn compute(&mut self) -> Result<WeightsContainer, AggregatorError> {
        let contributions = self
            .core
            .contributions(0)
            .ok_or(AggregatorError::NothingToAggregate(0))?;
        let result = aggregation::avg(contributions.values())?;
        self.core.set_model_weights(&result);
        Ok(result)
    }

    fn make_payloads(
        &self,
        weights: &WeightsContainer,
    ) -> Result<BTreeMap<NodeId, WeightsContainer>, AggregatorError> {
        Ok(self
            .core
            .nodes()
            .iter()
            .map(|node| (node.clone(), weights.clone()))
            .collect())
    }

    fn payload_kind(&self, _communication_round: usize) -> PayloadKind {
        PayloadKind::Weights
    }
}
