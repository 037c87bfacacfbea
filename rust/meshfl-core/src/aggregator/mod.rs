//! Aggregators.
//!
//! An aggregator collects the contributions of the active nodes of a round and
//! combines them once enough of them arrived. The bookkeeping shared by every
//! aggregation scheme lives in [`AggregatorCore`]:
//!
//! - the round and communication round counters. A scheme that needs several
//!   exchanges per round (see [`SecureAggregator`]) advances the communication
//!   round after every exchange and the round once the communication round wraps.
//! - the set of active nodes. Contributions from other nodes are rejected.
//! - the round cutoff. A contribution for round `r` is accepted iff
//!   `current_round - r <= round_cutoff`.
//! - the contributions, at most one per node and communication round.
//! - the result future, resolved with the aggregate of each exchange and replaced
//!   right after.
//!
//! The scheme-specific parts are provided by implementors of the [`Aggregator`]
//! trait.

pub mod mean;
pub mod secure;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use futures::{
    channel::oneshot,
    future::{FutureExt, Shared},
};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use self::{
    mean::{MeanAggregator, ThresholdType},
    secure::SecureAggregator,
};
use crate::{
    message::PayloadKind,
    weights::{WeightsContainer, WeightsError},
    NodeId,
};

/// A future that resolves to the aggregate of one exchange.
///
/// It resolves to an error if the exchange was abandoned, i.e. if the aggregator
/// skipped to a later round before the exchange completed.
pub type ResultFuture = Shared<oneshot::Receiver<WeightsContainer>>;

#[derive(Debug, Error)]
/// Errors related to aggregators.
pub enum AggregatorError {
    #[error("invalid threshold {0}: it must be positive and integral when greater than 1")]
    InvalidThreshold(f64),
    #[error("threshold type {threshold_type:?} conflicts with threshold {threshold}")]
    ConflictingThresholdType {
        threshold: f64,
        threshold_type: ThresholdType,
    },
    #[error("invalid maximum share value {0}: it must be positive and finite")]
    InvalidMaxShareValue(f32),
    #[error("missing required parameter `{0}`")]
    MissingParameter(&'static str),
    #[error("the {0} aggregation scheme is not supported")]
    Unsupported(&'static str),
    #[error("too few participants to generate shares")]
    TooFewParticipants,
    #[error("no contribution to aggregate in communication round {0}")]
    NothingToAggregate(usize),
    #[error(transparent)]
    Weights(#[from] WeightsError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The state of an aggregator right after an exchange completed.
pub struct RoundEvent {
    /// The new round.
    pub round: u64,
    /// The new communication round.
    pub communication_round: usize,
    /// The number of contributions of the completed exchange.
    pub participants: usize,
}

#[cfg_attr(test, mockall::automock)]
/// A model whose weights are replaced by the final aggregate of every round.
pub trait HeldModel: Send {
    fn set_weights(&mut self, weights: &WeightsContainer);
}

#[cfg_attr(test, mockall::automock)]
/// A callback invoked whenever an aggregator advances.
pub trait Observer: Send {
    fn on_round(&mut self, event: &RoundEvent);
}

/// The state shared by every aggregation scheme.
pub struct AggregatorCore {
    nodes: BTreeSet<NodeId>,
    contributions: HashMap<usize, BTreeMap<NodeId, WeightsContainer>>,
    round: u64,
    communication_round: usize,
    communication_rounds: usize,
    round_cutoff: u64,
    result_tx: Option<oneshot::Sender<WeightsContainer>>,
    result_rx: ResultFuture,
    model: Option<Box<dyn HeldModel>>,
    observer: Option<Box<dyn Observer>>,
}

impl AggregatorCore {
    /// Creates a core for a scheme with `communication_rounds` exchanges per round.
    pub fn new(round_cutoff: u64, communication_rounds: usize) -> Self {
        let (result_tx, result_rx) = oneshot::channel();
        Self {
            nodes: BTreeSet::new(),
            contributions: HashMap::new(),
            round: 0,
            communication_round: 0,
            communication_rounds: communication_rounds.max(1),
            round_cutoff,
            result_tx: Some(result_tx),
            result_rx: result_rx.shared(),
            model: None,
            observer: None,
        }
    }

    /// Sets the model that receives the final aggregate of every round.
    pub fn set_model(&mut self, model: Box<dyn HeldModel>) {
        self.model = Some(model);
    }

    /// Sets the observer notified whenever the aggregator advances.
    pub fn set_observer(&mut self, observer: Box<dyn Observer>) {
        self.observer = Some(observer);
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn communication_round(&self) -> usize {
        self.communication_round
    }

    pub fn communication_rounds(&self) -> usize {
        self.communication_rounds
    }

    pub fn round_cutoff(&self) -> u64 {
        self.round_cutoff
    }

    /// Gets the active nodes.
    pub fn nodes(&self) -> &BTreeSet<NodeId> {
        &self.nodes
    }

    /// Replaces the active nodes.
    pub fn set_nodes<I>(&mut self, nodes: I)
    where
        I: IntoIterator<Item = NodeId>,
    {
        self.nodes = nodes.into_iter().collect();
    }

    /// Adds a node to the active nodes. Returns whether the node was new.
    pub fn register_node(&mut self, node: NodeId) -> bool {
        self.nodes.insert(node)
    }

    /// Removes every active node.
    pub fn reset_nodes(&mut self) {
        self.nodes.clear();
    }

    /// Gets the contributions stored for a communication round.
    pub fn contributions(&self, communication_round: usize) -> Option<&BTreeMap<NodeId, WeightsContainer>> {
        self.contributions.get(&communication_round)
    }

    /// Gets the number of contributions over all communication rounds.
    pub fn size(&self) -> usize {
        self.contributions.values().map(BTreeMap::len).sum()
    }

    /// Checks whether a contribution for `round` is recent enough.
    ///
    /// Contributions for future rounds are always recent enough.
    pub fn is_within_round_cutoff(&self, round: u64) -> bool {
        self.round.saturating_sub(round) <= self.round_cutoff
    }

    /// Checks whether `node` may contribute for `round`.
    pub fn is_valid_contribution(&self, node: &NodeId, round: u64) -> bool {
        self.nodes.contains(node) && self.is_within_round_cutoff(round)
    }

    /// Stores a contribution, replacing an earlier one from the same node.
    pub fn insert(&mut self, communication_round: usize, node: NodeId, contribution: WeightsContainer) {
        self.contributions
            .entry(communication_round)
            .or_default()
            .insert(node, contribution);
    }

    /// Gets the future resolving to the aggregate of the current exchange.
    ///
    /// Every call before that exchange completes returns the same future.
    pub fn receive_result(&self) -> ResultFuture {
        self.result_rx.clone()
    }

    /// Skips ahead to `round`.
    ///
    /// Rounds never decrease: a `round` that is not ahead of the current one is
    /// ignored. Skipping ahead discards the contributions of the unfinished round
    /// and abandons its result future.
    pub fn set_round(&mut self, round: u64) {
        if round <= self.round {
            return;
        }
        debug!("skipping from round {} to round {}", self.round, round);
        self.round = round;
        self.communication_round = 0;
        self.contributions.clear();
        self.rearm();
    }

    /// Writes `weights` into the held model, if any.
    pub fn set_model_weights(&mut self, weights: &WeightsContainer) {
        if let Some(model) = self.model.as_mut() {
            model.set_weights(weights);
        }
    }

    /// Resolves the current result future with `result`.
    fn resolve(&mut self, result: WeightsContainer) {
        if let Some(tx) = self.result_tx.take() {
            // nobody awaits the result if every clone of the future was dropped
            let _ = tx.send(result);
        }
    }

    fn rearm(&mut self) {
        let (result_tx, result_rx) = oneshot::channel();
        self.result_tx = Some(result_tx);
        self.result_rx = result_rx.shared();
    }

    /// Advances to the next communication round, or to the next round once every
    /// exchange of the current round completed.
    pub fn next_round(&mut self) -> RoundEvent {
        let participants = self
            .contributions(self.communication_round)
            .map_or(0, BTreeMap::len);
        self.communication_round = (self.communication_round + 1) % self.communication_rounds;
        if self.communication_round == 0 {
            self.round += 1;
            self.contributions.clear();
        }
        self.rearm();

        let event = RoundEvent {
            round: self.round,
            communication_round: self.communication_round,
            participants,
        };
        if let Some(observer) = self.observer.as_mut() {
            observer.on_round(&event);
        }
        event
    }
}

/// An aggregation scheme.
pub trait Aggregator: Send {
    fn core(&self) -> &AggregatorCore;

    fn core_mut(&mut self) -> &mut AggregatorCore;

    /// Checks whether enough contributions arrived to aggregate the current exchange.
    fn is_full(&self) -> bool;

    /// Computes the aggregate of the current exchange.
    fn compute(&mut self) -> Result<WeightsContainer, AggregatorError>;

    /// Computes what to send to each active node in the current exchange, given the
    /// local value for that exchange.
    fn make_payloads(
        &self,
        weights: &WeightsContainer,
    ) -> Result<BTreeMap<NodeId, WeightsContainer>, AggregatorError>;

    /// Gets the kind of payload exchanged in a communication round.
    fn payload_kind(&self, communication_round: usize) -> PayloadKind;

    /// Adds a contribution and aggregates if the exchange is complete.
    ///
    /// Returns `false` without touching any state if the contribution is rejected:
    /// its sender is not active, its round is older than the cutoff allows or its
    /// communication round doesn't exist.
    ///
    /// # Errors
    /// Fails if the contribution was accepted but the aggregation failed.
    fn add(
        &mut self,
        node: &NodeId,
        contribution: WeightsContainer,
        round: u64,
        communication_round: usize,
    ) -> Result<bool, AggregatorError> {
        let core = self.core();
        if !core.is_valid_contribution(node, round) {
            debug!(
                "rejecting contribution from node {} for round {} (current round {})",
                node,
                round,
                core.round()
            );
            return Ok(false);
        }
        if communication_round >= core.communication_rounds() {
            warn!(
                "rejecting contribution from node {} for unknown communication round {}",
                node, communication_round
            );
            return Ok(false);
        }

        debug!(
            "adding contribution from node {} for round ({}, {})",
            node, communication_round, round
        );
        self.core_mut()
            .insert(communication_round, node.clone(), contribution);
        if self.is_full() {
            self.aggregate()?;
        }
        Ok(true)
    }

    /// Aggregates the current exchange, resolves the result future and advances.
    fn aggregate(&mut self) -> Result<RoundEvent, AggregatorError> {
        info!(
            "buffer is full, aggregating for round ({}, {})",
            self.core().communication_round(),
            self.core().round()
        );
        let result = self.compute()?;
        let core = self.core_mut();
        core.resolve(result);
        Ok(core.next_round())
    }

    /// Gets the future resolving to the aggregate of the current exchange.
    fn receive_result(&self) -> ResultFuture {
        self.core().receive_result()
    }
}

fn default_threshold() -> f64 {
    1.0
}

fn default_max_share_value() -> f32 {
    secure::DEFAULT_MAX_SHARE_VALUE
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
/// The aggregation scheme and its parameters.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [aggregator]
/// scheme = "mean"
/// threshold = 1.0
/// threshold_type = "absolute"
/// round_cutoff = 0
/// min_participants = 2
/// ```
///
/// **Environment variable**
/// ```text
/// MESHFL_AGGREGATOR__SCHEME=secure
/// MESHFL_AGGREGATOR__MAX_SHARE_VALUE=100
/// ```
pub enum AggregatorSettings {
    /// Averaging of full updates.
    Mean {
        /// The fraction of active nodes (`<= 1`) or the number of nodes (`> 1`)
        /// whose contributions are required to aggregate.
        #[serde(default = "default_threshold")]
        threshold: f64,
        /// Disambiguates a threshold of 1. Inferred from the threshold otherwise.
        #[serde(default)]
        threshold_type: Option<ThresholdType>,
        #[serde(default)]
        round_cutoff: u64,
        /// The minimal number of active nodes required to aggregate.
        #[serde(default)]
        min_participants: Option<usize>,
    },
    /// Averaging of additively secret-shared updates.
    Secure {
        #[serde(default = "default_max_share_value")]
        max_share_value: f32,
    },
    /// Byzantine-robust aggregation. Not supported.
    Robust {
        #[serde(default)]
        tau_percentile: Option<f64>,
        #[serde(default)]
        round_cutoff: u64,
    },
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        AggregatorSettings::Mean {
            threshold: default_threshold(),
            threshold_type: None,
            round_cutoff: 0,
            min_participants: None,
        }
    }
}

impl AggregatorSettings {
    /// Creates the configured aggregator.
    ///
    /// # Errors
    /// Fails if a parameter is invalid or if the scheme is not supported.
    pub fn build(&self) -> Result<Box<dyn Aggregator>, AggregatorError> {
        match *self {
            AggregatorSettings::Mean {
                threshold,
                threshold_type,
                round_cutoff,
                min_participants,
            } => {
                let mut aggregator =
                    MeanAggregator::with_threshold_type(threshold, threshold_type, round_cutoff)?;
                aggregator.set_min_participants(min_participants);
                Ok(Box::new(aggregator))
            }
            AggregatorSettings::Secure { max_share_value } => {
                Ok(Box::new(SecureAggregator::new(max_share_value)?))
            }
            AggregatorSettings::Robust {
                tau_percentile: None,
                ..
            } => Err(AggregatorError::MissingParameter("tau_percentile")),
            AggregatorSettings::Robust { .. } => Err(AggregatorError::Unsupported("robust")),
        }
    }
}
