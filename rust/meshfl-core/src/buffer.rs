//! A contribution buffer for asynchronous aggregation.
//!
//! Unlike an [`Aggregator`], an [`AsyncBuffer`] doesn't coordinate exchanges
//! between peers: it simply collects contributions until it holds enough of them
//! and hands them over to a [`BufferSink`].
//!
//! [`Aggregator`]: crate::aggregator::Aggregator

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    aggregation,
    aggregator::{HeldModel, Observer, RoundEvent},
    weights::{WeightsContainer, WeightsError},
    NodeId,
};

#[async_trait]
/// The consumer of the contributions of a full [`AsyncBuffer`].
pub trait BufferSink<T: Send + 'static>: Send {
    type Error: Send;

    /// Aggregates the contributions of a round and stores the result.
    async fn aggregate_and_store(&mut self, values: Vec<T>) -> Result<(), Self::Error>;
}

/// A [`BufferSink`] averaging weights into a model.
pub struct MeanSink<M> {
    model: M,
}

impl<M: HeldModel> MeanSink<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }
}

#[async_trait]
impl<M: HeldModel> BufferSink<WeightsContainer> for MeanSink<M> {
    type Error = WeightsError;

    async fn aggregate_and_store(&mut self, values: Vec<WeightsContainer>) -> Result<(), Self::Error> {
        let result = aggregation::avg(&values)?;
        self.model.set_weights(&result);
        Ok(())
    }
}

/// A capacity-bounded map from node to contribution.
///
/// A contribution for round `r` is accepted iff `round - r <= round_cutoff`. Once
/// the buffer holds `capacity - skip_count` contributions, they are handed over to
/// the sink, the round advances and the buffer is emptied.
pub struct AsyncBuffer<T, S> {
    capacity: usize,
    round_cutoff: u64,
    skip_count: usize,
    round: u64,
    buffer: HashMap<NodeId, T>,
    sink: S,
    observer: Option<Box<dyn Observer>>,
}

impl<T, S> AsyncBuffer<T, S>
where
    T: Send + 'static,
    S: BufferSink<T>,
{
    pub fn new(capacity: usize, round_cutoff: u64, sink: S) -> Self {
        Self {
            capacity,
            round_cutoff,
            skip_count: 0,
            round: 0,
            buffer: HashMap::new(),
            sink,
            observer: None,
        }
    }

    /// Lowers the number of contributions needed to aggregate by `skip_count`.
    pub fn set_skip_count(&mut self, skip_count: usize) {
        self.skip_count = skip_count;
    }

    pub fn set_observer(&mut self, observer: Box<dyn Observer>) {
        self.observer = Some(observer);
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.capacity.saturating_sub(self.skip_count)
    }

    pub fn is_within_round_cutoff(&self, round: u64) -> bool {
        self.round.saturating_sub(round) <= self.round_cutoff
    }

    /// Adds a contribution, replacing an earlier one from the same node.
    ///
    /// Returns `false` if the contribution is too old.
    ///
    /// # Errors
    /// Fails if the buffer became full and the sink failed. The contributions
    /// handed over to the sink are dropped and the round doesn't advance.
    pub async fn add(&mut self, node: NodeId, value: T, round: u64) -> Result<bool, S::Error> {
        if !self.is_within_round_cutoff(round) {
            debug!(
                "rejecting contribution from node {} for round {} (current round {})",
                node, round, self.round
            );
            return Ok(false);
        }
        debug!("adding contribution from node {} for round {}", node, round);
        self.buffer.insert(node, value);

        if self.is_full() {
            info!("buffer is full, aggregating for round {}", self.round);
            let values: Vec<T> = self.buffer.drain().map(|(_, value)| value).collect();
            let participants = values.len();
            self.sink.aggregate_and_store(values).await?;
            self.round += 1;
            if let Some(observer) = self.observer.as_mut() {
                observer.on_round(&RoundEvent {
                    round: self.round,
                    communication_round: 0,
                    participants,
                });
            }
        }
        Ok(true)
    }
}
