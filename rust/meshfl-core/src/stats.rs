//! Participation statistics.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::aggregator::{Observer, RoundEvent};

#[derive(Debug, Clone, Default, PartialEq)]
/// Statistics over the completed rounds of an aggregator or a buffer.
pub struct AggregatorStats {
    /// The number of completed rounds.
    pub round: u64,
    /// The number of participants of the last completed round.
    pub current_participants: usize,
    /// The number of participants over all completed rounds.
    pub total_participants: usize,
    /// The average number of participants per completed round.
    pub average_participants: f64,
}

#[derive(Debug, Clone, Default)]
/// An [`Observer`] collecting [`AggregatorStats`].
///
/// Clones share the same statistics, so one clone can be handed to an aggregator
/// while another one is kept to read them.
pub struct Informant(Arc<Mutex<AggregatorStats>>);

impl Informant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a snapshot of the statistics.
    pub fn stats(&self) -> AggregatorStats {
        self.0
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }
}

impl Observer for Informant {
    fn on_round(&mut self, event: &RoundEvent) {
        // only the completion of a whole round counts
        if event.communication_round != 0 {
            return;
        }
        if let Ok(mut stats) = self.0.lock() {
            stats.round += 1;
            stats.current_participants = event.participants;
            stats.total_participants += event.participants;
            stats.average_participants = stats.total_participants as f64 / stats.round as f64;
            debug!(
                "round {} completed with {} participants",
                event.round, event.participants
            );
        }
    }
}
