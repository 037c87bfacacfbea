//! Averaging of additively secret-shared updates.

use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::debug;

use crate::{
    aggregation,
    aggregator::{Aggregator, AggregatorCore, AggregatorError},
    message::PayloadKind,
    weights::WeightsContainer,
    NodeId,
};

/// The default bound of the random shares.
pub const DEFAULT_MAX_SHARE_VALUE: f32 = 100.0;

/// An aggregator averaging updates without revealing them.
///
/// A round consists of two exchanges:
///
/// 0. every node splits its update into one additive share per active node and
///    sends one share to each of them. The aggregator sums the shares it receives
///    into a partial sum.
/// 1. every node broadcasts its partial sum. The aggregator averages the partial
///    sums, which yields the average of the updates.
///
/// Both exchanges require a contribution from every active node. Contributions
/// must belong to the current round.
pub struct SecureAggregator {
    core: AggregatorCore,
    max_share_value: f32,
}

impl SecureAggregator {
    /// Creates a secure aggregator whose random shares lie in
    /// `[-max_share_value, max_share_value]`.
    ///
    /// # Errors
    /// Fails if `max_share_value` is not positive.
    pub fn new(max_share_value: f32) -> Result<Self, AggregatorError> {
        if !max_share_value.is_finite() || max_share_value <= 0.0 {
            return Err(AggregatorError::InvalidMaxShareValue(max_share_value));
        }
        Ok(Self {
            core: AggregatorCore::new(0, 2),
            max_share_value,
        })
    }

    pub fn max_share_value(&self) -> f32 {
        self.max_share_value
    }
}

/// Splits `secret` into `count` additive shares.
///
/// The first `count - 1` shares are drawn uniformly at random from
/// `[-max_share_value, max_share_value]`, the last one completes the sum.
///
/// # Errors
/// Fails if `count` is zero.
pub fn generate_shares<R: Rng + ?Sized>(
    secret: &WeightsContainer,
    count: usize,
    max_share_value: f32,
    rng: &mut R,
) -> Result<Vec<WeightsContainer>, AggregatorError> {
    if count == 0 {
        return Err(AggregatorError::TooFewParticipants);
    }
    let mut shares: Vec<WeightsContainer> = (1..count)
        .map(|_| secret.map(|_| rng.gen_range(-max_share_value..=max_share_value)))
        .collect();
    let last = match aggregation::sum(&shares) {
        Ok(random) => secret.sub(&random)?,
        Err(_) => secret.clone(),
    };
    shares.push(last);
    Ok(shares)
}

impl Aggregator for SecureAggregator {
    fn core(&self) -> &AggregatorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut AggregatorCore {
        &mut self.core
    }

    fn is_full(&self) -> bool {
        self.core
            .contributions(self.core.communication_round())
            .map_or(0, BTreeMap::len)
            == self.core.nodes().len()
    }

    fn compute(&mut self) -> Result<WeightsContainer, AggregatorError> {
        let communication_round = self.core.communication_round();
        let contributions = self
            .core
            .contributions(communication_round)
            .ok_or(AggregatorError::NothingToAggregate(communication_round))?;
        if communication_round == 0 {
            debug!("summing {} shares", contributions.len());
            Ok(aggregation::sum(contributions.values())?)
        } else {
            debug!("averaging {} partial sums", contributions.len());
            let result = aggregation::avg(contributions.values())?;
            self.core.set_model_weights(&result);
            Ok(result)
        }
    }

    fn make_payloads(
        &self,
        weights: &WeightsContainer,
    ) -> Result<BTreeMap<NodeId, WeightsContainer>, AggregatorError> {
        let nodes = self.core.nodes();
        if self.core.communication_round() == 0 {
            let mut rng = ChaCha20Rng::from_entropy();
            let shares = generate_shares(weights, nodes.len(), self.max_share_value, &mut rng)?;
            Ok(nodes.iter().cloned().zip(shares).collect())
        } else {
            Ok(nodes
                .iter()
                .map(|node| (node.clone(), weights.clone()))
                .collect())
        }
    }

    fn payload_kind(&self, communication_round: usize) -> PayloadKind {
        if communication_round == 0 {
            PayloadKind::Shares
        } else {
            PayloadKind::PartialSums
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::*;
    use crate::aggregator::MockHeldModel;

    fn ids() -> Vec<NodeId> {
        vec![NodeId::from("a"), NodeId::from("b"), NodeId::from("c")]
    }

    #[test]
    fn test_invalid_max_share_value() {
        assert!(matches!(
            SecureAggregator::new(0.0),
            Err(AggregatorError::InvalidMaxShareValue(_))
        ));
        assert!(SecureAggregator::new(-1.0).is_err());
    }

    #[test]
    fn test_shares_sum_to_secret() {
        let secret = WeightsContainer::from(vec![vec![1.0, 2.0, 3.0, -1.0], vec![-5.0, 6.0]]);
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let shares = generate_shares(&secret, 5, 100.0, &mut rng).unwrap();
        assert_eq!(shares.len(), 5);
        assert!(shares[..4].iter().all(|share| share
            .tensors()
            .iter()
            .flat_map(|t| t.values().iter())
            .all(|v| v.abs() <= 100.0)));
        assert!(aggregation::sum(&shares).unwrap().approx_eq(&secret, 1e-3));

        let single = generate_shares(&secret, 1, 100.0, &mut rng).unwrap();
        assert_eq!(single, vec![secret]);
    }

    #[test]
    fn test_no_participants() {
        let aggregator = SecureAggregator::new(100.0).unwrap();
        assert!(matches!(
            aggregator.make_payloads(&WeightsContainer::from(vec![vec![1.0]])),
            Err(AggregatorError::TooFewParticipants)
        ));
    }

    #[test]
    fn test_secure_round_trip() {
        let secrets = vec![
            WeightsContainer::from(vec![vec![1.0, 2.0, 3.0, -1.0], vec![-5.0, 6.0]]),
            WeightsContainer::from(vec![vec![2.0, 3.0, 7.0, 1.0], vec![-10.0, 5.0]]),
            WeightsContainer::from(vec![vec![3.0, 1.0, 5.0, 3.0], vec![-15.0, 19.0]]),
        ];
        let expected = WeightsContainer::from(vec![vec![2.0, 2.0, 5.0, 1.0], vec![-10.0, 10.0]]);

        let mut aggregators: Vec<SecureAggregator> = ids()
            .into_iter()
            .map(|_| {
                let mut aggregator = SecureAggregator::new(DEFAULT_MAX_SHARE_VALUE).unwrap();
                aggregator.core_mut().set_nodes(ids());
                let mut model = MockHeldModel::new();
                model.expect_set_weights().times(1).return_const(());
                aggregator.core_mut().set_model(Box::new(model));
                aggregator
            })
            .collect();

        // exchange shares
        let results: Vec<_> = aggregators.iter().map(|a| a.receive_result()).collect();
        let payloads: Vec<_> = aggregators
            .iter()
            .zip(secrets.iter())
            .map(|(aggregator, secret)| aggregator.make_payloads(secret).unwrap())
            .collect();
        for (sender, payloads) in ids().iter().zip(payloads) {
            for (receiver, share) in payloads {
                let index = ids().iter().position(|id| *id == receiver).unwrap();
                assert!(aggregators[index].add(sender, share, 0, 0).unwrap());
            }
        }
        let partial_sums: Vec<WeightsContainer> = results
            .into_iter()
            .map(|result| block_on(result).unwrap())
            .collect();
        assert!(aggregators
            .iter()
            .all(|a| a.core().communication_round() == 1 && a.core().round() == 0));

        // exchange partial sums
        let results: Vec<_> = aggregators.iter().map(|a| a.receive_result()).collect();
        for (sender, partial_sum) in ids().iter().zip(partial_sums) {
            let payloads = aggregators[0].make_payloads(&partial_sum).unwrap();
            for (index, (_, payload)) in payloads.into_iter().enumerate() {
                assert!(aggregators[index].add(sender, payload, 0, 1).unwrap());
            }
        }
        for result in results {
            assert!(block_on(result).unwrap().approx_eq(&expected, 1e-3));
        }
        assert!(aggregators
            .iter()
            .all(|a| a.core().communication_round() == 0 && a.core().round() == 1));
    }

    #[test]
    fn test_stale_round_rejected() {
        let mut aggregator = SecureAggregator::new(DEFAULT_MAX_SHARE_VALUE).unwrap();
        aggregator.core_mut().set_nodes(ids());
        aggregator.core_mut().set_round(2);
        let share = WeightsContainer::from(vec![vec![1.0]]);
        assert!(!aggregator.add(&NodeId::from("a"), share.clone(), 1, 0).unwrap());
        assert!(aggregator.add(&NodeId::from("a"), share, 2, 0).unwrap());
    }
}
