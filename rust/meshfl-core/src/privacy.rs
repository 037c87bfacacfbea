//! Privacy-preserving transformations of local updates.
//!
//! Before a node shares its update, the progress it made since the previous round
//! can be clipped to a maximal norm and the update can be noised with Gaussian
//! noise. Both bound how much the shared update reveals about the local data.

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;
use thiserror::Error;
use validator::{Validate, ValidationError};

use crate::weights::{WeightsContainer, WeightsError};

#[derive(Debug, Error)]
/// Errors related to the privacy transformation.
pub enum PrivacyError {
    #[error("invalid clipping radius {0}: it must be positive")]
    InvalidClippingRadius(f32),
    #[error("invalid noise scale {0}: it must be non-negative and finite")]
    InvalidNoiseScale(f32),
    #[error(transparent)]
    Weights(#[from] WeightsError),
}

/// A transformation applied to a local update before it leaves the node.
pub trait PrivacyTransform: Send + Sync {
    /// Transforms `update`, given the weights `stale` of the previous round.
    fn apply(
        &self,
        update: &WeightsContainer,
        stale: &WeightsContainer,
    ) -> Result<WeightsContainer, PrivacyError>;
}

#[derive(Debug, Clone, Default, PartialEq, Validate, Deserialize)]
#[validate(schema(function = "validate_privacy"))]
/// Clipping and noising settings. Both steps are optional.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [privacy]
/// clipping_radius = 1.0
/// noise_scale = 0.01
/// ```
pub struct PrivacySettings {
    /// The maximal Frobenius norm of the progress of a round.
    #[serde(default)]
    pub clipping_radius: Option<f32>,
    /// The standard deviation of the Gaussian noise added to every element.
    #[serde(default)]
    pub noise_scale: Option<f32>,
}

impl PrivacySettings {
    /// Checks the clipping radius and the noise scale.
    ///
    /// # Errors
    /// Fails if the radius is not positive or if the scale is negative or not
    /// finite.
    pub fn check(&self) -> Result<(), PrivacyError> {
        if let Some(radius) = self.clipping_radius {
            if !(radius.is_finite() && radius > 0.0) {
                return Err(PrivacyError::InvalidClippingRadius(radius));
            }
        }
        if let Some(scale) = self.noise_scale {
            if !(scale.is_finite() && scale >= 0.0) {
                return Err(PrivacyError::InvalidNoiseScale(scale));
            }
        }
        Ok(())
    }
}

fn validate_privacy(s: &PrivacySettings) -> Result<(), ValidationError> {
    s.check().map_err(|err| match err {
        PrivacyError::InvalidClippingRadius(_) => ValidationError::new("invalid clipping radius"),
        _ => ValidationError::new("invalid noise scale"),
    })
}

/// Scales `weights` down so that their Frobenius norm is at most `radius`.
pub fn clip_norm(weights: &WeightsContainer, radius: f32) -> WeightsContainer {
    let norm = weights.frobenius_norm();
    if norm <= radius || norm == 0.0 {
        weights.clone()
    } else {
        weights.scale(radius / norm)
    }
}

impl PrivacyTransform for PrivacySettings {
    fn apply(
        &self,
        update: &WeightsContainer,
        stale: &WeightsContainer,
    ) -> Result<WeightsContainer, PrivacyError> {
        self.check()?;
        let mut result = update.clone();

        if let Some(radius) = self.clipping_radius {
            let previous = if stale.is_empty() {
                update.zeros_like()
            } else {
                stale.clone()
            };
            let progress = update.sub(&previous)?;
            result = previous.add(&clip_norm(&progress, radius))?;
        }

        if let Some(scale) = self.noise_scale {
            let normal =
                Normal::new(0.0, scale).map_err(|_| PrivacyError::InvalidNoiseScale(scale))?;
            let mut rng = ChaCha20Rng::from_entropy();
            result = result.map(|value| value + normal.sample(&mut rng));
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights(values: &[f32]) -> WeightsContainer {
        WeightsContainer::from(vec![values.to_vec()])
    }

    #[test]
    fn test_identity() {
        let update = weights(&[3.0, 4.0]);
        let result = PrivacySettings::default()
            .apply(&update, &weights(&[0.0, 0.0]))
            .unwrap();
        assert_eq!(result, update);
    }

    #[test]
    fn test_clipping() {
        let settings = PrivacySettings {
            clipping_radius: Some(1.0),
            noise_scale: None,
        };
        let result = settings
            .apply(&weights(&[4.0, 5.0]), &weights(&[1.0, 1.0]))
            .unwrap();
        assert!(result.approx_eq(&weights(&[1.6, 1.8]), 1e-6));

        // small progress is left untouched
        let result = settings
            .apply(&weights(&[1.1, 1.0]), &weights(&[1.0, 1.0]))
            .unwrap();
        assert!(result.approx_eq(&weights(&[1.1, 1.0]), 1e-6));

        // without previous weights the whole update is clipped
        let result = settings
            .apply(&weights(&[3.0, 4.0]), &WeightsContainer::default())
            .unwrap();
        assert!(result.approx_eq(&weights(&[0.6, 0.8]), 1e-6));
    }

    #[test]
    fn test_noise() {
        let settings = PrivacySettings {
            clipping_radius: None,
            noise_scale: Some(1.0),
        };
        let update = weights(&[0.0; 64]);
        let result = settings.apply(&update, &update).unwrap();
        assert!(update.check_layout(&result).is_ok());
        assert!(result.frobenius_norm() > 0.0);

        let invalid = PrivacySettings {
            clipping_radius: None,
            noise_scale: Some(-1.0),
        };
        assert!(matches!(
            invalid.apply(&update, &update),
            Err(PrivacyError::InvalidNoiseScale(_))
        ));

        // no noise at all is fine
        let silent = PrivacySettings {
            clipping_radius: None,
            noise_scale: Some(0.0),
        };
        assert_eq!(silent.apply(&update, &update).unwrap(), update);
    }

    #[test]
    fn test_validation() {
        assert!(PrivacySettings::default().validate().is_ok());
        let valid = PrivacySettings {
            clipping_radius: Some(1.0),
            noise_scale: Some(0.1),
        };
        assert!(valid.validate().is_ok());

        for (clipping_radius, noise_scale) in &[
            (Some(0.0), None),
            (Some(f32::INFINITY), None),
            (None, Some(-1.0)),
            (None, Some(f32::NAN)),
        ] {
            let invalid = PrivacySettings {
                clipping_radius: *clipping_radius,
                noise_scale: *noise_scale,
            };
            assert!(invalid.validate().is_err());
            assert!(invalid.check().is_err());
        }
    }
}
