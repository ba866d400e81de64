use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::liveness::{BlinkConfig, BlinkConfigError};

/// Orchestration parameters, fixed for the lifetime of an orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub blink: BlinkConfig,
    /// Blinks required to pass the challenge.
    pub required_blinks: u32,
    /// Wall-clock limit for the challenge, measured from entering it.
    #[serde(with = "millis")]
    pub challenge_deadline: Duration,
    /// Limit for model initialization on `start()`.
    #[serde(with = "millis")]
    pub model_load_timeout: Duration,
    /// Limit for a single storage submission.
    #[serde(with = "millis")]
    pub submission_timeout: Duration,
    /// Pacing of the frame loop.
    #[serde(with = "millis")]
    pub frame_interval: Duration,
    /// Consecutive detection failures tolerated before giving up.
    pub max_consecutive_model_errors: u32,
    /// Capture the still as soon as exactly one face is in view.
    pub auto_capture: bool,
    /// Expected descriptor dimension, if the model is known.
    pub descriptor_len: Option<usize>,
    /// JPEG quality of the still (1-100).
    pub still_quality: u8,
    /// Mirror the still horizontally.
    pub mirror_still: bool,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            blink: BlinkConfig::default(),
            required_blinks: 2,
            challenge_deadline: Duration::from_secs(20),
            model_load_timeout: Duration::from_secs(15),
            submission_timeout: Duration::from_secs(30),
            frame_interval: Duration::from_millis(33),
            max_consecutive_model_errors: 3,
            auto_capture: false,
            descriptor_len: None,
            still_quality: 95,
            mirror_still: true,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error(transparent)]
    Blink(#[from] BlinkConfigError),
    #[error("required_blinks must be at least 1")]
    NoBlinksRequired,
    #[error("max_consecutive_model_errors must be at least 1")]
    NoModelErrorBudget,
    #[error("descriptor_len must be non-zero")]
    ZeroDescriptorLen,
    #[error("frame_interval must be non-zero")]
    ZeroFrameInterval,
}

impl LivenessConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.blink.validate()?;
        if self.required_blinks == 0 {
            return Err(ConfigError::NoBlinksRequired);
        }
        if self.max_consecutive_model_errors == 0 {
            return Err(ConfigError::NoModelErrorBudget);
        }
        if self.descriptor_len == Some(0) {
            return Err(ConfigError::ZeroDescriptorLen);
        }
        if self.frame_interval.is_zero() {
            return Err(ConfigError::ZeroFrameInterval);
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        LivenessConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_zero_required_blinks() {
        let config = LivenessConfig {
            required_blinks: 0,
            ..LivenessConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoBlinksRequired));
    }

    #[test]
    fn test_surfaces_blink_errors() {
        let mut config = LivenessConfig::default();
        config.blink.open_threshold = 0.1;
        assert!(matches!(config.validate(), Err(ConfigError::Blink(_))));
    }

    #[test]
    fn test_rejects_zero_descriptor_len() {
        let config = LivenessConfig {
            descriptor_len: Some(0),
            ..LivenessConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroDescriptorLen));
    }
}
