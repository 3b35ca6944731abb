use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Numerical settings of a math container.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Relative step of the central difference quotient.
    pub derivation_factor: f64,
    /// Smallest absolute step of the central difference quotient.
    pub derivation_resolution: f64,
    /// Absolute tolerance before scaling by compartment volumes.
    pub absolute_tolerance: f64,
    /// Bound on events processed at a single time point.
    pub max_event_cascade: usize,
    /// Number of recorded states kept for delay interpolation.
    pub history_capacity: usize,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            derivation_factor: 1e-3,
            derivation_resolution: 1e-12,
            absolute_tolerance: 1e-12,
            max_event_cascade: 1000,
            history_capacity: 4096,
        }
    }
}

impl ContainerSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.derivation_factor.is_finite() && self.derivation_factor > 0.0) {
            bail!("derivation_factor must be positive.");
        }
        if !(self.derivation_resolution.is_finite() && self.derivation_resolution > 0.0) {
            bail!("derivation_resolution must be positive.");
        }
        if !(self.absolute_tolerance.is_finite() && self.absolute_tolerance > 0.0) {
            bail!("absolute_tolerance must be positive.");
        }
        if self.max_event_cascade == 0 {
            bail!("max_event_cascade must be greater than zero.");
        }
        if self.history_capacity < 2 {
            bail!("history_capacity must hold at least two states.");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ContainerSettings::default()
            .validate()
            .expect("default settings should validate");
    }

    #[test]
    fn rejects_non_positive_steps() {
        let settings = ContainerSettings {
            derivation_factor: 0.0,
            ..ContainerSettings::default()
        };
        let err = settings.validate().expect_err("zero factor must fail");
        assert!(err.to_string().contains("derivation_factor"));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let settings: ContainerSettings =
            serde_json::from_str(r#"{ "max_event_cascade": 5 }"#).expect("valid json");
        assert_eq!(settings.max_event_cascade, 5);
        assert_eq!(settings.history_capacity, 4096);
    }
}
