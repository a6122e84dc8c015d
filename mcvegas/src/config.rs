//! Configuration records for the adaptive integrators.
//!
//! All records are plain serde structs so they can be embedded in checkpoints and loaded from
//! JSON run cards. Validation never clamps a value silently; the only documented clamp is the
//! channel weight floor applied during refinement.

use serde::{Deserialize, Serialize};
use std::io::Read;

use crate::error::{Error, Result};
use crate::stream::SeedScheme;

/// The grid refinement formula.
///
/// Two published variants of the VEGAS rebinning step exist; a run uses exactly one of them and
/// the choice is stored in its checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Refinement {
    /// Lepage's original rebinning: new edges interpolate linearly inside the old bin that
    /// contains the target importance.
    #[default]
    Classic,
    /// The rebinning used by the Cuba library: the slope uses the mean importance of the
    /// current and previous bin and new edges are kept monotone.
    Cuba,
}

/// Parameters of the VEGAS importance sampling grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VegasConfig {
    /// Number of bins per dimension.
    pub bins: usize,
    /// Damping exponent. `0` disables adaptation, larger values adapt faster.
    pub alpha: f64,
    pub refinement: Refinement,
}

impl Default for VegasConfig {
    fn default() -> Self {
        VegasConfig {
            bins: 128,
            alpha: 1.5,
            refinement: Refinement::Classic,
        }
    }
}

impl VegasConfig {
    /// Creates a configuration with the classic refinement formula.
    pub fn new(bins: usize, alpha: f64) -> Self {
        VegasConfig {
            bins,
            alpha,
            refinement: Refinement::Classic,
        }
    }

    /// Selects the refinement formula.
    pub fn with_refinement(mut self, refinement: Refinement) -> Self {
        self.refinement = refinement;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.bins == 0 {
            return Err(Error::config("the number of bins must be positive"));
        }
        if !self.alpha.is_finite() || self.alpha < 0.0 {
            return Err(Error::config(format!(
                "alpha must be finite and non-negative, got {}",
                self.alpha
            )));
        }
        Ok(())
    }
}

/// Parameters of the channel weight adaptation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Adaptation exponent in `[0, 1]`; `0` freezes the weights.
    pub beta: f64,
    /// Floor applied to every enabled channel weight after refinement.
    pub min_weight: f64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            beta: 0.25,
            min_weight: 0.0,
        }
    }
}

impl ChannelConfig {
    pub fn new(beta: f64, min_weight: f64) -> Self {
        ChannelConfig { beta, min_weight }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.beta) {
            return Err(Error::config(format!(
                "beta must lie in [0, 1], got {}",
                self.beta
            )));
        }
        if !self.min_weight.is_finite() || self.min_weight < 0.0 {
            return Err(Error::config(format!(
                "the minimum channel weight must be finite and non-negative, got {}",
                self.min_weight
            )));
        }
        Ok(())
    }
}

/// Settings of a whole integration run, typically loaded from a JSON run card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Number of integrand calls for each iteration.
    pub iteration_calls: Vec<usize>,
    pub seed: u64,
    pub seed_scheme: SeedScheme,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            iteration_calls: vec![100_000; 10],
            seed: 0,
            seed_scheme: SeedScheme::Independent,
        }
    }
}

impl RunConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: RunConfig = serde_json::from_str(json)
            .map_err(|err| Error::config(format!("invalid run configuration: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let config: RunConfig = serde_json::from_reader(reader)
            .map_err(|err| Error::config(format!("invalid run configuration: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_iteration_calls(&self.iteration_calls)
    }
}

pub(crate) fn validate_iteration_calls(iteration_calls: &[usize]) -> Result<()> {
    if iteration_calls.is_empty() {
        return Err(Error::config("at least one iteration must be requested"));
    }
    if let Some(index) = iteration_calls.iter().position(|&calls| calls == 0) {
        return Err(Error::config(format!(
            "iteration {index} requests zero calls"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(VegasConfig::default().validate().is_ok());
        assert!(ChannelConfig::default().validate().is_ok());
        assert!(RunConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert!(VegasConfig::new(0, 1.5).validate().is_err());
        assert!(VegasConfig::new(10, -0.1).validate().is_err());
        assert!(VegasConfig::new(10, f64::NAN).validate().is_err());
        assert!(ChannelConfig::new(1.5, 0.0).validate().is_err());
        assert!(ChannelConfig::new(0.5, -1e-3).validate().is_err());
    }

    #[test]
    fn run_config_from_json() {
        let config = RunConfig::from_json_str(
            r#"{ "iteration_calls": [1000, 2000], "seed": 7, "seed_scheme": "shared" }"#,
        )
        .unwrap();
        assert_eq!(config.iteration_calls, vec![1000, 2000]);
        assert_eq!(config.seed, 7);
        assert_eq!(config.seed_scheme, SeedScheme::Shared);

        let err = RunConfig::from_json_str(r#"{ "iteration_calls": [1000, 0] }"#).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn vegas_config_round_trips_through_json() {
        let config = VegasConfig::new(64, 0.75).with_refinement(Refinement::Cuba);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"cuba\""));
        let back: VegasConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
