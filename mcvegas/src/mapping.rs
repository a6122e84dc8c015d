//! Density mappings: how uniform random numbers become weighted points.
//!
//! Every integrator variant is an [`Integrator`](crate::integrator::Integrator) driving one
//! [`Mapping`]. The mapping turns the uniform numbers of a point into coordinates and a weight,
//! records what the point contributed to the next adaptation, and refines itself between
//! iterations.

use serde::{Deserialize, Serialize};

use crate::channel::ChannelSummary;
use crate::config::{ChannelConfig, VegasConfig};
use crate::error::{Error, Result};
use crate::grid::Grid;

/// The four integrator variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingKind {
    Plain,
    Vegas,
    MultiChannel,
    MultiChannelVegas,
}

/// Bookkeeping of a single sampled point.
#[derive(Debug, Clone, Default)]
pub struct Sample {
    pub(crate) weight: f64,
    pub(crate) channel: Option<usize>,
    /// Grid bin of every dimension.
    pub(crate) bins: Vec<usize>,
    /// Density of every channel at the point.
    pub(crate) densities: Vec<f64>,
    /// Uniform numbers after the grid mapping, before the channel mapping.
    pub(crate) grid_draws: Vec<f64>,
    pub(crate) scratch: Vec<f64>,
}

impl Sample {
    pub(crate) fn new(bins: usize, channels: usize, grid_draws: usize) -> Self {
        Sample {
            weight: 1.0,
            channel: None,
            bins: vec![0; bins],
            densities: vec![0.0; channels],
            grid_draws: vec![0.0; grid_draws],
            scratch: vec![0.0; grid_draws],
        }
    }

    /// The inverse sampling density of the point.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn channel(&self) -> Option<usize> {
        self.channel
    }
}

/// Data gathered during one iteration and consumed by the following refinement.
///
/// The layout is defined by the mapping; adjustments of different workers or chunks are
/// combined by element-wise addition.
#[derive(Debug, Clone, PartialEq)]
pub struct Adjustment {
    data: Vec<f64>,
}

impl Adjustment {
    pub fn zeros(len: usize) -> Self {
        Adjustment {
            data: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn merge(&mut self, other: &Adjustment) {
        for (lhs, rhs) in self.data.iter_mut().zip(&other.data) {
            *lhs += rhs;
        }
    }
}

impl From<Vec<f64>> for Adjustment {
    fn from(data: Vec<f64>) -> Self {
        Adjustment { data }
    }
}

/// The adaptive state of a mapping as it is stored in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MappingState {
    Plain {
        dimensions: usize,
    },
    Vegas {
        dimensions: usize,
        config: VegasConfig,
        grids: Vec<Grid>,
    },
    MultiChannel {
        dimensions: usize,
        config: ChannelConfig,
        weights: Vec<f64>,
    },
    MultiChannelVegas {
        dimensions: usize,
        channel_config: ChannelConfig,
        vegas_config: VegasConfig,
        weights: Vec<f64>,
        /// One set of grids per channel.
        grids: Vec<Vec<Grid>>,
    },
}

impl MappingState {
    pub fn kind(&self) -> MappingKind {
        match self {
            MappingState::Plain { .. } => MappingKind::Plain,
            MappingState::Vegas { .. } => MappingKind::Vegas,
            MappingState::MultiChannel { .. } => MappingKind::MultiChannel,
            MappingState::MultiChannelVegas { .. } => MappingKind::MultiChannelVegas,
        }
    }

    pub fn dimensions(&self) -> usize {
        match *self {
            MappingState::Plain { dimensions }
            | MappingState::Vegas { dimensions, .. }
            | MappingState::MultiChannel { dimensions, .. }
            | MappingState::MultiChannelVegas { dimensions, .. } => dimensions,
        }
    }

    /// Checks the internal consistency of the state, independently of any live mapping.
    pub fn validate(&self) -> Result<()> {
        if self.dimensions() == 0 {
            return Err(Error::config("the number of dimensions must be positive"));
        }
        match self {
            MappingState::Plain { .. } => Ok(()),
            MappingState::Vegas {
                dimensions,
                config,
                grids,
            } => {
                config.validate()?;
                check_grids(grids, *dimensions, config.bins)
            }
            MappingState::MultiChannel {
                config, weights, ..
            } => {
                config.validate()?;
                check_state_weights(weights)
            }
            MappingState::MultiChannelVegas {
                dimensions,
                channel_config,
                vegas_config,
                weights,
                grids,
            } => {
                channel_config.validate()?;
                vegas_config.validate()?;
                check_state_weights(weights)?;
                if grids.len() != weights.len() {
                    return Err(Error::config(format!(
                        "{} grid sets stored for {} channels",
                        grids.len(),
                        weights.len()
                    )));
                }
                grids
                    .iter()
                    .try_for_each(|grids| check_grids(grids, *dimensions, vegas_config.bins))
            }
        }
    }
}

fn check_grids(grids: &[Grid], dimensions: usize, bins: usize) -> Result<()> {
    if grids.len() != dimensions {
        return Err(Error::config(format!(
            "{} grids stored for {} dimensions",
            grids.len(),
            dimensions
        )));
    }
    if grids.iter().any(|grid| grid.bins() != bins) {
        return Err(Error::config(format!("stored grids do not have {bins} bins")));
    }
    Ok(())
}

fn check_state_weights(weights: &[f64]) -> Result<()> {
    if weights.is_empty() {
        return Err(Error::config("no channel weights stored"));
    }
    if weights.iter().any(|&w| !w.is_finite() || w < 0.0) {
        return Err(Error::config("stored channel weights must be finite and non-negative"));
    }
    let sum: f64 = weights.iter().sum();
    if (sum - 1.0).abs() > 1e-9 {
        return Err(Error::config(format!(
            "stored channel weights sum to {sum}"
        )));
    }
    Ok(())
}

/// Fails with a configuration error unless `stored == live`.
pub(crate) fn check_compatible<T>(what: &str, stored: T, live: T) -> Result<()>
where
    T: PartialEq + std::fmt::Debug,
{
    if stored == live {
        Ok(())
    } else {
        Err(Error::config(format!(
            "incompatible checkpoint: {what} is {stored:?}, expected {live:?}"
        )))
    }
}

/// A density mapping of the unit hypercube with its adaptation.
///
/// Sampling only borrows the mapping, so it can run on many threads; it changes only through
/// [`Mapping::refine`], [`Mapping::restore`] and [`Mapping::import`], between iterations.
pub trait Mapping: Send + Sync {
    fn kind(&self) -> MappingKind;

    /// Number of coordinates of a point.
    fn dimensions(&self) -> usize;

    /// Number of uniform random numbers consumed by a point.
    fn random_numbers(&self) -> usize;

    /// Scratch space for [`Mapping::sample`].
    fn new_sample(&self) -> Sample;

    fn adjustment_len(&self) -> usize;

    fn new_adjustment(&self) -> Adjustment {
        Adjustment::zeros(self.adjustment_len())
    }

    /// Maps `draws` to `coordinates`, filling `sample` with the weight and bookkeeping.
    fn sample(&self, draws: &[f64], coordinates: &mut [f64], sample: &mut Sample);

    /// Records that `sample` was drawn, whatever the integrand returned for it.
    fn count(&self, _sample: &Sample, _adjustment: &mut Adjustment) {}

    /// Records the weighted, finite and non-zero function `value` of a sampled point.
    fn record(&self, sample: &Sample, value: f64, adjustment: &mut Adjustment);

    /// Describes how the channels were used by an iteration of `calls` points, before the
    /// mapping is refined with its `adjustment`. Mappings without channels return `None`.
    fn summary(&self, _adjustment: &Adjustment, _calls: usize) -> Option<ChannelSummary> {
        None
    }

    /// Adapts the mapping to the data of one iteration.
    ///
    /// On error the mapping is unchanged.
    fn refine(&mut self, adjustment: &Adjustment) -> Result<()>;

    fn state(&self) -> MappingState;

    /// Replaces the adaptive state with `state`, which must be compatible with this mapping.
    ///
    /// On error the mapping is unchanged.
    fn restore(&mut self, state: &MappingState) -> Result<()>;

    /// Writes the adaptive parameters into `buffer`, for broadcasting them to other workers.
    fn export(&self, buffer: &mut Vec<f64>);

    /// Number of values written by [`Mapping::export`].
    fn export_len(&self) -> usize;

    /// Replaces the adaptive parameters with the output of [`Mapping::export`].
    fn import(&mut self, values: &[f64]) -> Result<()>;
}

/// Uniform sampling without any adaptation.
#[derive(Debug, Clone)]
pub struct Plain {
    dimensions: usize,
}

impl Plain {
    pub fn new(dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            return Err(Error::config("the number of dimensions must be positive"));
        }
        Ok(Plain { dimensions })
    }
}

impl Mapping for Plain {
    fn kind(&self) -> MappingKind {
        MappingKind::Plain
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn random_numbers(&self) -> usize {
        self.dimensions
    }

    fn new_sample(&self) -> Sample {
        Sample::new(0, 0, 0)
    }

    fn adjustment_len(&self) -> usize {
        0
    }

    fn sample(&self, draws: &[f64], coordinates: &mut [f64], sample: &mut Sample) {
        coordinates.copy_from_slice(draws);
        sample.weight = 1.0;
    }

    fn record(&self, _: &Sample, _: f64, _: &mut Adjustment) {}

    fn refine(&mut self, _: &Adjustment) -> Result<()> {
        Ok(())
    }

    fn state(&self) -> MappingState {
        MappingState::Plain {
            dimensions: self.dimensions,
        }
    }

    fn restore(&mut self, state: &MappingState) -> Result<()> {
        check_compatible("the integrator kind", state.kind(), MappingKind::Plain)?;
        check_compatible("the number of dimensions", state.dimensions(), self.dimensions)
    }

    fn export(&self, _: &mut Vec<f64>) {}

    fn export_len(&self) -> usize {
        0
    }

    fn import(&mut self, values: &[f64]) -> Result<()> {
        if values.is_empty() {
            Ok(())
        } else {
            Err(Error::sync("received parameters for a plain integrator"))
        }
    }
}
