//! Multi-channel sampling: a set of mappings combined with adaptive selection weights.
//!
//! A point is generated by first selecting channel `k` with probability `w_k` and then mapping
//! uniform numbers through it. The point's weight is `1 / Σ_c w_c g_c(x)`, where `g_c` is the
//! density of channel `c`, which keeps the estimate unbiased whichever channel produced the
//! point. After each iteration the weights move towards the channels that carry most of the
//! variance.

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::config::ChannelConfig;
use crate::error::{Error, Result};

/// A mapping of the unit hypercube onto itself with a known density.
pub trait Channel: Send + Sync {
    /// Number of dimensions, for both the uniform numbers and the coordinates.
    fn dim(&self) -> usize;

    /// Maps uniform `draws` to `coordinates` and returns the density at `coordinates`.
    fn map(&self, draws: &[f64], coordinates: &mut [f64]) -> f64;

    /// The density of the channel at `coordinates`, zero outside of its support.
    fn density(&self, coordinates: &[f64]) -> f64;
}

/// A channel whose mapping can be inverted, required to combine it with a VEGAS grid.
pub trait GridChannel: Channel {
    /// Writes the uniform numbers that [`Channel::map`] sends onto `coordinates` into `draws`.
    fn inverse(&self, coordinates: &[f64], draws: &mut [f64]);
}

/// The identity mapping.
#[derive(Debug, Clone, Copy)]
pub struct Uniform {
    dim: usize,
}

impl Uniform {
    pub fn new(dim: usize) -> Self {
        Uniform { dim }
    }
}

impl Channel for Uniform {
    fn dim(&self) -> usize {
        self.dim
    }

    fn map(&self, draws: &[f64], coordinates: &mut [f64]) -> f64 {
        coordinates.copy_from_slice(draws);
        1.0
    }

    fn density(&self, _: &[f64]) -> f64 {
        1.0
    }
}

impl GridChannel for Uniform {
    fn inverse(&self, coordinates: &[f64], draws: &mut [f64]) {
        draws.copy_from_slice(coordinates);
    }
}

/// The channels of a multi-channel integration and their selection weights.
///
/// Weights sum to one and no enabled weight falls below [`ChannelConfig::min_weight`]. A
/// channel created with a weight of exactly zero is disabled: it is never selected and its
/// weight stays zero.
pub struct ChannelSet<C: ?Sized = dyn Channel> {
    channels: Vec<Box<C>>,
    weights: Vec<f64>,
    enabled: Vec<bool>,
    config: ChannelConfig,
    dim: usize,
}

impl<C: Channel + ?Sized> ChannelSet<C> {
    /// Creates a channel set with the given a-priori weights.
    pub fn new(channels: Vec<Box<C>>, weights: Vec<f64>, config: ChannelConfig) -> Result<Self> {
        config.validate()?;
        let Some(first) = channels.first() else {
            return Err(Error::config("at least one channel is required"));
        };
        let dim = first.dim();
        if dim == 0 {
            return Err(Error::config("the number of dimensions must be positive"));
        }
        if channels.iter().any(|channel| channel.dim() != dim) {
            return Err(Error::config("all channels must have the same dimension"));
        }
        check_weights(&weights, channels.len())?;

        let enabled: Vec<bool> = weights.iter().map(|&w| w > 0.0).collect();
        let active = enabled.iter().filter(|&&e| e).count();
        if config.min_weight * active as f64 > 1.0 {
            return Err(Error::config(format!(
                "a minimum weight of {} cannot be satisfied by {} channels",
                config.min_weight, active
            )));
        }

        Ok(ChannelSet {
            channels,
            weights,
            enabled,
            config,
            dim,
        })
    }

    /// Creates a channel set where every channel has the same weight.
    pub fn uniform(channels: Vec<Box<C>>, config: ChannelConfig) -> Result<Self> {
        let n = channels.len().max(1);
        let weights = vec![1.0 / n as f64; channels.len()];
        Self::new(channels, weights, config)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn channel(&self, index: usize) -> &C {
        &self.channels[index]
    }

    pub fn is_enabled(&self, index: usize) -> bool {
        self.enabled[index]
    }

    /// Selects a channel for the uniform number `draw` by searching the cumulative weights.
    pub fn select(&self, draw: f64) -> usize {
        let mut cumulative = 0.0;
        let mut last = 0;
        for (index, &weight) in self.weights.iter().enumerate() {
            if weight == 0.0 {
                continue;
            }
            cumulative += weight;
            last = index;
            if draw < cumulative {
                return index;
            }
        }
        // rounding left `draw` above the total
        last
    }

    /// Maps `draws` through channel `channel` and returns its density at `coordinates`.
    pub fn sample(&self, channel: usize, draws: &[f64], coordinates: &mut [f64]) -> f64 {
        self.channels[channel].map(draws, coordinates)
    }

    /// Writes the density of every channel at `coordinates` into `densities`; disabled
    /// channels get zero.
    pub fn densities(&self, coordinates: &[f64], densities: &mut [f64]) {
        for ((density, channel), &enabled) in densities
            .iter_mut()
            .zip(&self.channels)
            .zip(&self.enabled)
        {
            *density = if enabled {
                channel.density(coordinates)
            } else {
                0.0
            };
        }
    }

    /// The multi-channel weight `1 / Σ_c w_c g_c(x)` from the channel `densities` at `x`.
    pub fn combined_weight(&self, densities: &[f64]) -> f64 {
        1.0 / self.total_density(densities)
    }

    fn total_density(&self, densities: &[f64]) -> f64 {
        self.weights
            .iter()
            .zip(densities)
            .map(|(&weight, &density)| weight * density)
            .sum()
    }

    /// Adds the share `g_c / Σ_c' w_c' g_c'` of `value2` to the statistic of every channel.
    pub fn accumulate(&self, adjustment: &mut [f64], densities: &[f64], value2: f64) {
        let total = self.total_density(densities);
        if total <= 0.0 {
            return;
        }
        for (data, &density) in adjustment.iter_mut().zip(densities) {
            *data += density * value2 / total;
        }
    }

    /// Refines the weights from the per-channel statistics of one iteration.
    pub fn refine(&mut self, adjustment: &[f64]) -> Result<()> {
        if adjustment.len() != self.len() {
            return Err(Error::config(format!(
                "channel refinement data has {} entries for {} channels",
                adjustment.len(),
                self.len()
            )));
        }

        let beta = self.config.beta;
        let raw: Vec<f64> = self
            .weights
            .iter()
            .zip(adjustment)
            .zip(&self.enabled)
            .map(|((&weight, &data), &enabled)| {
                if enabled {
                    weight * data.max(0.0).powf(beta)
                } else {
                    0.0
                }
            })
            .collect();

        let total: f64 = raw.iter().sum();
        if !total.is_finite() || total <= 0.0 {
            warn!(total, "degenerate channel statistics, keeping the channel weights");
            return Ok(());
        }

        self.weights = clip_to_floor(&raw, &self.enabled, self.config.min_weight);
        trace!(weights = ?self.weights, "refined channel weights");
        Ok(())
    }

    /// Summarises an iteration sampled with the current weights from its per-channel
    /// `statistics` and point `counts`, both summed over all `calls` points.
    pub(crate) fn summary(
        &self,
        statistics: &[f64],
        counts: &[f64],
        calls: usize,
    ) -> ChannelSummary {
        let norm = if calls == 0 { 0.0 } else { 1.0 / calls as f64 };
        ChannelSummary {
            weights: self.weights.clone(),
            calls: counts.iter().map(|&count| count.round() as usize).collect(),
            statistics: statistics.iter().map(|&data| data.max(0.0) * norm).collect(),
        }
    }

    /// Replaces the weights, e.g. with those received from another worker or a checkpoint.
    pub(crate) fn set_weights(&mut self, weights: Vec<f64>) -> Result<()> {
        check_weights(&weights, self.len())?;
        if weights
            .iter()
            .zip(&self.enabled)
            .any(|(&weight, &enabled)| !enabled && weight != 0.0)
        {
            return Err(Error::config("a disabled channel must keep a zero weight"));
        }
        self.weights = weights;
        Ok(())
    }
}

/// How the channels of one multi-channel iteration were used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSummary {
    /// The weights the iteration was sampled with.
    pub weights: Vec<f64>,
    /// Number of points generated by every channel.
    pub calls: Vec<usize>,
    /// `W_c`, the mean of `(g_c / Σ_c' w_c' g_c') · (f w)²` over all points of the iteration.
    pub statistics: Vec<f64>,
}

impl ChannelSummary {
    pub fn channels(&self) -> usize {
        self.weights.len()
    }

    /// `D = max_{i,j} |W_i − W_j|` over the enabled channels; it vanishes for optimal weights.
    pub fn max_difference(&self) -> f64 {
        let enabled = self
            .weights
            .iter()
            .zip(&self.statistics)
            .filter(|(&weight, _)| weight > 0.0)
            .map(|(_, &statistic)| statistic);
        let (min, max) = enabled.fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), w| {
            (min.min(w), max.max(w))
        });
        if max >= min {
            max - min
        } else {
            0.0
        }
    }

    /// The enabled channels sharing the smallest weight, in ascending order.
    pub fn minimal_channels(&self) -> Vec<usize> {
        let min = self
            .weights
            .iter()
            .copied()
            .filter(|&weight| weight > 0.0)
            .fold(f64::INFINITY, f64::min);
        (0..self.channels())
            .filter(|&c| self.weights[c] == min)
            .collect()
    }

    /// The first channel with the largest weight.
    pub fn maximal_channel(&self) -> Option<usize> {
        (0..self.channels()).reduce(|best, c| {
            if self.weights[c] > self.weights[best] {
                c
            } else {
                best
            }
        })
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.weights.is_empty()
            || self.calls.len() != self.weights.len()
            || self.statistics.len() != self.weights.len()
        {
            return Err(Error::config("channel summary lengths disagree"));
        }
        if self
            .weights
            .iter()
            .chain(&self.statistics)
            .any(|&value| !value.is_finite() || value < 0.0)
        {
            return Err(Error::config(
                "channel summary values must be finite and non-negative",
            ));
        }
        Ok(())
    }
}

/// Normalises `raw` over the enabled channels and lifts every enabled weight to at least
/// `floor`, taking the mass from the remaining channels in proportion to `raw`.
fn clip_to_floor(raw: &[f64], enabled: &[bool], floor: f64) -> Vec<f64> {
    let mut pinned = vec![false; raw.len()];
    let mut weights = vec![0.0; raw.len()];

    loop {
        let free: Vec<usize> = (0..raw.len())
            .filter(|&c| enabled[c] && !pinned[c])
            .collect();
        let pinned_count = pinned.iter().filter(|&&p| p).count();
        let mass = 1.0 - pinned_count as f64 * floor;
        let free_raw: f64 = free.iter().map(|&c| raw[c]).sum();

        for &c in &free {
            weights[c] = if free_raw > 0.0 {
                mass * raw[c] / free_raw
            } else {
                mass / free.len() as f64
            };
        }
        for (c, weight) in weights.iter_mut().enumerate() {
            if pinned[c] {
                *weight = floor;
            }
        }

        let below: Vec<usize> = free
            .iter()
            .copied()
            .filter(|&c| weights[c] < floor)
            .collect();
        if below.is_empty() || below.len() == free.len() {
            break;
        }
        for c in below {
            pinned[c] = true;
        }
    }

    // `1 - k * floor` may round to just below the floor
    for (weight, &enabled) in weights.iter_mut().zip(enabled) {
        if enabled {
            *weight = weight.max(floor);
        }
    }

    weights
}

fn check_weights(weights: &[f64], channels: usize) -> Result<()> {
    if weights.len() != channels {
        return Err(Error::config(format!(
            "{} weights given for {} channels",
            weights.len(),
            channels
        )));
    }
    if weights.iter().any(|&w| !w.is_finite() || w < 0.0) {
        return Err(Error::config("channel weights must be finite and non-negative"));
    }
    let sum: f64 = weights.iter().sum();
    if (sum - 1.0).abs() > 1e-6 {
        return Err(Error::config(format!(
            "channel weights must sum to one, got {sum}"
        )));
    }
    Ok(())
}
