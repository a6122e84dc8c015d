//! The adaptive grid used by the VEGAS algorithm.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::{Refinement, VegasConfig};
use crate::error::{Error, Result};

/// Represents the adaptive grid for a single dimension.
///
/// The grid stores `bins + 1` strictly increasing edges, the first one being `0` and the last
/// one `1`. Each bin is sampled with the same probability, so narrow bins have a high density.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Grid {
    edges: Vec<f64>,
}

impl Grid {
    /// Creates a new uniform grid for a given number of bins.
    pub fn new(bins: usize) -> Result<Self> {
        if bins == 0 {
            return Err(Error::config("the number of bins must be positive"));
        }
        let edges = (0..=bins).map(|i| i as f64 / bins as f64).collect();
        Ok(Grid { edges })
    }

    /// Creates a grid from its edges, checking that they form a valid partition of `[0, 1]`.
    pub fn from_edges(edges: Vec<f64>) -> Result<Self> {
        check_edges(&edges)?;
        Ok(Grid { edges })
    }

    pub fn bins(&self) -> usize {
        self.edges.len() - 1
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Given a random number `y` in [0, 1), finds the corresponding grid bin,
    /// the mapped value `x`, and the jacobian for this dimension.
    pub fn map(&self, y: f64) -> (usize, f64, f64) {
        let bins = self.bins();
        let y_scaled = y * bins as f64;
        let bin_index = (y_scaled.floor() as usize).min(bins - 1);
        let y_frac = y_scaled - bin_index as f64;

        let x_low = self.edges[bin_index];
        let width = self.edges[bin_index + 1] - x_low;

        let x = x_low + y_frac * width;
        let jacobian = width * bins as f64;

        (bin_index, x, jacobian)
    }

    /// The inverse of [`Grid::map`]: returns the bin containing `x`, the uniform number `y`
    /// that maps onto `x` and the jacobian of the bin.
    pub fn inverse(&self, x: f64) -> (usize, f64, f64) {
        let bins = self.bins();
        let bin_index = self
            .edges
            .partition_point(|&edge| edge <= x)
            .saturating_sub(1)
            .min(bins - 1);

        let x_low = self.edges[bin_index];
        let width = self.edges[bin_index + 1] - x_low;

        let y = (bin_index as f64 + (x - x_low) / width) / bins as f64;
        let jacobian = width * bins as f64;

        (bin_index, y, jacobian)
    }

    /// The probability density of the grid at `x`.
    pub fn density(&self, x: f64) -> f64 {
        1.0 / self.inverse(x).2
    }

    /// Computes the refined grid from the binned squared function values in `data`.
    ///
    /// The grid is only replaced if the refinement succeeds.
    pub fn refine(&mut self, data: &[f64], alpha: f64, refinement: Refinement) -> Result<()> {
        let edges = self.refined_edges(data, alpha, refinement)?;
        self.edges = edges;
        Ok(())
    }

    fn refined_edges(&self, data: &[f64], alpha: f64, refinement: Refinement) -> Result<Vec<f64>> {
        let bins = self.bins();
        if data.len() != bins {
            return Err(Error::config(format!(
                "refinement data has {} entries for {} bins",
                data.len(),
                bins
            )));
        }

        let smoothed = smooth(data);
        let norm: f64 = smoothed.iter().sum();
        if !norm.is_finite() {
            return Err(Error::config("non-finite refinement data"));
        }
        if norm <= 0.0 {
            return Err(Error::config(
                "all bins have zero importance, the integrand is degenerate",
            ));
        }

        let importance: Vec<f64> = smoothed
            .iter()
            .map(|&value| {
                if value == 0.0 {
                    return 0.0;
                }
                let r = value / norm;
                let m = ((r - 1.0) / r.ln()).powf(alpha);
                if m.is_finite() {
                    m
                } else {
                    1.0
                }
            })
            .collect();

        let total: f64 = importance.iter().sum();
        let per_bin = total / bins as f64;

        let mut new_edges = Vec::with_capacity(bins + 1);
        new_edges.push(0.0);

        let mut old_bin = 0;
        let mut cumulative = 0.0;
        for new_bin in 1..bins {
            let target = new_bin as f64 * per_bin;
            // find the old bin with `cumulative <= target < cumulative + importance`
            while old_bin < bins - 1 && cumulative + importance[old_bin] <= target {
                cumulative += importance[old_bin];
                old_bin += 1;
            }

            let left = self.edges[old_bin];
            let width = self.edges[old_bin + 1] - left;
            let edge = match refinement {
                Refinement::Classic => {
                    let fraction = (target - cumulative) / importance[old_bin];
                    left + fraction.clamp(0.0, 1.0) * width
                }
                Refinement::Cuba => {
                    let previous = importance[old_bin.saturating_sub(1)];
                    let slope = 0.5 * (importance[old_bin] + previous);
                    let overshoot = cumulative + importance[old_bin] - target;
                    let edge = (left + width - overshoot / slope * width).clamp(left, left + width);
                    let last = new_edges[new_bin - 1];
                    edge.max(last)
                }
            };
            new_edges.push(edge);
        }
        new_edges.push(1.0);

        check_edges(&new_edges).map_err(|_| {
            Error::config("refinement collapsed a bin; the grid was left unchanged")
        })?;

        trace!(bins, total, "refined grid");

        Ok(new_edges)
    }
}

impl TryFrom<Vec<f64>> for Grid {
    type Error = Error;

    fn try_from(edges: Vec<f64>) -> Result<Self> {
        Grid::from_edges(edges)
    }
}

impl From<Grid> for Vec<f64> {
    fn from(grid: Grid) -> Self {
        grid.edges
    }
}

/// Unweighted moving average over a bin and its neighbours; the end bins average over two.
fn smooth(data: &[f64]) -> Vec<f64> {
    let n = data.len();
    if n < 2 {
        return data.to_vec();
    }
    let mut smoothed = Vec::with_capacity(n);
    smoothed.push(0.5 * (data[0] + data[1]));
    for window in data.windows(3) {
        smoothed.push((window[0] + window[1] + window[2]) / 3.0);
    }
    smoothed.push(0.5 * (data[n - 2] + data[n - 1]));
    smoothed
}

fn check_edges(edges: &[f64]) -> Result<()> {
    if edges.len() < 2 {
        return Err(Error::config("a grid needs at least one bin"));
    }
    if edges[0] != 0.0 || edges[edges.len() - 1] != 1.0 {
        return Err(Error::config("grid edges must start at 0 and end at 1"));
    }
    if !edges.windows(2).all(|pair| pair[0] < pair[1]) {
        return Err(Error::config("grid edges must be strictly increasing"));
    }
    Ok(())
}

/// A separable piecewise-constant probability density over the unit hypercube, one [`Grid`]
/// per dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VegasPdf {
    grids: Vec<Grid>,
}

impl VegasPdf {
    /// Creates a uniform density with `dimensions` dimensions.
    pub fn new(dimensions: usize, config: &VegasConfig) -> Result<Self> {
        config.validate()?;
        if dimensions == 0 {
            return Err(Error::config("the number of dimensions must be positive"));
        }
        let grid = Grid::new(config.bins)?;
        Ok(VegasPdf {
            grids: vec![grid; dimensions],
        })
    }

    /// Creates a density from existing grids, which must all have the same number of bins.
    pub fn from_grids(grids: Vec<Grid>) -> Result<Self> {
        let Some(first) = grids.first() else {
            return Err(Error::config("the number of dimensions must be positive"));
        };
        let bins = first.bins();
        if grids.iter().any(|grid| grid.bins() != bins) {
            return Err(Error::config("all grids must have the same number of bins"));
        }
        Ok(VegasPdf { grids })
    }

    pub fn dimensions(&self) -> usize {
        self.grids.len()
    }

    pub fn bins(&self) -> usize {
        self.grids[0].bins()
    }

    pub fn grids(&self) -> &[Grid] {
        &self.grids
    }

    /// Length of the adjustment data: one entry per bin and dimension.
    pub fn adjustment_len(&self) -> usize {
        self.dimensions() * self.bins()
    }

    /// Maps the uniform `draws` into `coordinates`, writing the bin of each dimension into
    /// `bins`, and returns the jacobian.
    pub fn sample(&self, draws: &[f64], coordinates: &mut [f64], bins: &mut [usize]) -> f64 {
        let mut jacobian = 1.0;
        for (d, grid) in self.grids.iter().enumerate() {
            let (bin, x, jac) = grid.map(draws[d]);
            coordinates[d] = x;
            bins[d] = bin;
            jacobian *= jac;
        }
        jacobian
    }

    /// Maps `coordinates` back to the uniform numbers generating them and returns the jacobian.
    pub fn inverse(&self, coordinates: &[f64], draws: &mut [f64]) -> f64 {
        let mut jacobian = 1.0;
        for (d, grid) in self.grids.iter().enumerate() {
            let (_, y, jac) = grid.inverse(coordinates[d]);
            draws[d] = y;
            jacobian *= jac;
        }
        jacobian
    }

    /// The probability density at `coordinates`.
    pub fn density(&self, coordinates: &[f64]) -> f64 {
        self.grids
            .iter()
            .zip(coordinates)
            .map(|(grid, &x)| grid.density(x))
            .product()
    }

    /// Adds `value2`, the squared weighted function value of a point, to the bins it fell into.
    pub fn accumulate(&self, adjustment: &mut [f64], bins: &[usize], value2: f64) {
        let n = self.bins();
        for (d, &bin) in bins.iter().enumerate() {
            adjustment[d * n + bin] += value2;
        }
    }

    /// Refines every grid from the adjustment data of one iteration.
    ///
    /// Either all grids are refined or, on error, none of them.
    pub fn refine(&mut self, adjustment: &[f64], config: &VegasConfig) -> Result<()> {
        if config.alpha == 0.0 {
            return Ok(());
        }
        let n = self.bins();
        let grids = self
            .grids
            .iter()
            .enumerate()
            .map(|(d, grid)| {
                grid.refined_edges(&adjustment[d * n..(d + 1) * n], config.alpha, config.refinement)
                    .map(|edges| Grid { edges })
                    .map_err(|err| match err {
                        Error::Configuration(message) => {
                            Error::Configuration(format!("dimension {d}: {message}"))
                        }
                        other => other,
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        self.grids = grids;
        Ok(())
    }

    /// All edges, dimension after dimension.
    pub(crate) fn export(&self, buffer: &mut Vec<f64>) {
        for grid in &self.grids {
            buffer.extend_from_slice(grid.edges());
        }
    }

    /// Number of values written by [`VegasPdf::export`].
    pub(crate) fn export_len(&self) -> usize {
        self.dimensions() * (self.bins() + 1)
    }

    /// Replaces the edges with the values written by [`VegasPdf::export`].
    pub(crate) fn import(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.export_len() {
            return Err(Error::sync("grid parameter length mismatch"));
        }
        let grids = values
            .chunks(self.bins() + 1)
            .map(|edges| Grid::from_edges(edges.to_vec()))
            .collect::<Result<Vec<_>>>()
            .map_err(|err| Error::sync(format!("received an invalid grid: {err}")))?;
        self.grids = grids;
        Ok(())
    }
}
