//! Hooks invoked after every iteration.

use std::path::PathBuf;

use tracing::info;

use crate::channel::ChannelSummary;
use crate::checkpoint::Checkpoint;
use crate::error::Result;
use crate::result::{Estimate, Statistics};

/// What the integrator does after a callback returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Stop,
}

/// Everything known after an iteration has been refined.
#[derive(Debug)]
pub struct Progress<'a> {
    /// Zero-based index of the iteration, counting iterations restored from a checkpoint.
    pub iteration: usize,
    /// The result of this iteration alone.
    pub result: &'a Statistics,
    /// All iterations so far combined.
    pub cumulative: Estimate,
    /// How the channels were used, for multi-channel mappings.
    pub channels: Option<&'a ChannelSummary>,
    /// The state after this iteration's refinement.
    pub checkpoint: &'a Checkpoint,
}

/// Called after each iteration; returning [`Control::Stop`] ends the integration.
///
/// In a distributed run only the root worker calls it. An error aborts the run.
pub trait Callback {
    fn call(&mut self, progress: &Progress<'_>) -> Result<Control>;
}

impl<F> Callback for F
where
    F: FnMut(&Progress<'_>) -> Control,
{
    fn call(&mut self, progress: &Progress<'_>) -> Result<Control> {
        Ok(self(progress))
    }
}

/// The behaviours of the [`DefaultCallback`].
#[derive(Debug, Clone, Default, PartialEq)]
pub enum CallbackMode {
    /// Do nothing.
    #[default]
    Silent,
    /// Log the results of every iteration.
    Verbose,
    /// Log the results and replace the checkpoint file after every iteration.
    VerboseAndCheckpoint(PathBuf),
}

/// Logs progress, writes checkpoints and stops once a target precision has been reached.
#[derive(Debug, Clone, Default)]
pub struct DefaultCallback {
    mode: CallbackMode,
    target_precision: Option<f64>,
}

impl DefaultCallback {
    pub fn new(mode: CallbackMode) -> Self {
        DefaultCallback {
            mode,
            target_precision: None,
        }
    }

    /// Stops once the relative error of the cumulative result, in percent, is at most
    /// `percent`.
    pub fn with_target_precision(mut self, percent: f64) -> Self {
        self.target_precision = Some(percent);
        self
    }

    pub fn mode(&self) -> &CallbackMode {
        &self.mode
    }
}

impl Callback for DefaultCallback {
    fn call(&mut self, progress: &Progress<'_>) -> Result<Control> {
        let result = progress.result;
        let cumulative = &progress.cumulative;

        match &self.mode {
            CallbackMode::Silent => {}
            CallbackMode::Verbose | CallbackMode::VerboseAndCheckpoint(_) => {
                info!(
                    iteration = progress.iteration,
                    calls = result.calls,
                    value = result.mean(),
                    error = result.error(),
                    efficiency = result.efficiency(),
                    non_finite = result.non_finite_calls(),
                    "iteration finished"
                );
                info!(
                    value = cumulative.value,
                    error = cumulative.error,
                    relative_error = cumulative.relative_error_percent(),
                    chi2_dof = cumulative.chi2_dof,
                    "cumulative result"
                );
                if let Some(channels) = progress.channels {
                    log_channels(channels, result.calls);
                }
            }
        }

        if let CallbackMode::VerboseAndCheckpoint(path) = &self.mode {
            progress.checkpoint.write_file(path)?;
        }

        if let Some(target) = self.target_precision {
            if cumulative.relative_error_percent() <= target {
                info!(target, "target precision reached");
                return Ok(Control::Stop);
            }
        }

        Ok(Control::Continue)
    }
}

fn log_channels(summary: &ChannelSummary, calls: usize) {
    let minimal = summary.minimal_channels();
    if let (Some(&first), Some(max)) = (minimal.first(), summary.maximal_channel()) {
        let wmin = summary.weights[first];
        let wmax = summary.weights[max];
        info!(
            channels = summary.channels(),
            max_difference = summary.max_difference(),
            wmin,
            wmin_channels = ?minimal,
            wmin_expected_calls = wmin * calls as f64,
            wmin_calls = summary.calls[first],
            wmax,
            wmax_channel = max,
            wmax_expected_calls = wmax * calls as f64,
            wmax_calls = summary.calls[max],
            "channel weights"
        );
    }
}
