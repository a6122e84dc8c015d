//! The iteration driver shared by all integrator variants.

use rand_pcg::Pcg64;
use rayon::prelude::*;
use tracing::debug;

use crate::callback::{Callback, DefaultCallback};
use crate::channel::ChannelSummary;
use crate::checkpoint::Checkpoint;
use crate::config::RunConfig;
use crate::distributed::{Coordinator, LocalTransport};
use crate::error::{Error, Result};
use crate::integrand::{Chunk, Integrand};
use crate::mapping::{Adjustment, Mapping, Sample};
use crate::result::{Accumulator, Cumulative, Estimate, Statistics};
use crate::stream::{fill_uniform, reconstruct, SeedScheme, StreamState};

/// Number of points mapped and evaluated together by one task.
pub const CHUNK_SIZE: usize = 512;

/// Runs iterations of a [`Mapping`] and keeps their results.
///
/// The results do not depend on the number of threads: the random numbers are drawn
/// sequentially, and the per-chunk sums are combined in chunk order.
#[derive(Debug, Clone)]
pub struct Integrator<M> {
    mapping: M,
    results: Vec<Statistics>,
    channel_summaries: Vec<Option<ChannelSummary>>,
    stream: StreamState,
}

impl<M: Mapping> Integrator<M> {
    /// Creates an integrator with seed 0 and independent worker streams.
    pub fn new(mapping: M) -> Self {
        Integrator {
            mapping,
            results: Vec::new(),
            channel_summaries: Vec::new(),
            stream: StreamState::new(0, SeedScheme::default()),
        }
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.reseed(seed, self.stream.scheme);
    }

    pub fn set_seed_scheme(&mut self, scheme: SeedScheme) {
        self.reseed(self.stream.seed, scheme);
    }

    /// Applies the seed settings of `run`.
    pub fn configure(&mut self, run: &RunConfig) -> Result<()> {
        run.validate()?;
        self.reseed(run.seed, run.seed_scheme);
        Ok(())
    }

    fn reseed(&mut self, seed: u64, scheme: SeedScheme) {
        let history: Vec<usize> = self.results.iter().map(|result| result.calls).collect();
        self.stream = StreamState {
            seed,
            scheme,
            workers: 1,
            rng: reconstruct(seed, scheme, 1, 0, &history, self.mapping.random_numbers()),
        };
    }

    pub fn mapping(&self) -> &M {
        &self.mapping
    }

    pub(crate) fn mapping_mut(&mut self) -> &mut M {
        &mut self.mapping
    }

    /// The result of every iteration so far, including restored ones.
    pub fn results(&self) -> &[Statistics] {
        &self.results
    }

    /// The channel usage of every iteration; `None` for mappings without channels and for
    /// iterations restored from checkpoints that did not record it.
    pub fn channel_summaries(&self) -> &[Option<ChannelSummary>] {
        &self.channel_summaries
    }

    pub fn stream(&self) -> &StreamState {
        &self.stream
    }

    pub fn cumulative(&self) -> Cumulative {
        Cumulative::from_results(&self.results)
    }

    /// A snapshot of the current state.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(self.results.clone(), self.mapping.state(), self.stream.clone())
            .with_channels(self.channel_summaries.clone())
    }

    /// Continues from `checkpoint`, which must have been written by a compatible integrator.
    ///
    /// On error the integrator is unchanged.
    pub fn restore(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        checkpoint.validate()?;
        self.mapping.restore(checkpoint.state())?;
        self.results = checkpoint.results().to_vec();
        self.channel_summaries = (0..checkpoint.iterations())
            .map(|index| checkpoint.channel_summary(index).cloned())
            .collect();
        self.stream = checkpoint.stream().clone();
        debug!(
            iterations = self.results.len(),
            seed = self.stream.seed,
            "restored checkpoint"
        );
        Ok(())
    }

    /// Runs a single iteration of `calls` points and refines the mapping.
    ///
    /// If the refinement fails, the iteration is discarded and the integrator is unchanged.
    pub fn iterate<I: Integrand>(&mut self, integrand: &I, calls: usize) -> Result<Statistics> {
        if calls == 0 {
            return Err(Error::config("an iteration needs at least one call"));
        }
        let coordinator = Coordinator::new(&LocalTransport);
        let mut rng = coordinator.start(self, integrand)?;
        let mut callback = DefaultCallback::default();
        let (result, _) = coordinator.iteration(self, integrand, calls, &mut rng, &mut callback)?;
        Ok(result)
    }

    /// Runs one iteration per entry of `iteration_calls`, calling `callback` after each of
    /// them, and returns the combination of all iterations.
    pub fn integrate<I, C>(
        &mut self,
        integrand: &I,
        iteration_calls: &[usize],
        callback: C,
    ) -> Result<Estimate>
    where
        I: Integrand,
        C: Callback,
    {
        Coordinator::new(&LocalTransport).integrate(self, integrand, iteration_calls, callback)
    }

    /// Samples `calls` points drawn from `rng` without touching the mapping.
    pub(crate) fn sample<I: Integrand>(
        &self,
        integrand: &I,
        calls: usize,
        rng: &mut Pcg64,
    ) -> (Statistics, Adjustment) {
        let draws_per_point = self.mapping.random_numbers();
        let mut draws = vec![0.0; calls * draws_per_point];
        fill_uniform(rng, &mut draws);

        let partials: Vec<(Statistics, Adjustment)> = draws
            .par_chunks(CHUNK_SIZE * draws_per_point)
            .map(|draws| self.sample_chunk(integrand, draws))
            .collect();

        partials.into_iter().fold(
            (Statistics::default(), self.mapping.new_adjustment()),
            |(mut statistics, mut adjustment), (partial, data)| {
                statistics += partial;
                adjustment.merge(&data);
                (statistics, adjustment)
            },
        )
    }

    fn sample_chunk<I: Integrand>(&self, integrand: &I, draws: &[f64]) -> (Statistics, Adjustment) {
        let dim = self.mapping.dimensions();
        let draws_per_point = self.mapping.random_numbers();
        let points = draws.len() / draws_per_point;

        let mut coordinates = vec![0.0; points * dim];
        let mut samples = vec![self.mapping.new_sample(); points];
        for ((draws, coordinates), sample) in draws
            .chunks_exact(draws_per_point)
            .zip(coordinates.chunks_exact_mut(dim))
            .zip(&mut samples)
        {
            self.mapping.sample(draws, coordinates, sample);
        }

        let weights: Vec<f64> = samples.iter().map(Sample::weight).collect();
        let channels: Option<Vec<usize>> = samples.iter().map(Sample::channel).collect();
        let chunk = Chunk::new(dim, &coordinates, &weights, channels.as_deref());
        let mut values = vec![0.0; points];
        integrand.eval_chunk(&chunk, &mut values);

        let mut accumulator = Accumulator::default();
        let mut adjustment = self.mapping.new_adjustment();
        for (sample, value) in samples.iter().zip(values) {
            self.mapping.count(sample, &mut adjustment);
            let value = value * sample.weight();
            if accumulator.add(value) {
                self.mapping.record(sample, value, &mut adjustment);
            }
        }
        (accumulator.statistics(), adjustment)
    }

    /// Appends a finished iteration.
    pub(crate) fn commit(
        &mut self,
        result: Statistics,
        summary: Option<ChannelSummary>,
        rng: Pcg64,
        workers: usize,
    ) {
        debug!(
            iteration = self.results.len(),
            calls = result.calls,
            value = result.mean(),
            error = result.error(),
            "iteration finished"
        );
        self.results.push(result);
        self.channel_summaries.push(summary);
        self.stream.rng = rng;
        self.stream.workers = workers;
    }
}
