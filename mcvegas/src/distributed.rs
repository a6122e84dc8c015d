//! Lockstep integration on several workers.
//!
//! Every worker samples its share of the calls of an iteration. The statistics and the
//! adjustment data are summed over all workers, the root worker refines the mapping and runs
//! the callback, and the new parameters are broadcast to the others before the next iteration
//! starts. The only collectives needed are an element-wise sum and a broadcast, which a
//! [`Transport`] provides.

use std::sync::{Arc, Barrier, Mutex};

use rand_pcg::Pcg64;
use tracing::{debug, trace};

use crate::callback::{Callback, Control, Progress};
use crate::config::validate_iteration_calls;
use crate::error::{Error, Result};
use crate::integrand::Integrand;
use crate::integrator::Integrator;
use crate::mapping::{Adjustment, Mapping};
use crate::result::{Estimate, Statistics};
use crate::stream::{calls_before, reconstruct, share, skip, SeedScheme};

/// The collectives used by the [`Coordinator`].
///
/// Every worker must call the same collectives in the same order with buffers of the same
/// length.
pub trait Transport {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Replaces `values` on every worker with the element-wise sum over all workers.
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()>;

    /// Replaces `values` on every worker with the values of worker `root`.
    fn broadcast(&self, root: usize, values: &mut [f64]) -> Result<()>;
}

/// A single worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _: &mut [f64]) -> Result<()> {
        Ok(())
    }

    fn broadcast(&self, _: usize, _: &mut [f64]) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct Exchange {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<f64>>>,
}

/// Workers running on threads of the same process.
///
/// Sums are taken in rank order, so a reduction gives the same result on every run.
#[derive(Debug, Clone)]
pub struct ThreadTransport {
    rank: usize,
    size: usize,
    exchange: Arc<Exchange>,
}

impl ThreadTransport {
    /// Creates the transports of `size` workers, indexed by rank.
    pub fn group(size: usize) -> Vec<ThreadTransport> {
        let exchange = Arc::new(Exchange {
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![Vec::new(); size]),
        });
        (0..size)
            .map(|rank| ThreadTransport {
                rank,
                size,
                exchange: Arc::clone(&exchange),
            })
            .collect()
    }

    fn slots(&self) -> Result<std::sync::MutexGuard<'_, Vec<Vec<f64>>>> {
        self.exchange
            .slots
            .lock()
            .map_err(|_| Error::sync("another worker panicked"))
    }

    /// Publishes `values`, waits for all workers and reads the result with `read`.
    fn round<F>(&self, values: &mut [f64], publish: bool, read: F) -> Result<()>
    where
        F: FnOnce(&[Vec<f64>], &mut [f64]) -> Result<()>,
    {
        if publish {
            let mut slots = self.slots()?;
            slots[self.rank].clear();
            slots[self.rank].extend_from_slice(values);
        }
        self.exchange.barrier.wait();
        let outcome = self.slots().and_then(|slots| read(&slots, values));
        // nobody may publish the next message before everybody has read this one
        self.exchange.barrier.wait();
        outcome
    }
}

impl Transport for ThreadTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()> {
        self.round(values, true, |slots, values| {
            if slots.iter().any(|slot| slot.len() != values.len()) {
                return Err(Error::sync("workers reduced buffers of different lengths"));
            }
            for (i, value) in values.iter_mut().enumerate() {
                *value = slots.iter().map(|slot| slot[i]).sum();
            }
            Ok(())
        })
    }

    fn broadcast(&self, root: usize, values: &mut [f64]) -> Result<()> {
        if root >= self.size {
            return Err(Error::sync(format!("there is no worker with rank {root}")));
        }
        self.round(values, self.rank == root, |slots, values| {
            let message = &slots[root];
            if message.len() != values.len() {
                return Err(Error::sync("workers broadcast buffers of different lengths"));
            }
            values.copy_from_slice(message);
            Ok(())
        })
    }
}

const ROOT: usize = 0;

// Outcome of an iteration on the root worker, sent ahead of the mapping parameters.
const CONTINUE: f64 = 0.0;
const STOP: f64 = 1.0;
const REJECTED: f64 = 2.0;
const CALLBACK_FAILED: f64 = 3.0;

/// Drives an [`Integrator`] on every worker of a [`Transport`].
#[derive(Debug)]
pub struct Coordinator<'a, T: ?Sized> {
    transport: &'a T,
}

impl<'a, T: Transport + ?Sized> Coordinator<'a, T> {
    pub fn new(transport: &'a T) -> Self {
        Coordinator { transport }
    }

    /// Runs one iteration per entry of `iteration_calls`, each split over all workers.
    ///
    /// Every worker calls this with the same arguments and an integrator in the same state.
    /// `callback` is only called on the root worker; its decision to stop applies to all of
    /// them. Every worker returns the combination of all iterations.
    pub fn integrate<M, I, C>(
        &self,
        integrator: &mut Integrator<M>,
        integrand: &I,
        iteration_calls: &[usize],
        mut callback: C,
    ) -> Result<Estimate>
    where
        M: Mapping,
        I: Integrand,
        C: Callback,
    {
        validate_iteration_calls(iteration_calls)?;
        let mut rng = self.start(integrator, integrand)?;
        for &calls in iteration_calls {
            let (_, control) =
                self.iteration(integrator, integrand, calls, &mut rng, &mut callback)?;
            if control == Control::Stop {
                debug!(iterations = integrator.results().len(), "stopped by the callback");
                break;
            }
        }
        Ok(integrator.cumulative().estimate())
    }

    /// Checks that all workers agree on the run and returns the generator of this worker.
    pub(crate) fn start<M: Mapping, I: Integrand>(
        &self,
        integrator: &Integrator<M>,
        integrand: &I,
    ) -> Result<Pcg64> {
        let mapping = integrator.mapping();
        if integrand.dim() != mapping.dimensions() {
            return Err(Error::config(format!(
                "the integrand has {} dimensions, the integrator {}",
                integrand.dim(),
                mapping.dimensions()
            )));
        }

        let (rank, size) = (self.transport.rank(), self.transport.size());
        if rank >= size {
            return Err(Error::sync(format!("rank {rank} is outside a group of {size}")));
        }
        let mut workers = [1.0];
        self.transport.all_reduce_sum(&mut workers)?;
        if workers[0] != size as f64 {
            return Err(Error::sync(format!(
                "{} workers joined, expected {size}",
                workers[0]
            )));
        }

        let lengths = [mapping.adjustment_len() as f64, mapping.export_len() as f64];
        let mut reduced = lengths;
        self.transport.all_reduce_sum(&mut reduced)?;
        if reduced != lengths.map(|len| len * size as f64) {
            return Err(Error::sync("the workers run different integrators"));
        }

        let stream = integrator.stream();
        let history: Vec<usize> = integrator.results().iter().map(|r| r.calls).collect();
        let rng = reconstruct(
            stream.seed,
            stream.scheme,
            size,
            rank,
            &history,
            mapping.random_numbers(),
        );

        let problem = if !history.is_empty()
            && stream.scheme == SeedScheme::Independent
            && stream.workers != size
        {
            Some(format!(
                "the run used {} independent streams and cannot continue on {size} workers",
                stream.workers
            ))
        } else if rank == ROOT && !stream.matches(&rng) {
            Some("the generator state does not match the recorded iterations".to_owned())
        } else {
            None
        };

        let mut failures = [f64::from(u8::from(problem.is_some()))];
        self.transport.all_reduce_sum(&mut failures)?;
        if let Some(problem) = problem {
            return Err(Error::sync(problem));
        }
        if failures[0] > 0.0 {
            return Err(Error::sync("another worker could not start the run"));
        }

        trace!(rank, size, iterations = history.len(), "workers synchronised");
        Ok(rng)
    }

    /// Runs a single iteration of `calls` points on all workers.
    ///
    /// If the root worker fails to refine the mapping, the iteration is discarded everywhere.
    pub(crate) fn iteration<M, I, C>(
        &self,
        integrator: &mut Integrator<M>,
        integrand: &I,
        calls: usize,
        rng: &mut Pcg64,
        callback: &mut C,
    ) -> Result<(Statistics, Control)>
    where
        M: Mapping,
        I: Integrand,
        C: Callback + ?Sized,
    {
        let (rank, size) = (self.transport.rank(), self.transport.size());
        let shared = integrator.stream().scheme == SeedScheme::Shared;
        let draws_per_point = integrator.mapping().random_numbers();
        let local_calls = share(calls, size, rank);
        let before = calls_before(calls, size, rank);

        let mut next = rng.clone();
        if shared {
            skip(&mut next, before * draws_per_point);
        }
        let (local, adjustment) = integrator.sample(integrand, local_calls, &mut next);
        if shared {
            skip(&mut next, (calls - before - local_calls) * draws_per_point);
        }

        let mut buffer = Vec::with_capacity(Statistics::FLAT_LEN + adjustment.len());
        buffer.extend_from_slice(&local.to_flat());
        buffer.extend_from_slice(adjustment.as_slice());
        self.transport.all_reduce_sum(&mut buffer)?;

        let result = Statistics::from_flat(&buffer[..Statistics::FLAT_LEN]);
        if result.calls != calls {
            return Err(Error::sync(format!(
                "the workers performed {} calls instead of {calls}",
                result.calls
            )));
        }
        let adjustment = Adjustment::from(buffer.split_off(Statistics::FLAT_LEN));
        let summary = integrator.mapping().summary(&adjustment, calls);

        let mut message = vec![0.0; 1 + integrator.mapping().export_len()];
        let mut failure = None;
        if rank == ROOT {
            let status = match integrator.mapping_mut().refine(&adjustment) {
                Ok(()) => {
                    integrator.commit(result, summary.clone(), next.clone(), size);
                    match self.notify(integrator, &result, callback) {
                        Ok(Control::Continue) => CONTINUE,
                        Ok(Control::Stop) => STOP,
                        Err(err) => {
                            failure = Some(err);
                            CALLBACK_FAILED
                        }
                    }
                }
                Err(err) => {
                    failure = Some(err);
                    REJECTED
                }
            };
            message.clear();
            message.push(status);
            integrator.mapping().export(&mut message);
        }
        self.transport.broadcast(ROOT, &mut message)?;

        let status = message[0];
        let imported = if rank == ROOT || status == REJECTED {
            Ok(())
        } else {
            integrator.mapping_mut().import(&message[1..])
        };

        // every worker learns whether the parameters could be applied everywhere
        let mut failures = [f64::from(u8::from(imported.is_err()))];
        self.transport.all_reduce_sum(&mut failures)?;

        if rank == ROOT {
            if let Some(err) = failure {
                if status == CALLBACK_FAILED {
                    *rng = next;
                }
                return Err(err);
            }
            if failures[0] > 0.0 {
                return Err(Error::sync(format!(
                    "another worker could not apply the parameters of iteration {}",
                    integrator.results().len() - 1
                )));
            }
        } else {
            if status == REJECTED {
                return Err(Error::sync(format!(
                    "the root worker rejected iteration {}",
                    integrator.results().len()
                )));
            }
            if let Err(err) = imported {
                return Err(Error::sync(format!(
                    "could not apply the parameters of the root worker: {err}"
                )));
            }
            if failures[0] > 0.0 {
                return Err(Error::sync(
                    "another worker could not apply the parameters of the root worker",
                ));
            }
            integrator.commit(result, summary, next.clone(), size);
            if status == CALLBACK_FAILED {
                *rng = next;
                return Err(Error::sync("the callback of the root worker failed"));
            }
        }

        *rng = next;
        let control = if status == STOP {
            Control::Stop
        } else {
            Control::Continue
        };
        Ok((result, control))
    }

    fn notify<M, C>(
        &self,
        integrator: &Integrator<M>,
        result: &Statistics,
        callback: &mut C,
    ) -> Result<Control>
    where
        M: Mapping,
        C: Callback + ?Sized,
    {
        let checkpoint = integrator.checkpoint();
        let progress = Progress {
            iteration: integrator.results().len() - 1,
            result,
            cumulative: integrator.cumulative().estimate(),
            channels: integrator.channel_summaries().last().and_then(Option::as_ref),
            checkpoint: &checkpoint,
        };
        callback.call(&progress)
    }
}
