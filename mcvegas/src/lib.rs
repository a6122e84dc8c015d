//! `mcvegas` is an adaptive Monte Carlo integration library for expensive, high-dimensional
//! integrands over the unit hypercube.
//!
//! It implements VEGAS importance sampling, multi-channel sampling and the combination of the
//! two, with one adaptive grid per channel. Integrations can be checkpointed and resumed
//! exactly, and distributed over several workers that only need a sum and a broadcast to
//! cooperate.

pub mod benchmark;
pub mod callback;
pub mod channel;
pub mod checkpoint;
pub mod config;
pub mod distributed;
pub mod error;
pub mod grid;
pub mod integrand;
pub mod integrator;
pub mod mapping;
pub mod multi_channel;
pub mod result;
pub mod stream;
pub mod vegas;

#[cfg(feature = "mpi")]
pub mod mpi;

pub use callback::{Callback, CallbackMode, Control, DefaultCallback, Progress};
pub use checkpoint::Checkpoint;
pub use error::{Error, Result};
pub use integrand::{Integrand, Point};
pub use integrator::Integrator;
pub use mapping::{Mapping, MappingKind, MappingState, Plain};
pub use multi_channel::{MultiChannel, MultiChannelVegas};
pub use result::{Cumulative, Estimate, Statistics};
pub use vegas::Vegas;
