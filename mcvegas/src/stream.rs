//! Random number streams of the workers of a run.
//!
//! Every worker draws from a [`Pcg64`] that is fully determined by the run seed, the seeding
//! scheme, its rank and the number of calls of all previous iterations. This lets a resumed or
//! redistributed run recompute its position in the stream instead of shipping generator states
//! between workers.

use rand::Rng;
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};

/// Base stream selector; worker `r` of an independent run uses `STREAM + r`.
pub const STREAM: u128 = 0x0a02_bdbf_7bb3_c0a7_ac28_fa16_a64a_bf96;

/// How the workers of a distributed run obtain their random numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedScheme {
    /// Every worker owns its own stream.
    #[default]
    Independent,
    /// All workers split a single stream, each one skipping the draws of the others. The result
    /// of a run does not depend on the number of workers, up to summation order.
    Shared,
}

/// Generator state stored in a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamState {
    pub seed: u64,
    pub scheme: SeedScheme,
    /// Number of workers of the run that produced this state.
    pub workers: usize,
    /// The generator of the root worker.
    #[serde(with = "rng_text")]
    pub rng: Pcg64,
}

/// Stores the generator as its JSON text; its 128-bit fields do not survive a round trip
/// through [`serde_json::Value`] as plain numbers.
mod rng_text {
    use rand_pcg::Pcg64;
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(rng: &Pcg64, serializer: S) -> Result<S::Ok, S::Error> {
        let text = serde_json::to_string(rng).map_err(S::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Pcg64, D::Error> {
        let text = String::deserialize(deserializer)?;
        serde_json::from_str(&text).map_err(D::Error::custom)
    }
}

impl StreamState {
    /// The state of a single worker that has not drawn any number yet.
    pub fn new(seed: u64, scheme: SeedScheme) -> Self {
        StreamState {
            seed,
            scheme,
            workers: 1,
            rng: worker_rng(seed, scheme, 0),
        }
    }

    /// Whether `rng` is at exactly the same position as the stored generator.
    pub fn matches(&self, rng: &Pcg64) -> bool {
        same_rng(&self.rng, rng)
    }
}

fn initial_state(seed: u64) -> u128 {
    (u128::from(seed) << 64) | u128::from(seed ^ 0xcafe_f00d_d15e_a5e5)
}

/// The generator of worker `rank` before its first draw.
pub fn worker_rng(seed: u64, scheme: SeedScheme, rank: usize) -> Pcg64 {
    let stream = match scheme {
        SeedScheme::Independent => STREAM + rank as u128,
        SeedScheme::Shared => STREAM,
    };
    Pcg64::new(initial_state(seed), stream)
}

/// Recomputes the generator of worker `rank` after the iterations in `history`.
///
/// `draws_per_point` is the number of uniform numbers a single integrand call consumes.
pub fn reconstruct(
    seed: u64,
    scheme: SeedScheme,
    workers: usize,
    rank: usize,
    history: &[usize],
    draws_per_point: usize,
) -> Pcg64 {
    let mut rng = worker_rng(seed, scheme, rank);
    let calls: u128 = match scheme {
        SeedScheme::Independent => history
            .iter()
            .map(|&total| share(total, workers, rank) as u128)
            .sum(),
        SeedScheme::Shared => history.iter().map(|&total| total as u128).sum(),
    };
    rng.advance(calls * draws_per_point as u128);
    rng
}

/// Skips `draws` uniform numbers.
///
/// Each `f64` drawn with [`Rng::gen`] consumes exactly one step of the generator.
pub fn skip(rng: &mut Pcg64, draws: usize) {
    rng.advance(draws as u128);
}

/// Fills `buffer` with uniform numbers in `[0, 1)`.
pub(crate) fn fill_uniform(rng: &mut Pcg64, buffer: &mut [f64]) {
    for value in buffer.iter_mut() {
        *value = rng.gen();
    }
}

/// Number of calls that worker `rank` out of `workers` performs for `total` calls.
///
/// The remainder goes to the lowest ranks.
pub fn share(total: usize, workers: usize, rank: usize) -> usize {
    total / workers + usize::from(rank < total % workers)
}

/// Number of calls performed by the workers with a rank lower than `rank`.
pub fn calls_before(total: usize, workers: usize, rank: usize) -> usize {
    rank * (total / workers) + rank.min(total % workers)
}

pub(crate) fn same_rng(lhs: &Pcg64, rhs: &Pcg64) -> bool {
    match (serde_json::to_string(lhs), serde_json::to_string(rhs)) {
        (Ok(lhs), Ok(rhs)) => lhs == rhs,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draws(rng: &mut Pcg64, n: usize) -> Vec<f64> {
        let mut buffer = vec![0.0; n];
        fill_uniform(rng, &mut buffer);
        buffer
    }

    #[test]
    fn test_share_partitions_calls() {
        for workers in 1..=7 {
            for total in [0, 1, 5, 99, 100, 100_000] {
                let shares: Vec<usize> = (0..workers).map(|r| share(total, workers, r)).collect();
                assert_eq!(shares.iter().sum::<usize>(), total);
                let (min, max) = (shares.iter().min().unwrap(), shares.iter().max().unwrap());
                assert!(max - min <= 1);
                assert!(shares.windows(2).all(|w| w[0] >= w[1]));
                for rank in 0..workers {
                    let before: usize = shares[..rank].iter().sum();
                    assert_eq!(calls_before(total, workers, rank), before);
                }
            }
        }
    }

    #[test]
    fn test_shared_stream_splits_single_stream() {
        let total = 1003;
        let workers = 4;
        let mut single = worker_rng(42, SeedScheme::Shared, 0);
        let expected = draws(&mut single, total);

        let mut combined = Vec::new();
        for rank in 0..workers {
            let mut rng = worker_rng(42, SeedScheme::Shared, rank);
            skip(&mut rng, calls_before(total, workers, rank));
            combined.extend(draws(&mut rng, share(total, workers, rank)));
        }
        assert_eq!(combined, expected);
    }

    #[test]
    fn test_independent_streams_differ() {
        let a = draws(&mut worker_rng(7, SeedScheme::Independent, 0), 8);
        let b = draws(&mut worker_rng(7, SeedScheme::Independent, 1), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_reconstruct_matches_sequential_draws() {
        let history = [1000, 2500, 17];
        let draws_per_point = 3;
        for scheme in [SeedScheme::Independent, SeedScheme::Shared] {
            let workers = 3;
            let rank = 2;
            let mut rng = worker_rng(5, scheme, rank);
            for &total in &history {
                let calls = match scheme {
                    SeedScheme::Independent => share(total, workers, rank),
                    SeedScheme::Shared => total,
                };
                draws(&mut rng, calls * draws_per_point);
            }
            let rebuilt = reconstruct(5, scheme, workers, rank, &history, draws_per_point);
            assert!(same_rng(&rng, &rebuilt));
        }
    }

    #[test]
    fn test_stream_state_serializes() {
        let mut state = StreamState::new(11, SeedScheme::Shared);
        draws(&mut state.rng, 10);
        let json = serde_json::to_string(&state).unwrap();
        let back: StreamState = serde_json::from_str(&json).unwrap();
        assert!(back.matches(&state.rng));
        assert_eq!(back.scheme, SeedScheme::Shared);
        assert!(!StreamState::new(11, SeedScheme::Shared).matches(&state.rng));
    }
}
