//! Running statistics of integrand evaluations and their combination across iterations.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// Stores the combined result of one or more iterations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    /// The estimated value of the integral.
    pub value: f64,
    /// The estimated statistical error (one standard deviation).
    pub error: f64,
    /// The chi-squared per degree of freedom of the partial results.
    pub chi2_dof: f64,
    /// The total number of integrand calls that entered the estimate.
    pub calls: usize,
}

impl Estimate {
    /// The error relative to the absolute value, in percent.
    pub fn relative_error_percent(&self) -> f64 {
        100.0 * self.error / self.value.abs()
    }
}

/// Call accounting and first two moments of the weighted integrand values of one iteration.
///
/// Invariant: `non_zero_calls <= finite_calls <= calls`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub calls: usize,
    pub non_zero_calls: usize,
    pub finite_calls: usize,
    pub sum: f64,
    pub sum_of_squares: f64,
}

impl Statistics {
    /// Number of fields in [`Statistics::to_flat`].
    pub const FLAT_LEN: usize = 5;

    /// Adds one weighted integrand value.
    ///
    /// Non-finite values only count as calls. Finite zeros count as calls and finite calls.
    pub fn add(&mut self, value: f64) {
        self.calls += 1;
        if !value.is_finite() {
            return;
        }
        self.finite_calls += 1;
        if value == 0.0 {
            return;
        }
        self.non_zero_calls += 1;
        self.sum += value;
        self.sum_of_squares += value * value;
    }

    /// The sample mean, `sum / calls`, or zero without calls.
    pub fn mean(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.sum / self.calls as f64
        }
    }

    /// The variance of the mean.
    ///
    /// It is infinite for fewer than two calls, because it cannot be estimated.
    pub fn variance(&self) -> f64 {
        if self.calls <= 1 {
            return f64::INFINITY;
        }
        let n = self.calls as f64;
        let mean = self.sum / n;
        let variance = (self.sum_of_squares / n - mean * mean) / (n - 1.0);
        variance.max(0.0)
    }

    pub fn error(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Percentage of calls that returned a finite, non-zero value.
    pub fn efficiency(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            100.0 * self.non_zero_calls as f64 / self.calls as f64
        }
    }

    /// Number of calls that returned a non-finite value.
    pub fn non_finite_calls(&self) -> usize {
        self.calls - self.finite_calls
    }

    /// Checks the counter invariants and the finiteness of the moments.
    pub fn is_consistent(&self) -> bool {
        self.non_zero_calls <= self.finite_calls
            && self.finite_calls <= self.calls
            && self.sum.is_finite()
            && self.sum_of_squares.is_finite()
            && self.sum_of_squares >= 0.0
    }

    /// Layout used for the distributed reduction: counts are carried as `f64`.
    pub(crate) fn to_flat(self) -> [f64; Self::FLAT_LEN] {
        [
            self.calls as f64,
            self.non_zero_calls as f64,
            self.finite_calls as f64,
            self.sum,
            self.sum_of_squares,
        ]
    }

    pub(crate) fn from_flat(flat: &[f64]) -> Self {
        Statistics {
            calls: flat[0].round() as usize,
            non_zero_calls: flat[1].round() as usize,
            finite_calls: flat[2].round() as usize,
            sum: flat[3],
            sum_of_squares: flat[4],
        }
    }
}

impl AddAssign for Statistics {
    fn add_assign(&mut self, other: Self) {
        self.calls += other.calls;
        self.non_zero_calls += other.non_zero_calls;
        self.finite_calls += other.finite_calls;
        self.sum += other.sum;
        self.sum_of_squares += other.sum_of_squares;
    }
}

impl Add for Statistics {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}

/// Kahan-compensated accumulation of a single shard of integrand values.
#[derive(Debug, Clone, Default)]
pub(crate) struct Accumulator {
    statistics: Statistics,
    compensation: f64,
}

impl Accumulator {
    /// Adds a value and reports whether it entered the moments (finite and non-zero).
    pub(crate) fn add(&mut self, value: f64) -> bool {
        let stats = &mut self.statistics;
        stats.calls += 1;
        if !value.is_finite() {
            return false;
        }
        stats.finite_calls += 1;
        if value == 0.0 {
            return false;
        }
        stats.non_zero_calls += 1;

        let y = value - self.compensation;
        let t = stats.sum + y;
        self.compensation = (t - stats.sum) - y;
        stats.sum = t;
        stats.sum_of_squares += value * value;
        true
    }

    pub(crate) fn statistics(&self) -> Statistics {
        self.statistics
    }
}

/// Inverse-variance weighted combination of iteration results.
///
/// The combination is a commutative monoid: results can be pushed one by one or partial
/// combinations merged in any grouping. Iterations with zero variance are exact and take
/// precedence, but only when every call contributed a non-zero value. Iterations whose variance
/// is unknown, including the ones without any non-zero value, only count when nothing else is
/// available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Cumulative {
    calls: usize,
    iterations: usize,
    weighted_iterations: usize,
    sum_of_inv_variances: f64,
    sum_of_weighted_means: f64,
    sum_of_weighted_squared_means: f64,
    exact_calls: usize,
    exact_sum: f64,
    unweighted_calls: usize,
    unweighted_sum: f64,
}

impl Cumulative {
    pub fn new() -> Self {
        Self::default()
    }

    /// Combines all `results`.
    pub fn from_results(results: &[Statistics]) -> Self {
        results.iter().fold(Self::new(), |mut acc, result| {
            acc.push(result);
            acc
        })
    }

    pub fn push(&mut self, result: &Statistics) {
        self.calls += result.calls;
        self.iterations += 1;

        let mean = result.mean();
        let variance = result.variance();
        if variance == 0.0 && result.non_zero_calls == result.calls {
            self.exact_calls += result.calls;
            self.exact_sum += result.sum;
        } else if variance > 0.0 && variance.is_finite() {
            let inv_variance = 1.0 / variance;
            self.weighted_iterations += 1;
            self.sum_of_inv_variances += inv_variance;
            self.sum_of_weighted_means += inv_variance * mean;
            self.sum_of_weighted_squared_means += inv_variance * mean * mean;
        } else {
            self.unweighted_calls += result.calls;
            self.unweighted_sum += result.sum;
        }
    }

    pub fn merge(&mut self, other: &Cumulative) {
        self.calls += other.calls;
        self.iterations += other.iterations;
        self.weighted_iterations += other.weighted_iterations;
        self.sum_of_inv_variances += other.sum_of_inv_variances;
        self.sum_of_weighted_means += other.sum_of_weighted_means;
        self.sum_of_weighted_squared_means += other.sum_of_weighted_squared_means;
        self.exact_calls += other.exact_calls;
        self.exact_sum += other.exact_sum;
        self.unweighted_calls += other.unweighted_calls;
        self.unweighted_sum += other.unweighted_sum;
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    pub fn value(&self) -> f64 {
        if self.exact_calls > 0 {
            self.exact_sum / self.exact_calls as f64
        } else if self.sum_of_inv_variances > 0.0 {
            self.sum_of_weighted_means / self.sum_of_inv_variances
        } else if self.unweighted_calls > 0 {
            self.unweighted_sum / self.unweighted_calls as f64
        } else {
            0.0
        }
    }

    pub fn variance(&self) -> f64 {
        if self.exact_calls > 0 {
            0.0
        } else if self.sum_of_inv_variances > 0.0 {
            1.0 / self.sum_of_inv_variances
        } else if self.unweighted_calls > 0 {
            f64::INFINITY
        } else {
            0.0
        }
    }

    pub fn error(&self) -> f64 {
        self.variance().sqrt()
    }

    /// `Σ (m_i − m̄)² / v_i / (n − 1)` over the iterations with a finite, non-zero variance.
    ///
    /// This is a convergence diagnostic only.
    pub fn chi2_dof(&self) -> f64 {
        if self.weighted_iterations < 2 {
            return 0.0;
        }
        let chi2 = self.sum_of_weighted_squared_means
            - self.sum_of_weighted_means * self.sum_of_weighted_means / self.sum_of_inv_variances;
        chi2.max(0.0) / (self.weighted_iterations - 1) as f64
    }

    pub fn estimate(&self) -> Estimate {
        Estimate {
            value: self.value(),
            error: self.error(),
            chi2_dof: self.chi2_dof(),
            calls: self.calls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn stats_from(values: &[f64]) -> Statistics {
        let mut stats = Statistics::default();
        for &value in values {
            Statistics::add(&mut stats, value);
        }
        stats
    }

    #[test]
    fn test_call_accounting() {
        let stats = stats_from(&[1.0, 0.0, f64::NAN, f64::INFINITY, -2.0, 0.0]);
        assert_eq!(stats.calls, 6);
        assert_eq!(stats.finite_calls, 4);
        assert_eq!(stats.non_zero_calls, 2);
        assert_eq!(stats.non_finite_calls(), 2);
        assert_eq!(stats.sum, -1.0);
        assert_eq!(stats.sum_of_squares, 5.0);
        assert!(stats.is_consistent());
    }

    #[test]
    fn test_non_finite_only() {
        let stats = stats_from(&[f64::NAN; 100]);
        assert_eq!(stats.calls, 100);
        assert_eq!(stats.finite_calls, 0);
        assert_eq!(stats.non_zero_calls, 0);
        assert_eq!(stats.mean(), 0.0);
        assert_eq!(stats.variance(), 0.0);
    }

    #[test]
    fn test_mean_and_variance() {
        let stats = stats_from(&[1.0, 2.0, 3.0, 4.0]);
        assert_relative_eq!(stats.mean(), 2.5);
        // sample variance 5/3, variance of the mean 5/12
        assert_relative_eq!(stats.variance(), 5.0 / 12.0, max_relative = 1e-14);
        assert!(stats_from(&[1.0]).variance().is_infinite());
    }

    #[test]
    fn test_accumulator_matches_statistics() {
        let values: Vec<f64> = (0..1000).map(|i| (i as f64 * 0.37).sin()).collect();
        let mut acc = Accumulator::default();
        for &value in &values {
            acc.add(value);
        }
        let direct = stats_from(&values);
        let compensated = acc.statistics();
        assert_eq!(compensated.calls, direct.calls);
        assert_relative_eq!(compensated.sum, direct.sum, max_relative = 1e-12);
        assert_relative_eq!(
            compensated.sum_of_squares,
            direct.sum_of_squares,
            max_relative = 1e-12
        );
    }

    #[test]
    fn test_flat_layout() {
        let stats = stats_from(&[0.5, 0.0, f64::NAN, 1.5]);
        let back = Statistics::from_flat(&stats.to_flat());
        assert_eq!(back, stats);
    }

    #[test]
    fn test_inverse_variance_combination() {
        let a = stats_from(&[1.0, 1.2, 0.8, 1.1]);
        let b = stats_from(&[0.9, 1.05, 1.0, 0.95, 1.1, 0.98]);
        let combined = Cumulative::from_results(&[a, b]);

        let (va, vb) = (a.variance(), b.variance());
        let expected = (a.mean() / va + b.mean() / vb) / (1.0 / va + 1.0 / vb);
        assert_relative_eq!(combined.value(), expected, max_relative = 1e-14);
        assert_relative_eq!(
            combined.variance(),
            1.0 / (1.0 / va + 1.0 / vb),
            max_relative = 1e-14
        );

        let chi2 = (a.mean() - expected).powi(2) / va + (b.mean() - expected).powi(2) / vb;
        assert_relative_eq!(combined.chi2_dof(), chi2, max_relative = 1e-8);
        assert_eq!(combined.calls(), 10);
    }

    #[test]
    fn test_combination_is_associative_and_commutative() {
        let results: Vec<Statistics> = (0..6)
            .map(|k| {
                let values: Vec<f64> = (0..50)
                    .map(|i| 1.0 + 0.1 * ((i * (k + 3)) as f64).cos())
                    .collect();
                stats_from(&values)
            })
            .collect();

        let all = Cumulative::from_results(&results);

        let mut left = Cumulative::from_results(&results[..2]);
        let right = Cumulative::from_results(&results[2..]);
        left.merge(&right);

        let mut reversed = results.clone();
        reversed.reverse();
        let mut grouped = Cumulative::from_results(&reversed[..3]);
        grouped.merge(&Cumulative::from_results(&reversed[3..]));

        for other in [left, grouped] {
            assert_relative_eq!(other.value(), all.value(), max_relative = 1e-12);
            assert_relative_eq!(other.variance(), all.variance(), max_relative = 1e-12);
            assert_relative_eq!(
                other.chi2_dof(),
                all.chi2_dof(),
                max_relative = 1e-6,
                epsilon = 1e-9
            );
            assert_eq!(other.calls(), all.calls());
        }
    }

    #[test]
    fn test_exact_iterations_take_precedence() {
        let exact = stats_from(&[1.0; 10]);
        let noisy = stats_from(&[0.5, 1.5, 0.7]);
        assert_eq!(exact.variance(), 0.0);

        let combined = Cumulative::from_results(&[noisy, exact]);
        assert_eq!(combined.value(), 1.0);
        assert_eq!(combined.error(), 0.0);
    }

    #[test]
    fn test_iterations_without_values_are_not_exact() {
        let mut values = vec![0.0; 1_000];
        for value in values.iter_mut().step_by(100) {
            *value = 100.0;
        }
        let big = stats_from(&values);
        let empty = stats_from(&[0.0; 5]);
        assert_eq!(empty.variance(), 0.0);

        let alone = Cumulative::from_results(&[empty]);
        assert_eq!(alone.value(), 0.0);
        assert_eq!(alone.variance(), f64::INFINITY);

        for results in [[big, empty], [empty, big]] {
            let combined = Cumulative::from_results(&results);
            assert_relative_eq!(combined.value(), big.mean(), max_relative = 1e-14);
            assert_relative_eq!(combined.variance(), big.variance(), max_relative = 1e-14);
            assert_eq!(combined.calls(), 1_005);
        }
    }
}
