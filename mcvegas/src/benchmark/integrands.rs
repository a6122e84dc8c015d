//! Standard benchmark integrands for Monte Carlo integration.
//!
//! The Genz families have closed-form integrals over the unit hypercube, which makes them
//! useful for checking an integrator and for timing it.

use std::f64::consts::PI;

use libm::erf;
use wide::{f64x4, CmpGt};

use crate::integrand::{Integrand, Point, SimdIntegrand};

/// The shape of a [`Genz`] function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenzFamily {
    /// `cos(Σ c_i (x_i − w_i))`.
    Oscillatory,
    /// `Π 1 / (c_i⁻² + (x_i − w_i)²)`.
    ProductPeak,
    /// `exp(−Σ c_i² (x_i − w_i)²)`.
    Gaussian,
}

/// A Genz test function with difficulty parameters `c` and offsets `w`.
#[derive(Debug, Clone)]
pub struct Genz {
    family: GenzFamily,
    c: Vec<f64>,
    w: Vec<f64>,
    c_simd: Vec<f64x4>,
    w_simd: Vec<f64x4>,
}

/// Deterministic parameters with `c_i` in `[1, 5)` and `w_i` in `[0, 1)`.
fn genz_params(dim: usize) -> (Vec<f64>, Vec<f64>) {
    (1..=dim)
        .map(|i| {
            let root = (i as f64 + 1.0).sqrt();
            (1.0 + 4.0 * (root * 12345.).fract(), (root * 54321.).fract())
        })
        .unzip()
}

impl Genz {
    pub fn new(family: GenzFamily, dim: usize) -> Self {
        let (c, w) = genz_params(dim);
        Self::with_parameters(family, c, w)
    }

    pub fn oscillatory(dim: usize) -> Self {
        Self::new(GenzFamily::Oscillatory, dim)
    }

    pub fn product_peak(dim: usize) -> Self {
        Self::new(GenzFamily::ProductPeak, dim)
    }

    pub fn gaussian(dim: usize) -> Self {
        Self::new(GenzFamily::Gaussian, dim)
    }

    /// Uses the given parameters; `c` and `w` must have the same length and `c` must not
    /// contain zeros.
    pub fn with_parameters(family: GenzFamily, c: Vec<f64>, w: Vec<f64>) -> Self {
        debug_assert_eq!(c.len(), w.len());
        let c_simd = c.iter().map(|&val| f64x4::splat(val)).collect();
        let w_simd = w.iter().map(|&val| f64x4::splat(val)).collect();
        Genz {
            family,
            c,
            w,
            c_simd,
            w_simd,
        }
    }

    pub fn family(&self) -> GenzFamily {
        self.family
    }

    pub fn analytical_result(&self) -> f64 {
        let params = self.c.iter().zip(&self.w);
        match self.family {
            GenzFamily::Oscillatory => {
                // real part of Π ∫ exp(i c (x − w)) dx
                let (re, _) = params.fold((1.0, 0.0), |(re, im), (&c, &w)| {
                    let (upper, lower) = (c * (1. - w), c * w);
                    let factor_re = (upper.sin() + lower.sin()) / c;
                    let factor_im = (lower.cos() - upper.cos()) / c;
                    (
                        re * factor_re - im * factor_im,
                        re * factor_im + im * factor_re,
                    )
                });
                re
            }
            GenzFamily::ProductPeak => params
                .map(|(&c, &w)| c * ((c * (1. - w)).atan() + (c * w).atan()))
                .product(),
            GenzFamily::Gaussian => params
                .map(|(&c, &w)| PI.sqrt() / (2. * c) * (erf(c * (1. - w)) + erf(c * w)))
                .product(),
        }
    }
}

impl Integrand for Genz {
    fn dim(&self) -> usize {
        self.c.len()
    }

    fn eval(&self, point: &Point<'_>) -> f64 {
        let x = point.coordinates();
        let params = self.c.iter().zip(&self.w).zip(x);
        match self.family {
            GenzFamily::Oscillatory => params.map(|((c, w), x)| c * (x - w)).sum::<f64>().cos(),
            GenzFamily::ProductPeak => params
                .map(|((c, w), x)| 1.0 / (c.powi(-2) + (x - w).powi(2)))
                .product(),
            GenzFamily::Gaussian => {
                let sum: f64 = params.map(|((c, w), x)| (c * (x - w)).powi(2)).sum();
                (-sum).exp()
            }
        }
    }
}

impl SimdIntegrand for Genz {
    fn dim(&self) -> usize {
        self.c.len()
    }

    fn eval_simd(&self, x: &[f64x4]) -> f64x4 {
        let params = self.c_simd.iter().zip(&self.w_simd).zip(x);
        let one = f64x4::splat(1.0);
        match self.family {
            GenzFamily::Oscillatory => params
                .fold(f64x4::splat(0.), |sum, ((&c, &w), &x)| sum + c * (x - w))
                .cos(),
            GenzFamily::ProductPeak => params.fold(one, |result, ((&c, &w), &x)| {
                let d = x - w;
                result / (one / (c * c) + d * d)
            }),
            GenzFamily::Gaussian => {
                let sum = params.fold(f64x4::splat(0.), |sum, ((&c, &w), &x)| {
                    let d = c * (x - w);
                    sum + d * d
                });
                (-sum).exp()
            }
        }
    }
}

/// `Π x_i^(−1/2)`, integrable but unbounded at the lower boundary.
#[derive(Debug, Clone)]
pub struct EndpointSingularity {
    dim: usize,
}

impl EndpointSingularity {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    pub fn analytical_result(&self) -> f64 {
        2.0f64.powi(self.dim as i32)
    }
}

impl Integrand for EndpointSingularity {
    fn dim(&self) -> usize {
        self.dim
    }

    fn eval(&self, point: &Point<'_>) -> f64 {
        let mut result = 1.0;
        for &val in point.coordinates() {
            if val <= 0.0 {
                return 0.0;
            }
            result /= val.sqrt();
        }
        result
    }
}

impl SimdIntegrand for EndpointSingularity {
    fn dim(&self) -> usize {
        self.dim
    }

    fn eval_simd(&self, x: &[f64x4]) -> f64x4 {
        let zero = f64x4::splat(0.0);
        x.iter().fold(f64x4::splat(1.0), |result, &val| {
            val.cmp_gt(zero).blend(result / val.sqrt(), zero)
        })
    }
}
