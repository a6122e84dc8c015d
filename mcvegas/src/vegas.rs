//! The VEGAS mapping: importance sampling with a separable adaptive grid.

use crate::config::VegasConfig;
use crate::error::{Error, Result};
use crate::grid::VegasPdf;
use crate::mapping::{check_compatible, Adjustment, Mapping, MappingKind, MappingState, Sample};

/// Samples points from a [`VegasPdf`] and refines it after every iteration.
#[derive(Debug, Clone)]
pub struct Vegas {
    pdf: VegasPdf,
    config: VegasConfig,
}

impl Vegas {
    /// Creates a VEGAS mapping with uniform grids.
    ///
    /// # Arguments
    ///
    /// * `dimensions`: The number of dimensions of the integrand.
    /// * `config`: The number of bins per dimension, the damping exponent `alpha` and the
    ///   refinement formula.
    pub fn new(dimensions: usize, config: VegasConfig) -> Result<Self> {
        let pdf = VegasPdf::new(dimensions, &config)?;
        Ok(Vegas { pdf, config })
    }

    /// Creates a VEGAS mapping starting from a previously adapted density.
    pub fn with_pdf(pdf: VegasPdf, config: VegasConfig) -> Result<Self> {
        config.validate()?;
        if pdf.bins() != config.bins {
            return Err(Error::config(format!(
                "the grid has {} bins, the configuration {}",
                pdf.bins(),
                config.bins
            )));
        }
        Ok(Vegas { pdf, config })
    }

    pub fn pdf(&self) -> &VegasPdf {
        &self.pdf
    }

    pub fn config(&self) -> &VegasConfig {
        &self.config
    }
}

impl Mapping for Vegas {
    fn kind(&self) -> MappingKind {
        MappingKind::Vegas
    }

    fn dimensions(&self) -> usize {
        self.pdf.dimensions()
    }

    fn random_numbers(&self) -> usize {
        self.pdf.dimensions()
    }

    fn new_sample(&self) -> Sample {
        Sample::new(self.pdf.dimensions(), 0, 0)
    }

    fn adjustment_len(&self) -> usize {
        self.pdf.adjustment_len()
    }

    fn sample(&self, draws: &[f64], coordinates: &mut [f64], sample: &mut Sample) {
        sample.weight = self.pdf.sample(draws, coordinates, &mut sample.bins);
    }

    fn record(&self, sample: &Sample, value: f64, adjustment: &mut Adjustment) {
        self.pdf
            .accumulate(adjustment.as_mut_slice(), &sample.bins, value * value);
    }

    fn refine(&mut self, adjustment: &Adjustment) -> Result<()> {
        self.pdf.refine(adjustment.as_slice(), &self.config)
    }

    fn state(&self) -> MappingState {
        MappingState::Vegas {
            dimensions: self.pdf.dimensions(),
            config: self.config,
            grids: self.pdf.grids().to_vec(),
        }
    }

    fn restore(&mut self, state: &MappingState) -> Result<()> {
        let MappingState::Vegas {
            dimensions,
            config,
            grids,
        } = state
        else {
            return check_compatible("the integrator kind", state.kind(), MappingKind::Vegas);
        };
        check_compatible("the number of dimensions", *dimensions, self.dimensions())?;
        check_vegas_config(config, &self.config)?;
        let pdf = VegasPdf::from_grids(grids.clone())?;
        check_compatible("the number of grids", pdf.dimensions(), self.dimensions())?;
        self.pdf = pdf;
        Ok(())
    }

    fn export(&self, buffer: &mut Vec<f64>) {
        self.pdf.export(buffer);
    }

    fn export_len(&self) -> usize {
        self.pdf.export_len()
    }

    fn import(&mut self, values: &[f64]) -> Result<()> {
        self.pdf.import(values)
    }
}

pub(crate) fn check_vegas_config(stored: &VegasConfig, live: &VegasConfig) -> Result<()> {
    check_compatible("the number of bins", stored.bins, live.bins)?;
    check_compatible("alpha", stored.alpha, live.alpha)?;
    check_compatible("the refinement formula", stored.refinement, live.refinement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::DefaultCallback;
    use crate::integrand::{Integrand, Point};
    use crate::integrator::Integrator;

    // Integral of the form exp(-x^2 - y^2) in [-1, 1]^2.
    struct GaussianIntegrand;

    impl Integrand for GaussianIntegrand {
        fn dim(&self) -> usize {
            2
        }

        fn eval(&self, point: &Point<'_>) -> f64 {
            let x = 2.0 * point.coordinates()[0] - 1.0;
            let y = 2.0 * point.coordinates()[1] - 1.0;
            4.0 * (-(x * x) - y * y).exp()
        }
    }

    const ANALYTICAL_RESULT: f64 = 2.230985;

    #[test]
    fn test_integrate_gaussian() {
        let vegas = Vegas::new(2, VegasConfig::new(50, 0.5)).unwrap();
        let mut integrator = Integrator::new(vegas);
        integrator.set_seed(1234);
        let result = integrator
            .integrate(&GaussianIntegrand, &[100_000; 10], DefaultCallback::default())
            .unwrap();

        assert!(
            (result.value - ANALYTICAL_RESULT).abs() < 5.0 * result.error,
            "Analytical={} vs. mcvegas={}+/-{}",
            ANALYTICAL_RESULT,
            result.value,
            result.error
        );
        assert!(result.chi2_dof < 5.0, "chi2_dof: {}", result.chi2_dof);
        assert_eq!(result.calls, 1_000_000);
    }

    #[test]
    fn test_refinement_reduces_error() {
        let vegas = Vegas::new(2, VegasConfig::new(50, 1.5)).unwrap();
        let mut integrator = Integrator::new(vegas);
        for _ in 0..5 {
            integrator.iterate(&GaussianIntegrand, 20_000).unwrap();
        }
        let first = integrator.results()[0].error();
        let last = integrator.results()[4].error();
        assert!(last < first, "first={first} last={last}");
    }

    #[test]
    fn test_restore_rejects_other_configuration() {
        let vegas = Vegas::new(2, VegasConfig::new(10, 1.0)).unwrap();
        let state = vegas.state();

        let mut other = Vegas::new(2, VegasConfig::new(12, 1.0)).unwrap();
        assert!(matches!(other.restore(&state), Err(Error::Configuration(_))));

        let mut other = Vegas::new(2, VegasConfig::new(10, 0.5)).unwrap();
        assert!(other.restore(&state).is_err());

        let mut other = Vegas::new(3, VegasConfig::new(10, 1.0)).unwrap();
        assert!(other.restore(&state).is_err());

        let mut same = Vegas::new(2, VegasConfig::new(10, 1.0)).unwrap();
        assert!(same.restore(&state).is_ok());
    }
}
