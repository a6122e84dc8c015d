//! Multi-channel mappings, optionally with a VEGAS grid in front of every channel.

use tracing::trace;

use crate::channel::{ChannelSet, ChannelSummary, GridChannel};
use crate::config::{ChannelConfig, VegasConfig};
use crate::error::{Error, Result};
use crate::grid::VegasPdf;
use crate::mapping::{check_compatible, Adjustment, Mapping, MappingKind, MappingState, Sample};
use crate::vegas::check_vegas_config;

fn check_channel_config(stored: &ChannelConfig, live: &ChannelConfig) -> Result<()> {
    check_compatible("beta", stored.beta, live.beta)?;
    check_compatible("the minimum channel weight", stored.min_weight, live.min_weight)
}

/// Counts a point of the channel that generated it, stored after the `channels` statistics.
fn count_point(channels: usize, sample: &Sample, adjustment: &mut Adjustment) {
    if let Some(chosen) = sample.channel {
        adjustment.as_mut_slice()[channels + chosen] += 1.0;
    }
}

/// Selects one of several channels for each point and weights it with all channel densities.
///
/// The first uniform number of a point selects the channel, the remaining ones are mapped by
/// it.
pub struct MultiChannel {
    channels: ChannelSet,
}

impl MultiChannel {
    pub fn new(channels: ChannelSet) -> Self {
        MultiChannel { channels }
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }
}

impl Mapping for MultiChannel {
    fn kind(&self) -> MappingKind {
        MappingKind::MultiChannel
    }

    fn dimensions(&self) -> usize {
        self.channels.dim()
    }

    fn random_numbers(&self) -> usize {
        1 + self.channels.dim()
    }

    fn new_sample(&self) -> Sample {
        Sample::new(0, self.channels.len(), 0)
    }

    /// The channel statistics followed by the number of points of every channel.
    fn adjustment_len(&self) -> usize {
        2 * self.channels.len()
    }

    fn sample(&self, draws: &[f64], coordinates: &mut [f64], sample: &mut Sample) {
        let chosen = self.channels.select(draws[0]);
        let density = self.channels.sample(chosen, &draws[1..], coordinates);

        for (index, value) in sample.densities.iter_mut().enumerate() {
            *value = if index == chosen {
                density
            } else if self.channels.is_enabled(index) {
                self.channels.channel(index).density(coordinates)
            } else {
                0.0
            };
        }

        sample.channel = Some(chosen);
        sample.weight = self.channels.combined_weight(&sample.densities);
    }

    fn count(&self, sample: &Sample, adjustment: &mut Adjustment) {
        count_point(self.channels.len(), sample, adjustment);
    }

    fn record(&self, sample: &Sample, value: f64, adjustment: &mut Adjustment) {
        let n = self.channels.len();
        self.channels.accumulate(
            &mut adjustment.as_mut_slice()[..n],
            &sample.densities,
            value * value,
        );
    }

    fn summary(&self, adjustment: &Adjustment, calls: usize) -> Option<ChannelSummary> {
        let n = self.channels.len();
        let (statistics, counts) = adjustment.as_slice().split_at(n);
        Some(self.channels.summary(statistics, counts, calls))
    }

    fn refine(&mut self, adjustment: &Adjustment) -> Result<()> {
        if adjustment.len() != self.adjustment_len() {
            return Err(Error::config("adjustment data does not match the mapping"));
        }
        self.channels.refine(&adjustment.as_slice()[..self.channels.len()])
    }

    fn state(&self) -> MappingState {
        MappingState::MultiChannel {
            dimensions: self.channels.dim(),
            config: *self.channels.config(),
            weights: self.channels.weights().to_vec(),
        }
    }

    fn restore(&mut self, state: &MappingState) -> Result<()> {
        let MappingState::MultiChannel {
            dimensions,
            config,
            weights,
        } = state
        else {
            return check_compatible(
                "the integrator kind",
                state.kind(),
                MappingKind::MultiChannel,
            );
        };
        check_compatible("the number of dimensions", *dimensions, self.dimensions())?;
        check_channel_config(config, self.channels.config())?;
        check_compatible("the number of channels", weights.len(), self.channels.len())?;
        self.channels.set_weights(weights.clone())
    }

    fn export(&self, buffer: &mut Vec<f64>) {
        buffer.extend_from_slice(self.channels.weights());
    }

    fn export_len(&self) -> usize {
        self.channels.len()
    }

    fn import(&mut self, values: &[f64]) -> Result<()> {
        self.channels
            .set_weights(values.to_vec())
            .map_err(|err| Error::sync(format!("received invalid channel weights: {err}")))
    }
}

/// Multi-channel sampling where every channel owns a VEGAS grid over its uniform numbers.
///
/// A point of channel `c` is generated by `u → grid_c → u' → channel_c → x`. Its density in
/// channel `k` is `channel_k.density(x) · grid_k.density(channel_k⁻¹(x))`. Grid `c` adapts only
/// to the points generated by channel `c`.
pub struct MultiChannelVegas {
    channels: ChannelSet<dyn GridChannel>,
    pdfs: Vec<VegasPdf>,
    config: VegasConfig,
}

impl MultiChannelVegas {
    pub fn new(channels: ChannelSet<dyn GridChannel>, config: VegasConfig) -> Result<Self> {
        let pdf = VegasPdf::new(channels.dim(), &config)?;
        let pdfs = vec![pdf; channels.len()];
        Ok(MultiChannelVegas {
            channels,
            pdfs,
            config,
        })
    }

    pub fn channels(&self) -> &ChannelSet<dyn GridChannel> {
        &self.channels
    }

    /// The grid of channel `channel`.
    pub fn pdf(&self, channel: usize) -> &VegasPdf {
        &self.pdfs[channel]
    }

    fn grid_data_len(&self) -> usize {
        self.pdfs[0].adjustment_len()
    }
}

impl Mapping for MultiChannelVegas {
    fn kind(&self) -> MappingKind {
        MappingKind::MultiChannelVegas
    }

    fn dimensions(&self) -> usize {
        self.channels.dim()
    }

    fn random_numbers(&self) -> usize {
        1 + self.channels.dim()
    }

    fn new_sample(&self) -> Sample {
        let dim = self.channels.dim();
        Sample::new(dim, self.channels.len(), dim)
    }

    /// The channel statistics, the number of points of every channel and the grid data of
    /// every channel.
    fn adjustment_len(&self) -> usize {
        self.channels.len() * (2 + self.grid_data_len())
    }

    fn sample(&self, draws: &[f64], coordinates: &mut [f64], sample: &mut Sample) {
        let chosen = self.channels.select(draws[0]);
        let jacobian =
            self.pdfs[chosen].sample(&draws[1..], &mut sample.grid_draws, &mut sample.bins);
        let density = self.channels.sample(chosen, &sample.grid_draws, coordinates);

        for (index, value) in sample.densities.iter_mut().enumerate() {
            *value = if index == chosen {
                density / jacobian
            } else if self.channels.is_enabled(index) {
                let channel = self.channels.channel(index);
                let channel_density = channel.density(coordinates);
                if channel_density == 0.0 {
                    0.0
                } else {
                    channel.inverse(coordinates, &mut sample.scratch);
                    channel_density * self.pdfs[index].density(&sample.scratch)
                }
            } else {
                0.0
            };
        }

        sample.channel = Some(chosen);
        sample.weight = self.channels.combined_weight(&sample.densities);
    }

    fn count(&self, sample: &Sample, adjustment: &mut Adjustment) {
        count_point(self.channels.len(), sample, adjustment);
    }

    fn record(&self, sample: &Sample, value: f64, adjustment: &mut Adjustment) {
        let Some(chosen) = sample.channel else {
            return;
        };
        let value2 = value * value;
        let n = self.channels.len();
        let len = self.grid_data_len();
        let data = adjustment.as_mut_slice();
        let (weights, rest) = data.split_at_mut(n);
        let grids = &mut rest[n..];
        self.channels.accumulate(weights, &sample.densities, value2);
        self.pdfs[chosen].accumulate(
            &mut grids[chosen * len..(chosen + 1) * len],
            &sample.bins,
            value2,
        );
    }

    fn refine(&mut self, adjustment: &Adjustment) -> Result<()> {
        if adjustment.len() != self.adjustment_len() {
            return Err(Error::config("adjustment data does not match the mapping"));
        }
        let n = self.channels.len();
        let len = self.grid_data_len();
        let (weights, rest) = adjustment.as_slice().split_at(n);
        let grids = &rest[n..];
        if self.config.alpha > 0.0 && grids.iter().all(|&value| value == 0.0) {
            return Err(Error::config(
                "no channel grid received a contribution, the integrand vanished at every point",
            ));
        }

        let mut pdfs = self.pdfs.clone();
        for (channel, (pdf, data)) in pdfs.iter_mut().zip(grids.chunks(len)).enumerate() {
            if data.iter().all(|&value| value == 0.0) {
                trace!(channel, "no contributions, keeping the grid");
                continue;
            }
            pdf.refine(data, &self.config).map_err(|err| match err {
                Error::Configuration(message) => {
                    Error::Configuration(format!("channel {channel}: {message}"))
                }
                other => other,
            })?;
        }

        self.channels.refine(weights)?;
        self.pdfs = pdfs;
        Ok(())
    }

    fn summary(&self, adjustment: &Adjustment, calls: usize) -> Option<ChannelSummary> {
        let n = self.channels.len();
        let data = adjustment.as_slice();
        Some(self.channels.summary(&data[..n], &data[n..2 * n], calls))
    }

    fn state(&self) -> MappingState {
        MappingState::MultiChannelVegas {
            dimensions: self.channels.dim(),
            channel_config: *self.channels.config(),
            vegas_config: self.config,
            weights: self.channels.weights().to_vec(),
            grids: self.pdfs.iter().map(|pdf| pdf.grids().to_vec()).collect(),
        }
    }

    fn restore(&mut self, state: &MappingState) -> Result<()> {
        let MappingState::MultiChannelVegas {
            dimensions,
            channel_config,
            vegas_config,
            weights,
            grids,
        } = state
        else {
            return check_compatible(
                "the integrator kind",
                state.kind(),
                MappingKind::MultiChannelVegas,
            );
        };
        check_compatible("the number of dimensions", *dimensions, self.dimensions())?;
        check_channel_config(channel_config, self.channels.config())?;
        check_vegas_config(vegas_config, &self.config)?;
        check_compatible("the number of channels", weights.len(), self.channels.len())?;
        check_compatible("the number of grid sets", grids.len(), self.channels.len())?;

        let pdfs = grids
            .iter()
            .map(|grids| {
                let pdf = VegasPdf::from_grids(grids.clone())?;
                check_compatible("the number of grids", pdf.dimensions(), *dimensions)?;
                Ok(pdf)
            })
            .collect::<Result<Vec<_>>>()?;
        self.channels.set_weights(weights.clone())?;
        self.pdfs = pdfs;
        Ok(())
    }

    fn export(&self, buffer: &mut Vec<f64>) {
        buffer.extend_from_slice(self.channels.weights());
        for pdf in &self.pdfs {
            pdf.export(buffer);
        }
    }

    fn export_len(&self) -> usize {
        self.channels.len() + self.pdfs.iter().map(VegasPdf::export_len).sum::<usize>()
    }

    fn import(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.export_len() {
            return Err(Error::sync("channel parameter length mismatch"));
        }
        let n = self.channels.len();
        let (weights, edges) = values.split_at(n);
        let mut pdfs = self.pdfs.clone();
        let len = pdfs[0].export_len();
        for (pdf, values) in pdfs.iter_mut().zip(edges.chunks(len)) {
            pdf.import(values)?;
        }
        self.channels
            .set_weights(weights.to_vec())
            .map_err(|err| Error::sync(format!("received invalid channel weights: {err}")))?;
        self.pdfs = pdfs;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::DefaultCallback;
    use crate::channel::{Channel, Uniform};
    use crate::integrand::{Function, Point};
    use crate::integrator::Integrator;
    use approx::assert_relative_eq;

    /// Maps `u` to `x = u²` in every dimension, which samples points close to zero.
    struct Square {
        dim: usize,
    }

    impl Channel for Square {
        fn dim(&self) -> usize {
            self.dim
        }

        fn map(&self, draws: &[f64], coordinates: &mut [f64]) -> f64 {
            for (x, &u) in coordinates.iter_mut().zip(draws) {
                *x = u * u;
            }
            self.density(coordinates)
        }

        fn density(&self, coordinates: &[f64]) -> f64 {
            coordinates
                .iter()
                .map(|&x| if x > 0.0 { 0.5 / x.sqrt() } else { 0.0 })
                .product()
        }
    }

    impl GridChannel for Square {
        fn inverse(&self, coordinates: &[f64], draws: &mut [f64]) {
            for (u, &x) in draws.iter_mut().zip(coordinates) {
                *u = x.sqrt();
            }
        }
    }

    fn channels(config: ChannelConfig) -> ChannelSet<dyn GridChannel> {
        let channels: Vec<Box<dyn GridChannel>> =
            vec![Box::new(Uniform::new(2)), Box::new(Square { dim: 2 })];
        ChannelSet::uniform(channels, config).unwrap()
    }

    fn plain_channels(config: ChannelConfig) -> ChannelSet {
        let channels: Vec<Box<dyn Channel>> =
            vec![Box::new(Uniform::new(2)), Box::new(Square { dim: 2 })];
        ChannelSet::uniform(channels, config).unwrap()
    }

    #[test]
    fn test_sample_weight_is_inverse_total_density() {
        let mapping = MultiChannel::new(plain_channels(ChannelConfig::default()));
        let mut sample = mapping.new_sample();
        let mut x = [0.0; 2];
        mapping.sample(&[0.75, 0.5, 0.5], &mut x, &mut sample);

        assert_eq!(sample.channel(), Some(1));
        assert_eq!(x, [0.25, 0.25]);
        // uniform density 1, square density (0.5 / 0.5)^2 = 1
        assert_relative_eq!(sample.weight(), 1.0);

        mapping.sample(&[0.25, 0.64, 0.36], &mut x, &mut sample);
        assert_eq!(sample.channel(), Some(0));
        let square = 0.5 / 0.64f64.sqrt() * 0.5 / 0.36f64.sqrt();
        assert_relative_eq!(sample.weight(), 1.0 / (0.5 + 0.5 * square), max_relative = 1e-14);
    }

    #[test]
    fn test_grid_densities_are_consistent() {
        let mut mapping = MultiChannelVegas::new(
            channels(ChannelConfig::default()),
            VegasConfig::new(8, 1.0),
        )
        .unwrap();

        // adapt both grids to a non-uniform shape
        let mut adjustment = mapping.new_adjustment();
        let data = adjustment.as_mut_slice();
        data[0] = 1.0;
        data[1] = 1.0;
        for (i, value) in data[4..].iter_mut().enumerate() {
            *value = 1.0 + (i % 8) as f64;
        }
        mapping.refine(&adjustment).unwrap();

        let mut sample = mapping.new_sample();
        let mut x = [0.0; 2];
        for draws in [[0.1, 0.3, 0.9], [0.7, 0.2, 0.6]] {
            mapping.sample(&draws, &mut x, &mut sample);
            let chosen = sample.channel().unwrap();
            let other = 1 - chosen;

            // the density of the chosen channel computed through the inverse mapping must
            // agree with the one known from sampling
            let channel = mapping.channels().channel(chosen);
            let mut u = [0.0; 2];
            channel.inverse(&x, &mut u);
            let through_inverse = channel.density(&x) * mapping.pdf(chosen).density(&u);
            assert_relative_eq!(
                sample.densities[chosen],
                through_inverse,
                max_relative = 1e-10
            );
            assert!(sample.densities[other] > 0.0);
        }
    }

    #[test]
    fn test_channels_without_points_keep_their_grid() {
        let mut mapping = MultiChannelVegas::new(
            channels(ChannelConfig::new(0.5, 0.0)),
            VegasConfig::new(4, 1.5),
        )
        .unwrap();
        let before = mapping.pdf(1).clone();

        let mut adjustment = mapping.new_adjustment();
        let data = adjustment.as_mut_slice();
        data[0] = 2.0;
        data[1] = 1.0;
        data[4..12].copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 4.0, 3.0, 2.0, 1.0]);
        mapping.refine(&adjustment).unwrap();

        assert_eq!(mapping.pdf(1), &before);
        assert_ne!(mapping.pdf(0), &before);
        assert!(mapping.channels().weights()[0] > 0.5);
    }

    #[test]
    fn test_vanishing_grid_data_is_an_error() {
        let mut mapping = MultiChannelVegas::new(
            channels(ChannelConfig::new(0.5, 0.0)),
            VegasConfig::new(4, 1.5),
        )
        .unwrap();
        let before = mapping.state();

        // channel statistics and point counts, but no grid received any contribution
        let mut adjustment = mapping.new_adjustment();
        adjustment.as_mut_slice()[..4].copy_from_slice(&[1.0, 2.0, 10.0, 10.0]);
        assert!(matches!(
            mapping.refine(&adjustment),
            Err(Error::Configuration(_))
        ));
        assert_eq!(mapping.state(), before);

        let mut frozen = MultiChannelVegas::new(
            channels(ChannelConfig::new(0.5, 0.0)),
            VegasConfig::new(4, 0.0),
        )
        .unwrap();
        assert!(frozen.refine(&adjustment).is_ok());
    }

    #[test]
    fn test_summary_counts_points_per_channel() {
        let integrand = Function::new(2, |p: &Point<'_>| p.coordinates()[0]);
        let mapping = MultiChannel::new(plain_channels(ChannelConfig::new(0.5, 0.1)));
        let mut integrator = Integrator::new(mapping);
        integrator
            .integrate(&integrand, &[3_000, 4_000], DefaultCallback::default())
            .unwrap();

        let summaries: Vec<&ChannelSummary> =
            integrator.channel_summaries().iter().flatten().collect();
        assert_eq!(summaries.len(), 2);
        for (summary, calls) in summaries.iter().zip([3_000, 4_000]) {
            assert_eq!(summary.calls.iter().sum::<usize>(), calls);
            assert!(summary.calls.iter().all(|&count| count > 0));
            assert!(summary.max_difference() > 0.0);
        }
        // the first iteration was sampled with the initial weights
        assert_eq!(summaries[0].weights, vec![0.5, 0.5]);
        assert_relative_eq!(summaries[1].weights.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_export_import() {
        let mut mapping = MultiChannelVegas::new(
            channels(ChannelConfig::new(0.5, 0.1)),
            VegasConfig::new(4, 1.5),
        )
        .unwrap();
        let mut adjustment = mapping.new_adjustment();
        for (i, value) in adjustment.as_mut_slice().iter_mut().enumerate() {
            *value = 1.0 + (i % 5) as f64;
        }
        mapping.refine(&adjustment).unwrap();

        let mut buffer = Vec::new();
        mapping.export(&mut buffer);
        assert_eq!(buffer.len(), mapping.export_len());

        let mut other = MultiChannelVegas::new(
            channels(ChannelConfig::new(0.5, 0.1)),
            VegasConfig::new(4, 1.5),
        )
        .unwrap();
        other.import(&buffer).unwrap();
        assert_eq!(other.state(), mapping.state());
        assert!(matches!(
            other.import(&buffer[..3]),
            Err(Error::DistributedSync(_))
        ));
    }

    #[test]
    fn test_restore_checks_channel_count() {
        let mapping = MultiChannel::new(plain_channels(ChannelConfig::default()));
        let state = mapping.state();

        let single: Vec<Box<dyn Channel>> = vec![Box::new(Uniform::new(2))];
        let mut other = MultiChannel::new(
            ChannelSet::uniform(single, ChannelConfig::default()).unwrap(),
        );
        assert!(matches!(other.restore(&state), Err(Error::Configuration(_))));

        let mut other = MultiChannel::new(plain_channels(ChannelConfig::new(0.5, 0.0)));
        assert!(other.restore(&state).is_err());

        let mut same = MultiChannel::new(plain_channels(ChannelConfig::default()));
        assert!(same.restore(&state).is_ok());
    }

    #[test]
    fn test_integrates_endpoint_singularity() {
        // ∫ 1/sqrt(x y) over the unit square is 4
        let integrand = Function::new(2, |p: &Point<'_>| {
            p.coordinates().iter().map(|&x| 1.0 / x.sqrt()).product()
        });
        let mapping = MultiChannelVegas::new(
            channels(ChannelConfig::new(0.5, 0.05)),
            VegasConfig::new(32, 1.0),
        )
        .unwrap();
        let mut integrator = Integrator::new(mapping);
        let result = integrator
            .integrate(&integrand, &[20_000; 8], DefaultCallback::default())
            .unwrap();

        assert!(
            (result.value - 4.0).abs() < 5.0 * result.error,
            "{} +/- {}",
            result.value,
            result.error
        );
        // the square channel samples the singularity with a finite weight
        assert!(integrator.mapping().channels().weights()[1] > 0.5);
    }
}
