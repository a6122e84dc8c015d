//! The `Integrand` trait, which defines the function to be integrated.

use wide::f64x4;

/// A point of the unit hypercube handed to an integrand.
#[derive(Debug, Clone, Copy)]
pub struct Point<'a> {
    coordinates: &'a [f64],
    weight: f64,
    channel: Option<usize>,
}

impl<'a> Point<'a> {
    pub fn new(coordinates: &'a [f64], weight: f64, channel: Option<usize>) -> Self {
        Point {
            coordinates,
            weight,
            channel,
        }
    }

    /// The coordinates in `[0, 1)^dim`.
    pub fn coordinates(&self) -> &'a [f64] {
        self.coordinates
    }

    /// The Monte Carlo weight of the point, i.e. the inverse of the sampling density.
    ///
    /// The integrator multiplies the returned function value with it; integrands only need it
    /// when they fill distributions of their own.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// The channel that generated the point, for multi-channel integrators.
    pub fn channel(&self) -> Option<usize> {
        self.channel
    }
}

/// A batch of consecutive points, stored point-major.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    dim: usize,
    coordinates: &'a [f64],
    weights: &'a [f64],
    channels: Option<&'a [usize]>,
}

impl<'a> Chunk<'a> {
    pub(crate) fn new(
        dim: usize,
        coordinates: &'a [f64],
        weights: &'a [f64],
        channels: Option<&'a [usize]>,
    ) -> Self {
        debug_assert_eq!(coordinates.len(), dim * weights.len());
        Chunk {
            dim,
            coordinates,
            weights,
            channels,
        }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Returns the `index`-th point of the chunk.
    pub fn point(&self, index: usize) -> Point<'a> {
        Point {
            coordinates: &self.coordinates[index * self.dim..(index + 1) * self.dim],
            weight: self.weights[index],
            channel: self.channels.map(|channels| channels[index]),
        }
    }

    pub fn points(&self) -> impl Iterator<Item = Point<'a>> + '_ {
        (0..self.len()).map(move |index| self.point(index))
    }
}

/// A trait representing a function to be integrated over the unit hypercube.
///
/// Users of the library must implement this trait for their function. Evaluations run on
/// several threads at once, so the function must not mutate shared state.
pub trait Integrand: Sync {
    /// Returns the number of dimensions of the integration space.
    fn dim(&self) -> usize;

    /// Evaluates the function at a given point.
    ///
    /// Non-finite return values are counted but never enter the estimate.
    fn eval(&self, point: &Point<'_>) -> f64;

    /// Evaluates the function for all points of `chunk`, writing one value per point.
    fn eval_chunk(&self, chunk: &Chunk<'_>, values: &mut [f64]) {
        for (value, point) in values.iter_mut().zip(chunk.points()) {
            *value = self.eval(&point);
        }
    }
}

/// An integrand defined by a closure.
pub struct Function<F> {
    dim: usize,
    function: F,
}

impl<F> Function<F>
where
    F: Fn(&Point<'_>) -> f64 + Sync,
{
    pub fn new(dim: usize, function: F) -> Self {
        Function { dim, function }
    }
}

impl<F> Integrand for Function<F>
where
    F: Fn(&Point<'_>) -> f64 + Sync,
{
    fn dim(&self) -> usize {
        self.dim
    }

    fn eval(&self, point: &Point<'_>) -> f64 {
        (self.function)(point)
    }
}

/// A trait representing a function to be integrated using SIMD.
pub trait SimdIntegrand: Sync {
    /// Returns the number of dimensions of the integration space.
    fn dim(&self) -> usize;

    /// Evaluates the function on a packet of 4 points; `points[d]` holds coordinate `d` of
    /// each of them.
    fn eval_simd(&self, points: &[f64x4]) -> f64x4;
}

/// Evaluates a [`SimdIntegrand`] four points at a time.
pub struct Simd<F>(pub F);

impl<F: SimdIntegrand> Simd<F> {
    fn eval_packet(&self, chunk: &Chunk<'_>, first: usize, values: &mut [f64]) {
        let dim = chunk.dim();
        let lanes = values.len();
        let mut packet = vec![f64x4::splat(0.0); dim];
        for (d, lane_values) in packet.iter_mut().enumerate() {
            let mut lane = [0.0; 4];
            for (l, x) in lane.iter_mut().enumerate() {
                // unused lanes repeat the first point to stay inside the domain
                let index = first + if l < lanes { l } else { 0 };
                *x = chunk.coordinates[index * dim + d];
            }
            *lane_values = f64x4::from(lane);
        }
        let result = self.0.eval_simd(&packet).to_array();
        values.copy_from_slice(&result[..lanes]);
    }
}

impl<F: SimdIntegrand> Integrand for Simd<F> {
    fn dim(&self) -> usize {
        self.0.dim()
    }

    fn eval(&self, point: &Point<'_>) -> f64 {
        let packet: Vec<f64x4> = point
            .coordinates()
            .iter()
            .map(|&x| f64x4::splat(x))
            .collect();
        self.0.eval_simd(&packet).to_array()[0]
    }

    fn eval_chunk(&self, chunk: &Chunk<'_>, values: &mut [f64]) {
        for (packet, packet_values) in values.chunks_mut(4).enumerate() {
            self.eval_packet(chunk, 4 * packet, packet_values);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Product;

    impl SimdIntegrand for Product {
        fn dim(&self) -> usize {
            2
        }

        fn eval_simd(&self, points: &[f64x4]) -> f64x4 {
            points[0] * points[1]
        }
    }

    #[test]
    fn test_chunk_points() {
        let coordinates = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
        let weights = [1.0, 2.0, 3.0];
        let channels = [2, 0, 1];
        let chunk = Chunk::new(2, &coordinates, &weights, Some(&channels));

        assert_eq!(chunk.len(), 3);
        let point = chunk.point(1);
        assert_eq!(point.coordinates(), &[0.3, 0.4]);
        assert_eq!(point.weight(), 2.0);
        assert_eq!(point.channel(), Some(0));
    }

    #[test]
    fn test_simd_chunk_matches_scalar() {
        let coordinates: Vec<f64> = (0..14).map(|i| 0.05 + i as f64 / 16.0).collect();
        let weights = vec![1.0; 7];
        let chunk = Chunk::new(2, &coordinates, &weights, None);

        let integrand = Simd(Product);
        let mut values = vec![0.0; 7];
        integrand.eval_chunk(&chunk, &mut values);

        for (i, &value) in values.iter().enumerate() {
            let expected = coordinates[2 * i] * coordinates[2 * i + 1];
            assert_eq!(value, expected);
            assert_eq!(integrand.eval(&chunk.point(i)), expected);
        }
    }

    #[test]
    fn test_function_integrand() {
        let integrand = Function::new(3, |p: &Point<'_>| p.coordinates().iter().sum());
        let x = [0.25, 0.5, 0.125];
        assert_eq!(integrand.dim(), 3);
        assert_eq!(integrand.eval(&Point::new(&x, 1.0, None)), 0.875);
    }
}
