//! Test functions with known integrals.

pub mod integrands;
