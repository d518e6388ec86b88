//! Smooth starting distributions for the MAP solver.

use std::f64::consts::PI;

use nalgebra::DVector;

use crate::transform::linspace;

/// Shape of the prior pair-distance distribution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PriorShape {
    /// Homogeneous sphere with diameter `Dmax`.
    #[default]
    Sphere,
}

/// Prior `p(r)` sampled on `N+1` equally spaced points of `[0, Dmax]`.
#[derive(Clone, Debug)]
pub struct PriorDistribution {
    /// Distances, `r[0] = 0` and `r[N] = Dmax`.
    pub r: DVector<f64>,
    /// Prior density at each `r`.
    pub p: DVector<f64>,
}

impl PriorDistribution {
    /// Builds the prior for the requested shape.
    ///
    /// `i0` is the measured forward-scattering proxy; the density is scaled so
    /// that `4π ∫ p(r) dr = i0`.
    pub fn new(shape: PriorShape, i0: f64, n: usize, dmax: f64) -> Self {
        match shape {
            PriorShape::Sphere => Self::sphere(i0, n, dmax),
        }
    }

    /// `p(r) = r²·(1 − 1.5·r/D + 0.5·(r/D)³) · i0 / (4π·D³/24)`.
    pub fn sphere(i0: f64, n: usize, dmax: f64) -> Self {
        let r = linspace(0.0, dmax, n + 1);
        let norm = i0 / (4.0 * PI * dmax.powi(3) / 24.0);
        let p = r.map(|x| {
            let ratio = x / dmax;
            x * x * (1.0 - 1.5 * ratio + 0.5 * ratio.powi(3)) * norm
        });
        Self { r, p }
    }

    /// Number of intervals `N`.
    pub fn intervals(&self) -> usize {
        self.r.len().saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::trapz;
    use approx::assert_relative_eq;

    #[test]
    fn sphere_prior_integrates_to_forward_scattering() {
        for &(dmax, n) in &[(50.0, 100usize), (100.0, 473), (327.5, 200)] {
            let prior = PriorDistribution::sphere(0.0585, n, dmax);
            assert_eq!(prior.intervals(), n);
            let area = 4.0 * PI * trapz(&prior.p, &prior.r);
            assert_relative_eq!(area, 0.0585, max_relative = 1e-6);
        }
    }

    #[test]
    fn sphere_prior_vanishes_at_both_ends() {
        let prior = PriorDistribution::new(PriorShape::Sphere, 1.0, 50, 120.0);
        assert_eq!(prior.r[0], 0.0);
        assert_eq!(prior.r[50], 120.0);
        assert_eq!(prior.p[0], 0.0);
        assert!(prior.p[50].abs() < 1e-12);
        assert!(prior.p.iter().skip(1).take(49).all(|&v| v > 0.0));
    }
}
