//! Forward transform between real space `P(r)` and reciprocal space `I(q)`.
//!
//! The kernel carries the `4π·Δr` factor, so `T · p` is directly comparable to a
//! measured intensity when `p` lives on an equally spaced grid starting at zero.

use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector};

/// `sin(x)/x` with the removable singularity at zero filled in.
pub fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        x.sin() / x
    }
}

/// `n` equally spaced values from `start` to `stop` inclusive.
pub fn linspace(start: f64, stop: f64, n: usize) -> DVector<f64> {
    match n {
        0 => DVector::zeros(0),
        1 => DVector::from_element(1, start),
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            DVector::from_fn(n, |k, _| {
                if k == n - 1 {
                    stop
                } else {
                    start + step * k as f64
                }
            })
        }
    }
}

/// Builds the `M × (N+1)` kernel with `T[k, j] = 4π·Δr·sinc(q_k·r_j)`.
///
/// `r` must be equally spaced; `Δr` is taken from its first interval.
pub fn transfer_matrix(q: &DVector<f64>, r: &DVector<f64>) -> DMatrix<f64> {
    let dr = if r.len() > 1 { r[1] - r[0] } else { 0.0 };
    let scale = 4.0 * PI * dr;
    DMatrix::from_fn(q.len(), r.len(), |k, j| scale * sinc(q[k] * r[j]))
}

/// Trapezoidal integral of `y` sampled at `x`.
pub fn trapz(y: &DVector<f64>, x: &DVector<f64>) -> f64 {
    debug_assert_eq!(y.len(), x.len());
    (1..x.len())
        .map(|k| 0.5 * (x[k] - x[k - 1]) * (y[k] + y[k - 1]))
        .sum()
}

/// Real-space structural parameters from the zeroth and second moments of `P(r)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PrMoments {
    /// Radius of gyration, `sqrt(|m2 / (2·m0)|)`.
    pub rg: f64,
    /// Forward scattering, `4π·m0`.
    pub i0: f64,
}

/// Computes `Rg` and `I(0)` from a `P(r)` curve by trapezoidal integration.
pub fn pr_moments(pr: &DVector<f64>, r: &DVector<f64>) -> PrMoments {
    let area = trapz(pr, r);
    let weighted = pr.component_mul(&r.component_mul(r));
    let area2 = trapz(&weighted, r);

    PrMoments {
        rg: (area2 / (2.0 * area)).abs().sqrt(),
        i0: 4.0 * PI * area,
    }
}

/// Intensity implied by `P(r)`: `I(q) = 4π ∫ P(r)·sinc(q·r) dr`.
pub fn make_fit(q: &DVector<f64>, r: &DVector<f64>, pr: &DVector<f64>) -> DVector<f64> {
    DVector::from_fn(q.len(), |k, _| {
        let integrand = DVector::from_fn(r.len(), |j, _| pr[j] * sinc(q[k] * r[j]));
        4.0 * PI * trapz(&integrand, r)
    })
}

/// Prepends points spaced like the first data gap so the curve reaches `q = 0`.
///
/// The result starts at exactly zero and is followed by the original `q`.
pub fn extrapolate_to_zero(q: &DVector<f64>) -> DVector<f64> {
    let mut values = Vec::with_capacity(q.len() + 1);
    if q.len() > 1 && q[0] > 0.0 {
        let dq = q[1] - q[0];
        let mut k = 0usize;
        loop {
            let value = dq * k as f64;
            // Keep the prepended points clear of the first measured point.
            if value >= q[0] - 1e-3 * dq {
                break;
            }
            values.push(value);
            k += 1;
        }
    }
    values.extend(q.iter().copied());
    DVector::from_vec(values)
}

/// Linear interpolation of `(x, y)` at `at`; `x` must be increasing.
///
/// Points outside `[x_0, x_last]` take the nearest end value.
pub fn interpolate_linear(x: &DVector<f64>, y: &DVector<f64>, at: f64) -> f64 {
    let n = x.len();
    if n == 0 {
        return 0.0;
    }
    if at <= x[0] {
        return y[0];
    }
    if at >= x[n - 1] {
        return y[n - 1];
    }

    let upper = x.as_slice().partition_point(|&value| value <= at);
    let lower = upper - 1;
    let span = x[upper] - x[lower];
    if span == 0.0 {
        return y[lower];
    }
    let t = (at - x[lower]) / span;
    y[lower] + t * (y[upper] - y[lower])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn kernel_uses_sinc_with_finite_origin() {
        let q = DVector::from_vec(vec![0.0, 0.05, 0.2]);
        let r = linspace(0.0, 50.0, 11);
        let t = transfer_matrix(&q, &r);
        let scale = 4.0 * PI * 5.0;

        assert_eq!(t.shape(), (3, 11));
        for j in 0..11 {
            assert_relative_eq!(t[(0, j)], scale, epsilon = 1e-12);
        }
        for k in 0..3 {
            assert_relative_eq!(t[(k, 0)], scale, epsilon = 1e-12);
            assert!(t[(k, 0)].is_finite());
        }
        let qr: f64 = 0.2 * 35.0;
        assert_relative_eq!(t[(2, 7)], scale * qr.sin() / qr, epsilon = 1e-12);
    }

    #[test]
    fn linspace_hits_both_ends() {
        let r = linspace(0.0, 97.3, 474);
        assert_eq!(r.len(), 474);
        assert_eq!(r[0], 0.0);
        assert_eq!(r[473], 97.3);
    }

    #[test]
    fn sphere_moments_match_closed_form() {
        // P(r) of a homogeneous sphere of diameter D has Rg = sqrt(3/5)·D/2.
        let d = 100.0;
        let r = linspace(0.0, d, 2001);
        let pr = r.map(|x| x * x * (1.0 - 1.5 * x / d + 0.5 * (x / d).powi(3)));
        let moments = pr_moments(&pr, &r);
        assert_relative_eq!(moments.rg, (0.6_f64).sqrt() * d / 2.0, max_relative = 1e-6);
    }

    #[test]
    fn fit_at_zero_q_is_forward_scattering() {
        let r = linspace(0.0, 80.0, 301);
        let pr = r.map(|x| x * (80.0 - x));
        let q = DVector::from_vec(vec![0.0, 0.1]);
        let fit = make_fit(&q, &r, &pr);
        assert_relative_eq!(fit[0], pr_moments(&pr, &r).i0, max_relative = 1e-12);
        assert!(fit[1] < fit[0]);
    }

    #[test]
    fn extrapolation_reaches_zero_with_data_spacing() {
        let q = DVector::from_vec(vec![0.01, 0.012, 0.014, 0.016]);
        let extrap = extrapolate_to_zero(&q);
        assert_eq!(extrap[0], 0.0);
        assert_eq!(extrap.len(), 5 + 4);
        assert_relative_eq!(extrap[1], 0.002, epsilon = 1e-15);
        assert_eq!(extrap[extrap.len() - 4], 0.01);
        for k in 1..extrap.len() {
            assert!(extrap[k] > extrap[k - 1]);
        }
    }

    #[test]
    fn interpolation_is_linear_and_clamped() {
        let x = DVector::from_vec(vec![0.0, 1.0, 2.0]);
        let y = DVector::from_vec(vec![0.0, 10.0, 0.0]);
        assert_relative_eq!(interpolate_linear(&x, &y, 0.25), 2.5);
        assert_relative_eq!(interpolate_linear(&x, &y, 1.5), 5.0);
        assert_eq!(interpolate_linear(&x, &y, 1.0), 10.0);
        assert_eq!(interpolate_linear(&x, &y, 3.0), 0.0);
    }
}
