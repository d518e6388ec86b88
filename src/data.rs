//! Scattering profile container and validation used by the transform.

use nalgebra::DVector;

use crate::error::{BiftError, Result};

/// Smallest profile the evidence calculation can use: the prior rescale reads
/// q-indices 1..=3 and the chi-squared term skips both end points.
pub const MIN_PROFILE_POINTS: usize = 5;

/// A measured small-angle scattering profile `I(q) ± err`.
#[derive(Clone, Debug)]
pub struct Profile {
    q: DVector<f64>,
    i: DVector<f64>,
    err: DVector<f64>,
}

impl Profile {
    /// Creates a `Profile` from validated components.
    pub fn new(q: DVector<f64>, i: DVector<f64>, err: DVector<f64>) -> Result<Self> {
        ProfileBuilder::new(q, i).errors(err).build()
    }

    /// Convenience constructor from plain slices.
    pub fn from_slices(q: &[f64], i: &[f64], err: &[f64]) -> Result<Self> {
        Self::new(
            DVector::from_column_slice(q),
            DVector::from_column_slice(i),
            DVector::from_column_slice(err),
        )
    }

    /// Number of measured points `M`.
    pub fn len(&self) -> usize {
        self.q.len()
    }

    /// Always `false` for a validated profile.
    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    /// Scattering vector magnitudes.
    pub fn q(&self) -> &DVector<f64> {
        &self.q
    }

    /// Measured intensities.
    pub fn i(&self) -> &DVector<f64> {
        &self.i
    }

    /// Measurement uncertainties (one standard deviation).
    pub fn err(&self) -> &DVector<f64> {
        &self.err
    }

    /// First intensity point, used as the `I(0)` proxy by the prior.
    pub fn i0_estimate(&self) -> f64 {
        self.i[0]
    }

    pub fn q_min(&self) -> f64 {
        self.q[0]
    }

    pub fn q_max(&self) -> f64 {
        self.q[self.q.len() - 1]
    }
}

/// Builder that validates lengths, ordering and uncertainties before constructing a [`Profile`].
#[derive(Debug)]
pub struct ProfileBuilder {
    q: DVector<f64>,
    i: DVector<f64>,
    err: Option<DVector<f64>>,
}

impl ProfileBuilder {
    /// Start building a profile from the scattering vector and intensities.
    pub fn new(q: DVector<f64>, i: DVector<f64>) -> Self {
        Self { q, i, err: None }
    }

    /// Sets the measurement uncertainties.
    pub fn errors(mut self, err: DVector<f64>) -> Self {
        self.err = Some(err);
        self
    }

    /// Finalizes construction after validating the profile.
    pub fn build(self) -> Result<Profile> {
        let m = self.q.len();
        if m < MIN_PROFILE_POINTS {
            return Err(BiftError::TooFewPoints {
                context: "profile",
                minimum: MIN_PROFILE_POINTS,
                found: m,
            });
        }
        if self.i.len() != m {
            return Err(BiftError::dimension_mismatch("intensity length", m, self.i.len()));
        }

        let err = self
            .err
            .ok_or_else(|| BiftError::dimension_mismatch("error length", m, 0))?;
        if err.len() != m {
            return Err(BiftError::dimension_mismatch("error length", m, err.len()));
        }

        check_finite("q", &self.q)?;
        check_finite("intensity", &self.i)?;
        check_finite("error", &err)?;

        for index in 1..m {
            if self.q[index] <= self.q[index - 1] {
                return Err(BiftError::NonIncreasingQ {
                    index,
                    previous: self.q[index - 1],
                    value: self.q[index],
                });
            }
        }

        for (index, error) in err.iter().enumerate() {
            if *error <= 0.0 {
                return Err(BiftError::NonPositiveError {
                    index,
                    error: *error,
                });
            }
        }

        Ok(Profile {
            q: self.q,
            i: self.i,
            err,
        })
    }
}

fn check_finite(context: &'static str, values: &DVector<f64>) -> Result<()> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(index) => Err(BiftError::NonFiniteValue { context, index }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f64> {
        (1..=n).map(|k| 0.01 * k as f64).collect()
    }

    #[test]
    fn builder_accepts_valid_profile() {
        let q = ramp(6);
        let i = vec![6.0, 5.0, 4.0, 3.0, 2.0, 1.0];
        let err = vec![0.1; 6];

        let profile = Profile::from_slices(&q, &i, &err).expect("valid profile");
        assert_eq!(profile.len(), 6);
        assert_eq!(profile.i0_estimate(), 6.0);
        assert_eq!(profile.q_min(), 0.01);
        assert_eq!(profile.q_max(), 0.06);
    }

    #[test]
    fn builder_rejects_unsorted_q() {
        let q = vec![0.01, 0.02, 0.02, 0.04, 0.05];
        let result = Profile::from_slices(&q, &[1.0; 5], &[0.1; 5]);
        assert!(matches!(
            result,
            Err(BiftError::NonIncreasingQ { index: 2, .. })
        ));
    }

    #[test]
    fn builder_rejects_non_positive_errors() {
        let mut err = vec![0.1; 5];
        err[3] = 0.0;
        let result = Profile::from_slices(&ramp(5), &[1.0; 5], &err);
        assert!(matches!(
            result,
            Err(BiftError::NonPositiveError { index: 3, .. })
        ));
    }

    #[test]
    fn builder_rejects_mismatched_lengths() {
        let result = Profile::from_slices(&ramp(6), &[1.0; 5], &[0.1; 6]);
        assert!(matches!(
            result,
            Err(BiftError::DimensionMismatch { expected: 6, found: 5, .. })
        ));

        let missing = ProfileBuilder::new(
            DVector::from_vec(ramp(5)),
            DVector::from_element(5, 1.0),
        )
        .build();
        assert!(missing.is_err());
    }

    #[test]
    fn builder_rejects_short_and_non_finite_profiles() {
        let short = Profile::from_slices(&ramp(3), &[1.0; 3], &[0.1; 3]);
        assert!(matches!(short, Err(BiftError::TooFewPoints { .. })));

        let mut i = vec![1.0; 5];
        i[1] = f64::NAN;
        let nan = Profile::from_slices(&ramp(5), &i, &[0.1; 5]);
        assert!(matches!(
            nan,
            Err(BiftError::NonFiniteValue { index: 1, .. })
        ));
    }
}
