//! The IFT record handed to plotting and saving collaborators.

use std::f64::consts::PI;
use std::path::Path;

use nalgebra::DVector;
use serde::Serialize;

use crate::data::Profile;
use crate::montecarlo::MonteCarloSummary;
use crate::transform::interpolate_linear;

/// Algorithm tag stored in every record produced by this crate.
pub const ALGORITHM: &str = "BIFT";

/// Scalar results of an indirect Fourier transform, keyed the way IFT files expect.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IftParameters {
    /// Maximum dimension at the evidence optimum.
    pub dmax: f64,
    /// Monte Carlo spread of Dmax.
    #[serde(rename = "dmaxer")]
    pub dmax_error: f64,
    /// Real-space radius of gyration.
    pub rg: f64,
    /// Monte Carlo spread of Rg.
    #[serde(rename = "rger")]
    pub rg_error: f64,
    /// Real-space forward scattering.
    pub i0: f64,
    /// Monte Carlo spread of I(0).
    #[serde(rename = "i0er")]
    pub i0_error: f64,
    /// Chi-squared of the MAP fit.
    #[serde(rename = "chisq")]
    pub chi_squared: f64,
    /// Monte Carlo spread of chi-squared.
    #[serde(rename = "chisq_er")]
    pub chi_squared_error: f64,
    /// `log(alpha)` of the solution.
    pub alpha: f64,
    /// Monte Carlo spread of `log(alpha)`.
    #[serde(rename = "alpha_er")]
    pub alpha_error: f64,
    /// Log evidence at the optimum.
    pub evidence: f64,
    /// Monte Carlo spread of the log evidence.
    #[serde(rename = "evidence_er")]
    pub evidence_error: f64,
    /// First measured q.
    #[serde(rename = "qmin")]
    pub q_min: f64,
    /// Last measured q.
    #[serde(rename = "qmax")]
    pub q_max: f64,
    /// Always [`ALGORITHM`].
    pub algorithm: String,
    /// Name of the IFT file, derived from the input name.
    pub filename: String,
}

impl IftParameters {
    /// Number of Shannon channels, `(qmax − qmin)·Dmax/π`.
    pub fn shannon_channels(&self) -> f64 {
        (self.q_max - self.q_min) * self.dmax / PI
    }
}

/// Full record: the `P(r)` curve with errors, the data it was fitted to, and the fit.
#[derive(Clone, Debug, Serialize)]
pub struct IftResult {
    /// Equally spaced `r` grid on `[0, Dmax]`.
    pub r: DVector<f64>,
    /// MAP `P(r)` on `r`.
    pub p: DVector<f64>,
    /// Per-point `P(r)` uncertainty.
    pub err: DVector<f64>,
    /// Measured q.
    pub q_orig: DVector<f64>,
    /// Measured intensity.
    pub i_orig: DVector<f64>,
    /// Measured intensity uncertainty.
    pub err_orig: DVector<f64>,
    /// Fit of `P(r)` evaluated at `q_orig`.
    pub i_fit: DVector<f64>,
    /// `q_orig` extended down to `q = 0`.
    pub q_extrap: DVector<f64>,
    /// Fit of `P(r)` evaluated at `q_extrap`.
    pub i_extrap: DVector<f64>,
    /// Scalar results and their errors.
    pub parameters: IftParameters,
}

/// MAP solution at the optimum with its derived quantities.
#[derive(Clone, Debug)]
pub struct MapSolution {
    /// `log(alpha)` of the solve.
    pub log_alpha: f64,
    /// Maximum dimension of the solve.
    pub dmax: f64,
    /// Log evidence, after any convergence penalty.
    pub evidence: f64,
    /// Chi-squared of the fit.
    pub chi_squared: f64,
    /// `r` grid of the solution.
    pub r: DVector<f64>,
    /// MAP `P(r)` on `r`.
    pub pr: DVector<f64>,
    /// Radius of gyration from the `P(r)` moments.
    pub rg: f64,
    /// Forward scattering from the `P(r)` moments.
    pub i0: f64,
    /// Fit at the measured q.
    pub i_fit: DVector<f64>,
    /// Measured q extended down to zero.
    pub q_extrap: DVector<f64>,
    /// Fit at `q_extrap`.
    pub i_extrap: DVector<f64>,
}

/// IFT file name for an input file: its stem with the `.ift` extension.
pub fn ift_filename(input: &str) -> String {
    Path::new(input)
        .with_extension("ift")
        .to_string_lossy()
        .into_owned()
}

/// Packages the MAP solution and the Monte Carlo uncertainties into one record.
///
/// The reported curve is the MAP `P(r)`; only its error bars come from the
/// Monte Carlo runs, interpolated back onto the MAP grid.
pub fn assemble(
    profile: &Profile,
    filename: &str,
    solution: MapSolution,
    errors: Option<&MonteCarloSummary>,
) -> IftResult {
    let err = match errors {
        Some(summary) => solution
            .r
            .map(|r| interpolate_linear(&summary.r, &summary.pr_err, r)),
        None => DVector::zeros(solution.r.len()),
    };
    let spread = |pick: fn(&MonteCarloSummary) -> f64| errors.map(pick).unwrap_or(0.0);

    let parameters = IftParameters {
        dmax: solution.dmax,
        dmax_error: spread(|s| s.dmax.error),
        rg: solution.rg,
        rg_error: spread(|s| s.rg.error),
        i0: solution.i0,
        i0_error: spread(|s| s.i0.error),
        chi_squared: solution.chi_squared,
        chi_squared_error: spread(|s| s.chi_squared.error),
        alpha: solution.log_alpha,
        alpha_error: spread(|s| s.alpha.error),
        evidence: solution.evidence,
        evidence_error: spread(|s| s.evidence.error),
        q_min: profile.q_min(),
        q_max: profile.q_max(),
        algorithm: ALGORITHM.to_owned(),
        filename: ift_filename(filename),
    };

    IftResult {
        r: solution.r,
        p: solution.pr,
        err,
        q_orig: profile.q().clone(),
        i_orig: profile.i().clone(),
        err_orig: profile.err().clone(),
        i_fit: solution.i_fit,
        q_extrap: solution.q_extrap,
        i_extrap: solution.i_extrap,
        parameters,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::montecarlo::Estimate;
    use crate::transform::linspace;

    fn solution() -> MapSolution {
        let r = linspace(0.0, 50.0, 6);
        MapSolution {
            log_alpha: 9.0,
            dmax: 50.0,
            evidence: -100.0,
            chi_squared: 1.05,
            pr: r.map(|x| x * (50.0 - x)),
            r,
            rg: 15.0,
            i0: 0.06,
            i_fit: DVector::from_element(5, 1.0),
            q_extrap: DVector::from_element(7, 1.0),
            i_extrap: DVector::from_element(7, 1.0),
        }
    }

    fn profile() -> Profile {
        let q = linspace(0.01, 0.05, 5);
        Profile::new(q, DVector::from_element(5, 1.0), DVector::from_element(5, 0.1)).unwrap()
    }

    #[test]
    fn filename_gets_ift_extension() {
        assert_eq!(ift_filename("glucose_isomerase.dat"), "glucose_isomerase.ift");
        assert_eq!(ift_filename("data/lys"), "data/lys.ift");
    }

    #[test]
    fn record_keeps_map_curve_and_interpolated_errors() {
        let summary = MonteCarloSummary {
            r: linspace(0.0, 60.0, 7),
            pr_mean: DVector::zeros(7),
            pr_err: linspace(0.0, 6.0, 7),
            alpha: Estimate { value: 9.1, error: 0.2 },
            dmax: Estimate { value: 51.0, error: 2.0 },
            chi_squared: Estimate { value: 1.1, error: 0.05 },
            evidence: Estimate { value: -99.0, error: 3.0 },
            rg: Estimate { value: 15.2, error: 0.4 },
            i0: Estimate { value: 0.061, error: 0.001 },
            weights: DVector::from_element(3, 1.0 / 3.0),
            spread: 3.0,
        };
        let map = solution();
        let expected_p = map.pr.clone();
        let record = assemble(&profile(), "gi.dat", map, Some(&summary));

        assert_eq!(record.p, expected_p);
        assert_eq!(record.err[1], 1.0);
        assert_eq!(record.parameters.rg, 15.0);
        assert_eq!(record.parameters.rg_error, 0.4);
        assert_eq!(record.parameters.dmax_error, 2.0);
        assert_eq!(record.parameters.q_max, 0.05);
        assert_eq!(record.parameters.algorithm, "BIFT");
    }

    #[test]
    fn parameters_serialize_with_ift_keys() {
        let record = assemble(&profile(), "gi.dat", solution(), None);
        let value = serde_json::to_value(&record.parameters).unwrap();
        for key in [
            "dmax", "dmaxer", "rg", "rger", "i0", "i0er", "chisq", "chisq_er", "alpha",
            "alpha_er", "evidence", "evidence_er", "qmin", "qmax", "algorithm", "filename",
        ] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(value["filename"], "gi.ift");
        assert_eq!(value["dmaxer"], 0.0);
        assert!(record.err.iter().all(|&e| e == 0.0));
    }
}
