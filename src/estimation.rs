//! End-to-end BIFT pipeline: search, final MAP solve, Monte Carlo errors and the IFT record.

use crate::data::Profile;
use crate::error::{BiftError, Result};
use crate::evidence::{evaluate_evidence, Hyperparameters};
use crate::montecarlo::MonteCarloErrorEstimator;
use crate::options::BiftOptions;
use crate::progress::{
    emit, is_canceled, BiftStatus, CancelToken, ProgressMessage, ProgressSink,
};
use crate::results::{assemble, IftResult, MapSolution};
use crate::search::{HyperparameterSearch, SearchOutcome};
use crate::transform::{extrapolate_to_zero, make_fit, pr_moments};

/// High-level wrapper around a validated profile.
#[derive(Clone, Debug)]
pub struct BiftProblem {
    profile: Profile,
}

impl BiftProblem {
    pub fn new(profile: Profile) -> Self {
        Self { profile }
    }

    /// Accessor for the scattering profile.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Searches `(alpha, Dmax)`, solves at the optimum and estimates errors.
    ///
    /// Returns `Ok(None)` when canceled, when the refinement fails or when the
    /// final solve at the optimum fails numerically; the matching
    /// `Canceled`/`Failed` message has already been sent to `progress`. Only
    /// invalid input is an `Err`.
    pub fn solve(
        &self,
        filename: &str,
        options: &BiftOptions,
        progress: Option<&dyn ProgressSink>,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<IftResult>> {
        options.validate()?;
        let profile = &self.profile;

        let mut search = HyperparameterSearch::new(profile, options, progress, cancel);
        let optimum = match search.run() {
            SearchOutcome::Optimum(optimum) => optimum,
            SearchOutcome::Canceled => {
                emit(progress, ProgressMessage::Canceled);
                return Ok(None);
            }
            SearchOutcome::Failed => {
                emit(progress, ProgressMessage::Failed);
                return Ok(None);
            }
        };

        let solution = match self.map_solution(optimum, options) {
            Ok(solution) => solution,
            Err(error) => {
                log::warn!("final solve at the refined optimum failed: {error}");
                emit(progress, ProgressMessage::Failed);
                return Ok(None);
            }
        };
        let total = options.alpha_n * options.dmax_n;
        emit(
            progress,
            ProgressMessage::Update(BiftStatus {
                alpha: solution.log_alpha,
                evidence: solution.evidence,
                chi_squared: solution.chi_squared,
                dmax: solution.dmax,
                points_done: total,
                points_total: total,
                status: Some("Calculating Monte Carlo errors".to_owned()),
            }),
        );

        let errors = MonteCarloErrorEstimator::new(profile, options, cancel).estimate(optimum)?;

        if is_canceled(cancel) {
            emit(progress, ProgressMessage::Canceled);
            return Ok(None);
        }

        log::info!(
            "BIFT solution: dmax {:.3}, rg {:.3}, i0 {:.4e}, chi2 {:.3}",
            solution.dmax,
            solution.rg,
            solution.i0,
            solution.chi_squared
        );
        Ok(Some(assemble(profile, filename, solution, Some(&errors))))
    }

    /// Fits the data at forced `(alpha, Dmax)` without search or Monte Carlo.
    ///
    /// `alpha` is in linear space. Error bars in the record are zero.
    pub fn solve_fixed(
        &self,
        filename: &str,
        alpha: f64,
        dmax: f64,
        options: &BiftOptions,
    ) -> Result<IftResult> {
        options.validate()?;
        if !(alpha > 0.0 && alpha.is_finite()) {
            return Err(BiftError::invalid_parameter(
                "alpha",
                "must be positive and finite",
            ));
        }
        if !(dmax > 0.0 && dmax.is_finite()) {
            return Err(BiftError::invalid_parameter(
                "dmax",
                "must be positive and finite",
            ));
        }
        let solution = self.map_solution(Hyperparameters::new(alpha.ln(), dmax), options)?;
        Ok(assemble(&self.profile, filename, solution, None))
    }

    /// Authoritative MAP solve at `params` plus the derived curves and moments.
    fn map_solution(&self, params: Hyperparameters, options: &BiftOptions) -> Result<MapSolution> {
        let result = evaluate_evidence(params, &self.profile, options.intervals(), &options.solver)?;
        if !result.solver.converged() {
            log::warn!(
                "MAP solve at the optimum stopped at the iteration cap (dotsp {:.5})",
                result.solver.dotsp
            );
        }

        let moments = pr_moments(&result.pr, &result.r);
        let q = self.profile.q();
        let i_fit = make_fit(q, &result.r, &result.pr);
        let q_extrap = extrapolate_to_zero(q);
        let i_extrap = make_fit(&q_extrap, &result.r, &result.pr);

        Ok(MapSolution {
            log_alpha: params.log_alpha,
            dmax: params.dmax,
            evidence: result.evidence,
            chi_squared: result.chi_squared,
            rg: moments.rg,
            i0: moments.i0,
            r: result.r,
            pr: result.pr,
            i_fit,
            q_extrap,
            i_extrap,
        })
    }
}

/// Runs BIFT on raw arrays.
///
/// Input is validated before any evaluation. Cancellation and refinement
/// failure return `Ok(None)`; invalid input returns a validation error.
pub fn run_bift(
    q: &[f64],
    i: &[f64],
    err: &[f64],
    filename: &str,
    options: &BiftOptions,
    progress: Option<&dyn ProgressSink>,
    cancel: Option<&CancelToken>,
) -> Result<Option<IftResult>> {
    let profile = Profile::from_slices(q, i, err)?;
    BiftProblem::new(profile).solve(filename, options, progress, cancel)
}
