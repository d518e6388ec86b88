//! Two-stage search for the `(alpha, Dmax)` pair of maximum evidence.
//!
//! A coarse grid over `log(alpha) × Dmax` supplies the starting point for a
//! Powell refinement of the negated evidence. The grid is evaluated row by row
//! (one Dmax per row) so progress and cancellation are handled between rows.

use nalgebra::{DMatrix, DVector};

use crate::data::Profile;
use crate::evidence::{EvaluationPool, EvidenceResult, Hyperparameters, Parallelism};
use crate::options::BiftOptions;
use crate::powell::{self, PowellResult};
use crate::progress::{emit, is_canceled, BiftStatus, CancelToken, ProgressMessage, ProgressSink};
use crate::transform::linspace;

/// Objective value handed to the minimizer for points it must not settle on.
const REJECTED_OBJECTIVE: f64 = 1e150;

/// Phase of a [`HyperparameterSearch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchState {
    GridSearch,
    Refine,
    Done,
    Canceled,
    Failed,
}

/// Terminal result of a search.
#[derive(Clone, Debug, PartialEq)]
pub enum SearchOutcome {
    /// Refined optimum in `(log alpha, Dmax)`.
    Optimum(Hyperparameters),
    Canceled,
    /// The minimizer did not report success.
    Failed,
}

/// Evidence and chi-squared over the search grid; rows are Dmax, columns are `log(alpha)`.
#[derive(Clone, Debug)]
pub struct EvidenceGrid {
    /// Column axis, evenly spaced `log(alpha)` values.
    pub log_alpha: DVector<f64>,
    /// Row axis, evenly spaced Dmax values.
    pub dmax: DVector<f64>,
    /// Log evidence per cell; `-inf` marks a rejected evaluation.
    pub evidence: DMatrix<f64>,
    /// Chi-squared per cell.
    pub chi_squared: DMatrix<f64>,
}

impl EvidenceGrid {
    fn new(log_alpha: DVector<f64>, dmax: DVector<f64>) -> Self {
        let (rows, cols) = (dmax.len(), log_alpha.len());
        Self {
            log_alpha,
            dmax,
            evidence: DMatrix::from_element(rows, cols, f64::NEG_INFINITY),
            chi_squared: DMatrix::from_element(rows, cols, f64::INFINITY),
        }
    }

    pub fn point_count(&self) -> usize {
        self.evidence.len()
    }

    /// Cell of maximum evidence as `(dmax_index, alpha_index)`.
    ///
    /// Scans Dmax-major, alpha-minor and keeps the first cell on ties. NaN never wins.
    pub fn argmax(&self) -> (usize, usize) {
        let mut best = (0, 0);
        let mut best_value = f64::NAN;
        for row in 0..self.dmax.len() {
            for col in 0..self.log_alpha.len() {
                let value = self.evidence[(row, col)];
                if !value.is_nan() && (best_value.is_nan() || value > best_value) {
                    best = (row, col);
                    best_value = value;
                }
            }
        }
        best
    }

    /// Hyperparameters of the best grid cell.
    pub fn best(&self) -> Hyperparameters {
        let (row, col) = self.argmax();
        Hyperparameters::new(self.log_alpha[col], self.dmax[row])
    }
}

/// Grid + refinement search driven by the evidence.
pub struct HyperparameterSearch<'a> {
    profile: &'a Profile,
    options: &'a BiftOptions,
    progress: Option<&'a dyn ProgressSink>,
    cancel: Option<&'a CancelToken>,
    state: SearchState,
    grid: Option<EvidenceGrid>,
    refinement: Option<PowellResult>,
}

impl<'a> HyperparameterSearch<'a> {
    pub fn new(
        profile: &'a Profile,
        options: &'a BiftOptions,
        progress: Option<&'a dyn ProgressSink>,
        cancel: Option<&'a CancelToken>,
    ) -> Self {
        Self {
            profile,
            options,
            progress,
            cancel,
            state: SearchState::GridSearch,
            grid: None,
            refinement: None,
        }
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    /// The evidence surface, once the grid phase has completed.
    pub fn grid(&self) -> Option<&EvidenceGrid> {
        self.grid.as_ref()
    }

    /// Minimizer diagnostics, once the refinement has run.
    pub fn refinement(&self) -> Option<&PowellResult> {
        self.refinement.as_ref()
    }

    fn transition(&mut self, state: SearchState) {
        log::info!("hyperparameter search: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Runs the grid and refinement phases.
    ///
    /// The worker pool exists only for the grid phase and is released before
    /// the refinement or any early return.
    pub fn run(&mut self) -> SearchOutcome {
        let options = self.options;
        let n = options.intervals();
        let pool = EvaluationPool::new(self.profile, n, &options.solver, options.parallelism);

        if is_canceled(self.cancel) {
            self.transition(SearchState::Canceled);
            return SearchOutcome::Canceled;
        }

        let grid = match self.grid_search(&pool) {
            Some(grid) => grid,
            None => {
                self.transition(SearchState::Canceled);
                return SearchOutcome::Canceled;
            }
        };
        drop(pool);

        let start = grid.best();
        log::info!(
            "best grid point: log(alpha) {:.4}, dmax {:.3}",
            start.log_alpha,
            start.dmax
        );
        self.grid = Some(grid);

        self.transition(SearchState::Refine);
        let sequential =
            EvaluationPool::new(self.profile, n, &options.solver, Parallelism::Sequential);
        let result = refine(&sequential, start, options);
        let success = refinement_succeeded(&result);
        let optimum = Hyperparameters::new(result.x[0], result.x[1]);
        self.refinement = Some(result);

        if is_canceled(self.cancel) {
            self.transition(SearchState::Canceled);
            return SearchOutcome::Canceled;
        }

        if !success {
            log::warn!("evidence refinement did not converge");
            self.transition(SearchState::Failed);
            return SearchOutcome::Failed;
        }

        self.transition(SearchState::Done);
        SearchOutcome::Optimum(optimum)
    }

    /// Evaluates the full grid; `None` if canceled between rows.
    fn grid_search(&self, pool: &EvaluationPool<'_>) -> Option<EvidenceGrid> {
        let options = self.options;
        let log_alpha = linspace(options.alpha_min.ln(), options.alpha_max.ln(), options.alpha_n);
        let dmax = linspace(options.dmax_min, options.dmax_max, options.dmax_n);
        let mut grid = EvidenceGrid::new(log_alpha, dmax);
        let total = grid.point_count();
        let mut last: Option<(Hyperparameters, EvidenceResult)> = None;

        for row in 0..grid.dmax.len() {
            let points: Vec<_> = grid
                .log_alpha
                .iter()
                .map(|&a| Hyperparameters::new(a, grid.dmax[row]))
                .collect();
            let results = pool.map_absorbing(&points);

            for (col, result) in results.iter().enumerate() {
                grid.evidence[(row, col)] = result.evidence;
                grid.chi_squared[(row, col)] = result.chi_squared;
            }

            if let (Some(params), Some(result)) = (points.last(), results.into_iter().last()) {
                let status = status_for(*params, &result, (row + 1) * points.len(), total, None);
                emit(self.progress, ProgressMessage::Update(status));
                last = Some((*params, result));
            }

            if is_canceled(self.cancel) {
                return None;
            }
        }

        if let Some((params, result)) = last {
            let status = status_for(
                params,
                &result,
                total,
                total,
                Some("Running minimization"),
            );
            emit(self.progress, ProgressMessage::Update(status));
        }

        Some(grid)
    }
}

/// Whether a refinement ended on a usable optimum.
///
/// Powell must report convergence, and the point it settled on must have been
/// evaluated cleanly. A plateau of rejected points also satisfies the tolerance test.
pub fn refinement_succeeded(result: &PowellResult) -> bool {
    result.success() && result.fun < REJECTED_OBJECTIVE
}

/// Powell refinement of `-evidence` over `(log alpha, Dmax)` on the calling thread.
pub fn refine(
    pool: &EvaluationPool<'_>,
    start: Hyperparameters,
    options: &BiftOptions,
) -> PowellResult {
    let objective = |x: &DVector<f64>| {
        let params = Hyperparameters::new(x[0], x[1]);
        if !(params.dmax > 0.0) || !params.log_alpha.is_finite() {
            return REJECTED_OBJECTIVE;
        }
        match pool.evaluate(params) {
            Ok(result) if result.evidence.is_finite() => -result.evidence,
            Ok(_) => REJECTED_OBJECTIVE,
            Err(error) => {
                log::warn!("refinement evaluation rejected: {error}");
                REJECTED_OBJECTIVE
            }
        }
    };

    let x0 = DVector::from_vec(vec![start.log_alpha, start.dmax]);
    let result = powell::minimize(objective, x0, &options.refinement);
    log::info!(
        "refinement {:?} after {} iterations / {} evaluations: log(alpha) {:.4}, dmax {:.3}",
        result.status,
        result.iterations,
        result.evaluations,
        result.x[0],
        result.x[1]
    );
    result
}

pub(crate) fn status_for(
    params: Hyperparameters,
    result: &EvidenceResult,
    points_done: usize,
    points_total: usize,
    status: Option<&str>,
) -> BiftStatus {
    BiftStatus {
        alpha: params.log_alpha,
        evidence: result.evidence,
        chi_squared: result.chi_squared,
        dmax: params.dmax,
        points_done,
        points_total,
        status: status.map(str::to_owned),
    }
}
