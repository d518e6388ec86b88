//! Bayesian evidence for one `(log alpha, Dmax)` pair, and the pool that maps it over many pairs.

use nalgebra::{DMatrix, DVector, SVD};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::data::Profile;
use crate::error::{BiftError, Result};
use crate::prior::{PriorDistribution, PriorShape};
use crate::solving::{SolverOptions, SolverState, SolverSummary};
use crate::transform::transfer_matrix;

/// Factor applied to the evidence of a solve that missed the gradient test.
const UNCONVERGED_PENALTY: f64 = 30.0;

/// A hyperparameter pair: regularization weight in log-space and maximum dimension.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hyperparameters {
    /// Natural log of the regularization weight.
    pub log_alpha: f64,
    /// Maximum dimension; `P(r)` is supported on `[0, dmax]`.
    pub dmax: f64,
}

impl Hyperparameters {
    pub fn new(log_alpha: f64, dmax: f64) -> Self {
        Self { log_alpha, dmax }
    }

    /// Linear-space regularization weight.
    pub fn alpha(&self) -> f64 {
        self.log_alpha.exp()
    }
}

/// Outcome of a single evidence evaluation.
#[derive(Clone, Debug)]
pub struct EvidenceResult {
    /// Log evidence; larger is better.
    pub evidence: f64,
    /// Mean squared weighted residual over interior q-points.
    pub chi_squared: f64,
    /// MAP estimate of `P(r)` on `r`.
    pub pr: DVector<f64>,
    /// Equally spaced `r` grid on `[0, dmax]`.
    pub r: DVector<f64>,
    /// Diagnostics of the relaxation loop.
    pub solver: SolverSummary,
}

impl EvidenceResult {
    /// Placeholder for an evaluation that failed numerically; it never wins a comparison.
    pub(crate) fn rejected(params: Hyperparameters, n: usize, precision: f64) -> Self {
        Self {
            evidence: f64::NEG_INFINITY,
            chi_squared: f64::INFINITY,
            pr: DVector::zeros(n + 1),
            r: crate::transform::linspace(0.0, params.dmax, n + 1),
            solver: SolverSummary {
                iterations: 0,
                dotsp: 0.0,
                precision,
            },
        }
    }
}

/// Fits `P(r)` for fixed hyperparameters and scores the fit.
///
/// `n` is the number of `P(r)` intervals; the solution has `n + 1` points.
pub fn evaluate_evidence(
    params: Hyperparameters,
    profile: &Profile,
    n: usize,
    options: &SolverOptions,
) -> Result<EvidenceResult> {
    let alpha = params.alpha();
    let dmax = params.dmax;
    let q = profile.q();
    let i = profile.i();
    let m = profile.len();
    let variance = profile.err().map(|e| e * e);

    let PriorDistribution { r, mut p } =
        PriorDistribution::new(PriorShape::Sphere, profile.i0_estimate(), n, dmax);
    let t = transfer_matrix(q, &r);

    p[0] = 0.0;
    let mut f = DVector::zeros(n + 1);

    let weighted_t = DMatrix::from_fn(m, n + 1, |k, j| t[(k, j)] / variance[k]);

    let mut sum_dia = weighted_t.tr_mul(i);
    sum_dia[0] = 0.0;

    let mut b = t.tr_mul(&weighted_t);
    b.row_mut(0).fill(0.0);
    b.column_mut(0).fill(0.0);

    // Rescale the prior so its low-q intensity matches q-points 1..=3.
    let mut c1 = 0.0;
    let mut c2 = 0.0;
    for k in 1..4 {
        let mut predicted = 0.0;
        for j in 1..n {
            predicted += t[(k, j)] * p[j];
        }
        c1 += predicted / variance[k];
        c2 += i[k] / variance[k];
    }
    let scale = c2 / c1;
    for j in 1..n {
        p[j] *= scale;
        f[j] = p[j] * 1.001;
    }

    let mut state = SolverState::new(f, p, b, sum_dia);
    let summary = state.solve(alpha, options);
    let SolverState { f, p, sigma, b, .. } = state;

    let mut s = 0.0;
    for k in 1..n {
        s -= (f[k] - p[k]).powi(2) / sigma[k];
    }

    let mut c = 0.0;
    for k in 1..m - 1 {
        let mut predicted = 0.0;
        for j in 1..n {
            predicted += t[(k, j)] * f[j];
        }
        c += (i[k] - predicted).powi(2) / variance[k];
    }
    c /= m as f64;

    let rlogdet = log_determinant(&f, &b, alpha, n)?;

    let evidence = -dmax.abs().ln() + (alpha * s - 0.5 * c * m as f64)
        - 0.5 * rlogdet
        - alpha.abs().ln();

    let evidence = penalize_unconverged(evidence, &summary);

    log::debug!(
        "evidence {evidence:.4} chi2 {c:.4} at alpha {alpha:.4e}, dmax {dmax:.3} ({} sweeps)",
        summary.iterations
    );

    Ok(EvidenceResult {
        evidence,
        chi_squared: c,
        pr: f,
        r,
        solver: summary,
    })
}

/// Pushes the evidence of a solve that missed the gradient test away from the optimum.
fn penalize_unconverged(evidence: f64, summary: &SolverSummary) -> f64 {
    if summary.converged() {
        evidence
    } else if evidence <= 0.0 {
        evidence * UNCONVERGED_PENALTY
    } else {
        evidence / UNCONVERGED_PENALTY
    }
}

/// `Σ ln|w|` over the singular values of `I + sqrt(|f_j f_k|)·B_jk / alpha` (interior points).
fn log_determinant(f: &DVector<f64>, b: &DMatrix<f64>, alpha: f64, n: usize) -> Result<f64> {
    let size = n.saturating_sub(1);
    let mut u = DMatrix::from_fn(size, size, |j, k| {
        (f[j + 1] * f[k + 1]).abs().sqrt() * b[(j + 1, k + 1)] / alpha
    });
    for k in 0..size {
        u[(k, k)] += 1.0;
    }

    if u.iter().any(|v| !v.is_finite()) {
        return Err(BiftError::numerical("evidence log-determinant"));
    }

    let svd = SVD::try_new(u, false, false, f64::EPSILON, 10_000)
        .ok_or_else(|| BiftError::numerical("singular value decomposition"))?;
    Ok(svd.singular_values.iter().map(|w| w.abs().ln()).sum())
}

/// How evidence evaluations are spread across workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parallelism {
    /// A scoped worker pool; `None` sizes it to the available CPUs.
    Pool { threads: Option<usize> },
    /// Evaluate everything on the calling thread.
    Sequential,
}

impl Default for Parallelism {
    fn default() -> Self {
        Self::Pool { threads: None }
    }
}

/// Order-preserving map of [`evaluate_evidence`] over hyperparameter pairs.
///
/// Each task reads the shared, immutable profile and owns its solver buffers.
/// The pool lives as long as this value and is torn down when it is dropped.
pub struct EvaluationPool<'a> {
    profile: &'a Profile,
    n: usize,
    options: &'a SolverOptions,
    pool: Option<ThreadPool>,
}

impl<'a> EvaluationPool<'a> {
    /// Builds the worker pool, falling back to sequential evaluation if it cannot be created.
    pub fn new(
        profile: &'a Profile,
        n: usize,
        options: &'a SolverOptions,
        parallelism: Parallelism,
    ) -> Self {
        let pool = match parallelism {
            Parallelism::Sequential => None,
            Parallelism::Pool { threads } => {
                let threads = threads.unwrap_or_else(|| {
                    std::thread::available_parallelism()
                        .map(|count| count.get())
                        .unwrap_or(1)
                });
                match ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|index| format!("bift-worker-{index}"))
                    .build()
                {
                    Ok(pool) => Some(pool),
                    Err(error) => {
                        log::warn!("worker pool unavailable ({error}); evaluating sequentially");
                        None
                    }
                }
            }
        };

        Self {
            profile,
            n,
            options,
            pool,
        }
    }

    /// Whether evaluations run on a worker pool.
    pub fn is_parallel(&self) -> bool {
        self.pool.is_some()
    }

    pub fn intervals(&self) -> usize {
        self.n
    }

    /// Evaluates one pair on the calling thread.
    pub fn evaluate(&self, params: Hyperparameters) -> Result<EvidenceResult> {
        evaluate_evidence(params, self.profile, self.n, self.options)
    }

    /// Evaluates every pair; result `k` belongs to `points[k]`.
    pub fn map(&self, points: &[Hyperparameters]) -> Vec<Result<EvidenceResult>> {
        match &self.pool {
            Some(pool) => pool.install(|| {
                points
                    .par_iter()
                    .map(|params| self.evaluate(*params))
                    .collect()
            }),
            None => points.iter().map(|params| self.evaluate(*params)).collect(),
        }
    }

    /// Like [`map`](Self::map) but a failed evaluation scores `-inf` instead of erroring.
    pub fn map_absorbing(&self, points: &[Hyperparameters]) -> Vec<EvidenceResult> {
        self.map(points)
            .into_iter()
            .zip(points)
            .map(|(result, params)| {
                result.unwrap_or_else(|error| {
                    log::warn!(
                        "evaluation at log(alpha) {:.4}, dmax {:.3} rejected: {error}",
                        params.log_alpha,
                        params.dmax
                    );
                    EvidenceResult::rejected(*params, self.n, self.options.precision)
                })
            })
            .collect()
    }
}
