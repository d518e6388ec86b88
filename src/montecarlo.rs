//! Monte Carlo error propagation around the evidence optimum.
//!
//! The optimal `(log alpha, Dmax)` is perturbed uniformly, every perturbation is
//! solved and scored, and the runs are combined with weights
//! `exp(evidence - max)^(1 / min chi²)`.

use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Uniform};
use serde::Serialize;

use crate::data::Profile;
use crate::error::{BiftError, Result};
use crate::evidence::{EvaluationPool, EvidenceResult, Hyperparameters};
use crate::options::BiftOptions;
use crate::progress::{is_canceled, CancelToken};
use crate::transform::{interpolate_linear, linspace, pr_moments};

/// Initial perturbation multiplier; samples span `±5%·mult` of each optimum value.
const INITIAL_SPREAD: f64 = 3.0;
/// Evidence magnitude treated as a numerical blow-up.
const BLOW_UP_EVIDENCE: f64 = 9e8;
/// Below this multiplier the draws are accepted even if they still blow up.
const MIN_SPREAD: f64 = 0.001;

/// Uniformly perturbed hyperparameter samples. The first sample is the optimum itself.
#[derive(Clone, Debug)]
pub struct PerturbationDraws {
    samples: Vec<Hyperparameters>,
}

impl PerturbationDraws {
    /// Wraps explicit samples.
    pub fn new(samples: Vec<Hyperparameters>) -> Result<Self> {
        if samples.is_empty() {
            return Err(BiftError::TooFewPoints {
                context: "Monte Carlo draws",
                minimum: 1,
                found: 0,
            });
        }
        Ok(Self { samples })
    }

    /// Draws `runs` samples with `value + 0.1·value·(u − 0.5)·spread`, `u ~ U[0, 1)`,
    /// independently for `log(alpha)` and Dmax.
    pub fn uniform_around(
        center: Hyperparameters,
        runs: usize,
        spread: f64,
        rng: &mut SmallRng,
    ) -> Result<Self> {
        let unit = Uniform::new(0.0, 1.0);
        let log_alpha: Vec<f64> = (0..runs)
            .map(|_| center.log_alpha + 0.1 * center.log_alpha * (unit.sample(rng) - 0.5) * spread)
            .collect();
        let dmax: Vec<f64> = (0..runs)
            .map(|_| center.dmax + 0.1 * center.dmax * (unit.sample(rng) - 0.5) * spread)
            .collect();

        let mut samples: Vec<_> = log_alpha
            .into_iter()
            .zip(dmax)
            .map(|(a, d)| Hyperparameters::new(a, d))
            .collect();
        if let Some(first) = samples.first_mut() {
            *first = center;
        }
        Self::new(samples)
    }

    pub fn draw_count(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> &[Hyperparameters] {
        &self.samples
    }
}

/// Probability-weighted mean and standard deviation of one quantity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Estimate {
    /// Weighted mean over the runs.
    pub value: f64,
    /// Weighted standard deviation over the runs.
    pub error: f64,
}

impl Estimate {
    /// `Σ pₖxₖ` and `sqrt(Σ pₖ(xₖ − mean)²)` for weights summing to one.
    ///
    /// Runs with zero weight are skipped, so rejected (`±inf`) runs do not poison the sums.
    pub fn weighted(values: &DVector<f64>, weights: &DVector<f64>) -> Self {
        let weighted = || {
            values
                .iter()
                .zip(weights.iter())
                .filter(|(_, &p)| p > 0.0)
        };
        let value: f64 = weighted().map(|(x, p)| x * p).sum();
        let variance: f64 = weighted().map(|(x, p)| (x - value).powi(2) * p).sum();
        Self {
            value,
            error: variance.sqrt(),
        }
    }
}

/// Aggregated Monte Carlo statistics.
#[derive(Clone, Debug)]
pub struct MonteCarloSummary {
    /// Common grid every run was interpolated onto, `[0, widest Dmax]`.
    pub r: DVector<f64>,
    /// Weighted mean `P(r)` on `r`.
    pub pr_mean: DVector<f64>,
    /// Weighted standard deviation of `P(r)` on `r`.
    pub pr_err: DVector<f64>,
    /// In log-space, like the search.
    pub alpha: Estimate,
    /// Maximum dimension.
    pub dmax: Estimate,
    /// Chi-squared of each run's fit.
    pub chi_squared: Estimate,
    /// Log evidence.
    pub evidence: Estimate,
    /// Radius of gyration from each run's `P(r)` moments.
    pub rg: Estimate,
    /// Forward scattering from each run's `P(r)` moments.
    pub i0: Estimate,
    /// Normalized run weights, aligned with the final draws.
    pub weights: DVector<f64>,
    /// Perturbation multiplier of the accepted draws.
    pub spread: f64,
}

/// Per-run outputs on the common grid; row `k` belongs to draw `k`.
struct RunTable {
    evidence: DVector<f64>,
    chi_squared: DVector<f64>,
    pr: DMatrix<f64>,
}

impl RunTable {
    fn collect(draws: &PerturbationDraws, results: &[EvidenceResult], ref_r: &DVector<f64>) -> Self {
        let runs = draws.draw_count();
        let mut table = Self {
            evidence: DVector::zeros(runs),
            chi_squared: DVector::zeros(runs),
            pr: DMatrix::zeros(runs, ref_r.len()),
        };

        for (index, (params, result)) in draws.samples().iter().zip(results).enumerate() {
            table.evidence[index] = result.evidence;
            table.chi_squared[index] = result.chi_squared;
            for (k, &r) in ref_r.iter().enumerate() {
                // Beyond a run's own Dmax its P(r) is zero.
                if r < params.dmax {
                    table.pr[(index, k)] = interpolate_linear(&result.r, &result.pr, r);
                }
            }
        }
        table
    }

    /// Largest `|evidence|` among runs that evaluated cleanly; rejected runs are ignored.
    fn max_abs_evidence(&self) -> f64 {
        self.evidence
            .iter()
            .filter(|e| e.is_finite())
            .map(|e| e.abs())
            .fold(0.0, f64::max)
    }

    /// `exp(ev − max ev)^(1 / min chi²)`, normalized to sum to one.
    fn weights(&self) -> DVector<f64> {
        let runs = self.evidence.len();
        let ev_max = self.evidence.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let c_min = self.chi_squared.iter().copied().fold(f64::INFINITY, f64::min);

        let raw = self.evidence.map(|ev| {
            let p = (ev - ev_max).exp().powf(1.0 / c_min);
            if p.is_finite() {
                p
            } else {
                0.0
            }
        });
        let total = raw.sum();
        if total > 0.0 && total.is_finite() {
            raw / total
        } else {
            log::warn!("Monte Carlo weights degenerate; falling back to uniform weights");
            DVector::from_element(runs, 1.0 / runs as f64)
        }
    }
}

/// Draws around `optimum` and evaluates until no run blows up, halving the spread each time.
///
/// Gives up shrinking once the spread would fall below [`MIN_SPREAD`] or on
/// cancellation, and keeps the last draws. Returns the draws, their table and
/// the spread they were drawn with.
fn draw_until_stable<E>(
    optimum: Hyperparameters,
    runs: usize,
    ref_r: &DVector<f64>,
    rng: &mut SmallRng,
    cancel: Option<&CancelToken>,
    mut evaluate: E,
) -> Result<(PerturbationDraws, RunTable, f64)>
where
    E: FnMut(&PerturbationDraws) -> Vec<EvidenceResult>,
{
    let mut spread = INITIAL_SPREAD;
    loop {
        let draws = PerturbationDraws::uniform_around(optimum, runs, spread, rng)?;
        let results = evaluate(&draws);
        let table = RunTable::collect(&draws, &results, ref_r);

        let blow_up = table.max_abs_evidence();
        if blow_up < BLOW_UP_EVIDENCE {
            return Ok((draws, table, spread));
        }

        let shrunk = spread / 2.0;
        if shrunk < MIN_SPREAD || is_canceled(cancel) {
            log::warn!("Monte Carlo evidence still at {blow_up:.3e}; keeping spread {spread}");
            return Ok((draws, table, spread));
        }
        log::warn!("Monte Carlo evidence blew up ({blow_up:.3e}); shrinking perturbation to {shrunk}");
        spread = shrunk;
    }
}

/// Perturbs the optimum, evaluates all perturbations and aggregates the statistics.
pub struct MonteCarloErrorEstimator<'a> {
    profile: &'a Profile,
    options: &'a BiftOptions,
    cancel: Option<&'a CancelToken>,
}

impl<'a> MonteCarloErrorEstimator<'a> {
    pub fn new(
        profile: &'a Profile,
        options: &'a BiftOptions,
        cancel: Option<&'a CancelToken>,
    ) -> Self {
        Self {
            profile,
            options,
            cancel,
        }
    }

    /// Runs the estimate around `optimum` (log-space alpha).
    ///
    /// Cancellation only stops the blow-up retries; callers poll the token afterwards.
    pub fn estimate(&self, optimum: Hyperparameters) -> Result<MonteCarloSummary> {
        let options = self.options;
        let n = options.intervals();
        let pool = EvaluationPool::new(self.profile, n, &options.solver, options.parallelism);
        let mut rng = match options.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };

        let widest_dmax = optimum.dmax + 0.1 * optimum.dmax * 0.5 * INITIAL_SPREAD;
        let ref_r = linspace(0.0, widest_dmax, n + 1);

        let (draws, table, spread) = draw_until_stable(
            optimum,
            options.mc_runs,
            &ref_r,
            &mut rng,
            self.cancel,
            |draws| pool.map_absorbing(draws.samples()),
        )?;
        drop(pool);

        let weights = table.weights();
        let runs = draws.draw_count();

        let pr_mean = table.pr.tr_mul(&weights);
        let pr_err = DVector::from_fn(ref_r.len(), |k, _| {
            let mut variance = 0.0;
            for run in 0..runs {
                variance += (table.pr[(run, k)] - pr_mean[k]).powi(2) * weights[run];
            }
            variance.abs().sqrt()
        });

        let alpha_values = DVector::from_iterator(runs, draws.samples().iter().map(|s| s.log_alpha));
        let dmax_values = DVector::from_iterator(runs, draws.samples().iter().map(|s| s.dmax));

        let mut rg_values = DVector::zeros(runs);
        let mut i0_values = DVector::zeros(runs);
        for run in 0..runs {
            let pr = table.pr.row(run).transpose();
            let moments = pr_moments(&pr, &ref_r);
            rg_values[run] = moments.rg;
            i0_values[run] = moments.i0;
        }

        let summary = MonteCarloSummary {
            pr_mean,
            pr_err,
            alpha: Estimate::weighted(&alpha_values, &weights),
            dmax: Estimate::weighted(&dmax_values, &weights),
            chi_squared: Estimate::weighted(&table.chi_squared, &weights),
            evidence: Estimate::weighted(&table.evidence, &weights),
            rg: Estimate::weighted(&rg_values, &weights),
            i0: Estimate::weighted(&i0_values, &weights),
            r: ref_r,
            weights,
            spread,
        };

        log::info!(
            "Monte Carlo over {runs} runs: rg {:.3} ± {:.3}, i0 {:.4e} ± {:.4e}, dmax {:.3} ± {:.3}",
            summary.rg.value,
            summary.rg.error,
            summary.i0.value,
            summary.i0.error,
            summary.dmax.value,
            summary.dmax.error
        );

        Ok(summary)
    }
}
