//! MAP solver for a fixed `(alpha, Dmax)`: configuration, diagnostics and the relaxation loop.

use nalgebra::{DMatrix, DVector};

/// Configuration for the regularized relaxation that recovers `P(r)`.
#[derive(Clone, Debug)]
pub struct SolverOptions {
    /// Maximum number of relaxation sweeps.
    pub max_iterations: usize,
    /// Sweeps that always run before the convergence test is honoured.
    pub min_iterations: usize,
    /// Threshold on the gradient cosine `dotsp` that counts as converged.
    pub precision: f64,
    /// Under-relaxation factor applied to each Gauss-Seidel update.
    pub relaxation: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 2_000,
            min_iterations: 100,
            precision: 0.999,
            relaxation: 0.5,
        }
    }
}

/// Diagnostics returned alongside the MAP estimate.
#[derive(Clone, Debug)]
pub struct SolverSummary {
    /// Number of sweeps performed.
    pub iterations: usize,
    /// Cosine between the smoothness and data-fit gradients after the last sweep.
    pub dotsp: f64,
    /// Threshold that `dotsp` had to exceed.
    pub precision: f64,
}

impl SolverSummary {
    /// Whether the loop stopped on the gradient test rather than the iteration cap.
    pub fn converged(&self) -> bool {
        self.dotsp >= self.precision
    }
}

/// Working buffers for one MAP solve. Owned by a single evaluation.
///
/// `b = Tᵗ·W·T` and `sum_dia = Tᵗ·W·i` with `W = 1/err²`; row and column 0 of
/// `b` and `sum_dia[0]` are zero. `b` is symmetric.
#[derive(Clone, Debug)]
pub struct SolverState {
    /// Current `P(r)` estimate.
    pub f: DVector<f64>,
    /// Working prior, rebuilt from `f` by the smoothness constraint on every sweep.
    pub p: DVector<f64>,
    /// Local variance estimate.
    pub sigma: DVector<f64>,
    /// Data curvature `Tᵗ·W·T`.
    pub b: DMatrix<f64>,
    /// Data projection `Tᵗ·W·i`.
    pub sum_dia: DVector<f64>,
}

impl SolverState {
    /// Wraps prepared buffers; `sigma` starts at zero.
    pub fn new(f: DVector<f64>, p: DVector<f64>, b: DMatrix<f64>, sum_dia: DVector<f64>) -> Self {
        let sigma = DVector::zeros(p.len());
        Self {
            f,
            p,
            sigma,
            b,
            sum_dia,
        }
    }

    /// Number of intervals `N` (the buffers hold `N+1` points).
    pub fn intervals(&self) -> usize {
        self.f.len().saturating_sub(1)
    }

    /// Runs the relaxation to convergence or the iteration cap.
    ///
    /// `alpha` is the linear-space regularization weight. Hitting the cap is not
    /// an error; the summary reports whether the gradient test was met.
    pub fn solve(&mut self, alpha: f64, options: &SolverOptions) -> SolverSummary {
        let n = self.intervals();
        let omega = options.relaxation;
        let mut iteration = 0usize;
        let mut dotsp = 0.0_f64;

        if n < 3 {
            return SolverSummary {
                iterations: 0,
                dotsp,
                precision: options.precision,
            };
        }

        while iteration < options.max_iterations
            && !(iteration > options.min_iterations && dotsp > options.precision)
        {
            iteration += 1;

            for k in 1..n {
                self.sigma[k] = (self.p[k] + 1e-10).abs();
                if self.p[k] <= 0.0 {
                    self.p[k] = -self.p[k] + 1e-10;
                }
                if self.f[k] <= 0.0 {
                    self.f[k] = -self.f[k] + 1e-10;
                }
            }

            // Smoothness constraint: each point is pulled towards the mean of its neighbours.
            for k in 2..n - 1 {
                self.p[k] = 0.5 * (self.f[k - 1] + self.f[k + 1]);
            }
            self.p[1] = 0.5 * self.f[2];
            self.p[n - 1] = 0.5 * self.p[n - 2];
            self.p[0] = self.f[0];
            self.p[n] = self.f[n];

            // Boundary point is effectively unregularized.
            self.sigma[0] = 10.0;

            for k in 1..n {
                let column = self.b.column(k);
                let mut fsumi = 0.0;
                for j in 1..n {
                    fsumi += column[j] * self.f[j];
                }
                fsumi -= column[k] * self.f[k];

                let weight = 2.0 * alpha / self.sigma[k];
                let fx = (weight * self.p[k] + self.sum_dia[k] - fsumi) / (weight + column[k]);
                self.f[k] = (1.0 - omega) * self.f[k] + omega * fx;
            }

            dotsp = self.gradient_cosine();
        }

        log::trace!("MAP solve stopped after {iteration} sweeps, dotsp {dotsp:.6}");

        SolverSummary {
            iterations: iteration,
            dotsp,
            precision: options.precision,
        }
    }

    /// Cosine between `-2(f-p)/sigma` and `2(B·f - sum_dia)` over interior points.
    fn gradient_cosine(&self) -> f64 {
        let n = self.intervals();
        let mut wgrads = 0.0;
        let mut wgradc = 0.0;
        let mut dot = 0.0;

        for k in 1..n {
            let gradsi = -2.0 * (self.f[k] - self.p[k]) / self.sigma[k];

            let column = self.b.column(k);
            let mut bf = 0.0;
            for j in 1..n {
                bf += column[j] * self.f[j];
            }
            let gradci = 2.0 * (bf - self.sum_dia[k]);

            wgrads += gradsi * gradsi;
            wgradc += gradci * gradci;
            dot += gradsi * gradci;
        }

        let norm = wgrads.abs().sqrt() * wgradc.abs().sqrt();
        if norm == 0.0 {
            1.0
        } else {
            dot / norm
        }
    }
}
