//! Run configuration for the full BIFT pipeline.

use crate::error::{BiftError, Result};
use crate::evidence::Parallelism;
use crate::powell::PowellOptions;
use crate::solving::SolverOptions;

/// Smallest `npts` the relaxation loop can work with.
pub const MIN_PR_POINTS: usize = 4;

/// Search grid, Monte Carlo and solver settings for [`run_bift`](crate::run_bift).
#[derive(Clone, Debug)]
pub struct BiftOptions {
    /// Number of `P(r)` points; the transform uses `npts - 1` intervals.
    pub npts: usize,
    /// Lower bound of the alpha grid (linear space).
    pub alpha_min: f64,
    /// Upper bound of the alpha grid (linear space).
    pub alpha_max: f64,
    /// Alpha grid points, spaced evenly in `log(alpha)`.
    pub alpha_n: usize,
    /// Lower bound of the Dmax grid.
    pub dmax_min: f64,
    /// Upper bound of the Dmax grid.
    pub dmax_max: f64,
    /// Dmax grid points, spaced linearly.
    pub dmax_n: usize,
    /// Monte Carlo runs for the error estimate.
    pub mc_runs: usize,
    /// Seed for the Monte Carlo draws; `None` seeds from the OS.
    pub seed: Option<u64>,
    /// How grid and Monte Carlo evaluations are distributed.
    pub parallelism: Parallelism,
    /// Settings of the MAP relaxation loop.
    pub solver: SolverOptions,
    /// Settings of the Powell refinement after the grid.
    pub refinement: PowellOptions,
}

impl Default for BiftOptions {
    fn default() -> Self {
        Self {
            npts: 100,
            alpha_min: 150.0,
            alpha_max: 1e10,
            alpha_n: 16,
            dmax_min: 10.0,
            dmax_max: 400.0,
            dmax_n: 10,
            mc_runs: 300,
            seed: None,
            parallelism: Parallelism::default(),
            solver: SolverOptions::default(),
            refinement: PowellOptions::default(),
        }
    }
}

impl BiftOptions {
    /// Number of `P(r)` intervals `N = npts - 1`.
    pub fn intervals(&self) -> usize {
        self.npts.saturating_sub(1)
    }

    pub fn with_npts(mut self, npts: usize) -> Self {
        self.npts = npts;
        self
    }

    /// Override the alpha grid (linear-space bounds).
    pub fn with_alpha_grid(mut self, min: f64, max: f64, points: usize) -> Self {
        self.alpha_min = min;
        self.alpha_max = max;
        self.alpha_n = points;
        self
    }

    pub fn with_dmax_grid(mut self, min: f64, max: f64, points: usize) -> Self {
        self.dmax_min = min;
        self.dmax_max = max;
        self.dmax_n = points;
        self
    }

    pub fn with_mc_runs(mut self, runs: usize) -> Self {
        self.mc_runs = runs;
        self
    }

    /// Fix the Monte Carlo seed so error bars are reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_parallelism(mut self, parallelism: Parallelism) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Evaluate on the calling thread only.
    pub fn sequential(self) -> Self {
        self.with_parallelism(Parallelism::Sequential)
    }

    pub fn with_solver(mut self, solver: SolverOptions) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_refinement(mut self, refinement: PowellOptions) -> Self {
        self.refinement = refinement;
        self
    }

    /// Checks every setting before any evaluation runs.
    pub fn validate(&self) -> Result<()> {
        if self.npts < MIN_PR_POINTS {
            return Err(BiftError::TooFewPoints {
                context: "P(r)",
                minimum: MIN_PR_POINTS,
                found: self.npts,
            });
        }
        if !(self.alpha_min > 0.0 && self.alpha_min.is_finite()) {
            return Err(BiftError::invalid_parameter(
                "alpha_min",
                "must be positive and finite",
            ));
        }
        if !(self.alpha_max > 0.0 && self.alpha_max.is_finite()) {
            return Err(BiftError::invalid_parameter(
                "alpha_max",
                "must be positive and finite",
            ));
        }
        if self.alpha_min > self.alpha_max {
            return Err(BiftError::invalid_range(
                "alpha",
                self.alpha_min,
                self.alpha_max,
            ));
        }
        if !(self.dmax_min > 0.0 && self.dmax_max.is_finite()) {
            return Err(BiftError::invalid_parameter(
                "dmax_min",
                "must be positive with a finite upper bound",
            ));
        }
        if self.dmax_min > self.dmax_max {
            return Err(BiftError::invalid_range(
                "dmax",
                self.dmax_min,
                self.dmax_max,
            ));
        }
        if self.alpha_n == 0 {
            return Err(BiftError::invalid_parameter(
                "alpha_n",
                "at least one grid point is required",
            ));
        }
        if self.dmax_n == 0 {
            return Err(BiftError::invalid_parameter(
                "dmax_n",
                "at least one grid point is required",
            ));
        }
        if self.mc_runs == 0 {
            return Err(BiftError::invalid_parameter(
                "mc_runs",
                "at least one Monte Carlo run is required",
            ));
        }
        if !(self.solver.relaxation > 0.0 && self.solver.relaxation <= 1.0) {
            return Err(BiftError::invalid_parameter(
                "solver.relaxation",
                "must lie in (0, 1]",
            ));
        }
        if let Parallelism::Pool { threads: Some(0) } = self.parallelism {
            return Err(BiftError::invalid_parameter(
                "parallelism",
                "a worker pool needs at least one thread",
            ));
        }
        Ok(())
    }
}
