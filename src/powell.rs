//! Derivative-free minimization by Powell's conjugate direction method.
//!
//! Line minimizations are delegated to `argmin`'s Brent solver. The termination
//! tests and the direction-set update follow the classic formulation in which
//! the direction of largest decrease is replaced by the net displacement of an
//! iteration.

use std::cell::{Cell, RefCell};

use argmin::core::{CostFunction, Error as ArgminError, Executor, State};
use argmin::solver::brent::BrentOpt;
use nalgebra::{DMatrix, DVector};

/// Initial half-width of the step interval searched along a direction.
const LINE_HALF_WIDTH: f64 = 1.0;
/// Growth of the step interval when the minimum lands on its edge.
const LINE_WIDEN: f64 = 10.0;
const LINE_MAX_WIDENINGS: usize = 8;
/// A line minimum beyond this fraction of the half-width counts as on the edge.
const LINE_EDGE_FRACTION: f64 = 0.9;
const BRENT_MAX_ITERATIONS: u64 = 500;
const BRENT_ABSOLUTE_TOLERANCE: f64 = 1.0e-11;

/// Configuration for [`minimize`].
#[derive(Clone, Debug)]
pub struct PowellOptions {
    /// Relative tolerance on the argument, scaled by 100 for each line search.
    pub xtol: f64,
    /// Relative tolerance on the objective between iterations.
    pub ftol: f64,
    /// Iteration cap; `None` means 1000 per free parameter.
    pub max_iterations: Option<usize>,
    /// Objective evaluation cap; `None` means 1000 per free parameter.
    pub max_evaluations: Option<usize>,
}

impl Default for PowellOptions {
    fn default() -> Self {
        Self {
            xtol: 1e-4,
            ftol: 1e-4,
            max_iterations: None,
            max_evaluations: None,
        }
    }
}

/// Why the minimizer stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowellStatus {
    /// The relative decrease over an iteration fell below `ftol`.
    Converged,
    /// The evaluation cap was reached first.
    MaxEvaluations,
    /// The iteration cap was reached first.
    MaxIterations,
    /// The objective became NaN.
    NonFinite,
}

/// Outcome of a Powell minimization.
#[derive(Clone, Debug)]
pub struct PowellResult {
    /// Final point.
    pub x: DVector<f64>,
    /// Objective value at `x`.
    pub fun: f64,
    /// Completed direction-set iterations.
    pub iterations: usize,
    /// Objective evaluations, line searches included.
    pub evaluations: usize,
    /// Reason the minimizer stopped.
    pub status: PowellStatus,
}

impl PowellResult {
    /// `true` only when the tolerance test was met.
    pub fn success(&self) -> bool {
        self.status == PowellStatus::Converged
    }
}

/// Counts objective evaluations. Shared by reference with the line problems.
struct Objective<F> {
    func: RefCell<F>,
    evaluations: Cell<usize>,
}

impl<F: FnMut(&DVector<f64>) -> f64> Objective<F> {
    fn call(&self, x: &DVector<f64>) -> f64 {
        self.evaluations.set(self.evaluations.get() + 1);
        (&mut *self.func.borrow_mut())(x)
    }
}

/// Minimizes `func` starting from `x0` without derivatives.
pub fn minimize<F>(func: F, x0: DVector<f64>, options: &PowellOptions) -> PowellResult
where
    F: FnMut(&DVector<f64>) -> f64,
{
    let dim = x0.len();
    let max_iterations = options.max_iterations.unwrap_or(dim * 1_000);
    let max_evaluations = options.max_evaluations.unwrap_or(dim * 1_000);
    let line_tol = options.xtol * 100.0;

    let objective = Objective {
        func: RefCell::new(func),
        evaluations: Cell::new(0),
    };
    let mut directions = DMatrix::<f64>::identity(dim, dim);
    let mut x = x0;
    let mut fval = objective.call(&x);
    let mut x1 = x.clone();
    let mut iterations = 0usize;

    let status = loop {
        let fx = fval;
        let mut biggest = 0usize;
        let mut delta = 0.0;

        for index in 0..dim {
            let direction = directions.row(index).transpose();
            let before = fval;
            let (f_new, x_new, _) = line_search(&objective, &x, &direction, fval, line_tol);
            fval = f_new;
            x = x_new;
            if before - fval > delta {
                delta = before - fval;
                biggest = index;
            }
        }

        iterations += 1;
        log::debug!("powell iteration {iterations}: f = {fval:.6}, x = {:?}", x.as_slice());

        let bound = options.ftol * (fx.abs() + fval.abs()) + 1e-20;
        if 2.0 * (fx - fval) <= bound {
            break PowellStatus::Converged;
        }
        if objective.evaluations.get() >= max_evaluations {
            break PowellStatus::MaxEvaluations;
        }
        if iterations >= max_iterations {
            break PowellStatus::MaxIterations;
        }
        if fx.is_nan() && fval.is_nan() {
            break PowellStatus::NonFinite;
        }

        let displacement = &x - &x1;
        x1 = x.clone();
        let extrapolated = &x + &displacement;
        let fx2 = objective.call(&extrapolated);

        if fx > fx2 {
            let mut t = 2.0 * (fx + fx2 - 2.0 * fval);
            let temp = fx - fval - delta;
            t *= temp * temp;
            let temp = fx - fx2;
            t -= delta * temp * temp;
            if t < 0.0 {
                let (f_new, x_new, step) =
                    line_search(&objective, &x, &displacement, fval, line_tol);
                fval = f_new;
                x = x_new;
                if step.iter().any(|v| *v != 0.0) {
                    let last = directions.row(dim - 1).clone_owned();
                    directions.set_row(biggest, &last);
                    directions.set_row(dim - 1, &step.transpose());
                }
            }
        }
    };

    let non_finite = fval.is_nan() || x.iter().any(|v| v.is_nan());
    let status = if status == PowellStatus::Converged && non_finite {
        PowellStatus::NonFinite
    } else {
        status
    };

    PowellResult {
        x,
        fun: fval,
        iterations,
        evaluations: objective.evaluations.get(),
        status,
    }
}

/// `t ↦ f(origin + t·direction)`, the 1-D problem handed to the line minimizer.
struct LineProblem<'a, F> {
    objective: &'a Objective<F>,
    origin: &'a DVector<f64>,
    direction: &'a DVector<f64>,
}

impl<F: FnMut(&DVector<f64>) -> f64> CostFunction for LineProblem<'_, F> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, t: &f64) -> Result<f64, ArgminError> {
        Ok(self.objective.call(&(self.origin + self.direction * *t)))
    }
}

/// Minimizes along `direction` from `origin`; returns `(f, x, step)` with `x = origin + step`.
///
/// Brent's method runs on `[-h, h]`. While the minimum lands on the edge of
/// that interval, `h` is widened and the search repeated. A step that does not
/// improve on `f0` is discarded.
fn line_search<F>(
    objective: &Objective<F>,
    origin: &DVector<f64>,
    direction: &DVector<f64>,
    f0: f64,
    tol: f64,
) -> (f64, DVector<f64>, DVector<f64>)
where
    F: FnMut(&DVector<f64>) -> f64,
{
    let mut half_width = LINE_HALF_WIDTH;
    let (mut t_best, mut f_best) = (0.0, f0);

    for _ in 0..=LINE_MAX_WIDENINGS {
        let problem = LineProblem {
            objective,
            origin,
            direction,
        };
        let solver = BrentOpt::new(-half_width, half_width)
            .set_tolerance(tol, BRENT_ABSOLUTE_TOLERANCE);
        let outcome = Executor::new(problem, solver)
            .configure(|state| state.max_iters(BRENT_MAX_ITERATIONS))
            .run();

        let (t, f) = match outcome {
            Ok(result) => {
                let state = result.state();
                match state.get_best_param() {
                    Some(&t) => (t, state.get_best_cost()),
                    None => break,
                }
            }
            Err(error) => {
                log::debug!("line minimization stopped: {error}");
                break;
            }
        };

        if !f.is_nan() && (f_best.is_nan() || f < f_best) {
            t_best = t;
            f_best = f;
        }
        if t.abs() < LINE_EDGE_FRACTION * half_width {
            break;
        }
        half_width *= LINE_WIDEN;
    }

    let step = direction * t_best;
    (f_best, origin + &step, step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn minimizes_shifted_quadratic() {
        let result = minimize(
            |x: &DVector<f64>| (x[0] - 3.0).powi(2) + 10.0 * (x[1] + 1.5).powi(2) + 2.0,
            DVector::from_vec(vec![0.0, 0.0]),
            &PowellOptions::default(),
        );
        assert!(result.success());
        assert_relative_eq!(result.x[0], 3.0, epsilon = 1e-3);
        assert_relative_eq!(result.x[1], -1.5, epsilon = 1e-3);
        assert_relative_eq!(result.fun, 2.0, epsilon = 1e-6);
    }

    #[test]
    fn minimizes_rosenbrock() {
        let result = minimize(
            |x: &DVector<f64>| (1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0] * x[0]).powi(2),
            DVector::from_vec(vec![-1.2, 1.0]),
            &PowellOptions {
                xtol: 1e-8,
                ftol: 1e-12,
                ..PowellOptions::default()
            },
        );
        assert!(result.success());
        assert_relative_eq!(result.x[0], 1.0, epsilon = 1e-2);
        assert_relative_eq!(result.x[1], 1.0, epsilon = 2e-2);
    }

    #[test]
    fn evaluation_cap_reports_failure() {
        let result = minimize(
            |x: &DVector<f64>| (x[0] - 1.0).powi(2) + (x[1] - 2.0).powi(2),
            DVector::from_vec(vec![50.0, -50.0]),
            &PowellOptions {
                max_evaluations: Some(5),
                ..PowellOptions::default()
            },
        );
        assert!(!result.success());
        assert_eq!(result.status, PowellStatus::MaxEvaluations);
    }

    #[test]
    fn nan_objective_is_not_a_success() {
        let result = minimize(
            |_: &DVector<f64>| f64::NAN,
            DVector::from_vec(vec![1.0, 1.0]),
            &PowellOptions::default(),
        );
        assert!(!result.success());
    }
}
