//! Bayesian Indirect Fourier Transform (BIFT) for small-angle scattering.
//!
//! Given a measured profile `I(q) ± err`, this crate recovers the pair-distance
//! distribution `P(r)` under a smoothness prior, selects the regularization
//! weight `alpha` and the maximum dimension `Dmax` by maximizing the Bayesian
//! evidence, and propagates the hyperparameter uncertainty into error bars on
//! `P(r)`, `Rg`, `I(0)`, `Dmax` and chi-squared by Monte Carlo resampling.
//!
//! The pipeline is organised as
//!
//! - profile validation (`data` module),
//! - the forward transform and prior (`transform`, `prior`),
//! - the MAP relaxation for fixed hyperparameters (`solving`),
//! - evidence scoring and the parallel evaluation pool (`evidence`),
//! - the grid + Powell hyperparameter search (`search`, `powell`),
//! - Monte Carlo error propagation (`montecarlo`), and
//! - the final IFT record (`results`, `estimation`).
//!
//! # Quick start
//!
//! ```no_run
//! use bift::{run_bift, BiftOptions, CancelToken, ProgressMessage};
//!
//! # let (q, i, err): (Vec<f64>, Vec<f64>, Vec<f64>) = (vec![], vec![], vec![]);
//! let options = BiftOptions::default().with_npts(100).with_seed(7);
//! let cancel = CancelToken::new();
//! let progress = |message: ProgressMessage| println!("{message:?}");
//!
//! match run_bift(&q, &i, &err, "sample.dat", &options, Some(&progress), Some(&cancel)) {
//!     Ok(Some(ift)) => println!("Rg = {:.2} ± {:.2}", ift.parameters.rg, ift.parameters.rg_error),
//!     Ok(None) => println!("canceled or failed"),
//!     Err(error) => eprintln!("invalid input: {error}"),
//! }
//! ```

pub mod data;
pub mod error;
pub mod estimation;
pub mod evidence;
pub mod montecarlo;
pub mod options;
pub mod powell;
pub mod prior;
pub mod progress;
pub mod results;
pub mod search;
pub mod solving;
pub mod transform;

pub use data::{Profile, ProfileBuilder};
pub use error::{BiftError, Result};
pub use estimation::{run_bift, BiftProblem};
pub use evidence::{evaluate_evidence, EvidenceResult, Hyperparameters, Parallelism};
pub use options::BiftOptions;
pub use progress::{BiftStatus, CancelToken, ProgressMessage, ProgressSink};
pub use results::{IftParameters, IftResult};
pub use solving::{SolverOptions, SolverSummary};
