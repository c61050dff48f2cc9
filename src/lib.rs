//! Expected-surplus inversion for discrete-choice demand models.
//!
//! Given observed choice probabilities `p`, the crate recovers the mean
//! utilities `v` that an expected-surplus function `G(v) = E[max_j (v_j + e_j)]`
//! rationalizes, by minimizing the convex criterion `g(G(v)) - v . p`. It offers
//! tools to
//!
//! - validate target probabilities and product characteristics (`data` module),
//! - build shock samples and quadrature rules (`integration` module),
//! - approximate the surplus and its gradient in closed form, by Monte Carlo or
//!   by quadrature (`surplus` and `options` modules),
//! - invert probabilities with Nelder–Mead or a Newton trust region (`inversion`
//!   and `solving` modules), and
//! - reproduce the CCP, mixed logit and pure characteristics experiments
//!   (`experiments` module and the `replicate` binary).
//!
//! Logging goes through the `log` facade; the library never installs a logger.
//!
//! # Quick start
//!
//! ```no_run
//! use surplusinv::data::{OutsideGood, TargetShares};
//! use surplusinv::inversion::{invert, Criterion};
//! use surplusinv::options::{EstimatorConfig, ShockDistribution};
//! use surplusinv::solving::SolverOptions;
//!
//! let target = TargetShares::from_slice(&[0.3, 0.25, 0.2, 0.15, 0.1], OutsideGood::Excluded)
//!     .expect("valid probabilities");
//! let estimator = EstimatorConfig::monte_carlo(ShockDistribution::Gumbel, 100_000, 42)
//!     .build(target.len(), None)
//!     .expect("supported configuration");
//!
//! let result = invert(&estimator, &target, Criterion::Exponential, &SolverOptions::default())
//!     .expect("finite criterion");
//! println!("recovered utilities: {}", result.utilities);
//! println!("converged: {}", result.summary.converged);
//! ```

pub mod data;
pub mod error;
pub mod experiments;
pub mod integration;
pub mod inversion;
pub mod options;
pub mod solving;
pub mod surplus;

pub use error::{Result, SurplusError};
pub use inversion::{invert, invert_from, Criterion, InversionResult};
pub use options::EstimatorConfig;
pub use solving::{Algorithm, InversionSummary, SolverOptions};
pub use surplus::{Estimator, SurplusEstimator};
