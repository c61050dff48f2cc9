//! Inversion solver configuration and diagnostics.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SurplusError};

/// Optimization algorithm used to minimize the inversion criterion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Derivative-free simplex search; works with non-smooth Monte Carlo surpluses.
    #[default]
    NelderMead,
    /// Newton trust region with Steihaug's conjugate-gradient subproblem.
    NewtonTrustRegion,
}

/// Source of second derivatives for [`Algorithm::NewtonTrustRegion`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HessianSource {
    /// Closed-form Hessian supplied by the estimator.
    #[default]
    Analytic,
    /// Central finite differences of the analytic gradient.
    FiniteDifference,
}

/// Configuration of the optimizer that inverts choice probabilities.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Optimization algorithm.
    pub algorithm: Algorithm,
    /// Tolerance on the probability-scaled gradient `max_j |g_j| / p_j`.
    ///
    /// The trust region stops on it directly. Nelder–Mead first stops on
    /// `cost_tolerance`, then restarts from its best vertex with a smaller
    /// simplex while this gradient is still too large (smooth surpluses only).
    pub gradient_tolerance: f64,
    /// Tolerance on the standard deviation of simplex costs (Nelder–Mead only).
    pub cost_tolerance: f64,
    /// Maximum number of optimizer iterations.
    pub max_iterations: u64,
    /// Wall-clock budget in seconds; `None` disables the limit.
    pub time_limit_seconds: Option<f64>,
    /// Log every iteration at `info` level.
    pub show_trace: bool,
    /// Edge length of the initial simplex.
    pub simplex_step: f64,
    /// Initial trust-region radius.
    pub initial_radius: f64,
    /// Largest trust-region radius.
    pub max_radius: f64,
    /// Where the Newton method takes its Hessian from.
    pub hessian: HessianSource,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::NelderMead,
            gradient_tolerance: 1e-8,
            cost_tolerance: 1e-12,
            max_iterations: 10_000,
            time_limit_seconds: Some(60.0),
            show_trace: false,
            simplex_step: 0.5,
            initial_radius: 1.0,
            max_radius: 100.0,
            hessian: HessianSource::Analytic,
        }
    }
}

impl SolverOptions {
    /// Newton trust-region defaults: analytic Hessian and a tighter iteration cap.
    pub fn newton() -> Self {
        Self {
            algorithm: Algorithm::NewtonTrustRegion,
            max_iterations: 200,
            ..Self::default()
        }
    }

    /// Nelder–Mead defaults.
    pub fn nelder_mead() -> Self {
        Self::default()
    }

    /// Override the gradient tolerance.
    pub fn with_gradient_tolerance(mut self, tolerance: f64) -> Self {
        self.gradient_tolerance = tolerance;
        self
    }

    /// Override the simplex cost tolerance.
    pub fn with_cost_tolerance(mut self, tolerance: f64) -> Self {
        self.cost_tolerance = tolerance;
        self
    }

    /// Set the iteration cap.
    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Set (or clear) the wall-clock limit.
    pub fn with_time_limit(mut self, seconds: Option<f64>) -> Self {
        self.time_limit_seconds = seconds;
        self
    }

    /// Enable or disable per-iteration logging.
    pub fn with_trace(mut self, show_trace: bool) -> Self {
        self.show_trace = show_trace;
        self
    }

    /// Choose where the Newton method takes its Hessian from.
    pub fn with_hessian(mut self, hessian: HessianSource) -> Self {
        self.hessian = hessian;
        self
    }

    /// Wall-clock limit as a [`Duration`].
    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit_seconds.map(Duration::from_secs_f64)
    }

    /// Rejects tolerances and budgets the optimizer cannot work with.
    pub fn validate(&self) -> Result<()> {
        let positive = |value: f64| value.is_finite() && value > 0.0;
        if !positive(self.gradient_tolerance) {
            return Err(SurplusError::invalid_option(
                "gradient_tolerance",
                format!("must be finite and positive, found {}", self.gradient_tolerance),
            ));
        }
        if !positive(self.cost_tolerance) {
            return Err(SurplusError::invalid_option(
                "cost_tolerance",
                format!("must be finite and positive, found {}", self.cost_tolerance),
            ));
        }
        if let Some(seconds) = self.time_limit_seconds {
            if !positive(seconds) {
                return Err(SurplusError::invalid_option(
                    "time_limit_seconds",
                    format!("must be finite and positive, found {seconds}"),
                ));
            }
        }
        if !positive(self.simplex_step) {
            return Err(SurplusError::invalid_option(
                "simplex_step",
                "must be finite and positive",
            ));
        }
        if !positive(self.initial_radius) || self.max_radius < self.initial_radius {
            return Err(SurplusError::invalid_option(
                "initial_radius",
                "must be positive and no larger than max_radius",
            ));
        }
        Ok(())
    }
}

/// Diagnostics returned alongside the recovered utilities.
#[derive(Clone, Debug, Serialize)]
pub struct InversionSummary {
    /// Algorithm that produced the result.
    pub algorithm: Algorithm,
    /// Number of iterations performed.
    pub iterations: u64,
    /// Whether the optimizer met its tolerance before the iteration or time budget ran out.
    pub converged: bool,
    /// Termination reason reported by the optimizer.
    pub termination: String,
    /// Probability-scaled gradient norm at the returned point, when the estimator is smooth.
    pub scaled_gradient: Option<f64>,
    /// Wall-clock time spent in the optimizer.
    pub elapsed: Duration,
}
