//! Mean-utility inversion: minimize `g(G(v)) - v . p` with `argmin`.
//!
//! The criterion is convex in `v` because the expected surplus `G` is an
//! average of maxima of affine functions, and `exp` of a convex function is
//! convex. Its first-order condition states that the model's choice
//! probabilities equal the target `p`:
//!
//! - [`Criterion::Linear`]: `grad G(v) = p`;
//! - [`Criterion::Exponential`]: `exp(G(v)) grad G(v) = p`, which with
//!   `sum_j p_j = 1` also pins the level of `v` through `G(v) = 0`.
//!
//! Target probabilities must be strictly positive; [`TargetShares`] enforces
//! this. If an entry is close to zero the matching utility runs off to minus
//! infinity and the solver reports non-convergence once its iteration or time
//! budget is exhausted.

use std::cell::RefCell;
use std::time::{Duration, Instant};

use argmin::core::observers::{Observe, ObserverMode};
use argmin::core::{
    CostFunction, Error, Executor, Gradient, Hessian, IterState, Problem, Solver, State,
    TerminationReason, TerminationStatus, KV,
};
use argmin::solver::neldermead::NelderMead;
use argmin::solver::trustregion::{Steihaug, TrustRegion};
use finitediff::FiniteDiff;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::data::TargetShares;
use crate::error::{Result, SurplusError};
use crate::solving::{Algorithm, HessianSource, InversionSummary, SolverOptions};
use crate::surplus::SurplusEstimator;

type SimplexState = IterState<DVector<f64>, (), (), (), (), f64>;
type NewtonState = IterState<DVector<f64>, DVector<f64>, (), DMatrix<f64>, (), f64>;

/// Extra simplex passes allowed while the scaled gradient is above tolerance.
const SIMPLEX_REFINEMENTS: usize = 6;

/// Transform applied to the surplus before subtracting `v . p`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    /// `G(v) - v . p`.
    #[default]
    Linear,
    /// `exp(G(v)) - v . p`, used for CCP inversion.
    Exponential,
}

/// The inversion criterion for one estimator and one target.
pub struct InversionProblem<'a, E: SurplusEstimator + ?Sized> {
    estimator: &'a E,
    target: &'a TargetShares,
    criterion: Criterion,
    hessian: HessianSource,
}

impl<E: SurplusEstimator + ?Sized> Clone for InversionProblem<'_, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E: SurplusEstimator + ?Sized> Copy for InversionProblem<'_, E> {}

impl<'a, E: SurplusEstimator + ?Sized> InversionProblem<'a, E> {
    /// Pairs an estimator with a target after checking that both describe the same choice set.
    pub fn new(estimator: &'a E, target: &'a TargetShares, criterion: Criterion) -> Result<Self> {
        if estimator.alternatives() != target.len() {
            return Err(SurplusError::dimension_mismatch(
                "target length",
                estimator.alternatives(),
                target.len(),
            ));
        }
        if estimator.outside_good() != target.outside_good().is_included() {
            return Err(SurplusError::invalid_option(
                "outside_good",
                format!(
                    "estimator outside good is {} but target uses {:?}",
                    estimator.outside_good(),
                    target.outside_good()
                ),
            ));
        }
        Ok(Self {
            estimator,
            target,
            criterion,
            hessian: HessianSource::Analytic,
        })
    }

    /// Chooses how [`Hessian::hessian`] is computed.
    pub fn with_hessian(mut self, hessian: HessianSource) -> Self {
        self.hessian = hessian;
        self
    }

    /// Criterion value at `utilities`.
    pub fn value(&self, utilities: &DVector<f64>) -> Result<f64> {
        let surplus = self.estimator.surplus(utilities)?;
        let linear = utilities.dot(self.target.probabilities());
        let value = match self.criterion {
            Criterion::Linear => surplus - linear,
            Criterion::Exponential => exponentiate(surplus)? - linear,
        };
        if !value.is_finite() {
            return Err(SurplusError::degenerate("criterion evaluation", value));
        }
        Ok(value)
    }

    /// Criterion gradient at `utilities`.
    pub fn value_gradient(&self, utilities: &DVector<f64>) -> Result<DVector<f64>> {
        let evaluation = self.estimator.evaluate(utilities)?;
        let scale = match self.criterion {
            Criterion::Linear => 1.0,
            Criterion::Exponential => exponentiate(evaluation.surplus)?,
        };
        Ok(evaluation.probabilities * scale - self.target.probabilities())
    }

    /// Criterion Hessian at `utilities`, analytic or by finite differences.
    pub fn value_hessian(&self, utilities: &DVector<f64>) -> Result<DMatrix<f64>> {
        match self.hessian {
            HessianSource::Analytic => self.analytic_hessian(utilities),
            HessianSource::FiniteDifference => self.finite_difference_hessian(utilities),
        }
    }

    /// `max_j |g_j| / p_j`: the gradient measured relative to each target probability.
    pub fn scaled_gradient(&self, gradient: &DVector<f64>) -> f64 {
        scaled_norm(gradient, self.target.probabilities())
    }

    fn analytic_hessian(&self, utilities: &DVector<f64>) -> Result<DMatrix<f64>> {
        let surplus_hessian = self.estimator.surplus_hessian(utilities)?.ok_or_else(|| {
            SurplusError::invalid_option("hessian", "estimator has no closed-form Hessian")
        })?;
        match self.criterion {
            Criterion::Linear => Ok(surplus_hessian),
            Criterion::Exponential => {
                let evaluation = self.estimator.evaluate(utilities)?;
                let scale = exponentiate(evaluation.surplus)?;
                let outer = &evaluation.probabilities * evaluation.probabilities.transpose();
                Ok((outer + surplus_hessian) * scale)
            }
        }
    }

    fn finite_difference_hessian(&self, utilities: &DVector<f64>) -> Result<DMatrix<f64>> {
        let failure: RefCell<Option<SurplusError>> = RefCell::new(None);
        let gradient = |point: &Vec<f64>| -> Vec<f64> {
            match self.value_gradient(&DVector::from_column_slice(point)) {
                Ok(g) => g.iter().copied().collect(),
                Err(err) => {
                    let mut slot = failure.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                    vec![f64::NAN; point.len()]
                }
            }
        };

        let point: Vec<f64> = utilities.iter().copied().collect();
        let rows = point.central_hessian(&gradient);
        if let Some(err) = failure.into_inner() {
            return Err(err);
        }

        let n = point.len();
        let hessian = DMatrix::from_fn(n, n, |i, j| 0.5 * (rows[i][j] + rows[j][i]));
        if let Some(value) = hessian.iter().find(|value| !value.is_finite()) {
            return Err(SurplusError::degenerate("finite-difference Hessian", *value));
        }
        Ok(hessian)
    }
}

impl<E: SurplusEstimator + ?Sized> CostFunction for InversionProblem<'_, E> {
    type Param = DVector<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> std::result::Result<Self::Output, Error> {
        Ok(self.value(param)?)
    }
}

impl<E: SurplusEstimator + ?Sized> Gradient for InversionProblem<'_, E> {
    type Param = DVector<f64>;
    type Gradient = DVector<f64>;

    fn gradient(&self, param: &Self::Param) -> std::result::Result<Self::Gradient, Error> {
        Ok(self.value_gradient(param)?)
    }
}

impl<E: SurplusEstimator + ?Sized> Hessian for InversionProblem<'_, E> {
    type Param = DVector<f64>;
    type Hessian = DMatrix<f64>;

    fn hessian(&self, param: &Self::Param) -> std::result::Result<Self::Hessian, Error> {
        Ok(self.value_hessian(param)?)
    }
}

/// Recovered utilities together with the criterion value and solver diagnostics.
#[derive(Clone, Debug, Serialize)]
pub struct InversionResult {
    /// Best utility vector found.
    pub utilities: DVector<f64>,
    /// Criterion value at `utilities`.
    pub criterion_value: f64,
    /// Optimizer diagnostics.
    pub summary: InversionSummary,
}

impl InversionResult {
    /// Turns a non-converged result into [`SurplusError::ConvergenceFailure`].
    pub fn require_converged(self) -> Result<Self> {
        if self.summary.converged {
            Ok(self)
        } else {
            Err(SurplusError::ConvergenceFailure {
                iterations: self.summary.iterations,
                reason: self.summary.termination.clone(),
            })
        }
    }
}

/// Inverts `target` starting from the zero vector.
pub fn invert<E>(
    estimator: &E,
    target: &TargetShares,
    criterion: Criterion,
    options: &SolverOptions,
) -> Result<InversionResult>
where
    E: SurplusEstimator + ?Sized,
{
    invert_from(
        estimator,
        target,
        criterion,
        options,
        DVector::zeros(target.len()),
    )
}

/// Inverts `target` starting from `start`.
///
/// Non-convergence is reported through [`InversionSummary::converged`], not as
/// an error; invalid inputs and non-finite evaluations abort the run.
pub fn invert_from<E>(
    estimator: &E,
    target: &TargetShares,
    criterion: Criterion,
    options: &SolverOptions,
    start: DVector<f64>,
) -> Result<InversionResult>
where
    E: SurplusEstimator + ?Sized,
{
    options.validate()?;
    let problem = InversionProblem::new(estimator, target, criterion)?.with_hessian(options.hessian);
    if start.len() != target.len() {
        return Err(SurplusError::dimension_mismatch(
            "starting point length",
            target.len(),
            start.len(),
        ));
    }
    if options.algorithm == Algorithm::NewtonTrustRegion && !estimator.is_smooth() {
        return Err(SurplusError::invalid_option(
            "algorithm",
            "Newton trust region needs a smooth surplus; use nelder_mead",
        ));
    }

    log::debug!(
        "inverting {} alternatives with {:?} ({:?} criterion)",
        target.len(),
        options.algorithm,
        criterion
    );

    let started = Instant::now();
    let outcome = match options.algorithm {
        Algorithm::NelderMead => run_nelder_mead(problem, start.clone(), options, started)?,
        Algorithm::NewtonTrustRegion => run_trust_region(problem, start.clone(), options)?,
    };
    let elapsed = started.elapsed();

    let utilities = outcome.best.unwrap_or(start);
    let scaled_gradient = if estimator.is_smooth() {
        Some(problem.scaled_gradient(&problem.value_gradient(&utilities)?))
    } else {
        None
    };
    let solver_converged = matches!(
        outcome.status,
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
    );
    let converged = solver_converged
        && scaled_gradient.map_or(true, |value| value <= options.gradient_tolerance);
    let termination = match &outcome.status {
        TerminationStatus::Terminated(reason) => format!("{reason:?}"),
        TerminationStatus::NotTerminated => "NotTerminated".to_string(),
    };

    if converged {
        log::info!(
            "{:?} converged after {} iterations in {:.3?}",
            options.algorithm,
            outcome.iterations,
            elapsed
        );
    } else {
        log::warn!(
            "{:?} stopped without converging after {} iterations ({termination}, scaled gradient {:?})",
            options.algorithm,
            outcome.iterations,
            scaled_gradient
        );
    }

    Ok(InversionResult {
        utilities,
        criterion_value: outcome.cost,
        summary: InversionSummary {
            algorithm: options.algorithm,
            iterations: outcome.iterations,
            converged,
            termination,
            scaled_gradient,
            elapsed,
        },
    })
}

struct SolverOutcome {
    best: Option<DVector<f64>>,
    cost: f64,
    iterations: u64,
    status: TerminationStatus,
}

/// Runs Nelder–Mead, then restarts it from the best vertex with a smaller
/// simplex and a tighter spread tolerance while a smooth surplus still shows a
/// scaled gradient above `gradient_tolerance`.
fn run_nelder_mead<E>(
    problem: InversionProblem<'_, E>,
    start: DVector<f64>,
    options: &SolverOptions,
    started: Instant,
) -> Result<SolverOutcome>
where
    E: SurplusEstimator + ?Sized,
{
    let mut step = options.simplex_step;
    let mut cost_tolerance = options.cost_tolerance;
    let mut outcome = simplex_pass(
        problem,
        start,
        options,
        step,
        cost_tolerance,
        options.max_iterations,
        options.time_limit(),
    )?;
    if !problem.estimator.is_smooth() {
        return Ok(outcome);
    }

    for round in 1..=SIMPLEX_REFINEMENTS {
        let converged = matches!(
            outcome.status,
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
        );
        let Some(best) = outcome.best.clone() else {
            break;
        };
        if !converged {
            break;
        }
        let scaled = problem.scaled_gradient(&problem.value_gradient(&best)?);
        if scaled <= options.gradient_tolerance {
            break;
        }

        let remaining_iterations = options.max_iterations.saturating_sub(outcome.iterations);
        let remaining_time = match options.time_limit() {
            Some(limit) => match limit.checked_sub(started.elapsed()) {
                Some(left) if left > Duration::ZERO => Some(left),
                _ => break,
            },
            None => None,
        };
        if remaining_iterations == 0 {
            break;
        }

        step *= 0.1;
        cost_tolerance = (cost_tolerance * 0.01).max(f64::EPSILON);
        log::debug!(
            "simplex refinement {round}: scaled gradient {scaled:.3e}, step {step:.1e}, tolerance {cost_tolerance:.1e}"
        );
        let refined = simplex_pass(
            problem,
            best,
            options,
            step,
            cost_tolerance,
            remaining_iterations,
            remaining_time,
        )?;
        let iterations = outcome.iterations + refined.iterations;
        outcome = if refined.best.is_some() && refined.cost <= outcome.cost {
            SolverOutcome {
                iterations,
                ..refined
            }
        } else {
            SolverOutcome {
                iterations,
                status: refined.status,
                ..outcome
            }
        };
    }
    Ok(outcome)
}

fn simplex_pass<E>(
    problem: InversionProblem<'_, E>,
    start: DVector<f64>,
    options: &SolverOptions,
    step: f64,
    cost_tolerance: f64,
    max_iterations: u64,
    time_limit: Option<Duration>,
) -> Result<SolverOutcome>
where
    E: SurplusEstimator + ?Sized,
{
    let mut vertices = Vec::with_capacity(start.len() + 1);
    vertices.push(start.clone());
    for j in 0..start.len() {
        let mut vertex = start.clone();
        vertex[j] += step;
        vertices.push(vertex);
    }

    let solver = NelderMead::new(vertices).with_sd_tolerance(cost_tolerance)?;
    let mut executor = Executor::new(problem, solver)
        .configure(|state: SimplexState| state.max_iters(max_iterations));
    if let Some(limit) = time_limit {
        executor = executor.timeout(limit);
    }
    if options.show_trace {
        executor = executor.add_observer(TraceLogger, ObserverMode::Always);
    }

    let mut state = executor.run()?.state().clone();
    Ok(SolverOutcome {
        best: state.take_best_param(),
        cost: state.get_best_cost(),
        iterations: state.get_iter(),
        status: state.get_termination_status().clone(),
    })
}

fn run_trust_region<E>(
    problem: InversionProblem<'_, E>,
    start: DVector<f64>,
    options: &SolverOptions,
) -> Result<SolverOutcome>
where
    E: SurplusEstimator + ?Sized,
{
    let trust_region = TrustRegion::new(Steihaug::<DVector<f64>, f64>::new())
        .with_radius(options.initial_radius)?
        .with_max_radius(options.max_radius)?;
    let solver = ScaledGradientStop {
        inner: trust_region,
        probabilities: problem.target.probabilities().clone(),
        tolerance: options.gradient_tolerance,
    };

    let mut executor = Executor::new(problem, solver).configure(|state: NewtonState| {
        state.param(start).max_iters(options.max_iterations)
    });
    if let Some(limit) = options.time_limit() {
        executor = executor.timeout(limit);
    }
    if options.show_trace {
        executor = executor.add_observer(TraceLogger, ObserverMode::Always);
    }

    let mut state = executor.run()?.state().clone();
    Ok(SolverOutcome {
        best: state.take_best_param(),
        cost: state.get_best_cost(),
        iterations: state.get_iter(),
        status: state.get_termination_status().clone(),
    })
}

/// Stops a Newton-type solver once the probability-scaled gradient is small enough.
#[derive(Clone)]
struct ScaledGradientStop<S> {
    inner: S,
    probabilities: DVector<f64>,
    tolerance: f64,
}

impl<O, S> Solver<O, NewtonState> for ScaledGradientStop<S>
where
    S: Solver<O, NewtonState>,
{
    const NAME: &'static str = "Newton trust region";

    fn init(
        &mut self,
        problem: &mut Problem<O>,
        state: NewtonState,
    ) -> std::result::Result<(NewtonState, Option<KV>), Error> {
        self.inner.init(problem, state)
    }

    fn next_iter(
        &mut self,
        problem: &mut Problem<O>,
        state: NewtonState,
    ) -> std::result::Result<(NewtonState, Option<KV>), Error> {
        self.inner.next_iter(problem, state)
    }

    fn terminate(&mut self, state: &NewtonState) -> TerminationStatus {
        let status = self.inner.terminate(state);
        if let TerminationStatus::Terminated(_) = status {
            return status;
        }
        match state.get_gradient() {
            Some(gradient) if scaled_norm(gradient, &self.probabilities) <= self.tolerance => {
                TerminationStatus::Terminated(TerminationReason::SolverConverged)
            }
            _ => TerminationStatus::NotTerminated,
        }
    }
}

/// Logs every optimizer iteration when `show_trace` is set.
struct TraceLogger;

impl<I> Observe<I> for TraceLogger
where
    I: State<Float = f64>,
{
    fn observe_iter(&mut self, state: &I, _kv: &KV) -> std::result::Result<(), Error> {
        log::info!(
            "iter {:>5}  cost {:>+.10e}  best {:>+.10e}",
            state.get_iter(),
            state.get_cost(),
            state.get_best_cost()
        );
        Ok(())
    }
}

fn exponentiate(surplus: f64) -> Result<f64> {
    let value = surplus.exp();
    if !value.is_finite() {
        return Err(SurplusError::degenerate("criterion exponentiation", surplus));
    }
    Ok(value)
}

fn scaled_norm(gradient: &DVector<f64>, probabilities: &DVector<f64>) -> f64 {
    gradient
        .iter()
        .zip(probabilities.iter())
        .map(|(g, p)| (g / p).abs())
        .fold(0.0, f64::max)
}
