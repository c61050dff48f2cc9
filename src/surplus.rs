//! Expected-surplus estimators: closed-form logit, Monte Carlo and quadrature.
//!
//! Every estimator approximates `G(v) = E[max_j (v_j + e_j)]` and its gradient,
//! the vector of choice probabilities. When an outside good is modelled its
//! utility is normalized to zero and it does not appear in `v`.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::error::{Result, SurplusError};
use crate::integration::{IntegrationRule, ShockSample};

/// Euler–Mascheroni constant, the mean of a standard type-one extreme value draw.
pub const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Draws per rayon work item in the Monte Carlo reduction.
const BLOCK_DRAWS: usize = 4_096;

/// Surplus and choice probabilities evaluated at one utility vector.
#[derive(Clone, Debug)]
pub struct SurplusEvaluation {
    /// Approximated expected maximum utility.
    pub surplus: f64,
    /// Probability that each inside alternative attains the maximum.
    pub probabilities: DVector<f64>,
}

/// Common interface of the expected-surplus approximations.
pub trait SurplusEstimator {
    /// Number of inside alternatives `J`.
    fn alternatives(&self) -> usize;

    /// Whether a zero-utility outside option competes with the inside alternatives.
    fn outside_good(&self) -> bool;

    /// Whether the surplus is twice differentiable in the utilities.
    fn is_smooth(&self) -> bool;

    /// Evaluates surplus and choice probabilities in one pass.
    fn evaluate(&self, utilities: &DVector<f64>) -> Result<SurplusEvaluation>;

    /// Expected surplus at `utilities`.
    fn surplus(&self, utilities: &DVector<f64>) -> Result<f64> {
        Ok(self.evaluate(utilities)?.surplus)
    }

    /// Choice probabilities (the surplus gradient) at `utilities`.
    fn choice_probabilities(&self, utilities: &DVector<f64>) -> Result<DVector<f64>> {
        Ok(self.evaluate(utilities)?.probabilities)
    }

    /// Closed-form Hessian of the surplus, when the estimator has one.
    fn surplus_hessian(&self, _utilities: &DVector<f64>) -> Result<Option<DMatrix<f64>>> {
        Ok(None)
    }
}

/// Exact expected surplus under independent standard type-one extreme value shocks.
#[derive(Clone, Debug)]
pub struct LogitSurplus {
    alternatives: usize,
    outside_good: bool,
}

impl LogitSurplus {
    /// Closed-form estimator for `alternatives` inside goods.
    pub fn new(alternatives: usize, outside_good: bool) -> Result<Self> {
        if alternatives == 0 {
            return Err(SurplusError::dimension_mismatch("logit alternatives", 1, 0));
        }
        Ok(Self {
            alternatives,
            outside_good,
        })
    }
}

impl SurplusEstimator for LogitSurplus {
    fn alternatives(&self) -> usize {
        self.alternatives
    }

    fn outside_good(&self) -> bool {
        self.outside_good
    }

    fn is_smooth(&self) -> bool {
        true
    }

    fn evaluate(&self, utilities: &DVector<f64>) -> Result<SurplusEvaluation> {
        check_utilities(utilities, self.alternatives)?;
        let mut probabilities = vec![0.0; self.alternatives];
        let log_sum = log_sum_exp(utilities.as_slice(), self.outside_good, &mut probabilities);
        finite_surplus(log_sum + EULER_GAMMA, probabilities)
    }

    fn surplus_hessian(&self, utilities: &DVector<f64>) -> Result<Option<DMatrix<f64>>> {
        let probabilities = self.choice_probabilities(utilities)?;
        let mut hessian = DMatrix::zeros(self.alternatives, self.alternatives);
        add_logit_hessian(&mut hessian, probabilities.as_slice(), 1.0);
        Ok(Some(hessian))
    }
}

/// Simulated expected maximum over a fixed sample of shocks.
///
/// `G(v) = (1/S) sum_s max_j (v_j + e_js)`. With an outside good the per-draw
/// maximum is clipped at zero before it is accumulated, so draws won by the
/// outside option contribute zero surplus and count towards no inside
/// alternative.
#[derive(Clone, Debug)]
pub struct MonteCarloSurplus {
    sample: ShockSample,
    outside_good: bool,
}

#[derive(Debug)]
struct BlockTally {
    total: f64,
    wins: Vec<u64>,
}

impl MonteCarloSurplus {
    /// Wraps a shock sample; its row count fixes the number of alternatives.
    pub fn new(sample: ShockSample, outside_good: bool) -> Self {
        Self {
            sample,
            outside_good,
        }
    }

    /// Returns the underlying shock sample.
    pub fn sample(&self) -> &ShockSample {
        &self.sample
    }

    fn tally_block(&self, block: &[f64], utilities: &[f64]) -> BlockTally {
        let j = utilities.len();
        let floor = if self.outside_good {
            0.0
        } else {
            f64::NEG_INFINITY
        };
        let mut tally = BlockTally {
            total: 0.0,
            wins: vec![0; j],
        };

        for draw in block.chunks_exact(j) {
            let mut best = floor;
            let mut winner = None;
            for (index, (shock, utility)) in draw.iter().zip(utilities).enumerate() {
                let value = utility + shock;
                if value > best {
                    best = value;
                    winner = Some(index);
                }
            }
            tally.total += best;
            if let Some(index) = winner {
                tally.wins[index] += 1;
            }
        }
        tally
    }
}

impl SurplusEstimator for MonteCarloSurplus {
    fn alternatives(&self) -> usize {
        self.sample.alternatives()
    }

    fn outside_good(&self) -> bool {
        self.outside_good
    }

    fn is_smooth(&self) -> bool {
        false
    }

    fn evaluate(&self, utilities: &DVector<f64>) -> Result<SurplusEvaluation> {
        let j = self.alternatives();
        check_utilities(utilities, j)?;
        let draws = self.sample.draw_count();

        // Blocks are reduced in order so the sum does not depend on the thread count.
        let tallies: Vec<BlockTally> = self
            .sample
            .draws()
            .as_slice()
            .par_chunks(j * BLOCK_DRAWS)
            .map(|block| self.tally_block(block, utilities.as_slice()))
            .collect();

        let mut total = 0.0;
        let mut wins = vec![0u64; j];
        for tally in &tallies {
            total += tally.total;
            for (count, block_count) in wins.iter_mut().zip(&tally.wins) {
                *count += block_count;
            }
        }

        let scale = draws as f64;
        let probabilities = wins.iter().map(|count| *count as f64 / scale).collect();
        finite_surplus(total / scale, probabilities)
    }
}

/// Analytic expectation over the idiosyncratic terms at each quadrature node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InnerExpectation {
    /// Type-one extreme value errors: the log-sum plus Euler's constant (mixed logit).
    Logit,
    /// No idiosyncratic error: the plain maximum (pure characteristics).
    Maximum,
}

/// Expected surplus integrated over random coefficients with weighted nodes.
///
/// Node `k` shifts the utilities by `loadings * node_k`; the inner expectation
/// at that realization is evaluated in closed form and the results are
/// combined with the rule's weights in node order.
#[derive(Clone, Debug)]
pub struct QuadratureSurplus {
    weights: DVector<f64>,
    shifts: DMatrix<f64>,
    kernel: InnerExpectation,
    outside_good: bool,
}

impl QuadratureSurplus {
    /// Builds the estimator from a rule over `D` coefficients and `J x D` loadings.
    pub fn new(
        rule: &IntegrationRule,
        loadings: &DMatrix<f64>,
        kernel: InnerExpectation,
        outside_good: bool,
    ) -> Result<Self> {
        if loadings.nrows() == 0 {
            return Err(SurplusError::dimension_mismatch("loading rows", 1, 0));
        }
        if loadings.ncols() != rule.dimension() {
            return Err(SurplusError::dimension_mismatch(
                "rule dimension",
                loadings.ncols(),
                rule.dimension(),
            ));
        }

        let shifts = loadings * rule.nodes().transpose();
        Ok(Self {
            weights: rule.weights().clone(),
            shifts,
            kernel,
            outside_good,
        })
    }

    /// Inner expectation evaluated at each node.
    pub fn kernel(&self) -> InnerExpectation {
        self.kernel
    }

    /// Number of integration nodes.
    pub fn node_count(&self) -> usize {
        self.weights.len()
    }

    fn node_utilities(&self, utilities: &DVector<f64>, node: usize, buffer: &mut [f64]) {
        for (j, value) in buffer.iter_mut().enumerate() {
            *value = utilities[j] + self.shifts[(j, node)];
        }
    }
}

impl SurplusEstimator for QuadratureSurplus {
    fn alternatives(&self) -> usize {
        self.shifts.nrows()
    }

    fn outside_good(&self) -> bool {
        self.outside_good
    }

    fn is_smooth(&self) -> bool {
        self.kernel == InnerExpectation::Logit
    }

    fn evaluate(&self, utilities: &DVector<f64>) -> Result<SurplusEvaluation> {
        let j = self.alternatives();
        check_utilities(utilities, j)?;

        let mut node_values = vec![0.0; j];
        let mut node_probabilities = vec![0.0; j];
        let mut surplus = 0.0;
        let mut probabilities = vec![0.0; j];

        for (node, weight) in self.weights.iter().enumerate() {
            self.node_utilities(utilities, node, &mut node_values);
            match self.kernel {
                InnerExpectation::Logit => {
                    let log_sum =
                        log_sum_exp(&node_values, self.outside_good, &mut node_probabilities);
                    surplus += weight * (log_sum + EULER_GAMMA);
                    for (total, p) in probabilities.iter_mut().zip(&node_probabilities) {
                        *total += weight * p;
                    }
                }
                InnerExpectation::Maximum => {
                    let mut best = if self.outside_good {
                        0.0
                    } else {
                        f64::NEG_INFINITY
                    };
                    let mut winner = None;
                    for (index, value) in node_values.iter().enumerate() {
                        if *value > best {
                            best = *value;
                            winner = Some(index);
                        }
                    }
                    surplus += weight * best;
                    if let Some(index) = winner {
                        probabilities[index] += weight;
                    }
                }
            }
        }

        finite_surplus(surplus, probabilities)
    }

    fn surplus_hessian(&self, utilities: &DVector<f64>) -> Result<Option<DMatrix<f64>>> {
        if self.kernel != InnerExpectation::Logit {
            return Ok(None);
        }
        let j = self.alternatives();
        check_utilities(utilities, j)?;

        let mut node_values = vec![0.0; j];
        let mut node_probabilities = vec![0.0; j];
        let mut hessian = DMatrix::zeros(j, j);
        for (node, weight) in self.weights.iter().enumerate() {
            self.node_utilities(utilities, node, &mut node_values);
            log_sum_exp(&node_values, self.outside_good, &mut node_probabilities);
            add_logit_hessian(&mut hessian, &node_probabilities, *weight);
        }
        Ok(Some(hessian))
    }
}

/// Estimator selected by configuration.
#[derive(Clone, Debug)]
pub enum Estimator {
    /// Exact logit surplus.
    ClosedForm(LogitSurplus),
    /// Simulated shocks.
    MonteCarlo(MonteCarloSurplus),
    /// Weighted nodes over random coefficients.
    Quadrature(QuadratureSurplus),
}

impl Estimator {
    fn inner(&self) -> &dyn SurplusEstimator {
        match self {
            Self::ClosedForm(inner) => inner,
            Self::MonteCarlo(inner) => inner,
            Self::Quadrature(inner) => inner,
        }
    }

    /// Short label used in logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ClosedForm(_) => "closed form",
            Self::MonteCarlo(_) => "monte carlo",
            Self::Quadrature(inner) => match inner.kernel() {
                InnerExpectation::Logit => "quadrature (logit kernel)",
                InnerExpectation::Maximum => "quadrature (max kernel)",
            },
        }
    }
}

impl SurplusEstimator for Estimator {
    fn alternatives(&self) -> usize {
        self.inner().alternatives()
    }

    fn outside_good(&self) -> bool {
        self.inner().outside_good()
    }

    fn is_smooth(&self) -> bool {
        self.inner().is_smooth()
    }

    fn evaluate(&self, utilities: &DVector<f64>) -> Result<SurplusEvaluation> {
        self.inner().evaluate(utilities)
    }

    fn surplus_hessian(&self, utilities: &DVector<f64>) -> Result<Option<DMatrix<f64>>> {
        self.inner().surplus_hessian(utilities)
    }
}

impl From<LogitSurplus> for Estimator {
    fn from(value: LogitSurplus) -> Self {
        Self::ClosedForm(value)
    }
}

impl From<MonteCarloSurplus> for Estimator {
    fn from(value: MonteCarloSurplus) -> Self {
        Self::MonteCarlo(value)
    }
}

impl From<QuadratureSurplus> for Estimator {
    fn from(value: QuadratureSurplus) -> Self {
        Self::Quadrature(value)
    }
}

fn check_utilities(utilities: &DVector<f64>, expected: usize) -> Result<()> {
    if utilities.len() != expected {
        return Err(SurplusError::dimension_mismatch(
            "utility length",
            expected,
            utilities.len(),
        ));
    }
    if let Some(value) = utilities.iter().find(|value| !value.is_finite()) {
        return Err(SurplusError::degenerate("utility validation", *value));
    }
    Ok(())
}

fn finite_surplus(surplus: f64, probabilities: Vec<f64>) -> Result<SurplusEvaluation> {
    if !surplus.is_finite() {
        return Err(SurplusError::degenerate("surplus evaluation", surplus));
    }
    Ok(SurplusEvaluation {
        surplus,
        probabilities: DVector::from_vec(probabilities),
    })
}

/// Stable `log(1{outside} + sum_j exp(u_j))`, writing the softmax into `probabilities`.
fn log_sum_exp(values: &[f64], outside: bool, probabilities: &mut [f64]) -> f64 {
    let mut peak = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if outside {
        peak = peak.max(0.0);
    }

    let mut denominator = if outside { (-peak).exp() } else { 0.0 };
    for (p, value) in probabilities.iter_mut().zip(values) {
        *p = (value - peak).exp();
        denominator += *p;
    }
    for p in probabilities.iter_mut() {
        *p /= denominator;
    }
    peak + denominator.ln()
}

/// Accumulates `weight * (diag(s) - s s')` into `hessian`.
fn add_logit_hessian(hessian: &mut DMatrix<f64>, probabilities: &[f64], weight: f64) {
    for (i, pi) in probabilities.iter().enumerate() {
        for (k, pk) in probabilities.iter().enumerate() {
            hessian[(i, k)] -= weight * pi * pk;
        }
        hessian[(i, i)] += weight * pi;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_utilities() -> DVector<f64> {
        DVector::from_vec(vec![0.3, -0.2, 0.1, 0.8, -1.0])
    }

    #[test]
    fn logit_surplus_matches_log_sum_plus_gamma() {
        let estimator = LogitSurplus::new(5, false).unwrap();
        let v = sample_utilities();
        let expected = v.iter().map(|x| x.exp()).sum::<f64>().ln() + EULER_GAMMA;
        let evaluation = estimator.evaluate(&v).unwrap();
        assert_relative_eq!(evaluation.surplus, expected, epsilon = 1e-12);
        assert_relative_eq!(evaluation.probabilities.sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn monte_carlo_gumbel_approaches_closed_form() {
        let v = sample_utilities();
        let exact = LogitSurplus::new(5, false).unwrap().evaluate(&v).unwrap();
        let sample = ShockSample::gumbel(5, 200_000, 2024).unwrap();
        let simulated = MonteCarloSurplus::new(sample, false).evaluate(&v).unwrap();

        assert_relative_eq!(simulated.surplus, exact.surplus, epsilon = 1.5e-2);
        for (p_sim, p_exact) in simulated.probabilities.iter().zip(exact.probabilities.iter()) {
            assert_relative_eq!(*p_sim, *p_exact, epsilon = 1e-2);
        }
    }

    #[test]
    fn monte_carlo_clips_before_accumulating() {
        // Two draws: one where every inside utility is negative, one positive.
        let draws = DMatrix::from_column_slice(2, 2, &[-3.0, -2.0, 1.0, 0.5]);
        let estimator = MonteCarloSurplus::new(ShockSample::new(draws).unwrap(), true);
        let evaluation = estimator.evaluate(&DVector::zeros(2)).unwrap();
        assert_relative_eq!(evaluation.surplus, 0.5, epsilon = 1e-15);
        assert_relative_eq!(evaluation.probabilities[0], 0.5, epsilon = 1e-15);
        assert_relative_eq!(evaluation.probabilities[1], 0.0, epsilon = 1e-15);
    }

    #[test]
    fn monte_carlo_surplus_is_monotone_and_convex() {
        let sample = ShockSample::standard_normal(4, 20_000, 5).unwrap();
        let estimator = MonteCarloSurplus::new(sample, false);
        let base = DVector::from_vec(vec![0.2, -0.4, 0.0, 0.5]);
        let direction = DVector::from_vec(vec![1.0, -0.5, 0.25, 2.0]);
        let step = 0.1;

        let g0 = estimator.surplus(&base).unwrap();
        for j in 0..4 {
            let mut bumped = base.clone();
            bumped[j] += step;
            assert!(estimator.surplus(&bumped).unwrap() >= g0);
        }

        let plus = estimator.surplus(&(&base + &direction * step)).unwrap();
        let minus = estimator.surplus(&(&base - &direction * step)).unwrap();
        assert!(plus - 2.0 * g0 + minus >= -1e-12);
    }

    #[test]
    fn monte_carlo_variance_shrinks_with_sample_size() {
        let v = sample_utilities();
        let spread = |draws: usize| {
            let estimates: Vec<f64> = (0..30)
                .map(|seed| {
                    let sample = ShockSample::gumbel(5, draws, 100 + seed).unwrap();
                    MonteCarloSurplus::new(sample, false).surplus(&v).unwrap()
                })
                .collect();
            let mean = estimates.iter().sum::<f64>() / estimates.len() as f64;
            let squares: f64 = estimates.iter().map(|e| (e - mean).powi(2)).sum();
            squares / (estimates.len() - 1) as f64
        };
        assert!(spread(16_000) < spread(1_000) / 4.0);
    }

    #[test]
    fn quadrature_without_heterogeneity_reduces_to_logit() {
        let rule = IntegrationRule::gauss_hermite(7, 1).unwrap();
        let loadings = DMatrix::zeros(5, 1);
        let estimator =
            QuadratureSurplus::new(&rule, &loadings, InnerExpectation::Logit, true).unwrap();
        let exact = LogitSurplus::new(5, true).unwrap();
        let v = sample_utilities();

        assert_relative_eq!(
            estimator.surplus(&v).unwrap(),
            exact.surplus(&v).unwrap(),
            epsilon = 1e-12
        );
        let h_quad = estimator.surplus_hessian(&v).unwrap().unwrap();
        let h_exact = exact.surplus_hessian(&v).unwrap().unwrap();
        assert_relative_eq!(h_quad, h_exact, epsilon = 1e-12);
    }

    #[test]
    fn quadrature_is_bit_reproducible() {
        let rule = IntegrationRule::gauss_hermite(20, 1).unwrap();
        let loadings = DMatrix::from_column_slice(5, 1, &[1.0, -0.5, 0.3, 2.0, 0.0]);
        let estimator =
            QuadratureSurplus::new(&rule, &loadings, InnerExpectation::Logit, true).unwrap();
        let v = sample_utilities();
        let first = estimator.evaluate(&v).unwrap();
        let second = estimator.evaluate(&v).unwrap();
        assert_eq!(first.surplus.to_bits(), second.surplus.to_bits());
        assert_eq!(first.probabilities, second.probabilities);
    }

    #[test]
    fn logit_hessian_matches_finite_differences_of_probabilities() {
        let rule = IntegrationRule::gauss_hermite(10, 1).unwrap();
        let loadings = DMatrix::from_column_slice(3, 1, &[1.0, 0.0, -1.0]);
        let estimator =
            QuadratureSurplus::new(&rule, &loadings, InnerExpectation::Logit, true).unwrap();
        let v = DVector::from_vec(vec![0.5, -0.1, 0.2]);
        let hessian = estimator.surplus_hessian(&v).unwrap().unwrap();

        let h = 1e-6;
        for k in 0..3 {
            let mut up = v.clone();
            let mut down = v.clone();
            up[k] += h;
            down[k] -= h;
            let column = (estimator.choice_probabilities(&up).unwrap()
                - estimator.choice_probabilities(&down).unwrap())
                / (2.0 * h);
            for i in 0..3 {
                assert_relative_eq!(hessian[(i, k)], column[i], epsilon = 1e-7);
            }
        }
    }

    #[test]
    fn maximum_kernel_has_no_hessian() {
        let rule = IntegrationRule::gauss_hermite(5, 1).unwrap();
        let loadings = DMatrix::from_column_slice(2, 1, &[1.0, -1.0]);
        let estimator =
            QuadratureSurplus::new(&rule, &loadings, InnerExpectation::Maximum, true).unwrap();
        assert!(!estimator.is_smooth());
        assert!(estimator.surplus_hessian(&DVector::zeros(2)).unwrap().is_none());
    }

    #[test]
    fn wrong_length_and_non_finite_utilities_are_rejected() {
        let estimator = LogitSurplus::new(3, false).unwrap();
        assert!(matches!(
            estimator.surplus(&DVector::zeros(2)),
            Err(SurplusError::DimensionMismatch { .. })
        ));
        let v = DVector::from_vec(vec![0.0, f64::NAN, 1.0]);
        assert!(matches!(
            estimator.surplus(&v),
            Err(SurplusError::NumericalDegeneracy { .. })
        ));
    }
}
