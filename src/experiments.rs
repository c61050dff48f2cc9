//! Experiment driver: synthetic economies, ground truth and recovery reports.
//!
//! Each experiment computes "true" choice probabilities with one estimator,
//! inverts them with another and reports `[recovered, true, residual]` per
//! alternative.

use std::f64::consts::PI;
use std::fmt;

use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::data::{OutsideGood, ProductCharacteristics, ProductCharacteristicsBuilder, TargetShares};
use crate::error::{Result, SurplusError};
use crate::inversion::{invert_from, Criterion, InversionResult};
use crate::options::{EstimatorConfig, Heterogeneity, ShockDistribution};
use crate::solving::{InversionSummary, SolverOptions};
use crate::surplus::{SurplusEstimator, EULER_GAMMA};

/// Products in the preset economies.
const PRESET_PRODUCTS: usize = 5;
/// Characteristics in the preset economies.
const PRESET_CHARACTERISTICS: usize = 4;
/// Simulated consumers used by the approximating estimators.
const PRESET_CONSUMERS: usize = 10_000;
/// Gauss–Hermite order of the reference estimators.
const PRESET_ORDER: usize = 50;

/// Draws `Z` (M x J) and `beta` from independent standard normals.
pub fn simulate_characteristics(
    products: usize,
    characteristics: usize,
    sigma: &[f64],
    seed: u64,
) -> Result<ProductCharacteristics> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let z = DMatrix::from_fn(characteristics, products, |_, _| {
        rng.sample::<f64, _>(StandardNormal)
    });
    let beta = DVector::from_fn(characteristics, |_, _| rng.sample::<f64, _>(StandardNormal));

    ProductCharacteristicsBuilder::new(z)
        .beta(beta)
        .sigma(DVector::from_column_slice(sigma))
        .build()
}

/// Products evenly spaced on the unit circle of two random characteristics.
///
/// Rows of `Z` are a constant, a uniform price on `[0.2, 1.0)` and the
/// cosine and sine of each product's angle. Tastes are `beta = (-0.5, -0.5,
/// 0, 0)` and `sigma = (0, 0, 1, 1)`, so every product wins a sector of
/// coefficient space and the outside good wins near the origin.
pub fn ring_characteristics(products: usize, seed: u64) -> Result<ProductCharacteristics> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let prices: Vec<f64> = (0..products).map(|_| rng.gen_range(0.2..1.0)).collect();
    let z = DMatrix::from_fn(4, products, |row, j| {
        let angle = 2.0 * PI * j as f64 / products as f64;
        match row {
            0 => 1.0,
            1 => prices[j],
            2 => angle.cos(),
            _ => angle.sin(),
        }
    });

    ProductCharacteristicsBuilder::new(z)
        .beta(DVector::from_vec(vec![-0.5, -0.5, 0.0, 0.0]))
        .sigma(DVector::from_vec(vec![0.0, 0.0, 1.0, 1.0]))
        .build()
}

/// Solver settings shared by every experiment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentOptions {
    /// Inversion solver configuration.
    pub solver: SolverOptions,
    /// Extra solver runs, each started from the previous best iterate, when a run does not converge.
    pub restarts: usize,
}

impl Default for ExperimentOptions {
    fn default() -> Self {
        Self {
            solver: SolverOptions::default(),
            restarts: 1,
        }
    }
}

impl ExperimentOptions {
    /// Override the solver configuration.
    pub fn with_solver(mut self, solver: SolverOptions) -> Self {
        self.solver = solver;
        self
    }

    /// Override the number of restarts.
    pub fn with_restarts(mut self, restarts: usize) -> Self {
        self.restarts = restarts;
        self
    }
}

/// One alternative of an experiment report.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ExperimentRow {
    /// Zero-based alternative index.
    pub alternative: usize,
    /// Utility returned by the solver.
    pub recovered: f64,
    /// Ground-truth utility.
    pub truth: f64,
    /// `recovered - truth`.
    pub residual: f64,
}

/// Outcome of one experiment.
#[derive(Clone, Debug, Serialize)]
pub struct ExperimentReport {
    /// Experiment name shown in the table header.
    pub name: String,
    /// Per-alternative comparison.
    pub rows: Vec<ExperimentRow>,
    /// Largest absolute residual.
    pub max_residual: f64,
    /// Euclidean norm of the residuals.
    pub l2_residual: f64,
    /// Diagnostics of the last solver run.
    pub summary: InversionSummary,
    /// Number of solver runs, restarts included.
    pub attempts: usize,
}

impl ExperimentReport {
    /// Compares recovered utilities against the truth.
    pub fn new(
        name: impl Into<String>,
        recovered: &DVector<f64>,
        truth: &DVector<f64>,
        summary: InversionSummary,
        attempts: usize,
    ) -> Result<Self> {
        if recovered.len() != truth.len() {
            return Err(SurplusError::dimension_mismatch(
                "recovered utilities",
                truth.len(),
                recovered.len(),
            ));
        }
        let rows: Vec<ExperimentRow> = recovered
            .iter()
            .zip(truth.iter())
            .enumerate()
            .map(|(alternative, (recovered, truth))| ExperimentRow {
                alternative,
                recovered: *recovered,
                truth: *truth,
                residual: recovered - truth,
            })
            .collect();
        let max_residual = rows
            .iter()
            .map(|row| row.residual.abs())
            .fold(0.0, f64::max);
        let l2_residual = rows.iter().map(|row| row.residual.powi(2)).sum::<f64>().sqrt();

        Ok(Self {
            name: name.into(),
            rows,
            max_residual,
            l2_residual,
            summary,
            attempts,
        })
    }

    /// Rename the report.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Residuals as a vector.
    pub fn residuals(&self) -> DVector<f64> {
        DVector::from_iterator(self.rows.len(), self.rows.iter().map(|row| row.residual))
    }
}

impl fmt::Display for ExperimentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "== {} ==", self.name)?;
        writeln!(
            f,
            "{:>4} {:>14} {:>14} {:>14}",
            "j", "recovered", "true", "residual"
        )?;
        for row in &self.rows {
            writeln!(
                f,
                "{:>4} {:>14.6} {:>14.6} {:>14.3e}",
                row.alternative + 1,
                row.recovered,
                row.truth,
                row.residual
            )?;
        }
        write!(
            f,
            "max |residual| {:.3e}, l2 {:.3e}; {:?} {} after {} iterations in {} run(s), {:.3?} ({})",
            self.max_residual,
            self.l2_residual,
            self.summary.algorithm,
            if self.summary.converged {
                "converged"
            } else {
                "did not converge"
            },
            self.summary.iterations,
            self.attempts,
            self.summary.elapsed,
            self.summary.termination
        )
    }
}

/// Inverts observed choice probabilities with the exponential criterion.
///
/// The ground truth is the logit inversion `log p - gamma`, exact when the
/// estimator integrates standard type-one extreme value shocks.
pub fn ccp_inversion<E>(
    probabilities: &TargetShares,
    estimator: &E,
    options: &ExperimentOptions,
) -> Result<ExperimentReport>
where
    E: SurplusEstimator + ?Sized,
{
    let truth = probabilities.probabilities().map(|p| p.ln() - EULER_GAMMA);
    let (result, attempts) = solve_with_restarts(
        estimator,
        probabilities,
        Criterion::Exponential,
        options,
        DVector::zeros(probabilities.len()),
    )?;
    ExperimentReport::new("ccp inversion", &result.utilities, &truth, result.summary, attempts)
}

/// Recovers `x = Z' beta` from the choice probabilities `reference` assigns to it.
///
/// Without an outside good utilities are identified up to a common constant,
/// so the recovered vector is shifted to the mean of the truth before the
/// residuals are taken. With an outside good only the linear criterion is
/// accepted: the exponential criterion solves `log p - gamma`, which is not
/// the utility vector relative to an outside good normalized to zero.
pub fn round_trip<R, A>(
    characteristics: &ProductCharacteristics,
    reference: &R,
    approximation: &A,
    criterion: Criterion,
    options: &ExperimentOptions,
) -> Result<ExperimentReport>
where
    R: SurplusEstimator + ?Sized,
    A: SurplusEstimator + ?Sized,
{
    if reference.outside_good() != approximation.outside_good() {
        return Err(SurplusError::invalid_option(
            "outside_good",
            "reference and approximation must agree on the outside good",
        ));
    }
    if criterion == Criterion::Exponential && reference.outside_good() {
        return Err(SurplusError::invalid_option(
            "criterion",
            "the exponential criterion does not recover utilities relative to an outside good; use linear",
        ));
    }
    let truth = characteristics.mean_utilities();
    let shares = reference.choice_probabilities(&truth)?;
    log::debug!("reference shares {:?}", shares.as_slice());
    let target = TargetShares::new(shares, OutsideGood::from_flag(reference.outside_good()))?;

    let start = target.logit_utilities();
    let (result, attempts) = solve_with_restarts(approximation, &target, criterion, options, start)?;

    let mut recovered = result.utilities;
    if !target.outside_good().is_included() {
        let shift = truth.mean() - recovered.mean();
        recovered.add_scalar_mut(shift);
    }
    ExperimentReport::new("round trip", &recovered, &truth, result.summary, attempts)
}

fn solve_with_restarts<E>(
    estimator: &E,
    target: &TargetShares,
    criterion: Criterion,
    options: &ExperimentOptions,
    start: DVector<f64>,
) -> Result<(InversionResult, usize)>
where
    E: SurplusEstimator + ?Sized,
{
    let mut result = invert_from(estimator, target, criterion, &options.solver, start)?;
    let mut attempts = 1;
    while !result.summary.converged && attempts <= options.restarts {
        log::warn!(
            "restart {}/{} from the best iterate ({}, {} iterations)",
            attempts,
            options.restarts,
            result.summary.termination,
            result.summary.iterations
        );
        let start = result.utilities.clone();
        result = invert_from(estimator, target, criterion, &options.solver, start)?;
        attempts += 1;
    }
    Ok((result, attempts))
}

/// Source of the product characteristics in a round-trip experiment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Economy {
    /// See [`simulate_characteristics`].
    Simulated {
        products: usize,
        characteristics: usize,
        sigma: Vec<f64>,
        seed: u64,
    },
    /// See [`ring_characteristics`].
    Ring { products: usize, seed: u64 },
}

impl Economy {
    /// Generates the characteristics.
    pub fn characteristics(&self) -> Result<ProductCharacteristics> {
        match self {
            Self::Simulated {
                products,
                characteristics,
                sigma,
                seed,
            } => simulate_characteristics(*products, *characteristics, sigma, *seed),
            Self::Ring { products, seed } => ring_characteristics(*products, *seed),
        }
    }
}

/// What an experiment plan computes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "experiment", rename_all = "snake_case")]
pub enum Design {
    /// [`ccp_inversion`] of fixed probabilities.
    Ccp {
        probabilities: Vec<f64>,
        outside_good: bool,
        estimator: EstimatorConfig,
    },
    /// [`round_trip`] through a reference and an approximating estimator.
    RoundTrip {
        economy: Economy,
        reference: EstimatorConfig,
        approximation: EstimatorConfig,
        criterion: Criterion,
    },
}

/// A named, fully configured experiment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentPlan {
    pub name: String,
    pub design: Design,
    pub options: ExperimentOptions,
}

impl ExperimentPlan {
    /// Logit CCP inversion with one million simulated Gumbel shocks.
    pub fn ccp_logit() -> Self {
        Self {
            name: "ccp inversion, simulated logit surplus".to_string(),
            design: Design::Ccp {
                probabilities: vec![0.30, 0.25, 0.20, 0.15, 0.10],
                outside_good: false,
                estimator: EstimatorConfig::monte_carlo(ShockDistribution::Gumbel, 1_000_000, 1),
            },
            options: ExperimentOptions {
                solver: SolverOptions::nelder_mead()
                    .with_cost_tolerance(1e-10)
                    .with_time_limit(Some(120.0)),
                restarts: 2,
            },
        }
    }

    /// Mixed logit round trip: order-50 quadrature truth, 10,000 simulated consumers.
    pub fn mixed_logit() -> Self {
        let sigma = vec![0.0, 0.5, 0.5, 0.0];
        let heterogeneity = Heterogeneity::MixedLogit {
            sigma: sigma.clone(),
        };
        Self {
            name: "mixed logit round trip".to_string(),
            design: Design::RoundTrip {
                economy: Economy::Simulated {
                    products: PRESET_PRODUCTS,
                    characteristics: PRESET_CHARACTERISTICS,
                    sigma,
                    seed: 2,
                },
                reference: EstimatorConfig::quadrature(PRESET_ORDER)
                    .with_heterogeneity(heterogeneity.clone())
                    .with_outside_good(true),
                approximation: EstimatorConfig::monte_carlo(
                    ShockDistribution::Normal,
                    PRESET_CONSUMERS,
                    3,
                )
                .with_heterogeneity(heterogeneity)
                .with_outside_good(true),
                criterion: Criterion::Linear,
            },
            options: ExperimentOptions {
                solver: SolverOptions::newton(),
                restarts: 1,
            },
        }
    }

    /// Pure characteristics round trip on the ring economy.
    pub fn pure_characteristics() -> Self {
        let heterogeneity = Heterogeneity::PureCharacteristics {
            sigma: vec![0.0, 0.0, 1.0, 1.0],
        };
        Self {
            name: "pure characteristics round trip".to_string(),
            design: Design::RoundTrip {
                economy: Economy::Ring {
                    products: PRESET_PRODUCTS,
                    seed: 4,
                },
                reference: EstimatorConfig::quadrature(PRESET_ORDER)
                    .with_heterogeneity(heterogeneity.clone())
                    .with_outside_good(true),
                approximation: EstimatorConfig::monte_carlo(
                    ShockDistribution::Normal,
                    PRESET_CONSUMERS,
                    5,
                )
                .with_heterogeneity(heterogeneity)
                .with_outside_good(true),
                criterion: Criterion::Linear,
            },
            options: ExperimentOptions {
                solver: SolverOptions {
                    simplex_step: 0.25,
                    ..SolverOptions::nelder_mead()
                },
                restarts: 2,
            },
        }
    }

    /// The three presets in publication order.
    pub fn presets() -> Vec<Self> {
        vec![
            Self::ccp_logit(),
            Self::mixed_logit(),
            Self::pure_characteristics(),
        ]
    }

    /// Builds the estimators, runs the experiment and names the report.
    pub fn run(&self) -> Result<ExperimentReport> {
        log::info!("running experiment `{}`", self.name);
        let report = match &self.design {
            Design::Ccp {
                probabilities,
                outside_good,
                estimator,
            } => {
                let target =
                    TargetShares::from_slice(probabilities, OutsideGood::from_flag(*outside_good))?;
                let estimator = estimator.build(target.len(), None)?;
                ccp_inversion(&target, &estimator, &self.options)?
            }
            Design::RoundTrip {
                economy,
                reference,
                approximation,
                criterion,
            } => {
                let characteristics = economy.characteristics()?;
                let products = characteristics.product_count();
                let reference = reference.build(products, Some(&characteristics))?;
                let approximation = approximation.build(products, Some(&characteristics))?;
                log::debug!(
                    "reference {}, approximation {}",
                    reference.label(),
                    approximation.label()
                );
                round_trip(
                    &characteristics,
                    &reference,
                    &approximation,
                    *criterion,
                    &self.options,
                )?
            }
        };
        Ok(report.with_name(self.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::ShockSample;
    use crate::surplus::{LogitSurplus, MonteCarloSurplus};

    fn newton() -> ExperimentOptions {
        ExperimentOptions::default().with_solver(SolverOptions::newton())
    }

    #[test]
    fn ccp_inversion_with_closed_form_recovers_log_shares() {
        let target =
            TargetShares::from_slice(&[0.1, 0.2, 0.3, 0.4], OutsideGood::Excluded).unwrap();
        let estimator = LogitSurplus::new(4, false).unwrap();
        let report = ccp_inversion(&target, &estimator, &newton()).unwrap();

        assert_eq!(report.rows.len(), 4);
        assert!(report.summary.converged);
        assert_eq!(report.attempts, 1);
        assert!(report.max_residual < 1e-6, "{report}");
        assert!((report.rows[0].truth - (0.1f64.ln() - EULER_GAMMA)).abs() < 1e-12);
    }

    #[test]
    fn round_trip_through_identical_estimators_is_exact() {
        let characteristics = simulate_characteristics(4, 3, &[0.0, 0.0, 0.0], 9).unwrap();
        let estimator = LogitSurplus::new(4, true).unwrap();
        let report = round_trip(
            &characteristics,
            &estimator,
            &estimator,
            Criterion::Linear,
            &newton(),
        )
        .unwrap();
        assert!(report.max_residual < 1e-6, "{report}");
    }

    #[test]
    fn round_trip_without_outside_good_aligns_location() {
        let characteristics = simulate_characteristics(3, 2, &[0.0, 0.0], 21).unwrap();
        let estimator = LogitSurplus::new(3, false).unwrap();
        let report = round_trip(
            &characteristics,
            &estimator,
            &estimator,
            Criterion::Exponential,
            &newton(),
        )
        .unwrap();
        assert!(report.max_residual < 1e-6, "{report}");
    }

    #[test]
    fn restarts_continue_from_best_iterate() {
        let target = TargetShares::from_slice(&[0.5, 0.3, 0.2], OutsideGood::Excluded).unwrap();
        let estimator = MonteCarloSurplus::new(ShockSample::gumbel(3, 2_000, 8).unwrap(), false);
        let options = ExperimentOptions::default()
            .with_solver(SolverOptions::nelder_mead().with_max_iterations(3))
            .with_restarts(2);
        let report = ccp_inversion(&target, &estimator, &options).unwrap();
        assert!(!report.summary.converged);
        assert_eq!(report.attempts, 3);
    }

    #[test]
    fn mismatched_outside_goods_are_rejected() {
        let characteristics = simulate_characteristics(3, 2, &[0.0, 0.0], 1).unwrap();
        let with_outside = LogitSurplus::new(3, true).unwrap();
        let without_outside = LogitSurplus::new(3, false).unwrap();
        let result = round_trip(
            &characteristics,
            &with_outside,
            &without_outside,
            Criterion::Linear,
            &newton(),
        );
        assert!(matches!(
            result,
            Err(SurplusError::InvalidOption { option: "outside_good", .. })
        ));
    }

    #[test]
    fn exponential_criterion_with_outside_good_is_rejected() {
        let characteristics = simulate_characteristics(3, 2, &[0.0, 0.0], 9).unwrap();
        let estimator = LogitSurplus::new(3, true).unwrap();
        let result = round_trip(
            &characteristics,
            &estimator,
            &estimator,
            Criterion::Exponential,
            &newton(),
        );
        assert!(matches!(
            result,
            Err(SurplusError::InvalidOption { option: "criterion", .. })
        ));
    }

    #[test]
    fn ring_economy_gives_every_product_a_positive_share() {
        let characteristics = ring_characteristics(5, 4).unwrap();
        let config = EstimatorConfig::quadrature(20)
            .with_heterogeneity(Heterogeneity::PureCharacteristics {
                sigma: vec![0.0, 0.0, 1.0, 1.0],
            })
            .with_outside_good(true);
        let estimator = config.build(5, Some(&characteristics)).unwrap();
        let shares = estimator
            .choice_probabilities(&characteristics.mean_utilities())
            .unwrap();
        assert!(shares.iter().all(|share| *share > 0.0), "{shares}");
        assert!(shares.sum() < 1.0);
    }

    #[test]
    fn report_renders_table_and_serializes() {
        let target = TargetShares::from_slice(&[0.6, 0.4], OutsideGood::Excluded).unwrap();
        let estimator = LogitSurplus::new(2, false).unwrap();
        let report = ccp_inversion(&target, &estimator, &newton())
            .unwrap()
            .with_name("two goods");

        let table = report.to_string();
        assert!(table.starts_with("== two goods =="));
        assert!(table.contains("recovered"));
        assert_eq!(table.lines().count(), 5);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["rows"].as_array().map(Vec::len), Some(2));
        assert_eq!(json["attempts"], 1);
    }
}
