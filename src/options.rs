//! Estimator configuration: integration mode, shock distribution and heterogeneity.
//!
//! A configuration is a plain data description that can be read from JSON;
//! [`EstimatorConfig::build`] validates the combination and turns it into an
//! [`Estimator`].
//!
//! | heterogeneity          | `monte_carlo`                    | `quadrature`             | `closed_form` |
//! |------------------------|----------------------------------|--------------------------|---------------|
//! | `idiosyncratic`        | shock sample from `distribution` | not supported            | Gumbel only   |
//! | `mixed_logit`          | simulated consumers, logit kernel| Gauss–Hermite, logit     | not supported |
//! | `pure_characteristics` | projected coefficient draws      | Gauss–Hermite, max kernel| not supported |

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::data::{ProductCharacteristics, ProductCharacteristicsBuilder};
use crate::error::{Result, SurplusError};
use crate::integration::{toeplitz_correlation, IntegrationRule, ShockSample};
use crate::surplus::{
    Estimator, InnerExpectation, LogitSurplus, MonteCarloSurplus, QuadratureSurplus,
};

/// How the expectation over shocks or random coefficients is computed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationMode {
    /// Average over simulated draws.
    #[default]
    MonteCarlo,
    /// Weighted sum over Gauss–Hermite (or explicit) nodes.
    Quadrature,
    /// Exact logit formula.
    ClosedForm,
}

/// Distribution of the simulated shocks or coefficient draws.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShockDistribution {
    /// Standard type-one extreme value.
    #[default]
    Gumbel,
    /// Independent standard normal.
    Normal,
    /// Correlated normal; requires a correlation structure.
    MultivariateNormal,
}

/// Covariance of correlated normal shocks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorrelationStructure {
    /// `rho^|i - j|`.
    Toeplitz { rho: f64 },
    /// Explicit row-major covariance matrix.
    Covariance { matrix: Vec<Vec<f64>> },
}

impl CorrelationStructure {
    /// Materializes the covariance for `dimension` alternatives.
    pub fn covariance(&self, dimension: usize) -> Result<DMatrix<f64>> {
        match self {
            Self::Toeplitz { rho } => {
                if !rho.is_finite() || rho.abs() >= 1.0 {
                    return Err(SurplusError::invalid_option(
                        "correlation",
                        format!("Toeplitz rho must lie in (-1, 1), found {rho}"),
                    ));
                }
                Ok(toeplitz_correlation(dimension, *rho))
            }
            Self::Covariance { matrix } => {
                if matrix.len() != dimension {
                    return Err(SurplusError::dimension_mismatch(
                        "covariance rows",
                        dimension,
                        matrix.len(),
                    ));
                }
                if let Some(row) = matrix.iter().find(|row| row.len() != dimension) {
                    return Err(SurplusError::dimension_mismatch(
                        "covariance columns",
                        dimension,
                        row.len(),
                    ));
                }
                Ok(DMatrix::from_fn(dimension, dimension, |i, j| matrix[i][j]))
            }
        }
    }
}

/// Where consumer heterogeneity comes from.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum Heterogeneity {
    /// Additive shocks on every alternative and nothing else.
    #[default]
    Idiosyncratic,
    /// Normal random coefficients with scales `sigma` plus logit errors.
    MixedLogit { sigma: Vec<f64> },
    /// Normal random coefficients with scales `sigma` and no additive error.
    PureCharacteristics { sigma: Vec<f64> },
}

/// Explicit one-dimensional rule overriding Gauss–Hermite.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodesWeights {
    pub nodes: Vec<f64>,
    pub weights: Vec<f64>,
}

/// Recognized estimator options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Integration mode.
    pub mode: IntegrationMode,
    /// Distribution of simulated shocks; random coefficients are always normal.
    pub distribution: ShockDistribution,
    /// Number of simulated draws `S` (Monte Carlo only).
    pub draws: usize,
    /// Gauss–Hermite order per random coefficient (quadrature only).
    pub order: usize,
    /// Explicit nodes and weights (quadrature only, one random coefficient).
    pub nodes_weights: Option<NodesWeights>,
    /// Seed of the pseudo-random generator.
    pub seed: u64,
    /// Correlation of multivariate normal shocks.
    pub correlation: Option<CorrelationStructure>,
    /// Source of consumer heterogeneity.
    pub heterogeneity: Heterogeneity,
    /// Whether a zero-utility outside good competes with the inside alternatives.
    pub outside_good: bool,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            mode: IntegrationMode::MonteCarlo,
            distribution: ShockDistribution::Gumbel,
            draws: 100_000,
            order: 20,
            nodes_weights: None,
            seed: 0,
            correlation: None,
            heterogeneity: Heterogeneity::Idiosyncratic,
            outside_good: false,
        }
    }
}

impl EstimatorConfig {
    /// Monte Carlo integration with `draws` simulated draws.
    pub fn monte_carlo(distribution: ShockDistribution, draws: usize, seed: u64) -> Self {
        Self {
            mode: IntegrationMode::MonteCarlo,
            distribution,
            draws,
            seed,
            ..Self::default()
        }
    }

    /// Gauss–Hermite quadrature of the given order over the random coefficients.
    pub fn quadrature(order: usize) -> Self {
        Self {
            mode: IntegrationMode::Quadrature,
            distribution: ShockDistribution::Normal,
            order,
            ..Self::default()
        }
    }

    /// Exact logit surplus.
    pub fn closed_form() -> Self {
        Self {
            mode: IntegrationMode::ClosedForm,
            distribution: ShockDistribution::Gumbel,
            ..Self::default()
        }
    }

    /// Override the heterogeneity model.
    pub fn with_heterogeneity(mut self, heterogeneity: Heterogeneity) -> Self {
        self.heterogeneity = heterogeneity;
        self
    }

    /// Include or exclude the outside good.
    pub fn with_outside_good(mut self, outside_good: bool) -> Self {
        self.outside_good = outside_good;
        self
    }

    /// Set the correlation of multivariate normal shocks.
    pub fn with_correlation(mut self, correlation: CorrelationStructure) -> Self {
        self.correlation = Some(correlation);
        self
    }

    /// Replace the Gauss–Hermite rule by explicit nodes and weights.
    pub fn with_nodes_weights(mut self, nodes: Vec<f64>, weights: Vec<f64>) -> Self {
        self.nodes_weights = Some(NodesWeights { nodes, weights });
        self
    }

    /// Validates the configuration and builds the estimator.
    ///
    /// `characteristics` is required by the random-coefficient models; its
    /// `Z` supplies the loadings and the `sigma` carried by the heterogeneity
    /// variant overrides the one stored in the characteristics.
    pub fn build(
        &self,
        alternatives: usize,
        characteristics: Option<&ProductCharacteristics>,
    ) -> Result<Estimator> {
        if alternatives == 0 {
            return Err(SurplusError::dimension_mismatch("alternatives", 1, 0));
        }
        log::debug!(
            "building {:?} estimator for {} alternatives ({:?})",
            self.mode,
            alternatives,
            self.heterogeneity
        );

        match (&self.heterogeneity, self.mode) {
            (Heterogeneity::Idiosyncratic, IntegrationMode::ClosedForm) => {
                if self.distribution != ShockDistribution::Gumbel {
                    return Err(SurplusError::invalid_option(
                        "distribution",
                        "the closed form exists for Gumbel shocks only",
                    ));
                }
                Ok(LogitSurplus::new(alternatives, self.outside_good)?.into())
            }
            (Heterogeneity::Idiosyncratic, IntegrationMode::MonteCarlo) => {
                let sample = self.shock_sample(alternatives)?;
                Ok(MonteCarloSurplus::new(sample, self.outside_good).into())
            }
            (Heterogeneity::Idiosyncratic, IntegrationMode::Quadrature) => {
                Err(SurplusError::invalid_option(
                    "mode",
                    "idiosyncratic shocks are integrated in closed form or by simulation",
                ))
            }
            (_, IntegrationMode::ClosedForm) => Err(SurplusError::invalid_option(
                "mode",
                "random coefficients have no closed-form surplus",
            )),
            (Heterogeneity::MixedLogit { sigma }, mode) => {
                let loadings = self.loadings(alternatives, characteristics, sigma)?;
                let rule = self.rule(mode, loadings.ncols())?;
                Ok(QuadratureSurplus::new(
                    &rule,
                    &loadings,
                    InnerExpectation::Logit,
                    self.outside_good,
                )?
                .into())
            }
            (Heterogeneity::PureCharacteristics { sigma }, IntegrationMode::MonteCarlo) => {
                let loadings = self.loadings(alternatives, characteristics, sigma)?;
                self.require_draws()?;
                let sample = ShockSample::random_coefficients(&loadings, self.draws, self.seed)?;
                Ok(MonteCarloSurplus::new(sample, self.outside_good).into())
            }
            (Heterogeneity::PureCharacteristics { sigma }, IntegrationMode::Quadrature) => {
                let loadings = self.loadings(alternatives, characteristics, sigma)?;
                let rule = self.rule(IntegrationMode::Quadrature, loadings.ncols())?;
                Ok(QuadratureSurplus::new(
                    &rule,
                    &loadings,
                    InnerExpectation::Maximum,
                    self.outside_good,
                )?
                .into())
            }
        }
    }

    fn require_draws(&self) -> Result<()> {
        if self.draws == 0 {
            return Err(SurplusError::EmptySample {
                context: "Monte Carlo configuration",
            });
        }
        Ok(())
    }

    fn shock_sample(&self, alternatives: usize) -> Result<ShockSample> {
        self.require_draws()?;
        match self.distribution {
            ShockDistribution::Gumbel => ShockSample::gumbel(alternatives, self.draws, self.seed),
            ShockDistribution::Normal => {
                ShockSample::standard_normal(alternatives, self.draws, self.seed)
            }
            ShockDistribution::MultivariateNormal => {
                let correlation = self.correlation.as_ref().ok_or_else(|| {
                    SurplusError::invalid_option(
                        "correlation",
                        "multivariate normal shocks need a correlation structure",
                    )
                })?;
                let covariance = correlation.covariance(alternatives)?;
                ShockSample::multivariate_normal(&covariance, self.draws, self.seed)
            }
        }
    }

    fn loadings(
        &self,
        alternatives: usize,
        characteristics: Option<&ProductCharacteristics>,
        sigma: &[f64],
    ) -> Result<DMatrix<f64>> {
        let characteristics = characteristics.ok_or_else(|| {
            SurplusError::invalid_option(
                "heterogeneity",
                "random coefficients need product characteristics",
            )
        })?;
        if characteristics.product_count() != alternatives {
            return Err(SurplusError::dimension_mismatch(
                "characteristics products",
                alternatives,
                characteristics.product_count(),
            ));
        }
        if sigma.len() != characteristics.characteristic_count() {
            return Err(SurplusError::dimension_mismatch(
                "sigma length",
                characteristics.characteristic_count(),
                sigma.len(),
            ));
        }

        let scaled = ProductCharacteristicsBuilder::new(characteristics.z().clone())
            .beta(characteristics.beta().clone())
            .sigma(DVector::from_column_slice(sigma))
            .build()?;
        Ok(scaled.random_loadings())
    }

    fn rule(&self, mode: IntegrationMode, dimension: usize) -> Result<IntegrationRule> {
        match mode {
            IntegrationMode::MonteCarlo => {
                self.require_draws()?;
                IntegrationRule::standard_normal(self.draws, dimension, self.seed)
            }
            _ => match &self.nodes_weights {
                Some(explicit) => {
                    if dimension != 1 {
                        return Err(SurplusError::dimension_mismatch(
                            "explicit rule dimension",
                            1,
                            dimension,
                        ));
                    }
                    IntegrationRule::from_nodes_weights(&explicit.nodes, &explicit.weights)
                }
                None => IntegrationRule::gauss_hermite(self.order, dimension),
            },
        }
    }
}
