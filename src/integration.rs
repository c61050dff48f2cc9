//! Shock samples and integration rules for approximating expected surplus.
//!
//! Two kinds of integration objects live here:
//!
//! - [`ShockSample`]: a `J x S` matrix of idiosyncratic shocks, one column per
//!   simulated draw, consumed by the Monte Carlo estimator;
//! - [`IntegrationRule`]: weighted nodes for the random coefficients, either a
//!   (tensorized) Gauss–Hermite rule or pseudo-Monte Carlo normal draws.
//!
//! Gauss–Hermite rules are rescaled to integrate against the standard normal
//! density, so the weights of every rule built here sum to one.

use nalgebra::{Cholesky, DMatrix, DVector, SymmetricEigen};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Gumbel, StandardNormal};

use crate::error::{Result, SurplusError};

/// Largest tolerated deviation of the weight sum from one.
const WEIGHT_SUM_SLACK: f64 = 1e-8;

/// Largest node count a rule may hold.
pub const MAX_RULE_NODES: usize = 1_000_000;

/// Weighted nodes approximating an expectation over standard normal random coefficients.
#[derive(Clone, Debug)]
pub struct IntegrationRule {
    nodes: DMatrix<f64>,
    weights: DVector<f64>,
}

impl IntegrationRule {
    /// Builds a rule from a node matrix (rows are nodes) and weights.
    ///
    /// Weights must be finite, non-negative and sum to one.
    pub fn new(nodes: DMatrix<f64>, weights: DVector<f64>) -> Result<Self> {
        if nodes.nrows() == 0 {
            return Err(SurplusError::EmptySample {
                context: "integration rule",
            });
        }
        if nodes.nrows() != weights.len() {
            return Err(SurplusError::dimension_mismatch(
                "node weight length",
                nodes.nrows(),
                weights.len(),
            ));
        }
        for weight in weights.iter() {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(SurplusError::InvalidWeights { slack: *weight });
            }
        }
        let sum: f64 = weights.iter().sum();
        let slack = (sum - 1.0).abs();
        if slack > WEIGHT_SUM_SLACK {
            return Err(SurplusError::InvalidWeights { slack });
        }
        if nodes.iter().any(|node| !node.is_finite()) {
            return Err(SurplusError::degenerate("integration nodes", f64::NAN));
        }

        Ok(Self { nodes, weights })
    }

    /// One-dimensional rule from explicit nodes and weights.
    pub fn from_nodes_weights(nodes: &[f64], weights: &[f64]) -> Result<Self> {
        let nodes = DMatrix::from_column_slice(nodes.len(), 1, nodes);
        Self::new(nodes, DVector::from_column_slice(weights))
    }

    /// Gauss–Hermite product rule of the given order in `dimension` dimensions.
    ///
    /// The rule integrates against the standard normal density: nodes are
    /// scaled by `sqrt(2)` and weights divided by `sqrt(pi)` per dimension.
    /// A zero-dimensional rule is the single empty node with unit weight.
    pub fn gauss_hermite(order: usize, dimension: usize) -> Result<Self> {
        let (nodes_1d, weights_1d) = gauss_hermite_normal(order)?;
        let count = u32::try_from(dimension)
            .ok()
            .and_then(|exponent| order.checked_pow(exponent))
            .filter(|count| *count <= MAX_RULE_NODES)
            .ok_or_else(|| {
                SurplusError::invalid_option(
                    "order",
                    format!(
                        "order {order} in {dimension} dimensions exceeds {MAX_RULE_NODES} nodes"
                    ),
                )
            })?;

        let mut nodes = DMatrix::zeros(count, dimension);
        let mut weights = DVector::from_element(count, 1.0);
        for index in 0..count {
            let mut remainder = index;
            for d in (0..dimension).rev() {
                let k = remainder % order;
                remainder /= order;
                nodes[(index, d)] = nodes_1d[k];
                weights[index] *= weights_1d[k];
            }
        }

        Self::new(nodes, weights)
    }

    /// Pseudo-Monte Carlo standard normal draws with uniform weights.
    pub fn standard_normal(draws: usize, dimension: usize, seed: u64) -> Result<Self> {
        if draws == 0 {
            return Err(SurplusError::EmptySample {
                context: "standard normal draws",
            });
        }
        let total = draws.checked_mul(dimension).ok_or_else(|| {
            SurplusError::invalid_option(
                "draws",
                format!("{draws} draws in {dimension} dimensions overflow"),
            )
        })?;
        let mut rng = SmallRng::seed_from_u64(seed);
        let values: Vec<f64> = (0..total)
            .map(|_| StandardNormal.sample(&mut rng))
            .collect();
        let matrix = DMatrix::from_vec(draws, dimension, values);
        let weights = DVector::from_element(draws, 1.0 / draws as f64);
        Self::new(matrix, weights)
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.nrows()
    }

    /// Dimension of the integrated random coefficients.
    pub fn dimension(&self) -> usize {
        self.nodes.ncols()
    }

    /// Returns the node matrix (rows are nodes).
    pub fn nodes(&self) -> &DMatrix<f64> {
        &self.nodes
    }

    /// Returns the integration weights (normalized to sum to one).
    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }
}

/// Gauss–Hermite nodes and weights for the standard normal density.
///
/// Computed with the Golub–Welsch algorithm: the nodes of the physicists'
/// rule are the eigenvalues of the symmetric Jacobi matrix with off-diagonal
/// entries `sqrt(k / 2)`, and each weight is `sqrt(pi)` times the squared
/// first component of the matching unit eigenvector. After the change of
/// variables the weights are the squared components themselves. Nodes are
/// returned in ascending order.
pub fn gauss_hermite_normal(order: usize) -> Result<(Vec<f64>, Vec<f64>)> {
    if order == 0 {
        return Err(SurplusError::EmptySample {
            context: "Gauss-Hermite rule",
        });
    }

    let mut jacobi = DMatrix::<f64>::zeros(order, order);
    for k in 1..order {
        let off = (k as f64 / 2.0).sqrt();
        jacobi[(k - 1, k)] = off;
        jacobi[(k, k - 1)] = off;
    }

    let eigen = SymmetricEigen::new(jacobi);
    let mut pairs: Vec<(f64, f64)> = (0..order)
        .map(|i| {
            let first = eigen.eigenvectors[(0, i)];
            (eigen.eigenvalues[i] * std::f64::consts::SQRT_2, first * first)
        })
        .collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    // Renormalize away the rounding left by the eigen-solver.
    let total: f64 = pairs.iter().map(|(_, w)| w).sum();
    let nodes = pairs.iter().map(|(x, _)| *x).collect();
    let weights = pairs.iter().map(|(_, w)| w / total).collect();
    Ok((nodes, weights))
}

/// Simulated idiosyncratic shocks: a `J x S` matrix with one column per draw.
#[derive(Clone, Debug)]
pub struct ShockSample {
    draws: DMatrix<f64>,
}

impl ShockSample {
    /// Wraps an existing `J x S` shock matrix.
    pub fn new(draws: DMatrix<f64>) -> Result<Self> {
        if draws.nrows() == 0 {
            return Err(SurplusError::dimension_mismatch("shock alternatives", 1, 0));
        }
        if draws.ncols() == 0 {
            return Err(SurplusError::EmptySample {
                context: "shock sample",
            });
        }
        Ok(Self { draws })
    }

    /// Independent standard type-one extreme value (Gumbel) shocks.
    pub fn gumbel(alternatives: usize, draws: usize, seed: u64) -> Result<Self> {
        let gumbel = Gumbel::new(0.0, 1.0)
            .map_err(|_| SurplusError::invalid_option("distribution", "invalid Gumbel scale"))?;
        let mut rng = SmallRng::seed_from_u64(seed);
        let values: Vec<f64> = (0..alternatives * draws)
            .map(|_| gumbel.sample(&mut rng))
            .collect();
        Self::new(DMatrix::from_vec(alternatives, draws, values))
    }

    /// Independent standard normal shocks.
    pub fn standard_normal(alternatives: usize, draws: usize, seed: u64) -> Result<Self> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let values: Vec<f64> = (0..alternatives * draws)
            .map(|_| StandardNormal.sample(&mut rng))
            .collect();
        Self::new(DMatrix::from_vec(alternatives, draws, values))
    }

    /// Correlated normal shocks `L z` where `L L' = covariance`.
    pub fn multivariate_normal(covariance: &DMatrix<f64>, draws: usize, seed: u64) -> Result<Self> {
        if !covariance.is_square() {
            return Err(SurplusError::dimension_mismatch(
                "covariance columns",
                covariance.nrows(),
                covariance.ncols(),
            ));
        }
        let factor = Cholesky::new(covariance.clone()).ok_or(SurplusError::NotPositiveDefinite {
            context: "shock covariance",
        })?;
        let independent = Self::standard_normal(covariance.nrows(), draws, seed)?;
        Self::new(factor.l() * independent.draws)
    }

    /// Shocks induced by normal random coefficients: `loadings * eta` with `eta ~ N(0, I)`.
    ///
    /// This is the pure characteristics model: consumer `s` values product
    /// `j` at `x_j + sum_d loadings[j, d] * eta[d, s]`, with no logit error.
    pub fn random_coefficients(loadings: &DMatrix<f64>, draws: usize, seed: u64) -> Result<Self> {
        if loadings.ncols() == 0 {
            return Err(SurplusError::invalid_option(
                "heterogeneity",
                "at least one random coefficient is required",
            ));
        }
        let coefficients = Self::standard_normal(loadings.ncols(), draws, seed)?;
        Self::new(loadings * coefficients.draws)
    }

    /// Number of alternatives `J`.
    pub fn alternatives(&self) -> usize {
        self.draws.nrows()
    }

    /// Number of simulated draws `S`.
    pub fn draw_count(&self) -> usize {
        self.draws.ncols()
    }

    /// Returns the shock matrix.
    pub fn draws(&self) -> &DMatrix<f64> {
        &self.draws
    }
}

/// Toeplitz correlation matrix with entries `rho^|i - j|`.
pub fn toeplitz_correlation(dimension: usize, rho: f64) -> DMatrix<f64> {
    DMatrix::from_fn(dimension, dimension, |i, j| rho.powi(i.abs_diff(j) as i32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn gauss_hermite_three_points_match_closed_form() {
        let (nodes, weights) = gauss_hermite_normal(3).unwrap();
        let root = 3f64.sqrt();
        assert_relative_eq!(nodes[0], -root, epsilon = 1e-12);
        assert_relative_eq!(nodes[1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(nodes[2], root, epsilon = 1e-12);
        assert_relative_eq!(weights[0], 1.0 / 6.0, epsilon = 1e-12);
        assert_relative_eq!(weights[1], 2.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(weights[2], 1.0 / 6.0, epsilon = 1e-12);
    }

    #[test]
    fn product_rule_integrates_normal_moments() {
        let rule = IntegrationRule::gauss_hermite(5, 2).unwrap();
        assert_eq!(rule.node_count(), 25);
        let mut fourth = 0.0;
        let mut cross = 0.0;
        for (row, weight) in rule.nodes().row_iter().zip(rule.weights().iter()) {
            fourth += weight * row[0].powi(4);
            cross += weight * (row[0] * row[1]).powi(2);
        }
        assert_relative_eq!(fourth, 3.0, epsilon = 1e-10);
        assert_relative_eq!(cross, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn fifty_point_rule_is_normalized() {
        let rule = IntegrationRule::gauss_hermite(50, 1).unwrap();
        let sum: f64 = rule.weights().iter().sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn oversized_product_rule_is_rejected() {
        assert!(matches!(
            IntegrationRule::gauss_hermite(50, 12),
            Err(SurplusError::InvalidOption { option: "order", .. })
        ));
        assert!(matches!(
            IntegrationRule::gauss_hermite(50, 4),
            Err(SurplusError::InvalidOption { option: "order", .. })
        ));
        assert_eq!(IntegrationRule::gauss_hermite(50, 3).unwrap().node_count(), 125_000);
    }

    #[test]
    fn rejects_negative_and_unnormalized_weights() {
        let negative = IntegrationRule::from_nodes_weights(&[-1.0, 1.0], &[1.5, -0.5]);
        assert!(matches!(negative, Err(SurplusError::InvalidWeights { .. })));
        let unnormalized = IntegrationRule::from_nodes_weights(&[-1.0, 1.0], &[0.5, 0.6]);
        assert!(matches!(unnormalized, Err(SurplusError::InvalidWeights { .. })));
        let empty = IntegrationRule::from_nodes_weights(&[], &[]);
        assert!(matches!(empty, Err(SurplusError::EmptySample { .. })));
    }

    #[test]
    fn empty_shock_sample_is_rejected() {
        assert!(matches!(
            ShockSample::gumbel(5, 0, 1),
            Err(SurplusError::EmptySample { .. })
        ));
    }

    #[test]
    fn correlated_shocks_reproduce_covariance() {
        let covariance = toeplitz_correlation(3, 0.5);
        let sample = ShockSample::multivariate_normal(&covariance, 100_000, 11).unwrap();
        let draws = sample.draws();
        let s = draws.ncols() as f64;
        let cov01 = draws.row(0).dot(&draws.row(1)) / s;
        let cov02 = draws.row(0).dot(&draws.row(2)) / s;
        assert_relative_eq!(cov01, 0.5, epsilon = 0.02);
        assert_relative_eq!(cov02, 0.25, epsilon = 0.02);
    }

    #[test]
    fn non_positive_definite_covariance_is_rejected() {
        let covariance = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(matches!(
            ShockSample::multivariate_normal(&covariance, 10, 1),
            Err(SurplusError::NotPositiveDefinite { .. })
        ));
    }
}
