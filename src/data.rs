//! Target probabilities and product characteristics used by the inversion experiments.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SurplusError};

/// Slack tolerated when checking that probabilities do not exceed one.
const SHARE_SUM_SLACK: f64 = 1e-8;

/// Whether the choice set contains an outside option with utility normalized to zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutsideGood {
    /// All alternatives are inside goods and probabilities may sum to one.
    #[default]
    Excluded,
    /// An outside option absorbs `1 - sum_j p_j` of the mass.
    Included,
}

impl OutsideGood {
    /// Converts the boolean flag used by estimator configurations.
    pub fn from_flag(included: bool) -> Self {
        if included {
            Self::Included
        } else {
            Self::Excluded
        }
    }

    /// Returns `true` for [`OutsideGood::Included`].
    pub fn is_included(self) -> bool {
        self == Self::Included
    }
}

/// Observed choice probabilities (or market shares) that the inversion tries to match.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "RawTargetShares")]
pub struct TargetShares {
    probabilities: DVector<f64>,
    outside_good: OutsideGood,
}

#[derive(Deserialize)]
struct RawTargetShares {
    probabilities: DVector<f64>,
    #[serde(default)]
    outside_good: OutsideGood,
}

impl TryFrom<RawTargetShares> for TargetShares {
    type Error = SurplusError;

    fn try_from(raw: RawTargetShares) -> Result<Self> {
        Self::new(raw.probabilities, raw.outside_good)
    }
}

impl TargetShares {
    /// Validates strictly positive, finite probabilities under the given outside-good convention.
    pub fn new(probabilities: DVector<f64>, outside_good: OutsideGood) -> Result<Self> {
        if probabilities.is_empty() {
            return Err(SurplusError::dimension_mismatch("target probabilities", 1, 0));
        }
        for (index, share) in probabilities.iter().enumerate() {
            if !share.is_finite() {
                return Err(SurplusError::degenerate("share validation", *share));
            }
            if *share <= 0.0 {
                return Err(SurplusError::NonPositiveShare {
                    index,
                    share: *share,
                });
            }
        }

        let total: f64 = probabilities.iter().sum();
        match outside_good {
            OutsideGood::Included => {
                let share = 1.0 - total;
                if share <= 0.0 {
                    return Err(SurplusError::NonPositiveOutsideShare { share });
                }
            }
            OutsideGood::Excluded => {
                if total > 1.0 + SHARE_SUM_SLACK {
                    return Err(SurplusError::SharesExceedOne { total });
                }
            }
        }

        Ok(Self {
            probabilities,
            outside_good,
        })
    }

    /// Convenience constructor from a slice.
    pub fn from_slice(values: &[f64], outside_good: OutsideGood) -> Result<Self> {
        Self::new(DVector::from_column_slice(values), outside_good)
    }

    /// Number of inside alternatives.
    pub fn len(&self) -> usize {
        self.probabilities.len()
    }

    /// Always `false` for a validated target; provided for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.probabilities.is_empty()
    }

    /// Returns a read-only view of the probabilities.
    pub fn probabilities(&self) -> &DVector<f64> {
        &self.probabilities
    }

    /// Outside-good convention the probabilities were validated against.
    pub fn outside_good(&self) -> OutsideGood {
        self.outside_good
    }

    /// Share of the outside option, `1 - sum_j p_j` (zero or slack when excluded).
    pub fn outside_share(&self) -> f64 {
        1.0 - self.probabilities.sum()
    }

    /// Closed-form inversion for standard type-one extreme value shocks.
    ///
    /// Without an outside good this is the minimizer of the exponential
    /// criterion, `log(p) - gamma`; with one it is the log share ratio
    /// `log(p_j / p_0)` that zeroes the linear criterion.
    pub fn logit_utilities(&self) -> DVector<f64> {
        match self.outside_good {
            OutsideGood::Excluded => self
                .probabilities
                .map(|p| p.ln() - crate::surplus::EULER_GAMMA),
            OutsideGood::Included => {
                let outside = self.outside_share();
                self.probabilities.map(|p| (p / outside).ln())
            }
        }
    }
}

/// Characteristics matrix `Z` (M x J), linear tastes `beta` and random-coefficient scales `sigma`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "RawProductCharacteristics")]
pub struct ProductCharacteristics {
    z: DMatrix<f64>,
    beta: DVector<f64>,
    sigma: DVector<f64>,
}

#[derive(Deserialize)]
struct RawProductCharacteristics {
    z: DMatrix<f64>,
    beta: DVector<f64>,
    sigma: Option<DVector<f64>>,
}

impl TryFrom<RawProductCharacteristics> for ProductCharacteristics {
    type Error = SurplusError;

    fn try_from(raw: RawProductCharacteristics) -> Result<Self> {
        let builder = ProductCharacteristicsBuilder::new(raw.z).beta(raw.beta);
        match raw.sigma {
            Some(sigma) => builder.sigma(sigma).build(),
            None => builder.build(),
        }
    }
}

impl ProductCharacteristics {
    /// Number of products `J`.
    pub fn product_count(&self) -> usize {
        self.z.ncols()
    }

    /// Number of characteristics `M`.
    pub fn characteristic_count(&self) -> usize {
        self.z.nrows()
    }

    /// Returns the characteristics matrix (rows are characteristics, columns products).
    pub fn z(&self) -> &DMatrix<f64> {
        &self.z
    }

    /// Returns the linear taste coefficients.
    pub fn beta(&self) -> &DVector<f64> {
        &self.beta
    }

    /// Returns the random-coefficient scales; zero marks a fixed coefficient.
    pub fn sigma(&self) -> &DVector<f64> {
        &self.sigma
    }

    /// Mean utilities `x = Z' beta`.
    pub fn mean_utilities(&self) -> DVector<f64> {
        self.z.tr_mul(&self.beta)
    }

    /// Number of characteristics carrying a random coefficient.
    pub fn random_dimension(&self) -> usize {
        self.sigma.iter().filter(|s| **s != 0.0).count()
    }

    /// Loadings (J x D) of the random coefficients: columns of `Z'` with `sigma_d != 0`, scaled by `sigma_d`.
    pub fn random_loadings(&self) -> DMatrix<f64> {
        let active: Vec<usize> = (0..self.sigma.len())
            .filter(|d| self.sigma[*d] != 0.0)
            .collect();
        let products = self.product_count();
        DMatrix::from_fn(products, active.len(), |j, column| {
            let d = active[column];
            self.z[(d, j)] * self.sigma[d]
        })
    }
}

/// Builder that validates dimensions before constructing [`ProductCharacteristics`].
#[derive(Debug)]
pub struct ProductCharacteristicsBuilder {
    z: DMatrix<f64>,
    beta: Option<DVector<f64>>,
    sigma: Option<DVector<f64>>,
}

impl ProductCharacteristicsBuilder {
    /// Start from the characteristics matrix `Z` (M x J).
    pub fn new(z: DMatrix<f64>) -> Self {
        Self {
            z,
            beta: None,
            sigma: None,
        }
    }

    /// Sets the linear taste coefficients `beta` (length M).
    pub fn beta(mut self, beta: DVector<f64>) -> Self {
        self.beta = Some(beta);
        self
    }

    /// Sets the random-coefficient scales `sigma` (length M).
    pub fn sigma(mut self, sigma: DVector<f64>) -> Self {
        self.sigma = Some(sigma);
        self
    }

    /// Finalizes construction after validating shapes and finiteness.
    pub fn build(self) -> Result<ProductCharacteristics> {
        let m = self.z.nrows();
        if self.z.ncols() == 0 {
            return Err(SurplusError::dimension_mismatch("Z columns", 1, 0));
        }

        let beta = self
            .beta
            .ok_or_else(|| SurplusError::dimension_mismatch("beta", m, 0))?;
        if beta.len() != m {
            return Err(SurplusError::dimension_mismatch("beta length", m, beta.len()));
        }

        let sigma = self.sigma.unwrap_or_else(|| DVector::zeros(m));
        if sigma.len() != m {
            return Err(SurplusError::dimension_mismatch(
                "sigma length",
                m,
                sigma.len(),
            ));
        }

        for value in self.z.iter().chain(beta.iter()).chain(sigma.iter()) {
            if !value.is_finite() {
                return Err(SurplusError::degenerate("characteristics validation", *value));
            }
        }

        Ok(ProductCharacteristics {
            z: self.z,
            beta,
            sigma,
        })
    }
}
