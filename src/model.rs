//! Model parameters and the closed variant vocabulary of the kernel.
//!
//! Everything dispatch-driven in this crate (loss, gradient, penalty, prox,
//! projection, imputation, offset, scale) matches exhaustively on
//! [`LossFunction`] or [`Regularizer`]; adding a variant forces every
//! dispatch site to be revisited at compile time.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Convergence tolerance for the proximal-refinement outer loop in the
/// calibration solver (∞-norm change between consecutive iterates).
pub const TOLERANCE: f64 = 1e-6;

/// Gradient-norm tolerance handed to the quasi-Newton minimizer.
pub const GRAD_TOLERANCE: f64 = 1e-8;

/// Per-column loss function.
///
/// Quadratic corresponds to a Gaussian error model ~ exp(-(a-u)²), Absolute
/// to a Laplace model ~ exp(-|a-u|). Hinge and Logistic operate on boolean
/// columns coded {0,1} rather than the conventional {-1,1}; the formulas in
/// [`crate::loss`] flip sign on the observed value instead of recoding data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossFunction {
    // One-dimensional losses for numeric columns.
    Quadratic,
    Absolute,
    Huber,
    Poisson,
    Periodic,
    // Boolean losses ({0,1}-coded numeric columns).
    Logistic,
    Hinge,
    // Multi-dimensional losses for categorical columns.
    Categorical,
    Ordinal,
}

impl LossFunction {
    /// True if this loss applies to a numeric (scalar) column.
    pub fn is_for_numeric(self) -> bool {
        !matches!(self, LossFunction::Categorical | LossFunction::Ordinal)
    }

    /// True if this loss applies to a categorical column (vector-valued).
    pub fn is_for_categorical(self) -> bool {
        !self.is_for_numeric()
    }

    /// True if this loss expects a boolean column coded {0,1}.
    pub fn is_for_binary(self) -> bool {
        matches!(self, LossFunction::Logistic | LossFunction::Hinge)
    }
}

/// Regularization penalty applied per row of X or per column of Y.
///
/// The hard-constraint variants define a feasible set rather than a smooth
/// cost: NonNegative is the non-negative orthant, OneSparse vectors have
/// exactly one positive entry, UnitOneSparse vectors are one-hot, Simplex
/// vectors are non-negative and sum to one. Common pairings: NNMF is
/// NonNegative on both factors, k-means is UnitOneSparse on X with the Y
/// weight zeroed, quadratic mixtures are Simplex on X.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regularizer {
    None,
    Quadratic,
    L2,
    L1,
    NonNegative,
    OneSparse,
    UnitOneSparse,
    Simplex,
}

/// Semantic type of a model column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Numeric,
    Categorical,
}

/// Descriptor for one column of the (externally owned) training table.
///
/// `cardinality` is the number of category levels and is only meaningful for
/// categorical columns; `period` is only read by the Periodic loss and must
/// be a positive integer there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub index: usize,
    pub kind: ColumnKind,
    pub loss: LossFunction,
    pub cardinality: usize,
    pub period: usize,
}

impl ColumnSpec {
    pub fn numeric(index: usize, loss: LossFunction) -> Self {
        assert!(
            loss.is_for_numeric(),
            "loss function {loss:?} not applicable to numeric column {index}"
        );
        ColumnSpec { index, kind: ColumnKind::Numeric, loss, cardinality: 0, period: 1 }
    }

    pub fn categorical(index: usize, loss: LossFunction, cardinality: usize) -> Self {
        assert!(
            loss.is_for_categorical(),
            "loss function {loss:?} not applicable to categorical column {index}"
        );
        ColumnSpec { index, kind: ColumnKind::Categorical, loss, cardinality, period: 1 }
    }

    pub fn with_period(mut self, period: usize) -> Self {
        self.period = period;
        self
    }
}

/// Configuration surface of the kernel, as resolved by the training driver.
///
/// Defaults: rank 1, quadratic / categorical losses, offset and scale
/// disabled, unregularized factors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlrmParameters {
    /// Rank of the XY factorization.
    pub k: usize,
    /// Default loss for numeric columns.
    pub loss: LossFunction,
    /// Default loss for categorical columns.
    pub multi_loss: LossFunction,
    /// Period length for the Periodic loss (positive integer).
    pub period: usize,
    /// Include per-column offset terms in the loss?
    pub offset: bool,
    /// Scale each column's loss by its generalized inverse variance?
    pub scale: bool,
    pub regularization_x: Regularizer,
    pub regularization_y: Regularizer,
    /// Regularization weight on X.
    pub gamma_x: f64,
    /// Regularization weight on Y.
    pub gamma_y: f64,
    /// Weight of the quadratic proximal penalty in the calibration
    /// refinement loop.
    pub rho: f64,
    pub max_iterations: usize,
    /// Initial step size for the driver's alternating updates (decreased
    /// until `min_step_size`).
    pub init_step_size: f64,
    pub min_step_size: f64,
    /// Seed for the tie-break RNG used by the sparse proximal operators.
    pub seed: u64,
}

impl Default for GlrmParameters {
    fn default() -> Self {
        GlrmParameters {
            k: 1,
            loss: LossFunction::Quadratic,
            multi_loss: LossFunction::Categorical,
            period: 1,
            offset: false,
            scale: false,
            regularization_x: Regularizer::None,
            regularization_y: Regularizer::None,
            gamma_x: 0.0,
            gamma_y: 0.0,
            rho: 1e-5,
            max_iterations: 1000,
            init_step_size: 1.0,
            min_step_size: 1e-4,
            seed: 0,
        }
    }
}

impl GlrmParameters {
    /// Whether the factorization admits a direct (SVD-style) solution: every
    /// column under quadratic loss, both regularizers absent or quadratic
    /// (or weighted zero), and no missing values. The driver uses this to
    /// skip alternating minimization entirely.
    pub fn has_closed_form(&self, losses: &[LossFunction], na_count: u64) -> bool {
        let loss_quad = losses.iter().all(|&l| l == LossFunction::Quadratic);
        let reg_x_ok = self.gamma_x == 0.0
            || matches!(self.regularization_x, Regularizer::None | Regularizer::Quadratic);
        let reg_y_ok = self.gamma_y == 0.0
            || matches!(self.regularization_y, Regularizer::None | Regularizer::Quadratic);
        na_count == 0 && loss_quad && reg_x_ok && reg_y_ok
    }
}

/// Calibration output for one column: the offset (generalized mean, one
/// entry for numeric columns, one per category level for categoricals), the
/// scale (generalized inverse variance), and solver diagnostics.
///
/// Instances are always fully populated. When offset or scale computation is
/// disabled the identity defaults (zero offset, unit scale) are used, so
/// downstream code never branches on missing calibration data.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnCalibration {
    pub offset: Array1<f64>,
    pub scale: f64,
    /// Iterations of the proximal-refinement loop (0 for closed forms and
    /// plain quasi-Newton solves).
    pub iterations: usize,
    /// Final ∞-norm change between refinement iterates (0 when the loop did
    /// not run).
    pub delta: f64,
}

impl ColumnCalibration {
    /// Identity calibration for a numeric column: offset 0, scale 1.
    pub fn identity_numeric() -> Self {
        ColumnCalibration { offset: Array1::zeros(1), scale: 1.0, iterations: 0, delta: 0.0 }
    }

    /// Identity calibration for a categorical column of the given
    /// cardinality: zero logit vector, scale 1.
    pub fn identity_categorical(cardinality: usize) -> Self {
        ColumnCalibration {
            offset: Array1::zeros(cardinality),
            scale: 1.0,
            iterations: 0,
            delta: 0.0,
        }
    }
}
