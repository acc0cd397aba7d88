//! Loss and gradient kernel, plus the inverse maps used for imputation.
//!
//! `u` is always the reconstructed value (an entry of X·Y) and `a` the
//! observed value. Numeric losses are scalar; categorical losses take the
//! full length-cardinality slice of X·Y for the column's block and the true
//! category index.
//!
//! Boolean columns are coded {0,1} rather than the conventional {-1,1}, so
//! the Hinge and Logistic formulas branch on `a == 0` to emulate the
//! {-1,1}-coded losses without recoding the data.
//!
//! Loss/column mismatches, out-of-range category indices, and negative
//! Poisson targets are configuration bugs, not runtime conditions; they fail
//! with an assertion rather than a recoverable error.

use crate::model::LossFunction;
use ndarray::{Array1, ArrayView1};
use std::f64::consts::PI;

/// L(u, a) for a numeric column.
///
/// `period` is only read by [`LossFunction::Periodic`] and must be positive.
pub fn loss(u: f64, a: f64, loss: LossFunction, period: usize) -> f64 {
    assert!(loss.is_for_numeric(), "loss function {loss:?} not applicable to numerics");
    match loss {
        LossFunction::Quadratic => (u - a) * (u - a),
        LossFunction::Absolute => (u - a).abs(),
        LossFunction::Huber => {
            let r = u - a;
            if r.abs() <= 1.0 { 0.5 * r * r } else { r.abs() - 0.5 }
        }
        LossFunction::Poisson => {
            assert!(a >= 0.0, "Poisson loss L(u,a) requires a >= 0");
            // lim_{a->0} a*ln(a) = 0
            f64::exp(u) + if a == 0.0 { 0.0 } else { -a * u + a * a.ln() - a }
        }
        LossFunction::Periodic => {
            assert!(period > 0, "period must be a positive integer");
            1.0 - f64::cos((a - u) * (2.0 * PI) / period as f64)
        }
        LossFunction::Hinge => f64::max(1.0 - if a == 0.0 { -u } else { u }, 0.0),
        LossFunction::Logistic => f64::ln_1p(f64::exp(if a == 0.0 { u } else { -u })),
        LossFunction::Categorical | LossFunction::Ordinal => unreachable!(),
    }
}

/// ∂L(u, a)/∂u for a numeric column.
pub fn lgrad(u: f64, a: f64, loss: LossFunction, period: usize) -> f64 {
    assert!(loss.is_for_numeric(), "loss function {loss:?} not applicable to numerics");
    match loss {
        LossFunction::Quadratic => 2.0 * (u - a),
        LossFunction::Absolute => (u - a).signum(),
        LossFunction::Huber => {
            let r = u - a;
            if r.abs() <= 1.0 { r } else { r.signum() }
        }
        LossFunction::Poisson => {
            assert!(a >= 0.0, "Poisson loss L(u,a) requires a >= 0");
            f64::exp(u) - a
        }
        LossFunction::Periodic => {
            assert!(period > 0, "period must be a positive integer");
            let w = 2.0 * PI / period as f64;
            w * f64::sin((a - u) * w)
        }
        LossFunction::Hinge => {
            if a == 0.0 {
                if -u <= 1.0 { 1.0 } else { 0.0 }
            } else if u <= 1.0 {
                -1.0
            } else {
                0.0
            }
        }
        LossFunction::Logistic => {
            if a == 0.0 { 1.0 / (1.0 + f64::exp(-u)) } else { -1.0 / (1.0 + f64::exp(u)) }
        }
        LossFunction::Categorical | LossFunction::Ordinal => unreachable!(),
    }
}

fn offset_or_zero(offset: Option<ArrayView1<'_, f64>>, len: usize) -> Array1<f64> {
    match offset {
        Some(o) => {
            assert_eq!(o.len(), len, "offset length {} != block length {len}", o.len());
            o.to_owned()
        }
        None => Array1::zeros(len),
    }
}

/// L(u, a) for a categorical column: `u` is the length-cardinality block of
/// X·Y, `a` the true category index. `offset` defaults to the zero vector.
pub fn mloss(
    u: ArrayView1<'_, f64>,
    a: usize,
    multi_loss: LossFunction,
    offset: Option<ArrayView1<'_, f64>>,
) -> f64 {
    assert!(
        multi_loss.is_for_categorical(),
        "loss function {multi_loss:?} not applicable to categoricals"
    );
    assert!(a < u.len(), "category index {a} out of range 0..{}", u.len());

    let off = offset_or_zero(offset, u.len());
    match multi_loss {
        LossFunction::Categorical => {
            // Multiclass hinge: every wrong category pays its positive
            // margin, the true category pays the reversed margin instead.
            let mut sum = 0.0;
            for i in 0..u.len() {
                sum += f64::max(1.0 + u[i] + off[i], 0.0);
            }
            sum + f64::max(1.0 - u[a] - off[a], 0.0) - f64::max(1.0 + u[a] + off[a], 0.0)
        }
        LossFunction::Ordinal => {
            // Threshold losses; thresholds at or above the true category
            // contribute a fixed unit cost.
            let mut sum = 0.0;
            for i in 0..u.len() - 1 {
                sum += f64::max(if a > i { 1.0 - u[i] - off[i] } else { 1.0 }, 0.0);
            }
            sum
        }
        _ => unreachable!(),
    }
}

/// ∂L(u, a)/∂u for a categorical column.
pub fn mlgrad(
    u: ArrayView1<'_, f64>,
    a: usize,
    multi_loss: LossFunction,
    offset: Option<ArrayView1<'_, f64>>,
) -> Array1<f64> {
    assert!(
        multi_loss.is_for_categorical(),
        "loss function {multi_loss:?} not applicable to categoricals"
    );
    assert!(a < u.len(), "category index {a} out of range 0..{}", u.len());

    let off = offset_or_zero(offset, u.len());
    let mut grad = Array1::zeros(u.len());
    match multi_loss {
        LossFunction::Categorical => {
            for i in 0..u.len() {
                grad[i] = if 1.0 + u[i] + off[i] > 0.0 { 1.0 } else { 0.0 };
            }
            grad[a] = if 1.0 - u[a] - off[a] > 0.0 { -1.0 } else { 0.0 };
            grad
        }
        LossFunction::Ordinal => {
            for i in 0..u.len() - 1 {
                grad[i] = if a > i && 1.0 - u[i] - off[i] > 0.0 { -1.0 } else { 0.0 };
            }
            grad
        }
        _ => unreachable!(),
    }
}

/// Decodes a reconstructed numeric value into the column's domain:
/// argmin_a L(u, a).
///
/// Poisson counts must be non-negative integers, so the decoder rounds
/// `exp(u)`; `f64::round` (half away from zero) is used, which on the
/// strictly positive values `exp` produces coincides with round-half-up.
pub fn impute(u: f64, loss: LossFunction) -> f64 {
    assert!(loss.is_for_numeric(), "loss function {loss:?} not applicable to numerics");
    match loss {
        LossFunction::Quadratic
        | LossFunction::Absolute
        | LossFunction::Huber
        | LossFunction::Periodic => u,
        LossFunction::Poisson => f64::exp(u).round(),
        LossFunction::Hinge | LossFunction::Logistic => {
            if u > 0.0 { 1.0 } else { 0.0 }
        }
        LossFunction::Categorical | LossFunction::Ordinal => unreachable!(),
    }
}

/// Decodes a reconstructed categorical block into a category index:
/// argmin_a L(u, a).
pub fn mimpute(
    u: ArrayView1<'_, f64>,
    multi_loss: LossFunction,
    offset: Option<ArrayView1<'_, f64>>,
) -> usize {
    assert!(
        multi_loss.is_for_categorical(),
        "loss function {multi_loss:?} not applicable to categoricals"
    );
    match multi_loss {
        LossFunction::Categorical => max_index(u),
        LossFunction::Ordinal => {
            let mut best = 0;
            let mut best_loss = f64::INFINITY;
            for a in 0..u.len() {
                let cand = mloss(u, a, multi_loss, offset);
                if cand < best_loss {
                    best = a;
                    best_loss = cand;
                }
            }
            best
        }
        _ => unreachable!(),
    }
}

/// Index of the largest entry; the first one on ties.
fn max_index(u: ArrayView1<'_, f64>) -> usize {
    let mut idx = 0;
    for i in 1..u.len() {
        if u[i] > u[idx] {
            idx = i;
        }
    }
    idx
}
