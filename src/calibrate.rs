//! Per-column offset and scale calibration.
//!
//! Before factorization every column gets an offset (a generalized mean: the
//! minimizer of the column's summed loss over a constant prediction) and a
//! scale (a generalized inverse variance: the reciprocal of the per-row
//! average of that minimal loss). Standardizing with these makes columns
//! under different losses commensurable in the training objective.
//!
//! Offsets have closed forms for most numeric losses (mean, median, log of
//! the mean, majority class, circular mean). Where no closed form exists
//! (Logistic, Categorical, Ordinal) the summed loss is handed to a
//! quasi-Newton minimizer at gradient tolerance [`GRAD_TOLERANCE`];
//! categorical columns additionally run a fixed-point proximal-gradient
//! refinement that re-solves the objective augmented with a quadratic
//! penalty anchored at the previous iterate until the ∞-norm change falls
//! below [`TOLERANCE`].
//!
//! Columns are independent and calibrated in parallel on a bounded pool. A
//! failed quasi-Newton solve is not fatal: the best iterate found (or the
//! seed) is kept and a warning is logged.

use crate::data::DataColumn;
use crate::loss;
use crate::model::{
    ColumnCalibration, ColumnKind, ColumnSpec, GRAD_TOLERANCE, GlrmParameters, LossFunction,
    TOLERANCE,
};
use ndarray::{Array1, array};
use rayon::prelude::*;
use std::f64::consts::PI;
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Upper bound on the calibration worker pool, limiting contention on the
/// optimizer when tables are wide.
const NUM_PARALLEL_TASKS: usize = 10;

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("number of column specs ({specs}) does not match number of columns ({columns})")]
    SpecCountMismatch { specs: usize, columns: usize },

    #[error("failed to build the calibration thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Computes offset and scale for every column.
///
/// The returned vector always has one fully populated entry per column.
/// When a toggle is disabled the identity defaults are reported (zero
/// offset, unit scale), so downstream consumers never branch on missing
/// calibration data.
pub fn calibrate(
    columns: &[DataColumn],
    specs: &[ColumnSpec],
    params: &GlrmParameters,
) -> Result<Vec<ColumnCalibration>, CalibrationError> {
    if specs.len() != columns.len() {
        return Err(CalibrationError::SpecCountMismatch {
            specs: specs.len(),
            columns: columns.len(),
        });
    }
    if columns.is_empty() {
        return Ok(Vec::new());
    }
    if !params.offset && !params.scale {
        return Ok(specs.iter().map(identity_for).collect());
    }

    let workers = NUM_PARALLEL_TASKS.min(columns.len());
    let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build()?;

    let mut solved: Vec<SolvedColumn> = pool.install(|| {
        columns
            .par_iter()
            .zip(specs.par_iter())
            .map(|(column, spec)| calibrate_column(column, spec, params))
            .collect()
    });

    // Final pass: columns whose scale was neither closed-form nor a
    // quasi-Newton byproduct get it from the summed loss at the computed
    // offset, in one combined traversal of the remaining columns.
    if params.scale {
        pool.install(|| {
            solved
                .par_iter_mut()
                .zip(columns.par_iter())
                .zip(specs.par_iter())
                .filter(|((sc, _), _)| !sc.skip_scale)
                .for_each(|((sc, column), spec)| {
                    sc.result.scale = scale_from_offset(column, spec, &sc.result.offset);
                });
        });
    }

    Ok(solved
        .into_iter()
        .zip(specs)
        .map(|(mut sc, spec)| {
            // Offsets are always computed internally (the scale pass needs
            // them); the reported offset honors the toggle.
            if !params.offset {
                sc.result.offset = identity_for(spec).offset;
            }
            if !params.scale {
                sc.result.scale = 1.0;
            }
            sc.result
        })
        .collect())
}

fn identity_for(spec: &ColumnSpec) -> ColumnCalibration {
    match spec.kind {
        ColumnKind::Numeric => ColumnCalibration::identity_numeric(),
        ColumnKind::Categorical => ColumnCalibration::identity_categorical(spec.cardinality),
    }
}

struct SolvedColumn {
    result: ColumnCalibration,
    /// True when the final scale pass must not touch this column: its scale
    /// is either closed-form (Quadratic) or already recovered from the
    /// quasi-Newton objective value.
    skip_scale: bool,
}

/// Does the offset M-estimator have a closed form for this loss?
fn closed_form_offset(lf: LossFunction) -> bool {
    match lf {
        LossFunction::Quadratic
        | LossFunction::Absolute
        | LossFunction::Huber
        | LossFunction::Poisson
        | LossFunction::Hinge
        | LossFunction::Periodic => true,
        LossFunction::Logistic | LossFunction::Categorical | LossFunction::Ordinal => false,
    }
}

/// Does the generalized variance have a closed form for this loss?
fn closed_form_scale(lf: LossFunction) -> bool {
    matches!(lf, LossFunction::Quadratic)
}

fn calibrate_column(
    column: &DataColumn,
    spec: &ColumnSpec,
    params: &GlrmParameters,
) -> SolvedColumn {
    match spec.kind {
        ColumnKind::Numeric => {
            assert!(column.is_numeric(), "column {} is not numeric", spec.index);
            assert!(
                spec.loss.is_for_numeric(),
                "loss function {:?} not applicable to numeric column {}",
                spec.loss,
                spec.index
            );
        }
        ColumnKind::Categorical => {
            assert!(!column.is_numeric(), "column {} is not categorical", spec.index);
            assert!(
                spec.loss.is_for_categorical(),
                "loss function {:?} not applicable to categorical column {}",
                spec.loss,
                spec.index
            );
        }
    }

    let skip_scale = closed_form_scale(spec.loss) || !closed_form_offset(spec.loss);
    let n_eff = (column.len() - column.na_count()) as f64 - 1.0;

    let mut result = if closed_form_offset(spec.loss) {
        // Closed-form offsets only exist for numeric losses.
        ColumnCalibration {
            offset: array![numeric_offset(column, spec)],
            scale: 1.0,
            iterations: 0,
            delta: 0.0,
        }
    } else if spec.loss.is_for_numeric() {
        // Logistic: plain quasi-Newton solve seeded at the column mean.
        let lf = spec.loss;
        let period = spec.period;
        let objective = |x: &Array1<f64>| {
            let mut obj = 0.0;
            let mut grad = 0.0;
            for a in column.present() {
                obj += loss::loss(x[0], a, lf, period);
                grad += loss::lgrad(x[0], a, lf, period);
            }
            (obj, array![grad])
        };
        let outcome = minimize(&objective, array![column.mean()], params.max_iterations);
        let scale =
            if params.scale { scale_from_objective(n_eff, outcome.objective) } else { 1.0 };
        ColumnCalibration { offset: outcome.point, scale, iterations: 0, delta: 0.0 }
    } else {
        // Categorical/Ordinal: quasi-Newton inside a proximal-refinement
        // loop, seeded at the one-hot of the majority class.
        let lf = spec.loss;
        let cardinality = spec.cardinality;
        let objective = |x: &Array1<f64>| {
            let mut obj = 0.0;
            let mut grad = Array1::zeros(x.len());
            for a in column.present() {
                let a = a as usize;
                obj += loss::mloss(x.view(), a, lf, None);
                grad += &loss::mlgrad(x.view(), a, lf, None);
            }
            (obj, grad)
        };
        let mut seed = Array1::zeros(cardinality);
        seed[column.mode().min(cardinality - 1)] = 1.0;

        let (point, iterations, delta) =
            prox_refine(&objective, seed, params.rho, params.max_iterations);
        log::info!(
            "column {}: proximal refinement ran {iterations} iterations (delta {delta:.3e})",
            spec.index
        );
        let scale = if params.scale {
            let (final_obj, _) = objective(&point);
            scale_from_objective(n_eff, final_obj)
        } else {
            1.0
        };
        ColumnCalibration { offset: point, scale, iterations, delta }
    };

    if params.scale && closed_form_scale(spec.loss) {
        result.scale = quadratic_scale(column);
    }

    SolvedColumn { result, skip_scale }
}

/// Closed-form generalized mean of a numeric column.
fn numeric_offset(column: &DataColumn, spec: &ColumnSpec) -> f64 {
    match spec.loss {
        LossFunction::Quadratic => column.mean(),
        LossFunction::Absolute => column.median(),
        // The mean is not the exact Huber M-estimator, but it is close for
        // the unit transition width and is kept as the reference behavior.
        LossFunction::Huber => column.mean(),
        LossFunction::Poisson => column.mean().ln(),
        LossFunction::Hinge => {
            let ones = column.non_zero_count();
            let zeros = column.len() - column.na_count() - ones;
            if ones > zeros { 1.0 } else { 0.0 }
        }
        LossFunction::Periodic => circular_mean(column, spec.period),
        LossFunction::Logistic | LossFunction::Categorical | LossFunction::Ordinal => {
            unreachable!("no closed-form offset for {:?}", spec.loss)
        }
    }
}

/// Minimizer of the periodic loss over one period: the circular mean of the
/// column, wrapped into `[0, period)`.
fn circular_mean(column: &DataColumn, period: usize) -> f64 {
    assert!(period > 0, "period must be a positive integer");
    let w = 2.0 * PI / period as f64;
    let mut sin_sum = 0.0;
    let mut cos_sum = 0.0;
    for a in column.present() {
        sin_sum += f64::sin(a * w);
        cos_sum += f64::cos(a * w);
    }
    let mut offset = f64::atan2(sin_sum, cos_sum) / w;
    if offset < 0.0 {
        offset += period as f64;
    }
    offset
}

/// Closed-form Quadratic scale: reciprocal variance, with a unit fallback
/// for constant columns so the scale is never infinite or NaN.
fn quadratic_scale(column: &DataColumn) -> f64 {
    let sigma = column.sigma();
    if sigma != 0.0 { 1.0 / (sigma * sigma) } else { 1.0 }
}

/// Scale recovered from a solver's final objective value.
fn scale_from_objective(n_eff: f64, objective: f64) -> f64 {
    if objective != 0.0 { n_eff / objective } else { 1.0 }
}

/// Scale for a closed-form-offset column without a closed-form scale: the
/// summed loss against the constant offset plays the role of the solver's
/// objective value.
fn scale_from_offset(column: &DataColumn, spec: &ColumnSpec, offset: &Array1<f64>) -> f64 {
    let total: f64 = column
        .present()
        .map(|a| loss::loss(offset[0], a, spec.loss, spec.period))
        .sum();
    let n_eff = (column.len() - column.na_count()) as f64 - 1.0;
    scale_from_objective(n_eff, total)
}

struct SolveOutcome {
    point: Array1<f64>,
    objective: f64,
}

/// Runs the quasi-Newton minimizer at the fixed gradient tolerance. A solver
/// failure keeps the seed iterate rather than aborting calibration.
fn minimize<F>(objective: &F, x0: Array1<f64>, max_iterations: usize) -> SolveOutcome
where
    F: Fn(&Array1<f64>) -> (f64, Array1<f64>),
{
    match Bfgs::new(x0.clone(), objective)
        .with_tolerance(GRAD_TOLERANCE)
        .with_max_iterations(max_iterations)
        .run()
    {
        Ok(BfgsSolution { final_point, final_value, .. }) => {
            SolveOutcome { point: final_point, objective: final_value }
        }
        Err(e) => {
            log::warn!("quasi-Newton solve failed ({e:?}); keeping the seed iterate");
            let (objective, _) = objective(&x0);
            SolveOutcome { point: x0, objective }
        }
    }
}

/// Fixed-point proximal-gradient refinement: repeatedly minimizes the smooth
/// objective plus `rho/2‖x − anchor‖²` anchored at the previous iterate,
/// until consecutive iterates agree to [`TOLERANCE`] in the ∞-norm or the
/// iteration cap is hit. Returns the final iterate with the iteration count
/// and last delta.
fn prox_refine<F>(
    objective: &F,
    seed: Array1<f64>,
    rho: f64,
    max_iterations: usize,
) -> (Array1<f64>, usize, f64)
where
    F: Fn(&Array1<f64>) -> (f64, Array1<f64>),
{
    let mut current = seed;
    let mut count = 0usize;
    let mut delta = 2.0 * TOLERANCE;

    while delta > TOLERANCE && count < max_iterations {
        let anchor = current.clone();
        let augmented = |x: &Array1<f64>| {
            let (mut obj, mut grad) = objective(x);
            for i in 0..x.len() {
                let d = x[i] - anchor[i];
                obj += 0.5 * rho * d * d;
                grad[i] += rho * d;
            }
            (obj, grad)
        };
        let outcome = minimize(&augmented, anchor.clone(), max_iterations);

        delta = linf_diff(&outcome.point, &anchor);
        current = outcome.point;
        count += 1;
    }
    (current, count, delta)
}

fn linf_diff(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn numeric_col(values: Array1<f64>) -> DataColumn {
        DataColumn::numeric(values)
    }

    fn params(offset: bool, scale: bool) -> GlrmParameters {
        GlrmParameters { offset, scale, ..GlrmParameters::default() }
    }

    #[test]
    fn disabled_toggles_return_identity_defaults() {
        let cols = vec![
            numeric_col(array![1.0, 2.0, 3.0]),
            DataColumn::categorical(array![0.0, 1.0, 1.0], 2),
        ];
        let specs = vec![
            ColumnSpec::numeric(0, LossFunction::Quadratic),
            ColumnSpec::categorical(1, LossFunction::Categorical, 2),
        ];
        let out = calibrate(&cols, &specs, &params(false, false)).unwrap();
        assert_eq!(out[0], ColumnCalibration::identity_numeric());
        assert_eq!(out[1], ColumnCalibration::identity_categorical(2));
    }

    #[test]
    fn quadratic_offset_is_mean_and_scale_is_reciprocal_variance() {
        // Variance of [0, 2, 4, 6] is 20/3 (sample, n-1).
        let cols = vec![numeric_col(array![0.0, 2.0, 4.0, 6.0])];
        let specs = vec![ColumnSpec::numeric(0, LossFunction::Quadratic)];
        let out = calibrate(&cols, &specs, &params(true, true)).unwrap();
        assert_abs_diff_eq!(out[0].offset[0], 3.0);
        assert_abs_diff_eq!(out[0].scale, 3.0 / 20.0, epsilon = 1e-12);
    }

    #[test]
    fn zero_variance_scale_defaults_to_one() {
        let cols = vec![numeric_col(array![5.0, 5.0, 5.0])];
        let specs = vec![ColumnSpec::numeric(0, LossFunction::Quadratic)];
        let out = calibrate(&cols, &specs, &params(true, true)).unwrap();
        assert_abs_diff_eq!(out[0].offset[0], 5.0);
        assert_abs_diff_eq!(out[0].scale, 1.0);
        assert!(out[0].scale.is_finite());
    }

    #[test]
    fn absolute_offset_is_median_with_final_pass_scale() {
        let cols = vec![numeric_col(array![0.0, 2.0, 0.0, 2.0])];
        let specs = vec![ColumnSpec::numeric(0, LossFunction::Absolute)];
        let out = calibrate(&cols, &specs, &params(true, true)).unwrap();
        assert_abs_diff_eq!(out[0].offset[0], 1.0);
        // Σ|offset - a| = 4 over 4 rows, scale = (4 - 0 - 1)/4.
        assert_abs_diff_eq!(out[0].scale, 0.75);
    }

    #[test]
    fn poisson_offset_is_log_mean() {
        let cols = vec![numeric_col(array![1.0, 2.0, 3.0, 6.0])];
        let specs = vec![ColumnSpec::numeric(0, LossFunction::Poisson)];
        let out = calibrate(&cols, &specs, &params(true, false)).unwrap();
        assert_abs_diff_eq!(out[0].offset[0], 3.0_f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(out[0].scale, 1.0);
    }

    #[test]
    fn hinge_offset_is_majority_class() {
        let cols = vec![
            numeric_col(array![1.0, 1.0, 1.0, 0.0]),
            numeric_col(array![1.0, 0.0, 0.0, f64::NAN]),
        ];
        let specs = vec![
            ColumnSpec::numeric(0, LossFunction::Hinge),
            ColumnSpec::numeric(1, LossFunction::Hinge),
        ];
        let out = calibrate(&cols, &specs, &params(true, false)).unwrap();
        assert_abs_diff_eq!(out[0].offset[0], 1.0);
        assert_abs_diff_eq!(out[1].offset[0], 0.0);
    }

    #[test]
    fn periodic_offset_is_circular_mean() {
        // All mass at a single phase: the circular mean is that phase.
        let cols = vec![numeric_col(array![1.5, 1.5, 1.5])];
        let specs = vec![ColumnSpec::numeric(0, LossFunction::Periodic).with_period(4)];
        let out = calibrate(&cols, &specs, &params(true, false)).unwrap();
        assert_abs_diff_eq!(out[0].offset[0], 1.5, epsilon = 1e-9);

        // Phases wrap: 3.5 and 0.5 under period 4 straddle zero, so the
        // circular mean is 0, not the arithmetic mean 2.
        let wrap = vec![numeric_col(array![3.5, 0.5])];
        let wspecs = vec![ColumnSpec::numeric(0, LossFunction::Periodic).with_period(4)];
        let wout = calibrate(&wrap, &wspecs, &params(true, false)).unwrap();
        assert_abs_diff_eq!(wout[0].offset[0], 0.0, epsilon = 1e-9);
    }

    #[test]
    #[should_panic(expected = "positive integer")]
    fn periodic_requires_positive_period() {
        let cols = vec![numeric_col(array![1.0, 2.0])];
        let specs = vec![ColumnSpec::numeric(0, LossFunction::Periodic).with_period(0)];
        let _ = calibrate(&cols, &specs, &params(true, false));
    }

    #[test]
    fn logistic_offset_matches_log_odds() {
        // The minimizer of Σ log(1 + exp(±u)) over a {0,1} column with k
        // ones and m zeros is ln(k/m).
        let mut values = vec![1.0; 30];
        values.extend(vec![0.0; 10]);
        let cols = vec![numeric_col(Array1::from_vec(values))];
        let specs = vec![ColumnSpec::numeric(0, LossFunction::Logistic)];
        let out = calibrate(&cols, &specs, &params(true, false)).unwrap();
        assert_abs_diff_eq!(out[0].offset[0], 3.0_f64.ln(), epsilon = 1e-4);
    }

    #[test]
    fn logistic_scale_comes_from_solver_objective() {
        let mut values = vec![1.0; 30];
        values.extend(vec![0.0; 10]);
        let cols = vec![numeric_col(Array1::from_vec(values))];
        let specs = vec![ColumnSpec::numeric(0, LossFunction::Logistic)];
        let out = calibrate(&cols, &specs, &params(true, true)).unwrap();

        // Objective at the optimum u* = ln 3.
        let u = 3.0_f64.ln();
        let obj = 30.0 * f64::ln_1p(f64::exp(-u)) + 10.0 * f64::ln_1p(f64::exp(u));
        assert_abs_diff_eq!(out[0].scale, 39.0 / obj, epsilon = 1e-3);
    }

    #[test]
    fn categorical_offset_refines_to_convergence() {
        let codes = array![0.0, 0.0, 0.0, 1.0, 2.0, 0.0, 1.0, 0.0];
        let cols = vec![DataColumn::categorical(codes, 3)];
        let specs = vec![ColumnSpec::categorical(0, LossFunction::Categorical, 3)];
        let out = calibrate(&cols, &specs, &params(true, true)).unwrap();

        assert_eq!(out[0].offset.len(), 3);
        assert!(out[0].offset.iter().all(|v| v.is_finite()));
        assert!(out[0].iterations >= 1);
        // Either converged below tolerance or stopped at the cap.
        assert!(out[0].delta <= TOLERANCE || out[0].iterations == 1000);
        assert!(out[0].scale.is_finite());
    }

    #[test]
    fn offset_toggle_masks_computed_offsets_but_scale_still_uses_them() {
        // scale=true, offset=false: the reported offset is the identity but
        // the scale was computed from the real median.
        let cols = vec![numeric_col(array![0.0, 2.0, 0.0, 2.0])];
        let specs = vec![ColumnSpec::numeric(0, LossFunction::Absolute)];
        let out = calibrate(&cols, &specs, &params(false, true)).unwrap();
        assert_abs_diff_eq!(out[0].offset[0], 0.0);
        assert_abs_diff_eq!(out[0].scale, 0.75);
    }

    #[test]
    fn spec_count_mismatch_is_an_error() {
        let cols = vec![numeric_col(array![1.0])];
        let err = calibrate(&cols, &[], &params(true, false)).unwrap_err();
        assert!(matches!(err, CalibrationError::SpecCountMismatch { .. }));
    }

    #[test]
    fn missing_values_reduce_the_effective_row_count() {
        let cols = vec![numeric_col(array![0.0, 2.0, 0.0, 2.0, f64::NAN, f64::NAN])];
        let specs = vec![ColumnSpec::numeric(0, LossFunction::Absolute)];
        let out = calibrate(&cols, &specs, &params(true, true)).unwrap();
        // 4 present rows: scale = (4 - 1)/Σ|1 - a| = 3/4.
        assert_abs_diff_eq!(out[0].scale, 0.75);
    }
}
