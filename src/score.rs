//! Scoring and imputation over finished factor matrices.
//!
//! Given a row of X and the archetypes Y, reconstruction is the product
//! X·Y; imputation decodes each column's slice of that product back into
//! the column's original domain (argmin over observed values of the
//! column's loss). Internally Y keeps categorical blocks before numeric
//! columns; the permutation maps decoded values back to the original
//! column order.
//!
//! Rows are independent. Scoring processes disjoint row partitions in
//! parallel, each with private scratch, and merges the per-partition
//! metric accumulators with an associative reduction before a single
//! finalization.

use crate::loss;
use crate::model::{ColumnCalibration, ColumnKind, ColumnSpec, GlrmParameters};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray::parallel::prelude::*;

/// Rows per scoring partition.
const ROWS_PER_PARTITION: usize = 1024;

/// The Y factor, stored k × (expanded columns): one block of `cardinality`
/// columns per categorical, then one column per numeric, with the original
/// column order recoverable through `permutation`.
#[derive(Debug, Clone)]
pub struct Archetypes {
    y: Array2<f64>,
    /// Start offsets of the categorical blocks; the last entry is the total
    /// categorical width and the start of the numeric columns.
    cat_offsets: Vec<usize>,
    /// Internal (cats-first) position → original column index.
    permutation: Vec<usize>,
}

impl Archetypes {
    /// Builds the archetype view of `y` for columns described by `specs`
    /// (in original column order). `y` must be k × expanded width, where
    /// the expansion replaces each categorical column with `cardinality`
    /// columns.
    pub fn new(y: Array2<f64>, specs: &[ColumnSpec]) -> Self {
        let mut cat_offsets = vec![0];
        let mut cat_indices = Vec::new();
        let mut num_indices = Vec::new();
        for spec in specs {
            match spec.kind {
                ColumnKind::Categorical => {
                    assert!(spec.cardinality > 0, "categorical column {} has no levels", spec.index);
                    cat_offsets.push(cat_offsets.last().unwrap() + spec.cardinality);
                    cat_indices.push(spec.index);
                }
                ColumnKind::Numeric => num_indices.push(spec.index),
            }
        }
        let expanded = cat_offsets.last().unwrap() + num_indices.len();
        assert_eq!(
            y.ncols(),
            expanded,
            "archetype matrix has {} columns, expected {expanded}",
            y.ncols()
        );

        let mut permutation = cat_indices;
        permutation.extend(num_indices);
        Archetypes { y, cat_offsets, permutation }
    }

    /// Rank of the factorization.
    pub fn k(&self) -> usize {
        self.y.nrows()
    }

    /// Number of categorical columns.
    pub fn num_cats(&self) -> usize {
        self.cat_offsets.len() - 1
    }

    /// Total number of model columns.
    pub fn num_cols(&self) -> usize {
        self.permutation.len()
    }

    /// x·Y over the block of the `cat`-th categorical column: the
    /// length-cardinality reconstruction for that column.
    pub fn cat_block_product(&self, x: ArrayView1<'_, f64>, cat: usize) -> Array1<f64> {
        let start = self.cat_offsets[cat];
        let end = self.cat_offsets[cat + 1];
        let block = self.y.slice(ndarray::s![.., start..end]);
        x.dot(&block)
    }

    /// x·Y over the `num`-th numeric column: the scalar reconstruction.
    pub fn num_col_product(&self, x: ArrayView1<'_, f64>, num: usize) -> f64 {
        let col = self.y.column(self.cat_offsets[self.num_cats()] + num);
        x.dot(&col)
    }
}

/// Error-metric accumulator over imputed rows. `merge` is commutative and
/// associative so partitions can be reduced in any order; [`finalize`]
/// runs once after all merging.
///
/// [`finalize`]: ScoreMetrics::finalize
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreMetrics {
    /// Sum of squared errors over numeric cells.
    pub numeric_sse: f64,
    /// Misclassified categorical cells.
    pub categorical_errors: u64,
    pub numeric_count: u64,
    pub categorical_count: u64,
}

impl ScoreMetrics {
    fn record(&mut self, kind: ColumnKind, truth: f64, pred: f64) {
        if truth.is_nan() {
            return;
        }
        match kind {
            ColumnKind::Numeric => {
                let d = pred - truth;
                self.numeric_sse += d * d;
                self.numeric_count += 1;
            }
            ColumnKind::Categorical => {
                if pred != truth {
                    self.categorical_errors += 1;
                }
                self.categorical_count += 1;
            }
        }
    }

    pub fn merge(mut self, other: ScoreMetrics) -> ScoreMetrics {
        self.numeric_sse += other.numeric_sse;
        self.categorical_errors += other.categorical_errors;
        self.numeric_count += other.numeric_count;
        self.categorical_count += other.categorical_count;
        self
    }

    /// Final per-cell error rates; call once, after all partitions merged.
    pub fn finalize(&self) -> ScoreSummary {
        ScoreSummary {
            numeric_mse: if self.numeric_count > 0 {
                self.numeric_sse / self.numeric_count as f64
            } else {
                0.0
            },
            categorical_error_rate: if self.categorical_count > 0 {
                self.categorical_errors as f64 / self.categorical_count as f64
            } else {
                0.0
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreSummary {
    pub numeric_mse: f64,
    pub categorical_error_rate: f64,
}

/// Reconstructs and decodes rows from finished factors, accumulating error
/// metrics against the observed data.
pub struct Scorer<'a> {
    archetypes: &'a Archetypes,
    specs: &'a [ColumnSpec],
    calibration: &'a [ColumnCalibration],
    params: &'a GlrmParameters,
}

impl<'a> Scorer<'a> {
    pub fn new(
        archetypes: &'a Archetypes,
        specs: &'a [ColumnSpec],
        calibration: &'a [ColumnCalibration],
        params: &'a GlrmParameters,
    ) -> Self {
        assert_eq!(specs.len(), archetypes.num_cols(), "spec count != archetype columns");
        assert_eq!(calibration.len(), specs.len(), "calibration count != spec count");
        Scorer { archetypes, specs, calibration, params }
    }

    /// Imputes one row into the caller-owned `preds` buffer (original
    /// column order). `x_row` is this row's slice of the X factor.
    pub fn impute_row(&self, x_row: ArrayView1<'_, f64>, preds: &mut [f64]) {
        assert_eq!(x_row.len(), self.archetypes.k(), "x row length != rank");
        assert_eq!(preds.len(), self.specs.len(), "preds length != column count");

        let ncats = self.archetypes.num_cats();
        for d in 0..self.specs.len() {
            let orig = self.archetypes.permutation[d];
            let spec = &self.specs[orig];
            let cal = &self.calibration[orig];
            if d < ncats {
                let block = self.archetypes.cat_block_product(x_row, d);
                preds[orig] =
                    loss::mimpute(block.view(), spec.loss, Some(cal.offset.view())) as f64;
            } else {
                let mut xy = self.archetypes.num_col_product(x_row, d - ncats);
                if self.params.offset {
                    xy += cal.offset[0];
                }
                preds[orig] = loss::impute(xy, spec.loss);
            }
        }
    }

    /// Imputes every row and compares against the observed `data`
    /// (original column order, NaN for missing cells). Disjoint row
    /// partitions run in parallel with private scratch; the per-partition
    /// metrics are merged and the merged accumulator finalized by the
    /// caller.
    pub fn score(
        &self,
        data: ArrayView2<'_, f64>,
        x: ArrayView2<'_, f64>,
    ) -> (Array2<f64>, ScoreMetrics) {
        assert_eq!(data.nrows(), x.nrows(), "data rows != x rows");
        assert_eq!(data.ncols(), self.specs.len(), "data columns != spec count");

        let mut imputed = Array2::zeros((data.nrows(), data.ncols()));
        let metrics = imputed
            .axis_chunks_iter_mut(Axis(0), ROWS_PER_PARTITION)
            .into_par_iter()
            .zip(data.axis_chunks_iter(Axis(0), ROWS_PER_PARTITION).into_par_iter())
            .zip(x.axis_chunks_iter(Axis(0), ROWS_PER_PARTITION).into_par_iter())
            .map(|((mut out, observed), x_part)| {
                let mut acc = ScoreMetrics::default();
                let mut preds = vec![0.0; self.specs.len()];
                for r in 0..observed.nrows() {
                    self.impute_row(x_part.row(r), &mut preds);
                    for (c, spec) in self.specs.iter().enumerate() {
                        acc.record(spec.kind, observed[[r, c]], preds[c]);
                        out[[r, c]] = preds[c];
                    }
                }
                acc
            })
            .reduce(ScoreMetrics::default, ScoreMetrics::merge);

        (imputed, metrics)
    }
}
