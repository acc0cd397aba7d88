//! The column-vector abstraction the external training driver hands to the
//! calibration solver.
//!
//! The driver owns real storage (frames, chunks, whatever it uses); this
//! crate only needs a dense view of one column at a time plus the summary
//! statistics the offset/scale formulas consume. A `NaN` entry encodes a
//! missing value in both numeric and categorical columns; categorical
//! columns store their levels as integer-valued codes `0..cardinality`.

use ndarray::{Array1, ArrayView1};

/// One dense column of the training table.
#[derive(Debug, Clone, PartialEq)]
pub enum DataColumn {
    Numeric(Array1<f64>),
    Categorical { codes: Array1<f64>, cardinality: usize },
}

impl DataColumn {
    pub fn numeric(values: Array1<f64>) -> Self {
        DataColumn::Numeric(values)
    }

    pub fn categorical(codes: Array1<f64>, cardinality: usize) -> Self {
        debug_assert!(
            codes
                .iter()
                .filter(|v| !v.is_nan())
                .all(|&v| v >= 0.0 && v < cardinality as f64 && v.fract() == 0.0),
            "categorical codes must be integers in 0..{cardinality}"
        );
        DataColumn::Categorical { codes, cardinality }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, DataColumn::Numeric(_))
    }

    /// Raw storage including missing entries.
    pub fn values(&self) -> ArrayView1<'_, f64> {
        match self {
            DataColumn::Numeric(v) => v.view(),
            DataColumn::Categorical { codes, .. } => codes.view(),
        }
    }

    /// Iterator over the present (non-missing) values.
    pub fn present(&self) -> impl Iterator<Item = f64> + '_ {
        self.values().into_iter().copied().filter(|v| !v.is_nan())
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of missing entries.
    pub fn na_count(&self) -> usize {
        self.values().iter().filter(|v| v.is_nan()).count()
    }

    /// Number of category levels; 0 for numeric columns.
    pub fn cardinality(&self) -> usize {
        match self {
            DataColumn::Numeric(_) => 0,
            DataColumn::Categorical { cardinality, .. } => *cardinality,
        }
    }

    /// Mean of the present values (0 when the column is all-missing).
    pub fn mean(&self) -> f64 {
        let mut sum = 0.0;
        let mut n = 0usize;
        for v in self.present() {
            sum += v;
            n += 1;
        }
        if n == 0 { 0.0 } else { sum / n as f64 }
    }

    /// Median of the present values; the midpoint of the two central values
    /// for even counts.
    pub fn median(&self) -> f64 {
        let mut sorted: Vec<f64> = self.present().collect();
        if sorted.is_empty() {
            return 0.0;
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 1 {
            sorted[mid]
        } else {
            0.5 * (sorted[mid - 1] + sorted[mid])
        }
    }

    /// Sample standard deviation (n − 1 denominator) of the present values;
    /// 0 when fewer than two are present.
    pub fn sigma(&self) -> f64 {
        let n = self.len() - self.na_count();
        if n < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let ss: f64 = self.present().map(|v| (v - mean) * (v - mean)).sum();
        (ss / (n - 1) as f64).sqrt()
    }

    /// Most frequent category code; the lowest code on ties. Only meaningful
    /// for categorical columns.
    pub fn mode(&self) -> usize {
        let card = self.cardinality();
        if card == 0 {
            return 0;
        }
        let mut counts = vec![0usize; card];
        for v in self.present() {
            counts[v as usize] += 1;
        }
        let mut best = 0;
        for (code, &count) in counts.iter().enumerate() {
            if count > counts[best] {
                best = code;
            }
        }
        best
    }

    /// Number of present values that are non-zero (the positive-class count
    /// for a {0,1}-coded boolean column).
    pub fn non_zero_count(&self) -> usize {
        self.present().filter(|&v| v != 0.0).count()
    }
}
