//! value.rs
//! Batched values: one row per sample, `width` columns per row.
//!
//! A batch with a single row broadcasts across every sample, and a batch with
//! a single column broadcasts across any width. Constants evaluate to 1x1 or
//! 1xN batches and never allocate per-sample storage.

use serde::{Deserialize, Serialize};

/// Numeric kind carried alongside every value.
///
/// All values are stored as `f64`; the dtype only drives promotion and how
/// results are reported. `Bool` results are encoded as 0.0 / 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Dtype {
    Bool,
    Int,
    #[default]
    Float,
}

impl Dtype {
    /// Arithmetic promotion: any float operand wins, bools count as ints.
    pub fn promote(self, other: Dtype) -> Dtype {
        if self == Dtype::Float || other == Dtype::Float {
            Dtype::Float
        } else {
            Dtype::Int
        }
    }

    pub fn promote_all(dtypes: impl IntoIterator<Item = Dtype>) -> Dtype {
        dtypes.into_iter().fold(Dtype::Int, Dtype::promote)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dtype::Bool => "bool",
            Dtype::Int => "int",
            Dtype::Float => "float",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    samples: usize,
    width: usize,
    dtype: Dtype,
    data: Vec<f64>,
}

impl Batch {
    pub fn new(samples: usize, width: usize, dtype: Dtype, data: Vec<f64>) -> Self {
        debug_assert_eq!(data.len(), samples * width, "batch data does not match its shape");
        Self { samples, width, dtype, data }
    }

    /// A single value shared by every sample.
    pub fn scalar(value: f64, dtype: Dtype) -> Self {
        Self::new(1, 1, dtype, vec![value])
    }

    /// A single row shared by every sample.
    pub fn row(values: Vec<f64>, dtype: Dtype) -> Self {
        let width = values.len();
        Self::new(1, width, dtype, values)
    }

    /// One value per sample.
    pub fn column(values: Vec<f64>, dtype: Dtype) -> Self {
        let samples = values.len();
        Self::new(samples, 1, dtype, values)
    }

    pub fn filled(samples: usize, width: usize, value: f64, dtype: Dtype) -> Self {
        Self::new(samples, width, dtype, vec![value; samples * width])
    }

    pub fn samples(&self) -> usize { self.samples }
    pub fn width(&self) -> usize { self.width }
    pub fn dtype(&self) -> Dtype { self.dtype }
    pub fn data(&self) -> &[f64] { &self.data }
    pub fn data_mut(&mut self) -> &mut [f64] { &mut self.data }
    pub fn into_data(self) -> Vec<f64> { self.data }

    pub fn with_dtype(mut self, dtype: Dtype) -> Self {
        self.dtype = dtype;
        self
    }

    /// Reads `(sample, col)` with broadcasting over unit axes.
    #[inline(always)]
    pub fn get(&self, sample: usize, col: usize) -> f64 {
        let s = if self.samples == 1 { 0 } else { sample };
        let c = if self.width == 1 { 0 } else { col };
        self.data[s * self.width + c]
    }

    /// The columns of one sample row (row 0 when the batch broadcasts).
    pub fn sample_row(&self, sample: usize) -> &[f64] {
        let s = if self.samples == 1 { 0 } else { sample };
        &self.data[s * self.width..(s + 1) * self.width]
    }

    pub fn shape_label(&self) -> String {
        format!("({}, {})", self.samples, self.width)
    }
}

/// Combined extent of two axes under broadcasting, `None` if incompatible.
#[inline]
pub fn broadcast_axis(a: usize, b: usize) -> Option<usize> {
    match (a, b) {
        (x, y) if x == y => Some(x),
        (1, y) => Some(y),
        (x, 1) => Some(x),
        _ => None,
    }
}

/// Resolves a possibly negative position against `len`. Float bounds
/// saturate at the `i64` range and NaN reads as zero.
#[inline]
pub fn resolve_position(raw: f64, len: usize) -> i64 {
    let i = raw.trunc() as i64;
    if i < 0 {
        i.saturating_add(len as i64)
    } else {
        i
    }
}

/// First column and width of `[start, stop)` over a source of `len` columns.
///
/// Columns outside the source read zero, so the window may hang off either
/// end, but it can never be wider than the source itself.
pub fn slice_window(start: f64, stop: f64, len: usize) -> Result<(i64, usize), String> {
    let (start, stop) = (resolve_position(start, len), resolve_position(stop, len));
    let width = stop.saturating_sub(start).max(0) as u64;
    if width > len as u64 {
        return Err(format!("slice [{}, {}) is wider than its source of width {}", start, stop, len));
    }
    Ok((start, width as usize))
}
