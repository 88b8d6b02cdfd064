//! kernel.rs
//! Elementwise and reducing kernels over batches.
//!
//! Equal-shape arithmetic runs four lanes at a time through `wide`; anything
//! that broadcasts falls back to per-element reads. Outputs at or above the
//! parallel threshold are split across rayon workers in fixed chunks, so the
//! result never depends on the number of threads.

use super::error::EvalError;
use super::value::{broadcast_axis, Batch, Dtype};
use rayon::prelude::*;
use wide::f64x4;

const LANES: usize = 4;
const CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    /// Floor modulo: the result takes the sign of the divisor.
    Rem,
    Pow,
    Min,
    Max,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    #[inline(always)]
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Rem => a - b * (a / b).floor(),
            BinaryOp::Pow => a.powf(b),
            BinaryOp::Min => a.min(b),
            BinaryOp::Max => a.max(b),
            BinaryOp::Lt => flag(a < b),
            BinaryOp::Gt => flag(a > b),
            BinaryOp::Le => flag(a <= b),
            BinaryOp::Ge => flag(a >= b),
            BinaryOp::Eq => flag(a == b),
            BinaryOp::Ne => flag(a != b),
            BinaryOp::And => flag(a != 0.0 && b != 0.0),
            BinaryOp::Or => flag(a != 0.0 || b != 0.0),
        }
    }

    #[inline(always)]
    fn lanes(self, a: f64x4, b: f64x4) -> Option<f64x4> {
        match self {
            BinaryOp::Add => Some(a + b),
            BinaryOp::Sub => Some(a - b),
            BinaryOp::Mul => Some(a * b),
            BinaryOp::Div => Some(a / b),
            _ => None,
        }
    }
}

#[inline(always)]
pub fn flag(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

/// The broadcast shape of several batches.
pub fn broadcast_shape(op: &str, inputs: &[&Batch]) -> Result<(usize, usize), EvalError> {
    let mut samples = 1;
    let mut width = 1;
    for b in inputs {
        let shape = broadcast_axis(samples, b.samples()).zip(broadcast_axis(width, b.width()));
        match shape {
            Some((s, w)) => {
                samples = s;
                width = w;
            }
            None => {
                return Err(EvalError::Broadcast {
                    op: op.to_string(),
                    left: format!("({}, {})", samples, width),
                    right: b.shape_label(),
                })
            }
        }
    }
    Ok((samples, width))
}

pub fn binary(op: BinaryOp, a: &Batch, b: &Batch, dtype: Dtype, parallel_threshold: usize) -> Result<Batch, EvalError> {
    let (samples, width) = broadcast_shape(&format!("{:?}", op), &[a, b])?;
    let mut out = vec![0.0; samples * width];

    if a.samples() == b.samples() && a.width() == b.width() {
        let (xs, ys) = (a.data(), b.data());
        if out.len() >= parallel_threshold {
            out.par_chunks_mut(CHUNK).enumerate().for_each(|(k, chunk)| {
                let start = k * CHUNK;
                let end = start + chunk.len();
                zip_slices(op, &xs[start..end], &ys[start..end], chunk);
            });
        } else {
            zip_slices(op, xs, ys, &mut out);
        }
    } else {
        fill_rows(&mut out, width, parallel_threshold, |s, row| {
            for (c, v) in row.iter_mut().enumerate() {
                *v = op.apply(a.get(s, c), b.get(s, c));
            }
        });
    }
    Ok(Batch::new(samples, width, dtype, out))
}

fn zip_slices(op: BinaryOp, a: &[f64], b: &[f64], out: &mut [f64]) {
    let mut i = 0;
    while i + LANES <= out.len() {
        let x = f64x4::new([a[i], a[i + 1], a[i + 2], a[i + 3]]);
        let y = f64x4::new([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        match op.lanes(x, y) {
            Some(r) => out[i..i + LANES].copy_from_slice(&r.to_array()),
            None => break,
        }
        i += LANES;
    }
    for j in i..out.len() {
        out[j] = op.apply(a[j], b[j]);
    }
}

pub fn unary(a: &Batch, dtype: Dtype, parallel_threshold: usize, f: impl Fn(f64) -> f64 + Sync) -> Batch {
    let mut out = a.data().to_vec();
    if out.len() >= parallel_threshold {
        out.par_chunks_mut(CHUNK).for_each(|chunk| chunk.iter_mut().for_each(|v| *v = f(*v)));
    } else {
        out.iter_mut().for_each(|v| *v = f(*v));
    }
    Batch::new(a.samples(), a.width(), dtype, out)
}

/// Elementwise function of any number of broadcast inputs.
pub fn map_n(
    op: &str,
    inputs: &[&Batch],
    dtype: Dtype,
    parallel_threshold: usize,
    f: impl Fn(&[f64]) -> f64 + Sync,
) -> Result<Batch, EvalError> {
    let (samples, width) = broadcast_shape(op, inputs)?;
    let mut out = vec![0.0; samples * width];
    fill_rows(&mut out, width, parallel_threshold, |s, row| {
        let mut args = vec![0.0; inputs.len()];
        for (c, v) in row.iter_mut().enumerate() {
            for (arg, input) in args.iter_mut().zip(inputs) {
                *arg = input.get(s, c);
            }
            *v = f(&args);
        }
    });
    Ok(Batch::new(samples, width, dtype, out))
}

/// Collapses each sample row to one value. Empty rows reduce to zero.
pub fn reduce_rows(a: &Batch, dtype: Dtype, f: impl Fn(&[f64]) -> f64) -> Batch {
    let values = (0..a.samples())
        .map(|s| {
            let row = a.sample_row(s);
            if row.is_empty() { 0.0 } else { f(row) }
        })
        .collect();
    Batch::column(values, dtype)
}

/// Runs `fill(sample, row)` over every output row, in parallel when large.
fn fill_rows(out: &mut [f64], width: usize, parallel_threshold: usize, fill: impl Fn(usize, &mut [f64]) + Sync) {
    if width == 0 {
        return;
    }
    if out.len() >= parallel_threshold {
        out.par_chunks_mut(width).enumerate().for_each(|(s, row)| fill(s, row));
    } else {
        out.chunks_mut(width).enumerate().for_each(|(s, row)| fill(s, row));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(BinaryOp::Add, 7.0, 2.0, 9.0)]
    #[case(BinaryOp::Div, 7.0, 2.0, 3.5)]
    #[case(BinaryOp::Rem, -7.0, 3.0, 2.0)]
    #[case(BinaryOp::Rem, 7.0, -3.0, -2.0)]
    #[case(BinaryOp::Pow, 2.0, 10.0, 1024.0)]
    #[case(BinaryOp::Le, 2.0, 2.0, 1.0)]
    #[case(BinaryOp::And, 1.0, 0.0, 0.0)]
    #[case(BinaryOp::Or, 1.0, 0.0, 1.0)]
    fn test_scalar_semantics(#[case] op: BinaryOp, #[case] a: f64, #[case] b: f64, #[case] expected: f64) {
        assert_eq!(op.apply(a, b), expected);
    }

    #[test]
    fn test_simd_and_scalar_paths_agree() {
        let a = Batch::column((0..11).map(|i| i as f64).collect(), Dtype::Float);
        let b = Batch::column((0..11).map(|i| (i * 2 + 1) as f64).collect(), Dtype::Float);
        let serial = binary(BinaryOp::Mul, &a, &b, Dtype::Float, usize::MAX).unwrap();
        let parallel = binary(BinaryOp::Mul, &a, &b, Dtype::Float, 1).unwrap();
        let expected: Vec<f64> = (0..11).map(|i| (i * (i * 2 + 1)) as f64).collect();
        assert_eq!(serial.data(), expected.as_slice());
        assert_eq!(parallel.data(), expected.as_slice());
    }

    #[test]
    fn test_broadcast_row_against_column() {
        let row = Batch::row(vec![1.0, 2.0, 3.0], Dtype::Int);
        let col = Batch::column(vec![10.0, 20.0], Dtype::Int);
        let out = binary(BinaryOp::Add, &row, &col, Dtype::Int, usize::MAX).unwrap();
        assert_eq!((out.samples(), out.width()), (2, 3));
        assert_eq!(out.data(), &[11.0, 12.0, 13.0, 21.0, 22.0, 23.0]);
    }

    #[test]
    fn test_incompatible_widths_fail() {
        let a = Batch::row(vec![1.0, 2.0], Dtype::Float);
        let b = Batch::row(vec![1.0, 2.0, 3.0], Dtype::Float);
        assert!(matches!(
            binary(BinaryOp::Add, &a, &b, Dtype::Float, usize::MAX),
            Err(EvalError::Broadcast { .. })
        ));
    }

    #[test]
    fn test_reduce_and_map_n() {
        let a = Batch::new(2, 3, Dtype::Float, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let sums = reduce_rows(&a, Dtype::Float, |row| row.iter().sum());
        assert_eq!(sums.data(), &[6.0, 15.0]);

        let lo = Batch::scalar(2.0, Dtype::Float);
        let hi = Batch::scalar(5.0, Dtype::Float);
        let clipped = map_n("clip", &[&a, &lo, &hi], Dtype::Float, usize::MAX, |v| v[0].max(v[1]).min(v[2])).unwrap();
        assert_eq!(clipped.data(), &[2.0, 2.0, 3.0, 4.0, 5.0, 5.0]);
    }
}
