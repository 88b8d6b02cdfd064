//! Builder ergonomics: conversions into `Expr`, `std::ops` overloads and named
//! operator functions.
//!
//! Raw values are wrapped into constant leaves as soon as they meet an `Expr`
//! or a `RefId`. Two raw values never build a graph; `2.0 + 3.0` stays an `f64`.

use super::composite::{Composite, CompositeKind};
use super::distribution::Distribution;
use super::error::GraphError;
use super::node::{Constant, Expr, Operation};
use crate::compute::value::Dtype;
use crate::store::RefId;

// --- Conversions ---

impl From<Constant> for Expr {
    fn from(c: Constant) -> Self { Expr::Constant(c) }
}

impl From<f64> for Expr {
    fn from(v: f64) -> Self { Expr::Constant(Constant::float(v)) }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self { Expr::Constant(Constant::int(v as i64)) }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self { Expr::Constant(Constant::int(v)) }
}

impl From<bool> for Expr {
    fn from(v: bool) -> Self { Expr::Constant(Constant::bool(v)) }
}

impl From<Vec<f64>> for Expr {
    fn from(values: Vec<f64>) -> Self {
        Expr::Constant(Constant::Vector { values, dtype: Dtype::Float })
    }
}

impl From<Vec<i64>> for Expr {
    fn from(values: Vec<i64>) -> Self {
        let values = values.into_iter().map(|v| v as f64).collect();
        Expr::Constant(Constant::Vector { values, dtype: Dtype::Int })
    }
}

impl From<Vec<i32>> for Expr {
    fn from(values: Vec<i32>) -> Self {
        let values = values.into_iter().map(f64::from).collect();
        Expr::Constant(Constant::Vector { values, dtype: Dtype::Int })
    }
}

impl From<Vec<bool>> for Expr {
    fn from(values: Vec<bool>) -> Self {
        let values = values.into_iter().map(|b| if b { 1.0 } else { 0.0 }).collect();
        Expr::Constant(Constant::Vector { values, dtype: Dtype::Bool })
    }
}

impl<const N: usize> From<[f64; N]> for Expr {
    fn from(values: [f64; N]) -> Self { Expr::from(values.to_vec()) }
}

impl<const N: usize> From<[i64; N]> for Expr {
    fn from(values: [i64; N]) -> Self { Expr::from(values.to_vec()) }
}

impl<const N: usize> From<[i32; N]> for Expr {
    fn from(values: [i32; N]) -> Self { Expr::from(values.to_vec()) }
}

impl From<RefId> for Expr {
    fn from(id: RefId) -> Self { Expr::Reference(id) }
}

impl From<&Expr> for Expr {
    fn from(e: &Expr) -> Self { e.clone() }
}

impl From<Distribution> for Expr {
    fn from(d: Distribution) -> Self { Expr::Distribution(d) }
}

impl From<Composite> for Expr {
    fn from(c: Composite) -> Self { Expr::Composite(c) }
}

// --- Operator overloads ---

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<R: Into<Expr>> std::ops::$trait<R> for Expr {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr { Expr::op($op, vec![self, rhs.into()]) }
        }

        impl<R: Into<Expr>> std::ops::$trait<R> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr { Expr::op($op, vec![self.clone(), rhs.into()]) }
        }

        impl<R: Into<Expr>> std::ops::$trait<R> for RefId {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr { Expr::op($op, vec![Expr::Reference(self), rhs.into()]) }
        }

        impl_binary_op!(@lhs $trait, $method, $op, f64, i32);
    };
    (@lhs $trait:ident, $method:ident, $op:expr, $($lhs:ty),*) => {
        $(
            impl std::ops::$trait<Expr> for $lhs {
                type Output = Expr;
                fn $method(self, rhs: Expr) -> Expr { Expr::op($op, vec![Expr::from(self), rhs]) }
            }

            impl std::ops::$trait<&Expr> for $lhs {
                type Output = Expr;
                fn $method(self, rhs: &Expr) -> Expr { Expr::op($op, vec![Expr::from(self), rhs.clone()]) }
            }

            impl std::ops::$trait<RefId> for $lhs {
                type Output = Expr;
                fn $method(self, rhs: RefId) -> Expr {
                    Expr::op($op, vec![Expr::from(self), Expr::Reference(rhs)])
                }
            }
        )*
    };
}

impl_binary_op!(Add, add, Operation::Add);
impl_binary_op!(Sub, sub, Operation::Sub);
impl_binary_op!(Mul, mul, Operation::Mul);
impl_binary_op!(Div, div, Operation::Div);
impl_binary_op!(Rem, rem, Operation::Rem);
impl_binary_op!(BitAnd, bitand, Operation::And);
impl_binary_op!(BitOr, bitor, Operation::Or);

impl std::ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr { Expr::op(Operation::Neg, vec![self]) }
}

impl std::ops::Neg for &Expr {
    type Output = Expr;
    fn neg(self) -> Expr { Expr::op(Operation::Neg, vec![self.clone()]) }
}

impl std::ops::Neg for RefId {
    type Output = Expr;
    fn neg(self) -> Expr { Expr::op(Operation::Neg, vec![Expr::Reference(self)]) }
}

impl std::ops::Not for Expr {
    type Output = Expr;
    fn not(self) -> Expr { Expr::op(Operation::Not, vec![self]) }
}

impl std::ops::Not for RefId {
    type Output = Expr;
    fn not(self) -> Expr { Expr::op(Operation::Not, vec![Expr::Reference(self)]) }
}

// --- Named methods ---

impl Expr {
    fn binary(self, op: Operation, rhs: impl Into<Expr>) -> Expr {
        Expr::op(op, vec![self, rhs.into()])
    }

    pub fn lt(self, rhs: impl Into<Expr>) -> Expr { self.binary(Operation::Lt, rhs) }
    pub fn gt(self, rhs: impl Into<Expr>) -> Expr { self.binary(Operation::Gt, rhs) }
    pub fn le(self, rhs: impl Into<Expr>) -> Expr { self.binary(Operation::Le, rhs) }
    pub fn ge(self, rhs: impl Into<Expr>) -> Expr { self.binary(Operation::Ge, rhs) }
    pub fn equals(self, rhs: impl Into<Expr>) -> Expr { self.binary(Operation::Eq, rhs) }
    pub fn not_equals(self, rhs: impl Into<Expr>) -> Expr { self.binary(Operation::Ne, rhs) }
    pub fn pow(self, rhs: impl Into<Expr>) -> Expr { self.binary(Operation::Pow, rhs) }
    pub fn minimum(self, rhs: impl Into<Expr>) -> Expr { self.binary(Operation::Minimum, rhs) }
    pub fn maximum(self, rhs: impl Into<Expr>) -> Expr { self.binary(Operation::Maximum, rhs) }

    pub fn clip(self, low: impl Into<Expr>, high: impl Into<Expr>) -> Expr {
        Expr::op(Operation::Clip, vec![self, low.into(), high.into()])
    }

    /// `self[i]`: one column (or one timestep of a timeseries view) per sample.
    pub fn at(self, i: impl Into<Expr>) -> Expr { self.binary(Operation::Index, i) }

    /// `self[start..stop]`; bounds are read from the first sample.
    pub fn slice(self, start: impl Into<Expr>, stop: impl Into<Expr>) -> Expr {
        Expr::op(Operation::Slice, vec![self, start.into(), stop.into()])
    }

    pub fn abs(self) -> Expr { Expr::op(Operation::Abs, vec![self]) }
    pub fn sum(self) -> Expr { Expr::op(Operation::Sum, vec![self]) }
    pub fn mean(self) -> Expr { Expr::op(Operation::Mean, vec![self]) }
    pub fn series_min(self) -> Expr { Expr::op(Operation::SeriesMin, vec![self]) }
    pub fn series_max(self) -> Expr { Expr::op(Operation::SeriesMax, vec![self]) }
}

impl RefId {
    /// The full-history view of this reference.
    pub fn timeseries(self) -> Expr { Expr::Timeseries(self) }

    pub fn lt(self, rhs: impl Into<Expr>) -> Expr { Expr::Reference(self).lt(rhs) }
    pub fn gt(self, rhs: impl Into<Expr>) -> Expr { Expr::Reference(self).gt(rhs) }
    pub fn le(self, rhs: impl Into<Expr>) -> Expr { Expr::Reference(self).le(rhs) }
    pub fn ge(self, rhs: impl Into<Expr>) -> Expr { Expr::Reference(self).ge(rhs) }
    pub fn equals(self, rhs: impl Into<Expr>) -> Expr { Expr::Reference(self).equals(rhs) }
    pub fn not_equals(self, rhs: impl Into<Expr>) -> Expr { Expr::Reference(self).not_equals(rhs) }
    pub fn pow(self, rhs: impl Into<Expr>) -> Expr { Expr::Reference(self).pow(rhs) }
    pub fn at(self, i: impl Into<Expr>) -> Expr { Expr::Reference(self).at(i) }
    pub fn slice(self, start: impl Into<Expr>, stop: impl Into<Expr>) -> Expr {
        Expr::Reference(self).slice(start, stop)
    }
}

// --- Free functions ---

fn unary(op: Operation, x: impl Into<Expr>) -> Expr { Expr::op(op, vec![x.into()]) }

pub fn neg(x: impl Into<Expr>) -> Expr { unary(Operation::Neg, x) }
pub fn not(x: impl Into<Expr>) -> Expr { unary(Operation::Not, x) }
pub fn abs(x: impl Into<Expr>) -> Expr { unary(Operation::Abs, x) }
pub fn sin(x: impl Into<Expr>) -> Expr { unary(Operation::Sin, x) }
pub fn cos(x: impl Into<Expr>) -> Expr { unary(Operation::Cos, x) }
pub fn exp(x: impl Into<Expr>) -> Expr { unary(Operation::Exp, x) }
pub fn log(x: impl Into<Expr>) -> Expr { unary(Operation::Log, x) }
pub fn sqrt(x: impl Into<Expr>) -> Expr { unary(Operation::Sqrt, x) }
pub fn floor(x: impl Into<Expr>) -> Expr { unary(Operation::Floor, x) }
pub fn sum(x: impl Into<Expr>) -> Expr { unary(Operation::Sum, x) }
pub fn mean(x: impl Into<Expr>) -> Expr { unary(Operation::Mean, x) }
pub fn series_min(x: impl Into<Expr>) -> Expr { unary(Operation::SeriesMin, x) }
pub fn series_max(x: impl Into<Expr>) -> Expr { unary(Operation::SeriesMax, x) }

pub fn minimum(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    Expr::op(Operation::Minimum, vec![a.into(), b.into()])
}

pub fn maximum(a: impl Into<Expr>, b: impl Into<Expr>) -> Expr {
    Expr::op(Operation::Maximum, vec![a.into(), b.into()])
}

pub fn clip(x: impl Into<Expr>, low: impl Into<Expr>, high: impl Into<Expr>) -> Expr {
    Expr::op(Operation::Clip, vec![x.into(), low.into(), high.into()])
}

pub fn index(source: impl Into<Expr>, i: impl Into<Expr>) -> Expr {
    Expr::op(Operation::Index, vec![source.into(), i.into()])
}

pub fn slice(source: impl Into<Expr>, start: impl Into<Expr>, stop: impl Into<Expr>) -> Expr {
    Expr::op(Operation::Slice, vec![source.into(), start.into(), stop.into()])
}

/// Selects `values[k]` for the first `conditions[k]` that holds, zero if none does.
pub fn piecewise<V, C>(values: Vec<V>, conditions: Vec<C>) -> Result<Expr, GraphError>
where
    V: Into<Expr>,
    C: Into<Expr>,
{
    if values.len() != conditions.len() || values.is_empty() {
        return Err(GraphError::InvalidArgument {
            op: Operation::Piecewise.symbol().to_string(),
            detail: format!("{} value(s) for {} condition(s)", values.len(), conditions.len()),
        });
    }
    let children: Vec<Expr> = values
        .into_iter()
        .zip(conditions)
        .flat_map(|(v, c)| -> [Expr; 2] { [v.into(), c.into()] })
        .collect();
    Expr::apply(Operation::Piecewise, children)
}

/// Piecewise-linear lookup of `x` in the table `(xs, ys)`, clamped at both ends.
pub fn interpolate(x: impl Into<Expr>, xs: impl Into<Expr>, ys: impl Into<Expr>) -> Result<Expr, GraphError> {
    let (xs, ys) = (xs.into(), ys.into());
    if let (Expr::Constant(cx), Expr::Constant(cy)) = (&xs, &ys) {
        if cx.width() != cy.width() {
            return Err(GraphError::InvalidArgument {
                op: Operation::Interpolate.symbol().to_string(),
                detail: format!("{} x point(s) but {} y point(s)", cx.width(), cy.width()),
            });
        }
        if let Constant::Vector { values, .. } = cx {
            if values.windows(2).any(|w| w[0] > w[1]) {
                return Err(GraphError::InvalidArgument {
                    op: Operation::Interpolate.symbol().to_string(),
                    detail: "x points must be non-decreasing".to_string(),
                });
            }
        }
    }
    Expr::apply(Operation::Interpolate, vec![x.into(), xs, ys])
}

pub fn pulse(start: impl Into<Expr>, width: impl Into<Expr>) -> Expr {
    Expr::op(Operation::Pulse, vec![start.into(), width.into()])
}

pub fn repeated_pulse(start: impl Into<Expr>, interval: impl Into<Expr>) -> Expr {
    Expr::op(Operation::RepeatedPulse, vec![start.into(), interval.into()])
}

pub fn smooth(input: impl Into<Expr>, time: impl Into<Expr>) -> Expr {
    Expr::Composite(Composite::new(CompositeKind::Smooth, input.into(), time.into()))
}

pub fn delay1(input: impl Into<Expr>, time: impl Into<Expr>) -> Expr {
    Expr::Composite(Composite::new(CompositeKind::Delay1, input.into(), time.into()))
}

pub fn delay3(input: impl Into<Expr>, time: impl Into<Expr>) -> Expr {
    Expr::Composite(Composite::new(CompositeKind::Delay3, input.into(), time.into()))
}
