//! Defines `Expr`, a node of an equation tree, and the operator catalogue.
//!
//! A tree is an owned value: every reference slot in the model holds its own
//! `Expr`, and sharing a sub-expression between two slots means cloning it.
//! Cycles between references are never expressed inside a tree; they only
//! arise through stocks reading their flows at the previous timestep.

use super::composite::Composite;
use super::distribution::Distribution;
use super::error::GraphError;
use crate::compute::value::{Batch, Dtype};
use crate::store::RefId;

/// A literal value embedded in a tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Scalar { value: f64, dtype: Dtype },
    Vector { values: Vec<f64>, dtype: Dtype },
}

impl Constant {
    pub fn float(value: f64) -> Self { Constant::Scalar { value, dtype: Dtype::Float } }
    pub fn int(value: i64) -> Self { Constant::Scalar { value: value as f64, dtype: Dtype::Int } }
    pub fn bool(value: bool) -> Self {
        Constant::Scalar { value: if value { 1.0 } else { 0.0 }, dtype: Dtype::Bool }
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            Constant::Scalar { dtype, .. } | Constant::Vector { dtype, .. } => *dtype,
        }
    }

    pub fn width(&self) -> usize {
        match self {
            Constant::Scalar { .. } => 1,
            Constant::Vector { values, .. } => values.len(),
        }
    }

    /// Constants are shared by every sample, so the batch has a single row.
    pub fn to_batch(&self) -> Batch {
        match self {
            Constant::Scalar { value, dtype } => Batch::scalar(*value, *dtype),
            Constant::Vector { values, dtype } => Batch::row(values.clone(), *dtype),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Neg,
    Not,
    Abs,
    Sin,
    Cos,
    Exp,
    Log,
    Sqrt,
    Floor,
    Minimum,
    Maximum,
    Sum,
    Mean,
    SeriesMin,
    SeriesMax,
    /// `(index source i)`: one column of the source, per sample.
    Index,
    /// `(slice source start stop)`: a column range of the source.
    Slice,
    /// `(clip x low high)`
    Clip,
    /// Alternating `value, condition` pairs; the first true condition selects its value.
    Piecewise,
    /// `(interpolate x xs ys)`: piecewise-linear lookup, clamped at both ends.
    Interpolate,
    /// `(pulse start width)`: 1 while `start <= t < start + width`.
    Pulse,
    /// `(repeated_pulse start interval)`: 1 every `interval` steps from `start`.
    RepeatedPulse,
}

/// How many children an operation accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    /// One or more `value, condition` pairs.
    Pairs,
}

impl std::fmt::Display for Arity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{}", n),
            Arity::Pairs => write!(f, "an even number (>= 2) of"),
        }
    }
}

impl Operation {
    pub const ALL: [Operation; 36] = [
        Operation::Add,
        Operation::Sub,
        Operation::Mul,
        Operation::Div,
        Operation::Rem,
        Operation::Pow,
        Operation::Lt,
        Operation::Gt,
        Operation::Le,
        Operation::Ge,
        Operation::Eq,
        Operation::Ne,
        Operation::And,
        Operation::Or,
        Operation::Neg,
        Operation::Not,
        Operation::Abs,
        Operation::Sin,
        Operation::Cos,
        Operation::Exp,
        Operation::Log,
        Operation::Sqrt,
        Operation::Floor,
        Operation::Minimum,
        Operation::Maximum,
        Operation::Sum,
        Operation::Mean,
        Operation::SeriesMin,
        Operation::SeriesMax,
        Operation::Index,
        Operation::Slice,
        Operation::Clip,
        Operation::Piecewise,
        Operation::Interpolate,
        Operation::Pulse,
        Operation::RepeatedPulse,
    ];

    /// The name used in the canonical text form.
    pub fn symbol(&self) -> &'static str {
        match self {
            Operation::Add => "+",
            Operation::Sub => "-",
            Operation::Mul => "*",
            Operation::Div => "/",
            Operation::Rem => "%",
            Operation::Pow => "**",
            Operation::Lt => "<",
            Operation::Gt => ">",
            Operation::Le => "<=",
            Operation::Ge => ">=",
            Operation::Eq => "==",
            Operation::Ne => "!=",
            Operation::And => "&",
            Operation::Or => "|",
            Operation::Neg => "neg",
            Operation::Not => "not",
            Operation::Abs => "abs",
            Operation::Sin => "sin",
            Operation::Cos => "cos",
            Operation::Exp => "exp",
            Operation::Log => "log",
            Operation::Sqrt => "sqrt",
            Operation::Floor => "floor",
            Operation::Minimum => "minimum",
            Operation::Maximum => "maximum",
            Operation::Sum => "sum",
            Operation::Mean => "mean",
            Operation::SeriesMin => "series_min",
            Operation::SeriesMax => "series_max",
            Operation::Index => "index",
            Operation::Slice => "slice",
            Operation::Clip => "clip",
            Operation::Piecewise => "piecewise",
            Operation::Interpolate => "interpolate",
            Operation::Pulse => "pulse",
            Operation::RepeatedPulse => "repeated_pulse",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Operation> {
        Operation::ALL.iter().copied().find(|op| op.symbol() == symbol)
    }

    pub fn arity(&self) -> Arity {
        match self {
            Operation::Neg
            | Operation::Not
            | Operation::Abs
            | Operation::Sin
            | Operation::Cos
            | Operation::Exp
            | Operation::Log
            | Operation::Sqrt
            | Operation::Floor
            | Operation::Sum
            | Operation::Mean
            | Operation::SeriesMin
            | Operation::SeriesMax => Arity::Exact(1),
            Operation::Slice | Operation::Clip | Operation::Interpolate => Arity::Exact(3),
            Operation::Piecewise => Arity::Pairs,
            _ => Arity::Exact(2),
        }
    }

    pub fn check_arity(&self, actual: usize) -> Result<(), GraphError> {
        let ok = match self.arity() {
            Arity::Exact(n) => actual == n,
            Arity::Pairs => actual >= 2 && actual % 2 == 0,
        };
        if ok {
            Ok(())
        } else {
            Err(GraphError::Arity {
                op: self.symbol().to_string(),
                expected: self.arity().to_string(),
                actual,
            })
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Operation::Lt | Operation::Gt | Operation::Le | Operation::Ge | Operation::Eq | Operation::Ne
        )
    }

    /// Reductions collapse the trailing axis to width 1.
    pub fn is_reduction(&self) -> bool {
        matches!(self, Operation::Sum | Operation::Mean | Operation::SeriesMin | Operation::SeriesMax)
    }

    /// Operations whose value depends on the current timestep directly.
    pub fn reads_time(&self) -> bool {
        matches!(self, Operation::Pulse | Operation::RepeatedPulse)
    }

    /// Result dtype given the dtypes of the children.
    pub fn result_dtype(&self, children: &[Dtype]) -> Dtype {
        match self {
            Operation::Div
            | Operation::Mean
            | Operation::Sin
            | Operation::Cos
            | Operation::Exp
            | Operation::Log
            | Operation::Sqrt
            | Operation::Floor
            | Operation::Interpolate => Dtype::Float,
            Operation::Lt
            | Operation::Gt
            | Operation::Le
            | Operation::Ge
            | Operation::Eq
            | Operation::Ne
            | Operation::And
            | Operation::Or
            | Operation::Not => Dtype::Bool,
            Operation::Pulse | Operation::RepeatedPulse => Dtype::Int,
            Operation::Index | Operation::Slice => children.first().copied().unwrap_or_default(),
            Operation::Piecewise => Dtype::promote_all(children.iter().step_by(2).copied()),
            Operation::Clip => children.first().copied().unwrap_or_default(),
            _ => Dtype::promote_all(children.iter().copied()),
        }
    }
}

/// Whether a read observes the current value or the whole history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadKind {
    Current,
    History,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Read {
    pub id: RefId,
    pub kind: ReadKind,
}

/// A node of an equation tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant(Constant),
    /// The current value of a tracked reference.
    Reference(RefId),
    /// The full history of a tracked reference, as a `(samples, len)` view.
    Timeseries(RefId),
    Distribution(Distribution),
    Operator { op: Operation, children: Vec<Expr> },
    Composite(Composite),
}

impl Expr {
    /// Builds an operator node, rejecting a wrong number of children.
    pub fn apply(op: Operation, children: Vec<Expr>) -> Result<Expr, GraphError> {
        op.check_arity(children.len())?;
        Ok(Expr::Operator { op, children })
    }

    /// Builds an operator node whose arity is fixed by the caller.
    pub(crate) fn op(op: Operation, children: Vec<Expr>) -> Expr {
        debug_assert!(op.check_arity(children.len()).is_ok());
        Expr::Operator { op, children }
    }

    pub fn children(&self) -> &[Expr] {
        match self {
            Expr::Operator { children, .. } => children,
            Expr::Composite(c) => &c.inputs,
            _ => &[],
        }
    }

    pub fn is_leaf(&self) -> bool {
        !matches!(self, Expr::Operator { .. } | Expr::Composite(_))
    }

    /// Pre-order walk. A composite is walked through its expansion once it has one.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Operator { children, .. } => children.iter().for_each(|c| c.walk(f)),
            Expr::Composite(c) => match &c.expansion {
                Some(expansion) => expansion.walk(f),
                None => c.inputs.iter().for_each(|i| i.walk(f)),
            },
            _ => {}
        }
    }

    /// Visits every reference id in the tree, including composite inputs and expansions.
    pub(crate) fn for_each_ref_mut(&mut self, f: &mut impl FnMut(&mut RefId)) {
        match self {
            Expr::Reference(id) | Expr::Timeseries(id) => f(id),
            Expr::Operator { children, .. } => children.iter_mut().for_each(|c| c.for_each_ref_mut(f)),
            Expr::Composite(c) => {
                c.inputs.iter_mut().for_each(|i| i.for_each_ref_mut(f));
                if let Some(expansion) = c.expansion.as_mut() {
                    expansion.for_each_ref_mut(f);
                }
            }
            Expr::Constant(_) | Expr::Distribution(_) => {}
        }
    }

    /// All references this tree reads, in pre-order, without duplicates.
    pub fn reads(&self) -> Vec<Read> {
        let mut out: Vec<Read> = Vec::new();
        self.walk(&mut |node| {
            let read = match node {
                Expr::Reference(id) => Read { id: *id, kind: ReadKind::Current },
                Expr::Timeseries(id) => Read { id: *id, kind: ReadKind::History },
                _ => return,
            };
            if !out.contains(&read) {
                out.push(read);
            }
        });
        out
    }

    pub fn has_unexpanded_composite(&self) -> bool {
        let mut found = false;
        self.walk(&mut |node| {
            if let Expr::Composite(c) = node {
                found |= c.expansion.is_none();
            }
        });
        found
    }

    /// True when evaluation can depend on `t` without going through a reference.
    pub fn reads_time_directly(&self) -> bool {
        let mut found = false;
        self.walk(&mut |node| match node {
            Expr::Operator { op, .. } => found |= op.reads_time(),
            Expr::Distribution(d) => found |= d.per_timestep,
            _ => {}
        });
        found
    }
}
