//! Evaluation of equation trees against a run's history.

use super::error::EvalError;
use super::kernel::{self, flag, BinaryOp};
use super::ledger::Ledger;
use super::value::{broadcast_axis, resolve_position, slice_window, Batch, Dtype};
use crate::graph::{Expr, Operation};
use crate::store::{RefId, Slot};
use std::cell::Cell;

/// Which part of a run is evaluating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Inside the timestep loop.
    Step,
    /// After the loop, when metrics are evaluated.
    Post,
}

/// Run-wide settings shared by every evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunParams {
    pub steps: usize,
    pub seed: u64,
    pub parallel_threshold: usize,
}

/// Everything a tree needs to evaluate one slot of one reference at one timestep.
pub struct EvalContext<'a> {
    ledger: &'a Ledger,
    params: RunParams,
    t: usize,
    phase: Phase,
    owner: RefId,
    slot: Slot,
    stock_owner: bool,
    initial: Option<&'a Batch>,
    /// Distribution leaves seen so far in this evaluation; keeps their streams apart.
    occurrence: Cell<u32>,
}

impl<'a> EvalContext<'a> {
    pub fn new(ledger: &'a Ledger, params: RunParams, t: usize, phase: Phase) -> Self {
        Self {
            ledger,
            params,
            t,
            phase,
            owner: RefId(0),
            slot: Slot::Equation,
            stock_owner: false,
            initial: None,
            occurrence: Cell::new(0),
        }
    }

    pub fn owned_by(mut self, owner: RefId, slot: Slot) -> Self {
        self.owner = owner;
        self.slot = slot;
        self
    }

    /// Marks the owner as a Stock. Its reads of itself see the previous step,
    /// or `initial`, its unclamped starting value, at t = 0.
    pub fn stock_owner(mut self, initial: Option<&'a Batch>) -> Self {
        self.stock_owner = true;
        self.initial = initial;
        self
    }

    pub fn t(&self) -> usize { self.t }
    pub fn phase(&self) -> Phase { self.phase }
    pub fn samples(&self) -> usize { self.ledger.samples() }

    /// The slot a current-value read of `id` observes.
    fn read_slot(&self, id: RefId) -> Result<usize, EvalError> {
        match self.phase {
            Phase::Step if self.stock_owner && id == self.owner => Ok(self.t.saturating_sub(1)),
            Phase::Step => Ok(self.t),
            Phase::Post => {
                let last = self.ledger.capacity(id)?.saturating_sub(1);
                Ok(self.params.steps.saturating_sub(1).min(last))
            }
        }
    }

    /// Length of a timeseries view: the padded buffer inside the loop, exactly `steps` after it.
    fn view_len(&self) -> usize {
        match self.phase {
            Phase::Step => 2 * self.params.steps,
            Phase::Post => self.params.steps,
        }
    }

    fn next_stream(&self, per_timestep: bool) -> u64 {
        let occurrence = self.occurrence.get();
        self.occurrence.set(occurrence + 1);
        let slot = Slot::ALL.iter().position(|s| *s == self.slot).unwrap_or(0) as u64;
        let site = splitmix((u64::from(self.owner.0) << 32) | (slot << 24) | u64::from(occurrence));
        let step = if per_timestep { self.t as u64 } else { u64::MAX };
        splitmix(self.params.seed ^ site ^ splitmix(step))
    }
}

/// SplitMix64 finalizer.
fn splitmix(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

impl Expr {
    /// Evaluates the tree to a `(samples, width)` batch; unit axes broadcast.
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<Batch, EvalError> {
        match self {
            Expr::Constant(c) => Ok(c.to_batch()),
            Expr::Reference(id) => match ctx.initial {
                Some(initial) if ctx.t == 0 && ctx.stock_owner && *id == ctx.owner => Ok(initial.clone()),
                _ => ctx.ledger.read(*id, ctx.read_slot(*id)?),
            },
            Expr::Timeseries(id) => ctx.ledger.history(*id, ctx.view_len()),
            Expr::Distribution(d) => Ok(d.draw(ctx.samples(), ctx.next_stream(d.per_timestep))),
            Expr::Composite(c) => c
                .expansion()
                .ok_or(EvalError::UnexpandedComposite(c.kind.symbol()))?
                .evaluate(ctx),
            Expr::Operator { op, children } => {
                let args = children.iter().map(|c| c.evaluate(ctx)).collect::<Result<Vec<_>, _>>()?;
                apply(*op, &args, ctx)
            }
        }
    }
}

fn apply(op: Operation, args: &[Batch], ctx: &EvalContext<'_>) -> Result<Batch, EvalError> {
    let dtypes: Vec<Dtype> = args.iter().map(Batch::dtype).collect();
    let dtype = op.result_dtype(&dtypes);
    let threshold = ctx.params.parallel_threshold;
    let t = ctx.t as f64;

    let binary = |b: BinaryOp| kernel::binary(b, &args[0], &args[1], dtype, threshold);
    let unary = |f: fn(f64) -> f64| Ok(kernel::unary(&args[0], dtype, threshold, f));
    let reduce = |f: fn(&[f64]) -> f64| Ok(kernel::reduce_rows(&args[0], dtype, f));
    let all: Vec<&Batch> = args.iter().collect();

    match op {
        Operation::Add => binary(BinaryOp::Add),
        Operation::Sub => binary(BinaryOp::Sub),
        Operation::Mul => binary(BinaryOp::Mul),
        Operation::Div => binary(BinaryOp::Div),
        Operation::Rem => binary(BinaryOp::Rem),
        Operation::Pow => binary(BinaryOp::Pow),
        Operation::Lt => binary(BinaryOp::Lt),
        Operation::Gt => binary(BinaryOp::Gt),
        Operation::Le => binary(BinaryOp::Le),
        Operation::Ge => binary(BinaryOp::Ge),
        Operation::Eq => binary(BinaryOp::Eq),
        Operation::Ne => binary(BinaryOp::Ne),
        Operation::And => binary(BinaryOp::And),
        Operation::Or => binary(BinaryOp::Or),
        Operation::Minimum => binary(BinaryOp::Min),
        Operation::Maximum => binary(BinaryOp::Max),
        Operation::Neg => unary(|v| -v),
        Operation::Not => unary(|v| flag(v == 0.0)),
        Operation::Abs => unary(f64::abs),
        Operation::Sin => unary(f64::sin),
        Operation::Cos => unary(f64::cos),
        Operation::Exp => unary(f64::exp),
        Operation::Log => unary(f64::ln),
        Operation::Sqrt => unary(f64::sqrt),
        Operation::Floor => unary(f64::floor),
        Operation::Sum => reduce(|row: &[f64]| row.iter().sum()),
        Operation::Mean => reduce(|row: &[f64]| row.iter().sum::<f64>() / row.len() as f64),
        Operation::SeriesMin => reduce(|row: &[f64]| row.iter().copied().fold(f64::INFINITY, f64::min)),
        Operation::SeriesMax => reduce(|row: &[f64]| row.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        Operation::Index => eval_index(&args[0], &args[1], dtype),
        Operation::Slice => eval_slice(&args[0], &args[1], &args[2], dtype),
        Operation::Clip => kernel::map_n("clip", &all, dtype, threshold, |v| v[0].max(v[1]).min(v[2])),
        Operation::Piecewise => kernel::map_n("piecewise", &all, dtype, threshold, |v| {
            v.chunks(2).find(|pair| pair[1] != 0.0).map(|pair| pair[0]).unwrap_or(0.0)
        }),
        Operation::Interpolate => eval_interpolate(&args[0], &args[1], &args[2]),
        Operation::Pulse => kernel::map_n("pulse", &all, dtype, threshold, |v| flag(v[0] <= t && t < v[0] + v[1])),
        Operation::RepeatedPulse => kernel::map_n("repeated_pulse", &all, dtype, threshold, |v| {
            let (start, interval) = (v[0], v[1]);
            if t < start {
                0.0
            } else if interval <= 0.0 {
                flag(t == start)
            } else {
                flag((t - start) % interval == 0.0)
            }
        }),
    }
}

fn position(raw: f64, len: usize) -> Option<usize> {
    let i = resolve_position(raw, len);
    (0..len as i64).contains(&i).then_some(i as usize)
}

fn eval_index(source: &Batch, at: &Batch, dtype: Dtype) -> Result<Batch, EvalError> {
    if at.width() != 1 {
        return Err(EvalError::Shape {
            op: "index".to_string(),
            detail: format!("index must have width 1, found {}", at.width()),
        });
    }
    let samples = broadcast_axis(source.samples(), at.samples()).ok_or_else(|| EvalError::Broadcast {
        op: "index".to_string(),
        left: source.shape_label(),
        right: at.shape_label(),
    })?;
    let values = (0..samples)
        .map(|s| position(at.get(s, 0), source.width()).map(|i| source.get(s, i)).unwrap_or(0.0))
        .collect();
    Ok(Batch::column(values, dtype))
}

fn eval_slice(source: &Batch, start: &Batch, stop: &Batch, dtype: Dtype) -> Result<Batch, EvalError> {
    let len = source.width() as i64;
    let (start, width) = slice_window(start.get(0, 0), stop.get(0, 0), source.width())
        .map_err(|detail| EvalError::Shape { op: "slice".to_string(), detail })?;

    let mut data = Vec::with_capacity(source.samples() * width);
    for s in 0..source.samples() {
        for k in 0..width as i64 {
            let p = start.saturating_add(k);
            data.push(if (0..len).contains(&p) { source.get(s, p as usize) } else { 0.0 });
        }
    }
    Ok(Batch::new(source.samples(), width, dtype, data))
}

/// Piecewise-linear lookup of each `x` in the `(xs, ys)` table, clamped at both ends.
fn eval_interpolate(x: &Batch, xs: &Batch, ys: &Batch) -> Result<Batch, EvalError> {
    if xs.width() != ys.width() {
        return Err(EvalError::Shape {
            op: "interpolate".to_string(),
            detail: format!("table has {} x and {} y points", xs.width(), ys.width()),
        });
    }
    let samples = [xs.samples(), ys.samples()]
        .into_iter()
        .try_fold(x.samples(), broadcast_axis)
        .ok_or_else(|| EvalError::Broadcast {
            op: "interpolate".to_string(),
            left: x.shape_label(),
            right: xs.shape_label(),
        })?;

    let mut data = Vec::with_capacity(samples * x.width());
    for s in 0..samples {
        let (px, py) = (xs.sample_row(s), ys.sample_row(s));
        for c in 0..x.width() {
            data.push(lookup(x.get(s, c), px, py));
        }
    }
    Ok(Batch::new(samples, x.width(), Dtype::Float, data))
}

fn lookup(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    let (Some(&first), Some(&last)) = (xs.first(), xs.last()) else {
        return 0.0;
    };
    if x <= first {
        return ys[0];
    }
    if x >= last {
        return ys[ys.len() - 1];
    }
    let i = xs.partition_point(|p| *p <= x).saturating_sub(1);
    let (x0, x1, y0, y1) = (xs[i], xs[i + 1], ys[i], ys[i + 1]);
    if x1 == x0 {
        y0
    } else {
        y0 + (y1 - y0) * (x - x0) / (x1 - x0)
    }
}
