//! Structural checks and width/dtype inference over a whole model.
//!
//! Widths and dtypes are solved as a fixpoint: every reference starts at its
//! declared value (or the bottom of the lattice) and is re-inferred from its
//! expressions until nothing changes. Stock/flow loops therefore settle
//! without recursion guards, and results never depend on visit order.

use super::error::GraphError;
use super::node::{Constant, Expr, Operation};
use crate::compute::value::{broadcast_axis, slice_window, Dtype};
use crate::store::{Model, RefId, RefKind, Slot};
use std::collections::HashMap;

/// The trailing-axis extent of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    Fixed(usize),
    /// Known only at evaluation time (timeseries views, slices with computed bounds).
    Dynamic,
}

impl Extent {
    pub fn broadcast(self, other: Extent) -> Option<Extent> {
        match (self, other) {
            (Extent::Fixed(a), Extent::Fixed(b)) => broadcast_axis(a, b).map(Extent::Fixed),
            _ => Some(Extent::Dynamic),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Extent::Fixed(n) => n.to_string(),
            Extent::Dynamic => "dynamic".to_string(),
        }
    }
}

/// Inferred width and dtype of every reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Shapes {
    extents: Vec<Extent>,
    dtypes: Vec<Dtype>,
}

impl Shapes {
    pub fn extent(&self, id: RefId) -> Extent {
        self.extents.get(id.index()).copied().unwrap_or(Extent::Fixed(1))
    }

    pub fn dtype(&self, id: RefId) -> Dtype {
        self.dtypes.get(id.index()).copied().unwrap_or_default()
    }

    /// The concrete width of a reference; dynamic widths must be declared.
    pub fn width(&self, model: &Model, id: RefId) -> Result<usize, GraphError> {
        match self.extent(id) {
            Extent::Fixed(n) if n > 0 => Ok(n),
            other => Err(GraphError::ShapeMismatch {
                context: model.name_of(id).to_string(),
                detail: format!("width {} cannot be stored; declare extra_dim", other.label()),
            }),
        }
    }
}

pub struct ShapeInference<'a> {
    model: &'a Model,
    overrides: HashMap<RefId, &'a Expr>,
    extents: Vec<Extent>,
    dtypes: Vec<Dtype>,
}

impl<'a> ShapeInference<'a> {
    pub fn new(model: &'a Model) -> Self {
        let extents = model
            .iter()
            .map(|(_, r)| Extent::Fixed(r.extra_dim().unwrap_or(1)))
            .collect();
        let dtypes = model
            .iter()
            .map(|(_, r)| r.declared_dtype().unwrap_or(Dtype::Bool))
            .collect();
        Self { model, overrides: HashMap::new(), extents, dtypes }
    }

    /// Run bindings that replace the equations of free references.
    pub fn with_overrides(mut self, overrides: HashMap<RefId, &'a Expr>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn infer(mut self) -> Result<Shapes, GraphError> {
        // The lattices are shallow (1 -> n -> dynamic, bool -> int -> float),
        // so a handful of passes per reference always suffices.
        let model = self.model;
        let max_passes = 3 * model.len() + 3;
        for _ in 0..max_passes {
            let mut changed = false;
            for (id, _) in model.iter() {
                let extent = self.infer_ref_extent(id)?;
                let dtype = self.infer_ref_dtype(id)?;
                if extent != self.extents[id.index()] || dtype != self.dtypes[id.index()] {
                    self.extents[id.index()] = extent;
                    self.dtypes[id.index()] = dtype;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        Ok(Shapes { extents: self.extents, dtypes: self.dtypes })
    }

    fn equation_of(&self, id: RefId) -> Option<&'a Expr> {
        if let Some(e) = self.overrides.get(&id) {
            return Some(e);
        }
        self.model.get(id).and_then(|r| r.equation())
    }

    fn infer_ref_extent(&self, id: RefId) -> Result<Extent, GraphError> {
        let Some(r) = self.model.get(id) else {
            return Err(GraphError::UnknownReference(format!("#{}", id.0)));
        };
        let name = r.name();
        let mut parts: Vec<Extent> = Vec::new();
        match r.kind() {
            RefKind::Time => return Ok(Extent::Fixed(1)),
            RefKind::Stock => {
                if let Some(start) = r.init().or(r.equation()) {
                    parts.push(self.extent_of(name, start)?);
                }
                for flow in r.inflows().iter().chain(r.outflows()) {
                    parts.push(self.ref_extent(*flow)?);
                }
            }
            _ => {
                if let Some(eq) = self.equation_of(id) {
                    parts.push(self.extent_of(name, eq)?);
                }
            }
        }
        for bound in [r.min(), r.max()].into_iter().flatten() {
            parts.push(self.extent_of(name, bound)?);
        }

        let mut extent = Extent::Fixed(1);
        for part in parts {
            extent = extent.broadcast(part).ok_or_else(|| GraphError::ShapeMismatch {
                context: name.to_string(),
                detail: format!("widths {} and {} do not broadcast", extent.label(), part.label()),
            })?;
        }

        match (r.extra_dim(), extent) {
            (Some(declared), Extent::Fixed(n)) if n != 1 && n != declared => Err(GraphError::ShapeMismatch {
                context: name.to_string(),
                detail: format!("declared width {} but equations produce {}", declared, n),
            }),
            (Some(declared), _) => Ok(Extent::Fixed(declared)),
            (None, extent) => Ok(extent),
        }
    }

    fn ref_extent(&self, id: RefId) -> Result<Extent, GraphError> {
        self.extents
            .get(id.index())
            .copied()
            .ok_or_else(|| GraphError::UnknownReference(format!("#{}", id.0)))
    }

    /// Extent of a single tree under the current reference table.
    pub fn extent_of(&self, context: &str, expr: &Expr) -> Result<Extent, GraphError> {
        let mismatch = |detail: String| GraphError::ShapeMismatch { context: context.to_string(), detail };
        match expr {
            Expr::Constant(c) => Ok(Extent::Fixed(c.width())),
            Expr::Reference(id) => self.ref_extent(*id),
            Expr::Timeseries(id) => match self.ref_extent(*id)? {
                Extent::Fixed(1) => Ok(Extent::Dynamic),
                other => Err(mismatch(format!(
                    "timeseries of '{}' needs width 1, found {}",
                    self.model.name_of(*id),
                    other.label()
                ))),
            },
            Expr::Distribution(_) => Ok(Extent::Fixed(1)),
            Expr::Composite(c) => match c.expansion() {
                Some(expansion) => self.extent_of(context, expansion),
                None => self.broadcast_all(context, &c.inputs),
            },
            Expr::Operator { op, children } => {
                op.check_arity(children.len())?;
                let extents = children
                    .iter()
                    .map(|c| self.extent_of(context, c))
                    .collect::<Result<Vec<_>, _>>()?;
                match op {
                    _ if op.is_reduction() => Ok(Extent::Fixed(1)),
                    Operation::Index => match extents[1] {
                        Extent::Fixed(n) if n > 1 => Err(mismatch(format!("index must have width 1, found {}", n))),
                        _ => Ok(Extent::Fixed(1)),
                    },
                    Operation::Slice => slice_extent(extents[0], &children[1], &children[2]),
                    Operation::Interpolate => match (extents[1], extents[2]) {
                        (Extent::Fixed(a), Extent::Fixed(b)) if a != b => {
                            Err(mismatch(format!("interpolation table has {} x and {} y points", a, b)))
                        }
                        _ => Ok(extents[0]),
                    },
                    _ => self.broadcast_extents(context, &extents),
                }
            }
        }
    }

    fn broadcast_all(&self, context: &str, exprs: &[Expr]) -> Result<Extent, GraphError> {
        let extents = exprs
            .iter()
            .map(|e| self.extent_of(context, e))
            .collect::<Result<Vec<_>, _>>()?;
        self.broadcast_extents(context, &extents)
    }

    fn broadcast_extents(&self, context: &str, extents: &[Extent]) -> Result<Extent, GraphError> {
        let mut out = Extent::Fixed(1);
        for e in extents {
            out = out.broadcast(*e).ok_or_else(|| GraphError::ShapeMismatch {
                context: context.to_string(),
                detail: format!("widths {} and {} do not broadcast", out.label(), e.label()),
            })?;
        }
        Ok(out)
    }

    fn infer_ref_dtype(&self, id: RefId) -> Result<Dtype, GraphError> {
        let Some(r) = self.model.get(id) else {
            return Err(GraphError::UnknownReference(format!("#{}", id.0)));
        };
        if let Some(declared) = r.declared_dtype() {
            return Ok(declared);
        }
        match r.kind() {
            RefKind::Time => Ok(Dtype::Int),
            RefKind::Stock => {
                let mut parts = Vec::new();
                if let Some(start) = r.init().or(r.equation()) {
                    parts.push(self.dtype_of(start));
                }
                for flow in r.inflows().iter().chain(r.outflows()) {
                    parts.push(self.dtypes.get(flow.index()).copied().unwrap_or_default());
                }
                if parts.is_empty() {
                    Ok(Dtype::Float)
                } else {
                    Ok(Dtype::promote_all(parts))
                }
            }
            _ => Ok(self.equation_of(id).map(|e| self.dtype_of(e)).unwrap_or(Dtype::Float)),
        }
    }

    pub fn dtype_of(&self, expr: &Expr) -> Dtype {
        match expr {
            Expr::Constant(c) => c.dtype(),
            Expr::Reference(id) | Expr::Timeseries(id) => self.dtypes.get(id.index()).copied().unwrap_or_default(),
            Expr::Distribution(d) => d.dtype(),
            Expr::Composite(_) => Dtype::Float,
            Expr::Operator { op, children } => {
                let dtypes: Vec<Dtype> = children.iter().map(|c| self.dtype_of(c)).collect();
                op.result_dtype(&dtypes)
            }
        }
    }
}

/// Literal value of a scalar constant, if the bound is one.
fn literal_bound(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::Constant(Constant::Scalar { value, .. }) => Some(*value),
        Expr::Operator { op: Operation::Neg, children } => literal_bound(&children[0]).map(|v| -v),
        _ => None,
    }
}

/// Slices of a fixed-width source with literal bounds have a fixed width;
/// anything else is only known once the source is evaluated.
fn slice_extent(source: Extent, start: &Expr, stop: &Expr) -> Result<Extent, GraphError> {
    let (Extent::Fixed(len), Some(start), Some(stop)) = (source, literal_bound(start), literal_bound(stop)) else {
        return Ok(Extent::Dynamic);
    };
    let (_, width) =
        slice_window(start, stop, len).map_err(|detail| GraphError::InvalidArgument { op: "slice".to_string(), detail })?;
    Ok(Extent::Fixed(width))
}

/// Every structural problem in one tree: arity, unknown ids, invalid
/// distributions and metric reads from inside the loop.
pub fn check_structure(model: &Model, reader: &str, owner: RefKind, expr: &Expr) -> Vec<GraphError> {
    let mut errors = Vec::new();
    check_node(model, reader, owner, expr, &mut errors);
    errors
}

fn check_node(model: &Model, reader: &str, owner: RefKind, expr: &Expr, errors: &mut Vec<GraphError>) {
    match expr {
        Expr::Constant(c) => {
            if c.width() == 0 {
                errors.push(GraphError::ShapeMismatch {
                    context: "constant".to_string(),
                    detail: "vector constants need at least one element".to_string(),
                });
            }
        }
        Expr::Reference(id) | Expr::Timeseries(id) => match model.get(*id) {
            None => errors.push(GraphError::UnknownReference(format!("#{}", id.0))),
            Some(target) if target.kind() == RefKind::Metric && owner != RefKind::Metric => {
                errors.push(GraphError::MetricInLoop {
                    reader: reader.to_string(),
                    metric: target.name().to_string(),
                });
            }
            Some(_) => {}
        },
        Expr::Distribution(d) => {
            if let Err(e) = d.validate() {
                errors.push(e);
            }
        }
        Expr::Operator { op, children } => {
            if let Err(e) = op.check_arity(children.len()) {
                errors.push(e);
            }
            for child in children {
                check_node(model, reader, owner, child, errors);
            }
        }
        Expr::Composite(c) => {
            if c.inputs.len() != 2 {
                errors.push(GraphError::Arity {
                    op: c.kind.symbol().to_string(),
                    expected: "2".to_string(),
                    actual: c.inputs.len(),
                });
            }
            for input in &c.inputs {
                check_node(model, reader, owner, input, errors);
            }
        }
    }
}

/// Names every slot that still holds an unexpanded composite.
pub fn unexpanded_slots(model: &Model) -> Vec<(RefId, Slot)> {
    model
        .iter()
        .flat_map(|(id, r)| r.slots().filter(|(_, e)| e.has_unexpanded_composite()).map(move |(s, _)| (id, s)))
        .collect()
}
