use crate::compute::value::Dtype;
use crate::graph::Expr;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RefId(pub u32);

impl RefId {
    #[inline(always)]
    pub fn index(&self) -> usize { self.0 as usize }
    pub fn new(idx: usize) -> Self { Self(idx as u32) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefKind {
    Variable,
    Flow,
    Stock,
    Metric,
    Time,
}

impl RefKind {
    pub fn name(&self) -> &'static str {
        match self {
            RefKind::Variable => "Variable",
            RefKind::Flow => "Flow",
            RefKind::Stock => "Stock",
            RefKind::Metric => "Metric",
            RefKind::Time => "TimeRef",
        }
    }
}

/// Who created a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Origin {
    #[default]
    User,
    /// Synthesized when a raw expression was wired into a stock.
    Wiring,
    /// Hidden state of an expanded composite operator.
    Composite,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefMetadata {
    pub name: String,
    pub doc: Option<String>,
    pub group: Option<String>,
    pub color_group: Option<String>,
    pub implicit: bool,
    pub origin: Origin,
}

/// One of the expression slots a reference carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Equation,
    Min,
    Max,
    Init,
}

impl Slot {
    pub const ALL: [Slot; 4] = [Slot::Equation, Slot::Min, Slot::Max, Slot::Init];

    pub fn label(&self) -> &'static str {
        match self {
            Slot::Equation => "equation",
            Slot::Min => "min",
            Slot::Max => "max",
            Slot::Init => "init",
        }
    }
}

/// A named, model-scoped endpoint whose value is tracked across timesteps.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedRef {
    pub(crate) kind: RefKind,
    pub(crate) meta: RefMetadata,
    pub(crate) equation: Option<Expr>,
    pub(crate) min: Option<Expr>,
    pub(crate) max: Option<Expr>,
    pub(crate) init: Option<Expr>,
    pub(crate) extra_dim: Option<usize>,
    pub(crate) dtype: Option<Dtype>,
    // Stocks rarely carry more than a couple of flows per side.
    pub(crate) inflows: SmallVec<[RefId; 2]>,
    pub(crate) outflows: SmallVec<[RefId; 2]>,
}

impl TrackedRef {
    pub fn new(kind: RefKind, meta: RefMetadata) -> Self {
        Self {
            kind,
            meta,
            equation: None,
            min: None,
            max: None,
            init: None,
            extra_dim: None,
            dtype: None,
            inflows: SmallVec::new(),
            outflows: SmallVec::new(),
        }
    }

    pub fn kind(&self) -> RefKind { self.kind }
    pub fn name(&self) -> &str { &self.meta.name }
    pub fn meta(&self) -> &RefMetadata { &self.meta }
    pub fn equation(&self) -> Option<&Expr> { self.equation.as_ref() }
    pub fn min(&self) -> Option<&Expr> { self.min.as_ref() }
    pub fn max(&self) -> Option<&Expr> { self.max.as_ref() }
    pub fn init(&self) -> Option<&Expr> { self.init.as_ref() }
    pub fn extra_dim(&self) -> Option<usize> { self.extra_dim }
    pub fn declared_dtype(&self) -> Option<Dtype> { self.dtype }
    pub fn inflows(&self) -> &[RefId] { &self.inflows }
    pub fn outflows(&self) -> &[RefId] { &self.outflows }
    pub fn is_implicit(&self) -> bool { self.meta.implicit }

    /// Free references take their value from run bindings.
    pub fn is_free(&self) -> bool {
        matches!(self.kind, RefKind::Variable | RefKind::Flow) && self.equation.is_none()
    }

    pub fn slot(&self, slot: Slot) -> Option<&Expr> {
        match slot {
            Slot::Equation => self.equation.as_ref(),
            Slot::Min => self.min.as_ref(),
            Slot::Max => self.max.as_ref(),
            Slot::Init => self.init.as_ref(),
        }
    }

    pub(crate) fn slot_mut(&mut self, slot: Slot) -> &mut Option<Expr> {
        match slot {
            Slot::Equation => &mut self.equation,
            Slot::Min => &mut self.min,
            Slot::Max => &mut self.max,
            Slot::Init => &mut self.init,
        }
    }

    /// Every filled expression slot of the reference.
    pub fn slots(&self) -> impl Iterator<Item = (Slot, &Expr)> {
        Slot::ALL.into_iter().filter_map(move |s| self.slot(s).map(|e| (s, e)))
    }
}
