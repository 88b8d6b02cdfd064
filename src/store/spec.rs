use super::types::RefKind;
use crate::compute::value::Dtype;
use crate::graph::Expr;

/// Everything needed to attach a reference, built fluently:
/// `RefSpec::stock().init(100.0).max(500.0).doc("rabbits")`.
#[derive(Debug, Clone, PartialEq)]
pub struct RefSpec {
    pub(crate) kind: RefKind,
    pub(crate) equation: Option<Expr>,
    pub(crate) min: Option<Expr>,
    pub(crate) max: Option<Expr>,
    pub(crate) init: Option<Expr>,
    pub(crate) extra_dim: Option<usize>,
    pub(crate) dtype: Option<Dtype>,
    pub(crate) doc: Option<String>,
    pub(crate) group: Option<String>,
    pub(crate) color_group: Option<String>,
}

impl RefSpec {
    pub fn new(kind: RefKind) -> Self {
        Self {
            kind,
            equation: None,
            min: None,
            max: None,
            init: None,
            extra_dim: None,
            dtype: None,
            doc: None,
            group: None,
            color_group: None,
        }
    }

    pub fn variable() -> Self { Self::new(RefKind::Variable) }
    pub fn flow() -> Self { Self::new(RefKind::Flow) }
    pub fn stock() -> Self { Self::new(RefKind::Stock) }
    pub fn metric() -> Self { Self::new(RefKind::Metric) }

    pub fn equation(mut self, eq: impl Into<Expr>) -> Self {
        self.equation = Some(eq.into());
        self
    }

    pub fn min(mut self, min: impl Into<Expr>) -> Self {
        self.min = Some(min.into());
        self
    }

    pub fn max(mut self, max: impl Into<Expr>) -> Self {
        self.max = Some(max.into());
        self
    }

    /// Initial value; stocks only.
    pub fn init(mut self, init: impl Into<Expr>) -> Self {
        self.init = Some(init.into());
        self
    }

    pub fn extra_dim(mut self, dim: usize) -> Self {
        self.extra_dim = Some(dim);
        self
    }

    pub fn dtype(mut self, dtype: Dtype) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn color_group(mut self, color_group: impl Into<String>) -> Self {
        self.color_group = Some(color_group.into());
        self
    }
}
