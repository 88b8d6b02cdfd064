//! Composite operators (`smooth`, `delay1`, `delay3`) and their expansion.
//!
//! A composite carries its own hidden state. `Model::finalize` rewrites each
//! one into ordinary stocks and flows registered as implicit references, and
//! stores an expression reading the result. Evaluation then delegates to that
//! expansion.

use super::error::GraphError;
use super::node::{Expr, Operation};
use crate::store::{Model, Origin, RefId, RefKind, Slot};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompositeKind {
    /// First-order exponential smoothing of `input` over `time` steps.
    Smooth,
    /// First-order material delay.
    Delay1,
    /// Third-order material delay, three cascaded first-order stages.
    Delay3,
}

impl CompositeKind {
    pub const ALL: [CompositeKind; 3] = [CompositeKind::Smooth, CompositeKind::Delay1, CompositeKind::Delay3];

    pub fn symbol(&self) -> &'static str {
        match self {
            CompositeKind::Smooth => "smooth",
            CompositeKind::Delay1 => "delay1",
            CompositeKind::Delay3 => "delay3",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<CompositeKind> {
        CompositeKind::ALL.iter().copied().find(|k| k.symbol() == symbol)
    }
}

/// `inputs` is `[input, time]`.
#[derive(Debug, Clone)]
pub struct Composite {
    pub kind: CompositeKind,
    pub inputs: Vec<Expr>,
    pub(crate) expansion: Option<Box<Expr>>,
}

impl Composite {
    pub fn new(kind: CompositeKind, input: Expr, time: Expr) -> Self {
        Self { kind, inputs: vec![input, time], expansion: None }
    }

    pub fn expansion(&self) -> Option<&Expr> {
        self.expansion.as_deref()
    }

    pub fn is_expanded(&self) -> bool {
        self.expansion.is_some()
    }
}

// Expansion is derived state; two composites are equal when their inputs are.
impl PartialEq for Composite {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.inputs == other.inputs
    }
}

impl Model {
    /// Expands every composite operator into hidden stocks and flows.
    ///
    /// Idempotent: already expanded composites are left alone. Returns the number
    /// of composites expanded by this call.
    pub fn finalize(&mut self) -> Result<usize, GraphError> {
        let mut expanded = 0;
        let count = self.len();
        for idx in 0..count {
            let owner = RefId::new(idx);
            for slot in Slot::ALL {
                let Some(mut expr) = self.take_slot(owner, slot) else { continue };
                let result = self.expand_tree(owner, &mut expr, &mut expanded);
                self.restore_slot(owner, slot, expr);
                result?;
            }
        }
        if expanded > 0 {
            debug!(model = %self.name(), expanded, "composite operators expanded");
            self.invalidate();
        }
        Ok(expanded)
    }

    fn expand_tree(&mut self, owner: RefId, expr: &mut Expr, expanded: &mut usize) -> Result<(), GraphError> {
        match expr {
            Expr::Operator { children, .. } => {
                for child in children.iter_mut() {
                    self.expand_tree(owner, child, expanded)?;
                }
            }
            Expr::Composite(c) => {
                // Inner composites first, so hidden equations never hold unexpanded nodes.
                for input in c.inputs.iter_mut() {
                    self.expand_tree(owner, input, expanded)?;
                }
                if c.expansion.is_none() {
                    let result = self.expand_composite(owner, c.kind, &c.inputs)?;
                    c.expansion = Some(Box::new(result));
                    *expanded += 1;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn expand_composite(&mut self, owner: RefId, kind: CompositeKind, inputs: &[Expr]) -> Result<Expr, GraphError> {
        let [input, time] = inputs else {
            return Err(GraphError::Arity {
                op: kind.symbol().to_string(),
                expected: "2".to_string(),
                actual: inputs.len(),
            });
        };
        let base = format!("{}_{}", self.get(owner).map(|r| r.name().to_string()).unwrap_or_default(), kind.symbol());

        match kind {
            CompositeKind::Smooth => {
                // S[0] = input; S' = (input - S) / time
                let stock = self.hidden_stock(&base, input.clone())?;
                let gap = Expr::op(Operation::Sub, vec![input.clone(), Expr::Reference(stock)]);
                let rate = Expr::op(Operation::Div, vec![gap, time.clone()]);
                self.hidden_inflow(stock, rate)?;
                Ok(Expr::Reference(stock))
            }
            CompositeKind::Delay1 => {
                let outflow = self.delay_stage(&base, input.clone(), time.clone())?;
                Ok(Expr::Reference(outflow))
            }
            CompositeKind::Delay3 => {
                let stage_time = Expr::op(Operation::Div, vec![time.clone(), Expr::from(3)]);
                let mut carried = input.clone();
                for _ in 0..3 {
                    let outflow = self.delay_stage(&base, carried, stage_time.clone())?;
                    carried = Expr::Reference(outflow);
                }
                Ok(carried)
            }
        }
    }

    /// One first-order stage: S[0] = input * time, inflow = input, outflow = S / time.
    fn delay_stage(&mut self, base: &str, input: Expr, time: Expr) -> Result<RefId, GraphError> {
        let init = Expr::op(Operation::Mul, vec![input.clone(), time.clone()]);
        let stock = self.hidden_stock(base, init)?;
        self.hidden_inflow(stock, input)?;
        let drain = Expr::op(Operation::Div, vec![Expr::Reference(stock), time]);
        let outflow = self.connect_outflow(stock, drain)?;
        self.mark_hidden(outflow);
        Ok(outflow)
    }

    fn hidden_stock(&mut self, base: &str, init: Expr) -> Result<RefId, GraphError> {
        let name = self.indexed_name(base);
        let stock = self.register(&name, RefKind::Stock, Origin::Composite)?;
        *self.slot_of(stock, Slot::Init) = Some(init);
        Ok(stock)
    }

    fn hidden_inflow(&mut self, stock: RefId, rate: Expr) -> Result<RefId, GraphError> {
        let flow = self.connect_inflow(stock, rate)?;
        self.mark_hidden(flow);
        Ok(flow)
    }
}

#[cfg(test)]
mod tests {
    use crate::graph::ops::{delay1, delay3, smooth};
    use crate::graph::Expr;
    use crate::store::{Model, Origin, RefKind};

    #[test]
    fn test_smooth_expands_into_hidden_stock_and_flow() {
        let mut model = Model::new("smoothing");
        let x = model.variable("x", 10.0).unwrap();
        let s = model.variable("s", smooth(x, 4)).unwrap();

        assert_eq!(model.finalize().unwrap(), 1);

        let stock = model.id_of("s_smooth0").expect("hidden stock");
        let hidden = model.get(stock).unwrap();
        assert_eq!(hidden.kind(), RefKind::Stock);
        assert!(hidden.is_implicit());
        assert_eq!(hidden.meta().origin, Origin::Composite);
        assert_eq!(hidden.inflows().len(), 1);

        match model.get(s).unwrap().equation().unwrap() {
            Expr::Composite(c) => assert_eq!(c.expansion(), Some(&Expr::Reference(stock))),
            other => panic!("expected composite, got {:?}", other),
        }
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut model = Model::new("idem");
        let x = model.variable("x", 1.0).unwrap();
        model.variable("d", delay3(x, 6)).unwrap();

        assert_eq!(model.finalize().unwrap(), 1);
        let count = model.len();
        assert_eq!(model.finalize().unwrap(), 0);
        assert_eq!(model.len(), count);
    }

    #[test]
    fn test_nested_composites_expand_inner_first() {
        let mut model = Model::new("nested");
        let x = model.variable("x", 2.0).unwrap();
        let inner = delay1(x, 2);
        model.variable("y", smooth(inner, 3)).unwrap();

        assert_eq!(model.finalize().unwrap(), 2);
        assert!(model.is_finalized());
        assert!(model.id_of("y_delay10").is_some());
        assert!(model.id_of("y_smooth0").is_some());
    }
}
