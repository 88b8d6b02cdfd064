use super::spec::RefSpec;
use super::types::*;
use crate::compute::{Bindings, RunConfig, RunOutput, SimulationError, Simulator};
use crate::graph::shape::{self, ShapeInference, Shapes};
use crate::graph::text::{self, NameLookup};
use crate::graph::{Expr, GraphError, ParseError};
use indexmap::IndexMap;

/// Name of the model's time reference.
pub const TIME_NAME: &str = "t";
const DEFAULT_STEPS: usize = 10;

/// A system-dynamics model: the registry of tracked references and their equations.
///
/// References live in a dense arena indexed by `RefId`; the model's `TimeRef`
/// is always `RefId(0)`. Every mutation invalidates the cached last run.
#[derive(Debug, Clone)]
pub struct Model {
    name: String,
    doc: Option<String>,
    steps: usize,
    refs: Vec<TrackedRef>,
    names: IndexMap<String, RefId>,
    last_run: Option<RunOutput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowSide {
    In,
    Out,
}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        let time = TrackedRef::new(
            RefKind::Time,
            RefMetadata { name: TIME_NAME.to_string(), ..Default::default() },
        );
        let mut names = IndexMap::new();
        names.insert(TIME_NAME.to_string(), RefId(0));
        Self {
            name: name.into(),
            doc: None,
            steps: DEFAULT_STEPS,
            refs: vec![time],
            names,
            last_run: None,
        }
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn doc(&self) -> Option<&str> { self.doc.as_deref() }
    pub fn steps(&self) -> usize { self.steps }
    pub fn len(&self) -> usize { self.refs.len() }
    pub fn is_empty(&self) -> bool { self.refs.len() <= 1 }
    pub fn last_run(&self) -> Option<&RunOutput> { self.last_run.as_ref() }

    pub fn set_steps(&mut self, steps: usize) {
        self.steps = steps;
        self.invalidate();
    }

    /// The model's time reference.
    pub fn time(&self) -> RefId { RefId(0) }

    pub fn get(&self, id: RefId) -> Option<&TrackedRef> { self.refs.get(id.index()) }

    pub fn id_of(&self, name: &str) -> Option<RefId> { self.names.get(name).copied() }

    pub fn name_of(&self, id: RefId) -> &str {
        self.get(id).map(|r| r.name()).unwrap_or("?")
    }

    pub fn iter(&self) -> impl Iterator<Item = (RefId, &TrackedRef)> {
        self.refs.iter().enumerate().map(|(i, r)| (RefId::new(i), r))
    }

    /// True once every composite operator has been expanded.
    pub fn is_finalized(&self) -> bool {
        shape::unexpanded_slots(self).is_empty()
    }

    // --- Construction ---

    pub fn attach(&mut self, name: &str, spec: RefSpec) -> Result<RefId, GraphError> {
        if spec.kind == RefKind::Time {
            return Err(GraphError::WrongKind {
                name: name.to_string(),
                expected: "Variable, Flow, Stock or Metric".to_string(),
                actual: RefKind::Time.name().to_string(),
            });
        }
        if spec.init.is_some() && spec.kind != RefKind::Stock {
            return Err(Self::init_not_allowed(name, spec.kind));
        }
        if spec.extra_dim == Some(0) {
            return Err(GraphError::InvalidArgument { op: "extra_dim".into(), detail: "must be >= 1".into() });
        }
        Self::validate_name(name)?;
        if self.names.contains_key(name) {
            return Err(GraphError::DuplicateName(name.to_string()));
        }
        for expr in [&spec.equation, &spec.min, &spec.max, &spec.init].into_iter().flatten() {
            self.check_expr(name, spec.kind, expr)?;
        }

        let id = self.register(name, spec.kind, Origin::User)?;
        let r = &mut self.refs[id.index()];
        r.equation = spec.equation;
        r.min = spec.min;
        r.max = spec.max;
        r.init = spec.init;
        r.extra_dim = spec.extra_dim;
        r.dtype = spec.dtype;
        r.meta.doc = spec.doc;
        r.meta.group = spec.group;
        r.meta.color_group = spec.color_group;

        if let Err(e) = self.shapes() {
            self.refs.pop();
            self.names.pop();
            return Err(e);
        }
        self.invalidate();
        Ok(id)
    }

    pub fn variable(&mut self, name: &str, equation: impl Into<Expr>) -> Result<RefId, GraphError> {
        self.attach(name, RefSpec::variable().equation(equation))
    }

    /// A variable whose value comes from run bindings.
    pub fn free_variable(&mut self, name: &str) -> Result<RefId, GraphError> {
        self.attach(name, RefSpec::variable())
    }

    /// A flow declared now and defined later with `set_equation`.
    pub fn flow(&mut self, name: &str) -> Result<RefId, GraphError> {
        self.attach(name, RefSpec::flow())
    }

    pub fn stock(&mut self, name: &str) -> Result<RefId, GraphError> {
        self.attach(name, RefSpec::stock())
    }

    pub fn metric(&mut self, name: &str, equation: impl Into<Expr>) -> Result<RefId, GraphError> {
        self.attach(name, RefSpec::metric().equation(equation))
    }

    pub fn set_equation(&mut self, id: RefId, equation: impl Into<Expr>) -> Result<(), GraphError> {
        self.set_slot(id, Slot::Equation, equation.into())
    }

    pub fn set_min(&mut self, id: RefId, min: impl Into<Expr>) -> Result<(), GraphError> {
        self.set_slot(id, Slot::Min, min.into())
    }

    pub fn set_max(&mut self, id: RefId, max: impl Into<Expr>) -> Result<(), GraphError> {
        self.set_slot(id, Slot::Max, max.into())
    }

    pub fn set_init(&mut self, id: RefId, init: impl Into<Expr>) -> Result<(), GraphError> {
        self.set_slot(id, Slot::Init, init.into())
    }

    pub fn set_extra_dim(&mut self, id: RefId, dim: usize) -> Result<(), GraphError> {
        if dim == 0 {
            return Err(GraphError::InvalidArgument { op: "extra_dim".into(), detail: "must be >= 1".into() });
        }
        let previous = self.get_mut(id)?.extra_dim.replace(dim);
        if let Err(e) = self.shapes() {
            self.refs[id.index()].extra_dim = previous;
            return Err(e);
        }
        self.invalidate();
        Ok(())
    }

    pub fn set_doc(&mut self, id: RefId, doc: impl Into<String>) -> Result<(), GraphError> {
        self.get_mut(id)?.meta.doc = Some(doc.into());
        Ok(())
    }

    fn set_slot(&mut self, id: RefId, slot: Slot, expr: Expr) -> Result<(), GraphError> {
        let r = self.get(id).ok_or_else(|| GraphError::UnknownReference(format!("#{}", id.0)))?;
        if r.kind() == RefKind::Time {
            return Err(GraphError::WrongKind {
                name: r.name().to_string(),
                expected: "Variable, Flow, Stock or Metric".to_string(),
                actual: RefKind::Time.name().to_string(),
            });
        }
        if slot == Slot::Init && r.kind() != RefKind::Stock {
            return Err(Self::init_not_allowed(r.name(), r.kind()));
        }
        self.check_expr(r.name(), r.kind(), &expr)?;

        let previous = self.refs[id.index()].slot_mut(slot).replace(expr);
        if let Err(e) = self.shapes() {
            *self.refs[id.index()].slot_mut(slot) = previous;
            return Err(e);
        }
        self.invalidate();
        Ok(())
    }

    // --- Stock wiring ---

    /// Adds an inflow to `stock`. A flow reference is wired directly; any other
    /// expression is wrapped in an implicit flow named `<stock>_in<index>`.
    pub fn connect_inflow(&mut self, stock: RefId, source: impl Into<Expr>) -> Result<RefId, GraphError> {
        self.connect(stock, source.into(), FlowSide::In)
    }

    /// Adds an outflow to `stock`, synthesizing `<stock>_out<index>` when needed.
    pub fn connect_outflow(&mut self, stock: RefId, sink: impl Into<Expr>) -> Result<RefId, GraphError> {
        self.connect(stock, sink.into(), FlowSide::Out)
    }

    /// `inflow >> stock >> outflow`
    pub fn chain(
        &mut self,
        inflow: impl Into<Expr>,
        stock: RefId,
        outflow: impl Into<Expr>,
    ) -> Result<(RefId, RefId), GraphError> {
        let i = self.connect_inflow(stock, inflow)?;
        let o = self.connect_outflow(stock, outflow)?;
        Ok((i, o))
    }

    fn connect(&mut self, stock: RefId, expr: Expr, side: FlowSide) -> Result<RefId, GraphError> {
        let target = self.get(stock).ok_or_else(|| GraphError::UnknownReference(format!("#{}", stock.0)))?;
        if target.kind() != RefKind::Stock {
            return Err(GraphError::WrongKind {
                name: target.name().to_string(),
                expected: RefKind::Stock.name().to_string(),
                actual: target.kind().name().to_string(),
            });
        }

        let flow = match expr {
            Expr::Reference(id) if self.get(id).map(|r| r.kind()) == Some(RefKind::Flow) => id,
            expr => {
                let (suffix, index) = match side {
                    FlowSide::In => ("in", target.inflows().len()),
                    FlowSide::Out => ("out", target.outflows().len()),
                };
                let name = self.unique_name(&format!("{}_{}{}", target.name(), suffix, index));
                self.check_expr(&name, RefKind::Flow, &expr)?;
                let id = self.register(&name, RefKind::Flow, Origin::Wiring)?;
                self.refs[id.index()].equation = Some(expr);
                id
            }
        };

        let r = &mut self.refs[stock.index()];
        let list = match side {
            FlowSide::In => &mut r.inflows,
            FlowSide::Out => &mut r.outflows,
        };
        if !list.contains(&flow) {
            list.push(flow);
        }
        self.invalidate();
        Ok(flow)
    }

    // --- Names ---

    /// `base` if free, otherwise `base_1`, `base_2`, ...
    pub fn unique_name(&self, base: &str) -> String {
        let mut candidate = base.to_string();
        let mut counter = 1;
        while self.names.contains_key(&candidate) {
            candidate = format!("{}_{}", base, counter);
            counter += 1;
        }
        candidate
    }

    /// First free `base0`, `base1`, ...
    pub(crate) fn indexed_name(&self, base: &str) -> String {
        (0..)
            .map(|k| format!("{}{}", base, k))
            .find(|candidate| !self.names.contains_key(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    fn validate_name(name: &str) -> Result<(), GraphError> {
        let mut chars = name.chars();
        let valid_start = chars.next().is_some_and(|c| c.is_alphabetic() || c == '_');
        let valid_rest = chars.all(|c| c.is_alphanumeric() || c == '_' || c == '.');
        if valid_start && valid_rest && !matches!(name, "true" | "false") {
            Ok(())
        } else {
            Err(GraphError::InvalidName(name.to_string()))
        }
    }

    fn init_not_allowed(name: &str, kind: RefKind) -> GraphError {
        GraphError::InvalidArgument {
            op: "init".into(),
            detail: format!("'{}' is a {}; only stocks take an initial value", name, kind.name()),
        }
    }

    // --- Internal access ---

    pub(crate) fn register(&mut self, name: &str, kind: RefKind, origin: Origin) -> Result<RefId, GraphError> {
        Self::validate_name(name)?;
        if self.names.contains_key(name) {
            return Err(GraphError::DuplicateName(name.to_string()));
        }
        let id = RefId::new(self.refs.len());
        let meta = RefMetadata {
            name: name.to_string(),
            implicit: origin != Origin::User,
            origin,
            ..Default::default()
        };
        self.refs.push(TrackedRef::new(kind, meta));
        self.names.insert(name.to_string(), id);
        Ok(id)
    }

    pub(crate) fn get_mut(&mut self, id: RefId) -> Result<&mut TrackedRef, GraphError> {
        self.refs
            .get_mut(id.index())
            .ok_or_else(|| GraphError::UnknownReference(format!("#{}", id.0)))
    }

    pub(crate) fn slot_of(&mut self, id: RefId, slot: Slot) -> &mut Option<Expr> {
        self.refs[id.index()].slot_mut(slot)
    }

    pub(crate) fn take_slot(&mut self, id: RefId, slot: Slot) -> Option<Expr> {
        self.refs.get_mut(id.index()).and_then(|r| r.slot_mut(slot).take())
    }

    pub(crate) fn restore_slot(&mut self, id: RefId, slot: Slot, expr: Expr) {
        if let Some(r) = self.refs.get_mut(id.index()) {
            *r.slot_mut(slot) = Some(expr);
        }
    }

    pub(crate) fn mark_hidden(&mut self, id: RefId) {
        if let Some(r) = self.refs.get_mut(id.index()) {
            r.meta.implicit = true;
            r.meta.origin = Origin::Composite;
        }
    }

    pub(crate) fn invalidate(&mut self) {
        self.last_run = None;
    }

    // --- Checks ---

    /// Rejects trees with structural problems before they enter the model.
    pub fn check_expr(&self, reader: &str, kind: RefKind, expr: &Expr) -> Result<(), GraphError> {
        match shape::check_structure(self, reader, kind, expr).into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Widths and dtypes of every reference.
    pub fn shapes(&self) -> Result<Shapes, GraphError> {
        ShapeInference::new(self).infer()
    }

    pub fn parse(&self, src: &str) -> Result<Expr, ParseError> {
        text::parse(src, self)
    }

    pub fn render(&self, expr: &Expr) -> String {
        text::render(expr, self)
    }

    // --- Composition ---

    /// Copies every reference of `sub` into this model as `prefix.name`.
    ///
    /// The submodel's time reference maps onto this model's. Returns the new id
    /// of each copied reference, keyed by its name inside `sub`.
    pub fn include(&mut self, prefix: &str, sub: &Model) -> Result<IndexMap<String, RefId>, GraphError> {
        Self::validate_name(prefix)?;
        let renamed = |r: &TrackedRef| format!("{}.{}", prefix, r.name());

        // 1. Check every name up front so a failure leaves the model untouched.
        for (_, r) in sub.iter().filter(|(_, r)| r.kind() != RefKind::Time) {
            let name = renamed(r);
            if self.names.contains_key(&name) {
                return Err(GraphError::DuplicateName(name));
            }
        }

        // 2. Register names and build the id mapping.
        let mut mapping = vec![self.time(); sub.len()];
        let mut added = IndexMap::new();
        for (id, r) in sub.iter().filter(|(_, r)| r.kind() != RefKind::Time) {
            let new_id = self.register(&renamed(r), r.kind(), r.meta().origin)?;
            mapping[id.index()] = new_id;
            added.insert(r.name().to_string(), new_id);
        }

        // 3. Copy definitions with remapped ids.
        let remap = |id: RefId| mapping.get(id.index()).copied().unwrap_or(id);
        for (id, r) in sub.iter().filter(|(_, r)| r.kind() != RefKind::Time) {
            let mut copy = r.clone();
            copy.meta.name = renamed(r);
            if copy.meta.group.is_none() {
                copy.meta.group = Some(prefix.to_string());
            }
            for slot in Slot::ALL {
                if let Some(expr) = copy.slot_mut(slot).as_mut() {
                    expr.for_each_ref_mut(&mut |rid| *rid = remap(*rid));
                }
            }
            copy.inflows = copy.inflows.iter().map(|f| remap(*f)).collect();
            copy.outflows = copy.outflows.iter().map(|f| remap(*f)).collect();
            self.refs[mapping[id.index()].index()] = copy;
        }

        self.invalidate();
        Ok(added)
    }

    // --- Running ---

    /// Finalizes, runs and caches the result as the model's last run.
    pub fn run(&mut self, bindings: &Bindings, config: &RunConfig) -> Result<&RunOutput, SimulationError> {
        self.finalize()?;
        let output = Simulator::new(self)?.run(bindings, config)?;
        Ok(self.last_run.insert(output))
    }
}

impl NameLookup for Model {
    fn name_of_id(&self, id: RefId) -> Option<&str> {
        self.get(id).map(|r| r.name())
    }

    fn id_of_name(&self, name: &str) -> Option<RefId> {
        self.id_of(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ops::*;
    use crate::graph::Extent;

    #[test]
    fn test_time_reference_is_registered_first() {
        let model = Model::new("m");
        assert_eq!(model.id_of("t"), Some(RefId(0)));
        assert_eq!(model.get(model.time()).unwrap().kind(), RefKind::Time);
        assert!(model.is_empty());
    }

    #[test]
    fn test_duplicate_and_invalid_names_are_rejected() {
        let mut model = Model::new("m");
        model.variable("rate", 0.1).unwrap();
        assert_eq!(model.variable("rate", 0.2), Err(GraphError::DuplicateName("rate".into())));
        assert_eq!(model.variable("t", 0.2), Err(GraphError::DuplicateName("t".into())));
        assert!(matches!(model.variable("2fast", 1), Err(GraphError::InvalidName(_))));
        assert!(matches!(model.variable("a b", 1), Err(GraphError::InvalidName(_))));
    }

    #[test]
    fn test_unique_name_counter() {
        let mut model = Model::new("m");
        model.variable("x", 1).unwrap();
        model.variable("x_1", 1).unwrap();
        assert_eq!(model.unique_name("x"), "x_2");
        assert_eq!(model.unique_name("y"), "y");
    }

    #[test]
    fn test_wiring_synthesizes_implicit_flows() {
        let mut model = Model::new("m");
        let stock = model.stock("tank").unwrap();
        let drain = model.flow("drain").unwrap();
        let (inflow, outflow) = model.chain(5.0, stock, drain).unwrap();

        assert_eq!(model.name_of(inflow), "tank_in0");
        assert_eq!(outflow, drain);
        let implicit = model.get(inflow).unwrap();
        assert!(implicit.is_implicit());
        assert_eq!(implicit.meta().origin, Origin::Wiring);
        assert_eq!(model.get(stock).unwrap().inflows(), &[inflow]);

        // A non-flow reference is wrapped too.
        let rate = model.variable("rate", 2.0).unwrap();
        let wrapped = model.connect_inflow(stock, rate).unwrap();
        assert_eq!(model.name_of(wrapped), "tank_in1");
    }

    #[test]
    fn test_wiring_into_a_non_stock_fails() {
        let mut model = Model::new("m");
        let v = model.variable("v", 1.0).unwrap();
        assert!(matches!(model.connect_inflow(v, 1.0), Err(GraphError::WrongKind { .. })));
    }

    #[test]
    fn test_init_is_reserved_for_stocks() {
        let mut model = Model::new("m");
        let v = model.variable("v", 1.0).unwrap();
        assert!(model.set_init(v, 3.0).is_err());
        assert!(model.attach("f", RefSpec::flow().init(1.0)).is_err());
    }

    #[test]
    fn test_equations_may_be_defined_later() {
        let mut model = Model::new("m");
        let a = model.flow("a").unwrap();
        let b = model.variable("b", a * 2).unwrap();
        assert!(model.get(a).unwrap().is_free());
        assert!(model.set_equation(a, vec![1, 2]).is_ok());
        assert_eq!(model.shapes().unwrap().extent(b), Extent::Fixed(2));
        let pair = model.variable("pair", vec![1.0, 2.0]).unwrap();
        let err = model.set_equation(a, Expr::from(pair) + vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, GraphError::ShapeMismatch { .. }));
        // The failed edit leaves the previous equation in place.
        assert_eq!(model.get(a).unwrap().equation(), Some(&Expr::from(vec![1, 2])));
        assert!(!model.get(a).unwrap().is_free());
    }

    #[test]
    fn test_include_prefixes_names_and_shares_time() {
        let mut sub = Model::new("sub");
        let s = sub.attach("level", RefSpec::stock().init(1.0)).unwrap();
        let t = sub.time();
        sub.connect_inflow(s, t * 2).unwrap();

        let mut parent = Model::new("parent");
        let added = parent.include("tank", &sub).unwrap();
        let level = added["level"];
        assert_eq!(parent.name_of(level), "tank.level");

        let inflow = parent.get(level).unwrap().inflows()[0];
        assert_eq!(parent.name_of(inflow), "tank.level_in0");
        assert_eq!(parent.render(parent.get(inflow).unwrap().equation().unwrap()), "(* t Scalar(2))");
        assert_eq!(parent.get(level).unwrap().meta().group.as_deref(), Some("tank"));

        assert!(matches!(parent.include("tank", &sub), Err(GraphError::DuplicateName(_))));
    }

    #[test]
    fn test_parse_resolves_model_names() {
        let mut model = Model::new("m");
        let rate = model.variable("rate", 0.5).unwrap();
        let parsed = model.parse("(* rate (sin t))").unwrap();
        assert_eq!(parsed, rate * sin(model.time()));
    }
}
