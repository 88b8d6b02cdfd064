//! Run-time values for free references.

use super::error::SimulationError;
use crate::graph::Expr;
use crate::store::{Model, RefId, RefKind};
use indexmap::IndexMap;
use std::collections::HashMap;
use tracing::warn;

/// Named expressions that replace the equations of Variables and Flows for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    values: IndexMap<String, Expr>,
}

impl Bindings {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Expr>) -> Self {
        self.bind(name, value);
        self
    }

    /// Binds `name`, replacing any previous binding for it.
    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<Expr>) {
        self.values.insert(name.into(), value.into());
    }

    /// Binds `name` to an expression in canonical text form.
    pub fn bind_text(&mut self, model: &Model, name: impl Into<String>, text: &str) -> Result<(), SimulationError> {
        let expr = model.parse(text)?;
        self.bind(name, expr);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Expr> { self.values.get(name) }
    pub fn len(&self) -> usize { self.values.len() }
    pub fn is_empty(&self) -> bool { self.values.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Expr)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Checks every binding against `model` and keys them by reference id.
    pub(crate) fn resolve<'b>(&'b self, model: &Model) -> Result<HashMap<RefId, &'b Expr>, SimulationError> {
        let mut resolved = HashMap::with_capacity(self.values.len());
        for (name, expr) in &self.values {
            let id = model.id_of(name).ok_or_else(|| SimulationError::UnknownBinding { name: name.clone() })?;
            let invalid = |reason: String| SimulationError::InvalidBinding { name: name.clone(), reason };

            let Some(target) = model.get(id) else {
                return Err(SimulationError::UnknownBinding { name: name.clone() });
            };
            if !matches!(target.kind(), RefKind::Variable | RefKind::Flow) {
                return Err(invalid(format!("only Variables and Flows can be bound, '{}' is a {}", name, target.kind().name())));
            }
            if expr.has_unexpanded_composite() {
                return Err(invalid("composite operators cannot appear in bindings".into()));
            }
            model.check_expr(name, target.kind(), expr).map_err(|e| invalid(e.to_string()))?;

            if !target.is_free() {
                warn!(reference = %name, "binding overrides a defined equation");
            }
            resolved.insert(id, expr);
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Distribution;

    #[test]
    fn test_resolve_checks_targets() {
        let mut model = Model::new("m");
        let rate = model.free_variable("rate").unwrap();
        let level = model.stock("level").unwrap();
        model.metric("peak", level.timeseries().series_max()).unwrap();

        let ok = Bindings::new().with("rate", Distribution::uniform(0.0, 1.0));
        let resolved = ok.resolve(&model).unwrap();
        assert!(resolved.contains_key(&rate));

        let unknown = Bindings::new().with("missing", 1.0);
        assert_eq!(unknown.resolve(&model), Err(SimulationError::UnknownBinding { name: "missing".into() }));

        let stock = Bindings::new().with("level", 1.0);
        assert!(matches!(stock.resolve(&model), Err(SimulationError::InvalidBinding { .. })));

        let composite = Bindings::new().with("rate", crate::graph::ops::smooth(level, 3));
        assert!(matches!(composite.resolve(&model), Err(SimulationError::InvalidBinding { .. })));

        let metric_read = Bindings::new().with("rate", model.id_of("peak").unwrap());
        assert!(matches!(metric_read.resolve(&model), Err(SimulationError::InvalidBinding { .. })));
    }

    #[test]
    fn test_text_bindings() {
        let mut model = Model::new("m");
        model.free_variable("rate").unwrap();
        let mut bindings = Bindings::new();
        bindings.bind_text(&model, "rate", "Normal(0.0, 2.0)").unwrap();
        assert_eq!(bindings.get("rate"), Some(&Expr::from(Distribution::normal(0.0, 2.0))));
        assert!(bindings.bind_text(&model, "rate", "(+ nope 1)").is_err());
    }
}
