//! JSON persistence of model definitions.
//!
//! Expressions are stored in their canonical text form, so a document is
//! readable and diffable. Hidden composite state is not stored: loading leaves
//! the composites unexpanded and `finalize` synthesizes it again.

use super::registry::Model;
use super::types::*;
use crate::compute::value::Dtype;
use crate::graph::{GraphError, ParseError};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerialError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cannot parse {slot} of '{reference}': {source}")]
    Parse {
        reference: String,
        slot: &'static str,
        #[source]
        source: ParseError,
    },
    #[error("Stock '{stock}' lists unknown flow '{flow}'")]
    UnknownFlow { stock: String, flow: String },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDocument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    pub steps: usize,
    pub refs: Vec<RefDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefDocument {
    pub name: String,
    pub kind: RefKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_dim: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<Dtype>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_group: Option<String>,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inflows: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outflows: Vec<String>,
}

impl Model {
    pub fn to_document(&self) -> ModelDocument {
        let stored = |id: &RefId| self.get(*id).is_some_and(|r| r.meta().origin != Origin::Composite);
        let names = |ids: &[RefId]| -> Vec<String> {
            ids.iter().filter(|id| stored(id)).map(|id| self.name_of(*id).to_string()).collect()
        };

        let refs = self
            .iter()
            .filter(|(id, r)| r.kind() != RefKind::Time && stored(id))
            .map(|(_, r)| RefDocument {
                name: r.name().to_string(),
                kind: r.kind(),
                equation: r.equation().map(|e| self.render(e)),
                min: r.min().map(|e| self.render(e)),
                max: r.max().map(|e| self.render(e)),
                init: r.init().map(|e| self.render(e)),
                extra_dim: r.extra_dim(),
                dtype: r.declared_dtype(),
                doc: r.meta().doc.clone(),
                group: r.meta().group.clone(),
                color_group: r.meta().color_group.clone(),
                origin: r.meta().origin,
                inflows: names(r.inflows()),
                outflows: names(r.outflows()),
            })
            .collect();

        ModelDocument { name: self.name().to_string(), doc: self.doc().map(str::to_string), steps: self.steps(), refs }
    }

    pub fn from_document(document: &ModelDocument) -> Result<Model, SerialError> {
        let mut model = Model::new(document.name.clone()).with_steps(document.steps);
        if let Some(doc) = &document.doc {
            model = model.with_doc(doc.clone());
        }

        // 1. Register every name first: equations may read references declared later.
        let mut ids = Vec::with_capacity(document.refs.len());
        for r in &document.refs {
            ids.push(model.register(&r.name, r.kind, r.origin)?);
        }

        // 2. Parse slots and restore metadata and wiring.
        for (r, &id) in document.refs.iter().zip(&ids) {
            let slots = [(Slot::Equation, &r.equation), (Slot::Min, &r.min), (Slot::Max, &r.max), (Slot::Init, &r.init)];
            for (slot, text) in slots {
                let Some(text) = text else { continue };
                let expr = model.parse(text).map_err(|source| SerialError::Parse {
                    reference: r.name.clone(),
                    slot: slot.label(),
                    source,
                })?;
                model.check_expr(&r.name, r.kind, &expr)?;
                model.restore_slot(id, slot, expr);
            }

            let flows = |list: &[String]| {
                list.iter()
                    .map(|flow| {
                        model.id_of(flow).ok_or_else(|| SerialError::UnknownFlow { stock: r.name.clone(), flow: flow.clone() })
                    })
                    .collect::<Result<SmallVec<[RefId; 2]>, _>>()
            };
            let inflows = flows(&r.inflows)?;
            let outflows = flows(&r.outflows)?;

            let tracked = model.get_mut(id)?;
            tracked.inflows = inflows;
            tracked.outflows = outflows;
            tracked.extra_dim = r.extra_dim;
            tracked.dtype = r.dtype;
            tracked.meta.doc = r.doc.clone();
            tracked.meta.group = r.group.clone();
            tracked.meta.color_group = r.color_group.clone();
        }

        model.shapes()?;
        Ok(model)
    }

    pub fn to_json(&self) -> Result<String, SerialError> {
        Ok(serde_json::to_string_pretty(&self.to_document())?)
    }

    pub fn from_json(input: &str) -> Result<Model, SerialError> {
        let document: ModelDocument = serde_json::from_str(input)?;
        Model::from_document(&document)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SerialError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Model, SerialError> {
        Model::from_json(&std::fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ops::*;
    use crate::store::RefSpec;

    fn tank_model() -> Model {
        let mut model = Model::new("tank").with_doc("a leaking tank").with_steps(5);
        let level = model.attach("level", RefSpec::stock().init(50.0).min(0.0).doc("water level")).unwrap();
        let leak = model.flow("leak").unwrap();
        model.set_equation(leak, smooth(level * 0.1, 2)).unwrap();
        model.chain(3.0, level, leak).unwrap();
        model
    }

    #[test]
    fn test_document_round_trip() {
        let model = tank_model();
        let json = model.to_json().unwrap();
        let loaded = Model::from_json(&json).unwrap();

        assert_eq!(loaded.to_document(), model.to_document());
        assert_eq!(loaded.steps(), 5);
        assert_eq!(loaded.doc(), Some("a leaking tank"));
        let level = loaded.id_of("level").unwrap();
        assert_eq!(loaded.get(level).unwrap().meta().doc.as_deref(), Some("water level"));
        assert!(loaded.get(loaded.id_of("level_in0").unwrap()).unwrap().is_implicit());
    }

    #[test]
    fn test_hidden_composite_state_is_not_stored() {
        let mut model = tank_model();
        model.finalize().unwrap();
        assert!(model.id_of("leak_smooth0").is_some());

        let document = model.to_document();
        assert!(document.refs.iter().all(|r| r.name != "leak_smooth0"));

        let mut loaded = Model::from_document(&document).unwrap();
        assert!(!loaded.is_finalized());
        loaded.finalize().unwrap();
        assert!(loaded.id_of("leak_smooth0").is_some());
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tank.json");
        let model = tank_model();
        model.save(&path).unwrap();
        let loaded = Model::load(&path).unwrap();
        assert_eq!(loaded.to_document(), model.to_document());
    }

    #[test]
    fn test_bad_equation_text_names_the_reference() {
        let json = r#"{"name": "m", "steps": 3, "refs": [{"name": "x", "kind": "Variable", "equation": "(+ y 1)"}]}"#;
        match Model::from_json(json) {
            Err(SerialError::Parse { reference, slot, .. }) => {
                assert_eq!(reference, "x");
                assert_eq!(slot, "equation");
            }
            other => panic!("expected parse error, got {:?}", other),
        }
    }
}
