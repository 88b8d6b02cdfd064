//! The central validator that walks every reference before a run.
use crate::graph::{shape, GraphError};
use crate::store::{Model, RefKind};

/// Collects every construction problem in a model instead of stopping at the first.
///
/// Attaching trees already rejects most problems one at a time; the validator
/// is the whole-model pass run before scheduling, and also covers models
/// assembled by `include` or loaded from documents.
pub struct Validator<'a> {
    model: &'a Model,
}

impl<'a> Validator<'a> {
    pub fn new(model: &'a Model) -> Self {
        Self { model }
    }

    /// # Returns
    /// - `Ok(())` if no problems are found.
    /// - `Err(Vec<GraphError>)` containing every problem discovered.
    pub fn validate(&self) -> Result<(), Vec<GraphError>> {
        let model = self.model;
        let mut errors = Vec::new();

        // Rules are local to one reference and its direct reads, so id order is enough.
        for (_, r) in model.iter() {
            for (_, expr) in r.slots() {
                errors.extend(shape::check_structure(model, r.name(), r.kind(), expr));
            }

            for &flow in r.inflows().iter().chain(r.outflows()) {
                match model.get(flow) {
                    None => errors.push(GraphError::UnknownReference(format!("#{}", flow.0))),
                    Some(f) if f.kind() != RefKind::Flow => errors.push(GraphError::WrongKind {
                        name: f.name().to_string(),
                        expected: RefKind::Flow.name().to_string(),
                        actual: f.kind().name().to_string(),
                    }),
                    Some(_) => {}
                }
            }
        }

        for (id, slot) in shape::unexpanded_slots(model) {
            errors.push(GraphError::NotFinalized(format!("{} ({})", model.name_of(id), slot.label())));
        }

        // Width conflicts only make sense once every tree is well formed.
        if errors.is_empty() {
            if let Err(e) = model.shapes() {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
