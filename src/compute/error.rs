use crate::graph::{GraphError, ParseError};
use thiserror::Error;

/// Failure while evaluating a single tree. The engine lifts these into
/// `SimulationError` with the owning reference and timestep attached.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("{op}: shapes {left} and {right} do not broadcast")]
    Broadcast { op: String, left: String, right: String },
    #[error("{op}: {detail}")]
    Shape { op: String, detail: String },
    #[error("reference #{0} has no storage in this run")]
    MissingStorage(u32),
    #[error("composite '{0}' was not expanded; finalize the model first")]
    UnexpandedComposite(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimulationError {
    #[error("Cyclic dependency between: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Free variable '{name}' has no binding")]
    UnresolvedFreeVariable { name: String },

    #[error("Shape mismatch in '{reference}' at t={timestep}: {detail}")]
    ShapeMismatch { reference: String, timestep: usize, detail: String },

    #[error("Evaluation of '{reference}' failed at t={timestep}: {source}")]
    Evaluation {
        reference: String,
        timestep: usize,
        #[source]
        source: EvalError,
    },

    #[error("Binding for unknown reference '{name}'")]
    UnknownBinding { name: String },

    #[error("Invalid binding for '{name}': {reason}")]
    InvalidBinding { name: String, reason: String },

    #[error("Invalid run configuration: {0}")]
    Config(String),

    #[error("Model failed validation: {}", format_all(.0))]
    Validation(Vec<GraphError>),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

fn format_all(errors: &[GraphError]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

impl SimulationError {
    /// Attaches the owning reference and timestep to an evaluation failure.
    pub(crate) fn lift(reference: &str, timestep: usize, err: EvalError) -> Self {
        match err {
            EvalError::Broadcast { .. } | EvalError::Shape { .. } => SimulationError::ShapeMismatch {
                reference: reference.to_string(),
                timestep,
                detail: err.to_string(),
            },
            source => SimulationError::Evaluation { reference: reference.to_string(), timestep, source },
        }
    }
}
