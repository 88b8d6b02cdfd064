//! Defines the error types raised while building expression trees and models.
use thiserror::Error;

/// A construction problem, detected when a tree is built or attached.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("operator '{op}' expects {expected} argument(s), got {actual}")]
    Arity { op: String, expected: String, actual: usize },
    #[error("shape mismatch in '{context}': {detail}")]
    ShapeMismatch { context: String, detail: String },
    #[error("a reference named '{0}' already exists in this model")]
    DuplicateName(String),
    #[error("invalid reference name '{0}'")]
    InvalidName(String),
    #[error("unknown reference '{0}'")]
    UnknownReference(String),
    #[error("'{name}' is a {actual}, expected {expected}")]
    WrongKind { name: String, expected: String, actual: String },
    #[error("'{reader}' reads metric '{metric}'; metrics are only available after the loop")]
    MetricInLoop { reader: String, metric: String },
    #[error("invalid argument for '{op}': {detail}")]
    InvalidArgument { op: String, detail: String },
    #[error("model '{0}' has unexpanded composite operators; call finalize() first")]
    NotFinalized(String),
}

/// A failure while reading the canonical text form. Parsing never touches the model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("unexpected end of input at position {position}")]
    UnexpectedEnd { position: usize },
    #[error("unexpected token '{token}' at position {position}")]
    UnexpectedToken { token: String, position: usize },
    #[error("unknown operator '{token}' at position {position}")]
    UnknownOperator { token: String, position: usize },
    #[error("unknown reference '{token}' at position {position}")]
    UnknownReference { token: String, position: usize },
    #[error("invalid number '{token}' at position {position}")]
    InvalidNumber { token: String, position: usize },
    #[error("at position {position}: {source}")]
    Graph {
        position: usize,
        #[source]
        source: GraphError,
    },
}

impl ParseError {
    pub fn position(&self) -> usize {
        match self {
            ParseError::UnexpectedEnd { position }
            | ParseError::UnexpectedToken { position, .. }
            | ParseError::UnknownOperator { position, .. }
            | ParseError::UnknownReference { position, .. }
            | ParseError::InvalidNumber { position, .. }
            | ParseError::Graph { position, .. } => *position,
        }
    }
}
