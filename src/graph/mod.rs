//! Equation trees: nodes, operators, composites, distributions and their text form.
pub mod composite;
pub mod distribution;
pub mod error;
pub mod node;
pub mod ops;
pub mod shape;
pub mod text;

// Re-export key types for convenient access
pub use composite::{Composite, CompositeKind};
pub use distribution::{DistKind, Distribution};
pub use error::{GraphError, ParseError};
pub use node::{Arity, Constant, Expr, Operation, Read, ReadKind};
pub use shape::{Extent, ShapeInference, Shapes};
pub use text::NameLookup;
