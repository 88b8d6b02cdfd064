//! The model registry: tracked references, their slots and persistence.
pub mod registry;
pub mod serial;
pub mod spec;
pub mod types;

pub use registry::{Model, TIME_NAME};
pub use serial::{ModelDocument, RefDocument, SerialError};
pub use spec::RefSpec;
pub use types::{Origin, RefId, RefKind, RefMetadata, Slot, TrackedRef};
