//! Human-facing views of models and runs.
pub mod layout;
pub mod trace;

pub use layout::{Edge, Layout, LayoutEdge, LayoutNode};
pub use trace::format_trace;
