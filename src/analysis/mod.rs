//! Static analysis of models: scheduling, validation and unrolled views.
pub mod topology;
pub mod unroll;
pub mod validator;

pub use topology::{Schedule, Stage};
pub use unroll::{unroll, Observation, StepFunction};
pub use validator::Validator;
