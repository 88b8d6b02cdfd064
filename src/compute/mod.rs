//! Runs models: evaluation, history storage, kernels and run outputs.
pub mod bindings;
pub mod config;
pub mod engine;
pub mod error;
pub mod eval;
pub mod kernel;
pub mod ledger;
pub mod output;
pub mod sweep;
pub mod value;

pub use bindings::Bindings;
pub use config::{RunConfig, DEFAULT_PARALLEL_THRESHOLD};
pub use engine::Simulator;
pub use error::{EvalError, SimulationError};
pub use eval::{EvalContext, Phase, RunParams};
pub use ledger::Ledger;
pub use output::{RunOutput, Series};
pub use sweep::{sweep, sweep_seeds};
pub use value::{Batch, Dtype};
