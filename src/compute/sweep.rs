//! Parameter sweeps: one run per binding set, executed in parallel.
//!
//! Each run owns its ledger and only borrows the model, so runs never
//! share mutable state. Results come back in the order of `sets`.

use super::bindings::Bindings;
use super::config::RunConfig;
use super::engine::Simulator;
use super::error::SimulationError;
use super::output::RunOutput;
use crate::store::Model;
use rayon::prelude::*;
use tracing::debug;

/// Runs `model` once per binding set. A failing run does not stop the others.
pub fn sweep(model: &Model, sets: &[Bindings], config: &RunConfig) -> Result<Vec<Result<RunOutput, SimulationError>>, SimulationError> {
    let simulator = Simulator::new(model)?;
    config.validate()?;
    debug!(model = %model.name(), runs = sets.len(), "sweep started");
    Ok(sets.par_iter().map(|bindings| simulator.run(bindings, config)).collect())
}

/// Runs the same bindings under `seeds.len()` different seeds.
pub fn sweep_seeds(model: &Model, bindings: &Bindings, seeds: &[u64], config: &RunConfig) -> Result<Vec<Result<RunOutput, SimulationError>>, SimulationError> {
    let simulator = Simulator::new(model)?;
    config.validate()?;
    Ok(seeds.par_iter().map(|&seed| simulator.run(bindings, &config.seed(seed))).collect())
}
