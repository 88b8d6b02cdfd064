use super::error::SimulationError;
use serde::{Deserialize, Serialize};

/// Element count at which kernels start splitting work across rayon workers.
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 1 << 14;

/// Settings for one run. `steps` falls back to the model's own default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub steps: Option<usize>,
    pub samples: usize,
    pub seed: u64,
    pub parallel_threshold: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { steps: None, samples: 1, seed: 0, parallel_threshold: DEFAULT_PARALLEL_THRESHOLD }
    }
}

impl RunConfig {
    pub fn new() -> Self { Self::default() }

    pub fn steps(mut self, steps: usize) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn samples(mut self, samples: usize) -> Self {
        self.samples = samples;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.steps == Some(0) {
            return Err(SimulationError::Config("steps must be > 0".into()));
        }
        if self.samples == 0 {
            return Err(SimulationError::Config("samples must be > 0".into()));
        }
        if self.parallel_threshold == 0 {
            return Err(SimulationError::Config("parallel_threshold must be > 0".into()));
        }
        Ok(())
    }

    /// Steps for a run of a model whose default is `model_steps`.
    pub fn resolve_steps(&self, model_steps: usize) -> Result<usize, SimulationError> {
        match self.steps.unwrap_or(model_steps) {
            0 => Err(SimulationError::Config("steps must be > 0".into())),
            n => Ok(n),
        }
    }

    pub fn from_json(input: &str) -> Result<Self, SimulationError> {
        let config: RunConfig =
            serde_json::from_str(input).map_err(|e| SimulationError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
