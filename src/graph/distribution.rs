//! Random and enumerated leaves used to give free variables a value per sample.
//!
//! Draws are deterministic: the caller derives a stream id from the run seed,
//! the owning reference and (for per-timestep draws) the timestep, and every
//! draw is taken from a ChaCha8 stream seeded with it.

use super::error::GraphError;
use crate::compute::value::{Batch, Dtype};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

#[derive(Debug, Clone, PartialEq)]
pub enum DistKind {
    Normal { mean: f64, std: f64 },
    Uniform { low: f64, high: f64 },
    /// Inclusive on both ends.
    DiscreteUniform { low: i64, high: i64 },
    Bernoulli { p: f64 },
    /// Draws an index with the given (unnormalized) weights.
    Categorical { probs: Vec<f64> },
    /// Sample `i` takes `values[i % len]`.
    List { values: Vec<f64>, dtype: Dtype },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
    pub kind: DistKind,
    /// Draw a fresh value for every `(sample, timestep)` instead of once per sample.
    pub per_timestep: bool,
}

impl Distribution {
    pub fn new(kind: DistKind) -> Self { Self { kind, per_timestep: false } }

    pub fn normal(mean: f64, std: f64) -> Self { Self::new(DistKind::Normal { mean, std }) }
    pub fn uniform(low: f64, high: f64) -> Self { Self::new(DistKind::Uniform { low, high }) }
    pub fn discrete_uniform(low: i64, high: i64) -> Self {
        Self::new(DistKind::DiscreteUniform { low, high })
    }
    pub fn bernoulli(p: f64) -> Self { Self::new(DistKind::Bernoulli { p }) }
    pub fn categorical(probs: Vec<f64>) -> Self { Self::new(DistKind::Categorical { probs }) }
    pub fn list(values: Vec<f64>) -> Self {
        let dtype = if values.iter().all(|v| v.fract() == 0.0) { Dtype::Int } else { Dtype::Float };
        Self::new(DistKind::List { values, dtype })
    }

    pub fn per_timestep(mut self) -> Self {
        self.per_timestep = true;
        self
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            DistKind::Normal { .. } => "Normal",
            DistKind::Uniform { .. } => "Uniform",
            DistKind::DiscreteUniform { .. } => "DiscreteUniform",
            DistKind::Bernoulli { .. } => "Bernoulli",
            DistKind::Categorical { .. } => "Categorical",
            DistKind::List { .. } => "List",
        }
    }

    pub fn dtype(&self) -> Dtype {
        match &self.kind {
            DistKind::Normal { .. } | DistKind::Uniform { .. } => Dtype::Float,
            DistKind::DiscreteUniform { .. } | DistKind::Bernoulli { .. } | DistKind::Categorical { .. } => {
                Dtype::Int
            }
            DistKind::List { dtype, .. } => *dtype,
        }
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        let invalid = |detail: String| {
            Err(GraphError::InvalidArgument { op: self.name().to_string(), detail })
        };
        match &self.kind {
            DistKind::Normal { mean, std } => {
                if !mean.is_finite() || !std.is_finite() || *std < 0.0 {
                    return invalid(format!("std must be finite and >= 0, got {}", std));
                }
            }
            DistKind::Uniform { low, high } => {
                if !low.is_finite() || !high.is_finite() || low > high {
                    return invalid(format!("need low <= high, got [{}, {}]", low, high));
                }
            }
            DistKind::DiscreteUniform { low, high } => {
                if low > high {
                    return invalid(format!("need low <= high, got [{}, {}]", low, high));
                }
            }
            DistKind::Bernoulli { p } => {
                if !(0.0..=1.0).contains(p) {
                    return invalid(format!("p must lie in [0, 1], got {}", p));
                }
            }
            DistKind::Categorical { probs } => {
                let total: f64 = probs.iter().sum();
                if probs.is_empty() || probs.iter().any(|p| !p.is_finite() || *p < 0.0) || total <= 0.0 {
                    return invalid("weights must be non-negative with a positive sum".into());
                }
            }
            DistKind::List { values, .. } => {
                if values.is_empty() {
                    return invalid("list must not be empty".into());
                }
            }
        }
        Ok(())
    }

    /// Draws one value per sample as a `(samples, 1)` batch.
    pub fn draw(&self, samples: usize, stream: u64) -> Batch {
        let dtype = self.dtype();
        if let DistKind::List { values, .. } = &self.kind {
            let data = (0..samples).map(|i| values[i % values.len()]).collect();
            return Batch::column(data, dtype);
        }

        let mut rng = ChaCha8Rng::seed_from_u64(stream);
        let data = (0..samples)
            .map(|_| match &self.kind {
                DistKind::Normal { mean, std } => mean + std * box_muller(&mut rng),
                DistKind::Uniform { low, high } => low + (high - low) * rng.gen::<f64>(),
                DistKind::DiscreteUniform { low, high } => rng.gen_range(*low..=*high) as f64,
                DistKind::Bernoulli { p } => {
                    if rng.gen::<f64>() < *p { 1.0 } else { 0.0 }
                }
                DistKind::Categorical { probs } => categorical(probs, &mut rng),
                DistKind::List { .. } => unreachable!("handled above"),
            })
            .collect();
        Batch::column(data, dtype)
    }
}

/// Standard normal sample via Box-Muller.
fn box_muller(rng: &mut ChaCha8Rng) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(1e-300);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn categorical(probs: &[f64], rng: &mut ChaCha8Rng) -> f64 {
    let total: f64 = probs.iter().sum();
    let target = rng.gen::<f64>() * total;
    let mut acc = 0.0;
    for (i, p) in probs.iter().enumerate() {
        acc += p;
        if target < acc {
            return i as f64;
        }
    }
    (probs.len() - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_cycles_over_samples() {
        let d = Distribution::list(vec![2.0, 4.0, 6.0]);
        let batch = d.draw(5, 0);
        assert_eq!(batch.data(), &[2.0, 4.0, 6.0, 2.0, 4.0]);
        assert_eq!(batch.dtype(), Dtype::Int);
    }

    #[test]
    fn test_draws_are_deterministic_per_stream() {
        let d = Distribution::normal(10.0, 2.0);
        assert_eq!(d.draw(16, 42), d.draw(16, 42));
        assert_ne!(d.draw(16, 42), d.draw(16, 43));
    }

    #[test]
    fn test_discrete_uniform_is_inclusive() {
        let d = Distribution::discrete_uniform(2, 4);
        let batch = d.draw(500, 7);
        assert!(batch.data().iter().all(|v| (2.0..=4.0).contains(v)));
        assert!(batch.data().contains(&2.0));
        assert!(batch.data().contains(&4.0));
    }

    #[test]
    fn test_categorical_respects_zero_weights() {
        let d = Distribution::categorical(vec![0.0, 1.0, 0.0]);
        assert!(d.draw(50, 3).data().iter().all(|v| *v == 1.0));
    }

    #[test]
    fn test_validation_rejects_bad_parameters() {
        assert!(Distribution::normal(0.0, -1.0).validate().is_err());
        assert!(Distribution::uniform(2.0, 1.0).validate().is_err());
        assert!(Distribution::bernoulli(1.5).validate().is_err());
        assert!(Distribution::list(vec![]).validate().is_err());
        assert!(Distribution::categorical(vec![0.2, 0.8]).validate().is_ok());
    }
}
