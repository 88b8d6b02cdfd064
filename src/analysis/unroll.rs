//! Scan-style views of a model for inference back-ends.
//!
//! A back-end that unrolls the loop itself needs, per reference, the
//! expression giving its value at t = 0 and the expression giving its value at
//! t >= 1. Observations tie metric values to measured data.

use super::topology::Schedule;
use crate::compute::{Bindings, RunOutput, SimulationError};
use crate::graph::{Expr, GraphError, Operation};
use crate::store::{Model, RefId, RefKind, TrackedRef};
use serde::{Deserialize, Serialize};

/// How one reference advances by a single timestep.
///
/// In a Stock's `step`, its own reference and the references to its flows
/// denote values at `t - 1`; everywhere else references denote values at `t`.
/// In a Stock's `initial`, its own reference denotes the unclamped start value.
#[derive(Debug, Clone, PartialEq)]
pub struct StepFunction {
    pub reference: RefId,
    pub name: String,
    pub kind: RefKind,
    pub initial: Expr,
    pub step: Expr,
}

/// Step functions for every in-loop reference, in step evaluation order.
pub fn unroll(model: &Model, bindings: &Bindings) -> Result<Vec<StepFunction>, SimulationError> {
    let overrides = bindings.resolve(model)?;
    let schedule = Schedule::build(model, &overrides)?;

    let mut steps = Vec::with_capacity(schedule.step.len());
    for id in schedule.step {
        let r = model
            .get(id)
            .ok_or_else(|| GraphError::UnknownReference(format!("#{}", id.0)))?;
        let main = overrides.get(&id).copied().or(r.equation()).cloned();

        let (initial, step) = match r.kind() {
            RefKind::Stock => {
                let initial = r.init().cloned().or(main).unwrap_or_else(|| Expr::from(0.0));
                let mut level = Expr::Reference(id);
                for &flow in r.inflows() {
                    level = level + flow;
                }
                for &flow in r.outflows() {
                    level = level - flow;
                }
                (initial, level)
            }
            _ => {
                let eq = main.ok_or_else(|| SimulationError::UnresolvedFreeVariable { name: r.name().to_string() })?;
                (eq.clone(), eq)
            }
        };

        steps.push(StepFunction {
            reference: id,
            name: r.name().to_string(),
            kind: r.kind(),
            initial: bounded(r, initial),
            step: bounded(r, step),
        });
    }
    Ok(steps)
}

fn bounded(r: &TrackedRef, value: Expr) -> Expr {
    let value = match r.min() {
        Some(min) => Expr::op(Operation::Maximum, vec![value, min.clone()]),
        None => value,
    };
    match r.max() {
        Some(max) => Expr::op(Operation::Minimum, vec![value, max.clone()]),
        None => value,
    }
}

/// Measured values of a Metric with Gaussian noise `sigma`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub metric: String,
    pub sigma: f64,
    pub observed: Vec<f64>,
}

impl Observation {
    pub fn new(metric: impl Into<String>, sigma: f64, observed: Vec<f64>) -> Self {
        Self { metric: metric.into(), sigma, observed }
    }

    /// Checks that the metric exists and the noise scale is usable.
    pub fn check(&self, model: &Model) -> Result<(), GraphError> {
        let id = model
            .id_of(&self.metric)
            .ok_or_else(|| GraphError::UnknownReference(self.metric.clone()))?;
        let kind = model.get(id).map(TrackedRef::kind);
        if kind != Some(RefKind::Metric) {
            return Err(GraphError::WrongKind {
                name: self.metric.clone(),
                expected: RefKind::Metric.name().to_string(),
                actual: kind.map(|k| k.name()).unwrap_or("?").to_string(),
            });
        }
        if !(self.sigma > 0.0 && self.sigma.is_finite()) {
            return Err(GraphError::InvalidArgument {
                op: "observation".to_string(),
                detail: format!("sigma must be positive, got {}", self.sigma),
            });
        }
        if self.observed.is_empty() {
            return Err(GraphError::InvalidArgument {
                op: "observation".to_string(),
                detail: "no observed values".to_string(),
            });
        }
        Ok(())
    }

    /// Gaussian log-likelihood of the observed values, one entry per sample.
    ///
    /// A width-1 metric is compared against every observed value; a wider
    /// metric must match the number of observed values column for column.
    pub fn log_likelihood(&self, output: &RunOutput) -> Result<Vec<f64>, SimulationError> {
        let series = output
            .get(&self.metric)
            .ok_or_else(|| GraphError::UnknownReference(self.metric.clone()))?;
        if series.width != 1 && series.width != self.observed.len() {
            return Err(SimulationError::ShapeMismatch {
                reference: self.metric.clone(),
                timestep: output.steps.saturating_sub(1),
                detail: format!("{} observed values for a metric of width {}", self.observed.len(), series.width),
            });
        }

        let norm = -(self.sigma * (2.0 * std::f64::consts::PI).sqrt()).ln();
        let per_sample = (0..series.samples())
            .map(|s| {
                let predicted = series.step(s, 0);
                self.observed
                    .iter()
                    .enumerate()
                    .map(|(i, obs)| {
                        let mu = predicted[if series.width == 1 { 0 } else { i }];
                        let z = (obs - mu) / self.sigma;
                        norm - 0.5 * z * z
                    })
                    .sum()
            })
            .collect();
        Ok(per_sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::RunConfig;
    use crate::store::RefSpec;

    fn tub() -> Model {
        let mut model = Model::new("tub");
        let water = model.attach("water", RefSpec::stock().init(10.0).min(0)).unwrap();
        let faucet = model.flow("faucet").unwrap();
        model.set_equation(faucet, 2.0).unwrap();
        let drain = model.flow("drain").unwrap();
        model.set_equation(drain, water * 0.5).unwrap();
        model.connect_inflow(water, faucet).unwrap();
        model.connect_outflow(water, drain).unwrap();
        model.metric("final_water", Expr::Timeseries(water).at(-1)).unwrap();
        model
    }

    #[test]
    fn test_stock_step_sums_its_flows() {
        let model = tub();
        let steps = unroll(&model, &Bindings::new()).unwrap();
        let water = steps.iter().find(|s| s.name == "water").unwrap();
        assert_eq!(model.render(&water.initial), "(maximum Scalar(10.0) Scalar(0))");
        assert_eq!(model.render(&water.step), "(maximum (- (+ water faucet) drain) Scalar(0))");

        let drain = steps.iter().find(|s| s.name == "drain").unwrap();
        assert_eq!(drain.initial, drain.step);
        assert!(steps.iter().all(|s| s.kind != RefKind::Metric));
    }

    #[test]
    fn test_unbound_free_variable_has_no_step_function() {
        let mut model = Model::new("free");
        model.free_variable("rate").unwrap();
        assert!(matches!(unroll(&model, &Bindings::new()), Err(SimulationError::UnresolvedFreeVariable { .. })));
        let steps = unroll(&model, &Bindings::new().with("rate", 0.3)).unwrap();
        assert_eq!(steps[0].step, Expr::from(0.3));
    }

    #[test]
    fn test_observation_checks_and_likelihood() {
        let mut model = tub();
        assert!(Observation::new("final_water", 1.0, vec![4.0]).check(&model).is_ok());
        assert!(Observation::new("water", 1.0, vec![4.0]).check(&model).is_err());
        assert!(Observation::new("final_water", 0.0, vec![4.0]).check(&model).is_err());

        let output = model.run(&Bindings::new(), &RunConfig::new().steps(40)).unwrap().clone();
        let settled = output["final_water"].at(0, 0);
        assert!((settled - 4.0).abs() < 1e-6);

        let near = Observation::new("final_water", 1.0, vec![settled]).log_likelihood(&output).unwrap();
        let far = Observation::new("final_water", 1.0, vec![settled + 3.0]).log_likelihood(&output).unwrap();
        assert_eq!(near.len(), 1);
        assert!(near[0] > far[0]);
        assert!((near[0] + 0.5 * (2.0 * std::f64::consts::PI).ln()).abs() < 1e-12);
    }
}
