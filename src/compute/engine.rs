use super::bindings::Bindings;
use super::config::RunConfig;
use super::error::{EvalError, SimulationError};
use super::eval::{EvalContext, Phase, RunParams};
use super::kernel::{self, flag, BinaryOp};
use super::ledger::Ledger;
use super::output::{RunOutput, Series};
use super::value::{Batch, Dtype};
use crate::analysis::topology::{static_variables, Schedule};
use crate::analysis::validator::Validator;
use crate::graph::{Expr, GraphError, ShapeInference};
use crate::store::{Model, RefId, RefKind, Slot, TrackedRef};
use indexmap::IndexMap;
use std::collections::HashMap;
use tracing::{info, trace};

/// Runs a finalized model. Borrows the model read-only, so several
/// simulators can share one model across threads.
pub struct Simulator<'a> {
    model: &'a Model,
}

/// Per-run state resolved before the timestep loop starts.
struct Plan<'b> {
    overrides: HashMap<RefId, &'b Expr>,
    schedule: Schedule,
    is_static: Vec<bool>,
    dtypes: Vec<Dtype>,
    params: RunParams,
}

impl<'a> Simulator<'a> {
    pub fn new(model: &'a Model) -> Result<Self, SimulationError> {
        if !model.is_finalized() {
            return Err(GraphError::NotFinalized(model.name().to_string()).into());
        }
        Validator::new(model).validate().map_err(SimulationError::Validation)?;
        Ok(Self { model })
    }

    pub fn run(&self, bindings: &Bindings, config: &RunConfig) -> Result<RunOutput, SimulationError> {
        let model = self.model;
        config.validate()?;
        let steps = config.resolve_steps(model.steps())?;
        let samples = config.samples;

        let overrides = bindings.resolve(model)?;
        for (id, r) in model.iter() {
            if r.is_free() && !overrides.contains_key(&id) {
                return Err(SimulationError::UnresolvedFreeVariable { name: r.name().to_string() });
            }
        }

        let shapes = ShapeInference::new(model).with_overrides(overrides.clone()).infer()?;
        let schedule = Schedule::build(model, &overrides)?;
        let is_static = static_variables(model, &overrides);

        let mut ledger = Ledger::new(samples, model.len());
        let mut dtypes = Vec::with_capacity(model.len());
        for (id, r) in model.iter() {
            let width = shapes.width(model, id)?;
            let dtype = match r.kind() {
                RefKind::Time => Dtype::Int,
                _ => r.declared_dtype().unwrap_or_else(|| shapes.dtype(id)),
            };
            let capacity = if r.kind() == RefKind::Metric { 1 } else { 2 * steps };
            ledger.allocate(id, width, capacity, dtype);
            dtypes.push(dtype);
        }

        let params = RunParams { steps, seed: config.seed, parallel_threshold: config.parallel_threshold };
        let plan = Plan { overrides, schedule, is_static, dtypes, params };

        info!(model = %model.name(), steps, samples, seed = config.seed, "run started");

        for t in 0..steps {
            trace!(t, "timestep");
            ledger
                .write(model.time(), t, &Batch::scalar(t as f64, Dtype::Int))
                .map_err(|e| SimulationError::lift(model.name_of(model.time()), t, e))?;

            let order = if t == 0 { &plan.schedule.initial } else { &plan.schedule.step };
            for &id in order {
                let value = self.step_value(&plan, &ledger, id, t)?;
                ledger.write(id, t, &value).map_err(|e| SimulationError::lift(model.name_of(id), t, e))?;
            }
        }

        let last = steps - 1;
        for &id in &plan.schedule.metrics {
            let value = self.metric_value(&plan, &ledger, id, last)?;
            ledger.write(id, 0, &value).map_err(|e| SimulationError::lift(model.name_of(id), last, e))?;
        }

        let output = self.collect(&plan, &ledger, bindings, config)?;
        info!(model = %model.name(), series = output.series.len(), "run finished");
        Ok(output)
    }

    /// Value of a Variable, Flow or Stock at `t`, clamped and cast.
    fn step_value(&self, plan: &Plan<'_>, ledger: &Ledger, id: RefId, t: usize) -> Result<Batch, SimulationError> {
        let r = self.tracked(id)?;
        let lift = |e: EvalError| SimulationError::lift(r.name(), t, e);
        let is_stock = r.kind() == RefKind::Stock;
        let ctx = |slot: Slot| {
            let ctx = EvalContext::new(ledger, plan.params, t, Phase::Step).owned_by(id, slot);
            if is_stock { ctx.stock_owner(None) } else { ctx }
        };

        if t > 0 && plan.is_static[id.index()] {
            return ledger.read(id, 0).map_err(lift);
        }

        let raw = match r.kind() {
            RefKind::Stock if t == 0 => match (r.init(), r.equation()) {
                (Some(init), _) => init.evaluate(&ctx(Slot::Init)),
                (None, Some(eq)) => eq.evaluate(&ctx(Slot::Equation)),
                (None, None) => Ok(Batch::scalar(0.0, plan.dtypes[id.index()])),
            },
            RefKind::Stock => self.accumulate(r, ledger, id, t, plan.params.parallel_threshold),
            _ => match plan.overrides.get(&id).copied().or(r.equation()) {
                Some(expr) => expr.evaluate(&ctx(Slot::Equation)),
                None => return Err(SimulationError::UnresolvedFreeVariable { name: r.name().to_string() }),
            },
        }
        .map_err(lift)?;

        // At t = 0 a Stock's bounds read its unclamped starting value.
        let initial = (is_stock && t == 0).then(|| raw.clone());
        let (min_ctx, max_ctx) = match &initial {
            Some(v) => (ctx(Slot::Min).stock_owner(Some(v)), ctx(Slot::Max).stock_owner(Some(v))),
            None => (ctx(Slot::Min), ctx(Slot::Max)),
        };
        self.finish(plan, r, id, raw, &min_ctx, &max_ctx).map_err(lift)
    }

    fn metric_value(&self, plan: &Plan<'_>, ledger: &Ledger, id: RefId, t: usize) -> Result<Batch, SimulationError> {
        let r = self.tracked(id)?;
        let lift = |e: EvalError| SimulationError::lift(r.name(), t, e);
        let ctx = |slot: Slot| EvalContext::new(ledger, plan.params, t, Phase::Post).owned_by(id, slot);

        let raw = match r.equation() {
            Some(eq) => eq.evaluate(&ctx(Slot::Equation)).map_err(lift)?,
            None => Batch::scalar(0.0, plan.dtypes[id.index()]),
        };
        self.finish(plan, r, id, raw, &ctx(Slot::Min), &ctx(Slot::Max)).map_err(lift)
    }

    /// stock[t] = stock[t-1] + Σ inflow[t-1] - Σ outflow[t-1]
    fn accumulate(&self, r: &TrackedRef, ledger: &Ledger, id: RefId, t: usize, threshold: usize) -> Result<Batch, EvalError> {
        let mut level = ledger.read(id, t - 1)?;
        let signed = r.inflows().iter().map(|f| (BinaryOp::Add, f)).chain(r.outflows().iter().map(|f| (BinaryOp::Sub, f)));
        for (op, &flow) in signed {
            let rate = ledger.read(flow, t - 1)?;
            let dtype = level.dtype().promote(rate.dtype());
            level = kernel::binary(op, &level, &rate, dtype, threshold)?;
        }
        Ok(level)
    }

    /// Projects `raw` into `[min, max]` and casts it to the stored dtype.
    fn finish(
        &self,
        plan: &Plan<'_>,
        r: &TrackedRef,
        id: RefId,
        raw: Batch,
        min_ctx: &EvalContext<'_>,
        max_ctx: &EvalContext<'_>,
    ) -> Result<Batch, EvalError> {
        let threshold = plan.params.parallel_threshold;
        let mut value = raw;
        if let Some(min) = r.min() {
            let bound = min.evaluate(min_ctx)?;
            let dtype = value.dtype().promote(bound.dtype());
            value = kernel::binary(BinaryOp::Max, &value, &bound, dtype, threshold)?;
        }
        if let Some(max) = r.max() {
            let bound = max.evaluate(max_ctx)?;
            let dtype = value.dtype().promote(bound.dtype());
            value = kernel::binary(BinaryOp::Min, &value, &bound, dtype, threshold)?;
        }

        let dtype = plan.dtypes[id.index()];
        Ok(match r.declared_dtype() {
            Some(Dtype::Int) => kernel::unary(&value, Dtype::Int, threshold, f64::trunc),
            Some(Dtype::Bool) => kernel::unary(&value, Dtype::Bool, threshold, |v| flag(v != 0.0)),
            _ => value.with_dtype(dtype),
        })
    }

    fn collect(&self, plan: &Plan<'_>, ledger: &Ledger, bindings: &Bindings, config: &RunConfig) -> Result<RunOutput, SimulationError> {
        let model = self.model;
        let steps = plan.params.steps;
        let mut series = IndexMap::with_capacity(model.len());
        for (id, r) in model.iter() {
            if r.kind() == RefKind::Time {
                continue;
            }
            let lift = |e: EvalError| SimulationError::lift(r.name(), steps - 1, e);
            let width = ledger.width(id).map_err(lift)?;
            let once = r.kind() == RefKind::Metric || plan.is_static[id.index()];
            let (data, per_step) = if once {
                (ledger.read(id, 0).map_err(lift)?.into_data(), None)
            } else {
                (ledger.series(id, steps).map_err(lift)?, Some(steps))
            };
            series.insert(
                r.name().to_string(),
                Series::new(r.kind(), plan.dtypes[id.index()], config.samples, per_step, width, data),
            );
        }

        Ok(RunOutput {
            model: model.name().to_string(),
            steps,
            samples: config.samples,
            seed: config.seed,
            series,
            bindings: bindings.iter().map(|(name, expr)| (name.to_string(), model.render(expr))).collect(),
        })
    }

    fn tracked(&self, id: RefId) -> Result<&'a TrackedRef, SimulationError> {
        self.model
            .get(id)
            .ok_or_else(|| GraphError::UnknownReference(format!("#{}", id.0)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ops::*;
    use crate::graph::Distribution;
    use crate::store::RefSpec;

    fn run(model: &mut Model, steps: usize) -> RunOutput {
        model.finalize().unwrap();
        Simulator::new(model).unwrap().run(&Bindings::new(), &RunConfig::new().steps(steps)).unwrap()
    }

    #[test]
    fn test_requires_finalized_model() {
        let mut model = Model::new("lazy");
        let x = model.variable("x", 1.0).unwrap();
        model.variable("s", smooth(x, 2)).unwrap();
        assert!(matches!(Simulator::new(&model), Err(SimulationError::Graph(GraphError::NotFinalized(_)))));
    }

    #[test]
    fn test_stock_accumulates_previous_flows() {
        let mut model = Model::new("tank");
        let tank = model.attach("tank", RefSpec::stock().init(5.0)).unwrap();
        let fill = model.variable("fill", 2.0).unwrap();
        model.connect_inflow(tank, fill * 1).unwrap();

        let output = run(&mut model, 4);
        assert_eq!(output["tank"].data, vec![5.0, 7.0, 9.0, 11.0]);
        assert_eq!(output["tank"].shape, vec![1, 4]);
        assert!(!output["fill"].per_step);
        assert_eq!(output["fill"].shape, vec![1]);
    }

    #[test]
    fn test_clamp_and_declared_dtype() {
        let mut model = Model::new("bounds");
        let t = model.time();
        model.attach("capped", RefSpec::variable().equation(t * 3).max(5)).unwrap();
        model.attach("whole", RefSpec::variable().equation(t / 2).dtype(Dtype::Int)).unwrap();
        model.attach("odd", RefSpec::variable().equation(t % 2).dtype(Dtype::Bool)).unwrap();

        let output = run(&mut model, 4);
        assert_eq!(output["capped"].data, vec![0.0, 3.0, 5.0, 5.0]);
        assert_eq!(output["whole"].data, vec![0.0, 0.0, 1.0, 1.0]);
        assert_eq!(output["whole"].dtype, Dtype::Int);
        assert_eq!(output["odd"].data, vec![0.0, 1.0, 0.0, 1.0]);
        assert_eq!(output["odd"].dtype, Dtype::Bool);
    }

    #[test]
    fn test_unbound_free_variable() {
        let mut model = Model::new("free");
        model.free_variable("rate").unwrap();
        model.finalize().unwrap();
        let err = Simulator::new(&model).unwrap().run(&Bindings::new(), &RunConfig::new()).unwrap_err();
        assert_eq!(err, SimulationError::UnresolvedFreeVariable { name: "rate".into() });

        let bound = Bindings::new().with("rate", 0.5);
        let output = Simulator::new(&model).unwrap().run(&bound, &RunConfig::new().steps(2)).unwrap();
        assert_eq!(output["rate"].data, vec![0.5]);
        assert_eq!(output.bindings["rate"], "Scalar(0.5)");
    }

    #[test]
    fn test_metric_reads_final_value() {
        let mut model = Model::new("metrics");
        let t = model.time();
        let v = model.variable("v", t * 2).unwrap();
        let total = model.metric("total", v.timeseries().sum()).unwrap();
        model.metric("last", v * 1).unwrap();
        model.metric("twice", total * 2).unwrap();

        let output = run(&mut model, 3);
        assert_eq!(output["total"].data, vec![6.0]);
        assert_eq!(output["last"].data, vec![4.0]);
        assert_eq!(output["twice"].data, vec![12.0]);
        assert_eq!(output["total"].shape, vec![1]);
    }

    #[test]
    fn test_per_sample_draws_are_seeded() {
        let mut model = Model::new("noise");
        model.variable("draw", Distribution::normal(0.0, 1.0)).unwrap();
        model.variable("step_draw", Distribution::normal(0.0, 1.0).per_timestep()).unwrap();
        model.finalize().unwrap();

        let config = RunConfig::new().steps(3).samples(4).seed(7);
        let sim = Simulator::new(&model).unwrap();
        let first = sim.run(&Bindings::new(), &config).unwrap();
        let second = sim.run(&Bindings::new(), &config).unwrap();
        assert_eq!(first, second);

        assert_eq!(first["draw"].shape, vec![4]);
        assert_eq!(first["step_draw"].shape, vec![4, 3]);
        let row = first["step_draw"].sample(0);
        assert!(row[0] != row[1] || row[1] != row[2]);

        let other = sim.run(&Bindings::new(), &config.seed(8)).unwrap();
        assert_ne!(first["draw"].data, other["draw"].data);
    }

    #[test]
    fn test_stock_bounded_by_its_own_previous_value() {
        let mut model = Model::new("ratchet");
        let s = model.attach("s", RefSpec::stock().init(1.0)).unwrap();
        model.set_max(s, s * 1.5).unwrap();
        model.connect_inflow(s, 10.0).unwrap();

        let output = run(&mut model, 4);
        assert_eq!(output["s"].data, vec![1.0, 1.5, 2.25, 3.375]);
    }

    #[test]
    fn test_stock_floor_reads_previous_step() {
        let mut model = Model::new("floor");
        let s = model.attach("s", RefSpec::stock().init(8.0)).unwrap();
        model.set_min(s, s - 1).unwrap();
        let drain = model.flow("drain").unwrap();
        model.set_equation(drain, 5.0).unwrap();
        model.connect_outflow(s, drain).unwrap();

        let output = run(&mut model, 4);
        assert_eq!(output["s"].data, vec![8.0, 7.0, 6.0, 5.0]);
    }

    #[test]
    fn test_runaway_slice_bounds_fail_at_their_timestep() {
        let mut model = Model::new("runaway");
        let t = model.time();
        let v = model.variable("v", vec![1, 2, 3, 4]).unwrap();
        model.variable("w", Expr::from(v).slice(t * -1e30, t * 1e30).sum()).unwrap();
        model.finalize().unwrap();

        let err = Simulator::new(&model).unwrap().run(&Bindings::new(), &RunConfig::new().steps(3)).unwrap_err();
        assert!(
            matches!(err, SimulationError::ShapeMismatch { ref reference, timestep: 1, .. } if reference == "w"),
            "{:?}",
            err
        );
    }

    #[test]
    fn test_width_mismatch_is_reported_with_reference_and_timestep() {
        let mut model = Model::new("wide");
        let a = model.attach("a", RefSpec::variable().equation(vec![1.0, 2.0, 3.0])).unwrap();
        let picked = model.free_variable("picked").unwrap();
        model.variable("mixed", a + picked).unwrap();
        model.finalize().unwrap();

        let bindings = Bindings::new().with("picked", vec![1.0, 2.0]);
        let err = Simulator::new(&model).unwrap().run(&bindings, &RunConfig::new()).unwrap_err();
        assert!(matches!(err, SimulationError::Graph(_) | SimulationError::ShapeMismatch { .. }));
    }
}
