use crate::compute::SimulationError;
use crate::graph::{Expr, ReadKind};
use crate::store::{Model, RefId, RefKind};
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use std::collections::HashMap;
use tracing::debug;

/// Which evaluation order a dependency belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// t = 0: stocks read their `init` (or equation).
    Initial,
    /// t >= 1: stocks accumulate from the previous step and read nothing but their bounds.
    Step,
    /// After the loop: metrics only.
    Post,
}

/// Evaluation orders for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub initial: Vec<RefId>,
    pub step: Vec<RefId>,
    pub metrics: Vec<RefId>,
}

impl Schedule {
    /// Orders every reference for the three stages. `overrides` replaces the
    /// equations of bound references, since a binding can change what is read.
    pub fn build(model: &Model, overrides: &HashMap<RefId, &Expr>) -> Result<Schedule, SimulationError> {
        let in_loop: Vec<RefId> = model
            .iter()
            .filter(|(_, r)| !matches!(r.kind(), RefKind::Metric | RefKind::Time))
            .map(|(id, _)| id)
            .collect();
        let metrics: Vec<RefId> = model
            .iter()
            .filter(|(_, r)| r.kind() == RefKind::Metric)
            .map(|(id, _)| id)
            .collect();

        let schedule = Schedule {
            initial: sort(model, &in_loop, &|id| dependencies(model, id, Stage::Initial, overrides))?,
            step: sort(model, &in_loop, &|id| dependencies(model, id, Stage::Step, overrides))?,
            metrics: sort(model, &metrics, &|id| dependencies(model, id, Stage::Post, overrides))?,
        };
        debug!(
            model = model.name(),
            references = schedule.initial.len(),
            metrics = schedule.metrics.len(),
            "schedule built"
        );
        Ok(schedule)
    }
}

/// The expressions of `id` that are evaluated in `stage`.
pub fn stage_exprs<'a>(
    model: &'a Model,
    id: RefId,
    stage: Stage,
    overrides: &HashMap<RefId, &'a Expr>,
) -> Vec<&'a Expr> {
    let Some(r) = model.get(id) else { return Vec::new() };
    let main = match (r.kind(), stage) {
        (RefKind::Time, _) => return Vec::new(),
        (RefKind::Stock, Stage::Initial) => r.init().or(r.equation()),
        (RefKind::Stock, _) => None,
        _ => overrides.get(&id).copied().or(r.equation()),
    };
    main.into_iter().chain(r.min()).chain(r.max()).collect()
}

/// References `id` must wait for in `stage`.
///
/// Reads of `t` need no ordering, and neither does a reference reading its own
/// history. A Stock reading itself sees its previous step; any other reference
/// reading its own current value depends on itself.
pub fn dependencies(model: &Model, id: RefId, stage: Stage, overrides: &HashMap<RefId, &Expr>) -> Vec<RefId> {
    let is_stock = model.get(id).is_some_and(|r| r.kind() == RefKind::Stock);
    let mut deps: Vec<RefId> = Vec::new();
    for expr in stage_exprs(model, id, stage, overrides) {
        for read in expr.reads() {
            let Some(target) = model.get(read.id) else { continue };
            let wanted = match stage {
                Stage::Post => target.kind() == RefKind::Metric,
                _ => !matches!(target.kind(), RefKind::Metric | RefKind::Time),
            };
            let own_past = read.id == id && (read.kind == ReadKind::History || is_stock);
            if wanted && !own_past && !deps.contains(&read.id) {
                deps.push(read.id);
            }
        }
    }
    deps
}

/// Topological order of `members` via depth-first search, visiting in id order.
///
/// DFS keeps chains of dependent references adjacent in the order.
pub fn sort(
    model: &Model,
    members: &[RefId],
    deps: &dyn Fn(RefId) -> Vec<RefId>,
) -> Result<Vec<RefId>, SimulationError> {
    let mut order = Vec::with_capacity(members.len());
    let mut state = vec![VisitState::None; model.len()];

    for &id in members {
        if state[id.index()] == VisitState::None {
            if visit(id, deps, &mut state, &mut order).is_err() {
                return Err(SimulationError::CyclicDependency { cycle: find_cycle(model, members, deps) });
            }
        }
    }
    Ok(order)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    None,
    Visiting, // Used for cycle detection
    Visited,
}

fn visit(
    id: RefId,
    deps: &dyn Fn(RefId) -> Vec<RefId>,
    state: &mut [VisitState],
    order: &mut Vec<RefId>,
) -> Result<(), ()> {
    let idx = id.index();
    match state[idx] {
        VisitState::Visited => return Ok(()),
        VisitState::Visiting => return Err(()),
        VisitState::None => state[idx] = VisitState::Visiting,
    }

    for dep in deps(id) {
        visit(dep, deps, state, order)?;
    }

    state[idx] = VisitState::Visited;
    order.push(id);
    Ok(())
}

/// Names the references of one dependency cycle, in id order.
fn find_cycle(model: &Model, members: &[RefId], deps: &dyn Fn(RefId) -> Vec<RefId>) -> Vec<String> {
    let mut graph = DiGraph::<RefId, ()>::new();
    let nodes: HashMap<RefId, _> = members.iter().map(|&id| (id, graph.add_node(id))).collect();
    for &id in members {
        for dep in deps(id) {
            if let Some(&target) = nodes.get(&dep) {
                graph.add_edge(nodes[&id], target, ());
            }
        }
    }

    let cyclic = tarjan_scc(&graph).into_iter().find(|component| {
        component.len() > 1 || graph.contains_edge(component[0], component[0])
    });
    let mut ids: Vec<RefId> = cyclic.unwrap_or_default().into_iter().map(|n| graph[n]).collect();
    ids.sort_by_key(|id| id.0);
    ids.into_iter().map(|id| model.name_of(id).to_string()).collect()
}

/// Variables whose value cannot change over a run: they read no clock, draw
/// nothing per timestep, read no history and read only other static Variables.
pub fn static_variables(model: &Model, overrides: &HashMap<RefId, &Expr>) -> Vec<bool> {
    let mut is_static: Vec<bool> = model
        .iter()
        .map(|(id, r)| {
            r.kind() == RefKind::Variable
                && stage_exprs(model, id, Stage::Step, overrides)
                    .iter()
                    .all(|e| !e.reads_time_directly())
        })
        .collect();

    let mut changed = true;
    while changed {
        changed = false;
        for (id, _) in model.iter() {
            if !is_static[id.index()] {
                continue;
            }
            let keeps = stage_exprs(model, id, Stage::Step, overrides).iter().all(|e| {
                e.reads().iter().all(|read| {
                    read.kind == ReadKind::Current && read.id != id && is_static.get(read.id.index()).copied().unwrap_or(false)
                })
            });
            if !keeps {
                is_static[id.index()] = false;
                changed = true;
            }
        }
    }
    is_static
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ops::*;
    use crate::store::RefSpec;

    fn no_overrides() -> HashMap<RefId, &'static Expr> {
        HashMap::new()
    }

    #[test]
    fn test_sort_diamond_dependency() {
        // Shape: A -> B, A -> C, B+C -> D
        let mut model = Model::new("diamond");
        let a = model.variable("A", 1.0).unwrap();
        let b = model.variable("B", a + a).unwrap();
        let c = model.variable("C", a * 2).unwrap();
        let d = model.variable("D", b + c).unwrap();

        let schedule = Schedule::build(&model, &no_overrides()).unwrap();
        let pos = |id: RefId| schedule.step.iter().position(|&x| x == id).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(a) < pos(c));
        assert!(pos(b) < pos(d));
        assert!(pos(c) < pos(d));
    }

    #[test]
    fn test_flows_reading_each_other_form_a_cycle() {
        let mut model = Model::new("cycle");
        let f1 = model.flow("f1").unwrap();
        let f2 = model.flow("f2").unwrap();
        model.set_equation(f1, f2 + 1).unwrap();
        model.set_equation(f2, f1 * 2).unwrap();

        let err = Schedule::build(&model, &no_overrides()).unwrap_err();
        assert_eq!(err, SimulationError::CyclicDependency { cycle: vec!["f1".into(), "f2".into()] });
    }

    #[test]
    fn test_stock_breaks_the_loop_after_the_first_step() {
        let mut model = Model::new("loop");
        let stock = model.attach("pop", RefSpec::stock().init(10.0)).unwrap();
        let births = model.flow("births").unwrap();
        model.set_equation(births, stock * 0.1).unwrap();
        model.connect_inflow(stock, births).unwrap();

        let schedule = Schedule::build(&model, &no_overrides()).unwrap();
        let pos = |order: &[RefId], id: RefId| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(&schedule.initial, stock) < pos(&schedule.initial, births));
        assert!(pos(&schedule.step, stock) < pos(&schedule.step, births));
    }

    #[test]
    fn test_self_reads() {
        let mut model = Model::new("self");
        let running = model.variable("running", 0).unwrap();
        model.set_equation(running, running.timeseries().sum() + 1).unwrap();
        assert!(Schedule::build(&model, &no_overrides()).is_ok());

        let echo = model.variable("echo", 0).unwrap();
        model.set_equation(echo, echo + 1).unwrap();
        let err = Schedule::build(&model, &no_overrides()).unwrap_err();
        assert_eq!(err, SimulationError::CyclicDependency { cycle: vec!["echo".into()] });
    }

    #[test]
    fn test_stock_bounded_by_itself_has_no_self_edge() {
        let mut model = Model::new("ratchet");
        let s = model.attach("s", RefSpec::stock().init(1.0)).unwrap();
        model.set_max(s, s * 1.5).unwrap();
        model.set_min(s, s - 1).unwrap();
        for stage in [Stage::Initial, Stage::Step] {
            assert!(dependencies(&model, s, stage, &no_overrides()).is_empty());
        }
        assert!(Schedule::build(&model, &no_overrides()).is_ok());
    }

    #[test]
    fn test_metric_cycles_are_fatal() {
        let mut model = Model::new("metrics");
        let x = model.variable("x", 1.0).unwrap();
        let m1 = model.metric("m1", x.timeseries().sum()).unwrap();
        let m2 = model.metric("m2", m1 * 2).unwrap();
        let schedule = Schedule::build(&model, &no_overrides()).unwrap();
        assert_eq!(schedule.metrics, vec![m1, m2]);

        model.set_equation(m1, m2 + 1).unwrap();
        assert!(matches!(
            Schedule::build(&model, &no_overrides()),
            Err(SimulationError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_static_variables() {
        let mut model = Model::new("statics");
        let t = model.time();
        let base = model.variable("base", 3.0).unwrap();
        let scaled = model.variable("scaled", base * 2).unwrap();
        let clock = model.variable("clock", t + 0).unwrap();
        let mixed = model.variable("mixed", scaled + clock).unwrap();
        let noisy = model.variable("noisy", crate::graph::Distribution::normal(0.0, 1.0).per_timestep()).unwrap();
        let pulse_var = model.variable("pulsed", pulse(1, 2)).unwrap();

        let statics = static_variables(&model, &no_overrides());
        assert!(statics[base.index()]);
        assert!(statics[scaled.index()]);
        assert!(!statics[clock.index()]);
        assert!(!statics[mixed.index()]);
        assert!(!statics[noisy.index()]);
        assert!(!statics[pulse_var.index()]);
    }
}
