use stockflow_core::analysis::{unroll, Observation};
use stockflow_core::display::{format_trace, Layout};
use stockflow_core::graph::{Arity, Composite, CompositeKind, Operation};
use stockflow_core::prelude::*;

fn run(model: &mut Model, config: RunConfig) -> RunOutput {
    model.run(&Bindings::new(), &config).unwrap().clone()
}

fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len(), "{:?} vs {:?}", actual, expected);
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-9, "{:?} vs {:?}", actual, expected);
    }
}

#[test]
fn clamped_stock_does_not_conserve() {
    let mut model = Model::new("clamp");
    let s1 = model.attach("s1", RefSpec::stock().init(100.0)).unwrap();
    let s2 = model.attach("s2", RefSpec::stock().max(10)).unwrap();
    let f1 = model.flow("f1").unwrap();
    model.set_equation(f1, 20).unwrap();
    model.connect_outflow(s1, f1).unwrap();
    model.connect_inflow(s2, f1).unwrap();

    let output = run(&mut model, RunConfig::new().steps(3));
    assert_eq!(output["s1"].data, vec![100.0, 80.0, 60.0]);
    assert_eq!(output["f1"].data, vec![20.0, 20.0, 20.0]);
    assert_eq!(output["s2"].data, vec![0.0, 10.0, 10.0]);
}

#[test]
fn list_distribution_cycles_over_samples() {
    let mut model = Model::new("list");
    model.variable("v", Distribution::list(vec![2.0, 4.0, 6.0])).unwrap();
    let output = run(&mut model, RunConfig::new().samples(3));
    assert_eq!(output["v"].shape, vec![3]);
    assert_eq!(output["v"].data, vec![2.0, 4.0, 6.0]);
}

#[test]
fn running_sum_over_history() {
    let mut model = Model::new("history");
    let t = model.time();
    let v0 = model.variable("v0", t + 2).unwrap();
    model.variable("v1", v0.timeseries().sum()).unwrap();

    let output = run(&mut model, RunConfig::new().steps(10));
    assert_eq!(output["v1"].data, vec![2.0, 5.0, 9.0, 14.0, 20.0, 27.0, 35.0, 44.0, 54.0, 65.0]);
    assert_eq!(output["v1"].shape, vec![1, 10]);
}

#[test]
fn flows_reading_each_other_fail_before_evaluation() {
    let mut model = Model::new("cycle");
    let f1 = model.flow("f1").unwrap();
    let f2 = model.flow("f2").unwrap();
    model.set_equation(f1, f2 * 1).unwrap();
    model.set_equation(f2, f1 + 1).unwrap();

    let err = model.run(&Bindings::new(), &RunConfig::new()).unwrap_err();
    assert_eq!(err, SimulationError::CyclicDependency { cycle: vec!["f1".into(), "f2".into()] });
    assert!(model.last_run().is_none());
}

#[test]
fn constants_do_not_vary_and_runs_are_repeatable() {
    let mut model = Model::new("repeat");
    let t = model.time();
    model.variable("c", 3.5).unwrap();
    let noise = model.variable("noise", Distribution::normal(0.0, 1.0).per_timestep()).unwrap();
    model.variable("walk", noise + t).unwrap();

    let config = RunConfig::new().steps(6).samples(5).seed(11);
    let first = run(&mut model, config);
    let second = run(&mut model, config);
    assert_eq!(first, second);
    assert!(first["c"].data.iter().all(|v| *v == 3.5));
}

#[test]
fn unclamped_stock_conserves_its_flows() {
    let mut model = Model::new("conserve");
    let t = model.time();
    let stock = model.attach("stock", RefSpec::stock().init(7.0)).unwrap();
    let f = model.flow("f").unwrap();
    model.set_equation(f, t * 1.5 - 2).unwrap();
    model.connect_inflow(stock, f).unwrap();

    let output = run(&mut model, RunConfig::new().steps(8));
    let levels = output["stock"].sample(0);
    let rates = output["f"].sample(0);
    for step in 0..8 {
        let expected = levels[0] + rates[..step].iter().sum::<f64>();
        assert!((levels[step] - expected).abs() < 1e-9);
    }
}

fn tub() -> Model {
    let mut model = Model::new("tub").with_doc("Water level as a faucet and drain vary.");
    let t = model.time();
    let faucet = model.flow("faucet").unwrap();
    let drain = model.attach("drain", RefSpec::flow().dtype(Dtype::Float)).unwrap();
    let water = model.stock("water_level").unwrap();
    let off = model
        .attach("faucet_off_time", RefSpec::variable().equation(Distribution::discrete_uniform(2, 6)))
        .unwrap();
    model.chain(faucet, water, drain).unwrap();

    model.set_equation(faucet, piecewise(vec![5, 0], vec![t.lt(off), t.ge(off)]).unwrap()).unwrap();
    model.set_equation(drain, sin(t) + 2).unwrap();
    model.set_min(drain, 0).unwrap();
    model.set_max(drain, water).unwrap();
    model.metric("final_water_level", water.timeseries().at(-1)).unwrap();
    model
}

#[test]
fn tub_never_runs_dry_below_zero() {
    let mut model = tub();
    let output = run(&mut model, RunConfig::new().steps(12).samples(16).seed(3));

    let water = &output["water_level"];
    assert_eq!(water.shape, vec![16, 12]);
    assert!(water.data.iter().all(|w| *w >= -1e-12));

    let off = &output["faucet_off_time"];
    assert!(off.data.iter().all(|v| (2.0..=6.0).contains(v) && v.fract() == 0.0));

    for s in 0..16 {
        assert_eq!(output["final_water_level"].at(s, 0), water.at(s, 11));
        let faucet = output["faucet"].sample(s);
        let cutoff = off.at(s, 0) as usize;
        assert!(faucet[..cutoff].iter().all(|v| *v == 5.0));
        assert!(faucet[cutoff..].iter().all(|v| *v == 0.0));
    }
}

fn predator_prey() -> Model {
    let mut model = Model::new("predator_prey").with_steps(200);
    let rabbits = model.attach("rabbits", RefSpec::stock().init(100.0)).unwrap();
    let foxes = model.attach("foxes", RefSpec::stock().init(100.0)).unwrap();

    let alpha = model.attach("rabbit_growth_rate", RefSpec::variable().equation(0.1).doc("Alpha")).unwrap();
    let beta = model.attach("rabbit_death_rate", RefSpec::variable().equation(0.001).doc("Beta")).unwrap();
    let gamma = model.attach("fox_death_rate", RefSpec::variable().equation(0.1).doc("Gamma")).unwrap();
    let delta = model.attach("fox_growth_rate", RefSpec::variable().equation(0.001).doc("Delta")).unwrap();

    let births = model.attach("rabbit_births", RefSpec::flow().equation(alpha * rabbits)).unwrap();
    let deaths = model.attach("rabbit_deaths", RefSpec::flow().equation(beta * rabbits * foxes).max(rabbits)).unwrap();
    let fox_deaths = model.attach("fox_deaths", RefSpec::flow().equation(gamma * foxes).max(foxes)).unwrap();
    let fox_births = model.attach("fox_births", RefSpec::flow().equation(delta * rabbits * foxes)).unwrap();

    model.chain(births, rabbits, deaths).unwrap();
    model.chain(fox_births, foxes, fox_deaths).unwrap();

    model.metric("minimum_foxes", foxes.timeseries().series_min()).unwrap();
    model.metric("maximum_foxes", foxes.timeseries().series_max()).unwrap();
    model
}

#[test]
fn predator_prey_equilibrium_and_oscillation() {
    let mut model = predator_prey();
    let output = run(&mut model, RunConfig::new());
    assert_eq!(output.steps, 200);
    assert!(output["rabbits"].data.iter().all(|v| (v - 100.0).abs() < 1e-9));
    assert!((output["maximum_foxes"].at(0, 0) - output["minimum_foxes"].at(0, 0)).abs() < 1e-9);

    let disturbed = Bindings::new().with("rabbit_growth_rate", 0.2);
    let output = model.run(&disturbed, &RunConfig::new().steps(60)).unwrap();
    assert!(output["rabbits"].data.iter().all(|v| *v >= 0.0));
    assert!(output["foxes"].data.iter().all(|v| *v >= 0.0));
    assert!(output["minimum_foxes"].at(0, 0) < output["maximum_foxes"].at(0, 0));
    assert_eq!(output.bindings["rabbit_growth_rate"], "Scalar(0.2)");
}

#[test]
fn model_document_round_trip_reproduces_the_run() {
    let mut model = predator_prey();
    let x = model.time();
    let level = model.id_of("foxes").unwrap();
    model.variable("smoothed_foxes", smooth(level, 5)).unwrap();
    model.variable("late", delay3(x, 3)).unwrap();

    let config = RunConfig::new().steps(30);
    let original = run(&mut model, config);

    let json = model.to_json().unwrap();
    let mut restored = Model::from_json(&json).unwrap();
    assert!(restored.id_of("smoothed_foxes_smooth0").is_none());
    let reloaded = run(&mut restored, config);
    assert_eq!(original, reloaded);
}

#[test]
fn equation_text_round_trip_evaluates_identically() {
    let mut model = Model::new("text");
    let t = model.time();
    let a = model.variable("a", vec![1.0, 2.0, 3.0]).unwrap();
    let trees = vec![
        (Expr::from(a) * t + 1).sum(),
        clip(t - 3, 0, 4),
        Expr::from(a).slice(1, 3).mean(),
        interpolate(t, vec![0.0, 5.0], vec![10.0, 20.0]).unwrap(),
        pulse(2, 3) + repeated_pulse(1, 4),
        piecewise(vec![Expr::from(1), Expr::from(2)], vec![t.lt(3), t.ge(3)]).unwrap(),
        exp(neg(t)) + log(t + 1) + sqrt(t) + floor(t / 3) + abs(t - 4) + cos(t),
    ];
    for (i, tree) in trees.into_iter().enumerate() {
        let text = model.render(&tree);
        let parsed = model.parse(&text).unwrap();
        assert_eq!(parsed, tree, "{}", text);
        model.variable(&format!("direct{}", i), tree).unwrap();
        model.variable(&format!("parsed{}", i), parsed).unwrap();
    }

    let output = run(&mut model, RunConfig::new().steps(8));
    for i in 0..7 {
        assert_eq!(output[format!("direct{}", i).as_str()].data, output[format!("parsed{}", i).as_str()].data);
    }
}

#[test]
fn every_operator_evaluates_identically_after_a_text_round_trip() {
    let mut model = Model::new("catalogue");
    let t = model.time();
    let a = model.variable("a", vec![1.0, 2.0, 3.0]).unwrap();

    let mut trees: Vec<Expr> = Operation::ALL
        .into_iter()
        .map(|op| {
            let children = match op.arity() {
                Arity::Exact(1) => vec![Expr::from(a) + t],
                Arity::Exact(2) => vec![Expr::from(a), t + 1],
                Arity::Exact(_) => vec![Expr::from(a), Expr::from(0), Expr::from(2)],
                Arity::Pairs => vec![Expr::from(a), t.lt(3), Expr::from(a) * 2, t.ge(3)],
            };
            Expr::apply(op, children).unwrap()
        })
        .collect();
    trees.extend(
        CompositeKind::ALL
            .into_iter()
            .map(|kind| Expr::Composite(Composite::new(kind, t * 2, Expr::from(3)))),
    );
    trees.push(Expr::from(vec![true, false, true]) | t.ge(2));

    let count = trees.len();
    for (i, tree) in trees.into_iter().enumerate() {
        let text = model.render(&tree);
        let parsed = model.parse(&text).unwrap();
        assert_eq!(parsed, tree, "{}", text);
        model.variable(&format!("direct{}", i), tree).unwrap();
        model.variable(&format!("parsed{}", i), parsed).unwrap();
    }

    let output = run(&mut model, RunConfig::new().steps(6));
    for i in 0..count {
        let direct = &output[format!("direct{}", i).as_str()];
        let parsed = &output[format!("parsed{}", i).as_str()];
        assert_eq!(direct.data, parsed.data, "tree {}", i);
        assert_eq!(direct.dtype, parsed.dtype, "tree {}", i);
    }
}

#[test]
fn smooth_and_delay_follow_a_step_input() {
    let mut model = Model::new("composites");
    let t = model.time();
    let input = model.variable("input", t.ge(1) * 10).unwrap();
    model.variable("smoothed", smooth(input, 4)).unwrap();
    model.variable("delayed", delay1(input, 1)).unwrap();

    let output = run(&mut model, RunConfig::new().steps(4));
    assert_close(&output["smoothed"].data, &[0.0, 0.0, 2.5, 4.375]);
    assert_close(&output["delayed"].data, &[0.0, 0.0, 10.0, 10.0]);
    assert!(output.get("smoothed_smooth0").is_some());
}

#[test]
fn submodels_share_the_parent_clock() {
    let mut growth = Model::new("growth");
    let pop = growth.attach("pop", RefSpec::stock().init(1.0)).unwrap();
    growth.connect_inflow(pop, pop * 1).unwrap();

    let mut world = Model::new("world").with_steps(4);
    let a = world.include("a", &growth).unwrap();
    world.include("b", &growth).unwrap();
    world.variable("total", Expr::from(a["pop"]) + world.id_of("b.pop").unwrap()).unwrap();

    let output = run(&mut world, RunConfig::new());
    assert_eq!(output["a.pop"].data, vec![1.0, 2.0, 4.0, 8.0]);
    assert_eq!(output["total"].data, vec![2.0, 4.0, 8.0, 16.0]);
}

#[test]
fn collaborator_views() {
    let mut model = tub();
    let output = run(&mut model, RunConfig::new().steps(10).samples(2));

    let layout = Layout::of(&model, false);
    assert!(layout.nodes.iter().any(|n| n.name == "water_level" && n.kind == RefKind::Stock));

    let steps = unroll(&model, &Bindings::new()).unwrap();
    assert!(steps.iter().any(|s| s.name == "water_level"));

    let obs = Observation::new("final_water_level", 2.0, vec![3.0]);
    obs.check(&model).unwrap();
    assert_eq!(obs.log_likelihood(&output).unwrap().len(), 2);

    let trace = format_trace(&model, Some(&output), model.id_of("water_level").unwrap());
    assert!(trace.contains("[L1] water_level["), "{}", trace);
}
