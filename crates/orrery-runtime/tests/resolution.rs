//! Resolver behavior: fixed-point activation, cycles, candidate choice

#![allow(clippy::unwrap_used)]

use orrery_core::{Cardinality, ReferenceDecl};
use orrery_runtime::{ConfigState, ConfigurationSnapshot, Engine};
use orrery_testkit::*;
use proptest::prelude::*;

fn snapshot(engine: &Engine, name: &str) -> ConfigurationSnapshot {
    let found = engine.find(&test_unit(), name);
    assert_eq!(found.len(), 1, "expected one configuration of {name}");
    found.into_iter().next().unwrap()
}

#[test]
fn test_provider_and_dependent_enabled_together() {
    init_tracing();
    let log = EventLog::new();
    let engine = engine_with_probes(&log, &["a", "b"]);

    // Dependent first, so the first pass finds it unsatisfied
    engine
        .enable(
            &test_unit(),
            vec![dependent("b", "X", Some("Y")), provider("a", "X")],
        )
        .unwrap();
    engine.flush().unwrap();

    let a = snapshot(&engine, "a");
    let b = snapshot(&engine, "b");
    assert_eq!(a.state, ConfigState::Active);
    assert_eq!(b.state, ConfigState::Active);
    assert_eq!(b.bound("dep"), &[a.registration.unwrap()]);
    assert!(b.registration.is_some());
}

#[test]
fn test_late_provider_activates_waiting_dependent() {
    init_tracing();
    let log = EventLog::new();
    let engine = engine_with_probes(&log, &["a", "b"]);

    engine
        .enable(&test_unit(), vec![dependent("b", "X", Some("Y"))])
        .unwrap();
    engine.flush().unwrap();
    assert_eq!(snapshot(&engine, "b").state, ConfigState::Unsatisfied);
    assert_eq!(log.activations("b"), 0);

    engine.enable(&test_unit(), vec![provider("a", "X")]).unwrap();
    engine.flush().unwrap();
    assert_eq!(snapshot(&engine, "a").state, ConfigState::Active);
    assert_eq!(snapshot(&engine, "b").state, ConfigState::Active);
    assert_eq!(log.activations("b"), 1);
}

#[test]
fn test_mandatory_cycle_never_activates() {
    init_tracing();
    let log = EventLog::new();
    let engine = engine_with_probes(&log, &["c1", "c2"]);

    engine
        .enable(
            &test_unit(),
            vec![
                with_reference("c1", ReferenceDecl::new("p2", "P2"), Some("P1")),
                with_reference("c2", ReferenceDecl::new("p1", "P1"), Some("P2")),
            ],
        )
        .unwrap();
    engine.flush().unwrap();

    assert_eq!(snapshot(&engine, "c1").state, ConfigState::Unsatisfied);
    assert_eq!(snapshot(&engine, "c2").state, ConfigState::Unsatisfied);
    assert_eq!(log.count(|_| true), 0);
}

#[test]
fn test_optional_side_breaks_cycle() {
    init_tracing();
    let log = EventLog::new();
    let engine = engine_with_probes(&log, &["c1", "c2"]);

    engine
        .enable(
            &test_unit(),
            vec![
                with_reference("c1", ReferenceDecl::new("p2", "P2").optional(), Some("P1")),
                with_reference("c2", ReferenceDecl::new("p1", "P1"), Some("P2")),
            ],
        )
        .unwrap();
    engine.flush().unwrap();

    let c1 = snapshot(&engine, "c1");
    let c2 = snapshot(&engine, "c2");
    assert_eq!(c1.state, ConfigState::Active);
    assert_eq!(c2.state, ConfigState::Active);
    assert_eq!(c2.bound("p1"), &[c1.registration.unwrap()]);
    // Static optional reference: bound to nothing at activation, and a late
    // arrival does not rebind it
    assert!(c1.bound("p2").is_empty());
}

#[test]
fn test_candidate_choice_is_rank_then_id() {
    init_tracing();
    let log = EventLog::new();
    let engine = engine_with_probes(&log, &["consumer"]);
    let registry = engine.registry();

    let first = register_marker(registry.as_ref(), "X", Some(5));
    let second = register_marker(registry.as_ref(), "X", Some(10));
    let third = register_marker(registry.as_ref(), "X", Some(5));
    assert_eq!(
        [first.id.value(), second.id.value(), third.id.value()],
        [1, 2, 3]
    );

    engine
        .enable(&test_unit(), vec![dependent("consumer", "X", None)])
        .unwrap();
    engine.flush().unwrap();
    assert_eq!(snapshot(&engine, "consumer").bound("dep"), &[second.id]);
}

#[test]
fn test_multiple_reference_binds_in_rank_order() {
    init_tracing();
    let log = EventLog::new();
    let engine = engine_with_probes(&log, &["consumer"]);
    let registry = engine.registry();

    let low = register_marker(registry.as_ref(), "X", Some(1));
    let high = register_marker(registry.as_ref(), "X", Some(9));
    let reference = ReferenceDecl::new("dep", "X").with_cardinality(Cardinality::MandatoryMultiple);
    engine
        .enable(&test_unit(), vec![with_reference("consumer", reference, None)])
        .unwrap();
    engine.flush().unwrap();
    assert_eq!(snapshot(&engine, "consumer").bound("dep"), &[high.id, low.id]);
}

#[test]
fn test_bound_single_static_reference_is_not_preempted() {
    init_tracing();
    let log = EventLog::new();
    let engine = engine_with_probes(&log, &["consumer"]);
    let registry = engine.registry();

    let original = register_marker(registry.as_ref(), "X", Some(0));
    engine
        .enable(&test_unit(), vec![dependent("consumer", "X", None)])
        .unwrap();
    engine.flush().unwrap();

    register_marker(registry.as_ref(), "X", Some(100));
    engine.flush().unwrap();

    let consumer = snapshot(&engine, "consumer");
    assert_eq!(consumer.bound("dep"), &[original.id]);
    assert_eq!(consumer.activation_count, 1);
    assert_eq!(log.deactivations("consumer"), 0);
}

#[test]
fn test_chain_reaches_fixed_point() {
    init_tracing();
    let log = EventLog::new();
    let names: Vec<String> = (0..8).map(|i| format!("link{i}")).collect();
    let keys: Vec<&str> = names.iter().map(String::as_str).collect();
    let engine = engine_with_probes(&log, &keys);

    // Enabled back to front: each link needs the previous one's capability
    let mut descriptions = Vec::new();
    for i in (1..8).rev() {
        let provides = format!("L{i}");
        descriptions.push(dependent(
            &names[i],
            &format!("L{}", i - 1),
            Some(provides.as_str()),
        ));
    }
    descriptions.push(provider(&names[0], "L0"));
    engine.enable(&test_unit(), descriptions).unwrap();
    engine.flush().unwrap();

    assert_eq!(engine.snapshot().count_in(ConfigState::Active), 8);
    for name in &names {
        assert_eq!(log.activations(name), 1);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_single_reference_binds_best_candidate(ranks in proptest::collection::vec(-5i64..5, 1..6)) {
        let log = EventLog::new();
        let engine = engine_with_probes(&log, &["consumer"]);
        let registry = engine.registry();
        let handles: Vec<_> = ranks
            .iter()
            .map(|rank| register_marker(registry.as_ref(), "X", Some(*rank)))
            .collect();

        engine.enable(&test_unit(), vec![dependent("consumer", "X", None)]).unwrap();
        engine.flush().unwrap();

        let best = handles
            .iter()
            .max_by(|a, b| a.rank.cmp(&b.rank).then(b.id.cmp(&a.id)))
            .unwrap();
        let consumer = snapshot(&engine, "consumer");
        prop_assert_eq!(consumer.bound("dep"), &[best.id]);
    }
}

#[test]
fn test_multiple_reference_lookups() {
    init_tracing();
    let log = EventLog::new();
    let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    let record = seen.clone();
    let implementations = probe_implementations(&log, &[]);
    implementations.register(
        "consumer",
        ProbeFactory::with(
            &log,
            ProbeBehavior::on_activate(move |ctx| {
                let all = ctx.locate_services("dep");
                let bound = ctx.bound_capabilities("dep");
                let last = bound.last().ok_or("nothing bound")?;
                let one = ctx.locate_capability("dep", last).ok_or("lookup failed")?;
                let markers: Vec<String> = all
                    .iter()
                    .chain(std::iter::once(&one))
                    .filter_map(|object| object.downcast_ref::<Marker>())
                    .map(|marker| marker.0.clone())
                    .collect();
                *record.lock() = markers;
                Ok(())
            }),
        ),
    );
    let engine = orrery_runtime::Engine::with_defaults(implementations).unwrap();
    let registry = engine.registry();
    register_marker(registry.as_ref(), "X", Some(3));
    register_marker(registry.as_ref(), "X", Some(1));

    let reference = ReferenceDecl::new("dep", "X").multiple();
    engine
        .enable(&test_unit(), vec![with_reference("consumer", reference, None)])
        .unwrap();
    engine.flush().unwrap();

    assert_eq!(snapshot(&engine, "consumer").state, ConfigState::Active);
    assert_eq!(seen.lock().len(), 3);
}
