//! Delayed components: first-touch activation, per-consumer scopes, release

#![allow(clippy::unwrap_used)]

use orrery_core::{Description, ReferenceDecl, ServiceScope, UnitId};
use orrery_runtime::{
    ConfigState, ConfigurationSnapshot, DeactivationReason, Engine, EngineConfig,
    Implementations, InMemoryRegistry, Object,
};
use orrery_testkit::*;
use parking_lot::Mutex;
use std::sync::Arc;

fn snapshot(engine: &Engine, name: &str) -> ConfigurationSnapshot {
    engine.find(&test_unit(), name).into_iter().next().unwrap()
}

fn delayed(name: &str, interface: &str, scope: ServiceScope) -> Description {
    Description::builder(name)
        .provides(interface)
        .scope(scope)
        .build()
        .unwrap()
}

fn probe_name(object: &Object) -> String {
    object.downcast_ref::<Probe>().unwrap().name().to_string()
}

#[test]
fn test_first_touch_activates_and_last_release_deactivates() {
    init_tracing();
    let log = EventLog::new();
    let engine = engine_with_probes(&log, &["lazy"]);
    let registry = engine.registry();
    let consumer = UnitId::new("consumer");

    engine
        .enable(&test_unit(), vec![delayed("lazy", "X", ServiceScope::Singleton)])
        .unwrap();
    engine.flush().unwrap();

    let lazy = snapshot(&engine, "lazy");
    assert_eq!(lazy.state, ConfigState::Registered);
    assert_eq!(lazy.instances, 0);
    assert_eq!(log.count(|e| matches!(e, Event::Constructed { .. })), 0);
    let handle = engine.registration(lazy.id).unwrap();
    assert_eq!(registry.find_matching(&"X".into(), None), vec![handle.clone()]);

    let first = registry.get_object(handle.id, &consumer).unwrap();
    assert_eq!(probe_name(&first), "lazy");
    assert_eq!(snapshot(&engine, "lazy").state, ConfigState::Active);
    assert_eq!(log.activations("lazy"), 1);

    let second = registry.get_object(handle.id, &consumer).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(log.activations("lazy"), 1);

    registry.unget_object(handle.id, &consumer, &first);
    assert_eq!(snapshot(&engine, "lazy").state, ConfigState::Active);
    registry.unget_object(handle.id, &consumer, &second);

    let lazy = snapshot(&engine, "lazy");
    assert_eq!(lazy.state, ConfigState::Registered);
    assert_eq!(lazy.instances, 0);
    assert_eq!(lazy.registration, Some(handle.id));
    assert_eq!(
        log.count(|e| matches!(
            e,
            Event::Deactivated { reason: DeactivationReason::Released, .. }
        )),
        1
    );

    // Touching it again starts a fresh instance
    let third = registry.get_object(handle.id, &consumer).unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(snapshot(&engine, "lazy").activation_count, 2);
}

#[test]
fn test_kept_delayed_instance_survives_release() {
    init_tracing();
    let log = EventLog::new();
    let config = EngineConfig {
        keep_delayed_instances: true,
        ..EngineConfig::default()
    };
    let engine = Engine::new(
        config,
        Arc::new(InMemoryRegistry::new()),
        probe_implementations(&log, &["lazy"]),
    )
    .unwrap();
    let registry = engine.registry();
    let consumer = UnitId::new("consumer");

    engine
        .enable(&test_unit(), vec![delayed("lazy", "X", ServiceScope::Singleton)])
        .unwrap();
    engine.flush().unwrap();
    let handle = engine.registration(snapshot(&engine, "lazy").id).unwrap();

    let object = registry.get_object(handle.id, &consumer).unwrap();
    registry.unget_object(handle.id, &consumer, &object);
    assert_eq!(snapshot(&engine, "lazy").state, ConfigState::Active);
    assert_eq!(log.deactivations("lazy"), 0);
}

#[test]
fn test_immediate_consumer_activates_delayed_provider() {
    init_tracing();
    let log = EventLog::new();
    let seen = Arc::new(Mutex::new(None));
    let record = seen.clone();
    let implementations = probe_implementations(&log, &["lazy"]);
    implementations.register(
        "consumer",
        ProbeFactory::with(
            &log,
            ProbeBehavior::on_activate(move |ctx| {
                let provider = ctx.locate_as::<Probe>("dep").ok_or("dep not available")?;
                *record.lock() = Some(provider.name().to_string());
                Ok(())
            }),
        ),
    );
    let engine = Engine::with_defaults(implementations).unwrap();
    log.watch(engine.registry().as_ref());

    engine
        .enable(
            &test_unit(),
            vec![
                delayed("lazy", "X", ServiceScope::Singleton),
                dependent("consumer", "X", None),
            ],
        )
        .unwrap();
    engine.flush().unwrap();

    assert_eq!(seen.lock().as_deref(), Some("lazy"));
    assert_eq!(snapshot(&engine, "consumer").state, ConfigState::Active);
    assert_eq!(snapshot(&engine, "lazy").state, ConfigState::Active);
    let lazy_activated = log
        .position(|e| matches!(e, Event::Activated { component, .. } if component == "lazy"))
        .unwrap();
    let consumer_activated = log
        .position(|e| matches!(e, Event::Activated { component, .. } if component == "consumer"))
        .unwrap();
    assert!(lazy_activated < consumer_activated);

    // The consumer's teardown releases the only use
    engine.disable_by_name(&test_unit(), "consumer").unwrap();
    assert_eq!(snapshot(&engine, "lazy").state, ConfigState::Registered);
    assert_eq!(log.deactivations("lazy"), 1);
}

#[test]
fn test_bundle_scope_gives_each_consumer_its_own_instance() {
    init_tracing();
    let log = EventLog::new();
    let engine = engine_with_probes(&log, &["session"]);
    let registry = engine.registry();
    let alice = UnitId::new("alice");
    let bob = UnitId::new("bob");

    engine
        .enable(&test_unit(), vec![delayed("session", "S", ServiceScope::Bundle)])
        .unwrap();
    engine.flush().unwrap();
    let handle = engine.registration(snapshot(&engine, "session").id).unwrap();

    let for_alice = registry.get_object(handle.id, &alice).unwrap();
    let for_bob = registry.get_object(handle.id, &bob).unwrap();
    let again = registry.get_object(handle.id, &alice).unwrap();
    assert!(!Arc::ptr_eq(&for_alice, &for_bob));
    assert!(Arc::ptr_eq(&for_alice, &again));

    let users: Vec<Option<UnitId>> = log
        .events()
        .into_iter()
        .filter_map(|event| match event {
            Event::Constructed { using, .. } => Some(using),
            _ => None,
        })
        .collect();
    assert_eq!(users, vec![Some(alice.clone()), Some(bob.clone())]);
    assert_eq!(snapshot(&engine, "session").instances, 2);
    assert_eq!(
        for_bob.downcast_ref::<Probe>().unwrap().context().using_unit(),
        Some(&bob)
    );

    // Bob's release only retires Bob's instance
    registry.unget_object(handle.id, &bob, &for_bob);
    let session = snapshot(&engine, "session");
    assert_eq!(session.state, ConfigState::Active);
    assert_eq!(session.instances, 1);
    assert_eq!(log.deactivations("session"), 1);
}

#[test]
fn test_prototype_scope_creates_per_request() {
    init_tracing();
    let log = EventLog::new();
    let engine = engine_with_probes(&log, &["proto"]);
    let registry = engine.registry();
    let consumer = UnitId::new("consumer");

    engine
        .enable(&test_unit(), vec![delayed("proto", "P", ServiceScope::Prototype)])
        .unwrap();
    engine.flush().unwrap();
    let handle = engine.registration(snapshot(&engine, "proto").id).unwrap();

    let one = registry.get_object(handle.id, &consumer).unwrap();
    let two = registry.get_object(handle.id, &consumer).unwrap();
    assert!(!Arc::ptr_eq(&one, &two));
    assert_eq!(log.activations("proto"), 2);
    assert_eq!(snapshot(&engine, "proto").instances, 2);

    registry.unget_object(handle.id, &consumer, &one);
    assert_eq!(snapshot(&engine, "proto").instances, 1);
    registry.unget_object(handle.id, &consumer, &two);
    assert_eq!(snapshot(&engine, "proto").state, ConfigState::Registered);
}

#[test]
fn test_circular_delayed_lookup_yields_nothing() {
    init_tracing();
    let log = EventLog::new();
    let outer_saw = Arc::new(Mutex::new(None));
    let inner_saw = Arc::new(Mutex::new(None));

    let implementations = Implementations::new();
    let record = outer_saw.clone();
    implementations.register(
        "outer",
        ProbeFactory::with(
            &log,
            ProbeBehavior::on_activate(move |ctx| {
                *record.lock() = Some(ctx.locate_service("inner").is_some());
                Ok(())
            }),
        ),
    );
    let record = inner_saw.clone();
    implementations.register(
        "inner",
        ProbeFactory::with(
            &log,
            ProbeBehavior::on_activate(move |ctx| {
                // The outer component is mid-activation
                *record.lock() = Some(ctx.locate_service("outer").is_some());
                Ok(())
            }),
        ),
    );
    let engine = Engine::with_defaults(implementations).unwrap();
    let registry = engine.registry();

    let outer = Description::builder("outer")
        .provides("Outer")
        .reference(ReferenceDecl::new("inner", "Inner"))
        .build()
        .unwrap();
    let inner = Description::builder("inner")
        .provides("Inner")
        .reference(ReferenceDecl::new("outer", "Outer").optional())
        .build()
        .unwrap();
    engine.enable(&test_unit(), vec![outer, inner]).unwrap();
    engine.flush().unwrap();
    assert_eq!(snapshot(&engine, "outer").state, ConfigState::Registered);
    assert_eq!(snapshot(&engine, "inner").state, ConfigState::Registered);

    let handle = engine.registration(snapshot(&engine, "outer").id).unwrap();
    let object = registry.get_object(handle.id, &UnitId::new("consumer")).unwrap();
    assert_eq!(probe_name(&object), "outer");

    assert_eq!(*outer_saw.lock(), Some(true));
    assert_eq!(*inner_saw.lock(), Some(false));
    assert_eq!(snapshot(&engine, "outer").state, ConfigState::Active);
    assert_eq!(snapshot(&engine, "inner").state, ConfigState::Active);
}
