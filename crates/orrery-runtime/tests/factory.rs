//! Component factories: registration, instance creation, disposal

#![allow(clippy::unwrap_used)]

use assert_matches::assert_matches;
use orrery_core::capability::{COMPONENT_FACTORY_INTERFACE, COMPONENT_FACTORY_PROPERTY};
use orrery_core::{ConfigurationId, Description, FactoryId, Filter, PropertyMap, ReferenceDecl};
use orrery_runtime::{
    ComponentFactoryHandle, ConfigState, DisableOutcome, DisposeOutcome, Engine, EngineError,
    Implementations, InstanceHandle, Origin,
};
use orrery_testkit::*;
use parking_lot::Mutex;
use std::sync::Arc;

fn widgets() -> FactoryId {
    FactoryId::from("widgets")
}

fn widget_factory(reference: Option<ReferenceDecl>) -> Description {
    let mut builder = Description::builder("widget")
        .factory("widgets")
        .provides("Widget")
        .property("color", "grey");
    if let Some(reference) = reference {
        builder = builder.reference(reference);
    }
    builder.build().unwrap()
}

fn probe_of(engine: &Engine, handle: &InstanceHandle) -> Arc<Probe> {
    engine
        .instance_object(handle)
        .unwrap()
        .downcast::<Probe>()
        .unwrap()
}

#[test]
fn test_satisfied_factory_registers_factory_capability() {
    init_tracing();
    let log = EventLog::new();
    let engine = engine_with_probes(&log, &["widget"]);

    engine.enable(&test_unit(), vec![widget_factory(None)]).unwrap();
    engine.flush().unwrap();

    let factory = engine.find(&test_unit(), "widget").into_iter().next().unwrap();
    assert_eq!(factory.state, ConfigState::Registered);
    assert_eq!(factory.factory.as_ref(), Some(&widgets()));
    assert_eq!(factory.instances, 0);
    assert_eq!(log.count(|e| matches!(e, Event::Constructed { .. })), 0);

    let registered = engine
        .registry()
        .find_matching(&COMPONENT_FACTORY_INTERFACE.into(), None);
    assert_eq!(registered.len(), 1);
    assert_eq!(
        registered[0]
            .properties
            .get(COMPONENT_FACTORY_PROPERTY)
            .and_then(|v| v.as_str()),
        Some("widgets")
    );
    // The produced capability only appears once an instance exists
    assert!(engine.registry().find_matching(&"Widget".into(), None).is_empty());
}

#[test]
fn test_new_instance_applies_overrides() {
    init_tracing();
    let log = EventLog::new();
    let engine = engine_with_probes(&log, &["widget"]);
    engine.enable(&test_unit(), vec![widget_factory(None)]).unwrap();
    engine.flush().unwrap();

    let red = engine
        .new_factory_instance(&widgets(), PropertyMap::new().with("color", "red"))
        .unwrap();
    let plain = engine
        .new_factory_instance(&widgets(), PropertyMap::new())
        .unwrap();
    assert_ne!(red.config, plain.config);
    assert_eq!(red.factory, widgets());

    let red_probe = probe_of(&engine, &red);
    assert_eq!(
        red_probe.properties().get("color").and_then(|v| v.as_str()),
        Some("red")
    );
    let plain_probe = probe_of(&engine, &plain);
    assert_eq!(
        plain_probe.properties().get("color").and_then(|v| v.as_str()),
        Some("grey")
    );

    let produced = engine.configuration(red.config).unwrap();
    assert_eq!(produced.state, ConfigState::Active);
    assert_matches!(produced.origin, Origin::FactoryProduced { .. });
    assert_eq!(engine.registry().find_matching(&"Widget".into(), None).len(), 2);
    let filter = Filter::parse("(color=red)").unwrap();
    assert_eq!(
        engine
            .registry()
            .find_matching(&"Widget".into(), Some(&filter))
            .len(),
        1
    );
}

#[test]
fn test_dispose_outcomes() {
    init_tracing();
    let log = EventLog::new();
    let engine = engine_with_probes(&log, &["widget"]);
    engine.enable(&test_unit(), vec![widget_factory(None)]).unwrap();
    engine.flush().unwrap();

    let handle = engine
        .new_factory_instance(&widgets(), PropertyMap::new())
        .unwrap();
    assert_eq!(engine.dispose(&handle).unwrap(), DisposeOutcome::Disposed);
    assert_eq!(log.deactivations("widget"), 1);
    assert!(engine.configuration(handle.config).is_none());
    assert!(engine.registry().find_matching(&"Widget".into(), None).is_empty());

    assert_eq!(engine.dispose(&handle).unwrap(), DisposeOutcome::AlreadyDisposed);

    let bogus = InstanceHandle {
        config: ConfigurationId(999),
        factory: widgets(),
    };
    assert_eq!(engine.dispose(&bogus).unwrap(), DisposeOutcome::NotFound);

    // The factory registration itself is not an instance
    let registration = engine.find(&test_unit(), "widget")[0].id;
    let not_produced = InstanceHandle {
        config: registration,
        factory: widgets(),
    };
    assert_eq!(engine.dispose(&not_produced).unwrap(), DisposeOutcome::NotFound);
}

#[test]
fn test_unknown_and_unsatisfied_factories() {
    init_tracing();
    let log = EventLog::new();
    let engine = engine_with_probes(&log, &["widget"]);

    assert_matches!(
        engine.new_factory_instance(&FactoryId::from("nope"), PropertyMap::new()),
        Err(EngineError::FactoryNotFound(_))
    );

    engine
        .enable(
            &test_unit(),
            vec![widget_factory(Some(ReferenceDecl::new("dep", "X")))],
        )
        .unwrap();
    engine.flush().unwrap();
    assert_eq!(
        engine.find(&test_unit(), "widget")[0].state,
        ConfigState::Unsatisfied
    );
    assert_matches!(
        engine.new_factory_instance(&widgets(), PropertyMap::new()),
        Err(EngineError::FactoryUnsatisfied(_))
    );
    assert!(engine
        .registry()
        .find_matching(&COMPONENT_FACTORY_INTERFACE.into(), None)
        .is_empty());
}

#[test]
fn test_failed_instance_activation_is_discarded() {
    init_tracing();
    let log = EventLog::new();
    let implementations = probe_implementations(&log, &[]);
    implementations.register(
        "widget",
        ProbeFactory::with(
            &log,
            ProbeBehavior {
                fail_activate: true,
                ..ProbeBehavior::default()
            },
        ),
    );
    let engine = Engine::with_defaults(implementations).unwrap();
    engine.enable(&test_unit(), vec![widget_factory(None)]).unwrap();
    engine.flush().unwrap();

    let result = engine.new_factory_instance(&widgets(), PropertyMap::new());
    assert_matches!(result, Err(EngineError::Activation { .. }));
    // Only the factory registration remains
    assert_eq!(engine.find(&test_unit(), "widget").len(), 1);
}

#[test]
fn test_produced_instance_rebinds_after_reference_departure() {
    init_tracing();
    let log = EventLog::new();
    let engine = engine_with_probes(&log, &["widget"]);
    let registry = engine.registry();
    let original = register_marker(registry.as_ref(), "X", Some(10));
    let spare = register_marker(registry.as_ref(), "X", None);

    engine
        .enable(
            &test_unit(),
            vec![widget_factory(Some(ReferenceDecl::new("dep", "X")))],
        )
        .unwrap();
    engine.flush().unwrap();
    let handle = engine
        .new_factory_instance(&widgets(), PropertyMap::new())
        .unwrap();
    assert_eq!(
        engine.configuration(handle.config).unwrap().bound("dep"),
        &[original.id]
    );

    registry.unregister(original.id);
    engine.flush().unwrap();

    let produced = engine.configuration(handle.config).unwrap();
    assert_eq!(produced.state, ConfigState::Active);
    assert_eq!(produced.activation_count, 2);
    assert_eq!(produced.bound("dep"), &[spare.id]);
}

#[test]
fn test_disabling_factory_disposes_instances() {
    init_tracing();
    let log = EventLog::new();
    let engine = engine_with_probes(&log, &["widget"]);
    engine.enable(&test_unit(), vec![widget_factory(None)]).unwrap();
    engine.flush().unwrap();

    let handles: Vec<InstanceHandle> = (0..3)
        .map(|_| {
            engine
                .new_factory_instance(&widgets(), PropertyMap::new())
                .unwrap()
        })
        .collect();

    assert_eq!(engine.dispose(&handles[0]).unwrap(), DisposeOutcome::Disposed);
    assert_eq!(engine.dispose(&handles[0]).unwrap(), DisposeOutcome::AlreadyDisposed);

    let outcome = engine.disable_by_name(&test_unit(), "widget").unwrap();
    assert_eq!(outcome, DisableOutcome::Disabled(3));
    assert_eq!(log.deactivations("widget"), 3);
    assert!(engine.find(&test_unit(), "widget").is_empty());
    assert!(engine
        .registry()
        .find_matching(&COMPONENT_FACTORY_INTERFACE.into(), None)
        .is_empty());
    // Disposal records go with their factory
    for handle in &handles {
        assert_eq!(engine.dispose(handle).unwrap(), DisposeOutcome::NotFound);
    }
    assert_matches!(
        engine.new_factory_instance(&widgets(), PropertyMap::new()),
        Err(EngineError::FactoryNotFound(_))
    );
}

#[test]
fn test_factory_handle_from_registry() {
    init_tracing();
    let log = EventLog::new();
    let engine = engine_with_probes(&log, &["widget"]);
    engine.enable(&test_unit(), vec![widget_factory(None)]).unwrap();
    engine.flush().unwrap();

    let registration = engine
        .registry()
        .find_matching(&COMPONENT_FACTORY_INTERFACE.into(), None)
        .remove(0);
    let object = engine
        .registry()
        .get_object(registration.id, &test_unit())
        .unwrap();
    let factory = object.downcast_ref::<ComponentFactoryHandle>().unwrap();
    assert_eq!(factory.factory_id(), &widgets());

    let handle = factory.new_instance(PropertyMap::new()).unwrap();
    assert_eq!(
        engine.configuration(handle.config).unwrap().state,
        ConfigState::Active
    );
    let foreign = InstanceHandle {
        config: handle.config,
        factory: FactoryId::from("other"),
    };
    assert_eq!(factory.dispose(&foreign).unwrap(), DisposeOutcome::NotFound);
    assert_eq!(factory.dispose(&handle).unwrap(), DisposeOutcome::Disposed);
}

#[test]
fn test_component_creates_instances_from_its_hook() {
    init_tracing();
    let log = EventLog::new();
    let created = Arc::new(Mutex::new(Vec::new()));
    let record = created.clone();
    let implementations = probe_implementations(&log, &["widget"]);
    implementations.register(
        "builder",
        ProbeFactory::with(
            &log,
            ProbeBehavior::on_activate(move |ctx| {
                let factory = ctx
                    .locate_as::<ComponentFactoryHandle>("widgets")
                    .ok_or("factory not bound")?;
                let handle = factory
                    .new_instance(PropertyMap::new().with("color", "blue"))
                    .map_err(|e| e.to_string())?;
                record.lock().push(handle);
                Ok(())
            }),
        ),
    );
    let engine = Engine::with_defaults(implementations).unwrap();

    let target = Filter::parse("(component.factory=widgets)").unwrap();
    let builder = Description::builder("builder")
        .reference(
            ReferenceDecl::new("widgets", COMPONENT_FACTORY_INTERFACE).with_target(target),
        )
        .immediate()
        .build()
        .unwrap();
    engine
        .enable(&test_unit(), vec![builder, widget_factory(None)])
        .unwrap();
    engine.flush().unwrap();

    let created = created.lock().clone();
    assert_eq!(created.len(), 1);
    let widget = probe_of(&engine, &created[0]);
    assert_eq!(
        widget.properties().get("color").and_then(|v| v.as_str()),
        Some("blue")
    );
}

#[test]
fn test_instance_disposed_during_activation_is_never_published() {
    init_tracing();
    let log = EventLog::new();
    let implementations = Implementations::new();
    implementations.register(
        "widget",
        ProbeFactory::with(
            &log,
            ProbeBehavior::on_activate(|ctx| {
                let factory = ctx
                    .locate_as::<ComponentFactoryHandle>("factory")
                    .ok_or("factory not bound")?;
                let own = InstanceHandle {
                    config: ctx.configuration_id(),
                    factory: factory.factory_id().clone(),
                };
                factory.dispose(&own).map_err(|e| e.to_string())?;
                Ok(())
            }),
        ),
    );
    let engine = Engine::with_defaults(implementations).unwrap();
    log.watch(engine.registry().as_ref());

    let target = Filter::parse("(component.factory=widgets)").unwrap();
    let reference = ReferenceDecl::new("factory", COMPONENT_FACTORY_INTERFACE)
        .optional()
        .with_target(target);
    engine
        .enable(&test_unit(), vec![widget_factory(Some(reference))])
        .unwrap();
    engine.flush().unwrap();

    let result = engine.new_factory_instance(&widgets(), PropertyMap::new());
    assert_matches!(result, Err(EngineError::Activation { .. }));
    assert_eq!(
        log.count(|e| matches!(e, Event::Registered { interface, .. } if interface == "Widget")),
        0
    );
    assert_eq!(log.deactivations("widget"), 1);
    // Only the factory registration remains
    assert_eq!(engine.find(&test_unit(), "widget").len(), 1);
}
