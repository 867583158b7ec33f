//! Probe components
//!
//! A probe records every hook it receives and can be told to fail or panic
//! in specific hooks.

use crate::events::{Event, EventLog};
use orrery_core::{CapabilityRef, ConfigurationId, PropertyMap};
use orrery_runtime::{
    Component, ComponentContext, ComponentFactory, DeactivationReason, Engine, HookError,
    Implementations,
};
use std::sync::Arc;

/// Callback run inside a probe's activation hook
pub type ActivateHook = Arc<dyn Fn(&ComponentContext) -> Result<(), HookError> + Send + Sync>;

/// How a probe misbehaves
#[derive(Clone, Default)]
pub struct ProbeBehavior {
    /// Constructor returns an error
    pub fail_construct: bool,
    /// Activation hook returns an error
    pub fail_activate: bool,
    /// Activation hook panics
    pub panic_activate: bool,
    /// Deactivation hook returns an error
    pub fail_deactivate: bool,
    /// Extra work done at the start of the activation hook
    pub on_activate: Option<ActivateHook>,
}

impl ProbeBehavior {
    /// Run `hook` during activation
    pub fn on_activate(
        hook: impl Fn(&ComponentContext) -> Result<(), HookError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_activate: Some(Arc::new(hook)),
            ..Self::default()
        }
    }
}

/// Recording component
pub struct Probe {
    log: Arc<EventLog>,
    behavior: ProbeBehavior,
    context: ComponentContext,
}

impl Probe {
    /// Component name
    pub fn name(&self) -> &str {
        self.context.name()
    }

    /// Owning configuration
    pub fn config(&self) -> ConfigurationId {
        self.context.configuration_id()
    }

    /// Properties the probe was constructed with
    pub fn properties(&self) -> &PropertyMap {
        self.context.properties()
    }

    /// The probe's context, for lookups from test code
    pub fn context(&self) -> &ComponentContext {
        &self.context
    }
}

impl Component for Probe {
    fn activate(&self, ctx: &ComponentContext) -> Result<(), HookError> {
        if let Some(hook) = &self.behavior.on_activate {
            hook(ctx)?;
        }
        if self.behavior.panic_activate {
            panic!("probe {} refuses to activate", self.name());
        }
        if self.behavior.fail_activate {
            return Err(HookError::new(format!("probe {} failed to activate", self.name())));
        }
        self.log.record(Event::Activated {
            component: self.name().to_string(),
            config: self.config(),
        });
        Ok(())
    }

    fn deactivate(&self, _ctx: &ComponentContext, reason: DeactivationReason) -> Result<(), HookError> {
        self.log.record(Event::Deactivated {
            component: self.name().to_string(),
            config: self.config(),
            reason,
        });
        if self.behavior.fail_deactivate {
            return Err(HookError::new("probe deactivation failed"));
        }
        Ok(())
    }

    fn bind(&self, _ctx: &ComponentContext, reference: &str, capability: &CapabilityRef) -> Result<(), HookError> {
        self.log.record(Event::Bound {
            component: self.name().to_string(),
            reference: reference.to_string(),
            capability: capability.id,
        });
        Ok(())
    }

    fn unbind(&self, _ctx: &ComponentContext, reference: &str, capability: &CapabilityRef) -> Result<(), HookError> {
        self.log.record(Event::Unbound {
            component: self.name().to_string(),
            reference: reference.to_string(),
            capability: capability.id,
        });
        Ok(())
    }
}

/// Constructor producing probes
#[derive(Clone)]
pub struct ProbeFactory {
    log: Arc<EventLog>,
    behavior: ProbeBehavior,
}

impl ProbeFactory {
    /// Well-behaved probes
    pub fn new(log: &Arc<EventLog>) -> Self {
        Self {
            log: log.clone(),
            behavior: ProbeBehavior::default(),
        }
    }

    /// Probes with the given behavior
    pub fn with(log: &Arc<EventLog>, behavior: ProbeBehavior) -> Self {
        Self {
            log: log.clone(),
            behavior,
        }
    }
}

impl ComponentFactory for ProbeFactory {
    fn construct(&self, ctx: &ComponentContext) -> Result<Arc<dyn Component>, HookError> {
        self.log.record(Event::Constructed {
            component: ctx.name().to_string(),
            config: ctx.configuration_id(),
            using: ctx.using_unit().cloned(),
        });
        if self.behavior.fail_construct {
            return Err(HookError::new(format!("probe {} cannot be built", ctx.name())));
        }
        Ok(Arc::new(Probe {
            log: self.log.clone(),
            behavior: self.behavior.clone(),
            context: ctx.clone(),
        }))
    }
}

/// Implementation table with a well-behaved probe under each key
pub fn probe_implementations(log: &Arc<EventLog>, keys: &[&str]) -> Implementations {
    let implementations = Implementations::new();
    for key in keys {
        implementations.register(*key, ProbeFactory::new(log));
    }
    implementations
}

/// Engine with default configuration, probes under `keys`, and the log
/// watching its registry
pub fn engine_with_probes(log: &Arc<EventLog>, keys: &[&str]) -> Engine {
    let engine = Engine::with_defaults(probe_implementations(log, keys)).unwrap();
    log.watch(engine.registry().as_ref());
    engine
}
