//! Context handed to constructors and lifecycle hooks

use crate::engine::{EngineCore, Job};
use crate::errors::{EngineError, Result};
use crate::registry::Object;
use orrery_core::{CapabilityId, CapabilityRef, ConfigurationId, PropertyMap, UnitId};
use std::fmt;
use std::sync::{Arc, Weak};

/// Which bound capabilities a lookup targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LocateTarget {
    /// The first bound capability
    First,
    /// Every bound capability, in bind order
    All,
    /// One specific bound capability
    Capability(CapabilityId),
}

/// A component's view of its configuration and the engine
///
/// Cheap to clone. Lookups resolve against the configuration's bindings at
/// call time, so a context kept past deactivation simply finds nothing.
#[derive(Clone)]
pub struct ComponentContext {
    config: ConfigurationId,
    name: Arc<str>,
    unit: UnitId,
    properties: PropertyMap,
    using: Option<UnitId>,
    engine: Weak<EngineCore>,
}

impl ComponentContext {
    pub(crate) fn new(
        config: ConfigurationId,
        name: &str,
        unit: UnitId,
        properties: PropertyMap,
        using: Option<UnitId>,
        engine: Weak<EngineCore>,
    ) -> Self {
        Self {
            config,
            name: Arc::from(name),
            unit,
            properties,
            using,
            engine,
        }
    }

    /// Configuration this context belongs to
    pub fn configuration_id(&self) -> ConfigurationId {
        self.config
    }

    /// Component name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning deployment unit
    pub fn unit(&self) -> &UnitId {
        &self.unit
    }

    /// Property snapshot the instance was created with
    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    /// Consumer this instance serves, for bundle and prototype scopes
    pub fn using_unit(&self) -> Option<&UnitId> {
        self.using.as_ref()
    }

    fn engine(&self) -> Option<Arc<EngineCore>> {
        self.engine.upgrade()
    }

    /// Object of the first capability bound to `reference`
    ///
    /// Returns `None` when nothing is bound, or when obtaining the object
    /// would require activating a configuration that is already activating
    /// on this call chain.
    pub fn locate_service(&self, reference: &str) -> Option<Object> {
        self.engine()?
            .locate(self.config, reference, LocateTarget::First)
            .into_iter()
            .next()
    }

    /// Objects of every capability bound to `reference`, in bind order
    pub fn locate_services(&self, reference: &str) -> Vec<Object> {
        match self.engine() {
            Some(engine) => engine.locate(self.config, reference, LocateTarget::All),
            None => Vec::new(),
        }
    }

    /// Object of one specific capability bound to `reference`
    pub fn locate_capability(&self, reference: &str, capability: &CapabilityRef) -> Option<Object> {
        self.engine()?
            .locate(
                self.config,
                reference,
                LocateTarget::Capability(capability.id),
            )
            .into_iter()
            .next()
    }

    /// Typed variant of [`ComponentContext::locate_service`]
    pub fn locate_as<T: Send + Sync + 'static>(&self, reference: &str) -> Option<Arc<T>> {
        self.locate_service(reference)?.downcast::<T>().ok()
    }

    /// Handles currently bound to `reference`, in bind order
    pub fn bound_capabilities(&self, reference: &str) -> Vec<CapabilityRef> {
        match self.engine() {
            Some(engine) => engine.bound_capabilities(self.config, reference),
            None => Vec::new(),
        }
    }

    /// Enable a component of this unit (or all of them when `name` is
    /// `None`); takes effect asynchronously
    pub fn enable_component(&self, name: Option<&str>) -> Result<()> {
        let engine = self.engine().ok_or(EngineError::ShuttingDown)?;
        engine.enqueue(Job::EnableByName {
            unit: self.unit.clone(),
            name: name.map(str::to_string),
        })
    }

    /// Disable a component of this unit; takes effect asynchronously
    pub fn disable_component(&self, name: &str) -> Result<()> {
        let engine = self.engine().ok_or(EngineError::ShuttingDown)?;
        engine.enqueue(Job::DisableByName {
            unit: self.unit.clone(),
            name: name.to_string(),
        })
    }
}

impl fmt::Debug for ComponentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentContext")
            .field("config", &self.config)
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("using", &self.using)
            .finish()
    }
}
