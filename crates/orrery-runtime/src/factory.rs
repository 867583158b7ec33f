//! Component factories
//!
//! A factory description never activates by itself. Once its references are
//! satisfied it registers a [`ComponentFactoryHandle`] under
//! `orrery.ComponentFactory`, and every `new_instance` call produces a fresh
//! configuration with its own property overrides.

use crate::configuration::{ConfigState, Configuration, Origin};
use crate::engine::EngineCore;
use crate::errors::{ActivationError, DeactivationReason, EngineError, Result};
use orrery_core::{ConfigurationId, FactoryId, PropertyMap};
use serde::Serialize;
use std::fmt;
use std::sync::Weak;

/// Handle to a factory-produced configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct InstanceHandle {
    /// Produced configuration
    pub config: ConfigurationId,
    /// Factory that produced it
    pub factory: FactoryId,
}

/// Result of disposing a factory-produced instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisposeOutcome {
    /// The instance was torn down and removed
    Disposed,
    /// The instance had already been disposed
    AlreadyDisposed,
    /// No such factory-produced instance exists
    NotFound,
}

/// Capability object registered for a satisfied factory description
///
/// Consumers bound to `orrery.ComponentFactory` downcast their bound object
/// to this type.
#[derive(Clone)]
pub struct ComponentFactoryHandle {
    engine: Weak<EngineCore>,
    factory: FactoryId,
}

impl ComponentFactoryHandle {
    pub(crate) fn new(engine: Weak<EngineCore>, factory: FactoryId) -> Self {
        Self { engine, factory }
    }

    /// Factory this handle creates instances of
    pub fn factory_id(&self) -> &FactoryId {
        &self.factory
    }

    /// Create and activate a new instance with the given overrides
    pub fn new_instance(&self, overrides: PropertyMap) -> Result<InstanceHandle> {
        let engine = self.engine.upgrade().ok_or(EngineError::ShuttingDown)?;
        let factory = self.factory.clone();
        engine.submit(move |core| core.create_factory_instance(&factory, overrides))?
    }

    /// Dispose an instance created by this factory
    pub fn dispose(&self, handle: &InstanceHandle) -> Result<DisposeOutcome> {
        if handle.factory != self.factory {
            return Ok(DisposeOutcome::NotFound);
        }
        let engine = self.engine.upgrade().ok_or(EngineError::ShuttingDown)?;
        let config = handle.config;
        engine.submit(move |core| core.dispose_instance(config))?
    }
}

impl fmt::Debug for ComponentFactoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentFactoryHandle")
            .field("factory", &self.factory)
            .finish()
    }
}

impl EngineCore {
    /// Produce and activate a configuration from a registered factory
    ///
    /// Runs on the worker. A produced configuration that cannot be activated
    /// right now is discarded rather than left waiting.
    pub(crate) fn create_factory_instance(
        &self,
        factory: &FactoryId,
        overrides: PropertyMap,
    ) -> Result<InstanceHandle> {
        let (id, bindings) = {
            let mut state = self.state.lock();
            let parent = *state
                .factories
                .get(factory)
                .ok_or_else(|| EngineError::FactoryNotFound(factory.clone()))?;
            let registration = state
                .configs
                .get(&parent)
                .ok_or_else(|| EngineError::FactoryNotFound(factory.clone()))?;
            if registration.state != ConfigState::Registered {
                return Err(EngineError::FactoryUnsatisfied(factory.clone()));
            }
            let unit = registration.unit.clone();
            let description = registration.description.clone();
            let id = state.allocate_id();
            let mut config = Configuration::new(
                id,
                unit,
                description,
                overrides,
                Origin::FactoryProduced {
                    factory: factory.clone(),
                    parent,
                },
            );
            config.state = ConfigState::Satisfied;
            let bindings = config.fresh_bindings();
            state.configs.insert(id, config);
            (id, bindings)
        };

        let missing = self.missing_references(&bindings);
        let outcome = if missing.is_empty() {
            self.activate(id, None).map(|_| ())
        } else {
            Err(ActivationError::ReferencesUnsatisfiable { missing })
        };
        match outcome {
            Ok(()) => {
                tracing::info!(config = %id, factory = %factory, "factory instance created");
                Ok(InstanceHandle {
                    config: id,
                    factory: factory.clone(),
                })
            }
            Err(error) => {
                self.dispose_config(id, DeactivationReason::ActivationFailed);
                Err(EngineError::activation(id, error))
            }
        }
    }

    /// Dispose a factory-produced configuration
    pub(crate) fn dispose_instance(&self, id: ConfigurationId) -> Result<DisposeOutcome> {
        {
            let state = self.state.lock();
            if state.disposed.contains_key(&id) {
                return Ok(DisposeOutcome::AlreadyDisposed);
            }
            match state.configs.get(&id) {
                Some(config) if matches!(config.origin, Origin::FactoryProduced { .. }) => {}
                _ => return Ok(DisposeOutcome::NotFound),
            }
        }
        self.dispose_config(id, DeactivationReason::Disposed);
        tracing::info!(config = %id, "factory instance disposed");
        Ok(DisposeOutcome::Disposed)
    }
}
