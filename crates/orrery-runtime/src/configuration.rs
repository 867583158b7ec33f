//! Configurations and their lifecycle states

use crate::binding::Binding;
use crate::component::Component;
use crate::context::ComponentContext;
use crate::errors::DeactivationReason;
use crate::registry::Object;
use orrery_core::{Activation, CapabilityRef, ConfigurationId, Description, FactoryId, PropertyMap, UnitId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of a configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigState {
    /// At least one mandatory reference has no matching capability
    Unsatisfied,
    /// Every mandatory reference can be bound; no instance yet
    Satisfied,
    /// A delayed placeholder or factory capability is registered; no instance
    Registered,
    /// An activation is in progress on the worker
    Activating,
    /// At least one instance exists
    Active,
    /// Teardown is in progress
    Deactivating,
    /// Removed from the engine
    Disposed,
}

impl ConfigState {
    /// Whether the resolver should evaluate the configuration
    pub fn is_resolvable(&self) -> bool {
        matches!(self, ConfigState::Unsatisfied | ConfigState::Satisfied)
    }
}

impl fmt::Display for ConfigState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfigState::Unsatisfied => "unsatisfied",
            ConfigState::Satisfied => "satisfied",
            ConfigState::Registered => "registered",
            ConfigState::Activating => "activating",
            ConfigState::Active => "active",
            ConfigState::Deactivating => "deactivating",
            ConfigState::Disposed => "disposed",
        })
    }
}

/// Teardown deferred until an in-flight activation completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingAction {
    /// Tear down, then resolve again
    Reactivate(DeactivationReason),
    /// Tear down and remove
    Dispose(DeactivationReason),
}

impl PendingAction {
    /// Combine two requests; removal always wins
    pub(crate) fn merge(current: Option<PendingAction>, next: PendingAction) -> PendingAction {
        match (current, next) {
            (Some(dispose @ PendingAction::Dispose(_)), _) => dispose,
            (_, next) => next,
        }
    }
}

/// How a configuration came to exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// Created by enabling its description
    Enabled,
    /// Produced on request by a factory description
    FactoryProduced {
        /// Factory that produced it
        factory: FactoryId,
        /// Configuration of the factory description
        parent: ConfigurationId,
    },
}

/// One live object of a configuration
#[derive(Clone)]
pub struct Instance {
    pub(crate) component: Arc<dyn Component>,
    pub(crate) context: ComponentContext,
    pub(crate) object: Object,
    /// Outstanding `get_object` counts per consumer (delayed components only)
    pub(crate) users: BTreeMap<UnitId, usize>,
}

impl Instance {
    pub(crate) fn new(component: Arc<dyn Component>, context: ComponentContext) -> Self {
        let object = component.clone().capability_object();
        Self {
            component,
            context,
            object,
            users: BTreeMap::new(),
        }
    }

    /// Consumer this instance was created for, when the scope is per consumer
    pub fn using_unit(&self) -> Option<&UnitId> {
        self.context.using_unit()
    }

    pub(crate) fn total_uses(&self) -> usize {
        self.users.values().sum()
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("config", &self.context.configuration_id())
            .field("using", &self.context.using_unit())
            .field("users", &self.users)
            .finish()
    }
}

/// One live instantiation context of a description
///
/// Owned by the resolver arena and only mutated on the worker thread.
#[derive(Debug)]
pub struct Configuration {
    pub(crate) id: ConfigurationId,
    pub(crate) unit: UnitId,
    pub(crate) description: Arc<Description>,
    pub(crate) properties: PropertyMap,
    /// Properties layered over the description defaults
    pub(crate) overrides: PropertyMap,
    pub(crate) state: ConfigState,
    pub(crate) bindings: Vec<Binding>,
    pub(crate) instances: Vec<Instance>,
    pub(crate) registration: Option<CapabilityRef>,
    pub(crate) origin: Origin,
    pub(crate) activation_count: u64,
    /// Order of the most recent activation, used for shutdown ordering
    pub(crate) activated_at: u64,
    /// Teardown requested while an activation was in flight
    pub(crate) pending: Option<PendingAction>,
    pub(crate) last_error: Option<String>,
}

impl Configuration {
    pub(crate) fn new(
        id: ConfigurationId,
        unit: UnitId,
        description: Arc<Description>,
        overrides: PropertyMap,
        origin: Origin,
    ) -> Self {
        let properties = description.properties().merged(&overrides);
        Self {
            id,
            unit,
            description,
            properties,
            overrides,
            state: ConfigState::Unsatisfied,
            bindings: Vec::new(),
            instances: Vec::new(),
            registration: None,
            origin,
            activation_count: 0,
            activated_at: 0,
            pending: None,
            last_error: None,
        }
    }

    /// Component name
    pub fn name(&self) -> &str {
        self.description.name()
    }

    /// Whether instances are created eagerly once satisfied
    ///
    /// Immediate descriptions and factory-produced configurations are eager;
    /// delayed and factory descriptions only register a capability.
    pub(crate) fn is_eager(&self) -> bool {
        matches!(self.origin, Origin::FactoryProduced { .. })
            || matches!(self.description.activation(), Activation::Immediate)
    }

    /// Whether this is a factory description waiting for instance requests
    pub(crate) fn is_factory_registration(&self) -> bool {
        matches!(self.origin, Origin::Enabled)
            && matches!(self.description.activation(), Activation::Factory(_))
    }

    /// Whether this is a delayed provider backed by a placeholder
    pub(crate) fn is_delayed(&self) -> bool {
        matches!(self.origin, Origin::Enabled)
            && matches!(self.description.activation(), Activation::Delayed)
    }

    pub(crate) fn binding(&self, reference: &str) -> Option<&Binding> {
        self.bindings.iter().find(|binding| binding.name() == reference)
    }

    pub(crate) fn binding_mut(&mut self, reference: &str) -> Option<&mut Binding> {
        self.bindings
            .iter_mut()
            .find(|binding| binding.name() == reference)
    }

    /// Fresh, unbound bindings for every declared reference
    pub(crate) fn fresh_bindings(&self) -> Vec<Binding> {
        self.description
            .references()
            .iter()
            .map(|decl| Binding::new(decl.clone(), &self.properties))
            .collect()
    }

    /// Install new overrides and recompute the merged properties
    pub(crate) fn set_overrides(&mut self, overrides: PropertyMap) {
        self.properties = self.description.properties().merged(&overrides);
        self.overrides = overrides;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_merge_defaults_and_overrides() {
        let description = Arc::new(
            Description::builder("web")
                .property("port", 80i64)
                .property("host", "localhost")
                .build()
                .unwrap(),
        );
        let mut config = Configuration::new(
            ConfigurationId(1),
            UnitId::new("u"),
            description,
            PropertyMap::new().with("port", 8080i64),
            Origin::Enabled,
        );
        assert_eq!(config.properties.get("port").and_then(|v| v.as_int()), Some(8080));
        assert_eq!(config.properties.get("host").and_then(|v| v.as_str()), Some("localhost"));

        config.set_overrides(PropertyMap::new());
        assert_eq!(config.properties.get("port").and_then(|v| v.as_int()), Some(80));
        assert!(config.is_eager());
    }

    #[test]
    fn test_activation_kinds() {
        let delayed = Arc::new(Description::builder("d").provides("x").build().unwrap());
        let config = Configuration::new(
            ConfigurationId(1),
            UnitId::new("u"),
            delayed,
            PropertyMap::new(),
            Origin::Enabled,
        );
        assert!(config.is_delayed());
        assert!(!config.is_eager());

        let factory = Arc::new(Description::builder("f").factory("f").build().unwrap());
        let registration = Configuration::new(
            ConfigurationId(2),
            UnitId::new("u"),
            factory.clone(),
            PropertyMap::new(),
            Origin::Enabled,
        );
        assert!(registration.is_factory_registration());
        let produced = Configuration::new(
            ConfigurationId(3),
            UnitId::new("u"),
            factory,
            PropertyMap::new(),
            Origin::FactoryProduced {
                factory: FactoryId::new("f"),
                parent: ConfigurationId(2),
            },
        );
        assert!(produced.is_eager());
        assert!(!produced.is_factory_registration());
        assert!(ConfigState::Unsatisfied.is_resolvable());
        assert_eq!(
            PendingAction::merge(
                Some(PendingAction::Dispose(DeactivationReason::Disabled)),
                PendingAction::Reactivate(DeactivationReason::ReferenceDeparted),
            ),
            PendingAction::Dispose(DeactivationReason::Disabled)
        );
        assert!(!ConfigState::Registered.is_resolvable());
    }
}
