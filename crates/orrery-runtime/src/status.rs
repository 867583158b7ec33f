//! Status snapshots
//!
//! Readers on other threads never iterate live resolver state; they get
//! owned copies taken under one short lock.

use crate::configuration::{ConfigState, Configuration, Origin};
use crate::queue::QueueStats;
use crate::resolver::InvalidRecord;
use orrery_core::{CapabilityId, CapabilityType, ConfigurationId, FactoryId, PropertyMap, UnitId};
use serde::Serialize;

/// Copy of the whole engine state
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    /// Every live configuration, in id order
    pub configurations: Vec<ConfigurationSnapshot>,
    /// Descriptions rejected by validation
    pub invalid: Vec<InvalidRecord>,
    /// Work queue counters
    pub queue: QueueStats,
}

impl EngineSnapshot {
    /// Configurations of a component name, in id order
    pub fn named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ConfigurationSnapshot> + 'a {
        self.configurations
            .iter()
            .filter(move |config| config.name == name)
    }

    /// Number of configurations in a state
    pub fn count_in(&self, state: ConfigState) -> usize {
        self.configurations
            .iter()
            .filter(|config| config.state == state)
            .count()
    }
}

/// Copy of one reference binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindingSnapshot {
    /// Reference name
    pub name: String,
    /// Required interface
    pub interface: CapabilityType,
    /// Bound capabilities in bind order
    pub bound: Vec<CapabilityId>,
    /// Whether the minimum cardinality is met
    pub satisfied: bool,
}

/// Copy of one configuration
#[derive(Debug, Clone, Serialize)]
pub struct ConfigurationSnapshot {
    /// Configuration id
    pub id: ConfigurationId,
    /// Owning unit
    pub unit: UnitId,
    /// Component name
    pub name: String,
    /// Lifecycle state
    pub state: ConfigState,
    /// How the configuration was created
    pub origin: Origin,
    /// How many times it became active
    pub activation_count: u64,
    /// Merged property snapshot
    pub properties: PropertyMap,
    /// Reference bindings (empty unless active)
    pub bindings: Vec<BindingSnapshot>,
    /// Live instances
    pub instances: usize,
    /// Registered capability, if any
    pub registration: Option<CapabilityId>,
    /// Factory id of a factory description
    pub factory: Option<FactoryId>,
    /// Most recent activation failure
    pub last_error: Option<String>,
}

impl ConfigurationSnapshot {
    /// Bound capabilities of a reference
    pub fn bound(&self, reference: &str) -> &[CapabilityId] {
        self.bindings
            .iter()
            .find(|binding| binding.name == reference)
            .map(|binding| binding.bound.as_slice())
            .unwrap_or(&[])
    }
}

impl From<&Configuration> for ConfigurationSnapshot {
    fn from(config: &Configuration) -> Self {
        Self {
            id: config.id,
            unit: config.unit.clone(),
            name: config.name().to_string(),
            state: config.state,
            origin: config.origin.clone(),
            activation_count: config.activation_count,
            properties: config.properties.clone(),
            bindings: config
                .bindings
                .iter()
                .map(|binding| BindingSnapshot {
                    name: binding.name().to_string(),
                    interface: binding.decl().interface.clone(),
                    bound: binding.bound_ids(),
                    satisfied: binding.is_satisfied(),
                })
                .collect(),
            instances: config.instances.len(),
            registration: config.registration.as_ref().map(|handle| handle.id),
            factory: config.description.factory_id().cloned(),
            last_error: config.last_error.clone(),
        }
    }
}
