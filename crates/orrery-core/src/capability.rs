//! Capability handles and candidate ordering

use crate::filter::Filter;
use crate::identifiers::{CapabilityId, CapabilityType};
use crate::properties::PropertyMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Property carrying a capability's rank
pub const RANK_PROPERTY: &str = "capability.rank";
/// Property the registry stamps with the capability id
pub const ID_PROPERTY: &str = "capability.id";
/// Property the registry stamps with the interface name
pub const INTERFACE_PROPERTY: &str = "capability.interface";
/// Property naming the component that provides a capability
pub const COMPONENT_NAME_PROPERTY: &str = "component.name";
/// Property carrying the providing configuration id
pub const COMPONENT_ID_PROPERTY: &str = "component.id";
/// Property carrying the factory id of a registered component factory
pub const COMPONENT_FACTORY_PROPERTY: &str = "component.factory";
/// Interface under which satisfied factory descriptions are published
pub const COMPONENT_FACTORY_INTERFACE: &str = "orrery.ComponentFactory";

/// A registered capability as seen by consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRef {
    /// Registry-allocated id
    pub id: CapabilityId,
    /// Interface the capability was registered under
    pub interface: CapabilityType,
    /// Rank at the time of the snapshot
    pub rank: i64,
    /// Property snapshot at the time of the snapshot
    pub properties: PropertyMap,
}

impl CapabilityRef {
    /// Build a handle, deriving the rank from the properties
    pub fn new(id: CapabilityId, interface: CapabilityType, properties: PropertyMap) -> Self {
        let rank = rank_of(&properties);
        Self {
            id,
            interface,
            rank,
            properties,
        }
    }

    /// Whether this capability satisfies an interface and optional filter
    pub fn matches(&self, interface: &CapabilityType, filter: Option<&Filter>) -> bool {
        &self.interface == interface && filter.map_or(true, |filter| filter.matches(&self.properties))
    }

    /// Candidate order: rank descending, then id ascending
    ///
    /// `Ordering::Less` means `self` is preferred over `other`.
    pub fn preference(&self, other: &CapabilityRef) -> Ordering {
        other
            .rank
            .cmp(&self.rank)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Rank carried by a property map (`capability.rank`, default 0)
pub fn rank_of(properties: &PropertyMap) -> i64 {
    properties
        .get(RANK_PROPERTY)
        .and_then(|value| value.as_int())
        .unwrap_or(0)
}

/// Sort candidates into preference order
pub fn sort_candidates(candidates: &mut [CapabilityRef]) {
    candidates.sort_by(CapabilityRef::preference);
}
