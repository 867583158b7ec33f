//! Description and registry fixtures

use orrery_core::capability::RANK_PROPERTY;
use orrery_core::{CapabilityRef, Description, PropertyMap, ReferenceDecl, UnitId};
use orrery_runtime::{CapabilityRegistry, SingletonProvider};
use std::sync::Arc;

/// Plain object registered by tests outside the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker(pub String);

/// Unit id used by most tests
pub fn test_unit() -> UnitId {
    UnitId::new("test-unit")
}

/// Immediate component providing `interface`, no references
pub fn provider(name: &str, interface: &str) -> Description {
    Description::builder(name)
        .provides(interface)
        .immediate()
        .build()
        .unwrap()
}

/// Immediate component with one mandatory, single, static reference
/// named `dep`, optionally providing a capability
pub fn dependent(name: &str, requires: &str, provides: Option<&str>) -> Description {
    with_reference(name, ReferenceDecl::new("dep", requires), provides)
}

/// Immediate component with the given reference
pub fn with_reference(name: &str, reference: ReferenceDecl, provides: Option<&str>) -> Description {
    let mut builder = Description::builder(name).reference(reference).immediate();
    if let Some(interface) = provides {
        builder = builder.provides(interface);
    }
    builder.build().unwrap()
}

/// Register a [`Marker`] directly in a registry, with an optional rank
pub fn register_marker(
    registry: &dyn CapabilityRegistry,
    interface: &str,
    rank: Option<i64>,
) -> CapabilityRef {
    let properties = match rank {
        Some(rank) => PropertyMap::new().with(RANK_PROPERTY, rank),
        None => PropertyMap::new(),
    };
    register_marker_with(registry, interface, properties)
}

/// Register a [`Marker`] with explicit properties
pub fn register_marker_with(
    registry: &dyn CapabilityRegistry,
    interface: &str,
    properties: PropertyMap,
) -> CapabilityRef {
    registry.register(
        interface.into(),
        properties,
        Arc::new(SingletonProvider::new(Arc::new(Marker(interface.to_string())))),
    )
}
