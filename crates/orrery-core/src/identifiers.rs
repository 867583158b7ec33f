//! Core identifier types used across the Orrery runtime
//!
//! Numeric identifiers are allocated by their owners (the resolver allocates
//! configuration ids, the registry allocates capability ids) and are never
//! reused within one engine. String identifiers come from descriptions and
//! deployment units.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Deployment unit identifier
///
/// A unit is the hosting module system's deployable artifact. It owns the
/// descriptions it declares and acts as the consumer identity when its
/// components obtain capability objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub String);

impl UnitId {
    /// Create a unit id from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UnitId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Configuration identifier
///
/// One live instantiation context of a description. Allocated by the
/// resolver in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigurationId(pub u64);

impl ConfigurationId {
    /// Get the inner value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConfigurationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config-{}", self.0)
    }
}

/// Capability identifier, allocated by the registry starting at 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityId(pub u64);

impl CapabilityId {
    /// Get the inner value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap-{}", self.0)
    }
}

/// Factory identifier declared by a factory description
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactoryId(pub String);

impl FactoryId {
    /// Create a factory id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FactoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FactoryId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Interface name a capability is registered under
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityType(pub String);

impl CapabilityType {
    /// Create a capability type
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the interface name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapabilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CapabilityType {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for CapabilityType {
    fn from(name: String) -> Self {
        Self(name)
    }
}
