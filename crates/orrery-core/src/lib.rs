//! # Orrery Core
//!
//! The declaration side of the Orrery component runtime:
//!
//! - **Identifiers**: units, configurations, capabilities, factories
//! - **Properties**: immutable [`PropertyMap`] snapshots
//! - **Filters**: LDAP-style target filters matched against property maps
//! - **Descriptions**: validated component declarations and their manifest form
//! - **Capabilities**: registered capability handles and candidate ordering
//!
//! Nothing here owns threads or state; the runtime crate builds the
//! resolver and lifecycle on top of these types.

pub mod capability;
pub mod description;
pub mod errors;
pub mod filter;
pub mod identifiers;
pub mod manifest;
pub mod properties;

pub use capability::{rank_of, sort_candidates, CapabilityRef};
pub use description::{
    Activation, BindingPolicy, Cardinality, Description, DescriptionBuilder, DescriptionDocument,
    InvalidDescription, InvalidReason, ReferenceDecl, ServiceScope,
};
pub use errors::{CoreError, Result};
pub use filter::{Filter, FilterError};
pub use identifiers::{CapabilityId, CapabilityType, ConfigurationId, FactoryId, UnitId};
pub use manifest::{ManifestFormat, ParsedUnit, UnitManifest};
pub use properties::{PropertyMap, PropertyValue};
