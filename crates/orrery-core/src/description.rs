//! Component descriptions
//!
//! A [`Description`] is the immutable, validated declaration of a component:
//! what it provides, what it references, how it is activated and which
//! default properties it carries. Descriptions are built either from a
//! [`DescriptionDocument`] (the serde form found in unit manifests) or
//! programmatically through [`DescriptionBuilder`]; both paths run the same
//! validation, so a `Description` value is always valid when created.
//!
//! Validation is re-run by the runtime before every activation attempt.

use crate::filter::Filter;
use crate::identifiers::{CapabilityType, FactoryId};
use crate::properties::{PropertyMap, PropertyValue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use thiserror::Error;

/// Minimum/maximum number of bound capabilities for a reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Cardinality {
    /// `0..1`
    #[serde(rename = "0..1", alias = "optional")]
    OptionalSingle,
    /// `1..1`
    #[default]
    #[serde(rename = "1..1", alias = "mandatory")]
    MandatorySingle,
    /// `0..n`
    #[serde(rename = "0..n", alias = "multiple")]
    OptionalMultiple,
    /// `1..n`
    #[serde(rename = "1..n", alias = "at-least-one")]
    MandatoryMultiple,
}

impl Cardinality {
    /// Whether at least one capability must be bound
    pub fn is_mandatory(&self) -> bool {
        matches!(
            self,
            Cardinality::MandatorySingle | Cardinality::MandatoryMultiple
        )
    }

    /// Whether more than one capability may be bound
    pub fn is_multiple(&self) -> bool {
        matches!(
            self,
            Cardinality::OptionalMultiple | Cardinality::MandatoryMultiple
        )
    }

    /// Minimum bound count
    pub fn min(&self) -> usize {
        usize::from(self.is_mandatory())
    }

    /// Maximum bound count, `None` when unbounded
    pub fn max(&self) -> Option<usize> {
        if self.is_multiple() {
            None
        } else {
            Some(1)
        }
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Cardinality::OptionalSingle => "0..1",
            Cardinality::MandatorySingle => "1..1",
            Cardinality::OptionalMultiple => "0..n",
            Cardinality::MandatoryMultiple => "1..n",
        })
    }
}

/// Whether a bound reference may be swapped under a live instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingPolicy {
    /// Any change to a bound capability reactivates the configuration
    #[default]
    Static,
    /// Bound capabilities are swapped through bind/unbind hooks
    Dynamic,
}

/// How instances of a provided capability are shared between consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceScope {
    /// One instance shared by every consumer
    #[default]
    Singleton,
    /// One instance per consuming unit
    Bundle,
    /// One instance per lookup
    Prototype,
}

impl ServiceScope {
    /// Whether instances are produced per consumer (a "service factory")
    pub fn is_service_factory(&self) -> bool {
        !matches!(self, ServiceScope::Singleton)
    }
}

/// When a satisfied configuration gets an instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Activated as soon as it is satisfied
    Immediate,
    /// Provided capability registered as a placeholder, activated on first use
    Delayed,
    /// Instances are produced on request through the named factory
    Factory(FactoryId),
}

impl Activation {
    /// Factory id for factory descriptions
    pub fn factory_id(&self) -> Option<&FactoryId> {
        match self {
            Activation::Factory(id) => Some(id),
            _ => None,
        }
    }
}

/// A required capability declared by a description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReferenceDecl {
    /// Unique within the declaring description
    pub name: String,
    /// Interface of the required capability
    pub interface: CapabilityType,
    /// Bound count bounds
    #[serde(default)]
    pub cardinality: Cardinality,
    /// Rebinding policy
    #[serde(default)]
    pub policy: BindingPolicy,
    /// Default target filter, overridable through the `<name>.target` property
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Filter>,
}

impl ReferenceDecl {
    /// Mandatory, single, static reference
    pub fn new(name: impl Into<String>, interface: impl Into<CapabilityType>) -> Self {
        Self {
            name: name.into(),
            interface: interface.into(),
            cardinality: Cardinality::MandatorySingle,
            policy: BindingPolicy::Static,
            target: None,
        }
    }

    /// Set the cardinality
    pub fn with_cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    /// Make the reference optional, keeping its multiplicity
    pub fn optional(mut self) -> Self {
        self.cardinality = if self.cardinality.is_multiple() {
            Cardinality::OptionalMultiple
        } else {
            Cardinality::OptionalSingle
        };
        self
    }

    /// Allow multiple bound capabilities, keeping optionality
    pub fn multiple(mut self) -> Self {
        self.cardinality = if self.cardinality.is_mandatory() {
            Cardinality::MandatoryMultiple
        } else {
            Cardinality::OptionalMultiple
        };
        self
    }

    /// Use the dynamic policy
    pub fn dynamic(mut self) -> Self {
        self.policy = BindingPolicy::Dynamic;
        self
    }

    /// Set the default target filter
    pub fn with_target(mut self, target: Filter) -> Self {
        self.target = Some(target);
        self
    }

    /// Property key that overrides this reference's target filter
    pub fn target_property(&self) -> String {
        format!("{}.target", self.name)
    }
}

/// Why a description was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidReason {
    /// The component has no name
    EmptyName,
    /// A reference has no name
    EmptyReferenceName,
    /// Two references share a name
    DuplicateReference(String),
    /// Factory combined with a bundle or prototype scope
    FactoryWithServiceFactoryScope,
    /// Immediate combined with a bundle or prototype scope
    ImmediateWithServiceFactoryScope,
    /// Explicitly immediate and also a factory
    ImmediateFactory,
    /// Delayed with neither a provided capability nor a factory id
    DelayedWithoutCapability,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidReason::EmptyName => f.write_str("component name is empty"),
            InvalidReason::EmptyReferenceName => f.write_str("reference name is empty"),
            InvalidReason::DuplicateReference(name) => {
                write!(f, "reference '{name}' is declared more than once")
            }
            InvalidReason::FactoryWithServiceFactoryScope => {
                f.write_str("factory components cannot use a per-consumer scope")
            }
            InvalidReason::ImmediateWithServiceFactoryScope => {
                f.write_str("immediate components cannot use a per-consumer scope")
            }
            InvalidReason::ImmediateFactory => f.write_str("factory components cannot be immediate"),
            InvalidReason::DelayedWithoutCapability => f.write_str(
                "delayed components must provide a capability or declare a factory",
            ),
        }
    }
}

/// A description that failed validation
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("invalid component '{component}': {reason}")]
pub struct InvalidDescription {
    /// Name of the rejected component (may be empty)
    pub component: String,
    /// Rejection reason
    pub reason: InvalidReason,
}

impl InvalidDescription {
    fn new(component: &str, reason: InvalidReason) -> Self {
        Self {
            component: component.to_string(),
            reason,
        }
    }
}

/// Validated, immutable component description
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Description {
    name: String,
    implementation: String,
    provides: Option<CapabilityType>,
    references: Vec<ReferenceDecl>,
    activation: Activation,
    scope: ServiceScope,
    properties: PropertyMap,
    auto_enable: bool,
}

impl Description {
    /// Start building a description
    pub fn builder(name: impl Into<String>) -> DescriptionBuilder {
        DescriptionBuilder::new(name)
    }

    /// Component name, unique within its unit
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key into the implementation table
    pub fn implementation(&self) -> &str {
        &self.implementation
    }

    /// Provided capability, if any
    pub fn provides(&self) -> Option<&CapabilityType> {
        self.provides.as_ref()
    }

    /// Declared references in declaration order
    pub fn references(&self) -> &[ReferenceDecl] {
        &self.references
    }

    /// Look up a reference by name
    pub fn reference(&self, name: &str) -> Option<&ReferenceDecl> {
        self.references.iter().find(|reference| reference.name == name)
    }

    /// Whether any reference targets the interface
    pub fn references_interface(&self, interface: &CapabilityType) -> bool {
        self.references
            .iter()
            .any(|reference| &reference.interface == interface)
    }

    /// Activation mode
    pub fn activation(&self) -> &Activation {
        &self.activation
    }

    /// Service scope
    pub fn scope(&self) -> ServiceScope {
        self.scope
    }

    /// Default properties
    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    /// Whether the component is enabled when its unit becomes available
    pub fn auto_enable(&self) -> bool {
        self.auto_enable
    }

    /// Factory id for factory descriptions
    pub fn factory_id(&self) -> Option<&FactoryId> {
        self.activation.factory_id()
    }

    /// Re-check the validity rules on an already-built description
    pub fn validate(&self) -> Result<(), InvalidDescription> {
        let fail = |reason| Err(InvalidDescription::new(&self.name, reason));
        if self.name.trim().is_empty() {
            return fail(InvalidReason::EmptyName);
        }
        let mut seen = HashSet::new();
        for reference in &self.references {
            if reference.name.trim().is_empty() {
                return fail(InvalidReason::EmptyReferenceName);
            }
            if !seen.insert(reference.name.as_str()) {
                return fail(InvalidReason::DuplicateReference(reference.name.clone()));
            }
        }
        match (&self.activation, self.scope.is_service_factory()) {
            (Activation::Factory(_), true) => fail(InvalidReason::FactoryWithServiceFactoryScope),
            (Activation::Immediate, true) => fail(InvalidReason::ImmediateWithServiceFactoryScope),
            (Activation::Delayed, _) if self.provides.is_none() => {
                fail(InvalidReason::DelayedWithoutCapability)
            }
            _ => Ok(()),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Serde form of a description, as written in unit manifests
///
/// ```toml
/// name = "audit"
/// provides = "audit.Sink"
/// immediate = true
///
/// [properties]
/// retention = 30
///
/// [[reference]]
/// name = "store"
/// interface = "kv.Store"
/// cardinality = "1..1"
/// policy = "dynamic"
/// target = "(tier=hot)"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DescriptionDocument {
    /// Component name
    pub name: String,
    /// Implementation key, defaults to the name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,
    /// Provided capability
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provides: Option<CapabilityType>,
    /// Explicit immediate flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub immediate: Option<bool>,
    /// Factory id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory: Option<FactoryId>,
    /// Service scope
    #[serde(default)]
    pub scope: ServiceScope,
    /// Auto-enable flag
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Default properties
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
    /// Declared references
    #[serde(default, rename = "reference")]
    pub references: Vec<ReferenceDecl>,
}

impl DescriptionDocument {
    /// Minimal document with defaults for everything but the name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            implementation: None,
            provides: None,
            immediate: None,
            factory: None,
            scope: ServiceScope::Singleton,
            enabled: true,
            properties: BTreeMap::new(),
            references: Vec::new(),
        }
    }
}

impl TryFrom<DescriptionDocument> for Description {
    type Error = InvalidDescription;

    fn try_from(doc: DescriptionDocument) -> Result<Self, Self::Error> {
        if doc.factory.is_some() && doc.immediate == Some(true) {
            return Err(InvalidDescription::new(
                &doc.name,
                InvalidReason::ImmediateFactory,
            ));
        }
        let immediate = doc
            .immediate
            .unwrap_or(doc.provides.is_none() && doc.factory.is_none());
        let activation = match (doc.factory, immediate) {
            (Some(factory), _) => Activation::Factory(factory),
            (None, true) => Activation::Immediate,
            (None, false) => Activation::Delayed,
        };
        let description = Description {
            implementation: doc.implementation.unwrap_or_else(|| doc.name.clone()),
            name: doc.name,
            provides: doc.provides,
            references: doc.references,
            activation,
            scope: doc.scope,
            properties: PropertyMap::from(doc.properties),
            auto_enable: doc.enabled,
        };
        description.validate()?;
        Ok(description)
    }
}

/// Programmatic construction of descriptions
///
/// Builds a [`DescriptionDocument`] and converts it, so defaults and
/// validation are identical to manifest parsing.
#[derive(Debug, Clone)]
pub struct DescriptionBuilder {
    doc: DescriptionDocument,
}

impl DescriptionBuilder {
    /// New builder for a component name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            doc: DescriptionDocument::new(name),
        }
    }

    /// Implementation key
    pub fn implementation(mut self, implementation: impl Into<String>) -> Self {
        self.doc.implementation = Some(implementation.into());
        self
    }

    /// Provided capability
    pub fn provides(mut self, interface: impl Into<CapabilityType>) -> Self {
        self.doc.provides = Some(interface.into());
        self
    }

    /// Add a reference
    pub fn reference(mut self, reference: ReferenceDecl) -> Self {
        self.doc.references.push(reference);
        self
    }

    /// Mark as immediate
    pub fn immediate(mut self) -> Self {
        self.doc.immediate = Some(true);
        self
    }

    /// Mark as delayed
    pub fn delayed(mut self) -> Self {
        self.doc.immediate = Some(false);
        self
    }

    /// Declare a factory id
    pub fn factory(mut self, factory: impl Into<String>) -> Self {
        self.doc.factory = Some(FactoryId::new(factory));
        self
    }

    /// Service scope
    pub fn scope(mut self, scope: ServiceScope) -> Self {
        self.doc.scope = scope;
        self
    }

    /// Add a default property
    pub fn property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.doc.properties.insert(key.into(), value.into());
        self
    }

    /// Auto-enable flag
    pub fn auto_enable(mut self, enabled: bool) -> Self {
        self.doc.enabled = enabled;
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<Description, InvalidDescription> {
        Description::try_from(self.doc)
    }
}
