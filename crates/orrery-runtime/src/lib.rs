//! # Orrery Runtime
//!
//! Resolver, lifecycle state machine and work queue for declaratively
//! described components.
//!
//! Given [`orrery_core::Description`]s and a [`CapabilityRegistry`], the
//! [`Engine`] continuously computes which configurations can run, activates
//! them in dependency order, publishes what they provide, and keeps their
//! reference bindings current as capabilities come and go.
//!
//! ## Layers
//!
//! - **Registry**: the external capability registry trait and an in-memory
//!   implementation
//! - **Bindings & configurations**: per-reference and per-configuration state
//! - **Resolver**: the fixed-point satisfiability pass and rebinding rules
//! - **Lifecycle**: activation, teardown, delayed and factory instances
//! - **Work queue**: the single worker every structural decision runs on
//!
//! ## Example
//!
//! ```ignore
//! let implementations = Implementations::new();
//! implementations.register_default::<Clock>("clock");
//!
//! let engine = Engine::with_defaults(implementations)?;
//! let unit = StaticUnit::new("app").with(
//!     Description::builder("clock").provides("time.Clock").immediate().build()?,
//! );
//! engine.unit_available(&unit)?;
//! engine.flush()?;
//! ```

#![forbid(unsafe_code)]

/// Component and factory traits, implementation table
pub mod component;

/// Engine configuration
pub mod config;

/// Configuration arena entries and lifecycle states
pub mod configuration;

/// Context handed to components
pub mod context;

/// The engine value and its public API
pub mod engine;

/// Error types
pub mod errors;

/// Component factories and produced instances
pub mod factory;

/// Deployment unit abstraction
pub mod host;

/// Capability registry trait and in-memory implementation
pub mod registry;

/// Single-worker job queue
pub mod queue;

/// Status snapshots
pub mod status;

mod binding;
mod lifecycle;
mod resolver;

pub use binding::{Binding, TargetFilter};
pub use component::{AsObject, Component, ComponentFactory, Implementations};
pub use config::EngineConfig;
pub use configuration::{ConfigState, Origin};
pub use context::ComponentContext;
pub use engine::{DisableOutcome, Engine};
pub use errors::{
    ActivationError, ConfigError, DeactivationReason, EngineError, HookError, QueueError, Result,
};
pub use factory::{ComponentFactoryHandle, DisposeOutcome, InstanceHandle};
pub use host::{DeploymentUnit, ManifestUnit, StaticUnit};
pub use queue::{QueueStats, WorkQueue};
pub use registry::{
    CapabilityEvent, CapabilityListener, CapabilityProvider, CapabilityRegistry, InMemoryRegistry,
    ListenerId, Object, SingletonProvider,
};
pub use resolver::InvalidRecord;
pub use status::{BindingSnapshot, ConfigurationSnapshot, EngineSnapshot};
