//! User component traits and the implementation table
//!
//! Hooks are explicit trait methods. A component overrides only the hooks it
//! cares about; the defaults do nothing, so an unimplemented hook is simply
//! never observable. Constructors are registered by implementation key in
//! [`Implementations`], which descriptions reference through
//! [`Description::implementation`](orrery_core::Description::implementation).

use crate::context::ComponentContext;
use crate::errors::{DeactivationReason, HookError};
use crate::registry::Object;
use orrery_core::CapabilityRef;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Conversion of a shared component into a capability object
pub trait AsObject {
    /// Upcast to the type-erased object handed to consumers
    fn as_object(self: Arc<Self>) -> Object;
}

impl<T: Any + Send + Sync> AsObject for T {
    fn as_object(self: Arc<Self>) -> Object {
        self
    }
}

/// Lifecycle hooks of a component instance
pub trait Component: AsObject + Send + Sync + 'static {
    /// Called once all references are bound, before the provided capability
    /// is registered
    fn activate(&self, ctx: &ComponentContext) -> Result<(), HookError> {
        let _ = ctx;
        Ok(())
    }

    /// Called after the provided capability is unregistered and before
    /// references are unbound. Failures are logged; teardown continues.
    fn deactivate(&self, ctx: &ComponentContext, reason: DeactivationReason) -> Result<(), HookError> {
        let _ = (ctx, reason);
        Ok(())
    }

    /// A capability was bound to `reference`
    fn bind(
        &self,
        ctx: &ComponentContext,
        reference: &str,
        capability: &CapabilityRef,
    ) -> Result<(), HookError> {
        let _ = (ctx, reference, capability);
        Ok(())
    }

    /// A capability was unbound from `reference`
    fn unbind(
        &self,
        ctx: &ComponentContext,
        reference: &str,
        capability: &CapabilityRef,
    ) -> Result<(), HookError> {
        let _ = (ctx, reference, capability);
        Ok(())
    }

    /// Object published for the provided capability
    ///
    /// Defaults to the component itself, so consumers downcast to the
    /// concrete component type.
    fn capability_object(self: Arc<Self>) -> Object {
        self.as_object()
    }
}

/// Builds component instances
pub trait ComponentFactory: Send + Sync {
    /// Construct a new, not yet activated instance
    fn construct(&self, ctx: &ComponentContext) -> Result<Arc<dyn Component>, HookError>;
}

impl<F> ComponentFactory for F
where
    F: Fn(&ComponentContext) -> Result<Arc<dyn Component>, HookError> + Send + Sync,
{
    fn construct(&self, ctx: &ComponentContext) -> Result<Arc<dyn Component>, HookError> {
        self(ctx)
    }
}

/// Constructor table keyed by implementation name
///
/// Cloning shares the table, so constructors registered after the engine is
/// built are still found.
#[derive(Clone, Default)]
pub struct Implementations {
    table: Arc<RwLock<HashMap<String, Arc<dyn ComponentFactory>>>>,
}

impl Implementations {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor, replacing any previous one for the key
    pub fn register(&self, key: impl Into<String>, factory: impl ComponentFactory + 'static) {
        let key = key.into();
        if self
            .table
            .write()
            .insert(key.clone(), Arc::new(factory))
            .is_some()
        {
            tracing::debug!(implementation = %key, "implementation replaced");
        }
    }

    /// Register a constructor closure
    pub fn register_fn<F>(&self, key: impl Into<String>, constructor: F)
    where
        F: Fn(&ComponentContext) -> Result<Arc<dyn Component>, HookError> + Send + Sync + 'static,
    {
        self.register(key, constructor);
    }

    /// Register a type constructed through `Default`
    pub fn register_default<T: Component + Default>(&self, key: impl Into<String>) {
        self.register_fn(key, |_| Ok(Arc::new(T::default()) as Arc<dyn Component>));
    }

    /// Builder-style registration
    pub fn with(self, key: impl Into<String>, factory: impl ComponentFactory + 'static) -> Self {
        self.register(key, factory);
        self
    }

    /// Look up a constructor
    pub fn get(&self, key: &str) -> Option<Arc<dyn ComponentFactory>> {
        self.table.read().get(key).cloned()
    }

    /// Whether a constructor exists for the key
    pub fn contains(&self, key: &str) -> bool {
        self.table.read().contains_key(key)
    }

    /// Registered keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.table.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl std::fmt::Debug for Implementations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Implementations")
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Plain;

    impl Component for Plain {}

    #[test]
    fn test_component_upcasts_to_its_concrete_type() {
        let component: Arc<dyn Component> = Arc::new(Plain);
        let object = component.capability_object();
        assert!(object.downcast::<Plain>().is_ok());
    }

    #[test]
    fn test_table_is_shared_between_clones() {
        let table = Implementations::new();
        let clone = table.clone();
        clone.register_default::<Plain>("plain");
        assert!(table.contains("plain"));
        assert!(table.get("missing").is_none());
        assert_eq!(table.keys(), vec!["plain".to_string()]);
    }
}
