//! Capability registry
//!
//! The registry is an external collaborator: the engine only needs the
//! narrow [`CapabilityRegistry`] trait. [`InMemoryRegistry`] is the
//! reference implementation used for embedding and tests.
//!
//! ## Event delivery
//!
//! Listeners are called synchronously on the mutating thread, always after
//! the registry has released its own lock, so a listener may call back into
//! the registry.

use orrery_core::capability::{ID_PROPERTY, INTERFACE_PROPERTY};
use orrery_core::{
    sort_candidates, CapabilityId, CapabilityRef, CapabilityType, Filter, PropertyMap, UnitId,
};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A capability object handed to consumers
///
/// Consumers downcast to the concrete type they expect.
pub type Object = Arc<dyn Any + Send + Sync>;

/// Produces the object behind a registered capability
pub trait CapabilityProvider: Send + Sync {
    /// Obtain the object on behalf of `consumer`
    ///
    /// Returning `None` means the capability is currently unavailable to
    /// this consumer; callers treat it like a failed lookup.
    fn get(&self, consumer: &UnitId) -> Option<Object>;

    /// Give back an object previously obtained by `consumer`
    fn release(&self, consumer: &UnitId, object: &Object) {
        let _ = (consumer, object);
    }
}

/// Provider for a plain, already constructed object
pub struct SingletonProvider {
    object: Object,
}

impl SingletonProvider {
    /// Wrap an object
    pub fn new(object: Object) -> Self {
        Self { object }
    }
}

impl CapabilityProvider for SingletonProvider {
    fn get(&self, _consumer: &UnitId) -> Option<Object> {
        Some(self.object.clone())
    }
}

/// Registry change notification
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityEvent {
    /// A capability was registered
    Arrived(CapabilityRef),
    /// A registered capability changed its properties
    Modified(CapabilityRef),
    /// A capability was unregistered
    Departed(CapabilityRef),
}

impl CapabilityEvent {
    /// The capability the event is about
    pub fn capability(&self) -> &CapabilityRef {
        match self {
            CapabilityEvent::Arrived(capability)
            | CapabilityEvent::Modified(capability)
            | CapabilityEvent::Departed(capability) => capability,
        }
    }

    /// Short event name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            CapabilityEvent::Arrived(_) => "arrived",
            CapabilityEvent::Modified(_) => "modified",
            CapabilityEvent::Departed(_) => "departed",
        }
    }
}

/// Receives registry events
pub trait CapabilityListener: Send + Sync {
    /// Handle one event
    fn on_event(&self, event: &CapabilityEvent);
}

impl<F> CapabilityListener for F
where
    F: Fn(&CapabilityEvent) + Send + Sync,
{
    fn on_event(&self, event: &CapabilityEvent) {
        self(event)
    }
}

/// Handle for removing a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// What the engine needs from a capability registry
pub trait CapabilityRegistry: Send + Sync {
    /// Register a capability and notify listeners with `Arrived`
    fn register(
        &self,
        interface: CapabilityType,
        properties: PropertyMap,
        provider: Arc<dyn CapabilityProvider>,
    ) -> CapabilityRef;

    /// Remove a capability and notify listeners with `Departed`
    ///
    /// Returns `false` when the id is not registered.
    fn unregister(&self, id: CapabilityId) -> bool;

    /// Replace a capability's properties and notify listeners with `Modified`
    fn set_properties(&self, id: CapabilityId, properties: PropertyMap) -> Option<CapabilityRef>;

    /// Capabilities of an interface matching an optional filter, in
    /// candidate order (rank descending, then id ascending)
    fn find_matching(&self, interface: &CapabilityType, filter: Option<&Filter>)
        -> Vec<CapabilityRef>;

    /// Current handle for an id
    fn lookup(&self, id: CapabilityId) -> Option<CapabilityRef>;

    /// Obtain the object behind a capability
    ///
    /// For delayed components this is the first-touch activation trigger.
    fn get_object(&self, id: CapabilityId, consumer: &UnitId) -> Option<Object>;

    /// Release an object obtained through [`CapabilityRegistry::get_object`]
    fn unget_object(&self, id: CapabilityId, consumer: &UnitId, object: &Object);

    /// Subscribe to registry events
    fn add_listener(&self, listener: Arc<dyn CapabilityListener>) -> ListenerId;

    /// Unsubscribe
    fn remove_listener(&self, id: ListenerId) -> bool;
}

struct Entry {
    handle: CapabilityRef,
    provider: Arc<dyn CapabilityProvider>,
}

#[derive(Default)]
struct RegistryInner {
    entries: BTreeMap<CapabilityId, Entry>,
    listeners: Vec<(ListenerId, Arc<dyn CapabilityListener>)>,
    next_capability: u64,
    next_listener: u64,
}

/// Thread-safe in-memory registry
///
/// Capability ids start at 1 and are never reused. The registry stamps
/// `capability.id` and `capability.interface` onto every property snapshot.
#[derive(Default)]
pub struct InMemoryRegistry {
    inner: RwLock<RegistryInner>,
}

impl InMemoryRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience: register a plain object
    pub fn register_object(
        &self,
        interface: impl Into<CapabilityType>,
        properties: PropertyMap,
        object: Object,
    ) -> CapabilityRef {
        self.register(
            interface.into(),
            properties,
            Arc::new(SingletonProvider::new(object)),
        )
    }

    /// Number of registered capabilities
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Every registered capability, in id order
    pub fn all(&self) -> Vec<CapabilityRef> {
        self.inner
            .read()
            .entries
            .values()
            .map(|entry| entry.handle.clone())
            .collect()
    }

    fn stamp(id: CapabilityId, interface: &CapabilityType, properties: &PropertyMap) -> PropertyMap {
        properties
            .with(ID_PROPERTY, id.0 as i64)
            .with(INTERFACE_PROPERTY, interface.as_str())
    }

    fn notify(&self, event: CapabilityEvent) {
        let listeners: Vec<Arc<dyn CapabilityListener>> = self
            .inner
            .read()
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        tracing::trace!(
            capability = %event.capability().id,
            event = event.kind(),
            listeners = listeners.len(),
            "delivering registry event"
        );
        for listener in listeners {
            listener.on_event(&event);
        }
    }
}

impl CapabilityRegistry for InMemoryRegistry {
    fn register(
        &self,
        interface: CapabilityType,
        properties: PropertyMap,
        provider: Arc<dyn CapabilityProvider>,
    ) -> CapabilityRef {
        let handle = {
            let mut inner = self.inner.write();
            inner.next_capability += 1;
            let id = CapabilityId(inner.next_capability);
            let properties = Self::stamp(id, &interface, &properties);
            let handle = CapabilityRef::new(id, interface, properties);
            inner.entries.insert(
                id,
                Entry {
                    handle: handle.clone(),
                    provider,
                },
            );
            handle
        };
        tracing::debug!(capability = %handle.id, interface = %handle.interface, rank = handle.rank, "capability registered");
        self.notify(CapabilityEvent::Arrived(handle.clone()));
        handle
    }

    fn unregister(&self, id: CapabilityId) -> bool {
        let removed = self.inner.write().entries.remove(&id);
        match removed {
            Some(entry) => {
                tracing::debug!(capability = %id, interface = %entry.handle.interface, "capability unregistered");
                self.notify(CapabilityEvent::Departed(entry.handle));
                true
            }
            None => false,
        }
    }

    fn set_properties(&self, id: CapabilityId, properties: PropertyMap) -> Option<CapabilityRef> {
        let handle = {
            let mut inner = self.inner.write();
            let entry = inner.entries.get_mut(&id)?;
            let properties = Self::stamp(id, &entry.handle.interface, &properties);
            entry.handle = CapabilityRef::new(id, entry.handle.interface.clone(), properties);
            entry.handle.clone()
        };
        self.notify(CapabilityEvent::Modified(handle.clone()));
        Some(handle)
    }

    fn find_matching(
        &self,
        interface: &CapabilityType,
        filter: Option<&Filter>,
    ) -> Vec<CapabilityRef> {
        let mut found: Vec<CapabilityRef> = self
            .inner
            .read()
            .entries
            .values()
            .filter(|entry| entry.handle.matches(interface, filter))
            .map(|entry| entry.handle.clone())
            .collect();
        sort_candidates(&mut found);
        found
    }

    fn lookup(&self, id: CapabilityId) -> Option<CapabilityRef> {
        self.inner
            .read()
            .entries
            .get(&id)
            .map(|entry| entry.handle.clone())
    }

    fn get_object(&self, id: CapabilityId, consumer: &UnitId) -> Option<Object> {
        // The provider may activate a component, which registers further
        // capabilities; never call it with the lock held.
        let provider = self.inner.read().entries.get(&id)?.provider.clone();
        provider.get(consumer)
    }

    fn unget_object(&self, id: CapabilityId, consumer: &UnitId, object: &Object) {
        let provider = match self.inner.read().entries.get(&id) {
            Some(entry) => entry.provider.clone(),
            None => return,
        };
        provider.release(consumer, object);
    }

    fn add_listener(&self, listener: Arc<dyn CapabilityListener>) -> ListenerId {
        let mut inner = self.inner.write();
        inner.next_listener += 1;
        let id = ListenerId(inner.next_listener);
        inner.listeners.push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.write();
        let before = inner.listeners.len();
        inner.listeners.retain(|(existing, _)| *existing != id);
        inner.listeners.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orrery_core::capability::RANK_PROPERTY;
    use parking_lot::Mutex;

    fn object(value: u32) -> Object {
        Arc::new(value)
    }

    #[test]
    fn test_ids_start_at_one_and_are_stamped() {
        let registry = InMemoryRegistry::new();
        let first = registry.register_object("log", PropertyMap::new(), object(1));
        let second = registry.register_object("log", PropertyMap::new(), object(2));
        assert_eq!(first.id, CapabilityId(1));
        assert_eq!(second.id, CapabilityId(2));
        assert_eq!(
            first.properties.get(INTERFACE_PROPERTY).and_then(|v| v.as_str()),
            Some("log")
        );
        assert_eq!(first.properties.get(ID_PROPERTY).and_then(|v| v.as_int()), Some(1));
    }

    #[test]
    fn test_find_matching_orders_by_rank() {
        let registry = InMemoryRegistry::new();
        for rank in [5i64, 10, 5] {
            registry.register_object("x", PropertyMap::new().with(RANK_PROPERTY, rank), object(0));
        }
        registry.register_object("y", PropertyMap::new().with(RANK_PROPERTY, 100i64), object(0));
        let ids: Vec<u64> = registry
            .find_matching(&"x".into(), None)
            .iter()
            .map(|c| c.id.0)
            .collect();
        assert_eq!(ids, vec![2, 1, 3]);

        let filter = Filter::parse("(capability.rank=5)").unwrap();
        assert_eq!(registry.find_matching(&"x".into(), Some(&filter)).len(), 2);
    }

    #[test]
    fn test_listener_sees_events_and_can_reenter() {
        let registry = Arc::new(InMemoryRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let weak = Arc::downgrade(&registry);
        let sink = seen.clone();
        let listener_id = registry.add_listener(Arc::new(move |event: &CapabilityEvent| {
            // Re-entrant read while delivering
            let present = weak
                .upgrade()
                .map(|r| r.lookup(event.capability().id).is_some())
                .unwrap_or(false);
            sink.lock().push((event.kind(), present));
        }));

        let handle = registry.register_object("x", PropertyMap::new(), object(1));
        registry.set_properties(handle.id, PropertyMap::new().with("a", 1i64));
        assert!(registry.unregister(handle.id));
        assert!(!registry.unregister(handle.id));

        assert_eq!(
            *seen.lock(),
            vec![("arrived", true), ("modified", true), ("departed", false)]
        );
        assert!(registry.remove_listener(listener_id));
        assert!(!registry.remove_listener(listener_id));
    }

    #[test]
    fn test_get_object_downcasts() {
        let registry = InMemoryRegistry::new();
        let handle = registry.register_object("x", PropertyMap::new(), object(42));
        let consumer = UnitId::new("consumer");
        let value = registry
            .get_object(handle.id, &consumer)
            .and_then(|o| o.downcast::<u32>().ok())
            .unwrap();
        assert_eq!(*value, 42);
        assert!(registry.get_object(CapabilityId(99), &consumer).is_none());
    }

    #[test]
    fn test_set_properties_rederives_rank() {
        let registry = InMemoryRegistry::new();
        let handle = registry.register_object("x", PropertyMap::new(), object(1));
        assert_eq!(handle.rank, 0);
        let updated = registry
            .set_properties(handle.id, PropertyMap::new().with(RANK_PROPERTY, 7i64))
            .unwrap();
        assert_eq!(updated.rank, 7);
        assert_eq!(registry.lookup(handle.id).unwrap().rank, 7);
    }
}
