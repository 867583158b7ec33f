//! Ordered record of lifecycle hooks and registry events

use orrery_core::{CapabilityId, ConfigurationId, UnitId};
use orrery_runtime::{CapabilityEvent, CapabilityRegistry, DeactivationReason, ListenerId};
use parking_lot::Mutex;
use std::sync::Arc;

/// One observed event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A probe was constructed
    Constructed {
        component: String,
        config: ConfigurationId,
        using: Option<UnitId>,
    },
    /// A probe's activation hook ran
    Activated {
        component: String,
        config: ConfigurationId,
    },
    /// A probe's deactivation hook ran
    Deactivated {
        component: String,
        config: ConfigurationId,
        reason: DeactivationReason,
    },
    /// A probe's bind hook ran
    Bound {
        component: String,
        reference: String,
        capability: CapabilityId,
    },
    /// A probe's unbind hook ran
    Unbound {
        component: String,
        reference: String,
        capability: CapabilityId,
    },
    /// The registry announced a capability
    Registered {
        interface: String,
        capability: CapabilityId,
    },
    /// The registry removed a capability
    Unregistered {
        interface: String,
        capability: CapabilityId,
    },
}

impl Event {
    /// Component the event concerns, for hook events
    pub fn component(&self) -> Option<&str> {
        match self {
            Event::Constructed { component, .. }
            | Event::Activated { component, .. }
            | Event::Deactivated { component, .. }
            | Event::Bound { component, .. }
            | Event::Unbound { component, .. } => Some(component),
            Event::Registered { .. } | Event::Unregistered { .. } => None,
        }
    }
}

/// Shared, append-only event log
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    /// Empty log
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append an event
    pub fn record(&self, event: Event) {
        self.events.lock().push(event);
    }

    /// Copy of every event so far
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Number of events matching a predicate
    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }

    /// Index of the first event matching a predicate
    pub fn position(&self, predicate: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events.lock().iter().position(predicate)
    }

    /// How many times a component was activated
    pub fn activations(&self, component: &str) -> usize {
        self.count(|event| matches!(event, Event::Activated { component: c, .. } if c == component))
    }

    /// How many times a component was deactivated
    pub fn deactivations(&self, component: &str) -> usize {
        self.count(|event| matches!(event, Event::Deactivated { component: c, .. } if c == component))
    }

    /// Hook events of one component, in order
    pub fn of(&self, component: &str) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.component() == Some(component))
            .cloned()
            .collect()
    }

    /// Deactivated components in deactivation order
    pub fn deactivation_order(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Deactivated { component, .. } => Some(component.clone()),
                _ => None,
            })
            .collect()
    }

    /// Record registry arrivals and departures
    ///
    /// The listener runs synchronously inside the registry, so its entries
    /// interleave exactly with hook events.
    pub fn watch(self: &Arc<Self>, registry: &dyn CapabilityRegistry) -> ListenerId {
        let log = self.clone();
        registry.add_listener(Arc::new(move |event: &CapabilityEvent| {
            let capability = event.capability();
            match event {
                CapabilityEvent::Arrived(_) => log.record(Event::Registered {
                    interface: capability.interface.to_string(),
                    capability: capability.id,
                }),
                CapabilityEvent::Departed(_) => log.record(Event::Unregistered {
                    interface: capability.interface.to_string(),
                    capability: capability.id,
                }),
                CapabilityEvent::Modified(_) => {}
            }
        }))
    }
}
