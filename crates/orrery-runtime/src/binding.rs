//! Per-reference binding state
//!
//! A [`Binding`] tracks which capabilities are bound to one declared
//! reference of one configuration. Iteration order is bind order, so the
//! first bound handle of a multiple reference is the one that ranked highest
//! when it was bound.

use crate::registry::Object;
use indexmap::IndexMap;
use orrery_core::{BindingPolicy, CapabilityId, CapabilityRef, Filter, PropertyMap, ReferenceDecl};
use std::collections::HashMap;

/// Effective target filter of a reference
#[derive(Debug, Clone, PartialEq)]
pub enum TargetFilter {
    /// Match every capability of the interface
    Any,
    /// Match capabilities whose properties satisfy the filter
    Filter(Filter),
    /// The `<name>.target` override did not parse; nothing matches
    Unmatchable(String),
}

impl TargetFilter {
    /// Resolve the filter for a reference against configuration properties
    ///
    /// The `<name>.target` property takes precedence over the declared
    /// default.
    pub fn resolve(decl: &ReferenceDecl, properties: &PropertyMap) -> Self {
        let key = decl.target_property();
        match properties.get(&key) {
            Some(value) => match value.as_str().map(Filter::parse) {
                Some(Ok(filter)) => TargetFilter::Filter(filter),
                Some(Err(error)) => {
                    tracing::warn!(reference = %decl.name, %error, "target override does not parse; reference cannot bind");
                    TargetFilter::Unmatchable(error.to_string())
                }
                None => {
                    tracing::warn!(reference = %decl.name, "target override is not a string; reference cannot bind");
                    TargetFilter::Unmatchable(format!("{key} is not a string"))
                }
            },
            None => match &decl.target {
                Some(filter) => TargetFilter::Filter(filter.clone()),
                None => TargetFilter::Any,
            },
        }
    }

    /// Filter to pass to the registry, `None` meaning "everything"
    pub fn as_filter(&self) -> Option<&Filter> {
        match self {
            TargetFilter::Filter(filter) => Some(filter),
            _ => None,
        }
    }

    /// Whether this target can match anything at all
    pub fn is_matchable(&self) -> bool {
        !matches!(self, TargetFilter::Unmatchable(_))
    }
}

/// Runtime state of one declared reference
#[derive(Debug, Clone)]
pub struct Binding {
    decl: ReferenceDecl,
    target: TargetFilter,
    bound: IndexMap<CapabilityId, CapabilityRef>,
    objects: HashMap<CapabilityId, Object>,
}

impl Binding {
    /// Unbound state for a reference
    pub fn new(decl: ReferenceDecl, properties: &PropertyMap) -> Self {
        let target = TargetFilter::resolve(&decl, properties);
        Self {
            decl,
            target,
            bound: IndexMap::new(),
            objects: HashMap::new(),
        }
    }

    /// Declared reference
    pub fn decl(&self) -> &ReferenceDecl {
        &self.decl
    }

    /// Reference name
    pub fn name(&self) -> &str {
        &self.decl.name
    }

    /// Effective target filter
    pub fn target(&self) -> &TargetFilter {
        &self.target
    }

    /// Whether the binding uses the dynamic policy
    pub fn is_dynamic(&self) -> bool {
        self.decl.policy == BindingPolicy::Dynamic
    }

    /// Whether a capability satisfies interface and effective target
    pub fn matches(&self, candidate: &CapabilityRef) -> bool {
        self.target.is_matchable() && candidate.matches(&self.decl.interface, self.target.as_filter())
    }

    /// Whether another capability may be bound
    pub fn has_room(&self) -> bool {
        self.decl
            .cardinality
            .max()
            .map_or(true, |max| self.bound.len() < max)
    }

    /// Whether the minimum cardinality is met
    pub fn is_satisfied(&self) -> bool {
        self.bound.len() >= self.decl.cardinality.min()
    }

    /// Bind a candidate
    ///
    /// Returns `false` without changing anything when the candidate is
    /// already bound or there is no room left.
    pub fn try_bind(&mut self, candidate: CapabilityRef) -> bool {
        if self.bound.contains_key(&candidate.id) || !self.has_room() {
            return false;
        }
        self.bound.insert(candidate.id, candidate);
        true
    }

    /// Unbind a capability, returning its handle and any cached object
    ///
    /// Unbinding an unbound id is a no-op returning `None`.
    pub fn unbind(&mut self, id: CapabilityId) -> Option<(CapabilityRef, Option<Object>)> {
        let handle = self.bound.shift_remove(&id)?;
        let object = self.objects.remove(&id);
        Some((handle, object))
    }

    /// Refresh the snapshot of a bound capability after a property change
    pub fn refresh(&mut self, handle: &CapabilityRef) -> bool {
        match self.bound.get_mut(&handle.id) {
            Some(bound) => {
                *bound = handle.clone();
                true
            }
            None => false,
        }
    }

    /// Whether a capability is bound
    pub fn is_bound(&self, id: CapabilityId) -> bool {
        self.bound.contains_key(&id)
    }

    /// Bound handles in bind order
    pub fn bound(&self) -> impl Iterator<Item = &CapabilityRef> {
        self.bound.values()
    }

    /// Number of bound capabilities
    pub fn bound_len(&self) -> usize {
        self.bound.len()
    }

    /// Bound ids in bind order
    pub fn bound_ids(&self) -> Vec<CapabilityId> {
        self.bound.keys().copied().collect()
    }

    /// Cached object for a bound capability
    pub fn cached_object(&self, id: CapabilityId) -> Option<Object> {
        self.objects.get(&id).cloned()
    }

    /// Cache an object obtained for a bound capability
    ///
    /// Returns `false` (and caches nothing) if the capability is no longer
    /// bound or an object is already cached; the caller must then release
    /// the object it obtained.
    pub fn cache_object(&mut self, id: CapabilityId, object: Object) -> bool {
        if !self.bound.contains_key(&id) || self.objects.contains_key(&id) {
            return false;
        }
        self.objects.insert(id, object);
        true
    }

    /// Unbind everything, returning handles and cached objects in reverse
    /// bind order
    pub fn clear(&mut self) -> Vec<(CapabilityRef, Option<Object>)> {
        let mut released = Vec::with_capacity(self.bound.len());
        while let Some((id, handle)) = self.bound.pop() {
            let object = self.objects.remove(&id);
            released.push((handle, object));
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orrery_core::capability::RANK_PROPERTY;
    use orrery_core::Cardinality;
    use std::sync::Arc;

    fn handle(id: u64, interface: &str) -> CapabilityRef {
        CapabilityRef::new(CapabilityId(id), interface.into(), PropertyMap::new())
    }

    #[test]
    fn test_single_binding_has_room_for_one() {
        let mut binding = Binding::new(ReferenceDecl::new("log", "log"), &PropertyMap::new());
        assert!(!binding.is_satisfied());
        assert!(binding.try_bind(handle(1, "log")));
        assert!(binding.is_satisfied());
        assert!(!binding.has_room());
        // Already bound and full are both no-ops
        assert!(!binding.try_bind(handle(1, "log")));
        assert!(!binding.try_bind(handle(2, "log")));
        assert_eq!(binding.bound_ids(), vec![CapabilityId(1)]);
    }

    #[test]
    fn test_multiple_binding_keeps_insertion_order() {
        let decl = ReferenceDecl::new("sinks", "sink").with_cardinality(Cardinality::OptionalMultiple);
        let mut binding = Binding::new(decl, &PropertyMap::new());
        assert!(binding.is_satisfied());
        for id in [3, 1, 2] {
            assert!(binding.try_bind(handle(id, "sink")));
        }
        assert_eq!(
            binding.bound_ids(),
            vec![CapabilityId(3), CapabilityId(1), CapabilityId(2)]
        );
        assert!(binding.unbind(CapabilityId(1)).is_some());
        assert!(binding.unbind(CapabilityId(1)).is_none());
        assert_eq!(binding.bound_ids(), vec![CapabilityId(3), CapabilityId(2)]);
    }

    #[test]
    fn test_target_override_replaces_default() {
        let decl = ReferenceDecl::new("store", "kv").with_target(Filter::equal("tier", "hot"));
        let cold = CapabilityRef::new(CapabilityId(1), "kv".into(), PropertyMap::new().with("tier", "cold"));
        let hot = CapabilityRef::new(CapabilityId(2), "kv".into(), PropertyMap::new().with("tier", "hot"));

        let binding = Binding::new(decl.clone(), &PropertyMap::new());
        assert!(binding.matches(&hot));
        assert!(!binding.matches(&cold));

        let overridden = Binding::new(decl, &PropertyMap::new().with("store.target", "(tier=cold)"));
        assert!(overridden.matches(&cold));
        assert!(!overridden.matches(&hot));
    }

    #[test]
    fn test_unparsable_override_never_matches() {
        let decl = ReferenceDecl::new("store", "kv");
        let binding = Binding::new(decl, &PropertyMap::new().with("store.target", "(tier="));
        assert!(!binding.target().is_matchable());
        assert!(!binding.matches(&handle(1, "kv")));
    }

    #[test]
    fn test_object_cache_follows_binding() {
        let mut binding = Binding::new(ReferenceDecl::new("log", "log").optional(), &PropertyMap::new());
        let object: Object = Arc::new(5u8);
        assert!(!binding.cache_object(CapabilityId(1), object.clone()));
        binding.try_bind(CapabilityRef::new(
            CapabilityId(1),
            "log".into(),
            PropertyMap::new().with(RANK_PROPERTY, 1i64),
        ));
        assert!(binding.cache_object(CapabilityId(1), object.clone()));
        assert!(!binding.cache_object(CapabilityId(1), object));
        let released = binding.clear();
        assert_eq!(released.len(), 1);
        assert!(released[0].1.is_some());
        assert!(binding.cached_object(CapabilityId(1)).is_none());
    }
}
