//! Instance lifecycle
//!
//! Activation order within one configuration: construct the object, bind
//! references (failing if a mandatory one cannot be bound at this instant),
//! run bind hooks, run the activation hook, and only then register the
//! provided capability. Teardown is the exact reverse: unregister first, then
//! the deactivation hook, then unbind hooks, then release bound objects.
//!
//! Hook failures and panics never escape: activation failures revert the
//! configuration to a resolvable state, teardown failures are logged and
//! teardown completes anyway.

use crate::binding::Binding;
use crate::component::ComponentFactory;
use crate::configuration::{ConfigState, Instance, PendingAction};
use crate::context::{ComponentContext, LocateTarget};
use crate::engine::EngineCore;
use crate::errors::{ActivationError, DeactivationReason, HookError};
use crate::registry::{CapabilityProvider, Object, SingletonProvider};
use orrery_core::capability::{
    COMPONENT_FACTORY_INTERFACE, COMPONENT_FACTORY_PROPERTY, COMPONENT_ID_PROPERTY,
    COMPONENT_NAME_PROPERTY,
};
use orrery_core::{
    CapabilityRef, CapabilityType, ConfigurationId, Description, PropertyMap, ServiceScope, UnitId,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

/// Run a user hook, turning panics into errors
pub(crate) fn guarded<T>(hook: impl FnOnce() -> Result<T, HookError>) -> Result<T, HookError> {
    match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(result) => result,
        Err(payload) => Err(HookError::from_panic(payload.as_ref())),
    }
}

/// Everything an activation needs, captured before the state lock is released
struct ActivationPlan {
    id: ConfigurationId,
    description: Arc<Description>,
    unit: UnitId,
    properties: PropertyMap,
    using: Option<UnitId>,
    /// Unbound bindings to establish, `None` when adding an instance to an
    /// already active per-consumer configuration
    fresh: Option<Vec<Binding>>,
    prior: ConfigState,
    factory: Arc<dyn ComponentFactory>,
}

/// Outcome of looking for a reusable delayed instance
enum DelayedLookup {
    Reuse(Object),
    Create,
}

/// Placeholder provider of a delayed component
///
/// The first `get` activates the configuration. Calls from other threads
/// are forwarded to the worker and wait for it.
pub(crate) struct DelayedProvider {
    engine: Weak<EngineCore>,
    config: ConfigurationId,
}

impl CapabilityProvider for DelayedProvider {
    fn get(&self, consumer: &UnitId) -> Option<Object> {
        let engine = self.engine.upgrade()?;
        let config = self.config;
        let consumer = consumer.clone();
        match engine.submit(move |core| core.obtain_delayed(config, &consumer)) {
            Ok(object) => object,
            Err(error) => {
                tracing::debug!(config = %config, %error, "delayed lookup abandoned");
                None
            }
        }
    }

    fn release(&self, consumer: &UnitId, object: &Object) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let config = self.config;
        let consumer = consumer.clone();
        let object = object.clone();
        if let Err(error) = engine.submit(move |core| core.release_delayed(config, &consumer, &object)) {
            tracing::debug!(config = %config, %error, "delayed release abandoned");
        }
    }
}

impl EngineCore {
    /// Activate a configuration, or add a per-consumer instance to an
    /// active one
    ///
    /// Returns the new instance's object. Failures are logged and recorded
    /// on the configuration, which reverts to a resolvable state.
    pub(crate) fn activate(
        &self,
        id: ConfigurationId,
        consumer: Option<UnitId>,
    ) -> Result<Object, ActivationError> {
        let result = match self.begin_activation(id, consumer) {
            Ok(plan) => {
                let outcome = self.run_activation(&plan);
                self.finish_activation(plan, outcome)
            }
            Err(error) => Err(error),
        };
        if let Err(error) = &result {
            match error {
                ActivationError::Circular(_) => {
                    tracing::warn!(config = %id, "circular activation refused; lookup yields no object")
                }
                ActivationError::NotActivatable(_) => {
                    tracing::debug!(config = %id, %error, "activation skipped")
                }
                _ => tracing::warn!(config = %id, %error, "activation failed"),
            }
            if let Some(config) = self.state.lock().configs.get_mut(&id) {
                config.last_error = Some(error.to_string());
            }
        }
        result
    }

    fn begin_activation(
        &self,
        id: ConfigurationId,
        consumer: Option<UnitId>,
    ) -> Result<ActivationPlan, ActivationError> {
        let mut state = self.state.lock();
        if state.is_activating(id) {
            return Err(ActivationError::Circular(id));
        }
        let config = state
            .configs
            .get_mut(&id)
            .ok_or(ActivationError::NotActivatable(id))?;
        let prior = config.state;
        let per_consumer = config.description.scope().is_service_factory();
        match prior {
            ConfigState::Satisfied | ConfigState::Registered => {}
            ConfigState::Active if per_consumer => {}
            _ => return Err(ActivationError::NotActivatable(id)),
        }
        config
            .description
            .validate()
            .map_err(ActivationError::InvalidDescription)?;
        let implementation = config.description.implementation();
        let factory = self
            .implementations
            .get(implementation)
            .ok_or_else(|| ActivationError::MissingImplementation(implementation.to_string()))?;

        let plan = ActivationPlan {
            id,
            description: config.description.clone(),
            unit: config.unit.clone(),
            properties: config.properties.clone(),
            using: if per_consumer { consumer } else { None },
            fresh: (prior != ConfigState::Active).then(|| config.fresh_bindings()),
            prior,
            factory,
        };
        config.state = ConfigState::Activating;
        state.activating.push(id);
        tracing::debug!(config = %id, component = %plan.description.name(), "activating");
        Ok(plan)
    }

    fn run_activation(&self, plan: &ActivationPlan) -> Result<Instance, ActivationError> {
        let ctx = ComponentContext::new(
            plan.id,
            plan.description.name(),
            plan.unit.clone(),
            plan.properties.clone(),
            plan.using.clone(),
            self.me.clone(),
        );
        let component =
            guarded(|| plan.factory.construct(&ctx)).map_err(ActivationError::ConstructorFailed)?;

        if let Some(fresh) = &plan.fresh {
            let mut bindings = fresh.clone();
            for binding in bindings.iter_mut() {
                for candidate in self.candidates(binding) {
                    if !binding.has_room() {
                        break;
                    }
                    binding.try_bind(candidate);
                }
            }
            let missing: Vec<String> = bindings
                .iter()
                .filter(|binding| !binding.is_satisfied())
                .map(|binding| binding.name().to_string())
                .collect();
            if !missing.is_empty() {
                return Err(ActivationError::ReferencesUnsatisfiable { missing });
            }
            if let Some(config) = self.state.lock().configs.get_mut(&plan.id) {
                config.bindings = bindings;
            }
        }

        let bound: Vec<(String, CapabilityRef)> = {
            let state = self.state.lock();
            state
                .configs
                .get(&plan.id)
                .map(|config| {
                    config
                        .bindings
                        .iter()
                        .flat_map(|binding| {
                            binding
                                .bound()
                                .map(|handle| (binding.name().to_string(), handle.clone()))
                                .collect::<Vec<_>>()
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        for (reference, handle) in &bound {
            if let Err(error) = guarded(|| component.bind(&ctx, reference, handle)) {
                tracing::warn!(config = %plan.id, reference = %reference, capability = %handle.id, %error, "bind hook failed");
            }
        }

        if let Err(error) = guarded(|| component.activate(&ctx)) {
            for (reference, handle) in bound.iter().rev() {
                if let Err(error) = guarded(|| component.unbind(&ctx, reference, handle)) {
                    tracing::warn!(config = %plan.id, reference = %reference, %error, "unbind hook failed");
                }
            }
            return Err(ActivationError::ActivationHookThrew(error));
        }
        Ok(Instance::new(component, ctx))
    }

    fn finish_activation(
        &self,
        plan: ActivationPlan,
        outcome: Result<Instance, ActivationError>,
    ) -> Result<Object, ActivationError> {
        let first = plan.prior != ConfigState::Active;
        let (publish, released, pending, result, count) = {
            let mut state = self.state.lock();
            state.activating.retain(|active| *active != plan.id);
            let seq = match &outcome {
                Ok(_) if first => Some(state.next_activation()),
                _ => None,
            };
            let Some(config) = state.configs.get_mut(&plan.id) else {
                return Err(ActivationError::NotActivatable(plan.id));
            };
            match outcome {
                Ok(instance) => {
                    let object = instance.object.clone();
                    config.instances.push(instance);
                    config.state = ConfigState::Active;
                    let mut publish = false;
                    if let Some(seq) = seq {
                        config.activation_count += 1;
                        config.activated_at = seq;
                        config.last_error = None;
                        publish = config.is_eager()
                            && config.description.provides().is_some()
                            && config.registration.is_none();
                    }
                    (
                        publish,
                        Vec::new(),
                        config.pending.take(),
                        Ok(object),
                        config.activation_count,
                    )
                }
                Err(error) => {
                    let mut released = Vec::new();
                    if first {
                        for binding in config.bindings.iter_mut() {
                            released.extend(binding.clear());
                        }
                        config.bindings.clear();
                    }
                    config.state = match (&error, plan.prior) {
                        (_, ConfigState::Active) => ConfigState::Active,
                        _ if config.registration.is_some() => ConfigState::Registered,
                        (ActivationError::ReferencesUnsatisfiable { .. }, _) => {
                            ConfigState::Unsatisfied
                        }
                        _ => ConfigState::Satisfied,
                    };
                    (
                        false,
                        released,
                        config.pending.take(),
                        Err(error),
                        config.activation_count,
                    )
                }
            }
        };

        for (handle, object) in released {
            if let Some(object) = object {
                self.registry.unget_object(handle.id, &plan.unit, &object);
            }
        }
        if result.is_ok() {
            if first {
                tracing::info!(
                    config = %plan.id,
                    component = %plan.description.name(),
                    unit = %plan.unit,
                    activations = count,
                    "configuration activated"
                );
            } else {
                tracing::debug!(config = %plan.id, using = ?plan.using, "per-consumer instance created");
            }
        }
        // A teardown requested mid-activation wins over publication
        if let Some(action) = pending {
            self.apply_pending(plan.id, action);
            return result.and(Err(ActivationError::NotActivatable(plan.id)));
        }
        if publish {
            self.publish_provided(plan.id);
        }
        result
    }

    fn apply_pending(&self, id: ConfigurationId, action: PendingAction) {
        tracing::debug!(config = %id, ?action, "applying teardown requested during activation");
        match action {
            PendingAction::Reactivate(reason) => {
                self.teardown(id, reason, action);
                self.state.lock().push_work(id);
            }
            PendingAction::Dispose(reason) => {
                self.dispose_config(id, reason);
            }
        }
    }

    /// Properties published with a configuration's capability
    fn registration_properties(&self, id: ConfigurationId) -> Option<(CapabilityType, PropertyMap)> {
        let state = self.state.lock();
        let config = state.configs.get(&id)?;
        let properties = config
            .properties
            .public()
            .with(COMPONENT_NAME_PROPERTY, config.name())
            .with(COMPONENT_ID_PROPERTY, id.value() as i64);
        if config.is_factory_registration() {
            let factory = config.description.factory_id()?;
            return Some((
                CapabilityType::new(COMPONENT_FACTORY_INTERFACE),
                properties.with(COMPONENT_FACTORY_PROPERTY, factory.as_str()),
            ));
        }
        Some((config.description.provides()?.clone(), properties))
    }

    fn register_for(&self, id: ConfigurationId, provider: Arc<dyn CapabilityProvider>) {
        let Some((interface, properties)) = self.registration_properties(id) else {
            return;
        };
        let handle = self.registry.register(interface, properties, provider);
        let orphaned = {
            let mut state = self.state.lock();
            match state.configs.get_mut(&id) {
                Some(config)
                    if matches!(config.state, ConfigState::Active | ConfigState::Registered) =>
                {
                    config.registration = Some(handle.clone());
                    state.providers.insert(handle.id, id);
                    false
                }
                _ => true,
            }
        };
        if orphaned {
            self.registry.unregister(handle.id);
            return;
        }
        tracing::debug!(config = %id, capability = %handle.id, interface = %handle.interface, "capability published");
        self.capability_arrived(&handle);
    }

    /// Register the provided capability of a freshly activated configuration
    fn publish_provided(&self, id: ConfigurationId) {
        let object = {
            let state = self.state.lock();
            state
                .configs
                .get(&id)
                .and_then(|config| config.instances.first())
                .map(|instance| instance.object.clone())
        };
        if let Some(object) = object {
            self.register_for(id, Arc::new(SingletonProvider::new(object)));
        }
    }

    /// Register a delayed configuration's placeholder
    pub(crate) fn publish_placeholder(&self, id: ConfigurationId) {
        if let Some(config) = self.state.lock().configs.get_mut(&id) {
            config.state = ConfigState::Registered;
        }
        let provider = DelayedProvider {
            engine: self.me.clone(),
            config: id,
        };
        self.register_for(id, Arc::new(provider));
    }

    /// Register a factory description's component factory capability
    pub(crate) fn publish_factory(&self, id: ConfigurationId) {
        let factory = {
            let mut state = self.state.lock();
            let Some(config) = state.configs.get_mut(&id) else {
                return;
            };
            let Some(factory) = config.description.factory_id().cloned() else {
                return;
            };
            config.state = ConfigState::Registered;
            factory
        };
        let handle = crate::factory::ComponentFactoryHandle::new(self.me.clone(), factory);
        let object: Object = Arc::new(handle);
        self.register_for(id, Arc::new(SingletonProvider::new(object)));
    }

    /// Bind a capability to a dynamic reference of an active configuration
    pub(crate) fn bind_dynamic(&self, id: ConfigurationId, reference: &str, handle: CapabilityRef) {
        let instances: Vec<(Arc<dyn crate::component::Component>, ComponentContext)> = {
            let mut state = self.state.lock();
            let Some(config) = state.configs.get_mut(&id) else {
                return;
            };
            if config.state != ConfigState::Active {
                return;
            }
            let Some(binding) = config.binding_mut(reference) else {
                return;
            };
            if !binding.try_bind(handle.clone()) {
                return;
            }
            config
                .instances
                .iter()
                .map(|instance| (instance.component.clone(), instance.context.clone()))
                .collect()
        };
        tracing::debug!(config = %id, reference = %reference, capability = %handle.id, "dynamic reference bound");
        for (component, ctx) in instances {
            if let Err(error) = guarded(|| component.bind(&ctx, reference, &handle)) {
                tracing::warn!(config = %id, reference = %reference, %error, "bind hook failed");
            }
        }
    }

    /// Drop a departed capability from a dynamic reference, bind a
    /// replacement if one exists, and tear down if the reference is left
    /// unsatisfied
    pub(crate) fn unbind_dynamic(&self, id: ConfigurationId, reference: &str, handle: &CapabilityRef) {
        let (unbound, object, unit, instances) = {
            let mut state = self.state.lock();
            let Some(config) = state.configs.get_mut(&id) else {
                return;
            };
            if config.state != ConfigState::Active {
                return;
            }
            let unit = config.unit.clone();
            let instances: Vec<_> = config
                .instances
                .iter()
                .map(|instance| (instance.component.clone(), instance.context.clone()))
                .collect();
            let Some(binding) = config.binding_mut(reference) else {
                return;
            };
            let Some((unbound, object)) = binding.unbind(handle.id) else {
                return;
            };
            (unbound, object, unit, instances)
        };
        tracing::debug!(config = %id, reference = %reference, capability = %unbound.id, "dynamic reference unbound");
        if let Some(object) = object {
            self.registry.unget_object(unbound.id, &unit, &object);
        }
        for (component, ctx) in &instances {
            if let Err(error) = guarded(|| component.unbind(ctx, reference, &unbound)) {
                tracing::warn!(config = %id, reference = %reference, %error, "unbind hook failed");
            }
        }

        let binding = {
            let state = self.state.lock();
            state
                .configs
                .get(&id)
                .and_then(|config| config.binding(reference))
                .cloned()
        };
        let Some(binding) = binding else {
            return;
        };
        if binding.has_room() {
            let replacement = self
                .candidates(&binding)
                .into_iter()
                .find(|candidate| candidate.id != unbound.id && !binding.is_bound(candidate.id));
            if let Some(replacement) = replacement {
                self.bind_dynamic(id, reference, replacement);
            }
        }

        let satisfied = {
            let state = self.state.lock();
            state
                .configs
                .get(&id)
                .and_then(|config| config.binding(reference))
                .map_or(true, Binding::is_satisfied)
        };
        if !satisfied {
            self.teardown(
                id,
                DeactivationReason::Unsatisfied,
                PendingAction::Reactivate(DeactivationReason::Unsatisfied),
            );
            self.state.lock().push_work(id);
        }
    }

    /// Tear a configuration down to `Unsatisfied`
    ///
    /// A configuration mid-activation is not interrupted; `if_activating` is
    /// recorded and applied once the activation completes. Returns whether a
    /// teardown happened now.
    pub(crate) fn teardown(
        &self,
        id: ConfigurationId,
        reason: DeactivationReason,
        if_activating: PendingAction,
    ) -> bool {
        let (registration, instances, mut bindings, unit, name) = {
            let mut state = self.state.lock();
            let Some(config) = state.configs.get_mut(&id) else {
                return false;
            };
            match config.state {
                ConfigState::Activating => {
                    config.pending = Some(PendingAction::merge(config.pending, if_activating));
                    tracing::debug!(config = %id, %reason, "teardown deferred until activation completes");
                    return false;
                }
                ConfigState::Deactivating | ConfigState::Disposed => return false,
                _ => {}
            }
            config.state = ConfigState::Deactivating;
            let taken = (
                config.registration.take(),
                std::mem::take(&mut config.instances),
                std::mem::take(&mut config.bindings),
                config.unit.clone(),
                config.name().to_string(),
            );
            if let Some(registration) = &taken.0 {
                state.providers.remove(&registration.id);
            }
            taken
        };

        // Nobody may bind to us from here on; dependents react before our
        // own deactivation hook runs.
        if let Some(registration) = &registration {
            self.registry.unregister(registration.id);
            self.capability_departed(registration);
        }
        for instance in instances.iter().rev() {
            self.deactivate_instance(instance, &bindings, reason);
        }
        for binding in bindings.iter_mut().rev() {
            for (handle, object) in binding.clear() {
                if let Some(object) = object {
                    self.registry.unget_object(handle.id, &unit, &object);
                }
            }
        }
        let had_instances = !instances.is_empty();
        drop(instances);

        if let Some(config) = self.state.lock().configs.get_mut(&id) {
            config.state = ConfigState::Unsatisfied;
        }
        if had_instances {
            tracing::info!(config = %id, component = %name, %reason, "configuration deactivated");
        } else {
            tracing::debug!(config = %id, component = %name, %reason, "registration withdrawn");
        }
        true
    }

    /// Deactivation hook, then unbind hooks in reverse bind order
    fn deactivate_instance(&self, instance: &Instance, bindings: &[Binding], reason: DeactivationReason) {
        let ctx = &instance.context;
        if let Err(error) = guarded(|| instance.component.deactivate(ctx, reason)) {
            tracing::warn!(config = %ctx.configuration_id(), %error, "deactivation hook failed; teardown continues");
        }
        for binding in bindings.iter().rev() {
            let handles: Vec<&CapabilityRef> = binding.bound().collect();
            for handle in handles.into_iter().rev() {
                if let Err(error) = guarded(|| instance.component.unbind(ctx, binding.name(), handle)) {
                    tracing::warn!(config = %ctx.configuration_id(), reference = %binding.name(), %error, "unbind hook failed");
                }
            }
        }
    }

    /// Tear down and remove a configuration (and anything a factory
    /// description produced)
    pub(crate) fn dispose_config(&self, id: ConfigurationId, reason: DeactivationReason) -> bool {
        let produced = self.state.lock().produced_by(id);
        for child in produced {
            self.dispose_config(child, DeactivationReason::Disposed);
        }
        self.teardown(id, reason, PendingAction::Dispose(reason));

        let mut state = self.state.lock();
        let Some(config) = state.configs.get(&id) else {
            return false;
        };
        if config.state == ConfigState::Activating {
            // Removed once the in-flight activation completes
            return true;
        }
        let parent = match config.origin {
            crate::configuration::Origin::FactoryProduced { parent, .. } => Some(parent),
            crate::configuration::Origin::Enabled => None,
        };
        let name = config.name().to_string();
        state.configs.remove(&id);
        state.worklist.retain(|queued| *queued != id);
        state.factories.retain(|_, config| *config != id);
        // Records of a factory's instances go with the factory
        state.disposed.retain(|_, owner| *owner != id);
        if let Some(parent) = parent {
            state.disposed.insert(id, parent);
        }
        tracing::debug!(config = %id, component = %name, %reason, "configuration removed");
        true
    }

    /// First-touch activation or instance reuse for a delayed component
    pub(crate) fn obtain_delayed(&self, id: ConfigurationId, consumer: &UnitId) -> Option<Object> {
        let lookup = {
            let mut state = self.state.lock();
            let config = state.configs.get_mut(&id)?;
            let scope = config.description.scope();
            match config.state {
                ConfigState::Registered | ConfigState::Activating => DelayedLookup::Create,
                ConfigState::Active => {
                    let existing = match scope {
                        ServiceScope::Singleton => config.instances.first_mut(),
                        ServiceScope::Bundle => config
                            .instances
                            .iter_mut()
                            .find(|instance| instance.using_unit() == Some(consumer)),
                        ServiceScope::Prototype => None,
                    };
                    match existing {
                        Some(instance) => {
                            *instance.users.entry(consumer.clone()).or_insert(0) += 1;
                            DelayedLookup::Reuse(instance.object.clone())
                        }
                        None => DelayedLookup::Create,
                    }
                }
                _ => return None,
            }
        };
        match lookup {
            DelayedLookup::Reuse(object) => Some(object),
            DelayedLookup::Create => {
                let object = self.activate(id, Some(consumer.clone())).ok()?;
                let mut state = self.state.lock();
                let instance = state
                    .configs
                    .get_mut(&id)?
                    .instances
                    .iter_mut()
                    .find(|instance| Arc::ptr_eq(&instance.object, &object))?;
                *instance.users.entry(consumer.clone()).or_insert(0) += 1;
                Some(object)
            }
        }
    }

    /// A consumer gave back a delayed component's object
    ///
    /// The instance is deactivated when its last user releases it; when the
    /// configuration has no instances left it returns to `Registered`.
    pub(crate) fn release_delayed(&self, id: ConfigurationId, consumer: &UnitId, object: &Object) {
        let keep = self.config.keep_delayed_instances;
        let (instance, bindings, last, unit) = {
            let mut state = self.state.lock();
            let Some(config) = state.configs.get_mut(&id) else {
                return;
            };
            if config.state != ConfigState::Active {
                return;
            }
            let scope = config.description.scope();
            let index = match scope {
                ServiceScope::Singleton => (!config.instances.is_empty()).then_some(0),
                ServiceScope::Bundle => config
                    .instances
                    .iter()
                    .position(|instance| instance.using_unit() == Some(consumer)),
                ServiceScope::Prototype => config
                    .instances
                    .iter()
                    .position(|instance| Arc::ptr_eq(&instance.object, object)),
            };
            let Some(index) = index else {
                return;
            };
            let instance = &mut config.instances[index];
            match instance.users.get_mut(consumer) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        instance.users.remove(consumer);
                    }
                }
                None => return,
            }
            if instance.total_uses() > 0 || (scope == ServiceScope::Singleton && keep) {
                return;
            }
            let instance = config.instances.remove(index);
            let last = config.instances.is_empty();
            let bindings = if last {
                config.state = ConfigState::Deactivating;
                std::mem::take(&mut config.bindings)
            } else {
                config.bindings.clone()
            };
            (instance, bindings, last, config.unit.clone())
        };

        self.deactivate_instance(&instance, &bindings, DeactivationReason::Released);
        if !last {
            return;
        }
        let mut bindings = bindings;
        for binding in bindings.iter_mut().rev() {
            for (handle, object) in binding.clear() {
                if let Some(object) = object {
                    self.registry.unget_object(handle.id, &unit, &object);
                }
            }
        }
        if let Some(config) = self.state.lock().configs.get_mut(&id) {
            config.state = if config.registration.is_some() {
                ConfigState::Registered
            } else {
                ConfigState::Unsatisfied
            };
        }
        tracing::info!(config = %id, "delayed configuration released by its last consumer");
    }

    /// Objects bound to a reference, obtained and cached on first use
    pub(crate) fn locate_on_worker(
        &self,
        id: ConfigurationId,
        reference: &str,
        target: LocateTarget,
    ) -> Vec<Object> {
        let (selected, unit) = {
            let state = self.state.lock();
            let Some(config) = state.configs.get(&id) else {
                return Vec::new();
            };
            let Some(binding) = config.binding(reference) else {
                return Vec::new();
            };
            let handles = binding.bound().filter(|handle| match target {
                LocateTarget::Capability(capability) => handle.id == capability,
                _ => true,
            });
            let handles: Vec<&CapabilityRef> = match target {
                LocateTarget::First => handles.take(1).collect(),
                _ => handles.collect(),
            };
            let selected: Vec<(CapabilityRef, Option<Object>)> = handles
                .into_iter()
                .filter(|handle| {
                    let blocked = state.provided_by_activating(handle.id);
                    if blocked {
                        tracing::debug!(config = %id, reference = %reference, capability = %handle.id, "provider is activating; lookup yields no object");
                    }
                    !blocked
                })
                .map(|handle| (handle.clone(), binding.cached_object(handle.id)))
                .collect();
            (selected, config.unit.clone())
        };

        let mut objects = Vec::with_capacity(selected.len());
        for (handle, cached) in selected {
            if let Some(object) = cached {
                objects.push(object);
                continue;
            }
            let Some(object) = self.registry.get_object(handle.id, &unit) else {
                continue;
            };
            let existing = {
                let mut state = self.state.lock();
                match state
                    .configs
                    .get_mut(&id)
                    .and_then(|config| config.binding_mut(reference))
                {
                    Some(binding) => {
                        if binding.cache_object(handle.id, object.clone()) {
                            None
                        } else {
                            Some(binding.cached_object(handle.id))
                        }
                    }
                    None => Some(None),
                }
            };
            match existing {
                None => objects.push(object),
                Some(other) => {
                    self.registry.unget_object(handle.id, &unit, &object);
                    objects.extend(other);
                }
            }
        }
        objects
    }

    /// Handles bound to a reference, in bind order
    pub(crate) fn bound_capabilities(&self, id: ConfigurationId, reference: &str) -> Vec<CapabilityRef> {
        let state = self.state.lock();
        state
            .configs
            .get(&id)
            .and_then(|config| config.binding(reference))
            .map(|binding| binding.bound().cloned().collect())
            .unwrap_or_default()
    }
}
