//! Fixed-point resolver
//!
//! The resolver decides which configurations can run given the capabilities
//! currently registered. It keeps a worklist of configurations that need a
//! look; each resolve cycle drains it pass by pass until nothing changes.
//!
//! ## Design Principles
//!
//! - Only registered capabilities count towards satisfaction. Capabilities a
//!   not-yet-active configuration would provide are invisible, which is what
//!   keeps mandatory cycles unsatisfied instead of deadlocking.
//! - Activation of one configuration pushes exactly the configurations that
//!   reference what it registered; nothing is rescanned wholesale.
//! - All methods here run on the worker thread. The state mutex is taken for
//!   short bookkeeping sections only and is never held across registry calls
//!   that can reach a provider, or across user hooks.

use crate::binding::Binding;
use crate::configuration::{ConfigState, Configuration, Origin, PendingAction};
use crate::engine::EngineCore;
use crate::errors::DeactivationReason;
use orrery_core::{
    CapabilityId, CapabilityRef, ConfigurationId, Description, FactoryId, InvalidDescription,
    UnitId,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

/// Descriptions a deployment unit has declared
#[derive(Debug, Clone, Default)]
pub(crate) struct UnitRecord {
    pub(crate) descriptions: Vec<Arc<Description>>,
}

impl UnitRecord {
    pub(crate) fn add(&mut self, description: Arc<Description>) {
        match self
            .descriptions
            .iter_mut()
            .find(|existing| existing.name() == description.name())
        {
            Some(existing) => *existing = description,
            None => self.descriptions.push(description),
        }
    }

    pub(crate) fn find(&self, name: &str) -> Option<&Arc<Description>> {
        self.descriptions.iter().find(|d| d.name() == name)
    }
}

/// A description rejected by validation, kept for status reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidRecord {
    /// Unit that declared it
    pub unit: UnitId,
    /// Validation failure
    pub error: InvalidDescription,
}

/// Resolver bookkeeping, owned by the engine behind its state mutex
#[derive(Default)]
pub(crate) struct ResolverState {
    pub(crate) configs: BTreeMap<ConfigurationId, Configuration>,
    pub(crate) units: BTreeMap<UnitId, UnitRecord>,
    pub(crate) worklist: VecDeque<ConfigurationId>,
    /// Configurations mid-activation, innermost last
    pub(crate) activating: Vec<ConfigurationId>,
    /// Which configuration registered each engine-owned capability
    pub(crate) providers: HashMap<CapabilityId, ConfigurationId>,
    pub(crate) factories: HashMap<FactoryId, ConfigurationId>,
    /// Disposed factory-produced configurations, keyed to the factory
    /// configuration that produced them; pruned when that factory goes
    pub(crate) disposed: HashMap<ConfigurationId, ConfigurationId>,
    pub(crate) invalid: Vec<InvalidRecord>,
    pub(crate) resolving: bool,
    next_config: u64,
    activation_seq: u64,
}

impl ResolverState {
    pub(crate) fn allocate_id(&mut self) -> ConfigurationId {
        self.next_config += 1;
        ConfigurationId(self.next_config)
    }

    pub(crate) fn next_activation(&mut self) -> u64 {
        self.activation_seq += 1;
        self.activation_seq
    }

    /// Queue a configuration for evaluation, once
    pub(crate) fn push_work(&mut self, id: ConfigurationId) {
        if !self.worklist.contains(&id) {
            self.worklist.push_back(id);
        }
    }

    pub(crate) fn is_activating(&self, id: ConfigurationId) -> bool {
        self.activating.contains(&id)
    }

    /// Whether a capability is provided by a configuration mid-activation
    pub(crate) fn provided_by_activating(&self, capability: CapabilityId) -> bool {
        self.providers
            .get(&capability)
            .map_or(false, |provider| self.is_activating(*provider))
    }

    /// The enabled (not factory-produced) configuration of a component
    pub(crate) fn enabled_config(&self, unit: &UnitId, name: &str) -> Option<ConfigurationId> {
        self.configs
            .values()
            .find(|config| {
                &config.unit == unit
                    && config.name() == name
                    && config.origin == Origin::Enabled
                    && config.state != ConfigState::Disposed
            })
            .map(|config| config.id)
    }

    /// Every configuration of a unit, most recently activated first
    pub(crate) fn configs_of_unit(&self, unit: &UnitId) -> Vec<ConfigurationId> {
        let mut ids: Vec<(u64, ConfigurationId)> = self
            .configs
            .values()
            .filter(|config| &config.unit == unit)
            .map(|config| (config.activated_at, config.id))
            .collect();
        ids.sort_by(|a, b| b.cmp(a));
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Configurations produced by a factory description
    pub(crate) fn produced_by(&self, parent: ConfigurationId) -> Vec<ConfigurationId> {
        self.configs
            .values()
            .filter(|config| {
                matches!(config.origin, Origin::FactoryProduced { parent: p, .. } if p == parent)
            })
            .map(|config| config.id)
            .collect()
    }

    pub(crate) fn record_invalid(&mut self, unit: &UnitId, error: InvalidDescription) {
        let record = InvalidRecord {
            unit: unit.clone(),
            error,
        };
        if !self.invalid.contains(&record) {
            tracing::error!(unit = %record.unit, component = %record.error.component, reason = %record.error.reason, "invalid component description");
            self.invalid.push(record);
        }
    }
}

/// Resets the re-entrancy flag even if a resolve cycle unwinds
struct ResolveGuard<'a> {
    core: &'a EngineCore,
}

impl Drop for ResolveGuard<'_> {
    fn drop(&mut self) {
        self.core.state.lock().resolving = false;
    }
}

/// What to do with a configuration after a departure or modification
enum Disruption {
    Static(ConfigurationId),
    Dynamic(ConfigurationId, String),
}

impl EngineCore {
    /// Run the fixed point until the worklist is empty or the pass bound is
    /// reached
    ///
    /// Nested calls (from hooks running inside a cycle) return immediately;
    /// the outer cycle picks up whatever they queued.
    pub(crate) fn resolve(&self) {
        {
            let mut state = self.state.lock();
            if state.resolving {
                return;
            }
            state.resolving = true;
        }
        let _guard = ResolveGuard { core: self };

        let mut passes = 0usize;
        loop {
            let batch: Vec<ConfigurationId> = self.state.lock().worklist.drain(..).collect();
            if batch.is_empty() {
                break;
            }
            passes += 1;
            if passes > self.config.max_resolve_passes {
                let mut state = self.state.lock();
                for id in batch.into_iter().rev() {
                    state.worklist.push_front(id);
                }
                tracing::warn!(
                    passes = self.config.max_resolve_passes,
                    deferred = state.worklist.len(),
                    "resolve pass limit reached; deferring remaining work"
                );
                break;
            }
            let mut changed = 0usize;
            for id in batch {
                if self.evaluate(id) {
                    changed += 1;
                }
            }
            tracing::trace!(pass = passes, changed, "resolve pass complete");
        }
    }

    /// Re-evaluate one configuration; returns whether its state changed
    pub(crate) fn evaluate(&self, id: ConfigurationId) -> bool {
        let (description, unit, bindings, before) = {
            let state = self.state.lock();
            let Some(config) = state.configs.get(&id) else {
                return false;
            };
            if !config.state.is_resolvable() {
                return false;
            }
            (
                config.description.clone(),
                config.unit.clone(),
                config.fresh_bindings(),
                config.state,
            )
        };

        if let Err(invalid) = description.validate() {
            let mut state = self.state.lock();
            state.record_invalid(&unit, invalid);
            if let Some(config) = state.configs.get_mut(&id) {
                config.state = ConfigState::Disposed;
            }
            state.configs.remove(&id);
            return true;
        }

        let missing = self.missing_references(&bindings);
        if !missing.is_empty() {
            let mut state = self.state.lock();
            let Some(config) = state.configs.get_mut(&id) else {
                return false;
            };
            config.state = ConfigState::Unsatisfied;
            if before != ConfigState::Unsatisfied {
                tracing::debug!(config = %id, component = %description.name(), missing = ?missing, "configuration unsatisfied");
            }
            return before != ConfigState::Unsatisfied;
        }

        let (eager, delayed, factory) = {
            let mut state = self.state.lock();
            let Some(config) = state.configs.get_mut(&id) else {
                return false;
            };
            config.state = ConfigState::Satisfied;
            (config.is_eager(), config.is_delayed(), config.is_factory_registration())
        };
        tracing::debug!(config = %id, component = %description.name(), "configuration satisfied");

        if eager {
            // Failures are logged and recorded by `activate`
            let _ = self.activate(id, None);
        } else if delayed {
            self.publish_placeholder(id);
        } else if factory {
            self.publish_factory(id);
        }
        true
    }

    /// Mandatory references with no usable candidate right now
    pub(crate) fn missing_references(&self, bindings: &[Binding]) -> Vec<String> {
        bindings
            .iter()
            .filter(|binding| binding.decl().cardinality.is_mandatory())
            .filter(|binding| self.candidates(binding).is_empty())
            .map(|binding| binding.name().to_string())
            .collect()
    }

    /// Candidates for a binding in preference order
    ///
    /// Capabilities provided by a configuration mid-activation are skipped:
    /// binding to them would recurse into that activation.
    pub(crate) fn candidates(&self, binding: &Binding) -> Vec<CapabilityRef> {
        if !binding.target().is_matchable() {
            return Vec::new();
        }
        let found = self
            .registry
            .find_matching(&binding.decl().interface, binding.target().as_filter());
        let state = self.state.lock();
        found
            .into_iter()
            .filter(|candidate| !state.provided_by_activating(candidate.id))
            .collect()
    }

    /// Handle a newly registered capability
    ///
    /// Dynamic bindings with room it could fill take their best unbound
    /// candidates in rank order, which need not start with the arrival when
    /// several registrations are still queued. Configurations waiting on its
    /// interface are queued for evaluation. Stale events (the capability is
    /// already gone) are ignored.
    pub(crate) fn capability_arrived(&self, handle: &CapabilityRef) {
        let Some(current) = self.registry.lookup(handle.id) else {
            return;
        };
        let targets: Vec<(ConfigurationId, Binding)> = {
            let mut state = self.state.lock();
            let bindable = !state.provided_by_activating(current.id);
            let mut targets = Vec::new();
            let mut waiting = Vec::new();
            for config in state.configs.values() {
                if bindable && config.state == ConfigState::Active {
                    for binding in &config.bindings {
                        if binding.is_dynamic()
                            && binding.has_room()
                            && !binding.is_bound(current.id)
                            && binding.matches(&current)
                        {
                            targets.push((config.id, binding.clone()));
                        }
                    }
                }
                if config.state.is_resolvable()
                    && config.description.references_interface(&current.interface)
                {
                    waiting.push(config.id);
                }
            }
            for id in waiting {
                state.push_work(id);
            }
            targets
        };
        for (config, mut binding) in targets {
            for candidate in self.candidates(&binding) {
                if !binding.has_room() {
                    break;
                }
                if binding.try_bind(candidate.clone()) {
                    self.bind_dynamic(config, binding.name(), candidate);
                }
            }
        }
    }

    /// Handle an unregistered capability
    ///
    /// Static bindings tear their configuration down and queue it again;
    /// dynamic bindings drop the handle and look for a replacement.
    pub(crate) fn capability_departed(&self, handle: &CapabilityRef) {
        let (disruptions, recheck) = {
            let mut state = self.state.lock();
            state.providers.remove(&handle.id);
            let mut disruptions = Vec::new();
            let mut recheck = Vec::new();
            for config in state.configs.values() {
                for binding in &config.bindings {
                    if binding.is_bound(handle.id) {
                        disruptions.push(if binding.is_dynamic() {
                            Disruption::Dynamic(config.id, binding.name().to_string())
                        } else {
                            Disruption::Static(config.id)
                        });
                    }
                }
                if matches!(config.state, ConfigState::Registered | ConfigState::Satisfied)
                    && config.description.references_interface(&handle.interface)
                {
                    recheck.push(config.id);
                }
            }
            (disruptions, recheck)
        };
        self.apply_disruptions(disruptions, handle);
        for id in recheck {
            self.recheck(id);
        }
    }

    /// Handle a property change of a registered capability
    ///
    /// Bindings whose target no longer matches treat it as a departure; the
    /// rest see it as an arrival.
    pub(crate) fn capability_modified(&self, handle: &CapabilityRef) {
        let Some(current) = self.registry.lookup(handle.id) else {
            return;
        };
        let (disruptions, recheck) = {
            let mut state = self.state.lock();
            let mut disruptions = Vec::new();
            let mut recheck = Vec::new();
            for config in state.configs.values_mut() {
                for binding in config.bindings.iter_mut() {
                    if !binding.refresh(&current) {
                        continue;
                    }
                    if !binding.matches(&current) {
                        disruptions.push(if binding.is_dynamic() {
                            Disruption::Dynamic(config.id, binding.name().to_string())
                        } else {
                            Disruption::Static(config.id)
                        });
                    }
                }
                if matches!(config.state, ConfigState::Registered | ConfigState::Satisfied)
                    && config.description.references_interface(&current.interface)
                {
                    recheck.push(config.id);
                }
            }
            (disruptions, recheck)
        };
        self.apply_disruptions(disruptions, &current);
        for id in recheck {
            self.recheck(id);
        }
        self.capability_arrived(&current);
    }

    fn apply_disruptions(&self, disruptions: Vec<Disruption>, handle: &CapabilityRef) {
        let mut restarted = Vec::new();
        for disruption in disruptions {
            match disruption {
                Disruption::Static(config) => {
                    if restarted.contains(&config) {
                        continue;
                    }
                    restarted.push(config);
                    tracing::debug!(config = %config, capability = %handle.id, "statically bound capability lost");
                    self.teardown(
                        config,
                        DeactivationReason::ReferenceDeparted,
                        PendingAction::Reactivate(DeactivationReason::ReferenceDeparted),
                    );
                    self.state.lock().push_work(config);
                }
                Disruption::Dynamic(config, reference) => {
                    if !restarted.contains(&config) {
                        self.unbind_dynamic(config, &reference, handle);
                    }
                }
            }
        }
    }

    /// Re-check a configuration without an instance after a capability
    /// went away or changed
    fn recheck(&self, id: ConfigurationId) {
        let (bindings, current) = {
            let state = self.state.lock();
            let Some(config) = state.configs.get(&id) else {
                return;
            };
            (config.fresh_bindings(), config.state)
        };
        match current {
            ConfigState::Registered => {
                let missing = self.missing_references(&bindings);
                if !missing.is_empty() {
                    tracing::debug!(config = %id, missing = ?missing, "registered configuration lost its references");
                    self.teardown(
                        id,
                        DeactivationReason::Unsatisfied,
                        PendingAction::Reactivate(DeactivationReason::Unsatisfied),
                    );
                    self.state.lock().push_work(id);
                }
            }
            ConfigState::Satisfied => self.state.lock().push_work(id),
            _ => {}
        }
    }
}
