//! # Engine
//!
//! The explicit runtime value owning the work queue, the configuration arena
//! and the registry handle.
//!
//! Producers (registry listeners, unit trackers, application code) only
//! enqueue jobs. The single worker applies each job and then runs the
//! resolver until the worklist is empty. Calls that must observe their own
//! effect (`disable_by_name`, `dispose`, `unit_unavailable`, factory
//! requests) carry a oneshot completion and wait for the worker; made from
//! the worker itself they run inline.
//!
//! ## Design Principles
//!
//! 1. **One writer**: only the worker mutates resolver state
//! 2. **Snapshots for readers**: status queries copy state under a short lock
//! 3. **Outcomes, not hook errors**: public calls report what happened to the
//!    target; user hook failures are logged and never surface here

use crate::component::Implementations;
use crate::config::EngineConfig;
use crate::configuration::{ConfigState, Configuration, Origin, PendingAction};
use crate::context::LocateTarget;
use crate::errors::{DeactivationReason, EngineError, QueueError, Result};
use crate::factory::{DisposeOutcome, InstanceHandle};
use crate::host::DeploymentUnit;
use crate::queue::WorkQueue;
use crate::registry::{
    CapabilityEvent, CapabilityListener, CapabilityRegistry, InMemoryRegistry, ListenerId, Object,
};
use crate::resolver::ResolverState;
use crate::status::{ConfigurationSnapshot, EngineSnapshot};
use orrery_core::{
    CapabilityRef, ConfigurationId, Description, FactoryId, InvalidDescription, PropertyMap,
    UnitId,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::oneshot;

type Call = Box<dyn FnOnce(&EngineCore) + Send>;

/// Structural work item processed by the worker
pub(crate) enum Job {
    /// Enable descriptions of a unit
    Enable {
        unit: UnitId,
        descriptions: Vec<Arc<Description>>,
    },
    /// Enable one (or every) declared description of a unit
    EnableByName { unit: UnitId, name: Option<String> },
    /// Disable and remove configurations
    Disable {
        configs: Vec<ConfigurationId>,
        reason: DeactivationReason,
    },
    /// Disable the enabled configuration of a named component
    DisableByName { unit: UnitId, name: String },
    /// A deployment unit became usable
    UnitAvailable {
        unit: UnitId,
        descriptions: Vec<Arc<Description>>,
        invalid: Vec<InvalidDescription>,
    },
    /// Registry notification
    CapabilityChanged(CapabilityEvent),
    /// Install new property overrides
    UpdateProperties {
        config: ConfigurationId,
        overrides: PropertyMap,
    },
    /// Arbitrary work with a completion, see [`EngineCore::submit`]
    Call(Call),
}

impl Job {
    fn label(&self) -> &'static str {
        match self {
            Job::Enable { .. } => "enable",
            Job::EnableByName { .. } => "enable_by_name",
            Job::Disable { .. } => "disable",
            Job::DisableByName { .. } => "disable_by_name",
            Job::UnitAvailable { .. } => "unit_available",
            Job::CapabilityChanged(_) => "capability_changed",
            Job::UpdateProperties { .. } => "update_properties",
            Job::Call(_) => "call",
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of disabling a component by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisableOutcome {
    /// The component was deactivated and removed, along with this many
    /// configurations in total (factory-produced ones included)
    Disabled(usize),
    /// The component is declared by the unit but not enabled
    AlreadyDisabled,
    /// The unit declares no component of that name
    NotFound,
}

/// Shared engine state; owned by [`Engine`], referenced weakly everywhere else
pub(crate) struct EngineCore {
    pub(crate) config: EngineConfig,
    pub(crate) registry: Arc<dyn CapabilityRegistry>,
    pub(crate) implementations: Implementations,
    pub(crate) state: Mutex<ResolverState>,
    pub(crate) queue: WorkQueue<Job>,
    pub(crate) me: Weak<EngineCore>,
    listener: Mutex<Option<ListenerId>>,
    closed: AtomicBool,
}

/// Forwards registry events onto the work queue
struct EngineListener {
    engine: Weak<EngineCore>,
}

impl CapabilityListener for EngineListener {
    fn on_event(&self, event: &CapabilityEvent) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        if let Err(error) = engine.enqueue(Job::CapabilityChanged(event.clone())) {
            tracing::debug!(capability = %event.capability().id, %error, "registry event dropped");
        }
    }
}

impl EngineCore {
    fn start(
        config: EngineConfig,
        registry: Arc<dyn CapabilityRegistry>,
        implementations: Implementations,
    ) -> Result<Arc<Self>> {
        let slot: Arc<OnceLock<Weak<EngineCore>>> = Arc::new(OnceLock::new());
        let handler_slot = slot.clone();
        let queue = WorkQueue::start(config.worker_name.clone(), move |job: Job| {
            match handler_slot.get().and_then(Weak::upgrade) {
                Some(core) => core.run(job),
                None => Err(EngineError::ShuttingDown),
            }
        })?;

        let core = Arc::new_cyclic(|me| EngineCore {
            config,
            registry,
            implementations,
            state: Mutex::new(ResolverState::default()),
            queue,
            me: me.clone(),
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let _ = slot.set(Arc::downgrade(&core));

        let listener = EngineListener {
            engine: Arc::downgrade(&core),
        };
        let id = core.registry.add_listener(Arc::new(listener));
        *core.listener.lock() = Some(id);
        Ok(core)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::ShuttingDown);
        }
        Ok(())
    }

    /// Enqueue a job; refused once shutdown has begun
    pub(crate) fn enqueue(&self, job: Job) -> Result<()> {
        self.ensure_open()?;
        self.queue.enqueue(job).map_err(|error| match error {
            QueueError::Closed => EngineError::ShuttingDown,
            other => EngineError::Queue(other),
        })
    }

    /// Run `op` on the worker and wait for its result
    ///
    /// On the worker thread this runs inline, which is how nested requests
    /// from hooks avoid waiting on themselves.
    pub(crate) fn submit<R, F>(&self, op: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&EngineCore) -> R + Send + 'static,
    {
        if self.queue.is_worker_thread() {
            return Ok(op(self));
        }
        let (done, wait) = oneshot::channel();
        let call: Call = Box::new(move |core| {
            let _ = done.send(op(core));
        });
        self.queue.enqueue(Job::Call(call)).map_err(|error| match error {
            QueueError::Closed => EngineError::ShuttingDown,
            other => EngineError::Queue(other),
        })?;
        wait.blocking_recv().map_err(|_| EngineError::Abandoned)
    }

    fn run(&self, job: Job) -> Result<()> {
        tracing::debug!(job = job.label(), "processing job");
        let outcome = match job {
            Job::Enable { unit, descriptions } => {
                self.enable_descriptions(&unit, descriptions);
                Ok(())
            }
            Job::EnableByName { unit, name } => {
                self.enable_named(&unit, name.as_deref());
                Ok(())
            }
            Job::Disable { configs, reason } => {
                for id in configs {
                    self.dispose_config(id, reason);
                }
                Ok(())
            }
            Job::DisableByName { unit, name } => {
                self.disable_named(&unit, &name);
                Ok(())
            }
            Job::UnitAvailable {
                unit,
                descriptions,
                invalid,
            } => {
                self.unit_arrived(&unit, descriptions, invalid);
                Ok(())
            }
            Job::CapabilityChanged(event) => {
                match &event {
                    CapabilityEvent::Arrived(handle) => self.capability_arrived(handle),
                    CapabilityEvent::Modified(handle) => self.capability_modified(handle),
                    CapabilityEvent::Departed(handle) => self.capability_departed(handle),
                }
                Ok(())
            }
            Job::UpdateProperties { config, overrides } => self.apply_properties(config, overrides),
            Job::Call(call) => {
                call(self);
                Ok(())
            }
        };
        self.resolve();
        outcome
    }

    fn enable_descriptions(&self, unit: &UnitId, descriptions: Vec<Arc<Description>>) {
        let mut state = self.state.lock();
        for description in descriptions {
            state
                .units
                .entry(unit.clone())
                .or_default()
                .add(description.clone());
            if let Err(invalid) = description.validate() {
                state.record_invalid(unit, invalid);
                continue;
            }
            if let Some(existing) = state.enabled_config(unit, description.name()) {
                tracing::debug!(config = %existing, component = %description.name(), "component already enabled");
                continue;
            }
            if let Some(factory) = description.factory_id() {
                if let Some(owner) = state.factories.get(factory) {
                    tracing::warn!(factory = %factory, owner = %owner, component = %description.name(), "factory id already in use; component not enabled");
                    continue;
                }
            }
            let id = state.allocate_id();
            if let Some(factory) = description.factory_id() {
                state.factories.insert(factory.clone(), id);
            }
            tracing::info!(config = %id, component = %description.name(), unit = %unit, "component enabled");
            let config = Configuration::new(
                id,
                unit.clone(),
                description,
                PropertyMap::new(),
                Origin::Enabled,
            );
            state.configs.insert(id, config);
            state.push_work(id);
        }
    }

    fn enable_named(&self, unit: &UnitId, name: Option<&str>) {
        let descriptions: Vec<Arc<Description>> = {
            let state = self.state.lock();
            match (state.units.get(unit), name) {
                (Some(record), Some(name)) => record.find(name).cloned().into_iter().collect(),
                (Some(record), None) => record.descriptions.clone(),
                (None, _) => Vec::new(),
            }
        };
        if descriptions.is_empty() {
            tracing::debug!(unit = %unit, component = ?name, "nothing declared to enable");
            return;
        }
        self.enable_descriptions(unit, descriptions);
    }

    fn disable_named(&self, unit: &UnitId, name: &str) -> DisableOutcome {
        let (target, declared) = {
            let state = self.state.lock();
            let target = state
                .enabled_config(unit, name)
                .map(|id| (id, 1 + state.produced_by(id).len()));
            let declared = state
                .units
                .get(unit)
                .map_or(false, |record| record.find(name).is_some());
            (target, declared)
        };
        match target {
            Some((id, count)) => {
                self.dispose_config(id, DeactivationReason::Disabled);
                DisableOutcome::Disabled(count)
            }
            None if declared => DisableOutcome::AlreadyDisabled,
            None => DisableOutcome::NotFound,
        }
    }

    fn unit_arrived(
        &self,
        unit: &UnitId,
        descriptions: Vec<Arc<Description>>,
        invalid: Vec<InvalidDescription>,
    ) {
        let rejected = invalid.len();
        {
            let mut state = self.state.lock();
            let record = state.units.entry(unit.clone()).or_default();
            for description in &descriptions {
                record.add(description.clone());
            }
            for error in invalid {
                state.record_invalid(unit, error);
            }
        }
        tracing::info!(unit = %unit, components = descriptions.len(), invalid = rejected, "deployment unit available");
        if self.config.auto_enable_units {
            let auto: Vec<Arc<Description>> = descriptions
                .into_iter()
                .filter(|description| description.auto_enable())
                .collect();
            self.enable_descriptions(unit, auto);
        }
    }

    fn unit_departed(&self, unit: &UnitId) -> usize {
        let ids = self.state.lock().configs_of_unit(unit);
        let disposed = ids
            .into_iter()
            .filter(|id| self.dispose_config(*id, DeactivationReason::UnitUnavailable))
            .count();
        {
            let mut state = self.state.lock();
            state.units.remove(unit);
            state.invalid.retain(|record| &record.unit != unit);
        }
        tracing::info!(unit = %unit, configurations = disposed, "deployment unit unavailable");
        disposed
    }

    fn apply_properties(&self, id: ConfigurationId, overrides: PropertyMap) -> Result<()> {
        let current = self
            .state
            .lock()
            .configs
            .get(&id)
            .map(|config| config.state)
            .ok_or(EngineError::ConfigurationNotFound(id))?;
        if !current.is_resolvable() {
            // Deferred when mid-activation; the new snapshot is picked up by
            // the reactivation
            self.teardown(
                id,
                DeactivationReason::ConfigurationChanged,
                PendingAction::Reactivate(DeactivationReason::ConfigurationChanged),
            );
        }
        let mut state = self.state.lock();
        let config = state
            .configs
            .get_mut(&id)
            .ok_or(EngineError::ConfigurationNotFound(id))?;
        config.set_overrides(overrides);
        tracing::debug!(config = %id, "properties updated");
        if config.state.is_resolvable() {
            state.push_work(id);
        }
        Ok(())
    }

    /// Dispose everything, most recently activated first
    fn disable_all(&self, reason: DeactivationReason) -> usize {
        let ids: Vec<ConfigurationId> = {
            let state = self.state.lock();
            let mut ordered: Vec<(u64, ConfigurationId)> = state
                .configs
                .values()
                .map(|config| (config.activated_at, config.id))
                .collect();
            ordered.sort_by(|a, b| b.cmp(a));
            ordered.into_iter().map(|(_, id)| id).collect()
        };
        let disposed = ids
            .into_iter()
            .filter(|id| self.dispose_config(*id, reason))
            .count();
        let mut state = self.state.lock();
        state.units.clear();
        state.worklist.clear();
        disposed
    }

    /// Objects bound to a reference; lookups from other threads are
    /// forwarded to the worker
    pub(crate) fn locate(
        &self,
        config: ConfigurationId,
        reference: &str,
        target: LocateTarget,
    ) -> Vec<Object> {
        let reference = reference.to_string();
        match self.submit(move |core| core.locate_on_worker(config, &reference, target)) {
            Ok(objects) => objects,
            Err(error) => {
                tracing::debug!(config = %config, %error, "lookup abandoned");
                Vec::new()
            }
        }
    }

    fn snapshot(&self) -> EngineSnapshot {
        let state = self.state.lock();
        EngineSnapshot {
            configurations: state.configs.values().map(ConfigurationSnapshot::from).collect(),
            invalid: state.invalid.clone(),
            queue: self.queue.stats(),
        }
    }
}

/// The component runtime
///
/// Dropping the engine shuts it down: every configuration is deactivated in
/// reverse activation order and the worker is joined.
pub struct Engine {
    core: Arc<EngineCore>,
}

impl Engine {
    /// Start an engine on top of a registry
    pub fn new(
        config: EngineConfig,
        registry: Arc<dyn CapabilityRegistry>,
        implementations: Implementations,
    ) -> Result<Self> {
        config.validate()?;
        let core = EngineCore::start(config, registry, implementations)?;
        tracing::info!(worker = %core.queue.name(), "engine started");
        Ok(Self { core })
    }

    /// Start an engine with default configuration and a fresh in-memory
    /// registry
    pub fn with_defaults(implementations: Implementations) -> Result<Self> {
        Self::new(
            EngineConfig::default(),
            Arc::new(InMemoryRegistry::new()),
            implementations,
        )
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Registry the engine publishes into
    pub fn registry(&self) -> Arc<dyn CapabilityRegistry> {
        self.core.registry.clone()
    }

    /// Implementation table
    pub fn implementations(&self) -> &Implementations {
        &self.core.implementations
    }

    /// Record a unit's declared components and enable the auto-enabled ones
    ///
    /// Parsing happens on the calling thread; enabling is asynchronous.
    /// Returns the number of valid descriptions.
    pub fn unit_available(&self, unit: &dyn DeploymentUnit) -> Result<usize> {
        self.core.ensure_open()?;
        let id = unit.id();
        let parsed = unit.descriptions()?;
        let valid = parsed.descriptions.len();
        self.core.enqueue(Job::UnitAvailable {
            unit: id,
            descriptions: parsed.descriptions.into_iter().map(Arc::new).collect(),
            invalid: parsed.invalid,
        })?;
        Ok(valid)
    }

    /// Tear down every configuration of a unit and forget its declarations
    ///
    /// Waits for the teardown; returns how many configurations were removed.
    pub fn unit_unavailable(&self, unit: &UnitId) -> Result<usize> {
        self.core.ensure_open()?;
        let unit = unit.clone();
        self.core.submit(move |core| core.unit_departed(&unit))
    }

    /// Enable descriptions on behalf of a unit (asynchronous)
    pub fn enable(&self, unit: &UnitId, descriptions: Vec<Description>) -> Result<()> {
        self.core.enqueue(Job::Enable {
            unit: unit.clone(),
            descriptions: descriptions.into_iter().map(Arc::new).collect(),
        })
    }

    /// Enable a declared component, or all of a unit's components when
    /// `name` is `None` (asynchronous)
    pub fn enable_by_name(&self, unit: &UnitId, name: Option<&str>) -> Result<()> {
        self.core.enqueue(Job::EnableByName {
            unit: unit.clone(),
            name: name.map(str::to_string),
        })
    }

    /// Disable configurations (asynchronous)
    pub fn disable(&self, configs: Vec<ConfigurationId>) -> Result<()> {
        self.core.enqueue(Job::Disable {
            configs,
            reason: DeactivationReason::Disabled,
        })
    }

    /// Disable a component and wait until it is fully deactivated
    pub fn disable_by_name(&self, unit: &UnitId, name: &str) -> Result<DisableOutcome> {
        self.core.ensure_open()?;
        let unit = unit.clone();
        let name = name.to_string();
        self.core.submit(move |core| core.disable_named(&unit, &name))
    }

    /// Create and activate a configuration from a registered factory
    pub fn new_factory_instance(
        &self,
        factory: &FactoryId,
        overrides: PropertyMap,
    ) -> Result<InstanceHandle> {
        self.core.ensure_open()?;
        let factory = factory.clone();
        self.core
            .submit(move |core| core.create_factory_instance(&factory, overrides))?
    }

    /// Object of a factory-produced instance, while it is active
    pub fn instance_object(&self, handle: &InstanceHandle) -> Option<Object> {
        let state = self.core.state.lock();
        let config = state.configs.get(&handle.config)?;
        if config.state != ConfigState::Active {
            return None;
        }
        config
            .instances
            .first()
            .map(|instance| instance.object.clone())
    }

    /// Dispose a factory-produced instance and wait for its teardown
    pub fn dispose(&self, handle: &InstanceHandle) -> Result<DisposeOutcome> {
        self.core.ensure_open()?;
        let config = handle.config;
        self.core.submit(move |core| core.dispose_instance(config))?
    }

    /// Install new property overrides (asynchronous)
    ///
    /// An active configuration is torn down and resolved again with the new
    /// snapshot.
    pub fn update_properties(&self, config: ConfigurationId, overrides: PropertyMap) -> Result<()> {
        self.core.enqueue(Job::UpdateProperties { config, overrides })
    }

    /// Feed a registry event from a registry the engine is not listening to
    pub fn on_capability_changed(&self, event: CapabilityEvent) -> Result<()> {
        self.core.enqueue(Job::CapabilityChanged(event))
    }

    /// Copy of the current engine state
    pub fn snapshot(&self) -> EngineSnapshot {
        self.core.snapshot()
    }

    /// Copy of one configuration
    pub fn configuration(&self, id: ConfigurationId) -> Option<ConfigurationSnapshot> {
        self.core
            .state
            .lock()
            .configs
            .get(&id)
            .map(ConfigurationSnapshot::from)
    }

    /// Configurations of a named component in a unit, factory-produced
    /// ones included
    pub fn find(&self, unit: &UnitId, name: &str) -> Vec<ConfigurationSnapshot> {
        self.core
            .state
            .lock()
            .configs
            .values()
            .filter(|config| &config.unit == unit && config.name() == name)
            .map(ConfigurationSnapshot::from)
            .collect()
    }

    /// Capabilities currently published by a configuration
    pub fn registration(&self, id: ConfigurationId) -> Option<CapabilityRef> {
        self.core
            .state
            .lock()
            .configs
            .get(&id)
            .and_then(|config| config.registration.clone())
    }

    /// Wait until every job enqueued so far has been processed
    pub fn flush(&self) -> Result<()> {
        self.core.queue.flush()?;
        Ok(())
    }

    /// Whether shutdown has begun
    pub fn is_shut_down(&self) -> bool {
        self.core.closed.load(Ordering::Acquire)
    }

    /// Deactivate everything in reverse activation order and stop the worker
    pub fn shutdown(&self) {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(listener) = self.core.listener.lock().take() {
            self.core.registry.remove_listener(listener);
        }
        match self
            .core
            .submit(|core| core.disable_all(DeactivationReason::Shutdown))
        {
            Ok(count) => tracing::info!(configurations = count, "engine shut down"),
            Err(error) => tracing::warn!(%error, "shutdown teardown did not run"),
        }
        self.core.queue.close();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("worker", &self.core.queue.name())
            .field("closed", &self.is_shut_down())
            .finish()
    }
}
