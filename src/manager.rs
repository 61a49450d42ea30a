//! Configuration manager
//!
//! Drives a candidate configuration through validate, diff, ordered apply
//! and commit, or rolls the pass back. Only one pass runs at a time.

pub mod plan;
pub mod state;

pub use plan::{DependencyGraph, Operation, PlannedStep};
pub use state::{ApplyTracker, Phase};

use crate::error::{Error, ErrorDescriptor, Result};
use crate::netconfig::{InterfaceKind, NetworkConfiguration};
use crate::plugin::{self, InterfacePlugin, InterfaceState, PluginContext};
use crate::store::ConfigStore;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

type PluginMap = BTreeMap<String, Box<dyn InterfacePlugin>>;

/// Active configuration and the plugins realizing it
#[derive(Default)]
struct Live {
    active: Option<NetworkConfiguration>,
    plugins: PluginMap,
}

/// Bookkeeping of one apply pass, used for rollback
#[derive(Default)]
struct Pass {
    /// Interfaces created in this pass, in order
    applied: Vec<String>,
    /// Plugins replaced or destroyed in this pass
    previous: PluginMap,
    failed: BTreeSet<String>,
    errors: Vec<ErrorDescriptor>,
}

pub struct ConfigManager {
    ctx: PluginContext,
    store: ConfigStore,
    live: AsyncMutex<Live>,
    apply_lock: AsyncMutex<()>,
    tracker: Mutex<ApplyTracker>,
    prepared: AsyncMutex<BTreeSet<InterfaceKind>>,
    step_timeout: Option<Duration>,
}

impl ConfigManager {
    /// Create a manager with nothing active
    pub fn new(ctx: PluginContext) -> Self {
        let store = ConfigStore::new(&ctx.settings.config.data_dir);
        let secs = ctx.settings.config.step_timeout_secs;
        Self {
            store,
            live: AsyncMutex::new(Live::default()),
            apply_lock: AsyncMutex::new(()),
            tracker: Mutex::new(ApplyTracker::new()),
            prepared: AsyncMutex::new(BTreeSet::new()),
            step_timeout: (secs > 0).then(|| Duration::from_secs(secs)),
            ctx,
        }
    }

    /// Create a manager and adopt the persisted active configuration
    ///
    /// Plugins for the active configuration are rebuilt without touching
    /// the kernel, so a later pass can diff and flush them.
    pub async fn open(ctx: PluginContext) -> Result<Self> {
        let manager = Self::new(ctx);

        let seeded = manager.ctx.routing.load_tables().await?;
        if seeded > 0 {
            tracing::debug!(seeded, "Loaded interface routing table ids");
        }

        if let Some(active) = manager.store.load().await? {
            let plugins = build_plugins(&active, &manager.ctx);
            let holders: Vec<String> = plugins
                .values()
                .filter(|p| p.namespace().is_some())
                .map(|p| p.name().to_string())
                .collect();
            manager.ctx.namespace.restore(holders).await;

            tracing::info!(interfaces = active.interfaces.len(), "Loaded active configuration");
            let mut live = manager.live.lock().await;
            live.plugins = plugins;
            live.active = Some(active);
        }

        Ok(manager)
    }

    /// Every problem with a candidate, empty when it is valid
    pub fn validate_config(&self, candidate: &NetworkConfiguration) -> Vec<ErrorDescriptor> {
        let mut errors = candidate.validate();
        if let Err(e) = DependencyGraph::build(candidate).order() {
            errors.push(ErrorDescriptor {
                interface: e.interface().map(str::to_string),
                field: Some("dependsOn".into()),
                message: e.to_string(),
            });
        }
        errors
    }

    /// Ordered operations a pass would run, without running them
    pub async fn plan(&self, candidate: &NetworkConfiguration) -> Result<Vec<PlannedStep>> {
        let live = self.live.lock().await;
        plan::diff(live.active.as_ref(), candidate)
    }

    pub async fn get_active_config(&self) -> Option<NetworkConfiguration> {
        self.live.lock().await.active.clone()
    }

    /// Persist a candidate and make it the active configuration
    pub async fn save_config(&self, candidate: &NetworkConfiguration) -> Result<()> {
        self.store.save(candidate).await?;
        self.live.lock().await.active = Some(candidate.clone());
        Ok(())
    }

    /// Operational state of every live interface
    pub async fn interface_states(&self) -> Vec<InterfaceState> {
        let live = self.live.lock().await;
        let mut states = Vec::with_capacity(live.plugins.len());
        for plugin in live.plugins.values() {
            states.push(plugin.state().await);
        }
        states
    }

    /// Terminal phase of the most recent pass
    pub fn last_outcome(&self) -> Option<Phase> {
        self.with_tracker(|t| Ok(t.last_outcome())).ok().flatten()
    }

    /// Apply a candidate to the kernel
    ///
    /// Returns every error encountered; an empty list means the kernel now
    /// matches the candidate. On failure the previous state is restored as
    /// far as possible and the active configuration is unchanged.
    pub async fn try_apply_config(&self, candidate: &NetworkConfiguration) -> Vec<ErrorDescriptor> {
        let Ok(_guard) = self.apply_lock.try_lock() else {
            tracing::warn!("Rejecting apply, another pass is running");
            return vec![Error::ApplyInProgress.into()];
        };

        match self.run_pass(candidate).await {
            Ok(errors) => errors,
            Err(e) => {
                tracing::error!(error = %e, "Apply pipeline failed");
                vec![e.into()]
            }
        }
    }

    async fn run_pass(&self, candidate: &NetworkConfiguration) -> Result<Vec<ErrorDescriptor>> {
        self.with_tracker(|t| t.validate())?;
        let errors = self.validate_config(candidate);
        if !errors.is_empty() {
            tracing::info!(errors = errors.len(), "Candidate configuration rejected");
            self.with_tracker(|t| {
                t.reject()?;
                t.finish()
            })?;
            return Ok(errors);
        }

        self.with_tracker(|t| t.diff())?;
        let mut live = self.live.lock().await;
        let prepared = match plan::diff(live.active.as_ref(), candidate) {
            Ok(steps) => self.prepare_kinds(candidate).await.map(|()| steps),
            Err(e) => Err(e),
        };
        let steps = match prepared {
            Ok(steps) => steps,
            Err(e) => {
                self.with_tracker(|t| {
                    t.reject()?;
                    t.finish()
                })?;
                return Ok(vec![e.into()]);
            }
        };

        self.with_tracker(|t| t.apply())?;
        tracing::info!(steps = steps.len(), "Applying configuration");
        let mut pass = Pass::default();

        for step in &steps {
            match step.operation {
                Operation::Destroy => {
                    if let Some(mut old) = live.plugins.remove(&step.interface) {
                        tracing::info!(interface = %step.interface, "Destroying interface");
                        old.flush().await;
                        pass.previous.insert(step.interface.clone(), old);
                    }
                }
                Operation::Create | Operation::Update => {
                    self.apply_one(&mut live, candidate, &step.interface, &mut pass).await;
                }
            }
        }

        if pass.errors.is_empty() {
            self.with_tracker(|t| {
                t.commit()?;
                t.finish()
            })?;
            tracing::info!(interfaces = candidate.interfaces.len(), "Configuration applied");
            return Ok(Vec::new());
        }

        self.with_tracker(|t| t.rollback())?;
        tracing::warn!(errors = pass.errors.len(), "Apply failed, rolling back");
        self.roll_back(&mut live, &mut pass).await;
        self.with_tracker(|t| {
            t.reject()?;
            t.finish()
        })?;
        Ok(pass.errors)
    }

    /// Replace one interface's plugin with one built from the candidate
    async fn apply_one(
        &self,
        live: &mut Live,
        candidate: &NetworkConfiguration,
        name: &str,
        pass: &mut Pass,
    ) {
        if let Some(dependency) = candidate
            .dependencies_of(name)
            .into_iter()
            .find(|d| pass.failed.contains(d))
        {
            tracing::warn!(interface = %name, dependency = %dependency, "Skipping interface");
            pass.errors.push(
                Error::DependencyFailed {
                    interface: name.to_string(),
                    dependency,
                }
                .into(),
            );
            pass.failed.insert(name.to_string());
            return;
        }

        let Some(config) = candidate.get(name) else {
            return;
        };

        if let Some(mut old) = live.plugins.remove(name) {
            old.flush().await;
            pass.previous.insert(name.to_string(), old);
        }

        let mut plugin = plugin::build(name, config, candidate.master_of(name), &self.ctx);
        match self.run_step(plugin.as_mut()).await {
            Ok(()) => {
                pass.applied.push(name.to_string());
                live.plugins.insert(name.to_string(), plugin);
            }
            Err(e) => {
                tracing::warn!(interface = %name, error = %e, "Interface apply failed");
                plugin.flush().await;
                let mut descriptor = ErrorDescriptor::from(e);
                descriptor.interface.get_or_insert_with(|| name.to_string());
                pass.errors.push(descriptor);
                pass.failed.insert(name.to_string());
            }
        }
    }

    /// Create plus routes, bounded by the step timeout
    async fn run_step(&self, plugin: &mut dyn InterfacePlugin) -> Result<()> {
        let name = plugin.name().to_string();
        let work = async {
            plugin.create().await?;
            let failed = plugin.apply_routes().await;
            if failed > 0 {
                tracing::warn!(interface = %name, failed, "Some routes could not be installed");
            }
            Ok::<(), Error>(())
        };

        match self.step_timeout {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .map_err(|_| Error::StepTimeout {
                    interface: name.clone(),
                    secs: limit.as_secs(),
                })?,
            None => work.await,
        }
    }

    /// Undo this pass and bring back the plugins it replaced
    async fn roll_back(&self, live: &mut Live, pass: &mut Pass) {
        for name in pass.applied.iter().rev() {
            if let Some(mut plugin) = live.plugins.remove(name) {
                tracing::info!(interface = %name, "Rolling back interface");
                plugin.flush().await;
            }
        }

        let order = match &live.active {
            Some(active) => DependencyGraph::build(active)
                .order()
                .unwrap_or_else(|_| active.interfaces.keys().cloned().collect()),
            None => Vec::new(),
        };

        for name in order {
            let Some(mut old) = pass.previous.remove(&name) else {
                continue;
            };
            tracing::info!(interface = %name, "Restoring previous interface");
            if let Err(e) = self.run_step(old.as_mut()).await {
                tracing::warn!(interface = %name, error = %e, "Failed to restore interface");
            }
            live.plugins.insert(name, old);
        }
    }

    /// Run `prepare` once per kind per process
    async fn prepare_kinds(&self, candidate: &NetworkConfiguration) -> Result<()> {
        let kinds: BTreeSet<InterfaceKind> =
            candidate.interfaces.values().map(|i| i.kind()).collect();
        let mut prepared = self.prepared.lock().await;

        for kind in kinds {
            if prepared.contains(&kind) {
                continue;
            }
            tracing::debug!(kind = %kind, "Preparing interface kind");
            plugin::prepare(kind, &self.ctx).await?;
            prepared.insert(kind);
        }
        Ok(())
    }

    fn with_tracker<T>(&self, f: impl FnOnce(&mut ApplyTracker) -> Result<T>) -> Result<T> {
        let mut tracker = match self.tracker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut tracker)
    }
}

fn build_plugins(config: &NetworkConfiguration, ctx: &PluginContext) -> PluginMap {
    config
        .interfaces
        .iter()
        .map(|(name, intf)| {
            let plugin = plugin::build(name, intf, config.master_of(name), ctx);
            (name.clone(), plugin)
        })
        .collect()
}
