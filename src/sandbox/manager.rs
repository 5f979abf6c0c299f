//! Sandbox lifecycle and per-command wrapping.
//!
//! A [`SandboxManager`] is an owned instance; hosts share it as
//! `Arc<SandboxManager>`. The active generation lives behind an
//! `ArcSwapOption`, so `wrap_command` loads one consistent snapshot without
//! waiting on transitions. Transitions themselves are serialized by an async
//! mutex.
//!
//! No public entry point returns an error. Failures are logged and the
//! affected operation degrades: `initialize` leaves sandboxing inactive,
//! `update_config` keeps the previous generation, and `wrap_command` returns
//! the raw command.

use arc_swap::ArcSwapOption;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::{DEFAULT_FILTER_CACHE_CAPACITY, FilterCache, FilterLease};
use super::detect::{PlatformInfo, SandboxLevel};
use super::error::{Result, SandboxError};
use super::filter::{FilterBackend, FilterSpec, Fingerprint};
use super::network::{NetworkEnforcer, NetworkState, ProxyHandle, proxy};
use super::policy::{
    FsOp, NetworkPolicy, ProcessDefaults, SandboxOptions, SandboxRuntimeConfig,
    build_runtime_config, validate_working_dir,
};
use super::violations::{
    DEFAULT_VIOLATION_CAPACITY, ViolationEntry, ViolationKind, ViolationStore, parse_denials,
};
use super::wrap::{self, ProxyEnv};
use crate::config::Config;
use crate::paths::Paths;

/// Lifecycle of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Uninitialized,
    Initializing,
    Active,
    ShuttingDown,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SandboxState::Uninitialized => "uninitialized",
            SandboxState::Initializing => "initializing",
            SandboxState::Active => "active",
            SandboxState::ShuttingDown => "shutting-down",
        })
    }
}

/// The active policy and its version id.
#[derive(Debug, Clone)]
pub struct Generation {
    pub id: u64,
    pub config: Arc<SandboxRuntimeConfig>,
}

/// Static manager settings, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Requested level: "auto" | "full" | "standard" | "minimal" | "none"
    pub level: String,
    pub filters_dir: PathBuf,
    pub filter_cache_capacity: usize,
    pub violation_capacity: usize,
    pub violation_log: Option<PathBuf>,
    /// Explicit helper; `None` means lookup.
    pub apply_helper: Option<PathBuf>,
    /// Where the helper symlink is created when lookup falls through.
    pub helper_link: PathBuf,
    pub shell: String,
    /// Directories sandboxed commands may never write to.
    pub protected_dirs: Vec<PathBuf>,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        let sandbox = &config.sandbox;
        let paths = &config.paths;
        Self {
            level: sandbox.level.clone(),
            filters_dir: paths.filters_dir(),
            filter_cache_capacity: sandbox.cache.capacity,
            violation_capacity: sandbox.violations.capacity,
            violation_log: sandbox.violations.persist.then(|| paths.violation_log()),
            apply_helper: sandbox.apply_helper_path(),
            helper_link: paths.helper_link(),
            shell: sandbox.shell.clone(),
            protected_dirs: paths.protected_dirs(),
        }
    }

    /// Settings with every directory under `root`.
    pub fn in_dir(root: &Path) -> Self {
        let paths = Paths::in_dir(root);
        Self {
            level: "auto".to_string(),
            filters_dir: paths.filters_dir(),
            filter_cache_capacity: DEFAULT_FILTER_CACHE_CAPACITY,
            violation_capacity: DEFAULT_VIOLATION_CAPACITY,
            violation_log: None,
            apply_helper: None,
            helper_link: paths.helper_link(),
            shell: "/bin/bash".to_string(),
            protected_dirs: paths.protected_dirs(),
        }
    }
}

/// Everything `wrap_command` needs, swapped as one value.
#[derive(Debug)]
struct ActiveState {
    generation: Generation,
    options: SandboxOptions,
    backend: FilterBackend,
    helper: PathBuf,
    proxy_port: Option<u16>,
    base_fingerprint: Fingerprint,
}

/// Resources one wrapped command holds until its task is cleaned up.
#[derive(Debug)]
struct TaskLease {
    lease: FilterLease,
    token: Option<String>,
}

pub struct SandboxManager {
    settings: ManagerSettings,
    platform: PlatformInfo,
    level: SandboxLevel,
    defaults: ProcessDefaults,
    state: ArcSwapOption<ActiveState>,
    transition: tokio::sync::Mutex<()>,
    lifecycle: Mutex<SandboxState>,
    cache: FilterCache,
    violations: Arc<ViolationStore>,
    network: Arc<NetworkEnforcer>,
    proxy: Mutex<Option<ProxyHandle>>,
    leases: Mutex<HashMap<String, Vec<TaskLease>>>,
    next_generation: AtomicU64,
}

impl fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxManager")
            .field("state", &self.state())
            .field("level", &self.level)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl SandboxManager {
    pub fn new(settings: ManagerSettings) -> Result<Self> {
        Self::with_platform(settings, PlatformInfo::detect())
    }

    /// Build a manager for an already-detected platform.
    pub fn with_platform(settings: ManagerSettings, platform: PlatformInfo) -> Result<Self> {
        let cache = FilterCache::new(&settings.filters_dir, settings.filter_cache_capacity)?;

        let mut store = ViolationStore::new(settings.violation_capacity);
        if let Some(log) = &settings.violation_log {
            store = store.with_log(log);
        }
        let violations = Arc::new(store);

        let level = platform.capabilities.effective_level(&settings.level);
        let defaults = ProcessDefaults::detect(&settings.protected_dirs);

        Ok(Self {
            network: Arc::new(NetworkEnforcer::new(violations.clone())),
            settings,
            platform,
            level,
            defaults,
            state: ArcSwapOption::empty(),
            transition: tokio::sync::Mutex::new(()),
            lifecycle: Mutex::new(SandboxState::Uninitialized),
            cache,
            violations,
            proxy: Mutex::new(None),
            leases: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        })
    }

    pub fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    /// Effective enforcement level after clamping the requested one.
    pub fn level(&self) -> SandboxLevel {
        self.level
    }

    pub fn state(&self) -> SandboxState {
        *self.lifecycle()
    }

    fn lifecycle(&self) -> MutexGuard<'_, SandboxState> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_lifecycle(&self, state: SandboxState) {
        *self.lifecycle() = state;
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<String, Vec<TaskLease>>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn proxy_slot(&self) -> MutexGuard<'_, Option<ProxyHandle>> {
        self.proxy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build the first generation. Returns whether sandboxing is active.
    /// Calling it on an active manager is a no-op.
    pub async fn initialize(&self, options: SandboxOptions) -> bool {
        let _transition = self.transition.lock().await;
        if self.state.load().is_some() {
            return true;
        }

        self.set_lifecycle(SandboxState::Initializing);
        match self.activate(options).await {
            Ok(active) => {
                info!(
                    generation = active.generation.id,
                    level = %self.level,
                    platform = %self.platform.platform,
                    proxy_port = ?active.proxy_port,
                    "sandbox initialized"
                );
                self.state.store(Some(active));
                self.set_lifecycle(SandboxState::Active);
                true
            }
            Err(e) => {
                warn!("Sandbox initialization failed, commands will run unsandboxed: {}", e);
                self.stop_proxy().await;
                self.network.install(NetworkState::inert());
                self.set_lifecycle(SandboxState::Uninitialized);
                false
            }
        }
    }

    async fn activate(&self, options: SandboxOptions) -> Result<Arc<ActiveState>> {
        if !self.platform.is_supported() || self.level == SandboxLevel::None {
            return Err(SandboxError::PlatformUnsupported(format!(
                "{} (level {})",
                self.platform.platform, self.level
            )));
        }
        let backend = FilterBackend::for_platform().ok_or_else(|| {
            SandboxError::PlatformUnsupported(self.platform.platform.to_string())
        })?;
        let helper =
            wrap::resolve_apply_helper(self.settings.apply_helper.as_deref(), &self.settings.helper_link)?;

        let config = build_runtime_config(&options, &self.defaults)?;
        let proxy_port = self.ensure_proxy(&config.network).await?;
        self.build_state(options, config, backend, helper, proxy_port)
    }

    /// Start the proxy if `network` needs one and it is not running yet.
    async fn ensure_proxy(&self, network: &NetworkPolicy) -> Result<Option<u16>> {
        if !network.is_mediated() {
            return Ok(None);
        }
        if let Some(handle) = self.proxy_slot().as_ref() {
            return Ok(Some(handle.addr().port()));
        }

        let handle = proxy::start(self.network.clone()).await?;
        let port = handle.addr().port();
        *self.proxy_slot() = Some(handle);
        Ok(Some(port))
    }

    async fn stop_proxy(&self) {
        let handle = self.proxy_slot().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
            debug!("network proxy stopped");
        }
    }

    /// Compile the base filter, then publish the network snapshot. Nothing
    /// is published if compilation fails.
    fn build_state(
        &self,
        options: SandboxOptions,
        config: SandboxRuntimeConfig,
        backend: FilterBackend,
        helper: PathBuf,
        proxy_port: Option<u16>,
    ) -> Result<Arc<ActiveState>> {
        let spec = FilterSpec::new(&config.filesystem, backend, proxy_port);
        let base_fingerprint = self.cache.prepare(&spec)?;

        let id = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.network
            .install(NetworkState::new(id, &config.network, CancellationToken::new()));

        Ok(Arc::new(ActiveState {
            generation: Generation {
                id,
                config: Arc::new(config),
            },
            options,
            backend,
            helper,
            proxy_port,
            base_fingerprint,
        }))
    }

    /// Merge `partial` into the current options and activate the result as
    /// a new generation. Returns whether the new generation was applied.
    pub async fn update_config(&self, partial: SandboxOptions) -> bool {
        let _transition = self.transition.lock().await;
        let Some(current) = self.state.load_full() else {
            warn!("update_config called while sandboxing is inactive");
            return false;
        };

        let options = current.options.merge(&partial);
        let config = match build_runtime_config(&options, &self.defaults) {
            Ok(config) => config,
            Err(e) => {
                warn!("Rejected sandbox update: {}", e);
                return false;
            }
        };
        let mediated = config.network.is_mediated();

        let proxy_port = match self.ensure_proxy(&config.network).await {
            Ok(port) => port,
            Err(e) => {
                warn!("Rejected sandbox update: {}", e);
                return false;
            }
        };

        match self.build_state(
            options,
            config,
            current.backend,
            current.helper.clone(),
            proxy_port,
        ) {
            Ok(next) => {
                info!(
                    generation = next.generation.id,
                    fingerprint = next.base_fingerprint.short(),
                    "sandbox policy updated"
                );
                self.state.store(Some(next));
                if !mediated {
                    self.stop_proxy().await;
                }
                true
            }
            Err(e) => {
                warn!("Rejected sandbox update: {}", e);
                false
            }
        }
    }

    /// Stop the proxy, deny pending asks and forget all cached state.
    pub async fn shutdown(&self) {
        let _transition = self.transition.lock().await;
        self.set_lifecycle(SandboxState::ShuttingDown);

        self.state.store(None);
        self.network.install(NetworkState::inert());
        self.network.clear_tasks();
        self.stop_proxy().await;
        self.leases().clear();
        self.cache.clear();

        self.set_lifecycle(SandboxState::Uninitialized);
        info!("sandbox shut down");
    }

    /// [`shutdown`](Self::shutdown) plus an empty violation ledger.
    pub async fn reset(&self) {
        self.shutdown().await;
        let cleared = self.violations.clear(None);
        debug!(cleared, "violation store cleared");
    }

    pub fn is_sandboxing_enabled(&self) -> bool {
        self.state.load().is_some()
    }

    /// The active policy, if any.
    pub fn get_config(&self) -> Option<Arc<SandboxRuntimeConfig>> {
        self.state
            .load()
            .as_ref()
            .map(|active| active.generation.config.clone())
    }

    /// Active generation id, if any.
    pub fn generation(&self) -> Option<u64> {
        self.state.load().as_ref().map(|active| active.generation.id)
    }

    /// Port of the running network proxy.
    pub fn proxy_port(&self) -> Option<u16> {
        self.state.load().as_ref().and_then(|active| active.proxy_port)
    }

    pub fn violations(&self) -> &Arc<ViolationStore> {
        &self.violations
    }

    pub fn network(&self) -> &Arc<NetworkEnforcer> {
        &self.network
    }

    /// Wrap `command` so it runs under the active policy. `working_dir`
    /// becomes writable for this call only.
    ///
    /// Returns `command` unchanged when sandboxing is inactive or wrapping
    /// fails.
    pub fn wrap_command(&self, task_id: &str, command: &str, working_dir: Option<&Path>) -> String {
        let Some(active) = self.state.load_full() else {
            return command.to_string();
        };

        match self.try_wrap(&active, task_id, command, working_dir) {
            Ok(wrapped) => wrapped,
            Err(e) => {
                warn!(task_id, "Failed to wrap command, running unsandboxed: {}", e);
                command.to_string()
            }
        }
    }

    fn try_wrap(
        &self,
        active: &ActiveState,
        task_id: &str,
        command: &str,
        working_dir: Option<&Path>,
    ) -> Result<String> {
        let base = &active.generation.config.filesystem;
        let effective = match working_dir.map(validate_working_dir) {
            Some(Ok(dir)) => base.with_working_dir(&dir),
            Some(Err(e)) => {
                warn!(task_id, "Ignoring working directory allowance: {}", e);
                base.clone()
            }
            None => base.clone(),
        };

        let spec = FilterSpec::new(&effective, active.backend, active.proxy_port);
        let lease = self.cache.acquire(&spec)?;
        if !lease.artifact_path().exists() {
            lease.filter().store(lease.artifact_path())?;
        }

        let token = active
            .proxy_port
            .map(|_| self.network.register_task(task_id, Some(command)));
        let proxy_env = active.proxy_port.zip(token.clone()).map(|(port, token)| ProxyEnv { port, token });

        let wrapped = wrap::render(
            &active.helper,
            lease.artifact_path(),
            &self.settings.shell,
            command,
            proxy_env.as_ref(),
        );
        debug!(
            task_id,
            generation = active.generation.id,
            fingerprint = lease.fingerprint().short(),
            "wrapped command"
        );

        self.leases()
            .entry(task_id.to_string())
            .or_default()
            .push(TaskLease { lease, token });
        Ok(wrapped)
    }

    /// Release the task's filter leases and proxy tokens.
    pub fn cleanup_after_task(&self, task_id: &str) {
        let Some(held) = self.leases().remove(task_id) else {
            return;
        };
        for task_lease in &held {
            if let Some(token) = &task_lease.token {
                self.network.forget_token(token);
            }
        }
        debug!(task_id, released = held.len(), "task cleaned up");
    }

    /// Fingerprints of the filters `task_id` currently holds.
    pub fn task_filters(&self, task_id: &str) -> Vec<Fingerprint> {
        self.leases()
            .get(task_id)
            .map(|held| held.iter().map(|t| t.lease.fingerprint().clone()).collect())
            .unwrap_or_default()
    }

    /// Evict every unreferenced cached filter except the active base one.
    /// Returns the number of filters removed.
    pub fn cleanup_filters(&self) -> usize {
        let active = self.state.load_full();
        let keep = active.as_ref().map(|a| &a.base_fingerprint);
        let removed = self.cache.sweep(keep);
        if removed > 0 {
            info!(removed, "evicted unused filters");
        }
        removed
    }

    /// Attribute "Permission denied" lines in a finished command's stderr to
    /// the filter the task ran under. Returns the number of violations
    /// recorded.
    pub fn record_command_failure(&self, task_id: &str, command: &str, stderr: &str) -> usize {
        let denials = parse_denials(stderr);
        if denials.is_empty() {
            return 0;
        }

        let model = {
            let leases = self.leases();
            leases
                .get(task_id)
                .and_then(|held| held.last())
                .map(|t| t.lease.filter().spec.filesystem.clone())
        };
        let Some(model) = model.or_else(|| self.get_config().map(|c| c.filesystem.clone())) else {
            return 0;
        };

        let mut recorded = 0;
        for denial in denials {
            let path = &denial.path;
            let kind = match denial.hint {
                Some(FsOp::Write) => {
                    (!model.permits(FsOp::Write, path)).then_some(ViolationKind::FsWrite)
                }
                _ if !model.permits(FsOp::Read, path) => Some(ViolationKind::FsRead),
                _ if !model.permits(FsOp::Write, path) => Some(ViolationKind::FsWrite),
                _ => None,
            };
            if let Some(kind) = kind {
                self.violations.record(ViolationEntry::new(
                    kind,
                    path.display().to_string(),
                    Some(task_id),
                    Some(command),
                ));
                recorded += 1;
            }
        }
        recorded
    }
}
