//! Process lifecycle manager
//!
//! Starts, stops and restarts instances built from templates, allocating
//! their resources on the way in and releasing them on the way out.
//!
//! All state lives behind one async mutex. Allocation holds the lock from the
//! first availability check until the claim is persisted, so a concurrent
//! start and reconcile can never both claim the same resource. Stop is the
//! one operation that lets go while it waits: the instance sits in
//! `stopping` until the process is gone, and the PID it recorded decides
//! who settles it.

pub mod discovery;
mod interpolate;
pub mod process;
pub mod state;
mod watch;

pub use discovery::{match_stopped, Rebind};
pub use process::{Liveness, SpawnError, Termination};
pub use state::{Instance, InstanceStatus, Template, DISCOVERED_TEMPLATE};

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::procfs::{ProcError, Procfs};
use crate::resources::{AllocError, Resource, ResourceType, ShellCheck};
use crate::store::{JsonStore, State, StateStore, StoreError};
use watch::Watch;

/// State guarded by the manager lock
pub(crate) struct Shared {
    state: State,
    watchers: HashMap<String, Watch>,
    store: Box<dyn StateStore>,
}

impl Shared {
    fn persist(&mut self) -> Result<(), StoreError> {
        self.store.save(&self.state)
    }

    fn persist_or_log(&mut self) {
        if let Err(e) = self.persist() {
            log::error!("Failed to save state: {}", e);
        }
    }

    fn instance(&self, name: &str) -> Result<&Instance, ManagerError> {
        self.state
            .instances
            .get(name)
            .ok_or_else(|| ManagerError::UnknownInstance(name.to_string()))
    }

    fn instance_mut(&mut self, name: &str) -> Result<&mut Instance, ManagerError> {
        self.state
            .instances
            .get_mut(name)
            .ok_or_else(|| ManagerError::UnknownInstance(name.to_string()))
    }

    /// Register a fresh watcher for `name`, cancelling any previous one
    fn attach(&mut self, name: &str, owns_child: bool) -> CancellationToken {
        self.detach(name);
        let token = CancellationToken::new();
        self.watchers.insert(
            name.to_string(),
            Watch {
                token: token.clone(),
                owns_child,
            },
        );
        token
    }

    fn detach(&mut self, name: &str) -> Option<Watch> {
        let watch = self.watchers.remove(name)?;
        watch.token.cancel();
        Some(watch)
    }

    /// Settle an instance whose process went away on its own. Ignored if the
    /// record has moved on to another PID.
    fn mark_exited(&mut self, name: &str, pid: u32, reason: &str) {
        let Some(inst) = self.state.instances.get_mut(name) else {
            return;
        };
        if inst.pid != pid {
            return;
        }

        inst.set_stopped();
        self.detach(name);
        let freed = self.state.table.release(name);
        log::info!(
            "{} (PID {}) exited: {}, released {} resource(s)",
            name,
            pid,
            reason,
            freed.len()
        );
        self.persist_or_log();
    }
}

/// Handle on the orchestrator. Clones share the same state.
#[derive(Clone)]
pub struct Manager {
    shared: Arc<Mutex<Shared>>,
    procfs: Procfs,
    checker: ShellCheck,
    stop_timeout: Duration,
    stop_poll: Duration,
    watch_interval: Duration,
}

impl Manager {
    /// Open the JSON state file named in `config`
    pub fn open(config: &Config) -> Result<Self, ManagerError> {
        Self::with_store(Box::new(JsonStore::new(&config.state_path)), config)
    }

    pub fn with_store(mut store: Box<dyn StateStore>, config: &Config) -> Result<Self, ManagerError> {
        let state = store.load()?;
        log::debug!(
            "Loaded {} instance(s), {} template(s), {} resource type(s)",
            state.instances.len(),
            state.templates.len(),
            state.table.types.len()
        );

        Ok(Self {
            shared: Arc::new(Mutex::new(Shared {
                state,
                watchers: HashMap::new(),
                store,
            })),
            procfs: Procfs::at(&config.proc_root),
            checker: ShellCheck::new(config.check_timeout),
            stop_timeout: config.stop_timeout,
            stop_poll: config.stop_poll,
            watch_interval: config.watch_interval,
        })
    }

    pub fn procfs(&self) -> &Procfs {
        &self.procfs
    }

    /// Start a new instance from a template.
    ///
    /// Resources are allocated in template order, then the command is
    /// interpolated and spawned in its own process group. Any failure rolls
    /// back every resource claimed so far and leaves the instance recorded
    /// in `error` state.
    pub async fn start_instance(
        &self,
        template_id: &str,
        name: &str,
        vars: BTreeMap<String, String>,
        cwd: Option<PathBuf>,
    ) -> Result<Instance, ManagerError> {
        let mut shared = self.shared.lock().await;

        if name.trim().is_empty() {
            return Err(ManagerError::InvalidName(name.to_string()));
        }
        if shared.state.instances.contains_key(name) {
            return Err(ManagerError::DuplicateInstance(name.to_string()));
        }
        let template = shared
            .state
            .templates
            .get(template_id)
            .cloned()
            .ok_or_else(|| ManagerError::UnknownTemplate(template_id.to_string()))?;

        let mut inst = Instance::new(name, &template.id);
        inst.cwd = cwd.map(|p| p.to_string_lossy().into_owned());
        inst.set_starting();

        match self.launch(&mut shared, &mut inst, &template, vars).await {
            Ok((child, pid)) => {
                inst.managed = true;
                inst.set_running(pid);
                shared.state.instances.insert(name.to_string(), inst.clone());
                let token = shared.attach(name, true);
                watch::spawn_reaper(Arc::clone(&self.shared), name.to_string(), child, token);
                log::info!("Started {} (PID {})", name, pid);
                shared.persist()?;
                Ok(inst)
            }
            Err(e) => {
                shared.state.table.release(name);
                inst.resources.clear();
                inst.set_failed(e.to_string());
                shared.state.instances.insert(name.to_string(), inst);
                shared.persist_or_log();
                log::warn!("Failed to start {}: {}", name, e);
                Err(e)
            }
        }
    }

    /// Allocate, interpolate and spawn. Resources claimed here are left for
    /// the caller to release on error.
    async fn launch(
        &self,
        shared: &mut Shared,
        inst: &mut Instance,
        template: &Template,
        caller_vars: BTreeMap<String, String>,
    ) -> Result<(Child, u32), ManagerError> {
        let mut vars = template.vars.clone();
        vars.extend(caller_vars);

        let table = &mut shared.state.table;
        for kind in &template.resources {
            let requested = vars.get(kind).cloned();
            let value = table
                .allocate(&self.checker, kind, requested.as_deref())
                .await?;
            table.claim(kind, &value, &inst.name)?;
            inst.resources.insert(kind.clone(), value.clone());
            vars.insert(kind.clone(), value);
        }

        let command = interpolate::substitute_vars(&template.command, &vars);
        if let Some(var) = interpolate::unresolved_var(&command) {
            return Err(ManagerError::Interpolation(format!(
                "unresolved variable ${{{}}}",
                var
            )));
        }

        for kind in interpolate::placeholders(&command) {
            if inst.resources.contains_key(&kind) {
                continue;
            }
            let value = table.allocate(&self.checker, &kind, None).await?;
            table.claim(&kind, &value, &inst.name)?;
            inst.resources.insert(kind, value);
        }

        let command = interpolate::fill_placeholders(&command, &inst.resources).map_err(|kind| {
            ManagerError::Interpolation(format!("unresolved placeholder %{}", kind))
        })?;
        if command.trim().is_empty() {
            return Err(ManagerError::Interpolation("empty command".to_string()));
        }
        inst.command = command;

        spawn_tracked(inst)
    }

    /// Stop an instance's process group and release its resources.
    /// Stopping an instance with no PID settles the record without
    /// signalling anything.
    ///
    /// The lock is released while waiting for the process to exit, so other
    /// operations keep running and observe the instance as `stopping`.
    pub async fn stop_instance(&self, name: &str) -> Result<Instance, ManagerError> {
        let pid = {
            let mut shared = self.shared.lock().await;
            match self.begin_stop(&mut shared, name)? {
                Some(pid) => pid,
                None => return Ok(shared.instance(name)?.clone()),
            }
        };

        log::info!("Stopping {} (PID {})", name, pid);
        let result = process::terminate(&self.procfs, pid, self.stop_timeout, self.stop_poll).await;

        let mut shared = self.shared.lock().await;
        self.finish_stop(&mut shared, name, pid, result)
    }

    /// Validate a stop and mark the instance `stopping`. Returns the PID to
    /// terminate, or None when the instance had no process and was settled
    /// in place.
    fn begin_stop(&self, shared: &mut Shared, name: &str) -> Result<Option<u32>, ManagerError> {
        let inst = shared.instance(name)?.clone();

        if inst.pid == 0 {
            let inst = shared.instance_mut(name)?;
            if matches!(
                inst.status,
                InstanceStatus::Running
                    | InstanceStatus::Starting
                    | InstanceStatus::Stopping
                    | InstanceStatus::Error
            ) {
                // last_error stays for inspection
                inst.set_stopped();
            }
            shared.detach(name);
            shared.state.table.release(name);
            shared.persist()?;
            return Ok(None);
        }

        if !inst.managed || process::probe(inst.pid) == Liveness::Denied {
            return Err(ManagerError::PermissionDenied(name.to_string()));
        }

        shared.instance_mut(name)?.set_stopping();
        shared.persist_or_log();
        Ok(Some(inst.pid))
    }

    /// Settle the record once `terminate` returned. If the watcher already
    /// noticed the exit (or the instance was restarted meanwhile) the record
    /// belongs to someone else and is returned untouched.
    fn finish_stop(
        &self,
        shared: &mut Shared,
        name: &str,
        pid: u32,
        result: Result<Termination, SpawnError>,
    ) -> Result<Instance, ManagerError> {
        let current = shared.instance(name)?.pid;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                if current == pid {
                    // The watcher stays attached and settles the record on exit
                    let inst = shared.instance_mut(name)?;
                    inst.status = InstanceStatus::Error;
                    inst.last_error = Some(e.to_string());
                    shared.persist_or_log();
                }
                return Err(e.into());
            }
        };

        if current != pid {
            log::debug!("{}: exit of PID {} already settled", name, pid);
            return Ok(shared.instance(name)?.clone());
        }

        let watch = shared.detach(name);
        if !watch.is_some_and(|w| w.owns_child) {
            process::reap(pid);
        }
        log::info!("Stopped {} ({:?})", name, outcome);

        shared.instance_mut(name)?.set_stopped();
        let freed = shared.state.table.release(name);
        log::debug!("{}: released {} resource(s)", name, freed.len());
        shared.persist()?;

        Ok(shared.instance(name)?.clone())
    }

    /// Re-launch a stopped instance with its recorded command and resources.
    ///
    /// Every recorded resource must still be available; otherwise nothing is
    /// claimed and nothing is spawned.
    pub async fn restart_instance(&self, name: &str) -> Result<Instance, ManagerError> {
        let mut shared = self.shared.lock().await;
        self.refresh_locked(&mut shared);

        let inst = shared.instance(name)?.clone();
        if inst.status != InstanceStatus::Stopped {
            return Err(ManagerError::NotStopped(name.to_string(), inst.status));
        }
        if inst.command.trim().is_empty() {
            return Err(ManagerError::Interpolation(format!("{} has no command", name)));
        }

        for (kind, value) in &inst.resources {
            let free = shared
                .state
                .table
                .check_for(&self.checker, kind, value, Some(name))
                .await?;
            if !free {
                log::warn!("Not restarting {}: {}={} is taken", name, kind, value);
                return Err(AllocError::Unavailable(kind.clone(), value.clone()).into());
            }
        }

        for (kind, value) in &inst.resources {
            if let Err(e) = shared.state.table.claim(kind, value, name) {
                shared.state.table.release(name);
                return Err(e.into());
            }
        }

        let spawned = {
            let inst = shared.instance_mut(name)?;
            inst.set_starting();
            spawn_tracked(inst)
        };

        match spawned {
            Ok((child, pid)) => {
                let inst = shared.instance_mut(name)?;
                inst.managed = true;
                inst.set_running(pid);
                let inst = inst.clone();
                let token = shared.attach(name, true);
                watch::spawn_reaper(Arc::clone(&self.shared), name.to_string(), child, token);
                log::info!("Restarted {} (PID {})", name, pid);
                shared.persist()?;
                Ok(inst)
            }
            Err(e) => {
                shared.state.table.release(name);
                shared.instance_mut(name)?.set_failed(e.to_string());
                shared.persist_or_log();
                log::warn!("Failed to restart {}: {}", name, e);
                Err(e)
            }
        }
    }

    /// Stop (if we may), release and forget an instance. Unmanaged processes
    /// are left running.
    pub async fn remove_instance(&self, name: &str) -> Result<Instance, ManagerError> {
        let needs_stop = {
            let shared = self.shared.lock().await;
            let inst = shared.instance(name)?;
            inst.pid != 0 && inst.managed && process::is_alive(&self.procfs, inst.pid)
        };
        if needs_stop {
            self.stop_instance(name).await?;
        }

        let mut shared = self.shared.lock().await;
        shared.detach(name);
        shared.state.table.release(name);
        let removed = shared
            .state
            .instances
            .remove(name)
            .ok_or_else(|| ManagerError::UnknownInstance(name.to_string()))?;
        shared.persist()?;
        log::info!("Removed {}", name);
        Ok(removed)
    }

    /// Settle running instances whose process is gone
    fn refresh_locked(&self, shared: &mut Shared) {
        let dead: Vec<(String, u32)> = shared
            .state
            .instances
            .values()
            .filter(|i| i.is_running() && !process::is_alive(&self.procfs, i.pid))
            .map(|i| (i.name.clone(), i.pid))
            .collect();

        for (name, pid) in dead {
            shared.mark_exited(&name, pid, "not running");
        }
    }

    pub async fn list_instances(&self) -> Vec<Instance> {
        let mut shared = self.shared.lock().await;
        self.refresh_locked(&mut shared);
        shared.state.instances.values().cloned().collect()
    }

    pub async fn instance(&self, name: &str) -> Result<Instance, ManagerError> {
        let mut shared = self.shared.lock().await;
        self.refresh_locked(&mut shared);
        shared.instance(name).cloned()
    }

    /// Pick a value of `kind` and, with an owner, claim it
    pub async fn allocate(
        &self,
        kind: &str,
        value: Option<&str>,
        owner: Option<&str>,
    ) -> Result<String, ManagerError> {
        let mut shared = self.shared.lock().await;
        let kind = kind.to_lowercase();

        let value = shared.state.table.allocate(&self.checker, &kind, value).await?;
        if let Some(owner) = owner {
            shared.state.table.claim(&kind, &value, owner)?;
        }
        shared.persist()?;
        Ok(value)
    }

    pub async fn add_resource_type(&self, rt: ResourceType) -> Result<ResourceType, ManagerError> {
        let mut shared = self.shared.lock().await;
        let added = shared.state.table.add_type(rt)?.clone();
        shared.persist()?;
        Ok(added)
    }

    pub async fn remove_resource_type(&self, name: &str) -> Result<ResourceType, ManagerError> {
        let mut shared = self.shared.lock().await;
        let removed = shared.state.table.remove_type(&name.to_lowercase())?;
        shared.persist()?;
        log::info!("Removed resource type {}", removed.name);
        Ok(removed)
    }

    pub async fn resource_types(&self) -> Vec<ResourceType> {
        let shared = self.shared.lock().await;
        shared.state.table.types.values().cloned().collect()
    }

    /// Live allocation table
    pub async fn resources(&self) -> Vec<Resource> {
        let shared = self.shared.lock().await;
        shared.state.table.allocations().cloned().collect()
    }

    /// Add or replace a template
    pub async fn add_template(&self, template: Template) -> Result<Template, ManagerError> {
        if template.id.trim().is_empty() {
            return Err(ManagerError::InvalidTemplate("empty id".to_string()));
        }
        if template.command.trim().is_empty() {
            return Err(ManagerError::InvalidTemplate(format!(
                "{}: empty command",
                template.id
            )));
        }

        let mut shared = self.shared.lock().await;
        for kind in &template.resources {
            shared.state.table.resource_type(kind)?;
        }

        log::info!("Template {} ({})", template.id, template.command);
        shared
            .state
            .templates
            .insert(template.id.clone(), template.clone());
        shared.persist()?;
        Ok(template)
    }

    pub async fn templates(&self) -> Vec<Template> {
        let shared = self.shared.lock().await;
        shared.state.templates.values().cloned().collect()
    }

    pub async fn template(&self, id: &str) -> Result<Template, ManagerError> {
        let shared = self.shared.lock().await;
        shared
            .state
            .templates
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::UnknownTemplate(id.to_string()))
    }

    /// Pick up where a previous daemon left off: watch instances whose
    /// process survived, settle the rest. Returns how many were re-attached.
    pub async fn resume(&self) -> Result<usize, ManagerError> {
        let mut shared = self.shared.lock().await;
        let names: Vec<String> = shared
            .state
            .instances
            .values()
            .filter(|i| {
                i.pid != 0
                    || matches!(
                        i.status,
                        InstanceStatus::Running | InstanceStatus::Starting | InstanceStatus::Stopping
                    )
            })
            .map(|i| i.name.clone())
            .collect();

        let mut resumed = 0;
        for name in names {
            let pid = shared.instance(&name)?.pid;

            if pid != 0 && process::is_alive(&self.procfs, pid) {
                let liveness = process::probe(pid);
                let inst = shared.instance_mut(&name)?;
                inst.status = InstanceStatus::Running;
                inst.managed = liveness == Liveness::Alive;
                let bindings: Vec<(String, String)> = inst
                    .resources
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();

                for (kind, value) in bindings {
                    if let Err(e) = shared.state.table.claim(&kind, &value, &name) {
                        log::warn!("{}: cannot re-claim {}:{}: {}", name, kind, value, e);
                    }
                }

                let token = shared.attach(&name, false);
                watch::spawn_poller(
                    Arc::clone(&self.shared),
                    self.procfs.clone(),
                    name.clone(),
                    pid,
                    self.watch_interval,
                    token,
                );
                log::info!("Watching {} (PID {})", name, pid);
                resumed += 1;
            } else {
                shared.instance_mut(&name)?.set_stopped();
                shared.state.table.release(&name);
                log::info!("{} is no longer running", name);
            }
        }

        shared.persist()?;
        Ok(resumed)
    }
}

/// Spawn an instance's recorded command in its recorded cwd
fn spawn_tracked(inst: &Instance) -> Result<(Child, u32), ManagerError> {
    let child = process::spawn(&inst.command, inst.cwd.as_deref().map(Path::new))?;
    let pid = child.id().ok_or_else(|| {
        SpawnError::Spawn(format!("{} exited before it could be tracked", inst.name))
    })?;
    Ok((child, pid))
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Instance not found: {0}")]
    UnknownInstance(String),

    #[error("Template not found: {0}")]
    UnknownTemplate(String),

    #[error("Instance {0} already exists")]
    DuplicateInstance(String),

    #[error("Invalid instance name: {0:?}")]
    InvalidName(String),

    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    #[error("Process {0} is not running")]
    NotRunning(u32),

    #[error("Instance {0} is not stopped (status: {1})")]
    NotStopped(String, InstanceStatus),

    #[error("Not allowed to signal {0} (process belongs to another user)")]
    PermissionDenied(String),

    #[error("Cannot build command: {0}")]
    Interpolation(String),

    #[error("No process listening on port {0}")]
    NoListener(u16),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error("Failed to spawn: {0}")]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Process(#[from] ProcError),

    #[error("Failed to save state: {0}")]
    Store(#[from] StoreError),
}

impl ManagerError {
    /// Stable error kind name, as reported to clients
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownInstance(_) => "UnknownInstance",
            Self::UnknownTemplate(_) => "UnknownTemplate",
            Self::DuplicateInstance(_) => "DuplicateInstanceName",
            Self::InvalidName(_) => "InvalidName",
            Self::InvalidTemplate(_) => "InvalidTemplate",
            Self::NotRunning(_) => "NotRunning",
            Self::NotStopped(..) => "NotStopped",
            Self::PermissionDenied(_) => "PermissionDenied",
            Self::Interpolation(_) => "Interpolation",
            Self::NoListener(_) => "NotFound",
            Self::Alloc(e) => match e {
                AllocError::UnknownType(_) => "UnknownResourceType",
                AllocError::Unavailable(..) | AllocError::Conflict { .. } => "ResourceUnavailable",
                AllocError::RangeExhausted { .. } => "RangeExhausted",
                AllocError::ValueRequired(_) => "ValueRequired",
                AllocError::InvalidType(_) => "InvalidResourceType",
                AllocError::TypeInUse(..) => "ResourceTypeInUse",
            },
            Self::Spawn(SpawnError::Signal { source, .. }) if *source == nix::errno::Errno::EPERM => {
                "PermissionDenied"
            }
            Self::Spawn(_) => "SpawnFailed",
            Self::Process(ProcError::NotFound(_)) => "NotFound",
            Self::Process(ProcError::Io(_)) => "Io",
            Self::Store(_) => "Store",
        }
    }
}
