//! Adopting processes we did not spawn
//!
//! - `monitor` / `discover_by_pid` / `discover_by_port` adopt one process
//!   under a caller-chosen name.
//! - `reconcile` re-binds stopped instances to live processes that hold one
//!   of their old ports and run a command that overlaps the recorded one.
//!
//! Matching runs against a single [`Scan`] so the host is walked once per
//! pass, however many instances are waiting.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use super::process::{self, Liveness};
use super::state::{Instance, InstanceStatus, DISCOVERED_TEMPLATE};
use super::{watch, Manager, ManagerError, Shared};
use crate::procfs::{self, find_launch_script, ProcessInfo, Procfs, Scan};

/// Resource type used to record an adopted process's listening port
const PORT_RESOURCE: &str = "tcpport";

/// A stopped instance matched to a live process
#[derive(Debug, Clone)]
pub struct Rebind {
    pub name: String,
    pub pid: u32,
    /// The process's chain, self first
    pub chain: Vec<ProcessInfo>,
}

fn command_overlaps(recorded: &str, candidate: &str) -> bool {
    !candidate.is_empty() && (candidate.contains(recorded) || recorded.contains(candidate))
}

/// Pair stopped instances with scanned processes.
///
/// An instance matches a process when the process listens on a port the
/// instance had bound, and the instance's command overlaps the command line
/// of the process or one of its ancestors. First match wins and a process
/// is bound to at most one instance.
pub fn match_stopped(
    procfs: &Procfs,
    scan: &Scan,
    instances: &BTreeMap<String, Instance>,
) -> Vec<Rebind> {
    let mut consumed: HashSet<u32> = HashSet::new();
    let mut rebinds = Vec::new();

    for inst in instances.values() {
        if inst.status != InstanceStatus::Stopped || inst.command.trim().is_empty() {
            continue;
        }

        let candidates: BTreeSet<u32> = inst
            .ports()
            .flat_map(|port| scan.listeners(port).iter().copied())
            .filter(|pid| !consumed.contains(pid))
            .collect();

        for pid in candidates {
            let chain = scan.chain(procfs, pid);
            if chain
                .iter()
                .any(|p| command_overlaps(&inst.command, &p.cmdline))
            {
                log::debug!("{} matches PID {}", inst.name, pid);
                consumed.insert(pid);
                rebinds.push(Rebind {
                    name: inst.name.clone(),
                    pid,
                    chain,
                });
                break;
            }
        }
    }

    rebinds
}

impl Manager {
    /// Adopt a running process and watch it until it exits.
    ///
    /// Its first listening port is recorded and claimed as a `tcpport`.
    pub async fn monitor(&self, pid: u32, name: &str) -> Result<Instance, ManagerError> {
        let mut shared = self.shared.lock().await;
        self.check_new_name(&shared, name)?;

        if !process::is_alive(&self.procfs, pid) {
            return Err(ManagerError::NotRunning(pid));
        }
        let info = self.procfs.read_process_info(pid)?;

        let mut inst = Instance::new(name, DISCOVERED_TEMPLATE);
        inst.command = info.cmdline.clone();
        inst.cwd = Some(info.cwd.clone()).filter(|c| !c.is_empty());
        if let Some(port) = info.ports.first() {
            inst.resources
                .insert(PORT_RESOURCE.to_string(), port.to_string());
        }

        self.adopt(&mut shared, inst, pid)
    }

    /// Adopt a process with its full ancestry and launch script
    pub async fn discover_by_pid(&self, pid: u32, name: &str) -> Result<Instance, ManagerError> {
        let mut shared = self.shared.lock().await;
        self.check_new_name(&shared, name)?;

        let chain = procfs::parent_chain(&self.procfs, pid)?;
        let inst = discovered_instance(name, &chain, None);
        self.adopt(&mut shared, inst, pid)
    }

    /// Adopt whichever process listens on `port` (lowest PID if several)
    pub async fn discover_by_port(&self, port: u16, name: &str) -> Result<Instance, ManagerError> {
        let mut shared = self.shared.lock().await;
        self.check_new_name(&shared, name)?;

        let pid = procfs::processes_on_port(&self.procfs, port)?
            .into_iter()
            .next()
            .ok_or(ManagerError::NoListener(port))?;

        let chain = procfs::parent_chain(&self.procfs, pid)?;
        let inst = discovered_instance(name, &chain, Some(port));
        self.adopt(&mut shared, inst, pid)
    }

    fn check_new_name(&self, shared: &Shared, name: &str) -> Result<(), ManagerError> {
        if name.trim().is_empty() {
            return Err(ManagerError::InvalidName(name.to_string()));
        }
        if shared.state.instances.contains_key(name) {
            return Err(ManagerError::DuplicateInstance(name.to_string()));
        }
        Ok(())
    }

    /// Record an adopted instance as running, claim what it holds and start
    /// polling it
    fn adopt(&self, shared: &mut Shared, mut inst: Instance, pid: u32) -> Result<Instance, ManagerError> {
        let name = inst.name.clone();
        inst.managed = process::probe(pid) == Liveness::Alive;
        inst.set_running(pid);

        claim_recorded(shared, &mut inst);
        shared.state.instances.insert(name.clone(), inst.clone());
        self.watch_adopted(shared, &name, pid);
        shared.persist()?;

        log::info!(
            "Adopted PID {} as {}{}",
            pid,
            name,
            if inst.managed { "" } else { " (monitor only)" }
        );
        Ok(inst)
    }

    fn watch_adopted(&self, shared: &mut Shared, name: &str, pid: u32) {
        let token = shared.attach(name, false);
        watch::spawn_poller(
            Arc::clone(&self.shared),
            self.procfs.clone(),
            name.to_string(),
            pid,
            self.watch_interval,
            token,
        );
    }

    /// Host processes not bound to a running instance
    pub async fn scan(&self, ports_only: bool) -> Result<Vec<ProcessInfo>, ManagerError> {
        let mut shared = self.shared.lock().await;
        self.refresh_locked(&mut shared);
        let exclude = running_pids(&shared);
        drop(shared);

        let scan = Scan::collect(&self.procfs, &exclude)?;
        Ok(scan
            .into_processes()
            .into_iter()
            .filter(|p| !ports_only || !p.ports.is_empty())
            .collect())
    }

    /// Re-bind stopped instances to live processes. Returns what was re-bound.
    pub async fn reconcile(&self) -> Result<Vec<Instance>, ManagerError> {
        let mut shared = self.shared.lock().await;
        self.refresh_locked(&mut shared);

        let scan = Scan::collect(&self.procfs, &running_pids(&shared))?;
        let rebinds = match_stopped(&self.procfs, &scan, &shared.state.instances);

        let mut rebound = Vec::with_capacity(rebinds.len());
        for rebind in rebinds {
            let Some(mut inst) = shared.state.instances.get(&rebind.name).cloned() else {
                continue;
            };

            inst.managed = process::probe(rebind.pid) == Liveness::Alive;
            inst.set_running(rebind.pid);
            inst.launch_script = find_launch_script(&rebind.chain).cloned();
            inst.parent_chain = rebind.chain;

            claim_recorded(&mut shared, &mut inst);
            shared.state.instances.insert(inst.name.clone(), inst.clone());
            self.watch_adopted(&mut shared, &inst.name, rebind.pid);

            log::info!("Reconciled {} with PID {}", inst.name, rebind.pid);
            rebound.push(inst);
        }

        if !rebound.is_empty() {
            shared.persist()?;
        }
        Ok(rebound)
    }
}

fn running_pids(shared: &Shared) -> HashSet<u32> {
    shared
        .state
        .instances
        .values()
        .filter(|i| i.is_running())
        .map(|i| i.pid)
        .collect()
}

/// Claim an adopted instance's recorded resources. Bindings that cannot be
/// claimed (unknown type, owned by someone else) are dropped from the record.
fn claim_recorded(shared: &mut Shared, inst: &mut Instance) {
    let name = inst.name.clone();
    inst.resources.retain(|kind, value| {
        match shared.state.table.claim(kind, value, &name) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{}: not claiming {}:{}: {}", name, kind, value, e);
                false
            }
        }
    });
}

fn discovered_instance(name: &str, chain: &[ProcessInfo], port: Option<u16>) -> Instance {
    let mut inst = Instance::new(name, DISCOVERED_TEMPLATE);
    inst.discovered = true;

    if let Some(info) = chain.first() {
        inst.command = info.cmdline.clone();
        inst.cwd = Some(info.cwd.clone()).filter(|c| !c.is_empty());
        if let Some(port) = port.or_else(|| info.ports.first().copied()) {
            inst.resources
                .insert(PORT_RESOURCE.to_string(), port.to_string());
        }
    }

    inst.launch_script = find_launch_script(chain).cloned();
    inst.parent_chain = chain.to_vec();
    inst
}
