//! One-pass host scan
//!
//! Introspects every PID once against a single load of the socket tables
//! and indexes the results by listening port. Matching and chain walks then
//! read from this snapshot instead of going back to /proc per candidate.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::chain::walk_chain;
use super::{ListenTable, ProcError, ProcessInfo, Procfs};

#[derive(Debug, Default)]
pub struct Scan {
    processes: BTreeMap<u32, ProcessInfo>,
    by_port: HashMap<u16, Vec<u32>>,
}

impl Scan {
    /// Enumerate and introspect every PID not in `exclude`.
    /// PIDs that exit between listing and reading are skipped.
    pub fn collect(procfs: &Procfs, exclude: &HashSet<u32>) -> Result<Self, ProcError> {
        let listeners = ListenTable::load(procfs);
        let mut scan = Self::default();

        for pid in procfs.pids()? {
            if exclude.contains(&pid) {
                continue;
            }
            match procfs.read_process_info_with(pid, &listeners) {
                Ok(info) => scan.insert(info),
                Err(e) => log::debug!("Skipping PID {}: {}", pid, e),
            }
        }

        log::debug!(
            "Scanned {} processes, {} listening ports",
            scan.processes.len(),
            scan.by_port.len()
        );
        Ok(scan)
    }

    fn insert(&mut self, info: ProcessInfo) {
        for port in &info.ports {
            self.by_port.entry(*port).or_default().push(info.pid);
        }
        self.processes.insert(info.pid, info);
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessInfo> {
        self.processes.get(&pid)
    }

    pub fn processes(&self) -> impl Iterator<Item = &ProcessInfo> {
        self.processes.values()
    }

    /// PIDs listening on `port`, ascending
    pub fn listeners(&self, port: u16) -> &[u32] {
        self.by_port.get(&port).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Parent chain for a scanned PID, self first. Ancestors missing from the
    /// snapshot (excluded PIDs) are read directly, without port resolution.
    pub fn chain(&self, procfs: &Procfs, pid: u32) -> Vec<ProcessInfo> {
        let no_listeners = ListenTable::default();
        walk_chain(pid, |p| {
            self.processes
                .get(&p)
                .cloned()
                .or_else(|| procfs.read_process_info_with(p, &no_listeners).ok())
        })
    }

    pub fn into_processes(self) -> Vec<ProcessInfo> {
        self.processes.into_values().collect()
    }
}
