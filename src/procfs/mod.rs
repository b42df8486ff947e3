//! Process introspection from the proc filesystem
//!
//! Reads one PID's facts straight from the process table:
//!
//! ```text
//! /proc/<pid>/
//! ├── stat      # name, state, parent PID  (required)
//! ├── cmdline   # NUL-separated argv
//! ├── exe       # -> executable
//! ├── cwd       # -> working directory
//! ├── environ   # NUL-separated KEY=VALUE
//! └── fd/*      # -> socket:[inode] for sockets
//! ```
//!
//! Only `stat` is required. Any other field that cannot be read (permission
//! denied, process raced away mid-read) comes back empty.

pub mod chain;
pub mod net;
pub mod scan;

#[cfg(test)]
pub(crate) mod testing;

pub use chain::{find_launch_script, is_shell, parent_chain, walk_chain, MAX_CHAIN_DEPTH};
pub use net::{processes_on_port, ports_for_process, InodeIndex, ListenTable};
pub use scan::Scan;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

const PROC_ROOT: &str = "/proc";

/// Point-in-time view of one process. Never stored as truth, always re-read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    pub cmdline: String,
    pub exe: String,
    pub cwd: String,
    #[serde(default)]
    pub environ: BTreeMap<String, String>,
    /// TCP ports this process is listening on (sorted)
    #[serde(default)]
    pub ports: Vec<u16>,
}

/// Fields of /proc/<pid>/stat we care about
#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    pub name: String,
    pub state: char,
    pub ppid: u32,
}

impl Stat {
    /// Zombie or dead: the PID exists only until its parent reaps it
    pub fn is_defunct(&self) -> bool {
        matches!(self.state, 'Z' | 'X')
    }
}

/// Parse the `pid (comm) state ppid ...` line.
///
/// `comm` may itself contain spaces and parentheses, so the name runs from
/// the first `(` to the last `)`.
pub fn parse_stat(content: &str) -> Option<Stat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    if close < open {
        return None;
    }

    let name = content[open + 1..close].to_string();
    let mut fields = content[close + 1..].split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;

    Some(Stat { name, state, ppid })
}

/// Handle on a proc filesystem mount
#[derive(Debug, Clone)]
pub struct Procfs {
    root: PathBuf,
}

impl Default for Procfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Procfs {
    /// The host's /proc
    pub fn new() -> Self {
        Self::at(PROC_ROOT)
    }

    /// A proc tree rooted somewhere else (tests, containers)
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn pid_dir(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// All numeric entries under the root, ascending
    pub fn pids(&self) -> Result<Vec<u32>, ProcError> {
        let mut pids: Vec<u32> = std::fs::read_dir(&self.root)?
            .flatten()
            .filter_map(|entry| entry.file_name().to_str().and_then(|n| n.parse().ok()))
            .filter(|pid| *pid != 0)
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    /// Read the base record. This is the only read that decides existence.
    pub fn stat(&self, pid: u32) -> Result<Stat, ProcError> {
        if pid == 0 {
            return Err(ProcError::NotFound(pid));
        }

        let path = self.pid_dir(pid).join("stat");
        let content = std::fs::read_to_string(&path).map_err(|e| {
            log::debug!("Cannot read {}: {}", path.display(), e);
            ProcError::NotFound(pid)
        })?;

        parse_stat(&content).ok_or_else(|| {
            log::debug!("Unparseable stat for PID {}: {:?}", pid, content);
            ProcError::NotFound(pid)
        })
    }

    /// True if the PID is a zombie waiting to be reaped
    pub fn is_defunct(&self, pid: u32) -> bool {
        self.stat(pid).map(|s| s.is_defunct()).unwrap_or(false)
    }

    /// Introspect one PID, reading the socket tables for this call only
    pub fn read_process_info(&self, pid: u32) -> Result<ProcessInfo, ProcError> {
        let listeners = ListenTable::load(self);
        self.read_process_info_with(pid, &listeners)
    }

    /// Introspect one PID against an already-loaded listening-socket table
    pub fn read_process_info_with(
        &self,
        pid: u32,
        listeners: &ListenTable,
    ) -> Result<ProcessInfo, ProcError> {
        let stat = self.stat(pid)?;
        let dir = self.pid_dir(pid);

        let cmdline = std::fs::read(dir.join("cmdline"))
            .map(|raw| {
                String::from_utf8_lossy(&raw)
                    .replace('\0', " ")
                    .trim()
                    .to_string()
            })
            .unwrap_or_default();

        Ok(ProcessInfo {
            pid,
            ppid: stat.ppid,
            name: stat.name,
            cmdline,
            exe: read_link_string(&dir.join("exe")),
            cwd: read_link_string(&dir.join("cwd")),
            environ: read_environ(&dir.join("environ")),
            ports: net::ports_with(self, pid, listeners).into_iter().collect(),
        })
    }
}

fn read_link_string(path: &Path) -> String {
    std::fs::read_link(path)
        .map(|target| target.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn read_environ(path: &Path) -> BTreeMap<String, String> {
    let Ok(raw) = std::fs::read(path) else {
        return BTreeMap::new();
    };

    String::from_utf8_lossy(&raw)
        .split('\0')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ProcError {
    #[error("Process {0} not found")]
    NotFound(u32),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
