//! Instance state machine
//!
//! ```text
//!     ┌──────────┐
//!     │ Stopped  │◄────────────────────────┐
//!     └────┬─────┘                         │
//!          │ start / restart               │
//!     ┌────▼─────┐                         │
//!     │ Starting │──────────────┐          │
//!     └────┬─────┘              │ fail     │
//!          │ spawned            │          │
//!     ┌────▼─────┐         ┌────▼────┐     │
//!     │ Running  │──exit──►│ (reaped)│─────┤
//!     └────┬─────┘         └─────────┘     │
//!          │ stop                          │
//!     ┌────▼─────┐                         │
//!     │ Stopping │─────────────────────────┘
//!     └────┬─────┘
//!          │ fail
//!     ┌────▼────┐
//!     │  Error  │
//!     └─────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::procfs::ProcessInfo;

/// Template ID recorded on adopted processes
pub const DISCOVERED_TEMPLATE: &str = "discovered";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reusable process blueprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    #[serde(default)]
    pub label: String,
    /// Command with `${var}` and `%type` placeholders
    pub command: String,
    /// Resource types allocated before interpolation, in order
    #[serde(default)]
    pub resources: Vec<String>,
    /// Default variables; caller-supplied values win
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

/// One named process, spawned by us or adopted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub template: String,
    /// Fully interpolated command, replayed verbatim on restart
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub status: InstanceStatus,
    /// resource type -> value last bound to this instance
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
    /// Unix timestamp of the last start or adoption
    #[serde(default)]
    pub started_at: i64,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Whether we are allowed to signal the process
    #[serde(default)]
    pub managed: bool,
    #[serde(default)]
    pub discovered: bool,
    #[serde(default)]
    pub launch_script: Option<ProcessInfo>,
    #[serde(default)]
    pub parent_chain: Vec<ProcessInfo>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Instance {
    pub fn new(name: &str, template: &str) -> Self {
        Self {
            name: name.to_string(),
            template: template.to_string(),
            command: String::new(),
            pid: 0,
            status: InstanceStatus::Stopped,
            resources: BTreeMap::new(),
            started_at: 0,
            cwd: None,
            managed: false,
            discovered: false,
            launch_script: None,
            parent_chain: Vec::new(),
            last_error: None,
        }
    }

    pub fn set_starting(&mut self) {
        self.status = InstanceStatus::Starting;
        self.last_error = None;
    }

    pub fn set_running(&mut self, pid: u32) {
        self.status = InstanceStatus::Running;
        self.pid = pid;
        self.started_at = chrono::Utc::now().timestamp();
        self.last_error = None;
    }

    pub fn set_stopping(&mut self) {
        self.status = InstanceStatus::Stopping;
    }

    pub fn set_stopped(&mut self) {
        self.status = InstanceStatus::Stopped;
        self.pid = 0;
    }

    pub fn set_failed(&mut self, error: String) {
        self.status = InstanceStatus::Error;
        self.pid = 0;
        self.last_error = Some(error);
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running && self.pid != 0
    }

    /// Ports recorded in the instance's resource values
    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.resources.values().filter_map(|v| v.parse().ok())
    }
}
