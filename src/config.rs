//! Runtime configuration
//!
//! Paths and timings shared by the daemon and the control client. Resource
//! types and templates are not configured here; they live in the state file.

use std::path::PathBuf;
use std::time::Duration;

const APP_DIR: &str = "vproc";
const STATE_FILE: &str = "state.json";
const SOCKET_FILE: &str = "vproc.sock";

#[derive(Debug, Clone)]
pub struct Config {
    /// Persisted state (instances, templates, resource table)
    pub state_path: PathBuf,
    /// Unix socket the daemon listens on
    pub socket_path: PathBuf,
    /// Mount point of the proc filesystem
    pub proc_root: PathBuf,
    /// Upper bound on a single resource check command
    pub check_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_timeout: Duration,
    /// Liveness sampling interval while stopping
    pub stop_poll: Duration,
    /// Liveness polling interval for adopted processes
    pub watch_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            socket_path: default_socket_path(),
            proc_root: PathBuf::from("/proc"),
            check_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(2),
            stop_poll: Duration::from_millis(100),
            watch_interval: Duration::from_secs(2),
        }
    }
}

impl Config {
    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = path.into();
        self
    }

    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    /// Socket path as the IPC layer wants it
    pub fn socket(&self) -> String {
        self.socket_path.to_string_lossy().into_owned()
    }
}

/// `<data_dir>/vproc/state.json`, or `./vproc-state.json` without a home
pub fn default_state_path() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join(APP_DIR).join(STATE_FILE))
        .unwrap_or_else(|| PathBuf::from("vproc-state.json"))
}

/// `<runtime_dir>/vproc.sock`, or `/tmp/vproc-<uid>.sock`
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .map(|d| d.join(SOCKET_FILE))
        .unwrap_or_else(|| {
            PathBuf::from(format!("/tmp/vproc-{}.sock", nix::unistd::getuid()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings() {
        let config = Config::default();
        assert_eq!(config.check_timeout, Duration::from_secs(5));
        assert_eq!(config.stop_timeout, Duration::from_secs(2));
        assert_eq!(config.stop_poll, Duration::from_millis(100));
        assert_eq!(config.proc_root, PathBuf::from("/proc"));
    }

    #[test]
    fn test_default_paths() {
        assert!(default_state_path().ends_with("state.json"));
        let socket = default_socket_path();
        let name = socket.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("vproc") && name.ends_with(".sock"));
    }

    #[test]
    fn test_builders() {
        let config = Config::default()
            .with_state_path("/tmp/s.json")
            .with_socket_path("/tmp/s.sock")
            .with_check_timeout(Duration::from_millis(250));
        assert_eq!(config.state_path, PathBuf::from("/tmp/s.json"));
        assert_eq!(config.socket(), "/tmp/s.sock");
        assert_eq!(config.check_timeout, Duration::from_millis(250));
    }
}
