//! Shell-predicate execution for resource checks
//!
//! A check command exits 0 when the resource is free. Anything else,
//! including failing to run or running past the timeout, means taken.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Placeholder substituted with the (shell-quoted) candidate value
pub const VALUE_PLACEHOLDER: &str = "${value}";

/// Runs check commands through `sh -c` with a time limit
#[derive(Debug, Clone)]
pub struct ShellCheck {
    timeout: Duration,
}

impl ShellCheck {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Substitute `value` into a check template and run it
    pub async fn check(&self, template: &str, value: &str) -> bool {
        match render(template, value) {
            Some(command) => self.run(&command).await,
            None => {
                log::warn!("Refusing to check unquotable value {:?}", value);
                false
            }
        }
    }

    /// Run a shell predicate; true only on exit status 0.
    ///
    /// The shell leads its own process group so a timed-out check takes
    /// everything it started down with it.
    pub async fn run(&self, command: &str) -> bool {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn();

        let mut child = match child {
            Ok(c) => c,
            Err(e) => {
                log::warn!("Check command failed to start: {}: {}", command, e);
                return false;
            }
        };

        let pgid = child.id().and_then(|id| i32::try_from(id).ok()).map(Pid::from_raw);

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => {
                log::debug!("Check `{}` -> {}", command, status);
                status.success()
            }
            Ok(Err(e)) => {
                log::warn!("Check command error: {}: {}", command, e);
                false
            }
            Err(_) => {
                log::warn!("Check command timed out after {:?}: {}", self.timeout, command);
                if let Some(pgid) = pgid {
                    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                        log::debug!("killpg {} after check timeout: {}", pgid, e);
                    }
                }
                if let Err(e) = child.wait().await {
                    log::debug!("Reaping timed-out check: {}", e);
                }
                false
            }
        }
    }
}

/// Fill `${value}` with a shell-quoted value. None if the value cannot be
/// quoted (embedded NUL).
pub fn render(template: &str, value: &str) -> Option<String> {
    let quoted = shlex::try_quote(value).ok()?;
    Some(template.replace(VALUE_PLACEHOLDER, &quoted))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker() -> ShellCheck {
        ShellCheck::new(Duration::from_secs(5))
    }

    #[test]
    fn test_render_plain_value() {
        assert_eq!(
            render("nc -z localhost ${value} && exit 1 || exit 0", "3000").unwrap(),
            "nc -z localhost 3000 && exit 1 || exit 0"
        );
    }

    #[test]
    fn test_render_quotes_metacharacters() {
        let rendered = render("test -f ${value}", "a b; rm -rf /").unwrap();
        assert_ne!(rendered, "test -f a b; rm -rf /");
        assert!(rendered.starts_with("test -f '"));
    }

    #[test]
    fn test_render_rejects_nul() {
        assert!(render("test -f ${value}", "a\0b").is_none());
    }

    #[tokio::test]
    async fn test_run_exit_codes() {
        let c = checker();
        assert!(c.run("exit 0").await);
        assert!(!c.run("exit 1").await);
        assert!(!c.run("exit 42").await);
    }

    #[tokio::test]
    async fn test_check_value_reaches_command_intact() {
        let c = checker();
        assert!(c.check("test ${value} = 'a b'", "a b").await);
        assert!(!c.check("test ${value} = 'a b'", "a c").await);
    }

    #[tokio::test]
    async fn test_check_timeout_is_unavailable() {
        let c = ShellCheck::new(Duration::from_millis(100));
        let started = std::time::Instant::now();
        assert!(!c.run("sleep 5").await);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_check_timeout_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("bg.pid");
        let c = ShellCheck::new(Duration::from_millis(300));

        let command = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        assert!(!c.run(&command).await);

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let procfs = crate::procfs::Procfs::new();
        let mut gone = false;
        for _ in 0..40 {
            if !crate::manager::process::is_alive(&procfs, pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "background sleep {} survived the check timeout", pid);
    }
}
