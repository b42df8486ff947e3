//! Process spawning, signalling and liveness

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

use crate::procfs::Procfs;

/// Spawn a command in its own process group, detached from our stdin
pub fn spawn(command: &str, cwd: Option<&Path>) -> Result<Child, SpawnError> {
    let (program, args) = parse_command(command)?;

    let mut cmd = Command::new(&program);
    cmd.args(&args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    // New group led by the child, so stop can signal everything it forks
    cmd.process_group(0);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());

    cmd.spawn()
        .map_err(|e| SpawnError::Spawn(format!("{}: {}", program, e)))
}

/// Split a command line with shell word rules (no shell involved)
pub fn parse_command(cmd: &str) -> Result<(String, Vec<String>), SpawnError> {
    let parts = shlex::split(cmd).ok_or_else(|| SpawnError::InvalidCommand(cmd.to_string()))?;

    let Some((program, args)) = parts.split_first() else {
        return Err(SpawnError::InvalidCommand(cmd.to_string()));
    };

    Ok((program.clone(), args.to_vec()))
}

fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

/// What a null signal tells us about a PID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Exists and we may signal it
    Alive,
    /// Exists but belongs to someone else
    Denied,
    Gone,
}

impl Liveness {
    pub fn exists(self) -> bool {
        !matches!(self, Self::Gone)
    }
}

/// Probe a PID with signal 0. Never escalates.
pub fn probe(pid: u32) -> Liveness {
    let Some(pid) = to_pid(pid) else {
        return Liveness::Gone;
    };
    match kill(pid, None) {
        Ok(()) => Liveness::Alive,
        Err(Errno::EPERM) => Liveness::Denied,
        Err(_) => Liveness::Gone,
    }
}

/// Alive and not a zombie
pub fn is_alive(procfs: &Procfs, pid: u32) -> bool {
    probe(pid).exists() && !procfs.is_defunct(pid)
}

/// Signal the process group led by `pid`, or just `pid` if it leads none
pub fn signal_group(pid: u32, signal: Signal) -> Result<(), SpawnError> {
    let target = to_pid(pid).ok_or(SpawnError::Signal {
        pid,
        source: Errno::ESRCH,
    })?;

    match killpg(target, signal) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => kill(target, signal).map_err(|source| SpawnError::Signal { pid, source }),
        Err(source) => Err(SpawnError::Signal { pid, source }),
    }
}

fn group_exists(pid: u32) -> bool {
    to_pid(pid).is_some_and(|p| killpg(p, None).is_ok())
}

/// How a process went down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Was already gone before we signalled
    AlreadyExited,
    /// Exited within the grace period
    Graceful,
    /// Needed SIGKILL
    Killed,
}

/// SIGTERM the group, wait up to `grace` sampling every `poll`, then SIGKILL.
/// Group members that outlive the leader are killed too.
pub async fn terminate(
    procfs: &Procfs,
    pid: u32,
    grace: Duration,
    poll: Duration,
) -> Result<Termination, SpawnError> {
    if !is_alive(procfs, pid) {
        return Ok(Termination::AlreadyExited);
    }

    match signal_group(pid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(SpawnError::Signal { source: Errno::ESRCH, .. }) => {
            return Ok(Termination::AlreadyExited)
        }
        Err(e) => return Err(e),
    }

    if wait_gone(procfs, pid, grace, poll).await {
        if group_exists(pid) {
            log::debug!("Group {} outlived its leader, killing stragglers", pid);
            let _ = signal_group(pid, Signal::SIGKILL);
        }
        return Ok(Termination::Graceful);
    }

    log::warn!("PID {} still alive after {:?}, sending SIGKILL", pid, grace);
    match signal_group(pid, Signal::SIGKILL) {
        Ok(()) | Err(SpawnError::Signal { source: Errno::ESRCH, .. }) => {}
        Err(e) => return Err(e),
    }
    wait_gone(procfs, pid, grace, poll).await;
    Ok(Termination::Killed)
}

async fn wait_gone(procfs: &Procfs, pid: u32, limit: Duration, poll: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if !is_alive(procfs, pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

/// Collect an exit status if `pid` is our child and has exited.
/// Anything else (not our child, still running) is silently ignored.
pub fn reap(pid: u32) -> Option<WaitStatus> {
    let target = to_pid(pid)?;
    match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => None,
        Ok(status) => Some(status),
        Err(e) => {
            log::debug!("waitpid({}) : {}", pid, e);
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Invalid command: {0:?}")]
    InvalidCommand(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Failed to signal PID {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: Errno,
    },
}
