//! Supervision tasks
//!
//! Every running instance has exactly one task watching it:
//!
//! - a reaper for processes we spawned, which owns the `Child` and waits on it
//! - a poller for adopted processes, which can only sample liveness
//!
//! Both are tied to a `CancellationToken` stored next to the instance. Stop,
//! remove and re-adoption cancel the token before touching the record, and a
//! task re-checks it under the state lock before every mutation, so a task
//! never writes to an instance it no longer owns.

use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::process;
use super::Shared;
use crate::procfs::Procfs;

/// Handle kept in the manager for each watched instance
#[derive(Debug, Clone)]
pub(super) struct Watch {
    pub token: CancellationToken,
    /// A reaper owns the child; nobody else may wait on it
    pub owns_child: bool,
}

/// Wait for a spawned child and settle its instance when it exits
pub(super) fn spawn_reaper(
    shared: Arc<Mutex<Shared>>,
    name: String,
    mut child: Child,
    token: CancellationToken,
) {
    let pid = child.id().unwrap_or(0);

    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                let reason = match status {
                    Ok(s) => s.to_string(),
                    Err(e) => format!("wait failed: {}", e),
                };
                let mut shared = shared.lock().await;
                if token.is_cancelled() {
                    log::debug!("{}: reaper superseded", name);
                    return;
                }
                shared.mark_exited(&name, pid, &reason);
            }
            _ = token.cancelled() => {
                // Stop took over; still collect the exit status
                if let Err(e) = child.wait().await {
                    log::debug!("{}: wait after stop: {}", name, e);
                }
            }
        }
    });
}

/// Poll an adopted process until it disappears
pub(super) fn spawn_poller(
    shared: Arc<Mutex<Shared>>,
    procfs: Procfs,
    name: String,
    pid: u32,
    interval: Duration,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            if process::is_alive(&procfs, pid) {
                continue;
            }

            let mut shared = shared.lock().await;
            if token.is_cancelled() {
                return;
            }
            shared.mark_exited(&name, pid, "no longer running");
            return;
        }
    });
}
