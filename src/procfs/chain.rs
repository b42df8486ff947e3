//! Parent chain walking and launch-script detection
//!
//! ```text
//!   systemd (1)
//!     └─ sshd
//!         └─ bash            <- interactive shell
//!             └─ bun dev     <- launch script
//!                 └─ node    <- the process we looked at
//! ```

use std::collections::HashSet;

use super::{ListenTable, ProcError, ProcessInfo, Procfs};

/// Last-resort bound on chain length
pub const MAX_CHAIN_DEPTH: usize = 100;

const ROOT_PID: u32 = 1;

/// Interactive shells that mark the launch boundary
pub const SHELLS: &[&str] = &["sh", "bash", "zsh", "fish", "dash", "ksh", "tcsh", "csh"];

const INIT_NAMES: &[&str] = &["systemd", "init"];

/// Check if a process name or executable path is a known shell.
/// Login shells show up as `-bash`.
pub fn is_shell(name: &str) -> bool {
    let base = name.rsplit('/').next().unwrap_or(name);
    SHELLS.contains(&base.trim_start_matches('-'))
}

/// Follow parent links from `pid`, self first.
///
/// Stops at the root process, a parent of 0, a PID seen before, a PID
/// `lookup` cannot resolve, or after [`MAX_CHAIN_DEPTH`] entries.
pub fn walk_chain<F>(pid: u32, mut lookup: F) -> Vec<ProcessInfo>
where
    F: FnMut(u32) -> Option<ProcessInfo>,
{
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = pid;

    while current != 0 && chain.len() < MAX_CHAIN_DEPTH && seen.insert(current) {
        let Some(info) = lookup(current) else {
            break;
        };
        let parent = info.ppid;
        chain.push(info);

        if current == ROOT_PID {
            break;
        }
        current = parent;
    }

    chain
}

/// Read `pid` and all of its ancestors. Fails only if `pid` itself is gone.
pub fn parent_chain(procfs: &Procfs, pid: u32) -> Result<Vec<ProcessInfo>, ProcError> {
    let listeners = ListenTable::load(procfs);
    let mut first = Some(procfs.read_process_info_with(pid, &listeners)?);

    Ok(walk_chain(pid, |p| {
        if p == pid {
            first.take()
        } else {
            procfs.read_process_info_with(p, &listeners).ok()
        }
    }))
}

/// The first process whose parent is a shell: what the user actually typed.
///
/// Without a shell boundary, falls back to the outermost process that is
/// not init.
pub fn find_launch_script(chain: &[ProcessInfo]) -> Option<&ProcessInfo> {
    chain
        .windows(2)
        .find(|pair| {
            let parent = &pair[1];
            is_shell(&parent.name) || (!parent.exe.is_empty() && is_shell(&parent.exe))
        })
        .map(|pair| &pair[0])
        .or_else(|| {
            chain
                .iter()
                .rev()
                .find(|p| p.pid != ROOT_PID && !INIT_NAMES.contains(&p.name.as_str()))
        })
}

#[cfg(test)]
mod tests {
    use super::super::testing::FakeProc;
    use super::*;
    use std::collections::HashMap;

    fn info(pid: u32, ppid: u32, name: &str) -> ProcessInfo {
        ProcessInfo {
            pid,
            ppid,
            name: name.to_string(),
            cmdline: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_is_shell() {
        assert!(is_shell("bash"));
        assert!(is_shell("-zsh"));
        assert!(is_shell("/usr/bin/fish"));
        assert!(!is_shell("node"));
        assert!(!is_shell("bashful"));
        assert!(!is_shell(""));
    }

    #[test]
    fn test_parent_chain_to_root() {
        let fake = FakeProc::new();
        fake.process(1, 0, "systemd", &["/sbin/init"]);
        fake.process(300, 1, "sshd", &["sshd: alice"]);
        fake.process(400, 300, "bash", &["-bash"]);
        fake.process(500, 400, "bun", &["bun", "dev"]);
        fake.process(600, 500, "node", &["node", "server.js"]);

        let chain = parent_chain(&fake.procfs(), 600).unwrap();
        let pids: Vec<u32> = chain.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![600, 500, 400, 300, 1]);
    }

    #[test]
    fn test_parent_chain_missing_self() {
        let fake = FakeProc::new();
        assert!(matches!(
            parent_chain(&fake.procfs(), 999),
            Err(ProcError::NotFound(999))
        ));
    }

    #[test]
    fn test_parent_chain_stops_at_vanished_parent() {
        let fake = FakeProc::new();
        fake.process(700, 650, "orphan", &["orphan"]);

        let chain = parent_chain(&fake.procfs(), 700).unwrap();
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_walk_chain_cycle() {
        let table: HashMap<u32, ProcessInfo> =
            [(10, info(10, 11, "a")), (11, info(11, 12, "b")), (12, info(12, 10, "c"))]
                .into_iter()
                .collect();

        let chain = walk_chain(10, |p| table.get(&p).cloned());
        let pids: Vec<u32> = chain.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![10, 11, 12]);
    }

    #[test]
    fn test_walk_chain_depth_ceiling() {
        // Every PID n claims n+1 as parent, forever
        let chain = walk_chain(2, |p| Some(info(p, p + 1, "deep")));
        assert_eq!(chain.len(), MAX_CHAIN_DEPTH);
    }

    #[test]
    fn test_walk_chain_zero_parent() {
        let chain = walk_chain(5, |p| Some(info(p, 0, "kthreadd")));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_find_launch_script_shell_boundary() {
        let chain = vec![
            info(600, 500, "node"),
            info(500, 400, "bun"),
            info(400, 300, "bash"),
            info(300, 1, "sshd"),
            info(1, 0, "systemd"),
        ];
        assert_eq!(find_launch_script(&chain).map(|p| p.pid), Some(500));
    }

    #[test]
    fn test_find_launch_script_by_parent_exe() {
        let mut shell = info(400, 1, "renamed");
        shell.exe = "/bin/zsh".to_string();
        let chain = vec![info(500, 400, "make"), shell, info(1, 0, "init")];
        assert_eq!(find_launch_script(&chain).map(|p| p.pid), Some(500));
    }

    #[test]
    fn test_find_launch_script_fallback_outermost() {
        let chain = vec![
            info(900, 800, "worker"),
            info(800, 1, "supervisor"),
            info(1, 0, "systemd"),
        ];
        assert_eq!(find_launch_script(&chain).map(|p| p.pid), Some(800));
    }

    #[test]
    fn test_find_launch_script_only_init() {
        let chain = vec![info(1, 0, "systemd")];
        assert!(find_launch_script(&chain).is_none());
        assert!(find_launch_script(&[]).is_none());
    }
}
