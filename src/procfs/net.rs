//! Socket inode to listening-port resolution
//!
//! Listening sockets come from `net/tcp` and `net/tcp6`. A process holds a
//! socket when one of its `fd/*` links reads `socket:[<inode>]`, so both
//! directions of the lookup join on the inode.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::{ProcError, Procfs};

const TCP_TABLES: &[&str] = &["net/tcp", "net/tcp6"];

/// `st` column value for TCP_LISTEN
const TCP_LISTEN: &str = "0A";

/// One LISTEN row of a TCP table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Listener {
    pub port: u16,
    pub inode: u64,
}

/// Parse the LISTEN rows of a `net/tcp`-format table (header skipped)
pub fn parse_listeners(content: &str) -> Vec<Listener> {
    content.lines().skip(1).filter_map(parse_row).collect()
}

fn parse_row(line: &str) -> Option<Listener> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 || fields[3] != TCP_LISTEN {
        return None;
    }

    // local_address is HEXADDR:HEXPORT; IPv6 addresses contain no colon
    let (_, port_hex) = fields[1].rsplit_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let inode = fields[9].parse().ok()?;

    Some(Listener { port, inode })
}

/// Extract the inode from an fd link target like `socket:[12345]`
pub fn parse_socket_link(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Listening sockets keyed by inode, loaded once and shared across lookups
#[derive(Debug, Clone, Default)]
pub struct ListenTable {
    by_inode: HashMap<u64, u16>,
}

impl ListenTable {
    /// Read both TCP tables; an unreadable table contributes nothing
    pub fn load(procfs: &Procfs) -> Self {
        let mut table = Self::default();
        for name in TCP_TABLES {
            let path = procfs.root().join(name);
            match std::fs::read_to_string(&path) {
                Ok(content) => table.extend(parse_listeners(&content)),
                Err(e) => log::debug!("Cannot read {}: {}", path.display(), e),
            }
        }
        table
    }

    pub fn extend(&mut self, listeners: impl IntoIterator<Item = Listener>) {
        for l in listeners {
            self.by_inode.insert(l.inode, l.port);
        }
    }

    pub fn port(&self, inode: u64) -> Option<u16> {
        self.by_inode.get(&inode).copied()
    }

    pub fn inodes_for_port(&self, port: u16) -> impl Iterator<Item = u64> + '_ {
        self.by_inode
            .iter()
            .filter(move |(_, p)| **p == port)
            .map(|(inode, _)| *inode)
    }

    pub fn is_empty(&self) -> bool {
        self.by_inode.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_inode.len()
    }
}

/// Socket inodes referenced by a process's open file descriptors
pub fn socket_inodes(procfs: &Procfs, pid: u32) -> Result<HashSet<u64>, ProcError> {
    let fd_dir = procfs.pid_dir(pid).join("fd");
    let mut inodes = HashSet::new();

    for entry in std::fs::read_dir(&fd_dir)?.flatten() {
        let Ok(target) = std::fs::read_link(entry.path()) else {
            continue;
        };
        if let Some(inode) = target.to_str().and_then(parse_socket_link) {
            inodes.insert(inode);
        }
    }

    Ok(inodes)
}

/// Ports a process listens on, resolved against a preloaded table.
/// An unreadable fd directory (other user's process) yields no ports.
pub fn ports_with(procfs: &Procfs, pid: u32, listeners: &ListenTable) -> BTreeSet<u16> {
    if listeners.is_empty() {
        return BTreeSet::new();
    }

    match socket_inodes(procfs, pid) {
        Ok(inodes) => inodes.iter().filter_map(|i| listeners.port(*i)).collect(),
        Err(e) => {
            log::debug!("Cannot list fds of PID {}: {}", pid, e);
            BTreeSet::new()
        }
    }
}

/// Ports a process listens on
pub fn ports_for_process(procfs: &Procfs, pid: u32) -> BTreeSet<u16> {
    ports_with(procfs, pid, &ListenTable::load(procfs))
}

/// Inode -> owning PIDs, built with a single walk over every process's fds
#[derive(Debug, Default)]
pub struct InodeIndex {
    owners: HashMap<u64, BTreeSet<u32>>,
}

impl InodeIndex {
    /// Index every socket inode on the host
    pub fn build(procfs: &Procfs) -> Result<Self, ProcError> {
        Self::build_filtered(procfs, |_| true)
    }

    /// Index only the given inodes
    pub fn build_for(procfs: &Procfs, wanted: &HashSet<u64>) -> Result<Self, ProcError> {
        Self::build_filtered(procfs, |inode| wanted.contains(&inode))
    }

    fn build_filtered(procfs: &Procfs, keep: impl Fn(u64) -> bool) -> Result<Self, ProcError> {
        let mut index = Self::default();
        for pid in procfs.pids()? {
            // Processes exit mid-walk and other users' fds are unreadable
            let Ok(inodes) = socket_inodes(procfs, pid) else {
                continue;
            };
            for inode in inodes.into_iter().filter(|i| keep(*i)) {
                index.owners.entry(inode).or_default().insert(pid);
            }
        }
        Ok(index)
    }

    pub fn owners(&self, inode: u64) -> impl Iterator<Item = u32> + '_ {
        self.owners.get(&inode).into_iter().flatten().copied()
    }
}

/// PIDs holding a LISTEN socket on `port`
pub fn processes_on_port(procfs: &Procfs, port: u16) -> Result<BTreeSet<u32>, ProcError> {
    let listeners = ListenTable::load(procfs);
    let wanted: HashSet<u64> = listeners.inodes_for_port(port).collect();
    if wanted.is_empty() {
        return Ok(BTreeSet::new());
    }

    let index = InodeIndex::build_for(procfs, &wanted)?;
    Ok(wanted.iter().flat_map(|inode| index.owners(*inode)).collect())
}

#[cfg(test)]
mod tests {
    use super::super::testing::FakeProc;
    use super::*;

    const SAMPLE_TCP: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:0BB8 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 31337 1 0000000000000000 100 0 0 10 0
   1: 0100007F:9C40 0100007F:0BB8 01 00000000:00000000 00:00000000 00000000  1000        0 31338 1 0000000000000000 20 4 30 10 -1
   2: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 1234 1 0000000000000000 100 0 0 10 0
";

    const SAMPLE_TCP6: &str = "\
  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:1F90 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 5555 1 0000000000000000 100 0 0 10 0
";

    #[test]
    fn test_parse_listeners_only_listen_rows() {
        let rows = parse_listeners(SAMPLE_TCP);
        assert_eq!(
            rows,
            vec![
                Listener { port: 3000, inode: 31337 },
                Listener { port: 22, inode: 1234 },
            ]
        );
    }

    #[test]
    fn test_parse_listeners_ipv6() {
        let rows = parse_listeners(SAMPLE_TCP6);
        assert_eq!(rows, vec![Listener { port: 8080, inode: 5555 }]);
    }

    #[test]
    fn test_parse_listeners_short_rows_ignored() {
        assert!(parse_listeners("header\n 0: 0100007F:0BB8 0A\n").is_empty());
    }

    #[test]
    fn test_parse_socket_link() {
        assert_eq!(parse_socket_link("socket:[12345]"), Some(12345));
        assert_eq!(parse_socket_link("pipe:[12345]"), None);
        assert_eq!(parse_socket_link("/dev/null"), None);
        assert_eq!(parse_socket_link("socket:[abc]"), None);
    }

    #[test]
    fn test_ports_for_process() {
        let fake = FakeProc::new();
        fake.process(50, 1, "server", &["server"]);
        fake.socket(50, 3, 700).socket(50, 4, 701).socket(50, 5, 702);
        fake.file(50, 6, "/var/log/server.log");
        fake.listen(8080, 700);
        fake.listen6(8443, 701);
        fake.connected(40000, 702);

        let ports = ports_for_process(&fake.procfs(), 50);
        assert_eq!(ports.into_iter().collect::<Vec<_>>(), vec![8080, 8443]);
    }

    #[test]
    fn test_ports_for_process_deduplicated() {
        let fake = FakeProc::new();
        fake.process(51, 1, "dual", &["dual"]);
        fake.socket(51, 3, 800).socket(51, 4, 801);
        fake.listen(9000, 800);
        fake.listen6(9000, 801);

        let ports = ports_for_process(&fake.procfs(), 51);
        assert_eq!(ports.len(), 1);
        assert!(ports.contains(&9000));
    }

    #[test]
    fn test_processes_on_port() {
        let fake = FakeProc::new();
        fake.process(60, 1, "a", &["a"]).socket(60, 3, 900);
        fake.process(61, 60, "a-worker", &["a"]).socket(61, 3, 900);
        fake.process(62, 1, "b", &["b"]).socket(62, 3, 901);
        fake.listen(5000, 900);
        fake.listen(5001, 901);

        let procfs = fake.procfs();
        let pids: Vec<u32> = processes_on_port(&procfs, 5000).unwrap().into_iter().collect();
        assert_eq!(pids, vec![60, 61]);
        assert!(processes_on_port(&procfs, 5002).unwrap().is_empty());
    }

    #[test]
    fn test_inode_index_build() {
        let fake = FakeProc::new();
        fake.process(70, 1, "x", &["x"]).socket(70, 3, 1).socket(70, 4, 2);
        fake.process(71, 1, "y", &["y"]).socket(71, 3, 2);

        let index = InodeIndex::build(&fake.procfs()).unwrap();
        assert_eq!(index.owners(1).collect::<Vec<_>>(), vec![70]);
        assert_eq!(index.owners(2).collect::<Vec<_>>(), vec![70, 71]);
        assert_eq!(index.owners(3).count(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_ports_for_self_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let procfs = Procfs::new();
        assert!(ports_for_process(&procfs, std::process::id()).contains(&port));
        assert!(processes_on_port(&procfs, port)
            .unwrap()
            .contains(&std::process::id()));
    }
}
