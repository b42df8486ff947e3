//! Fake proc trees for tests

use std::os::unix::fs::symlink;
use std::path::PathBuf;

use super::Procfs;

const TCP_HEADER: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n";

/// A throwaway directory laid out like /proc
pub(crate) struct FakeProc {
    dir: tempfile::TempDir,
}

impl FakeProc {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("net")).unwrap();
        std::fs::write(dir.path().join("net/tcp"), TCP_HEADER).unwrap();
        std::fs::write(dir.path().join("net/tcp6"), TCP_HEADER).unwrap();
        Self { dir }
    }

    pub fn procfs(&self) -> Procfs {
        Procfs::at(self.dir.path())
    }

    fn pid_dir(&self, pid: u32) -> PathBuf {
        self.dir.path().join(pid.to_string())
    }

    pub fn process(&self, pid: u32, ppid: u32, name: &str, argv: &[&str]) -> &Self {
        self.write_process(pid, ppid, name, 'S', argv)
    }

    pub fn zombie(&self, pid: u32, ppid: u32, name: &str) -> &Self {
        self.write_process(pid, ppid, name, 'Z', &[])
    }

    fn write_process(&self, pid: u32, ppid: u32, name: &str, state: char, argv: &[&str]) -> &Self {
        let dir = self.pid_dir(pid);
        std::fs::create_dir_all(dir.join("fd")).unwrap();
        std::fs::write(
            dir.join("stat"),
            format!("{} ({}) {} {} {} {} 0 -1 4194304 0 0 0 0\n", pid, name, state, ppid, pid, pid),
        )
        .unwrap();

        let mut cmdline = argv.join("\0");
        if !argv.is_empty() {
            cmdline.push('\0');
        }
        std::fs::write(dir.join("cmdline"), cmdline).unwrap();
        self
    }

    pub fn exe(&self, pid: u32, target: &str) -> &Self {
        symlink(target, self.pid_dir(pid).join("exe")).unwrap();
        self
    }

    pub fn cwd(&self, pid: u32, target: &str) -> &Self {
        symlink(target, self.pid_dir(pid).join("cwd")).unwrap();
        self
    }

    pub fn environ(&self, pid: u32, vars: &[(&str, &str)]) -> &Self {
        let content: String = vars
            .iter()
            .map(|(k, v)| format!("{}={}\0", k, v))
            .collect();
        std::fs::write(self.pid_dir(pid).join("environ"), content).unwrap();
        self
    }

    /// Give the process an fd pointing at a socket inode
    pub fn socket(&self, pid: u32, fd: u32, inode: u64) -> &Self {
        symlink(
            format!("socket:[{}]", inode),
            self.pid_dir(pid).join("fd").join(fd.to_string()),
        )
        .unwrap();
        self
    }

    /// Give the process an fd pointing at a regular file
    pub fn file(&self, pid: u32, fd: u32, target: &str) -> &Self {
        symlink(target, self.pid_dir(pid).join("fd").join(fd.to_string())).unwrap();
        self
    }

    /// Add a LISTEN row on 0.0.0.0:port to net/tcp
    pub fn listen(&self, port: u16, inode: u64) -> &Self {
        self.tcp_row("net/tcp", &format!("00000000:{:04X}", port), "0A", inode)
    }

    /// Add a LISTEN row on [::]:port to net/tcp6
    pub fn listen6(&self, port: u16, inode: u64) -> &Self {
        self.tcp_row(
            "net/tcp6",
            &format!("00000000000000000000000000000000:{:04X}", port),
            "0A",
            inode,
        )
    }

    /// Add an ESTABLISHED row to net/tcp
    pub fn connected(&self, port: u16, inode: u64) -> &Self {
        self.tcp_row("net/tcp", &format!("0100007F:{:04X}", port), "01", inode)
    }

    fn tcp_row(&self, table: &str, local: &str, state: &str, inode: u64) -> &Self {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(self.dir.path().join(table))
            .unwrap();
        writeln!(
            file,
            "   0: {} 00000000:0000 {} 00000000:00000000 00:00000000 00000000  1000        0 {} 1 0000000000000000 100 0 0 10 0",
            local, state, inode
        )
        .unwrap();
        self
    }
}
