//! Shared fixtures for integration tests.
//!
//! `FakeProc` builds a synthetic procfs tree so lookups, liveness checks and
//! namespace identity can be driven deterministically.

#![allow(dead_code)]

use machined::{MachineStopper, Machine, ManagerConfig, ProcFs};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// A temporary procfs tree.
pub struct FakeProc {
    dir: TempDir,
}

impl FakeProc {
    /// Creates a tree with `self/ns/net`.
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("self/ns")).unwrap();
        fs::write(dir.path().join("self/ns/net"), b"host-netns").unwrap();
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Config pointing at this tree, without `.host` and without deferred GC.
    pub fn config(&self) -> ManagerConfig {
        ManagerConfig::default()
            .with_proc_root(self.path())
            .with_register_host(false)
            .with_gc_on_idle(false)
    }

    /// Creates (or replaces) process `pid` with the given start time and cgroup.
    pub fn spawn(&self, pid: i32, start_time: u64, cgroup: &str) {
        let dir = self.path().join(pid.to_string());
        fs::create_dir_all(dir.join("ns")).unwrap();

        let mut fields: Vec<String> = (4..=52).map(|_| "0".to_string()).collect();
        fields[22 - 4] = start_time.to_string();
        let stat = format!("{pid} (init (x)) S {}\n", fields.join(" "));
        fs::write(dir.join("stat"), stat).unwrap();
        fs::write(dir.join("cgroup"), format!("0::{cgroup}\n")).unwrap();
    }

    /// Gives `pid` its own network namespace entry.
    pub fn private_netns(&self, pid: i32) {
        fs::write(
            self.path().join(pid.to_string()).join("ns/net"),
            format!("netns-{pid}"),
        )
        .unwrap();
    }

    /// Makes `pid` share our network namespace.
    pub fn shared_netns(&self, pid: i32) {
        std::os::unix::fs::symlink(
            self.path().join("self/ns/net"),
            self.path().join(pid.to_string()).join("ns/net"),
        )
        .unwrap();
    }

    /// Removes process `pid`.
    pub fn exit(&self, pid: i32) {
        fs::remove_dir_all(self.path().join(pid.to_string())).unwrap();
    }
}

/// Stopper that only counts invocations.
#[derive(Default)]
pub struct CountingStopper {
    pub calls: Arc<AtomicUsize>,
}

impl MachineStopper for CountingStopper {
    fn stop(&self, _procfs: &ProcFs, _machine: &Arc<Machine>) -> machined::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Stopper that takes a reference on the machine it is asked to stop.
#[derive(Default)]
pub struct ReferencingStopper {
    pub held: Arc<Mutex<Vec<machined::MachineRef>>>,
    pub calls: Arc<AtomicUsize>,
}

impl MachineStopper for ReferencingStopper {
    fn stop(&self, _procfs: &ProcFs, machine: &Arc<Machine>) -> machined::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.held.lock().unwrap().push(machine.acquire());
        Ok(())
    }
}
