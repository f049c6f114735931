//! Process identity and procfs access.
//!
//! - `ProcessHandle`: PID plus start-time fingerprint, safe against PID reuse
//! - `ProcFs`: reads fingerprints, owning units and namespace identity
//! - `Signal`: signals deliverable to a machine leader
//!
//! All procfs access goes through a configurable root so that tests can
//! point the registry at a synthetic tree.

use crate::constants::{DEFAULT_PROC_ROOT, STAT_STARTTIME_FIELD};
use crate::error::Result;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

// =============================================================================
// Process Handle
// =============================================================================

/// A process identity that survives PID reuse.
///
/// Two handles are equal only if both the PID and the start time match, so a
/// recycled PID never hashes to the entry of the process that used to own it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessHandle {
    pid: i32,
    start_time: u64,
}

impl ProcessHandle {
    /// Creates a handle from a PID and a known start time.
    pub fn new(pid: i32, start_time: u64) -> Self {
        Self { pid, start_time }
    }

    /// Returns the PID.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Returns the start-time fingerprint (clock ticks since boot).
    pub fn start_time(&self) -> u64 {
        self.start_time
    }
}

impl std::fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pid, self.start_time)
    }
}

// =============================================================================
// Procfs
// =============================================================================

/// Accessor for a procfs tree.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_ROOT)
    }
}

impl ProcFs {
    /// Creates an accessor rooted at `root` (normally `/proc`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the procfs root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pid_path(&self, pid: i32, entry: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(entry)
    }

    /// Reads the start time of `pid` from its `stat` file.
    pub fn start_time(&self, pid: i32) -> io::Result<u64> {
        let stat = fs::read_to_string(self.pid_path(pid, "stat"))?;
        parse_start_time(&stat).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed stat file for pid {pid}"),
            )
        })
    }

    /// Builds a handle for a live process.
    pub fn handle(&self, pid: i32) -> io::Result<ProcessHandle> {
        Ok(ProcessHandle::new(pid, self.start_time(pid)?))
    }

    /// Returns true if the process behind `handle` is still the same process.
    pub fn is_alive(&self, handle: &ProcessHandle) -> bool {
        matches!(self.start_time(handle.pid), Ok(t) if t == handle.start_time)
    }

    /// Derives the owning unit of `pid` from its cgroup membership.
    ///
    /// Returns `Ok(None)` if the process is not inside a service or scope
    /// unit (e.g. it sits directly in a slice or the root cgroup).
    pub fn unit_of(&self, pid: i32) -> io::Result<Option<String>> {
        let content = fs::read_to_string(self.pid_path(pid, "cgroup"))?;
        let path = cgroup_path(&content).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("no usable cgroup hierarchy for pid {pid}"),
            )
        })?;
        Ok(unit_from_cgroup_path(path).map(str::to_string))
    }

    /// Returns true if `pid` lives in the same network namespace as us.
    pub fn same_net_namespace(&self, pid: i32) -> io::Result<bool> {
        let ours = fs::metadata(self.root.join("self").join("ns").join("net"))?;
        let theirs = fs::metadata(self.pid_path(pid, "ns/net"))?;
        Ok(ours.dev() == theirs.dev() && ours.ino() == theirs.ino())
    }

    /// Opens the network namespace of `pid`.
    ///
    /// Only the network namespace is opened; the worker that consumes this
    /// handle must not join any other namespace of the target.
    pub fn open_net_namespace(&self, pid: i32) -> io::Result<OwnedFd> {
        Ok(OwnedFd::from(File::open(self.pid_path(pid, "ns/net"))?))
    }

    /// Delivers `signal` to the process behind `handle`.
    ///
    /// Returns `Ok(false)` without signalling if the handle no longer matches
    /// a live process.
    pub fn signal(&self, handle: &ProcessHandle, signal: Signal) -> Result<bool> {
        if !self.is_alive(handle) {
            return Ok(false);
        }
        match kill(Pid::from_raw(handle.pid), signal.to_nix()) {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::ESRCH) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Extracts the start time from the contents of `/proc/<pid>/stat`.
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so fields are counted from the last `)`.
pub fn parse_start_time(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    // Field 3 (state) is the first token after the command name.
    rest.split_whitespace()
        .nth(STAT_STARTTIME_FIELD - 3)?
        .parse()
        .ok()
}

/// Picks the cgroup path out of `/proc/<pid>/cgroup`.
///
/// Prefers the unified (v2) hierarchy and falls back to the named systemd
/// hierarchy on legacy setups.
fn cgroup_path(content: &str) -> Option<&str> {
    let mut legacy = None;
    for line in content.lines() {
        let mut parts = line.splitn(3, ':');
        let (Some(id), Some(controllers), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if id == "0" && controllers.is_empty() {
            return Some(path);
        }
        if controllers == "name=systemd" {
            legacy = Some(path);
        }
    }
    legacy
}

/// Returns the first service or scope component of a cgroup path.
///
/// Slices are skipped; anything below the unit (e.g. a container's
/// `payload` sub-cgroup) belongs to that unit.
pub fn unit_from_cgroup_path(path: &str) -> Option<&str> {
    path.split('/')
        .filter(|c| !c.is_empty())
        .find(|c| !c.ends_with(".slice"))
        .filter(|c| c.ends_with(".service") || c.ends_with(".scope"))
}

// =============================================================================
// Signals
// =============================================================================

/// Signal to deliver to a machine leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    /// SIGTERM (graceful shutdown).
    Term,
    /// SIGKILL (force kill).
    Kill,
    /// SIGHUP (hangup).
    Hup,
    /// SIGINT (interrupt).
    Int,
    /// SIGUSR1.
    Usr1,
    /// SIGUSR2.
    Usr2,
}

impl Signal {
    /// Returns the signal number.
    pub fn as_i32(&self) -> i32 {
        self.to_nix() as i32
    }

    /// Converts to the `nix` signal type.
    pub fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal as S;
        match self {
            Self::Term => S::SIGTERM,
            Self::Kill => S::SIGKILL,
            Self::Hup => S::SIGHUP,
            Self::Int => S::SIGINT,
            Self::Usr1 => S::SIGUSR1,
            Self::Usr2 => S::SIGUSR2,
        }
    }

    /// Parses from signal name (e.g., "SIGTERM", "TERM", "15").
    pub fn from_str(s: &str) -> Option<Self> {
        let s = s.to_uppercase();
        let s = s.strip_prefix("SIG").unwrap_or(&s);
        match s {
            "TERM" | "15" => Some(Self::Term),
            "KILL" | "9" => Some(Self::Kill),
            "HUP" | "1" => Some(Self::Hup),
            "INT" | "2" => Some(Self::Int),
            "USR1" | "10" => Some(Self::Usr1),
            "USR2" | "12" => Some(Self::Usr2),
            _ => None,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Term => write!(f, "SIGTERM"),
            Self::Kill => write!(f, "SIGKILL"),
            Self::Hup => write!(f, "SIGHUP"),
            Self::Int => write!(f, "SIGINT"),
            Self::Usr1 => write!(f, "SIGUSR1"),
            Self::Usr2 => write!(f, "SIGUSR2"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cgroup_path_prefers_unified() {
        let content = "12:name=systemd:/legacy.scope\n0::/system.slice/foo.service\n";
        assert_eq!(cgroup_path(content), Some("/system.slice/foo.service"));
    }

    #[test]
    fn test_cgroup_path_legacy_fallback() {
        let content = "3:cpu,cpuacct:/\n1:name=systemd:/machine.slice/machine-a.scope\n";
        assert_eq!(cgroup_path(content), Some("/machine.slice/machine-a.scope"));
    }

    #[test]
    fn test_cgroup_path_none() {
        assert_eq!(cgroup_path("3:cpu:/\n"), None);
    }
}
