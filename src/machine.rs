//! Machine entries.
//!
//! This module defines the registry entry types:
//! - `MachineClass`: Host, container, VM, or pending classification
//! - `MachineState`: Opening → Running → Closing
//! - `IdMapping`: host UID/GID range owned by a machine
//! - `Machine`: one registry entry
//! - `MachineRef`: RAII guard for an outstanding external reference
//! - `MachineInfo`: serializable snapshot for list/get queries
//!
//! ```text
//!   add(name)          register()          stop / unregister
//!   ─────────▶ Opening ──────────▶ Running ──────────────────▶ Closing ──▶ (freed by GC)
//! ```

use crate::error::{Error, Result};
use crate::process::{ProcFs, ProcessHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// Machine Class
// =============================================================================

/// Kind of machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineClass {
    /// The host itself.
    Host,
    /// An OS container sharing the host kernel.
    Container,
    /// A virtual machine.
    Vm,
    /// Placeholder until the registering collaborator classifies the entry.
    #[default]
    Invalid,
}

impl MachineClass {
    /// Parses from the class name used on the bus ("container", "vm", "host").
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "host" => Some(Self::Host),
            "container" => Some(Self::Container),
            "vm" => Some(Self::Vm),
            _ => None,
        }
    }
}

impl std::fmt::Display for MachineClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Container => write!(f, "container"),
            Self::Vm => write!(f, "vm"),
            Self::Invalid => write!(f, "invalid"),
        }
    }
}

// =============================================================================
// Machine State
// =============================================================================

/// Lifecycle state of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    /// Registered, setup not yet completed.
    #[default]
    Opening,
    /// Setup completed.
    Running,
    /// Being torn down.
    Closing,
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opening => write!(f, "opening"),
            Self::Running => write!(f, "running"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

// =============================================================================
// UID/GID Mapping
// =============================================================================

/// A contiguous host ID range owned by a machine.
///
/// Host IDs `shift .. shift + range` map to machine-internal IDs
/// `0 .. range`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    /// First host ID of the range.
    pub shift: u32,
    /// Number of IDs in the range.
    pub range: u32,
}

impl IdMapping {
    /// Creates a mapping.
    pub fn new(shift: u32, range: u32) -> Self {
        Self { shift, range }
    }

    /// Translates a host ID into the machine-internal ID.
    ///
    /// Returns `Ok(None)` when `host_id` is outside the range, and an error
    /// when the range itself is corrupt (overflows the ID space).
    pub fn translate(&self, machine: &str, host_id: u32) -> Result<Option<u32>> {
        let end = self
            .shift
            .checked_add(self.range)
            .ok_or_else(|| Error::InvalidIdRange {
                machine: machine.to_string(),
                shift: self.shift,
                range: self.range,
            })?;
        if (self.shift..end).contains(&host_id) {
            Ok(Some(host_id - self.shift))
        } else {
            Ok(None)
        }
    }
}

// =============================================================================
// Timestamp
// =============================================================================

/// Activation timestamp, taken on both clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Wall clock.
    pub realtime: DateTime<Utc>,
    /// `CLOCK_MONOTONIC`.
    pub monotonic: Duration,
}

impl Timestamp {
    /// Samples both clocks.
    pub fn now() -> Self {
        let monotonic = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
            .map(Duration::from)
            .unwrap_or_default();
        Self {
            realtime: Utc::now(),
            monotonic,
        }
    }
}

// =============================================================================
// Machine
// =============================================================================

/// Mutable description of a machine, guarded by the entry's lock.
#[derive(Debug, Clone, Default)]
pub(crate) struct MachineDetails {
    pub(crate) id: Option<Uuid>,
    pub(crate) class: MachineClass,
    pub(crate) state: MachineState,
    pub(crate) leader: Option<ProcessHandle>,
    pub(crate) unit: Option<String>,
    pub(crate) service: Option<String>,
    pub(crate) root_directory: Option<PathBuf>,
    pub(crate) vsock_cid: Option<u32>,
    pub(crate) ssh_address: Option<String>,
    pub(crate) uid_map: Option<IdMapping>,
    pub(crate) gid_map: Option<IdMapping>,
    pub(crate) timestamp: Option<Timestamp>,
}

/// One registry entry.
///
/// Owned by the registry; the leader and unit indices and the GC queue hold
/// only weak back-links. Identity fields are written by the registry and the
/// manager during registration; everything else reads them.
#[derive(Debug)]
pub struct Machine {
    name: String,
    details: RwLock<MachineDetails>,
    in_gc_queue: AtomicBool,
    references: AtomicUsize,
}

impl Machine {
    /// Creates an entry in state Opening with class Invalid.
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            details: RwLock::new(MachineDetails::default()),
            in_gc_queue: AtomicBool::new(false),
            references: AtomicUsize::new(0),
        }
    }

    pub(crate) fn details(&self) -> RwLockReadGuard<'_, MachineDetails> {
        self.details.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn details_mut(&self) -> RwLockWriteGuard<'_, MachineDetails> {
        self.details.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the machine name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the machine class.
    pub fn class(&self) -> MachineClass {
        self.details().class
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> MachineState {
        self.details().state
    }

    pub(crate) fn set_state(&self, state: MachineState) {
        self.details_mut().state = state;
    }

    /// Returns the leader process handle, if known.
    pub fn leader(&self) -> Option<ProcessHandle> {
        self.details().leader
    }

    /// Returns the owning unit, if known.
    pub fn unit(&self) -> Option<String> {
        self.details().unit.clone()
    }

    /// Returns the 128-bit machine ID, if one was supplied.
    pub fn id(&self) -> Option<Uuid> {
        self.details().id
    }

    /// Returns the UID mapping, if any.
    pub fn uid_map(&self) -> Option<IdMapping> {
        self.details().uid_map
    }

    /// Returns the GID mapping, if any.
    pub fn gid_map(&self) -> Option<IdMapping> {
        self.details().gid_map
    }

    /// Returns true if the entry is currently in the GC queue.
    pub fn in_gc_queue(&self) -> bool {
        self.in_gc_queue.load(Ordering::Acquire)
    }

    /// Sets the queue flag, returning its previous value.
    pub(crate) fn mark_queued(&self, queued: bool) -> bool {
        self.in_gc_queue.swap(queued, Ordering::AcqRel)
    }

    /// Returns the number of outstanding external references.
    pub fn references(&self) -> usize {
        self.references.load(Ordering::Acquire)
    }

    /// Takes an external reference, keeping the machine from being collected.
    pub fn acquire(self: &Arc<Self>) -> MachineRef {
        self.references.fetch_add(1, Ordering::AcqRel);
        MachineRef {
            machine: Arc::clone(self),
        }
    }

    /// Translates a host UID into this machine's UID space.
    ///
    /// Only containers own host ID ranges.
    pub fn owns_uid(&self, uid: u32) -> Result<Option<u32>> {
        let details = self.details();
        match (details.class, details.uid_map) {
            (MachineClass::Container, Some(map)) => map.translate(&self.name, uid),
            _ => Ok(None),
        }
    }

    /// Translates a host GID into this machine's GID space.
    pub fn owns_gid(&self, gid: u32) -> Result<Option<u32>> {
        let details = self.details();
        match (details.class, details.gid_map) {
            (MachineClass::Container, Some(map)) => map.translate(&self.name, gid),
            _ => Ok(None),
        }
    }

    /// Decides whether this machine may be collected now.
    ///
    /// True iff the machine is not the host, has no outstanding references,
    /// its leader is gone, and it either progressed past Opening or the
    /// caller allows dropping machines that never started.
    pub fn may_collect(&self, procfs: &ProcFs, drop_not_started: bool) -> bool {
        if self.references() > 0 {
            return false;
        }
        let details = self.details();
        if details.class == MachineClass::Host {
            return false;
        }
        if details.state == MachineState::Opening && !drop_not_started {
            return false;
        }
        match details.leader {
            Some(leader) => !procfs.is_alive(&leader),
            None => true,
        }
    }

    /// Returns a serializable snapshot.
    pub fn info(&self) -> MachineInfo {
        let d = self.details();
        MachineInfo {
            name: self.name.clone(),
            id: d.id,
            service: d.service.clone(),
            class: d.class,
            leader: d.leader.map(|h| h.pid()),
            root_directory: d.root_directory.clone(),
            unit: d.unit.clone(),
            timestamp: d.timestamp,
            vsock_cid: d.vsock_cid,
            ssh_address: d.ssh_address.clone(),
            state: d.state,
        }
    }
}

// =============================================================================
// Machine Reference
// =============================================================================

/// An outstanding external reference to a machine.
///
/// While any `MachineRef` is alive the machine is not collectible. Dropping
/// the last one does not schedule GC by itself; the holder calls
/// `Manager::request_gc` if collection should be retried.
#[derive(Debug)]
pub struct MachineRef {
    machine: Arc<Machine>,
}

impl MachineRef {
    /// Returns the referenced machine.
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }
}

impl Drop for MachineRef {
    fn drop(&mut self) {
        self.machine.references.fetch_sub(1, Ordering::AcqRel);
    }
}

// =============================================================================
// Machine Info
// =============================================================================

/// Snapshot of a machine for list/get queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineInfo {
    /// Machine name.
    pub name: String,
    /// 128-bit machine ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    /// Software that registered the machine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Machine class.
    pub class: MachineClass,
    /// Leader PID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader: Option<i32>,
    /// Root directory relative to the host file system.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_directory: Option<PathBuf>,
    /// Owning unit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Activation timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    /// AF_VSOCK CID.
    #[serde(rename = "vSockCid", skip_serializing_if = "Option::is_none")]
    pub vsock_cid: Option<u32>,
    /// SSH address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_address: Option<String>,
    /// Lifecycle state.
    pub state: MachineState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn empty_procfs() -> (TempDir, ProcFs) {
        let dir = TempDir::new().unwrap();
        let procfs = ProcFs::new(dir.path());
        (dir, procfs)
    }

    #[test]
    fn test_id_mapping_bounds() {
        let map = IdMapping::new(1000, 10);
        assert_eq!(map.translate("m", 999).unwrap(), None);
        assert_eq!(map.translate("m", 1000).unwrap(), Some(0));
        assert_eq!(map.translate("m", 1009).unwrap(), Some(9));
        assert_eq!(map.translate("m", 1010).unwrap(), None);
        assert!(IdMapping::new(u32::MAX, 1).translate("m", 0).is_err());
    }

    #[test]
    fn test_may_collect_respects_opening() {
        let (_dir, procfs) = empty_procfs();
        let machine = Machine::new("m");

        assert!(!machine.may_collect(&procfs, false));
        assert!(machine.may_collect(&procfs, true));

        machine.set_state(MachineState::Running);
        assert!(machine.may_collect(&procfs, false));
    }

    #[test]
    fn test_may_collect_never_host() {
        let (_dir, procfs) = empty_procfs();
        let machine = Machine::new(".host");
        machine.details_mut().class = MachineClass::Host;
        machine.set_state(MachineState::Running);

        assert!(!machine.may_collect(&procfs, true));
    }

    #[test]
    fn test_references_block_collection() {
        let (_dir, procfs) = empty_procfs();
        let machine = Arc::new(Machine::new("m"));
        machine.set_state(MachineState::Closing);

        let first = machine.acquire();
        let second = machine.acquire();
        assert_eq!(machine.references(), 2);
        assert!(!machine.may_collect(&procfs, true));

        drop(first);
        assert!(!machine.may_collect(&procfs, true));
        drop(second);
        assert!(machine.may_collect(&procfs, true));
    }

    #[test]
    fn test_dead_leader_is_collectible() {
        let (_dir, procfs) = empty_procfs();
        let machine = Machine::new("m");
        machine.set_state(MachineState::Running);
        machine.details_mut().leader = Some(ProcessHandle::new(4242, 1));

        assert!(machine.may_collect(&procfs, false));
    }

    #[test]
    fn test_only_containers_own_ids() {
        let machine = Machine::new("m");
        machine.details_mut().uid_map = Some(IdMapping::new(0, 100));
        assert_eq!(machine.owns_uid(5).unwrap(), None);

        machine.details_mut().class = MachineClass::Container;
        assert_eq!(machine.owns_uid(5).unwrap(), Some(5));
        assert_eq!(machine.owns_gid(5).unwrap(), None);
    }

    #[test]
    fn test_info_serialization() {
        let machine = Machine::new("vm1");
        {
            let mut d = machine.details_mut();
            d.class = MachineClass::Vm;
            d.vsock_cid = Some(3);
            d.state = MachineState::Running;
        }
        let json = serde_json::to_value(machine.info()).unwrap();

        assert_eq!(json["class"], "vm");
        assert_eq!(json["state"], "running");
        assert_eq!(json["vSockCid"], 3);
        assert!(json.get("leader").is_none());
    }
}
