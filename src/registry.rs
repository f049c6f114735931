//! Machine registry.
//!
//! Owns every [`Machine`] and keeps three indices mutually consistent:
//!
//! ```text
//!   machines      name ──────────▶ Arc<Machine>   (owning, insertion ordered)
//!   by_leader     ProcessHandle ─▶ Weak<Machine>
//!   by_unit       unit name ─────▶ Weak<Machine>
//! ```
//!
//! Every mutation either updates all affected indices or none of them.
//! Callers serialize access through the manager's lock; the registry itself
//! is a plain data structure.

use crate::error::{Error, Result};
use crate::machine::Machine;
use crate::process::{ProcFs, ProcessHandle};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Registry of machines with name, leader and unit indices.
#[derive(Debug)]
pub struct MachineRegistry {
    machines: HashMap<String, Arc<Machine>>,
    order: Vec<String>,
    by_leader: HashMap<ProcessHandle, Weak<Machine>>,
    by_unit: HashMap<String, Weak<Machine>>,
    capacity: usize,
}

impl MachineRegistry {
    /// Creates an empty registry holding at most `capacity` machines.
    pub fn new(capacity: usize) -> Self {
        Self {
            machines: HashMap::new(),
            order: Vec::new(),
            by_leader: HashMap::new(),
            by_unit: HashMap::new(),
            capacity,
        }
    }

    /// Returns the number of registered machines.
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    /// Returns true if no machines are registered.
    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Iterates machines in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Machine>> {
        self.order.iter().filter_map(|name| self.machines.get(name))
    }

    /// Looks up a machine by name.
    pub fn get(&self, name: &str) -> Option<Arc<Machine>> {
        self.machines.get(name).cloned()
    }

    /// Returns true if `machine` is the entry currently registered under its name.
    pub fn contains(&self, machine: &Arc<Machine>) -> bool {
        self.machines
            .get(machine.name())
            .is_some_and(|m| Arc::ptr_eq(m, machine))
    }

    // =========================================================================
    // Creation and Removal
    // =========================================================================

    /// Gets or creates the machine called `name`.
    ///
    /// A new entry starts in state Opening with class Invalid and no leader
    /// or unit, so it is only present in the name index. Returns the entry
    /// and whether it was created by this call.
    pub fn add(&mut self, name: &str) -> Result<(Arc<Machine>, bool)> {
        if let Some(existing) = self.machines.get(name) {
            return Ok((Arc::clone(existing), false));
        }
        if self.machines.len() >= self.capacity {
            return Err(Error::TooManyMachines(self.capacity));
        }

        let machine = Arc::new(Machine::new(name));
        self.machines.insert(name.to_string(), Arc::clone(&machine));
        self.order.push(name.to_string());
        debug!(machine = %name, "Machine entry created");
        Ok((machine, true))
    }

    /// Removes `machine` from every index.
    ///
    /// Index entries pointing at a different machine are left alone. Returns
    /// false if `machine` was not the registered entry for its name.
    pub fn remove(&mut self, machine: &Arc<Machine>) -> bool {
        if !self.contains(machine) {
            return false;
        }
        self.unlink_leader(machine);
        self.unlink_unit(machine);
        self.machines.remove(machine.name());
        self.order.retain(|n| n != machine.name());
        true
    }

    // =========================================================================
    // Leader and Unit Indices
    // =========================================================================

    /// Records `leader` as the leader of `machine` and indexes it.
    ///
    /// Fails with `LeaderInUse` if another live machine already has this
    /// leader; nothing is modified in that case.
    pub fn link_leader(&mut self, machine: &Arc<Machine>, leader: ProcessHandle) -> Result<()> {
        if let Some(owner) = self.by_leader.get(&leader).and_then(Weak::upgrade) {
            if Arc::ptr_eq(&owner, machine) {
                return Ok(());
            }
            return Err(Error::LeaderInUse {
                pid: leader.pid(),
                owner: owner.name().to_string(),
            });
        }
        self.unlink_leader(machine);
        self.by_leader.insert(leader, Arc::downgrade(machine));
        machine.details_mut().leader = Some(leader);
        Ok(())
    }

    /// Records `unit` as the owning unit of `machine` and indexes it.
    pub fn link_unit(&mut self, machine: &Arc<Machine>, unit: &str) -> Result<()> {
        if let Some(owner) = self.by_unit.get(unit).and_then(Weak::upgrade) {
            if Arc::ptr_eq(&owner, machine) {
                return Ok(());
            }
            return Err(Error::UnitInUse {
                unit: unit.to_string(),
                owner: owner.name().to_string(),
            });
        }
        self.unlink_unit(machine);
        self.by_unit.insert(unit.to_string(), Arc::downgrade(machine));
        machine.details_mut().unit = Some(unit.to_string());
        Ok(())
    }

    /// Drops the leader of `machine` from the leader index.
    pub fn unlink_leader(&mut self, machine: &Arc<Machine>) {
        let Some(leader) = machine.details_mut().leader.take() else {
            return;
        };
        let points_here = self
            .by_leader
            .get(&leader)
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(machine)));
        if points_here {
            self.by_leader.remove(&leader);
        }
    }

    /// Drops the unit of `machine` from the unit index.
    pub fn unlink_unit(&mut self, machine: &Arc<Machine>) {
        let Some(unit) = machine.details_mut().unit.take() else {
            return;
        };
        let points_here = self
            .by_unit
            .get(&unit)
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(machine)));
        if points_here {
            self.by_unit.remove(&unit);
        }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Looks up a machine by exact leader handle.
    pub fn find_by_leader(&self, leader: &ProcessHandle) -> Option<Arc<Machine>> {
        self.by_leader.get(leader).and_then(Weak::upgrade)
    }

    /// Looks up a machine by owning unit.
    pub fn find_by_unit(&self, unit: &str) -> Option<Arc<Machine>> {
        self.by_unit.get(unit).and_then(Weak::upgrade)
    }

    /// Resolves a host PID to a machine.
    ///
    /// First tries the PID as a leader, then the unit owning the PID, which
    /// covers processes running inside a machine. Failure to derive the unit
    /// degrades to "not found".
    pub fn find_by_pid(&self, procfs: &ProcFs, pid: i32) -> Option<Arc<Machine>> {
        if let Ok(handle) = procfs.handle(pid) {
            if let Some(machine) = self.find_by_leader(&handle) {
                return Some(machine);
            }
        }

        match procfs.unit_of(pid) {
            Ok(Some(unit)) => self.find_by_unit(&unit),
            Ok(None) => None,
            Err(e) => {
                warn!(pid, error = %e, "Failed to derive unit of process, ignoring");
                None
            }
        }
    }

    /// Finds the machine owning host UID `uid`.
    ///
    /// Returns the machine and the UID translated into the machine. Ranges
    /// are expected to be disjoint; the first match in registration order
    /// wins. A corrupt range aborts the scan with an error.
    pub fn find_by_host_uid(&self, uid: u32) -> Result<Option<(Arc<Machine>, u32)>> {
        self.find_by_host_id(|m| m.owns_uid(uid))
    }

    /// Finds the machine owning host GID `gid`.
    pub fn find_by_host_gid(&self, gid: u32) -> Result<Option<(Arc<Machine>, u32)>> {
        self.find_by_host_id(|m| m.owns_gid(gid))
    }

    fn find_by_host_id<F>(&self, owns: F) -> Result<Option<(Arc<Machine>, u32)>>
    where
        F: Fn(&Machine) -> Result<Option<u32>>,
    {
        for machine in self.iter() {
            if let Some(internal) = owns(machine)? {
                return Ok(Some((Arc::clone(machine), internal)));
            }
        }
        Ok(None)
    }
}
