//! # Manager - Machine Registry Composition Root
//!
//! Wires the registry, the GC queue with its deferred scheduler, and the
//! namespace address resolver together, and exposes the operations that
//! front ends (bus, varlink, CLI) call.
//!
//! ## Data Flow
//!
//! ```text
//!   front end ──▶ Manager ──▶ MachineRegistry   (lookups, register, remove)
//!                    │
//!                    ├──────▶ GcQueue ──▶ DeferredGc ──▶ run_gc(true)
//!                    │
//!                    └──────▶ NamespaceAddressResolver (blocking)
//! ```
//!
//! ## GC Pass
//!
//! For each queued machine, FIFO:
//!
//! 1. pop, clear `in_gc_queue`
//! 2. if collectible and not Closing: stop it (may re-reference or re-enqueue)
//! 3. under the registry write lock, re-check; if still collectible,
//!    finalize and remove from every index
//!
//! Lookups take the registry read lock, so nothing can find and reference a
//! machine between the re-check and its removal.
//!
//! ## Thread Safety
//!
//! All state is behind `RwLock`/`Mutex`; the manager is `Send + Sync` and is
//! shared as `Arc<Manager>`. Locks are never held across a stopper call.

use crate::address::LocalAddress;
use crate::config::ManagerConfig;
use crate::constants::{validate_machine_name, HOST_LEADER_PID, HOST_MACHINE_NAME};
use crate::error::{Error, Result};
use crate::gc::{DeferredGc, GcDrain, GcQueue};
use crate::machine::{
    IdMapping, Machine, MachineClass, MachineInfo, MachineState, Timestamp,
};
use crate::process::{ProcFs, Signal};
use crate::registry::MachineRegistry;
use crate::resolver::NamespaceAddressResolver;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

// =============================================================================
// Stopper
// =============================================================================

/// Stops a machine's payload.
///
/// Called by the GC pass and by [`Manager::terminate`] after the machine has
/// been moved to Closing. Stopping may complete asynchronously; in that case
/// the implementation calls [`Manager::request_gc`] once it is done so that
/// the machine gets a second pass.
pub trait MachineStopper: Send + Sync {
    /// Initiates stopping `machine`.
    fn stop(&self, procfs: &ProcFs, machine: &Arc<Machine>) -> Result<()>;
}

/// Default stopper: sends SIGTERM to a live leader.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalStopper;

impl MachineStopper for SignalStopper {
    fn stop(&self, procfs: &ProcFs, machine: &Arc<Machine>) -> Result<()> {
        if let Some(leader) = machine.leader() {
            if procfs.signal(&leader, Signal::Term)? {
                debug!(machine = %machine.name(), pid = leader.pid(), "Sent SIGTERM to leader");
            }
        }
        Ok(())
    }
}

// =============================================================================
// Registration
// =============================================================================

/// Everything a collaborator supplies when registering a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineRegistration {
    /// Machine name.
    pub name: String,
    /// Machine class (container or vm).
    pub class: MachineClass,
    /// 128-bit machine ID.
    #[serde(default)]
    pub id: Option<Uuid>,
    /// Name of the registering software.
    #[serde(default)]
    pub service: Option<String>,
    /// Leader PID.
    #[serde(default)]
    pub leader: Option<i32>,
    /// Owning unit.
    #[serde(default)]
    pub unit: Option<String>,
    /// Root directory on the host.
    #[serde(default)]
    pub root_directory: Option<PathBuf>,
    /// AF_VSOCK CID.
    #[serde(default, rename = "vSockCid")]
    pub vsock_cid: Option<u32>,
    /// SSH address.
    #[serde(default)]
    pub ssh_address: Option<String>,
    /// Host UID range owned by the machine.
    #[serde(default)]
    pub uid_map: Option<IdMapping>,
    /// Host GID range owned by the machine.
    #[serde(default)]
    pub gid_map: Option<IdMapping>,
}

impl MachineRegistration {
    /// Starts a registration with only the required fields.
    pub fn new(name: impl Into<String>, class: MachineClass) -> Self {
        Self {
            name: name.into(),
            class,
            id: None,
            service: None,
            leader: None,
            unit: None,
            root_directory: None,
            vsock_cid: None,
            ssh_address: None,
            uid_map: None,
            gid_map: None,
        }
    }

    /// Sets the leader PID.
    #[must_use]
    pub fn with_leader(mut self, pid: i32) -> Self {
        self.leader = Some(pid);
        self
    }

    /// Sets the owning unit.
    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Sets the machine ID.
    #[must_use]
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the registering service.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Sets the UID mapping.
    #[must_use]
    pub fn with_uid_map(mut self, map: IdMapping) -> Self {
        self.uid_map = Some(map);
        self
    }

    /// Sets the GID mapping.
    #[must_use]
    pub fn with_gid_map(mut self, map: IdMapping) -> Self {
        self.gid_map = Some(map);
        self
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Machine registry composition root.
pub struct Manager {
    config: ManagerConfig,
    procfs: ProcFs,
    registry: RwLock<MachineRegistry>,
    gc_queue: Mutex<GcQueue>,
    deferred_gc: DeferredGc,
    resolver: NamespaceAddressResolver,
    stopper: Box<dyn MachineStopper>,
    this: Weak<Manager>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.config)
            .field("machines", &self.registry().len())
            .field("gc_queue", &self.queue().len())
            .finish()
    }
}

impl GcDrain for Manager {
    fn drain(&self) {
        self.run_gc(true);
    }
}

impl Manager {
    /// Creates a manager with the default [`SignalStopper`].
    pub fn new(config: ManagerConfig) -> Result<Arc<Self>> {
        Self::with_stopper(config, Box::new(SignalStopper))
    }

    /// Creates a manager with a custom stopper.
    pub fn with_stopper(
        config: ManagerConfig,
        stopper: Box<dyn MachineStopper>,
    ) -> Result<Arc<Self>> {
        if config.max_machines == 0 {
            return Err(Error::InvalidConfig(
                "maxMachines must be positive".to_string(),
            ));
        }
        let procfs = ProcFs::new(config.proc_root.clone());
        let manager = Arc::new_cyclic(|this| Self {
            registry: RwLock::new(MachineRegistry::new(config.max_machines)),
            gc_queue: Mutex::new(GcQueue::new()),
            deferred_gc: DeferredGc::new(),
            resolver: NamespaceAddressResolver::new(procfs.clone()),
            procfs,
            stopper,
            config,
            this: this.clone(),
        });

        if manager.config.register_host {
            manager.add_host_machine()?;
        }
        Ok(manager)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Returns the procfs accessor.
    pub fn procfs(&self) -> &ProcFs {
        &self.procfs
    }

    fn registry(&self) -> RwLockReadGuard<'_, MachineRegistry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, MachineRegistry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    fn queue(&self) -> MutexGuard<'_, GcQueue> {
        self.gc_queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn add_host_machine(&self) -> Result<()> {
        let mut registry = self.registry_mut();
        let (host, _) = registry.add(HOST_MACHINE_NAME)?;
        host.details_mut().class = MachineClass::Host;

        match self.procfs.handle(HOST_LEADER_PID) {
            Ok(leader) => registry.link_leader(&host, leader)?,
            Err(e) => warn!(error = %e, "Cannot fingerprint host leader, registering without one"),
        }

        let mut details = host.details_mut();
        details.state = MachineState::Running;
        details.timestamp = Some(Timestamp::now());
        Ok(())
    }

    // =========================================================================
    // Registry Operations
    // =========================================================================

    /// Looks up a machine by name.
    pub fn machine(&self, name: &str) -> Option<Arc<Machine>> {
        self.registry().get(name)
    }

    /// Returns the number of registered machines, including `.host`.
    pub fn machine_count(&self) -> usize {
        self.registry().len()
    }

    /// Resolves a host PID to the machine it leads or runs inside.
    pub fn find_machine_for_pid(&self, pid: i32) -> Option<Arc<Machine>> {
        self.registry().find_by_pid(&self.procfs, pid)
    }

    /// Gets or creates the machine called `name`.
    ///
    /// New entries start in state Opening with class Invalid; calling this
    /// twice with the same name returns the same entry.
    pub fn register_machine(&self, name: &str) -> Result<Arc<Machine>> {
        let (machine, created) = self.registry_mut().add(name)?;
        if created {
            debug!(machine = %name, "Machine added");
        }
        Ok(machine)
    }

    /// Finds the machine owning host UID `uid` and the UID inside it.
    pub fn find_machine_for_uid(&self, uid: u32) -> Result<Option<(Arc<Machine>, u32)>> {
        self.registry().find_by_host_uid(uid)
    }

    /// Finds the machine owning host GID `gid` and the GID inside it.
    pub fn find_machine_for_gid(&self, gid: u32) -> Result<Option<(Arc<Machine>, u32)>> {
        self.registry().find_by_host_gid(gid)
    }

    /// Registers a fully described machine and moves it to Running.
    ///
    /// Fails with `MachineExists` if a machine of this name already got past
    /// Opening. If linking the leader or unit fails, the registration is
    /// rolled back completely: a freshly created entry is removed, an
    /// existing Opening entry is left as it was.
    pub fn register(&self, registration: MachineRegistration) -> Result<Arc<Machine>> {
        let name = registration.name.as_str();
        validate_machine_name(name).map_err(|reason| Error::InvalidMachineName {
            name: name.to_string(),
            reason: reason.to_string(),
        })?;
        if name == HOST_MACHINE_NAME
            || !matches!(registration.class, MachineClass::Container | MachineClass::Vm)
        {
            return Err(Error::NotSupported(format!(
                "registering '{name}' as class {}",
                registration.class
            )));
        }

        let leader = registration
            .leader
            .map(|pid| self.procfs.handle(pid))
            .transpose()?;

        let mut registry = self.registry_mut();
        if let Some(existing) = registry.get(name) {
            if existing.state() != MachineState::Opening {
                return Err(Error::MachineExists(name.to_string()));
            }
        }
        let (machine, created) = registry.add(name)?;

        let linked = leader
            .map(|l| registry.link_leader(&machine, l))
            .transpose()
            .and_then(|_| {
                registration
                    .unit
                    .as_deref()
                    .map(|u| registry.link_unit(&machine, u))
                    .transpose()
            });
        if let Err(e) = linked {
            registry.unlink_leader(&machine);
            registry.unlink_unit(&machine);
            if created {
                registry.remove(&machine);
            }
            return Err(e);
        }

        {
            let mut details = machine.details_mut();
            details.class = registration.class;
            details.id = registration.id;
            details.service = registration.service;
            details.root_directory = registration.root_directory;
            details.vsock_cid = registration.vsock_cid;
            details.ssh_address = registration.ssh_address;
            details.uid_map = registration.uid_map;
            details.gid_map = registration.gid_map;
            details.timestamp = Some(Timestamp::now());
            details.state = MachineState::Running;
        }
        drop(registry);

        info!(
            machine = %machine.name(),
            class = %machine.class(),
            leader = ?machine.leader().map(|l| l.pid()),
            unit = ?machine.unit(),
            "New machine registered"
        );
        Ok(machine)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Lists all machines in registration order.
    pub fn list_machines(&self) -> Vec<MachineInfo> {
        self.registry().iter().map(|m| m.info()).collect()
    }

    /// Returns details of the machine called `name`.
    pub fn get_machine(&self, name: &str) -> Result<MachineInfo> {
        self.machine(name)
            .map(|m| m.info())
            .ok_or_else(|| Error::NoSuchMachine(name.to_string()))
    }

    /// Returns details of the machine `pid` belongs to.
    pub fn get_machine_by_pid(&self, pid: i32) -> Result<MachineInfo> {
        self.find_machine_for_pid(pid)
            .map(|m| m.info())
            .ok_or_else(|| Error::NoSuchMachine(format!("pid {pid}")))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Moves `machine` to Closing and invokes the stopper.
    ///
    /// Stop failures are logged; the machine stays Closing.
    pub fn stop_machine(&self, machine: &Arc<Machine>) {
        machine.set_state(MachineState::Closing);
        if let Err(e) = self.stopper.stop(&self.procfs, machine) {
            warn!(machine = %machine.name(), error = %e, "Failed to stop machine");
        }
    }

    /// Marks the machine Closing without stopping it and schedules GC.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let machine = self
            .machine(name)
            .ok_or_else(|| Error::NoSuchMachine(name.to_string()))?;
        if machine.class() == MachineClass::Host {
            return Err(Error::NotSupported("unregistering the host".to_string()));
        }
        machine.set_state(MachineState::Closing);
        info!(machine = %name, "Machine unregistered");
        self.request_gc(&machine);
        Ok(())
    }

    /// Stops the machine and schedules GC.
    pub fn terminate(&self, name: &str) -> Result<()> {
        let machine = self
            .machine(name)
            .ok_or_else(|| Error::NoSuchMachine(name.to_string()))?;
        if machine.class() == MachineClass::Host {
            return Err(Error::NotSupported("terminating the host".to_string()));
        }
        self.stop_machine(&machine);
        self.request_gc(&machine);
        Ok(())
    }

    /// Sends `signal` to the machine's leader.
    ///
    /// Returns false if the leader is unknown or no longer running.
    pub fn kill(&self, name: &str, signal: Signal) -> Result<bool> {
        let machine = self
            .machine(name)
            .ok_or_else(|| Error::NoSuchMachine(name.to_string()))?;
        match machine.leader() {
            Some(leader) => self.procfs.signal(&leader, signal),
            None => Ok(false),
        }
    }

    // =========================================================================
    // Garbage Collection
    // =========================================================================

    /// Queues `machine` for a collection decision.
    ///
    /// Idempotent while the machine is queued. Arms the deferred GC task
    /// unless `gc_on_idle` is disabled; an already queued machine re-arms
    /// it too, in case an earlier arm found no runtime.
    pub fn request_gc(&self, machine: &Arc<Machine>) {
        if self.queue().push(machine) {
            debug!(machine = %machine.name(), "Machine queued for GC");
        }
        if self.config.gc_on_idle {
            self.deferred_gc.arm(self.this.clone());
        }
    }

    /// Returns the number of queued GC entries.
    pub fn gc_queue_len(&self) -> usize {
        self.queue().len()
    }

    /// Returns true if `machine` is waiting in the GC queue.
    pub fn gc_queued(&self, machine: &Arc<Machine>) -> bool {
        self.queue().contains(machine)
    }

    /// Drains the GC queue synchronously.
    ///
    /// With `drop_not_started` false, machines still in Opening survive.
    /// Returns the number of machines freed.
    pub fn run_gc(&self, drop_not_started: bool) -> usize {
        let mut freed = 0;
        loop {
            // Pop under the lock, decide without it: the stopper may re-enter.
            let Some(machine) = self.queue().pop() else {
                break;
            };

            if machine.may_collect(&self.procfs, drop_not_started)
                && machine.state() != MachineState::Closing
            {
                debug!(machine = %machine.name(), "Stopping collectible machine");
                self.stop_machine(&machine);
            }

            let mut registry = self.registry_mut();
            if machine.may_collect(&self.procfs, drop_not_started) && registry.remove(&machine) {
                drop(registry);
                self.finalize(&machine);
                freed += 1;
            } else {
                debug!(machine = %machine.name(), "Machine still referenced, keeping");
            }
        }
        freed
    }

    fn finalize(&self, machine: &Arc<Machine>) {
        machine.set_state(MachineState::Closing);
        info!(machine = %machine.name(), "Machine removed");
    }

    // =========================================================================
    // Addresses
    // =========================================================================

    /// Returns the local addresses of `machine` as seen inside it.
    ///
    /// Blocks while a namespace worker runs.
    pub fn resolve_addresses(&self, machine: &Machine) -> Result<Vec<LocalAddress>> {
        self.resolver.resolve(machine)
    }

    /// Async wrapper around [`Manager::resolve_addresses`] that runs the
    /// blocking query on the blocking thread pool.
    pub async fn resolve_addresses_async(self: &Arc<Self>, name: &str) -> Result<Vec<LocalAddress>> {
        let machine = self
            .machine(name)
            .ok_or_else(|| Error::NoSuchMachine(name.to_string()))?;
        let manager = Arc::clone(self);
        tokio::task::spawn_blocking(move || manager.resolve_addresses(&machine))
            .await
            .map_err(|e| Error::Internal(format!("address query task failed: {e}")))?
    }
}
