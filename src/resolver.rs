//! # Namespace Address Resolver
//!
//! Returns the local addresses of a machine as seen from inside it.
//!
//! ## Architecture
//!
//! ```text
//!   caller (host netns)                      worker (target netns)
//!   ───────────────────                      ─────────────────────
//!   open /proc/<leader>/ns/net
//!   socketpair(AF_UNIX, SOCK_SEQPACKET)
//!   fork ──────────────────────────────────▶ reset signals, PDEATHSIG=KILL
//!   close worker end                         setns(netns, CLONE_NEWNET)
//!                                            close parent end
//!                                            getifaddrs()
//!   recv ◀─────────── [family|addr] ──────── send (one record per datagram)
//!   recv ◀─────────── [family|addr] ──────── send
//!   recv → 0 (EOF) ◀────────────────────────  close, _exit(0)
//!   waitpid
//! ```
//!
//! The calling thread never changes namespace; all namespaced work happens
//! in the short-lived worker. The worker is killed with the parent, so an
//! abandoned query cannot leave a process attached to the target namespace.
//!
//! ## Blocking
//!
//! Resolution is synchronous: it blocks the caller for the lifetime of the
//! worker. Async callers go through `Manager::resolve_addresses_async`,
//! which moves the call onto the blocking pool.

use crate::address::{decode_record, encode_record, local_addresses, LocalAddress};
use crate::constants::{ADDRESS_WORKER_NAME, RECORD_RECV_BUFFER};
use crate::error::{Error, Result};
use crate::machine::{Machine, MachineClass};
use crate::process::ProcFs;
use nix::errno::Errno;
use nix::sched::{setns, CloneFlags};
use nix::sys::signal::{self, kill, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::socket::{recv, send, socketpair, AddressFamily, MsgFlags, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, getpid, getppid, ForkResult, Pid};
use std::os::fd::{AsRawFd, OwnedFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::debug;

/// Resolves machine addresses, crossing into container network namespaces.
#[derive(Debug, Clone, Default)]
pub struct NamespaceAddressResolver {
    procfs: ProcFs,
}

impl NamespaceAddressResolver {
    /// Creates a resolver that locates namespaces through `procfs`.
    pub fn new(procfs: ProcFs) -> Self {
        Self { procfs }
    }

    /// Returns the addresses configured inside `machine`.
    ///
    /// - Host: the caller's own addresses.
    /// - Container: enumerated by a worker inside the leader's network
    ///   namespace. Fails with [`Error::NoPrivateNetwork`] if the container
    ///   shares the caller's namespace.
    /// - Anything else: [`Error::NotSupported`].
    ///
    /// An empty list is a valid result.
    pub fn resolve(&self, machine: &Machine) -> Result<Vec<LocalAddress>> {
        match machine.class() {
            MachineClass::Host => local_addresses(),
            MachineClass::Container => self.resolve_container(machine),
            class @ (MachineClass::Vm | MachineClass::Invalid) => Err(Error::NotSupported(
                format!("address lookup for {class} machine '{}'", machine.name()),
            )),
        }
    }

    fn resolve_container(&self, machine: &Machine) -> Result<Vec<LocalAddress>> {
        let leader = machine.leader().ok_or_else(|| {
            Error::NotSupported(format!("machine '{}' has no leader process", machine.name()))
        })?;

        if self.procfs.same_net_namespace(leader.pid())? {
            return Err(Error::NoPrivateNetwork(machine.name().to_string()));
        }

        let netns = self.procfs.open_net_namespace(leader.pid())?;
        debug!(
            machine = %machine.name(),
            leader = leader.pid(),
            worker = ADDRESS_WORKER_NAME,
            "Querying addresses inside machine network namespace"
        );
        let (addresses, _) = run_worker(Some(netns), emit_local_addresses)?;
        Ok(addresses)
    }
}

// =============================================================================
// Worker Side
// =============================================================================

/// Worker body: enumerate and stream addresses.
///
/// Enumeration failure yields a failure exit without emitting anything.
fn emit_local_addresses(channel: &OwnedFd) -> bool {
    let Ok(addresses) = local_addresses() else {
        return false;
    };
    addresses
        .iter()
        .all(|a| send_datagram(channel, encode_record(a).as_bytes()))
}

/// Sends one datagram as a single write.
fn send_datagram(channel: &OwnedFd, datagram: &[u8]) -> bool {
    loop {
        match send(channel.as_raw_fd(), datagram, MsgFlags::MSG_NOSIGNAL) {
            Ok(n) => return n == datagram.len(),
            Err(Errno::EINTR) => continue,
            Err(_) => return false,
        }
    }
}

/// Puts every catchable signal back to its default disposition and unblocks all.
fn reset_signals() {
    for sig in Signal::iterator() {
        if matches!(sig, Signal::SIGKILL | Signal::SIGSTOP) {
            continue;
        }
        // SAFETY: installing SIG_DFL does not run any handler code.
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }
    let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
}

/// Runs in the forked child. Returns the exit status.
fn worker_main<F>(parent: Pid, netns: Option<OwnedFd>, channel: OwnedFd, work: F) -> i32
where
    F: FnOnce(&OwnedFd) -> bool,
{
    reset_signals();

    if nix::sys::prctl::set_pdeathsig(Signal::SIGKILL).is_err() {
        return libc::EXIT_FAILURE;
    }
    // The parent may have died between fork and prctl.
    if getppid() != parent {
        return libc::EXIT_FAILURE;
    }

    if let Some(ns) = netns {
        if setns(&ns, CloneFlags::CLONE_NEWNET).is_err() {
            return libc::EXIT_FAILURE;
        }
    }

    let ok = catch_unwind(AssertUnwindSafe(|| work(&channel))).unwrap_or(false);
    // Closing the endpoint is the end-of-stream marker.
    drop(channel);

    if ok {
        libc::EXIT_SUCCESS
    } else {
        libc::EXIT_FAILURE
    }
}

// =============================================================================
// Parent Side
// =============================================================================

/// A forked worker that is killed and reaped unless waited for explicitly.
struct Worker {
    pid: Pid,
    reaped: bool,
}

impl Worker {
    fn new(pid: Pid) -> Self {
        Self { pid, reaped: false }
    }

    /// Waits for the worker and checks its exit status.
    fn wait(mut self) -> Result<()> {
        let status = loop {
            match waitpid(self.pid, None) {
                Ok(status) => break status,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::WorkerWait(e)),
            }
        };
        self.reaped = true;

        match status {
            WaitStatus::Exited(_, 0) => Ok(()),
            WaitStatus::Exited(_, code) => Err(Error::WorkerFailed(format!(
                "{ADDRESS_WORKER_NAME} exited with status {code}"
            ))),
            WaitStatus::Signaled(_, sig, _) => Err(Error::WorkerFailed(format!(
                "{ADDRESS_WORKER_NAME} killed by signal {sig}"
            ))),
            other => Err(Error::WorkerFailed(format!(
                "{ADDRESS_WORKER_NAME} in unexpected state {other:?}"
            ))),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        let _ = kill(self.pid, Signal::SIGKILL);
        while let Err(Errno::EINTR) = waitpid(self.pid, None) {}
        debug!(pid = self.pid.as_raw(), "Killed abandoned namespace worker");
    }
}

/// Reads records until the worker closes its end.
fn receive_records(channel: &OwnedFd) -> Result<Vec<LocalAddress>> {
    let mut buf = [0u8; RECORD_RECV_BUFFER];
    let mut addresses = Vec::new();
    loop {
        let n = match recv(channel.as_raw_fd(), &mut buf, MsgFlags::empty()) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Ok(addresses);
        }
        addresses.push(decode_record(&buf[..n])?);
    }
}

/// Forks a worker running `work`, optionally inside `netns`, and collects
/// the records it sends.
///
/// Returns the addresses and the (already reaped) worker PID.
fn run_worker<F>(netns: Option<OwnedFd>, work: F) -> Result<(Vec<LocalAddress>, Pid)>
where
    F: FnOnce(&OwnedFd) -> bool,
{
    let (parent_end, worker_end) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?;
    let parent = getpid();

    // SAFETY: the child only resets signal state, joins a namespace, runs
    // `work` and leaves through `_exit`, never returning into the caller.
    match unsafe { fork() }.map_err(Error::WorkerSpawn)? {
        ForkResult::Child => {
            drop(parent_end);
            let code = worker_main(parent, netns, worker_end, work);
            // SAFETY: terminating the forked child without running the
            // parent's atexit handlers or destructors.
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => {
            drop(worker_end);
            drop(netns);
            let worker = Worker::new(child);
            debug!(pid = child.as_raw(), "Spawned namespace worker");

            let addresses = receive_records(&parent_end)?;
            drop(parent_end);
            worker.wait()?;

            debug!(
                pid = child.as_raw(),
                count = addresses.len(),
                "Namespace worker finished"
            );
            Ok((addresses, child))
        }
    }
}
