//! # machined
//!
//! **Machine Registry and Lifecycle Manager**
//!
//! Tracks the containers and VMs running on a host (and the host itself) as
//! first-class entries, garbage-collects them once nothing references them,
//! and resolves the network addresses that live inside a machine's network
//! namespace.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                             machined                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                         Manager                             │    │
//! │  │  register → find_machine_for_{pid,uid,gid} → request_gc     │    │
//! │  │             resolve_addresses → run_gc                      │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                   MachineRegistry                         │      │
//! │  │  name → Machine │ leader handle → Machine │ unit → Machine│      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! │                              │                                      │
//! │  ┌──────────────────────┐    │    ┌──────────────────────────┐      │
//! │  │  GcQueue + DeferredGc│◄───┴───►│ NamespaceAddressResolver │      │
//! │  │  FIFO, idle drain    │         │ fork → setns → SEQPACKET │      │
//! │  └──────────────────────┘         └──────────────────────────┘      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │   ProcFs: start-time fingerprints │ cgroup units │ ns identity      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Machine Lifecycle
//!
//! ```text
//!   ┌─────────┐  add   ┌─────────┐ register ┌─────────┐  stop   ┌─────────┐
//!   │ (none)  │ ─────► │ Opening │ ───────► │ Running │ ──────► │ Closing │
//!   └─────────┘        └─────────┘          └─────────┘         └────┬────┘
//!                           │                                        │
//!                           │ run_gc(drop_not_started = true)        │ run_gc
//!                           ▼                                        ▼
//!                      ┌─────────┐                              ┌─────────┐
//!                      │  freed  │                              │  freed  │
//!                      └─────────┘                              └─────────┘
//! ```
//!
//! A machine is freed only by the GC pass, and only once it has no
//! outstanding references and its leader process is gone.
//!
//! # Process Identity
//!
//! Leaders are keyed by [`ProcessHandle`] (PID plus start time), never by
//! the raw PID, so a recycled PID cannot be mistaken for the original
//! leader.
//!
//! # Example
//!
//! ```rust,ignore
//! use machined::{Manager, ManagerConfig, MachineClass, MachineRegistration};
//!
//! #[tokio::main]
//! async fn main() -> machined::Result<()> {
//!     let manager = Manager::new(ManagerConfig::default())?;
//!     let machine = manager.register(
//!         MachineRegistration::new("web", MachineClass::Container)
//!             .with_leader(4242)
//!             .with_unit("machine-web.scope"),
//!     )?;
//!     for addr in manager.resolve_addresses_async("web").await? {
//!         println!("{addr}");
//!     }
//!     manager.request_gc(&machine);
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod config;
pub mod constants;
pub mod error;
pub mod gc;
pub mod machine;
pub mod manager;
pub mod process;
pub mod registry;
pub mod resolver;

// Re-exports
pub use address::{local_addresses, AddressFamily, LocalAddress};
pub use config::ManagerConfig;
pub use constants::*;
pub use error::{Error, Result};
pub use gc::{DeferredGc, GcQueue};
pub use machine::{IdMapping, Machine, MachineClass, MachineInfo, MachineRef, MachineState, Timestamp};
pub use manager::{MachineRegistration, MachineStopper, Manager, SignalStopper};
pub use process::{ProcFs, ProcessHandle, Signal};
pub use registry::MachineRegistry;
pub use resolver::NamespaceAddressResolver;
