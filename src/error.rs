//! Error types for the machine registry.

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the machine registry.
///
/// Lookup misses are not errors: every `find_*` operation returns
/// `Ok(None)` when nothing matches.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// No machine with this name is registered.
    #[error("no such machine: {0}")]
    NoSuchMachine(String),

    /// A machine with this name is already running.
    #[error("machine already exists: {0}")]
    MachineExists(String),

    /// Machine name failed validation.
    #[error("invalid machine name '{name}': {reason}")]
    InvalidMachineName { name: String, reason: String },

    /// Another machine already has this leader process.
    #[error("leader process {pid} already belongs to machine '{owner}'")]
    LeaderInUse { pid: i32, owner: String },

    /// Another machine already owns this unit.
    #[error("unit '{unit}' already belongs to machine '{owner}'")]
    UnitInUse { unit: String, owner: String },

    /// Registry capacity reached.
    #[error("too many machines registered (limit {0})")]
    TooManyMachines(usize),

    /// A UID/GID mapping is malformed (shift + range overflows).
    #[error("invalid id range on machine '{machine}': shift {shift}, range {range}")]
    InvalidIdRange {
        machine: String,
        shift: u32,
        range: u32,
    },

    // =========================================================================
    // Address Resolution Errors
    // =========================================================================
    /// The machine shares the caller's network namespace.
    ///
    /// This is a topology fact rather than a fault; presentation layers
    /// check [`Error::is_topology`] to phrase it accordingly.
    #[error("machine '{0}' does not have a private network namespace")]
    NoPrivateNetwork(String),

    /// A record received from the namespace worker was malformed.
    #[error("malformed address record: {0}")]
    Framing(String),

    /// The namespace worker exited unsuccessfully.
    #[error("namespace worker exited abnormally: {0}")]
    WorkerFailed(String),

    /// Waiting for the namespace worker failed.
    #[error("failed to wait for namespace worker: {0}")]
    WorkerWait(#[source] nix::Error),

    /// Forking the namespace worker failed.
    #[error("failed to spawn namespace worker: {0}")]
    WorkerSpawn(#[source] nix::Error),

    /// Operation not supported for this machine class.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    // =========================================================================
    // OS Errors
    // =========================================================================
    /// System call failed.
    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration could not be parsed or is out of bounds.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the conventional errno for this error.
    ///
    /// Bus and varlink front ends report failures as errno values; the
    /// mapping keeps "abrupt worker shutdown" (`ESHUTDOWN`) and "no private
    /// network" (`ENONET`) distinct from plain I/O failure (`EIO`).
    pub fn errno(&self) -> i32 {
        match self {
            Self::NoSuchMachine(_) => libc::ENXIO,
            Self::MachineExists(_) => libc::EEXIST,
            Self::InvalidMachineName { .. } => libc::EINVAL,
            Self::LeaderInUse { .. } | Self::UnitInUse { .. } => libc::EBUSY,
            Self::TooManyMachines(_) => libc::E2BIG,
            Self::InvalidIdRange { .. } => libc::ERANGE,
            Self::NoPrivateNetwork(_) => libc::ENONET,
            Self::Framing(_) => libc::EIO,
            Self::WorkerFailed(_) => libc::ESHUTDOWN,
            Self::WorkerWait(_) => libc::ECHILD,
            Self::WorkerSpawn(_) => libc::ENOEXEC,
            Self::NotSupported(_) => libc::EOPNOTSUPP,
            Self::Sys(errno) => *errno as i32,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidConfig(_) => libc::EINVAL,
            Self::Internal(_) => libc::EPROTO,
        }
    }

    /// Returns true if this error describes machine topology, not a fault.
    pub fn is_topology(&self) -> bool {
        matches!(self, Self::NoPrivateNetwork(_))
    }
}
