//! # Machine Registry Constants
//!
//! Defines the limits, well-known names and wire sizes used throughout the
//! registry. These constants are the **single source of truth** for bounds
//! that the registry, the GC pass and the address resolver share.
//!
//! ## Cross-References
//!
//! - [`crate::registry`]: Uses `MAX_MACHINES` for capacity checks
//! - [`crate::manager`]: Uses `HOST_MACHINE_NAME` and name validation
//! - [`crate::address`]: Uses the record sizes for framing
//! - [`crate::process`]: Uses `DEFAULT_PROC_ROOT`

// =============================================================================
// Registry Limits
// =============================================================================

/// Maximum number of machines tracked at once.
///
/// **Security**: Bounds registry memory. Registration is reachable from
/// unprivileged bus callers, so an unbounded map would be an easy
/// exhaustion target.
///
/// **Rationale**: Matches the order of magnitude of `MAX_CONTAINERS` in
/// container runtimes; hosts with more machines than this are not a
/// supported deployment.
pub const MAX_MACHINES: usize = 2048;

/// Maximum machine name length (`HOST_NAME_MAX`).
///
/// Machine names double as hostnames inside containers, so they follow
/// the kernel's hostname bound.
pub const MAX_MACHINE_NAME_LEN: usize = 64;

/// Name of the machine entry that represents the host itself.
///
/// The only valid name that starts with a dot.
pub const HOST_MACHINE_NAME: &str = ".host";

/// PID of the host machine's leader.
pub const HOST_LEADER_PID: i32 = 1;

// =============================================================================
// Procfs
// =============================================================================

/// Default procfs mount point.
///
/// Overridable through [`crate::config::ManagerConfig::proc_root`] so that
/// tests can supply a synthetic tree.
pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// Index (1-based) of the `starttime` field in `/proc/<pid>/stat`.
///
/// Reference: proc(5). The value is in clock ticks since boot and is
/// stable for the lifetime of a process.
pub const STAT_STARTTIME_FIELD: usize = 22;

// =============================================================================
// Address Record Framing
// =============================================================================
//
// One record per datagram:
//
//   ┌────────────────────┬──────────────────────────────┐
//   │ family (C int, NE) │ address (4 or 16 bytes)      │
//   └────────────────────┴──────────────────────────────┘
//
// The channel is SOCK_SEQPACKET so record boundaries are preserved and a
// record is delivered whole or not at all. End of stream is the peer
// closing its endpoint; there is no terminator record.
// =============================================================================

/// Size of the family tag at the head of every record (`sizeof(int)`).
pub const FAMILY_TAG_SIZE: usize = std::mem::size_of::<libc::c_int>();

/// Address payload size for `AF_INET`.
pub const IPV4_ADDRESS_SIZE: usize = 4;

/// Address payload size for `AF_INET6`.
pub const IPV6_ADDRESS_SIZE: usize = 16;

/// Largest well-formed record.
pub const MAX_RECORD_SIZE: usize = FAMILY_TAG_SIZE + IPV6_ADDRESS_SIZE;

/// Receive buffer size for the parent side of the channel.
///
/// Deliberately larger than [`MAX_RECORD_SIZE`] so an oversized record is
/// observed as a length mismatch instead of being silently truncated to a
/// plausible size.
pub const RECORD_RECV_BUFFER: usize = MAX_RECORD_SIZE + 16;

/// Description used in logs for the namespace worker.
pub const ADDRESS_WORKER_NAME: &str = "(sd-addrns)";

// =============================================================================
// Machine Name Validation
// =============================================================================

/// Valid characters for machine names.
///
/// Includes: `a-z`, `A-Z`, `0-9`, `-`, `_`, `.`
///
/// **Security**: Excludes `/` and whitespace; names are used to build unit
/// names and appear in hostnames.
pub const MACHINE_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";

/// Validates a machine name.
///
/// A valid name is [`HOST_MACHINE_NAME`], or a hostname-like string:
/// - non-empty and at most `MAX_MACHINE_NAME_LEN` bytes
/// - only characters from `MACHINE_NAME_VALID_CHARS`
/// - no leading or trailing `.`, and no empty label (`..`)
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[inline]
#[must_use = "validation result must be checked before registering a machine"]
pub fn validate_machine_name(name: &str) -> std::result::Result<(), &'static str> {
    if name == HOST_MACHINE_NAME {
        return Ok(());
    }
    if name.is_empty() {
        return Err("machine name cannot be empty");
    }
    if name.len() > MAX_MACHINE_NAME_LEN {
        return Err("machine name exceeds maximum length");
    }
    if !name.chars().all(|c| MACHINE_NAME_VALID_CHARS.contains(c)) {
        return Err("machine name contains invalid characters");
    }
    if name.starts_with('.') || name.ends_with('.') || name.contains("..") {
        return Err("machine name contains an empty label");
    }
    Ok(())
}
