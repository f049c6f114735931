//! Local addresses and the namespace worker record format.
//!
//! - `AddressFamily` / `LocalAddress`: one address as seen inside a machine
//! - `local_addresses()`: enumerates the calling process's network namespace
//! - `encode_record()` / `decode_record()`: the datagram framing used between
//!   the namespace worker and its parent
//!
//! ## Record Format
//!
//! ```text
//! ┌──────────────────────────┬──────────────────────────────────┐
//! │ family: C int, native    │ address: 4 (AF_INET) or          │
//! │ endian                   │          16 (AF_INET6) bytes     │
//! └──────────────────────────┴──────────────────────────────────┘
//! ```
//!
//! The worker and parent are the same binary on the same host, so native
//! endianness is safe. Records are never exposed outside the process pair.

use crate::constants::{FAMILY_TAG_SIZE, IPV4_ADDRESS_SIZE, IPV6_ADDRESS_SIZE, MAX_RECORD_SIZE};
use crate::error::{Error, Result};
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// =============================================================================
// Address Family
// =============================================================================

/// Address family of a local address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AddressFamily {
    /// `AF_INET`
    Inet,
    /// `AF_INET6`
    Inet6,
}

impl AddressFamily {
    /// Returns the `AF_*` constant.
    pub fn as_raw(self) -> libc::c_int {
        match self {
            Self::Inet => libc::AF_INET,
            Self::Inet6 => libc::AF_INET6,
        }
    }

    /// Parses an `AF_*` constant.
    pub fn from_raw(raw: libc::c_int) -> Option<Self> {
        match raw {
            libc::AF_INET => Some(Self::Inet),
            libc::AF_INET6 => Some(Self::Inet6),
            _ => None,
        }
    }

    /// Number of address bytes for this family.
    pub fn address_size(self) -> usize {
        match self {
            Self::Inet => IPV4_ADDRESS_SIZE,
            Self::Inet6 => IPV6_ADDRESS_SIZE,
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inet => write!(f, "inet"),
            Self::Inet6 => write!(f, "inet6"),
        }
    }
}

// =============================================================================
// Local Address
// =============================================================================

/// An address configured on an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalAddress {
    /// Address family.
    pub family: AddressFamily,
    /// The address.
    pub address: IpAddr,
}

impl LocalAddress {
    /// Wraps an IP address.
    pub fn new(address: IpAddr) -> Self {
        let family = match address {
            IpAddr::V4(_) => AddressFamily::Inet,
            IpAddr::V6(_) => AddressFamily::Inet6,
        };
        Self { family, address }
    }

    /// Builds an address from a family and its raw bytes.
    ///
    /// Returns `None` if `bytes` is not exactly the family's address size.
    pub fn from_bytes(family: AddressFamily, bytes: &[u8]) -> Option<Self> {
        let address = match family {
            AddressFamily::Inet => IpAddr::V4(Ipv4Addr::from(<[u8; 4]>::try_from(bytes).ok()?)),
            AddressFamily::Inet6 => {
                IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(bytes).ok()?))
            }
        };
        Some(Self { family, address })
    }

    /// Returns the raw address bytes (4 or 16).
    pub fn octets(&self) -> Vec<u8> {
        match self.address {
            IpAddr::V4(a) => a.octets().to_vec(),
            IpAddr::V6(a) => a.octets().to_vec(),
        }
    }
}

impl std::fmt::Display for LocalAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.family, self.address)
    }
}

// =============================================================================
// Enumeration
// =============================================================================

/// Enumerates the addresses of the current network namespace.
///
/// Loopback interfaces, interfaces that are down, and unspecified addresses
/// are skipped. The result is sorted and free of duplicates so that two
/// enumerations of the same namespace compare equal.
pub fn local_addresses() -> Result<Vec<LocalAddress>> {
    let mut out = Vec::new();
    for ifa in getifaddrs()? {
        if ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK)
            || !ifa.flags.contains(InterfaceFlags::IFF_UP)
        {
            continue;
        }
        let Some(storage) = ifa.address else {
            continue;
        };
        let address = if let Some(sin) = storage.as_sockaddr_in() {
            IpAddr::V4(sin.ip())
        } else if let Some(sin6) = storage.as_sockaddr_in6() {
            IpAddr::V6(sin6.ip())
        } else {
            continue;
        };
        if address.is_unspecified() {
            continue;
        }
        out.push(LocalAddress::new(address));
    }
    out.sort();
    out.dedup();
    Ok(out)
}

// =============================================================================
// Record Framing
// =============================================================================

/// An encoded record, sized for the largest family.
#[derive(Debug, Clone, Copy)]
pub struct Record {
    buf: [u8; MAX_RECORD_SIZE],
    len: usize,
}

impl Record {
    /// Returns the encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Encodes one address as a single record.
///
/// Does not allocate, so it is usable in a forked child.
pub fn encode_record(address: &LocalAddress) -> Record {
    let mut buf = [0u8; MAX_RECORD_SIZE];
    buf[..FAMILY_TAG_SIZE].copy_from_slice(&address.family.as_raw().to_ne_bytes());
    let len = match address.address {
        IpAddr::V4(a) => {
            buf[FAMILY_TAG_SIZE..FAMILY_TAG_SIZE + IPV4_ADDRESS_SIZE].copy_from_slice(&a.octets());
            FAMILY_TAG_SIZE + IPV4_ADDRESS_SIZE
        }
        IpAddr::V6(a) => {
            buf[FAMILY_TAG_SIZE..FAMILY_TAG_SIZE + IPV6_ADDRESS_SIZE].copy_from_slice(&a.octets());
            FAMILY_TAG_SIZE + IPV6_ADDRESS_SIZE
        }
    };
    Record { buf, len }
}

/// Decodes one received record.
///
/// The caller handles the zero-length end-of-stream case; any non-empty
/// datagram that is not exactly one well-formed record is a framing error.
pub fn decode_record(datagram: &[u8]) -> Result<LocalAddress> {
    if datagram.len() < FAMILY_TAG_SIZE {
        return Err(Error::Framing(format!(
            "record of {} bytes is shorter than the family tag",
            datagram.len()
        )));
    }
    let (tag, payload) = datagram.split_at(FAMILY_TAG_SIZE);
    let mut raw = [0u8; FAMILY_TAG_SIZE];
    raw.copy_from_slice(tag);
    let raw = libc::c_int::from_ne_bytes(raw);

    let family = AddressFamily::from_raw(raw)
        .ok_or_else(|| Error::Framing(format!("unknown address family {raw}")))?;
    if payload.len() != family.address_size() {
        return Err(Error::Framing(format!(
            "{family} record carries {} address bytes, expected {}",
            payload.len(),
            family.address_size()
        )));
    }
    LocalAddress::from_bytes(family, payload)
        .ok_or_else(|| Error::Internal("address size check mismatch".to_string()))
}
