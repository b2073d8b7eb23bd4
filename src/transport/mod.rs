//! The resolver-protocol engine seam.
//!
//! A [`Transport`] owns the socket and the table of in-flight requests. It
//! never calls back into resolver code: completions are appended to a
//! caller-supplied buffer during [`Transport::ioevent`] and
//! [`Transport::timeouts`] and dispatched by the resolver afterwards, once
//! the transport is no longer borrowed.
//!
//! Two implementations ship with the crate:
//!
//! * [`udp::UdpTransport`] talks to real nameservers over one non-blocking
//!   UDP socket.
//! * [`memory::MemoryTransport`] answers from a scripted table and counts
//!   context allocations, for tests.

use crate::error::ErrorCode;
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

pub mod memory;
pub(crate) mod timeout;
pub mod udp;

/// Opaque identifier for one outstanding request inside a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

impl Ticket {
    /// Wraps a transport-assigned ticket number.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw ticket number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-query behaviour flags. Bit values match udns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct QueryFlags(u32);

impl QueryFlags {
    /// Default behaviour.
    pub const NONE: Self = Self(0);
    /// Do not apply a search list. Accepted for compatibility; this crate
    /// never searches.
    pub const NO_SEARCH: Self = Self(0x0001_0000);
    /// Clear the recursion-desired bit.
    pub const NO_RECURSION: Self = Self(0x0002_0000);
    /// Ignore replies without the authoritative-answer bit.
    pub const AA_ONLY: Self = Self(0x0004_0000);

    /// Builds flags from their udns bit values. Unknown bits are kept.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// The udns bit values.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// `true` if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for QueryFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The result record of a successful IPv4 address query.
///
/// Ownership moves from the transport to the dispatcher, which decodes it
/// once and drops it before returning.
#[derive(Debug, PartialEq, Eq)]
pub struct A4Record {
    /// The name that was asked for.
    pub qname: String,
    /// The name the addresses belong to after following CNAMEs.
    pub cname: String,
    /// Smallest TTL among the address records, in seconds.
    pub ttl: u32,
    /// Addresses in the order the transport received them.
    pub addrs: Vec<Ipv4Addr>,
}

/// A finished request handed out by [`Transport::ioevent`] or
/// [`Transport::timeouts`].
#[derive(Debug)]
pub struct Completion {
    /// The ticket returned when the request was submitted.
    pub ticket: Ticket,
    /// The decoded answer, or why there is none.
    pub result: Result<A4Record, ErrorCode>,
}

/// One transport context: socket, pending-request table and nameservers.
///
/// Dropping the boxed transport releases the context.
pub trait Transport {
    /// Prepares the context for use. Called once, before anything else.
    ///
    /// # Errors
    ///
    /// Returns an error if the context cannot be configured.
    fn init(&mut self) -> io::Result<()>;

    /// Opens the non-blocking socket, or returns the already open one.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or bound.
    fn open(&mut self) -> io::Result<RawFd>;

    /// Closes the socket. Pending requests stay registered.
    fn close(&mut self);

    /// The socket descriptor, if open.
    fn sock(&self) -> Option<RawFd>;

    /// Number of outstanding requests.
    fn active(&self) -> usize;

    /// Outcome of the most recent finished or rejected request.
    fn status(&self) -> Option<ErrorCode>;

    /// Registers an IPv4 address query for `name`.
    ///
    /// # Errors
    ///
    /// Returns the code describing why the request was rejected. A rejected
    /// request never produces a [`Completion`].
    fn submit_a4(&mut self, name: &str, flags: QueryFlags) -> Result<Ticket, ErrorCode>;

    /// Abandons a request. No completion for `ticket` is produced afterwards.
    fn cancel(&mut self, ticket: Ticket);

    /// Processes whatever is readable on the socket.
    fn ioevent(&mut self, now: Option<Instant>, done: &mut Vec<Completion>);

    /// Retransmits or expires overdue requests and returns how long the
    /// caller may wait before calling again, capped at `max_wait`.
    fn timeouts(
        &mut self,
        max_wait: Duration,
        now: Option<Instant>,
        done: &mut Vec<Completion>,
    ) -> Duration;
}

/// Allocates transport contexts.
pub trait TransportProvider {
    /// Returns a fresh, uninitialised context, or `None` if one cannot be
    /// allocated.
    fn new_context(&self) -> Option<Box<dyn Transport>>;
}

/// Version string of the bundled UDP transport.
#[must_use]
pub const fn transport_version() -> &'static str {
    udp::VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine() {
        let flags = QueryFlags::NO_RECURSION | QueryFlags::AA_ONLY;
        assert!(flags.contains(QueryFlags::AA_ONLY));
        assert!(flags.contains(QueryFlags::NO_RECURSION));
        assert!(!flags.contains(QueryFlags::NO_SEARCH));
        assert!(QueryFlags::NONE.contains(QueryFlags::NONE));
        assert_eq!(QueryFlags::from_bits(0x0002_0000), QueryFlags::NO_RECURSION);
    }

    #[test]
    fn version_names_transport() {
        assert!(transport_version().starts_with("udns-core-udp/"));
    }
}
