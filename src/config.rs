//! Resolver and transport configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default per-attempt wait before a query is retransmitted.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(4);

/// Default number of sends per nameserver.
const DEFAULT_ATTEMPTS: u32 = 3;

/// Receive buffer size for replies.
const DEFAULT_MAX_RESPONSE_SIZE: usize = 4096;

/// Construction options for a [`Resolver`](crate::Resolver).
///
/// # Example
///
/// ```
/// use udns_core::ResolverConfig;
///
/// let config = ResolverConfig::new()
///     .with_shared_context(false)
///     .with_open_immediately(false);
///
/// assert!(!config.reuse_shared_context);
/// assert!(!config.open_immediately);
/// ```
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Use the thread's shared transport context instead of allocating a
    /// fresh one.
    pub reuse_shared_context: bool,

    /// Open the UDP socket during construction. Otherwise the caller must
    /// call [`Resolver::open`](crate::Resolver::open) before submitting.
    pub open_immediately: bool,

    /// Settings for the bundled UDP transport. Ignored when a custom
    /// provider is passed to
    /// [`Resolver::with_provider`](crate::Resolver::with_provider).
    pub udp: UdpConfig,
}

impl ResolverConfig {
    /// Creates a config that shares the thread's context and opens at once.
    #[must_use]
    pub fn new() -> Self {
        Self {
            reuse_shared_context: true,
            open_immediately: true,
            udp: UdpConfig::default(),
        }
    }

    /// Selects between the shared context and a private one.
    #[must_use]
    pub const fn with_shared_context(mut self, shared: bool) -> Self {
        self.reuse_shared_context = shared;
        self
    }

    /// Controls whether the socket is opened during construction.
    #[must_use]
    pub const fn with_open_immediately(mut self, open: bool) -> Self {
        self.open_immediately = open;
        self
    }

    /// Replaces the UDP transport settings.
    #[must_use]
    pub fn with_udp(mut self, udp: UdpConfig) -> Self {
        self.udp = udp;
        self
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Settings for [`UdpTransport`](crate::transport::udp::UdpTransport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpConfig {
    /// Nameservers, tried in order. Each retransmission moves to the next.
    pub nameservers: Vec<SocketAddr>,

    /// How long to wait for a reply before retransmitting.
    pub timeout: Duration,

    /// Sends per nameserver before the query fails.
    pub attempts: u32,

    /// Size of the receive buffer.
    pub max_response_size: usize,
}

impl UdpConfig {
    /// Creates a config for a single nameserver with default timing.
    #[must_use]
    pub fn new(nameserver: SocketAddr) -> Self {
        Self {
            nameservers: vec![nameserver],
            timeout: DEFAULT_TIMEOUT,
            attempts: DEFAULT_ATTEMPTS,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
        }
    }

    /// Appends another nameserver.
    #[must_use]
    pub fn with_nameserver(mut self, nameserver: SocketAddr) -> Self {
        self.nameservers.push(nameserver);
        self
    }

    /// Overrides the per-attempt timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the number of sends per nameserver.
    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Total number of sends a query gets before it fails.
    #[must_use]
    pub fn max_sends(&self) -> usize {
        self.nameservers.len() * self.attempts.max(1) as usize
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::LOCALHOST, 53)))
    }
}
