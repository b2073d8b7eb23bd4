//! # udns-core
//!
//! Callback-driven asynchronous DNS resolution over one non-blocking UDP
//! socket.
//!
//! A [`Resolver`] multiplexes any number of in-flight queries on a single
//! socket. It never blocks and never spawns threads: the caller's event
//! loop watches [`Resolver::sock`] and calls [`Resolver::ioevent`] when it
//! is readable and [`Resolver::timeouts`] when the returned wait elapses.
//! Results arrive through the callback given at submission, exactly once
//! per query, unless the query is canceled first.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use udns_core::{QueryFlags, Resolver, ResolverConfig, UdpConfig};
//!
//! let config = ResolverConfig::new()
//!     .with_udp(UdpConfig::new("192.0.2.53:53".parse()?));
//! let resolver = Resolver::new(&config)?;
//!
//! let query = resolver.submit_a4(
//!     "example.com",
//!     |addrs, tag| match addrs {
//!         Some(addrs) => println!("{tag}: {addrs:?}"),
//!         None => println!("{tag}: failed"),
//!     },
//!     "lookup-1",
//!     QueryFlags::NONE,
//! )?;
//!
//! // Drive I/O until everything is done.
//! udns_core::pump::run_until_idle(&resolver, Duration::from_secs(1), Duration::from_secs(10))?;
//! assert!(query.is_completed());
//! ```
//!
//! ## Transports
//!
//! The wire protocol lives behind the [`transport::Transport`] trait.
//! [`transport::udp`] is the real implementation; [`transport::memory`] is a
//! scripted stand-in for tests.
//!
//! ## Shared context
//!
//! By default resolvers on one thread share a single transport context, and
//! so a single socket. Pass `with_shared_context(false)` for a private one.
//! [`release_shared_context`] drops the thread's handle.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
mod dispatch;
pub mod error;
pub mod pump;
pub mod query;
pub mod resolver;
pub mod transport;
pub mod util;

pub use config::{ResolverConfig, UdpConfig};
pub use error::{
    BAD_QUERY, ErrorCode, NAME_NOT_FOUND, NO_DATA, OUT_OF_MEMORY, PROTOCOL_ERROR, ResolverError,
    Result, TEMPORARY_FAILURE,
};
pub use query::{Answer, Query, QueryPhase};
pub use resolver::{Resolver, release_shared_context};
pub use transport::{QueryFlags, transport_version};
