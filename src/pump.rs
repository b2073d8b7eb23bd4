//! A minimal event pump.
//!
//! Real applications drive [`Resolver::ioevent`] and
//! [`Resolver::timeouts`] from their own event loop. This module is enough
//! for command-line tools and tests: it blocks in `poll(2)` on the resolver
//! socket until every query has finished.

use crate::error::{ResolverError, Result};
use crate::resolver::Resolver;
use crate::util::poll_readable;
use std::time::{Duration, Instant};

/// Pumps `resolver` until it has no active queries or `limit` has passed.
///
/// Each round waits at most `max_wait`, or less if the transport asks to
/// be called back sooner. With the socket closed, outstanding queries can
/// only expire, so the pump just sleeps between calls to
/// [`Resolver::timeouts`]. Returns `true` if the resolver went idle.
///
/// # Errors
///
/// Returns [`ResolverError::Poll`] if waiting on the socket fails.
pub fn run_until_idle(resolver: &Resolver, max_wait: Duration, limit: Duration) -> Result<bool> {
    let start = Instant::now();
    loop {
        let wait = resolver.timeouts(max_wait, None);
        if resolver.active_count() == 0 {
            return Ok(true);
        }
        let elapsed = start.elapsed();
        if elapsed >= limit {
            tracing::debug!(
                active = resolver.active_count(),
                "Event pump gave up with queries outstanding"
            );
            return Ok(false);
        }
        let wait = wait.min(limit - elapsed);

        // A callback may have closed or reopened the socket.
        match resolver.sock() {
            Some(fd) => {
                if poll_readable(fd, wait).map_err(ResolverError::Poll)? {
                    resolver.ioevent(None);
                }
            }
            None => std::thread::sleep(wait),
        }
    }
}
