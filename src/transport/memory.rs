//! In-memory transport for tests.
//!
//! [`MemoryProvider`] hands out [`MemoryTransport`] contexts that answer from
//! a scripted table instead of the network. The provider and every context
//! it created share the table, so answers can be scripted before or after a
//! query is submitted. Context allocations and releases are counted so that
//! tests can check nothing leaks.
//!
//! ```
//! use udns_core::transport::memory::MemoryProvider;
//! use udns_core::{Resolver, ResolverConfig};
//!
//! let provider = MemoryProvider::new();
//! provider.answer("example.test", ["10.0.0.1".parse().unwrap()], 300);
//!
//! let config = ResolverConfig::new().with_shared_context(false);
//! let resolver = Resolver::with_provider(&config, &provider).unwrap();
//! let query = resolver
//!     .submit_a4("example.test", |_, ()| {}, (), Default::default())
//!     .unwrap();
//! resolver.ioevent(None);
//! assert!(query.is_completed());
//! ```

use super::timeout::deadline_after;
use super::{A4Record, Completion, QueryFlags, Ticket, Transport, TransportProvider};
use crate::error::ErrorCode;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// First descriptor number handed out by [`MemoryTransport::open`]. These
/// are not real descriptors.
const FAKE_FD_BASE: RawFd = 1000;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
enum Script {
    Answer {
        cname: Option<String>,
        addrs: Vec<Ipv4Addr>,
        ttl: u32,
    },
    Fail(ErrorCode),
    Reject(ErrorCode),
}

#[derive(Default)]
struct Shared {
    allocated: Cell<usize>,
    released: Cell<usize>,
    fail_alloc: Cell<bool>,
    fail_init: Cell<bool>,
    fail_open: Cell<bool>,
    replay: Cell<bool>,
    timeout: Cell<Option<Duration>>,
    scripts: RefCell<HashMap<String, Script>>,
}

/// Allocates [`MemoryTransport`] contexts and scripts their answers.
///
/// Cloning shares the script table and the counters.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    shared: Rc<Shared>,
}

impl MemoryProvider {
    /// Creates a provider with an empty script table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `name` to `addrs` with the given TTL.
    pub fn answer(&self, name: &str, addrs: impl IntoIterator<Item = Ipv4Addr>, ttl: u32) {
        self.script(
            name,
            Script::Answer {
                cname: None,
                addrs: addrs.into_iter().collect(),
                ttl,
            },
        );
    }

    /// Resolves `name` through the alias `cname`.
    pub fn answer_via(
        &self,
        name: &str,
        cname: &str,
        addrs: impl IntoIterator<Item = Ipv4Addr>,
        ttl: u32,
    ) {
        self.script(
            name,
            Script::Answer {
                cname: Some(normalize(cname)),
                addrs: addrs.into_iter().collect(),
                ttl,
            },
        );
    }

    /// Fails queries for `name` with `code` on the next I/O event.
    pub fn fail(&self, name: &str, code: ErrorCode) {
        self.script(name, Script::Fail(code));
    }

    /// Rejects submissions for `name` with `code`.
    pub fn reject(&self, name: &str, code: ErrorCode) {
        self.script(name, Script::Reject(code));
    }

    /// Makes the next [`new_context`](TransportProvider::new_context) return
    /// `None`.
    pub fn fail_allocation(&self) {
        self.shared.fail_alloc.set(true);
    }

    /// Makes [`Transport::init`] fail on contexts.
    pub fn fail_init(&self) {
        self.shared.fail_init.set(true);
    }

    /// Makes [`Transport::open`] fail on contexts.
    pub fn fail_open(&self) {
        self.shared.fail_open.set(true);
    }

    /// Makes the next I/O event deliver the most recent completion again,
    /// as a misbehaving engine would.
    pub fn replay_last_completion(&self) {
        self.shared.replay.set(true);
    }

    /// How long a query waits before [`Transport::timeouts`] expires it.
    pub fn set_timeout(&self, timeout: Duration) {
        self.shared.timeout.set(Some(timeout));
    }

    /// Number of contexts handed out.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.shared.allocated.get()
    }

    /// Number of contexts dropped.
    #[must_use]
    pub fn released(&self) -> usize {
        self.shared.released.get()
    }

    /// Contexts handed out and not yet dropped.
    #[must_use]
    pub fn live_contexts(&self) -> usize {
        self.allocated() - self.released()
    }

    fn script(&self, name: &str, script: Script) {
        self.shared
            .scripts
            .borrow_mut()
            .insert(normalize(name), script);
    }
}

impl TransportProvider for MemoryProvider {
    fn new_context(&self) -> Option<Box<dyn Transport>> {
        if self.shared.fail_alloc.replace(false) {
            return None;
        }
        let serial = self.shared.allocated.get();
        self.shared.allocated.set(serial + 1);
        Some(Box::new(MemoryTransport {
            shared: Rc::clone(&self.shared),
            serial,
            fd: None,
            pending: Vec::new(),
            next_ticket: 1,
            status: None,
            last_delivered: None,
        }))
    }
}

struct PendingQuery {
    ticket: Ticket,
    name: String,
    deadline: Instant,
}

/// A scripted transport context. See the [module docs](self).
pub struct MemoryTransport {
    shared: Rc<Shared>,
    serial: usize,
    fd: Option<RawFd>,
    /// In submission order.
    pending: Vec<PendingQuery>,
    next_ticket: u64,
    status: Option<ErrorCode>,
    last_delivered: Option<Ticket>,
}

impl MemoryTransport {
    fn finish(&mut self, ticket: Ticket, result: Result<A4Record, ErrorCode>, done: &mut Vec<Completion>) {
        self.status = result.as_ref().err().copied();
        self.last_delivered = Some(ticket);
        done.push(Completion { ticket, result });
    }

    fn replay(&mut self, done: &mut Vec<Completion>) {
        if self.shared.replay.replace(false) {
            if let Some(ticket) = self.last_delivered {
                done.push(Completion {
                    ticket,
                    result: Err(ErrorCode::TemporaryFailure),
                });
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn init(&mut self) -> io::Result<()> {
        if self.shared.fail_init.get() {
            return Err(io::Error::other("scripted init failure"));
        }
        Ok(())
    }

    fn open(&mut self) -> io::Result<RawFd> {
        if let Some(fd) = self.fd {
            return Ok(fd);
        }
        if self.shared.fail_open.get() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "scripted socket failure",
            ));
        }
        let fd = FAKE_FD_BASE + RawFd::try_from(self.serial).unwrap_or(0);
        self.fd = Some(fd);
        Ok(fd)
    }

    fn close(&mut self) {
        self.fd = None;
    }

    fn sock(&self) -> Option<RawFd> {
        self.fd
    }

    fn active(&self) -> usize {
        self.pending.len()
    }

    fn status(&self) -> Option<ErrorCode> {
        self.status
    }

    fn submit_a4(&mut self, name: &str, _flags: QueryFlags) -> Result<Ticket, ErrorCode> {
        if self.fd.is_none() {
            self.status = Some(ErrorCode::TemporaryFailure);
            return Err(ErrorCode::TemporaryFailure);
        }
        let name = normalize(name);
        if let Some(Script::Reject(code)) = self.shared.scripts.borrow().get(&name) {
            self.status = Some(*code);
            return Err(*code);
        }
        let ticket = Ticket::new(self.next_ticket);
        self.next_ticket += 1;
        let timeout = self.shared.timeout.get().unwrap_or(DEFAULT_TIMEOUT);
        self.pending.push(PendingQuery {
            ticket,
            name,
            deadline: deadline_after(Instant::now(), timeout),
        });
        Ok(ticket)
    }

    fn cancel(&mut self, ticket: Ticket) {
        self.pending.retain(|q| q.ticket != ticket);
    }

    fn ioevent(&mut self, _now: Option<Instant>, done: &mut Vec<Completion>) {
        if self.fd.is_none() {
            return;
        }
        self.replay(done);

        let scripts = self.shared.scripts.borrow().clone();
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|q| {
                matches!(
                    scripts.get(&q.name),
                    Some(Script::Answer { .. } | Script::Fail(_))
                )
            });
        self.pending = waiting;

        for query in ready {
            let result = match scripts.get(&query.name) {
                Some(Script::Answer { addrs, .. }) if addrs.is_empty() => Err(ErrorCode::NoData),
                Some(Script::Answer { cname, addrs, ttl }) => Ok(A4Record {
                    cname: cname.clone().unwrap_or_else(|| query.name.clone()),
                    qname: query.name,
                    ttl: *ttl,
                    addrs: addrs.clone(),
                }),
                Some(Script::Fail(code)) => Err(*code),
                _ => continue,
            };
            self.finish(query.ticket, result, done);
        }
    }

    fn timeouts(
        &mut self,
        max_wait: Duration,
        now: Option<Instant>,
        done: &mut Vec<Completion>,
    ) -> Duration {
        let now = now.unwrap_or_else(Instant::now);
        self.replay(done);

        let (expired, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|q| q.deadline <= now);
        self.pending = waiting;
        for query in expired {
            self.finish(query.ticket, Err(ErrorCode::TemporaryFailure), done);
        }

        self.pending
            .iter()
            .map(|q| q.deadline.saturating_duration_since(now))
            .min()
            .map_or(max_wait, |wait| wait.min(max_wait))
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.shared.released.set(self.shared.released.get() + 1);
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}
