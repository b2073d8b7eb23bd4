//! Query handles and their completion state machine.

use crate::error::ErrorCode;
use crate::resolver::ResolverInner;
use crate::transport::{A4Record, Ticket};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::net::Ipv4Addr;
use std::rc::{Rc, Weak};

/// Boxed caller callback, invoked at most once.
pub(crate) type Callback = Box<dyn FnOnce(Result<Answer, ErrorCode>)>;

/// Where a query is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    /// Submitted and waiting for the transport.
    Pending,
    /// The callback is running.
    Completing,
    /// Finished or canceled. Nothing further happens.
    Retired,
}

/// A decoded address answer, as handed to
/// [`submit_a4_with`](crate::Resolver::submit_a4_with) callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    /// The name that was asked for.
    pub qname: String,
    /// The name the addresses belong to after following aliases.
    pub cname: String,
    /// Smallest TTL among the records, in seconds.
    pub ttl: u32,
    /// Addresses in the order the transport delivered them.
    pub addresses: Vec<Ipv4Addr>,
}

impl Answer {
    /// Number of address records.
    #[must_use]
    pub fn count(&self) -> usize {
        self.addresses.len()
    }

    /// Addresses in dotted-quad form.
    #[must_use]
    pub fn address_strings(&self) -> Vec<String> {
        self.addresses.iter().map(ToString::to_string).collect()
    }
}

impl From<A4Record> for Answer {
    fn from(record: A4Record) -> Self {
        Self {
            qname: record.qname,
            cname: record.cname,
            ttl: record.ttl,
            addresses: record.addrs,
        }
    }
}

/// State shared by a [`Query`] handle and the context registry.
pub(crate) struct QueryState {
    owner: Weak<ResolverInner>,
    owner_id: u64,
    domain: String,
    ticket: Cell<Option<Ticket>>,
    phase: Cell<QueryPhase>,
    completed: Cell<bool>,
    callback: RefCell<Option<Callback>>,
}

impl QueryState {
    pub fn new(
        owner: Weak<ResolverInner>,
        owner_id: u64,
        domain: &str,
        ticket: Ticket,
        callback: Callback,
    ) -> Self {
        Self {
            owner,
            owner_id,
            domain: domain.to_string(),
            ticket: Cell::new(Some(ticket)),
            phase: Cell::new(QueryPhase::Pending),
            completed: Cell::new(false),
            callback: RefCell::new(Some(callback)),
        }
    }

    pub const fn owner_id(&self) -> u64 {
        self.owner_id
    }

    /// Runs the transport-fired path: `Pending -> Completing -> Retired`.
    pub fn complete(&self, result: Result<A4Record, ErrorCode>) {
        if self.phase.get() != QueryPhase::Pending {
            tracing::error!(
                domain = %self.domain,
                phase = ?self.phase.get(),
                "Completion for a query that is not pending, dropping"
            );
            return;
        }
        self.ticket.set(None);
        self.phase.set(QueryPhase::Completing);
        self.completed.set(true);

        let callback = self.callback.borrow_mut().take();
        let outcome = result.map(Answer::from);
        match &outcome {
            Ok(answer) => tracing::debug!(
                domain = %self.domain,
                count = answer.count(),
                ttl = answer.ttl,
                "Query resolved"
            ),
            Err(code) => tracing::debug!(domain = %self.domain, error = %code, "Query failed"),
        }
        if let Some(callback) = callback {
            callback(outcome);
        }
        self.phase.set(QueryPhase::Retired);
    }

    /// Runs the cancel path: `Pending -> Retired`, dropping the callback
    /// uninvoked. Returns the ticket the transport must abandon, or `None`
    /// if the query was no longer outstanding.
    pub fn retire(&self) -> Option<Ticket> {
        let ticket = self.ticket.take()?;
        self.phase.set(QueryPhase::Retired);
        let callback = self.callback.borrow_mut().take();
        drop(callback);
        Some(ticket)
    }
}

/// Handle to one submitted query.
///
/// Clones refer to the same query. Dropping every handle does not cancel
/// the query: the resolver keeps it alive until it completes.
#[derive(Clone)]
pub struct Query {
    state: Rc<QueryState>,
}

impl Query {
    pub(crate) const fn new(state: Rc<QueryState>) -> Self {
        Self { state }
    }

    pub(crate) fn state(&self) -> &QueryState {
        &self.state
    }

    /// Cancels the query through its resolver.
    ///
    /// Does nothing if the query already completed, was canceled, or its
    /// resolver is gone.
    pub fn cancel(&self) {
        match self.state.owner.upgrade() {
            Some(owner) => owner.cancel(&self.state),
            None => {
                self.state.retire();
            }
        }
    }

    /// `true` once the callback has been invoked. A canceled query never
    /// becomes completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state.completed.get()
    }

    /// `true` while the transport still holds a ticket for the query.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state.ticket.get().is_some()
    }

    /// Where the query is in its life.
    #[must_use]
    pub fn phase(&self) -> QueryPhase {
        self.state.phase.get()
    }

    /// The domain this query asked for.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.state.domain
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("domain", &self.state.domain)
            .field("ticket", &self.state.ticket.get())
            .field("phase", &self.state.phase.get())
            .field("completed", &self.state.completed.get())
            .finish()
    }
}
