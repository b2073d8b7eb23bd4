//! Transport contexts and completion dispatch.
//!
//! A [`Context`] pairs a transport with the registry of queries submitted
//! through it. Completions are collected from the transport first and
//! delivered afterwards, so callbacks run with the transport unborrowed and
//! may submit or cancel queries themselves.

use crate::query::QueryState;
use crate::transport::{Completion, Ticket, Transport};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::{Duration, Instant};

pub(crate) struct Context {
    engine: RefCell<Box<dyn Transport>>,
    registry: RefCell<HashMap<Ticket, Rc<QueryState>>>,
    /// Tickets canceled while a batch was being delivered. Their
    /// completions may already sit in that batch.
    canceled: RefCell<HashSet<Ticket>>,
    depth: Cell<usize>,
    shared: bool,
}

impl Context {
    pub fn new(engine: Box<dyn Transport>, shared: bool) -> Self {
        Self {
            engine: RefCell::new(engine),
            registry: RefCell::new(HashMap::new()),
            canceled: RefCell::new(HashSet::new()),
            depth: Cell::new(0),
            shared,
        }
    }

    pub const fn is_shared(&self) -> bool {
        self.shared
    }

    /// Runs `f` with the transport borrowed. `f` must not re-enter the
    /// context.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut dyn Transport) -> R) -> R {
        f(self.engine.borrow_mut().as_mut())
    }

    pub fn register(&self, ticket: Ticket, state: Rc<QueryState>) {
        self.registry.borrow_mut().insert(ticket, state);
    }

    /// Drops `ticket` from the registry and abandons it in the transport.
    pub fn forget(&self, ticket: Ticket) {
        self.registry.borrow_mut().remove(&ticket);
        self.with_engine(|engine| engine.cancel(ticket));
        if self.depth.get() > 0 {
            self.canceled.borrow_mut().insert(ticket);
        }
    }

    /// Queries in the registry submitted by the resolver `owner`.
    pub fn owned_by(&self, owner: u64) -> Vec<Rc<QueryState>> {
        self.registry
            .borrow()
            .values()
            .filter(|state| state.owner_id() == owner)
            .cloned()
            .collect()
    }

    pub fn ioevent(&self, now: Option<Instant>) {
        let mut done = Vec::new();
        self.with_engine(|engine| engine.ioevent(now, &mut done));
        self.dispatch(done);
    }

    pub fn timeouts(&self, max_wait: Duration, now: Option<Instant>) -> Duration {
        let mut done = Vec::new();
        let wait = self.with_engine(|engine| engine.timeouts(max_wait, now, &mut done));
        self.dispatch(done);
        wait
    }

    fn dispatch(&self, batch: Vec<Completion>) {
        if batch.is_empty() {
            return;
        }
        self.depth.set(self.depth.get() + 1);
        for completion in batch {
            self.deliver(completion);
        }
        self.depth.set(self.depth.get() - 1);
        if self.depth.get() == 0 {
            self.canceled.borrow_mut().clear();
        }
    }

    fn deliver(&self, completion: Completion) {
        let Completion { ticket, result } = completion;
        let state = self.registry.borrow_mut().remove(&ticket);
        match state {
            Some(state) => state.complete(result),
            None if self.canceled.borrow_mut().remove(&ticket) => {
                tracing::debug!(%ticket, "Dropping completion for query canceled mid-dispatch");
            }
            None => {
                tracing::error!(%ticket, "Transport completed a retired ticket, dropping");
            }
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let active = self.engine.get_mut().active();
        tracing::info!(shared = self.shared, active, "Released transport context");
    }
}
