//! The resolver: query submission, cancellation and the I/O entry points.

use crate::config::{ResolverConfig, UdpConfig};
use crate::dispatch::Context;
use crate::error::{ErrorCode, ResolverError, Result};
use crate::query::{Answer, Query, QueryState};
use crate::transport::udp::UdpProvider;
use crate::transport::{QueryFlags, TransportProvider};
use std::cell::RefCell;
use std::fmt;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static NEXT_RESOLVER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// The context shared by resolvers built with `reuse_shared_context`.
    static SHARED_CONTEXT: RefCell<Option<SharedContext>> = const { RefCell::new(None) };
}

struct SharedContext {
    ctx: Rc<Context>,
    /// UDP settings the context was built from. `None` when it came from a
    /// custom provider.
    udp: Option<UdpConfig>,
}

/// Asynchronous DNS resolver driven by an external event loop.
///
/// # Lifecycle
///
/// 1. [`submit_a4`](Self::submit_a4) registers a query and returns a
///    [`Query`] handle.
/// 2. The caller's event loop calls [`ioevent`](Self::ioevent) whenever
///    [`sock`](Self::sock) is readable and [`timeouts`](Self::timeouts)
///    whenever the wait it returned has passed.
/// 3. Each query's callback runs exactly once from inside one of those
///    calls, unless the query is canceled first.
///
/// A resolver that is never pumped never completes anything.
///
/// # Threading
///
/// Resolvers and queries are `!Send`. All calls happen on the thread that
/// created the resolver; an embedding that needs other threads must funnel
/// work to that thread itself.
///
/// # Example
///
/// ```rust,ignore
/// use udns_core::{QueryFlags, Resolver, ResolverConfig};
///
/// let resolver = Resolver::new(&ResolverConfig::new())?;
/// resolver.submit_a4(
///     "example.com",
///     |addrs, tag| println!("{tag}: {addrs:?}"),
///     "lookup-1",
///     QueryFlags::NONE,
/// )?;
/// udns_core::pump::run_until_idle(&resolver, Duration::from_secs(1), Duration::from_secs(10))?;
/// ```
pub struct Resolver {
    inner: Rc<ResolverInner>,
}

pub(crate) struct ResolverInner {
    id: u64,
    ctx: Rc<Context>,
}

impl ResolverInner {
    pub(crate) fn cancel(&self, state: &QueryState) {
        if let Some(ticket) = state.retire() {
            self.ctx.forget(ticket);
            tracing::debug!(%ticket, "Canceled query");
        }
    }
}

impl Drop for ResolverInner {
    fn drop(&mut self) {
        let outstanding = self.ctx.owned_by(self.id);
        if !outstanding.is_empty() {
            tracing::debug!(
                count = outstanding.len(),
                "Resolver dropped with outstanding queries, canceling"
            );
        }
        for state in outstanding {
            self.cancel(&state);
        }
    }
}

impl Resolver {
    /// Creates a resolver backed by the bundled UDP transport, configured
    /// from `config.udp`.
    ///
    /// With `reuse_shared_context`, the first such resolver on a thread
    /// fixes the UDP settings of the shared context. Later resolvers must
    /// ask for the same settings.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::InvalidArgument`] if the thread's shared
    /// context exists and was built from different UDP settings, or from a
    /// custom provider. Otherwise see [`with_provider`](Self::with_provider).
    pub fn new(config: &ResolverConfig) -> Result<Self> {
        Self::build(
            config,
            &UdpProvider::new(config.udp.clone()),
            Some(&config.udp),
        )
    }

    /// Creates a resolver whose transport contexts come from `provider`.
    ///
    /// With `reuse_shared_context`, the thread's shared context is used,
    /// created from `provider` on first use. Once it exists, `provider` and
    /// `config.udp` are not consulted and the existing context is reused
    /// whatever it talks to. Otherwise a private context is allocated and
    /// released together with the resolver.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::OutOfMemory`] if no context can be
    /// allocated, [`ResolverError::Init`] if it cannot be initialised, and
    /// [`ResolverError::Io`] if the socket cannot be opened. A private
    /// context is released before any of these is returned.
    pub fn with_provider(config: &ResolverConfig, provider: &dyn TransportProvider) -> Result<Self> {
        Self::build(config, provider, None)
    }

    fn build(
        config: &ResolverConfig,
        provider: &dyn TransportProvider,
        udp: Option<&UdpConfig>,
    ) -> Result<Self> {
        let ctx = if config.reuse_shared_context {
            shared_context(provider, udp)?
        } else {
            Rc::new(allocate(provider, false)?)
        };

        if config.open_immediately {
            ctx.with_engine(|engine| engine.open())
                .map_err(ResolverError::Io)?;
        }

        let id = NEXT_RESOLVER_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(id, shared = ctx.is_shared(), "Created resolver");
        Ok(Self {
            inner: Rc::new(ResolverInner { id, ctx }),
        })
    }

    /// Opens the socket, if it is not open yet, and returns its descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::Io`] if the socket cannot be opened.
    pub fn open(&self) -> Result<RawFd> {
        self.inner
            .ctx
            .with_engine(|engine| engine.open())
            .map_err(ResolverError::Io)
    }

    /// Closes the socket. Outstanding queries stay registered and will fail
    /// once their retries run out.
    ///
    /// The transport context itself is released when the last resolver
    /// using it is dropped, so closing twice does nothing more. Closing a
    /// shared context closes it for every resolver using it.
    pub fn close(&self) {
        self.inner.ctx.with_engine(|engine| engine.close());
    }

    /// Submits an IPv4 address query for `domain`.
    ///
    /// `callback` receives the addresses in dotted-quad form, or `None` on
    /// failure, together with `context`. It runs at most once, from inside
    /// [`ioevent`](Self::ioevent) or [`timeouts`](Self::timeouts).
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::InvalidArgument`] for an empty domain and
    /// [`ResolverError::Submission`] if the transport rejects the query. In
    /// both cases the callback is dropped without being called.
    pub fn submit_a4<C, F>(
        &self,
        domain: &str,
        callback: F,
        context: C,
        flags: QueryFlags,
    ) -> Result<Query>
    where
        C: 'static,
        F: FnOnce(Option<Vec<String>>, C) + 'static,
    {
        self.submit_a4_with(domain, flags, move |outcome| {
            callback(outcome.ok().map(|answer| answer.address_strings()), context);
        })
    }

    /// Like [`submit_a4`](Self::submit_a4), but the callback receives the
    /// full [`Answer`] or the failure code.
    ///
    /// # Errors
    ///
    /// Same as [`submit_a4`](Self::submit_a4).
    pub fn submit_a4_with<F>(&self, domain: &str, flags: QueryFlags, callback: F) -> Result<Query>
    where
        F: FnOnce(std::result::Result<Answer, ErrorCode>) + 'static,
    {
        if domain.is_empty() {
            return Err(ResolverError::InvalidArgument(
                "domain must not be empty".to_string(),
            ));
        }

        let ticket = self
            .inner
            .ctx
            .with_engine(|engine| engine.submit_a4(domain, flags))
            .map_err(|code| {
                tracing::debug!(domain = %domain, error = %code, "Transport rejected query");
                ResolverError::Submission(code)
            })?;

        let state = Rc::new(QueryState::new(
            Rc::downgrade(&self.inner),
            self.inner.id,
            domain,
            ticket,
            Box::new(callback),
        ));
        self.inner.ctx.register(ticket, Rc::clone(&state));
        tracing::debug!(domain = %domain, %ticket, flags = flags.bits(), "Submitted query");
        Ok(Query::new(state))
    }

    /// Cancels `query`. The callback will never run afterwards.
    ///
    /// Canceling a query that already completed or was canceled is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ResolverError::InvalidArgument`] if `query` was submitted
    /// through a different resolver.
    pub fn cancel(&self, query: &Query) -> Result<()> {
        if query.state().owner_id() != self.inner.id {
            return Err(ResolverError::InvalidArgument(
                "query was submitted to a different resolver".to_string(),
            ));
        }
        self.inner.cancel(query.state());
        Ok(())
    }

    /// Processes replies waiting on the socket. Call whenever
    /// [`sock`](Self::sock) is readable. `now` of `None` reads the clock.
    pub fn ioevent(&self, now: Option<Instant>) {
        self.inner.ctx.ioevent(now);
    }

    /// Retransmits or expires overdue queries and returns how long to wait
    /// before calling again, never more than `max_wait`.
    pub fn timeouts(&self, max_wait: Duration, now: Option<Instant>) -> Duration {
        self.inner.ctx.timeouts(max_wait, now)
    }

    /// Number of queries the transport still has outstanding.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.ctx.with_engine(|engine| engine.active())
    }

    /// The socket to watch for readability, if open.
    #[must_use]
    pub fn sock(&self) -> Option<RawFd> {
        self.inner.ctx.with_engine(|engine| engine.sock())
    }

    /// Outcome of the most recent finished or rejected query, `None` after
    /// a success.
    #[must_use]
    pub fn status(&self) -> Option<ErrorCode> {
        self.inner.ctx.with_engine(|engine| engine.status())
    }

    /// Whether this resolver uses the thread's shared context.
    #[must_use]
    pub fn is_shared_context(&self) -> bool {
        self.inner.ctx.is_shared()
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("id", &self.inner.id)
            .field("shared", &self.inner.ctx.is_shared())
            .finish_non_exhaustive()
    }
}

/// Drops this thread's shared context handle.
///
/// Resolvers already using it keep it alive until they are dropped; the
/// next resolver asking for a shared context gets a fresh one. Returns
/// `false` if there was no shared context.
pub fn release_shared_context() -> bool {
    SHARED_CONTEXT.with(|slot| slot.borrow_mut().take().is_some())
}

/// Returns the thread's shared context, creating it from `provider` if
/// needed. `udp` is checked against the settings the context was built
/// from; `None` accepts any existing context.
fn shared_context(
    provider: &dyn TransportProvider,
    udp: Option<&UdpConfig>,
) -> Result<Rc<Context>> {
    SHARED_CONTEXT.with(|slot| {
        if let Some(shared) = slot.borrow().as_ref() {
            if udp.is_some() && udp != shared.udp.as_ref() {
                return Err(ResolverError::InvalidArgument(
                    "shared context was created with different transport settings; \
                     use a private context or release the shared one first"
                        .to_string(),
                ));
            }
            return Ok(Rc::clone(&shared.ctx));
        }
        let ctx = Rc::new(allocate(provider, true)?);
        *slot.borrow_mut() = Some(SharedContext {
            ctx: Rc::clone(&ctx),
            udp: udp.cloned(),
        });
        Ok(ctx)
    })
}

fn allocate(provider: &dyn TransportProvider, shared: bool) -> Result<Context> {
    let mut engine = provider.new_context().ok_or(ResolverError::OutOfMemory)?;
    engine.init().map_err(ResolverError::Init)?;
    tracing::info!(shared, "Created transport context");
    Ok(Context::new(engine, shared))
}
