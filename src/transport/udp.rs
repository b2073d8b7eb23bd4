//! Non-blocking UDP transport.
//!
//! All queries share one socket. Replies are matched to requests by message
//! ID, source address and question; message encoding and decoding is done
//! by the `domain` crate.

use super::timeout::{TimeoutQueue, deadline_after};
use super::{A4Record, Completion, QueryFlags, Ticket, Transport, TransportProvider};
use crate::config::UdpConfig;
use crate::error::ErrorCode;
use domain::base::iana::Rtype;
use domain::base::message::Message;
use domain::base::message_builder::MessageBuilder;
use domain::base::name::Name;
use domain::rdata::A;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Version string reported by [`transport_version`](super::transport_version).
pub const VERSION: &str = concat!("udns-core-udp/", env!("CARGO_PKG_VERSION"));

const RCODE_NOERROR: u8 = 0;
const RCODE_SERVFAIL: u8 = 2;
const RCODE_NXDOMAIN: u8 = 3;
const RCODE_REFUSED: u8 = 5;

/// Hands out [`UdpTransport`] contexts sharing one configuration.
#[derive(Debug, Clone, Default)]
pub struct UdpProvider {
    config: UdpConfig,
}

impl UdpProvider {
    /// Creates a provider whose contexts use `config`.
    #[must_use]
    pub const fn new(config: UdpConfig) -> Self {
        Self { config }
    }
}

impl TransportProvider for UdpProvider {
    fn new_context(&self) -> Option<Box<dyn Transport>> {
        Some(Box::new(UdpTransport::new(self.config.clone())))
    }
}

/// A query that has been sent at least once and is waiting for a reply.
struct PendingQuery {
    id: u16,
    /// The name as sent, for matching replies.
    name: Name<Vec<u8>>,
    /// Lower-cased, without the trailing dot. Only used for logging.
    qname: String,
    flags: QueryFlags,
    request: Vec<u8>,
    sends: usize,
    server: usize,
    deadline: Instant,
}

/// What to do with a reply that matched a pending query.
enum Reply {
    Done(Result<A4Record, ErrorCode>),
    Retry,
}

/// A transport context bound to one UDP socket.
pub struct UdpTransport {
    config: UdpConfig,
    sock: Option<UdpSocket>,
    pending: HashMap<Ticket, PendingQuery>,
    ids: HashMap<u16, Ticket>,
    timeouts: TimeoutQueue<Ticket>,
    next_ticket: u64,
    status: Option<ErrorCode>,
}

impl UdpTransport {
    /// Creates an unopened context. Call [`Transport::init`] and
    /// [`Transport::open`] before submitting.
    #[must_use]
    pub fn new(config: UdpConfig) -> Self {
        Self {
            config,
            sock: None,
            pending: HashMap::new(),
            ids: HashMap::new(),
            timeouts: TimeoutQueue::new(),
            next_ticket: 1,
            status: None,
        }
    }

    /// The local address of the socket, if open.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sock.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn enqueue(&mut self, name: &str, flags: QueryFlags) -> Result<Ticket, ErrorCode> {
        if self.sock.is_none() {
            return Err(ErrorCode::TemporaryFailure);
        }
        if self.ids.len() > usize::from(u16::MAX) {
            return Err(ErrorCode::OutOfMemory);
        }
        let qname = Name::<Vec<u8>>::from_str(name).map_err(|_| ErrorCode::BadQuery)?;
        let id = self.unused_id();
        let request = build_request(id, qname.clone(), flags)?;

        let ticket = Ticket::new(self.next_ticket);
        self.next_ticket += 1;

        let now = Instant::now();
        let mut query = PendingQuery {
            id,
            name: qname,
            qname: normalize(name),
            flags,
            request,
            sends: 0,
            server: 0,
            deadline: now,
        };
        self.send(&mut query, now);
        self.timeouts.push(query.deadline, ticket);
        self.ids.insert(id, ticket);
        self.pending.insert(ticket, query);
        Ok(ticket)
    }

    fn unused_id(&self) -> u16 {
        let mut id = rand::random();
        while self.ids.contains_key(&id) {
            id = rand::random();
        }
        id
    }

    /// Sends the query to its current server and arms the next deadline.
    fn send(&self, query: &mut PendingQuery, now: Instant) {
        query.sends += 1;
        query.deadline = deadline_after(now, self.config.timeout);

        let (Some(sock), Some(server)) =
            (self.sock.as_ref(), self.config.nameservers.get(query.server))
        else {
            tracing::debug!(id = query.id, "Socket closed, send skipped");
            return;
        };
        match sock.send_to(&query.request, server) {
            Ok(_) => tracing::debug!(
                domain = %query.qname,
                id = query.id,
                server = %server,
                attempt = query.sends,
                "Sent query"
            ),
            Err(e) => tracing::warn!(
                domain = %query.qname,
                server = %server,
                error = %e,
                "Failed to send query"
            ),
        }
    }

    /// Moves the query on to its next attempt, or fails it.
    fn retry(&mut self, ticket: Ticket, now: Instant, done: &mut Vec<Completion>) {
        let Some(mut query) = self.pending.remove(&ticket) else {
            return;
        };
        if query.sends >= self.config.max_sends() {
            self.complete(ticket, query.id, Err(ErrorCode::TemporaryFailure), done);
            return;
        }
        query.server = (query.server + 1) % self.config.nameservers.len().max(1);
        self.send(&mut query, now);
        self.timeouts.push(query.deadline, ticket);
        self.pending.insert(ticket, query);
    }

    fn complete(
        &mut self,
        ticket: Ticket,
        id: u16,
        result: Result<A4Record, ErrorCode>,
        done: &mut Vec<Completion>,
    ) {
        self.pending.remove(&ticket);
        self.ids.remove(&id);
        self.status = result.as_ref().err().copied();
        tracing::debug!(%ticket, id, status = ?self.status, "Query finished");
        done.push(Completion { ticket, result });
    }

    fn handle_reply(
        &mut self,
        packet: &[u8],
        from: SocketAddr,
        now: Instant,
        done: &mut Vec<Completion>,
    ) {
        let Ok(msg) = Message::from_octets(packet.to_vec()) else {
            tracing::debug!(from = %from, len = packet.len(), "Dropping short reply");
            return;
        };
        let header = msg.header();
        if !header.qr() {
            return;
        }
        let id = header.id();
        let Some(&ticket) = self.ids.get(&id) else {
            tracing::debug!(from = %from, id, "Dropping reply for unknown id");
            return;
        };
        if !self.config.nameservers.contains(&from) {
            tracing::debug!(from = %from, id, "Dropping reply from unexpected source");
            return;
        }
        let Some(query) = self.pending.get(&ticket) else {
            return;
        };
        if !question_matches(&msg, &query.name) {
            tracing::debug!(from = %from, id, "Dropping reply with mismatched question");
            return;
        }
        if query.flags.contains(QueryFlags::AA_ONLY) && !header.aa() {
            tracing::debug!(from = %from, id, "Ignoring non-authoritative reply");
            return;
        }

        match decode_reply(&msg) {
            Reply::Done(result) => self.complete(ticket, id, result, done),
            Reply::Retry => self.retry(ticket, now, done),
        }
    }
}

impl Transport for UdpTransport {
    fn init(&mut self) -> io::Result<()> {
        if self.config.nameservers.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no nameservers configured",
            ));
        }
        tracing::debug!(nameservers = ?self.config.nameservers, "Initialized UDP transport");
        Ok(())
    }

    fn open(&mut self) -> io::Result<RawFd> {
        if let Some(sock) = &self.sock {
            return Ok(sock.as_raw_fd());
        }
        let bind: SocketAddr = match self.config.nameservers.first() {
            Some(SocketAddr::V6(_)) => (Ipv6Addr::UNSPECIFIED, 0).into(),
            _ => (Ipv4Addr::UNSPECIFIED, 0).into(),
        };
        let sock = UdpSocket::bind(bind)?;
        sock.set_nonblocking(true)?;
        let fd = sock.as_raw_fd();
        tracing::info!(fd, local = ?sock.local_addr().ok(), "Opened resolver socket");
        self.sock = Some(sock);
        Ok(fd)
    }

    fn close(&mut self) {
        if let Some(sock) = self.sock.take() {
            tracing::info!(fd = sock.as_raw_fd(), "Closed resolver socket");
        }
    }

    fn sock(&self) -> Option<RawFd> {
        self.sock.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn active(&self) -> usize {
        self.pending.len()
    }

    fn status(&self) -> Option<ErrorCode> {
        self.status
    }

    fn submit_a4(&mut self, name: &str, flags: QueryFlags) -> Result<Ticket, ErrorCode> {
        let result = self.enqueue(name, flags);
        if let Err(code) = result {
            self.status = Some(code);
        }
        result
    }

    fn cancel(&mut self, ticket: Ticket) {
        if let Some(query) = self.pending.remove(&ticket) {
            self.ids.remove(&query.id);
        }
    }

    fn ioevent(&mut self, now: Option<Instant>, done: &mut Vec<Completion>) {
        let now = now.unwrap_or_else(Instant::now);
        let mut buf = vec![0u8; self.config.max_response_size];
        loop {
            let Some(sock) = self.sock.as_ref() else {
                return;
            };
            let (len, from) = match sock.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read from resolver socket");
                    break;
                }
            };
            self.handle_reply(&buf[..len], from, now, done);
        }
    }

    fn timeouts(
        &mut self,
        max_wait: Duration,
        now: Option<Instant>,
        done: &mut Vec<Completion>,
    ) -> Duration {
        let now = now.unwrap_or_else(Instant::now);
        while let Some((deadline, ticket)) = self.timeouts.pop_expired(now) {
            if self.pending.get(&ticket).is_some_and(|q| q.deadline == deadline) {
                tracing::debug!(%ticket, "Query attempt timed out");
                self.retry(ticket, now, done);
            }
        }

        let pending = &self.pending;
        self.timeouts.clean_head(|deadline, ticket| {
            pending
                .get(ticket)
                .is_none_or(|q| q.deadline != deadline)
        });
        self.timeouts
            .next_deadline()
            .map_or(max_wait, |d| d.saturating_duration_since(now).min(max_wait))
    }
}

fn build_request(id: u16, qname: Name<Vec<u8>>, flags: QueryFlags) -> Result<Vec<u8>, ErrorCode> {
    let mut builder = MessageBuilder::new_vec();
    builder.header_mut().set_id(id);
    builder
        .header_mut()
        .set_rd(!flags.contains(QueryFlags::NO_RECURSION));
    let mut builder = builder.question();
    builder
        .push((qname, Rtype::A))
        .map_err(|_| ErrorCode::BadQuery)?;
    Ok(builder.finish())
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Names compare case-insensitively and label by label, so escaped
/// characters match however they were spelled.
fn question_matches(msg: &Message<Vec<u8>>, name: &Name<Vec<u8>>) -> bool {
    msg.first_question()
        .is_some_and(|q| q.qtype() == Rtype::A && q.qname() == name)
}

fn decode_reply(msg: &Message<Vec<u8>>) -> Reply {
    let header = msg.header();
    if header.tc() {
        // No TCP fallback.
        return Reply::Done(Err(ErrorCode::ProtocolError));
    }
    match header.rcode().to_int() {
        RCODE_NOERROR => Reply::Done(decode_answer(msg)),
        RCODE_NXDOMAIN => Reply::Done(Err(ErrorCode::NameNotFound)),
        RCODE_SERVFAIL | RCODE_REFUSED => Reply::Retry,
        _ => Reply::Done(Err(ErrorCode::ProtocolError)),
    }
}

fn decode_answer(msg: &Message<Vec<u8>>) -> Result<A4Record, ErrorCode> {
    let qname = msg
        .first_question()
        .map(|q| normalize(&q.qname().to_string()))
        .ok_or(ErrorCode::ProtocolError)?;
    let cname = msg
        .canonical_name()
        .map_or_else(|| qname.clone(), |name| normalize(&name.to_string()));

    let mut addrs = Vec::new();
    let mut ttl = u32::MAX;
    let answer = msg.answer().map_err(|_| ErrorCode::ProtocolError)?;
    for record in answer.limit_to::<A>() {
        let record = record.map_err(|_| ErrorCode::ProtocolError)?;
        ttl = ttl.min(record.ttl().as_secs());
        addrs.push(record.data().addr());
    }
    if addrs.is_empty() {
        return Err(ErrorCode::NoData);
    }
    Ok(A4Record {
        qname,
        cname,
        ttl,
        addrs,
    })
}
