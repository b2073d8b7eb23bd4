//! Integration tests for `udns-core`.
//!
//! Each test runs a stub nameserver on a loopback port in a background
//! thread and drives a real UDP resolver against it with the bundled
//! event pump.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::rc::Rc;
use std::thread::JoinHandle;
use std::time::Duration;

use udns_core::pump::run_until_idle;
use udns_core::{
    ErrorCode, NAME_NOT_FOUND, QueryFlags, Resolver, ResolverConfig, ResolverError, UdpConfig,
};

// ---------------------------------------------------------------------------
// Stub nameserver
// ---------------------------------------------------------------------------

/// Answers A queries from a fixed table. Names starting with `nx.` get
/// NXDOMAIN, names starting with `silent.` get nothing, anything else gets
/// an empty NOERROR. A failing server answers everything with SERVFAIL.
struct StubServer {
    addr: SocketAddr,
    handle: JoinHandle<usize>,
}

impl StubServer {
    fn spawn(table: &[(&str, &[Ipv4Addr])], queries: usize) -> Self {
        Self::start(table, queries, false)
    }

    fn spawn_failing(queries: usize) -> Self {
        Self::start(&[], queries, true)
    }

    fn start(table: &[(&str, &[Ipv4Addr])], queries: usize, servfail: bool) -> Self {
        let table: HashMap<String, Vec<Ipv4Addr>> = table
            .iter()
            .map(|(name, addrs)| ((*name).to_string(), addrs.to_vec()))
            .collect();
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let addr = sock.local_addr().unwrap();

        let handle = std::thread::spawn(move || {
            let mut seen = 0;
            let mut buf = [0u8; 512];
            while seen < queries {
                let Ok((len, client)) = sock.recv_from(&mut buf) else {
                    break;
                };
                seen += 1;
                let request = &buf[..len];
                let name = qname(request);
                let response = if name.starts_with("silent.") {
                    continue;
                } else if servfail {
                    reply(request, 2, &[])
                } else if name.starts_with("nx.") {
                    reply(request, 3, &[])
                } else {
                    reply(request, 0, table.get(&name).map_or(&[][..], Vec::as_slice))
                };
                sock.send_to(&response, client).unwrap();
            }
            seen
        });
        Self { addr, handle }
    }

    fn config(&self) -> ResolverConfig {
        ResolverConfig::new()
            .with_shared_context(false)
            .with_udp(UdpConfig::new(self.addr).with_timeout(Duration::from_secs(2)))
    }

    fn join(self) -> usize {
        self.handle.join().unwrap()
    }
}

fn qname(request: &[u8]) -> String {
    let mut labels = Vec::new();
    let mut pos = 12;
    while request[pos] != 0 {
        let len = usize::from(request[pos]);
        labels.push(String::from_utf8_lossy(&request[pos + 1..=pos + len]).to_ascii_lowercase());
        pos += len + 1;
    }
    labels.join(".")
}

fn reply(request: &[u8], rcode: u8, addrs: &[Ipv4Addr]) -> Vec<u8> {
    let mut out = request.to_vec();
    // QR and AA.
    out[2] |= 0x84;
    out[3] = (out[3] & 0xf0) | 0x80 | rcode;
    out[6..8].copy_from_slice(&u16::try_from(addrs.len()).unwrap().to_be_bytes());
    for addr in addrs {
        out.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1]);
        out.extend_from_slice(&300u32.to_be_bytes());
        out.extend_from_slice(&[0, 4]);
        out.extend_from_slice(&addr.octets());
    }
    out
}

type Seen = Rc<RefCell<Vec<(Option<Vec<String>>, &'static str)>>>;

fn recorder(seen: &Seen) -> impl FnOnce(Option<Vec<String>>, &'static str) + 'static {
    let seen = Rc::clone(seen);
    move |addrs, tag| seen.borrow_mut().push((addrs, tag))
}

const MAX_WAIT: Duration = Duration::from_millis(100);
const LIMIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn resolves_over_udp() {
    let server = StubServer::spawn(
        &[(
            "example.test",
            &[Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)],
        )],
        1,
    );
    let resolver = Resolver::new(&server.config()).unwrap();
    let seen = Seen::default();

    let query = resolver
        .submit_a4("example.test", recorder(&seen), "ctx", QueryFlags::NONE)
        .unwrap();
    assert!(run_until_idle(&resolver, MAX_WAIT, LIMIT).unwrap());

    assert_eq!(
        *seen.borrow(),
        vec![(
            Some(vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]),
            "ctx"
        )]
    );
    assert!(query.is_completed());
    assert_eq!(resolver.status(), None);
    assert_eq!(server.join(), 1);
}

#[test]
fn nxdomain_reaches_callback_and_status() {
    let server = StubServer::spawn(&[], 1);
    let resolver = Resolver::new(&server.config()).unwrap();
    let seen = Seen::default();

    resolver
        .submit_a4("nx.test", recorder(&seen), "nx", QueryFlags::NONE)
        .unwrap();
    assert!(run_until_idle(&resolver, MAX_WAIT, LIMIT).unwrap());

    assert_eq!(*seen.borrow(), vec![(None, "nx")]);
    assert_eq!(resolver.status().map(ErrorCode::code), Some(NAME_NOT_FOUND));
    server.join();
}

#[test]
fn detailed_answer_over_udp() {
    let server = StubServer::spawn(&[("detail.test", &[Ipv4Addr::LOCALHOST])], 1);
    let resolver = Resolver::new(&server.config()).unwrap();
    let answer = Rc::new(RefCell::new(None));

    let sink = Rc::clone(&answer);
    resolver
        .submit_a4_with("Detail.Test.", QueryFlags::AA_ONLY, move |outcome| {
            *sink.borrow_mut() = Some(outcome);
        })
        .unwrap();
    assert!(run_until_idle(&resolver, MAX_WAIT, LIMIT).unwrap());

    let answer = answer.borrow_mut().take().unwrap().unwrap();
    assert_eq!(answer.qname, "detail.test");
    assert_eq!(answer.cname, "detail.test");
    assert_eq!(answer.ttl, 300);
    assert_eq!(answer.addresses, vec![Ipv4Addr::LOCALHOST]);
    server.join();
}

#[test]
fn empty_answer_is_no_data() {
    let server = StubServer::spawn(&[], 1);
    let resolver = Resolver::new(&server.config()).unwrap();
    let seen = Seen::default();

    resolver
        .submit_a4("empty.test", recorder(&seen), "empty", QueryFlags::NONE)
        .unwrap();
    assert!(run_until_idle(&resolver, MAX_WAIT, LIMIT).unwrap());

    assert_eq!(*seen.borrow(), vec![(None, "empty")]);
    assert_eq!(resolver.status(), Some(ErrorCode::NoData));
    server.join();
}

#[test]
fn many_queries_share_one_socket() {
    let server = StubServer::spawn(
        &[
            ("a.test", &[Ipv4Addr::new(192, 0, 2, 1)]),
            ("b.test", &[Ipv4Addr::new(192, 0, 2, 2)]),
            ("c.test", &[Ipv4Addr::new(192, 0, 2, 3)]),
        ],
        3,
    );
    let resolver = Resolver::new(&server.config()).unwrap();
    let seen = Seen::default();

    for (name, tag) in [("a.test", "a"), ("b.test", "b"), ("c.test", "c")] {
        resolver
            .submit_a4(name, recorder(&seen), tag, QueryFlags::NONE)
            .unwrap();
    }
    assert_eq!(resolver.active_count(), 3);
    assert!(run_until_idle(&resolver, MAX_WAIT, LIMIT).unwrap());

    let mut results = seen.borrow().clone();
    results.sort_by_key(|(_, tag)| *tag);
    assert_eq!(
        results,
        vec![
            (Some(vec!["192.0.2.1".to_string()]), "a"),
            (Some(vec!["192.0.2.2".to_string()]), "b"),
            (Some(vec!["192.0.2.3".to_string()]), "c"),
        ]
    );
    assert_eq!(server.join(), 3);
}

#[test]
fn silent_server_times_out() {
    let server = StubServer::spawn(&[], 2);
    let config = ResolverConfig::new().with_shared_context(false).with_udp(
        UdpConfig::new(server.addr)
            .with_timeout(Duration::from_millis(50))
            .with_attempts(2),
    );
    let resolver = Resolver::new(&config).unwrap();
    let seen = Seen::default();

    resolver
        .submit_a4("silent.test", recorder(&seen), "slow", QueryFlags::NONE)
        .unwrap();
    assert!(run_until_idle(&resolver, MAX_WAIT, LIMIT).unwrap());

    assert_eq!(*seen.borrow(), vec![(None, "slow")]);
    assert_eq!(resolver.status(), Some(ErrorCode::TemporaryFailure));
    // Both attempts reached the server.
    assert_eq!(server.join(), 2);
}

#[test]
fn cancel_before_pump_never_fires() {
    let server = StubServer::spawn(&[("example.test", &[Ipv4Addr::LOCALHOST])], 1);
    let resolver = Resolver::new(&server.config()).unwrap();
    let seen = Seen::default();

    let query = resolver
        .submit_a4("example.test", recorder(&seen), "x", QueryFlags::NONE)
        .unwrap();
    query.cancel();
    assert_eq!(resolver.active_count(), 0);

    // The reply still arrives and must be ignored.
    server.join();
    std::thread::sleep(Duration::from_millis(50));
    resolver.ioevent(None);
    let _ = resolver.timeouts(MAX_WAIT, None);
    assert!(seen.borrow().is_empty());
    assert!(!query.is_completed());
}

#[test]
fn deferred_open_and_close() {
    let server = StubServer::spawn(&[("example.test", &[Ipv4Addr::LOCALHOST])], 1);
    let resolver = Resolver::new(&server.config().with_open_immediately(false)).unwrap();
    assert!(resolver.sock().is_none());

    let fd = resolver.open().unwrap();
    assert_eq!(resolver.sock(), Some(fd));
    let seen = Seen::default();
    resolver
        .submit_a4("example.test", recorder(&seen), "late", QueryFlags::NONE)
        .unwrap();
    assert!(run_until_idle(&resolver, MAX_WAIT, LIMIT).unwrap());
    assert_eq!(seen.borrow().len(), 1);

    resolver.close();
    assert!(resolver.sock().is_none());
    server.join();
}

#[test]
fn closed_socket_queries_still_expire() {
    let server = StubServer::spawn(&[], 1);
    let config = ResolverConfig::new().with_shared_context(false).with_udp(
        UdpConfig::new(server.addr)
            .with_timeout(Duration::from_millis(50))
            .with_attempts(2),
    );
    let resolver = Resolver::new(&config).unwrap();
    let seen = Seen::default();
    resolver
        .submit_a4("silent.test", recorder(&seen), "closed", QueryFlags::NONE)
        .unwrap();
    resolver.close();

    assert!(run_until_idle(&resolver, MAX_WAIT, LIMIT).unwrap());
    assert_eq!(*seen.borrow(), vec![(None, "closed")]);
    assert_eq!(resolver.status(), Some(ErrorCode::TemporaryFailure));
    // Only the first send left before the socket closed.
    assert_eq!(server.join(), 1);
}

#[test]
fn servfail_moves_on_to_next_nameserver() {
    let failing = StubServer::spawn_failing(1);
    let healthy = StubServer::spawn(&[("flaky.test", &[Ipv4Addr::new(198, 51, 100, 7)])], 1);
    let config = ResolverConfig::new().with_shared_context(false).with_udp(
        UdpConfig::new(failing.addr)
            .with_nameserver(healthy.addr)
            .with_timeout(Duration::from_secs(2))
            .with_attempts(1),
    );
    let resolver = Resolver::new(&config).unwrap();
    let seen = Seen::default();

    resolver
        .submit_a4("flaky.test", recorder(&seen), "flaky", QueryFlags::NONE)
        .unwrap();
    assert!(run_until_idle(&resolver, MAX_WAIT, LIMIT).unwrap());

    assert_eq!(
        *seen.borrow(),
        vec![(Some(vec!["198.51.100.7".to_string()]), "flaky")]
    );
    assert_eq!(failing.join(), 1);
    assert_eq!(healthy.join(), 1);
}

#[test]
fn unreachable_nameserver_config_fails_init() {
    let mut udp = UdpConfig::default();
    udp.nameservers.clear();
    let config = ResolverConfig::new().with_shared_context(false).with_udp(udp);
    let err = Resolver::new(&config).unwrap_err();
    assert!(matches!(err, ResolverError::Init(_)));
    assert!(err.is_construction());
}

#[test]
fn reports_transport_version() {
    assert!(udns_core::transport_version().contains(env!("CARGO_PKG_VERSION")));
}
