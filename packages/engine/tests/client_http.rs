//! Client transactions over in-memory sockets

mod common;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use common::{harness, harness_with, Ev, EXAMPLE_IP};
use wirerole_engine::client::ConnectInfo;
use wirerole_engine::config::{EngineConfig, VhostConfig};
use wirerole_engine::conn::{LrsState, PendingTimeout};
use wirerole_engine::role::{WriteKind, RAW};

fn get(path: &str) -> ConnectInfo {
    ConnectInfo::new("example.com", 80).path(path)
}

#[test]
fn content_length_get_is_delivered_and_idles() {
    let mut h = harness();
    let id = h.w.client_connect_via_info(get("/index.html")).expect("connects");
    let sid = h.socket_of(id);

    assert_eq!(h.net.opened(), vec![SocketAddr::new(IpAddr::V4(EXAMPLE_IP), 80)]);
    assert_eq!(h.dns.lookups(), vec!["example.com".to_string()]);
    assert_eq!(
        h.net.written_text(sid),
        "GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n"
    );
    assert_eq!(h.w.conn(id).map(|c| c.state()), Some(LrsState::WaitingServerReply));
    assert_eq!(h.w.pending_timeout(id), Some(PendingTimeout::AwaitingServerResponse));

    h.feed(id, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");

    assert_eq!(
        h.rec.of(id),
        vec![
            Ev::FilterPre,
            Ev::Established,
            Ev::Rx,
            Ev::Read(b"hello".to_vec()),
            Ev::Completed,
        ]
    );
    let conn = h.w.conn(id).expect("still open");
    assert_eq!(conn.state(), LrsState::Established);
    assert!(conn.client().keepalive_active());
    assert!(conn.header_table().is_none());
    assert_eq!(h.w.pending_timeout(id), Some(PendingTimeout::ClientConnIdle));
}

#[test]
fn body_split_across_reads_completes_once() {
    let mut h = harness();
    let id = h.w.client_connect_via_info(get("/")).expect("connects");

    h.feed(id, b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123");
    assert_eq!(h.rec.body(id), b"0123");
    assert_eq!(h.rec.count(id, |e| *e == Ev::Completed), 0);

    h.feed(id, b"456789");
    assert_eq!(h.rec.body(id), b"0123456789");
    assert_eq!(h.rec.count(id, |e| *e == Ev::Completed), 1);
}

#[test]
fn chunked_body_is_dechunked() {
    let mut h = harness();
    let id = h.w.client_connect_via_info(get("/chunks")).expect("connects");

    h.feed(
        id,
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    );

    assert_eq!(h.rec.body(id), b"hello world");
    assert_eq!(h.rec.count(id, |e| *e == Ev::Completed), 1);
    assert!(h.w.conn(id).is_some_and(|c| c.client().chunked()));
}

#[test]
fn broken_chunking_closes_the_connection() {
    let mut h = harness();
    let id = h.w.client_connect_via_info(get("/")).expect("connects");

    h.feed(id, b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nxyz\r\n");

    assert!(!h.w.contains(id));
    assert_eq!(h.rec.count(id, |e| *e == Ev::Closed), 1);
    assert_eq!(h.rec.count(id, |e| *e == Ev::Completed), 0);
}

#[test]
fn empty_body_completes_with_the_head() {
    let mut h = harness();
    let id = h.w.client_connect_via_info(get("/")).expect("connects");

    h.feed(id, b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n");

    assert_eq!(h.rec.count(id, |e| *e == Ev::Completed), 1);
    assert!(h.rec.body(id).is_empty());
}

#[test]
fn held_receive_waits_for_an_explicit_read() {
    let mut h = harness();
    h.rec.script(|s| s.hold_rx = true);
    let id = h.w.client_connect_via_info(get("/")).expect("connects");

    h.feed(id, b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc");
    assert_eq!(h.rec.count(id, |e| *e == Ev::Rx), 1);
    assert!(h.rec.body(id).is_empty());
    assert!(h.w.conn(id).is_some_and(|c| c.flow().is_flowcontrolled()));

    let taken = h.w.client_http_read(id).expect("reads the held body");
    assert_eq!(taken, 3);
    assert_eq!(h.rec.body(id), b"abc");
    assert_eq!(h.rec.count(id, |e| *e == Ev::Completed), 1);
}

#[test]
fn response_wait_times_out_with_a_connection_error() {
    let mut h = harness();
    let id = h.w.client_connect_via_info(get("/slow")).expect("connects");

    h.advance(10);
    assert!(h.w.contains(id));

    h.advance(11);
    assert!(!h.w.contains(id));
    assert_eq!(h.rec.of(id), vec![Ev::Cce("timeout".to_string())]);
    assert_eq!(h.w.stats().snapshot().timeouts, 1);
}

#[test]
fn idle_keepalive_closes_after_its_grace() {
    let mut h = harness();
    let id = h.w.client_connect_via_info(get("/")).expect("connects");
    h.feed(id, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");

    h.advance(6);

    assert!(!h.w.contains(id));
    assert_eq!(h.rec.count(id, |e| *e == Ev::Closed), 1);
    assert_eq!(h.rec.count(id, |e| matches!(e, Ev::Cce(_))), 0);
}

#[test]
fn unknown_host_fails_before_any_socket() {
    let mut h = harness();
    let err = h
        .w
        .client_connect_via_info(ConnectInfo::new("nowhere.invalid", 80))
        .expect_err("cannot resolve");

    assert_eq!(err.diagnostic(), "getaddrinfo failed");
    assert!(h.net.opened().is_empty());
    assert_eq!(h.w.connection_count(), 0);
    assert_eq!(h.rec.events().len(), 1);
}

#[test]
fn refused_establish_reports_and_closes() {
    let mut h = harness();
    h.rec.script(|s| s.refuse_established = true);
    let id = h.w.client_connect_via_info(get("/")).expect("connects");

    h.feed(id, b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nx");

    assert!(!h.w.contains(id));
    assert!(h
        .rec
        .of(id)
        .contains(&Ev::Cce("HS: disallowed at ESTABLISHED".to_string())));
    assert_eq!(h.rec.count(id, |e| *e == Ev::Closed), 0);
}

#[test]
fn redirect_reconnects_and_stops_at_the_limit() {
    let mut h = harness();
    let id = h.w.client_connect_via_info(get("/start")).expect("connects");

    for hop in 1..=3 {
        h.feed(id, b"HTTP/1.1 302 Found\r\nLocation: /next\r\nContent-Length: 0\r\n\r\n");
        assert!(h.w.contains(id), "hop {hop} keeps the connection");
        assert_eq!(h.w.conn(id).map(|c| c.client().redirects()), Some(hop));
        let sid = h.socket_of(id);
        assert_eq!(
            h.net.written_text(sid),
            "GET /next HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );
    }

    h.feed(id, b"HTTP/1.1 302 Found\r\nLocation: /next\r\nContent-Length: 0\r\n\r\n");

    assert!(!h.w.contains(id));
    assert_eq!(h.rec.of(id), vec![Ev::Cce("too many redirects".to_string())]);
    assert_eq!(h.w.stats().snapshot().redirects, 3);
    assert_eq!(h.net.opened().len(), 4);
}

#[test]
fn redirect_to_another_host_resolves_it() {
    let mut h = harness();
    h.dns.add("mirror.example.net", &[IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7))]);
    let id = h.w.client_connect_via_info(get("/")).expect("connects");

    h.feed(
        id,
        b"HTTP/1.1 301 Moved\r\nLocation: http://mirror.example.net:8080/x\r\nContent-Length: 0\r\n\r\n",
    );

    let opened = h.net.opened();
    assert_eq!(
        opened.last(),
        Some(&SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)), 8080))
    );
    let sid = h.socket_of(id);
    assert_eq!(
        h.net.written_text(sid),
        "GET /x HTTP/1.1\r\nHost: mirror.example.net\r\n\r\n"
    );
}

#[test]
fn writes_before_establishment_are_dropped() {
    let mut h = harness();
    h.net.set_connect_in_progress(true);
    let id = h.w.client_connect_via_info(get("/")).expect("connects");
    assert_eq!(h.w.conn(id).map(|c| c.state()), Some(LrsState::WaitingConnect));

    let n = h.w.write(id, b"early", WriteKind::Binary.into()).expect("binned, not failed");
    assert_eq!(n, 0);
    assert!(h.net.written(h.socket_of(id)).is_empty());
}

#[test]
fn connect_in_progress_finishes_on_writable() {
    let mut h = harness();
    h.net.set_connect_in_progress(true);
    let id = h.w.client_connect_via_info(get("/late")).expect("connects");
    let sid = h.socket_of(id);
    assert_eq!(h.w.pending_timeout(id), Some(PendingTimeout::AwaitingConnectResponse));

    h.event(sid, wirerole_engine::transport::Interest::POLLOUT);

    assert_eq!(h.net.written_text(sid), "GET /late HTTP/1.1\r\nHost: example.com\r\n\r\n");
    assert_eq!(h.w.conn(id).map(|c| c.state()), Some(LrsState::WaitingServerReply));
}

#[test]
fn header_table_waiter_connects_once_a_table_frees() {
    let config = EngineConfig {
        ah_pool_size: 1,
        ..EngineConfig::default()
    };
    let mut h = harness_with(VhostConfig::default(), config);
    let first = h.w.client_connect_via_info(get("/one")).expect("connects");
    let second = h.w.client_connect_via_info(get("/two")).expect("queued");

    assert!(h.w.conn(second).is_some_and(|c| c.socket_id().is_none()));
    assert_eq!(h.net.opened().len(), 1);

    h.feed(first, b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\n1");

    assert_eq!(h.net.opened().len(), 2);
    let sid = h.socket_of(second);
    assert_eq!(h.net.written_text(sid), "GET /two HTTP/1.1\r\nHost: example.com\r\n\r\n");
}

#[test]
fn client_joins_a_live_parent_only() {
    let mut h = harness();
    let (socket, _) = h.net.socket();
    let parent = h.w.adopt_socket(socket, &RAW).expect("parent");

    let child = h
        .w
        .client_connect_via_info(get("/child").parent(parent))
        .expect("connects");
    assert_eq!(h.w.conn(child).and_then(|c| c.parent()), Some(parent));
    assert_eq!(h.w.conn(parent).map(|c| c.children().to_vec()), Some(vec![child]));

    h.w.close_free(parent, "done");
    assert!(!h.w.contains(child));

    let orphan = h
        .w
        .client_connect_via_info(get("/orphan").parent(parent))
        .expect("connects");
    assert_eq!(h.w.conn(orphan).and_then(|c| c.parent()), None);
}
