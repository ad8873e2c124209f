//! HTTP CONNECT and SOCKS5 negotiation

mod common;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use common::{harness_with, Ev};
use wirerole_engine::client::ConnectInfo;
use wirerole_engine::config::{EngineConfig, HttpProxyConfig, SocksProxyConfig, VhostConfig};
use wirerole_engine::conn::{LrsState, PendingTimeout};

const PROXY_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);

fn get() -> ConnectInfo {
    ConnectInfo::new("example.com", 80).path("/p")
}

#[test]
fn http_proxy_tunnels_then_sends_the_request() {
    let vhost = VhostConfig::default().with_http_proxy(HttpProxyConfig::new("10.0.0.9", 3128));
    let mut h = harness_with(vhost, EngineConfig::default());
    let id = h.w.client_connect_via_info(get()).expect("connects");
    let sid = h.socket_of(id);

    assert_eq!(h.net.opened(), vec![SocketAddr::new(IpAddr::V4(PROXY_IP), 3128)]);
    let ua = &EngineConfig::default().user_agent;
    assert_eq!(
        h.net.written_text(sid),
        format!("CONNECT example.com:80 HTTP/1.0\r\nUser-agent: {ua}\r\n\r\n")
    );
    assert_eq!(h.w.conn(id).map(|c| c.state()), Some(LrsState::WaitingProxyReply));
    assert_eq!(h.w.pending_timeout(id), Some(PendingTimeout::AwaitingProxyResponse));

    h.net.clear_written(sid);
    h.feed(id, b"HTTP/1.0 200 Connection established\r\n\r\n");

    assert_eq!(h.net.written_text(sid), "GET /p HTTP/1.1\r\nHost: example.com\r\n\r\n");
    assert_eq!(h.w.conn(id).map(|c| c.state()), Some(LrsState::WaitingServerReply));
}

#[test]
fn http_proxy_refusal_is_a_connection_error() {
    let vhost = VhostConfig::default().with_http_proxy(HttpProxyConfig::new("10.0.0.9", 3128));
    let mut h = harness_with(vhost, EngineConfig::default());
    let id = h.w.client_connect_via_info(get()).expect("connects");

    h.feed(id, b"HTTP/1.0 407 Proxy Authentication Required\r\n\r\n");

    assert!(!h.w.contains(id));
    assert_eq!(h.rec.of(id), vec![Ev::Cce("proxy reply".to_string())]);
}

#[test]
fn socks_without_auth_connects_by_name() {
    let vhost = VhostConfig::default().with_socks_proxy(SocksProxyConfig::no_auth("10.0.0.9", 1080));
    let mut h = harness_with(vhost, EngineConfig::default());
    let id = h.w.client_connect_via_info(get()).expect("connects");
    let sid = h.socket_of(id);

    assert_eq!(h.net.opened(), vec![SocketAddr::new(IpAddr::V4(PROXY_IP), 1080)]);
    assert_eq!(h.net.written(sid), vec![5, 2, 2, 0]);
    assert_eq!(h.w.conn(id).map(|c| c.state()), Some(LrsState::WaitingSocksGreetingReply));

    h.net.clear_written(sid);
    h.feed(id, &[5, 0]);
    let mut request = vec![5, 1, 0, 3, 11];
    request.extend_from_slice(b"example.com");
    request.extend_from_slice(&80u16.to_be_bytes());
    assert_eq!(h.net.written(sid), request);
    assert_eq!(h.w.conn(id).map(|c| c.state()), Some(LrsState::WaitingSocksConnectReply));

    h.net.clear_written(sid);
    h.feed(id, &[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
    assert_eq!(h.net.written_text(sid), "GET /p HTTP/1.1\r\nHost: example.com\r\n\r\n");
    assert!(h.dns.lookups().iter().all(|host| host != "example.com"));
}

#[test]
fn socks_with_credentials_authenticates_first() {
    let socks = SocksProxyConfig::with_auth("10.0.0.9", 1080, "user", "pw");
    let vhost = VhostConfig::default().with_socks_proxy(socks);
    let mut h = harness_with(vhost, EngineConfig::default());
    let id = h.w.client_connect_via_info(get()).expect("connects");
    let sid = h.socket_of(id);

    h.net.clear_written(sid);
    h.feed(id, &[5, 2]);
    let mut auth = vec![1, 4];
    auth.extend_from_slice(b"user");
    auth.push(2);
    auth.extend_from_slice(b"pw");
    assert_eq!(h.net.written(sid), auth);
    assert_eq!(h.w.conn(id).map(|c| c.state()), Some(LrsState::WaitingSocksAuthReply));

    h.feed(id, &[1, 0]);
    assert_eq!(h.w.conn(id).map(|c| c.state()), Some(LrsState::WaitingSocksConnectReply));
}

#[test]
fn socks_rejection_is_reported_once() {
    let vhost = VhostConfig::default().with_socks_proxy(SocksProxyConfig::no_auth("10.0.0.9", 1080));
    let mut h = harness_with(vhost, EngineConfig::default());
    let id = h.w.client_connect_via_info(get()).expect("connects");

    h.feed(id, &[5, 0xff]);

    assert!(!h.w.contains(id));
    assert_eq!(h.rec.count(id, |e| matches!(e, Ev::Cce(_))), 1);
}
