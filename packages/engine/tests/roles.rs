//! Raw sockets and sub-process stdio channels

mod common;

use common::{harness, Ev};
use wirerole_engine::conn::RoleTag;
use wirerole_engine::role::{CgiChannel, RAW};
use wirerole_engine::transport::Interest;

#[test]
fn raw_socket_echoes_and_reports_close() {
    let mut h = harness();
    h.rec.script(|s| s.raw_echo = true);
    let (socket, sid) = h.net.socket();
    let id = h.w.adopt_socket(socket, &RAW).expect("adopted");

    assert_eq!(h.w.conn(id).map(|c| c.role()), Some(RoleTag::RawSocket));
    assert_eq!(h.rec.of(id), vec![Ev::RawAdopt]);

    h.net.push(sid, b"ping");
    h.event(sid, Interest::POLLIN);
    assert_eq!(h.net.written(sid), b"ping");

    h.event(sid, Interest::POLLHUP);

    assert!(!h.w.contains(id));
    assert_eq!(
        h.rec.of(id),
        vec![Ev::RawAdopt, Ev::RawRx(b"ping".to_vec()), Ev::RawClose]
    );
}

#[test]
fn raw_writeable_is_one_shot() {
    let mut h = harness();
    let (socket, sid) = h.net.socket();
    let id = h.w.adopt_socket(socket, &RAW).expect("adopted");

    h.w.callback_on_writable(id).expect("armed");
    assert!(h.w.pollfd_events(id).contains(Interest::POLLOUT));

    h.event(sid, Interest::POLLOUT);

    assert_eq!(h.rec.count(id, |e| *e == Ev::RawWriteable), 1);
    assert!(!h.w.pollfd_events(id).contains(Interest::POLLOUT));
}

#[test]
fn cgi_channels_notify_the_parent_and_close_on_exit() {
    let mut h = harness();
    let (socket, _) = h.net.socket();
    let parent = h.w.adopt_socket(socket, &RAW).expect("parent");

    let (stdout, stdout_sid) = h.net.socket();
    let out = h
        .w
        .adopt_cgi_channel(parent, stdout, CgiChannel::Stdout)
        .expect("stdout");
    let (stdin, stdin_sid) = h.net.socket();
    let inp = h.w.adopt_cgi_channel(parent, stdin, CgiChannel::Stdin).expect("stdin");

    assert_eq!(h.w.conn(parent).map(|c| c.children().len()), Some(2));
    assert_eq!(h.w.conn(out).and_then(|c| c.cgi_channel()), Some(CgiChannel::Stdout));
    assert!(h.w.pollfd_events(inp).contains(Interest::POLLOUT));

    h.net.push(stdout_sid, b"Status: 200\r\n");
    h.event(stdout_sid, Interest::POLLIN);
    h.event(stdin_sid, Interest::POLLOUT);

    assert!(h.rec.of(parent).contains(&Ev::Cgi(CgiChannel::Stdout)));
    assert!(h.rec.of(parent).contains(&Ev::Cgi(CgiChannel::Stdin)));
    assert!(!h.w.pollfd_events(inp).contains(Interest::POLLOUT));

    h.reaper.exited(parent);
    h.advance(2);

    assert!(!h.w.contains(out));
    assert!(!h.w.contains(inp));
    assert!(h.w.contains(parent));
    assert_eq!(h.rec.count(parent, |e| *e == Ev::CgiTerminated), 1);
    assert!(h.w.conn(parent).is_some_and(|c| c.children().is_empty()));
}

#[test]
fn closing_a_parent_takes_its_channels() {
    let mut h = harness();
    let (socket, _) = h.net.socket();
    let parent = h.w.adopt_socket(socket, &RAW).expect("parent");
    let (stderr, _) = h.net.socket();
    let err = h
        .w
        .adopt_cgi_channel(parent, stderr, CgiChannel::Stderr)
        .expect("stderr");

    h.w.close_free(parent, "done");

    assert!(!h.w.contains(err));
    assert_eq!(h.rec.count(parent, |e| *e == Ev::RawClose), 1);
    assert_eq!(h.w.stats().snapshot().live(), 0);
}

#[test]
fn cgi_writable_service_tells_the_parent() {
    let mut h = harness();
    let (socket, _) = h.net.socket();
    let parent = h.w.adopt_socket(socket, &RAW).expect("parent");
    let (stdin, _) = h.net.socket();
    let inp = h.w.adopt_cgi_channel(parent, stdin, CgiChannel::Stdin).expect("stdin");

    h.w.handle_pollout(inp).expect("serviced");

    assert_eq!(h.rec.of(parent), vec![Ev::RawAdopt, Ev::Cgi(CgiChannel::Stdin)]);
    assert!(h.rec.of(inp).is_empty());
    assert!(!h.w.pollfd_events(inp).contains(Interest::POLLOUT));
}
