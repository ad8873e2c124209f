use http::Method;
use wirerole::{connect, TlsFlags, VhostBuilder, Wirerole};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn https_url_sets_tls_port_and_path() {
    init_logging();
    let info = connect("https://api.example.com/v1/models?limit=2")
        .expect("parses")
        .method(&Method::POST)
        .origin("https://app.example.com")
        .build()
        .expect("valid");

    assert_eq!(info.address, "api.example.com");
    assert_eq!(info.port, 443);
    assert_eq!(info.tls, TlsFlags::USE_SSL);
    assert_eq!(info.path, "/v1/models?limit=2");
    assert_eq!(info.host, "api.example.com");
    assert_eq!(info.method.as_deref(), Some("POST"));
    assert_eq!(info.origin.as_deref(), Some("https://app.example.com"));
}

#[test]
fn explicit_port_lands_in_the_host_header() {
    init_logging();
    let info = Wirerole::connect("ws://[::1]:9000/chat")
        .expect("parses")
        .protocol("chat, superchat")
        .pipeline(true)
        .build()
        .expect("valid");

    assert_eq!(info.address, "::1");
    assert_eq!(info.port, 9000);
    assert_eq!(info.tls, TlsFlags::NONE);
    assert_eq!(info.host, "[::1]:9000");
    assert!(info.pipeline);
}

#[test]
fn unsupported_urls_are_config_errors() {
    init_logging();
    let err = connect("ftp://example.com/").expect_err("scheme");
    assert!(err.diagnostic().contains("unsupported scheme"));
    assert!(connect("not a url").is_err());
}

#[test]
fn vhost_builder_parses_proxy_specs() {
    init_logging();
    let vhost = Wirerole::vhost("outbound")
        .dual_stack()
        .http_proxy("user:secret@proxy.local:3128")
        .expect("proxy parses")
        .build()
        .expect("valid vhost");

    let config = vhost.config();
    assert_eq!(vhost.name(), "outbound");
    assert!(config.ipv6);
    let proxy = config.http_proxy.as_ref().expect("proxy set");
    assert_eq!(proxy.address, "proxy.local");
    assert_eq!(proxy.port, 3128);
    assert_eq!(proxy.basic_auth_token.as_deref(), Some("dXNlcjpzZWNyZXQ="));

    assert!(VhostBuilder::named("bad").http_proxy("proxy.local").is_err());
}

#[test]
fn vhost_from_json_validates() {
    init_logging();
    let vhost = VhostBuilder::from_json(r#"{"name":"json","ipv6":true,"fallback_to_raw":true}"#)
        .expect("json parses")
        .build()
        .expect("valid");
    assert!(vhost.config().fallback_to_raw);

    let err = VhostBuilder::from_json(r#"{"name":"bad","ipv6_only":true}"#)
        .expect("json parses")
        .build()
        .expect_err("ipv6_only without ipv6");
    assert_eq!(err.diagnostic(), "ipv6_only requires ipv6");
}
