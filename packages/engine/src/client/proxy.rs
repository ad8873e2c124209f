//! HTTP CONNECT tunnel messages

use crate::config::HttpProxyConfig;

/// Status line prefixes a proxy may answer a successful CONNECT with
const ACCEPTED: [&[u8]; 2] = [b"HTTP/1.0 200 ", b"HTTP/1.1 200 "];

/// Build the CONNECT request sent once the proxy socket is up.
#[must_use]
pub fn connect_request(target_host: &str, target_port: u16, user_agent: &str, proxy: &HttpProxyConfig) -> Vec<u8> {
    let mut request = format!("CONNECT {target_host}:{target_port} HTTP/1.0\r\nUser-agent: {user_agent}\r\n");
    if let Some(token) = &proxy.basic_auth_token {
        request.push_str("Proxy-authorization: basic ");
        request.push_str(token);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request.into_bytes()
}

/// Whether a CONNECT reply opens the tunnel. Only the first 13 bytes are
/// looked at; the rest of the reply is discarded.
#[must_use]
pub fn reply_accepted(reply: &[u8]) -> bool {
    reply.len() >= 13 && ACCEPTED.contains(&&reply[..13])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_without_credentials() {
        let proxy = HttpProxyConfig::new("proxy.local", 3128);
        let request = connect_request("example.com", 443, "wirerole", &proxy);
        assert_eq!(
            String::from_utf8(request).expect("ascii"),
            "CONNECT example.com:443 HTTP/1.0\r\nUser-agent: wirerole\r\n\r\n"
        );
    }

    #[test]
    fn connect_request_carries_basic_auth() {
        let proxy = HttpProxyConfig::new("proxy.local", 3128).with_credentials("user", "pass");
        let request = String::from_utf8(connect_request("example.com", 80, "ua", &proxy)).expect("ascii");
        assert!(request.ends_with("Proxy-authorization: basic dXNlcjpwYXNz\r\n\r\n"));
    }

    #[test]
    fn only_a_200_status_line_is_accepted() {
        assert!(reply_accepted(b"HTTP/1.1 200 Connection established\r\n\r\n"));
        assert!(reply_accepted(b"HTTP/1.0 200 OK\r\n"));
        assert!(!reply_accepted(b"HTTP/1.1 407 Proxy Authentication Required\r\n"));
        assert!(!reply_accepted(b"HTTP/1.1 200"));
    }
}
