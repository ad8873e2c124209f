//! SOCKS5 negotiation messages
//!
//! The greeting always offers username/password and no-auth; the proxy
//! picks. The connect request always names the destination as a domain.

use crate::config::SocksAuth;

pub const SOCKS_VERSION_5: u8 = 0x05;
pub const AUTH_NO_AUTH: u8 = 0x00;
pub const AUTH_USERNAME_PASSWORD: u8 = 0x02;
pub const SUBNEGOTIATION_VERSION_1: u8 = 0x01;
pub const SUBNEGOTIATION_SUCCESS: u8 = 0x00;
pub const COMMAND_CONNECT: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const REPLY_SUCCESS: u8 = 0x00;

/// What to do after a greeting reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreetingChoice {
    NoAuth,
    UsernamePassword,
}

#[must_use]
pub fn greeting() -> [u8; 4] {
    [SOCKS_VERSION_5, 0x02, AUTH_USERNAME_PASSWORD, AUTH_NO_AUTH]
}

/// Username/password subnegotiation. `None` without credentials or when a
/// credential is longer than 255 bytes.
#[must_use]
pub fn username_password(auth: &SocksAuth) -> Option<Vec<u8>> {
    let SocksAuth::UsernamePassword { username, password } = auth else {
        return None;
    };
    let ulen = u8::try_from(username.len()).ok()?;
    let plen = u8::try_from(password.len()).ok()?;

    let mut msg = Vec::with_capacity(3 + username.len() + password.len());
    msg.push(SUBNEGOTIATION_VERSION_1);
    msg.push(ulen);
    msg.extend_from_slice(username.as_bytes());
    msg.push(plen);
    msg.extend_from_slice(password.as_bytes());
    Some(msg)
}

/// Connect request for `domain:port`. `None` when the domain does not fit
/// the one byte length field.
#[must_use]
pub fn connect_request(domain: &str, port: u16) -> Option<Vec<u8>> {
    let mut msg = vec![SOCKS_VERSION_5, COMMAND_CONNECT, 0x00, ATYP_DOMAIN, 0];
    msg.extend_from_slice(domain.as_bytes());
    // length goes in once the address is appended
    msg[4] = u8::try_from(domain.len()).ok()?;
    msg.extend_from_slice(&port.to_be_bytes());
    Some(msg)
}

/// Interpret the proxy's method choice
#[must_use]
pub fn parse_greeting_reply(reply: &[u8]) -> Option<GreetingChoice> {
    match reply {
        [SOCKS_VERSION_5, AUTH_NO_AUTH, ..] => Some(GreetingChoice::NoAuth),
        [SOCKS_VERSION_5, AUTH_USERNAME_PASSWORD, ..] => Some(GreetingChoice::UsernamePassword),
        _ => None,
    }
}

#[must_use]
pub fn auth_accepted(reply: &[u8]) -> bool {
    matches!(reply, [SUBNEGOTIATION_VERSION_1, SUBNEGOTIATION_SUCCESS, ..])
}

#[must_use]
pub fn connect_accepted(reply: &[u8]) -> bool {
    matches!(reply, [SOCKS_VERSION_5, REPLY_SUCCESS, ..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_offers_both_methods() {
        assert_eq!(greeting(), [0x05, 0x02, 0x02, 0x00]);
    }

    #[test]
    fn username_password_layout() {
        let auth = SocksAuth::UsernamePassword {
            username: "bob".into(),
            password: "pw".into(),
        };
        assert_eq!(
            username_password(&auth).expect("credentials"),
            [0x01, 3, b'b', b'o', b'b', 2, b'p', b'w']
        );
        assert!(username_password(&SocksAuth::None).is_none());
    }

    #[test]
    fn connect_request_names_a_domain() {
        let msg = connect_request("example.com", 8080).expect("short domain");
        assert_eq!(&msg[..5], &[0x05, 0x01, 0x00, 0x03, 11]);
        assert_eq!(&msg[5..16], b"example.com");
        assert_eq!(&msg[16..], &[0x1f, 0x90]);
        assert!(connect_request(&"a".repeat(256), 80).is_none());
    }

    #[test]
    fn replies_are_classified() {
        assert_eq!(parse_greeting_reply(&[5, 0]), Some(GreetingChoice::NoAuth));
        assert_eq!(parse_greeting_reply(&[5, 2]), Some(GreetingChoice::UsernamePassword));
        assert_eq!(parse_greeting_reply(&[5, 0xff]), None);
        assert_eq!(parse_greeting_reply(&[4, 0]), None);
        assert!(auth_accepted(&[1, 0]));
        assert!(!auth_accepted(&[1, 1]));
        assert!(connect_accepted(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]));
        assert!(!connect_accepted(&[5, 4]));
    }
}
