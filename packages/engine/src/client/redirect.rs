//! Following a redirect on the same connection object

use arrayvec::ArrayString;
use tracing::{error, info};
use url::Url;

use crate::config::engine::MAX_REDIRECTS;
use crate::conn::{ConnId, LrsState};
use crate::error::{Error, Result};
use crate::headers::HdrToken;
use crate::role::H1;
use crate::service::Worker;
use crate::telemetry::ConnStats;
use crate::vhost::TlsFlags;

/// Where a redirect points, resolved against the current request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    pub tls: bool,
    pub address: String,
    pub port: u16,
    /// Path plus query, starting with '/'
    pub path: String,
}

/// Resolve a `Location` value against the request it answers.
///
/// An absolute path keeps host, port and TLS. An absolute URI decides TLS
/// from its scheme. Anything else is joined to the directory of
/// `current_uri`.
///
/// # Errors
///
/// `Error::Protocol` when the value does not parse or would move a TLS
/// connection to plain text.
pub fn resolve_location(
    location: &str,
    current_tls: bool,
    current_address: &str,
    current_port: u16,
    current_uri: &str,
) -> Result<RedirectTarget> {
    let target = if location.starts_with('/') && !location.starts_with("//") {
        RedirectTarget {
            tls: current_tls,
            address: current_address.to_owned(),
            port: current_port,
            path: location.to_owned(),
        }
    } else if location.contains("://") {
        let url = Url::parse(location).map_err(|_| Error::protocol("HS: URI did not parse"))?;
        from_url(&url)?
    } else {
        let scheme = if current_tls { "https" } else { "http" };
        let base = Url::parse(&format!("{scheme}://{current_address}:{current_port}{current_uri}"))
            .map_err(|_| Error::protocol("HS: URI did not parse"))?;
        let url = base.join(location).map_err(|_| Error::protocol("HS: URI did not parse"))?;
        from_url(&url)?
    };

    if current_tls && !target.tls {
        error!(location, "redirect attempted ssl downgrade");
        return Err(Error::protocol("HS: Redirect attempted SSL downgrade"));
    }
    Ok(target)
}

fn from_url(url: &Url) -> Result<RedirectTarget> {
    let tls = match url.scheme() {
        "https" | "wss" => true,
        "http" | "ws" => false,
        _ => return Err(Error::protocol("HS: URI did not parse")),
    };
    let address = url
        .host_str()
        .ok_or(Error::protocol("HS: URI did not parse"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_owned();
    let port = url.port_or_known_default().unwrap_or(if tls { 443 } else { 80 });
    let mut path = url.path().to_owned();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    Ok(RedirectTarget { tls, address, port, path })
}

/// Copy at most `N` bytes of `value`, cut back to a char boundary
fn carry<const N: usize>(value: Option<&str>) -> ArrayString<N> {
    let mut out = ArrayString::new();
    let Some(value) = value else {
        return out;
    };
    let mut end = value.len().min(N);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    out.push_str(&value[..end]);
    out
}

/// Request fields that survive a redirect
struct Carried {
    origin: ArrayString<300>,
    protocol: ArrayString<300>,
    method: ArrayString<32>,
    iface: ArrayString<16>,
}

impl Worker {
    /// Point the client `id` at `target` and connect again from the top,
    /// keeping the connection object, its header table and the request's
    /// origin, protocol list, method and interface.
    ///
    /// # Errors
    ///
    /// `Error::RedirectLimit` once the connection has followed
    /// [`MAX_REDIRECTS`] redirects; the connection is left untouched and the
    /// caller closes it. Header table failures while rebuilding the request
    /// are terminal and tear the connection down.
    pub fn client_reset(&mut self, id: ConnId, target: &RedirectTarget) -> Result<ConnId> {
        let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;
        if conn.client.redirects >= MAX_REDIRECTS {
            error!(conn = %id, redirects = conn.client.redirects, "too many redirects");
            return Err(Error::RedirectLimit(MAX_REDIRECTS));
        }
        conn.client.redirects += 1;
        ConnStats::bump(&self.stats.redirects);

        let carried = match self.header_table_of(id) {
            Some(ah) => Carried {
                origin: carry(ah.get(HdrToken::ClientOrigin)),
                protocol: carry(ah.get(HdrToken::ClientSentProtocols)),
                method: carry(ah.get(HdrToken::ClientMethod)),
                iface: carry(ah.get(HdrToken::ClientIface)),
            },
            None => return Err(self.client_fail(id, Error::protocol("HS: Redirect failed"))),
        };
        info!(
            conn = %id,
            address = %target.address,
            port = target.port,
            path = %target.path,
            tls = target.tls,
            "redirect"
        );

        self.remove_fds(id);
        self.clear_timeout(id);
        let vhost = {
            let conn = self.conns.get_mut(id).ok_or(Error::Closed)?;
            conn.socket = None;
            conn.peer = None;
            conn.trunc = None;
            conn.socket_is_permanently_unusable = false;
            conn.hdr_parsing_completed = false;
            conn.h2 = Default::default();
            conn.h2n = None;
            conn.flow.free_buffer();
            conn.http = Default::default();
            conn.role_transition(crate::conn::RoleTag::H1Client, LrsState::Unconnected, &H1);

            let client = &mut conn.client;
            client.tls = if target.tls {
                client.tls | TlsFlags::USE_SSL
            } else {
                TlsFlags::from_bits(client.tls.bits() & !TlsFlags::USE_SSL.bits())
            };
            client.c_port = target.port;
            client.hostname = None;
            client.connect_addr = None;
            client.via = Default::default();
            client.proxy_request = None;
            client.keepalive_active = false;
            client.chunked = false;
            client.chunk = Default::default();
            client.chunk_remaining = 0;
            std::mem::take(&mut client.registered).then(|| std::sync::Arc::clone(&conn.vhost))
        };
        if let Some(vhost) = vhost {
            vhost.registry().unregister(self.id, id);
        }

        let rebuilt = match self.header_table_of_mut(id) {
            Some(ah) => {
                ah.reset();
                rebuild(ah, target, &carried).map_err(Error::from)
            }
            None => Err(Error::protocol("HS: Redirect failed")),
        };
        if let Err(err) = rebuilt {
            info!(conn = %id, error = %err, "redirect failed rebuilding the request");
            return Err(self.client_fail(id, Error::protocol("HS: Redirect failed")));
        }

        self.connect_2(id)
    }
}

fn rebuild(
    ah: &mut crate::headers::HeaderTable,
    target: &RedirectTarget,
    carried: &Carried,
) -> std::result::Result<(), crate::error::HeaderTableError> {
    ah.simple_create(HdrToken::ClientPeerAddress, &target.address)?;
    ah.simple_create(HdrToken::ClientHost, &target.address)?;
    let optional = [
        (HdrToken::ClientOrigin, carried.origin.as_str()),
        (HdrToken::ClientSentProtocols, carried.protocol.as_str()),
        (HdrToken::ClientMethod, carried.method.as_str()),
        (HdrToken::ClientIface, carried.iface.as_str()),
    ];
    for (token, value) in optional {
        if !value.is_empty() {
            ah.simple_create(token, value)?;
        }
    }
    ah.simple_create(HdrToken::ClientUri, &target.path)
}
