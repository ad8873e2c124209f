//! Role tags and connection states
//!
//! A connection is governed by exactly one role at a time. Its fine-grained
//! state moves along a fixed graph; `can_transition_to` is that graph.

/// The wire protocol currently governing a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RoleTag {
    /// Not yet bound to a protocol
    Unbound,
    H1Client,
    H1Server,
    H2Client,
    H2Server,
    /// websocket over HTTP/1
    Ws1Client,
    Ws1Server,
    /// websocket over an HTTP/2 stream
    Ws2Client,
    Ws2Server,
    RawSocket,
    Cgi,
}

impl RoleTag {
    #[must_use]
    pub fn is_client(self) -> bool {
        matches!(self, Self::H1Client | Self::H2Client | Self::Ws1Client | Self::Ws2Client)
    }

    #[must_use]
    pub fn is_http_client(self) -> bool {
        matches!(self, Self::H1Client | Self::H2Client)
    }

    #[must_use]
    pub fn is_h2(self) -> bool {
        matches!(self, Self::H2Client | Self::H2Server)
    }

    #[must_use]
    pub fn is_ws(self) -> bool {
        matches!(
            self,
            Self::Ws1Client | Self::Ws1Server | Self::Ws2Client | Self::Ws2Server
        )
    }

    #[must_use]
    pub fn is_raw(self) -> bool {
        matches!(self, Self::RawSocket)
    }
}

/// Fine-grained connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LrsState {
    Unconnected,
    WaitingConnect,
    WaitingProxyReply,
    WaitingSocksGreetingReply,
    WaitingSocksAuthReply,
    WaitingSocksConnectReply,
    /// Connected, about to start the handshake
    IssueHandshake,
    /// Ready to send request headers, possibly on a host connection
    IssueHandshake2,
    WaitingSsl,
    H2ClientSendSettings,
    H2WaitingToSendHeaders,
    IssueHttpBody,
    WaitingServerReply,
    Headers,
    Body,
    Established,
    ReturnedClose,
    WaitingToSendClose,
    AwaitingCloseAck,
    FlushingBeforeClose,
    Shutdown,
    DeadSocket,
}

impl LrsState {
    /// Close handshake in progress: only control packets matter
    #[must_use]
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            Self::ReturnedClose | Self::WaitingToSendClose | Self::AwaitingCloseAck
        )
    }

    /// States in which payload writes reach the wire
    #[must_use]
    pub fn accepts_payload(self) -> bool {
        matches!(
            self,
            Self::Established
                | Self::H2WaitingToSendHeaders
                | Self::WaitingServerReply
                | Self::IssueHttpBody
                | Self::Headers
                | Self::Body
        )
    }

    /// Whether a POLLOUT may be acted on in this state
    #[must_use]
    pub fn can_handle_pollout(self) -> bool {
        !matches!(self, Self::Unconnected | Self::DeadSocket | Self::Shutdown)
    }

    /// The legal transition graph. Every state may be left for the
    /// teardown states; everything else is listed edge by edge.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use LrsState::{
            AwaitingCloseAck, Body, DeadSocket, Established, FlushingBeforeClose, H2ClientSendSettings,
            H2WaitingToSendHeaders, Headers, IssueHandshake, IssueHandshake2, IssueHttpBody, ReturnedClose, Shutdown,
            Unconnected, WaitingConnect, WaitingProxyReply, WaitingServerReply, WaitingSocksAuthReply,
            WaitingSocksConnectReply, WaitingSocksGreetingReply, WaitingSsl, WaitingToSendClose,
        };

        if self == next {
            return true;
        }
        match (self, next) {
            (DeadSocket, _) => false,
            (Shutdown, next) => next == DeadSocket,
            (FlushingBeforeClose, next) => matches!(next, Shutdown | DeadSocket),
            (_, FlushingBeforeClose | Shutdown | DeadSocket) => true,

            (Unconnected, next) => matches!(
                next,
                WaitingConnect | IssueHandshake2 | H2WaitingToSendHeaders | Headers | Established
            ),
            (WaitingConnect, next) => matches!(
                next,
                WaitingSsl | WaitingProxyReply | WaitingSocksGreetingReply | IssueHandshake
            ),
            (WaitingSsl | WaitingProxyReply | WaitingSocksConnectReply, next) => next == IssueHandshake,
            (WaitingSocksGreetingReply, next) => matches!(next, WaitingSocksAuthReply | WaitingSocksConnectReply),
            (WaitingSocksAuthReply, next) => next == WaitingSocksConnectReply,
            (IssueHandshake, next) => matches!(next, H2ClientSendSettings | IssueHandshake2),
            (H2ClientSendSettings, next) => next == H2WaitingToSendHeaders,
            // a queued waiter restarts on its own connection
            (IssueHandshake2, next) => matches!(next, IssueHttpBody | WaitingServerReply | Unconnected),
            (H2WaitingToSendHeaders, next) => matches!(next, IssueHttpBody | WaitingServerReply | Established),
            (IssueHttpBody, next) => next == WaitingServerReply,
            // redirects start over from Unconnected
            (WaitingServerReply, next) => matches!(next, Established | Unconnected),
            (Headers, next) => matches!(next, Body | Established),
            (Body, next) => matches!(next, Headers | Established),
            (Established, next) => matches!(
                next,
                WaitingServerReply | Unconnected | ReturnedClose | WaitingToSendClose
            ),
            (WaitingToSendClose, next) => next == AwaitingCloseAck,
            (ReturnedClose | AwaitingCloseAck, _) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_states_never_reopen() {
        assert!(!LrsState::ReturnedClose.can_transition_to(LrsState::Established));
        assert!(!LrsState::AwaitingCloseAck.can_transition_to(LrsState::Unconnected));
        assert!(LrsState::WaitingToSendClose.can_transition_to(LrsState::AwaitingCloseAck));
        assert!(LrsState::AwaitingCloseAck.can_transition_to(LrsState::DeadSocket));
        assert!(!LrsState::DeadSocket.can_transition_to(LrsState::Shutdown));
    }

    #[test]
    fn connect_phase_is_entered_only_from_unconnected() {
        assert!(LrsState::Unconnected.can_transition_to(LrsState::WaitingConnect));
        assert!(LrsState::WaitingConnect.can_transition_to(LrsState::WaitingSocksGreetingReply));
        assert!(!LrsState::Established.can_transition_to(LrsState::WaitingConnect));
        assert!(LrsState::WaitingServerReply.can_transition_to(LrsState::Unconnected));
    }

    #[test]
    fn unlisted_edges_are_refused() {
        assert!(!LrsState::Unconnected.can_transition_to(LrsState::WaitingServerReply));
        assert!(!LrsState::Unconnected.can_transition_to(LrsState::AwaitingCloseAck));
        assert!(!LrsState::WaitingProxyReply.can_transition_to(LrsState::Established));
        assert!(!LrsState::WaitingSocksAuthReply.can_transition_to(LrsState::WaitingSocksGreetingReply));
        assert!(!LrsState::IssueHttpBody.can_transition_to(LrsState::IssueHandshake2));
        assert!(!LrsState::Headers.can_transition_to(LrsState::WaitingToSendClose));
        assert!(!LrsState::Shutdown.can_transition_to(LrsState::FlushingBeforeClose));
        assert!(!LrsState::FlushingBeforeClose.can_transition_to(LrsState::AwaitingCloseAck));
    }

    #[test]
    fn client_and_websocket_paths_are_listed() {
        let client = [
            LrsState::Unconnected,
            LrsState::WaitingConnect,
            LrsState::WaitingSocksGreetingReply,
            LrsState::WaitingSocksAuthReply,
            LrsState::WaitingSocksConnectReply,
            LrsState::IssueHandshake,
            LrsState::IssueHandshake2,
            LrsState::IssueHttpBody,
            LrsState::WaitingServerReply,
            LrsState::Established,
        ];
        for pair in client.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }

        let closing = [
            LrsState::Established,
            LrsState::WaitingToSendClose,
            LrsState::AwaitingCloseAck,
            LrsState::DeadSocket,
        ];
        for pair in closing.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
        assert!(LrsState::Established.can_transition_to(LrsState::ReturnedClose));
        assert!(LrsState::ReturnedClose.can_transition_to(LrsState::FlushingBeforeClose));
        assert!(LrsState::Headers.can_transition_to(LrsState::Established));
    }
}
