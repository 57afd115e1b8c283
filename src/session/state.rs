//! Session state machine and the per-state allowed-packet-type predicate.

use crate::packet::PacketType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingVersion,
    AwaitingCryptoCaps,
    KeyExchange,
    Authenticating,
    Streaming,
    Draining,
    Closed,
}

impl SessionState {
    /// Whether `packet_type` is legal to receive while in this state.
    /// Anything outside this set is a protocol error that closes the
    /// session.
    pub fn accepts(self, packet_type: PacketType) -> bool {
        use PacketType::*;
        match self {
            SessionState::AwaitingVersion => matches!(packet_type, ProtocolVersion),
            SessionState::AwaitingCryptoCaps => matches!(packet_type, CryptoCapabilities),
            SessionState::KeyExchange => matches!(packet_type, KeyExchangeResponse | NoEncryption),
            SessionState::Authenticating => matches!(packet_type, AuthResponse),
            SessionState::Streaming => matches!(
                packet_type,
                ClientCapabilities
                    | ImageFrame
                    | AudioBatch
                    | StreamStart
                    | StreamStop
                    | ClientLeave
                    | Ping
                    | Encrypted
            ),
            SessionState::Draining => matches!(packet_type, ClientLeave | Ping | Encrypted),
            SessionState::Closed => false,
        }
    }

    /// Per-state deadline before a non-`Streaming` session is closed for
    /// taking too long. A per-session deadline applies to each
    /// pre-`Streaming` state.
    pub fn deadline(self) -> Option<std::time::Duration> {
        match self {
            SessionState::Streaming | SessionState::Closed => None,
            SessionState::Draining => Some(std::time::Duration::from_millis(500)),
            _ => Some(std::time::Duration::from_secs(10)),
        }
    }

    pub fn is_pre_streaming(self) -> bool {
        matches!(
            self,
            SessionState::AwaitingVersion
                | SessionState::AwaitingCryptoCaps
                | SessionState::KeyExchange
                | SessionState::Authenticating
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn awaiting_version_only_accepts_protocol_version() {
        assert!(SessionState::AwaitingVersion.accepts(PacketType::ProtocolVersion));
        assert!(!SessionState::AwaitingVersion.accepts(PacketType::Ping));
    }

    #[test]
    fn streaming_rejects_server_to_client_only_types() {
        assert!(!SessionState::Streaming.accepts(PacketType::ServerState));
        assert!(!SessionState::Streaming.accepts(PacketType::ClearConsole));
    }

    #[test]
    fn closed_accepts_nothing() {
        assert!(!SessionState::Closed.accepts(PacketType::Ping));
    }

    #[test]
    fn pre_streaming_states_have_a_deadline_streaming_does_not() {
        assert!(SessionState::AwaitingVersion.deadline().is_some());
        assert!(SessionState::Streaming.deadline().is_none());
    }
}
