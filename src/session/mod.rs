//! Per-connection session state machine, terminal capability record, and
//! the inbound/outbound task bodies that drive a live session.

mod handshake_policy;
mod inbound;
pub mod outbound;
mod state;

pub use handshake_policy::HandshakePolicy;
pub use inbound::InboundOutcome;
pub use outbound::{build_clear_console, build_server_state, OutboundContext};
pub use state::SessionState;

use crate::buffers::{AudioRingBuffer, FrameBuffer, AUDIO_RING_CAPACITY, VIDEO_FRAME_BUFFER_CAPACITY};
use crate::crypto::{cipher, EphemeralKeyPair, NegotiatedSuite, SessionKey};
use crate::packet::{CapabilityFlags, TerminalCapabilities};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub type SessionId = u32;

static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

pub fn next_session_id() -> SessionId {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Live crypto material for a session once the handshake has completed.
/// Cloned into the inbound and outbound tasks at `HANDSHAKE_COMPLETE`; the
/// key never changes afterward, only the send counter advances.
#[derive(Clone)]
pub struct SessionCrypto {
    pub key: SessionKey,
    pub send_counter: Arc<cipher::NonceCounter>,
}

/// Everything a live TCP connection owns: identity, negotiated terminal
/// capabilities, the state machine, per-direction frame/audio buffers, and
/// in-progress handshake material. Inbound and outbound tasks each hold an
/// `Arc<parking_lot::Mutex<Session>>` (or operate on split fields) —
/// [`crate::server`] decides the concrete sharing strategy.
pub struct Session {
    pub id: SessionId,
    pub remote_addr: SocketAddr,
    pub state: SessionState,
    pub state_entered_at: Instant,
    pub created_at: Instant,

    pub display_name: String,
    pub capability_flags: CapabilityFlags,
    pub terminal_caps: Option<TerminalCapabilities>,
    pub sending_video: bool,
    pub sending_audio: bool,

    pub video_buffer: Arc<FrameBuffer>,
    pub audio_buffer: Arc<AudioRingBuffer>,

    pub policy: Arc<HandshakePolicy>,
    server_ephemeral: Option<EphemeralKeyPair>,
    negotiated_suite: Option<NegotiatedSuite>,
    auth_challenge: Option<[u8; 32]>,
    client_public_key: Option<[u8; 32]>,
    shared_secret: Option<[u8; 32]>,

    pub crypto: Option<SessionCrypto>,
    pub recv_guard: cipher::NonceGuard,
}

impl Session {
    pub fn new(remote_addr: SocketAddr, policy: Arc<HandshakePolicy>) -> Self {
        let now = Instant::now();
        Self {
            id: next_session_id(),
            remote_addr,
            state: SessionState::AwaitingVersion,
            state_entered_at: now,
            created_at: now,
            display_name: String::new(),
            capability_flags: CapabilityFlags::empty(),
            terminal_caps: None,
            sending_video: false,
            sending_audio: false,
            video_buffer: Arc::new(FrameBuffer::new(VIDEO_FRAME_BUFFER_CAPACITY)),
            audio_buffer: Arc::new(AudioRingBuffer::new(AUDIO_RING_CAPACITY)),
            policy,
            server_ephemeral: None,
            negotiated_suite: None,
            auth_challenge: None,
            client_public_key: None,
            shared_secret: None,
            crypto: None,
            recv_guard: cipher::NonceGuard::new(),
        }
    }

    pub fn enter_state(&mut self, state: SessionState) {
        self.state = state;
        self.state_entered_at = Instant::now();
    }

    pub fn deadline_expired(&self, now: Instant) -> bool {
        match self.state.deadline() {
            Some(deadline) => now.duration_since(self.state_entered_at) > deadline,
            None => false,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.state == SessionState::Streaming
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncryptionPolicy, ServerConfig};
    use std::net::{SocketAddr, Ipv4Addr};

    fn policy() -> Arc<HandshakePolicy> {
        let config = ServerConfig { encryption_policy: EncryptionPolicy::Off, ..Default::default() };
        Arc::new(HandshakePolicy::from_config(&config, &crate::config::NullKeyResolver).unwrap())
    }

    #[test]
    fn new_session_starts_in_awaiting_version() {
        let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 9000);
        let session = Session::new(addr, policy());
        assert_eq!(session.state, SessionState::AwaitingVersion);
        assert!(!session.is_streaming());
    }

    #[test]
    fn session_ids_are_unique_and_monotonic() {
        let a = next_session_id();
        let b = next_session_id();
        assert!(b > a);
    }
}
