//! End-to-end scenarios driven directly against the `Session` state machine
//! (no sockets): each test walks the exact packet sequence a real client
//! would send and asserts on the server's replies.

use glyphcast::config::{EncryptionPolicy, KeyMaterial, NullKeyResolver, ServerConfig};
use glyphcast::crypto::handshake::*;
use glyphcast::crypto::EphemeralKeyPair;
use glyphcast::packet::{self, AuthFailReason, ColorLevel, PacketType, PaletteId, RenderMode, TerminalCapabilities};
use glyphcast::session::{HandshakePolicy, Session, SessionState};
use pretty_assertions::assert_eq;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

fn addr() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 9000)
}

fn offer(auth: AuthAlgos) -> CryptoCapabilitiesPayload {
    CryptoCapabilitiesPayload { kex: KexAlgos::X25519, auth, cipher: CipherAlgos::XSALSA20_POLY1305 }
}

fn send_version(session: &mut Session) {
    let mut buf = Vec::new();
    ProtocolVersionPayload {
        major: PROTOCOL_MAJOR,
        minor: PROTOCOL_MINOR,
        supports_encryption: true,
        compression_algos_bitmap: 0,
        compression_threshold_pct: 90,
        feature_flags: 0,
    }
    .encode(&mut buf);
    let outcome = session.handle_packet(PacketType::ProtocolVersion, 1, &buf).unwrap();
    assert!(outcome.send.is_empty());
    assert_eq!(session.state, SessionState::AwaitingCryptoCaps);
}

/// Walks version + crypto-caps + key-exchange and returns the `AUTH_CHALLENGE`
/// nonce the server issued (password/signature auth is always required once
/// this path is reached with a non-`NONE` auth offer).
fn do_key_exchange(session: &mut Session, auth: AuthAlgos) -> [u8; 32] {
    send_version(session);

    let mut caps_buf = Vec::new();
    offer(auth).encode(&mut caps_buf);
    let outcome = session.handle_packet(PacketType::CryptoCapabilities, 1, &caps_buf).unwrap();
    assert_eq!(session.state, SessionState::KeyExchange);
    assert_eq!(outcome.send.len(), 2);
    assert_eq!(outcome.send[0].0, PacketType::CryptoParameters);
    assert_eq!(outcome.send[1].0, PacketType::KeyExchangeInit);
    let server_kex = KeyExchangePayload::decode(&outcome.send[1].1).unwrap();

    let client_ephemeral = EphemeralKeyPair::generate();
    let client_public = client_ephemeral.public;
    let _client_secret = client_ephemeral.diffie_hellman(&server_kex.public_key);

    let mut response_buf = Vec::new();
    KeyExchangePayload { public_key: client_public }.encode(&mut response_buf);
    let outcome = session.handle_packet(PacketType::KeyExchangeResponse, 1, &response_buf).unwrap();
    assert_eq!(outcome.send[0].0, PacketType::AuthChallenge);
    AuthChallengePayload::decode(&outcome.send[0].1).unwrap().nonce
}

#[test]
fn scenario_1_loopback_ping_over_password_auth() {
    let config = ServerConfig {
        encryption_policy: EncryptionPolicy::OptIn,
        key_material: Some(KeyMaterial::Password("hunter2aaaa".to_string())),
        ..Default::default()
    };
    let policy = Arc::new(HandshakePolicy::from_config(&config, &NullKeyResolver).unwrap());
    let mut session = Session::new(addr(), policy.clone());

    let challenge = do_key_exchange(&mut session, AuthAlgos::PASSWORD);
    assert_eq!(session.state, SessionState::Authenticating);

    let password_key = policy.password_key.expect("password configured");
    let proof = hmac_challenge(&password_key, &challenge);
    let mut resp_buf = Vec::new();
    AuthResponsePayload { proof }.encode(&mut resp_buf);
    let outcome = session.handle_packet(PacketType::AuthResponse, 1, &resp_buf).unwrap();
    assert!(!outcome.close);
    assert_eq!(outcome.send[0].0, PacketType::HandshakeComplete);
    assert_eq!(session.state, SessionState::Streaming);
    assert!(session.crypto.is_some());

    // HANDSHAKE_COMPLETE is the packet that activates the key; it still has
    // to reach the client in the clear even though crypto is already live.
    let (handshake_type, handshake_payload) =
        session.wrap_for_send(outcome.send[0].0, outcome.send[0].1.clone()).unwrap();
    assert_eq!(handshake_type, PacketType::HandshakeComplete);
    assert!(handshake_payload.is_empty());

    let outcome = session.handle_packet(PacketType::Ping, 1, &[]).unwrap();
    assert_eq!(outcome.send, vec![(PacketType::Pong, Vec::new())]);

    // Replies leave this session wrapped as ENCRYPTED once a key is live.
    let (wrapped_type, wrapped_payload) = session.wrap_for_send(PacketType::Pong, Vec::new()).unwrap();
    assert_eq!(wrapped_type, PacketType::Encrypted);
    assert!(!wrapped_payload.is_empty());
}

#[test]
fn scenario_4_wrong_password_is_rejected_and_session_closes() {
    let config = ServerConfig {
        encryption_policy: EncryptionPolicy::OptIn,
        key_material: Some(KeyMaterial::Password("hunter2aaaa".to_string())),
        ..Default::default()
    };
    let policy = Arc::new(HandshakePolicy::from_config(&config, &NullKeyResolver).unwrap());
    let mut session = Session::new(addr(), policy);

    send_version(&mut session);
    let mut caps_buf = Vec::new();
    offer(AuthAlgos::PASSWORD).encode(&mut caps_buf);
    let outcome = session.handle_packet(PacketType::CryptoCapabilities, 1, &caps_buf).unwrap();
    let server_kex = KeyExchangePayload::decode(&outcome.send[1].1).unwrap();

    let client_ephemeral = EphemeralKeyPair::generate();
    let mut kex_resp = Vec::new();
    KeyExchangePayload { public_key: client_ephemeral.public }.encode(&mut kex_resp);
    let outcome = session.handle_packet(PacketType::KeyExchangeResponse, 1, &kex_resp).unwrap();
    assert_eq!(outcome.send[0].0, PacketType::AuthChallenge);
    let challenge = AuthChallengePayload::decode(&outcome.send[0].1).unwrap().nonce;
    let _ = server_kex; // only needed if the test wanted the shared secret

    let wrong_proof = hmac_challenge(b"not the right key at all", &challenge);
    let mut resp_buf = Vec::new();
    AuthResponsePayload { proof: wrong_proof }.encode(&mut resp_buf);
    let outcome = session.handle_packet(PacketType::AuthResponse, 1, &resp_buf).unwrap();

    assert!(outcome.close);
    assert_eq!(outcome.send[0].0, PacketType::AuthFailed);
    let failed = AuthFailedPayload::decode(&outcome.send[0].1).unwrap();
    assert_eq!(failed.reason, AuthFailReason::PASSWORD_INCORRECT);
}

#[test]
fn scenario_6_no_encryption_rejected_when_encryption_required() {
    let config = ServerConfig { encryption_policy: EncryptionPolicy::Required, ..Default::default() };
    let policy = Arc::new(HandshakePolicy::from_config(&config, &NullKeyResolver).unwrap());
    let mut session = Session::new(addr(), policy);

    send_version(&mut session);
    let mut caps_buf = Vec::new();
    offer(AuthAlgos::NONE).encode(&mut caps_buf);
    session.handle_packet(PacketType::CryptoCapabilities, 1, &caps_buf).unwrap();
    assert_eq!(session.state, SessionState::KeyExchange);

    let outcome = session.handle_packet(PacketType::NoEncryption, 1, &[]).unwrap();
    assert!(outcome.close);
    assert_eq!(outcome.send[0].0, PacketType::AuthFailed);
    let failed = AuthFailedPayload::decode(&outcome.send[0].1).unwrap();
    assert_eq!(failed.reason, AuthFailReason::PASSWORD_REQUIRED);
}

#[test]
fn scenario_2_listener_receives_a_tiled_render_of_the_other_source() {
    let config = ServerConfig { encryption_policy: EncryptionPolicy::Off, ..Default::default() };
    let policy = Arc::new(HandshakePolicy::from_config(&config, &NullKeyResolver).unwrap());

    let mut a = Session::new(addr(), policy.clone());
    let mut b = Session::new(addr(), policy);
    a.terminal_caps = Some(TerminalCapabilities {
        color_level: ColorLevel::Ansi256,
        render_mode: RenderMode::Background,
        cell_width: 10,
        cell_height: 4,
        utf8: true,
        desired_fps: 30,
        palette: PaletteId::Blocks,
        custom_palette: String::new(),
        capability_flags: packet::CapabilityFlags::VIDEO,
        display_name: "A".to_string(),
    });
    a.enter_state(SessionState::Streaming);
    b.enter_state(SessionState::Streaming);

    // B sends a solid-red 160x120 IMAGE_FRAME.
    let rgb = vec_of_red(160 * 120);
    let stored = glyphcast::buffers::encode_stored_frame(160, 120, &rgb);
    b.video_buffer.write(b.id, 0, &stored);

    let registry = glyphcast::render::PaletteRegistry::new();
    let ctx = glyphcast::session::OutboundContext { palette_registry: &registry };
    let sources = vec![(a.id, a.video_buffer.clone()), (b.id, b.video_buffer.clone())];
    let (packet_type, payload) = a.build_video_tick(&sources, &ctx).unwrap();
    assert_eq!(packet_type, PacketType::AsciiFrame);

    let header = packet::AsciiFrameHeader::decode(&payload).unwrap();
    let body = &payload[packet::AsciiFrameHeader::LEN..];
    let rendered = if header.compressed_size != 0 {
        use std::io::Read;
        let mut out = Vec::new();
        flate2::read::DeflateDecoder::new(body).read_to_end(&mut out).unwrap();
        out
    } else {
        body.to_vec()
    };
    let text = String::from_utf8(rendered).unwrap();
    // solid red in 256-color background mode uses bg SGR color-cube index 196.
    assert!(text.contains("\x1b[48;5;196m"));
}

fn vec_of_red(pixels: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(pixels * 3);
    for _ in 0..pixels {
        out.extend_from_slice(&[255, 0, 0]);
    }
    out
}
