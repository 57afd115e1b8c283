//! Inbound packet dispatch: one call per received packet, driving the
//! state machine and producing whatever plaintext replies the handshake
//! requires.

use super::state::SessionState;
use super::{Session, SessionCrypto};
use crate::crypto::handshake::*;
use crate::crypto::{cipher, EphemeralKeyPair, NegotiatedSuite};
use crate::error::{CoreError, Result};
use crate::packet::{
    self, AuthFailReason, PacketType, TerminalCapabilities,
};
use rand::RngCore;

/// What the caller (the inbound task owning the socket) should do after a
/// packet has been processed.
#[derive(Default)]
pub struct InboundOutcome {
    pub send: Vec<(PacketType, Vec<u8>)>,
    pub close: bool,
}

impl InboundOutcome {
    fn none() -> Self {
        Self::default()
    }

    fn reply(packet_type: PacketType, payload: Vec<u8>) -> Self {
        Self { send: vec![(packet_type, payload)], close: false }
    }

    fn close_with(packet_type: PacketType, payload: Vec<u8>) -> Self {
        Self { send: vec![(packet_type, payload)], close: true }
    }

    fn close_silently() -> Self {
        Self { send: Vec::new(), close: true }
    }
}

const CONTEXT_LABEL: &[u8] = b"glyphcast-data-plane-v1";

/// The mixer only ever mixes mono frames (`build_audio_tick` always encodes
/// `channels: 1`); an `AUDIO_BATCH` claiming otherwise can't be mixed.
const EXPECTED_AUDIO_CHANNELS: u32 = 1;

/// Normalizes any supported `IMAGE_FRAME` pixel format to tightly packed
/// RGB24, which is all the renderer (§4.6) ever consumes.
fn to_rgb24(format: packet::PixelFormat, pixels: &[u8]) -> Vec<u8> {
    use packet::PixelFormat::*;
    match format {
        Rgb => pixels.to_vec(),
        Bgr => pixels.chunks_exact(3).flat_map(|p| [p[2], p[1], p[0]]).collect(),
        Rgba => pixels.chunks_exact(4).flat_map(|p| [p[0], p[1], p[2]]).collect(),
        Bgra => pixels.chunks_exact(4).flat_map(|p| [p[2], p[1], p[0]]).collect(),
    }
}

impl Session {
    /// Processes one already-decrypted packet. `payload` is the packet's
    /// inner payload (post-AEAD-open if it arrived wrapped in
    /// `PACKET_TYPE_ENCRYPTED`).
    pub fn handle_packet(&mut self, packet_type: PacketType, client_id: u32, payload: &[u8]) -> Result<InboundOutcome> {
        if packet_type.is_server_to_client_only() {
            return Err(CoreError::protocol(format!("{packet_type:?} is server-to-client only")));
        }
        if !self.state.accepts(packet_type) {
            return Err(CoreError::protocol(format!(
                "packet {packet_type:?} not valid in state {:?}",
                self.state
            )));
        }

        match self.state {
            SessionState::AwaitingVersion => self.handle_version(payload),
            SessionState::AwaitingCryptoCaps => self.handle_crypto_caps(payload),
            SessionState::KeyExchange => self.handle_key_exchange(packet_type, payload),
            SessionState::Authenticating => self.handle_auth_response(payload),
            SessionState::Streaming => self.handle_streaming(packet_type, client_id, payload),
            SessionState::Draining | SessionState::Closed => Ok(InboundOutcome::none()),
        }
    }

    fn handle_version(&mut self, payload: &[u8]) -> Result<InboundOutcome> {
        let version = ProtocolVersionPayload::decode(payload)?;
        if version.major != PROTOCOL_MAJOR {
            return Err(CoreError::protocol(format!(
                "protocol major mismatch: peer={} ours={}",
                version.major, PROTOCOL_MAJOR
            )));
        }
        self.enter_state(SessionState::AwaitingCryptoCaps);
        Ok(InboundOutcome::none())
    }

    fn handle_crypto_caps(&mut self, payload: &[u8]) -> Result<InboundOutcome> {
        let offered = CryptoCapabilitiesPayload::decode(payload)?;
        let suite = NegotiatedSuite::negotiate(&offered, self.policy.auth_algos)?;
        self.negotiated_suite = Some(suite);

        let params = CryptoParametersPayload {
            kex: suite.kex,
            auth: suite.auth,
            cipher: suite.cipher,
            public_key_size: 32,
            signature_size: 64,
            shared_secret_size: 32,
            nonce_size: cipher::NONCE_LEN as u16,
            mac_size: cipher::MAC_LEN as u16,
            hmac_size: 32,
            argon2_m_cost_kib: self.policy.argon2_params.m_cost_kib,
            argon2_t_cost: self.policy.argon2_params.t_cost,
            argon2_p_cost: self.policy.argon2_params.p_cost,
            salt: self.policy.salt,
        };
        let mut params_buf = Vec::new();
        params.encode(&mut params_buf);

        let ephemeral = EphemeralKeyPair::generate();
        let mut kex_buf = Vec::new();
        KeyExchangePayload { public_key: ephemeral.public }.encode(&mut kex_buf);
        self.server_ephemeral = Some(ephemeral);

        self.enter_state(SessionState::KeyExchange);
        Ok(InboundOutcome {
            send: vec![
                (PacketType::CryptoParameters, params_buf),
                (PacketType::KeyExchangeInit, kex_buf),
            ],
            close: false,
        })
    }

    fn handle_key_exchange(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<InboundOutcome> {
        if packet_type == PacketType::NoEncryption {
            if self.policy.requires_encryption() {
                let mut buf = Vec::new();
                AuthFailedPayload { reason: AuthFailReason::PASSWORD_REQUIRED }.encode(&mut buf);
                return Ok(InboundOutcome::close_with(PacketType::AuthFailed, buf));
            }
            self.enter_state(SessionState::Streaming);
            return Ok(InboundOutcome::none());
        }

        let response = KeyExchangePayload::decode(payload)?;
        self.client_public_key = Some(response.public_key);
        let ephemeral = self
            .server_ephemeral
            .take()
            .ok_or_else(|| CoreError::internal("key exchange response without a pending ephemeral keypair"))?;
        let shared_secret = ephemeral.diffie_hellman(&response.public_key);
        self.shared_secret = Some(shared_secret);

        if self.policy.requires_auth() {
            let mut nonce = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut nonce);
            self.auth_challenge = Some(nonce);
            self.enter_state(SessionState::Authenticating);
            let mut buf = Vec::new();
            AuthChallengePayload { nonce }.encode(&mut buf);
            return Ok(InboundOutcome::reply(PacketType::AuthChallenge, buf));
        }

        self.complete_handshake()
    }

    fn handle_auth_response(&mut self, payload: &[u8]) -> Result<InboundOutcome> {
        let response = AuthResponsePayload::decode(payload)?;
        let challenge = self
            .auth_challenge
            .ok_or_else(|| CoreError::internal("auth response without a pending challenge"))?;

        let ok = if let Some(password_key) = self.policy.password_key {
            verify_hmac_proof(&password_key, &challenge, &response.proof)
        } else if let Some(allowed) = &self.policy.allowed_client_keys {
            allowed
                .iter()
                .any(|key| crate::crypto::verify_signature(key, &challenge, &response.proof).is_ok())
        } else {
            false
        };

        if !ok {
            let reason = if self.policy.password_key.is_some() {
                AuthFailReason::PASSWORD_INCORRECT
            } else {
                AuthFailReason::SIGNATURE_INVALID
            };
            let mut buf = Vec::new();
            AuthFailedPayload { reason }.encode(&mut buf);
            return Ok(InboundOutcome::close_with(PacketType::AuthFailed, buf));
        }

        self.complete_handshake()
    }

    fn complete_handshake(&mut self) -> Result<InboundOutcome> {
        let shared_secret = self
            .shared_secret
            .ok_or_else(|| CoreError::internal("handshake completed without a shared secret"))?;
        let key = crate::crypto::SessionKey::from_shared_secret(&shared_secret, CONTEXT_LABEL);
        self.crypto = Some(SessionCrypto {
            key,
            send_counter: std::sync::Arc::new(cipher::NonceCounter::new(cipher::Direction::ServerToClient)),
        });
        self.enter_state(SessionState::Streaming);
        Ok(InboundOutcome::reply(PacketType::HandshakeComplete, Vec::new()))
    }

    fn handle_streaming(&mut self, packet_type: PacketType, client_id: u32, payload: &[u8]) -> Result<InboundOutcome> {
        match packet_type {
            PacketType::ClientCapabilities => {
                let caps = TerminalCapabilities::decode(payload)?;
                self.capability_flags = caps.capability_flags;
                self.terminal_caps = Some(caps);
                Ok(InboundOutcome::none())
            }
            PacketType::ImageFrame => {
                self.handle_image_frame(client_id, payload)?;
                Ok(InboundOutcome::none())
            }
            PacketType::AudioBatch => {
                self.handle_audio_batch(payload)?;
                Ok(InboundOutcome::none())
            }
            PacketType::StreamStart => {
                self.sending_video = true;
                self.sending_audio = true;
                Ok(InboundOutcome::none())
            }
            PacketType::StreamStop => {
                self.sending_video = false;
                self.sending_audio = false;
                Ok(InboundOutcome::none())
            }
            PacketType::ClientLeave => {
                self.enter_state(SessionState::Draining);
                Ok(InboundOutcome::none())
            }
            PacketType::Ping => Ok(InboundOutcome::reply(PacketType::Pong, Vec::new())),
            PacketType::Encrypted => {
                // Unwrapped one layer up by the caller before re-dispatch;
                // seeing it here means a double-wrap, which is a protocol
                // error rather than a silent no-op.
                Err(CoreError::protocol("nested ENCRYPTED packet"))
            }
            other => Err(CoreError::protocol(format!("unexpected streaming packet {other:?}"))),
        }
    }

    fn handle_image_frame(&mut self, client_id: u32, payload: &[u8]) -> Result<()> {
        let header = packet::ImageFrameHeader::decode(payload)?;
        packet::validate_image_dimensions(header.width, header.height)?;
        let body = &payload[packet::ImageFrameHeader::LEN..];

        let pixels = if header.compressed_size == 0 {
            if crc32fast::hash(body) != header.checksum {
                return Err(CoreError::protocol("IMAGE_FRAME checksum mismatch"));
            }
            body.to_vec()
        } else {
            use std::io::Read;
            let mut decoder = flate2::read::DeflateDecoder::new(body);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| CoreError::protocol(format!("IMAGE_FRAME inflate failed: {e}")))?;
            if crc32fast::hash(&out) != header.checksum {
                return Err(CoreError::protocol("IMAGE_FRAME checksum mismatch"));
            }
            out
        };

        let rgb = to_rgb24(header.pixel_format, &pixels);
        let stored = crate::buffers::encode_stored_frame(header.width, header.height, &rgb);
        self.video_buffer.write(client_id, header.timestamp as u64, &stored);
        Ok(())
    }

    fn handle_audio_batch(&mut self, payload: &[u8]) -> Result<()> {
        let header = packet::AudioBatchHeader::decode(payload)?;

        let expected_rate = crate::mixer::MixerParams::default().sample_rate as u32;
        if header.sample_rate != expected_rate {
            return Err(CoreError::protocol(format!(
                "AUDIO_BATCH sample_rate {} does not match mixer configuration {expected_rate}",
                header.sample_rate
            )));
        }
        if header.channels != EXPECTED_AUDIO_CHANNELS {
            return Err(CoreError::protocol(format!(
                "AUDIO_BATCH channels {} does not match mixer configuration {EXPECTED_AUDIO_CHANNELS}",
                header.channels
            )));
        }

        let body = &payload[packet::AudioBatchHeader::LEN..];
        let total = (header.total_samples as usize) * (header.channels.max(1) as usize);
        let samples = packet::decode_audio_samples(body, total)?;
        self.audio_buffer.write_dropping_oldest(&samples);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncryptionPolicy, ServerConfig};
    use std::net::{Ipv4Addr, SocketAddr};

    fn streaming_session() -> Session {
        let config = ServerConfig { encryption_policy: EncryptionPolicy::Off, ..Default::default() };
        let policy = std::sync::Arc::new(super::super::HandshakePolicy::from_config(&config, &crate::config::NullKeyResolver).unwrap());
        let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 9200);
        let mut session = Session::new(addr, policy);
        session.enter_state(SessionState::Streaming);
        session
    }

    fn audio_batch_payload(sample_rate: u32, channels: u32, samples: &[f32]) -> Vec<u8> {
        let header = packet::AudioBatchHeader {
            batch_count: 1,
            total_samples: samples.len() as u32,
            sample_rate,
            channels,
        };
        let mut payload = Vec::new();
        packet::encode_audio_batch(&header, samples, &mut payload);
        payload
    }

    #[test]
    fn audio_batch_matching_mixer_configuration_is_buffered() {
        let mut session = streaming_session();
        let id = session.id;
        let payload = audio_batch_payload(48_000, 1, &[0.1, 0.2, 0.3]);
        session.handle_packet(PacketType::AudioBatch, id, &payload).unwrap();
        assert_eq!(session.audio_buffer.len(), 3);
    }

    #[test]
    fn audio_batch_with_wrong_sample_rate_is_rejected() {
        let mut session = streaming_session();
        let id = session.id;
        let payload = audio_batch_payload(44_100, 1, &[0.1, 0.2]);
        let err = session.handle_packet(PacketType::AudioBatch, id, &payload).unwrap_err();
        assert!(matches!(err, CoreError::Protocol(_)));
    }

    #[test]
    fn audio_batch_with_wrong_channel_count_is_rejected() {
        let mut session = streaming_session();
        let id = session.id;
        let payload = audio_batch_payload(48_000, 2, &[0.1, 0.2]);
        let err = session.handle_packet(PacketType::AudioBatch, id, &payload).unwrap_err();
        assert!(matches!(err, CoreError::Protocol(_)));
    }
}
