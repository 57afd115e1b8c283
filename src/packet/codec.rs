//! Packet encode/decode.

use crate::error::{CoreError, Result};
use crate::packet::header::{PacketHeader, PacketType, HEADER_LEN, MAGIC, MAX_PAYLOAD_LEN};

/// A fully decoded packet: type, originating client id (0 = server), and
/// owned payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub packet_type: PacketType,
    pub client_id: u32,
    pub payload: Vec<u8>,
}

/// Encodes `(type, client_id, payload)` into `out`. Encoding only fails if
/// the payload exceeds the wire size cap — the caller should treat that as
/// fatal to the connection.
pub fn encode_packet(packet_type: PacketType, client_id: u32, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() as u64 > MAX_PAYLOAD_LEN as u64 {
        return Err(CoreError::protocol(format!(
            "payload of {} bytes exceeds {} byte cap",
            payload.len(),
            MAX_PAYLOAD_LEN
        )));
    }
    let mut crc = crc32fast::Hasher::new();
    crc.update(payload);
    let header = PacketHeader {
        packet_type,
        payload_len: payload.len() as u32,
        crc32: crc.finalize(),
        client_id,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    header.encode(&mut out);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decodes exactly one packet from the front of `bytes`. On success returns
/// the decoded packet and the number of bytes consumed. Returns
/// `Ok(None)` if `bytes` does not yet contain a full header + payload — the
/// caller should read more and retry until the full header and payload
/// arrive.
pub fn try_decode_packet(bytes: &[u8]) -> Result<Option<(DecodedPacket, usize)>> {
    if bytes.len() < HEADER_LEN {
        return Ok(None);
    }
    let (magic, type_code, payload_len, crc32, client_id) = PacketHeader::decode_raw(bytes);
    if magic != MAGIC {
        return Err(CoreError::protocol(format!("bad magic {magic:#010x}")));
    }
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(CoreError::protocol(format!(
            "payload length {payload_len} exceeds {MAX_PAYLOAD_LEN} byte cap"
        )));
    }
    let total = HEADER_LEN + payload_len as usize;
    if bytes.len() < total {
        return Ok(None);
    }
    let packet_type = PacketType::from_u16(type_code)
        .ok_or_else(|| CoreError::protocol(format!("unknown packet type {type_code:#06x}")))?;
    let payload = &bytes[HEADER_LEN..total];
    let mut crc = crc32fast::Hasher::new();
    crc.update(payload);
    if crc.finalize() != crc32 {
        return Err(CoreError::protocol("CRC32 mismatch"));
    }
    Ok(Some((
        DecodedPacket {
            packet_type,
            client_id,
            payload: payload.to_vec(),
        },
        total,
    )))
}

/// Incremental decoder wrapping a growing receive buffer, the shape every
/// per-session inbound task uses.
#[derive(Default)]
pub struct PacketReader {
    buf: Vec<u8>,
}

impl PacketReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pulls as many fully-buffered packets out as possible.
    pub fn drain_packets(&mut self) -> Result<Vec<DecodedPacket>> {
        let mut out = Vec::new();
        loop {
            match try_decode_packet(&self.buf)? {
                Some((packet, consumed)) => {
                    self.buf.drain(0..consumed);
                    out.push(packet);
                }
                None => break,
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet_type: PacketType, client_id: u32, payload: &[u8]) {
        let wire = encode_packet(packet_type, client_id, payload).unwrap();
        let (decoded, consumed) = try_decode_packet(&wire).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(decoded.packet_type, packet_type);
        assert_eq!(decoded.client_id, client_id);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn round_trip_every_type() {
        // I-PACKET-ROUNDTRIP
        let all = [
            PacketType::ProtocolVersion,
            PacketType::CryptoCapabilities,
            PacketType::CryptoParameters,
            PacketType::KeyExchangeInit,
            PacketType::KeyExchangeResponse,
            PacketType::AuthChallenge,
            PacketType::AuthResponse,
            PacketType::ServerAuthResponse,
            PacketType::AuthFailed,
            PacketType::HandshakeComplete,
            PacketType::NoEncryption,
            PacketType::ImageFrame,
            PacketType::AudioBatch,
            PacketType::AsciiFrame,
            PacketType::Encrypted,
            PacketType::Ping,
            PacketType::Pong,
            PacketType::ClientLeave,
            PacketType::StreamStart,
            PacketType::StreamStop,
            PacketType::ClientCapabilities,
            PacketType::ServerState,
            PacketType::ClearConsole,
        ];
        for t in all {
            roundtrip(t, 42, b"hello world payload bytes");
            roundtrip(t, 0, b"");
        }
    }

    #[test]
    fn bit_flip_in_payload_is_rejected() {
        // I-CRC-INTEGRITY
        let mut wire = encode_packet(PacketType::ImageFrame, 1, b"some pixel bytes").unwrap();
        let payload_start = HEADER_LEN;
        wire[payload_start] ^= 0x01;
        let err = try_decode_packet(&wire).unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }

    #[test]
    fn oversized_length_rejected_without_reading_payload() {
        // I-SIZE-BOUND
        let mut header_bytes = Vec::new();
        let header = PacketHeader {
            packet_type: PacketType::ImageFrame,
            payload_len: MAX_PAYLOAD_LEN + 1,
            crc32: 0,
            client_id: 0,
        };
        header.encode(&mut header_bytes);
        let err = try_decode_packet(&header_bytes).unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }

    #[test]
    fn partial_buffer_yields_none_not_error() {
        let wire = encode_packet(PacketType::Ping, 1, b"").unwrap();
        assert!(try_decode_packet(&wire[..HEADER_LEN - 1]).unwrap().is_none());
    }

    #[test]
    fn reader_drains_multiple_concatenated_packets() {
        let mut reader = PacketReader::new();
        let a = encode_packet(PacketType::Ping, 1, b"").unwrap();
        let b = encode_packet(PacketType::Pong, 1, b"").unwrap();
        reader.feed(&a);
        reader.feed(&b);
        let packets = reader.drain_packets().unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].packet_type, PacketType::Ping);
        assert_eq!(packets[1].packet_type, PacketType::Pong);
    }

    #[test]
    fn unknown_type_rejected() {
        let header = PacketHeader {
            packet_type: PacketType::Ping,
            payload_len: 0,
            crc32: 0,
            client_id: 0,
        };
        let mut bytes = Vec::new();
        header.encode(&mut bytes);
        bytes[4] = 0xFF;
        bytes[5] = 0xFE;
        let err = try_decode_packet(&bytes).unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }
}
