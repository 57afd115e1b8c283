//! Wire header and packet type table.

pub const MAGIC: u32 = 0xDEAD_BEEF;
pub const HEADER_LEN: usize = 18;
pub const MAX_PAYLOAD_LEN: u32 = 5 * 1024 * 1024; // 5 MiB

/// One chunk of `AUDIO_SAMPLES_PER_PACKET` samples per `AUDIO_BATCH` entry.
pub const AUDIO_SAMPLES_PER_PACKET: usize = 480; // 10ms @ 48kHz mono

/// Packet type table. Values are stable wire constants; never renumber an
/// existing variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    // Handshake phase (always plaintext).
    ProtocolVersion = 0x0001,
    CryptoCapabilities = 0x0002,
    CryptoParameters = 0x0003,
    KeyExchangeInit = 0x0004,
    KeyExchangeResponse = 0x0005,
    AuthChallenge = 0x0006,
    AuthResponse = 0x0007,
    ServerAuthResponse = 0x0008,
    AuthFailed = 0x0009,
    HandshakeComplete = 0x000A,
    NoEncryption = 0x000B,

    // Data-plane (encrypted once a session key is live).
    ImageFrame = 0x0100,
    AudioBatch = 0x0101,
    AsciiFrame = 0x0102,
    Encrypted = 0x01FF,

    // Control (follows the data-plane encryption rule).
    Ping = 0x0200,
    Pong = 0x0201,
    ClientLeave = 0x0202,
    StreamStart = 0x0203,
    StreamStop = 0x0204,
    ClientCapabilities = 0x0205,
    ServerState = 0x0206,
    ClearConsole = 0x0207,
}

impl PacketType {
    pub fn from_u16(v: u16) -> Option<Self> {
        use PacketType::*;
        Some(match v {
            0x0001 => ProtocolVersion,
            0x0002 => CryptoCapabilities,
            0x0003 => CryptoParameters,
            0x0004 => KeyExchangeInit,
            0x0005 => KeyExchangeResponse,
            0x0006 => AuthChallenge,
            0x0007 => AuthResponse,
            0x0008 => ServerAuthResponse,
            0x0009 => AuthFailed,
            0x000A => HandshakeComplete,
            0x000B => NoEncryption,
            0x0100 => ImageFrame,
            0x0101 => AudioBatch,
            0x0102 => AsciiFrame,
            0x01FF => Encrypted,
            0x0200 => Ping,
            0x0201 => Pong,
            0x0202 => ClientLeave,
            0x0203 => StreamStart,
            0x0204 => StreamStop,
            0x0205 => ClientCapabilities,
            0x0206 => ServerState,
            0x0207 => ClearConsole,
            _ => return None,
        })
    }

    /// Fixed at compile time; must agree on both ends.
    pub const fn is_handshake_type(self) -> bool {
        matches!(
            self,
            PacketType::ProtocolVersion
                | PacketType::CryptoCapabilities
                | PacketType::CryptoParameters
                | PacketType::KeyExchangeInit
                | PacketType::KeyExchangeResponse
                | PacketType::AuthChallenge
                | PacketType::AuthResponse
                | PacketType::ServerAuthResponse
                | PacketType::AuthFailed
                | PacketType::HandshakeComplete
                | PacketType::NoEncryption
        )
    }

    pub const fn is_data_plane_type(self) -> bool {
        matches!(
            self,
            PacketType::ImageFrame | PacketType::AudioBatch | PacketType::AsciiFrame
        )
    }

    pub const fn is_control_type(self) -> bool {
        matches!(
            self,
            PacketType::Ping
                | PacketType::Pong
                | PacketType::ClientLeave
                | PacketType::StreamStart
                | PacketType::StreamStop
                | PacketType::ClientCapabilities
                | PacketType::ServerState
                | PacketType::ClearConsole
        )
    }

    /// Control types whose payload may legitimately be empty.
    pub const fn allows_empty_payload(self) -> bool {
        matches!(
            self,
            PacketType::Ping
                | PacketType::Pong
                | PacketType::ClientLeave
                | PacketType::StreamStart
                | PacketType::StreamStop
        )
    }

    /// Server-to-client only; rejected if received from a client.
    pub const fn is_server_to_client_only(self) -> bool {
        matches!(self, PacketType::ServerState | PacketType::ClearConsole)
    }
}

/// Decoded wire header (without payload bytes).
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub payload_len: u32,
    pub crc32: u32,
    pub client_id: u32,
}

impl PacketHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.extend_from_slice(&(self.packet_type as u16).to_be_bytes());
        out.extend_from_slice(&self.payload_len.to_be_bytes());
        out.extend_from_slice(&self.crc32.to_be_bytes());
        out.extend_from_slice(&self.client_id.to_be_bytes());
    }

    /// Parses exactly `HEADER_LEN` bytes. Does not validate magic/length —
    /// callers run those checks explicitly so they can classify the error.
    pub fn decode_raw(bytes: &[u8]) -> (u32, u16, u32, u32, u32) {
        debug_assert!(bytes.len() >= HEADER_LEN);
        let magic = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let packet_type = u16::from_be_bytes(bytes[4..6].try_into().unwrap());
        let payload_len = u32::from_be_bytes(bytes[6..10].try_into().unwrap());
        let crc32 = u32::from_be_bytes(bytes[10..14].try_into().unwrap());
        let client_id = u32::from_be_bytes(bytes[14..18].try_into().unwrap());
        (magic, packet_type, payload_len, crc32, client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_predicate_matches_both_ends_by_construction() {
        assert!(PacketType::ProtocolVersion.is_handshake_type());
        assert!(!PacketType::ImageFrame.is_handshake_type());
        assert!(!PacketType::Ping.is_handshake_type());
    }

    #[test]
    fn type_partition_is_disjoint() {
        // PacketType::Encrypted is the transport wrapper itself, not a
        // member of the handshake/data-plane/control partition it guards.
        for code in 0u16..=0x02FFu16 {
            if code == PacketType::Encrypted as u16 {
                continue;
            }
            if let Some(t) = PacketType::from_u16(code) {
                let classes = [t.is_handshake_type(), t.is_data_plane_type(), t.is_control_type()];
                assert_eq!(classes.iter().filter(|b| **b).count(), 1, "{t:?} must be in exactly one class");
            }
        }
    }
}
