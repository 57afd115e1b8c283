//! Wire framing, CRC32 validation, size bounds, and packet type dispatch.

mod codec;
mod header;
mod payloads;

pub use codec::{encode_packet, try_decode_packet, DecodedPacket, PacketReader};
pub use header::{PacketHeader, PacketType, AUDIO_SAMPLES_PER_PACKET, HEADER_LEN, MAGIC, MAX_PAYLOAD_LEN};
pub use payloads::*;
