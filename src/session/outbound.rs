//! Per-listener outbound tick: composes every other streaming client's
//! latest video frame into one canvas, renders it to ANSI for this
//! listener's negotiated terminal capabilities, mixes this listener's audio
//! from every other streaming source, and wraps both as `ENCRYPTED` once a
//! session key is live.

use super::{Session, SessionCrypto};
use crate::buffers::{decode_stored_frame, FrameBuffer};
use crate::crypto::cipher;
use crate::mixer::{Mixer, MixerParams};
use crate::packet::{
    self, AsciiFrameFlags, AsciiFrameHeader, AudioBatchHeader, PacketType, PaletteId, RenderMode,
};
use crate::render::{self, PaletteCache, PaletteRegistry, RenderSettings, RgbImage};
use std::sync::Arc;

/// Bytes budgeted per rendered cell before the renderer's own capacity
/// check kicks in (worst case: an SGR fg + bg change plus a multi-byte
/// glyph).
const BYTES_PER_CELL_ESTIMATE: usize = 40;

/// Default deflate threshold when a listener's negotiated value is zero:
/// only ship the compressed body if it is under this percentage of the
/// uncompressed size.
const DEFAULT_COMPRESSION_THRESHOLD_PCT: u8 = 90;

fn nearest_resize(src_w: u32, src_h: u32, src_rgb: &[u8], dst_w: u32, dst_h: u32) -> Vec<u8> {
    let mut out = vec![0u8; (dst_w * dst_h * 3) as usize];
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return out;
    }
    for y in 0..dst_h {
        let sy = (y * src_h) / dst_h;
        for x in 0..dst_w {
            let sx = (x * src_w) / dst_w;
            let src_idx = ((sy * src_w + sx) * 3) as usize;
            let dst_idx = ((y * dst_w + x) * 3) as usize;
            out[dst_idx..dst_idx + 3].copy_from_slice(&src_rgb[src_idx..src_idx + 3]);
        }
    }
    out
}

/// Tiles every source frame into a `canvas_w x canvas_h` grid, roughly
/// square, skipping sources with no buffered frame yet.
fn compose_canvas(
    sources: &[(u32, Arc<FrameBuffer>)],
    canvas_w: u32,
    canvas_h: u32,
) -> Vec<u8> {
    let mut canvas = vec![0u8; (canvas_w * canvas_h * 3) as usize];
    let frames: Vec<(u32, u32, Vec<u8>)> = sources
        .iter()
        .filter_map(|(_, buf)| buf.peek_latest())
        .filter_map(|d| decode_stored_frame(&d.payload).map(|(w, h, rgb)| (w, h, rgb.to_vec())))
        .collect();
    if frames.is_empty() {
        return canvas;
    }

    let count = frames.len() as u32;
    let cols = (count as f64).sqrt().ceil() as u32;
    let rows = (count + cols - 1) / cols.max(1);
    let tile_w = (canvas_w / cols.max(1)).max(1);
    let tile_h = (canvas_h / rows.max(1)).max(1);

    for (i, (src_w, src_h, src_rgb)) in frames.iter().enumerate() {
        let col = i as u32 % cols.max(1);
        let row = i as u32 / cols.max(1);
        let ox = col * tile_w;
        let oy = row * tile_h;
        let resized = nearest_resize(*src_w, *src_h, src_rgb, tile_w, tile_h);
        for y in 0..tile_h {
            let dy = oy + y;
            if dy >= canvas_h {
                break;
            }
            for x in 0..tile_w {
                let dx = ox + x;
                if dx >= canvas_w {
                    break;
                }
                let src_idx = ((y * tile_w + x) * 3) as usize;
                let dst_idx = ((dy * canvas_w + dx) * 3) as usize;
                canvas[dst_idx..dst_idx + 3].copy_from_slice(&resized[src_idx..src_idx + 3]);
            }
        }
    }
    canvas
}

fn palette_ramp(id: PaletteId, custom: &str) -> String {
    match id {
        PaletteId::Standard => " .:-=+*#%@".to_string(),
        PaletteId::Blocks => " ░▒▓█".to_string(),
        PaletteId::Digital => " 01".to_string(),
        PaletteId::Minimal => " #".to_string(),
        PaletteId::Cool => " .:+*#%@".to_string(),
        PaletteId::Custom => {
            if custom.is_empty() {
                " .:-=+*#%@".to_string()
            } else {
                custom.to_string()
            }
        }
    }
}

/// Everything the outbound task needs that isn't carried on `Session`
/// itself: the process-wide palette cache and this session's mixer.
pub struct OutboundContext<'a> {
    pub palette_registry: &'a PaletteRegistry,
}

impl Session {
    /// Builds this listener's next `ASCII_FRAME` (or `None` if no other
    /// session has a video frame buffered yet), ready to hand to
    /// [`Session::wrap_for_send`].
    pub fn build_video_tick(
        &self,
        sources: &[(u32, Arc<FrameBuffer>)],
        ctx: &OutboundContext,
    ) -> Option<(PacketType, Vec<u8>)> {
        let caps = self.terminal_caps.as_ref()?;
        let others: Vec<(u32, Arc<FrameBuffer>)> =
            sources.iter().filter(|(id, _)| *id != self.id).cloned().collect();

        let row_stride = if caps.render_mode == RenderMode::HalfBlock { 2 } else { 1 };
        let canvas_w = caps.cell_width as u32;
        let canvas_h = caps.cell_height as u32 * row_stride;
        if canvas_w == 0 || canvas_h == 0 {
            return None;
        }

        let canvas = compose_canvas(&others, canvas_w, canvas_h);
        let palette_string = palette_ramp(caps.palette, &caps.custom_palette);
        let palette: Arc<PaletteCache> = ctx.palette_registry.get_or_build(&palette_string);
        let settings = RenderSettings { color_level: caps.color_level, render_mode: caps.render_mode, palette };
        let image = RgbImage { width: canvas_w, height: canvas_h, data: &canvas };
        let capacity = (canvas_w as usize) * (canvas_h as usize / row_stride as usize).max(1) * BYTES_PER_CELL_ESTIMATE + 64;
        let rendered = render::render(&image, &settings, capacity);

        let (compressed_size, body) = maybe_compress(&rendered, DEFAULT_COMPRESSION_THRESHOLD_PCT);
        let checksum = crc32fast::hash(&body);
        let mut flags = AsciiFrameFlags::empty();
        if caps.color_level != packet::ColorLevel::None {
            flags |= AsciiFrameFlags::HAS_COLOR;
        }
        if compressed_size != 0 {
            flags |= AsciiFrameFlags::IS_COMPRESSED;
        }
        let header = AsciiFrameHeader {
            width: canvas_w,
            height: canvas_h,
            original_size: rendered.len() as u32,
            compressed_size: compressed_size as u32,
            checksum,
            flags,
        };
        let mut payload = Vec::with_capacity(AsciiFrameHeader::LEN + body.len());
        header.encode(&mut payload);
        payload.extend_from_slice(&body);
        Some((PacketType::AsciiFrame, payload))
    }

    /// Builds this listener's next `AUDIO_BATCH` tick, mixing every other
    /// active source's most recent samples.
    pub fn build_audio_tick(&self, mixer: &Mixer, params: &MixerParams) -> Option<(PacketType, Vec<u8>)> {
        if mixer.active_count() == 0 {
            return None;
        }
        let samples = mixer.mix_frame_excluding(self.id, params);
        let header = AudioBatchHeader {
            batch_count: 1,
            total_samples: samples.len() as u32,
            sample_rate: params.sample_rate as u32,
            channels: 1,
        };
        let mut payload = Vec::new();
        packet::encode_audio_batch(&header, &samples, &mut payload);
        Some((PacketType::AudioBatch, payload))
    }

    /// Wraps `(packet_type, payload)` as `ENCRYPTED` if this session has a
    /// live key, otherwise returns it unwrapped (encryption-off sessions
    /// stay plaintext for their entire lifetime once `NO_ENCRYPTION` was
    /// accepted). Handshake-phase packet types are always returned
    /// unwrapped, even after `self.crypto` goes live: `HANDSHAKE_COMPLETE`
    /// itself is the reply that carries the key's activation, so a client
    /// still expecting a plaintext frame has to be able to read it.
    pub fn wrap_for_send(&self, packet_type: PacketType, payload: Vec<u8>) -> crate::error::Result<(PacketType, Vec<u8>)> {
        if packet_type.is_handshake_type() {
            return Ok((packet_type, payload));
        }
        match &self.crypto {
            None => Ok((packet_type, payload)),
            Some(crypto) => {
                let inner = packet::encode_packet(packet_type, self.id, &payload)?;
                let sealed = seal_for_session(crypto, &inner)?;
                Ok((PacketType::Encrypted, sealed))
            }
        }
    }
}

fn seal_for_session(crypto: &SessionCrypto, plaintext: &[u8]) -> crate::error::Result<Vec<u8>> {
    let nonce = crypto.send_counter.next_nonce();
    let ciphertext_and_mac = crypto.key.seal(&nonce, plaintext)?;
    let mut out = Vec::with_capacity(cipher::NONCE_LEN + ciphertext_and_mac.len());
    packet::EncryptedEnvelope::encode(nonce, &ciphertext_and_mac, &mut out);
    Ok(out)
}

/// Returns `(0, original)` if compression doesn't clear `threshold_pct`,
/// else `(compressed_len, compressed)`.
fn maybe_compress(data: &[u8], threshold_pct: u8) -> (usize, Vec<u8>) {
    use std::io::Write;
    let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::fast());
    if encoder.write_all(data).is_err() {
        return (0, data.to_vec());
    }
    let compressed = match encoder.finish() {
        Ok(c) => c,
        Err(_) => return (0, data.to_vec()),
    };
    let limit = (data.len() * threshold_pct as usize) / 100;
    if compressed.len() < limit {
        (compressed.len(), compressed)
    } else {
        (0, data.to_vec())
    }
}

/// Builds a `SERVER_STATE` broadcast, sent whenever the connected/active
/// counts change.
pub fn build_server_state(connected_count: u32, active_count: u32) -> (PacketType, Vec<u8>) {
    let payload_struct = packet::ServerStatePayload { connected_count, active_count };
    let mut payload = Vec::with_capacity(packet::ServerStatePayload::LEN);
    payload_struct.encode(&mut payload);
    (PacketType::ServerState, payload)
}

/// Builds a `CLEAR_CONSOLE`, sent when a listener's first `ASCII_FRAME`
/// after `HANDSHAKE_COMPLETE` is about to change the terminal's dimensions.
pub fn build_clear_console() -> (PacketType, Vec<u8>) {
    (PacketType::ClearConsole, Vec::new())
}
