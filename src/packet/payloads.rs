//! Payload layouts for the principal packet types.
//!
//! All multi-field integer structures are packed with no padding; every
//! multi-byte integer is big-endian *except* the `AUDIO_BATCH` sample
//! array, which stays little-endian IEEE-754 f32 (the native float byte
//! order used by the capture/playback path).

use crate::error::{CoreError, Result};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AsciiFrameFlags: u32 {
        const HAS_COLOR      = 0x01;
        const IS_COMPRESSED  = 0x02;
        const RLE_COMPRESSED = 0x04;
        const IS_STRETCHED   = 0x08;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CapabilityFlags: u32 {
        const VIDEO   = 0x01;
        const AUDIO   = 0x02;
        const COLOR   = 0x04;
        const STRETCH = 0x08;
    }
}

bitflags::bitflags! {
    /// Reason bitmask for `AUTH_FAILED`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AuthFailReason: u32 {
        const PASSWORD_REQUIRED    = 0x01;
        const PASSWORD_INCORRECT   = 0x02;
        const CLIENT_KEY_REQUIRED  = 0x04;
        const CLIENT_KEY_REJECTED  = 0x08;
        const SIGNATURE_INVALID    = 0x10;
    }
}

fn need(buf: &[u8], n: usize, what: &str) -> Result<()> {
    if buf.len() < n {
        Err(CoreError::protocol(format!("truncated {what}: need {n} bytes, have {}", buf.len())))
    } else {
        Ok(())
    }
}

// ---- IMAGE_FRAME ------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PixelFormat {
    Rgb = 0,
    Rgba = 1,
    Bgr = 2,
    Bgra = 3,
}

impl PixelFormat {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => PixelFormat::Rgb,
            1 => PixelFormat::Rgba,
            2 => PixelFormat::Bgr,
            3 => PixelFormat::Bgra,
            _ => return None,
        })
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb | PixelFormat::Bgr => 3,
            PixelFormat::Rgba | PixelFormat::Bgra => 4,
        }
    }
}

pub struct ImageFrameHeader {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub compressed_size: u32,
    pub checksum: u32,
    pub timestamp: u32,
}

impl ImageFrameHeader {
    pub const LEN: usize = 4 + 4 + 1 + 4 + 4 + 4;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.width.to_be_bytes());
        out.extend_from_slice(&self.height.to_be_bytes());
        out.push(self.pixel_format as u8);
        out.extend_from_slice(&self.compressed_size.to_be_bytes());
        out.extend_from_slice(&self.checksum.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        need(buf, Self::LEN, "IMAGE_FRAME header")?;
        let width = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let height = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let pixel_format = PixelFormat::from_u8(buf[8])
            .ok_or_else(|| CoreError::protocol(format!("unknown pixel format {}", buf[8])))?;
        let compressed_size = u32::from_be_bytes(buf[9..13].try_into().unwrap());
        let checksum = u32::from_be_bytes(buf[13..17].try_into().unwrap());
        let timestamp = u32::from_be_bytes(buf[17..21].try_into().unwrap());
        Ok(Self { width, height, pixel_format, compressed_size, checksum, timestamp })
    }
}

/// Dimensions must be >0 and <=4096 each.
pub const MAX_IMAGE_DIMENSION: u32 = 4096;

pub fn validate_image_dimensions(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 || width > MAX_IMAGE_DIMENSION || height > MAX_IMAGE_DIMENSION {
        return Err(CoreError::protocol(format!(
            "invalid image dimensions {width}x{height}"
        )));
    }
    Ok(())
}

// ---- ASCII_FRAME --------------------------------------------------------

pub struct AsciiFrameHeader {
    pub width: u32,
    pub height: u32,
    pub original_size: u32,
    pub compressed_size: u32,
    pub checksum: u32,
    pub flags: AsciiFrameFlags,
}

impl AsciiFrameHeader {
    pub const LEN: usize = 4 * 6;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.width.to_be_bytes());
        out.extend_from_slice(&self.height.to_be_bytes());
        out.extend_from_slice(&self.original_size.to_be_bytes());
        out.extend_from_slice(&self.compressed_size.to_be_bytes());
        out.extend_from_slice(&self.checksum.to_be_bytes());
        out.extend_from_slice(&self.flags.bits().to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        need(buf, Self::LEN, "ASCII_FRAME header")?;
        Ok(Self {
            width: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            height: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            original_size: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            compressed_size: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            checksum: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
            flags: AsciiFrameFlags::from_bits_truncate(u32::from_be_bytes(buf[20..24].try_into().unwrap())),
        })
    }
}

// ---- AUDIO_BATCH --------------------------------------------------------

pub struct AudioBatchHeader {
    pub batch_count: u32,
    pub total_samples: u32,
    pub sample_rate: u32,
    pub channels: u32,
}

impl AudioBatchHeader {
    pub const LEN: usize = 4 * 4;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.batch_count.to_be_bytes());
        out.extend_from_slice(&self.total_samples.to_be_bytes());
        out.extend_from_slice(&self.sample_rate.to_be_bytes());
        out.extend_from_slice(&self.channels.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        need(buf, Self::LEN, "AUDIO_BATCH header")?;
        Ok(Self {
            batch_count: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            total_samples: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            sample_rate: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            channels: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

/// Encodes `samples` (little-endian f32) after the header.
pub fn encode_audio_batch(header: &AudioBatchHeader, samples: &[f32], out: &mut Vec<u8>) {
    header.encode(out);
    out.reserve(samples.len() * 4);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
}

pub fn decode_audio_samples(buf: &[u8], count: usize) -> Result<Vec<f32>> {
    need(buf, count * 4, "AUDIO_BATCH samples")?;
    let mut out = Vec::with_capacity(count);
    for chunk in buf[..count * 4].chunks_exact(4) {
        out.push(f32::from_le_bytes(chunk.try_into().unwrap()));
    }
    Ok(out)
}

// ---- Terminal capability record / CLIENT_CAPABILITIES -------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColorLevel {
    None = 0,
    Ansi16 = 1,
    Ansi256 = 2,
    TrueColor = 3,
}

impl ColorLevel {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => ColorLevel::None,
            1 => ColorLevel::Ansi16,
            2 => ColorLevel::Ansi256,
            3 => ColorLevel::TrueColor,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RenderMode {
    Foreground = 0,
    Background = 1,
    HalfBlock = 2,
}

impl RenderMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => RenderMode::Foreground,
            1 => RenderMode::Background,
            2 => RenderMode::HalfBlock,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PaletteId {
    Standard = 0,
    Blocks = 1,
    Digital = 2,
    Minimal = 3,
    Cool = 4,
    Custom = 5,
}

impl PaletteId {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => PaletteId::Standard,
            1 => PaletteId::Blocks,
            2 => PaletteId::Digital,
            3 => PaletteId::Minimal,
            4 => PaletteId::Cool,
            5 => PaletteId::Custom,
            _ => return None,
        })
    }
}

/// Advertised by the client; the server rendezvouses on this when producing
/// frames for that listener.
#[derive(Debug, Clone)]
pub struct TerminalCapabilities {
    pub color_level: ColorLevel,
    pub render_mode: RenderMode,
    pub cell_width: u16,
    pub cell_height: u16,
    pub utf8: bool,
    pub desired_fps: u8,
    pub palette: PaletteId,
    pub custom_palette: String, // <= 64 bytes
    pub capability_flags: CapabilityFlags,
    pub display_name: String, // <= 32 bytes, UTF-8
}

impl TerminalCapabilities {
    pub const MAX_CUSTOM_PALETTE_LEN: usize = 64;
    pub const MAX_DISPLAY_NAME_LEN: usize = 32;
    pub const MIN_FPS: u8 = 1;
    pub const MAX_FPS: u8 = 144;

    pub fn clamp_fps(fps: u8) -> u8 {
        fps.clamp(Self::MIN_FPS, Self::MAX_FPS)
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.color_level as u8);
        out.push(self.render_mode as u8);
        out.extend_from_slice(&self.cell_width.to_be_bytes());
        out.extend_from_slice(&self.cell_height.to_be_bytes());
        out.push(self.utf8 as u8);
        out.push(Self::clamp_fps(self.desired_fps));
        out.push(self.palette as u8);
        out.extend_from_slice(&self.capability_flags.bits().to_be_bytes());
        let name_bytes = self.display_name.as_bytes();
        let name_len = name_bytes.len().min(Self::MAX_DISPLAY_NAME_LEN);
        let mut name_buf = [0u8; Self::MAX_DISPLAY_NAME_LEN];
        name_buf[..name_len].copy_from_slice(&name_bytes[..name_len]);
        out.extend_from_slice(&name_buf);
        let pal_bytes = self.custom_palette.as_bytes();
        let pal_len = pal_bytes.len().min(Self::MAX_CUSTOM_PALETTE_LEN);
        out.push(pal_len as u8);
        out.extend_from_slice(&pal_bytes[..pal_len]);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let fixed_len = 1 + 1 + 2 + 2 + 1 + 1 + 1 + 4 + Self::MAX_DISPLAY_NAME_LEN + 1;
        need(buf, fixed_len, "CLIENT_CAPABILITIES")?;
        let mut i = 0;
        let color_level = ColorLevel::from_u8(buf[i]).ok_or_else(|| CoreError::protocol("bad color level"))?;
        i += 1;
        let render_mode = RenderMode::from_u8(buf[i]).ok_or_else(|| CoreError::protocol("bad render mode"))?;
        i += 1;
        let cell_width = u16::from_be_bytes(buf[i..i + 2].try_into().unwrap());
        i += 2;
        let cell_height = u16::from_be_bytes(buf[i..i + 2].try_into().unwrap());
        i += 2;
        let utf8 = buf[i] != 0;
        i += 1;
        let desired_fps = Self::clamp_fps(buf[i]);
        i += 1;
        let palette = PaletteId::from_u8(buf[i]).ok_or_else(|| CoreError::protocol("bad palette id"))?;
        i += 1;
        let capability_flags = CapabilityFlags::from_bits_truncate(u32::from_be_bytes(buf[i..i + 4].try_into().unwrap()));
        i += 4;
        let name_raw = &buf[i..i + Self::MAX_DISPLAY_NAME_LEN];
        let nul = name_raw.iter().position(|&b| b == 0).unwrap_or(name_raw.len());
        let display_name = String::from_utf8_lossy(&name_raw[..nul]).into_owned();
        i += Self::MAX_DISPLAY_NAME_LEN;
        let pal_len = buf[i] as usize;
        i += 1;
        need(buf, i + pal_len, "CLIENT_CAPABILITIES custom palette")?;
        let custom_palette = String::from_utf8_lossy(&buf[i..i + pal_len]).into_owned();
        Ok(Self {
            color_level,
            render_mode,
            cell_width,
            cell_height,
            utf8,
            desired_fps,
            palette,
            custom_palette,
            capability_flags,
            display_name,
        })
    }
}

// ---- SERVER_STATE --------------------------------------------------------

pub struct ServerStatePayload {
    pub connected_count: u32,
    pub active_count: u32,
}

impl ServerStatePayload {
    pub const LEN: usize = 4 + 4 + 6 * 4;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.connected_count.to_be_bytes());
        out.extend_from_slice(&self.active_count.to_be_bytes());
        out.extend_from_slice(&[0u8; 24]); // reserved[6] u32 slots
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        need(buf, 8, "SERVER_STATE")?;
        Ok(Self {
            connected_count: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            active_count: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
        })
    }
}

// ---- ENCRYPTED envelope ---------------------------------------------------

pub const NONCE_LEN: usize = 24;
pub const MAC_LEN: usize = 16;

pub struct EncryptedEnvelope<'a> {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext_and_mac: &'a [u8],
}

impl<'a> EncryptedEnvelope<'a> {
    pub fn encode(nonce: [u8; NONCE_LEN], ciphertext_and_mac: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(&nonce);
        out.extend_from_slice(ciphertext_and_mac);
    }

    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        need(buf, NONCE_LEN + MAC_LEN, "ENCRYPTED envelope")?;
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&buf[..NONCE_LEN]);
        Ok(Self { nonce, ciphertext_and_mac: &buf[NONCE_LEN..] })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_capabilities_round_trip() {
        let caps = TerminalCapabilities {
            color_level: ColorLevel::TrueColor,
            render_mode: RenderMode::HalfBlock,
            cell_width: 80,
            cell_height: 24,
            utf8: true,
            desired_fps: 30,
            palette: PaletteId::Blocks,
            custom_palette: String::new(),
            capability_flags: CapabilityFlags::VIDEO | CapabilityFlags::AUDIO,
            display_name: "alice".to_string(),
        };
        let mut buf = Vec::new();
        caps.encode(&mut buf);
        let decoded = TerminalCapabilities::decode(&buf).unwrap();
        assert_eq!(decoded.color_level, ColorLevel::TrueColor);
        assert_eq!(decoded.render_mode, RenderMode::HalfBlock);
        assert_eq!(decoded.cell_width, 80);
        assert_eq!(decoded.display_name, "alice");
        assert_eq!(decoded.desired_fps, 30);
    }

    #[test]
    fn fps_is_clamped() {
        assert_eq!(TerminalCapabilities::clamp_fps(0), 1);
        assert_eq!(TerminalCapabilities::clamp_fps(255), 144);
        assert_eq!(TerminalCapabilities::clamp_fps(60), 60);
    }

    #[test]
    fn audio_batch_samples_are_little_endian() {
        let header = AudioBatchHeader { batch_count: 1, total_samples: 2, sample_rate: 48000, channels: 1 };
        let mut buf = Vec::new();
        encode_audio_batch(&header, &[1.0, -1.0], &mut buf);
        // first sample 1.0f32 little-endian immediately after the header
        let le = 1.0f32.to_le_bytes();
        assert_eq!(&buf[AudioBatchHeader::LEN..AudioBatchHeader::LEN + 4], &le);
    }
}
