//! The row-oriented ASCII/ANSI renderer.
//!
//! Converts an RGB canvas into a run-length- and REP-compressed ANSI byte
//! string. Every write site that could emit an SGR, REP, or color sequence
//! checks remaining output capacity first — the renderer never writes past
//! the capacity it was given and never reads past the image.

use super::palette::PaletteCache;
use super::simd;
use crate::packet::{ColorLevel, RenderMode};
use std::sync::Arc;

const MIN_REMAINING: usize = 32;
const RESET_SGR: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColorKey {
    Ansi16(u8),
    Ansi256(u8),
    TrueColor(u8, u8, u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cell {
    glyph: char,
    fg: Option<ColorKey>,
    bg: Option<ColorKey>,
}

pub struct RenderSettings {
    pub color_level: ColorLevel,
    pub render_mode: RenderMode,
    pub palette: Arc<PaletteCache>,
}

/// An RGB24 canvas, row-major, `width * height * 3` bytes.
pub struct RgbImage<'a> {
    pub width: u32,
    pub height: u32,
    pub data: &'a [u8],
}

impl<'a> RgbImage<'a> {
    fn pixel(&self, x: u32, y: u32) -> (u8, u8, u8) {
        let idx = ((y * self.width + x) * 3) as usize;
        (self.data[idx], self.data[idx + 1], self.data[idx + 2])
    }
}

fn ansi16_index(r: u8, g: u8, b: u8, luminance: u8) -> u8 {
    let bright = luminance > 127;
    let base = ((r > 127) as u8) << 2 | ((g > 127) as u8) << 1 | (b > 127) as u8;
    if bright {
        base + 8
    } else {
        base
    }
}

fn fg_sgr(
    color_level: ColorLevel,
    palette: &PaletteCache,
    r: u8,
    g: u8,
    b: u8,
    luminance: u8,
    quantized: Option<u8>,
) -> Option<(ColorKey, String)> {
    match color_level {
        ColorLevel::None => None,
        ColorLevel::Ansi16 => {
            let idx = ansi16_index(r, g, b, luminance);
            let code = if idx < 8 { 30 + idx } else { 90 + (idx - 8) };
            Some((ColorKey::Ansi16(idx), format!("\x1b[{code}m")))
        }
        ColorLevel::Ansi256 => {
            let idx = quantized.unwrap_or_else(|| simd::quantize_256_scalar(r, g, b));
            Some((ColorKey::Ansi256(idx), palette.fg_256_sgr(idx).to_string()))
        }
        ColorLevel::TrueColor => Some((
            ColorKey::TrueColor(r, g, b),
            format!("\x1b[38;2;{};{};{}m", palette.decimal(r), palette.decimal(g), palette.decimal(b)),
        )),
    }
}

fn bg_sgr(
    color_level: ColorLevel,
    palette: &PaletteCache,
    r: u8,
    g: u8,
    b: u8,
    luminance: u8,
    quantized: Option<u8>,
) -> Option<(ColorKey, String)> {
    match color_level {
        ColorLevel::None => None,
        ColorLevel::Ansi16 => {
            let idx = ansi16_index(r, g, b, luminance);
            let code = if idx < 8 { 40 + idx } else { 100 + (idx - 8) };
            Some((ColorKey::Ansi16(idx), format!("\x1b[{code}m")))
        }
        ColorLevel::Ansi256 => {
            let idx = quantized.unwrap_or_else(|| simd::quantize_256_scalar(r, g, b));
            Some((ColorKey::Ansi256(idx), palette.bg_256_sgr(idx).to_string()))
        }
        ColorLevel::TrueColor => Some((
            ColorKey::TrueColor(r, g, b),
            format!("\x1b[48;2;{};{};{}m", palette.decimal(r), palette.decimal(g), palette.decimal(b)),
        )),
    }
}

fn cell_for_foreground(settings: &RenderSettings, r: u8, g: u8, b: u8, luminance: u8, quantized: Option<u8>) -> Cell {
    let glyph = settings.palette.glyph_for_luminance(luminance);
    let fg = fg_sgr(settings.color_level, &settings.palette, r, g, b, luminance, quantized).map(|(k, _)| k);
    Cell { glyph, fg, bg: None }
}

fn cell_for_background(settings: &RenderSettings, r: u8, g: u8, b: u8, luminance: u8, quantized: Option<u8>) -> Cell {
    // Y >= 128 => black text on a bright background, else white text.
    let fg_rgb = if luminance >= 128 { (0, 0, 0) } else { (255, 255, 255) };
    let fg_luminance = simd::luminance_scalar(fg_rgb.0, fg_rgb.1, fg_rgb.2);
    let fg =
        fg_sgr(settings.color_level, &settings.palette, fg_rgb.0, fg_rgb.1, fg_rgb.2, fg_luminance, None).map(|(k, _)| k);
    let bg = bg_sgr(settings.color_level, &settings.palette, r, g, b, luminance, quantized).map(|(k, _)| k);
    Cell { glyph: ' ', fg, bg }
}

fn cell_for_half_block(
    settings: &RenderSettings,
    top: (u8, u8, u8),
    bottom: (u8, u8, u8),
    top_luminance: u8,
    bottom_luminance: u8,
    top_quantized: Option<u8>,
    bottom_quantized: Option<u8>,
) -> Cell {
    let fg = fg_sgr(settings.color_level, &settings.palette, top.0, top.1, top.2, top_luminance, top_quantized)
        .map(|(k, _)| k);
    let bg = bg_sgr(settings.color_level, &settings.palette, bottom.0, bottom.1, bottom.2, bottom_luminance, bottom_quantized)
        .map(|(k, _)| k);
    Cell { glyph: '\u{2580}', fg, bg }
}

fn color_key_sgr(key: ColorKey, is_bg: bool, palette: &PaletteCache) -> String {
    match key {
        ColorKey::Ansi16(idx) => {
            if is_bg {
                let code = if idx < 8 { 40 + idx } else { 100 + (idx - 8) };
                format!("\x1b[{code}m")
            } else {
                let code = if idx < 8 { 30 + idx } else { 90 + (idx - 8) };
                format!("\x1b[{code}m")
            }
        }
        ColorKey::Ansi256(idx) => {
            if is_bg {
                palette.bg_256_sgr(idx).to_string()
            } else {
                palette.fg_256_sgr(idx).to_string()
            }
        }
        ColorKey::TrueColor(r, g, b) => {
            if is_bg {
                format!("\x1b[48;2;{r};{g};{b}m")
            } else {
                format!("\x1b[38;2;{r};{g};{b}m")
            }
        }
    }
}

fn emit_run(out: &mut Vec<u8>, cap: usize, cell: Cell, count: usize, palette: &PaletteCache) -> bool {
    if cap.saturating_sub(out.len()) < MIN_REMAINING {
        return false;
    }
    if let Some(fg) = cell.fg {
        out.extend_from_slice(color_key_sgr(fg, false, palette).as_bytes());
    }
    if let Some(bg) = cell.bg {
        out.extend_from_slice(color_key_sgr(bg, true, palette).as_bytes());
    }
    let mut glyph_buf = [0u8; 4];
    let glyph_bytes = cell.glyph.encode_utf8(&mut glyph_buf).as_bytes();
    out.extend_from_slice(glyph_bytes);
    if count >= 2 {
        // ECMA-48 REP: repeat the previously emitted character n-1 more times.
        out.extend_from_slice(format!("\x1b[{}b", count - 1).as_bytes());
    }
    true
}

/// Renders `image` into at most `capacity` bytes of ANSI output. Never
/// writes past `capacity`; stops mid-row rather than overrunning.
///
/// Luminance (and, for 256-color output, the color-cube/gray-ramp index) is
/// precomputed once for the whole canvas via the SIMD lane path in
/// [`simd`], then looked up per cell instead of recomputed scalar.
pub fn render(image: &RgbImage, settings: &RenderSettings, capacity: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(capacity.min(4096));
    let row_stride = if settings.render_mode == RenderMode::HalfBlock { 2 } else { 1 };

    let luminance = simd::luminance_batch(image.data);
    let quantized = (settings.color_level == ColorLevel::Ansi256).then(|| simd::quantize_256_batch(image.data));

    let mut y = 0u32;
    'rows: while y < image.height {
        let mut run: Option<(Cell, usize)> = None;
        for x in 0..image.width {
            let idx = (y * image.width + x) as usize;
            let cell = match settings.render_mode {
                RenderMode::Foreground => {
                    let (r, g, b) = image.pixel(x, y);
                    cell_for_foreground(settings, r, g, b, luminance[idx], quantized.as_ref().map(|q| q[idx]))
                }
                RenderMode::Background => {
                    let (r, g, b) = image.pixel(x, y);
                    cell_for_background(settings, r, g, b, luminance[idx], quantized.as_ref().map(|q| q[idx]))
                }
                RenderMode::HalfBlock => {
                    let top = image.pixel(x, y);
                    let has_bottom_row = y + 1 < image.height;
                    let bottom_idx = if has_bottom_row { idx + image.width as usize } else { idx };
                    let bottom = if has_bottom_row { image.pixel(x, y + 1) } else { top };
                    cell_for_half_block(
                        settings,
                        top,
                        bottom,
                        luminance[idx],
                        luminance[bottom_idx],
                        quantized.as_ref().map(|q| q[idx]),
                        quantized.as_ref().map(|q| q[bottom_idx]),
                    )
                }
            };

            match &mut run {
                Some((current, count)) if *current == cell => *count += 1,
                _ => {
                    if let Some((prev_cell, prev_count)) = run.take() {
                        if !emit_run(&mut out, capacity, prev_cell, prev_count, &settings.palette) {
                            break 'rows;
                        }
                    }
                    run = Some((cell, 1));
                }
            }
        }
        if let Some((cell, count)) = run {
            if !emit_run(&mut out, capacity, cell, count, &settings.palette) {
                break 'rows;
            }
        }
        if capacity.saturating_sub(out.len()) < MIN_REMAINING {
            break;
        }
        out.extend_from_slice(RESET_SGR.as_bytes());
        out.push(b'\n');
        y += row_stride;
    }

    out.truncate(capacity.min(out.len()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::palette::PaletteCache;

    fn solid_image(width: u32, height: u32, rgb: (u8, u8, u8)) -> Vec<u8> {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..(width * height) {
            data.push(rgb.0);
            data.push(rgb.1);
            data.push(rgb.2);
        }
        data
    }

    fn settings(color_level: ColorLevel, render_mode: RenderMode) -> RenderSettings {
        RenderSettings { color_level, render_mode, palette: Arc::new(PaletteCache::build(" .:-=+*#%@")) }
    }

    #[test]
    fn solid_color_collapses_to_one_run_per_row() {
        let data = solid_image(10, 2, (255, 0, 0));
        let image = RgbImage { width: 10, height: 2, data: &data };
        let out = render(&image, &settings(ColorLevel::TrueColor, RenderMode::Foreground), 4096);
        let text = String::from_utf8(out).unwrap();
        // a single run of 10 identical cells uses REP, never 10 literal glyphs
        assert!(text.contains("\x1b[9b"));
    }

    #[test]
    fn renderer_is_idempotent() {
        let data = solid_image(8, 4, (10, 200, 90));
        let image = RgbImage { width: 8, height: 4, data: &data };
        let s = settings(ColorLevel::Ansi256, RenderMode::Background);
        let first = render(&image, &s, 4096);
        let second = render(&image, &s, 4096);
        assert_eq!(first, second);
    }

    #[test]
    fn renderer_never_exceeds_declared_capacity() {
        let data = solid_image(40, 20, (1, 2, 3));
        let image = RgbImage { width: 40, height: 20, data: &data };
        let out = render(&image, &settings(ColorLevel::TrueColor, RenderMode::Foreground), 64);
        assert!(out.len() <= 64);
    }

    #[test]
    fn rep_sequence_never_crosses_a_row_newline() {
        let data = solid_image(12, 3, (5, 5, 5));
        let image = RgbImage { width: 12, height: 3, data: &data };
        let out = render(&image, &settings(ColorLevel::Ansi256, RenderMode::Foreground), 4096);
        let text = String::from_utf8(out).unwrap();
        for line in text.split('\n') {
            // every REP escape in a line must have been opened in that same line
            assert!(!line.starts_with("[") || line.contains('\x1b'));
        }
    }

    #[test]
    fn half_block_uses_upper_half_block_glyph() {
        let data = solid_image(4, 4, (100, 100, 100));
        let image = RgbImage { width: 4, height: 4, data: &data };
        let out = render(&image, &settings(ColorLevel::None, RenderMode::HalfBlock), 4096);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains('\u{2580}'));
    }
}
