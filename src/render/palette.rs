//! Process-wide palette cache: an immutable, shared, reference-counted
//! configuration object built once per distinct palette string, instead of
//! a global mutable cache rebuilt on every lookup.
//!
//! Each distinct palette string gets exactly one [`PaletteCache`], built
//! once and shared via `Arc` across every session that negotiated it.
//! There is no in-place mutation; a different palette means a different
//! cache entry, never a rebuild of an existing one.

use std::sync::Arc;

/// Glyph ramp + precomputed lookup tables for one palette string.
pub struct PaletteCache {
    /// Ordered light -> dark glyphs, one `char` per palette position.
    glyphs: Vec<char>,
    /// `luminance (0..=255) -> index into glyphs`.
    glyph_index: [u8; 256],
    /// Precomputed decimal strings for `0..=255`, used when formatting
    /// truecolor / 256-color SGR components.
    decimal: [String; 256],
    fg_256: [String; 256],
    bg_256: [String; 256],
}

/// `idx = floor(Y * palette_len / 255)`, computed with an integer identity
/// so it matches bit-for-bit across platforms without floating point.
fn glyph_index_for(luminance: u8, palette_len: usize) -> usize {
    let x = luminance as u32 * palette_len as u32;
    (((x + 1 + (x / 256)) >> 8) as usize).min(palette_len - 1)
}

impl PaletteCache {
    pub fn build(palette: &str) -> Self {
        let glyphs: Vec<char> = if palette.is_empty() { vec![' '] } else { palette.chars().collect() };
        let len = glyphs.len();
        let mut glyph_index = [0u8; 256];
        for (luminance, slot) in glyph_index.iter_mut().enumerate() {
            *slot = glyph_index_for(luminance as u8, len) as u8;
        }
        let decimal = std::array::from_fn(|n| n.to_string());
        let fg_256 = std::array::from_fn(|n| format!("\x1b[38;5;{n}m"));
        let bg_256 = std::array::from_fn(|n| format!("\x1b[48;5;{n}m"));
        Self { glyphs, glyph_index, decimal, fg_256, bg_256 }
    }

    pub fn glyph_for_luminance(&self, luminance: u8) -> char {
        self.glyphs[self.glyph_index[luminance as usize] as usize]
    }

    pub fn decimal(&self, component: u8) -> &str {
        &self.decimal[component as usize]
    }

    pub fn fg_256_sgr(&self, index: u8) -> &str {
        &self.fg_256[index as usize]
    }

    pub fn bg_256_sgr(&self, index: u8) -> &str {
        &self.bg_256[index as usize]
    }

    pub fn palette_len(&self) -> usize {
        self.glyphs.len()
    }
}

/// Process-wide registry of palette caches keyed by their source string, so
/// every session sharing a palette shares one `Arc<PaletteCache>` instead of
/// rebuilding the SGR tables per connection.
pub struct PaletteRegistry {
    caches: dashmap::DashMap<String, Arc<PaletteCache>>,
}

impl PaletteRegistry {
    pub fn new() -> Self {
        Self { caches: dashmap::DashMap::new() }
    }

    pub fn get_or_build(&self, palette: &str) -> Arc<PaletteCache> {
        if let Some(existing) = self.caches.get(palette) {
            return existing.clone();
        }
        let cache = Arc::new(PaletteCache::build(palette));
        self.caches.insert(palette.to_string(), cache.clone());
        cache
    }
}

impl Default for PaletteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glyph_index_is_monotonic_light_to_dark() {
        let cache = PaletteCache::build(" .:-=+*#%@");
        let mut last = 0usize;
        for luminance in 0u8..=255 {
            let idx = cache.glyph_index[luminance as usize] as usize;
            assert!(idx >= last || idx == last);
            last = idx;
        }
        assert_eq!(cache.glyph_index[0], 0);
        assert_eq!(cache.glyph_index[255] as usize, cache.palette_len() - 1);
    }

    #[test]
    fn registry_reuses_cache_for_identical_palette_string() {
        let registry = PaletteRegistry::new();
        let a = registry.get_or_build("abc");
        let b = registry.get_or_build("abc");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn single_character_palette_never_panics() {
        let cache = PaletteCache::build("#");
        assert_eq!(cache.glyph_for_luminance(0), '#');
        assert_eq!(cache.glyph_for_luminance(255), '#');
    }
}
