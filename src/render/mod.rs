//! Palette cache, luminance/quantization, and the row-oriented RLE/REP
//! ANSI renderer.

pub mod ascii;
pub mod palette;
mod simd;

pub use ascii::{render, RenderSettings, RgbImage};
pub use palette::{PaletteCache, PaletteRegistry};
pub use simd::{luminance_batch, luminance_scalar, quantize_256_scalar, GRAY_THRESHOLD};
