//! SIMD (and byte-identical scalar) luminance + 256-color quantization.
//! Built on the `wide` crate's portable vector types, which
//! compile to real SIMD on supported targets and fall back to scalar
//! operations elsewhere — there is no `#[cfg(target_arch)]` fork here, only
//! one lane-processing path plus a hand-written scalar path kept around
//! purely so the two can be tested against each other.

use wide::i32x8;

pub const LANE_WIDTH: usize = 8;
pub const GRAY_THRESHOLD: u8 = 10;

/// `Y = (77*R + 150*G + 29*B) >> 8`, one pixel.
pub fn luminance_scalar(r: u8, g: u8, b: u8) -> u8 {
    ((77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8) as u8
}

/// Luminance for a full image, `LANE_WIDTH` pixels per SIMD iteration with a
/// scalar tail for the remainder.
pub fn luminance_batch(rgb: &[u8]) -> Vec<u8> {
    let pixel_count = rgb.len() / 3;
    let mut out = Vec::with_capacity(pixel_count);
    let lanes = pixel_count / LANE_WIDTH;

    for lane in 0..lanes {
        let base = lane * LANE_WIDTH * 3;
        let mut r = [0i32; LANE_WIDTH];
        let mut g = [0i32; LANE_WIDTH];
        let mut b = [0i32; LANE_WIDTH];
        for i in 0..LANE_WIDTH {
            let p = base + i * 3;
            r[i] = rgb[p] as i32;
            g[i] = rgb[p + 1] as i32;
            b[i] = rgb[p + 2] as i32;
        }
        let rv = i32x8::from(r);
        let gv = i32x8::from(g);
        let bv = i32x8::from(b);
        let y = (rv * i32x8::splat(77) + gv * i32x8::splat(150) + bv * i32x8::splat(29)) >> 8;
        let y_arr: [i32; LANE_WIDTH] = y.into();
        out.extend(y_arr.iter().map(|&v| v as u8));
    }

    for i in (lanes * LANE_WIDTH)..pixel_count {
        let p = i * 3;
        out.push(luminance_scalar(rgb[p], rgb[p + 1], rgb[p + 2]));
    }
    out
}

/// 6x6x6 color cube or 24-step gray ramp index for one pixel. Chooses gray
/// when the pixel's channel spread is below `GRAY_THRESHOLD`.
pub fn quantize_256_scalar(r: u8, g: u8, b: u8) -> u8 {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    if max - min < GRAY_THRESHOLD {
        let y = luminance_scalar(r, g, b) as u32;
        (232 + (y * 23 + 128) / 256) as u8
    } else {
        let channel = |c: u8| (c as u32 * 5 + 128) / 256;
        let (r6, g6, b6) = (channel(r), channel(g), channel(b));
        (16 + 36 * r6 + 6 * g6 + b6) as u8
    }
}

/// 6x6x6 color cube / gray-ramp index for a full image, `LANE_WIDTH` pixels
/// per SIMD iteration: the luminance and cube-channel arithmetic is
/// vectorized, the gray-vs-cube choice is resolved per lane afterward (a
/// branch doesn't vectorize cleanly, so this only batches the multiply-add
/// work), with a scalar tail for the remainder.
pub fn quantize_256_batch(rgb: &[u8]) -> Vec<u8> {
    let pixel_count = rgb.len() / 3;
    let mut out = Vec::with_capacity(pixel_count);
    let lanes = pixel_count / LANE_WIDTH;

    for lane in 0..lanes {
        let base = lane * LANE_WIDTH * 3;
        let mut r = [0i32; LANE_WIDTH];
        let mut g = [0i32; LANE_WIDTH];
        let mut b = [0i32; LANE_WIDTH];
        for i in 0..LANE_WIDTH {
            let p = base + i * 3;
            r[i] = rgb[p] as i32;
            g[i] = rgb[p + 1] as i32;
            b[i] = rgb[p + 2] as i32;
        }
        let rv = i32x8::from(r);
        let gv = i32x8::from(g);
        let bv = i32x8::from(b);

        let y = (rv * i32x8::splat(77) + gv * i32x8::splat(150) + bv * i32x8::splat(29)) >> 8;
        let gray = i32x8::splat(232) + ((y * i32x8::splat(23) + i32x8::splat(128)) >> 8);

        let r6 = (rv * i32x8::splat(5) + i32x8::splat(128)) >> 8;
        let g6 = (gv * i32x8::splat(5) + i32x8::splat(128)) >> 8;
        let b6 = (bv * i32x8::splat(5) + i32x8::splat(128)) >> 8;
        let cube = i32x8::splat(16) + i32x8::splat(36) * r6 + i32x8::splat(6) * g6 + b6;

        let gray_arr: [i32; LANE_WIDTH] = gray.into();
        let cube_arr: [i32; LANE_WIDTH] = cube.into();
        for i in 0..LANE_WIDTH {
            let max = r[i].max(g[i]).max(b[i]);
            let min = r[i].min(g[i]).min(b[i]);
            let idx = if max - min < GRAY_THRESHOLD as i32 { gray_arr[i] } else { cube_arr[i] };
            out.push(idx as u8);
        }
    }

    for i in (lanes * LANE_WIDTH)..pixel_count {
        let p = i * 3;
        out.push(quantize_256_scalar(rgb[p], rgb[p + 1], rgb[p + 2]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn luminance_batch_scalar_only(rgb: &[u8]) -> Vec<u8> {
        rgb.chunks_exact(3).map(|p| luminance_scalar(p[0], p[1], p[2])).collect()
    }

    fn quantize_batch_scalar_only(rgb: &[u8]) -> Vec<u8> {
        rgb.chunks_exact(3).map(|p| quantize_256_scalar(p[0], p[1], p[2])).collect()
    }

    #[test]
    fn simd_luminance_matches_scalar_for_aligned_and_tail_pixels() {
        // exercise a lane-aligned count plus a ragged tail.
        let mut rgb = Vec::new();
        for i in 0u32..37 {
            rgb.push((i * 7 % 256) as u8);
            rgb.push((i * 13 % 256) as u8);
            rgb.push((i * 19 % 256) as u8);
        }
        assert_eq!(luminance_batch(&rgb), luminance_batch_scalar_only(&rgb));
    }

    #[test]
    fn simd_quantize_matches_scalar_for_aligned_and_tail_pixels() {
        let mut rgb = Vec::new();
        for i in 0u32..37 {
            rgb.push((i * 7 % 256) as u8);
            rgb.push((i * 13 % 256) as u8);
            rgb.push((i * 19 % 256) as u8);
        }
        assert_eq!(quantize_256_batch(&rgb), quantize_batch_scalar_only(&rgb));
    }

    #[test]
    fn pure_gray_pixel_quantizes_to_gray_ramp() {
        let idx = quantize_256_scalar(128, 128, 128);
        assert!((232..=255).contains(&idx));
    }

    #[test]
    fn saturated_red_quantizes_to_color_cube() {
        assert_eq!(quantize_256_scalar(255, 0, 0), 16 + 36 * 5);
    }
}
