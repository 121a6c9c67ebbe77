//! 8-bit quantization with optional dithering.
//!
//! Input is a float RGB stream (three values per pixel, nominally `[0, 1]`);
//! output is RGBA8 with alpha copied from the source pixels.

use crate::core::types::DitherKind;
use rayon::prelude::*;

const LEVELS: f32 = 255.0;

/// Integer hash with good avalanche, used for reproducible noise.
#[inline]
pub fn wang_hash(mut x: u32) -> u32 {
    x = (x ^ 61) ^ (x >> 16);
    x = x.wrapping_mul(9);
    x ^= x >> 4;
    x = x.wrapping_mul(0x27d4eb2d);
    x ^= x >> 15;
    x
}

/// Deterministic per-pixel noise keyed by a task seed and global coordinates.
///
/// `row_offset` is the image row of the first row in the buffer being
/// processed, so stripes of one image draw from a single noise field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NoiseField {
    /// Task seed.
    pub seed: u32,
    /// Image row of the buffer's first row.
    pub row_offset: u32,
}

impl NoiseField {
    /// Create a field for rows starting at `row_offset`.
    pub fn new(seed: u32, row_offset: u32) -> Self {
        Self { seed, row_offset }
    }

    /// Uniform value in `[0, 1]` for a local pixel and channel.
    #[inline]
    pub fn unit(&self, x: u32, local_y: u32, channel: u32) -> f32 {
        let y = self.row_offset.wrapping_add(local_y);
        let mut h = wang_hash(y.wrapping_mul(3).wrapping_add(channel) ^ self.seed.rotate_left(16));
        h = wang_hash(h ^ x);
        h = wang_hash(h.wrapping_add(self.seed));
        h as f32 / u32::MAX as f32
    }

    /// Uniform value in `[-1, 1]`.
    #[inline]
    pub fn signed(&self, x: u32, local_y: u32, channel: u32) -> f32 {
        self.unit(x, local_y, channel) * 2.0 - 1.0
    }
}

/// Round a float channel to the nearest 8-bit level.
#[inline]
pub fn quantize_channel(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * LEVELS).round() as u8
}

/// Quantize `rgb` into `out`, copying alpha from `alpha_src`.
///
/// `alpha_src` and `out` hold four bytes per pixel; `width` is the row
/// length in pixels. Floyd-Steinberg runs in raster order within the
/// buffer, so callers splitting an image must pass
/// [`DitherKind::effective_for`] instead of the requested kind.
pub fn quantize(
    kind: DitherKind,
    rgb: &[f32],
    alpha_src: &[u8],
    width: usize,
    out: &mut [u8],
    noise: NoiseField,
) {
    debug_assert_eq!(rgb.len() / 3, out.len() / 4);
    debug_assert_eq!(alpha_src.len(), out.len());
    if width == 0 {
        return;
    }
    match kind {
        DitherKind::None => quantize_nearest(rgb, alpha_src, out),
        DitherKind::Random => quantize_random(rgb, alpha_src, width, out, noise),
        DitherKind::FloydSteinberg => quantize_floyd_steinberg(rgb, alpha_src, width, out),
    }
}

fn quantize_nearest(rgb: &[f32], alpha_src: &[u8], out: &mut [u8]) {
    out.par_chunks_exact_mut(4)
        .zip(rgb.par_chunks_exact(3))
        .zip(alpha_src.par_chunks_exact(4))
        .for_each(|((dst, px), src)| {
            dst[0] = quantize_channel(px[0]);
            dst[1] = quantize_channel(px[1]);
            dst[2] = quantize_channel(px[2]);
            dst[3] = src[3];
        });
}

fn quantize_random(rgb: &[f32], alpha_src: &[u8], width: usize, out: &mut [u8], noise: NoiseField) {
    out.par_chunks_exact_mut(4)
        .zip(rgb.par_chunks_exact(3))
        .zip(alpha_src.par_chunks_exact(4))
        .enumerate()
        .for_each(|(i, ((dst, px), src))| {
            let x = (i % width) as u32;
            let y = (i / width) as u32;
            for c in 0..3 {
                let level = px[c].clamp(0.0, 1.0) * LEVELS + noise.signed(x, y, c as u32);
                dst[c] = level.round().clamp(0.0, LEVELS) as u8;
            }
            dst[3] = src[3];
        });
}

fn quantize_floyd_steinberg(rgb: &[f32], alpha_src: &[u8], width: usize, out: &mut [u8]) {
    let rows = rgb.len() / (width * 3);
    // one padding pixel on each side absorbs edge diffusion
    let padded = (width + 2) * 3;
    let mut current = vec![0.0f32; padded];
    let mut next = vec![0.0f32; padded];

    for y in 0..rows {
        for x in 0..width {
            let i = y * width + x;
            let e = (x + 1) * 3;
            for c in 0..3 {
                let value = (rgb[i * 3 + c] + current[e + c]).clamp(0.0, 1.0);
                let level = (value * LEVELS).round();
                out[i * 4 + c] = level as u8;

                let err = value - level / LEVELS;
                current[e + 3 + c] += err * (7.0 / 16.0);
                next[e - 3 + c] += err * (3.0 / 16.0);
                next[e + c] += err * (5.0 / 16.0);
                next[e + 3 + c] += err * (1.0 / 16.0);
            }
            out[i * 4 + 3] = alpha_src[i * 4 + 3];
        }
        std::mem::swap(&mut current, &mut next);
        next.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: usize, height: usize) -> (Vec<f32>, Vec<u8>) {
        let mut rgb = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            for x in 0..width {
                let t = x as f32 / (width - 1) as f32;
                rgb.extend_from_slice(&[t, 1.0 - t, (y as f32 * 0.013) % 1.0]);
            }
        }
        let alpha = (0..width * height).flat_map(|i| [0, 0, 0, (i % 256) as u8]).collect();
        (rgb, alpha)
    }

    fn run(kind: DitherKind, rgb: &[f32], alpha: &[u8], width: usize, seed: u32) -> Vec<u8> {
        let mut out = vec![0u8; alpha.len()];
        quantize(kind, rgb, alpha, width, &mut out, NoiseField::new(seed, 0));
        out
    }

    #[test]
    fn test_wang_hash_reference_values() {
        assert_eq!(wang_hash(0), wang_hash(0));
        assert_ne!(wang_hash(1), wang_hash(2));
        assert_ne!(wang_hash(0), 0);
    }

    #[test]
    fn test_nearest_is_deterministic_rounding() {
        let (rgb, alpha) = gradient(64, 8);
        let a = run(DitherKind::None, &rgb, &alpha, 64, 1);
        let b = run(DitherKind::None, &rgb, &alpha, 64, 999);
        assert_eq!(a, b);
        for (i, px) in a.chunks(4).enumerate() {
            assert_eq!(px[0], quantize_channel(rgb[i * 3]));
            assert_eq!(px[3], alpha[i * 4 + 3]);
        }
    }

    #[test]
    fn test_floyd_steinberg_within_one_step() {
        let (rgb, alpha) = gradient(97, 31);
        let plain = run(DitherKind::None, &rgb, &alpha, 97, 0);
        let dithered = run(DitherKind::FloydSteinberg, &rgb, &alpha, 97, 0);
        let mut changed = 0;
        for (i, (p, d)) in plain.iter().zip(&dithered).enumerate() {
            if i % 4 == 3 {
                assert_eq!(p, d);
                continue;
            }
            assert!((*p as i32 - *d as i32).abs() <= 1, "pixel byte {}: {} vs {}", i, p, d);
            if p != d {
                changed += 1;
            }
        }
        assert!(changed > 0);
    }

    #[test]
    fn test_floyd_steinberg_preserves_mean() {
        // a flat value halfway between two levels should average out
        let width = 50;
        let rgb = vec![100.5 / 255.0; width * 20 * 3];
        let alpha = vec![255u8; width * 20 * 4];
        let out = run(DitherKind::FloydSteinberg, &rgb, &alpha, width, 0);
        let reds: Vec<f32> = out.chunks(4).map(|p| p[0] as f32).collect();
        let mean = reds.iter().sum::<f32>() / reds.len() as f32;
        assert!((mean - 100.5).abs() < 0.1, "mean {}", mean);
        assert!(reds.iter().all(|&v| v == 100.0 || v == 101.0));
    }

    #[test]
    fn test_random_is_seeded_and_bounded() {
        let (rgb, alpha) = gradient(64, 16);
        let plain = run(DitherKind::None, &rgb, &alpha, 64, 0);
        let a = run(DitherKind::Random, &rgb, &alpha, 64, 7);
        let b = run(DitherKind::Random, &rgb, &alpha, 64, 7);
        let c = run(DitherKind::Random, &rgb, &alpha, 64, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        for (p, d) in plain.iter().zip(&a) {
            assert!((*p as i32 - *d as i32).abs() <= 1);
        }
    }

    #[test]
    fn test_noise_field_is_continuous_across_offsets() {
        let whole = NoiseField::new(42, 0);
        let lower = NoiseField::new(42, 10);
        assert_eq!(whole.signed(3, 12, 1), lower.signed(3, 2, 1));
        let v = whole.signed(0, 0, 0);
        assert!((-1.0..=1.0).contains(&v));
    }

    #[test]
    fn test_random_noise_is_roughly_uniform() {
        let field = NoiseField::new(5, 0);
        let n = 20_000;
        let mean: f32 = (0..n).map(|i| field.signed(i % 200, i / 200, 0)).sum::<f32>() / n as f32;
        assert!(mean.abs() < 0.03, "mean {}", mean);
    }
}
