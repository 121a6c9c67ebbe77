//! Luminance-zoned film grain.
//!
//! Grain is Gaussian noise (Box-Muller over a sine hash of the grain-space
//! coordinate) whose strength and size depend on whether the pixel falls in
//! the shadows, midtones or highlights. Noise is keyed on global image
//! coordinates, so an image processed in stripes is seamless.

use crate::color::dither::wang_hash;
use crate::core::error::{EngineError, EngineResult};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Scales configured strengths to a visually moderate noise amplitude.
const NOISE_INTENSITY_FACTOR: f32 = 0.1;

/// Half-width of the smoothstep between tonal zones, in luminance units.
const TRANSITION_WIDTH: f32 = 0.04;

/// Film grain parameters. Ratios are relative to the midtones and the green channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilmGrainConfig {
    /// Overall strength, 0 disables grain.
    pub global_strength: f32,
    /// Base grain size (0.1 to 10).
    pub grain_size: f32,
    /// Shadow/midtone boundary on the 0-255 luminance scale.
    pub shadow_threshold: u8,
    /// Midtone/highlight boundary on the 0-255 luminance scale.
    pub highlight_threshold: u8,
    /// Strength multiplier in shadows.
    pub shadow_strength_ratio: f32,
    /// Strength multiplier in midtones.
    pub midtone_strength_ratio: f32,
    /// Strength multiplier in highlights.
    pub highlight_strength_ratio: f32,
    /// Size multiplier in shadows.
    pub shadow_size_ratio: f32,
    /// Size multiplier in highlights.
    pub highlight_size_ratio: f32,
    /// Red channel weight.
    pub red_ratio: f32,
    /// Green channel weight.
    pub green_ratio: f32,
    /// Blue channel weight.
    pub blue_ratio: f32,
    /// How much the three channels share one noise sample (0 to 1).
    pub channel_correlation: f32,
    /// Final attenuation that limits color shifts (0.9 to 1).
    pub color_preservation: f32,
}

impl Default for FilmGrainConfig {
    fn default() -> Self {
        Self {
            global_strength: 0.5,
            grain_size: 1.0,
            shadow_threshold: 85,
            highlight_threshold: 170,
            shadow_strength_ratio: 0.6,
            midtone_strength_ratio: 1.0,
            highlight_strength_ratio: 0.3,
            shadow_size_ratio: 1.5,
            highlight_size_ratio: 0.6,
            red_ratio: 0.9,
            green_ratio: 1.0,
            blue_ratio: 1.2,
            channel_correlation: 0.9,
            color_preservation: 0.95,
        }
    }
}

impl FilmGrainConfig {
    /// Classic film stock look.
    pub fn classic_film() -> Self {
        Self {
            global_strength: 0.4,
            grain_size: 1.2,
            shadow_strength_ratio: 0.7,
            highlight_strength_ratio: 0.25,
            ..Self::default()
        }
    }

    /// Barely visible grain.
    pub fn subtle() -> Self {
        Self {
            global_strength: 0.25,
            grain_size: 0.8,
            shadow_strength_ratio: 0.5,
            highlight_strength_ratio: 0.2,
            ..Self::default()
        }
    }

    /// Coarse, strong grain.
    pub fn heavy() -> Self {
        Self {
            global_strength: 0.7,
            grain_size: 1.8,
            shadow_strength_ratio: 0.8,
            highlight_strength_ratio: 0.3,
            ..Self::default()
        }
    }

    /// Look up a preset by name.
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().replace('-', "_").as_str() {
            "default" => Some(Self::default()),
            "classic" | "classic_film" => Some(Self::classic_film()),
            "subtle" => Some(Self::subtle()),
            "heavy" => Some(Self::heavy()),
            _ => None,
        }
    }

    /// Set the global strength.
    pub fn with_strength(mut self, strength: f32) -> Self {
        self.global_strength = strength;
        self
    }

    /// Set the base grain size.
    pub fn with_grain_size(mut self, size: f32) -> Self {
        self.grain_size = size;
        self
    }

    /// Check if this configuration would change any pixel.
    pub fn is_active(&self) -> bool {
        self.global_strength > 0.0 && self.grain_size > 0.0
    }

    /// Reject values the grain model cannot use.
    pub fn validate(&self) -> EngineResult<()> {
        let values = [
            self.global_strength,
            self.grain_size,
            self.shadow_strength_ratio,
            self.midtone_strength_ratio,
            self.highlight_strength_ratio,
            self.shadow_size_ratio,
            self.highlight_size_ratio,
            self.red_ratio,
            self.green_ratio,
            self.blue_ratio,
            self.channel_correlation,
            self.color_preservation,
        ];
        if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(EngineError::InvalidInput(
                "film grain parameters must be finite and non-negative".to_string(),
            ));
        }
        if !(0.1..=10.0).contains(&self.grain_size) && self.grain_size != 0.0 {
            return Err(EngineError::InvalidInput(format!(
                "grain size must be within 0.1..=10, got {}",
                self.grain_size
            )));
        }
        if self.shadow_threshold >= self.highlight_threshold {
            return Err(EngineError::InvalidInput(
                "shadow threshold must be below highlight threshold".to_string(),
            ));
        }
        Ok(())
    }

    /// Interpolate a per-zone value across the tonal range.
    fn zoned(&self, luminance: f32, shadow: f32, midtone: f32, highlight: f32) -> f32 {
        let low = self.shadow_threshold as f32 / 255.0;
        let high = self.highlight_threshold as f32 / 255.0;
        if luminance < low - TRANSITION_WIDTH {
            shadow
        } else if luminance < low + TRANSITION_WIDTH {
            mix(shadow, midtone, smoothstep((luminance - (low - TRANSITION_WIDTH)) / (2.0 * TRANSITION_WIDTH)))
        } else if luminance < high - TRANSITION_WIDTH {
            midtone
        } else if luminance < high + TRANSITION_WIDTH {
            mix(midtone, highlight, smoothstep((luminance - (high - TRANSITION_WIDTH)) / (2.0 * TRANSITION_WIDTH)))
        } else {
            highlight
        }
    }

    /// Strength ratio at a luminance in `[0, 1]`.
    pub fn strength_ratio(&self, luminance: f32) -> f32 {
        self.zoned(
            luminance,
            self.shadow_strength_ratio,
            self.midtone_strength_ratio,
            self.highlight_strength_ratio,
        )
    }

    /// Size ratio at a luminance in `[0, 1]`.
    pub fn size_ratio(&self, luminance: f32) -> f32 {
        self.zoned(luminance, self.shadow_size_ratio, 1.0, self.highlight_size_ratio)
    }
}

/// Where a buffer sits inside the full image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrainFrame {
    /// Full image width.
    pub image_width: u32,
    /// Full image height.
    pub image_height: u32,
    /// Image row of the first buffer row.
    pub row_offset: u32,
}

/// Add film grain to a float RGB buffer of full-width rows.
pub fn apply_grain(rgb: &mut [f32], frame: GrainFrame, seed: u32, config: &FilmGrainConfig) {
    if !config.is_active() || frame.image_width == 0 {
        return;
    }
    let width = frame.image_width as usize;
    let grain_seed = grain_seed(seed);
    // grain scales with the average side so it looks alike across resolutions
    let normalized_freq = (frame.image_width as f32 + frame.image_height as f32) * 0.5 / 1000.0;

    rgb.par_chunks_exact_mut(3).enumerate().for_each(|(i, px)| {
        let luminance = (0.299 * px[0] + 0.587 * px[1] + 0.114 * px[2]).clamp(0.0, 1.0);
        let strength_ratio = config.strength_ratio(luminance);
        let size_ratio = config.size_ratio(luminance);
        let noise_strength = config.global_strength
            * strength_ratio
            * config.grain_size
            * size_ratio
            * NOISE_INTENSITY_FACTOR;
        if noise_strength <= 0.0 {
            return;
        }

        let scale = config.grain_size * size_ratio * normalized_freq;
        let x = (i % width) as f32 / scale;
        let y = (frame.row_offset as usize + i / width) as f32 / scale;

        let base = gaussian_noise(x, y, grain_seed);
        let ratios = [config.red_ratio, config.green_ratio, config.blue_ratio];
        for c in 0..3 {
            let independent = gaussian_noise(x, y, grain_seed + 0.1 * (c + 1) as f32);
            let noise = mix(independent, base, config.channel_correlation) * ratios[c];
            px[c] = (px[c] + noise * noise_strength * config.color_preservation).clamp(0.0, 1.0);
        }
    });
}

/// Map a task seed into the float seed range used by the hash.
fn grain_seed(seed: u32) -> f32 {
    (wang_hash(seed) % 1_000_000) as f32 / 1000.0
}

#[inline]
fn fract(x: f32) -> f32 {
    x - x.floor()
}

/// Two-tap sine hash in `[0, 1)`.
#[inline]
fn random_improved(x: f32, y: f32, seed: f32) -> f32 {
    let px = x + seed;
    let py = y + seed;
    let h1 = fract((px * 127.1 + py * 311.7).sin() * 43758.547);
    let h2 = fract((px * 269.5 + py * 183.3).sin() * 43758.547);
    fract(h1 + h2)
}

/// Standard normal sample via Box-Muller.
#[inline]
fn gaussian_noise(x: f32, y: f32, seed: f32) -> f32 {
    let u1 = random_improved(x, y, seed).max(0.0001);
    let u2 = random_improved(x, y, seed + 0.5);
    (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
}

#[inline]
fn smoothstep(t: f32) -> f32 {
    let x = t.clamp(0.0, 1.0);
    x * x * (3.0 - 2.0 * x)
}

#[inline]
fn mix(a: f32, b: f32, t: f32) -> f32 {
    a * (1.0 - t) + b * t
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(width: usize, height: usize, value: f32) -> Vec<f32> {
        vec![value; width * height * 3]
    }

    fn frame(width: u32, height: u32, row_offset: u32) -> GrainFrame {
        GrainFrame {
            image_width: width,
            image_height: height,
            row_offset,
        }
    }

    #[test]
    fn test_presets() {
        assert_eq!(FilmGrainConfig::preset("classic").unwrap(), FilmGrainConfig::classic_film());
        assert_eq!(FilmGrainConfig::heavy().grain_size, 1.8);
        assert_eq!(FilmGrainConfig::subtle().global_strength, 0.25);
        assert!(FilmGrainConfig::preset("vhs").is_none());
        for name in ["default", "classic_film", "subtle", "heavy"] {
            assert!(FilmGrainConfig::preset(name).unwrap().validate().is_ok());
        }
    }

    #[test]
    fn test_zone_ratios() {
        let config = FilmGrainConfig::default();
        assert_eq!(config.strength_ratio(0.1), 0.6);
        assert_eq!(config.strength_ratio(0.5), 1.0);
        assert_eq!(config.strength_ratio(0.95), 0.3);
        assert_eq!(config.size_ratio(0.1), 1.5);
        assert_eq!(config.size_ratio(0.5), 1.0);
        // inside the shadow/midtone transition
        let mid = config.strength_ratio(85.0 / 255.0);
        assert!(mid > 0.6 && mid < 1.0);
    }

    #[test]
    fn test_zero_strength_is_noop() {
        let mut rgb = flat(16, 16, 0.5);
        apply_grain(&mut rgb, frame(16, 16, 0), 3, &FilmGrainConfig::default().with_strength(0.0));
        assert!(rgb.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_grain_changes_pixels_within_range() {
        let mut rgb = flat(64, 64, 0.5);
        apply_grain(&mut rgb, frame(64, 64, 0), 3, &FilmGrainConfig::heavy());
        assert!(rgb.iter().any(|&v| v != 0.5));
        assert!(rgb.iter().all(|&v| (0.0..=1.0).contains(&v)));
        let mean = rgb.iter().sum::<f32>() / rgb.len() as f32;
        assert!((mean - 0.5).abs() < 0.05, "mean {}", mean);
    }

    #[test]
    fn test_stripes_match_whole_image() {
        let (w, h) = (32usize, 20usize);
        let config = FilmGrainConfig::classic_film();
        let mut whole = flat(w, h, 0.4);
        apply_grain(&mut whole, frame(w as u32, h as u32, 0), 11, &config);

        let mut top = flat(w, 12, 0.4);
        let mut bottom = flat(w, 8, 0.4);
        apply_grain(&mut top, frame(w as u32, h as u32, 0), 11, &config);
        apply_grain(&mut bottom, frame(w as u32, h as u32, 12), 11, &config);
        top.extend_from_slice(&bottom);
        assert_eq!(top, whole);
    }

    #[test]
    fn test_validation() {
        assert!(FilmGrainConfig::default().with_grain_size(20.0).validate().is_err());
        assert!(FilmGrainConfig::default().with_strength(-1.0).validate().is_err());
        let inverted = FilmGrainConfig {
            shadow_threshold: 200,
            ..FilmGrainConfig::default()
        };
        assert!(inverted.validate().is_err());
    }
}
