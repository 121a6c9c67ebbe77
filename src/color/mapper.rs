//! Strength-blended single and dual LUT color mapping.

use crate::core::error::{EngineError, EngineResult};
use crate::core::types::ProcessingParams;
use crate::lut::store::TableSnapshot;
use crate::lut::LookupTable;
use rayon::prelude::*;
use std::sync::Arc;

/// Blend `mapped` over `input` by `strength` and clamp to `[0, 1]`.
///
/// A strength of zero returns `input` untouched, bit for bit.
#[inline]
pub fn blend(input: [f32; 3], mapped: [f32; 3], strength: f32) -> [f32; 3] {
    if strength <= 0.0 {
        return input;
    }
    if strength >= 1.0 {
        return mapped.map(|v| v.clamp(0.0, 1.0));
    }
    let keep = 1.0 - strength;
    [
        (input[0] * keep + mapped[0] * strength).clamp(0.0, 1.0),
        (input[1] * keep + mapped[1] * strength).clamp(0.0, 1.0),
        (input[2] * keep + mapped[2] * strength).clamp(0.0, 1.0),
    ]
}

/// Applies the primary table and, optionally, the secondary table on top.
#[derive(Debug, Clone)]
pub struct ColorMapper {
    primary: Arc<LookupTable>,
    secondary: Option<Arc<LookupTable>>,
    strength: f32,
    secondary_strength: f32,
}

impl ColorMapper {
    /// Create a mapper with strengths taken from `params`.
    pub fn new(
        primary: Arc<LookupTable>,
        secondary: Option<Arc<LookupTable>>,
        params: &ProcessingParams,
    ) -> Self {
        Self {
            primary,
            secondary,
            strength: params.strength.clamp(0.0, 1.0),
            secondary_strength: params.secondary_strength.clamp(0.0, 1.0),
        }
    }

    /// Create a mapper from captured slots; the primary slot is required.
    pub fn from_snapshot(snapshot: &TableSnapshot, params: &ProcessingParams) -> EngineResult<Self> {
        let primary = snapshot.primary.clone().ok_or(EngineError::NoTableLoaded)?;
        Ok(Self::new(primary, snapshot.secondary.clone(), params))
    }

    /// Primary table.
    pub fn primary(&self) -> &Arc<LookupTable> {
        &self.primary
    }

    /// Secondary table, when it will actually be applied.
    pub fn active_secondary(&self) -> Option<&Arc<LookupTable>> {
        self.secondary.as_ref().filter(|_| self.secondary_strength > 0.0)
    }

    /// Effective primary strength.
    pub fn strength(&self) -> f32 {
        self.strength
    }

    /// Effective secondary strength.
    pub fn secondary_strength(&self) -> f32 {
        self.secondary_strength
    }

    /// True when mapping cannot change any pixel.
    pub fn is_identity(&self) -> bool {
        self.strength == 0.0 && self.active_secondary().is_none()
    }

    /// Map one color in `[0, 1]`.
    #[inline]
    pub fn map_pixel(&self, rgb: [f32; 3]) -> [f32; 3] {
        let mut out = rgb;
        if self.strength > 0.0 {
            out = blend(out, self.primary.sample(out), self.strength);
        }
        if let Some(secondary) = self.active_secondary() {
            out = blend(out, secondary.sample(out), self.secondary_strength);
        }
        out
    }

    /// Map RGBA8 pixels into a float RGB stream.
    ///
    /// `src` holds four bytes per pixel, `dst` three floats per pixel.
    pub fn map_rgba8_into(&self, src: &[u8], dst: &mut [f32]) {
        src.par_chunks_exact(4)
            .zip(dst.par_chunks_exact_mut(3))
            .for_each(|(px, out)| {
                let mapped = self.map_pixel(unpack(px));
                out.copy_from_slice(&mapped);
            });
    }
}

/// Expand an RGBA8 pixel to float RGB.
#[inline]
pub fn unpack(px: &[u8]) -> [f32; 3] {
    [
        px[0] as f32 / 255.0,
        px[1] as f32 / 255.0,
        px[2] as f32 / 255.0,
    ]
}

/// Expand RGBA8 pixels to float RGB without mapping.
pub fn unpack_rgba8_into(src: &[u8], dst: &mut [f32]) {
    src.par_chunks_exact(4)
        .zip(dst.par_chunks_exact_mut(3))
        .for_each(|(px, out)| out.copy_from_slice(&unpack(px)));
}
