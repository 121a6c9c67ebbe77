//! Per-pixel color pipeline: LUT mapping, film grain, quantization.
//!
//! Stages run on a float RGB stream in this order for every stripe:
//! [`mapper`] then [`grain`] then [`dither`].

pub mod dither;
pub mod grain;
pub mod mapper;

pub use dither::{quantize, quantize_channel, NoiseField};
pub use grain::{apply_grain, FilmGrainConfig, GrainFrame};
pub use mapper::{blend, ColorMapper};
