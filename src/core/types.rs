//! Core value types shared by the parser, the color pipeline and the scheduler.
//!
//! The closed enums here (`BackendKind`, `ProcessorPreference`, `DitherKind`)
//! are matched exhaustively throughout the crate and serialize as lowercase
//! strings so they can appear in TOML configuration and JSON reports.

use crate::color::grain::FilmGrainConfig;
use crate::core::error::{EngineError, EngineResult};
use image::{DynamicImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// The two execution backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Bounded-parallel CPU path.
    General,
    /// Strictly serial GPU path.
    Accelerated,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::General => write!(f, "CPU"),
            BackendKind::Accelerated => write!(f, "GPU"),
        }
    }
}

/// Which backend a caller would like a task to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorPreference {
    /// Accelerated if available, otherwise General.
    #[default]
    Auto,
    /// Always the general path.
    Cpu,
    /// Accelerated path, degrading to General when no accelerator exists.
    Gpu,
}

impl fmt::Display for ProcessorPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessorPreference::Auto => write!(f, "auto"),
            ProcessorPreference::Cpu => write!(f, "cpu"),
            ProcessorPreference::Gpu => write!(f, "gpu"),
        }
    }
}

impl FromStr for ProcessorPreference {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(ProcessorPreference::Auto),
            "cpu" | "general" => Ok(ProcessorPreference::Cpu),
            "gpu" | "accelerated" => Ok(ProcessorPreference::Gpu),
            other => Err(EngineError::Config(format!(
                "unknown processor preference '{}'",
                other
            ))),
        }
    }
}

/// Error-diffusion strategy applied before 8-bit quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DitherKind {
    /// Round to nearest.
    #[default]
    None,
    /// Sequential error diffusion with the 7/3/5/1 kernel.
    FloydSteinberg,
    /// Independent uniform noise of one quantization step.
    Random,
}

impl DitherKind {
    /// The dither actually applied when an image is split into `stripe_count` stripes.
    ///
    /// Error diffusion cannot cross stripe boundaries, so a multi-stripe
    /// Floyd-Steinberg request degrades to random dithering.
    pub fn effective_for(self, stripe_count: usize) -> Self {
        match self {
            DitherKind::FloydSteinberg if stripe_count > 1 => DitherKind::Random,
            other => other,
        }
    }
}

impl fmt::Display for DitherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DitherKind::None => write!(f, "none"),
            DitherKind::FloydSteinberg => write!(f, "floyd_steinberg"),
            DitherKind::Random => write!(f, "random"),
        }
    }
}

impl FromStr for DitherKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "none" | "off" => Ok(DitherKind::None),
            "floyd_steinberg" | "fs" => Ok(DitherKind::FloydSteinberg),
            "random" | "noise" => Ok(DitherKind::Random),
            other => Err(EngineError::Config(format!("unknown dither '{}'", other))),
        }
    }
}

/// Per-task processing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingParams {
    /// Blend factor of the primary table, 0 leaves the image untouched.
    pub strength: f32,
    /// Blend factor of the secondary table.
    pub secondary_strength: f32,
    /// Encoder quality used when the output is persisted as JPEG.
    pub quality: u8,
    /// Quantization strategy.
    pub dither: DitherKind,
    /// Optional film grain pass.
    pub grain: Option<FilmGrainConfig>,
}

impl Default for ProcessingParams {
    fn default() -> Self {
        Self {
            strength: 1.0,
            secondary_strength: 0.0,
            quality: 90,
            dither: DitherKind::None,
            grain: None,
        }
    }
}

impl ProcessingParams {
    /// Create parameters with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the primary blend factor.
    pub fn with_strength(mut self, strength: f32) -> Self {
        self.strength = strength;
        self
    }

    /// Set the secondary blend factor.
    pub fn with_secondary_strength(mut self, strength: f32) -> Self {
        self.secondary_strength = strength;
        self
    }

    /// Set the output quality.
    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    /// Set the dither strategy.
    pub fn with_dither(mut self, dither: DitherKind) -> Self {
        self.dither = dither;
        self
    }

    /// Enable film grain.
    pub fn with_grain(mut self, grain: FilmGrainConfig) -> Self {
        self.grain = Some(grain);
        self
    }

    /// Reject values outside their documented ranges.
    pub fn validate(&self) -> EngineResult<()> {
        for (name, value) in [
            ("strength", self.strength),
            ("secondary_strength", self.secondary_strength),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(EngineError::InvalidInput(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if !(1..=100).contains(&self.quality) {
            return Err(EngineError::InvalidInput(format!(
                "quality must be within 1..=100, got {}",
                self.quality
            )));
        }
        if let Some(grain) = &self.grain {
            grain.validate()?;
        }
        Ok(())
    }
}

/// Supported image formats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// JPEG.
    Jpeg,
    /// PNG.
    Png,
    /// GIF.
    Gif,
    /// WebP.
    WebP,
    /// TIFF.
    Tiff,
    /// BMP.
    Bmp,
    /// Unrecognized extension.
    Unknown,
}

impl ImageFormat {
    /// Determine image format from file path extension.
    pub fn from_path(path: &Path) -> Self {
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        match ext.to_lowercase().as_str() {
            "jpg" | "jpeg" => ImageFormat::Jpeg,
            "png" => ImageFormat::Png,
            "gif" => ImageFormat::Gif,
            "webp" => ImageFormat::WebP,
            "tiff" | "tif" => ImageFormat::Tiff,
            "bmp" => ImageFormat::Bmp,
            _ => ImageFormat::Unknown,
        }
    }

    /// Convert to the image crate's format enum.
    pub fn to_image_format(self) -> Option<image::ImageFormat> {
        match self {
            ImageFormat::Jpeg => Some(image::ImageFormat::Jpeg),
            ImageFormat::Png => Some(image::ImageFormat::Png),
            ImageFormat::Gif => Some(image::ImageFormat::Gif),
            ImageFormat::WebP => Some(image::ImageFormat::WebP),
            ImageFormat::Tiff => Some(image::ImageFormat::Tiff),
            ImageFormat::Bmp => Some(image::ImageFormat::Bmp),
            ImageFormat::Unknown => None,
        }
    }
}

/// Image metadata without the pixel data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageMetadata {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Format of the source file, if any
    pub format: ImageFormat,
    /// Whether the source carried an alpha channel
    pub has_alpha: bool,
}

impl ImageMetadata {
    /// Total number of pixels.
    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// RGBA8 image wrapper with metadata and explicit release.
///
/// Pixel data is shared through an `Arc`, so cloning is cheap. Once
/// released, the value keeps its metadata but can no longer be processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageValue {
    /// Image metadata (dimensions, format, etc.)
    pub metadata: ImageMetadata,
    #[serde(skip)]
    data: Option<Arc<RgbaImage>>,
    /// Source file, if the image was loaded from disk
    pub source: Option<PathBuf>,
}

impl PartialEq for ImageValue {
    fn eq(&self, other: &Self) -> bool {
        self.metadata == other.metadata && self.source == other.source
    }
}

impl ImageValue {
    /// Wrap an RGBA8 buffer.
    pub fn new(image: RgbaImage) -> Self {
        Self {
            metadata: ImageMetadata {
                width: image.width(),
                height: image.height(),
                format: ImageFormat::Unknown,
                has_alpha: true,
            },
            data: Some(Arc::new(image)),
            source: None,
        }
    }

    /// Convert any decoded image to RGBA8.
    pub fn from_dynamic(image: DynamicImage) -> Self {
        let has_alpha = image.color().has_alpha();
        let mut value = Self::new(image.to_rgba8());
        value.metadata.has_alpha = has_alpha;
        value
    }

    /// Load an image from a file path.
    pub fn from_path(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let image = image::open(&path)?;
        let mut value = Self::from_dynamic(image);
        value.metadata.format = ImageFormat::from_path(&path);
        value.source = Some(path);
        Ok(value)
    }

    /// Get a shared reference to the pixel data.
    ///
    /// Returns None once the image has been released.
    pub fn get_image(&self) -> Option<&Arc<RgbaImage>> {
        self.data.as_ref()
    }

    /// Drop this handle's reference to the pixel data.
    pub fn release(&mut self) {
        self.data = None;
    }

    /// Check if the pixel data is still held.
    pub fn is_loaded(&self) -> bool {
        self.data.is_some()
    }

    /// Total number of pixels.
    pub fn pixel_count(&self) -> u64 {
        self.metadata.pixel_count()
    }

    /// Get the memory size of the pixel data in bytes.
    pub fn estimated_memory_size(&self) -> usize {
        self.pixel_count() as usize * 4
    }

    /// Return the pixel data, or `InvalidInput` if it cannot be processed.
    pub fn require(&self) -> EngineResult<Arc<RgbaImage>> {
        let image = self
            .data
            .as_ref()
            .ok_or_else(|| EngineError::InvalidInput("image has been released".to_string()))?;
        if image.width() == 0 || image.height() == 0 {
            return Err(EngineError::InvalidInput(format!(
                "image has zero dimension ({}x{})",
                image.width(),
                image.height()
            )));
        }
        Ok(Arc::clone(image))
    }
}

impl From<RgbaImage> for ImageValue {
    fn from(image: RgbaImage) -> Self {
        Self::new(image)
    }
}
