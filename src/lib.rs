//! # Lutforge - 3D LUT color grading engine
//!
//! Lutforge applies `.cube` lookup tables to images on the CPU or a GPU,
//! scheduling many tasks at once under a memory budget.
//!
//! ## Features
//!
//! - **Trilinear mapping**: primary and secondary tables with independent strengths
//! - **Two backends**: a rayon CPU path and a wgpu compute path with automatic fallback
//! - **Bounded scheduling**: up to five concurrent CPU tasks, a strict FIFO for the GPU
//! - **Large images**: stripe processing with seamless noise across stripes
//! - **Dithering and grain**: Floyd-Steinberg, random dither and zoned film grain
//! - **Memory guard**: admission control with reclamation and pressure monitoring
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lutforge::prelude::*;
//!
//! let engine = Engine::start(EngineConfig::default())?;
//! engine.load_primary_path("teal_orange.cube")?;
//!
//! let image = image::open("input.jpg")?.to_rgba8();
//! let params = ProcessingParams::default()
//!     .with_strength(0.8)
//!     .with_dither(DitherKind::FloydSteinberg);
//!
//! let handle = engine.submit(image, params, None)?;
//! let output = handle.wait()?;
//! engine.save_output(output.image, "output.jpg", 95)?;
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: errors, parameters, configuration, stripe planning, GPU device
//! - [`lut`]: table parsing, sampling, caching and export
//! - [`color`]: mapping, grain and quantization stages
//! - [`backend`]: the CPU and GPU backends
//! - [`execution`]: the engine, scheduler, memory guard and task handles

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod color;
pub mod core;
pub mod execution;
pub mod lut;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use lutforge::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use crate::core::types::{
        BackendKind, DitherKind, ImageFormat, ImageMetadata, ImageValue, ProcessingParams,
        ProcessorPreference,
    };

    // Configuration
    pub use crate::core::config::{EngineConfig, MemoryBudget};

    // Errors
    pub use crate::core::error::{EngineError, EngineResult, LutParseError, LutResult};

    // Tables
    pub use crate::lut::{
        export_cube, parse_cube, resample, write_cube, LookupTable, LutCache, TableSlot,
    };

    // Color stages
    pub use crate::color::{ColorMapper, FilmGrainConfig};

    // Backends
    pub use crate::backend::{AcceleratedBackend, Backend, GeneralBackend};

    // Execution
    pub use crate::execution::engine::{BackendInfo, Engine, EngineStats};
    pub use crate::execution::memory::{MemoryState, MemoryStats};
    pub use crate::execution::output::OutputResize;
    pub use crate::execution::progress::{CancellationToken, ProgressCallback, ProgressUpdate};
    pub use crate::execution::task::{TaskHandle, TaskId, TaskOutput, TaskRequest, TaskState};
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_version() {
        assert!(!super::VERSION.is_empty());
        assert_eq!(super::NAME, "lutforge");
    }

    #[test]
    fn test_export_then_parse_is_stable() {
        let table = LookupTable::from_fn(17, |[r, g, b]| [r * 0.9, g, (b + 0.1).min(1.0)]);
        let first = parse_cube(&export_cube(&table, Some("warm"))).unwrap();
        let second = parse_cube(&export_cube(&first, Some("warm"))).unwrap();
        assert_eq!(first.size(), 33);
        assert_eq!(first, second);
    }

    #[test]
    fn test_prelude_end_to_end() {
        let engine = Engine::start(
            EngineConfig::default()
                .with_accelerator(false)
                .with_monitor(false),
        )
        .unwrap();
        engine.set_table(TableSlot::Primary, std::sync::Arc::new(LookupTable::identity(2)));
        let image = image::RgbaImage::from_pixel(3, 3, image::Rgba([10, 20, 30, 40]));
        let output = engine
            .process(image.clone(), ProcessingParams::default())
            .unwrap();
        assert_eq!(output.image, image);
    }
}
