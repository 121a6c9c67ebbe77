//! Core types shared by every layer.
//!
//! - Error enums and result aliases
//! - Processing parameters and image values
//! - Engine configuration and memory budgets
//! - Stripe planning for large images
//! - GPU device access

pub mod chunked;
pub mod config;
pub mod error;
pub mod gpu;
pub mod types;

pub use chunked::{process_striped, StripePlan, StripeRegion};
pub use config::{EngineConfig, MemoryBudget};
pub use error::{EngineError, EngineResult, LutParseError, LutResult};
pub use gpu::{GpuDevice, GpuError};
pub use types::{
    BackendKind, DitherKind, ImageFormat, ImageMetadata, ImageValue, ProcessingParams,
    ProcessorPreference,
};
