//! Error types for Lutforge.
//!
//! Uses thiserror for structured errors with context. Errors are designed to:
//! - Carry enough detail for a caller to present a single message
//! - Tell the scheduler whether a failure may be retried on another backend
//! - Convert automatically from the lower layers (parsing, I/O, image codecs)

use crate::core::types::BackendKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while reading `.cube` lookup tables.
///
/// Parse failures are never retried: the same bytes will fail the same way.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LutParseError {
    /// No size header before the data rows.
    #[error("Missing LUT_3D_SIZE header")]
    MissingSize,

    /// Size header that is not an integer in range.
    #[error("Invalid LUT_3D_SIZE: {0}")]
    InvalidSize(String),

    #[error("Incomplete LUT data: expected {expected} rows, found {found}")]
    /// Fewer usable rows than the size requires.
    LutIncomplete {
        /// N^3 for the declared size.
        expected: usize,
        /// Rows actually read.
        found: usize,
    },

    /// Underlying read failure.
    #[error("Failed to read LUT: {0}")]
    Io(String),
}

impl LutParseError {
    /// Short human-readable reason, without the error category prefix.
    pub fn reason(&self) -> String {
        match self {
            LutParseError::MissingSize => "no LUT_3D_SIZE line before the data rows".to_string(),
            LutParseError::InvalidSize(value) => format!("'{}' is not a usable cube size", value),
            LutParseError::LutIncomplete { expected, found } => {
                format!("{} of {} rows could be read", found, expected)
            }
            LutParseError::Io(message) => message.clone(),
        }
    }
}

impl From<std::io::Error> for LutParseError {
    fn from(error: std::io::Error) -> Self {
        LutParseError::Io(error.to_string())
    }
}

/// Top-level error type for the engine.
///
/// Every task completes with either an output or exactly one of these.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A table could not be parsed.
    #[error("LUT parse error: {0}")]
    LutParse(#[from] LutParseError),

    /// The requested backend cannot run work.
    #[error("{backend} backend is not available")]
    BackendUnavailable {
        /// Backend that was asked for.
        backend: BackendKind,
    },

    /// Admission failed after a reclamation pass.
    #[error("Memory limit exceeded: need {required} bytes, {available} bytes available (limit {limit} bytes)")]
    MemoryLimitExceeded {
        /// Estimated bytes for the task.
        required: usize,
        /// Bytes left under the critical line.
        available: usize,
        /// Configured limit.
        limit: usize,
    },

    /// A backend failed while processing.
    #[error("{backend} processing failed: {cause}")]
    ProcessingFailed {
        /// Backend that failed.
        backend: BackendKind,
        /// Failure description.
        cause: String,
    },

    /// Rejected image or parameters.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The primary slot is empty.
    #[error("No lookup table loaded")]
    NoTableLoaded,

    /// The task was cancelled.
    #[error("Task cancelled")]
    Cancelled,

    /// The engine no longer accepts work.
    #[error("Engine has been shut down")]
    ShutDown,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decode or encode error.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

// ============================================================================
// Error Utilities
// ============================================================================

impl EngineError {
    /// Stable short identifier for the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::LutParse(_) => "lut_parse",
            EngineError::BackendUnavailable { .. } => "backend_unavailable",
            EngineError::MemoryLimitExceeded { .. } => "memory_limit_exceeded",
            EngineError::ProcessingFailed { .. } => "processing_failed",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::NoTableLoaded => "no_table_loaded",
            EngineError::Cancelled => "cancelled",
            EngineError::ShutDown => "shut_down",
            EngineError::Config(_) => "config",
            EngineError::Io(_) => "io",
            EngineError::Image(_) => "image",
        }
    }

    /// Check if submitting the same task again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::BackendUnavailable { .. }
                | EngineError::MemoryLimitExceeded { .. }
                | EngineError::ProcessingFailed { .. }
        )
    }

    /// Check if this failure should move an accelerated task to the general path.
    pub fn triggers_fallback(&self) -> bool {
        match self {
            EngineError::ProcessingFailed { backend, .. }
            | EngineError::BackendUnavailable { backend } => *backend == BackendKind::Accelerated,
            _ => false,
        }
    }

    /// Get suggestion for fixing this error.
    pub fn suggested_fix(&self) -> Option<String> {
        match self {
            EngineError::LutParse(LutParseError::LutIncomplete { expected, .. }) => Some(format!(
                "Check that the file contains all {} data rows",
                expected
            )),
            EngineError::LutParse(LutParseError::MissingSize) => {
                Some("Add a 'LUT_3D_SIZE <N>' line before the data".to_string())
            }
            EngineError::MemoryLimitExceeded { .. } => {
                Some("Raise the memory limit or process a smaller image".to_string())
            }
            EngineError::NoTableLoaded => Some("Load a primary LUT before submitting".to_string()),
            _ => None,
        }
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type alias for LUT parsing.
pub type LutResult<T> = Result<T, LutParseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_converts_into_engine_error() {
        let error: EngineError = LutParseError::LutIncomplete {
            expected: 64,
            found: 60,
        }
        .into();
        assert_eq!(error.kind(), "lut_parse");
        assert!(!error.is_retryable());
        assert!(error.suggested_fix().unwrap().contains("64"));
    }

    #[test]
    fn test_fallback_only_from_accelerated() {
        let gpu = EngineError::ProcessingFailed {
            backend: BackendKind::Accelerated,
            cause: "device lost".to_string(),
        };
        let cpu = EngineError::ProcessingFailed {
            backend: BackendKind::General,
            cause: "boom".to_string(),
        };
        assert!(gpu.triggers_fallback());
        assert!(!cpu.triggers_fallback());
        assert!(cpu.is_retryable());
        assert!(!EngineError::Cancelled.triggers_fallback());
    }

    #[test]
    fn test_display_messages() {
        let error = EngineError::MemoryLimitExceeded {
            required: 100,
            available: 10,
            limit: 50,
        };
        let message = error.to_string();
        assert!(message.contains("100"));
        assert!(message.contains("limit 50"));
        assert_eq!(
            LutParseError::InvalidSize("abc".into()).to_string(),
            "Invalid LUT_3D_SIZE: abc"
        );
    }
}
