use thiserror::Error;

use crate::types::{ContiguityMode, DeviceId, ElementType};

/// Boxed error carried through from user-supplied producers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error type for external-source ingestion and staging.
///
/// End-of-data is deliberately absent: a producer that runs out of data is
/// expected control flow and never reaches the caller as an error.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("producer of source '{source_name}' failed: {cause}")]
    Producer {
        source_name: String,
        #[source]
        cause: BoxError,
    },

    #[error("schema error in source '{source_name}': {detail}")]
    Schema { source_name: String, detail: String },

    #[error("layout error in source '{source_name}': {detail}")]
    Layout {
        source_name: String,
        expected: Option<ContiguityMode>,
        observed: Option<ContiguityMode>,
        detail: String,
    },

    #[error("transfer from {from} to {to} failed: {detail}")]
    Transfer {
        from: DeviceId,
        to: DeviceId,
        detail: String,
    },

    #[error("source '{source_name}' is in a failed state until the pipeline is rebuilt: {cause}")]
    BindingFailed { source_name: String, cause: String },

    #[error("memory allocation on {device} failed: requested {requested} bytes, available {available} bytes")]
    OutOfMemory {
        device: DeviceId,
        requested: usize,
        available: usize,
    },

    #[error("invalid device: {0}")]
    InvalidDevice(DeviceId),

    #[error("element type mismatch: expected {expected}, found {actual}")]
    TypeMismatch {
        expected: ElementType,
        actual: ElementType,
    },

    #[error("invalid memory region: {0}")]
    InvalidRegion(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StageError {
    /// Build a layout error for a mode change across iterations.
    pub fn mode_changed(
        source_name: &str,
        expected: ContiguityMode,
        observed: ContiguityMode,
    ) -> Self {
        StageError::Layout {
            source_name: source_name.to_string(),
            expected: Some(expected),
            observed: Some(observed),
            detail: format!(
                "source must not mix contiguous and noncontiguous inputs: \
                 expected {expected} batch, got {observed} batch"
            ),
        }
    }

    /// Build a layout error for an iteration whose samples are inconsistent
    /// among themselves.
    pub fn mixed_layout(source_name: &str, detail: impl Into<String>) -> Self {
        StageError::Layout {
            source_name: source_name.to_string(),
            expected: None,
            observed: None,
            detail: detail.into(),
        }
    }

    /// Re-express a device-level failure as a transfer failure between two devices.
    pub fn into_transfer(self, from: DeviceId, to: DeviceId) -> Self {
        match self {
            e @ StageError::Transfer { .. } => e,
            other => StageError::Transfer {
                from,
                to,
                detail: other.to_string(),
            },
        }
    }

    /// Name of the source this error is attributed to, if any.
    pub fn source_name(&self) -> Option<&str> {
        match self {
            StageError::Producer { source_name, .. }
            | StageError::Schema { source_name, .. }
            | StageError::Layout { source_name, .. }
            | StageError::BindingFailed { source_name, .. } => Some(source_name),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StageError>;
