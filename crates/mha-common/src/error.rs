//! Error types for descriptor construction and kernel execution.
//!
//! Construction errors are raised synchronously by the kernel factory and
//! carry enough detail to tell an unsupported shape from unsupported
//! hardware from an illegal configuration. Execution errors only surface
//! when buffers handed to `execute` break the contract baked into the
//! kernel descriptor.

use crate::{DataType, MhaDenseIo};
use thiserror::Error;

/// Top-level error for the attention engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MhaError {
    #[error("kernel construction failed: {0}")]
    Construction(#[from] ConstructionError),

    #[error("kernel execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("allocation of {size} bytes failed")]
    Allocation { size: usize },
}

/// Preconditions violated while building an operator/kernel descriptor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstructionError {
    #[error("unsupported shape: {reason}")]
    UnsupportedShape { reason: String },

    #[error("unsupported data type {dtype} for role {role}")]
    UnsupportedDataType { role: MhaDenseIo, dtype: DataType },

    #[error("unsupported hardware: required {required}, available {available}")]
    UnsupportedHardware { required: String, available: String },

    #[error("illegal configuration: {reason}")]
    IllegalConfiguration { reason: String },

    #[error("thread pool construction failed: {0}")]
    ThreadPool(String),
}

/// Contract violations detected at `execute` time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("missing buffer for role {role}")]
    MissingBuffer { role: MhaDenseIo },

    #[error("buffer for role {role} has {actual} bytes, expected {expected}")]
    BufferSize { role: MhaDenseIo, expected: usize, actual: usize },

    #[error("buffer for role {role} is not aligned for its element type")]
    Misaligned { role: MhaDenseIo },

    #[error("workspace too small: required {required} bytes, got {actual}")]
    WorkspaceTooSmall { required: usize, actual: usize },
}

impl MhaError {
    pub fn unsupported_shape(reason: impl Into<String>) -> Self {
        ConstructionError::UnsupportedShape { reason: reason.into() }.into()
    }

    pub fn illegal_configuration(reason: impl Into<String>) -> Self {
        ConstructionError::IllegalConfiguration { reason: reason.into() }.into()
    }

    pub fn is_construction(&self) -> bool {
        matches!(self, Self::Construction(_))
    }

    pub fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Shape or data-type preconditions rejected the operator.
    pub fn is_unsupported_shape(&self) -> bool {
        matches!(
            self,
            Self::Construction(
                ConstructionError::UnsupportedShape { .. }
                    | ConstructionError::UnsupportedDataType { .. }
            )
        )
    }

    pub fn is_unsupported_hardware(&self) -> bool {
        matches!(self, Self::Construction(ConstructionError::UnsupportedHardware { .. }))
    }

    pub fn is_illegal_configuration(&self) -> bool {
        matches!(
            self,
            Self::Construction(
                ConstructionError::IllegalConfiguration { .. } | ConstructionError::ThreadPool(_)
            )
        )
    }
}

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, MhaError>;
