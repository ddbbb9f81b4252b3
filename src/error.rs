// Device error taxonomy
//
// Backend helpers use anyhow internally; everything crossing the
// RenderDevice boundary is a DeviceError so callers can tell a malformed
// descriptor from a lost resource from a driver failure.

use thiserror::Error;

pub type Result<T, E = DeviceError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DeviceError {
    /// Malformed descriptor, rejected before any backend call
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// Native API failure, with the context chain of the failing call
    #[error(transparent)]
    Backend(#[from] anyhow::Error),

    #[error("could not find shader \"{0}\"")]
    UnknownShader(String),

    /// A named binding with no matching reflected slot
    #[error("shader \"{shader}\" has no binding named \"{name}\"")]
    UnresolvedBinding { shader: String, name: String },

    /// A reflected slot the command left empty
    #[error("shader \"{shader}\" slot \"{name}\" was left unbound")]
    UnboundSlot { shader: String, name: String },

    #[error("shader \"{shader}\" slot \"{name}\" expects {expected}")]
    BindingMismatch { shader: String, name: String, expected: String },

    #[error("constant buffer \"{0}\" was not found in any of the loaded shaders")]
    UnknownConstantBuffer(String),

    #[error("constant buffer \"{name}\" was created with {expected} bytes, got {actual}")]
    ConstantBufferSizeMismatch { name: String, expected: usize, actual: usize },

    /// Use of a resource or view whose allocation was already released
    #[error("{0} refers to a released resource")]
    Expired(&'static str),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("failed to compile shader \"{name}\": {reason}")]
    ShaderCompilation { name: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        DeviceError::InvalidDescriptor(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        DeviceError::Unsupported(msg.into())
    }
}

/// Logs the error of a device operation once, at the boundary
pub trait LogFailure {
    fn log_failure(self, operation: &str) -> Self;
}

impl<T> LogFailure for Result<T> {
    fn log_failure(self, operation: &str) -> Self {
        if let Err(e) = &self {
            log::error!("{}: {:#}", operation, e);
        }
        self
    }
}
