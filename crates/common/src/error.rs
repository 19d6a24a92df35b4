//! Common error types for Patchloop
//!
//! This module defines the error type shared by every hotpatch layer.
//! Each variant maps onto a coarse [`ErrorKind`] and a stable numeric code so
//! that layer results can be reported uniformly by the unified manager.

use std::fmt;
use thiserror::Error;

/// Which half of a writable-window cycle failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionPhase {
    /// Making the window writable; nothing has been written yet
    MakeWritable,
    /// Restoring the previous protection after the write already landed
    Restore,
    /// Explicit protection change requested by the caller
    Change,
}

impl fmt::Display for ProtectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtectionPhase::MakeWritable => write!(f, "make-writable"),
            ProtectionPhase::Restore => write!(f, "restore"),
            ProtectionPhase::Change => write!(f, "change"),
        }
    }
}

/// Main error type for Patchloop
#[derive(Error, Debug)]
pub enum HotpatchError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation requires `initialize()` first
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// Operation requires an attached model region
    #[error("Not attached: {0}")]
    NotAttached(String),

    /// Attach requested while a region is already attached
    #[error("Already attached: {0}")]
    AlreadyAttached(String),

    /// Range falls outside the attached region or buffer
    #[error("Out of bounds: offset {offset} + size {size} exceeds {limit} bytes")]
    OutOfBounds {
        offset: usize,
        size: usize,
        limit: usize,
    },

    /// Overlapping patch rejected by priority
    #[error("Patch conflict: {0}")]
    Conflict(String),

    /// Checksum, magic or expected-bytes check failed
    #[error("Integrity mismatch: {0}")]
    IntegrityMismatch(String),

    /// OS page-protection change failed
    #[error("Protection failure ({phase}) at {addr:#x}+{len}: os error {os_code}")]
    Protection {
        phase: ProtectionPhase,
        addr: usize,
        len: usize,
        os_code: i32,
    },

    /// Patch or rule lookup failed
    #[error("Not found: {0}")]
    NotFound(String),

    /// Name already registered
    #[error("Already exists: {0}")]
    Duplicate(String),

    /// Operation not valid in the current patch state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Output or payload validation failed
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Tensor metadata collaborator failed
    #[error("Tensor metadata error: {0}")]
    Metadata(String),

    /// Capability not available on this platform or element type
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error taxonomy shared by every layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    OutOfBounds,
    Conflict,
    IntegrityMismatch,
    ProtectionFailure,
    NotAttached,
    NotInitialized,
    ValidationFailure,
    NotFound,
    InvalidInput,
    InvalidState,
    NotSupported,
    Io,
    Config,
}

impl From<serde_yaml::Error> for HotpatchError {
    fn from(err: serde_yaml::Error) -> Self {
        HotpatchError::Config(err.to_string())
    }
}

impl From<config::ConfigError> for HotpatchError {
    fn from(err: config::ConfigError) -> Self {
        HotpatchError::Config(err.to_string())
    }
}

impl HotpatchError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            HotpatchError::Config(_) => ErrorKind::Config,
            HotpatchError::NotInitialized(_) => ErrorKind::NotInitialized,
            HotpatchError::NotAttached(_) => ErrorKind::NotAttached,
            HotpatchError::AlreadyAttached(_) => ErrorKind::InvalidState,
            HotpatchError::OutOfBounds { .. } => ErrorKind::OutOfBounds,
            HotpatchError::Conflict(_) => ErrorKind::Conflict,
            HotpatchError::IntegrityMismatch(_) => ErrorKind::IntegrityMismatch,
            HotpatchError::Protection { .. } => ErrorKind::ProtectionFailure,
            HotpatchError::NotFound(_) => ErrorKind::NotFound,
            HotpatchError::Duplicate(_) => ErrorKind::InvalidInput,
            HotpatchError::InvalidState(_) => ErrorKind::InvalidState,
            HotpatchError::InvalidInput(_) => ErrorKind::InvalidInput,
            HotpatchError::Validation(_) => ErrorKind::ValidationFailure,
            HotpatchError::Metadata(_) => ErrorKind::InvalidInput,
            HotpatchError::NotSupported(_) => ErrorKind::NotSupported,
            HotpatchError::Serialization(_) => ErrorKind::InvalidInput,
            HotpatchError::Io(_) => ErrorKind::Io,
        }
    }

    /// Stable numeric code carried by structured results
    ///
    /// Codes are grouped by family: 1xxx attachment and bounds, 2xxx page
    /// protection, 3xxx patch bookkeeping, 4xxx tensor metadata, 5xxx
    /// pipeline validation, 9xxx configuration and I/O.
    pub fn code(&self) -> i32 {
        match self {
            HotpatchError::NotInitialized(_) => 1000,
            HotpatchError::NotAttached(_) => 1001,
            HotpatchError::AlreadyAttached(_) => 1002,
            HotpatchError::InvalidInput(_) => 1003,
            HotpatchError::OutOfBounds { .. } => 1004,
            HotpatchError::Protection { phase, .. } => match phase {
                ProtectionPhase::MakeWritable => 2001,
                ProtectionPhase::Restore => 2002,
                ProtectionPhase::Change => 2003,
            },
            HotpatchError::NotSupported(_) => 2004,
            HotpatchError::NotFound(_) => 3001,
            HotpatchError::Duplicate(_) => 3002,
            HotpatchError::Conflict(_) => 3003,
            HotpatchError::InvalidState(_) => 3004,
            HotpatchError::IntegrityMismatch(_) => 3005,
            HotpatchError::Metadata(_) => 4001,
            HotpatchError::Validation(_) => 5001,
            HotpatchError::Config(_) => 9001,
            HotpatchError::Io(_) => 9002,
            HotpatchError::Serialization(_) => 9003,
        }
    }

    /// OS error code for protection failures
    pub fn os_code(&self) -> Option<i32> {
        match self {
            HotpatchError::Protection { os_code, .. } => Some(*os_code),
            _ => None,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        HotpatchError::Config(msg.into())
    }

    /// Create a not-initialized error
    pub fn not_initialized(msg: impl Into<String>) -> Self {
        HotpatchError::NotInitialized(msg.into())
    }

    /// Create a not-attached error
    pub fn not_attached(msg: impl Into<String>) -> Self {
        HotpatchError::NotAttached(msg.into())
    }

    /// Create an out-of-bounds error
    pub fn out_of_bounds(offset: usize, size: usize, limit: usize) -> Self {
        HotpatchError::OutOfBounds {
            offset,
            size,
            limit,
        }
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        HotpatchError::NotFound(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        HotpatchError::InvalidState(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        HotpatchError::InvalidInput(msg.into())
    }

    /// Create an integrity mismatch error
    pub fn integrity(msg: impl Into<String>) -> Self {
        HotpatchError::IntegrityMismatch(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        HotpatchError::Validation(msg.into())
    }

    /// Create a not-supported error
    pub fn not_supported(msg: impl Into<String>) -> Self {
        HotpatchError::NotSupported(msg.into())
    }
}

/// Check that `[offset, offset + size)` fits inside `limit` bytes
pub fn check_range(offset: usize, size: usize, limit: usize) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= limit => Ok(()),
        _ => Err(HotpatchError::out_of_bounds(offset, size, limit)),
    }
}

/// Result type alias for Patchloop operations
pub type Result<T> = std::result::Result<T, HotpatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_range() {
        assert!(check_range(0, 16, 16).is_ok());
        assert!(check_range(16, 0, 16).is_ok());
        assert!(check_range(1, 16, 16).is_err());
        assert!(check_range(usize::MAX, 2, 16).is_err());
    }

    #[test]
    fn test_error_codes_and_kinds() {
        let err = HotpatchError::Protection {
            phase: ProtectionPhase::Restore,
            addr: 0x1000,
            len: 4096,
            os_code: 13,
        };
        assert_eq!(err.kind(), ErrorKind::ProtectionFailure);
        assert_eq!(err.code(), 2002);
        assert_eq!(err.os_code(), Some(13));

        let err = HotpatchError::out_of_bounds(10, 10, 15);
        assert_eq!(err.kind(), ErrorKind::OutOfBounds);
        assert!(err.to_string().contains("offset 10"));
    }
}
