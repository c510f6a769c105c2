//! Block engine error types

use thiserror::Error;

/// Error reported by the object backend
///
/// `NotFound` and `OffsetInvalid` describe an object that was never written;
/// the engine treats both as logically-zero content.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Object has never been written
    #[error("object not found")]
    NotFound,

    /// Object offset lies outside what the backend has allocated
    #[error("object offset invalid")]
    OffsetInvalid,

    /// Volume is unknown to the backend
    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    /// Put carried a buffer that is not exactly one object
    #[error("invalid object length: expected {expected}, got {actual}")]
    InvalidLength { expected: u64, actual: u64 },

    /// Backend replied with a variant that does not answer the request
    #[error("unexpected backend response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        expected: &'static str,
        actual: &'static str,
    },

    /// Backend is unreachable or refused the call
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Backend failed the I/O
    #[error("backend I/O error: {0}")]
    Io(String),
}

impl BackendError {
    /// True when the error only means "this object holds no data yet".
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::NotFound | Self::OffsetInvalid)
    }
}

/// Block engine error
#[derive(Error, Debug)]
pub enum BlockError {
    /// Volume could not be attached
    #[error("attach of volume '{volume}' failed: {source}")]
    Attach {
        volume: String,
        #[source]
        source: BackendError,
    },

    /// Backend failure while serving a sub-operation
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Request range falls outside the volume
    #[error("offset {offset} + length {length} exceeds volume size {size}")]
    OutOfBounds { offset: u64, length: u64, size: u64 },

    /// A live client handle was reused
    #[error("client handle {0:#x} is already outstanding")]
    HandleConflict(u64),

    /// Completion arrived for a handle with no pending task
    #[error("no pending task for client handle {0:#x}")]
    UnknownHandle(u64),

    /// Attachment handle used after release
    #[error("attachment for volume '{0}' already released")]
    Released(String),
}

impl BlockError {
    /// Errno-style code sent to the client in the reply header.
    #[must_use]
    pub fn errno(&self) -> u32 {
        match self {
            Self::OutOfBounds { .. } => crate::EINVAL,
            _ => crate::EIO,
        }
    }
}

/// Result type for block operations
pub type BlockResult<T> = Result<T, BlockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_errors() {
        assert!(BackendError::NotFound.is_absent());
        assert!(BackendError::OffsetInvalid.is_absent());
        assert!(!BackendError::Io("disk".into()).is_absent());
        assert!(!BackendError::Unavailable("down".into()).is_absent());
    }

    #[test]
    fn test_errno_mapping() {
        let oob = BlockError::OutOfBounds {
            offset: 10,
            length: 10,
            size: 15,
        };
        assert_eq!(oob.errno(), crate::EINVAL);
        assert_eq!(
            BlockError::Backend(BackendError::Io("x".into())).errno(),
            crate::EIO
        );
    }
}
