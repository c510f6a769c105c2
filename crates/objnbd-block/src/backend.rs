//! Object backend boundary
//!
//! The backend is a remote request/response service. Every call carries a
//! [`Correlation`] token chosen by the connector and resolves to one
//! [`BackendResponse`] variant.

use crate::error::BackendError;
use crate::translator::ObjectIndex;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// Caller-supplied token identifying which sub-operation a call serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Correlation {
    /// Client handle of the parent request
    pub handle: u64,
    /// Sub-operation sequence within the parent
    pub sequence: u32,
}

impl Correlation {
    /// Token for calls that serve no client request (attach/detach)
    pub const CONTROL: Self = Self {
        handle: 0,
        sequence: u32::MAX,
    };

    pub fn new(handle: u64, sequence: u32) -> Self {
        Self { handle, sequence }
    }
}

impl fmt::Display for Correlation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{}", self.handle, self.sequence)
    }
}

/// Address of one backend object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Volume name
    pub volume: String,
    /// Blob holding the volume's objects
    pub blob: String,
    /// Object index within the blob
    pub index: ObjectIndex,
}

impl ObjectKey {
    pub fn new(volume: impl Into<String>, blob: impl Into<String>, index: ObjectIndex) -> Self {
        Self {
            volume: volume.into(),
            blob: blob.into(),
            index,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{:08x}", self.volume, self.blob, self.index)
    }
}

/// Geometry learned from a successful attach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeGeometry {
    /// Bytes per backend object
    pub object_size: u64,
    /// Total addressable bytes
    pub capacity: u64,
}

/// Calls the connector makes against the backend
#[derive(Debug, Clone)]
pub enum BackendRequest {
    Attach {
        domain: String,
        volume: String,
    },
    Detach {
        domain: String,
        volume: String,
    },
    Get {
        key: ObjectKey,
        length_hint: u64,
    },
    Put {
        key: ObjectKey,
        data: Bytes,
    },
}

/// Replies the backend produces for the connector
#[derive(Debug, Clone)]
pub enum BackendResponse {
    Attached(VolumeGeometry),
    Detached,
    GotObject(Bytes),
    PutObject,
    Failed(BackendError),
}

impl BackendResponse {
    fn variant(&self) -> &'static str {
        match self {
            Self::Attached(_) => "Attached",
            Self::Detached => "Detached",
            Self::GotObject(_) => "GotObject",
            Self::PutObject => "PutObject",
            Self::Failed(_) => "Failed",
        }
    }

    fn unexpected(self, expected: &'static str) -> BackendError {
        match self {
            Self::Failed(e) => e,
            other => BackendError::UnexpectedResponse {
                expected,
                actual: other.variant(),
            },
        }
    }

    /// Expect `Attached`
    pub fn into_attached(self) -> Result<VolumeGeometry, BackendError> {
        match self {
            Self::Attached(geometry) => Ok(geometry),
            other => Err(other.unexpected("Attached")),
        }
    }

    /// Expect `Detached`
    pub fn into_detached(self) -> Result<(), BackendError> {
        match self {
            Self::Detached => Ok(()),
            other => Err(other.unexpected("Detached")),
        }
    }

    /// Expect `GotObject`
    pub fn into_object(self) -> Result<Bytes, BackendError> {
        match self {
            Self::GotObject(data) => Ok(data),
            other => Err(other.unexpected("GotObject")),
        }
    }

    /// Expect `PutObject`
    pub fn into_put(self) -> Result<(), BackendError> {
        match self {
            Self::PutObject => Ok(()),
            other => Err(other.unexpected("PutObject")),
        }
    }
}

/// Asynchronous whole-object store
///
/// Implementations may complete calls on any worker thread.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Issue one call and wait for its reply.
    async fn submit(&self, token: Correlation, request: BackendRequest) -> BackendResponse;
}
