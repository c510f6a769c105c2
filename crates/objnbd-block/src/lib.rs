#![allow(clippy::result_large_err)]
//! objnbd Block Engine
//!
//! This crate maps arbitrary byte-range block I/O onto a backend that only
//! supports whole-object get/put of a fixed object size. It owns the
//! consistency rules that make that mapping safe under concurrency.
//!
//! # Features
//!
//! - **Translation**: byte ranges split into per-object sub-operations
//! - **Read-modify-write**: partial object updates merged against fetched
//!   (or zero-synthesized) object content
//! - **Per-object serialization**: at most one update cycle per object
//! - **Aggregation**: sub-operation results folded into one client reply
//! - **Attachment registry**: reference-counted volume attach/detach
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  Block Client    │  (NBD connection)
//! └────────┬─────────┘
//!          │ IoRequest
//! ┌────────▼─────────┐
//! │  VolumeIo        │
//! │  - ObjectMapper  │
//! │  - Serializer    │
//! │  - PendingTable  │
//! └────────┬─────────┘
//!          │ BackendRequest
//! ┌────────▼─────────┐
//! │  ObjectBackend   │  (get/put whole objects)
//! └──────────────────┘
//! ```

pub mod backend;
pub mod engine;
pub mod error;
pub mod memory;
pub mod registry;
pub mod serializer;
pub mod task;
pub mod translator;

pub use backend::{
    BackendRequest, BackendResponse, Correlation, ObjectBackend, ObjectKey, VolumeGeometry,
};
pub use engine::{CompletionSink, IoRequest, VolumeIo, WriteSubOp};
pub use error::{BackendError, BlockError, BlockResult};
pub use memory::{BackendCalls, MemoryBackend};
pub use registry::{AttachmentHandle, AttachmentRegistry};
pub use serializer::{Admission, SectorSerializer};
pub use task::{OpKind, PendingTable, Task};
pub use translator::{ObjectIndex, ObjectMapper, SubOpSpec, decompose};

/// Errno-style reply code for a failed backend operation
pub const EIO: u32 = 5;

/// Errno-style reply code for a request outside the volume
pub const EINVAL: u32 = 22;
