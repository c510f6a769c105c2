//! Volume I/O engine
//!
//! Turns one client byte-range request into object get/put calls, runs
//! read-modify-write cycles for partial updates under the per-object
//! serializer, and reports finished tasks through a bounded ready queue.

use crate::backend::{BackendRequest, Correlation, ObjectBackend, ObjectKey, VolumeGeometry};
use crate::error::{BlockError, BlockResult};
use crate::registry::{AttachmentHandle, WriteSerializer};
use crate::serializer::Admission;
use crate::task::{OpKind, PendingTable, Task};
use crate::translator::{ObjectMapper, SubOpSpec};

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// A client request as seen by the engine
#[derive(Debug, Clone)]
pub struct IoRequest {
    pub handle: u64,
    pub kind: OpKind,
    pub offset: u64,
    pub length: u32,
    /// Write data; empty for every other kind
    pub payload: Bytes,
}

/// Where sub-operation results go
///
/// Results are folded into the connection's [`PendingTable`]; a task whose
/// last sub-operation reported is pushed onto the ready queue. The queue is
/// bounded and `deliver` waits for room rather than dropping a task.
pub struct CompletionSink {
    table: Arc<PendingTable>,
    ready: mpsc::Sender<Arc<Task>>,
}

impl CompletionSink {
    pub fn new(table: Arc<PendingTable>, ready: mpsc::Sender<Arc<Task>>) -> Self {
        Self { table, ready }
    }

    pub fn table(&self) -> &Arc<PendingTable> {
        &self.table
    }

    /// Record one sub-operation result and deliver the task when finished.
    pub async fn complete(&self, token: Correlation, result: BlockResult<Option<Bytes>>) {
        match self
            .table
            .on_suboperation_complete(token.handle, token.sequence, result)
        {
            Ok(Some(task)) => self.deliver(task).await,
            Ok(None) => {}
            Err(e) => warn!("dropping completion {token}: {e}"),
        }
    }

    /// Hand a finished task to the connection.
    pub async fn deliver(&self, task: Arc<Task>) {
        let handle = task.handle();
        if self.ready.send(task).await.is_err() {
            warn!("ready queue closed; reply for handle {handle:#x} abandoned");
        }
    }
}

/// One queued or active object update
pub struct WriteSubOp {
    token: Correlation,
    key: ObjectKey,
    offset_in_object: usize,
    payload: Bytes,
    sink: Arc<CompletionSink>,
}

impl WriteSubOp {
    pub fn token(&self) -> Correlation {
        self.token
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Covers the whole object, so no fetch is needed
    fn is_full(&self, object_size: usize) -> bool {
        self.offset_in_object == 0 && self.payload.len() == object_size
    }
}

impl std::fmt::Debug for WriteSubOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSubOp")
            .field("token", &self.token)
            .field("key", &self.key)
            .field("offset_in_object", &self.offset_in_object)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Block I/O for one connection against one attached volume
pub struct VolumeIo {
    backend: Arc<dyn ObjectBackend>,
    attachment: Arc<AttachmentHandle>,
    mapper: ObjectMapper,
    blob: String,
    sink: Arc<CompletionSink>,
}

impl VolumeIo {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        attachment: Arc<AttachmentHandle>,
        blob: impl Into<String>,
        sink: Arc<CompletionSink>,
    ) -> Self {
        let mapper = ObjectMapper::new(attachment.geometry().object_size);
        Self {
            backend,
            attachment,
            mapper,
            blob: blob.into(),
            sink,
        }
    }

    pub fn attachment(&self) -> &Arc<AttachmentHandle> {
        &self.attachment
    }

    pub fn geometry(&self) -> VolumeGeometry {
        self.attachment.geometry()
    }

    /// Register a task for `request` and issue its sub-operations.
    ///
    /// Only a handle conflict or a released attachment is returned as an
    /// error; both are fatal to the connection. Every other failure ends up
    /// on the task and reaches the client as a reply code.
    pub async fn submit(&self, request: IoRequest) -> BlockResult<()> {
        if self.attachment.is_released() {
            return Err(BlockError::Released(self.attachment.volume().to_string()));
        }

        let geometry = self.geometry();
        let length = u64::from(request.length);
        let task_for = |expected: u32| {
            Arc::new(Task::new(
                request.handle,
                request.kind,
                request.offset,
                request.length,
                geometry.object_size,
                expected,
            ))
        };

        if request.kind == OpKind::Flush {
            let task = task_for(0);
            self.sink.table.insert(Arc::clone(&task))?;
            self.sink.deliver(task).await;
            return Ok(());
        }

        let in_bounds = request
            .offset
            .checked_add(length)
            .is_some_and(|end| end <= geometry.capacity);
        if !in_bounds {
            debug!(
                "handle {:#x}: {}+{} outside {}B volume",
                request.handle, request.offset, length, geometry.capacity
            );
            let task = task_for(0);
            task.fail(BlockError::OutOfBounds {
                offset: request.offset,
                length,
                size: geometry.capacity,
            });
            self.sink.table.insert(Arc::clone(&task))?;
            self.sink.deliver(task).await;
            return Ok(());
        }

        let specs = self.mapper.decompose(request.offset, length);
        let task = task_for(specs.len() as u32);
        self.sink.table.insert(Arc::clone(&task))?;
        trace!(
            "handle {:#x}: {:?} {}+{} -> {} sub-ops",
            request.handle,
            request.kind,
            request.offset,
            length,
            specs.len()
        );

        if specs.is_empty() {
            self.sink.deliver(task).await;
            return Ok(());
        }

        match request.kind {
            OpKind::Read => {
                for spec in &specs {
                    self.issue_read(request.handle, spec);
                }
            }
            OpKind::Write => {
                let payload = request.payload;
                if payload.len() as u64 != length {
                    // Decoder guarantees this; keep the counter consistent anyway
                    warn!(
                        "handle {:#x}: payload {}B for a {length}B write",
                        request.handle,
                        payload.len()
                    );
                }
                for spec in &specs {
                    let start = (spec.request_offset as usize).min(payload.len());
                    let end = (start + spec.length as usize).min(payload.len());
                    self.issue_update(request.handle, spec, payload.slice(start..end));
                }
            }
            OpKind::Trim => {
                // One object of zeros, sliced for every piece
                let zeros = Bytes::from(vec![0u8; length.min(self.mapper.object_size()) as usize]);
                for spec in &specs {
                    self.issue_update(request.handle, spec, zeros.slice(..spec.length as usize));
                }
            }
            OpKind::Flush => {}
        }

        Ok(())
    }

    fn key(&self, index: u64) -> ObjectKey {
        ObjectKey::new(self.attachment.volume(), self.blob.as_str(), index)
    }

    /// Reads bypass the serializer; each object get is atomic at the backend.
    fn issue_read(&self, handle: u64, spec: &SubOpSpec) {
        let backend = Arc::clone(&self.backend);
        let sink = Arc::clone(&self.sink);
        let token = Correlation::new(handle, spec.sequence);
        let key = self.key(spec.object_index);
        let length_hint = self.mapper.object_size();

        tokio::spawn(async move {
            let response = backend
                .submit(token, BackendRequest::Get { key, length_hint })
                .await;
            let result = match response.into_object() {
                Ok(data) => Ok(Some(data)),
                // Never written: the task fills the slot with zeros
                Err(e) if e.is_absent() => Ok(None),
                Err(e) => {
                    warn!("read {token} failed: {e}");
                    Err(e.into())
                }
            };
            sink.complete(token, result).await;
        });
    }

    fn issue_update(&self, handle: u64, spec: &SubOpSpec, payload: Bytes) {
        let op = WriteSubOp {
            token: Correlation::new(handle, spec.sequence),
            key: self.key(spec.object_index),
            offset_in_object: spec.offset_in_object as usize,
            payload,
            sink: Arc::clone(&self.sink),
        };

        let serializer = self.attachment.serializer();
        match serializer.queue_update(spec.object_index, op) {
            Admission::FirstEntry(op) => {
                tokio::spawn(run_update_chain(
                    Arc::clone(&self.backend),
                    Arc::clone(serializer),
                    self.mapper.object_size() as usize,
                    op,
                ));
            }
            Admission::AddedEntry => {
                trace!(
                    "object {} busy; handle {handle:#x} seq {} queued",
                    spec.object_index, spec.sequence
                );
            }
        }
    }
}

/// Run `first` and then every update queued behind it on the same object.
///
/// Each successful cycle leaves the merged object content behind, and the
/// next queued update merges against it instead of fetching again. A failed
/// cycle forces the next one to fetch. The queue is always drained.
async fn run_update_chain(
    backend: Arc<dyn ObjectBackend>,
    serializer: Arc<WriteSerializer>,
    object_size: usize,
    first: WriteSubOp,
) {
    let index = first.key.index;
    let mut current: Option<Bytes> = None;
    let mut next = Some(first);

    while let Some(op) = next {
        let result = apply_update(backend.as_ref(), object_size, &op, current.take()).await;
        let outcome = match result {
            Ok(merged) => {
                current = Some(merged);
                Ok(None)
            }
            Err(e) => {
                warn!("update {} on {} failed: {e}", op.token, op.key);
                Err(e)
            }
        };
        op.sink.complete(op.token, outcome).await;
        next = serializer.pop(index);
    }
}

/// One read-modify-write cycle. Returns the object content now stored.
async fn apply_update(
    backend: &dyn ObjectBackend,
    object_size: usize,
    op: &WriteSubOp,
    current: Option<Bytes>,
) -> BlockResult<Bytes> {
    let merged = if op.is_full(object_size) {
        op.payload.clone()
    } else {
        let base = match current {
            Some(base) => base,
            None => fetch_current(backend, op, object_size).await?,
        };
        splice(&base, op.offset_in_object, &op.payload, object_size)
    };

    backend
        .submit(
            op.token,
            BackendRequest::Put {
                key: op.key.clone(),
                data: merged.clone(),
            },
        )
        .await
        .into_put()?;
    Ok(merged)
}

/// Current object content; an object that was never written reads as empty.
async fn fetch_current(
    backend: &dyn ObjectBackend,
    op: &WriteSubOp,
    object_size: usize,
) -> BlockResult<Bytes> {
    let response = backend
        .submit(
            op.token,
            BackendRequest::Get {
                key: op.key.clone(),
                length_hint: object_size as u64,
            },
        )
        .await;
    match response.into_object() {
        Ok(data) => Ok(data),
        Err(e) if e.is_absent() => Ok(Bytes::new()),
        Err(e) => Err(e.into()),
    }
}

/// Copy `patch` into `base` at `offset`, zero-padding `base` to one object.
fn splice(base: &Bytes, offset: usize, patch: &[u8], object_size: usize) -> Bytes {
    let mut merged = BytesMut::with_capacity(object_size);
    merged.extend_from_slice(&base[..base.len().min(object_size)]);
    merged.resize(object_size, 0);
    let end = (offset + patch.len()).min(object_size);
    merged[offset..end].copy_from_slice(&patch[..end - offset]);
    merged.freeze()
}
