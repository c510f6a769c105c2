//! Pending client operations
//!
//! A [`Task`] folds the completions of one client request's sub-operations
//! into a single outcome. The [`PendingTable`] maps live client handles to
//! their tasks for one connection.

use crate::error::{BlockError, BlockResult};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Kind of client operation a task serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    Trim,
    Flush,
}

/// Aggregation state for one client request
pub struct Task {
    handle: u64,
    kind: OpKind,
    offset: u64,
    length: u32,
    object_size: u64,
    expected: u32,
    completed: AtomicU32,
    /// First failure wins; never overwritten
    error: OnceLock<BlockError>,
    /// Whole-object read buffers indexed by sequence id
    buffers: Mutex<Vec<Option<Bytes>>>,
}

impl Task {
    /// Create a task expecting `expected` sub-operation completions
    pub fn new(
        handle: u64,
        kind: OpKind,
        offset: u64,
        length: u32,
        object_size: u64,
        expected: u32,
    ) -> Self {
        let slots = if kind == OpKind::Read {
            expected as usize
        } else {
            0
        };
        Self {
            handle,
            kind,
            offset,
            length,
            object_size,
            expected,
            completed: AtomicU32::new(0),
            error: OnceLock::new(),
            buffers: Mutex::new(vec![None; slots]),
        }
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::Acquire)
    }

    /// All expected sub-operations have reported
    pub fn is_complete(&self) -> bool {
        self.completed() >= self.expected
    }

    /// Record a failure without counting a sub-operation.
    ///
    /// Used for errors detected before any sub-operation is issued.
    pub fn fail(&self, error: BlockError) {
        if let Err(later) = self.error.set(error) {
            debug!("handle {:#x}: keeping first error, dropping: {later}", self.handle);
        }
    }

    /// Store one sub-operation result. Returns true when this was the last.
    ///
    /// `Ok(Some(buf))` carries object content for reads; writes report
    /// `Ok(None)`. A read slot with no content is served as zeros.
    pub fn record(&self, sequence: u32, result: BlockResult<Option<Bytes>>) -> bool {
        match result {
            Ok(Some(data)) if self.kind == OpKind::Read => {
                let mut buffers = self.buffers.lock();
                if let Some(slot) = buffers.get_mut(sequence as usize) {
                    *slot = Some(self.normalize(data));
                } else {
                    warn!(
                        "handle {:#x}: read result for unknown sequence {sequence}",
                        self.handle
                    );
                }
            }
            Ok(_) => {}
            Err(e) => self.fail(e),
        }

        let done = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        if done > self.expected {
            warn!(
                "handle {:#x}: {done} completions for {} sub-operations",
                self.handle, self.expected
            );
            return false;
        }
        done == self.expected
    }

    /// The sticky error, if any sub-operation failed
    pub fn error(&self) -> Option<&BlockError> {
        self.error.get()
    }

    /// Reply code for the client: 0 on success
    pub fn errno(&self) -> u32 {
        self.error().map_or(0, BlockError::errno)
    }

    /// Assemble the client-visible read payload.
    ///
    /// Concatenates the per-object buffers in sequence order, drops the
    /// unrequested prefix of the first object and keeps exactly `length`
    /// bytes. Empty for non-read tasks.
    pub fn read_payload(&self) -> Bytes {
        if self.kind != OpKind::Read || self.length == 0 {
            return Bytes::new();
        }

        let buffers = self.buffers.lock();
        let mut out = BytesMut::with_capacity(self.length as usize);
        let mut skip = (self.offset % self.object_size) as usize;
        let mut remaining = self.length as usize;

        for slot in buffers.iter() {
            if remaining == 0 {
                break;
            }
            // An empty slot stands for one object of zeros
            let filled = slot.as_deref();
            let len = filled.map_or(self.object_size as usize, <[u8]>::len);
            if skip >= len {
                skip -= len;
                continue;
            }
            let take = (len - skip).min(remaining);
            match filled {
                Some(buf) => out.extend_from_slice(&buf[skip..skip + take]),
                None => out.resize(out.len() + take, 0),
            }
            remaining -= take;
            skip = 0;
        }

        // Only reachable if fewer objects were recorded than the range spans
        out.resize(self.length as usize, 0);
        out.freeze()
    }

    /// Pad or cut backend content to exactly one object.
    fn normalize(&self, data: Bytes) -> Bytes {
        let size = self.object_size as usize;
        match data.len().cmp(&size) {
            std::cmp::Ordering::Equal => data,
            std::cmp::Ordering::Greater => data.slice(..size),
            std::cmp::Ordering::Less => {
                let mut padded = BytesMut::with_capacity(size);
                padded.extend_from_slice(&data);
                padded.resize(size, 0);
                padded.freeze()
            }
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("expected", &self.expected)
            .field("completed", &self.completed())
            .field("error", &self.error())
            .finish()
    }
}

/// Live tasks of one connection, keyed by client handle
#[derive(Default)]
pub struct PendingTable {
    tasks: Mutex<HashMap<u64, Arc<Task>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new task. Reusing a live handle is a conflict.
    pub fn insert(&self, task: Arc<Task>) -> BlockResult<()> {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&task.handle()) {
            return Err(BlockError::HandleConflict(task.handle()));
        }
        tasks.insert(task.handle(), task);
        Ok(())
    }

    /// Route a sub-operation result to its task.
    ///
    /// Returns the task once every sub-operation has reported. The task stays
    /// registered until [`finish`](Self::finish) is called for its reply.
    pub fn on_suboperation_complete(
        &self,
        handle: u64,
        sequence: u32,
        result: BlockResult<Option<Bytes>>,
    ) -> BlockResult<Option<Arc<Task>>> {
        let task = self
            .tasks
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(BlockError::UnknownHandle(handle))?;

        Ok(task.record(sequence, result).then_some(task))
    }

    /// Remove a task whose reply has been handed to the dispatcher.
    pub fn finish(&self, handle: u64) -> Option<Arc<Task>> {
        self.tasks.lock().remove(&handle)
    }

    pub fn get(&self, handle: u64) -> Option<Arc<Task>> {
        self.tasks.lock().get(&handle).cloned()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}
