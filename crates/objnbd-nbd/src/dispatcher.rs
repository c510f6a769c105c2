//! Outbound frame queue
//!
//! Frames are written strictly in the order they were queued. Only the front
//! frame is ever partially sent.

use crate::codec::{OutboundFrame, encode_banner, encode_export_info, encode_reply};

use bytes::{Buf, Bytes};
use objnbd_block::Task;
use std::collections::VecDeque;

#[derive(Default)]
pub struct ReplyDispatcher {
    queue: VecDeque<OutboundFrame>,
}

impl ReplyDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_banner(&mut self) {
        self.queue.push_back(encode_banner());
    }

    pub fn push_export_info(&mut self, export_size: u64) {
        self.queue.push_back(encode_export_info(export_size));
    }

    /// Queue the reply for a finished task. Returns the payload size sent.
    ///
    /// A failed task gets a bare header carrying its error code.
    pub fn push_reply(&mut self, task: &Task) -> usize {
        let errno = task.errno();
        let payload = if errno == 0 {
            task.read_payload()
        } else {
            Bytes::new()
        };
        let sent = payload.len();
        self.queue
            .push_back(encode_reply(task.handle(), errno, payload));
        sent
    }

    /// Frame currently being written
    pub fn front_mut(&mut self) -> Option<&mut OutboundFrame> {
        self.queue.front_mut()
    }

    /// Drop the front frame once fully written.
    pub fn pop_sent(&mut self) -> Option<OutboundFrame> {
        match self.queue.front() {
            Some(frame) if !frame.has_remaining() => self.queue.pop_front(),
            _ => None,
        }
    }

    /// Discard everything still queued. Returns how many frames were dropped.
    pub fn abandon(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
