//! Per-object admission queue for object updates
//!
//! At most one update cycle per object index is active at a time. Later
//! arrivals on the same index wait in FIFO order and are handed to whoever
//! finishes the active cycle.

use crate::translator::ObjectIndex;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::VecDeque;

/// Outcome of [`SectorSerializer::queue_update`]
#[derive(Debug)]
pub enum Admission<T> {
    /// No cycle was active: the caller owns the object and must issue `T` now
    FirstEntry(T),
    /// A cycle is active: `T` was queued and will come back from `pop`
    AddedEntry,
}

impl<T> Admission<T> {
    /// True if the caller must issue the operation immediately
    pub fn is_first(&self) -> bool {
        matches!(self, Self::FirstEntry(_))
    }
}

/// Per-object FIFO of waiting updates
///
/// An entry exists for an object index exactly while an update on it is
/// outstanding. The queue holds only the waiters, never the active update.
/// Locking is per map shard, so unrelated objects do not contend.
pub struct SectorSerializer<T> {
    queues: DashMap<ObjectIndex, VecDeque<T>>,
}

impl<T> Default for SectorSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SectorSerializer<T> {
    /// Create an empty serializer
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }

    /// Admit `op` for `index`, or queue it behind the active update.
    pub fn queue_update(&self, index: ObjectIndex, op: T) -> Admission<T> {
        match self.queues.entry(index) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().push_back(op);
                Admission::AddedEntry
            }
            Entry::Vacant(entry) => {
                entry.insert(VecDeque::new());
                Admission::FirstEntry(op)
            }
        }
    }

    /// Finish the active update on `index` and take the next waiter.
    ///
    /// Returns `None` and drops the entry when nobody is waiting; the object
    /// is then free for the next `queue_update`.
    pub fn pop(&self, index: ObjectIndex) -> Option<T> {
        match self.queues.entry(index) {
            Entry::Occupied(mut entry) => {
                let next = entry.get_mut().pop_front();
                if next.is_none() {
                    entry.remove();
                }
                next
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Whether an update on `index` is outstanding
    pub fn is_active(&self, index: ObjectIndex) -> bool {
        self.queues.contains_key(&index)
    }

    /// Number of updates waiting behind the active one on `index`
    pub fn waiting(&self, index: ObjectIndex) -> usize {
        self.queues.get(&index).map_or(0, |q| q.len())
    }

    /// Number of objects with an outstanding update
    pub fn active_objects(&self) -> usize {
        self.queues.len()
    }
}
