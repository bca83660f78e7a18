//! Priority/arrival ordered request queue.

use std::collections::VecDeque;

use crate::RequestId;

/// Ordering key: `(priority, arrival)`, smaller first
pub type QueueKey = (u32, u64);

/// Queue of request IDs kept sorted by [`QueueKey`]
///
/// Lower priority values come first; equal priorities keep arrival order.
/// A request put back after a failed admission lands at the front again
/// because its key has not changed.
#[derive(Debug, Default, Clone)]
pub struct RequestQueue {
    entries: VecDeque<(QueueKey, RequestId)>,
}

impl RequestQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a request at its ordered position
    pub fn push(&mut self, id: RequestId, key: QueueKey) {
        let pos = self.find_insert_position(key);
        self.entries.insert(pos, (key, id));
    }

    /// Find the position to insert a key
    fn find_insert_position(&self, key: QueueKey) -> usize {
        self.entries.partition_point(|(existing, _)| *existing <= key)
    }

    /// Look at the head of the queue
    pub fn peek(&self) -> Option<(RequestId, QueueKey)> {
        self.entries.front().map(|&(key, id)| (id, key))
    }

    /// Remove and return the head of the queue
    pub fn pop(&mut self) -> Option<RequestId> {
        self.entries.pop_front().map(|(_, id)| id)
    }

    /// Remove a specific request; returns whether it was queued
    pub fn remove(&mut self, id: RequestId) -> bool {
        match self.entries.iter().position(|&(_, queued)| queued == id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Queued request IDs in service order
    pub fn ids(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.entries.iter().map(|&(_, id)| id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
