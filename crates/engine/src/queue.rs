//! Lock-guarded FIFO of transfer buffers
//!
//! The lock is held only for the push or pop itself, never across I/O or a
//! client callback. Capacity is reserved up front so pushes never allocate.

use crate::buffer::TransferBuffer;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
pub struct BufferQueue {
    name: &'static str,
    capacity: usize,
    buffers: Mutex<VecDeque<TransferBuffer>>,
}

impl BufferQueue {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            buffers: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<TransferBuffer>> {
        // A panic while holding the lock cannot leave the deque half-updated
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn push_back(&self, buffer: TransferBuffer) {
        let mut buffers = self.lock();
        debug_assert!(buffers.len() < self.capacity, "{} queue overfilled", self.name);
        buffers.push_back(buffer);
    }

    /// Put a buffer back at the head, ahead of everything already queued
    pub fn push_front(&self, buffer: TransferBuffer) {
        let mut buffers = self.lock();
        debug_assert!(buffers.len() < self.capacity, "{} queue overfilled", self.name);
        buffers.push_front(buffer);
    }

    pub fn pop_front(&self) -> Option<TransferBuffer> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Pool ids of the queued buffers, front first
    pub fn buffer_ids(&self) -> Vec<usize> {
        self.lock().iter().map(|b| b.id()).collect()
    }
}
