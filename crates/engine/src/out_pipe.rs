//! Isochronous output pipe
//!
//! Clients write through a [`WriteCursor`]. Touching the cursor's slot marks
//! the current buffer dirty; the next [`WriteCursor::advance`] submits it,
//! however full it is, and moves on to a fresh buffer. This lets a producer
//! stream bytes without tracking buffer edges.
//!
//! Output transfers are not counted toward the device's in-flight word, so
//! they never move the device between IDLE and RUNNING.

use crate::buffer::{StatusClass, TransferBuffer, TransferStatus};
use crate::config::OutPipeConfig;
use crate::device::DeviceCore;
use crate::error::{EngineError, Result};
use crate::queue::BufferQueue;
use crate::state::LifecycleState;
use crate::stats::{PipeStats, PipeStatsSnapshot};
use crate::transport::{CompletionSink, SubmitError, Transport};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace, warn};

pub struct OutPipe<T: Transport> {
    config: OutPipeConfig,
    core: Arc<DeviceCore<T>>,
    free: BufferQueue,
    in_flight: AtomicUsize,
    stats: PipeStats,
}

impl<T: Transport> OutPipe<T> {
    pub(crate) fn new(config: OutPipeConfig, core: Arc<DeviceCore<T>>) -> Self {
        let free = BufferQueue::new("output", config.pool_depth);
        for index in 0..config.pool_depth {
            free.push_back(TransferBuffer::new(
                index,
                config.max_packet_size,
                config.frames_per_buffer,
            ));
        }

        Self {
            config,
            core,
            free,
            in_flight: AtomicUsize::new(0),
            stats: PipeStats::default(),
        }
    }

    pub fn endpoint(&self) -> u8 {
        self.config.endpoint
    }

    pub fn capacity(&self) -> usize {
        self.config.pool_depth
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PipeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Open a write cursor on a fresh buffer
    pub fn writer(&self) -> Result<WriteCursor<'_, T>> {
        let buffer = self.acquire()?;
        Ok(WriteCursor {
            pipe: self,
            buffer: Some(buffer),
            offset: 0,
            dirty: false,
        })
    }

    fn acquire(&self) -> Result<TransferBuffer> {
        let mut buffer = self
            .free
            .pop_front()
            .ok_or(EngineError::PoolExhausted(self.config.endpoint))?;
        buffer.reset_for_output();
        Ok(buffer)
    }

    fn submit(&self, mut buffer: TransferBuffer, used: usize) -> Result<()> {
        let state = self.core.state.state();
        if !matches!(state, LifecycleState::Idle | LifecycleState::Running) {
            self.free.push_back(buffer);
            return Err(EngineError::InvalidState(state));
        }

        buffer.set_output_lengths(used);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        match self.core.transport.submit_iso(self.config.endpoint, buffer) {
            Ok(()) => {
                self.stats.record_submitted();
                trace!(
                    "{}: output submitted {} bytes on {:#04x}",
                    self.core.label(),
                    used,
                    self.config.endpoint
                );
                Ok(())
            }
            Err(SubmitError { buffer, error }) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                self.free.push_back(buffer);
                self.core.die(error.death_reason(), "isochronous output submit");
                Err(EngineError::Transport(error))
            }
        }
    }
}

impl<T: Transport> CompletionSink for OutPipe<T> {
    fn on_completion(&self, buffer: TransferBuffer, status: TransferStatus) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.stats.record_completed();
        self.free.push_back(buffer);

        match status.class() {
            StatusClass::Success => {}
            StatusClass::Cancelled => {
                debug!("{}: output transfer cancelled", self.core.label());
            }
            StatusClass::Stall => {
                self.stats.record_stall();
                warn!(
                    "{}: output endpoint {:#04x} stalled",
                    self.core.label(),
                    self.config.endpoint
                );
            }
            StatusClass::Fatal(reason) => {
                self.core.die(reason, "isochronous output completion");
            }
        }
    }
}

/// Streaming write access to an [`OutPipe`]
///
/// Dropping a dirty cursor submits its buffer; dropping a clean one returns
/// the buffer unsent.
pub struct WriteCursor<'a, T: Transport> {
    pipe: &'a OutPipe<T>,
    buffer: Option<TransferBuffer>,
    offset: usize,
    dirty: bool,
}

impl<T: Transport> WriteCursor<'_, T> {
    /// Bytes left in the current buffer
    pub fn remaining(&self) -> usize {
        self.buffer
            .as_ref()
            .map_or(0, |buffer| buffer.capacity() - self.offset)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Writable tail of the current buffer. Marks the buffer dirty.
    pub fn remaining_mut(&mut self) -> Result<&mut [u8]> {
        if self.buffer.is_none() {
            self.buffer = Some(self.pipe.acquire()?);
            self.offset = 0;
        }
        self.dirty = true;
        let offset = self.offset;
        match self.buffer.as_mut() {
            Some(buffer) => Ok(&mut buffer.data_mut()[offset..]),
            None => Err(EngineError::PoolExhausted(self.pipe.endpoint())),
        }
    }

    /// Commit `n` bytes.
    ///
    /// A dirty buffer is submitted with everything written so far and a
    /// fresh one takes its place; a clean buffer just moves the cursor.
    pub fn advance(&mut self, n: usize) -> Result<()> {
        let n = n.min(self.remaining());
        if !self.dirty {
            self.offset += n;
            return Ok(());
        }

        let used = self.offset + n;
        self.dirty = false;
        self.offset = 0;
        if let Some(buffer) = self.buffer.take() {
            self.pipe.submit(buffer, used)?;
        }
        self.buffer = Some(self.pipe.acquire()?);
        Ok(())
    }

    /// Copy `bytes` out, spanning as many buffers as needed
    pub fn write(&mut self, mut bytes: &[u8]) -> Result<usize> {
        let total = bytes.len();
        while !bytes.is_empty() {
            let slot = self.remaining_mut()?;
            let n = slot.len().min(bytes.len());
            slot[..n].copy_from_slice(&bytes[..n]);
            self.advance(n)?;
            bytes = &bytes[n..];
        }
        Ok(total)
    }
}

impl<T: Transport> Drop for WriteCursor<'_, T> {
    fn drop(&mut self) {
        let Some(buffer) = self.buffer.take() else {
            return;
        };
        if self.dirty {
            if let Err(e) = self.pipe.submit(buffer, self.offset) {
                debug!("output flush on drop failed: {}", e);
            }
        } else {
            self.pipe.free.push_back(buffer);
        }
    }
}
