//! Isochronous input pipe
//!
//! Owns a fixed pool of [`TransferBuffer`]s split between a free queue, a
//! receive queue and the transport. Completions arrive on the transport's
//! thread and push filled buffers onto the receive queue; the client drains
//! them with [`InPipe::poll`], which reconstructs a timestamp for every
//! packet and hands due packets to an [`IsoDataHandler`].
//!
//! # Buffer stealing
//!
//! When the client polls too slowly the free queue runs dry. Rather than let
//! the hardware starve, [`InPipe::acquire`] takes the oldest undelivered
//! buffer from the receive queue. Its packets are lost and the next
//! frame-number check in `poll` is expected to fail, so that one check is
//! silenced by the one-shot `stolen` flag.

use crate::buffer::{StatusClass, TransferBuffer, TransferStatus};
use crate::callbacks::{IsoDataHandler, IsoPacket};
use crate::config::PipeConfig;
use crate::device::DeviceCore;
use crate::error::{EngineError, Result};
use crate::queue::BufferQueue;
use crate::state::LifecycleState;
use crate::stats::{PipeStats, PipeStatsSnapshot};
use crate::transport::{CompletionSink, SubmitError, Transport};
use common::PipeId;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace, warn};

/// What one `poll` call did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub delivered: usize,
    /// A stolen buffer was detected while draining
    pub stolen: bool,
}

impl PollSummary {
    pub fn merge(&mut self, other: PollSummary) {
        self.delivered += other.delivered;
        self.stolen |= other.stolen;
    }
}

/// Poll-side cursor, only touched by the polling thread
#[derive(Debug, Default)]
struct DrainCursor {
    expected_frame: u64,
    last_delivered: u64,
}

pub struct InPipe<T: Transport> {
    id: PipeId,
    config: PipeConfig,
    core: Arc<DeviceCore<T>>,
    free: BufferQueue,
    receive: BufferQueue,
    in_flight: AtomicUsize,
    next_submit_frame: AtomicU64,
    stolen: AtomicBool,
    starving: AtomicBool,
    stalled: AtomicBool,
    drain: Mutex<DrainCursor>,
    stats: PipeStats,
}

impl<T: Transport> InPipe<T> {
    pub(crate) fn new(id: PipeId, config: PipeConfig, core: Arc<DeviceCore<T>>) -> Self {
        let free = BufferQueue::new("free", config.pool_depth);
        let receive = BufferQueue::new("receive", config.pool_depth);
        for index in 0..config.pool_depth {
            free.push_back(TransferBuffer::new(
                index,
                config.max_packet_size,
                config.frames_per_buffer,
            ));
        }

        debug!(
            "{}: {} on endpoint {:#04x}: {} buffers of {}x{} bytes",
            core.label(),
            id,
            config.endpoint,
            config.pool_depth,
            config.frames_per_buffer,
            config.max_packet_size
        );

        Self {
            id,
            config,
            core,
            free,
            receive,
            in_flight: AtomicUsize::new(0),
            next_submit_frame: AtomicU64::new(0),
            stolen: AtomicBool::new(false),
            starving: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            drain: Mutex::new(DrainCursor::default()),
            stats: PipeStats::default(),
        }
    }

    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn endpoint(&self) -> u8 {
        self.config.endpoint
    }

    pub fn config(&self) -> &PipeConfig {
        &self.config
    }

    /// Buffers owned by this pipe
    pub fn capacity(&self) -> usize {
        self.config.pool_depth
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn receive_len(&self) -> usize {
        self.receive.len()
    }

    /// Buffers currently held by the transport
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn free_ids(&self) -> Vec<usize> {
        self.free.buffer_ids()
    }

    pub fn receive_ids(&self) -> Vec<usize> {
        self.receive.buffer_ids()
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PipeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Take a buffer for submission, stealing from the receive queue when
    /// the free queue is empty. `None` only when both queues are empty.
    pub fn acquire(&self) -> Option<TransferBuffer> {
        if let Some(buffer) = self.free.pop_front() {
            self.starving.store(false, Ordering::Release);
            return Some(buffer);
        }

        let buffer = self.receive.pop_front()?;
        self.stolen.store(true, Ordering::Release);
        self.stats.record_steal();
        if !self.starving.swap(true, Ordering::AcqRel) {
            warn!(
                "{}: {} free queue empty, stealing undelivered buffer (frame {}); client is polling too slowly",
                self.core.label(),
                self.id,
                buffer.sequence_frame()
            );
        }
        Some(buffer)
    }

    /// Return a buffer to the free queue
    pub fn release(&self, buffer: TransferBuffer) {
        self.free.push_back(buffer);
    }

    /// Submit `buffer` to the transport.
    ///
    /// The device must be IDLE or RUNNING. A transport rejection kills the
    /// device; the buffer goes back to the free queue either way.
    pub fn submit(&self, buffer: TransferBuffer) -> Result<()> {
        if !self.core.state.begin_flight() {
            let state = self.core.state.state();
            self.release(buffer);
            return Err(EngineError::InvalidState(state));
        }
        self.submit_counted(buffer)
    }

    /// Submit a buffer whose slot in the device-wide count is already taken
    fn submit_counted(&self, mut buffer: TransferBuffer) -> Result<()> {
        let frames = self.config.frames_per_buffer as u64;
        let sequence_frame = self.next_submit_frame.fetch_add(frames, Ordering::AcqRel);
        buffer.reset_for_input(sequence_frame);

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        match self.core.transport.submit_iso(self.config.endpoint, buffer) {
            Ok(()) => {
                self.stats.record_submitted();
                trace!(
                    "{}: {} submitted frame {}",
                    self.core.label(),
                    self.id,
                    sequence_frame
                );
                // A sleep or kill may have aborted the endpoint while this
                // buffer was on its way in
                let state = self.core.state.state();
                if !matches!(state, LifecycleState::Idle | LifecycleState::Running) {
                    debug!(
                        "{}: {} state changed to {:?} during submit, aborting frame {}",
                        self.core.label(),
                        self.id,
                        state,
                        sequence_frame
                    );
                    if let Err(e) = self.core.transport.abort(self.config.endpoint) {
                        warn!(
                            "{}: {} failed to abort endpoint {:#04x}: {}",
                            self.core.label(),
                            self.id,
                            self.config.endpoint,
                            e
                        );
                    }
                }
                Ok(())
            }
            Err(SubmitError { buffer, error }) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                self.release(buffer);
                self.core.die(error.death_reason(), "isochronous submit");
                self.core.finish_flight();
                Err(EngineError::Transport(error))
            }
        }
    }

    /// Fill the pipeline up to the in-flight depth.
    ///
    /// Frame numbering restarts at zero only when nothing is left to drain;
    /// buffers still waiting in the receive queue keep their place. The
    /// timestamp watermark is never lowered.
    pub(crate) fn start(&self) -> Result<usize> {
        if self.receive.is_empty() {
            let mut drain = self.drain.lock().unwrap_or_else(PoisonError::into_inner);
            drain.expected_frame = 0;
            self.next_submit_frame.store(0, Ordering::Release);
        } else {
            debug!(
                "{}: {} restarting with {} undelivered buffers",
                self.core.label(),
                self.id,
                self.receive.len()
            );
        }
        self.stolen.store(false, Ordering::Release);
        self.starving.store(false, Ordering::Release);
        self.stalled.store(false, Ordering::Release);

        let mut submitted = 0;
        for _ in 0..self.config.in_flight {
            let Some(buffer) = self.acquire() else {
                break;
            };
            self.submit(buffer)?;
            submitted += 1;
        }
        Ok(submitted)
    }

    /// Clear a halted endpoint so the next `poll` can restart it
    pub fn clear_stall(&self) -> Result<()> {
        self.core.transport.clear_stall(self.config.endpoint)?;
        self.stalled.store(false, Ordering::Release);
        debug!(
            "{}: {} cleared stall on endpoint {:#04x}",
            self.core.label(),
            self.id,
            self.config.endpoint
        );
        Ok(())
    }

    /// Deliver every buffered packet that is due before `target_time`.
    ///
    /// `target_time == 0` delivers everything. Timestamps handed to the
    /// handler are strictly increasing, even when the hardware clock is not.
    pub fn poll<H>(&self, target_time: u64, handler: &mut H) -> PollSummary
    where
        H: IsoDataHandler + ?Sized,
    {
        let mut drain = self.drain.lock().unwrap_or_else(PoisonError::into_inner);
        let mut summary = PollSummary::default();
        let interval = self.core.packet_interval_us();

        while let Some(mut buffer) = self.receive.pop_front() {
            let stolen = self.stolen.swap(false, Ordering::AcqRel);
            summary.stolen |= stolen;

            let sequence_frame = buffer.sequence_frame();
            if sequence_frame != drain.expected_frame && !stolen {
                self.stats.record_out_of_order();
                warn!(
                    "{}: {} out of order buffer: expected frame {}, got {}",
                    self.core.label(),
                    self.id,
                    drain.expected_frame,
                    sequence_frame
                );
            }

            let frames = buffer.frames();
            for index in buffer.consumed()..frames {
                let adjusted = (buffer.arrival_time() + index as u64 * interval)
                    .max(drain.last_delivered + 1);

                if target_time != 0 && adjusted >= target_time {
                    buffer.set_consumed(index);
                    drain.expected_frame = sequence_frame;
                    drain.last_delivered = drain.last_delivered.max(target_time - 1);
                    self.receive.push_front(buffer);
                    return summary;
                }

                let packet = buffer.packets()[index];
                if !packet.status.is_ok() {
                    self.stats.record_packet_error();
                    debug!(
                        "{}: {} frame {} packet status {:?}, skipped",
                        self.core.label(),
                        self.id,
                        sequence_frame + index as u64,
                        packet.status
                    );
                } else if packet.actual_length > 0 {
                    let data = buffer.packet_data(index);
                    handler.on_iso_data(IsoPacket {
                        pipe: self.id,
                        data,
                        frame: sequence_frame + index as u64,
                        timestamp: adjusted,
                        poll_time: target_time,
                    });
                    self.stats.record_delivered(data.len());
                    drain.last_delivered = adjusted;
                    summary.delivered += 1;
                }
            }

            buffer.set_consumed(frames);
            drain.expected_frame = sequence_frame + frames as u64;
            self.release(buffer);
        }

        if target_time != 0 {
            drain.last_delivered = drain.last_delivered.max(target_time - 1);
        }
        summary
    }
}

impl<T: Transport> CompletionSink for InPipe<T> {
    fn on_completion(&self, buffer: TransferBuffer, status: TransferStatus) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.stats.record_completed();

        match status.class() {
            StatusClass::Success => {
                trace!(
                    "{}: {} completed frame {} ({:?})",
                    self.core.label(),
                    self.id,
                    buffer.sequence_frame(),
                    status
                );
                self.receive.push_back(buffer);
            }
            StatusClass::Cancelled => {
                debug!(
                    "{}: {} transfer for frame {} cancelled",
                    self.core.label(),
                    self.id,
                    buffer.sequence_frame()
                );
                self.release(buffer);
                self.core.finish_flight();
                return;
            }
            StatusClass::Stall => {
                self.stats.record_stall();
                if !self.stalled.swap(true, Ordering::AcqRel) {
                    warn!(
                        "{}: {} endpoint {:#04x} stalled, waiting for clear",
                        self.core.label(),
                        self.id,
                        self.config.endpoint
                    );
                }
                self.release(buffer);
                self.core.finish_flight();
                return;
            }
            StatusClass::Fatal(reason) => {
                self.release(buffer);
                self.core.die(reason, "isochronous completion");
                self.core.finish_flight();
                return;
            }
        }

        if self.core.state.state() != LifecycleState::Running || self.is_stalled() {
            self.core.finish_flight();
            return;
        }

        // The resubmitted buffer inherits the completed one's in-flight slot
        match self.acquire() {
            Some(next) => {
                // Failures are reported by killing the device
                let _ = self.submit_counted(next);
            }
            None => {
                self.stats.record_starved();
                warn!("{}: {} queue starved", self.core.label(), self.id);
                self.core.finish_flight();
            }
        }
    }
}
