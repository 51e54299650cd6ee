//! Test utilities for the engine
//!
//! [`MockTransport`] holds submitted buffers until a test completes them,
//! so every interleaving of submit, completion and poll can be driven from
//! a single thread.
//!
//! # Example
//!
//! ```
//! use common::DeviceSpeed;
//! use engine::test_utils::MockTransport;
//!
//! let transport = MockTransport::new(DeviceSpeed::High);
//! assert_eq!(transport.in_flight(0x81), 0);
//! ```

use crate::buffer::{PacketStatus, TransferBuffer, TransferStatus};
use crate::callbacks::{IsoDataHandler, IsoPacket, LifecycleListener};
use crate::error::TransportError;
use crate::transport::{
    CompletionSink, ControlRequest, EndpointShape, SubmitError, Transport, is_in_endpoint,
};
use common::{DeathReason, DeviceSpeed, PipeId};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

type SubmitHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct MockState {
    sinks: HashMap<u8, Arc<dyn CompletionSink>>,
    unregistered: Vec<u8>,
    /// Submitted buffers in submission order
    in_flight: VecDeque<(u8, TransferBuffer)>,
    fail_next_submit: Option<TransportError>,
    fail_reset: Option<TransportError>,
    before_submit: Option<SubmitHook>,
    /// Aborts are counted but nothing is cancelled
    hold_aborts: bool,
    bulk_in: VecDeque<Vec<u8>>,
    bulk_out: Vec<(u8, Vec<u8>)>,
    control_in: VecDeque<Vec<u8>>,
    control_out: Vec<(ControlRequest, Vec<u8>)>,
}

/// In-memory [`Transport`]
pub struct MockTransport {
    speed: DeviceSpeed,
    state: Mutex<MockState>,
    submits: AtomicUsize,
    aborts: AtomicUsize,
    resets: AtomicUsize,
    stall_clears: AtomicUsize,
}

impl MockTransport {
    pub fn new(speed: DeviceSpeed) -> Self {
        Self {
            speed,
            state: Mutex::new(MockState::default()),
            submits: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            stall_clears: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Complete the oldest transfer on `endpoint`.
    ///
    /// Successful transfers complete every packet at full length. Input
    /// packets are filled with the low byte of their frame number.
    /// Returns false if nothing was in flight.
    pub fn complete_next(&self, endpoint: u8, status: TransferStatus, arrival_time: u64) -> bool {
        self.complete_next_with(endpoint, status, |buffer| {
            fill_packets(buffer, status, is_in_endpoint(endpoint));
            buffer.set_arrival_time(arrival_time);
        })
    }

    /// Complete the oldest transfer on `endpoint` after letting `prepare`
    /// write its packets
    pub fn complete_next_with<F>(&self, endpoint: u8, status: TransferStatus, prepare: F) -> bool
    where
        F: FnOnce(&mut TransferBuffer),
    {
        let (sink, mut buffer) = {
            let mut state = self.lock();
            let Some(index) = state.in_flight.iter().position(|(ep, _)| *ep == endpoint) else {
                return false;
            };
            let Some((_, buffer)) = state.in_flight.remove(index) else {
                return false;
            };
            let Some(sink) = state.sinks.get(&endpoint).cloned() else {
                return false;
            };
            (sink, buffer)
        };

        prepare(&mut buffer);
        sink.on_completion(buffer, status);
        true
    }

    pub fn in_flight(&self, endpoint: u8) -> usize {
        self.lock()
            .in_flight
            .iter()
            .filter(|(ep, _)| *ep == endpoint)
            .count()
    }

    /// Sequence frames of the buffers in flight on `endpoint`, oldest first
    pub fn in_flight_frames(&self, endpoint: u8) -> Vec<u64> {
        self.lock()
            .in_flight
            .iter()
            .filter(|(ep, _)| *ep == endpoint)
            .map(|(_, buffer)| buffer.sequence_frame())
            .collect()
    }

    pub fn in_flight_ids(&self, endpoint: u8) -> Vec<usize> {
        self.lock()
            .in_flight
            .iter()
            .filter(|(ep, _)| *ep == endpoint)
            .map(|(_, buffer)| buffer.id())
            .collect()
    }

    /// Packet lengths of the oldest in-flight buffer on `endpoint`
    pub fn in_flight_lengths(&self, endpoint: u8) -> Option<Vec<usize>> {
        self.lock()
            .in_flight
            .iter()
            .find(|(ep, _)| *ep == endpoint)
            .map(|(_, buffer)| buffer.packets().iter().map(|p| p.length).collect())
    }

    pub fn fail_next_submit(&self, error: TransportError) {
        self.lock().fail_next_submit = Some(error);
    }

    pub fn fail_next_reset(&self, error: TransportError) {
        self.lock().fail_reset = Some(error);
    }

    /// Run `hook` inside the next `submit_iso`, before the buffer is accepted
    pub fn before_next_submit<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.lock().before_submit = Some(Box::new(hook));
    }

    /// Make `abort` leave in-flight transfers alone, like a device that
    /// never answers the cancellation
    pub fn hold_aborts(&self, hold: bool) {
        self.lock().hold_aborts = hold;
    }

    pub fn is_registered(&self, endpoint: u8) -> bool {
        self.lock().sinks.contains_key(&endpoint)
    }

    pub fn unregistered(&self) -> Vec<u8> {
        self.lock().unregistered.clone()
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn stall_clear_count(&self) -> usize {
        self.stall_clears.load(Ordering::SeqCst)
    }

    pub fn push_bulk_in(&self, data: &[u8]) {
        self.lock().bulk_in.push_back(data.to_vec());
    }

    pub fn bulk_written(&self) -> Vec<(u8, Vec<u8>)> {
        self.lock().bulk_out.clone()
    }

    pub fn push_control_in(&self, data: &[u8]) {
        self.lock().control_in.push_back(data.to_vec());
    }

    pub fn control_written(&self) -> Vec<(ControlRequest, Vec<u8>)> {
        self.lock().control_out.clone()
    }
}

fn fill_packets(buffer: &mut TransferBuffer, status: TransferStatus, input: bool) {
    if !matches!(
        status,
        TransferStatus::Completed | TransferStatus::Underrun | TransferStatus::Overrun
    ) {
        return;
    }
    let sequence_frame = buffer.sequence_frame();
    for index in 0..buffer.frames() {
        let length = buffer.packets()[index].length;
        if input {
            buffer.packet_slot_mut(index)[..length].fill((sequence_frame + index as u64) as u8);
        }
        let packet = &mut buffer.packets_mut()[index];
        packet.actual_length = length;
        packet.status = PacketStatus::Completed;
    }
}

impl Transport for MockTransport {
    fn speed(&self) -> DeviceSpeed {
        self.speed
    }

    fn register_endpoint(
        &self,
        shape: EndpointShape,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.sinks.contains_key(&shape.endpoint) {
            return Err(TransportError::Busy);
        }
        state.sinks.insert(shape.endpoint, sink);
        Ok(())
    }

    fn unregister_endpoint(&self, endpoint: u8) {
        let mut state = self.lock();
        state.sinks.remove(&endpoint);
        state.unregistered.push(endpoint);
    }

    fn submit_iso(&self, endpoint: u8, buffer: TransferBuffer) -> Result<(), SubmitError> {
        let hook = self.lock().before_submit.take();
        if let Some(hook) = hook {
            hook();
        }

        let mut state = self.lock();
        if let Some(error) = state.fail_next_submit.take() {
            return Err(SubmitError { buffer, error });
        }
        if !state.sinks.contains_key(&endpoint) {
            return Err(SubmitError {
                buffer,
                error: TransportError::NotFound,
            });
        }
        state.in_flight.push_back((endpoint, buffer));
        self.submits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn abort(&self, endpoint: u8) -> Result<(), TransportError> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        let (sink, cancelled) = {
            let mut state = self.lock();
            let Some(sink) = state.sinks.get(&endpoint).cloned() else {
                return Err(TransportError::NotFound);
            };
            if state.hold_aborts {
                return Ok(());
            }
            let (cancelled, kept): (VecDeque<_>, VecDeque<_>) = state
                .in_flight
                .drain(..)
                .partition(|(ep, _)| *ep == endpoint);
            state.in_flight = kept;
            (sink, cancelled)
        };

        for (_, buffer) in cancelled {
            sink.on_completion(buffer, TransferStatus::Cancelled);
        }
        Ok(())
    }

    fn clear_stall(&self, _endpoint: u8) -> Result<(), TransportError> {
        self.stall_clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reset_device(&self) -> Result<(), TransportError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        match self.lock().fail_reset.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn service_events(&self, timeout: Duration) -> Result<(), TransportError> {
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(())
    }

    fn bulk_read(
        &self,
        _endpoint: u8,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let data = self
            .lock()
            .bulk_in
            .pop_front()
            .ok_or(TransportError::Timeout)?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    fn bulk_write(
        &self,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        if is_in_endpoint(endpoint) {
            return Err(TransportError::InvalidParam);
        }
        self.lock().bulk_out.push((endpoint, data.to_vec()));
        Ok(data.len())
    }

    fn control_in(
        &self,
        _request: ControlRequest,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        let data = self
            .lock()
            .control_in
            .pop_front()
            .ok_or(TransportError::Stall)?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    fn control_out(
        &self,
        request: ControlRequest,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.lock().control_out.push((request, data.to_vec()));
        Ok(data.len())
    }
}

/// Listener that counts every notification
#[derive(Debug, Default)]
pub struct RecordingListener {
    started: AtomicUsize,
    stopped: AtomicUsize,
    died: Mutex<Vec<DeathReason>>,
}

impl RecordingListener {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn died(&self) -> Vec<DeathReason> {
        self.died
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LifecycleListener for RecordingListener {
    fn on_pipe_started(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_pipe_stopped(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn on_pipe_died(&self, reason: DeathReason) {
        self.died
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(reason);
    }
}

/// Owned copy of a delivered packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredPacket {
    pub pipe: PipeId,
    pub data: Vec<u8>,
    pub frame: u64,
    pub timestamp: u64,
    pub poll_time: u64,
}

/// Handler that keeps everything it is given
#[derive(Debug, Default)]
pub struct CollectingHandler {
    pub packets: Vec<DeliveredPacket>,
}

impl CollectingHandler {
    pub fn frames(&self) -> Vec<u64> {
        self.packets.iter().map(|p| p.frame).collect()
    }

    pub fn timestamps(&self) -> Vec<u64> {
        self.packets.iter().map(|p| p.timestamp).collect()
    }
}

impl IsoDataHandler for CollectingHandler {
    fn on_iso_data(&mut self, packet: IsoPacket<'_>) {
        self.packets.push(DeliveredPacket {
            pipe: packet.pipe,
            data: packet.data.to_vec(),
            frame: packet.frame,
            timestamp: packet.timestamp,
            poll_time: packet.poll_time,
        });
    }
}
