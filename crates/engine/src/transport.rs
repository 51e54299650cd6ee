//! The capability the engine needs from a platform USB stack
//!
//! Back-ends implement [`Transport`]; the pipes implement
//! [`CompletionSink`] and register themselves per endpoint. Buffers are
//! handed to the transport by value on submit and come back by value through
//! the sink, on whatever thread the native stack completes them.

use crate::buffer::{TransferBuffer, TransferStatus};
use crate::error::TransportError;
use common::DeviceSpeed;
use std::sync::Arc;
use std::time::Duration;

/// Receives finished transfers from a transport
///
/// Called on a transport-owned thread. Implementations must return promptly
/// and must not panic.
pub trait CompletionSink: Send + Sync {
    fn on_completion(&self, buffer: TransferBuffer, status: TransferStatus);
}

/// Geometry of the buffers that will be submitted on an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointShape {
    pub endpoint: u8,
    pub packet_size: usize,
    pub frames_per_buffer: usize,
    /// Upper bound on buffers in flight at once
    pub pool_depth: usize,
}

/// A rejected submission hands the buffer back to its owner
#[derive(Debug)]
pub struct SubmitError {
    pub buffer: TransferBuffer,
    pub error: TransportError,
}

/// Setup stage of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

pub trait Transport: Send + Sync + 'static {
    /// Negotiated bus speed; selects the packet interval
    fn speed(&self) -> DeviceSpeed;

    /// Prepare native resources for `shape` and route its completions to `sink`
    fn register_endpoint(
        &self,
        shape: EndpointShape,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<(), TransportError>;

    /// Release native resources; only called once nothing is in flight
    fn unregister_endpoint(&self, endpoint: u8);

    /// Queue an isochronous transfer. Per-packet lengths come from the buffer.
    fn submit_iso(&self, endpoint: u8, buffer: TransferBuffer) -> Result<(), SubmitError>;

    /// Cancel every in-flight transfer on `endpoint`. Completions still arrive,
    /// with [`TransferStatus::Cancelled`].
    fn abort(&self, endpoint: u8) -> Result<(), TransportError>;

    fn clear_stall(&self, endpoint: u8) -> Result<(), TransportError>;

    fn reset_device(&self) -> Result<(), TransportError>;

    /// Dispatch pending native events, waiting at most `timeout`
    fn service_events(&self, timeout: Duration) -> Result<(), TransportError>;

    fn bulk_read(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn bulk_write(&self, endpoint: u8, data: &[u8], timeout: Duration)
    -> Result<usize, TransportError>;

    fn control_in(
        &self,
        request: ControlRequest,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn control_out(
        &self,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;
}

/// Bit 7 of an endpoint address marks device-to-host
pub fn is_in_endpoint(endpoint: u8) -> bool {
    endpoint & 0x80 != 0
}
