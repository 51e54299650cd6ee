//! Client-facing callback contract

use common::{DeathReason, PipeId};

/// One packet handed to the client by `poll`
#[derive(Debug, Clone, Copy)]
pub struct IsoPacket<'a> {
    pub pipe: PipeId,
    pub data: &'a [u8],
    /// Hardware frame (or microframe) number
    pub frame: u64,
    /// Reconstructed arrival time, strictly increasing per pipe
    pub timestamp: u64,
    /// The `target_time` the client passed to `poll`
    pub poll_time: u64,
}

/// Consumer of polled packets
pub trait IsoDataHandler {
    fn on_iso_data(&mut self, packet: IsoPacket<'_>);
}

impl<F> IsoDataHandler for F
where
    F: FnMut(IsoPacket<'_>),
{
    fn on_iso_data(&mut self, packet: IsoPacket<'_>) {
        self(packet)
    }
}

/// Lifecycle notifications
///
/// Invoked from completion callbacks and power notifications as well as from
/// the polling thread, so implementations must not block.
pub trait LifecycleListener: Send + Sync {
    fn on_pipe_started(&self) {}

    fn on_pipe_stopped(&self) {}

    fn on_pipe_died(&self, _reason: DeathReason) {}
}

/// Listener that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl LifecycleListener for NoopListener {}
