//! Async channel bridge between the USB threads and the Tokio runtime
//!
//! The enumerator and the transport callbacks run on plain OS threads. They
//! push [`DeviceEvent`]s through an [`EventSender`]; the application awaits
//! them on the [`EventBridge`] side.

use crate::usb_types::{DeathReason, DeviceSummary};
use async_channel::{Receiver, Sender, TrySendError, bounded};

/// Default capacity of the event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events from the USB side to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A matching device appeared
    Added {
        /// Full device summary, including the stable identifier
        device: DeviceSummary,
    },

    /// A previously reported device disappeared
    Removed {
        /// Identifier from the matching `Added` event
        identifier: String,
    },

    /// The device's input pipes went from idle to running
    PipeStarted { identifier: String },

    /// All in-flight transfers drained while running (stall or starvation)
    PipeStopped { identifier: String },

    /// The device died and will not stream again
    PipeDied {
        identifier: String,
        reason: DeathReason,
    },
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct EventBridge {
    event_rx: Receiver<DeviceEvent>,
}

impl EventBridge {
    /// Receive the next event
    pub async fn recv_event(&self) -> crate::Result<DeviceEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event without waiting
    pub fn try_recv_event(&self) -> Option<DeviceEvent> {
        self.event_rx.try_recv().ok()
    }
}

/// Handle for USB threads (blocking or non-blocking)
#[derive(Clone)]
pub struct EventSender {
    event_tx: Sender<DeviceEvent>,
}

impl EventSender {
    /// Send an event, blocking while the channel is full
    ///
    /// Only for threads that may block, such as the enumerator.
    pub fn send_event(&self, event: DeviceEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send an event without blocking
    ///
    /// Transport completion callbacks must return promptly, so they use this
    /// and accept that an event is dropped when the application lags.
    pub fn try_send_event(&self, event: DeviceEvent) -> crate::Result<()> {
        self.event_tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => crate::Error::Channel("event channel full".to_string()),
            TrySendError::Closed(_) => crate::Error::Channel("event channel closed".to_string()),
        })
    }

    /// Whether the receiving side has been dropped
    pub fn is_closed(&self) -> bool {
        self.event_tx.is_closed()
    }
}

/// Create the channel bridge between the USB threads and Tokio
///
/// Returns (EventBridge for Tokio, EventSender for USB threads)
pub fn create_event_bridge() -> (EventBridge, EventSender) {
    create_event_bridge_with_capacity(EVENT_CHANNEL_CAPACITY)
}

/// Same as [`create_event_bridge`] with an explicit capacity
pub fn create_event_bridge_with_capacity(capacity: usize) -> (EventBridge, EventSender) {
    let (event_tx, event_rx) = bounded(capacity);
    (EventBridge { event_rx }, EventSender { event_tx })
}
