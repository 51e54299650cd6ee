//! Isochronous USB streaming engine
//!
//! Keeps a fixed pool of transfer buffers per endpoint circulating between
//! the client, the engine and the platform USB stack, reconstructs a
//! timestamp for every received packet, and drives a five-state device
//! lifecycle from a single atomic word.
//!
//! # Architecture
//!
//! ```text
//! client thread            service thread             native stack
//! ------------             --------------             ------------
//! poll(t) --drain-->  [receive queue] <--completion-- Transport
//!    |                      |                            ^
//!    +---release--> [free queue] --acquire/submit--------+
//! ```
//!
//! The pipes are generic over [`Transport`]. [`backend::LibusbTransport`]
//! drives real hardware; `test_utils::MockTransport` (behind the
//! `test-utils` feature) lets tests complete transfers by hand.

pub mod backend;
pub mod buffer;
pub mod bulk_pipe;
pub mod callbacks;
pub mod clock;
pub mod config;
pub mod controller;
mod device;
pub mod enumerator;
pub mod error;
pub mod in_pipe;
pub mod out_pipe;
pub mod queue;
pub mod state;
pub mod stats;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;

pub use buffer::{IsoPacketDesc, PacketStatus, TransferBuffer, TransferStatus};
pub use bulk_pipe::BulkPipe;
pub use callbacks::{IsoDataHandler, IsoPacket, LifecycleListener, NoopListener};
pub use config::{DeviceConfig, OutPipeConfig, PipeConfig};
pub use controller::{ControllerSettings, DeviceController, PowerNotifier};
pub use enumerator::{DeviceEnumerator, DeviceSource, LibusbDeviceSource, SnapshotTracker};
pub use error::{EngineError, Result, TransportError};
pub use in_pipe::{InPipe, PollSummary};
pub use out_pipe::{OutPipe, WriteCursor};
pub use state::LifecycleState;
pub use stats::PipeStatsSnapshot;
pub use transport::{CompletionSink, ControlRequest, EndpointShape, SubmitError, Transport};
