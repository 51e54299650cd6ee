//! Common utilities for iso-usb
//!
//! This crate provides shared functionality between the streaming engine and
//! the monitor binary: USB value types, error handling, logging setup and the
//! async channel bridge that carries device events out of the USB threads.

pub mod channel;
pub mod error;
pub mod logging;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb_types;

pub use channel::{DeviceEvent, EventBridge, EventSender, create_event_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{DeathReason, DeviceFilter, DeviceSpeed, DeviceSummary, PipeId};
