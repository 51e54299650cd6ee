//! Platform transports
//!
//! The pipes are generic over [`crate::transport::Transport`]; this module
//! holds the libusb adapter used on real hardware.

pub mod libusb;

pub use libusb::{LibusbTransport, map_device_speed};
