//! USB value types shared by the engine and the monitor

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Interval between high-speed microframes, in microseconds
pub const MICROFRAME_INTERVAL_US: u64 = 125;

/// Interval between full-speed frames, in microseconds
pub const FRAME_INTERVAL_US: u64 = 1000;

/// Negotiated bus speed of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceSpeed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
    Unknown,
}

impl DeviceSpeed {
    /// Time covered by one isochronous packet slot.
    ///
    /// High-speed (and faster) buses split each 1ms frame into 8 microframes,
    /// full- and low-speed buses deliver one packet per frame.
    pub fn packet_interval_us(self) -> u64 {
        match self {
            DeviceSpeed::High | DeviceSpeed::Super | DeviceSpeed::SuperPlus => {
                MICROFRAME_INTERVAL_US
            }
            DeviceSpeed::Low | DeviceSpeed::Full | DeviceSpeed::Unknown => FRAME_INTERVAL_US,
        }
    }
}

/// Why a device stopped streaming for good
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeathReason {
    /// Unclassified transport failure
    UnknownError,
    /// The host controller could not reserve isochronous bandwidth
    NoBandwidth,
    /// The device disappeared or stopped answering
    NotResponding,
    /// The OS driver refused the request (permissions, unsupported operation)
    BadDriver,
    /// The owning application called `stop_pipes`
    Stopped,
}

impl fmt::Display for DeathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeathReason::UnknownError => write!(f, "unknown error"),
            DeathReason::NoBandwidth => write!(f, "no bandwidth"),
            DeathReason::NotResponding => write!(f, "device not responding"),
            DeathReason::BadDriver => write!(f, "driver rejected request"),
            DeathReason::Stopped => write!(f, "stopped"),
        }
    }
}

/// Index of an input pipe within its controller, in the order pipes were added
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PipeId(pub usize);

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe{}", self.0)
    }
}

/// A device seen by the enumerator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    /// Stable identifier, `vvvv:pppp@bus-port.port`
    pub identifier: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub port_numbers: Vec<u8>,
    pub speed: DeviceSpeed,
}

impl DeviceSummary {
    /// Build the stable identifier for a device at a physical port.
    ///
    /// The device address changes on every re-plug, the port path does not.
    pub fn make_identifier(vendor_id: u16, product_id: u16, bus: u8, ports: &[u8]) -> String {
        let path = if ports.is_empty() {
            "0".to_string()
        } else {
            ports
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(".")
        };
        format!("{:04x}:{:04x}@{}-{}", vendor_id, product_id, bus, path)
    }
}

/// VID:PID match pattern, e.g. `0x0483:*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
    }

    /// An empty filter list allows every device
    pub fn any_match(filters: &[DeviceFilter], vendor_id: u16, product_id: u16) -> bool {
        filters.is_empty() || filters.iter().any(|f| f.matches(vendor_id, product_id))
    }

    fn parse_part(part: &str, name: &str) -> crate::Result<Option<u16>> {
        if part == "*" {
            return Ok(None);
        }

        let hex = part
            .strip_prefix("0x")
            .or_else(|| part.strip_prefix("0X"))
            .ok_or_else(|| {
                crate::Error::Config(format!(
                    "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                    name, part
                ))
            })?;

        if hex.is_empty() || hex.len() > 4 {
            return Err(crate::Error::Config(format!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name, part
            )));
        }

        u16::from_str_radix(hex, 16)
            .map(Some)
            .map_err(|_| crate::Error::Config(format!("Invalid {} '{}', not a valid hex number", name, part)))
    }
}

impl FromStr for DeviceFilter {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 2 {
            return Err(crate::Error::Config(format!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                s
            )));
        }

        Ok(Self {
            vendor_id: Self::parse_part(parts[0], "VID")?,
            product_id: Self::parse_part(parts[1], "PID")?,
        })
    }
}
