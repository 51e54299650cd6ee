//! Construction-time configuration for a streaming device
//!
//! # Example Configuration
//! ```toml
//! vendor_id = 0x0451
//! product_id = 0x5100
//! interface = 0
//!
//! [[in_pipes]]
//! endpoint = 0x81
//! max_packet_size = 64
//! frames_per_buffer = 8
//! pool_depth = 16
//! in_flight = 8
//! ```

use crate::error::{EngineError, Result};
use crate::transport::{EndpointShape, is_in_endpoint};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Largest isochronous payload per microframe (3 x 1024, high-bandwidth)
pub const MAX_ISO_PACKET_SIZE: usize = 3 * 1024;

/// One isochronous input endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeConfig {
    /// Endpoint address, IN direction (bit 7 set)
    pub endpoint: u8,
    pub max_packet_size: usize,
    /// Packets per transfer; larger values trade latency for fewer callbacks
    #[serde(default = "PipeConfig::default_frames_per_buffer")]
    pub frames_per_buffer: usize,
    /// Buffers in the pool
    #[serde(default = "PipeConfig::default_pool_depth")]
    pub pool_depth: usize,
    /// Buffers kept submitted while running
    #[serde(default = "PipeConfig::default_in_flight")]
    pub in_flight: usize,
}

impl PipeConfig {
    pub fn new(endpoint: u8, max_packet_size: usize) -> Self {
        Self {
            endpoint,
            max_packet_size,
            frames_per_buffer: Self::default_frames_per_buffer(),
            pool_depth: Self::default_pool_depth(),
            in_flight: Self::default_in_flight(),
        }
    }

    fn default_frames_per_buffer() -> usize {
        8
    }

    fn default_pool_depth() -> usize {
        16
    }

    fn default_in_flight() -> usize {
        8
    }

    pub fn shape(&self) -> EndpointShape {
        EndpointShape {
            endpoint: self.endpoint,
            packet_size: self.max_packet_size,
            frames_per_buffer: self.frames_per_buffer,
            pool_depth: self.pool_depth,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !is_in_endpoint(self.endpoint) {
            return Err(EngineError::Config(format!(
                "Input pipe endpoint {:#04x} is not an IN endpoint",
                self.endpoint
            )));
        }
        validate_geometry(
            self.endpoint,
            self.max_packet_size,
            self.frames_per_buffer,
            self.pool_depth,
        )?;
        if self.in_flight == 0 || self.in_flight > self.pool_depth {
            return Err(EngineError::Config(format!(
                "Endpoint {:#04x}: in_flight must be between 1 and pool_depth ({}), got {}",
                self.endpoint, self.pool_depth, self.in_flight
            )));
        }
        Ok(())
    }
}

/// The isochronous output endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutPipeConfig {
    /// Endpoint address, OUT direction (bit 7 clear)
    pub endpoint: u8,
    pub max_packet_size: usize,
    #[serde(default = "OutPipeConfig::default_frames_per_buffer")]
    pub frames_per_buffer: usize,
    #[serde(default = "OutPipeConfig::default_pool_depth")]
    pub pool_depth: usize,
}

impl OutPipeConfig {
    pub fn new(endpoint: u8, max_packet_size: usize) -> Self {
        Self {
            endpoint,
            max_packet_size,
            frames_per_buffer: Self::default_frames_per_buffer(),
            pool_depth: Self::default_pool_depth(),
        }
    }

    fn default_frames_per_buffer() -> usize {
        8
    }

    fn default_pool_depth() -> usize {
        4
    }

    pub fn shape(&self) -> EndpointShape {
        EndpointShape {
            endpoint: self.endpoint,
            packet_size: self.max_packet_size,
            frames_per_buffer: self.frames_per_buffer,
            pool_depth: self.pool_depth,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if is_in_endpoint(self.endpoint) {
            return Err(EngineError::Config(format!(
                "Output pipe endpoint {:#04x} is not an OUT endpoint",
                self.endpoint
            )));
        }
        validate_geometry(
            self.endpoint,
            self.max_packet_size,
            self.frames_per_buffer,
            self.pool_depth,
        )
    }
}

fn validate_geometry(
    endpoint: u8,
    packet_size: usize,
    frames_per_buffer: usize,
    pool_depth: usize,
) -> Result<()> {
    if packet_size == 0 || packet_size > MAX_ISO_PACKET_SIZE {
        return Err(EngineError::Config(format!(
            "Endpoint {:#04x}: max_packet_size must be 1-{}, got {}",
            endpoint, MAX_ISO_PACKET_SIZE, packet_size
        )));
    }
    if frames_per_buffer == 0 {
        return Err(EngineError::Config(format!(
            "Endpoint {:#04x}: frames_per_buffer must be at least 1",
            endpoint
        )));
    }
    if pool_depth == 0 {
        return Err(EngineError::Config(format!(
            "Endpoint {:#04x}: pool_depth must be at least 1",
            endpoint
        )));
    }
    Ok(())
}

/// Everything needed to open and stream one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(default)]
    pub interface: u8,
    #[serde(default)]
    pub alt_setting: u8,
    #[serde(default)]
    pub in_pipes: Vec<PipeConfig>,
    #[serde(default)]
    pub out_pipe: Option<OutPipeConfig>,
    /// CPU to pin the service thread to
    #[serde(default)]
    pub realtime_cpu: Option<usize>,
    /// Upper bound on waiting for in-flight transfers in `stop_pipes`
    #[serde(default = "DeviceConfig::default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// How long one service-thread event wait may block
    #[serde(default = "DeviceConfig::default_service_interval_ms")]
    pub service_interval_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x0451,
            product_id: 0x5100,
            interface: 0,
            alt_setting: 0,
            in_pipes: vec![PipeConfig::new(0x81, 64)],
            out_pipe: None,
            realtime_cpu: None,
            stop_timeout_ms: Self::default_stop_timeout_ms(),
            service_interval_ms: Self::default_service_interval_ms(),
        }
    }
}

impl DeviceConfig {
    fn default_stop_timeout_ms() -> u64 {
        500
    }

    fn default_service_interval_ms() -> u64 {
        100
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn service_interval(&self) -> Duration {
        Duration::from_millis(self.service_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_pipes.is_empty() && self.out_pipe.is_none() {
            return Err(EngineError::Config(
                "Device has no isochronous pipes configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for pipe in &self.in_pipes {
            pipe.validate()?;
            if !seen.insert(pipe.endpoint) {
                return Err(EngineError::Config(format!(
                    "Endpoint {:#04x} configured twice",
                    pipe.endpoint
                )));
            }
        }
        if let Some(out) = &self.out_pipe {
            out.validate()?;
        }

        if self.service_interval_ms == 0 {
            return Err(EngineError::Config(
                "service_interval_ms must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
