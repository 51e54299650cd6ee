//! Synchronous bulk endpoint access
//!
//! Bulk pipes bypass the buffer pool entirely: each call is one blocking
//! transfer with a caller-chosen timeout.

use crate::error::{EngineError, Result};
use crate::transport::{Transport, is_in_endpoint};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default timeout for bulk transfers (5 seconds)
pub const DEFAULT_BULK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct BulkPipe<T: Transport> {
    transport: Arc<T>,
    endpoint: u8,
    timeout: Duration,
}

impl<T: Transport> Clone for BulkPipe<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            endpoint: self.endpoint,
            timeout: self.timeout,
        }
    }
}

impl<T: Transport> BulkPipe<T> {
    pub(crate) fn new(transport: Arc<T>, endpoint: u8) -> Self {
        Self {
            transport,
            endpoint,
            timeout: DEFAULT_BULK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Read up to `buf.len()` bytes
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if !is_in_endpoint(self.endpoint) {
            return Err(EngineError::Config(format!(
                "Cannot read from OUT endpoint {:#04x}",
                self.endpoint
            )));
        }

        debug!(
            "Bulk read: endpoint={:#x}, len={}, timeout={}ms",
            self.endpoint,
            buf.len(),
            self.timeout.as_millis()
        );

        match self.transport.bulk_read(self.endpoint, buf, self.timeout) {
            Ok(len) => {
                debug!("Bulk read succeeded: {} bytes", len);
                Ok(len)
            }
            Err(e) => {
                warn!("Bulk read on {:#x} failed: {}", self.endpoint, e);
                Err(e.into())
            }
        }
    }

    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if is_in_endpoint(self.endpoint) {
            return Err(EngineError::Config(format!(
                "Cannot write to IN endpoint {:#04x}",
                self.endpoint
            )));
        }

        debug!(
            "Bulk write: endpoint={:#x}, len={}, timeout={}ms",
            self.endpoint,
            data.len(),
            self.timeout.as_millis()
        );

        match self.transport.bulk_write(self.endpoint, data, self.timeout) {
            Ok(len) => {
                debug!("Bulk write succeeded: {} bytes", len);
                Ok(len)
            }
            Err(e) => {
                warn!("Bulk write on {:#x} failed: {}", self.endpoint, e);
                Err(e.into())
            }
        }
    }
}
