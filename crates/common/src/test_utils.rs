//! Test utilities for iso-usb
//!
//! Provides mock values and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_device_summary;
//!
//! let device = create_mock_device_summary(1, 0x1234, 0x5678);
//! assert_eq!(device.vendor_id, 0x1234);
//! assert_eq!(device.identifier, "1234:5678@1-1");
//! ```

use crate::usb_types::{DeviceSpeed, DeviceSummary};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock high-speed DeviceSummary plugged into port `port` of bus 1
pub fn create_mock_device_summary(port: u8, vendor_id: u16, product_id: u16) -> DeviceSummary {
    create_mock_device_summary_with_speed(port, vendor_id, product_id, DeviceSpeed::High)
}

/// Create a mock DeviceSummary with a specific bus speed
pub fn create_mock_device_summary_with_speed(
    port: u8,
    vendor_id: u16,
    product_id: u16,
    speed: DeviceSpeed,
) -> DeviceSummary {
    let port_numbers = vec![port];
    DeviceSummary {
        identifier: DeviceSummary::make_identifier(vendor_id, product_id, 1, &port_numbers),
        vendor_id,
        product_id,
        bus_number: 1,
        port_numbers,
        speed,
    }
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
