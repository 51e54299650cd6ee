//! Process-wide monotonic clock in microseconds
//!
//! Arrival times stamped by transports and the target times passed to
//! `poll` must share one time base. Zero is reserved: `poll(0)` means
//! "deliver everything", so the clock starts at 1.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Microseconds since the first call in this process, never zero
pub fn now_micros() -> u64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    u64::try_from(epoch.elapsed().as_micros())
        .unwrap_or(u64::MAX)
        .saturating_add(1)
}
