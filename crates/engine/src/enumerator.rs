//! Device enumerator
//!
//! A background thread lists the attached devices on a fixed interval,
//! diffs each listing against the previous one and reports additions and
//! removals through an [`EventSender`]. The identifier carried by each event
//! is all [`crate::backend::LibusbTransport::open`] needs.

use crate::backend::libusb::{device_identifier, map_device_speed};
use crate::error::Result;
use common::{DeviceEvent, DeviceFilter, DeviceSummary, EventSender};
use rusb::{Context, UsbContext};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Linux Foundation root hubs
const ROOT_HUB_VENDOR_ID: u16 = 0x1d6b;
const HUB_CLASS: u8 = 9;

/// Anything that can list the currently attached devices
pub trait DeviceSource: Send + 'static {
    fn list_devices(&mut self) -> Result<Vec<DeviceSummary>>;
}

/// Lists devices through libusb
pub struct LibusbDeviceSource {
    context: Context,
}

impl LibusbDeviceSource {
    pub fn new(context: Context) -> Self {
        Self { context }
    }
}

impl DeviceSource for LibusbDeviceSource {
    fn list_devices(&mut self) -> Result<Vec<DeviceSummary>> {
        let mut summaries = Vec::new();
        for device in self.context.devices()?.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if descriptor.vendor_id() == ROOT_HUB_VENDOR_ID && descriptor.class_code() == HUB_CLASS
            {
                continue;
            }
            let Some(identifier) = device_identifier(&device) else {
                continue;
            };
            summaries.push(DeviceSummary {
                identifier,
                vendor_id: descriptor.vendor_id(),
                product_id: descriptor.product_id(),
                bus_number: device.bus_number(),
                port_numbers: device.port_numbers().unwrap_or_default(),
                speed: map_device_speed(device.speed()),
            });
        }
        Ok(summaries)
    }
}

/// Difference between two listings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<DeviceSummary>,
    /// Identifiers of devices that disappeared
    pub removed: Vec<String>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Remembers the last listing and reports what changed
#[derive(Debug, Default)]
pub struct SnapshotTracker {
    filters: Vec<DeviceFilter>,
    known: HashMap<String, DeviceSummary>,
}

impl SnapshotTracker {
    /// An empty filter list accepts every device
    pub fn new(filters: Vec<DeviceFilter>) -> Self {
        Self {
            filters,
            known: HashMap::new(),
        }
    }

    pub fn known(&self) -> usize {
        self.known.len()
    }

    pub fn update(&mut self, current: Vec<DeviceSummary>) -> SnapshotDiff {
        let current: HashMap<String, DeviceSummary> = current
            .into_iter()
            .filter(|d| DeviceFilter::any_match(&self.filters, d.vendor_id, d.product_id))
            .map(|d| (d.identifier.clone(), d))
            .collect();

        let mut diff = SnapshotDiff::default();
        for identifier in self.known.keys() {
            if !current.contains_key(identifier) {
                diff.removed.push(identifier.clone());
            }
        }
        for (identifier, device) in &current {
            if !self.known.contains_key(identifier) {
                diff.added.push(device.clone());
            }
        }
        diff.removed.sort();
        diff.added.sort_by(|a, b| a.identifier.cmp(&b.identifier));

        self.known = current;
        diff
    }
}

/// Handle to the enumeration thread; stops it on drop
pub struct DeviceEnumerator {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceEnumerator {
    pub fn spawn<S: DeviceSource>(
        source: S,
        interval: Duration,
        filters: Vec<DeviceFilter>,
        sender: EventSender,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name("usb-enumerator".to_string())
            .spawn(move || run_enumerator(source, interval, SnapshotTracker::new(filters), sender, &flag))?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Enumerator thread panicked");
            }
        }
    }
}

impl Drop for DeviceEnumerator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_enumerator<S: DeviceSource>(
    mut source: S,
    interval: Duration,
    mut tracker: SnapshotTracker,
    sender: EventSender,
    shutdown: &AtomicBool,
) {
    info!("Device enumerator started (interval {:?})", interval);

    'outer: while !shutdown.load(Ordering::Acquire) {
        match source.list_devices() {
            Ok(devices) => {
                let diff = tracker.update(devices);
                if !diff.is_empty() {
                    debug!(
                        "Enumeration: {} added, {} removed, {} known",
                        diff.added.len(),
                        diff.removed.len(),
                        tracker.known()
                    );
                }
                for identifier in diff.removed {
                    info!("Device removed: {}", identifier);
                    if sender.send_event(DeviceEvent::Removed { identifier }).is_err() {
                        break 'outer;
                    }
                }
                for device in diff.added {
                    info!("Device added: {}", device.identifier);
                    if sender.send_event(DeviceEvent::Added { device }).is_err() {
                        break 'outer;
                    }
                }
            }
            Err(e) => warn!("Failed to list USB devices: {}", e),
        }

        let deadline = Instant::now() + interval;
        while Instant::now() < deadline {
            if shutdown.load(Ordering::Acquire) || sender.is_closed() {
                break 'outer;
            }
            std::thread::sleep(Duration::from_millis(10).min(interval));
        }
    }

    info!("Device enumerator stopped");
}
