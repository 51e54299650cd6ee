//! libusb transport
//!
//! Isochronous transfers go through the raw libusb asynchronous API that
//! rusb re-exports as `rusb::ffi`; bulk, control, stall and reset requests
//! use rusb's safe synchronous wrappers.
//!
//! Each registered endpoint owns a fixed set of native transfers, one per
//! buffer the pipe can have in flight. A submission parks the
//! [`TransferBuffer`] inside its native transfer's slot and hands the slot to
//! libusb as `user_data`; the completion callback takes it back, copies the
//! per-packet results into the buffer and returns the slot to the idle list
//! before passing the buffer to the endpoint's [`CompletionSink`].
//!
//! Completions run on whichever thread calls `handle_events`, which is the
//! controller's service thread.

use crate::buffer::{PacketStatus, TransferBuffer, TransferStatus};
use crate::clock;
use crate::error::{EngineError, TransportError, map_rusb_error};
use crate::transport::{CompletionSink, ControlRequest, EndpointShape, SubmitError, Transport};
use common::{DeviceSpeed, DeviceSummary};
use rusb::constants::*;
use rusb::ffi::{
    libusb_alloc_transfer, libusb_cancel_transfer, libusb_device_handle, libusb_free_transfer,
    libusb_iso_packet_descriptor, libusb_submit_transfer, libusb_transfer,
};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::collections::{HashMap, HashSet};
use std::ffi::{c_int, c_uint, c_void};
use std::ptr::{NonNull, addr_of_mut};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Map rusb device speed to DeviceSpeed
pub fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

/// Map a negative libusb return code
fn map_libusb_error(code: c_int) -> TransportError {
    match code {
        LIBUSB_ERROR_IO => TransportError::Io,
        LIBUSB_ERROR_INVALID_PARAM => TransportError::InvalidParam,
        LIBUSB_ERROR_ACCESS => TransportError::Access,
        LIBUSB_ERROR_NO_DEVICE => TransportError::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => TransportError::NotFound,
        LIBUSB_ERROR_BUSY => TransportError::Busy,
        LIBUSB_ERROR_TIMEOUT => TransportError::Timeout,
        LIBUSB_ERROR_OVERFLOW => TransportError::Overflow,
        LIBUSB_ERROR_PIPE => TransportError::Stall,
        LIBUSB_ERROR_INTERRUPTED => TransportError::Interrupted,
        LIBUSB_ERROR_NO_MEM => TransportError::NoMemory,
        LIBUSB_ERROR_NOT_SUPPORTED => TransportError::NotSupported,
        _ => TransportError::Other,
    }
}

fn map_transfer_status(status: c_int) -> TransferStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overrun,
        _ => TransferStatus::Error,
    }
}

fn map_packet_status(status: c_int, length: usize, actual_length: usize) -> PacketStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED if actual_length < length => PacketStatus::Underrun,
        LIBUSB_TRANSFER_COMPLETED => PacketStatus::Completed,
        LIBUSB_TRANSFER_OVERFLOW => PacketStatus::Overrun,
        _ => PacketStatus::Error,
    }
}

/// Pointer to the packet descriptor array trailing a native transfer
///
/// # Safety
/// `transfer` must have been allocated with at least `index + 1` packets.
unsafe fn iso_descriptor(
    transfer: *mut libusb_transfer,
    index: usize,
) -> *mut libusb_iso_packet_descriptor {
    unsafe { (addr_of_mut!((*transfer).iso_packet_desc) as *mut libusb_iso_packet_descriptor).add(index) }
}

struct RawHandle(NonNull<libusb_device_handle>);

// SAFETY: libusb device handles may be used from any thread; the pointer
// stays valid for as long as the owning DeviceHandle, which outlives it.
unsafe impl Send for RawHandle {}
unsafe impl Sync for RawHandle {}

/// One native transfer and the buffer it is currently carrying
struct Slot {
    native: NonNull<libusb_transfer>,
    buffer: Option<TransferBuffer>,
    binding: Weak<EndpointBinding>,
}

// SAFETY: a slot is owned either by its binding's idle list or, while
// submitted, by libusb through `user_data`; never by two threads at once.
unsafe impl Send for Slot {}

impl Drop for Slot {
    fn drop(&mut self) {
        // SAFETY: allocated by libusb_alloc_transfer and not in flight,
        // since in-flight slots are owned by libusb rather than dropped.
        unsafe { libusb_free_transfer(self.native.as_ptr()) };
    }
}

struct EndpointBinding {
    endpoint: u8,
    frames: usize,
    packet_interval_us: u64,
    sink: Arc<dyn CompletionSink>,
    idle: Mutex<Vec<Box<Slot>>>,
    /// Addresses of submitted native transfers
    active: Mutex<HashSet<usize>>,
}

impl EndpointBinding {
    fn new(
        shape: EndpointShape,
        packet_interval_us: u64,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<Arc<Self>, TransportError> {
        let packets = c_int::try_from(shape.frames_per_buffer)
            .map_err(|_| TransportError::InvalidParam)?;

        let mut natives = Vec::with_capacity(shape.pool_depth);
        for _ in 0..shape.pool_depth {
            // SAFETY: plain allocation; freed by Slot::drop
            let native = unsafe { libusb_alloc_transfer(packets) };
            match NonNull::new(native) {
                Some(native) => natives.push(native),
                None => {
                    for native in natives {
                        // SAFETY: allocated above and never submitted
                        unsafe { libusb_free_transfer(native.as_ptr()) };
                    }
                    return Err(TransportError::NoMemory);
                }
            }
        }

        Ok(Arc::new_cyclic(|binding| {
            let idle = natives
                .into_iter()
                .map(|native| {
                    Box::new(Slot {
                        native,
                        buffer: None,
                        binding: binding.clone(),
                    })
                })
                .collect();
            Self {
                endpoint: shape.endpoint,
                frames: shape.frames_per_buffer,
                packet_interval_us,
                sink,
                idle: Mutex::new(idle),
                active: Mutex::new(HashSet::new()),
            }
        }))
    }

    fn pop_idle(&self) -> Option<Box<Slot>> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    fn push_idle(&self, slot: Box<Slot>) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(slot);
    }

    fn activate(&self, native: NonNull<libusb_transfer>) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(native.as_ptr() as usize);
    }

    fn deactivate(&self, native: NonNull<libusb_transfer>) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(native.as_ptr() as usize));
    }
}

extern "system" fn iso_transfer_complete(transfer: *mut libusb_transfer) {
    if transfer.is_null() {
        return;
    }

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        // SAFETY: transfer is not NULL and libusb is done with it
        let user_data = unsafe { (*transfer).user_data };
        if user_data.is_null() {
            return;
        }
        // SAFETY: user_data is the Box<Slot> leaked in submit_iso
        let slot = unsafe { Box::from_raw(user_data as *mut Slot) };
        finish_transfer(transfer, slot);
    }));

    if let Err(e) = result {
        error!("Panic in isochronous completion: {:?}", e);
    }
}

fn finish_transfer(transfer: *mut libusb_transfer, mut slot: Box<Slot>) {
    let Some(mut buffer) = slot.buffer.take() else {
        return;
    };
    let Some(binding) = slot.binding.upgrade() else {
        // Endpoint was unregistered; the slot frees its transfer on drop
        return;
    };

    // SAFETY: transfer is complete and was allocated with `binding.frames` packets
    let status = unsafe { (*transfer).status };
    for (index, packet) in buffer.packets_mut().iter_mut().enumerate().take(binding.frames) {
        let desc = unsafe { &*iso_descriptor(transfer, index) };
        packet.actual_length = desc.actual_length as usize;
        packet.status = map_packet_status(desc.status, packet.length, packet.actual_length);
    }

    let span = binding.packet_interval_us * buffer.frames().saturating_sub(1) as u64;
    buffer.set_arrival_time(clock::now_micros().saturating_sub(span).max(1));

    let status = map_transfer_status(status);
    trace!(
        "Isochronous transfer on {:#04x} finished: {:?}",
        binding.endpoint, status
    );

    binding.deactivate(slot.native);
    binding.push_idle(slot);
    binding.sink.on_completion(buffer, status);
}

/// [`Transport`] over a claimed libusb device handle
pub struct LibusbTransport {
    context: Context,
    handle: Mutex<DeviceHandle<Context>>,
    raw: RawHandle,
    interface: u8,
    speed: DeviceSpeed,
    identifier: String,
    endpoints: RwLock<HashMap<u8, Arc<EndpointBinding>>>,
}

impl LibusbTransport {
    /// Open the device whose identifier (see [`DeviceSummary::make_identifier`])
    /// is `identifier` and claim `interface` with `alt_setting`
    pub fn open(
        context: &Context,
        identifier: &str,
        interface: u8,
        alt_setting: u8,
    ) -> Result<Self, EngineError> {
        for device in context.devices()?.iter() {
            if device_identifier(&device).as_deref() == Some(identifier) {
                return Self::claim(context, device, identifier.to_string(), interface, alt_setting);
            }
        }
        Err(EngineError::DeviceNotFound(identifier.to_string()))
    }

    /// Open the first device matching `vendor_id:product_id`
    pub fn open_by_ids(
        context: &Context,
        vendor_id: u16,
        product_id: u16,
        interface: u8,
        alt_setting: u8,
    ) -> Result<Self, EngineError> {
        for device in context.devices()?.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if descriptor.vendor_id() == vendor_id && descriptor.product_id() == product_id {
                let identifier = device_identifier(&device)
                    .unwrap_or_else(|| format!("{:04x}:{:04x}", vendor_id, product_id));
                return Self::claim(context, device, identifier, interface, alt_setting);
            }
        }
        Err(EngineError::DeviceNotFound(format!(
            "{:04x}:{:04x}",
            vendor_id, product_id
        )))
    }

    fn claim(
        context: &Context,
        device: Device<Context>,
        identifier: String,
        interface: u8,
        alt_setting: u8,
    ) -> Result<Self, EngineError> {
        let handle = device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", identifier, e);
            e
        })?;

        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {} on {}",
                    interface, identifier
                );
                if let Err(e) = handle.detach_kernel_driver(interface) {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    );
                }
            }
            Ok(false) => debug!("No kernel driver active on interface {}", interface),
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        handle.claim_interface(interface).map_err(|e| {
            warn!("Failed to claim interface {}: {}", interface, e);
            e
        })?;
        if alt_setting != 0 {
            handle.set_alternate_setting(interface, alt_setting)?;
        }

        let raw = NonNull::new(handle.as_raw()).ok_or(EngineError::Transport(TransportError::NoDevice))?;
        let speed = map_device_speed(device.speed());
        info!(
            "Opened {} (interface {}, alt {}, {:?} speed)",
            identifier, interface, alt_setting, speed
        );

        Ok(Self {
            context: context.clone(),
            handle: Mutex::new(handle),
            raw: RawHandle(raw),
            interface,
            speed,
            identifier,
            endpoints: RwLock::new(HashMap::new()),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    fn handle(&self) -> std::sync::MutexGuard<'_, DeviceHandle<Context>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn binding(&self, endpoint: u8) -> Option<Arc<EndpointBinding>> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&endpoint)
            .cloned()
    }
}

/// Stable identifier for a device, or None if its ports cannot be read
pub(crate) fn device_identifier(device: &Device<Context>) -> Option<String> {
    let descriptor = device.device_descriptor().ok()?;
    let ports = device.port_numbers().ok()?;
    Some(DeviceSummary::make_identifier(
        descriptor.vendor_id(),
        descriptor.product_id(),
        device.bus_number(),
        &ports,
    ))
}

impl Transport for LibusbTransport {
    fn speed(&self) -> DeviceSpeed {
        self.speed
    }

    fn register_endpoint(
        &self,
        shape: EndpointShape,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<(), TransportError> {
        let mut endpoints = self
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if endpoints.contains_key(&shape.endpoint) {
            return Err(TransportError::Busy);
        }
        let binding = EndpointBinding::new(shape, self.speed.packet_interval_us(), sink)?;
        endpoints.insert(shape.endpoint, binding);
        debug!(
            "{}: registered endpoint {:#04x} with {} native transfers",
            self.identifier, shape.endpoint, shape.pool_depth
        );
        Ok(())
    }

    fn unregister_endpoint(&self, endpoint: u8) {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&endpoint);
    }

    fn submit_iso(&self, endpoint: u8, mut buffer: TransferBuffer) -> Result<(), SubmitError> {
        let Some(binding) = self.binding(endpoint) else {
            return Err(SubmitError {
                buffer,
                error: TransportError::NotFound,
            });
        };
        if buffer.frames() != binding.frames {
            return Err(SubmitError {
                buffer,
                error: TransportError::InvalidParam,
            });
        }
        let (Ok(length), Ok(packets)) = (
            c_int::try_from(buffer.capacity()),
            c_int::try_from(buffer.frames()),
        ) else {
            return Err(SubmitError {
                buffer,
                error: TransportError::InvalidParam,
            });
        };
        let Some(mut slot) = binding.pop_idle() else {
            return Err(SubmitError {
                buffer,
                error: TransportError::Busy,
            });
        };

        let native = slot.native;
        let transfer = native.as_ptr();
        let data = buffer.as_mut_ptr();
        // SAFETY: the native transfer is idle, so nothing else touches it.
        // It was allocated with `binding.frames` packet descriptors.
        unsafe {
            (*transfer).dev_handle = self.raw.0.as_ptr();
            (*transfer).flags = 0;
            (*transfer).endpoint = endpoint;
            (*transfer).transfer_type = LIBUSB_TRANSFER_TYPE_ISOCHRONOUS;
            (*transfer).timeout = 0 as c_uint;
            (*transfer).length = length;
            (*transfer).num_iso_packets = packets;
            (*transfer).callback = iso_transfer_complete;
            (*transfer).buffer = data;
            for (index, packet) in buffer.packets().iter().enumerate() {
                let desc = &mut *iso_descriptor(transfer, index);
                desc.length = packet.length as c_uint;
                desc.actual_length = 0;
                desc.status = 0;
            }
        }

        // The buffer's heap storage does not move with the TransferBuffer
        slot.buffer = Some(buffer);
        let user_data = Box::into_raw(slot);
        // SAFETY: see above; user_data is reclaimed exactly once, either
        // below on failure or in iso_transfer_complete
        unsafe { (*transfer).user_data = user_data as *mut c_void };

        binding.activate(native);
        // SAFETY: transfer is fully initialised and its buffer outlives it
        let rc = unsafe { libusb_submit_transfer(transfer) };
        if rc < 0 {
            binding.deactivate(native);
            // SAFETY: libusb rejected the transfer, so the callback will not run
            let mut slot = unsafe { Box::from_raw(user_data) };
            let buffer = slot.buffer.take();
            binding.push_idle(slot);
            let error = map_libusb_error(rc);
            warn!(
                "{}: isochronous submit on {:#04x} failed: {} ({})",
                self.identifier, endpoint, error, rc
            );
            return match buffer {
                Some(buffer) => Err(SubmitError { buffer, error }),
                None => Ok(()),
            };
        }
        Ok(())
    }

    fn abort(&self, endpoint: u8) -> Result<(), TransportError> {
        let binding = self.binding(endpoint).ok_or(TransportError::NotFound)?;
        let active = binding.active.lock().unwrap_or_else(PoisonError::into_inner);
        for &address in active.iter() {
            // SAFETY: active transfers are allocated and owned by libusb
            let rc = unsafe { libusb_cancel_transfer(address as *mut libusb_transfer) };
            if rc < 0 && rc != LIBUSB_ERROR_NOT_FOUND {
                debug!(
                    "{}: cancel on {:#04x} returned {}",
                    self.identifier, endpoint, rc
                );
            }
        }
        debug!(
            "{}: cancelled {} transfers on {:#04x}",
            self.identifier,
            active.len(),
            endpoint
        );
        Ok(())
    }

    fn clear_stall(&self, endpoint: u8) -> Result<(), TransportError> {
        self.handle().clear_halt(endpoint).map_err(map_rusb_error)
    }

    fn reset_device(&self) -> Result<(), TransportError> {
        self.handle().reset().map_err(map_rusb_error)?;
        debug!("{}: device reset", self.identifier);
        Ok(())
    }

    fn service_events(&self, timeout: Duration) -> Result<(), TransportError> {
        self.context
            .handle_events(Some(timeout))
            .map_err(map_rusb_error)
    }

    fn bulk_read(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.handle()
            .read_bulk(endpoint, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn bulk_write(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.handle()
            .write_bulk(endpoint, data, timeout)
            .map_err(map_rusb_error)
    }

    fn control_in(
        &self,
        request: ControlRequest,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.handle()
            .read_control(
                request.request_type,
                request.request,
                request.value,
                request.index,
                buf,
                timeout,
            )
            .map_err(map_rusb_error)
    }

    fn control_out(
        &self,
        request: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.handle()
            .write_control(
                request.request_type,
                request.request,
                request.value,
                request.index,
                data,
                timeout,
            )
            .map_err(map_rusb_error)
    }
}

impl Drop for LibusbTransport {
    fn drop(&mut self) {
        let handle = self.handle();
        if let Err(e) = handle.release_interface(self.interface) {
            warn!("Failed to release interface {}: {}", self.interface, e);
        }
        if let Err(e) = handle.attach_kernel_driver(self.interface) {
            debug!(
                "Could not reattach kernel driver to interface {} (may not have been detached): {}",
                self.interface, e
            );
        }
        debug!("Closed {}", self.identifier);
    }
}
