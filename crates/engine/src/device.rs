//! State shared by a controller and all of its pipes

use crate::callbacks::LifecycleListener;
use crate::state::{LifecycleState, PipeState};
use crate::transport::Transport;
use common::DeathReason;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

pub(crate) struct DeviceCore<T: Transport> {
    pub(crate) transport: Arc<T>,
    pub(crate) state: PipeState,
    listener: Arc<dyn LifecycleListener>,
    label: String,
    packet_interval_us: u64,
    endpoints: Mutex<Vec<u8>>,
}

impl<T: Transport> DeviceCore<T> {
    pub(crate) fn new(
        transport: Arc<T>,
        label: String,
        listener: Arc<dyn LifecycleListener>,
    ) -> Self {
        let packet_interval_us = transport.speed().packet_interval_us();
        Self {
            transport,
            state: PipeState::new(),
            listener,
            label,
            packet_interval_us,
            endpoints: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    /// Microseconds between consecutive packets of one buffer
    pub(crate) fn packet_interval_us(&self) -> u64 {
        self.packet_interval_us
    }

    pub(crate) fn add_endpoint(&self, endpoint: u8) {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(endpoint);
    }

    pub(crate) fn endpoints(&self) -> Vec<u8> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cancel everything in flight on every registered endpoint
    pub(crate) fn abort_all(&self) {
        for endpoint in self.endpoints() {
            if let Err(e) = self.transport.abort(endpoint) {
                warn!(
                    "{}: failed to abort endpoint {:#04x}: {}",
                    self.label, endpoint, e
                );
            }
        }
    }

    /// Account for one finished input transfer
    pub(crate) fn finish_flight(&self) {
        let (before, after) = self.state.end_flight();
        if before.state == LifecycleState::Running && after.state == LifecycleState::Idle {
            info!("{}: no transfers left in flight, pipes idle", self.label);
            self.listener.on_pipe_stopped();
        }
    }

    pub(crate) fn notify_started(&self) {
        info!("{}: pipes running", self.label);
        self.listener.on_pipe_started();
    }

    /// Move to KILLED, abort everything and report `reason`.
    ///
    /// Only the caller that wins the transition reports; later calls return false.
    /// Stopping pipes that were never started is not reported to the listener.
    pub(crate) fn die(&self, reason: DeathReason, operation: &str) -> bool {
        let Some(previous) = self.state.terminate() else {
            return false;
        };

        if reason == DeathReason::Stopped {
            info!("{}: stopping pipes", self.label);
        } else {
            error!("{}: {} failed, device died: {}", self.label, operation, reason);
        }

        self.abort_all();
        if reason == DeathReason::Stopped && previous == LifecycleState::Stopped {
            debug!("{}: pipes were never started", self.label);
        } else {
            self.listener.on_pipe_died(reason);
        }
        true
    }

    /// STOPPED/IDLE/RUNNING -> SLEEP, aborting in-flight transfers
    pub(crate) fn will_sleep(&self) -> bool {
        if !self.state.sleep() {
            return false;
        }
        info!("{}: system sleep, aborting transfers", self.label);
        self.abort_all();
        true
    }

    /// SLEEP -> IDLE, resetting the device
    pub(crate) fn did_wake(&self) -> bool {
        if !self.state.wake() {
            return false;
        }
        info!("{}: system wake, resetting device", self.label);
        if let Err(e) = self.transport.reset_device() {
            error!("{}: device reset after wake failed: {}", self.label, e);
            self.die(DeathReason::NotResponding, "reset_device");
        }
        true
    }
}
