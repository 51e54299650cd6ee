//! Device controller
//!
//! Owns the pipes of one opened device, the lifecycle state word they share
//! and the service thread that dispatches transport events.
//!
//! ```text
//! STOPPED --start_pipes--> IDLE --poll--> RUNNING
//!                           ^                |
//!                           +--in-flight 0---+
//! STOPPED/IDLE/RUNNING --sleep--> SLEEP --wake--> IDLE
//! any non-terminal --stop/fatal error--> KILLED
//! ```

use crate::bulk_pipe::BulkPipe;
use crate::callbacks::{IsoDataHandler, LifecycleListener};
use crate::config::{DeviceConfig, OutPipeConfig, PipeConfig};
use crate::device::DeviceCore;
use crate::error::{EngineError, Result, TransportError};
use crate::in_pipe::{InPipe, PollSummary};
use crate::out_pipe::{OutPipe, WriteCursor};
use crate::state::LifecycleState;
use crate::transport::{CompletionSink, ControlRequest, Transport};
use common::{DeathReason, PipeId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default timeout for control transfers (5 seconds)
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime knobs that are not per-pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub stop_timeout: Duration,
    pub service_interval: Duration,
    pub realtime_cpu: Option<usize>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_millis(500),
            service_interval: Duration::from_millis(100),
            realtime_cpu: None,
        }
    }
}

impl From<&DeviceConfig> for ControllerSettings {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            stop_timeout: config.stop_timeout(),
            service_interval: config.service_interval(),
            realtime_cpu: config.realtime_cpu,
        }
    }
}

struct ServiceThread {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct DeviceController<T: Transport> {
    core: Arc<DeviceCore<T>>,
    settings: ControllerSettings,
    in_pipes: Vec<Arc<InPipe<T>>>,
    out_pipe: Option<Arc<OutPipe<T>>>,
    service: Option<ServiceThread>,
    torn_down: bool,
}

impl<T: Transport> DeviceController<T> {
    pub fn new(
        transport: Arc<T>,
        label: impl Into<String>,
        listener: Arc<dyn LifecycleListener>,
        settings: ControllerSettings,
    ) -> Self {
        let core = Arc::new(DeviceCore::new(transport, label.into(), listener));
        debug!(
            "{}: controller created, packet interval {}us",
            core.label(),
            core.packet_interval_us()
        );
        Self {
            core,
            settings,
            in_pipes: Vec::new(),
            out_pipe: None,
            service: None,
            torn_down: false,
        }
    }

    /// Build a controller with every pipe `config` describes
    pub fn from_config(
        transport: Arc<T>,
        label: impl Into<String>,
        listener: Arc<dyn LifecycleListener>,
        config: &DeviceConfig,
    ) -> Result<Self> {
        config.validate()?;
        let mut controller = Self::new(transport, label, listener, config.into());
        for pipe in &config.in_pipes {
            controller.add_in_pipe(pipe.clone())?;
        }
        if let Some(out) = &config.out_pipe {
            controller.add_out_pipe(out.clone())?;
        }
        Ok(controller)
    }

    pub fn label(&self) -> &str {
        self.core.label()
    }

    pub fn state(&self) -> LifecycleState {
        self.core.state.state()
    }

    /// Input transfers in flight across all pipes
    pub fn in_flight(&self) -> u32 {
        self.core.state.in_flight()
    }

    pub fn packet_interval_us(&self) -> u64 {
        self.core.packet_interval_us()
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.core.transport
    }

    fn require_stopped(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Stopped => Ok(()),
            state => Err(EngineError::InvalidState(state)),
        }
    }

    /// Add an isochronous input pipe. Only allowed before `start_pipes`.
    pub fn add_in_pipe(&mut self, config: PipeConfig) -> Result<PipeId> {
        self.require_stopped()?;
        config.validate()?;
        if self.core.endpoints().contains(&config.endpoint) {
            return Err(EngineError::Config(format!(
                "Endpoint {:#04x} already has a pipe",
                config.endpoint
            )));
        }

        let id = PipeId(self.in_pipes.len());
        let shape = config.shape();
        let pipe = Arc::new(InPipe::new(id, config, Arc::clone(&self.core)));
        let sink: Arc<dyn CompletionSink> = pipe.clone();
        self.core.transport.register_endpoint(shape, sink)?;
        self.core.add_endpoint(shape.endpoint);
        self.in_pipes.push(pipe);

        info!(
            "{}: added {} on endpoint {:#04x}",
            self.label(),
            id,
            shape.endpoint
        );
        Ok(id)
    }

    pub fn add_out_pipe(&mut self, config: OutPipeConfig) -> Result<()> {
        self.require_stopped()?;
        config.validate()?;
        if self.out_pipe.is_some() {
            return Err(EngineError::Config(
                "Device already has an output pipe".to_string(),
            ));
        }
        if self.core.endpoints().contains(&config.endpoint) {
            return Err(EngineError::Config(format!(
                "Endpoint {:#04x} already has a pipe",
                config.endpoint
            )));
        }

        let shape = config.shape();
        let pipe = Arc::new(OutPipe::new(config, Arc::clone(&self.core)));
        let sink: Arc<dyn CompletionSink> = pipe.clone();
        self.core.transport.register_endpoint(shape, sink)?;
        self.core.add_endpoint(shape.endpoint);
        self.out_pipe = Some(pipe);

        info!(
            "{}: added output pipe on endpoint {:#04x}",
            self.label(),
            shape.endpoint
        );
        Ok(())
    }

    pub fn bulk_pipe(&self, endpoint: u8) -> BulkPipe<T> {
        BulkPipe::new(Arc::clone(&self.core.transport), endpoint)
    }

    pub fn in_pipes(&self) -> &[Arc<InPipe<T>>] {
        &self.in_pipes
    }

    pub fn in_pipe(&self, id: PipeId) -> Option<&Arc<InPipe<T>>> {
        self.in_pipes.get(id.0)
    }

    pub fn out_pipe(&self) -> Option<&Arc<OutPipe<T>>> {
        self.out_pipe.as_ref()
    }

    /// Open a write cursor on the output pipe
    pub fn writer(&self) -> Result<WriteCursor<'_, T>> {
        match &self.out_pipe {
            Some(pipe) => pipe.writer(),
            None => Err(EngineError::Config(
                "Device has no output pipe".to_string(),
            )),
        }
    }

    /// STOPPED -> IDLE and start the service thread.
    ///
    /// Nothing is submitted until the first `poll`. A killed device ignores
    /// the call. A device that reached IDLE or SLEEP through power events
    /// before it was started keeps its state and only gains the service
    /// thread.
    pub fn start_pipes(&mut self) -> Result<()> {
        match self.state() {
            LifecycleState::Killed => {
                debug!("{}: start_pipes ignored, device is dead", self.label());
                return Ok(());
            }
            LifecycleState::Stopped => {}
            state if self.service.is_none() => {
                self.service = Some(spawn_service_thread(Arc::clone(&self.core), self.settings)?);
                info!(
                    "{}: pipes started in {:?} after a power event",
                    self.label(),
                    state
                );
                return Ok(());
            }
            state => return Err(EngineError::InvalidState(state)),
        }

        if self.service.is_none() {
            self.service = Some(spawn_service_thread(Arc::clone(&self.core), self.settings)?);
        }

        if !self.core.state.start() {
            // Lost a race with a power event or a fatal error; the service
            // thread is up either way
            debug!(
                "{}: state changed to {:?} while starting pipes",
                self.label(),
                self.state()
            );
            return Ok(());
        }
        info!(
            "{}: pipes started ({} input, output: {})",
            self.label(),
            self.in_pipes.len(),
            self.out_pipe.is_some()
        );
        Ok(())
    }

    /// Deliver due packets from every input pipe.
    ///
    /// An IDLE device first delivers whatever is still buffered, then moves
    /// to RUNNING and refills its pipes. STOPPED, SLEEP and KILLED devices
    /// deliver nothing, and neither does a device whose pipes were never
    /// started.
    pub fn poll<H>(&self, target_time: u64, handler: &mut H) -> PollSummary
    where
        H: IsoDataHandler + ?Sized,
    {
        let state = self.state();
        if !matches!(state, LifecycleState::Idle | LifecycleState::Running) || self.service.is_none()
        {
            return PollSummary::default();
        }

        let mut summary = PollSummary::default();
        for pipe in &self.in_pipes {
            summary.merge(pipe.poll(target_time, handler));
        }
        if state == LifecycleState::Idle {
            self.resume();
        }
        summary
    }

    fn resume(&self) {
        if !self.core.state.begin_running() {
            return;
        }
        for pipe in &self.in_pipes {
            if let Err(e) = pipe.start() {
                debug!("{}: {} failed to start: {}", self.label(), pipe.id(), e);
                return;
            }
        }
        self.core.notify_started();
    }

    /// Clear a stall on input pipe `id`; the next `poll` restarts streaming
    pub fn clear_stall(&self, id: PipeId) -> Result<()> {
        let pipe = self
            .in_pipe(id)
            .ok_or_else(|| EngineError::Config(format!("No input pipe {}", id)))?;
        pipe.clear_stall()
    }

    /// Handle for delivering system power events from another thread
    pub fn power_notifier(&self) -> PowerNotifier<T> {
        PowerNotifier {
            core: Arc::clone(&self.core),
        }
    }

    pub fn system_will_sleep(&self) -> bool {
        self.core.will_sleep()
    }

    pub fn system_did_wake(&self) -> bool {
        self.core.did_wake()
    }

    pub fn control_in(&self, request: ControlRequest, buf: &mut [u8]) -> Result<usize> {
        debug!(
            "Control IN: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, len={}",
            request.request_type,
            request.request,
            request.value,
            request.index,
            buf.len()
        );
        self.core
            .transport
            .control_in(request, buf, CONTROL_TIMEOUT)
            .map_err(|e| {
                warn!("Control IN transfer failed: {}", e);
                e.into()
            })
    }

    pub fn control_out(&self, request: ControlRequest, data: &[u8]) -> Result<usize> {
        debug!(
            "Control OUT: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, len={}",
            request.request_type,
            request.request,
            request.value,
            request.index,
            data.len()
        );
        self.core
            .transport
            .control_out(request, data, CONTROL_TIMEOUT)
            .map_err(|e| {
                warn!("Control OUT transfer failed: {}", e);
                e.into()
            })
    }

    fn output_in_flight(&self) -> usize {
        self.out_pipe.as_ref().map_or(0, |pipe| pipe.in_flight())
    }

    /// Kill the device, wait (bounded) for in-flight transfers to drain and
    /// release the endpoints.
    ///
    /// Returns `true` when everything drained within the stop timeout. When
    /// it did not, the endpoints stay registered: the transport keeps the
    /// pipes' completion sinks, and through them the transport itself, alive
    /// for as long as it may still complete those transfers. That memory is
    /// never reclaimed.
    pub fn stop_pipes(&mut self) -> bool {
        if self.torn_down {
            return true;
        }
        self.torn_down = true;

        self.core.die(DeathReason::Stopped, "stop_pipes");

        let deadline = Instant::now() + self.settings.stop_timeout;
        let mut drained = false;
        loop {
            if self.in_flight() == 0 && self.output_in_flight() == 0 {
                drained = true;
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        if let Some(service) = self.service.take() {
            service.shutdown.store(true, Ordering::Release);
            if service.handle.join().is_err() {
                error!("{}: service thread panicked", self.label());
            }
        }

        if drained {
            for endpoint in self.core.endpoints() {
                self.core.transport.unregister_endpoint(endpoint);
            }
            info!("{}: pipes stopped", self.label());
        } else {
            warn!(
                "{}: {} input and {} output transfers still in flight after {:?}, leaving endpoints registered",
                self.label(),
                self.in_flight(),
                self.output_in_flight(),
                self.settings.stop_timeout
            );
        }
        drained
    }
}

impl<T: Transport> Drop for DeviceController<T> {
    fn drop(&mut self) {
        self.stop_pipes();
    }
}

/// Delivers system sleep/wake to a controller from any thread
pub struct PowerNotifier<T: Transport> {
    core: Arc<DeviceCore<T>>,
}

impl<T: Transport> Clone for PowerNotifier<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Transport> PowerNotifier<T> {
    /// STOPPED/IDLE/RUNNING -> SLEEP, aborting in-flight transfers
    pub fn will_sleep(&self) -> bool {
        self.core.will_sleep()
    }

    /// SLEEP -> IDLE, resetting the device
    pub fn did_wake(&self) -> bool {
        self.core.did_wake()
    }
}

fn spawn_service_thread<T: Transport>(
    core: Arc<DeviceCore<T>>,
    settings: ControllerSettings,
) -> Result<ServiceThread> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    let name = format!("iso-service-{}", core.label());

    let handle = std::thread::Builder::new().name(name).spawn(move || {
        if let Some(cpu) = settings.realtime_cpu {
            match pin_current_thread(cpu) {
                Ok(()) => debug!("{}: service thread pinned to CPU {}", core.label(), cpu),
                Err(e) => warn!("{}: could not pin service thread: {}", core.label(), e),
            }
        }
        run_service_loop(&core, &flag, settings.service_interval);
    })?;

    Ok(ServiceThread { shutdown, handle })
}

fn run_service_loop<T: Transport>(core: &DeviceCore<T>, shutdown: &AtomicBool, interval: Duration) {
    debug!("{}: service thread started", core.label());

    while !shutdown.load(Ordering::Acquire) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            core.transport.service_events(interval)
        }));

        match result {
            Ok(Ok(())) => {}
            Ok(Err(TransportError::Interrupted)) => {
                debug!("{}: event handling interrupted", core.label());
            }
            Ok(Err(TransportError::NoDevice)) => {
                core.die(DeathReason::NotResponding, "service_events");
                // Keep dispatching so cancelled transfers can complete
                std::thread::sleep(interval.min(Duration::from_millis(10)));
            }
            Ok(Err(e)) => {
                warn!("{}: error handling USB events: {}", core.label(), e);
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                error!("{}: panic in event handling: {:?}", core.label(), e);
            }
        }
    }

    debug!("{}: service thread stopped", core.label());
}

#[cfg(target_os = "linux")]
fn pin_current_thread(cpu: usize) -> Result<()> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    set.set(cpu)
        .map_err(|e| EngineError::Config(format!("CPU {} not usable: {}", cpu, e)))?;
    sched_setaffinity(Pid::from_raw(0), &set).map_err(|e| EngineError::Thread(e.into()))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn pin_current_thread(cpu: usize) -> Result<()> {
    Err(EngineError::Config(format!(
        "Thread affinity (CPU {}) is only supported on Linux",
        cpu
    )))
}
