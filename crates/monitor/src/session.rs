//! One streaming device
//!
//! A session opens the device, starts its pipes and runs a dedicated poll
//! thread that drains packets slightly behind the clock and logs transfer
//! statistics. Lifecycle notifications are forwarded to the Tokio side as
//! [`DeviceEvent`]s.

use crate::config::MonitorConfig;
use anyhow::{Context as _, Result};
use common::{DeathReason, DeviceEvent, DeviceSummary, EventSender};
use engine::backend::LibusbTransport;
use engine::clock::now_micros;
use engine::{DeviceController, IsoPacket, LifecycleListener, LifecycleState, PipeStatsSnapshot};
use rusb::Context;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Forwards controller notifications to the event bridge without blocking
struct ForwardingListener {
    identifier: String,
    sender: EventSender,
}

impl ForwardingListener {
    fn forward(&self, event: DeviceEvent) {
        if let Err(e) = self.sender.try_send_event(event) {
            debug!("Dropped lifecycle event for {}: {}", self.identifier, e);
        }
    }
}

impl LifecycleListener for ForwardingListener {
    fn on_pipe_started(&self) {
        self.forward(DeviceEvent::PipeStarted {
            identifier: self.identifier.clone(),
        });
    }

    fn on_pipe_stopped(&self) {
        self.forward(DeviceEvent::PipeStopped {
            identifier: self.identifier.clone(),
        });
    }

    fn on_pipe_died(&self, reason: DeathReason) {
        self.forward(DeviceEvent::PipeDied {
            identifier: self.identifier.clone(),
            reason,
        });
    }
}

#[derive(Debug, Clone, Copy)]
struct PollOptions {
    poll_interval: Duration,
    playout_delay_us: u64,
    stats_interval: Option<Duration>,
}

pub struct Session {
    identifier: String,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Session {
    /// Open `device`, start streaming and spawn the poll thread
    pub fn start(
        context: &Context,
        device: &DeviceSummary,
        config: &MonitorConfig,
        sender: EventSender,
    ) -> Result<Self> {
        let identifier = device.identifier.clone();
        let transport = LibusbTransport::open(
            context,
            &identifier,
            config.device.interface,
            config.device.alt_setting,
        )
        .with_context(|| format!("Failed to open {}", identifier))?;

        let listener = Arc::new(ForwardingListener {
            identifier: identifier.clone(),
            sender,
        });
        let mut controller = DeviceController::from_config(
            Arc::new(transport),
            identifier.clone(),
            listener,
            &config.device,
        )
        .with_context(|| format!("Failed to configure {}", identifier))?;
        controller
            .start_pipes()
            .with_context(|| format!("Failed to start pipes on {}", identifier))?;

        let options = PollOptions {
            poll_interval: config.monitor.poll_interval(),
            playout_delay_us: config.monitor.playout_delay_us,
            stats_interval: config.monitor.stats_interval(),
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name(format!("poll-{}", identifier))
            .spawn(move || run_poll_loop(controller, options, &flag))
            .context("Failed to spawn poll thread")?;

        info!("Streaming from {}", identifier);
        Ok(Self {
            identifier,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Stop the poll thread, which tears the controller down
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Poll thread for {} panicked", self.identifier);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

fn run_poll_loop(
    mut controller: DeviceController<LibusbTransport>,
    options: PollOptions,
    shutdown: &AtomicBool,
) {
    let mut last_report = Instant::now();
    let mut baseline: Vec<PipeStatsSnapshot> =
        controller.in_pipes().iter().map(|p| p.stats()).collect();
    let mut polled_bytes = 0usize;

    while !shutdown.load(Ordering::Acquire) {
        if controller.state() == LifecycleState::Killed {
            warn!("{}: device is dead, poll loop exiting", controller.label());
            break;
        }

        let target = now_micros().saturating_sub(options.playout_delay_us);
        controller.poll(target, &mut |packet: IsoPacket<'_>| {
            polled_bytes += packet.data.len();
        });

        if let Some(interval) = options.stats_interval {
            if last_report.elapsed() >= interval {
                report_stats(&controller, &mut baseline, last_report.elapsed(), polled_bytes);
                polled_bytes = 0;
                last_report = Instant::now();
            }
        }

        std::thread::sleep(options.poll_interval);
    }

    if !controller.stop_pipes() {
        warn!(
            "{}: transfers still in flight after stop, endpoints left registered",
            controller.label()
        );
    }
    info!("{}: poll loop stopped", controller.label());
}

fn report_stats(
    controller: &DeviceController<LibusbTransport>,
    baseline: &mut [PipeStatsSnapshot],
    elapsed: Duration,
    polled_bytes: usize,
) {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    for (pipe, earlier) in controller.in_pipes().iter().zip(baseline.iter_mut()) {
        let now = pipe.stats();
        let delta = now.since(earlier);
        info!(
            "{} {} ep {:#04x}: {:.0} pkt/s, {:.1} KiB/s, {} steals, {} starved, {} out of order, {} packet errors",
            controller.label(),
            pipe.id(),
            pipe.endpoint(),
            delta.delivered_packets as f64 / secs,
            delta.delivered_bytes as f64 / 1024.0 / secs,
            delta.steals,
            delta.starved,
            delta.out_of_order,
            delta.packet_errors
        );
        *earlier = now;
    }
    debug!(
        "{}: {} bytes polled, state {:?}, {} transfers in flight",
        controller.label(),
        polled_bytes,
        controller.state(),
        controller.in_flight()
    );
}
