//! Pipe Scenario Tests
//!
//! Drives the controller and its pipes against the mock transport.
//!
//! # Test Scenarios
//! - Timestamp reconstruction and partial drains
//! - Full drains, clock clamping and buffer stealing
//! - The lifecycle state machine, including stall, sleep and fatal errors
//! - Restarts that keep buffered packets and timestamp order
//! - Output, bulk and control passthrough
//! - A completion thread racing the polling thread
//!
//! Run with: `cargo test -p engine --test pipe_scenarios`

use common::{DeathReason, DeviceSpeed, PipeId};
use engine::test_utils::{CollectingHandler, MockTransport, RecordingListener};
use engine::{
    ControlRequest, ControllerSettings, DeviceController, EngineError, LifecycleState,
    OutPipeConfig, PipeConfig, TransferStatus, TransportError,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const EP_IN: u8 = 0x81;
const EP_OUT: u8 = 0x02;
const T0: u64 = 1_000_000;

struct Rig {
    transport: Arc<MockTransport>,
    listener: Arc<RecordingListener>,
    controller: DeviceController<MockTransport>,
}

fn settings() -> ControllerSettings {
    ControllerSettings {
        stop_timeout: Duration::from_millis(200),
        service_interval: Duration::from_millis(5),
        realtime_cpu: None,
    }
}

fn rig(pool_depth: usize, frames_per_buffer: usize, in_flight: usize) -> Rig {
    let transport = Arc::new(MockTransport::new(DeviceSpeed::High));
    let listener = Arc::new(RecordingListener::default());
    let mut controller =
        DeviceController::new(transport.clone(), "test", listener.clone(), settings());

    let mut config = PipeConfig::new(EP_IN, 64);
    config.pool_depth = pool_depth;
    config.frames_per_buffer = frames_per_buffer;
    config.in_flight = in_flight;
    controller.add_in_pipe(config).expect("Failed to add pipe");
    controller.start_pipes().expect("Failed to start pipes");

    Rig {
        transport,
        listener,
        controller,
    }
}

fn assert_conserved(rig: &Rig) {
    let pipe = rig.controller.in_pipe(PipeId(0)).unwrap();
    assert_eq!(
        pipe.free_len() + pipe.receive_len() + pipe.in_flight(),
        pipe.capacity()
    );
}

// ============================================================================
// Timestamp Reconstruction
// ============================================================================

#[test]
fn test_timestamp_reconstruction() {
    let rig = rig(2, 4, 2);
    let pipe = rig.controller.in_pipe(PipeId(0)).unwrap();

    let a = pipe.acquire().unwrap();
    pipe.submit(a).unwrap();
    let b = pipe.acquire().unwrap();
    pipe.submit(b).unwrap();
    assert_eq!(rig.transport.in_flight_frames(EP_IN), vec![0, 4]);

    assert!(rig.transport.complete_next(EP_IN, TransferStatus::Completed, T0));

    let mut handler = CollectingHandler::default();
    let summary = pipe.poll(T0 + 10_000, &mut handler);

    assert_eq!(summary.delivered, 4);
    assert!(!summary.stolen);
    assert_eq!(handler.timestamps(), vec![T0, T0 + 125, T0 + 250, T0 + 375]);
    assert_eq!(handler.frames(), vec![0, 1, 2, 3]);
    for (i, packet) in handler.packets.iter().enumerate() {
        assert_eq!(packet.data.len(), 64);
        assert_eq!(packet.data[0], i as u8);
        assert_eq!(packet.poll_time, T0 + 10_000);
        assert_eq!(packet.pipe, PipeId(0));
    }

    assert_eq!(pipe.free_len(), 1);
    assert_eq!(pipe.receive_len(), 0);
    assert_eq!(pipe.in_flight(), 1);
    assert_eq!(rig.controller.in_flight(), 1);
}

#[test]
fn test_not_yet_due_packets_stay_queued() {
    let rig = rig(2, 4, 2);
    let pipe = rig.controller.in_pipe(PipeId(0)).unwrap();

    let a = pipe.acquire().unwrap();
    pipe.submit(a).unwrap();
    assert!(rig.transport.complete_next(EP_IN, TransferStatus::Completed, T0));

    let mut handler = CollectingHandler::default();
    let summary = pipe.poll(T0 + 200, &mut handler);
    assert_eq!(summary.delivered, 2);
    assert_eq!(handler.timestamps(), vec![T0, T0 + 125]);
    assert_eq!(pipe.receive_len(), 1);

    let summary = pipe.poll(T0 + 10_000, &mut handler);
    assert_eq!(summary.delivered, 2);
    assert_eq!(handler.frames(), vec![0, 1, 2, 3]);
    assert_eq!(
        handler.timestamps(),
        vec![T0, T0 + 125, T0 + 250, T0 + 375]
    );
    assert_eq!(pipe.stats().out_of_order, 0);
    assert_eq!(pipe.free_len(), 2);
}

#[test]
fn test_watermark_clamps_after_not_yet_due_poll() {
    let rig = rig(2, 4, 2);
    let pipe = rig.controller.in_pipe(PipeId(0)).unwrap();

    let a = pipe.acquire().unwrap();
    pipe.submit(a).unwrap();
    // Hardware reports an arrival time earlier than what was already polled
    let mut handler = CollectingHandler::default();
    pipe.poll(T0 + 1_000, &mut handler);
    assert!(handler.packets.is_empty());

    assert!(rig.transport.complete_next(EP_IN, TransferStatus::Completed, T0));
    pipe.poll(0, &mut handler);

    assert_eq!(
        handler.timestamps(),
        vec![T0 + 1_000, T0 + 1_001, T0 + 1_002, T0 + 1_003]
    );
}

// ============================================================================
// Full Drain and Clamping
// ============================================================================

#[test]
fn test_full_drain_delivers_everything_in_order() {
    let rig = rig(3, 4, 3);
    let pipe = rig.controller.in_pipe(PipeId(0)).unwrap();

    for _ in 0..3 {
        let buffer = pipe.acquire().unwrap();
        pipe.submit(buffer).unwrap();
    }
    for i in 0..3 {
        assert!(
            rig.transport
                .complete_next(EP_IN, TransferStatus::Completed, T0 + i * 500)
        );
    }

    let mut handler = CollectingHandler::default();
    let summary = pipe.poll(0, &mut handler);

    assert_eq!(summary.delivered, 12);
    assert_eq!(handler.frames(), (0..12).collect::<Vec<u64>>());
    assert!(handler.timestamps().windows(2).all(|w| w[0] < w[1]));
    assert_eq!(pipe.free_len(), 3);
    assert_eq!(pipe.receive_len(), 0);
    assert_eq!(pipe.stats().delivered_bytes, 12 * 64);
}

#[test]
fn test_repeated_hardware_timestamps_are_clamped() {
    let rig = rig(2, 4, 2);
    let pipe = rig.controller.in_pipe(PipeId(0)).unwrap();

    for _ in 0..2 {
        let buffer = pipe.acquire().unwrap();
        pipe.submit(buffer).unwrap();
    }
    assert!(rig.transport.complete_next(EP_IN, TransferStatus::Completed, T0));
    assert!(rig.transport.complete_next(EP_IN, TransferStatus::Completed, T0));

    let mut handler = CollectingHandler::default();
    pipe.poll(0, &mut handler);

    assert_eq!(
        handler.timestamps(),
        vec![
            T0,
            T0 + 125,
            T0 + 250,
            T0 + 375,
            T0 + 376,
            T0 + 377,
            T0 + 378,
            T0 + 379
        ]
    );
}

#[test]
fn test_empty_and_failed_packets_are_skipped() {
    let rig = rig(2, 4, 2);
    let pipe = rig.controller.in_pipe(PipeId(0)).unwrap();

    let buffer = pipe.acquire().unwrap();
    pipe.submit(buffer).unwrap();
    assert!(
        rig.transport
            .complete_next_with(EP_IN, TransferStatus::Completed, |buffer| {
                buffer.set_arrival_time(T0);
                let packets = buffer.packets_mut();
                packets[0].actual_length = 10;
                packets[0].status = engine::PacketStatus::Completed;
                packets[1].actual_length = 0;
                packets[1].status = engine::PacketStatus::Completed;
                packets[2].actual_length = 64;
                packets[2].status = engine::PacketStatus::Error;
                packets[3].actual_length = 20;
                packets[3].status = engine::PacketStatus::Underrun;
            })
    );

    let mut handler = CollectingHandler::default();
    let summary = pipe.poll(0, &mut handler);

    assert_eq!(summary.delivered, 2);
    assert_eq!(handler.frames(), vec![0, 3]);
    assert_eq!(handler.packets[0].data.len(), 10);
    assert_eq!(handler.packets[1].data.len(), 20);
    assert_eq!(pipe.stats().packet_errors, 1);
    assert_eq!(pipe.free_len(), 2);
}

// ============================================================================
// Buffer Stealing
// ============================================================================

#[test]
fn test_starvation_steals_oldest_and_suppresses_one_check() {
    let rig = rig(3, 4, 3);
    let pipe = rig.controller.in_pipe(PipeId(0)).unwrap();

    for _ in 0..3 {
        let buffer = pipe.acquire().unwrap();
        pipe.submit(buffer).unwrap();
    }
    assert!(rig.transport.complete_next(EP_IN, TransferStatus::Completed, T0));
    assert!(
        rig.transport
            .complete_next(EP_IN, TransferStatus::Completed, T0 + 500)
    );
    assert_eq!(pipe.free_len(), 0);
    assert_eq!(pipe.receive_ids(), vec![0, 1]);

    let stolen = pipe.acquire().unwrap();
    assert_eq!(stolen.id(), 0);
    assert_eq!(pipe.stats().steals, 1);
    pipe.submit(stolen).unwrap();
    assert_eq!(rig.transport.in_flight_frames(EP_IN), vec![8, 12]);
    assert_conserved(&rig);

    // Frame 4 arrives where frame 0 was expected; the steal explains it
    let mut handler = CollectingHandler::default();
    let summary = pipe.poll(0, &mut handler);
    assert!(summary.stolen);
    assert_eq!(handler.frames(), vec![4, 5, 6, 7]);
    assert_eq!(pipe.stats().out_of_order, 0);

    // Frame 8 is cancelled, so frame 12 arrives where 8 was expected
    assert!(rig.transport.complete_next(EP_IN, TransferStatus::Cancelled, 0));
    assert!(
        rig.transport
            .complete_next(EP_IN, TransferStatus::Completed, T0 + 2_000)
    );
    let summary = pipe.poll(0, &mut handler);
    assert!(!summary.stolen);
    assert_eq!(pipe.stats().out_of_order, 1);
    assert_eq!(&handler.frames()[4..], &[12, 13, 14, 15]);
    assert_conserved(&rig);
}

#[test]
fn test_acquire_fails_only_when_both_queues_empty() {
    let rig = rig(2, 4, 2);
    let pipe = rig.controller.in_pipe(PipeId(0)).unwrap();

    let a = pipe.acquire().unwrap();
    let b = pipe.acquire().unwrap();
    assert!(pipe.acquire().is_none());

    pipe.release(a);
    pipe.release(b);
    assert_eq!(pipe.free_len(), 2);
}

// ============================================================================
// Lifecycle State Machine
// ============================================================================

#[test]
fn test_state_machine_scenario() {
    let rig = rig(2, 4, 2);
    let controller = &rig.controller;
    let mut handler = CollectingHandler::default();
    assert_eq!(controller.state(), LifecycleState::Idle);

    controller.poll(0, &mut handler);
    assert_eq!(controller.state(), LifecycleState::Running);
    assert_eq!(rig.listener.started(), 1);
    assert_eq!(controller.in_flight(), 2);
    assert_eq!(rig.transport.in_flight(EP_IN), 2);

    // Stalls drain the pipeline without killing the device
    assert!(rig.transport.complete_next(EP_IN, TransferStatus::Stall, 0));
    assert!(rig.transport.complete_next(EP_IN, TransferStatus::Stall, 0));
    assert_eq!(controller.state(), LifecycleState::Idle);
    assert_eq!(rig.listener.stopped(), 1);
    assert!(rig.listener.died().is_empty());
    assert!(controller.in_pipe(PipeId(0)).unwrap().is_stalled());

    assert!(controller.system_will_sleep());
    assert_eq!(controller.state(), LifecycleState::Sleep);
    controller.poll(0, &mut handler);
    assert_eq!(controller.state(), LifecycleState::Sleep);

    assert!(controller.system_did_wake());
    assert_eq!(controller.state(), LifecycleState::Idle);
    assert_eq!(rig.transport.reset_count(), 1);

    controller.poll(0, &mut handler);
    assert_eq!(controller.state(), LifecycleState::Running);
    assert_eq!(rig.listener.started(), 2);
    assert_eq!(controller.in_flight(), 2);

    assert!(rig.transport.complete_next(EP_IN, TransferStatus::NoBandwidth, 0));
    assert_eq!(controller.state(), LifecycleState::Killed);
    assert_eq!(rig.listener.died(), vec![DeathReason::NoBandwidth]);
    assert_eq!(rig.transport.in_flight(EP_IN), 0);
    assert_eq!(controller.in_flight(), 0);
    assert_conserved(&rig);

    let submits = rig.transport.submit_count();
    let summary = controller.poll(0, &mut handler);
    assert_eq!(summary.delivered, 0);
    assert_eq!(controller.state(), LifecycleState::Killed);
    assert_eq!(rig.transport.submit_count(), submits);
    assert!(!controller.system_will_sleep());
    assert!(!controller.system_did_wake());

    assert_eq!(rig.listener.started(), 2);
    assert_eq!(rig.listener.stopped(), 1);
    assert_eq!(rig.listener.died().len(), 1);
}

#[test]
fn test_start_after_kill_is_noop() {
    let mut rig = rig(2, 4, 2);
    let mut handler = CollectingHandler::default();
    rig.controller.poll(0, &mut handler);
    assert!(rig.transport.complete_next(EP_IN, TransferStatus::NoDevice, 0));
    assert_eq!(rig.listener.died(), vec![DeathReason::NotResponding]);

    assert!(rig.controller.start_pipes().is_ok());
    assert_eq!(rig.controller.state(), LifecycleState::Killed);
}

#[test]
fn test_start_pipes_twice_is_rejected() {
    let mut rig = rig(2, 4, 2);
    assert!(matches!(
        rig.controller.start_pipes(),
        Err(EngineError::InvalidState(LifecycleState::Idle))
    ));
}

#[test]
fn test_poll_before_start_does_nothing() {
    let transport = Arc::new(MockTransport::new(DeviceSpeed::Full));
    let listener = Arc::new(RecordingListener::default());
    let mut controller =
        DeviceController::new(transport.clone(), "test", listener.clone(), settings());
    controller.add_in_pipe(PipeConfig::new(EP_IN, 64)).unwrap();
    assert_eq!(controller.packet_interval_us(), 1000);

    let mut handler = CollectingHandler::default();
    controller.poll(0, &mut handler);
    assert_eq!(controller.state(), LifecycleState::Stopped);
    assert_eq!(transport.submit_count(), 0);
    assert_eq!(listener.started(), 0);
}

#[test]
fn test_pipes_cannot_be_added_after_start() {
    let mut rig = rig(2, 4, 2);
    let result = rig.controller.add_in_pipe(PipeConfig::new(0x83, 64));
    assert!(matches!(result, Err(EngineError::InvalidState(_))));
}

#[test]
fn test_clear_stall_then_poll_resumes() {
    let rig = rig(2, 4, 2);
    let mut handler = CollectingHandler::default();
    rig.controller.poll(0, &mut handler);

    assert!(rig.transport.complete_next(EP_IN, TransferStatus::Stall, 0));
    assert!(rig.transport.complete_next(EP_IN, TransferStatus::Stall, 0));
    assert_eq!(rig.controller.state(), LifecycleState::Idle);

    rig.controller.clear_stall(PipeId(0)).unwrap();
    assert_eq!(rig.transport.stall_clear_count(), 1);
    assert!(!rig.controller.in_pipe(PipeId(0)).unwrap().is_stalled());

    rig.controller.poll(0, &mut handler);
    assert_eq!(rig.controller.state(), LifecycleState::Running);
    assert_eq!(rig.transport.in_flight_frames(EP_IN), vec![0, 4]);
    assert_eq!(rig.controller.in_pipe(PipeId(0)).unwrap().stats().stalls, 2);
}

#[test]
fn test_restart_keeps_timestamps_increasing() {
    let rig = rig(4, 4, 2);
    let mut handler = CollectingHandler::default();
    rig.controller.poll(0, &mut handler);

    assert!(rig.transport.complete_next(EP_IN, TransferStatus::Completed, 900_000));
    assert_eq!(rig.controller.poll(0, &mut handler).delivered, 4);

    assert!(rig.transport.complete_next(EP_IN, TransferStatus::Stall, 0));
    assert!(rig.transport.complete_next(EP_IN, TransferStatus::Stall, 0));
    rig.controller.clear_stall(PipeId(0)).unwrap();
    rig.controller.poll(0, &mut handler);
    assert_eq!(rig.controller.state(), LifecycleState::Running);

    // The device clock went backwards across the restart
    assert!(rig.transport.complete_next(EP_IN, TransferStatus::Completed, 5));
    assert_eq!(rig.controller.poll(0, &mut handler).delivered, 4);

    let timestamps = handler.timestamps();
    assert_eq!(timestamps.len(), 8);
    assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(timestamps[4], timestamps[3] + 1);
    assert_eq!(handler.frames(), vec![0, 1, 2, 3, 0, 1, 2, 3]);
    assert_conserved(&rig);
}

#[test]
fn test_buffered_packets_survive_stall_restart() {
    let rig = rig(4, 4, 2);
    let mut handler = CollectingHandler::default();
    rig.controller.poll(0, &mut handler);

    assert!(rig.transport.complete_next(EP_IN, TransferStatus::Completed, T0));
    assert!(rig.transport.complete_next(EP_IN, TransferStatus::Stall, 0));
    assert!(rig.transport.complete_next(EP_IN, TransferStatus::Stall, 0));
    assert_eq!(rig.controller.state(), LifecycleState::Idle);
    assert_eq!(rig.controller.in_pipe(PipeId(0)).unwrap().receive_len(), 1);

    rig.controller.clear_stall(PipeId(0)).unwrap();
    let summary = rig.controller.poll(0, &mut handler);

    assert_eq!(summary.delivered, 4);
    assert_eq!(handler.frames(), vec![0, 1, 2, 3]);
    assert_eq!(handler.timestamps()[0], T0);
    assert_eq!(rig.controller.state(), LifecycleState::Running);
    assert_eq!(rig.transport.in_flight_frames(EP_IN), vec![0, 4]);
    assert_conserved(&rig);
}

#[test]
fn test_power_events_before_start() {
    let transport = Arc::new(MockTransport::new(DeviceSpeed::High));
    let listener = Arc::new(RecordingListener::default());
    let mut controller =
        DeviceController::new(transport.clone(), "test", listener.clone(), settings());
    let mut config = PipeConfig::new(EP_IN, 64);
    config.pool_depth = 4;
    config.in_flight = 2;
    controller.add_in_pipe(config).unwrap();

    assert!(controller.system_will_sleep());
    assert!(controller.system_did_wake());
    assert_eq!(controller.state(), LifecycleState::Idle);

    // Nothing is submitted without a service thread
    let mut handler = CollectingHandler::default();
    controller.poll(0, &mut handler);
    assert_eq!(controller.state(), LifecycleState::Idle);
    assert_eq!(transport.submit_count(), 0);

    controller.start_pipes().unwrap();
    assert_eq!(controller.state(), LifecycleState::Idle);
    assert!(matches!(
        controller.start_pipes(),
        Err(EngineError::InvalidState(LifecycleState::Idle))
    ));

    controller.poll(0, &mut handler);
    assert_eq!(controller.state(), LifecycleState::Running);
    assert_eq!(transport.in_flight(EP_IN), 2);
    assert_eq!(listener.started(), 1);
}

#[test]
fn test_sleep_during_resubmit_aborts_new_transfer() {
    let rig = rig(4, 4, 2);
    let mut handler = CollectingHandler::default();
    rig.controller.poll(0, &mut handler);

    let notifier = rig.controller.power_notifier();
    rig.transport
        .before_next_submit(move || assert!(notifier.will_sleep()));
    assert!(rig.transport.complete_next(EP_IN, TransferStatus::Completed, T0));

    assert_eq!(rig.controller.state(), LifecycleState::Sleep);
    assert_eq!(rig.transport.in_flight(EP_IN), 0);
    assert_eq!(rig.controller.in_flight(), 0);
    assert_eq!(rig.controller.in_pipe(PipeId(0)).unwrap().in_flight(), 0);
    assert_eq!(rig.transport.abort_count(), 2);
    assert_eq!(rig.listener.stopped(), 0);
    assert_conserved(&rig);

    assert!(rig.controller.system_did_wake());
    let summary = rig.controller.poll(0, &mut handler);
    assert_eq!(summary.delivered, 4);
    assert_eq!(rig.controller.state(), LifecycleState::Running);
    assert_eq!(rig.transport.in_flight(EP_IN), 2);
    assert_conserved(&rig);
}

#[test]
fn test_completion_resubmits_while_running() {
    let rig = rig(4, 2, 2);
    let mut handler = CollectingHandler::default();
    rig.controller.poll(0, &mut handler);
    assert_eq!(rig.transport.in_flight_frames(EP_IN), vec![0, 2]);

    assert!(rig.transport.complete_next(EP_IN, TransferStatus::Completed, T0));
    assert_eq!(rig.transport.in_flight_frames(EP_IN), vec![2, 4]);
    assert_eq!(rig.controller.in_flight(), 2);
    assert_eq!(rig.controller.state(), LifecycleState::Running);

    let summary = rig.controller.poll(0, &mut handler);
    assert_eq!(summary.delivered, 2);
    assert_conserved(&rig);
}

#[test]
fn test_submit_failure_kills_device() {
    let rig = rig(2, 4, 2);
    rig.transport.fail_next_submit(TransportError::NoBandwidth);

    let mut handler = CollectingHandler::default();
    rig.controller.poll(0, &mut handler);

    assert_eq!(rig.controller.state(), LifecycleState::Killed);
    assert_eq!(rig.listener.died(), vec![DeathReason::NoBandwidth]);
    assert_eq!(rig.listener.started(), 0);
    assert_eq!(rig.listener.stopped(), 0);
    assert_eq!(rig.controller.in_flight(), 0);
    assert_conserved(&rig);
}

#[test]
fn test_failed_wake_reset_kills_device() {
    let rig = rig(2, 4, 2);
    rig.transport.fail_next_reset(TransportError::NoDevice);

    assert!(rig.controller.system_will_sleep());
    assert!(rig.controller.system_did_wake());
    assert_eq!(rig.controller.state(), LifecycleState::Killed);
    assert_eq!(rig.listener.died(), vec![DeathReason::NotResponding]);
}

#[test]
fn test_power_notifier_from_another_thread() {
    let rig = rig(2, 4, 2);
    let notifier = rig.controller.power_notifier();

    let sleeper = notifier.clone();
    thread::spawn(move || assert!(sleeper.will_sleep()))
        .join()
        .unwrap();
    assert_eq!(rig.controller.state(), LifecycleState::Sleep);

    thread::spawn(move || assert!(notifier.did_wake()))
        .join()
        .unwrap();
    assert_eq!(rig.controller.state(), LifecycleState::Idle);
}

#[test]
fn test_stop_pipes_reports_and_unregisters() {
    let mut rig = rig(2, 4, 2);
    let mut handler = CollectingHandler::default();
    rig.controller.poll(0, &mut handler);
    assert_eq!(rig.controller.in_flight(), 2);

    assert!(rig.controller.stop_pipes());
    assert_eq!(rig.controller.state(), LifecycleState::Killed);
    assert_eq!(rig.listener.died(), vec![DeathReason::Stopped]);
    assert_eq!(rig.controller.in_flight(), 0);
    assert_eq!(rig.transport.unregistered(), vec![EP_IN]);
    assert!(!rig.transport.is_registered(EP_IN));

    // Second stop is a no-op
    assert!(rig.controller.stop_pipes());
    assert_eq!(rig.listener.died().len(), 1);
}

#[test]
fn test_drop_stops_pipes() {
    let rig = rig(2, 4, 2);
    let Rig {
        transport,
        listener,
        controller,
    } = rig;
    drop(controller);

    assert_eq!(listener.died(), vec![DeathReason::Stopped]);
    assert_eq!(transport.unregistered(), vec![EP_IN]);
}

#[test]
fn test_drop_before_start_reports_nothing() {
    let transport = Arc::new(MockTransport::new(DeviceSpeed::High));
    let listener = Arc::new(RecordingListener::default());
    let mut controller =
        DeviceController::new(transport.clone(), "test", listener.clone(), settings());
    controller.add_in_pipe(PipeConfig::new(EP_IN, 64)).unwrap();
    drop(controller);

    assert!(listener.died().is_empty());
    assert_eq!(listener.started(), 0);
    assert_eq!(transport.unregistered(), vec![EP_IN]);
}

#[test]
fn test_stuck_stop_keeps_endpoints_registered() {
    let Rig {
        transport,
        listener,
        mut controller,
    } = rig(2, 4, 2);
    let mut handler = CollectingHandler::default();
    controller.poll(0, &mut handler);
    transport.hold_aborts(true);

    assert!(!controller.stop_pipes());
    assert_eq!(controller.state(), LifecycleState::Killed);
    assert_eq!(listener.died(), vec![DeathReason::Stopped]);
    assert_eq!(transport.in_flight(EP_IN), 2);
    assert!(transport.is_registered(EP_IN));
    assert!(transport.unregistered().is_empty());

    // The registered sink still owns the device, and through it the transport
    drop(controller);
    assert!(Arc::strong_count(&transport) > 1);
    assert!(transport.is_registered(EP_IN));
}

// ============================================================================
// Output Pipe
// ============================================================================

fn output_rig(pool_depth: usize) -> Rig {
    let transport = Arc::new(MockTransport::new(DeviceSpeed::High));
    let listener = Arc::new(RecordingListener::default());
    let mut controller =
        DeviceController::new(transport.clone(), "test", listener.clone(), settings());

    let mut config = OutPipeConfig::new(EP_OUT, 16);
    config.frames_per_buffer = 2;
    config.pool_depth = pool_depth;
    controller.add_out_pipe(config).unwrap();
    controller.start_pipes().unwrap();

    Rig {
        transport,
        listener,
        controller,
    }
}

#[test]
fn test_write_submits_and_spans_buffers() {
    let rig = output_rig(3);
    {
        let mut writer = rig.controller.writer().unwrap();
        assert_eq!(writer.write(&[7u8; 40]).unwrap(), 40);
    }

    let out = rig.controller.out_pipe().unwrap();
    assert_eq!(out.in_flight(), 2);
    assert_eq!(out.free_len(), 1);
    assert_eq!(rig.transport.in_flight_lengths(EP_OUT), Some(vec![16, 16]));

    assert!(rig.transport.complete_next(EP_OUT, TransferStatus::Completed, 0));
    assert_eq!(rig.transport.in_flight_lengths(EP_OUT), Some(vec![8, 0]));
    assert!(rig.transport.complete_next(EP_OUT, TransferStatus::Completed, 0));
    assert_eq!(out.free_len(), 3);
    // Output transfers do not touch the device-wide count
    assert_eq!(rig.controller.in_flight(), 0);
    assert_eq!(rig.controller.state(), LifecycleState::Idle);
}

#[test]
fn test_advance_submits_dirty_buffer_early() {
    let rig = output_rig(2);
    let mut writer = rig.controller.writer().unwrap();

    writer.remaining_mut().unwrap()[..3].copy_from_slice(&[1, 2, 3]);
    assert!(writer.is_dirty());
    writer.advance(3).unwrap();
    assert!(!writer.is_dirty());
    assert_eq!(rig.transport.in_flight_lengths(EP_OUT), Some(vec![3, 0]));
    assert_eq!(writer.remaining(), 32);
}

#[test]
fn test_clean_cursor_moves_and_returns_buffer_on_drop() {
    let rig = output_rig(2);
    {
        let mut writer = rig.controller.writer().unwrap();
        writer.advance(5).unwrap();
        assert_eq!(writer.remaining(), 27);
    }

    assert_eq!(rig.transport.in_flight(EP_OUT), 0);
    assert_eq!(rig.controller.out_pipe().unwrap().free_len(), 2);
}

#[test]
fn test_dirty_cursor_submits_on_drop() {
    let rig = output_rig(2);
    {
        let mut writer = rig.controller.writer().unwrap();
        writer.advance(4).unwrap();
        writer.remaining_mut().unwrap()[0] = 9;
    }

    assert_eq!(rig.transport.in_flight_lengths(EP_OUT), Some(vec![4, 0]));
}

#[test]
fn test_writer_requires_started_device() {
    let transport = Arc::new(MockTransport::new(DeviceSpeed::High));
    let mut controller = DeviceController::new(
        transport.clone(),
        "test",
        Arc::new(RecordingListener::default()),
        settings(),
    );
    controller.add_out_pipe(OutPipeConfig::new(EP_OUT, 16)).unwrap();

    let mut writer = controller.writer().unwrap();
    let result = writer.write(&[1, 2, 3]);
    assert!(matches!(
        result,
        Err(EngineError::InvalidState(LifecycleState::Stopped))
    ));
    assert_eq!(transport.in_flight(EP_OUT), 0);
}

#[test]
fn test_output_pool_exhaustion() {
    let rig = output_rig(1);
    let mut writer = rig.controller.writer().unwrap();
    assert!(matches!(
        rig.controller.out_pipe().unwrap().writer(),
        Err(EngineError::PoolExhausted(EP_OUT))
    ));
    writer.remaining_mut().unwrap()[0] = 1;
    assert!(matches!(
        writer.advance(1),
        Err(EngineError::PoolExhausted(EP_OUT))
    ));
}

// ============================================================================
// Bulk and Control Passthrough
// ============================================================================

#[test]
fn test_bulk_read_and_write() {
    let rig = rig(2, 4, 2);
    rig.transport.push_bulk_in(&[1, 2, 3, 4]);

    let reader = rig.controller.bulk_pipe(0x83);
    let mut buf = [0u8; 16];
    assert_eq!(reader.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], &[1, 2, 3, 4]);
    assert!(matches!(
        reader.read(&mut buf),
        Err(EngineError::Transport(TransportError::Timeout))
    ));
    assert!(reader.write(&[1]).is_err());

    let writer = rig
        .controller
        .bulk_pipe(0x03)
        .with_timeout(Duration::from_millis(50));
    assert_eq!(writer.timeout(), Duration::from_millis(50));
    assert_eq!(writer.write(&[9, 8]).unwrap(), 2);
    assert_eq!(rig.transport.bulk_written(), vec![(0x03, vec![9, 8])]);
    assert!(writer.read(&mut buf).is_err());
}

#[test]
fn test_control_passthrough() {
    let rig = rig(2, 4, 2);
    let request = ControlRequest {
        request_type: 0xc0,
        request: 0x01,
        value: 0,
        index: 0,
    };

    rig.transport.push_control_in(&[0xaa, 0xbb]);
    let mut buf = [0u8; 8];
    assert_eq!(rig.controller.control_in(request, &mut buf).unwrap(), 2);
    assert_eq!(&buf[..2], &[0xaa, 0xbb]);

    let request = ControlRequest {
        request_type: 0x40,
        ..request
    };
    assert_eq!(rig.controller.control_out(request, &[5, 6, 7]).unwrap(), 3);
    assert_eq!(rig.transport.control_written(), vec![(request, vec![5, 6, 7])]);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_completion_and_poll() {
    const COMPLETIONS: usize = 500;

    let rig = rig(6, 4, 3);
    let mut handler = CollectingHandler::default();
    rig.controller.poll(0, &mut handler);
    assert_eq!(rig.controller.state(), LifecycleState::Running);

    let done = Arc::new(AtomicBool::new(false));
    let completer = {
        let transport = Arc::clone(&rig.transport);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut completed = 0;
            while completed < COMPLETIONS {
                if transport.complete_next(
                    EP_IN,
                    TransferStatus::Completed,
                    engine::clock::now_micros(),
                ) {
                    completed += 1;
                } else {
                    thread::yield_now();
                }
            }
            done.store(true, Ordering::Release);
        })
    };

    let deadline = Instant::now() + Duration::from_secs(10);
    while !done.load(Ordering::Acquire) && Instant::now() < deadline {
        rig.controller.poll(0, &mut handler);
    }
    completer.join().expect("Completer thread panicked");
    rig.controller.poll(0, &mut handler);

    let pipe = rig.controller.in_pipe(PipeId(0)).unwrap();
    let stats = pipe.stats();
    assert_eq!(stats.completed, COMPLETIONS as u64);
    assert_eq!(
        stats.delivered_packets,
        handler.packets.len() as u64
    );
    assert!(handler.timestamps().windows(2).all(|w| w[0] < w[1]));
    assert_eq!(rig.controller.state(), LifecycleState::Running);
    assert_eq!(pipe.in_flight(), 3);
    assert_conserved(&rig);
}
