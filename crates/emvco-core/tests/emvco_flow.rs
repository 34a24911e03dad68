//! End-to-end flows: controller + reader + mock transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use emvco_core::protocol::constants::*;
use emvco_core::{
    ChannelListener, ChipState, ControlEvent, ControlListener, ControllerConfig, EmvcoConfig,
    EmvcoController, EmvcoMode, MockTransport, ModeResponse, RejectReason,
};

fn controller_with(
    config: ControllerConfig,
) -> (
    Arc<MockTransport>,
    Arc<EmvcoController<MockTransport>>,
    Receiver<ControlEvent>,
) {
    let mock = Arc::new(MockTransport::new());
    let controller = Arc::new(EmvcoController::spawn(mock.clone(), config).unwrap());
    let (listener, rx) = ChannelListener::channel();
    controller.register_listener(Arc::new(listener));
    (mock, controller, rx)
}

fn drain(rx: &Receiver<ControlEvent>) -> Vec<ControlEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.recv_timeout(Duration::from_millis(50)) {
        events.push(event);
    }
    events
}

#[test]
fn start_with_echoed_ok_becomes_active() {
    let (mock, controller, rx) = controller_with(ControllerConfig::default());
    mock.reply_frame(0x01, 0x01, &[STATUS_OK]);

    assert_eq!(
        controller.start_mode(&EmvcoConfig::default()),
        ModeResponse::Accepted
    );
    assert_eq!(controller.current_mode(), EmvcoMode::Active);
    assert_eq!(mock.written_opcodes(), vec![0x01]);
    assert_eq!(
        drain(&rx),
        vec![ControlEvent::ModeChanged {
            from: EmvcoMode::Idle,
            to: EmvcoMode::Active
        }]
    );
}

#[test]
fn start_without_response_times_out_at_deadline() {
    let config = ControllerConfig {
        exchange_timeout_ms: 500,
        ..Default::default()
    };
    let (_mock, controller, rx) = controller_with(config);

    let started = Instant::now();
    let response = controller.start_mode(&EmvcoConfig::default());
    let elapsed = started.elapsed();

    assert_eq!(
        response,
        ModeResponse::Rejected(RejectReason::TimedOut { timeout_ms: 500 })
    );
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(controller.current_mode(), EmvcoMode::Idle);

    let events = drain(&rx);
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, ControlEvent::ModeChanged { .. }))
    );
    assert!(
        events
            .iter()
            .all(|e| matches!(e, ControlEvent::ModeTransitionFailed { .. }))
    );
}

#[test]
fn unsolicited_chip_state_reaches_listener_only() {
    let (mock, controller, rx) = controller_with(ControllerConfig::default());
    mock.queue_frame(NTF_CHIP_STATE, &[CHIP_STATE_TURNING_OFF]);

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        ControlEvent::ChipStateChanged {
            state: ChipState::TurningOff
        }
    );
    assert_eq!(controller.current_mode(), EmvcoMode::Idle);
}

#[test]
fn chip_state_during_start_does_not_resolve_it() {
    let (mock, controller, rx) = controller_with(ControllerConfig::default());
    let mut reply = Vec::new();
    reply.extend([0x02, NTF_CHIP_STATE, CHIP_STATE_ON]);
    reply.extend([0x02, OP_EMVCO_START, STATUS_OK]);
    mock.reply_to(OP_EMVCO_START, &reply);

    assert!(controller.start_mode(&EmvcoConfig::default()).is_accepted());
    let events = drain(&rx);
    assert!(events.contains(&ControlEvent::ChipStateChanged {
        state: ChipState::On
    }));
    assert!(events.contains(&ControlEvent::ModeChanged {
        from: EmvcoMode::Idle,
        to: EmvcoMode::Active
    }));
}

#[test]
fn racing_starts_accept_exactly_once() {
    let (mock, controller, _rx) = controller_with(ControllerConfig::default());
    mock.reply_frame(OP_EMVCO_START, OP_EMVCO_START, &[STATUS_OK]);

    let callers = 8;
    let barrier = Arc::new(Barrier::new(callers));
    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let controller = controller.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                controller.start_mode(&EmvcoConfig::default())
            })
        })
        .collect();

    let responses: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let accepted = responses.iter().filter(|r| r.is_accepted()).count();
    assert_eq!(accepted, 1);
    for r in responses.iter().filter(|r| !r.is_accepted()) {
        assert!(matches!(
            r,
            ModeResponse::AlreadyActive | ModeResponse::Rejected(RejectReason::Busy)
        ));
    }
    assert_eq!(mock.written_opcodes(), vec![OP_EMVCO_START]);
    assert_eq!(controller.current_mode(), EmvcoMode::Active);
}

#[test]
fn racing_start_and_stop_from_idle() {
    let (mock, controller, _rx) = controller_with(ControllerConfig::default());
    mock.reply_frame(OP_EMVCO_START, OP_EMVCO_START, &[STATUS_OK]);

    let barrier = Arc::new(Barrier::new(2));
    let start = {
        let (controller, barrier) = (controller.clone(), barrier.clone());
        thread::spawn(move || {
            barrier.wait();
            controller.start_mode(&EmvcoConfig::default())
        })
    };
    let stop = {
        let (controller, barrier) = (controller.clone(), barrier.clone());
        thread::spawn(move || {
            barrier.wait();
            controller.stop_mode()
        })
    };

    assert!(start.join().unwrap().is_accepted());
    // Stop either found Idle, found the start in flight, or ran after it
    // and timed out against a controller with no stop reply scripted.
    assert!(matches!(
        stop.join().unwrap(),
        ModeResponse::AlreadyIdle
            | ModeResponse::Rejected(RejectReason::TransitionInProgress(EmvcoMode::Starting))
            | ModeResponse::Rejected(RejectReason::TimedOut { .. })
            | ModeResponse::Rejected(RejectReason::Busy)
    ));
    assert!(controller.current_mode().is_stable());
}

#[test]
fn start_while_ext_command_pending_is_busy() {
    let config = ControllerConfig {
        busy_retries: 0,
        exchange_timeout_ms: 300,
        ..Default::default()
    };
    let (_mock, controller, _rx) = controller_with(config);

    let ext = {
        let controller = controller.clone();
        thread::spawn(move || controller.send_ext_command(0x2F, &[]))
    };
    while !controller.engine().is_pending() {
        thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(
        controller.start_mode(&EmvcoConfig::default()),
        ModeResponse::Rejected(RejectReason::Busy)
    );
    assert_eq!(controller.current_mode(), EmvcoMode::Idle);
    assert!(ext.join().unwrap().is_err());
}

#[test]
fn busy_is_retried_until_channel_frees() {
    let config = ControllerConfig {
        busy_retries: 20,
        busy_backoff_ms: 20,
        exchange_timeout_ms: 200,
        ..Default::default()
    };
    let (mock, controller, _rx) = controller_with(config);
    mock.reply_frame(OP_EMVCO_START, OP_EMVCO_START, &[STATUS_OK]);

    // Hold the channel with an unanswered command, then start.
    let holder = {
        let controller = controller.clone();
        thread::spawn(move || controller.send_ext_command(0x30, &[]))
    };
    while !controller.engine().is_pending() {
        thread::sleep(Duration::from_millis(2));
    }

    assert!(controller.start_mode(&EmvcoConfig::default()).is_accepted());
    assert!(holder.join().unwrap().is_err());
    assert_eq!(controller.current_mode(), EmvcoMode::Active);
}

#[test]
fn reregistering_routes_events_to_newest_listener() {
    let (mock, controller, old_rx) = controller_with(ControllerConfig::default());
    let (listener, new_rx) = ChannelListener::channel();
    assert!(controller.register_listener(Arc::new(listener)));

    mock.reply_frame(OP_EMVCO_START, OP_EMVCO_START, &[STATUS_OK]);
    assert!(controller.start_mode(&EmvcoConfig::default()).is_accepted());

    assert!(drain(&old_rx).is_empty());
    assert_eq!(drain(&new_rx).len(), 1);
}

/// Reads the controller back from inside the callback.
struct ReentrantListener {
    controller: Mutex<Option<Arc<EmvcoController<MockTransport>>>>,
    seen: AtomicUsize,
    modes: Mutex<Vec<EmvcoMode>>,
}

impl ControlListener for ReentrantListener {
    fn on_event(&self, _event: &ControlEvent) {
        self.seen.fetch_add(1, Ordering::SeqCst);
        if let Some(controller) = self.controller.lock().unwrap().as_ref() {
            self.modes.lock().unwrap().push(controller.current_mode());
        }
    }
}

#[test]
fn listener_may_reenter_controller() {
    let mock = Arc::new(MockTransport::new());
    let controller =
        Arc::new(EmvcoController::spawn(mock.clone(), ControllerConfig::default()).unwrap());
    let listener = Arc::new(ReentrantListener {
        controller: Mutex::new(Some(controller.clone())),
        seen: AtomicUsize::new(0),
        modes: Mutex::new(Vec::new()),
    });
    controller.register_listener(listener.clone());

    mock.reply_frame(OP_EMVCO_START, OP_EMVCO_START, &[STATUS_OK]);
    assert!(controller.start_mode(&EmvcoConfig::default()).is_accepted());

    assert_eq!(listener.seen.load(Ordering::SeqCst), 1);
    assert_eq!(*listener.modes.lock().unwrap(), vec![EmvcoMode::Active]);

    // Break the Arc cycle.
    listener.controller.lock().unwrap().take();
}

#[test]
fn disconnect_mid_start_reverts() {
    let (mock, controller, rx) = controller_with(ControllerConfig {
        exchange_timeout_ms: 2000,
        ..Default::default()
    });

    let disconnector = {
        let (controller, mock) = (controller.clone(), mock.clone());
        thread::spawn(move || {
            while !controller.engine().is_pending() {
                thread::sleep(Duration::from_millis(2));
            }
            mock.disconnect();
        })
    };

    let response = controller.start_mode(&EmvcoConfig::default());
    disconnector.join().unwrap();

    assert!(matches!(
        response,
        ModeResponse::Rejected(RejectReason::Transport(_))
    ));
    assert_eq!(controller.current_mode(), EmvcoMode::Idle);
    assert!(drain(&rx).contains(&ControlEvent::TransportLost));
}

/// Sleeps on chip state events, longer than the exchange timeout.
struct SlowListener {
    delay: Duration,
    chip_events: AtomicUsize,
}

impl ControlListener for SlowListener {
    fn on_event(&self, event: &ControlEvent) {
        if matches!(event, ControlEvent::ChipStateChanged { .. }) {
            self.chip_events.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
        }
    }
}

#[test]
fn slow_listener_does_not_delay_split_response() {
    let mock = Arc::new(MockTransport::new());
    let config = ControllerConfig {
        exchange_timeout_ms: 200,
        read_chunk: 3,
        ..Default::default()
    };
    let controller = EmvcoController::spawn(mock.clone(), config).unwrap();
    let listener = Arc::new(SlowListener {
        delay: Duration::from_millis(400),
        chip_events: AtomicUsize::new(0),
    });
    controller.register_listener(listener.clone());

    // Notification and response land in separate reads.
    mock.reply_to(
        OP_EMVCO_START,
        &[0x02, NTF_CHIP_STATE, CHIP_STATE_ON, 0x02, OP_EMVCO_START, STATUS_OK],
    );

    assert_eq!(
        controller.start_mode(&EmvcoConfig::default()),
        ModeResponse::Accepted
    );
    assert_eq!(controller.current_mode(), EmvcoMode::Active);

    for _ in 0..100 {
        if listener.chip_events.load(Ordering::SeqCst) == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(listener.chip_events.load(Ordering::SeqCst), 1);
}

#[test]
fn truncated_notification_does_not_fail_later_commands() {
    let (mock, controller, rx) = controller_with(ControllerConfig {
        exchange_timeout_ms: 200,
        ..Default::default()
    });
    mock.queue_read(&[0x05, NTF_CHIP_STATE]);
    while !mock.reads_drained() {
        thread::sleep(Duration::from_millis(2));
    }
    // Let the reader hand the bytes to the engine.
    thread::sleep(Duration::from_millis(50));

    mock.reply_frame(OP_EMVCO_START, OP_EMVCO_START, &[STATUS_OK]);
    mock.reply_frame(OP_EMVCO_STOP, OP_EMVCO_STOP, &[STATUS_OK]);

    assert!(controller.start_mode(&EmvcoConfig::default()).is_accepted());
    assert!(controller.stop_mode().is_accepted());
    assert_eq!(controller.current_mode(), EmvcoMode::Idle);
    assert_eq!(
        drain(&rx),
        vec![
            ControlEvent::ModeChanged {
                from: EmvcoMode::Idle,
                to: EmvcoMode::Active
            },
            ControlEvent::ModeChanged {
                from: EmvcoMode::Active,
                to: EmvcoMode::Idle
            },
        ]
    );
}
