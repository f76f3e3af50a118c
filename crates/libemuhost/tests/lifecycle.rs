use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use emuhost_protocol::{
    Generation, ModalConfig, ModalOutcome, SessionEvent, SessionSettings, SessionState, Stats,
    Waveform,
};
use libemuhost::{
    Collaborators, ComputeEngine, ControllerConfig, DeviceDiscovery, DeviceHandle, HandoffConfig,
    Latch, ModalNotice, NoHints, RumbleTarget, SessionController, SessionDescriptor, SessionError,
    SurfaceRef, Vibrator, WorkerContext,
};
use tokio::sync::{broadcast, mpsc};

/// Engine whose behavior is picked by the session's content string.
#[derive(Default)]
struct ScriptedEngine {
    frames: Mutex<Vec<(Generation, u64)>>,
    outcomes: Mutex<Vec<ModalOutcome>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    stop_requests: AtomicUsize,
    release: Latch,
}

impl ScriptedEngine {
    fn render(&self, ctx: &WorkerContext) -> Result<(), String> {
        while !ctx.wait_cancelled(Duration::from_millis(2)) {
            if let Some(surface) = ctx.acquire_surface() {
                self.frames
                    .lock()
                    .expect("frames")
                    .push((surface.generation(), surface.id()));
            }
        }
        Ok(())
    }

    fn script(&self, ctx: &WorkerContext) -> Result<(), String> {
        match ctx.content() {
            "crash" => Err("gpu fault".to_string()),
            "panic" => panic!("bad opcode"),
            "finish" => Ok(()),
            "stubborn" => {
                while !self.release.wait_timeout(Duration::from_millis(5)) {}
                Ok(())
            }
            "modal" => {
                let outcome = ctx
                    .request_modal(ModalConfig::Keyboard {
                        header: "Save name".to_string(),
                        initial_text: String::new(),
                        max_length: Some(16),
                        raw: Vec::new(),
                    })
                    .map_err(|err| err.to_string())?;
                self.outcomes.lock().expect("outcomes").push(outcome);
                self.render(ctx)
            }
            "shaders" => {
                ctx.pipeline_loading(3);
                for progress in 1..=3 {
                    ctx.pipeline_progress(progress);
                }
                ctx.pipeline_loaded();
                self.render(ctx)
            }
            "rumble" => {
                ctx.vibrate(0, &Waveform::new(vec![10, 20], vec![255, 0]));
                self.render(ctx)
            }
            _ => self.render(ctx),
        }
    }

    fn frames(&self) -> Vec<(Generation, u64)> {
        self.frames.lock().expect("frames").clone()
    }

    fn outcomes(&self) -> Vec<ModalOutcome> {
        self.outcomes.lock().expect("outcomes").clone()
    }
}

impl ComputeEngine for ScriptedEngine {
    fn run(&self, ctx: WorkerContext) -> Result<(), String> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let result = self.script(&ctx);
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn request_stop(&self, _join: bool) -> bool {
        self.stop_requests.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn set_audio_enabled(&self, _enabled: bool) {}

    fn poll_stats(&self) -> Stats {
        Stats::default()
    }
}

#[derive(Default)]
struct BuiltinRumble {
    played: Mutex<Vec<(String, Waveform)>>,
    cancelled: Mutex<Vec<String>>,
}

impl DeviceDiscovery for BuiltinRumble {
    fn rumble_target(&self, index: u8) -> Option<RumbleTarget> {
        (index == 0).then_some(RumbleTarget::Builtin)
    }

    fn builtin(&self) -> Option<DeviceHandle> {
        Some(DeviceHandle {
            id: "builtin".to_string(),
            builtin: true,
        })
    }

    fn find(&self, _descriptor: &str) -> Option<DeviceHandle> {
        None
    }
}

impl Vibrator for BuiltinRumble {
    fn vibrate(&self, device: &DeviceHandle, waveform: &Waveform) {
        self.played
            .lock()
            .expect("played")
            .push((device.id.clone(), waveform.clone()));
    }

    fn cancel(&self, device: &DeviceHandle) {
        self.cancelled
            .lock()
            .expect("cancelled")
            .push(device.id.clone());
    }
}

struct Harness {
    controller: SessionController,
    engine: Arc<ScriptedEngine>,
    rumble: Arc<BuiltinRumble>,
    notices: mpsc::UnboundedReceiver<ModalNotice>,
    events: broadcast::Receiver<SessionEvent>,
}

impl Harness {
    fn new() -> Self {
        Self::with_stop_timeout(Duration::from_secs(2))
    }

    fn with_stop_timeout(stop_join_timeout: Duration) -> Self {
        let engine = Arc::new(ScriptedEngine::default());
        let rumble = Arc::new(BuiltinRumble::default());
        let (tx, notices) = mpsc::unbounded_channel();
        let controller = SessionController::new(
            Collaborators {
                engine: engine.clone(),
                hints: Arc::new(NoHints),
                presenter: Arc::new(tx),
                discovery: rumble.clone(),
                vibrator: rumble.clone(),
            },
            ControllerConfig {
                stop_join_timeout,
                handoff: HandoffConfig {
                    retract_timeout: Duration::from_millis(500),
                    retract_retry_interval: Duration::from_millis(2),
                },
                ..ControllerConfig::default()
            },
        );
        let events = controller.subscribe();
        Self {
            controller,
            engine,
            rumble,
            notices,
            events,
        }
    }

    fn start(&self, content: &str) -> Generation {
        self.controller
            .start(descriptor(content))
            .expect("start session")
            .generation
    }

    fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn next_modal(&mut self) -> Result<String> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Ok(ModalNotice::Show(request)) = self.notices.try_recv() {
                return Ok(request.id);
            }
            if Instant::now() > deadline {
                bail!("no modal request shown");
            }
            thread::sleep(Duration::from_millis(2));
        }
    }
}

fn descriptor(content: &str) -> SessionDescriptor {
    SessionDescriptor {
        content: content.to_string(),
        settings: SessionSettings::default(),
        return_to_main: false,
    }
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn replacing_a_session_never_hands_its_surface_to_the_successor() {
    let h = Harness::new();
    let first = h.start("a.nsp");
    h.controller
        .on_surface_created(SurfaceRef::new(1, ()))
        .expect("publish S1");
    wait_for("first frame", || h.engine.frames().contains(&(first, 1)));

    let second = h.start("b.nsp");
    assert!(second > first);
    assert!(h.engine.stop_requests.load(Ordering::SeqCst) >= 1);

    h.controller
        .on_surface_created(SurfaceRef::new(2, ()))
        .expect("publish S2");
    wait_for("second frame", || h.engine.frames().contains(&(second, 2)));

    assert!(!h.engine.frames().contains(&(second, 1)));
    assert!(h.controller.stop(true));
}

#[test]
fn generations_strictly_increase_with_one_worker_at_a_time() {
    let h = Harness::new();
    let mut previous = Generation::NONE;
    for round in 0..5 {
        let generation = h.start(&format!("game-{round}.nsp"));
        assert!(generation > previous);
        previous = generation;
    }
    assert!(h.controller.stop(false));
    assert_eq!(h.engine.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.active.load(Ordering::SeqCst), 0);
}

#[test]
fn teardown_cancels_a_pending_modal_promptly() -> Result<()> {
    let mut h = Harness::new();
    h.start("modal");
    let request_id = h.next_modal()?;

    let started = Instant::now();
    assert!(h.controller.on_host_teardown());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(h.engine.outcomes(), vec![ModalOutcome::Cancelled]);
    assert_eq!(h.controller.state(), SessionState::Terminated);

    let dismissed = std::iter::from_fn(|| h.notices.try_recv().ok())
        .any(|notice| notice == ModalNotice::Dismiss(request_id.clone()));
    assert!(dismissed);
    Ok(())
}

#[test]
fn modal_is_resolved_exactly_once() -> Result<()> {
    let mut h = Harness::new();
    h.start("modal");
    let request_id = h.next_modal()?;

    h.controller.modal_delivered(&request_id)?;
    h.controller
        .resolve_modal(&request_id, ModalOutcome::Submit("SLOT1".to_string()))?;
    let second = h.controller.resolve_modal(&request_id, ModalOutcome::Cancelled);
    assert!(matches!(second, Err(SessionError::AlreadyResolved(_))));

    wait_for("modal outcome", || !h.engine.outcomes().is_empty());
    assert_eq!(
        h.engine.outcomes(),
        vec![ModalOutcome::Submit("SLOT1".to_string())]
    );
    assert!(matches!(
        h.controller.resolve_modal("unknown", ModalOutcome::Cancelled),
        Err(SessionError::ModalNotFound(_))
    ));
    assert!(h.controller.stop(true));
    Ok(())
}

#[test]
fn worker_error_emits_one_crash_event() {
    let mut h = Harness::new();
    let generation = h.start("crash");
    wait_for("terminated", || {
        h.controller.state() == SessionState::Terminated
    });

    let crashes: Vec<_> = h
        .drain_events()
        .into_iter()
        .filter(|event| matches!(event, SessionEvent::WorkerCrashed { .. }))
        .collect();
    assert_eq!(
        crashes,
        vec![SessionEvent::WorkerCrashed {
            generation,
            diagnostic: "gpu fault".to_string(),
        }]
    );
    assert!(h.controller.ticket().is_none());
    assert!(h.controller.stop(false));
    assert_eq!(h.controller.state(), SessionState::Terminated);
}

#[test]
fn worker_panic_is_reported_as_crash() {
    let mut h = Harness::new();
    h.start("panic");
    wait_for("terminated", || {
        h.controller.state() == SessionState::Terminated
    });
    let diagnostic = h.drain_events().into_iter().find_map(|event| match event {
        SessionEvent::WorkerCrashed { diagnostic, .. } => Some(diagnostic),
        _ => None,
    });
    assert_eq!(diagnostic.as_deref(), Some("panic: bad opcode"));
}

#[test]
fn normal_exit_requests_return_to_host() {
    let mut h = Harness::new();
    let ticket = h
        .controller
        .start(SessionDescriptor {
            return_to_main: true,
            ..descriptor("finish")
        })
        .expect("start");
    wait_for("terminated", || {
        h.controller.state() == SessionState::Terminated
    });
    let events = h.drain_events();
    assert!(events.contains(&SessionEvent::ReturnToHostRequested {
        generation: ticket.generation,
        return_to_main: true,
    }));
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, SessionEvent::WorkerCrashed { .. }))
    );
}

#[test]
fn stopped_session_does_not_request_return_to_host() {
    let mut h = Harness::new();
    h.start("idle");
    assert!(h.controller.stop(false));
    let events = h.drain_events();
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, SessionEvent::ReturnToHostRequested { .. }))
    );
    let states: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            SessionState::Starting,
            SessionState::Running,
            SessionState::Stopping,
            SessionState::Terminated,
        ]
    );
}

#[test]
fn stop_timeout_is_reported_and_blocks_the_next_start() {
    let mut h = Harness::with_stop_timeout(Duration::from_millis(50));
    let generation = h.start("stubborn");

    assert!(!h.controller.stop(false));
    assert_eq!(h.controller.state(), SessionState::Stopping);
    assert!(h.drain_events().contains(&SessionEvent::StopTimedOut {
        generation,
        timeout_ms: 50,
    }));

    let refused = h.controller.start(descriptor("next.nsp"));
    assert!(matches!(
        refused,
        Err(SessionError::StopTimeout { generation: g, .. }) if g == generation
    ));
    assert_eq!(h.engine.max_active.load(Ordering::SeqCst), 1);

    assert_eq!(h.controller.ticket().map(|t| t.generation), Some(generation));
    h.engine.release.set();
    wait_for("stubborn worker exit", || {
        h.controller.state() == SessionState::Terminated
    });
    assert!(h.controller.ticket().is_none());
    assert!(h.controller.stop(false));

    let next = h.start("next.nsp");
    assert!(next > generation);
    assert!(h.controller.stop(true));
}

#[test]
fn start_is_refused_while_another_start_is_replacing_the_worker() {
    let h = Harness::with_stop_timeout(Duration::from_millis(300));
    let generation = h.start("stubborn");

    thread::scope(|scope| {
        let replacing = scope.spawn(|| h.controller.start(descriptor("b.nsp")));
        wait_for("replacement to request stop", || {
            h.engine.stop_requests.load(Ordering::SeqCst) >= 1
        });

        let refused = h.controller.start(descriptor("c.nsp"));
        assert!(matches!(refused, Err(SessionError::AlreadyStarting)));
        assert_eq!(h.controller.generation(), generation);
        assert_eq!(h.controller.state(), SessionState::Stopping);

        let replaced = replacing.join().expect("replacing thread");
        assert!(matches!(
            replaced,
            Err(SessionError::StopTimeout { generation: g, .. }) if g == generation
        ));
    });

    assert_eq!(h.engine.max_active.load(Ordering::SeqCst), 1);
    h.engine.release.set();
    assert!(h.controller.on_host_teardown());
}

#[test]
fn pause_withdraws_the_surface_until_resume() {
    let h = Harness::new();
    let generation = h.start("idle");
    h.controller
        .on_surface_created(SurfaceRef::new(7, ()))
        .expect("publish");
    wait_for("first frame", || h.engine.frames().contains(&(generation, 7)));

    h.controller.on_foreground_lost().expect("pause");
    assert_eq!(h.controller.state(), SessionState::Paused);
    let rendered = h.engine.frames().len();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(h.engine.frames().len(), rendered);

    h.controller.on_foreground_gained();
    assert_eq!(h.controller.state(), SessionState::Running);
    wait_for("frames after resume", || h.engine.frames().len() > rendered);
    assert!(h.controller.on_host_teardown());
}

#[test]
fn surface_recreated_while_paused_is_used_after_resume() {
    let h = Harness::new();
    let generation = h.start("idle");
    h.controller
        .on_surface_created(SurfaceRef::new(1, ()))
        .expect("publish");
    h.controller.pause().expect("pause");
    h.controller.on_surface_destroyed().expect("destroy");
    h.controller
        .on_surface_created(SurfaceRef::new(2, ()))
        .expect("park");

    h.controller.resume();
    wait_for("frame on new surface", || {
        h.engine.frames().contains(&(generation, 2))
    });
    assert!(h.controller.stop(true));
}

#[test]
fn pipeline_progress_is_broadcast_in_order() {
    let mut h = Harness::new();
    let generation = h.start("shaders");
    let mut seen = Vec::new();
    wait_for("pipeline loaded", || {
        seen.extend(h.drain_events());
        seen.contains(&SessionEvent::PipelineLoaded { generation })
    });
    let pipeline: Vec<_> = seen
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                SessionEvent::PipelineLoading { .. }
                    | SessionEvent::PipelineProgress { .. }
                    | SessionEvent::PipelineLoaded { .. }
            )
        })
        .collect();
    assert_eq!(
        pipeline,
        vec![
            SessionEvent::PipelineLoading {
                generation,
                total: 3
            },
            SessionEvent::PipelineProgress {
                generation,
                progress: 1
            },
            SessionEvent::PipelineProgress {
                generation,
                progress: 2
            },
            SessionEvent::PipelineProgress {
                generation,
                progress: 3
            },
            SessionEvent::PipelineLoaded { generation },
        ]
    );
    assert!(h.controller.stop(true));
}

#[test]
fn rumble_reaches_the_builtin_vibrator() {
    let h = Harness::new();
    h.start("rumble");
    wait_for("vibration", || {
        !h.rumble.played.lock().expect("played").is_empty()
    });
    let played = h.rumble.played.lock().expect("played").clone();
    assert_eq!(played[0].0, "builtin");
    assert_eq!(played[0].1.amplitudes, vec![255, 0]);
    assert!(h.controller.on_host_teardown());
}

#[test]
fn disconnected_controller_stops_its_rumble() {
    let h = Harness::new();
    h.start("rumble");
    wait_for("vibration", || {
        !h.rumble.played.lock().expect("played").is_empty()
    });

    h.controller.controller_disconnected(0);
    assert_eq!(
        *h.rumble.cancelled.lock().expect("cancelled"),
        vec!["builtin".to_string()]
    );
    h.controller.controller_disconnected(0);
    assert_eq!(h.rumble.cancelled.lock().expect("cancelled").len(), 1);
    assert!(h.controller.stop(true));
}

#[tokio::test]
async fn subscribers_see_lifecycle_events() {
    let h = Harness::new();
    let mut rx = h.controller.subscribe();
    let generation = h.start("idle");

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event in time")
        .expect("event");
    assert_eq!(
        event,
        SessionEvent::StateChanged {
            generation,
            from: SessionState::Idle,
            to: SessionState::Starting,
        }
    );
    assert!(h.controller.stop(false));
}
