use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use emuhost_protocol::{
    Generation, ModalOutcome, SessionEvent, SessionSettings, SessionState, Stats,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::broker::{self, EventBroker};
use crate::engine::{ComputeEngine, HostHints};
use crate::error::SessionError;
use crate::gate::PauseResumeGate;
use crate::modal::{ModalBridge, ModalPresenter};
use crate::signal::Latch;
use crate::surface::{HandoffConfig, SurfaceHandoff, SurfaceRef};
use crate::vibration::{DeviceDiscovery, VibrationRegistry, Vibrator};
use crate::worker::{self, WorkerContext, WorkerExit};

/// What to run, and with which settings snapshot.
#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    pub content: String,
    pub settings: SessionSettings,
    /// Passed back in `ReturnToHostRequested` when the worker exits on its own.
    pub return_to_main: bool,
}

/// The caller's view of a started session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    pub generation: Generation,
    pub content: String,
}

/// Timing and sizing knobs for the controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How long `stop` waits for the worker to join.
    pub stop_join_timeout: Duration,
    /// How long `start` waits for the new worker to come up.
    pub start_ack_timeout: Duration,
    pub handoff: HandoffConfig,
    pub event_capacity: usize,
}

impl ControllerConfig {
    fn stop_join_timeout_ms(&self) -> u64 {
        u64::try_from(self.stop_join_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            stop_join_timeout: Duration::from_millis(250),
            start_ack_timeout: Duration::from_secs(1),
            handoff: HandoffConfig::default(),
            event_capacity: broker::DEFAULT_CAPACITY,
        }
    }
}

/// External collaborators the controller drives.
pub struct Collaborators {
    pub engine: Arc<dyn ComputeEngine>,
    pub hints: Arc<dyn HostHints>,
    pub presenter: Arc<dyn ModalPresenter>,
    pub discovery: Arc<dyn DeviceDiscovery>,
    pub vibrator: Arc<dyn Vibrator>,
}

/// Ownership of one worker lifetime.
struct SessionHandle {
    generation: Generation,
    content: String,
    return_to_main: bool,
    stop_requested: bool,
    cancel: Latch,
    exited: Latch,
    thread: Option<JoinHandle<()>>,
}

struct ControllerState {
    state: SessionState,
    generation: Generation,
    /// A `start` call is between its first check and its final transition.
    launching: bool,
    handle: Option<SessionHandle>,
}

struct Shared {
    inner: Mutex<ControllerState>,
    broker: EventBroker,
    handoff: Arc<SurfaceHandoff>,
    modal: Arc<ModalBridge>,
    vibration: Arc<VibrationRegistry>,
    gate: PauseResumeGate,
    engine: Arc<dyn ComputeEngine>,
    config: ControllerConfig,
}

impl Shared {
    fn transition(&self, st: &mut ControllerState, to: SessionState) {
        let from = st.state;
        if from == to {
            return;
        }
        st.state = to;
        info!(generation = %st.generation, ?from, ?to, "session state changed");
        self.broker.emit(SessionEvent::StateChanged {
            generation: st.generation,
            from,
            to,
        });
    }

    /// Release everything bound to `generation`. Safe to repeat.
    fn release(&self, generation: Generation) {
        self.handoff.unbind(generation);
        self.modal.cancel_all(generation);
        self.gate.detach();
        self.vibration.invalidate_all();
    }

    /// Called on the worker thread once its compute loop has ended.
    fn worker_exited(&self, generation: Generation, exit: WorkerExit) {
        let mut st = self.inner.lock();
        let Some(handle) = st.handle.as_ref().filter(|h| h.generation == generation) else {
            debug!(%generation, "exit of superseded worker ignored");
            return;
        };
        let stop_requested = handle.stop_requested;
        let return_to_main = handle.return_to_main;

        match exit {
            WorkerExit::Crashed(diagnostic) => {
                self.broker.emit(SessionEvent::WorkerCrashed {
                    generation,
                    diagnostic,
                });
            }
            WorkerExit::Finished if !stop_requested => {
                info!(%generation, return_to_main, "worker finished, returning to host");
                self.broker.emit(SessionEvent::ReturnToHostRequested {
                    generation,
                    return_to_main,
                });
            }
            WorkerExit::Finished => {}
        }

        if st.generation == generation {
            self.release(generation);
            self.transition(&mut st, SessionState::Terminated);
        }
    }

    /// Ask the current worker to stop without waiting for it.
    fn signal_stop(&self, force: bool) -> Option<(Generation, Latch)> {
        let mut st = self.inner.lock();
        let handle = st.handle.as_mut()?;
        handle.stop_requested = true;
        handle.cancel.set();
        let generation = handle.generation;
        let exited = handle.exited.clone();
        if st.state.has_worker() && st.state != SessionState::Stopping && !exited.is_set() {
            self.transition(&mut st, SessionState::Stopping);
        }
        drop(st);

        self.handoff.unbind(generation);
        self.gate.detach();
        self.vibration.invalidate_all();
        if force {
            self.modal.cancel_all(generation);
        }
        if !self.engine.request_stop(false) {
            debug!(%generation, "engine declined stop request");
        }
        Some((generation, exited))
    }

    fn stop(&self, force: bool) -> bool {
        let Some((generation, exited)) = self.signal_stop(force) else {
            return true;
        };

        if !exited.wait_timeout(self.config.stop_join_timeout) {
            let timeout_ms = self.config.stop_join_timeout_ms();
            warn!(%generation, timeout_ms, "worker did not stop in time");
            self.broker.emit(SessionEvent::StopTimedOut {
                generation,
                timeout_ms,
            });
            return false;
        }

        let thread = {
            let mut st = self.inner.lock();
            let handle = match st.handle.take() {
                Some(handle) if handle.generation == generation => handle,
                other => {
                    st.handle = other;
                    return true;
                }
            };
            if st.generation == generation && st.state != SessionState::Terminated {
                self.release(generation);
                self.transition(&mut st, SessionState::Terminated);
            }
            handle.thread
        };
        // The exit latch is the thread's last action, so this join is short.
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!(%generation, "worker thread panicked after signalling exit");
            }
        }
        info!(%generation, "worker joined");
        true
    }
}

/// Owns the life of one running session at a time.
///
/// All state transitions go through a single mutex. At most one worker
/// thread exists; a new `start` first stops the previous worker and refuses
/// to continue while it is still alive.
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(collaborators: Collaborators, config: ControllerConfig) -> Self {
        let Collaborators {
            engine,
            hints,
            presenter,
            discovery,
            vibrator,
        } = collaborators;
        let handoff = Arc::new(SurfaceHandoff::new(config.handoff));
        let gate = PauseResumeGate::new(Arc::clone(&handoff), Arc::clone(&engine), hints);
        let shared = Shared {
            inner: Mutex::new(ControllerState {
                state: SessionState::Idle,
                generation: Generation::NONE,
                launching: false,
                handle: None,
            }),
            broker: EventBroker::new(config.event_capacity),
            handoff,
            modal: Arc::new(ModalBridge::new(presenter)),
            vibration: Arc::new(VibrationRegistry::new(discovery, vibrator)),
            gate,
            engine,
            config,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Start a new session, replacing the current one.
    pub fn start(&self, descriptor: SessionDescriptor) -> Result<SessionTicket, SessionError> {
        {
            let mut st = self.shared.inner.lock();
            if st.launching || st.state == SessionState::Starting {
                return Err(SessionError::AlreadyStarting);
            }
            st.launching = true;
        }

        let result = self.launch(descriptor);
        self.shared.inner.lock().launching = false;
        result
    }

    fn launch(&self, descriptor: SessionDescriptor) -> Result<SessionTicket, SessionError> {
        let previous = self.shared.inner.lock().handle.as_ref().map(|h| h.generation);
        if let Some(previous) = previous {
            info!(%previous, "replacing previous session");
            if !self.shared.stop(false) {
                return Err(SessionError::StopTimeout {
                    generation: previous,
                    timeout_ms: self.shared.config.stop_join_timeout_ms(),
                });
            }
        }

        let started = Latch::new();
        let (generation, ticket) = {
            let mut st = self.shared.inner.lock();
            st.generation = st.generation.next();
            let generation = st.generation;
            self.shared.transition(&mut st, SessionState::Starting);

            self.shared.handoff.bind(generation);
            self.shared.modal.open(generation);

            let cancel = Latch::new();
            let exited = Latch::new();
            let ctx = WorkerContext {
                generation,
                content: descriptor.content.clone(),
                settings: descriptor.settings.clone(),
                cancel: cancel.clone(),
                handoff: Arc::clone(&self.shared.handoff),
                modal: Arc::clone(&self.shared.modal),
                vibration: Arc::clone(&self.shared.vibration),
                broker: self.shared.broker.clone(),
            };
            let weak: Weak<Shared> = Arc::downgrade(&self.shared);
            let spawned = worker::spawn(
                Arc::clone(&self.shared.engine),
                ctx,
                started.clone(),
                exited.clone(),
                move |generation, exit| {
                    if let Some(shared) = weak.upgrade() {
                        shared.worker_exited(generation, exit);
                    }
                },
            );
            let thread = match spawned {
                Ok(thread) => thread,
                Err(err) => {
                    warn!(%generation, "failed to spawn worker: {err}");
                    self.shared.handoff.unbind(generation);
                    self.shared.modal.cancel_all(generation);
                    self.shared.transition(&mut st, SessionState::Idle);
                    return Err(SessionError::Spawn(err));
                }
            };

            st.handle = Some(SessionHandle {
                generation,
                content: descriptor.content.clone(),
                return_to_main: descriptor.return_to_main,
                stop_requested: false,
                cancel,
                exited,
                thread: Some(thread),
            });
            let ticket = SessionTicket {
                generation,
                content: descriptor.content,
            };
            (generation, ticket)
        };

        if !started.wait_timeout(self.shared.config.start_ack_timeout) {
            warn!(%generation, "worker did not acknowledge start");
            self.shared.stop(true);
            return Err(SessionError::WorkerNotRunning);
        }

        let mut st = self.shared.inner.lock();
        if st.generation == generation && st.state == SessionState::Starting {
            self.shared.gate.attach(generation, descriptor.settings);
            self.shared.transition(&mut st, SessionState::Running);
        }
        Ok(ticket)
    }

    /// Request shutdown of the current worker.
    ///
    /// Returns true only once the worker has been joined. False means the
    /// worker is still shutting down; a `StopTimedOut` event has been emitted
    /// and the caller may escalate.
    pub fn stop(&self, force: bool) -> bool {
        self.shared.stop(force)
    }

    pub fn pause(&self) -> Result<(), SessionError> {
        {
            let mut st = self.shared.inner.lock();
            if st.state != SessionState::Running {
                return Ok(());
            }
            self.shared.transition(&mut st, SessionState::Paused);
        }
        self.shared.gate.pause()
    }

    pub fn resume(&self) {
        {
            let mut st = self.shared.inner.lock();
            if st.state != SessionState::Paused {
                return;
            }
            self.shared.transition(&mut st, SessionState::Running);
        }
        self.shared.gate.resume();
    }

    /// Silence audio without pausing emulation.
    pub fn mute(&self) {
        if matches!(self.state(), SessionState::Running | SessionState::Paused) {
            self.shared.gate.mute();
        }
    }

    pub fn on_foreground_lost(&self) -> Result<(), SessionError> {
        self.pause()
    }

    pub fn on_foreground_gained(&self) {
        self.resume();
    }

    /// The platform created a rendering surface. Surfaces arriving while no
    /// session accepts them are dropped.
    pub fn on_surface_created(&self, surface: SurfaceRef) -> Result<(), SessionError> {
        match self.shared.gate.surface_created(surface) {
            Err(SessionError::StaleGeneration(generation)) => {
                debug!(%generation, "surface for stale generation dropped");
                Ok(())
            }
            other => other,
        }
    }

    pub fn on_surface_destroyed(&self) -> Result<(), SessionError> {
        self.shared.gate.surface_destroyed()
    }

    /// The host UI is going away: force the worker down and give the display
    /// back. Returns whether the worker was joined.
    pub fn on_host_teardown(&self) -> bool {
        let joined = self.shared.stop(true);
        self.shared.vibration.invalidate_all();
        self.shared.gate.restore_host();
        joined
    }

    pub fn resolve_modal(
        &self,
        request_id: &str,
        outcome: ModalOutcome,
    ) -> Result<(), SessionError> {
        self.shared.modal.resolve(request_id, outcome)
    }

    pub fn modal_delivered(&self, request_id: &str) -> Result<(), SessionError> {
        self.shared.modal.mark_delivered(request_id)
    }

    pub fn modal_dismissed(&self, request_id: &str) {
        self.shared.modal.dismissed(request_id);
    }

    /// A physical input device was disconnected.
    pub fn device_removed(&self, device_id: &str) {
        self.shared.vibration.device_removed(device_id);
    }

    /// The controller at `index` was unplugged or reassigned; its rumble
    /// binding is dropped and resolved again on the next effect.
    pub fn controller_disconnected(&self, index: u8) {
        self.shared.vibration.invalidate(index);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.broker.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    /// The most recently issued generation.
    pub fn generation(&self) -> Generation {
        self.shared.inner.lock().generation
    }

    /// The session that currently owns a worker. `None` once the worker has
    /// exited, even if its handle is still waiting to be joined.
    pub fn ticket(&self) -> Option<SessionTicket> {
        let st = self.shared.inner.lock();
        if !st.state.has_worker() {
            return None;
        }
        st.handle.as_ref().map(|h| SessionTicket {
            generation: h.generation,
            content: h.content.clone(),
        })
    }

    /// Engine statistics while a session is running or paused.
    pub fn stats(&self) -> Option<Stats> {
        match self.state() {
            SessionState::Running | SessionState::Paused => Some(self.shared.engine.poll_stats()),
            _ => None,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.gate.is_paused()
    }

    pub fn is_muted(&self) -> bool {
        self.shared.gate.is_muted()
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        // Signal only; joining here could block the UI thread.
        self.shared.signal_stop(true);
    }
}
