//! Blocking request/response bridge for UI-rendered dialogs.
//!
//! The worker calls [`ModalBridge::request`] and sleeps until the UI thread
//! resolves the request, the UI dismisses it, or the controller cancels the
//! whole generation during teardown. Each request moves through
//! `Pending -> Delivered -> Resolved | Cancelled` and is resolved exactly
//! once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use emuhost_protocol::{Generation, ModalConfig, ModalOutcome, RequestId};
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::SessionError;

/// Finished ids remembered so late duplicate resolutions are rejected as
/// such instead of as unknown.
const FINISHED_HISTORY: usize = 32;

/// A dialog the worker is waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModalRequest {
    pub id: RequestId,
    pub generation: Generation,
    pub config: ModalConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Delivered,
    Resolved,
    Cancelled,
}

/// Renders requests on the UI side.
pub trait ModalPresenter: Send + Sync {
    /// Hand the request to the UI thread. Returns false if the UI is gone.
    fn present(&self, request: &ModalRequest) -> bool;

    /// Close a dialog whose request ended without a UI resolution.
    fn dismiss(&self, request_id: &RequestId);
}

/// Messages posted to a UI loop by the channel presenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModalNotice {
    Show(ModalRequest),
    Dismiss(RequestId),
}

impl ModalPresenter for mpsc::UnboundedSender<ModalNotice> {
    fn present(&self, request: &ModalRequest) -> bool {
        self.send(ModalNotice::Show(request.clone())).is_ok()
    }

    fn dismiss(&self, request_id: &RequestId) {
        let _ = self.send(ModalNotice::Dismiss(request_id.clone()));
    }
}

struct Outstanding {
    id: RequestId,
    state: RequestState,
    outcome: Option<ModalOutcome>,
}

#[derive(Default)]
struct BridgeState {
    open: HashSet<Generation>,
    outstanding: HashMap<Generation, Outstanding>,
    finished: VecDeque<RequestId>,
}

impl BridgeState {
    fn find_mut(&mut self, id: &str) -> Option<&mut Outstanding> {
        self.outstanding.values_mut().find(|o| o.id == id)
    }

    fn missing(&self, id: &str) -> SessionError {
        if self.finished.iter().any(|f| f == id) {
            SessionError::AlreadyResolved(id.to_string())
        } else {
            SessionError::ModalNotFound(id.to_string())
        }
    }
}

pub struct ModalBridge {
    state: Mutex<BridgeState>,
    wake: Condvar,
    presenter: Arc<dyn ModalPresenter>,
}

impl ModalBridge {
    pub fn new(presenter: Arc<dyn ModalPresenter>) -> Self {
        Self {
            state: Mutex::new(BridgeState::default()),
            wake: Condvar::new(),
            presenter,
        }
    }

    /// Accept requests from `generation`.
    pub fn open(&self, generation: Generation) {
        self.state.lock().open.insert(generation);
    }

    /// Show `config` and block the calling worker thread until the request
    /// reaches a terminal state.
    pub fn request(
        &self,
        generation: Generation,
        config: ModalConfig,
    ) -> Result<ModalOutcome, SessionError> {
        let request = {
            let mut state = self.state.lock();
            if !state.open.contains(&generation) {
                debug!(%generation, "modal request from closed generation");
                return Ok(ModalOutcome::Cancelled);
            }
            if let Some(existing) = state.outstanding.get(&generation) {
                return Err(SessionError::AlreadyPending(existing.id.clone()));
            }
            let request = ModalRequest {
                id: uuid::Uuid::new_v4().to_string(),
                generation,
                config,
            };
            state.outstanding.insert(
                generation,
                Outstanding {
                    id: request.id.clone(),
                    state: RequestState::Pending,
                    outcome: None,
                },
            );
            request
        };

        // The presenter may resolve synchronously, so it runs unlocked.
        let presented = self.presenter.present(&request);

        let mut state = self.state.lock();
        if let Some(entry) = state.outstanding.get_mut(&generation) {
            if entry.outcome.is_none() {
                if presented {
                    entry.state = RequestState::Delivered;
                } else {
                    warn!(%generation, request_id = %request.id, "no presenter for modal request");
                    entry.state = RequestState::Cancelled;
                    entry.outcome = Some(ModalOutcome::Cancelled);
                }
            }
        }
        debug!(%generation, request_id = %request.id, "waiting for modal outcome");

        self.wake.wait_while(&mut state, |s| {
            s.outstanding
                .get(&generation)
                .is_some_and(|entry| entry.outcome.is_none())
        });

        let outcome = state
            .outstanding
            .remove(&generation)
            .and_then(|entry| entry.outcome)
            .unwrap_or(ModalOutcome::Cancelled);
        state.finished.push_back(request.id.clone());
        while state.finished.len() > FINISHED_HISTORY {
            state.finished.pop_front();
        }
        debug!(%generation, request_id = %request.id, ?outcome, "modal request finished");
        Ok(outcome)
    }

    /// The UI has put the dialog on screen.
    pub fn mark_delivered(&self, request_id: &str) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        match state.find_mut(request_id) {
            Some(entry) => {
                if entry.state == RequestState::Pending {
                    entry.state = RequestState::Delivered;
                }
                Ok(())
            }
            None => Err(state.missing(request_id)),
        }
    }

    /// Deliver the user's answer. A second resolution of the same request is
    /// rejected and leaves the first outcome in place.
    pub fn resolve(&self, request_id: &str, outcome: ModalOutcome) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        let Some(entry) = state.find_mut(request_id) else {
            return Err(state.missing(request_id));
        };
        if entry.outcome.is_some() {
            return Err(SessionError::AlreadyResolved(request_id.to_string()));
        }
        entry.state = if outcome.is_cancelled() {
            RequestState::Cancelled
        } else {
            RequestState::Resolved
        };
        entry.outcome = Some(outcome);
        self.wake.notify_all();
        Ok(())
    }

    /// The dialog went away without an answer (e.g. its window was destroyed).
    pub fn dismissed(&self, request_id: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.find_mut(request_id) {
            if entry.outcome.is_none() {
                debug!(request_id, "modal dismissed without result");
                entry.state = RequestState::Cancelled;
                entry.outcome = Some(ModalOutcome::Cancelled);
                self.wake.notify_all();
            }
        }
    }

    /// Close `generation` and wake its blocked worker with `Cancelled`.
    /// Returns whether a request was interrupted.
    pub fn cancel_all(&self, generation: Generation) -> bool {
        let interrupted = {
            let mut state = self.state.lock();
            state.open.remove(&generation);
            match state.outstanding.get_mut(&generation) {
                Some(entry) if entry.outcome.is_none() => {
                    entry.state = RequestState::Cancelled;
                    entry.outcome = Some(ModalOutcome::Cancelled);
                    Some(entry.id.clone())
                }
                _ => None,
            }
        };
        self.wake.notify_all();
        match interrupted {
            Some(id) => {
                info!(%generation, request_id = %id, "cancelled pending modal request");
                self.presenter.dismiss(&id);
                true
            }
            None => false,
        }
    }

    /// Id and state of the outstanding request of `generation`, if any.
    pub fn pending(&self, generation: Generation) -> Option<(RequestId, RequestState)> {
        self.state.lock()
            .outstanding
            .get(&generation)
            .map(|entry| (entry.id.clone(), entry.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    const G1: Generation = Generation(1);

    fn keyboard() -> ModalConfig {
        ModalConfig::Keyboard {
            header: "Name".to_string(),
            initial_text: String::new(),
            max_length: None,
            raw: Vec::new(),
        }
    }

    fn channel_bridge() -> (Arc<ModalBridge>, mpsc::UnboundedReceiver<ModalNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(ModalBridge::new(Arc::new(tx)));
        bridge.open(G1);
        (bridge, rx)
    }

    fn spawn_request(
        bridge: &Arc<ModalBridge>,
        config: ModalConfig,
    ) -> thread::JoinHandle<Result<ModalOutcome, SessionError>> {
        let bridge = Arc::clone(bridge);
        thread::spawn(move || bridge.request(G1, config))
    }

    fn next_shown(rx: &mut mpsc::UnboundedReceiver<ModalNotice>) -> ModalRequest {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match rx.try_recv() {
                Ok(ModalNotice::Show(req)) => return req,
                Ok(other) => panic!("unexpected notice {other:?}"),
                Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
                Err(err) => panic!("no modal shown: {err}"),
            }
        }
    }

    #[test]
    fn resolve_wakes_worker_with_value() {
        let (bridge, mut rx) = channel_bridge();
        let worker = spawn_request(&bridge, keyboard());

        let req = next_shown(&mut rx);
        assert_eq!(req.generation, G1);
        bridge.mark_delivered(&req.id).expect("deliver");
        bridge
            .resolve(&req.id, ModalOutcome::Submit("hello".to_string()))
            .expect("resolve");

        let outcome = worker.join().expect("join").expect("outcome");
        assert_eq!(outcome, ModalOutcome::Submit("hello".to_string()));
        assert!(bridge.pending(G1).is_none());
    }

    #[test]
    fn second_resolve_is_rejected() {
        let (bridge, mut rx) = channel_bridge();
        let worker = spawn_request(&bridge, keyboard());
        let req = next_shown(&mut rx);

        bridge
            .resolve(&req.id, ModalOutcome::Submit("hello".to_string()))
            .expect("first resolve");
        let second = bridge.resolve(&req.id, ModalOutcome::Submit("bye".to_string()));
        assert!(matches!(second, Err(SessionError::AlreadyResolved(_))));

        let outcome = worker.join().expect("join").expect("outcome");
        assert_eq!(outcome, ModalOutcome::Submit("hello".to_string()));

        // After the worker consumed it, the id is still known as resolved.
        let late = bridge.resolve(&req.id, ModalOutcome::Cancelled);
        assert!(matches!(late, Err(SessionError::AlreadyResolved(_))));
        assert!(matches!(
            bridge.resolve("nope", ModalOutcome::Cancelled),
            Err(SessionError::ModalNotFound(_))
        ));
    }

    #[test]
    fn only_one_request_per_generation() {
        let (bridge, mut rx) = channel_bridge();
        let worker = spawn_request(&bridge, keyboard());
        let req = next_shown(&mut rx);

        let again = bridge.request(G1, keyboard());
        assert!(matches!(again, Err(SessionError::AlreadyPending(id)) if id == req.id));

        bridge.dismissed(&req.id);
        let outcome = worker.join().expect("join").expect("outcome");
        assert!(outcome.is_cancelled());
    }

    #[test]
    fn cancel_all_unblocks_pending_request() {
        let (bridge, mut rx) = channel_bridge();
        let worker = spawn_request(&bridge, keyboard());
        let req = next_shown(&mut rx);
        assert_eq!(bridge.pending(G1).map(|(_, s)| s), Some(RequestState::Delivered));

        let start = Instant::now();
        assert!(bridge.cancel_all(G1));
        let outcome = worker.join().expect("join").expect("outcome");
        assert_eq!(outcome, ModalOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(2));

        match rx.try_recv() {
            Ok(ModalNotice::Dismiss(id)) => assert_eq!(id, req.id),
            other => panic!("expected dismiss, got {other:?}"),
        }
    }

    #[test]
    fn closed_generation_is_cancelled_immediately() {
        let (bridge, _rx) = channel_bridge();
        bridge.cancel_all(G1);
        let outcome = bridge.request(G1, keyboard()).expect("outcome");
        assert!(outcome.is_cancelled());
        assert!(!bridge.cancel_all(G1));
    }

    #[test]
    fn missing_ui_cancels_request() {
        let (tx, rx) = mpsc::unbounded_channel::<ModalNotice>();
        drop(rx);
        let bridge = ModalBridge::new(Arc::new(tx));
        bridge.open(G1);
        let outcome = bridge
            .request(
                G1,
                ModalConfig::Validation {
                    message: "Name too long".to_string(),
                    confirm: true,
                },
            )
            .expect("outcome");
        assert!(outcome.is_cancelled());
    }

    struct ConfirmingPresenter {
        bridge: Mutex<Option<std::sync::Weak<ModalBridge>>>,
    }

    impl ModalPresenter for ConfirmingPresenter {
        fn present(&self, request: &ModalRequest) -> bool {
            if let Some(bridge) = self.bridge.lock().as_ref().and_then(|w| w.upgrade()) {
                bridge
                    .resolve(&request.id, ModalOutcome::Confirmed(true))
                    .expect("resolve inline");
            }
            true
        }

        fn dismiss(&self, _request_id: &RequestId) {}
    }

    #[test]
    fn presenter_may_resolve_synchronously() {
        let presenter = Arc::new(ConfirmingPresenter {
            bridge: Mutex::new(None),
        });
        let bridge = Arc::new(ModalBridge::new(presenter.clone()));
        *presenter.bridge.lock() = Some(Arc::downgrade(&bridge));
        bridge.open(G1);

        let outcome = bridge
            .request(
                G1,
                ModalConfig::Validation {
                    message: "Save?".to_string(),
                    confirm: true,
                },
            )
            .expect("outcome");
        assert_eq!(outcome, ModalOutcome::Confirmed(true));
    }
}
