use std::sync::Arc;

use emuhost_protocol::{Generation, RefreshRatePolicy, SessionSettings};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::engine::{ComputeEngine, HostHints};
use crate::error::SessionError;
use crate::surface::{SurfaceHandoff, SurfaceRef};

#[derive(Default)]
struct GateState {
    generation: Option<Generation>,
    settings: SessionSettings,
    paused: bool,
    /// Audio stays off across pause/resume until the next attach.
    muted: bool,
    boosted: bool,
}

/// Keeps audio, surface availability and host hints in step with the
/// session's running/paused state.
pub struct PauseResumeGate {
    state: Mutex<GateState>,
    handoff: Arc<SurfaceHandoff>,
    engine: Arc<dyn ComputeEngine>,
    hints: Arc<dyn HostHints>,
}

impl PauseResumeGate {
    pub fn new(
        handoff: Arc<SurfaceHandoff>,
        engine: Arc<dyn ComputeEngine>,
        hints: Arc<dyn HostHints>,
    ) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            handoff,
            engine,
            hints,
        }
    }

    /// Bind to a running session and apply its policies.
    pub fn attach(&self, generation: Generation, settings: SessionSettings) {
        let mut state = self.state.lock();
        self.engine.set_audio_enabled(!settings.audio_disabled);
        self.hints.set_refresh_rate(settings.refresh_rate_policy());
        self.hints.set_orientation(settings.orientation);
        if settings.force_max_clocks {
            self.hints.set_clock_boost(true);
        }
        *state = GateState {
            generation: Some(generation),
            boosted: settings.force_max_clocks,
            settings,
            paused: false,
            muted: false,
        };
        debug!(%generation, "gate attached");
    }

    /// The session is gone: silence audio and drop the clock boost.
    pub fn detach(&self) {
        let mut state = self.state.lock();
        let Some(generation) = state.generation.take() else {
            return;
        };
        self.engine.set_audio_enabled(false);
        if state.boosted {
            self.hints.set_clock_boost(false);
        }
        state.boosted = false;
        state.paused = false;
        state.muted = false;
        debug!(%generation, "gate detached");
    }

    /// Withdraw the surface, silence audio and release the clock boost.
    ///
    /// Audio and clocks are handled even when the surface retract fails;
    /// the retract error is returned afterwards.
    pub fn pause(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if state.paused {
            return Ok(());
        }
        state.paused = true;

        let retracted = match state.generation {
            Some(generation) if self.handoff.has_published() => self.handoff.retract(generation),
            _ => Ok(()),
        };
        self.engine.set_audio_enabled(false);
        if state.boosted {
            self.hints.set_clock_boost(false);
            state.boosted = false;
        }
        if let Err(err) = &retracted {
            warn!("pause could not retract surface: {err}");
        }
        retracted
    }

    /// Republish the last known surface and restore audio and clocks.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        if !state.paused {
            return;
        }
        state.paused = false;
        let Some(generation) = state.generation else {
            return;
        };

        self.handoff.republish(generation);
        if !state.settings.audio_disabled && !state.muted {
            self.engine.set_audio_enabled(true);
        }
        if state.settings.force_max_clocks && !state.boosted {
            self.hints.set_clock_boost(true);
            state.boosted = true;
        }
    }

    /// Silence audio without pausing. Resume keeps it silent for the rest
    /// of the attached session.
    pub fn mute(&self) {
        let mut state = self.state.lock();
        let Some(generation) = state.generation else {
            return;
        };
        if !state.muted {
            state.muted = true;
            self.engine.set_audio_enabled(false);
            debug!(%generation, "audio muted");
        }
    }

    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    /// A new platform surface exists: hand it over, or keep it parked while
    /// paused.
    pub fn surface_created(&self, surface: SurfaceRef) -> Result<(), SessionError> {
        let state = self.state.lock();
        let Some(generation) = state.generation else {
            return Err(SessionError::WorkerNotRunning);
        };
        if state.paused {
            self.handoff.park(surface, generation)
        } else {
            self.handoff.publish(surface, generation)
        }
    }

    pub fn surface_destroyed(&self) -> Result<(), SessionError> {
        let state = self.state.lock();
        let Some(generation) = state.generation else {
            return Err(SessionError::WorkerNotRunning);
        };
        self.handoff.discard(generation)
    }

    /// Give the display back to the host UI on teardown.
    pub fn restore_host(&self) {
        self.hints.set_refresh_rate(RefreshRatePolicy::Maximum);
        self.hints.set_clock_boost(false);
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }
}
