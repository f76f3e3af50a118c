pub mod paths;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one worker lifetime. Strictly increasing per controller.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    /// Never handed to a worker; used before the first session starts.
    pub const NONE: Generation = Generation(0);

    pub fn next(self) -> Generation {
        Generation(self.0.saturating_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a modal request.
pub type RequestId = String;

/// Lifecycle state of the session controller.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Paused,
    Stopping,
    Terminated,
}

impl SessionState {
    /// Whether a worker may be alive in this state.
    pub fn has_worker(self) -> bool {
        matches!(
            self,
            SessionState::Starting
                | SessionState::Running
                | SessionState::Paused
                | SessionState::Stopping
        )
    }
}

/// Events broadcast by the controller to its subscribers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        generation: Generation,
        from: SessionState,
        to: SessionState,
    },
    WorkerCrashed {
        generation: Generation,
        diagnostic: String,
    },
    ReturnToHostRequested {
        generation: Generation,
        return_to_main: bool,
    },
    StopTimedOut {
        generation: Generation,
        timeout_ms: u64,
    },
    PipelineLoading {
        generation: Generation,
        total: u32,
    },
    PipelineProgress {
        generation: Generation,
        progress: u32,
    },
    PipelineLoaded {
        generation: Generation,
    },
}

impl SessionEvent {
    pub fn generation(&self) -> Generation {
        match self {
            SessionEvent::StateChanged { generation, .. }
            | SessionEvent::WorkerCrashed { generation, .. }
            | SessionEvent::ReturnToHostRequested { generation, .. }
            | SessionEvent::StopTimedOut { generation, .. }
            | SessionEvent::PipelineLoading { generation, .. }
            | SessionEvent::PipelineProgress { generation, .. }
            | SessionEvent::PipelineLoaded { generation } => *generation,
        }
    }
}

/// Payload describing the dialog the worker wants shown.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModalConfig {
    /// Software keyboard text entry.
    Keyboard {
        #[serde(default)]
        header: String,
        #[serde(default)]
        initial_text: String,
        #[serde(default)]
        max_length: Option<u32>,
        /// Engine-defined configuration blob, passed through untouched.
        #[serde(default, with = "base64_bytes")]
        raw: Vec<u8>,
    },
    /// Confirmation of a validation message produced by the guest.
    Validation { message: String, confirm: bool },
}

/// Final value of a modal request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum ModalOutcome {
    Submit(String),
    Confirmed(bool),
    Cancelled,
}

impl ModalOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ModalOutcome::Cancelled)
    }
}

/// Refresh-rate hint handed to the host display.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefreshRatePolicy {
    /// Pin the display as close to 60 Hz as it supports.
    Fixed60,
    /// Highest rate the display supports.
    Maximum,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    #[default]
    Landscape,
    Portrait,
    Sensor,
}

/// Read-only snapshot of per-session configuration, taken at start.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SessionSettings {
    pub audio_disabled: bool,
    pub max_refresh_rate: bool,
    pub force_max_clocks: bool,
    pub orientation: Orientation,
    pub perf_stats: bool,
    pub perf_stats_interval_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            audio_disabled: false,
            max_refresh_rate: false,
            force_max_clocks: false,
            orientation: Orientation::default(),
            perf_stats: false,
            perf_stats_interval_ms: 250,
        }
    }
}

impl SessionSettings {
    pub fn refresh_rate_policy(&self) -> RefreshRatePolicy {
        if self.max_refresh_rate {
            RefreshRatePolicy::Maximum
        } else {
            RefreshRatePolicy::Fixed60
        }
    }
}

/// Performance counters reported by the engine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct Stats {
    pub fps: u32,
    pub average_frametime_ms: f32,
    pub frametime_deviation_ms: f32,
}

/// Vibration pattern: alternating durations (ms) with per-step amplitude.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Waveform {
    pub timings_ms: Vec<u64>,
    pub amplitudes: Vec<u8>,
}

impl Waveform {
    pub fn new(timings_ms: Vec<u64>, amplitudes: Vec<u8>) -> Self {
        Self {
            timings_ms,
            amplitudes,
        }
    }

    /// Non-empty with one amplitude per timing step.
    pub fn is_well_formed(&self) -> bool {
        !self.timings_ms.is_empty() && self.timings_ms.len() == self.amplitudes.len()
    }
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AlreadyStarting,
    AlreadyPending,
    StopTimeout,
    WorkerCrashed,
    StaleGeneration,
    WorkerNotRunning,
    RetractTimeout,
    ModalNotFound,
    AlreadyResolved,
    HostError,
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}
