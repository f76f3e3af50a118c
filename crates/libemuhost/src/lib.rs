//! Session lifecycle coordination for an emulator host.
//!
//! A [`SessionController`] owns at most one worker thread at a time and
//! hands rendering surfaces, modal dialogs and vibration requests between
//! that worker and the host's UI thread.

pub mod broker;
pub mod engine;
pub mod error;
pub mod gate;
pub mod modal;
pub mod session;
mod signal;
pub mod surface;
pub mod vibration;
pub mod worker;

pub use broker::EventBroker;
pub use engine::{ComputeEngine, HostHints, NoHints};
pub use error::SessionError;
pub use gate::PauseResumeGate;
pub use modal::{ModalBridge, ModalNotice, ModalPresenter, ModalRequest, RequestState};
pub use session::{
    Collaborators, ControllerConfig, SessionController, SessionDescriptor, SessionTicket,
};
pub use signal::Latch;
pub use surface::{HandoffConfig, SurfaceHandoff, SurfaceLease, SurfaceRef};
pub use vibration::{
    DeviceDiscovery, DeviceHandle, DeviceId, RumbleTarget, VibrationRegistry, Vibrator,
};
pub use worker::WorkerContext;
