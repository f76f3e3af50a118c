use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use emuhost_protocol::{
    Generation, ModalConfig, ModalOutcome, SessionEvent, SessionSettings, Waveform,
};
use tracing::{debug, error, info};

use crate::broker::EventBroker;
use crate::engine::ComputeEngine;
use crate::error::SessionError;
use crate::modal::ModalBridge;
use crate::signal::Latch;
use crate::surface::{SurfaceHandoff, SurfaceLease};
use crate::vibration::VibrationRegistry;

/// Everything a worker thread may touch, bound to its generation.
pub struct WorkerContext {
    pub(crate) generation: Generation,
    pub(crate) content: String,
    pub(crate) settings: SessionSettings,
    pub(crate) cancel: Latch,
    pub(crate) handoff: Arc<SurfaceHandoff>,
    pub(crate) modal: Arc<ModalBridge>,
    pub(crate) vibration: Arc<VibrationRegistry>,
    pub(crate) broker: EventBroker,
}

impl WorkerContext {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_set()
    }

    /// Sleep up to `timeout`, waking early on cancellation. Returns `true`
    /// if cancelled.
    pub fn wait_cancelled(&self, timeout: Duration) -> bool {
        self.cancel.wait_timeout(timeout)
    }

    /// The surface to render this frame to, if one is published.
    pub fn acquire_surface(&self) -> Option<SurfaceLease> {
        if self.is_cancelled() {
            return None;
        }
        self.handoff.try_acquire_for_frame(self.generation)
    }

    /// Like [`acquire_surface`](Self::acquire_surface) but waits up to
    /// `timeout` for the host to publish one.
    pub fn wait_for_surface(&self, timeout: Duration) -> Option<SurfaceLease> {
        if self.is_cancelled() {
            return None;
        }
        self.handoff.wait_for_surface(self.generation, timeout)
    }

    /// Show a dialog and block until the UI answers or the session stops.
    pub fn request_modal(&self, config: ModalConfig) -> Result<ModalOutcome, SessionError> {
        if self.is_cancelled() {
            return Ok(ModalOutcome::Cancelled);
        }
        self.modal.request(self.generation, config)
    }

    pub fn vibrate(&self, index: u8, waveform: &Waveform) -> bool {
        self.vibration.dispatch(index, waveform)
    }

    pub fn clear_vibration(&self, index: u8) {
        self.vibration.clear(index);
    }

    pub fn pipeline_loading(&self, total: u32) {
        self.broker.emit(SessionEvent::PipelineLoading {
            generation: self.generation,
            total,
        });
    }

    pub fn pipeline_progress(&self, progress: u32) {
        self.broker.emit(SessionEvent::PipelineProgress {
            generation: self.generation,
            progress,
        });
    }

    pub fn pipeline_loaded(&self) {
        self.broker.emit(SessionEvent::PipelineLoaded {
            generation: self.generation,
        });
    }
}

/// How a worker's compute loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorkerExit {
    Finished,
    Crashed(String),
}

/// Spawn the worker thread for `ctx.generation`.
///
/// `started` is set as soon as the thread runs; `on_exit` is called with the
/// outcome before `exited` is set.
pub(crate) fn spawn(
    engine: Arc<dyn ComputeEngine>,
    ctx: WorkerContext,
    started: Latch,
    exited: Latch,
    on_exit: impl FnOnce(Generation, WorkerExit) + Send + 'static,
) -> std::io::Result<JoinHandle<()>> {
    let generation = ctx.generation;
    thread::Builder::new()
        .name(format!("emuhost-worker-{generation}"))
        .spawn(move || {
            started.set();
            info!(%generation, content = %ctx.content, "worker started");
            let result = panic::catch_unwind(AssertUnwindSafe(|| engine.run(ctx)));
            let exit = match result {
                Ok(Ok(())) => {
                    debug!(%generation, "worker loop returned");
                    WorkerExit::Finished
                }
                Ok(Err(diagnostic)) => {
                    error!(%generation, %diagnostic, "worker failed");
                    WorkerExit::Crashed(diagnostic)
                }
                Err(payload) => {
                    let diagnostic = panic_message(payload.as_ref());
                    error!(%generation, %diagnostic, "worker panicked");
                    WorkerExit::Crashed(diagnostic)
                }
            };
            on_exit(generation, exit);
            exited.set();
        })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panic: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panic: {msg}")
    } else {
        "panic: <non-string payload>".to_string()
    }
}
