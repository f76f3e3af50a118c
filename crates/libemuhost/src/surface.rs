//! Generation-tagged handoff of the rendering surface between the UI thread
//! and the worker.
//!
//! The UI thread owns the platform surface. It publishes a [`SurfaceRef`]
//! into the slot for a specific generation; the worker takes a short-lived
//! [`SurfaceLease`] per frame. Retracting clears the slot and then waits
//! until every outstanding lease is dropped, so once `retract` returns the
//! worker will not touch that surface again.

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use emuhost_protocol::Generation;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::SessionError;

/// Opaque, cheaply cloneable handle to a platform rendering target.
#[derive(Clone)]
pub struct SurfaceRef {
    id: u64,
    native: Arc<dyn Any + Send + Sync>,
}

impl SurfaceRef {
    pub fn new<T: Any + Send + Sync>(id: u64, native: T) -> Self {
        Self {
            id,
            native: Arc::new(native),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Downcast the native payload, e.g. to the engine's window type.
    pub fn native<T: Any>(&self) -> Option<&T> {
        self.native.downcast_ref::<T>()
    }
}

impl fmt::Debug for SurfaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceRef").field("id", &self.id).finish()
    }
}

impl PartialEq for SurfaceRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.native, &other.native)
    }
}

/// Timing for [`SurfaceHandoff::retract`].
#[derive(Debug, Clone, Copy)]
pub struct HandoffConfig {
    pub retract_timeout: Duration,
    pub retract_retry_interval: Duration,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            retract_timeout: Duration::from_millis(500),
            retract_retry_interval: Duration::from_millis(10),
        }
    }
}

#[derive(Default)]
struct Slot {
    generation: Generation,
    bound: bool,
    current: Option<SurfaceRef>,
    /// Last known surface while it is not published (paused).
    parked: Option<SurfaceRef>,
    leases: usize,
}

impl Slot {
    fn check(&self, generation: Generation) -> Result<(), SessionError> {
        if !self.bound {
            return Err(SessionError::WorkerNotRunning);
        }
        if self.generation != generation {
            return Err(SessionError::StaleGeneration(generation));
        }
        Ok(())
    }

    fn accepts(&self, generation: Generation) -> bool {
        self.bound && self.generation == generation
    }
}

struct Inner {
    slot: Mutex<Slot>,
    changed: Condvar,
}

pub struct SurfaceHandoff {
    inner: Arc<Inner>,
    config: HandoffConfig,
}

impl SurfaceHandoff {
    pub fn new(config: HandoffConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::default()),
                changed: Condvar::new(),
            }),
            config,
        }
    }

    /// Bind the slot to a freshly spawned worker. Any surface known to the
    /// previous generation is forgotten; the host must publish again.
    pub fn bind(&self, generation: Generation) {
        let mut slot = self.inner.slot.lock();
        *slot = Slot {
            generation,
            bound: true,
            ..Slot::default()
        };
        debug!(%generation, "surface slot bound");
        self.inner.changed.notify_all();
    }

    /// Stopping began for `generation`: no further acquisitions succeed and
    /// any waiting worker wakes up empty-handed.
    pub fn unbind(&self, generation: Generation) {
        let mut slot = self.inner.slot.lock();
        if !slot.accepts(generation) {
            return;
        }
        slot.bound = false;
        slot.current = None;
        slot.parked = None;
        debug!(%generation, "surface slot unbound");
        self.inner.changed.notify_all();
    }

    /// Make `surface` available to the worker of `generation`.
    pub fn publish(&self, surface: SurfaceRef, generation: Generation) -> Result<(), SessionError> {
        let mut slot = self.inner.slot.lock();
        if !slot.accepts(generation) {
            debug!(%generation, surface = surface.id(), "publish for stale generation ignored");
            return Err(SessionError::StaleGeneration(generation));
        }
        debug!(%generation, surface = surface.id(), "surface published");
        slot.current = Some(surface);
        slot.parked = None;
        self.inner.changed.notify_all();
        Ok(())
    }

    /// Remember `surface` without handing it to the worker.
    pub fn park(&self, surface: SurfaceRef, generation: Generation) -> Result<(), SessionError> {
        let mut slot = self.inner.slot.lock();
        if !slot.accepts(generation) {
            return Err(SessionError::StaleGeneration(generation));
        }
        slot.parked = Some(surface);
        Ok(())
    }

    /// Withdraw the published surface and wait until the worker has released
    /// every frame lease on it.
    ///
    /// The surface stays parked so [`republish`](Self::republish) can bring
    /// it back.
    pub fn retract(&self, generation: Generation) -> Result<(), SessionError> {
        let mut slot = self.inner.slot.lock();
        slot.check(generation)?;
        if let Some(surface) = slot.current.take() {
            slot.parked = Some(surface);
        }

        let deadline = Instant::now() + self.config.retract_timeout;
        let mut attempts = 0u32;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = remaining.min(self.config.retract_retry_interval);
            self.inner.changed.wait_while_for(
                &mut slot,
                |s| s.leases > 0 && s.accepts(generation),
                wait,
            );
            let released = slot.leases == 0 || !slot.accepts(generation);
            if released {
                debug!(%generation, attempts, "surface retracted");
                return Ok(());
            }
            attempts += 1;
            if remaining.is_zero() {
                warn!(
                    %generation,
                    attempts,
                    leases = slot.leases,
                    "worker did not release surface"
                );
                return Err(SessionError::RetractTimeout(generation));
            }
        }
    }

    /// Publish the parked surface again. Returns false when nothing is parked.
    pub fn republish(&self, generation: Generation) -> bool {
        let mut slot = self.inner.slot.lock();
        if !slot.accepts(generation) {
            return false;
        }
        match slot.parked.take() {
            Some(surface) => {
                debug!(%generation, surface = surface.id(), "surface republished");
                slot.current = Some(surface);
                self.inner.changed.notify_all();
                true
            }
            None => false,
        }
    }

    /// The platform destroyed the surface: retract it and forget it.
    pub fn discard(&self, generation: Generation) -> Result<(), SessionError> {
        let result = self.retract(generation);
        let mut slot = self.inner.slot.lock();
        if slot.generation == generation {
            slot.parked = None;
        }
        result
    }

    /// Per-frame, non-blocking acquisition from the worker.
    pub fn try_acquire_for_frame(&self, generation: Generation) -> Option<SurfaceLease> {
        let mut slot = self.inner.slot.lock();
        self.lease(&mut slot, generation)
    }

    /// Block up to `timeout` for a surface to be published. Returns early,
    /// empty, if the slot is unbound or rebound to another generation.
    pub fn wait_for_surface(
        &self,
        generation: Generation,
        timeout: Duration,
    ) -> Option<SurfaceLease> {
        let mut slot = self.inner.slot.lock();
        self.inner.changed.wait_while_for(
            &mut slot,
            |s| s.accepts(generation) && s.current.is_none(),
            timeout,
        );
        self.lease(&mut slot, generation)
    }

    fn lease(&self, slot: &mut Slot, generation: Generation) -> Option<SurfaceLease> {
        if !slot.accepts(generation) {
            return None;
        }
        let surface = slot.current.clone()?;
        slot.leases += 1;
        Some(SurfaceLease {
            surface,
            generation,
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn has_published(&self) -> bool {
        self.inner.slot.lock().current.is_some()
    }

    pub fn has_parked(&self) -> bool {
        self.inner.slot.lock().parked.is_some()
    }

    pub fn bound_generation(&self) -> Option<Generation> {
        let slot = self.inner.slot.lock();
        slot.bound.then_some(slot.generation)
    }
}

impl Default for SurfaceHandoff {
    fn default() -> Self {
        Self::new(HandoffConfig::default())
    }
}

/// A surface borrowed by the worker for one frame submission.
pub struct SurfaceLease {
    surface: SurfaceRef,
    generation: Generation,
    inner: Arc<Inner>,
}

impl SurfaceLease {
    pub fn generation(&self) -> Generation {
        self.generation
    }
}

impl Deref for SurfaceLease {
    type Target = SurfaceRef;

    fn deref(&self) -> &SurfaceRef {
        &self.surface
    }
}

impl Drop for SurfaceLease {
    fn drop(&mut self) {
        let mut slot = self.inner.slot.lock();
        if slot.generation == self.generation {
            slot.leases = slot.leases.saturating_sub(1);
        }
        self.inner.changed.notify_all();
    }
}
