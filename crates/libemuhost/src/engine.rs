use emuhost_protocol::{Orientation, RefreshRatePolicy, Stats};

use crate::worker::WorkerContext;

/// The compute engine driven by a session's worker thread.
///
/// One engine instance serves consecutive sessions; the controller never
/// runs two workers at once.
pub trait ComputeEngine: Send + Sync + 'static {
    /// Run the compute loop on the calling worker thread until it exits.
    ///
    /// Returning `Err` (or panicking) is reported as a worker crash with the
    /// given diagnostic. Implementations should poll
    /// [`WorkerContext::is_cancelled`] and acquire the surface per frame
    /// through the context.
    fn run(&self, ctx: WorkerContext) -> Result<(), String>;

    /// Ask the running loop to stop. With `join`, only return once the
    /// engine's internal threads have joined. Returns whether the request
    /// was accepted.
    fn request_stop(&self, join: bool) -> bool;

    fn set_audio_enabled(&self, enabled: bool);

    fn poll_stats(&self) -> Stats;
}

/// Host-wide performance and display hints.
pub trait HostHints: Send + Sync {
    /// Force (or release) maximum GPU/CPU clocks.
    fn set_clock_boost(&self, enabled: bool);

    fn set_refresh_rate(&self, policy: RefreshRatePolicy);

    fn set_orientation(&self, orientation: Orientation);
}

/// Hints implementation for hosts that have none to apply.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHints;

impl HostHints for NoHints {
    fn set_clock_boost(&self, _enabled: bool) {}

    fn set_refresh_rate(&self, _policy: RefreshRatePolicy) {}

    fn set_orientation(&self, _orientation: Orientation) {}
}
