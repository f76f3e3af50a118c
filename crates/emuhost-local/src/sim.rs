use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use emuhost_protocol::{
    ModalConfig, ModalOutcome, Orientation, RefreshRatePolicy, Stats, Waveform,
};
use libemuhost::{
    ComputeEngine, DeviceDiscovery, DeviceHandle, HostHints, RumbleTarget, Vibrator, WorkerContext,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

const FRAME_INTERVAL: Duration = Duration::from_millis(16);
const RUMBLE_EVERY: u64 = 120;
const SHADER_PIPELINES: u32 = 4;

/// Frame counts for content named `crash` or `finish`.
const CRASH_AFTER_FRAMES: u64 = 10;
const FINISH_AFTER_FRAMES: u64 = 30;

#[derive(Default)]
struct FrameClock {
    window_start: Option<Instant>,
    last_frame: Option<Instant>,
    frametimes_ms: Vec<f32>,
}

/// Stand-in for a real emulator core: renders to whatever surface the
/// coordinator hands it and exercises dialogs and rumble.
#[derive(Default)]
pub struct SimulatedEngine {
    audio: AtomicBool,
    clock: Mutex<FrameClock>,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_frame(&self) {
        let now = Instant::now();
        let mut clock = self.clock.lock();
        if let Some(last) = clock.last_frame {
            clock
                .frametimes_ms
                .push(now.duration_since(last).as_secs_f32() * 1000.0);
        }
        clock.window_start.get_or_insert(now);
        clock.last_frame = Some(now);
    }

    fn prompt(&self, ctx: &WorkerContext) -> Result<(), String> {
        let outcome = ctx
            .request_modal(ModalConfig::Keyboard {
                header: "Enter a profile name".to_string(),
                initial_text: "player".to_string(),
                max_length: Some(32),
                raw: Vec::new(),
            })
            .map_err(|err| err.to_string())?;
        match outcome {
            ModalOutcome::Submit(text) => info!(text = %text, "keyboard submitted"),
            other => info!(?other, "keyboard closed"),
        }

        let confirmed = ctx
            .request_modal(ModalConfig::Validation {
                message: "Continue with this profile?".to_string(),
                confirm: true,
            })
            .map_err(|err| err.to_string())?;
        info!(?confirmed, "validation answered");
        Ok(())
    }
}

impl ComputeEngine for SimulatedEngine {
    fn run(&self, ctx: WorkerContext) -> Result<(), String> {
        let content = ctx.content().to_string();
        info!(content = %content, "simulated title booting");

        ctx.pipeline_loading(SHADER_PIPELINES);
        for progress in 1..=SHADER_PIPELINES {
            if ctx.wait_cancelled(Duration::from_millis(5)) {
                return Ok(());
            }
            ctx.pipeline_progress(progress);
        }
        ctx.pipeline_loaded();

        if content.contains("prompt") {
            self.prompt(&ctx)?;
        }

        let mut frames = 0u64;
        while !ctx.wait_cancelled(FRAME_INTERVAL) {
            let Some(surface) = ctx.acquire_surface() else {
                continue;
            };
            frames += 1;
            self.record_frame();
            if frames == 1 {
                debug!(surface = surface.id(), "first frame presented");
            }
            drop(surface);

            if frames % RUMBLE_EVERY == 0 {
                ctx.vibrate(0, &Waveform::new(vec![40, 60], vec![200, 0]));
            }
            if content.contains("crash") && frames >= CRASH_AFTER_FRAMES {
                return Err(format!("simulated fault after {frames} frames"));
            }
            if content.contains("finish") && frames >= FINISH_AFTER_FRAMES {
                info!(frames, "simulated title exited");
                return Ok(());
            }
        }
        ctx.clear_vibration(0);
        Ok(())
    }

    fn request_stop(&self, join: bool) -> bool {
        debug!(join, "stop requested");
        true
    }

    fn set_audio_enabled(&self, enabled: bool) {
        if self.audio.swap(enabled, Ordering::SeqCst) != enabled {
            debug!(enabled, "audio toggled");
        }
    }

    /// Frame statistics since the previous poll.
    fn poll_stats(&self) -> Stats {
        let mut clock = self.clock.lock();
        let samples = std::mem::take(&mut clock.frametimes_ms);
        let elapsed = clock
            .window_start
            .take()
            .map(|start| start.elapsed().as_secs_f32())
            .unwrap_or_default();
        if samples.is_empty() || elapsed <= 0.0 {
            return Stats::default();
        }

        let count = samples.len() as f32;
        let average = samples.iter().sum::<f32>() / count;
        let variance = samples.iter().map(|t| (t - average).powi(2)).sum::<f32>() / count;
        Stats {
            fps: (count / elapsed).round() as u32,
            average_frametime_ms: average,
            frametime_deviation_ms: variance.sqrt(),
        }
    }
}

/// Host hints that only log what a device would apply.
pub struct LoggingHints;

impl HostHints for LoggingHints {
    fn set_clock_boost(&self, enabled: bool) {
        info!(enabled, "clock boost");
    }

    fn set_refresh_rate(&self, policy: RefreshRatePolicy) {
        info!(?policy, "refresh rate");
    }

    fn set_orientation(&self, orientation: Orientation) {
        debug!(?orientation, "orientation");
    }
}

/// A host with one built-in vibrator and no external controllers.
pub struct SimulatedDevices;

impl DeviceDiscovery for SimulatedDevices {
    fn rumble_target(&self, index: u8) -> Option<RumbleTarget> {
        (index == 0).then_some(RumbleTarget::Builtin)
    }

    fn builtin(&self) -> Option<DeviceHandle> {
        Some(DeviceHandle {
            id: "builtin-vibrator".to_string(),
            builtin: true,
        })
    }

    fn find(&self, descriptor: &str) -> Option<DeviceHandle> {
        warn!(descriptor, "no external controllers attached");
        None
    }
}

impl Vibrator for SimulatedDevices {
    fn vibrate(&self, device: &DeviceHandle, waveform: &Waveform) {
        debug!(device = %device.id, steps = waveform.timings_ms.len(), "rumble");
    }

    fn cancel(&self, device: &DeviceHandle) {
        debug!(device = %device.id, "rumble cancelled");
    }
}
