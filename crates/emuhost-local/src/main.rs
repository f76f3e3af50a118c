mod sim;

use anyhow::{Context, Result};
use clap::Parser;
use emuhost_protocol::{ModalConfig, ModalOutcome, SessionEvent, SessionSettings};
use libemuhost::{
    Collaborators, ControllerConfig, HandoffConfig, ModalNotice, ModalRequest, SessionController,
    SessionDescriptor, SurfaceRef,
};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::sim::{LoggingHints, SimulatedDevices, SimulatedEngine};

/// Exit code when the worker crashed.
const EXIT_CRASHED: u8 = 2;
/// Exit code when the worker would not stop; the caller should restart the
/// whole process before starting another session.
const EXIT_STOP_TIMEOUT: u8 = 3;

#[derive(Debug, Parser)]
#[command(
    name = "emuhost-local",
    about = "Drive a simulated emulation session through the lifecycle coordinator"
)]
struct Args {
    /// TOML config file (defaults to ~/.config/emuhost/config.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Content to boot; names containing `prompt`, `crash` or `finish` change
    /// the simulated title's behavior
    #[arg(long)]
    content: Option<String>,
    /// How long to keep the session running before tearing down
    #[arg(long)]
    run_ms: Option<u64>,
    /// Text typed into software keyboard dialogs; without it they are cancelled
    #[arg(long)]
    keyboard_text: Option<String>,
    /// Print session events to stdout as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    content: Option<String>,
    run_ms: Option<u64>,
    keyboard_text: Option<String>,
    return_to_main: bool,
    controller: ControllerSection,
    settings: SessionSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ControllerSection {
    stop_join_timeout_ms: Option<u64>,
    start_ack_timeout_ms: Option<u64>,
    retract_timeout_ms: Option<u64>,
    retract_retry_interval_ms: Option<u64>,
    event_capacity: Option<usize>,
}

impl ControllerSection {
    fn into_config(self) -> ControllerConfig {
        let defaults = ControllerConfig::default();
        let ms = Duration::from_millis;
        ControllerConfig {
            stop_join_timeout: self
                .stop_join_timeout_ms
                .map_or(defaults.stop_join_timeout, ms),
            start_ack_timeout: self
                .start_ack_timeout_ms
                .map_or(defaults.start_ack_timeout, ms),
            handoff: HandoffConfig {
                retract_timeout: self
                    .retract_timeout_ms
                    .map_or(defaults.handoff.retract_timeout, ms),
                retract_retry_interval: self
                    .retract_retry_interval_ms
                    .map_or(defaults.handoff.retract_retry_interval, ms),
            },
            event_capacity: self.event_capacity.unwrap_or(defaults.event_capacity),
        }
    }
}

#[derive(Debug, Clone)]
struct RuntimeConfig {
    content: String,
    run_for: Duration,
    keyboard_text: Option<String>,
    json: bool,
    return_to_main: bool,
    controller: ControllerConfig,
    settings: SessionSettings,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "emuhost_local=info,libemuhost=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cfg = load_runtime_config(&args)?;
    run(cfg).await
}

fn load_runtime_config(args: &Args) -> Result<RuntimeConfig> {
    let path = args.config.clone().or_else(|| {
        let default = emuhost_protocol::paths::config_path();
        default.exists().then_some(default)
    });
    let file_cfg = if let Some(path) = &path {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str::<FileConfig>(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?
    } else {
        FileConfig::default()
    };

    let content = args
        .content
        .clone()
        .or(file_cfg.content)
        .unwrap_or_else(|| "demo".to_string());
    let run_ms = args.run_ms.or(file_cfg.run_ms).unwrap_or(1000);

    Ok(RuntimeConfig {
        content,
        run_for: Duration::from_millis(run_ms),
        keyboard_text: args.keyboard_text.clone().or(file_cfg.keyboard_text),
        json: args.json,
        return_to_main: file_cfg.return_to_main,
        controller: file_cfg.controller.into_config(),
        settings: file_cfg.settings,
    })
}

/// The host's reply to a dialog the worker asked for.
fn answer(request: &ModalRequest, keyboard_text: Option<&str>) -> ModalOutcome {
    match (&request.config, keyboard_text) {
        (ModalConfig::Keyboard { max_length, .. }, Some(text)) => {
            let limit = max_length.map_or(usize::MAX, |n| n as usize);
            ModalOutcome::Submit(text.chars().take(limit).collect())
        }
        (ModalConfig::Keyboard { .. }, None) => ModalOutcome::Cancelled,
        (ModalConfig::Validation { confirm, .. }, _) => ModalOutcome::Confirmed(*confirm),
    }
}

fn emit(cfg: &RuntimeConfig, event: &SessionEvent) -> Result<()> {
    if cfg.json {
        println!("{}", serde_json::to_string(event)?);
    } else {
        info!(?event, "session event");
    }
    Ok(())
}

async fn run(cfg: RuntimeConfig) -> Result<ExitCode> {
    let (modal_tx, mut modal_rx) = mpsc::unbounded_channel::<ModalNotice>();
    let controller = SessionController::new(
        Collaborators {
            engine: Arc::new(SimulatedEngine::new()),
            hints: Arc::new(LoggingHints),
            presenter: Arc::new(modal_tx),
            discovery: Arc::new(SimulatedDevices),
            vibrator: Arc::new(SimulatedDevices),
        },
        cfg.controller.clone(),
    );
    let mut events = controller.subscribe();

    let ticket = controller
        .start(SessionDescriptor {
            content: cfg.content.clone(),
            settings: cfg.settings.clone(),
            return_to_main: cfg.return_to_main,
        })
        .with_context(|| format!("failed to start session for {}", cfg.content))?;
    info!(generation = %ticket.generation, content = %ticket.content, "session started");

    controller
        .on_surface_created(SurfaceRef::new(1, "simulated-window"))
        .context("failed to publish surface")?;

    let perf_every = Duration::from_millis(cfg.settings.perf_stats_interval_ms.max(1));
    let mut perf_tick = tokio::time::interval(perf_every);
    let deadline = tokio::time::sleep(cfg.run_for);
    tokio::pin!(deadline);

    let mut code = ExitCode::SUCCESS;
    loop {
        tokio::select! {
            Some(notice) = modal_rx.recv() => match notice {
                ModalNotice::Show(request) => {
                    if let Err(err) = controller.modal_delivered(&request.id) {
                        warn!(request_id = %request.id, "dialog no longer pending: {err}");
                        continue;
                    }
                    let outcome = answer(&request, cfg.keyboard_text.as_deref());
                    info!(request_id = %request.id, ?outcome, "answering dialog");
                    if let Err(err) = controller.resolve_modal(&request.id, outcome) {
                        warn!(request_id = %request.id, "dialog answer rejected: {err}");
                    }
                }
                ModalNotice::Dismiss(request_id) => {
                    info!(%request_id, "dialog dismissed by coordinator");
                }
            },
            received = events.recv() => match received {
                Ok(event) => {
                    emit(&cfg, &event)?;
                    match event {
                        SessionEvent::WorkerCrashed { generation, diagnostic } => {
                            error!(%generation, %diagnostic, "session crashed");
                            code = ExitCode::from(EXIT_CRASHED);
                            break;
                        }
                        SessionEvent::ReturnToHostRequested { generation, return_to_main } => {
                            info!(%generation, return_to_main, "title returned to host");
                            break;
                        }
                        _ => {}
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = perf_tick.tick(), if cfg.settings.perf_stats => {
                if let Some(stats) = controller.stats() {
                    info!(
                        fps = stats.fps,
                        frametime_ms = stats.average_frametime_ms,
                        deviation_ms = stats.frametime_deviation_ms,
                        "perf"
                    );
                }
            }
            _ = &mut deadline => {
                info!("run time elapsed");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    let joined = controller.on_host_teardown();
    while let Ok(event) = events.try_recv() {
        emit(&cfg, &event)?;
    }
    if !joined {
        error!("worker did not stop; exiting so the process can be restarted");
        return Ok(ExitCode::from(EXIT_STOP_TIMEOUT));
    }
    Ok(code)
}
