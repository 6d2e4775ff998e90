//! SICO entrypoint: CLI dispatch, logging bootstrap, and process exit codes
//! (0 success, 1 configuration error, 2 operational error).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use core_config::{ConfigError, FraRequest};
use core_payload::time::{datetime_to_utime, parse_request_time};
use core_sink::{SinkHandle, spawn_memory_sink, spawn_tcp_sink};
use core_trigger::TriggerMode;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

mod engine;

use engine::{CancelFlag, RunRequest};

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "sico", version, about = "Streaming supernova significance engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stop a running instance.
    Stop,
    /// Process a chunk of scaler data between two times.
    Process {
        /// Start time, YYYY-MM-DDThh:mm:ss[.fffff].
        #[arg(value_name = "START_TIME")]
        start: String,
        /// Stop time, same format.
        #[arg(value_name = "STOP_TIME")]
        stop: String,
        /// Request type.
        #[arg(value_name = "TYPE", value_enum)]
        kind: RequestKind,
        /// Configuration file for additional options.
        #[arg(long = "conf", value_name = "CONFIG_FILE")]
        conf: Option<PathBuf>,
    },
    /// Process a chunk of scaler data described by a JSON request object.
    ProcessJson {
        /// Request object, e.g. {"request_id": ..., "fr_type": "ccsn", ...}.
        #[arg(value_name = "JSON")]
        json: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum RequestKind {
    Ccsn,
    Merger,
    Manual,
}

fn configure_logging() -> Option<WorkerGuard> {
    let log_dir = std::path::Path::new(".");
    let file_appender = tracing_appender::rolling::never(log_dir, "sico.log");
    let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
    match tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(nb_writer)
        .try_init()
    {
        Ok(_) => Some(guard),
        Err(_err) => {
            // Global subscriber already installed (tests); drop the guard so
            // the writer shuts down.
            None
        }
    }
}

fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            tracing::error!(target: "runtime.panic", ?info, "panic");
            default_panic(info);
        }));
    });
}

/// Watch for Ctrl-C and flip the cooperative cancellation flag; the engine
/// observes it between payloads.
fn spawn_cancel_watch(cancel: CancelFlag) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(target: "runtime", "cancellation_requested");
            cancel.store(true, Ordering::Relaxed);
        }
    })
}

fn parse_cli_utime(field: &'static str, text: &str) -> Result<u64> {
    let dt = parse_request_time(text).map_err(|_| ConfigError::Invalid {
        field,
        reason: format!("unparseable time `{text}`"),
    })?;
    let utime = datetime_to_utime(dt).map_err(|_| ConfigError::Invalid {
        field,
        reason: format!("time `{text}` is before the year start"),
    })?;
    Ok(utime)
}

fn request_id() -> String {
    format!(
        "sico-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f")
    )
}

/// A fast-response request is keyed on the alert the interval was issued
/// around: the midpoint of [start, stop].
fn fast_response_mode(start_utime: u64, stop_utime: u64) -> TriggerMode {
    TriggerMode::FastResponse {
        t_trigger: start_utime + (stop_utime - start_utime) / 2,
    }
}

async fn dispatch(cli: Cli, cancel: CancelFlag) -> Result<()> {
    match cli.command {
        Command::Stop => {
            // The running instance watches the request stream; the CLI side
            // only acknowledges.
            println!("SICO stopped");
            Ok(())
        }
        Command::Process {
            start,
            stop,
            kind,
            conf,
        } => {
            let config = core_config::load_from(conf)?;
            let start_utime = parse_cli_utime("start_time", &start)?;
            let stop_utime = parse_cli_utime("stop_time", &stop)?;
            if stop_utime <= start_utime {
                return Err(ConfigError::Invalid {
                    field: "stop_time",
                    reason: "stop time must be after start time".to_string(),
                }
                .into());
            }
            let mode = match kind {
                RequestKind::Manual => TriggerMode::Threshold {
                    threshold: config.trigger.threshold,
                },
                RequestKind::Ccsn | RequestKind::Merger => {
                    fast_response_mode(start_utime, stop_utime)
                }
            };
            let request = RunRequest {
                request_id: request_id(),
                config,
                mode,
                start_utime: Some(start_utime),
                stop_utime: Some(stop_utime),
            };
            run_with_sink(request, false, cancel).await
        }
        Command::ProcessJson { json } => {
            let fra = FraRequest::parse(&json)?;
            let mut config = core_config::load_from(None)?;
            fra.apply_to(&mut config)?;
            let start_utime = parse_cli_utime("start_time", &fra.start_time)?;
            let stop_utime = parse_cli_utime("stop_time", &fra.stop_time)?;
            if stop_utime <= start_utime {
                return Err(ConfigError::Invalid {
                    field: "stop_time",
                    reason: "stop time must be after start time".to_string(),
                }
                .into());
            }
            let request = RunRequest {
                request_id: fra.request_id.clone(),
                config,
                mode: fast_response_mode(start_utime, stop_utime),
                start_utime: Some(start_utime),
                stop_utime: Some(stop_utime),
            };
            run_with_sink(request, fra.test_request, cancel).await
        }
    }
}

/// Wire the request to its sink. Test requests capture messages in memory
/// instead of publishing to the monitoring endpoint.
async fn run_with_sink(request: RunRequest, test_request: bool, cancel: CancelFlag) -> Result<()> {
    let (sink, sink_task): (SinkHandle, JoinHandle<()>) = if test_request {
        let (handle, _captured, task) = spawn_memory_sink(request.config.sink.queue_cap);
        info!(target: "sink", "test_request_using_memory_sink");
        (handle, task)
    } else {
        spawn_tcp_sink(&request.config.sink)
    };

    let result = engine::run_request(request, sink.clone(), cancel).await;
    drop(sink);
    let _ = sink_task.await;
    result.map(|report| {
        info!(
            target: "runtime",
            payloads = report.payloads,
            candidates = report.candidates,
            "run_finished"
        );
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let _log_guard = configure_logging();
    install_panic_hook();
    info!(target: "runtime", "startup");

    let cli = Cli::parse();
    let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
    let watch = spawn_cancel_watch(cancel.clone());

    let code = match dispatch(cli, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = if e.downcast_ref::<ConfigError>().is_some() {
                ExitCode::from(1)
            } else {
                ExitCode::from(2)
            };
            error!(target: "runtime", error = %e, "request_failed");
            eprintln!("sico: {e:#}");
            code
        }
    };
    watch.abort();
    info!(target: "runtime", "shutdown");
    code
}
