//! The status/result sink: a single-writer channel to the monitoring system.
//!
//! The engine never blocks on the sink. Messages go through a bounded queue
//! with `try_send`; when the queue is full they are dropped and counted. The
//! sink task owns the TCP connection and retries sends with bounded backoff,
//! dropping the message (never the run) when retries are exhausted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use core_config::SinkOptions;
use core_trigger::Candidate;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const MONI_SERVICE: &str = "sico_fra";
pub const MONI_VARNAME_INFO: &str = "sico_fra_info";
pub const MONI_VARNAME_ERROR: &str = "sico_fra_error";

/// Request lifecycle states, serialized with the wire spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FraStatus {
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "IN PROGRESS")]
    InProgress,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAIL")]
    Fail,
}

/// One monitoring record as shipped on the wire.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MoniMessage {
    pub service: &'static str,
    pub varname: &'static str,
    pub prio: u8,
    pub value: Value,
}

impl MoniMessage {
    pub fn info(value: Value) -> Self {
        Self {
            service: MONI_SERVICE,
            varname: MONI_VARNAME_INFO,
            prio: 2,
            value,
        }
    }

    pub fn error(value: Value) -> Self {
        Self {
            service: MONI_SERVICE,
            varname: MONI_VARNAME_ERROR,
            prio: 2,
            value,
        }
    }
}

/// Status-update payload.
pub fn status_value(request_id: &str, status: FraStatus) -> Value {
    json!({
        "request_id": request_id,
        "status": status,
    })
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LightcurvePayload {
    pub data: Vec<u64>,
    pub offset_ms: u32,
}

/// Result payload: final ξ per binsize, lightcurves per binsize, and a free
/// data object (error text for failures, candidate details for successes).
pub fn result_value(
    request_id: &str,
    status: FraStatus,
    xi: &BTreeMap<u32, f64>,
    lightcurve: &BTreeMap<u32, LightcurvePayload>,
    data: Value,
) -> Value {
    json!({
        "request_id": request_id,
        "status": status,
        "xi": xi,
        "lightcurve": lightcurve,
        "data": data,
    })
}

/// Candidate details embedded in the result `data` field.
pub fn candidate_value(cand: &Candidate) -> Value {
    json!({
        "xi": cand.xi,
        "xi_corr": cand.xi_corr,
        "chi2": cand.chi2,
        "t_trigger": cand.t_trigger,
        "binsize_ms": cand.binsize_ms,
        "offset_ms": cand.offset_ms,
        "trigger_no": cand.trigger_no,
        "cand_no": cand.cand_no,
        "cancelled": cand.cancelled,
        "levels": core_trigger::matched_levels(cand.xi, cand.xi_corr)
            .iter()
            .map(|l| l.name)
            .collect::<Vec<_>>(),
        "xi_hist": cand.xi_hist,
        "xi_hist_base": cand.xi_hist_base,
        "rmu_trigger": cand.rmu_trigger.as_ref().map(|s| json!({
            "t_start": s.t_start,
            "binsize_ms": s.binsize_ms,
            "data": s.data,
        })),
        "rmu_base": cand.rmu_base.as_ref().map(|s| json!({
            "t_start": s.t_start,
            "binsize_ms": s.binsize_ms,
            "data": s.data,
        })),
    })
}

/// Cloneable producer side of the sink queue.
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::Sender<MoniMessage>,
    dropped: Arc<AtomicU64>,
}

impl SinkHandle {
    /// Non-blocking publish; a full queue drops the message and counts it so
    /// backpressure from the sink can never stall ingest.
    pub fn publish(&self, message: MoniMessage) {
        if let Err(e) = self.tx.try_send(message) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(target: "sink", dropped, reason = %e, "moni_message_dropped");
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Build the queue shared by every sink flavor.
fn sink_channel(cap: usize) -> (SinkHandle, mpsc::Receiver<MoniMessage>) {
    let (tx, rx) = mpsc::channel(cap);
    (
        SinkHandle {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

/// Spawn the TCP JSON-lines sink task. The returned handle is the only way
/// to feed it; dropping all handles ends the task.
pub fn spawn_tcp_sink(opts: &SinkOptions) -> (SinkHandle, JoinHandle<()>) {
    let (handle, mut rx) = sink_channel(opts.queue_cap);
    let addr = format!("{}:{}", opts.host, opts.port);
    let max_retries = opts.max_retries;
    let backoff_ms = opts.retry_backoff_ms;

    let task = tokio::spawn(async move {
        let mut stream: Option<TcpStream> = None;
        let mut undeliverable = 0u64;
        while let Some(message) = rx.recv().await {
            let mut line = match serde_json::to_string(&message) {
                Ok(s) => s,
                Err(e) => {
                    warn!(target: "sink", error = %e, "moni_message_unserializable");
                    continue;
                }
            };
            line.push('\n');

            let mut delivered = false;
            for attempt in 0..=max_retries {
                if stream.is_none() {
                    match TcpStream::connect(&addr).await {
                        Ok(s) => {
                            info!(target: "sink", addr = %addr, "sink_connected");
                            stream = Some(s);
                        }
                        Err(e) => {
                            debug!(target: "sink", addr = %addr, attempt, error = %e, "sink_connect_failed");
                        }
                    }
                }
                if let Some(s) = stream.as_mut() {
                    match s.write_all(line.as_bytes()).await {
                        Ok(()) => {
                            delivered = true;
                            break;
                        }
                        Err(e) => {
                            warn!(target: "sink", attempt, error = %e, "sink_write_failed");
                            stream = None;
                        }
                    }
                }
                if attempt < max_retries {
                    let delay = backoff_ms.saturating_mul(1u64 << attempt.min(6));
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
            }
            if !delivered {
                undeliverable += 1;
                warn!(
                    target: "sink",
                    undeliverable,
                    varname = message.varname,
                    "moni_message_undeliverable_dropped"
                );
            }
        }
        info!(target: "sink", "sink_task_finished");
    });

    (handle, task)
}

/// In-memory sink for tests and dry runs: captures every message.
pub fn spawn_memory_sink(
    cap: usize,
) -> (
    SinkHandle,
    Arc<std::sync::Mutex<Vec<MoniMessage>>>,
    JoinHandle<()>,
) {
    let (handle, mut rx) = sink_channel(cap);
    let captured = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = captured.clone();
    let task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            sink.lock().expect("memory sink poisoned").push(message);
        }
    });
    (handle, captured, task)
}
