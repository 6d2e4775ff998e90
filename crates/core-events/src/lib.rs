//! Core event types and channel helpers for the SICO pipeline.
//!
//! The engine loop is the single consumer of a bounded mpsc channel sized by
//! `EVENT_CHANNEL_CAP`. The payload producer runs on a blocking task and uses
//! `blocking_send`, which parks the producer until space is available rather
//! than dropping payloads: with a single producer (the file reader) and a
//! single consumer (the pipeline) latency stays low, and losing scaler data
//! to backpressure is never acceptable. Telemetry counters record send
//! failures (closed channel) and successful blocking sends.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use core_payload::{PayloadReader, SnPayload};
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const EVENT_CHANNEL_CAP: usize = 8192;

pub static CHANNEL_SEND_FAILURES: AtomicU64 = AtomicU64::new(0);
pub static CHANNEL_BLOCKING_SENDS: AtomicU64 = AtomicU64::new(0);
pub static PAYLOADS_EMITTED: AtomicU64 = AtomicU64::new(0);
pub static RECORDS_SKIPPED: AtomicU64 = AtomicU64::new(0);
pub static FILES_ABANDONED: AtomicU64 = AtomicU64::new(0);

/// Top-level event enum consumed by the engine loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// One well-formed scaler record.
    Payload(SnPayload),
    /// The producer switched to a new input file.
    FileOpened(PathBuf),
    /// A file was fully consumed (or abandoned; see the abandoned flag).
    FileClosed { path: PathBuf, abandoned: bool },
    /// The producer ran out of input.
    Eof,
    Shutdown,
}

/// Helper result type for channel plumbing.
pub type EventResult<T> = anyhow::Result<T>;

/// Trait implemented by any event producer. Implementors hold their
/// configuration and spawn one background task that pushes `Event`s into the
/// shared channel, terminating promptly when the channel closes.
pub trait EventSource: Send + 'static {
    /// Stable identifier used for logging.
    fn name(&self) -> &'static str;
    /// Consume self and spawn the producer task. Implementors must stop when
    /// the channel reports closure.
    fn spawn(self: Box<Self>, tx: Sender<Event>) -> JoinHandle<()>;
}

/// Registry of event sources, spawned together at engine start.
#[derive(Default)]
pub struct EventSourceRegistry {
    sources: Vec<Box<dyn EventSource>>,
}

impl EventSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: EventSource>(&mut self, src: S) {
        self.sources.push(Box::new(src));
    }

    /// Spawn all registered sources, returning their JoinHandles. The caller
    /// keeps its own `Sender` clone; during shutdown it should drop that
    /// clone before awaiting the handles so sources observe closure.
    pub fn spawn_all(&mut self, tx: &Sender<Event>) -> Vec<JoinHandle<()>> {
        let mut out = Vec::with_capacity(self.sources.len());
        for src in self.sources.drain(..) {
            let name = src.name();
            info!(target: "runtime.events", source = name, "spawning event source");
            out.push(src.spawn(tx.clone()));
        }
        out
    }
}

/// Producer that reads a fixed sequence of scaler files in order and feeds
/// their records into the pipeline channel.
///
/// Soft record problems (foreign type ids, bad magic) are skipped by the
/// reader and only counted here; once a file accumulates more than
/// `bad_record_cap` of them it is abandoned. Hard problems (framing damage,
/// truncation, I/O errors) abandon the file immediately since the reader
/// cannot resynchronize.
pub struct PayloadFileSource {
    files: Vec<PathBuf>,
    bad_record_cap: u64,
}

impl PayloadFileSource {
    pub fn new(files: Vec<PathBuf>, bad_record_cap: u64) -> Self {
        Self {
            files,
            bad_record_cap,
        }
    }

    /// Send helper: returns false when the consumer is gone.
    fn send(tx: &Sender<Event>, event: Event) -> bool {
        match tx.blocking_send(event) {
            Ok(()) => {
                CHANNEL_BLOCKING_SENDS.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                CHANNEL_SEND_FAILURES.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn run(self, tx: Sender<Event>) {
        for path in self.files {
            let mut reader = match PayloadReader::open(&path) {
                Ok(r) => r,
                Err(e) => {
                    warn!(target: "io.payload", file = %path.display(), error = %e, "payload_file_open_failed");
                    FILES_ABANDONED.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            if !Self::send(&tx, Event::FileOpened(path.clone())) {
                return;
            }

            let mut abandoned = false;
            loop {
                let skipped =
                    reader.counters().skipped_type + reader.counters().skipped_magic;
                if skipped > self.bad_record_cap {
                    warn!(
                        target: "io.payload",
                        file = %path.display(),
                        skipped,
                        cap = self.bad_record_cap,
                        "bad_record_cap_exceeded_abandoning_file"
                    );
                    abandoned = true;
                    break;
                }
                match reader.next() {
                    Some(Ok(payload)) => {
                        PAYLOADS_EMITTED.fetch_add(1, Ordering::Relaxed);
                        if !Self::send(&tx, Event::Payload(payload)) {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(
                            target: "io.payload",
                            file = %path.display(),
                            error = %e,
                            "payload_stream_error_abandoning_file"
                        );
                        abandoned = true;
                        break;
                    }
                    None => break,
                }
            }
            let skipped = reader.counters().skipped_type + reader.counters().skipped_magic;
            RECORDS_SKIPPED.fetch_add(skipped, Ordering::Relaxed);
            if abandoned {
                FILES_ABANDONED.fetch_add(1, Ordering::Relaxed);
            }
            if !Self::send(
                &tx,
                Event::FileClosed {
                    path: path.clone(),
                    abandoned,
                },
            ) {
                return;
            }
        }
        let _ = Self::send(&tx, Event::Eof);
    }
}

impl EventSource for PayloadFileSource {
    fn name(&self) -> &'static str {
        "payload_files"
    }

    fn spawn(self: Box<Self>, tx: Sender<Event>) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || {
            let this = *self;
            this.run(tx);
            info!(target: "io.payload", "payload_source_finished");
        })
    }
}
