//! The engine driver: a single-threaded cooperative pipeline driven by
//! payload arrival. One producer task reads scaler files into the bounded
//! event channel; this loop is the only mutator of the staging buffer, the
//! base buffer, the analysis bank, and the trigger state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use core_analysis::AnalysisHandler;
use core_config::Config;
use core_detector::Detector;
use core_events::{EVENT_CHANNEL_CAP, Event, EventSourceRegistry, PayloadFileSource};
use core_files::FileManager;
use core_payload::{MuonRateReader, SnPayload};
use core_rebin::Rebinner;
use core_sink::{FraStatus, LightcurvePayload, MoniMessage, SinkHandle};
use core_trigger::{
    Candidate, TriggerMode, TriggerMonitor, attach_muon_series, enrich_candidate, matched_levels,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Cooperative cancellation flag, observed between payloads.
pub type CancelFlag = Arc<AtomicBool>;

/// One processing request, assembled by the CLI layer.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub request_id: String,
    pub config: Config,
    pub mode: TriggerMode,
    pub start_utime: Option<u64>,
    pub stop_utime: Option<u64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineReport {
    pub payloads: u64,
    pub unknown_dom: u64,
    pub regressions: u64,
    pub base_bins: u64,
    pub candidates: u32,
    pub cancelled: bool,
}

/// Run one request end to end, publishing lifecycle status and results to
/// the sink. Errors reaching the caller have already been published as FAIL.
pub async fn run_request(
    request: RunRequest,
    sink: SinkHandle,
    cancel: CancelFlag,
) -> Result<EngineReport> {
    sink.publish(MoniMessage::info(core_sink::status_value(
        &request.request_id,
        FraStatus::Queued,
    )));
    match run_inner(&request, &sink, &cancel).await {
        Ok(report) => {
            info!(
                target: "runtime",
                request_id = request.request_id.as_str(),
                payloads = report.payloads,
                base_bins = report.base_bins,
                candidates = report.candidates,
                cancelled = report.cancelled,
                "request_complete"
            );
            Ok(report)
        }
        Err(e) => {
            sink.publish(MoniMessage::error(serde_json::json!({
                "request_id": request.request_id,
                "err_msg": format!("{e:#}"),
            })));
            sink.publish(MoniMessage::info(core_sink::status_value(
                &request.request_id,
                FraStatus::Fail,
            )));
            Err(e)
        }
    }
}

async fn run_inner(
    request: &RunRequest,
    sink: &SinkHandle,
    cancel: &CancelFlag,
) -> Result<EngineReport> {
    let config = &request.config;
    let detector = Detector::from_file(&config.filesystem.dom_table)
        .context("loading the DOM table")?;
    let handler = AnalysisHandler::new(&config.analysis, detector.eps())
        .context("constructing the analysis bank")?;
    let monitor = TriggerMonitor::new(
        request.mode,
        config.trigger.window_ms,
        config.analysis.analysis_binsize_ms(),
        handler.analyses().len(),
    );
    let rebinner = Rebinner::new(detector.ndom()).context("constructing the staging buffer")?;
    let mut files = FileManager::new(&config.filesystem);

    let scaler_files = files
        .scaler_files(request.start_utime, request.stop_utime)
        .context("listing scaler files")?;
    if scaler_files.is_empty() {
        bail!("no scaler files cover the requested interval");
    }

    let (tx, mut rx) = mpsc::channel::<Event>(EVENT_CHANNEL_CAP);
    let mut registry = EventSourceRegistry::new();
    registry.register(PayloadFileSource::new(
        scaler_files.iter().map(|f| f.path.clone()).collect(),
        config.filesystem.bad_record_cap,
    ));
    let source_handles = registry.spawn_all(&tx);
    drop(tx);

    sink.publish(MoniMessage::info(core_sink::status_value(
        &request.request_id,
        FraStatus::InProgress,
    )));

    let mut pipeline = Pipeline {
        config,
        handler,
        monitor,
        rebinner,
        sink,
        request_id: &request.request_id,
        stop_utime: request.stop_utime,
        column: vec![0u16; detector.ndom()],
        payloads_per_channel: vec![0u64; detector.ndom()],
        last_payload_utime: None,
        staged_until: 0,
        report: EngineReport::default(),
        detector,
        muon_files: FileManager::new(&config.filesystem),
    };

    'events: while let Some(event) = rx.recv().await {
        if cancel.load(Ordering::Relaxed) {
            pipeline.report.cancelled = true;
            break 'events;
        }
        match event {
            Event::Payload(payload) => {
                if !pipeline.ingest(&payload)? {
                    break 'events;
                }
            }
            Event::FileOpened(path) => {
                debug!(target: "runtime", file = %path.display(), "processing_file");
                // Regression detection restarts per file.
                pipeline.last_payload_utime = None;
            }
            Event::FileClosed { path, abandoned } => {
                if !abandoned && config.filesystem.rotate_processed {
                    files.mark_processed(path);
                }
            }
            Event::Eof | Event::Shutdown => break 'events,
        }
    }
    rx.close();

    if pipeline.report.cancelled {
        // Forced close: the held candidate (if any) is finalized and
        // published with the cancelled marker before resources go away.
        if let Some(cand) = pipeline.monitor.force_close() {
            pipeline.publish_candidate(cand)?;
        }
        sink.publish(MoniMessage::error(serde_json::json!({
            "request_id": request.request_id,
            "err_msg": "cancelled",
        })));
    } else {
        pipeline.drain()?;
    }

    for handle in source_handles {
        let _ = handle.await;
    }
    if config.filesystem.rotate_processed {
        let rotated = files.flush_processed().context("rotating processed files")?;
        info!(target: "io.files", rotated, "processed_files_rotated");
    }

    let report = pipeline.finish()?;
    let status = if report.cancelled {
        FraStatus::Fail
    } else {
        FraStatus::Success
    };
    sink.publish(MoniMessage::info(core_sink::status_value(
        &request.request_id,
        status,
    )));
    Ok(report)
}

struct Pipeline<'a> {
    config: &'a Config,
    detector: Detector,
    handler: AnalysisHandler,
    monitor: TriggerMonitor,
    rebinner: Rebinner,
    sink: &'a SinkHandle,
    request_id: &'a str,
    stop_utime: Option<u64>,
    /// Scratch for front-column reads.
    column: Vec<u16>,
    /// Records folded per channel, for the end-of-run accounting.
    payloads_per_channel: Vec<u64>,
    last_payload_utime: Option<u64>,
    /// Upper bound of deposited data; the drain consumes up to here.
    staged_until: u64,
    report: EngineReport,
    muon_files: FileManager,
}

impl Pipeline<'_> {
    /// Feed one payload. Returns false when the requested interval has been
    /// fully consumed.
    fn ingest(&mut self, payload: &SnPayload) -> Result<bool> {
        if let Some(stop) = self.stop_utime
            && payload.utime > stop
        {
            info!(target: "runtime", utime = payload.utime, "stop_time_reached");
            return Ok(false);
        }
        let Some(channel) = self.detector.dom_index(payload.dom_id) else {
            self.report.unknown_dom += 1;
            return Ok(true);
        };
        if let Some(last) = self.last_payload_utime
            && payload.utime < last
        {
            self.report.regressions += 1;
            warn!(
                target: "rebin",
                utime = payload.utime,
                last,
                "timestamp_regression_payload_dropped"
            );
            return Ok(true);
        }
        self.last_payload_utime = Some(payload.utime);
        self.report.payloads += 1;

        if !self.rebinner.started() {
            self.rebinner.start(payload.utime);
            self.handler.set_start_utime(payload.utime);
            info!(target: "runtime", start_utime = payload.utime, "staging_clock_started");
        }

        // The front column is complete once the (time-ordered) payload
        // stream has moved past it; a gap simply flushes zero columns
        // through the pipeline.
        while payload.utime >= self.rebinner.column_start(1).expect("rebinner started") {
            self.consume_front_column()?;
        }
        self.rebinner.deposit(channel, payload)?;
        self.payloads_per_channel[channel] += 1;
        self.staged_until = self.staged_until.max(payload.end_utime());
        Ok(true)
    }

    fn consume_front_column(&mut self) -> Result<()> {
        let mut column = std::mem::take(&mut self.column);
        self.rebinner.pop_front(&mut column)?;
        let summary = self.handler.update(&column);
        self.column = column;

        if let Some(summary) = summary {
            self.report.base_bins = summary.n_seen;
            let finalized = self.monitor.observe(&self.handler, &summary);
            for cand in finalized {
                self.publish_candidate(cand)?;
            }
        }
        Ok(())
    }

    /// Consume the staging backlog after the input ends.
    fn drain(&mut self) -> Result<()> {
        if !self.rebinner.started() {
            return Ok(());
        }
        while self.rebinner.column_start(0).expect("rebinner started") < self.staged_until {
            self.consume_front_column()?;
        }
        Ok(())
    }

    fn publish_candidate(&mut self, mut cand: Candidate) -> Result<()> {
        enrich_candidate(&mut cand, &self.handler, &self.config.lightcurve);
        self.attach_muon(&mut cand);
        for level in matched_levels(cand.xi, cand.xi_corr) {
            info!(
                target: "trigger.levels",
                level = level.name,
                xi = cand.xi,
                xi_corr = cand.xi_corr,
                cand_no = cand.cand_no,
                "trigger_level_passed"
            );
        }
        self.report.candidates += 1;
        self.sink
            .publish(MoniMessage::info(serde_json::json!({
                "request_id": self.request_id,
                "candidate": core_sink::candidate_value(&cand),
            })));
        Ok(())
    }

    /// Muon series are best-effort: a missing directory or unreadable file
    /// degrades the candidate, never the run.
    fn attach_muon(&mut self, cand: &mut Candidate) {
        let around = match self.muon_files.muon_files_around(cand.t_trigger, 6, 6) {
            Ok(files) => files,
            Err(e) => {
                warn!(target: "io.muon", error = %e, "muon_file_listing_failed");
                return;
            }
        };
        if around.is_empty() {
            return;
        }
        let mut records = Vec::new();
        for file in around {
            match MuonRateReader::open(&file.path).and_then(|mut r| r.read_all()) {
                Ok(mut recs) => records.append(&mut recs),
                Err(e) => {
                    warn!(target: "io.muon", file = %file.path.display(), error = %e, "muon_file_unreadable");
                }
            }
        }
        attach_muon_series(
            cand,
            &records,
            self.config.analysis.bg_trailing_ms,
            self.config.analysis.bg_leading_ms,
        );
    }

    /// Final result: the freshest ξ and a lightcurve per configured binsize.
    fn finish(&mut self) -> Result<EngineReport> {
        let mut xi = BTreeMap::new();
        let mut lightcurve = BTreeMap::new();
        for (idx, ana) in self.handler.analyses().iter().enumerate() {
            if ana.offset_ms() != 0 {
                continue;
            }
            xi.insert(ana.binsize_ms(), ana.xi());
            if let Some(lc) =
                core_trigger::build_lightcurve(&self.handler, idx, &self.config.lightcurve)
            {
                lightcurve.insert(
                    ana.binsize_ms(),
                    LightcurvePayload {
                        data: lc.data,
                        offset_ms: lc.offset_ms,
                    },
                );
            }
        }
        let status = if self.report.cancelled {
            FraStatus::Fail
        } else {
            FraStatus::Success
        };
        let value = core_sink::result_value(
            self.request_id,
            status,
            &xi,
            &lightcurve,
            serde_json::json!({
                "payloads": self.report.payloads,
                "payloads_per_channel_min": self.payloads_per_channel.iter().min(),
                "payloads_per_channel_max": self.payloads_per_channel.iter().max(),
                "base_bins": self.report.base_bins,
                "candidates": self.report.candidates,
                "unknown_dom": self.report.unknown_dom,
                "regressions": self.report.regressions,
                "cancelled": self.report.cancelled,
            }),
        );
        self.sink.publish(MoniMessage::info(value));
        Ok(self.report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_config::{AnalysisOptions, FilesystemOptions, TriggerOptions};
    use core_payload::encode_payload;
    use core_payload::time::{SCALER_UDT, TENTH_NS_PER_MS};
    use core_sink::spawn_memory_sink;
    use std::fs;
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;

    const NDOM: usize = 4;
    const TICKS_PER_PAYLOAD: usize = 64;
    const DOM_IDS: [u64; NDOM] = [0xa1, 0xa2, 0xa3, 0xa4];

    fn write_dom_table(path: &Path) {
        let mut f = fs::File::create(path).unwrap();
        for (i, id) in DOM_IDS.iter().enumerate() {
            writeln!(f, "1 {} 0.0 0.0 {} {:x} i3 1.0", i + 1, -10.0 * i as f64, id).unwrap();
        }
    }

    fn tick_count(channel: usize, tick: u64, boosted: bool) -> u8 {
        let seed = tick
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(channel as u64 * 1_442_695_040_888_963_407);
        let base = ((seed >> 33) % 4) as u8;
        if boosted { base + 2 } else { base }
    }

    /// One scaler file: payloads for every channel in time order, covering
    /// `seconds` of detector time, with an optional boosted interval.
    fn write_scaler_file(dir: &Path, t0: u64, seconds: u64, boost: Option<(u64, u64)>) {
        let t1 = t0 + seconds * 10_000_000_000;
        let name = format!("sn_1_1_{}_{}.dat", t0 / 1_000_000, t1 / 1_000_000);
        let mut f = fs::File::create(dir.join(name)).unwrap();
        let span = TICKS_PER_PAYLOAD as u64 * SCALER_UDT;
        let n_payloads = seconds * 10_000_000_000 / span;
        for n in 0..n_payloads {
            let utime = t0 + n * span;
            for (channel, dom_id) in DOM_IDS.iter().enumerate() {
                let scalers: Vec<u8> = (0..TICKS_PER_PAYLOAD as u64)
                    .map(|k| {
                        let tick_utime = utime + k * SCALER_UDT;
                        let boosted = boost
                            .map(|(lo, hi)| tick_utime >= lo && tick_utime < hi)
                            .unwrap_or(false);
                        tick_count(channel, n * TICKS_PER_PAYLOAD as u64 + k, boosted)
                    })
                    .collect();
                let payload = SnPayload {
                    utime,
                    dom_id: *dom_id,
                    domclock: 0,
                    scalers,
                };
                f.write_all(&encode_payload(&payload)).unwrap();
            }
        }
        f.flush().unwrap();
    }

    fn test_config(tmp: &TempDir) -> Config {
        let dir_scaler = tmp.path().join("scaler");
        let dom_table = tmp.path().join("dom_table.txt");
        fs::create_dir_all(&dir_scaler).unwrap();
        write_dom_table(&dom_table);
        let mut config = Config {
            analysis: AnalysisOptions {
                binsizes: vec![500],
                use_offsets: false,
                bg_leading_ms: 4_000,
                bg_trailing_ms: 4_000,
                excl_leading_ms: 1_000,
                excl_trailing_ms: 1_000,
                min_active_doms: 1,
                min_bkg_rate: 1.0,
                max_bkg_rate: 1.0e6,
                min_bkg_fano: -1.0,
                max_bkg_fano: 1.0e6,
                ..AnalysisOptions::default()
            },
            trigger: TriggerOptions {
                threshold: 4.0,
                window_ms: 5_000,
            },
            filesystem: FilesystemOptions {
                dir_scaler,
                dir_scaler_bkp: tmp.path().join("scaler_bkp"),
                dir_muon: tmp.path().join("muon"),
                dir_muon_bkp: tmp.path().join("muon_bkp"),
                dom_table,
                ..FilesystemOptions::default()
            },
            ..Config::default()
        };
        config.validate().unwrap();
        config
    }

    fn request(config: Config, mode: TriggerMode) -> RunRequest {
        RunRequest {
            request_id: "req-test".to_string(),
            config,
            mode,
            start_utime: None,
            stop_utime: None,
        }
    }

    fn statuses(messages: &[MoniMessage]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|m| m.value.get("status"))
            .filter_map(|s| s.as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn quiet_run_publishes_success_and_no_candidates() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let t0 = 1_000_000 * TENTH_NS_PER_MS;
        write_scaler_file(&config.filesystem.dir_scaler, t0, 20, None);

        let (sink, captured, task) = spawn_memory_sink(256);
        let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
        let report = run_request(
            request(config, TriggerMode::Threshold { threshold: 4.0 }),
            sink.clone(),
            cancel,
        )
        .await
        .unwrap();

        assert!(report.payloads > 0);
        assert!(report.base_bins > 25, "only {} base bins", report.base_bins);
        assert_eq!(report.candidates, 0);
        assert_eq!(report.unknown_dom, 0);

        drop(sink);
        task.await.unwrap();
        let messages = captured.lock().unwrap();
        let seen = statuses(&messages);
        assert_eq!(seen.first().map(String::as_str), Some("QUEUED"));
        assert!(seen.iter().any(|s| s == "IN PROGRESS"));
        assert_eq!(seen.last().map(String::as_str), Some("SUCCESS"));
        // The final result carries a xi entry for the configured binsize.
        let result = messages
            .iter()
            .rev()
            .find(|m| m.value.get("xi").is_some())
            .expect("result message present");
        assert!(result.value["xi"]["500"].is_number());
    }

    #[tokio::test]
    async fn burst_run_finalizes_a_candidate() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let t0 = 1_000_000 * TENTH_NS_PER_MS;
        // 15 s of baseline, then 1 s of boosted counts, then enough tail for
        // the lag and the escalation window.
        let boost_lo = t0 + 15 * 10_000_000_000;
        let boost_hi = boost_lo + 10_000_000_000;
        write_scaler_file(
            &config.filesystem.dir_scaler,
            t0,
            32,
            Some((boost_lo, boost_hi)),
        );

        let (sink, captured, task) = spawn_memory_sink(256);
        let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
        let report = run_request(
            request(config, TriggerMode::Threshold { threshold: 4.0 }),
            sink.clone(),
            cancel,
        )
        .await
        .unwrap();

        assert!(report.candidates >= 1, "no candidate finalized");

        drop(sink);
        task.await.unwrap();
        let messages = captured.lock().unwrap();
        let cand = messages
            .iter()
            .find(|m| m.value.get("candidate").is_some())
            .expect("candidate message present");
        let value = &cand.value["candidate"];
        assert_eq!(value["binsize_ms"], 500);
        assert!(value["xi"].as_f64().unwrap() > 4.0);
        // The trigger labels the boosted data time.
        let t_trigger = value["t_trigger"].as_u64().unwrap();
        assert!(
            t_trigger >= boost_lo && t_trigger <= boost_hi + 10_000_000_000,
            "trigger time {t_trigger} outside the boosted interval"
        );
        assert_eq!(statuses(&messages).last().map(String::as_str), Some("SUCCESS"));
    }

    #[tokio::test]
    async fn reruns_are_bit_identical() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let t0 = 1_000_000 * TENTH_NS_PER_MS;
        let boost_lo = t0 + 15 * 10_000_000_000;
        write_scaler_file(
            &config.filesystem.dir_scaler,
            t0,
            32,
            Some((boost_lo, boost_lo + 10_000_000_000)),
        );

        let mut runs = Vec::new();
        for _ in 0..2 {
            let (sink, captured, task) = spawn_memory_sink(256);
            let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
            let report = run_request(
                request(config.clone(), TriggerMode::Threshold { threshold: 4.0 }),
                sink.clone(),
                cancel,
            )
            .await
            .unwrap();
            drop(sink);
            task.await.unwrap();
            let xi: Vec<String> = captured
                .lock()
                .unwrap()
                .iter()
                .filter_map(|m| m.value.get("candidate").cloned())
                .map(|c| c["xi"].to_string())
                .collect();
            runs.push((report, xi));
        }
        assert_eq!(runs[0].0, runs[1].0);
        assert_eq!(runs[0].1, runs[1].1);
        assert!(!runs[0].1.is_empty());
    }

    #[tokio::test]
    async fn unknown_dom_payloads_are_skipped_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let t0 = 1_000_000 * TENTH_NS_PER_MS;
        // A file that opens with a payload from an unmapped DOM.
        let foreign = SnPayload {
            utime: t0,
            dom_id: 0xdead,
            domclock: 0,
            scalers: vec![1; 8],
        };
        let name = "sn_1_0_0_1.dat";
        fs::write(
            config.filesystem.dir_scaler.join(name),
            encode_payload(&foreign),
        )
        .unwrap();
        write_scaler_file(&config.filesystem.dir_scaler, t0, 12, None);

        let (sink, _captured, task) = spawn_memory_sink(256);
        let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
        let report = run_request(
            request(config, TriggerMode::Threshold { threshold: 4.0 }),
            sink.clone(),
            cancel,
        )
        .await
        .unwrap();
        assert_eq!(report.unknown_dom, 1);
        assert!(report.payloads > 0);
        drop(sink);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_publishes_fail_with_marker() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let t0 = 1_000_000 * TENTH_NS_PER_MS;
        write_scaler_file(&config.filesystem.dir_scaler, t0, 8, None);

        let (sink, captured, task) = spawn_memory_sink(256);
        // Pre-set: the engine observes the flag on the first event.
        let cancel: CancelFlag = Arc::new(AtomicBool::new(true));
        let report = run_request(
            request(config, TriggerMode::Threshold { threshold: 4.0 }),
            sink.clone(),
            cancel,
        )
        .await
        .unwrap();
        assert!(report.cancelled);

        drop(sink);
        task.await.unwrap();
        let messages = captured.lock().unwrap();
        assert_eq!(statuses(&messages).last().map(String::as_str), Some("FAIL"));
        assert!(
            messages
                .iter()
                .any(|m| m.value.get("err_msg").map(|e| e == "cancelled").unwrap_or(false)),
            "cancellation marker missing"
        );
    }
}

