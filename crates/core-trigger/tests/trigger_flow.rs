//! End-to-end trigger behavior on a reduced geometry: threshold candidates,
//! escalation-window replacement, fast-response firing, and cancellation.

use core_analysis::{AnalysisHandler, BaseBinSummary};
use core_config::AnalysisOptions;
use core_payload::time::TENTH_NS_PER_MS;
use core_trigger::{Candidate, TriggerMode, TriggerMonitor};

const NDOM: usize = 4;
const WINDOW_MS: u32 = 5_000;

fn options(binsizes: Vec<u32>, use_offsets: bool) -> AnalysisOptions {
    AnalysisOptions {
        binsizes,
        use_offsets,
        use_rebins: true,
        bg_leading_ms: 6_000,
        bg_trailing_ms: 6_000,
        excl_leading_ms: 1_500,
        excl_trailing_ms: 1_500,
        min_active_doms: 1,
        min_bkg_rate: 0.1,
        max_bkg_rate: 1.0e6,
        min_bkg_fano: -1.0,
        max_bkg_fano: 100.0,
        max_bkg_abs_skew: 1.5,
    }
}

fn push_bin(handler: &mut AnalysisHandler, counts: &[u16; NDOM]) -> BaseBinSummary {
    let mut summary = None;
    for col in 0..250u16 {
        let mut column = [0u16; NDOM];
        for (c, total) in counts.iter().enumerate() {
            if col < *total {
                column[c] = 1;
            }
        }
        if let Some(s) = handler.update(&column) {
            summary = Some(s);
        }
    }
    summary.expect("250 columns complete one base bin")
}

fn baseline(mean: u16, bin: u64) -> [u16; NDOM] {
    let mut out = [0u16; NDOM];
    for (c, slot) in out.iter_mut().enumerate() {
        let jitter = ((bin.wrapping_mul(2_654_435_761).wrapping_add(c as u64 * 97)) >> 3) % 5;
        *slot = mean + jitter as u16 - 2;
    }
    out
}

struct Run {
    handler: AnalysisHandler,
    monitor: TriggerMonitor,
    bin: u64,
}

impl Run {
    fn new(opts: AnalysisOptions, mode: TriggerMode) -> Self {
        let handler = AnalysisHandler::new(&opts, vec![1.0; NDOM]).unwrap();
        let monitor = TriggerMonitor::new(mode, WINDOW_MS, 500, handler.analyses().len());
        Self {
            handler,
            monitor,
            bin: 0,
        }
    }

    /// Feed one baseline (or excess) bin and collect finalized candidates.
    fn step(&mut self, extra: u16) -> Vec<Candidate> {
        let mut counts = baseline(100, self.bin);
        for v in &mut counts {
            *v += extra;
        }
        let summary = push_bin(&mut self.handler, &counts);
        self.bin += 1;
        self.monitor.observe(&self.handler, &summary)
    }

    fn settle(&mut self, bins: u64) -> Vec<Candidate> {
        let mut out = Vec::new();
        for _ in 0..bins {
            out.extend(self.step(0));
        }
        out
    }

    fn max_online(&self) -> u64 {
        self.handler
            .analyses()
            .iter()
            .map(|a| a.n_online())
            .max()
            .unwrap()
    }
}

#[test]
fn quiet_stream_never_triggers() {
    let mut run = Run::new(
        options(vec![500], false),
        TriggerMode::Threshold { threshold: 4.0 },
    );
    let online = run.max_online();
    let finalized = run.settle(online + 60);
    assert!(finalized.is_empty());
    assert_eq!(run.monitor.trigger_count(), 0);
    assert!(run.monitor.held().is_none());
}

#[test]
fn single_bin_excess_makes_one_finalized_candidate() {
    let mut run = Run::new(
        options(vec![500], false),
        TriggerMode::Threshold { threshold: 4.0 },
    );
    let online = run.max_online();
    assert!(run.settle(online + 20).is_empty());

    // One 500 ms bin with +50% across all channels.
    assert!(run.step(50).is_empty());

    let window_bins = (WINDOW_MS / 500) as u64;
    let lag = run.handler.analyses()[0].bins_above_search() as u64;
    let mut finalized = Vec::new();
    let mut held_seen = false;
    let mut last_held_xi = 0.0f64;
    for _ in 0..lag + window_bins + 4 {
        finalized.extend(run.step(0));
        if let Some(held) = run.monitor.held() {
            // While the window is open the held ξ never decreases.
            assert!(held.xi >= last_held_xi);
            last_held_xi = held.xi;
            held_seen = true;
        }
    }
    assert!(held_seen, "no candidate was ever held");
    assert_eq!(finalized.len(), 1);
    let cand = &finalized[0];
    assert_eq!(cand.binsize_ms, 500);
    assert_eq!(cand.offset_ms, 0);
    assert_eq!(cand.cand_no, 1);
    assert_eq!(cand.trigger_no, 1, "a single spike must not retrigger");
    assert!(cand.xi > 4.0);
    assert!(!cand.cancelled);
    // After finalization the machine is back to idle.
    assert!(run.monitor.held().is_none());
    assert!(run.settle(10).is_empty());
}

#[test]
fn longer_excess_ends_up_with_the_wider_binsize() {
    let mut run = Run::new(
        options(vec![500, 1_500], true),
        TriggerMode::Threshold { threshold: 4.0 },
    );
    let online = run.max_online();
    assert!(run.settle(online + 21).is_empty());

    // A 1.5 s excess: three consecutive base bins at +50%.
    for _ in 0..3 {
        assert!(run.step(50).is_empty());
    }

    let mut finalized = Vec::new();
    for _ in 0..80 {
        finalized.extend(run.step(0));
    }
    assert_eq!(finalized.len(), 1);
    let cand = &finalized[0];
    assert_eq!(
        cand.binsize_ms, 1_500,
        "the 1.5 s analysis integrates the whole excess and must win"
    );
    assert!(cand.xi > 4.0);
}

#[test]
fn fast_response_fires_every_containing_window_and_only_those() {
    let opts = options(vec![500, 1_500], true);
    let start_utime = 1_000_000 * TENTH_NS_PER_MS;
    let mut handler = AnalysisHandler::new(&opts, vec![1.0; NDOM]).unwrap();
    handler.set_start_utime(start_utime);
    let n_analyses = handler.analyses().len();
    let online = handler
        .analyses()
        .iter()
        .map(|a| a.n_online())
        .max()
        .unwrap();

    // External trigger time a little past the readiness point, inside a bin.
    let t_trigger = start_utime + (online + 6) * 500 * TENTH_NS_PER_MS + 123;
    let mut monitor = TriggerMonitor::new(
        TriggerMode::FastResponse { t_trigger },
        WINDOW_MS,
        500,
        n_analyses,
    );

    let mut finalized = Vec::new();
    let mut bin = 0u64;
    for _ in 0..online + 60 {
        let summary = push_bin(&mut handler, &baseline(100, bin));
        bin += 1;
        finalized.extend(monitor.observe(&handler, &summary));
    }

    // Every (binsize, offset) tiling contains the trigger time exactly once.
    assert_eq!(finalized.len(), n_analyses);
    for cand in &finalized {
        let width = cand.binsize_ms as u64 * TENTH_NS_PER_MS;
        assert!(
            cand.t_trigger - width < t_trigger && t_trigger <= cand.t_trigger,
            "search window ({}, {}] does not contain {t_trigger}",
            cand.t_trigger - width,
            cand.t_trigger
        );
    }
    let mut seen: Vec<(u32, u32)> = finalized
        .iter()
        .map(|c| (c.binsize_ms, c.offset_ms))
        .collect();
    seen.sort_unstable();
    assert_eq!(
        seen,
        vec![(500, 0), (1_500, 0), (1_500, 500), (1_500, 1_000)]
    );
}

#[test]
fn cancellation_drains_the_held_candidate() {
    let mut run = Run::new(
        options(vec![500], false),
        TriggerMode::Threshold { threshold: 4.0 },
    );
    let online = run.max_online();
    run.settle(online + 20);
    run.step(50);
    let lag = run.handler.analyses()[0].bins_above_search() as u64;
    run.settle(lag + 1);
    assert!(run.monitor.held().is_some(), "candidate should be open");

    let cand = run.monitor.force_close().expect("held candidate drains");
    assert!(cand.cancelled);
    assert_eq!(cand.cand_no, 1);
    assert!(run.monitor.held().is_none());
}
