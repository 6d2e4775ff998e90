//! The trigger state machine shared by the online and fast-response
//! variants.

use core_analysis::{AnalysisHandler, BaseBinSummary};
use core_payload::time::TENTH_NS_PER_MS;
use tracing::{debug, info};

use crate::candidate::Candidate;

/// Variant selector, fixed at engine start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriggerMode {
    /// Online operation: open and extend an escalation window on primary
    /// threshold crossings.
    Threshold { threshold: f64 },
    /// Fast-response: fire exactly for analyses whose search window contains
    /// the externally supplied trigger time, finalizing immediately.
    FastResponse { t_trigger: u64 },
}

pub struct TriggerMonitor {
    mode: TriggerMode,
    /// Escalation window length in base bins.
    window_bins: u64,
    candidate: Option<Candidate>,
    /// Bin index at which the window closes; open while `n_seen <= close_at`.
    close_at: Option<u64>,
    trigger_count: u32,
    cand_count: u32,
    /// Fast-response: analyses that already fired. Containment is
    /// once-per-analysis, the latch just makes that explicit.
    fired: Vec<bool>,
}

impl TriggerMonitor {
    pub fn new(mode: TriggerMode, window_ms: u32, bin_ms: u32, n_analyses: usize) -> Self {
        Self {
            mode,
            window_bins: (window_ms / bin_ms) as u64,
            candidate: None,
            close_at: None,
            trigger_count: 0,
            cand_count: 0,
            fired: vec![false; n_analyses],
        }
    }

    pub fn mode(&self) -> TriggerMode {
        self.mode
    }

    pub fn trigger_count(&self) -> u32 {
        self.trigger_count
    }

    pub fn cand_count(&self) -> u32 {
        self.cand_count
    }

    pub fn window_open(&self, n_seen: u64) -> bool {
        matches!(self.close_at, Some(close) if n_seen <= close)
    }

    pub fn held(&self) -> Option<&Candidate> {
        self.candidate.as_ref()
    }

    /// Process one completed base bin. Returns candidates finalized on this
    /// cycle (at most one in threshold mode; possibly several in
    /// fast-response mode).
    pub fn observe(
        &mut self,
        handler: &AnalysisHandler,
        summary: &BaseBinSummary,
    ) -> Vec<Candidate> {
        match self.mode {
            TriggerMode::Threshold { threshold } => self.observe_threshold(handler, summary, threshold),
            TriggerMode::FastResponse { t_trigger } => {
                self.observe_fast_response(handler, summary, t_trigger)
            }
        }
    }

    fn observe_threshold(
        &mut self,
        handler: &AnalysisHandler,
        summary: &BaseBinSummary,
        threshold: f64,
    ) -> Vec<Candidate> {
        let n = summary.n_seen;
        let mut finalized = Vec::new();

        // A window that closed on an earlier bin finalizes before any fresh
        // trigger can open a new candidate.
        if let Some(close) = self.close_at
            && n > close
            && let Some(mut cand) = self.candidate.take()
        {
            self.close_at = None;
            self.trigger_count = 0;
            self.cand_count += 1;
            cand.cand_no = self.cand_count;
            info!(target: "trigger", %cand, "candidate_finalized");
            finalized.push(cand);
        }

        // Highest fresh ξ among triggerable analyses at or above threshold.
        let mut best: Option<usize> = None;
        for &idx in &summary.evaluated {
            if !handler.triggerable(idx, summary) {
                continue;
            }
            let xi = handler.analyses()[idx].xi();
            if xi < threshold {
                continue;
            }
            if best.is_none_or(|b| xi > handler.analyses()[b].xi()) {
                best = Some(idx);
            }
        }

        if let Some(idx) = best {
            let xi = handler.analyses()[idx].xi();
            let held_xi = self.candidate.as_ref().map_or(0.0, |c| c.xi);
            // Replacement requires a strictly higher ξ; the countdown resets
            // unconditionally on every accepted trigger.
            if xi > held_xi {
                self.trigger_count += 1;
                let cand = Candidate::from_analysis(
                    idx,
                    &handler.analyses()[idx],
                    self.trigger_count,
                    self.cand_count + 1,
                );
                debug!(
                    target: "trigger",
                    xi,
                    held_xi,
                    binsize_ms = cand.binsize_ms,
                    offset_ms = cand.offset_ms,
                    trigger_no = cand.trigger_no,
                    "trigger_accepted"
                );
                self.candidate = Some(cand);
                self.close_at = Some(n + self.window_bins);
            }
        }

        finalized
    }

    fn observe_fast_response(
        &mut self,
        handler: &AnalysisHandler,
        summary: &BaseBinSummary,
        t_trigger: u64,
    ) -> Vec<Candidate> {
        let mut finalized = Vec::new();
        for &idx in &summary.evaluated {
            if self.fired[idx] || !handler.triggerable(idx, summary) {
                continue;
            }
            let ana = &handler.analyses()[idx];
            let upper = ana.utime_sw();
            let lower = upper.saturating_sub(ana.binsize_ms() as u64 * TENTH_NS_PER_MS);
            // Half-open from below: (upper - B, upper].
            if t_trigger <= lower || t_trigger > upper {
                continue;
            }
            self.fired[idx] = true;
            self.trigger_count += 1;
            self.cand_count += 1;
            let cand = Candidate::from_analysis(idx, ana, self.trigger_count, self.cand_count);
            info!(target: "trigger", %cand, "fast_response_candidate");
            // The window closes on the same cycle; nothing is held.
            self.close_at = Some(summary.n_seen);
            finalized.push(cand);
        }
        finalized
    }

    /// Cancellation path: force the window shut and surface the held
    /// candidate, marked cancelled.
    pub fn force_close(&mut self) -> Option<Candidate> {
        self.close_at = None;
        self.trigger_count = 0;
        self.candidate.take().map(|mut cand| {
            self.cand_count += 1;
            cand.cand_no = self.cand_count;
            cand.cancelled = true;
            info!(target: "trigger", %cand, "candidate_finalized_on_cancel");
            cand
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_bins_follow_configuration() {
        let m = TriggerMonitor::new(TriggerMode::Threshold { threshold: 4.0 }, 30_000, 500, 3);
        assert_eq!(m.window_bins, 60);
        assert!(!m.window_open(0));
    }

    #[test]
    fn force_close_without_candidate_is_none() {
        let mut m = TriggerMonitor::new(TriggerMode::Threshold { threshold: 4.0 }, 30_000, 500, 1);
        assert!(m.force_close().is_none());
        assert_eq!(m.cand_count(), 0);
    }
}
