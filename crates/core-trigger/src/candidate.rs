//! Candidate container: a snapshot of one analysis at trigger time, plus the
//! series attached at finalization.

use core_analysis::Analysis;
use core_payload::RateSeries;

use crate::enrich::Lightcurve;

/// One supernova candidate. Created on the first threshold crossing, possibly
/// replaced while the escalation window is open, enriched and published once
/// the window closes, then dropped.
#[derive(Debug, Clone, Default)]
pub struct Candidate {
    pub xi: f64,
    /// Muon-corrected ξ. The correction is applied downstream; until then it
    /// mirrors the uncorrected value.
    pub xi_corr: f64,
    pub chi2: f64,
    /// Utime of the search-window upper edge that fired.
    pub t_trigger: u64,
    pub binsize_ms: u32,
    pub offset_ms: u32,
    /// Trigger ordinal within this candidate.
    pub trigger_no: u32,
    /// Candidate ordinal within the run.
    pub cand_no: u32,
    /// Index of the winning analysis in the handler's bank.
    pub analysis_idx: usize,
    /// Set when the run was cancelled while the window was open.
    pub cancelled: bool,

    // Attached at finalization.
    pub xi_hist: Vec<f64>,
    pub xi_hist_base: Vec<f64>,
    pub lightcurve: Option<Lightcurve>,
    pub rmu_trigger: Option<RateSeries>,
    pub rmu_base: Option<RateSeries>,
}

impl Candidate {
    pub fn from_analysis(
        analysis_idx: usize,
        analysis: &Analysis,
        trigger_no: u32,
        cand_no: u32,
    ) -> Self {
        Self {
            xi: analysis.xi(),
            xi_corr: analysis.xi(),
            chi2: analysis.chi2(),
            t_trigger: analysis.utime_sw(),
            binsize_ms: analysis.binsize_ms(),
            offset_ms: analysis.offset_ms(),
            trigger_no,
            cand_no,
            analysis_idx,
            cancelled: false,
            xi_hist: Vec::new(),
            xi_hist_base: Vec::new(),
            lightcurve: None,
            rmu_trigger: None,
            rmu_base: None,
        }
    }
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "candidate {:>3}, trigger {:>3}: xi={:5.3} in {:.1} s (+{:.1} s) analysis @ {}",
            self.cand_no,
            self.trigger_no,
            self.xi,
            self.binsize_ms as f64 / 1e3,
            self.offset_ms as f64 / 1e3,
            self.t_trigger
        )
    }
}
