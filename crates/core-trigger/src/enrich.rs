//! Candidate enrichment: ξ history snapshots, the qualified-channel
//! lightcurve read out of the base buffer, and muon-veto rate series.

use core_analysis::AnalysisHandler;
use core_config::LightcurveOptions;
use core_payload::time::TENTH_NS_PER_MS;
use core_payload::{MuonRateRecord, RateSeries};
use tracing::debug;

use crate::candidate::Candidate;

/// Summed hits over all qualified channels around the search window, at the
/// candidate's binsize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lightcurve {
    pub binsize_ms: u32,
    /// Width of the partial first bin: the leading duration modulo the
    /// binsize. Zero when the span tiles exactly.
    pub offset_ms: u32,
    /// Utime of the first (oldest, possibly partial) bin's lower edge.
    pub t_start: u64,
    pub data: Vec<u64>,
}

/// Build the lightcurve for one analysis from the handler's base buffer.
/// Returns `None` before the buffer covers the requested span.
pub fn build_lightcurve(
    handler: &AnalysisHandler,
    analysis_idx: usize,
    opts: &LightcurveOptions,
) -> Option<Lightcurve> {
    let ana = &handler.analyses()[analysis_idx];
    let geom = handler.geometry();
    let bin_udt = geom.bin_ms as u64 * TENTH_NS_PER_MS;

    let lead_bins = (opts.leading_ms / geom.bin_ms) as usize;
    let trail_bins = (opts.trailing_ms / geom.bin_ms) as usize;
    let search = ana.search_rows();
    let lo = search.start.checked_sub(trail_bins)?;
    let hi = search.end + lead_bins;
    if hi > geom.capacity {
        return None;
    }

    // Per-bin sums over the qualified mask only.
    let qualified = ana.qualified();
    let mut per_bin = Vec::with_capacity(hi - lo);
    for row in lo..hi {
        let mut sum = 0u64;
        for (c, &v) in handler.buffer().row(row).iter().enumerate() {
            if qualified[c] {
                sum += v;
            }
        }
        per_bin.push(sum);
    }

    // Rebin to the candidate binsize. Bins align to the search window, so a
    // leading duration that is not a multiple of the binsize leaves a partial
    // first bin; its width is reported as the offset.
    let r = ana.rebin();
    let rem = per_bin.len() % r;
    let mut data = Vec::with_capacity(per_bin.len() / r + 1);
    let mut i = 0;
    if rem > 0 {
        data.push(per_bin[..rem].iter().sum());
        i = rem;
    }
    while i < per_bin.len() {
        data.push(per_bin[i..i + r].iter().sum());
        i += r;
    }

    let frontier = handler.frontier_utime();
    let t_start = frontier.saturating_sub((geom.capacity - lo) as u64 * bin_udt);
    debug!(
        target: "trigger.enrich",
        analysis_idx,
        bins = data.len(),
        offset_ms = opts.leading_ms % ana.binsize_ms(),
        "lightcurve_built"
    );
    Some(Lightcurve {
        binsize_ms: ana.binsize_ms(),
        offset_ms: opts.leading_ms % ana.binsize_ms(),
        t_start,
        data,
    })
}

/// Attach the internally maintained series to a finalized candidate: the ξ
/// history of the winning analysis, the history of the base-binsize
/// (500 ms, offset 0) analysis when configured, and the lightcurve.
pub fn enrich_candidate(
    cand: &mut Candidate,
    handler: &AnalysisHandler,
    lightcurve: &LightcurveOptions,
) {
    cand.xi_hist = handler.history(cand.analysis_idx).snapshot();
    // Direct equality lookup on the configured binsize set.
    cand.xi_hist_base = handler
        .analyses()
        .iter()
        .position(|a| a.binsize_ms() == 500 && a.offset_ms() == 0)
        .map(|idx| handler.history(idx).snapshot())
        .unwrap_or_default();
    cand.lightcurve = build_lightcurve(handler, cand.analysis_idx, lightcurve);
}

/// Fold a muon record stream into the two series carried by a candidate:
/// trigger-binsize and base-binsize, both spanning
/// [t_trigger - bg_trailing, t_trigger + bg_leading].
pub fn attach_muon_series(
    cand: &mut Candidate,
    records: &[MuonRateRecord],
    bg_trailing_ms: u32,
    bg_leading_ms: u32,
) {
    let t_lo = cand
        .t_trigger
        .saturating_sub(bg_trailing_ms as u64 * TENTH_NS_PER_MS);
    let t_hi = cand.t_trigger + bg_leading_ms as u64 * TENTH_NS_PER_MS;
    cand.rmu_trigger = Some(RateSeries::from_records(
        records,
        t_lo,
        t_hi,
        cand.binsize_ms,
    ));
    cand.rmu_base = Some(RateSeries::from_records(records, t_lo, t_hi, 500));
}
