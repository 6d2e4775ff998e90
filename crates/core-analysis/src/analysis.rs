//! One configured (binsize, offset) sliding-window estimator.
//!
//! Region order in the base buffer, from logical row 0 (oldest) to the
//! newest edge: trailing background, trailing exclusion, search window,
//! leading exclusion, leading background. An analysis with offset O sits O
//! deeper than the newest edge, so offsets of one binsize cover staggered
//! search grids. All indices are fixed at construction; the data slides
//! underneath them.

use core_buffer::WindowBuffer;
use core_config::AnalysisOptions;
use tracing::trace;

use crate::AnalysisError;

/// Buffer geometry shared by every analysis in a bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGeometry {
    /// Width of one analysis bin in ms (500 rebinned, 2 raw).
    pub bin_ms: u32,
    /// Base-buffer logical capacity in bins.
    pub capacity: usize,
    pub n_bg_trailing: usize,
    pub n_excl_trailing: usize,
    pub n_excl_leading: usize,
    pub n_bg_leading: usize,
}

impl WindowGeometry {
    /// Capacity holds both backgrounds, both exclusions, every search window
    /// with its largest offset, and one extra max-binsize of slack for the
    /// subtraction edges.
    pub fn from_options(opts: &AnalysisOptions) -> Self {
        let l = opts.analysis_binsize_ms();
        let nosearch = opts.duration_nosearch_ms();
        let capacity = (nosearch + 3 * opts.max_binsize_ms()).div_ceil(l) as usize - 1;
        Self {
            bin_ms: l,
            capacity,
            n_bg_trailing: (opts.bg_trailing_ms / l) as usize,
            n_excl_trailing: (opts.excl_trailing_ms / l) as usize,
            n_excl_leading: (opts.excl_leading_ms / l) as usize,
            n_bg_leading: (opts.bg_leading_ms / l) as usize,
        }
    }

    /// Height of the non-search regions in bins.
    pub fn nosearch_bins(&self) -> usize {
        self.n_bg_trailing + self.n_excl_trailing + self.n_excl_leading + self.n_bg_leading
    }
}

/// Channel-qualification bounds, rate bounds in Hz.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualBounds {
    pub min_rate_hz: f64,
    pub max_rate_hz: f64,
    pub min_fano: f64,
    pub max_fano: f64,
}

impl QualBounds {
    pub fn from_options(opts: &AnalysisOptions) -> Self {
        Self {
            min_rate_hz: opts.min_bkg_rate,
            max_rate_hz: opts.max_bkg_rate,
            min_fano: opts.min_bkg_fano,
            max_fano: opts.max_bkg_fano,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Analysis {
    binsize_ms: u32,
    offset_ms: u32,
    /// R: base bins per search-window step.
    rebin: usize,
    /// Background bins in search-binsize units.
    nbin_bg: u64,
    /// Bins that must have arrived before the first valid evaluation.
    n_online: u64,
    // Region start rows; `idx_end` is one past the leading background.
    idx_bg_trailing: usize,
    idx_excl_trailing: usize,
    idx_search: usize,
    idx_excl_leading: usize,
    idx_bg_leading: usize,
    idx_end: usize,
    bins_above_search: usize,

    sum_bg: Vec<u64>,
    sum_bg_sq: Vec<u64>,
    sum_sw: Vec<u64>,
    qualified: Vec<bool>,
    ndom_active: usize,
    toggled_last_update: u32,

    n_since_eval: u32,
    dmu: f64,
    var_dmu: f64,
    xi: f64,
    chi2: f64,
    utime_sw: u64,
}

impl Analysis {
    pub fn new(
        binsize_ms: u32,
        offset_ms: u32,
        geom: &WindowGeometry,
        ndom: usize,
    ) -> Result<Self, AnalysisError> {
        let l = geom.bin_ms;
        if binsize_ms == 0 || binsize_ms % l != 0 {
            return Err(AnalysisError::BadBinsize(binsize_ms));
        }
        if offset_ms % l != 0 || offset_ms >= binsize_ms {
            return Err(AnalysisError::BadOffset {
                offset: offset_ms,
                binsize: binsize_ms,
            });
        }
        let bg_ms = (geom.n_bg_trailing + geom.n_bg_leading) as u64 * l as u64;
        if bg_ms % binsize_ms as u64 != 0 {
            return Err(AnalysisError::IndivisibleBackground(binsize_ms));
        }

        let rebin = (binsize_ms / l) as usize;
        let noff = (offset_ms / l) as usize;
        let block = geom.nosearch_bins() + rebin + noff;
        // The subtraction edges reach one rebin below the block start.
        let required = block + rebin;
        if required > geom.capacity {
            return Err(AnalysisError::GeometryOverflow {
                capacity: geom.capacity,
                required,
            });
        }

        let idx_bg_trailing = geom.capacity - block;
        let idx_excl_trailing = idx_bg_trailing + geom.n_bg_trailing;
        let idx_search = idx_excl_trailing + geom.n_excl_trailing;
        let idx_excl_leading = idx_search + rebin;
        let idx_bg_leading = idx_excl_leading + geom.n_excl_leading;
        let idx_end = idx_bg_leading + geom.n_bg_leading;
        debug_assert_eq!(idx_end, geom.capacity - noff);

        Ok(Self {
            binsize_ms,
            offset_ms,
            rebin,
            nbin_bg: bg_ms / binsize_ms as u64,
            n_online: block as u64,
            idx_bg_trailing,
            idx_excl_trailing,
            idx_search,
            idx_excl_leading,
            idx_bg_leading,
            idx_end,
            bins_above_search: geom.capacity - idx_excl_leading,
            sum_bg: vec![0; ndom],
            sum_bg_sq: vec![0; ndom],
            sum_sw: vec![0; ndom],
            qualified: vec![true; ndom],
            ndom_active: ndom,
            toggled_last_update: 0,
            n_since_eval: 0,
            dmu: 0.0,
            var_dmu: 0.0,
            xi: 0.0,
            chi2: 0.0,
            utime_sw: 0,
        })
    }

    pub fn binsize_ms(&self) -> u32 {
        self.binsize_ms
    }

    pub fn offset_ms(&self) -> u32 {
        self.offset_ms
    }

    pub fn rebin(&self) -> usize {
        self.rebin
    }

    pub fn nbin_bg(&self) -> u64 {
        self.nbin_bg
    }

    pub fn xi(&self) -> f64 {
        self.xi
    }

    pub fn dmu(&self) -> f64 {
        self.dmu
    }

    pub fn var_dmu(&self) -> f64 {
        self.var_dmu
    }

    pub fn chi2(&self) -> f64 {
        self.chi2
    }

    pub fn utime_sw(&self) -> u64 {
        self.utime_sw
    }

    pub(crate) fn set_utime_sw(&mut self, utime: u64) {
        self.utime_sw = utime;
    }

    pub fn ndom_active(&self) -> usize {
        self.ndom_active
    }

    pub fn qualified(&self) -> &[bool] {
        &self.qualified
    }

    pub fn toggled_last_update(&self) -> u32 {
        self.toggled_last_update
    }

    pub fn sum_bg(&self) -> &[u64] {
        &self.sum_bg
    }

    pub fn sum_sw(&self) -> &[u64] {
        &self.sum_sw
    }

    /// Logical rows of the search window.
    pub fn search_rows(&self) -> std::ops::Range<usize> {
        self.idx_search..self.idx_excl_leading
    }

    /// Logical rows of the two background windows (trailing, leading).
    pub fn background_rows(&self) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
        (
            self.idx_bg_trailing..self.idx_excl_trailing,
            self.idx_bg_leading..self.idx_end,
        )
    }

    /// Rows between the newest buffer edge and the search window's upper
    /// edge (offset + leading exclusion + leading background); fixes how far
    /// the evaluated window trails the ingest frontier.
    pub fn bins_above_search(&self) -> usize {
        self.bins_above_search
    }

    /// Cadence gate: true when exactly one search-binsize of new bins has
    /// arrived since the last sum update. The handler increments the counter
    /// once per base bin and calls [`Self::slide`] when this fires.
    pub fn bump_bin_counter(&mut self) -> bool {
        self.n_since_eval += 1;
        self.n_since_eval as usize == self.rebin
    }

    /// Readiness gate: enough bins seen to back the whole block with data.
    pub fn online(&self, n_seen: u64) -> bool {
        n_seen >= self.n_online
    }

    pub fn n_online(&self) -> u64 {
        self.n_online
    }

    /// Slide all windows one search-binsize step: add the chunk entering
    /// each tracked region, subtract the chunk leaving it. The squared sum
    /// uses the already-summed binsize-wide chunk value per channel.
    pub fn slide(&mut self, buffer: &WindowBuffer<u64>) {
        let ndom = self.sum_bg.len();
        let r = self.rebin;
        let mut add_sw = vec![0u64; ndom];
        let mut sub_sw = vec![0u64; ndom];
        let mut add_bgl = vec![0u64; ndom];
        let mut sub_bgl = vec![0u64; ndom];
        let mut add_bgt = vec![0u64; ndom];
        let mut sub_bgt = vec![0u64; ndom];

        chunk_sum(buffer, self.idx_excl_leading - r, self.idx_excl_leading, &mut add_sw);
        chunk_sum(buffer, self.idx_search - r, self.idx_search, &mut sub_sw);
        chunk_sum(buffer, self.idx_end - r, self.idx_end, &mut add_bgl);
        chunk_sum(buffer, self.idx_bg_leading - r, self.idx_bg_leading, &mut sub_bgl);
        chunk_sum(buffer, self.idx_excl_trailing - r, self.idx_excl_trailing, &mut add_bgt);
        chunk_sum(buffer, self.idx_bg_trailing - r, self.idx_bg_trailing, &mut sub_bgt);

        for c in 0..ndom {
            self.sum_sw[c] = self.sum_sw[c] + add_sw[c] - sub_sw[c];
            self.sum_bg[c] = self.sum_bg[c] + add_bgl[c] + add_bgt[c] - sub_bgl[c] - sub_bgt[c];
            self.sum_bg_sq[c] = self.sum_bg_sq[c] + add_bgl[c] * add_bgl[c] + add_bgt[c] * add_bgt[c]
                - sub_bgl[c] * sub_bgl[c]
                - sub_bgt[c] * sub_bgt[c];
        }
        self.n_since_eval = 0;
    }

    /// Background mean per channel, in counts per search bin.
    pub fn mean(&self, channel: usize) -> f64 {
        self.sum_bg[channel] as f64 / self.nbin_bg as f64
    }

    /// Background variance per channel, from the binsize-wide squared sums.
    pub fn var(&self, channel: usize) -> f64 {
        let n = self.nbin_bg as u128;
        let sum = self.sum_bg[channel] as u128;
        let sum_sq = self.sum_bg_sq[channel] as u128;
        // n * sum_sq >= sum^2 (Cauchy-Schwarz), so the difference is exact in
        // unsigned arithmetic.
        let numer = (n * sum_sq).saturating_sub(sum * sum);
        numer as f64 / (self.nbin_bg as f64 * self.nbin_bg as f64)
    }

    fn fano(&self, channel: usize) -> f64 {
        let mean = self.mean(channel);
        if mean > 0.0 { self.var(channel) / mean } else { 0.0 }
    }

    /// Re-evaluate every channel against the background bounds, toggling
    /// inclusion where the verdict changed. Returns the number of toggles.
    pub fn qualify(&mut self, bounds: &QualBounds) -> u32 {
        let to_hz = 1_000.0 / self.binsize_ms as f64;
        let mut toggled = 0;
        for c in 0..self.qualified.len() {
            let rate_hz = self.mean(c) * to_hz;
            let fano = self.fano(c);
            let good = rate_hz > bounds.min_rate_hz
                && rate_hz < bounds.max_rate_hz
                && fano > bounds.min_fano
                && fano < bounds.max_fano;
            if good != self.qualified[c] {
                self.qualified[c] = good;
                if good {
                    self.ndom_active += 1;
                } else {
                    self.ndom_active -= 1;
                }
                toggled += 1;
                trace!(
                    target: "analysis.qualify",
                    channel = c,
                    rate_hz,
                    fano,
                    included = good,
                    "channel_toggled"
                );
            }
        }
        self.toggled_last_update = toggled;
        toggled
    }

    /// Compute Δμ, its variance, ξ, and χ² over the qualified channels.
    /// Ill-conditioned statistics (no qualified channels, zero variance
    /// everywhere) yield 0, never NaN.
    pub fn evaluate(&mut self, eps: &[f64]) {
        debug_assert_eq!(eps.len(), self.qualified.len());
        let mut sum_rate_dev = 0.0;
        let mut sum_inv_var = 0.0;
        for c in 0..self.qualified.len() {
            if !self.qualified[c] {
                continue;
            }
            let var = self.var(c);
            if var <= 0.0 {
                continue;
            }
            let signal = self.sum_sw[c] as f64 - self.mean(c);
            sum_rate_dev += signal * eps[c] / var;
            sum_inv_var += eps[c] * eps[c] / var;
        }
        if sum_inv_var > 0.0 {
            self.dmu = sum_rate_dev / sum_inv_var;
            self.var_dmu = 1.0 / sum_inv_var;
            self.xi = self.dmu / self.var_dmu.sqrt();
        } else {
            self.dmu = 0.0;
            self.var_dmu = 0.0;
            self.xi = 0.0;
        }

        let mut chi2 = 0.0;
        for c in 0..self.qualified.len() {
            if !self.qualified[c] {
                continue;
            }
            let mean = self.mean(c);
            let var = self.var(c);
            let rate = self.sum_sw[c] as f64;
            let signal = rate - mean;
            let denom = var + eps[c] * signal.abs();
            if denom > 0.0 {
                let resid = rate - (mean + eps[c] * signal);
                chi2 += resid * resid / denom;
            }
        }
        self.chi2 = chi2;
    }

    /// Zero the scalar statistics; used when the analysis is invalid
    /// (too few qualified channels) so stale values never escape.
    pub fn invalidate_stats(&mut self) {
        self.dmu = 0.0;
        self.var_dmu = 0.0;
        self.xi = 0.0;
        self.chi2 = 0.0;
    }
}

/// Column-wise sum of logical rows [lo, hi) into `out`.
fn chunk_sum(buffer: &WindowBuffer<u64>, lo: usize, hi: usize, out: &mut [u64]) {
    out.fill(0);
    for row in lo..hi {
        for (acc, &v) in out.iter_mut().zip(buffer.row(row)) {
            *acc += v;
        }
    }
}
