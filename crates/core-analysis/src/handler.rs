//! The analysis handler: owns the base rolling buffer, the accumulator that
//! feeds it, the analysis bank, and the per-analysis ξ history rings.

use core_buffer::WindowBuffer;
use core_config::AnalysisOptions;
use core_payload::time::TENTH_NS_PER_MS;
use core_rebin::Accumulator;
use tracing::{debug, info};

use crate::analysis::{Analysis, QualBounds, WindowGeometry};
use crate::history::XiHistory;
use crate::AnalysisError;

/// Result of feeding one staging column: present when a base bin completed.
#[derive(Debug, Clone, Default)]
pub struct BaseBinSummary {
    /// Total base bins appended so far.
    pub n_seen: u64,
    /// Indices of analyses whose sums were updated on this bin. Only these
    /// carry a fresh ξ; everything else is stale by construction.
    pub evaluated: Vec<usize>,
}

pub struct AnalysisHandler {
    opts: AnalysisOptions,
    geom: WindowGeometry,
    eps: Vec<f64>,
    bounds: QualBounds,
    buffer: WindowBuffer<u64>,
    accumulator: Accumulator,
    analyses: Vec<Analysis>,
    histories: Vec<XiHistory>,
    n_seen: u64,
    start_utime: Option<u64>,
}

impl AnalysisHandler {
    /// Build the bank: for each configured binsize, one analysis per offset
    /// under the offset policy.
    pub fn new(opts: &AnalysisOptions, eps: Vec<f64>) -> Result<Self, AnalysisError> {
        let ndom = eps.len();
        let geom = WindowGeometry::from_options(opts);
        let buffer = WindowBuffer::new(geom.capacity, ndom)?;
        let mut analyses = Vec::new();
        for &binsize in &opts.binsizes {
            for offset in opts.offsets_for(binsize) {
                analyses.push(Analysis::new(binsize, offset, &geom, ndom)?);
            }
        }
        let histories = vec![XiHistory::default(); analyses.len()];
        info!(
            target: "analysis",
            ndom,
            capacity = geom.capacity,
            bin_ms = geom.bin_ms,
            n_analyses = analyses.len(),
            "analysis_bank_constructed"
        );
        // 2 ms columns per analysis bin; 1 when running on the raw grid.
        let rebin_factor = opts.analysis_binsize_ms() / 2;
        Ok(Self {
            opts: opts.clone(),
            geom,
            bounds: QualBounds::from_options(opts),
            eps,
            buffer,
            accumulator: Accumulator::new(ndom, rebin_factor),
            analyses,
            histories,
            n_seen: 0,
            start_utime: None,
        })
    }

    pub fn ndom(&self) -> usize {
        self.eps.len()
    }

    pub fn geometry(&self) -> &WindowGeometry {
        &self.geom
    }

    pub fn options(&self) -> &AnalysisOptions {
        &self.opts
    }

    pub fn eps(&self) -> &[f64] {
        &self.eps
    }

    pub fn analyses(&self) -> &[Analysis] {
        &self.analyses
    }

    pub fn history(&self, idx: usize) -> &XiHistory {
        &self.histories[idx]
    }

    /// Base bins appended so far.
    pub fn n_seen(&self) -> u64 {
        self.n_seen
    }

    pub fn buffer(&self) -> &WindowBuffer<u64> {
        &self.buffer
    }

    /// Anchor detector time: utime of the first staging column.
    pub fn set_start_utime(&mut self, utime: u64) {
        self.start_utime = Some(utime);
    }

    pub fn start_utime(&self) -> Option<u64> {
        self.start_utime
    }

    /// Utime of the newest base-bin upper edge.
    pub fn frontier_utime(&self) -> u64 {
        self.start_utime.unwrap_or(0) + self.n_seen * self.bin_udt()
    }

    fn bin_udt(&self) -> u64 {
        self.geom.bin_ms as u64 * TENTH_NS_PER_MS
    }

    /// Valid iff updated on the current bin, online, and enough channels
    /// qualify.
    pub fn triggerable(&self, idx: usize, summary: &BaseBinSummary) -> bool {
        let ana = &self.analyses[idx];
        summary.evaluated.contains(&idx)
            && ana.online(self.n_seen)
            && ana.ndom_active() >= self.opts.min_active_doms as usize
    }

    /// Feed one staging column (2 ms per channel). Returns a summary when a
    /// base bin completed and the bank was advanced.
    pub fn update(&mut self, column: &[u16]) -> Option<BaseBinSummary> {
        let base = self.accumulator.fold(column)?;
        Some(self.append_base_bin(base))
    }

    fn append_base_bin(&mut self, base: Vec<u64>) -> BaseBinSummary {
        self.buffer.append(&base);
        self.n_seen += 1;

        let mut evaluated = Vec::new();
        let utime_frontier = self.frontier_utime();
        for (idx, ana) in self.analyses.iter_mut().enumerate() {
            if !ana.bump_bin_counter() {
                continue;
            }
            ana.slide(&self.buffer);
            if !ana.online(self.n_seen) {
                continue;
            }
            let toggled = ana.qualify(&self.bounds);
            if toggled > 0 {
                debug!(
                    target: "analysis.qualify",
                    binsize_ms = ana.binsize_ms(),
                    offset_ms = ana.offset_ms(),
                    toggled,
                    ndom_active = ana.ndom_active(),
                    "qualification_changed"
                );
            }
            if ana.ndom_active() >= self.opts.min_active_doms as usize {
                ana.evaluate(&self.eps);
            } else {
                ana.invalidate_stats();
            }
            ana.set_utime_sw(
                utime_frontier
                    - ana.bins_above_search() as u64
                        * (self.geom.bin_ms as u64 * TENTH_NS_PER_MS),
            );
            self.histories[idx].push(ana.xi());
            evaluated.push(idx);
        }

        BaseBinSummary {
            n_seen: self.n_seen,
            evaluated,
        }
    }

    /// Direct (non-incremental) recomputation of one analysis's sums from the
    /// buffer, for consistency checking.
    pub fn direct_sums(&self, idx: usize) -> (Vec<u64>, Vec<u64>, Vec<u64>) {
        let ana = &self.analyses[idx];
        let ndom = self.ndom();
        let r = ana.rebin();
        let mut sum_bg = vec![0u64; ndom];
        let mut sum_bg_sq = vec![0u64; ndom];
        let mut sum_sw = vec![0u64; ndom];

        let (trailing, leading) = ana.background_rows();
        for range in [trailing, leading] {
            let mut row = range.start;
            while row < range.end {
                let mut chunk = vec![0u64; ndom];
                for rr in row..row + r {
                    for (acc, &v) in chunk.iter_mut().zip(self.buffer.row(rr)) {
                        *acc += v;
                    }
                }
                for c in 0..ndom {
                    sum_bg[c] += chunk[c];
                    sum_bg_sq[c] += chunk[c] * chunk[c];
                }
                row += r;
            }
        }
        for row in ana.search_rows() {
            for (acc, &v) in sum_sw.iter_mut().zip(self.buffer.row(row)) {
                *acc += v;
            }
        }
        (sum_bg, sum_bg_sq, sum_sw)
    }
}
