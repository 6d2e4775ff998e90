//! Resampling of irregular scaler payloads onto the uniform 2 ms staging
//! grid, and accumulation of staging columns into 500 ms base columns.
//!
//! A payload carries counts per detector clock tick (1.6384 ms). Each tick is
//! deposited into the staging column containing its start time; a tick whose
//! span crosses the next column boundary hands the boundary-crossing fraction
//! of its counts to that column. The handoff moves a single rounded amount so
//! the payload's total count is preserved exactly. Duplicate targets within
//! one payload accumulate (scatter-add), so out-of-order ticks inside the
//! staging window fold correctly.
//!
//! The rebinner only resamples; it never inspects analysis state.

use core_buffer::StagingBuffer;
use core_payload::SnPayload;
use core_payload::time::{SCALER_UDT, STAGING_UDT};
use thiserror::Error;
use tracing::warn;

/// Staging depth in 2 ms columns (8 s of detector time).
pub const STAGING_DEPTH: usize = 4_000;

#[derive(Debug, Error)]
pub enum RebinError {
    #[error("staging buffer construction failed: {0}")]
    Buffer(#[from] core_buffer::BufferError),
    #[error("deposit before the staging clock was started")]
    NotStarted,
}

/// Outcome of one payload deposit, for driver-side accounting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DepositOutcome {
    /// Counts landed in the staging grid.
    pub deposited: u64,
    /// Counts from ticks wholly before the staging front, dropped.
    pub dropped: u64,
}

/// Owns the staging buffer and its clock. Column 0 starts at `t0`; the grid
/// advances in 2 ms steps as the front column is consumed.
pub struct Rebinner {
    staging: StagingBuffer<u16>,
    t0: Option<u64>,
    dropped_total: u64,
}

impl Rebinner {
    pub fn new(ndom: usize) -> Result<Self, RebinError> {
        Self::with_depth(ndom, STAGING_DEPTH)
    }

    pub fn with_depth(ndom: usize, depth: usize) -> Result<Self, RebinError> {
        Ok(Self {
            staging: StagingBuffer::new(depth, ndom)?,
            t0: None,
            dropped_total: 0,
        })
    }

    /// Set the front-column start time from the first valid payload. The
    /// clock is anchored exactly at the payload time; downstream bins are
    /// relative to it.
    pub fn start(&mut self, t0: u64) {
        self.t0 = Some(t0);
    }

    pub fn started(&self) -> bool {
        self.t0.is_some()
    }

    pub fn depth(&self) -> usize {
        self.staging.size()
    }

    pub fn ndom(&self) -> usize {
        self.staging.width()
    }

    /// Start time of logical column `col`.
    pub fn column_start(&self, col: usize) -> Option<u64> {
        self.t0.map(|t0| t0 + col as u64 * STAGING_UDT)
    }

    /// End time of the staging window (exclusive).
    pub fn horizon(&self) -> Option<u64> {
        self.column_start(self.depth())
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }

    /// Deposit one payload's ticks for the given channel row.
    pub fn deposit(
        &mut self,
        channel: usize,
        payload: &SnPayload,
    ) -> Result<DepositOutcome, RebinError> {
        let t0 = self.t0.ok_or(RebinError::NotStarted)?;
        let depth = self.depth();
        let mut outcome = DepositOutcome::default();

        for (k, &count) in payload.scalers.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let tick_start = payload.utime + k as u64 * SCALER_UDT;
            if tick_start < t0 {
                outcome.dropped += count as u64;
                continue;
            }
            let col = ((tick_start - t0) / STAGING_UDT) as usize;
            if col >= depth {
                // The driver advances the grid before depositing, so a tick
                // past the horizon means a payload longer than the staging
                // window; drop rather than wrap.
                outcome.dropped += count as u64;
                continue;
            }
            let col_end = t0 + (col as u64 + 1) * STAGING_UDT;
            let crosses = tick_start + SCALER_UDT > col_end && col + 1 < depth;
            if crosses {
                let f = 1.0 - (col_end - tick_start) as f64 / SCALER_UDT as f64;
                let moved = (f * count as f64 + 0.5).floor() as u16;
                let kept = count as u16 - moved;
                self.staging.add(channel, col, kept);
                self.staging.add(channel, col + 1, moved);
            } else {
                self.staging.add(channel, col, count as u16);
            }
            outcome.deposited += count as u64;
        }

        if outcome.dropped > 0 {
            self.dropped_total += outcome.dropped;
            warn!(
                target: "rebin",
                channel,
                dropped = outcome.dropped,
                "stale_or_overlong_ticks_dropped"
            );
        }
        Ok(outcome)
    }

    /// Read the front column into `out`, then advance the clock by one
    /// column. The caller owns the cadence: it pops whenever the incoming
    /// payload time has passed the front column.
    pub fn pop_front(&mut self, out: &mut [u16]) -> Result<(), RebinError> {
        let t0 = self.t0.ok_or(RebinError::NotStarted)?;
        self.staging.read_front(out);
        self.staging.advance();
        self.t0 = Some(t0 + STAGING_UDT);
        Ok(())
    }
}

/// Folds consecutive 2 ms columns into one base column. `rebin_factor`
/// columns make a base bin (250 for the 500 ms base cadence, 1 when analyses
/// run directly on the raw grid).
pub struct Accumulator {
    base: Vec<u64>,
    remaining: u32,
    rebin_factor: u32,
}

impl Accumulator {
    pub fn new(ndom: usize, rebin_factor: u32) -> Self {
        assert!(rebin_factor > 0, "rebin factor must be nonzero");
        Self {
            base: vec![0; ndom],
            remaining: rebin_factor,
            rebin_factor,
        }
    }

    /// Add one staging column. Returns the completed base column when
    /// `rebin_factor` columns have been folded.
    pub fn fold(&mut self, column: &[u16]) -> Option<Vec<u64>> {
        debug_assert_eq!(column.len(), self.base.len());
        for (acc, &v) in self.base.iter_mut().zip(column) {
            *acc += v as u64;
        }
        self.remaining -= 1;
        if self.remaining == 0 {
            self.remaining = self.rebin_factor;
            let mut done = vec![0; self.base.len()];
            std::mem::swap(&mut done, &mut self.base);
            Some(done)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 10_000_000; // tenth-ns per ms

    fn payload(utime: u64, scalers: Vec<u8>) -> SnPayload {
        SnPayload {
            utime,
            dom_id: 0,
            domclock: 0,
            scalers,
        }
    }

    fn rebinner(ndom: usize) -> Rebinner {
        let mut r = Rebinner::with_depth(ndom, 16).unwrap();
        r.start(0);
        r
    }

    fn column(r: &Rebinner, col: usize) -> Vec<u16> {
        // Peek helper built on the public surface: pop would advance, so read
        // through a clone.
        let mut out = vec![0u16; r.ndom()];
        let mut probe = Rebinner {
            staging: r.staging.clone(),
            t0: r.t0,
            dropped_total: 0,
        };
        for _ in 0..col {
            probe.pop_front(&mut out).unwrap();
        }
        probe.staging.read_front(&mut out);
        out
    }

    #[test]
    fn mid_column_tick_lands_whole() {
        let mut r = rebinner(1);
        // Tick at t0 + 0.2 ms spans [0.2, 1.8384) ms, inside column 0.
        let out = r
            .deposit(0, &payload(MS / 5, vec![10]))
            .unwrap();
        assert_eq!(out.deposited, 10);
        assert_eq!(column(&r, 0), vec![10]);
        assert_eq!(column(&r, 1), vec![0]);
    }

    #[test]
    fn boundary_tick_splits_with_rounded_handoff() {
        let mut r = rebinner(1);
        // Tick at t0 + 1.9 ms: 0.1 ms of the tick is inside column 0, the
        // rest crosses into column 1. moved = round((1 - 0.1/1.6384) * 10) = 9.
        r.deposit(0, &payload(19 * MS / 10, vec![10])).unwrap();
        assert_eq!(column(&r, 0), vec![1]);
        assert_eq!(column(&r, 1), vec![9]);
    }

    #[test]
    fn split_preserves_total_counts() {
        // The handoff is one rounded amount moved between columns, so totals
        // are exact for any tick phase.
        for phase_tenth_ms in 0..20 {
            let mut r = rebinner(1);
            let t = phase_tenth_ms * MS / 10;
            r.deposit(0, &payload(t, vec![7, 13, 1, 255])).unwrap();
            let mut total = 0u64;
            for col in 0..r.depth() {
                total += column(&r, col)[0] as u64;
            }
            assert_eq!(total, 7 + 13 + 1 + 255, "phase {phase_tenth_ms}");
        }
    }

    #[test]
    fn duplicate_columns_scatter_add() {
        let mut r = rebinner(1);
        // Two ticks starting in the same 2 ms column must accumulate, not
        // overwrite.
        r.deposit(0, &payload(0, vec![3])).unwrap();
        r.deposit(0, &payload(MS / 10, vec![4])).unwrap();
        assert_eq!(column(&r, 0)[0], 3 + 4);
    }

    #[test]
    fn bulk_equivalence_for_interior_ticks() {
        // A payload whose ticks all start and end strictly inside one column
        // deposits exactly like a single bulk add at that column.
        let mut r = rebinner(1);
        let base = 8 * STAGING_UDT; // column 8, tick ends before the boundary
        r.deposit(0, &payload(base, vec![5])).unwrap();
        assert_eq!(column(&r, 8), vec![5]);
        for col in [7usize, 9] {
            assert_eq!(column(&r, col), vec![0]);
        }
    }

    #[test]
    fn stale_ticks_are_dropped_and_counted() {
        let mut r = Rebinner::with_depth(1, 16).unwrap();
        r.start(10 * STAGING_UDT);
        let out = r.deposit(0, &payload(0, vec![9])).unwrap();
        assert_eq!(out.deposited, 0);
        assert_eq!(out.dropped, 9);
        assert_eq!(r.dropped_total(), 9);
    }

    #[test]
    fn pop_front_advances_clock() {
        let mut r = rebinner(2);
        r.deposit(0, &payload(0, vec![10])).unwrap();
        r.deposit(1, &payload(STAGING_UDT, vec![20])).unwrap();
        let mut out = vec![0u16; 2];
        r.pop_front(&mut out).unwrap();
        assert_eq!(out, vec![10, 0]);
        assert_eq!(r.column_start(0), Some(STAGING_UDT));
        r.pop_front(&mut out).unwrap();
        assert_eq!(out, vec![0, 20]);
    }

    #[test]
    fn deposit_before_start_is_an_error() {
        let mut r = Rebinner::with_depth(1, 8).unwrap();
        assert!(matches!(
            r.deposit(0, &payload(0, vec![1])),
            Err(RebinError::NotStarted)
        ));
    }

    #[test]
    fn accumulator_completes_every_rebin_factor() {
        let mut acc = Accumulator::new(2, 3);
        assert!(acc.fold(&[1, 10]).is_none());
        assert!(acc.fold(&[2, 20]).is_none());
        let base = acc.fold(&[3, 30]).unwrap();
        assert_eq!(base, vec![6, 60]);
        // Counter resets; the next cycle starts from zero.
        assert!(acc.fold(&[5, 0]).is_none());
        assert!(acc.fold(&[0, 0]).is_none());
        assert_eq!(acc.fold(&[0, 0]).unwrap(), vec![5, 0]);
    }

    #[test]
    fn zero_columns_make_a_zero_base_column() {
        let mut acc = Accumulator::new(4, 250);
        let zeros = vec![0u16; 4];
        for _ in 0..249 {
            assert!(acc.fold(&zeros).is_none());
        }
        assert_eq!(acc.fold(&zeros).unwrap(), vec![0, 0, 0, 0]);
    }
}
