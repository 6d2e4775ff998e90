//! Sliding-window significance analyses over the base-binned count stream.
//!
//! The [`AnalysisHandler`] owns the base rolling buffer and the bank of
//! overlapping [`Analysis`] descriptors; each analysis stores only indices
//! into the buffer plus its own per-channel accumulators, never borrows. The
//! handler drives the cadence: every completed base bin bumps each analysis's
//! bin counter, and an analysis whose counter reaches its rebin factor slides
//! its windows by one search-binsize step, requalifies channels, and
//! recomputes the collective test statistic ξ.

mod analysis;
mod handler;
mod history;

pub use analysis::{Analysis, QualBounds, WindowGeometry};
pub use handler::{AnalysisHandler, BaseBinSummary};
pub use history::{XI_HISTORY_LEN, XiHistory};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("binsize {0} ms is incompatible, must be a multiple of the analysis bin")]
    BadBinsize(u32),
    #[error("offset {offset} ms is invalid for binsize {binsize} ms")]
    BadOffset { offset: u32, binsize: u32 },
    #[error("background duration is not divisible by binsize {0} ms")]
    IndivisibleBackground(u32),
    #[error("analysis geometry does not fit the base buffer (capacity {capacity}, required {required})")]
    GeometryOverflow { capacity: usize, required: usize },
    #[error(transparent)]
    Buffer(#[from] core_buffer::BufferError),
}
