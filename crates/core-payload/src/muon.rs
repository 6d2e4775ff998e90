//! Muon-veto rate stream: one text record per line,
//! `YYYY-MM-DD HH:MM:SS.fffffffff<ws>count`, where the count covers one fixed
//! source bin (500 ms, or the trigger binsize, depending on the file).
//! Malformed lines are skipped and counted; they never abort a file.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

use tracing::warn;

use crate::time::{self, TENTH_NS_PER_MS};
use crate::PayloadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuonRateRecord {
    pub utime: u64,
    pub count: u64,
}

/// A uniformly binned rate series, as attached to a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateSeries {
    pub t_start: u64,
    pub binsize_ms: u32,
    pub data: Vec<u64>,
}

impl RateSeries {
    /// Fold records into uniform bins covering `[t_start, t_stop)`. Records
    /// outside the span are ignored; bins with no records stay zero.
    pub fn from_records(
        records: &[MuonRateRecord],
        t_start: u64,
        t_stop: u64,
        binsize_ms: u32,
    ) -> Self {
        let bin_udt = binsize_ms as u64 * TENTH_NS_PER_MS;
        let nbins = ((t_stop.saturating_sub(t_start)) / bin_udt) as usize;
        let mut data = vec![0u64; nbins];
        for rec in records {
            if rec.utime < t_start || rec.utime >= t_stop {
                continue;
            }
            let idx = ((rec.utime - t_start) / bin_udt) as usize;
            if idx < nbins {
                data[idx] += rec.count;
            }
        }
        Self {
            t_start,
            binsize_ms,
            data,
        }
    }
}

/// Line-oriented reader over one muon rate file.
pub struct MuonRateReader {
    lines: Lines<BufReader<File>>,
    malformed: u64,
}

impl MuonRateReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PayloadError> {
        let file = File::open(path.as_ref())?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            malformed: 0,
        })
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    fn parse_line(line: &str) -> Option<MuonRateRecord> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        // Timestamp is the first two whitespace-separated fields, the count
        // the last one.
        let mut parts = line.split_whitespace();
        let date = parts.next()?;
        let clock = parts.next()?;
        let count: u64 = parts.next()?.parse().ok()?;
        let stamp = format!("{date} {clock}");
        let dt = time::parse_muon_time(&stamp).ok()?;
        let utime = time::datetime_to_utime(dt).ok()?;
        Some(MuonRateRecord { utime, count })
    }

    /// Read every parseable record in the file.
    pub fn read_all(&mut self) -> Result<Vec<MuonRateRecord>, PayloadError> {
        let mut out = Vec::new();
        for line in self.lines.by_ref() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match Self::parse_line(&line) {
                Some(rec) => out.push(rec),
                None => {
                    self.malformed += 1;
                    warn!(target: "io.muon", line = %line, "muon_line_unparseable");
                }
            }
        }
        Ok(out)
    }
}
