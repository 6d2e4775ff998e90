//! Input-file management: scaler file discovery and rotation, and selection
//! of the muon-rate files surrounding a candidate.
//!
//! Scaler files are named `sn_<run>_<seq>_<t0>_<t1>.dat` where the two
//! trailing fields are the covered interval in tenths of milliseconds since
//! the year start. Muon files are named `pDaqTriggers_<year>_<seconds>.dat`
//! with the start second since the year start.

use std::fs;
use std::path::{Path, PathBuf};

use core_config::FilesystemOptions;
use core_payload::time::TENTH_NS_PER_SEC;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

/// Tenth-ns per tenth-ms, the unit of scaler file-name timestamps.
const TENTH_NS_PER_TENTH_MS: u64 = 1_000_000;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("unable to scan {dir}: {source}")]
    Scan {
        dir: String,
        source: std::io::Error,
    },
    #[error("unable to rotate {path}: {source}")]
    Rotate {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalerFile {
    pub path: PathBuf,
    pub run: u64,
    pub seq: u64,
    /// Covered interval in utime (tenth-ns since year start).
    pub t_start: u64,
    pub t_stop: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuonFile {
    pub path: PathBuf,
    pub year: i32,
    /// File start in utime.
    pub t_start: u64,
}

pub struct FileManager {
    dir_scaler: PathBuf,
    dir_scaler_bkp: PathBuf,
    dir_muon: PathBuf,
    scaler_re: Regex,
    muon_re: Regex,
    processed: Vec<PathBuf>,
}

impl FileManager {
    pub fn new(opts: &FilesystemOptions) -> Self {
        Self {
            dir_scaler: opts.dir_scaler.clone(),
            dir_scaler_bkp: opts.dir_scaler_bkp.clone(),
            dir_muon: opts.dir_muon.clone(),
            scaler_re: Regex::new(r"^sn_(\d+)_(\d+)_(\d+)_(\d+)\.dat$")
                .expect("scaler pattern compiles"),
            muon_re: Regex::new(r"^pDaqTriggers_(\d{4})_(\d+)\.dat$")
                .expect("muon pattern compiles"),
            processed: Vec::new(),
        }
    }

    fn scan(dir: &Path) -> Result<Vec<PathBuf>, FileError> {
        let entries = fs::read_dir(dir).map_err(|source| FileError::Scan {
            dir: dir.display().to_string(),
            source,
        })?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| FileError::Scan {
                dir: dir.display().to_string(),
                source,
            })?;
            out.push(entry.path());
        }
        Ok(out)
    }

    /// Scaler files overlapping `[start, stop]` (either side optional),
    /// sorted by name. Files whose names do not match the pattern are
    /// ignored.
    pub fn scaler_files(
        &self,
        start_utime: Option<u64>,
        stop_utime: Option<u64>,
    ) -> Result<Vec<ScalerFile>, FileError> {
        let mut files = Vec::new();
        for path in Self::scan(&self.dir_scaler)? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(caps) = self.scaler_re.captures(name) else {
                continue;
            };
            let field = |i: usize| caps[i].parse::<u64>().unwrap_or(0);
            let file = ScalerFile {
                run: field(1),
                seq: field(2),
                t_start: field(3) * TENTH_NS_PER_TENTH_MS,
                t_stop: field(4) * TENTH_NS_PER_TENTH_MS,
                path,
            };
            if let Some(start) = start_utime
                && file.t_stop < start
            {
                continue;
            }
            if let Some(stop) = stop_utime
                && file.t_start > stop
            {
                continue;
            }
            files.push(file);
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        info!(
            target: "io.files",
            dir = %self.dir_scaler.display(),
            n = files.len(),
            "scaler_files_listed"
        );
        Ok(files)
    }

    /// Remember a consumed file for the next rotation pass.
    pub fn mark_processed(&mut self, path: PathBuf) {
        self.processed.push(path);
    }

    /// Move processed files into the backup directory with a `.processed`
    /// suffix. Returns how many were rotated.
    pub fn flush_processed(&mut self) -> Result<usize, FileError> {
        let mut rotated = 0;
        for path in self.processed.drain(..) {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let dest = self.dir_scaler_bkp.join(format!("{name}.processed"));
            fs::rename(&path, &dest).map_err(|source| FileError::Rotate {
                path: path.display().to_string(),
                source,
            })?;
            debug!(target: "io.files", from = %path.display(), to = %dest.display(), "scaler_file_rotated");
            rotated += 1;
        }
        Ok(rotated)
    }

    /// All muon files with parseable names, sorted by start time.
    pub fn muon_files(&self) -> Result<Vec<MuonFile>, FileError> {
        let mut files = Vec::new();
        for path in Self::scan(&self.dir_muon)? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(caps) = self.muon_re.captures(name) else {
                continue;
            };
            let year: i32 = caps[1].parse().unwrap_or(0);
            let secs: u64 = caps[2].parse().unwrap_or(0);
            files.push(MuonFile {
                path,
                year,
                t_start: secs * TENTH_NS_PER_SEC,
            });
        }
        files.sort_by_key(|f| f.t_start);
        Ok(files)
    }

    /// The `n_before` files starting at or before `t_utime` plus the
    /// `n_after` files after it, in time order. This brackets the muon rate
    /// series needed for a candidate's background span.
    pub fn muon_files_around(
        &self,
        t_utime: u64,
        n_before: usize,
        n_after: usize,
    ) -> Result<Vec<MuonFile>, FileError> {
        let files = self.muon_files()?;
        let split = files.partition_point(|f| f.t_start <= t_utime);
        let lo = split.saturating_sub(n_before);
        let hi = (split + n_after).min(files.len());
        Ok(files[lo..hi].to_vec())
    }
}
