//! Detector geometry: the DOM table and the hardware-ID → channel-index map.
//!
//! The table is whitespace-separated, one DOM per row:
//!
//! ```text
//! string  position  x  y  z  mainboard-id(hex)  type  effective-volume
//! ```
//!
//! Row order assigns each DOM its stable linear channel index in `[0, ndom)`.
//! A hardware ID is valid iff it appears in the table; lookups for unknown
//! IDs return `None` and the caller skips the payload.

use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("unable to read DOM table {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("DOM table line {line}: {reason}")]
    BadRow { line: usize, reason: String },
    #[error("duplicate mainboard id {mbid:#014x} at line {line}")]
    DuplicateDom { mbid: u64, line: usize },
    #[error("DOM table is empty")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DomEntry {
    pub string: i32,
    pub position: i32,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub mbid: u64,
    pub kind: String,
    pub effvol: f64,
}

/// The detector map: DOM entries in table order plus a sorted index for
/// O(log n) hardware-ID lookup.
#[derive(Debug, Clone)]
pub struct Detector {
    entries: Vec<DomEntry>,
    /// (mbid, channel index), sorted by mbid.
    sorted_ids: Vec<(u64, usize)>,
}

impl Detector {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DetectorError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| DetectorError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let detector = Self::from_str(&text)?;
        info!(
            target: "detector",
            file = %path.display(),
            ndom = detector.ndom(),
            "dom_table_loaded"
        );
        Ok(detector)
    }

    pub fn from_str(text: &str) -> Result<Self, DetectorError> {
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            entries.push(Self::parse_row(line, lineno + 1)?);
        }
        if entries.is_empty() {
            return Err(DetectorError::Empty);
        }

        let mut sorted_ids: Vec<(u64, usize)> = entries
            .iter()
            .enumerate()
            .map(|(idx, e)| (e.mbid, idx))
            .collect();
        sorted_ids.sort_unstable_by_key(|&(mbid, _)| mbid);
        for pair in sorted_ids.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(DetectorError::DuplicateDom {
                    mbid: pair[0].0,
                    line: pair[1].1 + 1,
                });
            }
        }

        Ok(Self {
            entries,
            sorted_ids,
        })
    }

    fn parse_row(line: &str, lineno: usize) -> Result<DomEntry, DetectorError> {
        let bad = |reason: &str| DetectorError::BadRow {
            line: lineno,
            reason: reason.to_string(),
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 8 {
            return Err(bad(&format!("expected 8 fields, found {}", fields.len())));
        }
        // The string and position columns are written as floats in some table
        // revisions; accept either form.
        let int_field = |s: &str, name: &str| -> Result<i32, DetectorError> {
            s.parse::<f64>()
                .map(|v| v as i32)
                .map_err(|_| bad(&format!("unparseable {name} field `{s}`")))
        };
        let float_field = |s: &str, name: &str| -> Result<f64, DetectorError> {
            s.parse::<f64>()
                .map_err(|_| bad(&format!("unparseable {name} field `{s}`")))
        };
        Ok(DomEntry {
            string: int_field(fields[0], "string")?,
            position: int_field(fields[1], "position")?,
            x: float_field(fields[2], "x")?,
            y: float_field(fields[3], "y")?,
            z: float_field(fields[4], "z")?,
            mbid: u64::from_str_radix(fields[5].trim_start_matches("0x"), 16)
                .map_err(|_| bad(&format!("unparseable mainboard id `{}`", fields[5])))?,
            kind: fields[6].to_string(),
            effvol: float_field(fields[7], "effective-volume")?,
        })
    }

    pub fn ndom(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[DomEntry] {
        &self.entries
    }

    /// Channel index for a hardware ID, or `None` when the DOM is not in the
    /// map (IceTop and decommissioned DOMs).
    pub fn dom_index(&self, mbid: u64) -> Option<usize> {
        self.sorted_ids
            .binary_search_by_key(&mbid, |&(id, _)| id)
            .ok()
            .map(|pos| self.sorted_ids[pos].1)
    }

    pub fn is_valid_dom(&self, mbid: u64) -> bool {
        self.dom_index(mbid).is_some()
    }

    /// Per-channel relative efficiency, indexed by channel. Effective volumes
    /// are normalized to the table median, which puts the standard population
    /// at ~1.0 and the high-quantum-efficiency population at ~1.35.
    pub fn eps(&self) -> Vec<f64> {
        let mut vols: Vec<f64> = self.entries.iter().map(|e| e.effvol).collect();
        vols.sort_unstable_by(|a, b| a.partial_cmp(b).expect("effvol is finite"));
        let median = vols[vols.len() / 2];
        let norm = if median > 0.0 { median } else { 1.0 };
        self.entries.iter().map(|e| e.effvol / norm).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
# string pos x y z mbid type effvol
1 1  10.0  20.0 -100.0  a1b2c3d4e5f6 i3 1.00
1 2  10.0  20.0 -117.0  0123456789ab i3 1.02
2 1 -55.5  31.0 -100.0  fedcba987654 dc 1.35
";

    #[test]
    fn indices_follow_table_order() {
        let det = Detector::from_str(TABLE).unwrap();
        assert_eq!(det.ndom(), 3);
        assert_eq!(det.dom_index(0xa1b2c3d4e5f6), Some(0));
        assert_eq!(det.dom_index(0x0123456789ab), Some(1));
        assert_eq!(det.dom_index(0xfedcba987654), Some(2));
    }

    #[test]
    fn unknown_ids_are_invalid_not_fatal() {
        let det = Detector::from_str(TABLE).unwrap();
        assert_eq!(det.dom_index(0xdeadbeef), None);
        assert!(!det.is_valid_dom(0xdeadbeef));
    }

    #[test]
    fn eps_normalizes_to_standard_population() {
        let det = Detector::from_str(TABLE).unwrap();
        let eps = det.eps();
        assert!((eps[0] - 1.00 / 1.02).abs() < 1e-9);
        assert!((eps[2] - 1.35 / 1.02).abs() < 1e-9);
    }

    #[test]
    fn duplicate_mbid_is_rejected() {
        let table = "1 1 0 0 0 aa i3 1.0\n1 2 0 0 0 aa i3 1.0\n";
        assert!(matches!(
            Detector::from_str(table),
            Err(DetectorError::DuplicateDom { mbid: 0xaa, .. })
        ));
    }

    #[test]
    fn short_rows_name_the_line() {
        let table = "1 1 0 0 0 aa i3\n";
        match Detector::from_str(table) {
            Err(DetectorError::BadRow { line, .. }) => assert_eq!(line, 1),
            other => panic!("expected BadRow, got {other:?}"),
        }
    }

    #[test]
    fn empty_table_is_rejected() {
        assert!(matches!(
            Detector::from_str("# only comments\n"),
            Err(DetectorError::Empty)
        ));
    }

    #[test]
    fn reads_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        f.write_all(TABLE.as_bytes()).unwrap();
        f.flush().unwrap();
        let det = Detector::from_file(f.path()).unwrap();
        assert_eq!(det.ndom(), 3);
    }
}
