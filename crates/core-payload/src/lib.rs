//! Supernova scaler payloads: the on-disk binary record format, a pull-based
//! file reader, detector time conversions, and the muon-veto rate stream.
//!
//! Wire format (big-endian), one record:
//!
//! ```text
//! u32 length | u32 type_id (=16) | u64 utime | u64 dom_id |
//! u16 record_len | u16 magic (=300) | 6 bytes domclock |
//! (length - 34) bytes of per-tick scaler counts
//! ```
//!
//! Records of other `type_id` values are skipped wholesale. Records with a
//! bad magic are skipped and counted; framing damage (insane length,
//! truncation) abandons the file since resynchronization is not possible.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

pub mod muon;
pub mod time;

pub use muon::{MuonRateReader, MuonRateRecord, RateSeries};

pub const SN_TYPE_ID: u32 = 16;
pub const SN_ENVELOPE_LENGTH: usize = 16;
pub const SN_HEADER_LENGTH: usize = 18;
pub const SN_MAGIC_NUMBER: u16 = 300;

/// Reject records claiming more than this many bytes; real scaler records
/// carry at most a few hundred ticks.
const MAX_RECORD_LENGTH: u32 = 1 << 16;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("i/o error reading payload stream: {0}")]
    Io(#[from] std::io::Error),
    #[error("truncated record: expected {expected} bytes, stream ended after {got}")]
    Truncated { expected: usize, got: usize },
    #[error("implausible record length {0}")]
    BadLength(u32),
    #[error("unparseable timestamp: {0}")]
    BadTimestamp(String),
    #[error("timestamp out of range for utime conversion")]
    TimeOutOfRange,
}

/// One supernova scaler record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnPayload {
    pub utime: u64,
    pub dom_id: u64,
    pub domclock: u64,
    pub scalers: Vec<u8>,
}

impl SnPayload {
    /// Utime of the end of the last scaler tick.
    pub fn end_utime(&self) -> u64 {
        self.utime + self.scalers.len() as u64 * time::SCALER_UDT
    }
}

/// Per-file read accounting, exposed so the driver can enforce its abandon
/// cap and report totals.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReaderCounters {
    pub records: u64,
    pub skipped_type: u64,
    pub skipped_magic: u64,
}

/// Pull-based reader over one scaler file. Yields only well-formed
/// supernova records; foreign record types and bad-magic records are skipped
/// and counted.
pub struct PayloadReader {
    reader: BufReader<File>,
    path: PathBuf,
    counters: ReaderCounters,
}

impl PayloadReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PayloadError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        debug!(target: "io.payload", file = %path.display(), "payload_file_opened");
        Ok(Self {
            reader: BufReader::new(file),
            path,
            counters: ReaderCounters::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn counters(&self) -> ReaderCounters {
        self.counters
    }

    /// Read exactly `buf.len()` bytes. Returns Ok(false) on clean EOF at a
    /// record boundary, an error on mid-record truncation.
    fn read_block(&mut self, buf: &mut [u8], at_boundary: bool) -> Result<bool, PayloadError> {
        let mut got = 0;
        while got < buf.len() {
            let n = self.reader.read(&mut buf[got..])?;
            if n == 0 {
                if got == 0 && at_boundary {
                    return Ok(false);
                }
                return Err(PayloadError::Truncated {
                    expected: buf.len(),
                    got,
                });
            }
            got += n;
        }
        Ok(true)
    }

    fn next_record(&mut self) -> Result<Option<SnPayload>, PayloadError> {
        loop {
            let mut envelope = [0u8; SN_ENVELOPE_LENGTH];
            if !self.read_block(&mut envelope, true)? {
                return Ok(None);
            }
            let length = u32::from_be_bytes(envelope[0..4].try_into().unwrap());
            let type_id = u32::from_be_bytes(envelope[4..8].try_into().unwrap());
            let utime = u64::from_be_bytes(envelope[8..16].try_into().unwrap());

            if length < SN_ENVELOPE_LENGTH as u32 || length > MAX_RECORD_LENGTH {
                return Err(PayloadError::BadLength(length));
            }
            let body_len = length as usize - SN_ENVELOPE_LENGTH;

            if type_id != SN_TYPE_ID {
                let mut sink = vec![0u8; body_len];
                self.read_block(&mut sink, false)?;
                self.counters.skipped_type += 1;
                continue;
            }
            if body_len < SN_HEADER_LENGTH {
                return Err(PayloadError::BadLength(length));
            }

            let mut body = vec![0u8; body_len];
            self.read_block(&mut body, false)?;
            self.counters.records += 1;

            let dom_id = u64::from_be_bytes(body[0..8].try_into().unwrap());
            let _record_len = u16::from_be_bytes(body[8..10].try_into().unwrap());
            let magic = u16::from_be_bytes(body[10..12].try_into().unwrap());
            if magic != SN_MAGIC_NUMBER {
                self.counters.skipped_magic += 1;
                warn!(
                    target: "io.payload",
                    file = %self.path.display(),
                    magic,
                    "record_bad_magic_skipped"
                );
                continue;
            }
            let mut domclock = 0u64;
            for &b in &body[12..18] {
                domclock = (domclock << 8) | b as u64;
            }
            let scalers = body[SN_HEADER_LENGTH..].to_vec();
            return Ok(Some(SnPayload {
                utime,
                dom_id,
                domclock,
                scalers,
            }));
        }
    }
}

impl Iterator for PayloadReader {
    type Item = Result<SnPayload, PayloadError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Serialize a payload back into its wire form. Used by tests and the
/// synthetic-data writer; kept next to the parser so the two stay in sync.
pub fn encode_payload(payload: &SnPayload) -> Vec<u8> {
    let length = (SN_ENVELOPE_LENGTH + SN_HEADER_LENGTH + payload.scalers.len()) as u32;
    let mut out = Vec::with_capacity(length as usize);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&SN_TYPE_ID.to_be_bytes());
    out.extend_from_slice(&payload.utime.to_be_bytes());
    out.extend_from_slice(&payload.dom_id.to_be_bytes());
    out.extend_from_slice(&((SN_HEADER_LENGTH + payload.scalers.len()) as u16).to_be_bytes());
    out.extend_from_slice(&SN_MAGIC_NUMBER.to_be_bytes());
    out.extend_from_slice(&payload.domclock.to_be_bytes()[2..8]);
    out.extend_from_slice(&payload.scalers);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn payload(utime: u64, dom_id: u64, scalers: &[u8]) -> SnPayload {
        SnPayload {
            utime,
            dom_id,
            domclock: 0x0000_1234_5678,
            scalers: scalers.to_vec(),
        }
    }

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn reads_back_encoded_records() {
        let a = payload(1_000, 0xab, &[1, 2, 3]);
        let b = payload(2_000, 0xcd, &[4]);
        let mut bytes = encode_payload(&a);
        bytes.extend(encode_payload(&b));
        let f = write_temp(&bytes);

        let got: Vec<SnPayload> = PayloadReader::open(f.path())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(got, vec![a, b]);
    }

    #[test]
    fn skips_foreign_record_types() {
        let a = payload(1_000, 0xab, &[9]);
        let mut bytes = Vec::new();
        // A 20-byte record of some other type in front of the real one.
        bytes.extend_from_slice(&20u32.to_be_bytes());
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(&0u64.to_be_bytes());
        bytes.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        bytes.extend(encode_payload(&a));
        let f = write_temp(&bytes);

        let mut reader = PayloadReader::open(f.path()).unwrap();
        let got = reader.next().unwrap().unwrap();
        assert_eq!(got, a);
        assert!(reader.next().is_none());
        assert_eq!(reader.counters().skipped_type, 1);
    }

    #[test]
    fn skips_bad_magic_and_counts() {
        let good = payload(5_000, 0x11, &[7, 7]);
        let mut bad = encode_payload(&payload(1_000, 0x22, &[1]));
        // Corrupt the magic halfway through the header.
        bad[26] = 0xff;
        let mut bytes = bad;
        bytes.extend(encode_payload(&good));
        let f = write_temp(&bytes);

        let mut reader = PayloadReader::open(f.path()).unwrap();
        assert_eq!(reader.next().unwrap().unwrap(), good);
        assert_eq!(reader.counters().skipped_magic, 1);
    }

    #[test]
    fn truncated_record_is_an_error() {
        let bytes = encode_payload(&payload(1_000, 0xab, &[1, 2, 3, 4]));
        let f = write_temp(&bytes[..bytes.len() - 2]);
        let mut reader = PayloadReader::open(f.path()).unwrap();
        assert!(matches!(
            reader.next(),
            Some(Err(PayloadError::Truncated { .. }))
        ));
    }

    #[test]
    fn implausible_length_is_an_error() {
        let mut bytes = encode_payload(&payload(1_000, 0xab, &[1]));
        bytes[0..4].copy_from_slice(&u32::MAX.to_be_bytes());
        let f = write_temp(&bytes);
        let mut reader = PayloadReader::open(f.path()).unwrap();
        assert!(matches!(reader.next(), Some(Err(PayloadError::BadLength(_)))));
    }

    #[test]
    fn domclock_is_six_big_endian_bytes() {
        let p = payload(1_000, 0xab, &[]);
        let bytes = encode_payload(&p);
        let f = write_temp(&bytes);
        let got = PayloadReader::open(f.path()).unwrap().next().unwrap().unwrap();
        assert_eq!(got.domclock, 0x0000_1234_5678);
    }

    #[test]
    fn end_utime_spans_all_ticks() {
        let p = payload(1_000, 0xab, &[0, 0, 0]);
        assert_eq!(p.end_utime(), 1_000 + 3 * time::SCALER_UDT);
    }
}
