//! Configuration loading and parsing.
//!
//! The on-disk format is TOML with sections `[analysis]`, `[trigger]`,
//! `[lightcurve]`, `[filesystem]` and `[sink]`; every field has a default so
//! a missing file yields a runnable configuration. Unknown fields are
//! tolerated (TOML deserialization tolerance) to allow forward evolution.
//! Fast-response requests arrive as a JSON object and override a subset of
//! the analysis options; see [`FraRequest`].
//!
//! Configuration errors are fatal at startup and carry the offending field;
//! the one deliberate exception is the Fano bound pair, which ships inverted
//! in some deployed configurations and is normalized here with a warning.

use serde::Deserialize;
use std::{fs, path::PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("unparseable config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unparseable fast-response request: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid option `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Search-window geometry and channel-qualification options.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalysisOptions {
    /// Search-window lengths in ms; each must be a multiple of 500.
    pub binsizes: Vec<u32>,
    /// When true, each binsize B gets analyses at offsets 0, 500, …, B-500.
    pub use_offsets: bool,
    /// When true, analyses run on the 500 ms rebinned buffer; when false, on
    /// the raw 2 ms buffer.
    pub use_rebins: bool,
    pub bg_leading_ms: u32,
    pub bg_trailing_ms: u32,
    pub excl_leading_ms: u32,
    pub excl_trailing_ms: u32,
    /// Analyses with fewer qualified channels than this are invalid.
    pub min_active_doms: u32,
    /// Per-channel background mean bounds, in Hz.
    pub min_bkg_rate: f64,
    pub max_bkg_rate: f64,
    /// Per-channel Fano factor (variance / mean) bounds.
    pub min_bkg_fano: f64,
    pub max_bkg_fano: f64,
    /// Reserved: parsed and carried, not consulted by qualification.
    pub max_bkg_abs_skew: f64,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            binsizes: vec![500, 1_500, 4_000, 10_000],
            use_offsets: true,
            use_rebins: true,
            bg_leading_ms: 300_000,
            bg_trailing_ms: 300_000,
            excl_leading_ms: 15_000,
            excl_trailing_ms: 15_000,
            min_active_doms: 100,
            min_bkg_rate: 100.0,
            max_bkg_rate: 5_000.0,
            // Shipped inverted in the reference configuration; normalized in
            // `validate` with a warning.
            min_bkg_fano: 0.8,
            max_bkg_fano: 0.2,
            max_bkg_abs_skew: 1.5,
        }
    }
}

impl AnalysisOptions {
    /// Width of one analysis bin: the base bin when rebinning, else the raw
    /// 2 ms bin.
    pub fn analysis_binsize_ms(&self) -> u32 {
        if self.use_rebins { 500 } else { 2 }
    }

    /// Total duration of background and exclusion blocks, in ms.
    pub fn duration_nosearch_ms(&self) -> u32 {
        self.bg_leading_ms + self.excl_leading_ms + self.bg_trailing_ms + self.excl_trailing_ms
    }

    pub fn max_binsize_ms(&self) -> u32 {
        self.binsizes.iter().copied().max().unwrap_or(0)
    }

    /// Offsets for one binsize under the current offset policy.
    pub fn offsets_for(&self, binsize_ms: u32) -> Vec<u32> {
        if self.use_offsets {
            (0..binsize_ms).step_by(500).collect()
        } else {
            vec![0]
        }
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        if self.binsizes.is_empty() {
            return Err(invalid("analysis.binsizes", "at least one binsize required"));
        }
        let bin = self.analysis_binsize_ms();
        for &b in &self.binsizes {
            if b == 0 || b % 500 != 0 {
                return Err(invalid(
                    "analysis.binsizes",
                    format!("binsize {b} ms must be a nonzero multiple of 500 ms"),
                ));
            }
            if (self.bg_leading_ms + self.bg_trailing_ms) % b != 0 {
                return Err(invalid(
                    "analysis.binsizes",
                    format!(
                        "background duration {} ms is not divisible by binsize {b} ms",
                        self.bg_leading_ms + self.bg_trailing_ms
                    ),
                ));
            }
        }
        for (field, value) in [
            ("analysis.bg_leading_ms", self.bg_leading_ms),
            ("analysis.bg_trailing_ms", self.bg_trailing_ms),
            ("analysis.excl_leading_ms", self.excl_leading_ms),
            ("analysis.excl_trailing_ms", self.excl_trailing_ms),
        ] {
            if value == 0 || value % bin != 0 {
                return Err(invalid(
                    field,
                    format!("{value} ms must be a nonzero multiple of {bin} ms"),
                ));
            }
        }
        if self.min_bkg_rate >= self.max_bkg_rate {
            return Err(invalid(
                "analysis.min_bkg_rate",
                format!(
                    "lower rate bound {} must be below upper bound {}",
                    self.min_bkg_rate, self.max_bkg_rate
                ),
            ));
        }
        if self.min_bkg_fano > self.max_bkg_fano {
            warn!(
                target: "config",
                min = self.min_bkg_fano,
                max = self.max_bkg_fano,
                "fano_bounds_inverted_normalizing"
            );
            std::mem::swap(&mut self.min_bkg_fano, &mut self.max_bkg_fano);
        }
        Ok(())
    }
}

/// Primary-trigger options. The escalation level table is fixed; only the
/// primary threshold and the escalation window length are configurable.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TriggerOptions {
    pub threshold: f64,
    /// Length of the escalation window that a fresh trigger re-arms.
    pub window_ms: u32,
}

impl Default for TriggerOptions {
    fn default() -> Self {
        Self {
            threshold: 4.0,
            window_ms: 30_000,
        }
    }
}

/// Candidate lightcurve span around the search window.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LightcurveOptions {
    pub leading_ms: u32,
    pub trailing_ms: u32,
}

impl Default for LightcurveOptions {
    fn default() -> Self {
        Self {
            leading_ms: 30_000,
            trailing_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilesystemOptions {
    pub dir_scaler: PathBuf,
    pub dir_scaler_bkp: PathBuf,
    pub dir_muon: PathBuf,
    pub dir_muon_bkp: PathBuf,
    pub dir_log: PathBuf,
    /// DOM geometry table.
    pub dom_table: PathBuf,
    /// Move fully consumed scaler files into the backup directory.
    pub rotate_processed: bool,
    /// Abandon a scaler file after this many skipped/bad records.
    pub bad_record_cap: u64,
}

impl Default for FilesystemOptions {
    fn default() -> Self {
        Self {
            dir_scaler: PathBuf::from("data/scaler"),
            dir_scaler_bkp: PathBuf::from("data/scaler_bkp"),
            dir_muon: PathBuf::from("data/pdaq_triggers"),
            dir_muon_bkp: PathBuf::from("data/pdaq_triggers_bkp"),
            dir_log: PathBuf::from("log"),
            dom_table: PathBuf::from("data/config/full_dom_table.txt"),
            rotate_processed: false,
            bad_record_cap: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SinkOptions {
    pub host: String,
    pub port: u16,
    /// Bounded queue between the engine and the sink task; full means drop.
    pub queue_cap: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            host: "expcont".to_string(),
            port: 6668,
            queue_cap: 256,
            max_retries: 5,
            retry_backoff_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub analysis: AnalysisOptions,
    pub trigger: TriggerOptions,
    pub lightcurve: LightcurveOptions,
    pub filesystem: FilesystemOptions,
    pub sink: SinkOptions,
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.analysis.validate()?;
        if self.trigger.window_ms % self.analysis.analysis_binsize_ms() != 0 {
            return Err(invalid(
                "trigger.window_ms",
                format!(
                    "{} ms must be a multiple of the analysis bin",
                    self.trigger.window_ms
                ),
            ));
        }
        if self.sink.queue_cap == 0 {
            return Err(invalid("sink.queue_cap", "queue capacity must be nonzero"));
        }
        Ok(())
    }
}

/// Best-effort config path following platform conventions: a `sico.toml`
/// beside the working directory wins, then the platform config dir.
pub fn discover() -> PathBuf {
    let local = PathBuf::from("sico.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("sico").join("sico.toml");
    }
    PathBuf::from("sico.toml")
}

/// Load a configuration. An explicitly provided path must exist and parse; a
/// discovered path that does not exist falls back to defaults.
pub fn load_from(path: Option<PathBuf>) -> Result<Config, ConfigError> {
    let (path, explicit) = match path {
        Some(p) => (p, true),
        None => (discover(), false),
    };
    match fs::read_to_string(&path) {
        Ok(content) => {
            let config = Config::from_toml(&content)?;
            info!(target: "config", file = %path.display(), "config_loaded");
            Ok(config)
        }
        Err(source) if explicit => Err(ConfigError::Io {
            path: path.display().to_string(),
            source,
        }),
        Err(_) => {
            info!(target: "config", file = %path.display(), "config_missing_using_defaults");
            let mut config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// A fast-response request as delivered by the monitoring system. Optional
/// fields leave the corresponding configuration untouched.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FraRequest {
    pub request_id: String,
    pub start_time: String,
    pub stop_time: String,
    pub fr_type: FrType,
    #[serde(default)]
    pub alert_id: Option<String>,
    #[serde(default)]
    pub test_request: bool,
    #[serde(default)]
    pub bin_sizes: Option<Vec<u32>>,
    #[serde(default)]
    pub offset_search: Option<bool>,
    /// [leading, trailing] in ms.
    #[serde(default)]
    pub bg_duration: Option<[u32; 2]>,
    #[serde(default)]
    pub excl_duration: Option<[u32; 2]>,
    #[serde(default)]
    pub lc_duration: Option<[u32; 2]>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrType {
    #[serde(alias = "CCSN", alias = "Ccsn")]
    Ccsn,
    #[serde(alias = "Merger")]
    Merger,
}

impl FraRequest {
    /// Parse a request object. The upstream producer historically emits
    /// single-quoted pseudo-JSON; accept that form too.
    pub fn parse(json: &str) -> Result<Self, ConfigError> {
        match serde_json::from_str::<FraRequest>(json) {
            Ok(req) => Ok(req),
            Err(first) => {
                let relaxed = json.replace('\'', "\"");
                serde_json::from_str(&relaxed).map_err(|_| ConfigError::Json(first))
            }
        }
    }

    /// Overlay this request's analysis options onto a loaded configuration,
    /// then revalidate.
    pub fn apply_to(&self, config: &mut Config) -> Result<(), ConfigError> {
        if let Some(bin_sizes) = &self.bin_sizes {
            config.analysis.binsizes = bin_sizes.clone();
        }
        if let Some(offset_search) = self.offset_search {
            config.analysis.use_offsets = offset_search;
        }
        if let Some([leading, trailing]) = self.bg_duration {
            config.analysis.bg_leading_ms = leading;
            config.analysis.bg_trailing_ms = trailing;
        }
        if let Some([leading, trailing]) = self.excl_duration {
            config.analysis.excl_leading_ms = leading;
            config.analysis.excl_trailing_ms = trailing;
        }
        if let Some([leading, trailing]) = self.lc_duration {
            config.lightcurve.leading_ms = leading;
            config.lightcurve.trailing_ms = trailing;
        }
        config.validate()
    }
}
