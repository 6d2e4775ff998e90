//! Trigger detection and candidate lifecycle.
//!
//! Two variants share the state machinery: the online variant opens a
//! candidate on a primary-threshold crossing and holds it through a sliding
//! escalation window, replacing it whenever a strictly higher ξ appears; the
//! fast-response variant is keyed on an externally supplied trigger time and
//! finalizes matching analyses in the cycle they fire.

mod candidate;
mod enrich;
mod levels;
mod monitor;

pub use candidate::Candidate;
pub use enrich::{Lightcurve, attach_muon_series, build_lightcurve, enrich_candidate};
pub use levels::{TRIGGER_LEVELS, TriggerLevel, matched_levels};
pub use monitor::{TriggerMode, TriggerMonitor};
