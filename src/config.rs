//! Pipeline configuration.
//!
//! Loaded from a JSON file with four sections:
//!
//! ```json
//! {
//!   "settings":    { "fit_every_n_days": 1, "reset_params": true, "fit_params": ["F0", "F1", "RAJ", "DECJ"],
//!                    "toa_jumps": { "gbt": [0.0012, 0.00001] } },
//!   "ignore_mjds": { "earlier_than": 0, "later_than": null },
//!   "policy":      { ... filter / admission thresholds ... },
//!   "metadata":    { "tag": "untagged" }
//! }
//! ```
//!
//! Unknown top-level sections are rejected; unknown keys inside a known section
//! are logged and ignored. Every section and key is optional.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::domain::FitStrategyKind;
use crate::error::{TimingError, TimingResult};

const SECTIONS: [(&str, &[&str]); 4] = [
    (
        "settings",
        &[
            "fit_every_n_days",
            "reset_params",
            "fit_params",
            "fit_strategy",
            "mcmc_seed",
            "toa_jumps",
        ],
    ),
    ("ignore_mjds", &["earlier_than", "later_than"]),
    (
        "policy",
        &[
            "min_toas_to_filter",
            "chi2r_fallback_threshold",
            "cluster_gap_mad_multiple",
            "error_filter",
            "deviation_filter",
            "dropout_filter",
            "admission",
        ],
    ),
    ("metadata", &["tag"]),
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub ignore_mjds: IgnoreMjds,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Minimum span (days) between the last fitted observation and the next batch.
    pub fit_every_n_days: f64,
    /// Zero F1/PX/PMRA/PMDEC before each fit when they are not free.
    pub reset_params: bool,
    /// Parameters the pipeline is allowed to free.
    pub fit_params: Vec<String>,
    pub fit_strategy: FitStrategyKind,
    pub mcmc_seed: u64,
    /// Receiver → `[offset, uncertainty]` (s), added as `JUMP` lines to the
    /// working model. Zero offsets are skipped.
    pub toa_jumps: BTreeMap<String, (f64, f64)>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fit_every_n_days: 1.0,
            reset_params: true,
            fit_params: ["F0", "F1", "RAJ", "DECJ"].map(String::from).to_vec(),
            fit_strategy: FitStrategyKind::Direct,
            mcmc_seed: 0,
            toa_jumps: BTreeMap::new(),
        }
    }
}

/// Observations outside `[earlier_than, later_than]` are never used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreMjds {
    pub earlier_than: f64,
    pub later_than: Option<f64>,
}

impl IgnoreMjds {
    pub fn contains(&self, mjd: f64) -> bool {
        mjd >= self.earlier_than && self.later_than.is_none_or(|later| mjd <= later)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub tag: String,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            tag: "untagged".to_string(),
        }
    }
}

/// Numeric thresholds for filtering, fallback and parameter admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Below this many TOAs the filter pipeline is a no-op.
    pub min_toas_to_filter: usize,
    /// Direct fits with a reduced chi-square above this trigger the clustering fallback.
    pub chi2r_fallback_threshold: f64,
    /// Cluster split when a gap exceeds `median + multiple × MAD` of all gaps.
    pub cluster_gap_mad_multiple: f64,
    pub error_filter: ErrorFilterPolicy,
    pub deviation_filter: DeviationFilterPolicy,
    pub dropout_filter: DropoutFilterPolicy,
    pub admission: AdmissionPolicy,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            min_toas_to_filter: 5,
            chi2r_fallback_threshold: 10.0,
            cluster_gap_mad_multiple: 12.0,
            error_filter: ErrorFilterPolicy::default(),
            deviation_filter: DeviationFilterPolicy::default(),
            dropout_filter: DropoutFilterPolicy::default(),
            admission: AdmissionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorFilterPolicy {
    /// Initial threshold as a fraction of the spin period.
    pub period_fraction: f64,
    /// Absolute threshold floor (µs).
    pub floor_us: f64,
    /// Increment of `period_fraction` while too many TOAs are rejected.
    pub relax_step: f64,
    pub max_reject_fraction: f64,
}

impl Default for ErrorFilterPolicy {
    fn default() -> Self {
        Self {
            period_fraction: 0.01,
            floor_us: 15_000.0,
            relax_step: 0.05,
            max_reject_fraction: 0.10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviationFilterPolicy {
    /// Stage runs when strictly more TOAs than this remain.
    pub min_toas: usize,
    pub min_free_params: usize,
    pub n_sigma: f64,
    pub protect_newest: usize,
    /// Within-noise exemption: residual below this fraction of a period...
    pub noise_period_fraction: f64,
    /// ...and below this multiple of the median TOA error.
    pub noise_error_multiple: f64,
}

impl Default for DeviationFilterPolicy {
    fn default() -> Self {
        Self {
            min_toas: 90,
            min_free_params: 4,
            n_sigma: 3.0,
            protect_newest: 3,
            noise_period_fraction: 0.015,
            noise_error_multiple: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DropoutFilterPolicy {
    pub mad_multiple: f64,
    pub max_reject_fraction: f64,
    pub protect_newest: usize,
    /// Newest TOAs lose protection when separated by more than this (days)...
    pub suspect_gap_days: f64,
    /// ...and the data set spans fewer days than this...
    pub short_span_days: f64,
    /// ...or holds fewer TOAs than this.
    pub short_count: usize,
}

impl Default for DropoutFilterPolicy {
    fn default() -> Self {
        Self {
            mad_multiple: 30.0,
            max_reject_fraction: 0.25,
            protect_newest: 3,
            suspect_gap_days: 30.0,
            short_span_days: 60.0,
            short_count: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRule {
    pub name: String,
    /// Data span (days) at which the parameter becomes a candidate.
    pub min_span_days: f64,
    #[serde(default)]
    pub requires: Vec<String>,
}

impl ParameterRule {
    fn new(name: &str, min_span_days: f64, requires: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            min_span_days,
            requires: requires.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapGuard {
    pub latest_n: usize,
    pub max_gap_days: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionPolicy {
    pub always_fit: Vec<String>,
    pub rules: Vec<ParameterRule>,
    pub gap_guards: Vec<GapGuard>,
    pub p_value_threshold: f64,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            always_fit: vec!["F0".to_string()],
            rules: vec![
                ParameterRule::new("DECJ", 30.0, &[]),
                ParameterRule::new("RAJ", 30.0, &[]),
                ParameterRule::new("F1", 60.0, &[]),
                ParameterRule::new("PX", 300.0, &[]),
                ParameterRule::new("F2", 500.0, &["F1"]),
                ParameterRule::new("F3", 600.0, &["F1", "F2"]),
                ParameterRule::new("PMDEC", 700.0, &[]),
                ParameterRule::new("PMRA", 800.0, &[]),
            ],
            gap_guards: vec![
                GapGuard {
                    latest_n: 3,
                    max_gap_days: 15.0,
                },
                GapGuard {
                    latest_n: 5,
                    max_gap_days: 30.0,
                },
            ],
            p_value_threshold: 0.05,
        }
    }
}

/// What `sync_with_stored` decided to do with the persisted snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSync {
    Unchanged,
    /// Persist this value (first run, or the stored snapshot lacked keys).
    Store(Value),
}

impl TimingConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(text: &str, origin: &Path) -> TimingResult<Self> {
        let value: Value = serde_json::from_str(text).map_err(|e| TimingError::json(origin, e))?;
        check_known_keys(&value)?;
        let config: TimingConfig =
            serde_json::from_value(value).map_err(|e| TimingError::json(origin, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> TimingResult<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| TimingError::io(path, e))?;
        Self::from_json_str(&text, path)
    }

    pub fn validate(&self) -> TimingResult<()> {
        let s = &self.settings;
        if !(s.fit_every_n_days.is_finite() && s.fit_every_n_days >= 0.0) {
            return Err(TimingError::Configuration(format!(
                "settings.fit_every_n_days must be a non-negative number, got {}",
                s.fit_every_n_days
            )));
        }
        if let Some(later) = self.ignore_mjds.later_than {
            if later < self.ignore_mjds.earlier_than {
                return Err(TimingError::Configuration(format!(
                    "ignore_mjds window is empty: earlier_than={} later_than={later}",
                    self.ignore_mjds.earlier_than
                )));
            }
        }
        let p = &self.policy.admission.p_value_threshold;
        if !(0.0..=1.0).contains(p) {
            return Err(TimingError::Configuration(format!(
                "policy.admission.p_value_threshold must lie in [0, 1], got {p}"
            )));
        }
        for (receiver, (offset, uncertainty)) in &s.toa_jumps {
            if !(offset.is_finite() && uncertainty.is_finite()) {
                return Err(TimingError::Configuration(format!(
                    "settings.toa_jumps.{receiver}: offset and uncertainty must be finite"
                )));
            }
        }
        for name in &s.fit_params {
            if name.parse::<crate::models::FitParam>().is_err() {
                return Err(TimingError::Configuration(format!(
                    "settings.fit_params: '{name}' is not a fittable parameter"
                )));
            }
        }
        Ok(())
    }

    pub fn to_value(&self) -> TimingResult<Value> {
        serde_json::to_value(self).map_err(|e| {
            TimingError::Configuration(format!("failed to serialize configuration: {e}"))
        })
    }

    /// Compare against the snapshot persisted in the store.
    ///
    /// Every key present in both must agree; otherwise the pipeline was restarted
    /// with a different configuration and must stop. Keys missing from the
    /// snapshot are filled in.
    pub fn sync_with_stored(&self, stored: Option<&Value>) -> TimingResult<ConfigSync> {
        let current = self.to_value()?;
        let Some(stored) = stored else {
            info!("no stored configuration, recording the current one");
            return Ok(ConfigSync::Store(current));
        };

        let mut drift = Vec::new();
        let mut merged = stored.clone();
        let mut missing = false;
        diff_values("", &current, stored, &mut drift);
        if let Some(path) = drift.first() {
            return Err(TimingError::Configuration(format!(
                "configuration differs from the stored snapshot at '{path}'; \
                 restore the original configuration or start from a clean store"
            )));
        }
        fill_missing(&current, &mut merged, &mut missing);
        if missing {
            info!("stored configuration lacked keys, updating snapshot");
            Ok(ConfigSync::Store(merged))
        } else {
            Ok(ConfigSync::Unchanged)
        }
    }
}

fn check_known_keys(value: &Value) -> TimingResult<()> {
    let Some(root) = value.as_object() else {
        return Err(TimingError::Configuration(
            "configuration must be a JSON object".to_string(),
        ));
    };
    for (section, body) in root {
        let Some((_, keys)) = SECTIONS.iter().find(|(name, _)| name == section) else {
            return Err(TimingError::Configuration(format!(
                "unknown configuration section '{section}'"
            )));
        };
        if let Some(body) = body.as_object() {
            for key in body.keys() {
                if !keys.contains(&key.as_str()) {
                    warn!(section = %section, key = %key, "ignoring unknown configuration key");
                }
            }
        }
    }
    Ok(())
}

/// Collect paths where both values define a key but disagree.
fn diff_values(prefix: &str, current: &Value, stored: &Value, out: &mut Vec<String>) {
    match (current, stored) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, av) in a {
                if let Some(bv) = b.get(key) {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    diff_values(&path, av, bv, out);
                }
            }
        }
        (a, b) if values_equal(a, b) => {}
        _ => out.push(prefix.to_string()),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn fill_missing(current: &Value, stored: &mut Value, missing: &mut bool) {
    if let (Value::Object(a), Value::Object(b)) = (current, stored) {
        for (key, av) in a {
            match b.get_mut(key) {
                Some(bv) => fill_missing(av, bv, missing),
                None => {
                    b.insert(key.clone(), av.clone());
                    *missing = true;
                }
            }
        }
    }
}
