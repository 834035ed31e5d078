//! Shared domain types.
//!
//! Everything persisted by the TOA store is defined here and is serde-serializable:
//!
//! - observations waiting to be timed (`Observation`)
//! - extracted times of arrival (`Toa`)
//! - committed fit records (`TimingSolution`)
//!
//! Units: MJD in days, TOA uncertainties and residuals in microseconds,
//! radio frequencies in MHz.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::io::tim::content_id_from_path;

/// Placeholder raw line for an observation that produced no usable TOA.
pub const INVALID_TOA: &str = "INVALID_TOA";

/// Remark attached to a solution whose fit did not converge.
pub const FITTING_FAILED: &str = "FITTING_FAILED";

/// Remark attached to a solution produced by the cluster-folding fallback.
pub const CLUSTERING_FALLBACK: &str = "CLUSTERING_FALLBACK";

/// One observation file available to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub mjd: f64,
    pub path: PathBuf,
    /// Stable identifier derived from the file name, see [`content_id_from_path`].
    pub content_id: String,
    pub label: String,
    pub receiver: String,
}

impl Observation {
    pub fn new(mjd: f64, path: impl Into<PathBuf>, label: impl Into<String>, receiver: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            mjd,
            content_id: content_id_from_path(&path),
            path,
            label: label.into(),
            receiver: receiver.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToaNotes {
    pub label: String,
    pub rcvr: String,
}

/// A time of arrival extracted from one observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Toa {
    pub content_id: String,
    /// Observing frequency (MHz).
    pub frequency: f64,
    /// Arrival time (MJD).
    pub mjd: f64,
    /// Uncertainty (µs).
    pub error_us: f64,
    pub telescope: String,
    pub raw_line: String,
    pub notes: ToaNotes,
}

impl Toa {
    /// Record kept for an observation from which no TOA could be extracted.
    ///
    /// Stored so the observation is not re-processed; never used in fits.
    pub fn invalid(content_id: impl Into<String>, notes: ToaNotes) -> Self {
        Self {
            content_id: content_id.into(),
            frequency: 0.0,
            mjd: 0.0,
            error_us: 0.0,
            telescope: String::new(),
            raw_line: INVALID_TOA.to_string(),
            notes,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.raw_line != INVALID_TOA
    }
}

/// Which filter stage rejected a TOA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    Error,
    Deviation,
    Dropout,
}

impl FilterStage {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterStage::Error => "error",
            FilterStage::Deviation => "deviation",
            FilterStage::Dropout => "dropout",
        }
    }
}

/// Per-TOA verdict of the filter pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum FilterDecision {
    Kept,
    Rejected { stage: FilterStage, residual_us: f64 },
}

/// How the engine chooses between the direct and the sampling fitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FitStrategyKind {
    Direct,
    Mcmc,
    /// `mcmc` when more than two parameters are free, `direct` otherwise.
    Auto,
}

/// Parameters for one cycle: `mandatory` are always free, `candidates` must
/// earn admission through the F-test.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSet {
    pub mandatory: Vec<String>,
    pub candidates: Vec<String>,
}

/// Paired residual values and uncertainties (µs).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Residuals {
    pub val: Vec<f64>,
    pub err: Vec<f64>,
}

impl Residuals {
    pub fn len(&self) -> usize {
        self.val.len()
    }

    pub fn is_empty(&self) -> bool {
        self.val.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BadToa {
    pub content_id: String,
    pub mjd: f64,
    pub stage: FilterStage,
    pub residual_us: f64,
    pub error_us: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolutionNotes {
    /// Full text of the fitted timing model.
    pub fitted_model: String,
    /// Human-readable fit summary.
    pub fitted_summary: String,
    /// MJDs of the TOAs that entered the final fit.
    pub fitted_mjds: Vec<f64>,
    pub bad_toas: Vec<BadToa>,
    #[serde(default)]
    pub remark: Vec<String>,
    /// Candidates admitted this cycle, with the winning F-test p-value.
    #[serde(default)]
    pub admitted: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission_p_value: Option<f64>,
}

/// A committed fit record.
///
/// `chi2`/`chi2_reduced` are `None` when the fit failed and the input model was
/// committed unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingSolution {
    pub timestamp: DateTime<Utc>,
    pub content_ids: Vec<String>,
    pub obs_mjds: Vec<f64>,
    pub unfrozen_params: Vec<String>,
    pub residuals: Residuals,
    pub chi2: Option<f64>,
    pub chi2_reduced: Option<f64>,
    pub fitted_params: BTreeMap<String, f64>,
    pub notes: SolutionNotes,
}

impl TimingSolution {
    /// Latest observation MJD covered by this solution.
    pub fn last_mjd(&self) -> Option<f64> {
        self.obs_mjds.iter().copied().reduce(f64::max)
    }

    pub fn has_remark(&self, remark: &str) -> bool {
        self.notes.remark.iter().any(|r| r == remark)
    }

    pub fn fit_failed(&self) -> bool {
        self.has_remark(FITTING_FAILED)
    }
}

/// Result of one call to `advance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Success,
    /// No observation far enough past the last solution.
    NoNewData,
    Error,
}

impl CycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleStatus::Success => "success",
            CycleStatus::NoNewData => "no_files",
            CycleStatus::Error => "error",
        }
    }
}

/// Where a cycle is in its life. Traced on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    NoSolutionYet,
    BatchSelected,
    Filtered,
    FitAttempted,
    Committed,
    NoFiles,
    Failed,
}
