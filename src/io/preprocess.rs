//! TOA extraction from observation files.
//!
//! Extraction itself (template matching against the folded profile) happens
//! outside this crate. The pipeline consumes its output through the
//! [`Preprocessor`] seam: one call per observation, returning TOA lines.

use std::path::PathBuf;

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::domain::{Observation, Toa, ToaNotes};
use crate::error::{TimingError, TimingResult};
use crate::io::tim::parse_tim_line;

pub trait Preprocessor: Sync {
    /// TOA lines for one observation; empty means no usable signal.
    fn extract(&self, observation: &Observation) -> TimingResult<Vec<String>>;
}

/// Reads the `<archive>.tim` sidecar written next to each observation file.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimFilePreprocessor;

impl TimFilePreprocessor {
    pub fn sidecar(observation: &Observation) -> PathBuf {
        let mut name = observation.path.clone().into_os_string();
        name.push(".tim");
        PathBuf::from(name)
    }
}

impl Preprocessor for TimFilePreprocessor {
    fn extract(&self, observation: &Observation) -> TimingResult<Vec<String>> {
        let path = Self::sidecar(observation);
        if !path.exists() {
            debug!(path = %path.display(), "no TOA sidecar");
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&path).map_err(|e| TimingError::io(&path, e))?;
        Ok(text.lines().map(str::to_string).collect())
    }
}

/// Turn extracted lines into exactly one stored TOA record.
fn to_record(observation: &Observation, lines: &[String]) -> TimingResult<Toa> {
    let mut toas = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if let Some(toa) = parse_tim_line(line, idx + 1, observation)? {
            toas.push(toa);
        }
    }
    if toas.len() > 1 {
        warn!(
            content_id = %observation.content_id,
            count = toas.len(),
            "several TOAs extracted, keeping the first"
        );
    }
    Ok(toas.into_iter().next().unwrap_or_else(|| {
        warn!(content_id = %observation.content_id, "no TOA extracted, storing placeholder");
        Toa::invalid(
            observation.content_id.clone(),
            ToaNotes {
                label: observation.label.clone(),
                rcvr: observation.receiver.clone(),
            },
        )
    }))
}

/// Extract TOAs for `observations` in parallel; output keeps input order.
pub fn extract_toas<P: Preprocessor + ?Sized>(
    preprocessor: &P,
    observations: &[Observation],
) -> TimingResult<Vec<Toa>> {
    observations
        .par_iter()
        .map(|obs| {
            let lines = preprocessor.extract(obs)?;
            to_record(obs, &lines)
        })
        .collect()
}
