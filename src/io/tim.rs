//! TOA text lines and observation identifiers.
//!
//! A TOA line has exactly five whitespace-separated fields:
//!
//! ```text
//! <file> <freq MHz> <TOA MJD> <error µs> <telescope>
//! ```
//!
//! `FORMAT 1` headers, blank lines and `C`/`#` comments are skipped.

use std::path::Path;

use crate::domain::{Observation, Toa, ToaNotes};
use crate::error::{TimingError, TimingResult};

/// Stable identifier of an observation file.
///
/// The file name is split on `.`; a segment is kept while the boundary reads
/// as a decimal number (`59000.5`), so `J1234_59000.52.ar` → `J1234_59000.52`.
pub fn content_id_from_path(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut segments = name.split('.');
    let mut id = segments.next().unwrap_or_default().to_string();
    let mut prev_last = id.chars().last();

    for segment in segments {
        let joins = match (prev_last, segment.chars().next()) {
            (Some(a), Some(b)) => format!("{a}.{b}").parse::<f64>().is_ok(),
            _ => false,
        };
        if !joins {
            break;
        }
        id.push('.');
        id.push_str(segment);
        prev_last = segment.chars().last();
    }
    id
}

pub fn format_tim_line(file: &str, frequency: f64, mjd: f64, error_us: f64, telescope: &str) -> String {
    format!("{file} {frequency:.6} {mjd:.15} {error_us:.3} {telescope}")
}

fn is_skippable(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty()
        || trimmed.starts_with("FORMAT")
        || trimmed.starts_with('#')
        || trimmed.starts_with("C ")
}

fn field<T: std::str::FromStr>(token: &str, what: &str, line: usize) -> TimingResult<T> {
    token.parse::<T>().map_err(|_| TimingError::Parse {
        line,
        message: format!("invalid {what} '{token}'"),
    })
}

/// Parse one TOA line for `observation`.
///
/// Returns `Ok(None)` for skippable lines.
pub fn parse_tim_line(line: &str, line_no: usize, observation: &Observation) -> TimingResult<Option<Toa>> {
    if is_skippable(line) {
        return Ok(None);
    }
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(TimingError::Parse {
            line: line_no,
            message: format!("expected 5 fields, found {}", fields.len()),
        });
    }

    let file_id = content_id_from_path(Path::new(fields[0]));
    if file_id != observation.content_id {
        return Err(TimingError::DataIntegrity(format!(
            "TOA line names '{file_id}' but was extracted for '{}'",
            observation.content_id
        )));
    }

    let frequency: f64 = field(fields[1], "frequency", line_no)?;
    let mjd: f64 = field(fields[2], "TOA", line_no)?;
    let error_us: f64 = field(fields[3], "TOA error", line_no)?;
    if !(mjd.is_finite() && error_us.is_finite() && error_us > 0.0) {
        return Err(TimingError::Parse {
            line: line_no,
            message: format!("TOA must be finite with a positive error, got {mjd} ± {error_us}"),
        });
    }

    Ok(Some(Toa {
        content_id: observation.content_id.clone(),
        frequency,
        mjd,
        error_us,
        telescope: fields[4].to_string(),
        raw_line: line.trim().to_string(),
        notes: ToaNotes {
            label: observation.label.clone(),
            rcvr: observation.receiver.clone(),
        },
    }))
}

/// Render TOAs as a tim file, skipping invalid placeholders.
pub fn render_tim(toas: &[Toa]) -> String {
    let mut out = String::from("FORMAT 1\n");
    for toa in toas.iter().filter(|t| t.is_valid()) {
        out.push_str(&toa.raw_line);
        out.push('\n');
    }
    out
}
