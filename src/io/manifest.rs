//! Observation manifests.
//!
//! A manifest is a JSON array of `{ "mjd", "path", "label", "rcvr" }` objects.
//! Relative paths are resolved against the manifest's directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::Observation;
use crate::error::{TimingError, TimingResult};
use crate::io::write_atomic;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    mjd: f64,
    path: PathBuf,
    #[serde(default)]
    label: String,
    #[serde(default)]
    rcvr: String,
}

pub fn read_manifest(path: &Path) -> TimingResult<Vec<Observation>> {
    let text = std::fs::read_to_string(path).map_err(|e| TimingError::io(path, e))?;
    let entries: Vec<ManifestEntry> = serde_json::from_str(&text).map_err(|e| TimingError::json(path, e))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let mut observations = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.into_iter().enumerate() {
        if !entry.mjd.is_finite() {
            return Err(TimingError::Parse {
                line: idx + 1,
                message: format!("manifest entry {} has a non-finite MJD", idx + 1),
            });
        }
        let file = if entry.path.is_absolute() {
            entry.path
        } else {
            base.join(entry.path)
        };
        observations.push(Observation::new(entry.mjd, file, entry.label, entry.rcvr));
    }
    observations.sort_by(|a, b| a.mjd.total_cmp(&b.mjd));
    Ok(observations)
}

/// Write `observations` with paths relative to the manifest directory where possible.
pub fn write_manifest(path: &Path, observations: &[Observation]) -> TimingResult<()> {
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let entries: Vec<ManifestEntry> = observations
        .iter()
        .map(|obs| ManifestEntry {
            mjd: obs.mjd,
            path: obs
                .path
                .strip_prefix(base)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| obs.path.clone()),
            label: obs.label.clone(),
            rcvr: obs.receiver.clone(),
        })
        .collect();
    let json = serde_json::to_string_pretty(&entries).map_err(|e| TimingError::json(path, e))?;
    write_atomic(path, json.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_resolves_relative_paths_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(
            &path,
            r#"[
                {"mjd": 59002.0, "path": "obs/b_59002.0.ar", "label": "x"},
                {"mjd": 59001.0, "path": "/abs/a_59001.0.ar", "rcvr": "pulsar"}
            ]"#,
        )
        .unwrap();

        let obs = read_manifest(&path).unwrap();
        assert_eq!(obs.len(), 2);
        assert_eq!(obs[0].path, PathBuf::from("/abs/a_59001.0.ar"));
        assert_eq!(obs[0].content_id, "a_59001.0");
        assert_eq!(obs[0].receiver, "pulsar");
        assert_eq!(obs[1].path, dir.path().join("obs/b_59002.0.ar"));
        assert_eq!(obs[1].label, "x");
    }

    #[test]
    fn written_manifest_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let observations = vec![Observation::new(59000.5, dir.path().join("obs/c_59000.5.ar"), "l", "r")];
        write_manifest(&path, &observations).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"obs/c_59000.5.ar\""));
        assert_eq!(read_manifest(&path).unwrap(), observations);
    }
}
