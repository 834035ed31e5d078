//! The live timing-model file and its backups.
//!
//! Layout inside the working directory:
//!
//! ```text
//! pulsar.par
//! parfile_bak/initial_parfile.bak
//! parfile_bak/parfile__2024_01_31__12_00_00.bak
//! ```
//!
//! Before each overwrite the current model is copied to a backup named after
//! the previous solution's timestamp; name collisions get `_1`, `_2`, ...
//! suffixes so no backup is ever overwritten.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{TimingError, TimingResult};
use crate::io::write_atomic;
use crate::models::TimingModel;

const INITIAL_SNAPSHOT: &str = "initial_parfile.bak";

#[derive(Debug, Clone)]
pub struct ModelFile {
    path: PathBuf,
    backup_dir: PathBuf,
}

/// State of the initial-model snapshot relative to the live file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialSnapshot {
    Matches,
    Missing,
}

impl ModelFile {
    /// `pulsar.par` and `parfile_bak/` inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("pulsar.par"), dir.join("parfile_bak"))
    }

    pub fn new(path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup_dir: backup_dir.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn read_text(&self) -> TimingResult<String> {
        std::fs::read_to_string(&self.path).map_err(|e| TimingError::io(&self.path, e))
    }

    pub fn read_model(&self) -> TimingResult<TimingModel> {
        let model = TimingModel::parse(&self.read_text()?)?;
        model.validate()?;
        Ok(model)
    }

    pub fn initial_snapshot_path(&self) -> PathBuf {
        self.backup_dir.join(INITIAL_SNAPSHOT)
    }

    /// Compare the live model with the initial snapshot, byte for byte.
    ///
    /// A mismatch means the pipeline restarted from scratch against an edited
    /// model, which is a configuration error.
    pub fn check_initial_snapshot(&self) -> TimingResult<InitialSnapshot> {
        let snapshot = self.initial_snapshot_path();
        if !snapshot.exists() {
            return Ok(InitialSnapshot::Missing);
        }
        let live = std::fs::read(&self.path).map_err(|e| TimingError::io(&self.path, e))?;
        let saved = std::fs::read(&snapshot).map_err(|e| TimingError::io(&snapshot, e))?;
        if live != saved {
            return Err(TimingError::Configuration(format!(
                "'{}' differs from the initial snapshot '{}'; restore it or remove the snapshot",
                self.path.display(),
                snapshot.display()
            )));
        }
        Ok(InitialSnapshot::Matches)
    }

    pub fn write_initial_snapshot(&self) -> TimingResult<PathBuf> {
        let snapshot = self.initial_snapshot_path();
        let live = std::fs::read(&self.path).map_err(|e| TimingError::io(&self.path, e))?;
        ensure_dir(&self.backup_dir)?;
        write_atomic(&snapshot, &live)?;
        info!(path = %snapshot.display(), "saved initial timing model");
        Ok(snapshot)
    }

    /// Back up the live model, then replace it with `new_text`.
    ///
    /// `previous` is the timestamp of the solution that produced the live model
    /// (the Unix epoch before the first commit). Returns the backup path.
    pub fn commit(&self, new_text: &str, previous: Option<DateTime<Utc>>) -> TimingResult<PathBuf> {
        ensure_dir(&self.backup_dir)?;
        let stamp = previous.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let name = format!("parfile__{}.bak", stamp.format("%Y_%m_%d__%H_%M_%S"));
        let backup = no_overwrite_name(&self.backup_dir.join(name));

        let live = std::fs::read(&self.path).map_err(|e| TimingError::io(&self.path, e))?;
        write_atomic(&backup, &live)?;
        if let Err(e) = write_atomic(&self.path, new_text.as_bytes()) {
            let _ = std::fs::remove_file(&backup);
            return Err(e);
        }
        debug!(backup = %backup.display(), "timing model updated");
        Ok(backup)
    }

    /// Undo a commit: put `original` back and delete the files it wrote.
    ///
    /// `remove_backup_dir` also removes the (then empty) backup directory.
    pub fn rollback(&self, original: &str, written: &[PathBuf], remove_backup_dir: bool) -> TimingResult<()> {
        write_atomic(&self.path, original.as_bytes())?;
        for path in written {
            std::fs::remove_file(path).map_err(|e| TimingError::io(path, e))?;
        }
        if remove_backup_dir {
            std::fs::remove_dir(&self.backup_dir).map_err(|e| TimingError::io(&self.backup_dir, e))?;
        }
        warn!(path = %self.path.display(), removed = written.len(), "timing model rolled back");
        Ok(())
    }

    /// Timestamped backups, oldest name first.
    pub fn backups(&self) -> TimingResult<Vec<PathBuf>> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.backup_dir).map_err(|e| TimingError::io(&self.backup_dir, e))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TimingError::io(&self.backup_dir, e))?;
            let path = entry.path();
            let is_backup = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("parfile__") && n.ends_with(".bak"));
            if is_backup {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

fn ensure_dir(dir: &Path) -> TimingResult<()> {
    std::fs::create_dir_all(dir).map_err(|e| TimingError::io(dir, e))
}

/// `name.bak`, or `name_1.bak`, `name_2.bak`, ... if taken.
pub fn no_overwrite_name(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let ext = path.extension().map(|s| s.to_string_lossy().into_owned());
    (1..)
        .map(|i| {
            let name = match &ext {
                Some(ext) => format!("{stem}_{i}.{ext}"),
                None => format!("{stem}_{i}"),
            };
            path.with_file_name(name)
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const MODEL: &str = "PSRJ J0000+0000\nF0 2.0 1\nPEPOCH 59000\n";

    #[test]
    fn commit_keeps_every_backup() {
        let dir = tempfile::tempdir().unwrap();
        let file = ModelFile::in_dir(dir.path());
        std::fs::write(file.path(), MODEL).unwrap();

        let stamp = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        let first = file.commit("PSRJ J0000+0000\nF0 2.1\nPEPOCH 59000\n", Some(stamp)).unwrap();
        let second = file.commit("PSRJ J0000+0000\nF0 2.2\nPEPOCH 59000\n", Some(stamp)).unwrap();

        assert_eq!(first.file_name().unwrap(), "parfile__2024_03_05__07_08_09.bak");
        assert_eq!(second.file_name().unwrap(), "parfile__2024_03_05__07_08_09_1.bak");
        assert_eq!(std::fs::read_to_string(&first).unwrap(), MODEL);
        assert!(std::fs::read_to_string(&second).unwrap().contains("F0 2.1"));
        assert!(file.read_text().unwrap().contains("F0 2.2"));
        assert_eq!(file.backups().unwrap().len(), 2);
    }

    #[test]
    fn first_commit_uses_epoch_name() {
        let dir = tempfile::tempdir().unwrap();
        let file = ModelFile::in_dir(dir.path());
        std::fs::write(file.path(), MODEL).unwrap();
        let backup = file.commit(MODEL, None).unwrap();
        assert_eq!(backup.file_name().unwrap(), "parfile__1970_01_01__00_00_00.bak");
    }

    #[test]
    fn initial_snapshot_detects_edits() {
        let dir = tempfile::tempdir().unwrap();
        let file = ModelFile::in_dir(dir.path());
        std::fs::write(file.path(), MODEL).unwrap();

        assert_eq!(file.check_initial_snapshot().unwrap(), InitialSnapshot::Missing);
        file.write_initial_snapshot().unwrap();
        assert_eq!(file.check_initial_snapshot().unwrap(), InitialSnapshot::Matches);

        std::fs::write(file.path(), format!("{MODEL}F1 0\n")).unwrap();
        let err = file.check_initial_snapshot().unwrap_err();
        assert!(matches!(err, TimingError::Configuration(_)));
    }
}
