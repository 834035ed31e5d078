//! Input/output helpers.
//!
//! - TOA lines and observation ids (`tim`)
//! - observation manifests (`manifest`)
//! - TOA extraction seam (`preprocess`)
//! - live model file + backups (`model_file`)
//! - TOA/solution persistence (`store`)

use std::path::Path;

use crate::error::{TimingError, TimingResult};

pub mod manifest;
pub mod model_file;
pub mod preprocess;
pub mod store;
pub mod tim;

pub use manifest::*;
pub use model_file::*;
pub use preprocess::*;
pub use store::*;

/// Write via a sibling temp file and rename, so readers never see a partial file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> TimingResult<()> {
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    std::fs::write(&tmp, bytes).map_err(|e| TimingError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| TimingError::io(path, e))
}
