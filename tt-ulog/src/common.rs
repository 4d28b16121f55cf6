//! Directory layout helpers: `NNNNNNNN.ulog` file naming and id scanning.

use std::path::{Path, PathBuf};

use snafu::ResultExt;

use crate::error::{DirectorySnafu, UlogError};

/// Suffix every update-log data file carries.
pub const SUFFIX: &str = ".ulog";
/// Width of the zero-padded decimal file id.
pub const ID_WIDTH: usize = 8;

/// Builds the path of the data file with the given numeric id.
pub fn path_for(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{id:0width$}{SUFFIX}", width = ID_WIDTH))
}

/// Parses a file name back into its numeric id, if it matches the expected
/// `NNNNNNNN.ulog` shape.
pub fn parse_id(file_name: &str) -> Option<u32> {
    let stem = file_name.strip_suffix(SUFFIX)?;
    if stem.len() != ID_WIDTH || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Scans `dir` for existing data files, returning their ids in ascending
/// order. Creates `dir` if it does not yet exist.
pub async fn scan_ids(dir: &Path) -> Result<Vec<u32>, UlogError> {
    tokio::fs::create_dir_all(dir)
        .await
        .context(DirectorySnafu { path: dir.to_path_buf() })?;

    let mut ids = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .context(DirectorySnafu { path: dir.to_path_buf() })?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .context(DirectorySnafu { path: dir.to_path_buf() })?
    {
        if let Some(name) = entry.file_name().to_str() {
            if let Some(id) = parse_id(name) {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}
