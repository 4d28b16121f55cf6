//! The replication timestamp (RTS) file: a single small file holding the
//! last log timestamp a replica has fully applied from its master.

use std::path::{Path, PathBuf};

use snafu::{OptionExt, ResultExt};
use tokio::io::AsyncWriteExt;

use crate::error::{RtsParseSnafu, RtsSnafu, UlogError};

/// Handle to a replica's RTS file.
pub struct RtsFile {
    path: PathBuf,
}

impl RtsFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Reads the stored timestamp, or `0` if the file does not exist yet
    /// (a fresh replica with no prior progress).
    pub async fn read(&self) -> Result<u64, UlogError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents
                .trim()
                .parse::<u64>()
                .ok()
                .context(RtsParseSnafu { path: self.path.clone() }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(source) => Err(UlogError::Rts {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Writes `ts` atomically: write to a sibling temp file, then rename
    /// over the real path, so a crash mid-write never leaves a truncated or
    /// partially-written RTS file behind.
    pub async fn write(&self, ts: u64) -> Result<(), UlogError> {
        let tmp_path = tmp_path_for(&self.path);
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .context(RtsSnafu { path: tmp_path.clone() })?;
        file.write_all(format!("{ts}\n").as_bytes())
            .await
            .context(RtsSnafu { path: tmp_path.clone() })?;
        file.sync_data().await.context(RtsSnafu { path: tmp_path.clone() })?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .context(RtsSnafu { path: self.path.clone() })?;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_owned())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_reads_as_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let rts = RtsFile::new(tmp.path().join("rts"));
        assert_eq!(rts.read().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let rts = RtsFile::new(tmp.path().join("rts"));
        rts.write(123_456_789).await.unwrap();
        assert_eq!(rts.read().await.unwrap(), 123_456_789);
        rts.write(200).await.unwrap();
        assert_eq!(rts.read().await.unwrap(), 200);
    }
}
