//! The tailing reader used both by replica catch-up and by the master side
//! of the `repl` command to stream its own log to a connecting replica.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use snafu::ResultExt;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

use crate::common::{path_for, scan_ids};
use crate::entry::{read_entry, ReadOutcome, UlogEntry};
use crate::error::{FileSnafu, UlogError};
use crate::writer::UpdateLog;

/// Allowed clock skew, in microseconds, subtracted from a tailer's starting
/// timestamp before searching for the file to resume from.
const CLOCK_SKEW_SLACK_MICROS: u64 = 30_000_000;

/// Forward-only reader over a log directory, resuming near a given
/// timestamp and advancing across file rotations as it goes.
pub struct UlogTailer {
    ulog: Arc<UpdateLog>,
    start_ts: u64,
    current_id: u32,
    file: Option<BufReader<File>>,
}

impl UlogTailer {
    /// Creates a tailer that will yield entries with `ts >= start_ts`,
    /// resuming from whichever data file is most likely to contain them.
    pub async fn new(ulog: Arc<UpdateLog>, start_ts: u64) -> Result<Self, UlogError> {
        let dir = ulog.base_dir().to_path_buf();
        let slack = start_ts.saturating_sub(CLOCK_SKEW_SLACK_MICROS);
        let current_id = choose_start_id(&dir, slack).await?;
        Ok(Self {
            ulog,
            start_ts,
            current_id,
            file: None,
        })
    }

    async fn ensure_open(&mut self) -> Result<bool, UlogError> {
        if self.file.is_some() {
            return Ok(true);
        }
        let path = path_for(self.ulog.base_dir(), self.current_id);
        match File::open(&path).await {
            Ok(f) => {
                self.file = Some(BufReader::new(f));
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(UlogError::File { path, source }),
        }
    }

    /// Reads the next entry with `ts >= start_ts`, transparently advancing
    /// across rotated files. Returns `None` once it has caught up to the
    /// current end of the log.
    pub async fn read(&mut self) -> Result<Option<UlogEntry>, UlogError> {
        loop {
            if !self.ensure_open().await? {
                return Ok(None);
            }
            let outcome = {
                let file = self.file.as_mut().expect("ensure_open guarantees Some");
                read_entry(file).await.map_err(|source| UlogError::File {
                    path: path_for(self.ulog.base_dir(), self.current_id),
                    source,
                })?
            };
            match outcome {
                ReadOutcome::Entry(entry) => {
                    if entry.ts < self.start_ts {
                        continue;
                    }
                    return Ok(Some(entry));
                }
                ReadOutcome::Eof => {
                    let ids = scan_ids(self.ulog.base_dir()).await?;
                    match ids.iter().find(|&&id| id > self.current_id) {
                        Some(&next_id) => {
                            self.current_id = next_id;
                            self.file = None;
                            continue;
                        }
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// Blocks (with a 1-second internal timeout so rotations by another
    /// process are still noticed) until the log has been appended to.
    pub async fn wait(&self) {
        self.ulog.wait(Duration::from_secs(1)).await;
    }
}

/// Finds the id of the data file to resume reading from: scanning from the
/// highest id downward, the first file whose first entry's `ts` is at or
/// before `slack` (or, if none qualifies, the oldest file, so that a
/// request older than all retained data starts from the very beginning).
async fn choose_start_id(dir: &Path, slack: u64) -> Result<u32, UlogError> {
    let ids = scan_ids(dir).await?;
    let Some(&oldest) = ids.first() else {
        return Ok(0);
    };
    let mut chosen = oldest;
    for &id in ids.iter().rev() {
        chosen = id;
        let first_ts = first_entry_ts(dir, id).await?.unwrap_or(u64::MAX);
        if slack >= first_ts {
            break;
        }
    }
    Ok(chosen)
}

/// Reads just enough of a data file's header to learn its first entry's
/// `ts`, without deserializing the whole entry. Returns `None` for an empty
/// or too-short file (e.g. freshly rotated, nothing appended yet).
async fn first_entry_ts(dir: &Path, id: u32) -> Result<Option<u64>, UlogError> {
    let path = path_for(dir, id);
    let mut file = match File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(UlogError::File { path, source }),
    };
    let mut prefix = [0u8; 9]; // magic(1) + ts(8)
    let mut filled = 0;
    loop {
        let n = file
            .read(&mut prefix[filled..])
            .await
            .context(FileSnafu { path: path.clone() })?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == prefix.len() {
            break;
        }
    }
    if filled < prefix.len() {
        return Ok(None);
    }
    Ok(Some(u64::from_be_bytes(prefix[1..9].try_into().unwrap())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn tailer_yields_entries_in_order_and_then_blocks() {
        let tmp = tempfile::tempdir().unwrap();
        let log = UpdateLog::open(tmp.path().to_path_buf(), 0, false).await.unwrap();
        log.append(0, 1, 1, Bytes::from_static(b"\xc8\x10a")).await.unwrap();
        log.append(0, 1, 1, Bytes::from_static(b"\xc8\x10b")).await.unwrap();

        let mut tailer = UlogTailer::new(Arc::clone(&log), 0).await.unwrap();
        let first = tailer.read().await.unwrap().expect("first entry");
        assert_eq!(&first.payload[..], b"\xc8\x10a");
        let second = tailer.read().await.unwrap().expect("second entry");
        assert_eq!(&second.payload[..], b"\xc8\x10b");
        assert!(tailer.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tailer_filters_entries_older_than_start_ts() {
        let tmp = tempfile::tempdir().unwrap();
        let log = UpdateLog::open(tmp.path().to_path_buf(), 0, false).await.unwrap();
        let ts1 = log.append(1_000_000, 1, 1, Bytes::from_static(b"\xc8\x10a")).await.unwrap();
        let _ = ts1;
        let ts2 = log.append(2_000_000, 1, 1, Bytes::from_static(b"\xc8\x10b")).await.unwrap();

        let mut tailer = UlogTailer::new(Arc::clone(&log), ts2).await.unwrap();
        let only = tailer.read().await.unwrap().expect("second entry only");
        assert_eq!(&only.payload[..], b"\xc8\x10b");
        assert!(tailer.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tailer_advances_across_rotated_files() {
        let tmp = tempfile::tempdir().unwrap();
        let log = UpdateLog::open(tmp.path().to_path_buf(), 20, false).await.unwrap();
        for _ in 0..5u8 {
            log.append(0, 1, 1, Bytes::from_static(b"\xc8\x10payload")).await.unwrap();
        }
        let ids = scan_ids(tmp.path()).await.unwrap();
        assert!(ids.len() > 1);

        let mut tailer = UlogTailer::new(Arc::clone(&log), 0).await.unwrap();
        let mut count = 0;
        while tailer.read().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 5);
    }
}
