//! PID file lifecycle (§4.J): write on start, remove on clean termination,
//! and the `-kl` "kill predecessor" startup behavior.

use std::path::Path;

use snafu::{ResultExt, Snafu};
use tracing::{info, warn};

#[derive(Debug, Snafu)]
pub enum PidFileError {
    #[snafu(display("failed to read pid file {}: {source}", path.display()))]
    Read { path: std::path::PathBuf, source: std::io::Error },
    #[snafu(display("pid file {} does not contain a valid process id", path.display()))]
    Parse { path: std::path::PathBuf },
    #[snafu(display("failed to write pid file {}: {source}", path.display()))]
    Write { path: std::path::PathBuf, source: std::io::Error },
}

/// Reads the pid recorded in `path`, if any.
pub fn read(path: &Path) -> Result<Option<u32>, PidFileError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => contents
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| PidFileError::Parse { path: path.to_path_buf() }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(PidFileError::Read { path: path.to_path_buf(), source }),
    }
}

/// Writes the current process id to `path`.
pub fn write(path: &Path) -> Result<(), PidFileError> {
    std::fs::write(path, format!("{}\n", std::process::id())).context(WriteSnafu { path: path.to_path_buf() })
}

/// Removes `path`, ignoring a "does not exist" error: a best-effort
/// cleanup step during shutdown.
pub fn remove(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %e, path = %path.display(), "failed to remove pid file");
        }
    }
}

/// Implements `-kl`: if `path` names a running predecessor, send it
/// `SIGTERM` and wait briefly for it to exit.
pub fn kill_predecessor(path: &Path) -> Result<(), PidFileError> {
    let Some(pid) = read(path)? else {
        return Ok(());
    };
    info!(pid, "sending SIGTERM to predecessor instance");
    unsafe {
        libc_kill(pid as i32, 15);
    }
    std::thread::sleep(std::time::Duration::from_millis(200));
    Ok(())
}

/// Minimal `kill(2)` binding so this module doesn't need a dependency on
/// the full `libc` crate for a single syscall.
unsafe fn libc_kill(pid: i32, sig: i32) -> i32 {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    kill(pid, sig)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips_current_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ttserver.pid");
        write(&path).unwrap();
        assert_eq!(read(&path).unwrap(), Some(std::process::id()));
        remove(&path);
        assert_eq!(read(&path).unwrap(), None);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nope.pid");
        assert_eq!(read(&path).unwrap(), None);
    }
}
