use snafu::Snafu;

/// Failures surfaced by the update log writer, tailer, and RTS file.
#[derive(Debug, Snafu)]
pub enum UlogError {
    /// The log base directory could not be created or scanned.
    #[snafu(display("failed to access update log directory {}: {source}", path.display()))]
    Directory {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// A data file could not be opened, written, or synced.
    #[snafu(display("failed to access update log file {}: {source}", path.display()))]
    File {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// The replication timestamp file could not be read or written.
    #[snafu(display("failed to access RTS file {}: {source}", path.display()))]
    Rts {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// The RTS file's contents were not a valid decimal timestamp.
    #[snafu(display("RTS file {} did not contain a valid timestamp", path.display()))]
    RtsParse { path: std::path::PathBuf },
}
