use snafu::Snafu;

/// Failures that can occur while reading or writing a framed connection.
#[derive(Debug, Snafu)]
pub enum WireError {
    /// The underlying socket returned an I/O error.
    #[snafu(display("socket I/O error: {source}"))]
    Io { source: std::io::Error },

    /// The peer closed the connection, or an operation could not be
    /// completed because end-of-stream was already observed.
    #[snafu(display("end of stream"))]
    Eos,

    /// A per-operation deadline elapsed before the operation completed.
    #[snafu(display("operation timed out"))]
    Deadline,

    /// A line grew past the 16 MiB cap without finding a terminator.
    #[snafu(display("line exceeded maximum length"))]
    LineTooLong,

    /// A length-prefixed field declared a size past the caller's cap
    /// (binary command args, record key/value bytes, ...).
    #[snafu(display("length-prefixed field of {len} bytes exceeds the {max} byte cap"))]
    FrameTooLarge { len: usize, max: usize },
}

impl From<std::io::Error> for WireError {
    fn from(source: std::io::Error) -> Self {
        WireError::Io { source }
    }
}
