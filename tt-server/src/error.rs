//! The client-facing error taxonomy (§7) and its mapping from internal
//! module errors (`DbError`, `tt_wire::WireError`, `tt_ulog::UlogError`).

use snafu::Snafu;

/// The logical outcome reported to a client, independent of which wire
/// protocol carries it. Binary status byte 0 is [`OpOutcome::Success`];
/// every other variant maps to status byte 1 ("logical failure").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpOutcome {
    Success,
    InvalidOperation,
    HostNotFound,
    ConnectionRefused,
    Send,
    Receive,
    /// `putkeep` found an existing value at the key.
    KeepExisting,
    /// `out`/`get`/arithmetic found no record at the key.
    NoRecord,
    Miscellaneous,
}

impl OpOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, OpOutcome::Success)
    }

    /// The single status byte every binary command response begins with.
    pub fn binary_status_byte(self) -> u8 {
        u8::from(!self.is_success())
    }
}

/// Errors surfaced by the in-memory `AbstractDb` reference implementation.
#[derive(Debug, Snafu)]
pub enum DbError {
    #[snafu(display("key not found"))]
    NotFound,
    #[snafu(display("putkeep conflict: key already exists"))]
    KeepConflict,
    #[snafu(display("value is not a valid integer"))]
    NotInteger,
    #[snafu(display("value is not a valid double"))]
    NotDouble,
    #[snafu(display("unsupported misc function: {name}"))]
    UnsupportedMisc { name: String },
    #[snafu(display("I/O error: {source}"))]
    Io { source: std::io::Error },
}

/// Maps a DB-layer result to the §7 outcome taxonomy. `putkeep` and
/// `out`/`get`-style misses get their own variants; everything else
/// collapses to `miscellaneous`, matching spec §7's stated mapping.
pub fn outcome_for_put_keep(result: &Result<bool, DbError>) -> OpOutcome {
    match result {
        Ok(true) => OpOutcome::Success,
        Ok(false) => OpOutcome::KeepExisting,
        Err(_) => OpOutcome::Miscellaneous,
    }
}

pub fn outcome_for_presence_op(result: &Result<bool, DbError>) -> OpOutcome {
    match result {
        Ok(true) => OpOutcome::Success,
        Ok(false) => OpOutcome::NoRecord,
        Err(_) => OpOutcome::Miscellaneous,
    }
}

pub fn outcome_for_unit(result: &Result<(), DbError>) -> OpOutcome {
    match result {
        Ok(()) => OpOutcome::Success,
        Err(err) => outcome_for_db_error(err),
    }
}

pub fn outcome_for_db_error(err: &DbError) -> OpOutcome {
    match err {
        DbError::NotFound => OpOutcome::NoRecord,
        DbError::KeepConflict => OpOutcome::KeepExisting,
        _ => OpOutcome::Miscellaneous,
    }
}
