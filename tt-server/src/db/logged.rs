//! The Logged-DB facade (§4.D): the only path through which mutating
//! operations reach the storage engine. Every call follows the same five
//! steps — lock the record, apply, serialize, append to the update log,
//! unlock — so that "applied" and "logged" never drift apart from each
//! other's point of view on restart or replication replay.

use bytes::{BufMut, Bytes, BytesMut};
use snafu::{ResultExt, Snafu};
use std::sync::Arc;
use tracing::warn;

use tt_ulog::{UlogEntry, UlogError, UpdateLog};

use super::lock::{AllLocksGuard, RecordGuard, RecordLocks};
use super::AbstractDb;
use crate::command::{split_logged_payload, CommandError, LoggedOp};
use crate::error::{outcome_for_db_error, outcome_for_presence_op, outcome_for_put_keep, outcome_for_unit, OpOutcome};

/// The typed payload a caller gets back alongside the outcome, for the ops
/// whose success reply carries data (`addint`/`adddouble`/`putkeep`).
#[derive(Clone, Debug, PartialEq)]
pub enum LoggedValue {
    None,
    Bool(bool),
    Int(i32),
    /// `incr`/`decr`'s textual result, wide enough that a long run of
    /// increments on one key can't wrap the way the binary `addint`'s
    /// 32-bit counter would.
    Int64(i64),
    Double(f64),
    /// `misc`'s result tuples, when the engine-defined function returns any.
    List(Vec<Bytes>),
}

#[derive(Clone, Debug)]
pub struct LoggedExecution {
    pub outcome: OpOutcome,
    pub value: LoggedValue,
}

#[derive(Debug, Snafu)]
pub enum RedoError {
    #[snafu(display("malformed log payload: {source}"))]
    Decode { source: CommandError },
    #[snafu(display("consistency mismatch replaying command {cmd_byte:#04x}: expected success={expected}, got success={actual}"))]
    ConsistencyMismatch { cmd_byte: u8, expected: bool, actual: bool },
    #[snafu(display("failed to append redo entry to local log: {source}"))]
    Append { source: UlogError },
}

enum Guard {
    Single(RecordGuard),
    All(AllLocksGuard),
}

/// Wraps a storage engine and (optionally) an update log behind the
/// locking/logging discipline every mutation must go through.
pub struct LoggedDb {
    db: Arc<dyn AbstractDb>,
    ulog: Option<Arc<UpdateLog>>,
    locks: RecordLocks,
    self_sid: u16,
    /// If true, a consistency mismatch on redo (replication apply or
    /// restore) is fatal rather than merely logged. `setmst` can flip this
    /// at runtime, so it's an atomic rather than a plain bool.
    strict_consistency: std::sync::atomic::AtomicBool,
}

impl LoggedDb {
    pub fn new(db: Arc<dyn AbstractDb>, ulog: Option<Arc<UpdateLog>>, self_sid: u16, strict_consistency: bool) -> Self {
        Self {
            db,
            ulog,
            locks: RecordLocks::new(),
            self_sid,
            strict_consistency: std::sync::atomic::AtomicBool::new(strict_consistency),
        }
    }

    /// Updates the fatal-on-mismatch flag, mirroring `setmst`'s atomic
    /// swap of the replication target and the `rcc` flag together
    /// (`ReplicationState::set_master`).
    pub fn set_strict_consistency(&self, strict: bool) {
        self.strict_consistency.store(strict, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn db(&self) -> &Arc<dyn AbstractDb> {
        &self.db
    }

    async fn guard_for(&self, op: &LoggedOp) -> Guard {
        match op.key() {
            Some(key) => Guard::Single(self.locks.lock(key).await),
            None => Guard::All(self.locks.lock_all().await),
        }
    }

    /// Runs a locally originated op: lock, apply, log (as self→self),
    /// unlock. This is what every binary/memcached/HTTP handler calls.
    pub async fn execute(&self, op: LoggedOp) -> LoggedExecution {
        let guard = self.guard_for(&op).await;
        let result = self.apply_and_log(&op, self.self_sid, self.self_sid).await;
        drop(guard);
        result
    }

    /// Replays a previously logged entry, from a replication stream or a
    /// local restore pass. Re-derives the op from the entry's payload,
    /// applies it under lock, compares the observed outcome against the
    /// origin's recorded success byte, and — if a local log is present —
    /// appends it again so a replica can itself serve as a further
    /// upstream for cascaded replication.
    pub async fn redo(&self, entry: &UlogEntry) -> Result<(), RedoError> {
        let (cmd_byte, args, expected_success) = split_logged_payload(&entry.payload).context(DecodeSnafu)?;
        let op = LoggedOp::decode(cmd_byte, &args).context(DecodeSnafu)?;

        let guard = self.guard_for(&op).await;
        let (outcome, _value) = self.apply(&op).await;
        drop(guard);

        let actual_success = outcome.is_success();
        if actual_success != expected_success {
            if self.strict_consistency.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(RedoError::ConsistencyMismatch {
                    cmd_byte,
                    expected: expected_success,
                    actual: actual_success,
                });
            }
            warn!(cmd_byte, expected_success, actual_success, "consistency mismatch replaying update-log entry");
        }

        if let Some(ulog) = &self.ulog {
            let payload = finish_payload(&op, outcome);
            ulog.append(entry.ts, entry.origin_sid, entry.master_sid, payload)
                .await
                .context(AppendSnafu)?;
        }
        Ok(())
    }

    async fn apply_and_log(&self, op: &LoggedOp, origin_sid: u16, master_sid: u16) -> LoggedExecution {
        let (outcome, value) = self.apply(op).await;
        if let Some(ulog) = &self.ulog {
            let payload = finish_payload(op, outcome);
            if let Err(err) = ulog.append(0, origin_sid, master_sid, payload).await {
                warn!(error = %err, "update log append failed; reporting operation as failed");
                return LoggedExecution {
                    outcome: OpOutcome::Miscellaneous,
                    value,
                };
            }
        }
        LoggedExecution { outcome, value }
    }

    async fn apply(&self, op: &LoggedOp) -> (OpOutcome, LoggedValue) {
        match op {
            LoggedOp::Put { key, val } => {
                let r = self.db.put(key, val).await;
                (outcome_for_unit(&r), LoggedValue::None)
            }
            LoggedOp::PutKeep { key, val } => {
                let r = self.db.put_keep(key, val).await;
                let ok = matches!(r, Ok(true));
                (outcome_for_put_keep(&r), LoggedValue::Bool(ok))
            }
            LoggedOp::PutCat { key, val } => {
                let r = self.db.put_cat(key, val).await;
                (outcome_for_unit(&r), LoggedValue::None)
            }
            LoggedOp::PutShl { key, val, width } => {
                let width = *width as usize;
                let merge = move |existing: Option<&[u8]>, val: &[u8]| -> Option<Vec<u8>> {
                    let mut buf = Vec::new();
                    if let Some(existing) = existing {
                        buf.extend_from_slice(existing);
                    }
                    buf.extend_from_slice(val);
                    if buf.len() > width {
                        let drop = buf.len() - width;
                        buf.drain(0..drop);
                    }
                    Some(buf)
                };
                let r = self.db.put_proc(key, val, &merge).await;
                (outcome_for_unit(&r.map(|_| ())), LoggedValue::None)
            }
            LoggedOp::Replace { key, val } => {
                let merge = |existing: Option<&[u8]>, val: &[u8]| -> Option<Vec<u8>> { existing.map(|_| val.to_vec()) };
                let r = self.db.put_proc(key, val, &merge).await;
                let outcome = match &r {
                    Ok(true) => OpOutcome::Success,
                    Ok(false) => OpOutcome::NoRecord,
                    Err(e) => outcome_for_db_error(e),
                };
                (outcome, LoggedValue::Bool(matches!(r, Ok(true))))
            }
            LoggedOp::Prepend { key, val } => {
                let merge = |existing: Option<&[u8]>, val: &[u8]| -> Option<Vec<u8>> {
                    let existing = existing?;
                    let mut buf = Vec::with_capacity(existing.len() + val.len());
                    buf.extend_from_slice(val);
                    buf.extend_from_slice(existing);
                    Some(buf)
                };
                let r = self.db.put_proc(key, val, &merge).await;
                let outcome = match &r {
                    Ok(true) => OpOutcome::Success,
                    Ok(false) => OpOutcome::NoRecord,
                    Err(e) => outcome_for_db_error(e),
                };
                (outcome, LoggedValue::Bool(matches!(r, Ok(true))))
            }
            LoggedOp::Incr { key, delta } => {
                let delta = *delta;
                // `put_proc`'s merge closure must be `Sync` (it's called
                // through a `&dyn Fn`), so the result is threaded back out
                // through an atomic rather than a plain `Cell`.
                let result = std::sync::atomic::AtomicI64::new(i64::MIN);
                let merge = |existing: Option<&[u8]>, _val: &[u8]| -> Option<Vec<u8>> {
                    let existing = existing?;
                    let next = (parse_tcatoi(existing) + delta).max(0);
                    result.store(next, std::sync::atomic::Ordering::Relaxed);
                    Some(next.to_string().into_bytes())
                };
                let r = self.db.put_proc(key, b"", &merge).await;
                match r {
                    Ok(true) => (OpOutcome::Success, LoggedValue::Int64(result.load(std::sync::atomic::Ordering::Relaxed))),
                    Ok(false) => (OpOutcome::NoRecord, LoggedValue::None),
                    Err(e) => (outcome_for_db_error(&e), LoggedValue::None),
                }
            }
            LoggedOp::Out { key } => {
                let r = self.db.out(key).await;
                (outcome_for_presence_op(&r), LoggedValue::None)
            }
            LoggedOp::AddInt { key, delta } => match self.db.add_int(key, *delta).await {
                Ok(v) => (OpOutcome::Success, LoggedValue::Int(v)),
                Err(e) => (outcome_for_db_error(&e), LoggedValue::None),
            },
            LoggedOp::AddDouble { key, delta } => match self.db.add_double(key, *delta).await {
                Ok(v) => (OpOutcome::Success, LoggedValue::Double(v)),
                Err(e) => (outcome_for_db_error(&e), LoggedValue::None),
            },
            LoggedOp::Misc { name, args } => match self.db.misc(name, args).await {
                Ok(result) => (OpOutcome::Success, LoggedValue::List(result.unwrap_or_default())),
                Err(e) => (outcome_for_db_error(&e), LoggedValue::None),
            },
            LoggedOp::Sync => {
                let r = self.db.sync().await;
                (outcome_for_unit(&r), LoggedValue::None)
            }
            LoggedOp::Optimize { params } => {
                let r = self.db.optimize(params).await;
                (outcome_for_unit(&r), LoggedValue::None)
            }
            LoggedOp::Vanish => {
                let r = self.db.vanish().await;
                (outcome_for_unit(&r), LoggedValue::None)
            }
        }
    }
}

/// Lenient ASCII-decimal parse for `incr`/`decr`'s existing value,
/// matching `tcatoi`: an optional sign followed by leading digits, stopping
/// at the first non-digit; a value with no leading digits at all parses as
/// `0` rather than erroring.
fn parse_tcatoi(bytes: &[u8]) -> i64 {
    let s = std::str::from_utf8(bytes).unwrap_or("");
    let s = s.trim_start();
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let digit_count = digits.chars().take_while(|c| c.is_ascii_digit()).count();
    let magnitude: i64 = digits[..digit_count].parse().unwrap_or(0);
    if neg {
        -magnitude
    } else {
        magnitude
    }
}

fn finish_payload(op: &LoggedOp, outcome: OpOutcome) -> Bytes {
    let mut payload = BytesMut::from(op.encode_payload().as_ref());
    payload.put_u8(outcome.binary_status_byte());
    payload.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::hash::HashDb;
    use crate::db::DbMode;
    use tempfile::tempdir;

    async fn logged_db(limit: u64) -> (LoggedDb, Arc<UpdateLog>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let ulog = UpdateLog::open(dir.path().to_path_buf(), limit, false).await.unwrap();
        let db: Arc<dyn AbstractDb> = Arc::new(HashDb::new("*", DbMode::ReadWrite));
        (LoggedDb::new(db, Some(ulog.clone()), 1, true), ulog, dir)
    }

    #[tokio::test]
    async fn put_logs_and_applies() {
        let (logged, ulog, _dir) = logged_db(1 << 20).await;
        let exec = logged
            .execute(LoggedOp::Put {
                key: Bytes::from_static(b"foo"),
                val: Bytes::from_static(b"hop"),
            })
            .await;
        assert_eq!(exec.outcome, OpOutcome::Success);
        assert_eq!(logged.db().get(b"foo").await.unwrap().as_deref(), Some(&b"hop"[..]));
        drop(ulog);
    }

    #[tokio::test]
    async fn putkeep_conflict_does_not_overwrite_and_logs_failure_byte() {
        let (logged, _ulog, _dir) = logged_db(1 << 20).await;
        logged
            .execute(LoggedOp::Put { key: Bytes::from_static(b"k"), val: Bytes::from_static(b"1") })
            .await;
        let exec = logged
            .execute(LoggedOp::PutKeep { key: Bytes::from_static(b"k"), val: Bytes::from_static(b"2") })
            .await;
        assert_eq!(exec.outcome, OpOutcome::KeepExisting);
        assert_eq!(logged.db().get(b"k").await.unwrap().as_deref(), Some(&b"1"[..]));
    }

    #[tokio::test]
    async fn redo_rejects_a_mismatch_only_while_strict_and_tolerates_it_once_relaxed() {
        let (logged, _ulog, _dir) = logged_db(1 << 20).await;
        logged
            .execute(LoggedOp::Put { key: Bytes::from_static(b"k"), val: Bytes::from_static(b"1") })
            .await;

        // A `putkeep` on an already-present key actually fails (KeepExisting),
        // but the crafted entry claims the origin saw it succeed.
        let op = LoggedOp::PutKeep { key: Bytes::from_static(b"k"), val: Bytes::from_static(b"2") };
        let mismatched = UlogEntry { ts: 1, origin_sid: 2, master_sid: 2, payload: finish_payload(&op, OpOutcome::Success) };

        assert!(matches!(logged.redo(&mismatched).await, Err(RedoError::ConsistencyMismatch { .. })));

        logged.set_strict_consistency(false);
        assert!(logged.redo(&mismatched).await.is_ok());
    }

    #[tokio::test]
    async fn redo_replays_an_entry_read_back_from_the_log() {
        let (logged, ulog, _dir) = logged_db(1 << 20).await;
        logged
            .execute(LoggedOp::Put { key: Bytes::from_static(b"k"), val: Bytes::from_static(b"v") })
            .await;

        let replica_db: Arc<dyn AbstractDb> = Arc::new(HashDb::new("*", DbMode::ReadWrite));
        let replica = LoggedDb::new(replica_db, None, 2, true);

        let mut tailer = tt_ulog::UlogTailer::new(ulog.clone(), 0).await.unwrap();
        let entry = tailer.read().await.unwrap().expect("one entry written");
        replica.redo(&entry).await.unwrap();
        assert_eq!(replica.db().get(b"k").await.unwrap().as_deref(), Some(&b"v"[..]));
    }

    #[tokio::test]
    async fn replace_is_vetoed_when_key_is_absent() {
        let (logged, _ulog, _dir) = logged_db(1 << 20).await;
        let exec = logged
            .execute(LoggedOp::Replace { key: Bytes::from_static(b"k"), val: Bytes::from_static(b"v") })
            .await;
        assert_eq!(exec.outcome, OpOutcome::NoRecord);
        assert_eq!(logged.db().get(b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn replace_overwrites_an_existing_value() {
        let (logged, _ulog, _dir) = logged_db(1 << 20).await;
        logged.execute(LoggedOp::Put { key: Bytes::from_static(b"k"), val: Bytes::from_static(b"1") }).await;
        let exec = logged
            .execute(LoggedOp::Replace { key: Bytes::from_static(b"k"), val: Bytes::from_static(b"2") })
            .await;
        assert_eq!(exec.outcome, OpOutcome::Success);
        assert_eq!(logged.db().get(b"k").await.unwrap().as_deref(), Some(&b"2"[..]));
    }

    #[tokio::test]
    async fn prepend_sticks_val_in_front_of_the_existing_value() {
        let (logged, _ulog, _dir) = logged_db(1 << 20).await;
        logged.execute(LoggedOp::Put { key: Bytes::from_static(b"k"), val: Bytes::from_static(b"world") }).await;
        let exec = logged
            .execute(LoggedOp::Prepend { key: Bytes::from_static(b"k"), val: Bytes::from_static(b"hello ") })
            .await;
        assert_eq!(exec.outcome, OpOutcome::Success);
        assert_eq!(logged.db().get(b"k").await.unwrap().as_deref(), Some(&b"hello world"[..]));
    }

    #[tokio::test]
    async fn incr_on_missing_key_reports_no_record_without_creating_it() {
        let (logged, _ulog, _dir) = logged_db(1 << 20).await;
        let exec = logged.execute(LoggedOp::Incr { key: Bytes::from_static(b"missing"), delta: 5 }).await;
        assert_eq!(exec.outcome, OpOutcome::NoRecord);
        assert_eq!(logged.db().get(b"missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_reads_and_writes_textual_decimal() {
        let (logged, _ulog, _dir) = logged_db(1 << 20).await;
        logged.execute(LoggedOp::Put { key: Bytes::from_static(b"counter"), val: Bytes::from_static(b"0") }).await;
        let exec = logged.execute(LoggedOp::Incr { key: Bytes::from_static(b"counter"), delta: 1 }).await;
        assert_eq!(exec.outcome, OpOutcome::Success);
        assert_eq!(exec.value, LoggedValue::Int64(1));
        assert_eq!(logged.db().get(b"counter").await.unwrap().as_deref(), Some(&b"1"[..]));
    }

    #[tokio::test]
    async fn decr_clamps_at_zero_instead_of_going_negative() {
        let (logged, _ulog, _dir) = logged_db(1 << 20).await;
        logged.execute(LoggedOp::Put { key: Bytes::from_static(b"counter"), val: Bytes::from_static(b"3") }).await;
        let exec = logged.execute(LoggedOp::Incr { key: Bytes::from_static(b"counter"), delta: -10 }).await;
        assert_eq!(exec.value, LoggedValue::Int64(0));
        assert_eq!(logged.db().get(b"counter").await.unwrap().as_deref(), Some(&b"0"[..]));
    }

    #[tokio::test]
    async fn putshl_keeps_only_the_trailing_window() {
        let (logged, _ulog, _dir) = logged_db(1 << 20).await;
        logged
            .execute(LoggedOp::PutShl { key: Bytes::from_static(b"k"), val: Bytes::from_static(b"abcde"), width: 3 })
            .await;
        assert_eq!(logged.db().get(b"k").await.unwrap().as_deref(), Some(&b"cde"[..]));
        logged
            .execute(LoggedOp::PutShl { key: Bytes::from_static(b"k"), val: Bytes::from_static(b"fg"), width: 3 })
            .await;
        assert_eq!(logged.db().get(b"k").await.unwrap().as_deref(), Some(&b"efg"[..]));
    }
}
