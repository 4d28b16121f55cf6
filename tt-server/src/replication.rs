//! The replication client (§4.E): ticks once a second, flushes its RTS
//! file, connects to the configured master, and tails its update log,
//! applying entries through the Logged-DB facade's `redo` path. The
//! master side of the `repl` command itself lives in
//! [`crate::proto::binary`], since it's answered inline by the binary
//! protocol dispatcher rather than by a standalone task.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::{interval, timeout};
use tracing::{info, warn};

use tt_ulog::{RtsFile, UlogEntry, MAGIC_NOP};
use tt_wire::WireError;

use crate::app::ServerState;
use crate::command::{codes, MAGIC};

const CONNECT_DEADLINE: Duration = Duration::from_secs(5);
const READ_DEADLINE: Duration = Duration::from_secs(60);
const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Snafu)]
pub enum ReplicationError {
    #[snafu(display("connect to {host}:{port} timed out"))]
    ConnectTimeout { host: String, port: u16 },
    #[snafu(display("connect to {host}:{port} failed: {source}"))]
    Connect { host: String, port: u16, source: std::io::Error },
    #[snafu(display("master rejected replication handshake"))]
    Rejected,
    #[snafu(display("wire error: {source}"))]
    Wire { source: WireError },
}

impl From<WireError> for ReplicationError {
    fn from(source: WireError) -> Self {
        ReplicationError::Wire { source }
    }
}

/// Replication target: the master's address, plus whether a consistency
/// mismatch on replay should be fatal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationTarget {
    pub host: String,
    pub port: u16,
}

/// Shared, mutable replication state: the current target (changeable at
/// runtime via `setmst`), the strict-consistency flag, and the progress
/// markers `stat` and the RTS file both read.
pub struct ReplicationState {
    target: Mutex<Option<ReplicationTarget>>,
    strict: AtomicBool,
    rts: RtsFile,
    pending_flush: Mutex<Option<u64>>,
    last_applied_ts: AtomicU64,
    /// Set on a strict-consistency mismatch; the driver stops applying
    /// entries until an operator intervenes (e.g. via `setmst`).
    fatal: AtomicBool,
    /// Suppresses repeated "connection refused" log lines for the same
    /// outage (§7: "first failure logged once; subsequent suppressed").
    failure_logged: AtomicBool,
    reconnect: Notify,
}

impl ReplicationState {
    pub fn new(target: Option<ReplicationTarget>, strict: bool, rts_path: PathBuf) -> Self {
        Self {
            target: Mutex::new(target),
            strict: AtomicBool::new(strict),
            rts: RtsFile::new(rts_path),
            pending_flush: Mutex::new(None),
            last_applied_ts: AtomicU64::new(0),
            fatal: AtomicBool::new(false),
            failure_logged: AtomicBool::new(false),
            reconnect: Notify::new(),
        }
    }

    /// `setmst` (§4.H): atomically swaps the target and strict-consistency
    /// flag, clears a prior fatal state, and wakes the driver to reconnect
    /// immediately rather than waiting out the rest of its current tick.
    pub fn set_master(&self, target: Option<ReplicationTarget>, strict: bool) {
        *self.target.lock() = target;
        self.strict.store(strict, Ordering::Relaxed);
        self.fatal.store(false, Ordering::Relaxed);
        self.failure_logged.store(false, Ordering::Relaxed);
        self.reconnect.notify_waiters();
    }

    pub fn current_target(&self) -> Option<ReplicationTarget> {
        self.target.lock().clone()
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Relaxed)
    }

    pub fn last_applied_ts(&self) -> u64 {
        self.last_applied_ts.load(Ordering::Relaxed)
    }
}

/// The driver task: one tick per second, following §4.E's six numbered
/// steps in order.
pub async fn drive(state: Arc<ServerState>) {
    let initial = match state.replication.rts.read().await {
        Ok(ts) => ts,
        Err(e) => {
            warn!(error = %e, "failed to read RTS file at startup; resuming from 0");
            0
        }
    };
    state.replication.last_applied_ts.store(initial, Ordering::Relaxed);

    let mut ticker = interval(TICK_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = state.replication.reconnect.notified() => {}
        }

        // Step 1: a fatal (strict-consistency-violated) replica is stuck
        // until an operator calls setmst.
        if state.replication.is_fatal() {
            continue;
        }

        // Step 2: flush any pending applied timestamp to the RTS file.
        if let Some(ts) = state.replication.pending_flush.lock().take() {
            if let Err(e) = state.replication.rts.write(ts).await {
                warn!(error = %e, "failed to flush RTS file");
            }
        }

        // Step 3/4/5: (re)connect and tail, using the freshly flushed RTS
        // as the resume point.
        let Some(target) = state.replication.current_target() else {
            continue;
        };
        let rts = state.replication.rts.read().await.unwrap_or(0);
        if let Err(e) = tick_once(&state, &target, rts).await {
            if !state.replication.failure_logged.swap(true, Ordering::Relaxed) {
                warn!(error = %e, host = %target.host, port = target.port, "replication connection failed");
            }
        }
        // Step 6: any socket error above (or a reconnect request racing
        // the loop) falls through here; the next tick retries.
    }
}

async fn tick_once(state: &Arc<ServerState>, target: &ReplicationTarget, rts: u64) -> Result<(), ReplicationError> {
    let stream = timeout(CONNECT_DEADLINE, TcpStream::connect((target.host.as_str(), target.port)))
        .await
        .map_err(|_| ReplicationError::ConnectTimeout { host: target.host.clone(), port: target.port })?
        .context(ConnectSnafu { host: target.host.clone(), port: target.port })?;

    let mut framed = tt_wire::FramedIo::new(stream);
    framed.set_deadline(Some(READ_DEADLINE));

    let mut req = bytes::BytesMut::with_capacity(12);
    req.extend_from_slice(&[MAGIC, codes::REPL]);
    req.extend_from_slice(&(rts + 1).to_be_bytes());
    req.extend_from_slice(&state.sid.to_be_bytes());
    framed.write_all(&req).await?;

    let master_sid = match framed.read_u32().await {
        Ok(sid) => sid,
        Err(_) => return Err(ReplicationError::Rejected),
    };
    state.replication.failure_logged.store(false, Ordering::Relaxed);
    info!(master_sid, host = %target.host, port = target.port, "connected to replication master");

    loop {
        let magic = framed.read_byte().await?;
        match magic {
            MAGIC_NOP => continue,
            tt_ulog::MAGIC => {
                let ts = framed.read_u64().await?;
                let origin_sid = framed.read_u16().await?;
                let master_sid_field = framed.read_u16().await?;
                let len = framed.read_u32().await? as usize;
                let payload: Bytes = framed.read_exact(len).await?.freeze();
                let entry = UlogEntry { ts, origin_sid, master_sid: master_sid_field, payload };

                // Cycle breaking (§3, testable property 2): never apply an
                // entry this server itself originated or last forwarded.
                if entry.origin_sid == state.sid || entry.master_sid == state.sid {
                    continue;
                }

                if let Err(e) = state.logged.redo(&entry).await {
                    warn!(error = %e, "consistency mismatch replaying replicated entry");
                    if state.replication.strict.load(Ordering::Relaxed) {
                        state.replication.fatal.store(true, Ordering::Relaxed);
                        return Ok(());
                    }
                }
                state.replication.last_applied_ts.store(entry.ts, Ordering::Relaxed);
                *state.replication.pending_flush.lock() = Some(entry.ts);
            }
            other => {
                warn!(magic = other, "unexpected byte in replication stream");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_master_replaces_target_and_clears_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let state = ReplicationState::new(None, false, tmp.path().join("rts"));
        assert_eq!(state.current_target(), None);
        state.fatal.store(true, Ordering::Relaxed);

        state.set_master(Some(ReplicationTarget { host: "master".into(), port: 1978 }), true);
        assert_eq!(
            state.current_target(),
            Some(ReplicationTarget { host: "master".into(), port: 1978 })
        );
        assert!(!state.is_fatal());
        assert!(state.strict.load(Ordering::Relaxed));
    }
}
