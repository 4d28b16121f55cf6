//! The binary command handlers (§4.H): one function per command byte,
//! sharing the length-prefixed argument framing [`crate::command`]
//! defines. Every handler increments its per-worker counter, checks the
//! command mask, and writes a single status byte followed by any result
//! bytes the command produces; `putnr` is the one exception that writes
//! nothing at all.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::{Bytes, BytesMut, BufMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

use tt_wire::{FramedIo, WireError};
use tt_ulog::{UlogTailer, MAGIC_NOP};

use crate::app::ServerState;
use crate::command::{codes, LoggedOp};
use crate::db::logged::LoggedValue;
use crate::error::OpOutcome;
use crate::replication::ReplicationTarget;
use crate::stats::{render_tsv, ReplicationSnapshot, ServerSnapshot};

/// Per-argument size cap (§4.H: "per-arg ≤ 256 MiB").
const MAX_ARG_BYTES: usize = 256 * 1024 * 1024;
/// Cap on the number of args in a variable-length list (§4.H: "arg count ≤ 2^20").
const MAX_ARG_COUNT: usize = 1 << 20;

pub async fn handle<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let cmd_byte = framed.read_byte().await?;
    state.stats.record(cmd_byte);

    if state.mask.is_forbidden(cmd_byte) {
        return write_status(framed, OpOutcome::InvalidOperation).await.map(|()| true);
    }

    match cmd_byte {
        codes::PUT => put_like(framed, state, cmd_byte).await,
        codes::PUTKEEP => put_like(framed, state, cmd_byte).await,
        codes::PUTCAT => put_like(framed, state, cmd_byte).await,
        codes::PUTSHL => put_shl(framed, state).await,
        codes::PUTNR => put_nr(framed, state).await,
        codes::OUT => out(framed, state).await,
        codes::GET => get(framed, state).await,
        codes::MGET => mget(framed, state).await,
        codes::VSIZ => vsiz(framed, state).await,
        codes::ITERINIT => iterinit(framed, state).await,
        codes::ITERNEXT => iternext(framed, state).await,
        codes::FWMKEYS => fwmkeys(framed, state).await,
        codes::ADDINT => addint(framed, state).await,
        codes::ADDDOUBLE => adddouble(framed, state).await,
        codes::EXT => ext(framed, state).await,
        codes::SYNC => logged_nullary(framed, state, LoggedOp::Sync).await,
        codes::OPTIMIZE => optimize(framed, state).await,
        codes::VANISH => logged_nullary(framed, state, LoggedOp::Vanish).await,
        codes::COPY => copy(framed, state).await,
        codes::RESTORE => restore(framed, state).await,
        codes::SETMST => setmst(framed, state).await,
        codes::RNUM => rnum(framed, state).await,
        codes::SIZE => size(framed, state).await,
        codes::STAT => stat(framed, state).await,
        codes::MISC => misc(framed, state).await,
        codes::REPL => repl(framed, state).await,
        _ => {
            warn!(cmd_byte, "unknown binary command byte; dropping connection");
            Ok(false)
        }
    }
}

async fn read_arg<S>(framed: &mut FramedIo<S>) -> Result<Bytes, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Ok(framed.read_length_prefixed(MAX_ARG_BYTES).await?.freeze())
}

async fn write_status<S>(framed: &mut FramedIo<S>, outcome: OpOutcome) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.write_all(&[outcome.binary_status_byte()]).await
}

async fn write_status_and_bytes<S>(framed: &mut FramedIo<S>, outcome: OpOutcome, body: &[u8]) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut out = BytesMut::with_capacity(5 + body.len());
    out.put_u8(outcome.binary_status_byte());
    out.put_u32(body.len() as u32);
    out.extend_from_slice(body);
    framed.write_all(&out).await
}

/// `put`/`putkeep`/`putcat`: identical `(key, val)` framing, differing
/// only in which [`LoggedOp`] they build.
async fn put_like<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>, cmd_byte: u8) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let key = read_arg(framed).await?;
    let val = read_arg(framed).await?;
    let op = match cmd_byte {
        codes::PUT => LoggedOp::Put { key, val },
        codes::PUTKEEP => LoggedOp::PutKeep { key, val },
        codes::PUTCAT => LoggedOp::PutCat { key, val },
        _ => unreachable!("put_like only called for put/putkeep/putcat"),
    };
    let exec = state.logged.execute(op).await;
    if matches!(exec.outcome, OpOutcome::KeepExisting | OpOutcome::NoRecord) {
        state.stats.record_put_miss();
    }
    write_status(framed, exec.outcome).await?;
    Ok(true)
}

async fn put_shl<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let key = read_arg(framed).await?;
    let val = read_arg(framed).await?;
    let width = framed.read_u32().await?;
    let exec = state.logged.execute(LoggedOp::PutShl { key, val, width }).await;
    if matches!(exec.outcome, OpOutcome::KeepExisting | OpOutcome::NoRecord) {
        state.stats.record_put_miss();
    }
    write_status(framed, exec.outcome).await?;
    Ok(true)
}

/// Fire-and-forget `put`: applies and logs exactly like `put`, but never
/// writes a reply, successful or not.
async fn put_nr<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let key = read_arg(framed).await?;
    let val = read_arg(framed).await?;
    let exec = state.logged.execute(LoggedOp::Put { key, val }).await;
    if matches!(exec.outcome, OpOutcome::KeepExisting | OpOutcome::NoRecord) {
        state.stats.record_put_miss();
    }
    Ok(true)
}

async fn out<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let key = read_arg(framed).await?;
    let exec = state.logged.execute(LoggedOp::Out { key }).await;
    if exec.outcome == OpOutcome::NoRecord {
        state.stats.record_out_miss();
    }
    write_status(framed, exec.outcome).await?;
    Ok(true)
}

async fn get<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let key = read_arg(framed).await?;
    match state.logged.db().get(&key).await {
        Ok(Some(val)) => write_status_and_bytes(framed, OpOutcome::Success, &val).await?,
        Ok(None) => {
            state.stats.record_get_miss();
            write_status(framed, OpOutcome::NoRecord).await?;
        }
        Err(_) => write_status(framed, OpOutcome::Miscellaneous).await?,
    }
    Ok(true)
}

async fn mget<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let count = framed.read_u32().await? as usize;
    if count > MAX_ARG_COUNT {
        return Err(WireError::FrameTooLarge { len: count, max: MAX_ARG_COUNT });
    }
    let mut keys = Vec::with_capacity(count);
    for _ in 0..count {
        keys.push(read_arg(framed).await?);
    }

    let mut hits = BytesMut::new();
    let mut hit_count: u32 = 0;
    for key in &keys {
        if let Ok(Some(val)) = state.logged.db().get(key).await {
            hit_count += 1;
            hits.put_u32(key.len() as u32);
            hits.extend_from_slice(key);
            hits.put_u32(val.len() as u32);
            hits.extend_from_slice(&val);
        }
    }

    let mut out = BytesMut::with_capacity(5 + hits.len());
    out.put_u8(OpOutcome::Success.binary_status_byte());
    out.put_u32(hit_count);
    out.extend_from_slice(&hits);
    framed.write_all(&out).await?;
    Ok(true)
}

async fn vsiz<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let key = read_arg(framed).await?;
    match state.logged.db().vsiz(&key).await {
        Ok(size) if size >= 0 => write_status_and_bytes(framed, OpOutcome::Success, &(size as i32).to_be_bytes()).await?,
        Ok(_) => write_status(framed, OpOutcome::NoRecord).await?,
        Err(_) => write_status(framed, OpOutcome::Miscellaneous).await?,
    }
    Ok(true)
}

async fn iterinit<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let outcome = match state.logged.db().iter_init().await {
        Ok(()) => OpOutcome::Success,
        Err(_) => OpOutcome::Miscellaneous,
    };
    write_status(framed, outcome).await?;
    Ok(true)
}

async fn iternext<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match state.logged.db().iter_next().await {
        Ok(Some(key)) => write_status_and_bytes(framed, OpOutcome::Success, &key).await?,
        Ok(None) => write_status(framed, OpOutcome::NoRecord).await?,
        Err(_) => write_status(framed, OpOutcome::Miscellaneous).await?,
    }
    Ok(true)
}

async fn fwmkeys<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let prefix = read_arg(framed).await?;
    let max = framed.read_u32().await? as i64 as i32;
    let max = if max < 0 { None } else { Some(max as usize) };

    let keys = state.logged.db().fwm_keys(&prefix, max).await.unwrap_or_default();
    let mut body = BytesMut::new();
    for key in &keys {
        body.put_u32(key.len() as u32);
        body.extend_from_slice(key);
    }
    let mut out = BytesMut::with_capacity(5 + body.len());
    out.put_u8(OpOutcome::Success.binary_status_byte());
    out.put_u32(keys.len() as u32);
    out.extend_from_slice(&body);
    framed.write_all(&out).await?;
    Ok(true)
}

async fn addint<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let key = read_arg(framed).await?;
    let delta = framed.read_u32().await? as i32;
    let exec = state.logged.execute(LoggedOp::AddInt { key, delta }).await;
    match (exec.outcome, exec.value) {
        (OpOutcome::Success, LoggedValue::Int(v)) => write_status_and_bytes(framed, OpOutcome::Success, &v.to_be_bytes()).await?,
        (outcome, _) => write_status(framed, outcome).await?,
    }
    Ok(true)
}

async fn adddouble<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let key = read_arg(framed).await?;
    let integral = framed.read_i64().await?;
    let fractional = framed.read_i64().await?;
    let delta = tt_wire::ints::unpack_double(integral, fractional);
    let exec = state.logged.execute(LoggedOp::AddDouble { key, delta }).await;
    match (exec.outcome, exec.value) {
        (OpOutcome::Success, LoggedValue::Double(v)) => {
            let (i, f) = tt_wire::ints::pack_double(v);
            let mut body = [0u8; 16];
            body[..8].copy_from_slice(&i.to_be_bytes());
            body[8..].copy_from_slice(&f.to_be_bytes());
            write_status_and_bytes(framed, OpOutcome::Success, &body).await?
        }
        (outcome, _) => write_status(framed, outcome).await?,
    }
    Ok(true)
}

/// The scripting extension boundary (§1, §5): always answers
/// `invalid-operation` since no scripting engine is implemented, but
/// still consumes the full request framing so the connection stays in
/// sync.
async fn ext<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let name = read_arg(framed).await?;
    let _opts = framed.read_u32().await?;
    let key = read_arg(framed).await?;
    let val = read_arg(framed).await?;

    let name = String::from_utf8_lossy(&name).into_owned();
    match state.ext.call_method(&name, &key, std::slice::from_ref(&val)).await {
        Some(result) => write_status_and_bytes(framed, OpOutcome::Success, &result).await?,
        None => write_status(framed, OpOutcome::InvalidOperation).await?,
    }
    Ok(true)
}

async fn logged_nullary<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>, op: LoggedOp) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let exec = state.logged.execute(op).await;
    write_status(framed, exec.outcome).await?;
    Ok(true)
}

async fn optimize<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let params = read_arg(framed).await?;
    let params = String::from_utf8_lossy(&params).into_owned();
    logged_nullary(framed, state, LoggedOp::Optimize { params }).await
}

async fn copy<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let path = read_arg(framed).await?;
    let path = String::from_utf8_lossy(&path).into_owned();
    let outcome = match state.logged.db().copy(&path).await {
        Ok(()) => OpOutcome::Success,
        Err(_) => OpOutcome::Miscellaneous,
    };
    write_status(framed, outcome).await?;
    Ok(true)
}

/// `restore` (§4.H, §9 design note 3): replays a log directory through the
/// Logged-DB facade, which re-logs every entry locally — accepted,
/// double-logging-on-restore behavior when strict consistency is off.
async fn restore<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let path = read_arg(framed).await?;
    let start_ts = framed.read_u64().await?;
    let _opts = framed.read_u32().await?;
    let path = String::from_utf8_lossy(&path).into_owned();

    let outcome = match restore_from(state, &path, start_ts).await {
        Ok(()) => OpOutcome::Success,
        Err(()) => OpOutcome::Miscellaneous,
    };
    write_status(framed, outcome).await?;
    Ok(true)
}

async fn restore_from(state: &Arc<ServerState>, path: &str, start_ts: u64) -> Result<(), ()> {
    let source = tt_ulog::UpdateLog::open(std::path::PathBuf::from(path), 0, false).await.map_err(|_| ())?;
    let mut tailer = UlogTailer::new(source, start_ts).await.map_err(|_| ())?;
    loop {
        match tailer.read().await {
            Ok(Some(entry)) => {
                if state.logged.redo(&entry).await.is_err() {
                    return Err(());
                }
            }
            Ok(None) => return Ok(()),
            Err(_) => return Err(()),
        }
    }
}

async fn setmst<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let host = read_arg(framed).await?;
    let port = framed.read_u32().await? as u16;
    let opts = framed.read_u32().await?;
    let strict = opts & 1 != 0;

    let target = if host.is_empty() {
        None
    } else {
        Some(ReplicationTarget { host: String::from_utf8_lossy(&host).into_owned(), port })
    };
    state.replication.set_master(target, strict);
    state.logged.set_strict_consistency(strict);
    state.generation.fetch_add(1, Ordering::Relaxed);
    write_status(framed, OpOutcome::Success).await?;
    Ok(true)
}

async fn rnum<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let n = state.logged.db().rnum().await.unwrap_or(0);
    write_status_and_bytes(framed, OpOutcome::Success, &n.to_be_bytes()).await?;
    Ok(true)
}

async fn size<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let n = state.logged.db().size().await.unwrap_or(0);
    write_status_and_bytes(framed, OpOutcome::Success, &n.to_be_bytes()).await?;
    Ok(true)
}

async fn stat<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let rnum = state.logged.db().rnum().await.unwrap_or(0);
    let size = state.logged.db().size().await.unwrap_or(0);
    let db_path = state.db_path();
    let target = state.replication.current_target();
    let replication = target.as_ref().map(|t| ReplicationSnapshot {
        master_host: t.host.as_str(),
        master_port: t.port,
        rts_micros: state.replication.last_applied_ts(),
    });
    let snapshot = ServerSnapshot {
        version: crate::app::VERSION,
        start_time: state.start_time,
        pid: state.pid,
        sid: state.sid,
        db_type: state.db_type,
        db_path: db_path.as_str(),
        rnum,
        size,
        replication,
    };
    let tsv = render_tsv(&snapshot, &state.stats);
    write_status_and_bytes(framed, OpOutcome::Success, tsv.as_bytes()).await?;
    Ok(true)
}

async fn misc<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let name = read_arg(framed).await?;
    let _opts = framed.read_u32().await?;
    let count = framed.read_u32().await? as usize;
    if count > MAX_ARG_COUNT {
        return Err(WireError::FrameTooLarge { len: count, max: MAX_ARG_COUNT });
    }
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        args.push(read_arg(framed).await?);
    }
    let name = String::from_utf8_lossy(&name).into_owned();

    let exec = state.logged.execute(LoggedOp::Misc { name, args }).await;
    match (exec.outcome, exec.value) {
        (OpOutcome::Success, LoggedValue::List(items)) => {
            let mut body = BytesMut::new();
            for item in &items {
                body.put_u32(item.len() as u32);
                body.extend_from_slice(item);
            }
            let mut out = BytesMut::with_capacity(5 + body.len());
            out.put_u8(OpOutcome::Success.binary_status_byte());
            out.put_u32(items.len() as u32);
            out.extend_from_slice(&body);
            framed.write_all(&out).await?;
        }
        (outcome, _) => write_status(framed, outcome).await?,
    }
    Ok(true)
}

/// The master side of `repl` (§4.E step 4, §4.H): after the handshake,
/// this takes over the connection entirely, streaming log entries (and
/// idle keep-alive NOPs) until the replica disconnects.
async fn repl<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let start_ts = framed.read_u64().await?;
    let requester_sid = framed.read_u16().await?;

    if requester_sid == state.sid {
        // Circular replication: reject by closing rather than replying.
        return Ok(false);
    }
    framed.write_all(&(state.sid as u32).to_be_bytes()).await?;

    let Some(ulog) = state.ulog.clone() else {
        return Ok(false);
    };
    let mut tailer = match UlogTailer::new(ulog, start_ts).await {
        Ok(t) => t,
        Err(_) => return Ok(false),
    };

    loop {
        match tailer.read().await {
            Ok(Some(entry)) => {
                if entry.origin_sid == requester_sid || entry.master_sid == requester_sid {
                    continue;
                }
                framed.write_all(&entry.encode()).await?;
            }
            Ok(None) => {
                tailer.wait().await;
                framed.write_all(&[MAGIC_NOP]).await?;
            }
            Err(_) => return Ok(false),
        }
    }
}
