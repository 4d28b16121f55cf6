//! The memcached-text handler (§4.G/§4.I): classic line-oriented verbs,
//! each mapped onto the same Logged-DB operations the binary protocol
//! uses. `replace` and `prepend` need a composite read-then-write under a
//! single record lock that neither `Put`/`PutKeep`/`PutCat` provide, so
//! they go through the [`crate::command::LoggedOp::Replace`]/`Prepend`
//! variants added for exactly this purpose.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use tt_wire::{FramedIo, WireError};

use crate::app::ServerState;
use crate::command::LoggedOp;
use crate::db::logged::LoggedValue;
use crate::error::OpOutcome;
use crate::stats::{render_tsv, ReplicationSnapshot, ServerSnapshot};

/// Per-value size cap mirroring the binary protocol's per-arg limit
/// (§4.H), applied here to the `<bytes>` field of a storage command so a
/// malformed or hostile length can't force an unbounded buffer.
const MAX_VALUE_BYTES: u64 = 256 * 1024 * 1024;

pub async fn handle<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>, tokens: Vec<Vec<u8>>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let verb = String::from_utf8_lossy(&tokens[0]).to_ascii_lowercase();

    if let Some(cmd_byte) = crate::mask::binary_equivalent_for_memcached_verb(&verb) {
        if state.mask.is_forbidden(cmd_byte) {
            if !noreply(&tokens) {
                framed.write_all(b"CLIENT_ERROR forbidden\r\n").await?;
            }
            return Ok(true);
        }
    }

    match verb.as_str() {
        "set" => storage(framed, state, &tokens, StorageKind::Set).await,
        "add" => storage(framed, state, &tokens, StorageKind::Add).await,
        "replace" => storage(framed, state, &tokens, StorageKind::Replace).await,
        "append" => storage(framed, state, &tokens, StorageKind::Append).await,
        "prepend" => storage(framed, state, &tokens, StorageKind::Prepend).await,
        "get" => get(framed, state, &tokens, false).await,
        "gets" => get(framed, state, &tokens, true).await,
        "delete" => delete(framed, state, &tokens).await,
        "incr" => incr_decr(framed, state, &tokens, 1).await,
        "decr" => incr_decr(framed, state, &tokens, -1).await,
        "stats" => stats(framed, state).await,
        "flush_all" => flush_all(framed, state, &tokens).await,
        "version" => version(framed).await,
        "quit" => Ok(false),
        _ => {
            framed.write_all(b"ERROR\r\n").await?;
            Ok(true)
        }
    }
}

fn noreply(tokens: &[Vec<u8>]) -> bool {
    tokens.last().map(|t| t.as_slice() == b"noreply").unwrap_or(false)
}

fn parse_u64(token: &[u8]) -> Option<u64> {
    std::str::from_utf8(token).ok()?.parse().ok()
}

fn parse_i64(token: &[u8]) -> Option<i64> {
    std::str::from_utf8(token).ok()?.parse().ok()
}

#[derive(Clone, Copy)]
enum StorageKind {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

/// `set/add/replace/append/prepend key flags exptime bytes [noreply]\r\n`
/// followed by exactly `bytes` octets of data and a trailing `\r\n`.
/// `flags` and `exptime` are accepted and discarded: the Abstract DB has no
/// notion of either (§4.B's contract is flag/TTL-free).
async fn storage<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>, tokens: &[Vec<u8>], kind: StorageKind) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let quiet = noreply(tokens);
    if tokens.len() < 5 {
        if !quiet {
            framed.write_all(b"ERROR\r\n").await?;
        }
        return Ok(true);
    }
    let key = Bytes::copy_from_slice(&tokens[1]);
    let Some(len) = parse_u64(&tokens[4]) else {
        if !quiet {
            framed.write_all(b"CLIENT_ERROR bad command line format\r\n").await?;
        }
        return Ok(true);
    };
    if len > MAX_VALUE_BYTES {
        return Err(WireError::FrameTooLarge { len: len as usize, max: MAX_VALUE_BYTES as usize });
    }

    let data = framed.read_exact(len as usize).await?;
    let trailer = framed.read_exact(2).await?;
    if &trailer[..] != b"\r\n" {
        if !quiet {
            framed.write_all(b"CLIENT_ERROR bad data chunk\r\n").await?;
        }
        return Ok(true);
    }
    let val = data.freeze();

    let op = match kind {
        StorageKind::Set => LoggedOp::Put { key, val },
        StorageKind::Add => LoggedOp::PutKeep { key, val },
        StorageKind::Replace => LoggedOp::Replace { key, val },
        StorageKind::Append => LoggedOp::PutCat { key, val },
        StorageKind::Prepend => LoggedOp::Prepend { key, val },
    };
    let exec = state.logged.execute(op).await;
    if matches!(exec.outcome, OpOutcome::KeepExisting | OpOutcome::NoRecord) {
        state.stats.record_put_miss();
    }
    if quiet {
        return Ok(true);
    }
    let reply: &[u8] = match exec.outcome {
        OpOutcome::Success => b"STORED\r\n",
        OpOutcome::KeepExisting | OpOutcome::NoRecord => b"NOT_STORED\r\n",
        _ => b"SERVER_ERROR miscellaneous error\r\n",
    };
    framed.write_all(reply).await?;
    Ok(true)
}

/// `get key [key...]\r\n` / `gets key [key...]\r\n`. Every hit is rendered
/// as `VALUE <key> 0 <bytes>[ <cas>]\r\n<data>\r\n`, terminated by a single
/// `END\r\n`. CAS identifiers aren't tracked by the Abstract DB, so `gets`
/// reports a fixed `0` — enough to keep CAS-aware clients' wire parsing
/// happy without actually enforcing compare-and-swap semantics.
async fn get<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>, tokens: &[Vec<u8>], with_cas: bool) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut out = Vec::new();
    for key in &tokens[1..] {
        match state.logged.db().get(key).await {
            Ok(Some(val)) => {
                out.extend_from_slice(b"VALUE ");
                out.extend_from_slice(key);
                out.extend_from_slice(b" 0 ");
                out.extend_from_slice(val.len().to_string().as_bytes());
                if with_cas {
                    out.extend_from_slice(b" 0");
                }
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(&val);
                out.extend_from_slice(b"\r\n");
            }
            Ok(None) => state.stats.record_get_miss(),
            Err(_) => {}
        }
    }
    out.extend_from_slice(b"END\r\n");
    framed.write_all(&out).await?;
    Ok(true)
}

async fn delete<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>, tokens: &[Vec<u8>]) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let quiet = noreply(tokens);
    if tokens.len() < 2 {
        if !quiet {
            framed.write_all(b"ERROR\r\n").await?;
        }
        return Ok(true);
    }
    let key = Bytes::copy_from_slice(&tokens[1]);
    let exec = state.logged.execute(LoggedOp::Out { key }).await;
    if exec.outcome == OpOutcome::NoRecord {
        state.stats.record_out_miss();
    }
    if quiet {
        return Ok(true);
    }
    let reply: &[u8] = match exec.outcome {
        OpOutcome::Success => b"DELETED\r\n",
        OpOutcome::NoRecord => b"NOT_FOUND\r\n",
        _ => b"SERVER_ERROR miscellaneous error\r\n",
    };
    framed.write_all(reply).await?;
    Ok(true)
}

/// `incr key value [noreply]\r\n` / `decr key value [noreply]\r\n`: a
/// textual-decimal read-modify-write under the key's record lock
/// (`sign` flips the delta for `decr`), distinct from the binary
/// `addint`'s 4-byte binary counter. Missing keys are reported
/// `NOT_FOUND` and are never created by `incr`/`decr`.
async fn incr_decr<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>, tokens: &[Vec<u8>], sign: i64) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let quiet = noreply(tokens);
    if tokens.len() < 3 {
        if !quiet {
            framed.write_all(b"ERROR\r\n").await?;
        }
        return Ok(true);
    }
    let key = Bytes::copy_from_slice(&tokens[1]);
    let Some(delta) = parse_i64(&tokens[2]).map(|d| d * sign) else {
        if !quiet {
            framed.write_all(b"CLIENT_ERROR invalid numeric delta argument\r\n").await?;
        }
        return Ok(true);
    };
    let exec = state.logged.execute(LoggedOp::Incr { key, delta }).await;
    if quiet {
        return Ok(true);
    }
    match (exec.outcome, exec.value) {
        (OpOutcome::Success, LoggedValue::Int64(v)) => {
            framed.write_all(format!("{v}\r\n").as_bytes()).await?;
        }
        (OpOutcome::NoRecord, _) => framed.write_all(b"NOT_FOUND\r\n").await?,
        _ => framed.write_all(b"SERVER_ERROR miscellaneous error\r\n").await?,
    }
    Ok(true)
}

/// `stats\r\n`: the same fields `render_tsv` gives the binary `stat`
/// command, re-rendered one per line as `STAT <k> <v>\r\n`, terminated by
/// `END\r\n`.
async fn stats<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
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
    let mut out = Vec::new();
    for line in tsv.lines() {
        if let Some((k, v)) = line.split_once('\t') {
            out.extend_from_slice(b"STAT ");
            out.extend_from_slice(k.as_bytes());
            out.push(b' ');
            out.extend_from_slice(v.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
    out.extend_from_slice(b"END\r\n");
    framed.write_all(&out).await?;
    Ok(true)
}

/// `flush_all [delay] [noreply]\r\n` maps onto `Vanish` (§4.G); the
/// optional delay is accepted and ignored since the Abstract DB has no
/// notion of deferred expiry.
async fn flush_all<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>, tokens: &[Vec<u8>]) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let quiet = noreply(tokens);
    let exec = state.logged.execute(LoggedOp::Vanish).await;
    if quiet {
        return Ok(true);
    }
    let reply: &[u8] = match exec.outcome {
        OpOutcome::Success => b"OK\r\n",
        _ => b"SERVER_ERROR miscellaneous error\r\n",
    };
    framed.write_all(reply).await?;
    Ok(true)
}

async fn version<S>(framed: &mut FramedIo<S>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.write_all(format!("VERSION {}\r\n", crate::app::VERSION).as_bytes()).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ServerState;
    use crate::cli::{Args, Config};
    use crate::db::hash::HashDb;
    use crate::db::logged::LoggedDb;
    use crate::db::{AbstractDb, DbMode};
    use crate::ext::NullExtension;
    use crate::replication::ReplicationState;
    use crate::stats::Stats;
    use clap::Parser;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn test_state() -> Arc<ServerState> {
        let config: Config = Args::parse_from(["ttserver", "*"]).into();
        let db: Arc<dyn AbstractDb> = Arc::new(HashDb::new("*", DbMode::ReadWrite));
        let logged = Arc::new(LoggedDb::new(db, None, config.sid, config.strict_consistency));
        Arc::new(ServerState {
            sid: config.sid,
            pid: 1,
            start_time: Instant::now(),
            stats: Arc::new(Stats::new()),
            mask: config.mask,
            db_type: "on-memory hash",
            ulog: None,
            logged,
            replication: ReplicationState::new(None, false, std::path::PathBuf::from("/tmp/ttserver-memcached-test.rts")),
            ext: Arc::new(NullExtension),
            generation: AtomicU32::new(0),
            config,
        })
    }

    fn tok(words: &[&str]) -> Vec<Vec<u8>> {
        words.iter().map(|w| w.as_bytes().to_vec()).collect()
    }

    async fn read_line(client: &mut (impl AsyncReadExt + Unpin)) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            client.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
            if buf.ends_with(b"\r\n") {
                return buf;
            }
        }
    }

    async fn read_until_end(client: &mut (impl AsyncReadExt + Unpin), buf: &mut Vec<u8>) {
        let mut chunk = [0u8; 256];
        loop {
            let n = client.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if buf.ends_with(b"END\r\n") || buf.ends_with(b"STORED\r\n") || buf.ends_with(b"DELETED\r\n") || buf.ends_with(b"NOT_FOUND\r\n") {
                return;
            }
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trips_per_scenario_s4() {
        let state = test_state();
        let (mut client, server) = duplex(8192);
        let mut framed = FramedIo::new(server);

        client.write_all(b"hello\r\n").await.unwrap();
        assert!(handle(&mut framed, &state, tok(&["set", "k", "0", "0", "5"])).await.unwrap());
        let mut reply = Vec::new();
        read_until_end(&mut client, &mut reply).await;
        assert_eq!(&reply, b"STORED\r\n");

        assert!(handle(&mut framed, &state, tok(&["get", "k"])).await.unwrap());
        let mut reply = Vec::new();
        read_until_end(&mut client, &mut reply).await;
        assert_eq!(&reply, b"VALUE k 0 5\r\nhello\r\nEND\r\n");
    }

    #[tokio::test]
    async fn replace_on_missing_key_reports_not_stored() {
        let state = test_state();
        let (mut client, server) = duplex(8192);
        let mut framed = FramedIo::new(server);
        client.write_all(b"xy\r\n").await.unwrap();
        assert!(handle(&mut framed, &state, tok(&["replace", "missing", "0", "0", "2"])).await.unwrap());
        let mut reply = Vec::new();
        read_until_end(&mut client, &mut reply).await;
        assert_eq!(&reply, b"NOT_STORED\r\n");
    }

    #[tokio::test]
    async fn delete_reports_not_found_for_absent_key() {
        let state = test_state();
        let (client, server) = duplex(8192);
        let mut client = client;
        let mut framed = FramedIo::new(server);
        assert!(handle(&mut framed, &state, tok(&["delete", "nope"])).await.unwrap());
        let mut reply = Vec::new();
        read_until_end(&mut client, &mut reply).await;
        assert_eq!(&reply, b"NOT_FOUND\r\n");
    }

    #[tokio::test]
    async fn noreply_suppresses_the_response() {
        let state = test_state();
        let (mut client, server) = duplex(8192);
        let mut framed = FramedIo::new(server);
        client.write_all(b"v\r\n").await.unwrap();
        assert!(handle(&mut framed, &state, tok(&["set", "k", "0", "0", "1", "noreply"])).await.unwrap());
        assert_eq!(state.logged.db().get(b"k").await.unwrap().as_deref(), Some(&b"v"[..]));
        drop(client);
    }

    #[tokio::test]
    async fn quit_closes_the_connection() {
        let state = test_state();
        let (_client, server) = duplex(8192);
        let mut framed = FramedIo::new(server);
        assert!(!handle(&mut framed, &state, tok(&["quit"])).await.unwrap());
    }

    /// A `set`-stored ASCII decimal (the normal shape for a memcached
    /// counter) must `incr`/`decr` as a textual value, not an error — this
    /// used to fail because `incr` went through the binary `addint`'s
    /// 4-byte representation instead.
    #[tokio::test]
    async fn incr_reads_and_writes_the_ascii_decimal_a_prior_set_stored() {
        let state = test_state();
        let (mut client, server) = duplex(8192);
        let mut framed = FramedIo::new(server);

        client.write_all(b"0\r\n").await.unwrap();
        assert!(handle(&mut framed, &state, tok(&["set", "counter", "0", "0", "1"])).await.unwrap());
        let mut reply = Vec::new();
        read_until_end(&mut client, &mut reply).await;
        assert_eq!(&reply, b"STORED\r\n");

        assert!(handle(&mut framed, &state, tok(&["incr", "counter", "1"])).await.unwrap());
        assert_eq!(read_line(&mut client).await, b"1\r\n");

        assert!(handle(&mut framed, &state, tok(&["decr", "counter", "5"])).await.unwrap());
        assert_eq!(read_line(&mut client).await, b"0\r\n");
    }

    #[tokio::test]
    async fn incr_on_a_missing_key_reports_not_found_and_does_not_create_it() {
        let state = test_state();
        let (mut client, server) = duplex(8192);
        let mut framed = FramedIo::new(server);
        assert!(handle(&mut framed, &state, tok(&["incr", "missing", "5"])).await.unwrap());
        assert_eq!(read_line(&mut client).await, b"NOT_FOUND\r\n");
        assert_eq!(state.logged.db().get(b"missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn a_masked_command_replies_forbidden_across_the_front_end() {
        let mut state = test_state();
        Arc::get_mut(&mut state).unwrap().mask.mask("get");
        let (mut client, server) = duplex(8192);
        let mut framed = FramedIo::new(server);
        assert!(handle(&mut framed, &state, tok(&["get", "k"])).await.unwrap());
        assert_eq!(read_line(&mut client).await, b"CLIENT_ERROR forbidden\r\n");
    }
}
