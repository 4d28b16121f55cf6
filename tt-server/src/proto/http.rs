//! The HTTP/1.1 subset (§4.G/§6): request-line method already identified
//! by [`super::handle_one`]; this module reads the remaining headers and
//! optional body, percent-decodes the path into a key, and maps each
//! method onto the same Logged-DB operations the binary protocol uses.

use std::sync::Arc;

use bytes::Bytes;
use percent_encoding::percent_decode;
use tokio::io::{AsyncRead, AsyncWrite};

use tt_wire::{FramedIo, WireError};

use crate::app::ServerState;
use crate::command::LoggedOp;
use crate::db::logged::LoggedValue;
use crate::error::OpOutcome;

/// Request body size cap, mirroring the binary protocol's per-arg limit
/// (§4.H).
const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

struct Header {
    name: String,
    value: Vec<u8>,
}

fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a [u8]> {
    headers.iter().find(|h| h.name.eq_ignore_ascii_case(name)).map(|h| h.value.as_slice())
}

async fn read_headers<S>(framed: &mut FramedIo<S>) -> Result<Vec<Header>, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut headers = Vec::new();
    loop {
        let line = framed.read_line().await?;
        if line.is_empty() {
            return Ok(headers);
        }
        if let Some(colon) = line.iter().position(|&b| b == b':') {
            let name = String::from_utf8_lossy(&line[..colon]).trim().to_string();
            let value = line[colon + 1..].iter().copied().collect::<Vec<u8>>();
            let value: Vec<u8> = {
                let start = value.iter().position(|&b| b != b' ' && b != b'\t').unwrap_or(value.len());
                value[start..].to_vec()
            };
            headers.push(Header { name, value });
        }
    }
}

fn decode_path(path: &[u8]) -> Vec<u8> {
    let path = path.strip_prefix(b"/").unwrap_or(path);
    percent_decode(path).collect()
}

pub async fn handle<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>, tokens: Vec<Vec<u8>>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let method = String::from_utf8_lossy(&tokens[0]).to_ascii_uppercase();
    let path = tokens[1].clone();
    let version = tokens[2].clone();

    let headers = read_headers(framed).await?;
    let content_length = header_value(&headers, "Content-Length")
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(WireError::FrameTooLarge { len: content_length, max: MAX_BODY_BYTES });
    }
    let body = if content_length > 0 {
        framed.read_exact(content_length).await?.freeze()
    } else {
        Bytes::new()
    };

    let close_requested = header_value(&headers, "Connection")
        .map(|v| v.eq_ignore_ascii_case(b"close"))
        .unwrap_or(false);
    let keep_alive = version.as_slice() == b"HTTP/1.1" && !close_requested;

    let key = decode_path(&path);

    if let Some(cmd_byte) = crate::mask::binary_equivalent_for_http_method(&method) {
        if state.mask.is_forbidden(cmd_byte) {
            write_response(framed, 403, reason(403), &[], Bytes::new(), keep_alive).await?;
            return Ok(keep_alive);
        }
    }

    match method.as_str() {
        "GET" => get(framed, state, &key, true, keep_alive).await,
        "HEAD" => get(framed, state, &key, false, keep_alive).await,
        "PUT" => put(framed, state, &key, &headers, body, keep_alive).await,
        "POST" => post(framed, state, &key, &headers, body, keep_alive).await,
        "DELETE" => delete(framed, state, &key, keep_alive).await,
        "OPTIONS" => options(framed, state, keep_alive).await,
        _ => {
            write_response(framed, 501, "Not Implemented", &[], Bytes::new(), keep_alive).await?;
            Ok(keep_alive)
        }
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        403 => "Forbidden",
        404 => "Not Found",
        409 => "Conflict",
        500 => "Internal Server Error",
        _ => "Error",
    }
}

async fn write_response<S>(
    framed: &mut FramedIo<S>,
    status: u16,
    reason_phrase: &str,
    extra_headers: &[(&str, String)],
    body: Bytes,
    keep_alive: bool,
) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_response_with_length(framed, status, reason_phrase, extra_headers, body.len(), body, keep_alive).await
}

/// Like [`write_response`], but lets the caller state a `Content-Length`
/// different from the body actually written — `HEAD` reports the length
/// `GET` would have sent while writing no body at all.
async fn write_response_with_length<S>(
    framed: &mut FramedIo<S>,
    status: u16,
    reason_phrase: &str,
    extra_headers: &[(&str, String)],
    content_length: usize,
    body: Bytes,
    keep_alive: bool,
) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut out = format!("HTTP/1.1 {status} {reason_phrase}\r\nContent-Length: {content_length}\r\n");
    for (name, value) in extra_headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str(if keep_alive { "Connection: keep-alive\r\n" } else { "Connection: close\r\n" });
    out.push_str("\r\n");
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(&body);
    framed.write_all(&bytes).await
}

/// `GET`/`HEAD /urlencoded-key`: `HEAD` runs the identical lookup but
/// omits the body, reporting `Content-Length` as if it had been sent
/// (§4.G, §8 testable property 8: neither ever mutates).
async fn get<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>, key: &[u8], include_body: bool, keep_alive: bool) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match state.logged.db().get(key).await {
        Ok(Some(val)) => {
            let len = val.len();
            let body = if include_body { val } else { Bytes::new() };
            write_response_with_length(framed, 200, reason(200), &[], len, body, keep_alive).await?;
        }
        Ok(None) => {
            state.stats.record_get_miss();
            write_response(framed, 404, reason(404), &[], Bytes::new(), keep_alive).await?;
        }
        Err(_) => write_response(framed, 500, reason(500), &[], Bytes::new(), keep_alive).await?,
    }
    Ok(keep_alive)
}

/// `PUT /urlencoded-key` with `X-TT-PDMODE: 0|1|2` selecting put/putkeep/putcat.
async fn put<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>, key: &[u8], headers: &[Header], body: Bytes, keep_alive: bool) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mode = header_value(headers, "X-TT-PDMODE")
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|v| v.trim().parse::<u8>().ok())
        .unwrap_or(0);
    let key = Bytes::copy_from_slice(key);
    let op = match mode {
        1 => LoggedOp::PutKeep { key, val: body },
        2 => LoggedOp::PutCat { key, val: body },
        _ => LoggedOp::Put { key, val: body },
    };
    let exec = state.logged.execute(op).await;
    if matches!(exec.outcome, OpOutcome::KeepExisting | OpOutcome::NoRecord) {
        state.stats.record_put_miss();
    }
    let (status, label) = match exec.outcome {
        OpOutcome::Success => (201, reason(201)),
        OpOutcome::KeepExisting => (409, reason(409)),
        _ => (500, reason(500)),
    };
    write_response(framed, status, label, &[], Bytes::new(), keep_alive).await?;
    Ok(keep_alive)
}

/// `POST /urlencoded-key`: `X-TT-XNAME` calls the scripting extension
/// hook with the path as key and the body as its single argument;
/// `X-TT-MNAME` calls `misc` with the body's form-decoded
/// `name=value&...` pairs as alternating args.
async fn post<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>, key: &[u8], headers: &[Header], body: Bytes, keep_alive: bool) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if let Some(xname) = header_value(headers, "X-TT-XNAME") {
        let name = String::from_utf8_lossy(xname).into_owned();
        let outcome = state.ext.call_method(&name, key, std::slice::from_ref(&body)).await;
        let (status, body) = match outcome {
            Some(result) => (200, Bytes::from(result)),
            None => (500, Bytes::new()),
        };
        write_response(framed, status, reason(status), &[], body, keep_alive).await?;
        return Ok(keep_alive);
    }

    if let Some(mname) = header_value(headers, "X-TT-MNAME") {
        let name = String::from_utf8_lossy(mname).into_owned();
        let args = decode_form_pairs(&body);
        let exec = state.logged.execute(LoggedOp::Misc { name, args }).await;
        let status = if exec.outcome == OpOutcome::Success { 200 } else { 500 };
        let body = match exec.value {
            LoggedValue::List(items) => {
                let mut buf = Vec::new();
                for item in &items {
                    buf.extend_from_slice(item);
                    buf.push(b'\n');
                }
                Bytes::from(buf)
            }
            _ => Bytes::new(),
        };
        write_response(framed, status, reason(status), &[], body, keep_alive).await?;
        return Ok(keep_alive);
    }

    write_response(framed, 400, "Bad Request", &[], Bytes::new(), keep_alive).await?;
    Ok(keep_alive)
}

/// Splits an `application/x-www-form-urlencoded` body into alternating
/// `name`, `value` byte args, the shape `misc`'s variadic arg list takes.
fn decode_form_pairs(body: &[u8]) -> Vec<Bytes> {
    let mut args = Vec::new();
    for pair in body.split(|&b| b == b'&') {
        if pair.is_empty() {
            continue;
        }
        let (name, value) = match pair.iter().position(|&b| b == b'=') {
            Some(eq) => (&pair[..eq], &pair[eq + 1..]),
            None => (pair, &pair[0..0]),
        };
        args.push(Bytes::from(percent_decode(name).collect::<Vec<u8>>()));
        args.push(Bytes::from(percent_decode(value).collect::<Vec<u8>>()));
    }
    args
}

async fn delete<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>, key: &[u8], keep_alive: bool) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let exec = state.logged.execute(LoggedOp::Out { key: Bytes::copy_from_slice(key) }).await;
    let (status, label) = match exec.outcome {
        OpOutcome::Success => (200, reason(200)),
        OpOutcome::NoRecord => {
            state.stats.record_out_miss();
            (404, reason(404))
        }
        _ => (500, reason(500)),
    };
    write_response(framed, status, label, &[], Bytes::new(), keep_alive).await?;
    Ok(keep_alive)
}

/// `OPTIONS`: advertises the method set and the `X-TT-*` identity/status
/// headers (§6) without touching the DB (§8 testable property 8).
async fn options<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>, keep_alive: bool) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let rnum = state.logged.db().rnum().await.unwrap_or(0);
    let size = state.logged.db().size().await.unwrap_or(0);
    let target = state.replication.current_target();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    let mut headers = vec![
        ("Allow", "GET, HEAD, PUT, POST, DELETE, OPTIONS".to_string()),
        ("X-TT-VERSION", crate::app::VERSION.to_string()),
        ("X-TT-LIBVER", "1".to_string()),
        ("X-TT-PROTVER", "0.91".to_string()),
        ("X-TT-OS", std::env::consts::OS.to_string()),
        ("X-TT-TIME", format!("{now:.6}")),
        ("X-TT-PID", state.pid.to_string()),
        ("X-TT-SID", state.sid.to_string()),
        ("X-TT-TYPE", state.db_type.to_string()),
        ("X-TT-PATH", state.db_path()),
        ("X-TT-RNUM", rnum.to_string()),
        ("X-TT-SIZE", size.to_string()),
        ("X-TT-BIGEND", "1".to_string()),
        ("X-TT-LOADAVG", "0.000000".to_string()),
    ];
    if let Some(target) = target {
        let rts = state.replication.last_applied_ts();
        let delay = (now - rts as f64 / 1_000_000.0).max(0.0);
        headers.push(("X-TT-MHOST", target.host));
        headers.push(("X-TT-MPORT", target.port.to_string()));
        headers.push(("X-TT-RTS", rts.to_string()));
        headers.push(("X-TT-DELAY", format!("{delay:.6}")));
    }

    write_response(framed, 200, reason(200), &headers, Bytes::new(), keep_alive).await?;
    Ok(keep_alive)
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
    use crate::stats::{render_tsv, ServerSnapshot, Stats};
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
            replication: ReplicationState::new(None, false, std::path::PathBuf::from("/tmp/ttserver-http-test.rts")),
            ext: Arc::new(NullExtension),
            generation: AtomicU32::new(0),
            config,
        })
    }

    fn tok(method: &str, path: &str, version: &str) -> Vec<Vec<u8>> {
        vec![method.as_bytes().to_vec(), path.as_bytes().to_vec(), version.as_bytes().to_vec()]
    }

    async fn read_all(client: &mut (impl AsyncReadExt + Unpin)) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            match tokio::time::timeout(std::time::Duration::from_millis(100), client.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                Ok(Err(_)) => break,
            }
        }
        buf
    }

    #[tokio::test]
    async fn put_then_repeat_reports_conflict_per_scenario_s5() {
        let state = test_state();
        let (mut client, server) = duplex(8192);
        let mut framed = FramedIo::new(server);

        client
            .write_all(b"Host: x\r\nContent-Length: 4\r\nX-TT-PDMODE: 1\r\n\r\nonce")
            .await
            .unwrap();
        assert!(handle(&mut framed, &state, tok("PUT", "/alpha", "HTTP/1.1")).await.unwrap());
        let resp = read_all(&mut client).await;
        assert!(resp.starts_with(b"HTTP/1.1 201 Created"), "{}", String::from_utf8_lossy(&resp));

        client
            .write_all(b"Host: x\r\nContent-Length: 4\r\nX-TT-PDMODE: 1\r\n\r\ntwic")
            .await
            .unwrap();
        assert!(handle(&mut framed, &state, tok("PUT", "/alpha", "HTTP/1.1")).await.unwrap());
        let resp = read_all(&mut client).await;
        assert!(resp.starts_with(b"HTTP/1.1 409 Conflict"), "{}", String::from_utf8_lossy(&resp));
    }

    #[tokio::test]
    async fn get_missing_key_is_404_and_does_not_mutate() {
        let state = test_state();
        let (mut client, server) = duplex(8192);
        let mut framed = FramedIo::new(server);
        client.write_all(b"Host: x\r\n\r\n").await.unwrap();
        assert!(handle(&mut framed, &state, tok("GET", "/missing", "HTTP/1.1")).await.unwrap());
        let resp = read_all(&mut client).await;
        assert!(resp.starts_with(b"HTTP/1.1 404 Not Found"));
        assert_eq!(state.logged.db().rnum().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn connection_close_header_disables_keep_alive() {
        let state = test_state();
        let (mut client, server) = duplex(8192);
        let mut framed = FramedIo::new(server);
        client.write_all(b"Host: x\r\nConnection: close\r\n\r\n").await.unwrap();
        assert!(!handle(&mut framed, &state, tok("GET", "/missing", "HTTP/1.1")).await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_the_key() {
        let state = test_state();
        state
            .logged
            .execute(LoggedOp::Put { key: Bytes::from_static(b"k"), val: Bytes::from_static(b"v") })
            .await;
        let (mut client, server) = duplex(8192);
        let mut framed = FramedIo::new(server);
        client.write_all(b"Host: x\r\n\r\n").await.unwrap();
        assert!(handle(&mut framed, &state, tok("DELETE", "/k", "HTTP/1.1")).await.unwrap());
        let resp = read_all(&mut client).await;
        assert!(resp.starts_with(b"HTTP/1.1 200 OK"));
        assert_eq!(state.logged.db().get(b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_conflict_increments_the_put_miss_counter() {
        let state = test_state();
        let (mut client, server) = duplex(8192);
        let mut framed = FramedIo::new(server);

        client
            .write_all(b"Host: x\r\nContent-Length: 4\r\nX-TT-PDMODE: 1\r\n\r\nonce")
            .await
            .unwrap();
        handle(&mut framed, &state, tok("PUT", "/alpha", "HTTP/1.1")).await.unwrap();
        read_all(&mut client).await;

        client
            .write_all(b"Host: x\r\nContent-Length: 4\r\nX-TT-PDMODE: 1\r\n\r\ntwic")
            .await
            .unwrap();
        handle(&mut framed, &state, tok("PUT", "/alpha", "HTTP/1.1")).await.unwrap();
        read_all(&mut client).await;

        let db_path = state.db_path();
        let snapshot = ServerSnapshot {
            version: crate::app::VERSION,
            start_time: state.start_time,
            pid: state.pid,
            sid: state.sid,
            db_type: state.db_type,
            db_path: db_path.as_str(),
            rnum: state.logged.db().rnum().await.unwrap(),
            size: state.logged.db().size().await.unwrap(),
            replication: None,
        };
        let tsv = render_tsv(&snapshot, &state.stats);
        assert!(tsv.contains("cnt_put_miss\t1\n"), "{tsv}");
    }

    #[tokio::test]
    async fn a_masked_method_replies_forbidden_without_touching_the_db() {
        let mut state = test_state();
        Arc::get_mut(&mut state).unwrap().mask.mask("put");
        let (mut client, server) = duplex(8192);
        let mut framed = FramedIo::new(server);
        client
            .write_all(b"Host: x\r\nContent-Length: 4\r\n\r\nonce")
            .await
            .unwrap();
        assert!(handle(&mut framed, &state, tok("PUT", "/alpha", "HTTP/1.1")).await.unwrap());
        let resp = read_all(&mut client).await;
        assert!(resp.starts_with(b"HTTP/1.1 403 Forbidden"), "{}", String::from_utf8_lossy(&resp));
        assert_eq!(state.logged.db().rnum().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn options_advertises_allow_and_identity_headers() {
        let state = test_state();
        let (mut client, server) = duplex(8192);
        let mut framed = FramedIo::new(server);
        client.write_all(b"Host: x\r\n\r\n").await.unwrap();
        assert!(handle(&mut framed, &state, tok("OPTIONS", "/", "HTTP/1.1")).await.unwrap());
        let resp = read_all(&mut client).await;
        let text = String::from_utf8_lossy(&resp);
        assert!(text.contains("Allow: GET, HEAD, PUT, POST, DELETE, OPTIONS"));
        assert!(text.contains("X-TT-SID: 0"));
        assert_eq!(state.logged.db().rnum().await.unwrap(), 0);
    }
}
