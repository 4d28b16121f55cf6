//! Protocol dispatch (§4.G): the first byte of a request picks the binary
//! protocol; otherwise the first line is tokenized and inspected to pick
//! memcached-text or the HTTP/1.1 subset. All three handlers share the
//! same `Result<bool, WireError>` contract — `Ok(keep_alive)` or an error
//! that ends the connection — so [`crate::dispatch`] doesn't need to know
//! which protocol a connection is speaking.

pub mod binary;
pub mod http;
pub mod memcached;

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use tt_wire::{FramedIo, WireError};

use crate::app::ServerState;
use crate::command;

const MEMCACHED_VERBS: &[&str] = &[
    "set", "add", "replace", "append", "prepend", "get", "gets", "delete", "incr", "decr", "stats", "flush_all", "version", "quit",
];
const HTTP_METHODS: &[&str] = &["GET", "HEAD", "PUT", "POST", "DELETE", "OPTIONS"];

/// Reads and answers exactly one request, returning whether the
/// connection should stay open for another (keep-alive).
pub async fn handle_one<S>(framed: &mut FramedIo<S>, state: &Arc<ServerState>) -> Result<bool, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let first = framed.read_byte().await?;
    if first == command::MAGIC {
        return binary::handle(framed, state).await;
    }

    framed.push_back(first);
    let line = framed.read_line().await?;
    let tokens = split_whitespace(&line);
    let Some(verb) = tokens.first() else {
        return Ok(false);
    };
    let verb_str = String::from_utf8_lossy(verb);

    if MEMCACHED_VERBS.contains(&verb_str.as_ref()) {
        memcached::handle(framed, state, tokens).await
    } else if tokens.len() >= 3 && tokens[2].starts_with(b"HTTP/1.") && HTTP_METHODS.contains(&verb_str.to_ascii_uppercase().as_str()) {
        http::handle(framed, state, tokens).await
    } else {
        // No sane response for an unrecognized request line; the
        // connection is dropped (§4.G: "else ignored").
        Ok(false)
    }
}

fn split_whitespace(line: &[u8]) -> Vec<Vec<u8>> {
    line.split(|&b| b == b' ').filter(|s| !s.is_empty()).map(|s| s.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_whitespace_drops_empty_runs() {
        let tokens = split_whitespace(b"set  foo 0 0 3");
        assert_eq!(tokens, vec![b"set".to_vec(), b"foo".to_vec(), b"0".to_vec(), b"0".to_vec(), b"3".to_vec()]);
    }
}
