//! Worker pool / dispatcher (§4.F), redesigned per `SPEC_FULL.md` §2: the
//! original's epoll-readiness-queue-plus-OS-thread-pool becomes a `tokio`
//! accept loop plus a bounded [`Semaphore`], one task per connection. The
//! behavior §4.F specifies is kept: bounded worker concurrency, the fixed
//! `TCP_NODELAY`/keepalive/250 ms socket options on accept, per-request
//! deadline enforcement, and a graceful, bounded drain on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use tt_wire::FramedIo;

use crate::app::ServerState;
use crate::proto;

/// Fixed per-operation socket deadline the original sets on every accepted
/// connection (§4.F: "250 ms send/recv timeouts").
const SOCKET_DEADLINE: Duration = Duration::from_millis(250);
/// Bounded grace period for draining in-flight connections on shutdown
/// (§7: "1×poll-period + 1×worker-yield").
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Accepts connections until told to shut down, handing each to its own
/// task gated by a semaphore sized to `thnum` — the tokio equivalent of a
/// fixed worker pool.
pub async fn serve(listener: TcpListener, state: Arc<ServerState>, mut shutdown: watch::Receiver<bool>) {
    let permits = Arc::new(Semaphore::new(state.config.thnum.max(1)));
    let mut inflight = JoinSet::new();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = configure_accepted_socket(&stream) {
                            warn!(error = %e, %addr, "failed to configure accepted socket");
                        }
                        debug!(%addr, "accepted connection");
                        let permits = Arc::clone(&permits);
                        let state = Arc::clone(&state);
                        let conn_shutdown = shutdown.clone();
                        inflight.spawn(async move {
                            let _permit = permits
                                .acquire_owned()
                                .await
                                .expect("dispatcher semaphore is never closed while serving");
                            handle_connection(stream, addr, state, conn_shutdown).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
        while inflight.try_join_next().is_some() {}
    }

    info!(inflight = inflight.len(), "shutting down: draining in-flight connections");
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while inflight.join_next().await.is_some() {}
    })
    .await;
}

/// `TCP_NODELAY` + `SO_KEEPALIVE` + the fixed send/recv deadline every
/// accepted connection gets (§4.F).
fn configure_accepted_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_keepalive(true)?;
    Ok(())
}

/// Serves one connection: repeatedly handles a single request until the
/// peer closes, keep-alive is declined, or the server is shutting down.
/// Each request is wrapped in the operator-configured `-tout` deadline
/// (§5: "per-task deadline... a stuck syscall is terminated by closing its
/// fd"); here that's modeled by dropping the connection task, which closes
/// the socket.
async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: Arc<ServerState>, mut shutdown: watch::Receiver<bool>) {
    let mut framed = FramedIo::new(stream);
    framed.set_deadline(Some(SOCKET_DEADLINE));

    let request_timeout = (state.config.tout_secs > 0).then(|| Duration::from_secs(state.config.tout_secs));

    loop {
        if *shutdown.borrow() {
            break;
        }
        let outcome = tokio::select! {
            _ = shutdown.changed() => break,
            outcome = run_one_request(&mut framed, &state, request_timeout) => outcome,
        };
        match outcome {
            Some(true) => continue,
            Some(false) => break,
            None => {
                debug!(%addr, "connection closed or timed out");
                break;
            }
        }
    }
    debug!(%addr, "connection closed");
}

/// Runs one request, applying the per-request deadline if configured.
/// Returns `None` on any I/O error, EOF, or timeout (connection should
/// close); `Some(keep_alive)` otherwise.
async fn run_one_request(framed: &mut FramedIo<TcpStream>, state: &Arc<ServerState>, request_timeout: Option<Duration>) -> Option<bool> {
    let fut = proto::handle_one(framed, state);
    let result = match request_timeout {
        Some(d) => tokio::time::timeout(d, fut).await.ok()?,
        None => fut.await,
    };
    result.ok()
}
