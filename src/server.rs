//! Accepts TCP connections and runs a session for each.
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::broker::Broker;
use crate::session;

/// Accepts incoming connections until `cancel` fires, handling each as its
/// own task, then waits for every connection task to finish.
pub async fn serve(
    listener: TcpListener,
    broker: Arc<Broker>,
    cancel: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "listening");

    let mut conns = JoinSet::new();
    loop {
        let conn = match select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => break,
            // Reap finished connection tasks as we go.
            Some(_) = conns.join_next(), if !conns.is_empty() => continue,
        } {
            Ok((conn, _)) => conn,
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        };

        conns.spawn(begin_handle(broker.clone(), cancel.clone(), conn));
    }

    while conns.join_next().await.is_some() {}
    Ok(())
}

#[instrument(name = "handle", err, fields(peer = %conn.peer_addr()?), skip_all)]
async fn begin_handle(
    broker: Arc<Broker>,
    cancel: CancellationToken,
    mut conn: TcpStream,
) -> Result<()> {
    debug!("accepted connection");

    conn.set_nodelay(true).context("setting NODELAY")?;

    let (r, w) = conn.split();
    let ret = session::run(broker, r, w, cancel).await;

    conn.shutdown().await.context("during shutdown")?;

    debug!("closed connection");

    ret
}
