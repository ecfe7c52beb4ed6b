//! TCP listener: accepts connections and spawns one runner task each.

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::conn::ConnOpts;

/// Accept-and-spawn loop over an already-bound listener.
///
/// Each accepted socket gets its own runner task with a child cancellation
/// token; canceling `token` stops accepting and drains every connection.
/// Connections run independently: a fault in one never affects another.
pub async fn serve(
    listener: TcpListener,
    opts: ConnOpts,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, mode = %opts.mode, "listening");

    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    // Transient accept failures (fd pressure, reset before
                    // accept) do not stop the listener.
                    warn!(error = %err, "failed to accept connection");
                    continue;
                }
            },
            () = token.cancelled() => {
                info!(addr = %local_addr, "listener stopping");
                return Ok(());
            }
        };

        debug!(peer = %peer_addr, "accepted connection");

        let conn_opts = opts.clone();
        let conn_token = token.child_token();
        tokio::spawn(async move {
            match super::run(stream, conn_opts, conn_token).await {
                Ok(()) => debug!(peer = %peer_addr, "client disconnected"),
                Err(err) => warn!(peer = %peer_addr, error = %err, "connection closed"),
            }
        });
    }
}
