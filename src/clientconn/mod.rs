//! Client connections: the per-connection runner, its operation modes,
//! traffic recording, and the accept loop.
//!
//! One accepted socket drives one runner. Within a connection everything is
//! strictly serialized: read one message, optionally mirror it upstream,
//! dispatch it, optionally diff the two responses, write exactly one reply.
//! Different connections share nothing but the handler, the backend behind
//! it, and the metrics registry.

mod conn;
mod listener;
mod mode;
mod recorder;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

pub use conn::ConnOpts;
pub use listener::serve;
pub use mode::Mode;
pub use mode::ParseModeError;
pub use mode::ALL_MODES;

/// Run one client connection to completion.
///
/// Returns `Ok(())` for a clean zero-read disconnect and an error for every
/// other ending (cancellation, transport fault, fatal handler error,
/// panic). The caller owns closing the socket; by the time this returns,
/// buffered output has been flushed and any traffic recording has been
/// persisted or discarded.
pub async fn run(
    stream: TcpStream,
    opts: ConnOpts,
    token: CancellationToken,
) -> anyhow::Result<()> {
    conn::Conn::new(opts)?.run(stream, token).await
}
