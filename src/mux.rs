//! Multiplexed-session carrier.
//!
//! One physical connection (plain TCP or an adapted WebSocket) carries many
//! logical streams through an smux-compatible session. The session framing
//! itself is the mux library's business; every accepted stream is handed to
//! the relay engine starting at the metadata record.

use std::sync::Arc;

use async_smux::MuxBuilder;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::Config;
use crate::relay;

/// Run a server-side mux session over `stream` until the session dies.
///
/// Keep-alive probing (10 s interval, 30 s timeout) is the mux library's
/// default and matches the gateway side. Stream-level errors terminate only
/// that stream; when the acceptor stops yielding (session error or close),
/// every child stream is torn down with it.
pub async fn handle_session<S>(stream: S, config: Arc<Config>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (_connector, mut acceptor, worker) =
        MuxBuilder::server().with_connection(stream).build();
    tokio::spawn(worker);

    while let Some(logical) = acceptor.accept().await {
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = relay::serve_stream(logical, &config).await {
                log::debug!("mux stream ended: {}", e);
            }
        });
    }
    log::debug!("mux session closed");
}
