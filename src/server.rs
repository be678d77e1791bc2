//! Server bootstrap and carrier dispatch.
//!
//! One TCP listener and one UDP socket share the configured port. Every
//! inbound TCP connection is classified by its first two bytes and handed
//! to the matching carrier; the UDP side runs the association manager.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::task::TaskTracker;

use crate::adapter::PrefixedStream;
use crate::config::Config;
use crate::udp::UdpRelay;
use crate::{mux, relay, ws, RemoteError};

/// Deadline for the two carrier-detect bytes of a new connection.
const DETECT_TIMEOUT: Duration = Duration::from_secs(3);

/// The remote endpoint: listeners plus everything hanging off them.
pub struct RemoteServer {
    config: Arc<Config>,
}

impl RemoteServer {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Bind both listeners and serve until Ctrl-C, then drain in-flight
    /// relay tasks before returning.
    pub async fn run(&self) -> Result<(), RemoteError> {
        self.config.validate()?;

        let addr: SocketAddr = ([0, 0, 0, 0], self.config.port).into();
        let tcp = TcpListener::bind(addr).await?;
        let udp_listener = Arc::new(UdpSocket::bind(addr).await?);
        log::info!(">>> SUCCESS: tunnel server listening on {} (tcp+udp)", addr);

        let udp_relay = UdpRelay::new(&self.config, udp_listener);
        tokio::spawn(udp_relay.run());

        let tracker = TaskTracker::new();
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = tcp.accept() => match accepted {
                    Ok((conn, peer)) => {
                        let config = self.config.clone();
                        // A panic inside one connection task is contained by
                        // the task boundary; the server keeps accepting.
                        tracker.spawn(dispatch(conn, peer, config));
                    }
                    Err(e) => log::warn!("failed to accept connection: {}", e),
                },
                _ = &mut shutdown => {
                    log::info!("shutdown requested, draining relay tasks");
                    break;
                }
            }
        }

        tracker.close();
        tracker.wait().await;
        log::info!("all server routines have finished");
        Ok(())
    }
}

/// Classify a fresh connection by its first two bytes and run the carrier.
///
/// `GE` announces an HTTP GET and with it the WebSocket path; an smux
/// version byte followed by a SYN command byte announces a mux session;
/// everything else is treated as a raw framed stream. The consumed bytes
/// are replayed to the carrier, which therefore sees the connection from
/// its first byte.
async fn dispatch(mut conn: TcpStream, peer: SocketAddr, config: Arc<Config>) {
    let mut header = [0u8; 2];
    match timeout(DETECT_TIMEOUT, conn.read_exact(&mut header)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            log::debug!("failed to peek carrier header from {}: {}", peer, e);
            return;
        }
        Err(_) => {
            log::debug!("carrier detection timed out for {}", peer);
            return;
        }
    }

    let stream = PrefixedStream::new(header.to_vec(), conn);
    match header {
        [b'G', b'E'] => {
            log::debug!("websocket carrier detected from {}", peer);
            ws::handle_connection(stream, config).await;
        }
        [1..=3, 0] => {
            log::debug!("mux carrier detected from {}", peer);
            mux::handle_session(stream, config).await;
        }
        _ => {
            log::debug!("raw carrier detected from {}", peer);
            if let Err(e) = relay::serve_stream(stream, &config).await {
                log::debug!("raw relay from {} ended: {}", peer, e);
            }
        }
    }
}
