//! WebSocket carrier and plaintext HTTP surface.
//!
//! Connections whose first bytes look like an HTTP GET land here. A
//! WebSocket upgrade turns the connection into a binary byte channel that,
//! by convention, always carries a mux session; anything else is answered
//! by the health-check endpoint and closed.

use std::io;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::adapter::{PrefixedStream, WsByteStream};
use crate::config::Config;
use crate::mux;

/// RFC 6455 handshake GUID.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the HTTP request head we are willing to buffer.
const MAX_REQUEST_HEAD: usize = 8192;

const HEALTH_BODY: &str = "LiuProxy Remote is healthy.";

/// Handle a connection that announced itself with an HTTP request line.
///
/// Upgrades become mux-over-WebSocket tunnels; plain requests get the
/// health check response. Parse failures and refused upgrades close the
/// connection after a plain HTTP error.
pub async fn handle_connection<S>(mut stream: S, config: Arc<Config>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (head, leftover) = match read_request_head(&mut stream).await {
        Ok(parts) => parts,
        Err(e) => {
            log::debug!("failed to read HTTP request head: {}", e);
            return;
        }
    };

    let request = match HttpRequest::parse(&head) {
        Ok(request) => request,
        Err(e) => {
            log::debug!("failed to parse HTTP request: {}", e);
            let _ = write_simple_response(&mut stream, "400 Bad Request", "Bad request.").await;
            return;
        }
    };

    if !request.is_websocket_upgrade() {
        // Health check endpoint: any plain HTTP request gets a 200.
        let _ = write_simple_response(&mut stream, "200 OK", HEALTH_BODY).await;
        return;
    }

    if config.strict_tunnel_path && request.path != "/tunnel" {
        log::debug!("rejected upgrade on path {}", request.path);
        let _ = write_simple_response(&mut stream, "404 Not Found", "Page not found.").await;
        return;
    }

    let key = match (&request.ws_key, request.ws_version.as_deref()) {
        (Some(key), Some("13")) => key.clone(),
        _ => {
            let _ = write_simple_response(
                &mut stream,
                "400 Bad Request",
                "Malformed websocket upgrade.",
            )
            .await;
            return;
        }
    };

    let accept = derive_accept_key(&key);
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept
    );
    if stream.write_all(response.as_bytes()).await.is_err() {
        return;
    }

    // Bytes that arrived behind the request head already belong to the
    // WebSocket layer.
    let upgraded = PrefixedStream::new(leftover, stream);
    let ws = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
    log::debug!("websocket tunnel established on {}", request.path);

    // WebSocket carriers always run the multiplexed protocol inside.
    mux::handle_session(WsByteStream::new(ws), config).await;
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
fn derive_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Minimal view of a parsed request head.
struct HttpRequest {
    path: String,
    upgrade: Option<String>,
    ws_key: Option<String>,
    ws_version: Option<String>,
}

impl HttpRequest {
    fn parse(head: &[u8]) -> io::Result<Self> {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut parsed = httparse::Request::new(&mut headers);
        let status = parsed
            .parse(head)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        if status.is_partial() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "incomplete request head",
            ));
        }

        let mut request = HttpRequest {
            path: parsed.path.unwrap_or("/").to_owned(),
            upgrade: None,
            ws_key: None,
            ws_version: None,
        };
        for header in parsed.headers.iter() {
            let value = String::from_utf8_lossy(header.value).trim().to_owned();
            if header.name.eq_ignore_ascii_case("upgrade") {
                request.upgrade = Some(value);
            } else if header.name.eq_ignore_ascii_case("sec-websocket-key") {
                request.ws_key = Some(value);
            } else if header.name.eq_ignore_ascii_case("sec-websocket-version") {
                request.ws_version = Some(value);
            }
        }
        Ok(request)
    }

    fn is_websocket_upgrade(&self) -> bool {
        self.upgrade
            .as_deref()
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }
}

/// Read up to and including the `\r\n\r\n` terminator.
///
/// Returns the head and any bytes that were read past it; the caller must
/// replay those to whatever consumes the connection next.
async fn read_request_head<S>(stream: &mut S) -> io::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(pos) = find_terminator(&buf) {
            let leftover = buf.split_off(pos + 4);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_REQUEST_HEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

async fn write_simple_response<S>(stream: &mut S, status: &str, body: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n\
         {}",
        status,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}
