//! Byte-channel adapters used by the carriers.
//!
//! [`PrefixedStream`] replays bytes that were consumed ahead of time (the
//! two carrier-detect bytes, or anything read past the end of an HTTP
//! request head) so that a downstream consumer sees the connection from its
//! first byte onward. [`WsByteStream`] turns a WebSocket connection into an
//! ordinary `AsyncRead + AsyncWrite` channel for the multiplexer.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// A byte stream with a small replayed prefix.
///
/// Reads drain the prefix first and then fall through to the inner stream;
/// writes, flush and shutdown go straight through, so half-close semantics
/// of the inner transport are preserved.
#[derive(Debug)]
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: impl Into<Bytes>, inner: S) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

fn ws_to_io(err: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

/// WebSocket connection exposed as a byte-oriented bidirectional channel.
///
/// Reads drain leftover bytes of the current binary message before awaiting
/// the next one; ping/pong are transparent; a text message is a protocol
/// error. Each write emits exactly one binary message with the caller's
/// bytes verbatim.
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    leftover: Bytes,
}

impl<S> WsByteStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            leftover: Bytes::new(),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for WsByteStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.leftover.is_empty() {
                let n = this.leftover.len().min(buf.remaining());
                buf.put_slice(&this.leftover.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.leftover = data.into(),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Ok(_)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "received non-binary message from websocket",
                    )))
                }
                Some(Err(e)) => return Poll::Ready(Err(ws_to_io(e))),
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for WsByteStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(ws_to_io)?;
        Pin::new(&mut this.inner)
            .start_send(Message::binary(buf.to_vec()))
            .map_err(ws_to_io)?;
        // The message is queued; kick the sink so it goes out without
        // waiting for an explicit flush. Pending here is not an error.
        if let Poll::Ready(Err(e)) = Pin::new(&mut this.inner).poll_flush(cx) {
            return Poll::Ready(Err(ws_to_io(e)));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(ws_to_io)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_close(cx)
            .map_err(ws_to_io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite::protocol::Role;

    #[tokio::test]
    async fn test_prefix_replayed_before_inner() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(b"T /tunnel").await.unwrap();
        drop(a);

        let mut stream = PrefixedStream::new(&b"GE"[..], b);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"GET /tunnel");
    }

    #[tokio::test]
    async fn test_prefix_survives_short_reads() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);

        let mut stream = PrefixedStream::new(&b"\x02\x00"[..], b);
        let mut one = [0u8; 1];
        stream.read_exact(&mut one).await.unwrap();
        assert_eq!(one[0], 0x02);
        stream.read_exact(&mut one).await.unwrap();
        assert_eq!(one[0], 0x00);
        assert_eq!(stream.read(&mut one).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_prefix_write_passthrough() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut stream = PrefixedStream::new(&b"xx"[..], a);
        stream.write_all(b"payload").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut out = Vec::new();
        b.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"payload");
    }

    async fn ws_pair() -> (
        WsByteStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (server_io, client_io) = tokio::io::duplex(4096);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (WsByteStream::new(server), client)
    }

    #[tokio::test]
    async fn test_ws_read_drains_partial_messages() {
        let (mut server, mut client) = ws_pair().await;
        client
            .send(Message::binary(b"0123456789".to_vec()))
            .await
            .unwrap();

        let mut head = [0u8; 4];
        server.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"0123");

        let mut tail = [0u8; 6];
        server.read_exact(&mut tail).await.unwrap();
        assert_eq!(&tail, b"456789");
    }

    #[tokio::test]
    async fn test_ws_write_emits_binary_messages() {
        use futures::StreamExt;

        let (mut server, mut client) = ws_pair().await;
        server.write_all(b"reply bytes").await.unwrap();
        server.flush().await.unwrap();

        match client.next().await.unwrap().unwrap() {
            Message::Binary(data) => assert_eq!(&data[..], b"reply bytes"),
            other => panic!("expected binary message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ws_text_message_is_protocol_error() {
        let (mut server, mut client) = ws_pair().await;
        client.send(Message::text("not binary")).await.unwrap();

        let mut buf = [0u8; 8];
        let err = server.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_ws_close_is_eof() {
        let (mut server, mut client) = ws_pair().await;
        client.close(None).await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }
}
