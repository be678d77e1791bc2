//! Per-stream TCP relay engine.
//!
//! Every logical stream lands here, whether it arrived raw, inside a mux
//! session, or inside a WebSocket-carried mux session: read the encrypted
//! metadata record, dial the named target, then pump records in both
//! directions until both sides are done.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::Config;
use crate::crypt::{Cipher, NONCE_LEN, TAG_LEN};
use crate::protocol::{read_frame, write_frame, Metadata, StreamKind};
use crate::RemoteError;

/// Largest plaintext chunk that still fits a u16-length record after the
/// nonce and tag are added.
const MAX_PLAIN_CHUNK: usize = u16::MAX as usize - (NONCE_LEN + TAG_LEN);

/// Serve one logical stream on any byte-oriented carrier.
///
/// The opening record must decrypt to a TCP metadata header; afterwards the
/// uplink (gateway → target) and downlink (target → gateway) loops run
/// concurrently. Each loop propagates end-of-stream by shutting down the
/// peer's write side, so FIN travels through the tunnel in both directions
/// where the transport supports it (non-TCP carriers fall back to closing
/// the stream).
pub async fn serve_stream<S>(stream: S, config: &Config) -> Result<(), RemoteError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let cipher = Cipher::new(config.crypt);
    let (mut gateway_rd, mut gateway_wr) = tokio::io::split(stream);

    let sealed_meta = read_frame(&mut gateway_rd)
        .await?
        .ok_or(RemoteError::MissingMetadata)?;
    let meta_bytes = cipher.decrypt(&sealed_meta)?;
    let meta = Metadata::decode(&meta_bytes)?;

    if meta.kind != StreamKind::Tcp {
        return Err(RemoteError::UnexpectedStreamKind);
    }

    let target_addr = meta.authority();
    let target = TcpStream::connect(&target_addr).await?;
    target.set_nodelay(true)?;
    log::debug!("relaying stream to {}", target_addr);

    let (mut target_rd, mut target_wr) = target.into_split();
    let chunk = config.buffer_size.min(MAX_PLAIN_CHUNK);

    let uplink = async {
        loop {
            match read_frame(&mut gateway_rd).await {
                Ok(Some(record)) => {
                    if record.is_empty() {
                        continue;
                    }
                    let plain = match cipher.decrypt(&record) {
                        Ok(plain) => plain,
                        Err(e) => {
                            log::debug!("uplink decrypt failed for {}: {}", target_addr, e);
                            break;
                        }
                    };
                    if target_wr.write_all(&plain).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::debug!("uplink read failed for {}: {}", target_addr, e);
                    break;
                }
            }
        }
        // Gateway is done sending; let the target see FIN.
        let _ = target_wr.shutdown().await;
    };

    let downlink = async {
        let mut buf = vec![0u8; chunk];
        loop {
            match target_rd.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let sealed = match cipher.encrypt(&buf[..n]) {
                        Ok(sealed) => sealed,
                        Err(e) => {
                            log::debug!("downlink encrypt failed for {}: {}", target_addr, e);
                            break;
                        }
                    };
                    if write_frame(&mut gateway_wr, &sealed).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("downlink read from {} finished: {}", target_addr, e);
                    break;
                }
            }
        }
        // Target is done sending; half-close toward the gateway where the
        // carrier supports it, full close otherwise.
        let _ = gateway_wr.shutdown().await;
    };

    tokio::join!(uplink, downlink);
    log::debug!("relay finished for {}", target_addr);
    Ok(())
}
