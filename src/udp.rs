//! SOCKS5-style UDP association manager.
//!
//! A single UDP socket shares the TCP listen port. Each datagram from the
//! gateway is decrypted, its SOCKS5 UDP header names the real target, and a
//! per-gateway session owns the outbound socket used to reach it. Replies
//! flow back through the same listener, SOCKS5-wrapped and re-encrypted.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::crypt::Cipher;
use crate::protocol::{Address, ProtocolError, ADDR_IPV4};

/// Idle lifetime of a session; every gateway packet extends it.
const UDP_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Extra slack on the reply-loop read deadline beyond the session timeout.
const REPLY_READ_GRACE: Duration = Duration::from_secs(5);

/// How often the sweeper scans for expired sessions.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// One gateway endpoint's association: a dedicated outbound socket plus its
/// expiry bookkeeping.
struct UdpSession {
    outbound: Arc<UdpSocket>,
    /// Expiry as milliseconds since the relay started. Concurrent touches
    /// are plain stores of a fresh timestamp.
    expiry_ms: AtomicU64,
    cancel: CancellationToken,
}

impl UdpSession {
    fn touch(&self, epoch: Instant) {
        let deadline = epoch.elapsed() + UDP_SESSION_TIMEOUT;
        self.expiry_ms
            .store(deadline.as_millis() as u64, Ordering::Relaxed);
    }

    fn expired(&self, epoch: Instant) -> bool {
        epoch.elapsed().as_millis() as u64 > self.expiry_ms.load(Ordering::Relaxed)
    }
}

/// UDP side of the remote endpoint.
pub struct UdpRelay {
    listener: Arc<UdpSocket>,
    cipher: Cipher,
    buffer_size: usize,
    epoch: Instant,
    sessions: RwLock<HashMap<SocketAddr, Arc<UdpSession>>>,
}

impl UdpRelay {
    pub fn new(config: &Config, listener: Arc<UdpSocket>) -> Arc<Self> {
        Arc::new(Self {
            listener,
            cipher: Cipher::new(config.crypt),
            buffer_size: config.buffer_size,
            epoch: Instant::now(),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Receive loop: every datagram is handled in its own task, so a slow
    /// DNS resolution for one gateway cannot stall the others.
    pub async fn run(self: Arc<Self>) {
        let sweeper = self.clone();
        tokio::spawn(async move { sweeper.sweep_loop().await });

        let mut buf = vec![0u8; self.buffer_size];
        loop {
            match self.listener.recv_from(&mut buf).await {
                Ok((n, gateway)) => {
                    let packet = buf[..n].to_vec();
                    let relay = self.clone();
                    tokio::spawn(async move { relay.handle_packet(packet, gateway).await });
                }
                Err(e) => {
                    // The listener going away ends the whole UDP side.
                    log::error!("error reading from UDP listener: {}", e);
                    return;
                }
            }
        }
    }

    async fn handle_packet(self: Arc<Self>, packet: Vec<u8>, gateway: SocketAddr) {
        let plain = match self.cipher.decrypt(&packet) {
            Ok(plain) => plain,
            Err(e) => {
                log::warn!("failed to decrypt UDP packet from {}: {}", gateway, e);
                return;
            }
        };

        let (addr, port, payload) = match parse_udp_header(&plain) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!("failed to parse SOCKS5 UDP header from {}: {}", gateway, e);
                return;
            }
        };

        let session = match self.clone().get_or_create_session(gateway).await {
            Ok(session) => session,
            Err(e) => {
                log::warn!("failed to create UDP session for {}: {}", gateway, e);
                return;
            }
        };
        session.touch(self.epoch);

        let target = match resolve_target(&addr, port).await {
            Ok(target) => target,
            Err(e) => {
                log::warn!("failed to resolve UDP target {}:{}: {}", addr, port, e);
                return;
            }
        };

        log::debug!("forwarding {} bytes from {} to {}", payload.len(), gateway, target);
        if let Err(e) = session.outbound.send_to(payload, target).await {
            log::warn!("failed to write to UDP target {}: {}", target, e);
        }
    }

    /// Load-or-insert on the session table. The socket bind happens outside
    /// the lock; if another packet won the race in the meantime, the loser's
    /// socket is simply dropped.
    async fn get_or_create_session(
        self: Arc<Self>,
        gateway: SocketAddr,
    ) -> io::Result<Arc<UdpSession>> {
        if let Some(session) = self.sessions.read().await.get(&gateway) {
            return Ok(session.clone());
        }

        let outbound = UdpSocket::bind(("0.0.0.0", 0)).await?;
        let session = Arc::new(UdpSession {
            outbound: Arc::new(outbound),
            expiry_ms: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });
        session.touch(self.epoch);

        let mut table = self.sessions.write().await;
        match table.entry(gateway) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                log::debug!("creating new UDP session for {}", gateway);
                slot.insert(session.clone());
                drop(table);

                let relay = self.clone();
                let reply_session = session.clone();
                tokio::spawn(async move { relay.reply_loop(reply_session, gateway).await });
                Ok(session)
            }
        }
    }

    /// Pump replies from the session's outbound socket back to the gateway.
    ///
    /// Runs until the read deadline lapses, the socket errors, or the
    /// sweeper cancels the session.
    async fn reply_loop(self: Arc<Self>, session: Arc<UdpSession>, gateway: SocketAddr) {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let received = tokio::select! {
                _ = session.cancel.cancelled() => break,
                received = tokio::time::timeout(
                    UDP_SESSION_TIMEOUT + REPLY_READ_GRACE,
                    session.outbound.recv_from(&mut buf),
                ) => received,
            };

            let (n, remote) = match received {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    log::debug!("reply loop for {} terminating: {}", gateway, e);
                    break;
                }
                Err(_) => {
                    log::debug!("reply loop for {} idle, terminating", gateway);
                    break;
                }
            };

            // IPv6 replies are not representable toward the gateway.
            let remote = match remote {
                SocketAddr::V4(v4) => v4,
                SocketAddr::V6(_) => continue,
            };

            let mut reply = Vec::with_capacity(10 + n);
            reply.extend_from_slice(&[0x00, 0x00, 0x00, ADDR_IPV4]);
            reply.extend_from_slice(&remote.ip().octets());
            reply.extend_from_slice(&remote.port().to_be_bytes());
            reply.extend_from_slice(&buf[..n]);

            let sealed = match self.cipher.encrypt(&reply) {
                Ok(sealed) => sealed,
                Err(e) => {
                    log::warn!("failed to encrypt reply for {}: {}", gateway, e);
                    continue;
                }
            };
            if let Err(e) = self.listener.send_to(&sealed, gateway).await {
                log::warn!("failed to send reply to gateway {}: {}", gateway, e);
            }
        }

        self.remove_session(&gateway).await;
    }

    /// Idempotent removal; both the reply loop and the sweeper call this.
    async fn remove_session(&self, gateway: &SocketAddr) {
        self.sessions.write().await.remove(gateway);
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;

            let expired: Vec<(SocketAddr, Arc<UdpSession>)> = self
                .sessions
                .read()
                .await
                .iter()
                .filter(|(_, session)| session.expired(self.epoch))
                .map(|(addr, session)| (*addr, session.clone()))
                .collect();

            for (gateway, session) in expired {
                log::debug!("cleaning up expired UDP session for {}", gateway);
                session.cancel.cancel();
                self.remove_session(&gateway).await;
            }
        }
    }
}

/// Split a decrypted SOCKS5 UDP datagram into target address and payload.
///
/// Layout: `RSV(2) FRAG(1) ATYP(1) ADDR(var) PORT(u16 BE) payload`.
fn parse_udp_header(data: &[u8]) -> Result<(Address, u16, &[u8]), ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::Truncated);
    }
    if data[2] != 0 {
        return Err(ProtocolError::Fragmented);
    }

    let (addr, consumed) = Address::decode(data[3], &data[4..])?;
    let port_off = 4 + consumed;
    let port_bytes: [u8; 2] = data
        .get(port_off..port_off + 2)
        .ok_or(ProtocolError::Truncated)?
        .try_into()
        .unwrap();
    let port = u16::from_be_bytes(port_bytes);

    Ok((addr, port, &data[port_off + 2..]))
}

async fn resolve_target(addr: &Address, port: u16) -> io::Result<SocketAddr> {
    match addr {
        Address::Ipv4(ip) => Ok(SocketAddr::from((*ip, port))),
        Address::Ipv6(ip) => Ok(SocketAddr::from((*ip, port))),
        Address::Domain(name) => {
            let mut resolved = tokio::net::lookup_host((name.as_str(), port)).await?;
            resolved
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses found"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_udp_header_ipv4() {
        let mut packet = vec![0, 0, 0, ADDR_IPV4];
        packet.extend_from_slice(&[1, 1, 1, 1]);
        packet.extend_from_slice(&53u16.to_be_bytes());
        packet.extend_from_slice(b"dns query");

        let (addr, port, payload) = parse_udp_header(&packet).unwrap();
        assert_eq!(addr, Address::Ipv4(Ipv4Addr::new(1, 1, 1, 1)));
        assert_eq!(port, 53);
        assert_eq!(payload, b"dns query");
    }

    #[test]
    fn test_parse_udp_header_domain() {
        let mut packet = vec![0, 0, 0, crate::protocol::ADDR_DOMAIN];
        packet.push(11);
        packet.extend_from_slice(b"example.com");
        packet.extend_from_slice(&443u16.to_be_bytes());
        packet.extend_from_slice(b"payload");

        let (addr, port, payload) = parse_udp_header(&packet).unwrap();
        assert_eq!(addr, Address::Domain("example.com".to_owned()));
        assert_eq!(port, 443);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_parse_udp_header_empty_payload() {
        let mut packet = vec![0, 0, 0, ADDR_IPV4];
        packet.extend_from_slice(&[8, 8, 8, 8]);
        packet.extend_from_slice(&53u16.to_be_bytes());

        let (_, _, payload) = parse_udp_header(&packet).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn test_parse_udp_header_fragment_dropped() {
        let mut packet = vec![0, 0, 1, ADDR_IPV4];
        packet.extend_from_slice(&[1, 1, 1, 1]);
        packet.extend_from_slice(&53u16.to_be_bytes());

        assert!(matches!(
            parse_udp_header(&packet),
            Err(ProtocolError::Fragmented)
        ));
    }

    #[test]
    fn test_parse_udp_header_truncated() {
        assert!(matches!(
            parse_udp_header(&[0, 0, 0]),
            Err(ProtocolError::Truncated)
        ));
        assert!(matches!(
            parse_udp_header(&[0, 0, 0, ADDR_IPV4, 1, 1]),
            Err(ProtocolError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_resolve_ipv4_literal() {
        let addr = Address::Ipv4(Ipv4Addr::new(127, 0, 0, 1));
        let resolved = resolve_target(&addr, 8080).await.unwrap();
        assert_eq!(resolved, "127.0.0.1:8080".parse().unwrap());
    }
}
