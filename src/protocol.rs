//! Wire protocol for the inner tunnel layer.
//!
//! Two things live here: the stream metadata header that opens every logical
//! stream (naming the target host, port, and stream kind), and the framed
//! record layer that carries ciphertext over any byte-stream transport as
//! `<u16 BE length><opaque bytes>` units.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Stream kind wire tags.
pub const STREAM_TCP: u8 = 0x01;
pub const STREAM_UDP: u8 = 0x02;

/// Address kind wire tags, shared with the SOCKS5 UDP header.
pub const ADDR_IPV4: u8 = 0x01;
pub const ADDR_DOMAIN: u8 = 0x03;
pub const ADDR_IPV6: u8 = 0x04;

/// Errors from decoding metadata headers and SOCKS5 address blocks.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Input ended before the header was complete.
    #[error("truncated header")]
    Truncated,

    /// Unknown stream kind byte.
    #[error("unsupported stream kind: {0:#04x}")]
    UnsupportedStreamKind(u8),

    /// Unknown address kind byte.
    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddrType(u8),

    /// Domain name bytes were not valid UTF-8.
    #[error("domain name is not valid UTF-8")]
    InvalidDomainName,

    /// SOCKS5 UDP datagram with a nonzero fragment number.
    #[error("fragmented datagrams are not supported")]
    Fragmented,
}

/// What the gateway intends to do with a logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Tcp,
    Udp,
}

impl StreamKind {
    fn from_wire(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            STREAM_TCP => Ok(StreamKind::Tcp),
            STREAM_UDP => Ok(StreamKind::Udp),
            other => Err(ProtocolError::UnsupportedStreamKind(other)),
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            StreamKind::Tcp => STREAM_TCP,
            StreamKind::Udp => STREAM_UDP,
        }
    }
}

/// Target address in its three wire shapes.
///
/// Domains are kept verbatim; resolution happens at dial time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

impl Address {
    /// Decode one address block tagged `atyp` from the front of `buf`.
    ///
    /// Returns the address and the number of bytes consumed, so the caller
    /// can continue parsing (port, payload) after it.
    pub fn decode(atyp: u8, buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        match atyp {
            ADDR_IPV4 => {
                let octets: [u8; 4] = buf
                    .get(..4)
                    .ok_or(ProtocolError::Truncated)?
                    .try_into()
                    .unwrap();
                Ok((Address::Ipv4(Ipv4Addr::from(octets)), 4))
            }
            ADDR_DOMAIN => {
                let len = *buf.first().ok_or(ProtocolError::Truncated)? as usize;
                let raw = buf.get(1..1 + len).ok_or(ProtocolError::Truncated)?;
                let name = std::str::from_utf8(raw)
                    .map_err(|_| ProtocolError::InvalidDomainName)?
                    .to_owned();
                Ok((Address::Domain(name), 1 + len))
            }
            ADDR_IPV6 => {
                let octets: [u8; 16] = buf
                    .get(..16)
                    .ok_or(ProtocolError::Truncated)?
                    .try_into()
                    .unwrap();
                Ok((Address::Ipv6(Ipv6Addr::from(octets)), 16))
            }
            other => Err(ProtocolError::UnsupportedAddrType(other)),
        }
    }

    /// Wire tag for this address shape.
    pub fn atyp(&self) -> u8 {
        match self {
            Address::Ipv4(_) => ADDR_IPV4,
            Address::Domain(_) => ADDR_DOMAIN,
            Address::Ipv6(_) => ADDR_IPV6,
        }
    }

    /// Append the wire encoding of this address to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Address::Ipv4(ip) => out.extend_from_slice(&ip.octets()),
            Address::Domain(name) => {
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
            }
            Address::Ipv6(ip) => out.extend_from_slice(&ip.octets()),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(ip) => write!(f, "{}", ip),
            Address::Domain(name) => write!(f, "{}", name),
            Address::Ipv6(ip) => write!(f, "{}", ip),
        }
    }
}

/// The first record of every logical stream: what to dial, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub kind: StreamKind,
    pub addr: Address,
    pub port: u16,
}

impl Metadata {
    /// Parse a metadata header from a decrypted record.
    ///
    /// Layout: `kind(1) addr_kind(1) address(var) port(u16 BE)`. Trailing
    /// bytes are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < 2 {
            return Err(ProtocolError::Truncated);
        }
        let kind = StreamKind::from_wire(buf[0])?;
        let (addr, consumed) = Address::decode(buf[1], &buf[2..])?;

        let port_off = 2 + consumed;
        let port_bytes: [u8; 2] = buf
            .get(port_off..port_off + 2)
            .ok_or(ProtocolError::Truncated)?
            .try_into()
            .unwrap();

        Ok(Metadata {
            kind,
            addr,
            port: u16::from_be_bytes(port_bytes),
        })
    }

    /// Byte-exact mirror of [`Metadata::decode`].
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 18 + 2);
        out.push(self.kind.to_wire());
        out.push(self.addr.atyp());
        self.addr.encode_into(&mut out);
        out.extend_from_slice(&self.port.to_be_bytes());
        out
    }

    /// `host:port` dial string, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        match &self.addr {
            Address::Ipv6(ip) => format!("[{}]:{}", ip, self.port),
            other => format!("{}:{}", other, self.port),
        }
    }
}

/// Read one length-prefixed record.
///
/// `Ok(None)` means the peer closed cleanly at a record boundary; EOF in the
/// middle of a record is an error. A zero length is legal and yields an
/// empty body.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u16::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write one length-prefixed record and flush it.
///
/// The flush is what pushes a WebSocket binary frame onto the wire; on plain
/// TCP it is a no-op. Writers on a given channel are serialized by the
/// calling component, so the two writes cannot interleave with another
/// record.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record exceeds 65535 bytes"))?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}
