//! LiuProxy remote endpoint.
//!
//! The remote side of an encrypted proxy tunnel: it accepts carriers from a
//! trusted gateway on a single TCP port (raw framed streams, smux sessions,
//! or WebSocket-wrapped smux sessions), reconstructs the per-stream intent,
//! dials the named target, and relays data with per-record authenticated
//! encryption. A UDP socket on the same port serves SOCKS5-style UDP
//! associations.
//!
//! ```text
//! gateway ──tcp──▶ demultiplexer ──▶ carrier ──▶ framed records ──▶ cipher
//!                                                      │
//!                                            metadata ─┴─▶ target dial
//! ```
//!
//! The library exposes the building blocks; the `liuproxy-remote` binary
//! wires them to an INI configuration file.

pub mod adapter;
pub mod config;
pub mod crypt;
pub mod mux;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod udp;
pub mod ws;

pub use config::{Config, ConfigError};
pub use crypt::{Cipher, CryptError};
pub use protocol::{Address, Metadata, ProtocolError, StreamKind};
pub use server::RemoteServer;
pub use udp::UdpRelay;

/// Crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Invalid or unusable configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Record encryption or decryption failed.
    #[error("crypto error: {0}")]
    Crypt(#[from] CryptError),

    /// Malformed metadata or SOCKS5 header.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Underlying socket or stream failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The carrier ended before delivering a metadata record.
    #[error("stream closed before metadata record")]
    MissingMetadata,

    /// A non-TCP stream kind arrived on a TCP carrier.
    #[error("unexpected stream kind on TCP carrier")]
    UnexpectedStreamKind,
}
