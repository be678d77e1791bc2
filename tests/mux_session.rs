//! Mux-carrier tests: logical streams inside one smux session.

use std::sync::Arc;
use std::time::Duration;

use async_smux::MuxBuilder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

use liuproxy_remote::protocol::{read_frame, write_frame};
use liuproxy_remote::{mux, Address, Cipher, Config, Metadata, StreamKind};

fn session_config() -> Arc<Config> {
    Arc::new(Config {
        mode: "remote".to_owned(),
        buffer_size: 4096,
        crypt: 0,
        port: 0,
        strict_tunnel_path: false,
    })
}

/// Echo target that answers every read immediately, so streams never need
/// a half-close to get their response (smux streams have none).
async fn spawn_echo_target() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut conn, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

async fn exchange<S>(stream: &mut S, target_port: u16, payload: &[u8]) -> Vec<u8>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let cipher = Cipher::new(0);
    let meta = Metadata {
        kind: StreamKind::Tcp,
        addr: Address::Ipv4("127.0.0.1".parse().unwrap()),
        port: target_port,
    };
    write_frame(stream, &cipher.encrypt(&meta.encode()).unwrap())
        .await
        .unwrap();
    write_frame(stream, &cipher.encrypt(payload).unwrap())
        .await
        .unwrap();

    let mut response = Vec::new();
    while response.len() < payload.len() {
        let record = read_frame(stream).await.unwrap().expect("stream closed early");
        if record.is_empty() {
            continue;
        }
        response.extend_from_slice(&cipher.decrypt(&record).unwrap());
    }
    response
}

#[tokio::test]
async fn test_logical_streams_relay_through_session() {
    let target_port = spawn_echo_target().await;
    let (client_io, server_io) = tokio::io::duplex(65536);

    tokio::spawn(mux::handle_session(server_io, session_config()));

    let (connector, _acceptor, worker) = MuxBuilder::client().with_connection(client_io).build();
    tokio::spawn(worker);

    // Two independent logical streams over the same physical session.
    let mut first = connector.connect().unwrap();
    let mut second = connector.connect().unwrap();

    let first_reply = timeout(
        Duration::from_secs(10),
        exchange(&mut first, target_port, b"stream one"),
    )
    .await
    .unwrap();
    let second_reply = timeout(
        Duration::from_secs(10),
        exchange(&mut second, target_port, b"stream two"),
    )
    .await
    .unwrap();

    assert_eq!(first_reply, b"stream one");
    assert_eq!(second_reply, b"stream two");
}

#[tokio::test]
async fn test_bad_stream_does_not_kill_session() {
    let target_port = spawn_echo_target().await;
    let (client_io, server_io) = tokio::io::duplex(65536);

    tokio::spawn(mux::handle_session(server_io, session_config()));

    let (connector, _acceptor, worker) = MuxBuilder::client().with_connection(client_io).build();
    tokio::spawn(worker);

    // First stream sends an undecryptable metadata record and dies.
    let mut broken = connector.connect().unwrap();
    write_frame(&mut broken, b"not a ciphertext").await.unwrap();

    // The session itself survives; a later stream relays fine.
    let mut healthy = connector.connect().unwrap();
    let reply = timeout(
        Duration::from_secs(10),
        exchange(&mut healthy, target_port, b"still multiplexing"),
    )
    .await
    .unwrap();
    assert_eq!(reply, b"still multiplexing");
}
