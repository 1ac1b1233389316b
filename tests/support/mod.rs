//! Loopback servers and relay builders shared by the integration tests

#![allow(dead_code)]

use netjitter::distribution::Distribution;
use netjitter::relay::{DelayPolicy, DuplexRelay, RelayConfig};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Echo every connection back to its sender, forever
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

/// Accept one connection and record when each read completed and how many
/// bytes it returned, until the peer closes
pub async fn spawn_sink() -> (SocketAddr, JoinHandle<Vec<(Instant, Vec<u8>)>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut arrivals = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => arrivals.push((Instant::now(), buf[..n].to_vec())),
            }
        }
        arrivals
    });

    (addr, handle)
}

/// Accept one connection, write `payload` to it and close
pub async fn spawn_source(payload: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(&payload).await.unwrap();
        stream.shutdown().await.unwrap();
    });

    addr
}

/// An address nothing listens on
pub fn unused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub fn relay_to(connect_addr: SocketAddr, chunk_size: usize, delay: Distribution) -> DuplexRelay {
    DuplexRelay::new(
        RelayConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            connect_addr,
            chunk_size,
            DelayPolicy::shared(delay),
        )
        .unwrap(),
    )
}

pub fn no_delay() -> Distribution {
    Distribution::constant(0.0).unwrap()
}

/// Deterministic, non-repeating-looking payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Read until the peer closes; a reset counts as closed
pub async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return received,
            Ok(n) => received.extend_from_slice(&buf[..n]),
        }
    }
}

/// Poll `check` until it holds or the test timeout expires
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
