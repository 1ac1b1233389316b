//! End-to-end relay tests over loopback sockets
//!
//! Run with: cargo test --test relay_tests -- --nocapture

#[path = "support/mod.rs"]
mod support;

use netjitter::distribution::Distribution;
use netjitter::relay::{
    event_channel, CloseReason, DelayPolicy, Direction, DuplexRelay, RelayConfig, RelayEvent,
    RelayState,
};
use std::time::{Duration, Instant};
use support::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

async fn echo_roundtrip(chunk_size: usize, len: usize) {
    let echo = spawn_echo_server().await;
    let relay = relay_to(echo, chunk_size, no_delay());
    let addr = relay.start().await.unwrap();

    let data = payload(len);
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();

    let expected = data.clone();
    let writer_task = tokio::spawn(async move {
        writer.write_all(&data).await.unwrap();
        writer
    });

    let mut received = vec![0u8; len];
    timeout(TEST_TIMEOUT, reader.read_exact(&mut received))
        .await
        .expect("echo timed out")
        .unwrap();
    let _writer = writer_task.await.unwrap();

    assert_eq!(received, expected, "corrupted with chunk_size {chunk_size}");

    // Counters are bumped after each write completes
    eventually(|| relay.stats().bytes_upstream == len as u64).await;
    let min_chunks = (len as u64).div_ceil(chunk_size as u64);
    assert!(relay.stats().chunks_upstream >= min_chunks);

    relay.stop();
    timeout(TEST_TIMEOUT, relay.join()).await.unwrap();
}

#[tokio::test]
async fn test_roundtrip_across_chunk_sizes() {
    for chunk_size in [1, 7, 64, 4096, 65536] {
        let len = if chunk_size == 1 { 2_000 } else { 100_000 };
        echo_roundtrip(chunk_size, len).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients_are_isolated() {
    let echo = spawn_echo_server().await;
    let relay = relay_to(echo, 256, no_delay());
    let addr = relay.start().await.unwrap();

    let clients: Vec<_> = (0..8)
        .map(|i| {
            tokio::spawn(async move {
                let data: Vec<u8> = payload(10_000).into_iter().map(|b| b ^ i as u8).collect();
                let stream = TcpStream::connect(addr).await.unwrap();
                let (mut reader, mut writer) = stream.into_split();

                let sent = data.clone();
                let writer_task = tokio::spawn(async move {
                    writer.write_all(&sent).await.unwrap();
                    writer
                });

                let mut received = vec![0u8; data.len()];
                reader.read_exact(&mut received).await.unwrap();
                let _writer = writer_task.await.unwrap();
                received == data
            })
        })
        .collect();

    for client in clients {
        assert!(timeout(TEST_TIMEOUT, client).await.unwrap().unwrap());
    }
    assert_eq!(relay.stats().connections_accepted, 8);

    relay.stop();
    timeout(TEST_TIMEOUT, relay.join()).await.unwrap();
    assert_eq!(relay.active_connections(), 0);
}

#[tokio::test]
async fn test_delay_between_chunks() {
    let (sink, arrivals) = spawn_sink().await;
    let relay = relay_to(sink, 8, Distribution::constant(0.01).unwrap());
    let addr = relay.start().await.unwrap();

    let data = payload(100);
    let started = Instant::now();
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&data).await.unwrap();
    drop(client);

    let arrivals = timeout(TEST_TIMEOUT, arrivals).await.unwrap().unwrap();
    let received: Vec<u8> = arrivals.iter().flat_map(|(_, bytes)| bytes.clone()).collect();
    assert_eq!(received, data);

    // 13 chunks of at most 8 bytes with 10ms after each: the last one leaves
    // the relay at least 12 delays after the first
    let first = arrivals.first().unwrap().0;
    let last = arrivals.last().unwrap().0;
    assert!(last.duration_since(started) >= Duration::from_millis(120));
    assert!(last.duration_since(first) >= Duration::from_millis(90));

    let stats = relay.stats();
    assert!(stats.chunks_upstream >= 13);
    assert!(stats.total_delay >= Duration::from_millis(130));

    relay.stop();
    timeout(TEST_TIMEOUT, relay.join()).await.unwrap();
}

#[tokio::test]
async fn test_stop_interrupts_long_delays() {
    let echo = spawn_echo_server().await;
    let relay = relay_to(echo, 16, Distribution::constant(30.0).unwrap());
    let addr = relay.start().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(TEST_TIMEOUT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(relay.active_connections(), 1);

    // Both pumps are now sleeping for 30 seconds
    let stopping = Instant::now();
    relay.stop();
    timeout(Duration::from_secs(2), relay.join())
        .await
        .expect("join waited out the delay");
    assert!(stopping.elapsed() < Duration::from_secs(2));

    assert_eq!(relay.state(), RelayState::Stopped);
    assert_eq!(relay.active_connections(), 0);
    assert!(read_until_closed(&mut client).await.is_empty());

    // The listener is gone too
    assert!(TcpStream::connect(addr).await.is_err());
}

async fn echo_once(client: &mut TcpStream, message: &[u8]) {
    client.write_all(message).await.unwrap();
    let mut buf = vec![0u8; message.len()];
    timeout(TEST_TIMEOUT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, message);
}

#[tokio::test]
async fn test_relays_are_independent() {
    let echo = spawn_echo_server().await;
    let first = relay_to(echo, 64, no_delay());
    let second = relay_to(echo, 64, no_delay());
    let first_addr = first.start().await.unwrap();
    let second_addr = second.start().await.unwrap();

    // One live connection on each relay
    let mut on_first = TcpStream::connect(first_addr).await.unwrap();
    let mut on_second = TcpStream::connect(second_addr).await.unwrap();
    echo_once(&mut on_first, b"first").await;
    echo_once(&mut on_second, b"before stop").await;
    assert_eq!(second.active_connections(), 1);

    first.stop();
    timeout(TEST_TIMEOUT, first.join()).await.unwrap();
    assert!(TcpStream::connect(first_addr).await.is_err());
    assert!(timeout(TEST_TIMEOUT, read_until_closed(&mut on_first))
        .await
        .unwrap()
        .is_empty());

    // The connection opened before the sibling stopped is untouched
    echo_once(&mut on_second, b"after stop").await;
    assert_eq!(second.state(), RelayState::Listening);
    assert_eq!(second.active_connections(), 1);
    assert_eq!(second.stats().connections_accepted, 1);

    // And the second relay still accepts new clients
    let mut fresh = TcpStream::connect(second_addr).await.unwrap();
    echo_once(&mut fresh, b"new client").await;

    second.stop();
    timeout(TEST_TIMEOUT, second.join()).await.unwrap();
}

#[tokio::test]
async fn test_unreachable_target_closes_client_and_keeps_accepting() {
    let target = unused_addr();
    let (tx, mut rx) = event_channel();
    let relay = relay_to(target, 64, no_delay()).with_events(tx);
    let addr = relay.start().await.unwrap();

    for _ in 0..2 {
        let mut client = TcpStream::connect(addr).await.unwrap();
        let received = timeout(TEST_TIMEOUT, read_until_closed(&mut client))
            .await
            .expect("client was not closed");
        assert!(received.is_empty());
    }

    eventually(|| relay.stats().connect_failures == 2).await;
    assert_eq!(relay.state(), RelayState::Listening);
    assert_eq!(relay.active_connections(), 0);

    relay.stop();
    timeout(TEST_TIMEOUT, relay.join()).await.unwrap();

    let mut failures = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            RelayEvent::ConnectFailed { target: failed, .. } => {
                assert_eq!(failed, target);
                failures += 1;
            }
            RelayEvent::ConnectionOpened { .. } => panic!("nothing should have been relayed"),
            _ => {}
        }
    }
    assert_eq!(failures, 2);
}

#[tokio::test]
async fn test_target_close_ends_connection() {
    let source = spawn_source(b"hello from target".to_vec()).await;
    let (tx, mut rx) = event_channel();
    let relay = relay_to(source, 4, no_delay()).with_events(tx);
    let addr = relay.start().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let received = timeout(TEST_TIMEOUT, read_until_closed(&mut client)).await.unwrap();
    assert_eq!(received, b"hello from target");

    let closed = timeout(TEST_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Some(RelayEvent::ConnectionClosed {
                    reason,
                    bytes_upstream,
                    bytes_downstream,
                    ..
                }) => break (reason, bytes_upstream, bytes_downstream),
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(closed.0, CloseReason::PeerClosed(Direction::Downstream));
    assert_eq!(closed.1, 0);
    assert_eq!(closed.2, 17);

    relay.stop();
    timeout(TEST_TIMEOUT, relay.join()).await.unwrap();
}

#[tokio::test]
async fn test_per_direction_delay() {
    let echo = spawn_echo_server().await;
    let config = RelayConfig::new(
        "127.0.0.1:0".parse().unwrap(),
        echo,
        64,
        DelayPolicy::per_direction(
            Distribution::constant(0.0).unwrap(),
            Distribution::constant(30.0).unwrap(),
        ),
    )
    .unwrap();
    let relay = DuplexRelay::new(config);
    let addr = relay.start().await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"one").await.unwrap();
    let mut buf = [0u8; 3];
    client.read_exact(&mut buf).await.unwrap();

    // Upstream has no delay, so a second message still reaches the target
    // while the downstream pump sleeps
    client.write_all(b"two").await.unwrap();
    eventually(|| relay.stats().bytes_upstream == 6).await;
    assert_eq!(relay.stats().bytes_downstream, 3);

    relay.stop();
    timeout(Duration::from_secs(2), relay.join()).await.unwrap();
}

#[tokio::test]
async fn test_lifecycle_errors() {
    let relay = relay_to(unused_addr(), 64, no_delay());
    relay.start().await.unwrap();
    assert!(relay.start().await.is_err());

    relay.stop();
    relay.stop();
    timeout(TEST_TIMEOUT, relay.join()).await.unwrap();
    timeout(TEST_TIMEOUT, relay.join()).await.unwrap();

    assert!(relay.start().await.is_err());
    assert_eq!(relay.state(), RelayState::Stopped);
}
