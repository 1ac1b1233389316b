//! Forwarding pumps
//!
//! A connection is serviced by two pumps, one per direction. Each pump reads a
//! chunk, writes it to the other side, then waits for one sampled delay. The
//! first pump to stop records why and cancels the connection token, which
//! ends the sibling pump. The shared [`ConnectionGuard`] deregisters the
//! connection once both pumps have dropped it.

use crate::distribution::DelayModel;
use crate::metrics::recorder;
use crate::relay::types::{
    send_event, CloseReason, ConnectionId, Direction, RelayCounters, RelayEvent,
};
use bytes::BytesMut;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bookkeeping for one accepted connection, kept in the relay's active set
///
/// Snapshots are returned by [`DuplexRelay::connections`](crate::relay::DuplexRelay::connections).
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub peer: SocketAddr,
    pub accepted_at: Instant,
    pub(crate) token: CancellationToken,
}

impl ConnectionEntry {
    /// Time since the client was accepted
    pub fn age(&self) -> Duration {
        self.accepted_at.elapsed()
    }

    /// Whether the connection is already being torn down
    pub fn is_closing(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Shared by the pumps of one connection; removes the connection from the
/// active set when the last pump lets go of it
pub(crate) struct ConnectionGuard {
    conn_id: ConnectionId,
    peer: SocketAddr,
    relay: String,
    token: CancellationToken,
    connections: Arc<DashMap<ConnectionId, ConnectionEntry>>,
    counters: Arc<RelayCounters>,
    event_tx: Option<mpsc::Sender<RelayEvent>>,
    reason: OnceLock<CloseReason>,
    opened: AtomicBool,
    bytes_upstream: AtomicU64,
    bytes_downstream: AtomicU64,
}

impl ConnectionGuard {
    pub(crate) fn register(
        conn_id: ConnectionId,
        peer: SocketAddr,
        relay: String,
        token: CancellationToken,
        connections: Arc<DashMap<ConnectionId, ConnectionEntry>>,
        counters: Arc<RelayCounters>,
        event_tx: Option<mpsc::Sender<RelayEvent>>,
    ) -> Self {
        connections.insert(
            conn_id,
            ConnectionEntry {
                peer,
                accepted_at: Instant::now(),
                token: token.clone(),
            },
        );

        Self {
            conn_id,
            peer,
            relay,
            token,
            connections,
            counters,
            event_tx,
            reason: OnceLock::new(),
            opened: AtomicBool::new(false),
            bytes_upstream: AtomicU64::new(0),
            bytes_downstream: AtomicU64::new(0),
        }
    }

    pub(crate) fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Mark the connection as relayed; only opened connections report a close
    pub(crate) fn mark_opened(&self) {
        self.opened.store(true, Ordering::SeqCst);
        recorder::record_connection_opened(&self.relay);
        self.emit(RelayEvent::ConnectionOpened {
            conn_id: self.conn_id,
            peer: self.peer,
        });
    }

    /// Tear the connection down. The first reason recorded wins.
    pub(crate) fn close(&self, reason: CloseReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    fn record_chunk(&self, direction: Direction, bytes: usize) {
        let total = match direction {
            Direction::Upstream => &self.bytes_upstream,
            Direction::Downstream => &self.bytes_downstream,
        };
        total.fetch_add(bytes as u64, Ordering::Relaxed);
        self.counters.record_chunk(direction, bytes);
        recorder::record_chunk_forwarded(&self.relay, direction, bytes);
    }

    fn record_delay(&self, delay: Duration) {
        self.counters.record_delay(delay);
        recorder::record_chunk_delay(&self.relay, delay);
    }

    fn emit(&self, event: RelayEvent) {
        send_event(self.event_tx.as_ref(), &self.relay, event);
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connections.remove(&self.conn_id);
        self.token.cancel();

        if !self.opened.load(Ordering::SeqCst) {
            return;
        }

        let reason = self.reason.get().cloned().unwrap_or(CloseReason::Shutdown);
        let bytes_upstream = self.bytes_upstream.load(Ordering::Relaxed);
        let bytes_downstream = self.bytes_downstream.load(Ordering::Relaxed);

        recorder::record_connection_closed(&self.relay);
        tracing::debug!(
            relay = %self.relay,
            conn = self.conn_id,
            peer = %self.peer,
            %reason,
            bytes_upstream,
            bytes_downstream,
            "Connection closed"
        );

        self.emit(RelayEvent::ConnectionClosed {
            conn_id: self.conn_id,
            peer: self.peer,
            reason,
            bytes_upstream,
            bytes_downstream,
        });
    }
}

/// Turn a sampled delay into a sleep duration
///
/// Negative and NaN samples mean no delay; samples too large for a
/// `Duration` saturate.
pub(crate) fn delay_duration(seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
}

/// One direction of a relayed connection
pub(crate) struct Pump {
    pub direction: Direction,
    pub chunk_size: usize,
    pub delay: Arc<dyn DelayModel>,
    pub connection: Arc<ConnectionGuard>,
}

impl Pump {
    /// Forward `src` into `dst` until either side closes, an I/O error
    /// occurs or the connection is cancelled.
    pub(crate) async fn run<R, W>(self, mut src: R, mut dst: W)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let token = self.connection.token().clone();
        let mut buf = BytesMut::zeroed(self.chunk_size);

        let reason = loop {
            let read = tokio::select! {
                biased;
                _ = token.cancelled() => break None,
                read = src.read(&mut buf[..]) => read,
            };

            let n = match read {
                Ok(0) => break Some(CloseReason::PeerClosed(self.direction)),
                Ok(n) => n,
                Err(e) => {
                    break Some(CloseReason::ReadFailed {
                        direction: self.direction,
                        error: e.to_string(),
                    })
                }
            };

            let written = tokio::select! {
                biased;
                _ = token.cancelled() => break None,
                written = dst.write_all(&buf[..n]) => written,
            };

            if let Err(e) = written {
                break Some(CloseReason::WriteFailed {
                    direction: self.direction,
                    error: e.to_string(),
                });
            }

            self.connection.record_chunk(self.direction, n);

            let delay = delay_duration(self.delay.sample());
            self.connection.record_delay(delay);
            tracing::trace!(
                conn = self.connection.conn_id(),
                direction = %self.direction,
                bytes = n,
                delay_ms = delay.as_secs_f64() * 1000.0,
                "Chunk forwarded"
            );

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        };

        if let Some(reason) = reason {
            match &reason {
                CloseReason::ReadFailed { .. } | CloseReason::WriteFailed { .. } => {
                    tracing::debug!(
                        conn = self.connection.conn_id(),
                        peer = %self.connection.peer(),
                        %reason,
                        "Transport error, tearing down connection"
                    );
                }
                _ => {}
            }
            self.connection.close(reason);
        }

        // Sockets close here, before the guard reports the connection closed
        drop(src);
        drop(dst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::Distribution;
    use tokio::io::duplex;
    use tokio::time::timeout;

    fn guard(connections: &Arc<DashMap<ConnectionId, ConnectionEntry>>) -> Arc<ConnectionGuard> {
        let guard = ConnectionGuard::register(
            1,
            "127.0.0.1:5000".parse().unwrap(),
            "127.0.0.1:9000".into(),
            CancellationToken::new(),
            Arc::clone(connections),
            Arc::new(RelayCounters::default()),
            None,
        );
        guard.mark_opened();
        Arc::new(guard)
    }

    fn pump(
        direction: Direction,
        chunk_size: usize,
        delay: f64,
        connection: &Arc<ConnectionGuard>,
    ) -> Pump {
        Pump {
            direction,
            chunk_size,
            delay: Arc::new(Distribution::constant(delay).unwrap()),
            connection: Arc::clone(connection),
        }
    }

    #[test]
    fn test_delay_duration() {
        assert_eq!(delay_duration(-1.0), Duration::ZERO);
        assert_eq!(delay_duration(f64::NAN), Duration::ZERO);
        assert_eq!(delay_duration(0.0), Duration::ZERO);
        assert_eq!(delay_duration(0.25), Duration::from_millis(250));
        assert_eq!(delay_duration(f64::INFINITY), Duration::MAX);
    }

    #[tokio::test]
    async fn test_pump_forwards_in_order_and_closes_on_eof() {
        let connections = Arc::new(DashMap::new());
        let connection = guard(&connections);

        let (mut client, relay_side) = duplex(64);
        let (relay_out, mut target) = duplex(64);

        let forward = pump(Direction::Upstream, 3, 0.0, &connection).run(relay_side, relay_out);
        let handle = tokio::spawn(forward);
        drop(connection);

        let payload: Vec<u8> = (0..50u8).collect();
        client.write_all(&payload).await.unwrap();
        drop(client);

        let mut received = Vec::new();
        timeout(Duration::from_secs(5), target.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        handle.await.unwrap();

        assert_eq!(received, payload);
        assert!(connections.is_empty());
    }

    #[tokio::test]
    async fn test_pump_cancellation_interrupts_delay() {
        let connections = Arc::new(DashMap::new());
        let connection = guard(&connections);
        let token = connection.token().clone();

        let (mut client, relay_side) = duplex(64);
        let (relay_out, mut target) = duplex(64);

        // An hour-long delay: only cancellation can end this pump promptly
        let forward = pump(Direction::Upstream, 16, 3600.0, &connection).run(relay_side, relay_out);
        let handle = tokio::spawn(forward);
        drop(connection);

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        token.cancel();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(connections.is_empty());
    }

    #[tokio::test]
    async fn test_first_close_reason_wins() {
        let connections = Arc::new(DashMap::new());
        let (tx, mut rx) = mpsc::channel(8);
        let connection = ConnectionGuard::register(
            7,
            "127.0.0.1:5000".parse().unwrap(),
            "127.0.0.1:9000".into(),
            CancellationToken::new(),
            Arc::clone(&connections),
            Arc::new(RelayCounters::default()),
            Some(tx),
        );
        connection.mark_opened();
        connection.close(CloseReason::PeerClosed(Direction::Downstream));
        connection.close(CloseReason::Shutdown);
        drop(connection);

        assert!(matches!(
            rx.recv().await,
            Some(RelayEvent::ConnectionOpened { conn_id: 7, .. })
        ));
        match rx.recv().await {
            Some(RelayEvent::ConnectionClosed { reason, .. }) => {
                assert_eq!(reason, CloseReason::PeerClosed(Direction::Downstream));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
