//! Duplex relay implementation
//!
//! A duplex relay listens on one address and connects every accepted client to
//! one target, forwarding both directions through delayed pumps.

use crate::metrics::recorder;
use crate::relay::pump::{ConnectionEntry, ConnectionGuard, Pump};
use crate::relay::types::{
    send_event, ConnectionId, DelayPolicy, Direction, RelayConfig, RelayCounters, RelayError,
    RelayEvent, RelayResult, RelayState, RelayStats, ACCEPT_ERROR_BACKOFF, CONNECT_TIMEOUT,
    LISTEN_BACKLOG, MAX_ACCEPT_ERROR_BACKOFF,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A TCP relay that injects delay between forwarded chunks
pub struct DuplexRelay {
    /// Relay configuration
    config: RelayConfig,

    /// Lifecycle state
    state: Mutex<RelayState>,

    /// Set by the first `start()` call
    start_claimed: AtomicBool,

    /// Bound address once listening
    local_addr: Mutex<Option<SocketAddr>>,

    /// Cancelled by `stop()`; every connection token is a child of it
    shutdown: CancellationToken,

    /// Accept loop and pump tasks
    tasks: TaskTracker,

    /// Connections currently being relayed
    connections: Arc<DashMap<ConnectionId, ConnectionEntry>>,

    /// Relay statistics
    counters: Arc<RelayCounters>,

    /// Event sender for observers
    event_tx: Option<mpsc::Sender<RelayEvent>>,
}

impl DuplexRelay {
    /// Create a relay; nothing is bound until [`start`](Self::start)
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RelayState::Created),
            start_claimed: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            connections: Arc::new(DashMap::new()),
            counters: Arc::new(RelayCounters::default()),
            event_tx: None,
        }
    }

    /// Create with an event channel for monitoring
    ///
    /// The channel is bounded (see [`event_channel`](crate::relay::event_channel)).
    /// When it is full, further events are dropped with a warning and relaying
    /// carries on.
    pub fn with_events(mut self, tx: mpsc::Sender<RelayEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn state(&self) -> RelayState {
        *self.state.lock()
    }

    /// The bound address, once listening. Differs from the configured
    /// address when that used port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Snapshot of the connections currently being relayed, ordered by id
    pub fn connections(&self) -> Vec<(ConnectionId, ConnectionEntry)> {
        let mut entries: Vec<_> = self
            .connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        entries
    }

    pub fn stats(&self) -> RelayStats {
        self.counters.snapshot(self.connections.len())
    }

    /// Bind the listening socket and start accepting clients
    pub async fn start(&self) -> RelayResult<SocketAddr> {
        let listen_addr = self.config.listen_addr;

        if self.state() == RelayState::Stopped {
            return Err(RelayError::Stopped(listen_addr));
        }
        if self.start_claimed.swap(true, Ordering::SeqCst) {
            return Err(RelayError::AlreadyStarted(listen_addr));
        }

        let (listener, local_addr) = match bind_listener(listen_addr) {
            Ok(bound) => bound,
            Err(source) => {
                // Leave the relay startable; the failure was the address, not the relay
                self.start_claimed.store(false, Ordering::SeqCst);
                return Err(RelayError::Bind {
                    addr: listen_addr,
                    source,
                });
            }
        };

        {
            let mut state = self.state.lock();
            if *state == RelayState::Stopped {
                tracing::debug!(relay = %listen_addr, "Relay stopped while starting");
                return Err(RelayError::Stopped(listen_addr));
            }
            *state = RelayState::Listening;
            *self.local_addr.lock() = Some(local_addr);
        }

        let accept_loop = AcceptLoop {
            relay: local_addr.to_string(),
            addr: local_addr,
            connect_addr: self.config.connect_addr,
            chunk_size: self.config.chunk_size,
            delay: self.config.delay.clone(),
            shutdown: self.shutdown.clone(),
            tasks: self.tasks.clone(),
            connections: Arc::clone(&self.connections),
            counters: Arc::clone(&self.counters),
            event_tx: self.event_tx.clone(),
            next_conn_id: 0,
        };
        self.tasks.spawn(accept_loop.run(listener));

        tracing::info!(
            relay = %local_addr,
            target = %self.config.connect_addr,
            chunk_size = self.config.chunk_size,
            delay = %self.config.delay,
            "Relay listening"
        );
        self.emit(RelayEvent::Listening { addr: local_addr });

        Ok(local_addr)
    }

    /// Stop accepting and tear down every active connection
    ///
    /// Idempotent and non-blocking; use [`join`](Self::join) to wait for the
    /// relay's tasks to finish.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), RelayState::Stopped);
        if previous == RelayState::Stopped {
            return;
        }

        self.shutdown.cancel();
        let mut torn_down = 0usize;
        for entry in self.connections.iter() {
            entry.token.cancel();
            torn_down += 1;
        }

        let addr = self.local_addr().unwrap_or(self.config.listen_addr);
        if previous == RelayState::Listening {
            tracing::info!(relay = %addr, active_connections = torn_down, "Relay stopped");
        } else {
            tracing::debug!(relay = %addr, "Relay stopped before it was started");
        }
        self.emit(RelayEvent::Stopped { addr });
    }

    /// Wait until the accept loop and every pump have exited
    pub async fn join(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Emit an event if there's a listener
    fn emit(&self, event: RelayEvent) {
        let addr = self.local_addr().unwrap_or(self.config.listen_addr);
        send_event(self.event_tx.as_ref(), &addr.to_string(), event);
    }
}

impl Drop for DuplexRelay {
    fn drop(&mut self) {
        // Tasks hold clones of the token; make sure they do not outlive the relay
        self.shutdown.cancel();
    }
}

/// Whether an accept error means the listening socket itself is unusable
///
/// Resource exhaustion (EMFILE, ENFILE, ENOBUFS, ENOMEM) and aborted
/// handshakes clear up on their own, so only a broken or invalid listener
/// ends the accept loop.
pub(crate) fn is_fatal_accept_error(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::InvalidInput
        || error.raw_os_error().is_some_and(is_fatal_listener_errno)
}

#[cfg(unix)]
fn is_fatal_listener_errno(code: i32) -> bool {
    matches!(
        code,
        libc::EBADF | libc::ENOTSOCK | libc::EINVAL | libc::EOPNOTSUPP
    )
}

#[cfg(not(unix))]
fn is_fatal_listener_errno(_code: i32) -> bool {
    false
}

/// Back-off before the next accept after `consecutive` failures in a row
fn accept_backoff(consecutive: u32) -> Duration {
    let exponent = consecutive.saturating_sub(1).min(16);
    ACCEPT_ERROR_BACKOFF
        .saturating_mul(1u32 << exponent)
        .min(MAX_ACCEPT_ERROR_BACKOFF)
}

fn bind_listener(addr: SocketAddr) -> io::Result<(TcpListener, SocketAddr)> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let listener = TcpListener::from_std(socket.into())?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}

/// State moved into the accept task
struct AcceptLoop {
    relay: String,
    addr: SocketAddr,
    connect_addr: SocketAddr,
    chunk_size: usize,
    delay: DelayPolicy,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    connections: Arc<DashMap<ConnectionId, ConnectionEntry>>,
    counters: Arc<RelayCounters>,
    event_tx: Option<mpsc::Sender<RelayEvent>>,
    next_conn_id: ConnectionId,
}

impl AcceptLoop {
    async fn run(mut self, listener: TcpListener) {
        let mut consecutive_errors = 0u32;

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((client, peer)) => {
                    consecutive_errors = 0;
                    self.dispatch(client, peer);
                }
                Err(e) if is_fatal_accept_error(&e) => {
                    tracing::error!(
                        relay = %self.relay,
                        error = %e,
                        "Listener is unusable, accept loop exiting"
                    );
                    send_event(
                        self.event_tx.as_ref(),
                        &self.relay,
                        RelayEvent::ListenerFailed {
                            addr: self.addr,
                            error: e.to_string(),
                        },
                    );
                    break;
                }
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let backoff = accept_backoff(consecutive_errors);
                    tracing::warn!(
                        relay = %self.relay,
                        error = %e,
                        consecutive_errors,
                        backoff_ms = backoff.as_millis() as u64,
                        "Accept failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        // Dropping the listener closes the socket
        drop(listener);
        tracing::debug!(relay = %self.relay, "Accept loop exited");
    }

    fn dispatch(&mut self, client: TcpStream, peer: SocketAddr) {
        self.next_conn_id += 1;
        let conn_id = self.next_conn_id;

        self.counters
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        recorder::record_connection_accepted(&self.relay);
        tracing::debug!(relay = %self.relay, conn = conn_id, peer = %peer, "Client accepted");

        let guard = ConnectionGuard::register(
            conn_id,
            peer,
            self.relay.clone(),
            self.shutdown.child_token(),
            Arc::clone(&self.connections),
            Arc::clone(&self.counters),
            self.event_tx.clone(),
        );

        let connect = ConnectTask {
            relay: self.relay.clone(),
            connect_addr: self.connect_addr,
            chunk_size: self.chunk_size,
            delay: self.delay.clone(),
            tasks: self.tasks.clone(),
            counters: Arc::clone(&self.counters),
            event_tx: self.event_tx.clone(),
        };
        self.tasks.spawn(connect.run(client, guard));
    }
}

/// Connects one accepted client to the target and starts its pumps
struct ConnectTask {
    relay: String,
    connect_addr: SocketAddr,
    chunk_size: usize,
    delay: DelayPolicy,
    tasks: TaskTracker,
    counters: Arc<RelayCounters>,
    event_tx: Option<mpsc::Sender<RelayEvent>>,
}

impl ConnectTask {
    async fn run(self, client: TcpStream, guard: ConnectionGuard) {
        let token = guard.token().clone();
        let connect = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.connect_addr));
        let connected = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            connected = connect => connected,
        };

        let upstream = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return self.connect_failed(client, &guard, e.to_string()),
            Err(_) => {
                return self.connect_failed(
                    client,
                    &guard,
                    format!("timed out after {:?}", CONNECT_TIMEOUT),
                )
            }
        };

        for stream in [&client, &upstream] {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(
                    relay = %self.relay,
                    conn = guard.conn_id(),
                    error = %e,
                    "Failed to set TCP_NODELAY"
                );
            }
        }

        tracing::debug!(
            relay = %self.relay,
            conn = guard.conn_id(),
            peer = %guard.peer(),
            target = %self.connect_addr,
            "Connection established"
        );
        guard.mark_opened();

        let guard = Arc::new(guard);
        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();

        let upstream_pump = Pump {
            direction: Direction::Upstream,
            chunk_size: self.chunk_size,
            delay: self.delay.for_direction(Direction::Upstream),
            connection: Arc::clone(&guard),
        };
        let downstream_pump = Pump {
            direction: Direction::Downstream,
            chunk_size: self.chunk_size,
            delay: self.delay.for_direction(Direction::Downstream),
            connection: guard,
        };

        self.tasks.spawn(upstream_pump.run(client_read, upstream_write));
        self.tasks.spawn(downstream_pump.run(upstream_read, client_write));
    }

    fn connect_failed(&self, client: TcpStream, guard: &ConnectionGuard, error: String) {
        // Closing the client is the only signal it gets
        drop(client);

        self.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
        recorder::record_connect_failure(&self.relay);
        tracing::warn!(
            relay = %self.relay,
            conn = guard.conn_id(),
            peer = %guard.peer(),
            target = %self.connect_addr,
            error = %error,
            "Failed to connect to target, closing client"
        );

        send_event(
            self.event_tx.as_ref(),
            &self.relay,
            RelayEvent::ConnectFailed {
                peer: guard.peer(),
                target: self.connect_addr,
                error,
            },
        );
    }
}
