//! TCP tap server: one handler per socket, one serializer per server.
//!
//! Architecture:
//! ```text
//! Client A ── transport ── handler(A) ──┐                ┌── wake(A) ──► handler(A) ── scan ──► A
//!                                       ├─► Serializer ──┤
//! Client B ── transport ── handler(B) ──┘       │        └── wake(B) ──► handler(B) ── scan ──► B
//!                                               ▼
//!                                      Data (log + projection)
//! ```
//!
//! Handler state machine: `AwaitingAuth → Active → Closed`.
//!
//! - AwaitingAuth: the first tap must be `auth` with a user, otherwise an
//!   `error` tap is written and the connection dropped.
//! - Active: inbound taps are stamped with the authenticated user and queued
//!   on the serializer; wake-ups trigger a scan from the cursor.
//! - Closed: on end of stream, serializer shutdown, or takeover by a newer
//!   connection for the same user. A displaced handler writes nothing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

use crate::data::Data;
use crate::protocol::{Event, EventKind, ProtocolError};
use crate::registry::{ConnectionRegistry, Wake, WakeSignal};
use crate::replay::Cursor;
use crate::serializer::{Serializer, SubmitError};
use crate::transport::{self, Inbound, Outbound, TransportConfig, TransportError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Serializer intake queue capacity; submitters wait when it is full
    pub intake_capacity: usize,
    /// Taps buffered per connection on their way to the socket
    pub outbound_capacity: usize,
    /// Largest accepted tap, in encoded bytes
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            intake_capacity: 100,
            outbound_capacity: 256,
            max_frame_bytes: transport::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ServerConfig {
    fn transport(&self) -> TransportConfig {
        TransportConfig {
            max_frame_bytes: self.max_frame_bytes,
            outbound_capacity: self.outbound_capacity,
            ..TransportConfig::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub committed_events: u64,
    pub rejected_events: u64,
    pub takeovers: u64,
}

#[derive(Debug, Default)]
struct ConnectionCounters {
    total: AtomicU64,
    active: AtomicU64,
}

/// Everything a connection handler needs, cloned into each task.
#[derive(Clone)]
struct Hub {
    data: Arc<RwLock<Data>>,
    registry: Arc<ConnectionRegistry>,
    serializer: Serializer,
    counters: Arc<ConnectionCounters>,
    transport: TransportConfig,
}

/// The tap server.
pub struct TapServer {
    config: ServerConfig,
    hub: Hub,
}

impl TapServer {
    /// Create a server and start its serializer task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let data = Arc::new(RwLock::new(Data::new()));
        let registry = Arc::new(ConnectionRegistry::new());
        let serializer = Serializer::spawn(data.clone(), registry.clone(), config.intake_capacity);
        let hub = Hub {
            data,
            registry,
            serializer,
            counters: Arc::new(ConnectionCounters::default()),
            transport: config.transport(),
        };
        Self { config, hub }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), TransportError> {
        log::info!("Tap server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, hub).await {
                    log::warn!("Connection from {addr} rejected: {e}");
                }
            });
        }
    }

    /// Queue a tap on the serializer, bypassing any connection.
    pub async fn submit(&self, event: Event) -> Result<(), SubmitError> {
        self.hub.serializer.submit(event).await
    }

    /// Run `f` against the current projection.
    pub async fn read<R>(&self, f: impl FnOnce(&Data) -> R) -> R {
        let data = self.hub.data.read().await;
        f(&data)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.hub.registry
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        let commits = self.hub.serializer.stats();
        ServerStats {
            total_connections: self.hub.counters.total.load(Ordering::Relaxed),
            active_connections: self.hub.counters.active.load(Ordering::Relaxed),
            committed_events: commits.committed(),
            rejected_events: commits.rejected(),
            takeovers: self.hub.registry.takeovers(),
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Handle a single TCP connection from bootstrap to close.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Hub,
) -> Result<(), ProtocolError> {
    let (mut inbound, outbound) = transport::spawn(stream, addr.to_string(), &hub.transport);

    let Some(auth) = inbound.recv().await else {
        log::debug!("{addr} closed before authenticating");
        return Ok(());
    };
    if auth.kind != EventKind::Auth || auth.user.is_empty() {
        let reply = Event::error(ProtocolError::BadBootstrap.to_string());
        if outbound.send(Arc::new(reply)).await.is_err() {
            log::debug!("Could not send bootstrap error to {addr}: connection already closed");
        }
        return Err(ProtocolError::BadBootstrap);
    }

    let user = auth.user.clone();
    let cursor = Cursor::new(user.clone(), auth.resume_cursor());
    let signal = WakeSignal::new(user.clone());
    hub.registry.install(signal.clone()).await;

    hub.counters.total.fetch_add(1, Ordering::Relaxed);
    hub.counters.active.fetch_add(1, Ordering::Relaxed);
    log::info!(
        "{user} connected from {addr} (session {}, cursor {})",
        signal.session(),
        cursor.position()
    );

    let mut session = Session {
        user,
        addr,
        cursor,
        signal: signal.clone(),
        inbound,
        outbound,
        hub: hub.clone(),
    };
    session.run(auth).await;

    hub.registry.remove_if_current(&signal).await;
    hub.counters.active.fetch_sub(1, Ordering::Relaxed);
    Ok(())
}

/// An authenticated connection.
struct Session {
    user: String,
    addr: SocketAddr,
    cursor: Cursor,
    signal: Arc<WakeSignal>,
    inbound: Inbound,
    outbound: Outbound,
    hub: Hub,
}

impl Session {
    async fn run(&mut self, mut auth: Event) {
        // Announce the session to everyone, then catch up.
        auth.sequence_id = 0;
        if self.hub.serializer.submit(auth).await.is_err() {
            return;
        }
        self.signal.wake();

        loop {
            tokio::select! {
                event = self.inbound.recv() => match event {
                    Some(event) => {
                        if !self.relay(event).await {
                            break;
                        }
                    }
                    None => {
                        log::info!("{} disconnected ({})", self.user, self.addr);
                        break;
                    }
                },
                wake = self.signal.wait() => match wake {
                    Wake::Scan => {
                        if !self.catch_up().await {
                            break;
                        }
                    }
                    Wake::Displaced => {
                        log::info!(
                            "Session {} for {} displaced, closing {}",
                            self.signal.session(),
                            self.user,
                            self.addr
                        );
                        break;
                    }
                },
            }
        }
    }

    /// Queue a client tap under the authenticated identity.
    async fn relay(&self, mut event: Event) -> bool {
        event.user = self.user.clone();
        event.sequence_id = 0;
        log::debug!("{} submitted {}", self.user, event.kind);
        self.hub.serializer.submit(event).await.is_ok()
    }

    /// Forward everything visible between the cursor and the end of the log.
    async fn catch_up(&mut self) -> bool {
        let batch = {
            let data = self.hub.data.read().await;
            self.cursor.advance(&data)
        };

        for event in batch {
            log::debug!("Sending {event} to {}", self.user);
            if self.outbound.send(event).await.is_err() {
                log::debug!("Outbound for {} closed", self.user);
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout, Duration};

    async fn start() -> (Arc<TapServer>, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = Arc::new(TapServer::with_defaults());
        let serving = server.clone();
        tokio::spawn(async move {
            serving.serve(listener).await.unwrap();
        });
        (server, addr)
    }

    async fn login(addr: &str, user: &str) -> (Inbound, Outbound) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (inbound, outbound) = transport::spawn(stream, user, &TransportConfig::default());
        outbound.send(Arc::new(Event::auth(user, 0))).await.unwrap();
        (inbound, outbound)
    }

    async fn recv(inbound: &mut Inbound) -> Event {
        timeout(Duration::from_secs(2), inbound.recv())
            .await
            .expect("timed out waiting for a tap")
            .expect("connection closed")
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.intake_capacity, 100);
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.max_frame_bytes, 64 * 1024);
    }

    #[test]
    fn test_transport_config_follows_server_config() {
        let config = ServerConfig {
            outbound_capacity: 8,
            max_frame_bytes: 1024,
            ..ServerConfig::default()
        };
        let transport = config.transport();
        assert_eq!(transport.outbound_capacity, 8);
        assert_eq!(transport.max_frame_bytes, 1024);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = TapServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert_eq!(server.read(|d| d.len()).await, 0);
        assert!(server.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = TapServer::with_defaults();
        assert_eq!(server.stats(), ServerStats::default());
    }

    #[tokio::test]
    async fn test_direct_submit_commits() {
        let server = TapServer::with_defaults();
        server.submit(Event::auth("sean", 0)).await.unwrap();
        server
            .submit(Event::create_conversation("sean", "bananas", "Hey guys", vec![
                "alex".into(),
                "will".into(),
            ]))
            .await
            .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while server.read(|d| d.len()).await < 2 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let (members, messages) = server
            .read(|d| {
                let c = d.conversation("bananas").unwrap();
                (c.members(), c.messages().len())
            })
            .await;
        assert_eq!(members, vec!["alex", "sean", "will"]);
        assert_eq!(messages, 1);
        assert_eq!(server.stats().committed_events, 2);
    }

    #[tokio::test]
    async fn test_displaced_session_queued_taps_still_commit() {
        let (server, addr) = start().await;

        let (mut first_in, first_out) = login(&addr, "sean").await;
        recv(&mut first_in).await;
        first_out
            .send(Arc::new(Event::create_conversation("sean", "c", "", vec![])))
            .await
            .unwrap();
        recv(&mut first_in).await;
        let first_session = server.registry().session_of("sean").await.unwrap();

        // Holding a read lock keeps the serializer from committing, so the
        // next tap waits on the serializer while the session is replaced.
        let paused = server.hub.data.read().await;
        first_out
            .send(Arc::new(Event::message("sean", "c", "queued")))
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        let (mut second_in, _second_out) = login(&addr, "sean").await;
        timeout(Duration::from_secs(2), async {
            while server.registry().session_of("sean").await == Some(first_session) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("second session never installed");
        drop(paused);

        let mut seen = Vec::new();
        while seen.len() < 4 {
            seen.push(recv(&mut second_in).await);
        }
        let ids: Vec<u64> = seen.iter().map(|e| e.sequence_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(seen[2].value, "queued");
        assert_eq!(seen[3].kind, EventKind::Auth);
        assert_eq!(server.stats().takeovers, 1);
    }
}
