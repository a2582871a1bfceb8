//! TCP sync client: the mirror side of a connection.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - A local [`Data`] projection fed by every tap the server forwards
//! - Outbound actions (create conversation, message, invite)
//! - Read accessors for the presentation layer
//!
//! The client never numbers taps. It applies what it receives with
//! [`Sequencing::Accept`], so its projection holds exactly the part of the
//! server log this user may see. Each [`SyncClient::connect`] starts a fresh
//! projection: the server replays from the resume cursor, and folding that
//! replay into an older mirror would duplicate messages.
//!
//! [`SyncEvent`]s are notifications only. They are delivered with
//! `try_send`, so a full or never-taken receiver costs events, not taps.

use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};

use crate::command::Action;
use crate::data::{Data, Message, Sequencing};
use crate::protocol::{Event, EventKind};
use crate::transport::{self, Inbound, Outbound, TransportConfig};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established and auth sent
    Connected,
    /// A tap was applied to the local projection
    Applied(Arc<Event>),
    /// The server refused the session
    ServerError(String),
    /// Connection lost
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Username required")]
    MissingUser,
    #[error("Connect failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("Not connected")]
    NotConnected,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the tap server
    pub server_addr: String,
    pub user: String,
    /// Log index to resume scanning from
    pub resume_from: u64,
    pub outbound_capacity: usize,
    /// Buffered [`SyncEvent`]s awaiting the application
    pub event_capacity: usize,
    pub max_frame_bytes: usize,
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            user: user.into(),
            resume_from: 0,
            outbound_capacity: 64,
            event_capacity: 256,
            max_frame_bytes: transport::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// The sync client.
pub struct SyncClient {
    config: ClientConfig,

    /// Local mirror of the visible log
    data: Arc<RwLock<Data>>,

    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the transport's write pump
    outgoing_tx: Option<Outbound>,

    /// Event receiver for the application. Never required: the mirror keeps
    /// applying taps whether or not anyone drains it.
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by the sync task)
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        Self {
            config,
            data: Arc::new(RwLock::new(Data::new())),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, authenticate, and start mirroring into a fresh projection.
    ///
    /// A sync task left over from an earlier connection keeps its own
    /// projection and state, so it cannot touch the new ones.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.config.user.is_empty() {
            return Err(ClientError::MissingUser);
        }
        self.outgoing_tx = None;
        self.data = Arc::new(RwLock::new(Data::new()));
        self.state = Arc::new(RwLock::new(ConnectionState::Connecting));

        let stream = match TcpStream::connect(&self.config.server_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };

        let transport_config = TransportConfig {
            max_frame_bytes: self.config.max_frame_bytes,
            outbound_capacity: self.config.outbound_capacity,
            ..TransportConfig::default()
        };
        let (inbound, outbound) =
            transport::spawn(stream, self.config.server_addr.clone(), &transport_config);

        let auth = Event::auth(self.config.user.clone(), self.config.resume_from);
        if outbound.send(Arc::new(auth)).await.is_err() {
            *self.state.write().await = ConnectionState::Disconnected;
            return Err(ClientError::NotConnected);
        }
        self.outgoing_tx = Some(outbound);

        *self.state.write().await = ConnectionState::Connected;
        notify(&self.event_tx, &self.config.user, SyncEvent::Connected);
        log::info!("{} connected to {}", self.config.user, self.config.server_addr);

        tokio::spawn(sync(
            inbound,
            self.data.clone(),
            self.state.clone(),
            self.event_tx.clone(),
            self.config.user.clone(),
        ));
        Ok(())
    }

    /// Drop the outbound side; the server closes the session in response.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    /// Send a user action as its outbound tap.
    pub async fn submit(&self, action: Action) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(Arc::new(action.into_event(&self.config.user)))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    pub async fn create_conversation(
        &self,
        title: impl Into<String>,
        participants: Vec<String>,
    ) -> Result<(), ClientError> {
        self.submit(Action::CreateConversation {
            title: title.into(),
            participants,
        })
        .await
    }

    pub async fn send_message(
        &self,
        conversation: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.submit(Action::Message {
            conversation: conversation.into(),
            body: body.into(),
        })
        .await
    }

    pub async fn invite(
        &self,
        conversation: impl Into<String>,
        invitees: Vec<String>,
    ) -> Result<(), ClientError> {
        self.submit(Action::Invite {
            conversation: conversation.into(),
            invitees,
        })
        .await
    }

    /// Translate a line of raw input and send it. Returns whether the line
    /// produced a tap.
    pub async fn submit_line(
        &self,
        line: &str,
        open_conversation: Option<&str>,
    ) -> Result<bool, ClientError> {
        match Action::parse(line, open_conversation) {
            Some(action) => self.submit(action).await.map(|_| true),
            None => Ok(false),
        }
    }

    /// Conversation titles in order.
    pub async fn conversations(&self) -> Vec<String> {
        self.data
            .read()
            .await
            .conversations()
            .map(|c| c.title.clone())
            .collect()
    }

    /// Users known to this client.
    pub async fn users(&self) -> Vec<String> {
        self.data.read().await.users()
    }

    /// Messages of a conversation, empty if it is not visible.
    pub async fn messages(&self, conversation: &str) -> Vec<Message> {
        self.data
            .read()
            .await
            .conversation(conversation)
            .map(|c| c.messages().to_vec())
            .unwrap_or_default()
    }

    pub async fn members(&self, conversation: &str) -> Vec<String> {
        self.data
            .read()
            .await
            .conversation(conversation)
            .map(|c| c.members())
            .unwrap_or_default()
    }

    /// Inbox preview line for a conversation.
    pub async fn last_message(&self, conversation: &str) -> Option<Message> {
        self.data
            .read()
            .await
            .conversation(conversation)
            .and_then(|c| c.last_message().cloned())
    }

    /// Run `f` against the local projection.
    pub async fn read<R>(&self, f: impl FnOnce(&Data) -> R) -> R {
        let data = self.data.read().await;
        f(&data)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn user(&self) -> &str {
        &self.config.user
    }

    pub fn server_addr(&self) -> &str {
        &self.config.server_addr
    }
}

/// Apply every inbound tap to the mirror until the server hangs up.
async fn sync(
    mut inbound: Inbound,
    data: Arc<RwLock<Data>>,
    state: Arc<RwLock<ConnectionState>>,
    event_tx: mpsc::Sender<SyncEvent>,
    user: String,
) {
    while let Some(event) = inbound.recv().await {
        if event.kind == EventKind::Error {
            log::warn!("Server refused {user}: {}", event.value);
            notify(&event_tx, &user, SyncEvent::ServerError(event.value));
            continue;
        }

        let applied = data.write().await.apply(event, Sequencing::Accept);
        match applied {
            Ok(event) => {
                notify(&event_tx, &user, SyncEvent::Applied(event));
            }
            Err(e) => log::debug!("{user} ignored tap: {e}"),
        }
    }

    *state.write().await = ConnectionState::Disconnected;
    notify(&event_tx, &user, SyncEvent::Disconnected);
    log::info!("{user} disconnected");
}

/// Hand `event` to the application without ever waiting on it.
fn notify(event_tx: &mpsc::Sender<SyncEvent>, user: &str, event: SyncEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            log::warn!("Event queue for {user} is full, dropping {event:?}");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            log::trace!("Event receiver for {user} is gone");
        }
    }
}
