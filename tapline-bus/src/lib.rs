//! # tapline-bus: event-sourced group messaging
//!
//! Clients authenticate, create and join conversations, and exchange taps.
//! The server sequences every tap into one ordered log and replays to each
//! connection only what its user may see.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐    JSON over TCP    ┌──────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ TapServer        │
//! │ (per user)  │   one object/tap    │ handler per conn │
//! └──────┬──────┘                     └────────┬─────────┘
//!        │                                     │ submit
//!        ▼                                     ▼
//! ┌─────────────┐                     ┌──────────────────┐
//! │ Data        │                     │ Serializer       │
//! │ (mirror)    │                     │ (single writer)  │
//! └─────────────┘                     └────────┬─────────┘
//!                                              │ commit + wake
//!                                     ┌────────┴─────────┐
//!                                     │ Data (authority) │
//!                                     │ Registry (wakes) │
//!                                     └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: the tap type and its JSON form
//! - [`data`]: log + projection, shared by server and client
//! - [`serializer`]: single-writer commit task
//! - [`replay`]: cursor scan with visibility and invite backfill
//! - [`registry`]: coalesced wake-ups and connection takeover
//! - [`transport`]: streaming JSON codec and socket pumps
//! - [`server`]: TCP server and connection handlers
//! - [`client`]: mirroring client
//! - [`command`]: raw input → actions

pub mod protocol;
pub mod data;
pub mod serializer;
pub mod replay;
pub mod registry;
pub mod transport;
pub mod server;
pub mod client;
pub mod command;

// Re-exports for convenience
pub use protocol::{Event, EventKind, ProtocolError};
pub use data::{Conversation, Data, Message, Sequencing, ValidationError};
pub use serializer::{Serializer, SubmitError};
pub use replay::Cursor;
pub use registry::{ConnectionRegistry, Wake, WakeSignal};
pub use transport::{TapCodec, TransportConfig, TransportError};
pub use server::{ServerConfig, ServerStats, TapServer};
pub use client::{ClientConfig, ClientError, ConnectionState, SyncClient, SyncEvent};
pub use command::Action;
