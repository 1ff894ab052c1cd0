//! Real-time synchronization layer for interactive live-drama rooms.
//!
//! A streamer and any number of viewers share a room through a relay. Each
//! side runs a [`channel::ChannelClient`] that keeps one reconnecting
//! WebSocket per room and role, decodes frames into typed [`envelope::Event`]s
//! and fans them out through a [`dispatcher::Dispatcher`]. The streamer's
//! [`session::StreamerSession`] drives the [`narrative::NarrativeMachine`] and
//! runs audience votes with the [`vote::VoteCoordinator`]; each
//! [`session::ViewerSession`] mirrors the room into local state.

pub mod channel;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod narrative;
pub mod presence;
pub mod relay;
pub mod session;
pub mod story;
pub mod vote;

pub use channel::{ChannelClient, ChannelOptions, ChannelStatus, ConnectionState, ReconnectPolicy, WsConnector};
pub use config::SyncConfig;
pub use dispatcher::{Dispatcher, Subscription};
pub use envelope::{Envelope, Event, EventKind, PeerRole};
pub use error::{Result, SyncError};
pub use session::{StreamerSession, ViewerSession};
