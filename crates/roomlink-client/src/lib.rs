//! Reconnecting realtime client.
//!
//! Provides:
//! - `Client` - Connection state machine with backoff and connect-attempt ids
//! - `MessageQueue` - Bounded outbound buffer flushed on reconnect
//! - `Keepalive` - Ping/pong liveness with foreground resync
//! - `Connector` - Transport seam (see `roomlink-transport` for WebSocket)

pub mod config;
pub mod connection;
pub mod keepalive;
pub mod queue;
pub mod transport;

pub use config::{Backoff, ClientOptions, ReconnectionPolicy};
pub use connection::{Client, ClientBuilder, ClientError, ClientNotice, ConnectionState, Delivery, notices};
pub use keepalive::{Keepalive, KeepaliveAction, Visibility};
pub use queue::{MessageQueue, QueuedMessage};
pub use transport::{ConnectError, Connector, Link, LinkEvent, Outbound};
