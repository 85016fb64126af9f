//! Transport bindings for roomlink.
//!
//! Provides:
//! - WebSocket host for a `Room`, with a remote command endpoint (feature: websocket)
//! - WebSocket `Connector` for the reconnecting client (feature: client)

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "websocket")]
pub use websocket::{WsConnection, WsHost, WsState, create_router};

#[cfg(feature = "client")]
pub use client::WsConnector;
