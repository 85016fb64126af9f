//! Client transport seam.
//!
//! A [`Connector`] opens a [`Link`]: a pair of channels to a writer and a
//! reader task owned by the concrete transport.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Instruction for the link writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Text frame.
    Text(String),
    /// Close the link with a code.
    Close { code: u16, reason: String },
}

/// Event reported by the link reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Text frame received.
    Text(String),
    /// Link closed by either side.
    Closed { code: u16, reason: String },
    /// Transport failure; the link is unusable afterward.
    Error(String),
}

/// An open transport link.
#[derive(Debug)]
pub struct Link {
    /// Writer side.
    pub outbound: mpsc::UnboundedSender<Outbound>,
    /// Reader side.
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Connect failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    /// Server unreachable or handshake refused.
    #[error("Connection refused: {0}")]
    Refused(String),
    /// Any other transport failure.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Opens links to a server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a link to `url`.
    async fn connect(&self, url: &str) -> Result<Link, ConnectError>;
}
