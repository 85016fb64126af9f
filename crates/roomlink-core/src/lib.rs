//! Core building blocks shared by the roomlink client and server.
//!
//! This crate provides:
//! - `Frame` - Wire protocol codec (decode never fails)
//! - `ConnectionMeta` / `Attachment` - Session identity and its durable snapshot
//! - `EventRegistry` - Named event fan-out with per-handler isolation
//! - Host seams: `Connection`, `AttachmentStore`, `SessionHost`, `MetaExtractor`

pub mod events;
pub mod meta;
pub mod protocol;
pub mod traits;

pub use events::{EmitOutcome, EventRegistry, ListenerId};
pub use meta::{Attachment, ConnectionMeta, MetaError};
pub use protocol::{Frame, ProtocolError, close_codes};
pub use traits::{
    AttachmentStore, Connection, ConnectionId, ConnectRequest, MetaExtractor, QueryMetaExtractor,
    SendError, SessionHost, StorageError,
};
