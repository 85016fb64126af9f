//! Server side of roomlink.
//!
//! This crate provides:
//! - `SessionRegistry` - Live sessions with filtered, self-purging fan-out
//! - `Room` / `RoomDefinition` - Declarative handler table and host upcalls
//! - `Room::restore` - Registry rebuild after a suspend
//! - `RemoteCommand` - Serializable operations for out-of-process callers
//! - Attachment storage backends

pub mod registry;
pub mod remote;
pub mod restore;
pub mod room;
pub mod storage;

#[cfg(test)]
mod testutil;

pub use registry::{BroadcastOptions, Session, SessionRegistry};
pub use remote::{RemoteCommand, RemoteReply};
pub use restore::{RestoreFailure, RestoreReport};
pub use room::{
    Connecting, ErrorReport, ErrorStage, Inbound, Room, RoomDefinition, RoomError, SessionContext,
};

#[cfg(feature = "memory")]
pub use storage::MemoryAttachmentStore;
