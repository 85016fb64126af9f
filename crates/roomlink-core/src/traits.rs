//! Seams to the hosting process: connection handles, attachment storage,
//! open-handle enumeration and metadata extraction.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::meta::{Attachment, ConnectionMeta, MetaError};

/// Connection handle identifier.
pub type ConnectionId = Uuid;

/// Per-connection send error.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Connection closed")]
    Closed,
    #[error("Send failed: {0}")]
    Failed(String),
}

/// A live connection handle owned by the host.
///
/// `send` is synchronous: implementations hand the text to a writer task
/// and report only whether that hand-off succeeded.
pub trait Connection: Send + Sync {
    /// Stable identifier of this handle.
    fn id(&self) -> ConnectionId;

    /// Whether the transport is still open.
    fn is_open(&self) -> bool;

    /// Queue a text frame for delivery.
    ///
    /// # Errors
    /// Returns error if the transport is closed or rejects the frame.
    fn send(&self, text: &str) -> Result<(), SendError>;

    /// Close the transport with a close code.
    fn close(&self, code: u16, reason: &str);
}

/// Attachment storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Attachment not found: {0}")]
    NotFound(ConnectionId),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Durable per-handle attachment storage, provided by the host.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Persist (or overwrite) the attachment bound to a handle.
    async fn save(&self, id: ConnectionId, attachment: Attachment) -> Result<(), StorageError>;

    /// Read back the attachment bound to a handle.
    async fn load(&self, id: ConnectionId) -> Result<Option<Attachment>, StorageError>;

    /// Drop the attachment bound to a handle.
    async fn remove(&self, id: ConnectionId) -> Result<(), StorageError>;
}

/// Host view of connections that survived a suspend.
#[async_trait]
pub trait SessionHost: Send + Sync {
    /// Handles the host still reports as open.
    async fn open_connections(&self) -> Vec<Arc<dyn Connection>>;
}

/// Incoming connect request as seen by the metadata extractor.
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    /// Request path.
    pub path: String,
    /// Decoded query parameters.
    pub query: HashMap<String, String>,
    /// Request headers, lowercased names.
    pub headers: HashMap<String, String>,
}

impl ConnectRequest {
    /// Create a request for a path.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Add a query parameter.
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }
}

/// Turns a connect request into validated metadata.
#[async_trait]
pub trait MetaExtractor: Send + Sync {
    /// Extract metadata for a new connection.
    async fn extract(&self, request: &ConnectRequest) -> Result<ConnectionMeta, MetaError>;
}

/// Reads `userId`, `clientId` and comma-separated `channels` from the query
/// string. Remaining parameters become extension fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryMetaExtractor;

#[async_trait]
impl MetaExtractor for QueryMetaExtractor {
    async fn extract(&self, request: &ConnectRequest) -> Result<ConnectionMeta, MetaError> {
        let mut obj = Map::new();
        for (key, value) in &request.query {
            let value = if key == "channels" {
                Value::Array(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|c| !c.is_empty())
                        .map(|c| Value::String(c.to_string()))
                        .collect(),
                )
            } else {
                Value::String(value.clone())
            };
            obj.insert(key.clone(), value);
        }
        ConnectionMeta::from_value(Value::Object(obj))
    }
}
