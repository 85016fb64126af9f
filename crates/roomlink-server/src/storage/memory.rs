//! In-memory attachment storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use roomlink_core::{Attachment, AttachmentStore, ConnectionId, StorageError};

/// In-memory attachment store.
///
/// Useful for development and tests. Survives room rebuilds within one
/// process, not restarts.
#[derive(Default)]
pub struct MemoryAttachmentStore {
    attachments: RwLock<HashMap<ConnectionId, Attachment>>,
}

impl MemoryAttachmentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite an attachment with raw text, bypassing serialization.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn put_raw(&self, id: ConnectionId, raw: impl Into<String>) -> Result<(), StorageError> {
        self.attachments
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .insert(id, Attachment::from_raw(raw));
        Ok(())
    }

    /// Number of stored attachments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attachments.read().map(|m| m.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AttachmentStore for MemoryAttachmentStore {
    async fn save(&self, id: ConnectionId, attachment: Attachment) -> Result<(), StorageError> {
        self.attachments
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .insert(id, attachment);
        Ok(())
    }

    async fn load(&self, id: ConnectionId) -> Result<Option<Attachment>, StorageError> {
        Ok(self
            .attachments
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(&id)
            .cloned())
    }

    async fn remove(&self, id: ConnectionId) -> Result<(), StorageError> {
        self.attachments
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use roomlink_core::ConnectionMeta;
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn test_save_load_remove() {
        let store = MemoryAttachmentStore::new();
        let id = Uuid::new_v4();
        let meta = ConnectionMeta::new("u1", "c1").with_channels(["a"]);

        store
            .save(id, Attachment::from_meta(&meta).unwrap())
            .await
            .unwrap();
        let loaded = store.load(id).await.unwrap().unwrap();
        assert_eq!(loaded.to_meta().unwrap(), meta);

        store.remove(id).await.unwrap();
        assert!(store.load(id).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_put_raw_keeps_text() {
        let store = MemoryAttachmentStore::new();
        let id = Uuid::new_v4();
        store.put_raw(id, "{broken").unwrap();
        let loaded = tokio_test::block_on(store.load(id)).unwrap().unwrap();
        assert_eq!(loaded.as_str(), "{broken");
        assert!(loaded.to_meta().is_err());
    }
}
