//! Room definition and the host upcalls that drive it.
//!
//! A `RoomDefinition` is a declarative table of lifecycle hooks and channel
//! handlers. It is pure data, so a `Room` can be rebuilt from it after a
//! suspend without re-running any imperative registration code.

use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::{FutureExt, future::BoxFuture};
use roomlink_core::{
    Attachment, AttachmentStore, Connection, ConnectionId, ConnectionMeta, ConnectRequest,
    EventRegistry, Frame, MetaError, MetaExtractor, QueryMetaExtractor, SendError, StorageError,
    close_codes,
};
use serde_json::Value;
use thiserror::Error;

use crate::{
    registry::{BroadcastOptions, SessionRegistry},
    restore::RestoreFailure,
};

/// Room operation errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Connect failed; the transport was closed with `CONNECT_REJECTED`.
    #[error("Connection rejected: {0}")]
    Rejected(String),
    /// No registered session for this handle.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Send(#[from] SendError),
}

/// Where an error reported to the error hook came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStage {
    /// Extraction, connect hook or attachment save.
    Connect,
    /// A channel or fallback handler.
    Message,
    /// The disconnect hook.
    Disconnect,
}

/// Passed to the error hook.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    /// Which upcall failed.
    pub stage: ErrorStage,
    /// Handle of the affected transport.
    pub conn_id: ConnectionId,
    /// Best-effort metadata; absent if extraction failed.
    pub meta: Option<ConnectionMeta>,
    /// Rendered error.
    pub error: String,
}

/// Passed to the connect hook.
#[derive(Clone)]
pub struct Connecting {
    /// The transport being admitted.
    pub conn: Arc<dyn Connection>,
    /// Handshake request the metadata was extracted from.
    pub request: ConnectRequest,
    /// Metadata produced by the extractor.
    pub meta: ConnectionMeta,
}

/// Payload delivered to channel handlers.
#[derive(Clone)]
pub struct Inbound {
    /// Sending session.
    pub ctx: SessionContext,
    /// Event payload.
    pub data: Value,
}

pub type ConnectHook =
    Arc<dyn Fn(Connecting) -> BoxFuture<'static, anyhow::Result<ConnectionMeta>> + Send + Sync>;
pub type DisconnectHook = Arc<
    dyn Fn(ConnectionId, Option<ConnectionMeta>) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;
pub type ErrorHook = Arc<dyn Fn(ErrorReport) -> BoxFuture<'static, ()> + Send + Sync>;
pub type RestoreHook = Arc<dyn Fn(usize) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type RestoreErrorHook = Arc<dyn Fn(Vec<RestoreFailure>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type MessageHandler =
    Arc<dyn Fn(SessionContext, Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Declarative room definition.
#[derive(Clone, Default)]
pub struct RoomDefinition {
    name: String,
    on_connect: Option<ConnectHook>,
    on_disconnect: Option<DisconnectHook>,
    on_error: Option<ErrorHook>,
    pub(crate) on_restore: Option<RestoreHook>,
    pub(crate) on_restore_error: Option<RestoreErrorHook>,
    handlers: Vec<(String, MessageHandler)>,
    fallback: Option<MessageHandler>,
}

impl fmt::Debug for RoomDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomDefinition")
            .field("name", &self.name)
            .field(
                "handlers",
                &self.handlers.iter().map(|(c, _)| c).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl RoomDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs after extraction; may replace the metadata or reject the
    /// connection by returning an error.
    #[must_use]
    pub fn on_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Connecting) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ConnectionMeta>> + Send + 'static,
    {
        self.on_connect = Some(Arc::new(move |c| hook(c).boxed()));
        self
    }

    #[must_use]
    pub fn on_disconnect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ConnectionId, Option<ConnectionMeta>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_disconnect = Some(Arc::new(move |id, meta| hook(id, meta).boxed()));
        self
    }

    #[must_use]
    pub fn on_error<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ErrorReport) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_error = Some(Arc::new(move |r| hook(r).boxed()));
        self
    }

    /// Runs after a restore that recovered at least one session.
    #[must_use]
    pub fn on_restore<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_restore = Some(Arc::new(move |n| hook(n).boxed()));
        self
    }

    #[must_use]
    pub fn on_restore_error<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Vec<RestoreFailure>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_restore_error = Some(Arc::new(move |f| hook(f).boxed()));
        self
    }

    /// Handle events on `channel`.
    #[must_use]
    pub fn handle<F, Fut>(mut self, channel: impl Into<String>, handler: F) -> Self
    where
        F: Fn(SessionContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers
            .push((channel.into(), Arc::new(move |ctx, data| handler(ctx, data).boxed())));
        self
    }

    /// Handle events on channels without a dedicated handler.
    #[must_use]
    pub fn fallback<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(SessionContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.fallback = Some(Arc::new(move |ctx, data| handler(ctx, data).boxed()));
        self
    }
}

pub(crate) struct RoomInner {
    pub(crate) definition: RoomDefinition,
    pub(crate) store: Arc<dyn AttachmentStore>,
    extractor: Arc<dyn MetaExtractor>,
    handlers: EventRegistry<Inbound>,
    registry: Mutex<SessionRegistry>,
    // Serializes metadata mutation with its persistence.
    persist: tokio::sync::Mutex<()>,
}

/// A live room bound to one process instance.
#[derive(Clone)]
pub struct Room {
    pub(crate) inner: Arc<RoomInner>,
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.inner.definition.name)
            .field("sessions", &self.session_count())
            .finish()
    }
}

impl Room {
    /// Build a room that reads identity from the query string.
    #[must_use]
    pub fn new(definition: RoomDefinition, store: Arc<dyn AttachmentStore>) -> Self {
        Self::with_extractor(definition, store, Arc::new(QueryMetaExtractor))
    }

    #[must_use]
    pub fn with_extractor(
        definition: RoomDefinition,
        store: Arc<dyn AttachmentStore>,
        extractor: Arc<dyn MetaExtractor>,
    ) -> Self {
        let handlers = EventRegistry::new();
        for (channel, handler) in &definition.handlers {
            let handler = Arc::clone(handler);
            handlers.on(channel.clone(), move |inbound: Inbound| {
                handler(inbound.ctx, inbound.data)
            });
        }

        Self {
            inner: Arc::new(RoomInner {
                definition,
                store,
                extractor,
                handlers,
                registry: Mutex::new(SessionRegistry::new()),
                persist: tokio::sync::Mutex::new(()),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.definition.name
    }

    /// A fresh instance from the same definition and storage with an empty
    /// registry, as after a process resume. Call `restore` on it next.
    #[must_use]
    pub fn rebuild(&self) -> Self {
        Self::with_extractor(
            self.inner.definition.clone(),
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.extractor),
        )
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, SessionRegistry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // --- host upcalls ---

    /// A transport finished its handshake.
    ///
    /// Extracts metadata, runs the connect hook, persists the attachment and
    /// registers the session. Any failure routes to the error hook and closes
    /// the transport with `CONNECT_REJECTED`; the session is never registered.
    ///
    /// # Errors
    /// Returns the rejection cause.
    pub async fn on_connect(
        &self,
        conn: Arc<dyn Connection>,
        request: ConnectRequest,
    ) -> Result<(), RoomError> {
        let id = conn.id();

        let meta = match self.inner.extractor.extract(&request).await {
            Ok(meta) => meta,
            Err(e) => return Err(self.reject(&conn, None, e.to_string()).await),
        };

        let meta = match &self.inner.definition.on_connect {
            Some(hook) => {
                let connecting = Connecting {
                    conn: Arc::clone(&conn),
                    request,
                    meta: meta.clone(),
                };
                match AssertUnwindSafe(hook(connecting)).catch_unwind().await {
                    Ok(Ok(meta)) => meta,
                    Ok(Err(e)) => return Err(self.reject(&conn, Some(meta), e.to_string()).await),
                    Err(_) => {
                        return Err(self
                            .reject(&conn, Some(meta), "connect hook panicked".into())
                            .await);
                    }
                }
            }
            None => meta,
        };
        if let Err(e) = meta.validate() {
            return Err(self.reject(&conn, Some(meta), e.to_string()).await);
        }

        let persisted = match Attachment::from_meta(&meta) {
            Ok(attachment) => self
                .inner
                .store
                .save(id, attachment)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = persisted {
            return Err(self.reject(&conn, Some(meta), e).await);
        }

        tracing::info!(
            room = %self.name(),
            conn_id = %id,
            user_id = %meta.user_id,
            client_id = %meta.client_id,
            "Session connected"
        );
        self.registry().register(conn, meta);
        Ok(())
    }

    /// A text (or binary) frame arrived on a registered transport.
    pub async fn on_message(&self, id: ConnectionId, raw: &[u8]) {
        match Frame::decode(raw) {
            Frame::Invalid => {
                tracing::debug!(conn_id = %id, "Skipping invalid frame");
            }
            Frame::Pong => {}
            Frame::Ping => {
                let conn = self.registry().get(id).map(|s| Arc::clone(&s.conn));
                if let Some(conn) = conn {
                    if let Ok(text) = Frame::Pong.encode() {
                        if let Err(e) = conn.send(&text) {
                            tracing::debug!(conn_id = %id, error = %e, "Pong not delivered");
                        }
                    }
                }
            }
            Frame::Event { channel, data } => self.dispatch(id, channel, data).await,
        }
    }

    /// The transport closed.
    ///
    /// Unregisters the session and drops its attachment. Idempotent.
    pub async fn on_disconnect(&self, id: ConnectionId) {
        let removed = {
            let _guard = self.inner.persist.lock().await;
            let removed = self.registry().unregister(id);
            if let Err(e) = self.inner.store.remove(id).await {
                tracing::warn!(conn_id = %id, error = %e, "Failed to remove attachment");
            }
            removed
        };

        let meta = removed.map(|s| s.meta);
        if meta.is_some() {
            tracing::info!(room = %self.name(), conn_id = %id, "Session disconnected");
        }

        if let Some(hook) = &self.inner.definition.on_disconnect {
            let result = AssertUnwindSafe(hook(id, meta.clone())).catch_unwind().await;
            let error = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("disconnect hook panicked".to_string()),
            };
            if let Some(error) = error {
                self.report(ErrorStage::Disconnect, id, meta, error).await;
            }
        }
    }

    // --- server-side API ---

    /// Send to every subscriber of `channel` admitted by `opts`.
    pub fn broadcast(&self, channel: &str, data: &Value, opts: &BroadcastOptions) -> usize {
        self.registry().broadcast(channel, data, opts)
    }

    pub fn send_to_user(&self, user_id: &str, channel: &str, data: &Value) -> usize {
        self.registry().send_to_user(user_id, channel, data)
    }

    pub fn sweep_stale(&self) -> usize {
        self.registry().sweep_stale()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.registry().len()
    }

    #[must_use]
    pub fn user_ids(&self) -> Vec<String> {
        self.registry().user_ids()
    }

    #[must_use]
    pub fn connections_for_user(&self, user_id: &str) -> Vec<Arc<dyn Connection>> {
        self.registry().connections_for_user(user_id)
    }

    #[must_use]
    pub fn meta(&self, id: ConnectionId) -> Option<ConnectionMeta> {
        self.registry().get(id).map(|s| s.meta.clone())
    }

    /// Mutate a session's metadata and persist the new attachment.
    ///
    /// # Errors
    /// Returns error if the session is unknown or persistence fails.
    pub async fn update_meta<R>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut ConnectionMeta) -> R,
    ) -> Result<R, RoomError> {
        let _guard = self.inner.persist.lock().await;
        let (result, snapshot) = {
            let mut registry = self.registry();
            let meta = registry
                .meta_mut(id)
                .ok_or(RoomError::UnknownConnection(id))?;
            let result = f(meta);
            (result, meta.clone())
        };
        self.inner
            .store
            .save(id, Attachment::from_meta(&snapshot)?)
            .await?;
        Ok(result)
    }

    /// Subscribe a session to a channel. Returns whether it was newly added.
    ///
    /// # Errors
    /// Returns error if the session is unknown or persistence fails.
    pub async fn join(&self, id: ConnectionId, channel: &str) -> Result<bool, RoomError> {
        self.update_meta(id, |meta| meta.join(channel)).await
    }

    /// Unsubscribe a session from a channel.
    ///
    /// # Errors
    /// Returns error if the session is unknown or persistence fails.
    pub async fn leave(&self, id: ConnectionId, channel: &str) -> Result<bool, RoomError> {
        self.update_meta(id, |meta| meta.leave(channel)).await
    }

    async fn dispatch(&self, id: ConnectionId, channel: String, data: Value) {
        let registered = self.registry().get(id).is_some();
        if !registered {
            tracing::debug!(conn_id = %id, channel = %channel, "Event from unregistered connection");
            return;
        }
        let ctx = SessionContext {
            room: self.clone(),
            conn_id: id,
        };

        if self.inner.handlers.has_listeners(&channel) {
            let outcome = self.inner.handlers.emit(&channel, Inbound { ctx, data }).await;
            if outcome.failed > 0 {
                let meta = self.meta(id);
                self.report(
                    ErrorStage::Message,
                    id,
                    meta,
                    format!("{} handler(s) failed on {channel}", outcome.failed),
                )
                .await;
            }
            return;
        }

        match &self.inner.definition.fallback {
            Some(handler) => {
                let result = AssertUnwindSafe(handler(ctx, data)).catch_unwind().await;
                let error = match result {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some("fallback handler panicked".to_string()),
                };
                if let Some(error) = error {
                    tracing::warn!(conn_id = %id, channel = %channel, error = %error, "Fallback handler failed");
                    let meta = self.meta(id);
                    self.report(ErrorStage::Message, id, meta, error).await;
                }
            }
            None => tracing::debug!(conn_id = %id, channel = %channel, "No handler for channel"),
        }
    }

    async fn reject(
        &self,
        conn: &Arc<dyn Connection>,
        meta: Option<ConnectionMeta>,
        error: String,
    ) -> RoomError {
        let id = conn.id();
        tracing::warn!(room = %self.name(), conn_id = %id, error = %error, "Connection rejected");
        self.report(ErrorStage::Connect, id, meta, error.clone()).await;
        conn.close(close_codes::CONNECT_REJECTED, "connect rejected");
        RoomError::Rejected(error)
    }

    async fn report(
        &self,
        stage: ErrorStage,
        conn_id: ConnectionId,
        meta: Option<ConnectionMeta>,
        error: String,
    ) {
        let Some(hook) = &self.inner.definition.on_error else {
            return;
        };
        let report = ErrorReport {
            stage,
            conn_id,
            meta,
            error,
        };
        if AssertUnwindSafe(hook(report)).catch_unwind().await.is_err() {
            tracing::error!(conn_id = %conn_id, "Error hook panicked");
        }
    }
}

/// Per-message view of the sending session.
#[derive(Clone)]
pub struct SessionContext {
    room: Room,
    conn_id: ConnectionId,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("conn_id", &self.conn_id)
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.conn_id
    }

    #[must_use]
    pub const fn room(&self) -> &Room {
        &self.room
    }

    /// Current metadata, if the session is still registered.
    #[must_use]
    pub fn meta(&self) -> Option<ConnectionMeta> {
        self.room.meta(self.conn_id)
    }

    /// Send an event to this session only.
    ///
    /// # Errors
    /// Returns error if the session is gone or the send fails.
    pub fn emit(&self, channel: &str, data: Value) -> Result<(), RoomError> {
        let conn = self
            .room
            .registry()
            .get(self.conn_id)
            .map(|s| Arc::clone(&s.conn))
            .ok_or(RoomError::UnknownConnection(self.conn_id))?;
        let text = Frame::event(channel, data)
            .encode()
            .map_err(|e| SendError::Failed(e.to_string()))?;
        conn.send(&text)?;
        Ok(())
    }

    /// Broadcast to every other subscriber of `channel`.
    pub fn broadcast(&self, channel: &str, data: &Value) -> usize {
        self.room.broadcast(
            channel,
            data,
            &BroadcastOptions::default().except(self.conn_id),
        )
    }

    /// # Errors
    /// Returns error if persistence fails.
    pub async fn join(&self, channel: &str) -> Result<bool, RoomError> {
        self.room.join(self.conn_id, channel).await
    }

    /// # Errors
    /// Returns error if persistence fails.
    pub async fn leave(&self, channel: &str) -> Result<bool, RoomError> {
        self.room.leave(self.conn_id, channel).await
    }

    /// Set an extension field and persist it.
    ///
    /// # Errors
    /// Returns error if `key` is `userId`, `clientId` or `channels`, or if
    /// persistence fails.
    pub async fn set_extra(&self, key: &str, value: Value) -> Result<(), RoomError> {
        self.room
            .update_meta(self.conn_id, |meta| meta.set_extra(key, value))
            .await??;
        Ok(())
    }
}
