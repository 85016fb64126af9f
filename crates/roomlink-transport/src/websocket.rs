//! WebSocket host for a room.
//!
//! Each upgraded socket becomes a [`WsConnection`] handle. The socket task
//! forwards frames to the room upcalls; a writer task drains the handle's
//! queue so `Connection::send` never blocks.

use std::{
    collections::HashMap,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    http::{HeaderMap, Uri},
    response::IntoResponse,
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use roomlink_core::{Connection, ConnectionId, ConnectRequest, SendError, SessionHost};
use roomlink_server::{RemoteCommand, RemoteReply, RestoreReport, Room};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Server-side handle for one upgraded socket.
pub struct WsConnection {
    id: ConnectionId,
    open: AtomicBool,
    tx: mpsc::UnboundedSender<Message>,
}

impl WsConnection {
    fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            open: AtomicBool::new(true),
            tx,
        }
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl Connection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn send(&self, text: &str) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        self.tx
            .send(Message::Text(text.into()))
            .map_err(|_| SendError::Closed)
    }

    fn close(&self, code: u16, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })));
        }
    }
}

/// Tracks every upgraded socket, registered or not.
#[derive(Default)]
pub struct WsHost {
    sockets: RwLock<HashMap<ConnectionId, Arc<WsConnection>>>,
}

impl WsHost {
    fn insert(&self, conn: Arc<WsConnection>) {
        self.sockets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn.id(), conn);
    }

    fn remove(&self, id: ConnectionId) {
        self.sockets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Number of sockets currently held.
    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.sockets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl SessionHost for WsHost {
    async fn open_connections(&self) -> Vec<Arc<dyn Connection>> {
        self.sockets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| c.is_open())
            .map(|c| Arc::clone(c) as Arc<dyn Connection>)
            .collect()
    }
}

/// Router state: the current room instance and the socket host.
#[derive(Clone)]
pub struct WsState {
    room: Arc<RwLock<Room>>,
    host: Arc<WsHost>,
}

impl WsState {
    #[must_use]
    pub fn new(room: Room) -> Self {
        Self {
            room: Arc::new(RwLock::new(room)),
            host: Arc::new(WsHost::default()),
        }
    }

    /// Current room instance.
    #[must_use]
    pub fn room(&self) -> Room {
        self.room
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn host(&self) -> Arc<WsHost> {
        Arc::clone(&self.host)
    }

    /// Replace the room with a freshly rebuilt instance and restore its
    /// registry from the sockets that are still open.
    pub async fn resume(&self) -> RestoreReport {
        let fresh = self.room().rebuild();
        let report = fresh.restore(self.host.as_ref()).await;
        *self.room.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        report
    }
}

/// WebSocket upgrade handler.
///
/// Query parameters and headers are handed to the room's metadata
/// extractor.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<WsState>,
) -> impl IntoResponse {
    let request = ConnectRequest {
        path: uri.path().to_string(),
        query,
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, request, state))
}

async fn handle_socket(socket: WebSocket, request: ConnectRequest, state: WsState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn = Arc::new(WsConnection::new(tx));
    let id = conn.id();
    state.host.insert(Arc::clone(&conn));

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let room = state.room();
    if room.on_connect(conn.clone(), request).await.is_err() {
        // The room already queued a close frame; let the writer flush it.
        state.host.remove(id);
        drop(conn);
        let _ = send_task.await;
        return;
    }

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => state.room().on_message(id, text.as_bytes()).await,
            Ok(Message::Binary(data)) => state.room().on_message(id, &data).await,
            Ok(Message::Close(frame)) => {
                tracing::debug!(
                    conn_id = %id,
                    code = frame.as_ref().map(|f| f.code),
                    "Client closed socket"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(conn_id = %id, error = %e, "WebSocket error");
                break;
            }
        }
        if !conn.is_open() {
            break;
        }
    }

    conn.mark_closed();
    state.host.remove(id);
    state.room().on_disconnect(id).await;
    send_task.abort();
}

/// Remote command endpoint.
pub async fn rpc_handler(
    State(state): State<WsState>,
    Json(command): Json<RemoteCommand>,
) -> Json<RemoteReply> {
    Json(state.room().execute(command))
}

/// Create the room router: `GET /ws` for sockets, `POST /rpc` for remote
/// commands.
///
/// # Example
/// ```ignore
/// let state = WsState::new(room);
/// let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
/// axum::serve(listener, create_router(state)).await?;
/// ```
#[must_use]
pub fn create_router(state: WsState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/rpc", post(rpc_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
