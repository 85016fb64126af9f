//! Live-session bookkeeping and channel-filtered fan-out.
//!
//! The registry is process-local and rebuildable from attachments; it is
//! never the durability boundary. All operations are synchronous so that
//! register/unregister/broadcast never interleave within one instance.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use roomlink_core::{Connection, ConnectionId, ConnectionMeta, Frame};
use serde_json::Value;

/// A live connection bound to its metadata.
#[derive(Clone)]
pub struct Session {
    /// Transport handle.
    pub conn: Arc<dyn Connection>,
    /// Live metadata; the attachment mirrors it.
    pub meta: ConnectionMeta,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("conn_id", &self.conn.id())
            .field("meta", &self.meta)
            .finish()
    }
}

/// Recipient filters. Every supplied filter must pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastOptions {
    /// Skip this connection.
    pub except: Option<ConnectionId>,
    /// Only these users.
    pub user_ids: Option<Vec<String>>,
    /// Only these clients.
    pub client_ids: Option<Vec<String>>,
}

impl BroadcastOptions {
    #[must_use]
    pub const fn except(mut self, id: ConnectionId) -> Self {
        self.except = Some(id);
        self
    }

    #[must_use]
    pub fn only_users<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.user_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn only_clients<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.client_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    fn admits(&self, id: ConnectionId, meta: &ConnectionMeta) -> bool {
        if self.except == Some(id) {
            return false;
        }
        if let Some(users) = &self.user_ids {
            if !users.contains(&meta.user_id) {
                return false;
            }
        }
        if let Some(clients) = &self.client_ids {
            if !clients.contains(&meta.client_id) {
                return false;
            }
        }
        true
    }
}

/// Authoritative set of live sessions for one process instance.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<ConnectionId, Session>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Replaces (and returns) any session on the same handle.
    pub fn register(&mut self, conn: Arc<dyn Connection>, meta: ConnectionMeta) -> Option<Session> {
        let id = conn.id();
        self.sessions.insert(id, Session { conn, meta })
    }

    /// Remove a session. Idempotent.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn meta_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionMeta> {
        self.sessions.get_mut(&id).map(|s| &mut s.meta)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Distinct connected user ids, sorted.
    #[must_use]
    pub fn user_ids(&self) -> Vec<String> {
        self.sessions
            .values()
            .map(|s| s.meta.user_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Handles belonging to a user.
    #[must_use]
    pub fn connections_for_user(&self, user_id: &str) -> Vec<Arc<dyn Connection>> {
        self.sessions
            .values()
            .filter(|s| s.meta.user_id == user_id)
            .map(|s| Arc::clone(&s.conn))
            .collect()
    }

    /// Send to every subscriber of `channel` admitted by `opts`.
    ///
    /// Closed or failing sessions are purged in the same pass. Returns the
    /// number of successful sends.
    pub fn broadcast(&mut self, channel: &str, data: &Value, opts: &BroadcastOptions) -> usize {
        self.fan_out(channel, data, |id, meta| {
            meta.is_subscribed(channel) && opts.admits(id, meta)
        })
    }

    /// Send to every session of `user_id` subscribed to `channel`.
    pub fn send_to_user(&mut self, user_id: &str, channel: &str, data: &Value) -> usize {
        self.fan_out(channel, data, |_, meta| {
            meta.user_id == user_id && meta.is_subscribed(channel)
        })
    }

    /// Remove every session whose transport is no longer open.
    pub fn sweep_stale(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|id, s| {
            let open = s.conn.is_open();
            if !open {
                tracing::debug!(conn_id = %id, "Sweeping stale session");
            }
            open
        });
        before - self.sessions.len()
    }

    /// Swap in a rebuilt session set.
    pub fn replace(&mut self, other: Self) {
        self.sessions = other.sessions;
    }

    fn fan_out(
        &mut self,
        channel: &str,
        data: &Value,
        matches: impl Fn(ConnectionId, &ConnectionMeta) -> bool,
    ) -> usize {
        let text = match Frame::event(channel, data.clone()).encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(channel, error = %e, "Failed to encode broadcast");
                return 0;
            }
        };

        let mut sent = 0;
        let mut dead = Vec::new();
        for (id, session) in &self.sessions {
            if !matches(*id, &session.meta) {
                continue;
            }
            if !session.conn.is_open() {
                dead.push(*id);
                continue;
            }
            match session.conn.send(&text) {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::warn!(conn_id = %id, channel, error = %e, "Send failed, purging session");
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            self.sessions.remove(&id);
        }
        tracing::debug!(channel, sent, "Fan-out complete");
        sent
    }
}
