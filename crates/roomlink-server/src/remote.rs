//! Typed commands for driving a room from outside its process.
//!
//! Commands are plain serde data so any RPC carrier can forward them.
//! Exclusion of a specific connection is deliberately not expressible:
//! connection handles are meaningless outside the owning process.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{registry::BroadcastOptions, room::Room};

/// Remote operation on a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RemoteCommand {
    /// Channel broadcast, optionally narrowed to users and clients.
    Broadcast {
        channel: String,
        #[serde(default)]
        data: Value,
        #[serde(default, rename = "userIds", skip_serializing_if = "Option::is_none")]
        user_ids: Option<Vec<String>>,
        #[serde(default, rename = "clientIds", skip_serializing_if = "Option::is_none")]
        client_ids: Option<Vec<String>>,
    },
    /// Deliver to one user's sessions subscribed to `channel`.
    SendToUser {
        #[serde(rename = "userId")]
        user_id: String,
        channel: String,
        #[serde(default)]
        data: Value,
    },
    /// Number of registered sessions.
    SessionCount,
    /// Distinct user ids with at least one session.
    ConnectedUserIds,
    /// Drop sessions whose transport is no longer open.
    SweepStale,
}

/// Result of a remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RemoteReply {
    /// Sessions a frame was delivered to.
    Sent { count: usize },
    /// Answer to [`RemoteCommand::SessionCount`].
    SessionCount { count: usize },
    /// Answer to [`RemoteCommand::ConnectedUserIds`].
    UserIds {
        #[serde(rename = "userIds")]
        user_ids: Vec<String>,
    },
    /// Sessions removed by a sweep.
    Swept { removed: usize },
}

impl RemoteCommand {
    #[must_use]
    pub fn broadcast(channel: impl Into<String>, data: Value) -> Self {
        Self::Broadcast {
            channel: channel.into(),
            data,
            user_ids: None,
            client_ids: None,
        }
    }

    /// Restrict a broadcast to these users. No effect on other commands.
    #[must_use]
    pub fn to_users<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Self::Broadcast { user_ids, .. } = &mut self {
            *user_ids = Some(ids.into_iter().map(Into::into).collect());
        }
        self
    }

    /// Restrict a broadcast to these clients. No effect on other commands.
    #[must_use]
    pub fn to_clients<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Self::Broadcast { client_ids, .. } = &mut self {
            *client_ids = Some(ids.into_iter().map(Into::into).collect());
        }
        self
    }

    #[must_use]
    pub fn send_to_user(user_id: impl Into<String>, channel: impl Into<String>, data: Value) -> Self {
        Self::SendToUser {
            user_id: user_id.into(),
            channel: channel.into(),
            data,
        }
    }
}

impl Room {
    /// Run a remote command against this room.
    pub fn execute(&self, command: RemoteCommand) -> RemoteReply {
        tracing::debug!(room = %self.name(), ?command, "Executing remote command");
        match command {
            RemoteCommand::Broadcast {
                channel,
                data,
                user_ids,
                client_ids,
            } => {
                let opts = BroadcastOptions {
                    except: None,
                    user_ids,
                    client_ids,
                };
                RemoteReply::Sent {
                    count: self.broadcast(&channel, &data, &opts),
                }
            }
            RemoteCommand::SendToUser {
                user_id,
                channel,
                data,
            } => RemoteReply::Sent {
                count: self.send_to_user(&user_id, &channel, &data),
            },
            RemoteCommand::SessionCount => RemoteReply::SessionCount {
                count: self.session_count(),
            },
            RemoteCommand::ConnectedUserIds => RemoteReply::UserIds {
                user_ids: self.user_ids(),
            },
            RemoteCommand::SweepStale => RemoteReply::Swept {
                removed: self.sweep_stale(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use roomlink_core::ConnectRequest;
    use serde_json::json;

    use super::*;
    use crate::{room::RoomDefinition, storage::MemoryAttachmentStore, testutil::MockConnection};

    #[test]
    fn test_command_wire_shape() {
        let cmd: RemoteCommand = serde_json::from_value(json!({
            "op": "broadcast",
            "channel": "lobby",
            "data": {"n": 1},
            "userIds": ["u1"]
        }))
        .unwrap();
        assert_eq!(
            cmd,
            RemoteCommand::broadcast("lobby", json!({"n": 1})).to_users(["u1"])
        );

        let reply = serde_json::to_value(RemoteReply::UserIds {
            user_ids: vec!["a".into()],
        })
        .unwrap();
        assert_eq!(reply, json!({"result": "user_ids", "userIds": ["a"]}));
    }

    #[test]
    fn test_unknown_op_rejected() {
        let parsed = serde_json::from_value::<RemoteCommand>(json!({"op": "shutdown"}));
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn test_execute_against_room() {
        let room = Room::new(
            RoomDefinition::new("chat"),
            Arc::new(MemoryAttachmentStore::new()),
        );
        let a = MockConnection::new();
        let b = MockConnection::new();
        for (conn, user) in [(&a, "u1"), (&b, "u2")] {
            let request = ConnectRequest::new("/ws")
                .with_query("userId", user)
                .with_query("clientId", "tab")
                .with_query("channels", "lobby");
            room.on_connect(conn.clone(), request).await.unwrap();
        }

        let reply = room.execute(RemoteCommand::broadcast("lobby", json!("hi")).to_users(["u2"]));
        assert_eq!(reply, RemoteReply::Sent { count: 1 });
        assert!(a.frames().is_empty());

        let reply = room.execute(RemoteCommand::send_to_user("u1", "lobby", json!("dm")));
        assert_eq!(reply, RemoteReply::Sent { count: 1 });

        assert_eq!(
            room.execute(RemoteCommand::ConnectedUserIds),
            RemoteReply::UserIds {
                user_ids: vec!["u1".into(), "u2".into()]
            }
        );

        b.drop_transport();
        assert_eq!(
            room.execute(RemoteCommand::SweepStale),
            RemoteReply::Swept { removed: 1 }
        );
        assert_eq!(
            room.execute(RemoteCommand::SessionCount),
            RemoteReply::SessionCount { count: 1 }
        );
    }
}
