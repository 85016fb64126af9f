//! Connection identity, channel subscriptions and the durable attachment.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity and subscriptions of one logical session.
///
/// The base shape is fixed; app-specific fields go in `extra`, which is
/// flattened into the serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMeta {
    /// User the session belongs to.
    pub user_id: String,

    /// Client (device/tab) identifier. Together with `user_id` this
    /// identifies the session.
    pub client_id: String,

    /// Subscribed channels in join order.
    #[serde(default)]
    pub channels: Vec<String>,

    /// Arbitrary extension fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Serialized names of the base fields. `extra` must never carry these,
/// or the flattened form would hold duplicate keys.
pub const RESERVED_KEYS: [&str; 3] = ["userId", "clientId", "channels"];

/// Metadata validation or (de)serialization error.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// `userId` or `clientId` absent or null.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    /// Wrong shape, empty identifier or reserved extension key.
    #[error("Invalid metadata: {0}")]
    Invalid(String),
    /// Stored attachment is not valid JSON.
    #[error("Corrupt attachment: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl ConnectionMeta {
    /// Create metadata with no channels or extension fields.
    #[must_use]
    pub fn new(user_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            client_id: client_id.into(),
            channels: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Builder-style channel subscription.
    #[must_use]
    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for channel in channels {
            self.join(channel);
        }
        self
    }

    /// Validate an untyped value into metadata.
    ///
    /// This is the single boundary where metadata shape is checked.
    ///
    /// # Errors
    /// Returns error if the value is not an object, lacks `userId`/`clientId`,
    /// or has empty identifiers or a malformed `channels` list.
    pub fn from_value(value: Value) -> Result<Self, MetaError> {
        let Value::Object(ref obj) = value else {
            return Err(MetaError::Invalid("expected an object".into()));
        };
        for field in ["userId", "clientId"] {
            match obj.get(field) {
                None | Some(Value::Null) => return Err(MetaError::MissingField(field)),
                Some(Value::String(s)) if s.is_empty() => {
                    return Err(MetaError::Invalid(format!("{field} must not be empty")));
                }
                Some(Value::String(_)) => {}
                Some(_) => return Err(MetaError::Invalid(format!("{field} must be a string"))),
            }
        }
        let mut meta: Self =
            serde_json::from_value(value).map_err(|e| MetaError::Invalid(e.to_string()))?;
        meta.dedup_channels();
        Ok(meta)
    }

    /// Check identifiers of metadata built in code.
    ///
    /// # Errors
    /// Returns error if `userId` or `clientId` is empty.
    pub fn validate(&self) -> Result<(), MetaError> {
        if self.user_id.is_empty() {
            return Err(MetaError::Invalid("userId must not be empty".into()));
        }
        if self.client_id.is_empty() {
            return Err(MetaError::Invalid("clientId must not be empty".into()));
        }
        Ok(())
    }

    /// Subscribe to a channel. Returns false if already subscribed.
    pub fn join(&mut self, channel: impl Into<String>) -> bool {
        let channel = channel.into();
        if self.channels.contains(&channel) {
            return false;
        }
        self.channels.push(channel);
        true
    }

    /// Unsubscribe from a channel. Returns false if not subscribed.
    pub fn leave(&mut self, channel: &str) -> bool {
        let before = self.channels.len();
        self.channels.retain(|c| c != channel);
        self.channels.len() != before
    }

    /// Whether the session is subscribed to `channel`.
    #[must_use]
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }

    /// Get an extension value by key.
    #[must_use]
    pub fn get_extra(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Set an extension value.
    ///
    /// # Errors
    /// Returns error if `key` names a base field.
    pub fn set_extra(&mut self, key: impl Into<String>, value: Value) -> Result<(), MetaError> {
        let key = key.into();
        if RESERVED_KEYS.contains(&key.as_str()) {
            return Err(MetaError::Invalid(format!("reserved key: {key}")));
        }
        self.extra.insert(key, value);
        Ok(())
    }

    fn dedup_channels(&mut self) {
        let mut seen = Vec::with_capacity(self.channels.len());
        self.channels.retain(|c| {
            if seen.contains(c) {
                false
            } else {
                seen.push(c.clone());
                true
            }
        });
    }
}

/// Durable snapshot of [`ConnectionMeta`], bound to one connection handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attachment(String);

impl Attachment {
    /// Snapshot metadata. Reserved keys in `extra` are dropped so the base
    /// fields always win.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn from_meta(meta: &ConnectionMeta) -> Result<Self, MetaError> {
        if RESERVED_KEYS.iter().any(|key| meta.extra.contains_key(*key)) {
            let mut clean = meta.clone();
            clean.extra.retain(|key, _| !RESERVED_KEYS.contains(&key.as_str()));
            tracing::warn!(user_id = %meta.user_id, "Dropping reserved keys from metadata extras");
            return Ok(Self(serde_json::to_string(&clean)?));
        }
        Ok(Self(serde_json::to_string(meta)?))
    }

    /// Wrap raw stored bytes without validating them.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Raw stored form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read the snapshot back.
    ///
    /// # Errors
    /// Returns error if the stored form is not valid metadata.
    pub fn to_meta(&self) -> Result<ConnectionMeta, MetaError> {
        let value: Value = serde_json::from_str(&self.0)?;
        ConnectionMeta::from_value(value)
    }
}
