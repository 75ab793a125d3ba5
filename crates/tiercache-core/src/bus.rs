//! Invalidation messages and the bus transport contract.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Kind of mutation an invalidation message describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Set,
    Delete,
    Clear,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set => write!(f, "set"),
            Self::Delete => write!(f, "delete"),
            Self::Clear => write!(f, "clear"),
        }
    }
}

/// A mutation performed on one instance, to be mirrored by its siblings.
///
/// Applying the same message twice is harmless: deletes are idempotent and
/// sets overwrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationMessage {
    pub keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub kind: MessageKind,
    pub origin_id: String,
    /// Serialized entry for `Set` messages carrying a single key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl InvalidationMessage {
    pub fn set(
        key: impl Into<String>,
        namespace: Option<String>,
        origin_id: impl Into<String>,
        payload: Option<String>,
    ) -> Self {
        Self {
            keys: vec![key.into()],
            namespace,
            kind: MessageKind::Set,
            origin_id: origin_id.into(),
            payload,
        }
    }

    pub fn delete(
        keys: Vec<String>,
        namespace: Option<String>,
        origin_id: impl Into<String>,
    ) -> Self {
        Self {
            keys,
            namespace,
            kind: MessageKind::Delete,
            origin_id: origin_id.into(),
            payload: None,
        }
    }

    pub fn clear(namespace: Option<String>, origin_id: impl Into<String>) -> Self {
        Self {
            keys: Vec::new(),
            namespace,
            kind: MessageKind::Clear,
            origin_id: origin_id.into(),
            payload: None,
        }
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::message(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, TransportError> {
        serde_json::from_str(raw).map_err(|e| TransportError::message(e.to_string()))
    }
}

/// Events delivered by a transport subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(InvalidationMessage),
    /// The transport regained connectivity after an outage.
    Reconnected,
}

/// Publish/subscribe primitive the invalidation bus runs on.
///
/// Delivery is at-least-once; subscribers must tolerate duplicates. A
/// subscription may also deliver the subscriber's own messages.
#[async_trait]
pub trait BusTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish(
        &self,
        channel: &str,
        message: &InvalidationMessage,
    ) -> Result<(), TransportError>;

    /// Subscribes to `channel`. Events arrive on the returned receiver until
    /// the transport is disconnected.
    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_json_shape() {
        let message = InvalidationMessage::delete(
            vec!["a".into(), "b".into()],
            Some("users".into()),
            "node-1",
        );
        let json = message.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"keys":["a","b"],"namespace":"users","kind":"delete","originId":"node-1"}"#
        );
        assert_eq!(InvalidationMessage::from_json(&json).unwrap(), message);
    }

    #[test]
    fn test_invalid_message_is_transport_error() {
        let err = InvalidationMessage::from_json("{\"keys\":1}").unwrap_err();
        assert!(matches!(err, TransportError::Message { .. }));
    }

    #[test]
    fn test_clear_has_no_keys() {
        let message = InvalidationMessage::clear(None, "node-1");
        assert!(message.keys.is_empty());
        assert_eq!(message.kind.to_string(), "clear");
    }
}
