//! Chat room payloads.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of a chat message body, in characters.
pub const MAX_MESSAGE_LENGTH: usize = 10_000;

/// Chat message.
///
/// Content is opaque to the server. Encrypted clients put ciphertext here and
/// set `is_encrypted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message body (at most [`MAX_MESSAGE_LENGTH`] characters)
    pub content: String,
    /// Client-assigned id, echoed back for deduplication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    /// Whether `content` is ciphertext
    #[serde(default)]
    pub is_encrypted: bool,
    /// Application-level subtype (text, image, file, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    /// Free-form metadata forwarded untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Message {
    /// Plain text message.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            message_id: None,
            is_encrypted: false,
            message_type: None,
            metadata: None,
        }
    }
}

/// Typing indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Typing {
    /// Whether the sender is currently typing
    pub is_typing: bool,
}

/// Presence status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    /// Connected and active
    Online,
    /// Connected but idle
    Away,
    /// Not connected
    Offline,
}

/// Presence update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    /// New status of the sender
    pub status: PresenceStatus,
}
