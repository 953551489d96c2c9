use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel recipient for the shared broadcast room.
pub const GENERAL: &str = "general";

/// Delivery state of a private message.
pub const READ_STATUS_STORED: u8 = 0;
pub const READ_STATUS_DELIVERED: u8 = 1;
pub const READ_STATUS_READ: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::File => "file",
        }
    }
}

/// A chat message as it travels over the wire. Usernames are denormalized
/// strings; `to` is the `GENERAL` sentinel for broadcast messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub originalname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub is_general: bool,
    pub read_status: u8,
    pub created_at: DateTime<Utc>,
}

/// Public profile fields of a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub username: String,
    pub avatar_url: Option<String>,
    pub status_text: Option<String>,
    pub last_online: Option<DateTime<Utc>>,
}
