use serde::{Deserialize, Serialize};

use crate::models::{ChatMessage, UserProfile};

/// Audio-only or audio+video call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

/// Commands sent FROM client TO server over the WebSocket.
///
/// Tags are kebab-case event names (`send-private-message`,
/// `mark-as-read`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientCommand {
    Register { username: String, password: String },
    Login { username: String, password: String },

    /// Re-fetch the general chat history.
    LoadGeneralChat,
    /// Fetch the private conversation with another user.
    LoadPrivateMessages { username: String },

    SendMessage { message: String },
    SendFile {
        filename: String,
        originalname: String,
        url: String,
        mimetype: String,
        #[serde(default)]
        caption: Option<String>,
    },
    SendPrivateMessage { to: String, message: String },
    SendPrivateFile {
        to: String,
        filename: String,
        originalname: String,
        url: String,
        mimetype: String,
        #[serde(default)]
        caption: Option<String>,
    },

    DeleteMessage { id: i64 },
    /// Mark every message from `from` to the caller as read.
    MarkAsRead { from: String },

    GetProfile { username: String },
    UpdateProfile { status_text: String },
    UpdateAvatar { avatar_url: String },

    /// Store a serialized browser push subscription for offline delivery.
    SubscribeToPush { subscription: serde_json::Value },

    // Call signaling, relayed opaquely to the target user.
    InitiateCall { to: String, call_type: CallType },
    AcceptCall { to: String },
    RejectCall { to: String },
    CallOffer { to: String, sdp: String },
    CallAnswer { to: String, sdp: String },
    IceCandidate {
        to: String,
        candidate: String,
        #[serde(default)]
        sdp_mid: Option<String>,
        #[serde(default)]
        sdp_m_line_index: Option<u16>,
    },
    EndCall { to: String },
}

/// Events sent FROM server TO client over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    RegisterResponse { success: bool, message: String },
    LoginResponse { success: bool, message: String },

    /// All registered users with their public profiles.
    UsersList { users: Vec<UserProfile> },
    /// Usernames with at least one live socket.
    OnlineUsers { users: Vec<String> },
    UserStatus { username: String, online: bool },

    GeneralHistory { messages: Vec<ChatMessage> },
    PrivateHistory { with: String, messages: Vec<ChatMessage> },

    NewMessage { message: ChatMessage },
    PrivateMessage { message: ChatMessage },
    MessageDeleted { id: i64 },
    /// `by` has read the listed message ids sent to them.
    MessagesRead { by: String, ids: Vec<i64> },

    Profile { profile: UserProfile },
    ProfileUpdated { success: bool, message: String },

    // Call signaling, mirrored back with the originating username.
    IncomingCall { from: String, call_type: CallType },
    CallAccepted { from: String },
    CallRejected { from: String },
    CallOffer { from: String, sdp: String },
    CallAnswer { from: String, sdp: String },
    IceCandidate {
        from: String,
        candidate: String,
        #[serde(default)]
        sdp_mid: Option<String>,
        #[serde(default)]
        sdp_m_line_index: Option<u16>,
    },
    CallEnded { from: String },
    /// The call target has no live socket.
    CallUnavailable { username: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_envelope_uses_kebab_case_tags() {
        let raw = r#"{"type":"send-private-message","data":{"to":"mama","message":"hi"}}"#;
        match serde_json::from_str::<ClientCommand>(raw).unwrap() {
            ClientCommand::SendPrivateMessage { to, message } => {
                assert_eq!(to, "mama");
                assert_eq!(message, "hi");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn unit_command_needs_no_data() {
        let cmd: ClientCommand = serde_json::from_str(r#"{"type":"load-general-chat"}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::LoadGeneralChat));
    }

    #[test]
    fn ice_candidate_optionals_default() {
        let raw = r#"{"type":"ice-candidate","data":{"to":"papa","candidate":"cand"}}"#;
        match serde_json::from_str::<ClientCommand>(raw).unwrap() {
            ClientCommand::IceCandidate { sdp_mid, sdp_m_line_index, .. } => {
                assert!(sdp_mid.is_none());
                assert!(sdp_m_line_index.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn event_serializes_with_data_payload() {
        let ev = ServerEvent::UserStatus { username: "alice".into(), online: true };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "user-status");
        assert_eq!(json["data"]["online"], true);
    }
}
