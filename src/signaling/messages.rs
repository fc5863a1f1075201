//! Message Types für das Chat-Protokoll
//!
//! Jede WebSocket-Textnachricht enthält genau ein [`Envelope`]. Das Feld
//! `type` ist Pflicht, alle anderen Felder sind optional und werden je nach
//! Typ verwendet. Unbekannte Felder werden beim Parsen ignoriert.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Opaque SDP-Payload (`{"type": "offer", "sdp": "..."}`)
pub type SessionPayload = serde_json::Value;

/// Opaque ICE-Candidate-Payload
pub type IcePayload = serde_json::Value;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Envelope without type tag")]
    MissingType,
}

// ============================================================================
// MESSAGE KIND
// ============================================================================

/// Bekannte Werte des `type`-Felds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Auth,
    Signup,
    AuthSuccess,
    AuthFailed,
    Message,
    History,
    ServerList,
    ChannelList,
    FriendsList,
    DmList,
    System,
    SwitchServer,
    SwitchChannel,
    SwitchDm,
    CreateServer,
    JoinVoice,
    LeaveVoice,
    WebrtcOffer,
    WebrtcAnswer,
    WebrtcIce,
    /// Vom Client nicht interpretierter Typ
    Unknown,
}

impl MessageKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "auth" => Self::Auth,
            "signup" => Self::Signup,
            "auth_success" => Self::AuthSuccess,
            "auth_failed" => Self::AuthFailed,
            "message" => Self::Message,
            "history" => Self::History,
            "server_list" => Self::ServerList,
            "channel_list" => Self::ChannelList,
            "friends_list" => Self::FriendsList,
            "dm_list" => Self::DmList,
            "system" => Self::System,
            "switch_server" => Self::SwitchServer,
            "switch_channel" => Self::SwitchChannel,
            "switch_dm" => Self::SwitchDm,
            "create_server" => Self::CreateServer,
            "join_voice" => Self::JoinVoice,
            "leave_voice" => Self::LeaveVoice,
            "webrtc_offer" => Self::WebrtcOffer,
            "webrtc_answer" => Self::WebrtcAnswer,
            "webrtc_ice" => Self::WebrtcIce,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Signup => "signup",
            Self::AuthSuccess => "auth_success",
            Self::AuthFailed => "auth_failed",
            Self::Message => "message",
            Self::History => "history",
            Self::ServerList => "server_list",
            Self::ChannelList => "channel_list",
            Self::FriendsList => "friends_list",
            Self::DmList => "dm_list",
            Self::System => "system",
            Self::SwitchServer => "switch_server",
            Self::SwitchChannel => "switch_channel",
            Self::SwitchDm => "switch_dm",
            Self::CreateServer => "create_server",
            Self::JoinVoice => "join_voice",
            Self::LeaveVoice => "leave_voice",
            Self::WebrtcOffer => "webrtc_offer",
            Self::WebrtcAnswer => "webrtc_answer",
            Self::WebrtcIce => "webrtc_ice",
            Self::Unknown => "unknown",
        }
    }

    /// Signaling-Nachrichten werden an den Koordinator geroutet
    pub fn is_signaling(&self) -> bool {
        matches!(self, Self::WebrtcOffer | Self::WebrtcAnswer | Self::WebrtcIce)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// Eine JSON-Nachricht auf der WebSocket-Verbindung
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friend_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dm_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_username: Option<String>,

    /// Empfänger einer Signaling-Nachricht
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Absender einer weitergeleiteten Signaling-Nachricht
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IcePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers: Option<Vec<Server>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<Channel>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friends: Option<Vec<Friend>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dms: Option<Vec<DirectMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<ChatMessage>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Envelope {
    /// Leeres Envelope mit gegebenem Typ
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            ..Default::default()
        }
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::from_tag(&self.msg_type)
    }

    /// Absender einer weitergeleiteten Nachricht (`from`, sonst `username`)
    pub fn sender(&self) -> Option<&str> {
        self.from
            .as_deref()
            .or(self.username.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Parst eine Textnachricht
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        if envelope.msg_type.is_empty() {
            return Err(EnvelopeError::MissingType);
        }
        Ok(envelope)
    }

    /// Serialisiert zu kompaktem JSON (leere Felder entfallen)
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        if self.msg_type.is_empty() {
            return Err(EnvelopeError::MissingType);
        }
        Ok(serde_json::to_string(self)?)
    }

    // ========================================================================
    // CONSTRUCTORS - CLIENT → SERVER
    // ========================================================================

    pub fn auth(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            ..Self::new(MessageKind::Auth.as_str())
        }
    }

    pub fn signup(
        username: impl Into<String>,
        password: impl Into<String>,
        invite_code: impl Into<String>,
    ) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            invite_code: Some(invite_code.into()),
            ..Self::new(MessageKind::Signup.as_str())
        }
    }

    pub fn chat(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::new(MessageKind::Message.as_str())
        }
    }

    pub fn switch_server(server_id: impl Into<String>) -> Self {
        Self {
            server_id: Some(server_id.into()),
            ..Self::new(MessageKind::SwitchServer.as_str())
        }
    }

    pub fn switch_channel(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: Some(channel_id.into()),
            ..Self::new(MessageKind::SwitchChannel.as_str())
        }
    }

    pub fn switch_dm(dm_id: impl Into<String>) -> Self {
        Self {
            dm_id: Some(dm_id.into()),
            ..Self::new(MessageKind::SwitchDm.as_str())
        }
    }

    pub fn create_server(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(MessageKind::CreateServer.as_str())
        }
    }

    pub fn join_voice(server_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            server_id: Some(server_id.into()),
            channel_id: Some(channel_id.into()),
            ..Self::new(MessageKind::JoinVoice.as_str())
        }
    }

    pub fn leave_voice(server_id: Option<String>, channel_id: Option<String>) -> Self {
        Self {
            server_id,
            channel_id,
            ..Self::new(MessageKind::LeaveVoice.as_str())
        }
    }

    pub fn webrtc_offer(target: impl Into<String>, offer: SessionPayload) -> Self {
        Self {
            target: Some(target.into()),
            offer: Some(offer),
            ..Self::new(MessageKind::WebrtcOffer.as_str())
        }
    }

    pub fn webrtc_answer(target: impl Into<String>, answer: SessionPayload) -> Self {
        Self {
            target: Some(target.into()),
            answer: Some(answer),
            ..Self::new(MessageKind::WebrtcAnswer.as_str())
        }
    }

    pub fn webrtc_ice(target: impl Into<String>, candidate: IcePayload) -> Self {
        Self {
            target: Some(target.into()),
            candidate: Some(candidate),
            ..Self::new(MessageKind::WebrtcIce.as_str())
        }
    }
}

// ============================================================================
// RECORD TYPES
// ============================================================================

/// Chat-Server (Gilde) mit Kanälen
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    pub server_id: String,
    pub name: String,
    pub owner: String,
    pub members: Vec<String>,
    pub channels: Vec<Channel>,
    pub permissions: HashMap<String, Vec<String>>,
}

/// Text- oder Sprachkanal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Channel {
    pub channel_id: String,
    pub server_id: String,
    pub name: String,
    /// "text" oder "voice"
    pub channel_type: String,
    pub active_users: Vec<String>,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            channel_id: String::new(),
            server_id: String::new(),
            name: String::new(),
            channel_type: "text".to_string(),
            active_users: Vec::new(),
        }
    }
}

impl Channel {
    pub fn is_voice(&self) -> bool {
        self.channel_type == "voice"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Friend {
    pub username: String,
    pub emoji_avatar: Option<String>,
    pub is_online: bool,
    pub status: String,
}

impl Default for Friend {
    fn default() -> Self {
        Self {
            username: String::new(),
            emoji_avatar: None,
            is_online: false,
            status: "offline".to_string(),
        }
    }
}

/// Direktnachrichten-Konversation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectMessage {
    pub dm_id: String,
    pub participants: Vec<String>,
    pub other_user: String,
    pub last_message: Option<ChatMessage>,
    pub unread_count: u32,
}

/// Einzelne Chat-Nachricht
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatMessage {
    pub message_id: String,
    pub content: String,
    pub username: String,
    /// RFC 3339, so wie vom Server geliefert
    pub timestamp: String,
    /// "message" oder "system"
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
}

impl Default for ChatMessage {
    fn default() -> Self {
        Self {
            message_id: String::new(),
            content: String::new(),
            username: String::new(),
            timestamp: String::new(),
            message_type: "message".to_string(),
            context_type: None,
            context_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_auth_serialization() {
        let json = Envelope::auth("alice", "pw").encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(
            value,
            json!({"type": "auth", "username": "alice", "password": "pw"})
        );
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let envelope =
            Envelope::decode(r#"{"type":"system","content":"hi","shiny_new_field":[1,2]}"#)
                .unwrap();

        assert_eq!(envelope.kind(), MessageKind::System);
        assert_eq!(envelope.content.as_deref(), Some("hi"));
    }

    #[test]
    fn test_missing_or_empty_type_is_rejected() {
        assert!(matches!(
            Envelope::decode(r#"{"type":""}"#),
            Err(EnvelopeError::MissingType)
        ));
        assert!(matches!(
            Envelope::decode(r#"{"content":"x"}"#),
            Err(EnvelopeError::Json(_))
        ));
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::default().encode().is_err());
    }

    #[test]
    fn test_unknown_type_decodes() {
        let envelope = Envelope::decode(r#"{"type":"typing_indicator"}"#).unwrap();
        assert_eq!(envelope.kind(), MessageKind::Unknown);
        assert_eq!(envelope.msg_type, "typing_indicator");
    }

    #[test]
    fn test_round_trip_preserves_populated_fields() {
        let message = ChatMessage {
            message_id: "m1".to_string(),
            content: "hello".to_string(),
            username: "bob".to_string(),
            timestamp: "2024-05-01T10:00:00Z".to_string(),
            message_type: "message".to_string(),
            context_type: Some("channel".to_string()),
            context_id: Some("c1".to_string()),
        };
        let channel = Channel {
            channel_id: "c1".to_string(),
            server_id: "s1".to_string(),
            name: "talk".to_string(),
            channel_type: "voice".to_string(),
            active_users: vec!["bob".to_string()],
        };

        let original = Envelope {
            msg_type: "history".to_string(),
            username: Some("bob".to_string()),
            password: Some("pw".to_string()),
            invite_code: Some("INVITE1".to_string()),
            content: Some("hello".to_string()),
            name: Some("Home".to_string()),
            server_id: Some("s1".to_string()),
            channel_id: Some("c1".to_string()),
            channel_type: Some("voice".to_string()),
            friend_username: Some("carol".to_string()),
            dm_id: Some("d1".to_string()),
            target_username: Some("dave".to_string()),
            target: Some("erin".to_string()),
            from: Some("frank".to_string()),
            muted: Some(true),
            offer: Some(json!({"type": "offer", "sdp": "v=0"})),
            answer: Some(json!({"type": "answer", "sdp": "v=0"})),
            candidate: Some(json!({"candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0})),
            message: Some("Invalid credentials".to_string()),
            timestamp: Some("2024-05-01T10:00:00Z".to_string()),
            servers: Some(vec![Server {
                server_id: "s1".to_string(),
                name: "Home".to_string(),
                owner: "bob".to_string(),
                members: vec!["bob".to_string(), "carol".to_string()],
                channels: vec![channel.clone()],
                permissions: HashMap::from([(
                    "bob".to_string(),
                    vec!["manage".to_string()],
                )]),
            }]),
            channels: Some(vec![channel]),
            friends: Some(vec![Friend {
                username: "carol".to_string(),
                emoji_avatar: Some("🦀".to_string()),
                is_online: true,
                status: "online".to_string(),
            }]),
            dms: Some(vec![DirectMessage {
                dm_id: "d1".to_string(),
                participants: vec!["bob".to_string(), "carol".to_string()],
                other_user: "carol".to_string(),
                last_message: Some(message.clone()),
                unread_count: 3,
            }]),
            history: Some(vec![message]),
            code: Some("ABC123".to_string()),
        };

        let decoded = Envelope::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_sender_prefers_from() {
        let mut envelope = Envelope::new("webrtc_offer");
        assert_eq!(envelope.sender(), None);

        envelope.username = Some("carol".to_string());
        assert_eq!(envelope.sender(), Some("carol"));

        envelope.from = Some("dave".to_string());
        assert_eq!(envelope.sender(), Some("dave"));
    }

    #[test]
    fn test_signaling_constructors() {
        let ice = Envelope::webrtc_ice("bob", json!({"candidate": "candidate:1"}));
        assert_eq!(ice.kind(), MessageKind::WebrtcIce);
        assert!(ice.kind().is_signaling());
        assert_eq!(ice.target.as_deref(), Some("bob"));

        let leave = Envelope::leave_voice(None, None);
        assert_eq!(leave.encode().unwrap(), r#"{"type":"leave_voice"}"#);
    }

    #[test]
    fn test_record_defaults() {
        let channel: Channel = serde_json::from_str(r#"{"channel_id":"c"}"#).unwrap();
        assert_eq!(channel.channel_type, "text");
        assert!(!channel.is_voice());

        let friend: Friend = serde_json::from_str(r#"{"username":"eve"}"#).unwrap();
        assert_eq!(friend.status, "offline");
    }
}
