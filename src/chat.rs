//! Chat State - lokales Abbild von Servern, Kanälen, Freunden und Nachrichten
//!
//! Wird vom Router mit jedem eingehenden Envelope gefüttert. Unbekannte
//! oder nicht zustandsrelevante Typen verändern nichts.

use crate::signaling::{Channel, ChatMessage, DirectMessage, Envelope, Friend, MessageKind, Server};
use chrono::{DateTime, Utc};

/// Benutzername für vom Server gemeldete Systemnachrichten
pub const SYSTEM_USERNAME: &str = "System";

/// Anmeldestatus gegenüber dem Server
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthStatus {
    #[default]
    SignedOut,
    /// `auth`/`signup` gesendet, Antwort steht aus
    Pending { username: String },
    SignedIn { username: String },
    Failed { reason: String },
}

/// Was ein Envelope am Zustand geändert hat
#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpdate {
    MessageAdded(ChatMessage),
    HistoryReplaced(usize),
    ServersReplaced(usize),
    ChannelsReplaced(usize),
    FriendsReplaced(usize),
    DirectMessagesReplaced(usize),
    Auth(AuthStatus),
}

#[derive(Debug, Clone, Default)]
pub struct ChatState {
    pub auth: AuthStatus,
    pub servers: Vec<Server>,
    pub channels: Vec<Channel>,
    pub friends: Vec<Friend>,
    pub direct_messages: Vec<DirectMessage>,
    pub messages: Vec<ChatMessage>,

    pub current_server: Option<String>,
    pub current_channel: Option<String>,
    pub current_dm: Option<String>,
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wendet ein eingehendes Envelope an
    ///
    /// Gibt `None` zurück wenn sich nichts geändert hat.
    pub fn apply(&mut self, envelope: &Envelope) -> Option<ChatUpdate> {
        match envelope.kind() {
            MessageKind::Message => {
                let content = envelope.content.as_deref().filter(|c| !c.is_empty())?;
                let username = envelope.username.as_deref().filter(|u| !u.is_empty())?;

                let message = ChatMessage {
                    content: content.to_string(),
                    username: username.to_string(),
                    timestamp: normalize_timestamp(envelope.timestamp.as_deref()),
                    message_type: "message".to_string(),
                    ..Default::default()
                };
                self.messages.push(message.clone());
                Some(ChatUpdate::MessageAdded(message))
            }

            MessageKind::History => {
                self.messages = envelope.history.clone().unwrap_or_default();
                Some(ChatUpdate::HistoryReplaced(self.messages.len()))
            }

            MessageKind::ServerList => {
                self.servers = envelope.servers.clone().unwrap_or_default();
                Some(ChatUpdate::ServersReplaced(self.servers.len()))
            }

            MessageKind::ChannelList => {
                self.channels = envelope.channels.clone().unwrap_or_default();
                Some(ChatUpdate::ChannelsReplaced(self.channels.len()))
            }

            MessageKind::FriendsList => {
                self.friends = envelope.friends.clone().unwrap_or_default();
                Some(ChatUpdate::FriendsReplaced(self.friends.len()))
            }

            MessageKind::DmList => {
                self.direct_messages = envelope.dms.clone().unwrap_or_default();
                Some(ChatUpdate::DirectMessagesReplaced(self.direct_messages.len()))
            }

            MessageKind::System => {
                let content = envelope.content.as_deref().filter(|c| !c.is_empty())?;
                let message = ChatMessage {
                    content: content.to_string(),
                    username: SYSTEM_USERNAME.to_string(),
                    timestamp: Utc::now().to_rfc3339(),
                    message_type: "system".to_string(),
                    ..Default::default()
                };
                self.messages.push(message.clone());
                Some(ChatUpdate::MessageAdded(message))
            }

            MessageKind::AuthSuccess => {
                let username = envelope
                    .username
                    .clone()
                    .or_else(|| match &self.auth {
                        AuthStatus::Pending { username } => Some(username.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                self.auth = AuthStatus::SignedIn { username };
                Some(ChatUpdate::Auth(self.auth.clone()))
            }

            MessageKind::AuthFailed => {
                let reason = envelope
                    .message
                    .clone()
                    .unwrap_or_else(|| "Authentication failed".to_string());
                self.auth = AuthStatus::Failed { reason };
                Some(ChatUpdate::Auth(self.auth.clone()))
            }

            _ => None,
        }
    }

    /// Merkt sich einen gesendeten Login-Versuch
    pub fn begin_auth(&mut self, username: &str) {
        self.auth = AuthStatus::Pending {
            username: username.to_string(),
        };
    }

    pub fn username(&self) -> Option<&str> {
        match &self.auth {
            AuthStatus::SignedIn { username } => Some(username),
            _ => None,
        }
    }

    pub fn select_server(&mut self, server_id: &str) {
        self.current_server = Some(server_id.to_string());
        self.current_channel = None;
        self.current_dm = None;
    }

    pub fn select_channel(&mut self, channel_id: &str) {
        self.current_channel = Some(channel_id.to_string());
        self.current_dm = None;
    }

    pub fn select_dm(&mut self, dm_id: &str) {
        self.current_dm = Some(dm_id.to_string());
        self.current_channel = None;
    }

    /// Kanal-Eintrag des aktuell gewählten Kanals
    pub fn selected_channel(&self) -> Option<&Channel> {
        let id = self.current_channel.as_deref()?;
        self.channels.iter().find(|c| c.channel_id == id)
    }

    /// Sucht einen Kanal über ID oder Namen
    pub fn find_channel(&self, id_or_name: &str) -> Option<&Channel> {
        self.channels
            .iter()
            .find(|c| c.channel_id == id_or_name)
            .or_else(|| self.channels.iter().find(|c| c.name == id_or_name))
    }
}

/// Übernimmt einen gültigen RFC 3339 Zeitstempel, sonst die aktuelle Zeit
fn normalize_timestamp(raw: Option<&str>) -> String {
    raw.and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc).to_rfc3339())
        .unwrap_or_else(|| Utc::now().to_rfc3339())
}
