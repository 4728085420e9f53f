//! JSON wire protocol for group messaging.
//!
//! Every frame is a JSON text message with a `type` discriminator:
//! ```text
//! {"type":"send_message","content":"hello","tempId":"tmp-1"}
//!   │                     │
//!   │                     └── camelCase fields
//!   └── snake_case frame name
//! ```
//!
//! [`ClientFrame`] flows client → server, [`ServerFrame`] server → client.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::PayloadLimits;
use crate::error::{ChatError, ErrorCode};

pub type GroupId = String;
pub type UserId = String;
pub type MessageId = String;
pub type SessionId = Uuid;

/// Close code for a disconnect the client asked for. Suppresses reconnection.
pub const CLOSE_INTENTIONAL: u16 = 1000;
/// Server is shutting down.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Client gave up on a connection that stopped answering pings.
pub const CLOSE_DEAD_CONNECTION: u16 = 4000;
/// Authentication failed or never arrived.
pub const CLOSE_AUTH_FAILED: u16 = 4001;
/// Server-side heartbeat timeout.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4002;
/// Session fell behind its outbound queue and must resync.
pub const CLOSE_SLOW_CONSUMER: u16 = 4003;

/// Reference to an already-uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub url: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl AttachmentRef {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            content_type: None,
            size_bytes: None,
        }
    }
}

/// A single user's reaction with one emoji.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji: String,
    pub user_id: UserId,
}

/// Canonical chat message.
///
/// `reactions` maps emoji → set of user ids, so a user can hold at most
/// one reaction per emoji.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub group_id: GroupId,
    pub author_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub reply_to_id: Option<MessageId>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    #[serde(default)]
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
}

impl Message {
    /// Create a message with a fresh server-assigned id.
    pub fn new(
        group_id: impl Into<GroupId>,
        author_id: impl Into<UserId>,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), group_id, author_id, content, created_at)
    }

    /// Create with an explicit id (for testing and history loading)
    pub fn with_id(
        id: impl Into<MessageId>,
        group_id: impl Into<GroupId>,
        author_id: impl Into<UserId>,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            group_id: group_id.into(),
            author_id: author_id.into(),
            content: content.into(),
            created_at,
            edited_at: None,
            is_deleted: false,
            reply_to_id: None,
            attachments: Vec::new(),
            reactions: BTreeMap::new(),
        }
    }

    /// Add or remove `user_id` from `reactions[emoji]`.
    ///
    /// Returns `true` if the set changed.
    pub fn set_reaction(&mut self, user_id: &str, emoji: &str, present: bool) -> bool {
        if present {
            self.reactions
                .entry(emoji.to_string())
                .or_default()
                .insert(user_id.to_string())
        } else {
            let Some(users) = self.reactions.get_mut(emoji) else {
                return false;
            };
            let removed = users.remove(user_id);
            if users.is_empty() {
                self.reactions.remove(emoji);
            }
            removed
        }
    }

    /// Flip membership of `user_id` in `reactions[emoji]`.
    ///
    /// Returns `true` if the user now holds the reaction.
    pub fn toggle_reaction(&mut self, user_id: &str, emoji: &str) -> bool {
        let present = !self.has_reaction(user_id, emoji);
        self.set_reaction(user_id, emoji, present);
        present
    }

    pub fn has_reaction(&self, user_id: &str, emoji: &str) -> bool {
        self.reactions
            .get(emoji)
            .is_some_and(|users| users.contains(user_id))
    }

    pub fn reaction_count(&self, emoji: &str) -> usize {
        self.reactions.get(emoji).map_or(0, BTreeSet::len)
    }

    /// Turn this message into a tombstone. The id, author, timestamps and
    /// reply link survive so ordering and reply references stay intact.
    pub fn tombstone(&mut self) {
        self.is_deleted = true;
        self.content.clear();
        self.attachments.clear();
        self.reactions.clear();
    }
}

/// Client → server command frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Authenticate {
        token: String,
    },
    JoinGroup {
        group_id: GroupId,
    },
    LeaveGroup,
    SendMessage {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to_id: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<AttachmentRef>,
        /// Optimistic id chosen by the client, echoed back in `new_message`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
    },
    EditMessage {
        message_id: MessageId,
        content: String,
    },
    DeleteMessage {
        message_id: MessageId,
    },
    AddReaction {
        message_id: MessageId,
        emoji: String,
    },
    RemoveReaction {
        message_id: MessageId,
        emoji: String,
    },
    TypingStart,
    TypingStop,
    Ping,
}

impl ClientFrame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        decode_frame(text)
    }

    /// Frame name as it appears on the wire (for logging).
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Authenticate { .. } => "authenticate",
            ClientFrame::JoinGroup { .. } => "join_group",
            ClientFrame::LeaveGroup => "leave_group",
            ClientFrame::SendMessage { .. } => "send_message",
            ClientFrame::EditMessage { .. } => "edit_message",
            ClientFrame::DeleteMessage { .. } => "delete_message",
            ClientFrame::AddReaction { .. } => "add_reaction",
            ClientFrame::RemoveReaction { .. } => "remove_reaction",
            ClientFrame::TypingStart => "typing_start",
            ClientFrame::TypingStop => "typing_stop",
            ClientFrame::Ping => "ping",
        }
    }

    /// Commands that count against the per-session rate limit.
    pub fn is_rate_limited(&self) -> bool {
        !matches!(self, ClientFrame::Ping | ClientFrame::Authenticate { .. })
    }

    /// Check payload shape before the command reaches any worker.
    pub fn validate(&self, limits: &PayloadLimits) -> Result<(), ChatError> {
        match self {
            ClientFrame::Authenticate { token } => non_empty("token", token),
            ClientFrame::JoinGroup { group_id } => non_empty("groupId", group_id),
            ClientFrame::SendMessage {
                content,
                reply_to_id,
                attachments,
                temp_id,
            } => {
                validate_content(content, limits)?;
                if let Some(reply) = reply_to_id {
                    non_empty("replyToId", reply)?;
                }
                if let Some(temp) = temp_id {
                    non_empty("tempId", temp)?;
                }
                if attachments.len() > limits.max_attachments {
                    return Err(ChatError::Validation(format!(
                        "at most {} attachments allowed",
                        limits.max_attachments
                    )));
                }
                for attachment in attachments {
                    non_empty("attachment url", &attachment.url)?;
                }
                Ok(())
            }
            ClientFrame::EditMessage { message_id, content } => {
                non_empty("messageId", message_id)?;
                validate_content(content, limits)
            }
            ClientFrame::DeleteMessage { message_id } => non_empty("messageId", message_id),
            ClientFrame::AddReaction { message_id, emoji }
            | ClientFrame::RemoveReaction { message_id, emoji } => {
                non_empty("messageId", message_id)?;
                non_empty("emoji", emoji)?;
                if emoji.len() > limits.max_emoji_bytes {
                    return Err(ChatError::Validation("emoji too long".into()));
                }
                Ok(())
            }
            ClientFrame::LeaveGroup
            | ClientFrame::TypingStart
            | ClientFrame::TypingStop
            | ClientFrame::Ping => Ok(()),
        }
    }
}

fn non_empty(field: &str, value: &str) -> Result<(), ChatError> {
    if value.trim().is_empty() {
        return Err(ChatError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn validate_content(content: &str, limits: &PayloadLimits) -> Result<(), ChatError> {
    non_empty("content", content)?;
    if content.chars().count() > limits.max_content_chars {
        return Err(ChatError::Validation(format!(
            "content exceeds {} characters",
            limits.max_content_chars
        )));
    }
    Ok(())
}

/// Server → client event frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Connected {
        session_id: SessionId,
    },
    Authenticated {
        user_id: UserId,
    },
    AuthError {
        message: String,
    },
    JoinedGroup {
        group_id: GroupId,
    },
    LeftGroup,
    NewMessage {
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
    },
    MessageEdited {
        message: Message,
    },
    MessageDeleted {
        message_id: MessageId,
    },
    ReactionAdded {
        message_id: MessageId,
        reaction: Reaction,
    },
    ReactionRemoved {
        message_id: MessageId,
        emoji: String,
        user_id: UserId,
    },
    TypingUpdate {
        user_id: UserId,
        is_typing: bool,
    },
    UserJoined {
        user_id: UserId,
    },
    UserLeft {
        user_id: UserId,
    },
    Error {
        code: ErrorCode,
        message: String,
        /// Frame type of the rejected command, when one is known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        /// Echoed `tempId` of a rejected `send_message`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
    },
    Pong,
}

impl ServerFrame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        decode_frame(text)
    }

    /// Build the `error` frame for a failure not tied to a decoded command.
    pub fn error(err: &ChatError) -> Self {
        ServerFrame::Error {
            code: err.code(),
            message: err.to_string(),
            command: None,
            temp_id: None,
        }
    }

    /// Build the `error` frame answering a specific command.
    pub fn rejection(err: &ChatError, command: &str, temp_id: Option<String>) -> Self {
        ServerFrame::Error {
            code: err.code(),
            message: err.to_string(),
            command: Some(command.to_string()),
            temp_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Connected { .. } => "connected",
            ServerFrame::Authenticated { .. } => "authenticated",
            ServerFrame::AuthError { .. } => "auth_error",
            ServerFrame::JoinedGroup { .. } => "joined_group",
            ServerFrame::LeftGroup => "left_group",
            ServerFrame::NewMessage { .. } => "new_message",
            ServerFrame::MessageEdited { .. } => "message_edited",
            ServerFrame::MessageDeleted { .. } => "message_deleted",
            ServerFrame::ReactionAdded { .. } => "reaction_added",
            ServerFrame::ReactionRemoved { .. } => "reaction_removed",
            ServerFrame::TypingUpdate { .. } => "typing_update",
            ServerFrame::UserJoined { .. } => "user_joined",
            ServerFrame::UserLeft { .. } => "user_left",
            ServerFrame::Error { .. } => "error",
            ServerFrame::Pong => "pong",
        }
    }
}

fn encode_frame<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(frame).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_frame<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

/// Protocol and transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("connection closed (code {0:?})")]
    ConnectionClosed(Option<u16>),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection timeout")]
    Timeout,
}
