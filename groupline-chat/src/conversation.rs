//! Client-side mirror of one group's conversation.
//!
//! Confirmed messages (echoed by the server) and pending optimistic sends are
//! held apart and merged by key when rendered. A pending entry is replaced by
//! the server copy carrying its `tempId`, never duplicated; a `new_message`
//! whose id is already known replaces the existing entry.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ChatError;
use crate::protocol::{AttachmentRef, ClientFrame, GroupId, Message, MessageId, ServerFrame, UserId};

/// Delivery status of an optimistic send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    /// Waiting for the client to reach `Joined`
    Queued,
    /// Written to the socket, waiting for the echo
    Sent,
    /// Rejected by the server. Kept for display, never resent.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub temp_id: String,
    pub group_id: Option<GroupId>,
    pub content: String,
    pub reply_to_id: Option<MessageId>,
    pub attachments: Vec<AttachmentRef>,
    pub created_at: DateTime<Utc>,
    pub status: PendingStatus,
}

impl PendingMessage {
    pub fn to_frame(&self) -> ClientFrame {
        ClientFrame::SendMessage {
            content: self.content.clone(),
            reply_to_id: self.reply_to_id.clone(),
            attachments: self.attachments.clone(),
            temp_id: Some(self.temp_id.clone()),
        }
    }
}

/// One row of the rendered conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEntry {
    Confirmed(Message),
    Pending(PendingMessage),
}

impl ConversationEntry {
    /// Stable render key: server id, or temp id while pending.
    pub fn key(&self) -> &str {
        match self {
            ConversationEntry::Confirmed(m) => &m.id,
            ConversationEntry::Pending(p) => &p.temp_id,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            ConversationEntry::Confirmed(m) => &m.content,
            ConversationEntry::Pending(p) => &p.content,
        }
    }
}

#[derive(Debug, Default)]
pub struct Conversation {
    group_id: Option<GroupId>,
    user_id: Option<UserId>,
    confirmed: Vec<Message>,
    index: HashMap<MessageId, usize>,
    pending: VecDeque<PendingMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    pub fn set_user(&mut self, user_id: impl Into<UserId>) {
        self.user_id = Some(user_id.into());
    }

    /// Point the mirror at the group the client is joining.
    pub fn set_group(&mut self, group_id: impl Into<GroupId>) {
        self.group_id = Some(group_id.into());
    }

    /// Record an optimistic send. The returned entry renders immediately.
    pub fn begin_send(
        &mut self,
        content: impl Into<String>,
        reply_to_id: Option<MessageId>,
        attachments: Vec<AttachmentRef>,
    ) -> PendingMessage {
        let pending = PendingMessage {
            temp_id: format!("tmp-{}", Uuid::new_v4().simple()),
            group_id: self.group_id.clone(),
            content: content.into(),
            reply_to_id,
            attachments,
            created_at: Utc::now(),
            status: PendingStatus::Queued,
        };
        self.pending.push_back(pending.clone());
        pending
    }

    pub fn mark_sent(&mut self, temp_id: &str) {
        if let Some(p) = self.pending.iter_mut().find(|p| p.temp_id == temp_id) {
            p.status = PendingStatus::Sent;
        }
    }

    /// The join for `group_id` was acknowledged.
    ///
    /// Confirmed state is dropped (history is reloaded by the caller). Pending
    /// sends for this group are kept and returned for (re)transmission; the
    /// server de-duplicates by `tempId`. Pending sends for other groups are
    /// discarded.
    pub fn on_joined(&mut self, group_id: &str) -> Vec<ClientFrame> {
        self.group_id = Some(group_id.to_string());
        self.confirmed.clear();
        self.index.clear();
        self.pending
            .retain(|p| p.group_id.as_deref().map_or(true, |g| g == group_id));

        self.pending
            .iter_mut()
            .filter(|p| p.status != PendingStatus::Failed)
            .map(|p| {
                p.group_id = Some(group_id.to_string());
                p.status = PendingStatus::Sent;
                p.to_frame()
            })
            .collect()
    }

    /// Forget everything about the current group.
    pub fn leave(&mut self) {
        self.group_id = None;
        self.confirmed.clear();
        self.index.clear();
        self.pending.clear();
    }

    /// Mark a pending send as rejected. Returns false for unknown temp ids.
    pub fn fail_pending(&mut self, temp_id: &str) -> bool {
        match self.pending.iter_mut().find(|p| p.temp_id == temp_id) {
            Some(p) => {
                p.status = PendingStatus::Failed;
                true
            }
            None => false,
        }
    }

    /// Drop a pending send, e.g. once the user dismisses a failed one.
    pub fn discard_pending(&mut self, temp_id: &str) -> Option<PendingMessage> {
        let pos = self.pending.iter().position(|p| p.temp_id == temp_id)?;
        self.pending.remove(pos)
    }

    /// Apply a server event. Returns true if the visible state changed.
    pub fn apply(&mut self, frame: &ServerFrame) -> bool {
        match frame {
            ServerFrame::NewMessage { message, temp_id } => {
                if self.group_id.as_deref() != Some(message.group_id.as_str()) {
                    return false;
                }
                if let Some(temp_id) = temp_id {
                    self.discard_pending(temp_id);
                }
                self.upsert(message.clone());
                true
            }
            ServerFrame::MessageEdited { message } => match self.index.get(&message.id) {
                Some(&pos) => {
                    self.confirmed[pos] = message.clone();
                    true
                }
                None => false,
            },
            ServerFrame::MessageDeleted { message_id } => {
                self.with_message(message_id, |m| {
                    let changed = !m.is_deleted;
                    m.tombstone();
                    changed
                })
            }
            ServerFrame::ReactionAdded {
                message_id,
                reaction,
            } => self.with_message(message_id, |m| {
                m.set_reaction(&reaction.user_id, &reaction.emoji, true)
            }),
            ServerFrame::ReactionRemoved {
                message_id,
                emoji,
                user_id,
            } => self.with_message(message_id, |m| m.set_reaction(user_id, emoji, false)),
            ServerFrame::Error {
                temp_id: Some(temp_id),
                ..
            } => self.fail_pending(temp_id),
            _ => false,
        }
    }

    fn with_message(&mut self, message_id: &str, f: impl FnOnce(&mut Message) -> bool) -> bool {
        match self.index.get(message_id) {
            Some(&pos) => f(&mut self.confirmed[pos]),
            None => false,
        }
    }

    fn upsert(&mut self, message: Message) {
        let existing = self.index.get(&message.id).copied();
        match existing {
            Some(pos) => self.confirmed[pos] = message,
            None => {
                self.index.insert(message.id.clone(), self.confirmed.len());
                self.confirmed.push(message);
            }
        }
    }

    /// Merge an older page in front of the confirmed list, skipping ids
    /// already present.
    pub fn load_history(&mut self, page: Vec<Message>) -> usize {
        let group = self.group_id.clone();
        let older: Vec<Message> = page
            .into_iter()
            .filter(|m| group.as_deref() == Some(m.group_id.as_str()))
            .filter(|m| !self.index.contains_key(&m.id))
            .collect();
        let added = older.len();
        if added == 0 {
            return 0;
        }
        let mut merged = older;
        merged.append(&mut self.confirmed);
        self.confirmed = merged;
        self.reindex();
        added
    }

    fn reindex(&mut self) {
        self.index = self
            .confirmed
            .iter()
            .enumerate()
            .map(|(pos, m)| (m.id.clone(), pos))
            .collect();
    }

    pub fn get(&self, message_id: &str) -> Option<&Message> {
        self.index.get(message_id).map(|&pos| &self.confirmed[pos])
    }

    pub fn messages(&self) -> &[Message] {
        &self.confirmed
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingMessage> {
        self.pending.iter()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Confirmed messages followed by pending sends, in send order.
    pub fn entries(&self) -> Vec<ConversationEntry> {
        self.confirmed
            .iter()
            .cloned()
            .map(ConversationEntry::Confirmed)
            .chain(self.pending.iter().cloned().map(ConversationEntry::Pending))
            .collect()
    }

    fn live(&self, message_id: &str) -> Result<&Message, ChatError> {
        self.get(message_id)
            .filter(|m| !m.is_deleted)
            .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))
    }

    /// Resolve a reaction click into an add or remove intent from confirmed state.
    pub fn reaction_frame(&self, message_id: &str, emoji: &str) -> Result<ClientFrame, ChatError> {
        let message = self.live(message_id)?;
        let user_id = self
            .user_id
            .as_deref()
            .ok_or_else(|| ChatError::NotAuthorized("not authenticated".into()))?;

        let frame = if message.has_reaction(user_id, emoji) {
            ClientFrame::RemoveReaction {
                message_id: message_id.to_string(),
                emoji: emoji.to_string(),
            }
        } else {
            ClientFrame::AddReaction {
                message_id: message_id.to_string(),
                emoji: emoji.to_string(),
            }
        };
        Ok(frame)
    }

    pub fn edit_frame(&self, message_id: &str, content: impl Into<String>) -> Result<ClientFrame, ChatError> {
        self.live(message_id)?;
        Ok(ClientFrame::EditMessage {
            message_id: message_id.to_string(),
            content: content.into(),
        })
    }

    pub fn delete_frame(&self, message_id: &str) -> Result<ClientFrame, ChatError> {
        self.live(message_id)?;
        Ok(ClientFrame::DeleteMessage {
            message_id: message_id.to_string(),
        })
    }
}
