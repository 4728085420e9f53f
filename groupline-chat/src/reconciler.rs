//! Server-side message mutations.
//!
//! Validates send/edit/delete/react commands against the store and returns
//! the canonical result for broadcast. Callers run these on the group's
//! dispatch worker, so mutations of one group never interleave.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::directory::GroupRole;
use crate::error::ChatError;
use crate::protocol::{AttachmentRef, GroupId, Message, MessageId, Reaction, ServerFrame, UserId};
use crate::store::MessageStore;

/// Net effect of a reaction command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionChange {
    Added {
        message_id: MessageId,
        reaction: Reaction,
    },
    Removed {
        message_id: MessageId,
        emoji: String,
        user_id: UserId,
    },
}

impl ReactionChange {
    pub fn into_frame(self) -> ServerFrame {
        match self {
            ReactionChange::Added {
                message_id,
                reaction,
            } => ServerFrame::ReactionAdded {
                message_id,
                reaction,
            },
            ReactionChange::Removed {
                message_id,
                emoji,
                user_id,
            } => ServerFrame::ReactionRemoved {
                message_id,
                emoji,
                user_id,
            },
        }
    }
}

/// Outcome of [`MessageReconciler::send_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub message: Message,
    /// False when this was a retransmission of an already stored message
    pub is_new: bool,
}

type SendKey = (GroupId, UserId, String);

/// Bounded memory of recent `(group, author, tempId) → message id` pairs.
struct RecentSends {
    capacity: usize,
    ids: HashMap<SendKey, MessageId>,
    order: VecDeque<SendKey>,
}

impl RecentSends {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ids: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &SendKey) -> Option<&MessageId> {
        self.ids.get(key)
    }

    fn remember(&mut self, key: SendKey, message_id: MessageId) {
        if self.capacity == 0 {
            return;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.ids.insert(key, message_id);
    }
}

pub struct MessageReconciler {
    store: Arc<dyn MessageStore>,
    edit_window: chrono::Duration,
    recent_sends: Mutex<RecentSends>,
}

impl MessageReconciler {
    pub fn new(
        store: Arc<dyn MessageStore>,
        edit_window: chrono::Duration,
        dedupe_capacity: usize,
    ) -> Self {
        Self {
            store,
            edit_window,
            recent_sends: Mutex::new(RecentSends::new(dedupe_capacity)),
        }
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Fetch a live message of `group_id`. Other groups' ids and tombstones
    /// are `NotFound`.
    async fn live_message(&self, group_id: &str, message_id: &str) -> Result<Message, ChatError> {
        match self.store.fetch(message_id).await? {
            Some(message) if message.group_id == group_id && !message.is_deleted => Ok(message),
            _ => Err(ChatError::NotFound(format!("message {message_id}"))),
        }
    }

    /// Store a new message. A repeated `temp_id` from the same author
    /// returns the message stored the first time.
    pub async fn send_message(
        &self,
        group_id: &str,
        author_id: &str,
        content: String,
        reply_to_id: Option<MessageId>,
        attachments: Vec<AttachmentRef>,
        temp_id: Option<&str>,
    ) -> Result<SendOutcome, ChatError> {
        let key = temp_id.map(|t| (group_id.to_string(), author_id.to_string(), t.to_string()));

        if let Some(key) = &key {
            let known = self.recent_sends.lock().await.get(key).cloned();
            if let Some(message_id) = known {
                if let Some(message) = self.store.fetch(&message_id).await? {
                    log::debug!("Duplicate send {} from {author_id} in {group_id}", key.2);
                    return Ok(SendOutcome {
                        message,
                        is_new: false,
                    });
                }
            }
        }

        if let Some(reply) = &reply_to_id {
            match self.store.fetch(reply).await? {
                Some(parent) if parent.group_id == group_id => {}
                _ => return Err(ChatError::NotFound(format!("reply target {reply}"))),
            }
        }

        let mut message = Message::new(group_id, author_id, content, Utc::now());
        message.reply_to_id = reply_to_id;
        message.attachments = attachments;
        let message = self.store.append(message).await?;

        if let Some(key) = key {
            self.recent_sends
                .lock()
                .await
                .remember(key, message.id.clone());
        }
        Ok(SendOutcome {
            message,
            is_new: true,
        })
    }

    pub async fn edit_message(
        &self,
        group_id: &str,
        message_id: &str,
        author_id: &str,
        content: String,
    ) -> Result<Message, ChatError> {
        self.edit_message_at(group_id, message_id, author_id, content, Utc::now())
            .await
    }

    /// Edit as of `now`. Only the author may edit, and only inside the edit window.
    pub async fn edit_message_at(
        &self,
        group_id: &str,
        message_id: &str,
        author_id: &str,
        content: String,
        now: DateTime<Utc>,
    ) -> Result<Message, ChatError> {
        let mut message = self.live_message(group_id, message_id).await?;
        if message.author_id != author_id {
            return Err(ChatError::NotAuthorized(
                "only the author can edit a message".into(),
            ));
        }
        if now - message.created_at > self.edit_window {
            return Err(ChatError::Expired(message_id.to_string()));
        }

        message.content = content;
        message.edited_at = Some(now);
        self.store.update(&message).await?;
        Ok(message)
    }

    /// Soft-delete. The author or an elevated role may delete.
    pub async fn delete_message(
        &self,
        group_id: &str,
        message_id: &str,
        actor_id: &str,
        actor_role: GroupRole,
    ) -> Result<Message, ChatError> {
        let message = self.live_message(group_id, message_id).await?;
        if message.author_id != actor_id && !actor_role.is_elevated() {
            return Err(ChatError::NotAuthorized(
                "only the author or a moderator can delete a message".into(),
            ));
        }
        self.store.soft_delete(message_id).await
    }

    /// Apply an explicit add/remove intent. Returns `None` if nothing changed,
    /// which is what a retried command produces.
    pub async fn set_reaction(
        &self,
        group_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
        present: bool,
    ) -> Result<Option<ReactionChange>, ChatError> {
        let mut message = self.live_message(group_id, message_id).await?;
        if !message.set_reaction(user_id, emoji, present) {
            return Ok(None);
        }
        self.store.update(&message).await?;

        let change = if present {
            ReactionChange::Added {
                message_id: message.id,
                reaction: Reaction {
                    emoji: emoji.to_string(),
                    user_id: user_id.to_string(),
                },
            }
        } else {
            ReactionChange::Removed {
                message_id: message.id,
                emoji: emoji.to_string(),
                user_id: user_id.to_string(),
            }
        };
        Ok(Some(change))
    }

    /// Flip the user's reaction based on the stored state.
    pub async fn toggle_reaction(
        &self,
        group_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<ReactionChange, ChatError> {
        let message = self.live_message(group_id, message_id).await?;
        let present = !message.has_reaction(user_id, emoji);
        self.set_reaction(group_id, message_id, user_id, emoji, present)
            .await?
            .ok_or_else(|| ChatError::Store(format!("reaction on {message_id} did not change")))
    }
}
