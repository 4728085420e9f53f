//! Durable message storage seam.
//!
//! The server never touches a database directly; it goes through
//! [`MessageStore`]. [`InMemoryMessageStore`] keeps everything in process
//! and is what the dev server and the tests run against.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::ChatError;
use crate::protocol::{GroupId, Message, MessageId};

/// A previous version of an edited message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditRecord {
    pub previous_content: String,
    pub edited_at: DateTime<Utc>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message. Fails if the id is already taken.
    async fn append(&self, message: Message) -> Result<Message, ChatError>;

    /// Replace the stored copy of an existing message.
    async fn update(&self, message: &Message) -> Result<(), ChatError>;

    /// Tombstone a message and return the tombstone.
    async fn soft_delete(&self, message_id: &str) -> Result<Message, ChatError>;

    async fn fetch(&self, message_id: &str) -> Result<Option<Message>, ChatError>;

    /// Up to `limit` messages of `group_id` older than `before` (or the newest
    /// when `before` is `None`), oldest first.
    async fn fetch_page(
        &self,
        group_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>, ChatError>;
}

#[derive(Default)]
struct StoreInner {
    messages: HashMap<MessageId, Message>,
    /// Insertion order per group
    order: HashMap<GroupId, Vec<MessageId>>,
    history: HashMap<MessageId, Vec<EditRecord>>,
}

/// Process-local [`MessageStore`].
#[derive(Default)]
pub struct InMemoryMessageStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Previous versions of `message_id`, oldest first.
    pub async fn edit_history(&self, message_id: &str) -> Vec<EditRecord> {
        self.inner
            .read()
            .await
            .history
            .get(message_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(&self, message: Message) -> Result<Message, ChatError> {
        let mut inner = self.inner.write().await;
        if inner.messages.contains_key(&message.id) {
            return Err(ChatError::Store(format!("duplicate message id {}", message.id)));
        }
        inner
            .order
            .entry(message.group_id.clone())
            .or_default()
            .push(message.id.clone());
        inner.messages.insert(message.id.clone(), message.clone());
        Ok(message)
    }

    async fn update(&self, message: &Message) -> Result<(), ChatError> {
        let mut inner = self.inner.write().await;
        let StoreInner {
            messages, history, ..
        } = &mut *inner;
        let stored = messages
            .get_mut(&message.id)
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message.id)))?;

        if stored.content != message.content {
            if let Some(edited_at) = message.edited_at {
                history.entry(message.id.clone()).or_default().push(EditRecord {
                    previous_content: stored.content.clone(),
                    edited_at,
                });
            }
        }
        *stored = message.clone();
        Ok(())
    }

    async fn soft_delete(&self, message_id: &str) -> Result<Message, ChatError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .messages
            .get_mut(message_id)
            .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))?;
        stored.tombstone();
        let tombstone = stored.clone();
        inner.history.remove(message_id);
        Ok(tombstone)
    }

    async fn fetch(&self, message_id: &str) -> Result<Option<Message>, ChatError> {
        Ok(self.inner.read().await.messages.get(message_id).cloned())
    }

    async fn fetch_page(
        &self,
        group_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>, ChatError> {
        let inner = self.inner.read().await;
        let Some(order) = inner.order.get(group_id) else {
            return Ok(Vec::new());
        };
        let end = match before {
            Some(id) => order
                .iter()
                .position(|m| m == id)
                .ok_or_else(|| ChatError::NotFound(format!("message {id}")))?,
            None => order.len(),
        };
        let start = end.saturating_sub(limit);
        Ok(order[start..end]
            .iter()
            .filter_map(|id| inner.messages.get(id).cloned())
            .collect())
    }
}
