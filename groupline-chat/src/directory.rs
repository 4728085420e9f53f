//! Group membership lookups.
//!
//! Who belongs to which group is owned by an external service; the core only
//! asks for a user's role when joining a channel or deleting someone else's
//! message.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::ChatError;
use crate::protocol::{GroupId, UserId};

/// Role a user holds inside a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupRole {
    Member,
    Moderator,
    Admin,
    Owner,
}

impl GroupRole {
    /// Moderators and above may delete other members' messages.
    pub fn is_elevated(self) -> bool {
        self >= GroupRole::Moderator
    }
}

#[async_trait]
pub trait MembershipDirectory: Send + Sync {
    /// The user's role in `group_id`.
    ///
    /// `NotFound` if the group does not exist, `NotAuthorized` if the user is
    /// not a member.
    async fn role(&self, user_id: &str, group_id: &str) -> Result<GroupRole, ChatError>;
}

/// In-memory membership table.
#[derive(Default)]
pub struct InMemoryDirectory {
    groups: RwLock<HashMap<GroupId, HashMap<UserId, GroupRole>>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a roster map; every listed user becomes a plain member.
    pub fn from_rosters(rosters: &HashMap<GroupId, Vec<UserId>>) -> Self {
        let groups = rosters
            .iter()
            .map(|(group_id, users)| {
                let members = users
                    .iter()
                    .map(|user| (user.clone(), GroupRole::Member))
                    .collect();
                (group_id.clone(), members)
            })
            .collect();
        Self {
            groups: RwLock::new(groups),
        }
    }

    pub async fn create_group(&self, group_id: impl Into<GroupId>) {
        self.groups.write().await.entry(group_id.into()).or_default();
    }

    /// Add or update a member. Creates the group if needed.
    pub async fn add_member(
        &self,
        group_id: impl Into<GroupId>,
        user_id: impl Into<UserId>,
        role: GroupRole,
    ) {
        self.groups
            .write()
            .await
            .entry(group_id.into())
            .or_default()
            .insert(user_id.into(), role);
    }

    pub async fn remove_member(&self, group_id: &str, user_id: &str) -> bool {
        self.groups
            .write()
            .await
            .get_mut(group_id)
            .is_some_and(|members| members.remove(user_id).is_some())
    }

    pub async fn remove_group(&self, group_id: &str) -> bool {
        self.groups.write().await.remove(group_id).is_some()
    }
}

#[async_trait]
impl MembershipDirectory for InMemoryDirectory {
    async fn role(&self, user_id: &str, group_id: &str) -> Result<GroupRole, ChatError> {
        let groups = self.groups.read().await;
        let members = groups
            .get(group_id)
            .ok_or_else(|| ChatError::NotFound(format!("group {group_id}")))?;
        members.get(user_id).copied().ok_or_else(|| {
            ChatError::NotAuthorized(format!("{user_id} is not a member of {group_id}"))
        })
    }
}
