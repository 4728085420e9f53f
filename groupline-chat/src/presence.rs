//! Ephemeral typing presence.
//!
//! Server side, [`TypingTracker`] holds "who is typing where" with a TTL and
//! [`TypingService`] drives it from each group's dispatch worker, including
//! a single background sweep that turns expired entries into implicit stops.
//! Client side, [`TypingDebouncer`] turns keystrokes into at most one
//! `typing_start` per burst and a `typing_stop` after an idle period.
//!
//! Nothing here is persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::error::ChatError;
use crate::protocol::{ClientFrame, GroupId, ServerFrame, SessionId, UserId};
use crate::router::GroupRouter;

/// Per-group set of typing users with expiry.
#[derive(Debug)]
pub struct TypingTracker {
    ttl: Duration,
    groups: HashMap<GroupId, HashMap<UserId, Instant>>,
}

impl TypingTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            groups: HashMap::new(),
        }
    }

    /// Upsert the user's typing state. Returns true when the change should be
    /// broadcast: the user was not typing, or their previous state had
    /// already expired.
    pub fn start_typing(&mut self, group_id: &str, user_id: &str, now: Instant) -> bool {
        let expires_at = now + self.ttl;
        let users = self.groups.entry(group_id.to_string()).or_default();
        match users.insert(user_id.to_string(), expires_at) {
            Some(previous) => previous <= now,
            None => true,
        }
    }

    /// Returns true if the user was typing.
    pub fn stop_typing(&mut self, group_id: &str, user_id: &str) -> bool {
        let Some(users) = self.groups.get_mut(group_id) else {
            return false;
        };
        let removed = users.remove(user_id).is_some();
        if users.is_empty() {
            self.groups.remove(group_id);
        }
        removed
    }

    /// Remove and return every expired user of one group.
    pub fn sweep_group(&mut self, group_id: &str, now: Instant) -> Vec<UserId> {
        let Some(users) = self.groups.get_mut(group_id) else {
            return Vec::new();
        };
        let mut expired: Vec<UserId> = users
            .iter()
            .filter(|(_, expires_at)| **expires_at <= now)
            .map(|(user, _)| user.clone())
            .collect();
        for user in &expired {
            users.remove(user);
        }
        if users.is_empty() {
            self.groups.remove(group_id);
        }
        expired.sort();
        expired
    }

    /// Remove every expired entry across all groups.
    pub fn sweep(&mut self, now: Instant) -> Vec<(GroupId, UserId)> {
        let mut expired = Vec::new();
        for group_id in self.expired_groups(now) {
            for user in self.sweep_group(&group_id, now) {
                expired.push((group_id.clone(), user));
            }
        }
        expired
    }

    /// Groups holding at least one expired entry.
    pub fn expired_groups(&self, now: Instant) -> Vec<GroupId> {
        self.groups
            .iter()
            .filter(|(_, users)| users.values().any(|expires_at| *expires_at <= now))
            .map(|(group_id, _)| group_id.clone())
            .collect()
    }

    pub fn is_typing(&self, group_id: &str, user_id: &str, now: Instant) -> bool {
        self.groups
            .get(group_id)
            .and_then(|users| users.get(user_id))
            .is_some_and(|expires_at| *expires_at > now)
    }

    pub fn typing_users(&self, group_id: &str, now: Instant) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .groups
            .get(group_id)
            .map(|users| {
                users
                    .iter()
                    .filter(|(_, expires_at)| **expires_at > now)
                    .map(|(user, _)| user.clone())
                    .collect()
            })
            .unwrap_or_default();
        users.sort();
        users
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

/// Server-side typing presence bound to the group router.
///
/// Every tracker mutation for a group runs on that group's worker, so a
/// `typing_update` never overtakes the message or membership event that
/// caused it.
pub struct TypingService {
    tracker: Arc<Mutex<TypingTracker>>,
    router: Arc<GroupRouter>,
}

impl TypingService {
    pub fn new(ttl: Duration, router: Arc<GroupRouter>) -> Self {
        Self {
            tracker: Arc::new(Mutex::new(TypingTracker::new(ttl))),
            router,
        }
    }

    pub async fn start_typing(
        &self,
        group_id: &str,
        user_id: &str,
        origin: Option<SessionId>,
    ) -> Result<(), ChatError> {
        let tracker = self.tracker.clone();
        let router = self.router.clone();
        let (group, user) = (group_id.to_string(), user_id.to_string());
        self.router
            .dispatch(group_id, move || async move {
                let changed = tracker.lock().await.start_typing(&group, &user, Instant::now());
                if changed {
                    let frame = ServerFrame::TypingUpdate {
                        user_id: user,
                        is_typing: true,
                    };
                    router.deliver_now(&group, &frame, origin).await;
                }
            })
            .await
    }

    pub async fn stop_typing(
        &self,
        group_id: &str,
        user_id: &str,
        origin: Option<SessionId>,
    ) -> Result<(), ChatError> {
        let tracker = self.tracker.clone();
        let router = self.router.clone();
        let (group, user) = (group_id.to_string(), user_id.to_string());
        self.router
            .dispatch(group_id, move || async move {
                stop_now(&tracker, &router, &group, &user, origin).await;
            })
            .await
    }

    /// Stop from inside a job already running on `group_id`'s worker.
    pub async fn stop_typing_now(
        &self,
        group_id: &str,
        user_id: &str,
        origin: Option<SessionId>,
    ) -> bool {
        stop_now(&self.tracker, &self.router, group_id, user_id, origin).await
    }

    /// Queue a sweep job on every group holding expired entries.
    pub async fn sweep(&self) -> usize {
        let groups = self.tracker.lock().await.expired_groups(Instant::now());
        let count = groups.len();
        for group_id in groups {
            let tracker = self.tracker.clone();
            let router = self.router.clone();
            let group = group_id.clone();
            let queued = self
                .router
                .dispatch(&group_id, move || async move {
                    let expired = tracker.lock().await.sweep_group(&group, Instant::now());
                    for user_id in expired {
                        log::trace!("Typing expired for {user_id} in {group}");
                        let frame = ServerFrame::TypingUpdate {
                            user_id,
                            is_typing: false,
                        };
                        router.deliver_now(&group, &frame, None).await;
                    }
                })
                .await;
            if let Err(e) = queued {
                log::warn!("Failed to queue typing sweep for {group_id}: {e}");
            }
        }
        count
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` flips.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            log::debug!("Typing sweeper stopped");
        })
    }

    pub async fn typing_users(&self, group_id: &str) -> Vec<UserId> {
        self.tracker.lock().await.typing_users(group_id, Instant::now())
    }
}

async fn stop_now(
    tracker: &Mutex<TypingTracker>,
    router: &GroupRouter,
    group_id: &str,
    user_id: &str,
    origin: Option<SessionId>,
) -> bool {
    let was_typing = tracker.lock().await.stop_typing(group_id, user_id);
    if was_typing {
        let frame = ServerFrame::TypingUpdate {
            user_id: user_id.to_string(),
            is_typing: false,
        };
        router.deliver_now(group_id, &frame, origin).await;
    }
    was_typing
}

/// Client-side keystroke debounce.
#[derive(Debug, Clone)]
pub struct TypingDebouncer {
    idle: Duration,
    last_keystroke: Option<Instant>,
    last_start_sent: Option<Instant>,
}

impl TypingDebouncer {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            last_keystroke: None,
            last_start_sent: None,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.last_start_sent.is_some()
    }

    /// Register a keystroke. Returns `typing_start` on the first keystroke of
    /// a burst, and again every `idle` while the burst lasts so the server's
    /// TTL keeps being refreshed.
    pub fn on_keystroke(&mut self, now: Instant) -> Option<ClientFrame> {
        self.last_keystroke = Some(now);
        match self.last_start_sent {
            Some(sent) if now.duration_since(sent) < self.idle => None,
            _ => {
                self.last_start_sent = Some(now);
                Some(ClientFrame::TypingStart)
            }
        }
    }

    /// Returns `typing_stop` once the burst has been idle long enough.
    pub fn poll(&mut self, now: Instant) -> Option<ClientFrame> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        self.reset();
        Some(ClientFrame::TypingStop)
    }

    /// When [`poll`](Self::poll) should next be called.
    pub fn deadline(&self) -> Option<Instant> {
        self.last_start_sent?;
        self.last_keystroke.map(|at| at + self.idle)
    }

    /// A message was sent; the server stops typing implicitly.
    pub fn on_send(&mut self) {
        self.reset();
    }

    pub fn reset(&mut self) {
        self.last_keystroke = None;
        self.last_start_sent = None;
    }
}
