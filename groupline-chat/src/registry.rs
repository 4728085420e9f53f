//! Session registry: who is connected, and who receives which group's events.
//!
//! ```text
//!   sessions ── SessionId → (Session, outbound queue)
//!   by_user  ── UserId → {SessionId}        (one user, many tabs)
//!   channels ── GroupId → GroupChannel{SessionId}
//! ```
//!
//! All three maps sit behind one lock so that removing a session and its
//! channel membership happens atomically.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};

use crate::auth::TokenIssuer;
use crate::directory::{GroupRole, MembershipDirectory};
use crate::error::ChatError;
use crate::protocol::{GroupId, ProtocolError, ServerFrame, SessionId, UserId};

/// Item on a session's outbound queue, drained by its connection worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Pre-encoded JSON frame, shared across every recipient of a fan-out.
    Frame(Arc<str>),
    /// Close the socket with this code.
    Close { code: u16, reason: String },
}

/// Sending half of a session's outbound queue.
///
/// A live session whose queue fills up has missed a frame, so the first
/// failed `try_send` raises the overflow signal and the connection worker
/// closes the socket. The client then reconnects and reloads instead of
/// silently diverging.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<Outbound>,
    overflow: Arc<Notify>,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let queue = Self {
            tx,
            overflow: Arc::new(Notify::new()),
        };
        (queue, rx)
    }

    /// Enqueue without waiting. A full queue raises the overflow signal.
    pub fn offer(&self, item: Outbound) -> Result<(), TrySendError<Outbound>> {
        let result = self.tx.try_send(item);
        if let Err(TrySendError::Full(_)) = &result {
            self.overflow.notify_one();
        }
        result
    }

    /// Resolves once a frame could not be queued because the queue was full.
    pub async fn overflowed(&self) {
        self.overflow.notified().await;
    }
}

/// An authenticated connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub authenticated: bool,
    pub joined_group_id: Option<GroupId>,
    /// Refreshed on every inbound frame
    pub last_pong_at: Instant,
    pub connected_at: DateTime<Utc>,
}

/// Sessions currently subscribed to one group.
#[derive(Debug, Clone, Default)]
pub struct GroupChannel {
    pub group_id: GroupId,
    pub member_session_ids: HashSet<SessionId>,
}

/// Result of [`SessionRegistry::join_group`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Group the session was implicitly removed from, if it switched
    pub previous: Option<GroupId>,
    /// False when the session was already in this group
    pub newly_joined: bool,
    pub role: GroupRole,
}

/// Counts from one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

struct SessionEntry {
    session: Session,
    outbound: OutboundQueue,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<SessionId, SessionEntry>,
    by_user: HashMap<UserId, HashSet<SessionId>>,
    channels: HashMap<GroupId, GroupChannel>,
}

impl RegistryInner {
    /// Drop `session_id` from `group_id`'s channel, evicting the channel once empty.
    fn detach(&mut self, session_id: &SessionId, group_id: &str) {
        if let Some(channel) = self.channels.get_mut(group_id) {
            channel.member_session_ids.remove(session_id);
            if channel.member_session_ids.is_empty() {
                self.channels.remove(group_id);
                log::debug!("Evicted empty channel {group_id}");
            }
        }
    }
}

/// Single source of truth for sessions and group channels.
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
    issuer: Arc<dyn TokenIssuer>,
    directory: Arc<dyn MembershipDirectory>,
}

impl SessionRegistry {
    pub fn new(issuer: Arc<dyn TokenIssuer>, directory: Arc<dyn MembershipDirectory>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            issuer,
            directory,
        }
    }

    /// Validate `token` and register the connection as an authenticated session.
    pub async fn authenticate(
        &self,
        session_id: SessionId,
        token: &str,
        outbound: OutboundQueue,
    ) -> Result<Session, ChatError> {
        let user_id = self.issuer.validate(token).await?;

        let mut inner = self.inner.write().await;
        if inner.sessions.contains_key(&session_id) {
            return Err(ChatError::Validation("session already authenticated".into()));
        }
        let session = Session {
            session_id,
            user_id: user_id.clone(),
            authenticated: true,
            joined_group_id: None,
            last_pong_at: Instant::now(),
            connected_at: Utc::now(),
        };
        inner.sessions.insert(
            session_id,
            SessionEntry {
                session: session.clone(),
                outbound,
            },
        );
        inner.by_user.entry(user_id).or_default().insert(session_id);
        Ok(session)
    }

    /// The user's role in `group_id`, from the membership directory.
    pub async fn role_in_group(&self, user_id: &str, group_id: &str) -> Result<GroupRole, ChatError> {
        self.directory.role(user_id, group_id).await
    }

    /// Subscribe a session to `group_id` after checking membership.
    ///
    /// A session is in at most one group; joining another one leaves the
    /// previous channel first.
    pub async fn join_group(
        &self,
        session_id: SessionId,
        group_id: &str,
    ) -> Result<JoinOutcome, ChatError> {
        let user_id = self.user_of(session_id).await?;
        let role = self.directory.role(&user_id, group_id).await?;

        let mut inner = self.inner.write().await;
        let entry = inner
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| ChatError::NotAuthorized("session closed".into()))?;

        let current = entry.session.joined_group_id.clone();
        if current.as_deref() == Some(group_id) {
            return Ok(JoinOutcome {
                previous: None,
                newly_joined: false,
                role,
            });
        }
        entry.session.joined_group_id = Some(group_id.to_string());

        if let Some(previous) = &current {
            inner.detach(&session_id, previous);
        }
        inner
            .channels
            .entry(group_id.to_string())
            .or_insert_with(|| GroupChannel {
                group_id: group_id.to_string(),
                member_session_ids: HashSet::new(),
            })
            .member_session_ids
            .insert(session_id);

        Ok(JoinOutcome {
            previous: current,
            newly_joined: true,
            role,
        })
    }

    /// Remove the session from its channel. Idempotent.
    pub async fn leave_group(&self, session_id: SessionId) -> Option<GroupId> {
        let mut inner = self.inner.write().await;
        let group_id = inner
            .sessions
            .get_mut(&session_id)
            .and_then(|entry| entry.session.joined_group_id.take())?;
        inner.detach(&session_id, &group_id);
        Some(group_id)
    }

    /// Destroy a session together with its channel membership.
    pub async fn remove_session(&self, session_id: SessionId) -> Option<Session> {
        let mut inner = self.inner.write().await;
        let entry = inner.sessions.remove(&session_id)?;
        let session = entry.session;

        if let Some(ids) = inner.by_user.get_mut(&session.user_id) {
            ids.remove(&session_id);
            if ids.is_empty() {
                inner.by_user.remove(&session.user_id);
            }
        }
        if let Some(group_id) = &session.joined_group_id {
            inner.detach(&session_id, group_id);
        }
        Some(session)
    }

    /// Fan `frame` out to every session joined to `group_id`.
    ///
    /// The frame is encoded once. Delivery is best-effort: a full or closed
    /// queue counts as a failure and does not hold up other sessions.
    pub async fn deliver(
        &self,
        group_id: &str,
        frame: &ServerFrame,
        exclude: Option<SessionId>,
    ) -> Result<DeliveryReport, ProtocolError> {
        let encoded: Arc<str> = frame.encode()?.into();
        Ok(self.deliver_encoded(group_id, encoded, exclude).await)
    }

    pub async fn deliver_encoded(
        &self,
        group_id: &str,
        encoded: Arc<str>,
        exclude: Option<SessionId>,
    ) -> DeliveryReport {
        let inner = self.inner.read().await;
        let mut report = DeliveryReport::default();
        let Some(channel) = inner.channels.get(group_id) else {
            return report;
        };

        for session_id in &channel.member_session_ids {
            if Some(*session_id) == exclude {
                continue;
            }
            let Some(entry) = inner.sessions.get(session_id) else {
                continue;
            };
            match entry.outbound.offer(Outbound::Frame(encoded.clone())) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    log::warn!("Outbound queue full for session {session_id}, forcing resync");
                    report.failed += 1;
                }
                Err(TrySendError::Closed(_)) => report.failed += 1,
            }
        }
        report
    }

    /// Queue a frame for one session. Returns false if it could not be queued.
    pub async fn send_to(&self, session_id: SessionId, frame: &ServerFrame) -> bool {
        let encoded = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to encode {} frame: {e}", frame.kind());
                return false;
            }
        };
        self.push(session_id, Outbound::Frame(encoded.into())).await
    }

    /// Ask a session's connection worker to close the socket.
    pub async fn close_session(&self, session_id: SessionId, code: u16, reason: &str) -> bool {
        let close = Outbound::Close {
            code,
            reason: reason.to_string(),
        };
        self.push(session_id, close).await
    }

    async fn push(&self, session_id: SessionId, item: Outbound) -> bool {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(&session_id)
            .is_some_and(|entry| entry.outbound.offer(item).is_ok())
    }

    /// Mark the session as alive.
    pub async fn record_activity(&self, session_id: SessionId) {
        if let Some(entry) = self.inner.write().await.sessions.get_mut(&session_id) {
            entry.session.last_pong_at = Instant::now();
        }
    }

    /// Joined sessions that have been silent for longer than `timeout`.
    pub async fn stale_sessions(&self, timeout: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        self.inner
            .read()
            .await
            .sessions
            .values()
            .filter(|entry| entry.session.joined_group_id.is_some())
            .filter(|entry| now.duration_since(entry.session.last_pong_at) > timeout)
            .map(|entry| entry.session.session_id)
            .collect()
    }

    pub async fn session(&self, session_id: SessionId) -> Option<Session> {
        self.inner
            .read()
            .await
            .sessions
            .get(&session_id)
            .map(|entry| entry.session.clone())
    }

    async fn user_of(&self, session_id: SessionId) -> Result<UserId, ChatError> {
        self.session(session_id)
            .await
            .map(|s| s.user_id)
            .ok_or_else(|| ChatError::NotAuthorized("not authenticated".into()))
    }

    pub async fn group_of(&self, session_id: SessionId) -> Option<GroupId> {
        self.session(session_id).await.and_then(|s| s.joined_group_id)
    }

    pub async fn sessions_for_user(&self, user_id: &str) -> Vec<SessionId> {
        self.inner
            .read()
            .await
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether any session of `user_id` is joined to `group_id`.
    pub async fn user_in_group(&self, user_id: &str, group_id: &str) -> bool {
        let inner = self.inner.read().await;
        inner.by_user.get(user_id).is_some_and(|ids| {
            ids.iter().any(|id| {
                inner
                    .sessions
                    .get(id)
                    .is_some_and(|e| e.session.joined_group_id.as_deref() == Some(group_id))
            })
        })
    }

    pub async fn members(&self, group_id: &str) -> Vec<SessionId> {
        self.inner
            .read()
            .await
            .channels
            .get(group_id)
            .map(|c| c.member_session_ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn has_channel(&self, group_id: &str) -> bool {
        self.inner.read().await.channels.contains_key(group_id)
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn channel_count(&self) -> usize {
        self.inner.read().await.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenIssuer;
    use crate::directory::InMemoryDirectory;
    use uuid::Uuid;

    async fn registry() -> (SessionRegistry, Arc<StaticTokenIssuer>) {
        let issuer = Arc::new(StaticTokenIssuer::new(Duration::from_secs(60)));
        let directory = InMemoryDirectory::new();
        directory.add_member("g1", "alice", GroupRole::Member).await;
        directory.add_member("g1", "bob", GroupRole::Moderator).await;
        directory.add_member("g2", "alice", GroupRole::Member).await;
        let registry = SessionRegistry::new(issuer.clone(), Arc::new(directory));
        (registry, issuer)
    }

    async fn login(
        registry: &SessionRegistry,
        issuer: &StaticTokenIssuer,
        user: &str,
    ) -> (SessionId, mpsc::Receiver<Outbound>) {
        let (tx, rx) = OutboundQueue::new(8);
        let session_id = Uuid::new_v4();
        let token = issuer.issue(user).await;
        registry.authenticate(session_id, &token, tx).await.unwrap();
        (session_id, rx)
    }

    #[tokio::test]
    async fn test_authenticate_rejects_bad_token() {
        let (registry, _) = registry().await;
        let (tx, _rx) = OutboundQueue::new(8);
        let err = registry.authenticate(Uuid::new_v4(), "bogus", tx).await.unwrap_err();
        assert!(matches!(err, ChatError::Auth(_)));
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_multiple_sessions_per_user() {
        let (registry, issuer) = registry().await;
        let (tab_a, _rx_a) = login(&registry, &issuer, "alice").await;
        let (tab_b, _rx_b) = login(&registry, &issuer, "alice").await;

        let mut sessions = registry.sessions_for_user("alice").await;
        sessions.sort();
        let mut expected = vec![tab_a, tab_b];
        expected.sort();
        assert_eq!(sessions, expected);
    }

    #[tokio::test]
    async fn test_join_requires_membership() {
        let (registry, issuer) = registry().await;
        let (bob, _rx) = login(&registry, &issuer, "bob").await;

        let err = registry.join_group(bob, "g2").await.unwrap_err();
        assert!(matches!(err, ChatError::NotAuthorized(_)));
        let err = registry.join_group(bob, "missing").await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        assert!(registry.group_of(bob).await.is_none());
    }

    #[tokio::test]
    async fn test_join_switches_groups() {
        let (registry, issuer) = registry().await;
        let (alice, _rx) = login(&registry, &issuer, "alice").await;

        let first = registry.join_group(alice, "g1").await.unwrap();
        assert!(first.newly_joined);
        assert_eq!(first.previous, None);

        let again = registry.join_group(alice, "g1").await.unwrap();
        assert!(!again.newly_joined);

        let switched = registry.join_group(alice, "g2").await.unwrap();
        assert_eq!(switched.previous.as_deref(), Some("g1"));
        assert!(!registry.has_channel("g1").await);
        assert_eq!(registry.members("g2").await, vec![alice]);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let (registry, issuer) = registry().await;
        let (alice, _rx) = login(&registry, &issuer, "alice").await;
        registry.join_group(alice, "g1").await.unwrap();

        assert_eq!(registry.leave_group(alice).await.as_deref(), Some("g1"));
        assert_eq!(registry.leave_group(alice).await, None);
        assert_eq!(registry.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_session_clears_membership() {
        let (registry, issuer) = registry().await;
        let (alice, _rx_a) = login(&registry, &issuer, "alice").await;
        let (bob, _rx_b) = login(&registry, &issuer, "bob").await;
        registry.join_group(alice, "g1").await.unwrap();
        registry.join_group(bob, "g1").await.unwrap();

        let removed = registry.remove_session(alice).await.unwrap();
        assert_eq!(removed.joined_group_id.as_deref(), Some("g1"));
        assert_eq!(registry.members("g1").await, vec![bob]);
        assert!(registry.sessions_for_user("alice").await.is_empty());
        assert!(!registry.user_in_group("alice", "g1").await);
        assert!(registry.remove_session(alice).await.is_none());
    }

    #[tokio::test]
    async fn test_deliver_fans_out_with_exclusion() {
        let (registry, issuer) = registry().await;
        let (alice, mut rx_a) = login(&registry, &issuer, "alice").await;
        let (bob, mut rx_b) = login(&registry, &issuer, "bob").await;
        registry.join_group(alice, "g1").await.unwrap();
        registry.join_group(bob, "g1").await.unwrap();

        let frame = ServerFrame::UserJoined { user_id: "bob".into() };
        let report = registry.deliver("g1", &frame, Some(bob)).await.unwrap();
        assert_eq!(report, DeliveryReport { delivered: 1, failed: 0 });

        match rx_a.try_recv().unwrap() {
            Outbound::Frame(text) => assert!(text.contains("user_joined")),
            other => panic!("Expected frame, got {other:?}"),
        }
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_session_does_not_block_fan_out() {
        let (registry, issuer) = registry().await;
        let (alice, rx_a) = login(&registry, &issuer, "alice").await;
        let (bob, mut rx_b) = login(&registry, &issuer, "bob").await;
        registry.join_group(alice, "g1").await.unwrap();
        registry.join_group(bob, "g1").await.unwrap();
        drop(rx_a);

        let report = registry.deliver("g1", &ServerFrame::Pong, None).await.unwrap();
        assert_eq!(report, DeliveryReport { delivered: 1, failed: 1 });
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_full_queue_signals_overflow() {
        let (registry, issuer) = registry().await;
        let (queue, mut rx) = OutboundQueue::new(1);
        let slow = Uuid::new_v4();
        let token = issuer.issue("alice").await;
        registry.authenticate(slow, &token, queue.clone()).await.unwrap();
        registry.join_group(slow, "g1").await.unwrap();

        let first = registry.deliver("g1", &ServerFrame::Pong, None).await.unwrap();
        assert_eq!(first, DeliveryReport { delivered: 1, failed: 0 });
        let second = registry.deliver("g1", &ServerFrame::Pong, None).await.unwrap();
        assert_eq!(second, DeliveryReport { delivered: 0, failed: 1 });

        tokio::time::timeout(Duration::from_millis(100), queue.overflowed())
            .await
            .expect("overflow was not signalled");
        assert!(matches!(rx.try_recv(), Ok(Outbound::Frame(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_queue_does_not_signal_overflow() {
        let (queue, rx) = OutboundQueue::new(1);
        drop(rx);
        assert!(matches!(
            queue.offer(Outbound::Close { code: 1000, reason: String::new() }),
            Err(TrySendError::Closed(_))
        ));
        assert!(tokio::time::timeout(Duration::from_millis(20), queue.overflowed())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stale_sessions_only_counts_joined() {
        let (registry, issuer) = registry().await;
        let (alice, _rx_a) = login(&registry, &issuer, "alice").await;
        let (_bob, _rx_b) = login(&registry, &issuer, "bob").await;
        registry.join_group(alice, "g1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.stale_sessions(Duration::from_millis(5)).await, vec![alice]);

        registry.record_activity(alice).await;
        assert!(registry.stale_sessions(Duration::from_millis(5)).await.is_empty());
    }

    #[tokio::test]
    async fn test_close_session_queues_close() {
        let (registry, issuer) = registry().await;
        let (alice, mut rx) = login(&registry, &issuer, "alice").await;

        assert!(registry.close_session(alice, 4002, "heartbeat timeout").await);
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close { code: 4002, reason: "heartbeat timeout".into() }
        );
    }
}
