//! WebSocket chat server with per-group dispatch.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                   ┌──► Client A
//!            ├── conn worker ──► GroupRouter ──┬─┼──► Client B
//! Client B ──┘   (auth, rate     (g1 worker)   │ └──► Client C
//!                 limit, validate)      │      │
//!                                       ▼      └── SessionRegistry
//!                              MessageReconciler      (channels)
//!                                       │
//!                                       ▼
//!                                 MessageStore
//! ```
//!
//! Each connection worker owns its socket and drains one bounded outbound
//! queue, so replies and fan-out reach the client in enqueue order. Group
//! commands run as jobs on the group's worker and are awaited, so one
//! session's commands are applied in the order it sent them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::TokenIssuer;
use crate::config::{RateLimitConfig, ServerConfig};
use crate::directory::MembershipDirectory;
use crate::error::ChatError;
use crate::presence::TypingService;
use crate::protocol::{
    ClientFrame, GroupId, ServerFrame, SessionId, UserId, CLOSE_AUTH_FAILED, CLOSE_GOING_AWAY,
    CLOSE_HEARTBEAT_TIMEOUT, CLOSE_SLOW_CONSUMER,
};
use crate::reconciler::MessageReconciler;
use crate::registry::{Outbound, OutboundQueue, SessionRegistry};
use crate::router::GroupRouter;
use crate::store::MessageStore;
use crate::transport::{self, TransportEvent};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server already started")]
    AlreadyStarted,
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub active_sessions: usize,
    pub total_frames: u64,
    pub rejected_frames: u64,
    pub active_groups: usize,
    pub deliveries: u64,
    pub failed_deliveries: u64,
}

#[derive(Default)]
struct ServerCounters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_frames: AtomicU64,
    rejected_frames: AtomicU64,
}

/// Fixed-window command budget for one session.
#[derive(Debug)]
pub struct RateLimiter {
    max_commands: u32,
    window: Duration,
    window_start: Instant,
    used: u32,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            max_commands: config.max_commands,
            window: Duration::from_millis(config.window_ms),
            window_start: now,
            used: 0,
        }
    }

    /// Spend one command. On refusal returns milliseconds until the window resets.
    pub fn check(&mut self, now: Instant) -> Result<(), u64> {
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.used = 0;
        }
        if self.used >= self.max_commands {
            let reset = self.window_start + self.window;
            return Err(reset.saturating_duration_since(now).as_millis() as u64);
        }
        self.used += 1;
        Ok(())
    }
}

/// Everything a connection worker needs, shared across connections.
struct ServerContext {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    router: Arc<GroupRouter>,
    reconciler: Arc<MessageReconciler>,
    typing: Arc<TypingService>,
    counters: ServerCounters,
}

impl ServerContext {
    /// Run `job` on `group_id`'s dispatch worker and wait for it.
    async fn in_group<F, Fut>(self: &Arc<Self>, group_id: &str, job: F) -> Result<(), ChatError>
    where
        F: FnOnce(Arc<ServerContext>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), ChatError>> + Send + 'static,
    {
        let ctx = self.clone();
        self.router.run(group_id, move || job(ctx)).await?
    }

    /// Remove a session from `group_id`, telling the rest of the group.
    async fn leave(
        self: &Arc<Self>,
        session_id: SessionId,
        user_id: UserId,
        group_id: &str,
        acknowledge: bool,
    ) -> Result<(), ChatError> {
        self.in_group(group_id, move |ctx| async move {
            let Some(group) = ctx.registry.leave_group(session_id).await else {
                return Ok(());
            };
            if acknowledge {
                ctx.registry.send_to(session_id, &ServerFrame::LeftGroup).await;
            }
            ctx.departed(&group, &user_id).await;
            log::info!("{user_id} left group {group}");
            Ok(())
        })
        .await
    }

    /// Presence fallout of a session leaving `group_id`. Runs on the group's worker.
    async fn departed(&self, group_id: &str, user_id: &str) {
        let frame = ServerFrame::UserLeft {
            user_id: user_id.to_string(),
        };
        self.router.deliver_now(group_id, &frame, None).await;
        if !self.registry.user_in_group(user_id, group_id).await {
            self.typing.stop_typing_now(group_id, user_id, None).await;
        }
    }

    /// Destroy a session after its transport closed.
    async fn on_transport_close(self: &Arc<Self>, session_id: SessionId) {
        let Some(group_id) = self.registry.group_of(session_id).await else {
            self.registry.remove_session(session_id).await;
            return;
        };
        let result = self
            .in_group(&group_id, move |ctx| async move {
                if let Some(session) = ctx.registry.remove_session(session_id).await {
                    if let Some(group) = session.joined_group_id {
                        ctx.departed(&group, &session.user_id).await;
                    }
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            log::warn!("Cleanup for session {session_id} ran outside its group: {e}");
            self.registry.remove_session(session_id).await;
        }
    }
}

/// The chat server.
pub struct ChatServer {
    ctx: Arc<ServerContext>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ChatServer {
    /// Build a server around its collaborators. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: ServerConfig,
        issuer: Arc<dyn TokenIssuer>,
        directory: Arc<dyn MembershipDirectory>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(issuer, directory));
        let router = Arc::new(GroupRouter::new(
            registry.clone(),
            config.group_queue_capacity,
        ));
        let reconciler = Arc::new(MessageReconciler::new(
            store,
            config.edit_window(),
            config.send_dedupe_capacity,
        ));
        let typing = Arc::new(TypingService::new(config.typing_ttl(), router.clone()));
        let (shutdown, _) = watch::channel(false);

        Self {
            ctx: Arc::new(ServerContext {
                config,
                registry,
                router,
                reconciler,
                typing,
                counters: ServerCounters::default(),
            }),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
        }
    }

    /// Bind and spawn the accept loop, the typing sweeper and the heartbeat reaper.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Err(ServerError::AlreadyStarted);
        }

        let bind_addr = self.ctx.config.bind_addr.clone();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: bind_addr,
            source,
        })?;
        log::info!("Chat server listening on {addr}");

        tasks.push(tokio::spawn(accept_loop(
            listener,
            self.ctx.clone(),
            self.shutdown.subscribe(),
        )));
        tasks.push(self.ctx.typing.clone().spawn_sweeper(
            self.ctx.config.typing_sweep_interval(),
            self.shutdown.subscribe(),
        ));
        tasks.push(tokio::spawn(heartbeat_reaper(
            self.ctx.clone(),
            self.shutdown.subscribe(),
        )));

        *self.local_addr.lock().await = Some(addr);
        Ok(addr)
    }

    /// Start and serve until [`stop`](Self::stop) is called.
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut shutdown = self.shutdown.subscribe();
        self.start().await?;
        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Close every connection with `1001` and stop background workers.
    pub async fn stop(&self) {
        log::info!("Chat server stopping");
        self.shutdown.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                log::error!("Server task failed: {e}");
            }
        }

        let drained = tokio::time::timeout(Duration::from_secs(2), async {
            while self.ctx.counters.active_connections.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if drained.is_err() {
            log::warn!("Connections still open after shutdown grace period");
        }
        self.ctx.router.shutdown().await;
        log::info!("Chat server stopped");
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.ctx.registry
    }

    pub fn typing(&self) -> &Arc<TypingService> {
        &self.ctx.typing
    }

    pub fn reconciler(&self) -> &Arc<MessageReconciler> {
        &self.ctx.reconciler
    }

    pub async fn stats(&self) -> ServerStats {
        let counters = &self.ctx.counters;
        let router = self.ctx.router.stats().await;
        ServerStats {
            total_connections: counters.total_connections.load(Ordering::Relaxed),
            active_connections: counters.active_connections.load(Ordering::Relaxed),
            active_sessions: self.ctx.registry.session_count().await,
            total_frames: counters.total_frames.load(Ordering::Relaxed),
            rejected_frames: counters.rejected_frames.load(Ordering::Relaxed),
            active_groups: router.active_groups,
            deliveries: router.deliveries,
            failed_deliveries: router.failed_deliveries,
        }
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ServerContext>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    log::debug!("New TCP connection from {addr}");
                    let ctx = ctx.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_connection(ctx, stream, addr, shutdown).await;
                    });
                }
                Err(e) => log::error!("Accept failed: {e}"),
            },
            _ = shutdown.changed() => break,
        }
    }
    log::debug!("Accept loop stopped");
}

/// Close joined sessions that stopped sending frames.
async fn heartbeat_reaper(ctx: Arc<ServerContext>, mut shutdown: watch::Receiver<bool>) {
    let period = ctx.config.heartbeat_interval().max(Duration::from_millis(100));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for session_id in ctx.registry.stale_sessions(ctx.config.session_timeout()).await {
                    log::info!("Session {session_id} missed its heartbeat, closing");
                    ctx.registry
                        .close_session(session_id, CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout")
                        .await;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Per-connection state.
struct Connection {
    ctx: Arc<ServerContext>,
    session_id: SessionId,
    addr: SocketAddr,
    user_id: Option<UserId>,
    limiter: RateLimiter,
    outbound: OutboundQueue,
}

impl Connection {
    /// Queue a frame on this connection's own outbound queue.
    fn reply(&self, frame: &ServerFrame) {
        match frame.encode() {
            Ok(text) => {
                if self.outbound.offer(Outbound::Frame(text.into())).is_err() {
                    log::warn!("Could not queue {} for {}", frame.kind(), self.addr);
                }
            }
            Err(e) => log::error!("Failed to encode {}: {e}", frame.kind()),
        }
    }

    fn close(&self, code: u16, reason: &str) {
        let close = Outbound::Close {
            code,
            reason: reason.to_string(),
        };
        if self.outbound.offer(close).is_err() {
            log::warn!("Could not queue close for {}", self.addr);
        }
    }

    fn reject(&self, err: &ChatError) {
        self.ctx.counters.rejected_frames.fetch_add(1, Ordering::Relaxed);
        log::debug!("Rejected frame from {}: {err}", self.addr);
        self.reply(&ServerFrame::error(err));
    }

    /// Answer a decoded command with an `error` naming it, so the client can
    /// tell which of its in-flight commands failed.
    fn reject_command(&self, err: &ChatError, command: &str, temp_id: Option<String>) {
        self.ctx.counters.rejected_frames.fetch_add(1, Ordering::Relaxed);
        log::debug!("Rejected {command} from {}: {err}", self.addr);
        self.reply(&ServerFrame::rejection(err, command, temp_id));
    }

    async fn on_frame(&mut self, frame: ClientFrame) {
        self.ctx.counters.total_frames.fetch_add(1, Ordering::Relaxed);
        if self.user_id.is_some() {
            self.ctx.registry.record_activity(self.session_id).await;
        }
        let command = frame.kind();
        log::trace!("{} sent {command}", self.addr);
        let temp_id = match &frame {
            ClientFrame::SendMessage { temp_id, .. } => temp_id.clone(),
            _ => None,
        };

        if frame.is_rate_limited() {
            if let Err(retry_after_ms) = self.limiter.check(Instant::now()) {
                self.reject_command(&ChatError::RateLimited { retry_after_ms }, command, temp_id);
                return;
            }
        }
        if let Err(e) = frame.validate(&self.ctx.config.limits) {
            self.reject_command(&e, command, temp_id);
            return;
        }
        if let Err(e) = self.dispatch(frame).await {
            self.reject_command(&e, command, temp_id);
        }
    }

    fn user(&self) -> Result<UserId, ChatError> {
        self.user_id
            .clone()
            .ok_or_else(|| ChatError::NotAuthorized("authenticate first".into()))
    }

    async fn group(&self) -> Result<GroupId, ChatError> {
        self.ctx
            .registry
            .group_of(self.session_id)
            .await
            .ok_or_else(|| ChatError::NotAuthorized("join a group first".into()))
    }

    async fn dispatch(&mut self, frame: ClientFrame) -> Result<(), ChatError> {
        let session_id = self.session_id;
        match frame {
            ClientFrame::Ping => {
                self.reply(&ServerFrame::Pong);
                Ok(())
            }
            ClientFrame::Authenticate { token } => self.authenticate(&token).await,
            ClientFrame::JoinGroup { group_id } => {
                let user_id = self.user()?;
                if let Some(current) = self.ctx.registry.group_of(session_id).await {
                    if current != group_id {
                        self.ctx.leave(session_id, user_id.clone(), &current, false).await?;
                    }
                }
                self.ctx
                    .in_group(&group_id.clone(), move |ctx| async move {
                        let outcome = ctx.registry.join_group(session_id, &group_id).await?;
                        ctx.registry
                            .send_to(session_id, &ServerFrame::JoinedGroup { group_id: group_id.clone() })
                            .await;
                        if outcome.newly_joined {
                            let frame = ServerFrame::UserJoined { user_id: user_id.clone() };
                            ctx.router.deliver_now(&group_id, &frame, Some(session_id)).await;
                            log::info!("{user_id} joined group {group_id}");
                        }
                        Ok(())
                    })
                    .await
            }
            ClientFrame::LeaveGroup => {
                let user_id = self.user()?;
                match self.ctx.registry.group_of(session_id).await {
                    Some(group_id) => self.ctx.leave(session_id, user_id, &group_id, true).await,
                    None => {
                        self.reply(&ServerFrame::LeftGroup);
                        Ok(())
                    }
                }
            }
            ClientFrame::SendMessage {
                content,
                reply_to_id,
                attachments,
                temp_id,
            } => {
                let user_id = self.user()?;
                let group_id = self.group().await?;
                self.ctx
                    .in_group(&group_id.clone(), move |ctx| async move {
                        let outcome = ctx
                            .reconciler
                            .send_message(
                                &group_id,
                                &user_id,
                                content,
                                reply_to_id,
                                attachments,
                                temp_id.as_deref(),
                            )
                            .await?;
                        ctx.typing
                            .stop_typing_now(&group_id, &user_id, Some(session_id))
                            .await;
                        let frame = ServerFrame::NewMessage {
                            message: outcome.message,
                            temp_id,
                        };
                        if outcome.is_new {
                            ctx.router.deliver_now(&group_id, &frame, None).await;
                        } else {
                            ctx.registry.send_to(session_id, &frame).await;
                        }
                        Ok(())
                    })
                    .await
            }
            ClientFrame::EditMessage {
                message_id,
                content,
            } => {
                let user_id = self.user()?;
                let group_id = self.group().await?;
                self.ctx
                    .in_group(&group_id.clone(), move |ctx| async move {
                        let message = ctx
                            .reconciler
                            .edit_message(&group_id, &message_id, &user_id, content)
                            .await?;
                        let frame = ServerFrame::MessageEdited { message };
                        ctx.router.deliver_now(&group_id, &frame, None).await;
                        Ok(())
                    })
                    .await
            }
            ClientFrame::DeleteMessage { message_id } => {
                let user_id = self.user()?;
                let group_id = self.group().await?;
                self.ctx
                    .in_group(&group_id.clone(), move |ctx| async move {
                        let role = ctx.registry.role_in_group(&user_id, &group_id).await?;
                        let tombstone = ctx
                            .reconciler
                            .delete_message(&group_id, &message_id, &user_id, role)
                            .await?;
                        let frame = ServerFrame::MessageDeleted {
                            message_id: tombstone.id,
                        };
                        ctx.router.deliver_now(&group_id, &frame, None).await;
                        Ok(())
                    })
                    .await
            }
            ClientFrame::AddReaction { message_id, emoji } => {
                self.react(message_id, emoji, true).await
            }
            ClientFrame::RemoveReaction { message_id, emoji } => {
                self.react(message_id, emoji, false).await
            }
            ClientFrame::TypingStart => {
                let user_id = self.user()?;
                let group_id = self.group().await?;
                self.ctx
                    .typing
                    .start_typing(&group_id, &user_id, Some(session_id))
                    .await
            }
            ClientFrame::TypingStop => {
                let user_id = self.user()?;
                let group_id = self.group().await?;
                self.ctx
                    .typing
                    .stop_typing(&group_id, &user_id, Some(session_id))
                    .await
            }
        }
    }

    async fn authenticate(&mut self, token: &str) -> Result<(), ChatError> {
        if self.user_id.is_some() {
            return Err(ChatError::Validation("already authenticated".into()));
        }
        match self
            .ctx
            .registry
            .authenticate(self.session_id, token, self.outbound.clone())
            .await
        {
            Ok(session) => {
                log::info!("{} authenticated as {}", self.addr, session.user_id);
                self.reply(&ServerFrame::Authenticated {
                    user_id: session.user_id.clone(),
                });
                self.user_id = Some(session.user_id);
                Ok(())
            }
            Err(e) => {
                log::warn!("Authentication failed for {}: {e}", self.addr);
                self.ctx.counters.rejected_frames.fetch_add(1, Ordering::Relaxed);
                self.reply(&ServerFrame::AuthError {
                    message: e.to_string(),
                });
                self.close(CLOSE_AUTH_FAILED, "authentication failed");
                Ok(())
            }
        }
    }

    async fn react(&self, message_id: String, emoji: String, present: bool) -> Result<(), ChatError> {
        let user_id = self.user()?;
        let group_id = self.group().await?;
        self.ctx
            .in_group(&group_id.clone(), move |ctx| async move {
                let change = ctx
                    .reconciler
                    .set_reaction(&group_id, &message_id, &user_id, &emoji, present)
                    .await?;
                if let Some(change) = change {
                    ctx.router
                        .deliver_now(&group_id, &change.into_frame(), None)
                        .await;
                }
                Ok(())
            })
            .await
    }
}

/// Handle a single WebSocket connection from handshake to cleanup.
async fn handle_connection(
    ctx: Arc<ServerContext>,
    stream: TcpStream,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut tx, mut rx) = match transport::accept(stream).await {
        Ok(halves) => halves,
        Err(e) => {
            log::warn!("WebSocket handshake with {addr} failed: {e}");
            return;
        }
    };

    ctx.counters.total_connections.fetch_add(1, Ordering::Relaxed);
    ctx.counters.active_connections.fetch_add(1, Ordering::SeqCst);

    let session_id: SessionId = Uuid::new_v4();
    let (outbound, mut outbound_rx) = OutboundQueue::new(ctx.config.outbound_capacity);
    let overflow = outbound.clone();
    let mut conn = Connection {
        ctx: ctx.clone(),
        session_id,
        addr,
        user_id: None,
        limiter: RateLimiter::new(&ctx.config.rate_limit, Instant::now()),
        outbound,
    };
    log::info!("WebSocket connection established from {addr} (session {session_id})");
    conn.reply(&ServerFrame::Connected { session_id });

    let auth_deadline = tokio::time::sleep(ctx.config.auth_timeout());
    tokio::pin!(auth_deadline);

    loop {
        tokio::select! {
            biased;

            _ = overflow.overflowed() => {
                log::warn!("{addr} fell behind its outbound queue, closing for resync");
                let _ = tx.close(CLOSE_SLOW_CONSUMER, "outbound queue overflow").await;
                break;
            }

            item = outbound_rx.recv() => match item {
                Some(Outbound::Frame(text)) => {
                    if let Err(e) = tx.send_text(&text).await {
                        log::warn!("Write to {addr} failed: {e}");
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    log::info!("Closing {addr} with {code}: {reason}");
                    let _ = tx.close(code, &reason).await;
                    break;
                }
                None => break,
            },

            event = rx.recv::<ClientFrame>() => match event {
                TransportEvent::Frame(frame) => conn.on_frame(frame).await,
                TransportEvent::Malformed(reason) => {
                    conn.reject(&ChatError::Validation(format!("malformed frame: {reason}")));
                }
                TransportEvent::Closed(code) => {
                    log::info!("Connection closed from {addr} (code {code:?})");
                    break;
                }
                TransportEvent::Failed(e) => {
                    log::error!("WebSocket error from {addr}: {e}");
                    break;
                }
            },

            _ = &mut auth_deadline, if conn.user_id.is_none() => {
                log::info!("{addr} did not authenticate in time");
                let _ = tx.close(CLOSE_AUTH_FAILED, "authentication timeout").await;
                break;
            }

            _ = shutdown.changed() => {
                let _ = tx.close(CLOSE_GOING_AWAY, "server shutting down").await;
                break;
            }
        }
    }

    ctx.on_transport_close(session_id).await;
    ctx.counters.active_connections.fetch_sub(1, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenIssuer;
    use crate::directory::InMemoryDirectory;
    use crate::store::InMemoryMessageStore;

    fn server(config: ServerConfig) -> ChatServer {
        let issuer = Arc::new(StaticTokenIssuer::new(Duration::from_secs(60)));
        ChatServer::new(
            config,
            issuer,
            Arc::new(InMemoryDirectory::new()),
            Arc::new(InMemoryMessageStore::new()),
        )
    }

    fn ephemeral() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_rate_limiter_window() {
        let config = RateLimitConfig { max_commands: 3, window_ms: 1000 };
        let start = Instant::now();
        let mut limiter = RateLimiter::new(&config, start);

        for _ in 0..3 {
            assert!(limiter.check(start).is_ok());
        }
        let retry = limiter.check(start + Duration::from_millis(400)).unwrap_err();
        assert_eq!(retry, 600);

        assert!(limiter.check(start + Duration::from_millis(1000)).is_ok());
    }

    #[tokio::test]
    async fn test_stats_initial() {
        let server = server(ephemeral());
        let stats = server.stats().await;
        assert_eq!(stats, ServerStats::default());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let server = server(ephemeral());
        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr().await, Some(addr));
        assert!(matches!(server.start().await, Err(ServerError::AlreadyStarted)));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_error() {
        let server = server(ServerConfig {
            bind_addr: "not-an-address".into(),
            ..ServerConfig::default()
        });
        assert!(matches!(server.start().await, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_unauthenticated_connection_times_out() {
        let server = server(ServerConfig {
            auth_timeout_secs: 0,
            ..ephemeral()
        });
        let addr = server.start().await.unwrap();

        let (_tx, mut rx) = transport::connect(&format!("ws://{addr}"), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(matches!(
            rx.recv::<ServerFrame>().await,
            TransportEvent::Frame(ServerFrame::Connected { .. })
        ));
        let closed = tokio::time::timeout(Duration::from_secs(2), rx.recv::<ServerFrame>())
            .await
            .unwrap();
        assert_eq!(closed, TransportEvent::Closed(Some(CLOSE_AUTH_FAILED)));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_with_going_away() {
        let server = server(ephemeral());
        let addr = server.start().await.unwrap();

        let (_tx, mut rx) = transport::connect(&format!("ws://{addr}"), Duration::from_secs(2))
            .await
            .unwrap();
        rx.recv::<ServerFrame>().await;
        server.stop().await;

        let closed = tokio::time::timeout(Duration::from_secs(2), rx.recv::<ServerFrame>())
            .await
            .unwrap();
        assert_eq!(closed, TransportEvent::Closed(Some(CLOSE_GOING_AWAY)));
        assert_eq!(server.stats().await.active_connections, 0);
    }
}
