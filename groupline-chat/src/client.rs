//! Group chat client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, automatic reconnect + rejoin)
//! - Optimistic sends that survive disconnects
//! - Edit/delete/react commands confirmed by the server
//! - Debounced typing notifications
//!
//! A single driver task owns the socket, the [`ConnectionMachine`] and all
//! timers. The [`ChatClient`] handle only sends it commands, so nothing the
//! application calls ever blocks on the network.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;

use crate::auth::TokenSource;
use crate::config::{ClientConfig, PayloadLimits};
use crate::conversation::{Conversation, ConversationEntry, PendingMessage};
use crate::error::ChatError;
use crate::machine::{ClientEvent, ConnectionMachine, ConnectionState, Effect, MachineEvent};
use crate::presence::TypingDebouncer;
use crate::protocol::{AttachmentRef, ClientFrame, Message, MessageId, ProtocolError, ServerFrame};
use crate::transport::{self, ClientSocket, FrameReceiver, FrameSender, TransportEvent};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type Socket = (FrameSender<ClientSocket>, FrameReceiver<ClientSocket>);
type Reply = oneshot::Sender<Result<(), ChatError>>;

enum Command {
    Connect,
    Disconnect,
    JoinGroup { group_id: String, reply: Reply },
    LeaveGroup { reply: Reply },
    /// A pending send was recorded in the conversation
    Send { temp_id: String },
    /// Edit, delete or reaction: only valid while joined
    Mutate { frame: ClientFrame, reply: Reply },
    Keystroke,
}

/// Handle to a running client.
///
/// Dropping the handle stops the driver and closes the socket with the
/// intentional close code.
pub struct ChatClient {
    commands: mpsc::Sender<Command>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    state: watch::Receiver<ConnectionState>,
    conversation: Arc<RwLock<Conversation>>,
    limits: PayloadLimits,
    task: JoinHandle<()>,
}

impl ChatClient {
    /// Spawn the driver task. Call [`connect`](Self::connect) to go online.
    pub fn spawn(config: ClientConfig, tokens: Arc<dyn TokenSource>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let conversation = Arc::new(RwLock::new(Conversation::new()));

        let driver = Driver {
            machine: ConnectionMachine::new(config.reconnect.clone()),
            debouncer: TypingDebouncer::new(config.typing_idle),
            config,
            tokens,
            conversation: conversation.clone(),
            events: event_tx,
            state: state_tx,
            sender: None,
            receiver: None,
            opening: None,
            token: None,
            ping_at: None,
            pong_deadline: None,
            retry_at: None,
        };
        let task = tokio::spawn(driver.run(command_rx));

        Self {
            commands: command_tx,
            event_rx: Some(event_rx),
            state: state_rx,
            conversation,
            limits: PayloadLimits::default(),
            task,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the client reaches `target`.
    pub async fn wait_for_state(
        &self,
        target: ConnectionState,
        timeout: Duration,
    ) -> Result<(), ChatError> {
        let mut state = self.state.clone();
        let outcome = tokio::time::timeout(timeout, state.wait_for(|s| *s == target))
            .await
            .map(|waited| waited.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ChatError::Connection("client stopped".into())),
            Err(_) => Err(ChatError::Connection(format!(
                "timed out waiting for {target:?}"
            ))),
        }
    }

    async fn command(&self, command: Command) -> Result<(), ChatError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ChatError::Connection("client stopped".into()))
    }

    async fn request(&self, build: impl FnOnce(Reply) -> Command) -> Result<(), ChatError> {
        let (tx, rx) = oneshot::channel();
        self.command(build(tx)).await?;
        rx.await
            .map_err(|_| ChatError::Connection("client stopped".into()))?
    }

    pub async fn connect(&self) -> Result<(), ChatError> {
        self.command(Command::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), ChatError> {
        self.command(Command::Disconnect).await
    }

    /// Ask to join `group_id`. Completion is reported as [`ClientEvent::Joined`].
    pub async fn join_group(&self, group_id: impl Into<String>) -> Result<(), ChatError> {
        let group_id = group_id.into();
        self.request(|reply| Command::JoinGroup { group_id, reply })
            .await
    }

    pub async fn leave_group(&self) -> Result<(), ChatError> {
        self.request(|reply| Command::LeaveGroup { reply }).await
    }

    /// Send a message optimistically. The returned entry is visible
    /// immediately; it is transmitted now if joined, or queued until the
    /// client next reaches `Joined`.
    pub async fn send_message(
        &self,
        content: impl Into<String>,
        reply_to_id: Option<MessageId>,
        attachments: Vec<AttachmentRef>,
    ) -> Result<PendingMessage, ChatError> {
        let content = content.into();
        let check = ClientFrame::SendMessage {
            content: content.clone(),
            reply_to_id: reply_to_id.clone(),
            attachments: attachments.clone(),
            temp_id: None,
        };
        check.validate(&self.limits)?;

        let pending = self
            .conversation
            .write()
            .await
            .begin_send(content, reply_to_id, attachments);
        self.command(Command::Send {
            temp_id: pending.temp_id.clone(),
        })
        .await?;
        Ok(pending)
    }

    pub async fn edit_message(&self, message_id: &str, content: impl Into<String>) -> Result<(), ChatError> {
        let frame = self.conversation.read().await.edit_frame(message_id, content)?;
        frame.validate(&self.limits)?;
        self.request(|reply| Command::Mutate { frame, reply }).await
    }

    pub async fn delete_message(&self, message_id: &str) -> Result<(), ChatError> {
        let frame = self.conversation.read().await.delete_frame(message_id)?;
        self.request(|reply| Command::Mutate { frame, reply }).await
    }

    /// Flip the local user's reaction, resolved against confirmed state.
    pub async fn toggle_reaction(&self, message_id: &str, emoji: &str) -> Result<(), ChatError> {
        let frame = self.conversation.read().await.reaction_frame(message_id, emoji)?;
        frame.validate(&self.limits)?;
        self.request(|reply| Command::Mutate { frame, reply }).await
    }

    /// Report a keystroke in the composer.
    pub async fn notify_typing(&self) -> Result<(), ChatError> {
        self.command(Command::Keystroke).await
    }

    /// Confirmed messages followed by pending sends.
    pub async fn entries(&self) -> Vec<ConversationEntry> {
        self.conversation.read().await.entries()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.conversation.read().await.messages().to_vec()
    }

    /// Merge an older history page fetched out of band.
    pub async fn merge_history(&self, page: Vec<Message>) -> usize {
        self.conversation.write().await.load_history(page)
    }

    /// Dismiss a failed (or still pending) send from the conversation.
    pub async fn discard_pending(&self, temp_id: &str) -> Option<PendingMessage> {
        self.conversation.write().await.discard_pending(temp_id)
    }

    /// Disconnect and wait for the driver to stop.
    pub async fn shutdown(self) {
        let ChatClient { commands, task, .. } = self;
        drop(commands);
        if let Err(e) = task.await {
            log::error!("Client driver panicked: {e}");
        }
    }
}

/// What woke the driver.
enum Wake {
    Command(Option<Command>),
    Opened(Result<Socket, ProtocolError>),
    Token(Result<String, ChatError>),
    Transport(TransportEvent<ServerFrame>),
    PingDue,
    PongOverdue,
    RetryDue,
    TypingIdle,
}

struct Driver {
    config: ClientConfig,
    tokens: Arc<dyn TokenSource>,
    machine: ConnectionMachine,
    conversation: Arc<RwLock<Conversation>>,
    debouncer: TypingDebouncer,
    events: mpsc::Sender<ClientEvent>,
    state: watch::Sender<ConnectionState>,
    sender: Option<FrameSender<ClientSocket>>,
    receiver: Option<FrameReceiver<ClientSocket>>,
    opening: Option<BoxFuture<Result<Socket, ProtocolError>>>,
    token: Option<BoxFuture<Result<String, ChatError>>>,
    ping_at: Option<Instant>,
    pong_deadline: Option<Instant>,
    retry_at: Option<Instant>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                result = poll_opt(&mut self.opening) => Wake::Opened(result),
                result = poll_opt(&mut self.token) => Wake::Token(result),
                event = recv_opt(&mut self.receiver) => Wake::Transport(event),
                _ = sleep_opt(self.ping_at) => Wake::PingDue,
                _ = sleep_opt(self.pong_deadline) => Wake::PongOverdue,
                _ = sleep_opt(self.retry_at) => Wake::RetryDue,
                _ = sleep_opt(self.debouncer.deadline()) => Wake::TypingIdle,
            };

            match wake {
                Wake::Command(Some(command)) => self.on_command(command).await,
                Wake::Command(None) => {
                    let effects = self.machine.disconnect();
                    self.perform(effects).await;
                    break;
                }
                Wake::Opened(result) => {
                    self.opening = None;
                    let event = match result {
                        Ok((sender, receiver)) => {
                            self.sender = Some(sender);
                            self.receiver = Some(receiver);
                            MachineEvent::TransportOpened
                        }
                        Err(e) => MachineEvent::OpenFailed(e.to_string()),
                    };
                    self.feed(event).await;
                }
                Wake::Token(result) => {
                    self.token = None;
                    let event = match result {
                        Ok(token) => MachineEvent::TokenFetched(token),
                        Err(e) => MachineEvent::TokenFailed(e),
                    };
                    self.feed(event).await;
                }
                Wake::Transport(event) => self.on_transport(event).await,
                Wake::PingDue => {
                    self.ping_at = None;
                    self.feed(MachineEvent::PingTimerFired).await;
                }
                Wake::PongOverdue => {
                    self.pong_deadline = None;
                    self.feed(MachineEvent::PongDeadlineElapsed).await;
                }
                Wake::RetryDue => {
                    self.retry_at = None;
                    self.feed(MachineEvent::RetryTimerFired).await;
                }
                Wake::TypingIdle => {
                    if let Some(frame) = self.debouncer.poll(Instant::now()) {
                        if self.machine.can_send() {
                            self.perform(vec![Effect::Send(frame)]).await;
                        }
                    }
                }
            }
        }
        log::debug!("Client driver stopped");
    }

    async fn on_transport(&mut self, event: TransportEvent<ServerFrame>) {
        match event {
            TransportEvent::Frame(frame) => {
                log::trace!("Received {}", frame.kind());
                self.feed(MachineEvent::Frame(frame)).await;
            }
            TransportEvent::Malformed(reason) => {
                log::warn!("Ignoring malformed server frame: {reason}");
            }
            TransportEvent::Closed(code) => {
                self.drop_socket();
                self.feed(MachineEvent::TransportClosed { code }).await;
            }
            TransportEvent::Failed(reason) => {
                self.drop_socket();
                self.feed(MachineEvent::TransportError(reason)).await;
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                let effects = self.machine.connect();
                self.perform(effects).await;
            }
            Command::Disconnect => {
                self.debouncer.reset();
                let effects = self.machine.disconnect();
                self.perform(effects).await;
            }
            Command::JoinGroup { group_id, reply } => match self.machine.join_group(&group_id) {
                Ok(effects) => {
                    self.conversation.write().await.set_group(group_id);
                    self.debouncer.reset();
                    let _ = reply.send(Ok(()));
                    self.perform(effects).await;
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::LeaveGroup { reply } => match self.machine.leave_group() {
                Ok(effects) => {
                    let _ = reply.send(Ok(()));
                    self.perform(effects).await;
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Send { temp_id } => {
                if !self.machine.can_send() {
                    log::debug!("Queued {temp_id} until joined");
                    return;
                }
                let frame = {
                    let mut conversation = self.conversation.write().await;
                    let frame = conversation
                        .pending()
                        .find(|p| p.temp_id == temp_id)
                        .map(PendingMessage::to_frame);
                    conversation.mark_sent(&temp_id);
                    frame
                };
                if let Some(frame) = frame {
                    self.debouncer.on_send();
                    self.perform(vec![Effect::Send(frame)]).await;
                }
            }
            Command::Mutate { frame, reply } => {
                if !self.machine.can_send() {
                    let _ = reply.send(Err(ChatError::Connection("not joined to a group".into())));
                    return;
                }
                let _ = reply.send(Ok(()));
                self.perform(vec![Effect::Send(frame)]).await;
            }
            Command::Keystroke => {
                if !self.machine.can_send() {
                    return;
                }
                if let Some(frame) = self.debouncer.on_keystroke(Instant::now()) {
                    self.perform(vec![Effect::Send(frame)]).await;
                }
            }
        }
    }

    async fn feed(&mut self, event: MachineEvent) {
        let effects = self.machine.on_event(event);
        self.perform(effects).await;
    }

    fn drop_socket(&mut self) {
        self.sender = None;
        self.receiver = None;
    }

    /// Execute effects in order. Effects can produce more effects (a failed
    /// write feeds a transport error back into the machine).
    async fn perform(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::OpenTransport => {
                    let url = self.config.server_url.clone();
                    let timeout = self.config.connect_timeout;
                    log::info!("Connecting to {url}");
                    self.opening = Some(Box::pin(async move { transport::connect(&url, timeout).await }));
                }
                Effect::FetchToken => {
                    let tokens = self.tokens.clone();
                    self.token = Some(Box::pin(async move { tokens.fetch_token().await }));
                }
                Effect::Send(frame) => {
                    let Some(sender) = self.sender.as_mut() else {
                        log::debug!("Dropping {} frame: no transport", frame.kind());
                        continue;
                    };
                    if let Err(e) = sender.send(&frame).await {
                        self.drop_socket();
                        queue.extend(self.machine.on_event(MachineEvent::TransportError(e.to_string())));
                    }
                }
                Effect::CloseTransport { code } => {
                    if let Some(mut sender) = self.sender.take() {
                        if let Err(e) = sender.close(code, "client closing").await {
                            log::debug!("Close frame not delivered: {e}");
                        }
                    }
                    self.receiver = None;
                    self.opening = None;
                    self.token = None;
                }
                Effect::SchedulePing(after) => self.ping_at = Some(Instant::now() + after),
                Effect::CancelPing => self.ping_at = None,
                Effect::SchedulePongDeadline(after) => {
                    self.pong_deadline = Some(Instant::now() + after)
                }
                Effect::CancelPongDeadline => self.pong_deadline = None,
                Effect::ScheduleRetry(after) => self.retry_at = Some(Instant::now() + after),
                Effect::CancelRetry => self.retry_at = None,
                Effect::Emit(event) => {
                    queue.extend(self.observe(&event).await);
                    if let Err(e) = self.events.try_send(event) {
                        log::warn!("Dropping client event: {e}");
                    }
                }
            }
        }
    }

    /// Keep the conversation mirror and the state watch in step with events.
    async fn observe(&mut self, event: &ClientEvent) -> Vec<Effect> {
        match event {
            ClientEvent::StateChanged(state) => {
                self.state.send_replace(*state);
                Vec::new()
            }
            ClientEvent::Authenticated { user_id } => {
                self.conversation.write().await.set_user(user_id.clone());
                Vec::new()
            }
            ClientEvent::Joined { group_id } => {
                log::info!("Joined group {group_id}");
                self.debouncer.reset();
                let resend = self.conversation.write().await.on_joined(group_id);
                resend.into_iter().map(Effect::Send).collect()
            }
            ClientEvent::Left => {
                self.debouncer.reset();
                self.conversation.write().await.leave();
                Vec::new()
            }
            ClientEvent::Frame(frame) => {
                self.conversation.write().await.apply(frame);
                Vec::new()
            }
            ClientEvent::Reconnecting { attempt, delay } => {
                log::info!("Reconnecting in {delay:?} (attempt {attempt})");
                Vec::new()
            }
            ClientEvent::CommandFailed(err) => {
                log::warn!("Command rejected: {err}");
                Vec::new()
            }
            ClientEvent::SendFailed { temp_id, error } => {
                log::warn!("Send {temp_id} rejected: {error}");
                self.conversation.write().await.fail_pending(temp_id);
                Vec::new()
            }
            ClientEvent::Fatal(_) => Vec::new(),
        }
    }
}

async fn poll_opt<T>(fut: &mut Option<BoxFuture<T>>) -> T {
    match fut {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn recv_opt(
    receiver: &mut Option<FrameReceiver<ClientSocket>>,
) -> TransportEvent<ServerFrame> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::FixedTokenSource;
    use tokio::net::TcpListener;

    fn client(url: &str) -> ChatClient {
        let mut config = ClientConfig::new(url);
        config.reconnect.base_delay = Duration::from_millis(20);
        config.reconnect.max_delay = Duration::from_millis(40);
        config.reconnect.max_attempts = 2;
        ChatClient::spawn(config, Arc::new(FixedTokenSource("t".into())))
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = client("ws://127.0.0.1:1");
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let mut client = client("ws://127.0.0.1:1");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_queued() {
        let client = client("ws://127.0.0.1:1");
        let pending = client.send_message("hello", None, Vec::new()).await.unwrap();

        let entries = client.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key(), pending.temp_id);
        assert!(pending.temp_id.starts_with("tmp-"));
    }

    #[tokio::test]
    async fn test_send_rejects_blank_content() {
        let client = client("ws://127.0.0.1:1");
        let err = client.send_message("  ", None, Vec::new()).await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
        assert!(client.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_merge_history_dedupes_across_pages() {
        let client = client("ws://127.0.0.1:1");
        client.conversation.write().await.on_joined("g1");

        let now = chrono::Utc::now();
        let first = vec![
            Message::with_id("m-2", "g1", "bob", "two", now),
            Message::with_id("m-3", "g1", "bob", "three", now),
        ];
        assert_eq!(client.merge_history(first).await, 2);

        let overlapping = vec![
            Message::with_id("m-1", "g1", "alice", "one", now),
            Message::with_id("m-2", "g1", "bob", "two", now),
            Message::with_id("x-1", "g2", "bob", "elsewhere", now),
        ];
        assert_eq!(client.merge_history(overlapping).await, 1);

        let ids: Vec<_> = client.messages().await.into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["m-1", "m-2", "m-3"]);
    }

    #[tokio::test]
    async fn test_discard_pending_removes_entry() {
        let client = client("ws://127.0.0.1:1");
        let pending = client.send_message("oops", None, Vec::new()).await.unwrap();

        assert!(client.discard_pending(&pending.temp_id).await.is_some());
        assert!(client.entries().await.is_empty());
        assert!(client.discard_pending(&pending.temp_id).await.is_none());
    }

    #[tokio::test]
    async fn test_mutations_need_known_message() {
        let client = client("ws://127.0.0.1:1");
        assert!(matches!(
            client.toggle_reaction("m-1", "👍").await,
            Err(ChatError::NotFound(_))
        ));
        assert!(matches!(client.join_group("g1").await, Err(ChatError::Connection(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_gives_up_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = client(&format!("ws://{addr}"));
        let mut events = client.take_event_rx().unwrap();
        client.connect().await.unwrap();

        let mut reconnecting = 0;
        let fatal = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(ClientEvent::Reconnecting { .. }) => reconnecting += 1,
                    Some(ClientEvent::Fatal(err)) => return err,
                    Some(_) => {}
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(fatal, ChatError::GaveUp(2));
        assert_eq!(reconnecting, 2);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
