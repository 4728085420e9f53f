//! Client connection state machine.
//!
//! ```text
//!  Disconnected ──connect──► Connecting ──open──► Authenticating
//!       ▲                                              │ authenticated
//!       │ close / error / pong timeout                 ▼
//!       └──────────────(any state)────────────────  Idle ──join──► Joining ──joined_group──► Joined
//! ```
//!
//! Transitions are pure: [`ConnectionMachine`] consumes events and returns
//! [`Effect`]s (frames to send, timers to arm or cancel, events to emit).
//! The client driver performs the effects, so every transition is testable
//! without a socket.

use std::time::Duration;

use crate::config::ReconnectPolicy;
use crate::error::ChatError;
use crate::protocol::{
    ClientFrame, GroupId, ServerFrame, UserId, CLOSE_DEAD_CONNECTION, CLOSE_INTENTIONAL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Idle,
    Joining,
    Joined,
}

impl ConnectionState {
    /// A transport is open or being opened.
    pub fn is_connected(self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }
}

/// Reconnection bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectState {
    pub attempt: u32,
    pub next_delay: Option<Duration>,
    /// Group to rejoin automatically after re-authenticating
    pub pending_group_id: Option<GroupId>,
}

/// Inputs to the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    TransportOpened,
    OpenFailed(String),
    TokenFetched(String),
    TokenFailed(ChatError),
    Frame(ServerFrame),
    TransportClosed { code: Option<u16> },
    TransportError(String),
    PingTimerFired,
    PongDeadlineElapsed,
    RetryTimerFired,
}

/// What the application observes.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    Authenticated { user_id: UserId },
    Joined { group_id: GroupId },
    Left,
    Reconnecting { attempt: u32, delay: Duration },
    /// A domain event from the server (messages, reactions, typing, presence)
    Frame(ServerFrame),
    /// A command was rejected; the connection is unaffected.
    CommandFailed(ChatError),
    /// The server rejected an optimistic send.
    SendFailed { temp_id: String, error: ChatError },
    /// The lifecycle ended and needs user action.
    Fatal(ChatError),
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    OpenTransport,
    FetchToken,
    Send(ClientFrame),
    CloseTransport { code: u16 },
    SchedulePing(Duration),
    CancelPing,
    SchedulePongDeadline(Duration),
    CancelPongDeadline,
    ScheduleRetry(Duration),
    CancelRetry,
    Emit(ClientEvent),
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    reconnect: ReconnectState,
    policy: ReconnectPolicy,
    retry_pending: bool,
    gave_up: bool,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect: ReconnectState::default(),
            policy,
            retry_pending: false,
            gave_up: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_state(&self) -> &ReconnectState {
        &self.reconnect
    }

    pub fn can_send(&self) -> bool {
        self.state == ConnectionState::Joined
    }

    fn transition(&mut self, next: ConnectionState, effects: &mut Vec<Effect>) {
        if self.state != next {
            log::debug!("Connection state {:?} -> {next:?}", self.state);
            self.state = next;
            effects.push(Effect::Emit(ClientEvent::StateChanged(next)));
        }
    }

    /// Start connecting. No-op unless disconnected.
    pub fn connect(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.state != ConnectionState::Disconnected {
            return effects;
        }
        self.gave_up = false;
        self.reset_backoff();
        if self.retry_pending {
            self.retry_pending = false;
            effects.push(Effect::CancelRetry);
        }
        self.transition(ConnectionState::Connecting, &mut effects);
        effects.push(Effect::OpenTransport);
        effects
    }

    /// Close intentionally. Cancels timers and forgets reconnect state.
    pub fn disconnect(&mut self) -> Vec<Effect> {
        let mut effects = vec![Effect::CancelRetry, Effect::CancelPing, Effect::CancelPongDeadline];
        if self.state.is_connected() {
            effects.push(Effect::CloseTransport {
                code: CLOSE_INTENTIONAL,
            });
        }
        self.retry_pending = false;
        self.reconnect = ReconnectState::default();
        self.transition(ConnectionState::Disconnected, &mut effects);
        effects
    }

    /// Join `group_id`. Joining another group while joined switches groups.
    pub fn join_group(&mut self, group_id: &str) -> Result<Vec<Effect>, ChatError> {
        if !matches!(self.state, ConnectionState::Idle | ConnectionState::Joined) {
            return Err(ChatError::Connection(format!(
                "cannot join while {:?}",
                self.state
            )));
        }
        let mut effects = vec![Effect::CancelPing, Effect::CancelPongDeadline];
        self.reconnect.pending_group_id = Some(group_id.to_string());
        self.transition(ConnectionState::Joining, &mut effects);
        effects.push(Effect::Send(ClientFrame::JoinGroup {
            group_id: group_id.to_string(),
        }));
        Ok(effects)
    }

    pub fn leave_group(&mut self) -> Result<Vec<Effect>, ChatError> {
        if !matches!(self.state, ConnectionState::Joined | ConnectionState::Joining) {
            return Err(ChatError::Connection("not in a group".into()));
        }
        self.reconnect.pending_group_id = None;
        Ok(vec![Effect::Send(ClientFrame::LeaveGroup)])
    }

    pub fn on_event(&mut self, event: MachineEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        match event {
            MachineEvent::TransportOpened => {
                if self.state == ConnectionState::Connecting {
                    self.transition(ConnectionState::Authenticating, &mut effects);
                    effects.push(Effect::FetchToken);
                }
            }
            MachineEvent::OpenFailed(reason) => {
                if self.state == ConnectionState::Connecting {
                    log::warn!("Connection attempt failed: {reason}");
                    self.connection_lost(&mut effects);
                }
            }
            MachineEvent::TokenFetched(token) => {
                if self.state == ConnectionState::Authenticating {
                    effects.push(Effect::Send(ClientFrame::Authenticate { token }));
                }
            }
            MachineEvent::TokenFailed(err) => {
                if self.state == ConnectionState::Authenticating {
                    if err.is_fatal() {
                        self.fail(err, &mut effects);
                    } else {
                        log::warn!("Token fetch failed: {err}");
                        effects.push(Effect::CloseTransport {
                            code: CLOSE_DEAD_CONNECTION,
                        });
                        self.connection_lost(&mut effects);
                    }
                }
            }
            MachineEvent::Frame(frame) => self.on_frame(frame, &mut effects),
            MachineEvent::TransportClosed { code } => {
                if !self.state.is_connected() {
                    return effects;
                }
                effects.push(Effect::CancelPing);
                effects.push(Effect::CancelPongDeadline);
                if code == Some(CLOSE_INTENTIONAL) {
                    log::info!("Connection closed intentionally by peer");
                    self.transition(ConnectionState::Disconnected, &mut effects);
                } else {
                    log::warn!("Connection closed unexpectedly (code {code:?})");
                    self.connection_lost(&mut effects);
                }
            }
            MachineEvent::TransportError(reason) => {
                if self.state.is_connected() {
                    log::error!("Transport error: {reason}");
                    effects.push(Effect::CloseTransport {
                        code: CLOSE_DEAD_CONNECTION,
                    });
                    self.connection_lost(&mut effects);
                }
            }
            MachineEvent::PingTimerFired => {
                if self.state == ConnectionState::Joined {
                    effects.push(Effect::Send(ClientFrame::Ping));
                    effects.push(Effect::SchedulePongDeadline(self.policy.pong_timeout));
                    effects.push(Effect::SchedulePing(self.policy.ping_interval));
                }
            }
            MachineEvent::PongDeadlineElapsed => {
                if self.state.is_connected() {
                    log::warn!("No pong within {:?}, closing dead connection", self.policy.pong_timeout);
                    effects.push(Effect::CloseTransport {
                        code: CLOSE_DEAD_CONNECTION,
                    });
                    self.connection_lost(&mut effects);
                }
            }
            MachineEvent::RetryTimerFired => {
                if self.state == ConnectionState::Disconnected && self.retry_pending {
                    self.retry_pending = false;
                    self.transition(ConnectionState::Connecting, &mut effects);
                    effects.push(Effect::OpenTransport);
                }
            }
        }
        effects
    }

    fn on_frame(&mut self, frame: ServerFrame, effects: &mut Vec<Effect>) {
        match frame {
            ServerFrame::Authenticated { user_id } => {
                if self.state != ConnectionState::Authenticating {
                    return;
                }
                self.transition(ConnectionState::Idle, effects);
                effects.push(Effect::Emit(ClientEvent::Authenticated { user_id }));
                match self.reconnect.pending_group_id.clone() {
                    Some(group_id) => {
                        log::info!("Rejoining group {group_id}");
                        self.transition(ConnectionState::Joining, effects);
                        effects.push(Effect::Send(ClientFrame::JoinGroup { group_id }));
                    }
                    None => self.reset_backoff(),
                }
            }
            ServerFrame::AuthError { message } => self.fail(ChatError::Auth(message), effects),
            ServerFrame::JoinedGroup { group_id } => {
                if self.state != ConnectionState::Joining {
                    return;
                }
                self.reset_backoff();
                self.reconnect.pending_group_id = Some(group_id.clone());
                self.transition(ConnectionState::Joined, effects);
                effects.push(Effect::SchedulePing(self.policy.ping_interval));
                effects.push(Effect::Emit(ClientEvent::Joined { group_id }));
            }
            ServerFrame::LeftGroup => {
                if matches!(self.state, ConnectionState::Joined | ConnectionState::Joining) {
                    self.reconnect.pending_group_id = None;
                    effects.push(Effect::CancelPing);
                    effects.push(Effect::CancelPongDeadline);
                    self.transition(ConnectionState::Idle, effects);
                    effects.push(Effect::Emit(ClientEvent::Left));
                }
            }
            ServerFrame::Pong => effects.push(Effect::CancelPongDeadline),
            ServerFrame::Error {
                code,
                message,
                command,
                temp_id,
            } => {
                let err = ChatError::from_wire(code, message);
                let rejects_join = command.as_deref() == Some("join_group");
                if rejects_join && self.state == ConnectionState::Joining {
                    self.reconnect.pending_group_id = None;
                    self.transition(ConnectionState::Idle, effects);
                }
                let event = match temp_id {
                    Some(temp_id) => ClientEvent::SendFailed { temp_id, error: err },
                    None => ClientEvent::CommandFailed(err),
                };
                effects.push(Effect::Emit(event));
            }
            ServerFrame::Connected { session_id } => {
                log::debug!("Server assigned session {session_id}");
            }
            other => effects.push(Effect::Emit(ClientEvent::Frame(other))),
        }
    }

    fn reset_backoff(&mut self) {
        self.reconnect.attempt = 0;
        self.reconnect.next_delay = None;
        self.gave_up = false;
    }

    /// Unexpected loss: schedule a retry, or give up once attempts run out.
    fn connection_lost(&mut self, effects: &mut Vec<Effect>) {
        effects.push(Effect::CancelPing);
        effects.push(Effect::CancelPongDeadline);
        self.transition(ConnectionState::Disconnected, effects);

        if self.reconnect.attempt < self.policy.max_attempts {
            let delay = self.policy.delay_for(self.reconnect.attempt);
            self.reconnect.attempt += 1;
            self.reconnect.next_delay = Some(delay);
            self.retry_pending = true;
            effects.push(Effect::ScheduleRetry(delay));
            effects.push(Effect::Emit(ClientEvent::Reconnecting {
                attempt: self.reconnect.attempt,
                delay,
            }));
        } else if !self.gave_up {
            self.gave_up = true;
            self.reconnect.next_delay = None;
            log::error!("Giving up after {} reconnect attempts", self.policy.max_attempts);
            effects.push(Effect::Emit(ClientEvent::Fatal(ChatError::GaveUp(
                self.policy.max_attempts,
            ))));
        }
    }

    /// Fatal error: close, never retry.
    fn fail(&mut self, err: ChatError, effects: &mut Vec<Effect>) {
        effects.push(Effect::CancelRetry);
        effects.push(Effect::CancelPing);
        effects.push(Effect::CancelPongDeadline);
        if self.state.is_connected() {
            effects.push(Effect::CloseTransport {
                code: CLOSE_INTENTIONAL,
            });
        }
        self.retry_pending = false;
        self.reconnect = ReconnectState::default();
        self.transition(ConnectionState::Disconnected, effects);
        log::error!("Fatal client error: {err}");
        effects.push(Effect::Emit(ClientEvent::Fatal(err)));
    }
}
