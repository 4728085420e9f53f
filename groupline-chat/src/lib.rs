//! # groupline-chat: Real-time group messaging
//!
//! WebSocket server and client for group chat with optimistic sends,
//! edits, soft deletes, reactions and typing indicators.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ ChatClient  │ ◄─────────────────► │ ChatServer  │
//! │ (per tab)   │     JSON frames     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │Conversation │                     │ GroupRouter │
//! │ (optimistic)│                     │ (per group) │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                               ┌────────────┼────────────┐
//!                               ▼            ▼            ▼
//!                        MessageReconciler  TypingService  SessionRegistry
//!                               │                          (fan-out)
//!                               ▼
//!                         MessageStore
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire frames and the message model
//! - [`transport`]: Framed WebSocket halves
//! - [`registry`]: Sessions, group channels and fan-out
//! - [`router`]: Single-writer dispatch worker per group
//! - [`reconciler`]: Authoritative message mutations
//! - [`presence`]: Typing indicators (server TTL, client debounce)
//! - [`machine`]: Client connection state machine
//! - [`conversation`]: Client message list with optimistic entries
//! - [`server`] / [`client`]: The two ends

pub mod auth;
pub mod client;
pub mod config;
pub mod conversation;
pub mod directory;
pub mod error;
pub mod machine;
pub mod presence;
pub mod protocol;
pub mod reconciler;
pub mod registry;
pub mod router;
pub mod server;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use auth::{FixedTokenSource, IssuerTokenSource, StaticTokenIssuer, TokenIssuer, TokenSource};
pub use client::ChatClient;
pub use config::{ClientConfig, ConfigError, PayloadLimits, RateLimitConfig, ReconnectPolicy, ServerConfig};
pub use conversation::{Conversation, ConversationEntry, PendingMessage, PendingStatus};
pub use directory::{GroupRole, InMemoryDirectory, MembershipDirectory};
pub use error::{ChatError, ErrorCode};
pub use machine::{ClientEvent, ConnectionMachine, ConnectionState, Effect, MachineEvent};
pub use presence::{TypingDebouncer, TypingService, TypingTracker};
pub use protocol::{
    AttachmentRef, ClientFrame, GroupId, Message, MessageId, ProtocolError, Reaction, ServerFrame,
    SessionId, UserId,
};
pub use reconciler::{MessageReconciler, ReactionChange, SendOutcome};
pub use registry::{OutboundQueue, Session, SessionRegistry};
pub use router::{GroupRouter, RouterStats};
pub use server::{ChatServer, ServerError, ServerStats};
pub use store::{InMemoryMessageStore, MessageStore};
