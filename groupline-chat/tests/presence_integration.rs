//! Integration tests for typing indicators.
//!
//! These tests start a real server and connect two clients, verifying
//! typing broadcast, client-side idle stop and server-side expiry.

use std::collections::HashMap;
use std::sync::Arc;

use groupline_chat::client::ChatClient;
use groupline_chat::config::{ClientConfig, ServerConfig};
use groupline_chat::directory::InMemoryDirectory;
use groupline_chat::machine::{ClientEvent, ConnectionState};
use groupline_chat::protocol::ServerFrame;
use groupline_chat::server::ChatServer;
use groupline_chat::store::InMemoryMessageStore;
use groupline_chat::{FixedTokenSource, StaticTokenIssuer};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

const WAIT: Duration = Duration::from_secs(3);

async fn start_test_server(typing_ttl_ms: u64) -> (Arc<ChatServer>, String) {
    let mut config = ServerConfig {
        bind_addr: "127.0.0.1:0".into(),
        typing_ttl_ms,
        typing_sweep_interval_ms: 50,
        ..ServerConfig::default()
    };
    config.dev_tokens.insert("alice-token".into(), "alice".into());
    config.dev_tokens.insert("bob-token".into(), "bob".into());
    let roster = HashMap::from([("g1".to_string(), vec!["alice".to_string(), "bob".to_string()])]);

    let issuer = Arc::new(StaticTokenIssuer::with_permanent_tokens(
        Duration::from_secs(60),
        &config.dev_tokens,
    ));
    let server = Arc::new(ChatServer::new(
        config,
        issuer,
        Arc::new(InMemoryDirectory::from_rosters(&roster)),
        Arc::new(InMemoryMessageStore::new()),
    ));
    let addr = server.start().await.unwrap();
    (server, format!("ws://{addr}"))
}

/// Connect a client with the given composer idle time and join `g1`.
async fn joined_client(
    url: &str,
    token: &str,
    typing_idle: Duration,
) -> (ChatClient, mpsc::Receiver<ClientEvent>) {
    let mut config = ClientConfig::new(url);
    config.typing_idle = typing_idle;
    let mut client = ChatClient::spawn(config, Arc::new(FixedTokenSource(token.to_string())));
    let events = client.take_event_rx().unwrap();

    client.connect().await.unwrap();
    client.wait_for_state(ConnectionState::Idle, WAIT).await.unwrap();
    client.join_group("g1").await.unwrap();
    client.wait_for_state(ConnectionState::Joined, WAIT).await.unwrap();
    (client, events)
}

/// Next `typing_update` for `user`, skipping unrelated events.
async fn next_typing(events: &mut mpsc::Receiver<ClientEvent>, user: &str) -> bool {
    let found = timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if let ClientEvent::Frame(ServerFrame::TypingUpdate { user_id, is_typing }) = event {
                if user_id == user {
                    return Some(is_typing);
                }
            }
        }
        None
    })
    .await;
    found
        .expect("Timed out waiting for typing_update")
        .expect("Event stream closed")
}

/// Typing updates for `user` that arrive within `window`.
async fn typing_updates_within(
    events: &mut mpsc::Receiver<ClientEvent>,
    user: &str,
    window: Duration,
) -> Vec<bool> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        if let ClientEvent::Frame(ServerFrame::TypingUpdate { user_id, is_typing }) = event {
            if user_id == user {
                seen.push(is_typing);
            }
        }
    }
    seen
}

#[tokio::test]
async fn test_typing_is_broadcast_to_others_only() {
    let (_server, url) = start_test_server(5000).await;
    let (alice, mut alice_events) = joined_client(&url, "alice-token", Duration::from_secs(10)).await;
    let (_bob, mut bob_events) = joined_client(&url, "bob-token", Duration::from_secs(10)).await;

    alice.notify_typing().await.unwrap();
    assert!(next_typing(&mut bob_events, "alice").await);

    // More keystrokes inside the idle window do not repeat the start.
    alice.notify_typing().await.unwrap();
    alice.notify_typing().await.unwrap();
    assert!(typing_updates_within(&mut bob_events, "alice", Duration::from_millis(200))
        .await
        .is_empty());

    // The typist never sees their own indicator.
    assert!(typing_updates_within(&mut alice_events, "alice", Duration::from_millis(100))
        .await
        .is_empty());
}

#[tokio::test]
async fn test_client_idle_sends_stop() {
    let (_server, url) = start_test_server(5000).await;
    let (alice, _alice_events) = joined_client(&url, "alice-token", Duration::from_millis(150)).await;
    let (_bob, mut bob_events) = joined_client(&url, "bob-token", Duration::from_secs(10)).await;

    alice.notify_typing().await.unwrap();
    assert!(next_typing(&mut bob_events, "alice").await);
    assert!(!next_typing(&mut bob_events, "alice").await);
}

#[tokio::test]
async fn test_server_expiry_broadcasts_stop_once() {
    let (server, url) = start_test_server(300).await;
    let (alice, _alice_events) = joined_client(&url, "alice-token", Duration::from_secs(10)).await;
    let (_bob, mut bob_events) = joined_client(&url, "bob-token", Duration::from_secs(10)).await;

    alice.notify_typing().await.unwrap();
    assert!(next_typing(&mut bob_events, "alice").await);

    let updates = typing_updates_within(&mut bob_events, "alice", Duration::from_millis(1000)).await;
    assert_eq!(updates, vec![false]);
    assert!(server.typing().typing_users("g1").await.is_empty());
}

#[tokio::test]
async fn test_sending_clears_typing_before_the_message() {
    let (_server, url) = start_test_server(5000).await;
    let (alice, mut alice_events) = joined_client(&url, "alice-token", Duration::from_secs(10)).await;
    let (_bob, mut bob_events) = joined_client(&url, "bob-token", Duration::from_secs(10)).await;

    alice.notify_typing().await.unwrap();
    assert!(next_typing(&mut bob_events, "alice").await);

    alice.send_message("done typing", None, Vec::new()).await.unwrap();

    let mut order = Vec::new();
    let collected = timeout(WAIT, async {
        while let Some(event) = bob_events.recv().await {
            match event {
                ClientEvent::Frame(ServerFrame::TypingUpdate { is_typing: false, .. }) => {
                    order.push("stop");
                }
                ClientEvent::Frame(ServerFrame::NewMessage { .. }) => {
                    order.push("message");
                    break;
                }
                _ => {}
            }
        }
    })
    .await;
    assert!(collected.is_ok(), "Timed out waiting for the message");
    assert_eq!(order, vec!["stop", "message"]);

    // The implicit stop skips the sending tab, like an explicit one.
    assert!(typing_updates_within(&mut alice_events, "alice", Duration::from_millis(200))
        .await
        .is_empty());
}

#[tokio::test]
async fn test_leaving_clears_typing() {
    let (server, url) = start_test_server(5000).await;
    let (alice, _alice_events) = joined_client(&url, "alice-token", Duration::from_secs(10)).await;
    let (_bob, mut bob_events) = joined_client(&url, "bob-token", Duration::from_secs(10)).await;

    alice.notify_typing().await.unwrap();
    assert!(next_typing(&mut bob_events, "alice").await);

    alice.leave_group().await.unwrap();
    alice.wait_for_state(ConnectionState::Idle, WAIT).await.unwrap();
    assert!(!next_typing(&mut bob_events, "alice").await);
    assert!(server.typing().typing_users("g1").await.is_empty());
}
