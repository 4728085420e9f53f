//! Token hand-off into the socket protocol.
//!
//! The identity provider itself is external. The server only needs
//! [`TokenIssuer::validate`]; the client only needs [`TokenSource::fetch_token`],
//! called right before every connection attempt so an expired token is never
//! replayed across reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::ChatError;
use crate::protocol::UserId;

/// Server-side token validation.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Resolve a token to the user it was issued for.
    async fn validate(&self, token: &str) -> Result<UserId, ChatError>;
}

/// Client-side token fetch (a request/response call to the auth endpoint).
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<String, ChatError>;
}

#[derive(Debug, Clone)]
struct IssuedToken {
    user_id: UserId,
    /// `None` for permanent development tokens
    expires_at: Option<Instant>,
}

/// In-memory issuer of short-lived tokens.
pub struct StaticTokenIssuer {
    tokens: RwLock<HashMap<String, IssuedToken>>,
    ttl: Duration,
}

impl StaticTokenIssuer {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Seed with permanent tokens (token → user id).
    pub fn with_permanent_tokens(ttl: Duration, tokens: &HashMap<String, UserId>) -> Self {
        let tokens = tokens
            .iter()
            .map(|(token, user_id)| {
                let issued = IssuedToken {
                    user_id: user_id.clone(),
                    expires_at: None,
                };
                (token.clone(), issued)
            })
            .collect();
        Self {
            tokens: RwLock::new(tokens),
            ttl,
        }
    }

    /// Issue a fresh token for `user_id`, valid for the configured TTL.
    pub async fn issue(&self, user_id: impl Into<UserId>) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let issued = IssuedToken {
            user_id: user_id.into(),
            expires_at: Some(Instant::now() + self.ttl),
        };
        self.tokens.write().await.insert(token.clone(), issued);
        token
    }

    pub async fn revoke(&self, token: &str) -> bool {
        self.tokens.write().await.remove(token).is_some()
    }

    /// Drop expired tokens. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, t| t.expires_at.map_or(true, |at| at > now));
        before - tokens.len()
    }
}

#[async_trait]
impl TokenIssuer for StaticTokenIssuer {
    async fn validate(&self, token: &str) -> Result<UserId, ChatError> {
        let tokens = self.tokens.read().await;
        let issued = tokens
            .get(token)
            .ok_or_else(|| ChatError::Auth("unknown token".into()))?;
        match issued.expires_at {
            Some(at) if at <= Instant::now() => Err(ChatError::Auth("token expired".into())),
            _ => Ok(issued.user_id.clone()),
        }
    }
}

/// Token source that asks an in-process issuer for a new token each time.
pub struct IssuerTokenSource {
    issuer: Arc<StaticTokenIssuer>,
    user_id: UserId,
}

impl IssuerTokenSource {
    pub fn new(issuer: Arc<StaticTokenIssuer>, user_id: impl Into<UserId>) -> Self {
        Self {
            issuer,
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl TokenSource for IssuerTokenSource {
    async fn fetch_token(&self) -> Result<String, ChatError> {
        Ok(self.issuer.issue(self.user_id.clone()).await)
    }
}

/// Token source that always hands out the same token.
pub struct FixedTokenSource(pub String);

#[async_trait]
impl TokenSource for FixedTokenSource {
    async fn fetch_token(&self) -> Result<String, ChatError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issue_and_validate() {
        let issuer = StaticTokenIssuer::new(Duration::from_secs(60));
        let token = issuer.issue("alice").await;
        assert_eq!(issuer.validate(&token).await.unwrap(), "alice");
    }

    #[tokio::test]
    async fn test_unknown_token_is_auth_error() {
        let issuer = StaticTokenIssuer::new(Duration::from_secs(60));
        let err = issuer.validate("nope").await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_expired_token() {
        let issuer = StaticTokenIssuer::new(Duration::from_millis(10));
        let token = issuer.issue("alice").await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(matches!(issuer.validate(&token).await, Err(ChatError::Auth(_))));
        assert_eq!(issuer.purge_expired().await, 1);
    }

    #[tokio::test]
    async fn test_permanent_tokens_survive_purge() {
        let mut seed = HashMap::new();
        seed.insert("dev".to_string(), "bob".to_string());
        let issuer = StaticTokenIssuer::with_permanent_tokens(Duration::from_millis(1), &seed);

        assert_eq!(issuer.purge_expired().await, 0);
        assert_eq!(issuer.validate("dev").await.unwrap(), "bob");
    }

    #[tokio::test]
    async fn test_revoke() {
        let issuer = StaticTokenIssuer::new(Duration::from_secs(60));
        let token = issuer.issue("alice").await;
        assert!(issuer.revoke(&token).await);
        assert!(issuer.validate(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_source_fetches_fresh_token_each_time() {
        let issuer = Arc::new(StaticTokenIssuer::new(Duration::from_secs(60)));
        let source = IssuerTokenSource::new(issuer.clone(), "alice");

        let first = source.fetch_token().await.unwrap();
        let second = source.fetch_token().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(issuer.validate(&second).await.unwrap(), "alice");
    }
}
