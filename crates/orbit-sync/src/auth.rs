//! # Session & Push Token Management
//!
//! Holds the admin session token and exchanges it for the short-lived
//! token the push channel handshake requires.
//!
//! ## Token Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Push Token Acquisition                             │
//! │                                                                         │
//! │  ┌────────────────┐     ┌─────────────────┐     ┌─────────────────┐    │
//! │  │  SessionStore  │     │  WsTokenClient  │     │  Admin API      │    │
//! │  └───────┬────────┘     └────────┬────────┘     └────────┬────────┘    │
//! │          │  1. session token     │                       │             │
//! │          │──────────────────────►│                       │             │
//! │          │   (none → AuthRequired)                       │             │
//! │          │                       │  2. POST ws_token     │             │
//! │          │                       │     Bearer <session>  │             │
//! │          │                       │──────────────────────►│             │
//! │          │                       │  3. {token, expiresIn}│             │
//! │          │                       │◄──────────────────────│             │
//! │          │                       │                       │             │
//! │          │  [Reconnect before expiry: cached token reused]             │
//! │          │  [Within refresh margin: fetch a new one]                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Session Store
// =============================================================================

/// The logged-in admin session, shared by the API client and the channel.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    token: Arc<RwLock<Option<String>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds a session token.
    pub fn with_token(token: impl Into<String>) -> Self {
        SessionStore {
            token: Arc::new(RwLock::new(Some(token.into()))),
        }
    }

    pub async fn set(&self, token: impl Into<String>) {
        *self.token.write().await = Some(token.into());
        info!("Session token updated");
    }

    pub async fn clear(&self) {
        *self.token.write().await = None;
        info!("Session cleared");
    }

    pub async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    /// Returns the session token or [`SyncError::AuthRequired`].
    pub async fn require(&self) -> SyncResult<String> {
        self.token().await.ok_or(SyncError::AuthRequired)
    }
}

// =============================================================================
// Token Provider
// =============================================================================

/// Source of push channel handshake tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    /// Returns a token valid for at least the refresh margin.
    async fn push_token(&self) -> SyncResult<String>;

    /// Drops any cached token (called after the server rejected one).
    async fn invalidate(&self) {}
}

/// A cached push token.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub token: String,
    pub expires_at: Instant,
}

impl TokenInfo {
    pub fn new(token: String, expires_in: Duration) -> Self {
        TokenInfo {
            token,
            expires_at: Instant::now() + expires_in,
        }
    }

    /// True once `now + margin` reaches the expiry.
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        Instant::now() + margin >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining_secs(&self) -> u64 {
        self.expires_at
            .saturating_duration_since(Instant::now())
            .as_secs()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    token: String,
    /// Lifetime in seconds.
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    300
}

// =============================================================================
// HTTP Token Client
// =============================================================================

/// Fetches push tokens from `ws_token_endpoint` with the session bearer.
pub struct WsTokenClient {
    http: reqwest::Client,
    url: Url,
    session: SessionStore,
    refresh_margin: Duration,
    cached: RwLock<Option<TokenInfo>>,
}

impl WsTokenClient {
    pub fn new(
        http: reqwest::Client,
        url: Url,
        session: SessionStore,
        refresh_margin: Duration,
    ) -> Self {
        WsTokenClient {
            http,
            url,
            session,
            refresh_margin,
            cached: RwLock::new(None),
        }
    }

    async fn fetch(&self) -> SyncResult<TokenInfo> {
        let session = self.session.require().await?;
        debug!(url = %self.url, "Requesting push token");

        let resp = self
            .http
            .post(self.url.clone())
            .bearer_auth(session)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(SyncError::TokenRejected(format!(
                "token endpoint returned {}",
                status
            )));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp.bytes().await?;
        let parsed: TokenResponse = serde_json::from_slice(&bytes)?;
        Ok(TokenInfo::new(
            parsed.token,
            Duration::from_secs(parsed.expires_in),
        ))
    }
}

#[async_trait]
impl TokenProvider for WsTokenClient {
    async fn push_token(&self) -> SyncResult<String> {
        {
            let guard = self.cached.read().await;
            if let Some(info) = guard.as_ref() {
                if !info.needs_refresh(self.refresh_margin) {
                    debug!(remaining_secs = info.remaining_secs(), "Using cached push token");
                    return Ok(info.token.clone());
                }
            }
        }

        let mut guard = self.cached.write().await;

        // Another caller may have refreshed while we waited for the lock.
        if let Some(info) = guard.as_ref() {
            if !info.needs_refresh(self.refresh_margin) {
                return Ok(info.token.clone());
            }
        }

        match self.fetch().await {
            Ok(info) => {
                info!(expires_in_secs = info.remaining_secs(), "Push token acquired");
                let token = info.token.clone();
                *guard = Some(info);
                Ok(token)
            }
            Err(e) => {
                warn!(error = %e, "Failed to acquire push token");
                *guard = None;
                Err(e)
            }
        }
    }

    async fn invalidate(&self) {
        *self.cached.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_store() {
        let session = SessionStore::new();
        assert!(matches!(session.require().await, Err(SyncError::AuthRequired)));

        session.set("abc").await;
        assert_eq!(session.require().await.unwrap(), "abc");

        let shared = session.clone();
        shared.clear().await;
        assert!(session.token().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_refresh_margin() {
        let info = TokenInfo::new("t".into(), Duration::from_secs(300));
        let margin = Duration::from_secs(30);
        assert!(!info.needs_refresh(margin));

        tokio::time::advance(Duration::from_secs(269)).await;
        assert!(!info.needs_refresh(margin));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(info.needs_refresh(margin));
        assert!(!info.is_expired());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(info.is_expired());
        assert_eq!(info.remaining_secs(), 0);
    }

    #[tokio::test]
    async fn test_no_session_is_auth_required() {
        let client = WsTokenClient::new(
            reqwest::Client::new(),
            Url::parse("http://127.0.0.1:9/ws-token").unwrap(),
            SessionStore::new(),
            Duration::from_secs(30),
        );
        let err = client.push_token().await.unwrap_err();
        assert!(matches!(err, SyncError::AuthRequired));
    }
}
