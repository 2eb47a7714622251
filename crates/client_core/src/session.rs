//! Persisted session tokens and session lifecycle events.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use shared::protocol::TokenPair;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Lifetimes the backend assigns to freshly issued tokens.
pub const ACCESS_TOKEN_TTL_SECS: i64 = 30 * 60;
pub const REFRESH_TOKEN_TTL_SECS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

impl StoredSession {
    pub fn issue(tokens: &TokenPair, now: DateTime<Utc>) -> Self {
        Self {
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            access_expires_at: now + Duration::seconds(ACCESS_TOKEN_TTL_SECS),
            refresh_expires_at: now + Duration::seconds(REFRESH_TOKEN_TTL_SECS),
        }
    }

    pub fn tokens(&self) -> TokenPair {
        TokenPair {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
        }
    }

    pub fn refresh_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.refresh_expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn,
    TokensRefreshed,
    /// The session cannot be recovered; the user has to log in again.
    LoginRequired { notice: String },
    SignedOut,
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self) -> Result<Option<StoredSession>>;
    async fn save(&self, tokens: &TokenPair) -> Result<StoredSession>;
    async fn clear(&self) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryTokenStore {
    session: Mutex<Option<StoredSession>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: &TokenPair) -> Self {
        Self {
            session: Mutex::new(Some(StoredSession::issue(tokens, Utc::now()))),
        }
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self) -> Result<Option<StoredSession>> {
        Ok(self.session.lock().await.clone())
    }

    async fn save(&self, tokens: &TokenPair) -> Result<StoredSession> {
        let session = StoredSession::issue(tokens, Utc::now());
        *self.session.lock().await = Some(session.clone());
        Ok(session)
    }

    async fn clear(&self) -> Result<()> {
        self.session.lock().await.take();
        Ok(())
    }
}

/// JSON session file. Writes go to a sibling temp file first and are renamed
/// into place, so a crash never leaves a half-written session behind.
pub struct FileTokenStore {
    path: PathBuf,
    // Serializes writers within this process.
    write_lock: Mutex<()>,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "session.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> Result<Option<StoredSession>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read session file '{}'", self.path.display())
                })
            }
        };
        let session = serde_json::from_slice::<StoredSession>(&raw).with_context(|| {
            format!("failed to parse session file '{}'", self.path.display())
        })?;
        Ok(Some(session))
    }

    async fn save(&self, tokens: &TokenPair) -> Result<StoredSession> {
        let session = StoredSession::issue(tokens, Utc::now());
        let encoded = serde_json::to_vec_pretty(&session).context("failed to encode session")?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create '{}'", parent.display()))?;
        }
        let temp = self.temp_path();
        tokio::fs::write(&temp, &encoded)
            .await
            .with_context(|| format!("failed to write '{}'", temp.display()))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .with_context(|| format!("failed to replace '{}'", self.path.display()))?;

        debug!(path = %self.path.display(), "session: tokens persisted");
        Ok(session)
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "session: tokens cleared");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("failed to remove '{}'", self.path.display())),
        }
    }
}
