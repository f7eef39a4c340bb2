//! Durable storage for the session credential pair.
//!
//! The store is an opaque string holder: it never inspects token contents and
//! has no network behavior. Tokens are persisted to a JSON file in the data
//! directory so a session survives process restart, and mirrored in memory so
//! reads never touch the filesystem.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Token file name in the data directory
const TOKEN_FILE: &str = "tokens.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredTokens {
    access: String,
    refresh: Option<String>,
    stored_at: DateTime<Utc>,
}

/// Process-local holder for the access/refresh token pair.
///
/// Both fields are always updated under one lock acquisition, so a reader
/// never observes an access token paired with the wrong refresh token.
pub struct TokenStore {
    data_dir: PathBuf,
    inner: Mutex<Option<StoredTokens>>,
}

impl TokenStore {
    /// Open the store, loading any persisted token pair from disk.
    pub fn open(data_dir: PathBuf) -> Self {
        let inner = match Self::load_from(&data_dir) {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!(error = %err, "Failed to load persisted tokens, starting empty");
                None
            }
        };
        Self {
            data_dir,
            inner: Mutex::new(inner),
        }
    }

    fn load_from(data_dir: &PathBuf) -> Result<Option<StoredTokens>> {
        let path = data_dir.join(TOKEN_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            std::fs::read_to_string(&path).context("Failed to read token file")?;
        let tokens: StoredTokens =
            serde_json::from_str(&contents).context("Failed to parse token file")?;
        Ok(Some(tokens))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<StoredTokens>> {
        // A panic while holding this lock leaves nothing worth recovering
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current access token, if any.
    pub fn access(&self) -> Option<String> {
        self.lock().as_ref().map(|t| t.access.clone())
    }

    /// Current refresh token, if any.
    pub fn refresh(&self) -> Option<String> {
        self.lock().as_ref().and_then(|t| t.refresh.clone())
    }

    /// True if an access token is present.
    pub fn has_access(&self) -> bool {
        self.lock().is_some()
    }

    /// Store a new token pair. Passing `None` for the refresh token keeps the
    /// previously stored refresh token; passing `Some` replaces it.
    pub fn set_tokens(&self, access: String, refresh: Option<String>) {
        let snapshot = {
            let mut guard = self.lock();
            let refresh = refresh.or_else(|| guard.as_ref().and_then(|t| t.refresh.clone()));
            let tokens = StoredTokens {
                access,
                refresh,
                stored_at: Utc::now(),
            };
            *guard = Some(tokens.clone());
            tokens
        };
        if let Err(err) = self.persist(&snapshot) {
            warn!(error = %err, "Failed to persist tokens");
        }
    }

    /// Remove both tokens. Idempotent.
    pub fn clear(&self) {
        *self.lock() = None;
        let path = self.token_path();
        if path.exists() {
            if let Err(err) = std::fs::remove_file(&path) {
                warn!(error = %err, "Failed to remove token file");
            }
        }
        debug!("Token store cleared");
    }

    fn persist(&self, tokens: &StoredTokens) -> Result<()> {
        let path = self.token_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(tokens)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn token_path(&self) -> PathBuf {
        self.data_dir.join(TOKEN_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> TokenStore {
        let dir = std::env::temp_dir().join(format!(
            "invitegate-test-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        TokenStore::open(dir)
    }

    #[test]
    fn test_set_both_replaces_both() {
        let store = temp_store();
        store.set_tokens("a1".into(), Some("r1".into()));
        store.set_tokens("a2".into(), Some("r2".into()));
        assert_eq!(store.access().as_deref(), Some("a2"));
        assert_eq!(store.refresh().as_deref(), Some("r2"));
        store.clear();
    }

    #[test]
    fn test_set_access_only_keeps_refresh() {
        let store = temp_store();
        store.set_tokens("a1".into(), Some("r1".into()));
        store.set_tokens("a2".into(), None);
        assert_eq!(store.access().as_deref(), Some("a2"));
        assert_eq!(store.refresh().as_deref(), Some("r1"));
        store.clear();
    }

    #[test]
    fn test_clear_is_idempotent() {
        let store = temp_store();
        store.set_tokens("a1".into(), Some("r1".into()));
        store.clear();
        store.clear();
        assert_eq!(store.access(), None);
        assert_eq!(store.refresh(), None);
        assert!(!store.has_access());
    }

    #[test]
    fn test_pair_survives_reopen() {
        let dir = std::env::temp_dir().join(format!(
            "invitegate-test-reopen-{}",
            std::process::id()
        ));
        let store = TokenStore::open(dir.clone());
        store.set_tokens("a1".into(), Some("r1".into()));
        drop(store);

        let reopened = TokenStore::open(dir);
        assert_eq!(reopened.access().as_deref(), Some("a1"));
        assert_eq!(reopened.refresh().as_deref(), Some("r1"));
        reopened.clear();
    }
}
