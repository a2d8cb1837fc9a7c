use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::error::Result;

/// User profile as returned by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub username: String,
    #[serde(default)]
    pub fullname: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub disabled: Option<bool>,
    #[serde(default = "default_subscription")]
    pub subscription: String,
}

fn default_subscription() -> String {
    "basic".to_string()
}

/// Session state persisted across restarts.
///
/// Serialized under the fixed keys `token` and `user`; realtime token
/// material is deliberately absent, it is short-lived and refetched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredSession {
    pub token: String,
    pub user: UserProfile,
}

/// JSON-file-backed store for the logged-in session.
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            path: PathBuf::from(&config.path),
        }
    }

    /// Persist the session, creating parent directories as needed.
    pub async fn save(&self, session: &StoredSession) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let body = serde_json::to_string_pretty(session)?;
        tokio::fs::write(&self.path, body).await?;

        tracing::debug!(path = %self.path.display(), "Session persisted");

        Ok(())
    }

    /// Load the persisted session, if any.
    ///
    /// A missing file means no session. A file that fails to parse is
    /// treated the same way and removed, so a corrupt session can never
    /// wedge startup.
    pub async fn load(&self) -> Result<Option<StoredSession>> {
        let body = match tokio::fs::read_to_string(&self.path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&body) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Discarding unreadable session file"
                );
                self.clear().await?;
                Ok(None)
            }
        }
    }

    /// Remove the persisted session. Clearing an absent session is a no-op.
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_at(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::new(&SessionConfig {
            path: dir
                .path()
                .join("session.json")
                .to_string_lossy()
                .into_owned(),
        })
    }

    fn test_session() -> StoredSession {
        StoredSession {
            token: "jwt-token".to_string(),
            user: UserProfile {
                username: "admin".to_string(),
                fullname: Some("Admin User".to_string()),
                email: Some("admin@example.com".to_string()),
                disabled: Some(false),
                subscription: "premium".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(&dir);

        store.save(&test_session()).await.unwrap();
        let loaded = store.load().await.unwrap();

        assert_eq!(loaded, Some(test_session()));
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(&dir);

        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let store = SessionStore::new(&SessionConfig {
            path: path.to_string_lossy().into_owned(),
        });

        assert_eq!(store.load().await.unwrap(), None);
        // The corrupt file is gone as well
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(&dir);

        store.save(&test_session()).await.unwrap();
        store.clear().await.unwrap();
        store.clear().await.unwrap();

        assert_eq!(store.load().await.unwrap(), None);
    }

    #[test]
    fn test_fixed_storage_keys() {
        let body = serde_json::to_value(test_session()).unwrap();
        assert!(body.get("token").is_some());
        assert!(body.get("user").is_some());
    }
}
