use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, warn};
use wheel_core::{Email, Session};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("session not found")]
    NotFound,
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn find(&self, email: &Email) -> Result<Session, StoreError>;

    /// Inserts an empty session. Fails if the email already has one.
    async fn create(&self, email: &Email) -> Result<Session, StoreError>;

    async fn update(&self, email: &Email, selections: &[String]) -> Result<Session, StoreError>;
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    sessions: Arc<RwLock<HashMap<Email, Session>>>,
    persist_path: Option<PathBuf>,
    snapshot_writer: Arc<Mutex<()>>,
}

impl MemoryStore {
    pub async fn with_persistence(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut store = Self::default();
        if let Ok(bytes) = tokio::fs::read(&path).await {
            match serde_json::from_slice::<Vec<Session>>(&bytes) {
                Ok(saved) => {
                    let mut sessions = store.sessions.write().await;
                    *sessions = saved
                        .into_iter()
                        .map(|s| (s.email.clone(), s))
                        .collect();
                }
                Err(err) => warn!(path = %path.display(), error = %err, "ignoring unreadable snapshot"),
            }
        }
        store.persist_path = Some(path);
        store
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    async fn persist(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        // Snapshot after taking the writer lock so the newest state lands last.
        let _writer = self.snapshot_writer.lock().await;
        let snapshot = {
            let sessions = self.sessions.read().await;
            let mut all = sessions.values().cloned().collect::<Vec<_>>();
            all.sort_by(|a, b| a.email.as_str().cmp(b.email.as_str()));
            all
        };
        let json = match serde_json::to_vec_pretty(&snapshot) {
            Ok(json) => json,
            Err(err) => {
                error!(error = %err, "snapshot encode failed");
                return;
            }
        };
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        if let Err(err) = tokio::fs::write(&tmp, json).await {
            error!(path = %tmp.display(), error = %err, "snapshot write failed");
            return;
        }
        if let Err(err) = tokio::fs::rename(&tmp, path).await {
            error!(path = %path.display(), error = %err, "snapshot rename failed");
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn find(&self, email: &Email) -> Result<Session, StoreError> {
        self.sessions
            .read()
            .await
            .get(email)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn create(&self, email: &Email) -> Result<Session, StoreError> {
        let session = {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(email) {
                return Err(StoreError::BackendUnavailable(format!(
                    "duplicate key: session for {email} already exists"
                )));
            }
            let session = Session::new(email.clone(), Utc::now());
            sessions.insert(email.clone(), session.clone());
            session
        };
        self.persist().await;
        Ok(session)
    }

    async fn update(&self, email: &Email, selections: &[String]) -> Result<Session, StoreError> {
        let session = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(email).ok_or(StoreError::NotFound)?;
            session.replace(selections, Utc::now());
            session.clone()
        };
        self.persist().await;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn email(raw: &str) -> Email {
        Email::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn create_then_find_round_trips() {
        let store = MemoryStore::default();
        let created = store.create(&email("a@b.com")).await.unwrap();
        assert!(created.selected_emojis.is_empty());

        let found = store.find(&email("a@b.com")).await.unwrap();
        assert_eq!(found, created);

        store
            .update(&email("a@b.com"), &["🦄".to_string()])
            .await
            .unwrap();
        let found = store.find(&email("a@b.com")).await.unwrap();
        assert_eq!(found.selected_emojis, vec!["🦄".to_string()]);
        assert!(found.updated_at >= created.updated_at);
    }

    #[tokio::test]
    async fn differently_typed_emails_share_a_record() {
        let store = MemoryStore::default();
        store.create(&email("  A@B.com ")).await.unwrap();
        assert!(store.find(&email("a@b.com")).await.is_ok());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn missing_and_duplicate_records_are_distinguished() {
        let store = MemoryStore::default();
        assert_eq!(
            store.find(&email("x@y.z")).await.unwrap_err(),
            StoreError::NotFound
        );
        assert_eq!(
            store.update(&email("x@y.z"), &[]).await.unwrap_err(),
            StoreError::NotFound
        );

        store.create(&email("x@y.z")).await.unwrap();
        assert!(matches!(
            store.create(&email("x@y.z")).await.unwrap_err(),
            StoreError::BackendUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn update_drops_repeated_emojis() {
        let store = MemoryStore::default();
        store.create(&email("a@b.com")).await.unwrap();
        let saved = store
            .update(
                &email("a@b.com"),
                &["😀".to_string(), "😀".to_string(), "🤖".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(saved.selected_emojis, vec!["😀".to_string(), "🤖".to_string()]);
    }

    #[tokio::test]
    async fn persistence_writes_and_loads_sessions() {
        let path = std::env::temp_dir().join(format!("wheel_sessions_{}.json", Uuid::new_v4()));
        let store = MemoryStore::with_persistence(path.clone()).await;
        store.create(&email("a@b.com")).await.unwrap();
        store
            .update(&email("a@b.com"), &["👻".to_string()])
            .await
            .unwrap();
        assert!(tokio::fs::metadata(&path).await.is_ok());

        let loaded = MemoryStore::with_persistence(path.clone()).await;
        assert_eq!(loaded.len().await, 1);
        let session = loaded.find(&email("a@b.com")).await.unwrap();
        assert_eq!(session.selected_emojis, vec!["👻".to_string()]);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_leave_a_complete_snapshot() {
        let path = std::env::temp_dir().join(format!("wheel_sessions_{}.json", Uuid::new_v4()));
        let store = MemoryStore::with_persistence(path.clone()).await;

        let tasks = (0..200)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let email = email(&format!("player{i}@b.com"));
                    store.create(&email).await.unwrap();
                    store.update(&email, &[format!("#{i}")]).await.unwrap();
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.unwrap();
        }

        let loaded = MemoryStore::with_persistence(path.clone()).await;
        assert_eq!(loaded.len().await, 200);
        let session = loaded.find(&email("player7@b.com")).await.unwrap();
        assert_eq!(session.selected_emojis, vec!["#7".to_string()]);

        let _ = tokio::fs::remove_file(&path).await;
    }
}
