//! In-memory session registry. Every state transition goes through the
//! store so observers see one consistent ordering.

use super::state::Session;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, Arc<RwLock<Session>>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, session: Session) -> Arc<RwLock<Session>> {
        let id = session.id.clone();
        let entry = Arc::new(RwLock::new(session));
        self.sessions.write().await.insert(id, entry.clone());
        entry
    }

    pub async fn get(&self, id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn get_or_err(&self, id: &str) -> Result<Arc<RwLock<Session>>> {
        self.get(id)
            .await
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    /// Apply one mutation under the session's write lock.
    pub async fn update<F, T>(&self, id: &str, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut Session) -> T,
    {
        let entry = self.get_or_err(id).await?;
        let mut session = entry.write().await;
        let out = mutate(&mut session);
        session.touch();
        Ok(out)
    }

    pub async fn delete(&self, id: &str) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    pub async fn all_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
