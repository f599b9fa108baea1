//! Child DAP sessions adopted from a reverse `startDebugging` request.
//!
//! Adapters like js-debug coordinate in a parent session and run user code
//! in children announced over the parent connection. The manager here
//! tracks adopted children with latest-wins routing: the most recently
//! created ready child serves debuggee-scoped commands.

use crate::dap::client::DapClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::{info, warn};

#[derive(Clone)]
pub struct ChildSession {
    pub id: String,
    pub client: Arc<DapClient>,
    pub ready: bool,
}

#[derive(Clone, Default)]
pub struct ChildManager {
    // Creation order; the last entry is the routing target.
    children: Arc<RwLock<Vec<ChildSession>>>,
    ready_notify: Arc<Notify>,
}

impl ChildManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly connected child. It becomes the routing target
    /// once marked ready.
    pub async fn add(&self, id: String, client: Arc<DapClient>) {
        info!("Adopting child session '{}'", id);
        let mut children = self.children.write().await;
        children.push(ChildSession {
            id,
            client,
            ready: false,
        });
    }

    /// A child finished its configuration sequence and can serve requests.
    pub async fn mark_ready(&self, id: &str) {
        let mut children = self.children.write().await;
        if let Some(child) = children.iter_mut().find(|c| c.id == id) {
            child.ready = true;
            info!("Child session '{}' is ready", id);
        } else {
            warn!("mark_ready for unknown child '{}'", id);
        }
        drop(children);
        self.ready_notify.notify_waiters();
    }

    /// Drop a child that terminated or detached.
    pub async fn remove(&self, id: &str) {
        let mut children = self.children.write().await;
        let before = children.len();
        children.retain(|c| c.id != id);
        if children.len() != before {
            info!("Removed child session '{}'", id);
        }
    }

    /// Most recently created child, ready or not.
    pub async fn latest(&self) -> Option<ChildSession> {
        self.children.read().await.last().cloned()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<DapClient>> {
        self.children
            .read()
            .await
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.client.clone())
    }

    /// Most recently created ready child (latest-wins routing target).
    pub async fn active(&self) -> Option<Arc<DapClient>> {
        self.children
            .read()
            .await
            .iter()
            .rev()
            .find(|c| c.ready)
            .map(|c| c.client.clone())
    }

    /// Wait until some child is ready, up to `timeout`.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Option<Arc<DapClient>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(client) = self.active().await {
                return Some(client);
            }
            let notified = self.ready_notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    pub async fn has_any(&self) -> bool {
        !self.children.read().await.is_empty()
    }

    pub async fn count(&self) -> usize {
        self.children.read().await.len()
    }

    /// Disconnect and tear down every child.
    pub async fn shutdown_all(&self) {
        let drained: Vec<ChildSession> = {
            let mut children = self.children.write().await;
            children.drain(..).collect()
        };
        for child in drained {
            info!("Shutting down child session '{}'", child.id);
            let _ = child.client.disconnect().await;
            child.client.shutdown().await;
        }
    }
}
