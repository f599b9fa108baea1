//! Correlates outgoing DAP requests with inbound responses by sequence
//! number and enforces a per-request deadline.

use crate::dap::types::Response;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct PendingRequest {
    command: String,
    tx: oneshot::Sender<Result<Response>>,
    deadline: JoinHandle<()>,
}

pub struct RequestTracker {
    seq_counter: AtomicI64,
    pending: Arc<Mutex<HashMap<i64, PendingRequest>>>,
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            seq_counter: AtomicI64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Allocate the next request sequence number.
    pub fn next_seq(&self) -> i64 {
        self.seq_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a pending request and start its deadline. The receiver
    /// resolves with the adapter's response or rejects on timeout.
    pub async fn register(
        &self,
        seq: i64,
        command: &str,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<Response>> {
        let (tx, rx) = oneshot::channel();

        let pending = self.pending.clone();
        let timed_out_command = command.to_string();
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut pending = pending.lock().await;
            if let Some(entry) = pending.remove(&seq) {
                warn!(
                    "Request '{}' (seq {}) timed out after {:?}",
                    timed_out_command, seq, timeout
                );
                let _ = entry.tx.send(Err(Error::DapTimeout(format!(
                    "Request '{}' timed out after {:?}",
                    timed_out_command, timeout
                ))));
            }
        });

        let entry = PendingRequest {
            command: command.to_string(),
            tx,
            deadline,
        };
        self.pending.lock().await.insert(seq, entry);

        rx
    }

    /// Route an inbound response to its waiter. Resolves on `success`,
    /// rejects with the extracted adapter error otherwise. A response for
    /// an evicted seq (timed out or never registered) is logged and dropped.
    pub async fn resolve(&self, response: Response) {
        let mut pending = self.pending.lock().await;
        let Some(entry) = pending.remove(&response.request_seq) else {
            debug!(
                "Dropping late response for unknown request_seq {} ({})",
                response.request_seq, response.command
            );
            return;
        };
        drop(pending);

        entry.deadline.abort();

        let outcome = if response.success {
            Ok(response)
        } else {
            Err(Error::Dap(response.error_text()))
        };

        if entry.tx.send(outcome).is_err() {
            debug!("Waiter for '{}' went away before response", entry.command);
        }
    }

    /// Reject every pending request, e.g. on adapter disconnect.
    pub async fn fail_all(&self, reason: &str) {
        let mut pending = self.pending.lock().await;
        for (seq, entry) in pending.drain() {
            entry.deadline.abort();
            debug!("Rejecting pending request seq {} ({})", seq, reason);
            let _ = entry.tx.send(Err(Error::Dap(reason.to_string())));
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
