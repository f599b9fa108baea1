//! Proxy worker plumbing: one worker per session owns the adapter process
//! and its DAP connection; the parent side holds a [`ProxyHandle`] that
//! correlates forwarded requests and fans worker events out to token-based
//! subscribers.

pub mod child;
pub mod envelope;
pub mod worker;

use crate::policy::PolicyRegistry;
use crate::{Error, Result};
use envelope::{
    channel_pair, DapCommand, InitPayload, ParentCommand, ParentEnvelope, WorkerEnvelope,
    WorkerMessage, WorkerStatus,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use worker::{ExitHook, ProxyWorker};

/// Result of one DAP request forwarded through the worker.
#[derive(Debug, Clone)]
pub struct DapOutcome {
    pub success: bool,
    pub body: Option<Value>,
    pub error: Option<String>,
}

impl DapOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            body: None,
            error: Some(error.into()),
        }
    }
}

/// What a dry-run init reported instead of connecting.
#[derive(Debug, Clone)]
pub struct DryRunSnapshot {
    pub command: String,
    pub script: String,
}

/// Typed stream of worker happenings the session manager subscribes to.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Status(WorkerStatus),
    Dap { event: String, body: Option<Value> },
    Error(String),
    Exit,
}

/// Token-based subscriber set. Unsubscribing twice is a no-op; close
/// drains the whole set so listener parity is checkable.
#[derive(Clone, Default)]
pub struct EventHub {
    subscribers: Arc<RwLock<HashMap<u64, mpsc::UnboundedSender<WorkerEvent>>>>,
    next_token: Arc<AtomicU64>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<WorkerEvent>) {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().await.insert(token, tx);
        (token, rx)
    }

    pub async fn unsubscribe(&self, token: u64) {
        // Absent token: already removed, nothing to do.
        self.subscribers.write().await.remove(&token);
    }

    pub async fn emit(&self, event: WorkerEvent) {
        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (token, tx) in subscribers.iter() {
                if tx.send(event.clone()).is_err() {
                    dead.push(*token);
                }
            }
        }
        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for token in dead {
                subscribers.remove(&token);
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn clear(&self) {
        self.subscribers.write().await.clear();
    }
}

/// Parent-side handle to one proxy worker. Exclusively owned by a session
/// for the duration of a debug run.
pub struct ProxyHandle {
    session_id: String,
    tx: mpsc::UnboundedSender<ParentEnvelope>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<DapOutcome>>>>,
    next_request_id: AtomicU64,
    events: EventHub,
    current_thread_id: Arc<RwLock<Option<i64>>>,
    connected: Arc<AtomicBool>,
    configured: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    dry_run: Arc<RwLock<Option<DryRunSnapshot>>>,
    worker_task: JoinHandle<()>,
    dispatcher_task: JoinHandle<()>,
}

impl ProxyHandle {
    /// Spawn a worker for this session and send it the init payload.
    pub fn start(init: InitPayload, registry: Arc<PolicyRegistry>, exit_hook: ExitHook) -> Self {
        let session_id = init.session_id.clone();
        let (parent, worker_endpoint) = channel_pair();

        let worker = ProxyWorker::new(worker_endpoint, registry, exit_hook);
        let worker_task = tokio::spawn(worker.run());

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<DapOutcome>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let events = EventHub::new();
        let current_thread_id = Arc::new(RwLock::new(None));
        let connected = Arc::new(AtomicBool::new(false));
        let configured = Arc::new(AtomicBool::new(false));
        let terminated = Arc::new(AtomicBool::new(false));
        let dry_run = Arc::new(RwLock::new(None));

        let dispatcher_task = tokio::spawn(Self::dispatch(
            parent.rx,
            pending.clone(),
            events.clone(),
            current_thread_id.clone(),
            connected.clone(),
            configured.clone(),
            terminated.clone(),
            dry_run.clone(),
        ));

        let tx = parent.tx;
        let _ = tx.send(ParentEnvelope {
            session_id: session_id.clone(),
            command: ParentCommand::Init(Box::new(init)),
        });

        Self {
            session_id,
            tx,
            pending,
            next_request_id: AtomicU64::new(1),
            events,
            current_thread_id,
            connected,
            configured,
            terminated,
            dry_run,
            worker_task,
            dispatcher_task,
        }
    }

    async fn dispatch(
        mut rx: mpsc::UnboundedReceiver<WorkerEnvelope>,
        pending: Arc<Mutex<HashMap<u64, oneshot::Sender<DapOutcome>>>>,
        events: EventHub,
        current_thread_id: Arc<RwLock<Option<i64>>>,
        connected: Arc<AtomicBool>,
        configured: Arc<AtomicBool>,
        terminated: Arc<AtomicBool>,
        dry_run: Arc<RwLock<Option<DryRunSnapshot>>>,
    ) {
        while let Some(envelope) = rx.recv().await {
            match envelope.message {
                WorkerMessage::DapResponse {
                    request_id,
                    success,
                    body,
                    error,
                } => {
                    let waiter = pending.lock().await.remove(&request_id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(DapOutcome {
                                success,
                                body,
                                error,
                            });
                        }
                        None => debug!(
                            "Dropping response for unknown worker request {}",
                            request_id
                        ),
                    }
                }
                WorkerMessage::Status(status) => {
                    match &status {
                        WorkerStatus::AdapterConnected => {
                            connected.store(true, Ordering::SeqCst);
                        }
                        WorkerStatus::AdapterConfiguredAndLaunched => {
                            connected.store(true, Ordering::SeqCst);
                            configured.store(true, Ordering::SeqCst);
                        }
                        WorkerStatus::DryRunComplete { command, script } => {
                            *dry_run.write().await = Some(DryRunSnapshot {
                                command: command.clone(),
                                script: script.clone(),
                            });
                        }
                        WorkerStatus::Terminated => {
                            connected.store(false, Ordering::SeqCst);
                            terminated.store(true, Ordering::SeqCst);
                        }
                        WorkerStatus::InitReceived => {}
                    }
                    events.emit(WorkerEvent::Status(status)).await;
                }
                WorkerMessage::DapEvent { event, body } => {
                    if event == "stopped" {
                        if let Some(thread_id) =
                            body.as_ref().and_then(|b| b.get("threadId")).and_then(Value::as_i64)
                        {
                            *current_thread_id.write().await = Some(thread_id);
                        }
                    }
                    events.emit(WorkerEvent::Dap { event, body }).await;
                }
                WorkerMessage::Error { message } => {
                    warn!("Worker error: {}", message);
                    events.emit(WorkerEvent::Error(message)).await;
                }
            }
        }

        // Worker channel closed: every in-flight request gets a rejection.
        connected.store(false, Ordering::SeqCst);
        terminated.store(true, Ordering::SeqCst);
        let mut pending = pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(DapOutcome::failure("disconnected"));
        }
        drop(pending);
        events.emit(WorkerEvent::Exit).await;
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The handshake finished: configurationDone was delivered and the
    /// worker reported adapter_configured_and_launched.
    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub async fn current_thread_id(&self) -> Option<i64> {
        *self.current_thread_id.read().await
    }

    pub async fn dry_run_snapshot(&self) -> Option<DryRunSnapshot> {
        self.dry_run.read().await.clone()
    }

    /// Forward one DAP request to the worker and await its outcome.
    pub async fn request(
        &self,
        command: &str,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<DapOutcome> {
        if self.is_terminated() {
            return Err(Error::ProxyNotRunning(self.session_id.clone()));
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        let sent = self.tx.send(ParentEnvelope {
            session_id: self.session_id.clone(),
            command: ParentCommand::Dap(DapCommand {
                request_id,
                command: command.to_string(),
                arguments,
                timeout_ms: timeout.map(|t| t.as_millis() as u64),
            }),
        });
        if sent.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(Error::ProxyNotRunning(self.session_id.clone()));
        }

        rx.await
            .map_err(|_| Error::ProxyNotRunning(self.session_id.clone()))
    }

    /// Wait for a worker event matching `pred`, up to `timeout`.
    pub async fn wait_for_event<F>(&self, timeout: Duration, mut pred: F) -> Option<WorkerEvent>
    where
        F: FnMut(&WorkerEvent) -> bool,
    {
        let (token, mut rx) = self.events.subscribe().await;
        let deadline = tokio::time::Instant::now() + timeout;

        let found = loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(event)) => {
                    let stop = matches!(event, WorkerEvent::Exit);
                    if pred(&event) {
                        break Some(event);
                    }
                    if stop {
                        break None;
                    }
                }
                Ok(None) | Err(_) => break None,
            }
        };

        self.events.unsubscribe(token).await;
        found
    }

    /// Ask the worker to shut down and wait briefly for it to finish.
    pub async fn stop(&self) {
        info!("Stopping worker for session {}", self.session_id);
        let _ = self.tx.send(ParentEnvelope {
            session_id: self.session_id.clone(),
            command: ParentCommand::Terminate,
        });

        let _ = self
            .wait_for_event(Duration::from_secs(5), |event| {
                matches!(
                    event,
                    WorkerEvent::Status(WorkerStatus::Terminated) | WorkerEvent::Exit
                )
            })
            .await;
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.worker_task.abort();
        self.dispatcher_task.abort();
    }
}
