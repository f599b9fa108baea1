//! DAP client: owns the reader/writer tasks for one adapter connection,
//! correlates responses through the request tracker, and surfaces events
//! and reverse requests to its owner as a typed inbound stream.

use crate::dap::requests::{RequestTracker, DEFAULT_REQUEST_TIMEOUT};
use crate::dap::trace::{Direction, FrameTracer};
use crate::dap::transport_trait::{DapReader, DapWriter};
use crate::dap::types::*;
use crate::{Error, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What the connection hands to its owner besides correlated responses.
#[derive(Debug)]
pub enum InboundMessage {
    /// Adapter-initiated event (`stopped`, `initialized`, ...).
    Event(Event),
    /// Adapter-initiated request to us (`runInTerminal`, `startDebugging`).
    ReverseRequest(Request),
    /// The connection died; no further messages will arrive.
    Closed(String),
}

pub struct DapClient {
    tracker: Arc<RequestTracker>,
    write_tx: mpsc::UnboundedSender<Message>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl DapClient {
    /// Wire up reader/writer tasks over a split transport. Returns the
    /// client and the inbound stream of events and reverse requests.
    pub fn new(
        reader: Box<dyn DapReader>,
        writer: Box<dyn DapWriter>,
        tracer: Option<FrameTracer>,
    ) -> (Self, mpsc::UnboundedReceiver<InboundMessage>) {
        let tracker = Arc::new(RequestTracker::new());
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let tracer = Arc::new(Mutex::new(tracer));

        let reader_task = tokio::spawn(Self::read_loop(
            reader,
            tracker.clone(),
            inbound_tx,
            tracer.clone(),
        ));
        let writer_task = tokio::spawn(Self::write_loop(writer, write_rx, tracer));

        (
            Self {
                tracker,
                write_tx,
                reader_task,
                writer_task,
            },
            inbound_rx,
        )
    }

    async fn read_loop(
        mut reader: Box<dyn DapReader>,
        tracker: Arc<RequestTracker>,
        inbound_tx: mpsc::UnboundedSender<InboundMessage>,
        tracer: Arc<Mutex<Option<FrameTracer>>>,
    ) {
        loop {
            let msg = match reader.read_message().await {
                Ok(msg) => msg,
                Err(e) => {
                    info!("DAP read loop ended: {}", e);
                    tracker.fail_all("disconnected").await;
                    let _ = inbound_tx.send(InboundMessage::Closed(e.to_string()));
                    break;
                }
            };

            if let Some(tracer) = tracer.lock().await.as_mut() {
                if let Ok(payload) = serde_json::to_value(&msg) {
                    tracer.record(Direction::In, &payload).await;
                }
            }

            match msg {
                Message::Response(resp) => {
                    debug!(
                        "Received response for seq {} ({})",
                        resp.request_seq, resp.command
                    );
                    tracker.resolve(resp).await;
                }
                Message::Event(event) => {
                    debug!("Received event '{}'", event.event);
                    if inbound_tx.send(InboundMessage::Event(event)).is_err() {
                        break;
                    }
                }
                Message::Request(req) => {
                    debug!("Received reverse request '{}'", req.command);
                    if inbound_tx.send(InboundMessage::ReverseRequest(req)).is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn write_loop(
        mut writer: Box<dyn DapWriter>,
        mut write_rx: mpsc::UnboundedReceiver<Message>,
        tracer: Arc<Mutex<Option<FrameTracer>>>,
    ) {
        while let Some(message) = write_rx.recv().await {
            if let Some(tracer) = tracer.lock().await.as_mut() {
                if let Ok(payload) = serde_json::to_value(&message) {
                    tracer.record(Direction::Out, &payload).await;
                }
            }

            if let Err(e) = writer.write_message(&message).await {
                error!("Failed to write DAP message: {}", e);
                break;
            }
        }
    }

    /// Send a request and await its response under the default deadline.
    pub async fn send_request(&self, command: &str, arguments: Option<Value>) -> Result<Response> {
        self.send_request_with_timeout(command, arguments, DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    /// Send a request with an explicit per-request deadline.
    pub async fn send_request_with_timeout(
        &self,
        command: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<Response> {
        let seq = self.tracker.next_seq();
        let rx = self.tracker.register(seq, command, timeout).await;

        debug!("Sending '{}' request (seq {})", command, seq);
        let request = Request {
            seq,
            command: command.to_string(),
            arguments,
        };
        self.write_tx
            .send(Message::Request(request))
            .map_err(|_| Error::Dap("Write channel closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Dap("Request cancelled or connection closed".to_string()))?
    }

    /// Fire-and-forget request for commands that never get a response
    /// (e.g. a js-debug child `launch` carrying `__pendingTargetId`).
    pub fn send_request_nowait(&self, command: &str, arguments: Option<Value>) -> Result<i64> {
        let seq = self.tracker.next_seq();
        debug!("Sending '{}' request without waiting (seq {})", command, seq);
        let request = Request {
            seq,
            command: command.to_string(),
            arguments,
        };
        self.write_tx
            .send(Message::Request(request))
            .map_err(|_| Error::Dap("Write channel closed".to_string()))?;
        Ok(seq)
    }

    /// Answer a reverse request from the adapter.
    pub fn send_response(
        &self,
        request_seq: i64,
        command: &str,
        success: bool,
        body: Option<Value>,
    ) -> Result<()> {
        let response = Response {
            seq: self.tracker.next_seq(),
            request_seq,
            command: command.to_string(),
            success,
            message: None,
            body,
        };
        self.write_tx
            .send(Message::Response(response))
            .map_err(|_| Error::Dap("Write channel closed".to_string()))
    }

    /// Reject everything in flight and stop both IO tasks.
    pub async fn shutdown(&self) {
        self.tracker.fail_all("disconnected").await;
        self.reader_task.abort();
        self.writer_task.abort();
    }

    pub async fn pending_request_count(&self) -> usize {
        self.tracker.pending_count().await
    }

    // === Typed helpers for the handshake path ===

    pub async fn initialize(&self, args: InitializeRequestArguments) -> Result<Capabilities> {
        let response = self
            .send_request("initialize", Some(serde_json::to_value(&args)?))
            .await?;

        let caps = match response.body {
            Some(body) => serde_json::from_value(body)
                .map_err(|e| Error::Dap(format!("Failed to parse capabilities: {}", e)))?,
            None => Capabilities::default(),
        };
        Ok(caps)
    }

    pub async fn launch(&self, args: Value) -> Result<()> {
        self.send_request("launch", Some(args)).await?;
        Ok(())
    }

    pub async fn configuration_done(&self) -> Result<()> {
        self.send_request("configurationDone", None).await?;
        Ok(())
    }

    pub async fn set_breakpoints(
        &self,
        source: Source,
        breakpoints: Vec<SourceBreakpoint>,
    ) -> Result<Vec<Breakpoint>> {
        let args = SetBreakpointsArguments {
            source,
            breakpoints: Some(breakpoints),
            source_modified: Some(false),
        };
        let response = self
            .send_request("setBreakpoints", Some(serde_json::to_value(&args)?))
            .await?;

        #[derive(serde::Deserialize)]
        struct SetBreakpointsResponse {
            breakpoints: Vec<Breakpoint>,
        }

        let body: SetBreakpointsResponse = response
            .body
            .ok_or_else(|| Error::Dap("No breakpoints in response".to_string()))
            .and_then(|v| {
                serde_json::from_value(v)
                    .map_err(|e| Error::Dap(format!("Failed to parse breakpoints: {}", e)))
            })?;

        Ok(body.breakpoints)
    }

    pub async fn threads(&self) -> Result<Vec<Thread>> {
        let response = self.send_request("threads", None).await?;

        #[derive(serde::Deserialize)]
        struct ThreadsResponse {
            threads: Vec<Thread>,
        }

        let body: ThreadsResponse = response
            .body
            .ok_or_else(|| Error::Dap("No threads in response".to_string()))
            .and_then(|v| {
                serde_json::from_value(v)
                    .map_err(|e| Error::Dap(format!("Failed to parse threads: {}", e)))
            })?;

        Ok(body.threads)
    }

    pub async fn pause(&self, thread_id: i64) -> Result<()> {
        let args = PauseArguments { thread_id };
        self.send_request("pause", Some(serde_json::to_value(&args)?))
            .await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        let response = self
            .send_request_with_timeout("disconnect", None, Duration::from_secs(2))
            .await;
        if let Err(e) = response {
            warn!("Disconnect failed: {}, proceeding with cleanup", e);
        }
        Ok(())
    }
}

impl Drop for DapClient {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}
