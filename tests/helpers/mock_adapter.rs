//! Scripted DAP adapters for integration tests.
//!
//! Each mock listens on a local TCP port and speaks real Content-Length
//! framed DAP, so the full framer → client → worker → manager path is
//! exercised. `MockAdapter` plays a single-session debugger (debugpy
//! shaped); `MockJsDebug` plays a parent that announces a child session via
//! a reverse `startDebugging` request.

use dap_bridge::dap::framing::{encode_message, FrameDecoder};
use dap_bridge::dap::types::{Event, Message, Request, Response};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// One framed DAP peer over a TCP stream.
pub struct DapPeer {
    stream: TcpStream,
    decoder: FrameDecoder,
    seq: AtomicI64,
}

impl DapPeer {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
            seq: AtomicI64::new(1),
        }
    }

    pub async fn read_message(&mut self) -> Option<Message> {
        loop {
            if let Some(result) = self.decoder.next_message() {
                return result.ok();
            }
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.decoder.push(&chunk[..n]),
            }
        }
    }

    pub async fn read_request(&mut self) -> Option<Request> {
        loop {
            match self.read_message().await? {
                Message::Request(req) => return Some(req),
                _ => continue,
            }
        }
    }

    pub async fn send(&mut self, msg: &Message) {
        let bytes = encode_message(msg).expect("encode");
        let _ = self.stream.write_all(&bytes).await;
        let _ = self.stream.flush().await;
    }

    pub async fn respond(&mut self, req: &Request, success: bool, body: Option<Value>) {
        self.respond_with_message(req, success, body, None).await;
    }

    pub async fn respond_with_message(
        &mut self,
        req: &Request,
        success: bool,
        body: Option<Value>,
        message: Option<String>,
    ) {
        let response = Message::Response(Response {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            request_seq: req.seq,
            command: req.command.clone(),
            success,
            message,
            body,
        });
        self.send(&response).await;
    }

    pub async fn send_event(&mut self, event: &str, body: Option<Value>) {
        let event = Message::Event(Event {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            event: event.to_string(),
            body,
        });
        self.send(&event).await;
    }

    pub async fn send_reverse_request(&mut self, command: &str, arguments: Option<Value>) {
        let request = Message::Request(Request {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            command: command.to_string(),
            arguments,
        });
        self.send(&request).await;
    }
}

#[derive(Debug, Clone)]
pub struct EvalReply {
    pub success: bool,
    pub result: String,
    pub type_: Option<String>,
    pub variables_reference: i64,
    pub error: Option<String>,
}

impl EvalReply {
    pub fn ok(result: &str) -> Self {
        Self {
            success: true,
            result: result.to_string(),
            type_: None,
            variables_reference: 0,
            error: None,
        }
    }

    pub fn compound(result: &str, type_: &str, variables_reference: i64) -> Self {
        Self {
            success: true,
            result: result.to_string(),
            type_: Some(type_.to_string()),
            variables_reference,
            error: None,
        }
    }

    pub fn err(message: &str) -> Self {
        Self {
            success: false,
            result: String::new(),
            type_: None,
            variables_reference: 0,
            error: Some(message.to_string()),
        }
    }
}

/// Script knobs for the single-session mock.
#[derive(Default)]
pub struct MockBehavior {
    /// Lines where successive `continue`s stop; empty means the program
    /// runs to completion on continue.
    pub breakpoint_stop_lines: VecDeque<i64>,
    /// Replies per expression, consumed front to back.
    pub eval: HashMap<String, VecDeque<EvalReply>>,
    /// Children served for a `variables` request, keyed by reference.
    pub variables: HashMap<i64, Value>,
    /// Breakpoints verify unless told otherwise.
    pub fail_breakpoint_verification: bool,
    /// Adapter message attached to unverified breakpoints.
    pub breakpoint_message: Option<String>,
    /// Steps report a stop unless disabled (step-timeout scenario).
    pub steps_stop: bool,
    /// Emit an entry stop even when the launch config said not to, like
    /// debuggers that always honor --stop-at-load.
    pub entry_stop_despite_launch: bool,
    /// Keep "running" instead of terminating when nothing stops the
    /// program (pause scenario).
    pub run_forever: bool,
    /// Every setBreakpoints batch observed, as the list of lines sent.
    pub breakpoint_batches: Arc<std::sync::Mutex<Vec<Vec<i64>>>>,
}

impl MockBehavior {
    pub fn stopping() -> Self {
        Self {
            steps_stop: true,
            ..Default::default()
        }
    }
}

pub struct MockAdapter {
    pub port: u16,
    handle: tokio::task::JoinHandle<()>,
}

impl MockAdapter {
    pub async fn spawn(behavior: MockBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let handle = tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                serve_single(DapPeer::new(stream), behavior).await;
            }
        });
        Self { port, handle }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

async fn serve_single(mut peer: DapPeer, mut behavior: MockBehavior) {
    let mut launch_req: Option<Request> = None;
    let mut stop_on_entry = false;
    let mut program = String::from("/w/program");
    let mut current_line: i64 = 1;

    while let Some(req) = peer.read_request().await {
        match req.command.as_str() {
            "initialize" => {
                peer.respond(
                    &req,
                    true,
                    Some(json!({
                        "supportsConfigurationDoneRequest": true,
                        "supportsConditionalBreakpoints": true,
                    })),
                )
                .await;
            }
            "launch" => {
                if let Some(args) = &req.arguments {
                    stop_on_entry = args
                        .get("stopOnEntry")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    if let Some(p) = args.get("program").and_then(Value::as_str) {
                        program = p.to_string();
                    }
                }
                launch_req = Some(req);
                peer.send_event("initialized", None).await;
            }
            "setBreakpoints" => {
                let lines: Vec<i64> = req
                    .arguments
                    .as_ref()
                    .and_then(|a| a.get("breakpoints"))
                    .and_then(Value::as_array)
                    .map(|bps| {
                        bps.iter()
                            .filter_map(|bp| bp.get("line").and_then(Value::as_i64))
                            .collect()
                    })
                    .unwrap_or_default();
                behavior
                    .breakpoint_batches
                    .lock()
                    .expect("batch lock")
                    .push(lines.clone());
                let verified = !behavior.fail_breakpoint_verification;
                let breakpoints: Vec<Value> = lines
                    .iter()
                    .enumerate()
                    .map(|(i, line)| {
                        let mut bp = json!({
                            "id": i as i64 + 1,
                            "verified": verified,
                            "line": line,
                        });
                        if let Some(message) = &behavior.breakpoint_message {
                            bp["message"] = json!(message);
                        }
                        bp
                    })
                    .collect();
                peer.respond(&req, true, Some(json!({"breakpoints": breakpoints})))
                    .await;
            }
            "configurationDone" => {
                peer.respond(&req, true, None).await;
                if let Some(launch) = launch_req.take() {
                    peer.respond(&launch, true, None).await;
                }
                if stop_on_entry || behavior.entry_stop_despite_launch {
                    current_line = 1;
                    peer.send_event(
                        "stopped",
                        Some(json!({"reason": "entry", "threadId": 1})),
                    )
                    .await;
                } else if let Some(line) = behavior.breakpoint_stop_lines.pop_front() {
                    current_line = line;
                    peer.send_event(
                        "stopped",
                        Some(json!({"reason": "breakpoint", "threadId": 1})),
                    )
                    .await;
                } else if !behavior.run_forever {
                    peer.send_event("exited", Some(json!({"exitCode": 0}))).await;
                    peer.send_event("terminated", None).await;
                    break;
                }
            }
            "threads" => {
                peer.respond(
                    &req,
                    true,
                    Some(json!({"threads": [{"id": 1, "name": "main"}]})),
                )
                .await;
            }
            "stackTrace" => {
                peer.respond(
                    &req,
                    true,
                    Some(json!({
                        "stackFrames": [{
                            "id": 11,
                            "name": "main",
                            "source": {"path": program},
                            "line": current_line,
                            "column": 1,
                        }],
                        "totalFrames": 1,
                    })),
                )
                .await;
            }
            "scopes" => {
                peer.respond(
                    &req,
                    true,
                    Some(json!({
                        "scopes": [
                            {"name": "Locals", "variablesReference": 1000, "expensive": false},
                        ],
                    })),
                )
                .await;
            }
            "variables" => {
                let reference = req
                    .arguments
                    .as_ref()
                    .and_then(|a| a.get("variablesReference"))
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                let variables = behavior
                    .variables
                    .get(&reference)
                    .cloned()
                    .unwrap_or_else(|| json!([]));
                peer.respond(&req, true, Some(json!({"variables": variables})))
                    .await;
            }
            "evaluate" => {
                let expression = req
                    .arguments
                    .as_ref()
                    .and_then(|a| a.get("expression"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let reply = behavior
                    .eval
                    .get_mut(&expression)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or_else(|| EvalReply::ok("0"));
                if reply.success {
                    peer.respond(
                        &req,
                        true,
                        Some(json!({
                            "result": reply.result,
                            "type": reply.type_,
                            "variablesReference": reply.variables_reference,
                        })),
                    )
                    .await;
                } else {
                    let message = reply.error.unwrap_or_else(|| "evaluation failed".into());
                    peer.respond_with_message(
                        &req,
                        false,
                        Some(json!({"error": {"format": message.clone()}})),
                        Some(message),
                    )
                    .await;
                }
            }
            "next" | "stepIn" | "stepOut" => {
                peer.respond(&req, true, None).await;
                if behavior.steps_stop {
                    current_line += 1;
                    peer.send_event(
                        "stopped",
                        Some(json!({"reason": "step", "threadId": 1})),
                    )
                    .await;
                }
            }
            "continue" => {
                peer.respond(&req, true, Some(json!({"allThreadsContinued": true})))
                    .await;
                if let Some(line) = behavior.breakpoint_stop_lines.pop_front() {
                    current_line = line;
                    peer.send_event(
                        "stopped",
                        Some(json!({"reason": "breakpoint", "threadId": 1})),
                    )
                    .await;
                } else if !behavior.run_forever {
                    peer.send_event("exited", Some(json!({"exitCode": 0}))).await;
                    peer.send_event("terminated", None).await;
                    break;
                }
            }
            "pause" => {
                peer.respond(&req, true, None).await;
                peer.send_event(
                    "stopped",
                    Some(json!({"reason": "pause", "threadId": 1})),
                )
                .await;
            }
            "disconnect" | "terminate" => {
                peer.respond(&req, true, None).await;
                break;
            }
            _ => {
                peer.respond(&req, true, Some(json!({}))).await;
            }
        }
    }
}

/// Parent/child pair mimicking vscode-js-debug: the first connection is the
/// coordinating parent; a reverse `startDebugging` makes the bridge open a
/// second connection, which this mock serves as the child that actually
/// "runs" code.
pub struct MockJsDebug {
    pub port: u16,
    /// Every command either connection saw, in arrival order, prefixed
    /// with "parent:" or "child:".
    pub log: Arc<Mutex<Vec<String>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockJsDebug {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = log.clone();

        let handle = tokio::spawn(async move {
            let Ok((parent_stream, _)) = listener.accept().await else {
                return;
            };
            let mut parent = DapPeer::new(parent_stream);

            // Parent conversation until launch, then announce the child.
            let mut launch_req = None;
            while let Some(req) = parent.read_request().await {
                seen.lock().await.push(format!("parent:{}", req.command));
                match req.command.as_str() {
                    "initialize" => {
                        parent
                            .respond(
                                &req,
                                true,
                                Some(json!({"supportsConfigurationDoneRequest": true})),
                            )
                            .await;
                    }
                    "launch" => {
                        launch_req = Some(req);
                        // Announce the child before initialized so the
                        // bridge sees the adoption in flight when it
                        // decides whether to defer configurationDone.
                        parent
                            .send_reverse_request(
                                "startDebugging",
                                Some(json!({
                                    "request": "attach",
                                    "configuration": {
                                        "type": "pwa-node",
                                        "__pendingTargetId": "target-1",
                                    },
                                })),
                            )
                            .await;
                        parent.send_event("initialized", None).await;
                        break;
                    }
                    _ => {
                        parent.respond(&req, true, Some(json!({}))).await;
                    }
                }
            }

            // The bridge now opens the child connection on the same port.
            let child_task = {
                let seen = seen.clone();
                let Ok((child_stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut child = DapPeer::new(child_stream);
                    let current_line = 3;
                    while let Some(req) = child.read_request().await {
                        seen.lock().await.push(format!("child:{}", req.command));
                        match req.command.as_str() {
                            "initialize" => {
                                child.respond(&req, true, Some(json!({}))).await;
                            }
                            "launch" => {
                                // Matched to the pending target; js-debug
                                // never answers this one.
                            }
                            "setBreakpoints" => {
                                let count = req
                                    .arguments
                                    .as_ref()
                                    .and_then(|a| a.get("breakpoints"))
                                    .and_then(Value::as_array)
                                    .map(Vec::len)
                                    .unwrap_or(0);
                                let breakpoints: Vec<Value> = (0..count)
                                    .map(|i| json!({"id": i + 1, "verified": true}))
                                    .collect();
                                child
                                    .respond(
                                        &req,
                                        true,
                                        Some(json!({"breakpoints": breakpoints})),
                                    )
                                    .await;
                            }
                            "configurationDone" => {
                                child.respond(&req, true, None).await;
                                child
                                    .send_event(
                                        "stopped",
                                        Some(json!({
                                            "reason": "breakpoint",
                                            "threadId": 1,
                                        })),
                                    )
                                    .await;
                            }
                            "stackTrace" => {
                                child
                                    .respond(
                                        &req,
                                        true,
                                        Some(json!({
                                            "stackFrames": [{
                                                "id": 21,
                                                "name": "childMain",
                                                "source": {"path": "/w/app.js"},
                                                "line": current_line,
                                                "column": 1,
                                            }],
                                        })),
                                    )
                                    .await;
                            }
                            "continue" => {
                                child.respond(&req, true, None).await;
                            }
                            "disconnect" | "terminate" => {
                                child.respond(&req, true, None).await;
                                break;
                            }
                            _ => {
                                child.respond(&req, true, Some(json!({}))).await;
                            }
                        }
                    }
                })
            };

            // Meanwhile finish the parent conversation.
            while let Some(req) = parent.read_request().await {
                seen.lock().await.push(format!("parent:{}", req.command));
                match req.command.as_str() {
                    "setBreakpoints" => {
                        let count = req
                            .arguments
                            .as_ref()
                            .and_then(|a| a.get("breakpoints"))
                            .and_then(Value::as_array)
                            .map(Vec::len)
                            .unwrap_or(0);
                        let breakpoints: Vec<Value> = (0..count)
                            .map(|i| json!({"id": i + 1, "verified": true}))
                            .collect();
                        parent
                            .respond(&req, true, Some(json!({"breakpoints": breakpoints})))
                            .await;
                    }
                    "configurationDone" => {
                        parent.respond(&req, true, None).await;
                        if let Some(launch) = launch_req.take() {
                            parent.respond(&launch, true, None).await;
                        }
                    }
                    "disconnect" | "terminate" => {
                        parent.respond(&req, true, None).await;
                        break;
                    }
                    _ => {
                        parent.respond(&req, true, Some(json!({}))).await;
                    }
                }
            }

            let _ = child_task.await;
        });

        Self { port, log, handle }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}
