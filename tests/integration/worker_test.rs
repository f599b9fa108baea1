//! Worker-level integration: envelope → proxy worker → scripted adapter
//! over real framed TCP.

#[path = "../helpers/mock_adapter.rs"]
mod mock_adapter;

use dap_bridge::policy::{AdapterSpawn, ConnectMode, PolicyRegistry};
use dap_bridge::proxy::envelope::{InitPayload, WorkerStatus};
use dap_bridge::proxy::worker::logging_exit_hook;
use dap_bridge::proxy::{ProxyHandle, WorkerEvent};
use mock_adapter::{MockAdapter, MockBehavior};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn payload(port: u16, log_dir: &std::path::Path, stop_on_entry: bool) -> InitPayload {
    InitPayload {
        session_id: "worker-it".to_string(),
        adapter_spawn: AdapterSpawn {
            command: None,
            args: vec![],
            env: HashMap::new(),
            connect: ConnectMode::Tcp { port },
        },
        launch_config: json!({
            "type": "mock",
            "request": "launch",
            "program": "/w/program.py",
            "stopOnEntry": stop_on_entry,
        }),
        stop_on_entry: Some(stop_on_entry),
        script_path: "/w/program.py".to_string(),
        initial_breakpoints: HashMap::new(),
        dry_run_spawn: false,
        log_dir: log_dir.to_path_buf(),
        trace_dir: None,
    }
}

fn start_worker(init: InitPayload) -> ProxyHandle {
    ProxyHandle::start(init, Arc::new(PolicyRegistry::new()), logging_exit_hook())
}

async fn wait_configured(worker: &ProxyHandle) {
    worker
        .wait_for_event(Duration::from_secs(5), |event| {
            matches!(
                event,
                WorkerEvent::Status(WorkerStatus::AdapterConfiguredAndLaunched)
            )
        })
        .await
        .expect("worker should finish the handshake");
}

#[tokio::test]
async fn test_handshake_reaches_configured_and_stops_on_entry() {
    let adapter = MockAdapter::spawn(MockBehavior::stopping()).await;
    let dir = tempfile::tempdir().unwrap();
    let worker = start_worker(payload(adapter.port, dir.path(), true));

    wait_configured(&worker).await;
    assert!(worker.is_configured());

    let stopped = worker
        .wait_for_event(Duration::from_secs(5), |event| {
            matches!(event, WorkerEvent::Dap { event, .. } if event == "stopped")
        })
        .await
        .expect("entry stop should be forwarded");
    match stopped {
        WorkerEvent::Dap { body, .. } => {
            assert_eq!(body.unwrap()["reason"], "entry");
        }
        other => panic!("unexpected event {other:?}"),
    }

    assert_eq!(worker.current_thread_id().await, Some(1));
    worker.stop().await;
    adapter.abort();
}

#[tokio::test]
async fn test_dap_requests_correlate_by_request_id() {
    let adapter = MockAdapter::spawn(MockBehavior::stopping()).await;
    let dir = tempfile::tempdir().unwrap();
    let worker = Arc::new(start_worker(payload(adapter.port, dir.path(), true)));
    wait_configured(&worker).await;

    // Two concurrent requests; each answer must land on its own waiter.
    let threads_task = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.request("threads", None, None).await })
    };
    let stack_task = {
        let worker = worker.clone();
        tokio::spawn(async move {
            worker
                .request("stackTrace", Some(json!({"threadId": 1})), None)
                .await
        })
    };

    let threads = threads_task.await.unwrap().unwrap();
    assert!(threads.success);
    assert_eq!(threads.body.unwrap()["threads"][0]["id"], 1);

    let stack = stack_task.await.unwrap().unwrap();
    assert!(stack.success);
    assert_eq!(stack.body.unwrap()["stackFrames"][0]["name"], "main");

    worker.stop().await;
    adapter.abort();
}

#[tokio::test]
async fn test_worker_stop_rejects_further_requests() {
    let adapter = MockAdapter::spawn(MockBehavior::stopping()).await;
    let dir = tempfile::tempdir().unwrap();
    let worker = start_worker(payload(adapter.port, dir.path(), true));
    wait_configured(&worker).await;

    worker.stop().await;
    assert!(worker.is_terminated());

    let err = worker.request("threads", None, None).await.unwrap_err();
    assert!(matches!(err, dap_bridge::Error::ProxyNotRunning(_)));
    adapter.abort();
}

#[tokio::test]
async fn test_program_completion_terminates_worker() {
    // No entry stop and no breakpoints: the "program" runs to completion
    // right after configuration.
    let adapter = MockAdapter::spawn(MockBehavior::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let worker = start_worker(payload(adapter.port, dir.path(), false));

    let terminated = worker
        .wait_for_event(Duration::from_secs(5), |event| {
            matches!(event, WorkerEvent::Dap { event, .. } if event == "terminated")
        })
        .await;
    assert!(terminated.is_some(), "terminated event should be forwarded");

    worker
        .wait_for_event(Duration::from_secs(5), |event| {
            matches!(
                event,
                WorkerEvent::Status(WorkerStatus::Terminated) | WorkerEvent::Exit
            )
        })
        .await
        .expect("worker should shut itself down");
    adapter.abort();
}

#[tokio::test]
async fn test_dry_run_via_handle() {
    let dir = tempfile::tempdir().unwrap();
    let mut init = payload(39999, dir.path(), false);
    init.adapter_spawn = AdapterSpawn {
        command: Some("python3".to_string()),
        args: vec![
            "-m".to_string(),
            "debugpy.adapter".to_string(),
            "--port".to_string(),
            "39999".to_string(),
        ],
        env: HashMap::new(),
        connect: ConnectMode::Tcp { port: 39999 },
    };
    init.dry_run_spawn = true;

    let worker = start_worker(init);
    worker
        .wait_for_event(Duration::from_secs(5), |event| {
            matches!(
                event,
                WorkerEvent::Status(WorkerStatus::DryRunComplete { .. })
            )
        })
        .await
        .expect("dry run should complete");

    let snapshot = worker.dry_run_snapshot().await.unwrap();
    assert!(snapshot.command.contains("debugpy.adapter"));
    assert_eq!(snapshot.script, "/w/program.py");

    // No connection was attempted: the worker goes straight to Terminated.
    worker
        .wait_for_event(Duration::from_secs(5), |event| {
            matches!(
                event,
                WorkerEvent::Status(WorkerStatus::Terminated) | WorkerEvent::Exit
            )
        })
        .await
        .expect("dry run worker should terminate");
}
