//! Session-manager integration against a scripted adapter: the complete
//! tool-call surface, end to end.

#[path = "../helpers/mock_adapter.rs"]
mod mock_adapter;

use dap_bridge::config::CoreEnv;
use dap_bridge::policy::{AdapterSpawn, ConnectMode};
use dap_bridge::session::manager::{SessionManager, StartDebuggingArgs};
use dap_bridge::session::state::{ExecutionState, Lifecycle};
use dap_bridge::Error;
use mock_adapter::{EvalReply, MockAdapter, MockBehavior};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::time::Duration;

fn manager() -> SessionManager {
    let dir = tempfile::tempdir().unwrap();
    SessionManager::with_base_log_dir(CoreEnv::default(), dir.keep())
}

fn script_file(name: &str, content: &str) -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(content.as_bytes()).unwrap();
    (dir, path.to_string_lossy().into_owned())
}

fn attach_spawn(port: u16) -> AdapterSpawn {
    AdapterSpawn {
        command: None,
        args: vec![],
        env: HashMap::new(),
        connect: ConnectMode::Tcp { port },
    }
}

fn start_args(script: &str, port: u16, launch: Option<serde_json::Value>) -> StartDebuggingArgs {
    StartDebuggingArgs {
        script_path: script.to_string(),
        args: vec![],
        dap_launch_args: launch,
        dry_run: false,
        dry_run_timeout_ms: None,
        adapter_launch_override: Some(attach_spawn(port)),
    }
}

/// Poll until the session reports Paused, returning the reason.
async fn wait_paused(mgr: &SessionManager, id: &str) -> (i64, String) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let info = mgr.get_session(id).await.unwrap();
        if let ExecutionState::Paused { thread_id, reason } = info.execution {
            return (thread_id, reason);
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session never paused; last state {:?}",
            info.execution
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_state(mgr: &SessionManager, id: &str, pred: impl Fn(&ExecutionState) -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let info = mgr.get_session(id).await.unwrap();
        if pred(&info.execution) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "state predicate never satisfied; last state {:?}",
            info.execution
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_dry_run_reports_debugpy_command() {
    let mgr = manager();
    let (_dir, script) = script_file("ex.py", "x = 1\nprint(x)\n");
    // The interpreter hint is used verbatim; nothing is spawned on a dry
    // run, so it does not need to exist.
    let info = mgr
        .create_session("python", None, Some("/opt/venv/bin/python".to_string()))
        .await
        .unwrap();

    let result = mgr
        .start_debugging(
            &info.id,
            StartDebuggingArgs {
                script_path: script.clone(),
                dry_run: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.state, ExecutionState::Stopped);
    let data = result.data.unwrap();
    assert_eq!(data["dryRun"], true);
    assert!(data["command"].as_str().unwrap().contains("debugpy.adapter"));
    assert_eq!(data["script"], script.as_str());
}

#[tokio::test]
async fn test_stop_on_entry_reports_entry_reason() {
    let adapter = MockAdapter::spawn(MockBehavior::stopping()).await;
    let mgr = manager();
    let (_dir, script) = script_file("main.py", "a = 1\nb = 2\n");
    let info = mgr.create_session("mock", None, None).await.unwrap();

    let result = mgr
        .start_debugging(
            &info.id,
            start_args(&script, adapter.port, Some(json!({"stopOnEntry": true}))),
        )
        .await
        .unwrap();

    assert!(result.success, "start failed: {:?}", result.error);
    assert!(matches!(result.state, ExecutionState::Paused { .. }));
    assert_eq!(result.reason.as_deref(), Some("entry"));

    mgr.close_session(&info.id).await.unwrap();
    adapter.abort();
}

#[tokio::test]
async fn test_entry_stop_auto_continues_to_breakpoint() {
    let behavior = MockBehavior {
        entry_stop_despite_launch: true,
        breakpoint_stop_lines: VecDeque::from([7]),
        steps_stop: true,
        ..Default::default()
    };
    let adapter = MockAdapter::spawn(behavior).await;
    let mgr = manager();
    let (_dir, script) = script_file("loop.js", "for (let i = 0; i < 10; i++) {}\n");
    let info = mgr.create_session("mock", None, None).await.unwrap();
    mgr.set_breakpoint(&info.id, &script, 7, None).await.unwrap();

    // stopOnEntry unset: the bridge must swallow the entry stop and
    // continue to the breakpoint without client action.
    let result = mgr
        .start_debugging(&info.id, start_args(&script, adapter.port, None))
        .await
        .unwrap();
    assert!(result.success, "start failed: {:?}", result.error);

    let (_thread, reason) = wait_paused(&mgr, &info.id).await;
    assert_eq!(reason, "breakpoint");

    mgr.close_session(&info.id).await.unwrap();
    adapter.abort();
}

#[tokio::test]
async fn test_conditional_breakpoint_and_evaluate_sequence() {
    let behavior = MockBehavior {
        breakpoint_stop_lines: VecDeque::from([7, 7]),
        eval: HashMap::from([(
            "i".to_string(),
            VecDeque::from([EvalReply::ok("6"), EvalReply::ok("7")]),
        )]),
        steps_stop: true,
        ..Default::default()
    };
    let adapter = MockAdapter::spawn(behavior).await;
    let mgr = manager();
    let (_dir, script) = script_file("loop.js", "for (let i = 0; i < 10; i++) {}\n");
    let info = mgr.create_session("mock", None, None).await.unwrap();

    let bp = mgr
        .set_breakpoint(&info.id, &script, 7, Some("i > 5".to_string()))
        .await
        .unwrap();
    assert_eq!(bp.condition.as_deref(), Some("i > 5"));

    let result = mgr
        .start_debugging(&info.id, start_args(&script, adapter.port, None))
        .await
        .unwrap();
    assert!(result.success);

    wait_paused(&mgr, &info.id).await;
    let outcome = mgr
        .evaluate_expression(&info.id, "i", None, None)
        .await
        .unwrap();
    assert!(outcome.success);
    assert!(outcome.result.unwrap().contains('6'));

    let control = mgr.continue_execution(&info.id).await.unwrap();
    assert!(control.success);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let outcome = mgr
        .evaluate_expression(&info.id, "i", None, None)
        .await
        .unwrap();
    assert!(outcome.success);
    assert!(outcome.result.unwrap().contains('7'));

    mgr.close_session(&info.id).await.unwrap();
    adapter.abort();
}

#[tokio::test]
async fn test_step_over_returns_next_location() {
    let adapter = MockAdapter::spawn(MockBehavior::stopping()).await;
    let mgr = manager();
    let (_dir, script) = script_file("main.py", "a = 1\nb = 2\nc = 3\n");
    let info = mgr.create_session("mock", None, None).await.unwrap();

    let result = mgr
        .start_debugging(
            &info.id,
            start_args(&script, adapter.port, Some(json!({"stopOnEntry": true}))),
        )
        .await
        .unwrap();
    assert!(result.success);
    wait_paused(&mgr, &info.id).await;

    let step = mgr.step_over(&info.id).await.unwrap();
    assert!(step.success, "step failed: {:?}", step.error);
    let location = step.location.expect("stop within 5s must carry a location");
    assert_eq!(location.file, script);
    assert_eq!(location.line, 2);

    mgr.close_session(&info.id).await.unwrap();
    adapter.abort();
}

#[tokio::test]
async fn test_step_timeout_leaves_session_running() {
    let behavior = MockBehavior {
        entry_stop_despite_launch: true,
        run_forever: true,
        steps_stop: false,
        ..Default::default()
    };
    let adapter = MockAdapter::spawn(behavior).await;
    let mgr = manager();
    let (_dir, script) = script_file("main.py", "a = 1\n");
    let info = mgr.create_session("mock", None, None).await.unwrap();

    let result = mgr
        .start_debugging(
            &info.id,
            start_args(&script, adapter.port, Some(json!({"stopOnEntry": true}))),
        )
        .await
        .unwrap();
    assert!(result.success);
    wait_paused(&mgr, &info.id).await;

    let step = mgr.step_over(&info.id).await.unwrap();
    assert!(!step.success);
    assert!(step.error.unwrap().contains("step timed out"));
    assert_eq!(step.state, ExecutionState::Running);

    mgr.close_session(&info.id).await.unwrap();
    adapter.abort();
}

#[tokio::test]
async fn test_evaluate_undefined_name_classified() {
    let behavior = MockBehavior {
        eval: HashMap::from([(
            "undefined_var".to_string(),
            VecDeque::from([EvalReply::err(
                "NameError: name 'undefined_var' is not defined",
            )]),
        )]),
        steps_stop: true,
        ..Default::default()
    };
    let adapter = MockAdapter::spawn(behavior).await;
    let mgr = manager();
    let (_dir, script) = script_file("main.py", "a = 1\n");
    let info = mgr.create_session("mock", None, None).await.unwrap();

    let result = mgr
        .start_debugging(
            &info.id,
            start_args(&script, adapter.port, Some(json!({"stopOnEntry": true}))),
        )
        .await
        .unwrap();
    assert!(result.success);
    wait_paused(&mgr, &info.id).await;

    let outcome = mgr
        .evaluate_expression(&info.id, "undefined_var", None, None)
        .await
        .unwrap();
    assert!(!outcome.success);
    let info_block = outcome.error_info.unwrap();
    assert_eq!(format!("{:?}", info_block.category), "NameError");
    assert!(info_block.message.contains("'undefined_var'"));
    assert!(info_block.suggestion.contains("variables in scope"));

    mgr.close_session(&info.id).await.unwrap();
    adapter.abort();
}

#[tokio::test]
async fn test_evaluate_compound_preview_is_truncated() {
    let children: Vec<serde_json::Value> = (0..9)
        .map(|i| {
            json!({
                "name": format!("field{i}"),
                "value": "v".repeat(300),
                "variablesReference": 0,
            })
        })
        .collect();
    let behavior = MockBehavior {
        eval: HashMap::from([(
            "data".to_string(),
            VecDeque::from([EvalReply::compound("MyStruct {...}", "MyStruct", 2000)]),
        )]),
        variables: HashMap::from([(2000, json!(children))]),
        steps_stop: true,
        ..Default::default()
    };
    let adapter = MockAdapter::spawn(behavior).await;
    let mgr = manager();
    let (_dir, script) = script_file("main.py", "a = 1\n");
    let info = mgr.create_session("mock", None, None).await.unwrap();

    let result = mgr
        .start_debugging(
            &info.id,
            start_args(&script, adapter.port, Some(json!({"stopOnEntry": true}))),
        )
        .await
        .unwrap();
    assert!(result.success);
    wait_paused(&mgr, &info.id).await;

    let outcome = mgr
        .evaluate_expression(&info.id, "data", None, None)
        .await
        .unwrap();
    assert!(outcome.success);
    let preview = outcome.preview.expect("compound value should get a preview");
    assert!(preview.entries.len() <= 5);
    assert!(preview.truncated);
    for entry in &preview.entries {
        assert!(entry.value.chars().count() <= 201);
    }

    mgr.close_session(&info.id).await.unwrap();
    adapter.abort();
}

#[tokio::test]
async fn test_set_breakpoint_replaces_whole_file_set() {
    let batches = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let behavior = MockBehavior {
        entry_stop_despite_launch: false,
        run_forever: true,
        steps_stop: true,
        breakpoint_batches: batches.clone(),
        ..Default::default()
    };
    let adapter = MockAdapter::spawn(behavior).await;
    let mgr = manager();
    let (_dir, script) = script_file("main.py", "a = 1\nb = 2\nc = 3\n");
    let info = mgr.create_session("mock", None, None).await.unwrap();

    // First breakpoint lands before the run starts.
    mgr.set_breakpoint(&info.id, &script, 3, None).await.unwrap();

    let result = mgr
        .start_debugging(&info.id, start_args(&script, adapter.port, None))
        .await
        .unwrap();
    assert!(result.success);
    wait_state(&mgr, &info.id, |s| *s == ExecutionState::Running).await;

    // Second breakpoint in the same file: the adapter must receive the
    // full replacement set in one request.
    let bp = mgr.set_breakpoint(&info.id, &script, 9, None).await.unwrap();
    assert!(bp.verified);

    let batches = batches.lock().unwrap();
    let last = batches.last().expect("at least one setBreakpoints batch");
    assert_eq!(last, &vec![3, 9]);

    mgr.close_session(&info.id).await.unwrap();
    adapter.abort();
}

#[tokio::test]
async fn test_closed_session_rejects_breakpoints() {
    let mgr = manager();
    let info = mgr.create_session("mock", None, None).await.unwrap();

    assert!(mgr.close_session(&info.id).await.unwrap());
    let err = mgr
        .set_breakpoint(&info.id, "/w/ex.py", 3, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionTerminated(_)));

    let session = mgr.get_session(&info.id).await.unwrap();
    assert_eq!(session.lifecycle, Lifecycle::Terminated);
}

#[tokio::test]
async fn test_listener_parity_after_close() {
    let adapter = MockAdapter::spawn(MockBehavior::stopping()).await;
    let mgr = manager();
    let (_dir, script) = script_file("main.py", "a = 1\n");
    let info = mgr.create_session("mock", None, None).await.unwrap();

    let result = mgr
        .start_debugging(
            &info.id,
            start_args(&script, adapter.port, Some(json!({"stopOnEntry": true}))),
        )
        .await
        .unwrap();
    assert!(result.success);
    assert!(mgr.listener_count(&info.id).await > 0);

    mgr.close_session(&info.id).await.unwrap();
    assert_eq!(mgr.listener_count(&info.id).await, 0);
    adapter.abort();
}

#[tokio::test]
async fn test_pause_running_session() {
    let behavior = MockBehavior {
        run_forever: true,
        steps_stop: true,
        ..Default::default()
    };
    let adapter = MockAdapter::spawn(behavior).await;
    let mgr = manager();
    let (_dir, script) = script_file("main.py", "while True: pass\n");
    let info = mgr.create_session("mock", None, None).await.unwrap();

    let result = mgr
        .start_debugging(&info.id, start_args(&script, adapter.port, None))
        .await
        .unwrap();
    assert!(result.success);
    wait_state(&mgr, &info.id, |s| *s == ExecutionState::Running).await;

    let control = mgr.pause(&info.id).await.unwrap();
    assert!(control.success);

    // Request success does not imply Paused; the stopped event does.
    let (_thread, reason) = wait_paused(&mgr, &info.id).await;
    assert_eq!(reason, "pause");

    // Pausing an already paused session succeeds without another request.
    let again = mgr.pause(&info.id).await.unwrap();
    assert!(again.success);

    mgr.close_session(&info.id).await.unwrap();
    adapter.abort();
}

#[tokio::test]
async fn test_close_all_sessions() {
    let mgr = manager();
    let a = mgr.create_session("mock", None, None).await.unwrap();
    let b = mgr.create_session("python", None, Some("python3".into())).await.unwrap();

    mgr.close_all_sessions().await;

    for id in [a.id, b.id] {
        let info = mgr.get_session(&id).await.unwrap();
        assert_eq!(info.lifecycle, Lifecycle::Terminated);
    }
}

#[tokio::test]
async fn test_program_run_to_completion_stops_session() {
    // No stops configured: the program finishes right after launch.
    let adapter = MockAdapter::spawn(MockBehavior::default()).await;
    let mgr = manager();
    let (_dir, script) = script_file("main.py", "print('done')\n");
    let info = mgr.create_session("mock", None, None).await.unwrap();

    let result = mgr
        .start_debugging(&info.id, start_args(&script, adapter.port, None))
        .await
        .unwrap();
    assert!(result.success, "start failed: {:?}", result.error);

    wait_state(&mgr, &info.id, ExecutionState::is_terminal).await;
    adapter.abort();
}
