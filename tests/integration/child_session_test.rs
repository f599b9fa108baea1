//! Child-session adoption (js-debug shaped): reverse `startDebugging`
//! adoption, configurationDone deferral, and debuggee-command routing to
//! the child.

#[path = "../helpers/mock_adapter.rs"]
mod mock_adapter;

use dap_bridge::config::CoreEnv;
use dap_bridge::policy::{AdapterSpawn, ConnectMode};
use dap_bridge::session::manager::{SessionManager, StartDebuggingArgs};
use dap_bridge::session::state::ExecutionState;
use mock_adapter::MockJsDebug;
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

fn manager() -> SessionManager {
    let dir = tempfile::tempdir().unwrap();
    SessionManager::with_base_log_dir(CoreEnv::default(), dir.keep())
}

fn script_file(content: &str) -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.js");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(content.as_bytes()).unwrap();
    (dir, path.to_string_lossy().into_owned())
}

/// Override that the js-debug policy claims (vendored server path in the
/// args) without spawning anything: the mock is already listening.
fn js_debug_spawn(port: u16) -> AdapterSpawn {
    AdapterSpawn {
        command: None,
        args: vec!["/vendored/js-debug/src/dapDebugServer.js".to_string()],
        env: HashMap::new(),
        connect: ConnectMode::Tcp { port },
    }
}

async fn wait_paused(mgr: &SessionManager, id: &str) -> String {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let info = mgr.get_session(id).await.unwrap();
        if let ExecutionState::Paused { reason, .. } = info.execution {
            return reason;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session never paused; last state {:?}",
            info.execution
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_child_adoption_and_stack_trace_routing() {
    let mock = MockJsDebug::spawn().await;
    let mgr = manager();
    let (_dir, script) = script_file("let i = 0;\ni += 1;\nconsole.log(i);\n");

    let info = mgr.create_session("javascript", None, None).await.unwrap();
    assert_eq!(info.policy, "js-debug");

    // A breakpoint recorded before the run must be mirrored to the child.
    mgr.set_breakpoint(&info.id, &script, 3, None).await.unwrap();

    let result = mgr
        .start_debugging(
            &info.id,
            StartDebuggingArgs {
                script_path: script.clone(),
                adapter_launch_override: Some(js_debug_spawn(mock.port)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(result.success, "start failed: {:?}", result.error);

    // The child's breakpoint stop drives the parent session state.
    let reason = wait_paused(&mgr, &info.id).await;
    assert_eq!(reason, "breakpoint");

    // stackTrace must be served by the child, which actually runs code.
    let frames = mgr.get_stack_trace(&info.id, true).await.unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].name, "childMain");

    let log = mock.log.lock().await.clone();

    // Child handshake ran in DAP order.
    let child_cmds: Vec<&str> = log
        .iter()
        .filter(|e| e.starts_with("child:"))
        .map(|e| e.as_str())
        .collect();
    assert_eq!(child_cmds[0], "child:initialize");
    assert_eq!(child_cmds[1], "child:launch");
    assert!(child_cmds.contains(&"child:setBreakpoints"));
    assert!(child_cmds.contains(&"child:configurationDone"));
    assert!(child_cmds.contains(&"child:stackTrace"));

    // The parent's configurationDone was deferred until the child was
    // configured (the adoption was announced before `initialized`).
    let parent_config_done = log
        .iter()
        .position(|e| e == "parent:configurationDone")
        .expect("parent got configurationDone");
    let child_config_done = log
        .iter()
        .position(|e| e == "child:configurationDone")
        .expect("child got configurationDone");
    assert!(
        child_config_done < parent_config_done,
        "parent configurationDone should wait for the child: {log:?}"
    );

    mgr.close_session(&info.id).await.unwrap();
    mock.abort();
}

#[tokio::test]
async fn test_child_stop_updates_thread_tracking() {
    let mock = MockJsDebug::spawn().await;
    let mgr = manager();
    let (_dir, script) = script_file("process.exit(0);\n");

    let info = mgr.create_session("javascript", None, None).await.unwrap();
    let result = mgr
        .start_debugging(
            &info.id,
            StartDebuggingArgs {
                script_path: script.clone(),
                adapter_launch_override: Some(js_debug_spawn(mock.port)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(result.success, "start failed: {:?}", result.error);

    let _ = wait_paused(&mgr, &info.id).await;

    // Stepping after a child stop reuses the child-reported thread id; the
    // child answers the stackTrace the step uses for its location.
    let frames = mgr.get_stack_trace(&info.id, true).await.unwrap();
    assert!(!frames.is_empty());

    mgr.close_session(&info.id).await.unwrap();
    mock.abort();
}
