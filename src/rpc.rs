//! Thin newline-delimited JSON dispatch loop over stdio.
//!
//! This is the minimal stand-in for the outer tool surface: each line is a
//! `{id, method, params}` request, each response carries `success` plus
//! result fields or `error`/`errorType`/`errorCode`. The real tool dispatch
//! lives outside the core and talks to [`SessionManager`] the same way.

use crate::session::manager::{SessionManager, StartDebuggingArgs};
use crate::{Error, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionParams {
    language: String,
    name: Option<String>,
    executable_hint: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionParams {
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetBreakpointParams {
    session_id: String,
    file: String,
    line: i64,
    condition: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartDebuggingParams {
    session_id: String,
    #[serde(flatten)]
    args: StartDebuggingArgs,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StackTraceParams {
    session_id: String,
    #[serde(default)]
    include_internals: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopesParams {
    session_id: String,
    frame_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VariablesParams {
    session_id: String,
    variables_reference: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocalVariablesParams {
    session_id: String,
    #[serde(default)]
    include_special: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateParams {
    session_id: String,
    expression: String,
    frame_id: Option<i64>,
    context: Option<String>,
}

pub async fn serve_stdio(manager: Arc<SessionManager>) -> Result<()> {
    info!("dap_bridge listening on stdio");

    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => {
                let mut payload = dispatch(&manager, &request.method, request.params).await;
                if let (Some(obj), Some(id)) = (payload.as_object_mut(), request.id) {
                    obj.insert("id".to_string(), id);
                }
                payload
            }
            Err(e) => json!({
                "success": false,
                "error": format!("invalid request: {}", e),
                "errorType": "invalid_parameters",
            }),
        };

        let mut bytes = serde_json::to_vec(&response)?;
        bytes.push(b'\n');
        stdout.write_all(&bytes).await?;
        stdout.flush().await?;
    }

    info!("stdin closed, shutting down all sessions");
    manager.close_all_sessions().await;
    Ok(())
}

async fn dispatch(manager: &SessionManager, method: &str, params: Value) -> Value {
    match handle(manager, method, params).await {
        Ok(value) => value,
        Err(e) => {
            error!("{} failed: {}", method, e);
            json!({
                "success": false,
                "error": e.to_string(),
                "errorType": e.error_type(),
                "errorCode": e.error_code(),
            })
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| Error::InvalidParameters(e.to_string()))
}

async fn handle(manager: &SessionManager, method: &str, params: Value) -> Result<Value> {
    match method {
        "create_session" => {
            let p: CreateSessionParams = parse(params)?;
            let info = manager
                .create_session(&p.language, p.name, p.executable_hint)
                .await?;
            Ok(json!({"success": true, "session": info}))
        }
        "close_session" => {
            let p: SessionParams = parse(params)?;
            let closed = manager.close_session(&p.session_id).await?;
            Ok(json!({"success": true, "closed": closed}))
        }
        "close_all_sessions" => {
            manager.close_all_sessions().await;
            Ok(json!({"success": true}))
        }
        "list_sessions" => {
            let sessions = manager.list_sessions().await;
            Ok(json!({"success": true, "sessions": sessions}))
        }
        "get_session" => {
            let p: SessionParams = parse(params)?;
            let info = manager.get_session(&p.session_id).await?;
            Ok(json!({"success": true, "session": info}))
        }
        "set_breakpoint" => {
            let p: SetBreakpointParams = parse(params)?;
            let breakpoint = manager
                .set_breakpoint(&p.session_id, &p.file, p.line, p.condition)
                .await?;
            Ok(json!({"success": true, "breakpoint": breakpoint}))
        }
        "start_debugging" => {
            let p: StartDebuggingParams = parse(params)?;
            let result = manager.start_debugging(&p.session_id, p.args).await?;
            Ok(serde_json::to_value(result)?)
        }
        "step_over" => {
            let p: SessionParams = parse(params)?;
            Ok(serde_json::to_value(manager.step_over(&p.session_id).await?)?)
        }
        "step_into" => {
            let p: SessionParams = parse(params)?;
            Ok(serde_json::to_value(manager.step_into(&p.session_id).await?)?)
        }
        "step_out" => {
            let p: SessionParams = parse(params)?;
            Ok(serde_json::to_value(manager.step_out(&p.session_id).await?)?)
        }
        "continue" => {
            let p: SessionParams = parse(params)?;
            Ok(serde_json::to_value(
                manager.continue_execution(&p.session_id).await?,
            )?)
        }
        "pause" => {
            let p: SessionParams = parse(params)?;
            Ok(serde_json::to_value(manager.pause(&p.session_id).await?)?)
        }
        "get_stack_trace" => {
            let p: StackTraceParams = parse(params)?;
            let frames = manager
                .get_stack_trace(&p.session_id, p.include_internals)
                .await?;
            Ok(json!({"success": true, "stackFrames": frames}))
        }
        "get_scopes" => {
            let p: ScopesParams = parse(params)?;
            let scopes = manager.get_scopes(&p.session_id, p.frame_id).await?;
            Ok(json!({"success": true, "scopes": scopes}))
        }
        "get_variables" => {
            let p: VariablesParams = parse(params)?;
            let variables = manager
                .get_variables(&p.session_id, p.variables_reference)
                .await?;
            Ok(json!({"success": true, "variables": variables}))
        }
        "get_local_variables" => {
            let p: LocalVariablesParams = parse(params)?;
            let variables = manager
                .get_local_variables(&p.session_id, p.include_special)
                .await?;
            Ok(json!({"success": true, "variables": variables}))
        }
        "evaluate" => {
            let p: EvaluateParams = parse(params)?;
            let outcome = manager
                .evaluate_expression(
                    &p.session_id,
                    &p.expression,
                    p.frame_id,
                    p.context.as_deref(),
                )
                .await?;
            Ok(serde_json::to_value(outcome)?)
        }
        other => Err(Error::InvalidParameters(format!(
            "unknown method: {}",
            other
        ))),
    }
}
