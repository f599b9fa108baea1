//! Optional NDJSON trace of every DAP frame a session exchanges, one
//! `{ts, direction, payload}` object per line. Enabled per session when a
//! trace directory is configured.

use crate::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

#[derive(Serialize)]
struct TraceLine<'a> {
    ts: u128,
    direction: Direction,
    payload: &'a serde_json::Value,
}

pub struct FrameTracer {
    path: PathBuf,
    file: File,
}

impl FrameTracer {
    /// Open (append) the trace file for one session run.
    pub async fn open(dir: &Path, session_id: &str) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{session_id}.dap.ndjson"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one frame. Trace failures are logged, never propagated: the
    /// debug conversation must not die because the trace disk is full.
    pub async fn record(&mut self, direction: Direction, payload: &serde_json::Value) {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);

        let line = TraceLine {
            ts,
            direction,
            payload,
        };

        let mut buf = match serde_json::to_vec(&line) {
            Ok(buf) => buf,
            Err(e) => {
                warn!("Failed to serialize DAP trace line: {}", e);
                return;
            }
        };
        buf.push(b'\n');

        if let Err(e) = self.file.write_all(&buf).await {
            warn!("Failed to write DAP trace line: {}", e);
        }
    }
}
