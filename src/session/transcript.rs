//! Append-only NDJSON transcript of a session.
//!
//! One line per I/O chunk (direction, size, SHA-256, base64 payload) and
//! per lifecycle event, each stamped with an RFC3339 nanosecond timestamp.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::container::NetworkMode;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Stdin,
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Lifecycle {
    Start { cmd: Vec<String>, network: NetworkMode },
    Exit { code: i32 },
    Timeout { wall_seconds: i64 },
    Stop { signal: String },
}

#[derive(Serialize)]
struct ChunkLine {
    ts: String,
    dir: Direction,
    size: usize,
    sha256: String,
    data_b64: String,
}

#[derive(Serialize)]
struct LifecycleLine<'a> {
    ts: String,
    #[serde(flatten)]
    event: &'a Lifecycle,
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[derive(Debug)]
pub struct Transcript {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl Transcript {
    /// Create `<dir>/<session_id>.ndjson`, truncating any previous file.
    pub async fn create(dir: &Path, session_id: &str) -> Result<Self> {
        fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.ndjson", session_id));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn chunk(&self, dir: Direction, data: &[u8]) {
        let line = ChunkLine {
            ts: now_rfc3339(),
            dir,
            size: data.len(),
            sha256: sha256_hex(data),
            data_b64: STANDARD.encode(data),
        };
        self.append(&line).await;
    }

    pub async fn lifecycle(&self, event: &Lifecycle) {
        self.append(&LifecycleLine {
            ts: now_rfc3339(),
            event,
        })
        .await;
    }

    /// Flush and close. Later writes are ignored.
    pub async fn close(&self) {
        if let Some(mut file) = self.file.lock().await.take() {
            if let Err(e) = file.flush().await {
                warn!("Failed to flush transcript {}: {}", self.path.display(), e);
            }
        }
    }

    async fn append<T: Serialize>(&self, record: &T) {
        let mut line = match serde_json::to_vec(record) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode transcript line: {}", e);
                return;
            }
        };
        line.push(b'\n');
        let mut guard = self.file.lock().await;
        if let Some(file) = guard.as_mut() {
            // Flushed per line so readers of the file see complete records.
            let written = match file.write_all(&line).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                warn!("Failed to append to transcript {}: {}", self.path.display(), e);
            }
        }
    }
}
