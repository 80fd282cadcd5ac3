use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::ErrorCode;
use crate::workspace::FileSpec;

pub const DEFAULT_WALL_SECONDS: i64 = 30;
pub const DEFAULT_CPU_SECONDS: i64 = 10;
pub const DEFAULT_MEM_MB: i64 = 256;
pub const DEFAULT_STDOUT_BYTES: i64 = 1 << 20;
pub const DEFAULT_STDERR_BYTES: i64 = 512 << 10;
pub const DEFAULT_STDIN_BYTES: i64 = 256 << 10;

/// Per-session caps. Non-positive values fall back to the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SessionLimits {
    pub wall_seconds: i64,
    pub cpu_seconds: i64,
    pub mem_mb: i64,
    pub stdout_bytes: i64,
    pub stderr_bytes: i64,
    pub stdin_bytes: i64,
}

impl SessionLimits {
    pub fn normalized(self) -> Self {
        fn or(value: i64, default: i64) -> i64 {
            if value <= 0 {
                default
            } else {
                value
            }
        }
        Self {
            wall_seconds: or(self.wall_seconds, DEFAULT_WALL_SECONDS),
            cpu_seconds: or(self.cpu_seconds, DEFAULT_CPU_SECONDS),
            mem_mb: or(self.mem_mb, DEFAULT_MEM_MB),
            stdout_bytes: or(self.stdout_bytes, DEFAULT_STDOUT_BYTES),
            stderr_bytes: or(self.stderr_bytes, DEFAULT_STDERR_BYTES),
            stdin_bytes: or(self.stdin_bytes, DEFAULT_STDIN_BYTES),
        }
    }

    pub fn wall(&self) -> Duration {
        Duration::from_secs(self.wall_seconds.max(0) as u64)
    }

    pub fn cap(&self, kind: LimitKind) -> u64 {
        let cap = match kind {
            LimitKind::StdoutBytes => self.stdout_bytes,
            LimitKind::StderrBytes => self.stderr_bytes,
            LimitKind::StdinBytes => self.stdin_bytes,
            LimitKind::CpuSeconds => self.cpu_seconds,
        };
        cap.max(0) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionUsage {
    pub cpu_seconds: f64,
    pub wall_seconds: f64,
    pub mem_peak_mb: u64,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub stdin_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited,
    Stopped,
    Error,
    Timeout,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Starting | SessionStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub usage: SessionUsage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub cmd: Vec<String>,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub limits: SessionLimits,
    /// `off`, `egress` or `full`; empty means `off`.
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputRequest {
    #[serde(default)]
    pub data_b64: String,
    #[serde(default)]
    pub eof: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputAck {
    pub ok: bool,
    pub written_bytes: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub signal: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRef {
    pub transport: String,
    pub url: String,
}

impl StreamRef {
    pub fn sse(session_id: &str) -> Self {
        Self {
            transport: "sse".to_string(),
            url: format!("/api/sessions/{}/stream", session_id),
        }
    }
}

/// Start response. `replayed` is set when an idempotency key matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedSession {
    pub session: SessionSummary,
    pub stream: StreamRef,
    #[serde(skip)]
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionArtifacts {
    pub stdout_tail_b64: String,
    pub stderr_tail_b64: String,
    pub transcript_url: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetails {
    pub session: SessionSummary,
    pub artifacts: SessionArtifacts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    StdoutBytes,
    StderrBytes,
    StdinBytes,
    CpuSeconds,
}

/// Live event fanned out to stream subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Status {
        status: SessionStatus,
        usage: SessionUsage,
        ts: DateTime<Utc>,
    },
    Stdout {
        data_b64: String,
        ts: DateTime<Utc>,
    },
    Stderr {
        data_b64: String,
        ts: DateTime<Utc>,
    },
    Limit {
        kind: LimitKind,
        detail: String,
        ts: DateTime<Utc>,
    },
    Exit {
        code: i32,
        ts: DateTime<Utc>,
    },
    Error {
        code: ErrorCode,
        detail: String,
        ts: DateTime<Utc>,
    },
}

impl SessionEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            SessionEvent::Status { .. } => "status",
            SessionEvent::Stdout { .. } => "stdout",
            SessionEvent::Stderr { .. } => "stderr",
            SessionEvent::Limit { .. } => "limit",
            SessionEvent::Exit { .. } => "exit",
            SessionEvent::Error { .. } => "error",
        }
    }

    pub fn limit(kind: LimitKind, cap: u64) -> Self {
        SessionEvent::Limit {
            kind,
            detail: format!("cap {} reached", cap),
            ts: Utc::now(),
        }
    }
}
