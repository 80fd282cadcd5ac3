//! Sandbox backend abstraction
//!
//! The worker pool and the session orchestrator only talk to this trait;
//! the container and VM runners are its two implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;

use crate::container::NetworkMode;
use crate::error::{CodeboxError, Result};
use crate::vm::VmInstance;
use crate::workspace::StagedWorkspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Container,
    Vm,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Container => "container",
            BackendKind::Vm => "vm",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = CodeboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "container" | "docker" => Ok(BackendKind::Container),
            "vm" | "qemu" => Ok(BackendKind::Vm),
            other => Err(CodeboxError::config(format!("unknown sandbox backend {:?}", other))),
        }
    }
}

/// A workspace made available to a backend. For containers this is the host
/// directory itself; for VMs it also owns the booted instance.
#[derive(Debug)]
pub struct PreparedSandbox {
    pub id: String,
    pub workspace: PathBuf,
    /// Directory the command sees as its workspace root.
    pub guest_dir: String,
    pub(crate) vm: Option<Arc<VmInstance>>,
}

impl PreparedSandbox {
    pub fn new(id: impl Into<String>, workspace: impl Into<PathBuf>, guest_dir: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            workspace: workspace.into(),
            guest_dir: guest_dir.into(),
            vm: None,
        }
    }

    pub(crate) fn with_vm(mut self, vm: Arc<VmInstance>) -> Self {
        self.vm = Some(vm);
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Guest directory joined with an optional relative workdir.
    pub fn guest_workdir(&self, workdir: Option<&str>) -> String {
        match workdir {
            Some(wd) if !wd.is_empty() => format!("{}/{}", self.guest_dir.trim_end_matches('/'), wd),
            _ => self.guest_dir.clone(),
        }
    }
}

/// One-shot execution request.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub command: Vec<String>,
    pub stdin: Vec<u8>,
    pub timeout: Duration,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
}

impl RunRequest {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            ..Default::default()
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = stdin.into();
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    /// Deadline hit or measured runtime above the requested timeout.
    pub timed_out: bool,
    pub runtime: Duration,
}

impl RunOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Long-lived interactive process request.
#[derive(Debug, Clone, Default)]
pub struct InteractiveRequest {
    /// Stable name for the engine-side handle (container name).
    pub name: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub network: NetworkMode,
    pub memory_mb: Option<u64>,
}

/// A started interactive process with piped stdio.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub child: Child,
    /// Engine-side handle to force-remove on teardown.
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageSample {
    pub cpu_seconds: f64,
    pub memory_bytes: u64,
}

/// Core trait for sandbox backends
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Make a staged workspace available to the sandbox. `network` is the
    /// already-authorized level the sandbox will be used with.
    async fn prepare(&self, workspace: &StagedWorkspace, network: NetworkMode) -> Result<PreparedSandbox>;

    /// Run one command to completion or timeout.
    async fn run(&self, prepared: &PreparedSandbox, request: &RunRequest) -> Result<RunOutput>;

    /// Start a long-lived process with piped stdin/stdout/stderr.
    async fn spawn(&self, prepared: &PreparedSandbox, request: &InteractiveRequest) -> Result<SpawnedProcess>;

    /// Live resource sample for a spawned handle, when the backend can provide one.
    async fn sample(&self, _handle: &str) -> Option<UsageSample> {
        None
    }

    /// Force-remove an engine-side handle. Must be idempotent.
    async fn release(&self, _handle: &str) {}

    /// Reclaim everything `prepare` allocated. Never fails.
    async fn teardown(&self, prepared: PreparedSandbox);
}

pub type SharedBackend = Arc<dyn SandboxBackend>;

/// Exit code as reported to clients: the process code, or 128+signal.
pub fn exit_code_of(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Read a pipe to the end, keeping at most `cap` bytes.
pub(crate) async fn read_capped<R>(mut reader: R, cap: usize) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut kept = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    kept
}
