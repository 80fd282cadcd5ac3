//! Test backends: `ShellBackend` runs commands directly on the host with
//! `sh`, `CannedBackend` answers every run from a table keyed by stdin.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use codebox::config::SessionConfig;
use codebox::container::{NetworkMode, NetworkPolicy};
use codebox::error::{CodeboxError, Result};
use codebox::sandbox::{
    exit_code_of, BackendKind, InteractiveRequest, PreparedSandbox, RunOutput, RunRequest, SandboxBackend,
    SharedBackend, SpawnedProcess,
};
use codebox::session::{SessionOrchestrator, SessionStatus, UrlSigner};
use codebox::workspace::{StagedWorkspace, StagerPolicy, WorkspaceStager};

/// Records how it was used so tests can tell what reached the backend.
#[derive(Default)]
pub struct ShellBackend {
    pub prepared: AtomicUsize,
    pub spawned_networks: Mutex<Vec<NetworkMode>>,
}

impl ShellBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SandboxBackend for ShellBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn prepare(&self, workspace: &StagedWorkspace, _network: NetworkMode) -> Result<PreparedSandbox> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        let dir = workspace.path().to_string_lossy().into_owned();
        Ok(PreparedSandbox::new("shell", workspace.path(), dir))
    }

    async fn run(&self, prepared: &PreparedSandbox, request: &RunRequest) -> Result<RunOutput> {
        let mut child = Command::new(&request.command[0])
            .args(&request.command[1..])
            .current_dir(prepared.guest_workdir(request.workdir.as_deref()))
            .envs(&request.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let start = Instant::now();
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&request.stdin).await?;
        }
        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let waited = tokio::time::timeout(request.timeout, async {
            let _ = stdout.read_to_end(&mut out).await;
            let _ = stderr.read_to_end(&mut err).await;
            child.wait().await
        })
        .await;
        let (exit_code, timed_out) = match waited {
            Ok(status) => (exit_code_of(&status?), false),
            Err(_) => (-1, true),
        };
        Ok(RunOutput {
            stdout: out,
            stderr: err,
            exit_code,
            timed_out,
            runtime: start.elapsed(),
        })
    }

    async fn spawn(&self, prepared: &PreparedSandbox, request: &InteractiveRequest) -> Result<SpawnedProcess> {
        self.spawned_networks.lock().unwrap().push(request.network);
        let child = Command::new(&request.command[0])
            .args(&request.command[1..])
            .current_dir(prepared.guest_workdir(request.workdir.as_deref()))
            .envs(&request.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CodeboxError::container(format!("spawn failed: {}", e)))?;
        Ok(SpawnedProcess { child, handle: None })
    }

    async fn teardown(&self, _prepared: PreparedSandbox) {}
}

/// Replies to `run` with the output registered for the request's stdin.
#[derive(Default)]
pub struct CannedBackend {
    pub replies: HashMap<Vec<u8>, RunOutput>,
}

impl CannedBackend {
    pub fn reply(mut self, stdin: &str, stdout: &str, exit_code: i32) -> Self {
        self.replies.insert(
            stdin.as_bytes().to_vec(),
            RunOutput {
                stdout: stdout.as_bytes().to_vec(),
                exit_code,
                runtime: Duration::from_millis(5),
                ..Default::default()
            },
        );
        self
    }
}

#[async_trait]
impl SandboxBackend for CannedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn prepare(&self, workspace: &StagedWorkspace, _network: NetworkMode) -> Result<PreparedSandbox> {
        Ok(PreparedSandbox::new("canned", workspace.path(), "/code"))
    }

    async fn run(&self, _prepared: &PreparedSandbox, request: &RunRequest) -> Result<RunOutput> {
        self.replies
            .get(&request.stdin)
            .cloned()
            .ok_or_else(|| CodeboxError::container("no canned reply"))
    }

    async fn spawn(&self, _prepared: &PreparedSandbox, _request: &InteractiveRequest) -> Result<SpawnedProcess> {
        Err(CodeboxError::container("canned backend cannot spawn"))
    }

    async fn teardown(&self, _prepared: PreparedSandbox) {}
}

pub fn session_config(root: &Path) -> SessionConfig {
    SessionConfig {
        transcript_dir: root.join("transcripts"),
        heartbeat_ms: 100,
        cleanup_delay_ms: 50,
        stop_grace_ms: 50,
        ..Default::default()
    }
}

pub fn orchestrator(root: &Path) -> Arc<SessionOrchestrator> {
    orchestrator_with(root, Arc::new(ShellBackend::new()), NetworkPolicy::default())
}

pub fn orchestrator_with(root: &Path, backend: SharedBackend, policy: NetworkPolicy) -> Arc<SessionOrchestrator> {
    let signer = UrlSigner::new(b"integration-test-key", Duration::from_secs(900)).unwrap();
    let stager = WorkspaceStager::new(root.join("exec"), StagerPolicy::default());
    Arc::new(
        SessionOrchestrator::new(session_config(root), backend, stager, signer)
            .with_teardown_allowance(Duration::from_millis(200))
            .with_network_policy(policy),
    )
}

/// Poll until the session reaches a terminal state.
pub async fn wait_terminal(orchestrator: &SessionOrchestrator, id: &str) -> SessionStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = orchestrator.status(id).unwrap().session.status;
        if status.is_terminal() && orchestrator.get(id).unwrap().summary().exit_code.is_some() {
            return status;
        }
        assert!(Instant::now() < deadline, "session {} never finished", id);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
