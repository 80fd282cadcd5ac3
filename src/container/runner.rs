use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::engine::ContainerEngine;
use super::profile::{Invocation, IsolationProfile, NetworkMode, NetworkPolicy, GUEST_WORKSPACE};
use crate::config::SandboxConfig;
use crate::error::{CodeboxError, Result};
use crate::sandbox::process::run_captured;
use crate::sandbox::{
    BackendKind, InteractiveRequest, PreparedSandbox, RunOutput, RunRequest, SandboxBackend,
    SpawnedProcess, UsageSample,
};
use crate::workspace::StagedWorkspace;

/// Per-stream capture ceiling for one-shot runs.
const ONE_SHOT_OUTPUT_CAP: usize = 1 << 20;

/// Runs commands in ephemeral containers through the engine CLI.
pub struct ContainerBackend {
    profile: IsolationProfile,
    network: NetworkPolicy,
    engine: Arc<ContainerEngine>,
    grace: Duration,
}

impl ContainerBackend {
    pub fn new(config: &SandboxConfig) -> Self {
        Self::with_engine(config, Arc::new(ContainerEngine::connect(config.engine.clone())))
    }

    pub fn with_engine(config: &SandboxConfig, engine: Arc<ContainerEngine>) -> Self {
        Self {
            profile: IsolationProfile::from_config(config),
            network: NetworkPolicy::from_config(config),
            engine,
            grace: Duration::from_millis(config.grace_ms),
        }
    }

    pub fn engine(&self) -> &ContainerEngine {
        &self.engine
    }

    pub fn profile(&self) -> &IsolationProfile {
        &self.profile
    }

    /// Make sure the runner image is present before the first execution.
    pub async fn ensure_image(&self) -> Result<()> {
        self.engine.ensure_image(&self.profile.image).await
    }
}

#[async_trait]
impl SandboxBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn prepare(&self, workspace: &StagedWorkspace, _network: NetworkMode) -> Result<PreparedSandbox> {
        let id = Uuid::new_v4().simple().to_string();
        Ok(PreparedSandbox::new(id, workspace.path(), GUEST_WORKSPACE))
    }

    async fn run(&self, prepared: &PreparedSandbox, request: &RunRequest) -> Result<RunOutput> {
        let name = format!("run-{}", Uuid::new_v4().simple());
        let args = self.profile.run_args(&Invocation {
            name: &name,
            workspace: prepared.workspace(),
            workdir: request.workdir.as_deref(),
            env: &request.env,
            network: "none",
            memory_mb: None,
            command: &request.command,
        });
        debug!(container = %name, "{} {}", self.profile.engine, args.join(" "));

        let mut cmd = Command::new(&self.profile.engine);
        cmd.args(&args);
        let captured = run_captured(cmd, &request.stdin, request.timeout + self.grace, ONE_SHOT_OUTPUT_CAP)
            .await
            .map_err(|e| CodeboxError::container(format!("failed to start {}: {}", self.profile.engine, e)))?;

        if captured.deadline_hit {
            warn!(container = %name, "Run exceeded {:?}, removing container", request.timeout);
            self.engine.force_remove(&name).await;
        }

        Ok(RunOutput {
            stdout: captured.stdout,
            stderr: captured.stderr,
            exit_code: captured.exit_code,
            timed_out: captured.deadline_hit,
            runtime: captured.elapsed,
        })
    }

    async fn spawn(&self, prepared: &PreparedSandbox, request: &InteractiveRequest) -> Result<SpawnedProcess> {
        let network = self.network.authorize(request.network)?;
        let args = self.profile.run_args(&Invocation {
            name: &request.name,
            workspace: prepared.workspace(),
            workdir: request.workdir.as_deref(),
            env: &request.env,
            network,
            memory_mb: request.memory_mb,
            command: &request.command,
        });

        let child = Command::new(&self.profile.engine)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CodeboxError::container(format!("container start failed: {}", e)))?;

        info!(container = %request.name, network = %request.network, "🚀 Started interactive container");
        Ok(SpawnedProcess {
            child,
            handle: Some(request.name.clone()),
        })
    }

    async fn sample(&self, handle: &str) -> Option<UsageSample> {
        self.engine.stats(handle).await
    }

    async fn release(&self, handle: &str) {
        self.engine.force_remove(handle).await;
    }

    async fn teardown(&self, prepared: PreparedSandbox) {
        // The container is --rm; the host workspace belongs to the caller.
        debug!("Container sandbox {} released", prepared.id);
    }
}
