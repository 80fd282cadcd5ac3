use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::instance::{VmAssets, VmInstance};
use super::limiter::VmSlots;
use super::paths::resolve_vm_path;
use crate::config::VmConfig;
use crate::container::{valid_env_key, NetworkMode};
use crate::error::{CodeboxError, Result};
use crate::sandbox::process::shell_join;
use crate::sandbox::{
    BackendKind, InteractiveRequest, PreparedSandbox, RunOutput, RunRequest, SandboxBackend,
    SpawnedProcess,
};
use crate::workspace::StagedWorkspace;

/// Boots disposable QEMU VMs and executes commands in them over SSH.
pub struct VmBackend {
    config: VmConfig,
    exec_root: PathBuf,
    slots: VmSlots,
}

impl VmBackend {
    pub fn new(config: &VmConfig, exec_root: impl Into<PathBuf>) -> Self {
        Self {
            config: config.clone(),
            exec_root: exec_root.into(),
            slots: VmSlots::new(config.max_parallel, config.queue_timeout()),
        }
    }

    pub fn slots(&self) -> &VmSlots {
        &self.slots
    }

    /// Resolve the base image and SSH key; missing assets are a configuration error.
    pub fn assets(&self) -> Result<VmAssets> {
        let base_image = resolve_vm_path(&self.config.base_image);
        let ssh_key = resolve_vm_path(&self.config.ssh_key);
        if !base_image.exists() {
            return Err(CodeboxError::config(format!(
                "qemu base image not found: {}",
                base_image.display()
            )));
        }
        if !ssh_key.exists() {
            return Err(CodeboxError::config(format!("qemu ssh key not found: {}", ssh_key.display())));
        }
        Ok(VmAssets { base_image, ssh_key })
    }

    /// Guest networking is isolated for `off` sessions unless the operator disabled isolation.
    pub fn restricts(&self, network: NetworkMode) -> bool {
        self.config.restrict_network && network == NetworkMode::Off
    }

    /// Boot a VM with optional extra guest->host port forwards (0 = pick a free port).
    pub async fn boot(&self, forwards: &BTreeMap<u16, u16>, network: NetworkMode) -> Result<Arc<VmInstance>> {
        let assets = self.assets()?;
        info!(
            "Resolved VM assets base={} key={}",
            assets.base_image.display(),
            assets.ssh_key.display()
        );
        let permit = self.slots.acquire().await?;
        let restrict = self.restricts(network);
        let vm = VmInstance::boot(&self.config, &assets, &self.exec_root, permit, forwards, restrict).await?;
        Ok(Arc::new(vm))
    }

    /// Boot a VM and copy `dir` into it; the VM is torn down if the copy fails.
    pub async fn boot_with_workspace(&self, dir: &Path, network: NetworkMode) -> Result<(Arc<VmInstance>, String)> {
        let vm = self.boot(&BTreeMap::new(), network).await?;
        match vm
            .sync_workspace(dir, self.config.sync_attempts, self.config.boot_timeout())
            .await
        {
            Ok(remote) => Ok((vm, remote)),
            Err(e) => {
                vm.close().await;
                Err(e)
            }
        }
    }

    fn extra_timeout(&self) -> Duration {
        Duration::from_millis(self.config.extra_timeout_ms)
    }
}

/// `env K=V ... cmd args` as a single shell line, dropping invalid keys.
pub fn remote_command(command: &[String], env: &BTreeMap<String, String>) -> String {
    let vars: Vec<String> = env
        .iter()
        .filter(|(k, _)| valid_env_key(k))
        .map(|(k, v)| format!("{}={}", k.trim(), v))
        .collect();
    if vars.is_empty() {
        return shell_join(command);
    }
    let mut argv = vec!["env".to_string()];
    argv.extend(vars);
    argv.extend(command.iter().cloned());
    shell_join(&argv)
}

fn vm_of(prepared: &PreparedSandbox) -> Result<&Arc<VmInstance>> {
    prepared
        .vm
        .as_ref()
        .ok_or_else(|| CodeboxError::internal("sandbox was not prepared by the VM backend"))
}

#[async_trait]
impl SandboxBackend for VmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vm
    }

    async fn prepare(&self, workspace: &StagedWorkspace, network: NetworkMode) -> Result<PreparedSandbox> {
        let (vm, remote) = self.boot_with_workspace(workspace.path(), network).await?;
        Ok(PreparedSandbox::new(vm.id.clone(), workspace.path(), remote).with_vm(vm))
    }

    async fn run(&self, prepared: &PreparedSandbox, request: &RunRequest) -> Result<RunOutput> {
        let vm = vm_of(prepared)?;
        let workdir = prepared.guest_workdir(request.workdir.as_deref());
        let script = remote_command(&request.command, &request.env);
        let captured = vm
            .run_script(&workdir, &script, &request.stdin, request.timeout + self.extra_timeout())
            .await?;
        if captured.deadline_hit {
            warn!(vm = %vm.id, "Remote command exceeded {:?}", request.timeout);
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
        let vm = vm_of(prepared)?;
        if request.network != NetworkMode::Off && vm.network_restricted() {
            return Err(CodeboxError::vm("vm was booted with isolated networking"));
        }
        let workdir = prepared.guest_workdir(request.workdir.as_deref());
        let child = vm.spawn_interactive(&workdir, &remote_command(&request.command, &request.env))?;
        Ok(SpawnedProcess { child, handle: None })
    }

    async fn teardown(&self, prepared: PreparedSandbox) {
        if let Some(vm) = prepared.vm {
            vm.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_command_quotes_and_filters_env() {
        let cmd = vec!["python".to_string(), "-c".to_string(), "print('x')".to_string()];
        assert_eq!(remote_command(&cmd, &BTreeMap::new()), r"python -c 'print('\''x'\'')'");

        let env = BTreeMap::from([
            ("MODE".to_string(), "fast".to_string()),
            ("bad key".to_string(), "x".to_string()),
        ]);
        assert_eq!(remote_command(&["run".to_string()], &env), "env MODE=fast run");
    }

    #[test]
    fn test_isolation_applies_only_to_offline_sandboxes() {
        let backend = VmBackend::new(&VmConfig::default(), std::env::temp_dir());
        assert!(backend.restricts(NetworkMode::Off));
        assert!(!backend.restricts(NetworkMode::Egress));
        assert!(!backend.restricts(NetworkMode::Full));

        let open = VmConfig {
            restrict_network: false,
            ..Default::default()
        };
        assert!(!VmBackend::new(&open, std::env::temp_dir()).restricts(NetworkMode::Off));
    }

    #[tokio::test]
    async fn test_missing_assets_fail_before_slot() {
        let config = VmConfig {
            base_image: PathBuf::from("/nonexistent/base.img"),
            max_parallel: 1,
            ..Default::default()
        };
        let backend = VmBackend::new(&config, std::env::temp_dir());
        let err = backend.boot(&BTreeMap::new(), NetworkMode::Off).await.unwrap_err();
        assert!(err.to_string().contains("base image not found"));
        assert_eq!(backend.slots().available(), 1);
    }

    #[tokio::test]
    async fn test_run_requires_vm() {
        let backend = VmBackend::new(&VmConfig::default(), std::env::temp_dir());
        let prepared = PreparedSandbox::new("x", "/tmp", "/home/runner/code");
        let err = backend
            .run(&prepared, &RunRequest::new(vec!["true".into()], Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Internal);
    }

    #[tokio::test]
    async fn test_boot_real_vm_when_configured() {
        let config = VmConfig::default();
        let backend = VmBackend::new(&config, std::env::temp_dir().join("codebox-vm-test"));
        if backend.assets().is_err() {
            eprintln!("Skipping test - VM base image or key not available");
            return;
        }
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("hello.txt"), "hi").unwrap();
        let ws = StagedWorkspace::from_path(root.path());

        let prepared = backend.prepare(&ws, NetworkMode::Off).await.unwrap();
        let out = backend
            .run(
                &prepared,
                &RunRequest::new(vec!["cat".into(), "hello.txt".into()], Duration::from_secs(10)),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout_lossy(), "hi");
        backend.teardown(prepared).await;
        assert_eq!(backend.slots().available(), config.max_parallel);
    }
}
