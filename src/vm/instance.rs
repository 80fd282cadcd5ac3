use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

use super::ports::{acquire_ephemeral_port, acquire_vnc_display};
use crate::config::VmConfig;
use crate::error::{CodeboxError, Result};
use crate::sandbox::process::{run_captured, shell_quote, CapturedRun};

/// Per-attempt SSH probe timeout.
const SSH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const SSH_PROBE_BACKOFF: Duration = Duration::from_millis(500);
const SYNC_BACKOFF: Duration = Duration::from_secs(1);
/// Retained tail of the hypervisor's own stdout/stderr for diagnostics.
const QEMU_LOG_CAP: usize = 64 * 1024;
const RUN_OUTPUT_CAP: usize = 1 << 20;

/// Resolved, existing VM assets.
#[derive(Debug, Clone)]
pub struct VmAssets {
    pub base_image: PathBuf,
    pub ssh_key: PathBuf,
}

impl VmAssets {
    /// Snapshot state saved next to the base image, if any.
    pub fn snapshot(&self) -> Option<PathBuf> {
        let state = self.base_image.parent()?.join("vm.state");
        state.exists().then_some(state)
    }
}

/// Everything the hypervisor command line depends on.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub overlay: PathBuf,
    pub ssh_port: u16,
    pub forwards: BTreeMap<u16, u16>,
    pub vnc_display: Option<u16>,
    pub snapshot: Option<PathBuf>,
    pub restrict_network: bool,
}

/// Hypervisor arguments for one ephemeral VM.
pub fn qemu_args(config: &VmConfig, plan: &LaunchPlan) -> Vec<String> {
    let mut netdev = format!("user,id=net0,hostfwd=tcp::{}-:22", plan.ssh_port);
    for (guest, host) in &plan.forwards {
        netdev.push_str(&format!(",hostfwd=tcp::{}-:{}", host, guest));
    }
    if plan.restrict_network {
        netdev.push_str(",restrict=on");
    }

    let mut args: Vec<String> = Vec::new();
    if let Some(accel) = config.accel.as_deref().filter(|a| !a.is_empty()) {
        args.extend(["-accel".to_string(), accel.to_string()]);
    }
    args.extend([
        "-M".to_string(),
        config.machine.clone(),
        "-m".to_string(),
        config.memory.clone(),
        "-smp".to_string(),
        config.cpus.to_string(),
        "-drive".to_string(),
        format!("file={},if=virtio,cache=writeback", plan.overlay.display()),
        "-netdev".to_string(),
        netdev,
        "-device".to_string(),
        "virtio-net-pci,netdev=net0,romfile=".to_string(),
        "-serial".to_string(),
        "stdio".to_string(),
        "-monitor".to_string(),
        "none".to_string(),
        "-nographic".to_string(),
    ]);
    match plan.vnc_display {
        Some(display) => args.extend(["-vnc".to_string(), format!("127.0.0.1:{}", display)]),
        None => args.extend(["-display".to_string(), "none".to_string()]),
    }
    if let Some(state) = &plan.snapshot {
        args.extend(["-incoming".to_string(), format!("exec:cat {}", state.display())]);
    }
    if config.enable_kvm {
        args.push("-enable-kvm".to_string());
    }
    args
}

/// Remote script that recreates `dest`, refusing empty or root targets.
pub fn prepare_dir_script(dest: &str) -> String {
    format!(
        r#"dest={}
if [ -z "$dest" ] || [ "$dest" = "/" ]; then
  echo "refusing to clean unsafe dest: '$dest'" >&2
  exit 1
fi
rm -rf -- "$dest" && mkdir -p -- "$dest""#,
        shell_quote(dest)
    )
}

/// A disposable VM: overlay disk, forwarded SSH port and hypervisor process.
/// Never reused; `close` (or drop) reclaims everything.
pub struct VmInstance {
    pub id: String,
    tmp_dir: PathBuf,
    ssh_port: u16,
    vnc_display: Option<u16>,
    forwards: BTreeMap<u16, u16>,
    restrict_network: bool,
    ssh_user: String,
    ssh_key: PathBuf,
    child: tokio::sync::Mutex<Option<Child>>,
    qemu_log: Arc<Mutex<Vec<u8>>>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for VmInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmInstance")
            .field("id", &self.id)
            .field("tmp_dir", &self.tmp_dir)
            .field("ssh_port", &self.ssh_port)
            .field("vnc_display", &self.vnc_display)
            .finish()
    }
}

impl VmInstance {
    /// Create the overlay, launch the hypervisor and wait for SSH.
    pub async fn boot(
        config: &VmConfig,
        assets: &VmAssets,
        exec_root: &Path,
        permit: OwnedSemaphorePermit,
        forwards: &BTreeMap<u16, u16>,
        restrict_network: bool,
    ) -> Result<Self> {
        std::fs::create_dir_all(exec_root)?;
        // Removed automatically if anything below fails before `keep`.
        let tmp = tempfile::Builder::new().prefix("vm-").tempdir_in(exec_root)?;
        let overlay = tmp.path().join("overlay.qcow2");

        let output = Command::new(&config.qemu_img_binary)
            .arg("create")
            .args(["-f", "qcow2", "-b"])
            .arg(&assets.base_image)
            .args(["-F", "qcow2"])
            .arg(&overlay)
            .output()
            .await
            .map_err(|e| CodeboxError::vm(format!("qemu-img create: {}", e)))?;
        if !output.status.success() {
            return Err(CodeboxError::vm(format!(
                "qemu-img create: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!("Created overlay {}", overlay.display());

        let ssh_port = acquire_ephemeral_port()?;
        let mut resolved = BTreeMap::new();
        for (guest, host) in forwards {
            let host = if *host == 0 { acquire_ephemeral_port()? } else { *host };
            resolved.insert(*guest, host);
        }
        let vnc_display = if config.vnc { Some(acquire_vnc_display()?) } else { None };

        let plan = LaunchPlan {
            overlay,
            ssh_port,
            forwards: resolved,
            vnc_display,
            snapshot: assets.snapshot(),
            restrict_network,
        };
        let args = qemu_args(config, &plan);
        info!(
            ssh_port,
            snapshot = plan.snapshot.is_some(),
            "🖥️ Starting {} with base {}",
            config.qemu_binary,
            assets.base_image.display()
        );

        let mut child = Command::new(&config.qemu_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CodeboxError::vm(format!("qemu start: {}", e)))?;

        let qemu_log = Arc::new(Mutex::new(Vec::new()));
        if let Some(out) = child.stdout.take() {
            tokio::spawn(capture_log(out, qemu_log.clone()));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(capture_log(err, qemu_log.clone()));
        }

        let tmp_dir = tmp.keep();
        let id = tmp_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("vm-{}", ssh_port));
        let instance = Self {
            id,
            tmp_dir,
            ssh_port,
            vnc_display,
            forwards: plan.forwards,
            restrict_network: plan.restrict_network,
            ssh_user: config.ssh_user.clone(),
            ssh_key: assets.ssh_key.clone(),
            child: tokio::sync::Mutex::new(Some(child)),
            qemu_log,
            permit: Mutex::new(Some(permit)),
            closed: AtomicBool::new(false),
        };

        if let Err(e) = instance.wait_for_ssh(config.boot_timeout()).await {
            instance.close().await;
            return Err(e);
        }
        info!(vm = %instance.id, "VM ready on ssh port {}", ssh_port);
        Ok(instance)
    }

    pub fn ssh_port(&self) -> u16 {
        self.ssh_port
    }

    pub fn network_restricted(&self) -> bool {
        self.restrict_network
    }

    pub fn vnc_display(&self) -> Option<u16> {
        self.vnc_display
    }

    /// Host port forwarded to `guest_port`, if requested at boot.
    pub fn forwarded_port(&self, guest_port: u16) -> Option<u16> {
        self.forwards.get(&guest_port).copied()
    }

    /// Captured hypervisor output, lossily decoded.
    pub fn qemu_log(&self) -> String {
        String::from_utf8_lossy(&self.qemu_log.lock()).trim().to_string()
    }

    pub async fn has_exited(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        }
    }

    fn ssh_args(&self) -> Vec<String> {
        vec![
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "ConnectTimeout=5".into(),
            "-o".into(),
            "LogLevel=ERROR".into(),
            "-i".into(),
            self.ssh_key.display().to_string(),
            "-p".into(),
            self.ssh_port.to_string(),
            format!("{}@127.0.0.1", self.ssh_user),
        ]
    }

    /// `ssh ... bash -lc '<remote>'`
    pub fn ssh_command(&self, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_args())
            .arg("bash")
            .arg("-lc")
            .arg(shell_quote(remote))
            .kill_on_drop(true);
        cmd
    }

    async fn wait_for_ssh(&self, boot_timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + boot_timeout;
        let mut attempt = 0u32;
        while Instant::now() < deadline {
            attempt += 1;
            if self.has_exited().await {
                let log = self.qemu_log();
                warn!(vm = %self.id, "qemu exited before ssh was ready:\n{}", log);
                return Err(CodeboxError::vm(format!("qemu exited before ssh was ready: {}", log)));
            }

            let mut probe = self.ssh_command("echo ok");
            probe.stdin(Stdio::null());
            match tokio::time::timeout(SSH_PROBE_TIMEOUT, probe.output()).await {
                Ok(Ok(out)) if out.status.success() => return Ok(()),
                Ok(Ok(out)) => debug!(
                    vm = %self.id,
                    attempt,
                    "ssh probe failed: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
                Ok(Err(e)) => debug!(vm = %self.id, attempt, "ssh probe error: {}", e),
                Err(_) => debug!(vm = %self.id, attempt, "ssh probe timed out"),
            }
            tokio::time::sleep(SSH_PROBE_BACKOFF).await;
        }
        warn!(vm = %self.id, "qemu output:\n{}", self.qemu_log());
        Err(CodeboxError::vm(format!("vm ssh not ready within {:?}", boot_timeout)))
    }

    async fn prepare_dir(&self, dest: &str) -> Result<()> {
        let mut cmd = self.ssh_command(&prepare_dir_script(dest));
        cmd.stdin(Stdio::null());
        let out = cmd.output().await?;
        if out.status.success() {
            return Ok(());
        }
        Err(CodeboxError::vm(format!(
            "prepare {} failed: {}",
            dest,
            String::from_utf8_lossy(&out.stderr).trim()
        )))
    }

    /// Copy `local` into the guest and return the guest path. Falls back to a
    /// `/tmp` destination when the home directory cannot be prepared.
    pub async fn sync_workspace(&self, local: &Path, attempts: u32, copy_timeout: Duration) -> Result<String> {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let candidates = [format!("/home/{}/code", self.ssh_user), format!("/tmp/code-{}", nanos)];
        let attempts = attempts.max(1);

        let mut dest = None;
        let mut last_err = None;
        'candidates: for candidate in candidates {
            for attempt in 1..=attempts {
                match self.prepare_dir(&candidate).await {
                    Ok(()) => {
                        dest = Some(candidate);
                        break 'candidates;
                    }
                    Err(e) => {
                        warn!(vm = %self.id, attempt, "Prepare workspace {} failed: {}", candidate, e);
                        last_err = Some(e);
                        tokio::time::sleep(SYNC_BACKOFF).await;
                    }
                }
            }
        }
        let Some(dest) = dest else {
            warn!(vm = %self.id, "qemu output:\n{}", self.qemu_log());
            return Err(CodeboxError::vm(format!(
                "prepare workspace: {}",
                last_err.map(|e| e.to_string()).unwrap_or_default()
            )));
        };

        let source = format!("{}/.", local.display());
        let target = format!("{}@127.0.0.1:{}", self.ssh_user, dest);
        let copy = async {
            let mut last = String::new();
            for attempt in 1..=attempts {
                let out = Command::new("scp")
                    .args(["-q", "-r"])
                    .args(["-o", "StrictHostKeyChecking=no", "-o", "UserKnownHostsFile=/dev/null"])
                    .args(["-o", "LogLevel=ERROR"])
                    .arg("-i")
                    .arg(&self.ssh_key)
                    .arg("-P")
                    .arg(self.ssh_port.to_string())
                    .arg(&source)
                    .arg(&target)
                    .stdin(Stdio::null())
                    .kill_on_drop(true)
                    .output()
                    .await;
                match out {
                    Ok(out) if out.status.success() => return Ok(()),
                    Ok(out) => last = String::from_utf8_lossy(&out.stderr).trim().to_string(),
                    Err(e) => last = e.to_string(),
                }
                warn!(vm = %self.id, attempt, "scp failed: {}", last);
                tokio::time::sleep(SYNC_BACKOFF).await;
            }
            Err(last)
        };
        match tokio::time::timeout(copy_timeout, copy).await {
            Ok(Ok(())) => {
                info!(vm = %self.id, "Workspace synced to {}", dest);
                Ok(dest)
            }
            Ok(Err(last)) => Err(CodeboxError::vm(format!("copy workspace: {}", last))),
            Err(_) => Err(CodeboxError::vm(format!("copy workspace: timed out after {:?}", copy_timeout))),
        }
    }

    /// Run `script` in `workdir` inside the guest, killing ssh at `deadline`.
    pub(crate) async fn run_script(
        &self,
        workdir: &str,
        script: &str,
        stdin: &[u8],
        deadline: Duration,
    ) -> Result<CapturedRun> {
        let remote = format!("cd {} && {}", shell_quote(workdir), script);
        debug!(vm = %self.id, "run: {}", remote);
        run_captured(self.ssh_command(&remote), stdin, deadline, RUN_OUTPUT_CAP)
            .await
            .map_err(|e| CodeboxError::vm(format!("ssh start: {}", e)))
    }

    /// Start a long-running remote command with piped stdio.
    pub fn spawn_interactive(&self, workdir: &str, script: &str) -> Result<Child> {
        let remote = format!("cd {} && {}", shell_quote(workdir), script);
        self.ssh_command(&remote)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CodeboxError::vm(format!("ssh start: {}", e)))
    }

    /// Kill the hypervisor, remove the overlay directory, release the slot.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.tmp_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(vm = %self.id, "Failed to remove {}: {}", self.tmp_dir.display(), e);
            }
        }
        self.permit.lock().take();
        info!(vm = %self.id, "VM torn down");
    }
}

impl Drop for VmInstance {
    fn drop(&mut self) {
        // The child is kill_on_drop and the permit releases itself.
        if !self.closed.load(Ordering::Acquire) {
            let _ = std::fs::remove_dir_all(&self.tmp_dir);
        }
    }
}

async fn capture_log<R>(mut reader: R, sink: Arc<Mutex<Vec<u8>>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut log = sink.lock();
                log.extend_from_slice(&buf[..n]);
                if log.len() > QEMU_LOG_CAP {
                    let excess = log.len() - QEMU_LOG_CAP;
                    log.drain(..excess);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> LaunchPlan {
        LaunchPlan {
            overlay: PathBuf::from("/x/vm-1/overlay.qcow2"),
            ssh_port: 40022,
            forwards: BTreeMap::from([(8000, 41000)]),
            vnc_display: None,
            snapshot: None,
            restrict_network: true,
        }
    }

    #[test]
    fn test_qemu_args_defaults() {
        let args = qemu_args(&VmConfig::default(), &plan());
        let joined = args.join(" ");
        assert!(joined.starts_with("-M pc-i440fx-7.2 -m 1024M -smp 2"));
        assert!(joined.contains("-drive file=/x/vm-1/overlay.qcow2,if=virtio,cache=writeback"));
        assert!(joined.contains("hostfwd=tcp::40022-:22,hostfwd=tcp::41000-:8000,restrict=on"));
        assert!(joined.contains("-monitor none -nographic -display none"));
        assert!(joined.ends_with("-enable-kvm"));
        assert!(!joined.contains("-incoming"));
    }

    #[test]
    fn test_qemu_args_accel_vnc_snapshot() {
        let config = VmConfig {
            accel: Some("tcg".to_string()),
            enable_kvm: false,
            ..Default::default()
        };
        let mut plan = plan();
        plan.restrict_network = false;
        plan.vnc_display = Some(3);
        plan.snapshot = Some(PathBuf::from("/img/vm.state"));
        let args = qemu_args(&config, &plan);
        assert_eq!(&args[..2], &["-accel", "tcg"]);
        let joined = args.join(" ");
        assert!(joined.contains("-vnc 127.0.0.1:3"));
        assert!(!joined.contains("-display none"));
        assert!(joined.contains("-incoming exec:cat /img/vm.state"));
        assert!(!joined.contains("restrict=on"));
        assert!(!joined.contains("-enable-kvm"));
    }

    #[test]
    fn test_prepare_dir_script_guards_root() {
        let script = prepare_dir_script("/home/runner/code");
        assert!(script.starts_with("dest=/home/runner/code\n"));
        assert!(script.contains(r#"[ "$dest" = "/" ]"#));
        assert!(script.contains(r#"rm -rf -- "$dest" && mkdir -p -- "$dest""#));

        let quoted = prepare_dir_script("/tmp/a b");
        assert!(quoted.starts_with("dest='/tmp/a b'\n"));
    }

    #[test]
    fn test_snapshot_detection() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.img");
        std::fs::write(&base, b"").unwrap();
        let assets = VmAssets {
            base_image: base,
            ssh_key: dir.path().join("key"),
        };
        assert!(assets.snapshot().is_none());
        std::fs::write(dir.path().join("vm.state"), b"").unwrap();
        assert_eq!(assets.snapshot(), Some(dir.path().join("vm.state")));
    }
}
