use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::sandbox::BackendKind;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sandbox: SandboxConfig,
    pub vm: VmConfig,
    pub session: SessionConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Container isolation profile and workspace staging policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Shared root under which per-execution directories are created.
    pub execution_root: PathBuf,
    /// Container engine CLI (docker or a compatible binary).
    pub engine: String,
    pub image: String,
    /// `UID:GID` the sandboxed process runs as.
    pub user: String,
    pub cpus: String,
    pub memory: String,
    pub pids_limit: u32,
    pub tmpfs_size: String,
    pub allow_egress: bool,
    pub allow_full_network: bool,
    /// Allowance added on top of a caller's timeout for engine start/stop.
    pub grace_ms: u64,
    pub max_input_files: usize,
    pub max_input_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VmConfig {
    pub qemu_binary: String,
    pub qemu_img_binary: String,
    pub base_image: PathBuf,
    pub ssh_key: PathBuf,
    pub ssh_user: String,
    pub cpus: u32,
    pub memory: String,
    pub machine: String,
    pub accel: Option<String>,
    pub enable_kvm: bool,
    pub vnc: bool,
    /// Isolate guest networking for `off` sessions and grading; host port forwards keep working.
    pub restrict_network: bool,
    pub boot_timeout_secs: u64,
    pub max_parallel: usize,
    pub queue_timeout_secs: u64,
    pub extra_timeout_ms: u64,
    pub sync_attempts: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// HMAC key for transcript URLs; generated per process when unset.
    pub signing_key: Option<String>,
    pub transcript_dir: PathBuf,
    pub idempotency_window_secs: u64,
    pub url_ttl_secs: u64,
    pub tail_bytes: usize,
    pub heartbeat_ms: u64,
    pub cleanup_delay_ms: u64,
    pub stop_grace_ms: u64,
    pub retention_secs: u64,
    pub subscriber_buffer: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub backend: BackendKind,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            execution_root: std::env::temp_dir().join("codebox-exec"),
            engine: "docker".to_string(),
            image: "python:3.11-slim".to_string(),
            user: "65534:65534".to_string(),
            cpus: "0.5".to_string(),
            memory: "256m".to_string(),
            pids_limit: 128,
            tmpfs_size: "16m".to_string(),
            allow_egress: false,
            allow_full_network: false,
            grace_ms: 1000,
            max_input_files: 32,
            max_input_bytes: 256 * 1024,
        }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            qemu_binary: "qemu-system-x86_64".to_string(),
            qemu_img_binary: "qemu-img".to_string(),
            base_image: PathBuf::from("vm/base.img"),
            ssh_key: PathBuf::from("vm/rsa_key"),
            ssh_user: "runner".to_string(),
            cpus: 2,
            memory: "1024M".to_string(),
            machine: "pc-i440fx-7.2".to_string(),
            accel: None,
            enable_kvm: true,
            vnc: false,
            restrict_network: true,
            boot_timeout_secs: 120,
            max_parallel: 8,
            queue_timeout_secs: 600,
            extra_timeout_ms: 5000,
            sync_attempts: 5,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signing_key: None,
            transcript_dir: PathBuf::from("uploads"),
            idempotency_window_secs: 120,
            url_ttl_secs: 15 * 60,
            tail_bytes: 32 * 1024,
            heartbeat_ms: 1000,
            cleanup_delay_ms: 1500,
            stop_grace_ms: 2000,
            retention_secs: 600,
            subscriber_buffer: 32,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 100,
            backend: BackendKind::Container,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl VmConfig {
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }
}

impl Config {
    /// Load configuration from environment variables
    pub async fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let mut config = Self::default();

        if let Ok(host) = std::env::var("SERVER_HOST") {
            config.server.host = host;
        }
        if let Some(port) = env_parse("SERVER_PORT") {
            config.server.port = port;
        }

        // Container sandbox
        if let Some(root) = env_string("EXECUTION_ROOT") {
            config.sandbox.execution_root = PathBuf::from(root);
        }
        if let Some(engine) = env_string("CONTAINER_ENGINE") {
            config.sandbox.engine = engine;
        }
        if let Some(image) = env_string("PYTHON_RUNNER_IMAGE") {
            config.sandbox.image = image;
        }
        if let Some(user) = env_string("DOCKER_USER") {
            config.sandbox.user = user;
        }
        if let Some(cpus) = env_string("DOCKER_CPUS") {
            config.sandbox.cpus = cpus;
        }
        if let Some(memory) = env_string("DOCKER_MEMORY") {
            config.sandbox.memory = memory;
        }
        if let Some(grace) = env_parse("SANDBOX_GRACE_MS") {
            config.sandbox.grace_ms = grace;
        }
        config.sandbox.allow_egress = env_flag("ALLOW_SESSION_EGRESS");
        config.sandbox.allow_full_network = env_flag("ALLOW_SESSION_FULLNET");

        // VM sandbox
        if let Some(v) = env_string("QEMU_BINARY") {
            config.vm.qemu_binary = v;
        }
        if let Some(v) = env_string("QEMU_IMG_BINARY") {
            config.vm.qemu_img_binary = v;
        }
        if let Some(v) = env_string("QEMU_BASE_IMAGE") {
            config.vm.base_image = PathBuf::from(v);
        }
        if let Some(v) = env_string("QEMU_SSH_KEY") {
            config.vm.ssh_key = PathBuf::from(v);
        }
        if let Some(v) = env_string("QEMU_SSH_USER") {
            config.vm.ssh_user = v;
        }
        if let Some(v) = env_parse("QEMU_CPUS") {
            config.vm.cpus = v;
        }
        if let Some(v) = env_string("QEMU_MEMORY") {
            config.vm.memory = v;
        }
        config.vm.accel = env_string("QEMU_ACCEL");
        if let Some(v) = env_string("QEMU_ENABLE_KVM") {
            config.vm.enable_kvm = matches!(v.to_lowercase().as_str(), "1" | "true");
        }
        config.vm.vnc = env_flag("QEMU_VNC");
        if let Some(v) = env_string("QEMU_RESTRICT_NET") {
            config.vm.restrict_network = matches!(v.to_lowercase().as_str(), "1" | "true");
        }
        if let Some(d) = env_string("QEMU_BOOT_TIMEOUT").and_then(|v| parse_duration(&v)) {
            config.vm.boot_timeout_secs = d.as_secs().max(1);
        }
        if let Some(n) = env_parse::<usize>("MAX_PARALLEL_TESTS").filter(|n| *n > 0) {
            config.vm.max_parallel = n;
        }
        if let Some(d) = env_string("VM_QUEUE_TIMEOUT").and_then(|v| parse_duration(&v)) {
            config.vm.queue_timeout_secs = d.as_secs().max(1);
        }

        // Sessions
        config.session.signing_key = env_string("SESS_SIGNING_KEY");
        if let Some(dir) = env_string("SESSION_TRANSCRIPT_DIR") {
            config.session.transcript_dir = PathBuf::from(dir);
        }

        // Workers
        if let Some(n) = env_parse::<usize>("WORKER_COUNT").filter(|n| *n > 0) {
            config.worker.workers = n;
        }
        if let Some(kind) = env_string("GRADING_BACKEND") {
            config.worker.backend = kind.parse().map_err(|e| anyhow::anyhow!("{}", e))?;
        }

        // Logging
        if let Some(level) = env_string("LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(format) = env_string("LOG_FORMAT") {
            config.logging.format = format;
        }

        Ok(config)
    }

    /// Load configuration from a TOML file (codebox.toml)
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }

        if parse_user(&self.sandbox.user).is_none() {
            anyhow::bail!("Sandbox user must be UID:GID, got {:?}", self.sandbox.user);
        }

        if self.sandbox.max_input_files == 0 || self.sandbox.max_input_bytes == 0 {
            anyhow::bail!("Workspace caps must be positive");
        }

        if self.worker.workers == 0 || self.worker.queue_capacity == 0 {
            anyhow::bail!("Worker pool needs at least one worker and a non-empty queue");
        }

        if self.vm.max_parallel == 0 {
            anyhow::bail!("MAX_PARALLEL_TESTS must be at least 1");
        }

        if self.session.tail_bytes == 0 || self.session.subscriber_buffer == 0 {
            anyhow::bail!("Session tail and subscriber buffers must be positive");
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            anyhow::bail!("Unknown log format {:?}", self.logging.format);
        }

        Ok(())
    }
}

/// Parse a `UID:GID` pair.
pub fn parse_user(user: &str) -> Option<(u32, u32)> {
    let (uid, gid) = user.trim().split_once(':')?;
    Some((uid.trim().parse().ok()?, gid.trim().parse().ok()?))
}

/// Parse `90`, `90s`, `2m`, `1h` or `500ms`. Bare numbers are seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (num, unit) = raw.split_at(split);
    let value: u64 = num.parse().ok()?;
    match unit.trim() {
        "" | "s" => Some(Duration::from_secs(value)),
        "ms" => Some(Duration::from_millis(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn env_flag(key: &str) -> bool {
    env_string(key).map(|v| v == "1").unwrap_or(false)
}
