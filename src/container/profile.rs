//! Isolation profile for sandbox containers and the `run` argument builder.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::config::SandboxConfig;
use crate::error::{CodeboxError, Result};

/// Mount point of the workspace inside the container.
pub const GUEST_WORKSPACE: &str = "/code";

static ENV_KEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z_][A-Z0-9_]*$").expect("Invalid env key regex"));

/// Environment keys are checked case-insensitively against `[A-Z_][A-Z0-9_]*`.
pub fn valid_env_key(key: &str) -> bool {
    ENV_KEY_REGEX.is_match(&key.trim().to_uppercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Off,
    Egress,
    Full,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::Off => "off",
            NetworkMode::Egress => "egress",
            NetworkMode::Full => "full",
        }
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkMode {
    type Err = CodeboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "off" | "none" => Ok(NetworkMode::Off),
            "egress" => Ok(NetworkMode::Egress),
            "full" => Ok(NetworkMode::Full),
            other => Err(CodeboxError::bad_request(format!("unknown network mode {:?}", other))),
        }
    }
}

/// Operator opt-ins for non-default network levels.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkPolicy {
    pub allow_egress: bool,
    pub allow_full: bool,
}

impl NetworkPolicy {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            allow_egress: config.allow_egress,
            allow_full: config.allow_full_network,
        }
    }

    /// Map a requested mode to the engine's `--network` value.
    pub fn authorize(&self, mode: NetworkMode) -> Result<&'static str> {
        match mode {
            NetworkMode::Off => Ok("none"),
            NetworkMode::Egress if self.allow_egress => Ok("bridge"),
            NetworkMode::Full if self.allow_full => Ok("bridge"),
            _ => Err(CodeboxError::policy("network blocked")),
        }
    }
}

/// Everything one `run` invocation needs beyond the profile.
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub name: &'a str,
    pub workspace: &'a Path,
    pub workdir: Option<&'a str>,
    pub env: &'a BTreeMap<String, String>,
    pub network: &'a str,
    pub memory_mb: Option<u64>,
    pub command: &'a [String],
}

#[derive(Debug, Clone)]
pub struct IsolationProfile {
    pub engine: String,
    pub image: String,
    pub user: String,
    pub cpus: String,
    pub memory: String,
    pub pids_limit: u32,
    pub tmpfs_size: String,
}

impl IsolationProfile {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            engine: config.engine.clone(),
            image: config.image.clone(),
            user: config.user.clone(),
            cpus: config.cpus.clone(),
            memory: config.memory.clone(),
            pids_limit: config.pids_limit,
            tmpfs_size: config.tmpfs_size.clone(),
        }
    }

    /// Build the engine arguments for one ephemeral, read-only container.
    pub fn run_args(&self, inv: &Invocation<'_>) -> Vec<String> {
        let memory = inv
            .memory_mb
            .filter(|mb| *mb > 0)
            .map(|mb| format!("{}m", mb))
            .unwrap_or_else(|| self.memory.clone());
        let mount = std::path::absolute(inv.workspace).unwrap_or_else(|_| inv.workspace.to_path_buf());
        let workdir = match inv.workdir {
            Some(wd) if !wd.is_empty() => format!("{}/{}", GUEST_WORKSPACE, wd),
            _ => GUEST_WORKSPACE.to_string(),
        };

        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "-i".into(),
            "--name".into(),
            inv.name.to_string(),
            format!("--network={}", inv.network),
            "--user".into(),
            self.user.clone(),
            "--cpus".into(),
            self.cpus.clone(),
            "--memory".into(),
            memory.clone(),
            "--memory-swap".into(),
            memory,
            "--pids-limit".into(),
            self.pids_limit.to_string(),
            "--read-only".into(),
            "--cap-drop=ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--mount".into(),
            format!("type=tmpfs,destination=/tmp,tmpfs-size={}", self.tmpfs_size),
            "-v".into(),
            format!("{}:{}:ro", mount.display(), GUEST_WORKSPACE),
            "-w".into(),
            workdir,
        ];
        for (key, value) in inv.env {
            if !valid_env_key(key) {
                continue;
            }
            args.push("-e".into());
            args.push(format!("{}={}", key.trim(), value));
        }
        args.push(self.image.clone());
        args.extend(inv.command.iter().cloned());
        args
    }
}

/// Container names may not contain underscores.
pub fn container_name(id: &str) -> String {
    id.replace('_', "-")
}
