use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use super::permissions::{effective_file_mode, ensure_exec_root, normalize_tree, parse_mode};
use crate::config::{parse_user, SandboxConfig};
use crate::error::{CodeboxError, Result};

/// A file as submitted over the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSpec {
    pub path: String,
    pub content_b64: String,
    /// Octal mode string, e.g. `"755"`.
    #[serde(default)]
    pub mode: Option<String>,
}

/// A decoded file ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFile {
    pub path: String,
    pub data: Vec<u8>,
    pub mode: Option<u32>,
}

impl RawFile {
    pub fn new(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
            mode: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StagerPolicy {
    pub max_files: usize,
    pub max_total_bytes: usize,
}

impl Default for StagerPolicy {
    fn default() -> Self {
        Self {
            max_files: 32,
            max_total_bytes: 256 * 1024,
        }
    }
}

/// A per-execution directory. The caller owns its removal.
#[derive(Debug, Clone)]
pub struct StagedWorkspace {
    path: PathBuf,
}

impl StagedWorkspace {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the directory tree. Missing directories are not an error.
    pub async fn remove(&self) {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => debug!("Removed workspace {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove workspace {}: {}", self.path.display(), e),
        }
    }
}

/// Materializes untrusted payloads into fresh directories under a shared root.
#[derive(Debug, Clone)]
pub struct WorkspaceStager {
    root: PathBuf,
    policy: StagerPolicy,
    owner: Option<(u32, u32)>,
}

impl WorkspaceStager {
    pub fn new(root: impl Into<PathBuf>, policy: StagerPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
            owner: None,
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            root: config.execution_root.clone(),
            policy: StagerPolicy {
                max_files: config.max_input_files,
                max_total_bytes: config.max_input_bytes,
            },
            owner: parse_user(&config.user),
        }
    }

    /// Chown staged trees to this UID:GID (best effort).
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.owner = Some((uid, gid));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> StagerPolicy {
        self.policy
    }

    /// Decode and stage an API payload.
    pub fn stage(&self, files: &[FileSpec]) -> Result<StagedWorkspace> {
        self.check_count(files.len())?;
        let mut raw = Vec::with_capacity(files.len());
        for file in files {
            let data = STANDARD
                .decode(file.content_b64.trim())
                .map_err(|_| CodeboxError::bad_request(format!("invalid base64 for {}", file.path)))?;
            let mode = file.mode.as_deref().and_then(parse_mode);
            raw.push(RawFile {
                path: file.path.clone(),
                data,
                mode,
            });
        }
        self.stage_files("sess-", &raw)
    }

    /// Stage already decoded files into a directory named `<prefix>XXXX`.
    pub fn stage_files(&self, prefix: &str, files: &[RawFile]) -> Result<StagedWorkspace> {
        self.check_count(files.len())?;

        let mut targets = Vec::with_capacity(files.len());
        let mut total = 0usize;
        for file in files {
            targets.push(validate_relative_path(&file.path)?);
            total = total.saturating_add(file.data.len());
        }
        if total > self.policy.max_total_bytes {
            return Err(CodeboxError::policy(format!(
                "payload too large: {} bytes exceeds {}",
                total, self.policy.max_total_bytes
            )));
        }

        if !self.root.exists() {
            ensure_exec_root(&self.root, self.owner)?;
        }

        // Dropping the TempDir on any early return removes the partial tree.
        let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(&self.root)?;
        for (file, rel) in files.iter().zip(&targets) {
            let dst = dir.path().join(rel);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dst, &file.data)?;
            fs::set_permissions(&dst, fs::Permissions::from_mode(effective_file_mode(file.mode)))?;
        }
        normalize_tree(dir.path(), self.owner);

        let path = dir.keep();
        info!(files = files.len(), bytes = total, "Staged workspace {}", path.display());
        Ok(StagedWorkspace { path })
    }

    /// `stage` on the blocking pool.
    pub async fn stage_detached(&self, files: Vec<FileSpec>) -> Result<StagedWorkspace> {
        let stager = self.clone();
        tokio::task::spawn_blocking(move || stager.stage(&files))
            .await
            .map_err(|e| CodeboxError::internal(format!("staging task failed: {}", e)))?
    }

    /// `stage_files` on the blocking pool.
    pub async fn stage_files_detached(&self, prefix: &'static str, files: Vec<RawFile>) -> Result<StagedWorkspace> {
        let stager = self.clone();
        tokio::task::spawn_blocking(move || stager.stage_files(prefix, &files))
            .await
            .map_err(|e| CodeboxError::internal(format!("staging task failed: {}", e)))?
    }

    fn check_count(&self, count: usize) -> Result<()> {
        if count > self.policy.max_files {
            return Err(CodeboxError::policy(format!(
                "too many files: {} exceeds {}",
                count, self.policy.max_files
            )));
        }
        Ok(())
    }
}

/// Accept only relative paths that stay inside the workspace and name no dotfile.
pub fn validate_relative_path(raw: &str) -> Result<PathBuf> {
    let forbidden = || CodeboxError::policy(format!("forbidden path: {:?}", raw));
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.contains("..") || trimmed.contains('\0') || trimmed.contains('\\') {
        return Err(forbidden());
    }
    let path = Path::new(trimmed);
    if path.is_absolute() {
        return Err(forbidden());
    }

    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) if !part.to_string_lossy().starts_with('.') => clean.push(part),
            Component::CurDir => {}
            _ => return Err(forbidden()),
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(forbidden());
    }
    Ok(clean)
}

/// Normalize a working directory relative to the workspace root.
/// Empty and `.` mean the root itself.
pub fn normalize_workdir(raw: &str) -> Result<Option<String>> {
    let trimmed = raw.trim().trim_start_matches("./");
    if trimmed.is_empty() || trimmed == "." {
        return Ok(None);
    }
    let clean = validate_relative_path(trimmed.trim_end_matches('/'))?;
    let joined = clean
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    Ok(Some(joined))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn spec(path: &str, body: &str) -> FileSpec {
        FileSpec {
            path: path.to_string(),
            content_b64: STANDARD.encode(body),
            mode: None,
        }
    }

    fn entries(root: &Path) -> usize {
        fs::read_dir(root).map(|r| r.count()).unwrap_or(0)
    }

    #[test]
    fn test_stage_writes_nested_files() {
        let root = tempfile::tempdir().unwrap();
        let stager = WorkspaceStager::new(root.path(), StagerPolicy::default());
        let ws = stager
            .stage(&[spec("main.py", "print('hi')\n"), spec("pkg/util.py", "X = 1\n")])
            .unwrap();

        assert!(ws.path().starts_with(root.path()));
        assert!(ws
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("sess-"));
        assert_eq!(fs::read_to_string(ws.path().join("main.py")).unwrap(), "print('hi')\n");
        assert_eq!(fs::read_to_string(ws.path().join("pkg/util.py")).unwrap(), "X = 1\n");
        let mode = fs::metadata(ws.path().join("pkg")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn test_requested_mode_kept_readable() {
        let root = tempfile::tempdir().unwrap();
        let stager = WorkspaceStager::new(root.path(), StagerPolicy::default());
        let mut file = spec("run.sh", "#!/bin/sh\necho ok\n");
        file.mode = Some("700".to_string());
        let ws = stager.stage(&[file]).unwrap();
        let mode = fs::metadata(ws.path().join("run.sh")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o744);
    }

    #[test]
    fn test_too_many_files_rejected_without_leftovers() {
        let root = tempfile::tempdir().unwrap();
        let stager = WorkspaceStager::new(root.path(), StagerPolicy::default());
        let files: Vec<FileSpec> = (0..40).map(|i| spec(&format!("f{}.py", i), "pass\n")).collect();

        let err = stager.stage(&files).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PolicyViolation);
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn test_detached_staging_matches_inline() {
        let root = tempfile::tempdir().unwrap();
        let stager = WorkspaceStager::new(root.path(), StagerPolicy::default());

        let ws = stager.stage_detached(vec![spec("main.py", "print(1)\n")]).await.unwrap();
        assert_eq!(fs::read_to_string(ws.path().join("main.py")).unwrap(), "print(1)\n");

        let raw = stager
            .stage_files_detached("job-", vec![RawFile::new("in.txt", "abc")])
            .await
            .unwrap();
        assert!(raw.path().file_name().unwrap().to_string_lossy().starts_with("job-"));

        let files: Vec<FileSpec> = (0..40).map(|i| spec(&format!("f{}.py", i), "pass\n")).collect();
        let err = stager.stage_detached(files).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PolicyViolation);
        assert_eq!(entries(root.path()), 2);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let root = tempfile::tempdir().unwrap();
        let stager = WorkspaceStager::new(
            root.path(),
            StagerPolicy {
                max_files: 4,
                max_total_bytes: 10,
            },
        );
        let err = stager
            .stage(&[spec("a.py", "123456"), spec("b.py", "123456")])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PolicyViolation);
        assert_eq!(entries(root.path()), 0);
    }

    #[test]
    fn test_invalid_base64_is_bad_request() {
        let root = tempfile::tempdir().unwrap();
        let stager = WorkspaceStager::new(root.path(), StagerPolicy::default());
        let file = FileSpec {
            path: "main.py".to_string(),
            content_b64: "!!!not base64".to_string(),
            mode: None,
        };
        assert_eq!(stager.stage(&[file]).unwrap_err().code(), ErrorCode::BadRequest);
        assert_eq!(entries(root.path()), 0);
    }

    #[test]
    fn test_hostile_paths_rejected() {
        let root = tempfile::tempdir().unwrap();
        let stager = WorkspaceStager::new(root.path(), StagerPolicy::default());
        let hostile = [
            "../escape.py",
            "a/../../b.py",
            "/etc/passwd",
            ".bashrc",
            "pkg/.hidden",
            ".git/config",
            "",
            "   ",
            "a\\..\\b",
        ];
        for path in hostile {
            let result = stager.stage(&[spec("ok.py", "1"), spec(path, "x")]);
            let err = result.expect_err(path);
            assert_eq!(err.code(), ErrorCode::PolicyViolation, "path {:?}", path);
        }
        assert_eq!(entries(root.path()), 0);
    }

    #[test]
    fn test_accepted_paths_stay_inside_root() {
        for path in ["main.py", "./main.py", "pkg/mod.py", "a/b/c/d.txt", ".config_dir_not_basename/x.py"] {
            let rel = match validate_relative_path(path) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            assert!(rel.is_relative());
            assert!(rel.components().all(|c| matches!(c, Component::Normal(_))));
            let joined = Path::new("/ws").join(&rel);
            assert!(joined.starts_with("/ws"));
        }
    }

    #[test]
    fn test_normalize_workdir() {
        assert_eq!(normalize_workdir("").unwrap(), None);
        assert_eq!(normalize_workdir(".").unwrap(), None);
        assert_eq!(normalize_workdir("./src/").unwrap(), Some("src".to_string()));
        assert_eq!(normalize_workdir("a/b").unwrap(), Some("a/b".to_string()));
        assert!(normalize_workdir("../x").is_err());
        assert!(normalize_workdir("/abs").is_err());
    }
}
