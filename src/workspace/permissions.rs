//! Permission normalization for staged workspaces.
//!
//! The sandboxed process runs as an unprivileged UID:GID and sees the
//! workspace through a read-only bind mount, so every directory must be
//! traversable and every file readable by that user.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const DIR_MODE: u32 = 0o755;
pub const FILE_MODE: u32 = 0o644;

/// Resolve the final mode for a staged file. A requested mode keeps its
/// execute bits but is always made world readable.
pub fn effective_file_mode(requested: Option<u32>) -> u32 {
    match requested {
        Some(mode) => (mode | 0o444) & 0o777,
        None => FILE_MODE,
    }
}

/// Parse an octal mode string such as `"755"` or `"0644"`.
pub fn parse_mode(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    u32::from_str_radix(raw, 8).ok().filter(|m| *m <= 0o7777)
}

/// Walk `root` and make directories 0755 and files readable, then chown
/// everything to `owner` when given. Failures are logged and skipped.
pub fn normalize_tree(root: &Path, owner: Option<(u32, u32)>) {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable workspace entry: {}", e);
                continue;
            }
        };
        let path = entry.path();
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }

        let mode = if file_type.is_dir() {
            DIR_MODE
        } else {
            let current = entry.metadata().map(|m| m.permissions().mode()).unwrap_or(FILE_MODE);
            (current | 0o444) & 0o777
        };
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
            warn!("chmod {} -> {:o} failed: {}", path.display(), mode, e);
        }

        if let Some((uid, gid)) = owner {
            if let Err(e) = std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
                // Expected when the server itself is unprivileged.
                debug!("chown {} -> {}:{} failed: {}", path.display(), uid, gid, e);
            }
        }
    }
}

/// Create the shared execution root, traversable by any container user.
pub fn ensure_exec_root(root: &Path, owner: Option<(u32, u32)>) -> std::io::Result<()> {
    fs::create_dir_all(root)?;
    fs::set_permissions(root, fs::Permissions::from_mode(0o777))?;
    if let Some((uid, gid)) = owner {
        if let Err(e) = std::os::unix::fs::chown(root, Some(uid), Some(gid)) {
            debug!("chown {} failed: {}", root.display(), e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_file_mode() {
        assert_eq!(effective_file_mode(None), 0o644);
        assert_eq!(effective_file_mode(Some(0o700)), 0o744);
        assert_eq!(effective_file_mode(Some(0o4755)), 0o755);
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("755"), Some(0o755));
        assert_eq!(parse_mode("0644"), Some(0o644));
        assert_eq!(parse_mode("9"), None);
        assert_eq!(parse_mode(""), None);
    }

    #[test]
    fn test_normalize_tree_sets_modes() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("pkg");
        fs::create_dir(&nested).unwrap();
        fs::set_permissions(&nested, fs::Permissions::from_mode(0o700)).unwrap();
        let file = nested.join("mod.py");
        fs::write(&file, "x = 1\n").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o600)).unwrap();

        normalize_tree(dir.path(), None);

        let dir_mode = fs::metadata(&nested).unwrap().permissions().mode() & 0o777;
        let file_mode = fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o755);
        assert_eq!(file_mode, 0o644);
    }
}
