use std::path::{Path, PathBuf};

/// Resolve a VM asset path. Absolute paths are used as-is; relative ones are
/// searched from the working directory upwards, then from the executable's
/// directory upwards. Falls back to the input when nothing matches.
pub fn resolve_vm_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }

    let mut roots = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }
    if let Some(exe_dir) = std::env::current_exe().ok().and_then(|e| e.parent().map(Path::to_path_buf)) {
        roots.push(exe_dir);
    }
    resolve_from(path, &roots).unwrap_or_else(|| path.to_path_buf())
}

/// Search `path` under each root and each of its ancestors.
pub fn resolve_from(path: &Path, roots: &[PathBuf]) -> Option<PathBuf> {
    roots
        .iter()
        .flat_map(|root| root.ancestors())
        .map(|dir| dir.join(path))
        .find(|candidate| candidate.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_from_parent_directory() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("vm")).unwrap();
        std::fs::write(root.path().join("vm/base.img"), b"img").unwrap();
        let nested = root.path().join("backend/bin");
        std::fs::create_dir_all(&nested).unwrap();

        let found = resolve_from(Path::new("vm/base.img"), &[nested]).unwrap();
        assert_eq!(found, root.path().join("vm/base.img"));
    }

    #[test]
    fn test_resolve_missing_falls_back() {
        let missing = Path::new("definitely/not/here.img");
        assert_eq!(resolve_vm_path(missing), missing.to_path_buf());
        assert_eq!(resolve_vm_path(Path::new("/abs/base.img")), PathBuf::from("/abs/base.img"));
    }
}
