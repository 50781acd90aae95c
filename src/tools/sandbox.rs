//! Path sandboxing for ToolExecutor (§4.4 ToolExecutor policies).

use std::path::{Path, PathBuf};

use crate::errors::ToolError;

/// A canonicalized, validated set of roots a tool call's paths must fall
/// under. For session stores, the allow-list additionally includes the
/// native Claude projects root and the shim sessions root (§4.4).
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    pub cwd: PathBuf,
    pub extra_roots: Vec<PathBuf>,
}

impl SandboxPolicy {
    pub fn new(cwd: impl Into<PathBuf>, extra_roots: Vec<PathBuf>) -> Self {
        Self { cwd: cwd.into(), extra_roots }
    }

    /// Canonicalize `path` (resolved relative to `cwd` if relative) and
    /// reject it unless it falls under `cwd` or one of `extra_roots`
    /// (S6). A path that doesn't exist yet (e.g. a new file being written)
    /// is checked against its canonicalized parent directory instead.
    pub fn check(&self, path: &str) -> Result<PathBuf, ToolError> {
        let candidate = Path::new(path);
        let absolute = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.cwd.join(candidate)
        };

        let canonical = canonicalize_best_effort(&absolute);
        let roots: Vec<PathBuf> = std::iter::once(canonicalize_best_effort(&self.cwd))
            .chain(self.extra_roots.iter().map(|r| canonicalize_best_effort(r)))
            .collect();

        if roots.iter().any(|root| canonical.starts_with(root)) {
            Ok(absolute)
        } else {
            Err(ToolError::SandboxViolation)
        }
    }
}

/// Canonicalize if the path exists; otherwise canonicalize the nearest
/// existing ancestor and re-append the remaining components, so
/// not-yet-created files can still be sandbox-checked.
fn canonicalize_best_effort(path: &Path) -> PathBuf {
    if let Ok(c) = path.canonicalize() {
        return c;
    }
    let mut remaining = Vec::new();
    let mut current = path.to_path_buf();
    loop {
        if let Ok(c) = current.canonicalize() {
            for comp in remaining.into_iter().rev() {
                current = c.join(comp);
                return current;
            }
            return c;
        }
        match (current.file_name().map(|f| f.to_owned()), current.parent().map(|p| p.to_path_buf())) {
            (Some(name), Some(parent)) => {
                remaining.push(name);
                current = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_outside_sandbox() {
        let policy = SandboxPolicy::new("/w", vec![]);
        let result = policy.check("/etc/passwd");
        assert!(matches!(result, Err(ToolError::SandboxViolation)));
    }

    #[test]
    fn allows_path_inside_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hi").unwrap();
        let policy = SandboxPolicy::new(dir.path(), vec![]);
        let result = policy.check("a.txt");
        assert!(result.is_ok());
    }

    #[test]
    fn allows_path_under_extra_root() {
        let cwd = tempfile::tempdir().unwrap();
        let extra = tempfile::tempdir().unwrap();
        std::fs::write(extra.path().join("b.txt"), "hi").unwrap();
        let policy = SandboxPolicy::new(cwd.path(), vec![extra.path().to_path_buf()]);
        let result = policy.check(extra.path().join("b.txt").to_str().unwrap());
        assert!(result.is_ok());
    }
}
