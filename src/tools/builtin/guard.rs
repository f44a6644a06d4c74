//! Command blocklist and workspace write boundary used by the built-in tools.
//!
//! Neither is a security boundary on its own: the blocklist catches obvious
//! destructive commands, the workspace guard keeps `file_write` inside the
//! workspace (symlinks resolved).

use std::path::{Component, Path, PathBuf};

use regex::RegexSet;

use crate::error::ToolError;

/// Default `(pattern, reason)` blocklist for `shell_exec`.
pub fn default_blocklist() -> Vec<(String, String)> {
    [
        (r"(?i)\bsudo\b", "Privilege escalation (sudo) not allowed"),
        (r"(?i)\bsu\b\s", "Privilege escalation (su) not allowed"),
        (r"(?i)\bdoas\b", "Privilege escalation (doas) not allowed"),
        (r"rm\s+(-[^\s]*\s+)*/(\*|\s|$)", "Recursive deletion at root not allowed"),
        (r">\s*/(etc|usr|boot|sys|proc)/", "Write to system directory not allowed"),
        (r"(?i)\bmkfs\b", "Filesystem formatting not allowed"),
        (r"(?i)\bdd\b\s.*of=/dev/", "Direct device writes not allowed"),
        (r":\(\)\s*\{.*\}", "Fork bomb pattern detected"),
        (r"(?i)\b(shutdown|reboot|halt|poweroff)\b", "System power control not allowed"),
        (r"(chmod|chown)\s.*\s/($|\s|[a-z])", "Permission changes at root level not allowed"),
    ]
    .into_iter()
    .map(|(p, r)| (p.to_string(), r.to_string()))
    .collect()
}

/// Matches commands against the blocklist in one pass.
#[derive(Debug, Clone)]
pub struct CommandFilter {
    patterns: RegexSet,
    reasons: Vec<String>,
}

impl CommandFilter {
    pub fn new(patterns: &[(String, String)]) -> Result<Self, ToolError> {
        let (regexes, reasons): (Vec<_>, Vec<_>) = patterns.iter().cloned().unzip();
        let patterns =
            RegexSet::new(&regexes).map_err(|e| ToolError::InvalidPattern(e.to_string()))?;
        Ok(Self { patterns, reasons })
    }

    /// Reason of the first matching pattern, if the command is blocked.
    pub fn check(&self, command: &str) -> Option<&str> {
        self.patterns
            .matches(command)
            .into_iter()
            .next()
            .map(|i| self.reasons[i].as_str())
    }

    pub fn len(&self) -> usize {
        self.reasons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reasons.is_empty()
    }
}

/// Resolves write targets and rejects anything outside the workspace root.
#[derive(Debug, Clone)]
pub struct WorkspaceGuard {
    canonical_root: PathBuf,
}

impl WorkspaceGuard {
    /// Creates the workspace directory if needed and resolves it.
    pub fn new(workspace: &Path) -> Result<Self, ToolError> {
        let to_err = |e: std::io::Error| ToolError::Workspace {
            path: workspace.to_path_buf(),
            message: e.to_string(),
        };
        std::fs::create_dir_all(workspace).map_err(to_err)?;
        let canonical_root = std::fs::canonicalize(workspace).map_err(to_err)?;
        Ok(Self { canonical_root })
    }

    pub fn root(&self) -> &Path {
        &self.canonical_root
    }

    /// Resolve `target` (relative to the root, or absolute) for writing.
    ///
    /// The path is first normalized lexically so `..` cannot climb out before
    /// any directory is created; parent directories are then created and the
    /// resolved parent is checked again to catch symlinks.
    pub fn resolve_write(&self, target: &str) -> Result<PathBuf, String> {
        let joined = self.canonical_root.join(target);
        let normalized = normalize(&joined);
        if !normalized.starts_with(&self.canonical_root) || normalized == self.canonical_root {
            return Err(format!("path '{target}' is outside the workspace directory"));
        }

        let parent = normalized
            .parent()
            .ok_or_else(|| format!("path '{target}' has no parent directory"))?;
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("failed to create directories: {e}"))?;
        let canonical_parent =
            std::fs::canonicalize(parent).map_err(|e| format!("failed to resolve path: {e}"))?;
        if !canonical_parent.starts_with(&self.canonical_root) {
            return Err(format!("path '{target}' is outside the workspace directory"));
        }

        let file_name = normalized
            .file_name()
            .ok_or_else(|| format!("path '{target}' has no file name"))?;
        let resolved = canonical_parent.join(file_name);
        if resolved.is_symlink() {
            let real = std::fs::canonicalize(&resolved)
                .map_err(|e| format!("failed to resolve path: {e}"))?;
            if !real.starts_with(&self.canonical_root) {
                return Err(format!("path '{target}' is outside the workspace directory"));
            }
        }
        Ok(resolved)
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn filter() -> CommandFilter {
        CommandFilter::new(&default_blocklist()).unwrap()
    }

    #[test]
    fn blocks_privilege_escalation() {
        assert!(filter().check("sudo rm -rf /tmp/x").is_some());
    }

    #[test]
    fn blocks_root_deletion() {
        assert!(filter().check("rm -rf /").is_some());
        assert!(filter().check("rm -rf /*").is_some());
    }

    #[test]
    fn allows_ordinary_commands() {
        for cmd in ["ls -la", "cargo build", "rm -rf ./target", "echo pseudo"] {
            assert!(filter().check(cmd).is_none(), "should allow: {cmd}");
        }
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        let bad = vec![("(unclosed".to_string(), "bad".to_string())];
        assert!(matches!(CommandFilter::new(&bad), Err(ToolError::InvalidPattern(_))));
    }

    #[test]
    fn write_inside_workspace_is_resolved() {
        let tmp = TempDir::new().unwrap();
        let guard = WorkspaceGuard::new(&tmp.path().join("ws")).unwrap();
        let path = guard.resolve_write("a/b/c.txt").unwrap();
        assert!(path.starts_with(guard.root()));
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn parent_escape_is_rejected_without_creating_dirs() {
        let tmp = TempDir::new().unwrap();
        let guard = WorkspaceGuard::new(&tmp.path().join("ws")).unwrap();
        assert!(guard.resolve_write("../outside/x.txt").is_err());
        assert!(!tmp.path().join("outside").exists());
    }

    #[test]
    fn absolute_path_outside_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let guard = WorkspaceGuard::new(&tmp.path().join("ws")).unwrap();
        let outside = tmp.path().join("elsewhere.txt");
        assert!(guard.resolve_write(outside.to_str().unwrap()).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directory_escape_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        let guard = WorkspaceGuard::new(&tmp.path().join("ws")).unwrap();
        std::os::unix::fs::symlink(&outside, guard.root().join("link")).unwrap();
        assert!(guard.resolve_write("link/x.txt").is_err());
    }
}
