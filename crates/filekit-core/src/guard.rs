//! Path security policy.

use std::path::{Component, Path, PathBuf};

use crate::config::SecurityConfig;
use crate::error::FsError;

/// Rejects paths that pass through a forbidden directory.
#[derive(Debug, Clone, Default)]
pub struct PathGuard {
    forbidden: Vec<String>,
}

impl PathGuard {
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            forbidden: config.forbidden_dirs.clone(),
        }
    }

    /// Fail with [`FsError::ForbiddenPath`] if any segment equals a forbidden name.
    pub fn check(&self, path: &Path) -> Result<(), FsError> {
        let normalized = normalize(path);
        for component in normalized.components() {
            let Component::Normal(segment) = component else {
                continue;
            };
            let segment = segment.to_string_lossy();
            if self.forbidden.iter().any(|f| f.as_str() == segment) {
                return Err(FsError::ForbiddenPath {
                    path: normalized.clone(),
                    segment: segment.into_owned(),
                });
            }
        }
        Ok(())
    }
}

/// Make a path absolute and fold `.` and `..` without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
