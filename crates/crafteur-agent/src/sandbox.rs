//! Path scoping shared by everything that touches files inside a server directory.

use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path must be relative")]
    Absolute,
    #[error("path traversal is not allowed")]
    Traversal,
    #[error("path must not be empty")]
    Empty,
}

pub fn normalize_rel_path(rel: &str) -> Result<PathBuf, PathError> {
    let rel = rel.trim();
    if rel.is_empty() {
        return Err(PathError::Empty);
    }

    let p = Path::new(rel);
    if p.is_absolute() {
        return Err(PathError::Absolute);
    }

    // Keep it simple: deny parent traversal and any prefix component.
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => return Err(PathError::Traversal),
            Component::Prefix(_) | Component::RootDir => return Err(PathError::Absolute),
        }
    }

    if out.as_os_str().is_empty() {
        return Err(PathError::Empty);
    }
    Ok(out)
}

/// Resolves `rel` below `root` without letting it escape.
pub fn resolve_in(root: &Path, rel: &str) -> Result<PathBuf, PathError> {
    Ok(root.join(normalize_rel_path(rel)?))
}
