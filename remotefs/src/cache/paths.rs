use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("name is empty")]
    Empty,
    #[error("name `{0}` contains a path separator")]
    Separator(String),
    #[error("name `{0}` is reserved")]
    Reserved(String),
    #[error("remote path contains unsupported component")]
    UnsupportedComponent,
    #[error("`{0}` cannot be placed inside itself")]
    IntoItself(String),
}

/// Name of the self-identifying entry every listing reply carries.
pub const SELF_ENTRY_NAME: &str = ".";

/// Non-empty segments of a slash separated remote path.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|part| !part.is_empty()).collect()
}

/// Canonical form: leading slash, no empty segments, no trailing slash.
pub fn normalize(path: &str) -> String {
    let parts = segments(path);
    if parts.is_empty() {
        return "/".to_string();
    }
    format!("/{}", parts.join("/"))
}

pub fn join(parent: &str, name: &str) -> String {
    normalize(&format!("{parent}/{name}"))
}

pub fn file_name(path: &str) -> &str {
    path.rsplit('/').find(|part| !part.is_empty()).unwrap_or("")
}

pub fn containing_path(path: &str) -> String {
    let parts = segments(path);
    match parts.split_last() {
        Some((_, rest)) if !rest.is_empty() => format!("/{}", rest.join("/")),
        _ => "/".to_string(),
    }
}

/// True when `path` equals `ancestor` or lies below it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    let path = segments(path);
    let ancestor = segments(ancestor);
    path.len() >= ancestor.len() && path.iter().zip(&ancestor).all(|(a, b)| a == b)
}

/// Validates a single entry name supplied for mkdir, rename or buffer upload.
pub fn validate_name(name: &str) -> Result<(), PathError> {
    if name.is_empty() {
        return Err(PathError::Empty);
    }
    if name.contains('/') || name.contains('\\') {
        return Err(PathError::Separator(name.to_string()));
    }
    if name == SELF_ENTRY_NAME || name == ".." {
        return Err(PathError::Reserved(name.to_string()));
    }
    Ok(())
}

/// Maps a remote path relative to `remote_head` onto `local_root`.
pub fn local_path_for(
    local_root: &Path,
    remote_head: &str,
    remote_path: &str,
) -> Result<PathBuf, PathError> {
    let head = segments(remote_head);
    let full = segments(remote_path);
    if full.len() < head.len() || full.iter().zip(&head).any(|(a, b)| a != b) {
        return Err(PathError::UnsupportedComponent);
    }

    let mut out = local_root.to_path_buf();
    for part in &full[head.len()..] {
        match Path::new(part).components().next() {
            Some(Component::Normal(_)) => out.push(part),
            _ => return Err(PathError::UnsupportedComponent),
        }
    }
    Ok(out)
}
