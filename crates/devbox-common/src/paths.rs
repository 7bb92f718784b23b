//! Path rules shared by the store, the synchronizer and the runtime adapters.
//!
//! Records always carry POSIX, project-relative paths. Container-side paths are
//! those joined onto the workspace root.

use crate::{DevboxError, Result};

/// Normalises a caller-supplied path into `a/b/c` form.
///
/// Leading `./`, duplicate separators and `.` components are dropped.
/// Absolute paths, `..` components, NUL bytes and empty paths are rejected.
pub fn normalize(path: &str) -> Result<String> {
    if path.contains('\0') {
        return Err(DevboxError::Validation(
            "file path contains a NUL byte".to_string(),
        ));
    }
    if path.starts_with('/') {
        return Err(DevboxError::Validation(format!(
            "file path must be project-relative: {path}"
        )));
    }
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(DevboxError::Validation(format!(
                    "file path escapes the workspace: {path}"
                )))
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(DevboxError::Validation("file path is empty".to_string()));
    }
    Ok(parts.join("/"))
}

/// `workspace_root` + relative path, without a doubled slash.
pub fn container_path(workspace_root: &str, relative: &str) -> String {
    format!("{}/{}", workspace_root.trim_end_matches('/'), relative)
}

/// Inverse of [`container_path`]; `None` for paths outside the root.
pub fn relative_to_root(workspace_root: &str, absolute: &str) -> Option<String> {
    let root = workspace_root.trim_end_matches('/');
    let rest = absolute.strip_prefix(root)?.strip_prefix('/')?;
    if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}

/// Parent directory of a container path, if it has one below `/`.
pub fn parent_dir(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}
