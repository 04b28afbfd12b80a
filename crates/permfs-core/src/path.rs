// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Path utilities: normalization against a working directory and component helpers.
//!
//! All paths handed to the node tree are absolute, start with `/`, contain no
//! empty, `.` or `..` segments and have no trailing separator (except `/` itself).

use crate::error::{FsError, FsResult};

/// Normalize `path` against the absolute working directory `cwd`.
///
/// Relative paths are joined onto `cwd`; duplicate separators collapse; `.` is
/// dropped and `..` pops one component. `..` at the root stays at the root.
pub fn normalize(path: &str, cwd: &str) -> FsResult<String> {
    if path.is_empty() {
        return Err(FsError::InvalidPath("empty path".to_string()));
    }
    if path.contains('\0') {
        return Err(FsError::InvalidPath(format!("{:?} contains a NUL byte", path)));
    }

    let mut components: Vec<&str> = Vec::new();
    if !path.starts_with('/') {
        if !cwd.starts_with('/') {
            return Err(FsError::InvalidPath(format!(
                "working directory {:?} is not absolute",
                cwd
            )));
        }
        push_components(&mut components, cwd);
    }
    push_components(&mut components, path);

    Ok(from_components(&components))
}

fn push_components<'a>(components: &mut Vec<&'a str>, path: &'a str) {
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                components.pop();
            }
            c => components.push(c),
        }
    }
}

fn from_components(components: &[&str]) -> String {
    if components.is_empty() {
        return "/".to_string();
    }
    let mut result = String::new();
    for component in components {
        result.push('/');
        result.push_str(component);
    }
    result
}

/// Components of a normalized path, root yields none
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Parent of a normalized path, `None` for the root
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(pos) => Some(&path[..pos]),
        None => None,
    }
}

/// Last component of a normalized path, empty for the root
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

pub fn join(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", base, name)
    }
}

/// Whether `path` equals `base` or lies beneath it, compared component-wise
pub fn is_within(path: &str, base: &str) -> bool {
    if base == "/" {
        return path.starts_with('/');
    }
    path.starts_with(base) && (path.len() == base.len() || path.as_bytes()[base.len()] == b'/')
}
