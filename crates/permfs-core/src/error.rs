// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for permfs core

use std::fmt;

/// Why an otherwise well-formed request cannot be carried out on the target node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidKind {
    IsADirectory,
    NotADirectory,
    DirectoryNotEmpty,
    RootDirectory,
    MoveIntoSelf,
    MalformedEntry { line: usize },
}

impl fmt::Display for InvalidKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidKind::IsADirectory => f.write_str("is a directory"),
            InvalidKind::NotADirectory => f.write_str("not a directory"),
            InvalidKind::DirectoryNotEmpty => f.write_str("directory not empty"),
            InvalidKind::RootDirectory => {
                f.write_str("operation not permitted on the root directory")
            }
            InvalidKind::MoveIntoSelf => f.write_str("cannot move a directory into itself"),
            InvalidKind::MalformedEntry { line } => write!(f, "malformed entry on line {}", line),
        }
    }
}

/// Core filesystem error type
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("permission denied: {path}: {reason}")]
    UnauthorizedAccess { path: String, reason: String },
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("{path}: {kind}")]
    InvalidOperation { path: String, kind: InvalidKind },
    #[error("file exists: {0}")]
    AlreadyExists(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl FsError {
    pub(crate) fn denied(path: impl Into<String>, reason: impl Into<String>) -> Self {
        FsError::UnauthorizedAccess {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(path: impl Into<String>, kind: InvalidKind) -> Self {
        FsError::InvalidOperation {
            path: path.into(),
            kind,
        }
    }

    /// Closest POSIX errno, for shell callers that report `strerror`-style failures
    pub fn errno(&self) -> i32 {
        match self {
            FsError::UnauthorizedAccess { .. } => libc::EACCES,
            FsError::NotFound(_) => libc::ENOENT,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::InvalidPath(_) => libc::EINVAL,
            FsError::InvalidOperation { kind, .. } => match kind {
                InvalidKind::IsADirectory => libc::EISDIR,
                InvalidKind::NotADirectory => libc::ENOTDIR,
                InvalidKind::DirectoryNotEmpty => libc::ENOTEMPTY,
                InvalidKind::RootDirectory => libc::EBUSY,
                InvalidKind::MoveIntoSelf | InvalidKind::MalformedEntry { .. } => libc::EINVAL,
            },
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, FsError::UnauthorizedAccess { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::denied("/x", "no").errno(), libc::EACCES);
        assert_eq!(FsError::NotFound("/x".into()).errno(), libc::ENOENT);
        assert_eq!(FsError::AlreadyExists("/x".into()).errno(), libc::EEXIST);
        assert_eq!(
            FsError::invalid("/x", InvalidKind::DirectoryNotEmpty).errno(),
            libc::ENOTEMPTY
        );
        assert_eq!(FsError::invalid("/x", InvalidKind::IsADirectory).errno(), libc::EISDIR);
    }

    #[test]
    fn test_display_carries_path() {
        let err = FsError::invalid("/home/alice", InvalidKind::NotADirectory);
        assert_eq!(err.to_string(), "/home/alice: not a directory");

        let err = FsError::denied("/etc/shadow", "read denied for bob(1001)");
        assert_eq!(
            err.to_string(),
            "permission denied: /etc/shadow: read denied for bob(1001)"
        );
    }
}
