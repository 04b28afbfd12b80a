// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for permfs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{FsError, FsResult};
use crate::identity::{Gid, Uid};

bitflags::bitflags! {
    /// Access being requested against a node. Bit values match one `rwx` octal digit.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AccessMask: u32 {
        const EXECUTE = 0o1;
        const WRITE = 0o2;
        const READ = 0o4;
    }
}

impl fmt::Display for AccessMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::with_capacity(3);
        out.push(if self.contains(AccessMask::READ) { 'r' } else { '-' });
        out.push(if self.contains(AccessMask::WRITE) { 'w' } else { '-' });
        out.push(if self.contains(AccessMask::EXECUTE) { 'x' } else { '-' });
        f.write_str(&out)
    }
}

/// Permission bits of a node: `rwx` for owner, group and other plus setuid, setgid and sticky
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mode(u32);

impl Mode {
    pub const SETUID: u32 = 0o4000;
    pub const SETGID: u32 = 0o2000;
    pub const STICKY: u32 = 0o1000;
    pub const ALL: u32 = 0o7777;

    pub const fn new(bits: u32) -> Self {
        Self(bits & Self::ALL)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn is_setuid(self) -> bool {
        self.0 & Self::SETUID != 0
    }

    pub fn is_setgid(self) -> bool {
        self.0 & Self::SETGID != 0
    }

    pub fn is_sticky(self) -> bool {
        self.0 & Self::STICKY != 0
    }

    /// The `rwx` triplet found `shift` bits up (6 owner, 3 group, 0 other)
    pub fn triplet(self, shift: u32) -> AccessMask {
        AccessMask::from_bits_truncate((self.0 >> shift) & 0o7)
    }

    pub fn with_umask(self, umask: u32) -> Self {
        Self::new(self.0 & !(umask & 0o777))
    }

    pub fn with_bits(self, bits: u32) -> Self {
        Self::new(self.0 | bits)
    }

    pub fn without_bits(self, bits: u32) -> Self {
        Self::new(self.0 & !bits)
    }

    /// Parse chmod-style octal text such as `644`, `0755` or `4755`
    pub fn from_octal(text: &str) -> FsResult<Self> {
        let digits = text.trim();
        let digits = digits.strip_prefix("0o").unwrap_or(digits);
        if digits.is_empty() || digits.len() > 5 {
            return Err(FsError::InvalidPath(format!("invalid mode: {}", text)));
        }
        let bits = u32::from_str_radix(digits, 8)
            .map_err(|_| FsError::InvalidPath(format!("invalid mode: {}", text)))?;
        if bits > Self::ALL {
            return Err(FsError::InvalidPath(format!("invalid mode: {}", text)));
        }
        Ok(Self(bits))
    }

    /// `ls -l` rendering, e.g. `-rwsr-xr-x` or `drwxrwxrwt`
    pub fn symbolic(self, is_dir: bool) -> String {
        let mut out = String::with_capacity(10);
        out.push(if is_dir { 'd' } else { '-' });
        self.push_triplet(&mut out, 6, self.is_setuid(), 's');
        self.push_triplet(&mut out, 3, self.is_setgid(), 's');
        self.push_triplet(&mut out, 0, self.is_sticky(), 't');
        out
    }

    fn push_triplet(self, out: &mut String, shift: u32, special: bool, marker: char) {
        let bits = self.triplet(shift);
        out.push(if bits.contains(AccessMask::READ) { 'r' } else { '-' });
        out.push(if bits.contains(AccessMask::WRITE) { 'w' } else { '-' });
        let exec = bits.contains(AccessMask::EXECUTE);
        out.push(match (special, exec) {
            (true, true) => marker,
            (true, false) => marker.to_ascii_uppercase(),
            (false, true) => 'x',
            (false, false) => '-',
        });
    }
}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mode({:04o})", self.0)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

impl From<u32> for Mode {
    fn from(bits: u32) -> Self {
        Self::new(bits)
    }
}

/// Node timestamps
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTimes {
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    /// Last metadata change (mode, owner, rename)
    pub changed: DateTime<Utc>,
}

impl FileTimes {
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            created: now,
            modified: now,
            changed: now,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    File,
    Directory,
}

/// Metadata snapshot of a node, detached from the tree
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeInfo {
    pub path: String,
    pub node_type: NodeType,
    pub len: u64,
    pub uid: Uid,
    pub gid: Gid,
    pub mode: Mode,
    pub times: FileTimes,
    /// Number of entries, directories only
    pub entries: Option<usize>,
}

impl NodeInfo {
    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.node_type == NodeType::File
    }
}

/// Directory entry information
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub len: u64,
    pub uid: Uid,
    pub gid: Gid,
    pub mode: Mode,
}
