// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Security identities and the user/group database used to resolve them

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{FsError, FsResult, InvalidKind};
use crate::path;

pub type Uid = u32;
pub type Gid = u32;

pub const ROOT_UID: Uid = 0;
pub const ROOT_GID: Gid = 0;

/// The security identity an operation runs as (uid, primary gid and supplementary groups)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub uid: Uid,
    pub username: String,
    pub primary_gid: Gid,
    #[serde(default)]
    pub secondary_gids: BTreeSet<Gid>,
}

impl Identity {
    pub fn new(uid: Uid, username: impl Into<String>, primary_gid: Gid) -> Self {
        Self {
            uid,
            username: username.into(),
            primary_gid,
            secondary_gids: BTreeSet::new(),
        }
    }

    pub fn root() -> Self {
        Self::new(ROOT_UID, "root", ROOT_GID)
    }

    pub fn with_groups(mut self, gids: impl IntoIterator<Item = Gid>) -> Self {
        self.secondary_gids.extend(gids);
        self
    }

    /// Copy of this identity with a different primary group, uid untouched
    pub fn with_primary_group(&self, gid: Gid) -> Self {
        let mut copy = self.clone();
        copy.primary_gid = gid;
        copy
    }

    pub fn is_root(&self) -> bool {
        self.uid == ROOT_UID
    }

    /// Membership through the primary group or any secondary group
    pub fn in_group(&self, gid: Gid) -> bool {
        self.primary_gid == gid || self.secondary_gids.contains(&gid)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.username, self.uid)
    }
}

/// An identity together with the working directory relative paths resolve against.
///
/// Every facade operation takes the caller explicitly; the filesystem keeps no
/// notion of a current user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    identity: Identity,
    cwd: String,
}

impl Caller {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            cwd: "/".to_string(),
        }
    }

    pub fn in_dir(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// Same working directory, different identity
    pub fn as_identity(&self, identity: Identity) -> Self {
        Self {
            identity,
            cwd: self.cwd.clone(),
        }
    }

    pub fn resolve(&self, path: &str) -> FsResult<String> {
        path::normalize(path, &self.cwd)
    }
}

/// Resolves numeric ids to identities and names, typically backed by `/etc/passwd` and `/etc/group`
#[cfg_attr(test, mockall::automock)]
pub trait IdentityResolver: Send + Sync {
    fn identity_for_uid(&self, uid: Uid) -> Option<Identity>;

    fn group_name(&self, gid: Gid) -> Option<String>;
}

/// One `/etc/passwd` record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
    pub gecos: String,
    pub home: String,
    pub shell: String,
}

/// One `/etc/group` record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub name: String,
    pub gid: Gid,
    pub members: Vec<String>,
}

/// In-memory user and group database
#[derive(Clone, Debug, Default)]
pub struct UserDatabase {
    users: BTreeMap<Uid, UserEntry>,
    groups: BTreeMap<Gid, GroupEntry>,
}

impl UserDatabase {
    /// Database containing only `root` and its group
    pub fn new() -> Self {
        let mut db = Self::default();
        db.add_user(UserEntry {
            name: "root".to_string(),
            uid: ROOT_UID,
            gid: ROOT_GID,
            gecos: "root".to_string(),
            home: "/root".to_string(),
            shell: "/bin/sh".to_string(),
        });
        db.add_group(GroupEntry {
            name: "root".to_string(),
            gid: ROOT_GID,
            members: Vec::new(),
        });
        db
    }

    /// Build from the text of `/etc/passwd` and `/etc/group`
    pub fn from_etc(passwd: &str, group: &str) -> FsResult<Self> {
        let mut db = Self::default();
        for user in parse_passwd(passwd)? {
            db.add_user(user);
        }
        for group in parse_group(group)? {
            db.add_group(group);
        }
        Ok(db)
    }

    pub fn add_user(&mut self, user: UserEntry) {
        self.users.insert(user.uid, user);
    }

    pub fn add_group(&mut self, group: GroupEntry) {
        self.groups.insert(group.gid, group);
    }

    pub fn user(&self, uid: Uid) -> Option<&UserEntry> {
        self.users.get(&uid)
    }

    pub fn user_by_name(&self, name: &str) -> Option<&UserEntry> {
        self.users.values().find(|u| u.name == name)
    }

    pub fn group(&self, gid: Gid) -> Option<&GroupEntry> {
        self.groups.get(&gid)
    }

    pub fn identity_for_name(&self, name: &str) -> Option<Identity> {
        self.user_by_name(name).map(|user| self.identity_for_entry(user))
    }

    fn identity_for_entry(&self, user: &UserEntry) -> Identity {
        let secondary = self
            .groups
            .values()
            .filter(|g| g.gid != user.gid && g.members.iter().any(|m| m == &user.name))
            .map(|g| g.gid);
        Identity::new(user.uid, user.name.clone(), user.gid).with_groups(secondary)
    }
}

impl IdentityResolver for UserDatabase {
    fn identity_for_uid(&self, uid: Uid) -> Option<Identity> {
        self.user(uid).map(|user| self.identity_for_entry(user))
    }

    fn group_name(&self, gid: Gid) -> Option<String> {
        self.group(gid).map(|g| g.name.clone())
    }
}

fn records(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
}

fn malformed(file: &str, line: usize) -> FsError {
    FsError::invalid(file, InvalidKind::MalformedEntry { line })
}

/// Parse `name:password:uid:gid:gecos:home:shell` lines
pub fn parse_passwd(text: &str) -> FsResult<Vec<UserEntry>> {
    records(text)
        .map(|(line_no, line)| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() != 7 || fields[0].is_empty() {
                return Err(malformed("/etc/passwd", line_no));
            }
            let uid = fields[2].parse().map_err(|_| malformed("/etc/passwd", line_no))?;
            let gid = fields[3].parse().map_err(|_| malformed("/etc/passwd", line_no))?;
            Ok(UserEntry {
                name: fields[0].to_string(),
                uid,
                gid,
                gecos: fields[4].to_string(),
                home: fields[5].to_string(),
                shell: fields[6].to_string(),
            })
        })
        .collect()
}

/// Parse `name:password:gid:member,member` lines
pub fn parse_group(text: &str) -> FsResult<Vec<GroupEntry>> {
    records(text)
        .map(|(line_no, line)| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() != 4 || fields[0].is_empty() {
                return Err(malformed("/etc/group", line_no));
            }
            let gid = fields[2].parse().map_err(|_| malformed("/etc/group", line_no))?;
            let members = fields[3]
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect();
            Ok(GroupEntry {
                name: fields[0].to_string(),
                gid,
                members,
            })
        })
        .collect()
}
