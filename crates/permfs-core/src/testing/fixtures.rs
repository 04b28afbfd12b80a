// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! A small seeded Unix layout.
//!
//! | path | owner | mode |
//! |---|---|---|
//! | `/etc/shadow` | root:root | 0600 |
//! | `/home/alice` | alice:alice | 0755 |
//! | `/home/bob` | bob:bob | 0700 |
//! | `/home/mallory/fake-sudo` | root:root | 4755 |
//! | `/usr/bin/sudo` | root:root | 4755 |
//! | `/usr/bin/wall` | root:tty | 2755 |
//! | `/usr/bin/newgrp` | root:root | 2755 |
//! | `/opt/game/score` | 4242:games | 4755 |
//! | `/srv/shared` | root:staff | 2775 |
//! | `/tmp` | root:root | 1777 |

use std::sync::Arc;

use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use crate::identity::UserDatabase;
use crate::tree::NodeTree;
use crate::vfs::VirtualFileSystem;

pub const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/sh
alice:x:1000:1000:Alice:/home/alice:/bin/sh
bob:x:1001:1001:Bob:/home/bob:/bin/sh
mallory:x:1002:1002:Mallory:/home/mallory:/bin/sh
";

pub const GROUP: &str = "\
root:x:0:
tty:x:5:
wheel:x:10:alice
staff:x:50:alice
games:x:60:
alice:x:1000:
bob:x:1001:
mallory:x:1002:
";

pub fn unix_layout() -> FsResult<NodeTree> {
    let mut tree = NodeTree::default();
    tree.seed_file("/bin/sh", "#!shell", 0, 0, 0o755)?;
    tree.seed_file("/etc/passwd", PASSWD, 0, 0, 0o644)?;
    tree.seed_file("/etc/group", GROUP, 0, 0, 0o644)?;
    tree.seed_file("/etc/shadow", "root:*:19000::::::\n", 0, 0, 0o600)?;
    tree.seed_file("/etc/hostname", "permfs\n", 0, 0, 0o644)?;

    tree.seed_directory("/home/alice", 1000, 1000, 0o755)?;
    tree.seed_directory("/home/bob", 1001, 1001, 0o700)?;
    tree.seed_file("/home/bob/diary.txt", "dear diary", 1001, 1001, 0o600)?;
    tree.seed_directory("/home/mallory", 1002, 1002, 0o755)?;
    tree.seed_file("/home/mallory/fake-sudo", "#!elevate", 0, 0, 0o4755)?;

    tree.seed_file("/usr/bin/sudo", "#!elevate", 0, 0, 0o4755)?;
    tree.seed_file("/usr/bin/wall", "#!broadcast", 0, 5, 0o2755)?;
    tree.seed_file("/usr/bin/newgrp", "#!group", 0, 0, 0o2755)?;
    tree.seed_file("/usr/bin/ls", "#!list", 0, 0, 0o755)?;
    tree.seed_file("/opt/game/score", "#!score", 4242, 60, 0o4755)?;

    tree.seed_directory("/srv/shared", 0, 50, 0o2775)?;
    tree.seed_directory("/tmp", 0, 0, 0o1777)?;
    tree.seed_directory("/var/log", 0, 0, 0o755)?;
    Ok(tree)
}

/// User database read back from the seeded `/etc/passwd` and `/etc/group`
pub fn etc_database(tree: &NodeTree) -> FsResult<UserDatabase> {
    let read = |path: &str| -> FsResult<String> {
        let bytes = tree
            .file_content(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    };
    UserDatabase::from_etc(&read("/etc/passwd")?, &read("/etc/group")?)
}

/// [`unix_layout`] behind a facade whose identities come from its own `/etc` files
pub fn unix_fs(config: FsConfig) -> FsResult<VirtualFileSystem> {
    let tree = unix_layout()?;
    let users = etc_database(&tree)?;
    VirtualFileSystem::with_tree(config, tree, Arc::new(users))
}
