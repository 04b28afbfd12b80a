// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! VirtualFileSystem facade - permission-checked operations over the node tree

use chrono::Utc;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::FsConfig;
use crate::elevation::{
    ElevationContext, ElevationKind, ElevationLog, ElevationRecord, TrustedPaths,
};
use crate::error::{FsError, FsResult, InvalidKind};
use crate::events::{
    DeliverySlot, EventBus, EventSink, EventType, FilesystemEvent, SubscriptionId,
};
use crate::identity::{
    Caller, Gid, Identity, IdentityResolver, Uid, UserDatabase, ROOT_GID, ROOT_UID,
};
use crate::path;
use crate::permissions::{
    check_access, may_chmod, may_chown, may_unlink_from_sticky, select_tier, tier_grants,
};
use crate::tree::{Node, NodeId, NodeKind, NodeTree};
use crate::types::{AccessMask, DirEntry, Mode, NodeInfo};

/// Denials and mutations observed during one call.
///
/// Events are queued while the tree lock is held. Before the lock is released
/// the batch reserves its delivery slot, so batches reach the sinks in the
/// order their mutations took effect even though dispatch runs unlocked.
struct Audit<'a> {
    identity: &'a Identity,
    quiet: bool,
    events: Vec<FilesystemEvent>,
}

impl<'a> Audit<'a> {
    fn new(identity: &'a Identity) -> Self {
        Self {
            identity,
            quiet: false,
            events: Vec::new(),
        }
    }

    /// Existence probes: denials are neither logged nor reported
    fn quiet(identity: &'a Identity) -> Self {
        Self {
            identity,
            quiet: true,
            events: Vec::new(),
        }
    }

    fn record(&mut self, event: FilesystemEvent) {
        if !self.quiet {
            self.events.push(event.with_actor(self.identity));
        }
    }

    fn deny(&mut self, path: &str, reason: String) -> FsError {
        if !self.quiet {
            tracing::warn!(
                uid = self.identity.uid,
                user = %self.identity.username,
                path,
                reason = %reason,
                "permission denied"
            );
        }
        self.record(
            FilesystemEvent::new(EventType::PermissionDenied, path).with_message(reason.clone()),
        );
        FsError::denied(path, reason)
    }
}

/// Where a path lands: its parent directory (absent for `/`) and the node itself if present
struct Located {
    parent: Option<NodeId>,
    node: Option<NodeId>,
}

/// The filesystem facade.
///
/// Every operation takes the acting [`Caller`] explicitly. The tree sits behind
/// a single `RwLock`: reads share it, mutations take it exclusively, and no
/// guard is ever held across an `.await`.
pub struct VirtualFileSystem {
    config: FsConfig,
    tree: RwLock<NodeTree>,
    events: EventBus,
    identities: Arc<dyn IdentityResolver>,
    trusted_paths: TrustedPaths,
    elevations: ElevationLog,
}

impl VirtualFileSystem {
    /// Empty filesystem (only `/`, owned by root) with a root-only user database
    pub fn new(config: FsConfig) -> FsResult<Self> {
        Self::with_tree(config, NodeTree::default(), Arc::new(UserDatabase::new()))
    }

    /// Take over a pre-seeded tree
    pub fn with_tree(
        config: FsConfig,
        tree: NodeTree,
        identities: Arc<dyn IdentityResolver>,
    ) -> FsResult<Self> {
        let trusted_paths = TrustedPaths::new(&config.security.trusted_paths)?;
        Ok(Self {
            events: EventBus::new(config.track_events),
            elevations: ElevationLog::new(config.elevation_log_capacity),
            tree: RwLock::new(tree),
            identities,
            trusted_paths,
            config,
        })
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    fn read_tree(&self) -> RwLockReadGuard<'_, NodeTree> {
        self.tree.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tree(&self) -> RwLockWriteGuard<'_, NodeTree> {
        self.tree.write().unwrap_or_else(PoisonError::into_inner)
    }

    // Events

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) -> SubscriptionId {
        self.events.subscribe(sink)
    }

    pub fn subscribe_fn<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&FilesystemEvent) + Send + Sync + 'static,
    {
        self.events.subscribe_fn(f)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> FsResult<()> {
        self.events.unsubscribe(id)
    }

    /// Claim a delivery slot for the queued events; call with the tree lock held
    fn reserve_slot(&self, audit: &Audit<'_>) -> Option<DeliverySlot> {
        (self.events.is_enabled() && !audit.events.is_empty()).then(|| self.events.reserve())
    }

    fn dispatch(&self, audit: Audit<'_>, slot: Option<DeliverySlot>) {
        if let Some(slot) = slot {
            self.events.deliver(slot, &audit.events);
        }
    }

    // Read-only accessors for metadata display; these bypass permission checks

    pub fn get_node(&self, path: &str) -> Option<NodeInfo> {
        let path = path::normalize(path, "/").ok()?;
        let tree = self.read_tree();
        tree.info(tree.lookup(&path)?)
    }

    pub fn get_file(&self, path: &str) -> Option<NodeInfo> {
        self.get_node(path).filter(NodeInfo::is_file)
    }

    pub fn get_directory(&self, path: &str) -> Option<NodeInfo> {
        self.get_node(path).filter(NodeInfo::is_dir)
    }

    pub fn node_count(&self) -> usize {
        self.read_tree().node_count()
    }

    // Permission plumbing

    fn require(
        &self,
        audit: &mut Audit<'_>,
        node: &Node,
        path: &str,
        required: AccessMask,
    ) -> FsResult<()> {
        if check_access(Some(node), audit.identity, required) {
            return Ok(());
        }
        let tier = select_tier(node, audit.identity);
        let reason = format!(
            "{} needs {} ({:?} tier of {} grants {})",
            audit.identity,
            required,
            tier,
            node.mode(),
            tier_grants(node, tier)
        );
        Err(audit.deny(path, reason))
    }

    fn check_sticky(
        &self,
        audit: &mut Audit<'_>,
        dir: &Node,
        child: &Node,
        path: &str,
    ) -> FsResult<()> {
        if !self.config.security.enforce_sticky_bit
            || may_unlink_from_sticky(dir, child, audit.identity)
        {
            return Ok(());
        }
        let reason = format!(
            "{} owns neither the entry nor its sticky directory",
            audit.identity
        );
        Err(audit.deny(path, reason))
    }

    /// Walk to the directory at `dir_path`, requiring Execute on it and on every directory above it
    fn traverse(&self, tree: &NodeTree, audit: &mut Audit<'_>, dir_path: &str) -> FsResult<NodeId> {
        let mut current = tree.root_id();
        let mut walked = String::from("/");
        let mut components = path::components(dir_path);
        loop {
            let node = tree.get(current).ok_or_else(|| FsError::NotFound(walked.clone()))?;
            if !node.is_dir() {
                return Err(FsError::invalid(walked, InvalidKind::NotADirectory));
            }
            self.require(audit, node, &walked, AccessMask::EXECUTE)?;
            let Some(component) = components.next() else {
                return Ok(current);
            };
            walked = path::join(&walked, component);
            current = tree
                .child(current, component)
                .ok_or_else(|| FsError::NotFound(walked.clone()))?;
        }
    }

    fn locate(&self, tree: &NodeTree, audit: &mut Audit<'_>, path: &str) -> FsResult<Located> {
        let Some(parent_path) = path::parent(path) else {
            return Ok(Located {
                parent: None,
                node: Some(tree.root_id()),
            });
        };
        let parent = self.traverse(tree, audit, parent_path)?;
        Ok(Located {
            parent: Some(parent),
            node: tree.child(parent, path::file_name(path)),
        })
    }

    fn existing<'t>(
        &self,
        tree: &'t NodeTree,
        audit: &mut Audit<'_>,
        path: &str,
    ) -> FsResult<(Option<NodeId>, NodeId, &'t Node)> {
        let located = self.locate(tree, audit, path)?;
        let id = located.node.ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let node = tree.get(id).ok_or_else(|| FsError::NotFound(path.to_string()))?;
        Ok((located.parent, id, node))
    }

    fn parent_node<'t>(tree: &'t NodeTree, parent: NodeId, path: &str) -> FsResult<&'t Node> {
        tree.get(parent)
            .ok_or_else(|| FsError::NotFound(path::parent(path).unwrap_or("/").to_string()))
    }

    // Call scaffolding

    fn with_read<'a, T, F>(
        &self,
        op: &'static str,
        caller: &'a Caller,
        path: &str,
        f: F,
    ) -> FsResult<T>
    where
        F: FnOnce(&NodeTree, &mut Audit<'a>, &str) -> FsResult<T>,
    {
        let path = caller.resolve(path)?;
        let mut audit = Audit::new(caller.identity());
        let (result, slot) = {
            let tree = self.read_tree();
            let result = f(&tree, &mut audit, &path);
            (result, self.reserve_slot(&audit))
        };
        self.finish(op, audit, slot, &path, result)
    }

    fn with_write<'a, T, F>(
        &self,
        op: &'static str,
        caller: &'a Caller,
        path: &str,
        f: F,
    ) -> FsResult<T>
    where
        F: FnOnce(&mut NodeTree, &mut Audit<'a>, &str) -> FsResult<T>,
    {
        let path = caller.resolve(path)?;
        let mut audit = Audit::new(caller.identity());
        let (result, slot) = {
            let mut tree = self.write_tree();
            let result = f(&mut tree, &mut audit, &path);
            (result, self.reserve_slot(&audit))
        };
        self.finish(op, audit, slot, &path, result)
    }

    fn finish<T>(
        &self,
        op: &'static str,
        audit: Audit<'_>,
        slot: Option<DeliverySlot>,
        path: &str,
        result: FsResult<T>,
    ) -> FsResult<T> {
        match &result {
            Ok(_) => tracing::debug!(op, uid = audit.identity.uid, path, "ok"),
            Err(err) if !err.is_unauthorized() => {
                tracing::debug!(op, uid = audit.identity.uid, path, error = %err, "failed")
            }
            Err(_) => {}
        }
        self.dispatch(audit, slot);
        result
    }

    // Node construction

    fn create_node(
        &self,
        tree: &mut NodeTree,
        audit: &mut Audit<'_>,
        parent: NodeId,
        path: &str,
        kind: NodeKind,
    ) -> FsResult<NodeId> {
        let parent_node = Self::parent_node(tree, parent, path)?;
        self.require(audit, parent_node, path::parent(path).unwrap_or("/"), AccessMask::WRITE)?;

        let is_dir = matches!(kind, NodeKind::Directory { .. });
        let inherit_group = parent_node.mode().is_setgid();
        let gid = if inherit_group {
            parent_node.gid()
        } else {
            audit.identity.primary_gid
        };
        let mut mode = if is_dir {
            self.config.defaults.dir_mode()
        } else {
            self.config.defaults.file_mode()
        };
        if is_dir && inherit_group {
            mode = mode.with_bits(Mode::SETGID);
        }

        let id = tree.insert(parent, path::file_name(path), kind, audit.identity.uid, gid, mode)?;
        tracing::debug!(uid = audit.identity.uid, gid, path, mode = %mode, "created node");
        audit.record(FilesystemEvent::new(EventType::Created, path));
        Ok(id)
    }

    /// Replace or extend a file's content; a missing file is created
    fn write_locked(
        &self,
        tree: &mut NodeTree,
        audit: &mut Audit<'_>,
        path: &str,
        data: Vec<u8>,
        append: bool,
    ) -> FsResult<()> {
        let located = self.locate(tree, audit, path)?;
        let Some(id) = located.node else {
            let parent = located.parent.ok_or_else(|| FsError::NotFound(path.to_string()))?;
            self.create_node(tree, audit, parent, path, NodeKind::File { content: data })?;
            return Ok(());
        };
        let node = tree.get(id).ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if node.is_dir() {
            return Err(FsError::invalid(path, InvalidKind::IsADirectory));
        }
        self.require(audit, node, path, AccessMask::WRITE)?;
        if append {
            tree.append_content(id, &data);
        } else {
            tree.set_content(id, data);
        }
        audit.record(FilesystemEvent::new(EventType::Written, path));
        Ok(())
    }

    // CRUD operations

    /// True when `path` names a file the caller can reach. Never errors.
    pub async fn file_exists(&self, caller: &Caller, path: &str) -> bool {
        self.probe(caller, path, false)
    }

    /// True when `path` names a directory the caller can reach. Never errors.
    pub async fn directory_exists(&self, caller: &Caller, path: &str) -> bool {
        self.probe(caller, path, true)
    }

    fn probe(&self, caller: &Caller, path: &str, want_dir: bool) -> bool {
        let Ok(path) = caller.resolve(path) else {
            return false;
        };
        let mut audit = Audit::quiet(caller.identity());
        let tree = self.read_tree();
        match self.locate(&tree, &mut audit, &path) {
            Ok(Located { node: Some(id), .. }) => {
                tree.get(id).is_some_and(|n| n.is_dir() == want_dir)
            }
            _ => false,
        }
    }

    pub async fn read_file(&self, caller: &Caller, path: &str) -> FsResult<Vec<u8>> {
        self.with_read("read_file", caller, path, |tree, audit, path| {
            let (_, _, node) = self.existing(tree, audit, path)?;
            if node.is_dir() {
                return Err(FsError::invalid(path, InvalidKind::IsADirectory));
            }
            self.require(audit, node, path, AccessMask::READ)?;
            Ok(node.content().map(<[u8]>::to_vec).unwrap_or_default())
        })
    }

    /// Replace the content of `path`, creating the file when absent
    pub async fn write_file(&self, caller: &Caller, path: &str, data: &[u8]) -> FsResult<()> {
        self.with_write("write_file", caller, path, |tree, audit, path| {
            self.write_locked(tree, audit, path, data.to_vec(), false)
        })
    }

    pub async fn append_file(&self, caller: &Caller, path: &str, data: &[u8]) -> FsResult<()> {
        self.with_write("append_file", caller, path, |tree, audit, path| {
            self.write_locked(tree, audit, path, data.to_vec(), true)
        })
    }

    /// Create a file; an existing file is truncated and rewritten only with `overwrite`
    pub async fn create_file(
        &self,
        caller: &Caller,
        path: &str,
        data: &[u8],
        overwrite: bool,
    ) -> FsResult<()> {
        self.with_write("create_file", caller, path, |tree, audit, path| {
            let located = self.locate(tree, audit, path)?;
            match located.node {
                Some(id) if overwrite => {
                    let node = tree.get(id).ok_or_else(|| FsError::NotFound(path.to_string()))?;
                    if node.is_dir() {
                        return Err(FsError::invalid(path, InvalidKind::IsADirectory));
                    }
                    self.require(audit, node, path, AccessMask::WRITE)?;
                    tree.set_content(id, data.to_vec());
                    audit.record(FilesystemEvent::new(EventType::Written, path));
                    Ok(())
                }
                Some(_) => Err(FsError::AlreadyExists(path.to_string())),
                None => {
                    let parent = located.parent.ok_or_else(|| FsError::NotFound(path.to_string()))?;
                    let kind = NodeKind::File {
                        content: data.to_vec(),
                    };
                    self.create_node(tree, audit, parent, path, kind)?;
                    Ok(())
                }
            }
        })
    }

    /// Create a directory. With `parents`, missing ancestors are created and an
    /// existing directory is not an error. Every level is checked before the
    /// first directory is inserted, so a denied level leaves the tree untouched.
    pub async fn create_directory(
        &self,
        caller: &Caller,
        path: &str,
        parents: bool,
    ) -> FsResult<()> {
        self.with_write("create_directory", caller, path, |tree, audit, path| {
            if !parents {
                let located = self.locate(tree, audit, path)?;
                let (None, Some(parent)) = (located.node, located.parent) else {
                    return Err(FsError::AlreadyExists(path.to_string()));
                };
                self.create_node(tree, audit, parent, path, NodeKind::empty_directory())?;
                return Ok(());
            }

            // Walk the existing prefix
            let mut current = tree.root_id();
            let mut walked = String::from("/");
            let mut missing = Vec::new();
            for component in path::components(path) {
                if !missing.is_empty() {
                    missing.push(component);
                    continue;
                }
                let node = tree.get(current).ok_or_else(|| FsError::NotFound(walked.clone()))?;
                if !node.is_dir() {
                    return Err(FsError::invalid(walked, InvalidKind::NotADirectory));
                }
                self.require(audit, node, &walked, AccessMask::EXECUTE)?;
                match tree.child(current, component) {
                    Some(id) => {
                        current = id;
                        walked = path::join(&walked, component);
                    }
                    None => missing.push(component),
                }
            }
            if missing.is_empty() {
                return match tree.get(current) {
                    Some(node) if node.is_dir() => Ok(()),
                    _ => Err(FsError::AlreadyExists(path.to_string())),
                };
            }

            let anchor = tree.get(current).ok_or_else(|| FsError::NotFound(walked.clone()))?;
            self.require(audit, anchor, &walked, AccessMask::WRITE)?;
            // Deeper levels are created inside directories the caller will own
            let needed = AccessMask::WRITE | AccessMask::EXECUTE;
            if missing.len() > 1
                && !audit.identity.is_root()
                && !self.config.defaults.dir_mode().triplet(6).contains(needed)
            {
                let blocked = path::join(&walked, missing[0]);
                let reason = format!(
                    "{} cannot create entries below {} with directory mode {}",
                    audit.identity,
                    blocked,
                    self.config.defaults.dir_mode()
                );
                return Err(audit.deny(&blocked, reason));
            }

            for component in missing {
                let next = path::join(&walked, component);
                let kind = NodeKind::empty_directory();
                current = self.create_node(tree, audit, current, &next, kind)?;
                walked = next;
            }
            Ok(())
        })
    }

    pub async fn delete_file(&self, caller: &Caller, path: &str) -> FsResult<()> {
        self.with_write("delete_file", caller, path, |tree, audit, path| {
            let (parent, id, node) = self.existing(tree, audit, path)?;
            let Some(parent) = parent.filter(|_| !node.is_dir()) else {
                return Err(FsError::invalid(path, InvalidKind::IsADirectory));
            };
            self.require(audit, node, path, AccessMask::WRITE)?;
            self.check_sticky(audit, Self::parent_node(tree, parent, path)?, node, path)?;
            tree.remove_subtree(id)?;
            audit.record(FilesystemEvent::new(EventType::Deleted, path));
            Ok(())
        })
    }

    /// Delete a directory. Without `recursive` it must be empty; with it, Write is
    /// required on every descendant and the whole subtree goes at once or not at
    /// all. Returns the number of nodes removed.
    pub async fn delete_directory(
        &self,
        caller: &Caller,
        path: &str,
        recursive: bool,
    ) -> FsResult<usize> {
        self.with_write("delete_directory", caller, path, |tree, audit, path| {
            let (parent, id, node) = self.existing(tree, audit, path)?;
            let Some(children) = node.children() else {
                return Err(FsError::invalid(path, InvalidKind::NotADirectory));
            };
            let Some(parent) = parent else {
                return Err(FsError::invalid(path, InvalidKind::RootDirectory));
            };
            if !children.is_empty() && !recursive {
                return Err(FsError::invalid(path, InvalidKind::DirectoryNotEmpty));
            }
            self.require(audit, node, path, AccessMask::WRITE)?;
            self.check_sticky(audit, Self::parent_node(tree, parent, path)?, node, path)?;

            let doomed = tree.subtree(id);
            let mut removed_paths = Vec::with_capacity(doomed.len());
            for &member in &doomed {
                let member_path = tree.path_of(member).unwrap_or_default();
                if member != id {
                    let member_node = tree
                        .get(member)
                        .ok_or_else(|| FsError::NotFound(member_path.clone()))?;
                    self.require(audit, member_node, &member_path, AccessMask::WRITE)?;
                    if let Some(dir) = member_node.parent().and_then(|p| tree.get(p)) {
                        self.check_sticky(audit, dir, member_node, &member_path)?;
                    }
                }
                removed_paths.push(member_path);
            }

            let removed = tree.remove_subtree(id)?;
            for removed_path in removed_paths {
                audit.record(FilesystemEvent::new(EventType::Deleted, removed_path));
            }
            Ok(removed)
        })
    }

    pub async fn list_directory(&self, caller: &Caller, path: &str) -> FsResult<Vec<DirEntry>> {
        self.with_read("list_directory", caller, path, |tree, audit, path| {
            let (_, _, node) = self.existing(tree, audit, path)?;
            let Some(children) = node.children() else {
                return Err(FsError::invalid(path, InvalidKind::NotADirectory));
            };
            self.require(audit, node, path, AccessMask::READ)?;
            Ok(children
                .iter()
                .filter_map(|(name, id)| tree.get(*id).map(|child| (name, child)))
                .map(|(name, child)| DirEntry {
                    name: name.clone(),
                    is_dir: child.is_dir(),
                    len: child.len(),
                    uid: child.uid(),
                    gid: child.gid(),
                    mode: child.mode(),
                })
                .collect())
        })
    }

    /// Move `from` to `to`. The destination must not exist.
    pub async fn rename(&self, caller: &Caller, from: &str, to: &str) -> FsResult<()> {
        let to = caller.resolve(to)?;
        self.with_write("rename", caller, from, |tree, audit, from| {
            let (parent, id, node) = self.existing(tree, audit, from)?;
            let Some(parent) = parent else {
                return Err(FsError::invalid(from, InvalidKind::RootDirectory));
            };
            self.require(audit, node, from, AccessMask::WRITE)?;
            self.check_sticky(audit, Self::parent_node(tree, parent, from)?, node, from)?;
            if from == to {
                return Ok(());
            }

            let destination = self.locate(tree, audit, &to)?;
            let (None, Some(new_parent)) = (destination.node, destination.parent) else {
                return Err(FsError::AlreadyExists(to.clone()));
            };
            let new_parent_node = Self::parent_node(tree, new_parent, &to)?;
            let new_parent_path = path::parent(&to).unwrap_or("/");
            self.require(audit, new_parent_node, new_parent_path, AccessMask::WRITE)?;

            tree.relocate(id, new_parent, path::file_name(&to))?;
            audit.record(
                FilesystemEvent::new(EventType::Renamed, to.as_str())
                    .with_source(from)
                    .with_target(to.as_str()),
            );
            Ok(())
        })
    }

    /// Copy a file's content to `to`, creating or overwriting the destination
    pub async fn copy_file(&self, caller: &Caller, from: &str, to: &str) -> FsResult<()> {
        let to = caller.resolve(to)?;
        self.with_write("copy_file", caller, from, |tree, audit, from| {
            let (_, _, node) = self.existing(tree, audit, from)?;
            if node.is_dir() {
                return Err(FsError::invalid(from, InvalidKind::IsADirectory));
            }
            self.require(audit, node, from, AccessMask::READ)?;
            let data = node.content().map(<[u8]>::to_vec).unwrap_or_default();
            self.write_locked(tree, audit, &to, data, false)
        })
    }

    /// Change mode bits. Owner or root only; a non-root caller outside the
    /// node's group cannot set setgid, the bit is dropped.
    pub async fn chmod(&self, caller: &Caller, path: &str, mode: Mode) -> FsResult<()> {
        self.with_write("chmod", caller, path, |tree, audit, path| {
            let (_, id, node) = self.existing(tree, audit, path)?;
            if !may_chmod(node, audit.identity) {
                let reason = format!("{} is not the owner", audit.identity);
                return Err(audit.deny(path, reason));
            }
            let identity = audit.identity;
            let mut mode = mode;
            if mode.is_setgid() && !identity.is_root() && !identity.in_group(node.gid()) {
                mode = mode.without_bits(Mode::SETGID);
            }
            let previous = node.mode();
            if let Some(node) = tree.get_mut(id) {
                node.mode = mode;
                node.times.changed = Utc::now();
            }
            audit.record(
                FilesystemEvent::new(EventType::PermissionsChanged, path)
                    .with_message(format!("{} -> {}", previous, mode)),
            );
            Ok(())
        })
    }

    /// Change ownership. Root may change anything; the owner may only move the
    /// group to one they belong to.
    pub async fn chown(
        &self,
        caller: &Caller,
        path: &str,
        uid: Option<Uid>,
        gid: Option<Gid>,
    ) -> FsResult<()> {
        self.with_write("chown", caller, path, |tree, audit, path| {
            let (_, id, node) = self.existing(tree, audit, path)?;
            if !may_chown(node, audit.identity, uid, gid) {
                let reason = format!("{} may not change ownership", audit.identity);
                return Err(audit.deny(path, reason));
            }
            let (old_uid, old_gid) = (node.uid(), node.gid());
            let (new_uid, new_gid) = (uid.unwrap_or(old_uid), gid.unwrap_or(old_gid));
            if let Some(node) = tree.get_mut(id) {
                node.uid = new_uid;
                node.gid = new_gid;
                node.times.changed = Utc::now();
            }
            audit.record(
                FilesystemEvent::new(EventType::OwnershipChanged, path)
                    .with_message(format!("{}:{} -> {}:{}", old_uid, old_gid, new_uid, new_gid)),
            );
            Ok(())
        })
    }

    pub async fn stat(&self, caller: &Caller, path: &str) -> FsResult<NodeInfo> {
        self.with_read("stat", caller, path, |tree, audit, path| {
            let (_, id, _) = self.existing(tree, audit, path)?;
            tree.info(id).ok_or_else(|| FsError::NotFound(path.to_string()))
        })
    }

    // Program execution and SetUID/SetGID elevation

    /// Run `action` as the program at `path` would run: elevated through
    /// [`execute_as_owner`](Self::execute_as_owner) when setuid is set, through
    /// [`execute_as_group`](Self::execute_as_group) when only setgid is set, as
    /// the caller otherwise. Root callers always run as themselves.
    pub async fn execute<F, Fut, T>(&self, caller: &Caller, path: &str, action: F) -> FsResult<T>
    where
        F: FnOnce(Caller) -> Fut,
        Fut: Future<Output = FsResult<T>>,
    {
        let mode = self.with_read("execute", caller, path, |tree, audit, path| {
            let (_, _, node) = self.existing(tree, audit, path)?;
            if node.is_dir() {
                return Err(FsError::invalid(path, InvalidKind::IsADirectory));
            }
            self.require(audit, node, path, AccessMask::EXECUTE)?;
            Ok(node.mode())
        })?;

        if caller.identity().is_root() {
            return action(caller.clone()).await;
        }
        if mode.is_setuid() {
            self.execute_as_owner(caller, path, action).await
        } else if mode.is_setgid() {
            self.execute_as_group(caller, path, action).await
        } else {
            action(caller.clone()).await
        }
    }

    /// Run `action` as the owner of the setuid program at `path`
    pub async fn execute_as_owner<F, Fut, T>(
        &self,
        caller: &Caller,
        path: &str,
        action: F,
    ) -> FsResult<T>
    where
        F: FnOnce(Caller) -> Fut,
        Fut: Future<Output = FsResult<T>>,
    {
        let context = self.prepare_elevation(caller, path, ElevationKind::SetUid)?;
        self.run_elevated(context, action).await
    }

    /// Run `action` with the group of the setgid program at `path` as primary
    /// group; uid is unchanged
    pub async fn execute_as_group<F, Fut, T>(
        &self,
        caller: &Caller,
        path: &str,
        action: F,
    ) -> FsResult<T>
    where
        F: FnOnce(Caller) -> Fut,
        Fut: Future<Output = FsResult<T>>,
    {
        let context = self.prepare_elevation(caller, path, ElevationKind::SetGid)?;
        self.run_elevated(context, action).await
    }

    fn prepare_elevation(
        &self,
        caller: &Caller,
        path: &str,
        kind: ElevationKind,
    ) -> FsResult<ElevationContext> {
        let path = caller.resolve(path)?;
        let mut audit = Audit::new(caller.identity());
        let (result, slot) = {
            let tree = self.read_tree();
            let result = match self.elevation_target(&tree, &mut audit, &path, kind) {
                Ok(acting) => Ok(ElevationContext::new(kind, caller, acting, &path)),
                Err(err) => {
                    let reason = err.to_string();
                    self.elevations.deny(kind, caller.identity(), &path, &reason);
                    audit.record(
                        FilesystemEvent::new(EventType::ElevationDenied, path.as_str())
                            .with_message(reason),
                    );
                    Err(err)
                }
            };
            (result, self.reserve_slot(&audit))
        };
        self.dispatch(audit, slot);
        result
    }

    /// Check the elevation preconditions and resolve the identity to act as
    fn elevation_target(
        &self,
        tree: &NodeTree,
        audit: &mut Audit<'_>,
        path: &str,
        kind: ElevationKind,
    ) -> FsResult<Identity> {
        let identity = audit.identity;
        let (_, _, node) = self.existing(tree, audit, path)?;
        if node.is_dir() {
            return Err(FsError::invalid(path, InvalidKind::IsADirectory));
        }
        if identity.is_root() {
            return Err(FsError::denied(path, format!("{} is already root", identity)));
        }
        let (bit_set, root_owned) = match kind {
            ElevationKind::SetUid => (node.mode().is_setuid(), node.uid() == ROOT_UID),
            ElevationKind::SetGid => (node.mode().is_setgid(), node.gid() == ROOT_GID),
        };
        if !bit_set {
            return Err(FsError::denied(path, format!("{} bit not set", kind)));
        }
        self.require(audit, node, path, AccessMask::EXECUTE)?;
        if root_owned && !self.trusted_paths.contains(path) {
            return Err(FsError::denied(
                path,
                format!("root-owned {} program outside trusted paths", kind),
            ));
        }

        Ok(match kind {
            ElevationKind::SetUid => {
                self.identities.identity_for_uid(node.uid()).unwrap_or_else(|| {
                    Identity::new(node.uid(), format!("uid{}", node.uid()), node.gid())
                })
            }
            ElevationKind::SetGid => identity.with_primary_group(node.gid()),
        })
    }

    async fn run_elevated<F, Fut, T>(&self, context: ElevationContext, action: F) -> FsResult<T>
    where
        F: FnOnce(Caller) -> Fut,
        Fut: Future<Output = FsResult<T>>,
    {
        let elevated = context.caller();
        let event = FilesystemEvent::new(EventType::Elevated, context.target_path())
            .with_actor(context.original())
            .with_message(context.reason().to_string());
        let ticket = self.elevations.acquire(context);
        // Released on return, on error and when this future is dropped mid-flight
        let _release = scopeguard::guard(ticket, |ticket| self.elevations.release(ticket));
        self.events.publish(std::slice::from_ref(&event));
        action(elevated).await
    }

    /// Elevation attempts, oldest first
    pub fn elevation_records(&self) -> Vec<ElevationRecord> {
        self.elevations.records()
    }

    pub fn active_elevations(&self) -> Vec<ElevationContext> {
        self.elevations.active()
    }
}
