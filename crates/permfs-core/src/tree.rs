// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory node tree.
//!
//! Nodes live in a flat map keyed by [`NodeId`]; directories hold a sorted
//! name -> id map and every non-root node records its single parent. The tree
//! performs no permission checks: that is the facade's job. Bootstrap code uses
//! the `seed_*` methods to lay out a pre-populated tree before handing it over.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};

use crate::error::{FsError, FsResult, InvalidKind};
use crate::identity::{Gid, Uid, ROOT_GID, ROOT_UID};
use crate::path;
use crate::types::{FileTimes, Mode, NodeInfo, NodeType};

/// Internal node ID for filesystem nodes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

/// Filesystem node types
#[derive(Clone, Debug)]
pub enum NodeKind {
    File { content: Vec<u8> },
    Directory { children: BTreeMap<String, NodeId> },
}

impl NodeKind {
    pub fn empty_file() -> Self {
        NodeKind::File {
            content: Vec::new(),
        }
    }

    pub fn empty_directory() -> Self {
        NodeKind::Directory {
            children: BTreeMap::new(),
        }
    }
}

/// Filesystem node
#[derive(Clone, Debug)]
pub struct Node {
    id: NodeId,
    parent: Option<NodeId>,
    name: String,
    pub(crate) kind: NodeKind,
    pub(crate) uid: Uid,
    pub(crate) gid: Gid,
    pub(crate) mode: Mode,
    pub(crate) times: FileTimes,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn times(&self) -> FileTimes {
        self.times
    }

    /// Content length for files, zero for directories
    pub fn len(&self) -> u64 {
        match &self.kind {
            NodeKind::File { content } => content.len() as u64,
            NodeKind::Directory { .. } => 0,
        }
    }

    pub fn content(&self) -> Option<&[u8]> {
        match &self.kind {
            NodeKind::File { content } => Some(content),
            NodeKind::Directory { .. } => None,
        }
    }

    pub fn children(&self) -> Option<&BTreeMap<String, NodeId>> {
        match &self.kind {
            NodeKind::Directory { children } => Some(children),
            NodeKind::File { .. } => None,
        }
    }

    fn touch_modified(&mut self) {
        let now = Utc::now();
        self.times.modified = now;
        self.times.changed = now;
    }
}

/// The node store
#[derive(Clone, Debug)]
pub struct NodeTree {
    nodes: HashMap<NodeId, Node>,
    root: NodeId,
    next_id: u64,
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new(ROOT_UID, ROOT_GID, Mode::new(0o755))
    }
}

impl NodeTree {
    /// Tree holding only a root directory with the given ownership
    pub fn new(uid: Uid, gid: Gid, mode: Mode) -> Self {
        let root = NodeId(1);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node {
                id: root,
                parent: None,
                name: String::new(),
                kind: NodeKind::empty_directory(),
                uid,
                gid,
                mode,
                times: FileTimes::now(),
            },
        );
        Self {
            nodes,
            root,
            next_id: 2,
        }
    }

    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn child(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        self.get(dir)?.children()?.get(name).copied()
    }

    /// Look up a normalized absolute path without any permission checks
    pub fn lookup(&self, path: &str) -> Option<NodeId> {
        let mut current = self.root;
        for component in path::components(path) {
            current = self.child(current, component)?;
        }
        Some(current)
    }

    /// Absolute path of a node, reconstructed through parent links
    pub fn path_of(&self, id: NodeId) -> Option<String> {
        let mut names = Vec::new();
        let mut current = self.get(id)?;
        while let Some(parent) = current.parent {
            names.push(current.name.as_str());
            current = self.get(parent)?;
        }
        if names.is_empty() {
            return Some("/".to_string());
        }
        let mut result = String::new();
        for name in names.iter().rev() {
            result.push('/');
            result.push_str(name);
        }
        Some(result)
    }

    /// Whether `ancestor` is `id` itself or lies on its parent chain
    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(node_id) = current {
            if node_id == ancestor {
                return true;
            }
            current = self.get(node_id).and_then(|n| n.parent);
        }
        false
    }

    /// `id` and all its descendants, children before their parents
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_post_order(id, &mut out);
        out
    }

    fn collect_post_order(&self, id: NodeId, out: &mut Vec<NodeId>) {
        if let Some(children) = self.get(id).and_then(Node::children) {
            for child in children.values() {
                self.collect_post_order(*child, out);
            }
        }
        out.push(id);
    }

    pub fn info(&self, id: NodeId) -> Option<NodeInfo> {
        let node = self.get(id)?;
        Some(NodeInfo {
            path: self.path_of(id)?,
            node_type: if node.is_dir() {
                NodeType::Directory
            } else {
                NodeType::File
            },
            len: node.len(),
            uid: node.uid,
            gid: node.gid,
            mode: node.mode,
            times: node.times,
            entries: node.children().map(BTreeMap::len),
        })
    }

    /// Create a node under `parent`
    pub(crate) fn insert(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
        uid: Uid,
        gid: Gid,
        mode: Mode,
    ) -> FsResult<NodeId> {
        validate_name(name)?;
        let id = NodeId(self.next_id);
        self.link(parent, name, id)?;
        self.next_id += 1;
        self.nodes.insert(
            id,
            Node {
                id,
                parent: Some(parent),
                name: name.to_string(),
                kind,
                uid,
                gid,
                mode,
                times: FileTimes::now(),
            },
        );
        Ok(id)
    }

    fn link(&mut self, parent: NodeId, name: &str, id: NodeId) -> FsResult<()> {
        let parent_path = self.path_of(parent).unwrap_or_default();
        let parent_node = self
            .nodes
            .get_mut(&parent)
            .ok_or_else(|| FsError::NotFound(parent_path.clone()))?;
        match &mut parent_node.kind {
            NodeKind::Directory { children } => {
                if children.contains_key(name) {
                    return Err(FsError::AlreadyExists(path::join(&parent_path, name)));
                }
                children.insert(name.to_string(), id);
            }
            NodeKind::File { .. } => {
                return Err(FsError::invalid(parent_path, InvalidKind::NotADirectory));
            }
        }
        parent_node.touch_modified();
        Ok(())
    }

    /// Unlink `id` from its parent directory, leaving the node itself in the store
    fn unlink(&mut self, id: NodeId) -> FsResult<()> {
        let (parent, name) = {
            let node = self.get(id).ok_or_else(|| FsError::NotFound(format!("node {}", id.0)))?;
            let parent = node
                .parent
                .ok_or_else(|| FsError::invalid("/", InvalidKind::RootDirectory))?;
            (parent, node.name.clone())
        };
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            if let NodeKind::Directory { children } = &mut parent_node.kind {
                children.remove(&name);
            }
            parent_node.touch_modified();
        }
        Ok(())
    }

    /// Move `id` under `new_parent` as `new_name`. Refuses to create a cycle.
    pub(crate) fn relocate(
        &mut self,
        id: NodeId,
        new_parent: NodeId,
        new_name: &str,
    ) -> FsResult<()> {
        validate_name(new_name)?;
        if self.is_ancestor(id, new_parent) {
            let path = self.path_of(id).unwrap_or_default();
            return Err(FsError::invalid(path, InvalidKind::MoveIntoSelf));
        }
        self.unlink(id)?;
        if let Err(err) = self.link(new_parent, new_name, id) {
            // Put the node back where it was
            let origin = self
                .get(id)
                .and_then(|n| n.parent.map(|p| (p, n.name.clone())));
            if let Some((parent, name)) = origin {
                if let Err(rollback) = self.link(parent, &name, id) {
                    tracing::error!(
                        node = id.0,
                        name = %name,
                        error = %rollback,
                        "failed to restore node after an aborted move"
                    );
                }
            }
            return Err(err);
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = Some(new_parent);
            node.name = new_name.to_string();
            node.times.changed = Utc::now();
        }
        Ok(())
    }

    /// Detach `id` from its parent and drop it with all descendants. Returns the
    /// number of nodes removed.
    pub(crate) fn remove_subtree(&mut self, id: NodeId) -> FsResult<usize> {
        let doomed = self.subtree(id);
        self.unlink(id)?;
        for node_id in &doomed {
            self.nodes.remove(node_id);
        }
        Ok(doomed.len())
    }

    pub(crate) fn set_content(&mut self, id: NodeId, data: Vec<u8>) {
        if let Some(node) = self.nodes.get_mut(&id) {
            if let NodeKind::File { content } = &mut node.kind {
                *content = data;
                node.touch_modified();
            }
        }
    }

    pub(crate) fn append_content(&mut self, id: NodeId, data: &[u8]) {
        if let Some(node) = self.nodes.get_mut(&id) {
            if let NodeKind::File { content } = &mut node.kind {
                content.extend_from_slice(data);
                node.touch_modified();
            }
        }
    }

    /// Create (or take over) a directory at `path`, creating missing parents as `root:root 0755`
    pub fn seed_directory(
        &mut self,
        path: &str,
        uid: Uid,
        gid: Gid,
        mode: u32,
    ) -> FsResult<NodeId> {
        let path = path::normalize(path, "/")?;
        self.seed_parents_and(&path, NodeKind::empty_directory(), uid, gid, Mode::new(mode))
    }

    /// Create or overwrite a file at `path`, creating missing parents as `root:root 0755`
    pub fn seed_file(
        &mut self,
        path: &str,
        content: impl Into<Vec<u8>>,
        uid: Uid,
        gid: Gid,
        mode: u32,
    ) -> FsResult<NodeId> {
        let path = path::normalize(path, "/")?;
        let kind = NodeKind::File {
            content: content.into(),
        };
        self.seed_parents_and(&path, kind, uid, gid, Mode::new(mode))
    }

    fn seed_parents_and(
        &mut self,
        path: &str,
        kind: NodeKind,
        uid: Uid,
        gid: Gid,
        mode: Mode,
    ) -> FsResult<NodeId> {
        let Some(parent_path) = path::parent(path) else {
            let root = self.root;
            if let Some(node) = self.nodes.get_mut(&root) {
                node.uid = uid;
                node.gid = gid;
                node.mode = mode;
            }
            return Ok(root);
        };

        let mut parent = self.root;
        for component in path::components(parent_path) {
            parent = match self.child(parent, component) {
                Some(existing) => existing,
                None => self.insert(
                    parent,
                    component,
                    NodeKind::empty_directory(),
                    ROOT_UID,
                    ROOT_GID,
                    Mode::new(0o755),
                )?,
            };
        }

        let name = path::file_name(path);
        match self.child(parent, name) {
            Some(existing) => {
                let node = self
                    .nodes
                    .get_mut(&existing)
                    .ok_or_else(|| FsError::NotFound(path.to_string()))?;
                if node.is_dir() != matches!(kind, NodeKind::Directory { .. }) {
                    return Err(FsError::AlreadyExists(path.to_string()));
                }
                if let NodeKind::File { .. } = kind {
                    node.kind = kind;
                }
                node.uid = uid;
                node.gid = gid;
                node.mode = mode;
                Ok(existing)
            }
            None => self.insert(parent, name, kind, uid, gid, mode),
        }
    }

    /// Content of the file at `path`, bypassing permission checks (bootstrap use)
    pub fn file_content(&self, path: &str) -> Option<&[u8]> {
        let path = path::normalize(path, "/").ok()?;
        self.get(self.lookup(&path)?)?.content()
    }
}

fn validate_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(FsError::InvalidPath(format!("invalid file name {:?}", name)));
    }
    Ok(())
}
