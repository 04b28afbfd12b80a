// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory virtual filesystem with Unix ownership semantics.
//!
//! This crate provides:
//! - A node tree of files and directories carrying uid, gid and mode bits
//! - Strict owner/group/other permission evaluation with root bypass
//! - SetUID/SetGID elevation scoped to a single action, with an audit log
//! - An async facade that checks every operation for an explicit caller
//! - Synchronous event fan-out for mutations and denials

pub mod config;
pub mod elevation;
pub mod error;
pub mod events;
pub mod identity;
pub mod path;
pub mod permissions;
pub mod testing;
pub mod tree;
pub mod types;
pub mod vfs;

pub use config::{ConfigError, CreationDefaults, FsConfig, SecurityPolicy};
pub use elevation::{
    ElevationContext, ElevationKind, ElevationOutcome, ElevationRecord, TrustedPaths,
};
pub use error::{FsError, FsResult, InvalidKind};
pub use events::{EventSink, EventType, FilesystemEvent, SubscriptionId};
pub use identity::{Caller, Gid, Identity, IdentityResolver, Uid, UserDatabase};
pub use permissions::{check_access, select_tier, AccessTier};
pub use tree::{NodeId, NodeTree};
pub use types::{AccessMask, DirEntry, FileTimes, Mode, NodeInfo, NodeType};
pub use vfs::VirtualFileSystem;
