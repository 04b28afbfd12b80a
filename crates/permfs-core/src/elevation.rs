// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! SetUID/SetGID elevation bookkeeping.
//!
//! An elevation is a value: the acting identity is handed to the elevated
//! action and never written into shared state, so the invoker's own identity
//! cannot be altered by it. What this module tracks is the audit side: which
//! elevations are currently active and the history of granted and refused
//! ones. The facade acquires an [`ElevationTicket`] before running the action
//! and releases it from a drop guard, which covers normal return, errors and
//! the action's future being dropped mid-flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::FsResult;
use crate::identity::{Caller, Gid, Identity, Uid};
use crate::path;

/// Default directories from which root-owned setuid/setgid programs may elevate
pub const DEFAULT_TRUSTED_PATHS: &[&str] =
    &["/bin", "/sbin", "/usr/bin", "/usr/sbin", "/usr/local/bin"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElevationKind {
    SetUid,
    SetGid,
}

impl fmt::Display for ElevationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElevationKind::SetUid => f.write_str("setuid"),
            ElevationKind::SetGid => f.write_str("setgid"),
        }
    }
}

/// Fixed allowlist of system directories, matched component-wise
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustedPaths(Vec<String>);

impl TrustedPaths {
    pub fn new<I, S>(paths: I) -> FsResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let paths = paths
            .into_iter()
            .map(|p| path::normalize(p.as_ref(), "/"))
            .collect::<FsResult<Vec<_>>>()?;
        Ok(Self(paths))
    }

    pub fn contains(&self, target: &str) -> bool {
        self.0.iter().any(|base| path::is_within(target, base))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl Default for TrustedPaths {
    fn default() -> Self {
        Self(DEFAULT_TRUSTED_PATHS.iter().map(|p| p.to_string()).collect())
    }
}

/// A granted, scoped identity substitution
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElevationContext {
    kind: ElevationKind,
    original: Identity,
    acting: Identity,
    target_path: String,
    reason: String,
    cwd: String,
    acquired_at: DateTime<Utc>,
}

impl ElevationContext {
    pub(crate) fn new(
        kind: ElevationKind,
        caller: &Caller,
        acting: Identity,
        target_path: &str,
    ) -> Self {
        Self {
            kind,
            original: caller.identity().clone(),
            reason: format!("{} execution of {}", kind, target_path),
            acting,
            target_path: target_path.to_string(),
            cwd: caller.cwd().to_string(),
            acquired_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> ElevationKind {
        self.kind
    }

    pub fn original(&self) -> &Identity {
        &self.original
    }

    pub fn acting(&self) -> &Identity {
        &self.acting
    }

    pub fn target_path(&self) -> &str {
        &self.target_path
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// The caller the elevated action runs as, keeping the invoker's working directory
    pub fn caller(&self) -> Caller {
        Caller::new(self.acting.clone()).in_dir(self.cwd.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ElevationOutcome {
    Granted,
    Denied { reason: String },
}

/// One audit entry, written for every elevation attempt
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ElevationRecord {
    pub kind: ElevationKind,
    pub original_uid: Uid,
    pub original_user: String,
    pub elevated_uid: Option<Uid>,
    pub elevated_gid: Option<Gid>,
    pub target_path: String,
    pub outcome: ElevationOutcome,
    pub timestamp: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    ticket: Option<u64>,
}

/// Handle for an active elevation
#[derive(Debug, PartialEq, Eq)]
pub struct ElevationTicket(u64);

#[derive(Default)]
struct LogState {
    next_ticket: u64,
    active: BTreeMap<u64, ElevationContext>,
    history: VecDeque<ElevationRecord>,
}

/// Active elevations plus a bounded history of attempts
pub struct ElevationLog {
    capacity: usize,
    state: Mutex<LogState>,
}

impl ElevationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(LogState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, state: &mut LogState, record: ElevationRecord) {
        if self.capacity == 0 {
            return;
        }
        while state.history.len() >= self.capacity {
            state.history.pop_front();
        }
        state.history.push_back(record);
    }

    pub(crate) fn acquire(&self, context: ElevationContext) -> ElevationTicket {
        tracing::info!(
            kind = %context.kind,
            original = %context.original,
            elevated = %context.acting,
            elevated_gid = context.acting.primary_gid,
            path = %context.target_path,
            at = %context.acquired_at,
            "elevation granted"
        );
        let mut state = self.state();
        state.next_ticket += 1;
        let ticket = state.next_ticket;
        let record = ElevationRecord {
            kind: context.kind,
            original_uid: context.original.uid,
            original_user: context.original.username.clone(),
            elevated_uid: Some(context.acting.uid),
            elevated_gid: Some(context.acting.primary_gid),
            target_path: context.target_path.clone(),
            outcome: ElevationOutcome::Granted,
            timestamp: context.acquired_at,
            released_at: None,
            ticket: Some(ticket),
        };
        self.push(&mut state, record);
        state.active.insert(ticket, context);
        ElevationTicket(ticket)
    }

    pub(crate) fn release(&self, ticket: ElevationTicket) {
        let now = Utc::now();
        let mut state = self.state();
        let Some(context) = state.active.remove(&ticket.0) else {
            return;
        };
        if let Some(record) = state.history.iter_mut().rev().find(|r| r.ticket == Some(ticket.0)) {
            record.released_at = Some(now);
        }
        drop(state);
        tracing::info!(
            kind = %context.kind,
            original = %context.original,
            elevated = %context.acting,
            path = %context.target_path,
            held_ms = (now - context.acquired_at).num_milliseconds(),
            "elevation released"
        );
    }

    pub(crate) fn deny(
        &self,
        kind: ElevationKind,
        original: &Identity,
        target_path: &str,
        reason: &str,
    ) {
        tracing::warn!(
            kind = %kind,
            original = %original,
            path = %target_path,
            reason,
            "elevation denied"
        );
        let record = ElevationRecord {
            kind,
            original_uid: original.uid,
            original_user: original.username.clone(),
            elevated_uid: None,
            elevated_gid: None,
            target_path: target_path.to_string(),
            outcome: ElevationOutcome::Denied {
                reason: reason.to_string(),
            },
            timestamp: Utc::now(),
            released_at: None,
            ticket: None,
        };
        let mut state = self.state();
        self.push(&mut state, record);
    }

    /// Elevations currently in effect
    pub fn active(&self) -> Vec<ElevationContext> {
        self.state().active.values().cloned().collect()
    }

    /// Recorded attempts, oldest first
    pub fn records(&self) -> Vec<ElevationRecord> {
        self.state().history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trusted_paths_match_by_component() {
        let trusted = TrustedPaths::default();
        assert!(trusted.contains("/usr/bin/sudo"));
        assert!(trusted.contains("/bin/su"));
        assert!(!trusted.contains("/usr/binx/sudo"));
        assert!(!trusted.contains("/home/mallory/fake-sudo"));

        let custom = TrustedPaths::new(["/opt//tools/", "/srv/bin"]).unwrap();
        assert!(custom.contains("/opt/tools/run"));
        assert_eq!(custom.iter().collect::<Vec<_>>(), vec!["/opt/tools", "/srv/bin"]);
        assert!(TrustedPaths::new([""]).is_err());
    }

    #[test]
    fn test_acquire_and_release_track_active_set() {
        let log = ElevationLog::new(8);
        let alice = Caller::new(Identity::new(1000, "alice", 1000)).in_dir("/home/alice");
        let ctx =
            ElevationContext::new(ElevationKind::SetUid, &alice, Identity::root(), "/usr/bin/sudo");
        assert_eq!(ctx.caller().cwd(), "/home/alice");
        assert!(ctx.caller().identity().is_root());
        assert_eq!(ctx.reason(), "setuid execution of /usr/bin/sudo");

        let ticket = log.acquire(ctx);
        assert_eq!(log.active().len(), 1);
        assert!(log.records()[0].released_at.is_none());

        log.release(ticket);
        assert!(log.active().is_empty());
        let records = log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, ElevationOutcome::Granted);
        assert_eq!(records[0].elevated_uid, Some(0));
        assert!(records[0].released_at.is_some());
    }

    #[test]
    fn test_history_is_bounded() {
        let log = ElevationLog::new(2);
        let bob = Identity::new(1001, "bob", 1001);
        for i in 0..5 {
            log.deny(ElevationKind::SetGid, &bob, &format!("/bin/tool{}", i), "setgid bit not set");
        }
        let records = log.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].target_path, "/bin/tool3");
        assert_eq!(records[1].target_path, "/bin/tool4");
        assert!(matches!(records[1].outcome, ElevationOutcome::Denied { .. }));
    }
}
