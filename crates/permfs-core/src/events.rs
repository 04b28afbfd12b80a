// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Filesystem change and audit notifications.
//!
//! Dispatch is synchronous and in subscription order: `emit` returns only after
//! every sink has seen the event. Nothing is buffered or replayed, so a sink
//! subscribed after a mutation never hears about it.
//!
//! Concurrent producers keep their relative order through delivery slots: a
//! slot is reserved while the producer still holds whatever lock orders its
//! work, and [`EventBus::deliver`] waits until every earlier slot has been
//! delivered before handing its batch to the sinks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};

use crate::error::{FsError, FsResult};
use crate::identity::{Identity, Uid};

/// Event kinds for filesystem change notifications
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Created,
    Written,
    Deleted,
    Renamed,
    PermissionsChanged,
    OwnershipChanged,
    PermissionDenied,
    Elevated,
    ElevationDenied,
}

/// A single notification
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FilesystemEvent {
    pub event_type: EventType,
    pub path: String,
    pub source_path: Option<String>,
    pub target_path: Option<String>,
    pub message: Option<String>,
    /// Identity the operation ran as
    pub actor: Option<Uid>,
    pub timestamp: DateTime<Utc>,
}

impl FilesystemEvent {
    pub fn new(event_type: EventType, path: impl Into<String>) -> Self {
        Self {
            event_type,
            path: path.into(),
            source_path: None,
            target_path: None,
            message: None,
            actor: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_actor(mut self, identity: &Identity) -> Self {
        self.actor = Some(identity.uid);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source_path = Some(source.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target_path = Some(target.into());
        self
    }
}

/// Event sink trait for receiving filesystem change notifications
///
/// `on_event` runs while its batch holds the delivery turn. It may use the
/// read-only accessors, but must not wait on another mutation to finish.
pub trait EventSink: Send + Sync {
    fn on_event(&self, evt: &FilesystemEvent);
}

impl<F> EventSink for F
where
    F: Fn(&FilesystemEvent) + Send + Sync,
{
    fn on_event(&self, evt: &FilesystemEvent) {
        self(evt)
    }
}

/// Opaque event subscription identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Place of one batch of events in the delivery order
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a reserved slot blocks later slots until it is delivered"]
pub struct DeliverySlot(u64);

/// Multicast subscription point owned by one filesystem instance
pub struct EventBus {
    enabled: bool,
    next_id: AtomicU64,
    subscribers: RwLock<BTreeMap<SubscriptionId, Arc<dyn EventSink>>>,
    next_slot: AtomicU64,
    /// Next slot allowed to deliver
    delivered: Mutex<u64>,
    turn: Condvar,
}

impl EventBus {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(BTreeMap::new()),
            next_slot: AtomicU64::new(0),
            delivered: Mutex::new(0),
            turn: Condvar::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn subscribe(&self, sink: Arc<dyn EventSink>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, sink);
        id
    }

    pub fn subscribe_fn<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&FilesystemEvent) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(f))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> FsResult<()> {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match removed {
            Some(_) => Ok(()),
            None => Err(FsError::NotFound(format!("subscription {}", id.0))),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Deliver `event` to every subscriber before returning.
    ///
    /// The subscriber list is snapshotted first so sinks may subscribe or
    /// unsubscribe from inside `on_event`.
    pub fn emit(&self, event: &FilesystemEvent) {
        if !self.enabled {
            return;
        }
        let sinks: Vec<Arc<dyn EventSink>> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for sink in sinks {
            sink.on_event(event);
        }
    }

    /// Take the next place in the delivery order. Every reserved slot must be
    /// passed to [`deliver`](Self::deliver), or later slots wait forever.
    pub fn reserve(&self) -> DeliverySlot {
        DeliverySlot(self.next_slot.fetch_add(1, Ordering::SeqCst))
    }

    /// Emit `events` once every earlier slot has been delivered.
    ///
    /// The turn passes on even if a sink panics.
    pub fn deliver(&self, slot: DeliverySlot, events: &[FilesystemEvent]) {
        let mut next = self.delivered.lock().unwrap_or_else(PoisonError::into_inner);
        while *next != slot.0 {
            next = self.turn.wait(next).unwrap_or_else(PoisonError::into_inner);
        }
        drop(next);

        let _advance = scopeguard::guard(slot, |slot| {
            *self.delivered.lock().unwrap_or_else(PoisonError::into_inner) = slot.0 + 1;
            self.turn.notify_all();
        });
        for event in events {
            self.emit(event);
        }
    }

    /// Reserve and deliver in one step, for events not tied to a tree mutation
    pub fn publish(&self, events: &[FilesystemEvent]) {
        if self.enabled && !events.is_empty() {
            self.deliver(self.reserve(), events);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(true)
    }
}
