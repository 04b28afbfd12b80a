// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::{Mutex, PoisonError};

use crate::events::{EventSink, EventType, FilesystemEvent};

/// Event sink that keeps every event it receives, in delivery order
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<FilesystemEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<FilesystemEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn types(&self) -> Vec<EventType> {
        self.events().iter().map(|e| e.event_type).collect()
    }

    /// Events of one kind, in delivery order
    pub fn of_type(&self, event_type: EventType) -> Vec<FilesystemEvent> {
        self.events().into_iter().filter(|e| e.event_type == event_type).collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl EventSink for RecordingSink {
    fn on_event(&self, evt: &FilesystemEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(evt.clone());
    }
}
