// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Test utilities for permfs core
//!
//! A recording event sink and a small seeded Unix layout, shared by the unit
//! tests and the integration tests under `tests/`.

pub mod fixtures;
pub mod recording_sink;

pub use fixtures::{etc_database, unix_fs, unix_layout, GROUP, PASSWD};
pub use recording_sink::RecordingSink;
