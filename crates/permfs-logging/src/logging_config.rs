// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{init, init_to_file, LogFormat, LogLevel};

/// Logging section of a configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging verbosity level
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,

    #[serde(rename = "log-format", skip_serializing_if = "Option::is_none")]
    pub format: Option<LogFormat>,

    /// Log to this file instead of stdout
    #[serde(rename = "log-file", skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    /// Install the global subscriber described by this section
    pub fn init(&self, component: &str) -> anyhow::Result<()> {
        let level = self.level.unwrap_or_default().into();
        let format = self.format.unwrap_or_default();
        match &self.file {
            Some(path) => init_to_file(component, level, format, path),
            None => init(component, level, format),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.level.is_none() && self.format.is_none() && self.file.is_none()
    }
}
