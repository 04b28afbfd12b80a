// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration types for permfs

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::elevation::DEFAULT_TRUSTED_PATHS;
use crate::types::Mode;

/// Errors raised while loading or validating a configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("unsupported configuration format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Security knobs fixed at construction time
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    /// Apply the sticky-directory rule on delete and rename
    pub enforce_sticky_bit: bool,
    /// Directories from which root-owned setuid/setgid programs may elevate
    pub trusted_paths: Vec<String>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            enforce_sticky_bit: true,
            trusted_paths: DEFAULT_TRUSTED_PATHS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Mode and umask applied to newly created nodes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreationDefaults {
    #[serde(with = "octal")]
    pub file_mode: u32,
    #[serde(with = "octal")]
    pub dir_mode: u32,
    #[serde(with = "octal")]
    pub umask: u32,
}

impl Default for CreationDefaults {
    fn default() -> Self {
        Self {
            file_mode: 0o644,
            dir_mode: 0o755,
            umask: 0o022,
        }
    }
}

impl CreationDefaults {
    pub fn file_mode(&self) -> Mode {
        Mode::new(self.file_mode).with_umask(self.umask)
    }

    pub fn dir_mode(&self) -> Mode {
        Mode::new(self.dir_mode).with_umask(self.umask)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    pub security: SecurityPolicy,
    pub defaults: CreationDefaults,
    pub track_events: bool,
    /// Number of elevation attempts kept in memory; 0 keeps none
    pub elevation_log_capacity: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            security: SecurityPolicy::default(),
            defaults: CreationDefaults::default(),
            track_events: true,
            elevation_log_capacity: 256,
        }
    }
}

impl FsConfig {
    /// Load from a `.json` or `.toml` file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content)?,
            Some("toml") => Self::from_toml_str(&content)?,
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };
        tracing::debug!(path = %path.display(), "loaded filesystem configuration");
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: FsConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FsConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, bits) in [
            ("file_mode", self.defaults.file_mode),
            ("dir_mode", self.defaults.dir_mode),
        ] {
            if bits > Mode::ALL {
                return Err(ConfigError::Invalid(format!("{} {:o} exceeds 7777", name, bits)));
            }
        }
        if self.defaults.umask > 0o777 {
            return Err(ConfigError::Invalid(format!(
                "umask {:o} exceeds 777",
                self.defaults.umask
            )));
        }
        for path in &self.security.trusted_paths {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "trusted path {:?} is not absolute",
                    path
                )));
            }
        }
        Ok(())
    }
}

/// Modes are written as octal strings (`"0644"`); plain integers are accepted on input
mod octal {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bits: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:04o}", bits))
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u32),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Number(bits) => Ok(bits),
            Raw::Text(text) => {
                let digits = text.trim();
                let digits = digits.strip_prefix("0o").unwrap_or(digits);
                u32::from_str_radix(digits, 8)
                    .map_err(|_| de::Error::custom(format!("invalid octal mode {:?}", text)))
            }
        }
    }
}
