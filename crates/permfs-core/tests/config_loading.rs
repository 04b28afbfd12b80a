// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Integration tests for loading configuration files into a filesystem

use permfs_core::testing::{unix_fs, RecordingSink, GROUP, PASSWD};
use permfs_core::{Caller, ConfigError, FsConfig, Mode, UserDatabase};
use std::sync::Arc;
use tempfile::TempDir;

fn alice() -> Caller {
    let users = UserDatabase::from_etc(PASSWD, GROUP).unwrap();
    Caller::new(users.identity_for_name("alice").unwrap()).in_dir("/home/alice")
}

#[test]
fn test_load_json_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("permfs.json");
    std::fs::write(
        &path,
        r#"{
  "security": { "enforce_sticky_bit": false },
  "defaults": { "umask": "077" },
  "elevation_log_capacity": 4
}"#,
    )
    .unwrap();

    let config = FsConfig::load(&path).unwrap();
    assert!(!config.security.enforce_sticky_bit);
    assert_eq!(config.defaults.file_mode(), Mode::new(0o600));
    assert_eq!(config.elevation_log_capacity, 4);
    assert!(config.track_events);
}

#[test]
fn test_load_toml_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("permfs.toml");
    std::fs::write(
        &path,
        r#"
track_events = false

[security]
trusted_paths = ["/usr/bin", "/opt/tools/bin"]

[defaults]
dir_mode = "0750"
umask = "0"
"#,
    )
    .unwrap();

    let config = FsConfig::load(&path).unwrap();
    assert!(!config.track_events);
    assert_eq!(config.defaults.dir_mode(), Mode::new(0o750));
    assert_eq!(config.security.trusted_paths.len(), 2);
}

#[test]
fn test_load_errors() {
    let temp_dir = TempDir::new().unwrap();

    let yaml = temp_dir.path().join("permfs.yaml");
    std::fs::write(&yaml, "track_events: false\n").unwrap();
    assert!(matches!(FsConfig::load(&yaml), Err(ConfigError::UnsupportedFormat(_))));

    let missing = temp_dir.path().join("absent.toml");
    assert!(matches!(FsConfig::load(&missing), Err(ConfigError::Io(_))));

    let broken = temp_dir.path().join("broken.json");
    std::fs::write(&broken, "{ not json").unwrap();
    assert!(matches!(FsConfig::load(&broken), Err(ConfigError::Json(_))));
}

#[tokio::test]
async fn test_loaded_config_drives_filesystem() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("permfs.toml");
    std::fs::write(
        &path,
        r#"
track_events = false

[defaults]
file_mode = "0666"
umask = "0027"

[security]
trusted_paths = ["/opt/game"]
"#,
    )
    .unwrap();
    let config = FsConfig::load(&path).unwrap();
    let vfs = unix_fs(config).unwrap();
    let sink = Arc::new(RecordingSink::default());
    vfs.subscribe(sink.clone());

    vfs.write_file(&alice(), "fresh.txt", b"").await.unwrap();
    assert_eq!(vfs.get_file("/home/alice/fresh.txt").unwrap().mode, Mode::new(0o640));
    assert!(sink.events().is_empty());

    // /usr/bin is no longer trusted for root-owned programs
    let err = vfs
        .execute_as_owner(&alice(), "/usr/bin/sudo", |_| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
}

#[test]
fn test_relative_trusted_path_is_rejected_on_load() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("permfs.json");
    std::fs::write(&path, r#"{ "security": { "trusted_paths": ["usr/bin"] } }"#).unwrap();
    assert!(matches!(FsConfig::load(&path), Err(ConfigError::Invalid(_))));
}
