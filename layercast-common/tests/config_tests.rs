//! Integration tests for bootstrap configuration loading
//!
//! Environment-variable tests are serialized because the process
//! environment is shared between test threads.

use layercast_common::config::{
    load_or_default, load_toml_config, resolve_root_folder, write_toml_config, TomlConfig,
    ROOT_FOLDER_ENV,
};
use layercast_common::Error;
use serial_test::serial;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[test]
fn test_write_then_load_preserves_values() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("layercast.toml");

    let mut config = TomlConfig {
        root_folder: Some(PathBuf::from("/srv/layercast")),
        ..Default::default()
    };
    config.generation.batch_size = 25;
    config.generation.concurrency = 2;
    config.storage.base_uri = "https://cdn.example.com/art".to_string();

    write_toml_config(&config, &path).unwrap();
    assert!(path.exists());
    assert!(!path.with_extension("toml.tmp").exists());

    let loaded = load_toml_config(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_load_rejects_malformed_toml() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bad.toml");
    std::fs::write(&path, "[generation\nbatch_size = ").unwrap();

    match load_toml_config(&path) {
        Err(Error::Config(msg)) => assert!(msg.contains("Parse TOML failed")),
        other => panic!("expected config error, got {:?}", other),
    }
}

#[test]
fn test_load_rejects_zero_canvas() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("zero.toml");
    std::fs::write(&path, "[generation]\ncanvas_size = 0\n").unwrap();

    assert!(matches!(load_toml_config(&path), Err(Error::Config(_))));
}

#[test]
fn test_explicit_missing_path_is_error() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("absent.toml");
    assert!(load_or_default(Some(&missing)).is_err());
}

#[test]
#[serial]
fn test_env_var_beats_toml() {
    let config = TomlConfig {
        root_folder: Some(PathBuf::from("/from/toml")),
        ..Default::default()
    };

    std::env::set_var(ROOT_FOLDER_ENV, "/from/env");
    let resolved = resolve_root_folder(None, &config);
    std::env::remove_var(ROOT_FOLDER_ENV);

    assert_eq!(resolved, PathBuf::from("/from/env"));
}

#[test]
#[serial]
fn test_toml_used_without_env() {
    std::env::remove_var(ROOT_FOLDER_ENV);
    let config = TomlConfig {
        root_folder: Some(PathBuf::from("/from/toml")),
        ..Default::default()
    };
    assert_eq!(resolve_root_folder(None, &config), PathBuf::from("/from/toml"));
}

#[test]
#[serial]
fn test_default_root_folder_fallback() {
    std::env::remove_var(ROOT_FOLDER_ENV);
    let resolved = resolve_root_folder(None, &TomlConfig::default());
    assert!(resolved.ends_with(Path::new("layercast")) || resolved.ends_with("layercast_data"));
}
