//! Bootstrap configuration and root folder resolution
//!
//! Tests that touch MINTEL_ROOT_FOLDER are marked #[serial] so they never run
//! concurrently with each other.

use mintel_common::config::{
    load_toml_config, RootFolderInitializer, RootFolderResolver, TomlConfig, ROOT_FOLDER_ENV,
};
use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[test]
#[serial]
fn test_cli_argument_wins() {
    env::set_var(ROOT_FOLDER_ENV, "/tmp/mintel-from-env");
    let toml = TomlConfig {
        root_folder: Some(PathBuf::from("/tmp/mintel-from-toml")),
        ..TomlConfig::default()
    };

    let resolved = RootFolderResolver::default().resolve(Some(Path::new("/tmp/mintel-cli")), &toml);
    assert_eq!(resolved, PathBuf::from("/tmp/mintel-cli"));

    env::remove_var(ROOT_FOLDER_ENV);
}

#[test]
#[serial]
fn test_env_beats_toml() {
    env::set_var(ROOT_FOLDER_ENV, "/tmp/mintel-from-env");
    let toml = TomlConfig {
        root_folder: Some(PathBuf::from("/tmp/mintel-from-toml")),
        ..TomlConfig::default()
    };

    let resolved = RootFolderResolver::default().resolve(None, &toml);
    assert_eq!(resolved, PathBuf::from("/tmp/mintel-from-env"));

    env::remove_var(ROOT_FOLDER_ENV);
}

#[test]
#[serial]
fn test_toml_beats_default() {
    env::remove_var(ROOT_FOLDER_ENV);
    let toml = TomlConfig {
        root_folder: Some(PathBuf::from("/tmp/mintel-from-toml")),
        ..TomlConfig::default()
    };

    let resolved = RootFolderResolver::default().resolve(None, &toml);
    assert_eq!(resolved, PathBuf::from("/tmp/mintel-from-toml"));
}

#[test]
#[serial]
fn test_falls_back_to_os_default() {
    env::remove_var(ROOT_FOLDER_ENV);

    let resolved = RootFolderResolver::default().resolve(None, &TomlConfig::default());
    assert_eq!(resolved, mintel_common::config::default_root_folder());
    assert!(!resolved.as_os_str().is_empty());
}

#[test]
fn test_missing_toml_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let config = load_toml_config(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.port, 5790);
    assert!(config.root_folder.is_none());
}

#[test]
fn test_malformed_toml_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mintel.toml");
    std::fs::write(&path, "port = \"not a number\"").unwrap();

    let err = load_toml_config(&path).unwrap_err();
    assert!(matches!(err, mintel_common::Error::Config(_)));
}

#[test]
fn test_toml_file_is_read() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mintel.toml");
    std::fs::write(&path, "port = 7000\n[logging]\nlevel = \"warn\"\n").unwrap();

    let config = load_toml_config(&path).unwrap();
    assert_eq!(config.port, 7000);
    assert_eq!(config.logging.level, "warn");
}

#[test]
fn test_initializer_creates_nested_root() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("a").join("b");
    let init = RootFolderInitializer::new(root.clone());

    init.ensure_directory_exists().unwrap();
    assert!(root.is_dir());

    // Second call is a no-op
    init.ensure_directory_exists().unwrap();
    assert_eq!(init.root_folder(), root.as_path());
}
