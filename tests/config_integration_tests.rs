//! Integration tests for ConfigManager and configuration file handling
//!
//! These tests verify:
//! - Settings loading and saving
//! - Defaults for missing files and fields
//! - Environment variable overrides
//! - Project override config parsing

use camino::Utf8PathBuf;
use patch_server::ConfigManager;
use patch_server::config::{OVERRIDE_CONFIG_FILE_NAME, SETTINGS_FILE_NAME};
use patch_server::models::Settings;
use std::fs;
use tempfile::TempDir;

fn create_test_config_dir() -> (TempDir, Utf8PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
    (temp_dir, config_path)
}

#[test]
fn test_create_config_manager() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let manager = ConfigManager::new(&config_path).unwrap();

    assert_eq!(manager.config_dir(), &config_path);
    assert_eq!(manager.settings_path(), config_path.join(SETTINGS_FILE_NAME));
}

#[test]
fn test_config_dir_is_created() {
    let (_temp_dir, config_path) = create_test_config_dir();
    let nested = config_path.join("nested").join("config");

    ConfigManager::new(&nested).unwrap();
    assert!(nested.is_dir());
}

#[test]
fn test_settings_yaml_file() {
    let (_temp_dir, config_path) = create_test_config_dir();
    fs::write(
        config_path.join(SETTINGS_FILE_NAME),
        "download_host: https://mirror.example.com\nserver_version: 1.6.0\ncontrol_port: 41000\n",
    )
    .unwrap();

    let settings = ConfigManager::new(&config_path)
        .unwrap()
        .with_env_prefix("PATCH_SERVER_IT_YAML")
        .load_settings()
        .unwrap();

    assert_eq!(settings.download_host, "https://mirror.example.com");
    assert_eq!(settings.version_slug(), "1-6-0");
    assert_eq!(settings.control_url(), "http://127.0.0.1:41000/kill");
    assert_eq!(settings.stop_timeout_ms, Settings::default().stop_timeout_ms);
}

#[test]
fn test_environment_overrides_file() {
    let (_temp_dir, config_path) = create_test_config_dir();
    fs::write(config_path.join(SETTINGS_FILE_NAME), "control_port: 41000\n").unwrap();

    // Prefix unique to this test, no other test reads it
    unsafe {
        std::env::set_var("PATCH_SERVER_IT_ENV_CONTROL_PORT", "42000");
        std::env::set_var("PATCH_SERVER_IT_ENV_EXPOSE_TO_NETWORK", "true");
    }

    let settings = ConfigManager::new(&config_path)
        .unwrap()
        .with_env_prefix("PATCH_SERVER_IT_ENV")
        .load_settings()
        .unwrap();

    assert_eq!(settings.control_port, 42000);
    assert!(settings.expose_to_network);
}

#[test]
fn test_malformed_settings_is_an_error() {
    let (_temp_dir, config_path) = create_test_config_dir();
    fs::write(config_path.join(SETTINGS_FILE_NAME), "control_port: [not, a, port]\n").unwrap();

    let result = ConfigManager::new(&config_path)
        .unwrap()
        .with_env_prefix("PATCH_SERVER_IT_BAD")
        .load_settings();
    assert!(result.is_err());
}

#[test]
fn test_override_config_preserves_order() {
    let (_temp_dir, project) = create_test_config_dir();
    fs::write(
        project.join(OVERRIDE_CONFIG_FILE_NAME),
        r#"{
            "customServerExecutables": {
                "osx-arm64": "/builds/arm/CodePatcherCLI",
                "linux-x64": "/builds/linux/CodePatcherCLI"
            }
        }"#,
    )
    .unwrap();

    let config = ConfigManager::load_override_config(&project);
    let platforms: Vec<&str> = config
        .custom_server_executables
        .keys()
        .map(String::as_str)
        .collect();
    assert_eq!(platforms, vec!["osx-arm64", "linux-x64"]);
}
