use camino::Utf8PathBuf;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Version of the patch server binary this crate provisions.
pub const SERVER_VERSION: &str = "1.5.2";

/// Runtime settings from `patch-server.yaml`
///
/// Every field has a default so a missing or partial file is valid. Values can
/// be overridden through `PATCH_SERVER_*` environment variables (see
/// [`crate::config::ConfigManager::load_settings`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the release CDN
    pub download_host: String,

    /// Server version to download, in dotted form
    pub server_version: String,

    /// Backoff delay for the first retry
    pub backoff_base_ms: u64,

    /// Upper bound for a single backoff delay
    pub backoff_max_ms: u64,

    /// Timeout for a single download request
    pub download_timeout_secs: u64,

    /// Local port the server listens on for control requests
    pub control_port: u16,

    /// How long to wait for the server to acknowledge a stop request and exit
    pub stop_timeout_ms: u64,

    /// Listen on the local network interface instead of localhost only
    pub expose_to_network: bool,

    /// Overrides the machine-wide executable cache root
    pub install_root: Option<Utf8PathBuf>,

    pub debug_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_host: "https://hot-reload.b-cdn.net".to_string(),
            server_version: SERVER_VERSION.to_string(),
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            download_timeout_secs: 600,
            control_port: 33242,
            stop_timeout_ms: 5_000,
            expose_to_network: false,
            install_root: None,
            debug_mode: false,
        }
    }
}

impl Settings {
    /// Version string as used in release URLs and install directories (`1-5-2`)
    pub fn version_slug(&self) -> String {
        self.server_version.replace('.', "-")
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Endpoint the server accepts its stop directive on
    pub fn control_url(&self) -> String {
        format!("http://127.0.0.1:{}/kill", self.control_port)
    }
}

/// Project-local override file (`patch-server-config.json`)
///
/// Lets a user point at a locally built server binary per platform instead of
/// downloading the released one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverrideConfig {
    #[serde(rename = "customServerExecutables", default)]
    pub custom_server_executables: IndexMap<String, Utf8PathBuf>,
}

impl OverrideConfig {
    /// Custom binary path configured for a platform id (e.g. `linux-x64`)
    pub fn custom_executable(&self, platform_id: &str) -> Option<&Utf8PathBuf> {
        self.custom_server_executables.get(platform_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.server_version, SERVER_VERSION);
        assert_eq!(settings.control_port, 33242);
        assert_eq!(settings.backoff_base(), Duration::from_millis(500));
        assert!(!settings.expose_to_network);
        assert!(settings.install_root.is_none());
    }

    #[test]
    fn test_version_slug() {
        let settings = Settings {
            server_version: "1.12.0".to_string(),
            ..Settings::default()
        };
        assert_eq!(settings.version_slug(), "1-12-0");
    }

    #[test]
    fn test_control_url_uses_port() {
        let settings = Settings {
            control_port: 4000,
            ..Settings::default()
        };
        assert_eq!(settings.control_url(), "http://127.0.0.1:4000/kill");
    }

    #[test]
    fn test_override_config_parses_json() {
        let json = r#"{ "customServerExecutables": { "linux-x64": "/opt/server/CodePatcherCLI" } }"#;
        let config: OverrideConfig = serde_json::from_str(json).unwrap();

        assert_eq!(
            config.custom_executable("linux-x64").map(|p| p.as_str()),
            Some("/opt/server/CodePatcherCLI")
        );
        assert!(config.custom_executable("win-x64").is_none());
    }

    #[test]
    fn test_override_config_missing_key_is_empty() {
        let config: OverrideConfig = serde_json::from_str("{}").unwrap();
        assert!(config.custom_server_executables.is_empty());
    }
}
