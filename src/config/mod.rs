use crate::models::{OverrideConfig, Settings};
use ::config::{Config, Environment, File, FileFormat};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

/// Settings file inside the config directory
pub const SETTINGS_FILE_NAME: &str = "patch-server.yaml";

/// Project-local override file, relative to the project root
pub const OVERRIDE_CONFIG_FILE_NAME: &str = "patch-server-config.json";

/// Prefix of environment variables overriding settings (`PATCH_SERVER_CONTROL_PORT`, ...)
pub const ENV_PREFIX: &str = "PATCH_SERVER";

/// Configuration manager for the supervisor settings and project overrides.
///
/// Manages two configuration files:
/// - Settings (`patch-server.yaml`): download, backoff, control channel and install options
/// - Override config (`patch-server-config.json`, per project): custom server binaries
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    settings_path: Utf8PathBuf,
    env_prefix: String,
}

impl ConfigManager {
    /// Create a new ConfigManager with the specified configuration directory.
    ///
    /// # Arguments
    /// * `config_dir` - Directory containing `patch-server.yaml`, created when missing
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        Ok(Self {
            settings_path: config_dir.join(SETTINGS_FILE_NAME),
            config_dir,
            env_prefix: ENV_PREFIX.to_string(),
        })
    }

    /// Use a different environment variable prefix
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Load the settings.
    ///
    /// Layers, lowest priority first: defaults, `patch-server.yaml` (optional),
    /// `PATCH_SERVER_*` environment variables.
    ///
    /// # Returns
    /// The merged settings
    pub fn load_settings(&self) -> Result<Settings> {
        if !self.settings_path.exists() {
            tracing::debug!("Settings file not found at {}, using defaults", self.settings_path);
        }

        let config = Config::builder()
            .add_source(
                File::new(self.settings_path.as_str(), FileFormat::Yaml).required(false),
            )
            .add_source(Environment::with_prefix(&self.env_prefix).try_parsing(true))
            .build()
            .with_context(|| format!("Failed to read settings: {}", self.settings_path))?;

        let settings: Settings = config
            .try_deserialize()
            .with_context(|| format!("Failed to parse settings: {}", self.settings_path))?;

        tracing::info!("Loaded settings from {}", self.settings_path);
        Ok(settings)
    }

    /// Save the settings file.
    ///
    /// # Arguments
    /// * `settings` - The settings to save
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(settings).context("Failed to serialize settings to YAML")?;

        fs::write(&self.settings_path, yaml_string)
            .with_context(|| format!("Failed to write settings: {}", self.settings_path))?;

        tracing::info!("Saved settings to {}", self.settings_path);
        Ok(())
    }

    /// Load the override config of a project.
    ///
    /// A missing file means no overrides; a malformed file is logged and
    /// treated the same way so the server can still be downloaded.
    pub fn load_override_config(project_dir: &Utf8Path) -> OverrideConfig {
        let path = project_dir.join(OVERRIDE_CONFIG_FILE_NAME);
        if !path.exists() {
            return OverrideConfig::default();
        }

        let parsed = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read override config: {}", path))
            .and_then(|contents| {
                serde_json::from_str::<OverrideConfig>(&contents)
                    .with_context(|| format!("Failed to parse override config: {}", path))
            });

        match parsed {
            Ok(config) => {
                tracing::info!("Loaded override config from {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("Ignoring override config: {:#}", e);
                OverrideConfig::default()
            }
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    pub fn settings_path(&self) -> &Utf8Path {
        &self.settings_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_config_manager() -> (ConfigManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config_path = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        // unique prefix keeps the test isolated from the real environment
        let manager = ConfigManager::new(&config_path)
            .unwrap()
            .with_env_prefix("PATCH_SERVER_UNIT_TEST");
        (manager, temp_dir)
    }

    #[test]
    fn test_missing_settings_file_uses_defaults() {
        let (manager, _temp_dir) = create_test_config_manager();
        assert_eq!(manager.load_settings().unwrap(), Settings::default());
    }

    #[test]
    fn test_load_save_settings() {
        let (manager, _temp_dir) = create_test_config_manager();

        let settings = Settings {
            control_port: 40000,
            expose_to_network: true,
            install_root: Some(Utf8PathBuf::from("/opt/patch-server")),
            ..Settings::default()
        };
        manager.save_settings(&settings).unwrap();

        let loaded = manager.load_settings().unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_settings_file() {
        let (manager, _temp_dir) = create_test_config_manager();
        fs::write(manager.settings_path(), "backoff_base_ms: 50\n").unwrap();

        let loaded = manager.load_settings().unwrap();
        assert_eq!(loaded.backoff_base_ms, 50);
        assert_eq!(loaded.backoff_max_ms, Settings::default().backoff_max_ms);
    }

    #[test]
    fn test_override_config_missing_and_malformed() {
        let temp_dir = TempDir::new().unwrap();
        let project = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();

        assert!(ConfigManager::load_override_config(&project)
            .custom_server_executables
            .is_empty());

        fs::write(project.join(OVERRIDE_CONFIG_FILE_NAME), "{ broken").unwrap();
        assert!(ConfigManager::load_override_config(&project)
            .custom_server_executables
            .is_empty());
    }

    #[test]
    fn test_override_config_loaded() {
        let temp_dir = TempDir::new().unwrap();
        let project = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        fs::write(
            project.join(OVERRIDE_CONFIG_FILE_NAME),
            r#"{ "customServerExecutables": { "win-x64": "C:/builds/CodePatcherCLI.exe" } }"#,
        )
        .unwrap();

        let config = ConfigManager::load_override_config(&project);
        assert_eq!(
            config.custom_executable("win-x64").map(|p| p.as_str()),
            Some("C:/builds/CodePatcherCLI.exe")
        );
    }
}
