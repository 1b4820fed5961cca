//! Configuration module for the watch service.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//! - CLI argument overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `LOOKOUT_` and use double
//! underscores to separate nested levels:
//! - `LOOKOUT_WATCH__DEBOUNCE_MS=100` sets `watch.debounce_ms`
//! - `LOOKOUT_SERVER__SEPARATE_PROCESS=false` sets `server.separate_process`
//! - `LOOKOUT_WATCH__VERBOSE=true` sets `watch.verbose`

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::watcher::WatchServiceOptions;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Workspace root directory (where .lookout is located)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,

    /// Global debug mode
    #[serde(default = "default_false")]
    pub debug: bool,

    /// Watcher tuning
    #[serde(default)]
    pub watch: WatchConfig,

    /// Service process settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatchConfig {
    /// Window for folding event bursts into one notification, in ms
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Interval for probing a watch target that does not exist yet, in ms
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long an unreferenced watcher lingers before disposal, in ms
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// How long a cached subscription outlives its last local reference, in ms
    #[serde(default = "default_reuse_linger_ms")]
    pub reuse_linger_ms: u64,

    /// Log watcher lifecycle at info level instead of debug
    #[serde(default = "default_false")]
    pub verbose: bool,

    /// Glob patterns excluded from every watch started by the CLI
    #[serde(default = "default_ignored")]
    pub ignored: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Run the watch service in a spawned helper process
    #[serde(default = "default_true")]
    pub separate_process: bool,

    /// Interval for the helper's parent liveness probe, in seconds
    #[serde(default = "default_parent_check_interval_secs")]
    pub parent_check_interval_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module level overrides
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_debounce_ms() -> u64 {
    50
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_grace_period_ms() -> u64 {
    10_000
}
fn default_reuse_linger_ms() -> u64 {
    60_000
}
fn default_parent_check_interval_secs() -> u64 {
    5
}
fn default_log_level() -> String {
    "warn".to_string()
}
fn default_ignored() -> Vec<String> {
    vec!["**/.git/**".to_string()]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            workspace_root: None,
            debug: false,
            watch: WatchConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            grace_period_ms: default_grace_period_ms(),
            reuse_linger_ms: default_reuse_linger_ms(),
            verbose: false,
            ignored: default_ignored(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            separate_process: true,
            parent_check_interval_secs: default_parent_check_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn reuse_linger(&self) -> Duration {
        Duration::from_millis(self.reuse_linger_ms)
    }

    /// Tuning for the watch service, as configured.
    pub fn service_options(&self) -> WatchServiceOptions {
        WatchServiceOptions {
            grace_period: self.grace_period(),
            debounce: self.debounce(),
            poll_interval: self.poll_interval(),
            verbose: self.verbose,
        }
    }
}

impl ServerConfig {
    pub fn parent_check_interval(&self) -> Duration {
        Duration::from_secs(self.parent_check_interval_secs)
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        // Try to find the workspace root by looking for a .lookout directory
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(".lookout/settings.toml"));

        Figment::new()
            // Start with defaults
            .merge(Serialized::defaults(Settings::default()))
            // Layer in config file if it exists
            .merge(Toml::file(config_path))
            // Layer in environment variables with LOOKOUT_ prefix.
            // Double underscore (__) separates nested levels; single
            // underscore remains part of the field name.
            .merge(Env::prefixed("LOOKOUT_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            // Extract into Settings struct
            .extract()
            .map_err(Box::new)
            .map(|mut settings: Settings| {
                // If workspace_root is not set in config, detect it
                if settings.workspace_root.is_none() {
                    settings.workspace_root = Self::workspace_root();
                }
                settings
            })
    }

    /// Find the workspace config by looking for a .lookout directory,
    /// searching from the current directory up to root
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(".lookout");
            if config_dir.exists() && config_dir.is_dir() {
                return Some(config_dir.join("settings.toml"));
            }
        }

        None
    }

    /// Get the workspace root directory (where .lookout is located)
    pub fn workspace_root() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(".lookout");
            if config_dir.exists() && config_dir.is_dir() {
                return Some(ancestor.to_path_buf());
            }
        }

        None
    }

    /// Load configuration from a specific file
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("LOOKOUT_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<std::path::Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file
    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = PathBuf::from(".lookout/settings.toml");

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        // Create settings with detected workspace root
        let mut settings = Settings::default();

        // Set workspace root to current directory
        if let Ok(current_dir) = std::env::current_dir() {
            settings.workspace_root = Some(current_dir);
        }

        settings.save(&config_path)?;
        if force {
            println!("Overwrote configuration at: {}", config_path.display());
        } else {
            println!("Created default configuration at: {}", config_path.display());
        }

        Ok(config_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.version, 1);
        assert_eq!(settings.watch.debounce_ms, 50);
        assert_eq!(settings.watch.grace_period_ms, 10_000);
        assert_eq!(settings.watch.reuse_linger_ms, 60_000);
        assert!(settings.server.separate_process);
        assert_eq!(settings.server.parent_check_interval_secs, 5);
        assert_eq!(settings.logging.default, "warn");
    }

    #[test]
    fn test_service_options_mapping() {
        let mut watch = WatchConfig::default();
        watch.debounce_ms = 75;
        watch.grace_period_ms = 2_000;
        watch.poll_interval_ms = 250;
        watch.verbose = true;

        let options = watch.service_options();
        assert_eq!(options.debounce, Duration::from_millis(75));
        assert_eq!(options.grace_period, Duration::from_secs(2));
        assert_eq!(options.poll_interval, Duration::from_millis(250));
        assert!(options.verbose);
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        let toml_content = r#"
version = 2

[watch]
debounce_ms = 100
grace_period_ms = 5000
ignored = ["**/target/**"]

[server]
separate_process = false
"#;

        fs::write(&config_path, toml_content).unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert_eq!(settings.version, 2);
        assert_eq!(settings.watch.debounce_ms, 100);
        assert_eq!(settings.watch.grace_period_ms, 5000);
        // Default ignore patterns should be replaced by custom ones
        assert_eq!(settings.watch.ignored, vec!["**/target/**"]);
        assert!(!settings.server.separate_process);
    }

    #[test]
    fn test_save_settings() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        let mut settings = Settings::default();
        settings.watch.debounce_ms = 20;
        settings.server.parent_check_interval_secs = 2;

        settings.save(&config_path).unwrap();

        let loaded = Settings::load_from(&config_path).unwrap();
        assert_eq!(loaded.watch.debounce_ms, 20);
        assert_eq!(loaded.server.parent_check_interval_secs, 2);
    }

    #[test]
    fn test_partial_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        // Only specify a few settings
        let toml_content = r#"
[server]
separate_process = false
"#;

        fs::write(&config_path, toml_content).unwrap();

        let settings = Settings::load_from(&config_path).unwrap();

        // Modified values
        assert!(!settings.server.separate_process);

        // Default values should still be present
        assert_eq!(settings.version, 1);
        assert_eq!(settings.watch.debounce_ms, 50);
        assert!(!settings.watch.ignored.is_empty());
    }

    #[test]
    fn test_layered_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        let toml_content = r#"
[watch]
poll_interval_ms = 100

[server]
parent_check_interval_secs = 9
"#;
        fs::write(&config_path, toml_content).unwrap();

        // Set environment variables that should override the config file.
        // Keys no sibling test asserts on, so parallel runs cannot clash.
        unsafe {
            std::env::set_var("LOOKOUT_WATCH__POLL_INTERVAL_MS", "200");
            std::env::set_var("LOOKOUT_DEBUG", "true");
        }

        let settings = Settings::load_from(&config_path).unwrap();

        // Environment variable should override config file
        assert_eq!(settings.watch.poll_interval_ms, 200);
        // Env var adds new value not in config
        assert!(settings.debug);
        // Config file value should be used when no env var
        assert_eq!(settings.server.parent_check_interval_secs, 9);

        // Clean up
        unsafe {
            std::env::remove_var("LOOKOUT_WATCH__POLL_INTERVAL_MS");
            std::env::remove_var("LOOKOUT_DEBUG");
        }
    }
}
