//! Configuration Loader
//!
//! Environment-aware configuration loading. Sources are layered, later ones
//! winning:
//!
//! 1. Built-in defaults
//! 2. `config/tasker-bus.toml` (or the file named by `TASKER_BUS_CONFIG`)
//! 3. `config/tasker-bus.{environment}.toml`, environment from `TASKER_ENV`
//! 4. Environment variables such as `TASKER_BUS__KEEPALIVE__PROBE_INTERVAL_SECONDS=30`

use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::BusConfig;
use crate::error::BusResult;

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "TASKER_BUS_CONFIG";

/// Prefix of environment variable overrides
pub const ENV_PREFIX: &str = "TASKER_BUS";

const DEFAULT_CONFIG_DIR: &str = "config";
const BASE_NAME: &str = "tasker-bus";

/// Builder for layered [`BusConfig`] loading
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    environment: String,
    use_env_overrides: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            file: std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from),
            environment: Self::detect_environment(),
            use_env_overrides: true,
        }
    }

    /// Use an explicit base file instead of `config/tasker-bus.toml`
    pub fn with_file(mut self, path: &Path) -> Self {
        self.file = Some(path.to_path_buf());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Skip `TASKER_BUS__*` overrides; keeps tests independent of the process env
    pub fn without_env_overrides(mut self) -> Self {
        self.use_env_overrides = false;
        self
    }

    /// Detect the current environment
    pub fn detect_environment() -> String {
        std::env::var("TASKER_ENV")
            .or_else(|_| std::env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    /// Load, merge and validate the configuration
    pub fn load(&self) -> BusResult<BusConfig> {
        let base = self
            .file
            .clone()
            .unwrap_or_else(|| Path::new(DEFAULT_CONFIG_DIR).join(format!("{BASE_NAME}.toml")));
        let overlay = environment_overlay(&base, &self.environment);

        debug!(
            base = %base.display(),
            overlay = %overlay.display(),
            environment = %self.environment,
            "Loading bus configuration"
        );

        let mut builder = Config::builder()
            .add_source(File::from(base.as_path()).format(FileFormat::Toml).required(false))
            .add_source(
                File::from(overlay.as_path())
                    .format(FileFormat::Toml)
                    .required(false),
            );

        if self.use_env_overrides {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: BusConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}

/// `dir/tasker-bus.toml` -> `dir/tasker-bus.{environment}.toml`
fn environment_overlay(base: &Path, environment: &str) -> PathBuf {
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(BASE_NAME);
    base.with_file_name(format!("{stem}.{environment}.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_missing_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::new()
            .with_file(&dir.path().join("absent.toml"))
            .without_env_overrides()
            .load()
            .unwrap();

        assert_eq!(config.channel_prefix, "tasker_bus");
        assert_eq!(config.publish_wait_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_file_and_environment_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("tasker-bus.toml");
        let mut file = std::fs::File::create(&base).unwrap();
        writeln!(
            file,
            "default_channel = \"node_a\"\noverflow_threshold_bytes = 4000\n\n[keepalive]\nprobe_interval_seconds = 30"
        )
        .unwrap();

        let mut overlay = std::fs::File::create(dir.path().join("tasker-bus.test.toml")).unwrap();
        writeln!(overlay, "[keepalive]\nprobe_interval_seconds = 5").unwrap();

        let config = ConfigLoader::new()
            .with_file(&base)
            .with_environment("test")
            .without_env_overrides()
            .load()
            .unwrap();

        assert_eq!(config.default_channel.as_deref(), Some("node_a"));
        assert_eq!(config.overflow_threshold_bytes, Some(4000));
        assert_eq!(config.keepalive.probe_interval(), Duration::from_secs(5));
        assert_eq!(config.keepalive.reconnect_max_attempts, 5);
    }

    #[test]
    fn test_invalid_file_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("tasker-bus.toml");
        std::fs::write(&base, "publish_wait_timeout_ms = 0\n").unwrap();

        let result = ConfigLoader::new()
            .with_file(&base)
            .without_env_overrides()
            .load();
        assert!(result.is_err());
    }

    #[test]
    fn test_environment_overlay_path() {
        let overlay = environment_overlay(Path::new("config/tasker-bus.toml"), "production");
        assert_eq!(overlay, PathBuf::from("config/tasker-bus.production.toml"));
    }
}
