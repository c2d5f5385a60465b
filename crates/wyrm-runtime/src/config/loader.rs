//! Configuration loader using figment.
//!
//! Sources are merged in this order, later ones winning:
//!
//! 1. Built-in defaults
//! 2. Programmatic overrides passed to [`ConfigLoader::merge`]
//! 3. Profile-specific config file (`wyrm.{profile}.toml` / `wyrm.{profile}.yaml`)
//! 4. Main config file (`wyrm.toml` / `wyrm.yaml`)
//! 5. Environment variables (`WYRM_*`)
//!
//! # Feature Flags
//!
//! - `toml-config`: enables TOML files (`wyrm.toml`, `config.toml`)
//! - `yaml-config`: enables YAML files (`wyrm.yaml`, `wyrm.yml`, `config.yaml`, `config.yml`)
//!
//! # Environment Variable Mapping
//!
//! Variables use the `WYRM_` prefix with `__` as the nesting separator:
//!
//! - `WYRM_LOGGING__LEVEL=debug` → `logging.level = "debug"`
//! - `WYRM_HOST__STOP_TIMEOUT_MS=2000` → `host.stop_timeout_ms = 2000`
//! - `WYRM_HANDLERS__UPPERCASE__INSTANCES=4` → `handlers.uppercase.instances = 4`
//!
//! # Example
//!
//! ```rust,ignore
//! use wyrm_runtime::config::ConfigLoader;
//!
//! let config = ConfigLoader::new()
//!     .profile("production")
//!     .file("./config/wyrm.toml")
//!     .load()?;
//! ```

use std::path::{Path, PathBuf};

use figment::Figment;
#[cfg(any(feature = "yaml-config", feature = "toml-config"))]
use figment::providers::Format;
#[cfg(feature = "toml-config")]
use figment::providers::Toml;
#[cfg(feature = "yaml-config")]
use figment::providers::Yaml;
use figment::providers::{Env, Serialized};
use tracing::{debug, info, trace, warn};

use super::error::{ConfigError, ConfigResult};
use super::schema::WyrmConfig;
use super::validation::validate_config;

/// Environment variable selecting the profile.
pub const PROFILE_ENV: &str = "WYRM_PROFILE";

const ENV_PREFIX: &str = "WYRM_";

/// Configuration profile for environment-specific settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Profile {
    #[default]
    Development,
    Production,
    Custom(String),
}

impl Profile {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Custom(name) => name,
        }
    }

    /// Parses a profile name. `dev` and `prod` are accepted as short forms.
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "development" | "dev" => Self::Development,
            _ => Self::Custom(name.to_string()),
        }
    }

    /// Reads the profile from `WYRM_PROFILE`, defaulting to development.
    pub fn from_env() -> Self {
        std::env::var(PROFILE_ENV)
            .map(|p| Self::parse(&p))
            .unwrap_or_default()
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration loader with figment-based multi-source support.
pub struct ConfigLoader {
    figment: Figment,
    profile: Profile,
    search_paths: Vec<PathBuf>,
    load_env: bool,
    /// Specific file to load instead of searching.
    config_file: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            figment: Figment::new(),
            profile: Profile::from_env(),
            search_paths: Vec::new(),
            load_env: true,
            config_file: None,
        }
    }

    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.profile = Profile::parse(profile.as_ref());
        self
    }

    /// Adds a search path for configuration files.
    ///
    /// Without explicit search paths the current directory and the user
    /// config directory (`~/.config/wyrm` on Linux) are searched.
    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    pub fn with_current_dir(self) -> Self {
        match std::env::current_dir() {
            Ok(cwd) => self.search_path(cwd),
            Err(_) => self,
        }
    }

    pub fn with_user_config_dir(self) -> Self {
        match dirs::config_dir() {
            Some(config_dir) => self.search_path(config_dir.join("wyrm")),
            None => self,
        }
    }

    /// Loads exactly this file. A missing file is an error.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Enables loading environment variables (default: true).
    pub fn with_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    pub fn without_env(mut self) -> Self {
        self.load_env = false;
        self
    }

    /// Merges configuration given in code on top of the defaults.
    pub fn merge(mut self, config: WyrmConfig) -> Self {
        self.figment = self.figment.merge(Serialized::defaults(config));
        self
    }

    /// Loads and validates the configuration.
    pub fn load(self) -> ConfigResult<WyrmConfig> {
        let profile = self.profile.clone();
        let figment = self.build_figment()?;

        let config: WyrmConfig = figment.extract().map_err(|e| {
            ConfigError::ParseError(format!("Failed to extract configuration: {e}"))
        })?;
        validate_config(&config)?;

        debug!(
            profile = %profile,
            logging_level = %config.logging.level,
            handlers = config.handlers.len(),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    fn build_figment(mut self) -> ConfigResult<Figment> {
        let mut figment = Figment::from(Serialized::defaults(WyrmConfig::default()));

        let user_figment = std::mem::take(&mut self.figment);
        figment = figment.merge(user_figment);

        if let Some(path) = &self.config_file {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            info!(path = %path.display(), "Loading configuration file");
            figment = Self::merge_config_file(figment, path)?;
        } else {
            figment = self.load_config_files(figment);
        }

        if self.load_env {
            trace!(prefix = ENV_PREFIX, "Loading environment variables");
            figment = figment.merge(
                Env::prefixed(ENV_PREFIX).ignore(&["PROFILE"]).split("__"),
            );
        }

        Ok(figment)
    }

    /// Merges a single file, dispatching on its extension.
    ///
    /// Only extensions enabled via feature flags are accepted.
    #[cfg_attr(
        not(any(feature = "toml-config", feature = "yaml-config")),
        allow(unused_variables)
    )]
    fn merge_config_file(figment: Figment, path: &Path) -> ConfigResult<Figment> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            #[cfg(feature = "toml-config")]
            "toml" => Ok(figment.merge(Toml::file(path))),
            #[cfg(feature = "yaml-config")]
            "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
            _ => Err(ConfigError::ParseError(format!(
                "Unsupported or disabled configuration file format: .{ext}"
            ))),
        }
    }

    fn resolve_search_paths(&self) -> Vec<PathBuf> {
        if !self.search_paths.is_empty() {
            return self.search_paths.clone();
        }

        let mut paths = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd);
        }
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("wyrm"));
        }
        paths
    }

    /// Searches `search_paths × base_names` for one format.
    ///
    /// The profile-specific variant is merged before its base file. Stops at
    /// the first base file found and reports whether one was found.
    #[cfg(any(feature = "toml-config", feature = "yaml-config"))]
    fn load_format_files<F>(
        &self,
        mut figment: Figment,
        search_paths: &[PathBuf],
        base_names: &[&str],
        merge_fn: F,
    ) -> (Figment, bool)
    where
        F: Fn(Figment, &Path) -> Figment,
    {
        for search_path in search_paths {
            for base_name in base_names {
                let Some((stem, ext)) = base_name.rsplit_once('.') else {
                    continue;
                };

                let profile_path =
                    search_path.join(format!("{stem}.{}.{ext}", self.profile.as_str()));
                if profile_path.exists() {
                    debug!(path = %profile_path.display(), "Loading profile-specific config");
                    figment = merge_fn(figment, &profile_path);
                }

                let base_path = search_path.join(base_name);
                if base_path.exists() {
                    info!(path = %base_path.display(), "Loading configuration file");
                    figment = merge_fn(figment, &base_path);
                    return (figment, true);
                }
            }
        }
        (figment, false)
    }

    #[cfg(any(feature = "toml-config", feature = "yaml-config"))]
    fn load_config_files(&self, mut figment: Figment) -> Figment {
        let search_paths = self.resolve_search_paths();
        let mut found = false;

        #[cfg(feature = "toml-config")]
        {
            let (f, ok) = self.load_format_files(
                figment,
                &search_paths,
                &["wyrm.toml", "config.toml"],
                |fig, path| fig.merge(Toml::file(path)),
            );
            figment = f;
            found |= ok;
        }

        #[cfg(feature = "yaml-config")]
        {
            let (f, ok) = self.load_format_files(
                figment,
                &search_paths,
                &["wyrm.yaml", "wyrm.yml", "config.yaml", "config.yml"],
                |fig, path| fig.merge(Yaml::file(path)),
            );
            figment = f;
            found |= ok;
        }

        if !found {
            warn!("No configuration file found, using defaults");
        }
        figment
    }

    #[cfg(not(any(feature = "toml-config", feature = "yaml-config")))]
    fn load_config_files(&self, figment: Figment) -> Figment {
        warn!(
            search_paths = ?self.resolve_search_paths(),
            "No configuration format enabled, using defaults"
        );
        figment
    }
}

/// Loads configuration from the default locations.
pub fn load_config() -> ConfigResult<WyrmConfig> {
    ConfigLoader::new().load()
}

/// Loads configuration from `path`, with environment overrides.
pub fn load_config_from_file<P: AsRef<Path>>(path: P) -> ConfigResult<WyrmConfig> {
    ConfigLoader::new().file(path).load()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn defaults_without_sources() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::new()
            .search_path(dir.path())
            .without_env()
            .load()
            .unwrap();

        assert_eq!(config.logging.level.as_str(), "info");
        assert_eq!(config.host.stop_timeout_ms, 5000);
        assert!(config.handlers.is_empty());
    }

    #[test]
    fn missing_file_is_reported() {
        let err = ConfigLoader::new()
            .file("/definitely/not/here/wyrm.toml")
            .without_env()
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn merge_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut overrides = WyrmConfig::default();
        overrides.logging.level = LogLevel::Debug;
        overrides.host.stop_timeout_ms = 250;

        let config = ConfigLoader::new()
            .search_path(dir.path())
            .without_env()
            .merge(overrides)
            .load()
            .unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.host.stop_timeout_ms, 250);
    }

    #[test]
    fn invalid_values_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut overrides = WyrmConfig::default();
        overrides.host.stop_timeout_ms = 0;

        let err = ConfigLoader::new()
            .search_path(dir.path())
            .without_env()
            .merge(overrides)
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn profile_names() {
        assert_eq!(Profile::parse("prod"), Profile::Production);
        assert_eq!(Profile::parse("Development"), Profile::Development);
        assert_eq!(Profile::parse("staging"), Profile::Custom("staging".into()));
        assert_eq!(Profile::Production.to_string(), "production");
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn profile_file_is_merged_under_main_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("wyrm.staging.toml"),
            "[logging]\nlevel = \"trace\"\n\n[host]\nstop_timeout_ms = 900\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("wyrm.toml"),
            "[logging]\nlevel = \"warn\"\n\n[handlers.uppercase]\ninstances = 2\n",
        )
        .unwrap();

        let config = ConfigLoader::new()
            .profile("staging")
            .search_path(dir.path())
            .without_env()
            .load()
            .unwrap();

        assert_eq!(config.logging.level, LogLevel::Warn);
        assert_eq!(config.host.stop_timeout_ms, 900);
        assert_eq!(config.handler("uppercase").unwrap().instances, Some(2));
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn bindings_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
[[handlers.uppercase.bindings]]
event_name = "text.requests"

[[handlers.uppercase.bindings]]
event_name = "text.results"
direction = "out"
allow_multiple_consumers = true
"#,
        )
        .unwrap();

        let config = ConfigLoader::new().file(&path).without_env().load().unwrap();
        let bindings = &config.handler("uppercase").unwrap().bindings;
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[1].event_name, "text.results");
        assert!(bindings[1].allow_multiple_consumers);
    }
}
