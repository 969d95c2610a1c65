//! Configuration loader with multi-source merging

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::{FleetdConfig, Paths};

/// Configuration loader with builder pattern.
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    /// Creates a new config loader rooted at the current directory.
    pub fn new() -> Self {
        Self { project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")), env_prefix: "FLEETD".to_string() }
    }

    /// Sets the project directory `fleetd.toml`/`fleetd.local.toml` are
    /// resolved against.
    #[must_use]
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Sets the environment variable prefix (default: `FLEETD`).
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Loads configuration from all sources with proper precedence.
    pub fn load(self) -> Result<FleetdConfig> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults.
        let defaults = FleetdConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. User config (~/.config/fleetd-controller/config.toml).
        let paths = Paths::new();
        if let Ok(user_config_file) = paths.user_config_file() {
            if user_config_file.exists() {
                builder = builder.add_source(config::File::from(user_config_file).required(false).format(config::FileFormat::Toml));
            }
        }

        // 3. Project config (fleetd.toml).
        let project_config_file = Paths::project_config_file(&self.project_dir);
        if project_config_file.exists() {
            builder = builder.add_source(config::File::from(project_config_file).required(false).format(config::FileFormat::Toml));
        }

        // 4. Local config (fleetd.local.toml, gitignored).
        let local_config_file = Paths::local_config_file(&self.project_dir);
        if local_config_file.exists() {
            builder = builder.add_source(config::File::from(local_config_file).required(false).format(config::FileFormat::Toml));
        }

        // 5. Environment variables (FLEETD_*).
        builder = builder.add_source(config::Environment::with_prefix(&self.env_prefix).separator("_").try_parsing(true));

        let built = builder.build().context("failed to build configuration")?;
        let config: FleetdConfig = built.try_deserialize().context("failed to deserialize configuration")?;

        Ok(config)
    }

    /// Loads configuration, falling back to built-in defaults on any error.
    #[must_use]
    pub fn load_or_default(self) -> FleetdConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
