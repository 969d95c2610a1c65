//! Path utilities and XDG directory discovery

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::ConfigError;

/// XDG-compliant paths for the control plane's own configuration, not the
/// resources it serves.
pub struct Paths {
    project_dirs: Option<ProjectDirs>,
}

impl Paths {
    #[must_use]
    pub fn new() -> Self {
        Self { project_dirs: ProjectDirs::from("com", "Fleetd", "fleetd-controller") }
    }

    /// `~/.config/fleetd-controller/`
    pub fn user_config_dir(&self) -> Result<PathBuf, ConfigError> {
        self.project_dirs.as_ref().map(|p| p.config_dir().to_path_buf()).ok_or_else(|| ConfigError::XdgError("failed to determine user config directory".to_string()))
    }

    /// `~/.cache/fleetd-controller/`
    pub fn user_cache_dir(&self) -> Result<PathBuf, ConfigError> {
        self.project_dirs.as_ref().map(|p| p.cache_dir().to_path_buf()).ok_or_else(|| ConfigError::XdgError("failed to determine user cache directory".to_string()))
    }

    /// `~/.config/fleetd-controller/config.toml`
    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.user_config_dir()?.join("config.toml"))
    }

    /// `<project_dir>/fleetd.toml`
    #[must_use]
    pub fn project_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join("fleetd.toml")
    }

    /// `<project_dir>/fleetd.local.toml`, gitignored local overrides.
    #[must_use]
    pub fn local_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join("fleetd.local.toml")
    }

    /// Returns `true` if `project_dir` has a tracked `fleetd.toml`.
    #[must_use]
    pub fn is_initialized(project_dir: impl AsRef<Path>) -> bool {
        Self::project_config_file(project_dir).exists()
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
