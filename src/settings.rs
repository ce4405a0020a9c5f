//! Runtime settings for archdisk.
//!
//! Settings are optional: every field has a default, a JSON file may override
//! any subset of them, and a couple of environment variables override the file.
//! Loading happens once at the CLI edge and uses `anyhow` for context.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Settings file path when `--config` is not given.
pub const CONFIG_ENV: &str = "ARCHDISK_CONFIG";
pub const TARGET_ROOT_ENV: &str = "ARCHDISK_TARGET_ROOT";
pub const SCRATCH_DIR_ENV: &str = "ARCHDISK_SCRATCH_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Where the installed system is assembled unless the plan says otherwise
    pub target_root: PathBuf,
    /// Parent of the temporary top-level btrfs mounts
    pub scratch_dir: PathBuf,
    /// Upper bound on waiting for partition nodes after partitioning
    pub partition_wait_ms: u64,
    pub partition_poll_ms: u64,
    /// Extra attempts per failed mount
    pub mount_retries: u32,
    pub mount_retry_delay_ms: u64,
    /// Environment variable holding the LUKS passphrase
    pub passphrase_env: String,
    /// Cache volume mount point when the plan declares none
    pub cache_mount: PathBuf,
    /// Scripts the verifier expects inside the installed system
    pub helper_scripts: Vec<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_root: PathBuf::from("/mnt"),
            scratch_dir: PathBuf::from("/run/archdisk"),
            partition_wait_ms: 10_000,
            partition_poll_ms: 200,
            mount_retries: 2,
            mount_retry_delay_ms: 500,
            passphrase_env: "ARCHDISK_PASSPHRASE".to_string(),
            cache_mount: PathBuf::from("/cache"),
            helper_scripts: vec![
                PathBuf::from("/usr/local/bin/cache-env"),
                PathBuf::from("/usr/local/bin/repair-home"),
            ],
        }
    }
}

impl Settings {
    /// Load settings from `path`, then `$ARCHDISK_CONFIG`, else defaults.
    ///
    /// Environment overrides are applied last and the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut settings = match path.map(Path::to_path_buf).or(from_env) {
            Some(file) => Self::load_from_file(&file)?,
            None => Self::default(),
        };
        settings.apply_env_overrides(|key| env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings from {:?}", path.as_ref()))?;

        let settings: Self =
            serde_json::from_str(&content).context("Failed to parse settings JSON")?;

        debug!("loaded settings from {}", path.as_ref().display());
        Ok(settings)
    }

    /// Save settings to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize settings to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write settings to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Apply `ARCHDISK_TARGET_ROOT` / `ARCHDISK_SCRATCH_DIR` through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(TARGET_ROOT_ENV).filter(|v| !v.trim().is_empty()) {
            debug!("{} overrides target_root", TARGET_ROOT_ENV);
            self.target_root = PathBuf::from(root);
        }
        if let Some(dir) = lookup(SCRATCH_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            debug!("{} overrides scratch_dir", SCRATCH_DIR_ENV);
            self.scratch_dir = PathBuf::from(dir);
        }
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        for (name, path) in [
            ("target_root", &self.target_root),
            ("scratch_dir", &self.scratch_dir),
            ("cache_mount", &self.cache_mount),
        ] {
            if !path.is_absolute() {
                anyhow::bail!("{} must be an absolute path, got {:?}", name, path);
            }
        }
        if self.scratch_dir.starts_with(&self.target_root) && self.target_root != Path::new("/") {
            anyhow::bail!(
                "scratch_dir {:?} must not live under target_root {:?}",
                self.scratch_dir,
                self.target_root
            );
        }

        if self.partition_wait_ms == 0 {
            anyhow::bail!("partition_wait_ms must be greater than zero");
        }
        if self.partition_poll_ms == 0 || self.partition_poll_ms > self.partition_wait_ms {
            anyhow::bail!("partition_poll_ms must be between 1 and partition_wait_ms");
        }

        let var = self.passphrase_env.trim();
        if var.is_empty() || !var.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            anyhow::bail!(
                "passphrase_env must be a non-empty environment variable name, got {:?}",
                self.passphrase_env
            );
        }

        if let Some(bad) = self.helper_scripts.iter().find(|p| !p.is_absolute()) {
            anyhow::bail!("helper script paths must be absolute, got {:?}", bad);
        }

        Ok(())
    }

    pub fn partition_wait(&self) -> Duration {
        Duration::from_millis(self.partition_wait_ms)
    }

    pub fn partition_poll(&self) -> Duration {
        Duration::from_millis(self.partition_poll_ms)
    }

    pub fn mount_retry_delay(&self) -> Duration {
        Duration::from_millis(self.mount_retry_delay_ms)
    }
}
