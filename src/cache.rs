//! Development-tool cache directories on the cache volume.
//!
//! Each tool gets its own directory under the cache mount and is pointed at it
//! through the environment variable the tool already honours, so package
//! managers only ever see plain paths.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::device::{BlockProbe, DeviceOps};
use crate::error::Result;
use crate::plan::Plan;
use crate::plan::mounts::under_root;
use crate::settings::Settings;
use crate::types::Role;

/// (environment variable, directory relative to the cache root)
pub const TOOL_CACHES: &[(&str, &str)] = &[
    ("CARGO_HOME", "cargo"),
    ("RUSTUP_HOME", "rustup"),
    ("npm_config_cache", "npm"),
    ("PIP_CACHE_DIR", "pip"),
    ("GOCACHE", "go/build"),
    ("GOMODCACHE", "go/mod"),
    ("CCACHE_DIR", "ccache"),
    ("SCCACHE_DIR", "sccache"),
    ("XDG_CACHE_HOME", "xdg"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheDir {
    pub var: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEnv {
    pub root: PathBuf,
    /// Whether something is mounted exactly at `root`
    pub mounted: bool,
    pub dirs: Vec<CacheDir>,
}

impl CacheEnv {
    /// `export NAME="path"` lines, one per tool.
    pub fn render_exports(&self) -> String {
        self.dirs
            .iter()
            .map(|d| format!("export {}=\"{}\"\n", d.var, shell_quote(&d.path)))
            .collect()
    }
}

/// Escape the characters that stay special inside double quotes.
fn shell_quote(path: &Path) -> String {
    let mut out = String::new();
    for c in path.display().to_string().chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Cache mount point: the plan's cache volume, else the configured one,
/// placed under `root`.
pub fn resolve_cache_root(plan: Option<&Plan>, settings: &Settings, root: &Path) -> PathBuf {
    let mount_point = plan
        .and_then(|p| p.mount_point_for_role(Role::Cache))
        .unwrap_or_else(|| settings.cache_mount.clone());
    under_root(root, &mount_point)
}

/// Describe the cache directories without touching anything.
pub fn cache_env<P: BlockProbe + ?Sized>(probe: &P, cache_root: &Path) -> Result<CacheEnv> {
    let mounted = probe.mounts()?.iter().any(|m| m.target == cache_root);
    if !mounted {
        warn!("{} is not a mount point; caches land on the parent filesystem", cache_root.display());
    }
    let dirs = TOOL_CACHES
        .iter()
        .map(|(var, rel)| CacheDir {
            var: (*var).to_string(),
            path: cache_root.join(rel),
        })
        .collect();
    Ok(CacheEnv {
        root: cache_root.to_path_buf(),
        mounted,
        dirs,
    })
}

/// Create every missing cache directory. Returns the ones created.
pub fn ensure_cache_dirs<D: DeviceOps + ?Sized>(devices: &mut D, env: &CacheEnv) -> Result<Vec<PathBuf>> {
    let mut created = Vec::new();
    for dir in &env.dirs {
        if devices.path_exists(&dir.path) {
            debug!("{} exists", dir.path.display());
            continue;
        }
        devices.create_dir_all(&dir.path)?;
        info!("created {} for {}", dir.path.display(), dir.var);
        created.push(dir.path.clone());
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDevices;

    #[test]
    fn test_cache_root_from_settings() {
        let settings = Settings::default();
        assert_eq!(
            resolve_cache_root(None, &settings, Path::new("/")),
            PathBuf::from("/cache")
        );
        assert_eq!(
            resolve_cache_root(None, &settings, Path::new("/mnt")),
            PathBuf::from("/mnt/cache")
        );
    }

    #[test]
    fn test_cache_root_from_plan() {
        let plan = Plan::from_toml_str(
            r#"
            [[disk]]
            device = "/dev/sdc"

            [[disk.partition]]
            label = "CACHE"
            role = "cache"
            filesystem = "btrfs"
            size = "remainder"
            mount_point = "/var/cache/dev"
            "#,
        )
        .expect("plan parses"); // test: inline plan
        assert_eq!(
            resolve_cache_root(Some(&plan), &Settings::default(), Path::new("/")),
            PathBuf::from("/var/cache/dev")
        );
    }

    #[test]
    fn test_exports_and_creation() {
        let mut devices = FakeDevices::new().with_dir("/cache/cargo");
        let env = cache_env(&devices, Path::new("/cache")).expect("env");
        assert!(!env.mounted);

        let exports = env.render_exports();
        assert!(exports.contains("export CARGO_HOME=\"/cache/cargo\"\n"));
        assert!(exports.contains("export GOMODCACHE=\"/cache/go/mod\"\n"));
        assert_eq!(exports.lines().count(), TOOL_CACHES.len());

        let created = ensure_cache_dirs(&mut devices, &env).expect("create");
        assert_eq!(created.len(), TOOL_CACHES.len() - 1);
        assert!(!created.contains(&PathBuf::from("/cache/cargo")));
        assert!(devices.path_exists(Path::new("/cache/go/build")));

        let again = ensure_cache_dirs(&mut devices, &env).expect("create again");
        assert!(again.is_empty());
    }

    #[test]
    fn test_shell_quote_escapes() {
        assert_eq!(shell_quote(Path::new("/a $b/\"c\"")), "/a \\$b/\\\"c\\\"");
    }
}
