use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Global storage settings for one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Host directory that backs the logical root `/`.
    pub fs_root: PathBuf,
    /// Privileged identity used by indexing and maintenance work.
    pub service_user: String,
    pub home_prefix: String,
    pub projects_prefix: String,
    /// Name of the per-user favorites directory inside the home folder.
    pub favorites_dir: String,
    /// Maximum length of a translated host path in bytes.
    pub path_max: usize,
    /// Switch the worker thread's fsuid/fsgid while a context is open (requires privileges).
    pub switch_identity: bool,
    pub copy_buffer_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            fs_root: PathBuf::from("/mnt/storage"),
            service_user: "_storage".to_string(),
            home_prefix: "home".to_string(),
            projects_prefix: "projects".to_string(),
            favorites_dir: "Favorites".to_string(),
            // 4096 leaves no room for names created inside workspaces
            path_max: 3700,
            switch_identity: false,
            copy_buffer_bytes: 64 * 1024,
        }
    }
}

impl StorageConfig {
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        Self { fs_root: root.into(), ..Default::default() }
    }

    /// Defaults overlaid with `STORAGE_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        let ov = StorageConfigOverrides::from_env();
        cfg.apply(&ov);
        cfg
    }

    pub fn from_layers(global: &StorageConfig, overrides: Option<&StorageConfigOverrides>) -> EffectiveConfig {
        from_layers(global, overrides)
    }

    fn apply(&mut self, ov: &StorageConfigOverrides) {
        if let Some(v) = &ov.fs_root { self.fs_root = v.clone(); }
        if let Some(v) = &ov.service_user { self.service_user = v.clone(); }
        if let Some(v) = &ov.favorites_dir { self.favorites_dir = v.clone(); }
        if let Some(v) = ov.path_max { self.path_max = v; }
        if let Some(v) = ov.switch_identity { self.switch_identity = v; }
        if let Some(v) = ov.copy_buffer_bytes { self.copy_buffer_bytes = v.max(4096); }
    }
}

/// Deployment overrides. Unspecified values inherit from the global config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfigOverrides {
    #[serde(default)]
    pub fs_root: Option<PathBuf>,
    #[serde(default)]
    pub service_user: Option<String>,
    #[serde(default)]
    pub favorites_dir: Option<String>,
    #[serde(default)]
    pub path_max: Option<usize>,
    #[serde(default)]
    pub switch_identity: Option<bool>,
    #[serde(default)]
    pub copy_buffer_bytes: Option<usize>,
}

impl StorageConfigOverrides {
    pub fn from_env() -> Self {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.trim().is_empty())
        }
        Self {
            fs_root: var("STORAGE_FS_ROOT").map(PathBuf::from),
            service_user: var("STORAGE_SERVICE_USER"),
            favorites_dir: var("STORAGE_FAVORITES_DIR"),
            path_max: var("STORAGE_PATH_MAX").and_then(|v| v.parse().ok()),
            switch_identity: var("STORAGE_SWITCH_IDENTITY").map(|v| matches!(v.as_str(), "1" | "true" | "yes")),
            copy_buffer_bytes: var("STORAGE_COPY_BUFFER_BYTES").and_then(|v| v.parse().ok()),
        }
    }
}

/// Fully resolved config used during execution.
pub type EffectiveConfig = StorageConfig;

/// Build an effective config from global settings plus optional overrides.
pub fn from_layers(global: &StorageConfig, overrides: Option<&StorageConfigOverrides>) -> EffectiveConfig {
    let mut eff = global.clone();
    if let Some(ov) = overrides {
        eff.apply(ov);
    }
    eff
}
