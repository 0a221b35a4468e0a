use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::cache::CacheOptions;
use crate::error::LoadAtomsError;
use crate::metadata::DEFAULT_CATALOG_URL;
use crate::progress::Verbosity;
use crate::storage::{SizeThresholds, StorageChoice};
use crate::store::CacheLayout;

pub const DEFAULT_CONFIG_FILE: &str = "load-atoms.json";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// `None` means `~/.load-atoms`.
    pub root: Option<Utf8PathBuf>,
    pub verbosity: Verbosity,
    /// Keep intermediate files under `raw/` after a successful load.
    pub debug: bool,
    pub show_usage_notice: bool,
    pub storage: StorageChoice,
    pub sqlite_threshold_structures: usize,
    pub sqlite_threshold_atoms: usize,
    pub catalog_url: String,
    pub fetch_workers: usize,
    pub lock_stale_after_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let thresholds = SizeThresholds::default();
        Self {
            root: None,
            verbosity: Verbosity::Plain,
            debug: false,
            show_usage_notice: true,
            storage: StorageChoice::Auto,
            sqlite_threshold_structures: thresholds.structures,
            sqlite_threshold_atoms: thresholds.atoms,
            catalog_url: DEFAULT_CATALOG_URL.to_string(),
            fetch_workers: 8,
            lock_stale_after_secs: 3600,
        }
    }
}

impl Settings {
    pub fn root(&self) -> Result<Utf8PathBuf, LoadAtomsError> {
        match &self.root {
            Some(root) => Ok(root.clone()),
            None => CacheLayout::default_root(),
        }
    }

    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            storage: self.storage,
            thresholds: SizeThresholds {
                structures: self.sqlite_threshold_structures,
                atoms: self.sqlite_threshold_atoms,
            },
            fetch_workers: self.fetch_workers.max(1),
            lock_stale_after: Duration::from_secs(self.lock_stale_after_secs),
            keep_raw: self.debug,
        }
    }
}

pub struct SettingsLoader;

impl SettingsLoader {
    /// Reads `path` (or `load-atoms.json` in the working directory, if it
    /// exists) and applies `LOAD_ATOMS_*` environment overrides.
    pub fn resolve(path: Option<&str>) -> Result<Settings, LoadAtomsError> {
        Self::resolve_with_env(path, |key| std::env::var(key).ok())
    }

    pub fn resolve_with_env<E>(path: Option<&str>, env: E) -> Result<Settings, LoadAtomsError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let settings = if path.is_none() && !config_path.exists() {
            Settings::default()
        } else {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| LoadAtomsError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content).map_err(|err| LoadAtomsError::ConfigParse(err.to_string()))?
        };

        Self::apply_env(settings, env)
    }

    pub fn apply_env<E>(mut settings: Settings, env: E) -> Result<Settings, LoadAtomsError>
    where
        E: Fn(&str) -> Option<String>,
    {
        if let Some(root) = env("LOAD_ATOMS_ROOT").filter(|v| !v.trim().is_empty()) {
            settings.root = Some(Utf8PathBuf::from(root));
        }
        if let Some(value) = env("LOAD_ATOMS_VERBOSE") {
            let level: u8 = value
                .trim()
                .parse()
                .map_err(|_| LoadAtomsError::ConfigParse(format!("LOAD_ATOMS_VERBOSE={value}")))?;
            settings.verbosity = Verbosity::try_from(level).map_err(LoadAtomsError::ConfigParse)?;
        }
        if let Some(value) = env("LOAD_ATOMS_DEBUG") {
            settings.debug = parse_flag(&value)
                .ok_or_else(|| LoadAtomsError::ConfigParse(format!("LOAD_ATOMS_DEBUG={value}")))?;
        }
        if let Some(url) = env("LOAD_ATOMS_CATALOG_URL").filter(|v| !v.trim().is_empty()) {
            settings.catalog_url = url;
        }
        if let Some(value) = env("LOAD_ATOMS_STORAGE") {
            settings.storage = value
                .parse()
                .map_err(|err: String| LoadAtomsError::ConfigParse(format!("LOAD_ATOMS_STORAGE: {err}")))?;
        }
        Ok(settings)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
