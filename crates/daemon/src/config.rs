//! Daemon configuration parsing and validation.
//!
//! Anvil reads one TOML file; unknown top-level keys are warned about and
//! ignored so configs stay forward-compatible.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Full daemon configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Unix socket the emitter serves clients on.
    pub socket_path: PathBuf,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub emitter: EmitterConfig,

    /// Present when this daemon also serves peer compilations.
    #[serde(default)]
    pub absorber: Option<AbsorberConfig>,

    /// Known compiler toolchains.
    #[serde(default)]
    pub versions: Vec<VersionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_path")]
    pub path: PathBuf,

    /// Byte budget; 0 means unlimited.
    #[serde(default)]
    pub max_size: u64,

    /// Snappy-compress stored objects.
    #[serde(default)]
    pub snappy: bool,

    /// Enable the direct (raw-source) tier.
    #[serde(default = "CacheConfig::default_direct")]
    pub direct: bool,

    /// Seconds between background refresh/eviction passes.
    #[serde(default = "CacheConfig::default_clean_period")]
    pub clean_period: u64,

    #[serde(default)]
    pub disabled: bool,
}

impl CacheConfig {
    fn default_path() -> PathBuf {
        PathBuf::from("~/.anvil/cache")
    }

    fn default_direct() -> bool {
        true
    }

    fn default_clean_period() -> u64 {
        180
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            path: Self::default_path(),
            max_size: 0,
            snappy: false,
            direct: Self::default_direct(),
            clean_period: Self::default_clean_period(),
            disabled: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmitterConfig {
    /// Local fallback compilation threads.
    #[serde(default = "EmitterConfig::default_threads")]
    pub threads: u32,

    /// Run locally only what the remotes failed; frees this machine for
    /// interactive work while the farm is healthy.
    #[serde(default)]
    pub only_failed: bool,

    /// Capacity of the dispatch queue; 0 means unlimited.
    #[serde(default)]
    pub queue_capacity: u64,

    /// Seconds a remote worker waits on the queue before rechecking for
    /// shutdown.
    #[serde(default = "EmitterConfig::default_pop_timeout")]
    pub pop_timeout: u64,

    /// When non-zero, a shard backed up past this length is served
    /// exclusively by its own remote's workers.
    #[serde(default)]
    pub strict_shard_limit: u32,

    #[serde(default)]
    pub remotes: Vec<RemoteConfig>,
}

impl EmitterConfig {
    fn default_threads() -> u32 {
        std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(2)
    }

    fn default_pop_timeout() -> u64 {
        1
    }
}

impl Default for EmitterConfig {
    fn default() -> Self {
        EmitterConfig {
            threads: Self::default_threads(),
            only_failed: false,
            queue_capacity: 0,
            pop_timeout: Self::default_pop_timeout(),
            strict_shard_limit: 0,
            remotes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,

    /// In-flight compilations this remote accepts from us; also the number
    /// of dispatch threads devoted to it.
    #[serde(default = "RemoteConfig::default_threads")]
    pub threads: u32,

    #[serde(default)]
    pub shard: Option<u32>,

    #[serde(default)]
    pub disabled: bool,
}

impl RemoteConfig {
    fn default_threads() -> u32 {
        2
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AbsorberConfig {
    #[serde(default = "AbsorberConfig::default_host")]
    pub host: String,
    pub port: u16,

    #[serde(default = "AbsorberConfig::default_threads")]
    pub threads: u32,

    /// Capacity of the inbound queue; 0 means unlimited.
    #[serde(default)]
    pub queue_capacity: u64,
}

impl AbsorberConfig {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_threads() -> u32 {
        std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(2)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionConfig {
    /// Version line clients request, e.g. "clang version 17.0.6".
    pub version: String,
    pub path: PathBuf,

    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    pub path: PathBuf,
}

/// Known top-level keys in the config.
const KNOWN_KEYS: &[&str] = &["socket_path", "cache", "emitter", "absorber", "versions"];

/// Config with flexible parsing that captures unknown keys.
#[derive(Deserialize)]
struct FlexibleConfig {
    #[serde(flatten)]
    unknown: BTreeMap<String, toml::Value>,
}

/// Load and validate config from a file path.
pub fn load(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse(&content, path)
}

/// Parse config from string content, warning on unknown top-level keys.
pub fn parse(content: &str, path: &Path) -> Result<Config> {
    let flexible: FlexibleConfig = toml::from_str(content).map_err(|e| Error::Config {
        message: e.to_string(),
        path: Some(path.to_path_buf()),
    })?;
    for key in flexible.unknown.keys() {
        if !KNOWN_KEYS.contains(&key.as_str()) {
            eprintln!(
                "anvild: warning: {}: unrecognized field `{}` (ignored)",
                path.display(),
                key
            );
        }
    }

    let mut config: Config = toml::from_str(content).map_err(|e| Error::Config {
        message: e.to_string(),
        path: Some(path.to_path_buf()),
    })?;
    config.cache.path = expand_tilde(&config.cache.path);
    validate(&config, path)?;
    Ok(config)
}

fn validate(config: &Config, path: &Path) -> Result<()> {
    for version in &config.versions {
        if version.path.as_os_str().is_empty() {
            return Err(Error::Config {
                message: format!("compiler {} has no path", version.version),
                path: Some(path.to_path_buf()),
            });
        }
        for plugin in &version.plugins {
            if plugin.path.as_os_str().is_empty() {
                return Err(Error::Config {
                    message: format!(
                        "plugin {} for compiler {} has no path",
                        plugin.name, version.version
                    ),
                    path: Some(path.to_path_buf()),
                });
            }
        }
    }

    if config.emitter.only_failed
        && !config.emitter.remotes.iter().any(|remote| !remote.disabled)
    {
        // Fresh tasks would wait forever on a dispatch pool that does not
        // exist.
        return Err(Error::Config {
            message: "emitter.only_failed requires at least one active remote".to_string(),
            path: Some(path.to_path_buf()),
        });
    }

    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    let Some(text) = path.to_str() else {
        return path.to_path_buf();
    };
    if let Some(rest) = text.strip_prefix("~/")
        && let Ok(home) = std::env::var("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    path.to_path_buf()
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
