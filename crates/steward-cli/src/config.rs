//! Configuration vault – reads/writes `~/.steward/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use steward_runtime::KernelConfig;
use steward_types::KernelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Invalid(#[from] KernelError),
}

/// Persisted operator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Entity id the shell submits tasks and checks permissions as.
    #[serde(default = "default_operator")]
    pub operator: String,

    /// Grant the operator every baseline permission at startup.
    #[serde(default = "default_trust_operator")]
    pub trust_operator: bool,

    #[serde(default)]
    pub kernel: KernelConfig,
}

fn default_operator() -> String {
    "operator".to_string()
}
fn default_trust_operator() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            operator: default_operator(),
            trust_operator: default_trust_operator(),
            kernel: KernelConfig::default(),
        }
    }
}

/// Return the path to `~/.steward/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".steward").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, ConfigError> {
    load_from(&config_path())
}

/// Load, apply environment overrides and validate the kernel section.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cfg: Config = toml::from_str(&raw)?;
    apply_env_overrides(&mut cfg);
    cfg.kernel.validate()?;
    Ok(Some(cfg))
}

/// Apply `STEWARD_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `STEWARD_MAX_CONCURRENCY` | `kernel.engine.max_concurrency` |
/// | `STEWARD_QUEUE_SIZE` | `kernel.scheduler.max_queue_size` |
/// | `STEWARD_TICK_MS` | `kernel.timers.tick_interval` |
/// | `STEWARD_SAMPLE_MS` | `kernel.timers.sample_interval` |
/// | `STEWARD_AUTO_RECOVERY` | `kernel.recovery.auto_recovery` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(n) = env_parse::<usize>("STEWARD_MAX_CONCURRENCY") {
        cfg.kernel.engine.max_concurrency = n;
    }
    if let Some(n) = env_parse::<usize>("STEWARD_QUEUE_SIZE") {
        cfg.kernel.scheduler.max_queue_size = n;
    }
    if let Some(ms) = env_parse::<u64>("STEWARD_TICK_MS") {
        cfg.kernel.timers.tick_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = env_parse::<u64>("STEWARD_SAMPLE_MS") {
        cfg.kernel.timers.sample_interval = Duration::from_millis(ms);
    }
    if let Some(on) = env_parse::<bool>("STEWARD_AUTO_RECOVERY") {
        cfg.kernel.recovery.auto_recovery = on;
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Save the config to disk, creating `~/.steward/` if necessary.
pub fn save(cfg: &Config) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
        // Owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(write_err)?;
        }
    }
    let raw = toml::to_string_pretty(cfg)?;
    // rw------- on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}
