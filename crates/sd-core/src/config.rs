use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{SdError, SdResult};

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "SDRIVE_CONFIG";

/// Top-level client configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SdConfig {
    pub upload: UploadConfig,
    pub store: StoreConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Drafts uploaded concurrently (default: 2)
    pub concurrency: usize,
    /// Parallel block transfers within one draft (default: 4)
    pub block_concurrency: usize,
    /// Maximum plaintext bytes per block (default: 4 MiB)
    pub max_block_size: usize,
    /// Candidate names probed per availability batch (default: 15)
    pub name_probe_step: usize,
    /// Re-discoveries after a "name already exists" rejection (default: 3)
    pub max_name_clash_retries: u32,
    /// Prove possession of every block instead of block 0 only
    pub verify_all_blocks: bool,
    /// Write ciphertext here instead of holding it in memory
    pub spill_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file backing the local repository
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            block_concurrency: 4,
            max_block_size: 4 * 1024 * 1024,
            name_probe_step: 15,
            max_name_clash_retries: 3,
            verify_all_blocks: false,
            spill_dir: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("~/.local/share/sdrive/store.json"),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl SdConfig {
    /// Parse a config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> SdResult<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let config: Self = toml::from_str(&text)
            .map_err(|e| SdError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> SdResult<()> {
        if self.upload.concurrency == 0 {
            return Err(SdError::Config("upload.concurrency must be at least 1".into()));
        }
        if self.upload.block_concurrency == 0 {
            return Err(SdError::Config(
                "upload.block_concurrency must be at least 1".into(),
            ));
        }
        if self.upload.max_block_size == 0 {
            return Err(SdError::Config("upload.max_block_size must be non-zero".into()));
        }
        if self.upload.name_probe_step == 0 {
            return Err(SdError::Config("upload.name_probe_step must be non-zero".into()));
        }
        match self.log.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(SdError::Config(format!(
                "log.format must be \"text\" or \"json\", got \"{other}\""
            ))),
        }
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
