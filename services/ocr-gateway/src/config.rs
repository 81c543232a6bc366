//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Round-robin key material is loaded from the OCR_API_KEYS env var or
//! api_keys_file, never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Default OCR.space parse endpoint, used when a key carries none of its own.
pub const DEFAULT_OCR_ENDPOINT: &str = "https://api.ocr.space/parse/image";

/// Env var holding the delimited round-robin key list
pub const API_KEYS_ENV: &str = "OCR_API_KEYS";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    pub pool: PoolConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Per-request deadline; the OCR call is cancelled when it expires
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// OCR.space request parameters
#[derive(Debug, Deserialize)]
pub struct OcrConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_engine")]
    pub engine: u8,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            language: default_language(),
            engine: default_engine(),
        }
    }
}

/// Which selection policy backs the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Durable records, soonest-expiring eligible key first
    LeastUsed,
    /// In-process key list, no accounting
    RoundRobin,
}

/// Key pool settings
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    pub strategy: Strategy,
    /// Credential records file (least_used)
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,
    /// File holding a delimited key list (round_robin, alternative to OCR_API_KEYS)
    #[serde(default)]
    pub api_keys_file: Option<PathBuf>,
    #[serde(skip)]
    pub api_keys: Option<Secret<String>>,
}

fn default_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    256
}

fn default_endpoint() -> String {
    DEFAULT_OCR_ENDPOINT.to_string()
}

fn default_language() -> String {
    "eng".to_string()
}

fn default_engine() -> u8 {
    2
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Round-robin key list resolution order:
    /// 1. OCR_API_KEYS env var
    /// 2. api_keys_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if config.pool.strategy == Strategy::RoundRobin {
            config.pool.api_keys = resolve_api_keys(config.pool.api_keys_file.as_deref())?;
            if config.pool.api_keys.is_none() && config.pool.api_keys_file.is_none() {
                return Err(common::Error::Config(format!(
                    "round_robin strategy needs {API_KEYS_ENV} or pool.api_keys_file"
                )));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.ocr.endpoint.starts_with("http://") && !self.ocr.endpoint.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "ocr.endpoint must start with http:// or https://, got: {}",
                self.ocr.endpoint
            )));
        }

        if !(1..=3).contains(&self.ocr.engine) {
            return Err(common::Error::Config(format!(
                "ocr.engine must be 1, 2 or 3, got: {}",
                self.ocr.engine
            )));
        }

        if self.server.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.pool.strategy == Strategy::LeastUsed && self.pool.credentials_path.is_none() {
            return Err(common::Error::Config(
                "least_used strategy needs pool.credentials_path".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("ocr-gateway.toml")
    }
}

/// Env var wins over the file. A file with only whitespace yields `None`.
fn resolve_api_keys(key_file: Option<&Path>) -> common::Result<Option<Secret<String>>> {
    if let Ok(keys) = std::env::var(API_KEYS_ENV) {
        return Ok(Some(Secret::new(keys)));
    }
    let Some(key_file) = key_file else {
        return Ok(None);
    };
    let keys = std::fs::read_to_string(key_file).map_err(|e| {
        common::Error::Config(format!(
            "failed to read api_keys_file {}: {e}",
            key_file.display()
        ))
    })?;
    let keys = keys.trim().to_owned();
    Ok((!keys.is_empty()).then(|| Secret::new(keys)))
}
