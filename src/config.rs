use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::DatasetId;
use crate::error::IngestError;
use crate::remote::DEFAULT_BASE_URL;
use crate::section::{DEFAULT_MAX_SECTION_BYTES, ParserLimits};

pub const CONFIG_FILE_NAME: &str = "geo-ingest.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub workspace: Option<Utf8PathBuf>,
    #[serde(default)]
    pub remote_base_url: Option<String>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<usize>,
    #[serde(default)]
    pub lock_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_section_bytes: Option<usize>,
    #[serde(default)]
    pub datasets: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub workspace: Utf8PathBuf,
    pub remote_base_url: String,
    pub http_timeout: Duration,
    pub max_retries: usize,
    pub lock_timeout: Duration,
    pub limits: ParserLimits,
    pub datasets: Vec<DatasetId>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            workspace: Utf8PathBuf::from("."),
            remote_base_url: DEFAULT_BASE_URL.to_string(),
            http_timeout: Duration::from_secs(60),
            max_retries: 3,
            lock_timeout: Duration::ZERO,
            limits: ParserLimits::default(),
            datasets: Vec::new(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// An explicit path must exist. Without one, `./geo-ingest.json` and then
    /// the user config directory are tried before falling back to defaults.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, IngestError> {
        let config_path = match path {
            Some(path) => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    return Err(IngestError::MissingConfig(path));
                }
                Some(path)
            }
            None => Self::discover(),
        };

        let Some(config_path) = config_path else {
            return Self::resolve_config(Config::default());
        };
        tracing::debug!(path = %config_path.display(), "loading config");
        let content = fs::read_to_string(&config_path)
            .map_err(|_| IngestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| IngestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        BaseDirs::new()
            .map(|dirs| dirs.config_dir().join("geo-ingest").join("config.json"))
            .filter(|path| path.exists())
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, IngestError> {
        let defaults = ResolvedConfig::default();
        let datasets = config
            .datasets
            .iter()
            .map(|value| value.parse())
            .collect::<Result<Vec<DatasetId>, IngestError>>()?;

        if config.max_section_bytes == Some(0) {
            return Err(IngestError::ConfigParse(
                "max_section_bytes must be positive".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(defaults.schema_version),
            workspace: config.workspace.unwrap_or(defaults.workspace),
            remote_base_url: config
                .remote_base_url
                .unwrap_or(defaults.remote_base_url),
            http_timeout: config
                .http_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            max_retries: config.max_retries.unwrap_or(defaults.max_retries),
            lock_timeout: config
                .lock_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_timeout),
            limits: ParserLimits {
                max_section_bytes: config
                    .max_section_bytes
                    .unwrap_or(DEFAULT_MAX_SECTION_BYTES),
            },
            datasets,
        })
    }
}
