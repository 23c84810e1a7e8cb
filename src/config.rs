use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::descriptor::DescriptorLoader;
use crate::domain::RunMode;
use crate::error::MirrorError;
use crate::pool::PoolSettings;
use crate::task::ToolTable;

pub const DEFAULT_CONFIG: &str = "kira-mirror.json";
const DEFAULT_TASK_DELAY_MS: u64 = 1000;
const DEFAULT_PROTOCOL_DELAY_MS: u64 = 1000;
const DEFAULT_PROTOCOL_RETRY: u32 = 3;
const DEFAULT_WORKERS: usize = 2;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub descriptors: Vec<String>,
    #[serde(default)]
    pub descriptor_dir: Option<String>,
    #[serde(default)]
    pub production_dir: Option<String>,
    #[serde(default)]
    pub mode: Option<RunMode>,
    #[serde(default)]
    pub info_output: Option<String>,
    #[serde(default)]
    pub task_delay_ms: Option<u64>,
    #[serde(default)]
    pub protocol_delay_ms: Option<u64>,
    #[serde(default)]
    pub protocol_retry: Option<u32>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub tools: HashMap<String, String>,
    #[serde(default)]
    pub notify: Option<NotifySettings>,
}

/// Mail notification parameters. Delivery is left to the operator's tooling;
/// the run only logs what would be sent.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct NotifySettings {
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default)]
    pub on_error_only: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub descriptors: Vec<PathBuf>,
    pub descriptor_dir: PathBuf,
    pub production_dir: Option<Utf8PathBuf>,
    pub mode: RunMode,
    pub info_output: Option<PathBuf>,
    pub task_delay: Duration,
    pub protocol_delay: Duration,
    pub protocol_retry: u32,
    pub pool: PoolSettings,
    pub tools: ToolTable,
    pub notify: Option<NotifySettings>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, MirrorError> {
        Self::resolve_config(Self::load(path)?)
    }

    /// Reads the batch file without validating it.
    pub fn load(path: Option<&str>) -> Result<Config, MirrorError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG),
        };

        if path.is_none() && !config_path.exists() {
            return Err(MirrorError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| MirrorError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| MirrorError::ConfigParse(err.to_string()))
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, MirrorError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let mode = config.mode.unwrap_or_default();

        let descriptor_dir = match config.descriptor_dir {
            Some(dir) => PathBuf::from(dir),
            None => default_descriptor_dir()?,
        };
        if config.descriptors.is_empty() {
            return Err(MirrorError::ConfigParse("no descriptors listed".to_string()));
        }
        let descriptors = config
            .descriptors
            .iter()
            .map(|entry| DescriptorLoader::locate(&descriptor_dir, entry))
            .collect();

        let production_dir = config.production_dir.map(Utf8PathBuf::from);
        if mode == RunMode::Download && production_dir.is_none() {
            return Err(MirrorError::ConfigParse(
                "production_dir is required in download mode".to_string(),
            ));
        }

        let protocol_retry = config.protocol_retry.unwrap_or(DEFAULT_PROTOCOL_RETRY);
        let protocol_delay =
            Duration::from_millis(config.protocol_delay_ms.unwrap_or(DEFAULT_PROTOCOL_DELAY_MS));
        let workers = config.workers.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(MirrorError::ConfigParse("workers must be at least 1".to_string()));
        }

        Ok(ResolvedConfig {
            schema_version,
            descriptors,
            descriptor_dir,
            production_dir,
            mode,
            info_output: config.info_output.map(PathBuf::from),
            task_delay: Duration::from_millis(config.task_delay_ms.unwrap_or(DEFAULT_TASK_DELAY_MS)),
            protocol_delay,
            protocol_retry,
            pool: PoolSettings {
                workers,
                retries: protocol_retry,
                delay: protocol_delay,
            },
            tools: ToolTable::new(
                config
                    .tools
                    .into_iter()
                    .map(|(name, path)| (name, PathBuf::from(path)))
                    .collect(),
            ),
            notify: config.notify,
        })
    }
}

/// `<user config dir>/kira-mirror/descriptors`.
pub fn default_descriptor_dir() -> Result<PathBuf, MirrorError> {
    BaseDirs::new()
        .map(|dirs| dirs.config_dir().join("kira-mirror").join("descriptors"))
        .ok_or_else(|| MirrorError::ConfigParse("unable to resolve config directory".to_string()))
}
