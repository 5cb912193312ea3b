use std::{path::PathBuf, str::FromStr};

use serde::{de, Deserialize, Deserializer};

fn deserialize_loglevel<'de, D>(deserializer: D) -> Result<log::LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let level_str = String::deserialize(deserializer)?;
    log::LevelFilter::from_str(&level_str).map_err(de::Error::custom)
}

fn deserialize_batch_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let size = usize::deserialize(deserializer)?;
    if size == 0 {
        return Err(de::Error::custom("batch_size must be greater than 0"));
    }
    Ok(size)
}

fn default_loglevel() -> log::LevelFilter {
    log::LevelFilter::Info
}

fn default_batch_size() -> usize {
    500
}

/// Static informations we require to operate
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// An optional custom data directory
    pub data_dir: Option<PathBuf>,
    /// What messages to log
    #[serde(
        deserialize_with = "deserialize_loglevel",
        default = "default_loglevel"
    )]
    pub log_level: log::LevelFilter,
    /// The native currency the vault balance is tracked in
    pub currency: String,
    /// How many transaction hashes to query at once
    #[serde(
        deserialize_with = "deserialize_batch_size",
        default = "default_batch_size"
    )]
    pub batch_size: usize,
}

#[derive(PartialEq, Eq, Debug)]
pub enum ConfigError {
    DatadirNotFound,
    FileNotFound,
    ReadingFile(String),
    Unexpected(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self {
            Self::DatadirNotFound => write!(f, "Could not locate the configuration directory."),
            Self::FileNotFound => write!(f, "Could not locate the configuration file."),
            Self::ReadingFile(e) => write!(f, "Failed to read configuration file: {}", e),
            Self::Unexpected(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound,
            _ => Self::ReadingFile(e.to_string()),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Get the absolute path to the bridge ledger configuration folder.
///
/// It's a "BridgeLedger/" directory in the XDG standard configuration directory for all OSes but
/// Linux-based ones, for which it's `~/.bridge-ledger/`. The stores live in the same folder as
/// the configuration file unless `data_dir` is set.
pub fn config_folder_path() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    let configs_dir = dirs::home_dir();

    #[cfg(not(target_os = "linux"))]
    let configs_dir = dirs::config_dir();

    if let Some(mut path) = configs_dir {
        #[cfg(target_os = "linux")]
        path.push(".bridge-ledger");

        #[cfg(not(target_os = "linux"))]
        path.push("BridgeLedger");

        return Some(path);
    }

    None
}

fn config_file_path() -> Option<PathBuf> {
    config_folder_path().map(|mut path| {
        path.push("bridge-ledger.toml");
        path
    })
}

impl Config {
    /// Get our static configuration out of a mandatory configuration file.
    pub fn from_file(custom_path: Option<PathBuf>) -> Result<Config, ConfigError> {
        let config_file = match custom_path {
            Some(path) => path,
            None => config_file_path().ok_or(ConfigError::DatadirNotFound)?,
        };

        let config = toml::from_slice::<Config>(&std::fs::read(&config_file)?)
            .map_err(|e| ConfigError::ReadingFile(format!("Parsing configuration file: {}", e)))?;

        if config.currency.trim().is_empty() {
            return Err(ConfigError::Unexpected(
                "The currency can't be empty".to_string(),
            ));
        }

        Ok(config)
    }
}
