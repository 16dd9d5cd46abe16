use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::store::{StoreError, default_db_path};
use crate::sync::DEFAULT_REFRESH_COOLDOWN;

const DEFAULT_API_BASE_URL: &str = "http://localhost:3000";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_PROBE_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {name}: {source}")]
    Url {
        name: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("offline database path unavailable: {0}")]
    DbPath(#[from] StoreError),
}

#[derive(Clone, Debug)]
pub struct OfflineConfig {
    pub api_base_url: Url,
    pub db_path: PathBuf,
    pub request_timeout: Duration,
    pub refresh_cooldown: Duration,
    pub probe_url: Option<Url>,
    pub probe_interval: Duration,
    pub token: Option<String>,
}

impl OfflineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source, e.g. a map in tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_base_url = match read_url(&lookup, "REVALID_API_BASE_URL")? {
            Some(url) => url,
            None => Url::parse(DEFAULT_API_BASE_URL).map_err(|source| ConfigError::Url {
                name: "REVALID_API_BASE_URL",
                source,
            })?,
        };
        let db_path = match non_empty(&lookup, "REVALID_DB_PATH") {
            Some(value) => PathBuf::from(value),
            None => default_db_path()?,
        };
        let request_timeout = Duration::from_millis(read_u64(
            &lookup,
            "REVALID_REQUEST_TIMEOUT_MS",
            DEFAULT_REQUEST_TIMEOUT_MS,
        ));
        let refresh_cooldown = Duration::from_secs(read_u64(
            &lookup,
            "REVALID_REFRESH_COOLDOWN_SECS",
            DEFAULT_REFRESH_COOLDOWN.as_secs(),
        ));
        let probe_url = read_url(&lookup, "REVALID_PROBE_URL")?;
        let probe_interval = Duration::from_secs(read_u64(
            &lookup,
            "REVALID_PROBE_INTERVAL_SECS",
            DEFAULT_PROBE_INTERVAL_SECS,
        ));
        let token = non_empty(&lookup, "REVALID_TOKEN");

        Ok(Self {
            api_base_url,
            db_path,
            request_timeout,
            refresh_cooldown,
            probe_url,
            probe_interval,
            token,
        })
    }
}

fn non_empty<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(lookup, name)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_url<F>(lookup: &F, name: &'static str) -> Result<Option<Url>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(lookup, name)
        .map(|value| Url::parse(&value).map_err(|source| ConfigError::Url { name, source }))
        .transpose()
}
