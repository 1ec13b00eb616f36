use crate::api::DEFAULT_TIMEOUT;
use crate::controller::{DEFAULT_REFERENCE_TTL, DEFAULT_SELECTION_TTL};
use crate::errors::ConfigError;
use crate::orchestrator::DEFAULT_DEBOUNCE;
use std::{env, path::PathBuf, time::Duration};
use url::Url;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_CACHE_PATH: &str = "data/cache.json";

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardConfig {
    pub api_url: Url,
    /// Namespaces every cache key.
    pub host: String,
    pub cache_path: PathBuf,
    /// Initial query string, as if the page was opened with it.
    pub query: String,
    pub debounce: Duration,
    pub timeout: Duration,
    pub selection_ttl: Duration,
    pub reference_ttl: Duration,
}

impl DashboardConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_url = Url::parse(
            &lookup("DASHBOARD_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_owned()),
        )?;
        let host = lookup("DASHBOARD_HOST").unwrap_or_else(|| host_of(&api_url));
        let cache_path = lookup("DASHBOARD_CACHE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_PATH));
        let query = lookup("DASHBOARD_QUERY")
            .map(|query| query.trim_start_matches('?').to_owned())
            .unwrap_or_default();

        Ok(Self {
            api_url,
            host,
            cache_path,
            query,
            debounce: millis(&lookup, "DASHBOARD_DEBOUNCE_MS", DEFAULT_DEBOUNCE)?,
            timeout: millis(&lookup, "DASHBOARD_TIMEOUT_MS", DEFAULT_TIMEOUT)?,
            selection_ttl: millis(&lookup, "DASHBOARD_SELECTION_TTL_MS", DEFAULT_SELECTION_TTL)?,
            reference_ttl: millis(&lookup, "DASHBOARD_REFERENCE_TTL_MS", DEFAULT_REFERENCE_TTL)?,
        })
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn host_of(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_owned(),
        (None, _) => String::new(),
    }
}
