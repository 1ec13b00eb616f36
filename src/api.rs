use crate::errors::{ConfigError, FetchError};
use crate::models::Entity;
use crate::selection::Selection;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP producer for the analytics API. Every request carries the
/// client-level timeout.
#[derive(Debug, Clone)]
pub struct AnalyticsClient {
    http: Client,
    base: Url,
    timeout: Duration,
}

impl AnalyticsClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base,
            timeout,
        })
    }

    pub async fn websites(&self) -> Result<Vec<Entity>, FetchError> {
        let url = self.endpoint("api/websites")?;
        self.get_json(url).await
    }

    pub async fn query<T: DeserializeOwned>(
        &self,
        path: &str,
        selection: &Selection,
    ) -> Result<T, FetchError> {
        let url = self.query_url(path, selection)?;
        self.get_json(url).await
    }

    /// Selection fields become query pairs; empty values are left out.
    pub fn query_url(&self, path: &str, selection: &Selection) -> Result<Url, FetchError> {
        let mut url = self.endpoint(path)?;
        {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in selection.iter() {
                for param in value.to_params() {
                    pairs.append_pair(name, &param);
                }
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    fn endpoint(&self, path: &str) -> Result<Url, FetchError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|err| FetchError::network(format!("bad endpoint '{path}': {err}")))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, FetchError> {
        debug!(%url, "GET");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| self.classify(err))?;
        response.json::<T>().await.map_err(|err| self.classify(err))
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            warn!(timeout_ms = self.timeout.as_millis() as u64, "analytics request timed out");
            FetchError::Timeout(self.timeout)
        } else {
            warn!("analytics request failed: {err}");
            FetchError::network(err.to_string())
        }
    }
}
