use super::{ControlRequest, ControlResponse, HttpTransport, TransportError};
use crate::cache::{CachableEndpoint, MemoryCache, PathCacheController};
use crate::config::HttpSettings;
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;
use url::Url;

/// `reqwest`-backed transport with a path-based response cache in front.
pub struct CachingHttpClient {
    client: reqwest::Client,
    base_url: Url,
    retries: u32,
    cache: PathCacheController,
}

impl CachingHttpClient {
    pub fn new(base_url: &str, settings: &HttpSettings) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| TransportError::InvalidUrl(format!("{base_url}: {e}")))?;

        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(!settings.verify_tls)
            .pool_idle_timeout(Some(Duration::from_secs(90)));

        match settings.timeout {
            Some(timeout) => {
                tracing::info!(timeout_secs = timeout.as_secs_f64(), "HTTP timeout set");
                builder = builder.timeout(timeout);
            }
            None => tracing::info!("HTTP timeout disabled"),
        }

        if settings.keep_alive {
            tracing::debug!("HTTP keep-alive is set to default");
        } else {
            // Reopen the connection on every request.
            tracing::info!("HTTP keep-alive disabled");
            builder = builder.pool_max_idle_per_host(0);
        }

        let client = builder.build().map_err(TransportError::Http)?;

        Ok(Self {
            client,
            base_url,
            retries: settings.retries,
            cache: PathCacheController::new(
                Box::new(MemoryCache::new(settings.cache_capacity)),
                settings.cache_ttl,
            ),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn cache(&self) -> &PathCacheController {
        &self.cache
    }

    fn url_for(&self, path: &str) -> Result<Url> {
        let joined = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Ok(Url::parse(&joined).map_err(|e| TransportError::InvalidUrl(format!("{joined}: {e}")))?)
    }

    async fn execute(&self, request: &ControlRequest) -> Result<ControlResponse> {
        let url = self.url_for(&request.path)?;
        let mut attempt = 0u32;
        loop {
            let mut req = self
                .client
                .request(request.method.to_reqwest(), url.clone());
            for (name, value) in &request.headers {
                req = req.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &request.body {
                req = req.json(body);
            }
            if let Some(timeout) = request.timeout {
                req = req.timeout(timeout);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.bytes().await.map_err(TransportError::Http)?;
                    return Ok(ControlResponse::new(status, body));
                }
                Err(e) if e.is_connect() && attempt < self.retries => {
                    attempt += 1;
                    tracing::debug!(
                        url = %url,
                        attempt,
                        error = %e,
                        "connection failed, retrying"
                    );
                }
                Err(e) => return Err(TransportError::Http(e).into()),
            }
        }
    }
}

#[async_trait]
impl HttpTransport for CachingHttpClient {
    async fn send(&self, request: ControlRequest) -> Result<ControlResponse> {
        let key = if request.cache.reads() || request.cache.writes() {
            self.cache.cache_key(&request)
        } else {
            None
        };

        if let (Some(key), true) = (&key, request.cache.reads()) {
            if let Some(hit) = self.cache.lookup(key).await {
                tracing::debug!(path = %request.path, "served from cache");
                return Ok(hit);
            }
        }

        let response = self.execute(&request).await?;

        if let (Some(key), true) = (&key, request.cache.writes()) {
            self.cache.store(key, &response).await;
        }
        Ok(response)
    }

    fn register_cachable(&self, endpoint: CachableEndpoint, update: bool) {
        self.cache.register_cachable(endpoint, update);
    }
}
