//! Cached, rate-limited, retrying dispatch of generation requests.

use async_stream::try_stream;
use futures::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheStore, FileCache};
use crate::factory::{AdapterFactory, AdapterSet};
use crate::provider::ProviderAdapter;
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryPolicy;
use crate::sse_stream::EventLineStreamExt;
use crate::types::GatewayConfig;
use crate::{CacheKey, Error, RequestSpec};

/// A single-pass sequence of text deltas.
pub type DeltaStream = BoxStream<'static, Result<String, Error>>;

/// Service context owning the worker pool, rate limiter, cache and adapters.
///
/// Construct once and share by reference (or clone; clones share all state).
#[derive(Clone)]
pub struct Gateway {
    client: Client,
    adapters: AdapterSet,
    cache: Arc<dyn CacheStore>,
    limiter: Arc<RateLimiter>,
    pool: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        adapters: AdapterSet,
        cache: Arc<dyn CacheStore>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            adapters,
            cache,
            limiter: Arc::new(RateLimiter::new(config.rate_limit)),
            pool: Arc::new(Semaphore::new(config.concurrency)),
            retry: config.retry,
        })
    }

    /// Gateway with environment configuration, environment credentials and a
    /// file cache in the configured directory.
    pub fn from_env() -> Result<Self, Error> {
        let config = GatewayConfig::from_env()?;
        let cache = Arc::new(FileCache::new(config.cache_dir.clone()));
        Self::new(config, AdapterFactory::from_env(), cache)
    }

    /// Replace the HTTP client, e.g. to configure transport timeouts.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Worker-pool slots not currently held by a task.
    pub fn available_slots(&self) -> usize {
        self.pool.available_permits()
    }

    /// Generate the complete text for `spec`, served from cache when possible.
    pub async fn complete(&self, spec: &RequestSpec) -> Result<String, Error> {
        spec.validate()?;
        let adapter = self.adapters.get(spec.provider)?;
        let key = spec.cache_key();

        if let Some(text) = self.cached(&key).await {
            return Ok(text);
        }

        let task_id = Uuid::new_v4();
        let _slot = self.acquire_slot().await?;
        let response = self.send(adapter.as_ref(), spec, false, task_id).await?;
        let body = response.text().await?;
        let text = adapter.parse_completion(&body)?;

        info!(%task_id, provider = %spec.provider, chars = text.len(), "Completion finished");
        store(self.cache.as_ref(), &key, &text).await;
        Ok(text)
    }

    /// Generate `spec` as a stream of text deltas.
    ///
    /// A cache hit replays the stored text as one delta. Otherwise the full
    /// text is cached once the stream is exhausted; a stream dropped early,
    /// ended by a transport error or by a provider error event leaves the
    /// cache untouched. The worker-pool
    /// slot is held until the stream ends or is dropped.
    pub async fn stream(&self, spec: &RequestSpec) -> Result<DeltaStream, Error> {
        spec.validate()?;
        let adapter = self.adapters.get(spec.provider)?;
        let key = spec.cache_key();

        if let Some(text) = self.cached(&key).await {
            return Ok(stream::once(async move { Ok(text) }).boxed());
        }

        let task_id = Uuid::new_v4();
        let slot = self.acquire_slot().await?;
        let response = self.send(adapter.as_ref(), spec, true, task_id).await?;
        let mut lines = response.bytes_stream().event_lines();
        let cache = Arc::clone(&self.cache);
        let provider = spec.provider;

        let deltas = try_stream! {
            let _slot = slot;
            let mut full_text = String::new();

            while let Some(line) = lines.next().await {
                let line = line?;
                match adapter.parse_delta(&line) {
                    Ok(Some(delta)) => {
                        full_text.push_str(&delta);
                        yield delta;
                    }
                    Ok(None) => {}
                    Err(Error::MalformedEvent(reason)) => {
                        warn!(%task_id, %provider, "Skipping unparseable event line: {reason}");
                    }
                    Err(e) => {
                        error!(%task_id, %provider, "Stream aborted by provider: {e}");
                        Err::<(), _>(e)?;
                    }
                }
            }

            info!(%task_id, %provider, chars = full_text.len(), "Stream finished");
            store(cache.as_ref(), &key, &full_text).await;
        };

        Ok(deltas.boxed())
    }

    async fn cached(&self, key: &CacheKey) -> Option<String> {
        match self.cache.get(key).await {
            Ok(Some(text)) if !text.is_empty() => {
                debug!(%key, "Cache hit");
                Some(text)
            }
            Ok(_) => {
                debug!(%key, "Cache miss");
                None
            }
            Err(e) => {
                warn!(%key, "Treating unreadable cache entry as a miss: {e}");
                None
            }
        }
    }

    /// Wait for a free worker-pool slot; waiters are served in FIFO order.
    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, Error> {
        Arc::clone(&self.pool)
            .acquire_owned()
            .await
            .map_err(|_| Error::config("worker pool has been closed"))
    }

    /// Send one call, retrying rate-limit responses with exponential backoff.
    async fn send(
        &self,
        adapter: &dyn ProviderAdapter,
        spec: &RequestSpec,
        streaming: bool,
        task_id: Uuid,
    ) -> Result<reqwest::Response, Error> {
        let request = adapter.build_request(spec, streaming)?;
        let body = serde_json::to_vec(&request.body)?;
        let provider = adapter.kind();
        let mut attempt = 0;

        loop {
            self.limiter.acquire().await;
            info!(%task_id, %provider, attempt, streaming, "Dispatching provider call");

            let mut builder = self.client.post(&request.url).body(body.clone());
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let response = builder.send().await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                match self.retry.backoff(attempt) {
                    Some(delay) => {
                        warn!(%task_id, %provider, attempt, ?delay, "Rate limited, backing off");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    None => {
                        error!(%task_id, %provider, "Rate limit persisted past retry budget");
                        return Err(Error::RateLimitExhausted {
                            provider: provider.name().to_string(),
                            attempts: attempt + 1,
                        });
                    }
                }
            }

            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                error!(%task_id, %provider, status = status.as_u16(), "Provider call failed");
                return Err(Error::transport(provider.name(), status.as_u16(), message));
            }

            return Ok(response);
        }
    }
}

/// Best-effort cache write; failures are logged, never surfaced.
async fn store(cache: &dyn CacheStore, key: &CacheKey, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Err(e) = cache.put(key, text).await {
        warn!(%key, "Failed to write cache entry: {e}");
    }
}
