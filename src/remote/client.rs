use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::normalize::normalize;
use super::RemoteSource;
use crate::adaptive_rate_limiter::{AdaptiveRateLimiter, AdaptiveSettings};
use crate::config::{RemoteConfig, HTTP_STATUS_TOO_MANY_REQUESTS};
use crate::error_handling::{
    classify_reqwest_error, classify_status, parse_retry_after, BackoffPolicy, ConstructionError,
    InitializationError, SourceError,
};
use crate::initialization::{init_client, init_rate_limiter, RateLimiter};
use crate::models::{Apn, DataKind, NormalizedPayload};

/// How often the adaptive limiter re-evaluates the provider's health.
const ADAPTIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Throttling pieces shared by every request of one adapter.
struct Throttle {
    bucket: Arc<RateLimiter>,
    adaptive: Arc<AdaptiveRateLimiter>,
    shutdown: CancellationToken,
}

/// `RemoteSource` backed by the county JSON service.
///
/// Endpoints, relative to `base_url`:
/// - `GET /parcels/{apn}` for the property
/// - `GET /parcels/{apn}/tax-history`
/// - `GET /parcels/{apn}/sales-history` (only when `supports_sales`)
pub struct HttpRemoteSource {
    config: RemoteConfig,
    client: Arc<reqwest::Client>,
    backoff: BackoffPolicy,
    throttle: Option<Throttle>,
}

impl HttpRemoteSource {
    /// Builds an unthrottled adapter. Use `with_rate_limit` to add the token
    /// bucket.
    pub fn new(config: RemoteConfig, backoff: BackoffPolicy) -> Result<Self, InitializationError> {
        let client = init_client(&config)?;
        Ok(HttpRemoteSource {
            config,
            client,
            backoff,
            throttle: None,
        })
    }

    /// Adds a token bucket at `rps` with `burst` capacity, steered by an
    /// adaptive limiter that backs off when 429s or timeouts exceed
    /// `error_threshold`. Must be called inside a Tokio runtime.
    pub fn with_rate_limit(mut self, rps: u32, burst: usize, error_threshold: f64) -> Self {
        if let Some(old) = self.throttle.take() {
            old.shutdown.cancel();
        }
        if let Some((bucket, shutdown)) = init_rate_limiter(rps, burst) {
            let adaptive = Arc::new(AdaptiveRateLimiter::new(
                rps,
                AdaptiveSettings::capped_at(rps, error_threshold),
            ));
            adaptive.spawn_adjuster(Arc::clone(&bucket), ADAPTIVE_INTERVAL, shutdown.clone());
            log::info!("Remote requests limited to {rps} rps (burst {burst})");
            self.throttle = Some(Throttle {
                bucket,
                adaptive,
                shutdown,
            });
        }
        self
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Stops the background throttling tasks.
    pub fn shutdown(&self) {
        if let Some(throttle) = &self.throttle {
            throttle.shutdown.cancel();
        }
    }

    fn endpoint(&self, apn: &Apn, kind: DataKind) -> Result<Url, SourceError> {
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|e| SourceError::Malformed(format!("invalid base URL: {e}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| SourceError::Malformed("base URL cannot carry a path".into()))?;
            segments.pop_if_empty().push("parcels").push(apn.as_str());
            match kind {
                DataKind::Property => {}
                DataKind::Tax => {
                    segments.push("tax-history");
                }
                DataKind::Sales => {
                    segments.push("sales-history");
                }
            }
        }
        Ok(url)
    }

    /// One HTTP round trip, classified.
    async fn attempt(&self, url: &Url, apn: &Apn, kind: DataKind) -> Result<NormalizedPayload, SourceError> {
        if let Some(throttle) = &self.throttle {
            throttle.bucket.acquire().await;
        }

        let response = match self
            .client
            .get(url.clone())
            .bearer_auth(&self.config.api_token)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let error = classify_reqwest_error(&e);
                if error.is_retriable() {
                    self.note_degraded();
                }
                log::debug!("GET {url} failed: {e}");
                return Err(error);
            }
        };

        let status = response.status().as_u16();
        if let Some(error) = classify_status(status, parse_retry_after(response.headers())) {
            match status {
                HTTP_STATUS_TOO_MANY_REQUESTS => self.note_throttled(),
                500..=599 => self.note_degraded(),
                _ => {}
            }
            log::debug!("GET {url} returned {status}");
            return Err(error);
        }
        self.note_success();

        let body = response.text().await.map_err(|e| classify_reqwest_error(&e))?;
        if body.trim().is_empty() {
            return Err(SourceError::NotFound);
        }
        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| SourceError::Malformed(format!("{kind} body is not JSON: {e}")))?;
        normalize(apn, kind, value)
    }

    fn note_success(&self) {
        if let Some(throttle) = &self.throttle {
            throttle.adaptive.record_success();
        }
    }

    fn note_throttled(&self) {
        if let Some(throttle) = &self.throttle {
            throttle.adaptive.record_throttled();
        }
    }

    fn note_degraded(&self) {
        if let Some(throttle) = &self.throttle {
            throttle.adaptive.record_degraded();
        }
    }
}

#[async_trait]
impl RemoteSource for HttpRemoteSource {
    async fn fetch(&self, apn: &Apn, kind: DataKind) -> Result<NormalizedPayload, SourceError> {
        if !self.supports(kind) {
            return Err(SourceError::Unsupported(kind));
        }
        if self.config.api_token.trim().is_empty() {
            return Err(SourceError::Unauthorized);
        }
        let url = self.endpoint(apn, kind)?;

        let outcome = self.backoff.run(|| self.attempt(&url, apn, kind)).await;
        match &outcome.result {
            Ok(payload) => log::debug!(
                "Remote {kind} for {apn}: {} rows after {} attempt(s)",
                payload.row_count(),
                outcome.attempts
            ),
            Err(e) => log::info!(
                "Remote {kind} for {apn} failed after {} attempt(s): {e}",
                outcome.attempts
            ),
        }
        outcome.result
    }

    fn supports(&self, kind: DataKind) -> bool {
        match kind {
            DataKind::Property | DataKind::Tax => true,
            DataKind::Sales => self.config.supports_sales,
        }
    }

    fn validate(&self) -> Result<(), ConstructionError> {
        let url = Url::parse(&self.config.base_url).map_err(|e| {
            ConstructionError::InvalidRemoteSource(format!(
                "base URL {:?} is invalid: {e}",
                self.config.base_url
            ))
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
            return Err(ConstructionError::InvalidRemoteSource(format!(
                "base URL {url} must be an http(s) URL"
            )));
        }
        if self.config.api_token.trim().is_empty() {
            return Err(ConstructionError::InvalidRemoteSource(
                "API token is empty".into(),
            ));
        }
        Ok(())
    }

    fn current_rps(&self) -> Option<u32> {
        self.throttle.as_ref().map(|t| t.bucket.current_rps())
    }
}

impl Drop for HttpRemoteSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}
