//! Browser-Automation Source Adapter.
//!
//! Last resort for data the remote service does not have: render the county's
//! public parcel page in a headless browser and extract records with CSS
//! selectors. Each call opens one short-lived session and closes it on every
//! exit path, including when the calling future is dropped.

mod engine;
pub mod extract;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ScrapeConfig;
use crate::error_handling::SourceError;
use crate::models::{Apn, DataKind, NormalizedPayload};

#[cfg(feature = "browser")]
pub use engine::ChromiumEngine;
pub use engine::UnavailableEngine;

/// Something that can open browser sessions.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    /// Opens a fresh session. Fails with `EngineUnavailable` when no browser
    /// can be started.
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, SourceError>;
}

/// One isolated browser context.
#[async_trait]
pub trait BrowserSession: Send {
    /// Loads `url` and returns the rendered HTML, giving up after `timeout`.
    async fn render(&mut self, url: &str, timeout: Duration) -> Result<String, SourceError>;

    /// Releases the session. Calling it twice is a no-op.
    async fn close(&mut self);
}

/// Closes the wrapped session when dropped without an explicit `close`.
struct SessionGuard {
    session: Option<Box<dyn BrowserSession>>,
}

impl SessionGuard {
    fn new(session: Box<dyn BrowserSession>) -> Self {
        SessionGuard {
            session: Some(session),
        }
    }

    async fn render(&mut self, url: &str, timeout: Duration) -> Result<String, SourceError> {
        match self.session.as_mut() {
            Some(session) => session.render(url, timeout).await,
            None => Err(SourceError::EngineUnavailable("session already closed".into())),
        }
    }

    async fn close(mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        session.close().await;
                        log::trace!("Browser session closed after drop");
                    });
                }
                Err(_) => log::warn!("Browser session dropped outside a runtime; not closed"),
            }
        }
    }
}

/// The browser-automation adapter.
pub struct BrowserSource {
    config: ScrapeConfig,
    engine: Arc<dyn BrowserEngine>,
}

impl BrowserSource {
    pub fn new(config: ScrapeConfig, engine: Arc<dyn BrowserEngine>) -> Self {
        BrowserSource { config, engine }
    }

    pub fn config(&self) -> &ScrapeConfig {
        &self.config
    }

    /// The page URL for `apn`.
    pub fn page_url(&self, apn: &Apn) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(apn.as_str().as_bytes()).collect();
        self.config.url_template.replace("{apn}", &encoded)
    }

    /// Renders the parcel page and extracts `kind` from it.
    pub async fn scrape(&self, apn: &Apn, kind: DataKind) -> Result<NormalizedPayload, SourceError> {
        let url = self.page_url(apn);
        let session = self.engine.open_session().await?;
        let mut guard = SessionGuard::new(session);

        log::debug!("Rendering {url} for {kind} of {apn}");
        let rendered = guard.render(&url, self.config.page_timeout).await;
        guard.close().await;

        let html = rendered.inspect_err(|e| log::info!("Browser load of {url} failed: {e}"))?;
        let payload = extract::extract(&html, apn, kind, &self.config.rules)?;
        log::debug!("Scraped {} {kind} rows for {apn}", payload.row_count());
        Ok(payload)
    }
}
