//! Browser engines.

use async_trait::async_trait;

use super::{BrowserEngine, BrowserSession};
use crate::error_handling::SourceError;

/// Engine used when browser automation is compiled out or not configured.
/// Every session request fails with `EngineUnavailable`.
#[derive(Debug, Clone)]
pub struct UnavailableEngine {
    reason: String,
}

impl UnavailableEngine {
    pub fn new(reason: impl Into<String>) -> Self {
        UnavailableEngine {
            reason: reason.into(),
        }
    }
}

impl Default for UnavailableEngine {
    fn default() -> Self {
        Self::new("browser automation is not enabled in this build")
    }
}

#[async_trait]
impl BrowserEngine for UnavailableEngine {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, SourceError> {
        Err(SourceError::EngineUnavailable(self.reason.clone()))
    }
}

#[cfg(feature = "browser")]
pub use chromium::ChromiumEngine;

#[cfg(feature = "browser")]
mod chromium {
    use std::path::PathBuf;
    use std::time::Duration;

    use async_trait::async_trait;
    use chromiumoxide::browser::{Browser, BrowserConfig};
    use chromiumoxide::error::CdpError;
    use chromiumoxide::Page;
    use futures::StreamExt;
    use tokio::task::JoinHandle;

    use super::super::{BrowserEngine, BrowserSession};
    use crate::error_handling::SourceError;

    /// Headless Chrome/Chromium through the DevTools protocol.
    ///
    /// Each session launches its own browser process and tears it down on
    /// `close`.
    #[derive(Debug, Clone, Default)]
    pub struct ChromiumEngine {
        executable: Option<PathBuf>,
    }

    impl ChromiumEngine {
        /// `executable` of `None` lets chromiumoxide auto-detect an installed
        /// browser.
        pub fn new(executable: Option<PathBuf>) -> Self {
            ChromiumEngine { executable }
        }
    }

    #[async_trait]
    impl BrowserEngine for ChromiumEngine {
        async fn open_session(&self) -> Result<Box<dyn BrowserSession>, SourceError> {
            let mut builder = BrowserConfig::builder();
            if let Some(path) = &self.executable {
                builder = builder.chrome_executable(path);
            }
            // fails when no executable can be located
            let config = builder.build().map_err(SourceError::EngineUnavailable)?;

            let (browser, mut handler) = Browser::launch(config)
                .await
                .map_err(|e| SourceError::EngineUnavailable(format!("failed to launch browser: {e}")))?;
            let events = tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if event.is_err() {
                        break;
                    }
                }
            });

            let page = match browser.new_page("about:blank").await {
                Ok(page) => page,
                Err(e) => {
                    let mut session = ChromiumSession {
                        browser,
                        page: None,
                        events,
                        closed: false,
                    };
                    session.close().await;
                    return Err(SourceError::EngineUnavailable(format!("failed to open page: {e}")));
                }
            };

            Ok(Box::new(ChromiumSession {
                browser,
                page: Some(page),
                events,
                closed: false,
            }))
        }
    }

    /// A lost DevTools connection means the engine is gone; anything else is
    /// a problem with the page itself.
    fn page_load_error(e: CdpError) -> SourceError {
        match e {
            CdpError::Ws(_) | CdpError::Io(_) | CdpError::NoResponse | CdpError::ChannelSendError(_) => {
                SourceError::EngineUnavailable(format!("browser connection lost: {e}"))
            }
            other => SourceError::ExtractionFailed(format!("page load failed: {other}")),
        }
    }

    struct ChromiumSession {
        browser: Browser,
        page: Option<Page>,
        events: JoinHandle<()>,
        closed: bool,
    }

    #[async_trait]
    impl BrowserSession for ChromiumSession {
        async fn render(&mut self, url: &str, timeout: Duration) -> Result<String, SourceError> {
            let page = self
                .page
                .as_ref()
                .ok_or_else(|| SourceError::EngineUnavailable("session has no page".into()))?;
            let load = async {
                page.goto(url).await?;
                page.wait_for_navigation().await?;
                page.content().await
            };
            match tokio::time::timeout(timeout, load).await {
                Ok(Ok(html)) => Ok(html),
                Ok(Err(e)) => Err(page_load_error(e)),
                Err(_) => Err(SourceError::Timeout(timeout)),
            }
        }

        async fn close(&mut self) {
            if self.closed {
                return;
            }
            self.closed = true;
            if let Some(page) = self.page.take() {
                if let Err(e) = page.close().await {
                    log::warn!("Failed to close browser page: {e}");
                }
            }
            if let Err(e) = self.browser.close().await {
                log::warn!("Failed to close browser: {e}");
            }
            if let Err(e) = self.browser.wait().await {
                log::debug!("Browser process did not exit cleanly: {e}");
            }
            self.events.abort();
        }
    }

}
