//! HTTP client initialization.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::ClientBuilder;

use crate::config::RemoteConfig;

/// Builds the HTTP client used by the remote adapter.
///
/// Sets the request timeout and user agent from `RemoteConfig` and asks for
/// JSON by default. Credentials are attached per request, not here.
///
/// # Errors
///
/// Returns a `reqwest::Error` if client creation fails.
pub fn init_client(config: &RemoteConfig) -> Result<Arc<reqwest::Client>, reqwest::Error> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    let client = ClientBuilder::new()
        .timeout(config.request_timeout)
        .user_agent(config.user_agent.clone())
        .default_headers(headers)
        .build()?;
    Ok(Arc::new(client))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_client_with_defaults() {
        let client = init_client(&RemoteConfig::default());
        assert!(client.is_ok());
    }
}
