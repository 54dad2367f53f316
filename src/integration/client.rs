//! Base HTTP client for outbound integrations.

use crate::{Error, Result};
use serde::Serialize;
use std::time::Duration;

/// Outcome of an outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationResult<T> {
    /// The call succeeded
    Success(T),
    /// The target could not be reached or timed out
    Unavailable,
    /// The target answered with an error
    Error(String),
}

impl<T> IntegrationResult<T> {
    /// Check if the result is successful.
    pub fn is_success(&self) -> bool {
        matches!(self, IntegrationResult::Success(_))
    }

    /// Convert into a crate result, naming the service in the error.
    pub fn into_result(self, service: &str) -> Result<T> {
        match self {
            IntegrationResult::Success(v) => Ok(v),
            IntegrationResult::Unavailable => Err(Error::integration(service, "service unavailable")),
            IntegrationResult::Error(message) => Err(Error::integration(service, message)),
        }
    }
}

/// Shared HTTP client with a fixed timeout.
pub struct IntegrationClient {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl IntegrationClient {
    /// Create a client for a base URL.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::config_key(
                format!("'{}' is not an http(s) URL", base_url),
                "integrations.alert_webhook_url",
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("llm-metering-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::integration("http", format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            client,
        })
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// POST a JSON body, ignoring the response body.
    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> IntegrationResult<u16> {
        let url = format!("{}{}", self.base_url, path);

        match self.client.post(&url).json(body).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    IntegrationResult::Success(status.as_u16())
                } else {
                    IntegrationResult::Error(format!("HTTP error: {}", status))
                }
            }
            Err(e) => {
                if e.is_timeout() || e.is_connect() {
                    IntegrationResult::Unavailable
                } else {
                    IntegrationResult::Error(format!("Request failed: {}", e))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_http_url() {
        assert!(IntegrationClient::new("ftp://hooks", Duration::from_secs(1)).is_err());
        let client = IntegrationClient::new("https://hooks.example.com/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "https://hooks.example.com");
    }

    #[test]
    fn test_into_result() {
        assert_eq!(IntegrationResult::Success(200).into_result("hook").unwrap(), 200);
        assert!(matches!(
            IntegrationResult::<u16>::Unavailable.into_result("hook"),
            Err(Error::Integration { .. })
        ));
    }
}
