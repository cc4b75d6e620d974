// crates/memori/src/llm/http_client.rs
// Shared HTTP client for LLM providers with retry on transient failures

use std::time::Duration;

use reqwest::Client;
use tracing::warn;

use crate::error::{MemoriError, Result};

/// Maximum retry attempts for transient failures (429 / 5xx / transport)
const DEFAULT_MAX_ATTEMPTS: u32 = 2;
/// Base backoff between retries; doubles each attempt
const DEFAULT_BASE_BACKOFF_SECS: u64 = 1;
/// Default request timeout
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
/// Default connect timeout
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Shared HTTP client configuration for LLM providers.
pub struct LlmHttpClient {
    client: Client,
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for LlmHttpClient {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        )
    }
}

impl LlmHttpClient {
    pub fn new(request_timeout: Duration, connect_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: Duration::from_secs(DEFAULT_BASE_BACKOFF_SECS),
        }
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// POST a JSON body with bearer auth, retrying transient failures.
    /// Returns the response body as text on success.
    pub async fn execute_with_retry(
        &self,
        request_id: &str,
        url: &str,
        api_key: &str,
        body: String,
    ) -> Result<String> {
        let mut attempts = 0;
        let mut backoff = self.base_backoff;

        loop {
            let response_result = self
                .client
                .post(url)
                .header("Authorization", format!("Bearer {api_key}"))
                .header("Content-Type", "application/json")
                .body(body.clone())
                .send()
                .await;

            match response_result {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        let error_body = response.text().await.unwrap_or_default();

                        if attempts < self.max_attempts
                            && (status.as_u16() == 429 || status.is_server_error())
                        {
                            warn!(
                                request_id = %request_id,
                                status = %status,
                                "transient LLM API error, retrying in {:?}",
                                backoff
                            );
                            tokio::time::sleep(backoff).await;
                            attempts += 1;
                            backoff *= 2;
                            continue;
                        }

                        return Err(MemoriError::Llm(format!(
                            "API error {status}: {error_body}"
                        )));
                    }

                    return Ok(response.text().await?);
                }
                Err(e) => {
                    if attempts < self.max_attempts {
                        warn!(
                            request_id = %request_id,
                            error = %e,
                            "LLM request failed, retrying in {:?}",
                            backoff
                        );
                        tokio::time::sleep(backoff).await;
                        attempts += 1;
                        backoff *= 2;
                        continue;
                    }
                    return Err(MemoriError::Llm(format!(
                        "request failed after retries: {e}"
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let client = LlmHttpClient::default();
        assert_eq!(client.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(
            client.base_backoff,
            Duration::from_secs(DEFAULT_BASE_BACKOFF_SECS)
        );
    }

    #[test]
    fn test_inner_returns_client() {
        let client = LlmHttpClient::default();
        let _inner = client.inner();
    }
}
