//! HTTP client for the image-similarity API.
//!
//! Issues `GET {url}?image_url=..&image2_url=..` with basic auth and reads
//! `result.distance` from the JSON reply.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{SimilarityError, SimilarityScorer};
use crate::config::SimilarityConfig;

#[derive(Debug, Deserialize)]
struct SimilarityReply {
    result: SimilarityResult,
}

#[derive(Debug, Deserialize)]
struct SimilarityResult {
    distance: f64,
}

/// Similarity client over HTTP.
pub struct HttpSimilarityClient {
    client: Client,
    config: SimilarityConfig,
}

impl HttpSimilarityClient {
    pub fn new(config: SimilarityConfig) -> Result<Self, SimilarityError> {
        if config.url.is_empty() {
            return Err(SimilarityError::Config("url is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { client, config })
    }

    fn backoff() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(3)
            .with_jitter()
    }

    fn is_retryable(err: &SimilarityError) -> bool {
        match err {
            SimilarityError::Http(e) => e.is_timeout() || e.is_connect(),
            SimilarityError::Unavailable(_) => true,
            _ => false,
        }
    }

    fn is_retryable_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    async fn compare(&self, target_image: &str, tag_image: &str) -> Result<f64, SimilarityError> {
        let response = self
            .client
            .get(&self.config.url)
            .basic_auth(&self.config.api_key, Some(&self.config.api_secret))
            .query(&[("image_url", target_image), ("image2_url", tag_image)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = format!("HTTP {} - {}", status, body.chars().take(200).collect::<String>());
            return if Self::is_retryable_status(status) {
                Err(SimilarityError::Unavailable(detail))
            } else {
                Err(SimilarityError::Rejected(detail))
            };
        }

        let reply: SimilarityReply = response.json().await?;
        debug!(distance = reply.result.distance, "Similarity computed");
        Ok(reply.result.distance)
    }
}

#[async_trait]
impl SimilarityScorer for HttpSimilarityClient {
    async fn distance(&self, target_image: &str, tag_image: &str) -> Result<f64, SimilarityError> {
        (|| self.compare(target_image, tag_image))
            .retry(Self::backoff())
            .when(Self::is_retryable)
            .notify(|err: &SimilarityError, delay: Duration| {
                warn!(error = %err, ?delay, "Similarity request failed, retrying");
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_url() {
        let config = SimilarityConfig {
            url: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            HttpSimilarityClient::new(config),
            Err(SimilarityError::Config(_))
        ));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(HttpSimilarityClient::is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(HttpSimilarityClient::is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!HttpSimilarityClient::is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!HttpSimilarityClient::is_retryable_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn test_only_unavailable_is_retried() {
        assert!(HttpSimilarityClient::is_retryable(&SimilarityError::Unavailable(
            "503".to_string()
        )));
        assert!(!HttpSimilarityClient::is_retryable(&SimilarityError::Rejected(
            "400".to_string()
        )));
        assert!(!HttpSimilarityClient::is_retryable(&SimilarityError::InvalidDistance(-1.0)));
    }

    #[test]
    fn test_reply_decoding() {
        let reply: SimilarityReply = serde_json::from_str(
            r#"{"result":{"distance":4.0},"status":{"type":"success","text":""}}"#,
        )
        .unwrap();
        assert_eq!(reply.result.distance, 4.0);
    }
}
