//! HTTP client for the collector upload endpoint
//!
//! The client speaks a deliberately small protocol: one POST per blob, body
//! gzip-compressed LDJSON, and a three-way reading of the response status.
//! Anything other than a 5xx (or a transport failure) consumes the blob: a
//! 2xx means the collector stored it, a 4xx means it never will, and
//! retrying either would change nothing.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::config::UploaderConfig;
use crate::error::{Error, Result};

/// How a delivery attempt resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The collector stored the blob (2xx); commit it locally
    Accepted { status: u16 },
    /// The collector permanently rejected the blob (non-2xx, non-5xx);
    /// commit it locally so a poison blob cannot wedge the queue
    Discarded { status: u16 },
    /// Transient failure (5xx or transport error); keep the blob for a
    /// future upload call
    Retriable {
        status: Option<u16>,
        reason: String,
    },
}

/// Map a response status to its outcome
pub fn outcome_for_status(status: u16) -> UploadOutcome {
    match status {
        200..=299 => UploadOutcome::Accepted { status },
        500..=599 => UploadOutcome::Retriable {
            status: Some(status),
            reason: format!("server error ({})", status),
        },
        _ => UploadOutcome::Discarded { status },
    }
}

/// HTTP client for the collector upload API
pub struct UploadClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl UploadClient {
    /// Create a new upload client from configuration
    ///
    /// Returns an error if the configuration is invalid or missing required fields.
    pub fn new(config: &UploaderConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .server_url
            .clone()
            .ok_or_else(|| Error::Config("uploader.server_url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();

        // Build default headers
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-gzip"));

        if let Some(token) = &config.auth_token {
            let auth_value = format!("Bearer {}", token);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid auth_token: {}", e)))?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
        })
    }

    /// POST one blob payload for an API key.
    ///
    /// Transport failures are reported as a retriable outcome, not an error:
    /// the blob stays queued either way.
    pub async fn send_blob(&self, api_key: &str, payload: Vec<u8>) -> Result<UploadOutcome> {
        let url = format!(
            "{}/uploads/{}",
            self.base_url,
            urlencoding::encode(api_key)
        );

        match self.http_client.post(&url).body(payload).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                Ok(outcome_for_status(status))
            }
            Err(e) => Ok(UploadOutcome::Retriable {
                status: None,
                reason: format!("HTTP request failed: {}", e),
            }),
        }
    }
}
