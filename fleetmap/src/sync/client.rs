//! Delivery of queued mutations to the remote API.

use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;
use thiserror::Error;

use super::SyncError;
use crate::store::PendingAction;

/// Default request timeout for mutation delivery.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a delivery did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Transient; the action stays queued and is retried with backoff.
    #[error("Delivery failed, will retry: {0}")]
    Retryable(String),

    /// Refused by the receiver; retrying cannot help.
    #[error("Delivery rejected: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Retryable(_))
    }
}

/// Sends one action to its endpoint.
pub trait MutationClient: Send + Sync {
    fn deliver<'a>(&'a self, action: &'a PendingAction) -> BoxFuture<'a, Result<(), DeliveryError>>;
}

/// Classify a non-success HTTP status.
pub fn classify_status(status: u16) -> DeliveryError {
    match status {
        408 | 429 | 500..=599 => DeliveryError::Retryable(format!("HTTP {status}")),
        _ => DeliveryError::Permanent(format!("HTTP {status}")),
    }
}

/// Posts `{ "type": ..., "payload": ... }` to `<base_url><endpoint>`.
pub struct HttpMutationClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMutationClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SyncError> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Client(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, action: &PendingAction) -> String {
        format!("{}{}", self.base_url, action.kind.endpoint())
    }
}

impl MutationClient for HttpMutationClient {
    fn deliver<'a>(&'a self, action: &'a PendingAction) -> BoxFuture<'a, Result<(), DeliveryError>> {
        Box::pin(async move {
            let body = json!({
                "type": action.kind.as_str(),
                "payload": action.payload,
            });
            let response = self
                .client
                .post(self.url_for(action))
                .header("Idempotency-Key", action.id.as_str())
                .json(&body)
                .send()
                .await
                .map_err(|e| DeliveryError::Retryable(format!("Request failed: {}", e)))?;

            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(classify_status(status.as_u16()))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ActionKind;
    use chrono::Utc;

    #[test]
    fn test_classify_status() {
        assert!(classify_status(503).is_retryable());
        assert!(classify_status(429).is_retryable());
        assert!(classify_status(408).is_retryable());
        assert!(!classify_status(422).is_retryable());
        assert!(!classify_status(404).is_retryable());
    }

    #[test]
    fn test_url_for_joins_endpoint() {
        let client = HttpMutationClient::new("https://api.example.com/").unwrap();
        let action = PendingAction {
            id: "a1".into(),
            sequence: 1,
            kind: ActionKind::LogFuel,
            payload: json!({}),
            created_at: Utc::now(),
            synced: false,
            synced_at: None,
            retry_count: 0,
            last_error: None,
            ordering_key: None,
            next_attempt_at: None,
            rejected: false,
        };
        assert_eq!(client.url_for(&action), "https://api.example.com/api/fuel");
    }
}
