//! Delivery of ciphertext to the ingestion endpoint.
//!
//! [`Transport`] is the seam between the [`Dispatcher`] and the network.
//! [`HttpTransport`] is the production implementation; tests substitute
//! in-memory transports that record attempt order.

pub mod dispatcher;

use std::time::Duration;

use serde::Serialize;
use tracing::trace;

use crate::error::{Error, Result};
use crate::record::Priority;
use crate::server::envelope::{Envelope, ResponseCode};

pub use dispatcher::{
    DiscardSink, DiscardedRecord, Dispatcher, DispatcherConfig, DispatcherStats, NullSink,
    SendOutcome,
};

/// A failed send attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportFailure {
    /// Connection refused, reset, DNS failure, and the like.
    #[error("network error: {0}")]
    Network(String),

    /// The endpoint answered with a non-success HTTP status.
    #[error("endpoint returned HTTP {0}")]
    Status(u16),

    /// The endpoint answered with an envelope whose code is not 200.
    #[error("endpoint rejected payload with code {code}: {message}")]
    Rejected {
        /// Envelope code.
        code: u16,
        /// Envelope message text.
        message: String,
    },

    /// No answer within the send timeout.
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportFailure {
    /// Whether sending the same ciphertext again could succeed.
    ///
    /// A decode or validation rejection cannot heal on retry; everything
    /// else goes through the normal retry path.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Rejected { code, .. } => !matches!(
                ResponseCode::from_code(*code),
                Some(ResponseCode::DecodeFailure | ResponseCode::InvalidEvent)
            ),
            _ => true,
        }
    }
}

/// Sends one ciphertext to the ingestion endpoint.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `ciphertext`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportFailure`] describing why delivery failed.
    async fn send(
        &self,
        ciphertext: &str,
        priority: Priority,
    ) -> std::result::Result<(), TransportFailure>;
}

#[derive(Serialize)]
struct IngestRequest<'a> {
    payloads: [&'a str; 1],
}

/// [`Transport`] that POSTs to the server's ingestion endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    /// The URL payloads are posted to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        ciphertext: &str,
        priority: Priority,
    ) -> std::result::Result<(), TransportFailure> {
        trace!(%priority, endpoint = %self.endpoint, "Posting ciphertext");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&IngestRequest {
                payloads: [ciphertext],
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportFailure::Timeout(self.timeout)
                } else {
                    TransportFailure::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportFailure::Status(status.as_u16()));
        }

        let envelope: Envelope<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| TransportFailure::Network(format!("unreadable response: {e}")))?;
        if envelope.is_success() {
            Ok(())
        } else {
            Err(TransportFailure::Rejected {
                code: envelope.code,
                message: envelope.message_text,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_display() {
        assert_eq!(
            TransportFailure::Status(503).to_string(),
            "endpoint returned HTTP 503"
        );
        let rejected = TransportFailure::Rejected {
            code: 1001,
            message: "payload could not be decoded".to_string(),
        };
        assert!(rejected.to_string().contains("1001"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(TransportFailure::Network("reset".to_string()).is_retryable());
        assert!(TransportFailure::Status(500).is_retryable());
        assert!(TransportFailure::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(TransportFailure::Rejected {
            code: 429,
            message: String::new()
        }
        .is_retryable());
        assert!(!TransportFailure::Rejected {
            code: 1001,
            message: String::new()
        }
        .is_retryable());
        assert!(!TransportFailure::Rejected {
            code: 1002,
            message: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn test_ingest_request_shape() {
        let body = serde_json::to_value(IngestRequest { payloads: ["abc"] }).unwrap();
        assert_eq!(body, serde_json::json!({"payloads": ["abc"]}));
    }

    #[test]
    fn test_http_transport_new() {
        let transport =
            HttpTransport::new("http://127.0.0.1:9/ingest", Duration::from_secs(1)).unwrap();
        assert_eq!(transport.endpoint(), "http://127.0.0.1:9/ingest");
    }

    #[tokio::test]
    async fn test_http_transport_unreachable_is_network_failure() {
        let transport =
            HttpTransport::new("http://127.0.0.1:9/ingest", Duration::from_secs(2)).unwrap();
        let err = transport.send("abc", Priority::Error).await.unwrap_err();
        assert!(matches!(
            err,
            TransportFailure::Network(_) | TransportFailure::Timeout(_)
        ));
    }
}
