//! HTTP relay client that forwards decoded detections to the collector.
//!
//! One call is one attempt: retries and backoff belong to the subscription
//! worker, which decides what to do from [`RelayError::is_transient`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use thiserror::Error;
use url::Url;

use crate::codec;
use crate::config::RelayConfig;
use crate::models::DetectionEvent;

/// Header carrying the per-message idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

const MAX_REJECTION_BODY_CHARS: usize = 512;

/// Outcome of a failed forward attempt.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("collector did not respond within {0:?}")]
    Timeout(Duration),
    #[error("collector rejected event with status {status}: {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("collector unreachable: {0}")]
    Unreachable(String),
    /// The collector accepted the event but its acknowledgement was unreadable.
    #[error("invalid collector response: {0}")]
    InvalidResponse(String),
}

impl RelayError {
    /// Whether another attempt could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::Timeout(_) | RelayError::Unreachable(_) => true,
            RelayError::Rejected { status, .. } => status.is_server_error(),
            RelayError::InvalidResponse(_) => false,
        }
    }

    /// Short label used for logs and metric dimensions.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Timeout(_) => "timeout",
            RelayError::Rejected { status, .. } if status.is_server_error() => "rejected_5xx",
            RelayError::Rejected { .. } => "rejected_4xx",
            RelayError::Unreachable(_) => "unreachable",
            RelayError::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// Destination for decoded events.
#[async_trait]
pub trait EventForwarder: Send + Sync {
    /// Deliver one event, returning the collector's acknowledged copy.
    async fn forward(
        &self,
        event: &DetectionEvent,
        idempotency_key: &str,
    ) -> Result<DetectionEvent, RelayError>;
}

/// Relay client posting to `{collector}/api/train/detection`.
#[derive(Debug, Clone)]
pub struct RelayClient {
    http_client: Client,
    endpoint: Url,
    timeout: Duration,
}

impl RelayClient {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http_client = Client::builder()
            .user_agent(concat!("trainwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http_client,
            endpoint,
            timeout,
        })
    }

    /// Build a client from the relay section of the application config.
    pub fn from_config(config: &RelayConfig) -> anyhow::Result<Self> {
        let endpoint = config.ingestion_url()?;
        Ok(Self::new(endpoint, config.request_timeout())?)
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn classify(&self, err: reqwest::Error) -> RelayError {
        if err.is_timeout() {
            RelayError::Timeout(self.timeout)
        } else {
            RelayError::Unreachable(err.to_string())
        }
    }
}

#[async_trait]
impl EventForwarder for RelayClient {
    #[tracing::instrument(skip(self, event), fields(endpoint = %self.endpoint))]
    async fn forward(
        &self,
        event: &DetectionEvent,
        idempotency_key: &str,
    ) -> Result<DetectionEvent, RelayError> {
        let started = Instant::now();

        let response = self
            .http_client
            .post(self.endpoint.clone())
            .timeout(self.timeout)
            .header(header::CONTENT_TYPE, "application/json")
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
            .body(codec::encode(event))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_REJECTION_BODY_CHARS).collect();
            return Err(RelayError::Rejected { status, body });
        }

        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                RelayError::Timeout(self.timeout)
            } else {
                RelayError::InvalidResponse(e.to_string())
            }
        })?;

        let acknowledged: DetectionEvent = serde_json::from_slice(&bytes)
            .map_err(|e| RelayError::InvalidResponse(e.to_string()))?;

        tracing::debug!(
            status = status.as_u16(),
            id = ?acknowledged.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "collector acknowledged event"
        );

        Ok(acknowledged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event() -> DetectionEvent {
        let observed = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        DetectionEvent::new("approaching", 3, "activated", observed)
    }

    fn client_for(server: &MockServer, timeout: Duration) -> RelayClient {
        let endpoint = Url::parse(&format!("{}/api/train/detection", server.uri())).unwrap();
        RelayClient::new(endpoint, timeout).unwrap()
    }

    #[tokio::test]
    async fn forward_returns_acknowledged_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/train/detection"))
            .and(header(IDEMPOTENCY_KEY_HEADER, "key-1"))
            .and(body_json(json!({
                "state": "approaching",
                "rounds": 3,
                "relay": "activated",
                "timestamp": "2024-05-01T08:00:00"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 17,
                "state": "approaching",
                "rounds": 3,
                "relay": "activated",
                "timestamp": "2024-05-01T08:00:00",
                "recordedAt": "2024-05-01T08:00:01Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Duration::from_secs(2));
        let acknowledged = client.forward(&event(), "key-1").await.unwrap();

        assert_eq!(acknowledged.id, Some(17));
        assert!(acknowledged.recorded_at.is_some());
    }

    #[tokio::test]
    async fn client_errors_are_permanent_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad state"))
            .mount(&server)
            .await;

        let err = client_for(&server, Duration::from_secs(2))
            .forward(&event(), "key-2")
            .await
            .unwrap_err();

        match &err {
            RelayError::Rejected { status, body } => {
                assert_eq!(*status, StatusCode::BAD_REQUEST);
                assert_eq!(body, "bad state");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server, Duration::from_secs(2))
            .forward(&event(), "key-3")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "rejected_5xx");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn slow_collector_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let err = client_for(&server, Duration::from_millis(50))
            .forward(&event(), "key-4")
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Timeout(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let port = portpicker::pick_unused_port().expect("no free port");
        let endpoint = Url::parse(&format!("http://127.0.0.1:{port}/api/train/detection")).unwrap();
        let client = RelayClient::new(endpoint, Duration::from_secs(2)).unwrap();

        let err = client.forward(&event(), "key-5").await.unwrap_err();
        assert!(matches!(err, RelayError::Unreachable(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn unreadable_acknowledgement_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let err = client_for(&server, Duration::from_secs(2))
            .forward(&event(), "key-6")
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::InvalidResponse(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn from_config_builds_ingestion_endpoint() {
        let config = RelayConfig {
            collector_base_url: "http://collector.local:9000".to_string(),
            ..Default::default()
        };
        let client = RelayClient::from_config(&config).unwrap();
        assert_eq!(
            client.endpoint().as_str(),
            "http://collector.local:9000/api/train/detection"
        );
    }
}
