//! Health endpoint probing for load-scaled tiers.
//!
//! The routing tier's health document lists the services it depends on:
//!
//! ```json
//! {"services": {"grayscale": {"queue_depth": 4, "status": "healthy"}}}
//! ```
//!
//! Their queue depths and the response latency feed the load score.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::decision::load_score;
use crate::error::HealthError;
use crate::session::RetryPolicy;

/// Parsed result of one health probe.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    /// Queue depths reported for dependent services.
    pub dependent_queue_depths: Vec<u64>,
    /// Time until the response headers arrived.
    pub latency: Duration,
}

impl HealthReport {
    /// Extracts dependent queue depths from a health document. Entries
    /// without a numeric `queue_depth` are skipped.
    pub fn from_document(document: &Value, latency: Duration) -> Self {
        let dependent_queue_depths = document
            .get("services")
            .and_then(Value::as_object)
            .map(|services| {
                services
                    .values()
                    .filter_map(|service| service.get("queue_depth"))
                    .filter_map(|depth| {
                        depth
                            .as_u64()
                            .or_else(|| depth.as_f64().filter(|d| *d >= 0.0).map(|d| d as u64))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            dependent_queue_depths,
            latency,
        }
    }

    pub fn load_score(&self) -> f64 {
        load_score(&self.dependent_queue_depths, self.latency)
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, endpoint: &str) -> Result<HealthReport, HealthError>;
}

/// Probes health endpoints over HTTP.
pub struct HttpHealthProbe {
    client: Client,
    retry: RetryPolicy,
}

impl HttpHealthProbe {
    /// Creates a probe whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, HealthError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("imagepipe/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            retry: RetryPolicy::no_retry(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn probe_once(&self, endpoint: &str) -> Result<HealthReport, HealthError> {
        let started = Instant::now();
        let response = self.client.get(endpoint).send().await?;
        let latency = started.elapsed();

        let status = response.status();
        if !status.is_success() {
            return Err(HealthError::Status(status.as_u16()));
        }

        let document: Value = response.json().await?;
        let report = HealthReport::from_document(&document, latency);
        debug!(
            endpoint = endpoint,
            latency_ms = latency.as_millis() as u64,
            dependents = report.dependent_queue_depths.len(),
            "Health probe succeeded"
        );
        Ok(report)
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, endpoint: &str) -> Result<HealthReport, HealthError> {
        self.retry
            .run("health probe", |_| self.probe_once(endpoint))
            .await
            .map_err(|e| {
                if e.attempts <= 1 {
                    e.last_error
                } else {
                    HealthError::Exhausted {
                        attempts: e.attempts,
                        last_error: e.last_error.to_string(),
                    }
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    #[test]
    fn test_report_from_document() {
        let document = json!({
            "status": "healthy",
            "services": {
                "grayscale": {"queue_depth": 4, "status": "healthy"},
                "thumbnail": {"queue_depth": 2.0},
                "storage": {"status": "healthy"},
                "broken": {"queue_depth": "n/a"}
            }
        });
        let report = HealthReport::from_document(&document, Duration::from_millis(200));
        let mut depths = report.dependent_queue_depths.clone();
        depths.sort_unstable();
        assert_eq!(depths, vec![2, 4]);
        assert!((report.load_score() - 32.0).abs() < 1e-9);
    }

    #[test]
    fn test_report_without_services() {
        let report = HealthReport::from_document(&json!({"status": "ok"}), Duration::ZERO);
        assert!(report.dependent_queue_depths.is_empty());
        assert_eq!(report.load_score(), 0.0);
    }

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}/health", addr)
    }

    #[tokio::test]
    async fn test_http_probe_reads_document() {
        let app = Router::new().route(
            "/health",
            get(|| async { Json(json!({"services": {"grayscale": {"queue_depth": 3}}})) }),
        );
        let endpoint = spawn(app).await;

        let probe = HttpHealthProbe::new(Duration::from_secs(5)).expect("client");
        let report = probe.probe(&endpoint).await.expect("probe");
        assert_eq!(report.dependent_queue_depths, vec![3]);
        assert!(report.load_score() >= 30.0);
    }

    #[tokio::test]
    async fn test_http_probe_rejects_error_status() {
        let app = Router::new().route(
            "/health",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }),
        );
        let endpoint = spawn(app).await;

        let probe = HttpHealthProbe::new(Duration::from_secs(5))
            .expect("client")
            .with_retry(RetryPolicy::linear(2, Duration::from_millis(1)));
        let err = probe.probe(&endpoint).await.expect_err("503");
        assert!(matches!(err, HealthError::Exhausted { attempts: 2, .. }));
        assert!(err.to_string().contains("503"));
    }
}
