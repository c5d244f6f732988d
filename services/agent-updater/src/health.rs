//! Post-restart health verification.
//!
//! The restarted agent must answer `GET <health-url>` with
//! `{"ok": true, "version": "<target>"}`. Anything else (transport error,
//! non-2xx, `ok: false`, another version) is a failed check and is retried
//! until the retry budget runs out.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{tokio_sleep, SleepFn};
use crate::signal::Shutdown;

/// Wire contract of the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub version: String,
}

/// Errors from health verification.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("health check did not pass after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("health check cancelled")]
    Cancelled,

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Outcome of a single check.
#[derive(Debug)]
enum Outcome {
    Healthy,
    Unhealthy(String),
}

/// Polls the agent health endpoint.
pub struct HealthChecker {
    client: reqwest::Client,
    sleep: SleepFn,
}

impl HealthChecker {
    /// Create a checker with a per-request timeout.
    pub fn new(request_timeout: Duration) -> Result<Self, HealthError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(HealthError::Client)?;

        Ok(Self {
            client,
            sleep: tokio_sleep(),
        })
    }

    pub fn with_sleep(mut self, sleep: SleepFn) -> Self {
        self.sleep = sleep;
        self
    }

    /// Poll `url` until it reports live at `expected_version`.
    ///
    /// Makes at most `retries` checks (at least one), waiting `interval`
    /// between them. Returns [`HealthError::Cancelled`] as soon as `shutdown`
    /// fires, including mid-request.
    pub async fn verify(
        &self,
        url: &str,
        expected_version: &str,
        retries: u32,
        interval: Duration,
        shutdown: &Shutdown,
    ) -> Result<(), HealthError> {
        let attempts = retries.max(1);
        let mut last = String::from("no check made");

        for attempt in 1..=attempts {
            if shutdown.is_triggered() {
                return Err(HealthError::Cancelled);
            }

            let outcome = tokio::select! {
                outcome = self.check_once(url, expected_version) => outcome,
                _ = shutdown.triggered() => return Err(HealthError::Cancelled),
            };

            match outcome {
                Outcome::Healthy => {
                    info!(
                        url = %url,
                        version = %expected_version,
                        attempt,
                        "Health check passed"
                    );
                    return Ok(());
                }
                Outcome::Unhealthy(reason) => {
                    warn!(
                        url = %url,
                        attempt,
                        attempts,
                        reason = %reason,
                        "Health check failed"
                    );
                    last = reason;
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = (self.sleep)(interval) => {}
                    _ = shutdown.triggered() => return Err(HealthError::Cancelled),
                }
            }
        }

        Err(HealthError::Exhausted { attempts, last })
    }

    async fn check_once(&self, url: &str, expected_version: &str) -> Outcome {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => return Outcome::Unhealthy(format!("request failed: {e}")),
        };

        let status = response.status();
        if !status.is_success() {
            return Outcome::Unhealthy(format!("status {status}"));
        }

        let body: HealthResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => return Outcome::Unhealthy(format!("invalid health response: {e}")),
        };
        debug!(ok = body.ok, version = %body.version, "Health response");

        if !body.ok {
            return Outcome::Unhealthy("agent reports not ok".to_string());
        }
        if body.version != expected_version {
            return Outcome::Unhealthy(format!(
                "version mismatch: expected {expected_version}, got {}",
                body.version
            ));
        }

        Outcome::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::instant_sleep;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn checker() -> HealthChecker {
        HealthChecker::new(Duration::from_secs(2))
            .unwrap()
            .with_sleep(instant_sleep())
    }

    async fn server_with(status: u16, body: serde_json::Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_healthy_with_expected_version() {
        let server = server_with(200, serde_json::json!({"ok": true, "version": "v2.0.0"})).await;
        let url = format!("{}/healthz", server.uri());

        checker()
            .verify(&url, "v2.0.0", 3, Duration::from_secs(1), &Shutdown::never())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_version_mismatch_exhausts_retries() {
        let server = server_with(200, serde_json::json!({"ok": true, "version": "v1.0.0"})).await;
        let url = format!("{}/healthz", server.uri());

        let err = checker()
            .verify(&url, "v2.0.0", 3, Duration::from_secs(1), &Shutdown::never())
            .await
            .unwrap_err();

        match err {
            HealthError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(last.contains("version mismatch"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_not_ok_is_unhealthy() {
        let server = server_with(200, serde_json::json!({"ok": false, "version": "v2.0.0"})).await;
        let url = format!("{}/healthz", server.uri());

        let err = checker()
            .verify(&url, "v2.0.0", 2, Duration::from_secs(1), &Shutdown::never())
            .await
            .unwrap_err();

        assert!(matches!(err, HealthError::Exhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_non_success_status_is_unhealthy() {
        let server = server_with(503, serde_json::json!({"ok": true, "version": "v2.0.0"})).await;
        let url = format!("{}/healthz", server.uri());

        let err = checker()
            .verify(&url, "v2.0.0", 1, Duration::from_secs(1), &Shutdown::never())
            .await
            .unwrap_err();

        match err {
            HealthError::Exhausted { last, .. } => assert!(last.contains("503")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_recovers_after_initial_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"ok": true, "version": "v2.0.0"})),
            )
            .mount(&server)
            .await;
        let url = format!("{}/healthz", server.uri());

        checker()
            .verify(&url, "v2.0.0", 5, Duration::from_secs(1), &Shutdown::never())
            .await
            .unwrap();
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_check() {
        let server = server_with(200, serde_json::json!({"ok": true, "version": "v2.0.0"})).await;
        let url = format!("{}/healthz", server.uri());
        let (trigger, shutdown) = Shutdown::channel();
        trigger.trigger();

        let err = checker()
            .verify(&url, "v2.0.0", 3, Duration::from_secs(1), &shutdown)
            .await
            .unwrap_err();

        assert!(matches!(err, HealthError::Cancelled));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_while_waiting_between_checks() {
        let server = server_with(200, serde_json::json!({"ok": false, "version": "v2.0.0"})).await;
        let url = format!("{}/healthz", server.uri());
        let (trigger, shutdown) = Shutdown::channel();

        let checker = HealthChecker::new(Duration::from_secs(2)).unwrap();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.trigger();
        });

        let err = checker
            .verify(&url, "v2.0.0", 10, Duration::from_secs(30), &shutdown)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, HealthError::Cancelled));
    }
}
