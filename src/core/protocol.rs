//! Decision service client.
//!
//! `decide` asks the service to evaluate remote rules and is bounded by a
//! timeout; any failure becomes an ERROR decision so the host fails open.
//! `report` ships the final decision in the background and never blocks or
//! fails the caller.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Notify;
use crate::core::context::Context;
use crate::core::logger::Logger;
use crate::models::{Decision, EngineConfig, Mode, Request};

#[cfg(test)]
use mockall::automock;

/// Version sent with every request
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

const NO_RUNTIME: &str = "no async runtime is available";

/// Errors that can occur while talking to the decision service
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("API request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("decision service returned status {0}")]
    Status(u16),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Request fields sent to the decision service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDetails {
    pub ip: String,
    pub method: String,
    pub protocol: String,
    pub host: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub cookies: String,
    pub query: String,
    pub extra: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl From<&Request> for RequestDetails {
    fn from(request: &Request) -> Self {
        Self {
            ip: request.ip().to_string(),
            method: request.method().to_string(),
            protocol: request.protocol().to_string(),
            host: request.host().to_string(),
            path: request.path().to_string(),
            headers: request.headers().to_map(),
            cookies: request.cookies().to_string(),
            query: request.query().to_string(),
            extra: request.extra().clone(),
            email: request.email().map(str::to_string),
        }
    }
}

/// Wire description of a registered rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDescriptor {
    pub id: String,
    #[serde(rename = "type")]
    pub rule_type: String,
    pub mode: Mode,
    pub priority: u32,
    pub version: u32,
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecideRequest {
    pub sdk_stack: String,
    pub sdk_version: String,
    pub fingerprint: String,
    pub characteristics: Vec<String>,
    pub details: RequestDetails,
    pub rules: Vec<RuleDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    pub sdk_stack: String,
    pub sdk_version: String,
    pub fingerprint: String,
    pub characteristics: Vec<String>,
    pub details: RequestDetails,
    pub decision: Decision,
    pub rules: Vec<RuleDescriptor>,
    pub received_at: DateTime<Utc>,
}

/// Carries protocol messages to the decision service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn decide(&self, key: &str, request: &DecideRequest) -> Result<Decision, ProtocolError>;

    async fn report(&self, key: &str, request: &ReportRequest) -> Result<(), ProtocolError>;
}

/// JSON over HTTP transport
pub struct HttpTransport {
    /// HTTP client
    client: Client,
    /// Service base URL, without a trailing slash
    base_url: String,
}

impl HttpTransport {
    /// Create a new transport for `base_url`
    ///
    /// # Returns
    ///
    /// * `Ok(HttpTransport)` if `base_url` is an absolute http(s) URL
    /// * `Err(ProtocolError)` otherwise
    pub fn new(base_url: &str) -> Result<Self, ProtocolError> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| ProtocolError::InvalidConfig(format!("{}: {}", base_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            let message = format!("unsupported scheme in {}", base_url);
            return Err(ProtocolError::InvalidConfig(message));
        }
        Ok(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        key: &str,
        body: &T,
    ) -> Result<reqwest::Response, ProtocolError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProtocolError::Status(status.as_u16()));
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn decide(&self, key: &str, request: &DecideRequest) -> Result<Decision, ProtocolError> {
        let response = self.post("/decide", key, request).await?;
        response
            .json::<Decision>()
            .await
            .map_err(|e| ProtocolError::InvalidResponse(e.to_string()))
    }

    async fn report(&self, key: &str, request: &ReportRequest) -> Result<(), ProtocolError> {
        self.post("/report", key, request).await?;
        Ok(())
    }
}

/// Counts background reports so shutdown can wait for them
#[derive(Debug, Default)]
struct ReportTracker {
    pending: AtomicUsize,
    idle: Notify,
}

struct PendingReport(Arc<ReportTracker>);

impl PendingReport {
    fn start(tracker: &Arc<ReportTracker>) -> Self {
        tracker.pending.fetch_add(1, Ordering::SeqCst);
        Self(tracker.clone())
    }
}

impl Drop for PendingReport {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Client for the decision service
pub struct DecisionClient {
    transport: Arc<dyn Transport>,
    sdk_stack: String,
    decide_timeout: Duration,
    report_timeout: Duration,
    reports: Arc<ReportTracker>,
}

impl DecisionClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        decide_timeout: Duration,
        report_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            sdk_stack: "RUST".to_string(),
            decide_timeout,
            report_timeout,
            reports: Arc::default(),
        }
    }

    /// Build an HTTP client from `config`; `None` when no service is configured
    pub fn from_config(config: &EngineConfig) -> Result<Option<Self>, ProtocolError> {
        let Some(base_url) = config.protocol.base_url.as_deref() else {
            return Ok(None);
        };
        if config.key.is_empty() {
            log::warn!(
                "Decision service URL is set but no key is configured; \
                 remote rules will not be evaluated"
            );
            return Ok(None);
        }
        let transport = Arc::new(HttpTransport::new(base_url)?);
        Ok(Some(
            Self::new(
                transport,
                config.protocol.decide_timeout(config.environment),
                config.protocol.report_timeout(),
            )
            .with_sdk_stack(config.protocol.sdk_stack.clone()),
        ))
    }

    pub fn with_sdk_stack(mut self, sdk_stack: impl Into<String>) -> Self {
        self.sdk_stack = sdk_stack.into();
        self
    }

    /// Number of reports still in flight
    pub fn pending_reports(&self) -> usize {
        self.reports.pending.load(Ordering::SeqCst)
    }

    /// Ask the service to evaluate `rules`
    ///
    /// # Returns
    ///
    /// The service's decision, or an ERROR decision when the call fails or
    /// does not finish within the decide timeout
    pub async fn decide(
        &self,
        context: &Context,
        request: &Request,
        rules: &[RuleDescriptor],
    ) -> Decision {
        let payload = DecideRequest {
            sdk_stack: self.sdk_stack.clone(),
            sdk_version: SDK_VERSION.to_string(),
            fingerprint: context.fingerprint.clone(),
            characteristics: context.characteristics.clone(),
            details: RequestDetails::from(request),
            rules: rules.to_vec(),
        };

        let failure = if tokio::runtime::Handle::try_current().is_err() {
            NO_RUNTIME.to_string()
        } else {
            let call = self.transport.decide(&context.key, &payload);
            match tokio::time::timeout(self.decide_timeout, call).await {
                Ok(Ok(decision)) => return decision,
                Ok(Err(err)) => err.to_string(),
                Err(_) => format!(
                    "decide request timed out after {}ms",
                    self.decide_timeout.as_millis()
                ),
            }
        };

        metrics::counter!("request_guard_decide_failures_total", 1);
        context.logger.error("Failed to make decide request: %s", &[json!(failure)]);
        Decision::error(failure)
    }

    /// Ship `decision` to the service in the background
    pub fn report(
        &self,
        context: &Context,
        request: &Request,
        decision: &Decision,
        rules: &[RuleDescriptor],
    ) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            context.logger.warn("Report skipped: %s", &[json!(NO_RUNTIME)]);
            return;
        };

        let payload = ReportRequest {
            sdk_stack: self.sdk_stack.clone(),
            sdk_version: SDK_VERSION.to_string(),
            fingerprint: context.fingerprint.clone(),
            characteristics: context.characteristics.clone(),
            details: RequestDetails::from(request),
            decision: decision.clone(),
            rules: rules.to_vec(),
            received_at: Utc::now(),
        };
        let transport = self.transport.clone();
        let logger: Arc<dyn Logger> = context.logger.clone();
        let key = context.key.clone();
        let timeout = self.report_timeout;
        let pending = PendingReport::start(&self.reports);

        runtime.spawn(async move {
            let _pending = pending;
            let call = transport.report(&key, &payload);
            let failure = match tokio::time::timeout(timeout, call).await {
                Ok(Ok(())) => return,
                Ok(Err(err)) => err.to_string(),
                Err(_) => format!("report request timed out after {}ms", timeout.as_millis()),
            };
            logger.info("Encountered problem sending report: %s", &[json!(failure)]);
        });
    }

    /// Wait until every background report has finished
    pub async fn drain(&self) {
        loop {
            let idle = self.reports.idle.notified();
            if self.pending_reports() == 0 {
                return;
            }
            idle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::MemoryCache;
    use crate::core::logger::testing::RecordingLogger;
    use crate::models::{Conclusion, Reason, RuleResult};
    use log::Level;

    fn context(logger: Arc<RecordingLogger>) -> Context {
        Context {
            key: "secret-key".to_string(),
            fingerprint: "fp::2::abc".to_string(),
            characteristics: vec!["ip.src".to_string()],
            runtime: "rust".to_string(),
            cache: Arc::new(MemoryCache::new()),
            logger,
            analysis: None,
            body: None,
        }
    }

    fn request() -> Request {
        Request::builder()
            .ip("8.8.8.8")
            .method("GET")
            .host("example.com")
            .path("/")
            .header("User-Agent", "curl/8.1.2")
            .build()
    }

    fn descriptor() -> RuleDescriptor {
        RuleDescriptor {
            id: "rule-1".to_string(),
            rule_type: "RATE_LIMIT".to_string(),
            mode: Mode::Live,
            priority: 3,
            version: 0,
            options: json!({"algorithm": "FIXED_WINDOW", "max": 1, "window": 60}),
        }
    }

    fn client_with(transport: impl Transport + 'static) -> DecisionClient {
        DecisionClient::new(
            Arc::new(transport),
            Duration::from_millis(500),
            Duration::from_secs(2),
        )
    }

    struct SlowTransport;

    #[async_trait]
    impl Transport for SlowTransport {
        async fn decide(
            &self,
            _key: &str,
            _request: &DecideRequest,
        ) -> Result<Decision, ProtocolError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Decision::new(Conclusion::Deny, Reason::Generic, vec![], 0))
        }

        async fn report(&self, _key: &str, _request: &ReportRequest) -> Result<(), ProtocolError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_decide_passes_through_service_decision() {
        let mut transport = MockTransport::new();
        transport
            .expect_decide()
            .withf(|key, req| {
                key == "secret-key"
                    && req.rules.len() == 1
                    && req.details.ip == "8.8.8.8"
                    && req.details.headers.get("user-agent").map(String::as_str)
                        == Some("curl/8.1.2")
                    && req.sdk_version == SDK_VERSION
            })
            .times(1)
            .returning(|_, req| {
                let mut result = RuleResult::deny(Reason::Generic).with_ttl(30);
                result.rule_id = req.rules[0].id.clone();
                Ok(Decision::new(Conclusion::Deny, Reason::Generic, vec![result], 30))
            });

        let client = client_with(transport);
        let decision = client.decide(&context(Arc::default()), &request(), &[descriptor()]).await;

        assert_eq!(decision.conclusion, Conclusion::Deny);
        assert_eq!(decision.results[0].rule_id, "rule-1");
    }

    #[tokio::test]
    async fn test_decide_error_fails_open() {
        let logger = Arc::new(RecordingLogger::default());
        let mut transport = MockTransport::new();
        transport
            .expect_decide()
            .returning(|_, _| Err(ProtocolError::Status(503)));

        let client = client_with(transport);
        let decision = client.decide(&context(logger.clone()), &request(), &[descriptor()]).await;

        assert!(decision.is_errored());
        assert!(decision.is_allowed());
        assert!(decision.id.starts_with("lreq_"));
        assert!(logger.contains(Level::Error, "Failed to make decide request"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decide_timeout_fails_open() {
        let client = client_with(SlowTransport);
        let started = tokio::time::Instant::now();
        let decision = client.decide(&context(Arc::default()), &request(), &[descriptor()]).await;

        assert!(decision.is_errored());
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(decision.reason, Reason::Error(ref e) if e.message.contains("timed out")));
    }

    #[test]
    fn test_decide_without_runtime_fails_open() {
        let logger = Arc::new(RecordingLogger::default());
        let mut transport = MockTransport::new();
        transport.expect_decide().never();

        let client = client_with(transport);
        let decision = futures::executor::block_on(client.decide(
            &context(logger.clone()),
            &request(),
            &[descriptor()],
        ));

        assert!(decision.is_errored());
        assert!(matches!(decision.reason, Reason::Error(ref e) if e.message == NO_RUNTIME));
        assert!(logger.contains(Level::Error, "Failed to make decide request: no async runtime"));
    }

    #[tokio::test]
    async fn test_report_runs_in_background_and_drains() {
        let mut transport = MockTransport::new();
        transport
            .expect_report()
            .withf(|key, req| key == "secret-key" && req.decision.conclusion == Conclusion::Allow)
            .times(1)
            .returning(|_, _| Ok(()));

        let client = client_with(transport);
        let decision = Decision::new(Conclusion::Allow, Reason::Generic, vec![], 0);
        client.report(&context(Arc::default()), &request(), &decision, &[descriptor()]);
        client.drain().await;

        assert_eq!(client.pending_reports(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_failure_is_logged_not_raised() {
        let logger = Arc::new(RecordingLogger::default());
        let client = client_with(SlowTransport);
        let decision = Decision::new(Conclusion::Allow, Reason::Generic, vec![], 0);

        client.report(&context(logger.clone()), &request(), &decision, &[]);
        assert_eq!(client.pending_reports(), 1);
        client.drain().await;

        assert!(logger.contains(Level::Info, "report request timed out"));
    }

    #[tokio::test]
    async fn test_drain_without_reports_returns_immediately() {
        let client = client_with(MockTransport::new());
        client.drain().await;
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let payload = DecideRequest {
            sdk_stack: "RUST".to_string(),
            sdk_version: SDK_VERSION.to_string(),
            fingerprint: "fp::2::abc".to_string(),
            characteristics: vec!["ip.src".to_string()],
            details: RequestDetails::from(&request()),
            rules: vec![descriptor()],
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["sdkStack"], "RUST");
        assert_eq!(value["rules"][0]["type"], "RATE_LIMIT");
        assert_eq!(value["rules"][0]["mode"], "LIVE");
        assert!(value["details"].get("email").is_none());
    }

    #[test]
    fn test_from_config_requires_url_and_key() {
        let mut config = EngineConfig::default();
        assert!(DecisionClient::from_config(&config).unwrap().is_none());

        config.protocol.base_url = Some("https://decide.example.com/".to_string());
        assert!(DecisionClient::from_config(&config).unwrap().is_none());

        config.key = "key".to_string();
        assert!(DecisionClient::from_config(&config).unwrap().is_some());

        config.protocol.base_url = Some("ftp://decide.example.com".to_string());
        assert!(DecisionClient::from_config(&config).is_err());
    }
}
