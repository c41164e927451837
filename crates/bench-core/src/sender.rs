use crate::config::{base_url_string, TargetConfig};
use crate::corpus::EncounterStore;
use crate::operation::Operation;
use anyhow::{Context, Result};
use rand::Rng;
use serde_json::{json, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

pub const CONTENT_TYPE_FHIR_JSON: &str = "application/fhir+json; charset=UTF-8";
pub const PREFER_RETURN_MINIMAL: &str = "return=minimal";

const ENCOUNTER_STATUSES: [&str; 9] = [
    "arrived",
    "cancelled",
    "entered-in-error",
    "finished",
    "in-progress",
    "onleave",
    "planned",
    "triaged",
    "unknown",
];

/// What the target service did with one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendOutcome {
    pub status: u16,
    /// Milliseconds from sending the request until the response arrived,
    /// body drain excluded
    pub latency_ms: u64,
    /// Size of the payload sent, 0 for bodiless requests
    pub request_bytes: u64,
    /// Size of the fully drained response body
    pub response_bytes: u64,
    /// `Some(hit)` when the response carried a cache header
    pub cache_hit: Option<bool>,
}

/// A request that never produced a status: transport failure, timeout or a
/// broken body. Keeps the size of any payload already handed to the client.
#[derive(Debug)]
pub struct SendFailure {
    pub request_bytes: u64,
    pub error: anyhow::Error,
}

impl SendFailure {
    pub fn new(request_bytes: u64, error: anyhow::Error) -> Self {
        Self {
            request_bytes,
            error,
        }
    }
}

impl From<anyhow::Error> for SendFailure {
    fn from(error: anyhow::Error) -> Self {
        Self::new(0, error)
    }
}

impl fmt::Display for SendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.error)
    }
}

pub type SendResult = std::result::Result<SendOutcome, SendFailure>;

pub type SendFuture<'a> = Pin<Box<dyn Future<Output = SendResult> + Send + 'a>>;

/// Adapter that performs one unit of work against the target service.
///
/// A `SendFailure` is counted as a failure by the caller; its payload size
/// is still metered.
pub trait OperationSender: Send + Sync {
    fn name(&self) -> &'static str;

    fn send<'a>(&'a self, op: Operation, id: &'a str) -> SendFuture<'a>;
}

/// Simulated service for dry runs: always succeeds after a fixed delay.
pub struct MockSender {
    delay: Duration,
}

impl MockSender {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
        }
    }
}

impl OperationSender for MockSender {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn send<'a>(&'a self, op: Operation, _id: &'a str) -> SendFuture<'a> {
        Box::pin(async move {
            let start = Instant::now();
            sleep(self.delay).await;
            let status = match op {
                Operation::Create => 201,
                _ => 200,
            };
            Ok(SendOutcome {
                status,
                latency_ms: start.elapsed().as_millis() as u64,
                request_bytes: 0,
                response_bytes: 0,
                cache_hit: op.is_read_side().then_some(false),
            })
        })
    }
}

/// Issues FHIR REST requests over HTTP.
pub struct HttpSender {
    client: reqwest::Client,
    base_url: String,
    encounters: Arc<EncounterStore>,
}

impl HttpSender {
    pub fn new(
        base_url: &url::Url,
        target: &TargetConfig,
        compression: bool,
        encounters: Arc<EncounterStore>,
    ) -> Result<Self> {
        let client = build_client(target, compression)?;
        Ok(Self {
            client,
            base_url: base_url_string(base_url),
            encounters,
        })
    }

    fn request(&self, op: Operation, id: &str) -> Result<(reqwest::RequestBuilder, u64)> {
        let base = &self.base_url;
        let built = match op {
            Operation::Read => {
                let url =
                    format!("{base}/Patient/{id}?_elements=id&_elements:exclude=Patient.meta");
                (self.client.get(url), 0)
            }
            Operation::Search => {
                let url = format!(
                    "{base}/Observation?patient=Patient/{id}&_count=1&_elements=id&_elements:exclude=Observation.meta"
                );
                (self.client.get(url), 0)
            }
            Operation::Create => {
                let payload = serde_json::to_string(&observation_for(id))?;
                let len = payload.len() as u64;
                let builder = self
                    .client
                    .post(format!("{base}/Observation"))
                    .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_FHIR_JSON)
                    .header("Prefer", PREFER_RETURN_MINIMAL)
                    .body(payload);
                (builder, len)
            }
            Operation::Update => {
                let status_idx = rand::thread_rng().gen_range(0..ENCOUNTER_STATUSES.len());
                let encounter = self
                    .encounters
                    .with_status(id, ENCOUNTER_STATUSES[status_idx]);
                let payload = serde_json::to_string(&encounter)?;
                let len = payload.len() as u64;
                let builder = self
                    .client
                    .put(format!("{base}/Encounter/{id}"))
                    .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_FHIR_JSON)
                    .header("Prefer", PREFER_RETURN_MINIMAL)
                    .body(payload);
                (builder, len)
            }
        };
        Ok(built)
    }
}

impl OperationSender for HttpSender {
    fn name(&self) -> &'static str {
        "http"
    }

    fn send<'a>(&'a self, op: Operation, id: &'a str) -> SendFuture<'a> {
        Box::pin(async move {
            let (builder, request_bytes) = self.request(op, id)?;
            let start = Instant::now();
            let mut response = builder
                .send()
                .await
                .with_context(|| format!("{op} request for {id} failed"))
                .map_err(|e| SendFailure::new(request_bytes, e))?;
            let latency_ms = start.elapsed().as_millis() as u64;

            let status = response.status().as_u16();
            let cache_hit = if op.is_read_side() {
                Some(
                    response
                        .headers()
                        .get("X-Cache")
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|v| v.starts_with("HIT")),
                )
            } else {
                None
            };

            // Drain the body even on errors so the connection can be reused.
            let mut response_bytes = 0u64;
            while let Some(chunk) = response
                .chunk()
                .await
                .with_context(|| format!("failed to drain {op} response for {id}"))
                .map_err(|e| SendFailure::new(request_bytes, e))?
            {
                response_bytes += chunk.len() as u64;
            }

            Ok(SendOutcome {
                status,
                latency_ms,
                request_bytes,
                response_bytes,
                cache_hit,
            })
        })
    }
}

/// HTTP client with the benchmark's connection pool and timeouts.
pub fn build_client(target: &TargetConfig, compression: bool) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(target.connect_timeout())
        .timeout(target.request_timeout())
        .pool_max_idle_per_host(target.max_idle_connections)
        .tcp_keepalive(Duration::from_secs(30))
        .gzip(compression)
        .build()
        .context("Failed to build HTTP client")
}

fn observation_for(patient_id: &str) -> Value {
    json!({
        "resourceType": "Observation",
        "status": "final",
        "category": [{
            "coding": [{
                "system": "http://terminology.hl7.org/CodeSystem/observation-category",
                "code": "vital-signs"
            }]
        }],
        "subject": { "reference": format!("Patient/{patient_id}") },
        "effectiveDateTime": chrono::Utc::now().to_rfc3339(),
        "valueString": "This is the value"
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn sender_for(server: &MockServer) -> HttpSender {
        let url = url::Url::parse(&server.uri()).unwrap();
        HttpSender::new(
            &url,
            &TargetConfig::default(),
            false,
            Arc::new(EncounterStore::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_mock_sender_succeeds() {
        let sender = MockSender::new(0);
        let outcome = sender.send(Operation::Create, "ms1-1").await.unwrap();
        assert_eq!(outcome.status, 201);
        assert_eq!(sender.name(), "mock");
    }

    #[tokio::test]
    async fn test_read_drains_body_and_reports_cache_hit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Patient/ms1-42"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Cache", "HIT from gateway")
                    .set_body_string("{\"resourceType\":\"Patient\"}"),
            )
            .mount(&server)
            .await;

        let sender = sender_for(&server).await;
        let outcome = sender.send(Operation::Read, "ms1-42").await.unwrap();

        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.response_bytes, 26);
        assert_eq!(outcome.request_bytes, 0);
        assert_eq!(outcome.cache_hit, Some(true));
    }

    #[tokio::test]
    async fn test_update_sends_payload_and_reports_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/Encounter/ms2-7"))
            .and(header("Prefer", PREFER_RETURN_MINIMAL))
            .respond_with(ResponseTemplate::new(409).set_body_string("conflict"))
            .mount(&server)
            .await;

        let sender = sender_for(&server).await;
        let outcome = sender.send(Operation::Update, "ms2-7").await.unwrap();

        assert_eq!(outcome.status, 409);
        assert!(outcome.request_bytes > 0);
        assert_eq!(outcome.response_bytes, 8);
        assert_eq!(outcome.cache_hit, None);

        let received = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(body["resourceType"], "Encounter");
        assert_eq!(body["id"], "ms2-7");
        assert!(ENCOUNTER_STATUSES.contains(&body["status"].as_str().unwrap()));
    }

    #[tokio::test]
    async fn test_create_posts_observation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/Observation"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let sender = sender_for(&server).await;
        let outcome = sender.send(Operation::Create, "ms1-9").await.unwrap();
        assert_eq!(outcome.status, 201);

        let received = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(body["subject"]["reference"], "Patient/ms1-9");
        assert_eq!(outcome.request_bytes, received[0].body.len() as u64);
    }

    #[tokio::test]
    async fn test_transport_error_is_err() {
        let url = url::Url::parse("http://127.0.0.1:1").unwrap();
        let target = TargetConfig {
            connect_timeout_ms: 500,
            request_timeout_ms: 1000,
            ..TargetConfig::default()
        };
        let sender =
            HttpSender::new(&url, &target, false, Arc::new(EncounterStore::default())).unwrap();
        let failure = sender.send(Operation::Search, "ms1-1").await.unwrap_err();
        assert_eq!(failure.request_bytes, 0);

        // The payload was handed to the client before the connect failed.
        let failure = sender.send(Operation::Create, "ms1-1").await.unwrap_err();
        assert!(failure.request_bytes > 0);
        assert!(failure.to_string().contains("CREATE request for ms1-1 failed"));
    }

    #[tokio::test]
    async fn test_latency_stops_when_response_arrives() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Patient/ms1-3"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(150))
                    .set_body_string("{}"),
            )
            .mount(&server)
            .await;

        let sender = sender_for(&server).await;
        let outcome = sender.send(Operation::Read, "ms1-3").await.unwrap();
        assert!(outcome.latency_ms >= 150, "latency: {}", outcome.latency_ms);
        assert!(outcome.latency_ms < 5_000, "latency: {}", outcome.latency_ms);
    }

    #[tokio::test]
    async fn test_mock_sender_reports_its_delay_as_latency() {
        let outcome = MockSender::new(20)
            .send(Operation::Read, "ms1-1")
            .await
            .unwrap();
        assert!(outcome.latency_ms >= 20);
    }
}
