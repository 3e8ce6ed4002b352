//! Google Cloud Pub/Sub pull source (REST API)
//!
//! Architecture:
//! - N receive workers, each looping pull → handle → acknowledge
//! - Access tokens from the GCE/GKE metadata server, cached until shortly
//!   before expiry and shared by all workers
//! - Emulator mode talks plain HTTP without authentication
//!
//! Transient failures (connection errors, timeouts, 429, 5xx) are retried
//! with a capped linear backoff. Any other failure ends `receive`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, RequestBuilder};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex as TokioMutex};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use super::{supervise_workers, MessageHandler, MessageSource, SourceError};
use crate::common::ShutdownReceiver;
use crate::config::TailConfig;

/// Production Pub/Sub endpoint
pub const PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";

/// Access token endpoint of the GCE/GKE metadata server
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh cached tokens this long before they expire
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Lifetime assumed for a token whose `expires_in` cannot be represented
const FALLBACK_TOKEN_LIFETIME: Duration = Duration::from_secs(300);

/// Pulls are long-polled by the server, so this only guards against hangs
const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

const RETRY_BACKOFF_STEP: Duration = Duration::from_millis(500);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Pause after a pull that returned nothing
const EMPTY_PULL_PAUSE: Duration = Duration::from_millis(100);

/// How requests are authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Auth {
    /// No credentials (emulator, tests)
    None,
    /// Bearer tokens from the metadata server of the node
    MetadataServer,
}

/// Pub/Sub source configuration
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// Base URL, e.g. "https://pubsub.googleapis.com"
    pub endpoint: String,
    /// Full subscription path, "projects/{project}/subscriptions/{name}"
    pub subscription_path: String,
    /// Number of concurrent receive workers
    pub workers: usize,
    /// Maximum messages per pull request
    pub max_messages: u32,
    pub auth: Auth,
    /// Where `Auth::MetadataServer` fetches access tokens
    pub metadata_token_url: String,
}

impl PubSubConfig {
    /// Build the source configuration from the resolved tailer configuration
    pub fn from_tail_config(config: &TailConfig) -> Self {
        let (endpoint, auth) = match config.emulator_host.as_deref() {
            Some(host) => (emulator_endpoint(host), Auth::None),
            None => (PUBSUB_ENDPOINT.to_string(), Auth::MetadataServer),
        };
        Self {
            endpoint,
            subscription_path: subscription_path(&config.project, &config.subscription),
            workers: config.receive_workers,
            max_messages: config.max_messages,
            auth,
            metadata_token_url: METADATA_TOKEN_URL.to_string(),
        }
    }
}

/// Expand a subscription name into its full resource path
///
/// Names already given as `projects/.../subscriptions/...` are kept as is.
pub fn subscription_path(project: &str, subscription: &str) -> String {
    if subscription.starts_with("projects/") {
        subscription.to_string()
    } else {
        format!("projects/{}/subscriptions/{}", project, subscription)
    }
}

fn emulator_endpoint(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    }
}

fn token_expiry(now: Instant, expires_in: u64) -> Instant {
    now.checked_add(Duration::from_secs(expires_in))
        .unwrap_or(now + FALLBACK_TOKEN_LIFETIME)
}

fn retry_delay(failures: u32) -> Duration {
    RETRY_BACKOFF_STEP
        .saturating_mul(failures)
        .min(MAX_RETRY_BACKOFF)
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    #[serde(default)]
    message: PubsubMessage,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubsubMessage {
    /// Base64-encoded payload
    #[serde(default)]
    data: String,
    #[serde(default)]
    message_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: &'a [String],
}

#[derive(Deserialize)]
struct AccessToken {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

// =============================================================================
// Source
// =============================================================================

/// Pulls log entries from a Pub/Sub subscription
pub struct PubSubSource {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    config: PubSubConfig,
    token: TokioMutex<Option<CachedToken>>,
}

impl PubSubSource {
    /// Create a source; no request is made until `connect` or `receive`
    pub fn new(config: PubSubConfig) -> Result<Self, SourceError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                config,
                token: TokioMutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.inner.config
    }
}

#[async_trait]
impl MessageSource for PubSubSource {
    fn name(&self) -> &'static str {
        "pubsub"
    }

    async fn connect(&self) -> Result<(), SourceError> {
        let config = &self.inner.config;
        self.inner.get_subscription().await?;
        info!(
            endpoint = %config.endpoint,
            subscription = %config.subscription_path,
            "Connected to Pub/Sub subscription"
        );
        Ok(())
    }

    async fn receive(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: ShutdownReceiver,
    ) -> Result<(), SourceError> {
        let (stop_tx, _) = broadcast::channel::<()>(1);
        let mut workers = JoinSet::new();
        for worker_id in 0..self.inner.config.workers.max(1) {
            workers.spawn(Arc::clone(&self.inner).run_worker(
                worker_id,
                Arc::clone(&handler),
                stop_tx.subscribe(),
            ));
        }

        info!(
            workers = workers.len(),
            subscription = %self.inner.config.subscription_path,
            "Receiving from Pub/Sub"
        );

        supervise_workers(workers, stop_tx, shutdown).await?;
        info!("Pub/Sub receive stopped");
        Ok(())
    }
}

impl Inner {
    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/v1/{}{}",
            self.config.endpoint, self.config.subscription_path, suffix
        )
    }

    /// Receive worker: pull → handle → acknowledge until stopped
    async fn run_worker(
        self: Arc<Self>,
        worker_id: usize,
        handler: Arc<dyn MessageHandler>,
        mut stop: ShutdownReceiver,
    ) -> Result<(), SourceError> {
        debug!(worker_id, "Receive worker started");
        let mut failures: u32 = 0;

        loop {
            let pulled = tokio::select! {
                biased;
                _ = stop.recv() => break,
                pulled = self.pull() => pulled,
            };

            let messages = match pulled {
                Ok(messages) => {
                    failures = 0;
                    messages
                }
                Err(e) if e.is_transient() => {
                    failures = failures.saturating_add(1);
                    let delay = retry_delay(failures);
                    warn!(worker_id, error = %e, retry_in = ?delay, "Pull failed, retrying");
                    tokio::select! {
                        biased;
                        _ = stop.recv() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
                Err(e) => return Err(e),
            };

            if messages.is_empty() {
                tokio::select! {
                    biased;
                    _ = stop.recv() => break,
                    _ = tokio::time::sleep(EMPTY_PULL_PAUSE) => continue,
                }
            }

            let mut ack_ids = Vec::with_capacity(messages.len());
            for received in messages {
                // invalid base64 reaches the handler as an empty, undecodable payload
                let payload = STANDARD
                    .decode(received.message.data.as_bytes())
                    .unwrap_or_else(|e| {
                        debug!(
                            worker_id,
                            message_id = %received.message.message_id,
                            error = %e,
                            "Message data is not valid base64"
                        );
                        Vec::new()
                    });
                handler.handle(&payload);
                ack_ids.push(received.ack_id);
            }

            match self.acknowledge(&ack_ids).await {
                Ok(()) => trace!(worker_id, count = ack_ids.len(), "Acknowledged messages"),
                Err(e) if e.is_transient() => warn!(
                    worker_id,
                    error = %e,
                    count = ack_ids.len(),
                    "Acknowledge failed, messages will be redelivered"
                ),
                Err(e) => return Err(e),
            }
        }

        debug!(worker_id, "Receive worker stopped");
        Ok(())
    }

    async fn get_subscription(&self) -> Result<(), SourceError> {
        let _: IgnoredAny = self.send(self.client.get(self.url(""))).await?;
        Ok(())
    }

    async fn pull(&self) -> Result<Vec<ReceivedMessage>, SourceError> {
        let request = self.client.post(self.url(":pull")).json(&PullRequest {
            max_messages: self.config.max_messages,
        });
        let response: PullResponse = self.send(request).await?;
        Ok(response.received_messages)
    }

    async fn acknowledge(&self, ack_ids: &[String]) -> Result<(), SourceError> {
        let request = self
            .client
            .post(self.url(":acknowledge"))
            .json(&AcknowledgeRequest { ack_ids });
        let _: IgnoredAny = self.send(request).await?;
        Ok(())
    }

    async fn send<R: DeserializeOwned>(&self, request: RequestBuilder) -> Result<R, SourceError> {
        let request = match self.bearer_token().await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<R>().await?)
    }

    async fn bearer_token(&self) -> Result<Option<String>, SourceError> {
        if self.config.auth == Auth::None {
            return Ok(None);
        }

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(Some(token.value.clone()));
            }
        }

        let fresh = self.fetch_token().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(Some(value))
    }

    async fn fetch_token(&self) -> Result<CachedToken, SourceError> {
        let response = self
            .client
            .get(&self.config.metadata_token_url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // throttling and server errors are retried like any Pub/Sub call
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(SourceError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            return Err(SourceError::Auth(format!(
                "metadata server returned {}: {}",
                status, body
            )));
        }

        let token: AccessToken = response
            .json()
            .await
            .map_err(|e| SourceError::Auth(format!("invalid token response: {}", e)))?;
        debug!(expires_in = token.expires_in, "Fetched access token");

        Ok(CachedToken {
            value: token.access_token,
            expires_at: token_expiry(Instant::now(), token.expires_in),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use parking_lot::Mutex;
    use serde_json::json;

    const PULL_PATH: &str = "/v1/projects/p/subscriptions/s:pull";
    const ACK_PATH: &str = "/v1/projects/p/subscriptions/s:acknowledge";

    #[derive(Default)]
    struct CollectingHandler {
        payloads: Mutex<Vec<Vec<u8>>>,
    }

    impl MessageHandler for CollectingHandler {
        fn handle(&self, payload: &[u8]) {
            self.payloads.lock().push(payload.to_vec());
        }
    }

    fn test_config(endpoint: String) -> PubSubConfig {
        PubSubConfig {
            endpoint,
            subscription_path: subscription_path("p", "s"),
            workers: 1,
            max_messages: 10,
            auth: Auth::None,
            metadata_token_url: METADATA_TOKEN_URL.to_string(),
        }
    }

    fn metadata_config(server: &mockito::ServerGuard) -> PubSubConfig {
        PubSubConfig {
            auth: Auth::MetadataServer,
            metadata_token_url: format!("{}/token", server.url()),
            ..test_config(server.url())
        }
    }

    async fn wait_for(handler: &CollectingHandler, count: usize) {
        for _ in 0..200 {
            if handler.payloads.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("handler did not receive {count} payloads");
    }

    #[test]
    fn test_subscription_path() {
        assert_eq!(
            subscription_path("proj", "logs"),
            "projects/proj/subscriptions/logs"
        );
        assert_eq!(
            subscription_path("ignored", "projects/other/subscriptions/logs"),
            "projects/other/subscriptions/logs"
        );
    }

    #[test]
    fn test_emulator_endpoint() {
        assert_eq!(emulator_endpoint("localhost:8085"), "http://localhost:8085");
        assert_eq!(emulator_endpoint("http://pubsub:8085/"), "http://pubsub:8085");
    }

    #[test]
    fn test_config_from_tail_config() {
        let mut tail = TailConfig {
            project: "proj".into(),
            subscription: "logs".into(),
            receive_workers: 4,
            flush_interval: Duration::from_secs(5),
            http_port: 5000,
            max_messages: 100,
            emulator_host: None,
        };
        let config = PubSubConfig::from_tail_config(&tail);
        assert_eq!(config.endpoint, PUBSUB_ENDPOINT);
        assert_eq!(config.auth, Auth::MetadataServer);
        assert_eq!(config.metadata_token_url, METADATA_TOKEN_URL);
        assert_eq!(config.subscription_path, "projects/proj/subscriptions/logs");
        assert_eq!(config.workers, 4);

        tail.emulator_host = Some("localhost:8085".into());
        let config = PubSubConfig::from_tail_config(&tail);
        assert_eq!(config.endpoint, "http://localhost:8085");
        assert_eq!(config.auth, Auth::None);
    }

    #[test]
    fn test_retry_delay_is_capped() {
        assert_eq!(retry_delay(1), Duration::from_millis(500));
        assert_eq!(retry_delay(4), Duration::from_secs(2));
        assert_eq!(retry_delay(1_000), MAX_RETRY_BACKOFF);
    }

    #[test]
    fn test_token_expiry_overflow_falls_back() {
        let now = Instant::now();
        assert_eq!(token_expiry(now, 3600), now + Duration::from_secs(3600));
        assert_eq!(token_expiry(now, u64::MAX), now + FALLBACK_TOKEN_LIFETIME);
    }

    #[tokio::test]
    async fn test_metadata_token_is_sent_and_cached() {
        let mut server = mockito::Server::new_async().await;
        let token = server
            .mock("GET", "/token")
            .match_header("metadata-flavor", "Google")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "ya29.test", "expires_in": 3599, "token_type": "Bearer"}"#)
            .expect(1)
            .create_async()
            .await;
        let subscription = server
            .mock("GET", "/v1/projects/p/subscriptions/s")
            .match_header("authorization", "Bearer ya29.test")
            .with_status(200)
            .with_body("{}")
            .expect(2)
            .create_async()
            .await;

        let source = PubSubSource::new(metadata_config(&server)).unwrap();
        tokio_test::assert_ok!(source.connect().await);
        tokio_test::assert_ok!(source.connect().await);

        token.assert_async().await;
        subscription.assert_async().await;
    }

    #[tokio::test]
    async fn test_metadata_unavailable_is_retried() {
        let mut server = mockito::Server::new_async().await;
        let unavailable = server
            .mock("GET", "/token")
            .with_status(503)
            .with_body("metadata server overloaded")
            .expect_at_least(1)
            .create_async()
            .await;
        let pull = server
            .mock("POST", PULL_PATH)
            .expect(0)
            .create_async()
            .await;

        let source = PubSubSource::new(metadata_config(&server)).unwrap();
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(async move {
            source
                .receive(Arc::new(CollectingHandler::default()), rx)
                .await
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!task.is_finished());
        tx.send(()).unwrap();
        tokio_test::assert_ok!(task.await.unwrap());

        unavailable.assert_async().await;
        pull.assert_async().await;
    }

    #[tokio::test]
    async fn test_metadata_forbidden_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        let _forbidden = server
            .mock("GET", "/token")
            .with_status(403)
            .with_body("no service account")
            .create_async()
            .await;

        let source = PubSubSource::new(metadata_config(&server)).unwrap();
        let (_tx, rx) = broadcast::channel(1);
        let err = source
            .receive(Arc::new(CollectingHandler::default()), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Auth(_)));
    }

    #[test]
    fn test_pull_response_without_messages() {
        let response: PullResponse = serde_json::from_str("{}").unwrap();
        assert!(response.received_messages.is_empty());
    }

    #[tokio::test]
    async fn test_connect_checks_subscription() {
        let mut server = mockito::Server::new_async().await;
        let found = server
            .mock("GET", "/v1/projects/p/subscriptions/s")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"name": "projects/p/subscriptions/s"}"#)
            .create_async()
            .await;

        let source = PubSubSource::new(test_config(server.url())).unwrap();
        tokio_test::assert_ok!(source.connect().await);
        found.assert_async().await;
    }

    #[tokio::test]
    async fn test_connect_missing_subscription() {
        let mut server = mockito::Server::new_async().await;
        let _missing = server
            .mock("GET", "/v1/projects/p/subscriptions/s")
            .with_status(404)
            .with_body(r#"{"error": {"code": 404, "message": "Resource not found"}}"#)
            .create_async()
            .await;

        let source = PubSubSource::new(test_config(server.url())).unwrap();
        let err = source.connect().await.unwrap_err();
        assert!(matches!(err, SourceError::Status { status: 404, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_receive_handles_and_acknowledges_everything() {
        let mut server = mockito::Server::new_async().await;
        let valid = STANDARD.encode(br#"{"textPayload":"[a]","timestamp":"2021-03-01T12:00:00Z"}"#);
        let malformed = STANDARD.encode(b"{not json");
        let pull = server
            .mock("POST", PULL_PATH)
            .match_body(Matcher::PartialJson(json!({"maxMessages": 10})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "receivedMessages": [
                        {"ackId": "a1", "message": {"data": valid, "messageId": "1"}},
                        {"ackId": "a2", "message": {"data": malformed, "messageId": "2"}},
                        {"ackId": "a3", "message": {"data": "***", "messageId": "3"}}
                    ]
                })
                .to_string(),
            )
            .expect_at_least(1)
            .create_async()
            .await;
        let ack = server
            .mock("POST", ACK_PATH)
            .match_body(Matcher::Json(json!({"ackIds": ["a1", "a2", "a3"]})))
            .with_status(200)
            .with_body("{}")
            .expect_at_least(1)
            .create_async()
            .await;

        let source = PubSubSource::new(test_config(server.url())).unwrap();
        let handler = Arc::new(CollectingHandler::default());
        let (tx, rx) = broadcast::channel(1);

        let task_handler: Arc<dyn MessageHandler> = handler.clone();
        let task = tokio::spawn(async move { source.receive(task_handler, rx).await });

        wait_for(&handler, 3).await;
        tx.send(()).unwrap();
        tokio_test::assert_ok!(task.await.unwrap());

        pull.assert_async().await;
        ack.assert_async().await;

        let payloads = handler.payloads.lock();
        assert_eq!(&payloads[0][..], br#"{"textPayload":"[a]","timestamp":"2021-03-01T12:00:00Z"}"#);
        assert_eq!(&payloads[1][..], b"{not json");
        assert!(payloads[2].is_empty());
    }

    #[tokio::test]
    async fn test_receive_fails_on_permission_denied() {
        let mut server = mockito::Server::new_async().await;
        let _denied = server
            .mock("POST", PULL_PATH)
            .with_status(403)
            .with_body(r#"{"error": {"code": 403, "status": "PERMISSION_DENIED"}}"#)
            .create_async()
            .await;

        let source = PubSubSource::new(test_config(server.url())).unwrap();
        let (_tx, rx) = broadcast::channel(1);
        let err = source
            .receive(Arc::new(CollectingHandler::default()), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Status { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_receive_retries_unavailable_until_shutdown() {
        let mut server = mockito::Server::new_async().await;
        let unavailable = server
            .mock("POST", PULL_PATH)
            .with_status(503)
            .expect_at_least(1)
            .create_async()
            .await;

        let source = PubSubSource::new(test_config(server.url())).unwrap();
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(async move {
            source
                .receive(Arc::new(CollectingHandler::default()), rx)
                .await
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(()).unwrap();
        tokio_test::assert_ok!(task.await.unwrap());
        unavailable.assert_async().await;
    }
}
