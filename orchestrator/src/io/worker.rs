//! Execution worker abstraction.
//!
//! The [`ExecutionWorker`] trait decouples orchestration from the backend
//! that actually runs sessions. [`HttpWorker`] talks to a session service
//! over HTTP; [`ResilientWorker`] wraps any worker with exponential backoff
//! on transient failures and a circuit breaker. Tests use scripted workers
//! from `test_support`.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::retry::{Backoff, CircuitBreaker};
use crate::error::{Error, Result};
use crate::io::config::{EndpointConfig, ExecutionConfig};

/// Everything a fresh sandbox is given at creation. The brief follows as
/// the first `execute` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionContext {
    pub working_dir: PathBuf,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Queued,
    Running,
    Completed,
    ReadyForReview,
    Errored,
    #[serde(other)]
    Unknown,
}

impl SessionState {
    /// The session produced its final output.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::ReadyForReview)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub status: SessionState,
    #[serde(default)]
    pub last_output: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[async_trait]
pub trait ExecutionWorker: Send + Sync {
    /// Create a new isolated session; returns its id.
    async fn submit(&self, context: &SessionContext) -> Result<String>;
    /// Send text into a session.
    async fn execute(&self, session_id: &str, text: &str) -> Result<()>;
    async fn poll_status(&self, session_id: &str) -> Result<WorkerStatus>;
    /// All session messages, oldest first.
    async fn list_messages(&self, session_id: &str) -> Result<Vec<String>>;
    /// Tear the session down. Must be safe to call more than once.
    async fn terminate(&self, session_id: &str) -> Result<()>;
}

/// Worker backed by an HTTP session service.
pub struct HttpWorker {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct SubmitResponse {
    session_id: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    messages: Vec<String>,
}

impl HttpWorker {
    pub fn new(config: &EndpointConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/sessions{}", self.base_url, path)
    }
}

/// Map transport failures: timeouts, connection errors and 5xx are transient.
pub(crate) fn classify(err: reqwest::Error) -> Error {
    let transient = err.is_timeout()
        || err.is_connect()
        || err.status().is_some_and(|s| s.is_server_error());
    if transient {
        Error::TransientWorker(err.to_string())
    } else {
        Error::Worker(err.to_string())
    }
}

pub(crate) async fn send(request: RequestBuilder) -> Result<reqwest::Response> {
    let response = request.send().await.map_err(classify)?;
    let status = response.status();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::TransientWorker(format!("service responded {status}")));
    }
    if !status.is_success() {
        return Err(Error::Worker(format!("service responded {status}")));
    }
    Ok(response)
}

pub(crate) async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
    send(request)
        .await?
        .json::<T>()
        .await
        .map_err(|err| Error::Worker(format!("decode response: {err}")))
}

#[async_trait]
impl ExecutionWorker for HttpWorker {
    #[instrument(skip_all, fields(label = %context.label))]
    async fn submit(&self, context: &SessionContext) -> Result<String> {
        let response: SubmitResponse =
            send_json(self.client.post(self.url("")).json(context)).await?;
        debug!(session_id = %response.session_id, "session created");
        Ok(response.session_id)
    }

    async fn execute(&self, session_id: &str, text: &str) -> Result<()> {
        let body = serde_json::json!({ "message": text });
        send(
            self.client
                .post(self.url(&format!("/{session_id}/execute")))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn poll_status(&self, session_id: &str) -> Result<WorkerStatus> {
        send_json(self.client.get(self.url(&format!("/{session_id}/status")))).await
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<String>> {
        let response: MessagesResponse =
            send_json(self.client.get(self.url(&format!("/{session_id}/messages")))).await?;
        Ok(response.messages)
    }

    async fn terminate(&self, session_id: &str) -> Result<()> {
        let result = send(self.client.delete(self.url(&format!("/{session_id}")))).await;
        match result {
            Ok(_) => Ok(()),
            // Already gone counts as torn down.
            Err(Error::Worker(message)) if message.contains("404") => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Retries transient failures with backoff; opens a circuit after repeated
/// transient failures so a dead service is not hammered.
pub struct ResilientWorker {
    inner: Arc<dyn ExecutionWorker>,
    backoff: Backoff,
    retries: u32,
    breaker: Mutex<CircuitBreaker>,
}

impl ResilientWorker {
    pub fn new(inner: Arc<dyn ExecutionWorker>, config: &ExecutionConfig) -> Self {
        Self {
            inner,
            backoff: config.backoff(),
            retries: config.transient_retries,
            breaker: Mutex::new(CircuitBreaker::new(
                config.breaker_threshold,
                Duration::from_secs(config.breaker_cool_down_secs),
            )),
        }
    }

    fn breaker_allows(&self) -> bool {
        let breaker = self.breaker.lock().unwrap_or_else(PoisonError::into_inner);
        breaker.allows(Instant::now())
    }

    fn record(&self, success: bool) {
        let mut breaker = self.breaker.lock().unwrap_or_else(PoisonError::into_inner);
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure(Instant::now());
        }
    }

    async fn call<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            if !self.breaker_allows() {
                return Err(Error::TransientWorker(format!(
                    "circuit open, {op} not attempted"
                )));
            }
            match f().await {
                Ok(value) => {
                    self.record(true);
                    return Ok(value);
                }
                Err(err) if err.is_retryable() => {
                    self.record(false);
                    if attempt >= self.retries {
                        return Err(err);
                    }
                    let delay = self.backoff.delay(attempt);
                    warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %err, "transient worker failure, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl ExecutionWorker for ResilientWorker {
    async fn submit(&self, context: &SessionContext) -> Result<String> {
        self.call("submit", || self.inner.submit(context)).await
    }

    async fn execute(&self, session_id: &str, text: &str) -> Result<()> {
        self.call("execute", || self.inner.execute(session_id, text))
            .await
    }

    async fn poll_status(&self, session_id: &str) -> Result<WorkerStatus> {
        self.call("poll_status", || self.inner.poll_status(session_id))
            .await
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<String>> {
        self.call("list_messages", || self.inner.list_messages(session_id))
            .await
    }

    /// Teardown bypasses the breaker: an open circuit must never leave a
    /// session running. Transient failures still back off and retry.
    async fn terminate(&self, session_id: &str) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.inner.terminate(session_id).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < self.retries => {
                    let delay = self.backoff.delay(attempt);
                    warn!(session_id, attempt, delay_ms = delay.as_millis() as u64, error = %err, "teardown failed, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedSession, ScriptedWorker};

    fn fast_config(retries: u32, threshold: u32) -> ExecutionConfig {
        ExecutionConfig {
            transient_retries: retries,
            backoff_initial_ms: 1,
            backoff_max_ms: 2,
            breaker_threshold: threshold,
            ..ExecutionConfig::default()
        }
    }

    #[tokio::test]
    async fn transient_submit_failures_are_retried() {
        let inner = Arc::new(ScriptedWorker::new(vec![ScriptedSession::passing("ok")]));
        inner.fail_next_submits(2);
        let worker = ResilientWorker::new(inner.clone(), &fast_config(3, 10));
        let context = SessionContext {
            working_dir: PathBuf::from("/tmp"),
            label: "cp".to_string(),
        };
        let session = worker.submit(&context).await.expect("submit");
        assert!(!session.is_empty());
        assert_eq!(inner.submit_attempts(), 3);
    }

    #[tokio::test]
    async fn breaker_opens_after_repeated_transient_failures() {
        let inner = Arc::new(ScriptedWorker::new(vec![]));
        inner.fail_next_submits(100);
        let worker = ResilientWorker::new(inner.clone(), &fast_config(0, 2));
        let context = SessionContext {
            working_dir: PathBuf::from("/tmp"),
            label: "cp".to_string(),
        };
        assert!(worker.submit(&context).await.is_err());
        assert!(worker.submit(&context).await.is_err());
        let err = worker.submit(&context).await.unwrap_err();
        assert!(err.to_string().contains("circuit open"));
        assert_eq!(inner.submit_attempts(), 2);
    }

    #[tokio::test]
    async fn open_breaker_still_tears_sessions_down() {
        let inner = Arc::new(ScriptedWorker::new(vec![]));
        inner.attach("s1", ScriptedSession::running_forever());
        inner.fail_next_polls(100);
        let worker = ResilientWorker::new(inner.clone(), &fast_config(0, 1));

        assert!(worker.poll_status("s1").await.is_err());
        let err = worker.poll_status("s1").await.unwrap_err();
        assert!(err.to_string().contains("circuit open"));

        worker.terminate("s1").await.expect("terminate");
        assert_eq!(inner.terminated(), vec!["s1".to_string()]);
        assert_eq!(inner.live(), 0);
    }

    #[test]
    fn unknown_session_states_deserialize() {
        let status: WorkerStatus =
            serde_json::from_str(r#"{"status": "hibernating"}"#).expect("parse");
        assert_eq!(status.status, SessionState::Unknown);
        assert!(status.last_output.is_empty());
    }
}
