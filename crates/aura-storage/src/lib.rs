//! In-memory session storage + HTTP fetch utilities for Aura.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "aura-storage";

/// A session resolved from the registry. `created` is set when the requested
/// id was missing or unknown and a fresh session was minted.
pub struct SessionHandle<S> {
    pub id: String,
    pub state: Arc<Mutex<S>>,
    pub created: bool,
}

struct SessionSlot<S> {
    state: Arc<Mutex<S>>,
    last_seen: Instant,
}

impl<S> SessionSlot<S> {
    fn new(state: Arc<Mutex<S>>) -> Self {
        Self {
            state,
            last_seen: Instant::now(),
        }
    }
}

/// Maps session ids to owned per-session state. Each session sits behind its
/// own mutex so turns on one session run one at a time while different
/// sessions proceed independently.
pub struct SessionRegistry<S> {
    sessions: RwLock<HashMap<String, SessionSlot<S>>>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> SessionRegistry<S> {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Look up `requested`, or create a session under a new id when it is
    /// absent or unknown.
    pub async fn resolve(&self, requested: Option<&str>, make: impl FnOnce() -> S) -> SessionHandle<S> {
        if let Some(id) = requested.filter(|id| !id.is_empty()) {
            if let Some(slot) = self.sessions.write().await.get_mut(id) {
                slot.last_seen = Instant::now();
                return SessionHandle {
                    id: id.to_string(),
                    state: Arc::clone(&slot.state),
                    created: false,
                };
            }
        }

        let id = Uuid::new_v4().to_string();
        let state = Arc::new(Mutex::new(make()));
        self.sessions
            .write()
            .await
            .insert(id.clone(), SessionSlot::new(Arc::clone(&state)));
        debug!(session_id = %id, "created session");
        SessionHandle {
            id,
            state,
            created: true,
        }
    }

    /// Look up an existing session without creating one or refreshing its
    /// idle clock.
    pub async fn get(&self, id: &str) -> Option<Arc<Mutex<S>>> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|slot| Arc::clone(&slot.state))
    }

    /// Drop a session. Returns whether it existed.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            debug!(session_id = %id, "removed session");
        }
        removed
    }

    /// Drop sessions not resolved within `ttl`. A session whose turn is
    /// still running is kept. Returns how many were evicted.
    pub async fn evict_idle(&self, ttl: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, slot| {
            let keep = slot.last_seen.elapsed() < ttl || slot.state.try_lock().is_err();
            if !keep {
                debug!(session_id = %id, "evicted idle session");
            }
            keep
        });
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Retry schedule for outbound calls. Research turns degrade instead of
/// retrying, so the default performs no retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("fetcher is shutting down")]
    Closed,
}

/// Shared outbound HTTP client: one timeout, one global concurrency limit and
/// one backoff policy for every collaborator call.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", method = "GET", url);
        async {
            let resp = self.send_with_backoff(url, || self.client.get(url)).await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?.to_vec();
            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    /// POST a JSON body and decode a JSON reply. Header values stay out of
    /// the tracing span so API keys are never logged.
    pub async fn post_json<B, R>(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        body: &B,
    ) -> Result<R, FetchError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let span = info_span!("http_fetch", method = "POST", url);
        async {
            let resp: reqwest::Response = self
                .send_with_backoff(url, || {
                    let mut req = self.client.post(url).json(body);
                    for (name, value) in headers {
                        req = req.header(*name, value.as_str());
                    }
                    req
                })
                .await?;
            resp.json::<R>()
                .await
                .map_err(|source| FetchError::Decode {
                    url: url.to_string(),
                    source,
                })
        }
        .instrument(span)
        .await
    }

    async fn send_with_backoff<F>(&self, url: &str, build: F) -> Result<reqwest::Response, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn missing_or_unknown_ids_mint_new_sessions() {
        let registry = SessionRegistry::<Vec<String>>::new();

        let first = registry.resolve(None, Vec::new).await;
        assert!(first.created);

        let unknown = registry.resolve(Some("not-a-session"), Vec::new).await;
        assert!(unknown.created);
        assert_ne!(unknown.id, "not-a-session");
        assert_ne!(unknown.id, first.id);

        let again = registry.resolve(Some(&first.id), Vec::new).await;
        assert!(!again.created);
        assert_eq!(again.id, first.id);
        assert!(Arc::ptr_eq(&again.state, &first.state));
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn sessions_keep_independent_state() {
        let registry = SessionRegistry::<Vec<String>>::new();
        let a = registry.resolve(None, Vec::new).await;
        let b = registry.resolve(None, Vec::new).await;

        a.state.lock().await.push("from a".into());

        assert_eq!(a.state.lock().await.len(), 1);
        assert!(b.state.lock().await.is_empty());
    }

    #[tokio::test]
    async fn remove_evicts_session() {
        let registry = SessionRegistry::<u32>::new();
        let handle = registry.resolve(None, || 7).await;

        assert!(registry.remove(&handle.id).await);
        assert!(!registry.remove(&handle.id).await);
        assert!(registry.get(&handle.id).await.is_none());
        assert!(registry.is_empty().await);

        let fresh = registry.resolve(Some(&handle.id), || 0).await;
        assert!(fresh.created);
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_unless_busy() {
        let registry = SessionRegistry::<u32>::new();
        let idle = registry.resolve(None, || 1).await;
        let busy = registry.resolve(None, || 2).await;

        assert_eq!(registry.evict_idle(Duration::from_secs(3600)).await, 0);
        assert_eq!(registry.len().await, 2);

        let guard = busy.state.lock().await;
        assert_eq!(registry.evict_idle(Duration::ZERO).await, 1);
        assert!(registry.get(&idle.id).await.is_none());
        assert!(registry.get(&busy.id).await.is_some());
        drop(guard);

        assert_eq!(registry.evict_idle(Duration::ZERO).await, 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn turns_on_one_session_are_serialized() {
        let registry = Arc::new(SessionRegistry::<Vec<u32>>::new());
        let handle = registry.resolve(None, Vec::new).await;

        let mut tasks = Vec::new();
        for i in 0..8u32 {
            let state = Arc::clone(&handle.state);
            tasks.push(tokio::spawn(async move {
                let mut guard = state.lock().await;
                let before = guard.len();
                tokio::task::yield_now().await;
                guard.push(i);
                assert_eq!(guard.len(), before + 1);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(handle.state.lock().await.len(), 8);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn default_policy_does_not_retry() {
        assert_eq!(BackoffPolicy::default().max_retries, 0);
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    /// Local HTTP server answering 503 for the first `failures` connections
    /// and `200 ok` afterwards.
    async fn flaky_server(failures: usize) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let reply = if n < failures {
                    "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                } else {
                    "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok"
                };
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}/"), hits)
    }

    fn fetcher_with_retries(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn retryable_status_is_retried_up_to_the_policy() {
        let (url, hits) = flaky_server(2).await;
        let response = fetcher_with_retries(2).fetch_bytes(&url).await.unwrap();
        assert_eq!(response.text(), "ok");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn default_policy_fails_on_first_error_status() {
        let (url, hits) = flaky_server(1).await;
        let err = fetcher_with_retries(0).fetch_bytes(&url).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fetcher_builds_with_default_config() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: Some("aura-test/0.1".into()),
            ..Default::default()
        });
        assert!(fetcher.is_ok());
    }
}
