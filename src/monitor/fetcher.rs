// src/monitor/fetcher.rs
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::FetchError;
use crate::model::SourceConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Transport-level "unchanged" (HTTP 304).
    NotModified,
    Content { body: String, etag: Option<String> },
}

/// Fetch capability consumed by the change monitor.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        source: &SourceConfig,
        etag: Option<&str>,
    ) -> Result<FetchOutcome, FetchError>;
}

/// reqwest-backed fetcher with conditional GET.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pixeltrace-autoupdate/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        source: &SourceConfig,
        etag: Option<&str>,
    ) -> Result<FetchOutcome, FetchError> {
        let transport = |e: reqwest::Error| FetchError::Transport {
            source_name: source.name.clone(),
            message: e.to_string(),
        };

        let mut req = self.client.get(&source.url);
        if let Some(tag) = etag {
            req = req.header(reqwest::header::IF_NONE_MATCH, tag);
        }
        let resp = req.send().await.map_err(transport)?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                source_name: source.name.clone(),
                status: status.as_u16(),
            });
        }
        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await.map_err(transport)?;
        Ok(FetchOutcome::Content { body, etag })
    }
}

// --- Test helper ---

/// Serves queued responses per source; an exhausted queue answers
/// `NotModified`.
#[derive(Default)]
pub struct ScriptedFetcher {
    queue: Mutex<HashMap<String, VecDeque<Result<FetchOutcome, FetchError>>>>,
    calls: Mutex<Vec<(String, Option<String>)>>,
    delay: Option<Duration>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch sleeps this long first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, source: &str, response: Result<FetchOutcome, FetchError>) {
        let mut q = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        q.entry(source.to_string()).or_default().push_back(response);
    }

    pub fn push_body(&self, source: &str, body: &str) {
        self.push(
            source,
            Ok(FetchOutcome::Content {
                body: body.to_string(),
                etag: None,
            }),
        );
    }

    /// `(source, etag sent)` for every fetch so far.
    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        source: &SourceConfig,
        etag: Option<&str>,
    ) -> Result<FetchOutcome, FetchError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((source.name.clone(), etag.map(str::to_string)));
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        let mut q = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        q.get_mut(&source.name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(FetchOutcome::NotModified))
    }
}
