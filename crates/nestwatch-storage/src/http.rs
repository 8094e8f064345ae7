//! Shared HTTP client for provider pages, media downloads and webhooks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{RequestBuilder, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    /// Concurrent requests allowed against one provider or webhook host.
    pub per_scope_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            per_scope_concurrency: 2,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http client shut down")]
    Closed,
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

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_scope_limit: usize,
    per_scope: Mutex<HashMap<String, Arc<Semaphore>>>,
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
            per_scope_limit: config.per_scope_concurrency.max(1),
            per_scope: Mutex::new(HashMap::new()),
        })
    }

    async fn permits(
        &self,
        scope: &str,
    ) -> Result<(OwnedSemaphorePermit, OwnedSemaphorePermit), FetchError> {
        let global = self
            .global_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Closed)?;
        let scoped = {
            let mut map = self.per_scope.lock().await;
            map.entry(scope.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_scope_limit)))
                .clone()
        };
        let scoped = scoped.acquire_owned().await.map_err(|_| FetchError::Closed)?;
        Ok((global, scoped))
    }

    /// Single GET. Failures surface to the caller; the next scheduled run is the retry.
    pub async fn fetch_bytes(&self, scope: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", scope, url, method = "GET");
        self.send(scope, self.client.get(url))
            .instrument(span)
            .await
    }

    pub async fn fetch_text(&self, scope: &str, url: &str) -> Result<String, FetchError> {
        Ok(self.fetch_bytes(scope, url).await?.text())
    }

    /// POST a JSON body. Used by webhook notifiers.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        scope: &str,
        url: &str,
        body: &T,
    ) -> Result<StatusCode, FetchError> {
        let span = info_span!("http_fetch", scope, url, method = "POST");
        let response = self
            .send(scope, self.client.post(url).json(body))
            .instrument(span)
            .await?;
        Ok(response.status)
    }

    async fn send(&self, scope: &str, request: RequestBuilder) -> Result<FetchedResponse, FetchError> {
        let _permits = self.permits(scope).await?;
        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            debug!(status = status.as_u16(), url = %final_url, "http request rejected");
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
