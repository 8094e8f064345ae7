//! Outbound notifications for newly found listings.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use nestwatch_core::Listing;
use nestwatch_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::AdapterError;

#[derive(Debug, Clone, Serialize)]
pub struct Notification<'a> {
    pub job_id: &'a str,
    pub provider_id: &'a str,
    pub listings: &'a [Listing],
}

#[async_trait]
pub trait NotificationAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, notification: &Notification<'_>) -> Result<(), AdapterError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationAdapter for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, notification: &Notification<'_>) -> Result<(), AdapterError> {
        for listing in notification.listings {
            info!(
                job_id = notification.job_id,
                provider_id = notification.provider_id,
                listing_id = %listing.id,
                title = %listing.title,
                price = ?listing.price,
                link = ?listing.link,
                "new listing"
            );
        }
        Ok(())
    }
}

/// POSTs the notification as JSON.
pub struct WebhookNotifier {
    url: String,
    http: Arc<HttpFetcher>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            url: url.into(),
            http,
        }
    }
}

#[async_trait]
impl NotificationAdapter for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, notification: &Notification<'_>) -> Result<(), AdapterError> {
        self.http
            .post_json("webhook", &self.url, notification)
            .await
            .map_err(|e| AdapterError::Notification {
                adapter: self.name().to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}

/// Per-job adapter entry in `jobs.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationConfig {
    Log,
    Webhook { url: String },
}

impl NotificationConfig {
    pub fn build(&self, http: Arc<HttpFetcher>) -> Arc<dyn NotificationAdapter> {
        match self {
            NotificationConfig::Log => Arc::new(LogNotifier),
            NotificationConfig::Webhook { url } => Arc::new(WebhookNotifier::new(url.clone(), http)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub delivered: usize,
    pub failed: usize,
}

/// Fans a notification out to every adapter and waits for all of them.
/// Adapter errors are logged and counted, never returned.
#[derive(Clone, Default)]
pub struct NotificationDispatcher {
    adapters: Vec<Arc<dyn NotificationAdapter>>,
}

impl NotificationDispatcher {
    pub fn new(adapters: Vec<Arc<dyn NotificationAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub async fn send(&self, provider_id: &str, listings: &[Listing], job_id: &str) -> DispatchSummary {
        let notification = Notification {
            job_id,
            provider_id,
            listings,
        };
        let results = join_all(self.adapters.iter().map(|adapter| {
            let notification = &notification;
            async move { (adapter.name().to_string(), adapter.send(notification).await) }
        }))
        .await;

        let mut summary = DispatchSummary::default();
        for (adapter, result) in results {
            match result {
                Ok(()) => summary.delivered += 1,
                Err(err) => {
                    warn!(adapter = %adapter, job_id, provider_id, error = %err, "notification failed");
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nestwatch_core::NewListing;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct Counting(AtomicUsize);

    #[async_trait]
    impl NotificationAdapter for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        async fn send(&self, notification: &Notification<'_>) -> Result<(), AdapterError> {
            self.0.fetch_add(notification.listings.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl NotificationAdapter for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        async fn send(&self, _notification: &Notification<'_>) -> Result<(), AdapterError> {
            Err(AdapterError::Notification {
                adapter: "failing".into(),
                message: "channel down".into(),
            })
        }
    }

    fn listing() -> Listing {
        Listing::from_new(Uuid::new_v4(), "job", NewListing::new("h", "immo-a", "Altbau", Utc::now()))
    }

    #[tokio::test]
    async fn failures_are_counted_not_raised() {
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let dispatcher = NotificationDispatcher::new(vec![
            counting.clone(),
            Arc::new(Failing),
            Arc::new(LogNotifier),
        ]);
        let summary = dispatcher.send("immo-a", &[listing(), listing()], "job").await;
        assert_eq!(summary, DispatchSummary { delivered: 2, failed: 1 });
        assert_eq!(counting.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn notification_config_is_tagged() {
        let config: NotificationConfig =
            serde_json::from_value(serde_json::json!({"kind": "webhook", "url": "https://hooks.example/x"}))
                .unwrap();
        assert_eq!(
            config,
            NotificationConfig::Webhook {
                url: "https://hooks.example/x".into()
            }
        );
    }
}
