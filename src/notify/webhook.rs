use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use std::num::NonZeroU32;
use std::sync::Arc;

use super::{Notifier, TradeEvent};

const DEFAULT_MAX_PER_MINUTE: u32 = 30;

type WebhookRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Posts trade events as JSON to a webhook URL
///
/// Clones share the HTTP client and the rate limiter.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
    rate_limiter: Arc<WebhookRateLimiter>,
}

impl WebhookNotifier {
    /// # Arguments
    /// * `max_per_minute` - delivery budget; 0 falls back to the default
    pub fn new(url: impl Into<String>, max_per_minute: u32) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        let per_minute = NonZeroU32::new(max_per_minute)
            .or(NonZeroU32::new(DEFAULT_MAX_PER_MINUTE))
            .context("Invalid webhook rate limit")?;
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(per_minute)));

        Ok(Self {
            client,
            url: url.into(),
            rate_limiter,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &TradeEvent) -> Result<()> {
        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .with_context(|| format!("Failed to reach webhook {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            anyhow::bail!("Webhook returned {}: {}", status, body);
        }

        tracing::debug!("Delivered notification: {}", event.summary());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> TradeEvent {
        TradeEvent::BalanceReset {
            previous_balance: 98.5,
            balance: 100.0,
            reason: "weekly reset".to_string(),
        }
    }

    #[tokio::test]
    async fn test_posts_event_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header("content-type", "application/json")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"event":"balance_reset","reason":"weekly reset"}"#.to_string(),
            ))
            .with_status(200)
            .create_async()
            .await;

        let notifier = WebhookNotifier::new(format!("{}/hook", server.url()), 60).unwrap();
        notifier.notify(&event()).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/hook")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let notifier = WebhookNotifier::new(format!("{}/hook", server.url()), 0).unwrap();
        let err = notifier.notify(&event()).await.unwrap_err();

        assert!(err.to_string().contains("500"));
    }
}
