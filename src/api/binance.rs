use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use tokio::time::{sleep, Duration};

use crate::models::PriceTick;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

/// Polls the Binance public spot ticker for last prices
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
    quote_asset: String,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    symbol: String,
    price: String,
}

impl BinanceClient {
    /// # Arguments
    /// * `base_url` - REST host, e.g. "https://api.binance.com"
    /// * `quote_asset` - appended to every symbol to form the pair
    pub fn with_base_url(base_url: impl Into<String>, quote_asset: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            quote_asset: quote_asset.into().to_uppercase(),
        })
    }

    /// Exchange pair for a base symbol, e.g. "SOL" -> "SOLUSDT"
    pub fn pair_for(&self, symbol: &str) -> String {
        format!("{}{}", symbol.to_uppercase(), self.quote_asset)
    }

    /// Latest price for `symbol`, stamped with the local receive time
    ///
    /// Retries transient failures with exponential backoff.
    pub async fn get_price(&self, symbol: &str) -> Result<PriceTick> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.fetch_price_once(symbol).await {
                Ok(tick) => return Ok(tick),
                Err(e) if attempt < MAX_RETRIES => {
                    let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
                    tracing::warn!(
                        "Attempt {}/{} failed for {}: {:#}. Retrying in {}ms...",
                        attempt,
                        MAX_RETRIES,
                        symbol,
                        e,
                        backoff_ms
                    );
                    sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => {
                    return Err(e.context(format!(
                        "Failed to fetch {} price after {} attempts",
                        symbol, MAX_RETRIES
                    )))
                }
            }
        }
    }

    async fn fetch_price_once(&self, symbol: &str) -> Result<PriceTick> {
        let pair = self.pair_for(symbol);
        let url = format!("{}/api/v3/ticker/price", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[("symbol", pair.as_str())])
            .send()
            .await
            .with_context(|| format!("Request for {} failed", pair))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            anyhow::bail!("Binance API error ({}): {}", status, body);
        }

        let ticker: TickerPrice = response
            .json()
            .await
            .context("Failed to parse ticker response")?;

        let price: f64 = ticker
            .price
            .parse()
            .with_context(|| format!("Invalid price '{}' for {}", ticker.price, ticker.symbol))?;

        Ok(PriceTick::new(symbol.to_uppercase(), price, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[test]
    fn test_pair_for() {
        let client = BinanceClient::with_base_url("https://api.binance.com/", "usdt").unwrap();
        assert_eq!(client.pair_for("sol"), "SOLUSDT");
    }

    #[tokio::test]
    async fn test_get_price_parses_string_price() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v3/ticker/price")
            .match_query(Matcher::UrlEncoded("symbol".into(), "SOLUSDT".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"symbol":"SOLUSDT","price":"142.35000000"}"#)
            .create_async()
            .await;

        let client = BinanceClient::with_base_url(server.url(), "USDT").unwrap();
        let tick = client.get_price("sol").await.unwrap();

        assert_eq!(tick.symbol, "SOL");
        assert!((tick.price - 142.35).abs() < 1e-9);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_error_is_not_a_price() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v3/ticker/price")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code":-1121,"msg":"Invalid symbol."}"#)
            .expect_at_least(1)
            .create_async()
            .await;

        let client = BinanceClient::with_base_url(server.url(), "USDT").unwrap();
        let err = client.get_price("NOPE").await.unwrap_err();

        assert!(format!("{:#}", err).contains("Invalid symbol"));
    }
}
