// =============================================================================
// Polling price feed — HTTP fallback adapter
// =============================================================================
//
// Polls a REST ticker endpoint on a fixed interval and pushes the quoted
// price as a zero-volume tick. Fetch failures are logged and skipped; the
// reconciler's staleness tracking is what surfaces a persistently failing
// poll feed, so there is nothing to escalate here.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::types::{now_ms, Tick, TickSide};

/// Poll the Binance ticker-price endpoint for `symbol` every `interval_ms`
/// and push quotes into the engine's intake queue under `source`.
///
/// Runs until the engine intake closes.
pub async fn run_poll_feed(
    client: &reqwest::Client,
    symbol: &str,
    source: &str,
    interval_ms: u64,
    tick_tx: &mpsc::Sender<Tick>,
) -> Result<()> {
    let url = format!(
        "https://api.binance.com/api/v3/ticker/price?symbol={}",
        symbol.to_uppercase()
    );
    info!(url = %url, source = %source, interval_ms, "polling price feed started");

    let mut ticker = interval(Duration::from_millis(interval_ms));
    loop {
        ticker.tick().await;

        let price = match fetch_price(client, &url).await {
            Ok(p) => p,
            Err(e) => {
                warn!(source = %source, error = %e, "price poll failed — will retry next cycle");
                continue;
            }
        };

        let tick = Tick::new(price, 0.0, TickSide::Unknown, source, now_ms());
        debug!(source = %source, price, "poll feed tick");

        if tick_tx.send(tick).await.is_err() {
            info!(source = %source, "engine intake closed — stopping poll feed");
            return Ok(());
        }
    }
}

async fn fetch_price(client: &reqwest::Client, url: &str) -> Result<f64> {
    let body: serde_json::Value = client
        .get(url)
        .send()
        .await
        .context("ticker request failed")?
        .error_for_status()
        .context("ticker request returned an error status")?
        .json()
        .await
        .context("failed to decode ticker response")?;

    parse_ticker_price(&body)
}

/// Parse the ticker-price payload.
///
/// Expected shape:
/// ```json
/// { "symbol": "BTCUSDT", "price": "37000.00" }
/// ```
fn parse_ticker_price(body: &serde_json::Value) -> Result<f64> {
    body["price"]
        .as_str()
        .context("missing field price")?
        .parse::<f64>()
        .context("failed to parse price as f64")
}
