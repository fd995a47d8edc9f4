// =============================================================================
// WebSocket trade feed — push adapter for Binance-style aggTrade streams
// =============================================================================

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::types::{Tick, TickSide};

/// Connect to the aggTrade WebSocket stream for a single symbol and push
/// ticks into the engine's intake queue under `source`.
///
/// Runs until the stream disconnects or an error occurs, then returns so the
/// caller can handle reconnection.
///
/// ```ignore
/// let tx = engine.tick_sender();
/// loop {
///     if let Err(e) = run_trade_feed("BTCUSDT", "binance-ws", &tx).await {
///         error!("ws feed error: {e}");
///     }
///     tokio::time::sleep(Duration::from_secs(5)).await;
/// }
/// ```
pub async fn run_trade_feed(
    symbol: &str,
    source: &str,
    tick_tx: &mpsc::Sender<Tick>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("wss://stream.binance.com:9443/ws/{lower}@aggTrade");
    info!(url = %url, symbol = %symbol, source = %source, "connecting to trade WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to trade WebSocket")?;

    info!(symbol = %symbol, source = %source, "trade WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_agg_trade(&text, source) {
                        Ok(tick) => {
                            if tick_tx.send(tick).await.is_err() {
                                info!(symbol = %symbol, "engine intake closed — stopping feed");
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse aggTrade message");
                        }
                    }
                }
                // Ping / Pong / Binary / Close frames are ignored --
                // tungstenite handles pong replies automatically.
            }
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "trade WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "trade WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a Binance aggTrade message into a [`Tick`].
///
/// Expected shape:
/// ```json
/// { "e": "aggTrade", "s": "BTCUSDT", "p": "37000.00", "q": "0.123",
///   "T": 1700000000000, "m": true }
/// ```
///
/// `m == true` means the buyer was the maker, i.e. the taker was selling.
fn parse_agg_trade(text: &str, source: &str) -> Result<Tick> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse aggTrade JSON")?;

    let price: f64 = root["p"]
        .as_str()
        .context("missing field p")?
        .parse()
        .context("failed to parse price")?;

    let quantity: f64 = root["q"]
        .as_str()
        .context("missing field q")?
        .parse()
        .context("failed to parse quantity")?;

    let timestamp_ms = root["T"].as_i64().context("missing field T")?;

    let side = match root["m"].as_bool().context("missing field m")? {
        true => TickSide::Sell,
        false => TickSide::Buy,
    };

    Ok(Tick::new(price, quantity, side, source, timestamp_ms))
}
