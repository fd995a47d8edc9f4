// =============================================================================
// MarketPulse Engine — Demo Binary
// =============================================================================
//
// Wires a WebSocket push feed and an HTTP polling fallback for one symbol
// into the engine, logs candle closes and order triggers, and places a pair
// of demo orders far from the market so they are visible but inert.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use marketpulse::feed;
use marketpulse::monitor::{MonitoredOrder, OrderKind, OrderSide};
use marketpulse::types::Tick;
use marketpulse::{Engine, EngineConfig};

const WS_SOURCE: &str = "binance-ws";
const POLL_SOURCE: &str = "binance-poll";
const POLL_INTERVAL_MS: u64 = 2_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("MarketPulse engine starting up");

    let symbol = std::env::var("MARKETPULSE_SYMBOL")
        .unwrap_or_else(|_| "BTCUSDT".into())
        .to_uppercase();

    // ── 2. Engine ────────────────────────────────────────────────────────
    let config = EngineConfig {
        timeframes_ms: vec![60_000, 300_000],
        eval_interval_ms: 2_000,
        staleness_ms: 5_000,
        source_priority: vec![WS_SOURCE.into(), POLL_SOURCE.into()],
        ..EngineConfig::default()
    };
    let engine = Engine::new(config)?;
    info!(symbol = %symbol, "engine running");

    // ── 3. Feed supervision ──────────────────────────────────────────────
    {
        let tx = engine.tick_sender();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = feed::run_trade_feed(&sym, WS_SOURCE, &tx).await {
                    error!(symbol = %sym, error = %e, "WS feed error — reconnecting in 5s");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    {
        let tx = engine.tick_sender();
        let sym = symbol.clone();
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            loop {
                if let Err(e) =
                    feed::run_poll_feed(&client, &sym, POLL_SOURCE, POLL_INTERVAL_MS, &tx).await
                {
                    error!(symbol = %sym, error = %e, "poll feed error — restarting in 5s");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    // ── 4. Idle-bucket flush ─────────────────────────────────────────────
    // The aggregators never watch the wall clock; feed a synthetic tick with
    // the last cached price so idle candles still close on time.
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(15));
            loop {
                ticker.tick().await;
                if engine.is_stale() {
                    continue;
                }
                if let Some(price) = engine.price_cache().last_price() {
                    let tick = Tick::synthetic(price, marketpulse::types::now_ms(), "clock");
                    if engine.ingest_tick(tick).await.is_err() {
                        break;
                    }
                }
            }
        });
    }

    // ── 5. Event sinks ───────────────────────────────────────────────────
    {
        let mut candles = engine.subscribe_candles(60_000)?;
        tokio::spawn(async move {
            loop {
                match candles.recv().await {
                    Ok(ev) if ev.is_final => {
                        info!(
                            bucket = ev.candle.bucket_start_ms,
                            open = ev.candle.open,
                            high = ev.candle.high,
                            low = ev.candle.low,
                            close = ev.candle.close,
                            volume = ev.candle.volume,
                            "1m candle closed"
                        );
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "candle sink lagged");
                    }
                    Err(_) => break,
                }
            }
        });
    }

    {
        let mut triggers = engine.subscribe_triggers();
        tokio::spawn(async move {
            while let Ok(ev) = triggers.recv().await {
                // Real execution (wallet signing, swap submission) attaches
                // here; the demo only reports.
                info!(
                    order_id = %ev.order_id,
                    kind = %ev.kind,
                    side = %ev.side,
                    target = ev.target_price,
                    price = ev.price,
                    "order triggered"
                );
            }
        });
    }

    // ── 6. Demo orders ───────────────────────────────────────────────────
    // Wait for a first reconciled price, then bracket it wide.
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let price = loop {
                if let Some(p) = engine.price_cache().last_price() {
                    break p;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            };

            let buy = MonitoredOrder::new(
                uuid::Uuid::new_v4().to_string(),
                OrderKind::Limit,
                OrderSide::Buy,
                price * 0.95,
                0.01,
            );
            let sell = MonitoredOrder::new(
                uuid::Uuid::new_v4().to_string(),
                OrderKind::TakeProfit,
                OrderSide::Sell,
                price * 1.05,
                0.01,
            );
            for order in [buy, sell] {
                if let Err(e) = engine.place_order(order) {
                    warn!(error = %e, "failed to place demo order");
                }
            }
            info!(reference_price = price, "demo orders placed at ±5%");
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    engine.shutdown().await;
    info!("MarketPulse shut down complete.");
    Ok(())
}
