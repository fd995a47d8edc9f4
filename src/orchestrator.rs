// =============================================================================
// Engine Orchestrator — wires feeds, reconciler, aggregators and monitor
// =============================================================================
//
// Thin by design. Feed adapters push `Tick`s into a bounded mpsc queue; one
// spawned intake task drains it and drives the reconciler plus every
// per-timeframe aggregator strictly sequentially. That queue is the
// serializing hand-off the single-writer components require — ticks are
// processed in arrival order, and `record_tick`/`process_tick` never run
// concurrently against the same instance.
//
// The order monitor reads prices through the reconciler's staleness gate, so
// a trigger can never fire on data the engine itself considers too old.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::aggregator::CandleAggregator;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::monitor::{MonitoredOrder, OrderMonitor, PriceSource};
use crate::price_cache::PriceCache;
use crate::reconciler::{PriceReconciler, PriceView};
use crate::types::{CandleEvent, Tick, TriggerEvent};

/// The reconciler behind its freshness gate, as seen by the order monitor.
struct ReconciledPriceSource {
    reconciler: Arc<PriceReconciler>,
    max_age_ms: i64,
}

impl PriceSource for ReconciledPriceSource {
    fn current_price(&self) -> Option<f64> {
        self.reconciler.fresh_price(self.max_age_ms)
    }
}

/// The assembled engine: one reconciler, one aggregator per configured
/// timeframe, one order monitor, one price cache.
pub struct Engine {
    config: EngineConfig,
    reconciler: Arc<PriceReconciler>,
    monitor: Arc<OrderMonitor>,
    price_cache: Arc<PriceCache>,
    /// Candle event senders by timeframe, for post-construction subscription.
    candle_events: HashMap<i64, broadcast::Sender<CandleEvent>>,
    tick_tx: mpsc::Sender<Tick>,
    shutdown: watch::Sender<bool>,
    intake_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Validate the config, build all components, and spawn the intake and
    /// evaluation loops. Must be called within a tokio runtime.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>, EngineError> {
        config.validate()?;

        let reconciler = Arc::new(PriceReconciler::new(&config.source_priority));
        let price_cache = Arc::new(PriceCache::new());

        let mut aggregators = Vec::with_capacity(config.timeframes_ms.len());
        let mut candle_events = HashMap::new();
        for &tf in &config.timeframes_ms {
            let agg = CandleAggregator::with_channel_capacity(tf, config.event_channel_capacity)?;
            candle_events.insert(tf, agg.events_handle());
            aggregators.push(agg);
        }

        let price_source: Arc<dyn PriceSource> = Arc::new(ReconciledPriceSource {
            reconciler: Arc::clone(&reconciler),
            max_age_ms: config.staleness_ms,
        });
        let monitor = Arc::new(OrderMonitor::with_channel_capacity(
            price_source,
            config.eval_interval_ms,
            config.event_channel_capacity,
        )?);
        monitor.start_evaluation_loop();

        let (tick_tx, tick_rx) = mpsc::channel(config.tick_queue_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let intake_handle = tokio::spawn(run_intake(
            tick_rx,
            shutdown_rx,
            Arc::clone(&reconciler),
            aggregators,
            Arc::clone(&price_cache),
        ));

        info!(
            timeframes = ?config.timeframes_ms,
            eval_interval_ms = config.eval_interval_ms,
            staleness_ms = config.staleness_ms,
            "engine started"
        );

        Ok(Arc::new(Self {
            config,
            reconciler,
            monitor,
            price_cache,
            candle_events,
            tick_tx,
            shutdown,
            intake_handle: Mutex::new(Some(intake_handle)),
        }))
    }

    /// A sender feed adapters use to push ticks into the intake queue.
    pub fn tick_sender(&self) -> mpsc::Sender<Tick> {
        self.tick_tx.clone()
    }

    /// Push one tick into the intake queue, waiting for capacity if the
    /// queue is full (backpressure on the producer).
    pub async fn ingest_tick(&self, tick: Tick) -> Result<(), EngineError> {
        self.tick_tx
            .send(tick)
            .await
            .map_err(|_| EngineError::ShutDown)
    }

    /// Subscribe to candle events for one configured timeframe.
    pub fn subscribe_candles(
        &self,
        timeframe_ms: i64,
    ) -> Result<broadcast::Receiver<CandleEvent>, EngineError> {
        self.candle_events
            .get(&timeframe_ms)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| {
                EngineError::InvalidConfig(format!(
                    "timeframe {timeframe_ms} ms is not configured"
                ))
            })
    }

    /// Subscribe to order trigger events.
    pub fn subscribe_triggers(&self) -> broadcast::Receiver<TriggerEvent> {
        self.monitor.subscribe()
    }

    /// Register a conditional order with the monitor.
    pub fn place_order(&self, order: MonitoredOrder) -> Result<(), EngineError> {
        self.monitor.start(order)
    }

    /// Cancel an order; `true` if this call performed the transition.
    pub fn cancel_order(&self, order_id: &str) -> bool {
        self.monitor.cancel(order_id)
    }

    /// Snapshot of the monitor's active orders.
    pub fn active_orders(&self) -> Vec<MonitoredOrder> {
        self.monitor.active_orders()
    }

    /// The reconciled current price view, regardless of freshness.
    pub fn current_price(&self) -> Option<PriceView> {
        self.reconciler.current_price()
    }

    /// Whether the reconciled price is older than the configured threshold.
    /// UI layers poll this for their disconnected/stale indicator.
    pub fn is_stale(&self) -> bool {
        self.reconciler.is_stale(self.config.staleness_ms)
    }

    /// The shared last-price cache (snapshot/restore lives there).
    pub fn price_cache(&self) -> &Arc<PriceCache> {
        &self.price_cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stop the intake loop and the order monitor.
    ///
    /// After this returns, no candle or trigger event will be emitted; all
    /// still-active orders are cancelled (`stop_all` semantics).
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.monitor.stop_all().await;
        let handle = self.intake_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("engine shut down");
    }
}

/// The single-writer intake loop: drains the tick queue in arrival order and
/// drives the reconciler, every aggregator, and the price cache.
async fn run_intake(
    mut tick_rx: mpsc::Receiver<Tick>,
    mut shutdown_rx: watch::Receiver<bool>,
    reconciler: Arc<PriceReconciler>,
    mut aggregators: Vec<CandleAggregator>,
    price_cache: Arc<PriceCache>,
) {
    loop {
        tokio::select! {
            maybe_tick = tick_rx.recv() => {
                let tick = match maybe_tick {
                    Some(t) => t,
                    None => break, // every sender dropped
                };

                if let Err(e) = reconciler.record_tick(&tick) {
                    warn!(error = %e, "tick rejected at intake");
                    continue;
                }

                for agg in &mut aggregators {
                    if let Err(e) = agg.process_tick(&tick) {
                        // Price was already validated; this only fires on a
                        // negative-volume tick.
                        warn!(
                            timeframe_ms = agg.timeframe_ms(),
                            error = %e,
                            "tick rejected by aggregator"
                        );
                    }
                }

                if let Some(view) = reconciler.current_price() {
                    price_cache.update(view);
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{OrderKind, OrderSide};
    use crate::types::{now_ms, TickSide};
    use std::time::Duration;

    fn test_config() -> EngineConfig {
        EngineConfig {
            timeframes_ms: vec![60_000],
            eval_interval_ms: 50,
            staleness_ms: 60_000,
            source_priority: vec!["ws".into(), "poll".into()],
            ..EngineConfig::default()
        }
    }

    fn tick(source: &str, price: f64, volume: f64, ts: i64) -> Tick {
        Tick::new(price, volume, TickSide::Unknown, source, ts)
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let mut cfg = test_config();
        cfg.timeframes_ms = vec![0];
        assert!(Engine::new(cfg).is_err());
    }

    #[tokio::test]
    async fn unknown_timeframe_subscription_is_an_error() {
        let engine = Engine::new(test_config()).unwrap();
        assert!(engine.subscribe_candles(60_000).is_ok());
        assert!(engine.subscribe_candles(123).is_err());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn end_to_end_candles_through_the_intake() {
        let engine = Engine::new(test_config()).unwrap();
        let mut candles = engine.subscribe_candles(60_000).unwrap();

        // Four ticks over two 60s buckets, driven through the intake queue.
        engine.ingest_tick(tick("ws", 1.0, 1.0, 0)).await.unwrap();
        engine.ingest_tick(tick("ws", 1.2, 2.0, 30_000)).await.unwrap();
        engine.ingest_tick(tick("ws", 0.9, 1.0, 61_000)).await.unwrap();
        engine.ingest_tick(tick("ws", 1.1, 1.0, 90_000)).await.unwrap();

        // 4 live events + 1 final for bucket 0.
        let mut events = Vec::new();
        for _ in 0..5 {
            events.push(candles.recv().await.unwrap());
        }

        let finals: Vec<_> = events.iter().filter(|e| e.is_final).collect();
        assert_eq!(finals.len(), 1);
        let first = &finals[0].candle;
        assert_eq!(first.bucket_start_ms, 0);
        assert_eq!(first.open, 1.0);
        assert_eq!(first.high, 1.2);
        assert_eq!(first.low, 1.0);
        assert_eq!(first.close, 1.2);
        assert!((first.volume - 3.0).abs() < f64::EPSILON);

        let last_live = events.iter().rev().find(|e| !e.is_final).unwrap();
        assert_eq!(last_live.candle.bucket_start_ms, 60_000);
        assert_eq!(last_live.candle.close, 1.1);

        // The reconciler and cache agree on the final tick.
        assert_eq!(engine.current_price().unwrap().price, 1.1);
        assert_eq!(engine.price_cache().last_price(), Some(1.1));

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn order_triggers_from_the_reconciled_price() {
        let engine = Engine::new(test_config()).unwrap();
        let mut triggers = engine.subscribe_triggers();

        engine
            .place_order(MonitoredOrder::new(
                "order-1",
                OrderKind::Limit,
                OrderSide::Buy,
                100.0,
                1.0,
            ))
            .unwrap();

        // Above target: no trigger.
        engine.ingest_tick(tick("ws", 105.0, 0.0, now_ms())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(triggers.try_recv().is_err());

        // Crosses target: fires exactly once.
        engine.ingest_tick(tick("ws", 99.0, 0.0, now_ms())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let event = triggers.try_recv().unwrap();
        assert_eq!(event.order_id, "order-1");
        assert_eq!(event.price, 99.0);

        engine.ingest_tick(tick("ws", 90.0, 0.0, now_ms())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(triggers.try_recv().is_err());

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stale_price_never_triggers() {
        let mut cfg = test_config();
        cfg.staleness_ms = 1_000;
        let engine = Engine::new(cfg).unwrap();
        let mut triggers = engine.subscribe_triggers();

        engine
            .place_order(MonitoredOrder::new(
                "order-1",
                OrderKind::StopLoss,
                OrderSide::Sell,
                100.0,
                1.0,
            ))
            .unwrap();

        // A price that would trigger, but stamped an hour ago.
        engine
            .ingest_tick(tick("ws", 50.0, 0.0, now_ms() - 3_600_000))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(triggers.try_recv().is_err());
        assert_eq!(engine.active_orders().len(), 1);
        assert!(engine.is_stale());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_orders_and_closes_intake() {
        let engine = Engine::new(test_config()).unwrap();
        engine
            .place_order(MonitoredOrder::new(
                "order-1",
                OrderKind::Limit,
                OrderSide::Buy,
                100.0,
                1.0,
            ))
            .unwrap();

        engine.shutdown().await;
        assert!(engine.active_orders().is_empty());
        assert!(matches!(
            engine.place_order(MonitoredOrder::new(
                "order-2",
                OrderKind::Limit,
                OrderSide::Buy,
                100.0,
                1.0,
            )),
            Err(EngineError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn bad_ticks_are_dropped_at_intake_without_stopping_the_loop() {
        let engine = Engine::new(test_config()).unwrap();
        let mut candles = engine.subscribe_candles(60_000).unwrap();

        engine.ingest_tick(tick("ws", -5.0, 1.0, 0)).await.unwrap();
        engine.ingest_tick(tick("ws", 2.0, 1.0, 1_000)).await.unwrap();

        let event = candles.recv().await.unwrap();
        assert_eq!(event.candle.open, 2.0);
        assert!(engine.current_price().is_some());

        engine.shutdown().await;
    }
}
