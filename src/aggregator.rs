// =============================================================================
// Candle Aggregator — tick stream to fixed-width OHLCV buckets
// =============================================================================
//
// One aggregator owns exactly one timeframe. The open candle is mutated in
// place by every in-bucket tick and becomes immutable the instant a tick for
// a later bucket arrives, at which point it is emitted once as final and a
// new open candle begins. Late ticks (older bucket) are dropped so that a
// closed candle can never be retroactively reopened and finals are emitted in
// strictly increasing bucket order.
//
// No wall-clock flushing: an idle bucket only closes when a later tick
// arrives. Callers that need timeout-driven closure feed a synthetic
// zero-volume tick carrying the current time (`Tick::synthetic`).
//
// Single-writer discipline: `process_tick` takes `&mut self`; concurrent
// producers must hand off through a serializing queue (the orchestrator's
// intake channel does exactly that).
// =============================================================================

use tokio::sync::broadcast;
use tracing::debug;

use crate::error::EngineError;
use crate::types::{Candle, CandleEvent, Tick};

/// Default depth of the candle event channel when not configured explicitly.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Aggregates a tick stream into OHLCV candles for one fixed timeframe.
pub struct CandleAggregator {
    timeframe_ms: i64,
    open_candle: Option<Candle>,
    events: broadcast::Sender<CandleEvent>,
}

impl CandleAggregator {
    /// Create an aggregator for the given bucket width in milliseconds.
    pub fn new(timeframe_ms: i64) -> Result<Self, EngineError> {
        Self::with_channel_capacity(timeframe_ms, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create an aggregator with an explicit event channel capacity.
    pub fn with_channel_capacity(
        timeframe_ms: i64,
        channel_capacity: usize,
    ) -> Result<Self, EngineError> {
        if timeframe_ms <= 0 {
            return Err(EngineError::InvalidTimeframe(timeframe_ms));
        }
        if channel_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "candle channel capacity must be > 0".into(),
            ));
        }
        let (events, _) = broadcast::channel(channel_capacity);
        Ok(Self {
            timeframe_ms,
            open_candle: None,
            events,
        })
    }

    pub fn timeframe_ms(&self) -> i64 {
        self.timeframe_ms
    }

    /// The currently open (not yet final) candle, if any tick has arrived.
    pub fn open_candle(&self) -> Option<&Candle> {
        self.open_candle.as_ref()
    }

    /// Subscribe to candle events.
    ///
    /// Every processed tick produces one live event for its bucket; a bucket
    /// roll additionally produces the final event for the previous bucket
    /// first. Subscribers that fall more than the channel capacity behind
    /// observe `RecvError::Lagged` instead of blocking ingestion.
    pub fn subscribe(&self) -> broadcast::Receiver<CandleEvent> {
        self.events.subscribe()
    }

    /// Clone of the event sender, so the orchestrator can hand out
    /// subscriptions after the aggregator has moved into its intake task.
    pub(crate) fn events_handle(&self) -> broadcast::Sender<CandleEvent> {
        self.events.clone()
    }

    /// Fold one tick into the candle series.
    ///
    /// Rejects malformed ticks (non-positive or non-finite price, negative
    /// volume) instead of corrupting the open candle. Ticks whose bucket is
    /// older than the open candle are dropped silently (debug-logged).
    pub fn process_tick(&mut self, tick: &Tick) -> Result<(), EngineError> {
        if !tick.price.is_finite() || tick.price <= 0.0 {
            return Err(EngineError::invalid_tick(
                &tick.source,
                format!("non-positive price {}", tick.price),
            ));
        }
        if !tick.volume.is_finite() || tick.volume < 0.0 {
            return Err(EngineError::invalid_tick(
                &tick.source,
                format!("negative volume {}", tick.volume),
            ));
        }

        // Euclidean floor so pre-epoch timestamps still align downwards.
        let bucket = tick.timestamp_ms.div_euclid(self.timeframe_ms) * self.timeframe_ms;

        match &mut self.open_candle {
            Some(open) if bucket == open.bucket_start_ms => {
                open.apply(tick.price, tick.volume);
                let live = open.clone();
                self.emit(live, false);
            }
            Some(open) if bucket < open.bucket_start_ms => {
                debug!(
                    timeframe_ms = self.timeframe_ms,
                    tick_ts = tick.timestamp_ms,
                    tick_bucket = bucket,
                    open_bucket = open.bucket_start_ms,
                    source = %tick.source,
                    "late tick dropped"
                );
            }
            _ => {
                // First tick ever, or a tick for a later bucket: close out the
                // previous candle (if any) before seeding the new one.
                if let Some(closed) = self.open_candle.take() {
                    self.emit(closed, true);
                }
                let seeded =
                    Candle::seed(bucket, self.timeframe_ms, tick.price, tick.volume);
                self.open_candle = Some(seeded.clone());
                self.emit(seeded, false);
            }
        }

        Ok(())
    }

    fn emit(&self, candle: Candle, is_final: bool) {
        // A send error only means no subscriber is currently listening.
        let _ = self.events.send(CandleEvent { candle, is_final });
    }
}
