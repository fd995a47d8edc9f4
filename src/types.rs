// =============================================================================
// Shared types used across the MarketPulse engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Which side of the book a trade hit, when the feed reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickSide {
    Buy,
    Sell,
    Unknown,
}

impl Default for TickSide {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for TickSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A single price/trade observation from one feed.
///
/// Immutable once created; the shared unit flowing between the reconciler,
/// the aggregators, and the order monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Trade or quote price. Must be > 0; enforced at the ingest boundary.
    pub price: f64,
    /// Traded volume, 0.0 for pure quote updates and synthetic ticks.
    #[serde(default)]
    pub volume: f64,
    /// Aggressor side, if the feed reports it.
    #[serde(default)]
    pub side: TickSide,
    /// Label of the feed that produced this tick (e.g. "binance-ws").
    pub source: String,
    /// Event time in Unix epoch milliseconds, as stamped by the feed.
    pub timestamp_ms: i64,
}

impl Tick {
    pub fn new(
        price: f64,
        volume: f64,
        side: TickSide,
        source: impl Into<String>,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            price,
            volume,
            side,
            source: source.into(),
            timestamp_ms,
        }
    }

    /// A zero-volume tick carrying the last known price at `timestamp_ms`.
    ///
    /// Callers feed these on a timer to close idle candle buckets, since the
    /// aggregator itself never watches the wall clock.
    pub fn synthetic(price: f64, timestamp_ms: i64, source: impl Into<String>) -> Self {
        Self::new(price, 0.0, TickSide::Unknown, source, timestamp_ms)
    }
}

/// One OHLCV candle for a fixed timeframe bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket start, aligned: `floor(ts / timeframe_ms) * timeframe_ms`.
    pub bucket_start_ms: i64,
    /// Bucket width in milliseconds.
    pub timeframe_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Seed a fresh candle from the first tick of a bucket.
    pub(crate) fn seed(bucket_start_ms: i64, timeframe_ms: i64, price: f64, volume: f64) -> Self {
        Self {
            bucket_start_ms,
            timeframe_ms,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    /// Fold one more in-bucket tick into the candle.
    pub(crate) fn apply(&mut self, price: f64, volume: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume;
    }
}

/// Emitted by the aggregator on every processed tick.
///
/// `is_final == false` is a live update: repeated emissions for the same
/// `bucket_start_ms` replace each other. `is_final == true` is terminal for
/// that bucket and always precedes any live emission of the next bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleEvent {
    pub candle: Candle,
    pub is_final: bool,
}

/// Emitted by the order monitor when a conditional order fires.
///
/// Carries everything an execution sink needs without a lookup; the order is
/// already terminal (and removed from the active set) by the time this event
/// is observable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub order_id: String,
    /// The reconciled price that satisfied the condition.
    pub price: f64,
    pub target_price: f64,
    pub kind: crate::monitor::OrderKind,
    pub side: crate::monitor::OrderSide,
    pub amount: f64,
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
