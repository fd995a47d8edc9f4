// =============================================================================
// MarketPulse Engine — real-time market data and order triggering
// =============================================================================
//
// Library core for a token-trading dashboard backend. Three tightly coupled
// pieces:
//
//   - `aggregator`  — turns an unbounded tick stream into fixed-width OHLCV
//                     candles (live + final emissions) for one timeframe.
//   - `reconciler`  — merges ticks from N labeled feeds into one authoritative
//                     current price with a freshest-wins policy.
//   - `monitor`     — evaluates conditional orders (limit / stop-loss /
//                     take-profit) against the reconciled price and fires each
//                     trigger exactly once.
//
// `orchestrator::Engine` wires the three together behind a single serialized
// tick intake. Everything outside this crate (wallet signing, swap execution,
// UI, persistence) is reached only through the typed event channels.
// =============================================================================

pub mod aggregator;
pub mod config;
pub mod error;
pub mod feed;
pub mod monitor;
pub mod orchestrator;
pub mod price_cache;
pub mod reconciler;
pub mod types;

pub use aggregator::CandleAggregator;
pub use config::EngineConfig;
pub use error::EngineError;
pub use monitor::{MonitoredOrder, OrderKind, OrderMonitor, OrderSide, OrderState, TriggerCondition};
pub use orchestrator::Engine;
pub use price_cache::PriceCache;
pub use reconciler::{PriceReconciler, PriceView};
pub use types::{Candle, CandleEvent, Tick, TickSide, TriggerEvent};
