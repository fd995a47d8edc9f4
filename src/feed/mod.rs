// =============================================================================
// Feed adapters — external tick sources for the engine
// =============================================================================
//
// The engine core places no constraint on transport; it only needs `Tick`s
// with a stable `source` label pushed into its intake queue. These two
// adapters cover the usual pairing for a trading dashboard: a WebSocket push
// feed as primary and an HTTP polling feed as fallback. Reconnection policy
// belongs to the caller (supervise the returned futures and re-invoke with a
// backoff), not to the adapters themselves.
// =============================================================================

pub mod poll;
pub mod ws;

pub use poll::run_poll_feed;
pub use ws::run_trade_feed;
