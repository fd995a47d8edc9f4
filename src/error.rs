// =============================================================================
// Error types for the MarketPulse engine
// =============================================================================
//
// Policy: construction-time misconfiguration and malformed input fail fast
// with a typed error. Runtime data-quality conditions (staleness, late ticks)
// are state, not errors — they surface as `Option`/`bool` and debug logs.
// =============================================================================

use thiserror::Error;

/// Errors returned at the engine's call boundaries.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("timeframe must be > 0 ms, got {0}")]
    InvalidTimeframe(i64),

    #[error("invalid tick from source '{src}': {reason}")]
    InvalidTick { src: String, reason: String },

    #[error("invalid order '{order_id}': {reason}")]
    InvalidOrder { order_id: String, reason: String },

    #[error("order id '{0}' is already registered")]
    DuplicateOrder(String),

    #[error("invalid engine config: {0}")]
    InvalidConfig(String),

    #[error("engine is shut down")]
    ShutDown,
}

impl EngineError {
    pub(crate) fn invalid_tick(source: &str, reason: impl Into<String>) -> Self {
        Self::InvalidTick {
            src: source.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_order(order_id: &str, reason: impl Into<String>) -> Self {
        Self::InvalidOrder {
            order_id: order_id.to_string(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_are_descriptive() {
        let e = EngineError::InvalidTimeframe(0);
        assert_eq!(e.to_string(), "timeframe must be > 0 ms, got 0");

        let e = EngineError::invalid_tick("binance-ws", "non-positive price -1");
        assert!(e.to_string().contains("binance-ws"));
        assert!(e.to_string().contains("non-positive price"));

        let e = EngineError::DuplicateOrder("abc".into());
        assert!(e.to_string().contains("abc"));
    }
}
