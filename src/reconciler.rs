// =============================================================================
// Price Reconciler — one authoritative price from N concurrent feeds
// =============================================================================
//
// Merge policy is "most recent wins": the source with the freshest
// `last_update_ms` supplies the current price. No averaging — smoothing would
// hide real moves during fast markets, and a trading surface needs freshness
// over stability. Ties on the exact same timestamp resolve through the
// configured source-priority list so the result is deterministic regardless
// of map iteration order.
//
// Staleness is wall-clock based, not tick-count based: a feed that stops
// sending is flagged even though no new tick arrives to re-evaluate it.
// Callers poll `is_stale` on a timer.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::types::{now_ms, Tick};

/// Latest observation recorded for one source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceSourceState {
    pub last_price: f64,
    pub last_update_ms: i64,
}

/// The reconciled current price and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceView {
    pub price: f64,
    pub source: String,
    pub timestamp_ms: i64,
}

/// Merges ticks from labeled sources into a single current-price view.
///
/// The current price is a pure function over the per-source states — it is
/// never cached separately, so there is no second copy to fall out of sync.
pub struct PriceReconciler {
    sources: RwLock<HashMap<String, PriceSourceState>>,
    /// Source label -> tie-break rank; lower wins. Unlisted sources rank
    /// after every listed one and among themselves by name.
    priority: HashMap<String, usize>,
}

impl PriceReconciler {
    /// `source_priority` lists labels in tie-break order, highest first.
    pub fn new(source_priority: &[String]) -> Self {
        let priority = source_priority
            .iter()
            .enumerate()
            .map(|(rank, name)| (name.clone(), rank))
            .collect();
        Self {
            sources: RwLock::new(HashMap::new()),
            priority,
        }
    }

    /// Record the latest observation from a tick's own source.
    ///
    /// A source is trusted to order its own updates, so its latest value is
    /// accepted unconditionally — even if the timestamp is older than what
    /// another source reported.
    pub fn record_tick(&self, tick: &Tick) -> Result<(), EngineError> {
        if !tick.price.is_finite() || tick.price <= 0.0 {
            return Err(EngineError::invalid_tick(
                &tick.source,
                format!("non-positive price {}", tick.price),
            ));
        }
        if tick.source.is_empty() {
            return Err(EngineError::invalid_tick(
                &tick.source,
                "empty source label",
            ));
        }

        let mut sources = self.sources.write();
        sources.insert(
            tick.source.clone(),
            PriceSourceState {
                last_price: tick.price,
                last_update_ms: tick.timestamp_ms,
            },
        );
        Ok(())
    }

    /// The freshest source's price, or `None` if no source ever reported.
    pub fn current_price(&self) -> Option<PriceView> {
        let sources = self.sources.read();
        let mut best: Option<(&String, &PriceSourceState)> = None;

        for (name, state) in sources.iter() {
            best = match best {
                None => Some((name, state)),
                Some((best_name, best_state)) => {
                    if self.beats(name, state, best_name, best_state) {
                        Some((name, state))
                    } else {
                        Some((best_name, best_state))
                    }
                }
            };
        }

        best.map(|(name, state)| PriceView {
            price: state.last_price,
            source: name.clone(),
            timestamp_ms: state.last_update_ms,
        })
    }

    /// The reconciled price, gated on freshness against the wall clock.
    /// `None` when no source reported or the freshest one is stale.
    pub fn fresh_price(&self, max_age_ms: i64) -> Option<f64> {
        let view = self.current_price()?;
        if now_ms() - view.timestamp_ms > max_age_ms {
            debug!(
                source = %view.source,
                timestamp_ms = view.timestamp_ms,
                max_age_ms,
                "reconciled price is stale"
            );
            None
        } else {
            Some(view.price)
        }
    }

    /// True if the most recent source's update is older than `max_age_ms`,
    /// or if no source has ever reported.
    pub fn is_stale(&self, max_age_ms: i64) -> bool {
        self.is_stale_at(now_ms(), max_age_ms)
    }

    /// Staleness against a caller-supplied clock; the testable core of
    /// [`is_stale`].
    pub fn is_stale_at(&self, now_ms: i64, max_age_ms: i64) -> bool {
        match self.current_price() {
            Some(view) => now_ms - view.timestamp_ms > max_age_ms,
            None => true,
        }
    }

    /// Snapshot of one source's latest state, if it ever reported.
    pub fn source_state(&self, source: &str) -> Option<PriceSourceState> {
        self.sources.read().get(source).copied()
    }

    /// Number of sources that have reported at least once.
    pub fn source_count(&self) -> usize {
        self.sources.read().len()
    }

    /// True if `(a_name, a)` wins over `(b_name, b)`.
    fn beats(
        &self,
        a_name: &str,
        a: &PriceSourceState,
        b_name: &str,
        b: &PriceSourceState,
    ) -> bool {
        if a.last_update_ms != b.last_update_ms {
            return a.last_update_ms > b.last_update_ms;
        }
        let rank_a = self.rank(a_name);
        let rank_b = self.rank(b_name);
        if rank_a != rank_b {
            return rank_a < rank_b;
        }
        // Both unlisted: name order keeps the result deterministic.
        a_name < b_name
    }

    fn rank(&self, name: &str) -> usize {
        self.priority.get(name).copied().unwrap_or(usize::MAX)
    }
}
