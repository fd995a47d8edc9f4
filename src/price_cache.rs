// =============================================================================
// Price Cache — explicit shared cache with snapshot/restore
// =============================================================================
//
// An explicit last-known-price object the orchestrator owns and passes by
// reference to
// whichever components need a warm last-known price (UI bootstrap, the idle
// candle flush). `snapshot()`/`restore()` replace ad-hoc serialization;
// the optional file helpers use the same atomic tmp + rename pattern as the
// engine config.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::reconciler::PriceView;

/// Serialisable snapshot of the cache contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceCacheSnapshot {
    pub last_view: Option<PriceView>,
}

/// Last reconciled price, shared across components behind one lock.
#[derive(Default)]
pub struct PriceCache {
    last_view: RwLock<Option<PriceView>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest reconciled view. Called by the orchestrator's intake
    /// loop after every accepted tick.
    pub fn update(&self, view: PriceView) {
        *self.last_view.write() = Some(view);
    }

    /// The most recently cached view, if any.
    pub fn last_view(&self) -> Option<PriceView> {
        self.last_view.read().clone()
    }

    /// The most recently cached price, if any.
    pub fn last_price(&self) -> Option<f64> {
        self.last_view.read().as_ref().map(|v| v.price)
    }

    /// Capture the current contents for caller-side persistence.
    pub fn snapshot(&self) -> PriceCacheSnapshot {
        PriceCacheSnapshot {
            last_view: self.last_view.read().clone(),
        }
    }

    /// Replace the contents from a previously captured snapshot.
    pub fn restore(&self, snapshot: PriceCacheSnapshot) {
        *self.last_view.write() = snapshot.last_view;
    }

    /// Persist a snapshot to `path` (atomic tmp + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(&self.snapshot())
            .context("failed to serialise price cache snapshot")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp snapshot to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp snapshot to {}", path.display()))?;

        info!(path = %path.display(), "price cache snapshot saved (atomic)");
        Ok(())
    }

    /// Load and restore a snapshot from `path`.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read price cache snapshot from {}", path.display()))?;
        let snapshot: PriceCacheSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse price cache snapshot from {}", path.display()))?;

        self.restore(snapshot);
        info!(path = %path.display(), "price cache snapshot restored");
        Ok(())
    }
}
