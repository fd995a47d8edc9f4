// =============================================================================
// Engine Configuration — caller-supplied tunables with atomic save
// =============================================================================
//
// The engine core never reads environment variables or files on its own; it
// only ever receives a constructed `EngineConfig`. The JSON load/save helpers
// exist for callers (the demo binary, an orchestrating service) that want to
// persist their tunables. Persistence uses an atomic tmp + rename pattern to
// prevent corruption on crash, and every field carries `#[serde(default)]`
// so adding new fields never breaks loading an older file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EngineError;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_timeframes_ms() -> Vec<i64> {
    // 1m, 5m, 15m — the intervals the dashboard charts subscribe to.
    vec![60_000, 300_000, 900_000]
}

fn default_eval_interval_ms() -> u64 {
    2_000
}

fn default_staleness_ms() -> i64 {
    5_000
}

fn default_event_channel_capacity() -> usize {
    256
}

fn default_tick_queue_capacity() -> usize {
    1_024
}

// =============================================================================
// EngineConfig
// =============================================================================

/// All tunables for one engine instance, supplied at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Candle timeframes to aggregate, in milliseconds. One aggregator runs
    /// per entry, all fed the same reconciled tick stream.
    #[serde(default = "default_timeframes_ms")]
    pub timeframes_ms: Vec<i64>,

    /// How often the order monitor sweeps active orders.
    #[serde(default = "default_eval_interval_ms")]
    pub eval_interval_ms: u64,

    /// Maximum age of the freshest source before the reconciled price is
    /// considered stale. Stale prices never trigger orders.
    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: i64,

    /// Source labels in tie-break order for equal-timestamp collisions,
    /// highest priority first (e.g. the push feed before the polling feed).
    #[serde(default)]
    pub source_priority: Vec<String>,

    /// Capacity of the candle/trigger broadcast channels. Slow subscribers
    /// past this depth observe a lag error rather than blocking the engine.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Capacity of the serialized tick intake queue.
    #[serde(default = "default_tick_queue_capacity")]
    pub tick_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeframes_ms: default_timeframes_ms(),
            eval_interval_ms: default_eval_interval_ms(),
            staleness_ms: default_staleness_ms(),
            source_priority: Vec::new(),
            event_channel_capacity: default_event_channel_capacity(),
            tick_queue_capacity: default_tick_queue_capacity(),
        }
    }
}

impl EngineConfig {
    /// Check every field against its documented constraint.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.timeframes_ms.is_empty() {
            return Err(EngineError::InvalidConfig(
                "at least one timeframe is required".into(),
            ));
        }
        if let Some(&tf) = self.timeframes_ms.iter().find(|&&tf| tf <= 0) {
            return Err(EngineError::InvalidTimeframe(tf));
        }
        {
            let mut seen = std::collections::HashSet::new();
            if let Some(&tf) = self.timeframes_ms.iter().find(|&&tf| !seen.insert(tf)) {
                return Err(EngineError::InvalidConfig(format!(
                    "duplicate timeframe {tf} ms"
                )));
            }
        }
        if self.eval_interval_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "eval_interval_ms must be > 0".into(),
            ));
        }
        if self.staleness_ms <= 0 {
            return Err(EngineError::InvalidConfig(
                "staleness_ms must be > 0".into(),
            ));
        }
        if self.event_channel_capacity == 0 || self.tick_queue_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "channel capacities must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            timeframes = ?config.timeframes_ms,
            eval_interval_ms = config.eval_interval_ms,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.timeframes_ms, vec![60_000, 300_000, 900_000]);
        assert_eq!(cfg.eval_interval_ms, 2_000);
        assert_eq!(cfg.staleness_ms, 5_000);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.timeframes_ms.len(), 3);
        assert_eq!(cfg.tick_queue_capacity, 1_024);
        assert!(cfg.source_priority.is_empty());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "timeframes_ms": [1000], "source_priority": ["ws", "poll"] }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.timeframes_ms, vec![1_000]);
        assert_eq!(cfg.source_priority, vec!["ws", "poll"]);
        assert_eq!(cfg.eval_interval_ms, 2_000);
    }

    #[test]
    fn rejects_bad_timeframes() {
        let mut cfg = EngineConfig::default();
        cfg.timeframes_ms = vec![];
        assert!(matches!(
            cfg.validate(),
            Err(EngineError::InvalidConfig(_))
        ));

        cfg.timeframes_ms = vec![60_000, 0];
        assert_eq!(cfg.validate(), Err(EngineError::InvalidTimeframe(0)));

        cfg.timeframes_ms = vec![60_000, 60_000];
        assert!(matches!(
            cfg.validate(),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_zero_intervals() {
        let mut cfg = EngineConfig::default();
        cfg.eval_interval_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.staleness_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn save_then_load_roundtrip() {
        let mut cfg = EngineConfig::default();
        cfg.source_priority = vec!["ws".into(), "poll".into()];

        let path = std::env::temp_dir().join(format!(
            "marketpulse_cfg_{}.json",
            uuid::Uuid::new_v4()
        ));
        cfg.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.source_priority, cfg.source_priority);
        assert_eq!(loaded.timeframes_ms, cfg.timeframes_ms);

        let _ = std::fs::remove_file(&path);
    }
}
