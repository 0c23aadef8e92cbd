//! Scheduler configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::budget::{MIN_CACHED_VOLUMES, PLAYBACK_CACHE_ENTRY_CAP};
use crate::error::{PrefetchError, PrefetchResult};
use crate::prefetch::StrategyKind;

/// Environment variable that forces the simple prefetch strategy.
pub const SIMPLE_PREFETCH_ENV: &str = "VOLPLAY_SIMPLE_PREFETCH";

/// Check if the simple strategy is forced via env var.
pub fn simple_prefetch_forced() -> bool {
    flag_enabled(std::env::var(SIMPLE_PREFETCH_ENV).ok().as_deref())
}

fn flag_enabled(value: Option<&str>) -> bool {
    matches!(value, Some("1" | "true"))
}

/// Configuration for playback prefetching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Candidate generator.
    pub strategy: StrategyKind,
    /// Floor for the resident-volume hint.
    pub min_cached_volumes: usize,
    /// Ceiling for the resident-volume hint.
    pub cache_entry_cap: usize,
    /// Layers a single provider call may load at once.
    pub max_concurrent_layer_loads: usize,
    /// Threads in the dedicated load pool.
    pub worker_threads: usize,
    /// Atlas scale levels while playing. The last entry is what the
    /// readiness gate checks.
    pub playing_scale_levels: Vec<u32>,
    /// Atlas scale levels while paused.
    pub paused_scale_levels: Vec<u32>,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Advanced,
            min_cached_volumes: MIN_CACHED_VOLUMES,
            cache_entry_cap: PLAYBACK_CACHE_ENTRY_CAP,
            max_concurrent_layer_loads: 2,
            worker_threads: 4,
            playing_scale_levels: vec![0, 1],
            paused_scale_levels: vec![0],
        }
    }
}

impl PrefetchConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> PrefetchResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse a config from JSON text.
    pub fn from_json(json: &str) -> PrefetchResult<Self> {
        let config: PrefetchConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides. Schedulers call this on construction.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if flag_enabled(lookup(SIMPLE_PREFETCH_ENV).as_deref()) {
            self.strategy = StrategyKind::Simple;
        }
        self
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> PrefetchResult<()> {
        if self.worker_threads == 0 {
            return Err(PrefetchError::Config("worker_threads must be positive".into()));
        }
        if self.max_concurrent_layer_loads == 0 {
            return Err(PrefetchError::Config(
                "max_concurrent_layer_loads must be positive".into(),
            ));
        }
        if self.cache_entry_cap < self.min_cached_volumes {
            return Err(PrefetchError::Config(format!(
                "cache_entry_cap ({}) is below min_cached_volumes ({})",
                self.cache_entry_cap, self.min_cached_volumes
            )));
        }
        if self.playing_scale_levels.is_empty() || self.paused_scale_levels.is_empty() {
            return Err(PrefetchError::Config("scale level lists must not be empty".into()));
        }
        Ok(())
    }

    /// Atlas scale levels for the current playback state.
    pub fn atlas_scale_levels(&self, playing: bool) -> &[u32] {
        if playing {
            &self.playing_scale_levels
        } else {
            &self.paused_scale_levels
        }
    }

    /// Scale level the readiness gate checks: the last configured level.
    pub fn preferred_atlas_scale_level(&self, playing: bool) -> u32 {
        self.atlas_scale_levels(playing).last().copied().unwrap_or(0)
    }
}
