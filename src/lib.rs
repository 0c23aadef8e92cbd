//! volplay core - playback prefetch scheduling for time-series volume viewing.
//!
//! This crate provides:
//! - A readiness gate that holds playback until every layer is resident
//! - Priority-scored, direction-aware prefetch planning with class budgets
//! - Session-scoped cancellation of superseded loads
//! - A residency provider contract plus an LRU-backed reference provider
//!
//! ```no_run
//! use std::sync::Arc;
//! use volplay_core::{
//!     CachedVolumeProvider, PlaybackLayer, PlaybackPrefetchScheduler, PlaybackState,
//!     PrefetchConfig, ProviderResult, Volume, VolumeProvider, VolumeSource,
//! };
//!
//! struct Store;
//!
//! impl VolumeSource for Store {
//!     fn load_volume(&self, _layer: &str, _timepoint: u32) -> ProviderResult<Volume> {
//!         Ok(Volume::new(vec![0; 64], (4, 4, 4), 1))
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = PlaybackPrefetchScheduler::new(PrefetchConfig::default())?;
//! let provider: Arc<dyn VolumeProvider> = Arc::new(CachedVolumeProvider::new(Store));
//! scheduler.set_provider(Some(provider));
//! scheduler.set_playback_layers(vec![PlaybackLayer::volume("nuclei")]);
//! scheduler.set_playback_state(PlaybackState {
//!     launched: true,
//!     playing: true,
//!     fps: 24.0,
//!     timepoint_count: 120,
//! });
//!
//! // Each frame:
//! let next = 1;
//! if scheduler.can_advance_playback_to_index(next) {
//!     // advance the displayed timepoint
//! }
//! # Ok(())
//! # }
//! ```

mod budget;
mod cache;
mod cached_provider;
mod cancel;
mod config;
mod error;
mod executor;
mod prefetch;
mod provider;
mod scheduler;
mod session;
#[cfg(test)]
pub(crate) mod test_utils;

pub use budget::{
    compute_class_budgets, playback_cache_budget, playback_lookahead, playback_max_in_flight,
    PerClass, PriorityClass, MIN_CACHED_VOLUMES, PLAYBACK_CACHE_ENTRY_CAP,
};
pub use cache::{CacheKey, CacheStats, Resident, ResidencyCache};
pub use cached_provider::{CachedVolumeProvider, VolumeSource};
pub use cancel::CancelToken;
pub use config::{simple_prefetch_forced, PrefetchConfig, SIMPLE_PREFETCH_ENV};
pub use error::{PrefetchError, PrefetchResult, ProviderError, ProviderResult};
pub use executor::{LocalQueueSpawner, RayonSpawner, Task, TaskSpawner};
pub use prefetch::{
    resolve_direction_from_index_delta, AdvancedStrategy, Direction, PlanContext, PrefetchPlan,
    PrefetchStrategy, SimpleStrategy, StrategyKind, WorkItem,
};
pub use provider::{
    AtlasPrefetchOptions, AtlasRequest, BrickAtlas, MissRates, PrefetchOptions, PrefetchPolicy,
    PrefetchReason, ProviderDiagnostics, ProviderStats, ResidencySummary, Volume, VolumeProvider,
};
pub use scheduler::{PlaybackLayer, PlaybackPrefetchScheduler, PlaybackState, SchedulerSnapshot};
pub use session::SessionController;
