//! In-memory volume provider backed by a host storage source.
//!
//! Wraps a [`VolumeSource`] (Zarr store, TIFF reader, ...) with a
//! [`ResidencyCache`], in-flight dedup for background prefetches, and the
//! diagnostics surface the host UI reads.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::debug;

use crate::budget::MIN_CACHED_VOLUMES;
use crate::cache::{CacheKey, Resident, ResidencyCache};
use crate::cancel::CancelToken;
use crate::error::{ProviderError, ProviderResult};
use crate::provider::{
    AtlasPrefetchOptions, AtlasRequest, BrickAtlas, MissRates, PrefetchOptions, PrefetchPolicy,
    ProviderDiagnostics, ProviderStats, ResidencySummary, Volume, VolumeProvider,
};

/// Storage layer that decodes volumes and atlases on demand. Blocking.
pub trait VolumeSource: Send + Sync {
    fn load_volume(&self, layer_key: &str, timepoint: u32) -> ProviderResult<Volume>;

    fn supports_brick_atlases(&self) -> bool {
        false
    }

    fn load_brick_atlas(
        &self,
        _layer_key: &str,
        _timepoint: u32,
        _scale_level: u32,
    ) -> ProviderResult<BrickAtlas> {
        Err(ProviderError::Unsupported("load_brick_atlas"))
    }
}

/// Decrements the active request counter when a prefetch call returns.
struct ActiveRequest<'a>(&'a AtomicUsize);

impl<'a> ActiveRequest<'a> {
    fn start(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Residency cache plus loader implementing [`VolumeProvider`].
pub struct CachedVolumeProvider<S> {
    source: S,
    cache: ResidencyCache,
    /// Keys currently being loaded by a prefetch. Foreground loads bypass this.
    in_flight: Mutex<HashSet<CacheKey>>,
    active_prefetch_requests: AtomicUsize,
}

impl<S: VolumeSource> CachedVolumeProvider<S> {
    pub fn new(source: S) -> Self {
        Self::with_capacity(source, MIN_CACHED_VOLUMES)
    }

    pub fn with_capacity(source: S, max_cached_volumes: usize) -> Self {
        Self {
            source,
            cache: ResidencyCache::new(max_cached_volumes),
            in_flight: Mutex::new(HashSet::new()),
            active_prefetch_requests: AtomicUsize::new(0),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn load_resident(&self, key: &CacheKey) -> ProviderResult<Resident> {
        match key.scale_level {
            Some(level) => self
                .source
                .load_brick_atlas(&key.layer_key, key.timepoint, level)
                .map(|atlas| Resident::Atlas(Arc::new(atlas))),
            None => self
                .source
                .load_volume(&key.layer_key, key.timepoint)
                .map(|volume| Resident::Volume(Arc::new(volume))),
        }
    }

    /// Load one key for a background prefetch, deduplicated across callers.
    fn load_for_prefetch(&self, key: &CacheKey, signal: &CancelToken) -> ProviderResult<()> {
        if !self.in_flight.lock().insert(key.clone()) {
            // Another prefetch is already loading it
            return Ok(());
        }

        let result = if signal.is_cancelled() {
            Err(ProviderError::Cancelled)
        } else {
            self.load_resident(key).map(|resident| {
                self.cache.insert(key.clone(), resident);
            })
        };

        self.in_flight.lock().remove(key);
        if let Err(e) = &result {
            debug!(key = %key, error = %e, "prefetch load failed");
        }
        result
    }

    /// Shared body of `prefetch` and `prefetch_brick_atlases`.
    ///
    /// Loads at most `max_concurrent_layer_loads` keys at once and returns the
    /// first failure after every batch has run.
    fn prefetch_keys(&self, keys: Vec<CacheKey>, options: &PrefetchOptions) -> ProviderResult<()> {
        let _active = ActiveRequest::start(&self.active_prefetch_requests);

        let to_load: Vec<CacheKey> = match options.policy {
            PrefetchPolicy::MissingOnly => keys
                .into_iter()
                .filter(|key| !self.cache.contains(key))
                .collect(),
            PrefetchPolicy::Refresh => {
                for key in &keys {
                    self.cache.remove(key);
                }
                keys
            }
        };

        let batch_size = options.max_concurrent_layer_loads.max(1);
        let mut first_error = None;

        for batch in to_load.chunks(batch_size) {
            if options.signal.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }

            let results: Vec<ProviderResult<()>> = batch
                .par_iter()
                .map(|key| self.load_for_prefetch(key, &options.signal))
                .collect();

            for result in results {
                if let Err(e) = result {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<S: VolumeSource> VolumeProvider for CachedVolumeProvider<S> {
    fn has_volume(&self, layer_key: &str, timepoint: u32) -> bool {
        self.cache.contains(&CacheKey::volume(layer_key, timepoint))
    }

    fn get_volume(
        &self,
        layer_key: &str,
        timepoint: u32,
        signal: Option<&CancelToken>,
    ) -> ProviderResult<Arc<Volume>> {
        let key = CacheKey::volume(layer_key, timepoint);
        if let Some(Resident::Volume(volume)) = self.cache.get(&key) {
            return Ok(volume);
        }
        if signal.is_some_and(CancelToken::is_cancelled) {
            return Err(ProviderError::Cancelled);
        }

        let volume = Arc::new(self.source.load_volume(layer_key, timepoint)?);
        self.cache.insert(key, Resident::Volume(Arc::clone(&volume)));
        Ok(volume)
    }

    fn prefetch(
        &self,
        layer_keys: &[String],
        timepoint: u32,
        options: &PrefetchOptions,
    ) -> ProviderResult<()> {
        let keys = layer_keys
            .iter()
            .map(|layer| CacheKey::volume(layer.as_str(), timepoint))
            .collect();
        self.prefetch_keys(keys, options)
    }

    fn set_max_cached_volumes(&self, max_cached_volumes: usize) {
        debug!(max_cached_volumes, "resizing residency cache");
        self.cache.set_max_entries(max_cached_volumes);
    }

    fn diagnostics(&self) -> ProviderDiagnostics {
        let volumes = self.cache.volume_stats();
        let atlases = self.cache.atlas_stats();
        let max_entries = self.cache.max_entries();
        let resident = volumes.num_entries + atlases.num_entries;

        ProviderDiagnostics {
            residency: ResidencySummary {
                resident_volumes: volumes.num_entries,
                resident_atlases: atlases.num_entries,
                in_flight: self.in_flight.lock().len(),
            },
            cache_pressure: if max_entries == 0 {
                0.0
            } else {
                resident as f64 / max_entries as f64
            },
            miss_rates: MissRates {
                volume: volumes.miss_rate(),
                atlas: atlases.miss_rate(),
            },
            active_prefetch_requests: self.active_prefetch_requests.load(Ordering::Acquire),
        }
    }

    fn stats(&self) -> ProviderStats {
        ProviderStats {
            volumes: self.cache.volume_stats(),
            atlases: self.cache.atlas_stats(),
            max_cached_volumes: self.cache.max_entries(),
        }
    }

    fn clear(&self) {
        self.cache.clear();
    }

    fn supports_brick_atlases(&self) -> bool {
        self.source.supports_brick_atlases()
    }

    fn supports_batch_atlas_prefetch(&self) -> bool {
        self.source.supports_brick_atlases()
    }

    fn has_brick_atlas(&self, layer_key: &str, timepoint: u32, scale_level: u32) -> bool {
        self.cache
            .contains(&CacheKey::atlas(layer_key, timepoint, scale_level))
    }

    fn get_brick_atlas(
        &self,
        layer_key: &str,
        timepoint: u32,
        request: &AtlasRequest,
    ) -> ProviderResult<Arc<BrickAtlas>> {
        let key = CacheKey::atlas(layer_key, timepoint, request.scale_level);
        if let Some(Resident::Atlas(atlas)) = self.cache.get(&key) {
            return Ok(atlas);
        }
        if request.signal.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(ProviderError::Cancelled);
        }

        let atlas = Arc::new(
            self.source
                .load_brick_atlas(layer_key, timepoint, request.scale_level)?,
        );
        self.cache.insert(key, Resident::Atlas(Arc::clone(&atlas)));
        Ok(atlas)
    }

    fn prefetch_brick_atlases(
        &self,
        layer_keys: &[String],
        timepoint: u32,
        options: &AtlasPrefetchOptions,
    ) -> ProviderResult<()> {
        if !self.source.supports_brick_atlases() {
            return Err(ProviderError::Unsupported("prefetch_brick_atlases"));
        }
        let keys = options
            .scale_levels
            .iter()
            .flat_map(|&level| {
                layer_keys
                    .iter()
                    .map(move |layer| CacheKey::atlas(layer.as_str(), timepoint, level))
            })
            .collect();
        self.prefetch_keys(keys, &options.base)
    }
}
