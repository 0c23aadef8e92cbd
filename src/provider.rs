//! Volume provider contract consumed by the playback scheduler.
//!
//! The provider owns residency: it answers synchronous "is this resident"
//! questions and performs blocking loads. The scheduler runs every blocking
//! call on worker threads and never stores residency itself.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use crate::cache::CacheStats;
use crate::cancel::CancelToken;
use crate::error::{ProviderError, ProviderResult};

/// Decoded voxel data for one layer at one timepoint.
#[derive(Debug, Clone)]
pub struct Volume {
    /// Raw voxel bytes.
    pub data: Bytes,
    /// (width, height, depth) in voxels.
    pub dimensions: (u32, u32, u32),
    pub channels: u32,
}

impl Volume {
    pub fn new(data: Vec<u8>, dimensions: (u32, u32, u32), channels: u32) -> Self {
        Self {
            data: Bytes::from(data),
            dimensions,
            channels,
        }
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

/// Packed bricks for one layer at one timepoint and scale level.
#[derive(Debug, Clone)]
pub struct BrickAtlas {
    pub data: Bytes,
    pub scale_level: u32,
    /// Brick edge length in voxels.
    pub brick_size: u32,
    pub brick_count: u32,
}

impl BrickAtlas {
    pub fn new(data: Vec<u8>, scale_level: u32, brick_size: u32, brick_count: u32) -> Self {
        Self {
            data: Bytes::from(data),
            scale_level,
            brick_size,
            brick_count,
        }
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

/// Which keys a prefetch should load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrefetchPolicy {
    /// Skip keys that are already resident.
    MissingOnly,
    /// Reload every requested key.
    Refresh,
}

/// Why a prefetch was issued (diagnostics only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrefetchReason {
    /// Issued while playback runs.
    Playback,
    /// Issued while paused, for the frame the user stepped or scrubbed to.
    Scrub,
}

/// Options for [`VolumeProvider::prefetch`].
#[derive(Debug, Clone)]
pub struct PrefetchOptions {
    pub policy: PrefetchPolicy,
    pub reason: PrefetchReason,
    pub signal: CancelToken,
    /// Upper bound on layers loaded at the same time by this call.
    pub max_concurrent_layer_loads: usize,
}

/// Options for [`VolumeProvider::prefetch_brick_atlases`].
#[derive(Debug, Clone)]
pub struct AtlasPrefetchOptions {
    pub base: PrefetchOptions,
    /// Scale levels to populate, in order.
    pub scale_levels: Vec<u32>,
}

/// Options for [`VolumeProvider::get_brick_atlas`].
#[derive(Debug, Clone)]
pub struct AtlasRequest {
    pub scale_level: u32,
    pub signal: Option<CancelToken>,
}

/// Provider statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderStats {
    pub volumes: CacheStats,
    pub atlases: CacheStats,
    pub max_cached_volumes: usize,
}

/// What is resident or loading right now.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResidencySummary {
    pub resident_volumes: usize,
    pub resident_atlases: usize,
    pub in_flight: usize,
}

/// Miss rates per payload kind, 0.0 to 1.0.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MissRates {
    pub volume: f64,
    pub atlas: f64,
}

/// Read-only observability surface for the host UI.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderDiagnostics {
    pub residency: ResidencySummary,
    /// Resident entries divided by the retention budget.
    pub cache_pressure: f64,
    pub miss_rates: MissRates,
    pub active_prefetch_requests: usize,
}

/// Residency cache and loader for volume data.
///
/// The atlas methods have default implementations describing a provider
/// without brick support; the scheduler checks
/// [`supports_brick_atlases`](Self::supports_brick_atlases) and
/// [`supports_batch_atlas_prefetch`](Self::supports_batch_atlas_prefetch)
/// before calling them.
pub trait VolumeProvider: Send + Sync {
    /// Whether the full volume is resident. Must not block.
    fn has_volume(&self, layer_key: &str, timepoint: u32) -> bool;

    /// Load or return the cached volume.
    fn get_volume(
        &self,
        layer_key: &str,
        timepoint: u32,
        signal: Option<&CancelToken>,
    ) -> ProviderResult<Arc<Volume>>;

    /// Background population of volumes for one timepoint.
    fn prefetch(
        &self,
        layer_keys: &[String],
        timepoint: u32,
        options: &PrefetchOptions,
    ) -> ProviderResult<()>;

    /// Adjust the retention budget. Eviction policy stays with the provider.
    fn set_max_cached_volumes(&self, max_cached_volumes: usize);

    fn diagnostics(&self) -> ProviderDiagnostics;

    fn stats(&self) -> ProviderStats;

    /// Drop all cached state.
    fn clear(&self);

    /// Whether `has_brick_atlas` and `get_brick_atlas` are available.
    fn supports_brick_atlases(&self) -> bool {
        false
    }

    /// Whether `prefetch_brick_atlases` is available.
    fn supports_batch_atlas_prefetch(&self) -> bool {
        false
    }

    /// Whether the atlas at `scale_level` is resident. Must not block.
    fn has_brick_atlas(&self, _layer_key: &str, _timepoint: u32, _scale_level: u32) -> bool {
        false
    }

    /// Load or return the cached brick atlas.
    fn get_brick_atlas(
        &self,
        _layer_key: &str,
        _timepoint: u32,
        _request: &AtlasRequest,
    ) -> ProviderResult<Arc<BrickAtlas>> {
        Err(ProviderError::Unsupported("get_brick_atlas"))
    }

    /// Background population of brick atlases for one timepoint.
    fn prefetch_brick_atlases(
        &self,
        _layer_keys: &[String],
        _timepoint: u32,
        _options: &AtlasPrefetchOptions,
    ) -> ProviderResult<()> {
        Err(ProviderError::Unsupported("prefetch_brick_atlases"))
    }
}
