//! Shared test fixtures.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancel::CancelToken;
use crate::error::{ProviderError, ProviderResult};
use crate::provider::{
    AtlasPrefetchOptions, AtlasRequest, BrickAtlas, PrefetchOptions, PrefetchReason,
    ProviderDiagnostics, ProviderStats, ResidencySummary, Volume, VolumeProvider,
};

/// A single-channel cube holding `len` bytes.
pub(crate) fn test_volume(len: usize) -> Volume {
    Volume::new(vec![7u8; len], (len as u32, 1, 1), 1)
}

/// A small atlas at `scale_level`.
pub(crate) fn test_atlas(scale_level: u32) -> BrickAtlas {
    BrickAtlas::new(vec![1u8; 64], scale_level, 4, 1)
}

/// Route `tracing` output to the test harness. Honors `RUST_LOG`.
pub(crate) fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ProviderCall {
    Prefetch {
        layers: Vec<String>,
        timepoint: u32,
    },
    PrefetchAtlases {
        layers: Vec<String>,
        timepoint: u32,
        scale_levels: Vec<u32>,
    },
    GetBrickAtlas {
        layer: String,
        timepoint: u32,
        scale_level: u32,
    },
    SetMaxCachedVolumes(usize),
}

/// Provider that records calls and marks requested keys resident.
pub(crate) struct MockProvider {
    atlas_support: bool,
    batch_atlas_support: bool,
    volumes: Mutex<HashSet<(String, u32)>>,
    atlases: Mutex<HashSet<(String, u32, u32)>>,
    calls: Mutex<Vec<ProviderCall>>,
    signals: Mutex<Vec<CancelToken>>,
    reasons: Mutex<Vec<PrefetchReason>>,
    /// When set, loads succeed but nothing becomes resident.
    hold_residency: AtomicBool,
    fail_loads: AtomicBool,
    max_cached_volumes: AtomicUsize,
}

impl MockProvider {
    /// Volumes only.
    pub(crate) fn volumes_only() -> Self {
        Self::build(false, false)
    }

    /// Volumes plus atlases, with or without the batch atlas call.
    pub(crate) fn with_atlases(batch: bool) -> Self {
        Self::build(true, batch)
    }

    fn build(atlas_support: bool, batch_atlas_support: bool) -> Self {
        Self {
            atlas_support,
            batch_atlas_support,
            volumes: Mutex::new(HashSet::new()),
            atlases: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            reasons: Mutex::new(Vec::new()),
            hold_residency: AtomicBool::new(false),
            fail_loads: AtomicBool::new(false),
            max_cached_volumes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn mark_volume(&self, layer: &str, timepoint: u32) {
        self.volumes.lock().insert((layer.to_string(), timepoint));
    }

    pub(crate) fn mark_atlas(&self, layer: &str, timepoint: u32, scale_level: u32) {
        self.atlases
            .lock()
            .insert((layer.to_string(), timepoint, scale_level));
    }

    pub(crate) fn set_hold_residency(&self, hold: bool) {
        self.hold_residency.store(hold, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().clone()
    }

    /// Timepoints of volume prefetches, in call order.
    pub(crate) fn prefetched_timepoints(&self) -> Vec<u32> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ProviderCall::Prefetch { timepoint, .. } => Some(*timepoint),
                _ => None,
            })
            .collect()
    }

    /// Every cancel token handed to a load call.
    pub(crate) fn signals(&self) -> Vec<CancelToken> {
        self.signals.lock().clone()
    }

    /// Reason of every batch prefetch call, in call order.
    pub(crate) fn reasons(&self) -> Vec<PrefetchReason> {
        self.reasons.lock().clone()
    }

    pub(crate) fn max_cached_volumes(&self) -> usize {
        self.max_cached_volumes.load(Ordering::SeqCst)
    }

    fn record(&self, call: ProviderCall) {
        self.calls.lock().push(call);
    }

    fn check_failure(&self, layer: &str, timepoint: u32) -> ProviderResult<()> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(ProviderError::Load {
                layer_key: layer.to_string(),
                timepoint,
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }

    fn keeps_residency(&self) -> bool {
        !self.hold_residency.load(Ordering::SeqCst)
    }
}

impl VolumeProvider for MockProvider {
    fn has_volume(&self, layer_key: &str, timepoint: u32) -> bool {
        self.volumes
            .lock()
            .contains(&(layer_key.to_string(), timepoint))
    }

    fn get_volume(
        &self,
        layer_key: &str,
        timepoint: u32,
        _signal: Option<&CancelToken>,
    ) -> ProviderResult<Arc<Volume>> {
        self.check_failure(layer_key, timepoint)?;
        if self.keeps_residency() {
            self.mark_volume(layer_key, timepoint);
        }
        Ok(Arc::new(test_volume(8)))
    }

    fn prefetch(
        &self,
        layer_keys: &[String],
        timepoint: u32,
        options: &PrefetchOptions,
    ) -> ProviderResult<()> {
        self.record(ProviderCall::Prefetch {
            layers: layer_keys.to_vec(),
            timepoint,
        });
        self.signals.lock().push(options.signal.clone());
        self.reasons.lock().push(options.reason);
        if let Some(layer) = layer_keys.first() {
            self.check_failure(layer, timepoint)?;
        }
        if self.keeps_residency() {
            for layer in layer_keys {
                self.mark_volume(layer, timepoint);
            }
        }
        Ok(())
    }

    fn set_max_cached_volumes(&self, max_cached_volumes: usize) {
        self.max_cached_volumes
            .store(max_cached_volumes, Ordering::SeqCst);
        self.record(ProviderCall::SetMaxCachedVolumes(max_cached_volumes));
    }

    fn diagnostics(&self) -> ProviderDiagnostics {
        ProviderDiagnostics {
            residency: ResidencySummary {
                resident_volumes: self.volumes.lock().len(),
                resident_atlases: self.atlases.lock().len(),
                in_flight: 0,
            },
            ..Default::default()
        }
    }

    fn stats(&self) -> ProviderStats {
        ProviderStats {
            max_cached_volumes: self.max_cached_volumes(),
            ..Default::default()
        }
    }

    fn clear(&self) {
        self.volumes.lock().clear();
        self.atlases.lock().clear();
    }

    fn supports_brick_atlases(&self) -> bool {
        self.atlas_support
    }

    fn supports_batch_atlas_prefetch(&self) -> bool {
        self.batch_atlas_support
    }

    fn has_brick_atlas(&self, layer_key: &str, timepoint: u32, scale_level: u32) -> bool {
        self.atlases
            .lock()
            .contains(&(layer_key.to_string(), timepoint, scale_level))
    }

    fn get_brick_atlas(
        &self,
        layer_key: &str,
        timepoint: u32,
        request: &AtlasRequest,
    ) -> ProviderResult<Arc<BrickAtlas>> {
        if !self.atlas_support {
            return Err(ProviderError::Unsupported("get_brick_atlas"));
        }
        self.record(ProviderCall::GetBrickAtlas {
            layer: layer_key.to_string(),
            timepoint,
            scale_level: request.scale_level,
        });
        if let Some(signal) = &request.signal {
            self.signals.lock().push(signal.clone());
        }
        self.check_failure(layer_key, timepoint)?;
        if self.keeps_residency() {
            self.mark_atlas(layer_key, timepoint, request.scale_level);
        }
        Ok(Arc::new(test_atlas(request.scale_level)))
    }

    fn prefetch_brick_atlases(
        &self,
        layer_keys: &[String],
        timepoint: u32,
        options: &AtlasPrefetchOptions,
    ) -> ProviderResult<()> {
        if !self.batch_atlas_support {
            return Err(ProviderError::Unsupported("prefetch_brick_atlases"));
        }
        self.record(ProviderCall::PrefetchAtlases {
            layers: layer_keys.to_vec(),
            timepoint,
            scale_levels: options.scale_levels.clone(),
        });
        self.signals.lock().push(options.base.signal.clone());
        self.reasons.lock().push(options.base.reason);
        if let Some(layer) = layer_keys.first() {
            self.check_failure(layer, timepoint)?;
        }
        if self.keeps_residency() {
            for layer in layer_keys {
                for level in &options.scale_levels {
                    self.mark_atlas(layer, timepoint, *level);
                }
            }
        }
        Ok(())
    }
}
