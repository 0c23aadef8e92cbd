//! Playback prefetch scheduler.
//!
//! Keeps the timepoints playback is about to show resident in a
//! [`VolumeProvider`]. The host asks
//! [`PlaybackPrefetchScheduler::can_advance_playback_to_index`] before every
//! frame advance; a `false` answer has already queued the work that will turn
//! it into `true` on a later frame.
//!
//! Bookkeeping lives behind a single mutex. Drains and loads
//! run on a [`TaskSpawner`] and capture the session they were issued under,
//! so work superseded by a reset never touches the fresh state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::budget::{
    compute_class_budgets, playback_cache_budget, playback_lookahead, playback_max_in_flight,
    single_slot_budgets, PerClass, PriorityClass,
};
use crate::cancel::CancelToken;
use crate::config::PrefetchConfig;
use crate::error::{PrefetchResult, ProviderResult};
use crate::executor::{RayonSpawner, TaskSpawner};
use crate::prefetch::{Direction, PlanContext, PrefetchStrategy, StrategyKind, WorkItem};
use crate::provider::{
    AtlasPrefetchOptions, AtlasRequest, PrefetchOptions, PrefetchPolicy, PrefetchReason,
    VolumeProvider,
};
use crate::session::SessionController;

/// A layer taking part in playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackLayer {
    pub key: String,
    /// Keep brick atlases resident instead of full volumes, when the
    /// provider can.
    pub prefer_brick_residency: bool,
    /// Coarsest atlas scale level the layer has.
    pub coarsest_scale_level: u32,
}

impl PlaybackLayer {
    /// A layer rendered from full volumes.
    pub fn volume(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            prefer_brick_residency: false,
            coarsest_scale_level: 0,
        }
    }

    /// A layer rendered from brick atlases.
    pub fn brick(key: impl Into<String>, coarsest_scale_level: u32) -> Self {
        Self {
            key: key.into(),
            prefer_brick_residency: true,
            coarsest_scale_level,
        }
    }

    fn uses_atlas(&self, provider: &dyn VolumeProvider) -> bool {
        self.prefer_brick_residency && provider.supports_brick_atlases()
    }

    fn resolved_scale_level(&self, preferred: u32) -> u32 {
        preferred.min(self.coarsest_scale_level)
    }
}

/// Host playback state the scheduler reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlaybackState {
    /// Viewer is up and showing a dataset.
    pub launched: bool,
    pub playing: bool,
    pub fps: f64,
    pub timepoint_count: u32,
}

/// Point-in-time view of the scheduler's bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub session: u64,
    pub strategy: StrategyKind,
    pub pending: Vec<WorkItem>,
    /// Sorted ascending.
    pub in_flight: Vec<u32>,
    pub in_flight_by_class: PerClass<usize>,
    pub class_budgets: PerClass<usize>,
    pub max_in_flight: usize,
    pub direction: Direction,
    pub last_base_index: Option<u32>,
}

#[derive(Default)]
struct HostState {
    provider: Option<Arc<dyn VolumeProvider>>,
    layers: Arc<Vec<PlaybackLayer>>,
    playback: PlaybackState,
}

/// Queue and in-flight bookkeeping, guarded by one mutex.
struct PrefetchState {
    pending_queue: Vec<WorkItem>,
    pending_set: HashSet<u32>,
    in_flight: HashSet<u32>,
    in_flight_class: HashMap<u32, PriorityClass>,
    in_flight_by_class: PerClass<usize>,
    class_budgets: PerClass<usize>,
    /// Provider and layers captured by the last schedule; drains load these.
    provider: Option<Arc<dyn VolumeProvider>>,
    layers: Arc<Vec<PlaybackLayer>>,
    playing: bool,
    max_in_flight: usize,
    last_base_index: Option<u32>,
    direction: Direction,
    drain_scheduled: bool,
    torn_down: bool,
}

impl PrefetchState {
    fn new() -> Self {
        Self {
            pending_queue: Vec::new(),
            pending_set: HashSet::new(),
            in_flight: HashSet::new(),
            in_flight_class: HashMap::new(),
            in_flight_by_class: PerClass::default(),
            class_budgets: single_slot_budgets(),
            provider: None,
            layers: Arc::default(),
            playing: false,
            max_in_flight: 1,
            last_base_index: None,
            direction: Direction::Forward,
            drain_scheduled: false,
            torn_down: false,
        }
    }

    /// Forget all queued and in-flight work. A scheduled drain stays scheduled.
    fn reset(&mut self) {
        self.pending_queue.clear();
        self.pending_set.clear();
        self.in_flight.clear();
        self.in_flight_class.clear();
        self.in_flight_by_class = PerClass::default();
        self.class_budgets = single_slot_budgets();
        self.provider = None;
        self.layers = Arc::default();
        self.playing = false;
        self.max_in_flight = 1;
        self.last_base_index = None;
        self.direction = Direction::Forward;
    }

    fn replace_queue(&mut self, items: Vec<WorkItem>) {
        self.pending_set = items.iter().map(|item| item.timepoint).collect();
        self.pending_queue = items;
    }

    /// Remove the first item whose class has budget left, else the head.
    fn take_next(&mut self) -> Option<WorkItem> {
        if self.pending_queue.is_empty() {
            return None;
        }
        let index = self
            .pending_queue
            .iter()
            .position(|item| {
                let class = item.priority_class;
                self.in_flight_by_class[class] < self.class_budgets[class]
            })
            .unwrap_or(0);
        let item = self.pending_queue.remove(index);
        self.pending_set.remove(&item.timepoint);
        Some(item)
    }

    fn mark_in_flight(&mut self, item: &WorkItem) -> bool {
        debug_assert!(!self.pending_set.contains(&item.timepoint));
        if !self.in_flight.insert(item.timepoint) {
            return false;
        }
        self.in_flight_class.insert(item.timepoint, item.priority_class);
        self.in_flight_by_class[item.priority_class] += 1;
        true
    }

    fn complete(&mut self, timepoint: u32) -> bool {
        let Some(class) = self.in_flight_class.remove(&timepoint) else {
            return false;
        };
        self.in_flight.remove(&timepoint);
        let counter = &mut self.in_flight_by_class[class];
        *counter = counter.saturating_sub(1);
        true
    }
}

/// One provider call made by a load task.
enum LoadCall {
    Volumes(Vec<String>),
    AtlasBatch {
        layers: Vec<String>,
        scale_levels: Vec<u32>,
    },
    Atlas {
        layer: String,
        scale_level: u32,
    },
}

impl LoadCall {
    fn issue(
        &self,
        provider: &dyn VolumeProvider,
        timepoint: u32,
        options: &PrefetchOptions,
    ) -> ProviderResult<()> {
        match self {
            LoadCall::Volumes(layers) => provider.prefetch(layers, timepoint, options),
            LoadCall::AtlasBatch {
                layers,
                scale_levels,
            } => {
                let atlas_options = AtlasPrefetchOptions {
                    base: options.clone(),
                    scale_levels: scale_levels.clone(),
                };
                provider.prefetch_brick_atlases(layers, timepoint, &atlas_options)
            }
            LoadCall::Atlas { layer, scale_level } => {
                let request = AtlasRequest {
                    scale_level: *scale_level,
                    signal: Some(options.signal.clone()),
                };
                provider.get_brick_atlas(layer, timepoint, &request).map(|_| ())
            }
        }
    }
}

/// A dispatched timepoint and everything its load needs.
struct LoadJob {
    provider: Arc<dyn VolumeProvider>,
    layers: Arc<Vec<PlaybackLayer>>,
    item: WorkItem,
    session: u64,
    token: CancelToken,
    playing: bool,
}

struct Shared {
    config: PrefetchConfig,
    strategy: Box<dyn PrefetchStrategy>,
    spawner: Arc<dyn TaskSpawner>,
    host: RwLock<HostState>,
    state: Mutex<PrefetchState>,
    session: SessionController,
}

impl Shared {
    /// Bump the session, cancel its token and clear bookkeeping.
    ///
    /// The bump happens under the state lock so a drain never pairs the new
    /// session with work queued under the old one.
    fn reset(&self, reason: &'static str) {
        let mut state = self.state.lock();
        let session = self.session.reset();
        state.reset();
        debug!(session, reason, "playback prefetch reset");
    }

    fn host_snapshot(
        &self,
    ) -> (Option<Arc<dyn VolumeProvider>>, Arc<Vec<PlaybackLayer>>, PlaybackState) {
        let host = self.host.read();
        (host.provider.clone(), Arc::clone(&host.layers), host.playback)
    }

    fn layer_ready(
        &self,
        provider: &dyn VolumeProvider,
        layer: &PlaybackLayer,
        timepoint: u32,
        preferred_level: u32,
    ) -> bool {
        if layer.uses_atlas(provider) {
            provider.has_brick_atlas(
                &layer.key,
                timepoint,
                layer.resolved_scale_level(preferred_level),
            )
        } else {
            provider.has_volume(&layer.key, timepoint)
        }
    }

    /// Whether every layer is resident at `timepoint`.
    fn timepoint_ready(
        &self,
        provider: &dyn VolumeProvider,
        layers: &[PlaybackLayer],
        timepoint: u32,
        playing: bool,
    ) -> bool {
        let preferred = self.config.preferred_atlas_scale_level(playing);
        layers
            .iter()
            .all(|layer| self.layer_ready(provider, layer, timepoint, preferred))
    }

    /// Push the resident-volume hint to the provider.
    fn sync_cache_budget(&self) {
        let (provider, layers, playback) = self.host_snapshot();
        let Some(provider) = provider else {
            return;
        };
        let budget = playback_cache_budget(
            layers.len(),
            playback.timepoint_count as usize,
            self.config.min_cached_volumes,
            self.config.cache_entry_cap,
        );
        debug!(
            budget,
            layers = layers.len(),
            timepoints = playback.timepoint_count,
            "updating provider cache budget"
        );
        provider.set_max_cached_volumes(budget);
    }

    /// Schedule one deferred drain unless one is already pending.
    fn request_drain(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.drain_scheduled {
                return;
            }
            state.drain_scheduled = true;
        }
        let shared = Arc::clone(self);
        self.spawner.spawn(Box::new(move || shared.run_drain()));
    }

    fn run_drain(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.drain_scheduled = false;
        if state.torn_down {
            return;
        }
        let Some(provider) = state.provider.clone() else {
            return;
        };
        let playing = state.playing;

        let mut dispatched = Vec::new();
        while state.in_flight.len() < state.max_in_flight {
            let Some(item) = state.take_next() else {
                break;
            };
            if state.mark_in_flight(&item) {
                dispatched.push(item);
            }
        }
        if dispatched.is_empty() {
            return;
        }

        let session = self.session.current();
        let token = self.session.token();
        let layers = Arc::clone(&state.layers);
        trace!(
            session,
            dispatched = dispatched.len(),
            in_flight = state.in_flight.len(),
            pending = state.pending_queue.len(),
            "drained playback prefetch queue"
        );
        drop(state);

        for item in dispatched {
            let job = LoadJob {
                provider: Arc::clone(&provider),
                layers: Arc::clone(&layers),
                item,
                session,
                token: token.clone(),
                playing,
            };
            let shared = Arc::clone(self);
            self.spawner.spawn(Box::new(move || shared.run_load(job)));
        }
    }

    /// Scale levels an atlas group loads, resolved level first.
    fn atlas_levels_for(&self, class: PriorityClass, resolved: u32, playing: bool) -> Vec<u32> {
        let mut levels = vec![resolved];
        if class != PriorityClass::VisibleNow {
            for &level in self.config.atlas_scale_levels(playing) {
                if level < resolved && !levels.contains(&level) {
                    levels.push(level);
                }
            }
        }
        levels
    }

    fn plan_load_calls(&self, job: &LoadJob) -> Vec<LoadCall> {
        let provider = job.provider.as_ref();
        let preferred = self.config.preferred_atlas_scale_level(job.playing);

        let mut volume_layers = Vec::new();
        let mut atlas_groups: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for layer in job.layers.iter() {
            if layer.uses_atlas(provider) {
                atlas_groups
                    .entry(layer.resolved_scale_level(preferred))
                    .or_default()
                    .push(layer.key.clone());
            } else {
                volume_layers.push(layer.key.clone());
            }
        }

        let batch = provider.supports_batch_atlas_prefetch();
        let mut calls = Vec::new();
        for (resolved, layers) in atlas_groups {
            let scale_levels =
                self.atlas_levels_for(job.item.priority_class, resolved, job.playing);
            if batch {
                calls.push(LoadCall::AtlasBatch {
                    layers,
                    scale_levels,
                });
            } else {
                for layer in layers {
                    for &scale_level in &scale_levels {
                        calls.push(LoadCall::Atlas {
                            layer: layer.clone(),
                            scale_level,
                        });
                    }
                }
            }
        }
        if !volume_layers.is_empty() {
            calls.push(LoadCall::Volumes(volume_layers));
        }
        calls
    }

    fn run_load(self: &Arc<Self>, job: LoadJob) {
        let timepoint = job.item.timepoint;

        if job.token.is_cancelled() || !self.session.is_current(job.session) {
            trace!(timepoint, session = job.session, "skipping superseded load");
        } else {
            let options = PrefetchOptions {
                policy: PrefetchPolicy::MissingOnly,
                reason: if job.playing {
                    PrefetchReason::Playback
                } else {
                    PrefetchReason::Scrub
                },
                signal: job.token.clone(),
                max_concurrent_layer_loads: self.config.max_concurrent_layer_loads,
            };
            let calls = self.plan_load_calls(&job);
            let results: Vec<ProviderResult<()>> = calls
                .par_iter()
                .map(|call| call.issue(job.provider.as_ref(), timepoint, &options))
                .collect();

            for err in results.into_iter().filter_map(Result::err) {
                if err.is_cancelled() || !self.session.is_current(job.session) {
                    trace!(timepoint, error = %err, "playback prefetch cancelled");
                } else {
                    warn!(
                        timepoint,
                        class = ?job.item.priority_class,
                        error = %err,
                        "playback prefetch failed"
                    );
                }
            }
        }

        {
            let mut state = self.state.lock();
            if !self.session.is_current(job.session) {
                trace!(timepoint, session = job.session, "discarding stale completion");
                return;
            }
            state.complete(timepoint);
        }
        self.request_drain();
    }
}

/// Keeps upcoming playback timepoints resident.
///
/// Cheap to query from the host's frame loop. Dropping the scheduler tears
/// it down and cancels outstanding provider work.
pub struct PlaybackPrefetchScheduler {
    shared: Arc<Shared>,
}

impl PlaybackPrefetchScheduler {
    /// Create a scheduler with its own worker pool.
    pub fn new(config: PrefetchConfig) -> PrefetchResult<Self> {
        config.validate()?;
        let spawner = RayonSpawner::new(config.worker_threads)?;
        Self::with_spawner(config, Arc::new(spawner))
    }

    /// Create a scheduler that runs drains and loads on `spawner`.
    ///
    /// Environment overrides (see [`PrefetchConfig::with_env_overrides`]) are
    /// applied here.
    pub fn with_spawner(
        config: PrefetchConfig,
        spawner: Arc<dyn TaskSpawner>,
    ) -> PrefetchResult<Self> {
        let config = config.with_env_overrides();
        config.validate()?;
        let strategy = config.strategy.build();
        debug!(strategy = ?strategy.kind(), "playback prefetch scheduler created");
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                strategy,
                spawner,
                host: RwLock::new(HostState::default()),
                state: Mutex::new(PrefetchState::new()),
                session: SessionController::new(),
            }),
        })
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.shared.config
    }

    /// Install or remove the provider. A different provider resets the session.
    pub fn set_provider(&self, provider: Option<Arc<dyn VolumeProvider>>) {
        let changed = {
            let mut host = self.shared.host.write();
            let changed = match (&host.provider, &provider) {
                (Some(current), Some(next)) => {
                    !std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(next))
                }
                (None, None) => false,
                _ => true,
            };
            host.provider = provider;
            changed
        };
        if changed {
            self.shared.reset("provider changed");
            self.shared.sync_cache_budget();
        }
    }

    /// Replace the playback layer set.
    pub fn set_playback_layers(&self, layers: Vec<PlaybackLayer>) {
        let changed = {
            let mut host = self.shared.host.write();
            if *host.layers == layers {
                false
            } else {
                host.layers = Arc::new(layers);
                true
            }
        };
        if changed {
            self.shared.sync_cache_budget();
        }
    }

    /// Update playback state. Stopping playback resets the session.
    pub fn set_playback_state(&self, playback: PlaybackState) {
        let previous = std::mem::replace(&mut self.shared.host.write().playback, playback);

        if previous.playing && !playback.playing {
            self.shared.reset("playback stopped");
        } else if !previous.playing && playback.playing {
            self.shared.session.token();
            debug!(fps = playback.fps, "playback started");
        }

        if previous.timepoint_count != playback.timepoint_count {
            self.shared.sync_cache_budget();
        }
    }

    /// Whether every playback layer is resident at `next_index`.
    ///
    /// On `false` the missing timepoint and its neighbours have been queued.
    pub fn can_advance_playback_to_index(&self, next_index: u32) -> bool {
        let (provider, layers, playback) = self.shared.host_snapshot();
        let Some(provider) = provider else {
            return true;
        };
        if layers.is_empty() || playback.timepoint_count <= 1 {
            return true;
        }

        let index = next_index.min(playback.timepoint_count - 1);
        if self
            .shared
            .timepoint_ready(provider.as_ref(), &layers, index, playback.playing)
        {
            return true;
        }

        trace!(timepoint = index, "playback waiting on residency");
        self.schedule_playback_prefetch(index);
        false
    }

    /// Rebuild the pending queue around `base_index` and start draining it.
    pub fn schedule_playback_prefetch(&self, base_index: u32) {
        let shared = &self.shared;

        let queued = {
            // Lock order is state, then host. Writers release host before
            // resetting, so a reset can't slip between the snapshot and the
            // queue write.
            let mut state = shared.state.lock();
            if state.torn_down {
                return;
            }
            let (provider, layers, playback) = shared.host_snapshot();
            let Some(provider) = provider else {
                return;
            };
            if !playback.launched || playback.timepoint_count <= 1 || layers.is_empty() {
                return;
            }

            let count = playback.timepoint_count;
            let base_index = base_index.min(count - 1);
            let lookahead = playback_lookahead(playback.playing, playback.fps);
            let max_in_flight = playback_max_in_flight(playback.playing, lookahead);
            let is_ready = |timepoint: u32| {
                shared.timepoint_ready(provider.as_ref(), &layers, timepoint, playback.playing)
            };

            let plan = {
                let ctx = PlanContext {
                    base_index,
                    timepoint_count: count,
                    lookahead,
                    playing: playback.playing,
                    previous_base: state.last_base_index,
                    previous_direction: state.direction,
                    pending: &state.pending_queue,
                    in_flight: &state.in_flight,
                    is_ready: &is_ready,
                };
                shared.strategy.build_prefetch_plan(&ctx)
            };

            state.max_in_flight = max_in_flight;
            state.class_budgets = compute_class_budgets(max_in_flight);
            state.provider = Some(Arc::clone(&provider));
            state.layers = Arc::clone(&layers);
            state.playing = playback.playing;
            state.last_base_index = Some(base_index);
            state.direction = plan.direction;
            state.replace_queue(plan.items);

            debug!(
                base_index,
                lookahead,
                max_in_flight,
                direction = ?state.direction,
                pending = state.pending_queue.len(),
                in_flight = state.in_flight.len(),
                "scheduled playback prefetch"
            );
            !state.pending_queue.is_empty()
        };

        if queued {
            shared.request_drain();
        }
    }

    /// Dispatch queued work up to the in-flight limit. Idempotent until the
    /// deferred drain runs.
    pub fn drain_playback_prefetch_queue(&self) {
        self.shared.request_drain();
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.shared.state.lock();
        let mut in_flight: Vec<u32> = state.in_flight.iter().copied().collect();
        in_flight.sort_unstable();
        SchedulerSnapshot {
            session: self.shared.session.current(),
            strategy: self.shared.strategy.kind(),
            pending: state.pending_queue.clone(),
            in_flight,
            in_flight_by_class: state.in_flight_by_class,
            class_budgets: state.class_budgets,
            max_in_flight: state.max_in_flight,
            direction: state.direction,
            last_base_index: state.last_base_index,
        }
    }

    /// Cancel outstanding work and stop accepting new work.
    pub fn teardown(&self) {
        let mut state = self.shared.state.lock();
        if state.torn_down {
            return;
        }
        state.torn_down = true;
        let session = self.shared.session.reset();
        state.reset();
        debug!(session, "playback prefetch torn down");
    }
}

impl Drop for PlaybackPrefetchScheduler {
    fn drop(&mut self) {
        self.teardown();
    }
}
