//! Priority classes and the sizing rules for lookahead, concurrency and cache.

use std::ops::{Index, IndexMut};

use serde::Serialize;

/// Floor for the resident-volume hint pushed to the provider.
pub const MIN_CACHED_VOLUMES: usize = 6;

/// Ceiling for the resident-volume hint pushed to the provider.
pub const PLAYBACK_CACHE_ENTRY_CAP: usize = 64;

/// Urgency of a queued timepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriorityClass {
    /// The frame playback wants to show next.
    VisibleNow,
    /// One or two frames ahead of it.
    NearFuture,
    /// Everything else, including the reverse direction.
    Speculative,
}

impl PriorityClass {
    pub const ALL: [PriorityClass; 3] = [
        PriorityClass::VisibleNow,
        PriorityClass::NearFuture,
        PriorityClass::Speculative,
    ];

    /// Classify a forward-scan step.
    pub fn for_step(step: usize) -> Self {
        match step {
            0 => PriorityClass::VisibleNow,
            1 | 2 => PriorityClass::NearFuture,
            _ => PriorityClass::Speculative,
        }
    }

    /// Score weight of the class.
    pub fn weight(self) -> i32 {
        match self {
            PriorityClass::VisibleNow => 3,
            PriorityClass::NearFuture => 2,
            PriorityClass::Speculative => 1,
        }
    }

    /// Share of the in-flight budget, in percent.
    fn budget_percent(self) -> usize {
        match self {
            PriorityClass::VisibleNow => 50,
            PriorityClass::NearFuture => 35,
            PriorityClass::Speculative => 15,
        }
    }
}

/// One value per priority class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PerClass<T> {
    pub visible_now: T,
    pub near_future: T,
    pub speculative: T,
}

impl<T> Index<PriorityClass> for PerClass<T> {
    type Output = T;

    fn index(&self, class: PriorityClass) -> &T {
        match class {
            PriorityClass::VisibleNow => &self.visible_now,
            PriorityClass::NearFuture => &self.near_future,
            PriorityClass::Speculative => &self.speculative,
        }
    }
}

impl<T> IndexMut<PriorityClass> for PerClass<T> {
    fn index_mut(&mut self, class: PriorityClass) -> &mut T {
        match class {
            PriorityClass::VisibleNow => &mut self.visible_now,
            PriorityClass::NearFuture => &mut self.near_future,
            PriorityClass::Speculative => &mut self.speculative,
        }
    }
}

impl PerClass<usize> {
    pub fn total(&self) -> usize {
        self.visible_now + self.near_future + self.speculative
    }
}

/// Split `max_in_flight` slots across the priority classes.
///
/// Each share is rounded up (visible-now gets at least one slot), then the sum
/// is trimmed from the lowest class upward and topped up through near-future,
/// so the result always sums to exactly `max_in_flight`.
pub fn compute_class_budgets(max_in_flight: usize) -> PerClass<usize> {
    let share = |class: PriorityClass| (max_in_flight * class.budget_percent()).div_ceil(100);

    let mut budgets = PerClass {
        visible_now: share(PriorityClass::VisibleNow).max(1),
        near_future: share(PriorityClass::NearFuture),
        speculative: share(PriorityClass::Speculative),
    };

    while budgets.total() > max_in_flight {
        if budgets.speculative > 0 {
            budgets.speculative -= 1;
        } else if budgets.near_future > 0 {
            budgets.near_future -= 1;
        } else {
            budgets.visible_now -= 1;
        }
    }

    while budgets.total() < max_in_flight {
        budgets.near_future += 1;
    }

    budgets
}

/// Budget used while idle and right after a reset.
pub fn single_slot_budgets() -> PerClass<usize> {
    compute_class_budgets(1)
}

/// How many steps past the base index to plan for.
pub fn playback_lookahead(playing: bool, fps: f64) -> usize {
    if !playing {
        return 1;
    }
    let frames_per_eighth = if fps.is_finite() && fps > 0.0 {
        (fps / 8.0).ceil() as usize
    } else {
        0
    };
    frames_per_eighth.saturating_add(2).clamp(2, 6)
}

/// How many timepoints may load concurrently.
pub fn playback_max_in_flight(playing: bool, lookahead: usize) -> usize {
    if !playing {
        return 1;
    }
    (lookahead + 1).div_ceil(2).clamp(1, 2)
}

/// Resident-volume hint for the provider.
pub fn playback_cache_budget(
    layer_count: usize,
    timepoint_count: usize,
    min_cached_volumes: usize,
    cache_entry_cap: usize,
) -> usize {
    if layer_count == 0 {
        return min_cached_volumes;
    }
    layer_count
        .saturating_mul(timepoint_count.saturating_add(2))
        .max(min_cached_volumes)
        .min(cache_entry_cap)
}
