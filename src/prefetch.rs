//! Timepoint prefetch planning.
//!
//! A strategy turns a base timepoint into an ordered list of [`WorkItem`]s.
//! Two strategies share one trait so the scheduler's budget, drain and
//! session handling stay identical whichever is selected.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::budget::PriorityClass;

/// Score bonus applied to every candidate while playing.
const PLAYING_SCORE_BONUS: i32 = 6;

/// Score penalty per step away from the base timepoint.
const STEP_PENALTY: i32 = 8;

/// Furthest the backward scan looks, in steps.
const BACKWARD_SCAN_STEPS: usize = 2;

/// Playback direction along the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

impl Direction {
    pub fn reversed(self) -> Self {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }

    /// `(base + direction * step) mod count`.
    pub fn offset(self, base: u32, step: usize, count: u32) -> u32 {
        if count == 0 {
            return 0;
        }
        let count = u64::from(count);
        let base = u64::from(base) % count;
        let step = step as u64 % count;
        let index = match self {
            Direction::Forward => (base + step) % count,
            Direction::Backward => (base + count - step) % count,
        };
        index as u32
    }
}

/// Which candidate generator the scheduler uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Direction-aware, three classes, backward scan and carry-forward.
    #[default]
    Advanced,
    /// Forward-only, two classes.
    Simple,
}

impl StrategyKind {
    pub fn build(self) -> Box<dyn PrefetchStrategy> {
        match self {
            StrategyKind::Advanced => Box::new(AdvancedStrategy),
            StrategyKind::Simple => Box::new(SimpleStrategy),
        }
    }
}

/// Steps from `from` to `to` going forward and going backward on a loop.
fn circular_distances(from: u32, to: u32, count: u32) -> (u32, u32) {
    let count = u64::from(count);
    let from = u64::from(from) % count;
    let to = u64::from(to) % count;
    let forward = (to + count - from) % count;
    let backward = (from + count - to) % count;
    (forward as u32, backward as u32)
}

/// Pick the shorter way around the loop from `previous` to `next`.
///
/// Ties (including `previous == next`) keep `fallback`, so steady forward
/// playback survives the wrap at the loop boundary.
pub fn resolve_direction_from_index_delta(
    previous: u32,
    next: u32,
    count: u32,
    fallback: Direction,
) -> Direction {
    if count == 0 {
        return fallback;
    }
    let (forward, backward) = circular_distances(previous, next, count);
    if forward < backward {
        Direction::Forward
    } else if backward < forward {
        Direction::Backward
    } else {
        fallback
    }
}

/// One queued timepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkItem {
    pub timepoint: u32,
    pub priority_class: PriorityClass,
    pub score: i32,
    /// Steps from the base timepoint when the item was planned.
    pub distance: u32,
}

impl WorkItem {
    /// Build an item scored as `weight * 100 - distance * 8 (+ 6 while playing)`.
    pub fn scored(
        timepoint: u32,
        priority_class: PriorityClass,
        distance: u32,
        playing: bool,
    ) -> Self {
        let penalty = (distance.min(1 << 24) as i32) * STEP_PENALTY;
        let bonus = if playing { PLAYING_SCORE_BONUS } else { 0 };
        Self {
            timepoint,
            priority_class,
            score: priority_class.weight() * 100 - penalty + bonus,
            distance,
        }
    }
}

/// Everything a strategy may read while planning.
pub struct PlanContext<'a> {
    pub base_index: u32,
    pub timepoint_count: u32,
    pub lookahead: usize,
    pub playing: bool,
    /// Base index of the previous plan, if any.
    pub previous_base: Option<u32>,
    pub previous_direction: Direction,
    /// Items still waiting from the previous plan.
    pub pending: &'a [WorkItem],
    pub in_flight: &'a HashSet<u32>,
    /// Whether every playback layer is resident at a timepoint.
    pub is_ready: &'a dyn Fn(u32) -> bool,
}

impl PlanContext<'_> {
    /// Whether a timepoint needs no new work.
    fn is_settled(&self, timepoint: u32) -> bool {
        self.in_flight.contains(&timepoint) || (self.is_ready)(timepoint)
    }
}

/// Output of a strategy.
#[derive(Debug, Clone, Default)]
pub struct PrefetchPlan {
    /// Sorted by score descending, then distance, then timepoint.
    pub items: Vec<WorkItem>,
    /// Direction the plan was built for.
    pub direction: Direction,
}

/// Candidate generator.
pub trait PrefetchStrategy: Send + Sync {
    fn build_prefetch_plan(&self, ctx: &PlanContext<'_>) -> PrefetchPlan;

    fn kind(&self) -> StrategyKind;
}

/// One candidate per timepoint; duplicates keep the higher score.
#[derive(Default)]
struct CandidateSet {
    by_timepoint: HashMap<u32, WorkItem>,
}

impl CandidateSet {
    fn offer(&mut self, item: WorkItem) {
        self.by_timepoint
            .entry(item.timepoint)
            .and_modify(|existing| {
                if item.score > existing.score {
                    *existing = item;
                }
            })
            .or_insert(item);
    }

    fn into_sorted(self) -> Vec<WorkItem> {
        let mut items: Vec<WorkItem> = self.by_timepoint.into_values().collect();
        items.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(a.distance.cmp(&b.distance))
                .then(a.timepoint.cmp(&b.timepoint))
        });
        items
    }
}

/// Direction-aware planner with reverse speculation and carry-forward.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdvancedStrategy;

impl PrefetchStrategy for AdvancedStrategy {
    fn build_prefetch_plan(&self, ctx: &PlanContext<'_>) -> PrefetchPlan {
        let count = ctx.timepoint_count;
        if count == 0 {
            return PrefetchPlan::default();
        }

        let direction = match ctx.previous_base {
            Some(previous) => resolve_direction_from_index_delta(
                previous,
                ctx.base_index,
                count,
                ctx.previous_direction,
            ),
            None => ctx.previous_direction,
        };

        let mut candidates = CandidateSet::default();

        for step in 0..=ctx.lookahead {
            let timepoint = direction.offset(ctx.base_index, step, count);
            if ctx.is_settled(timepoint) {
                continue;
            }
            candidates.offer(WorkItem::scored(
                timepoint,
                PriorityClass::for_step(step),
                step as u32,
                ctx.playing,
            ));
        }

        // Cheap cover for a reversal; speculative only.
        let reverse = direction.reversed();
        for step in 1..=ctx.lookahead.min(BACKWARD_SCAN_STEPS) {
            let timepoint = reverse.offset(ctx.base_index, step, count);
            if ctx.is_settled(timepoint) {
                continue;
            }
            candidates.offer(WorkItem::scored(
                timepoint,
                PriorityClass::Speculative,
                step as u32,
                ctx.playing,
            ));
        }

        for item in ctx.pending {
            if item.timepoint >= count || ctx.is_settled(item.timepoint) {
                continue;
            }
            let (forward, backward) = circular_distances(ctx.base_index, item.timepoint, count);
            candidates.offer(WorkItem::scored(
                item.timepoint,
                PriorityClass::Speculative,
                forward.min(backward),
                ctx.playing,
            ));
        }

        PrefetchPlan {
            items: candidates.into_sorted(),
            direction,
        }
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Advanced
    }
}

/// Forward-only planner with visible-now and near-future classes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleStrategy;

impl PrefetchStrategy for SimpleStrategy {
    fn build_prefetch_plan(&self, ctx: &PlanContext<'_>) -> PrefetchPlan {
        let count = ctx.timepoint_count;
        if count == 0 {
            return PrefetchPlan::default();
        }

        let mut candidates = CandidateSet::default();
        for step in 0..=ctx.lookahead {
            let timepoint = Direction::Forward.offset(ctx.base_index, step, count);
            if ctx.is_settled(timepoint) {
                continue;
            }
            let class = if step == 0 {
                PriorityClass::VisibleNow
            } else {
                PriorityClass::NearFuture
            };
            candidates.offer(WorkItem::scored(timepoint, class, step as u32, ctx.playing));
        }

        PrefetchPlan {
            items: candidates.into_sorted(),
            direction: Direction::Forward,
        }
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Simple
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        in_flight: HashSet<u32>,
        ready: HashSet<u32>,
        pending: Vec<WorkItem>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                in_flight: HashSet::new(),
                ready: HashSet::new(),
                pending: Vec::new(),
            }
        }

        fn plan(
            &self,
            strategy: &dyn PrefetchStrategy,
            base_index: u32,
            count: u32,
            lookahead: usize,
            previous_base: Option<u32>,
        ) -> PrefetchPlan {
            let is_ready = |t: u32| self.ready.contains(&t);
            let ctx = PlanContext {
                base_index,
                timepoint_count: count,
                lookahead,
                playing: true,
                previous_base,
                previous_direction: Direction::Forward,
                pending: &self.pending,
                in_flight: &self.in_flight,
                is_ready: &is_ready,
            };
            strategy.build_prefetch_plan(&ctx)
        }
    }

    fn timepoints(plan: &PrefetchPlan) -> Vec<u32> {
        plan.items.iter().map(|item| item.timepoint).collect()
    }

    #[test]
    fn test_direction_resolution() {
        assert_eq!(
            resolve_direction_from_index_delta(3, 5, 10, Direction::Forward),
            Direction::Forward
        );
        // Wrapping around is shorter backward
        assert_eq!(
            resolve_direction_from_index_delta(1, 9, 10, Direction::Forward),
            Direction::Backward
        );
        // Ties keep the fallback
        assert_eq!(
            resolve_direction_from_index_delta(0, 5, 10, Direction::Backward),
            Direction::Backward
        );
        assert_eq!(
            resolve_direction_from_index_delta(4, 4, 10, Direction::Forward),
            Direction::Forward
        );
        // Forward wrap at the loop boundary
        assert_eq!(
            resolve_direction_from_index_delta(9, 0, 10, Direction::Backward),
            Direction::Forward
        );
    }

    #[test]
    fn test_offset_wraps() {
        assert_eq!(Direction::Forward.offset(8, 3, 10), 1);
        assert_eq!(Direction::Backward.offset(1, 2, 10), 9);
        assert_eq!(Direction::Forward.offset(0, 0, 0), 0);
    }

    #[test]
    fn test_scores() {
        let item = WorkItem::scored(3, PriorityClass::VisibleNow, 0, true);
        assert_eq!(item.score, 306);
        let item = WorkItem::scored(3, PriorityClass::NearFuture, 2, false);
        assert_eq!(item.score, 184);
        let item = WorkItem::scored(3, PriorityClass::Speculative, 5, true);
        assert_eq!(item.score, 66);
    }

    #[test]
    fn test_advanced_forward_plan() {
        let fixture = Fixture::new();
        let plan = fixture.plan(&AdvancedStrategy, 3, 20, 5, Some(2));

        assert_eq!(plan.direction, Direction::Forward);
        // Backward steps 1 and 2 outrank forward steps 3..=5 at equal class
        assert_eq!(timepoints(&plan), vec![3, 4, 5, 2, 1, 6, 7, 8]);

        let classes: Vec<PriorityClass> = plan.items.iter().map(|i| i.priority_class).collect();
        assert_eq!(classes[0], PriorityClass::VisibleNow);
        assert_eq!(classes[1], PriorityClass::NearFuture);
        assert_eq!(classes[2], PriorityClass::NearFuture);
        assert!(classes[3..].iter().all(|c| *c == PriorityClass::Speculative));
    }

    #[test]
    fn test_advanced_backward_plan() {
        let fixture = Fixture::new();
        // 5 -> 4 is one step backward
        let plan = fixture.plan(&AdvancedStrategy, 4, 20, 2, Some(5));

        assert_eq!(plan.direction, Direction::Backward);
        assert_eq!(timepoints(&plan), vec![4, 3, 2, 5, 6]);
    }

    #[test]
    fn test_advanced_skips_ready_and_in_flight() {
        let mut fixture = Fixture::new();
        fixture.ready.insert(4);
        fixture.in_flight.insert(5);
        let plan = fixture.plan(&AdvancedStrategy, 3, 20, 3, Some(2));

        let tps = timepoints(&plan);
        assert!(!tps.contains(&4));
        assert!(!tps.contains(&5));
        assert_eq!(tps[0], 3);
    }

    #[test]
    fn test_advanced_carry_forward() {
        let mut fixture = Fixture::new();
        fixture.pending = vec![
            WorkItem::scored(15, PriorityClass::NearFuture, 1, true),
            // Out of range after a timeline change
            WorkItem::scored(40, PriorityClass::NearFuture, 1, true),
        ];
        fixture.in_flight.insert(16);
        fixture.pending.push(WorkItem::scored(16, PriorityClass::VisibleNow, 0, true));

        let plan = fixture.plan(&AdvancedStrategy, 3, 20, 2, Some(2));
        let carried: Vec<&WorkItem> = plan.items.iter().filter(|i| i.timepoint == 15).collect();
        assert_eq!(carried.len(), 1);
        assert_eq!(carried[0].priority_class, PriorityClass::Speculative);
        assert_eq!(carried[0].distance, 8);
        assert!(!timepoints(&plan).contains(&40));
        assert!(!timepoints(&plan).contains(&16));
        // Carried item sorts last
        assert_eq!(plan.items.last().map(|i| i.timepoint), Some(15));
    }

    #[test]
    fn test_duplicates_keep_higher_score() {
        let fixture = Fixture::new();
        // With two timepoints every scan lands on 0 or 1
        let plan = fixture.plan(&AdvancedStrategy, 1, 2, 1, None);

        assert_eq!(timepoints(&plan), vec![1, 0]);
        assert_eq!(plan.items[0].priority_class, PriorityClass::VisibleNow);
        assert_eq!(plan.items[1].priority_class, PriorityClass::NearFuture);
    }

    #[test]
    fn test_simple_plan_is_forward_two_class() {
        let fixture = Fixture::new();
        // Previous base says "backward", simple ignores it
        let plan = fixture.plan(&SimpleStrategy, 4, 20, 3, Some(5));

        assert_eq!(plan.direction, Direction::Forward);
        assert_eq!(timepoints(&plan), vec![4, 5, 6, 7]);
        assert!(plan
            .items
            .iter()
            .all(|i| i.priority_class != PriorityClass::Speculative));
    }

    #[test]
    fn test_sort_is_deterministic() {
        let mut set = CandidateSet::default();
        set.offer(WorkItem {
            timepoint: 9,
            priority_class: PriorityClass::Speculative,
            score: 10,
            distance: 2,
        });
        set.offer(WorkItem {
            timepoint: 3,
            priority_class: PriorityClass::Speculative,
            score: 10,
            distance: 2,
        });
        set.offer(WorkItem {
            timepoint: 5,
            priority_class: PriorityClass::Speculative,
            score: 10,
            distance: 1,
        });
        set.offer(WorkItem {
            timepoint: 7,
            priority_class: PriorityClass::NearFuture,
            score: 50,
            distance: 4,
        });

        let order: Vec<u32> = set.into_sorted().iter().map(|i| i.timepoint).collect();
        assert_eq!(order, vec![7, 5, 3, 9]);
    }

    #[test]
    fn test_strategy_kind_builds() {
        assert_eq!(StrategyKind::Advanced.build().kind(), StrategyKind::Advanced);
        assert_eq!(StrategyKind::Simple.build().kind(), StrategyKind::Simple);
    }
}
