//! Interval merging.
//!
//! Collapses a member's overlapping or adjacent intervals into a minimal
//! equivalent set.
//!
//! # Algorithm Summary
//!
//! 1. Sort intervals by `(start, end, id)` so the result never depends on input order
//! 2. Sweep once, growing the current group while the next interval starts no later
//!    than the group's furthest end plus the adjacency window
//! 3. Each group becomes one interval spanning `[min(start), max(end)]`
//!
//! Two sorted intervals `a`, `b` touch when `b.start <= min(a.end, b.end) + window`,
//! which reduces to `b.start <= a.end + window` because `b.start <= b.end`. Comparing
//! against the furthest end seen in the group therefore catches every member of the
//! group that `b` touches, and chains of touching intervals collapse in a single pass:
//! the output has no pair left to merge.
//!
//! The surviving record of a group is its earliest-created interval (lowest id). It
//! keeps its own tokens. Every other record is returned in [`MergePlan::discarded`]
//! with its tokens intact; the caller revokes them before deleting the records.

use chrono::{DateTime, Duration, Utc};

use crate::interval::{Interval, IntervalId};

/// Default gap tolerance under which two intervals are still merged.
pub const DEFAULT_ADJACENCY_WINDOW: Duration = Duration::days(1);

/// Result of merging one member's intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePlan {
    /// Normalized intervals, ordered by start.
    pub kept: Vec<Interval>,
    /// Records absorbed into a survivor, ordered by id.
    pub discarded: Vec<Interval>,
    changed: Vec<IntervalId>,
}

impl MergePlan {
    /// Survivors whose bounds differ from the stored record.
    pub fn changed(&self) -> impl Iterator<Item = &Interval> {
        self.kept
            .iter()
            .filter(|interval| self.changed.contains(&interval.id))
    }

    /// Returns true if applying the plan would not modify anything.
    pub fn is_noop(&self) -> bool {
        self.discarded.is_empty() && self.changed.is_empty()
    }
}

/// Merges overlapping or adjacent intervals.
///
/// Deterministic and independent of input order.
pub fn merge(intervals: &[Interval], window: Duration) -> MergePlan {
    let mut sorted: Vec<&Interval> = intervals.iter().collect();
    sorted.sort_by_key(|interval| (interval.start, interval.end, interval.id));

    let mut groups: Vec<Vec<&Interval>> = Vec::new();
    let mut group_end: Option<DateTime<Utc>> = None;
    for interval in sorted {
        match (groups.last_mut(), group_end) {
            (Some(group), Some(end)) if interval.start <= end + window => {
                group.push(interval);
                group_end = Some(end.max(interval.end));
            }
            _ => {
                groups.push(vec![interval]);
                group_end = Some(interval.end);
            }
        }
    }

    let mut plan = MergePlan::default();
    for group in groups {
        let Some(survivor) = group.iter().min_by_key(|interval| interval.id) else {
            continue;
        };
        let start = group.iter().map(|interval| interval.start).min();
        let end = group.iter().map(|interval| interval.end).max();
        let (Some(start), Some(end)) = (start, end) else {
            continue;
        };

        let mut kept = (*survivor).clone();
        if kept.start != start || kept.end != end {
            kept.start = start;
            kept.end = end;
            plan.changed.push(kept.id);
        }
        plan.discarded.extend(
            group
                .iter()
                .filter(|interval| interval.id != kept.id)
                .map(|interval| (*interval).clone()),
        );
        plan.kept.push(kept);
    }

    plan.kept.sort_by_key(|interval| (interval.start, interval.id));
    plan.discarded.sort_by_key(|interval| interval.id);
    plan
}
