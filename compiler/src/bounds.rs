// bounds.rs — Bounds checks for generated conditionals
//
// Computes the constraints a code generator still has to test at a point,
// given what the enclosing loops already guarantee, and which inames a guard
// at a schedule point may mention.
//
// Preconditions: `implemented` uses the same names as `domain`.
// Postconditions: every returned constraint mentions only checked inames
//   and parameters, and none is implied by `implemented`.
// Failure modes: schedule errors from the cache.
// Side effects: none.

use std::collections::BTreeSet;

use crate::cache::CodegenCache;
use crate::domain::{BasicSet, Constraint};
use crate::schedule::ScheduleError;

/// Constraints of `domain` on `check_inames` not already implied by
/// `implemented`. Convex approximation: other dimensions are projected out.
pub fn approximate_convex_bounds_checks(
    domain: &BasicSet,
    check_inames: &BTreeSet<String>,
    implemented: &BasicSet,
) -> Vec<Constraint> {
    domain
        .remove_redundancies()
        .eliminate_except(check_inames)
        .gist(implemented)
        .constraints
}

/// Inames a conditional at `sched_index` may test: the active loop inames,
/// plus the subkernel's usable parallel inames when inside a subkernel.
pub fn usable_inames_for_conditional(
    cache: &CodegenCache<'_>,
    sched_index: usize,
) -> Result<BTreeSet<String>, ScheduleError> {
    let mut usable = cache.find_active_inames_at(sched_index)?.clone();
    if let Some(subkernel) = cache.get_callkernel_index(sched_index)? {
        let crosses_barrier = sched_index < cache.schedule_len()
            && cache.has_barrier_within(sched_index)?;
        usable.extend(
            cache
                .usable_inames_in_subkernel(subkernel, crosses_barrier)?
                .iter()
                .cloned(),
        );
    }
    Ok(usable)
}

// ── Tests ───────────────────────────────────────────────────────────────────
