//! Next-route selection.
//!
//! [`select_next_route`] runs the filtering pipeline for one locomotive
//! against the dispatcher state. Stages run in a fixed order and the first
//! stage that leaves nothing ends the attempt with a [`SkipReason`]; that is
//! the normal "nothing to do this tick" outcome, not an error.
//!
//! | Stage | Keeps |
//! |-------|-------|
//! | eligibility | unassigned, unlocked, not stopped locomotives |
//! | dwell | locomotives whose dwell has elapsed |
//! | gather | routes leaving the block on the leaving side, whose target accepts the locomotive's types, has a sensor, is enabled and not locked by another block |
//! | reversal | if gathering found nothing, the other side, when both policies allow |
//! | occupancy | routes not travelled and whose target is free and not promised |
//! | maintenance | routes without a switch under maintenance |
//! | conflicts | routes crossing no travelled route |
//! | pick | one survivor at random |
//!
//! Selection only mutates the state when it picks a route after reversing:
//! the locomotive's direction and entry side flip. The matching command
//! station call is left to the caller, which makes it outside the lock.

use log::debug;
use rand::seq::SliceRandom;

use super::occ::{AutoState, LocomotiveRuntime, OccBlock};
use crate::grid::{BlockSide, CellId, Grid, LocoId};
use crate::routes::{RouteCatalog, RouteId};

/// What selection reads besides the dispatcher state.
#[derive(Clone, Copy, Debug)]
pub struct SelectContext<'a> {
    /// The layout.
    pub grid: &'a Grid,
    /// All routes.
    pub catalog: &'a RouteCatalog,
    /// Current clock time.
    pub now_ms: u64,
}

/// Why no route was chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// No occupancy record or runtime data, or the block is gone.
    Unknown,
    /// Already travelling.
    Assigned,
    /// Locked by policy.
    Locked,
    /// Stopped by policy.
    Stopped,
    /// Still dwelling.
    Dwelling {
        /// Clock time the dwell ends.
        ready_at_ms: u64,
    },
    /// No route leaves on either permitted side.
    NoRoute,
    /// Every candidate is travelled or its target is taken.
    Occupied,
    /// Every remaining candidate has a switch under maintenance.
    Maintenance,
    /// Every remaining candidate crosses a travelled route.
    Crossing,
}

/// A direction change decided during selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reversal {
    /// New travel direction.
    pub backward: bool,
    /// New entry side; the locomotive leaves through its opposite.
    pub enter_side: BlockSide,
}

/// Result of one selection attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Selection {
    /// Applied reversal; the caller must send the direction command.
    pub reversal: Option<Reversal>,
    /// Chosen route or the reason for skipping.
    pub outcome: Result<RouteId, SkipReason>,
}

impl Selection {
    fn skip(reason: SkipReason) -> Self {
        Self {
            reversal: None,
            outcome: Err(reason),
        }
    }
}

/// Chooses the next route for `loco`.
pub fn select_next_route(state: &mut AutoState, ctx: &SelectContext<'_>, loco: LocoId) -> Selection {
    let (Some(occ), Some(runtime)) = (state.occ.get(&loco), state.locos.get(&loco)) else {
        return Selection::skip(SkipReason::Unknown);
    };

    if occ.is_assigned() || state.trips.contains_key(&loco) {
        return Selection::skip(SkipReason::Assigned);
    }
    if runtime.policy.locked {
        return Selection::skip(SkipReason::Locked);
    }
    if runtime.policy.stopped {
        return Selection::skip(SkipReason::Stopped);
    }

    let ready_at_ms = occ.ready_at_ms();
    if ctx.now_ms < ready_at_ms {
        return Selection::skip(SkipReason::Dwelling { ready_at_ms });
    }

    let Some(block) = ctx.grid.id_at(occ.from_block).filter(|b| ctx.grid.cell(*b).is_block()) else {
        return Selection::skip(SkipReason::Unknown);
    };

    let mut reversal = None;
    let mut candidates = gather(state, ctx, runtime, block, runtime.leaving_side());
    if candidates.is_empty() {
        if let Some(flip) = attempt_direction_reversal(ctx.grid, runtime, block) {
            candidates = gather(state, ctx, runtime, block, flip.enter_side.opposite());
            if !candidates.is_empty() {
                debug!("{} reverses to leave {}", loco, ctx.grid.name_of(block));
                reversal = Some(flip);
            }
        }
    }
    if candidates.is_empty() {
        return Selection::skip(SkipReason::NoRoute);
    }

    let outcome = narrow(state, ctx, occ, candidates).and_then(|survivors| {
        survivors
            .choose(&mut state.rng)
            .copied()
            .ok_or(SkipReason::Crossing)
    });

    // Only a reversal that leads somewhere is kept.
    let reversal = reversal.filter(|_| outcome.is_ok());
    if let (Some(flip), Some(runtime)) = (reversal, state.locos.get_mut(&loco)) {
        runtime.backward = flip.backward;
        runtime.enter_side = flip.enter_side;
    }

    Selection { reversal, outcome }
}

/// Decides whether `runtime` may reverse inside `block`.
///
/// Both the locomotive's and the block's policy must allow a direction
/// change. Returns the direction and entry side after reversing; nothing is
/// applied.
pub fn attempt_direction_reversal(grid: &Grid, runtime: &LocomotiveRuntime, block: CellId) -> Option<Reversal> {
    let block_allows = grid
        .cell(block)
        .as_block()
        .is_some_and(|b| b.direction_change);
    (runtime.policy.direction_change && block_allows).then(|| Reversal {
        backward: !runtime.backward,
        enter_side: runtime.enter_side.opposite(),
    })
}

/// Routes leaving `block` through `side` whose target will take the train.
fn gather(
    state: &AutoState,
    ctx: &SelectContext<'_>,
    runtime: &LocomotiveRuntime,
    block: CellId,
    side: BlockSide,
) -> Vec<RouteId> {
    ctx.catalog
        .leaving(block, side)
        .filter(|route| {
            let Some(target) = ctx.grid.cell(route.target).as_block() else {
                return false;
            };
            if !runtime.policy.types.intersects(target.types) {
                return false;
            }
            let flags = state.flags(route.id);
            if flags.disabled || flags.no_sensors {
                return false;
            }
            let target_state = ctx.grid.state(route.target);
            !target_state.disabled && target_state.locked_by.map_or(true, |owner| owner == block)
        })
        .map(|route| route.id)
        .collect()
}

/// Occupancy, maintenance and conflict stages.
fn narrow(
    state: &AutoState,
    ctx: &SelectContext<'_>,
    occ: &OccBlock,
    candidates: Vec<RouteId>,
) -> Result<Vec<RouteId>, SkipReason> {
    let free: Vec<RouteId> = candidates
        .into_iter()
        .filter(|&id| {
            let route = ctx.catalog.get(id);
            let target_coord = ctx.grid.cell(route.target).coord;
            !state.flags(id).occupied
                && ctx.grid.state(route.target).locomotive.is_none()
                && !state.is_final_block_of_other(occ.loco, target_coord)
        })
        .collect();
    if free.is_empty() {
        return Err(SkipReason::Occupied);
    }

    let serviceable: Vec<RouteId> = free
        .into_iter()
        .filter(|&id| {
            !ctx.catalog
                .get(id)
                .switches()
                .any(|(cell, _)| ctx.grid.state(cell).maintenance)
        })
        .collect();
    if serviceable.is_empty() {
        return Err(SkipReason::Maintenance);
    }

    let active = state.occupied_routes();
    let clear: Vec<RouteId> = serviceable
        .into_iter()
        .filter(|&id| !ctx.catalog.conflicts().crosses_any(id, active.iter().copied()))
        .collect();
    if clear.is_empty() {
        return Err(SkipReason::Crossing);
    }
    Ok(clear)
}
