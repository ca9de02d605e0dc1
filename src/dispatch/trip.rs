//! Trip task: drives one locomotive along an assigned route.
//!
//! ```text
//! Created → Accelerating → WaitingEnter → Decelerating → WaitingIn → Finishing → Finished
//!     \___________\______________\______________\____________\______→ Canceled
//! ```
//!
//! Every sleep races the trip's [`CancelToken`]. A cancelled trip stops the
//! locomotive, frees its route, releases the target locks and resets its
//! occupancy record, so nothing stays reserved.
//!
//! The enter sensor of the target block ends acceleration early; the in
//! sensor ends deceleration early and is the only thing that stops the
//! train. Sensor read errors count as "not yet".

use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use super::cancel::CancelToken;
use super::occ::{AutoState, OccBlock};
use super::ramp::SpeedRamp;
use super::Shared;
use crate::grid::{BlockSide, CellId, FeedbackEvent, Grid, LocoId};
use crate::routes::RouteId;
use crate::traits::{CommandStation, ModelEvent, Section};

/// Lifecycle phase of a trip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripPhase {
    /// Assigned, not started.
    Created,
    /// Speeding up to cruise speed.
    Accelerating,
    /// Cruising until the enter sensor fires.
    WaitingEnter,
    /// Slowing to creep speed.
    Decelerating,
    /// Creeping until the in sensor fires.
    WaitingIn,
    /// Stopped, updating bookkeeping.
    Finishing,
    /// Arrived.
    Finished,
    /// Cancelled; bookkeeping reset.
    Canceled,
}

impl TripPhase {
    /// Whether the trip is over.
    pub const fn is_terminal(self) -> bool {
        matches!(self, TripPhase::Finished | TripPhase::Canceled)
    }
}

/// Feedback addresses a trip waits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Sensors {
    pub enter: u16,
    pub reached: u16,
}

/// Everything a trip needs, fixed at assignment.
#[derive(Clone, Debug)]
pub(crate) struct TripPlan {
    pub loco: LocoId,
    pub route: RouteId,
    pub serial: u64,
    pub from: CellId,
    pub target: CellId,
    pub sensors: Option<Sensors>,
    pub cruise: u8,
}

impl TripPlan {
    fn owned_by(&self, state: &AutoState) -> bool {
        state
            .trips
            .get(&self.loco)
            .is_some_and(|t| t.serial == self.serial)
    }
}

/// Resolves the enter and in sensors of `target` for a train entering
/// through `side`.
///
/// A missing enter sensor falls back to the in sensor and vice versa.
/// Sensor names without a sensor cell are logged and treated as missing.
pub(crate) fn resolve_sensors(grid: &Grid, target: CellId, side: BlockSide) -> Option<Sensors> {
    let block = grid.cell(target).as_block()?;
    let find = |kind: FeedbackEvent| {
        block
            .events
            .iter()
            .filter(|e| e.event == kind && e.side.map_or(true, |s| s == side))
            .find_map(|e| {
                let address = grid.sensor_address(&e.sensor);
                if address.is_none() {
                    warn!(
                        "block {} refers to unknown sensor '{}'",
                        grid.name_of(target),
                        e.sensor
                    );
                }
                address
            })
    };
    match (find(FeedbackEvent::Enter), find(FeedbackEvent::In)) {
        (Some(enter), Some(reached)) => Some(Sensors { enter, reached }),
        (Some(only), None) | (None, Some(only)) => Some(Sensors {
            enter: only,
            reached: only,
        }),
        (None, None) => None,
    }
}

struct Canceled;

/// Runs a trip to completion or cancellation and returns the final phase.
pub(crate) async fn run_trip<H>(shared: Arc<Shared<H>>, plan: TripPlan, cancel: CancelToken) -> TripPhase
where
    H: CommandStation + 'static,
{
    match drive(&shared, &plan, &cancel).await {
        Ok(()) => {
            shared.finish_trip(&plan);
            TripPhase::Finished
        }
        Err(Canceled) => {
            shared.abort_trip(&plan);
            TripPhase::Canceled
        }
    }
}

async fn drive<H: CommandStation>(shared: &Shared<H>, plan: &TripPlan, cancel: &CancelToken) -> Result<(), Canceled> {
    if cancel.is_cancelled() {
        return Err(Canceled);
    }
    let Some(sensors) = plan.sensors else {
        error!(
            "{}: block {} has no enter or in sensor, cancelling trip",
            plan.loco,
            shared.grid.name_of(plan.target)
        );
        return Err(Canceled);
    };
    let trip = &shared.config.trip;

    shared.set_phase(plan, TripPhase::Accelerating);
    shared.mark(plan, |occ| occ.next_entered = true);
    let speed = ramp(shared, plan.loco, 0, plan.cruise, sensors.enter, cancel).await?;

    shared.set_phase(plan, TripPhase::WaitingEnter);
    wait_for(shared, sensors.enter, cancel).await?;
    shared.mark(plan, |occ| occ.final_entered = true);

    shared.set_phase(plan, TripPhase::Decelerating);
    let creep = trip.creep_speed.min(speed.max(1));
    ramp(shared, plan.loco, speed, creep, sensors.reached, cancel).await?;

    shared.set_phase(plan, TripPhase::WaitingIn);
    wait_for(shared, sensors.reached, cancel).await?;

    shared.set_speed(plan.loco, 0);
    shared.set_phase(plan, TripPhase::Finishing);
    Ok(())
}

async fn pause(duration: std::time::Duration, cancel: &CancelToken) -> Result<(), Canceled> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Canceled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Steps the speed from `from` to `to`, stopping early once `early` fires.
async fn ramp<H: CommandStation>(
    shared: &Shared<H>,
    loco: LocoId,
    from: u8,
    to: u8,
    early: u16,
    cancel: &CancelToken,
) -> Result<u8, Canceled> {
    let trip = &shared.config.trip;
    let mut speed = from;
    for next in SpeedRamp::new(from, to, trip.speed_step) {
        if cancel.is_cancelled() {
            return Err(Canceled);
        }
        if shared.feedback(early) {
            debug!("{}: sensor {} fired during ramp at speed {}", loco, early, speed);
            break;
        }
        shared.set_speed(loco, next);
        speed = next;
        pause(trip.ramp_interval(), cancel).await?;
    }
    Ok(speed)
}

async fn wait_for<H: CommandStation>(shared: &Shared<H>, address: u16, cancel: &CancelToken) -> Result<(), Canceled> {
    loop {
        if cancel.is_cancelled() {
            return Err(Canceled);
        }
        if shared.feedback(address) {
            return Ok(());
        }
        pause(shared.config.trip.sensor_poll(), cancel).await?;
    }
}

// ============================================================================
// Bookkeeping
// ============================================================================

impl<H: CommandStation> Shared<H> {
    fn feedback(&self, address: u16) -> bool {
        match self.station.is_feedback_active(address) {
            Ok(active) => active,
            Err(e) => {
                warn!("reading feedback {} failed: {:?}", address, e);
                false
            }
        }
    }

    fn set_speed(&self, loco: LocoId, speed: u8) {
        self.command("speed", |s| s.set_locomotive_speed(loco, speed));
        self.command("commit", |s| s.commit_pending());
    }

    fn set_phase(&self, plan: &TripPlan, phase: TripPhase) {
        let mut st = self.lock_state();
        if let Some(trip) = st.trips.get_mut(&plan.loco) {
            if trip.serial == plan.serial {
                trip.phase = phase;
            }
        }
    }

    /// Updates the occupancy record, persists it and notifies.
    fn mark<F: FnOnce(&mut OccBlock)>(&self, plan: &TripPlan, f: F) {
        let staged = {
            let mut st = self.lock_state();
            if !plan.owned_by(&st) {
                return;
            }
            if let Some(occ) = st.occ.get_mut(&plan.loco) {
                f(occ);
            }
            self.stage(&st, &[Section::Occ])
        };
        self.write(staged);
        self.notify(ModelEvent::OccChanged);
    }

    /// Frees the target locks taken for this trip.
    fn release_locks(&self, plan: &TripPlan) {
        for block in self.grid.group_of(plan.target) {
            self.grid.with_state(block, |s| {
                if s.locked_by == Some(plan.from) {
                    s.locked_by = None;
                }
            });
        }
    }

    fn finish_trip(&self, plan: &TripPlan) {
        let route = self.catalog.get(plan.route);
        let target = self.grid.cell(plan.target);
        let dwell = target
            .as_block()
            .and_then(|b| b.wait_seconds)
            .unwrap_or(self.config.dwell_seconds);
        let now = self.clock.now_ms();
        let staged = {
            let mut st = self.lock_state();
            if !plan.owned_by(&st) {
                warn!("{}: trip on {} was reset before it finished", plan.loco, route.name);
                return;
            }
            st.trips.remove(&plan.loco);
            st.last_outcome.insert(plan.loco, TripPhase::Finished);
            if let Some(flags) = st.flags_mut(plan.route) {
                flags.occupied = false;
            }
            self.release_locks(plan);
            self.grid.with_state(plan.from, |s| {
                if s.locomotive == Some(plan.loco) {
                    s.locomotive = None;
                }
            });
            self.grid
                .with_state(plan.target, |s| s.locomotive = Some(plan.loco));
            if let Some(occ) = st.occ.get_mut(&plan.loco) {
                occ.reset();
                occ.from_block = target.coord;
                occ.reached_at_ms = now;
                occ.seconds_to_wait = dwell;
            }
            if let Some(runtime) = st.locos.get_mut(&plan.loco) {
                runtime.enter_side = route.target_side;
            }
            self.stage(&st, &[Section::Occ, Section::Locomotives])
        };
        self.write(staged);
        info!("{} arrived in {} via {}", plan.loco, target.display_name(), route.name);
        self.notify(ModelEvent::RouteReset(route.name.clone()));
        self.notify(ModelEvent::OccChanged);
        self.notify(ModelEvent::RoutesChanged);
    }

    fn abort_trip(&self, plan: &TripPlan) {
        self.set_speed(plan.loco, 0);
        let route = self.catalog.get(plan.route);
        let staged = {
            let mut st = self.lock_state();
            st.last_outcome.insert(plan.loco, TripPhase::Canceled);
            if !plan.owned_by(&st) {
                debug!("{}: cancelled trip was already reset", plan.loco);
                return;
            }
            st.trips.remove(&plan.loco);
            if let Some(flags) = st.flags_mut(plan.route) {
                flags.occupied = false;
            }
            self.release_locks(plan);
            if let Some(occ) = st.occ.get_mut(&plan.loco) {
                occ.reset();
            }
            self.stage(&st, &[Section::Occ])
        };
        self.write(staged);
        info!("{}: trip on {} cancelled", plan.loco, route.name);
        self.notify(ModelEvent::RouteReset(route.name.clone()));
        self.notify(ModelEvent::OccChanged);
        self.notify(ModelEvent::RoutesChanged);
    }
}
