//! Occupancy records and per-locomotive policy.
//!
//! Everything here is owned by the dispatcher and only touched while its
//! state lock is held. Blocks are referred to by their origin coordinate so
//! the records survive a restart with a rebuilt grid.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::cancel::CancelToken;
use super::trip::TripPhase;
use crate::grid::{BlockSide, Coord, LocoId, TrainTypes};
use crate::routes::RouteId;

/// Live occupancy and assignment record of one locomotive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccBlock {
    /// The locomotive.
    pub loco: LocoId,
    /// Block the locomotive stands in (or is leaving).
    pub from_block: Coord,
    /// Block it was sent to, while a trip is assigned.
    #[serde(default)]
    pub final_block: Option<Coord>,
    /// Name of the assigned route.
    #[serde(default)]
    pub route: Option<String>,
    /// The locomotive has left `from_block`.
    #[serde(default)]
    pub next_entered: bool,
    /// The enter sensor of `final_block` fired.
    #[serde(default)]
    pub final_entered: bool,
    /// Clock time `from_block` was reached.
    #[serde(default)]
    pub reached_at_ms: u64,
    /// Dwell before the next departure.
    #[serde(default)]
    pub seconds_to_wait: u64,
}

impl OccBlock {
    /// A locomotive standing in `block` since `now_ms`, free to leave.
    pub fn new(loco: LocoId, block: Coord, now_ms: u64) -> Self {
        Self {
            loco,
            from_block: block,
            final_block: None,
            route: None,
            next_entered: false,
            final_entered: false,
            reached_at_ms: now_ms,
            seconds_to_wait: 0,
        }
    }

    /// Clears the assignment, keeping position and dwell.
    pub fn reset(&mut self) {
        self.final_block = None;
        self.route = None;
        self.next_entered = false;
        self.final_entered = false;
    }

    /// Whether a trip is assigned.
    pub fn is_assigned(&self) -> bool {
        self.final_block.is_some()
    }

    /// Earliest clock time the locomotive may leave again.
    pub fn ready_at_ms(&self) -> u64 {
        self.reached_at_ms
            .saturating_add(self.seconds_to_wait.saturating_mul(1000))
    }
}

/// Administrative settings of one locomotive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocoPolicy {
    /// May reverse to leave a block through the end it entered.
    pub direction_change: bool,
    /// Block types the locomotive may be sent to.
    pub types: TrainTypes,
    /// Never dispatched.
    pub locked: bool,
    /// Finishes its current trip, then stays put.
    pub stopped: bool,
    /// Cap on the cruise speed.
    pub max_speed: Option<u8>,
}

impl Default for LocoPolicy {
    fn default() -> Self {
        Self {
            direction_change: true,
            types: TrainTypes::all(),
            locked: false,
            stopped: false,
            max_speed: None,
        }
    }
}

/// Runtime data of a locomotive, independent of the command station.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocomotiveRuntime {
    /// Command station id.
    pub id: LocoId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Policy.
    #[serde(default)]
    pub policy: LocoPolicy,
    /// End of the current block the locomotive entered through.
    #[serde(default)]
    pub enter_side: BlockSide,
    /// Current travel direction.
    #[serde(default)]
    pub backward: bool,
}

impl LocomotiveRuntime {
    /// A locomotive with the default policy.
    pub fn new(id: LocoId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            policy: LocoPolicy::default(),
            enter_side: BlockSide::default(),
            backward: false,
        }
    }

    /// Replace the policy.
    pub fn with_policy(mut self, policy: LocoPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the side the locomotive entered its block through.
    pub fn entered_from(mut self, side: BlockSide) -> Self {
        self.enter_side = side;
        self
    }

    /// End of the block the locomotive leaves through when not reversing.
    pub fn leaving_side(&self) -> BlockSide {
        self.enter_side.opposite()
    }
}

/// Live flags of one route.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteFlags {
    /// A locomotive is travelling it.
    pub occupied: bool,
    /// Administratively excluded.
    pub disabled: bool,
    /// The target has no usable sensor, so a trip could never arrive.
    #[serde(default)]
    pub no_sensors: bool,
}

/// A trip in flight.
#[derive(Clone, Debug)]
pub struct TripStatus {
    /// Route being travelled.
    pub route: RouteId,
    /// Current phase.
    pub phase: TripPhase,
    /// Cancels the trip.
    pub cancel: CancelToken,
    /// Distinguishes this trip from a later one of the same locomotive.
    pub serial: u64,
}

/// State guarded by the dispatcher lock.
#[derive(Debug)]
pub struct AutoState {
    /// One record per locomotive on the layout, in scan order.
    pub occ: BTreeMap<LocoId, OccBlock>,
    /// Every known locomotive.
    pub locos: BTreeMap<LocoId, LocomotiveRuntime>,
    /// Flags indexed by [`RouteId::index`].
    pub routes: Vec<RouteFlags>,
    /// Running trips.
    pub trips: BTreeMap<LocoId, TripStatus>,
    /// How the last trip of each locomotive ended.
    pub last_outcome: BTreeMap<LocoId, TripPhase>,
    /// Tie-break source.
    pub rng: StdRng,
    next_serial: u64,
}

impl AutoState {
    /// Empty state for a catalog of `route_count` routes.
    pub fn new(route_count: usize, seed: Option<u64>) -> Self {
        Self {
            occ: BTreeMap::new(),
            locos: BTreeMap::new(),
            routes: vec![RouteFlags::default(); route_count],
            trips: BTreeMap::new(),
            last_outcome: BTreeMap::new(),
            rng: seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64),
            next_serial: 0,
        }
    }

    /// Ids of routes currently travelled.
    pub fn occupied_routes(&self) -> Vec<RouteId> {
        self.trips.values().map(|t| t.route).collect()
    }

    /// Flags of a route.
    pub fn flags(&self, route: RouteId) -> RouteFlags {
        self.routes.get(route.index()).copied().unwrap_or_default()
    }

    /// Mutable flags of a route.
    pub fn flags_mut(&mut self, route: RouteId) -> Option<&mut RouteFlags> {
        self.routes.get_mut(route.index())
    }

    /// Whether another locomotive is headed for `block`.
    pub fn is_final_block_of_other(&self, loco: LocoId, block: Coord) -> bool {
        self.occ
            .values()
            .any(|o| o.loco != loco && o.final_block == Some(block))
    }

    /// Next trip serial.
    pub fn next_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    /// Resets every assignment, cancels running trips and marks all routes
    /// free.
    pub fn reset_assignments(&mut self) {
        for occ in self.occ.values_mut() {
            occ.reset();
        }
        for flags in &mut self.routes {
            flags.occupied = false;
        }
        for (loco, trip) in std::mem::take(&mut self.trips) {
            trip.cancel.cancel();
            self.last_outcome.insert(loco, TripPhase::Canceled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_keeps_position_and_dwell() {
        let mut occ = OccBlock::new(LocoId(1), Coord::new(4, 0), 1_000);
        occ.seconds_to_wait = 5;
        occ.final_block = Some(Coord::new(9, 0));
        occ.route = Some("A->B".into());
        occ.next_entered = true;
        occ.reset();
        assert!(!occ.is_assigned());
        assert_eq!(occ.route, None);
        assert!(!occ.next_entered);
        assert_eq!(occ.from_block, Coord::new(4, 0));
        assert_eq!(occ.ready_at_ms(), 6_000);
    }

    #[test]
    fn occ_deserializes_with_missing_fields() {
        let occ: OccBlock =
            serde_json::from_str(r#"{"loco": 3, "from_block": {"x": 1, "y": 2}}"#).unwrap();
        assert_eq!(occ.loco, LocoId(3));
        assert!(!occ.is_assigned());
    }

    #[test]
    fn leaving_side_is_opposite_of_entry() {
        let loco = LocomotiveRuntime::new(LocoId(1), "V100").entered_from(BlockSide::Plus);
        assert_eq!(loco.leaving_side(), BlockSide::Minus);
    }

    #[test]
    fn seeded_state_is_reproducible() {
        use rand::Rng;
        let mut a = AutoState::new(0, Some(7));
        let mut b = AutoState::new(0, Some(7));
        assert_eq!(a.rng.gen::<u64>(), b.rng.gen::<u64>());
    }
}
