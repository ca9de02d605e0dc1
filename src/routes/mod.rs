//! Routes between blocks.
//!
//! A [`Route`] is an ordered list of [`RouteStep`]s from a start block to a
//! target block. Interior steps are never blocks; switch steps carry the
//! [`SwitchState`] the turnout must be set to. The complete set for a layout
//! is produced by [`discovery`] and held in a [`RouteCatalog`] together with
//! its [`ConflictIndex`].
//!
//! Routes are directed: a plain bidirectional line between two blocks yields
//! one route each way, and the two cross each other.
//!
//! # Example
//!
//! ```rust
//! use rs_autoplay::grid::{Grid, TrackCell};
//! use rs_autoplay::grid::rules::Adjacency;
//! use rs_autoplay::routes::RouteCatalog;
//!
//! let grid = Grid::new(vec![
//!     TrackCell::block(0, 0, "Blk1"),
//!     TrackCell::track(1, 0, "AC"),
//!     TrackCell::block(2, 0, "Blk2"),
//! ])
//! .unwrap();
//! let catalog = RouteCatalog::discover(&grid, &Adjacency::build(&grid));
//!
//! let names: Vec<&str> = catalog.iter().map(|r| r.name.as_str()).collect();
//! assert_eq!(names, ["Blk1->Blk2", "Blk2->Blk1"]);
//! ```

pub mod conflict;
pub mod discovery;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::LayoutError;
use crate::grid::rules::Adjacency;
use crate::grid::{BlockSide, CellId, CellKind, Coord, Grid, Side, SwitchState};

pub use conflict::{routes_cross, ConflictIndex, RouteGroup};

/// Index of a route inside its [`RouteCatalog`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(usize);

impl RouteId {
    /// Position of the route in the catalog.
    pub const fn index(self) -> usize {
        self.0
    }
}

/// One cell visited by a route.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteStep {
    /// The cell.
    pub cell: CellId,
    /// Origin coordinate of the cell.
    pub coord: Coord,
    /// Side the train enters through; `None` for the start block and for the
    /// far half of a connector pair.
    pub entry: Option<Side>,
    /// Side the train leaves through; `None` for the target block and for
    /// the near half of a connector pair.
    pub exit: Option<Side>,
    /// Required turnout state on switch cells.
    pub switch: Option<SwitchState>,
}

/// A directed path from one block to another.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    /// Position in the catalog.
    pub id: RouteId,
    /// `"Start->Target"`, with a `#n` suffix when several routes join the
    /// same pair.
    pub name: String,
    /// Start block.
    pub start: CellId,
    /// Target block.
    pub target: CellId,
    /// End of the start block the route leaves through.
    pub start_side: BlockSide,
    /// End of the target block the route enters through.
    pub target_side: BlockSide,
    /// Every visited cell, start and target blocks included.
    pub steps: Vec<RouteStep>,
}

impl Route {
    /// Steps between the two blocks.
    pub fn interior(&self) -> &[RouteStep] {
        match self.steps.len() {
            0..=2 => &[],
            n => &self.steps[1..n - 1],
        }
    }

    /// Switch steps with their required states.
    pub fn switches(&self) -> impl Iterator<Item = (CellId, SwitchState)> + '_ {
        self.steps
            .iter()
            .filter_map(|s| s.switch.map(|state| (s.cell, state)))
    }

    /// Number of switches taken in the turn position.
    pub fn turn_count(&self) -> usize {
        self.switches()
            .filter(|(_, s)| *s == SwitchState::Turn)
            .count()
    }

    /// Whether any step sits at `coord`.
    pub fn has_point(&self, coord: Coord) -> bool {
        self.steps.iter().any(|s| s.coord == coord)
    }

    /// Whether the route passes through `cell`.
    pub fn visits(&self, cell: CellId) -> bool {
        self.steps.iter().any(|s| s.cell == cell)
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// Every route of a layout with its conflict index.
#[derive(Clone, Debug, Default)]
pub struct RouteCatalog {
    routes: Vec<Route>,
    by_name: HashMap<String, RouteId>,
    conflicts: ConflictIndex,
}

impl RouteCatalog {
    /// Runs discovery over the whole grid.
    pub fn discover(grid: &Grid, adjacency: &Adjacency) -> Self {
        Self::from_routes(grid, discovery::discover(grid, adjacency))
    }

    /// Builds a catalog from found routes, assigning ids and unique names.
    pub fn from_routes(grid: &Grid, found: Vec<discovery::FoundRoute>) -> Self {
        let mut routes = Vec::with_capacity(found.len());
        let mut by_name = HashMap::new();
        for f in found {
            let id = RouteId(routes.len());
            let base = format!("{}->{}", grid.name_of(f.start), grid.name_of(f.target));
            let name = unique_name(&by_name, base);
            by_name.insert(name.clone(), id);
            routes.push(Route {
                id,
                name,
                start: f.start,
                target: f.target,
                start_side: f.start_side,
                target_side: f.target_side,
                steps: f.steps,
            });
        }
        let conflicts = ConflictIndex::build(&routes);
        Self {
            routes,
            by_name,
            conflicts,
        }
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no route was found.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// The route with this id.
    ///
    /// # Panics
    ///
    /// If `id` does not come from this catalog.
    pub fn get(&self, id: RouteId) -> &Route {
        &self.routes[id.0]
    }

    /// The route with this name.
    pub fn by_name(&self, name: &str) -> Option<&Route> {
        self.by_name.get(name).map(|id| self.get(*id))
    }

    /// All routes in id order.
    pub fn iter(&self) -> std::slice::Iter<'_, Route> {
        self.routes.iter()
    }

    /// All route ids.
    pub fn ids(&self) -> impl Iterator<Item = RouteId> {
        (0..self.routes.len()).map(RouteId)
    }

    /// Routes leaving `block` through `side`.
    pub fn leaving(&self, block: CellId, side: BlockSide) -> impl Iterator<Item = &Route> {
        self.routes
            .iter()
            .filter(move |r| r.start == block && r.start_side == side)
    }

    /// Pairwise crossing relation.
    pub fn conflicts(&self) -> &ConflictIndex {
        &self.conflicts
    }

    /// Persistable form, keyed by coordinates.
    pub fn to_saved(&self) -> Vec<SavedRoute> {
        self.routes
            .iter()
            .map(|r| SavedRoute {
                name: r.name.clone(),
                start_side: r.start_side,
                target_side: r.target_side,
                steps: r
                    .steps
                    .iter()
                    .map(|s| SavedStep {
                        coord: s.coord,
                        entry: s.entry,
                        exit: s.exit,
                        switch: s.switch,
                    })
                    .collect(),
                disabled: false,
            })
            .collect()
    }

    /// Re-resolves saved routes against `grid`.
    ///
    /// Fails with [`LayoutError::StaleRoute`] when a step no longer lands on a
    /// cell origin, when the endpoints are not blocks, or when a switch step
    /// is not on a switch.
    pub fn from_saved(grid: &Grid, saved: &[SavedRoute]) -> Result<Self, LayoutError> {
        let mut found = Vec::with_capacity(saved.len());
        for route in saved {
            let stale = || LayoutError::StaleRoute(route.name.clone());
            let mut steps = Vec::with_capacity(route.steps.len());
            for s in &route.steps {
                let cell = grid.id_at(s.coord).ok_or_else(stale)?;
                let kind = &grid.cell(cell).kind;
                if grid.cell(cell).coord != s.coord
                    || (s.switch.is_some() && !matches!(kind, CellKind::Switch(_)))
                {
                    return Err(stale());
                }
                steps.push(RouteStep {
                    cell,
                    coord: s.coord,
                    entry: s.entry,
                    exit: s.exit,
                    switch: s.switch,
                });
            }
            let (Some(first), Some(last)) = (steps.first(), steps.last()) else {
                return Err(stale());
            };
            let interior_block = steps.len() > 2
                && steps[1..steps.len() - 1]
                    .iter()
                    .any(|s| grid.cell(s.cell).is_block());
            if steps.len() < 2
                || !grid.cell(first.cell).is_block()
                || !grid.cell(last.cell).is_block()
                || interior_block
            {
                return Err(stale());
            }
            found.push(discovery::FoundRoute {
                start: first.cell,
                target: last.cell,
                start_side: route.start_side,
                target_side: route.target_side,
                steps,
            });
        }
        Ok(Self::from_routes(grid, found))
    }
}

impl<'a> IntoIterator for &'a RouteCatalog {
    type Item = &'a Route;
    type IntoIter = std::slice::Iter<'a, Route>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn unique_name(taken: &HashMap<String, RouteId>, base: String) -> String {
    if !taken.contains_key(&base) {
        return base;
    }
    (2..)
        .map(|n| format!("{}#{}", base, n))
        .find(|candidate| !taken.contains_key(candidate))
        .unwrap_or(base)
}

/// Persisted route.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedRoute {
    /// Route name.
    pub name: String,
    /// End of the start block.
    pub start_side: BlockSide,
    /// End of the target block.
    pub target_side: BlockSide,
    /// Steps keyed by cell origin.
    pub steps: Vec<SavedStep>,
    /// Administratively disabled.
    #[serde(default)]
    pub disabled: bool,
}

/// Persisted route step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedStep {
    /// Cell origin.
    pub coord: Coord,
    /// Entry side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<Side>,
    /// Exit side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<Side>,
    /// Switch state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switch: Option<SwitchState>,
}
