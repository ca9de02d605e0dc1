//! Route discovery.
//!
//! From every exit of every block a walk follows the resolved paths of the
//! cells it meets until it steps onto another block. A cell that offers one
//! way on is simply taken. A cell that offers several (a switch entered on
//! its common side) is a branch: the walk takes the first option and a
//! [`BranchInfo`] holding a copy of the walk so far plus the remaining
//! options is pushed on a stack. When the walk ends, branches are popped and
//! each option continues from its own copy, so finishing one branch can
//! never change a route recorded by another.
//!
//! A walk is abandoned (a dead end, logged at debug level) when:
//! - it steps off the grid or onto a side the cell does not accept
//! - it steps straight back onto the cell it just left
//! - it enters a cell through a side it already entered through (loop)
//! - it returns to its own start block
//! - it reaches a block that cannot be entered from that side
//!
//! Connectors are transparent: entering one continues from its partner and
//! both halves are recorded as interior steps.

use std::collections::HashSet;

use log::{debug, info};

use super::RouteStep;
use crate::grid::rules::{entry_port, exit_coord, Adjacency, Path, Port};
use crate::grid::{BlockSide, CellId, Coord, Grid, Side};

/// A discovered route before ids and names are assigned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoundRoute {
    /// Start block.
    pub start: CellId,
    /// Target block.
    pub target: CellId,
    /// End of the start block left through.
    pub start_side: BlockSide,
    /// End of the target block entered through.
    pub target_side: BlockSide,
    /// Visited cells, both blocks included.
    pub steps: Vec<RouteStep>,
}

/// A walk in progress. Owned by value; branches clone it.
#[derive(Clone, Debug)]
struct Walk {
    start: CellId,
    start_side: BlockSide,
    steps: Vec<RouteStep>,
    seen: HashSet<(CellId, Port)>,
    prev: CellId,
    at: Coord,
    entering: Side,
}

/// A deferred choice: the walk up to `cell` and the options not yet taken.
#[derive(Debug)]
struct BranchInfo {
    walk: Walk,
    cell: CellId,
    port: Port,
    candidates: Vec<Path>,
}

enum Advance {
    Continue(Walk),
    Arrived(FoundRoute),
    DeadEnd,
}

impl Walk {
    fn leaving(grid: &Grid, start: CellId, port: Port, start_side: BlockSide) -> Self {
        let cell = grid.cell(start);
        Self {
            start,
            start_side,
            steps: vec![RouteStep {
                cell: start,
                coord: cell.coord,
                entry: None,
                exit: Some(port.side),
                switch: None,
            }],
            seen: HashSet::new(),
            prev: start,
            at: exit_coord(cell, port),
            entering: port.side.opposite(),
        }
    }

    /// Passes through `id` along `path`.
    fn take(mut self, grid: &Grid, id: CellId, port: Port, path: &Path) -> Self {
        let cell = grid.cell(id);
        self.steps.push(RouteStep {
            cell: id,
            coord: cell.coord,
            entry: Some(port.side),
            exit: path.teleport.is_none().then_some(path.to.side),
            switch: path.switch,
        });

        let leave_from = match path.teleport {
            Some(partner) => {
                self.steps.push(RouteStep {
                    cell: partner,
                    coord: grid.cell(partner).coord,
                    entry: None,
                    exit: Some(path.to.side),
                    switch: None,
                });
                partner
            }
            None => id,
        };
        self.prev = leave_from;
        self.at = exit_coord(grid.cell(leave_from), path.to);
        self.entering = path.to.side.opposite();
        self
    }

    /// Finishes on block `id` if it accepts a train through `port`.
    fn arrive(mut self, grid: &Grid, adjacency: &Adjacency, id: CellId, port: Port) -> Option<FoundRoute> {
        if id == self.start {
            debug!("walk from {} returns to itself at {}", grid.name_of(id), self.at);
            return None;
        }
        let Some(accepting) = adjacency.leaving(id, port).next() else {
            debug!("block {} cannot be entered through {:?}", grid.name_of(id), port.side);
            return None;
        };
        self.steps.push(RouteStep {
            cell: id,
            coord: grid.cell(id).coord,
            entry: Some(port.side),
            exit: None,
            switch: None,
        });
        Some(FoundRoute {
            start: self.start,
            target: id,
            start_side: self.start_side,
            target_side: BlockSide::from_rule_side(accepting.rule_from),
            steps: self.steps,
        })
    }
}

/// Finds every route of the layout.
pub fn discover(grid: &Grid, adjacency: &Adjacency) -> Vec<FoundRoute> {
    let mut found = Vec::new();
    let mut blocks = 0;
    for (id, _) in grid.blocks() {
        blocks += 1;
        let mut exits: Vec<(Port, BlockSide)> = Vec::new();
        for path in adjacency.paths(id) {
            let exit = (path.to, BlockSide::from_rule_side(path.rule_to));
            if !exits.iter().any(|(p, _)| *p == path.to) {
                exits.push(exit);
            }
        }
        for (port, side) in exits {
            explore(grid, adjacency, Walk::leaving(grid, id, port, side), &mut found);
        }
    }
    info!("discovered {} routes between {} blocks", found.len(), blocks);
    found
}

/// Runs one walk and every branch it spawns.
fn explore(grid: &Grid, adjacency: &Adjacency, first: Walk, found: &mut Vec<FoundRoute>) {
    let mut branches: Vec<BranchInfo> = Vec::new();
    follow(grid, adjacency, first, &mut branches, found);

    while let Some(branch) = branches.pop() {
        for path in &branch.candidates {
            let walk = branch.walk.clone().take(grid, branch.cell, branch.port, path);
            follow(grid, adjacency, walk, &mut branches, found);
        }
    }
}

fn follow(
    grid: &Grid,
    adjacency: &Adjacency,
    mut walk: Walk,
    branches: &mut Vec<BranchInfo>,
    found: &mut Vec<FoundRoute>,
) {
    loop {
        match advance(grid, adjacency, walk, branches) {
            Advance::Continue(next) => walk = next,
            Advance::Arrived(route) => {
                debug!(
                    "route {} -> {} ({} steps)",
                    grid.name_of(route.start),
                    grid.name_of(route.target),
                    route.steps.len()
                );
                found.push(route);
                return;
            }
            Advance::DeadEnd => return,
        }
    }
}

fn advance(grid: &Grid, adjacency: &Adjacency, mut walk: Walk, branches: &mut Vec<BranchInfo>) -> Advance {
    let Some(id) = grid.id_at(walk.at) else {
        debug!("dead end: nothing at {}", walk.at);
        return Advance::DeadEnd;
    };
    if id == walk.prev {
        debug!("dead end: {} would be entered twice in a row", grid.name_of(id));
        return Advance::DeadEnd;
    }
    let cell = grid.cell(id);
    let Some(port) = entry_port(cell, walk.at, walk.entering) else {
        return Advance::DeadEnd;
    };

    if cell.is_block() {
        return match walk.arrive(grid, adjacency, id, port) {
            Some(route) => Advance::Arrived(route),
            None => Advance::DeadEnd,
        };
    }

    if !walk.seen.insert((id, port)) {
        debug!("dead end: loop through {}", grid.name_of(id));
        return Advance::DeadEnd;
    }

    let mut candidates: Vec<Path> = adjacency.leaving(id, port).copied().collect();
    match candidates.len() {
        0 => {
            debug!("dead end: {} has no way on from {:?}", grid.name_of(id), port.side);
            Advance::DeadEnd
        }
        1 => Advance::Continue(walk.take(grid, id, port, &candidates[0])),
        _ => {
            let first = candidates.remove(0);
            branches.push(BranchInfo {
                walk: walk.clone(),
                cell: id,
                port,
                candidates,
            });
            Advance::Continue(walk.take(grid, id, port, &first))
        }
    }
}
