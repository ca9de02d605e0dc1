//! Route conflict index.
//!
//! Two routes *cross* when they share any non-block cell. Only the interior
//! steps are compared: the endpoints are blocks, whose exclusivity is handled
//! by occupancy. A cell that one route visits and the other does not is never
//! a crossing, so the relation is symmetric.
//!
//! The index is computed once per catalog in O(R²·L). The dispatcher then
//! checks a candidate against the currently occupied routes with
//! [`ConflictIndex::crosses_any`].

use std::collections::HashSet;

use super::{Route, RouteId};
use crate::grid::CellId;

/// Whether two routes share a non-block cell.
pub fn routes_cross(a: &Route, b: &Route) -> bool {
    let cells: HashSet<CellId> = a.interior().iter().map(|s| s.cell).collect();
    b.interior().iter().any(|s| cells.contains(&s.cell))
}

/// A route and every route it crosses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteGroup {
    /// The route.
    pub route: RouteId,
    /// Routes crossing it, in id order.
    pub crossing: Vec<RouteId>,
}

/// Precomputed pairwise crossing relation.
#[derive(Clone, Debug, Default)]
pub struct ConflictIndex {
    crossing: Vec<Vec<RouteId>>,
}

impl ConflictIndex {
    /// Compares every pair of routes. `routes[i].id` must be `RouteId(i)`.
    pub fn build(routes: &[Route]) -> Self {
        let cells: Vec<HashSet<CellId>> = routes
            .iter()
            .map(|r| r.interior().iter().map(|s| s.cell).collect())
            .collect();
        let mut crossing = vec![Vec::new(); routes.len()];
        for i in 0..routes.len() {
            for j in (i + 1)..routes.len() {
                if !cells[i].is_disjoint(&cells[j]) {
                    crossing[i].push(routes[j].id);
                    crossing[j].push(routes[i].id);
                }
            }
        }
        for list in &mut crossing {
            list.sort();
        }
        Self { crossing }
    }

    /// Routes crossing `route`, sorted.
    pub fn crossing(&self, route: RouteId) -> &[RouteId] {
        self.crossing
            .get(route.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether `a` and `b` cross.
    pub fn crosses(&self, a: RouteId, b: RouteId) -> bool {
        self.crossing(a).binary_search(&b).is_ok()
    }

    /// Whether `route` crosses any of `active`.
    pub fn crosses_any<I>(&self, route: RouteId, active: I) -> bool
    where
        I: IntoIterator<Item = RouteId>,
    {
        active
            .into_iter()
            .any(|other| other != route && self.crosses(route, other))
    }

    /// Group of one route over the whole catalog.
    pub fn group(&self, route: RouteId) -> RouteGroup {
        RouteGroup {
            route,
            crossing: self.crossing(route).to_vec(),
        }
    }

    /// Groups of every route over the whole catalog (design-time report).
    pub fn groups(&self) -> Vec<RouteGroup> {
        (0..self.crossing.len())
            .map(|i| self.group(RouteId(i)))
            .collect()
    }

    /// Groups restricted to `subset`: each member lists only the members of
    /// `subset` it crosses.
    pub fn live_groups(&self, subset: &[RouteId]) -> Vec<RouteGroup> {
        subset
            .iter()
            .map(|&route| RouteGroup {
                route,
                crossing: self
                    .crossing(route)
                    .iter()
                    .copied()
                    .filter(|other| subset.contains(other))
                    .collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::rules::Adjacency;
    use crate::grid::{Grid, TrackCell};
    use crate::routes::RouteCatalog;

    /// Two parallel lines joined by nothing, plus a line sharing the first
    /// line's track in the other direction.
    fn catalog() -> RouteCatalog {
        let grid = Grid::new(vec![
            TrackCell::block(0, 0, "A"),
            TrackCell::track(1, 0, "AC"),
            TrackCell::block(2, 0, "B"),
            TrackCell::block(0, 2, "C"),
            TrackCell::track(1, 2, "AC"),
            TrackCell::block(2, 2, "D"),
        ])
        .unwrap();
        RouteCatalog::discover(&grid, &Adjacency::build(&grid))
    }

    fn id(c: &RouteCatalog, name: &str) -> RouteId {
        c.by_name(name).unwrap().id
    }

    #[test]
    fn opposite_directions_cross() {
        let c = catalog();
        let ab = id(&c, "A->B");
        let ba = id(&c, "B->A");
        assert!(c.conflicts().crosses(ab, ba));
        assert!(routes_cross(c.get(ab), c.get(ba)));
    }

    #[test]
    fn separate_lines_do_not_cross() {
        let c = catalog();
        let ab = id(&c, "A->B");
        let cd = id(&c, "C->D");
        assert!(!c.conflicts().crosses(ab, cd));
        assert!(!routes_cross(c.get(ab), c.get(cd)));
    }

    #[test]
    fn crossing_is_symmetric_and_matches_direct_check() {
        let c = catalog();
        for a in c.iter() {
            for b in c.iter() {
                if a.id == b.id {
                    continue;
                }
                assert_eq!(c.conflicts().crosses(a.id, b.id), c.conflicts().crosses(b.id, a.id));
                assert_eq!(c.conflicts().crosses(a.id, b.id), routes_cross(a, b));
            }
        }
    }

    #[test]
    fn live_groups_only_list_subset_members() {
        let c = catalog();
        let ab = id(&c, "A->B");
        let ba = id(&c, "B->A");
        let cd = id(&c, "C->D");

        let all = c.conflicts().groups();
        assert_eq!(all.len(), 4);
        assert_eq!(c.conflicts().group(ab).crossing, vec![ba]);

        let live = c.conflicts().live_groups(&[ab, cd]);
        assert!(live.iter().all(|g| g.crossing.is_empty()));
        assert!(c.conflicts().crosses_any(ba, [ab, cd]));
        assert!(!c.conflicts().crosses_any(ab, [ab, cd]));
    }
}
