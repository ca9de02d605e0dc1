//! Routing rules and adjacency resolution.
//!
//! Every cell carries a comma-separated rule string describing how a train
//! may pass through it. Each token names an entry side and an exit side:
//!
//! | Token | Meaning |
//! |-------|---------|
//! | `AC` | enter left, leave right; the reverse `CA` is added automatically |
//! | `AB!` | one way: enter left, leave top, no reverse |
//! | `AC+` | connector: enter left, leave through the partner connector |
//! | `A1\|C2` | footprint addressing: left edge, first row to right edge, second row |
//!
//! Letter tokens are written for the un-rotated cell and turned with the
//! cell's [`Rotation`](super::Rotation). Footprint tokens address physical
//! edges directly and are never rotated or reversed.
//!
//! Malformed tokens and connectors without a partner are logged and produce
//! no path; resolution never fails.
//!
//! # Example
//!
//! ```rust
//! use rs_autoplay::grid::{Grid, Side, TrackCell, Rotation};
//! use rs_autoplay::grid::rules::Adjacency;
//!
//! let grid = Grid::new(vec![TrackCell::track(0, 0, "AC").rotated(Rotation::R90)]).unwrap();
//! let adjacency = Adjacency::build(&grid);
//! let id = grid.id_at((0, 0).into()).unwrap();
//!
//! // A rotated horizontal track runs top to bottom, both ways.
//! let paths = adjacency.paths(id);
//! assert_eq!(paths.len(), 2);
//! assert!(paths.iter().any(|p| p.from.side == Side::Top && p.to.side == Side::Bottom));
//! assert!(paths.iter().any(|p| p.from.side == Side::Bottom && p.to.side == Side::Top));
//! ```

use log::warn;

use super::{CellId, CellKind, Coord, Grid, Side, SwitchState, TrackCell};

// ============================================================================
// Rule tokens
// ============================================================================

/// One end of a rule token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleEnd {
    /// A letter side, subject to rotation.
    Side(Side),
    /// A physical edge and 1-based position along it.
    Offset(Side, u16),
}

/// A parsed rule token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuleToken {
    /// Entry end.
    pub from: RuleEnd,
    /// Exit end.
    pub to: RuleEnd,
    /// `!` suffix.
    pub one_way: bool,
    /// `+` suffix.
    pub connector: bool,
}

impl RuleToken {
    /// Whether the reverse path is implied.
    pub fn is_bidirectional(&self) -> bool {
        !self.one_way
            && !self.connector
            && matches!((self.from, self.to), (RuleEnd::Side(_), RuleEnd::Side(_)))
    }
}

/// Parses a rule string, skipping (and logging) malformed tokens.
///
/// ```
/// use rs_autoplay::grid::rules::{parse_rules, RuleEnd};
/// use rs_autoplay::grid::Side;
///
/// let tokens = parse_rules("CA, CD!, bogus");
/// assert_eq!(tokens.len(), 2);
/// assert_eq!(tokens[0].from, RuleEnd::Side(Side::Right));
/// assert!(tokens[1].one_way);
/// ```
pub fn parse_rules(text: &str) -> Vec<RuleToken> {
    text.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .filter_map(|t| {
            let token = parse_token(t);
            if token.is_none() {
                warn!("ignoring malformed routing rule '{}'", t);
            }
            token
        })
        .collect()
}

fn parse_token(token: &str) -> Option<RuleToken> {
    let (body, one_way, connector) = if let Some(b) = token.strip_suffix('!') {
        (b, true, false)
    } else if let Some(b) = token.strip_suffix('+') {
        (b, false, true)
    } else {
        (token, false, false)
    };

    if body.chars().any(|c| c.is_ascii_digit()) {
        let (from, to) = body.split_once('|')?;
        return Some(RuleToken {
            from: parse_offset_end(from)?,
            to: parse_offset_end(to)?,
            one_way,
            connector: false,
        })
        .filter(|_| !connector);
    }

    let mut chars = body.chars();
    let from = Side::from_code(chars.next()?)?;
    let to = Side::from_code(chars.next()?)?;
    if chars.next().is_some() {
        return None;
    }
    Some(RuleToken {
        from: RuleEnd::Side(from),
        to: RuleEnd::Side(to),
        one_way,
        connector,
    })
}

fn parse_offset_end(text: &str) -> Option<RuleEnd> {
    let text = text.trim();
    let mut chars = text.chars();
    let side = Side::from_code(chars.next()?)?;
    let offset: u16 = chars.as_str().parse().ok()?;
    (offset > 0).then_some(RuleEnd::Offset(side, offset))
}

// ============================================================================
// Resolved paths
// ============================================================================

/// A position on a cell edge. `offset` counts cells along the edge from the
/// top-left corner, starting at 0; single cells always use 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Port {
    /// Physical edge.
    pub side: Side,
    /// Cell index along the edge.
    pub offset: u16,
}

impl Port {
    /// Port on a single-cell edge.
    pub const fn side(side: Side) -> Self {
        Self { side, offset: 0 }
    }
}

/// One legal traversal of a cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Path {
    /// Where the train enters.
    pub from: Port,
    /// Where the train leaves. For connectors this is a port of the partner.
    pub to: Port,
    /// Entry side before rotation.
    pub rule_from: Side,
    /// Exit side before rotation.
    pub rule_to: Side,
    /// Partner connector the train continues from.
    pub teleport: Option<CellId>,
    /// Straight/turn classification when the cell is a switch.
    pub switch: Option<SwitchState>,
}

impl Path {
    fn reversed(&self) -> Self {
        Self {
            from: self.to,
            to: self.from,
            rule_from: self.rule_to,
            rule_to: self.rule_from,
            teleport: None,
            switch: self.switch,
        }
    }
}

/// Coordinate just outside `cell` beyond `port`.
pub fn exit_coord(cell: &TrackCell, port: Port) -> Coord {
    let (w, h) = cell.footprint();
    let o = i32::from(port.offset);
    let Coord { x, y } = cell.coord;
    match port.side {
        Side::Left => Coord::new(x - 1, y + o),
        Side::Right => Coord::new(x + i32::from(w), y + o),
        Side::Top => Coord::new(x + o, y - 1),
        Side::Bottom => Coord::new(x + o, y + i32::from(h)),
    }
}

/// Port through which a train stepping onto `at` enters `cell` across `side`.
pub fn entry_port(cell: &TrackCell, at: Coord, side: Side) -> Option<Port> {
    let (w, h) = cell.footprint();
    let (offset, len) = if side.is_horizontal_edge() {
        (at.x - cell.coord.x, w)
    } else {
        (at.y - cell.coord.y, h)
    };
    let offset = u16::try_from(offset).ok()?;
    (offset < len).then_some(Port { side, offset })
}

/// Resolves all paths of one cell.
pub fn resolve_paths(grid: &Grid, id: CellId) -> Vec<Path> {
    let cell = grid.cell(id);
    let is_switch = matches!(cell.kind, CellKind::Switch(_));
    let mut paths: Vec<Path> = Vec::new();

    for token in parse_rules(&cell.rules) {
        let Some(mut path) = resolve_token(grid, id, cell, &token) else {
            continue;
        };
        if is_switch {
            path.switch = Some(SwitchState::between(path.rule_from, path.rule_to));
        }
        let reverse = token.is_bidirectional().then(|| path.reversed());
        for p in std::iter::once(path).chain(reverse) {
            if !paths.contains(&p) {
                paths.push(p);
            }
        }
    }
    paths
}

fn resolve_token(grid: &Grid, id: CellId, cell: &TrackCell, token: &RuleToken) -> Option<Path> {
    match (token.from, token.to) {
        (RuleEnd::Offset(fs, fo), RuleEnd::Offset(ts, to)) => {
            let from = footprint_port(cell, fs, fo)?;
            let to = footprint_port(cell, ts, to)?;
            Some(Path {
                from,
                to,
                rule_from: fs,
                rule_to: ts,
                teleport: None,
                switch: None,
            })
        }
        (RuleEnd::Side(fs), RuleEnd::Side(ts)) if token.connector => {
            let partner = resolve_connector(grid, id)?;
            Some(Path {
                from: Port::side(fs.rotate(cell.rotation)),
                to: Port::side(partner.1),
                rule_from: fs,
                rule_to: ts,
                teleport: Some(partner.0),
                switch: None,
            })
        }
        (RuleEnd::Side(fs), RuleEnd::Side(ts)) => Some(Path {
            from: Port::side(fs.rotate(cell.rotation)),
            to: Port::side(ts.rotate(cell.rotation)),
            rule_from: fs,
            rule_to: ts,
            teleport: None,
            switch: None,
        }),
        _ => {
            warn!(
                "cell {} mixes letter and footprint addressing in '{}'",
                cell.display_name(),
                cell.rules
            );
            None
        }
    }
}

fn footprint_port(cell: &TrackCell, side: Side, position: u16) -> Option<Port> {
    let (w, h) = cell.footprint();
    let len = if side.is_horizontal_edge() { w } else { h };
    if position == 0 || position > len {
        warn!(
            "cell {} addresses {}{} outside its {}x{} footprint",
            cell.display_name(),
            side.code(),
            position,
            w,
            h
        );
        return None;
    }
    Some(Port {
        side,
        offset: position - 1,
    })
}

/// Partner connector and the rotated side the train leaves it through.
fn resolve_connector(grid: &Grid, id: CellId) -> Option<(CellId, Side)> {
    let cell = grid.cell(id);
    let Some(partner) = grid.connector_partner(id) else {
        warn!("connector {} has no partner", cell.display_name());
        return None;
    };
    let other = grid.cell(partner);
    let attach = parse_rules(&other.rules)
        .into_iter()
        .find(|t| t.connector)
        .and_then(|t| match t.from {
            RuleEnd::Side(s) => Some(s.rotate(other.rotation)),
            RuleEnd::Offset(..) => None,
        });
    if attach.is_none() {
        warn!("connector {} has no connector rule", other.display_name());
    }
    attach.map(|side| (partner, side))
}

// ============================================================================
// Adjacency cache
// ============================================================================

/// Resolved paths for every cell of a grid.
///
/// Paths are a pure function of a cell's kind, rotation and options, so they
/// are computed once. Call [`invalidate`](Self::invalidate) after editing a
/// cell.
#[derive(Debug, Clone, Default)]
pub struct Adjacency {
    paths: Vec<Vec<Path>>,
}

impl Adjacency {
    /// Resolves every cell of `grid`.
    pub fn build(grid: &Grid) -> Self {
        Self {
            paths: grid.ids().map(|id| resolve_paths(grid, id)).collect(),
        }
    }

    /// Paths of a cell.
    pub fn paths(&self, id: CellId) -> &[Path] {
        self.paths.get(id.index()).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Paths of a cell entering through `port`.
    pub fn leaving(&self, id: CellId, port: Port) -> impl Iterator<Item = &Path> {
        self.paths(id).iter().filter(move |p| p.from == port)
    }

    /// Recomputes `id` and every connector, whose partners may have changed.
    pub fn invalidate(&mut self, grid: &Grid, id: CellId) {
        if self.paths.len() != grid.len() {
            *self = Self::build(grid);
            return;
        }
        let connectors: Vec<CellId> = grid
            .cells_of(|c| matches!(c.kind, CellKind::Connector(_)))
            .map(|(cid, _)| cid)
            .collect();
        for cid in std::iter::once(id).chain(connectors) {
            self.paths[cid.index()] = resolve_paths(grid, cid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{BlockOptions, Rotation};

    fn single(cell: TrackCell) -> (Grid, CellId) {
        let grid = Grid::new(vec![cell]).unwrap();
        let id = grid.ids().next().unwrap();
        (grid, id)
    }

    fn sides(paths: &[Path]) -> Vec<(Side, Side)> {
        paths.iter().map(|p| (p.from.side, p.to.side)).collect()
    }

    // =========================================================================
    // Parsing
    // =========================================================================

    #[test]
    fn parse_plain_and_suffixed_tokens() {
        let tokens = parse_rules("AC,BD!,AB+");
        assert_eq!(tokens.len(), 3);
        assert!(tokens[0].is_bidirectional());
        assert!(tokens[1].one_way && !tokens[1].is_bidirectional());
        assert!(tokens[2].connector && !tokens[2].is_bidirectional());
    }

    #[test]
    fn parse_offset_tokens() {
        let tokens = parse_rules("A1|C2");
        assert_eq!(
            tokens,
            vec![RuleToken {
                from: RuleEnd::Offset(Side::Left, 1),
                to: RuleEnd::Offset(Side::Right, 2),
                one_way: false,
                connector: false,
            }]
        );
        assert!(!tokens[0].is_bidirectional());
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(parse_rules("").is_empty());
        assert!(parse_rules("A").is_empty());
        assert!(parse_rules("ACD").is_empty());
        assert!(parse_rules("XY").is_empty());
        assert!(parse_rules("A0|C1").is_empty());
        assert!(parse_rules("A1C1").is_empty());
        assert!(parse_rules("A1|C1+").is_empty());
        assert_eq!(parse_rules("ZZ,AC").len(), 1);
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    #[test]
    fn bidirectional_rule_yields_both_directions() {
        for rules in ["AC", "AB", "BD", "CA,CD"] {
            let (grid, id) = single(TrackCell::track(0, 0, rules));
            let paths = resolve_paths(&grid, id);
            for p in &paths {
                assert!(
                    paths
                        .iter()
                        .any(|q| q.from == p.to && q.to == p.from),
                    "missing reverse of {:?} for '{}'",
                    p,
                    rules
                );
            }
        }
    }

    #[test]
    fn one_way_rule_has_no_reverse() {
        let (grid, id) = single(TrackCell::direction(0, 0, "AC!"));
        assert_eq!(sides(&resolve_paths(&grid, id)), vec![(Side::Left, Side::Right)]);
    }

    #[test]
    fn rotation_applies_to_letter_rules() {
        let (grid, id) = single(TrackCell::track(0, 0, "AB!").rotated(Rotation::R180));
        let paths = resolve_paths(&grid, id);
        assert_eq!(sides(&paths), vec![(Side::Right, Side::Bottom)]);
        assert_eq!(paths[0].rule_from, Side::Left);
        assert_eq!(paths[0].rule_to, Side::Top);
    }

    #[test]
    fn switch_paths_are_classified() {
        let (grid, id) = single(TrackCell::switch(0, 0, "CA,CD", 1));
        let paths = resolve_paths(&grid, id);
        assert_eq!(paths.len(), 4);
        let straight = paths
            .iter()
            .find(|p| p.from.side == Side::Right && p.to.side == Side::Left)
            .unwrap();
        let turn = paths
            .iter()
            .find(|p| p.from.side == Side::Right && p.to.side == Side::Bottom)
            .unwrap();
        assert_eq!(straight.switch, Some(SwitchState::Straight));
        assert_eq!(turn.switch, Some(SwitchState::Turn));
    }

    #[test]
    fn duplicate_rules_are_collapsed() {
        let (grid, id) = single(TrackCell::track(0, 0, "AC,CA"));
        assert_eq!(resolve_paths(&grid, id).len(), 2);
    }

    #[test]
    fn footprint_rules_use_geometry() {
        let block = TrackCell::block_with(
            0,
            0,
            "Blk",
            "A1|C1,C2|A2",
            BlockOptions {
                width: 3,
                height: 2,
                ..Default::default()
            },
        )
        .rotated(Rotation::R90);
        let (grid, id) = single(block);
        let paths = resolve_paths(&grid, id);
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].from, Port { side: Side::Left, offset: 0 });
        assert_eq!(paths[0].to, Port { side: Side::Right, offset: 0 });
        assert_eq!(paths[1].from, Port { side: Side::Right, offset: 1 });
        let cell = grid.cell(id);
        assert_eq!(exit_coord(cell, paths[0].to), Coord::new(3, 0));
        assert_eq!(exit_coord(cell, paths[1].to), Coord::new(-1, 1));
    }

    #[test]
    fn footprint_rule_outside_footprint_is_dropped() {
        let (grid, id) = single(TrackCell::block_with(
            0,
            0,
            "Blk",
            "A1|C3",
            BlockOptions::default(),
        ));
        assert!(resolve_paths(&grid, id).is_empty());
    }

    #[test]
    fn connector_imports_partner_side() {
        let grid = Grid::new(vec![
            TrackCell::connector(0, 0, "AC+", 9),
            TrackCell::connector(10, 5, "AC+", 9).rotated(Rotation::R90),
        ])
        .unwrap();
        let a = grid.id_at(Coord::new(0, 0)).unwrap();
        let b = grid.id_at(Coord::new(10, 5)).unwrap();
        let paths = resolve_paths(&grid, a);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].from.side, Side::Left);
        assert_eq!(paths[0].to.side, Side::Top);
        assert_eq!(paths[0].teleport, Some(b));
    }

    #[test]
    fn connector_without_partner_has_no_path() {
        let (grid, id) = single(TrackCell::connector(0, 0, "AC+", 9));
        assert!(resolve_paths(&grid, id).is_empty());
        let (grid, id) = single(TrackCell::connector(0, 0, "AC+", 1));
        assert!(resolve_paths(&grid, id).is_empty());
    }

    #[test]
    fn entry_port_offsets() {
        let block = TrackCell::block_with(
            2,
            2,
            "Blk",
            "A1|C1",
            BlockOptions {
                width: 2,
                height: 3,
                ..Default::default()
            },
        );
        assert_eq!(
            entry_port(&block, Coord::new(2, 4), Side::Left),
            Some(Port { side: Side::Left, offset: 2 })
        );
        assert_eq!(
            entry_port(&block, Coord::new(3, 2), Side::Top),
            Some(Port { side: Side::Top, offset: 1 })
        );
        assert_eq!(entry_port(&block, Coord::new(2, 7), Side::Left), None);
    }

    #[test]
    fn adjacency_invalidate_picks_up_connector_edit() {
        let mut grid = Grid::new(vec![
            TrackCell::connector(0, 0, "AC+", 1),
            TrackCell::connector(4, 0, "AC+", 6),
        ])
        .unwrap();
        let a = grid.id_at(Coord::new(0, 0)).unwrap();
        let mut adjacency = Adjacency::build(&grid);
        assert!(adjacency.paths(a).is_empty());

        grid.set_connector_id(a, 6).unwrap();
        adjacency.invalidate(&grid, a);
        assert_eq!(adjacency.paths(a).len(), 1);
        assert_eq!(adjacency.leaving(a, Port::side(Side::Left)).count(), 1);
        assert_eq!(adjacency.leaving(a, Port::side(Side::Right)).count(), 0);
    }
}
