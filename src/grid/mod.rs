//! Sparse grid model of the layout.
//!
//! A layout is a set of [`TrackCell`]s placed on integer coordinates. Each cell
//! has a typed [`CellKind`] carrying the options that matter for routing and
//! dispatching, an orientation, and a routing-rule string describing which of
//! its sides connect (see [`rules`]).
//!
//! The [`Grid`] owns the cells in an arena indexed by [`CellId`]. The layout is
//! immutable while auto mode runs; only the per-cell runtime [`CellState`]
//! (current locomotive, block locks, administrative flags) changes, and each
//! cell guards its own state with its own lock.
//!
//! # Example
//!
//! ```rust
//! use rs_autoplay::grid::{Grid, TrackCell};
//!
//! let grid = Grid::new(vec![
//!     TrackCell::block(0, 0, "Blk1"),
//!     TrackCell::track(1, 0, "AC"),
//!     TrackCell::block(2, 0, "Blk2"),
//! ])
//! .unwrap();
//!
//! assert_eq!(grid.blocks().count(), 2);
//! assert!(grid.get(1, 0).is_some());
//! assert!(grid.get(3, 0).is_none());
//! ```

pub mod rules;

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::LayoutError;

// ============================================================================
// Geometry
// ============================================================================

/// Integer grid coordinate. `y` grows downwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coord {
    /// Column.
    pub x: i32,
    /// Row.
    pub y: i32,
}

impl Coord {
    /// Creates a coordinate.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// The neighbouring coordinate across `side`.
    pub const fn step(self, side: Side) -> Self {
        match side {
            Side::Left => Self::new(self.x - 1, self.y),
            Side::Top => Self::new(self.x, self.y - 1),
            Side::Right => Self::new(self.x + 1, self.y),
            Side::Bottom => Self::new(self.x, self.y + 1),
        }
    }
}

impl std::fmt::Display for Coord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

impl From<(i32, i32)> for Coord {
    fn from((x, y): (i32, i32)) -> Self {
        Coord::new(x, y)
    }
}

/// Edge of a cell footprint.
///
/// Routing rules code the sides as letters: `A` = left, `B` = top,
/// `C` = right, `D` = bottom.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Side {
    /// `A`
    Left,
    /// `B`
    Top,
    /// `C`
    Right,
    /// `D`
    Bottom,
}

impl Side {
    /// All sides in rule-letter order.
    pub const ALL: [Side; 4] = [Side::Left, Side::Top, Side::Right, Side::Bottom];

    /// Parses a rule letter (`A`..`D`, case-insensitive).
    ///
    /// ```
    /// use rs_autoplay::grid::Side;
    ///
    /// assert_eq!(Side::from_code('A'), Some(Side::Left));
    /// assert_eq!(Side::from_code('d'), Some(Side::Bottom));
    /// assert_eq!(Side::from_code('E'), None);
    /// ```
    pub fn from_code(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'A' => Some(Side::Left),
            'B' => Some(Side::Top),
            'C' => Some(Side::Right),
            'D' => Some(Side::Bottom),
            _ => None,
        }
    }

    /// Rule letter for this side.
    pub const fn code(self) -> char {
        match self {
            Side::Left => 'A',
            Side::Top => 'B',
            Side::Right => 'C',
            Side::Bottom => 'D',
        }
    }

    /// The side facing this one across a shared edge.
    pub const fn opposite(self) -> Self {
        Self::from_index(self.index() + 2)
    }

    /// Rotates the side clockwise by `rotation`.
    pub const fn rotate(self, rotation: Rotation) -> Self {
        Self::from_index(self.index() + rotation.quarter_turns())
    }

    /// Undoes [`rotate`](Self::rotate).
    pub const fn unrotate(self, rotation: Rotation) -> Self {
        Self::from_index(self.index() + 4 - rotation.quarter_turns())
    }

    /// Whether the side runs along the x axis (top or bottom edge).
    pub const fn is_horizontal_edge(self) -> bool {
        matches!(self, Side::Top | Side::Bottom)
    }

    const fn index(self) -> u8 {
        match self {
            Side::Left => 0,
            Side::Top => 1,
            Side::Right => 2,
            Side::Bottom => 3,
        }
    }

    const fn from_index(i: u8) -> Self {
        match i % 4 {
            0 => Side::Left,
            1 => Side::Top,
            2 => Side::Right,
            _ => Side::Bottom,
        }
    }
}

/// Clockwise orientation of a cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Rotation {
    /// 0°
    #[default]
    R0,
    /// 90°
    R90,
    /// 180°
    R180,
    /// 270°
    R270,
}

impl Rotation {
    /// Parses an angle in degrees. Negative and >360 angles are normalised;
    /// anything not a multiple of 90 is rejected.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Rotation::R0),
            90 => Some(Rotation::R90),
            180 => Some(Rotation::R180),
            270 => Some(Rotation::R270),
            _ => None,
        }
    }

    /// Number of clockwise quarter turns.
    pub const fn quarter_turns(self) -> u8 {
        match self {
            Rotation::R0 => 0,
            Rotation::R90 => 1,
            Rotation::R180 => 2,
            Rotation::R270 => 3,
        }
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Arena index of a cell inside its [`Grid`]. Assigned at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(usize);

impl CellId {
    /// Position of the cell in the grid arena.
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Identifier of a locomotive as known to the command station.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocoId(pub u32);

impl std::fmt::Display for LocoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "loco#{}", self.0)
    }
}

// ============================================================================
// Block attributes
// ============================================================================

/// End of a block a locomotive enters or leaves through.
///
/// For the block's un-rotated rule sides, `A`/`B` are the minus end and
/// `C`/`D` are the plus end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BlockSide {
    /// Left (or top) end.
    #[default]
    Minus,
    /// Right (or bottom) end.
    Plus,
}

impl BlockSide {
    /// The other end of the block.
    pub const fn opposite(self) -> Self {
        match self {
            BlockSide::Minus => BlockSide::Plus,
            BlockSide::Plus => BlockSide::Minus,
        }
    }

    /// Classifies an un-rotated rule side.
    pub const fn from_rule_side(side: Side) -> Self {
        match side {
            Side::Left | Side::Top => BlockSide::Minus,
            Side::Right | Side::Bottom => BlockSide::Plus,
        }
    }
}

/// Traffic category tag shared by blocks and locomotives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrainType {
    /// Anything not covered by another tag.
    Others,
    /// Long distance passenger trains.
    Intercity,
    /// Regional passenger trains.
    Regional,
    /// Local passenger trains.
    Local,
    /// Freight trains.
    Freight,
    /// Shunting movements.
    Shunting,
    /// Branch line traffic.
    Branch,
}

impl TrainType {
    /// Every tag.
    pub const ALL: [TrainType; 7] = [
        TrainType::Others,
        TrainType::Intercity,
        TrainType::Regional,
        TrainType::Local,
        TrainType::Freight,
        TrainType::Shunting,
        TrainType::Branch,
    ];

    const fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// Set of enabled [`TrainType`] flags.
///
/// A locomotive may enter a block only if both share at least one tag.
///
/// ```
/// use rs_autoplay::grid::{TrainType, TrainTypes};
///
/// let block = TrainTypes::none().with(TrainType::Freight);
/// let loco = TrainTypes::none().with(TrainType::Freight).with(TrainType::Shunting);
/// assert!(block.intersects(loco));
/// assert!(!block.intersects(TrainTypes::none().with(TrainType::Intercity)));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrainTypes(u16);

impl TrainTypes {
    /// No tags enabled.
    pub const fn none() -> Self {
        Self(0)
    }

    /// Every tag enabled.
    pub const fn all() -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < TrainType::ALL.len() {
            bits |= TrainType::ALL[i].bit();
            i += 1;
        }
        Self(bits)
    }

    /// Returns the set with `ty` enabled.
    pub const fn with(self, ty: TrainType) -> Self {
        Self(self.0 | ty.bit())
    }

    /// Returns the set with `ty` disabled.
    pub const fn without(self, ty: TrainType) -> Self {
        Self(self.0 & !ty.bit())
    }

    /// Whether `ty` is enabled.
    pub const fn contains(self, ty: TrainType) -> bool {
        self.0 & ty.bit() != 0
    }

    /// Whether at least one tag is enabled in both sets.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether no tag is enabled.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for TrainTypes {
    fn default() -> Self {
        Self::all()
    }
}

/// Which sensor reading a block event reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeedbackEvent {
    /// The train has started entering the block; start braking.
    Enter,
    /// The train is fully inside the block; stop.
    In,
}

/// Mapping of a sensor to an event of the block that owns it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvent {
    /// Name of the sensor cell.
    pub sensor: String,
    /// Event the sensor triggers.
    pub event: FeedbackEvent,
    /// Restricts the mapping to trains entering through this end.
    /// `None` applies to both ends.
    #[serde(default)]
    pub side: Option<BlockSide>,
}

impl BlockEvent {
    /// Creates a mapping that applies to both block ends.
    pub fn new(sensor: impl Into<String>, event: FeedbackEvent) -> Self {
        Self {
            sensor: sensor.into(),
            event,
            side: None,
        }
    }

    /// Restricts the mapping to one block end.
    pub fn on_side(mut self, side: BlockSide) -> Self {
        self.side = Some(side);
        self
    }
}

/// Persisted form of a block event, as stored in the `Feedbacks` section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackBinding {
    /// Name of the block the event belongs to.
    pub block: String,
    /// The event itself.
    #[serde(flatten)]
    pub event: BlockEvent,
}

// ============================================================================
// Cell kinds
// ============================================================================

/// Options of a block cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockOptions {
    /// Footprint width in cells.
    pub width: u16,
    /// Footprint height in cells.
    pub height: u16,
    /// Blocks sharing a group id are locked together.
    pub group: Option<u32>,
    /// Traffic tags accepted by the block.
    pub types: TrainTypes,
    /// Initial administrative disable flag.
    pub disabled: bool,
    /// Whether locomotives may reverse inside this block.
    pub direction_change: bool,
    /// Dwell override in seconds.
    pub wait_seconds: Option<u64>,
    /// Sensor-to-event mapping.
    pub events: Vec<BlockEvent>,
}

impl Default for BlockOptions {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            group: None,
            types: TrainTypes::all(),
            disabled: false,
            direction_change: true,
            wait_seconds: None,
            events: Vec::new(),
        }
    }
}

/// Options of a switch (turnout) cell.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SwitchOptions {
    /// Accessory address on the command station.
    pub address: u16,
    /// Swap straight and turn when commanding the hardware.
    pub inverted: bool,
    /// Initial maintenance flag; switches in maintenance are never routed over.
    pub maintenance: bool,
}

/// Options of a feedback sensor cell.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SensorOptions {
    /// Feedback address on the command station.
    pub address: u16,
}

/// Options of a signal cell.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignalOptions {
    /// Accessory address, if the signal is wired.
    pub address: Option<u16>,
}

/// Options of a connector cell.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectorOptions {
    /// Pairing id. Ids `0` and `1` mean "unset".
    pub id: u32,
}

impl ConnectorOptions {
    /// Whether the id pairs this connector with another one.
    pub const fn is_set(&self) -> bool {
        self.id > 1
    }
}

/// Typed cell kind with its options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CellKind {
    /// Plain track.
    Track,
    /// Turnout.
    Switch(SwitchOptions),
    /// Signal; routes pass through it like track.
    Signal(SignalOptions),
    /// Block section; routing endpoint and unit of occupancy.
    Block(BlockOptions),
    /// Feedback sensor; routes pass through it like track.
    Sensor(SensorOptions),
    /// Direction marker, normally carrying one-way (`!`) rules.
    Direction,
    /// One half of a connector pair.
    Connector(ConnectorOptions),
}

impl CellKind {
    /// Short lowercase name of the kind.
    pub const fn label(&self) -> &'static str {
        match self {
            CellKind::Track => "track",
            CellKind::Switch(_) => "switch",
            CellKind::Signal(_) => "signal",
            CellKind::Block(_) => "block",
            CellKind::Sensor(_) => "sensor",
            CellKind::Direction => "direction",
            CellKind::Connector(_) => "connector",
        }
    }

    /// Whether this is a block.
    pub const fn is_block(&self) -> bool {
        matches!(self, CellKind::Block(_))
    }
}

/// Switch traversal mode along a route.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwitchState {
    /// Entry and exit on opposite sides.
    Straight,
    /// Entry and exit on adjacent sides.
    Turn,
}

impl SwitchState {
    /// Classifies a traversal from `from` to `to` (both in rule space).
    pub const fn between(from: Side, to: Side) -> Self {
        if from.opposite().index() == to.index() {
            SwitchState::Straight
        } else {
            SwitchState::Turn
        }
    }

    /// The other state.
    pub const fn toggled(self) -> Self {
        match self {
            SwitchState::Straight => SwitchState::Turn,
            SwitchState::Turn => SwitchState::Straight,
        }
    }
}

// ============================================================================
// Track cell
// ============================================================================

/// One item of the layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackCell {
    /// Top-left coordinate of the footprint.
    pub coord: Coord,
    /// Clockwise orientation.
    pub rotation: Rotation,
    /// Name, unique when non-empty.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Routing rules, e.g. `"AC"` or `"CA,CD"`.
    pub rules: String,
    /// Kind and kind-specific options.
    pub kind: CellKind,
}

impl TrackCell {
    /// Creates a cell of any kind.
    pub fn new(kind: CellKind, x: i32, y: i32, rules: &str) -> Self {
        Self {
            coord: Coord::new(x, y),
            rotation: Rotation::R0,
            name: String::new(),
            description: String::new(),
            rules: rules.to_string(),
            kind,
        }
    }

    /// Plain track.
    pub fn track(x: i32, y: i32, rules: &str) -> Self {
        Self::new(CellKind::Track, x, y, rules)
    }

    /// Direction marker with one-way rules.
    pub fn direction(x: i32, y: i32, rules: &str) -> Self {
        Self::new(CellKind::Direction, x, y, rules)
    }

    /// Turnout with the given accessory address.
    pub fn switch(x: i32, y: i32, rules: &str, address: u16) -> Self {
        Self::new(
            CellKind::Switch(SwitchOptions {
                address,
                ..Default::default()
            }),
            x,
            y,
            rules,
        )
    }

    /// Single-cell block running left to right.
    pub fn block(x: i32, y: i32, name: &str) -> Self {
        Self::new(CellKind::Block(BlockOptions::default()), x, y, "AC").named(name)
    }

    /// Block with explicit options and rules.
    pub fn block_with(x: i32, y: i32, name: &str, rules: &str, options: BlockOptions) -> Self {
        Self::new(CellKind::Block(options), x, y, rules).named(name)
    }

    /// Feedback sensor on straight track.
    pub fn sensor(x: i32, y: i32, name: &str, address: u16) -> Self {
        Self::new(CellKind::Sensor(SensorOptions { address }), x, y, "AC").named(name)
    }

    /// Signal on straight track.
    pub fn signal(x: i32, y: i32, address: Option<u16>) -> Self {
        Self::new(CellKind::Signal(SignalOptions { address }), x, y, "AC")
    }

    /// Connector half with pairing id.
    pub fn connector(x: i32, y: i32, rules: &str, id: u32) -> Self {
        Self::new(CellKind::Connector(ConnectorOptions { id }), x, y, rules)
    }

    /// Sets the rotation.
    pub fn rotated(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// Sets the name.
    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Sets the description.
    pub fn described(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Footprint as `(width, height)`.
    pub fn footprint(&self) -> (u16, u16) {
        match &self.kind {
            CellKind::Block(b) => (b.width, b.height),
            _ => (1, 1),
        }
    }

    /// Whether the footprint covers `coord`.
    pub fn covers(&self, coord: Coord) -> bool {
        let (w, h) = self.footprint();
        coord.x >= self.coord.x
            && coord.y >= self.coord.y
            && coord.x < self.coord.x + i32::from(w)
            && coord.y < self.coord.y + i32::from(h)
    }

    /// Block options, if this is a block.
    pub fn as_block(&self) -> Option<&BlockOptions> {
        match &self.kind {
            CellKind::Block(b) => Some(b),
            _ => None,
        }
    }

    /// Switch options, if this is a switch.
    pub fn as_switch(&self) -> Option<&SwitchOptions> {
        match &self.kind {
            CellKind::Switch(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this is a block.
    pub fn is_block(&self) -> bool {
        self.kind.is_block()
    }

    /// Name if set, otherwise kind and coordinate.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("{}{}", self.kind.label(), self.coord)
        } else {
            self.name.clone()
        }
    }

    fn covered(&self) -> impl Iterator<Item = Coord> + '_ {
        let (w, h) = self.footprint();
        (0..i32::from(h)).flat_map(move |dy| {
            (0..i32::from(w)).map(move |dx| Coord::new(self.coord.x + dx, self.coord.y + dy))
        })
    }
}

// ============================================================================
// Runtime cell state
// ============================================================================

/// Mutable runtime options of a cell.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CellState {
    /// Locomotive currently standing in the block.
    pub locomotive: Option<LocoId>,
    /// Block that reserved this block as the target of a route.
    pub locked_by: Option<CellId>,
    /// Administratively disabled block.
    pub disabled: bool,
    /// Switch under maintenance.
    pub maintenance: bool,
}

// ============================================================================
// Grid
// ============================================================================

/// Arena of cells with coordinate and name indexes.
///
/// Reads never lock; [`with_state`](Self::with_state) locks a single cell's
/// [`CellState`] for the duration of the closure.
#[derive(Debug)]
pub struct Grid {
    cells: Vec<TrackCell>,
    states: Vec<Mutex<CellState>>,
    index: HashMap<Coord, CellId>,
    names: HashMap<String, CellId>,
}

impl Grid {
    /// Builds the grid, indexing every coordinate covered by each footprint.
    pub fn new(cells: Vec<TrackCell>) -> Result<Self, LayoutError> {
        let mut index = HashMap::new();
        let mut names = HashMap::new();
        let mut states = Vec::with_capacity(cells.len());

        for (i, cell) in cells.iter().enumerate() {
            let id = CellId(i);
            let (w, h) = cell.footprint();
            if w == 0 || h == 0 {
                return Err(LayoutError::EmptyFootprint { coord: cell.coord });
            }
            for coord in cell.covered() {
                if index.insert(coord, id).is_some() {
                    return Err(LayoutError::Overlap { coord });
                }
            }
            if !cell.name.is_empty() && names.insert(cell.name.clone(), id).is_some() {
                return Err(LayoutError::DuplicateName(cell.name.clone()));
            }
            states.push(Mutex::new(initial_state(cell)));
        }

        Ok(Self {
            cells,
            states,
            index,
            names,
        })
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the grid has no cells.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// The cell with this id.
    ///
    /// # Panics
    ///
    /// If `id` does not come from this grid.
    pub fn cell(&self, id: CellId) -> &TrackCell {
        &self.cells[id.0]
    }

    /// The cell whose footprint covers `(x, y)`.
    pub fn get(&self, x: i32, y: i32) -> Option<&TrackCell> {
        self.id_at(Coord::new(x, y)).map(|id| self.cell(id))
    }

    /// Id of the cell whose footprint covers `coord`.
    pub fn id_at(&self, coord: Coord) -> Option<CellId> {
        self.index.get(&coord).copied()
    }

    /// Id of the cell with this name.
    pub fn by_name(&self, name: &str) -> Option<CellId> {
        self.names.get(name).copied()
    }

    /// All cell ids in arena order.
    pub fn ids(&self) -> impl Iterator<Item = CellId> {
        (0..self.cells.len()).map(CellId)
    }

    /// Cells matching `predicate`, in arena order.
    pub fn cells_of<'a, F>(&'a self, predicate: F) -> impl Iterator<Item = (CellId, &'a TrackCell)> + 'a
    where
        F: Fn(&TrackCell) -> bool + 'a,
    {
        self.cells
            .iter()
            .enumerate()
            .filter(move |(_, c)| predicate(c))
            .map(|(i, c)| (CellId(i), c))
    }

    /// All blocks, in arena order.
    pub fn blocks(&self) -> impl Iterator<Item = (CellId, &TrackCell)> + '_ {
        self.cells_of(TrackCell::is_block)
    }

    /// Display name of a cell.
    pub fn name_of(&self, id: CellId) -> String {
        self.cell(id).display_name()
    }

    /// The other connector sharing this connector's id.
    ///
    /// Returns `None` for unset ids and when the id is not used by exactly
    /// one other connector.
    pub fn connector_partner(&self, id: CellId) -> Option<CellId> {
        let own = match &self.cell(id).kind {
            CellKind::Connector(c) if c.is_set() => c.id,
            _ => return None,
        };
        let mut partners = self.cells_of(move |c| {
            matches!(&c.kind, CellKind::Connector(o) if o.id == own)
        })
        .map(|(pid, _)| pid)
        .filter(|pid| *pid != id);

        let partner = partners.next();
        if partners.next().is_some() {
            warn!("connector id {} is used more than twice, ignoring it", own);
            return None;
        }
        partner
    }

    /// Feedback address of the sensor cell named `name`.
    pub fn sensor_address(&self, name: &str) -> Option<u16> {
        match &self.cell(self.by_name(name)?).kind {
            CellKind::Sensor(s) => Some(s.address),
            _ => None,
        }
    }

    /// Runs `f` with the cell's runtime state locked.
    ///
    /// Never call into the dispatcher from inside `f`.
    pub fn with_state<R, F>(&self, id: CellId, f: F) -> R
    where
        F: FnOnce(&mut CellState) -> R,
    {
        let mut guard = self.states[id.0]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Snapshot of the cell's runtime state.
    pub fn state(&self, id: CellId) -> CellState {
        self.with_state(id, |s| s.clone())
    }

    /// Ids of the blocks locked together with `block` (same group id),
    /// including `block` itself.
    pub fn group_of(&self, block: CellId) -> Vec<CellId> {
        match self.cell(block).as_block().and_then(|b| b.group) {
            Some(group) => self
                .cells_of(move |c| c.as_block().is_some_and(|b| b.group == Some(group)))
                .map(|(id, _)| id)
                .collect(),
            None => vec![block],
        }
    }

    /// Changes a connector's pairing id. Edit-time only; routes and the
    /// adjacency cache must be rebuilt afterwards.
    pub fn set_connector_id(&mut self, id: CellId, connector: u32) -> Result<(), LayoutError> {
        let cell = &mut self.cells[id.0];
        match &mut cell.kind {
            CellKind::Connector(c) => {
                c.id = connector;
                Ok(())
            }
            _ => Err(LayoutError::WrongKind {
                coord: cell.coord,
                expected: "connector",
            }),
        }
    }

    /// Replaces the event mappings of every block named in `bindings`.
    ///
    /// Blocks not mentioned keep their mappings. Unknown block names are
    /// logged and skipped. Returns the number of bindings applied.
    pub fn apply_feedback_bindings(&mut self, bindings: &[FeedbackBinding]) -> usize {
        let mut replaced: Vec<CellId> = Vec::new();
        let mut applied = 0;
        for binding in bindings {
            let Some(id) = self.by_name(&binding.block) else {
                warn!("feedback binding for unknown block '{}'", binding.block);
                continue;
            };
            let CellKind::Block(block) = &mut self.cells[id.0].kind else {
                warn!("feedback binding target '{}' is not a block", binding.block);
                continue;
            };
            if !replaced.contains(&id) {
                block.events.clear();
                replaced.push(id);
            }
            block.events.push(binding.event.clone());
            applied += 1;
        }
        applied
    }

    /// Every block event as a persistable binding list.
    pub fn feedback_bindings(&self) -> Vec<FeedbackBinding> {
        self.blocks()
            .flat_map(|(_, cell)| {
                let block = cell.display_name();
                cell.as_block()
                    .map(|b| b.events.clone())
                    .unwrap_or_default()
                    .into_iter()
                    .map(move |event| FeedbackBinding {
                        block: block.clone(),
                        event,
                    })
            })
            .collect()
    }
}

fn initial_state(cell: &TrackCell) -> CellState {
    match &cell.kind {
        CellKind::Block(b) => CellState {
            disabled: b.disabled,
            ..Default::default()
        },
        CellKind::Switch(s) => CellState {
            maintenance: s.maintenance,
            ..Default::default()
        },
        _ => CellState::default(),
    }
}
