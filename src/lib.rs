//! # rs-autoplay
//!
//! Route discovery and autonomous dispatching for model railway layouts
//! drawn on a grid of track cells.
//!
//! ## Features
//!
//! - **Track grid**: blocks, tracks, switches, sensors, signals and
//!   teleporting connectors, each with connection rules that rotate with
//!   the cell
//! - **Route discovery**: every directed block-to-block path, with the
//!   switch states it needs and the routes it crosses
//! - **Auto mode**: a periodic dispatcher that sends locomotives from block
//!   to block, reserving routes and target blocks so trains never meet
//! - **Trips**: one task per running train that ramps the speed and stops on
//!   the target block's sensors, cancellable at any point
//!
//! ## Architecture
//!
//! - `grid` - Cells, rules and the adjacency cache
//! - `routes` - Route discovery, the route catalog and crossing analysis
//! - `dispatch` - Selection pipeline, occupancy records, trips and the dispatcher
//! - `traits` - Command station, clock, store and notifier abstractions
//! - `hal` - Mock implementations for tests plus tokio-based helpers
//! - `config` - Dispatcher and trip tuning
//!
//! ## Example
//!
//! ```rust
//! use rs_autoplay::{
//!     grid::{rules::Adjacency, Grid, TrackCell},
//!     RouteCatalog,
//! };
//!
//! let grid = Grid::new(vec![
//!     TrackCell::block(0, 0, "West"),
//!     TrackCell::switch(1, 0, "AC,AB", 1),
//!     TrackCell::block(2, 0, "East"),
//!     TrackCell::block(1, -1, "North").rotated(rs_autoplay::grid::Rotation::R90),
//! ])
//! .unwrap();
//!
//! let catalog = RouteCatalog::discover(&grid, &Adjacency::build(&grid));
//! assert!(catalog.by_name("West->East").is_some());
//! assert!(catalog.by_name("West->North").is_some());
//! ```

#![warn(missing_docs)]

/// Dispatcher and trip configuration.
pub mod config;
/// Autonomous dispatcher, selection pipeline and trips.
pub mod dispatch;
/// Error types.
pub mod error;
/// Track cells, connection rules and the grid arena.
pub mod grid;
/// Mock and tokio-backed implementations of the traits.
pub mod hal;
/// Route discovery, catalog and crossing analysis.
pub mod routes;
/// Abstractions over the command station, clock, store and notifier.
pub mod traits;

// Re-exports for convenience
pub use config::{AutoModeConfig, TripConfig};
pub use dispatch::{Dispatcher, DispatcherBuilder, RunState, Snapshot, TickReport, TripPhase};
pub use error::{DispatchError, LayoutError, PersistError};
pub use grid::{BlockSide, CellId, Coord, Grid, LocoId, Side, SwitchState, TrackCell};
pub use routes::{Route, RouteCatalog, RouteId};
pub use traits::{Clock, CommandStation, MetadataStore, ModelEvent, Notifier, Section};
