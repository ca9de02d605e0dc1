//! Trait definitions for the collaborators the engine talks to.
//!
//! This module defines the narrow seams that keep the core independent of
//! any particular controller, storage backend or user interface:
//! - Issue commands to and read sensors from the layout
//! - Keep time for dwell bookkeeping
//! - Persist state by section
//! - Tell clients that the model changed
//!
//! # Submodules
//!
//! - `hardware`: command station and clock
//! - `store`: section-keyed metadata store
//! - `notify`: model change events
//!
//! Mock implementations of every trait live in [`crate::hal::mock`].

pub mod hardware;
pub mod notify;
pub mod store;

pub use hardware::*;
pub use notify::*;
pub use store::*;
