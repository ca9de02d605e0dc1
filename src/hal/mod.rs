//! Concrete implementations of the traits defined in [`crate::traits`].
//!
//! # Available Implementations
//!
//! - `mock`: test doubles for desktop development and simulation
//! - `clock`: [`TokioClock`], the runtime time source
//! - `broadcast`: [`BroadcastNotifier`] for UI fan-out

pub mod broadcast;
pub mod clock;
pub mod mock;

pub use broadcast::*;
pub use clock::*;
pub use mock::*;
