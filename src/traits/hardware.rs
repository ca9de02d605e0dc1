//! Hardware abstraction traits for the command station and time source.
//!
//! The dispatcher never speaks a wire protocol itself. It issues switch,
//! speed and direction commands through a [`CommandStation`] and reads
//! feedback sensors through the same handle. Commands may be buffered by
//! the implementation until [`CommandStation::commit_pending`] is called.
//!
//! # Key Traits
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`CommandStation`] | Switch/locomotive commands and feedback reads |
//! | [`Clock`] | Monotonic millisecond time for dwell bookkeeping |
//!
//! # Implementation
//!
//! For testing and simulation, use the mock implementations from
//! [`crate::hal::mock`].
//!
//! # Example
//!
//! ```rust
//! use rs_autoplay::traits::CommandStation;
//! use rs_autoplay::hal::MockCommandStation;
//! use rs_autoplay::grid::{LocoId, SwitchState};
//!
//! let station = MockCommandStation::new();
//! station.set_switch(3, SwitchState::Turn).unwrap();
//! station.set_locomotive_speed(LocoId(1), 40).unwrap();
//! station.commit_pending().unwrap();
//!
//! assert_eq!(station.switch_state(3), Some(SwitchState::Turn));
//! assert_eq!(station.speed_of(LocoId(1)), 40);
//! ```

use crate::grid::{LocoId, SwitchState};

/// Highest speed step accepted by [`CommandStation::set_locomotive_speed`].
pub const MAX_SPEED_STEP: u8 = 126;

/// Command station abstraction: the boundary to the physical layout.
///
/// All methods take `&self` because one station is shared by the dispatcher
/// loop and every running trip; implementations synchronise internally.
///
/// # Implementation Notes
///
/// - Speed steps range from 0 to [`MAX_SPEED_STEP`]
/// - `set_switch` receives the logical state; inverted decoders are handled
///   by the caller
/// - `is_feedback_active` errors are treated as "not yet" by the trip task
///
/// # Example Implementation
///
/// ```rust,ignore
/// use rs_autoplay::traits::CommandStation;
/// use rs_autoplay::grid::{LocoId, SwitchState};
///
/// struct Z21 { /* socket */ }
///
/// impl CommandStation for Z21 {
///     type Error = std::io::Error;
///
///     fn set_switch(&self, address: u16, state: SwitchState) -> Result<(), Self::Error> {
///         // Queue a turnout telegram...
///         Ok(())
///     }
///     // ...
/// }
/// ```
pub trait CommandStation: Send + Sync {
    /// Error type for station operations.
    type Error: std::fmt::Debug;

    /// Set a turnout decoder to `state`.
    fn set_switch(&self, address: u16, state: SwitchState) -> Result<(), Self::Error>;

    /// Set a locomotive's speed step (0 stops it).
    fn set_locomotive_speed(&self, loco: LocoId, speed: u8) -> Result<(), Self::Error>;

    /// Set a locomotive's travel direction.
    fn set_locomotive_direction(&self, loco: LocoId, backward: bool) -> Result<(), Self::Error>;

    /// Flush commands buffered since the last commit.
    fn commit_pending(&self) -> Result<(), Self::Error>;

    /// Whether the feedback sensor at `address` currently reports a train.
    fn is_feedback_active(&self, address: u16) -> Result<bool, Self::Error>;
}

impl<T: CommandStation + ?Sized> CommandStation for std::sync::Arc<T> {
    type Error = T::Error;

    fn set_switch(&self, address: u16, state: SwitchState) -> Result<(), Self::Error> {
        (**self).set_switch(address, state)
    }

    fn set_locomotive_speed(&self, loco: LocoId, speed: u8) -> Result<(), Self::Error> {
        (**self).set_locomotive_speed(loco, speed)
    }

    fn set_locomotive_direction(&self, loco: LocoId, backward: bool) -> Result<(), Self::Error> {
        (**self).set_locomotive_direction(loco, backward)
    }

    fn commit_pending(&self) -> Result<(), Self::Error> {
        (**self).commit_pending()
    }

    fn is_feedback_active(&self, address: u16) -> Result<bool, Self::Error> {
        (**self).is_feedback_active(address)
    }
}

/// Time source.
///
/// Provides monotonic time in milliseconds for dwell timing. Use
/// [`TokioClock`](crate::hal::TokioClock) at runtime; it follows tokio's
/// paused time in tests.
///
/// # Example
///
/// ```rust
/// use rs_autoplay::traits::Clock;
/// use rs_autoplay::hal::MockClock;
///
/// let clock = MockClock::new();
/// assert_eq!(clock.now_ms(), 0);
///
/// clock.advance(100);
/// assert_eq!(clock.now_ms(), 100);
/// ```
pub trait Clock: Send + Sync {
    /// Returns current time in milliseconds since an arbitrary epoch.
    ///
    /// Must be monotonically increasing.
    fn now_ms(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MockCommandStation;
    use std::sync::Arc;

    #[test]
    fn arc_station_forwards() {
        let station = Arc::new(MockCommandStation::new());
        let shared: Arc<MockCommandStation> = Arc::clone(&station);
        CommandStation::set_switch(&shared, 7, SwitchState::Straight).unwrap();
        CommandStation::set_locomotive_direction(&shared, LocoId(2), true).unwrap();
        assert_eq!(station.switch_state(7), Some(SwitchState::Straight));
        assert_eq!(station.direction_of(LocoId(2)), Some(true));
    }
}
