//! Mock implementations for testing without a layout.
//!
//! This module provides test doubles for every collaborator trait, enabling
//! the dispatcher to run on a desktop with no command station attached.
//!
//! # Available Mocks
//!
//! | Mock | Trait | Purpose |
//! |------|-------|---------|
//! | [`MockCommandStation`] | [`CommandStation`] | Records commands, simulates sensors |
//! | [`MemoryStore`] | [`MetadataStore`] | In-memory sections, injectable failure |
//! | [`RecordingNotifier`] | [`Notifier`] | Captures events |
//! | [`MockClock`] | [`Clock`] | Controllable time source |
//!
//! # Example
//!
//! ```rust
//! use rs_autoplay::hal::MockCommandStation;
//! use rs_autoplay::traits::CommandStation;
//! use rs_autoplay::grid::LocoId;
//!
//! let station = MockCommandStation::new();
//! station.set_feedback(12, true);
//! assert_eq!(station.is_feedback_active(12), Ok(true));
//!
//! // Auto feedback: any sensor fires while a locomotive moves.
//! let station = MockCommandStation::new().with_auto_feedback();
//! assert_eq!(station.is_feedback_active(3), Ok(false));
//! station.set_locomotive_speed(LocoId(1), 20).unwrap();
//! assert_eq!(station.is_feedback_active(3), Ok(true));
//! ```
//!
//! [`CommandStation`]: crate::traits::CommandStation
//! [`MetadataStore`]: crate::traits::MetadataStore
//! [`Notifier`]: crate::traits::Notifier
//! [`Clock`]: crate::traits::Clock

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::grid::{LocoId, SwitchState};
use crate::traits::{Clock, CommandStation, MetadataStore, ModelEvent, Notifier, Section};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Command Station
// ============================================================================

/// A command received by [`MockCommandStation`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StationCommand {
    /// `set_switch`
    Switch {
        /// Decoder address.
        address: u16,
        /// Requested state.
        state: SwitchState,
    },
    /// `set_locomotive_speed`
    Speed {
        /// Locomotive.
        loco: LocoId,
        /// Speed step.
        speed: u8,
    },
    /// `set_locomotive_direction`
    Direction {
        /// Locomotive.
        loco: LocoId,
        /// Travel backwards.
        backward: bool,
    },
    /// `commit_pending`
    Commit,
}

#[derive(Debug, Default)]
struct StationState {
    switches: HashMap<u16, SwitchState>,
    speeds: HashMap<LocoId, u8>,
    directions: HashMap<LocoId, bool>,
    feedback: HashSet<u16>,
    failing: HashSet<u16>,
    log: Vec<StationCommand>,
}

/// Mock command station.
///
/// Every command is appended to a log and applied to an in-memory image of
/// the layout. Sensors are driven with [`set_feedback`](Self::set_feedback),
/// or automatically with [`with_auto_feedback`](Self::with_auto_feedback).
/// Reads of addresses passed to [`fail_feedback`](Self::fail_feedback)
/// return `Err(())`.
#[derive(Debug, Default)]
pub struct MockCommandStation {
    state: Mutex<StationState>,
    auto_feedback: AtomicBool,
}

impl MockCommandStation {
    /// Creates a station with all sensors inactive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report every sensor active while any locomotive has a non-zero speed.
    pub fn with_auto_feedback(self) -> Self {
        self.auto_feedback.store(true, Ordering::SeqCst);
        self
    }

    /// Set a sensor's state.
    pub fn set_feedback(&self, address: u16, active: bool) {
        let mut s = lock(&self.state);
        if active {
            s.feedback.insert(address);
        } else {
            s.feedback.remove(&address);
        }
    }

    /// Make reads of `address` fail until [`heal_feedback`](Self::heal_feedback).
    pub fn fail_feedback(&self, address: u16) {
        lock(&self.state).failing.insert(address);
    }

    /// Undo [`fail_feedback`](Self::fail_feedback).
    pub fn heal_feedback(&self, address: u16) {
        lock(&self.state).failing.remove(&address);
    }

    /// Last state sent to a switch decoder.
    pub fn switch_state(&self, address: u16) -> Option<SwitchState> {
        lock(&self.state).switches.get(&address).copied()
    }

    /// Last speed sent to a locomotive (0 if none).
    pub fn speed_of(&self, loco: LocoId) -> u8 {
        lock(&self.state).speeds.get(&loco).copied().unwrap_or(0)
    }

    /// Last direction sent to a locomotive.
    pub fn direction_of(&self, loco: LocoId) -> Option<bool> {
        lock(&self.state).directions.get(&loco).copied()
    }

    /// All commands received so far.
    pub fn commands(&self) -> Vec<StationCommand> {
        lock(&self.state).log.clone()
    }

    /// Forget the command log.
    pub fn clear_commands(&self) {
        lock(&self.state).log.clear();
    }

    fn record(&self, command: StationCommand) {
        let mut s = lock(&self.state);
        match command {
            StationCommand::Switch { address, state } => {
                s.switches.insert(address, state);
            }
            StationCommand::Speed { loco, speed } => {
                s.speeds.insert(loco, speed);
            }
            StationCommand::Direction { loco, backward } => {
                s.directions.insert(loco, backward);
            }
            StationCommand::Commit => {}
        }
        s.log.push(command);
    }
}

impl CommandStation for MockCommandStation {
    type Error = ();

    fn set_switch(&self, address: u16, state: SwitchState) -> Result<(), ()> {
        self.record(StationCommand::Switch { address, state });
        Ok(())
    }

    fn set_locomotive_speed(&self, loco: LocoId, speed: u8) -> Result<(), ()> {
        self.record(StationCommand::Speed { loco, speed });
        Ok(())
    }

    fn set_locomotive_direction(&self, loco: LocoId, backward: bool) -> Result<(), ()> {
        self.record(StationCommand::Direction { loco, backward });
        Ok(())
    }

    fn commit_pending(&self) -> Result<(), ()> {
        self.record(StationCommand::Commit);
        Ok(())
    }

    fn is_feedback_active(&self, address: u16) -> Result<bool, ()> {
        let s = lock(&self.state);
        if s.failing.contains(&address) {
            return Err(());
        }
        if self.auto_feedback.load(Ordering::SeqCst) && s.speeds.values().any(|&v| v > 0) {
            return Ok(true);
        }
        Ok(s.feedback.contains(&address))
    }
}

// ============================================================================
// Store
// ============================================================================

/// In-memory [`MetadataStore`].
///
/// ```rust
/// use rs_autoplay::hal::MemoryStore;
/// use rs_autoplay::traits::{MetadataStore, Section};
///
/// let store = MemoryStore::new();
/// store.save(Section::Occ, serde_json::json!([1, 2])).unwrap();
/// assert_eq!(store.load(Section::Occ).unwrap(), Some(serde_json::json!([1, 2])));
///
/// store.set_failing(true);
/// assert!(store.save(Section::Occ, serde_json::json!([])).is_err());
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    sections: Mutex<HashMap<Section, serde_json::Value>>,
    failing: AtomicBool,
    saves: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every save and load fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Raw value of a section, if saved.
    pub fn get(&self, section: Section) -> Option<serde_json::Value> {
        lock(&self.sections).get(&section).cloned()
    }

    fn check(&self, section: Section) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("memory store is failing ({})", section.as_str());
        }
        Ok(())
    }
}

impl MetadataStore for MemoryStore {
    fn save(&self, section: Section, value: serde_json::Value) -> anyhow::Result<()> {
        self.check(section)?;
        lock(&self.sections).insert(section, value);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self, section: Section) -> anyhow::Result<Option<serde_json::Value>> {
        self.check(section)?;
        Ok(lock(&self.sections).get(&section).cloned())
    }
}

// ============================================================================
// Notifier
// ============================================================================

/// [`Notifier`] that keeps every event.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<ModelEvent>>,
}

impl RecordingNotifier {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far.
    pub fn events(&self) -> Vec<ModelEvent> {
        lock(&self.events).clone()
    }

    /// Whether an equal event was received.
    pub fn contains(&self, event: &ModelEvent) -> bool {
        lock(&self.events).contains(event)
    }

    /// Drop all recorded events.
    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: ModelEvent) {
        lock(&self.events).push(event);
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Mock clock for testing.
///
/// Time only moves when [`advance`](Self::advance) or [`set`](Self::set) is
/// called.
#[derive(Debug, Default)]
pub struct MockClock {
    now: AtomicU64,
}

impl MockClock {
    /// Creates a clock at time 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward.
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
