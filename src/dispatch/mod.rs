//! Autonomous dispatcher.
//!
//! [`Dispatcher`] scans every locomotive on the layout once per poll
//! interval, picks a route with [`select_next_route`], reserves it and
//! spawns a trip task that drives the locomotive there.
//!
//! # Locking
//!
//! A single mutex guards [`AutoState`]: occupancy records, route flags and
//! running trips. It is held while selecting and committing an assignment,
//! and never across an `.await` or a command station call. Per-cell state in
//! the [`Grid`] has its own locks, which may be taken while the dispatcher
//! lock is held but never the other way round.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use rs_autoplay::dispatch::{Dispatcher, LocomotiveRuntime};
//! use rs_autoplay::grid::{rules::Adjacency, BlockEvent, BlockOptions, FeedbackEvent, Grid, LocoId, TrackCell};
//! use rs_autoplay::hal::MockCommandStation;
//! use rs_autoplay::routes::RouteCatalog;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let yard = BlockOptions {
//!     events: vec![BlockEvent::new("yard", FeedbackEvent::In)],
//!     ..Default::default()
//! };
//! let grid = Grid::new(vec![
//!     TrackCell::block(0, 0, "Station"),
//!     TrackCell::track(1, 0, "AC"),
//!     TrackCell::block_with(2, 0, "Yard", "AC", yard),
//!     TrackCell::sensor(0, 3, "yard", 7),
//! ])
//! .unwrap();
//! let catalog = RouteCatalog::discover(&grid, &Adjacency::build(&grid));
//!
//! let dispatcher = Dispatcher::builder(Arc::new(grid), Arc::new(catalog), MockCommandStation::new()).build();
//! dispatcher.add_locomotive(LocomotiveRuntime::new(LocoId(3), "V100")).unwrap();
//! dispatcher.place_locomotive(LocoId(3), "Station").unwrap();
//!
//! let report = dispatcher.tick();
//! assert_eq!(report.assigned.len(), 1);
//! # }
//! ```

pub mod cancel;
pub mod occ;
pub mod persist;
pub mod ramp;
pub mod select;
pub mod trip;

pub use cancel::CancelToken;
pub use occ::{AutoState, LocoPolicy, LocomotiveRuntime, OccBlock, RouteFlags, TripStatus};
pub use persist::{load_catalog, load_feedbacks, load_section, save_section};
pub use ramp::SpeedRamp;
pub use select::{attempt_direction_reversal, select_next_route, Reversal, SelectContext, Selection, SkipReason};
pub use trip::TripPhase;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::AutoModeConfig;
use crate::error::{DispatchError, LayoutError, PersistError};
use crate::grid::{CellId, Coord, Grid, LocoId};
use crate::hal::{MemoryStore, TokioClock};
use crate::routes::{RouteCatalog, RouteId, SavedRoute};
use crate::traits::{Clock, CommandStation, MetadataStore, ModelEvent, Notifier, NullNotifier, Section};

use persist::{section_value, write_section};
use trip::TripPlan;

// ============================================================================
// Run state
// ============================================================================

/// Lifecycle of the dispatcher loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// No loop running; [`Dispatcher::tick`] may still be driven by hand.
    #[default]
    Stopped,
    /// Loop being spawned.
    Starting,
    /// Loop running.
    Running,
    /// Waiting for trips to finish.
    Stopping,
}

#[derive(Default)]
struct RunControl {
    state: RunState,
    cancel: Option<CancelToken>,
    handle: Option<JoinHandle<()>>,
}

// ============================================================================
// Reports
// ============================================================================

/// A route assigned during a tick.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Assignment {
    /// The locomotive.
    pub loco: LocoId,
    /// Route name.
    pub route: String,
    /// The locomotive reversed to take it.
    pub reversed: bool,
}

/// Outcome of one scan over all locomotives.
#[derive(Clone, Debug, Default)]
pub struct TickReport {
    /// Routes assigned, in scan order.
    pub assigned: Vec<Assignment>,
    /// Locomotives left alone and why.
    pub skipped: Vec<(LocoId, SkipReason)>,
    /// Sections that failed to persist during the tick.
    pub persist_failures: usize,
}

/// Outcome of [`Dispatcher::stop`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Trips were still running when the stop timeout elapsed.
    pub timed_out: bool,
    /// Trips cancelled because of the timeout.
    pub cancelled_trips: usize,
}

/// Live flags of a route, by name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RouteStatus {
    /// Route name.
    pub name: String,
    /// A locomotive is travelling it.
    pub occupied: bool,
    /// Administratively excluded.
    pub disabled: bool,
}

/// A running trip.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TripInfo {
    /// The locomotive.
    pub loco: LocoId,
    /// Route name.
    pub route: String,
    /// Current phase.
    pub phase: TripPhase,
}

/// Point-in-time copy of the dispatcher state, suitable for a UI.
#[derive(Clone, Debug, Serialize)]
pub struct Snapshot {
    /// Loop state.
    pub run_state: RunState,
    /// Occupancy records in scan order.
    pub occ: Vec<OccBlock>,
    /// Every known locomotive.
    pub locomotives: Vec<LocomotiveRuntime>,
    /// Every route in catalog order.
    pub routes: Vec<RouteStatus>,
    /// Running trips.
    pub trips: Vec<TripInfo>,
    /// Persistence failures since creation.
    pub persist_failures: u64,
}

// ============================================================================
// Shared state
// ============================================================================

/// State shared by the dispatcher handle, its loop and every trip task.
pub(crate) struct Shared<H: CommandStation> {
    pub(crate) grid: Arc<Grid>,
    pub(crate) catalog: Arc<RouteCatalog>,
    pub(crate) station: H,
    pub(crate) store: Arc<dyn MetadataStore>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: AutoModeConfig,
    state: Mutex<AutoState>,
    control: Mutex<RunControl>,
    persist_failures: AtomicU64,
    persist_seq: AtomicU64,
    written: Mutex<HashMap<Section, u64>>,
}

/// Section payloads serialized under the dispatcher lock.
#[must_use]
pub(crate) struct Staged {
    seq: u64,
    values: Vec<(Section, Result<serde_json::Value, PersistError>)>,
}

impl<H: CommandStation> Shared<H> {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, AutoState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_control(&self) -> MutexGuard<'_, RunControl> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_state(&self) -> RunState {
        self.lock_control().state
    }

    pub(crate) fn notify(&self, event: ModelEvent) {
        self.notifier.notify(event);
    }

    /// Sends one command, logging failures.
    pub(crate) fn command<F>(&self, what: &str, f: F)
    where
        F: FnOnce(&H) -> Result<(), H::Error>,
    {
        if let Err(e) = f(&self.station) {
            error!("command station rejected {}: {:?}", what, e);
        }
    }

    fn saved_routes(&self, st: &AutoState) -> Vec<SavedRoute> {
        let mut saved = self.catalog.to_saved();
        for (entry, id) in saved.iter_mut().zip(self.catalog.ids()) {
            entry.disabled = st.flags(id).disabled;
        }
        saved
    }

    /// Serializes `sections` from `st`. Called with the dispatcher lock
    /// held; the result is written with [`write`](Self::write) after the
    /// lock is released.
    pub(crate) fn stage(&self, st: &AutoState, sections: &[Section]) -> Staged {
        let values = sections
            .iter()
            .map(|&section| {
                let value = match section {
                    Section::Occ => section_value(section, &st.occ.values().collect::<Vec<_>>()),
                    Section::Locomotives => section_value(section, &st.locos.values().collect::<Vec<_>>()),
                    Section::Routes => section_value(section, &self.saved_routes(st)),
                    Section::Feedbacks => section_value(section, &self.grid.feedback_bindings()),
                };
                (section, value)
            })
            .collect();
        Staged {
            seq: self.persist_seq.fetch_add(1, Ordering::Relaxed) + 1,
            values,
        }
    }

    /// Writes staged sections to the store. A section already written from
    /// a newer stage is skipped. Failures are logged and counted; the
    /// in-memory state stays authoritative. Returns the failed sections.
    pub(crate) fn write(&self, staged: Staged) -> Vec<PersistError> {
        let store = &*self.store;
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        let mut failures = Vec::new();
        for (section, value) in staged.values {
            let last = written.entry(section).or_insert(0);
            if *last > staged.seq {
                continue;
            }
            *last = staged.seq;
            if let Err(e) = value.and_then(|json| write_section(store, section, json)) {
                error!("{}", e);
                self.persist_failures.fetch_add(1, Ordering::Relaxed);
                failures.push(e);
            }
        }
        failures
    }

    fn block_id(&self, name: &str) -> Result<CellId, DispatchError> {
        self.grid
            .by_name(name)
            .filter(|id| self.grid.cell(*id).is_block())
            .ok_or_else(|| DispatchError::UnknownBlock(name.to_string()))
    }

    /// Reserves `route` for `loco`. Called with the dispatcher lock held.
    fn commit(&self, st: &mut AutoState, loco: LocoId, route_id: RouteId) -> (TripPlan, CancelToken) {
        let route = self.catalog.get(route_id);
        let target_coord = self.grid.cell(route.target).coord;

        if let Some(flags) = st.flags_mut(route_id) {
            flags.occupied = true;
        }
        if let Some(occ) = st.occ.get_mut(&loco) {
            occ.final_block = Some(target_coord);
            occ.route = Some(route.name.clone());
        }
        for block in self.grid.group_of(route.target) {
            self.grid.with_state(block, |s| {
                if s.locked_by.is_none() {
                    s.locked_by = Some(route.start);
                }
            });
        }

        let serial = st.next_serial();
        let cancel = CancelToken::new();
        st.trips.insert(
            loco,
            TripStatus {
                route: route_id,
                phase: TripPhase::Created,
                cancel: cancel.clone(),
                serial,
            },
        );
        st.last_outcome.remove(&loco);

        let max_speed = st.locos.get(&loco).and_then(|r| r.policy.max_speed);
        let plan = TripPlan {
            loco,
            route: route_id,
            serial,
            from: route.start,
            target: route.target,
            sensors: trip::resolve_sensors(&self.grid, route.target, route.target_side),
            cruise: self.config.trip.cruise_for(max_speed),
        };
        (plan, cancel)
    }
}

// ============================================================================
// Tick
// ============================================================================

enum Attempt {
    Assigned {
        plan: TripPlan,
        cancel: CancelToken,
        reversal: Option<Reversal>,
    },
    Skipped(SkipReason),
}

fn attempt<H: CommandStation>(shared: &Shared<H>, loco: LocoId) -> (Attempt, usize) {
    let ctx = SelectContext {
        grid: &shared.grid,
        catalog: &shared.catalog,
        now_ms: shared.clock.now_ms(),
    };
    let mut st = shared.lock_state();
    let selection = select_next_route(&mut st, &ctx, loco);
    match selection.outcome {
        Ok(route) => {
            let (plan, cancel) = shared.commit(&mut st, loco, route);
            let sections: &[Section] = if selection.reversal.is_some() {
                &[Section::Occ, Section::Locomotives]
            } else {
                &[Section::Occ]
            };
            let staged = shared.stage(&st, sections);
            drop(st);
            let failures = shared.write(staged).len();
            let attempt = Attempt::Assigned {
                plan,
                cancel,
                reversal: selection.reversal,
            };
            (attempt, failures)
        }
        Err(reason) => (Attempt::Skipped(reason), 0),
    }
}

/// Sends the commands of a fresh assignment and spawns its trip.
fn launch<H: CommandStation + 'static>(
    shared: &Arc<Shared<H>>,
    plan: TripPlan,
    cancel: CancelToken,
    reversal: Option<Reversal>,
) -> Assignment {
    let route = shared.catalog.get(plan.route);
    if let Some(flip) = reversal {
        shared.command("direction", |s| s.set_locomotive_direction(plan.loco, flip.backward));
        shared.notify(ModelEvent::Debug(format!(
            "{} reverses in {}",
            plan.loco,
            shared.grid.name_of(plan.from)
        )));
    }
    for (cell, state) in route.switches() {
        let Some(options) = shared.grid.cell(cell).as_switch() else {
            continue;
        };
        let state = if options.inverted { state.toggled() } else { state };
        shared.command("switch", |s| s.set_switch(options.address, state));
    }
    shared.command("commit", |s| s.commit_pending());

    info!("{} assigned to {}", plan.loco, route.name);
    shared.notify(ModelEvent::RouteShown(route.name.clone()));
    shared.notify(ModelEvent::OccChanged);
    shared.notify(ModelEvent::RoutesChanged);

    let assignment = Assignment {
        loco: plan.loco,
        route: route.name.clone(),
        reversed: reversal.is_some(),
    };
    tokio::spawn(trip::run_trip(Arc::clone(shared), plan, cancel));
    assignment
}

fn tick_shared<H: CommandStation + 'static>(shared: &Arc<Shared<H>>) -> TickReport {
    let mut report = TickReport::default();
    if shared.run_state() == RunState::Stopping {
        debug!("tick ignored while stopping");
        return report;
    }
    let locos: Vec<LocoId> = shared.lock_state().occ.keys().copied().collect();
    for loco in locos {
        let (outcome, failures) = attempt(shared, loco);
        report.persist_failures += failures;
        match outcome {
            Attempt::Assigned {
                plan,
                cancel,
                reversal,
            } => report.assigned.push(launch(shared, plan, cancel, reversal)),
            Attempt::Skipped(reason) => report.skipped.push((loco, reason)),
        }
    }
    report
}

async fn run_loop<H: CommandStation + 'static>(shared: Arc<Shared<H>>, cancel: CancelToken) {
    let interval = shared.config.poll_interval();
    loop {
        let report = tick_shared(&shared);
        if !report.assigned.is_empty() {
            debug!("tick assigned {} route(s)", report.assigned.len());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("dispatcher loop ended");
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Builder for [`Dispatcher`].
///
/// Defaults: an in-memory store, no notifications, a tokio clock and
/// [`AutoModeConfig::default`].
pub struct DispatcherBuilder<H: CommandStation> {
    grid: Arc<Grid>,
    catalog: Arc<RouteCatalog>,
    station: H,
    store: Option<Arc<dyn MetadataStore>>,
    notifier: Option<Arc<dyn Notifier>>,
    clock: Option<Arc<dyn Clock>>,
    config: AutoModeConfig,
}

impl<H: CommandStation + 'static> DispatcherBuilder<H> {
    /// Start a builder for `catalog` on `grid`.
    pub fn new(grid: Arc<Grid>, catalog: Arc<RouteCatalog>, station: H) -> Self {
        Self {
            grid,
            catalog,
            station,
            store: None,
            notifier: None,
            clock: None,
            config: AutoModeConfig::default(),
        }
    }

    /// Persist through `store`.
    pub fn with_store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Publish model events through `notifier`.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Read time from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use `config`.
    pub fn with_config(mut self, config: AutoModeConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the dispatcher. It starts in [`RunState::Stopped`].
    pub fn build(self) -> Dispatcher<H> {
        let mut state = AutoState::new(self.catalog.len(), self.config.rng_seed);
        for route in self.catalog.iter() {
            if trip::resolve_sensors(&self.grid, route.target, route.target_side).is_some() {
                continue;
            }
            warn!(
                "route {} is never selected: {} has no usable sensor",
                route.name,
                self.grid.name_of(route.target)
            );
            if let Some(flags) = state.flags_mut(route.id) {
                flags.no_sensors = true;
            }
        }
        let store: Arc<dyn MetadataStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };
        let notifier: Arc<dyn Notifier> = match self.notifier {
            Some(notifier) => notifier,
            None => Arc::new(NullNotifier),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(TokioClock::new()),
        };
        let shared = Shared {
            grid: self.grid,
            catalog: self.catalog,
            station: self.station,
            store,
            notifier,
            clock,
            config: self.config,
            state: Mutex::new(state),
            control: Mutex::new(RunControl::default()),
            persist_failures: AtomicU64::new(0),
            persist_seq: AtomicU64::new(0),
            written: Mutex::new(HashMap::new()),
        };
        Dispatcher {
            shared: Arc::new(shared),
        }
    }
}

/// Handle to the dispatcher. Clones share the same state.
pub struct Dispatcher<H: CommandStation + 'static> {
    shared: Arc<Shared<H>>,
}

impl<H: CommandStation + 'static> Clone for Dispatcher<H> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<H: CommandStation + 'static> Dispatcher<H> {
    /// Start a [`DispatcherBuilder`].
    pub fn builder(grid: Arc<Grid>, catalog: Arc<RouteCatalog>, station: H) -> DispatcherBuilder<H> {
        DispatcherBuilder::new(grid, catalog, station)
    }

    /// The layout.
    pub fn grid(&self) -> &Grid {
        &self.shared.grid
    }

    /// The route catalog.
    pub fn catalog(&self) -> &RouteCatalog {
        &self.shared.catalog
    }

    /// The command station.
    pub fn station(&self) -> &H {
        &self.shared.station
    }

    /// Current loop state.
    pub fn run_state(&self) -> RunState {
        self.shared.run_state()
    }

    /// Starts the periodic loop.
    ///
    /// # Panics
    ///
    /// Outside a tokio runtime.
    pub fn start(&self) -> Result<(), DispatchError> {
        let mut control = self.shared.lock_control();
        if control.state != RunState::Stopped {
            return Err(DispatchError::AlreadyRunning);
        }
        control.state = RunState::Starting;
        info!(
            "auto mode starting, polling every {} ms",
            self.shared.config.poll_interval_ms
        );
        let cancel = CancelToken::new();
        control.handle = Some(tokio::spawn(run_loop(Arc::clone(&self.shared), cancel.clone())));
        control.cancel = Some(cancel);
        control.state = RunState::Running;
        drop(control);
        self.shared.notify(ModelEvent::Info("auto mode started".into()));
        Ok(())
    }

    /// Stops the loop and waits for running trips to arrive.
    ///
    /// Trips still running after the stop timeout are cancelled and every
    /// assignment and block lock is reset.
    pub async fn stop(&self) -> Result<StopReport, DispatchError> {
        let shared = &self.shared;
        let (cancel, handle) = {
            let mut control = shared.lock_control();
            if control.state != RunState::Running {
                return Err(DispatchError::NotRunning);
            }
            control.state = RunState::Stopping;
            (control.cancel.take(), control.handle.take())
        };
        info!("auto mode stopping");
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("dispatcher loop failed: {}", e);
            }
        }

        let deadline = tokio::time::Instant::now() + shared.config.stop_timeout();
        let mut report = StopReport::default();
        loop {
            let running = shared.lock_state().trips.len();
            if running == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                error!(
                    "{} trip(s) still running after {} ms, forcing stop",
                    running, shared.config.stop_timeout_ms
                );
                report.timed_out = true;
                report.cancelled_trips = running;
                break;
            }
            tokio::time::sleep(shared.config.stop_poll()).await;
        }

        let staged = {
            let mut st = shared.lock_state();
            st.reset_assignments();
            if report.timed_out {
                for (block, _) in shared.grid.blocks() {
                    shared.grid.with_state(block, |s| s.locked_by = None);
                }
            }
            shared.stage(&st, &[Section::Occ])
        };
        shared.write(staged);
        shared.lock_control().state = RunState::Stopped;
        info!("auto mode stopped");
        shared.notify(ModelEvent::Info("auto mode stopped".into()));
        shared.notify(ModelEvent::OccChanged);
        shared.notify(ModelEvent::RoutesChanged);
        Ok(report)
    }

    /// Runs one scan over all locomotives.
    ///
    /// The loop calls this every poll interval; it may also be driven by
    /// hand while stopped. Ignored while stopping.
    ///
    /// # Panics
    ///
    /// Outside a tokio runtime when a trip is spawned.
    pub fn tick(&self) -> TickReport {
        tick_shared(&self.shared)
    }

    // ------------------------------------------------------------------------
    // Locomotives
    // ------------------------------------------------------------------------

    /// Registers a locomotive, or replaces its runtime data.
    pub fn add_locomotive(&self, runtime: LocomotiveRuntime) -> Result<(), DispatchError> {
        let mut st = self.shared.lock_state();
        if st.trips.contains_key(&runtime.id) {
            return Err(DispatchError::LocomotiveBusy(runtime.id.0));
        }
        st.locos.insert(runtime.id, runtime);
        let staged = self.shared.stage(&st, &[Section::Locomotives]);
        drop(st);
        self.shared.write(staged);
        Ok(())
    }

    /// Puts a registered locomotive into a block, ready to leave at once.
    pub fn place_locomotive(&self, loco: LocoId, block: &str) -> Result<(), DispatchError> {
        let shared = &self.shared;
        let id = shared.block_id(block)?;
        let coord = shared.grid.cell(id).coord;
        let staged = {
            let mut st = shared.lock_state();
            if !st.locos.contains_key(&loco) {
                return Err(DispatchError::UnknownLocomotive(loco.0));
            }
            if st.trips.contains_key(&loco) {
                return Err(DispatchError::LocomotiveBusy(loco.0));
            }
            // A block reserved as a trip target belongs to the arriving train.
            let cell = shared.grid.state(id);
            if cell.locomotive.is_some_and(|other| other != loco)
                || cell.locked_by.is_some()
                || st.is_final_block_of_other(loco, coord)
            {
                return Err(DispatchError::BlockOccupied(block.to_string()));
            }
            if let Some(old) = st.occ.get(&loco).and_then(|o| shared.grid.id_at(o.from_block)) {
                shared.grid.with_state(old, |s| s.locomotive = None);
            }
            st.occ.insert(loco, OccBlock::new(loco, coord, shared.clock.now_ms()));
            shared.grid.with_state(id, |s| s.locomotive = Some(loco));
            shared.stage(&st, &[Section::Occ])
        };
        shared.write(staged);
        info!("{} placed in {}", loco, block);
        shared.notify(ModelEvent::OccChanged);
        Ok(())
    }

    /// Takes a locomotive off the layout. Its runtime data is kept.
    pub fn remove_locomotive(&self, loco: LocoId) -> Result<(), DispatchError> {
        let shared = &self.shared;
        let staged = {
            let mut st = shared.lock_state();
            if st.trips.contains_key(&loco) {
                return Err(DispatchError::LocomotiveBusy(loco.0));
            }
            let Some(occ) = st.occ.remove(&loco) else {
                return Err(DispatchError::UnknownLocomotive(loco.0));
            };
            if let Some(block) = shared.grid.id_at(occ.from_block) {
                shared.grid.with_state(block, |s| {
                    if s.locomotive == Some(loco) {
                        s.locomotive = None;
                    }
                });
            }
            shared.stage(&st, &[Section::Occ])
        };
        shared.write(staged);
        shared.notify(ModelEvent::OccChanged);
        Ok(())
    }

    fn update_policy<F>(&self, loco: LocoId, f: F) -> Result<(), DispatchError>
    where
        F: FnOnce(&mut LocoPolicy),
    {
        let mut st = self.shared.lock_state();
        let runtime = st
            .locos
            .get_mut(&loco)
            .ok_or(DispatchError::UnknownLocomotive(loco.0))?;
        f(&mut runtime.policy);
        let staged = self.shared.stage(&st, &[Section::Locomotives]);
        drop(st);
        self.shared.write(staged);
        Ok(())
    }

    /// Locks or unlocks a locomotive. Locked locomotives are never dispatched.
    pub fn set_locomotive_locked(&self, loco: LocoId, locked: bool) -> Result<(), DispatchError> {
        self.update_policy(loco, |p| p.locked = locked)
    }

    /// Stops or resumes a locomotive. A stopped locomotive finishes its
    /// current trip and then stays put.
    pub fn set_locomotive_stopped(&self, loco: LocoId, stopped: bool) -> Result<(), DispatchError> {
        self.update_policy(loco, |p| p.stopped = stopped)
    }

    // ------------------------------------------------------------------------
    // Layout flags
    // ------------------------------------------------------------------------

    /// Excludes a route from selection, or includes it again.
    pub fn set_route_disabled(&self, name: &str, disabled: bool) -> Result<(), DispatchError> {
        let route = self
            .shared
            .catalog
            .by_name(name)
            .ok_or_else(|| DispatchError::UnknownRoute(name.to_string()))?;
        let staged = {
            let mut st = self.shared.lock_state();
            if let Some(flags) = st.flags_mut(route.id) {
                flags.disabled = disabled;
            }
            self.shared.stage(&st, &[Section::Routes])
        };
        self.shared.write(staged);
        self.shared.notify(ModelEvent::RoutesChanged);
        Ok(())
    }

    /// Disables a block as a route target, or enables it again.
    pub fn set_block_disabled(&self, name: &str, disabled: bool) -> Result<(), DispatchError> {
        let id = self.shared.block_id(name)?;
        self.shared.grid.with_state(id, |s| s.disabled = disabled);
        Ok(())
    }

    /// Puts the switch at `at` under maintenance. Routes through it are not
    /// selected until it is cleared.
    pub fn set_switch_maintenance(&self, at: Coord, maintenance: bool) -> Result<(), DispatchError> {
        let grid = &self.shared.grid;
        let id = grid.id_at(at).ok_or(LayoutError::NoCell(at))?;
        if grid.cell(id).as_switch().is_none() {
            return Err(LayoutError::WrongKind {
                coord: at,
                expected: "switch",
            }
            .into());
        }
        grid.with_state(id, |s| s.maintenance = maintenance);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Trips
    // ------------------------------------------------------------------------

    /// Cancels the running trip of `loco`. Returns `false` if it had none.
    pub fn cancel_trip(&self, loco: LocoId) -> Result<bool, DispatchError> {
        let st = self.shared.lock_state();
        if !st.locos.contains_key(&loco) {
            return Err(DispatchError::UnknownLocomotive(loco.0));
        }
        Ok(match st.trips.get(&loco) {
            Some(trip) => {
                debug!("{}: cancelling trip", loco);
                trip.cancel.cancel();
                true
            }
            None => false,
        })
    }

    /// Phase of the running trip of `loco`, else how its last trip ended.
    pub fn trip_phase(&self, loco: LocoId) -> Option<TripPhase> {
        let st = self.shared.lock_state();
        st.trips
            .get(&loco)
            .map(|t| t.phase)
            .or_else(|| st.last_outcome.get(&loco).copied())
    }

    // ------------------------------------------------------------------------
    // Inspection and persistence
    // ------------------------------------------------------------------------

    /// Copies the current state.
    pub fn snapshot(&self) -> Snapshot {
        let shared = &self.shared;
        let run_state = shared.run_state();
        let st = shared.lock_state();
        Snapshot {
            run_state,
            occ: st.occ.values().cloned().collect(),
            locomotives: st.locos.values().cloned().collect(),
            routes: shared
                .catalog
                .iter()
                .map(|route| {
                    let flags = st.flags(route.id);
                    RouteStatus {
                        name: route.name.clone(),
                        occupied: flags.occupied,
                        disabled: flags.disabled,
                    }
                })
                .collect(),
            trips: st
                .trips
                .iter()
                .map(|(loco, trip)| TripInfo {
                    loco: *loco,
                    route: shared.catalog.get(trip.route).name.clone(),
                    phase: trip.phase,
                })
                .collect(),
            persist_failures: shared.persist_failures.load(Ordering::Relaxed),
        }
    }

    /// Persistence failures since creation.
    pub fn persist_failures(&self) -> u64 {
        self.shared.persist_failures.load(Ordering::Relaxed)
    }

    /// Writes every section. Returns the first failure.
    pub fn save(&self) -> Result<(), DispatchError> {
        let shared = &self.shared;
        let staged = shared.stage(&shared.lock_state(), &Section::ALL);
        match shared.write(staged).into_iter().next() {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Restores locomotives, occupancy and route flags from the store.
    ///
    /// Only allowed while stopped. Saved assignments are dropped since no
    /// trip survives a restart, and dwell timers restart now. Records whose
    /// block no longer exists are skipped.
    pub fn load(&self) -> Result<(), DispatchError> {
        let shared = &self.shared;
        if shared.run_state() != RunState::Stopped {
            return Err(DispatchError::AlreadyRunning);
        }
        let store = &*shared.store;
        let locos = load_section::<Vec<LocomotiveRuntime>>(store, Section::Locomotives)?;
        let occ = load_section::<Vec<OccBlock>>(store, Section::Occ)?;
        let routes = load_section::<Vec<SavedRoute>>(store, Section::Routes)?;
        let now = shared.clock.now_ms();

        {
            let mut st = shared.lock_state();
            if let Some(locos) = locos {
                st.locos = locos.into_iter().map(|r| (r.id, r)).collect();
            }
            if let Some(records) = occ {
                for (_, old) in std::mem::take(&mut st.occ) {
                    if let Some(block) = shared.grid.id_at(old.from_block) {
                        shared.grid.with_state(block, |s| s.locomotive = None);
                    }
                }
                for mut record in records {
                    let block = shared
                        .grid
                        .id_at(record.from_block)
                        .filter(|id| shared.grid.cell(*id).is_block());
                    let Some(block) = block else {
                        warn!(
                            "{}: saved block at {} no longer exists, skipping",
                            record.loco, record.from_block
                        );
                        continue;
                    };
                    record.reset();
                    record.reached_at_ms = now;
                    shared.grid.with_state(block, |s| s.locomotive = Some(record.loco));
                    st.occ.insert(record.loco, record);
                }
            }
            if let Some(saved) = routes {
                for entry in saved {
                    let Some(route) = shared.catalog.by_name(&entry.name) else {
                        debug!("saved route {} is not in the catalog", entry.name);
                        continue;
                    };
                    if let Some(flags) = st.flags_mut(route.id) {
                        flags.disabled = entry.disabled;
                    }
                }
            }
        }
        shared.notify(ModelEvent::OccChanged);
        shared.notify(ModelEvent::RoutesChanged);
        Ok(())
    }
}
