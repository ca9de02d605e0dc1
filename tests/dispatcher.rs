//! Dispatcher behaviour against the mock command station.
//!
//! All tests run on a paused tokio clock, so ramps, sensor polls and dwell
//! periods take no real time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rs_autoplay::config::{AutoModeConfig, TripConfig};
use rs_autoplay::error::DispatchError;
use rs_autoplay::dispatch::{Dispatcher, LocomotiveRuntime, RunState, SkipReason, TripPhase};
use rs_autoplay::grid::rules::Adjacency;
use rs_autoplay::grid::{BlockEvent, BlockOptions, BlockSide, FeedbackEvent, Grid, LocoId, Rotation, TrackCell};
use rs_autoplay::hal::{MemoryStore, MockCommandStation, RecordingNotifier, StationCommand};
use rs_autoplay::routes::RouteCatalog;
use rs_autoplay::traits::{ModelEvent, Section};

const L1: LocoId = LocoId(1);
const L2: LocoId = LocoId(2);

struct Rig {
    dispatcher: Dispatcher<Arc<MockCommandStation>>,
    station: Arc<MockCommandStation>,
    store: Arc<MemoryStore>,
    notifier: Arc<RecordingNotifier>,
}

impl Rig {
    fn new(cells: Vec<TrackCell>, config: AutoModeConfig) -> Self {
        Self::with_station(cells, config, MockCommandStation::new())
    }

    fn with_station(cells: Vec<TrackCell>, config: AutoModeConfig, station: MockCommandStation) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let grid = Grid::new(cells).expect("valid layout");
        let catalog = RouteCatalog::discover(&grid, &Adjacency::build(&grid));
        let station = Arc::new(station);
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let dispatcher = Dispatcher::builder(Arc::new(grid), Arc::new(catalog), station.clone())
            .with_store(store.clone())
            .with_notifier(notifier.clone())
            .with_config(config)
            .build();
        Self {
            dispatcher,
            station,
            store,
            notifier,
        }
    }

    fn place(&self, loco: LocoId, block: &str) {
        self.dispatcher
            .add_locomotive(LocomotiveRuntime::new(loco, "test"))
            .unwrap();
        self.dispatcher.place_locomotive(loco, block).unwrap();
    }

    fn holder(&self, block: &str) -> Option<LocoId> {
        let grid = self.dispatcher.grid();
        grid.state(grid.by_name(block).unwrap()).locomotive
    }

    fn occupied_routes(&self) -> Vec<String> {
        self.dispatcher
            .snapshot()
            .routes
            .into_iter()
            .filter(|r| r.occupied)
            .map(|r| r.name)
            .collect()
    }
}

fn config() -> AutoModeConfig {
    AutoModeConfig::default()
        .with_rng_seed(7)
        .with_dwell_seconds(10)
        .with_trip(TripConfig::default())
}

async fn wait(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn sensor_block(x: i32, y: i32, name: &str, enter: &str, reached: &str) -> TrackCell {
    TrackCell::block_with(
        x,
        y,
        name,
        "AC",
        BlockOptions {
            events: vec![
                BlockEvent::new(enter, FeedbackEvent::Enter),
                BlockEvent::new(reached, FeedbackEvent::In),
            ],
            ..Default::default()
        },
    )
}

/// B1 -- track -- B2, with enter sensor 1 and in sensor 2 on B2 and
/// sensors 3 and 4 on B1.
fn shuttle() -> Vec<TrackCell> {
    vec![
        sensor_block(0, 0, "B1", "S3", "S4"),
        TrackCell::track(1, 0, "AC"),
        sensor_block(2, 0, "B2", "S1", "S2"),
        TrackCell::sensor(0, 5, "S1", 1),
        TrackCell::sensor(1, 5, "S2", 2),
        TrackCell::sensor(2, 5, "S3", 3),
        TrackCell::sensor(3, 5, "S4", 4),
    ]
}

/// West/East and North/South routes sharing one crossing cell.
fn crossing() -> Vec<TrackCell> {
    vec![
        TrackCell::block(0, 1, "West"),
        TrackCell::track(1, 1, "AC,BD"),
        sensor_block(2, 1, "East", "SE", "SE"),
        TrackCell::block(1, 0, "North").rotated(Rotation::R90),
        sensor_block(1, 2, "South", "SS", "SS").rotated(Rotation::R90),
        TrackCell::sensor(5, 5, "SE", 5),
        TrackCell::sensor(6, 5, "SS", 6),
    ]
}

// ============================================================================
// Complete trips
// ============================================================================

#[tokio::test(start_paused = true)]
async fn trip_runs_through_every_phase() {
    let rig = Rig::new(shuttle(), config());
    rig.place(L1, "B1");

    let report = rig.dispatcher.tick();
    assert_eq!(report.assigned.len(), 1);
    assert_eq!(report.assigned[0].route, "B1->B2");
    assert!(!report.assigned[0].reversed);
    let occ = &rig.dispatcher.snapshot().occ[0];
    assert!(occ.is_assigned());
    assert_eq!(occ.route.as_deref(), Some("B1->B2"));

    wait(300).await;
    assert_eq!(rig.dispatcher.trip_phase(L1), Some(TripPhase::Accelerating));
    assert!(rig.dispatcher.snapshot().occ[0].next_entered);

    wait(5_000).await;
    assert_eq!(rig.dispatcher.trip_phase(L1), Some(TripPhase::WaitingEnter));
    assert_eq!(rig.station.speed_of(L1), 60);

    rig.station.set_feedback(1, true);
    wait(500).await;
    assert_eq!(rig.dispatcher.trip_phase(L1), Some(TripPhase::Decelerating));
    assert!(rig.dispatcher.snapshot().occ[0].final_entered);

    wait(5_000).await;
    assert_eq!(rig.dispatcher.trip_phase(L1), Some(TripPhase::WaitingIn));
    assert_eq!(rig.station.speed_of(L1), 10);

    rig.station.set_feedback(2, true);
    wait(500).await;
    assert_eq!(rig.dispatcher.trip_phase(L1), Some(TripPhase::Finished));
    assert_eq!(rig.station.speed_of(L1), 0);
}

#[tokio::test(start_paused = true)]
async fn arrival_moves_the_locomotive_and_frees_the_route() {
    let rig = Rig::with_station(shuttle(), config(), MockCommandStation::new().with_auto_feedback());
    rig.place(L1, "B1");
    rig.dispatcher.tick();
    wait(2_000).await;

    assert_eq!(rig.dispatcher.trip_phase(L1), Some(TripPhase::Finished));
    assert_eq!(rig.holder("B1"), None);
    assert_eq!(rig.holder("B2"), Some(L1));
    assert!(rig.occupied_routes().is_empty());

    let snapshot = rig.dispatcher.snapshot();
    let occ = &snapshot.occ[0];
    assert!(!occ.is_assigned());
    assert_eq!(occ.from_block, rs_autoplay::Coord::new(2, 0));
    assert_eq!(occ.seconds_to_wait, 10);
    assert_eq!(snapshot.locomotives[0].enter_side, BlockSide::Minus);

    let grid = rig.dispatcher.grid();
    assert_eq!(grid.state(grid.by_name("B2").unwrap()).locked_by, None);
    assert!(rig.notifier.contains(&ModelEvent::RouteReset("B1->B2".into())));

    let saved = rig.store.get(Section::Occ).expect("occupancy persisted");
    assert_eq!(saved[0]["from_block"]["x"], 2);
}

// ============================================================================
// Dwell and reversal
// ============================================================================

#[tokio::test(start_paused = true)]
async fn dwell_then_reverse_out_of_a_dead_end() {
    let rig = Rig::with_station(shuttle(), config(), MockCommandStation::new().with_auto_feedback());
    rig.place(L1, "B1");
    rig.dispatcher.tick();
    wait(2_000).await;
    assert_eq!(rig.holder("B2"), Some(L1));

    let report = rig.dispatcher.tick();
    assert!(matches!(report.skipped[..], [(L1, SkipReason::Dwelling { .. })]));

    wait(10_000).await;
    rig.station.clear_commands();
    let report = rig.dispatcher.tick();
    assert_eq!(report.assigned.len(), 1);
    assert_eq!(report.assigned[0].route, "B2->B1");
    assert!(report.assigned[0].reversed);

    assert_eq!(rig.station.direction_of(L1), Some(true));
    let commands = rig.station.commands();
    assert_eq!(
        commands.first(),
        Some(&StationCommand::Direction {
            loco: L1,
            backward: true
        })
    );
    let runtime = &rig.dispatcher.snapshot().locomotives[0];
    assert!(runtime.backward);
    assert_eq!(runtime.enter_side, BlockSide::Plus);
}

#[tokio::test(start_paused = true)]
async fn no_reversal_without_permission() {
    let cells = vec![
        TrackCell::block(0, 0, "B1"),
        TrackCell::track(1, 0, "AC"),
        TrackCell::block(2, 0, "B2"),
    ];
    let rig = Rig::new(cells, config());
    let mut runtime = LocomotiveRuntime::new(L1, "railcar").entered_from(BlockSide::Plus);
    runtime.policy.direction_change = false;
    rig.dispatcher.add_locomotive(runtime).unwrap();
    rig.dispatcher.place_locomotive(L1, "B1").unwrap();

    let report = rig.dispatcher.tick();
    assert_eq!(report.skipped, vec![(L1, SkipReason::NoRoute)]);
    assert_eq!(rig.station.direction_of(L1), None);
}

// ============================================================================
// Exclusivity
// ============================================================================

#[tokio::test(start_paused = true)]
async fn placing_into_a_reserved_target_is_refused() {
    let rig = Rig::new(shuttle(), config());
    rig.place(L1, "B1");
    rig.dispatcher.add_locomotive(LocomotiveRuntime::new(L2, "test")).unwrap();
    assert_eq!(rig.dispatcher.tick().assigned[0].route, "B1->B2");

    let refused = rig.dispatcher.place_locomotive(L2, "B2");
    assert!(matches!(refused, Err(DispatchError::BlockOccupied(_))), "{:?}", refused);

    rig.station.set_feedback(1, true);
    rig.station.set_feedback(2, true);
    wait(10_000).await;
    assert_eq!(rig.dispatcher.trip_phase(L1), Some(TripPhase::Finished));
    assert_eq!(rig.holder("B2"), Some(L1));
    let occ = rig.dispatcher.snapshot().occ;
    assert_eq!(occ.len(), 1);
    assert_eq!(occ[0].loco, L1);

    // Free again once the train has moved on.
    rig.dispatcher.place_locomotive(L2, "B1").unwrap();
}

#[tokio::test(start_paused = true)]
async fn crossing_routes_are_never_occupied_together() {
    let rig = Rig::new(crossing(), config());
    rig.place(L1, "West");
    rig.place(L2, "North");

    let report = rig.dispatcher.tick();
    assert_eq!(report.assigned.len(), 1);
    assert_eq!(report.assigned[0].route, "West->East");
    assert_eq!(report.skipped, vec![(L2, SkipReason::Crossing)]);

    wait(1_000).await;
    let report = rig.dispatcher.tick();
    assert!(report.assigned.is_empty());
    assert_eq!(rig.occupied_routes(), vec!["West->East".to_string()]);

    rig.station.set_feedback(5, true);
    wait(3_000).await;
    assert_eq!(rig.holder("East"), Some(L1));
    assert!(rig.occupied_routes().is_empty());

    let report = rig.dispatcher.tick();
    assert_eq!(report.assigned.len(), 1);
    assert_eq!(report.assigned[0].loco, L2);
    assert_eq!(report.assigned[0].route, "North->South");
    assert_eq!(rig.occupied_routes(), vec!["North->South".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn two_locomotives_never_share_a_target() {
    let cells = vec![
        TrackCell::block(0, 0, "B1"),
        TrackCell::track(1, 0, "AC"),
        sensor_block(2, 0, "B2", "S1", "S2"),
        TrackCell::track(3, 0, "AC"),
        TrackCell::block(4, 0, "B3"),
        TrackCell::sensor(0, 5, "S1", 1),
        TrackCell::sensor(1, 5, "S2", 2),
    ];
    let rig = Rig::new(cells, config());
    rig.place(L1, "B1");
    rig.dispatcher
        .add_locomotive(LocomotiveRuntime::new(L2, "test").entered_from(BlockSide::Plus))
        .unwrap();
    rig.dispatcher.place_locomotive(L2, "B3").unwrap();

    let report = rig.dispatcher.tick();
    assert_eq!(report.assigned.len(), 1);
    assert_eq!(report.assigned[0].loco, L1);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].0, L2);

    let grid = rig.dispatcher.grid();
    let b1 = grid.by_name("B1").unwrap();
    assert_eq!(grid.state(grid.by_name("B2").unwrap()).locked_by, Some(b1));
}

#[tokio::test(start_paused = true)]
async fn random_choice_covers_both_routes() {
    let cells = vec![
        TrackCell::block(0, 0, "B1"),
        TrackCell::switch(1, 0, "AC,AB", 3),
        sensor_block(2, 0, "B2", "S1", "S2"),
        sensor_block(1, -1, "B3", "S3", "S4").rotated(Rotation::R90),
        TrackCell::sensor(0, 5, "S1", 1),
        TrackCell::sensor(1, 5, "S2", 2),
        TrackCell::sensor(2, 5, "S3", 3),
        TrackCell::sensor(3, 5, "S4", 4),
    ];
    let rig = Rig::new(cells, config());
    rig.place(L1, "B1");

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..200 {
        let report = rig.dispatcher.tick();
        let assignment = report.assigned.first().expect("assigned");
        *counts.entry(assignment.route.clone()).or_default() += 1;
        rig.dispatcher.cancel_trip(L1).unwrap();
        wait(10).await;
        assert_eq!(rig.dispatcher.trip_phase(L1), Some(TripPhase::Canceled));
    }
    assert_eq!(counts.len(), 2);
    assert!(counts.values().all(|&n| n > 60), "{:?}", counts);
}

// ============================================================================
// Cancellation
// ============================================================================

async fn cancel_during(phase: TripPhase) {
    let rig = Rig::new(shuttle(), config());
    rig.place(L1, "B1");
    rig.dispatcher.tick();

    match phase {
        TripPhase::Created => {}
        TripPhase::Accelerating => wait(300).await,
        TripPhase::WaitingEnter => wait(5_000).await,
        TripPhase::Decelerating => {
            wait(5_000).await;
            rig.station.set_feedback(1, true);
            wait(500).await;
        }
        TripPhase::WaitingIn => {
            wait(5_000).await;
            rig.station.set_feedback(1, true);
            wait(5_000).await;
        }
        other => panic!("cannot cancel during {:?}", other),
    }
    assert_eq!(rig.dispatcher.trip_phase(L1), Some(phase));

    assert!(rig.dispatcher.cancel_trip(L1).unwrap());
    wait(50).await;

    assert_eq!(rig.dispatcher.trip_phase(L1), Some(TripPhase::Canceled), "{:?}", phase);
    assert_eq!(rig.station.speed_of(L1), 0);
    assert!(rig.occupied_routes().is_empty());
    assert_eq!(rig.holder("B1"), Some(L1));
    let occ = &rig.dispatcher.snapshot().occ[0];
    assert!(!occ.is_assigned());
    assert!(!occ.next_entered && !occ.final_entered);
    let grid = rig.dispatcher.grid();
    assert_eq!(grid.state(grid.by_name("B2").unwrap()).locked_by, None);
    assert!(!rig.dispatcher.cancel_trip(L1).unwrap());
}

#[tokio::test(start_paused = true)]
async fn cancellation_resets_from_any_phase() {
    for phase in [
        TripPhase::Created,
        TripPhase::Accelerating,
        TripPhase::WaitingEnter,
        TripPhase::Decelerating,
        TripPhase::WaitingIn,
    ] {
        cancel_during(phase).await;
    }
}

#[tokio::test(start_paused = true)]
async fn targets_without_sensors_are_never_selected() {
    let cells = vec![
        TrackCell::block(0, 0, "B1"),
        TrackCell::switch(1, 0, "AC,AB", 3),
        TrackCell::block(2, 0, "B2"),
        sensor_block(1, -1, "B3", "S3", "S4").rotated(Rotation::R90),
        TrackCell::sensor(2, 5, "S3", 3),
        TrackCell::sensor(3, 5, "S4", 4),
    ];
    let rig = Rig::new(cells, config());
    rig.place(L1, "B1");

    for _ in 0..10 {
        let report = rig.dispatcher.tick();
        assert_eq!(report.assigned.len(), 1);
        assert_eq!(report.assigned[0].route, "B1->B3");
        rig.dispatcher.cancel_trip(L1).unwrap();
        wait(2_500).await;
    }

    rig.dispatcher.set_route_disabled("B1->B3", true).unwrap();
    rig.station.clear_commands();
    for _ in 0..10 {
        let report = rig.dispatcher.tick();
        assert_eq!(report.skipped, vec![(L1, SkipReason::NoRoute)]);
        wait(2_500).await;
    }
    assert!(rig.station.commands().is_empty());
    assert!(rig.occupied_routes().is_empty());
    assert_eq!(rig.holder("B1"), Some(L1));
}

#[tokio::test(start_paused = true)]
async fn failing_sensor_reads_count_as_inactive() {
    let rig = Rig::new(shuttle(), config());
    rig.place(L1, "B1");
    rig.dispatcher.tick();
    rig.station.fail_feedback(1);
    wait(5_000).await;
    assert_eq!(rig.dispatcher.trip_phase(L1), Some(TripPhase::WaitingEnter));

    rig.station.heal_feedback(1);
    rig.station.set_feedback(1, true);
    wait(500).await;
    assert_eq!(rig.dispatcher.trip_phase(L1), Some(TripPhase::Decelerating));
}

// ============================================================================
// Start and stop
// ============================================================================

#[tokio::test(start_paused = true)]
async fn stop_waits_for_running_trips() {
    let rig = Rig::with_station(shuttle(), config(), MockCommandStation::new().with_auto_feedback());
    rig.place(L1, "B1");
    rig.dispatcher.start().unwrap();
    wait(100).await;
    assert_eq!(rig.dispatcher.trip_phase(L1).map(TripPhase::is_terminal), Some(false));

    let report = rig.dispatcher.stop().await.unwrap();
    assert!(!report.timed_out);
    assert_eq!(rig.dispatcher.run_state(), RunState::Stopped);
    assert_eq!(rig.dispatcher.trip_phase(L1), Some(TripPhase::Finished));
    assert_eq!(rig.holder("B2"), Some(L1));
}

#[tokio::test(start_paused = true)]
async fn stop_timeout_forces_a_reset() {
    let config = config().with_stop_timeout_ms(2_000).with_stop_poll_ms(250);
    let rig = Rig::new(shuttle(), config);
    rig.place(L1, "B1");
    rig.dispatcher.start().unwrap();
    wait(1_000).await;
    assert_eq!(rig.occupied_routes(), vec!["B1->B2".to_string()]);

    let report = rig.dispatcher.stop().await.unwrap();
    assert!(report.timed_out);
    assert_eq!(report.cancelled_trips, 1);
    assert_eq!(rig.dispatcher.run_state(), RunState::Stopped);
    assert!(rig.occupied_routes().is_empty());
    assert!(rig.dispatcher.snapshot().trips.is_empty());

    wait(50).await;
    assert_eq!(rig.station.speed_of(L1), 0);
    assert_eq!(rig.dispatcher.trip_phase(L1), Some(TripPhase::Canceled));
    let grid = rig.dispatcher.grid();
    assert_eq!(grid.state(grid.by_name("B2").unwrap()).locked_by, None);
    assert!(!rig.dispatcher.snapshot().occ[0].is_assigned());
}

#[tokio::test(start_paused = true)]
async fn stopped_locomotive_is_left_alone() {
    let rig = Rig::new(shuttle(), config());
    rig.place(L1, "B1");
    rig.dispatcher.set_locomotive_stopped(L1, true).unwrap();
    assert_eq!(rig.dispatcher.tick().skipped, vec![(L1, SkipReason::Stopped)]);
    rig.dispatcher.set_locomotive_stopped(L1, false).unwrap();
    rig.dispatcher.set_route_disabled("B1->B2", true).unwrap();
    assert_eq!(rig.dispatcher.tick().skipped, vec![(L1, SkipReason::NoRoute)]);
}
