//! Auto mode on a simulated oval with four blocks and two locomotives.
//!
//! The mock command station stands in for the layout. A small simulator
//! task watches the running trips and raises the target block's sensors the
//! way a real train would, so trips complete and locomotives keep circling.
//!
//! ```text
//!  +--[North1]--[North2]--+
//!  |                      |
//!  +--[South1]--[South2]--+
//! ```
//!
//! # Usage
//!
//! ```sh
//! RUST_LOG=info cargo run --example simulated_layout
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rs_autoplay::config::{AutoModeConfig, TripConfig};
use rs_autoplay::dispatch::{Dispatcher, LocomotiveRuntime, TripPhase};
use rs_autoplay::grid::rules::Adjacency;
use rs_autoplay::grid::{BlockEvent, BlockOptions, FeedbackEvent, Grid, LocoId, TrackCell};
use rs_autoplay::hal::{BroadcastNotifier, MemoryStore, MockCommandStation};
use rs_autoplay::routes::RouteCatalog;

type Sensors = HashMap<String, (u16, u16)>;

fn block(x: i32, y: i32, name: &str, sensors: &mut Sensors, cells: &mut Vec<TrackCell>) {
    let base = 10 * (sensors.len() as u16 + 1);
    let (enter, reached) = (format!("{}-enter", name), format!("{}-in", name));
    cells.push(TrackCell::block_with(
        x,
        y,
        name,
        "AC",
        BlockOptions {
            events: vec![
                BlockEvent::new(enter.clone(), FeedbackEvent::Enter),
                BlockEvent::new(reached.clone(), FeedbackEvent::In),
            ],
            ..Default::default()
        },
    ));
    let row = 10 + sensors.len() as i32;
    cells.push(TrackCell::sensor(0, row, &enter, base));
    cells.push(TrackCell::sensor(1, row, &reached, base + 1));
    sensors.insert(name.to_string(), (base, base + 1));
}

fn oval() -> (Vec<TrackCell>, Sensors) {
    let mut sensors = Sensors::new();
    let mut cells = vec![
        TrackCell::track(0, 0, "CD"),
        TrackCell::track(2, 0, "AC"),
        TrackCell::track(4, 0, "AD"),
        TrackCell::track(0, 1, "BD"),
        TrackCell::track(4, 1, "BD"),
        TrackCell::track(0, 2, "BC"),
        TrackCell::track(2, 2, "AC"),
        TrackCell::track(4, 2, "AB"),
    ];
    block(1, 0, "North1", &mut sensors, &mut cells);
    block(3, 0, "North2", &mut sensors, &mut cells);
    block(1, 2, "South1", &mut sensors, &mut cells);
    block(3, 2, "South2", &mut sensors, &mut cells);
    (cells, sensors)
}

/// Raises the sensors a train running each trip would trip.
async fn simulate(dispatcher: Dispatcher<Arc<MockCommandStation>>, sensors: Sensors) {
    let station = Arc::clone(dispatcher.station());
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        ticker.tick().await;
        let mut active = HashSet::new();
        for trip in dispatcher.snapshot().trips {
            let target = trip
                .route
                .split_once("->")
                .map(|(_, to)| to.split('#').next().unwrap_or(to));
            let Some(&(enter, reached)) = target.and_then(|t| sensors.get(t)) else {
                continue;
            };
            match trip.phase {
                TripPhase::WaitingEnter | TripPhase::Decelerating => {
                    active.insert(enter);
                }
                TripPhase::WaitingIn => {
                    active.insert(enter);
                    active.insert(reached);
                }
                _ => {}
            }
        }
        for &(enter, reached) in sensors.values() {
            station.set_feedback(enter, active.contains(&enter));
            station.set_feedback(reached, active.contains(&reached));
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let rt = tokio::runtime::Runtime::new().expect("Failed to create runtime");
    rt.block_on(async {
        println!("=================================");
        println!("  rs-autoplay Simulated Layout");
        println!("=================================");
        println!();

        let (cells, sensors) = oval();
        let grid = Grid::new(cells).expect("layout is valid");
        let catalog = RouteCatalog::discover(&grid, &Adjacency::build(&grid));
        println!("Discovered {} routes:", catalog.len());
        for route in &catalog {
            println!("  {:<18} {} steps, {} turn(s)", route.name, route.steps.len(), route.turn_count());
        }
        println!();
        println!("Crossing report:");
        for group in catalog.conflicts().groups() {
            let crossing: Vec<&str> = group
                .crossing
                .iter()
                .map(|id| catalog.get(*id).name.as_str())
                .collect();
            println!("  {:<18} crosses [{}]", catalog.get(group.route).name, crossing.join(", "));
        }
        println!();

        let config = AutoModeConfig::default()
            .with_poll_interval_ms(500)
            .with_dwell_seconds(2)
            .with_stop_timeout_ms(10_000)
            .with_trip(TripConfig::default().with_ramp_interval_ms(40));

        let notifier = Arc::new(BroadcastNotifier::new(64));
        let mut events = notifier.subscribe();
        let dispatcher = Dispatcher::builder(
            Arc::new(grid),
            Arc::new(catalog),
            Arc::new(MockCommandStation::new()),
        )
        .with_store(Arc::new(MemoryStore::new()))
        .with_notifier(notifier)
        .with_config(config)
        .build();

        for (id, name, block) in [(3, "V100", "North1"), (5, "Köf II", "South2")] {
            dispatcher
                .add_locomotive(LocomotiveRuntime::new(LocoId(id), name))
                .expect("new locomotive");
            dispatcher
                .place_locomotive(LocoId(id), block)
                .expect("free block");
        }

        let printer = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                println!("event: {}", serde_json::to_string(&event).unwrap_or_default());
            }
        });
        let simulator = tokio::spawn(simulate(dispatcher.clone(), sensors));

        dispatcher.start().expect("dispatcher starts");
        tokio::time::sleep(Duration::from_secs(20)).await;

        match dispatcher.stop().await {
            Ok(report) if report.timed_out => {
                println!("Stopped after cancelling {} trip(s)", report.cancelled_trips)
            }
            Ok(_) => println!("Stopped cleanly"),
            Err(e) => println!("Stop failed: {}", e),
        }
        simulator.abort();
        printer.abort();

        println!();
        println!("Final positions:");
        for occ in dispatcher.snapshot().occ {
            println!("  {} in block at {}", occ.loco, occ.from_block);
        }
    });
}
