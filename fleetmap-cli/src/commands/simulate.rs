//! Simulate command - drive a generated fleet through a headless map runtime.
//!
//! ```text
//! SimulationEngine ──► SimulationSource ──► TelemetryAdapter ──► MapRuntime
//!        │                    │ trails                              │
//!        ▼                    └────────────────────────────────────►│ frame loop
//!   SimEvent log                                        offline store (snapshots)
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use fleetmap::entities::Vehicle;
use fleetmap::geo::LngLat;
use fleetmap::runtime::{
    Container, HeadlessEngineFactory, MapRuntime, RuntimeError, RuntimeHandlers, TransitionRecord,
};
use fleetmap::simulation::{demo_scenario, RouteCompletion, SimEvent, SimulationSource};
use fleetmap::telemetry::{TelemetryAdapter, TelemetryManager};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::CliError;
use crate::runner::CliRunner;

/// Default map center (Hamburg).
const DEFAULT_CENTER: &str = "9.99,53.55";

/// Arguments for the simulate command.
#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Wall-clock run time in seconds
    #[arg(long, default_value_t = 60)]
    pub duration: u64,

    /// Number of vehicles
    #[arg(long, default_value_t = 5)]
    pub vehicles: usize,

    /// Random seed (overrides simulation.seed)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Simulated seconds per wall-clock second (overrides simulation.time_scale)
    #[arg(long)]
    pub time_scale: Option<f64>,

    /// What vehicles do at the end of a round: loop or stop
    #[arg(long)]
    pub completion: Option<RouteCompletion>,

    /// Depot position as "lng,lat"
    #[arg(long, default_value = DEFAULT_CENTER)]
    pub center: String,

    /// Seconds between status lines
    #[arg(long, default_value_t = 10)]
    pub report_every: u64,

    /// Only print the final diagnostics
    #[arg(long, short)]
    pub quiet: bool,
}

/// Logs runtime lifecycle notifications.
struct LogHandlers;

impl RuntimeHandlers for LogHandlers {
    fn on_state_change(&self, record: &TransitionRecord) {
        info!(from = %record.from, to = %record.to, reason = ?record.reason, "Map state changed");
    }

    fn on_degraded(&self, error: &RuntimeError) {
        warn!(%error, "Map degraded");
    }
}

fn parse_center(s: &str) -> Result<LngLat, CliError> {
    let invalid = || CliError::InvalidArgument(format!("center must be \"lng,lat\", got {:?}", s));
    let (lng, lat) = s.split_once(',').ok_or_else(invalid)?;
    let lng: f64 = lng.trim().parse().map_err(|_| invalid())?;
    let lat: f64 = lat.trim().parse().map_err(|_| invalid())?;
    let center = LngLat::new(lng, lat);
    if !center.is_valid() {
        return Err(invalid());
    }
    Ok(center)
}

fn describe(event: &SimEvent) -> String {
    match event {
        SimEvent::WaypointReached {
            vehicle_id, name, ..
        } => format!("{vehicle_id} reached {name}"),
        SimEvent::DeliveryCompleted {
            vehicle_id,
            delivered,
            remaining_capacity,
            ..
        } => format!("{vehicle_id} delivered {delivered}, {remaining_capacity} left"),
        SimEvent::EventStarted {
            vehicle_id,
            kind,
            duration,
        } => format!("{vehicle_id}: {kind} for {}s", duration.as_secs()),
        SimEvent::EventExpired { vehicle_id, kind } => format!("{vehicle_id}: {kind} cleared"),
        SimEvent::RouteRestarted { vehicle_id } => format!("{vehicle_id} restarted its round"),
        SimEvent::RouteCompleted { vehicle_id } => format!("{vehicle_id} finished its round"),
    }
}

/// Run the simulate command.
pub fn run(args: SimulateArgs) -> Result<(), CliError> {
    let runner = CliRunner::new()?;
    runner.log_startup("simulate");
    let config = runner.config().clone();

    let center = parse_center(&args.center)?;
    let mut sim_config = config.simulation.clone();
    if let Some(seed) = args.seed {
        sim_config = sim_config.with_seed(seed);
    }
    if let Some(scale) = args.time_scale {
        sim_config = sim_config.with_time_scale(scale);
    }
    if let Some(completion) = args.completion {
        sim_config = sim_config.with_completion(completion);
    }

    runner.block_on(async {
        let store = runner.open_store().await?;
        let runtime = MapRuntime::install_global(Arc::new(HeadlessEngineFactory::new()));
        runtime
            .init(Container::new("cli"), config.runtime_config(), Arc::new(LogHandlers))
            .await?;

        let engine = demo_scenario(sim_config, center, args.vehicles)?;
        let source =
            Arc::new(SimulationSource::new("simulation", engine).with_trail_sink(runtime.clone()));
        let mut events = source.events();

        let telemetry = TelemetryManager::new();
        let adapter = TelemetryAdapter::<Vehicle>::new(
            config.telemetry.fast_source("simulation"),
            runtime.clone(),
        )
        .with_store(store.clone());
        telemetry.spawn_source(adapter, source.clone())?;

        let cancel = CancellationToken::new();
        let frames = runtime.spawn_frame_loop(cancel.child_token());
        let ticks = tokio::spawn(source.clone().run(cancel.child_token()));

        println!(
            "Simulating {} vehicles for {}s (Ctrl+C to stop)",
            args.vehicles, args.duration
        );
        let deadline = tokio::time::sleep(Duration::from_secs(args.duration));
        tokio::pin!(deadline);
        let mut report = tokio::time::interval(Duration::from_secs(args.report_every.max(1)));
        report.tick().await;

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = tokio::signal::ctrl_c() => {
                    println!("Interrupted");
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        if !args.quiet {
                            println!("  {}", describe(&event));
                        }
                    }
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "Simulation event log lagging"),
                    Err(RecvError::Closed) => break,
                },
                _ = report.tick() => {
                    if !args.quiet {
                        let diag = runtime.diagnostics();
                        let shown = runtime.layer_data("vehicles").map_or(0, |c| c.len());
                        println!(
                            "[{}] vehicles shown={} pending={} dropped={}",
                            diag.state,
                            shown,
                            diag.pending(),
                            diag.total_dropped()
                        );
                    }
                }
            }
        }

        cancel.cancel();
        if let Err(e) = ticks.await {
            warn!(error = %e, "Simulation task ended abnormally");
        }
        if let Err(e) = frames.await {
            warn!(error = %e, "Frame loop ended abnormally");
        }
        telemetry.destroy_all().await;
        runtime.flush()?;

        println!();
        println!("Map diagnostics");
        println!("===============");
        print!("{}", runtime.diagnostics());
        println!("Offline store");
        println!("=============");
        print!("{}", store.stats());

        runtime.destroy();
        Ok::<(), CliError>(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_center() {
        let center = parse_center(" 9.99 , 53.55 ").unwrap();
        assert_eq!(center, LngLat::new(9.99, 53.55));
        assert!(parse_center("9.99").is_err());
        assert!(parse_center("north,south").is_err());
        assert!(parse_center("200,10").is_err());
    }

    #[test]
    fn test_describe_delivery() {
        let line = describe(&SimEvent::DeliveryCompleted {
            vehicle_id: "veh-001".to_string(),
            stop_index: 0,
            delivered: 19,
            remaining_capacity: 57,
        });
        assert_eq!(line, "veh-001 delivered 19, 57 left");
    }
}
