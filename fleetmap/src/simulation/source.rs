//! The simulation as a real-time source.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::engine::{SimEvent, SimulationEngine};
use crate::entities::{UpdateBatch, Vehicle};
use crate::runtime::UpdateSink;
use crate::telemetry::{ChannelSource, RealtimeSource, SourceError};

/// Capacity of the simulation event channel.
pub const SIM_EVENT_CAPACITY: usize = 256;

/// Drives a [`SimulationEngine`] on a timer and publishes vehicle deltas
/// exactly like a live backend would.
pub struct SimulationSource {
    engine: Mutex<SimulationEngine>,
    channel: Arc<ChannelSource<Vehicle>>,
    events: broadcast::Sender<SimEvent>,
    trail_sink: Option<Arc<dyn UpdateSink>>,
}

impl SimulationSource {
    pub fn new(id: impl Into<String>, engine: SimulationEngine) -> Self {
        let channel = ChannelSource::new(id);
        channel.set_snapshot(engine.vehicles());
        let (events, _) = broadcast::channel(SIM_EVENT_CAPACITY);
        Self {
            engine: Mutex::new(engine),
            channel,
            events,
            trail_sink: None,
        }
    }

    /// Also push trail buffers to `sink` after every tick.
    pub fn with_trail_sink(mut self, sink: Arc<dyn UpdateSink>) -> Self {
        self.trail_sink = Some(sink);
        self
    }

    pub fn events(&self) -> broadcast::Receiver<SimEvent> {
        self.events.subscribe()
    }

    /// Run `f` against the engine.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut SimulationEngine) -> R) -> R {
        f(&mut self.engine.lock())
    }

    /// Advance by `dt` and publish the result. Returns the step's events.
    pub fn tick(&self, dt: Duration) -> Vec<SimEvent> {
        let (vehicles, trails, events) = {
            let mut engine = self.engine.lock();
            let events = engine.step(dt);
            let trails = self.trail_sink.is_some().then(|| engine.trails());
            (engine.vehicles(), trails, events)
        };

        self.channel.publish(vehicles);
        if let (Some(sink), Some(trails)) = (&self.trail_sink, trails) {
            if let Err(e) = sink.submit(UpdateBatch::live().with_trails(trails)) {
                debug!(error = %e, "Trail update rejected");
            }
        }
        for event in &events {
            // No listeners is fine.
            let _ = self.events.send(event.clone());
        }
        events
    }

    /// Tick on the configured interval until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let (interval, step) = self.with_engine(|e| {
            let config = e.config();
            (config.tick, config.tick.mul_f64(config.time_scale))
        });
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        info!(
            source = %self.channel.id(),
            tick_ms = interval.as_millis() as u64,
            "Simulation started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(step);
                }
            }
        }
        info!(source = %self.channel.id(), "Simulation stopped");
    }
}

impl RealtimeSource<Vehicle> for SimulationSource {
    fn id(&self) -> &str {
        self.channel.id()
    }

    fn snapshot(&self) -> BoxFuture<'_, Result<Vec<Vehicle>, SourceError>> {
        let vehicles = self.engine.lock().vehicles();
        Box::pin(async move { Ok(vehicles) })
    }

    fn subscribe(&self) -> mpsc::Receiver<Vec<Vehicle>> {
        self.channel.subscribe()
    }
}
