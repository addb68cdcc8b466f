// service.rs — Async runtime around the Engine
//
// One task owns the Engine and applies commands from a single mpsc channel,
// so sensor streams, peer payloads and location fixes are serialized without
// locks. A second task runs the self-position refresh: every period it asks
// the LocationProvider for a fix (bounded by a timeout), hands the result to
// the engine, then broadcasts our own report through the PeerTransport.
//
// Outputs: change events on a broadcast channel, latest snapshot on a watch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, Instant, MissedTickBehavior};

use crate::engine::{Engine, EngineEvent, EngineSnapshot};
use crate::error::{EngineError, LocationError, TransportError};
use crate::filters::CalibrationOutcome;
use crate::providers::{LocationProvider, PeerTransport};
use crate::types::{current_timestamp, LocationFix, SensorSample};

// ─── Commands ────────────────────────────────────────────────────────────────

enum Command {
    Sensor(SensorSample),
    LocationFix(LocationFix),
    LocationError(LocationError),
    PeerPayload { peer_id: String, payload: Vec<u8>, received_at: f64 },
    PeerDisconnected(String),
    DisconnectAll,
    Calibrate { distance: f64, steps: Option<u32>, reply: oneshot::Sender<CalibrationOutcome> },
    ResetPdr,
    Outbound(oneshot::Sender<Option<Vec<u8>>>),
    Stop,
}

// ─── Sensor intake ───────────────────────────────────────────────────────────

/// Cheap-to-clone producer handle for one or more sensor streams.
///
/// Never blocks: when the engine is behind, samples are dropped and counted.
#[derive(Clone)]
pub struct SensorSink {
    tx: mpsc::Sender<Command>,
    dropped: Arc<AtomicU64>,
}

impl SensorSink {
    pub fn push(&self, sample: SensorSample) -> Result<(), EngineError> {
        match self.tx.try_send(Command::Sensor(sample)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(EngineError::Stopped),
        }
    }

    /// Samples dropped because the command channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ─── Receipt clock ───────────────────────────────────────────────────────────

/// Wall-clock seconds anchored once, then advanced by the monotonic clock,
/// so peer receipt times never step backwards with the system clock.
#[derive(Clone, Copy)]
struct ReceiptClock {
    wall_origin: f64,
    origin: Instant,
}

impl ReceiptClock {
    fn start() -> Self {
        Self { wall_origin: current_timestamp(), origin: Instant::now() }
    }

    fn now(&self) -> f64 {
        self.wall_origin + self.origin.elapsed().as_secs_f64()
    }
}

// ─── Handle ──────────────────────────────────────────────────────────────────

pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<EngineEvent>,
    snapshots: watch::Receiver<EngineSnapshot>,
    dropped: Arc<AtomicU64>,
    clock: ReceiptClock,
    actor: JoinHandle<Engine>,
    refresh: JoinHandle<()>,
}

impl EngineHandle {
    pub fn sensor_sink(&self) -> SensorSink {
        SensorSink { tx: self.commands.clone(), dropped: self.dropped.clone() }
    }

    pub async fn peer_payload(&self, peer_id: impl Into<String>, payload: Vec<u8>) -> Result<(), EngineError> {
        let received_at = self.clock.now();
        self.send(Command::PeerPayload { peer_id: peer_id.into(), payload, received_at }).await
    }

    pub async fn peer_disconnected(&self, peer_id: impl Into<String>) -> Result<(), EngineError> {
        self.send(Command::PeerDisconnected(peer_id.into())).await
    }

    pub async fn disconnect_all(&self) -> Result<(), EngineError> {
        self.send(Command::DisconnectAll).await
    }

    pub async fn calibrate(&self, distance: f64, steps: u32) -> Result<CalibrationOutcome, EngineError> {
        self.calibrate_with(distance, Some(steps)).await
    }

    /// Calibrate over the steps counted since the last accepted calibration.
    pub async fn calibrate_since_last(&self, distance: f64) -> Result<CalibrationOutcome, EngineError> {
        self.calibrate_with(distance, None).await
    }

    async fn calibrate_with(&self, distance: f64, steps: Option<u32>) -> Result<CalibrationOutcome, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Calibrate { distance, steps, reply }).await?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    pub async fn reset_pdr(&self) -> Result<(), EngineError> {
        self.send(Command::ResetPdr).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch_snapshots(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshots.clone()
    }

    /// Cancel the refresh cycle, drain queued commands and hand the engine
    /// back. Sensor sinks report `EngineError::Stopped` afterwards.
    pub async fn stop(self) -> Result<Engine, EngineError> {
        self.refresh.abort();
        let _ = self.refresh.await;

        // if the actor is already gone the join below reports why
        let _ = self.commands.send(Command::Stop).await;
        let engine = self.actor.await.map_err(|e| EngineError::TaskFailed(e.to_string()))?;
        info!("Engine stopped ({} sensor samples dropped)", self.dropped.load(Ordering::Relaxed));
        Ok(engine)
    }

    async fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands.send(command).await.map_err(|_| EngineError::Stopped)
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

pub struct EngineService;

impl EngineService {
    /// Start the engine task and the refresh task on the current runtime.
    pub fn spawn<L, T>(engine: Engine, provider: L, transport: T) -> EngineHandle
    where
        L: LocationProvider,
        T: PeerTransport,
    {
        let timing = engine.config().refresh.clone();
        let (commands, rx) = mpsc::channel(timing.command_buffer);
        let (events, _) = broadcast::channel(timing.event_buffer);
        let (snapshot_tx, snapshots) = watch::channel(engine.snapshot());

        let actor = tokio::spawn(run_engine(
            engine,
            rx,
            events.clone(),
            snapshot_tx,
            Duration::from_secs_f64(timing.snapshot_interval_secs),
        ));
        let refresh = tokio::spawn(refresh_loop(
            provider,
            transport,
            commands.clone(),
            Duration::from_secs_f64(timing.period_secs),
            Duration::from_secs_f64(timing.timeout_secs),
        ));
        info!("Engine service started");

        EngineHandle {
            commands,
            events,
            snapshots,
            dropped: Arc::new(AtomicU64::new(0)),
            clock: ReceiptClock::start(),
            actor,
            refresh,
        }
    }
}

// ─── Engine task ─────────────────────────────────────────────────────────────

async fn run_engine(
    mut engine: Engine,
    mut commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<EngineEvent>,
    snapshots: watch::Sender<EngineSnapshot>,
    snapshot_interval: Duration,
) -> Engine {
    let mut publish = interval(snapshot_interval);
    publish.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut dirty = false;

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                let out = match command {
                    Command::Stop => break,
                    Command::Sensor(sample) => {
                        let out = engine.ingest_sensor(&sample);
                        if out.is_empty() {
                            dirty = true;
                            continue;
                        }
                        out
                    }
                    Command::LocationFix(fix) => engine.on_location_fix(&fix),
                    Command::LocationError(error) => engine.on_location_error(error),
                    Command::PeerPayload { peer_id, payload, received_at } => {
                        engine.on_peer_payload(&peer_id, &payload, received_at)
                    }
                    Command::PeerDisconnected(peer_id) => engine.on_peer_disconnected(&peer_id),
                    Command::DisconnectAll => engine.disconnect_all(),
                    Command::Calibrate { distance, steps, reply } => {
                        let out = match steps {
                            Some(steps) => engine.calibrate(distance, steps),
                            None => engine.calibrate_since_last(distance),
                        };
                        if let Some(outcome) = out.iter().find_map(|e| match e {
                            EngineEvent::StrideCalibrated(outcome) => Some(*outcome),
                            _ => None,
                        }) {
                            let _ = reply.send(outcome);
                        }
                        out
                    }
                    Command::ResetPdr => engine.reset_pdr(),
                    Command::Outbound(reply) => {
                        let _ = reply.send(engine.outbound_payload());
                        continue;
                    }
                };

                snapshots.send_replace(engine.snapshot());
                dirty = false;
                for event in out {
                    // no subscribers is fine
                    let _ = events.send(event);
                }
            }
            _ = publish.tick(), if dirty => {
                snapshots.send_replace(engine.snapshot());
                dirty = false;
            }
        }
    }

    snapshots.send_replace(engine.snapshot());
    engine
}

// ─── Self-position refresh ───────────────────────────────────────────────────

async fn refresh_loop<L, T>(
    provider: L,
    transport: T,
    commands: mpsc::Sender<Command>,
    period: Duration,
    limit: Duration,
) where
    L: LocationProvider,
    T: PeerTransport,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycles = 0u64;

    loop {
        ticker.tick().await;
        cycles += 1;

        let command = match timeout(limit, provider.request_fix()).await {
            Ok(Ok(fix)) => Command::LocationFix(fix),
            Ok(Err(error)) => Command::LocationError(error),
            Err(_) => Command::LocationError(LocationError::Timeout(limit.as_secs_f64())),
        };
        if commands.send(command).await.is_err() {
            break;
        }

        let (reply, rx) = oneshot::channel();
        if commands.send(Command::Outbound(reply)).await.is_err() {
            break;
        }
        let Ok(payload) = rx.await else { break };
        let Some(payload) = payload else {
            debug!("[refresh] cycle {}: no self-position to report yet", cycles);
            continue;
        };

        match transport.broadcast(payload).await {
            Ok(()) => debug!("[refresh] cycle {}: report broadcast", cycles),
            Err(TransportError::NoPeers) => debug!("[refresh] cycle {}: no peers connected", cycles),
            Err(e) => warn!("[refresh] cycle {}: broadcast failed: {}", cycles, e),
        }
    }
}
