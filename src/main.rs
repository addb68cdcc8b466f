use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use log::{debug, info, warn};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, sleep, Duration, Instant};

mod live_status;
mod sensors;

use live_status::LiveStatus;
use peer_tracker_rs::config::EngineConfig;
use peer_tracker_rs::engine::{Engine, EngineEvent};
use peer_tracker_rs::error::TransportError;
use peer_tracker_rs::geodesy::{destination, latlon_to_meters, normalize_degrees};
use peer_tracker_rs::protocol::{self, LocationMessage};
use peer_tracker_rs::providers::PeerTransport;
use peer_tracker_rs::service::EngineService;
use peer_tracker_rs::types::{current_timestamp, SensorKind};
use sensors::{sensor_loop, true_stride, SimulatedLocation};

#[derive(Parser, Debug)]
#[command(name = "peer_tracker")]
#[command(about = "Orientation, step counting and peer distance/bearing over simulated sensors", long_about = None)]
struct Args {
    /// Duration in seconds (0 = until Ctrl-C)
    #[arg(value_name = "SECONDS", default_value = "60")]
    duration: u64,

    /// Output directory
    #[arg(long, default_value = "peer_tracker_sessions")]
    output_dir: String,

    /// JSON config file (any subset of the engine settings)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Device id advertised to peers
    #[arg(long)]
    device_id: Option<String>,

    /// Display name advertised to peers
    #[arg(long)]
    name: Option<String>,

    /// Number of simulated peers
    #[arg(long, default_value = "3")]
    peers: usize,

    /// Start latitude of the simulated walk
    #[arg(long, default_value = "35.681236", allow_negative_numbers = true)]
    lat: f64,

    /// Start longitude of the simulated walk
    #[arg(long, default_value = "139.767125", allow_negative_numbers = true)]
    lon: f64,

    /// Every Nth location request stalls past the timeout (0 = never)
    #[arg(long, default_value = "7")]
    stall_every: u64,

    /// Seconds between live_status.json writes
    #[arg(long, default_value = "2")]
    status_interval: u64,

    /// Steps to accumulate before each stride calibration (0 = never)
    #[arg(long, default_value = "20")]
    calibrate_steps: u64,
}

// ─── Loopback transport ──────────────────────────────────────────────────────

/// Stands in for the short-range radio: counts what would have been sent.
#[derive(Default)]
struct LoopbackTransport {
    connected: AtomicUsize,
    delivered: AtomicU64,
}

impl PeerTransport for LoopbackTransport {
    fn broadcast(&self, payload: Vec<u8>) -> impl Future<Output = Result<(), TransportError>> + Send {
        let connected = self.connected.load(Ordering::Relaxed);
        if connected > 0 {
            self.delivered.fetch_add(connected as u64, Ordering::Relaxed);
            debug!("[transport] {} bytes to {} peers", payload.len(), connected);
        }
        async move {
            if connected == 0 {
                return Err(TransportError::NoPeers);
            }
            Ok(())
        }
    }
}

// ─── Simulated peers ─────────────────────────────────────────────────────────

/// A peer walking a circle near the start point.
struct SimPeer {
    peer_id: String,
    device_id: String,
    name: String,
    center: (f64, f64),
    radius: f64,
    phase_deg: f64,
    sent: u64,
    leaves_at: Option<f64>,
    connected: bool,
}

const PEER_ANGULAR_RATE_DEG: f64 = 3.0;

impl SimPeer {
    fn new(index: usize, total: usize, origin: (f64, f64), leaves_at: Option<f64>) -> Self {
        let spread = 360.0 * index as f64 / total.max(1) as f64;
        Self {
            peer_id: format!("sim-{}", index),
            device_id: format!("device-{:04}", 1000 + index),
            name: format!("Walker {}", index + 1),
            center: destination(origin.0, origin.1, spread, 60.0 + 20.0 * index as f64),
            radius: 25.0,
            phase_deg: spread,
            sent: 0,
            leaves_at,
            connected: true,
        }
    }

    /// Next broadcast. Every 9th report is a multipath jump and every 13th is
    /// garbage, so the rejection paths run too.
    fn next_payload(&mut self, t: f64) -> Vec<u8> {
        self.sent += 1;
        if self.sent % 13 == 0 {
            return b"\x00\x01 not a location".to_vec();
        }

        let angle = normalize_degrees(self.phase_deg + PEER_ANGULAR_RATE_DEG * t);
        let (mut lat, lon) = destination(self.center.0, self.center.1, angle, self.radius);
        if self.sent % 9 == 0 {
            lat += 0.01;
        }
        let speed = self.radius * PEER_ANGULAR_RATE_DEG.to_radians();

        let msg = LocationMessage {
            id: self.device_id.clone(),
            name: self.name.clone(),
            latitude: lat,
            longitude: lon,
            accuracy: Some(6.0 + (self.sent % 5) as f64 * 3.0),
            speed: Some(speed),
            heading: Some(normalize_degrees(angle + 90.0)),
            timestamp: Some((current_timestamp() * 1000.0) as i64),
        };
        protocol::encode(&msg).unwrap_or_default()
    }
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::StepDetected(step) => debug!("Step {} heading {:.0}°", step.step_count, step.heading_deg),
        EngineEvent::StrideCalibrated(outcome) => info!("Stride calibration: {:?}", outcome),
        EngineEvent::SelfPositionUpdated(fix) => {
            debug!("Self at {:.6}, {:.6} ±{:.1} m", fix.latitude, fix.longitude, fix.accuracy)
        }
        EngineEvent::LocationFailed { error } => info!("Location unavailable: {}", error),
        EngineEvent::CapabilityLost => warn!("Location permission lost; fixes stop until re-granted"),
        EngineEvent::PeerUpdated { peer, update } => debug!(
            "{} ({:?}): {} m @ {}°",
            peer.name,
            update,
            peer.distance_m.map_or("?".to_string(), |d| format!("{:.0}", d)),
            peer.bearing_deg.map_or("?".to_string(), |b| format!("{:.0}", b)),
        ),
        EngineEvent::PeerRejected { peer_id, reason } => info!("Rejected report from {}: {:?}", peer_id, reason),
        EngineEvent::PeerRemoved { peer_id } => info!("Peer {} left", peer_id),
        other => debug!("{:?}", other),
    }
}

fn save_status(path: &Path, status: &LiveStatus) {
    if let Err(e) = status.save(path) {
        warn!("Failed to write {}: {}", path.display(), e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path).with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(id) = &args.device_id {
        config.identity.device_id = id.clone();
    }
    if let Some(name) = &args.name {
        config.identity.display_name = name.clone();
    }
    config.validate()?;

    info!("Peer Tracker starting");
    info!("  Duration: {} seconds (0=until Ctrl-C)", args.duration);
    info!("  Identity: {} ({})", config.identity.display_name, config.identity.device_id);
    info!("  Simulated peers: {}", args.peers);
    info!("  Output Dir: {}", args.output_dir);

    std::fs::create_dir_all(&args.output_dir)?;
    let status_path = Path::new(&args.output_dir).join("live_status.json");

    let start = Instant::now();
    let origin = (args.lat, args.lon);
    let transport = Arc::new(LoopbackTransport::default());
    let provider = SimulatedLocation::new(origin, start, args.stall_every);
    let handle = EngineService::spawn(Engine::new(config), provider, transport.clone());

    let mut events = handle.subscribe();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => warn!("Event log fell behind, skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let sink = handle.sensor_sink();
    let sensor_tasks = vec![
        tokio::spawn(sensor_loop(SensorKind::Accelerometer, Duration::from_millis(10), sink.clone(), start)),
        tokio::spawn(sensor_loop(SensorKind::Gyroscope, Duration::from_millis(10), sink.clone(), start)),
        tokio::spawn(sensor_loop(SensorKind::Magnetometer, Duration::from_millis(20), sink.clone(), start)),
    ];

    // one peer walks away three quarters of the way through a timed run
    let leave = (args.duration > 0).then(|| args.duration as f64 * 0.75);
    let mut peers: Vec<SimPeer> = (0..args.peers)
        .map(|i| SimPeer::new(i, args.peers, origin, if i == 0 { leave } else { None }))
        .collect();
    transport.connected.store(peers.len(), Ordering::Relaxed);

    let mut peer_tick = interval(Duration::from_secs(2));
    let mut status_tick = interval(Duration::from_secs(args.status_interval.max(1)));
    let deadline = sleep(Duration::from_secs(args.duration));
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!("Starting simulation...");

    loop {
        tokio::select! {
            _ = peer_tick.tick() => {
                let t = start.elapsed().as_secs_f64();
                for peer in peers.iter_mut().filter(|p| p.connected) {
                    if peer.leaves_at.is_some_and(|at| t >= at) {
                        peer.connected = false;
                        transport.connected.fetch_sub(1, Ordering::Relaxed);
                        handle.peer_disconnected(peer.peer_id.clone()).await?;
                        continue;
                    }
                    handle.peer_payload(peer.peer_id.clone(), peer.next_payload(t)).await?;
                }
            }
            _ = status_tick.tick() => {
                let snapshot = handle.snapshot();
                let status = LiveStatus::from_snapshot(&snapshot, start.elapsed().as_secs(), sink.dropped());
                save_status(&status_path, &status);

                info!(
                    "heading {:.0}° rel {:.0} | steps {} stride {:.2} m | peers {}",
                    status.heading_deg, status.reliability, status.step_count, status.stride_length, status.peers.len()
                );

                if args.calibrate_steps > 0 && snapshot.pdr.steps_since_calibration >= args.calibrate_steps {
                    let walked = snapshot.pdr.steps_since_calibration as f64 * true_stride();
                    handle.calibrate_since_last(walked).await?;
                }
            }
            _ = &mut deadline, if args.duration > 0 => {
                info!("Duration reached");
                break;
            }
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
        }
    }

    let dropped = sink.dropped();
    let engine = handle.stop().await?;
    for task in sensor_tasks {
        let _ = task.await;
    }
    event_task.await?;

    let snapshot = engine.snapshot();
    let status = LiveStatus::from_snapshot(&snapshot, start.elapsed().as_secs(), dropped);
    save_status(&status_path, &status);

    let session_path = Path::new(&args.output_dir)
        .join(format!("session_{}.json", Utc::now().format("%Y%m%d_%H%M%S")));
    std::fs::write(&session_path, serde_json::to_string_pretty(&snapshot)?)?;

    info!("=== Final Summary ===");
    info!("  Steps: {} (stride {:.2} m)", snapshot.pdr.step_count, snapshot.pdr.stride_length);
    info!("  PDR offset: {:.1} m E, {:.1} m N", snapshot.pdr.offset_x, snapshot.pdr.offset_y);
    if let Some(fix) = snapshot.self_fix {
        let (east, north) = latlon_to_meters(fix.latitude, fix.longitude, origin.0, origin.1);
        info!("  Fix offset: {:.1} m E, {:.1} m N (±{:.0} m)", east, north, fix.accuracy);
    }
    info!("  Heading: {:.1}° (reliability {:.0})", snapshot.orientation.heading_deg, snapshot.orientation.reliability);
    for peer in &snapshot.peers {
        info!(
            "  {}: {} m @ {}°",
            peer.name,
            peer.distance_m.map_or("?".to_string(), |d| format!("{:.0}", d)),
            peer.bearing_deg.map_or("?".to_string(), |b| format!("{:.0}", b)),
        );
    }
    info!("  Reports delivered to peers: {}", transport.delivered.load(Ordering::Relaxed));
    info!("  Sensor samples dropped: {}", dropped);
    info!("  Session saved to {}", session_path.display());

    Ok(())
}
