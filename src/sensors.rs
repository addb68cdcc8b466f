// Simulated device: a pedestrian walking a slow left-hand curve.
//
// Each sensor stream is its own producer task feeding the engine's sink at
// its native rate. The location provider follows the same walk and
// occasionally stalls so the refresh timeout gets exercised.

use std::f64::consts::PI;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info};
use tokio::time::{interval, sleep, Duration, Instant};

use peer_tracker_rs::error::{EngineError, LocationError};
use peer_tracker_rs::geodesy::{destination, normalize_degrees};
use peer_tracker_rs::providers::LocationProvider;
use peer_tracker_rs::service::SensorSink;
use peer_tracker_rs::types::{current_timestamp, LocationFix, SensorKind, SensorSample};

pub const WALK_SPEED: f64 = 1.3;
pub const CADENCE_HZ: f64 = 1.8;
/// Yaw rate of the walk (rad/s, positive = turning left).
const YAW_RATE: f64 = 0.02;
const HEEL_STRIKE_SECS: f64 = 0.02;
const FIELD_NORTH: f64 = 30.0;
const FIELD_DOWN: f64 = 35.0;

/// Stride the simulated walker actually takes.
pub fn true_stride() -> f64 {
    WALK_SPEED / CADENCE_HZ
}

/// Compass heading of the walker `t` seconds into the walk.
pub fn heading_at(t: f64) -> f64 {
    normalize_degrees(-(YAW_RATE * t).to_degrees())
}

pub async fn sensor_loop(kind: SensorKind, period: Duration, sink: SensorSink, start: Instant) {
    let mut ticker = interval(period);
    let mut sample_count = 0u64;

    loop {
        ticker.tick().await;
        let t = start.elapsed().as_secs_f64();

        match sink.push(mock_sample(kind, t)) {
            Ok(()) => {
                sample_count += 1;
                if sample_count % 1000 == 0 {
                    debug!("[{:?}] {} samples", kind, sample_count);
                }
            }
            Err(EngineError::Stopped) | Err(EngineError::TaskFailed(_)) => {
                info!("[{:?}] Engine stopped after {} samples", kind, sample_count);
                break;
            }
        }
    }
}

fn mock_sample(kind: SensorKind, t: f64) -> SensorSample {
    let ts = current_timestamp();
    let yaw = YAW_RATE * t;

    match kind {
        SensorKind::Accelerometer => {
            let phase = (t * CADENCE_HZ).fract() / CADENCE_HZ;
            let strike = if phase < HEEL_STRIKE_SECS { 3.0 } else { 0.0 };
            SensorSample::accel(
                ts,
                (t * 2.0 * PI * CADENCE_HZ).sin() * 0.3,
                (t * 2.0 * PI * CADENCE_HZ).cos() * 0.2,
                9.81 + strike,
            )
        }
        SensorKind::Gyroscope => SensorSample::gyro(
            ts,
            (t * 0.5).sin() * 0.01,
            (t * 0.3).cos() * 0.01,
            YAW_RATE,
        ),
        // earth field seen from a device yawed by `yaw` in the NWU frame
        SensorKind::Magnetometer => SensorSample::mag(
            ts,
            FIELD_NORTH * yaw.cos(),
            -FIELD_NORTH * yaw.sin(),
            -FIELD_DOWN,
        ),
    }
}

// ─── Location ────────────────────────────────────────────────────────────────

pub struct SimulatedLocation {
    origin: (f64, f64),
    start: Instant,
    calls: AtomicU64,
    stall_every: u64,
}

impl SimulatedLocation {
    pub fn new(origin: (f64, f64), start: Instant, stall_every: u64) -> Self {
        Self { origin, start, calls: AtomicU64::new(0), stall_every }
    }

    /// Walker position `t` seconds in, integrating the curve in 1 s legs.
    pub fn position_at(origin: (f64, f64), t: f64) -> (f64, f64) {
        let mut pos = origin;
        let mut elapsed = 0.0;
        while elapsed < t {
            let leg = (t - elapsed).min(1.0);
            pos = destination(pos.0, pos.1, heading_at(elapsed), WALK_SPEED * leg);
            elapsed += leg;
        }
        pos
    }
}

impl LocationProvider for SimulatedLocation {
    fn request_fix(&self) -> impl Future<Output = Result<LocationFix, LocationError>> + Send {
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        let t = self.start.elapsed().as_secs_f64();
        let (lat, lon) = Self::position_at(self.origin, t);
        let stall = self.stall_every > 0 && n % self.stall_every == 0;

        async move {
            if stall {
                // longer than any sane refresh timeout
                sleep(Duration::from_secs(60)).await;
            }
            let jitter = (n as f64 * 1.7).sin();
            Ok(LocationFix {
                timestamp: current_timestamp(),
                latitude: lat + jitter * 2e-5,
                longitude: lon - jitter * 2e-5,
                accuracy: 8.0 + jitter.abs() * 6.0,
                speed: Some(WALK_SPEED),
                heading: Some(heading_at(t)),
            })
        }
    }
}
