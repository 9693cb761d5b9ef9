//! Samples a `Plan` on the device timeslice, carries fractional rounding
//! error between samples, and interleaves pen-up/pen-down transitions
//! between paths of a `Drawing`.

use tracing::{debug, info};

use crate::config::DeviceOptions;
use crate::device::DeviceModel;
use crate::error::DispatchError;
use crate::geometry::{Drawing, Path, Point, EPSILON};
use crate::planner::{plan, Instant, Plan};
use crate::protocol::{commands, ProtocolEngineHandle, Response};
use crate::throttle::throttle;

/// Sends a command and waits for its response. A `Timeout` is logged and
/// treated as non-fatal: the drawing continues; only a channel-level
/// failure (the engine itself gone) aborts dispatch.
pub(crate) async fn send(protocol: &ProtocolEngineHandle, cmd: String) -> Result<(), DispatchError> {
    match protocol.query(cmd, 1).await? {
        Response::Success { .. } => Ok(()),
        Response::Timeout { command, .. } => {
            tracing::warn!(%command, "protocol timeout during dispatch, continuing");
            Ok(())
        }
        Response::Failure { command, reason, .. } => {
            tracing::warn!(%command, %reason, "command rejected during dispatch, continuing");
            Ok(())
        }
    }
}

/// Servo position counts are linearly mapped from percent `[0,100]` to
/// `[7500, 28000]`.
fn servo_position(percent: u8) -> i64 {
    (7500.0 + 205.0 * percent as f64).round() as i64
}

/// Fractional-error carry state for one drawing: reset at the start of a
/// drawing, not between its paths.
struct ErrorCarry {
    x: f64,
    y: f64,
}

impl ErrorCarry {
    fn zero() -> Self {
        Self { x: 0.0, y: 0.0 }
    }
}

/// Dispatches an entire `Drawing`: pen-down, per-path sampling with
/// straight connectors between disjoint paths, pen-up.
pub async fn dispatch_drawing(
    drawing: &Drawing,
    options: &DeviceOptions,
    model: &DeviceModel,
    protocol: &ProtocolEngineHandle,
) -> Result<(), DispatchError> {
    let paths: Vec<&Path> = drawing.paths.iter().filter(|p| p.len() >= 2).collect();
    if paths.is_empty() {
        debug!("empty drawing, nothing to dispatch");
        return Ok(());
    }

    let mut carry = ErrorCarry::zero();

    pen_down(options, protocol).await?;

    for (i, path) in paths.iter().enumerate() {
        dispatch_path(path, options, model, protocol, &mut carry).await?;

        if let Some(next) = paths.get(i + 1) {
            let gap_start = path.last().expect("filtered to len >= 2");
            let gap_end = next.first().expect("filtered to len >= 2");
            if gap_start.distance(gap_end) > EPSILON {
                pen_up(options, protocol).await?;
                let connector = Path::new(vec![gap_start, gap_end]);
                dispatch_path(&connector, options, model, protocol, &mut carry).await?;
                pen_down(options, protocol).await?;
            }
        }
    }

    pen_up(options, protocol).await?;
    info!(paths = paths.len(), "drawing dispatched");
    Ok(())
}

async fn dispatch_path(
    path: &Path,
    options: &DeviceOptions,
    model: &DeviceModel,
    protocol: &ProtocolEngineHandle,
    carry: &mut ErrorCarry,
) -> Result<(), DispatchError> {
    let dt = options.timeslice_ms as f64 / 1000.0;
    let vmax = options.max_velocity.min(model.max_carriage_speed_mm_s);
    let tau = 1.0 / model.native_steps_per_mm;

    let velocities = throttle(&path.points, vmax, dt, tau);
    let trajectory = plan(path, &velocities, options.acceleration, vmax, options.corner_factor);

    if trajectory.total_time() <= EPSILON {
        return Ok(());
    }

    sample_and_emit(&trajectory, dt, options.steps_per_mm(), protocol, carry).await
}

async fn sample_and_emit(
    trajectory: &Plan,
    dt: f64,
    steps_per_mm: f64,
    protocol: &ProtocolEngineHandle,
    carry: &mut ErrorCarry,
) -> Result<(), DispatchError> {
    let total_time = trajectory.total_time();
    let mut prev: Instant = trajectory.at_time(0.0);
    let mut last_sample_t = 0.0;
    let mut t = dt;

    while t < total_time - EPSILON {
        let cur = trajectory.at_time(t);
        emit_step(&prev, &cur, dt, steps_per_mm, protocol, carry).await?;
        prev = cur;
        last_sample_t = t;
        t += dt;
    }

    let remaining = total_time - last_sample_t;
    if remaining > EPSILON {
        let cur = trajectory.at_time(total_time);
        emit_step(&prev, &cur, remaining, steps_per_mm, protocol, carry).await?;
    }

    Ok(())
}

async fn emit_step(
    prev: &Instant,
    cur: &Instant,
    duration_s: f64,
    steps_per_mm: f64,
    protocol: &ProtocolEngineHandle,
    carry: &mut ErrorCarry,
) -> Result<(), DispatchError> {
    let dx = cur.position.x - prev.position.x;
    let dy = cur.position.y - prev.position.y;

    let raw_x = dx * steps_per_mm + carry.x;
    let raw_y = dy * steps_per_mm + carry.y;

    let int_x = raw_x.floor();
    let int_y = raw_y.floor();
    carry.x = raw_x - int_x;
    carry.y = raw_y - int_y;

    let duration_ms = (duration_s * 1000.0).round() as u32;
    check_axis_rates(int_x, int_y, duration_s);
    let cmd = commands::stepper_move(duration_ms.max(1), int_x as i64, int_y as i64);
    send(protocol, cmd).await
}

/// CoreXY rate check: `axis1 = sx+sy`, `axis2 = sx-sy` must stay
/// within `[1.31, 25000]` steps/s per resolved axis. A zero-step move has
/// no rate to violate.
fn check_axis_rates(sx: f64, sy: f64, duration_s: f64) {
    if duration_s <= EPSILON {
        return;
    }
    const MIN_RATE: f64 = 1.31;
    const MAX_RATE: f64 = 25_000.0;
    for (label, resolved) in [("axis1", sx + sy), ("axis2", sx - sy)] {
        let rate = resolved.abs() / duration_s;
        if rate > EPSILON && !(MIN_RATE..=MAX_RATE).contains(&rate) {
            tracing::warn!(axis = label, rate, "resolved step rate outside device bounds");
        }
    }
}

/// `penUp`: `Δ = |penUp − penDown|`, `duration = 1000·Δ / penUpSpeed`,
/// `delay = max(0, duration + penUpDelay)`.
async fn pen_up(options: &DeviceOptions, protocol: &ProtocolEngineHandle) -> Result<(), DispatchError> {
    let delta = (options.pen_up_position as f64 - options.pen_down_position as f64).abs();
    let duration = if options.pen_up_speed == 0 {
        0.0
    } else {
        1000.0 * delta / options.pen_up_speed as f64
    };
    let delay = (duration + options.pen_up_delay as f64).max(0.0).round() as u32;
    send(protocol, commands::set_pen(1, Some(delay), None)).await
}

async fn pen_down(options: &DeviceOptions, protocol: &ProtocolEngineHandle) -> Result<(), DispatchError> {
    let delta = (options.pen_up_position as f64 - options.pen_down_position as f64).abs();
    let duration = if options.pen_down_speed == 0 {
        0.0
    } else {
        1000.0 * delta / options.pen_down_speed as f64
    };
    let delay = (duration + options.pen_down_delay as f64).max(0.0).round() as u32;
    send(protocol, commands::set_pen(0, Some(delay), None)).await
}

/// Servo parameter pair sent as part of the orchestrator's startup
/// sequence: `SC,4,upPos` / `SC,5,downPos`.
pub fn startup_servo_configure_commands(options: &DeviceOptions) -> Vec<String> {
    vec![
        commands::configure(4, servo_position(options.pen_up_position) as u32),
        commands::configure(5, servo_position(options.pen_down_position) as u32),
        commands::configure(11, options.pen_up_speed * 5),
        commands::configure(12, options.pen_down_speed * 5),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Path;
    use crate::protocol::{self, FakePort};

    fn options() -> DeviceOptions {
        DeviceOptions {
            timeslice_ms: 100,
            ..DeviceOptions::default()
        }
    }

    #[test]
    fn servo_position_maps_percent_range() {
        assert_eq!(servo_position(0), 7500);
        assert_eq!(servo_position(100), 28000);
    }

    #[tokio::test]
    async fn zero_length_path_emits_no_stepper_moves() {
        let (fake, _tx) = FakePort::new();
        let handle = protocol::spawn(fake.clone());
        let path = Path::new(vec![Point::new(1.0, 1.0)]);
        let drawing = Drawing::new(vec![path]);

        dispatch_drawing(&drawing, &options(), &DeviceModel::MINI_KIT_2, &handle)
            .await
            .unwrap();

        let written = fake.written_commands().await;
        assert!(written.iter().all(|c| !c.starts_with("XM")));
    }
}
