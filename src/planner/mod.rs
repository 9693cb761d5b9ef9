//! Converts a throttled polyline into a sequence of constant-acceleration
//! motion [`Block`]s, and the immutable [`Plan`] that lets the dispatcher
//! sample position/velocity/acceleration at any time.

use crate::geometry::{Path, Point, EPSILON};

/// Tolerance for velocity comparisons.
const VELOCITY_EPSILON: f64 = 1e-6;

/// A constant-acceleration motion element. `a == 0.0` is a cruise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Block {
    pub a: f64,
    pub t: f64,
    pub vi: f64,
    pub p1: Point,
    pub p2: Point,
}

impl Block {
    fn length(&self) -> f64 {
        self.p1.distance(self.p2)
    }

    fn clamp_local_time(&self, t_local: f64) -> f64 {
        t_local.clamp(0.0, self.t)
    }

    fn velocity_at(&self, t_local: f64) -> f64 {
        let t_local = self.clamp_local_time(t_local);
        self.vi + self.a * t_local
    }

    fn distance_at(&self, t_local: f64) -> f64 {
        let t_local = self.clamp_local_time(t_local);
        let raw = self.vi * t_local + 0.5 * self.a * t_local * t_local;
        raw.clamp(0.0, self.length())
    }

    fn position_at(&self, t_local: f64) -> Point {
        self.p1.lerp(self.p2, self.distance_at(t_local))
    }
}

/// An internal planner entity: one geometric edge of the polyline plus
/// the mutable bookkeeping the forward/backward pass needs. Dropped once
/// the plan is produced.
struct Segment {
    p1: Point,
    p2: Point,
    direction: Point,
    length: f64,
    max_entry_velocity: f64,
    entry_velocity: f64,
    blocks: Vec<Block>,
}

impl Segment {
    fn new(p1: Point, p2: Point) -> Self {
        let length = p1.distance(p2);
        let direction = if length > EPSILON {
            Point::new((p2.x - p1.x) / length, (p2.y - p1.y) / length)
        } else {
            Point::new(0.0, 0.0)
        };
        Self {
            p1,
            p2,
            direction,
            length,
            max_entry_velocity: f64::INFINITY,
            entry_velocity: 0.0,
            blocks: Vec::new(),
        }
    }
}

/// A sample of the plan at a particular time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instant {
    pub t: f64,
    pub position: Point,
    pub distance: f64,
    pub velocity: f64,
    pub acceleration: f64,
}

/// The immutable output of the planner: a sequence of blocks plus a
/// prefix-sum index over time and distance.
#[derive(Debug, Clone)]
pub struct Plan {
    blocks: Vec<Block>,
    prefix_time: Vec<f64>,
    prefix_distance: Vec<f64>,
    origin: Point,
}

impl Plan {
    fn empty(origin: Point) -> Self {
        Self {
            blocks: Vec::new(),
            prefix_time: vec![0.0],
            prefix_distance: vec![0.0],
            origin,
        }
    }

    fn from_blocks(blocks: Vec<Block>, origin: Point) -> Self {
        let mut prefix_time = Vec::with_capacity(blocks.len() + 1);
        let mut prefix_distance = Vec::with_capacity(blocks.len() + 1);
        prefix_time.push(0.0);
        prefix_distance.push(0.0);
        for b in &blocks {
            prefix_time.push(prefix_time.last().unwrap() + b.t);
            prefix_distance.push(prefix_distance.last().unwrap() + b.length());
        }
        Self {
            blocks,
            prefix_time,
            prefix_distance,
            origin,
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn total_time(&self) -> f64 {
        *self.prefix_time.last().unwrap()
    }

    pub fn total_distance(&self) -> f64 {
        *self.prefix_distance.last().unwrap()
    }

    /// Evaluates the plan at time `t`, clamped to `[0, total_time()]`.
    pub fn at_time(&self, t: f64) -> Instant {
        let t = t.clamp(0.0, self.total_time());

        if self.blocks.is_empty() {
            return Instant {
                t,
                position: self.origin,
                distance: 0.0,
                velocity: 0.0,
                acceleration: 0.0,
            };
        }

        // Largest index `k` such that prefix_time[k] <= t.
        let idx = match self
            .prefix_time
            .binary_search_by(|pt| pt.partial_cmp(&t).unwrap())
        {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        }
        .min(self.blocks.len() - 1);

        let block = &self.blocks[idx];
        let t_local = t - self.prefix_time[idx];

        Instant {
            t,
            position: block.position_at(t_local),
            distance: self.prefix_distance[idx] + block.distance_at(t_local),
            velocity: block.velocity_at(t_local),
            acceleration: block.a,
        }
    }
}

/// Junction corner-velocity derating. `cos` is `-d1.dot(d2)` for unit
/// incoming/outgoing directions `d1`, `d2`.
///
/// The two epsilon guards are load-bearing, not an approximation to clean
/// up: the underlying `sin/(1-sin)` ratio is singular at `sin -> 0`
/// (straight-through), which is the opposite of what a straight-through
/// junction should produce, so the straight-through and reverse cases are
/// special-cased explicitly rather than left to the general formula.
fn corner_velocity(cos: f64, acceleration: f64, corner_factor: f64, vmax: f64) -> f64 {
    if (cos - 1.0).abs() < EPSILON {
        return 0.0;
    }
    let sin = ((1.0 - cos) / 2.0).max(0.0).sqrt();
    if (sin - 1.0).abs() < EPSILON {
        return vmax;
    }
    let ratio = sin / (1.0 - sin);
    vmax.min((acceleration * corner_factor * ratio).sqrt())
}

/// Plans `path` into a [`Plan`] using constant acceleration `acceleration`,
/// ceiling velocity `vmax`, corner derating constant `corner_factor`, and
/// the per-vertex throttled velocities `throttled` (same length as
/// `path.points`, as produced by [`crate::throttle::throttle`]).
pub fn plan(path: &Path, throttled: &[f64], acceleration: f64, vmax: f64, corner_factor: f64) -> Plan {
    let points = &path.points;
    let origin = points.first().copied().unwrap_or(Point::new(0.0, 0.0));

    if points.len() < 2 {
        return Plan::empty(origin);
    }

    let n_real = points.len() - 1;
    let mut segments: Vec<Segment> = (0..n_real)
        .map(|i| Segment::new(points[i], points[i + 1]))
        .collect();
    // Trailing zero-length sentinel: its max_entry_velocity (0.0) is the
    // boundary condition forcing the final segment to decelerate to a stop.
    let last_point = points[points.len() - 1];
    let mut sentinel = Segment::new(last_point, last_point);
    sentinel.max_entry_velocity = 0.0;

    segments[0].max_entry_velocity = f64::INFINITY;
    segments[0].entry_velocity = 0.0;

    for k in 0..n_real.saturating_sub(1) {
        let cos = -segments[k].direction.dot(segments[k + 1].direction);
        let v_corner = corner_velocity(cos, acceleration, corner_factor, vmax);
        segments[k + 1].max_entry_velocity = v_corner;
        let throttled_at_junction = throttled.get(k + 1).copied().unwrap_or(vmax);
        segments[k].max_entry_velocity = segments[k].max_entry_velocity.min(throttled_at_junction);
    }

    let mut k = 0usize;
    while k < n_real {
        let s = segments[k].length;
        let vi = segments[k].entry_velocity;
        let vexit = if k + 1 < n_real {
            segments[k + 1].max_entry_velocity
        } else {
            sentinel.max_entry_velocity
        };

        let s1 = (2.0 * acceleration * s + vexit * vexit - vi * vi) / (4.0 * acceleration);
        let s2 = s - s1;
        let vpeak_sq = (vi * vi + 2.0 * acceleration * s1).max(0.0);
        let vpeak = vpeak_sq.sqrt();

        if s1 < -EPSILON {
            let new_ceiling = (vexit * vexit + 2.0 * acceleration * s).sqrt();
            segments[k].max_entry_velocity = segments[k].max_entry_velocity.min(new_ceiling);
            if k > 0 {
                k -= 1;
                continue;
            } else {
                k += 1;
                continue;
            }
        }

        if s2 < 0.0 {
            // Pure acceleration: the segment is too short to reach vpeak
            // and decelerate, so accelerate the whole way.
            let vf = (vi * vi + 2.0 * acceleration * s).sqrt();
            let p1 = segments[k].p1;
            let p2 = segments[k].p2;
            segments[k].blocks.clear();
            push_block(&mut segments[k], acceleration, vi, vf, p1, p2);
            if k + 1 < n_real {
                segments[k + 1].entry_velocity = vf;
            }
            k += 1;
            continue;
        }

        if vpeak > vmax + VELOCITY_EPSILON {
            // Trapezoid: accelerate to vmax, cruise, decelerate to vexit.
            let t1 = (vmax - vi) / acceleration;
            let s1 = 0.5 * (vmax + vi) * t1;
            let t3 = (vmax - vexit) / acceleration;
            let s3 = 0.5 * (vmax + vexit) * t3;
            let s2 = (s - s1 - s3).max(0.0);
            let t2 = if vmax > EPSILON { s2 / vmax } else { 0.0 };

            let p1 = segments[k].p1;
            let p2 = segments[k].p2;
            let accel_end = p1.lerp(p2, s1);
            let cruise_end = p1.lerp(p2, s1 + s2);

            let seg = &mut segments[k];
            seg.blocks.clear();
            if t1 > EPSILON {
                seg.blocks.push(Block { a: acceleration, t: t1, vi, p1, p2: accel_end });
            }
            if t2 > EPSILON {
                seg.blocks.push(Block { a: 0.0, t: t2, vi: vmax, p1: accel_end, p2: cruise_end });
            }
            if t3 > EPSILON {
                seg.blocks.push(Block { a: -acceleration, t: t3, vi: vmax, p1: cruise_end, p2 });
            }

            if k + 1 < n_real {
                segments[k + 1].entry_velocity = vexit;
            }
            k += 1;
            continue;
        }

        // Pure triangle: accelerate to vpeak, decelerate to vexit.
        let t1 = (vpeak - vi) / acceleration;
        let t2 = (vpeak - vexit) / acceleration;
        let p1 = segments[k].p1;
        let p2 = segments[k].p2;
        let mid = p1.lerp(p2, s1);

        let seg = &mut segments[k];
        seg.blocks.clear();
        if t1 > EPSILON {
            seg.blocks.push(Block { a: acceleration, t: t1, vi, p1, p2: mid });
        }
        if t2 > EPSILON {
            seg.blocks.push(Block { a: -acceleration, t: t2, vi: vpeak, p1: mid, p2 });
        }

        if k + 1 < n_real {
            segments[k + 1].entry_velocity = vexit;
        }
        k += 1;
    }

    let blocks: Vec<Block> = segments
        .into_iter()
        .flat_map(|s| s.blocks.into_iter())
        .filter(|b| b.t > EPSILON)
        .collect();

    Plan::from_blocks(blocks, origin)
}

fn push_block(seg: &mut Segment, a: f64, vi: f64, vf: f64, p1: Point, p2: Point) {
    let t = (vf - vi) / a;
    seg.blocks.push(Block { a, t, vi, p1, p2 });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Path;
    use crate::throttle::throttle;

    fn flat_throttle(path: &Path, vmax: f64) -> Vec<f64> {
        vec![vmax; path.points.len()]
    }

    #[test]
    fn zero_length_polyline_has_zero_time_and_no_blocks() {
        let path = Path::new(vec![Point::new(1.0, 1.0)]);
        let v = flat_throttle(&path, 4.0);
        let p = plan(&path, &v, 16.0, 4.0, 0.001);
        assert_eq!(p.total_time(), 0.0);
        assert!(p.blocks().is_empty());
        assert_eq!(p.at_time(0.0).position, Point::new(1.0, 1.0));
    }

    #[test]
    fn total_distance_matches_polyline_length() {
        let path = Path::new(vec![
            Point::new(0.0, 0.0),
            Point::new(0.0, 10.0),
            Point::new(10.0, 10.0),
            Point::new(10.0, 0.0),
            Point::new(0.0, 0.0),
        ]);
        let v = throttle(&path.points, 4.0, 0.1, 0.05);
        let p = plan(&path, &v, 16.0, 4.0, 0.001);
        assert!((p.total_distance() - path.arc_length()).abs() < 1e-6);
    }

    #[test]
    fn block_continuity() {
        let path = Path::new(vec![Point::new(0.0, 0.0), Point::new(10.0, 10.0)]);
        let v = flat_throttle(&path, 4.0);
        let p = plan(&path, &v, 16.0, 4.0, 0.001);
        for w in p.blocks().windows(2) {
            let end_v = w[0].vi + w[0].a * w[0].t;
            assert!((end_v - w[1].vi).abs() < 1e-6);
        }
    }

    #[test]
    fn velocity_bounds_hold_through_every_block() {
        let path = Path::new(vec![
            Point::new(0.0, 0.0),
            Point::new(0.0, 10.0),
            Point::new(10.0, 10.0),
        ]);
        let v = throttle(&path.points, 4.0, 0.1, 0.05);
        let p = plan(&path, &v, 16.0, 4.0, 0.001);
        for b in p.blocks() {
            let v0 = b.velocity_at(0.0);
            let v1 = b.velocity_at(b.t);
            assert!(v0 >= -1e-6 && v0 <= 4.0 + 1e-6);
            assert!(v1 >= -1e-6 && v1 <= 4.0 + 1e-6);
        }
    }

    #[test]
    fn endpoints_match_polyline_endpoints() {
        let path = Path::new(vec![
            Point::new(0.0, 0.0),
            Point::new(0.0, 10.0),
            Point::new(10.0, 10.0),
            Point::new(10.0, 0.0),
        ]);
        let v = throttle(&path.points, 4.0, 0.1, 0.05);
        let p = plan(&path, &v, 16.0, 4.0, 0.001);
        assert_eq!(p.at_time(0.0).position, path.points[0]);
        let end = p.at_time(p.total_time()).position;
        assert!(end.distance(*path.points.last().unwrap()) < 1e-6);
    }

    #[test]
    fn cumulative_distance_is_monotonic() {
        let path = Path::new(vec![
            Point::new(0.0, 0.0),
            Point::new(5.0, 0.0),
            Point::new(5.0, 5.0),
        ]);
        let v = throttle(&path.points, 4.0, 0.1, 0.05);
        let p = plan(&path, &v, 16.0, 4.0, 0.001);
        let samples: Vec<f64> = (0..=20)
            .map(|i| p.at_time(p.total_time() * i as f64 / 20.0).distance)
            .collect();
        for w in samples.windows(2) {
            assert!(w[1] >= w[0] - 1e-9);
        }
    }

    #[test]
    fn single_line_triangle_profile_peaks_at_midpoint_in_time() {
        // A large vmax keeps this a pure triangle (no cruise phase): with
        // vi == vexit == 0 the profile is symmetric, so the peak falls
        // exactly at total_time / 2.
        let path = Path::new(vec![Point::new(0.0, 0.0), Point::new(10.0, 10.0)]);
        let v = flat_throttle(&path, 100.0);
        let p = plan(&path, &v, 16.0, 100.0, 0.001);
        let mid = p.at_time(p.total_time() / 2.0);
        let distance = 10.0 * 2.0_f64.sqrt();
        let vpeak = (2.0 * 16.0 * (distance / 2.0)).sqrt();
        assert!((mid.velocity - vpeak).abs() < 1e-3);
    }

    #[test]
    fn square_corner_velocity_matches_formula() {
        let d1 = Point::new(0.0, 1.0);
        let d2 = Point::new(1.0, 0.0);
        let cos = -d1.dot(d2);
        let v = corner_velocity(cos, 16.0, 0.001, 4.0);
        let expected = (16.0_f64 * 0.001 * (0.5_f64).sqrt() / (1.0 - (0.5_f64).sqrt())).sqrt();
        assert!((v - expected).abs() < 1e-6);
    }

    #[test]
    fn straight_through_corner_is_unthrottled() {
        let d = Point::new(1.0, 0.0);
        let cos = -d.dot(d);
        let v = corner_velocity(cos, 16.0, 0.001, 4.0);
        assert!((v - 4.0).abs() < 1e-9);
    }

    #[test]
    fn reversal_corner_velocity_is_zero() {
        let d = Point::new(1.0, 0.0);
        let cos = -d.dot(d.scale(-1.0));
        let v = corner_velocity(cos, 16.0, 0.001, 4.0);
        assert_eq!(v, 0.0);
    }

    #[test]
    fn backward_propagation_does_not_duplicate_blocks() {
        // A long cruise segment feeds into a very short segment that ends
        // in a dead-reversal corner (exit velocity forced to 0). The short
        // segment cannot decelerate to 0 within its own length, so the
        // planner must revisit and re-trim the long segment's blocks
        // rather than append to what it already emitted there.
        let path = Path::new(vec![
            Point::new(0.0, 0.0),
            Point::new(50.0, 0.0),
            Point::new(50.05, 0.0),
            Point::new(50.0, 0.0),
        ]);
        let v = flat_throttle(&path, 4.0);
        let p = plan(&path, &v, 16.0, 4.0, 0.001);

        // Continuity must hold across every consecutive block pair: a
        // stray leftover block from the first pass would show up here as
        // a velocity discontinuity or as distance overshoot.
        for w in p.blocks().windows(2) {
            let end_v = w[0].vi + w[0].a * w[0].t;
            assert!((end_v - w[1].vi).abs() < 1e-6);
        }
        assert!((p.total_distance() - path.arc_length()).abs() < 1e-6);
        assert!(p.at_time(p.total_time()).velocity.abs() < 1e-6);
    }
}
