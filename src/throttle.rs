//! Per-vertex velocity ceiling so that a straight-line sample taken every
//! `dt` seconds never strays more than `tau` millimetres from the
//! original polyline.

use crate::geometry::Point;

/// Number of bisection iterations used to find the highest feasible
/// velocity at a vertex.
const BISECTION_ITERATIONS: u32 = 16;

/// Computes `V[0..N-1]`, the maximum velocity at which the dispatcher may
/// leave each vertex without oversampling the polyline.
pub fn throttle(points: &[Point], vmax: f64, dt: f64, tau: f64) -> Vec<f64> {
    if points.len() < 2 {
        return vec![vmax; points.len()];
    }

    let cumulative = cumulative_lengths(points);
    (0..points.len())
        .map(|i| max_velocity_at(points, &cumulative, i, vmax, dt, tau))
        .collect()
}

fn cumulative_lengths(points: &[Point]) -> Vec<f64> {
    let mut out = Vec::with_capacity(points.len());
    let mut acc = 0.0;
    out.push(0.0);
    for w in points.windows(2) {
        acc += w[0].distance(w[1]);
        out.push(acc);
    }
    out
}

/// Largest `j` such that `cumulative[j] <= x`. `cumulative` is assumed
/// non-decreasing.
fn floor_index(cumulative: &[f64], x: f64) -> usize {
    match cumulative.binary_search_by(|c| c.partial_cmp(&x).unwrap()) {
        Ok(idx) => idx,
        Err(idx) => idx.saturating_sub(1),
    }
    .min(cumulative.len() - 1)
}

/// Returns whether leaving vertex `i` at velocity `v` keeps the `dt`
/// sample within `tau` of the polyline.
fn is_feasible(points: &[Point], cumulative: &[f64], i: usize, v: f64, dt: f64, tau: f64) -> bool {
    let last = points.len() - 1;
    if i >= last {
        return true;
    }

    let d = v * dt;
    let x1 = cumulative[i] + d;

    if x1 >= cumulative[last] {
        // Sample runs past the end of the polyline: the endpoint clamps
        // to the final vertex.
        let p_end = points[last];
        for k in (i + 1)..last {
            if points[k].distance_to_segment(points[i], p_end) > tau {
                return false;
            }
        }
        return true;
    }

    let j = floor_index(cumulative, x1);
    if j <= i {
        return true;
    }

    let seg_start = cumulative[j];
    let p_end = points[j].lerp(points[j + 1], x1 - seg_start);

    for k in (i + 1)..=j {
        if points[k].distance_to_segment(points[i], p_end) > tau {
            return false;
        }
    }
    true
}

fn max_velocity_at(points: &[Point], cumulative: &[f64], i: usize, vmax: f64, dt: f64, tau: f64) -> f64 {
    if is_feasible(points, cumulative, i, vmax, dt, tau) {
        return vmax;
    }

    let mut lo = 0.0_f64;
    let mut hi = vmax;
    for _ in 0..BISECTION_ITERATIONS {
        let mid = 0.5 * (lo + hi);
        if is_feasible(points, cumulative, i, mid, dt, tau) {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    lo
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zigzag() -> Vec<Point> {
        vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 2.0),
            Point::new(2.0, 0.0),
            Point::new(3.0, 2.0),
            Point::new(4.0, 0.0),
        ]
    }

    #[test]
    fn velocities_are_bounded() {
        let vmax = 50.0;
        let v = throttle(&zigzag(), vmax, 0.1, 0.05);
        assert_eq!(v.len(), 5);
        for vi in v {
            assert!(vi >= 0.0 && vi <= vmax);
        }
    }

    #[test]
    fn straight_line_is_not_throttled() {
        let line = vec![Point::new(0.0, 0.0), Point::new(100.0, 0.0)];
        let v = throttle(&line, 4.0, 0.1, 0.05);
        assert!((v[0] - 4.0).abs() < 1e-9);
    }

    #[test]
    fn feasible_velocity_holds_and_slightly_more_fails() {
        let points = zigzag();
        let cumulative = cumulative_lengths(&points);
        let dt = 0.1;
        let tau = 0.05;
        let vmax = 50.0;
        let vi = max_velocity_at(&points, &cumulative, 1, vmax, dt, tau);
        assert!(is_feasible(&points, &cumulative, 1, vi, dt, tau));
        if vi < vmax - 1e-6 {
            assert!(!is_feasible(&points, &cumulative, 1, vi + 1e-3, dt, tau));
        }
    }

    #[test]
    fn last_vertex_velocity_defined() {
        let v = throttle(&zigzag(), 10.0, 0.1, 0.05);
        assert!(v[4] >= 0.0);
    }
}
