//! Douglas–Peucker polyline simplification.

use super::Point;

/// Simplifies `points` to within `tau` millimetres, keeping both
/// endpoints. Idempotent: simplifying the result again at the same
/// tolerance returns the same polyline.
pub fn douglas_peucker(points: &[Point], tau: f64) -> Vec<Point> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[points.len() - 1] = true;
    simplify_range(points, 0, points.len() - 1, tau, &mut keep);

    points
        .iter()
        .zip(keep.iter())
        .filter_map(|(p, &k)| k.then_some(*p))
        .collect()
}

fn simplify_range(points: &[Point], start: usize, end: usize, tau: f64, keep: &mut [bool]) {
    if end <= start + 1 {
        return;
    }

    let a = points[start];
    let b = points[end];

    let mut farthest_index = start;
    let mut farthest_dist = 0.0_f64;
    for i in (start + 1)..end {
        let d = points[i].distance_to_segment(a, b);
        if d > farthest_dist {
            farthest_dist = d;
            farthest_index = i;
        }
    }

    if farthest_dist > tau {
        keep[farthest_index] = true;
        simplify_range(points, start, farthest_index, tau, keep);
        simplify_range(points, farthest_index, end, tau, keep);
    }
}
