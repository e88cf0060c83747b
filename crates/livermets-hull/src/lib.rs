//! Boundary extraction over planar cell positions.
//!
//! The tumour rim is taken to be the convex hull of the live cell centres,
//! computed with Andrew's monotone chain. Collinear points are excluded from
//! the hull (the turn test pops on a zero cross product), so the result is the
//! minimal vertex set rather than every point touching a boundary edge. This
//! tie-break is part of the contract: boundary-restricted death policies draw
//! for exactly the returned cells.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// Common behaviour exposed by boundary extractors.
pub trait BoundaryExtractor {
    /// Return the indices of the points on the population boundary.
    ///
    /// Populations of three or fewer points have no interior; every input
    /// index is returned, in input order. Larger inputs yield the hull
    /// vertices in counter-clockwise order starting from the lexicographically
    /// smallest point, without repeating the start point.
    fn boundary(&self, points: &[(f64, f64)]) -> Vec<usize>;
}

/// Monotone-chain convex hull, the production extractor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MonotoneChain;

impl BoundaryExtractor for MonotoneChain {
    fn boundary(&self, points: &[(f64, f64)]) -> Vec<usize> {
        convex_hull_indices(points)
    }
}

/// Signed area of the triangle `(o, a, b)`, doubled. Positive means a left
/// turn when walking `o -> a -> b`.
#[inline]
fn cross(o: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
}

/// Compute the convex hull of `points`, returning indices into the slice.
///
/// O(n log n) in the lexicographic sort; the chain construction itself is
/// linear. Strictly convex: a cross product of zero pops, so points interior
/// to a hull edge never appear in the output.
#[must_use]
pub fn convex_hull_indices(points: &[(f64, f64)]) -> Vec<usize> {
    let n = points.len();
    if n <= 3 {
        return (0..n).collect();
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&i| (OrderedFloat(points[i].0), OrderedFloat(points[i].1)));

    let mut hull: Vec<usize> = Vec::with_capacity(n + 1);
    for &idx in &order {
        while hull.len() >= 2
            && cross(
                points[hull[hull.len() - 2]],
                points[hull[hull.len() - 1]],
                points[idx],
            ) <= 0.0
        {
            hull.pop();
        }
        hull.push(idx);
    }

    let lower_len = hull.len() + 1;
    for &idx in order.iter().rev().skip(1) {
        while hull.len() >= lower_len
            && cross(
                points[hull[hull.len() - 2]],
                points[hull[hull.len() - 1]],
                points[idx],
            ) <= 0.0
        {
            hull.pop();
        }
        hull.push(idx);
    }

    // The upper chain closes back on the starting point; drop the duplicate.
    hull.pop();
    hull
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hull_of(points: &[(f64, f64)]) -> Vec<usize> {
        MonotoneChain.boundary(points)
    }

    #[test]
    fn small_inputs_pass_through_in_input_order() {
        assert_eq!(hull_of(&[]), Vec::<usize>::new());
        assert_eq!(hull_of(&[(4.0, 2.0)]), vec![0]);
        assert_eq!(hull_of(&[(1.0, 1.0), (0.0, 0.0)]), vec![0, 1]);
        // Collinear and duplicate points are kept below the degenerate size.
        assert_eq!(
            hull_of(&[(0.0, 0.0), (1.0, 1.0), (1.0, 1.0)]),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn unit_square_excludes_centre() {
        let points = [(0.0, 0.0), (0.0, 1.0), (1.0, 0.0), (1.0, 1.0), (0.5, 0.5)];
        let hull = hull_of(&points);
        assert_eq!(hull, vec![0, 2, 3, 1], "CCW from the lexicographic minimum");
        assert!(!hull.contains(&4), "interior point must not be on the hull");
    }

    #[test]
    fn collinear_edge_midpoints_are_excluded() {
        // Square with the midpoint of the bottom edge added.
        let points = [
            (0.0, 0.0),
            (1.0, 0.0),
            (2.0, 0.0),
            (2.0, 2.0),
            (0.0, 2.0),
        ];
        let hull = hull_of(&points);
        assert_eq!(hull, vec![0, 2, 3, 4]);
    }

    #[test]
    fn fully_collinear_input_keeps_only_the_extremes() {
        let points = [(0.0, 0.0), (1.0, 1.0), (2.0, 2.0), (3.0, 3.0), (1.5, 1.5)];
        let hull = hull_of(&points);
        assert_eq!(hull, vec![0, 3]);
    }

    #[test]
    fn identical_x_breaks_ties_by_y() {
        let points = [(0.0, 3.0), (0.0, 0.0), (2.0, 0.0), (2.0, 3.0), (0.0, 1.5)];
        let hull = hull_of(&points);
        assert_eq!(hull, vec![1, 2, 3, 0]);
    }

    #[test]
    fn hull_has_no_interior_points_and_consistent_winding() {
        let points = [
            (0.0, 0.0),
            (4.0, 0.0),
            (4.0, 3.0),
            (0.0, 3.0),
            (2.0, 1.5),
            (1.0, 1.0),
            (3.0, 2.0),
            (2.0, 0.5),
        ];
        let hull = hull_of(&points);
        assert_eq!(hull, vec![0, 1, 2, 3]);

        // Every consecutive triple turns left (counter-clockwise, convex).
        for i in 0..hull.len() {
            let o = points[hull[i]];
            let a = points[hull[(i + 1) % hull.len()]];
            let b = points[hull[(i + 2) % hull.len()]];
            assert!(cross(o, a, b) > 0.0, "triple {i} must turn left");
        }
    }

    #[test]
    fn duplicate_vertices_do_not_repeat_in_the_hull() {
        let points = [
            (0.0, 0.0),
            (0.0, 0.0),
            (1.0, 0.0),
            (1.0, 1.0),
            (0.0, 1.0),
        ];
        let hull = hull_of(&points);
        let unique: std::collections::HashSet<usize> = hull.iter().copied().collect();
        assert_eq!(unique.len(), hull.len(), "hull indices must be distinct");
        assert_eq!(hull.len(), 4);
    }
}
