//! Trim curves: closed loops of 2D NURBS curves in parameter space that
//! punch holes in a NURBS patch.

use glam::{Vec2, Vec3};
use tracing::warn;

/// One 2D NURBS curve in (u, v) parameter space. Control points carry a
/// weight in `z`.
#[derive(Clone, Debug)]
pub struct TrimCurve {
    pub order: usize,
    pub knots: Vec<f32>,
    /// (u·w, v·w, w) homogeneous control points.
    pub points: Vec<Vec3>,
}

impl TrimCurve {
    fn degree(&self) -> usize {
        self.order - 1
    }

    fn domain(&self) -> (f32, f32) {
        let p = self.degree();
        (self.knots[p], self.knots[self.points.len()])
    }

    fn find_span(&self, t: f32) -> usize {
        let p = self.degree();
        let n = self.points.len();
        if t >= self.knots[n] {
            return n - 1;
        }
        let mut lo = p;
        while lo + 1 < self.knots.len() && self.knots[lo + 1] <= t {
            lo += 1;
        }
        lo.min(n - 1)
    }

    /// De Boor basis evaluation at `t`.
    pub fn eval(&self, t: f32) -> Vec2 {
        let p = self.degree();
        let span = self.find_span(t);
        let basis = basis_functions(t, span, &self.knots, self.order);
        let mut acc = Vec3::ZERO;
        for (k, b) in basis.iter().enumerate() {
            let idx = span - p + k;
            acc += self.points[idx.min(self.points.len() - 1)] * *b;
        }
        if acc.z != 0.0 {
            Vec2::new(acc.x / acc.z, acc.y / acc.z)
        } else {
            Vec2::new(acc.x, acc.y)
        }
    }

    /// Samples the curve into `segments` chords.
    pub fn decimate(&self, segments: usize) -> Vec<Vec2> {
        let (t0, t1) = self.domain();
        (0..=segments)
            .map(|i| self.eval(t0 + (t1 - t0) * i as f32 / segments as f32))
            .collect()
    }
}

/// Cox-de Boor basis functions over one span.
pub fn basis_functions(t: f32, span: usize, knots: &[f32], order: usize) -> Vec<f32> {
    let p = order - 1;
    let mut n = vec![0.0f32; order];
    let mut left = vec![0.0f32; order];
    let mut right = vec![0.0f32; order];
    n[0] = 1.0;
    for j in 1..=p {
        left[j] = t - knots[span + 1 - j];
        right[j] = knots[span + j] - t;
        let mut saved = 0.0;
        for r in 0..j {
            let denom = right[r + 1] + left[j - r];
            let temp = if denom != 0.0 { n[r] / denom } else { 0.0 };
            n[r] = saved + right[r + 1] * temp;
            saved = left[j - r] * temp;
        }
        n[j] = saved;
    }
    n
}

/// A closed loop of trim curves.
#[derive(Clone, Debug, Default)]
pub struct TrimLoop {
    pub curves: Vec<TrimCurve>,
}

impl TrimLoop {
    /// Flattens the loop into a closed polyline. The segment count per
    /// curve comes from the surface's raster shading rate.
    pub fn decimate(&self, segments_per_curve: usize) -> Vec<Vec2> {
        let mut pts = Vec::new();
        for curve in &self.curves {
            if curve.points.len() < 2 {
                warn!("trim curve with fewer than 2 control points ignored");
                continue;
            }
            let seg = curve.decimate(segments_per_curve.max(2));
            // Drop the duplicated joint between consecutive curves.
            let skip = usize::from(!pts.is_empty());
            pts.extend(seg.into_iter().skip(skip));
        }
        pts
    }
}

/// Winding-rule point test over a set of decimated loops: a point is kept
/// when its horizontal-ray crossing count over all loops is odd.
pub fn point_trimmed(loops: &[Vec<Vec2>], p: Vec2) -> bool {
    let mut crossings = 0usize;
    for poly in loops {
        let n = poly.len();
        if n < 2 {
            continue;
        }
        for i in 0..n {
            let a = poly[i];
            let b = poly[(i + 1) % n];
            // Half-open interval keeps shared endpoints from double
            // counting.
            if (a.y > p.y) != (b.y > p.y) {
                let t = (p.y - a.y) / (b.y - a.y);
                let x = a.x + t * (b.x - a.x);
                if x > p.x {
                    crossings += 1;
                }
            }
        }
    }
    crossings % 2 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_loop() -> Vec<Vec2> {
        vec![
            Vec2::new(0.25, 0.25),
            Vec2::new(0.75, 0.25),
            Vec2::new(0.75, 0.75),
            Vec2::new(0.25, 0.75),
        ]
    }

    #[test]
    fn points_inside_loop_kept() {
        let loops = vec![square_loop()];
        assert!(!point_trimmed(&loops, Vec2::new(0.5, 0.5)));
        assert!(point_trimmed(&loops, Vec2::new(0.1, 0.5)));
        assert!(point_trimmed(&loops, Vec2::new(0.9, 0.9)));
    }

    #[test]
    fn nested_loops_follow_odd_winding() {
        let outer = square_loop();
        let inner = vec![
            Vec2::new(0.4, 0.4),
            Vec2::new(0.6, 0.4),
            Vec2::new(0.6, 0.6),
            Vec2::new(0.4, 0.6),
        ];
        let loops = vec![outer, inner];
        // Between the loops: kept; inside both: trimmed again.
        assert!(!point_trimmed(&loops, Vec2::new(0.3, 0.5)));
        assert!(point_trimmed(&loops, Vec2::new(0.5, 0.5)));
    }

    #[test]
    fn linear_trim_curve_evaluates_straight() {
        let curve = TrimCurve {
            order: 2,
            knots: vec![0.0, 0.0, 1.0, 1.0],
            points: vec![Vec3::new(0.0, 0.0, 1.0), Vec3::new(1.0, 0.5, 1.0)],
        };
        let mid = curve.eval(0.5);
        assert!((mid - Vec2::new(0.5, 0.25)).length() < 1e-5);
        let pts = curve.decimate(4);
        assert_eq!(pts.len(), 5);
        assert!((pts[0] - Vec2::ZERO).length() < 1e-6);
        assert!((pts[4] - Vec2::new(1.0, 0.5)).length() < 1e-5);
    }
}
