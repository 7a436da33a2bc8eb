//! Axis-aligned 3D bounds.

use glam::{Mat4, Vec3};

/// Min/max box, usually in camera or raster space.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Bound3 {
    pub min: Vec3,
    pub max: Vec3,
}

impl Bound3 {
    /// An inverted box that any `encapsulate` will fix up.
    pub fn empty() -> Bound3 {
        Bound3 {
            min: Vec3::splat(f32::MAX),
            max: Vec3::splat(f32::MIN),
        }
    }

    pub fn new(min: Vec3, max: Vec3) -> Bound3 {
        Bound3 { min, max }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn encapsulate(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn union(&mut self, other: &Bound3) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn contains(&self, other: &Bound3) -> bool {
        self.min.cmple(other.min).all() && self.max.cmpge(other.max).all()
    }

    /// Grows the box by `r` on every side.
    pub fn expand(&mut self, r: f32) {
        self.min -= Vec3::splat(r);
        self.max += Vec3::splat(r);
    }

    /// Transforms all eight corners and re-boxes them.
    pub fn transform(&self, m: &Mat4) -> Bound3 {
        let mut out = Bound3::empty();
        for i in 0..8 {
            let c = Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            out.encapsulate(m.transform_point3(c));
        }
        out
    }

    /// Whether the z-range crosses the interval `[near, far]` entirely
    /// outside.
    pub fn outside_depth(&self, near: f32, far: f32) -> bool {
        self.max.z < near || self.min.z > far
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encapsulate_grows() {
        let mut b = Bound3::empty();
        assert!(b.is_empty());
        b.encapsulate(Vec3::ONE);
        b.encapsulate(-Vec3::ONE);
        assert_eq!(b.min, -Vec3::ONE);
        assert_eq!(b.max, Vec3::ONE);
    }

    #[test]
    fn transform_reboxes_corners() {
        let b = Bound3::new(-Vec3::ONE, Vec3::ONE);
        let m = Mat4::from_rotation_z(std::f32::consts::FRAC_PI_4);
        let t = b.transform(&m);
        let s = 2.0f32.sqrt();
        assert!((t.max.x - s).abs() < 1e-5);
        assert!((t.min.x + s).abs() < 1e-5);
        assert!((t.max.z - 1.0).abs() < 1e-6);
    }

    #[test]
    fn union_contains_both() {
        let mut a = Bound3::new(Vec3::ZERO, Vec3::ONE);
        let b = Bound3::new(Vec3::splat(2.0), Vec3::splat(3.0));
        a.union(&b);
        assert!(a.contains(&b));
        assert!(a.contains(&Bound3::new(Vec3::ZERO, Vec3::ONE)));
    }
}
