//! Primitive variables: user data attached to a surface and interpolated
//! down to shading points.

use glam::{Vec3, Vec4};
use slx::{StorageClass, Value, ValueType};
use smol_str::SmolStr;

/// Storage for one primitive variable.
#[derive(Clone, Debug)]
pub enum PrimVarData {
    Float(Vec<f32>),
    /// Homogeneous points; `P` and `Pw` live here.
    Hpoint(Vec<Vec4>),
    /// Points, vectors, normals and colors.
    Triple(Vec<Vec3>),
    Str(Vec<SmolStr>),
}

impl PrimVarData {
    pub fn len(&self) -> usize {
        match self {
            PrimVarData::Float(v) => v.len(),
            PrimVarData::Hpoint(v) => v.len(),
            PrimVarData::Triple(v) => v.len(),
            PrimVarData::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn empty_like(&self, n: usize) -> PrimVarData {
        match self {
            PrimVarData::Float(_) => PrimVarData::Float(vec![0.0; n]),
            PrimVarData::Hpoint(_) => PrimVarData::Hpoint(vec![Vec4::W; n]),
            PrimVarData::Triple(_) => PrimVarData::Triple(vec![Vec3::ZERO; n]),
            PrimVarData::Str(_) => PrimVarData::Str(vec![SmolStr::default(); n]),
        }
    }
}

/// One primitive variable: name, storage class, data type and values.
#[derive(Clone, Debug)]
pub struct PrimVar {
    pub name: SmolStr,
    pub class: StorageClass,
    pub ty: ValueType,
    pub data: PrimVarData,
}

impl PrimVar {
    pub fn new(
        name: impl Into<SmolStr>,
        class: StorageClass,
        ty: ValueType,
        data: PrimVarData,
    ) -> PrimVar {
        PrimVar {
            name: name.into(),
            class,
            ty,
            data,
        }
    }

    /// The standard `P` variable from plain 3D points.
    pub fn points(points: &[Vec3]) -> PrimVar {
        PrimVar::new(
            "P",
            StorageClass::Vertex,
            ValueType::Point,
            PrimVarData::Hpoint(points.iter().map(|p| p.extend(1.0)).collect()),
        )
    }

    pub fn floats(
        name: impl Into<SmolStr>,
        class: StorageClass,
        values: Vec<f32>,
    ) -> PrimVar {
        PrimVar::new(name, class, ValueType::Float, PrimVarData::Float(values))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// An empty clone with the same name/class/type and `n` slots.
    pub fn clone_shape(&self, n: usize) -> PrimVar {
        PrimVar {
            name: self.name.clone(),
            class: self.class,
            ty: self.ty,
            data: self.data.empty_like(n),
        }
    }

    pub fn hpoint(&self, i: usize) -> Vec4 {
        match &self.data {
            PrimVarData::Hpoint(v) => v[i],
            PrimVarData::Triple(v) => v[i].extend(1.0),
            PrimVarData::Float(v) => Vec4::new(v[i], v[i], v[i], 1.0),
            PrimVarData::Str(_) => Vec4::W,
        }
    }

    /// Dehomogenized 3D position of slot `i`.
    pub fn point3(&self, i: usize) -> Vec3 {
        match &self.data {
            PrimVarData::Hpoint(v) => {
                let p = v[i];
                if p.w != 0.0 && p.w != 1.0 {
                    p.truncate() / p.w
                } else {
                    p.truncate()
                }
            }
            PrimVarData::Triple(v) => v[i],
            PrimVarData::Float(v) => Vec3::splat(v[i]),
            PrimVarData::Str(_) => Vec3::ZERO,
        }
    }

    pub fn float(&self, i: usize) -> f32 {
        match &self.data {
            PrimVarData::Float(v) => v[i],
            PrimVarData::Hpoint(v) => v[i].x,
            PrimVarData::Triple(v) => v[i].x,
            PrimVarData::Str(_) => 0.0,
        }
    }

    pub fn set_float(&mut self, i: usize, f: f32) {
        if let PrimVarData::Float(v) = &mut self.data {
            v[i] = f;
        }
    }

    /// Copies slot `src_i` of `src` into slot `dst_i`.
    pub fn copy_slot(&mut self, dst_i: usize, src: &PrimVar, src_i: usize) {
        match (&mut self.data, &src.data) {
            (PrimVarData::Float(d), PrimVarData::Float(s)) => d[dst_i] = s[src_i],
            (PrimVarData::Hpoint(d), PrimVarData::Hpoint(s)) => d[dst_i] = s[src_i],
            (PrimVarData::Triple(d), PrimVarData::Triple(s)) => d[dst_i] = s[src_i],
            (PrimVarData::Str(d), PrimVarData::Str(s)) => d[dst_i] = s[src_i].clone(),
            _ => {}
        }
    }

    /// `dst[dst_i] = a[i0]·(1-t) + a[i1]·t`, the affine blend behind knot
    /// insertion and midpoint subdivision.
    pub fn lerp_slot(&mut self, dst_i: usize, src: &PrimVar, i0: usize, i1: usize, t: f32) {
        match (&mut self.data, &src.data) {
            (PrimVarData::Float(d), PrimVarData::Float(s)) => {
                d[dst_i] = s[i0] * (1.0 - t) + s[i1] * t
            }
            (PrimVarData::Hpoint(d), PrimVarData::Hpoint(s)) => {
                d[dst_i] = s[i0] * (1.0 - t) + s[i1] * t
            }
            (PrimVarData::Triple(d), PrimVarData::Triple(s)) => {
                d[dst_i] = s[i0] * (1.0 - t) + s[i1] * t
            }
            // Strings take the nearer end.
            (PrimVarData::Str(d), PrimVarData::Str(s)) => {
                d[dst_i] = s[if t < 0.5 { i0 } else { i1 }].clone()
            }
            _ => {}
        }
    }

    /// Slot as a homogeneous 4-vector; floats occupy x, triples xyz.
    pub fn slot4(&self, i: usize) -> Vec4 {
        match &self.data {
            PrimVarData::Float(v) => Vec4::new(v[i], 0.0, 0.0, 0.0),
            PrimVarData::Hpoint(v) => v[i],
            PrimVarData::Triple(v) => v[i].extend(0.0),
            PrimVarData::Str(_) => Vec4::ZERO,
        }
    }

    pub fn set_slot4(&mut self, i: usize, val: Vec4) {
        match &mut self.data {
            PrimVarData::Float(v) => v[i] = val.x,
            PrimVarData::Hpoint(v) => v[i] = val,
            PrimVarData::Triple(v) => v[i] = val.truncate(),
            PrimVarData::Str(_) => {}
        }
    }

    /// Bilinear blend of four corner slots, for varying-class dicing.
    pub fn bilinear(&self, c: [usize; 4], u: f32, v: f32) -> Vec4 {
        let a = self.hpoint(c[0]) * (1.0 - u) + self.hpoint(c[1]) * u;
        let b = self.hpoint(c[2]) * (1.0 - u) + self.hpoint(c[3]) * u;
        a * (1.0 - v) + b * v
    }

    /// Writes slot `i` into lane `lane` of a shading value.
    pub fn write_lane(&self, i: usize, out: &mut Value, lane: usize) {
        match &self.data {
            PrimVarData::Float(v) => out.set_float(lane, v[i]),
            PrimVarData::Hpoint(_) => out.set_triple(lane, self.point3(i)),
            PrimVarData::Triple(v) => out.set_triple(lane, v[i]),
            PrimVarData::Str(v) => out.set_str(lane, v[i].clone()),
        }
    }

    /// The shading-value shape this variable dices into.
    pub fn shading_type(&self) -> ValueType {
        match self.ty {
            ValueType::Point | ValueType::Vector | ValueType::Normal => self.ty,
            _ if matches!(self.data, PrimVarData::Hpoint(_)) => ValueType::Point,
            other => other,
        }
    }
}

/// Looks a variable up by name.
pub fn find<'a>(vars: &'a [PrimVar], name: &str) -> Option<&'a PrimVar> {
    vars.iter().find(|v| v.name == name)
}

pub fn find_mut<'a>(vars: &'a mut [PrimVar], name: &str) -> Option<&'a mut PrimVar> {
    vars.iter_mut().find(|v| v.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lerp_blends_hpoints() {
        let src = PrimVar::points(&[Vec3::ZERO, Vec3::X]);
        let mut dst = src.clone_shape(1);
        dst.lerp_slot(0, &src, 0, 1, 0.25);
        assert!((dst.point3(0) - Vec3::new(0.25, 0.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn rational_points_dehomogenize() {
        let pv = PrimVar::new(
            "Pw",
            StorageClass::Vertex,
            ValueType::Point,
            PrimVarData::Hpoint(vec![Vec4::new(2.0, 4.0, 6.0, 2.0)]),
        );
        assert_eq!(pv.point3(0), Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn bilinear_corners() {
        let pv = PrimVar::points(&[Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::ONE]);
        let mid = pv.bilinear([0, 1, 2, 3], 0.5, 0.5);
        assert!((mid.truncate() - Vec3::new(0.5, 0.5, 0.25)).length() < 1e-6);
    }
}
