//! Linear and cubic curve groups.
//!
//! A group shares one control-point stream across many curves. Cubic
//! vertex data is converted to the Bezier basis the moment it is attached,
//! so every later split runs on a uniform representation. Segments never
//! dice directly: they either split into shorter segments or extrude into
//! a patch ribbon along `normal × tangent`.

use crate::bounds::Bound3;
use crate::grid::MicroGrid;
use crate::patch::{BicubicPatch, BilinearPatch};
use crate::primvar::{PrimVar, PrimVarData};
use crate::surface::{dice_standard, Surface, SurfaceBase, SurfaceBox, SplitDir};
use glam::{Mat4, Vec3, Vec4};
use slx::{StorageClass, Value, ValueType};
use tracing::warn;

/// Picks the first endpoint tangent candidate that is not degenerate.
fn choose_endpoint_tangent(a: Vec3, b: Vec3, c: Vec3) -> Vec3 {
    let max2 = a.length_squared().max(b.length_squared()).max(c.length_squared());
    let cutoff = 1e-6 * max2;
    for cand in [a, b, c] {
        if cand.length_squared() > cutoff {
            return cand;
        }
    }
    a
}

fn segments_per_curve(nverts: usize, step: usize, periodic: bool) -> usize {
    if periodic {
        nverts / step
    } else {
        (nverts.saturating_sub(4)) / step + 1
    }
}

/// Split-or-patch decision, made once per segment by `diceable`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SplitDecision {
    Undecided,
    Curve,
    Patch,
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// A group of linear or cubic curves over a shared vertex stream.
pub struct CurvesGroup {
    pub base: SurfaceBase,
    pub cubic: bool,
    pub counts: Vec<usize>,
    pub periodic: bool,
}

impl CurvesGroup {
    pub fn new(
        mut base: SurfaceBase,
        cubic: bool,
        counts: Vec<usize>,
        periodic: bool,
    ) -> crate::error::Result<CurvesGroup> {
        if periodic {
            if let Some(&short) = counts.iter().find(|c| **c < 3) {
                return Err(crate::error::Error::ShortPeriodicCurve(short));
            }
        }
        base.name = smol_str::SmolStr::new("curves");
        let mut group = CurvesGroup {
            base,
            cubic,
            counts,
            periodic,
        };
        group.populate_width();
        if cubic {
            group.convert_vertex_vars_to_bezier();
        }
        Ok(group)
    }

    /// Total varying slots across the group (one per parametric segment
    /// boundary).
    fn varying_count(&self) -> usize {
        self.counts
            .iter()
            .map(|&n| {
                let nseg = if self.cubic {
                    segments_per_curve(n, self.base.attrs.v_step, self.periodic)
                } else if self.periodic {
                    n
                } else {
                    n - 1
                };
                if self.periodic {
                    nseg
                } else {
                    nseg + 1
                }
            })
            .sum()
    }

    /// Fills `width` from `constantwidth` (or 1.0) when absent.
    fn populate_width(&mut self) {
        if self.base.find("width").is_some() {
            return;
        }
        let value = self
            .base
            .find("constantwidth")
            .map(|cw| cw.float(0))
            .unwrap_or(1.0);
        let n = self.varying_count();
        self.base.primvars.push(PrimVar::floats(
            "width",
            StorageClass::Varying,
            vec![value; n],
        ));
    }

    /// Re-expresses every vertex variable in the Bezier basis, four
    /// control values per segment.
    fn convert_vertex_vars_to_bezier(&mut self) {
        let step = self.base.attrs.v_step;
        let conv = self.base.attrs.v_basis.to_bezier();
        let counts = self.counts.clone();
        let periodic = self.periodic;
        for pv in &mut self.base.primvars {
            if pv.class != StorageClass::Vertex {
                continue;
            }
            let total_segments: usize = counts
                .iter()
                .map(|&n| segments_per_curve(n, step, periodic))
                .sum();
            let hold = pv.clone();
            let mut out = pv.clone_shape(total_segments * 4);
            let mut curve_start = 0usize;
            let mut out_idx = 0usize;
            for &nverts in &counts {
                let nseg = segments_per_curve(nverts, step, periodic);
                let mut seg_vert = 0usize;
                for _ in 0..nseg {
                    let p: Vec<Vec4> = (0..4)
                        .map(|k| hold.slot4(curve_start + (seg_vert + k) % nverts))
                        .collect();
                    for r in 0..4 {
                        let mut acc = Vec4::ZERO;
                        for (c, pc) in p.iter().enumerate() {
                            acc += *pc * conv.row(r)[c];
                        }
                        out.set_slot4(out_idx + r, acc);
                    }
                    seg_vert += step;
                    out_idx += 4;
                }
                curve_start += nverts;
            }
            *pv = out;
        }
    }

    fn max_width(&self) -> f32 {
        self.base
            .find("width")
            .map(|w| {
                let mut m = 0.0f32;
                for i in 0..w.len() {
                    m = m.max(w.float(i));
                }
                m
            })
            .unwrap_or(0.0)
    }
}

impl Surface for CurvesGroup {
    fn base(&self) -> &SurfaceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SurfaceBase {
        &mut self.base
    }

    fn bound(&self) -> Bound3 {
        let mut b = Bound3::empty();
        if let Some(p) = self.base.p() {
            for i in 0..p.len() {
                b.encapsulate(p.point3(i));
            }
        }
        b.expand(self.max_width() * 0.5);
        b.expand(self.base.motion_expand);
        b
    }

    fn transform(&mut self, m: &Mat4, m_inv_t: &Mat4, _m_rot: &Mat4) {
        let width_scale = 0.5
            * (m_inv_t.transform_vector3(Vec3::X).length()
                + m_inv_t.transform_vector3(Vec3::Y).length());
        for pv in &mut self.base.primvars {
            if pv.class == StorageClass::Vertex {
                if let PrimVarData::Hpoint(pts) = &mut pv.data {
                    for v in pts.iter_mut() {
                        *v = *m * *v;
                    }
                }
            } else if pv.name == "width" || pv.name == "constantwidth" {
                if let PrimVarData::Float(vals) = &mut pv.data {
                    for w in vals.iter_mut() {
                        *w *= width_scale;
                    }
                }
            }
        }
    }

    /// Groups always break into their segments first.
    fn diceable(&mut self, _cam_to_raster: &Mat4) -> bool {
        false
    }

    fn split(&self) -> Vec<SurfaceBox> {
        let mut out: Vec<SurfaceBox> = Vec::new();
        let step = self.base.attrs.v_step;
        let mut vert_cursor = 0usize; // linear vertex stream position
        let mut bezier_cursor = 0usize; // converted cubic stream position
        let mut vary_cursor = 0usize;
        for (curve_idx, &nverts) in self.counts.iter().enumerate() {
            let nseg = if self.cubic {
                segments_per_curve(nverts, step, self.periodic)
            } else if self.periodic {
                nverts
            } else {
                nverts - 1
            };
            let vary_per_curve = if self.periodic { nseg } else { nseg + 1 };
            for seg in 0..nseg {
                let mut base = SurfaceBase::new(self.base.name.clone(), self.base.attrs.clone());
                self.base.inherit(&mut base);
                base.split_count = self.base.split_count;
                let t0 = seg as f32 / nseg as f32;
                let t1 = (seg + 1) as f32 / nseg as f32;
                for pv in &self.base.primvars {
                    let child = match pv.class {
                        StorageClass::Vertex => {
                            if self.cubic {
                                let mut c = pv.clone_shape(4);
                                for k in 0..4 {
                                    c.copy_slot(k, pv, bezier_cursor + seg * 4 + k);
                                }
                                c
                            } else {
                                let mut c = pv.clone_shape(2);
                                c.copy_slot(0, pv, vert_cursor + seg);
                                c.copy_slot(1, pv, vert_cursor + (seg + 1) % nverts);
                                c
                            }
                        }
                        StorageClass::Varying | StorageClass::FaceVarying => {
                            let mut c = pv.clone_shape(2);
                            let last = pv.len().saturating_sub(1);
                            let i0 = vary_cursor + seg;
                            let i1 = vary_cursor + (seg + 1) % vary_per_curve;
                            c.copy_slot(0, pv, i0.min(last));
                            c.copy_slot(1, pv, i1.min(last));
                            c
                        }
                        StorageClass::Uniform => {
                            let mut c = pv.clone_shape(1);
                            c.copy_slot(0, pv, curve_idx.min(pv.len().saturating_sub(1)));
                            c
                        }
                        StorageClass::Constant => pv.clone(),
                    };
                    base.primvars.push(child);
                }
                // Parametric position along the parent curve.
                base.primvars.push(PrimVar::floats(
                    "v",
                    StorageClass::Varying,
                    vec![t0, t1],
                ));
                out.push(Box::new(CurveSegment {
                    base,
                    cubic: self.cubic,
                    decision: SplitDecision::Undecided,
                }));
            }
            vert_cursor += nverts;
            bezier_cursor += nseg * 4;
            vary_cursor += vary_per_curve;
        }
        out
    }

    fn dice(&self, _grid: &mut MicroGrid) {
        warn!("curve group diced without splitting");
    }

    fn clone_surface(&self) -> SurfaceBox {
        Box::new(CurvesGroup {
            base: self.base.clone(),
            cubic: self.cubic,
            counts: self.counts.clone(),
            periodic: self.periodic,
        })
    }

    fn natural_dice(&self, _pv: &PrimVar, _u_res: usize, _v_res: usize, _out: &mut Value) {}
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// One curve segment: two control points (linear) or a Bezier span (cubic).
pub struct CurveSegment {
    pub base: SurfaceBase,
    pub cubic: bool,
    decision: SplitDecision,
}

impl CurveSegment {
    fn point(&self, i: usize) -> Vec3 {
        self.base.p().map(|p| p.point3(i)).unwrap_or(Vec3::ZERO)
    }

    fn last_point(&self) -> Vec3 {
        self.point(if self.cubic { 3 } else { 1 })
    }

    fn width(&self, end: usize) -> f32 {
        self.base
            .find("width")
            .filter(|w| !w.is_empty())
            .map(|w| w.float(end.min(w.len() - 1)))
            .unwrap_or(1.0)
    }

    /// Normal at an endpoint: the `N` primitive variable, else facing the
    /// camera.
    fn normal(&self, end: usize) -> Vec3 {
        self.base
            .find("N")
            .and_then(|n| match &n.data {
                PrimVarData::Triple(v) => v.get(end.min(v.len().saturating_sub(1))).copied(),
                _ => None,
            })
            .unwrap_or(Vec3::NEG_Z)
    }

    /// Bezier tangent with the three-way degenerate-endpoint fallback.
    fn tangent(&self, t: f32) -> Vec3 {
        let p: Vec<Vec3> = (0..4).map(|i| self.point(i)).collect();
        if t == 0.0 {
            choose_endpoint_tangent(p[1] - p[0], p[2] - p[0], p[3] - p[0])
        } else if t == 1.0 {
            choose_endpoint_tangent(p[3] - p[2], p[3] - p[1], p[3] - p[0])
        } else {
            let t2 = t * t;
            (-t2 + 2.0 * t - 1.0) * p[0]
                + (3.0 * t2 - 4.0 * t + 1.0) * p[1]
                + (-3.0 * t2 + 2.0 * t) * p[2]
                + t2 * p[3]
        }
    }

    /// Converts the segment to a bilinear ribbon patch.
    fn linear_to_patch(&self) -> SurfaceBox {
        let p0 = self.point(0);
        let p1 = self.point(1);
        let direction = p1 - p0;
        let n0 = self.normal(0).normalize_or_zero();
        let n1 = self.normal(1).normalize_or_zero();
        let mut off0 = n0.cross(direction);
        let mut off1 = n1.cross(direction);
        if off0.length_squared() > 0.0 {
            off0 *= self.width(0) / off0.length() / 2.0;
        }
        if off1.length_squared() > 0.0 {
            off1 *= self.width(1) / off1.length() / 2.0;
        }
        let mut base = SurfaceBase::new(self.base.name.clone(), self.base.attrs.clone());
        self.base.inherit(&mut base);
        base.split_count = self.base.split_count;
        base.primvars.push(PrimVar::points(&[
            p0 + off0,
            p0 - off0,
            p1 + off1,
            p1 - off1,
        ]));
        self.fill_patch_primvars(&mut base);
        Box::new(BilinearPatch::from_base(base, false))
    }

    /// Converts the segment to a bicubic ribbon: the curve extruded along
    /// `normal × tangent`, scaled by the interpolated width.
    fn cubic_to_patch(&self) -> SurfaceBox {
        let n0 = self.normal(0).normalize_or_zero();
        let n3 = self.normal(1).normalize_or_zero();
        let n1 = ((n3 - n0) / 3.0 + n0).normalize_or_zero();
        let n2 = ((n3 - n0) * (2.0 / 3.0) + n0).normalize_or_zero();
        let normals = [n0, n1, n2, n3];
        let tangents = [
            self.tangent(0.0),
            self.tangent(0.333),
            self.tangent(0.666),
            self.tangent(1.0),
        ];
        let w0 = self.width(0);
        let w3 = self.width(1);
        let widths = [w0, (w3 - w0) / 3.0 + w0, (w3 - w0) * 2.0 / 3.0 + w0, w3];
        let mut control = [Vec3::ZERO; 16];
        for row in 0..4 {
            let off_inner = normals[row].cross(tangents[row]).normalize_or_zero()
                * (widths[row] / 6.0);
            let off_outer = off_inner * 3.0;
            let p = self.point(row);
            control[row * 4] = p + off_outer;
            control[row * 4 + 1] = p + off_inner;
            control[row * 4 + 2] = p - off_inner;
            control[row * 4 + 3] = p - off_outer;
        }
        let mut base = SurfaceBase::new(self.base.name.clone(), self.base.attrs.clone());
        self.base.inherit(&mut base);
        base.split_count = self.base.split_count;
        base.primvars.push(PrimVar::points(&control));
        self.fill_patch_primvars(&mut base);
        Box::new(BicubicPatch::from_base(base))
    }

    /// Copies the segment's remaining variables onto a ribbon patch:
    /// u runs across the ribbon, v along the curve.
    fn fill_patch_primvars(&self, base: &mut SurfaceBase) {
        let v0 = self
            .base
            .find("v")
            .map(|v| v.float(0))
            .unwrap_or(0.0);
        let v1 = self
            .base
            .find("v")
            .map(|v| v.float(1.min(v.len() - 1)))
            .unwrap_or(1.0);
        for (name, vals) in [
            ("u", [0.0, 1.0, 0.0, 1.0]),
            ("v", [v0, v0, v1, v1]),
            ("s", [0.0, 1.0, 0.0, 1.0]),
            ("t", [v0, v0, v1, v1]),
        ] {
            base.primvars
                .push(PrimVar::floats(name, StorageClass::Varying, vals.to_vec()));
        }
        for pv in &self.base.primvars {
            if matches!(
                pv.name.as_str(),
                "P" | "N" | "u" | "v" | "s" | "t" | "width" | "constantwidth"
            ) {
                continue;
            }
            let child = match pv.class {
                StorageClass::Varying | StorageClass::FaceVarying | StorageClass::Vertex => {
                    let mut c = pv.clone_shape(4);
                    let last = pv.len().saturating_sub(1);
                    c.copy_slot(0, pv, 0);
                    c.copy_slot(1, pv, 0);
                    c.copy_slot(2, pv, last);
                    c.copy_slot(3, pv, last);
                    PrimVar {
                        class: StorageClass::Varying,
                        ..c
                    }
                }
                StorageClass::Uniform | StorageClass::Constant => pv.clone(),
            };
            base.primvars.push(child);
        }
    }

    /// Splits into two shorter segments at the parametric midpoint.
    fn halves(&self) -> Vec<SurfaceBox> {
        let make = |half: usize| -> SurfaceBox {
            let mut base = SurfaceBase::new(self.base.name.clone(), self.base.attrs.clone());
            self.base.inherit(&mut base);
            for pv in &self.base.primvars {
                let child = match pv.class {
                    StorageClass::Vertex => {
                        if self.cubic {
                            let p: Vec<Vec4> = (0..4).map(|i| pv.slot4(i)).collect();
                            let mut c = pv.clone_shape(4);
                            let q01 = (p[0] + p[1]) * 0.5;
                            let q12 = (p[1] + p[2]) * 0.5;
                            let q23 = (p[2] + p[3]) * 0.5;
                            let r0 = (q01 + q12) * 0.5;
                            let r1 = (q12 + q23) * 0.5;
                            let mid = (r0 + r1) * 0.5;
                            let vals = if half == 0 {
                                [p[0], q01, r0, mid]
                            } else {
                                [mid, r1, q23, p[3]]
                            };
                            for (k, v) in vals.iter().enumerate() {
                                c.set_slot4(k, *v);
                            }
                            c
                        } else {
                            let mut c = pv.clone_shape(2);
                            if half == 0 {
                                c.copy_slot(0, pv, 0);
                                c.lerp_slot(1, pv, 0, 1, 0.5);
                            } else {
                                c.lerp_slot(0, pv, 0, 1, 0.5);
                                c.copy_slot(1, pv, 1);
                            }
                            c
                        }
                    }
                StorageClass::Varying | StorageClass::FaceVarying | StorageClass::Vertex => {
                    let mut c = pv.clone_shape(2);
                    let last = pv.len().saturating_sub(1);
                        if half == 0 {
                            c.copy_slot(0, pv, 0);
                            c.lerp_slot(1, pv, 0, last, 0.5);
                        } else {
                            c.lerp_slot(0, pv, 0, last, 0.5);
                            c.copy_slot(1, pv, last);
                        }
                        c
                    }
                    StorageClass::Uniform | StorageClass::Constant => pv.clone(),
                };
                base.primvars.push(child);
            }
            Box::new(CurveSegment {
                base,
                cubic: self.cubic,
                decision: SplitDecision::Undecided,
            })
        };
        vec![make(0), make(1)]
    }

    /// Raster grid-edge budget: the side length of a full grid.
    fn grid_length(&self) -> f32 {
        (self.base.attrs.grid_size * self.base.adjusted_shading_rate()).sqrt()
    }
}

impl Surface for CurveSegment {
    fn base(&self) -> &SurfaceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SurfaceBase {
        &mut self.base
    }

    fn bound(&self) -> Bound3 {
        let mut b = Bound3::empty();
        if let Some(p) = self.base.p() {
            for i in 0..p.len() {
                b.encapsulate(p.point3(i));
            }
        }
        let w = self.width(0).max(self.width(1));
        b.expand(w * 0.5);
        b.expand(self.base.motion_expand);
        b
    }

    fn transform(&mut self, m: &Mat4, m_inv_t: &Mat4, _m_rot: &Mat4) {
        let width_scale = 0.5
            * (m_inv_t.transform_vector3(Vec3::X).length()
                + m_inv_t.transform_vector3(Vec3::Y).length());
        for pv in &mut self.base.primvars {
            if pv.class == StorageClass::Vertex {
                if let PrimVarData::Hpoint(pts) = &mut pv.data {
                    for v in pts.iter_mut() {
                        *v = *m * *v;
                    }
                }
            } else if pv.name == "width" {
                if let PrimVarData::Float(vals) = &mut pv.data {
                    for w in vals.iter_mut() {
                        *w *= width_scale;
                    }
                }
            }
        }
    }

    /// Decides between splitting shorter and becoming a patch; a segment
    /// itself is never diced.
    fn diceable(&mut self, cam_to_raster: &Mat4) -> bool {
        if self.decision == SplitDecision::Undecided {
            let a = cam_to_raster.project_point3(self.point(0));
            let b = cam_to_raster.project_point3(self.last_point());
            let raster_len = (b - a).length();
            self.decision = if raster_len < self.grid_length() || !self.base.diceable_flag {
                SplitDecision::Patch
            } else {
                SplitDecision::Curve
            };
        }
        self.base.split_dir = SplitDir::V;
        false
    }

    fn split(&self) -> Vec<SurfaceBox> {
        match self.decision {
            SplitDecision::Patch => {
                if self.cubic {
                    vec![self.cubic_to_patch()]
                } else {
                    vec![self.linear_to_patch()]
                }
            }
            _ => self.halves(),
        }
    }

    fn dice(&self, grid: &mut MicroGrid) {
        // Reached only when the dispatcher forces a dice at the recursion
        // cap; treat the segment as its ribbon.
        dice_standard(self, grid);
    }

    fn clone_surface(&self) -> SurfaceBox {
        Box::new(CurveSegment {
            base: self.base.clone(),
            cubic: self.cubic,
            decision: self.decision,
        })
    }

    fn natural_dice(&self, pv: &PrimVar, u_res: usize, v_res: usize, out: &mut Value) {
        // Ribbon fallback: interpolate along the curve only.
        if pv.is_empty() {
            return;
        }
        let last = pv.len() - 1;
        for iv in 0..=v_res {
            let t = iv as f32 / v_res.max(1) as f32;
            let mut tmp = pv.clone_shape(1);
            tmp.lerp_slot(0, pv, 0, last, t);
            for iu in 0..=u_res {
                tmp.write_lane(0, out, iv * (u_res + 1) + iu);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::Attributes;
    use crate::basis::CubicBasis;
    use std::rc::Rc;

    fn linear_group(points: &[Vec3], counts: Vec<usize>) -> CurvesGroup {
        let mut base = SurfaceBase::new("curves", Rc::new(Attributes::default()));
        base.primvars.push(PrimVar::points(points));
        base.primvars.push(PrimVar::new(
            "constantwidth",
            StorageClass::Constant,
            ValueType::Float,
            PrimVarData::Float(vec![0.1]),
        ));
        base.primvars.push(PrimVar::new(
            "N",
            StorageClass::Varying,
            ValueType::Normal,
            PrimVarData::Triple(vec![Vec3::Y; points.len()]),
        ));
        CurvesGroup::new(base, false, counts, false).unwrap()
    }

    #[test]
    fn linear_segment_ribbon_corners() {
        let group = linear_group(&[Vec3::ZERO, Vec3::Z], vec![2]);
        let segments = group.split();
        assert_eq!(segments.len(), 1);
        // Force the patch decision and extract the ribbon.
        let seg = CurveSegment {
            base: segments[0].base().clone(),
            cubic: false,
            decision: SplitDecision::Patch,
        };
        let patches = seg.split();
        assert_eq!(patches.len(), 1);
        let p = patches[0].base().p().unwrap();
        let want = [
            Vec3::new(0.05, 0.0, 0.0),
            Vec3::new(-0.05, 0.0, 0.0),
            Vec3::new(0.05, 0.0, 1.0),
            Vec3::new(-0.05, 0.0, 1.0),
        ];
        for (i, w) in want.iter().enumerate() {
            assert!(
                (p.point3(i) - *w).length() < 1e-6,
                "corner {i}: {:?} vs {w:?}",
                p.point3(i)
            );
        }
    }

    #[test]
    fn width_defaults_and_bound_expansion() {
        let group = linear_group(&[Vec3::ZERO, Vec3::Z], vec![2]);
        let b = group.bound();
        assert!((b.min.x + 0.05).abs() < 1e-6);
        assert!((b.max.x - 0.05).abs() < 1e-6);
    }

    #[test]
    fn group_splits_into_counted_segments() {
        let pts: Vec<Vec3> = (0..7).map(|i| Vec3::new(i as f32, 0.0, 0.0)).collect();
        let group = linear_group(&pts, vec![3, 4]);
        // (3-1) + (4-1) segments.
        assert_eq!(group.split().len(), 5);
    }

    #[test]
    fn endpoint_tangent_fallback() {
        // First candidate degenerate: falls through to the second.
        let t = choose_endpoint_tangent(Vec3::ZERO, Vec3::X, Vec3::Y);
        assert_eq!(t, Vec3::X);
        let t = choose_endpoint_tangent(Vec3::ZERO, Vec3::ZERO, Vec3::Y);
        assert_eq!(t, Vec3::Y);
    }

    #[test]
    fn cubic_group_converts_to_bezier_on_ingest() {
        let mut attrs = Attributes::default();
        attrs.v_basis = CubicBasis::BSpline;
        attrs.v_step = 1;
        let pts: Vec<Vec3> = (0..5).map(|i| Vec3::new(i as f32, 0.0, 0.0)).collect();
        let mut base = SurfaceBase::new("curves", Rc::new(attrs));
        base.primvars.push(PrimVar::points(&pts));
        let group = CurvesGroup::new(base, true, vec![5], false).unwrap();
        // Two b-spline segments, four Bezier control points each.
        let p = group.base.p().unwrap();
        assert_eq!(p.len(), 8);
        // First Bezier point of a uniform b-spline span [0,1,2,3] is 1.
        assert!((p.point3(0) - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn cubic_halves_meet_at_midpoint() {
        let mut base = SurfaceBase::new("curves", Rc::new(Attributes::default()));
        base.primvars.push(PrimVar::points(&[
            Vec3::ZERO,
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(2.0, -1.0, 0.0),
            Vec3::new(3.0, 0.0, 0.0),
        ]));
        let seg = CurveSegment {
            base,
            cubic: true,
            decision: SplitDecision::Curve,
        };
        let halves = seg.halves();
        let a = halves[0].base().p().unwrap();
        let b = halves[1].base().p().unwrap();
        assert!((a.point3(3) - b.point3(0)).length() < 1e-6);
        // The midpoint of this Bezier is (1.5, 0, 0).
        assert!((a.point3(3) - Vec3::new(1.5, 0.0, 0.0)).length() < 1e-5);
    }
}
