//! Bilinear and bicubic patches and patch meshes.
//!
//! Bicubic control data is converted to the Bezier basis on construction,
//! so splitting is the de Casteljau midpoint scheme and dicing runs on
//! third-order forward differences. Bilinear patches support the phantom
//! fourth vertex: a quad degenerated to a triangle that splits three ways.

use crate::basis::control_conversion;
use crate::bounds::Bound3;
use crate::grid::MicroGrid;
use crate::primvar::{PrimVar, PrimVarData};
use crate::surface::{
    ceil_pow2, dice_standard, normals_from_positions, subdivide_varying, Surface, SurfaceBase,
    SurfaceBox, SplitDir,
};
use glam::{Mat4, Vec3, Vec4};
use slx::{StorageClass, Value};
use tracing::warn;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Generic slot access as Vec4, shared by the subdivision and dicing code.

fn get4(pv: &PrimVar, i: usize) -> Vec4 {
    match &pv.data {
        PrimVarData::Float(v) => Vec4::new(v[i], 0.0, 0.0, 0.0),
        PrimVarData::Hpoint(v) => v[i],
        PrimVarData::Triple(v) => v[i].extend(0.0),
        PrimVarData::Str(_) => Vec4::ZERO,
    }
}

fn set4(pv: &mut PrimVar, i: usize, val: Vec4) {
    match &mut pv.data {
        PrimVarData::Float(v) => v[i] = val.x,
        PrimVarData::Hpoint(v) => v[i] = val,
        PrimVarData::Triple(v) => v[i] = val.truncate(),
        PrimVarData::Str(_) => {}
    }
}

fn write4(value: &mut Value, lane: usize, pv: &PrimVar, val: Vec4) {
    match &pv.data {
        PrimVarData::Float(_) => value.set_float(lane, val.x),
        PrimVarData::Hpoint(_) => {
            let p = if val.w != 0.0 && val.w != 1.0 {
                val.truncate() / val.w
            } else {
                val.truncate()
            };
            value.set_triple(lane, p);
        }
        PrimVarData::Triple(_) => value.set_triple(lane, val.truncate()),
        PrimVarData::Str(_) => {}
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Third-order forward differencing along one Bezier span.

struct ForwardDiff {
    f: Vec4,
    d1: Vec4,
    d2: Vec4,
    d3: Vec4,
}

impl ForwardDiff {
    fn new(b0: Vec4, b1: Vec4, b2: Vec4, b3: Vec4, h: f32) -> ForwardDiff {
        // Power-basis coefficients of the Bezier span.
        let a0 = b0;
        let a1 = (b1 - b0) * 3.0;
        let a2 = (b0 - b1 * 2.0 + b2) * 3.0;
        let a3 = -b0 + b1 * 3.0 - b2 * 3.0 + b3;
        let h2 = h * h;
        let h3 = h2 * h;
        ForwardDiff {
            f: a0,
            d1: a3 * h3 + a2 * h2 + a1 * h,
            d2: a3 * (6.0 * h3) + a2 * (2.0 * h2),
            d3: a3 * (6.0 * h3),
        }
    }

    fn value(&self) -> Vec4 {
        self.f
    }

    fn advance(&mut self) {
        self.f += self.d1;
        self.d1 += self.d2;
        self.d2 += self.d3;
    }
}

/// Dices one 16-slot Bezier variable over a grid by forward differencing
/// columns then rows.
fn bicubic_forward_dice(pv: &PrimVar, u_res: usize, v_res: usize, out: &mut Value) {
    let hv = 1.0 / v_res.max(1) as f32;
    let hu = 1.0 / u_res.max(1) as f32;
    let col = |iu: usize, iv: usize| get4(pv, iv * 4 + iu);
    let mut v_fd: Vec<ForwardDiff> = (0..4)
        .map(|iu| ForwardDiff::new(col(iu, 0), col(iu, 1), col(iu, 2), col(iu, 3), hv))
        .collect();
    for iv in 0..=v_res {
        let mut u_fd = ForwardDiff::new(
            v_fd[0].value(),
            v_fd[1].value(),
            v_fd[2].value(),
            v_fd[3].value(),
            hu,
        );
        for iu in 0..=u_res {
            write4(out, iv * (u_res + 1) + iu, pv, u_fd.value());
            u_fd.advance();
        }
        for fd in &mut v_fd {
            fd.advance();
        }
    }
}

/// De Casteljau midpoint split of a 16-slot Bezier variable.
fn bicubic_subdivide(pv: &PrimVar, along_u: bool) -> (PrimVar, PrimVar) {
    let mut a = pv.clone_shape(16);
    let mut b = pv.clone_shape(16);
    if along_u {
        for iv in 0..4 {
            let o = iv * 4;
            let p: Vec<Vec4> = (0..4).map(|i| get4(pv, o + i)).collect();
            let a1 = p[0];
            let a2 = (p[0] + p[1]) * 0.5;
            let a3 = a2 * 0.5 + (p[1] + p[2]) * 0.25;
            let b4 = p[3];
            let b3 = (p[2] + p[3]) * 0.5;
            let b2 = b3 * 0.5 + (p[1] + p[2]) * 0.25;
            let mid = (a3 + b2) * 0.5;
            set4(&mut a, o, a1);
            set4(&mut a, o + 1, a2);
            set4(&mut a, o + 2, a3);
            set4(&mut a, o + 3, mid);
            set4(&mut b, o, mid);
            set4(&mut b, o + 1, b2);
            set4(&mut b, o + 2, b3);
            set4(&mut b, o + 3, b4);
        }
    } else {
        for iu in 0..4 {
            let p: Vec<Vec4> = (0..4).map(|i| get4(pv, i * 4 + iu)).collect();
            let a1 = p[0];
            let a2 = (p[0] + p[1]) * 0.5;
            let a3 = a2 * 0.5 + (p[1] + p[2]) * 0.25;
            let b4 = p[3];
            let b3 = (p[2] + p[3]) * 0.5;
            let b2 = b3 * 0.5 + (p[1] + p[2]) * 0.25;
            let mid = (a3 + b2) * 0.5;
            set4(&mut a, iu, a1);
            set4(&mut a, 4 + iu, a2);
            set4(&mut a, 8 + iu, a3);
            set4(&mut a, 12 + iu, mid);
            set4(&mut b, iu, mid);
            set4(&mut b, 4 + iu, b2);
            set4(&mut b, 8 + iu, b3);
            set4(&mut b, 12 + iu, b4);
        }
    }
    (a, b)
}

/// Re-expresses a 16-slot variable from `(u_basis, v_basis)` into Bezier.
fn convert_patch_to_bezier(
    pv: &mut PrimVar,
    ub: &crate::basis::CubicBasis,
    vb: &crate::basis::CubicBasis,
) {
    let mut comps = [Mat4::ZERO; 4];
    for (ci, comp) in comps.iter_mut().enumerate() {
        let mut rows = [[0.0f32; 4]; 4];
        for (i, row) in rows.iter_mut().enumerate() {
            for (j, slot) in row.iter_mut().enumerate() {
                *slot = get4(pv, i * 4 + j)[ci];
            }
        }
        // Slot layout is iv*4+iu, so matrix rows follow v and columns
        // follow u.
        *comp = control_conversion(vb, ub, Mat4::from_cols_array_2d(&rows).transpose());
    }
    for i in 0..4 {
        for j in 0..4 {
            let val = Vec4::new(
                comps[0].row(i)[j],
                comps[1].row(i)[j],
                comps[2].row(i)[j],
                comps[3].row(i)[j],
            );
            set4(pv, i * 4 + j, val);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Four-corner bilinear patch, optionally with a phantom fourth vertex.
pub struct BilinearPatch {
    pub base: SurfaceBase,
    pub phantom: bool,
}

impl BilinearPatch {
    pub fn new(mut base: SurfaceBase, corners: [Vec3; 4]) -> BilinearPatch {
        base.primvars.push(PrimVar::points(&corners));
        base.set_default_primvars();
        BilinearPatch {
            base,
            phantom: false,
        }
    }

    pub fn from_base(base: SurfaceBase, phantom: bool) -> BilinearPatch {
        BilinearPatch { base, phantom }
    }

    fn corner(&self, i: usize) -> Vec3 {
        self.base.p().map(|p| p.point3(i)).unwrap_or(Vec3::ZERO)
    }
}

impl Surface for BilinearPatch {
    fn base(&self) -> &SurfaceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SurfaceBase {
        &mut self.base
    }

    fn bound(&self) -> Bound3 {
        let mut b = Bound3::empty();
        let corners = if self.phantom { 3 } else { 4 };
        for i in 0..corners {
            b.encapsulate(self.corner(i));
        }
        b.expand(self.base.motion_expand);
        b
    }

    fn transform(&mut self, m: &Mat4, _m_inv_t: &Mat4, _m_rot: &Mat4) {
        if let Some(p) = self.base.find_mut("P") {
            if let PrimVarData::Hpoint(pts) = &mut p.data {
                for v in pts.iter_mut() {
                    *v = *m * *v;
                }
            }
        }
    }

    fn diceable(&mut self, cam_to_raster: &Mat4) -> bool {
        if !self.base.diceable_flag {
            return false;
        }
        let hull: Vec<Vec3> = (0..4)
            .map(|i| cam_to_raster.project_point3(self.corner(i)))
            .collect();
        let u_len2 = (hull[1] - hull[0])
            .length_squared()
            .max((hull[3] - hull[2]).length_squared());
        let v_len2 = (hull[2] - hull[0])
            .length_squared()
            .max((hull[3] - hull[1]).length_squared());
        let rate = self.base.adjusted_shading_rate();
        let u_len = (u_len2 / rate).sqrt();
        let v_len = (v_len2 / rate).sqrt();
        self.base.split_dir = if u_len >= v_len {
            SplitDir::U
        } else {
            SplitDir::V
        };
        if u_len < f32::EPSILON || v_len < f32::EPSILON {
            self.base.discard = true;
            return false;
        }
        self.base.u_dice = (u_len.round() as usize).max(1);
        self.base.v_dice = (v_len.round() as usize).max(1);
        if self.base.attrs.dice_binary {
            self.base.u_dice = ceil_pow2(self.base.u_dice);
            self.base.v_dice = ceil_pow2(self.base.v_dice);
        }
        let gs2 = self.base.attrs.sqrt_grid_size * self.base.attrs.sqrt_grid_size;
        (self.base.u_dice as f32) <= gs2
            && (self.base.v_dice as f32) <= gs2
            && (self.base.u_dice * self.base.v_dice) as f32 <= gs2
    }

    /// Two children normally; a phantom patch splits in both directions and
    /// discards the corner at the phantom vertex, yielding three.
    fn split(&self) -> Vec<SurfaceBox> {
        let along_u = self.base.split_dir == SplitDir::U;
        let make = |primvars: Vec<PrimVar>, phantom: bool| -> SurfaceBox {
            let mut base = SurfaceBase::new(self.base.name.clone(), self.base.attrs.clone());
            self.base.inherit(&mut base);
            base.primvars = primvars;
            Box::new(BilinearPatch::from_base(base, phantom))
        };
        if !self.phantom {
            let mut a_vars = Vec::new();
            let mut b_vars = Vec::new();
            for pv in &self.base.primvars {
                let (a, b) = split_patch_var(pv, along_u);
                a_vars.push(a);
                b_vars.push(b);
            }
            return vec![make(a_vars, false), make(b_vars, false)];
        }
        // Phantom: split both ways, keep the three children that do not sit
        // on the phantom corner. The child opposite it loses phantom status.
        let mut children: Vec<Vec<PrimVar>> = vec![Vec::new(), Vec::new(), Vec::new()];
        for pv in &self.base.primvars {
            let (a, b) = split_patch_var(pv, along_u);
            let (aa, ab) = split_patch_var(&a, !along_u);
            let (ba, _bb) = split_patch_var(&b, !along_u);
            children[0].push(aa);
            children[1].push(ab);
            children[2].push(ba);
        }
        let mut out = Vec::with_capacity(3);
        let mut iter = children.into_iter();
        out.push(make(iter.next().unwrap(), false));
        out.push(make(iter.next().unwrap(), true));
        out.push(make(iter.next().unwrap(), true));
        out
    }

    fn dice(&self, grid: &mut MicroGrid) {
        dice_standard(self, grid);
        normals_from_positions(grid, self.base.attrs.flip_normals);
    }

    fn clone_surface(&self) -> SurfaceBox {
        Box::new(BilinearPatch {
            base: self.base.clone(),
            phantom: self.phantom,
        })
    }

    fn natural_dice(&self, pv: &PrimVar, u_res: usize, v_res: usize, out: &mut Value) {
        for iv in 0..=v_res {
            let fv = iv as f32 / v_res.max(1) as f32;
            for iu in 0..=u_res {
                let fu = iu as f32 / u_res.max(1) as f32;
                let val = pv.bilinear([0, 1, 2, 3], fu, fv);
                write4(out, iv * (u_res + 1) + iu, pv, val);
            }
        }
    }

    fn post_dice(&self, grid: &mut MicroGrid) {
        if self.phantom {
            grid.set_triangular(true);
        }
    }
}

/// Splits a primvar of a bilinear patch: vertex and varying both live on
/// the four corners.
fn split_patch_var(pv: &PrimVar, along_u: bool) -> (PrimVar, PrimVar) {
    match pv.class {
        StorageClass::Uniform | StorageClass::Constant => (pv.clone(), pv.clone()),
        _ => subdivide_varying(pv, along_u),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Sixteen-point bicubic patch, stored in the Bezier basis.
pub struct BicubicPatch {
    pub base: SurfaceBase,
}

impl BicubicPatch {
    /// Builds from control points in the attribute basis, converting to
    /// Bezier immediately.
    pub fn new(mut base: SurfaceBase, control: [Vec3; 16]) -> BicubicPatch {
        base.primvars.push(PrimVar::points(&control));
        base.set_default_primvars();
        let mut patch = BicubicPatch { base };
        patch.convert_to_bezier();
        patch
    }

    pub fn from_base(base: SurfaceBase) -> BicubicPatch {
        BicubicPatch { base }
    }

    fn convert_to_bezier(&mut self) {
        let attrs = self.base.attrs.clone();
        if matches!(attrs.u_basis, crate::basis::CubicBasis::Bezier)
            && matches!(attrs.v_basis, crate::basis::CubicBasis::Bezier)
        {
            return;
        }
        for pv in &mut self.base.primvars {
            if pv.class == StorageClass::Vertex {
                convert_patch_to_bezier(pv, &attrs.u_basis, &attrs.v_basis);
            }
        }
    }

    fn hull(&self) -> Vec<Vec3> {
        let p = self.base.p();
        (0..16)
            .map(|i| p.map(|p| p.point3(i)).unwrap_or(Vec3::ZERO))
            .collect()
    }
}

impl Surface for BicubicPatch {
    fn base(&self) -> &SurfaceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SurfaceBase {
        &mut self.base
    }

    fn bound(&self) -> Bound3 {
        let mut b = Bound3::empty();
        for p in self.hull() {
            b.encapsulate(p);
        }
        b.expand(self.base.motion_expand);
        b
    }

    fn transform(&mut self, m: &Mat4, _m_inv_t: &Mat4, _m_rot: &Mat4) {
        for pv in &mut self.base.primvars {
            if pv.class == StorageClass::Vertex {
                if let PrimVarData::Hpoint(pts) = &mut pv.data {
                    for v in pts.iter_mut() {
                        *v = *m * *v;
                    }
                }
            }
        }
    }

    fn diceable(&mut self, cam_to_raster: &Mat4) -> bool {
        if !self.base.diceable_flag {
            return false;
        }
        let hull: Vec<Vec3> = self
            .hull()
            .iter()
            .map(|p| cam_to_raster.project_point3(*p))
            .collect();
        let mut u_len2 = 0.0f32;
        let mut v_len2 = 0.0f32;
        for row in 0..4 {
            for k in 0..3 {
                u_len2 = u_len2.max(
                    (hull[row * 4 + k + 1] - hull[row * 4 + k]).length_squared(),
                );
                v_len2 = v_len2.max(
                    (hull[(k + 1) * 4 + row] - hull[k * 4 + row]).length_squared(),
                );
            }
        }
        let rate = self.base.adjusted_shading_rate();
        let mut u_len = (u_len2 / rate).sqrt();
        let mut v_len = (v_len2 / rate).sqrt();
        self.base.split_dir = if u_len >= v_len {
            SplitDir::U
        } else {
            SplitDir::V
        };
        // Three spans per hull edge.
        u_len *= 3.0;
        v_len *= 3.0;
        self.base.u_dice = (u_len.round() as usize).max(1);
        self.base.v_dice = (v_len.round() as usize).max(1);
        if self.base.attrs.dice_binary {
            self.base.u_dice = ceil_pow2(self.base.u_dice);
            self.base.v_dice = ceil_pow2(self.base.v_dice);
        }
        let gs = self.base.attrs.sqrt_grid_size as usize;
        self.base.u_dice <= gs && self.base.v_dice <= gs
    }

    fn split(&self) -> Vec<SurfaceBox> {
        let along_u = self.base.split_dir == SplitDir::U;
        let mut a_vars = Vec::new();
        let mut b_vars = Vec::new();
        for pv in &self.base.primvars {
            let (a, b) = match pv.class {
                StorageClass::Vertex => bicubic_subdivide(pv, along_u),
                StorageClass::Uniform | StorageClass::Constant => (pv.clone(), pv.clone()),
                _ => subdivide_varying(pv, along_u),
            };
            a_vars.push(a);
            b_vars.push(b);
        }
        let make = |primvars: Vec<PrimVar>| -> SurfaceBox {
            let mut base = SurfaceBase::new(self.base.name.clone(), self.base.attrs.clone());
            self.base.inherit(&mut base);
            base.primvars = primvars;
            Box::new(BicubicPatch::from_base(base))
        };
        vec![make(a_vars), make(b_vars)]
    }

    fn dice(&self, grid: &mut MicroGrid) {
        dice_standard(self, grid);
        normals_from_positions(grid, self.base.attrs.flip_normals);
    }

    fn clone_surface(&self) -> SurfaceBox {
        Box::new(BicubicPatch {
            base: self.base.clone(),
        })
    }

    fn natural_dice(&self, pv: &PrimVar, u_res: usize, v_res: usize, out: &mut Value) {
        if pv.len() == 16 {
            bicubic_forward_dice(pv, u_res, v_res, out);
        } else {
            warn!(name = %pv.name, "vertex variable without 16 slots on a bicubic patch");
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// A `u_patches × v_patches` array of patches over a shared control grid.
pub struct PatchMesh {
    pub base: SurfaceBase,
    pub bicubic: bool,
    pub nu: usize,
    pub nv: usize,
    pub u_periodic: bool,
    pub v_periodic: bool,
}

impl PatchMesh {
    pub fn new(
        mut base: SurfaceBase,
        bicubic: bool,
        nu: usize,
        nv: usize,
        u_periodic: bool,
        v_periodic: bool,
        points: Vec<Vec3>,
    ) -> PatchMesh {
        base.primvars.push(PrimVar::points(&points));
        let mut mesh = PatchMesh {
            base,
            bicubic,
            nu,
            nv,
            u_periodic,
            v_periodic,
        };
        mesh.add_default_varyings();
        mesh
    }

    /// Parametric defaults over the full varying grid: each patch corner
    /// carries its normalized mesh coordinate.
    fn add_default_varyings(&mut self) {
        let (varu, varv) = self.varying_extent();
        let (varu, varv) = (varu.max(1), varv.max(1));
        let mut us = Vec::with_capacity(varu * varv);
        let mut vs = Vec::with_capacity(varu * varv);
        for j in 0..varv {
            for i in 0..varu {
                us.push(i as f32 / (varu - 1).max(1) as f32);
                vs.push(j as f32 / (varv - 1).max(1) as f32);
            }
        }
        for (name, vals) in [("u", &us), ("v", &vs), ("s", &us), ("t", &vs)] {
            if self.base.find(name).is_none() {
                self.base.primvars.push(PrimVar::floats(
                    name,
                    slx::StorageClass::Varying,
                    vals.clone(),
                ));
            }
        }
    }

    pub fn u_patches(&self) -> usize {
        if self.bicubic {
            let step = self.base.attrs.u_step;
            if self.u_periodic {
                self.nu / step
            } else {
                (self.nu.saturating_sub(4)) / step + 1
            }
        } else if self.u_periodic {
            self.nu
        } else {
            self.nu - 1
        }
    }

    pub fn v_patches(&self) -> usize {
        if self.bicubic {
            let step = self.base.attrs.v_step;
            if self.v_periodic {
                self.nv / step
            } else {
                (self.nv.saturating_sub(4)) / step + 1
            }
        } else if self.v_periodic {
            self.nv
        } else {
            self.nv - 1
        }
    }

    /// Varying slot grid dimensions (one value per patch corner).
    fn varying_extent(&self) -> (usize, usize) {
        let nu = if self.u_periodic {
            self.u_patches()
        } else {
            self.u_patches() + 1
        };
        let nv = if self.v_periodic {
            self.v_patches()
        } else {
            self.v_patches() + 1
        };
        (nu, nv)
    }

    fn child_primvars(&self, pi: usize, pj: usize) -> Vec<PrimVar> {
        let (cp_side, rows) = if self.bicubic { (4, 4) } else { (2, 2) };
        let (u_step, v_step) = if self.bicubic {
            (self.base.attrs.u_step, self.base.attrs.v_step)
        } else {
            (1, 1)
        };
        let (varu, varv) = self.varying_extent();
        let mut out = Vec::with_capacity(self.base.primvars.len());
        for pv in &self.base.primvars {
            let child = match pv.class {
                StorageClass::Vertex => {
                    let mut c = pv.clone_shape(cp_side * rows);
                    for r in 0..rows {
                        for k in 0..cp_side {
                            let src_u = (pi * u_step + k) % self.nu;
                            let src_v = (pj * v_step + r) % self.nv;
                            c.copy_slot(r * cp_side + k, pv, src_v * self.nu + src_u);
                        }
                    }
                    c
                }
                StorageClass::Varying | StorageClass::FaceVarying => {
                    let mut c = pv.clone_shape(4);
                    for (slot, (dj, di)) in [(0, 0), (0, 1), (1, 0), (1, 1)].iter().enumerate() {
                        let vu = (pi + di) % varu.max(1);
                        let vv = (pj + dj) % varv.max(1);
                        let idx = (vv * varu + vu).min(pv.len().saturating_sub(1));
                        c.copy_slot(slot, pv, idx);
                    }
                    c
                }
                StorageClass::Uniform => {
                    let mut c = pv.clone_shape(1);
                    let idx = (pj * self.u_patches() + pi).min(pv.len().saturating_sub(1));
                    c.copy_slot(0, pv, idx);
                    c
                }
                StorageClass::Constant => pv.clone(),
            };
            out.push(child);
        }
        out
    }
}

impl Surface for PatchMesh {
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
        b.expand(self.base.motion_expand);
        b
    }

    fn transform(&mut self, m: &Mat4, _m_inv_t: &Mat4, _m_rot: &Mat4) {
        for pv in &mut self.base.primvars {
            if pv.class == StorageClass::Vertex {
                if let PrimVarData::Hpoint(pts) = &mut pv.data {
                    for v in pts.iter_mut() {
                        *v = *m * *v;
                    }
                }
            }
        }
    }

    /// Meshes never dice directly; they break into their patches first.
    fn diceable(&mut self, _cam_to_raster: &Mat4) -> bool {
        false
    }

    fn split(&self) -> Vec<SurfaceBox> {
        let mut out: Vec<SurfaceBox> = Vec::new();
        for pj in 0..self.v_patches() {
            for pi in 0..self.u_patches() {
                let mut base = SurfaceBase::new(self.base.name.clone(), self.base.attrs.clone());
                self.base.inherit(&mut base);
                // Children are fresh surfaces, not split halves.
                base.split_count = self.base.split_count;
                base.primvars = self.child_primvars(pi, pj);
                if self.bicubic {
                    let mut patch = BicubicPatch::from_base(base);
                    patch.convert_to_bezier();
                    out.push(Box::new(patch));
                } else {
                    out.push(Box::new(BilinearPatch::from_base(base, false)));
                }
            }
        }
        out
    }

    fn dice(&self, _grid: &mut MicroGrid) {
        warn!("patch mesh diced without splitting");
    }

    fn clone_surface(&self) -> SurfaceBox {
        Box::new(PatchMesh {
            base: self.base.clone(),
            bicubic: self.bicubic,
            nu: self.nu,
            nv: self.nv,
            u_periodic: self.u_periodic,
            v_periodic: self.v_periodic,
        })
    }

    fn natural_dice(&self, _pv: &PrimVar, _u_res: usize, _v_res: usize, _out: &mut Value) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::Attributes;
    use std::rc::Rc;

    fn planar_quad_patch() -> BicubicPatch {
        // Unit planar quad in z=0, Bezier basis: uniform 4x4 lattice.
        let mut control = [Vec3::ZERO; 16];
        for iv in 0..4 {
            for iu in 0..4 {
                control[iv * 4 + iu] = Vec3::new(iu as f32 / 3.0, iv as f32 / 3.0, 0.0);
            }
        }
        let base = SurfaceBase::new("patch", Rc::new(Attributes::default()));
        BicubicPatch::new(base, control)
    }

    #[test]
    fn bicubic_u_split_halves_the_quad() {
        let mut patch = planar_quad_patch();
        patch.base.split_dir = SplitDir::U;
        let children = patch.split();
        assert_eq!(children.len(), 2);
        let b0 = children[0].bound();
        let b1 = children[1].bound();
        assert!((b0.max.x - 0.5).abs() < 1e-6, "{b0:?}");
        assert!((b1.max.x - 1.0).abs() < 1e-6, "{b1:?}");
        assert!((b1.min.x - 0.5).abs() < 1e-6);
        // Corner control points of the children.
        let p0 = children[0].base().p().unwrap();
        assert!((p0.point3(0) - Vec3::ZERO).length() < 1e-6);
        assert!((p0.point3(3) - Vec3::new(0.5, 0.0, 0.0)).length() < 1e-6);
        assert!((p0.point3(12) - Vec3::new(0.0, 1.0, 0.0)).length() < 1e-6);
        assert!((p0.point3(15) - Vec3::new(0.5, 1.0, 0.0)).length() < 1e-6);
        let p1 = children[1].base().p().unwrap();
        assert!((p1.point3(0) - Vec3::new(0.5, 0.0, 0.0)).length() < 1e-6);
        assert!((p1.point3(3) - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn forward_dice_matches_bernstein() {
        let patch = planar_quad_patch();
        let pv = patch.base.p().unwrap();
        let (u_res, v_res) = (4, 4);
        let mut out = Value::new(
            slx::ValueType::Point,
            StorageClass::Varying,
            (u_res + 1) * (v_res + 1),
        );
        bicubic_forward_dice(pv, u_res, v_res, &mut out);
        // A uniform lattice of a planar quad evaluates to the identity map.
        for iv in 0..=v_res {
            for iu in 0..=u_res {
                let got = out.get_triple(iv * (u_res + 1) + iu);
                let want = Vec3::new(iu as f32 / 4.0, iv as f32 / 4.0, 0.0);
                assert!((got - want).length() < 1e-4, "{got:?} vs {want:?}");
            }
        }
    }

    #[test]
    fn phantom_patch_splits_three_ways() {
        let base = SurfaceBase::new("tri", Rc::new(Attributes::default()));
        let mut patch = BilinearPatch::new(
            base,
            [
                Vec3::ZERO,
                Vec3::X,
                Vec3::Y,
                Vec3::new(1.0, 1.0, 0.0),
            ],
        );
        patch.phantom = true;
        let children = patch.split();
        assert_eq!(children.len(), 3);
        // Exactly one child loses phantom status.
        let bounds: Vec<Bound3> = children.iter().map(|c| c.bound()).collect();
        let parent = patch.bound();
        for b in &bounds {
            assert!(parent.contains(b));
        }
    }

    #[test]
    fn bspline_mesh_children_convert_to_bezier() {
        // A B-spline lattice over a straight line: conversion must keep the
        // evaluated surface planar in z.
        let mut attrs = Attributes::default();
        attrs.u_basis = crate::basis::CubicBasis::BSpline;
        attrs.v_basis = crate::basis::CubicBasis::BSpline;
        attrs.u_step = 1;
        attrs.v_step = 1;
        let mut points = Vec::new();
        for iv in 0..4 {
            for iu in 0..4 {
                points.push(Vec3::new(iu as f32, iv as f32, 0.0));
            }
        }
        let base = SurfaceBase::new("mesh", Rc::new(attrs));
        let mesh = PatchMesh::new(base, true, 4, 4, false, false, points);
        assert_eq!(mesh.u_patches(), 1);
        assert_eq!(mesh.v_patches(), 1);
        let children = mesh.split();
        assert_eq!(children.len(), 1);
        let b = children[0].bound();
        assert!(b.min.z.abs() < 1e-5 && b.max.z.abs() < 1e-5);
        // B-spline to Bezier conversion shrinks the hull inside the lattice.
        assert!(b.min.x > 0.5 && b.max.x < 2.5);
    }
}
