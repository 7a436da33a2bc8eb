//! NURBS patches: knot-refinement splitting, clamping, tensor-product
//! dicing and trim-loop holes.

use crate::bounds::Bound3;
use crate::grid::MicroGrid;
use crate::primvar::{PrimVar, PrimVarData};
use crate::surface::{
    ceil_pow2, dice_standard, normals_from_positions, subdivide_varying, Surface, SurfaceBase,
    SurfaceBox, SplitDir,
};
use crate::trim::{basis_functions, point_trimmed, TrimLoop};
use glam::{Mat4, Vec2, Vec3, Vec4};
use slx::{StorageClass, Value};

/// A rational tensor-product surface of arbitrary order.
pub struct NurbsPatch {
    pub base: SurfaceBase,
    pub u_order: usize,
    pub v_order: usize,
    pub nu: usize,
    pub nv: usize,
    pub u_knots: Vec<f32>,
    pub v_knots: Vec<f32>,
    pub trim: Vec<TrimLoop>,
}

impl NurbsPatch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mut base: SurfaceBase,
        u_order: usize,
        v_order: usize,
        u_knots: Vec<f32>,
        v_knots: Vec<f32>,
        nu: usize,
        nv: usize,
        points: Vec<Vec4>,
    ) -> NurbsPatch {
        base.primvars.push(PrimVar::new(
            "P",
            StorageClass::Vertex,
            slx::ValueType::Point,
            PrimVarData::Hpoint(points),
        ));
        base.set_default_primvars();
        NurbsPatch {
            base,
            u_order,
            v_order,
            nu,
            nv,
            u_knots,
            v_knots,
            trim: Vec::new(),
        }
    }

    fn u_degree(&self) -> usize {
        self.u_order - 1
    }

    /// Parametric domain in u.
    pub fn u_domain(&self) -> (f32, f32) {
        (self.u_knots[self.u_order - 1], self.u_knots[self.nu])
    }

    pub fn v_domain(&self) -> (f32, f32) {
        (self.v_knots[self.v_order - 1], self.v_knots[self.nv])
    }

    fn find_span_u(&self, u: f32) -> usize {
        let p = self.u_degree();
        if u >= self.u_knots[self.nu] {
            return self.nu - 1;
        }
        let mut span = p;
        while span + 1 < self.u_knots.len() && self.u_knots[span + 1] <= u {
            span += 1;
        }
        span.min(self.nu - 1)
    }

    fn find_span_v(&self, v: f32) -> usize {
        let p = self.v_order - 1;
        if v >= self.v_knots[self.nv] {
            return self.nv - 1;
        }
        let mut span = p;
        while span + 1 < self.v_knots.len() && self.v_knots[span + 1] <= v {
            span += 1;
        }
        span.min(self.nv - 1)
    }

    /// Tensor-product evaluation of one vertex variable at `(u, v)`,
    /// in homogeneous form.
    pub fn evaluate_var(&self, pv: &PrimVar, u: f32, v: f32) -> Vec4 {
        let (pu, pvv) = (self.u_degree(), self.v_order - 1);
        let su = self.find_span_u(u);
        let sv = self.find_span_v(v);
        let nu_basis = basis_functions(u, su, &self.u_knots, self.u_order);
        let nv_basis = basis_functions(v, sv, &self.v_knots, self.v_order);
        let mut acc = Vec4::ZERO;
        for (j, bv) in nv_basis.iter().enumerate() {
            let row = (sv - pvv + j).min(self.nv - 1);
            for (i, bu) in nu_basis.iter().enumerate() {
                let col = (su - pu + i).min(self.nu - 1);
                acc += pv.slot4(row * self.nu + col) * (bu * bv);
            }
        }
        acc
    }

    /// Surface position at `(u, v)`.
    pub fn evaluate(&self, u: f32, v: f32) -> Vec3 {
        let p = self.base.p().expect("NURBS without P");
        let h = self.evaluate_var(p, u, v);
        if h.w != 0.0 {
            h.truncate() / h.w
        } else {
            h.truncate()
        }
    }

    /// Boehm single-value knot insertion in u, `r` times. Returns how many
    /// knots were actually inserted.
    pub fn insert_knot_u(&mut self, u: f32, r: usize) -> usize {
        let p = self.u_degree();
        if u < self.u_knots[p] || u > self.u_knots[self.nu] {
            return 0;
        }
        // Index of the last knot <= u.
        let mut k = self.u_knots.len() - 1;
        for (i, kn) in self.u_knots.iter().enumerate() {
            if *kn > u {
                k = i - 1;
                break;
            }
        }
        // Existing multiplicity at the insertion point.
        let mut s = 0usize;
        if u <= self.u_knots[k] {
            s = 1;
            let mut i = k;
            while i > p && self.u_knots[i] <= self.u_knots[i - 1] {
                s += 1;
                i -= 1;
            }
        }
        if s > p {
            return 0;
        }
        let r = r.min(p + 1 - s);
        if r == 0 {
            return 0;
        }

        let old = self.u_knots.clone();
        let old_nu = self.nu;
        self.nu += r;
        for _ in 0..r {
            self.u_knots.insert(k + 1, u);
        }
        let knot = |i: usize| old.get(i).copied().unwrap_or(*old.last().unwrap());

        let (nu, nv) = (self.nu, self.nv);
        for pv in &mut self.base.primvars {
            if pv.class != StorageClass::Vertex {
                continue;
            }
            let hold = pv.clone();
            let mut out = pv.clone_shape(nu * nv);
            for row in 0..nv {
                let src = |i: usize| hold.slot4(row * old_nu + i);
                for i in 0..=(k - p) {
                    out.set_slot4(row * nu + i, src(i));
                }
                for i in (k - s)..old_nu {
                    out.set_slot4(row * nu + i + r, src(i));
                }
                let mut rbuf: Vec<Vec4> = (0..=(p - s)).map(|i| src(k - p + i)).collect();
                let mut l = 0usize;
                for j in 1..=r {
                    l = k - p + j;
                    if p >= j + s {
                        for i in 0..=(p - j - s) {
                            let denom = knot(i + k + 1) - knot(l + i);
                            let alpha = if denom != 0.0 {
                                (u - knot(l + i)) / denom
                            } else {
                                0.0
                            };
                            rbuf[i] = rbuf[i + 1] * alpha + rbuf[i] * (1.0 - alpha);
                        }
                    }
                    out.set_slot4(row * nu + l, rbuf[0]);
                    if p > j + s {
                        out.set_slot4(row * nu + k + r - j - s, rbuf[p - j - s]);
                    }
                }
                for i in (l + 1)..(k.saturating_sub(s)) {
                    out.set_slot4(row * nu + i, rbuf[i - l]);
                }
            }
            *pv = out;
        }
        r
    }

    pub fn insert_knot_v(&mut self, v: f32, r: usize) -> usize {
        self.transpose();
        let inserted = self.insert_knot_u(v, r);
        self.transpose();
        inserted
    }

    /// Swaps the parametric directions, transposing every vertex variable.
    fn transpose(&mut self) {
        let (nu, nv) = (self.nu, self.nv);
        for pv in &mut self.base.primvars {
            if pv.class != StorageClass::Vertex {
                continue;
            }
            let hold = pv.clone();
            let mut out = pv.clone_shape(nu * nv);
            for row in 0..nv {
                for col in 0..nu {
                    out.copy_slot(col * nv + row, &hold, row * nu + col);
                }
            }
            *pv = out;
        }
        std::mem::swap(&mut self.nu, &mut self.nv);
        std::mem::swap(&mut self.u_order, &mut self.v_order);
        std::mem::swap(&mut self.u_knots, &mut self.v_knots);
        // Varying corners swap their u/v roles too.
        for pv in &mut self.base.primvars {
            if pv.class.is_varying() && !matches!(pv.class, StorageClass::Vertex) && pv.len() == 4 {
                let hold = pv.clone();
                pv.copy_slot(1, &hold, 2);
                pv.copy_slot(2, &hold, 1);
            }
        }
    }

    fn end_multiplicity(knots: &[f32], from_start: bool) -> usize {
        if from_start {
            let v = knots[0];
            knots.iter().take_while(|k| (**k - v).abs() < 1e-6).count()
        } else {
            let v = *knots.last().unwrap();
            knots
                .iter()
                .rev()
                .take_while(|k| (**k - v).abs() < 1e-6)
                .count()
        }
    }

    /// Raises the end-knot multiplicities to the order, duplicating the end
    /// control columns. Evaluation inside the original domain is unchanged
    /// (the added basis functions have no support there); applying it to an
    /// already clamped patch is a no-op.
    pub fn clamp_u(&mut self) {
        let order = self.u_order;
        let head = Self::end_multiplicity(&self.u_knots, true).min(order);
        let tail = Self::end_multiplicity(&self.u_knots, false).min(order);
        let add_head = order - head;
        let add_tail = order - tail;
        if add_head == 0 && add_tail == 0 {
            return;
        }
        let first = self.u_knots[0];
        let last = *self.u_knots.last().unwrap();
        for _ in 0..add_head {
            self.u_knots.insert(0, first);
        }
        for _ in 0..add_tail {
            self.u_knots.push(last);
        }
        let (old_nu, nv) = (self.nu, self.nv);
        self.nu += add_head + add_tail;
        let nu = self.nu;
        for pv in &mut self.base.primvars {
            if pv.class != StorageClass::Vertex {
                continue;
            }
            let hold = pv.clone();
            let mut out = pv.clone_shape(nu * nv);
            for row in 0..nv {
                for col in 0..nu {
                    let src = col
                        .saturating_sub(add_head)
                        .min(old_nu - 1);
                    out.copy_slot(row * nu + col, &hold, row * old_nu + src);
                }
            }
            *pv = out;
        }
    }

    pub fn clamp_v(&mut self) {
        self.transpose();
        self.clamp_u();
        self.transpose();
    }

    pub fn clamp(&mut self) {
        self.clamp_u();
        self.clamp_v();
    }

    fn clone_patch(&self) -> NurbsPatch {
        NurbsPatch {
            base: self.base.clone(),
            u_order: self.u_order,
            v_order: self.v_order,
            nu: self.nu,
            nv: self.nv,
            u_knots: self.u_knots.clone(),
            v_knots: self.v_knots.clone(),
            trim: self.trim.clone(),
        }
    }

    /// Splits at `value` in u by inserting it to full order multiplicity
    /// and partitioning knots and control columns.
    pub fn split_at_u(&self, value: f32) -> (NurbsPatch, NurbsPatch) {
        let mut refined = self.clone_patch();
        refined.insert_knot_u(value, refined.u_order);
        let fk = refined
            .u_knots
            .iter()
            .position(|k| (*k - value).abs() < 1e-6)
            .unwrap_or(refined.u_order);
        let order = refined.u_order;
        let nu_a = fk;
        let nu_b = refined.nu - fk;

        let make = |cols: std::ops::Range<usize>, knots: Vec<f32>, lower: bool| -> NurbsPatch {
            let nu_child = cols.len();
            let mut base = SurfaceBase::new(refined.base.name.clone(), refined.base.attrs.clone());
            refined.base.inherit(&mut base);
            for pv in &refined.base.primvars {
                match pv.class {
                    StorageClass::Vertex => {
                        let mut c = pv.clone_shape(nu_child * refined.nv);
                        for row in 0..refined.nv {
                            for (dst, srccol) in cols.clone().enumerate() {
                                c.copy_slot(row * nu_child + dst, pv, row * refined.nu + srccol);
                            }
                        }
                        base.primvars.push(c);
                    }
                    StorageClass::Uniform | StorageClass::Constant => {
                        base.primvars.push(pv.clone())
                    }
                    _ => {
                        let (a, b) = subdivide_varying(pv, true);
                        base.primvars.push(if lower { a } else { b });
                    }
                }
            }
            NurbsPatch {
                base,
                u_order: order,
                v_order: refined.v_order,
                nu: nu_child,
                nv: refined.nv,
                u_knots: knots,
                v_knots: refined.v_knots.clone(),
                trim: refined.trim.clone(),
            }
        };

        let knots_a = refined.u_knots[..fk + order].to_vec();
        let knots_b = refined.u_knots[fk..].to_vec();
        let a = make(0..nu_a, knots_a, true);
        let b = make(fk..fk + nu_b, knots_b, false);
        (a, b)
    }

    pub fn split_at_v(&self, value: f32) -> (NurbsPatch, NurbsPatch) {
        let mut t = self.clone_patch();
        t.transpose();
        let (mut a, mut b) = t.split_at_u(value);
        a.transpose();
        b.transpose();
        (a, b)
    }

    /// Breaks the patch at every distinct interior knot, yielding
    /// single-segment patches.
    pub fn subdivide_segments(self) -> Vec<NurbsPatch> {
        let mut queue = vec![self];
        let mut out = Vec::new();
        while let Some(patch) = queue.pop() {
            let (u0, u1) = patch.u_domain();
            let interior_u = patch
                .u_knots
                .iter()
                .copied()
                .find(|k| *k > u0 + 1e-6 && *k < u1 - 1e-6);
            if let Some(k) = interior_u {
                let (a, b) = patch.split_at_u(k);
                queue.push(a);
                queue.push(b);
                continue;
            }
            let (v0, v1) = patch.v_domain();
            let interior_v = patch
                .v_knots
                .iter()
                .copied()
                .find(|k| *k > v0 + 1e-6 && *k < v1 - 1e-6);
            if let Some(k) = interior_v {
                let (a, b) = patch.split_at_v(k);
                queue.push(a);
                queue.push(b);
                continue;
            }
            out.push(patch);
        }
        out
    }

    /// Decimated trim loops in parameter space, sized to the grid.
    fn decimated_trim(&self, u_res: usize, v_res: usize) -> Vec<Vec<Vec2>> {
        let segments = (u_res.max(v_res) * 2).clamp(8, 256);
        self.trim.iter().map(|l| l.decimate(segments)).collect()
    }
}

impl Surface for NurbsPatch {
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
                        // Control points are x·w homogeneous; transform the
                        // dehomogenized point and rescale.
                        let w = v.w;
                        let p = if w != 0.0 { v.truncate() / w } else { v.truncate() };
                        let t = m.transform_point3(p);
                        *v = (t * if w != 0.0 { w } else { 1.0 }).extend(v.w);
                    }
                }
            }
        }
    }

    fn diceable(&mut self, cam_to_raster: &Mat4) -> bool {
        if !self.base.diceable_flag {
            return false;
        }
        let Some(p) = self.base.p() else {
            self.base.discard = true;
            return false;
        };
        let mut u_len = 0.0f32;
        let mut v_len = 0.0f32;
        for row in 0..self.nv {
            let mut len = 0.0;
            for col in 1..self.nu {
                let a = cam_to_raster.project_point3(p.point3(row * self.nu + col - 1));
                let b = cam_to_raster.project_point3(p.point3(row * self.nu + col));
                len += (b - a).length();
            }
            u_len = u_len.max(len);
        }
        for col in 0..self.nu {
            let mut len = 0.0;
            for row in 1..self.nv {
                let a = cam_to_raster.project_point3(p.point3((row - 1) * self.nu + col));
                let b = cam_to_raster.project_point3(p.point3(row * self.nu + col));
                len += (b - a).length();
            }
            v_len = v_len.max(len);
        }
        let rate = self.base.adjusted_shading_rate().sqrt();
        let u = (u_len / rate).ceil().max(1.0) as usize;
        let v = (v_len / rate).ceil().max(1.0) as usize;
        self.base.split_dir = if u >= v { SplitDir::U } else { SplitDir::V };
        self.base.u_dice = u;
        self.base.v_dice = v;
        if self.base.attrs.dice_binary {
            self.base.u_dice = ceil_pow2(u);
            self.base.v_dice = ceil_pow2(v);
        }
        let gs = self.base.attrs.sqrt_grid_size as usize;
        self.base.u_dice <= gs && self.base.v_dice <= gs
    }

    fn split(&self) -> Vec<SurfaceBox> {
        let (a, b) = match self.base.split_dir {
            SplitDir::U => {
                let (u0, u1) = self.u_domain();
                self.split_at_u(0.5 * (u0 + u1))
            }
            SplitDir::V => {
                let (v0, v1) = self.v_domain();
                self.split_at_v(0.5 * (v0 + v1))
            }
        };
        vec![Box::new(a), Box::new(b)]
    }

    fn dice(&self, grid: &mut MicroGrid) {
        dice_standard(self, grid);
        normals_from_positions(grid, self.base.attrs.flip_normals);
        if !self.trim.is_empty() {
            let (u_res, v_res) = (grid.u_res(), grid.v_res());
            let loops = self.decimated_trim(u_res, v_res);
            let (u0, u1) = self.u_domain();
            let (v0, v1) = self.v_domain();
            for iv in 0..=v_res {
                let v = v0 + (v1 - v0) * iv as f32 / v_res.max(1) as f32;
                for iu in 0..=u_res {
                    let u = u0 + (u1 - u0) * iu as f32 / u_res.max(1) as f32;
                    if point_trimmed(&loops, Vec2::new(u, v)) {
                        grid.set_hole(iv * (u_res + 1) + iu);
                    }
                }
            }
        }
    }

    fn clone_surface(&self) -> SurfaceBox {
        Box::new(self.clone_patch())
    }

    fn natural_dice(&self, pv: &PrimVar, u_res: usize, v_res: usize, out: &mut Value) {
        let (u0, u1) = self.u_domain();
        let (v0, v1) = self.v_domain();
        for iv in 0..=v_res {
            let v = v0 + (v1 - v0) * iv as f32 / v_res.max(1) as f32;
            for iu in 0..=u_res {
                let u = u0 + (u1 - u0) * iu as f32 / u_res.max(1) as f32;
                let h = self.evaluate_var(pv, u, v);
                let lane = iv * (u_res + 1) + iu;
                match &pv.data {
                    PrimVarData::Float(_) => out.set_float(lane, h.x),
                    PrimVarData::Hpoint(_) => {
                        let p = if h.w != 0.0 { h.truncate() / h.w } else { h.truncate() };
                        out.set_triple(lane, p);
                    }
                    PrimVarData::Triple(_) => out.set_triple(lane, h.truncate()),
                    PrimVarData::Str(_) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::Attributes;
    use std::rc::Rc;

    /// Clamped cubic over a 4x2 control grid, planar in z.
    fn simple_patch() -> NurbsPatch {
        let mut points = Vec::new();
        for row in 0..2 {
            for col in 0..4 {
                points.push(Vec4::new(col as f32, row as f32, 0.0, 1.0));
            }
        }
        let base = SurfaceBase::new("nurbs", Rc::new(Attributes::default()));
        NurbsPatch::new(
            base,
            4,
            2,
            vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0],
            vec![0.0, 0.0, 1.0, 1.0],
            4,
            2,
            points,
        )
    }

    /// Scenario-C patch: cubic, unclamped ends in u.
    fn unclamped_patch() -> NurbsPatch {
        let mut points = Vec::new();
        for row in 0..2 {
            for col in 0..5 {
                points.push(Vec4::new(col as f32, (col as f32).sin() + row as f32, 0.0, 1.0));
            }
        }
        let base = SurfaceBase::new("nurbs", Rc::new(Attributes::default()));
        NurbsPatch::new(
            base,
            4,
            2,
            vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 4.0, 4.0],
            vec![0.0, 0.0, 1.0, 1.0],
            5,
            2,
            points,
        )
    }

    #[test]
    fn evaluation_hits_clamped_corners() {
        let p = simple_patch();
        assert!((p.evaluate(0.0, 0.0) - Vec3::new(0.0, 0.0, 0.0)).length() < 1e-5);
        assert!((p.evaluate(1.0, 0.0) - Vec3::new(3.0, 0.0, 0.0)).length() < 1e-5);
        assert!((p.evaluate(1.0, 1.0) - Vec3::new(3.0, 1.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn knot_insertion_preserves_the_surface() {
        let mut refined = simple_patch();
        let reference = simple_patch();
        assert_eq!(refined.insert_knot_u(0.5, 1), 1);
        assert_eq!(refined.nu, 5);
        for i in 0..=10 {
            for j in 0..=4 {
                let (u, v) = (i as f32 / 10.0, j as f32 / 4.0);
                let a = reference.evaluate(u, v);
                let b = refined.evaluate(u, v);
                assert!((a - b).length() < 1e-4, "({u},{v}): {a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn clamp_repeats_end_knots_to_order() {
        let mut p = unclamped_patch();
        let reference = unclamped_patch();
        p.clamp_u();
        assert_eq!(
            p.u_knots,
            vec![0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 4.0, 4.0, 4.0]
        );
        // Evaluation inside the original domain is untouched.
        let before = reference.evaluate(2.0, 0.5);
        let after = p.evaluate(2.0, 0.5);
        assert!((before - after).length() < 1e-4, "{before:?} vs {after:?}");
    }

    #[test]
    fn clamp_is_idempotent_on_clamped_patches() {
        let mut p = simple_patch();
        let knots = p.u_knots.clone();
        p.clamp_u();
        assert_eq!(p.u_knots, knots);
        assert_eq!(p.nu, 4);
    }

    #[test]
    fn split_children_stay_inside_parent() {
        let mut p = simple_patch();
        p.base.split_dir = SplitDir::U;
        let parent = p.bound();
        for child in p.split() {
            assert!(parent.contains(&child.bound()));
        }
    }

    #[test]
    fn split_halves_evaluate_like_parent() {
        let p = simple_patch();
        let (a, b) = p.split_at_u(0.5);
        // Left child covers u in [0, 0.5].
        let pa = a.evaluate(0.25, 0.5);
        let pp = p.evaluate(0.25, 0.5);
        assert!((pa - pp).length() < 1e-4, "{pa:?} vs {pp:?}");
        let pb = b.evaluate(0.75, 0.5);
        let pq = p.evaluate(0.75, 0.5);
        assert!((pb - pq).length() < 1e-4);
    }

    #[test]
    fn segment_subdivision_splits_interior_knots() {
        let p = unclamped_patch();
        let segs = p.subdivide_segments();
        // The domain [1, 3] has one distinct interior knot, at 2.
        assert_eq!(segs.len(), 2);
        for s in &segs {
            let (u0, u1) = s.u_domain();
            assert!(
                !s.u_knots.iter().any(|k| *k > u0 + 1e-6 && *k < u1 - 1e-6),
                "segment still has interior knots"
            );
        }
    }

    #[test]
    fn trim_loops_mark_holes() {
        use crate::trim::TrimCurve;
        let mut p = simple_patch();
        // A square loop in the middle of parameter space, as four linear
        // trim curve segments.
        let corners = [
            Vec2::new(0.3, 0.3),
            Vec2::new(0.7, 0.3),
            Vec2::new(0.7, 0.7),
            Vec2::new(0.3, 0.7),
        ];
        let mut lp = TrimLoop::default();
        for i in 0..4 {
            let a = corners[i];
            let b = corners[(i + 1) % 4];
            lp.curves.push(TrimCurve {
                order: 2,
                knots: vec![0.0, 0.0, 1.0, 1.0],
                points: vec![Vec3::new(a.x, a.y, 1.0), Vec3::new(b.x, b.y, 1.0)],
            });
        }
        p.trim.push(lp);
        let mut grid = MicroGrid::new(8, 8);
        p.dice(&mut grid);
        // Center lane is outside the loop interior rule? The loop keeps its
        // interior: a lane at (0.5, 0.5) survives, a corner lane does not.
        assert!(!grid.is_hole(grid.lane(4, 4)));
        assert!(grid.is_hole(grid.lane(0, 0)));
    }
}
