//! Analytic quadric surfaces: sphere, cone, cylinder, hyperboloid,
//! paraboloid, torus and disk.
//!
//! Points and normals are evaluated from incremental sin/cos tables, so a
//! dice costs O(uRes+vRes) trig calls. Bounds are built by revolving the
//! profile curve and enclosing the sweep with piecewise-Bezier arcs (four
//! sub-arcs per quarter turn).

use crate::bounds::Bound3;
use crate::grid::MicroGrid;
use crate::surface::{
    ceil_pow2, dice_standard, subdivide_varying, Surface, SurfaceBase, SurfaceBox, SplitDir,
};
use crate::primvar::PrimVar;
use glam::{Mat4, Vec3};
use slx::{EnvVar, Value};

/// Probe resolution for the raster-size estimate.
const ESTIMATE_GRID_SIZE: usize = 8;
/// Dice budget above which a quadric must split regardless of rate.
const TOO_LARGE_QUADS: usize = 65536;

/// Canonical parameters of each quadric kind. Angles are in degrees, as
/// they arrive from the request stream.
#[derive(Clone, Debug)]
pub enum QuadricKind {
    Sphere {
        radius: f32,
        phi_min: f32,
        phi_max: f32,
        theta_min: f32,
        theta_max: f32,
    },
    Cone {
        height: f32,
        radius: f32,
        v_min: f32,
        v_max: f32,
        theta_min: f32,
        theta_max: f32,
    },
    Cylinder {
        radius: f32,
        z_min: f32,
        z_max: f32,
        theta_min: f32,
        theta_max: f32,
    },
    Hyperboloid {
        point1: Vec3,
        point2: Vec3,
        theta_min: f32,
        theta_max: f32,
    },
    Paraboloid {
        r_max: f32,
        z_min: f32,
        z_max: f32,
        theta_min: f32,
        theta_max: f32,
    },
    Torus {
        major: f32,
        minor: f32,
        phi_min: f32,
        phi_max: f32,
        theta_min: f32,
        theta_max: f32,
    },
    Disk {
        height: f32,
        minor: f32,
        major: f32,
        theta_min: f32,
        theta_max: f32,
    },
}

pub struct Quadric {
    pub base: SurfaceBase,
    pub kind: QuadricKind,
}

impl Quadric {
    pub fn new(base: SurfaceBase, kind: QuadricKind) -> Quadric {
        let mut q = Quadric { base, kind };
        q.base.set_default_primvars();
        q
    }

    /// RiSphere parameters: z-range converted to latitude.
    pub fn sphere(
        base: SurfaceBase,
        radius: f32,
        z_min: f32,
        z_max: f32,
        theta_min: f32,
        theta_max: f32,
    ) -> Quadric {
        let r = radius.abs().max(1e-6);
        let clamp_z = |z: f32| (z / r).clamp(-1.0, 1.0);
        Quadric::new(
            base,
            QuadricKind::Sphere {
                radius,
                phi_min: clamp_z(z_min).asin(),
                phi_max: clamp_z(z_max).asin(),
                theta_min,
                theta_max,
            },
        )
    }

    /// Evaluates the object-space point grid (and normals when requested).
    pub fn dice_points(
        &self,
        u_res: usize,
        v_res: usize,
        points: &mut [Vec3],
        mut normals: Option<&mut [Vec3]>,
    ) {
        let theta_res = u_res + 1;
        let v_count = v_res + 1;
        match &self.kind {
            QuadricKind::Sphere {
                radius,
                phi_min,
                phi_max,
                theta_min,
                theta_max,
            } => {
                let (sin_t, cos_t) =
                    sin_cos_grid(theta_min.to_radians(), theta_max.to_radians(), theta_res);
                let (sin_p, cos_p) = sin_cos_grid(*phi_min, *phi_max, v_count);
                for iv in 0..v_count {
                    for iu in 0..theta_res {
                        let unit = Vec3::new(
                            cos_t[iu] * cos_p[iv],
                            sin_t[iu] * cos_p[iv],
                            sin_p[iv],
                        );
                        let lane = iv * theta_res + iu;
                        points[lane] = *radius * unit;
                        if let Some(n) = normals.as_deref_mut() {
                            n[lane] = unit;
                        }
                    }
                }
            }
            QuadricKind::Cone {
                height,
                radius,
                v_min,
                v_max,
                theta_min,
                theta_max,
            } => {
                let (sin_t, cos_t) =
                    sin_cos_grid(theta_min.to_radians(), theta_max.to_radians(), theta_res);
                let len = (height * height + radius * radius).sqrt().max(1e-9);
                let xn = height / len;
                let zn = radius / len;
                for iv in 0..v_count {
                    let fv = iv as f32 / v_res.max(1) as f32;
                    let vv = v_min + fv * (v_max - v_min);
                    let z = vv * height;
                    let r = radius * (1.0 - vv);
                    for iu in 0..theta_res {
                        let lane = iv * theta_res + iu;
                        points[lane] = Vec3::new(r * cos_t[iu], r * sin_t[iu], z);
                        if let Some(n) = normals.as_deref_mut() {
                            n[lane] = Vec3::new(xn * cos_t[iu], xn * sin_t[iu], zn);
                        }
                    }
                }
            }
            QuadricKind::Cylinder {
                radius,
                z_min,
                z_max,
                theta_min,
                theta_max,
            } => {
                let (sin_t, cos_t) =
                    sin_cos_grid(theta_min.to_radians(), theta_max.to_radians(), theta_res);
                for iv in 0..v_count {
                    let z = z_min + (z_max - z_min) * iv as f32 / v_res.max(1) as f32;
                    for iu in 0..theta_res {
                        let lane = iv * theta_res + iu;
                        points[lane] = Vec3::new(radius * cos_t[iu], radius * sin_t[iu], z);
                        if let Some(n) = normals.as_deref_mut() {
                            n[lane] = Vec3::new(cos_t[iu], sin_t[iu], 0.0);
                        }
                    }
                }
            }
            QuadricKind::Hyperboloid {
                point1,
                point2,
                theta_min,
                theta_max,
            } => {
                let (sin_t, cos_t) =
                    sin_cos_grid(theta_min.to_radians(), theta_max.to_radians(), theta_res);
                let theta_span = (theta_max - theta_min).to_radians();
                for iv in 0..v_count {
                    let vv = iv as f32 / v_res.max(1) as f32;
                    let p = *point1 * (1.0 - vv) + *point2 * vv;
                    for iu in 0..theta_res {
                        let (st, ct) = (sin_t[iu], cos_t[iu]);
                        let lane = iv * theta_res + iu;
                        points[lane] =
                            Vec3::new(p.x * ct - p.y * st, p.x * st + p.y * ct, p.z);
                        if let Some(n) = normals.as_deref_mut() {
                            // General two-parameter surface normal: a × b.
                            let a = Vec3::new(
                                -p.x * theta_span * st - p.y * theta_span * ct,
                                p.x * theta_span * ct - p.y * theta_span * st,
                                0.0,
                            );
                            let d = *point2 - *point1;
                            let b = Vec3::new(d.x * ct - d.y * st, d.x * st + d.y * ct, d.z);
                            n[lane] = a.cross(b);
                        }
                    }
                }
            }
            QuadricKind::Paraboloid {
                r_max,
                z_min,
                z_max,
                theta_min,
                theta_max,
            } => {
                let (sin_t, cos_t) =
                    sin_cos_grid(theta_min.to_radians(), theta_max.to_radians(), theta_res);
                for iv in 0..v_count {
                    let z = z_min + (z_max - z_min) * iv as f32 / v_res.max(1) as f32;
                    let r = r_max * (z / z_max).max(0.0).sqrt();
                    for iu in 0..theta_res {
                        let lane = iv * theta_res + iu;
                        points[lane] = Vec3::new(r * cos_t[iu], r * sin_t[iu], z);
                        if let Some(n) = normals.as_deref_mut() {
                            let nz = if r == 0.0 {
                                -1.0
                            } else {
                                -0.5 * r_max * r_max / z_max / r
                            };
                            n[lane] = Vec3::new(cos_t[iu], sin_t[iu], nz);
                        }
                    }
                }
            }
            QuadricKind::Torus {
                major,
                minor,
                phi_min,
                phi_max,
                theta_min,
                theta_max,
            } => {
                let (sin_t, cos_t) =
                    sin_cos_grid(theta_min.to_radians(), theta_max.to_radians(), theta_res);
                let (sin_p, cos_p) =
                    sin_cos_grid(phi_min.to_radians(), phi_max.to_radians(), v_count);
                for iv in 0..v_count {
                    let r = minor * cos_p[iv];
                    let z = minor * sin_p[iv];
                    for iu in 0..theta_res {
                        let lane = iv * theta_res + iu;
                        points[lane] =
                            Vec3::new((major + r) * cos_t[iu], (major + r) * sin_t[iu], z);
                        if let Some(n) = normals.as_deref_mut() {
                            n[lane] =
                                Vec3::new(cos_p[iv] * cos_t[iu], cos_p[iv] * sin_t[iu], sin_p[iv]);
                        }
                    }
                }
            }
            QuadricKind::Disk {
                height,
                minor,
                major,
                theta_min,
                theta_max,
            } => {
                let (sin_t, cos_t) =
                    sin_cos_grid(theta_min.to_radians(), theta_max.to_radians(), theta_res);
                for iv in 0..v_count {
                    let r = major - (major - minor) * iv as f32 / v_res.max(1) as f32;
                    for iu in 0..theta_res {
                        let lane = iv * theta_res + iu;
                        points[lane] = Vec3::new(r * cos_t[iu], r * sin_t[iu], *height);
                        if let Some(n) = normals.as_deref_mut() {
                            n[lane] = Vec3::new(0.0, 0.0, if *theta_max > 0.0 { 1.0 } else { -1.0 });
                        }
                    }
                }
            }
        }
    }

    fn estimate_grid_size(&mut self, cam_to_raster: &Mat4) -> usize {
        const R: usize = ESTIMATE_GRID_SIZE;
        let to_raster = *cam_to_raster * self.base.object_to_camera;
        let mut points = vec![Vec3::ZERO; (R + 1) * (R + 1)];
        self.dice_points(R, R, &mut points, None);
        let mut max_u2 = 0.0f32;
        let mut max_v2 = 0.0f32;
        for iv in 0..=R {
            for iu in 0..=R {
                points[iv * (R + 1) + iu] =
                    to_raster.project_point3(points[iv * (R + 1) + iu]);
            }
        }
        for iv in 1..=R {
            for iu in 1..=R {
                let p = points[iv * (R + 1) + iu];
                let pu = points[iv * (R + 1) + iu - 1];
                let pv = points[(iv - 1) * (R + 1) + iu];
                max_u2 = max_u2.max((p - pu).length_squared());
                max_v2 = max_v2.max((p - pv).length_squared());
            }
        }
        let sqrt_rate = self.base.adjusted_shading_rate().sqrt();
        let u = (R as f32 * max_u2.sqrt() / sqrt_rate).ceil().max(1.0) as usize;
        let v = (R as f32 * max_v2.sqrt() / sqrt_rate).ceil().max(1.0) as usize;
        self.base.u_dice = u;
        self.base.v_dice = v;
        if self.base.attrs.dice_binary {
            self.base.u_dice = ceil_pow2(self.base.u_dice);
            self.base.v_dice = ceil_pow2(self.base.v_dice);
        }
        self.base.u_dice * self.base.v_dice
    }

    /// Halves the parametric range; `u` selects the θ direction.
    fn half(&self, lower: bool, along_u: bool) -> Quadric {
        use QuadricKind::*;
        let pick = |lo: f32, hi: f32| -> (f32, f32) {
            let mid = 0.5 * (lo + hi);
            if lower {
                (lo, mid)
            } else {
                (mid, hi)
            }
        };
        let kind = match &self.kind {
            Sphere {
                radius,
                phi_min,
                phi_max,
                theta_min,
                theta_max,
            } => {
                if along_u {
                    let (t0, t1) = pick(*theta_min, *theta_max);
                    Sphere {
                        radius: *radius,
                        phi_min: *phi_min,
                        phi_max: *phi_max,
                        theta_min: t0,
                        theta_max: t1,
                    }
                } else {
                    let (p0, p1) = pick(*phi_min, *phi_max);
                    Sphere {
                        radius: *radius,
                        phi_min: p0,
                        phi_max: p1,
                        theta_min: *theta_min,
                        theta_max: *theta_max,
                    }
                }
            }
            Cone {
                height,
                radius,
                v_min,
                v_max,
                theta_min,
                theta_max,
            } => {
                if along_u {
                    let (t0, t1) = pick(*theta_min, *theta_max);
                    Cone {
                        height: *height,
                        radius: *radius,
                        v_min: *v_min,
                        v_max: *v_max,
                        theta_min: t0,
                        theta_max: t1,
                    }
                } else {
                    let (v0, v1) = pick(*v_min, *v_max);
                    Cone {
                        height: *height,
                        radius: *radius,
                        v_min: v0,
                        v_max: v1,
                        theta_min: *theta_min,
                        theta_max: *theta_max,
                    }
                }
            }
            Cylinder {
                radius,
                z_min,
                z_max,
                theta_min,
                theta_max,
            } => {
                if along_u {
                    let (t0, t1) = pick(*theta_min, *theta_max);
                    Cylinder {
                        radius: *radius,
                        z_min: *z_min,
                        z_max: *z_max,
                        theta_min: t0,
                        theta_max: t1,
                    }
                } else {
                    let (z0, z1) = pick(*z_min, *z_max);
                    Cylinder {
                        radius: *radius,
                        z_min: z0,
                        z_max: z1,
                        theta_min: *theta_min,
                        theta_max: *theta_max,
                    }
                }
            }
            Hyperboloid {
                point1,
                point2,
                theta_min,
                theta_max,
            } => {
                if along_u {
                    let (t0, t1) = pick(*theta_min, *theta_max);
                    Hyperboloid {
                        point1: *point1,
                        point2: *point2,
                        theta_min: t0,
                        theta_max: t1,
                    }
                } else {
                    let mid = (*point1 + *point2) * 0.5;
                    if lower {
                        Hyperboloid {
                            point1: *point1,
                            point2: mid,
                            theta_min: *theta_min,
                            theta_max: *theta_max,
                        }
                    } else {
                        Hyperboloid {
                            point1: mid,
                            point2: *point2,
                            theta_min: *theta_min,
                            theta_max: *theta_max,
                        }
                    }
                }
            }
            Paraboloid {
                r_max,
                z_min,
                z_max,
                theta_min,
                theta_max,
            } => {
                if along_u {
                    let (t0, t1) = pick(*theta_min, *theta_max);
                    Paraboloid {
                        r_max: *r_max,
                        z_min: *z_min,
                        z_max: *z_max,
                        theta_min: t0,
                        theta_max: t1,
                    }
                } else {
                    let (z0, z1) = pick(*z_min, *z_max);
                    Paraboloid {
                        r_max: *r_max,
                        z_min: z0,
                        z_max: z1,
                        theta_min: *theta_min,
                        theta_max: *theta_max,
                    }
                }
            }
            Torus {
                major,
                minor,
                phi_min,
                phi_max,
                theta_min,
                theta_max,
            } => {
                if along_u {
                    let (t0, t1) = pick(*theta_min, *theta_max);
                    Torus {
                        major: *major,
                        minor: *minor,
                        phi_min: *phi_min,
                        phi_max: *phi_max,
                        theta_min: t0,
                        theta_max: t1,
                    }
                } else {
                    let (p0, p1) = pick(*phi_min, *phi_max);
                    Torus {
                        major: *major,
                        minor: *minor,
                        phi_min: p0,
                        phi_max: p1,
                        theta_min: *theta_min,
                        theta_max: *theta_max,
                    }
                }
            }
            Disk {
                height,
                minor,
                major,
                theta_min,
                theta_max,
            } => {
                if along_u {
                    let (t0, t1) = pick(*theta_min, *theta_max);
                    Disk {
                        height: *height,
                        minor: *minor,
                        major: *major,
                        theta_min: t0,
                        theta_max: t1,
                    }
                } else {
                    // v runs from the outer radius inward.
                    let mid = 0.5 * (*major + *minor);
                    if lower {
                        Disk {
                            height: *height,
                            minor: mid,
                            major: *major,
                            theta_min: *theta_min,
                            theta_max: *theta_max,
                        }
                    } else {
                        Disk {
                            height: *height,
                            minor: *minor,
                            major: mid,
                            theta_min: *theta_min,
                            theta_max: *theta_max,
                        }
                    }
                }
            }
        };
        let mut base = SurfaceBase::new(self.base.name.clone(), self.base.attrs.clone());
        self.base.inherit(&mut base);
        for pv in &self.base.primvars {
            let (a, b) = subdivide_varying(pv, along_u);
            base.primvars.push(if lower { a } else { b });
        }
        Quadric { base, kind }
    }

    /// The profile polyline revolved for the bound, already rotated to the
    /// start angle.
    fn bound_profile(&self) -> (Vec<Vec3>, f32) {
        use QuadricKind::*;
        let (mut profile, theta_min, theta_max) = match &self.kind {
            Sphere {
                radius,
                phi_min,
                phi_max,
                theta_min,
                theta_max,
            } => (
                circle(
                    Vec3::ZERO,
                    Vec3::X,
                    Vec3::Z,
                    *radius,
                    phi_min.min(*phi_max),
                    phi_min.max(*phi_max),
                ),
                *theta_min,
                *theta_max,
            ),
            Cone {
                height,
                radius,
                v_min,
                v_max,
                theta_min,
                theta_max,
            } => (
                vec![
                    Vec3::new(*radius, 0.0, v_min * height),
                    Vec3::new(0.0, 0.0, v_max * height),
                ],
                *theta_min,
                *theta_max,
            ),
            Cylinder {
                radius,
                z_min,
                z_max,
                theta_min,
                theta_max,
            } => (
                vec![
                    Vec3::new(*radius, 0.0, *z_min),
                    Vec3::new(*radius, 0.0, *z_max),
                ],
                *theta_min,
                *theta_max,
            ),
            Hyperboloid {
                point1,
                point2,
                theta_min,
                theta_max,
            } => (vec![*point1, *point2], *theta_min, *theta_max),
            Paraboloid {
                r_max,
                z_min,
                z_max,
                theta_min,
                theta_max,
            } => (
                vec![
                    Vec3::new(*r_max, 0.0, *z_min),
                    Vec3::new(*r_max, 0.0, *z_max),
                    Vec3::new(0.0, 0.0, *z_min),
                ],
                *theta_min,
                *theta_max,
            ),
            Torus {
                major,
                minor,
                phi_min,
                phi_max,
                theta_min,
                theta_max,
            } => (
                circle(
                    Vec3::new(*major, 0.0, 0.0),
                    Vec3::X,
                    Vec3::Z,
                    *minor,
                    phi_min.min(*phi_max).to_radians(),
                    phi_min.max(*phi_max).to_radians(),
                ),
                *theta_min,
                *theta_max,
            ),
            Disk {
                height,
                minor,
                major,
                theta_min,
                theta_max,
            } => (
                vec![
                    Vec3::new(*major, 0.0, *height),
                    Vec3::new(*minor, 0.0, *height),
                ],
                *theta_min,
                *theta_max,
            ),
        };
        let rot = Mat4::from_rotation_z(theta_min.to_radians());
        for p in &mut profile {
            *p = rot.transform_point3(*p);
        }
        (profile, (theta_max - theta_min).to_radians())
    }
}

impl Surface for Quadric {
    fn base(&self) -> &SurfaceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut SurfaceBase {
        &mut self.base
    }

    fn bound(&self) -> Bound3 {
        let (profile, theta) = self.bound_profile();
        let mut b = revolve_for_bound(&profile, Vec3::ZERO, Vec3::Z, theta);
        b = b.transform(&self.base.object_to_camera);
        b.expand(self.base.motion_expand);
        b
    }

    fn transform(&mut self, m: &Mat4, m_inv_t: &Mat4, _m_rot: &Mat4) {
        self.base.object_to_camera = *m * self.base.object_to_camera;
        self.base.normal_matrix = *m_inv_t * self.base.normal_matrix;
    }

    fn diceable(&mut self, cam_to_raster: &Mat4) -> bool {
        if !self.base.diceable_flag {
            return false;
        }
        let total = self.estimate_grid_size(cam_to_raster);
        self.base.split_dir = if self.base.u_dice >= self.base.v_dice {
            SplitDir::U
        } else {
            SplitDir::V
        };
        if total > TOO_LARGE_QUADS {
            return false;
        }
        let gs = self.base.attrs.sqrt_grid_size as usize;
        self.base.u_dice <= gs && self.base.v_dice <= gs
    }

    fn split(&self) -> Vec<SurfaceBox> {
        let along_u = self.base.split_dir == SplitDir::U;
        vec![
            Box::new(self.half(true, along_u)),
            Box::new(self.half(false, along_u)),
        ]
    }

    fn dice(&self, grid: &mut MicroGrid) {
        let (u_res, v_res) = (grid.u_res(), grid.v_res());
        let n = grid.len();
        let mut points = vec![Vec3::ZERO; n];
        let mut normals = vec![Vec3::ZERO; n];
        self.dice_points(u_res, v_res, &mut points, Some(&mut normals));
        let flip = self.base.attrs.flip_normals;
        {
            let p = grid.var(EnvVar::P);
            let ng = grid.var(EnvVar::Ng);
            let nvar = grid.var(EnvVar::N);
            let mut p = p.borrow_mut();
            let mut ng = ng.borrow_mut();
            let mut nv = nvar.borrow_mut();
            for lane in 0..n {
                let pc = self.base.object_to_camera.transform_point3(points[lane]);
                let mut nc = self
                    .base
                    .normal_matrix
                    .transform_vector3(if flip { -normals[lane] } else { normals[lane] });
                if nc.length_squared() > 0.0 {
                    nc = nc.normalize();
                }
                p.set_triple(lane, pc);
                ng.set_triple(lane, nc);
                nv.set_triple(lane, nc);
            }
        }
        dice_standard(self, grid);
    }

    fn clone_surface(&self) -> SurfaceBox {
        Box::new(Quadric {
            base: self.base.clone(),
            kind: self.kind.clone(),
        })
    }

    fn natural_dice(&self, pv: &PrimVar, u_res: usize, v_res: usize, out: &mut Value) {
        // Quadrics carry four corner slots for vertex data, same as
        // varying: interpolate bilinearly.
        let mut tmp = pv.clone_shape(1);
        tmp.copy_slot(0, pv, 0);
        for iv in 0..=v_res {
            let fv = iv as f32 / v_res.max(1) as f32;
            for iu in 0..=u_res {
                let fu = iu as f32 / u_res.max(1) as f32;
                let blended = pv.bilinear([0, 1, 2, 3], fu, fv);
                match &mut tmp.data {
                    crate::primvar::PrimVarData::Float(d) => d[0] = blended.x,
                    crate::primvar::PrimVarData::Hpoint(d) => d[0] = blended,
                    crate::primvar::PrimVarData::Triple(d) => d[0] = blended.truncate(),
                    crate::primvar::PrimVarData::Str(_) => {}
                }
                tmp.write_lane(0, out, iv * (u_res + 1) + iu);
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Support geometry.

/// sin/cos tables over `[t0, t1]` by the incremental rotation recurrence:
/// one real sin/cos pair, then complex multiplication per step.
pub fn sin_cos_grid(t0: f32, t1: f32, steps: usize) -> (Vec<f32>, Vec<f32>) {
    let mut sin_t = vec![0.0f32; steps];
    let mut cos_t = vec![0.0f32; steps];
    let mut prev_cos = (t0 as f64).cos();
    let mut prev_sin = (t0 as f64).sin();
    let dt = if steps > 1 {
        (t1 - t0) as f64 / (steps - 1) as f64
    } else {
        0.0
    };
    let cos_dt = dt.cos();
    let sin_dt = dt.sin();
    sin_t[0] = prev_sin as f32;
    cos_t[0] = prev_cos as f32;
    for i in 1..steps {
        let c = cos_dt * prev_cos - sin_dt * prev_sin;
        let s = sin_dt * prev_cos + cos_dt * prev_sin;
        cos_t[i] = c as f32;
        sin_t[i] = s as f32;
        prev_cos = c;
        prev_sin = s;
    }
    (sin_t, cos_t)
}

/// Control points of a piecewise-Bezier arc approximating a circle segment
/// in the plane spanned by `x`/`y` about `origin` (four sub-arcs).
pub fn circle(origin: Vec3, x: Vec3, y: Vec3, r: f32, angle_start: f32, angle_end: f32) -> Vec<Vec3> {
    let mut ae = angle_end;
    while ae < angle_start {
        ae += std::f32::consts::TAU;
    }
    let narcs = 4usize;
    let dtheta = (ae - angle_start) / narcs as f32;
    let mut points = vec![Vec3::ZERO; 2 * narcs + 1];
    let mut p0 = origin + r * angle_start.cos() * x + r * angle_start.sin() * y;
    let mut t0 = -angle_start.sin() * x + angle_start.cos() * y;
    points[0] = p0;
    let mut angle = angle_start;
    let mut index = 0;
    for _ in 0..narcs {
        angle += dtheta;
        let p2 = origin + r * angle.cos() * x + r * angle.sin() * y;
        points[index + 2] = p2;
        let t2 = -angle.sin() * x + angle.cos() * y;
        points[index + 1] = intersect_lines(p0, t0, p2, t2).unwrap_or((p0 + p2) * 0.5);
        index += 2;
        p0 = p2;
        t0 = t2;
    }
    points
}

/// Bound of `profile` revolved by `theta` radians about the axis through
/// `s` along `t_vec`, enclosing the sweep with Bezier arc hulls.
pub fn revolve_for_bound(profile: &[Vec3], s: Vec3, t_vec: Vec3, theta: f32) -> Bound3 {
    let mut bound = Bound3::empty();
    let theta = theta.clamp(-std::f32::consts::TAU, std::f32::consts::TAU);
    let narcs = 4usize;
    let dtheta = theta / narcs as f32;
    let cosines: Vec<f32> = (0..=narcs).map(|i| (dtheta * i as f32).cos()).collect();
    let sines: Vec<f32> = (0..=narcs).map(|i| (dtheta * i as f32).sin()).collect();

    for &pj in profile {
        let o = project_to_line(s, t_vec, pj);
        let mut x = pj - o;
        let r = x.length();
        if r < 1e-7 {
            bound.encapsulate(o);
            continue;
        }
        x /= r;
        let y = t_vec.cross(x).normalize();
        bound.encapsulate(pj);
        let mut p0 = pj;
        let mut t0 = y;
        for i in 1..=narcs {
            let p2 = o + r * cosines[i] * x + r * sines[i] * y;
            bound.encapsulate(p2);
            let t2 = -sines[i] * x + cosines[i] * y;
            let p1 = intersect_lines(p0, t0, p2, t2).unwrap_or((p0 + p2) * 0.5);
            bound.encapsulate(p1);
            p0 = p2;
            t0 = t2;
        }
    }
    bound
}

/// Intersection of two lines given by point + direction; `None` when they
/// are parallel.
fn intersect_lines(p1: Vec3, t1: Vec3, p2: Vec3, t2: Vec3) -> Option<Vec3> {
    let px = t1.cross(p1 - t2);
    let v = px.cross(t1);
    let vw = v.dot(t2);
    if vw * vw < 1.0e-7 {
        return None;
    }
    let t = (p1 - p2).dot(v) / vw;
    Some(p2 + t * t2)
}

fn project_to_line(s: Vec3, dir: Vec3, p: Vec3) -> Vec3 {
    let denom = dir.length_squared();
    if denom == 0.0 {
        return s;
    }
    s + dir * ((p - s).dot(dir) / denom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::Attributes;
    use std::rc::Rc;

    fn unit_sphere() -> Quadric {
        let base = SurfaceBase::new("sphere", Rc::new(Attributes::default()));
        Quadric::sphere(base, 1.0, -1.0, 1.0, 0.0, 360.0)
    }

    #[test]
    fn sphere_bound_is_unit_cube() {
        let s = unit_sphere();
        let b = s.bound();
        assert!((b.min - Vec3::splat(-1.0)).length() < 1e-4, "{:?}", b);
        assert!((b.max - Vec3::splat(1.0)).length() < 1e-4, "{:?}", b);
    }

    #[test]
    fn sphere_seam_is_continuous() {
        let s = unit_sphere();
        let (u_res, v_res) = (8, 4);
        let n = (u_res + 1) * (v_res + 1);
        let mut pts = vec![Vec3::ZERO; n];
        s.dice_points(u_res, v_res, &mut pts, None);
        for iv in 0..=v_res {
            let first = pts[iv * (u_res + 1)];
            let last = pts[iv * (u_res + 1) + u_res];
            assert!((first - last).length() < 1e-4, "{first:?} vs {last:?}");
        }
    }

    #[test]
    fn sphere_points_on_surface() {
        let s = unit_sphere();
        let mut pts = vec![Vec3::ZERO; 25];
        let mut nrm = vec![Vec3::ZERO; 25];
        s.dice_points(4, 4, &mut pts, Some(&mut nrm));
        for (p, n) in pts.iter().zip(&nrm) {
            assert!((p.length() - 1.0).abs() < 1e-4);
            assert!((*p - *n).length() < 1e-4);
        }
    }

    #[test]
    fn split_children_inside_parent_bound() {
        let mut s = unit_sphere();
        s.base.split_dir = SplitDir::U;
        let parent = s.bound();
        for child in s.split() {
            let cb = child.bound();
            assert!(
                parent.contains(&cb),
                "child {:?} outside parent {:?}",
                cb,
                parent
            );
        }
    }

    #[test]
    fn incremental_trig_matches_direct() {
        let (sin_t, cos_t) = sin_cos_grid(0.3, 2.9, 64);
        for i in 0..64 {
            let t = 0.3 + (2.9 - 0.3) * i as f32 / 63.0;
            assert!((sin_t[i] - t.sin()).abs() < 1e-4);
            assert!((cos_t[i] - t.cos()).abs() < 1e-4);
        }
    }

    #[test]
    fn torus_bound_contains_dice() {
        let base = SurfaceBase::new("torus", Rc::new(Attributes::default()));
        let t = Quadric::new(
            base,
            QuadricKind::Torus {
                major: 2.0,
                minor: 0.5,
                phi_min: 0.0,
                phi_max: 360.0,
                theta_min: 0.0,
                theta_max: 360.0,
            },
        );
        let b = t.bound();
        let mut pts = vec![Vec3::ZERO; 17 * 17];
        t.dice_points(16, 16, &mut pts, None);
        for p in pts {
            assert!(p.x >= b.min.x - 1e-4 && p.x <= b.max.x + 1e-4);
            assert!(p.z >= b.min.z - 1e-4 && p.z <= b.max.z + 1e-4);
        }
    }
}
