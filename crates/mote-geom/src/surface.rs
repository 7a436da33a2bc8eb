//! The common surface contract: bound, transform, diceable, split, dice.

use crate::basis::CubicBasis;
use crate::bounds::Bound3;
use crate::grid::MicroGrid;
use crate::primvar::{self, PrimVar, PrimVarData};
use glam::{Mat4, Vec3};
use slx::{EnvVar, StorageClass, Value, ValueType};
use smol_str::SmolStr;
use std::rc::Rc;

/// Preferred split axis, decided by the diceability probe.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SplitDir {
    U,
    V,
}

/// Attribute state a surface was created under.
#[derive(Clone, Debug)]
pub struct Attributes {
    pub shading_rate: f32,
    /// Combined orientation × transform handedness, fixed at shutter open.
    pub flip_normals: bool,
    /// Round dice sizes up to powers of two to avoid cracking.
    pub dice_binary: bool,
    /// Micropolygons per grid (the `limits gridsize` option).
    pub grid_size: f32,
    /// Maximum grid side length (the `SqrtGridSize` option).
    pub sqrt_grid_size: f32,
    pub u_basis: CubicBasis,
    pub v_basis: CubicBasis,
    pub u_step: usize,
    pub v_step: usize,
    pub color: Vec3,
    pub opacity: Vec3,
}

impl Default for Attributes {
    fn default() -> Attributes {
        Attributes {
            shading_rate: 1.0,
            flip_normals: false,
            dice_binary: false,
            grid_size: 256.0,
            sqrt_grid_size: 16.0,
            u_basis: CubicBasis::Bezier,
            v_basis: CubicBasis::Bezier,
            u_step: 3,
            v_step: 3,
            color: Vec3::ONE,
            opacity: Vec3::ONE,
        }
    }
}

/// State shared by every surface type.
#[derive(Clone)]
pub struct SurfaceBase {
    pub name: SmolStr,
    /// Object-to-camera pose; identity for surfaces that store control
    /// points directly in camera space.
    pub object_to_camera: Mat4,
    /// Inverse transpose of the pose, for normals.
    pub normal_matrix: Mat4,
    /// Bound expansion accounting for transformation motion.
    pub motion_expand: f32,
    pub primvars: Vec<PrimVar>,
    pub split_count: u32,
    pub eye_split_count: u32,
    pub split_dir: SplitDir,
    /// Cleared when an eye-plane crossing forces splitting without dicing.
    pub diceable_flag: bool,
    pub discard: bool,
    pub u_dice: usize,
    pub v_dice: usize,
    pub attrs: Rc<Attributes>,
}

impl SurfaceBase {
    pub fn new(name: impl Into<SmolStr>, attrs: Rc<Attributes>) -> SurfaceBase {
        SurfaceBase {
            name: name.into(),
            object_to_camera: Mat4::IDENTITY,
            normal_matrix: Mat4::IDENTITY,
            motion_expand: 0.0,
            primvars: Vec::new(),
            split_count: 0,
            eye_split_count: 0,
            split_dir: SplitDir::U,
            diceable_flag: true,
            discard: false,
            u_dice: 0,
            v_dice: 0,
            attrs,
        }
    }

    pub fn find(&self, name: &str) -> Option<&PrimVar> {
        primvar::find(&self.primvars, name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut PrimVar> {
        primvar::find_mut(&mut self.primvars, name)
    }

    /// The position variable. Every renderable surface has one.
    pub fn p(&self) -> Option<&PrimVar> {
        self.find("P")
    }

    /// Installs the parametric defaults: varying `u`, `v` (and `s`, `t`
    /// mirroring them) over the four corners.
    pub fn set_default_primvars(&mut self) {
        for (name, vals) in [
            ("u", [0.0, 1.0, 0.0, 1.0]),
            ("v", [0.0, 0.0, 1.0, 1.0]),
            ("s", [0.0, 1.0, 0.0, 1.0]),
            ("t", [0.0, 0.0, 1.0, 1.0]),
        ] {
            if self.find(name).is_none() {
                self.primvars.push(PrimVar::floats(
                    name,
                    StorageClass::Varying,
                    vals.to_vec(),
                ));
            }
        }
    }

    /// Copies split bookkeeping and shared state into a child.
    pub fn inherit(&self, child: &mut SurfaceBase) {
        child.object_to_camera = self.object_to_camera;
        child.normal_matrix = self.normal_matrix;
        child.motion_expand = self.motion_expand;
        child.split_count = self.split_count + 1;
        child.eye_split_count = self.eye_split_count;
        child.diceable_flag = true;
        child.attrs = self.attrs.clone();
        child.name = self.name.clone();
    }

    /// Shading rate scaled for the current frame; the hook for depth-of-
    /// field or motion based rate adjustment.
    pub fn adjusted_shading_rate(&self) -> f32 {
        self.attrs.shading_rate.max(1e-3)
    }
}

pub type SurfaceBox = Box<dyn Surface>;

/// The interface the REYES dispatcher drives.
pub trait Surface {
    fn base(&self) -> &SurfaceBase;
    fn base_mut(&mut self) -> &mut SurfaceBase;

    /// Camera-space bound, expanded for transformation motion.
    fn bound(&self) -> Bound3;

    /// Composes a transform onto the surface.
    fn transform(&mut self, m: &Mat4, m_inv_t: &Mat4, m_rot: &Mat4);

    /// Probes the raster-space footprint: fixes the dice sizes and returns
    /// true when the surface can be diced directly, otherwise records the
    /// preferred split direction.
    fn diceable(&mut self, cam_to_raster: &Mat4) -> bool;

    /// Splits into 2–3 children.
    fn split(&self) -> Vec<SurfaceBox>;

    /// Dices into a grid of shading points.
    fn dice(&self, grid: &mut MicroGrid);

    fn clone_surface(&self) -> SurfaceBox;

    /// Dices one vertex-class primitive variable over the grid; the natural
    /// interpolation of the surface's parameterization.
    fn natural_dice(&self, pv: &PrimVar, u_res: usize, v_res: usize, out: &mut Value);

    fn post_dice(&self, _grid: &mut MicroGrid) {}
}

/// Rounds up to the next power of two.
pub fn ceil_pow2(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

/// Fills `Ng` (and `N`) from forward differences of the diced positions;
/// used by surfaces without an analytic normal. Flips for left-handed
/// orientation.
pub fn normals_from_positions(grid: &mut MicroGrid, flip: bool) {
    let (u_res, v_res) = (grid.u_res(), grid.v_res());
    let p = grid.var(EnvVar::P);
    let ng = grid.var(EnvVar::Ng);
    let nv = grid.var(EnvVar::N);
    let p = p.borrow();
    let mut ng = ng.borrow_mut();
    let mut nv = nv.borrow_mut();
    for iv in 0..=v_res {
        for iu in 0..=u_res {
            let iu0 = iu.min(u_res.saturating_sub(1));
            let iv0 = iv.min(v_res.saturating_sub(1));
            let lane = |a: usize, b: usize| b * (u_res + 1) + a;
            let du = if u_res > 0 {
                p.get_triple(lane(iu0 + 1, iv)) - p.get_triple(lane(iu0, iv))
            } else {
                Vec3::ZERO
            };
            let dv = if v_res > 0 {
                p.get_triple(lane(iu, iv0 + 1)) - p.get_triple(lane(iu, iv0))
            } else {
                Vec3::ZERO
            };
            let mut n = du.cross(dv);
            if flip {
                n = -n;
            }
            if n.length_squared() > 0.0 {
                n = n.normalize();
            }
            let l = lane(iu, iv);
            ng.set_triple(l, n);
            nv.set_triple(l, n);
        }
    }
}

/// Splits the four corner slots of a varying variable along one axis.
pub fn subdivide_varying(pv: &PrimVar, along_u: bool) -> (PrimVar, PrimVar) {
    let mut a = pv.clone_shape(4);
    let mut b = pv.clone_shape(4);
    if along_u {
        // Corners: 0-1 top edge, 2-3 bottom edge.
        a.copy_slot(0, pv, 0);
        a.lerp_slot(1, pv, 0, 1, 0.5);
        a.copy_slot(2, pv, 2);
        a.lerp_slot(3, pv, 2, 3, 0.5);
        b.lerp_slot(0, pv, 0, 1, 0.5);
        b.copy_slot(1, pv, 1);
        b.lerp_slot(2, pv, 2, 3, 0.5);
        b.copy_slot(3, pv, 3);
    } else {
        a.copy_slot(0, pv, 0);
        a.copy_slot(1, pv, 1);
        a.lerp_slot(2, pv, 0, 2, 0.5);
        a.lerp_slot(3, pv, 1, 3, 0.5);
        b.lerp_slot(0, pv, 0, 2, 0.5);
        b.lerp_slot(1, pv, 1, 3, 0.5);
        b.copy_slot(2, pv, 2);
        b.copy_slot(3, pv, 3);
    }
    (a, b)
}

/// Fills a grid from a surface's primitive variables: vertex class through
/// the surface's natural interpolation, varying bilinearly from the four
/// corners, uniform and constant by replication.
pub fn dice_standard(surface: &dyn Surface, grid: &mut MicroGrid) {
    let base = surface.base();
    let (u_res, v_res) = (grid.u_res(), grid.v_res());
    let n = grid.len();

    for pv in &base.primvars {
        let target = EnvVar::from_name(&pv.name);
        let mut value = Value::new(pv.shading_type(), StorageClass::Varying, n)
            .with_name(pv.name.clone());
        match pv.class {
            StorageClass::Vertex => {
                surface.natural_dice(pv, u_res, v_res, &mut value);
            }
            StorageClass::Varying | StorageClass::FaceVarying => {
                let mut tmp = pv.clone_shape(1);
                tmp.copy_slot(0, pv, 0);
                for iv in 0..=v_res {
                    let fv = iv as f32 / v_res.max(1) as f32;
                    for iu in 0..=u_res {
                        let fu = iu as f32 / u_res.max(1) as f32;
                        let blended = pv.bilinear([0, 1, 2, 3], fu, fv);
                        match &mut tmp.data {
                            PrimVarData::Float(d) => d[0] = blended.x,
                            PrimVarData::Hpoint(d) => d[0] = blended,
                            PrimVarData::Triple(d) => d[0] = blended.truncate(),
                            PrimVarData::Str(_) => {}
                        }
                        tmp.write_lane(0, &mut value, iv * (u_res + 1) + iu);
                    }
                }
            }
            StorageClass::Uniform | StorageClass::Constant => {
                for lane in 0..n {
                    pv.write_lane(0, &mut value, lane);
                }
            }
        }
        match target {
            Some(var) => {
                let dst = grid.var(var);
                let mut dst = dst.borrow_mut();
                for lane in 0..n {
                    dst.set_from(&value, lane);
                }
            }
            None => grid.add_extra(value),
        }
    }

    // Surface color and opacity fall back to the attribute state when no
    // Cs/Os primitive variable overrode them.
    if base.find("Cs").is_none() {
        let cs = grid.var(EnvVar::Cs);
        let mut cs = cs.borrow_mut();
        for lane in 0..n {
            cs.set_triple(lane, base.attrs.color);
        }
    }
    if base.find("Os").is_none() {
        let os = grid.var(EnvVar::Os);
        let mut os = os.borrow_mut();
        for lane in 0..n {
            os.set_triple(lane, base.attrs.opacity);
        }
    }

    // Parametric spacing for the derivative opcodes.
    {
        let du = grid.var(EnvVar::du);
        let mut du = du.borrow_mut();
        let dv = grid.var(EnvVar::dv);
        let mut dv = dv.borrow_mut();
        for lane in 0..n {
            du.set_float(lane, 1.0 / u_res.max(1) as f32);
            dv.set_float(lane, 1.0 / v_res.max(1) as f32);
        }
    }

    surface.post_dice(grid);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varying_subdivision_halves_u() {
        let pv = PrimVar::floats("u", StorageClass::Varying, vec![0.0, 1.0, 0.0, 1.0]);
        let (a, b) = subdivide_varying(&pv, true);
        assert_eq!(
            (0..4).map(|i| a.float(i)).collect::<Vec<_>>(),
            vec![0.0, 0.5, 0.0, 0.5]
        );
        assert_eq!(
            (0..4).map(|i| b.float(i)).collect::<Vec<_>>(),
            vec![0.5, 1.0, 0.5, 1.0]
        );
    }

    #[test]
    fn ceil_pow2_rounds_up() {
        assert_eq!(ceil_pow2(1), 1);
        assert_eq!(ceil_pow2(3), 4);
        assert_eq!(ceil_pow2(16), 16);
        assert_eq!(ceil_pow2(17), 32);
    }
}
