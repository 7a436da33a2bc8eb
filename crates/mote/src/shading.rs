//! Binds grids to the shading VM: populates system variables, runs the
//! displacement/surface/atmosphere stack and the attached lights, and
//! implements the renderer services the interpreter queries.

use crate::context::{RenderContext, ShaderRef};
use glam::{Mat4, Vec3};
use mote_geom::MicroGrid;
use slx::{
    EnvVar, LightShader, RendererServices, ShaderExecEnv, ShaderVm, Value, ValueType,
};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::warn;

/// The shaders attached to one surface at dice time.
#[derive(Clone, Default)]
pub struct ShaderBinding {
    pub displacement: Option<ShaderRef>,
    pub surface: Option<ShaderRef>,
    pub atmosphere: Option<ShaderRef>,
    pub lights: Vec<slx::LightRef>,
}

/// A light shader wrapped for the surface environment: runs the light
/// program over the surface points and flips `L` to surface-to-light.
pub struct VmLight {
    vm: ShaderRef,
    ambient: bool,
    to_camera: Mat4,
}

impl VmLight {
    pub fn new(vm: ShaderRef, ambient: bool, to_camera: Mat4) -> VmLight {
        VmLight {
            vm,
            ambient,
            to_camera,
        }
    }
}

impl LightShader for VmLight {
    fn is_ambient(&self) -> bool {
        self.ambient
    }

    fn evaluate(&mut self, surface: &mut ShaderExecEnv, services: &dyn RendererServices) {
        let n = surface.grid_size();
        {
            // The light runs in the surface environment; Ps carries the
            // surface points, L/Cl/Ol are its outputs.
            let p = surface.var(EnvVar::P);
            let ps = surface.var(EnvVar::Ps);
            let cl = surface.var(EnvVar::Cl);
            let ol = surface.var(EnvVar::Ol);
            let l = surface.var(EnvVar::L);
            let p = p.borrow();
            let mut ps = ps.borrow_mut();
            let mut cl = cl.borrow_mut();
            let mut ol = ol.borrow_mut();
            let mut l = l.borrow_mut();
            for i in 0..n {
                ps.set_triple(i, p.get_triple(i));
                cl.set_triple(i, Vec3::ZERO);
                ol.set_triple(i, Vec3::ONE);
                l.set_triple(i, Vec3::ZERO);
            }
        }
        let saved_shader_matrix = surface.shader_matrix;
        surface.shader_matrix = self.to_camera;
        if let Err(e) = self.vm.borrow_mut().execute(surface, services) {
            warn!("light shader failed: {e}");
        }
        surface.shader_matrix = saved_shader_matrix;
        // `illuminate` leaves L pointing light-to-surface; the surface side
        // of the protocol sees surface-to-light.
        let l = surface.var(EnvVar::L);
        let mut l = l.borrow_mut();
        for i in 0..n {
            let v = l.get_triple(i);
            l.set_triple(i, -v);
        }
    }

    fn parameter(&self, name: &str, out: &mut Value) -> bool {
        match self.vm.borrow().parameter(name) {
            Some(p) => {
                let p = p.borrow();
                for lane in 0..out.size() {
                    out.set_from(&p, lane);
                }
                true
            }
            None => false,
        }
    }
}

/// Renderer services handed to the interpreter while shading one surface.
pub struct ContextServices<'a> {
    pub context: &'a RenderContext,
    pub object_to_camera: Mat4,
    pub shader_to_camera: Mat4,
}

impl RendererServices for ContextServices<'_> {
    fn space_to_space(&self, from: &str, to: &str) -> Option<Mat4> {
        let from_to_camera = self.resolve(from)?;
        let to_to_camera = self.resolve(to)?;
        Some(to_to_camera.inverse() * from_to_camera)
    }

    fn option(&self, name: &str, out: &mut Value) -> bool {
        let opts = &self.context.options;
        match name {
            "Format" => {
                out.set_triple(0, Vec3::new(opts.x_res as f32, opts.y_res as f32, 1.0));
                true
            }
            "Clipping" | "near" => {
                out.set_float(0, opts.near);
                true
            }
            "far" => {
                out.set_float(0, opts.far);
                true
            }
            _ => false,
        }
    }

    fn renderer_info(&self, name: &str, out: &mut Value) -> bool {
        match name {
            "renderer" => {
                out.set_str(0, "mote".into());
                true
            }
            "version" => {
                out.set_float(0, 1.0);
                true
            }
            _ => false,
        }
    }

    fn clipping(&self) -> (f32, f32) {
        (self.context.options.near, self.context.options.far)
    }
}

impl ContextServices<'_> {
    fn resolve(&self, space: &str) -> Option<Mat4> {
        match space {
            "object" => Some(self.object_to_camera),
            "shader" => Some(self.shader_to_camera),
            other => self.context.space_to_camera(other),
        }
    }
}

/// Runs the displacement, surface and atmosphere shaders over one grid.
/// Shader runtime faults stay inside the grid; a structural error aborts
/// the surface.
pub fn shade_grid(
    grid: &mut MicroGrid,
    binding: &ShaderBinding,
    services: &ContextServices,
) -> slx::Result<()> {
    let n = grid.len();
    {
        let env = grid.env_mut();
        env.reset_state();
        env.shader_matrix = services.shader_to_camera;
        for light in &binding.lights {
            env.add_light(light.clone());
        }
        // The eye sits at the camera origin: I = P - E with E = 0.
        let p = env.var(EnvVar::P);
        let i = env.var(EnvVar::I);
        let p = p.borrow();
        let mut iv = i.borrow_mut();
        for lane in 0..n {
            iv.set_triple(lane, p.get_triple(lane));
        }
    }

    let run = |vm: &ShaderRef, grid: &mut MicroGrid| -> slx::Result<()> {
        grid.env_mut().reset_state();
        vm.borrow_mut().execute(grid.env_mut(), services)
    };

    if let Some(displacement) = &binding.displacement {
        run(displacement, grid)?;
        // Displacement moved P; the geometric normal follows.
        mote_geom::surface::normals_from_positions(grid, false);
    }
    match &binding.surface {
        Some(surface) => run(surface, grid)?,
        None => default_surface(grid),
    }
    if let Some(atmosphere) = &binding.atmosphere {
        run(atmosphere, grid)?;
    }
    Ok(())
}

/// The built-in fallback surface: a headlight facing ratio on Cs.
fn default_surface(grid: &mut MicroGrid) {
    let n = grid.len();
    let env = grid.env();
    let p = env.var(EnvVar::P);
    let nrm = env.var(EnvVar::N);
    let cs = env.var(EnvVar::Cs);
    let os = env.var(EnvVar::Os);
    let ci = env.var(EnvVar::Ci);
    let oi = env.var(EnvVar::Oi);
    let p = p.borrow();
    let nrm = nrm.borrow();
    let cs = cs.borrow();
    let os = os.borrow();
    let mut ci = ci.borrow_mut();
    let mut oi = oi.borrow_mut();
    for lane in 0..n {
        let view = -p.get_triple(lane).normalize_or_zero();
        let normal = nrm.get_triple(lane).normalize_or_zero();
        let facing = normal.dot(view).abs();
        ci.set_triple(lane, cs.get_triple(lane) * facing);
        oi.set_triple(lane, os.get_triple(lane));
    }
}

/// Builds a closure-backed test light (unit tests and examples).
pub fn constant_light(color: Vec3, direction: Vec3) -> slx::LightRef {
    struct Constant {
        color: Vec3,
        direction: Vec3,
    }
    impl LightShader for Constant {
        fn is_ambient(&self) -> bool {
            false
        }
        fn evaluate(&mut self, surface: &mut ShaderExecEnv, _services: &dyn RendererServices) {
            let n = surface.grid_size();
            let l = surface.var(EnvVar::L);
            let cl = surface.var(EnvVar::Cl);
            let mut l = l.borrow_mut();
            let mut cl = cl.borrow_mut();
            for i in 0..n {
                l.set_triple(i, -self.direction);
                cl.set_triple(i, self.color);
            }
        }
    }
    Rc::new(RefCell::new(Constant { color, direction }))
}

/// A grid is shaded exactly once; afterwards Ci/Oi are final.
pub fn grid_outputs(grid: &MicroGrid) -> (Vec<Vec3>, Vec<Vec3>) {
    let env = grid.env();
    let ci = env.var(EnvVar::Ci);
    let oi = env.var(EnvVar::Oi);
    let ci = ci.borrow();
    let oi = oi.borrow();
    let n = grid.len();
    let colors = (0..n).map(|i| ci.get_triple(i)).collect();
    let opacities = (0..n).map(|i| oi.get_triple(i)).collect();
    (colors, opacities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mote_geom::{Attributes, Quadric, Surface, SurfaceBase};
    use std::rc::Rc;

    fn diced_sphere() -> MicroGrid {
        let base = SurfaceBase::new("sphere", Rc::new(Attributes::default()));
        let mut q = Quadric::sphere(base, 1.0, -1.0, 1.0, 0.0, 360.0);
        q.base.u_dice = 4;
        q.base.v_dice = 4;
        let mut grid = MicroGrid::new(4, 4);
        q.dice(&mut grid);
        grid
    }

    #[test]
    fn default_surface_fills_ci() {
        let mut grid = diced_sphere();
        let ctx = RenderContext::new();
        let services = ContextServices {
            context: &ctx,
            object_to_camera: Mat4::IDENTITY,
            shader_to_camera: Mat4::IDENTITY,
        };
        shade_grid(&mut grid, &ShaderBinding::default(), &services).unwrap();
        let (colors, opacities) = grid_outputs(&grid);
        // Facing ratio of a sphere around the origin seen from the origin
        // is 1 everywhere.
        for c in &colors {
            assert!((c.x - 1.0).abs() < 1e-3, "{c:?}");
        }
        assert!(opacities.iter().all(|o| (o.x - 1.0).abs() < 1e-6));
    }

    #[test]
    fn uses_mask_tracks_program_variables() {
        let src = "surface s\nmain:\nLabel_0:\n\tpushv N\n\tpop Ci\n";
        let vm = ShaderVm::new(slx::load_program(src).unwrap());
        assert!(vm.uses().contains(slx::Uses::N));
        assert!(vm.uses().contains(slx::Uses::CI));
        assert!(!vm.uses().contains(slx::Uses::S));
    }
}
