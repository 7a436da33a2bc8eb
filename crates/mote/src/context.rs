//! The renderer context: options, the attribute and transform stacks,
//! named coordinate systems, shader bindings and light instances.

use glam::{Mat4, Vec3};
use mote_geom::Attributes;
use slx::{loader, LightRef, ShaderVm, Value};
use smol_str::SmolStr;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, warn};

/// Camera projection selected by the `Projection` request.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Projection {
    Orthographic,
    Perspective { fov: f32 },
}

/// Frame-global options.
#[derive(Clone, Debug)]
pub struct Options {
    pub x_res: usize,
    pub y_res: usize,
    pub near: f32,
    pub far: f32,
    pub projection: Projection,
    pub crop: (f32, f32, f32, f32),
    pub bucket_size: usize,
    /// `limits gridsize`: micropolygons per grid.
    pub grid_size: f32,
    /// `SqrtGridSize`: maximum grid side length.
    pub sqrt_grid_size: f32,
    /// ColorQuantize one/min/max; all zero selects float output.
    pub quantize_one: i32,
    pub quantize_min: i32,
    pub quantize_max: i32,
    /// Listen port for the display manager (0 = ephemeral).
    pub display_port: u16,
    pub shader_path: Vec<PathBuf>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            x_res: 640,
            y_res: 480,
            near: 0.1,
            far: 10000.0,
            projection: Projection::Orthographic,
            crop: (0.0, 1.0, 0.0, 1.0),
            bucket_size: 16,
            grid_size: 256.0,
            sqrt_grid_size: 16.0,
            quantize_one: 255,
            quantize_min: 0,
            quantize_max: 255,
            display_port: 0,
            shader_path: vec![PathBuf::from(".")],
        }
    }
}

pub type ShaderRef = Rc<RefCell<ShaderVm>>;

/// One light source instantiated by `LightSource`.
pub struct LightInstance {
    pub shader: ShaderRef,
    /// Shader-space (light-to-camera) matrix at instantiation.
    pub to_camera: Mat4,
    pub ambient: bool,
    pub on: bool,
}

/// Attribute block state, pushed by `AttributeBegin`.
#[derive(Clone)]
pub struct AttrState {
    pub geom: Attributes,
    /// Object-to-world transform.
    pub transform: Mat4,
    pub surface: Option<ShaderRef>,
    pub displacement: Option<ShaderRef>,
    pub atmosphere: Option<ShaderRef>,
    pub orientation_reversed: bool,
    pub object_name: SmolStr,
    /// Trim loops applying to subsequent NuPatch requests.
    pub trim: Vec<mote_geom::TrimLoop>,
}

impl Default for AttrState {
    fn default() -> AttrState {
        AttrState {
            geom: Attributes::default(),
            transform: Mat4::IDENTITY,
            surface: None,
            displacement: None,
            atmosphere: None,
            orientation_reversed: false,
            object_name: SmolStr::new("object"),
            trim: Vec::new(),
        }
    }
}

/// The renderer-wide context, passed explicitly through the pipeline.
pub struct RenderContext {
    pub options: Options,
    attr_stack: Vec<AttrState>,
    transform_stack: Vec<Mat4>,
    /// World-to-camera, fixed at `WorldBegin`.
    pub world_to_camera: Mat4,
    pub coord_systems: HashMap<SmolStr, Mat4>,
    pub lights: Vec<LightInstance>,
    pub displays: Vec<dspy::DisplayRequest>,
    pub abandon: bool,
    in_world: bool,
}

impl RenderContext {
    pub fn new() -> RenderContext {
        RenderContext {
            options: Options::default(),
            attr_stack: vec![AttrState::default()],
            transform_stack: Vec::new(),
            world_to_camera: Mat4::IDENTITY,
            coord_systems: HashMap::new(),
            lights: Vec::new(),
            displays: Vec::new(),
            abandon: false,
            in_world: false,
        }
    }

    pub fn attrs(&self) -> &AttrState {
        self.attr_stack.last().unwrap()
    }

    pub fn attrs_mut(&mut self) -> &mut AttrState {
        self.attr_stack.last_mut().unwrap()
    }

    pub fn push_attributes(&mut self) {
        self.attr_stack.push(self.attrs().clone());
    }

    pub fn pop_attributes(&mut self) {
        if self.attr_stack.len() > 1 {
            self.attr_stack.pop();
        } else {
            warn!("AttributeEnd without AttributeBegin");
        }
    }

    pub fn push_transform(&mut self) {
        self.transform_stack.push(self.attrs().transform);
    }

    pub fn pop_transform(&mut self) {
        match self.transform_stack.pop() {
            Some(m) => self.attrs_mut().transform = m,
            None => warn!("TransformEnd without TransformBegin"),
        }
    }

    pub fn concat_transform(&mut self, m: Mat4) {
        let cur = self.attrs().transform;
        self.attrs_mut().transform = cur * m;
    }

    pub fn set_transform(&mut self, m: Mat4) {
        self.attrs_mut().transform = m;
    }

    /// `WorldBegin`: the transform built so far becomes world-to-camera.
    pub fn world_begin(&mut self) {
        self.world_to_camera = self.attrs().transform;
        self.attrs_mut().transform = Mat4::IDENTITY;
        self.coord_systems
            .insert(SmolStr::new("world"), Mat4::IDENTITY);
        self.in_world = true;
        debug!("world begin");
    }

    pub fn in_world(&self) -> bool {
        self.in_world
    }

    pub fn world_end(&mut self) {
        self.in_world = false;
    }

    /// Object-to-camera for the current transform state.
    pub fn object_to_camera(&self) -> Mat4 {
        if self.in_world {
            self.world_to_camera * self.attrs().transform
        } else {
            self.attrs().transform
        }
    }

    /// Camera-to-screen projection.
    pub fn camera_to_screen(&self) -> Mat4 {
        let aspect = self.options.x_res as f32 / self.options.y_res.max(1) as f32;
        match self.options.projection {
            Projection::Perspective { fov } => Mat4::perspective_lh(
                fov.to_radians(),
                aspect,
                self.options.near,
                self.options.far,
            ),
            Projection::Orthographic => Mat4::orthographic_lh(
                -aspect,
                aspect,
                -1.0,
                1.0,
                self.options.near,
                self.options.far,
            ),
        }
    }

    /// Screen [-1,1] to raster pixels, y down.
    pub fn screen_to_raster(&self) -> Mat4 {
        let (w, h) = (self.options.x_res as f32, self.options.y_res as f32);
        Mat4::from_scale(Vec3::new(w * 0.5, -h * 0.5, 1.0))
            * Mat4::from_translation(Vec3::new(1.0, -1.0, 0.0))
    }

    pub fn camera_to_raster(&self) -> Mat4 {
        self.screen_to_raster() * self.camera_to_screen()
    }

    /// Registers the current transform under a coordinate system name.
    pub fn coordinate_system(&mut self, name: impl Into<SmolStr>) {
        self.coord_systems.insert(name.into(), self.object_to_camera());
    }

    /// Matrix mapping points in `space` to camera space.
    pub fn space_to_camera(&self, space: &str) -> Option<Mat4> {
        match space {
            "current" | "camera" => Some(Mat4::IDENTITY),
            "world" => Some(self.world_to_camera),
            "object" => Some(self.object_to_camera()),
            "screen" => Some(self.camera_to_screen().inverse()),
            "raster" => Some(self.camera_to_raster().inverse()),
            "NDC" => {
                let ndc_to_raster = Mat4::from_scale(Vec3::new(
                    self.options.x_res as f32,
                    self.options.y_res as f32,
                    1.0,
                ));
                Some(self.camera_to_raster().inverse() * ndc_to_raster)
            }
            named => self.coord_systems.get(named).copied(),
        }
    }

    /// Loads a `.slx` shader by name from the search path.
    pub fn load_shader(&self, name: &str) -> Option<ShaderVm> {
        for dir in &self.options.shader_path {
            let path = dir.join(format!("{name}.slx"));
            if path.exists() {
                match loader::load_file(&path) {
                    Ok(program) => return Some(ShaderVm::new(program)),
                    Err(e) => {
                        warn!(shader = name, "failed to load: {e}");
                        return None;
                    }
                }
            }
        }
        warn!(shader = name, "shader not found on search path");
        None
    }

    /// Binds a shader: loads, applies RIB arguments, runs `init` for the
    /// remaining defaults.
    pub fn bind_shader(&self, name: &str, args: &[(SmolStr, Value)]) -> Option<ShaderRef> {
        let mut vm = self.load_shader(name)?;
        if let Err(e) = vm.run_init(&slx::NullServices) {
            warn!(shader = name, "init failed: {e}");
            return None;
        }
        for (pname, value) in args {
            if !vm.set_parameter(pname, value) {
                debug!(shader = name, param = %pname, "unknown parameter");
            }
        }
        Some(Rc::new(RefCell::new(vm)))
    }

    /// Lights currently switched on, wrapped for the shading environment.
    pub fn active_lights(&self) -> Vec<LightRef> {
        self.lights
            .iter()
            .filter(|l| l.on)
            .map(|l| {
                Rc::new(RefCell::new(crate::shading::VmLight::new(
                    l.shader.clone(),
                    l.ambient,
                    l.to_camera,
                ))) as LightRef
            })
            .collect()
    }
}

impl Default for RenderContext {
    fn default() -> Self {
        RenderContext::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_stack_restores() {
        let mut ctx = RenderContext::new();
        ctx.attrs_mut().geom.shading_rate = 4.0;
        ctx.push_attributes();
        ctx.attrs_mut().geom.shading_rate = 0.25;
        ctx.pop_attributes();
        assert_eq!(ctx.attrs().geom.shading_rate, 4.0);
    }

    #[test]
    fn world_begin_freezes_camera() {
        let mut ctx = RenderContext::new();
        ctx.concat_transform(Mat4::from_translation(Vec3::new(0.0, 0.0, 5.0)));
        ctx.world_begin();
        assert_eq!(
            ctx.world_to_camera,
            Mat4::from_translation(Vec3::new(0.0, 0.0, 5.0))
        );
        // Inside the world block, object transforms start from identity.
        assert_eq!(ctx.attrs().transform, Mat4::IDENTITY);
        ctx.concat_transform(Mat4::from_translation(Vec3::X));
        let o2c = ctx.object_to_camera();
        let p = o2c.transform_point3(Vec3::ZERO);
        assert_eq!(p, Vec3::new(1.0, 0.0, 5.0));
    }

    #[test]
    fn raster_projection_centers_origin() {
        let mut ctx = RenderContext::new();
        ctx.options.x_res = 100;
        ctx.options.y_res = 100;
        ctx.options.projection = Projection::Perspective { fov: 90.0 };
        let m = ctx.camera_to_raster();
        // A point straight ahead lands on the image center.
        let p = m.project_point3(Vec3::new(0.0, 0.0, 5.0));
        assert!((p.x - 50.0).abs() < 1e-3, "{p:?}");
        assert!((p.y - 50.0).abs() < 1e-3, "{p:?}");
    }
}
