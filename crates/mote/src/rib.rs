//! Materializes parsed RIB requests into renderer state and surfaces.

use crate::context::{LightInstance, Projection, RenderContext};
use crate::reyes::WorkItem;
use crate::shading::ShaderBinding;
use glam::{Mat4, Vec3, Vec4};
use mote_geom::{
    Attributes, BicubicPatch, BilinearPatch, CurvesGroup, NurbsPatch, PatchMesh, PrimVar,
    PrimVarData, Quadric, QuadricKind, Surface, SurfaceBase, SurfaceBox, TrimCurve, TrimLoop,
};
use ribio::{ParamValue, Request, RequestHandler, Value as RibValue};
use slx::{StorageClass, Value, ValueType};
use smol_str::SmolStr;
use std::rc::Rc;
use tracing::{debug, warn};

/// Builds the frame from a RIB stream. Surfaces accumulate with their
/// bindings; `frame_complete` flips at `WorldEnd`.
pub struct SceneBuilder {
    pub context: RenderContext,
    pub items: Vec<WorkItem>,
    pub frame_complete: bool,
}

impl SceneBuilder {
    pub fn new() -> SceneBuilder {
        SceneBuilder {
            context: RenderContext::new(),
            items: Vec::new(),
            frame_complete: false,
        }
    }

    /// Attribute snapshot for a new surface, with the orientation flip
    /// resolved against the current transform handedness (fixed here, at
    /// creation: shutter-open).
    fn snapshot_attrs(&self) -> Rc<Attributes> {
        let mut geom = self.context.attrs().geom.clone();
        let left_handed = self.context.object_to_camera().determinant() < 0.0;
        geom.flip_normals = self.context.attrs().orientation_reversed ^ left_handed;
        geom.grid_size = self.context.options.grid_size;
        geom.sqrt_grid_size = self.context.options.sqrt_grid_size;
        Rc::new(geom)
    }

    fn new_base(&self, kind: &str) -> SurfaceBase {
        let mut base = SurfaceBase::new(
            format!("{}:{kind}", self.context.attrs().object_name),
            self.snapshot_attrs(),
        );
        base.object_to_camera = Mat4::IDENTITY;
        base
    }

    /// Queues a finished surface with the current shader binding.
    fn push_surface(&mut self, surface: SurfaceBox) {
        let attrs = self.context.attrs();
        let binding = ShaderBinding {
            displacement: attrs.displacement.clone(),
            surface: attrs.surface.clone(),
            atmosphere: attrs.atmosphere.clone(),
            lights: self.context.active_lights(),
        };
        self.items.push(WorkItem {
            surface,
            binding,
            object_to_camera: self.context.object_to_camera(),
        });
    }

    /// Quadrics keep the object-to-camera transform as their pose.
    fn push_quadric(&mut self, mut q: Quadric, params: &[ParamValue]) {
        let o2c = self.context.object_to_camera();
        attach_primvars(&mut q.base, params, 4, 4);
        q.transform(&o2c, &o2c.inverse().transpose(), &Mat4::IDENTITY);
        self.push_surface(Box::new(q));
    }

    /// Control points arrive in object space and are transformed to camera
    /// space immediately.
    fn camera_points(&self, floats: &[f32], stride: usize) -> Vec<Vec3> {
        let o2c = self.context.object_to_camera();
        floats
            .chunks_exact(stride)
            .map(|c| o2c.transform_point3(Vec3::new(c[0], c[1], c[2])))
            .collect()
    }

    fn handle_request(&mut self, req: &Request) -> anyhow::Result<()> {
        let ctx = &mut self.context;
        match req.name.as_str() {
            "Format" => {
                ctx.options.x_res = req.int_arg(0).unwrap_or(640).max(1) as usize;
                ctx.options.y_res = req.int_arg(1).unwrap_or(480).max(1) as usize;
            }
            "Clipping" => {
                ctx.options.near = req.float_arg(0).unwrap_or(0.1);
                ctx.options.far = req.float_arg(1).unwrap_or(10000.0);
            }
            "Projection" => {
                match req.str_arg(0) {
                    Some("perspective") => {
                        let fov = req
                            .param("fov")
                            .and_then(|p| p.value.as_floats().first().copied())
                            .unwrap_or(90.0);
                        ctx.options.projection = Projection::Perspective { fov };
                    }
                    Some("orthographic") | None => {
                        ctx.options.projection = Projection::Orthographic;
                    }
                    Some(other) => warn!("unknown projection `{other}`"),
                }
            }
            "CropWindow" => {
                let f = req.floats();
                if f.len() == 4 {
                    ctx.options.crop = (f[0], f[1], f[2], f[3]);
                }
            }
            "Display" => {
                let name = req.str_arg(0).unwrap_or("out.tif").to_string();
                let display_type = req.str_arg(1).unwrap_or("file").to_string();
                let mode = req.str_arg(2).unwrap_or("rgba").to_string();
                let additive = name.starts_with('+');
                if !additive {
                    ctx.displays.clear();
                }
                ctx.displays.push(dspy::DisplayRequest {
                    name: name.trim_start_matches('+').to_string(),
                    display_type,
                    mode,
                    required: !additive,
                });
            }
            "Option" => {
                let section = req.str_arg(0).unwrap_or("");
                for p in &req.params {
                    let v = p.value.as_floats();
                    match (section, trailing_name(&p.name)) {
                        ("limits", "gridsize") => {
                            ctx.options.grid_size = v.first().copied().unwrap_or(256.0)
                        }
                        ("limits", "bucketsize") => {
                            ctx.options.bucket_size =
                                v.first().copied().unwrap_or(16.0).max(1.0) as usize
                        }
                        ("System", "SqrtGridSize") => {
                            ctx.options.sqrt_grid_size = v.first().copied().unwrap_or(16.0)
                        }
                        ("System", "ColorQuantizeOne") => {
                            ctx.options.quantize_one = v.first().copied().unwrap_or(255.0) as i32
                        }
                        ("System", "ColorQuantizeMin") => {
                            ctx.options.quantize_min = v.first().copied().unwrap_or(0.0) as i32
                        }
                        ("System", "ColorQuantizeMax") => {
                            ctx.options.quantize_max = v.first().copied().unwrap_or(255.0) as i32
                        }
                        ("searchpath", "shader") => {
                            if let RibValue::Str(path) = &p.value {
                                ctx.options.shader_path =
                                    path.split(':').map(Into::into).collect();
                            }
                        }
                        _ => debug!(section, param = %p.name, "unhandled option"),
                    }
                }
            }
            "Attribute" => {
                let section = req.str_arg(0).unwrap_or("");
                for p in &req.params {
                    match (section, trailing_name(&p.name)) {
                        ("dice", "binary") => {
                            ctx.attrs_mut().geom.dice_binary =
                                p.value.as_floats().first().copied().unwrap_or(0.0) != 0.0
                        }
                        ("identifier", "name") => {
                            if let RibValue::Str(s) = &p.value {
                                ctx.attrs_mut().object_name = s.clone();
                            }
                        }
                        _ => debug!(section, param = %p.name, "unhandled attribute"),
                    }
                }
            }
            "ShadingRate" => {
                ctx.attrs_mut().geom.shading_rate = req.float_arg(0).unwrap_or(1.0).max(1e-3)
            }
            "Orientation" => {
                ctx.attrs_mut().orientation_reversed =
                    matches!(req.str_arg(0), Some("inside") | Some("lh"))
            }
            "ReverseOrientation" => {
                let cur = ctx.attrs().orientation_reversed;
                ctx.attrs_mut().orientation_reversed = !cur;
            }
            "Sides" => {}
            "Basis" => {
                // Basis name-or-matrix pairs with their steps.
                let mut positional = req.positional.iter();
                let u = parse_basis(&mut positional);
                let v = parse_basis(&mut positional);
                if let Some((basis, step)) = u {
                    ctx.attrs_mut().geom.u_basis = basis;
                    ctx.attrs_mut().geom.u_step = step;
                }
                if let Some((basis, step)) = v {
                    ctx.attrs_mut().geom.v_basis = basis;
                    ctx.attrs_mut().geom.v_step = step;
                }
            }
            "Color" => {
                let f = req.floats();
                if f.len() >= 3 {
                    ctx.attrs_mut().geom.color = Vec3::new(f[0], f[1], f[2]);
                }
            }
            "Opacity" => {
                let f = req.floats();
                if f.len() >= 3 {
                    ctx.attrs_mut().geom.opacity = Vec3::new(f[0], f[1], f[2]);
                }
            }
            "AttributeBegin" => ctx.push_attributes(),
            "AttributeEnd" => ctx.pop_attributes(),
            "TransformBegin" => ctx.push_transform(),
            "TransformEnd" => ctx.pop_transform(),
            "FrameBegin" | "FrameEnd" => {}
            "WorldBegin" => ctx.world_begin(),
            "WorldEnd" => {
                ctx.world_end();
                self.frame_complete = true;
            }
            "Identity" => ctx.set_transform(Mat4::IDENTITY),
            "Transform" => {
                if let Some(m) = matrix_arg(req) {
                    ctx.set_transform(m);
                }
            }
            "ConcatTransform" => {
                if let Some(m) = matrix_arg(req) {
                    ctx.concat_transform(m);
                }
            }
            "Translate" => {
                let f = req.floats();
                if f.len() >= 3 {
                    ctx.concat_transform(Mat4::from_translation(Vec3::new(f[0], f[1], f[2])));
                }
            }
            "Rotate" => {
                let f = req.floats();
                if f.len() >= 4 {
                    let axis = Vec3::new(f[1], f[2], f[3]);
                    if axis.length_squared() > 0.0 {
                        ctx.concat_transform(Mat4::from_axis_angle(
                            axis.normalize(),
                            f[0].to_radians(),
                        ));
                    }
                }
            }
            "Scale" => {
                let f = req.floats();
                if f.len() >= 3 {
                    ctx.concat_transform(Mat4::from_scale(Vec3::new(f[0], f[1], f[2])));
                }
            }
            "CoordinateSystem" => {
                if let Some(name) = req.str_arg(0) {
                    ctx.coordinate_system(name);
                }
            }
            "Surface" | "Displacement" | "Atmosphere" => {
                let Some(name) = req.str_arg(0) else {
                    return Ok(());
                };
                let args = shader_args(&req.params);
                let bound = ctx.bind_shader(name, &args);
                match req.name.as_str() {
                    "Surface" => ctx.attrs_mut().surface = bound,
                    "Displacement" => ctx.attrs_mut().displacement = bound,
                    _ => ctx.attrs_mut().atmosphere = bound,
                }
            }
            "LightSource" => {
                let Some(name) = req.str_arg(0) else {
                    return Ok(());
                };
                let args = shader_args(&req.params);
                if let Some(shader) = ctx.bind_shader(name, &args) {
                    let ambient = {
                        let vm = shader.borrow();
                        vm.shader_type() == slx::ShaderType::Light && light_is_ambient(&vm)
                    };
                    let to_camera = ctx.object_to_camera();
                    ctx.lights.push(LightInstance {
                        shader,
                        to_camera,
                        ambient,
                        on: true,
                    });
                }
            }
            "Illuminate" => {
                let index = req.int_arg(0).unwrap_or(0);
                let on = req.int_arg(1).unwrap_or(1) != 0;
                // Light handles are 1-based sequence numbers.
                let slot = (index - 1).max(0) as usize;
                match ctx.lights.get_mut(slot) {
                    Some(light) => light.on = on,
                    None => warn!(index, "Illuminate names an unknown light"),
                }
            }

            ////////////////////////////////////////////////////////////////////////////////////////
            // Primitives.
            "Sphere" => {
                let f = req.floats();
                if f.len() >= 4 {
                    let base = self.new_base("sphere");
                    let q = Quadric::sphere(base, f[0], f[1], f[2], 0.0, f[3]);
                    self.push_quadric(q, &req.params);
                }
            }
            "Cone" => {
                let f = req.floats();
                if f.len() >= 3 {
                    let base = self.new_base("quadric");
                    let q = Quadric::new(
                        base,
                        QuadricKind::Cone {
                            height: f[0],
                            radius: f[1],
                            v_min: 0.0,
                            v_max: 1.0,
                            theta_min: 0.0,
                            theta_max: f[2],
                        },
                    );
                    self.push_quadric(q, &req.params);
                }
            }
            "Cylinder" => {
                let f = req.floats();
                if f.len() >= 4 {
                    let base = self.new_base("quadric");
                    let q = Quadric::new(
                        base,
                        QuadricKind::Cylinder {
                            radius: f[0],
                            z_min: f[1],
                            z_max: f[2],
                            theta_min: 0.0,
                            theta_max: f[3],
                        },
                    );
                    self.push_quadric(q, &req.params);
                }
            }
            "Hyperboloid" => {
                let f = req.floats();
                if f.len() >= 7 {
                    let base = self.new_base("quadric");
                    let q = Quadric::new(
                        base,
                        QuadricKind::Hyperboloid {
                            point1: Vec3::new(f[0], f[1], f[2]),
                            point2: Vec3::new(f[3], f[4], f[5]),
                            theta_min: 0.0,
                            theta_max: f[6],
                        },
                    );
                    self.push_quadric(q, &req.params);
                }
            }
            "Paraboloid" => {
                let f = req.floats();
                if f.len() >= 4 {
                    let base = self.new_base("quadric");
                    let q = Quadric::new(
                        base,
                        QuadricKind::Paraboloid {
                            r_max: f[0],
                            z_min: f[1],
                            z_max: f[2],
                            theta_min: 0.0,
                            theta_max: f[3],
                        },
                    );
                    self.push_quadric(q, &req.params);
                }
            }
            "Torus" => {
                let f = req.floats();
                if f.len() >= 5 {
                    let base = self.new_base("quadric");
                    let q = Quadric::new(
                        base,
                        QuadricKind::Torus {
                            major: f[0],
                            minor: f[1],
                            phi_min: f[2],
                            phi_max: f[3],
                            theta_min: 0.0,
                            theta_max: f[4],
                        },
                    );
                    self.push_quadric(q, &req.params);
                }
            }
            "Disk" => {
                let f = req.floats();
                if f.len() >= 3 {
                    let base = self.new_base("quadric");
                    let q = Quadric::new(
                        base,
                        QuadricKind::Disk {
                            height: f[0],
                            minor: 0.0,
                            major: f[1],
                            theta_min: 0.0,
                            theta_max: f[2],
                        },
                    );
                    self.push_quadric(q, &req.params);
                }
            }
            "Patch" => {
                let Some(kind) = req.str_arg(0) else {
                    return Ok(());
                };
                let Some(p) = req.param("P") else {
                    warn!("Patch without P");
                    return Ok(());
                };
                let points = self.camera_points(&p.value.as_floats(), 3);
                match kind {
                    "bilinear" if points.len() >= 4 => {
                        let mut base = self.new_base("patch");
                        attach_primvars(&mut base, &req.params, 4, 4);
                        let patch =
                            BilinearPatch::new(base, [points[0], points[1], points[2], points[3]]);
                        self.push_surface(Box::new(patch));
                    }
                    "bicubic" if points.len() >= 16 => {
                        let mut base = self.new_base("patch");
                        attach_primvars(&mut base, &req.params, 4, 16);
                        let mut control = [Vec3::ZERO; 16];
                        control.copy_from_slice(&points[..16]);
                        let patch = BicubicPatch::new(base, control);
                        self.push_surface(Box::new(patch));
                    }
                    other => warn!("Patch `{other}` with too few points"),
                }
            }
            "PatchMesh" => {
                let kind = req.str_arg(0).unwrap_or("bilinear");
                let nu = req.int_arg(1).unwrap_or(0).max(0) as usize;
                let u_wrap = req.str_arg(2) == Some("periodic");
                let nv = req.int_arg(3).unwrap_or(0).max(0) as usize;
                let v_wrap = req.str_arg(4) == Some("periodic");
                let Some(p) = req.param("P") else {
                    warn!("PatchMesh without P");
                    return Ok(());
                };
                let points = self.camera_points(&p.value.as_floats(), 3);
                if points.len() < nu * nv || nu == 0 || nv == 0 {
                    warn!("PatchMesh with inconsistent dimensions");
                    return Ok(());
                }
                let mut base = self.new_base("patchmesh");
                attach_primvars(&mut base, &req.params, nu * nv, nu * nv);
                let mesh =
                    PatchMesh::new(base, kind == "bicubic", nu, nv, u_wrap, v_wrap, points);
                self.push_surface(Box::new(mesh));
            }
            "NuPatch" => {
                let nu = req.int_arg(0).unwrap_or(0).max(0) as usize;
                let u_order = req.int_arg(1).unwrap_or(0).max(1) as usize;
                let u_knots = req
                    .positional
                    .get(2)
                    .map(|v| v.as_floats())
                    .unwrap_or_default();
                let nv = req.int_arg(5).unwrap_or(0).max(0) as usize;
                let v_order = req.int_arg(6).unwrap_or(0).max(1) as usize;
                let v_knots = req
                    .positional
                    .get(7)
                    .map(|v| v.as_floats())
                    .unwrap_or_default();
                let o2c = self.context.object_to_camera();
                let points: Vec<Vec4> = if let Some(pw) = req.param("Pw") {
                    pw.value
                        .as_floats()
                        .chunks_exact(4)
                        .map(|c| {
                            let w = c[3];
                            let p = if w != 0.0 {
                                Vec3::new(c[0], c[1], c[2]) / w
                            } else {
                                Vec3::new(c[0], c[1], c[2])
                            };
                            (o2c.transform_point3(p) * w).extend(w)
                        })
                        .collect()
                } else if let Some(p) = req.param("P") {
                    self.camera_points(&p.value.as_floats(), 3)
                        .into_iter()
                        .map(|p| p.extend(1.0))
                        .collect()
                } else {
                    warn!("NuPatch without P/Pw");
                    return Ok(());
                };
                if points.len() < nu * nv
                    || u_knots.len() != nu + u_order
                    || v_knots.len() != nv + v_order
                {
                    warn!("NuPatch with inconsistent dimensions");
                    return Ok(());
                }
                let base = self.new_base("nupatch");
                let mut patch =
                    NurbsPatch::new(base, u_order, v_order, u_knots, v_knots, nu, nv, points);
                patch.clamp();
                patch.trim = self.context.attrs().trim.clone();
                self.push_surface(Box::new(patch));
            }
            "TrimCurve" => {
                if let Some(lp) = parse_trim_curve(req) {
                    self.context.attrs_mut().trim.push(lp);
                }
            }
            "Curves" => {
                let kind = req.str_arg(0).unwrap_or("linear");
                let counts: Vec<usize> = req
                    .positional
                    .get(1)
                    .map(|v| v.as_floats().iter().map(|f| *f as usize).collect())
                    .unwrap_or_default();
                let periodic = req.str_arg(2) == Some("periodic");
                let Some(p) = req.param("P") else {
                    warn!("Curves without P");
                    return Ok(());
                };
                let points = self.camera_points(&p.value.as_floats(), 3);
                let total: usize = counts.iter().sum();
                if points.len() < total || counts.is_empty() {
                    warn!("Curves with inconsistent vertex counts");
                    return Ok(());
                }
                let mut base = self.new_base("curves");
                base.primvars.push(PrimVar::points(&points));
                let varying = total; // upper bound; group normalizes widths
                attach_primvars(&mut base, &req.params, varying, total);
                match CurvesGroup::new(base, kind == "cubic", counts, periodic) {
                    Ok(group) => self.push_surface(Box::new(group)),
                    Err(e) => warn!("Curves rejected: {e}"),
                }
            }
            other => debug!(request = other, "ignored request"),
        }
        Ok(())
    }
}

impl RequestHandler for SceneBuilder {
    fn handle(&mut self, request: Request) -> Result<(), Box<dyn std::error::Error>> {
        self.handle_request(&request).map_err(|e| e.into())
    }
}

impl Default for SceneBuilder {
    fn default() -> Self {
        SceneBuilder::new()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// RIB matrices are row-major with row-vector convention; glam wants the
/// transpose.
fn matrix_arg(req: &Request) -> Option<Mat4> {
    let f = req.floats();
    if f.len() == 16 {
        let m: [f32; 16] = f.try_into().ok()?;
        Some(Mat4::from_cols_array(&m))
    } else {
        None
    }
}

fn trailing_name(decl: &str) -> &str {
    decl.rsplit(' ').next().unwrap_or(decl)
}

fn parse_basis<'a>(
    values: &mut impl Iterator<Item = &'a RibValue>,
) -> Option<(mote_geom::CubicBasis, usize)> {
    let basis = match values.next()? {
        RibValue::Str(name) => mote_geom::CubicBasis::from_name(name)?,
        RibValue::FloatArray(f) if f.len() == 16 => {
            let m: [f32; 16] = f.clone().try_into().ok()?;
            mote_geom::CubicBasis::Custom(Mat4::from_cols_array(&m).transpose())
        }
        _ => return None,
    };
    let step = values.next()?.as_int()? as usize;
    Some((basis, step.max(1)))
}

/// Converts shader parameter-list entries into shader argument values.
fn shader_args(params: &[ParamValue]) -> Vec<(SmolStr, Value)> {
    params
        .iter()
        .filter_map(|p| {
            let name = SmolStr::new(trailing_name(&p.name));
            let value = match &p.value {
                RibValue::Str(s) => Value::uniform_str(s.clone()),
                other => {
                    let f = other.as_floats();
                    match f.len() {
                        0 => return None,
                        1 => Value::uniform_float(f[0]),
                        3 => {
                            let ty = declared_triple_type(&p.name, &name);
                            let mut v = Value::new(ty, StorageClass::Uniform, 1);
                            v.set_triple(0, Vec3::new(f[0], f[1], f[2]));
                            v
                        }
                        16 => {
                            let m: [f32; 16] = f.try_into().ok()?;
                            let mut v = Value::new(ValueType::Matrix, StorageClass::Uniform, 1);
                            v.set_matrix(0, Mat4::from_cols_array(&m).transpose());
                            v
                        }
                        _ => return None,
                    }
                }
            };
            Some((name, value))
        })
        .collect()
}

fn declared_triple_type(decl: &str, name: &str) -> ValueType {
    if decl.contains("point") || matches!(name, "from" | "to") {
        ValueType::Point
    } else if decl.contains("vector") || name == "direction" {
        ValueType::Vector
    } else if decl.contains("normal") {
        ValueType::Normal
    } else {
        ValueType::Color
    }
}

/// A light is ambient when its program never positions itself with
/// `illuminate`/`solar`.
fn light_is_ambient(vm: &slx::ShaderVm) -> bool {
    use slx::{Cell, Op};
    let emits = |cells: &[Cell]| {
        cells.iter().any(|c| {
            matches!(
                c,
                Cell::Op(Op::Illuminate)
                    | Cell::Op(Op::Illuminate2)
                    | Cell::Op(Op::Solar)
                    | Cell::Op(Op::Solar2)
            )
        })
    };
    !vm.with_program(|p| emits(&p.init) || emits(&p.main))
}

/// Attaches the parameter list to a surface as primitive variables.
/// `varying_count`/`vertex_count` size-check the payloads.
fn attach_primvars(
    base: &mut SurfaceBase,
    params: &[ParamValue],
    varying_count: usize,
    vertex_count: usize,
) {
    for p in params {
        let name = trailing_name(&p.name);
        if name == "P" || name == "Pw" {
            continue; // handled by the primitive constructors
        }
        let floats = p.value.as_floats();
        let (class, ty) = classify_primvar(&p.name, name, floats.len(), varying_count, vertex_count);
        let pv = match ty {
            ValueType::Float => PrimVar::new(
                SmolStr::new(name),
                class,
                ValueType::Float,
                PrimVarData::Float(floats),
            ),
            ValueType::String => match &p.value {
                RibValue::Str(s) => PrimVar::new(
                    SmolStr::new(name),
                    StorageClass::Constant,
                    ValueType::String,
                    PrimVarData::Str(vec![s.clone()]),
                ),
                _ => continue,
            },
            triple => PrimVar::new(
                SmolStr::new(name),
                class,
                triple,
                PrimVarData::Triple(
                    floats
                        .chunks_exact(3)
                        .map(|c| Vec3::new(c[0], c[1], c[2]))
                        .collect(),
                ),
            ),
        };
        if name == "st" {
            // Split interleaved st into the two standard variables.
            if let PrimVarData::Float(data) = &pv.data {
                let s: Vec<f32> = data.iter().step_by(2).copied().collect();
                let t: Vec<f32> = data.iter().skip(1).step_by(2).copied().collect();
                base.primvars
                    .push(PrimVar::floats("s", StorageClass::Varying, s));
                base.primvars
                    .push(PrimVar::floats("t", StorageClass::Varying, t));
            }
            continue;
        }
        base.primvars.push(pv);
    }
}

fn classify_primvar(
    decl: &str,
    name: &str,
    float_count: usize,
    varying_count: usize,
    vertex_count: usize,
) -> (StorageClass, ValueType) {
    // Inline declarations take precedence.
    let class = if decl.contains("constant") {
        StorageClass::Constant
    } else if decl.contains("uniform") {
        StorageClass::Uniform
    } else if decl.contains("vertex") {
        StorageClass::Vertex
    } else if decl.contains("facevarying") {
        StorageClass::FaceVarying
    } else if decl.contains("varying") {
        StorageClass::Varying
    } else {
        match name {
            "N" | "Cs" | "Os" | "s" | "t" | "st" | "width" => StorageClass::Varying,
            "constantwidth" => StorageClass::Constant,
            _ => {
                // Infer from the payload size.
                if float_count == vertex_count * 3 {
                    StorageClass::Vertex
                } else if float_count == varying_count || float_count == varying_count * 3 {
                    StorageClass::Varying
                } else {
                    StorageClass::Constant
                }
            }
        }
    };
    let ty = if decl.contains("point") {
        ValueType::Point
    } else if decl.contains("vector") {
        ValueType::Vector
    } else if decl.contains("normal") || name == "N" {
        ValueType::Normal
    } else if decl.contains("color") || matches!(name, "Cs" | "Os") {
        ValueType::Color
    } else if decl.contains("string") {
        ValueType::String
    } else {
        ValueType::Float
    };
    (class, ty)
}

/// `TrimCurve [ncurves] [orders] [knots] [mins] [maxs] [ns] [u] [v] [w]`.
fn parse_trim_curve(req: &Request) -> Option<TrimLoop> {
    let get = |i: usize| req.positional.get(i).map(|v| v.as_floats());
    let ncurves = get(0)?;
    let orders = get(1)?;
    let knots = get(2)?;
    let _mins = get(3)?;
    let _maxs = get(4)?;
    let ns = get(5)?;
    let us = get(6)?;
    let vs = get(7)?;
    let ws = get(8)?;
    let mut lp = TrimLoop::default();
    let mut knot_cursor = 0usize;
    let mut cp_cursor = 0usize;
    let curves_in_loop = *ncurves.first()? as usize;
    for c in 0..curves_in_loop.min(orders.len()) {
        let order = orders[c] as usize;
        let n = ns.get(c).copied()? as usize;
        let knot_count = n + order;
        if knot_cursor + knot_count > knots.len() || cp_cursor + n > us.len() {
            warn!("TrimCurve arrays are inconsistent");
            return None;
        }
        let points = (0..n)
            .map(|i| {
                let w = ws.get(cp_cursor + i).copied().unwrap_or(1.0);
                Vec3::new(us[cp_cursor + i], vs[cp_cursor + i], w)
            })
            .collect();
        lp.curves.push(TrimCurve {
            order,
            knots: knots[knot_cursor..knot_cursor + knot_count].to_vec(),
            points,
        });
        knot_cursor += knot_count;
        cp_cursor += n;
    }
    if lp.curves.is_empty() {
        None
    } else {
        Some(lp)
    }
}
