//! The shading execution environment: grid-sized system variables, the
//! running-state mask stack, the frame table and light hookups.

use crate::bitvec::BitVector;
use crate::stack::ValueRef;
use crate::value::{StorageClass, Value, ValueType};
use bitflags::bitflags;
use glam::{Mat4, Vec3};
use smol_str::SmolStr;
use std::cell::RefCell;
use std::rc::Rc;

////////////////////////////////////////////////////////////////////////////////////////////////////

macro_rules! env_vars {
    ($($variant:ident = $name:literal : $ty:ident / $class:ident,)*) => {
        /// System variables of the shading environment, in index order.
        #[derive(Copy, Clone, Debug, PartialEq, Eq)]
        #[repr(usize)]
        #[allow(non_camel_case_types)]
        pub enum EnvVar {
            $($variant,)*
        }

        pub const ENV_VAR_COUNT: usize = [$(EnvVar::$variant,)*].len();

        impl EnvVar {
            pub fn from_name(name: &str) -> Option<EnvVar> {
                match name {
                    $($name => Some(EnvVar::$variant),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(EnvVar::$variant => $name,)*
                }
            }

            pub fn ty(self) -> ValueType {
                match self {
                    $(EnvVar::$variant => ValueType::$ty,)*
                }
            }

            pub fn class(self) -> StorageClass {
                match self {
                    $(EnvVar::$variant => StorageClass::$class,)*
                }
            }

            pub fn all() -> [EnvVar; ENV_VAR_COUNT] {
                [$(EnvVar::$variant,)*]
            }
        }
    };
}

env_vars! {
    P = "P" : Point / Varying,
    N = "N" : Normal / Varying,
    Ng = "Ng" : Normal / Varying,
    I = "I" : Vector / Varying,
    E = "E" : Point / Uniform,
    u = "u" : Float / Varying,
    v = "v" : Float / Varying,
    s = "s" : Float / Varying,
    t = "t" : Float / Varying,
    du = "du" : Float / Varying,
    dv = "dv" : Float / Varying,
    dPdu = "dPdu" : Vector / Varying,
    dPdv = "dPdv" : Vector / Varying,
    Cs = "Cs" : Color / Varying,
    Os = "Os" : Color / Varying,
    Ci = "Ci" : Color / Varying,
    Oi = "Oi" : Color / Varying,
    L = "L" : Vector / Varying,
    Cl = "Cl" : Color / Varying,
    Ol = "Ol" : Color / Varying,
    Ps = "Ps" : Point / Varying,
    time = "time" : Float / Uniform,
    alpha = "alpha" : Float / Uniform,
    ncomps = "ncomps" : Float / Uniform,
}

bitflags! {
    /// Which system variables a shader reads or writes.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct Uses: u32 {
        const P = 1 << EnvVar::P as u32;
        const N = 1 << EnvVar::N as u32;
        const NG = 1 << EnvVar::Ng as u32;
        const I = 1 << EnvVar::I as u32;
        const E = 1 << EnvVar::E as u32;
        const U = 1 << EnvVar::u as u32;
        const V = 1 << EnvVar::v as u32;
        const S = 1 << EnvVar::s as u32;
        const T = 1 << EnvVar::t as u32;
        const DU = 1 << EnvVar::du as u32;
        const DV = 1 << EnvVar::dv as u32;
        const DPDU = 1 << EnvVar::dPdu as u32;
        const DPDV = 1 << EnvVar::dPdv as u32;
        const CS = 1 << EnvVar::Cs as u32;
        const OS = 1 << EnvVar::Os as u32;
        const CI = 1 << EnvVar::Ci as u32;
        const OI = 1 << EnvVar::Oi as u32;
        const L = 1 << EnvVar::L as u32;
        const CL = 1 << EnvVar::Cl as u32;
        const OL = 1 << EnvVar::Ol as u32;
        const PS = 1 << EnvVar::Ps as u32;
        const TIME = 1 << EnvVar::time as u32;
        const ALPHA = 1 << EnvVar::alpha as u32;
        const NCOMPS = 1 << EnvVar::ncomps as u32;
    }
}

impl Uses {
    pub fn of(var: EnvVar) -> Uses {
        Uses::from_bits_truncate(1 << var as u32)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Renderer callbacks the interpreter consults for state queries, space
/// transforms and texture lookups.
pub trait RendererServices {
    /// Matrix taking points in `from` space to `to` space. Space names are
    /// `"current"`, `"camera"`, `"world"`, `"object"`, `"shader"`,
    /// `"screen"`, `"raster"`, `"NDC"` or a named coordinate system.
    fn space_to_space(&self, from: &str, to: &str) -> Option<Mat4>;

    /// `attribute("name", out)` query; returns false when unknown.
    fn attribute(&self, name: &str, out: &mut Value) -> bool {
        let _ = (name, out);
        false
    }

    /// `option("name", out)` query; returns false when unknown.
    fn option(&self, name: &str, out: &mut Value) -> bool {
        let _ = (name, out);
        false
    }

    fn renderer_info(&self, name: &str, out: &mut Value) -> bool {
        let _ = (name, out);
        false
    }

    /// Parameter query against the other shaders bound to the surface
    /// (`surface()`, `displacement()`, `atmosphere()`).
    fn shader_parameter(&self, name: &str, out: &mut Value) -> bool {
        let _ = (name, out);
        false
    }

    /// Near/far clipping depths, for `depth()`.
    fn clipping(&self) -> (f32, f32) {
        (f32::EPSILON, f32::MAX)
    }

    /// Single-channel texture sample. The default logs nothing and returns
    /// the neutral value; the renderer's texture cache overrides this.
    fn texture(&self, name: &str, channel: usize, s: f32, t: f32) -> Option<f32> {
        let _ = (name, channel, s, t);
        None
    }

    fn shadow(&self, name: &str, p: Vec3) -> Option<f32> {
        let _ = (name, p);
        None
    }

    /// `bake_*` point-cloud sink.
    fn bake(&self, file: &str, s: f32, t: f32, data: &[f32]) {
        let _ = (file, s, t, data);
    }
}

/// Services implementation with no renderer behind it; used at bind time
/// (`init` runs) and in tests.
pub struct NullServices;

impl RendererServices for NullServices {
    fn space_to_space(&self, _from: &str, _to: &str) -> Option<Mat4> {
        None
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// A light source attached to the environment.
///
/// `evaluate` runs the light over the surface points and fills `L`, `Cl` and
/// `Ol` in the surface environment.
pub trait LightShader {
    fn is_ambient(&self) -> bool;
    fn evaluate(&mut self, surface: &mut ShaderExecEnv, services: &dyn RendererServices);

    /// `lightsource("name", out)` query against the active light.
    fn parameter(&self, name: &str, out: &mut Value) -> bool {
        let _ = (name, out);
        false
    }
}

pub type LightRef = Rc<RefCell<dyn LightShader>>;

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Execution environment for one grid.
pub struct ShaderExecEnv {
    u_res: usize,
    v_res: usize,
    vars: Vec<ValueRef>,
    running: Vec<BitVector>,
    current: BitVector,
    base: BitVector,
    lights: Vec<LightRef>,
    light_cursor: Option<usize>,
    /// Matrix from "shader" space to camera space for the bound shader.
    pub shader_matrix: Mat4,
    /// Extra named outputs requested by the displays.
    extra: Vec<ValueRef>,
}

impl ShaderExecEnv {
    /// Creates an environment for a `(u_res+1)×(v_res+1)` grid.
    pub fn new(u_res: usize, v_res: usize) -> ShaderExecEnv {
        let n = (u_res + 1) * (v_res + 1);
        let vars: Vec<ValueRef> = EnvVar::all()
            .iter()
            .map(|&var| {
                let size = if var.class().is_varying() { n } else { 1 };
                Rc::new(RefCell::new(
                    Value::new(var.ty(), var.class(), size).with_name(var.name()),
                )) as ValueRef
            })
            .collect();
        vars[EnvVar::ncomps as usize].borrow_mut().set_float(0, 3.0);
        vars[EnvVar::alpha as usize].borrow_mut().set_float(0, 1.0);
        ShaderExecEnv {
            u_res,
            v_res,
            vars,
            running: Vec::new(),
            current: BitVector::new(n),
            base: BitVector::all_set(n),
            lights: Vec::new(),
            light_cursor: None,
            shader_matrix: Mat4::IDENTITY,
            extra: Vec::new(),
        }
    }

    pub fn grid_size(&self) -> usize {
        (self.u_res + 1) * (self.v_res + 1)
    }

    pub fn u_res(&self) -> usize {
        self.u_res
    }

    pub fn v_res(&self) -> usize {
        self.v_res
    }

    pub fn var(&self, var: EnvVar) -> ValueRef {
        self.vars[var as usize].clone()
    }

    pub fn var_by_index(&self, index: usize) -> Option<ValueRef> {
        self.vars.get(index).cloned()
    }

    /// Registers an extra output variable (AOV) filled from shader locals.
    pub fn add_extra_output(&mut self, value: ValueRef) {
        self.extra.push(value);
    }

    pub fn extra_outputs(&self) -> &[ValueRef] {
        &self.extra
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Running state.

    /// The running mask: the top of the state stack, or all-ones.
    pub fn running(&self) -> &BitVector {
        self.running.last().unwrap_or(&self.base)
    }

    /// True when lane `i` is enabled. Uniform writes pass `0`.
    pub fn lane_active(&self, i: usize) -> bool {
        self.running().get(i)
    }

    pub fn push_state(&mut self) {
        self.running.push(self.running().clone());
    }

    pub fn pop_state(&mut self) {
        self.running.pop();
    }

    /// Copies the current-state register into the running mask.
    pub fn get_current_state(&mut self) {
        let cur = self.current.clone();
        if let Some(top) = self.running.last_mut() {
            *top = cur;
        } else {
            self.base = cur;
        }
    }

    /// Flips the running mask within the enclosing scope.
    pub fn invert_running_state(&mut self) {
        let outer = if self.running.len() >= 2 {
            self.running[self.running.len() - 2].clone()
        } else {
            BitVector::all_set(self.grid_size())
        };
        if let Some(top) = self.running.last_mut() {
            top.complement();
            top.and(&outer);
        } else {
            self.base.complement();
        }
    }

    pub fn clear_current_state(&mut self) {
        self.current.clear();
    }

    pub fn current_state(&self) -> &BitVector {
        &self.current
    }

    /// Latches a popped boolean into the current state, under the running
    /// mask.
    pub fn set_current_state(&mut self, cond: &Value) {
        let running = self.running().clone();
        for i in 0..running.len() {
            if running.get(i) {
                self.current.set(i, cond.get_bool(i));
            }
        }
    }

    /// Resets masks for a fresh grid: running all ones, current zeroed.
    pub fn reset_state(&mut self) {
        self.running.clear();
        self.base = BitVector::all_set(self.grid_size());
        self.current = BitVector::new(self.grid_size());
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Lights.

    pub fn add_light(&mut self, light: LightRef) {
        self.lights.push(light);
    }

    pub fn lights(&self) -> &[LightRef] {
        &self.lights
    }

    /// Opens the illuminance loop: positions the cursor at the first
    /// non-ambient light and evaluates it. Returns false when no light
    /// remains.
    pub fn init_illuminance(&mut self, services: &dyn RendererServices) -> bool {
        self.light_cursor = None;
        self.advance_illuminance(services)
    }

    /// Steps the illuminance loop to the next non-ambient light.
    pub fn advance_illuminance(&mut self, services: &dyn RendererServices) -> bool {
        let mut next = self.light_cursor.map_or(0, |c| c + 1);
        while next < self.lights.len() {
            let light = self.lights[next].clone();
            if !light.borrow().is_ambient() {
                self.light_cursor = Some(next);
                light.borrow_mut().evaluate(self, services);
                return true;
            }
            next += 1;
        }
        self.light_cursor = None;
        false
    }

    /// The light the illuminance cursor currently points at.
    pub fn current_light(&self) -> Option<LightRef> {
        self.light_cursor.map(|i| self.lights[i].clone())
    }

    /// Accumulates the contribution of every ambient light into `out`.
    pub fn ambient(&mut self, services: &dyn RendererServices, out: &mut [Vec3]) {
        out.fill(Vec3::ZERO);
        for light in self.lights.clone() {
            if !light.borrow().is_ambient() {
                continue;
            }
            light.borrow_mut().evaluate(self, services);
            let cl = self.var(EnvVar::Cl);
            let cl = cl.borrow();
            for (i, o) in out.iter_mut().enumerate() {
                *o += cl.get_triple(i);
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Grid derivatives. Forward differences with boundary replication.

    fn lane(&self, iu: usize, iv: usize) -> usize {
        iv * (self.u_res + 1) + iu
    }

    /// Derivative of `f` with respect to `u` at every lane.
    pub fn du_float(&self, value: &Value, out: &mut [f32]) {
        let ures = self.u_res;
        let uvar = self.var(EnvVar::u);
        let uvar = uvar.borrow();
        for iv in 0..=self.v_res {
            for iu in 0..=ures {
                let i0 = self.lane(iu.min(ures.saturating_sub(1)), iv);
                let i1 = self.lane((iu + 1).min(ures), iv);
                let dd = uvar.get_float(i1) - uvar.get_float(i0);
                let df = value.get_float(i1) - value.get_float(i0);
                out[self.lane(iu, iv)] = if dd.abs() > f32::EPSILON { df / dd } else { 0.0 };
            }
        }
    }

    pub fn dv_float(&self, value: &Value, out: &mut [f32]) {
        let vres = self.v_res;
        let vvar = self.var(EnvVar::v);
        let vvar = vvar.borrow();
        for iv in 0..=vres {
            for iu in 0..=self.u_res {
                let i0 = self.lane(iu, iv.min(vres.saturating_sub(1)));
                let i1 = self.lane(iu, (iv + 1).min(vres));
                let dd = vvar.get_float(i1) - vvar.get_float(i0);
                let df = value.get_float(i1) - value.get_float(i0);
                out[self.lane(iu, iv)] = if dd.abs() > f32::EPSILON { df / dd } else { 0.0 };
            }
        }
    }

    pub fn du_triple(&self, value: &Value, out: &mut [Vec3]) {
        let ures = self.u_res;
        let uvar = self.var(EnvVar::u);
        let uvar = uvar.borrow();
        for iv in 0..=self.v_res {
            for iu in 0..=ures {
                let i0 = self.lane(iu.min(ures.saturating_sub(1)), iv);
                let i1 = self.lane((iu + 1).min(ures), iv);
                let dd = uvar.get_float(i1) - uvar.get_float(i0);
                let df = value.get_triple(i1) - value.get_triple(i0);
                out[self.lane(iu, iv)] = if dd.abs() > f32::EPSILON { df / dd } else { Vec3::ZERO };
            }
        }
    }

    pub fn dv_triple(&self, value: &Value, out: &mut [Vec3]) {
        let vres = self.v_res;
        let vvar = self.var(EnvVar::v);
        let vvar = vvar.borrow();
        for iv in 0..=vres {
            for iu in 0..=self.u_res {
                let i0 = self.lane(iu, iv.min(vres.saturating_sub(1)));
                let i1 = self.lane(iu, (iv + 1).min(vres));
                let dd = vvar.get_float(i1) - vvar.get_float(i0);
                let df = value.get_triple(i1) - value.get_triple(i0);
                out[self.lane(iu, iv)] = if dd.abs() > f32::EPSILON { df / dd } else { Vec3::ZERO };
            }
        }
    }
}

/// Convenience: resolves a system-variable name used by the loader.
pub fn system_var_index(name: &str) -> Option<usize> {
    EnvVar::from_name(name).map(|ev| ev as usize)
}

/// Space name constants used by the frame table.
pub mod spaces {
    pub const CURRENT: &str = "current";
    pub const CAMERA: &str = "camera";
    pub const WORLD: &str = "world";
    pub const OBJECT: &str = "object";
    pub const SHADER: &str = "shader";
    pub const SCREEN: &str = "screen";
    pub const RASTER: &str = "raster";
    pub const NDC: &str = "NDC";
}

/// Interns a space-name argument, defaulting blank to "current".
pub fn space_or_current(name: &SmolStr) -> &str {
    if name.is_empty() {
        spaces::CURRENT
    } else {
        name.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_vars_resolve_by_name() {
        assert_eq!(EnvVar::from_name("P"), Some(EnvVar::P));
        assert_eq!(EnvVar::from_name("dPdu"), Some(EnvVar::dPdu));
        assert_eq!(EnvVar::from_name("nope"), None);
        assert_eq!(EnvVar::P.name(), "P");
    }

    #[test]
    fn running_state_nesting() {
        let mut env = ShaderExecEnv::new(1, 1);
        assert_eq!(env.running().count(), 4);
        env.push_state();
        let mut cond = Value::new(ValueType::Float, StorageClass::Varying, 4);
        cond.set_float(0, 1.0);
        cond.set_float(2, 1.0);
        env.set_current_state(&cond);
        env.get_current_state();
        assert_eq!(env.running().count(), 2);
        env.invert_running_state();
        assert_eq!(env.running().count(), 2);
        assert!(env.running().get(1) && env.running().get(3));
        env.pop_state();
        assert_eq!(env.running().count(), 4);
    }

    #[test]
    fn inverse_respects_outer_scope() {
        let mut env = ShaderExecEnv::new(1, 1);
        // Outer if: lanes {0, 1}.
        env.push_state();
        let mut outer = Value::new(ValueType::Float, StorageClass::Varying, 4);
        outer.set_float(0, 1.0);
        outer.set_float(1, 1.0);
        env.set_current_state(&outer);
        env.get_current_state();
        // Inner if: lane {0}.
        env.push_state();
        let mut inner = Value::new(ValueType::Float, StorageClass::Varying, 4);
        inner.set_float(0, 1.0);
        env.set_current_state(&inner);
        env.get_current_state();
        env.invert_running_state();
        // The inner else runs only on lane 1, not on 2/3.
        assert_eq!(env.running().count(), 1);
        assert!(env.running().get(1));
    }

    #[test]
    fn du_of_u_is_one() {
        let env = ShaderExecEnv::new(3, 1);
        {
            let u = env.var(EnvVar::u);
            let mut u = u.borrow_mut();
            for iv in 0..=1 {
                for iu in 0..=3usize {
                    u.set_float(iv * 4 + iu, iu as f32 / 3.0);
                }
            }
        }
        let u = env.var(EnvVar::u);
        let mut out = vec![0.0; 8];
        env.du_float(&u.borrow(), &mut out);
        for d in out {
            assert!((d - 1.0).abs() < 1e-5);
        }
    }
}
