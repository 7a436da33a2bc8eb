//! Micropolygon grids: the product of dicing, the input to shading.

use slx::{EnvVar, ShaderExecEnv, Value};

/// A rectangular `(u_res+1)×(v_res+1)` array of shading points wrapped
/// around the shading environment the SVM will run over.
pub struct MicroGrid {
    u_res: usize,
    v_res: usize,
    env: ShaderExecEnv,
    /// Lanes punched out by trim curves; shaded but never sampled.
    holes: Vec<bool>,
    /// Set when the source patch had a phantom fourth vertex.
    triangular: bool,
    /// Extra (AOV) values diced from user primitive variables.
    extras: Vec<Value>,
}

impl MicroGrid {
    pub fn new(u_res: usize, v_res: usize) -> MicroGrid {
        let env = ShaderExecEnv::new(u_res, v_res);
        let n = env.grid_size();
        MicroGrid {
            u_res,
            v_res,
            env,
            holes: vec![false; n],
            triangular: false,
            extras: Vec::new(),
        }
    }

    pub fn u_res(&self) -> usize {
        self.u_res
    }

    pub fn v_res(&self) -> usize {
        self.v_res
    }

    pub fn len(&self) -> usize {
        self.holes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holes.is_empty()
    }

    pub fn lane(&self, iu: usize, iv: usize) -> usize {
        iv * (self.u_res + 1) + iu
    }

    pub fn env(&self) -> &ShaderExecEnv {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut ShaderExecEnv {
        &mut self.env
    }

    pub fn var(&self, var: EnvVar) -> slx::ValueRef {
        self.env.var(var)
    }

    pub fn set_hole(&mut self, lane: usize) {
        self.holes[lane] = true;
    }

    pub fn is_hole(&self, lane: usize) -> bool {
        self.holes[lane]
    }

    pub fn set_triangular(&mut self, t: bool) {
        self.triangular = t;
    }

    pub fn is_triangular(&self) -> bool {
        self.triangular
    }

    pub fn add_extra(&mut self, v: Value) {
        self.extras.push(v);
    }

    pub fn extras(&self) -> &[Value] {
        &self.extras
    }
}
