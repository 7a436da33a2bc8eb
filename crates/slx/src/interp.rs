//! The shading virtual machine.
//!
//! Executes a loaded [`Program`] against a [`ShaderExecEnv`]: a single
//! thread walks the cell stream, and every opcode loops over the grid lanes
//! under the running mask. Numeric domain faults set the offending lane to a
//! neutral value and continue; structural faults (stack underflow, stray
//! operand cells) abort the grid.

use crate::env::{EnvVar, LightShader, RendererServices, ShaderExecEnv, Uses};
use crate::error::{Error, Result};
use crate::ops::{math, noise, spline, strings};
use crate::program::{Cell, Op, Program, ShaderType, VarId};
use crate::stack::{Stack, StackEntry, ValueRef};
use crate::value::{StorageClass, Value, ValueType};
use glam::{Mat4, Vec3};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use smol_str::SmolStr;
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use tracing::warn;

////////////////////////////////////////////////////////////////////////////////////////////////////

fn res_class(varying: bool) -> StorageClass {
    if varying {
        StorageClass::Varying
    } else {
        StorageClass::Uniform
    }
}

/// Unary op: pop A, compute lane-parallel, push result.
macro_rules! un {
    ($vm:ident, $env:ident, $op:literal, $rty:expr, $get:ident, $set:ident, |$a:ident| $e:expr) => {{
        let mut fv = false;
        let ea = $vm.pop($op, &mut fv)?;
        let res = $vm.stack.next_temp($rty, res_class(fv), $env.grid_size());
        {
            let av = ea.data.borrow();
            let mut rv = res.borrow_mut();
            let n = if fv { $env.grid_size() } else { 1 };
            for i in 0..n {
                if !fv || $env.lane_active(i) {
                    let $a = av.$get(i);
                    rv.$set(i, $e);
                }
            }
        }
        $vm.stack.push(res);
        $vm.stack.release(ea);
    }};
}

/// Binary op with per-operand accessors.
macro_rules! bin {
    ($vm:ident, $env:ident, $op:literal, $rty:expr, $geta:ident, $getb:ident, $set:ident,
     |$a:ident, $b:ident| $e:expr) => {{
        let mut fv = false;
        let ea = $vm.pop($op, &mut fv)?;
        let eb = $vm.pop($op, &mut fv)?;
        let res = $vm.stack.next_temp($rty, res_class(fv), $env.grid_size());
        {
            let av = ea.data.borrow();
            let bv = eb.data.borrow();
            let mut rv = res.borrow_mut();
            let n = if fv { $env.grid_size() } else { 1 };
            for i in 0..n {
                if !fv || $env.lane_active(i) {
                    let $a = av.$geta(i);
                    let $b = bv.$getb(i);
                    rv.$set(i, $e);
                }
            }
        }
        $vm.stack.push(res);
        $vm.stack.release(ea);
        $vm.stack.release(eb);
    }};
}

/// Ternary op with per-operand accessors.
macro_rules! tern {
    ($vm:ident, $env:ident, $op:literal, $rty:expr, $geta:ident, $getb:ident, $getc:ident,
     $set:ident, |$a:ident, $b:ident, $c:ident| $e:expr) => {{
        let mut fv = false;
        let ea = $vm.pop($op, &mut fv)?;
        let eb = $vm.pop($op, &mut fv)?;
        let ec = $vm.pop($op, &mut fv)?;
        let res = $vm.stack.next_temp($rty, res_class(fv), $env.grid_size());
        {
            let av = ea.data.borrow();
            let bv = eb.data.borrow();
            let cv = ec.data.borrow();
            let mut rv = res.borrow_mut();
            let n = if fv { $env.grid_size() } else { 1 };
            for i in 0..n {
                if !fv || $env.lane_active(i) {
                    let $a = av.$geta(i);
                    let $b = bv.$getb(i);
                    let $c = cv.$getc(i);
                    rv.$set(i, $e);
                }
            }
        }
        $vm.stack.push(res);
        $vm.stack.release(ea);
        $vm.stack.release(eb);
        $vm.stack.release(ec);
    }};
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// One bound shader instance: a program plus its local variable storage.
pub struct ShaderVm {
    program: Rc<Program>,
    locals: Vec<ValueRef>,
    stack: Stack,
    uses: Uses,
    rng: SmallRng,
    faults: HashSet<&'static str>,
}

enum Section {
    Init,
    Main,
}

impl ShaderVm {
    pub fn new(program: Program) -> ShaderVm {
        let locals = program
            .locals
            .iter()
            .map(|decl| {
                let mut v = if decl.array_len > 0 {
                    Value::new_array(decl.ty, decl.class, 1, decl.array_len)
                } else {
                    Value::new(decl.ty, decl.class, 1)
                }
                .with_name(decl.name.clone());
                if decl.param {
                    v.mark_parameter();
                }
                Rc::new(RefCell::new(v)) as ValueRef
            })
            .collect();
        let mut uses = Uses::empty();
        for cell in program.init.iter().chain(program.main.iter()) {
            if let Cell::Var(var) = cell {
                if var.is_system() {
                    uses |= Uses::from_bits_truncate(1 << var.index() as u32);
                }
            }
        }
        ShaderVm {
            program: Rc::new(program),
            locals,
            stack: Stack::new(),
            uses,
            rng: SmallRng::seed_from_u64(0x5157_ab1e),
            faults: HashSet::new(),
        }
    }

    pub fn name(&self) -> &SmolStr {
        &self.program.name
    }

    pub fn shader_type(&self) -> ShaderType {
        self.program.shader_type
    }

    /// System variables this program touches.
    pub fn uses(&self) -> Uses {
        self.uses
    }

    /// Read access to the loaded program (inspection, ambient-light
    /// detection).
    pub fn with_program<R>(&self, f: impl FnOnce(&Program) -> R) -> R {
        f(&self.program)
    }

    /// Looks up a shader parameter by name.
    pub fn parameter(&self, name: &str) -> Option<ValueRef> {
        self.locals
            .iter()
            .find(|l| {
                let l = l.borrow();
                l.is_parameter() && l.name() == name
            })
            .cloned()
    }

    /// Overrides a parameter with a caller-supplied value (RIB argument).
    pub fn set_parameter(&mut self, name: &str, value: &Value) -> bool {
        match self.parameter(name) {
            Some(p) => {
                let mut p = p.borrow_mut();
                for lane in 0..value.size() {
                    p.set_from(value, lane);
                }
                true
            }
            None => false,
        }
    }

    pub fn local_by_name(&self, name: &str) -> Option<ValueRef> {
        self.locals
            .iter()
            .find(|l| l.borrow().name() == name)
            .cloned()
    }

    /// Runs the `init` section once, materializing default argument values.
    pub fn run_init(&mut self, services: &dyn RendererServices) -> Result<()> {
        let mut env = ShaderExecEnv::new(0, 0);
        let program = self.program.clone();
        self.faults.clear();
        self.run(&program.init, Section::Init, &mut env, services)
    }

    /// Runs `main` over a grid. The caller has already populated the
    /// environment's system variables and reset the running state.
    pub fn execute(
        &mut self,
        env: &mut ShaderExecEnv,
        services: &dyn RendererServices,
    ) -> Result<()> {
        let n = env.grid_size();
        for local in &self.locals {
            local.borrow_mut().set_size(n);
        }
        let program = self.program.clone();
        self.faults.clear();
        self.run(&program.main, Section::Main, env, services)
    }

    /// Number of live pool temporaries; zero between invocations.
    pub fn live_temps(&self) -> usize {
        self.stack.live_temps()
    }

    fn run(
        &mut self,
        cells: &[Cell],
        _section: Section,
        env: &mut ShaderExecEnv,
        services: &dyn RendererServices,
    ) -> Result<()> {
        let mut pc = 0usize;
        while pc < cells.len() {
            let op = match &cells[pc] {
                Cell::Op(op) => *op,
                other => {
                    return Err(Error::UnexpectedToken {
                        expected: "opcode cell",
                        found: format!("{other:?}"),
                    })
                }
            };
            pc += 1;
            self.exec(op, cells, &mut pc, env, services)?;
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Operand readers.

    fn read_float(&self, cells: &[Cell], pc: &mut usize) -> Result<f32> {
        match cells.get(*pc) {
            Some(Cell::Float(f)) => {
                *pc += 1;
                Ok(*f)
            }
            other => Err(Error::UnexpectedToken {
                expected: "float cell",
                found: format!("{other:?}"),
            }),
        }
    }

    fn read_str(&self, cells: &[Cell], pc: &mut usize) -> Result<SmolStr> {
        match cells.get(*pc) {
            Some(Cell::Str(s)) => {
                *pc += 1;
                Ok(s.clone())
            }
            other => Err(Error::UnexpectedToken {
                expected: "string cell",
                found: format!("{other:?}"),
            }),
        }
    }

    fn read_var(&self, cells: &[Cell], pc: &mut usize) -> Result<VarId> {
        match cells.get(*pc) {
            Some(Cell::Var(v)) => {
                *pc += 1;
                Ok(*v)
            }
            other => Err(Error::UnexpectedToken {
                expected: "variable cell",
                found: format!("{other:?}"),
            }),
        }
    }

    fn read_label(&self, cells: &[Cell], pc: &mut usize) -> Result<usize> {
        match cells.get(*pc) {
            Some(Cell::Label(target)) => {
                *pc += 1;
                Ok(*target)
            }
            other => Err(Error::UnexpectedToken {
                expected: "label cell",
                found: format!("{other:?}"),
            }),
        }
    }

    fn var_ref(&self, var: VarId, env: &ShaderExecEnv) -> Result<ValueRef> {
        if var.is_system() {
            env.var_by_index(var.index())
                .ok_or_else(|| Error::UnknownVariable(SmolStr::new("<system>")))
        } else {
            self.locals
                .get(var.index())
                .cloned()
                .ok_or_else(|| Error::UnknownVariable(SmolStr::new("<local>")))
        }
    }

    fn pop(&mut self, op: &'static str, varying: &mut bool) -> Result<StackEntry> {
        self.stack.pop(varying).ok_or(Error::StackUnderflow(op))
    }

    fn fault(&mut self, kind: &'static str) {
        if self.faults.insert(kind) {
            warn!(shader = %self.program.name, "shader runtime fault: {kind}");
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////

    fn exec(
        &mut self,
        op: Op,
        cells: &[Cell],
        pc: &mut usize,
        env: &mut ShaderExecEnv,
        services: &dyn RendererServices,
    ) -> Result<()> {
        use ValueType as T;
        let vm = self;
        match op {
            Op::Nop | Op::DebugBreak => {}
            Op::Dup => {
                vm.stack
                    .dup(env.grid_size())
                    .ok_or(Error::StackUnderflow("dup"))?;
            }
            Op::Drop => vm.stack.drop_top(),

            ////////////////////////////////////////////////////////////////////////////////////////
            // Pushes and pops.
            Op::Pushif => {
                let f = vm.read_float(cells, pc)?;
                let res = vm
                    .stack
                    .next_temp(T::Float, StorageClass::Uniform, env.grid_size());
                res.borrow_mut().set_float(0, f);
                vm.stack.push(res);
            }
            Op::Puship => {
                let x = vm.read_float(cells, pc)?;
                let y = vm.read_float(cells, pc)?;
                let z = vm.read_float(cells, pc)?;
                let res = vm
                    .stack
                    .next_temp(T::Point, StorageClass::Uniform, env.grid_size());
                res.borrow_mut().set_triple(0, Vec3::new(x, y, z));
                vm.stack.push(res);
            }
            Op::Pushis => {
                let s = vm.read_str(cells, pc)?;
                let res = vm
                    .stack
                    .next_temp(T::String, StorageClass::Uniform, env.grid_size());
                res.borrow_mut().set_str(0, s);
                vm.stack.push(res);
            }
            Op::Pushv => {
                let var = vm.read_var(cells, pc)?;
                let v = vm.var_ref(var, env)?;
                self_push_var(&mut vm.stack, v);
            }
            Op::Ipushv => {
                let var = vm.read_var(cells, pc)?;
                let v = vm.var_ref(var, env)?;
                let mut fv = false;
                let idx = vm.pop("ipushv", &mut fv)?;
                let (ty, alen, vsize) = {
                    let b = v.borrow();
                    (b.ty(), b.array_len(), b.size())
                };
                if alen == 0 {
                    vm.fault("index of non-array variable");
                    vm.stack.release(idx);
                    let res = vm.stack.next_temp(ty, StorageClass::Uniform, env.grid_size());
                    vm.stack.push(res);
                    return Ok(());
                }
                let varying = fv || vsize > 1;
                let res = vm.stack.next_temp(ty, res_class(varying), env.grid_size());
                {
                    let src = v.borrow();
                    let iv = idx.data.borrow();
                    let mut rv = res.borrow_mut();
                    let n = if varying { env.grid_size() } else { 1 };
                    for i in 0..n {
                        if !varying || env.lane_active(i) {
                            let e = iv.get_float(i) as usize;
                            if e < alen {
                                rv.set_from_elem(0, &src, e, i);
                            } else {
                                vm_fault_index(&mut rv, i);
                            }
                        }
                    }
                }
                vm.stack.push(res);
                vm.stack.release(idx);
            }
            Op::Pop => {
                let var = vm.read_var(cells, pc)?;
                let dest = vm.var_ref(var, env)?;
                let mut fv = false;
                let val = vm.pop("pop", &mut fv)?;
                if !Rc::ptr_eq(&dest, &val.data) {
                    let src = val.data.borrow();
                    let mut dst = dest.borrow_mut();
                    let n = dst.size().max(src.size());
                    let varying = n > 1;
                    for i in 0..n {
                        if !varying || env.lane_active(i) {
                            dst.set_from(&src, i);
                        }
                    }
                }
                vm.stack.release(val);
            }
            Op::Ipop => {
                let var = vm.read_var(cells, pc)?;
                let dest = vm.var_ref(var, env)?;
                let mut fv = false;
                let idx = vm.pop("ipop", &mut fv)?;
                let val = vm.pop("ipop", &mut fv)?;
                let alen = dest.borrow().array_len();
                if alen == 0 {
                    vm.fault("index of non-array variable");
                } else if !Rc::ptr_eq(&dest, &val.data) {
                    let src = val.data.borrow();
                    let iv = idx.data.borrow();
                    let mut dst = dest.borrow_mut();
                    let n = dst.size().max(src.size());
                    let varying = n > 1;
                    for i in 0..n {
                        if !varying || env.lane_active(i) {
                            let e = iv.get_float(i) as usize;
                            if e < alen {
                                dst.set_from_elem(e, &src, 0, i);
                            }
                        }
                    }
                }
                vm.stack.release(val);
                vm.stack.release(idx);
            }

            ////////////////////////////////////////////////////////////////////////////////////////
            // Per-lane φ-selects. These write every lane: both sides of the
            // conditional have already produced values.
            Op::Mergef => vm.merge(env, T::Float)?,
            Op::Merges => vm.merge(env, T::String)?,
            Op::Mergep => vm.merge(env, T::Point)?,
            Op::Mergec => vm.merge(env, T::Color)?,

            ////////////////////////////////////////////////////////////////////////////////////////
            // Casts and constructors.
            Op::Setfc => un!(vm, env, "setfc", T::Color, get_float, set_triple, |a| Vec3::splat(a)),
            Op::Setfp => un!(vm, env, "setfp", T::Point, get_float, set_triple, |a| Vec3::splat(a)),
            Op::Setfm => {
                un!(vm, env, "setfm", T::Matrix, get_float, set_matrix, |a| Mat4::IDENTITY * a)
            }
            Op::Settc => tern!(vm, env, "settc", T::Color, get_float, get_float, get_float,
                set_triple, |a, b, c| Vec3::new(a, b, c)),
            Op::Settp => tern!(vm, env, "settp", T::Point, get_float, get_float, get_float,
                set_triple, |a, b, c| Vec3::new(a, b, c)),
            Op::Setpc => un!(vm, env, "setpc", T::Color, get_triple, set_triple, |a| a),
            Op::Setcp => un!(vm, env, "setcp", T::Point, get_triple, set_triple, |a| a),
            Op::Setwm => vm.setwm(env)?,

            ////////////////////////////////////////////////////////////////////////////////////////
            // Running state and jumps.
            Op::RsPush => env.push_state(),
            Op::RsPop => env.pop_state(),
            Op::RsGet => env.get_current_state(),
            Op::RsInverse => env.invert_running_state(),
            Op::SClear => env.clear_current_state(),
            Op::SGet => {
                let mut fv = false;
                let cond = vm.pop("S_GET", &mut fv)?;
                env.set_current_state(&cond.data.borrow());
                vm.stack.release(cond);
            }
            Op::RsJz => {
                let target = vm.read_label(cells, pc)?;
                if env.running().count() == 0 {
                    *pc = target;
                }
            }
            Op::RsJnz => {
                let target = vm.read_label(cells, pc)?;
                if env.running().count() == env.running().len() {
                    *pc = target;
                }
            }
            Op::SJz => {
                let target = vm.read_label(cells, pc)?;
                if env.current_state().count() == 0 {
                    *pc = target;
                }
            }
            Op::SJnz => {
                let target = vm.read_label(cells, pc)?;
                if env.current_state().count() == env.running().len() {
                    *pc = target;
                }
            }
            Op::Jmp => {
                let target = vm.read_label(cells, pc)?;
                *pc = target;
            }
            Op::Jz => {
                let target = vm.read_label(cells, pc)?;
                let mut fv = false;
                let val = vm.pop("jz", &mut fv)?;
                let jump = {
                    let v = val.data.borrow();
                    let n = if fv { env.grid_size() } else { 1 };
                    !(0..n).any(|i| (!fv || env.lane_active(i)) && v.get_bool(i))
                };
                vm.stack.release(val);
                if jump {
                    *pc = target;
                }
            }
            Op::Jnz => {
                let target = vm.read_label(cells, pc)?;
                let mut fv = false;
                let val = vm.pop("jnz", &mut fv)?;
                let jump = {
                    let v = val.data.borrow();
                    let n = if fv { env.grid_size() } else { 1 };
                    (0..n).all(|i| !(!fv || env.lane_active(i)) || v.get_bool(i))
                };
                vm.stack.release(val);
                if jump {
                    *pc = target;
                }
            }

            ////////////////////////////////////////////////////////////////////////////////////////
            // Comparisons: result is float 0/1.
            Op::Lsff => bin!(vm, env, "lsff", T::Float, get_float, get_float, set_float,
                |a, b| (a < b) as u32 as f32),
            Op::Lspp => bin!(vm, env, "lspp", T::Float, get_triple, get_triple, set_float,
                |a, b| (a.length_squared() < b.length_squared()) as u32 as f32),
            Op::Lscc => bin!(vm, env, "lscc", T::Float, get_triple, get_triple, set_float,
                |a, b| (a.length_squared() < b.length_squared()) as u32 as f32),
            Op::Gtff => bin!(vm, env, "gtff", T::Float, get_float, get_float, set_float,
                |a, b| (a > b) as u32 as f32),
            Op::Gtpp => bin!(vm, env, "gtpp", T::Float, get_triple, get_triple, set_float,
                |a, b| (a.length_squared() > b.length_squared()) as u32 as f32),
            Op::Gtcc => bin!(vm, env, "gtcc", T::Float, get_triple, get_triple, set_float,
                |a, b| (a.length_squared() > b.length_squared()) as u32 as f32),
            Op::Geff => bin!(vm, env, "geff", T::Float, get_float, get_float, set_float,
                |a, b| (a >= b) as u32 as f32),
            Op::Gepp => bin!(vm, env, "gepp", T::Float, get_triple, get_triple, set_float,
                |a, b| (a.length_squared() >= b.length_squared()) as u32 as f32),
            Op::Gecc => bin!(vm, env, "gecc", T::Float, get_triple, get_triple, set_float,
                |a, b| (a.length_squared() >= b.length_squared()) as u32 as f32),
            Op::Leff => bin!(vm, env, "leff", T::Float, get_float, get_float, set_float,
                |a, b| (a <= b) as u32 as f32),
            Op::Lepp => bin!(vm, env, "lepp", T::Float, get_triple, get_triple, set_float,
                |a, b| (a.length_squared() <= b.length_squared()) as u32 as f32),
            Op::Lecc => bin!(vm, env, "lecc", T::Float, get_triple, get_triple, set_float,
                |a, b| (a.length_squared() <= b.length_squared()) as u32 as f32),
            Op::Eqff => bin!(vm, env, "eqff", T::Float, get_float, get_float, set_float,
                |a, b| (a == b) as u32 as f32),
            Op::Eqpp => bin!(vm, env, "eqpp", T::Float, get_triple, get_triple, set_float,
                |a, b| (a == b) as u32 as f32),
            Op::Eqcc => bin!(vm, env, "eqcc", T::Float, get_triple, get_triple, set_float,
                |a, b| (a == b) as u32 as f32),
            Op::Eqss => bin!(vm, env, "eqss", T::Float, get_str, get_str, set_float,
                |a, b| (a == b) as u32 as f32),
            Op::Eqmm => bin!(vm, env, "eqmm", T::Float, get_matrix, get_matrix, set_float,
                |a, b| (a == b) as u32 as f32),
            Op::Neff => bin!(vm, env, "neff", T::Float, get_float, get_float, set_float,
                |a, b| (a != b) as u32 as f32),
            Op::Nepp => bin!(vm, env, "nepp", T::Float, get_triple, get_triple, set_float,
                |a, b| (a != b) as u32 as f32),
            Op::Necc => bin!(vm, env, "necc", T::Float, get_triple, get_triple, set_float,
                |a, b| (a != b) as u32 as f32),
            Op::Ness => bin!(vm, env, "ness", T::Float, get_str, get_str, set_float,
                |a, b| (a != b) as u32 as f32),
            Op::Nemm => bin!(vm, env, "nemm", T::Float, get_matrix, get_matrix, set_float,
                |a, b| (a != b) as u32 as f32),

            ////////////////////////////////////////////////////////////////////////////////////////
            // Arithmetic. The first pop is the left operand.
            Op::Addff => bin!(vm, env, "addff", T::Float, get_float, get_float, set_float,
                |a, b| a + b),
            Op::Subff => bin!(vm, env, "subff", T::Float, get_float, get_float, set_float,
                |a, b| a - b),
            Op::Mulff => bin!(vm, env, "mulff", T::Float, get_float, get_float, set_float,
                |a, b| a * b),
            Op::Divff => bin!(vm, env, "divff", T::Float, get_float, get_float, set_float,
                |a, b| math::safe_div(a, b)),
            Op::Negf => un!(vm, env, "negf", T::Float, get_float, set_float, |a| -a),
            Op::Addpp => bin!(vm, env, "addpp", T::Point, get_triple, get_triple, set_triple,
                |a, b| a + b),
            Op::Subpp => bin!(vm, env, "subpp", T::Point, get_triple, get_triple, set_triple,
                |a, b| a - b),
            // Component-wise, not matrix-vector.
            Op::Mulpp => bin!(vm, env, "mulpp", T::Point, get_triple, get_triple, set_triple,
                |a, b| a * b),
            Op::Divpp => bin!(vm, env, "divpp", T::Point, get_triple, get_triple, set_triple,
                |a, b| math::safe_div_v(a, b)),
            Op::Crspp => bin!(vm, env, "crspp", T::Point, get_triple, get_triple, set_triple,
                |a, b| a.cross(b)),
            Op::Dotpp => bin!(vm, env, "dotpp", T::Float, get_triple, get_triple, set_float,
                |a, b| a.dot(b)),
            Op::Negp => un!(vm, env, "negp", T::Point, get_triple, set_triple, |a| -a),
            Op::Addcc => bin!(vm, env, "addcc", T::Color, get_triple, get_triple, set_triple,
                |a, b| a + b),
            Op::Subcc => bin!(vm, env, "subcc", T::Color, get_triple, get_triple, set_triple,
                |a, b| a - b),
            Op::Mulcc => bin!(vm, env, "mulcc", T::Color, get_triple, get_triple, set_triple,
                |a, b| a * b),
            Op::Divcc => bin!(vm, env, "divcc", T::Color, get_triple, get_triple, set_triple,
                |a, b| math::safe_div_v(a, b)),
            Op::Crscc => bin!(vm, env, "crscc", T::Color, get_triple, get_triple, set_triple,
                |a, b| a.cross(b)),
            Op::Dotcc => bin!(vm, env, "dotcc", T::Float, get_triple, get_triple, set_float,
                |a, b| a.dot(b)),
            Op::Negc => un!(vm, env, "negc", T::Color, get_triple, set_triple, |a| -a),
            Op::Addfp => bin!(vm, env, "addfp", T::Point, get_float, get_triple, set_triple,
                |a, b| Vec3::splat(a) + b),
            Op::Subfp => bin!(vm, env, "subfp", T::Point, get_float, get_triple, set_triple,
                |a, b| Vec3::splat(a) - b),
            Op::Mulfp => bin!(vm, env, "mulfp", T::Point, get_float, get_triple, set_triple,
                |a, b| a * b),
            Op::Divfp => bin!(vm, env, "divfp", T::Point, get_float, get_triple, set_triple,
                |a, b| math::safe_div_v(Vec3::splat(a), b)),
            Op::Addfc => bin!(vm, env, "addfc", T::Color, get_float, get_triple, set_triple,
                |a, b| Vec3::splat(a) + b),
            Op::Subfc => bin!(vm, env, "subfc", T::Color, get_float, get_triple, set_triple,
                |a, b| Vec3::splat(a) - b),
            Op::Mulfc => bin!(vm, env, "mulfc", T::Color, get_float, get_triple, set_triple,
                |a, b| a * b),
            Op::Divfc => bin!(vm, env, "divfc", T::Color, get_float, get_triple, set_triple,
                |a, b| math::safe_div_v(Vec3::splat(a), b)),
            // Matrix arithmetic on the operand stack is not supported; the
            // operands are consumed and a uniform zero float pushed.
            Op::Mulmm | Op::Divmm => {
                vm.fault("matrix arithmetic is unsupported in the VM");
                let mut fv = false;
                let a = vm.pop("mulmm", &mut fv)?;
                let b = vm.pop("mulmm", &mut fv)?;
                vm.stack.release(a);
                vm.stack.release(b);
                let res = vm
                    .stack
                    .next_temp(T::Float, StorageClass::Uniform, env.grid_size());
                res.borrow_mut().set_float(0, 0.0);
                vm.stack.push(res);
            }
            Op::Land => bin!(vm, env, "land", T::Float, get_bool, get_bool, set_float,
                |a, b| (a && b) as u32 as f32),
            Op::Lor => bin!(vm, env, "lor", T::Float, get_bool, get_bool, set_float,
                |a, b| (a || b) as u32 as f32),

            ////////////////////////////////////////////////////////////////////////////////////////
            // Math.
            Op::Radians => un!(vm, env, "radians", T::Float, get_float, set_float,
                |a| a.to_radians()),
            Op::Degrees => un!(vm, env, "degrees", T::Float, get_float, set_float,
                |a| a.to_degrees()),
            Op::Sin => un!(vm, env, "sin", T::Float, get_float, set_float, |a| a.sin()),
            Op::Cos => un!(vm, env, "cos", T::Float, get_float, set_float, |a| a.cos()),
            Op::Tan => un!(vm, env, "tan", T::Float, get_float, set_float, |a| a.tan()),
            Op::Asin => un!(vm, env, "asin", T::Float, get_float, set_float,
                |a| math::safe_asin(a)),
            Op::Acos => un!(vm, env, "acos", T::Float, get_float, set_float,
                |a| math::safe_acos(a)),
            Op::Atan => un!(vm, env, "atan", T::Float, get_float, set_float, |a| a.atan()),
            Op::Atan2 => bin!(vm, env, "atan2", T::Float, get_float, get_float, set_float,
                |a, b| a.atan2(b)),
            Op::Pow => bin!(vm, env, "pow", T::Float, get_float, get_float, set_float,
                |a, b| a.powf(b)),
            Op::Exp => un!(vm, env, "exp", T::Float, get_float, set_float, |a| a.exp()),
            Op::Sqrt => un!(vm, env, "sqrt", T::Float, get_float, set_float,
                |a| math::safe_sqrt(a)),
            Op::Inversesqrt => un!(vm, env, "inversesqrt", T::Float, get_float, set_float,
                |a| math::safe_inversesqrt(a)),
            Op::Log => un!(vm, env, "log", T::Float, get_float, set_float, |a| math::safe_log(a)),
            Op::Log2 => un!(vm, env, "log2", T::Float, get_float, set_float,
                |a| math::safe_log2(a)),
            Op::Mod => bin!(vm, env, "mod", T::Float, get_float, get_float, set_float,
                |a, b| math::mod_rm(a, b)),
            Op::Abs => un!(vm, env, "abs", T::Float, get_float, set_float, |a| a.abs()),
            Op::Sign => un!(vm, env, "sign", T::Float, get_float, set_float, |a| math::sign(a)),
            Op::Min => bin!(vm, env, "min", T::Float, get_float, get_float, set_float,
                |a, b| a.min(b)),
            Op::Max => bin!(vm, env, "max", T::Float, get_float, get_float, set_float,
                |a, b| a.max(b)),
            Op::Pmin | Op::Vmin | Op::Nmin => bin!(vm, env, "pmin", T::Point, get_triple,
                get_triple, set_triple, |a, b| a.min(b)),
            Op::Pmax | Op::Vmax | Op::Nmax => bin!(vm, env, "pmax", T::Point, get_triple,
                get_triple, set_triple, |a, b| a.max(b)),
            Op::Cmin => bin!(vm, env, "cmin", T::Color, get_triple, get_triple, set_triple,
                |a, b| a.min(b)),
            Op::Cmax => bin!(vm, env, "cmax", T::Color, get_triple, get_triple, set_triple,
                |a, b| a.max(b)),
            Op::Clamp => tern!(vm, env, "clamp", T::Float, get_float, get_float, get_float,
                set_float, |x, lo, hi| math::clamp(x, lo, hi)),
            Op::Pclamp => tern!(vm, env, "pclamp", T::Point, get_triple, get_triple, get_triple,
                set_triple, |x, lo, hi| x.max(lo).min(hi)),
            Op::Cclamp => tern!(vm, env, "cclamp", T::Color, get_triple, get_triple, get_triple,
                set_triple, |x, lo, hi| x.max(lo).min(hi)),
            Op::Floor => un!(vm, env, "floor", T::Float, get_float, set_float, |a| a.floor()),
            Op::Ceil => un!(vm, env, "ceil", T::Float, get_float, set_float, |a| a.ceil()),
            Op::Round => un!(vm, env, "round", T::Float, get_float, set_float, |a| a.round()),
            Op::Step => bin!(vm, env, "step", T::Float, get_float, get_float, set_float,
                |edge, x| math::step(edge, x)),
            Op::Smoothstep => tern!(vm, env, "smoothstep", T::Float, get_float, get_float,
                get_float, set_float, |e0, e1, x| math::smoothstep(e0, e1, x)),
            Op::Filterstep => vm.filterstep(env, false)?,
            Op::Filterstep2 => vm.filterstep(env, true)?,
            Op::Fmix => tern!(vm, env, "fmix", T::Float, get_float, get_float, get_float,
                set_float, |a, b, t| math::mix(a, b, t)),
            Op::Cmix => tern!(vm, env, "cmix", T::Color, get_triple, get_triple, get_float,
                set_triple, |a, b, t| math::mix_v(a, b, t)),
            Op::Pmix | Op::Vmix | Op::Nmix => tern!(vm, env, "pmix", T::Point, get_triple,
                get_triple, get_float, set_triple, |a, b, t| math::mix_v(a, b, t)),

            ////////////////////////////////////////////////////////////////////////////////////////
            // Components.
            Op::Xcomp => un!(vm, env, "xcomp", T::Float, get_triple, set_float, |a| a.x),
            Op::Ycomp => un!(vm, env, "ycomp", T::Float, get_triple, set_float, |a| a.y),
            Op::Zcomp => un!(vm, env, "zcomp", T::Float, get_triple, set_float, |a| a.z),
            Op::Setxcomp => vm.set_component(env, 0)?,
            Op::Setycomp => vm.set_component(env, 1)?,
            Op::Setzcomp => vm.set_component(env, 2)?,
            Op::Comp => bin!(vm, env, "comp", T::Float, get_triple, get_float, set_float,
                |p, i| p[(i as usize).min(2)]),
            Op::Setcomp => vm.setcomp(env)?,
            Op::Mcomp => tern!(vm, env, "mcomp", T::Float, get_matrix, get_float, get_float,
                set_float, |m, r, c| m.row((r as usize).min(3))[(c as usize).min(3)]),
            Op::Setmcomp => vm.setmcomp(env)?,

            ////////////////////////////////////////////////////////////////////////////////////////
            // Geometry.
            Op::Length => un!(vm, env, "length", T::Float, get_triple, set_float, |a| a.length()),
            Op::Distance => bin!(vm, env, "distance", T::Float, get_triple, get_triple, set_float,
                |a, b| (a - b).length()),
            Op::Normalize => un!(vm, env, "normalize", T::Point, get_triple, set_triple,
                |a| math::safe_normalize(a)),
            Op::Faceforward => {
                let ng = env.var(EnvVar::Ng);
                let mut fv = false;
                let en = vm.pop("faceforward", &mut fv)?;
                let ei = vm.pop("faceforward", &mut fv)?;
                let res = vm.stack.next_temp(T::Normal, res_class(fv), env.grid_size());
                {
                    let nv = en.data.borrow();
                    let iv = ei.data.borrow();
                    let gv = ng.borrow();
                    let mut rv = res.borrow_mut();
                    let n = if fv { env.grid_size() } else { 1 };
                    for i in 0..n {
                        if !fv || env.lane_active(i) {
                            rv.set_triple(
                                i,
                                math::faceforward(nv.get_triple(i), iv.get_triple(i), gv.get_triple(i)),
                            );
                        }
                    }
                }
                vm.stack.push(res);
                vm.stack.release(en);
                vm.stack.release(ei);
            }
            Op::Faceforward2 => tern!(vm, env, "faceforward2", T::Normal, get_triple, get_triple,
                get_triple, set_triple, |n, i, nref| math::faceforward(n, i, nref)),
            Op::Reflect => bin!(vm, env, "reflect", T::Vector, get_triple, get_triple, set_triple,
                |i, n| math::reflect(i, n)),
            Op::Refract => tern!(vm, env, "refract", T::Vector, get_triple, get_triple, get_float,
                set_triple, |i, n, eta| math::refract(i, n, eta)),
            Op::Fresnel => vm.fresnel(env, false)?,
            Op::Fresnel2 => vm.fresnel(env, true)?,
            Op::Ptlined => tern!(vm, env, "ptlined", T::Float, get_triple, get_triple, get_triple,
                set_float, |p0, p1, q| math::pt_lined(p0, p1, q)),
            Op::Rotate => vm.rotate(env)?,
            Op::Depth => {
                let (near, far) = services.clipping();
                un!(vm, env, "depth", T::Float, get_triple, set_float,
                    |p| (p.z - near) / (far - near).max(f32::EPSILON))
            }
            Op::Area => vm.area(env)?,
            Op::Calculatenormal => vm.calculatenormal(env)?,

            ////////////////////////////////////////////////////////////////////////////////////////
            // Derivatives.
            Op::FDu => vm.deriv_float(env, DerivAxis::U)?,
            Op::FDv => vm.deriv_float(env, DerivAxis::V)?,
            Op::FDeriv => vm.deriv_ratio(env, false)?,
            Op::CDu => vm.deriv_triple(env, DerivAxis::U, T::Color)?,
            Op::CDv => vm.deriv_triple(env, DerivAxis::V, T::Color)?,
            Op::CDeriv => vm.deriv_ratio(env, true)?,
            Op::PDu => vm.deriv_triple(env, DerivAxis::U, T::Point)?,
            Op::PDv => vm.deriv_triple(env, DerivAxis::V, T::Point)?,
            Op::PDeriv => vm.deriv_ratio(env, true)?,

            ////////////////////////////////////////////////////////////////////////////////////////
            // Random and noise.
            Op::Frandom => {
                let res = vm
                    .stack
                    .next_temp(T::Float, StorageClass::Varying, env.grid_size());
                {
                    let mut rv = res.borrow_mut();
                    for i in 0..env.grid_size() {
                        if env.lane_active(i) {
                            let r: f32 = vm.rng.gen();
                            rv.set_float(i, r);
                        }
                    }
                }
                vm.stack.push(res);
            }
            Op::Crandom | Op::Prandom => {
                let ty = if op == Op::Crandom { T::Color } else { T::Point };
                let res = vm.stack.next_temp(ty, StorageClass::Varying, env.grid_size());
                {
                    let mut rv = res.borrow_mut();
                    for i in 0..env.grid_size() {
                        if env.lane_active(i) {
                            let v = Vec3::new(vm.rng.gen(), vm.rng.gen(), vm.rng.gen());
                            rv.set_triple(i, v);
                        }
                    }
                }
                vm.stack.push(res);
            }
            Op::Noise1 => un!(vm, env, "noise1", T::Float, get_float, set_float,
                |a| noise::noise1(a)),
            Op::Noise2 => bin!(vm, env, "noise2", T::Float, get_float, get_float, set_float,
                |a, b| noise::noise2(a, b)),
            Op::Noise3 => un!(vm, env, "noise3", T::Float, get_triple, set_float,
                |a| noise::noise3(a)),
            Op::Noise4 => bin!(vm, env, "noise4", T::Float, get_triple, get_float, set_float,
                |a, b| noise::noise4(a, b)),
            Op::Cnoise1 => un!(vm, env, "cnoise1", T::Color, get_float, set_triple,
                |a| noise::vnoise1(a)),
            Op::Cnoise2 => bin!(vm, env, "cnoise2", T::Color, get_float, get_float, set_triple,
                |a, b| noise::vnoise2(a, b)),
            Op::Cnoise3 => un!(vm, env, "cnoise3", T::Color, get_triple, set_triple,
                |a| noise::vnoise3(a)),
            Op::Cnoise4 => bin!(vm, env, "cnoise4", T::Color, get_triple, get_float, set_triple,
                |a, b| noise::vnoise4(a, b)),
            Op::Pnoise1 => un!(vm, env, "pnoise1", T::Point, get_float, set_triple,
                |a| noise::vnoise1(a)),
            Op::Pnoise2 => bin!(vm, env, "pnoise2", T::Point, get_float, get_float, set_triple,
                |a, b| noise::vnoise2(a, b)),
            Op::Pnoise3 => un!(vm, env, "pnoise3", T::Point, get_triple, set_triple,
                |a| noise::vnoise3(a)),
            Op::Pnoise4 => bin!(vm, env, "pnoise4", T::Point, get_triple, get_float, set_triple,
                |a, b| noise::vnoise4(a, b)),
            Op::Fcellnoise1 => un!(vm, env, "fcellnoise1", T::Float, get_float, set_float,
                |a| noise::cellnoise1(a)),
            Op::Fcellnoise2 => bin!(vm, env, "fcellnoise2", T::Float, get_float, get_float,
                set_float, |a, b| noise::cellnoise2(a, b)),
            Op::Fcellnoise3 => un!(vm, env, "fcellnoise3", T::Float, get_triple, set_float,
                |a| noise::cellnoise3(a)),
            Op::Fcellnoise4 => bin!(vm, env, "fcellnoise4", T::Float, get_triple, get_float,
                set_float, |a, b| noise::cellnoise4(a, b)),
            Op::Ccellnoise1 | Op::Pcellnoise1 => un!(vm, env, "ccellnoise1",
                if op == Op::Ccellnoise1 { T::Color } else { T::Point }, get_float, set_triple,
                |a| noise::vcellnoise3(Vec3::new(a, 0.0, 0.0))),
            Op::Ccellnoise2 | Op::Pcellnoise2 => bin!(vm, env, "ccellnoise2",
                if op == Op::Ccellnoise2 { T::Color } else { T::Point }, get_float, get_float,
                set_triple, |a, b| noise::vcellnoise3(Vec3::new(a, b, 0.0))),
            Op::Ccellnoise3 | Op::Pcellnoise3 => un!(vm, env, "ccellnoise3",
                if op == Op::Ccellnoise3 { T::Color } else { T::Point }, get_triple, set_triple,
                |a| noise::vcellnoise3(a)),
            Op::Ccellnoise4 | Op::Pcellnoise4 => bin!(vm, env, "ccellnoise4",
                if op == Op::Ccellnoise4 { T::Color } else { T::Point }, get_triple, get_float,
                set_triple, |a, b| noise::vcellnoise3(a + Vec3::splat(b.floor()))),
            Op::Fpnoise1 => bin!(vm, env, "fpnoise1", T::Float, get_float, get_float, set_float,
                |a, p| noise::pnoise1(a, p)),
            Op::Fpnoise2 => vm.pnoise2_f(env)?,
            Op::Fpnoise3 => bin!(vm, env, "fpnoise3", T::Float, get_triple, get_triple, set_float,
                |a, p| noise::pnoise3(a, p)),
            Op::Fpnoise4 => vm.pnoise4_f(env)?,
            Op::Cpnoise1 | Op::Ppnoise1 => bin!(vm, env, "cpnoise1",
                if op == Op::Cpnoise1 { T::Color } else { T::Point }, get_float, get_float,
                set_triple, |a, p| Vec3::new(
                    noise::pnoise1(a, p),
                    noise::pnoise1(a + 7.13, p),
                    noise::pnoise1(a + 13.55, p)
                )),
            Op::Cpnoise2 | Op::Ppnoise2 => vm.pnoise2_v(env, op == Op::Cpnoise2)?,
            Op::Cpnoise3 | Op::Ppnoise3 => bin!(vm, env, "cpnoise3",
                if op == Op::Cpnoise3 { T::Color } else { T::Point }, get_triple, get_triple,
                set_triple, |a, p| Vec3::new(
                    noise::pnoise3(a, p),
                    noise::pnoise3(a + Vec3::splat(7.13), p),
                    noise::pnoise3(a + Vec3::splat(13.55), p)
                )),
            Op::Cpnoise4 | Op::Ppnoise4 => vm.pnoise4_v(env, op == Op::Cpnoise4)?,

            ////////////////////////////////////////////////////////////////////////////////////////
            Op::Fspline | Op::Cspline | Op::Pspline => vm.spline_op(env, op, false, false)?,
            Op::Sfspline | Op::Scspline | Op::Spspline => vm.spline_op(env, op, true, false)?,
            Op::Fsplinea | Op::Csplinea | Op::Psplinea => vm.spline_op(env, op, false, true)?,
            Op::Sfsplinea | Op::Scsplinea | Op::Spsplinea => vm.spline_op(env, op, true, true)?,

            ////////////////////////////////////////////////////////////////////////////////////////
            Op::Transform => vm.space_transform(env, services, TransformKind::Point, false)?,
            Op::Transform2 => vm.space_transform(env, services, TransformKind::Point, true)?,
            Op::Transformm => vm.matrix_transform(env, TransformKind::Point)?,
            Op::Vtransform => vm.space_transform(env, services, TransformKind::Vector, false)?,
            Op::Vtransform2 => vm.space_transform(env, services, TransformKind::Vector, true)?,
            Op::Vtransformm => vm.matrix_transform(env, TransformKind::Vector)?,
            Op::Ntransform => vm.space_transform(env, services, TransformKind::Normal, false)?,
            Op::Ntransform2 => vm.space_transform(env, services, TransformKind::Normal, true)?,
            Op::Ntransformm => vm.matrix_transform(env, TransformKind::Normal)?,
            Op::Mtransform => vm.space_transform(env, services, TransformKind::Matrix, false)?,
            Op::Mtransform2 => vm.space_transform(env, services, TransformKind::Matrix, true)?,
            Op::Ctransform => vm.color_transform(env, false)?,
            Op::Ctransform2 => vm.color_transform(env, true)?,

            Op::Determinant => un!(vm, env, "determinant", T::Float, get_matrix, set_float,
                |m| m.determinant()),
            Op::Mtranslate => bin!(vm, env, "mtranslate", T::Matrix, get_matrix, get_triple,
                set_matrix, |m, t| m * Mat4::from_translation(t)),
            Op::Mrotate => tern!(vm, env, "mrotate", T::Matrix, get_matrix, get_float, get_triple,
                set_matrix, |m, angle, axis| m
                    * Mat4::from_axis_angle(math::safe_normalize(axis), angle)),
            Op::Mscale => bin!(vm, env, "mscale", T::Matrix, get_matrix, get_triple, set_matrix,
                |m, s| m * Mat4::from_scale(s)),

            ////////////////////////////////////////////////////////////////////////////////////////
            Op::Ambient => vm.ambient(env, services)?,
            Op::Diffuse => vm.diffuse(env, services)?,
            Op::Specular => vm.specular(env, services)?,
            Op::Phong => vm.phong(env, services)?,
            Op::Specularbrdf => vm.specularbrdf(env)?,
            Op::Trace => {
                vm.fault("trace() is unsupported; returning black");
                let mut fv = false;
                let a = vm.pop("trace", &mut fv)?;
                let b = vm.pop("trace", &mut fv)?;
                let res = vm.stack.next_temp(T::Color, res_class(fv), env.grid_size());
                zero_triple(&res, env, fv);
                vm.stack.push(res);
                vm.stack.release(a);
                vm.stack.release(b);
            }
            Op::Illuminate => vm.illuminate(env, false)?,
            Op::Illuminate2 => vm.illuminate(env, true)?,
            // Bare solar(): light arrives from every direction; L stays as
            // the caller initialized it.
            Op::Solar => {}
            Op::Solar2 => vm.solar(env)?,
            Op::InitIlluminance => {
                let found = env.init_illuminance(services);
                vm.push_uniform_float(env, found as u32 as f32);
            }
            Op::InitIlluminance2 => {
                let mut fv = false;
                let category = vm.pop("init_illuminance", &mut fv)?;
                vm.stack.release(category);
                let found = env.init_illuminance(services);
                vm.push_uniform_float(env, found as u32 as f32);
            }
            Op::AdvanceIlluminance => {
                let found = env.advance_illuminance(services);
                vm.push_uniform_float(env, found as u32 as f32);
            }

            ////////////////////////////////////////////////////////////////////////////////////////
            Op::Ftexture1 | Op::Ftexture2 | Op::Ftexture3 => vm.texture(env, services, op, false)?,
            Op::Ctexture1 | Op::Ctexture2 | Op::Ctexture3 => vm.texture(env, services, op, true)?,
            Op::Fenvironment2 | Op::Fenvironment3 => vm.environment(env, services, op, false)?,
            Op::Cenvironment2 | Op::Cenvironment3 => vm.environment(env, services, op, true)?,
            Op::Bump1 | Op::Bump2 | Op::Bump3 => vm.bump(env, services, op)?,
            Op::Shadow | Op::Shadow1 => vm.shadow(env, services, op)?,
            Op::Occlusion => vm.occlusion(env)?,
            Op::Textureinfo => vm.state_query(env, QueryKind::TextureInfo, services)?,

            ////////////////////////////////////////////////////////////////////////////////////////
            Op::Attribute => vm.state_query(env, QueryKind::Attribute, services)?,
            Op::Option => vm.state_query(env, QueryKind::Option, services)?,
            Op::Rendererinfo => vm.state_query(env, QueryKind::RendererInfo, services)?,
            Op::Lightsource => vm.state_query(env, QueryKind::LightSource, services)?,
            Op::Surface | Op::Atmosphere | Op::Displacement => {
                vm.state_query(env, QueryKind::ShaderParam, services)?
            }
            Op::Incident | Op::Opposite => {
                // Volume queries; no interior volumes here.
                vm.state_query(env, QueryKind::Unknown, services)?
            }
            Op::Shadername => {
                let name = vm.program.name.clone();
                let res = vm
                    .stack
                    .next_temp(T::String, StorageClass::Uniform, env.grid_size());
                res.borrow_mut().set_str(0, name);
                vm.stack.push(res);
            }
            Op::Shadername2 => {
                let mut fv = false;
                let which = vm.pop("shadername", &mut fv)?;
                vm.stack.release(which);
                let res = vm
                    .stack
                    .next_temp(T::String, StorageClass::Uniform, env.grid_size());
                res.borrow_mut().set_str(0, SmolStr::default());
                vm.stack.push(res);
            }

            ////////////////////////////////////////////////////////////////////////////////////////
            Op::Concat => vm.concat(env)?,
            Op::Format => vm.format(env, false)?,
            Op::Printf => vm.format(env, true)?,
            Op::Match => bin!(vm, env, "match", T::Float, get_str, get_str, set_float,
                |pat, subj| strings::match_pattern(&pat, &subj)),

            Op::BakeF | Op::Bake3c | Op::Bake3p | Op::Bake3v | Op::Bake3n => {
                vm.bake(env, services, op == Op::BakeF)?
            }
        }
        Ok(())
    }
}

fn self_push_var(stack: &mut Stack, v: ValueRef) {
    stack.push_var(v);
}

fn vm_fault_index(rv: &mut Value, lane: usize) {
    match rv.ty() {
        ValueType::Float => rv.set_float(lane, 0.0),
        ValueType::Matrix => rv.set_matrix(lane, Mat4::IDENTITY),
        ValueType::String => rv.set_str(lane, SmolStr::default()),
        _ => rv.set_triple(lane, Vec3::ZERO),
    }
}

fn zero_triple(res: &ValueRef, env: &ShaderExecEnv, fv: bool) {
    let mut rv = res.borrow_mut();
    let n = if fv { env.grid_size() } else { 1 };
    for i in 0..n {
        rv.set_triple(i, Vec3::ZERO);
    }
}

#[derive(Copy, Clone, PartialEq)]
enum DerivAxis {
    U,
    V,
}

#[derive(Copy, Clone, PartialEq)]
enum TransformKind {
    Point,
    Vector,
    Normal,
    Matrix,
}

#[derive(Copy, Clone, PartialEq)]
enum QueryKind {
    Attribute,
    Option,
    RendererInfo,
    LightSource,
    ShaderParam,
    TextureInfo,
    Unknown,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Multi-operand and stateful opcodes.

impl ShaderVm {
    fn push_uniform_float(&mut self, env: &ShaderExecEnv, f: f32) {
        let res = self
            .stack
            .next_temp(ValueType::Float, StorageClass::Uniform, env.grid_size());
        res.borrow_mut().set_float(0, f);
        self.stack.push(res);
    }

    /// `merge*`: per-lane select between the two sides of a conditional.
    /// Writes every lane; both sides have already produced their values.
    fn merge(&mut self, env: &ShaderExecEnv, ty: ValueType) -> Result<()> {
        let mut fv = false;
        let cond = self.pop("merge", &mut fv)?;
        let on_false = self.pop("merge", &mut fv)?;
        let on_true = self.pop("merge", &mut fv)?;
        let res = self
            .stack
            .next_temp(ty, StorageClass::Varying, env.grid_size());
        {
            let cv = cond.data.borrow();
            let fvv = on_false.data.borrow();
            let tv = on_true.data.borrow();
            let mut rv = res.borrow_mut();
            for i in 0..env.grid_size() {
                let src = if cv.get_bool(i) { &*tv } else { &*fvv };
                rv.set_from(src, i);
            }
        }
        self.stack.push(res);
        self.stack.release(cond);
        self.stack.release(on_false);
        self.stack.release(on_true);
        Ok(())
    }

    /// Builds a matrix from sixteen stacked floats; the first value pushed
    /// is the first element in row-major order.
    fn setwm(&mut self, env: &ShaderExecEnv) -> Result<()> {
        let mut fv = false;
        let mut popped = Vec::with_capacity(16);
        for _ in 0..16 {
            popped.push(self.pop("setwm", &mut fv)?);
        }
        let res = self
            .stack
            .next_temp(ValueType::Matrix, res_class(fv), env.grid_size());
        {
            let mut rv = res.borrow_mut();
            let n = if fv { env.grid_size() } else { 1 };
            for i in 0..n {
                if !fv || env.lane_active(i) {
                    let mut row_major = [0.0f32; 16];
                    for (k, slot) in row_major.iter_mut().enumerate() {
                        *slot = popped[15 - k].data.borrow().get_float(i);
                    }
                    rv.set_matrix(i, Mat4::from_cols_array(&row_major).transpose());
                }
            }
        }
        self.stack.push(res);
        for e in popped {
            self.stack.release(e);
        }
        Ok(())
    }

    /// `filterstep`: an edge antialiased over a filter width taken from the
    /// grid derivatives of the sample coordinate (or the explicit interval).
    fn filterstep(&mut self, env: &mut ShaderExecEnv, two_samples: bool) -> Result<()> {
        let mut fv = false;
        let count = self.pop("filterstep", &mut fv)?;
        let extra = count.data.borrow().get_float(0) as usize;
        self.stack.release(count);
        let edge = self.pop("filterstep", &mut fv)?;
        let s1 = self.pop("filterstep", &mut fv)?;
        let s2 = if two_samples {
            Some(self.pop("filterstep", &mut fv)?)
        } else {
            None
        };
        for _ in 0..extra {
            let e = self.pop("filterstep", &mut fv)?;
            self.stack.release(e);
        }
        let n = env.grid_size();
        let res = self
            .stack
            .next_temp(ValueType::Float, StorageClass::Varying, n);
        {
            let ev = edge.data.borrow();
            let sv = s1.data.borrow();
            let mut rv = res.borrow_mut();
            match &s2 {
                Some(s2e) => {
                    let s2v = s2e.data.borrow();
                    for i in 0..n {
                        if env.lane_active(i) {
                            let lo = sv.get_float(i);
                            let hi = s2v.get_float(i);
                            let e = ev.get_float(i);
                            let w = (hi - lo).abs().max(f32::EPSILON);
                            rv.set_float(i, math::clamp((hi - e) / w, 0.0, 1.0));
                        }
                    }
                }
                None => {
                    let mut dus = vec![0.0f32; n];
                    let mut dvs = vec![0.0f32; n];
                    env.du_float(&sv, &mut dus);
                    env.dv_float(&sv, &mut dvs);
                    let du = env.var(EnvVar::du);
                    let dv = env.var(EnvVar::dv);
                    let duv = du.borrow();
                    let dvv = dv.borrow();
                    for i in 0..n {
                        if env.lane_active(i) {
                            let w = (dus[i] * duv.get_float(i)).abs()
                                + (dvs[i] * dvv.get_float(i)).abs();
                            let e = ev.get_float(i);
                            let s = sv.get_float(i);
                            rv.set_float(i, math::smoothstep(e - 0.5 * w, e + 0.5 * w, s));
                        }
                    }
                }
            }
        }
        self.stack.push(res);
        self.stack.release(edge);
        self.stack.release(s1);
        if let Some(e) = s2 {
            self.stack.release(e);
        }
        Ok(())
    }

    /// `setxcomp`/`setycomp`/`setzcomp`: writes one component of the popped
    /// triple reference in place.
    fn set_component(&mut self, env: &ShaderExecEnv, comp: usize) -> Result<()> {
        let mut fv = false;
        let dest = self.pop("setcomp", &mut fv)?;
        let val = self.pop("setcomp", &mut fv)?;
        {
            let vv = val.data.borrow();
            let mut dv = dest.data.borrow_mut();
            let n = dv.size().max(vv.size());
            let varying = n > 1;
            for i in 0..n {
                if !varying || env.lane_active(i) {
                    dv.set_comp(i, comp, vv.get_float(i));
                }
            }
        }
        self.stack.release(dest);
        self.stack.release(val);
        Ok(())
    }

    fn setcomp(&mut self, env: &ShaderExecEnv) -> Result<()> {
        let mut fv = false;
        let dest = self.pop("setcomp", &mut fv)?;
        let idx = self.pop("setcomp", &mut fv)?;
        let val = self.pop("setcomp", &mut fv)?;
        {
            let iv = idx.data.borrow();
            let vv = val.data.borrow();
            let mut dv = dest.data.borrow_mut();
            let n = dv.size().max(vv.size());
            let varying = n > 1;
            for i in 0..n {
                if !varying || env.lane_active(i) {
                    let c = (iv.get_float(i) as usize).min(2);
                    dv.set_comp(i, c, vv.get_float(i));
                }
            }
        }
        self.stack.release(dest);
        self.stack.release(idx);
        self.stack.release(val);
        Ok(())
    }

    fn setmcomp(&mut self, env: &ShaderExecEnv) -> Result<()> {
        let mut fv = false;
        let dest = self.pop("setmcomp", &mut fv)?;
        let row = self.pop("setmcomp", &mut fv)?;
        let col = self.pop("setmcomp", &mut fv)?;
        let val = self.pop("setmcomp", &mut fv)?;
        {
            let rv = row.data.borrow();
            let cv = col.data.borrow();
            let vv = val.data.borrow();
            let mut dv = dest.data.borrow_mut();
            let n = dv.size().max(vv.size());
            let varying = n > 1;
            for i in 0..n {
                if !varying || env.lane_active(i) {
                    let r = (rv.get_float(i) as usize).min(3);
                    let c = (cv.get_float(i) as usize).min(3);
                    dv.set_mcomp(i, r, c, vv.get_float(i));
                }
            }
        }
        self.stack.release(dest);
        self.stack.release(row);
        self.stack.release(col);
        self.stack.release(val);
        Ok(())
    }

    /// `fresnel(I, N, eta, Kr, Kt[, R, T])`: writes into the popped output
    /// references.
    fn fresnel(&mut self, env: &ShaderExecEnv, with_vectors: bool) -> Result<()> {
        let mut fv = false;
        let ei = self.pop("fresnel", &mut fv)?;
        let en = self.pop("fresnel", &mut fv)?;
        let eeta = self.pop("fresnel", &mut fv)?;
        let ekr = self.pop("fresnel", &mut fv)?;
        let ekt = self.pop("fresnel", &mut fv)?;
        let vec_outs = if with_vectors {
            let er = self.pop("fresnel", &mut fv)?;
            let et = self.pop("fresnel", &mut fv)?;
            Some((er, et))
        } else {
            None
        };
        {
            let iv = ei.data.borrow();
            let nv = en.data.borrow();
            let ev = eeta.data.borrow();
            let mut krv = ekr.data.borrow_mut();
            let mut ktv = ekt.data.borrow_mut();
            let n = env.grid_size();
            let varying = fv;
            let count = if varying { n } else { 1 };
            for i in 0..count {
                if !varying || env.lane_active(i) {
                    let (kr, kt) = math::fresnel(iv.get_triple(i), nv.get_triple(i), ev.get_float(i));
                    krv.set_float(i, kr);
                    ktv.set_float(i, kt);
                    if let Some((er, et)) = &vec_outs {
                        er.data
                            .borrow_mut()
                            .set_triple(i, math::reflect(iv.get_triple(i), nv.get_triple(i)));
                        et.data.borrow_mut().set_triple(
                            i,
                            math::refract(iv.get_triple(i), nv.get_triple(i), ev.get_float(i)),
                        );
                    }
                }
            }
        }
        self.stack.release(ei);
        self.stack.release(en);
        self.stack.release(eeta);
        self.stack.release(ekr);
        self.stack.release(ekt);
        if let Some((er, et)) = vec_outs {
            self.stack.release(er);
            self.stack.release(et);
        }
        Ok(())
    }

    /// `rotate(Q, angle, P1, P2)`.
    fn rotate(&mut self, env: &ShaderExecEnv) -> Result<()> {
        let mut fv = false;
        let eq = self.pop("rotate", &mut fv)?;
        let ea = self.pop("rotate", &mut fv)?;
        let e1 = self.pop("rotate", &mut fv)?;
        let e2 = self.pop("rotate", &mut fv)?;
        let res = self
            .stack
            .next_temp(ValueType::Point, res_class(fv), env.grid_size());
        {
            let qv = eq.data.borrow();
            let av = ea.data.borrow();
            let p1 = e1.data.borrow();
            let p2 = e2.data.borrow();
            let mut rv = res.borrow_mut();
            let n = if fv { env.grid_size() } else { 1 };
            for i in 0..n {
                if !fv || env.lane_active(i) {
                    rv.set_triple(
                        i,
                        math::rotate_about(
                            qv.get_triple(i),
                            av.get_float(i),
                            p1.get_triple(i),
                            p2.get_triple(i),
                        ),
                    );
                }
            }
        }
        self.stack.push(res);
        self.stack.release(eq);
        self.stack.release(ea);
        self.stack.release(e1);
        self.stack.release(e2);
        Ok(())
    }

    /// `area(P)`: micropolygon area from the parametric derivatives.
    fn area(&mut self, env: &mut ShaderExecEnv) -> Result<()> {
        let mut fv = false;
        let ep = self.pop("area", &mut fv)?;
        let n = env.grid_size();
        let mut ddu = vec![Vec3::ZERO; n];
        let mut ddv = vec![Vec3::ZERO; n];
        {
            let pv = ep.data.borrow();
            env.du_triple(&pv, &mut ddu);
            env.dv_triple(&pv, &mut ddv);
        }
        let res = self
            .stack
            .next_temp(ValueType::Float, StorageClass::Varying, n);
        {
            let du = env.var(EnvVar::du);
            let dv = env.var(EnvVar::dv);
            let duv = du.borrow();
            let dvv = dv.borrow();
            let mut rv = res.borrow_mut();
            for i in 0..n {
                if env.lane_active(i) {
                    let a = ddu[i] * duv.get_float(i);
                    let b = ddv[i] * dvv.get_float(i);
                    rv.set_float(i, a.cross(b).length());
                }
            }
        }
        self.stack.push(res);
        self.stack.release(ep);
        Ok(())
    }

    fn calculatenormal(&mut self, env: &mut ShaderExecEnv) -> Result<()> {
        let mut fv = false;
        let ep = self.pop("calculatenormal", &mut fv)?;
        let n = env.grid_size();
        let mut ddu = vec![Vec3::ZERO; n];
        let mut ddv = vec![Vec3::ZERO; n];
        {
            let pv = ep.data.borrow();
            env.du_triple(&pv, &mut ddu);
            env.dv_triple(&pv, &mut ddv);
        }
        let res = self
            .stack
            .next_temp(ValueType::Normal, StorageClass::Varying, n);
        {
            let mut rv = res.borrow_mut();
            for i in 0..n {
                if env.lane_active(i) {
                    rv.set_triple(i, ddu[i].cross(ddv[i]));
                }
            }
        }
        self.stack.push(res);
        self.stack.release(ep);
        Ok(())
    }

    fn deriv_float(&mut self, env: &mut ShaderExecEnv, axis: DerivAxis) -> Result<()> {
        let mut fv = false;
        let ev = self.pop("Du", &mut fv)?;
        let n = env.grid_size();
        let mut out = vec![0.0f32; n];
        {
            let vv = ev.data.borrow();
            match axis {
                DerivAxis::U => env.du_float(&vv, &mut out),
                DerivAxis::V => env.dv_float(&vv, &mut out),
            }
        }
        let res = self
            .stack
            .next_temp(ValueType::Float, StorageClass::Varying, n);
        {
            let mut rv = res.borrow_mut();
            for i in 0..n {
                if env.lane_active(i) {
                    rv.set_float(i, out[i]);
                }
            }
        }
        self.stack.push(res);
        self.stack.release(ev);
        Ok(())
    }

    fn deriv_triple(
        &mut self,
        env: &mut ShaderExecEnv,
        axis: DerivAxis,
        ty: ValueType,
    ) -> Result<()> {
        let mut fv = false;
        let ev = self.pop("Du", &mut fv)?;
        let n = env.grid_size();
        let mut out = vec![Vec3::ZERO; n];
        {
            let vv = ev.data.borrow();
            match axis {
                DerivAxis::U => env.du_triple(&vv, &mut out),
                DerivAxis::V => env.dv_triple(&vv, &mut out),
            }
        }
        let res = self.stack.next_temp(ty, StorageClass::Varying, n);
        {
            let mut rv = res.borrow_mut();
            for i in 0..n {
                if env.lane_active(i) {
                    rv.set_triple(i, out[i]);
                }
            }
        }
        self.stack.push(res);
        self.stack.release(ev);
        Ok(())
    }

    /// `Deriv(num, den)` = Du(num)/Du(den) + Dv(num)/Dv(den).
    fn deriv_ratio(&mut self, env: &mut ShaderExecEnv, triple: bool) -> Result<()> {
        let mut fv = false;
        let enum_ = self.pop("Deriv", &mut fv)?;
        let eden = self.pop("Deriv", &mut fv)?;
        let n = env.grid_size();
        let mut den_du = vec![0.0f32; n];
        let mut den_dv = vec![0.0f32; n];
        {
            let dv_ = eden.data.borrow();
            env.du_float(&dv_, &mut den_du);
            env.dv_float(&dv_, &mut den_dv);
        }
        if triple {
            let mut num_du = vec![Vec3::ZERO; n];
            let mut num_dv = vec![Vec3::ZERO; n];
            {
                let nv = enum_.data.borrow();
                env.du_triple(&nv, &mut num_du);
                env.dv_triple(&nv, &mut num_dv);
            }
            let res = self
                .stack
                .next_temp(ValueType::Point, StorageClass::Varying, n);
            {
                let mut rv = res.borrow_mut();
                for i in 0..n {
                    if env.lane_active(i) {
                        let du = if den_du[i].abs() > f32::EPSILON {
                            num_du[i] / den_du[i]
                        } else {
                            Vec3::ZERO
                        };
                        let dv = if den_dv[i].abs() > f32::EPSILON {
                            num_dv[i] / den_dv[i]
                        } else {
                            Vec3::ZERO
                        };
                        rv.set_triple(i, du + dv);
                    }
                }
            }
            self.stack.push(res);
        } else {
            let mut num_du = vec![0.0f32; n];
            let mut num_dv = vec![0.0f32; n];
            {
                let nv = enum_.data.borrow();
                env.du_float(&nv, &mut num_du);
                env.dv_float(&nv, &mut num_dv);
            }
            let res = self
                .stack
                .next_temp(ValueType::Float, StorageClass::Varying, n);
            {
                let mut rv = res.borrow_mut();
                for i in 0..n {
                    if env.lane_active(i) {
                        rv.set_float(
                            i,
                            math::safe_div(num_du[i], den_du[i])
                                + math::safe_div(num_dv[i], den_dv[i]),
                        );
                    }
                }
            }
            self.stack.push(res);
        }
        self.stack.release(enum_);
        self.stack.release(eden);
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Periodic noise with two period operands, splines, transforms.

impl ShaderVm {
    fn pnoise2_f(&mut self, env: &ShaderExecEnv) -> Result<()> {
        let mut fv = false;
        let ex = self.pop("pnoise", &mut fv)?;
        let ey = self.pop("pnoise", &mut fv)?;
        let epx = self.pop("pnoise", &mut fv)?;
        let epy = self.pop("pnoise", &mut fv)?;
        let res = self
            .stack
            .next_temp(ValueType::Float, res_class(fv), env.grid_size());
        {
            let xv = ex.data.borrow();
            let yv = ey.data.borrow();
            let pxv = epx.data.borrow();
            let pyv = epy.data.borrow();
            let mut rv = res.borrow_mut();
            let n = if fv { env.grid_size() } else { 1 };
            for i in 0..n {
                if !fv || env.lane_active(i) {
                    rv.set_float(
                        i,
                        noise::pnoise2(
                            xv.get_float(i),
                            yv.get_float(i),
                            pxv.get_float(i),
                            pyv.get_float(i),
                        ),
                    );
                }
            }
        }
        self.stack.push(res);
        for e in [ex, ey, epx, epy] {
            self.stack.release(e);
        }
        Ok(())
    }

    fn pnoise4_f(&mut self, env: &ShaderExecEnv) -> Result<()> {
        let mut fv = false;
        let ep = self.pop("pnoise", &mut fv)?;
        let et = self.pop("pnoise", &mut fv)?;
        let epp = self.pop("pnoise", &mut fv)?;
        let ept = self.pop("pnoise", &mut fv)?;
        let res = self
            .stack
            .next_temp(ValueType::Float, res_class(fv), env.grid_size());
        {
            let pv = ep.data.borrow();
            let tv = et.data.borrow();
            let ppv = epp.data.borrow();
            let ptv = ept.data.borrow();
            let mut rv = res.borrow_mut();
            let n = if fv { env.grid_size() } else { 1 };
            for i in 0..n {
                if !fv || env.lane_active(i) {
                    rv.set_float(
                        i,
                        noise::pnoise4(
                            pv.get_triple(i),
                            tv.get_float(i),
                            ppv.get_triple(i),
                            ptv.get_float(i),
                        ),
                    );
                }
            }
        }
        self.stack.push(res);
        for e in [ep, et, epp, ept] {
            self.stack.release(e);
        }
        Ok(())
    }

    fn pnoise2_v(&mut self, env: &ShaderExecEnv, color: bool) -> Result<()> {
        let ty = if color { ValueType::Color } else { ValueType::Point };
        let mut fv = false;
        let ex = self.pop("pnoise", &mut fv)?;
        let ey = self.pop("pnoise", &mut fv)?;
        let epx = self.pop("pnoise", &mut fv)?;
        let epy = self.pop("pnoise", &mut fv)?;
        let res = self.stack.next_temp(ty, res_class(fv), env.grid_size());
        {
            let xv = ex.data.borrow();
            let yv = ey.data.borrow();
            let pxv = epx.data.borrow();
            let pyv = epy.data.borrow();
            let mut rv = res.borrow_mut();
            let n = if fv { env.grid_size() } else { 1 };
            for i in 0..n {
                if !fv || env.lane_active(i) {
                    let (x, y) = (xv.get_float(i), yv.get_float(i));
                    let (px, py) = (pxv.get_float(i), pyv.get_float(i));
                    rv.set_triple(
                        i,
                        Vec3::new(
                            noise::pnoise2(x, y, px, py),
                            noise::pnoise2(x + 7.13, y + 3.1, px, py),
                            noise::pnoise2(x + 13.55, y + 5.2, px, py),
                        ),
                    );
                }
            }
        }
        self.stack.push(res);
        for e in [ex, ey, epx, epy] {
            self.stack.release(e);
        }
        Ok(())
    }

    fn pnoise4_v(&mut self, env: &ShaderExecEnv, color: bool) -> Result<()> {
        let ty = if color { ValueType::Color } else { ValueType::Point };
        let mut fv = false;
        let ep = self.pop("pnoise", &mut fv)?;
        let et = self.pop("pnoise", &mut fv)?;
        let epp = self.pop("pnoise", &mut fv)?;
        let ept = self.pop("pnoise", &mut fv)?;
        let res = self.stack.next_temp(ty, res_class(fv), env.grid_size());
        {
            let pv = ep.data.borrow();
            let tv = et.data.borrow();
            let ppv = epp.data.borrow();
            let ptv = ept.data.borrow();
            let mut rv = res.borrow_mut();
            let n = if fv { env.grid_size() } else { 1 };
            for i in 0..n {
                if !fv || env.lane_active(i) {
                    let p = pv.get_triple(i);
                    let t = tv.get_float(i);
                    let pp = ppv.get_triple(i);
                    let pt = ptv.get_float(i);
                    rv.set_triple(
                        i,
                        Vec3::new(
                            noise::pnoise4(p, t, pp, pt),
                            noise::pnoise4(p + Vec3::splat(7.13), t, pp, pt),
                            noise::pnoise4(p + Vec3::splat(13.55), t, pp, pt),
                        ),
                    );
                }
            }
        }
        self.stack.push(res);
        for e in [ep, et, epp, ept] {
            self.stack.release(e);
        }
        Ok(())
    }

    /// All twelve spline opcodes. Operand order: `[count] [basis] value
    /// knots...` for the list forms, `[basis] value array` for the array
    /// forms. Catmull-Rom unless a basis name selects otherwise.
    fn spline_op(
        &mut self,
        env: &ShaderExecEnv,
        op: Op,
        string_basis: bool,
        array_form: bool,
    ) -> Result<()> {
        let triple = !matches!(
            op,
            Op::Fspline | Op::Sfspline | Op::Fsplinea | Op::Sfsplinea
        );
        let ty = match op {
            Op::Cspline | Op::Scspline | Op::Csplinea | Op::Scsplinea => ValueType::Color,
            Op::Pspline | Op::Spspline | Op::Psplinea | Op::Spsplinea => ValueType::Point,
            _ => ValueType::Float,
        };

        let mut fv = false;
        let mut knots_entries: Vec<StackEntry> = Vec::new();
        let mut array_entry = None;
        let mut pending = 0usize;

        let basis_entry = if array_form {
            if string_basis {
                Some(self.pop("spline", &mut fv)?)
            } else {
                None
            }
        } else {
            let count = self.pop("spline", &mut fv)?;
            pending = count.data.borrow().get_float(0) as usize + 4;
            self.stack.release(count);
            knots_entries.reserve(pending);
            if string_basis {
                Some(self.pop("spline", &mut fv)?)
            } else {
                None
            }
        };

        let value = self.pop("spline", &mut fv)?;

        if array_form {
            array_entry = Some(self.pop("spline", &mut fv)?);
        } else {
            for _ in 0..pending {
                knots_entries.push(self.pop("spline", &mut fv)?);
            }
        }

        let (basis, step) = match &basis_entry {
            Some(b) => {
                let name = b.data.borrow().get_str(0);
                match spline::basis_by_name(&name) {
                    Some(m) => (m, spline::basis_step(&name)),
                    None => {
                        self.fault("unknown spline basis");
                        (&spline::CATMULL_ROM, 1)
                    }
                }
            }
            None => (&spline::CATMULL_ROM, 1),
        };

        let res = self.stack.next_temp(ty, res_class(fv), env.grid_size());
        {
            let tv = value.data.borrow();
            let mut rv = res.borrow_mut();
            let n = if fv { env.grid_size() } else { 1 };
            for i in 0..n {
                if !fv || env.lane_active(i) {
                    let t = tv.get_float(i);
                    if triple {
                        let knots: Vec<Vec3> = if let Some(arr) = &array_entry {
                            let av = arr.data.borrow();
                            (0..av.array_len().max(1))
                                .map(|e| av.get_triple_elem(e, i))
                                .collect()
                        } else {
                            knots_entries
                                .iter()
                                .map(|e| e.data.borrow().get_triple(i))
                                .collect()
                        };
                        rv.set_triple(i, spline::spline_triple(basis, step, t, &knots));
                    } else {
                        let knots: Vec<f32> = if let Some(arr) = &array_entry {
                            let av = arr.data.borrow();
                            (0..av.array_len().max(1))
                                .map(|e| av.get_float_elem(e, i))
                                .collect()
                        } else {
                            knots_entries
                                .iter()
                                .map(|e| e.data.borrow().get_float(i))
                                .collect()
                        };
                        rv.set_float(i, spline::spline_float(basis, step, t, &knots));
                    }
                }
            }
        }
        self.stack.push(res);
        self.stack.release(value);
        if let Some(b) = basis_entry {
            self.stack.release(b);
        }
        if let Some(a) = array_entry {
            self.stack.release(a);
        }
        for e in knots_entries {
            self.stack.release(e);
        }
        Ok(())
    }

    /// Space-named transforms. `two_spaces` selects the from/to form.
    fn space_transform(
        &mut self,
        env: &ShaderExecEnv,
        services: &dyn RendererServices,
        kind: TransformKind,
        two_spaces: bool,
    ) -> Result<()> {
        let mut fv = false;
        let from_entry = if two_spaces {
            Some(self.pop("transform", &mut fv)?)
        } else {
            None
        };
        let to_entry = self.pop("transform", &mut fv)?;
        let val = self.pop("transform", &mut fv)?;

        let from = from_entry
            .as_ref()
            .map(|e| e.data.borrow().get_str(0))
            .unwrap_or_else(|| SmolStr::new("current"));
        let to = to_entry.data.borrow().get_str(0);
        let matrix = match services.space_to_space(crate::env::space_or_current(&from), &to) {
            Some(m) => m,
            None => {
                self.fault("unknown coordinate space");
                Mat4::IDENTITY
            }
        };
        self.apply_transform(env, kind, matrix, fv, val);
        self.stack.release(to_entry);
        if let Some(e) = from_entry {
            self.stack.release(e);
        }
        Ok(())
    }

    /// Matrix-operand transforms (`transformm` family).
    fn matrix_transform(&mut self, env: &ShaderExecEnv, kind: TransformKind) -> Result<()> {
        let mut fv = false;
        let m_entry = self.pop("transform", &mut fv)?;
        let val = self.pop("transform", &mut fv)?;
        let matrix = m_entry.data.borrow().get_matrix(0);
        self.apply_transform(env, kind, matrix, fv, val);
        self.stack.release(m_entry);
        Ok(())
    }

    fn apply_transform(
        &mut self,
        env: &ShaderExecEnv,
        kind: TransformKind,
        matrix: Mat4,
        fv: bool,
        val: StackEntry,
    ) {
        let inv_t = matrix.inverse().transpose();
        let (ty, n) = {
            let v = val.data.borrow();
            (v.ty(), if fv { env.grid_size() } else { 1 })
        };
        let out_ty = if kind == TransformKind::Matrix {
            ValueType::Matrix
        } else {
            ty
        };
        let res = self.stack.next_temp(out_ty, res_class(fv), env.grid_size());
        {
            let vv = val.data.borrow();
            let mut rv = res.borrow_mut();
            for i in 0..n {
                if !fv || env.lane_active(i) {
                    match kind {
                        TransformKind::Point => {
                            rv.set_triple(i, matrix.transform_point3(vv.get_triple(i)))
                        }
                        TransformKind::Vector => {
                            rv.set_triple(i, matrix.transform_vector3(vv.get_triple(i)))
                        }
                        TransformKind::Normal => {
                            rv.set_triple(i, inv_t.transform_vector3(vv.get_triple(i)))
                        }
                        TransformKind::Matrix => rv.set_matrix(i, matrix * vv.get_matrix(i)),
                    }
                }
            }
        }
        self.stack.push(res);
        self.stack.release(val);
    }

    /// `ctransform`: color space conversion ("rgb", "hsv").
    fn color_transform(&mut self, env: &ShaderExecEnv, two_spaces: bool) -> Result<()> {
        let mut fv = false;
        let from_entry = if two_spaces {
            Some(self.pop("ctransform", &mut fv)?)
        } else {
            None
        };
        let to_entry = self.pop("ctransform", &mut fv)?;
        let val = self.pop("ctransform", &mut fv)?;
        let from = from_entry
            .as_ref()
            .map(|e| e.data.borrow().get_str(0))
            .unwrap_or_else(|| SmolStr::new("rgb"));
        let to = to_entry.data.borrow().get_str(0);
        let conv: fn(Vec3) -> Vec3 = match (from.as_str(), to.as_str()) {
            ("rgb", "hsv") => math::rgb_to_hsv,
            ("hsv", "rgb") => math::hsv_to_rgb,
            (a, b) if a == b => |c| c,
            _ => {
                self.fault("unsupported color space conversion");
                |c| c
            }
        };
        let res = self
            .stack
            .next_temp(ValueType::Color, res_class(fv), env.grid_size());
        {
            let vv = val.data.borrow();
            let mut rv = res.borrow_mut();
            let n = if fv { env.grid_size() } else { 1 };
            for i in 0..n {
                if !fv || env.lane_active(i) {
                    rv.set_triple(i, conv(vv.get_triple(i)));
                }
            }
        }
        self.stack.push(res);
        self.stack.release(val);
        self.stack.release(to_entry);
        if let Some(e) = from_entry {
            self.stack.release(e);
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Lighting.

impl ShaderVm {
    fn ambient(&mut self, env: &mut ShaderExecEnv, services: &dyn RendererServices) -> Result<()> {
        let n = env.grid_size();
        let mut acc = vec![Vec3::ZERO; n];
        env.ambient(services, &mut acc);
        let res = self
            .stack
            .next_temp(ValueType::Color, StorageClass::Varying, n);
        {
            let mut rv = res.borrow_mut();
            for i in 0..n {
                if env.lane_active(i) {
                    rv.set_triple(i, acc[i]);
                }
            }
        }
        self.stack.push(res);
        Ok(())
    }

    fn diffuse(&mut self, env: &mut ShaderExecEnv, services: &dyn RendererServices) -> Result<()> {
        let mut fv = false;
        let en = self.pop("diffuse", &mut fv)?;
        let n = env.grid_size();
        let mut acc = vec![Vec3::ZERO; n];
        let mut found = env.init_illuminance(services);
        while found {
            {
                let l = env.var(EnvVar::L);
                let cl = env.var(EnvVar::Cl);
                let lv = l.borrow();
                let clv = cl.borrow();
                let nv = en.data.borrow();
                for (i, a) in acc.iter_mut().enumerate() {
                    if env.lane_active(i) {
                        let ln = math::safe_normalize(lv.get_triple(i));
                        let nn = math::safe_normalize(nv.get_triple(i));
                        *a += clv.get_triple(i) * ln.dot(nn).max(0.0);
                    }
                }
            }
            found = env.advance_illuminance(services);
        }
        let res = self
            .stack
            .next_temp(ValueType::Color, StorageClass::Varying, n);
        {
            let mut rv = res.borrow_mut();
            for i in 0..n {
                if env.lane_active(i) {
                    rv.set_triple(i, acc[i]);
                }
            }
        }
        self.stack.push(res);
        self.stack.release(en);
        Ok(())
    }

    fn specular(&mut self, env: &mut ShaderExecEnv, services: &dyn RendererServices) -> Result<()> {
        let mut fv = false;
        let en = self.pop("specular", &mut fv)?;
        let ev = self.pop("specular", &mut fv)?;
        let er = self.pop("specular", &mut fv)?;
        let n = env.grid_size();
        let mut acc = vec![Vec3::ZERO; n];
        let mut found = env.init_illuminance(services);
        while found {
            {
                let l = env.var(EnvVar::L);
                let cl = env.var(EnvVar::Cl);
                let lv = l.borrow();
                let clv = cl.borrow();
                let nv = en.data.borrow();
                let vv = ev.data.borrow();
                let rv = er.data.borrow();
                for (i, a) in acc.iter_mut().enumerate() {
                    if env.lane_active(i) {
                        let ln = math::safe_normalize(lv.get_triple(i));
                        let h = math::safe_normalize(ln + vv.get_triple(i));
                        let nn = math::safe_normalize(nv.get_triple(i));
                        let rough = rv.get_float(i).max(1e-4);
                        *a += clv.get_triple(i) * nn.dot(h).max(0.0).powf(1.0 / rough);
                    }
                }
            }
            found = env.advance_illuminance(services);
        }
        let res = self
            .stack
            .next_temp(ValueType::Color, StorageClass::Varying, n);
        {
            let mut rv = res.borrow_mut();
            for i in 0..n {
                if env.lane_active(i) {
                    rv.set_triple(i, acc[i]);
                }
            }
        }
        self.stack.push(res);
        self.stack.release(en);
        self.stack.release(ev);
        self.stack.release(er);
        Ok(())
    }

    fn phong(&mut self, env: &mut ShaderExecEnv, services: &dyn RendererServices) -> Result<()> {
        let mut fv = false;
        let en = self.pop("phong", &mut fv)?;
        let ev = self.pop("phong", &mut fv)?;
        let es = self.pop("phong", &mut fv)?;
        let n = env.grid_size();
        let mut acc = vec![Vec3::ZERO; n];
        let mut found = env.init_illuminance(services);
        while found {
            {
                let l = env.var(EnvVar::L);
                let cl = env.var(EnvVar::Cl);
                let lv = l.borrow();
                let clv = cl.borrow();
                let nv = en.data.borrow();
                let vv = ev.data.borrow();
                let sv = es.data.borrow();
                for (i, a) in acc.iter_mut().enumerate() {
                    if env.lane_active(i) {
                        let ln = math::safe_normalize(lv.get_triple(i));
                        let nn = math::safe_normalize(nv.get_triple(i));
                        let r = math::reflect(-math::safe_normalize(vv.get_triple(i)), nn);
                        let size = sv.get_float(i).max(1e-4);
                        *a += clv.get_triple(i) * r.dot(ln).max(0.0).powf(size);
                    }
                }
            }
            found = env.advance_illuminance(services);
        }
        let res = self
            .stack
            .next_temp(ValueType::Color, StorageClass::Varying, n);
        {
            let mut rv = res.borrow_mut();
            for i in 0..n {
                if env.lane_active(i) {
                    rv.set_triple(i, acc[i]);
                }
            }
        }
        self.stack.push(res);
        self.stack.release(en);
        self.stack.release(ev);
        self.stack.release(es);
        Ok(())
    }

    fn specularbrdf(&mut self, env: &ShaderExecEnv) -> Result<()> {
        let mut fv = false;
        let el = self.pop("specularbrdf", &mut fv)?;
        let en = self.pop("specularbrdf", &mut fv)?;
        let ev = self.pop("specularbrdf", &mut fv)?;
        let er = self.pop("specularbrdf", &mut fv)?;
        let res = self
            .stack
            .next_temp(ValueType::Color, res_class(fv), env.grid_size());
        {
            let lv = el.data.borrow();
            let nv = en.data.borrow();
            let vv = ev.data.borrow();
            let rv_ = er.data.borrow();
            let mut rv = res.borrow_mut();
            let n = if fv { env.grid_size() } else { 1 };
            for i in 0..n {
                if !fv || env.lane_active(i) {
                    let ln = math::safe_normalize(lv.get_triple(i));
                    let h = math::safe_normalize(ln + vv.get_triple(i));
                    let nn = math::safe_normalize(nv.get_triple(i));
                    let rough = rv_.get_float(i).max(1e-4);
                    rv.set_triple(i, Vec3::splat(nn.dot(h).max(0.0).powf(1.0 / rough)));
                }
            }
        }
        self.stack.push(res);
        self.stack.release(el);
        self.stack.release(en);
        self.stack.release(ev);
        self.stack.release(er);
        Ok(())
    }

    /// Light-shader side: `illuminate(from[, axis, angle])`. Sets `L` from
    /// the light position to every surface point.
    fn illuminate(&mut self, env: &mut ShaderExecEnv, with_cone: bool) -> Result<()> {
        let mut fv = false;
        let efrom = self.pop("illuminate", &mut fv)?;
        let cone = if with_cone {
            let axis = self.pop("illuminate", &mut fv)?;
            let angle = self.pop("illuminate", &mut fv)?;
            Some((axis, angle))
        } else {
            None
        };
        let n = env.grid_size();
        {
            let ps = env.var(EnvVar::Ps);
            let l = env.var(EnvVar::L);
            let psv = ps.borrow();
            let mut lv = l.borrow_mut();
            let fromv = efrom.data.borrow();
            for i in 0..n {
                if env.lane_active(i) {
                    lv.set_triple(i, psv.get_triple(i) - fromv.get_triple(i));
                }
            }
        }
        if let Some((axis, angle)) = &cone {
            let l = env.var(EnvVar::L);
            let lv = l.borrow();
            let av = axis.data.borrow();
            let gv = angle.data.borrow();
            let mut cond = Value::new(ValueType::Float, StorageClass::Varying, n);
            for i in 0..n {
                let dir = math::safe_normalize(lv.get_triple(i));
                let ax = math::safe_normalize(av.get_triple(i));
                let inside = math::safe_acos(dir.dot(ax)) <= gv.get_float(i);
                cond.set_float(i, inside as u32 as f32);
            }
            drop(lv);
            env.set_current_state(&cond);
        }
        self.stack.release(efrom);
        if let Some((axis, angle)) = cone {
            self.stack.release(axis);
            self.stack.release(angle);
        }
        Ok(())
    }

    /// Light-shader side: `solar(axis, angle)` for distant lights.
    fn solar(&mut self, env: &mut ShaderExecEnv) -> Result<()> {
        let mut fv = false;
        let axis = self.pop("solar", &mut fv)?;
        let angle = self.pop("solar", &mut fv)?;
        let n = env.grid_size();
        {
            let l = env.var(EnvVar::L);
            let mut lv = l.borrow_mut();
            let av = axis.data.borrow();
            for i in 0..n {
                if env.lane_active(i) {
                    lv.set_triple(i, av.get_triple(i));
                }
            }
        }
        self.stack.release(axis);
        self.stack.release(angle);
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Texturing trampolines and state queries.

impl ShaderVm {
    /// Pops the leading extra-parameter count plus `fixed` coordinate
    /// operands, returning (name, channel, coords, extras-released).
    fn texture_header(
        &mut self,
        fv: &mut bool,
        fixed: usize,
    ) -> Result<(SmolStr, usize, Vec<StackEntry>)> {
        let count = self.pop("texture", fv)?;
        let extra = count.data.borrow().get_float(0) as usize;
        self.stack.release(count);
        let name_e = self.pop("texture", fv)?;
        let chan_e = self.pop("texture", fv)?;
        let name = name_e.data.borrow().get_str(0);
        let channel = chan_e.data.borrow().get_float(0) as usize;
        self.stack.release(name_e);
        self.stack.release(chan_e);
        let mut coords = Vec::with_capacity(fixed);
        for _ in 0..fixed {
            coords.push(self.pop("texture", fv)?);
        }
        for _ in 0..extra {
            let e = self.pop("texture", fv)?;
            self.stack.release(e);
        }
        Ok((name, channel, coords))
    }

    fn texture(
        &mut self,
        env: &ShaderExecEnv,
        services: &dyn RendererServices,
        op: Op,
        color: bool,
    ) -> Result<()> {
        let fixed = match op {
            Op::Ftexture1 | Op::Ctexture1 => 0,
            Op::Ftexture2 | Op::Ctexture2 => 2,
            _ => 8,
        };
        let mut fv = true;
        let (name, channel, coords) = self.texture_header(&mut fv, fixed)?;
        let n = env.grid_size();
        let ty = if color { ValueType::Color } else { ValueType::Float };
        let res = self.stack.next_temp(ty, StorageClass::Varying, n);
        let mut missing = false;
        {
            let s_env = env.var(EnvVar::s);
            let t_env = env.var(EnvVar::t);
            let sv = s_env.borrow();
            let tv = t_env.borrow();
            let mut rv = res.borrow_mut();
            for i in 0..n {
                if !env.lane_active(i) {
                    continue;
                }
                let (s, t) = if coords.is_empty() {
                    (sv.get_float(i), tv.get_float(i))
                } else {
                    // Area forms average to their first corner.
                    (
                        coords[0].data.borrow().get_float(i),
                        coords[1].data.borrow().get_float(i),
                    )
                };
                if color {
                    let mut c = Vec3::ZERO;
                    for k in 0..3 {
                        match services.texture(&name, channel + k, s, t) {
                            Some(x) => c[k] = x,
                            None => missing = true,
                        }
                    }
                    rv.set_triple(i, c);
                } else {
                    match services.texture(&name, channel, s, t) {
                        Some(x) => rv.set_float(i, x),
                        None => {
                            missing = true;
                            rv.set_float(i, 0.0);
                        }
                    }
                }
            }
        }
        if missing {
            self.fault("missing texture");
        }
        self.stack.push(res);
        for e in coords {
            self.stack.release(e);
        }
        Ok(())
    }

    fn environment(
        &mut self,
        env: &ShaderExecEnv,
        services: &dyn RendererServices,
        op: Op,
        color: bool,
    ) -> Result<()> {
        let fixed = match op {
            Op::Fenvironment2 | Op::Cenvironment2 => 1,
            _ => 4,
        };
        let mut fv = true;
        let (name, channel, coords) = self.texture_header(&mut fv, fixed)?;
        let n = env.grid_size();
        let ty = if color { ValueType::Color } else { ValueType::Float };
        let res = self.stack.next_temp(ty, StorageClass::Varying, n);
        let mut missing = false;
        {
            let mut rv = res.borrow_mut();
            for i in 0..n {
                if !env.lane_active(i) {
                    continue;
                }
                // Latitude-longitude mapping of the direction vector.
                let dir = math::safe_normalize(coords[0].data.borrow().get_triple(i));
                let s = dir.y.atan2(dir.x) / (2.0 * std::f32::consts::PI) + 0.5;
                let t = math::safe_acos(dir.z) / std::f32::consts::PI;
                if color {
                    let mut c = Vec3::ZERO;
                    for k in 0..3 {
                        match services.texture(&name, channel + k, s, t) {
                            Some(x) => c[k] = x,
                            None => missing = true,
                        }
                    }
                    rv.set_triple(i, c);
                } else {
                    match services.texture(&name, channel, s, t) {
                        Some(x) => rv.set_float(i, x),
                        None => {
                            missing = true;
                            rv.set_float(i, 0.0);
                        }
                    }
                }
            }
        }
        if missing {
            self.fault("missing environment map");
        }
        self.stack.push(res);
        for e in coords {
            self.stack.release(e);
        }
        Ok(())
    }

    /// `bump*`: displaces P along the shading normal by the texture value.
    fn bump(
        &mut self,
        env: &ShaderExecEnv,
        services: &dyn RendererServices,
        op: Op,
    ) -> Result<()> {
        let fixed = match op {
            Op::Bump1 => 0,
            Op::Bump2 => 2,
            _ => 8,
        };
        let mut fv = true;
        let (name, channel, coords) = self.texture_header(&mut fv, fixed)?;
        let n = env.grid_size();
        let res = self
            .stack
            .next_temp(ValueType::Point, StorageClass::Varying, n);
        {
            let p = env.var(EnvVar::P);
            let nrm = env.var(EnvVar::N);
            let s_env = env.var(EnvVar::s);
            let t_env = env.var(EnvVar::t);
            let pv = p.borrow();
            let nv = nrm.borrow();
            let sv = s_env.borrow();
            let tv = t_env.borrow();
            let mut rv = res.borrow_mut();
            for i in 0..n {
                if !env.lane_active(i) {
                    continue;
                }
                let (s, t) = if coords.is_empty() {
                    (sv.get_float(i), tv.get_float(i))
                } else {
                    (
                        coords[0].data.borrow().get_float(i),
                        coords[1].data.borrow().get_float(i),
                    )
                };
                let amt = services.texture(&name, channel, s, t).unwrap_or(0.0);
                rv.set_triple(
                    i,
                    pv.get_triple(i) + math::safe_normalize(nv.get_triple(i)) * amt,
                );
            }
        }
        self.stack.push(res);
        for e in coords {
            self.stack.release(e);
        }
        Ok(())
    }

    fn shadow(
        &mut self,
        env: &ShaderExecEnv,
        services: &dyn RendererServices,
        op: Op,
    ) -> Result<()> {
        let fixed = if op == Op::Shadow { 1 } else { 4 };
        let mut fv = true;
        let (name, _channel, coords) = self.texture_header(&mut fv, fixed)?;
        let n = env.grid_size();
        let res = self
            .stack
            .next_temp(ValueType::Float, StorageClass::Varying, n);
        {
            let mut rv = res.borrow_mut();
            for i in 0..n {
                if env.lane_active(i) {
                    let p = coords[0].data.borrow().get_triple(i);
                    rv.set_float(i, services.shadow(&name, p).unwrap_or(0.0));
                }
            }
        }
        self.stack.push(res);
        for e in coords {
            self.stack.release(e);
        }
        Ok(())
    }

    fn occlusion(&mut self, env: &ShaderExecEnv) -> Result<()> {
        self.fault("occlusion() is unsupported; returning 0");
        let mut fv = true;
        let (_name, _channel, coords) = self.texture_header(&mut fv, 3)?;
        let res = self
            .stack
            .next_temp(ValueType::Float, StorageClass::Varying, env.grid_size());
        {
            let mut rv = res.borrow_mut();
            for i in 0..env.grid_size() {
                if env.lane_active(i) {
                    rv.set_float(i, 0.0);
                }
            }
        }
        self.stack.push(res);
        for e in coords {
            self.stack.release(e);
        }
        Ok(())
    }

    /// Shared shape of the renderer state queries: pop a name (plus a
    /// second name for textureinfo), pop the output reference, fill it,
    /// push a success float.
    fn state_query(
        &mut self,
        env: &ShaderExecEnv,
        kind: QueryKind,
        services: &dyn RendererServices,
    ) -> Result<()> {
        let mut fv = false;
        let name_e = self.pop("state query", &mut fv)?;
        let name = name_e.data.borrow().get_str(0);
        self.stack.release(name_e);
        if kind == QueryKind::TextureInfo {
            let data_e = self.pop("textureinfo", &mut fv)?;
            self.stack.release(data_e);
        }
        let dest = self.pop("state query", &mut fv)?;
        let ok = {
            let mut out = dest.data.borrow_mut();
            match kind {
                QueryKind::Attribute => services.attribute(&name, &mut out),
                QueryKind::Option => services.option(&name, &mut out),
                QueryKind::RendererInfo => services.renderer_info(&name, &mut out),
                QueryKind::ShaderParam => services.shader_parameter(&name, &mut out),
                QueryKind::LightSource => env
                    .current_light()
                    .map(|l| l.borrow().parameter(&name, &mut out))
                    .unwrap_or(false),
                QueryKind::TextureInfo | QueryKind::Unknown => false,
            }
        };
        self.stack.release(dest);
        self.push_uniform_float(env, ok as u32 as f32);
        Ok(())
    }

    fn concat(&mut self, env: &ShaderExecEnv) -> Result<()> {
        let mut fv = false;
        let count = self.pop("concat", &mut fv)?;
        let extra = count.data.borrow().get_float(0) as usize;
        self.stack.release(count);
        let first = self.pop("concat", &mut fv)?;
        let mut s = first.data.borrow().get_str(0).to_string();
        self.stack.release(first);
        for _ in 0..extra {
            let e = self.pop("concat", &mut fv)?;
            s.push_str(&e.data.borrow().get_str(0));
            self.stack.release(e);
        }
        let res = self
            .stack
            .next_temp(ValueType::String, StorageClass::Uniform, env.grid_size());
        res.borrow_mut().set_str(0, SmolStr::new(s));
        self.stack.push(res);
        Ok(())
    }

    /// `format` builds a string; `printf` prints one line per active lane
    /// (or a single line when every argument is uniform).
    fn format(&mut self, env: &ShaderExecEnv, print: bool) -> Result<()> {
        let mut fv = false;
        let count = self.pop("format", &mut fv)?;
        let extra = count.data.borrow().get_float(0) as usize;
        self.stack.release(count);
        let fmt_e = self.pop("format", &mut fv)?;
        let fmt = fmt_e.data.borrow().get_str(0);
        self.stack.release(fmt_e);
        let mut args = Vec::with_capacity(extra);
        let mut any_varying = false;
        for _ in 0..extra {
            let e = self.pop("format", &mut fv)?;
            any_varying |= e.data.borrow().is_varying();
            args.push(e);
        }
        let lane_args = |lane: usize| -> Vec<strings::FormatArg> {
            args.iter()
                .map(|e| {
                    let v = e.data.borrow();
                    match v.ty() {
                        ValueType::Float | ValueType::Bool => {
                            strings::FormatArg::Float(v.get_float(lane))
                        }
                        ValueType::String => strings::FormatArg::Str(v.get_str(lane).to_string()),
                        _ => strings::FormatArg::Triple(v.get_triple(lane)),
                    }
                })
                .collect()
        };
        if print {
            if any_varying {
                for i in 0..env.grid_size() {
                    if env.lane_active(i) {
                        println!("{}", strings::format(&fmt, &lane_args(i)));
                    }
                }
            } else {
                println!("{}", strings::format(&fmt, &lane_args(0)));
            }
        } else {
            let s = strings::format(&fmt, &lane_args(0));
            let res =
                self.stack
                    .next_temp(ValueType::String, StorageClass::Uniform, env.grid_size());
            res.borrow_mut().set_str(0, SmolStr::new(s));
            self.stack.push(res);
        }
        for e in args {
            self.stack.release(e);
        }
        Ok(())
    }

    /// `bake_*(file, s, t, value)`: forwards point-cloud samples.
    fn bake(
        &mut self,
        env: &ShaderExecEnv,
        services: &dyn RendererServices,
        scalar: bool,
    ) -> Result<()> {
        let mut fv = false;
        let file_e = self.pop("bake", &mut fv)?;
        let s_e = self.pop("bake", &mut fv)?;
        let t_e = self.pop("bake", &mut fv)?;
        let v_e = self.pop("bake", &mut fv)?;
        let file = file_e.data.borrow().get_str(0);
        {
            let sv = s_e.data.borrow();
            let tv = t_e.data.borrow();
            let vv = v_e.data.borrow();
            for i in 0..env.grid_size() {
                if env.lane_active(i) {
                    if scalar {
                        services.bake(&file, sv.get_float(i), tv.get_float(i), &[vv.get_float(i)]);
                    } else {
                        let p = vv.get_triple(i);
                        services.bake(&file, sv.get_float(i), tv.get_float(i), &[p.x, p.y, p.z]);
                    }
                }
            }
        }
        self.stack.release(file_e);
        self.stack.release(s_e);
        self.stack.release(t_e);
        self.stack.release(v_e);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::NullServices;
    use crate::loader::load_program;

    fn run_main(src: &str, env: &mut ShaderExecEnv) -> ShaderVm {
        let mut vm = ShaderVm::new(load_program(src).unwrap());
        vm.execute(env, &NullServices).unwrap();
        vm
    }

    #[test]
    fn arithmetic_into_ci() {
        let mut env = ShaderExecEnv::new(1, 1);
        env.reset_state();
        run_main(
            "surface s\nmain:\nLabel_0:\n\tpushif 2\n\tpushif 3\n\tmulff\n\tsetfc\n\tpop Ci\n",
            &mut env,
        );
        let ci = env.var(EnvVar::Ci);
        // 2*3 with the first pop as the left operand.
        assert_eq!(ci.borrow().get_triple(0), Vec3::splat(6.0));
    }

    #[test]
    fn subtraction_operand_order() {
        let mut env = ShaderExecEnv::new(0, 0);
        env.reset_state();
        // a - b where a is pushed second (popped first).
        run_main(
            "surface s\nvarying float r\nmain:\nLabel_0:\n\tpushif 3\n\tpushif 10\n\tsubff\n\tpop r\n",
            &mut env,
        )
        .local_by_name("r")
        .map(|r| assert_eq!(r.borrow().get_float(0), 7.0))
        .unwrap();
    }

    #[test]
    fn masked_lanes_stay_untouched() {
        // Scenario: condition true on even lanes only; odd lanes keep their
        // previous Ci.
        let mut env = ShaderExecEnv::new(3, 0);
        env.reset_state();
        {
            let ci = env.var(EnvVar::Ci);
            let mut ci = ci.borrow_mut();
            for i in 0..4 {
                ci.set_triple(i, Vec3::splat(9.0));
            }
            let u = env.var(EnvVar::u);
            let mut u = u.borrow_mut();
            for i in 0..4 {
                u.set_float(i, if i % 2 == 0 { 1.0 } else { 0.0 });
            }
        }
        let src = r#"
surface masked
main:
Label_0:
	RS_PUSH
	pushv u
	S_GET
	RS_GET
	S_JZ Label_1
	pushif 5
	setfc
	pop Ci
Label_1:
	RS_POP
"#;
        run_main(src, &mut env);
        let ci = env.var(EnvVar::Ci);
        let ci = ci.borrow();
        assert_eq!(ci.get_triple(0), Vec3::splat(5.0));
        assert_eq!(ci.get_triple(1), Vec3::splat(9.0));
        assert_eq!(ci.get_triple(2), Vec3::splat(5.0));
        assert_eq!(ci.get_triple(3), Vec3::splat(9.0));
    }

    #[test]
    fn if_else_with_inverse() {
        let mut env = ShaderExecEnv::new(3, 0);
        env.reset_state();
        {
            let u = env.var(EnvVar::u);
            let mut u = u.borrow_mut();
            for i in 0..4 {
                u.set_float(i, (i < 2) as u32 as f32);
            }
        }
        let src = r#"
surface branchy
main:
Label_0:
	RS_PUSH
	pushv u
	S_GET
	RS_GET
	S_JZ Label_1
	pushif 1
	setfc
	pop Ci
Label_1:
	RS_INVERSE
	RS_JZ Label_2
	pushif 2
	setfc
	pop Ci
Label_2:
	RS_POP
"#;
        run_main(src, &mut env);
        let ci = env.var(EnvVar::Ci);
        let ci = ci.borrow();
        assert_eq!(ci.get_triple(0), Vec3::splat(1.0));
        assert_eq!(ci.get_triple(1), Vec3::splat(1.0));
        assert_eq!(ci.get_triple(2), Vec3::splat(2.0));
        assert_eq!(ci.get_triple(3), Vec3::splat(2.0));
    }

    #[test]
    fn temp_pool_is_leak_free() {
        let mut env = ShaderExecEnv::new(3, 3);
        env.reset_state();
        let vm = run_main(
            "surface s\nmain:\nLabel_0:\n\tpushv u\n\tpushv v\n\taddff\n\tsetfc\n\tpop Ci\n",
            &mut env,
        );
        assert_eq!(vm.live_temps(), 0);
    }

    #[test]
    fn merge_selects_per_lane() {
        let mut env = ShaderExecEnv::new(3, 0);
        env.reset_state();
        {
            let u = env.var(EnvVar::u);
            let mut u = u.borrow_mut();
            for i in 0..4 {
                u.set_float(i, (i % 2) as f32);
            }
        }
        // true-value, false-value, condition; mergef picks per lane.
        run_main(
            "surface s\nvarying float r\nmain:\nLabel_0:\n\tpushif 10\n\tpushif 20\n\tpushv u\n\tmergef\n\tpop r\n",
            &mut env,
        )
        .local_by_name("r")
        .map(|r| {
            let r = r.borrow();
            assert_eq!(r.get_float(0), 20.0);
            assert_eq!(r.get_float(1), 10.0);
            assert_eq!(r.get_float(2), 20.0);
            assert_eq!(r.get_float(3), 10.0);
        })
        .unwrap();
    }

    #[test]
    fn stack_underflow_is_fatal() {
        let mut env = ShaderExecEnv::new(0, 0);
        env.reset_state();
        let mut vm = ShaderVm::new(
            load_program("surface s\nmain:\nLabel_0:\n\taddff\n").unwrap(),
        );
        assert!(matches!(
            vm.execute(&mut env, &NullServices),
            Err(Error::StackUnderflow(_))
        ));
    }

    #[test]
    fn init_section_sets_parameter_defaults() {
        let src = "surface s\nparam uniform float Kd\ninit:\nLabel_0:\n\tpushif 0.75\n\tpop Kd\nmain:\nLabel_0:\n\tnop\n";
        let mut vm = ShaderVm::new(load_program(src).unwrap());
        vm.run_init(&NullServices).unwrap();
        let kd = vm.parameter("Kd").unwrap();
        assert_eq!(kd.borrow().get_float(0), 0.75);
    }

    struct TestLight {
        color: Vec3,
        dir: Vec3,
    }

    impl LightShader for TestLight {
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
                l.set_triple(i, self.dir);
                cl.set_triple(i, self.color);
            }
        }
    }

    #[test]
    fn diffuse_integrates_lights() {
        let mut env = ShaderExecEnv::new(1, 1);
        env.reset_state();
        env.add_light(Rc::new(RefCell::new(TestLight {
            color: Vec3::new(1.0, 0.5, 0.25),
            dir: Vec3::Z,
        })));
        {
            let nvar = env.var(EnvVar::N);
            let mut nv = nvar.borrow_mut();
            for i in 0..4 {
                nv.set_triple(i, Vec3::Z);
            }
        }
        run_main(
            "surface s\nmain:\nLabel_0:\n\tpushv N\n\tdiffuse\n\tpop Ci\n",
            &mut env,
        );
        let ci = env.var(EnvVar::Ci);
        let got = ci.borrow().get_triple(2);
        assert!((got - Vec3::new(1.0, 0.5, 0.25)).length() < 1e-5);
    }

    #[test]
    fn spline_opcode_catmull_rom() {
        let mut env = ShaderExecEnv::new(0, 0);
        env.reset_state();
        // count=0 extras, value=0.5, four knots pushed so the first pop is
        // knot 0: push in reverse.
        let src = r#"
surface s
varying float r
main:
Label_0:
	pushif 1
	pushif 1
	pushif 0
	pushif 0
	pushif 0.5
	pushif 0
	fspline
	pop r
"#;
        run_main(src, &mut env)
            .local_by_name("r")
            .map(|r| assert!((r.borrow().get_float(0) - 0.5).abs() < 1e-5))
            .unwrap();
    }
}
