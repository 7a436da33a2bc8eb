//! Lane-parallel shader values.
//!
//! A [`Value`] is the universal dataflow type of the shading VM: a scalar,
//! triple, color, matrix, string or boolean, stored either once (uniform) or
//! once per grid lane (varying). Array variables store one lane block per
//! array element.

use glam::{Mat4, Vec3};
use smol_str::SmolStr;

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Data type of a shader value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    Float,
    Point,
    Vector,
    Normal,
    Color,
    Matrix,
    String,
    Bool,
}

impl ValueType {
    /// Points, vectors and normals share storage and differ only in how they
    /// transform.
    pub fn is_triple(self) -> bool {
        matches!(
            self,
            ValueType::Point | ValueType::Vector | ValueType::Normal | ValueType::Color
        )
    }
}

/// Storage class of a shader value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StorageClass {
    Constant,
    Uniform,
    Varying,
    Vertex,
    FaceVarying,
}

impl StorageClass {
    /// Whether values of this class carry one slot per grid lane.
    pub fn is_varying(self) -> bool {
        matches!(
            self,
            StorageClass::Varying | StorageClass::Vertex | StorageClass::FaceVarying
        )
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// One block of lanes of a single array element.
#[derive(Clone, Debug)]
pub enum Lanes {
    Float(Vec<f32>),
    Triple(Vec<Vec3>),
    Matrix(Vec<Mat4>),
    Str(Vec<SmolStr>),
    Bool(Vec<bool>),
}

impl Lanes {
    fn new(ty: ValueType, n: usize) -> Lanes {
        match ty {
            ValueType::Float => Lanes::Float(vec![0.0; n]),
            ValueType::Point | ValueType::Vector | ValueType::Normal | ValueType::Color => {
                Lanes::Triple(vec![Vec3::ZERO; n])
            }
            ValueType::Matrix => Lanes::Matrix(vec![Mat4::IDENTITY; n]),
            ValueType::String => Lanes::Str(vec![SmolStr::default(); n]),
            ValueType::Bool => Lanes::Bool(vec![false; n]),
        }
    }

    fn len(&self) -> usize {
        match self {
            Lanes::Float(v) => v.len(),
            Lanes::Triple(v) => v.len(),
            Lanes::Matrix(v) => v.len(),
            Lanes::Str(v) => v.len(),
            Lanes::Bool(v) => v.len(),
        }
    }

    fn resize(&mut self, n: usize) {
        match self {
            Lanes::Float(v) => v.resize(n, v.first().copied().unwrap_or(0.0)),
            Lanes::Triple(v) => v.resize(n, v.first().copied().unwrap_or(Vec3::ZERO)),
            Lanes::Matrix(v) => v.resize(n, v.first().copied().unwrap_or(Mat4::IDENTITY)),
            Lanes::Str(v) => v.resize(n, v.first().cloned().unwrap_or_default()),
            Lanes::Bool(v) => v.resize(n, v.first().copied().unwrap_or(false)),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// A shader variable or temporary.
#[derive(Clone, Debug)]
pub struct Value {
    name: SmolStr,
    ty: ValueType,
    class: StorageClass,
    /// 0 for scalars, element count for arrays.
    array_len: usize,
    is_param: bool,
    /// Lane blocks, one per array element (a single block for scalars).
    elems: Vec<Lanes>,
}

impl Value {
    /// Creates a value with `size` lanes (1 for uniform classes).
    pub fn new(ty: ValueType, class: StorageClass, size: usize) -> Value {
        let n = if class.is_varying() { size } else { 1 };
        Value {
            name: SmolStr::default(),
            ty,
            class,
            array_len: 0,
            is_param: false,
            elems: vec![Lanes::new(ty, n)],
        }
    }

    pub fn new_array(ty: ValueType, class: StorageClass, size: usize, array_len: usize) -> Value {
        let n = if class.is_varying() { size } else { 1 };
        Value {
            name: SmolStr::default(),
            ty,
            class,
            array_len,
            is_param: false,
            elems: (0..array_len.max(1)).map(|_| Lanes::new(ty, n)).collect(),
        }
    }

    /// Uniform float constant.
    pub fn uniform_float(f: f32) -> Value {
        let mut v = Value::new(ValueType::Float, StorageClass::Uniform, 1);
        v.set_float(0, f);
        v
    }

    /// Uniform string constant.
    pub fn uniform_str(s: impl Into<SmolStr>) -> Value {
        let mut v = Value::new(ValueType::String, StorageClass::Uniform, 1);
        v.set_str(0, s.into());
        v
    }

    pub fn with_name(mut self, name: impl Into<SmolStr>) -> Value {
        self.name = name.into();
        self
    }

    pub fn mark_parameter(&mut self) {
        self.is_param = true;
    }

    pub fn name(&self) -> &SmolStr {
        &self.name
    }

    pub fn ty(&self) -> ValueType {
        self.ty
    }

    pub fn class(&self) -> StorageClass {
        self.class
    }

    pub fn array_len(&self) -> usize {
        self.array_len
    }

    pub fn is_parameter(&self) -> bool {
        self.is_param
    }

    /// Lane count (1 for uniform values).
    pub fn size(&self) -> usize {
        self.elems[0].len()
    }

    pub fn is_varying(&self) -> bool {
        self.size() > 1 || self.class.is_varying()
    }

    /// Grows or shrinks the lane count of a varying value.
    pub fn set_size(&mut self, n: usize) {
        if self.class.is_varying() {
            for e in &mut self.elems {
                e.resize(n);
            }
        }
    }

    fn idx(&self, lane: usize) -> usize {
        if self.elems[0].len() > 1 {
            lane
        } else {
            0
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Lane accessors. Uniform values ignore the lane index. Reads convert
    // between compatible types (float broadcasts to triples and to scaled
    // identity matrices, floats and booleans interconvert).

    pub fn get_float(&self, lane: usize) -> f32 {
        self.get_float_elem(0, lane)
    }

    pub fn get_float_elem(&self, elem: usize, lane: usize) -> f32 {
        let i = self.idx(lane);
        match &self.elems[elem] {
            Lanes::Float(v) => v[i],
            Lanes::Bool(v) => v[i] as u32 as f32,
            Lanes::Triple(v) => v[i].x,
            _ => 0.0,
        }
    }

    pub fn get_bool(&self, lane: usize) -> bool {
        let i = self.idx(lane);
        match &self.elems[0] {
            Lanes::Bool(v) => v[i],
            Lanes::Float(v) => v[i] != 0.0,
            _ => false,
        }
    }

    pub fn get_triple(&self, lane: usize) -> Vec3 {
        self.get_triple_elem(0, lane)
    }

    pub fn get_triple_elem(&self, elem: usize, lane: usize) -> Vec3 {
        let i = self.idx(lane);
        match &self.elems[elem] {
            Lanes::Triple(v) => v[i],
            Lanes::Float(v) => Vec3::splat(v[i]),
            Lanes::Bool(v) => Vec3::splat(v[i] as u32 as f32),
            _ => Vec3::ZERO,
        }
    }

    pub fn get_matrix(&self, lane: usize) -> Mat4 {
        let i = self.idx(lane);
        match &self.elems[0] {
            Lanes::Matrix(v) => v[i],
            Lanes::Float(v) => Mat4::IDENTITY * v[i],
            _ => Mat4::IDENTITY,
        }
    }

    pub fn get_str(&self, lane: usize) -> SmolStr {
        let i = self.idx(lane);
        match &self.elems[0] {
            Lanes::Str(v) => v[i].clone(),
            _ => SmolStr::default(),
        }
    }

    pub fn set_float(&mut self, lane: usize, f: f32) {
        self.set_float_elem(0, lane, f)
    }

    pub fn set_float_elem(&mut self, elem: usize, lane: usize, f: f32) {
        let i = self.idx(lane);
        match &mut self.elems[elem] {
            Lanes::Float(v) => v[i] = f,
            Lanes::Bool(v) => v[i] = f != 0.0,
            Lanes::Triple(v) => v[i] = Vec3::splat(f),
            Lanes::Matrix(v) => v[i] = Mat4::IDENTITY * f,
            Lanes::Str(_) => {}
        }
    }

    pub fn set_bool(&mut self, lane: usize, b: bool) {
        let i = self.idx(lane);
        match &mut self.elems[0] {
            Lanes::Bool(v) => v[i] = b,
            Lanes::Float(v) => v[i] = b as u32 as f32,
            _ => {}
        }
    }

    pub fn set_triple(&mut self, lane: usize, p: Vec3) {
        self.set_triple_elem(0, lane, p)
    }

    pub fn set_triple_elem(&mut self, elem: usize, lane: usize, p: Vec3) {
        let i = self.idx(lane);
        match &mut self.elems[elem] {
            Lanes::Triple(v) => v[i] = p,
            Lanes::Float(v) => v[i] = p.x,
            _ => {}
        }
    }

    pub fn set_matrix(&mut self, lane: usize, m: Mat4) {
        let i = self.idx(lane);
        if let Lanes::Matrix(v) = &mut self.elems[0] {
            v[i] = m;
        }
    }

    pub fn set_str(&mut self, lane: usize, s: SmolStr) {
        let i = self.idx(lane);
        if let Lanes::Str(v) = &mut self.elems[0] {
            v[i] = s;
        }
    }

    /// Copies one lane from `src`, converting between compatible types.
    pub fn set_from(&mut self, src: &Value, lane: usize) {
        self.set_from_elem(0, src, 0, lane)
    }

    pub fn set_from_elem(&mut self, elem: usize, src: &Value, src_elem: usize, lane: usize) {
        match self.ty {
            ValueType::Float => {
                let f = src.get_float_elem(src_elem, lane);
                self.set_float_elem(elem, lane, f);
            }
            ValueType::Point | ValueType::Vector | ValueType::Normal | ValueType::Color => {
                let p = src.get_triple_elem(src_elem, lane);
                self.set_triple_elem(elem, lane, p);
            }
            ValueType::Matrix => self.set_matrix(lane, src.get_matrix(lane)),
            ValueType::String => self.set_str(lane, src.get_str(lane)),
            ValueType::Bool => self.set_bool(lane, src.get_bool(lane)),
        }
    }

    /// Broadcasts one lane of `src` to every lane of `self`.
    pub fn fill_from(&mut self, src: &Value, src_lane: usize) {
        for lane in 0..self.size() {
            match self.ty {
                ValueType::Float => {
                    let f = src.get_float(src_lane);
                    self.set_float(lane, f);
                }
                ValueType::Point | ValueType::Vector | ValueType::Normal | ValueType::Color => {
                    let p = src.get_triple(src_lane);
                    self.set_triple(lane, p);
                }
                ValueType::Matrix => self.set_matrix(lane, src.get_matrix(src_lane)),
                ValueType::String => self.set_str(lane, src.get_str(src_lane)),
                ValueType::Bool => self.set_bool(lane, src.get_bool(src_lane)),
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Contiguous views for vectorized loops.

    pub fn as_float_slice(&self) -> Option<&[f32]> {
        match &self.elems[0] {
            Lanes::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float_slice_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.elems[0] {
            Lanes::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_triple_slice(&self) -> Option<&[Vec3]> {
        match &self.elems[0] {
            Lanes::Triple(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_triple_slice_mut(&mut self) -> Option<&mut [Vec3]> {
        match &mut self.elems[0] {
            Lanes::Triple(v) => Some(v),
            _ => None,
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Component access: (point, 0..2), (color, 0..2), (matrix, row 0..3, col 0..3).

    pub fn comp(&self, lane: usize, i: usize) -> f32 {
        match &self.elems[0] {
            Lanes::Triple(v) => v[self.idx(lane)][i],
            Lanes::Float(v) => v[self.idx(lane)],
            _ => 0.0,
        }
    }

    pub fn set_comp(&mut self, lane: usize, i: usize, f: f32) {
        let idx = self.idx(lane);
        if let Lanes::Triple(v) = &mut self.elems[0] {
            v[idx][i] = f;
        }
    }

    pub fn mcomp(&self, lane: usize, row: usize, col: usize) -> f32 {
        match &self.elems[0] {
            Lanes::Matrix(v) => v[self.idx(lane)].row(row)[col],
            _ => 0.0,
        }
    }

    pub fn set_mcomp(&mut self, lane: usize, row: usize, col: usize, f: f32) {
        let idx = self.idx(lane);
        if let Lanes::Matrix(v) = &mut self.elems[0] {
            v[idx].col_mut(col)[row] = f;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_ignores_lane() {
        let v = Value::uniform_float(3.5);
        assert_eq!(v.get_float(0), 3.5);
        assert_eq!(v.get_float(17), 3.5);
        assert_eq!(v.size(), 1);
    }

    #[test]
    fn float_to_triple_broadcast() {
        let f = Value::uniform_float(2.0);
        let mut p = Value::new(ValueType::Point, StorageClass::Uniform, 1);
        p.set_from(&f, 0);
        assert_eq!(p.get_triple(0), Vec3::splat(2.0));
    }

    #[test]
    fn float_to_matrix_is_scaled_identity() {
        let f = Value::uniform_float(3.0);
        let mut m = Value::new(ValueType::Matrix, StorageClass::Uniform, 1);
        m.set_from(&f, 0);
        assert_eq!(m.get_matrix(0), Mat4::IDENTITY * 3.0);
    }

    #[test]
    fn point_color_reinterpret() {
        let mut p = Value::new(ValueType::Point, StorageClass::Uniform, 1);
        p.set_triple(0, Vec3::new(0.25, 0.5, 0.75));
        let mut c = Value::new(ValueType::Color, StorageClass::Uniform, 1);
        c.set_from(&p, 0);
        assert_eq!(c.get_triple(0), Vec3::new(0.25, 0.5, 0.75));
    }

    #[test]
    fn resize_replicates_first_lane() {
        let mut v = Value::new(ValueType::Float, StorageClass::Varying, 1);
        v.set_float(0, 7.0);
        v.set_size(4);
        assert_eq!(v.size(), 4);
        assert_eq!(v.get_float(3), 7.0);
    }

    #[test]
    fn matrix_components_row_col() {
        let mut m = Value::new(ValueType::Matrix, StorageClass::Uniform, 1);
        m.set_mcomp(0, 1, 2, 5.0);
        assert_eq!(m.mcomp(0, 1, 2), 5.0);
        assert_eq!(m.mcomp(0, 2, 1), 0.0);
    }

    #[test]
    fn array_elements_are_independent() {
        let mut v = Value::new_array(ValueType::Float, StorageClass::Varying, 4, 2);
        v.set_float_elem(0, 2, 1.0);
        v.set_float_elem(1, 2, 2.0);
        assert_eq!(v.get_float_elem(0, 2), 1.0);
        assert_eq!(v.get_float_elem(1, 2), 2.0);
    }
}
