//! RIB (RenderMan Interface Bytestream) tokenizer and parser.
//!
//! ASCII streams only; binary RIB encoding is not supported. The parser
//! produces self-describing [`Request`] records and leaves their
//! interpretation to a [`RequestHandler`].

mod error;
mod lexer;
mod parser;

pub use error::{Error, Result};
pub use lexer::{tokenize, Token};
pub use parser::{parse, RequestHandler};

use smol_str::SmolStr;

/// One positional or parameter value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i32),
    Float(f32),
    Str(SmolStr),
    IntArray(Vec<i32>),
    FloatArray(Vec<f32>),
    StrArray(Vec<SmolStr>),
}

impl Value {
    pub fn as_float(&self) -> Option<f32> {
        match self {
            Value::Int(i) => Some(*i as f32),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Flattens to floats (scalars become one-element vectors).
    pub fn as_floats(&self) -> Vec<f32> {
        match self {
            Value::Int(i) => vec![*i as f32],
            Value::Float(f) => vec![*f],
            Value::IntArray(v) => v.iter().map(|i| *i as f32).collect(),
            Value::FloatArray(v) => v.clone(),
            Value::Str(_) | Value::StrArray(_) => Vec::new(),
        }
    }
}

/// A `name value` pair from a request's parameter list. The name may be an
/// inline declaration (`"uniform float Kd"`).
#[derive(Clone, Debug, PartialEq)]
pub struct ParamValue {
    pub name: SmolStr,
    pub value: Value,
}

/// One parsed request: name, positional arguments, parameter list.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub name: SmolStr,
    pub positional: Vec<Value>,
    pub params: Vec<ParamValue>,
}

impl Request {
    /// Parameter lookup; matches the trailing identifier of inline
    /// declarations too.
    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.iter().find(|p| {
            p.name == name || p.name.rsplit(' ').next() == Some(name)
        })
    }

    /// All positional arguments flattened to floats.
    pub fn floats(&self) -> Vec<f32> {
        self.positional
            .iter()
            .flat_map(|v| v.as_floats())
            .collect()
    }

    pub fn str_arg(&self, index: usize) -> Option<&str> {
        self.positional.get(index).and_then(|v| v.as_str())
    }

    pub fn float_arg(&self, index: usize) -> Option<f32> {
        self.positional.get(index).and_then(|v| v.as_float())
    }

    pub fn int_arg(&self, index: usize) -> Option<i32> {
        self.positional.get(index).and_then(|v| v.as_int())
    }
}
