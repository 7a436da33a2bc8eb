//! Pure helpers behind the shadeops: scalar math, noise fields, spline
//! bases and string formatting. Lane iteration and stack discipline live in
//! the interpreter.

pub mod math;
pub mod noise;
pub mod spline;
pub mod strings;
