//! Parametric surface geometry for the REYES pipeline.
//!
//! Surfaces are bounded, split until their raster-space footprint fits a
//! grid budget, then diced into micropolygon grids ready for shading:
//! quadrics evaluate analytically, patches by forward differencing, NURBS
//! by knot refinement and tensor-product evaluation, and curves by
//! conversion into patch ribbons.

mod basis;
mod bounds;
mod error;
mod primvar;

pub mod curves;
pub mod grid;
pub mod nurbs;
pub mod patch;
pub mod quadric;
pub mod surface;
pub mod trim;

pub use basis::CubicBasis;
pub use bounds::Bound3;
pub use curves::CurvesGroup;
pub use error::{Error, Result};
pub use grid::MicroGrid;
pub use nurbs::NurbsPatch;
pub use patch::{BicubicPatch, BilinearPatch, PatchMesh};
pub use primvar::{PrimVar, PrimVarData};
pub use quadric::{Quadric, QuadricKind};
pub use surface::{Attributes, SplitDir, Surface, SurfaceBase, SurfaceBox};
pub use trim::{TrimCurve, TrimLoop};
