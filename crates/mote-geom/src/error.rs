use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("degenerate control hull")]
    DegenerateHull,
    #[error("periodic curve needs at least 3 vertices, got {0}")]
    ShortPeriodicCurve(usize),
    #[error("trim curve needs at least 2 segments")]
    ShortTrimCurve,
    #[error("knot parameter {0} outside the valid range")]
    KnotOutOfRange(f32),
    #[error("matrix primitive variables are not supported on NURBS")]
    MatrixPrimVarOnNurbs,
    #[error("split recursion limit exceeded")]
    SplitLimit,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
