//! Cubic basis matrices and conversion to the Bezier basis.
//!
//! A cubic span evaluates as `U · M · G` with `U = [u³, u², u, 1]`; all
//! splitting and dicing happens in the Bezier basis, so control values in
//! any other basis are converted on ingest with `M_user · M_bezier⁻¹`.

use glam::Mat4;

/// The standard cubic bases with their RenderMan step values.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum CubicBasis {
    Bezier,
    BSpline,
    CatmullRom,
    Hermite,
    Power,
    Custom(Mat4),
}

// Row-major basis coefficient tables.
const BEZIER: [[f32; 4]; 4] = [
    [-1.0, 3.0, -3.0, 1.0],
    [3.0, -6.0, 3.0, 0.0],
    [-3.0, 3.0, 0.0, 0.0],
    [1.0, 0.0, 0.0, 0.0],
];

const BSPLINE: [[f32; 4]; 4] = [
    [-1.0 / 6.0, 0.5, -0.5, 1.0 / 6.0],
    [0.5, -1.0, 0.5, 0.0],
    [-0.5, 0.0, 0.5, 0.0],
    [1.0 / 6.0, 2.0 / 3.0, 1.0 / 6.0, 0.0],
];

const CATMULL_ROM: [[f32; 4]; 4] = [
    [-0.5, 1.5, -1.5, 0.5],
    [1.0, -2.5, 2.0, -0.5],
    [-0.5, 0.0, 0.5, 0.0],
    [0.0, 1.0, 0.0, 0.0],
];

const HERMITE: [[f32; 4]; 4] = [
    [2.0, 1.0, -2.0, 1.0],
    [-3.0, -2.0, 3.0, -1.0],
    [0.0, 1.0, 0.0, 0.0],
    [1.0, 0.0, 0.0, 0.0],
];

const POWER: [[f32; 4]; 4] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

fn mat_from_rows(rows: &[[f32; 4]; 4]) -> Mat4 {
    Mat4::from_cols_array_2d(rows).transpose()
}

impl CubicBasis {
    pub fn from_name(name: &str) -> Option<CubicBasis> {
        Some(match name {
            "bezier" => CubicBasis::Bezier,
            "b-spline" | "bspline" => CubicBasis::BSpline,
            "catmull-rom" => CubicBasis::CatmullRom,
            "hermite" => CubicBasis::Hermite,
            "power" => CubicBasis::Power,
            _ => return None,
        })
    }

    /// Row-major basis matrix.
    pub fn matrix(&self) -> Mat4 {
        match self {
            CubicBasis::Bezier => mat_from_rows(&BEZIER),
            CubicBasis::BSpline => mat_from_rows(&BSPLINE),
            CubicBasis::CatmullRom => mat_from_rows(&CATMULL_ROM),
            CubicBasis::Hermite => mat_from_rows(&HERMITE),
            CubicBasis::Power => mat_from_rows(&POWER),
            CubicBasis::Custom(m) => *m,
        }
    }

    /// The default vertex step between spans.
    pub fn step(&self) -> usize {
        match self {
            CubicBasis::Bezier => 3,
            CubicBasis::BSpline | CubicBasis::CatmullRom => 1,
            CubicBasis::Hermite => 2,
            CubicBasis::Power => 4,
            CubicBasis::Custom(_) => 1,
        }
    }

    /// The change-of-basis matrix `M_bezier⁻¹ · M_self`: applied to a span
    /// of control values it re-expresses them in Bezier.
    pub fn to_bezier(&self) -> Mat4 {
        mat_from_rows(&BEZIER).inverse() * self.matrix()
    }
}

/// Converts a 4×4 coordinate matrix of control scalars from `(u_basis,
/// v_basis)` to Bezier: `Tᵤ · C · Tᵥᵀ`.
pub fn control_conversion(u_basis: &CubicBasis, v_basis: &CubicBasis, coords: Mat4) -> Mat4 {
    u_basis.to_bezier() * coords * v_basis.to_bezier().transpose()
}

/// Converts one cubic span (four control scalars) between bases.
pub fn span_to_bezier(basis: &CubicBasis, g: [f32; 4]) -> [f32; 4] {
    let conv = basis.to_bezier();
    let mut out = [0.0f32; 4];
    for (r, o) in out.iter_mut().enumerate() {
        for (c, gv) in g.iter().enumerate() {
            *o += conv.row(r)[c] * gv;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    fn eval_cubic(m: Mat4, g: [f32; 4], u: f32) -> f32 {
        let basis = m * Vec4::new(g[0], g[1], g[2], g[3]);
        Vec4::new(u * u * u, u * u, u, 1.0).dot(basis)
    }

    #[test]
    fn bezier_conversion_is_identity() {
        let conv = CubicBasis::Bezier.to_bezier();
        assert!((conv - Mat4::IDENTITY).abs_diff_eq(Mat4::ZERO, 1e-5));
    }

    #[test]
    fn bspline_span_matches_after_conversion() {
        let g = [0.0, 1.0, 3.0, 2.0];
        let bez = span_to_bezier(&CubicBasis::BSpline, g);
        for i in 0..=8 {
            let u = i as f32 / 8.0;
            let direct = eval_cubic(CubicBasis::BSpline.matrix(), g, u);
            let via_bezier = eval_cubic(CubicBasis::Bezier.matrix(), bez, u);
            assert!(
                (direct - via_bezier).abs() < 1e-5,
                "u={u}: {direct} vs {via_bezier}"
            );
        }
    }

    #[test]
    fn catmull_rom_span_matches_after_conversion() {
        let g = [-1.0, 0.0, 1.0, 4.0];
        let bez = span_to_bezier(&CubicBasis::CatmullRom, g);
        for i in 0..=8 {
            let u = i as f32 / 8.0;
            let direct = eval_cubic(CubicBasis::CatmullRom.matrix(), g, u);
            let via_bezier = eval_cubic(CubicBasis::Bezier.matrix(), bez, u);
            assert!((direct - via_bezier).abs() < 1e-5);
        }
    }
}
