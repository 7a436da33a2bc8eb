//! Scalar math with shading-language semantics.
//!
//! Domain faults do not abort: out-of-range inputs clamp or produce the
//! neutral value so a bad lane never kills a grid.

use glam::{Mat4, Vec3};

/// Shading-language `mod`: result takes the sign of `b`.
pub fn mod_rm(a: f32, b: f32) -> f32 {
    if b == 0.0 {
        return 0.0;
    }
    a - b * (a / b).floor()
}

pub fn clamp(x: f32, lo: f32, hi: f32) -> f32 {
    x.max(lo).min(hi)
}

pub fn step(edge: f32, x: f32) -> f32 {
    if x < edge {
        0.0
    } else {
        1.0
    }
}

pub fn smoothstep(e0: f32, e1: f32, x: f32) -> f32 {
    if e0 >= e1 {
        return step(e0, x);
    }
    let t = clamp((x - e0) / (e1 - e0), 0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

pub fn mix(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

pub fn mix_v(a: Vec3, b: Vec3, t: f32) -> Vec3 {
    a + (b - a) * t
}

/// `acos` clamped into its domain.
pub fn safe_acos(x: f32) -> f32 {
    clamp(x, -1.0, 1.0).acos()
}

pub fn safe_asin(x: f32) -> f32 {
    clamp(x, -1.0, 1.0).asin()
}

/// `sqrt` of a negative input yields 0 rather than NaN.
pub fn safe_sqrt(x: f32) -> f32 {
    if x > 0.0 {
        x.sqrt()
    } else {
        0.0
    }
}

pub fn safe_inversesqrt(x: f32) -> f32 {
    if x > 0.0 {
        1.0 / x.sqrt()
    } else {
        0.0
    }
}

pub fn safe_log(x: f32) -> f32 {
    if x > 0.0 {
        x.ln()
    } else {
        0.0
    }
}

pub fn safe_log2(x: f32) -> f32 {
    if x > 0.0 {
        x.log2()
    } else {
        0.0
    }
}

pub fn safe_div(a: f32, b: f32) -> f32 {
    if b == 0.0 {
        0.0
    } else {
        a / b
    }
}

pub fn safe_div_v(a: Vec3, b: Vec3) -> Vec3 {
    Vec3::new(safe_div(a.x, b.x), safe_div(a.y, b.y), safe_div(a.z, b.z))
}

pub fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Normalize that leaves zero-length vectors untouched.
pub fn safe_normalize(v: Vec3) -> Vec3 {
    let len2 = v.length_squared();
    if len2 > 0.0 {
        v / len2.sqrt()
    } else {
        v
    }
}

/// `faceforward(n, i, nref)`: flips `n` to oppose `i` relative to `nref`.
pub fn faceforward(n: Vec3, i: Vec3, nref: Vec3) -> Vec3 {
    if i.dot(nref) < 0.0 {
        n
    } else {
        -n
    }
}

pub fn reflect(i: Vec3, n: Vec3) -> Vec3 {
    i - 2.0 * i.dot(n) * n
}

/// Refraction of `i` about `n` with relative index `eta`; total internal
/// reflection yields the zero vector.
pub fn refract(i: Vec3, n: Vec3, eta: f32) -> Vec3 {
    let idotn = i.dot(n);
    let k = 1.0 - eta * eta * (1.0 - idotn * idotn);
    if k < 0.0 {
        Vec3::ZERO
    } else {
        eta * i - (eta * idotn + k.sqrt()) * n
    }
}

/// Fresnel reflectance/transmittance for unpolarized light.
pub fn fresnel(i: Vec3, n: Vec3, eta: f32) -> (f32, f32) {
    let cos_theta = -i.dot(n).clamp(-1.0, 1.0);
    let sin2_t = eta * eta * (1.0 - cos_theta * cos_theta);
    if sin2_t > 1.0 {
        return (1.0, 0.0);
    }
    let cos_t = (1.0 - sin2_t).sqrt();
    let r_par = (cos_theta - eta * cos_t) / (cos_theta + eta * cos_t);
    let r_perp = (eta * cos_theta - cos_t) / (eta * cos_theta + cos_t);
    let kr = clamp(0.5 * (r_par * r_par + r_perp * r_perp), 0.0, 1.0);
    (kr, 1.0 - kr)
}

/// Distance from `q` to the segment `p0`..`p1`.
pub fn pt_lined(p0: Vec3, p1: Vec3, q: Vec3) -> f32 {
    let d = p1 - p0;
    let len2 = d.length_squared();
    if len2 == 0.0 {
        return (q - p0).length();
    }
    let t = clamp((q - p0).dot(d) / len2, 0.0, 1.0);
    (q - (p0 + t * d)).length()
}

/// Rotates `q` by `angle` radians about the axis through `p0` and `p1`.
pub fn rotate_about(q: Vec3, angle: f32, p0: Vec3, p1: Vec3) -> Vec3 {
    let axis = safe_normalize(p1 - p0);
    let rot = Mat4::from_axis_angle(axis, angle);
    p0 + rot.transform_vector3(q - p0)
}

pub fn rgb_to_hsv(c: Vec3) -> Vec3 {
    let maxc = c.x.max(c.y).max(c.z);
    let minc = c.x.min(c.y).min(c.z);
    let v = maxc;
    let delta = maxc - minc;
    if delta == 0.0 {
        return Vec3::new(0.0, 0.0, v);
    }
    let s = delta / maxc;
    let h = if maxc == c.x {
        ((c.y - c.z) / delta).rem_euclid(6.0)
    } else if maxc == c.y {
        (c.z - c.x) / delta + 2.0
    } else {
        (c.x - c.y) / delta + 4.0
    } / 6.0;
    Vec3::new(h, s, v)
}

pub fn hsv_to_rgb(c: Vec3) -> Vec3 {
    let (h, s, v) = (c.x * 6.0, c.y, c.z);
    let i = h.floor();
    let f = h - i;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match (i as i32).rem_euclid(6) {
        0 => Vec3::new(v, t, p),
        1 => Vec3::new(q, v, p),
        2 => Vec3::new(p, v, t),
        3 => Vec3::new(p, q, v),
        4 => Vec3::new(t, p, v),
        _ => Vec3::new(v, p, q),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mod_takes_divisor_sign() {
        assert_eq!(mod_rm(5.0, 3.0), 2.0);
        assert_eq!(mod_rm(-1.0, 3.0), 2.0);
        assert_eq!(mod_rm(1.0, -3.0), -2.0);
        assert_eq!(mod_rm(1.0, 0.0), 0.0);
    }

    #[test]
    fn smoothstep_ends() {
        assert_eq!(smoothstep(0.0, 1.0, -1.0), 0.0);
        assert_eq!(smoothstep(0.0, 1.0, 2.0), 1.0);
        assert!((smoothstep(0.0, 1.0, 0.5) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn domain_faults_are_neutral() {
        assert_eq!(safe_sqrt(-4.0), 0.0);
        assert_eq!(safe_log(-1.0), 0.0);
        assert_eq!(safe_div(1.0, 0.0), 0.0);
        assert_eq!(safe_acos(2.0), 0.0);
    }

    #[test]
    fn reflect_mirrors() {
        let r = reflect(Vec3::new(1.0, -1.0, 0.0), Vec3::Y);
        assert!((r - Vec3::new(1.0, 1.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn total_internal_reflection_is_zero() {
        let i = Vec3::new(1.0, -0.01, 0.0).normalize();
        assert_eq!(refract(i, Vec3::Y, 1.8), Vec3::ZERO);
    }

    #[test]
    fn hsv_round_trip() {
        let c = Vec3::new(0.2, 0.6, 0.9);
        let back = hsv_to_rgb(rgb_to_hsv(c));
        assert!((back - c).length() < 1e-5);
    }
}
