//! Deterministic pseudo-noise fields.
//!
//! Lattice gradient noise in one to four dimensions remapped to [0, 1],
//! plus cell noise and periodic variants that tile with a caller-supplied
//! period. The permutation is fixed so results are reproducible across runs
//! and machines.

use glam::Vec3;

const PERM_SIZE: usize = 256;

// Fixed permutation table, generated once from a Fibonacci-style shuffle.
fn perm(i: i32) -> usize {
    static TABLE: [u8; PERM_SIZE] = {
        let mut t = [0u8; PERM_SIZE];
        let mut i = 0;
        while i < PERM_SIZE {
            t[i] = i as u8;
            i += 1;
        }
        // Deterministic swap walk.
        let mut state = 0x9e37u32;
        let mut i = PERM_SIZE - 1;
        while i > 0 {
            state = state.wrapping_mul(0x6c07_8965).wrapping_add(0x5bd1);
            let j = (state >> 16) as usize % (i + 1);
            let tmp = t[i];
            t[i] = t[j];
            t[j] = tmp;
            i -= 1;
        }
        t
    };
    TABLE[(i & (PERM_SIZE as i32 - 1)) as usize] as usize
}

fn hash4(x: i32, y: i32, z: i32, w: i32) -> usize {
    perm(x.wrapping_add(perm(y.wrapping_add(perm(z.wrapping_add(perm(w) as i32)) as i32)) as i32))
}

fn grad(h: usize, x: f32, y: f32, z: f32, w: f32) -> f32 {
    // Gradient picked from a small signed set per lattice point.
    let h = h & 31;
    let u = if h < 24 { x } else { y };
    let v = if h < 16 { y } else { z };
    let s = if h < 8 { z } else { w };
    let a = if h & 1 == 0 { u } else { -u };
    let b = if h & 2 == 0 { v } else { -v };
    let c = if h & 4 == 0 { s } else { -s };
    a + b + c
}

fn fade(t: f32) -> f32 {
    t * t * t * (t * (t * 6.0 - 15.0) + 10.0)
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Raw signed 4D gradient noise in roughly [-1, 1].
fn gradient4(x: f32, y: f32, z: f32, w: f32) -> f32 {
    let (xi, yi, zi, wi) = (
        x.floor() as i32,
        y.floor() as i32,
        z.floor() as i32,
        w.floor() as i32,
    );
    let (xf, yf, zf, wf) = (x - x.floor(), y - y.floor(), z - z.floor(), w - w.floor());
    let (u, v, s, t) = (fade(xf), fade(yf), fade(zf), fade(wf));

    let mut corner = [0.0f32; 16];
    for (idx, c) in corner.iter_mut().enumerate() {
        let dx = (idx & 1) as i32;
        let dy = ((idx >> 1) & 1) as i32;
        let dz = ((idx >> 2) & 1) as i32;
        let dw = ((idx >> 3) & 1) as i32;
        let h = hash4(xi + dx, yi + dy, zi + dz, wi + dw);
        *c = grad(
            h,
            xf - dx as f32,
            yf - dy as f32,
            zf - dz as f32,
            wf - dw as f32,
        );
    }
    let x00 = lerp(lerp(corner[0], corner[1], u), lerp(corner[2], corner[3], u), v);
    let x01 = lerp(lerp(corner[4], corner[5], u), lerp(corner[6], corner[7], u), v);
    let x10 = lerp(lerp(corner[8], corner[9], u), lerp(corner[10], corner[11], u), v);
    let x11 = lerp(
        lerp(corner[12], corner[13], u),
        lerp(corner[14], corner[15], u),
        v,
    );
    lerp(lerp(x00, x01, s), lerp(x10, x11, s), t)
}

fn remap(v: f32) -> f32 {
    (v.clamp(-1.0, 1.0) + 1.0) * 0.5
}

pub fn noise1(x: f32) -> f32 {
    remap(gradient4(x, 0.0, 0.0, 0.0))
}

pub fn noise2(x: f32, y: f32) -> f32 {
    remap(gradient4(x, y, 0.0, 0.0))
}

pub fn noise3(p: Vec3) -> f32 {
    remap(gradient4(p.x, p.y, p.z, 0.0))
}

pub fn noise4(p: Vec3, t: f32) -> f32 {
    remap(gradient4(p.x, p.y, p.z, t))
}

/// Vector-valued noise built from three offset scalar fields.
pub fn vnoise3(p: Vec3) -> Vec3 {
    Vec3::new(
        noise3(p),
        noise3(p + Vec3::splat(7.13)),
        noise3(p + Vec3::splat(13.55)),
    )
}

pub fn vnoise1(x: f32) -> Vec3 {
    Vec3::new(noise1(x), noise1(x + 7.13), noise1(x + 13.55))
}

pub fn vnoise2(x: f32, y: f32) -> Vec3 {
    Vec3::new(
        noise2(x, y),
        noise2(x + 7.13, y + 3.1),
        noise2(x + 13.55, y + 5.2),
    )
}

pub fn vnoise4(p: Vec3, t: f32) -> Vec3 {
    Vec3::new(
        noise4(p, t),
        noise4(p + Vec3::splat(7.13), t),
        noise4(p + Vec3::splat(13.55), t),
    )
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Periodic variants: lattice coordinates wrap with the given period, so the
// field tiles exactly.

fn wrap(x: f32, period: f32) -> f32 {
    if period >= 1.0 {
        x.rem_euclid(period)
    } else {
        x
    }
}

pub fn pnoise1(x: f32, period: f32) -> f32 {
    noise1(wrap(x, period))
}

pub fn pnoise2(x: f32, y: f32, px: f32, py: f32) -> f32 {
    noise2(wrap(x, px), wrap(y, py))
}

pub fn pnoise3(p: Vec3, period: Vec3) -> f32 {
    noise3(Vec3::new(
        wrap(p.x, period.x),
        wrap(p.y, period.y),
        wrap(p.z, period.z),
    ))
}

pub fn pnoise4(p: Vec3, t: f32, period: Vec3, pt: f32) -> f32 {
    noise4(
        Vec3::new(wrap(p.x, period.x), wrap(p.y, period.y), wrap(p.z, period.z)),
        wrap(t, pt),
    )
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Cell noise: constant within each unit cell.

fn cell_hash(x: i32, y: i32, z: i32, w: i32) -> f32 {
    hash4(x, y, z, w) as f32 / (PERM_SIZE - 1) as f32
}

pub fn cellnoise1(x: f32) -> f32 {
    cell_hash(x.floor() as i32, 0, 0, 0)
}

pub fn cellnoise2(x: f32, y: f32) -> f32 {
    cell_hash(x.floor() as i32, y.floor() as i32, 0, 0)
}

pub fn cellnoise3(p: Vec3) -> f32 {
    cell_hash(p.x.floor() as i32, p.y.floor() as i32, p.z.floor() as i32, 0)
}

pub fn cellnoise4(p: Vec3, t: f32) -> f32 {
    cell_hash(
        p.x.floor() as i32,
        p.y.floor() as i32,
        p.z.floor() as i32,
        t.floor() as i32,
    )
}

pub fn vcellnoise3(p: Vec3) -> Vec3 {
    Vec3::new(
        cellnoise3(p),
        cellnoise3(p + Vec3::splat(31.0)),
        cellnoise3(p + Vec3::splat(61.0)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_is_deterministic() {
        assert_eq!(noise3(Vec3::new(1.3, 2.7, 0.5)), noise3(Vec3::new(1.3, 2.7, 0.5)));
    }

    #[test]
    fn noise_in_unit_range() {
        for i in 0..100 {
            let v = noise2(i as f32 * 0.37, i as f32 * 0.61);
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn periodic_noise_tiles() {
        let a = pnoise2(0.3, 0.6, 4.0, 4.0);
        let b = pnoise2(4.3, 0.6, 4.0, 4.0);
        let c = pnoise2(0.3, 8.6, 4.0, 4.0);
        assert!((a - b).abs() < 1e-4);
        assert!((a - c).abs() < 1e-4);
    }

    #[test]
    fn cellnoise_constant_within_cell() {
        assert_eq!(cellnoise2(2.1, 3.2), cellnoise2(2.9, 3.9));
        assert_ne!(cellnoise2(2.1, 3.2), cellnoise2(3.1, 3.2));
    }
}
