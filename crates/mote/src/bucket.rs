//! Bucketed framebuffer and the micropolygon point sampler.

use glam::{Mat4, Vec2, Vec3};
use mote_geom::MicroGrid;
use slx::EnvVar;

/// One image sample: nearest surface wins.
#[derive(Copy, Clone, Debug)]
struct Pixel {
    color: Vec3,
    alpha: f32,
    depth: f32,
    covered: bool,
}

impl Default for Pixel {
    fn default() -> Pixel {
        Pixel {
            color: Vec3::ZERO,
            alpha: 0.0,
            depth: f32::MAX,
            covered: false,
        }
    }
}

/// A z-buffered frame of pixels, delivered bucket by bucket.
pub struct Framebuffer {
    width: usize,
    height: usize,
    bucket_size: usize,
    pixels: Vec<Pixel>,
}

impl Framebuffer {
    pub fn new(width: usize, height: usize, bucket_size: usize) -> Framebuffer {
        Framebuffer {
            width,
            height,
            bucket_size: bucket_size.max(1),
            pixels: vec![Pixel::default(); width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Samples one shaded grid: every micropolygon is projected to raster
    /// space and tested against the pixel centers it covers. Trimmed holes
    /// and phantom-triangle halves are skipped by the grid flags.
    pub fn sample_grid(&mut self, grid: &MicroGrid, cam_to_raster: &Mat4) {
        let (u_res, v_res) = (grid.u_res(), grid.v_res());
        if u_res == 0 || v_res == 0 {
            return;
        }
        let env = grid.env();
        let p = env.var(EnvVar::P);
        let ci = env.var(EnvVar::Ci);
        let oi = env.var(EnvVar::Oi);
        let p = p.borrow();
        let ci = ci.borrow();
        let oi = oi.borrow();

        for iv in 0..v_res {
            for iu in 0..u_res {
                let lanes = [
                    grid.lane(iu, iv),
                    grid.lane(iu + 1, iv),
                    grid.lane(iu, iv + 1),
                    grid.lane(iu + 1, iv + 1),
                ];
                if lanes.iter().any(|l| grid.is_hole(*l)) {
                    continue;
                }
                let cam: Vec<Vec3> = lanes.iter().map(|l| p.get_triple(*l)).collect();
                // Behind the eye plane: the dispatcher should have split
                // this away, but guard the projection.
                if cam.iter().any(|c| c.z <= 0.0) {
                    continue;
                }
                let raster: Vec<Vec3> =
                    cam.iter().map(|c| cam_to_raster.project_point3(*c)).collect();
                let depth = cam.iter().map(|c| c.z).fold(f32::MAX, f32::min);

                // Flat color per micropolygon: the mean of its corners.
                let color = lanes.iter().map(|l| ci.get_triple(*l)).sum::<Vec3>() / 4.0;
                let opacity = lanes.iter().map(|l| oi.get_triple(*l)).sum::<Vec3>() / 4.0;
                let alpha = (opacity.x + opacity.y + opacity.z) / 3.0;

                let quad = [
                    Vec2::new(raster[0].x, raster[0].y),
                    Vec2::new(raster[1].x, raster[1].y),
                    Vec2::new(raster[3].x, raster[3].y),
                    Vec2::new(raster[2].x, raster[2].y),
                ];
                self.splat(&quad, depth, color, alpha);
            }
        }
    }

    fn splat(&mut self, quad: &[Vec2; 4], depth: f32, color: Vec3, alpha: f32) {
        let min_x = quad.iter().map(|p| p.x).fold(f32::MAX, f32::min);
        let max_x = quad.iter().map(|p| p.x).fold(f32::MIN, f32::max);
        let min_y = quad.iter().map(|p| p.y).fold(f32::MAX, f32::min);
        let max_y = quad.iter().map(|p| p.y).fold(f32::MIN, f32::max);
        let x0 = (min_x.floor().max(0.0)) as usize;
        let x1 = (max_x.ceil().min(self.width as f32)) as usize;
        let y0 = (min_y.floor().max(0.0)) as usize;
        let y1 = (max_y.ceil().min(self.height as f32)) as usize;
        for y in y0..y1 {
            for x in x0..x1 {
                let center = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
                if !point_in_quad(quad, center) {
                    continue;
                }
                let px = &mut self.pixels[y * self.width + x];
                if depth < px.depth {
                    px.depth = depth;
                    px.color = color;
                    px.alpha = alpha;
                    px.covered = true;
                }
            }
        }
    }

    /// Iterates buckets in scanline order, yielding delivery-ready pixel
    /// rectangles.
    pub fn buckets(&self) -> impl Iterator<Item = dspy::BucketPixels> + '_ {
        let bs = self.bucket_size;
        let nbx = self.width.div_ceil(bs);
        let nby = self.height.div_ceil(bs);
        (0..nbx * nby).map(move |bi| {
            let bx = (bi % nbx) * bs;
            let by = (bi / nbx) * bs;
            let w = bs.min(self.width - bx);
            let h = bs.min(self.height - by);
            let mut rgba = Vec::with_capacity(w * h);
            let mut depth = Vec::with_capacity(w * h);
            for y in by..by + h {
                for x in bx..bx + w {
                    let px = &self.pixels[y * self.width + x];
                    if px.covered {
                        // Premultiplied color for the wire.
                        rgba.push([px.color.x, px.color.y, px.color.z, px.alpha]);
                        depth.push(px.depth);
                    } else {
                        rgba.push([0.0, 0.0, 0.0, 0.0]);
                        depth.push(f32::MAX);
                    }
                }
            }
            dspy::BucketPixels {
                x_min: bx,
                y_min: by,
                width: w,
                height: h,
                rgba,
                depth,
            }
        })
    }

    pub fn coverage(&self) -> f32 {
        let covered = self.pixels.iter().filter(|p| p.covered).count();
        covered as f32 / self.pixels.len().max(1) as f32
    }
}

/// Point-in-convex-quad via consistent cross-product signs (both windings
/// accepted).
fn point_in_quad(quad: &[Vec2; 4], p: Vec2) -> bool {
    let mut sign = 0i32;
    for i in 0..4 {
        let a = quad[i];
        let b = quad[(i + 1) % 4];
        let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
        if cross.abs() < 1e-12 {
            continue;
        }
        let s = if cross > 0.0 { 1 } else { -1 };
        if sign == 0 {
            sign = s;
        } else if s != sign {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_containment() {
        let quad = [
            Vec2::new(0.0, 0.0),
            Vec2::new(4.0, 0.0),
            Vec2::new(4.0, 4.0),
            Vec2::new(0.0, 4.0),
        ];
        assert!(point_in_quad(&quad, Vec2::new(2.0, 2.0)));
        assert!(!point_in_quad(&quad, Vec2::new(5.0, 2.0)));
        // Reverse winding works too.
        let rev = [quad[3], quad[2], quad[1], quad[0]];
        assert!(point_in_quad(&rev, Vec2::new(2.0, 2.0)));
    }

    #[test]
    fn buckets_tile_the_image() {
        let fb = Framebuffer::new(10, 6, 4);
        let buckets: Vec<_> = fb.buckets().collect();
        assert_eq!(buckets.len(), 3 * 2);
        let total: usize = buckets.iter().map(|b| b.width * b.height).sum();
        assert_eq!(total, 60);
        // Edge buckets shrink.
        assert_eq!(buckets[2].width, 2);
        assert_eq!(buckets[5].height, 2);
    }

    #[test]
    fn nearer_surface_wins() {
        let mut fb = Framebuffer::new(4, 4, 4);
        let quad = [
            Vec2::new(0.0, 0.0),
            Vec2::new(4.0, 0.0),
            Vec2::new(4.0, 4.0),
            Vec2::new(0.0, 4.0),
        ];
        fb.splat(&quad, 10.0, Vec3::X, 1.0);
        fb.splat(&quad, 5.0, Vec3::Y, 1.0);
        fb.splat(&quad, 7.0, Vec3::Z, 1.0);
        let bucket = fb.buckets().next().unwrap();
        assert_eq!(bucket.rgba[0][1], 1.0);
        assert_eq!(bucket.depth[0], 5.0);
        assert_eq!(fb.coverage(), 1.0);
    }
}
