//! The REYES dispatcher: bound, cull, split-or-dice, shade, sample.

use crate::bucket::Framebuffer;
use crate::context::RenderContext;
use crate::shading::{shade_grid, ContextServices, ShaderBinding};
use glam::Mat4;
use mote_geom::{MicroGrid, SurfaceBox};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Recursion cap: a surface split this many times dices at maximum grid
/// size regardless of its footprint.
pub const MAX_SPLIT_DEPTH: u32 = 32;
/// Eye-plane splits before a straddling surface is discarded. Straddles
/// split four ways, so the piece count along the eye-plane contour grows
/// geometrically with this cap.
const MAX_EYE_SPLITS: u32 = 10;

/// One surface with its shader binding, queued for the dispatcher.
pub struct WorkItem {
    pub surface: SurfaceBox,
    pub binding: ShaderBinding,
    pub object_to_camera: Mat4,
}

#[derive(Default, Debug)]
pub struct RenderStats {
    pub surfaces: usize,
    pub grids: usize,
    pub splits: usize,
    pub discarded: usize,
}

/// Depth-first split traversal over the surface queue, shading grids as
/// they leave it.
pub fn render_surfaces(
    context: &RenderContext,
    items: Vec<WorkItem>,
    framebuffer: &mut Framebuffer,
) -> RenderStats {
    let mut stats = RenderStats::default();
    let cam_to_raster = context.camera_to_raster();
    let near = context.options.near;
    let far = context.options.far;

    let mut queue: VecDeque<WorkItem> = items.into();
    stats.surfaces = queue.len();

    while let Some(mut item) = queue.pop_front() {
        if context.abandon {
            stats.discarded += queue.len() + 1;
            break;
        }
        if item.surface.base().discard {
            stats.discarded += 1;
            continue;
        }

        // 1. Camera-space bound against the depth range.
        let bound = item.surface.bound();
        if bound.is_empty() || bound.outside_depth(near, far) {
            stats.discarded += 1;
            continue;
        }

        // 2/3. Eye-plane straddles force a split in both axes without
        // dicing.
        if bound.min.z < near {
            {
                let base = item.surface.base_mut();
                base.diceable_flag = false;
                base.eye_split_count += 1;
                if base.eye_split_count > MAX_EYE_SPLITS {
                    warn!(
                        surface = %base.name,
                        "discarded: cannot split away from the eye plane"
                    );
                    stats.discarded += 1;
                    continue;
                }
            }
            stats.splits += 1;
            item.surface.base_mut().split_dir = mote_geom::SplitDir::U;
            for mut child in item.surface.split() {
                child.base_mut().split_dir = mote_geom::SplitDir::V;
                for grandchild in child.split() {
                    queue.push_front(WorkItem {
                        surface: grandchild,
                        binding: item.binding.clone(),
                        object_to_camera: item.object_to_camera,
                    });
                }
            }
            continue;
        } else {
            // Raster-space cull once fully in front of the near plane.
            let raster = bound.transform(&cam_to_raster);
            if raster.max.x < 0.0
                || raster.min.x > context.options.x_res as f32
                || raster.max.y < 0.0
                || raster.min.y > context.options.y_res as f32
            {
                stats.discarded += 1;
                continue;
            }
        }

        // 4. Dice or split.
        let force_dice = item.surface.base().split_count >= MAX_SPLIT_DEPTH;
        if item.surface.diceable(&cam_to_raster) || force_dice {
            if force_dice {
                let gs = context.options.sqrt_grid_size as usize;
                let base = item.surface.base_mut();
                base.u_dice = base.u_dice.clamp(1, gs);
                base.v_dice = base.v_dice.clamp(1, gs);
                debug!(surface = %base.name, "split limit reached; dicing at cap");
            }
            let (u, v) = {
                let base = item.surface.base();
                (base.u_dice.max(1), base.v_dice.max(1))
            };
            let mut grid = MicroGrid::new(u, v);
            item.surface.dice(&mut grid);
            let services = ContextServices {
                context,
                object_to_camera: item.object_to_camera,
                shader_to_camera: item.object_to_camera,
            };
            match shade_grid(&mut grid, &item.binding, &services) {
                Ok(()) => {
                    framebuffer.sample_grid(&grid, &cam_to_raster);
                    stats.grids += 1;
                }
                Err(e) => {
                    // Fatal per surface: log and drop the grid.
                    warn!(surface = %item.surface.base().name, "shading failed: {e}");
                    stats.discarded += 1;
                }
            }
        } else if item.surface.base().discard {
            stats.discarded += 1;
        } else {
            stats.splits += 1;
            for child in item.surface.split() {
                queue.push_front(WorkItem {
                    surface: child,
                    binding: item.binding.clone(),
                    object_to_camera: item.object_to_camera,
                });
            }
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Projection;
    use glam::Vec3;
    use mote_geom::{Attributes, Quadric, Surface, SurfaceBase};
    use std::rc::Rc;

    fn sphere_at(z: f32, attrs: Attributes) -> SurfaceBox {
        let base = SurfaceBase::new("sphere", Rc::new(attrs));
        let mut q = Quadric::sphere(base, 1.0, -1.0, 1.0, 0.0, 360.0);
        q.transform(
            &Mat4::from_translation(Vec3::new(0.0, 0.0, z)),
            &Mat4::IDENTITY,
            &Mat4::IDENTITY,
        );
        Box::new(q)
    }

    fn test_context() -> RenderContext {
        let mut ctx = RenderContext::new();
        ctx.options.x_res = 64;
        ctx.options.y_res = 64;
        ctx.options.projection = Projection::Perspective { fov: 60.0 };
        ctx
    }

    #[test]
    fn sphere_renders_into_the_framebuffer() {
        let ctx = test_context();
        let mut fb = Framebuffer::new(64, 64, 16);
        let stats = render_surfaces(
            &ctx,
            vec![WorkItem {
                surface: sphere_at(5.0, Attributes::default()),
                binding: ShaderBinding::default(),
                object_to_camera: Mat4::from_translation(Vec3::new(0.0, 0.0, 5.0)),
            }],
            &mut fb,
        );
        assert!(stats.grids > 0, "{stats:?}");
        // A unit sphere at z=5 under a 60 degree fov covers a good chunk
        // of the image center.
        assert!(fb.coverage() > 0.05, "coverage {}", fb.coverage());
        let center = fb
            .buckets()
            .find(|b| b.x_min <= 32 && 32 < b.x_min + b.width && b.y_min <= 32 && 32 < b.y_min + b.height)
            .unwrap();
        let local = (32 - center.y_min) * center.width + (32 - center.x_min);
        assert!(center.rgba[local][3] > 0.0, "center pixel uncovered");
    }

    #[test]
    fn surfaces_behind_the_camera_are_discarded() {
        let ctx = test_context();
        let mut fb = Framebuffer::new(64, 64, 16);
        let stats = render_surfaces(
            &ctx,
            vec![WorkItem {
                surface: sphere_at(-10.0, Attributes::default()),
                binding: ShaderBinding::default(),
                object_to_camera: Mat4::IDENTITY,
            }],
            &mut fb,
        );
        assert_eq!(stats.grids, 0);
        assert_eq!(stats.discarded, 1);
        assert_eq!(fb.coverage(), 0.0);
    }

    #[test]
    fn abandon_skips_all_work() {
        let mut ctx = test_context();
        ctx.abandon = true;
        let mut fb = Framebuffer::new(64, 64, 16);
        let stats = render_surfaces(
            &ctx,
            vec![WorkItem {
                surface: sphere_at(5.0, Attributes::default()),
                binding: ShaderBinding::default(),
                object_to_camera: Mat4::IDENTITY,
            }],
            &mut fb,
        );
        assert_eq!(stats.grids, 0);
        assert_eq!(stats.discarded, 1);
    }

    #[test]
    fn eye_straddling_surfaces_split_until_discard() {
        let ctx = test_context();
        let mut fb = Framebuffer::new(64, 64, 16);
        // A sphere centered on the eye straddles the near plane everywhere;
        // the parts in front should still render without infinite loops.
        let stats = render_surfaces(
            &ctx,
            vec![WorkItem {
                surface: sphere_at(0.0, Attributes::default()),
                binding: ShaderBinding::default(),
                object_to_camera: Mat4::IDENTITY,
            }],
            &mut fb,
        );
        assert!(stats.splits > 0);
    }
}
