//! Cross-surface invariant: every split child stays inside its parent's
//! bound, through repeated refinement.

use glam::{Vec3, Vec4};
use mote_geom::{
    Attributes, BicubicPatch, BilinearPatch, CurvesGroup, NurbsPatch, PrimVar, Quadric,
    QuadricKind, Surface, SurfaceBase, SurfaceBox,
};
use std::rc::Rc;

fn base(name: &str) -> SurfaceBase {
    SurfaceBase::new(name, Rc::new(Attributes::default()))
}

fn check_split_tree(surface: SurfaceBox, depth: usize) {
    let parent_bound = surface.bound();
    if depth == 0 {
        return;
    }
    for child in surface.split() {
        let cb = child.bound();
        assert!(
            parent_bound.contains(&cb),
            "{}: child {:?} escapes parent {:?}",
            surface.base().name,
            cb,
            parent_bound
        );
        check_split_tree(child, depth - 1);
    }
}

#[test]
fn quadric_split_trees_stay_bounded() {
    let kinds = vec![
        QuadricKind::Cylinder {
            radius: 1.0,
            z_min: -1.0,
            z_max: 1.0,
            theta_min: 0.0,
            theta_max: 360.0,
        },
        QuadricKind::Cone {
            height: 2.0,
            radius: 1.0,
            v_min: 0.0,
            v_max: 1.0,
            theta_min: 0.0,
            theta_max: 360.0,
        },
        QuadricKind::Torus {
            major: 2.0,
            minor: 0.5,
            phi_min: 0.0,
            phi_max: 360.0,
            theta_min: 0.0,
            theta_max: 360.0,
        },
        QuadricKind::Disk {
            height: 0.5,
            minor: 0.0,
            major: 1.0,
            theta_min: 0.0,
            theta_max: 360.0,
        },
    ];
    for kind in kinds {
        check_split_tree(Box::new(Quadric::new(base("quadric"), kind)), 3);
    }
    check_split_tree(
        Box::new(Quadric::sphere(base("sphere"), 1.0, -1.0, 1.0, 0.0, 360.0)),
        3,
    );
}

#[test]
fn patch_split_trees_stay_bounded() {
    let mut control = [Vec3::ZERO; 16];
    for iv in 0..4 {
        for iu in 0..4 {
            control[iv * 4 + iu] = Vec3::new(
                iu as f32 / 3.0,
                iv as f32 / 3.0,
                ((iu * iv) as f32 * 0.37).sin(),
            );
        }
    }
    check_split_tree(Box::new(BicubicPatch::new(base("bicubic"), control)), 4);
    check_split_tree(
        Box::new(BilinearPatch::new(
            base("bilinear"),
            [
                Vec3::ZERO,
                Vec3::new(1.0, 0.2, 0.0),
                Vec3::new(0.0, 1.0, 0.3),
                Vec3::new(1.0, 1.0, 0.0),
            ],
        )),
        4,
    );
}

#[test]
fn nurbs_split_trees_stay_bounded() {
    let mut points = Vec::new();
    for row in 0..3 {
        for col in 0..4 {
            points.push(Vec4::new(
                col as f32,
                row as f32,
                (col as f32 * 0.7).cos(),
                1.0,
            ));
        }
    }
    let patch = NurbsPatch::new(
        base("nurbs"),
        4,
        3,
        vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0],
        vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0],
        4,
        3,
        points,
    );
    check_split_tree(Box::new(patch), 3);
}

#[test]
fn curve_groups_split_into_bounded_segments() {
    let mut b = base("curves");
    b.primvars.push(PrimVar::points(&[
        Vec3::ZERO,
        Vec3::new(1.0, 1.0, 0.0),
        Vec3::new(2.0, -1.0, 0.5),
        Vec3::new(3.0, 0.0, 0.0),
    ]));
    let group = CurvesGroup::new(b, true, vec![4], false).unwrap();
    let parent = group.bound();
    for segment in group.split() {
        assert!(parent.contains(&segment.bound()));
        // One more level: shorter halves.
        for half in segment.split() {
            assert!(parent.contains(&half.bound()));
        }
    }
}
