//! End-to-end: RIB text in, framebuffer coverage out.

use mote::{Framebuffer, SceneBuilder};

fn build(src: &str) -> SceneBuilder {
    let mut builder = SceneBuilder::new();
    ribio::parse(src, &mut builder).expect("RIB parses");
    builder
}

fn render(src: &str) -> (SceneBuilder, Framebuffer) {
    let mut builder = build(src);
    let mut fb = Framebuffer::new(
        builder.context.options.x_res,
        builder.context.options.y_res,
        builder.context.options.bucket_size,
    );
    let items = std::mem::take(&mut builder.items);
    mote::render_surfaces(&builder.context, items, &mut fb);
    (builder, fb)
}

const SPHERE_SCENE: &str = r#"
Format 64 64 1
Projection "perspective" "fov" [60]
Clipping 0.1 100
Display "frame.tif" "file" "rgb"
WorldBegin
AttributeBegin
Color [1 0 0]
Translate 0 0 5
Sphere 1 -1 1 360
AttributeEnd
WorldEnd
"#;

#[test]
fn sphere_scene_covers_the_center() {
    let (builder, fb) = render(SPHERE_SCENE);
    assert!(builder.frame_complete);
    assert_eq!(builder.context.displays.len(), 1);
    assert_eq!(builder.context.displays[0].mode, "rgb");
    assert!(fb.coverage() > 0.05, "coverage {}", fb.coverage());
    // The red attribute color reaches the pixels through the default
    // surface shader.
    let center = fb
        .buckets()
        .find(|b| b.x_min <= 32 && 32 < b.x_min + b.width && b.y_min <= 32 && 32 < b.y_min + b.height)
        .unwrap();
    let local = (32 - center.y_min) * center.width + (32 - center.x_min);
    let px = center.rgba[local];
    assert!(px[0] > 0.5, "red channel {px:?}");
    assert!(px[1] < 0.1, "green channel {px:?}");
}

#[test]
fn patch_scene_renders() {
    let src = r#"
Format 32 32 1
Projection "perspective" "fov" [60]
WorldBegin
Patch "bilinear" "P" [-2 -2 4  2 -2 4  -2 2 4  2 2 4]
WorldEnd
"#;
    let (_, fb) = render(src);
    // A patch spanning most of the view fills the bulk of the pixels.
    assert!(fb.coverage() > 0.5, "coverage {}", fb.coverage());
}

#[test]
fn curves_scene_renders() {
    let src = r#"
Format 32 32 1
Projection "perspective" "fov" [60]
WorldBegin
Curves "linear" [2] "nonperiodic" "P" [0 -1 4  0 1 4] "constantwidth" [0.5]
WorldEnd
"#;
    let (_, fb) = render(src);
    assert!(fb.coverage() > 0.01, "coverage {}", fb.coverage());
}

#[test]
fn torus_scene_renders() {
    let src = r#"
Format 48 48 1
Projection "perspective" "fov" [60]
WorldBegin
Translate 0 0 6
Torus 2 0.5 0 360 360
WorldEnd
"#;
    let (_, fb) = render(src);
    assert!(fb.coverage() > 0.02, "coverage {}", fb.coverage());
}

#[test]
fn attribute_blocks_scope_shading_state() {
    let builder = build(
        r#"
WorldBegin
AttributeBegin
ShadingRate 4
Color [0 1 0]
AttributeEnd
WorldEnd
"#,
    );
    // Outside the block the defaults are restored.
    assert_eq!(builder.context.attrs().geom.shading_rate, 1.0);
    assert_eq!(builder.context.attrs().geom.color.y, 1.0);
}
