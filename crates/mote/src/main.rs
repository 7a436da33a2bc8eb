//! The renderer entry point: parse RIB, render the frame, deliver buckets
//! to the requested displays.
//!
//! Exit codes: 0 on a clean end of frame, 1 on a RIB parse or fatal shader
//! error, 2 when the display protocol fails with no displays remaining.

use anyhow::Context as _;
use mote::{Framebuffer, SceneBuilder};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

struct Args {
    files: Vec<PathBuf>,
    port: u16,
    /// Render without any display connection (statistics only).
    no_display: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        files: Vec::new(),
        port: 0,
        no_display: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(a) = it.next() {
        match a.as_str() {
            "-p" => {
                let p = it.next().context("-p needs a port")?;
                args.port = p.parse().context("invalid port")?;
            }
            "-nd" => args.no_display = true,
            other => args.files.push(PathBuf::from(other)),
        }
    }
    anyhow::ensure!(!args.files.is_empty(), "usage: mote [-p port] [-nd] file.rib…");
    Ok(args)
}

fn render_file(path: &PathBuf, args: &Args) -> anyhow::Result<u8> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut builder = SceneBuilder::new();
    builder.context.options.display_port = args.port;
    if let Err(e) = ribio::parse(&source, &mut builder) {
        error!("RIB parse failed: {e}");
        return Ok(1);
    }
    if !builder.frame_complete {
        warn!("stream ended without WorldEnd; rendering what was declared");
    }

    let SceneBuilder { context, items, .. } = builder;
    let mut framebuffer = Framebuffer::new(
        context.options.x_res,
        context.options.y_res,
        context.options.bucket_size,
    );
    let stats = mote::render_surfaces(&context, items, &mut framebuffer);
    info!(?stats, coverage = framebuffer.coverage(), "frame rendered");

    if args.no_display || context.displays.is_empty() {
        return Ok(0);
    }

    // Open the requested displays and ship the buckets.
    let registry = dspy::DisplayRegistry::load();
    let mut manager = dspy::DisplayManager::bind(context.options.display_port)
        .context("binding the display port")?;
    // All-zero quantization selects float output, as the display drivers
    // understand it.
    let opts = &context.options;
    let bits = if opts.quantize_one == 0 && opts.quantize_min == 0 && opts.quantize_max == 0 {
        32
    } else {
        8
    };
    let open = dspy::OpenParams {
        x_res: context.options.x_res as i32,
        y_res: context.options.y_res as i32,
        channels: 4,
        bits_per_sample: bits,
        crop_x_min: (context.options.crop.0 * context.options.x_res as f32) as i32,
        crop_x_max: (context.options.crop.1 * context.options.x_res as f32) as i32,
        crop_y_min: (context.options.crop.2 * context.options.y_res as f32) as i32,
        crop_y_max: (context.options.crop.3 * context.options.y_res as f32) as i32,
    };
    let world_to_camera = context.world_to_camera.to_cols_array();
    let world_to_screen = (context.camera_to_screen() * context.world_to_camera).to_cols_array();

    let mut any_required_failed = false;
    for request in context.displays.clone() {
        let required = request.required;
        if let Err(e) =
            manager.open_display(request, &registry, &open, world_to_camera, world_to_screen)
        {
            warn!("display failed to open: {e}");
            any_required_failed |= required;
        }
    }
    if manager.display_count() == 0 {
        error!("no displays could be opened");
        return Ok(if any_required_failed { 2 } else { 0 });
    }

    if context.abandon {
        manager.abandon_all();
        return Ok(0);
    }
    for bucket in framebuffer.buckets() {
        manager.send_bucket(&bucket);
    }
    manager.close_all();
    if manager.display_count() == 0 && any_required_failed {
        return Ok(2);
    }
    Ok(0)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };
    let mut worst = 0u8;
    for file in &args.files {
        match render_file(file, &args) {
            Ok(code) => worst = worst.max(code),
            Err(e) => {
                error!("{e:#}");
                worst = worst.max(1);
            }
        }
    }
    ExitCode::from(worst)
}
