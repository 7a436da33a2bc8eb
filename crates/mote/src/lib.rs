//! The mote renderer: a REYES micropolygon pipeline fed by RIB streams,
//! shading through the `slx` virtual machine and delivering buckets over
//! the `dspy` display protocol.

pub mod bucket;
pub mod context;
pub mod reyes;
pub mod rib;
pub mod shading;

pub use bucket::Framebuffer;
pub use context::{Options, Projection, RenderContext};
pub use reyes::{render_surfaces, RenderStats, WorkItem};
pub use rib::SceneBuilder;
pub use shading::{shade_grid, ContextServices, ShaderBinding};
