//! Display-driver transport: the framed TCP message bus between the
//! renderer and its out-of-process framebuffers, the renderer-side manager,
//! and the client-side image buffer with TIFF output.

mod error;

pub mod client;
pub mod format;
pub mod image;
pub mod protocol;
pub mod server;

pub use client::{ClientRun, ClientState, DisplayClient};
pub use error::{Error, Result};
pub use format::SampleFormat;
pub use image::DisplayImage;
pub use protocol::{Message, OpenParams};
pub use server::{
    BucketPixels, DisplayManager, DisplayRegistry, DisplayRequest, CONFIG_PATH_ENV, DD_PORT_ENV,
};
