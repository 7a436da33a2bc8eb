//! Renderer-side display manager: spawns display clients, negotiates the
//! sample format, and ships buckets.

use crate::error::{Error, Result};
use crate::format::{promote_to_rgba, SampleFormat};
use crate::protocol::{Message, OpenParams};
use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Environment variable the renderer sets for spawned display clients.
pub const DD_PORT_ENV: &str = "AQSIS_DD_PORT";
/// Environment variable locating the display registry file.
pub const CONFIG_PATH_ENV: &str = "AQSIS_CONFIG_PATH";

/// Maps display type names to client executables; loaded from a
/// tab-separated `displays.ini` next to `AQSIS_CONFIG_PATH`.
pub struct DisplayRegistry {
    map: HashMap<String, PathBuf>,
    fallback: PathBuf,
}

impl DisplayRegistry {
    pub fn load() -> DisplayRegistry {
        let mut map = HashMap::new();
        if let Ok(dir) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(dir).join("displays.ini");
            if let Ok(text) = std::fs::read_to_string(&path) {
                for line in text.lines() {
                    let mut fields = line.split('\t').filter(|f| !f.is_empty());
                    if let (Some(name), Some(exe)) = (fields.next(), fields.next()) {
                        map.insert(name.to_string(), PathBuf::from(exe));
                    }
                }
            }
        }
        DisplayRegistry {
            map,
            fallback: PathBuf::from("dspy"),
        }
    }

    pub fn lookup(&self, display_type: &str) -> &PathBuf {
        self.map.get(display_type).unwrap_or(&self.fallback)
    }
}

/// One display requested by the RIB stream.
#[derive(Clone, Debug)]
pub struct DisplayRequest {
    pub name: String,
    pub display_type: String,
    /// Channel selection: "rgb", "rgba", "a", "z".
    pub mode: String,
    pub required: bool,
}

impl DisplayRequest {
    pub fn channels(&self) -> usize {
        if self.mode.contains('z') {
            1
        } else {
            let mut n = 0;
            if self.mode.contains("rgb") {
                n += 3;
            }
            if self.mode.contains('a') {
                n += 1;
            }
            n.max(1)
        }
    }
}

struct OpenDisplay {
    request: DisplayRequest,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    format: SampleFormat,
    child: Option<Child>,
    alive: bool,
}

/// A rectangle of final pixels ready for delivery: RGBA floats plus depth.
pub struct BucketPixels {
    pub x_min: usize,
    pub y_min: usize,
    pub width: usize,
    pub height: usize,
    /// width*height RGBA samples, premultiplied.
    pub rgba: Vec<[f32; 4]>,
    /// width*height depth samples.
    pub depth: Vec<f32>,
}

/// The socket-based display manager.
pub struct DisplayManager {
    listener: TcpListener,
    port: u16,
    displays: Vec<OpenDisplay>,
}

impl DisplayManager {
    /// Binds the listen socket; port 0 asks the system for a free one.
    pub fn bind(port: u16) -> Result<DisplayManager> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        let port = listener.local_addr()?.port();
        info!(port, "display manager listening");
        Ok(DisplayManager {
            listener,
            port,
            displays: Vec::new(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn display_count(&self) -> usize {
        self.displays.iter().filter(|d| d.alive).count()
    }

    /// Spawns a client for `request`, accepts its connection and walks the
    /// whole handshake through to Open.
    pub fn open_display(
        &mut self,
        request: DisplayRequest,
        registry: &DisplayRegistry,
        open: &OpenParams,
        world_to_camera: [f32; 16],
        world_to_screen: [f32; 16],
    ) -> Result<()> {
        let exe = registry.lookup(&request.display_type).clone();
        let child = Command::new(&exe)
            .env(DD_PORT_ENV, self.port.to_string())
            .spawn()
            .map_err(|e| Error::Spawn(exe.display().to_string(), e))?;
        self.attach(request, Some(child), open, world_to_camera, world_to_screen)
    }

    /// Accepts an already-running client (tests, remote viewers).
    pub fn attach(
        &mut self,
        request: DisplayRequest,
        child: Option<Child>,
        open: &OpenParams,
        world_to_camera: [f32; 16],
        world_to_screen: [f32; 16],
    ) -> Result<()> {
        let (stream, peer) = self.listener.accept()?;
        stream.set_nodelay(true).ok();
        debug!(%peer, display = %request.name, "display connected");
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream);

        let offer: Vec<i32> = SampleFormat::all().iter().map(|f| f.code()).collect();
        Message::FormatQuery(offer).write_to(&mut writer)?;
        let format = match Message::read_from(&mut reader)? {
            Message::FormatResponse(f) => f,
            other => {
                return Err(Error::Handshake {
                    expected: "FormatResponse",
                    got: other.name(),
                })
            }
        };
        Message::Filename(request.name.clone()).write_to(&mut writer)?;
        Message::Nl(world_to_camera).write_to(&mut writer)?;
        Message::Np(world_to_screen).write_to(&mut writer)?;
        let params = OpenParams {
            channels: request.channels() as i32,
            bits_per_sample: format.bits_per_sample(),
            ..*open
        };
        Message::Open(params).write_to(&mut writer)?;
        writer.flush()?;

        self.displays.push(OpenDisplay {
            request,
            reader,
            writer,
            format,
            child,
            alive: true,
        });
        Ok(())
    }

    /// Serializes one bucket in each display's negotiated format and mode
    /// and sends a Data message. A socket error abandons that display
    /// without affecting the others.
    pub fn send_bucket(&mut self, bucket: &BucketPixels) {
        for disp in &mut self.displays {
            if !disp.alive {
                continue;
            }
            let channels = disp.request.channels();
            let want_z = disp.request.mode.contains('z');
            let element_size = channels * disp.format.bytes_per_channel();
            let data = if !want_z && channels == 4 && disp.format == SampleFormat::Float32 {
                // Full float RGBA ships as raw bytes.
                rgba_bytes(&bucket.rgba).to_vec()
            } else {
                let mut data = Vec::with_capacity(bucket.rgba.len() * element_size);
                for (i, px) in bucket.rgba.iter().enumerate() {
                    if want_z {
                        disp.format.encode_sample(bucket.depth[i], &mut data);
                    } else {
                        let rgba = promote_to_rgba(&px[..]);
                        for sample in rgba.iter().take(channels) {
                            disp.format.encode_sample(*sample, &mut data);
                        }
                    }
                }
                data
            };
            let msg = Message::Data {
                x_min: bucket.x_min as i32,
                x_max_plus_1: (bucket.x_min + bucket.width) as i32,
                y_min: bucket.y_min as i32,
                y_max_plus_1: (bucket.y_min + bucket.height) as i32,
                element_size: element_size as i32,
                data,
            };
            if let Err(e) = msg.write_to(&mut disp.writer) {
                error!(display = %disp.request.name, "send failed: {e}; abandoning");
                disp.alive = false;
            }
        }
    }

    /// End of frame: Close every display and await the acknowledgements.
    pub fn close_all(&mut self) {
        for disp in &mut self.displays {
            if !disp.alive {
                continue;
            }
            if let Err(e) = Message::Close.write_to(&mut disp.writer) {
                warn!(display = %disp.request.name, "close failed: {e}");
                disp.alive = false;
                continue;
            }
            match Message::read_from(&mut disp.reader) {
                Ok(Message::CloseAcknowledge) => {}
                Ok(other) => warn!(
                    display = %disp.request.name,
                    "expected CloseAcknowledge, got {}",
                    other.name()
                ),
                Err(e) => warn!(display = %disp.request.name, "close ack failed: {e}"),
            }
            disp.alive = false;
        }
        self.reap();
    }

    /// Abandon: tell every open display to drop the frame.
    pub fn abandon_all(&mut self) {
        for disp in &mut self.displays {
            if disp.alive {
                Message::Abandon.write_to(&mut disp.writer).ok();
                disp.alive = false;
            }
        }
        self.reap();
    }

    fn reap(&mut self) {
        for disp in &mut self.displays {
            if let Some(child) = &mut disp.child {
                match child.wait() {
                    Ok(status) => debug!(display = %disp.request.name, %status, "client exited"),
                    Err(e) => warn!("waitpid failed: {e}"),
                }
                disp.child = None;
            }
        }
    }
}

/// Float RGBA as raw bytes; the fast path for Float32 buckets.
pub fn rgba_bytes(rgba: &[[f32; 4]]) -> &[u8] {
    bytemuck::cast_slice(rgba)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_channel_counts() {
        let mk = |mode: &str| DisplayRequest {
            name: "x".into(),
            display_type: "file".into(),
            mode: mode.into(),
            required: true,
        };
        assert_eq!(mk("rgb").channels(), 3);
        assert_eq!(mk("rgba").channels(), 4);
        assert_eq!(mk("a").channels(), 1);
        assert_eq!(mk("z").channels(), 1);
    }

    #[test]
    fn registry_falls_back_to_bundled_client() {
        let reg = DisplayRegistry {
            map: HashMap::new(),
            fallback: PathBuf::from("dspy"),
        };
        assert_eq!(reg.lookup("framebuffer"), &PathBuf::from("dspy"));
    }
}
