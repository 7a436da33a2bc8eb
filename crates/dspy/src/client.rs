//! Display-client connection: the state machine between Disconnected and
//! Closed, driven by the message stream from the renderer.

use crate::error::{Error, Result};
use crate::format::SampleFormat;
use crate::image::DisplayImage;
use crate::protocol::Message;
use std::io::{BufReader, BufWriter, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    /// Connected, format negotiated, waiting for Open.
    Opening,
    /// Streaming Data.
    Open,
    /// Close received, acknowledge sent.
    Closing,
    Closed,
}

/// Outcome of a completed client session.
pub struct ClientRun {
    /// Path the image was written to, when a Close arrived.
    pub saved: Option<PathBuf>,
    pub abandoned: bool,
}

pub struct DisplayClient {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    state: ClientState,
    format: SampleFormat,
    filename: PathBuf,
    image: Option<DisplayImage>,
    world_to_camera: [f32; 16],
    world_to_screen: [f32; 16],
}

impl DisplayClient {
    pub fn connect(host: &str, port: u16) -> Result<DisplayClient> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true).ok();
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream);
        Ok(DisplayClient {
            reader,
            writer,
            state: ClientState::Disconnected,
            format: SampleFormat::Float32,
            filename: PathBuf::from("untitled.tif"),
            image: None,
            world_to_camera: [0.0; 16],
            world_to_screen: [0.0; 16],
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn image(&self) -> Option<&DisplayImage> {
        self.image.as_ref()
    }

    /// Runs the protocol until Close or Abandon.
    pub fn run(&mut self) -> Result<ClientRun> {
        loop {
            let msg = Message::read_from(&mut self.reader)?;
            debug!(msg = msg.name(), "received");
            match msg {
                Message::FormatQuery(formats) => {
                    // Pick the first offered format we know.
                    let chosen = formats
                        .iter()
                        .find_map(|c| SampleFormat::from_code(*c).ok())
                        .unwrap_or(SampleFormat::Float32);
                    self.format = chosen;
                    Message::FormatResponse(chosen).write_to(&mut self.writer)?;
                    self.state = ClientState::Opening;
                }
                Message::Filename(name) => self.filename = PathBuf::from(name),
                Message::DisplayType(t) => debug!(display_type = %t),
                Message::Nl(m) => self.world_to_camera = m,
                Message::Np(m) => self.world_to_screen = m,
                Message::String(s) => info!(from_renderer = %s),
                Message::UserParam { name, .. } => {
                    debug!(param = %name, "ignoring user parameter")
                }
                Message::Open(params) => {
                    self.image = Some(DisplayImage::new(&params, self.format));
                    self.state = ClientState::Open;
                }
                Message::Data {
                    x_min,
                    x_max_plus_1,
                    y_min,
                    y_max_plus_1,
                    element_size,
                    data,
                } => match &mut self.image {
                    Some(img) => {
                        img.accept_data(x_min, x_max_plus_1, y_min, y_max_plus_1, element_size, &data)?
                    }
                    None => warn!("Data before Open ignored"),
                },
                Message::Close => {
                    self.state = ClientState::Closing;
                    let saved = match &self.image {
                        Some(img) => Some(img.save_tiff(&self.filename)?),
                        None => None,
                    };
                    Message::CloseAcknowledge.write_to(&mut self.writer)?;
                    self.writer.flush()?;
                    self.state = ClientState::Closed;
                    return Ok(ClientRun {
                        saved,
                        abandoned: false,
                    });
                }
                Message::Abandon => {
                    self.state = ClientState::Closed;
                    return Ok(ClientRun {
                        saved: None,
                        abandoned: true,
                    });
                }
                other => {
                    return Err(Error::Handshake {
                        expected: "server-side message",
                        got: other.name(),
                    })
                }
            }
        }
    }
}
