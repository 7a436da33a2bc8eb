//! The display-driver wire format.
//!
//! Length-prefixed binary records over a localhost TCP stream: a 4-byte
//! message id and a 4-byte total length in native byte order, then a packed
//! body. Variable-length tails carry their own byte length.

use crate::error::{Error, Result};
use crate::format::SampleFormat;
use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

pub const MSG_STRING: i32 = 0;
pub const MSG_FORMAT_QUERY: i32 = 1;
pub const MSG_DATA: i32 = 2;
pub const MSG_OPEN: i32 = 3;
pub const MSG_CLOSE: i32 = 4;
pub const MSG_FILENAME: i32 = 5;
pub const MSG_NL: i32 = 6;
pub const MSG_NP: i32 = 7;
pub const MSG_DISPLAY_TYPE: i32 = 8;
pub const MSG_ABANDON: i32 = 9;
pub const MSG_USER_PARAM: i32 = 10;
pub const MSG_FORMAT_RESPONSE: i32 = 0x8001;
pub const MSG_CLOSE_ACKNOWLEDGE: i32 = 0x8002;

/// Sanity cap on message bodies (a full float RGBA 16k×16k bucket row is
/// far below this).
const MAX_MESSAGE: i32 = 256 * 1024 * 1024;

/// Image geometry carried by the Open message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OpenParams {
    pub x_res: i32,
    pub y_res: i32,
    pub channels: i32,
    pub bits_per_sample: i32,
    pub crop_x_min: i32,
    pub crop_x_max: i32,
    pub crop_y_min: i32,
    pub crop_y_max: i32,
}

/// One framed display message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    String(String),
    FormatQuery(Vec<i32>),
    Data {
        x_min: i32,
        x_max_plus_1: i32,
        y_min: i32,
        y_max_plus_1: i32,
        element_size: i32,
        data: Vec<u8>,
    },
    Open(OpenParams),
    Close,
    Filename(String),
    /// World-to-camera matrix.
    Nl([f32; 16]),
    /// World-to-screen matrix.
    Np([f32; 16]),
    DisplayType(String),
    Abandon,
    UserParam {
        data_type: i32,
        count: i32,
        name: String,
        data: Vec<u8>,
    },
    FormatResponse(SampleFormat),
    CloseAcknowledge,
}

impl Message {
    pub fn id(&self) -> i32 {
        match self {
            Message::String(_) => MSG_STRING,
            Message::FormatQuery(_) => MSG_FORMAT_QUERY,
            Message::Data { .. } => MSG_DATA,
            Message::Open(_) => MSG_OPEN,
            Message::Close => MSG_CLOSE,
            Message::Filename(_) => MSG_FILENAME,
            Message::Nl(_) => MSG_NL,
            Message::Np(_) => MSG_NP,
            Message::DisplayType(_) => MSG_DISPLAY_TYPE,
            Message::Abandon => MSG_ABANDON,
            Message::UserParam { .. } => MSG_USER_PARAM,
            Message::FormatResponse(_) => MSG_FORMAT_RESPONSE,
            Message::CloseAcknowledge => MSG_CLOSE_ACKNOWLEDGE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::String(_) => "String",
            Message::FormatQuery(_) => "FormatQuery",
            Message::Data { .. } => "Data",
            Message::Open(_) => "Open",
            Message::Close => "Close",
            Message::Filename(_) => "Filename",
            Message::Nl(_) => "Nl",
            Message::Np(_) => "NP",
            Message::DisplayType(_) => "DisplayType",
            Message::Abandon => "Abandon",
            Message::UserParam { .. } => "UserParam",
            Message::FormatResponse(_) => "FormatResponse",
            Message::CloseAcknowledge => "CloseAcknowledge",
        }
    }

    fn body(&self) -> Result<Vec<u8>> {
        let mut b = Vec::new();
        match self {
            Message::String(s) | Message::Filename(s) | Message::DisplayType(s) => {
                b.write_i32::<NativeEndian>(s.len() as i32)?;
                b.write_all(s.as_bytes())?;
            }
            Message::FormatQuery(formats) => {
                b.write_i32::<NativeEndian>(formats.len() as i32)?;
                for f in formats {
                    b.write_i32::<NativeEndian>(*f)?;
                }
            }
            Message::Data {
                x_min,
                x_max_plus_1,
                y_min,
                y_max_plus_1,
                element_size,
                data,
            } => {
                for v in [x_min, x_max_plus_1, y_min, y_max_plus_1, element_size] {
                    b.write_i32::<NativeEndian>(*v)?;
                }
                b.write_i32::<NativeEndian>(data.len() as i32)?;
                b.write_all(data)?;
            }
            Message::Open(p) => {
                for v in [
                    p.x_res,
                    p.y_res,
                    p.channels,
                    p.bits_per_sample,
                    p.crop_x_min,
                    p.crop_x_max,
                    p.crop_y_min,
                    p.crop_y_max,
                ] {
                    b.write_i32::<NativeEndian>(v)?;
                }
            }
            Message::Nl(m) | Message::Np(m) => {
                for v in m {
                    b.write_f32::<NativeEndian>(*v)?;
                }
            }
            Message::UserParam {
                data_type,
                count,
                name,
                data,
            } => {
                b.write_i32::<NativeEndian>(*data_type)?;
                b.write_i32::<NativeEndian>(name.len() as i32)?;
                b.write_i32::<NativeEndian>(data.len() as i32)?;
                b.write_i32::<NativeEndian>(*count)?;
                b.write_all(name.as_bytes())?;
                b.write_all(data)?;
            }
            Message::FormatResponse(f) => {
                b.write_i32::<NativeEndian>(f.code())?;
            }
            Message::Close | Message::Abandon | Message::CloseAcknowledge => {}
        }
        Ok(b)
    }

    /// Writes the framed message; `Write` loops partial writes internally.
    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        let body = self.body()?;
        w.write_i32::<NativeEndian>(self.id())?;
        w.write_i32::<NativeEndian>((body.len() + 8) as i32)?;
        w.write_all(&body)?;
        w.flush()?;
        Ok(())
    }

    /// Reads one framed message, blocking until it is complete.
    pub fn read_from(r: &mut impl Read) -> Result<Message> {
        let id = r.read_i32::<NativeEndian>()?;
        let len = r.read_i32::<NativeEndian>()?;
        if !(8..=MAX_MESSAGE).contains(&len) {
            return Err(Error::BadLength(len));
        }
        let mut body = vec![0u8; (len - 8) as usize];
        r.read_exact(&mut body)?;
        let mut c = std::io::Cursor::new(body);
        let msg = match id {
            MSG_STRING => Message::String(read_string(&mut c)?),
            MSG_FORMAT_QUERY => {
                let count = c.read_i32::<NativeEndian>()?;
                let mut formats = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    formats.push(c.read_i32::<NativeEndian>()?);
                }
                Message::FormatQuery(formats)
            }
            MSG_DATA => {
                let x_min = c.read_i32::<NativeEndian>()?;
                let x_max_plus_1 = c.read_i32::<NativeEndian>()?;
                let y_min = c.read_i32::<NativeEndian>()?;
                let y_max_plus_1 = c.read_i32::<NativeEndian>()?;
                let element_size = c.read_i32::<NativeEndian>()?;
                let data_len = c.read_i32::<NativeEndian>()?;
                let mut data = vec![0u8; data_len.max(0) as usize];
                c.read_exact(&mut data)?;
                Message::Data {
                    x_min,
                    x_max_plus_1,
                    y_min,
                    y_max_plus_1,
                    element_size,
                    data,
                }
            }
            MSG_OPEN => {
                let mut v = [0i32; 8];
                for slot in &mut v {
                    *slot = c.read_i32::<NativeEndian>()?;
                }
                Message::Open(OpenParams {
                    x_res: v[0],
                    y_res: v[1],
                    channels: v[2],
                    bits_per_sample: v[3],
                    crop_x_min: v[4],
                    crop_x_max: v[5],
                    crop_y_min: v[6],
                    crop_y_max: v[7],
                })
            }
            MSG_CLOSE => Message::Close,
            MSG_FILENAME => Message::Filename(read_string(&mut c)?),
            MSG_NL | MSG_NP => {
                let mut m = [0f32; 16];
                for slot in &mut m {
                    *slot = c.read_f32::<NativeEndian>()?;
                }
                if id == MSG_NL {
                    Message::Nl(m)
                } else {
                    Message::Np(m)
                }
            }
            MSG_DISPLAY_TYPE => Message::DisplayType(read_string(&mut c)?),
            MSG_ABANDON => Message::Abandon,
            MSG_USER_PARAM => {
                let data_type = c.read_i32::<NativeEndian>()?;
                let name_len = c.read_i32::<NativeEndian>()?;
                let data_len = c.read_i32::<NativeEndian>()?;
                let count = c.read_i32::<NativeEndian>()?;
                let mut name = vec![0u8; name_len.max(0) as usize];
                c.read_exact(&mut name)?;
                let mut data = vec![0u8; data_len.max(0) as usize];
                c.read_exact(&mut data)?;
                Message::UserParam {
                    data_type,
                    count,
                    name: String::from_utf8_lossy(&name).into_owned(),
                    data,
                }
            }
            MSG_FORMAT_RESPONSE => {
                let code = c.read_i32::<NativeEndian>()?;
                Message::FormatResponse(SampleFormat::from_code(code)?)
            }
            MSG_CLOSE_ACKNOWLEDGE => Message::CloseAcknowledge,
            other => return Err(Error::UnknownMessage(other)),
        };
        Ok(msg)
    }
}

fn read_string(c: &mut impl Read) -> Result<String> {
    let len = c.read_i32::<NativeEndian>()?;
    let mut bytes = vec![0u8; len.max(0) as usize];
    c.read_exact(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) -> Message {
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();
        Message::read_from(&mut buf.as_slice()).unwrap()
    }

    #[test]
    fn open_round_trip() {
        let open = Message::Open(OpenParams {
            x_res: 640,
            y_res: 480,
            channels: 4,
            bits_per_sample: 8,
            crop_x_min: 0,
            crop_x_max: 640,
            crop_y_min: 0,
            crop_y_max: 480,
        });
        assert_eq!(round_trip(open.clone()), open);
    }

    #[test]
    fn data_round_trip_keeps_bytes() {
        let data = Message::Data {
            x_min: 2,
            x_max_plus_1: 4,
            y_min: 0,
            y_max_plus_1: 2,
            element_size: 16,
            data: (0..64).collect(),
        };
        assert_eq!(round_trip(data.clone()), data);
    }

    #[test]
    fn strings_carry_their_length() {
        let msg = Message::Filename("out/frame0001.tif".into());
        assert_eq!(round_trip(msg.clone()), msg);
        let mut buf = Vec::new();
        msg.write_to(&mut buf).unwrap();
        // id + total length + string length + bytes.
        assert_eq!(buf.len(), 8 + 4 + 17);
    }

    #[test]
    fn control_messages_are_bare_headers() {
        for msg in [Message::Close, Message::Abandon, Message::CloseAcknowledge] {
            let mut buf = Vec::new();
            msg.write_to(&mut buf).unwrap();
            assert_eq!(buf.len(), 8);
            assert_eq!(round_trip(msg.clone()), msg);
        }
    }

    #[test]
    fn bogus_ids_are_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&999i32.to_ne_bytes());
        buf.extend_from_slice(&8i32.to_ne_bytes());
        assert!(matches!(
            Message::read_from(&mut buf.as_slice()),
            Err(Error::UnknownMessage(999))
        ));
    }

    #[test]
    fn stream_of_messages_reads_in_order() {
        let mut buf = Vec::new();
        Message::FormatQuery(vec![0, 5]).write_to(&mut buf).unwrap();
        Message::Close.write_to(&mut buf).unwrap();
        let mut r = buf.as_slice();
        assert!(matches!(Message::read_from(&mut r).unwrap(), Message::FormatQuery(_)));
        assert!(matches!(Message::read_from(&mut r).unwrap(), Message::Close));
    }
}
