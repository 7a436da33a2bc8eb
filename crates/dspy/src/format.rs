//! Sample formats and quantization.

use crate::error::{Error, Result};
use byteorder::{NativeEndian, WriteBytesExt};

/// On-the-wire sample formats, in the id order of the format-query codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    Float32,
    Unsigned32,
    Signed32,
    Unsigned16,
    Signed16,
    Unsigned8,
    Signed8,
}

impl SampleFormat {
    pub fn code(self) -> i32 {
        match self {
            SampleFormat::Float32 => 0,
            SampleFormat::Unsigned32 => 1,
            SampleFormat::Signed32 => 2,
            SampleFormat::Unsigned16 => 3,
            SampleFormat::Signed16 => 4,
            SampleFormat::Unsigned8 => 5,
            SampleFormat::Signed8 => 6,
        }
    }

    pub fn from_code(code: i32) -> Result<SampleFormat> {
        Ok(match code {
            0 => SampleFormat::Float32,
            1 => SampleFormat::Unsigned32,
            2 => SampleFormat::Signed32,
            3 => SampleFormat::Unsigned16,
            4 => SampleFormat::Signed16,
            5 => SampleFormat::Unsigned8,
            6 => SampleFormat::Signed8,
            other => return Err(Error::UnknownFormat(other)),
        })
    }

    pub fn bytes_per_channel(self) -> usize {
        match self {
            SampleFormat::Float32 | SampleFormat::Unsigned32 | SampleFormat::Signed32 => 4,
            SampleFormat::Unsigned16 | SampleFormat::Signed16 => 2,
            SampleFormat::Unsigned8 | SampleFormat::Signed8 => 1,
        }
    }

    pub fn bits_per_sample(self) -> i32 {
        (self.bytes_per_channel() * 8) as i32
    }

    /// All formats, most precise first; the query offer.
    pub fn all() -> [SampleFormat; 7] {
        [
            SampleFormat::Float32,
            SampleFormat::Unsigned32,
            SampleFormat::Signed32,
            SampleFormat::Unsigned16,
            SampleFormat::Signed16,
            SampleFormat::Unsigned8,
            SampleFormat::Signed8,
        ]
    }

    /// Quantizes one [0,1]-scaled sample into the format's encoding.
    pub fn encode_sample(self, v: f32, out: &mut Vec<u8>) {
        match self {
            SampleFormat::Float32 => out.write_f32::<NativeEndian>(v).unwrap(),
            SampleFormat::Unsigned32 => out
                .write_u32::<NativeEndian>((v.clamp(0.0, 1.0) as f64 * u32::MAX as f64) as u32)
                .unwrap(),
            SampleFormat::Signed32 => out
                .write_i32::<NativeEndian>((v.clamp(-1.0, 1.0) as f64 * i32::MAX as f64) as i32)
                .unwrap(),
            SampleFormat::Unsigned16 => out
                .write_u16::<NativeEndian>((v.clamp(0.0, 1.0) * u16::MAX as f32).round() as u16)
                .unwrap(),
            SampleFormat::Signed16 => out
                .write_i16::<NativeEndian>((v.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16)
                .unwrap(),
            SampleFormat::Unsigned8 => {
                out.push((v.clamp(0.0, 1.0) * 255.0).round() as u8);
            }
            SampleFormat::Signed8 => out
                .write_i8((v.clamp(-1.0, 1.0) * i8::MAX as f32).round() as i8)
                .unwrap(),
        }
    }

    /// Decodes one sample back to a [0,1]-scaled float.
    pub fn decode_sample(self, bytes: &[u8]) -> f32 {
        match self {
            SampleFormat::Float32 => f32::from_ne_bytes(bytes[..4].try_into().unwrap()),
            SampleFormat::Unsigned32 => {
                u32::from_ne_bytes(bytes[..4].try_into().unwrap()) as f32 / u32::MAX as f32
            }
            SampleFormat::Signed32 => {
                i32::from_ne_bytes(bytes[..4].try_into().unwrap()) as f32 / i32::MAX as f32
            }
            SampleFormat::Unsigned16 => {
                u16::from_ne_bytes(bytes[..2].try_into().unwrap()) as f32 / u16::MAX as f32
            }
            SampleFormat::Signed16 => {
                i16::from_ne_bytes(bytes[..2].try_into().unwrap()) as f32 / i16::MAX as f32
            }
            SampleFormat::Unsigned8 => bytes[0] as f32 / 255.0,
            SampleFormat::Signed8 => bytes[0] as i8 as f32 / i8::MAX as f32,
        }
    }
}

/// Reorders a pixel's channel set into wire order (RGBA), filling missing
/// channels: alpha with 1, color with 0.
pub fn promote_to_rgba(channels: &[f32]) -> [f32; 4] {
    match channels.len() {
        0 => [0.0, 0.0, 0.0, 1.0],
        // A single channel replicates to grey.
        1 => [channels[0], channels[0], channels[0], 1.0],
        2 => [channels[0], channels[0], channels[0], channels[1]],
        3 => [channels[0], channels[1], channels[2], 1.0],
        _ => [channels[0], channels[1], channels[2], channels[3]],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u8_quantization_saturates() {
        let mut out = Vec::new();
        SampleFormat::Unsigned8.encode_sample(1.5, &mut out);
        SampleFormat::Unsigned8.encode_sample(-0.5, &mut out);
        SampleFormat::Unsigned8.encode_sample(0.5, &mut out);
        assert_eq!(out, vec![255, 0, 128]);
    }

    #[test]
    fn float_passes_through() {
        let mut out = Vec::new();
        SampleFormat::Float32.encode_sample(0.25, &mut out);
        assert_eq!(SampleFormat::Float32.decode_sample(&out), 0.25);
    }

    #[test]
    fn sixteen_bit_round_trip() {
        let mut out = Vec::new();
        SampleFormat::Unsigned16.encode_sample(0.5, &mut out);
        let back = SampleFormat::Unsigned16.decode_sample(&out);
        assert!((back - 0.5).abs() < 1e-4);
    }

    #[test]
    fn rgba_promotion_fills_alpha() {
        assert_eq!(promote_to_rgba(&[0.2, 0.4, 0.6]), [0.2, 0.4, 0.6, 1.0]);
        assert_eq!(promote_to_rgba(&[0.5]), [0.5, 0.5, 0.5, 1.0]);
    }

    #[test]
    fn codes_round_trip() {
        for f in SampleFormat::all() {
            assert_eq!(SampleFormat::from_code(f.code()).unwrap(), f);
        }
        assert!(SampleFormat::from_code(42).is_err());
    }
}
