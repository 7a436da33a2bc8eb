//! The client-side image: a deep buffer at native precision for file
//! output, and an 8-bit display buffer composited incrementally as Data
//! rectangles arrive.

use crate::error::Result;
use crate::format::{promote_to_rgba, SampleFormat};
use crate::protocol::OpenParams;
use std::path::{Path, PathBuf};
use tracing::debug;

/// `INT_MULT`: 8-bit fixed point multiply with rounding.
fn int_mult(a: u32, b: u32) -> u32 {
    let t = a * b + 0x80;
    ((t >> 8) + t) >> 8
}

/// Premultiplied-alpha over with 8-bit saturation:
/// `C' = incoming + existing·(1 - α_incoming)`.
fn prelerp(existing: u8, incoming: u8, alpha: u8) -> u8 {
    let v = existing as u32 + incoming as u32 - int_mult(alpha as u32, existing as u32);
    v.min(255) as u8
}

pub struct DisplayImage {
    width: usize,
    height: usize,
    channels: usize,
    format: SampleFormat,
    /// Native-precision samples, `channels` per pixel, for file output.
    deep: Vec<f32>,
    /// 8-bit RGBA composite for interactive refresh.
    display: Vec<u8>,
}

impl DisplayImage {
    pub fn new(params: &OpenParams, format: SampleFormat) -> DisplayImage {
        let width = params.x_res.max(0) as usize;
        let height = params.y_res.max(0) as usize;
        let channels = params.channels.clamp(1, 4) as usize;
        DisplayImage {
            width,
            height,
            channels,
            format,
            deep: vec![0.0; width * height * channels],
            display: vec![0u8; width * height * 4],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// 8-bit RGBA pixel of the display buffer.
    pub fn display_pixel(&self, x: usize, y: usize) -> [u8; 4] {
        let o = (y * self.width + x) * 4;
        [
            self.display[o],
            self.display[o + 1],
            self.display[o + 2],
            self.display[o + 3],
        ]
    }

    pub fn deep_pixel(&self, x: usize, y: usize) -> &[f32] {
        let o = (y * self.width + x) * self.channels;
        &self.deep[o..o + self.channels]
    }

    /// Accepts one Data rectangle: overwrites the deep buffer and
    /// composites into the display buffer.
    pub fn accept_data(
        &mut self,
        x_min: i32,
        x_max_plus_1: i32,
        y_min: i32,
        y_max_plus_1: i32,
        element_size: i32,
        data: &[u8],
    ) -> Result<()> {
        let bpc = self.format.bytes_per_channel();
        let stride = element_size.max(0) as usize;
        let per_pixel_channels = if bpc > 0 { (stride / bpc).min(4) } else { 0 };
        let x0 = x_min.max(0) as usize;
        let y0 = y_min.max(0) as usize;
        let x1 = (x_max_plus_1.max(0) as usize).min(self.width);
        let y1 = (y_max_plus_1.max(0) as usize).min(self.height);
        let row_len = (x_max_plus_1 - x_min).max(0) as usize * stride;

        for y in y0..y1 {
            let src_row = (y as i32 - y_min) as usize * row_len;
            for x in x0..x1 {
                let src = src_row + (x as i32 - x_min) as usize * stride;
                if src + stride > data.len() {
                    continue;
                }
                let mut samples = [0.0f32; 4];
                for (c, s) in samples.iter_mut().take(per_pixel_channels).enumerate() {
                    *s = self.format.decode_sample(&data[src + c * bpc..]);
                }
                let rgba = promote_to_rgba(&samples[..per_pixel_channels]);

                // Deep buffer keeps the native samples.
                let deep_off = (y * self.width + x) * self.channels;
                for c in 0..self.channels {
                    self.deep[deep_off + c] = if c < per_pixel_channels {
                        samples[c]
                    } else if c == 3 {
                        1.0
                    } else {
                        0.0
                    };
                }

                // Display buffer composites premultiplied over.
                let quant = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
                let alpha = quant(rgba[3]);
                let off = (y * self.width + x) * 4;
                for c in 0..4 {
                    self.display[off + c] = prelerp(self.display[off + c], quant(rgba[c]), alpha);
                }
            }
        }
        Ok(())
    }

    /// Saves the 8-bit composite as a TIFF. On name collision, `.N` is
    /// inserted before the extension with the smallest free `N`.
    pub fn save_tiff(&self, requested: &Path) -> Result<PathBuf> {
        let path = collision_free_name(requested);
        let img = image::RgbaImage::from_raw(
            self.width as u32,
            self.height as u32,
            self.display.clone(),
        )
        .expect("display buffer has width*height*4 bytes");
        img.save_with_format(&path, image::ImageFormat::Tiff)?;
        debug!(path = %path.display(), "wrote TIFF");
        Ok(path)
    }
}

/// `foo.tif` → `foo.1.tif`, `foo.2.tif`, … until a free name is found.
fn collision_free_name(requested: &Path) -> PathBuf {
    if !requested.exists() {
        return requested.to_path_buf();
    }
    let stem = requested
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = requested
        .extension()
        .map(|s| s.to_string_lossy().into_owned());
    let dir = requested.parent().unwrap_or(Path::new(""));
    for n in 1.. {
        let name = match &ext {
            Some(e) => format!("{stem}.{n}.{e}"),
            None => format!("{stem}.{n}"),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;

    fn open_params(w: i32, h: i32, channels: i32) -> OpenParams {
        OpenParams {
            x_res: w,
            y_res: h,
            channels,
            bits_per_sample: 8,
            crop_x_min: 0,
            crop_x_max: w,
            crop_y_min: 0,
            crop_y_max: h,
        }
    }

    fn solid_bucket(w: usize, h: usize, rgb: [f32; 3]) -> Vec<u8> {
        let mut data = Vec::new();
        for _ in 0..w * h {
            for c in rgb {
                SampleFormat::Float32.encode_sample(c, &mut data);
            }
        }
        data
    }

    #[test]
    fn quadrants_composite_exactly() {
        let mut img = DisplayImage::new(&open_params(4, 4, 3), SampleFormat::Float32);
        let buckets = [
            (0, 0, [1.0, 0.0, 0.0]),
            (2, 0, [0.0, 1.0, 0.0]),
            (0, 2, [0.0, 0.0, 1.0]),
            (2, 2, [1.0, 1.0, 1.0]),
        ];
        for (x, y, rgb) in buckets {
            let data = solid_bucket(2, 2, rgb);
            img.accept_data(x, x + 2, y, y + 2, 12, &data).unwrap();
        }
        assert_eq!(img.display_pixel(0, 0)[..3], [255, 0, 0]);
        assert_eq!(img.display_pixel(3, 0)[..3], [0, 255, 0]);
        assert_eq!(img.display_pixel(1, 3)[..3], [0, 0, 255]);
        assert_eq!(img.display_pixel(2, 2)[..3], [255, 255, 255]);
        // RGB promotes alpha to opaque.
        assert_eq!(img.display_pixel(0, 0)[3], 255);
    }

    #[test]
    fn prelerp_is_premultiplied_over() {
        // Opaque incoming replaces; transparent incoming adds nothing.
        assert_eq!(prelerp(100, 200, 255), 200);
        assert_eq!(prelerp(100, 0, 0), 100);
    }

    #[test]
    fn deep_buffer_keeps_native_precision() {
        let mut img = DisplayImage::new(&open_params(2, 1, 3), SampleFormat::Float32);
        let data = solid_bucket(2, 1, [0.123, 0.456, 0.789]);
        img.accept_data(0, 2, 0, 1, 12, &data).unwrap();
        let px = img.deep_pixel(1, 0);
        assert_eq!(px, &[0.123, 0.456, 0.789]);
    }

    #[test]
    fn tiff_name_collisions_count_up() {
        let dir = tempfile::tempdir().unwrap();
        let img = DisplayImage::new(&open_params(2, 2, 3), SampleFormat::Float32);
        let base = dir.path().join("out.tif");
        let first = img.save_tiff(&base).unwrap();
        let second = img.save_tiff(&base).unwrap();
        let third = img.save_tiff(&base).unwrap();
        assert_eq!(first, base);
        assert_eq!(second, dir.path().join("out.1.tif"));
        assert_eq!(third, dir.path().join("out.2.tif"));
    }
}
