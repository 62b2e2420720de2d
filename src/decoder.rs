//! The image decoder contract (§4.10, §6 "To image decoder (outbound)").
//! Decoding is strictly pull-driven: the read pipeline (§4.5) calls
//! `read_line` once per raster row it needs, never the whole frame.

use anyhow::{anyhow, Context};

/// The pixel layout a decoded frame actually came out in (§6 `get_params`
/// `format` field). eSCL pages are either full-color or single-channel;
/// there's no paletted or alpha case to carry here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb24,
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// One decoded scanline's worth of pixel geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedParams {
    pub format: PixelFormat,
    pub pixels_per_line: u32,
    pub lines: u32,
    pub bytes_per_pixel: u32,
}

/// A clipping window in actual decoded-image pixels (§6 `set_window`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Window {
    pub x_off: u32,
    pub y_off: u32,
    pub width: u32,
    pub height: u32,
}

pub trait ImageDecoder: Send {
    /// Begin decoding a new encoded image (§3: "decoding is strictly
    /// pull-driven by the reader").
    fn begin(&mut self, bytes: &[u8]) -> anyhow::Result<()>;

    fn get_params(&self) -> anyhow::Result<DecodedParams>;

    fn get_bytes_per_pixel(&self) -> anyhow::Result<u32>;

    /// Install a clipping window, returning the window actually applied
    /// (clamped to the decoded image's real dimensions).
    fn set_window(&mut self, window: Window) -> anyhow::Result<Window>;

    /// Decode the next scanline into `buf`. `Ok(None)` signals there are no
    /// more lines in the current window.
    fn read_line(&mut self, buf: &mut [u8]) -> anyhow::Result<Option<usize>>;

    /// Discard the current image, ready for the next `begin`.
    fn reset(&mut self);
}

/// A decoded frame in whichever depth the source actually carried.
enum DecodedFrame {
    Rgb(image::RgbImage),
    Gray(image::GrayImage),
}

impl DecodedFrame {
    fn width(&self) -> u32 {
        match self {
            DecodedFrame::Rgb(img) => img.width(),
            DecodedFrame::Gray(img) => img.width(),
        }
    }

    fn height(&self) -> u32 {
        match self {
            DecodedFrame::Rgb(img) => img.height(),
            DecodedFrame::Gray(img) => img.height(),
        }
    }

    fn format(&self) -> PixelFormat {
        match self {
            DecodedFrame::Rgb(_) => PixelFormat::Rgb24,
            DecodedFrame::Gray(_) => PixelFormat::Gray8,
        }
    }
}

/// Concrete binding over the `image` crate (§4.10).
#[derive(Default)]
pub struct ImageCrateDecoder {
    image: Option<DecodedFrame>,
    window: Window,
    next_line: u32,
}

impl ImageDecoder for ImageCrateDecoder {
    fn begin(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        let dynamic = image::load_from_memory(bytes)
            .context("failed to sniff/decode image frame")?;
        // Keep single-channel pages at their native depth instead of
        // always upconverting to RGB; anything else decodes to RGB24.
        let frame = match dynamic {
            image::DynamicImage::ImageLuma8(gray) => DecodedFrame::Gray(gray),
            other => DecodedFrame::Rgb(other.to_rgb8()),
        };
        self.window = Window { x_off: 0, y_off: 0, width: frame.width(), height: frame.height() };
        self.next_line = 0;
        self.image = Some(frame);
        Ok(())
    }

    fn get_params(&self) -> anyhow::Result<DecodedParams> {
        let frame = self.image.as_ref().ok_or_else(|| anyhow!("decoder has no active image"))?;
        Ok(DecodedParams {
            format: frame.format(),
            pixels_per_line: frame.width(),
            lines: frame.height(),
            bytes_per_pixel: frame.format().bytes_per_pixel(),
        })
    }

    fn get_bytes_per_pixel(&self) -> anyhow::Result<u32> {
        let frame = self.image.as_ref().ok_or_else(|| anyhow!("decoder has no active image"))?;
        Ok(frame.format().bytes_per_pixel())
    }

    fn set_window(&mut self, window: Window) -> anyhow::Result<Window> {
        let frame = self.image.as_ref().ok_or_else(|| anyhow!("decoder has no active image"))?;
        let x_off = window.x_off.min(frame.width());
        let y_off = window.y_off.min(frame.height());
        let width = window.width.min(frame.width().saturating_sub(x_off));
        let height = window.height.min(frame.height().saturating_sub(y_off));
        self.window = Window { x_off, y_off, width, height };
        self.next_line = y_off;
        Ok(self.window)
    }

    fn read_line(&mut self, buf: &mut [u8]) -> anyhow::Result<Option<usize>> {
        let frame = self.image.as_ref().ok_or_else(|| anyhow!("decoder has no active image"))?;
        if self.next_line >= self.window.y_off + self.window.height {
            return Ok(None);
        }
        let y = self.next_line;
        let bpp = frame.format().bytes_per_pixel() as usize;
        let mut written = 0usize;
        for x in self.window.x_off..(self.window.x_off + self.window.width) {
            if written + bpp > buf.len() {
                break;
            }
            match frame {
                DecodedFrame::Rgb(img) => {
                    buf[written..written + 3].copy_from_slice(&img.get_pixel(x, y).0);
                }
                DecodedFrame::Gray(img) => {
                    buf[written] = img.get_pixel(x, y).0[0];
                }
            }
            written += bpp;
        }
        self.next_line += 1;
        Ok(Some(written))
    }

    fn reset(&mut self) {
        self.image = None;
        self.window = Window::default();
        self.next_line = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_test_png(width: u32, height: u32) -> Vec<u8> {
        let mut img = image::RgbImage::new(width, height);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = image::Rgb([x as u8, y as u8, 0]);
        }
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn encode_test_gray_png(width: u32, height: u32) -> Vec<u8> {
        let mut img = image::GrayImage::new(width, height);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = image::Luma([(x + y) as u8]);
        }
        let mut bytes = Vec::new();
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn begin_reports_dimensions() {
        let mut decoder = ImageCrateDecoder::default();
        decoder.begin(&encode_test_png(4, 3)).unwrap();
        let params = decoder.get_params().unwrap();
        assert_eq!(params.pixels_per_line, 4);
        assert_eq!(params.lines, 3);
        assert_eq!(params.format, PixelFormat::Rgb24);
        assert_eq!(params.bytes_per_pixel, 3);
    }

    #[test]
    fn begin_keeps_grayscale_sources_single_channel() {
        let mut decoder = ImageCrateDecoder::default();
        decoder.begin(&encode_test_gray_png(4, 3)).unwrap();
        let params = decoder.get_params().unwrap();
        assert_eq!(params.format, PixelFormat::Gray8);
        assert_eq!(params.bytes_per_pixel, 1);
        assert_eq!(decoder.get_bytes_per_pixel().unwrap(), 1);

        let mut buf = [0u8; 4];
        assert_eq!(decoder.read_line(&mut buf).unwrap(), Some(4));
    }

    #[test]
    fn read_line_walks_rows_then_ends() {
        let mut decoder = ImageCrateDecoder::default();
        decoder.begin(&encode_test_png(2, 2)).unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(decoder.read_line(&mut buf).unwrap(), Some(6));
        assert_eq!(decoder.read_line(&mut buf).unwrap(), Some(6));
        assert_eq!(decoder.read_line(&mut buf).unwrap(), None);
    }

    #[test]
    fn set_window_clamps_to_image_bounds() {
        let mut decoder = ImageCrateDecoder::default();
        decoder.begin(&encode_test_png(4, 4)).unwrap();
        let applied = decoder.set_window(Window { x_off: 2, y_off: 2, width: 10, height: 10 }).unwrap();
        assert_eq!(applied, Window { x_off: 2, y_off: 2, width: 2, height: 2 });
    }

    #[test]
    fn reset_requires_a_fresh_begin() {
        let mut decoder = ImageCrateDecoder::default();
        decoder.begin(&encode_test_png(1, 1)).unwrap();
        decoder.reset();
        assert!(decoder.get_params().is_err());
    }
}
