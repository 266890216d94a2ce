//! Inline-image transcoder: shrinks oversized images to a maximum width and
//! re-encodes them as baseline JPEG.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageReader, Rgb, RgbImage};
use tracing::{debug, warn};

use crate::error::TransformError;
use crate::mime::Part;

const JPEG_QUALITY: u8 = 100;

#[derive(Debug, Clone, Copy)]
pub struct ImageTranscoder {
    max_width: u32,
}

impl ImageTranscoder {
    pub fn new(max_width: u32) -> Self {
        Self { max_width }
    }

    /// Shrink every oversized image leaf in the tree. Failures are logged and
    /// leave that part untouched. Returns how many parts were rewritten.
    pub fn transcode_tree(&self, tree: &mut Part) -> usize {
        let mut rewritten = 0;
        tree.for_each_leaf_mut(&mut |part| {
            if part.content_type().main_type() != "image" {
                return;
            }
            match self.transcode_part(part) {
                Ok(true) => rewritten += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    error = %e,
                    content_type = %part.content_type().value(),
                    "Image left as-is"
                ),
            }
        });
        rewritten
    }

    /// Rewrite one image leaf in place. `Ok(false)` means it was narrow
    /// enough and nothing changed.
    pub fn transcode_part(&self, part: &mut Part) -> Result<bool, TransformError> {
        let data = part.decoded_body()?;
        let Some(jpeg) = self.shrink(&data)? else {
            return Ok(false);
        };

        let mut content_type = part.content_type();
        content_type.set_value("image/jpeg");
        if let Some(name) = content_type.param("name").map(jpg_name) {
            content_type.set_param("name", &name);
        }
        part.headers.set("Content-Type", &content_type.to_string());

        if let Some(mut disposition) = part.disposition()
            && let Some(filename) = disposition.param("filename").map(jpg_name)
        {
            disposition.set_param("filename", &filename);
            part.headers
                .set("Content-Disposition", &disposition.to_string());
        }

        part.headers.set("Content-Transfer-Encoding", "base64");
        part.set_decoded_body(&jpeg);
        Ok(true)
    }

    /// JPEG bytes at `max_width`, or `None` when the image already fits.
    pub fn shrink(&self, data: &[u8]) -> Result<Option<Vec<u8>>, TransformError> {
        let mut decoder = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| TransformError::Image(e.to_string()))?
            .into_decoder()
            .map_err(|e| TransformError::Image(e.to_string()))?;

        let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
        let (stored_w, stored_h) = decoder.dimensions();
        let (width, height) = if swaps_axes(orientation) {
            (stored_h, stored_w)
        } else {
            (stored_w, stored_h)
        };
        if width <= self.max_width {
            return Ok(None);
        }

        let mut img =
            DynamicImage::from_decoder(decoder).map_err(|e| TransformError::Image(e.to_string()))?;
        img.apply_orientation(orientation);

        let target_w = self.max_width;
        let target_h = ((u64::from(height) * u64::from(target_w)) as f64 / f64::from(width))
            .round()
            .max(1.0) as u32;
        debug!(width, height, target_w, target_h, "Shrinking image");

        let flat = flatten_on_white(&img);
        let resized = image::imageops::resize(&flat, target_w, target_h, FilterType::Lanczos3);

        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
            .encode_image(&resized)
            .map_err(|e| TransformError::Image(e.to_string()))?;
        Ok(Some(out))
    }
}

fn swaps_axes(orientation: Orientation) -> bool {
    matches!(
        orientation,
        Orientation::Rotate90
            | Orientation::Rotate270
            | Orientation::Rotate90FlipH
            | Orientation::Rotate270FlipH
    )
}

/// Composite any transparency over white.
fn flatten_on_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let alpha = u16::from(a);
        let blend = |c: u8| ((u16::from(c) * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}

/// `photo.png` → `photo.jpg`; names without an extension gain one.
fn jpg_name(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => format!("{stem}.jpg"),
        _ => format!("{name}.jpg"),
    }
}
