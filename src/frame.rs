//! Decoded frames and the stride rule.
//!
//! - `Frame`: one decoded RGB24 raster plus its index in the stream.
//! - `SampleDecision`: whether a frame index is selected for classification.
//!
//! Frames are encoded to JPEG before they leave the process. The classifier
//! never sees the raw buffer.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, GenericImageView};

/// Default JPEG quality for classifier payloads and snapshots.
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Width of the border painted on flagged frames.
const ALERT_BORDER_PX: u32 = 6;
const ALERT_COLOR: [u8; 3] = [255, 0, 0];

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One decoded frame. Pixels are tightly packed RGB24 rows.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    index: u64,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Frame {
    /// Build a frame from packed RGB24 pixels. Called by the ingestion layer.
    pub fn from_rgb(index: u64, width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            index,
            width,
            height,
            pixels,
        })
    }

    /// Position of this frame in the decoded stream, starting at 0.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Encode the frame as a baseline JPEG.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.pixels.len() / 8);
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder
            .encode(&self.pixels, self.width, self.height, ExtendedColorType::Rgb8)
            .with_context(|| format!("encode frame {} as jpeg", self.index))?;
        Ok(out)
    }

    /// Decode a JPEG payload back into a frame carrying `index`.
    pub fn decode_jpeg(index: u64, bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes).context("decode jpeg")?;
        let (width, height) = image.dimensions();
        Self::from_rgb(index, width, height, image.into_rgb8().into_raw())
    }

    /// Copy of this frame with a red border painted around it.
    pub fn annotated(&self) -> Frame {
        let mut copy = self.clone();
        let w = self.width as usize;
        let border = ALERT_BORDER_PX.min(self.width / 2).min(self.height / 2);
        for y in 0..self.height {
            for x in 0..self.width {
                let on_edge = x < border
                    || y < border
                    || x >= self.width - border
                    || y >= self.height - border;
                if on_edge {
                    let offset = (y as usize * w + x as usize) * 3;
                    copy.pixels[offset..offset + 3].copy_from_slice(&ALERT_COLOR);
                }
            }
        }
        copy
    }
}

// Pixel buffers are large; keep them out of debug output.
impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// Inline `data:` URL for a JPEG payload.
pub fn jpeg_data_url(jpeg: &[u8]) -> String {
    format!(
        "data:image/jpeg;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(jpeg)
    )
}

fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))
}

// ----------------------------------------------------------------------------
// Sampling
// ----------------------------------------------------------------------------

/// Whether a frame index is selected by the stride rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleDecision {
    pub frame_index: u64,
    pub stride: u64,
    pub is_sample: bool,
}

impl SampleDecision {
    /// A frame is sampled iff `frame_index mod stride == 0`.
    ///
    /// `stride` must be at least 1; `SamplingOptions` enforces this.
    pub fn for_index(frame_index: u64, stride: u64) -> Self {
        Self {
            frame_index,
            stride,
            is_sample: frame_index % stride == 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_frame(index: u64, width: u32, height: u32) -> Frame {
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.push((x * 255 / width.max(1)) as u8);
                pixels.push((y * 255 / height.max(1)) as u8);
                pixels.push(128);
            }
        }
        Frame::from_rgb(index, width, height, pixels).unwrap()
    }

    #[test]
    fn from_rgb_rejects_wrong_length() {
        assert!(Frame::from_rgb(0, 4, 4, vec![0u8; 10]).is_err());
    }

    #[test]
    fn jpeg_payload_decodes_to_similar_raster() -> Result<()> {
        let frame = gradient_frame(7, 64, 48);
        let jpeg = frame.encode_jpeg(DEFAULT_JPEG_QUALITY)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = Frame::decode_jpeg(7, &jpeg)?;
        assert_eq!(decoded.width(), 64);
        assert_eq!(decoded.height(), 48);

        let total: u64 = frame
            .pixels()
            .iter()
            .zip(decoded.pixels())
            .map(|(a, b)| (*a as i32 - *b as i32).unsigned_abs() as u64)
            .sum();
        let mean_error = total as f64 / frame.pixels().len() as f64;
        assert!(mean_error < 8.0, "mean abs error {mean_error}");
        Ok(())
    }

    #[test]
    fn data_url_is_base64_jpeg() {
        assert_eq!(
            jpeg_data_url(&[0xFF, 0xD8, 0xFF]),
            "data:image/jpeg;base64,/9j/"
        );
    }

    #[test]
    fn annotated_paints_border_only() {
        let frame = gradient_frame(0, 32, 32);
        let marked = frame.annotated();

        assert_eq!(&marked.pixels()[0..3], &ALERT_COLOR);
        let center = ((16 * 32 + 16) * 3) as usize;
        assert_eq!(
            &marked.pixels()[center..center + 3],
            &frame.pixels()[center..center + 3]
        );
        assert_eq!(marked.index(), frame.index());
    }

    #[test]
    fn annotated_handles_tiny_frames() {
        let frame = Frame::from_rgb(0, 1, 1, vec![1, 2, 3]).unwrap();
        let marked = frame.annotated();
        assert_eq!(marked.pixels().len(), 3);
    }

    #[test]
    fn stride_selects_multiples() {
        let picked: Vec<u64> = (0..100)
            .filter(|i| SampleDecision::for_index(*i, 30).is_sample)
            .collect();
        assert_eq!(picked, vec![0, 30, 60, 90]);
        assert!(SampleDecision::for_index(5, 1).is_sample);
    }
}
