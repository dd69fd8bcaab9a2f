//! Frame ingestion sources.
//!
//! This module provides sources of decoded frames:
//! - Local video files and uploaded byte streams (feature: ingest-file-ffmpeg)
//! - Synthetic `stub://` streams (testing, dry runs)
//!
//! All sources produce `Frame` instances with indices starting at 0 and
//! increasing by one per decoded frame. A source is opened once, read until
//! it reports end of stream, and closed. Closing releases the decoder and any
//! temporary file backing the stream.

pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
mod synthetic;

pub use file::{FileConfig, FileSource, SUPPORTED_EXTENSIONS};

use anyhow::Result;

use crate::frame::Frame;

/// A decodable video stream.
pub trait FrameSource {
    /// Open the stream. Fails when the content is not a decodable video.
    fn open(&mut self) -> Result<()>;

    /// Decode the next frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Frame rate reported by the container, if any. May be zero or garbage.
    fn reported_fps(&self) -> Option<f64>;

    /// Release the decoder and backing storage. Idempotent.
    fn close(&mut self);

    /// Counters for logging.
    fn stats(&self) -> SourceStats;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }

    fn reported_fps(&self) -> Option<f64> {
        (**self).reported_fps()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn stats(&self) -> SourceStats {
        (**self).stats()
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_decoded: u64,
    pub source: String,
}
