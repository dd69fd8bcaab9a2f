//! Local file frame source.
//!
//! This module provides `FileSource` for decoding frames from local video
//! files and from uploaded byte streams. The file source is responsible for:
//! - Opening the container and its best video track
//! - Decoding frames in order, in memory
//! - Reporting the container frame rate
//! - Deleting the temporary file that backs an uploaded stream on close
//!
//! Paths of the form `stub://...` select a deterministic synthetic stream.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use tempfile::NamedTempFile;

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::synthetic::SyntheticSource;
use super::{FrameSource, SourceStats};
use crate::frame::Frame;

/// Container extensions accepted for upload.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["mp4", "avi", "mov"];

/// Configuration for a local file source.
#[derive(Clone, Debug, Default)]
pub struct FileConfig {
    /// Local file path (e.g., "/srv/uploads/dashcam.mp4") or `stub://` URI.
    pub path: String,
}

/// Local file frame source.
pub struct FileSource {
    config: FileConfig,
    backend: FileBackend,
    spool: Option<NamedTempFile>,
}

enum FileBackend {
    Pending,
    Synthetic(SyntheticSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
    Closed,
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        if !is_local_file_path(&config.path) {
            return Err(anyhow!(
                "file ingestion only supports local paths (no URL schemes)"
            ));
        }
        let backend = if config.path.starts_with("stub://") {
            FileBackend::Synthetic(SyntheticSource::new(&config.path)?)
        } else {
            FileBackend::Pending
        };
        Ok(Self {
            config,
            backend,
            spool: None,
        })
    }

    /// Spool a byte stream into a temporary file and decode from there.
    ///
    /// `extension` names the container (`mp4`, `avi`, `mov`) so the demuxer
    /// can open it. The stream must yield exactly `expected_len` bytes; a
    /// short stream is a truncated upload and is rejected before decoding.
    /// The temporary file lives until the source is closed.
    pub fn from_reader<R: Read>(reader: R, extension: &str, expected_len: u64) -> Result<Self> {
        let extension = normalize_extension(extension)?;
        let mut spool = tempfile::Builder::new()
            .prefix("crashscan-upload-")
            .suffix(&format!(".{extension}"))
            .tempfile()
            .context("create upload spool file")?;
        let written = std::io::copy(&mut reader.take(expected_len), spool.as_file_mut())
            .context("spool upload to disk")?;
        if written != expected_len {
            return Err(anyhow!(
                "upload truncated: received {} of {} bytes",
                written,
                expected_len
            ));
        }
        log::debug!(
            "FileSource: spooled {} bytes to {}",
            written,
            spool.path().display()
        );
        let path = spool.path().to_string_lossy().to_string();
        Ok(Self {
            config: FileConfig { path },
            backend: FileBackend::Pending,
            spool: Some(spool),
        })
    }

    pub fn path(&self) -> &str {
        &self.config.path
    }
}

impl FrameSource for FileSource {
    fn open(&mut self) -> Result<()> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.open(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(_) => Ok(()),
            FileBackend::Pending => {
                #[cfg(feature = "ingest-file-ffmpeg")]
                {
                    let source = FfmpegFileSource::open(&self.config)?;
                    self.backend = FileBackend::Ffmpeg(source);
                    Ok(())
                }
                #[cfg(not(feature = "ingest-file-ffmpeg"))]
                {
                    Err(anyhow!(
                        "cannot decode '{}': file ingestion requires the ingest-file-ffmpeg feature",
                        self.config.path
                    ))
                }
            }
            FileBackend::Closed => Err(anyhow!("file source already closed")),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.next_frame(),
            FileBackend::Pending => Err(anyhow!("file source not opened; call open() first")),
            FileBackend::Closed => Err(anyhow!("file source already closed")),
        }
    }

    fn reported_fps(&self) -> Option<f64> {
        match &self.backend {
            FileBackend::Synthetic(source) => source.reported_fps(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.reported_fps(),
            FileBackend::Pending | FileBackend::Closed => None,
        }
    }

    fn close(&mut self) {
        if let FileBackend::Synthetic(source) = &mut self.backend {
            source.close();
        }
        self.backend = FileBackend::Closed;
        if let Some(spool) = self.spool.take() {
            let path = spool.path().to_path_buf();
            if let Err(err) = spool.close() {
                log::warn!(
                    "FileSource: failed to remove spool file {}: {}",
                    path.display(),
                    err
                );
            }
        }
    }

    fn stats(&self) -> SourceStats {
        match &self.backend {
            FileBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.stats(),
            FileBackend::Pending | FileBackend::Closed => SourceStats {
                frames_decoded: 0,
                source: self.config.path.clone(),
            },
        }
    }
}

/// Lowercased extension if it is one of `SUPPORTED_EXTENSIONS`.
pub fn normalize_extension(extension: &str) -> Result<String> {
    let ext = extension.trim().trim_start_matches('.').to_ascii_lowercase();
    if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
        Ok(ext)
    } else {
        Err(anyhow!(
            "unsupported video type '{}'; expected one of {}",
            extension,
            SUPPORTED_EXTENSIONS.join(", ")
        ))
    }
}

/// Extension of a file name if it is a supported container.
pub fn extension_of(filename: &str) -> Result<String> {
    let ext = std::path::Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .ok_or_else(|| anyhow!("file name '{}' has no extension", filename))?;
    normalize_extension(ext)
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_remote_urls() {
        assert!(FileSource::new(FileConfig {
            path: "https://example.com/video.mp4".to_string()
        })
        .is_err());
        assert!(FileSource::new(FileConfig::default()).is_err());
    }

    #[test]
    fn extension_checks_are_case_insensitive() -> Result<()> {
        assert_eq!(extension_of("Crash.MP4")?, "mp4");
        assert_eq!(normalize_extension(".mov")?, "mov");
        assert!(extension_of("notes.txt").is_err());
        assert!(extension_of("no_extension").is_err());
        Ok(())
    }

    #[test]
    fn spool_file_removed_on_close() -> Result<()> {
        let mut source = FileSource::from_reader(&b"not really a video"[..], "mp4", 18)?;
        let path = std::path::PathBuf::from(source.path());
        assert!(path.exists());
        assert!(source.path().ends_with(".mp4"));

        source.close();
        assert!(!path.exists());
        assert!(source.open().is_err());
        Ok(())
    }

    #[test]
    fn undecodable_upload_fails_open() -> Result<()> {
        let mut source = FileSource::from_reader(&b"garbage bytes"[..], "avi", 13)?;
        assert!(source.open().is_err());
        source.close();
        Ok(())
    }

    #[test]
    fn short_upload_is_rejected() {
        let err = FileSource::from_reader(&b"ten bytes!"[..], "mp4", 100_000)
            .err()
            .expect("truncated upload must fail");
        assert!(err.to_string().contains("received 10 of 100000 bytes"));
    }

    #[test]
    fn spool_stops_at_expected_length() -> Result<()> {
        let mut source = FileSource::from_reader(&b"0123456789extra"[..], "mov", 10)?;
        assert_eq!(std::fs::metadata(source.path())?.len(), 10);
        source.close();
        Ok(())
    }

    #[test]
    fn oversized_synthetic_frames_are_rejected() {
        assert!(FileSource::new(FileConfig {
            path: "stub://clip?frames=1&width=70000&height=70000".to_string(),
        })
        .is_err());
    }

    #[test]
    fn synthetic_path_decodes() -> Result<()> {
        let mut source = FileSource::new(FileConfig {
            path: "stub://clip?frames=3".to_string(),
        })?;
        source.open()?;
        let mut count = 0;
        while source.next_frame()?.is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(source.stats().frames_decoded, 3);
        source.close();
        Ok(())
    }
}
