//! Synthetic `stub://` frame source.
//!
//! Query parameters shape the stream:
//! `stub://clip?frames=90&fps=30&width=64&height=48`.
//! `fps=unknown` reports no rate. `fail=open` makes `open` fail and
//! `fail_at=N` makes decoding fail at frame `N`.

use anyhow::{anyhow, Context, Result};
use url::Url;

use super::SourceStats;
use crate::frame::Frame;

const DEFAULT_FRAMES: u64 = 90;
const DEFAULT_FPS: f64 = 30.0;
const DEFAULT_WIDTH: u32 = 64;
const DEFAULT_HEIGHT: u32 = 48;
const MAX_DIMENSION: u32 = 8192;

#[derive(Clone, Debug)]
struct SyntheticSpec {
    frames: u64,
    fps: Option<f64>,
    width: u32,
    height: u32,
    fail_open: bool,
    fail_at: Option<u64>,
}

pub(crate) struct SyntheticSource {
    uri: String,
    spec: SyntheticSpec,
    opened: bool,
    frame_count: u64,
}

impl SyntheticSource {
    pub(crate) fn new(uri: &str) -> Result<Self> {
        let spec = parse_spec(uri)?;
        Ok(Self {
            uri: uri.to_string(),
            spec,
            opened: false,
            frame_count: 0,
        })
    }

    pub(crate) fn open(&mut self) -> Result<()> {
        if self.spec.fail_open {
            return Err(anyhow!("synthetic source {} refused to open", self.uri));
        }
        self.opened = true;
        log::info!("FileSource: opened {} (synthetic)", self.uri);
        Ok(())
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.opened {
            return Err(anyhow!("synthetic source not opened; call open() first"));
        }
        if self.frame_count >= self.spec.frames {
            return Ok(None);
        }
        let index = self.frame_count;
        if self.spec.fail_at == Some(index) {
            return Err(anyhow!("synthetic decode failure at frame {}", index));
        }
        self.frame_count += 1;
        let pixels = self.generate_pixels(index)?;
        Frame::from_rgb(index, self.spec.width, self.spec.height, pixels).map(Some)
    }

    pub(crate) fn reported_fps(&self) -> Option<f64> {
        self.spec.fps
    }

    pub(crate) fn close(&mut self) {
        self.opened = false;
    }

    pub(crate) fn stats(&self) -> SourceStats {
        SourceStats {
            frames_decoded: self.frame_count,
            source: self.uri.clone(),
        }
    }

    fn generate_pixels(&self, index: u64) -> Result<Vec<u8>> {
        let byte_count = (self.spec.width as usize)
            .checked_mul(self.spec.height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("synthetic frame dimensions overflow"))?;
        let mut pixels = vec![0u8; byte_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + index) % 256) as u8;
        }
        Ok(pixels)
    }
}

fn parse_spec(uri: &str) -> Result<SyntheticSpec> {
    let url = Url::parse(uri).with_context(|| format!("parse synthetic source '{}'", uri))?;
    if url.scheme() != "stub" {
        return Err(anyhow!("synthetic source must use the stub:// scheme"));
    }
    let mut spec = SyntheticSpec {
        frames: DEFAULT_FRAMES,
        fps: Some(DEFAULT_FPS),
        width: DEFAULT_WIDTH,
        height: DEFAULT_HEIGHT,
        fail_open: url.host_str() == Some("broken"),
        fail_at: None,
    };
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "frames" => spec.frames = parse_param(&key, &value)?,
            "fps" if value == "unknown" => spec.fps = None,
            "fps" => spec.fps = Some(parse_param(&key, &value)?),
            "width" => spec.width = parse_param(&key, &value)?,
            "height" => spec.height = parse_param(&key, &value)?,
            "fail" if value == "open" => spec.fail_open = true,
            "fail_at" => spec.fail_at = Some(parse_param(&key, &value)?),
            other => return Err(anyhow!("unknown synthetic source parameter '{}'", other)),
        }
    }
    if spec.width == 0 || spec.height == 0 {
        return Err(anyhow!("synthetic source dimensions must be non-zero"));
    }
    if spec.width > MAX_DIMENSION || spec.height > MAX_DIMENSION {
        return Err(anyhow!(
            "synthetic source dimensions {}x{} exceed {}x{}",
            spec.width,
            spec.height,
            MAX_DIMENSION,
            MAX_DIMENSION
        ));
    }
    Ok(spec)
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("invalid value '{}' for synthetic parameter '{}'", value, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_produce_ninety_frames() -> Result<()> {
        let mut source = SyntheticSource::new("stub://clip")?;
        source.open()?;
        let mut indices = Vec::new();
        while let Some(frame) = source.next_frame()? {
            indices.push(frame.index());
        }
        assert_eq!(indices, (0..90).collect::<Vec<_>>());
        assert_eq!(source.reported_fps(), Some(30.0));
        assert_eq!(source.stats().frames_decoded, 90);
        Ok(())
    }

    #[test]
    fn query_parameters_shape_stream() -> Result<()> {
        let source = SyntheticSource::new("stub://clip?frames=5&fps=0&width=8&height=2")?;
        assert_eq!(source.spec.frames, 5);
        assert_eq!(source.reported_fps(), Some(0.0));
        assert_eq!((source.spec.width, source.spec.height), (8, 2));

        let source = SyntheticSource::new("stub://clip?fps=unknown")?;
        assert_eq!(source.reported_fps(), None);
        Ok(())
    }

    #[test]
    fn broken_host_fails_open() -> Result<()> {
        let mut source = SyntheticSource::new("stub://broken")?;
        assert!(source.open().is_err());
        let mut source = SyntheticSource::new("stub://clip?fail=open")?;
        assert!(source.open().is_err());
        Ok(())
    }

    #[test]
    fn fail_at_breaks_mid_stream() -> Result<()> {
        let mut source = SyntheticSource::new("stub://clip?frames=10&fail_at=3")?;
        source.open()?;
        for _ in 0..3 {
            assert!(source.next_frame()?.is_some());
        }
        assert!(source.next_frame().is_err());
        Ok(())
    }

    #[test]
    fn rejects_unknown_parameters() {
        assert!(SyntheticSource::new("stub://clip?colour=red").is_err());
        assert!(SyntheticSource::new("stub://clip?frames=many").is_err());
        assert!(SyntheticSource::new("stub://clip?width=0").is_err());
    }

    #[test]
    fn oversized_dimensions_are_an_error() -> Result<()> {
        assert!(SyntheticSource::new("stub://clip?frames=1&width=70000&height=70000").is_err());
        assert!(SyntheticSource::new("stub://clip?width=8193").is_err());

        let mut source = SyntheticSource::new("stub://clip?frames=1&width=8192&height=1")?;
        source.open()?;
        let frame = source.next_frame()?.expect("one frame");
        assert_eq!(frame.pixels().len(), 8192 * 3);
        Ok(())
    }
}
