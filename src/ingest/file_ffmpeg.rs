//! Local file frame source using FFmpeg.
//!
//! This module provides an FFmpeg-backed local file decoder. Frames are
//! decoded in order, converted to packed RGB24, and numbered from 0.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::file::FileConfig;
use super::SourceStats;
use crate::frame::Frame;

pub(crate) struct FfmpegFileSource {
    config: FileConfig,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    reported_fps: Option<f64>,
    frame_count: u64,
    eof_sent: bool,
}

impl FfmpegFileSource {
    pub(crate) fn open(config: &FileConfig) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&config.path)
            .with_context(|| format!("failed to open '{}' as a video container", config.path))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("'{}' has no video track", config.path))?;
        let stream_index = input_stream.index();
        let reported_fps = rational_fps(input_stream.avg_frame_rate())
            .or_else(|| rational_fps(input_stream.rate()));
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!(
            "FileSource: opened {} (ffmpeg, {}x{}, fps={:?})",
            config.path,
            decoder.width(),
            decoder.height(),
            reported_fps
        );

        Ok(Self {
            config: config.clone(),
            input,
            stream_index,
            decoder,
            scaler,
            reported_fps,
            frame_count: 0,
            eof_sent: false,
        })
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                let mut rgb_frame = ffmpeg::frame::Video::empty();
                self.scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
                let index = self.frame_count;
                self.frame_count += 1;
                return Frame::from_rgb(index, width, height, pixels).map(Some);
            }
            if self.eof_sent {
                return Ok(None);
            }
            match self.next_video_packet() {
                Some(packet) => self
                    .decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?,
                None => {
                    self.decoder.send_eof().context("flush ffmpeg decoder")?;
                    self.eof_sent = true;
                }
            }
        }
    }

    pub(crate) fn reported_fps(&self) -> Option<f64> {
        self.reported_fps
    }

    pub(crate) fn stats(&self) -> SourceStats {
        SourceStats {
            frames_decoded: self.frame_count,
            source: self.config.path.clone(),
        }
    }

    fn next_video_packet(&mut self) -> Option<ffmpeg::Packet> {
        let stream_index = self.stream_index;
        self.input
            .packets()
            .find(|(stream, _)| stream.index() == stream_index)
            .map(|(_, packet)| packet)
    }
}

fn rational_fps(rate: ffmpeg::Rational) -> Option<f64> {
    if rate.denominator() == 0 {
        return None;
    }
    let fps = f64::from(rate);
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .context("ffmpeg frame buffer is shorter than expected")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
