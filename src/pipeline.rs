//! Frame-sampling pipeline.
//!
//! A run opens a `FrameSource`, walks its frames in order, sends every
//! `stride`-th frame to a `Classifier` as a JPEG, and collects the positive
//! verdicts into an `IncidentReport`. Runs are synchronous: each decode and
//! each classifier call completes before the next step starts.
//!
//! Any error ends the run. The source is closed on every exit path.

use anyhow::{anyhow, Result};
use std::ops::{Deref, DerefMut};
use thiserror::Error;

use crate::config::ScanConfig;
use crate::detect::{
    ClassificationRequest, ClassificationResult, Classifier, ClassifierError, DEFAULT_MAX_TOKENS,
    DEFAULT_PROMPT,
};
use crate::frame::{Frame, SampleDecision, DEFAULT_JPEG_QUALITY};
use crate::ingest::FrameSource;
use crate::report::{Incident, IncidentReport, VideoTimestamp};

/// Classify one frame out of every 30.
pub const DEFAULT_STRIDE: u64 = 30;

/// Rate assumed when the container reports none.
pub const DEFAULT_FPS: f64 = 30.0;

// ----------------------------------------------------------------------------
// Options
// ----------------------------------------------------------------------------

/// Knobs for one run.
#[derive(Clone, Debug)]
pub struct SamplingOptions {
    stride: u64,
    default_fps: f64,
    jpeg_quality: u8,
    prompt: String,
    max_tokens: u32,
}

impl SamplingOptions {
    /// `stride` must be at least 1 and `default_fps` positive and finite.
    pub fn new(stride: u64, default_fps: f64) -> Result<Self> {
        if stride == 0 {
            return Err(anyhow!("stride must be at least 1"));
        }
        if !(default_fps.is_finite() && default_fps > 0.0) {
            return Err(anyhow!("default fps must be a positive number"));
        }
        Ok(Self {
            stride,
            default_fps,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            prompt: DEFAULT_PROMPT.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        })
    }

    pub fn from_config(cfg: &ScanConfig) -> Result<Self> {
        Ok(Self::new(cfg.sampling.stride, cfg.sampling.default_fps)?
            .with_jpeg_quality(cfg.sampling.jpeg_quality)
            .with_prompt(cfg.classifier.prompt.clone())
            .with_max_tokens(cfg.classifier.max_tokens))
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn default_fps(&self) -> f64 {
        self.default_fps
    }
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            stride: DEFAULT_STRIDE,
            default_fps: DEFAULT_FPS,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            prompt: DEFAULT_PROMPT.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// The reported rate if it is positive and finite, otherwise `default_fps`.
pub fn effective_fps(reported: Option<f64>, default_fps: f64) -> f64 {
    match reported {
        Some(fps) if fps.is_finite() && fps > 0.0 => fps,
        _ => default_fps,
    }
}

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// Why a run ended early.
///
/// Failures after the source was opened carry the incidents found so far.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot open video: {cause:#}")]
    Decode { cause: anyhow::Error },

    #[error("video decoding failed after {frames_decoded} frames: {cause:#}")]
    StreamDecode {
        frames_decoded: u64,
        partial: IncidentReport,
        cause: anyhow::Error,
    },

    #[error("could not encode frame {frame_index}: {cause:#}")]
    Encode {
        frame_index: u64,
        partial: IncidentReport,
        cause: anyhow::Error,
    },

    #[error("classifier failed on frame {frame_index}: {error}")]
    Classification {
        frame_index: u64,
        partial: IncidentReport,
        error: ClassifierError,
    },

    #[error("pipeline has already run")]
    AlreadyRan,
}

impl PipelineError {
    /// Incidents found before the failure, if the source was ever opened.
    pub fn partial(&self) -> Option<&IncidentReport> {
        match self {
            Self::StreamDecode { partial, .. }
            | Self::Encode { partial, .. }
            | Self::Classification { partial, .. } => Some(partial),
            Self::Decode { .. } | Self::AlreadyRan => None,
        }
    }

    /// Short machine-readable category.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode { .. } | Self::StreamDecode { .. } => "decode",
            Self::Encode { .. } => "encode",
            Self::Classification { .. } => "classification",
            Self::AlreadyRan => "already_ran",
        }
    }
}

// ----------------------------------------------------------------------------
// Observer
// ----------------------------------------------------------------------------

/// Live progress hooks. Presentation lives behind this trait.
pub trait ProgressObserver {
    /// Called once per positive frame, before it is appended to the report.
    fn on_incident(&mut self, incident: &Incident, caption: &str);

    /// Called after every classifier verdict.
    fn on_classified(&mut self, _frame_index: u64, _result: &ClassificationResult) {}
}

/// Observer that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_incident(&mut self, _incident: &Incident, _caption: &str) {}
}

impl<F: FnMut(&Incident, &str)> ProgressObserver for F {
    fn on_incident(&mut self, incident: &Incident, caption: &str) {
        self(incident, caption)
    }
}

// ----------------------------------------------------------------------------
// State machine
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Opened,
    Sampling,
    Skipping,
    Closed,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Closed | Failed, _) => false,
            (_, Failed) => true,
            (Idle, Opened) => true,
            (Opened | Sampling | Skipping, Sampling | Skipping | Closed) => true,
            _ => false,
        }
    }
}

/// Closes the wrapped source when dropped.
struct SourceGuard<'a, S: FrameSource + ?Sized> {
    source: &'a mut S,
}

impl<S: FrameSource + ?Sized> Deref for SourceGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.source
    }
}

impl<S: FrameSource + ?Sized> DerefMut for SourceGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.source
    }
}

impl<S: FrameSource + ?Sized> Drop for SourceGuard<'_, S> {
    fn drop(&mut self) {
        self.source.close();
    }
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

/// One sampling run. A pipeline value runs at most once.
pub struct SamplingPipeline {
    options: SamplingOptions,
    state: PipelineState,
}

impl SamplingPipeline {
    pub fn new(options: SamplingOptions) -> Self {
        Self {
            options,
            state: PipelineState::Idle,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn options(&self) -> &SamplingOptions {
        &self.options
    }

    /// Decode `source` to the end, classifying every `stride`-th frame.
    pub fn run<S, C, O>(
        &mut self,
        source: &mut S,
        classifier: &mut C,
        observer: &mut O,
    ) -> Result<IncidentReport, PipelineError>
    where
        S: FrameSource + ?Sized,
        C: Classifier + ?Sized,
        O: ProgressObserver + ?Sized,
    {
        if self.state != PipelineState::Idle {
            return Err(PipelineError::AlreadyRan);
        }

        let mut source = SourceGuard { source };
        if let Err(cause) = source.open() {
            self.transition(PipelineState::Failed);
            log::error!("pipeline: cannot open video: {:#}", cause);
            return Err(PipelineError::Decode { cause });
        }
        self.transition(PipelineState::Opened);

        let stride = self.options.stride;
        let reported = source.reported_fps();
        let fps = effective_fps(reported, self.options.default_fps);
        if Some(fps) != reported {
            log::warn!(
                "pipeline: source reported fps {:?}; using default {}",
                reported,
                fps
            );
        }
        log::info!(
            "pipeline: sampling {} every {} frames at {:.3} fps with {}",
            source.stats().source,
            stride,
            fps,
            classifier.name()
        );

        let mut report = IncidentReport::new(fps, stride);
        loop {
            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(cause) => return Err(self.stream_failure(report, cause)),
            };
            if frame.index() != report.frames_decoded {
                let cause = anyhow!(
                    "source produced frame {} where {} was expected",
                    frame.index(),
                    report.frames_decoded
                );
                return Err(self.stream_failure(report, cause));
            }
            report.frames_decoded += 1;

            let decision = SampleDecision::for_index(frame.index(), stride);
            if !decision.is_sample {
                self.transition(PipelineState::Skipping);
                continue;
            }
            self.transition(PipelineState::Sampling);

            let verdict = match self.classify(&frame, classifier) {
                Ok(verdict) => verdict,
                Err(err) => {
                    self.transition(PipelineState::Failed);
                    return Err(match err {
                        FrameFailure::Encode(cause) => PipelineError::Encode {
                            frame_index: frame.index(),
                            partial: report,
                            cause,
                        },
                        FrameFailure::Classify(error) => {
                            log::error!(
                                "pipeline: classifier failed on frame {}: {}",
                                frame.index(),
                                error
                            );
                            PipelineError::Classification {
                                frame_index: frame.index(),
                                partial: report,
                                error,
                            }
                        }
                    });
                }
            };
            report.frames_classified += 1;
            log::debug!(
                "pipeline: frame {} -> {:?} (incident={})",
                frame.index(),
                verdict.raw,
                verdict.is_incident
            );
            observer.on_classified(frame.index(), &verdict);

            if verdict.is_incident {
                let incident = Incident {
                    frame_index: frame.index(),
                    timestamp: VideoTimestamp::for_frame(frame.index(), fps),
                    frame,
                    reply: verdict.raw,
                };
                let caption = incident.caption();
                log::info!("pipeline: {} (frame {})", caption, incident.frame_index);
                observer.on_incident(&incident, &caption);
                report.push(incident);
            }
        }

        drop(source);
        self.transition(PipelineState::Closed);
        log::info!(
            "pipeline: done; {} frames decoded, {} classified, {} incidents",
            report.frames_decoded,
            report.frames_classified,
            report.len()
        );
        Ok(report)
    }

    fn classify<C: Classifier + ?Sized>(
        &self,
        frame: &Frame,
        classifier: &mut C,
    ) -> Result<ClassificationResult, FrameFailure> {
        let jpeg = frame
            .encode_jpeg(self.options.jpeg_quality)
            .map_err(FrameFailure::Encode)?;
        let request = ClassificationRequest {
            frame_index: frame.index(),
            jpeg: &jpeg,
            prompt: &self.options.prompt,
            max_tokens: self.options.max_tokens,
        };
        let reply = classifier
            .classify(&request)
            .map_err(FrameFailure::Classify)?;
        Ok(ClassificationResult::from_reply(reply))
    }

    fn stream_failure(&mut self, partial: IncidentReport, cause: anyhow::Error) -> PipelineError {
        self.transition(PipelineState::Failed);
        log::error!(
            "pipeline: decoding failed after {} frames: {:#}",
            partial.frames_decoded,
            cause
        );
        PipelineError::StreamDecode {
            frames_decoded: partial.frames_decoded,
            partial,
            cause,
        }
    }

    fn transition(&mut self, next: PipelineState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid pipeline transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }
}

enum FrameFailure {
    Encode(anyhow::Error),
    Classify(ClassifierError),
}
