//! crashscan
//!
//! This crate screens uploaded videos for vehicle collisions by sampling
//! frames at a fixed stride and asking a hosted vision model about each one.
//!
//! # Architecture
//!
//! The only engine is the sampling pipeline. Everything around it is a
//! collaborator behind a narrow interface:
//!
//! 1. **Frame source** (`ingest`): opens a video and yields decoded frames.
//! 2. **Classifier** (`detect`): answers free-form text for one JPEG frame.
//! 3. **Observer** (`pipeline::ProgressObserver`): receives live incidents.
//!
//! Runs are sequential and share no state; each upload gets its own source,
//! classifier and pipeline.
//!
//! # Module Structure
//!
//! - `frame`: decoded frames, JPEG payloads, the stride rule
//! - `ingest`: frame sources (local files, uploads, `stub://` streams)
//! - `detect`: classifier trait, reply parsing, backends
//! - `pipeline`: the sampling run and its errors
//! - `report`: incidents and video timestamps
//! - `config`: file + environment configuration
//! - `api`: browser upload server

pub mod api;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod report;

pub use config::{ApiKey, ClassifierKind, ScanConfig};
pub use detect::{
    build_classifier, ClassificationRequest, ClassificationResult, Classifier, ClassifierError,
    OpenAiBackend, OpenAiConfig, StubBackend,
};
pub use frame::{Frame, SampleDecision};
pub use ingest::{FileConfig, FileSource, FrameSource, SourceStats};
pub use pipeline::{
    effective_fps, NoopObserver, PipelineError, PipelineState, ProgressObserver,
    SamplingOptions, SamplingPipeline,
};
pub use report::{Incident, IncidentReport, VideoTimestamp};
