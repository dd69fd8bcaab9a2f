mod backend;
pub mod backends;
mod result;

use anyhow::{anyhow, Result};

pub use backend::{
    ClassificationRequest, Classifier, ClassifierError, DEFAULT_MAX_TOKENS, DEFAULT_PROMPT,
};
pub use backends::{OpenAiBackend, OpenAiConfig, StubBackend};
pub use result::ClassificationResult;

use crate::config::{ClassifierKind, ScanConfig};

/// Build the classifier selected by configuration.
///
/// The API key is taken from the configuration here and nowhere else.
pub fn build_classifier(cfg: &ScanConfig) -> Result<Box<dyn Classifier>> {
    match cfg.classifier.kind {
        ClassifierKind::OpenAi => {
            let api_key = cfg
                .classifier
                .api_key
                .clone()
                .ok_or_else(|| anyhow!("OPENAI_API_KEY must be set for the openai classifier"))?;
            let backend = OpenAiBackend::new(OpenAiConfig {
                endpoint: cfg.classifier.endpoint.clone(),
                model: cfg.classifier.model.clone(),
                api_key,
                timeout: cfg.classifier.timeout,
            });
            log::debug!(
                "classifier: openai model {} at {}",
                backend.model(),
                cfg.classifier.endpoint
            );
            Ok(Box::new(backend))
        }
        ClassifierKind::Stub => Ok(Box::new(
            StubBackend::new().positive_on(&cfg.classifier.stub_positive_frames),
        )),
    }
}
