use thiserror::Error;

/// Instruction sent with every sampled frame.
pub const DEFAULT_PROMPT: &str = "Does this image show a car accident? Just answer Yes or No.";

/// Output cap for a one-word answer.
pub const DEFAULT_MAX_TOKENS: u32 = 10;

/// One classification call: a JPEG payload plus the fixed instruction.
#[derive(Clone, Copy, Debug)]
pub struct ClassificationRequest<'a> {
    /// Index of the frame the payload was encoded from.
    pub frame_index: u64,
    /// Baseline JPEG bytes.
    pub jpeg: &'a [u8],
    pub prompt: &'a str,
    pub max_tokens: u32,
}

/// Failure to obtain a reply from a classifier.
#[derive(Debug, Error)]
pub enum ClassifierError {
    /// The request never produced an HTTP response (DNS, TLS, timeout, reset).
    #[error("classifier transport error: {0}")]
    Transport(String),

    /// The service answered with a non-success status.
    #[error("classifier returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The service answered 2xx but the body was not a usable reply.
    #[error("malformed classifier response: {0}")]
    MalformedResponse(String),

    /// The classifier could not be configured or reached for another reason.
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
}

/// Classifier backend trait.
///
/// A classifier is an opaque oracle: it receives one encoded frame and the
/// instruction, and returns free-form reply text. Interpreting the text is
/// the caller's job (`ClassificationResult::from_reply`).
pub trait Classifier {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Ask the backend about one frame.
    fn classify(&mut self, request: &ClassificationRequest<'_>) -> Result<String, ClassifierError>;
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn classify(&mut self, request: &ClassificationRequest<'_>) -> Result<String, ClassifierError> {
        (**self).classify(request)
    }
}
