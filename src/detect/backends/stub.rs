use std::collections::HashMap;

use crate::detect::backend::{ClassificationRequest, Classifier, ClassifierError};

/// Scripted classifier for tests and dry runs.
///
/// Replies are looked up by frame index, falling back to a default reply.
/// Every call is recorded so callers can check which frames were sampled.
pub struct StubBackend {
    replies: HashMap<u64, String>,
    default_reply: String,
    fail_at: Option<u64>,
    calls: Vec<u64>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            replies: HashMap::new(),
            default_reply: "No".to_string(),
            fail_at: None,
            calls: Vec::new(),
        }
    }

    /// Answer `reply` for the frame at `frame_index`.
    pub fn with_reply(mut self, frame_index: u64, reply: impl Into<String>) -> Self {
        self.replies.insert(frame_index, reply.into());
        self
    }

    /// Answer "Yes" for every listed frame.
    pub fn positive_on(mut self, frame_indices: &[u64]) -> Self {
        for index in frame_indices {
            self.replies.insert(*index, "Yes".to_string());
        }
        self
    }

    pub fn with_default_reply(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = reply.into();
        self
    }

    /// Fail with a transport error when asked about `frame_index`.
    pub fn failing_at(mut self, frame_index: u64) -> Self {
        self.fail_at = Some(frame_index);
        self
    }

    /// Frame indices classified so far, in call order.
    pub fn calls(&self) -> &[u64] {
        &self.calls
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn classify(&mut self, request: &ClassificationRequest<'_>) -> Result<String, ClassifierError> {
        self.calls.push(request.frame_index);
        if self.fail_at == Some(request.frame_index) {
            return Err(ClassifierError::Transport(format!(
                "stub failure at frame {}",
                request.frame_index
            )));
        }
        if request.jpeg.is_empty() {
            return Err(ClassifierError::Unavailable("empty image payload".to_string()));
        }
        Ok(self
            .replies
            .get(&request.frame_index)
            .cloned()
            .unwrap_or_else(|| self.default_reply.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(frame_index: u64) -> ClassificationRequest<'static> {
        ClassificationRequest {
            frame_index,
            jpeg: &[0xFF, 0xD8, 0xFF, 0xD9],
            prompt: "prompt",
            max_tokens: 10,
        }
    }

    #[test]
    fn scripted_replies_and_calls() {
        let mut backend = StubBackend::new()
            .with_reply(30, "Yes, clearly a crash.")
            .failing_at(60);

        assert_eq!(backend.classify(&request(0)).unwrap(), "No");
        assert_eq!(backend.classify(&request(30)).unwrap(), "Yes, clearly a crash.");
        assert!(matches!(
            backend.classify(&request(60)),
            Err(ClassifierError::Transport(_))
        ));
        assert_eq!(backend.calls(), &[0, 30, 60]);
    }
}
