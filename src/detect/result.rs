/// Verdict for one classified frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassificationResult {
    /// Did the classifier say the frame shows a collision?
    pub is_incident: bool,
    /// Reply text as returned by the backend.
    pub raw: String,
}

impl ClassificationResult {
    /// Any reply containing "yes" (case-insensitive) is positive.
    /// Everything else, including empty or rambling text, is negative.
    pub fn from_reply(reply: impl Into<String>) -> Self {
        let raw = reply.into();
        let is_incident = raw.trim().to_lowercase().contains("yes");
        Self { is_incident, raw }
    }
}
