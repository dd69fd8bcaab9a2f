//! Chat-completions classifier backend.
//!
//! Each sampled frame becomes one request carrying the instruction and the
//! frame as an inline `data:image/jpeg;base64,...` URL. The reply text is
//! `choices[0].message.content`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::ApiKey;
use crate::detect::backend::{ClassificationRequest, Classifier, ClassifierError};
use crate::frame::jpeg_data_url;

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Error bodies are cut to this many characters before they reach logs.
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: ApiKey,
    pub timeout: Duration,
}

/// Classifier backed by a hosted multimodal chat model.
pub struct OpenAiBackend {
    config: OpenAiConfig,
    agent: ureq::Agent,
}

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Self { config, agent }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

impl Classifier for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn classify(&mut self, request: &ClassificationRequest<'_>) -> Result<String, ClassifierError> {
        let body = build_request_body(&self.config.model, request)?;
        let response = self
            .agent
            .post(&self.config.endpoint)
            .set(
                "Authorization",
                &format!("Bearer {}", self.config.api_key.expose()),
            )
            .set("Content-Type", "application/json")
            .send_string(&body);

        match response {
            Ok(response) => {
                let text = response.into_string().map_err(|e| {
                    ClassifierError::MalformedResponse(format!("read response body: {e}"))
                })?;
                parse_completion(&text)
            }
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(ClassifierError::Status {
                    status,
                    body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
                })
            }
            Err(ureq::Error::Transport(transport)) => {
                Err(ClassifierError::Transport(transport.to_string()))
            }
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

fn build_request_body(
    model: &str,
    request: &ClassificationRequest<'_>,
) -> Result<String, ClassifierError> {
    let body = ChatRequest {
        model,
        messages: [ChatMessage {
            role: "user",
            content: vec![
                ContentPart::Text {
                    text: request.prompt,
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: jpeg_data_url(request.jpeg),
                    },
                },
            ],
        }],
        max_tokens: request.max_tokens,
    };
    serde_json::to_string(&body)
        .map_err(|e| ClassifierError::Unavailable(format!("serialize request: {e}")))
}

/// Extract the trimmed reply text. A null `content` is an empty reply.
fn parse_completion(body: &str) -> Result<String, ClassifierError> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| ClassifierError::MalformedResponse(e.to_string()))?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ClassifierError::MalformedResponse("response has no choices".to_string()))?;
    Ok(choice.message.content.unwrap_or_default().trim().to_string())
}
