pub mod openai;
pub mod stub;

pub use openai::{OpenAiBackend, OpenAiConfig};
pub use stub::StubBackend;
