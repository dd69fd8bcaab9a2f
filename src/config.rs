use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use url::Url;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::detect::backends::openai::{DEFAULT_ENDPOINT, DEFAULT_MODEL, DEFAULT_TIMEOUT};
use crate::detect::{DEFAULT_MAX_TOKENS, DEFAULT_PROMPT};
use crate::frame::DEFAULT_JPEG_QUALITY;
use crate::pipeline::{DEFAULT_FPS, DEFAULT_STRIDE};

const DEFAULT_API_ADDR: &str = "127.0.0.1:8790";
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 512 * 1024 * 1024;

// ----------------------------------------------------------------------------
// File layout
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ScanConfigFile {
    sampling: Option<SamplingConfigFile>,
    classifier: Option<ClassifierConfigFile>,
    api: Option<ApiConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SamplingConfigFile {
    stride: Option<u64>,
    default_fps: Option<f64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ClassifierConfigFile {
    backend: Option<String>,
    endpoint: Option<String>,
    model: Option<String>,
    prompt: Option<String>,
    max_tokens: Option<u32>,
    timeout_secs: Option<u64>,
    stub_positive_frames: Option<Vec<u64>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ApiConfigFile {
    addr: Option<String>,
    max_upload_bytes: Option<u64>,
}

// ----------------------------------------------------------------------------
// Resolved settings
// ----------------------------------------------------------------------------

/// Credential for the hosted classifier. Wiped on drop, redacted in `Debug`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassifierKind {
    OpenAi,
    Stub,
}

impl ClassifierKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "stub" => Ok(Self::Stub),
            other => Err(anyhow!(
                "unknown classifier backend '{}'; expected openai or stub",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub sampling: SamplingSettings,
    pub classifier: ClassifierSettings,
    pub api: ApiSettings,
}

#[derive(Debug, Clone)]
pub struct SamplingSettings {
    pub stride: u64,
    pub default_fps: f64,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    pub kind: ClassifierKind,
    pub endpoint: String,
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub api_key: Option<ApiKey>,
    pub stub_positive_frames: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub addr: String,
    pub max_upload_bytes: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingSettings {
                stride: DEFAULT_STRIDE,
                default_fps: DEFAULT_FPS,
                jpeg_quality: DEFAULT_JPEG_QUALITY,
            },
            classifier: ClassifierSettings {
                kind: ClassifierKind::OpenAi,
                endpoint: DEFAULT_ENDPOINT.to_string(),
                model: DEFAULT_MODEL.to_string(),
                prompt: DEFAULT_PROMPT.to_string(),
                max_tokens: DEFAULT_MAX_TOKENS,
                timeout: DEFAULT_TIMEOUT,
                api_key: None,
                stub_positive_frames: Vec::new(),
            },
            api: ApiSettings {
                addr: DEFAULT_API_ADDR.to_string(),
                max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            },
        }
    }
}

impl ScanConfig {
    /// Load from the file named by `CRASHSCAN_CONFIG` (if any), then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CRASHSCAN_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit file (if any), then env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => ScanConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ScanConfigFile) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(sampling) = file.sampling {
            cfg.sampling.stride = sampling.stride.unwrap_or(cfg.sampling.stride);
            cfg.sampling.default_fps = sampling.default_fps.unwrap_or(cfg.sampling.default_fps);
            cfg.sampling.jpeg_quality = sampling.jpeg_quality.unwrap_or(cfg.sampling.jpeg_quality);
        }
        if let Some(classifier) = file.classifier {
            if let Some(backend) = classifier.backend.as_deref() {
                cfg.classifier.kind = ClassifierKind::parse(backend)?;
            }
            cfg.classifier.endpoint = classifier.endpoint.unwrap_or(cfg.classifier.endpoint);
            cfg.classifier.model = classifier.model.unwrap_or(cfg.classifier.model);
            cfg.classifier.prompt = classifier.prompt.unwrap_or(cfg.classifier.prompt);
            cfg.classifier.max_tokens = classifier.max_tokens.unwrap_or(cfg.classifier.max_tokens);
            if let Some(secs) = classifier.timeout_secs {
                cfg.classifier.timeout = Duration::from_secs(secs);
            }
            cfg.classifier.stub_positive_frames = classifier
                .stub_positive_frames
                .unwrap_or(cfg.classifier.stub_positive_frames);
        }
        if let Some(api) = file.api {
            cfg.api.addr = api.addr.unwrap_or(cfg.api.addr);
            cfg.api.max_upload_bytes = api.max_upload_bytes.unwrap_or(cfg.api.max_upload_bytes);
        }
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(stride) = env_nonempty("CRASHSCAN_STRIDE") {
            self.sampling.stride = stride
                .parse()
                .map_err(|_| anyhow!("CRASHSCAN_STRIDE must be a positive integer"))?;
        }
        if let Some(fps) = env_nonempty("CRASHSCAN_DEFAULT_FPS") {
            self.sampling.default_fps = fps
                .parse()
                .map_err(|_| anyhow!("CRASHSCAN_DEFAULT_FPS must be a number"))?;
        }
        if let Some(backend) = env_nonempty("CRASHSCAN_CLASSIFIER") {
            self.classifier.kind = ClassifierKind::parse(&backend)?;
        }
        if let Some(model) = env_nonempty("CRASHSCAN_MODEL") {
            self.classifier.model = model;
        }
        if let Some(endpoint) = env_nonempty("CRASHSCAN_ENDPOINT") {
            self.classifier.endpoint = endpoint;
        }
        if let Some(addr) = env_nonempty("CRASHSCAN_API_ADDR") {
            self.api.addr = addr;
        }
        if let Some(limit) = env_nonempty("CRASHSCAN_MAX_UPLOAD_BYTES") {
            self.api.max_upload_bytes = limit
                .parse()
                .map_err(|_| anyhow!("CRASHSCAN_MAX_UPLOAD_BYTES must be an integer"))?;
        }
        if let Some(key) = env_nonempty("OPENAI_API_KEY") {
            self.classifier.api_key = Some(ApiKey::new(key));
        }
        Ok(())
    }

    /// Reject settings the pipeline or server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sampling.stride == 0 {
            return Err(anyhow!("sampling stride must be at least 1"));
        }
        if !(self.sampling.default_fps.is_finite() && self.sampling.default_fps > 0.0) {
            return Err(anyhow!("default fps must be a positive number"));
        }
        if !(1..=100).contains(&self.sampling.jpeg_quality) {
            return Err(anyhow!("jpeg quality must be between 1 and 100"));
        }
        if self.classifier.max_tokens == 0 {
            return Err(anyhow!("classifier max_tokens must be greater than zero"));
        }
        if self.classifier.prompt.trim().is_empty() {
            return Err(anyhow!("classifier prompt must not be empty"));
        }
        let endpoint = Url::parse(&self.classifier.endpoint)
            .with_context(|| format!("invalid classifier endpoint '{}'", self.classifier.endpoint))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(anyhow!("classifier endpoint must use http or https"));
        }
        if self.api.max_upload_bytes == 0 {
            return Err(anyhow!("max upload size must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ScanConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg: ScanConfigFile = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = ScanConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.sampling.stride, 30);
        assert_eq!(cfg.sampling.default_fps, 30.0);
        assert_eq!(cfg.classifier.max_tokens, 10);
        assert_eq!(cfg.classifier.kind, ClassifierKind::OpenAi);
    }

    #[test]
    fn rejects_zero_stride_and_bad_fps() {
        let mut cfg = ScanConfig::default();
        cfg.sampling.stride = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ScanConfig::default();
        cfg.sampling.default_fps = 0.0;
        assert!(cfg.validate().is_err());
        cfg.sampling.default_fps = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_non_http_endpoint() {
        let mut cfg = ScanConfig::default();
        cfg.classifier.endpoint = "ftp://example.com/v1".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn api_key_debug_is_redacted() {
        let key = ApiKey::new("sk-very-secret");
        assert_eq!(format!("{key:?}"), "ApiKey(<redacted>)");
        assert_eq!(key.expose(), "sk-very-secret");
    }

    #[test]
    fn classifier_kind_parses() {
        assert_eq!(ClassifierKind::parse("OpenAI").unwrap(), ClassifierKind::OpenAi);
        assert_eq!(ClassifierKind::parse(" stub ").unwrap(), ClassifierKind::Stub);
        assert!(ClassifierKind::parse("onnx").is_err());
    }
}
