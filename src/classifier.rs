//! Taste classification through an external text-completion service.
//!
//! A reading is rendered into a fixed prompt, sent to an OpenAI-compatible
//! chat-completions endpoint with deterministic decoding, and the single-word
//! answer is checked against the known tastes. Anything else is reported as
//! an invalid response rather than guessed.

use crate::config::ConfigError;
use crate::core::SensorValues;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable holding the API key.
pub const API_KEY_VAR: &str = "OPENAI_API_KEY";
/// Environment variable overriding the API base URL.
pub const BASE_URL_VAR: &str = "OPENAI_BASE_URL";
/// Environment variable overriding the model name.
pub const MODEL_VAR: &str = "TASTE_MODEL";
/// Environment variable overriding the request timeout in seconds.
pub const TIMEOUT_VAR: &str = "CLASSIFIER_TIMEOUT_SECS";

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Enough for one word and nothing more.
pub const MAX_OUTPUT_TOKENS: u32 = 5;

/// Placeholder written into the prompt for absent sensor values.
pub const ABSENT: &str = "N/A";

const SYSTEM_PROMPT: &str = "You are a taste classifier for an electronic tongue. \
Reply with exactly one lowercase word: sour, bitter, or salty.";

/// Classifier endpoint configuration.
#[derive(Clone)]
pub struct ClassifierConfig {
    /// API base URL, without the `/chat/completions` suffix
    pub base_url: String,
    /// Bearer token for the API
    pub api_key: String,
    /// Model name sent with each request
    pub model: String,
    /// Upper bound on a single classification request
    pub timeout: Duration,
}

impl std::fmt::Debug for ClassifierConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifierConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ClassifierConfig {
    /// Create a configuration with the default model and timeout.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Load configuration from the process environment.
    ///
    /// Fails with [`ConfigError::MissingCredentials`] when no API key is set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_key = lookup(API_KEY_VAR)
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ConfigError::MissingCredentials(format!("{API_KEY_VAR} is not set")))?;

        let base_url = lookup(BASE_URL_VAR)
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let model = lookup(MODEL_VAR)
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let timeout_secs = match lookup(TIMEOUT_VAR) {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "{TIMEOUT_VAR} must be a positive number of seconds, got '{raw}'"
                    )))
                }
            },
            None => DEFAULT_TIMEOUT_SECS,
        };

        Ok(Self {
            base_url,
            api_key,
            model,
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    /// Get the chat-completions endpoint URL.
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// A taste label the classifier may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Taste {
    Sour,
    Bitter,
    Salty,
}

impl Taste {
    pub const ALL: [Taste; 3] = [Taste::Sour, Taste::Bitter, Taste::Salty];

    pub fn as_str(&self) -> &'static str {
        match self {
            Taste::Sour => "sour",
            Taste::Bitter => "bitter",
            Taste::Salty => "salty",
        }
    }
}

impl std::fmt::Display for Taste {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification could not produce a taste.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassificationError {
    /// Network failure, timeout, or an error status from the service
    Transient(String),
    /// The service answered with something other than a known taste
    InvalidResponse(String),
}

impl std::fmt::Display for ClassificationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassificationError::Transient(msg) => {
                write!(f, "Classifier temporarily unavailable: {msg}")
            }
            ClassificationError::InvalidResponse(msg) => {
                write!(f, "Classifier returned an invalid response: {msg}")
            }
        }
    }
}

impl std::error::Error for ClassificationError {}

/// Render the prompt for a reading.
///
/// The output depends only on the sensor values, so identical readings
/// always produce identical prompts.
pub fn build_prompt(values: &SensorValues) -> String {
    format!(
        "Classify the taste of the sample measured by these sensors.\n\
         \n\
         MQ-8 gas sensor voltage (V): {}\n\
         Secondary MQ gas sensor voltage (V): {}\n\
         Color sensor red pulse: {}\n\
         Color sensor green pulse: {}\n\
         Color sensor blue pulse: {}\n\
         Dominant color: {}\n\
         Temperature (C): {}\n\
         Humidity (%): {}\n\
         \n\
         Answer with exactly one word: sour, bitter, or salty.",
        field(values.mq8_voltage),
        field(values.mq_other_voltage),
        field(values.color_r),
        field(values.color_g),
        field(values.color_b),
        field(values.dominant_color.as_deref()),
        field(values.temperature),
        field(values.humidity),
    )
}

fn field<T: std::fmt::Display>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| ABSENT.to_string())
}

/// Parse a completion into a taste.
///
/// Surrounding whitespace is ignored and case does not matter; any other
/// deviation is rejected.
pub fn parse_taste(text: &str) -> Result<Taste, ClassificationError> {
    let answer = text.trim();
    Taste::ALL
        .into_iter()
        .find(|taste| answer.eq_ignore_ascii_case(taste.as_str()))
        .ok_or_else(|| {
            ClassificationError::InvalidResponse(format!("unexpected answer '{}'", preview(answer)))
        })
}

fn preview(text: &str) -> String {
    const MAX_CHARS: usize = 80;
    if text.chars().count() > MAX_CHARS {
        format!("{}...", text.chars().take(MAX_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

/// Chat-completions request body.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// The part of a chat-completions response we read.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Client for the external taste classifier.
///
/// Each call is independent. Dropping the returned future abandons the
/// outstanding request.
#[derive(Debug, Clone)]
pub struct TasteClassifier {
    config: ClassifierConfig,
    client: reqwest::Client,
}

impl TasteClassifier {
    /// Create a new classifier client.
    pub fn new(config: ClassifierConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    /// Create a classifier from environment configuration.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(ClassifierConfig::from_env()?)
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify one reading.
    pub async fn classify(&self, values: &SensorValues) -> Result<Taste, ClassificationError> {
        let prompt = build_prompt(values);
        let request = ChatRequest {
            model: &self.config.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.0,
            max_tokens: MAX_OUTPUT_TOKENS,
        };

        let response = self
            .client
            .post(self.config.completions_url())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            tracing::warn!("Classifier returned error {}: {}", status, preview(&body));
            return Err(ClassificationError::Transient(format!(
                "service returned {status}"
            )));
        }

        let parsed: ChatResponse = serde_json::from_str(&body).map_err(|e| {
            ClassificationError::InvalidResponse(format!("undecodable completion: {e}"))
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                ClassificationError::InvalidResponse("completion contained no text".to_string())
            })?;

        let taste = parse_taste(&content);
        match &taste {
            Ok(taste) => tracing::debug!(%taste, "classified reading"),
            Err(e) => tracing::warn!("{}", e),
        }
        taste
    }

    fn transport_error(&self, e: reqwest::Error) -> ClassificationError {
        let message = if e.is_timeout() {
            format!("request timed out after {:?}", self.config.timeout)
        } else {
            format!("request failed: {e}")
        };
        tracing::warn!("Classifier {}", message);
        ClassificationError::Transient(message)
    }
}

/// Blocking classifier for use in synchronous contexts.
pub struct BlockingTasteClassifier {
    inner: TasteClassifier,
    runtime: tokio::runtime::Runtime,
}

impl BlockingTasteClassifier {
    /// Create a new blocking classifier.
    pub fn new(config: ClassifierConfig) -> Result<Self, ConfigError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ConfigError::Invalid(format!("Failed to create runtime: {e}")))?;

        Ok(Self {
            inner: TasteClassifier::new(config)?,
            runtime,
        })
    }

    /// Create a blocking classifier from environment configuration.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(ClassifierConfig::from_env()?)
    }

    /// Classify one reading, blocking until the answer or the timeout.
    pub fn classify(&self, values: &SensorValues) -> Result<Taste, ClassificationError> {
        self.runtime.block_on(self.inner.classify(values))
    }
}
