use crate::SearchError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[async_trait]
pub trait Generator: Send + Sync {
    fn model_id(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String, SearchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationProvider {
    #[default]
    Ollama,
    OpenAi,
}

impl FromStr for GenerationProvider {
    type Err = SearchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAi),
            other => Err(SearchError::InvalidInput(format!(
                "unknown llm provider `{other}` (expected ollama or openai)"
            ))),
        }
    }
}

impl fmt::Display for GenerationProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
        })
    }
}

/// Which local model the assistant binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelProfile {
    #[default]
    General,
    Math,
}

impl FromStr for ModelProfile {
    type Err = SearchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "general" => Ok(Self::General),
            "math" => Ok(Self::Math),
            other => Err(SearchError::InvalidInput(format!(
                "unknown model profile `{other}` (expected general or math)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub provider: GenerationProvider,
    pub ollama_base_url: String,
    pub ollama_model: String,
    pub ollama_math_model: String,
    pub openai_base_url: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub temperature: f32,
    pub local_max_tokens: u32,
    pub hosted_max_tokens: u32,
    pub keep_alive: String,
    pub timeout: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: GenerationProvider::Ollama,
            ollama_base_url: "http://localhost:11434".to_string(),
            ollama_model: "llama3.1:8b".to_string(),
            ollama_math_model: "qwen-4b-math".to_string(),
            openai_base_url: "https://api.openai.com".to_string(),
            openai_api_key: None,
            openai_model: "gpt-4o-mini".to_string(),
            temperature: 0.1,
            local_max_tokens: 256,
            hosted_max_tokens: 1024,
            keep_alive: "5m".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl GenerationConfig {
    pub fn ollama_model_for(&self, profile: ModelProfile) -> &str {
        match profile {
            ModelProfile::General => &self.ollama_model,
            ModelProfile::Math => &self.ollama_math_model,
        }
    }
}

pub fn construct_generator(
    config: &GenerationConfig,
    profile: ModelProfile,
) -> Result<Arc<dyn Generator>, SearchError> {
    let generator: Arc<dyn Generator> = match config.provider {
        GenerationProvider::Ollama => Arc::new(OllamaGenerator::new(
            &config.ollama_base_url,
            config.ollama_model_for(profile),
            config,
        )?),
        GenerationProvider::OpenAi => Arc::new(OpenAiGenerator::new(config)?),
    };

    info!(provider = %config.provider, model = generator.model_id(), "generator ready");
    Ok(generator)
}

fn response_error(backend: &str, details: impl Into<String>) -> SearchError {
    SearchError::BackendResponse {
        backend: backend.to_string(),
        details: details.into(),
    }
}

/// `POST /api/generate` with streaming disabled.
pub struct OllamaGenerator {
    client: Client,
    base_url: String,
    model: String,
    temperature: f32,
    num_predict: u32,
    keep_alive: String,
}

impl OllamaGenerator {
    pub fn new(
        base_url: &str,
        model: &str,
        config: &GenerationConfig,
    ) -> Result<Self, SearchError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        url::Url::parse(&base_url)
            .map_err(|error| SearchError::unavailable("ollama", error.to_string()))?;

        Ok(Self {
            client: Client::builder().timeout(config.timeout).build()?,
            base_url,
            model: model.to_string(),
            temperature: config.temperature,
            num_predict: config.local_max_tokens,
            keep_alive: config.keep_alive.clone(),
        })
    }

    fn request_body(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "keep_alive": self.keep_alive,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.num_predict,
            },
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String, SearchError> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(|error| SearchError::unavailable("ollama", error.to_string()))?;

        if !response.status().is_success() {
            return Err(response_error("ollama", response.status().to_string()));
        }

        let body: Value = response.json().await?;
        body.get("response")
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string())
            .ok_or_else(|| response_error("ollama", "missing `response` field"))
    }
}

/// Chat completions with a single user message.
pub struct OpenAiGenerator {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self, SearchError> {
        let api_key = config
            .openai_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| SearchError::unavailable("openai", "OPENAI_API_KEY is not set"))?;

        Ok(Self {
            client: Client::builder().timeout(config.timeout).build()?,
            base_url: config.openai_base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: config.openai_model.clone(),
            temperature: config.temperature,
            max_tokens: config.hosted_max_tokens,
        })
    }
}

fn first_choice(body: &Value) -> Result<String, SearchError> {
    body.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(|text| text.trim().to_string())
        .ok_or_else(|| response_error("openai", "missing choices[0].message.content"))
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String, SearchError> {
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "temperature": self.temperature,
                "max_tokens": self.max_tokens,
                "messages": [{ "role": "user", "content": prompt }],
            }))
            .send()
            .await
            .map_err(|error| SearchError::unavailable("openai", error.to_string()))?;

        if !response.status().is_success() {
            return Err(response_error("openai", response.status().to_string()));
        }

        let body: Value = response.json().await?;
        first_choice(&body)
    }
}
