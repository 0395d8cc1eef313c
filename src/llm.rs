//! LLM client.
//!
//! Generates text from a prompt, abstracting over providers. Modeled as a
//! capability trait with concrete variants selected by dynamic dispatch
//! rather than reflection, grounded on
//! `docify`'s `LLMService` (`call_ollama`/`call_openai`/`call_anthropic`/
//! `call`) and on `oriongraph`'s HTTP-client shape (`http_generator.rs`).

use crate::config::RagConfig;
use crate::error::GenerationError;
use crate::types::LlmProvider;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

#[async_trait]
pub trait Llm: Send + Sync {
    /// `generate(prompt, max_tokens, temperature) -> text`.
    async fn generate(
        &self,
        provider: LlmProvider,
        model: Option<&str>,
        system: &str,
        prompt: &str,
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String, GenerationError>;
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    top_p: f32,
    num_predict: usize,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Deserialize)]
struct OpenAiChoiceMessage {
    content: String,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    temperature: f32,
    system: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: String,
}

pub struct HttpLlm {
    client: reqwest::Client,
    config: RagConfig,
}

impl HttpLlm {
    pub fn new(config: RagConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.llm_call_timeout())
            .build()
            .expect("reqwest client");
        Self { client, config }
    }

    async fn call_ollama(
        &self,
        model: &str,
        system: &str,
        prompt: &str,
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String, GenerationError> {
        let full_prompt = if system.is_empty() {
            prompt.to_string()
        } else {
            format!("{}\n\n{}", system, prompt)
        };

        let body = OllamaRequest {
            model,
            prompt: &full_prompt,
            stream: true,
            options: OllamaOptions {
                temperature,
                top_p: 0.9,
                num_predict: max_tokens,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.config.ollama_base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    GenerationError::Upstream(
                        "Ollama is not available. Start it with: ollama serve".into(),
                    )
                } else {
                    GenerationError::Upstream(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(GenerationError::Upstream(format!(
                "Ollama API error: {}",
                response.status()
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| GenerationError::Upstream(e.to_string()))?;

        let mut full_response = String::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(chunk) = serde_json::from_str::<OllamaChunk>(line) {
                full_response.push_str(&chunk.response);
                if chunk.done {
                    break;
                }
            }
        }

        Ok(full_response.trim().to_string())
    }

    async fn call_openai(
        &self,
        model: &str,
        system: &str,
        prompt: &str,
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String, GenerationError> {
        let api_key = self
            .config
            .openai_api_key
            .as_deref()
            .ok_or_else(|| GenerationError::ProviderNotConfigured("openai".into()))?;

        let body = OpenAiRequest {
            model,
            messages: vec![
                OpenAiMessage {
                    role: "system",
                    content: if system.is_empty() {
                        "You are a helpful research assistant."
                    } else {
                        system
                    },
                },
                OpenAiMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens,
            temperature,
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Upstream(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GenerationError::Upstream(format!(
                "OpenAI API error: {}",
                response.status()
            )));
        }

        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Upstream(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| GenerationError::Upstream("empty choices".into()))
    }

    async fn call_anthropic(
        &self,
        model: &str,
        system: &str,
        prompt: &str,
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String, GenerationError> {
        let api_key = self
            .config
            .anthropic_api_key
            .as_deref()
            .ok_or_else(|| GenerationError::ProviderNotConfigured("anthropic".into()))?;

        let body = AnthropicRequest {
            model,
            max_tokens,
            temperature,
            system,
            messages: vec![AnthropicMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Upstream(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GenerationError::Upstream(format!(
                "Anthropic API error: {}",
                response.status()
            )));
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Upstream(e.to_string()))?;

        parsed
            .content
            .into_iter()
            .next()
            .map(|b| b.text.trim().to_string())
            .ok_or_else(|| GenerationError::Upstream("empty content blocks".into()))
    }
}

#[async_trait]
impl Llm for HttpLlm {
    async fn generate(
        &self,
        provider: LlmProvider,
        model: Option<&str>,
        system: &str,
        prompt: &str,
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String, GenerationError> {
        let model = model.unwrap_or(&self.config.default_model);
        debug!(?provider, model, "dispatching generation call");

        let result = match provider {
            LlmProvider::Ollama => self.call_ollama(model, system, prompt, max_tokens, temperature).await,
            LlmProvider::Openai => self.call_openai(model, system, prompt, max_tokens, temperature).await,
            LlmProvider::Anthropic => {
                self.call_anthropic(model, system, prompt, max_tokens, temperature).await
            }
        };

        if let Err(ref e) = result {
            error!("LLM call failed: {e}");
        }
        result
    }
}

/// Deterministic stand-in for tests and the sample binary: echoes a
/// templated response that cites every available source, so pipeline tests
/// can exercise the verifier without a live model.
pub struct MockLlm;

#[async_trait]
impl Llm for MockLlm {
    async fn generate(
        &self,
        _provider: LlmProvider,
        _model: Option<&str>,
        _system: &str,
        prompt: &str,
        _max_tokens: usize,
        _temperature: f32,
    ) -> Result<String, GenerationError> {
        if prompt.to_lowercase().contains("consistent") || prompt.to_lowercase().contains("conflict") {
            return Ok("NO".to_string());
        }
        Ok("Based on the provided sources. [Source 1]".to_string())
    }
}

pub fn build_llm(config: &RagConfig) -> Box<dyn Llm> {
    Box::new(HttpLlm::new(config.clone()))
}
