//! Streaming chat-model providers.
//!
//! Concrete [`ModelProvider`] implementations over reqwest:
//! - **[`DisabledModel`]**: fails every call; used when `llm.provider = "disabled"`.
//! - **[`OpenAIChat`]**: `POST /v1/chat/completions` with `stream: true`.
//! - **[`AnthropicChat`]**: `POST /v1/messages` with `stream: true`.
//!
//! Both APIs answer with Server-Sent Events. [`sse_data`] turns the raw
//! byte stream into `data:` payloads, buffering across network chunks so
//! lines and UTF-8 sequences split between reads are reassembled. The
//! returned stream owns the response body; dropping it closes the
//! connection, which is how a cancelled turn stops generation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value;

use docchat_core::llm::{ModelProvider, TokenStream};
use docchat_core::models::Role;
use docchat_core::prompt::Prompt;

use crate::config::LlmConfig;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Split an SSE byte stream into `data:` payloads.
pub fn sse_data<S, B, E>(bytes: S) -> BoxStream<'static, Result<String>>
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    struct State<S> {
        bytes: std::pin::Pin<Box<S>>,
        buf: Vec<u8>,
        ready: VecDeque<String>,
        eof: bool,
    }

    let init = State {
        bytes: Box::pin(bytes),
        buf: Vec::new(),
        ready: VecDeque::new(),
        eof: false,
    };

    stream::unfold(init, |mut st| async move {
        loop {
            if let Some(data) = st.ready.pop_front() {
                return Some((Ok(data), st));
            }
            if st.eof {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    st.buf.extend_from_slice(chunk.as_ref());
                    drain_lines(&mut st.buf, &mut st.ready);
                }
                Some(Err(e)) => {
                    st.eof = true;
                    return Some((Err(e.into()), st));
                }
                None => {
                    st.eof = true;
                    st.buf.push(b'\n');
                    drain_lines(&mut st.buf, &mut st.ready);
                }
            }
        }
    })
    .boxed()
}

fn drain_lines(buf: &mut Vec<u8>, ready: &mut VecDeque<String>) {
    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buf.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line);
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(data) = line.strip_prefix("data:") {
            ready.push_back(data.trim_start().to_string());
        }
    }
}

async fn error_body(response: reqwest::Response, provider: &str) -> anyhow::Error {
    let status = response.status();
    let body_text = response.text().await.unwrap_or_default();
    anyhow!("{} API error {}: {}", provider, status, body_text)
}

// ============ Disabled ============

pub struct DisabledModel;

#[async_trait]
impl ModelProvider for DisabledModel {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &Prompt) -> Result<TokenStream> {
        bail!("LLM provider is disabled")
    }
}

// ============ OpenAI ============

/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIChat {
    model: String,
    temperature: f32,
    max_tokens: u32,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("llm.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| OPENAI_CHAT_URL.to_string()),
            api_key,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
        })
    }

    fn body(&self, prompt: &Prompt) -> Value {
        let messages: Vec<Value> = prompt
            .messages
            .iter()
            .map(|m| serde_json::json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": true,
        })
    }
}

/// Text delta from one OpenAI stream payload. `Ok(None)` for payloads
/// that carry no text (role announcements, finish markers).
fn openai_delta(data: &str) -> Result<Option<String>> {
    let json: Value = serde_json::from_str(data)?;
    if let Some(err) = json.get("error") {
        bail!("OpenAI stream error: {}", err);
    }
    Ok(json["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string))
}

#[async_trait]
impl ModelProvider for OpenAIChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &Prompt) -> Result<TokenStream> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&self.body(prompt))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_body(response, "OpenAI").await);
        }

        let tokens = sse_data(response.bytes_stream())
            .take_while(|item| {
                let done = matches!(item, Ok(data) if data == "[DONE]");
                futures::future::ready(!done)
            })
            .filter_map(|item| async move {
                match item {
                    Ok(data) => openai_delta(&data).transpose(),
                    Err(e) => Some(Err(e)),
                }
            });
        Ok(tokens.boxed())
    }
}

// ============ Anthropic ============

/// Requires the `ANTHROPIC_API_KEY` environment variable.
pub struct AnthropicChat {
    model: String,
    temperature: f32,
    max_tokens: u32,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("llm.model required for Anthropic provider"))?;
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| anyhow!("ANTHROPIC_API_KEY environment variable not set"))?;
        Ok(Self {
            model,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_MESSAGES_URL.to_string()),
            api_key,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
        })
    }

    fn body(&self, prompt: &Prompt) -> Value {
        // The system prompt is a top-level field and the conversation must
        // open with a user turn.
        let messages: Vec<Value> = prompt
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .skip_while(|m| m.role != Role::User)
            .map(|m| serde_json::json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        serde_json::json!({
            "model": self.model,
            "system": prompt.system().unwrap_or_default(),
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": true,
        })
    }
}

fn anthropic_delta(data: &str) -> Result<Option<String>> {
    let json: Value = serde_json::from_str(data)?;
    match json["type"].as_str() {
        Some("content_block_delta") => Ok(json["delta"]["text"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string)),
        Some("error") => bail!("Anthropic stream error: {}", json["error"]),
        _ => Ok(None),
    }
}

#[async_trait]
impl ModelProvider for AnthropicChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &Prompt) -> Result<TokenStream> {
        let response = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.body(prompt))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_body(response, "Anthropic").await);
        }

        let tokens = sse_data(response.bytes_stream()).filter_map(|item| async move {
            match item {
                Ok(data) => anthropic_delta(&data).transpose(),
                Err(e) => Some(Err(e)),
            }
        });
        Ok(tokens.boxed())
    }
}

/// Create the [`ModelProvider`] named by `llm.provider`.
pub fn create_model(config: &LlmConfig) -> Result<Arc<dyn ModelProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "openai" => Ok(Arc::new(OpenAIChat::new(config)?)),
        "anthropic" => Ok(Arc::new(AnthropicChat::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}
