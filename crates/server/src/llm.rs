//! Text generation over the OpenAI-compatible chat completions API.
//!
//! Both supported providers speak this protocol; Ollama serves it under
//! `/v1`. Streaming responses arrive as server-sent events whose `data:`
//! lines carry one completion chunk each, terminated by `[DONE]`.

use std::fmt::Display;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use dataagent_agent::{TextGenerator, TextStream};
use dataagent_core::config::{LlmConfig, LlmProvider};
use dataagent_core::BackoffPolicy;
use futures::stream::{self, Stream, StreamExt};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const MAX_RETRY_DELAY_MS: u64 = 60_000;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiCompatibleGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    temperature: f32,
    backoff: BackoffPolicy,
}

impl OpenAiCompatibleGenerator {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let base_url = match (&config.base_url, config.provider) {
            (Some(url), _) => url.clone(),
            (None, LlmProvider::OpenAi) => OPENAI_BASE_URL.to_string(),
            (None, LlmProvider::Ollama) => {
                return Err(anyhow!("llm.base_url is required for the ollama provider"));
            }
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build llm http client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            backoff: BackoffPolicy::new(
                config.max_retries.saturating_add(1),
                config.retry_initial_delay_ms,
            )
            .with_max_delay_ms(MAX_RETRY_DELAY_MS),
        })
    }

    /// Posts a chat request, retrying rate limits and gateway failures.
    async fn send(&self, request: &ChatRequest<'_>) -> Result<reqwest::Response> {
        let mut attempt = 0_u32;
        loop {
            let mut builder = self.client.post(&self.endpoint).json(request);
            if let Some(api_key) = &self.api_key {
                builder = builder.bearer_auth(api_key.expose_secret());
            }

            let response = builder.send().await.context("llm request failed")?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            attempt += 1;
            if !is_retryable(status) || !self.backoff.allows_retry(attempt) {
                let body = response.text().await.unwrap_or_default();
                return Err(anyhow!("llm request failed with status {status}: {body}"));
            }

            let delay = self.backoff.delay_for(attempt - 1);
            warn!(
                event_name = "llm.request.retry",
                status = status.as_u16(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "llm endpoint busy, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn messages<'a>(system: Option<&'a str>, user: &'a str) -> Vec<ChatMessage<'a>> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system.filter(|system| !system.trim().is_empty()) {
            messages.push(ChatMessage { role: "system", content: system });
        }
        messages.push(ChatMessage { role: "user", content: user });
        messages
    }
}

#[async_trait]
impl TextGenerator for OpenAiCompatibleGenerator {
    async fn generate_stream(&self, system: Option<&str>, user: &str) -> Result<TextStream> {
        let request = ChatRequest {
            model: &self.model,
            messages: Self::messages(system, user),
            temperature: self.temperature,
            stream: true,
        };
        debug!(event_name = "llm.stream.start", model = %self.model, "streaming completion");
        let response = self.send(&request).await?;
        Ok(Box::pin(parse_sse_stream(Box::pin(response.bytes_stream()))))
    }

    async fn complete(&self, prompt: &str, temperature: f32) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: Self::messages(None, prompt),
            temperature,
            stream: false,
        };
        let completion: ChatCompletion = self
            .send(&request)
            .await?
            .json()
            .await
            .context("failed to decode llm completion")?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("llm completion had no content"))
    }
}

fn is_retryable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Turns a server-sent-event byte stream into content fragments.
pub fn parse_sse_stream<S, B, E>(bytes: S) -> impl Stream<Item = Result<String>> + Send + 'static
where
    S: Stream<Item = std::result::Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    stream::unfold((bytes, String::new(), false), |(mut bytes, mut buffer, done)| async move {
        if done {
            return None;
        }
        loop {
            if let Some(end) = buffer.find("\n\n") {
                let event = buffer[..end].to_string();
                buffer.drain(..end + 2);
                match parse_sse_event(&event) {
                    Ok(SseItem::Content(text)) => return Some((Ok(text), (bytes, buffer, false))),
                    Ok(SseItem::Skip) => continue,
                    Ok(SseItem::Done) => return None,
                    Err(error) => return Some((Err(error), (bytes, buffer, true))),
                }
            }

            match bytes.next().await {
                Some(Ok(chunk)) => {
                    buffer.push_str(&String::from_utf8_lossy(chunk.as_ref()).replace("\r\n", "\n"));
                }
                Some(Err(error)) => {
                    return Some((Err(anyhow!("llm stream read failed: {error}")), (bytes, buffer, true)));
                }
                None => {
                    let rest = std::mem::take(&mut buffer);
                    return match parse_sse_event(rest.trim()) {
                        Ok(SseItem::Content(text)) => Some((Ok(text), (bytes, buffer, true))),
                        Ok(_) => None,
                        Err(error) => Some((Err(error), (bytes, buffer, true))),
                    };
                }
            }
        }
    })
}

#[derive(Debug, PartialEq, Eq)]
enum SseItem {
    Content(String),
    Skip,
    Done,
}

fn parse_sse_event(event: &str) -> Result<SseItem> {
    let mut data = String::new();
    for line in event.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            let value = value.trim();
            if value == "[DONE]" {
                return Ok(SseItem::Done);
            }
            data.push_str(value);
        }
    }
    if data.is_empty() {
        return Ok(SseItem::Skip);
    }

    let chunk: ChatCompletionChunk = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse llm stream chunk: {data}"))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
        .map_or(SseItem::Skip, SseItem::Content))
}
