use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use aisle_core::config::LlmConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

/// A function the model may call, described by a JSON schema.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    fn to_wire(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("llm transport failure: {0}")]
    Transport(String),
    #[error("llm returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm response could not be decoded: {0}")]
    Decode(String),
    #[error("llm response did not contain a tool call")]
    MissingToolCall,
}

pub type FragmentStream = BoxStream<'static, Result<String, LlmError>>;

/// Language-model seam. Every call is a single attempt; callers own timeouts.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Deterministic (temperature 0) non-streaming completion.
    async fn complete(&self, messages: &[ChatMessage], max_tokens: u32)
        -> Result<String, LlmError>;

    /// Offers `tools` to the model and returns the first call it made.
    async fn call_tool(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ToolCall, LlmError>;

    /// Lazily streamed answer fragments.
    async fn stream(&self, messages: &[ChatMessage]) -> Result<FragmentStream, LlmError>;
}

/// Client for any `/chat/completions` endpoint speaking the OpenAI wire format.
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    max_tokens: u32,
    api_key: Option<SecretString>,
}

impl OpenAiCompatibleClient {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|error| LlmError::Transport(error.to_string()))?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            api_key: config.api_key.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response, LlmError> {
        let mut request = self.http.post(&self.endpoint).json(payload);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response =
            request.send().await.map_err(|error| LlmError::Transport(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status: status.as_u16(), body });
        }
        Ok(response)
    }

    async fn post_json(&self, payload: &Value) -> Result<Value, LlmError> {
        self.post(payload)
            .await?
            .json::<Value>()
            .await
            .map_err(|error| LlmError::Decode(error.to_string()))
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        let payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.0,
            "max_tokens": max_tokens.min(self.max_tokens),
            "stream": false,
        });
        let body = self.post_json(&payload).await?;
        extract_message_content(&body)
    }

    async fn call_tool(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
    ) -> Result<ToolCall, LlmError> {
        let payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.0,
            "max_tokens": self.max_tokens,
            "tools": tools.iter().map(ToolSpec::to_wire).collect::<Vec<_>>(),
            "tool_choice": "auto",
            "stream": false,
        });
        let body = self.post_json(&payload).await?;
        extract_tool_call(&body)
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<FragmentStream, LlmError> {
        let payload = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "stream": true,
        });
        let response = self.post(&payload).await?;
        let body = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|error| LlmError::Transport(error.to_string()))
            })
            .boxed();
        Ok(fragments_from_sse(body))
    }
}

fn first_choice(body: &Value) -> Option<&Value> {
    body.get("choices").and_then(Value::as_array).and_then(|choices| choices.first())
}

pub(crate) fn extract_message_content(body: &Value) -> Result<String, LlmError> {
    first_choice(body)
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| LlmError::Decode("missing choices[0].message.content".to_string()))
}

pub(crate) fn extract_tool_call(body: &Value) -> Result<ToolCall, LlmError> {
    let function = first_choice(body)
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("tool_calls"))
        .and_then(Value::as_array)
        .and_then(|calls| calls.first())
        .and_then(|call| call.get("function"))
        .ok_or(LlmError::MissingToolCall)?;

    let name = function
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| LlmError::Decode("tool call without a function name".to_string()))?
        .to_string();

    let arguments = match function.get("arguments") {
        Some(Value::String(raw)) if raw.trim().is_empty() => json!({}),
        Some(Value::String(raw)) => serde_json::from_str(raw)
            .map_err(|error| LlmError::Decode(format!("tool arguments for `{name}`: {error}")))?,
        Some(Value::Object(map)) => Value::Object(map.clone()),
        _ => json!({}),
    };

    Ok(ToolCall { name, arguments })
}

#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Fragment(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine, LlmError> {
    let trimmed = line.trim();
    if !trimmed.starts_with("data:") {
        return Ok(SseLine::Skip);
    }
    let chunk = trimmed.trim_start_matches("data:").trim();
    if chunk == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let value: Value = serde_json::from_str(chunk)
        .map_err(|error| LlmError::Decode(format!("stream chunk: {error}")))?;
    let content = first_choice(&value)
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(Value::as_str)
        .filter(|content| !content.is_empty());

    Ok(match content {
        Some(content) => SseLine::Fragment(content.to_string()),
        None => SseLine::Skip,
    })
}

struct SseState {
    body: BoxStream<'static, Result<Vec<u8>, LlmError>>,
    buffer: Vec<u8>,
    body_finished: bool,
    finished: bool,
}

impl SseState {
    fn next_line(&mut self) -> Option<String> {
        let newline = self.buffer.iter().position(|byte| *byte == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=newline).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

/// Turns a raw server-sent-events body into content fragments, ending at `[DONE]`.
pub fn fragments_from_sse(body: BoxStream<'static, Result<Vec<u8>, LlmError>>) -> FragmentStream {
    let state = SseState { body, buffer: Vec::new(), body_finished: false, finished: false };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            if let Some(line) = state.next_line() {
                match parse_sse_line(&line) {
                    Ok(SseLine::Fragment(text)) => return Some((Ok(text), state)),
                    Ok(SseLine::Done) => return None,
                    Ok(SseLine::Skip) => continue,
                    Err(error) => {
                        state.finished = true;
                        return Some((Err(error), state));
                    }
                }
            }

            if state.body_finished {
                return None;
            }

            match state.body.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                Some(Err(error)) => {
                    state.finished = true;
                    return Some((Err(error), state));
                }
                None => {
                    state.body_finished = true;
                    if !state.buffer.is_empty() {
                        state.buffer.push(b'\n');
                    }
                }
            }
        }
    })
    .boxed()
}
