//! Chat agent: forwards the user turn to an Ollama server and replies with
//! the full assistant message.
//!
//! The model streams NDJSON chunks; they are accumulated and published as
//! one `{"assistant_response": ...}` message.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Transform;
use crate::error::TransformError;
use crate::message::Payload;
use crate::schema::{ChatRequest, ChatResponse, ChatTurn};

pub const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";
pub const DEFAULT_CHAT_MODEL: &str = "deepseek-r1:70b";

pub struct ChatTransform {
    client: reqwest::Client,
    host: String,
    model: String,
}

impl ChatTransform {
    pub fn new(host: impl Into<String>, model: impl Into<String>) -> Self {
        let host = host.into();
        let host = if host.starts_with("http://") || host.starts_with("https://") {
            host
        } else {
            format!("http://{}", host)
        };
        Self {
            client: reqwest::Client::new(),
            host: host.trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }

    /// Read `OLLAMA_HOST` and `AGENTMESH_CHAT_MODEL`, falling back to the
    /// local defaults.
    pub fn from_env() -> Self {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| DEFAULT_OLLAMA_HOST.to_string());
        let model =
            std::env::var("AGENTMESH_CHAT_MODEL").unwrap_or_else(|_| DEFAULT_CHAT_MODEL.to_string());
        Self::new(host, model)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String, TransformError> {
        let mut messages = request.history.clone();
        messages.push(ChatTurn {
            role: "user".to_string(),
            content: request.user_input.clone(),
        });
        let body = OllamaChatRequest {
            model: &self.model,
            messages: &messages,
            stream: true,
        };

        let url = format!("{}/api/chat", self.host);
        tracing::debug!("[Worker:chat] POST {} (model={}, turns={})", url, self.model, messages.len());

        let mut response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransformError::failed(format!("model request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransformError::failed(format!(
                "model server returned {}: {}",
                status,
                text.trim()
            )));
        }

        let mut acc = StreamAccumulator::default();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| TransformError::failed(format!("model stream broke: {}", e)))?
        {
            if acc.push(&chunk)? {
                break;
            }
        }
        acc.finish()
    }
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

/// Joins a newline-delimited JSON stream of chat chunks into one reply.
/// Chunks may be split across network reads at arbitrary byte offsets.
#[derive(Default)]
pub(crate) struct StreamAccumulator {
    pending: Vec<u8>,
    text: String,
    done: bool,
}

impl StreamAccumulator {
    /// Feed raw bytes. Returns `true` once the final chunk has been seen.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Result<bool, TransformError> {
        self.pending.extend_from_slice(bytes);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.line(&line)?;
        }
        Ok(self.done)
    }

    fn line(&mut self, line: &[u8]) -> Result<(), TransformError> {
        let trimmed = String::from_utf8_lossy(line);
        let trimmed = trimmed.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        let chunk: OllamaChunk = serde_json::from_str(trimmed)
            .map_err(|e| TransformError::failed(format!("bad model chunk: {}", e)))?;
        if let Some(error) = chunk.error {
            return Err(TransformError::failed(error));
        }
        if let Some(message) = chunk.message {
            self.text.push_str(&message.content);
        }
        if chunk.done {
            self.done = true;
        }
        Ok(())
    }

    pub(crate) fn finish(mut self) -> Result<String, TransformError> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.line(&rest)?;
        }
        if self.text.trim().is_empty() {
            return Err(TransformError::failed("model returned an empty response"));
        }
        Ok(self.text)
    }
}

#[async_trait]
impl Transform for ChatTransform {
    fn name(&self) -> &str {
        "chat"
    }

    async fn apply(&self, payload: Payload) -> Result<Value, TransformError> {
        let Payload::Json(map) = payload else {
            return Err(TransformError::invalid("chat expects a JSON payload"));
        };
        let request: ChatRequest = serde_json::from_value(Value::Object(map))?;
        let text = self.complete(&request).await?;
        serde_json::to_value(ChatResponse {
            assistant_response: text,
        })
        .map_err(|e| TransformError::failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accumulator_joins_split_chunks() {
        let mut acc = StreamAccumulator::default();
        let stream = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"lo\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n",
        )
        .as_bytes();
        let (a, b) = stream.split_at(23);
        assert!(!acc.push(a).unwrap());
        assert!(acc.push(b).unwrap());
        assert_eq!(acc.finish().unwrap(), "Hello");
    }

    #[test]
    fn test_accumulator_surfaces_server_error() {
        let mut acc = StreamAccumulator::default();
        let err = acc.push(b"{\"error\":\"model not found\"}\n").unwrap_err();
        assert_eq!(err, TransformError::Failed("model not found".to_string()));
    }

    #[test]
    fn test_host_without_scheme_gets_http() {
        let chat = ChatTransform::new("gpu-box:11434/", "llama3.2");
        assert_eq!(chat.host, "http://gpu-box:11434");
        assert_eq!(chat.model(), "llama3.2");
    }

    #[tokio::test]
    async fn test_missing_user_input_is_invalid() {
        let chat = ChatTransform::new(DEFAULT_OLLAMA_HOST, DEFAULT_CHAT_MODEL);
        let map = json!({"prompt": "hi"}).as_object().cloned().unwrap();
        let err = chat.apply(Payload::Json(map)).await.unwrap_err();
        assert!(matches!(err, TransformError::InvalidInput(_)));
    }
}
