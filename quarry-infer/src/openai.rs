use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{body_lines, transport_error, LlmEngine, LlmError, LlmRequest, LlmToken, TokenStream};

const BACKEND: &str = "LLM server";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChatChoiceDelta>,
}

#[derive(Deserialize)]
struct ChatChoiceDelta {
    delta: Delta,
}

#[derive(Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat endpoint (vLLM, llama.cpp server, ...), streamed as SSE.
pub struct OpenAiCompatEngine {
    client: reqwest::Client,
    base_url: String,
    model: String,
    seed: Option<u64>,
}

impl OpenAiCompatEngine {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        seed: Option<u64>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Other(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            seed,
        })
    }
}

/// Parse one SSE line. `None` for keep-alives, the `[DONE]` marker and empty deltas.
fn parse_sse_line(line: &str) -> Option<Result<String, String>> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    match serde_json::from_str::<ChatCompletionChunk>(payload) {
        Ok(chunk) => {
            let text: String = chunk
                .choices
                .into_iter()
                .filter_map(|c| c.delta.content)
                .collect();
            (!text.is_empty()).then_some(Ok(text))
        }
        Err(e) => Some(Err(e.to_string())),
    }
}

#[async_trait]
impl LlmEngine for OpenAiCompatEngine {
    async fn generate(&self, req: LlmRequest) -> Result<TokenStream, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &req.system,
                },
                ChatMessage {
                    role: "user",
                    content: &req.prompt,
                },
            ],
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            stream: true,
            seed: self.seed,
        };
        debug!(%url, model = %self.model, "chat completion");

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, &self.base_url, "Make sure the server is running.", e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(LlmError::ModelNotFound {
                model: self.model.clone(),
                hint: format!("Check that {url} serves this model."),
            });
        }
        if !status.is_success() {
            return Err(LlmError::Status {
                backend: BACKEND,
                status: status.as_u16(),
            });
        }

        let mut token_id: u32 = 0;
        let tokens = body_lines(resp.bytes_stream()).filter_map(move |line| {
            let item = match line {
                Ok(line) => parse_sse_line(&line).map(|parsed| {
                    parsed
                        .map(|text| {
                            token_id += 1;
                            LlmToken { token_id, text }
                        })
                        .map_err(|message| LlmError::Stream {
                            backend: BACKEND,
                            message,
                        })
                }),
                Err(e) if e.is_timeout() => Some(Err(LlmError::Timeout { backend: BACKEND })),
                Err(e) => Some(Err(LlmError::Stream {
                    backend: BACKEND,
                    message: e.to_string(),
                })),
            };
            futures_util::future::ready(item)
        });

        Ok(Box::pin(tokens))
    }
}
