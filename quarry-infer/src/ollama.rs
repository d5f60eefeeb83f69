use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{body_lines, transport_error, LlmEngine, LlmError, LlmRequest, LlmToken, TokenStream};

const BACKEND: &str = "Ollama";

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

/// One NDJSON line of a streamed `/api/generate` response.
#[derive(Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
}

/// Local model served by Ollama (`/api/generate`, streamed NDJSON).
pub struct OllamaEngine {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaEngine {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Other(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl LlmEngine for OllamaEngine {
    async fn generate(&self, req: LlmRequest) -> Result<TokenStream, LlmError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            system: &req.system,
            prompt: &req.prompt,
            stream: true,
            options: GenerateOptions {
                temperature: req.temperature,
                num_predict: req.max_tokens,
            },
        };
        debug!(%url, model = %self.model, "ollama generate");

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(BACKEND, &self.base_url, "Make sure Ollama is running: `ollama serve`", e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(LlmError::ModelNotFound {
                model: self.model.clone(),
                hint: format!("Pull it first: `ollama pull {}`", self.model),
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
                Ok(line) => match serde_json::from_str::<GenerateChunk>(&line) {
                    Ok(GenerateChunk { error: Some(message), .. }) => Some(Err(LlmError::Stream {
                        backend: BACKEND,
                        message,
                    })),
                    Ok(chunk) if chunk.response.is_empty() => None,
                    Ok(chunk) => {
                        token_id += 1;
                        Some(Ok(LlmToken {
                            token_id,
                            text: chunk.response,
                        }))
                    }
                    Err(e) => Some(Err(LlmError::Stream {
                        backend: BACKEND,
                        message: e.to_string(),
                    })),
                },
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
