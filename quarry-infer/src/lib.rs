use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::{stream, StreamExt};
use thiserror::Error;

pub mod generator;
pub mod ollama;
pub mod openai;

pub use generator::{Generation, GenerationError, LlmSqlGenerator, SqlGenerator};
pub use ollama::OllamaEngine;
pub use openai::OpenAiCompatEngine;

#[derive(Clone, Debug)]
pub struct LlmToken {
    pub token_id: u32,
    pub text: String,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<LlmToken, LlmError>> + Send>>;

/// A single completion request.
#[derive(Clone, Debug)]
pub struct LlmRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Failure talking to a model backend. `Display` is phrased for the end user.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Cannot connect to {backend} at {base_url}. {hint}")]
    Unavailable {
        backend: &'static str,
        base_url: String,
        hint: String,
    },
    #[error("{backend} request timed out. The model may still be loading, try again.")]
    Timeout { backend: &'static str },
    #[error("Model '{model}' not found. {hint}")]
    ModelNotFound { model: String, hint: String },
    #[error("{backend} HTTP error: {status}")]
    Status { backend: &'static str, status: u16 },
    #[error("{backend} stream error: {message}")]
    Stream {
        backend: &'static str,
        message: String,
    },
    #[error("AI error: {0}")]
    Other(String),
}

#[async_trait]
pub trait LlmEngine: Send + Sync {
    async fn generate(&self, req: LlmRequest) -> Result<TokenStream, LlmError>;
}

/// Engine that answers every request with the same text. Used for offline runs and tests.
pub struct StaticLlmEngine {
    text: String,
}

impl StaticLlmEngine {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl LlmEngine for StaticLlmEngine {
    async fn generate(&self, _req: LlmRequest) -> Result<TokenStream, LlmError> {
        let token = LlmToken {
            token_id: 0,
            text: self.text.clone(),
        };
        Ok(Box::pin(stream::iter(vec![Ok(token)])))
    }
}

/// Map a transport failure from `reqwest` onto the user-facing taxonomy.
pub(crate) fn transport_error(backend: &'static str, base_url: &str, hint: &str, e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout { backend }
    } else if e.is_connect() {
        LlmError::Unavailable {
            backend,
            base_url: base_url.to_string(),
            hint: hint.to_string(),
        }
    } else {
        LlmError::Other(e.to_string())
    }
}

/// Re-chunk a byte stream into trimmed, non-empty text lines.
///
/// Network chunks do not respect line boundaries, so partial lines are carried over to the
/// next chunk and flushed when the body ends.
pub(crate) fn body_lines<S, B, E>(body: S) -> impl Stream<Item = Result<String, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    let mut pending: Vec<u8> = Vec::new();
    body.map(Some)
        .chain(stream::once(async { None }))
        .map(move |chunk| {
            let mut lines = Vec::new();
            match chunk {
                Some(Ok(bytes)) => {
                    pending.extend_from_slice(bytes.as_ref());
                    while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = pending.drain(..=pos).collect();
                        push_line(&mut lines, &line);
                    }
                }
                Some(Err(e)) => lines.push(Err(e)),
                None => {
                    let rest = std::mem::take(&mut pending);
                    push_line(&mut lines, &rest);
                }
            }
            stream::iter(lines)
        })
        .flatten()
}

fn push_line<E>(out: &mut Vec<Result<String, E>>, raw: &[u8]) {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if !text.is_empty() {
        out.push(Ok(text.to_string()));
    }
}
