//! Generative backend: conversation model and Gemini client.
//!
//! The relay talks to the backend through the [`Backend`] trait so the
//! pipeline can be exercised without network access. [`GeminiClient`]
//! implements it against the `v1beta` REST API, with an SSE pull stream
//! for incremental output.

use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::GeminiConfig;

/// Role of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One piece of a turn's content. A closed set so the request builder can
/// match exhaustively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    Image { mime: String, data: String },
    Audio { mime: String, data: String },
}

/// One role-tagged contribution in a backend request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl ConversationTurn {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![ContentPart::Text(text.into())],
        }
    }
}

/// Backend call failures, caught at the turn boundary and rendered into
/// the placeholder message.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request to backend failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("backend response could not be parsed: {0}")]
    Parse(String),
}

/// Incremental output pulled one chunk at a time. `Ok(None)` marks the end
/// of the stream.
#[async_trait]
pub trait TextStream: Send {
    async fn next_chunk(&mut self) -> Result<Option<String>, BackendError>;
}

/// The generative backend as the relay sees it: one ordered message list
/// in, text out, either whole or as a stream of increments.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Single-shot generation. `Ok(None)` means the backend produced no
    /// text, which the renderer surfaces as a notice rather than an error.
    async fn generate(&self, turns: &[ConversationTurn]) -> Result<Option<String>, BackendError>;

    /// Streaming generation.
    async fn stream(&self, turns: &[ConversationTurn])
        -> Result<Box<dyn TextStream>, BackendError>;
}

// Wire types for the Gemini REST API.

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
enum Part {
    #[serde(rename = "text")]
    Text(String),
    #[serde(rename = "inlineData")]
    InlineData {
        #[serde(rename = "mimeType")]
        mime_type: String,
        data: String,
    },
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

fn to_wire_part(part: &ContentPart) -> Part {
    match part {
        ContentPart::Text(text) => Part::Text(text.clone()),
        ContentPart::Image { mime, data } | ContentPart::Audio { mime, data } => Part::InlineData {
            mime_type: mime.clone(),
            data: data.clone(),
        },
    }
}

/// Split system turns out into a `systemInstruction` and map the rest onto
/// Gemini's `user`/`model` roles. Multiple system turns are concatenated.
fn build_request(turns: &[ConversationTurn], config: &GeminiConfig) -> GenerateRequest {
    let mut system_parts: Vec<Part> = Vec::new();
    let mut contents: Vec<Content> = Vec::new();

    for turn in turns {
        match turn.role {
            Role::System => {
                system_parts.extend(turn.parts.iter().map(to_wire_part));
            }
            Role::User | Role::Assistant => {
                let role = if turn.role == Role::User {
                    "user"
                } else {
                    "model"
                };
                contents.push(Content {
                    role: Some(role),
                    parts: turn.parts.iter().map(to_wire_part).collect(),
                });
            }
        }
    }

    GenerateRequest {
        contents,
        system_instruction: (!system_parts.is_empty()).then_some(Content {
            role: None,
            parts: system_parts,
        }),
        generation_config: GenerationConfig {
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
        },
    }
}

fn candidate_text(response: GenerateResponse) -> Option<String> {
    let text: String = response
        .candidates
        .into_iter()
        .next()?
        .content?
        .parts
        .into_iter()
        .filter_map(|p| p.text)
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Gemini API client.
pub struct GeminiClient {
    client: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn post(
        &self,
        method: &str,
        query: &str,
        body: &GenerateRequest,
    ) -> Result<reqwest::Response, BackendError> {
        let url = format!(
            "{}/models/{}:{}{}",
            self.config.base_url, self.config.model, method, query
        );
        debug!("Sending request to Gemini: {}", url);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Gemini API error ({}): {}", status, body);
            return Err(BackendError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Backend for GeminiClient {
    async fn generate(&self, turns: &[ConversationTurn]) -> Result<Option<String>, BackendError> {
        let request = build_request(turns, &self.config);
        let response = self.post("generateContent", "", &request).await?;
        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))?;
        Ok(candidate_text(parsed))
    }

    async fn stream(
        &self,
        turns: &[ConversationTurn],
    ) -> Result<Box<dyn TextStream>, BackendError> {
        let request = build_request(turns, &self.config);
        let response = self
            .post("streamGenerateContent", "?alt=sse", &request)
            .await?;
        Ok(Box::new(SseTextStream {
            bytes: Box::pin(response.bytes_stream()),
            buf: String::new(),
            pending: VecDeque::new(),
            done: false,
        }))
    }
}

/// Pull loop over Gemini's SSE stream. Each `data:` event carries candidate
/// parts whose text fields are yielded in order; a terminal `finishReason`
/// ends the stream.
struct SseTextStream {
    bytes: Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
    buf: String,
    pending: VecDeque<String>,
    done: bool,
}

#[async_trait]
impl TextStream for SseTextStream {
    async fn next_chunk(&mut self) -> Result<Option<String>, BackendError> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Ok(Some(chunk));
            }
            if self.done {
                return Ok(None);
            }
            match self.bytes.next().await {
                Some(Ok(bytes)) => {
                    self.buf.push_str(&String::from_utf8_lossy(&bytes));
                    // Complete SSE events are terminated by a blank line.
                    while let Some(pos) = self.buf.find("\n\n") {
                        let block = self.buf[..pos].to_string();
                        self.buf.drain(..pos + 2);
                        let (deltas, finished) = parse_sse_block(&block);
                        self.pending.extend(deltas);
                        if finished {
                            self.done = true;
                        }
                    }
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Err(BackendError::Http(e));
                }
                None => {
                    self.done = true;
                    // Flush a final event not terminated by a blank line.
                    if !self.buf.is_empty() {
                        let tail = std::mem::take(&mut self.buf);
                        let (deltas, _) = parse_sse_block(&tail);
                        self.pending.extend(deltas);
                    }
                }
            }
        }
    }
}

/// Extract text deltas and the finish marker from one SSE event block.
fn parse_sse_block(block: &str) -> (Vec<String>, bool) {
    let mut deltas = Vec::new();
    let mut finished = false;
    for line in block.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        let Ok(event) = serde_json::from_str::<GenerateResponse>(data) else {
            continue;
        };
        for candidate in event.candidates {
            if candidate.finish_reason.is_some() {
                finished = true;
            }
            if let Some(content) = candidate.content {
                for part in content.parts {
                    if let Some(text) = part.text {
                        if !text.is_empty() {
                            deltas.push(text);
                        }
                    }
                }
            }
        }
    }
    (deltas, finished)
}
